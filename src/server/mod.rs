//! Bayou server replica functionality modules.

mod clock;
mod external;
mod logent;
mod replica;
mod statestore;
mod storage;
mod transport;

pub use clock::{LogicalTime, VectorClock};
pub use external::{ApiReply, ApiRequest, RequestId};
pub use logent::{AcceptStamp, Csn, LogEntry, UNCOMMITTED};
pub use replica::{BayouReplica, ReplicaConfigBayou};
pub use statestore::{
    ColValue, MemStore, Row, StateStore, FALSE_QUERY, TRUE_QUERY,
};

pub(crate) use external::ExternalApi;
pub(crate) use storage::{LogAction, LogActionId, LogResult, StorageHub};
pub(crate) use transport::TransportHub;

/// Server replica ID type.
pub type ReplicaId = u8;
