//! Public interface to the Bayou core library, linked by the server
//! executable, the client executable, and external tests.

#![allow(clippy::uninlined_format_args)]

#[macro_use]
pub mod utils;

mod client;
mod server;

pub use crate::client::{BayouClient, ClientApiStub, ClientId, Room};
pub use crate::server::{
    AcceptStamp, ApiReply, ApiRequest, BayouReplica, ColValue, Csn, LogEntry,
    LogicalTime, MemStore, ReplicaConfigBayou, ReplicaId, Row, StateStore,
    VectorClock, FALSE_QUERY, TRUE_QUERY, UNCOMMITTED,
};
pub use crate::utils::BayouError;
