//! Bayou server replica module.
//!
//! Owns the dual-log structure (committed + tentative) with its parallel
//! undo log, the two materialized state stores, and the version vector. All
//! state-mutating paths — client write acceptance, incoming anti-entropy
//! batches, primary commit passes, and rollback/reapply — run to completion
//! inside one arm of the replica's single event loop, which serializes them
//! against each other.

mod antientropy;
mod commitment;
mod execution;
mod messages;
mod recovery;
mod request;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

use crate::server::{
    AcceptStamp, ApiReply, ApiRequest, Csn, ExternalApi, LogAction,
    LogActionId, LogEntry, LogResult, MemStore, ReplicaId, StateStore,
    StorageHub, TransportHub, VectorClock,
};
use crate::utils::{BayouError, Timer};

use get_size::GetSize;

use serde::{Deserialize, Serialize};

use tokio::sync::watch;

/// Configuration parameters struct. Fields omitted from the TOML config
/// string keep their default values; unknown field names are rejected.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReplicaConfigBayou {
    /// Path to the write-ahead log backing file.
    pub backer_path: String,

    /// Path to the committed store snapshot file.
    pub commit_db_path: String,

    /// Path to the full store snapshot file.
    pub full_db_path: String,

    /// Anti-entropy interval lower bound in millisecs.
    pub ae_interval_min_ms: u64,

    /// Anti-entropy interval upper bound (exclusive) in millisecs.
    pub ae_interval_max_ms: u64,

    /// Timeout of one outbound anti-entropy round in millisecs.
    pub rpc_timeout_ms: u64,

    /// Whether to call `fsync()`/`fdatasync()` on every WAL append.
    pub logger_sync: bool,
}

#[allow(clippy::derivable_impls)]
impl Default for ReplicaConfigBayou {
    fn default() -> Self {
        ReplicaConfigBayou {
            backer_path: "/tmp/bayou.wal".into(),
            commit_db_path: "/tmp/bayou.commit.db".into(),
            full_db_path: "/tmp/bayou.full.db".into(),
            ae_interval_min_ms: 100,
            ae_interval_max_ms: 300,
            rpc_timeout_ms: 1000,
            logger_sync: true,
        }
    }
}

impl ReplicaConfigBayou {
    /// Composes the configuration from its default values, overlaid with
    /// whatever fields the given TOML string provides.
    pub fn parsed_from(
        config_str: Option<&str>,
    ) -> Result<Self, BayouError> {
        match config_str {
            Some(s) => Ok(toml::from_str(s)?),
            None => Ok(Default::default()),
        }
    }
}

/// Peer-peer anti-entropy message type.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, GetSize)]
pub(crate) enum PeerMsg {
    /// Round initiator asks the receiver to advertise its state summary.
    Probe,

    /// State summary advertised back to the round initiator.
    ProbeReply { clock: VectorClock, high_csn: Csn },

    /// Entries the receiver is missing: committed ones first in CSN order,
    /// then tentative ones in accept-stamp order.
    Deliver {
        committed: Vec<LogEntry>,
        tentative: Vec<LogEntry>,
    },

    /// Integration acknowledged; `ok` is false if the batch was rejected.
    DeliverReply { ok: bool },
}

/// WAL log entry type.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, GetSize)]
pub(crate) enum WalEntry {
    /// A tentative entry was learned, either accepted from a local client
    /// or delivered by a peer.
    Accepted { entry: LogEntry },

    /// A commit sequence number was bound to an entry.
    Committed { entry: LogEntry },
}

/// Stage of the initiator-side anti-entropy round in flight.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum AeStage {
    /// Probe sent, awaiting the peer's state summary.
    Probing,

    /// Deliver sent, awaiting the peer's acknowledgement.
    Delivering,
}

/// Initiator-side record of the anti-entropy round in flight.
#[derive(Debug)]
struct AeRound {
    peer: ReplicaId,
    stage: AeStage,
}

/// Bayou server replica module.
pub struct BayouReplica {
    /// Replica ID in cluster.
    id: ReplicaId,

    /// Total number of replicas in cluster.
    population: u8,

    /// ID of the replica authorized to assign commit sequence numbers.
    primary: ReplicaId,

    /// Configuration parameters struct.
    config: ReplicaConfigBayou,

    /// Map from peer ID -> peer-to-peer address, for lazy (re)connection.
    peer_addrs: HashMap<ReplicaId, SocketAddr>,

    /// ExternalApi module.
    external_api: ExternalApi,

    /// TransportHub module.
    transport_hub: TransportHub<PeerMsg>,

    /// StorageHub module journaling the logs.
    storage_hub: StorageHub<WalEntry>,

    /// Store materializing the committed prefix only.
    commit_store: Box<dyn StateStore>,

    /// Store materializing committed plus tentative effects.
    full_store: Box<dyn StateStore>,

    /// My version vector.
    clock: VectorClock,

    /// Highest commit sequence number applied locally.
    high_csn: Csn,

    /// Commit log, ordered by CSN.
    commit_log: Vec<LogEntry>,

    /// Tentative log, ordered by accept-stamp.
    tentative_log: Vec<LogEntry>,

    /// Undo log, in lockstep with the tentative log.
    undo_log: Vec<LogEntry>,

    /// Accept-stamps of tentative entries whose conflict stayed unresolved.
    error_log: Vec<AcceptStamp>,

    /// Timer for scheduling the next anti-entropy round.
    ae_timer: Timer,

    /// Timer bounding the round currently in flight.
    rpc_timer: Timer,

    /// The round currently in flight, if any. At most one at a time.
    ae_round: Option<AeRound>,

    /// Current durable WAL log file offset.
    wal_offset: usize,

    /// Monotonic counter for WAL action IDs.
    next_wal_id: LogActionId,
}

// BayouReplica setup & common helpers
impl BayouReplica {
    /// Creates a new replica module and sets up its functionality modules.
    /// Proactively connects to all lower-ID peers that are already up;
    /// others are dialed lazily by the anti-entropy timer.
    pub async fn new_and_setup(
        id: ReplicaId,
        population: u8,
        primary: ReplicaId,
        api_addr: SocketAddr,
        p2p_addr: SocketAddr,
        peer_addrs: HashMap<ReplicaId, SocketAddr>,
        config_str: Option<&str>,
    ) -> Result<Self, BayouError> {
        if id >= population {
            return logged_err!(id; "invalid replica ID {} / {}", id, population);
        }
        if primary >= population {
            return logged_err!(id; "invalid primary ID {} / {}", primary,
                                   population);
        }

        let config = ReplicaConfigBayou::parsed_from(config_str)?;
        if config.ae_interval_min_ms == 0
            || config.ae_interval_max_ms <= config.ae_interval_min_ms
        {
            return logged_err!(id; "invalid anti-entropy interval range [{}, {})",
                                   config.ae_interval_min_ms,
                                   config.ae_interval_max_ms);
        }
        if config.rpc_timeout_ms == 0 {
            return logged_err!(id; "invalid config.rpc_timeout_ms '{}'",
                                   config.rpc_timeout_ms);
        }

        // the two state stores; both are rebuilt from the WAL during
        // recovery, so stale snapshot contents are harmless
        let commit_store = MemStore::open(&config.commit_db_path)?;
        let full_store = MemStore::open(&config.full_db_path)?;

        // setup storage hub module
        let storage_hub =
            StorageHub::new_and_setup(id, Path::new(&config.backer_path))
                .await?;

        // setup transport hub module
        let mut transport_hub =
            TransportHub::new_and_setup(id, population, p2p_addr).await?;

        // proactively connect to peers with smaller ID; connections the
        // other way arrive through the listener
        for (&peer, &addr) in &peer_addrs {
            if peer < id {
                if let Err(e) =
                    transport_hub.connect_to_peer(peer, addr).await
                {
                    pf_warn!(id; "could not reach peer {} yet: {}", peer, e);
                }
            }
        }

        // setup external API module, ready to take in client requests
        let external_api = ExternalApi::new_and_setup(id, api_addr).await?;

        Ok(BayouReplica {
            id,
            population,
            primary,
            config,
            peer_addrs,
            external_api,
            transport_hub,
            storage_hub,
            commit_store: Box::new(commit_store),
            full_store: Box::new(full_store),
            clock: VectorClock::new(population),
            high_csn: 0,
            commit_log: vec![],
            tentative_log: vec![],
            undo_log: vec![],
            error_log: vec![],
            ae_timer: Timer::new(),
            rpc_timer: Timer::new(),
            ae_round: None,
            wal_offset: 0,
            next_wal_id: 0,
        })
    }

    /// Replica ID of myself.
    #[inline]
    pub fn id(&self) -> ReplicaId {
        self.id
    }

    /// Whether I am the replica authorized to assign CSNs.
    #[inline]
    pub(super) fn is_primary(&self) -> bool {
        self.id == self.primary
    }

    /// Hands out the next WAL action ID.
    fn next_wal_action_id(&mut self) -> LogActionId {
        self.next_wal_id += 1;
        self.next_wal_id
    }

    /// Journals a learned tentative entry, waiting for durability.
    pub(super) async fn log_accepted(
        &mut self,
        entry: &LogEntry,
    ) -> Result<(), BayouError> {
        let wal_entry = WalEntry::Accepted {
            entry: entry.clone(),
        };
        self.log_wal_entry(wal_entry).await
    }

    /// Journals a commit binding, waiting for durability.
    pub(super) async fn log_committed(
        &mut self,
        entry: &LogEntry,
    ) -> Result<(), BayouError> {
        let wal_entry = WalEntry::Committed {
            entry: entry.clone(),
        };
        self.log_wal_entry(wal_entry).await
    }

    async fn log_wal_entry(
        &mut self,
        wal_entry: WalEntry,
    ) -> Result<(), BayouError> {
        let action_id = self.next_wal_action_id();
        let (_, log_result) = self
            .storage_hub
            .do_sync_action(
                action_id,
                LogAction::Append {
                    entry: wal_entry,
                    sync: self.config.logger_sync,
                },
            )
            .await?;
        if let LogResult::Append { now_size } = log_result {
            self.wal_offset = now_size;
            Ok(())
        } else {
            logged_err!(self.id; "unexpected log result type")
        }
    }

    /// Saves both state stores to their snapshot files.
    pub(super) fn persist_stores(&mut self) -> Result<(), BayouError> {
        self.commit_store.persist()?;
        self.full_store.persist()
    }

    /// Main event loop logic of running this replica. Returns `Ok(())` upon
    /// a graceful termination signal; returns an error if the replica halts
    /// because continuing would risk store divergence.
    pub async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), BayouError> {
        // recover state from durable storage WAL log; a restarted primary
        // may find recovered tentative writes awaiting CSNs
        self.recover_from_wal().await?;
        self.maybe_commit().await?;

        // start the anti-entropy schedule
        self.kickoff_ae_timer()?;

        loop {
            tokio::select! {
                // client request
                req = self.external_api.get_req() => {
                    if let Err(e) = req {
                        pf_error!(self.id; "error getting client request: {}", e);
                        continue;
                    }
                    let (client, req) = req.unwrap();
                    if let Err(e) = self.handle_req(client, req).await {
                        pf_error!(self.id; "fatal error handling request: {}", e);
                        return Err(e);
                    }
                },

                // message from peer
                msg = self.transport_hub.recv_msg() => {
                    if let Err(e) = msg {
                        pf_debug!(self.id; "error receiving peer msg: {}", e);
                        continue;
                    }
                    let (peer, msg) = msg.unwrap();
                    if let Err(e) = self.handle_peer_msg(peer, msg).await {
                        // a failed rollback/reapply must halt the replica
                        // rather than risk divergence
                        pf_error!(self.id; "fatal error handling peer msg: {}", e);
                        return Err(e);
                    }
                },

                // time to initiate an anti-entropy round
                _ = self.ae_timer.timeout() => {
                    if let Err(e) = self.begin_ae_round().await {
                        pf_warn!(self.id; "error beginning anti-entropy round: {}", e);
                    }
                },

                // the round in flight timed out
                _ = self.rpc_timer.timeout() => {
                    if let Err(e) = self.abandon_ae_round().await {
                        pf_error!(self.id; "fatal error abandoning round: {}", e);
                        return Err(e);
                    }
                },

                // receiving termination signal
                _ = rx_term.changed() => {
                    pf_warn!(self.id; "server caught termination signal");
                    self.persist_stores()?;
                    self.transport_hub.leave().await?;
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod replica_tests;
