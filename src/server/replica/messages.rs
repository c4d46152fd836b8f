//! Bayou replica -- peer anti-entropy message handlers (receiver side).

use super::*;

// BayouReplica peer message handlers
impl BayouReplica {
    /// Handler of peer message chan recv. Returns an error only when the
    /// replica must halt (a failed rollback/reapply).
    pub(super) async fn handle_peer_msg(
        &mut self,
        peer: ReplicaId,
        msg: PeerMsg,
    ) -> Result<(), BayouError> {
        match msg {
            PeerMsg::Probe => self.handle_probe(peer),

            PeerMsg::ProbeReply { clock, high_csn } => {
                self.handle_probe_reply(peer, clock, high_csn)
            }

            PeerMsg::Deliver {
                committed,
                tentative,
            } => self.handle_deliver(peer, committed, tentative).await,

            PeerMsg::DeliverReply { ok } => {
                self.handle_deliver_reply(peer, ok).await
            }
        }
    }

    /// Advertises my version vector and highest CSN to the round initiator.
    fn handle_probe(&mut self, peer: ReplicaId) -> Result<(), BayouError> {
        pf_trace!(self.id; "probed by {}", peer);
        let reply = PeerMsg::ProbeReply {
            clock: self.clock.clone(),
            high_csn: self.high_csn,
        };
        if let Err(e) = self.transport_hub.send_msg(reply, peer) {
            pf_debug!(self.id; "error replying to probe from {}: {}", peer, e);
        }
        Ok(())
    }

    /// Integrates a delivered batch of missing entries, then acknowledges.
    async fn handle_deliver(
        &mut self,
        peer: ReplicaId,
        committed: Vec<LogEntry>,
        tentative: Vec<LogEntry>,
    ) -> Result<(), BayouError> {
        let ok = self.integrate_batch(committed, tentative).await?;
        if let Err(e) = self
            .transport_hub
            .send_msg(PeerMsg::DeliverReply { ok }, peer)
        {
            pf_debug!(self.id; "error acking deliver from {}: {}", peer, e);
        }
        if ok {
            self.maybe_commit().await?;
        }
        Ok(())
    }

    /// Filters a delivered batch down to the entries I am actually missing,
    /// mirroring the clock updates on a scratch copy so that a rewinding or
    /// malformed batch is rejected in full with no state change.
    fn sift_batch(
        &self,
        committed: Vec<LogEntry>,
        tentative: Vec<LogEntry>,
    ) -> Result<(VectorClock, Vec<LogEntry>, Vec<LogEntry>), BayouError> {
        let mut clock = self.clock.clone();

        let mut fresh_commits: Vec<LogEntry> = vec![];
        for entry in committed {
            if entry.csn <= self.high_csn {
                continue; // already known, deliveries are idempotent
            }
            // the commit prefix is dense, so what remains must extend my
            // high mark without gaps or duplicates
            if entry.csn != self.high_csn + 1 + fresh_commits.len() as Csn {
                return Err(BayouError(format!(
                    "commit sequence gap at csn {}",
                    entry.csn
                )));
            }
            if entry.stamp.time > clock.get(entry.stamp.origin)? {
                clock.set(entry.stamp.origin, entry.stamp.time)?;
            }
            fresh_commits.push(entry);
        }

        let mut fresh_tents = vec![];
        for entry in tentative {
            if self.clock.get(entry.stamp.origin)? >= entry.stamp.time {
                continue; // my vector already dominates this entry
            }
            // within one batch, stamps from an origin must strictly
            // increase; a replayed or regressing stamp rejects the batch
            if clock.get(entry.stamp.origin)? >= entry.stamp.time {
                return Err(BayouError(format!(
                    "tentative entry {} out of order in batch",
                    entry.stamp
                )));
            }
            clock.set(entry.stamp.origin, entry.stamp.time)?;
            fresh_tents.push(entry);
        }

        Ok((clock, fresh_commits, fresh_tents))
    }

    /// Integrates a delivered batch under the mutation path: journal and
    /// insert the fresh tentative entries, then run one rollback/reapply
    /// pass merging the fresh commits. Returns `Ok(false)` if the batch was
    /// rejected; state is unchanged in that case.
    pub(super) async fn integrate_batch(
        &mut self,
        committed: Vec<LogEntry>,
        tentative: Vec<LogEntry>,
    ) -> Result<bool, BayouError> {
        let (clock, fresh_commits, fresh_tents) =
            match self.sift_batch(committed, tentative) {
                Ok(sifted) => sifted,
                Err(e) => {
                    pf_warn!(self.id; "rejecting anti-entropy batch: {}", e);
                    return Ok(false);
                }
            };

        if fresh_commits.is_empty() && fresh_tents.is_empty() {
            // nothing new; deliberately not touching any state
            return Ok(true);
        }
        pf_debug!(self.id; "integrating {} committed + {} tentative entries",
                           fresh_commits.len(), fresh_tents.len());

        for entry in &fresh_tents {
            self.log_accepted(entry).await?;
        }
        self.clock = clock;

        self.rollback_reapply(fresh_commits, fresh_tents).await?;
        self.persist_stores()?;
        Ok(true)
    }
}
