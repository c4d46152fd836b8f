//! Bayou replica -- anti-entropy initiator side.
//!
//! Every tick of the randomized interval timer, pick one other replica
//! uniformly at random and reconcile with it: probe for its version vector
//! and highest CSN, then stream it the committed entries (CSN order) and
//! tentative entries (accept-stamp order) it is missing. At most one round
//! is in flight; a timed-out round is abandoned with no local state change.

use super::*;

use rand::Rng;

use tokio::time::Duration;

// BayouReplica anti-entropy initiator
impl BayouReplica {
    /// Re-arms the anti-entropy interval timer with a fresh randomized
    /// duration in `[ae_interval_min_ms, ae_interval_max_ms)`.
    pub(super) fn kickoff_ae_timer(&self) -> Result<(), BayouError> {
        let ms = rand::thread_rng().gen_range(
            self.config.ae_interval_min_ms..self.config.ae_interval_max_ms,
        );
        self.ae_timer.kickoff(Duration::from_millis(ms))
    }

    /// Begins a new anti-entropy round if none is in flight: picks a random
    /// peer, lazily (re)dialing it if disconnected, and sends the probe.
    pub(super) async fn begin_ae_round(&mut self) -> Result<(), BayouError> {
        if self.population == 1 || self.ae_round.is_some() {
            return self.kickoff_ae_timer();
        }

        // pick one other replica uniformly at random
        let offset = rand::thread_rng().gen_range(1..self.population);
        let target = (self.id + offset) % self.population;

        // lazily re-dial a disconnected peer; this is also how a restarted
        // replica gets re-admitted by its higher-ID peers
        if !self.transport_hub.current_peers()?.get(target)? {
            let addr = match self.peer_addrs.get(&target) {
                Some(&addr) => addr,
                None => {
                    self.kickoff_ae_timer()?;
                    return logged_err!(self.id; "no address known for peer {}",
                                                target);
                }
            };
            if let Err(e) =
                self.transport_hub.connect_to_peer(target, addr).await
            {
                pf_debug!(self.id; "peer {} unreachable: {}", target, e);
                return self.kickoff_ae_timer();
            }
        }

        if let Err(e) = self.transport_hub.send_msg(PeerMsg::Probe, target) {
            pf_debug!(self.id; "error probing peer {}: {}", target, e);
            return self.kickoff_ae_timer();
        }
        pf_trace!(self.id; "probing peer {}", target);

        self.ae_round = Some(AeRound {
            peer: target,
            stage: AeStage::Probing,
        });
        self.rpc_timer
            .kickoff(Duration::from_millis(self.config.rpc_timeout_ms))
    }

    /// Computes the entries the peer is missing given its advertised state:
    /// commit-log entries with CSN beyond its high mark, and tentative-log
    /// entries its version vector does not cover. Both lists inherit their
    /// logs' canonical order.
    pub(super) fn compute_ae_delta(
        &self,
        peer_clock: &VectorClock,
        peer_high_csn: Csn,
    ) -> Result<(Vec<LogEntry>, Vec<LogEntry>), BayouError> {
        let committed = self
            .commit_log
            .iter()
            .filter(|e| e.csn > peer_high_csn)
            .cloned()
            .collect();

        let mut tentative = vec![];
        for entry in &self.tentative_log {
            if entry.stamp.time > peer_clock.get(entry.stamp.origin)? {
                tentative.push(entry.clone());
            }
        }

        Ok((committed, tentative))
    }

    /// Handler of the peer's state summary: streams it the delta. Replies
    /// from peers other than the round's are stale and ignored.
    pub(super) fn handle_probe_reply(
        &mut self,
        peer: ReplicaId,
        peer_clock: VectorClock,
        peer_high_csn: Csn,
    ) -> Result<(), BayouError> {
        match &self.ae_round {
            Some(round)
                if round.peer == peer && round.stage == AeStage::Probing => {}
            _ => {
                pf_debug!(self.id; "ignoring stale probe reply from {}", peer);
                return Ok(());
            }
        }

        let (committed, tentative) =
            match self.compute_ae_delta(&peer_clock, peer_high_csn) {
                Ok(delta) => delta,
                Err(e) => {
                    pf_warn!(self.id; "malformed state summary from {}: {}",
                                      peer, e);
                    return self.finish_ae_round_now();
                }
            };
        pf_trace!(self.id; "delivering {} committed + {} tentative -> {}",
                           committed.len(), tentative.len(), peer);

        if let Err(e) = self.transport_hub.send_msg(
            PeerMsg::Deliver {
                committed,
                tentative,
            },
            peer,
        ) {
            pf_debug!(self.id; "error delivering to peer {}: {}", peer, e);
            return self.finish_ae_round_now();
        }

        self.ae_round.as_mut().unwrap().stage = AeStage::Delivering;
        self.rpc_timer
            .kickoff(Duration::from_millis(self.config.rpc_timeout_ms))
    }

    /// Handler of the peer's integration acknowledgement, completing the
    /// round. The initiator records no state change beyond having noticed
    /// the peer is alive.
    pub(super) async fn handle_deliver_reply(
        &mut self,
        peer: ReplicaId,
        ok: bool,
    ) -> Result<(), BayouError> {
        match &self.ae_round {
            Some(round)
                if round.peer == peer
                    && round.stage == AeStage::Delivering => {}
            _ => {
                pf_debug!(self.id; "ignoring stale deliver reply from {}", peer);
                return Ok(());
            }
        }
        if !ok {
            pf_warn!(self.id; "peer {} rejected my anti-entropy batch", peer);
        }

        self.finish_ae_round_now()?;
        self.maybe_commit().await
    }

    /// Clears the round in flight and re-arms the interval timer.
    fn finish_ae_round_now(&mut self) -> Result<(), BayouError> {
        self.ae_round = None;
        self.rpc_timer.cancel()?;
        self.kickoff_ae_timer()
    }

    /// Handler of the round timeout: the partially-run round is abandoned
    /// with no local state change, to be retried on a later tick.
    pub(super) async fn abandon_ae_round(&mut self) -> Result<(), BayouError> {
        if let Some(round) = &self.ae_round {
            pf_warn!(self.id; "abandoning timed-out round with peer {}",
                              round.peer);
            self.finish_ae_round_now()?;
            self.maybe_commit().await?;
        }
        Ok(())
    }
}
