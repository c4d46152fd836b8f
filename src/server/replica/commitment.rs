//! Bayou replica -- primary-side commit sequence number assignment.

use super::*;

// BayouReplica primary commitment
impl BayouReplica {
    /// Runs a commit pass if I am the primary, no anti-entropy round is
    /// mid-flight locally, and there are tentative writes awaiting a CSN.
    pub(super) async fn maybe_commit(&mut self) -> Result<(), BayouError> {
        if !self.is_primary()
            || self.ae_round.is_some()
            || self.tentative_log.is_empty()
        {
            return Ok(());
        }
        self.commit_pass().await
    }

    /// Walks the tentative log in accept-stamp order and assigns the next
    /// dense CSNs. The entries then travel through the same rollback/
    /// reapply pass that merges commits learned from peers, which strikes
    /// them from the tentative and undo logs, appends them to the commit
    /// log, and catches the committed store up.
    async fn commit_pass(&mut self) -> Result<(), BayouError> {
        let mut to_commit = Vec::with_capacity(self.tentative_log.len());
        for entry in &self.tentative_log {
            debug_assert!(!entry.is_committed());
            let mut entry = entry.clone();
            entry.csn = self.high_csn + 1 + to_commit.len() as Csn;
            to_commit.push(entry);
        }

        pf_debug!(self.id; "commit pass over {} tentative writes, csn {}..={}",
                           to_commit.len(),
                           self.high_csn + 1,
                           self.high_csn + to_commit.len() as Csn);
        self.rollback_reapply(to_commit, vec![]).await?;
        self.persist_stores()
    }
}
