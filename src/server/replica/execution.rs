//! Bayou replica -- conflict application & rollback/reapply.
//!
//! The full store is re-materialized from the committed store whenever the
//! tentative log's effective content changes: a peer delivered new commits,
//! a peer delivered a tentative write that does not sort last, or commits
//! were assigned locally on the primary. A local client write appends
//! strictly at the tail of the tentative order and skips the rollback.
//!
//! Contract on `undo_op` (documented to clients, not enforced): it must
//! reverse exactly the effect its entry had on the store, whichever of
//! `write_op` / `merge_op` was applied. Keying the undo to the write's own
//! unique row identity satisfies this for both paths.

use super::*;

// BayouReplica conflict application & rollback/reapply
impl BayouReplica {
    /// Applies one entry against the full store: evaluate `check_op`; on
    /// pass execute `write_op`, otherwise run `merge_op` (whose result rows
    /// report whether the conflict counts as resolved). Returns
    /// `(has_conflict, was_resolved)`. Both outcomes are equally legitimate
    /// effects on the full store.
    pub(super) fn apply_to_full(
        &mut self,
        entry: &LogEntry,
    ) -> Result<(bool, bool), BayouError> {
        if self.full_store.check(&entry.check_op)? {
            self.full_store.execute(&entry.write_op)?;
            Ok((false, true))
        } else {
            let was_resolved = self.full_store.check(&entry.merge_op)?;
            Ok((true, was_resolved))
        }
    }

    /// Applies one committed entry to both stores. The check/merge decision
    /// is recomputed against the committed prefix in CSN order, which is
    /// identical on every replica; at this point of a rollback pass the
    /// full store equals the committed store, so mirroring the chosen
    /// statement keeps the two in lockstep.
    pub(super) fn apply_committed(
        &mut self,
        entry: &LogEntry,
    ) -> Result<(), BayouError> {
        if self.commit_store.check(&entry.check_op)? {
            self.commit_store.execute(&entry.write_op)?;
            self.full_store.execute(&entry.write_op)?;
        } else {
            self.commit_store.check(&entry.merge_op)?;
            self.full_store.check(&entry.merge_op)?;
        }
        Ok(())
    }

    /// Canonical rollback: reverse all currently-applied tentative effects,
    /// merge newly-arrived commits into the commit log (striking their
    /// tentative twins), splice in newly-learned tentative entries, then
    /// reapply the tentative log in accept-stamp order. `new_commits` must
    /// be ordered by CSN ascending; `new_tentatives` must already be
    /// journaled by the caller. Errors from the state store here are fatal
    /// to the replica.
    pub(super) async fn rollback_reapply(
        &mut self,
        new_commits: Vec<LogEntry>,
        new_tentatives: Vec<LogEntry>,
    ) -> Result<(), BayouError> {
        // undo every applied tentative effect in reverse order; the full
        // store now equals the committed store. Every undo-log twin belongs
        // to an entry that has actually been applied to the full store.
        for idx in (0..self.undo_log.len()).rev() {
            let undo_op = self.undo_log[idx].write_op.clone();
            self.full_store.execute(&undo_op)?;
        }

        // merge newly-arrived commits
        for entry in new_commits {
            debug_assert!(entry.is_committed());
            debug_assert_eq!(entry.csn, self.high_csn + 1);
            if let Some(pos) = self
                .tentative_log
                .iter()
                .position(|e| e.stamp == entry.stamp)
            {
                self.tentative_log.remove(pos);
                self.undo_log.remove(pos);
            }
            self.apply_committed(&entry)?;
            self.high_csn = entry.csn;
            self.log_committed(&entry).await?;
            pf_debug!(self.id; "committed write {} csn={}",
                               entry.stamp, entry.csn);
            self.commit_log.push(entry);
        }

        // splice in tentative entries learned from the peer
        for entry in new_tentatives {
            self.tentative_log.push(entry);
        }

        self.reapply_tentatives()
    }

    /// Sorts the tentative log into canonical accept-stamp order, rebuilds
    /// the undo log in lockstep, and reapplies every tentative entry
    /// against the full store, rebuilding the error log along the way.
    pub(super) fn reapply_tentatives(&mut self) -> Result<(), BayouError> {
        self.tentative_log.sort_by(|a, b| a.stamp.cmp(&b.stamp));
        self.undo_log =
            self.tentative_log.iter().map(LogEntry::undo_twin).collect();

        self.error_log.clear();
        for idx in 0..self.tentative_log.len() {
            let entry = self.tentative_log[idx].clone();
            let (_, was_resolved) = self.apply_to_full(&entry)?;
            if !was_resolved {
                self.error_log.push(entry.stamp);
            }
        }
        Ok(())
    }
}
