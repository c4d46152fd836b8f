//! Bayou replica -- recovery from WAL.

use super::*;

// BayouReplica recovery from WAL log
impl BayouReplica {
    /// Recovers state from the durable WAL log: replays the journal to
    /// rebuild the logs and version vector, then re-materializes both state
    /// stores from scratch (committed prefix in CSN order, then the
    /// tentative reapply pass, which also rebuilds the error log).
    pub(super) async fn recover_from_wal(&mut self) -> Result<(), BayouError> {
        debug_assert_eq!(self.wal_offset, 0);
        loop {
            let action_id = self.next_wal_action_id();
            let (_, log_result) = self
                .storage_hub
                .do_sync_action(
                    action_id,
                    LogAction::Read {
                        offset: self.wal_offset,
                    },
                )
                .await?;

            match log_result {
                LogResult::Read {
                    entry: Some(wal_entry),
                    end_offset,
                } => {
                    self.replay_wal_entry(wal_entry)?;
                    self.wal_offset = end_offset;
                }
                LogResult::Read { entry: None, .. } => {
                    // end of log reached
                    break;
                }
                _ => {
                    return logged_err!(self.id; "unexpected log result type");
                }
            }
        }

        // do an extra Truncate to remove partial entry at the end if any
        let action_id = self.next_wal_action_id();
        let (_, log_result) = self
            .storage_hub
            .do_sync_action(
                action_id,
                LogAction::Truncate {
                    offset: self.wal_offset,
                },
            )
            .await?;
        if !matches!(
            log_result,
            LogResult::Truncate {
                offset_ok: true,
                ..
            }
        ) {
            return logged_err!(self.id; "unexpected log result type");
        }

        // journal order is arrival order; re-establish canonical orders
        self.commit_log.sort_by_key(|e| e.csn);

        // rebuild both stores deterministically from the recovered logs;
        // this also re-sorts the tentative log and rebuilds the undo and
        // error logs
        self.commit_store.clear();
        self.full_store.clear();
        for idx in 0..self.commit_log.len() {
            let entry = self.commit_log[idx].clone();
            self.apply_committed(&entry)?;
        }
        self.reapply_tentatives()?;
        self.persist_stores()?;

        if self.high_csn > 0 || !self.tentative_log.is_empty() {
            pf_info!(self.id; "recovered from wal: {} committed, {} tentative",
                              self.commit_log.len(), self.tentative_log.len());
        }
        Ok(())
    }

    /// Replays one journal record into the in-memory logs and clock.
    fn replay_wal_entry(
        &mut self,
        wal_entry: WalEntry,
    ) -> Result<(), BayouError> {
        match wal_entry {
            WalEntry::Accepted { entry } => {
                if entry.stamp.time > self.clock.get(entry.stamp.origin)? {
                    self.clock.set(entry.stamp.origin, entry.stamp.time)?;
                }
                self.undo_log.push(entry.undo_twin());
                self.tentative_log.push(entry);
            }
            WalEntry::Committed { entry } => {
                if let Some(pos) = self
                    .tentative_log
                    .iter()
                    .position(|e| e.stamp == entry.stamp)
                {
                    self.tentative_log.remove(pos);
                    self.undo_log.remove(pos);
                }
                if entry.stamp.time > self.clock.get(entry.stamp.origin)? {
                    self.clock.set(entry.stamp.origin, entry.stamp.time)?;
                }
                if entry.csn > self.high_csn {
                    self.high_csn = entry.csn;
                }
                self.commit_log.push(entry);
            }
        }
        Ok(())
    }
}
