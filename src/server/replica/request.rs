//! Bayou replica -- client request entrance.

use super::*;
use crate::client::ClientId;

// BayouReplica client requests entrance
impl BayouReplica {
    /// Handler of client request chan recv. State-store errors during
    /// acceptance are propagated back to the client and leave the logs
    /// untouched; only infrastructure failures bubble up as fatal.
    pub(super) async fn handle_req(
        &mut self,
        client: ClientId,
        req: ApiRequest,
    ) -> Result<(), BayouError> {
        match req {
            ApiRequest::Ping { id } => {
                self.reply_to(ApiReply::Ping { id, alive: true }, client);
                Ok(())
            }

            ApiRequest::Read {
                id,
                query,
                from_commit,
            } => {
                let result = if from_commit {
                    self.commit_store.read(&query)
                } else {
                    self.full_store.read(&query)
                };
                let reply = match result {
                    Ok(rows) => ApiReply::Read { id, rows },
                    Err(e) => ApiReply::Error {
                        id,
                        msg: e.to_string(),
                    },
                };
                self.reply_to(reply, client);
                Ok(())
            }

            ApiRequest::Write {
                id,
                nonce,
                write_op,
                undo_op,
                check_op,
                merge_op,
            } => {
                pf_trace!(self.id; "write req from client {} nonce {}",
                                   client, nonce);
                let reply = match self
                    .accept_write(write_op, undo_op, check_op, merge_op)
                    .await?
                {
                    Ok((has_conflict, was_resolved)) => ApiReply::Write {
                        id,
                        has_conflict,
                        was_resolved,
                    },
                    Err(e) => ApiReply::Error {
                        id,
                        msg: e.to_string(),
                    },
                };
                self.reply_to(reply, client);
                self.persist_stores()?;
                self.maybe_commit().await
            }

            // leave notifications are answered by the servant task itself
            ApiRequest::Leave => Ok(()),
        }
    }

    /// Best-effort reply delivery; the client may have disconnected already.
    fn reply_to(&mut self, reply: ApiReply, client: ClientId) {
        if let Err(e) = self.external_api.send_reply(reply, client) {
            pf_warn!(self.id; "error replying to client {}: {}", client, e);
        }
    }

    /// Accepts one client write: evaluate its dependency check against the
    /// full store, apply the write or its merge procedure, then stamp the
    /// entry and append it to the tentative and undo logs in lockstep.
    ///
    /// The outer `Result` carries infrastructure failures (WAL I/O); the
    /// inner one carries state-store errors destined for the client, in
    /// which case neither the logs nor the clock have been touched.
    pub(super) async fn accept_write(
        &mut self,
        write_op: String,
        undo_op: String,
        check_op: String,
        merge_op: String,
    ) -> Result<Result<(bool, bool), BayouError>, BayouError> {
        let time = self.clock.get(self.id)? + 1;
        let entry = LogEntry::new(
            AcceptStamp {
                time,
                origin: self.id,
            },
            write_op,
            undo_op,
            check_op,
            merge_op,
        );

        let (has_conflict, was_resolved) = match self.apply_to_full(&entry) {
            Ok(outcome) => outcome,
            Err(e) => return Ok(Err(e)),
        };

        self.clock.set(self.id, time)?;
        self.tentative_log.push(entry.clone());
        self.undo_log.push(entry.undo_twin());
        if !was_resolved {
            pf_warn!(self.id; "unresolved conflict on write {}", entry.stamp);
            self.error_log.push(entry.stamp);
        }
        self.log_accepted(&entry).await?;

        pf_debug!(self.id; "accepted write {} conflict={} resolved={}",
                           entry.stamp, has_conflict, was_resolved);
        Ok(Ok((has_conflict, was_resolved)))
    }
}
