//! Durable write-ahead logging module. The replica journals every learned
//! tentative entry and every commit binding through this hub and replays
//! the journal at startup.

use std::fmt;
use std::io::SeekFrom;
use std::path::Path;

use crate::server::ReplicaId;
use crate::utils::BayouError;

use get_size::GetSize;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Log action ID type.
pub type LogActionId = u64;

/// Action command to the logger. File cursor will be positioned at EOF after
/// every action.
#[derive(Debug, Serialize, Deserialize, GetSize)]
pub enum LogAction<Ent> {
    /// Read a log entry out.
    Read { offset: usize },

    /// Append a log entry to EOF.
    Append { entry: Ent, sync: bool },

    /// Truncate the log at given offset, keeping the head part.
    Truncate { offset: usize },
}

/// Action result returned by the logger.
#[derive(Debug, Serialize, Deserialize, PartialEq, GetSize)]
pub enum LogResult<Ent> {
    /// `Some(entry)` if successful, else `None`.
    Read {
        entry: Option<Ent>,
        end_offset: usize,
    },

    /// `now_size` is the size of file after this.
    Append { now_size: usize },

    /// `offset_ok` is true if offset was within bound, else false.
    Truncate { offset_ok: bool, now_size: usize },
}

/// Durable storage logging module.
pub struct StorageHub<Ent> {
    /// My replica ID.
    me: ReplicaId,

    /// Sender side of the log channel.
    tx_log: mpsc::UnboundedSender<(LogActionId, LogAction<Ent>)>,

    /// Receiver side of the ack channel.
    rx_ack: mpsc::UnboundedReceiver<(LogActionId, LogResult<Ent>)>,

    /// Join handle of the logger task.
    _logger_handle: JoinHandle<()>,
}

// StorageHub public API implementation
impl<Ent> StorageHub<Ent>
where
    Ent: fmt::Debug
        + Clone
        + Serialize
        + DeserializeOwned
        + GetSize
        + Send
        + Sync
        + 'static,
{
    /// Creates a new durable storage logging hub. Spawns the logger task.
    /// Creates a log channel for submitting logging actions to the logger
    /// and an ack channel for getting results. Prepares the given backing
    /// file as durability backend.
    pub async fn new_and_setup(
        me: ReplicaId,
        path: &Path,
    ) -> Result<Self, BayouError> {
        // prepare backing file
        if !fs::try_exists(path).await? {
            File::create(path).await?;
            pf_info!(me; "created backer file '{}'", path.display());
        } else {
            pf_info!(me; "backer file '{}' already exists", path.display());
        }
        let mut backer_file =
            OpenOptions::new().read(true).write(true).open(path).await?;
        backer_file.seek(SeekFrom::End(0)).await?; // seek to EOF

        let (tx_log, rx_log) =
            mpsc::unbounded_channel::<(LogActionId, LogAction<Ent>)>();
        let (tx_ack, rx_ack) = mpsc::unbounded_channel();

        let logger_handle =
            tokio::spawn(Self::logger_task(me, backer_file, rx_log, tx_ack));

        Ok(StorageHub {
            me,
            tx_log,
            rx_ack,
            _logger_handle: logger_handle,
        })
    }

    /// Submits an action by sending it to the log channel.
    pub fn submit_action(
        &mut self,
        id: LogActionId,
        action: LogAction<Ent>,
    ) -> Result<(), BayouError> {
        self.tx_log
            .send((id, action))
            .map_err(|e| BayouError(e.to_string()))
    }

    /// Waits for the next logging result by receiving from the ack channel.
    pub async fn get_result(
        &mut self,
    ) -> Result<(LogActionId, LogResult<Ent>), BayouError> {
        match self.rx_ack.recv().await {
            Some((id, result)) => Ok((id, result)),
            None => logged_err!(self.me; "ack channel has been closed"),
        }
    }

    /// Submits an action and waits for its result inline. Usable only when
    /// no other action is in flight on this hub.
    pub async fn do_sync_action(
        &mut self,
        id: LogActionId,
        action: LogAction<Ent>,
    ) -> Result<(LogActionId, LogResult<Ent>), BayouError> {
        self.submit_action(id, action)?;
        let (ack_id, result) = self.get_result().await?;
        debug_assert_eq!(ack_id, id);
        Ok((ack_id, result))
    }
}

// StorageHub logger task implementation
impl<Ent> StorageHub<Ent>
where
    Ent: fmt::Debug
        + Clone
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    /// Read out entry at given offset.
    async fn read_entry(
        me: ReplicaId,
        backer: &mut File,
        file_size: usize,
        offset: usize,
    ) -> Result<(Option<Ent>, usize), BayouError> {
        if offset + 8 > file_size {
            if offset < file_size {
                // suppress warning if offset == file_size to avoid excessive
                // log lines during recovery
                pf_warn!(
                    me;
                    "read header end offset {} out of file bound {}",
                    offset + 8,
                    file_size
                );
            }
            return Ok((None, offset));
        }

        // read entry length header
        backer.seek(SeekFrom::Start(offset as u64)).await?;
        let entry_len: usize = backer.read_u64().await? as usize;
        let offset_e = offset + 8 + entry_len;
        if offset_e > file_size {
            pf_warn!(me; "read entry invalid length {}", entry_len);
            backer.seek(SeekFrom::End(0)).await?; // recover cursor to EOF
            return Ok((None, offset));
        }

        // read entry content
        let mut entry_buf: Vec<u8> = vec![0; entry_len];
        backer.read_exact(&mut entry_buf[..]).await?;
        let entry = decode_from_slice(&entry_buf)?;
        backer.seek(SeekFrom::End(0)).await?; // recover cursor to EOF
        Ok((Some(entry), offset_e))
    }

    /// Append given entry to EOF.
    async fn append_entry(
        _me: ReplicaId,
        backer: &mut File,
        file_size: usize,
        entry: &Ent,
        sync: bool,
    ) -> Result<usize, BayouError> {
        let entry_bytes = encode_to_vec(entry)?;
        let entry_len = entry_bytes.len();

        // write entry length header first
        backer.write_u64(entry_len as u64).await?;

        // then entry content
        backer.write_all(&entry_bytes[..]).await?;

        if sync {
            backer.sync_data().await?;
        }

        Ok(file_size + 8 + entry_len)
    }

    /// Truncate the file at given offset, keeping the head part.
    async fn truncate_log(
        me: ReplicaId,
        backer: &mut File,
        file_size: usize,
        offset: usize,
    ) -> Result<(bool, usize), BayouError> {
        if offset > file_size {
            pf_warn!(
                me;
                "truncate offset {} exceeds file end {}",
                offset,
                file_size
            );
            Ok((false, file_size))
        } else {
            backer.set_len(offset as u64).await?;
            backer.seek(SeekFrom::End(0)).await?; // recover cursor to EOF

            backer.sync_all().await?;
            Ok((true, offset))
        }
    }

    /// Carry out the given action on logger.
    async fn do_action(
        me: ReplicaId,
        backer: &mut File,
        file_size: &mut usize,
        action: LogAction<Ent>,
    ) -> Result<LogResult<Ent>, BayouError> {
        match action {
            LogAction::Read { offset } => {
                Self::read_entry(me, backer, *file_size, offset).await.map(
                    |(entry, end_offset)| LogResult::Read { entry, end_offset },
                )
            }
            LogAction::Append { entry, sync } => {
                Self::append_entry(me, backer, *file_size, &entry, sync)
                    .await
                    .map(|now_size| {
                        *file_size = now_size;
                        LogResult::Append { now_size }
                    })
            }
            LogAction::Truncate { offset } => {
                Self::truncate_log(me, backer, *file_size, offset)
                    .await
                    .map(|(offset_ok, now_size)| {
                        *file_size = now_size;
                        LogResult::Truncate {
                            offset_ok,
                            now_size,
                        }
                    })
            }
        }
    }

    /// Logger task function.
    async fn logger_task(
        me: ReplicaId,
        mut backer_file: File,
        mut rx_log: mpsc::UnboundedReceiver<(LogActionId, LogAction<Ent>)>,
        tx_ack: mpsc::UnboundedSender<(LogActionId, LogResult<Ent>)>,
    ) {
        pf_debug!(me; "logger task spawned");

        // maintain file size
        let metadata = backer_file.metadata().await;
        if let Err(e) = metadata {
            pf_error!(me; "error reading backer file metadata: {}, exitting", e);
            return;
        }
        let mut file_size: usize = metadata.unwrap().len() as usize;

        while let Some((id, action)) = rx_log.recv().await {
            let res =
                Self::do_action(me, &mut backer_file, &mut file_size, action)
                    .await;
            if let Err(e) = res {
                pf_error!(me; "error during logging: {}", e);
                continue;
            }

            if let Err(e) = tx_ack.send((id, res.unwrap())) {
                pf_error!(me; "error sending to tx_ack: {}", e);
            }
        }

        // channel gets closed and no messages remain
        pf_debug!(me; "logger task exitted");
    }
}

#[cfg(test)]
mod storage_tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, GetSize)]
    struct TestEntry(String);

    async fn prepare_test_file(path: &str) -> Result<File, BayouError> {
        if !fs::try_exists(path).await? {
            File::create(path).await?;
        } else {
            let file = OpenOptions::new().write(true).open(path).await?;
            file.set_len(0).await?;
        }
        let file = OpenOptions::new().read(true).write(true).open(path).await?;
        Ok(file)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn append_entries() -> Result<(), BayouError> {
        let mut backer_file =
            prepare_test_file("/tmp/test-bayou-backer-0.wal").await?;
        let entry = TestEntry("test-entry-dummy-string".into());
        let entry_bytes = encode_to_vec(&entry)?;
        let mid_size =
            StorageHub::append_entry(0, &mut backer_file, 0, &entry, false)
                .await?;
        assert!(mid_size >= entry_bytes.len());
        let end_size = StorageHub::append_entry(
            0,
            &mut backer_file,
            mid_size,
            &entry,
            true,
        )
        .await?;
        assert!(end_size - mid_size >= entry_bytes.len());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn read_entries() -> Result<(), BayouError> {
        let mut backer_file =
            prepare_test_file("/tmp/test-bayou-backer-1.wal").await?;
        let entry = TestEntry("test-entry-dummy-string".into());
        let mid_size =
            StorageHub::append_entry(0, &mut backer_file, 0, &entry, false)
                .await?;
        let end_size = StorageHub::append_entry(
            0,
            &mut backer_file,
            mid_size,
            &entry,
            true,
        )
        .await?;
        assert_eq!(
            StorageHub::read_entry(0, &mut backer_file, end_size, mid_size)
                .await?,
            (Some(TestEntry("test-entry-dummy-string".into())), end_size)
        );
        assert_eq!(
            StorageHub::read_entry(0, &mut backer_file, end_size, 0).await?,
            (Some(TestEntry("test-entry-dummy-string".into())), mid_size)
        );
        assert_eq!(
            StorageHub::<TestEntry>::read_entry(
                0,
                &mut backer_file,
                end_size,
                end_size
            )
            .await?,
            (None, end_size)
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn truncate_log() -> Result<(), BayouError> {
        let mut backer_file =
            prepare_test_file("/tmp/test-bayou-backer-2.wal").await?;
        let entry = TestEntry("test-entry-dummy-string".into());
        let mid_offset =
            StorageHub::append_entry(0, &mut backer_file, 0, &entry, false)
                .await?;
        let end_offset = StorageHub::append_entry(
            0,
            &mut backer_file,
            mid_offset,
            &entry,
            true,
        )
        .await?;
        assert_eq!(
            StorageHub::<TestEntry>::truncate_log(
                0,
                &mut backer_file,
                end_offset,
                mid_offset
            )
            .await?,
            (true, mid_offset)
        );
        assert_eq!(
            StorageHub::<TestEntry>::truncate_log(
                0,
                &mut backer_file,
                mid_offset,
                end_offset
            )
            .await?,
            (false, mid_offset)
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn api_log_ack() -> Result<(), BayouError> {
        let path = Path::new("/tmp/test-bayou-backer-3.wal");
        fs::write(path, b"").await?;
        let mut hub = StorageHub::new_and_setup(0, path).await?;
        let entry = TestEntry("abcdefgh".into());
        let entry_bytes = encode_to_vec(&entry)?;
        hub.submit_action(0, LogAction::Append { entry, sync: true })?;
        hub.submit_action(1, LogAction::Read { offset: 0 })?;
        hub.submit_action(2, LogAction::Truncate { offset: 0 })?;
        assert_eq!(
            hub.get_result().await?,
            (
                0,
                LogResult::Append {
                    now_size: 8 + entry_bytes.len()
                }
            )
        );
        assert_eq!(
            hub.get_result().await?,
            (
                1,
                LogResult::Read {
                    entry: Some(TestEntry("abcdefgh".into())),
                    end_offset: 8 + entry_bytes.len(),
                }
            )
        );
        assert_eq!(
            hub.get_result().await?,
            (
                2,
                LogResult::Truncate {
                    offset_ok: true,
                    now_size: 0
                }
            )
        );
        Ok(())
    }
}
