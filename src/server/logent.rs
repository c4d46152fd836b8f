//! Stamped log entry records shared by the tentative, undo, commit, and
//! error logs and by the anti-entropy wire protocol.

use std::fmt;

use crate::server::{LogicalTime, ReplicaId};
use crate::server::{FALSE_QUERY, TRUE_QUERY};

use get_size::GetSize;

use serde::{Deserialize, Serialize};

/// Commit sequence number type. Dense positive integers assigned by the
/// primary; `UNCOMMITTED` (0) means not yet committed.
pub type Csn = u64;

/// CSN value of a write still in its tentative phase.
pub const UNCOMMITTED: Csn = 0;

/// Accept-stamp: the logical time at which a write was first accepted,
/// paired with the accepting replica's ID. The derived lexicographic order
/// on `(time, origin)` is the canonical tentative order.
#[derive(
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    GetSize,
)]
pub struct AcceptStamp {
    pub time: LogicalTime,
    pub origin: ReplicaId,
}

impl fmt::Display for AcceptStamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({},{})", self.time, self.origin)
    }
}

/// One stamped write record. The four `*_op` fields are opaque query strings
/// executable by the state store; the engine never parses them.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, GetSize)]
pub struct LogEntry {
    /// Accept-stamp assigned by the origin replica.
    pub stamp: AcceptStamp,

    /// Commit sequence number; `UNCOMMITTED` while tentative.
    pub csn: Csn,

    /// The write statement itself.
    pub write_op: String,

    /// Statement reversing whatever effect this entry ended up having on
    /// the store, keyed to the write's own row identity.
    pub undo_op: String,

    /// Boolean dependency-check predicate evaluated before applying.
    pub check_op: String,

    /// Alternative statement applied when the check fails; its result rows
    /// report whether the conflict counts as resolved.
    pub merge_op: String,
}

impl LogEntry {
    /// Creates a new tentative log entry.
    pub fn new(
        stamp: AcceptStamp,
        write_op: impl Into<String>,
        undo_op: impl Into<String>,
        check_op: impl Into<String>,
        merge_op: impl Into<String>,
    ) -> Self {
        LogEntry {
            stamp,
            csn: UNCOMMITTED,
            write_op: write_op.into(),
            undo_op: undo_op.into(),
            check_op: check_op.into(),
            merge_op: merge_op.into(),
        }
    }

    /// Derives the parallel undo-log twin of this entry: its write is my
    /// undo, and its own check/merge are the trivial placeholders so that
    /// the two logs stay structurally uniform for rollback.
    pub fn undo_twin(&self) -> LogEntry {
        LogEntry {
            stamp: self.stamp,
            csn: self.csn,
            write_op: self.undo_op.clone(),
            undo_op: String::new(),
            check_op: TRUE_QUERY.into(),
            merge_op: FALSE_QUERY.into(),
        }
    }

    /// Whether this entry has been assigned a commit sequence number.
    #[inline]
    pub fn is_committed(&self) -> bool {
        self.csn != UNCOMMITTED
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{{} csn={} write='{}'}}",
            self.stamp, self.csn, self.write_op
        )
    }
}

#[cfg(test)]
mod logent_tests {
    use super::*;

    #[test]
    fn stamp_ordering() {
        let s10 = AcceptStamp { time: 1, origin: 0 };
        let s11 = AcceptStamp { time: 1, origin: 1 };
        let s20 = AcceptStamp { time: 2, origin: 0 };
        // lexicographic on (time, origin)
        assert!(s10 < s11);
        assert!(s11 < s20);
        assert!(s10 < s20);
        assert_eq!(s10, AcceptStamp { time: 1, origin: 0 });
    }

    #[test]
    fn undo_twin_shape() {
        let entry = LogEntry::new(
            AcceptStamp { time: 3, origin: 1 },
            "INSERT rooms name=\"Frist\"",
            "DELETE rooms WHERE name=\"Frist\"",
            "NOT EXISTS rooms WHERE name=\"Frist\"",
            FALSE_QUERY,
        );
        let twin = entry.undo_twin();
        assert_eq!(twin.stamp, entry.stamp);
        assert_eq!(twin.write_op, entry.undo_op);
        assert_eq!(twin.check_op, TRUE_QUERY);
        assert_eq!(twin.merge_op, FALSE_QUERY);
        assert!(!entry.is_committed());
    }
}
