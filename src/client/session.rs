//! Bayou client session wrapper, plus the room-claiming helpers of the
//! demo application.

use std::net::SocketAddr;

use crate::client::{ClientApiStub, ClientId};
use crate::server::{
    ApiReply, ApiRequest, ColValue, RequestId, Row, FALSE_QUERY,
};
use crate::utils::BayouError;

/// One claimed room slot in the demo application schema.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Room {
    pub name: String,
    pub day: i64,
    pub hour: i64,
}

impl Room {
    /// Deserializes a room out of one reply row.
    fn from_row(row: &Row) -> Result<Room, BayouError> {
        let name = match row.get("name") {
            Some(ColValue::Text(s)) => s.clone(),
            _ => return Err(BayouError::msg("room row missing 'name'")),
        };
        let day = match row.get("day") {
            Some(ColValue::Int(v)) => *v,
            _ => return Err(BayouError::msg("room row missing 'day'")),
        };
        let hour = match row.get("hour") {
            Some(ColValue::Int(v)) => *v,
            _ => return Err(BayouError::msg("room row missing 'hour'")),
        };
        Ok(Room { name, day, hour })
    }
}

/// Client session against one Bayou replica.
pub struct BayouClient {
    /// Client ID.
    id: ClientId,

    /// API stub for communicating with the server.
    api_stub: ClientApiStub,

    /// Next request ID to use.
    next_req: RequestId,
}

impl BayouClient {
    /// Creates a new client session connected to the given replica.
    pub async fn new_and_connect(
        id: ClientId,
        server_addr: SocketAddr,
    ) -> Result<Self, BayouError> {
        let api_stub = ClientApiStub::new_by_connect(id, server_addr).await?;
        Ok(BayouClient {
            id,
            api_stub,
            next_req: 0,
        })
    }

    /// Client ID of myself.
    #[inline]
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Sends a request, retrying on a full socket, and waits for the reply
    /// carrying the matching request ID.
    async fn do_rpc(
        &mut self,
        req: ApiRequest,
        req_id: RequestId,
    ) -> Result<ApiReply, BayouError> {
        let mut sent = self.api_stub.send_req(Some(&req))?;
        while !sent {
            sent = self.api_stub.send_req(None)?;
        }

        loop {
            let reply = self.api_stub.recv_reply().await?;
            let id = match &reply {
                ApiReply::Ping { id, .. } => *id,
                ApiReply::Read { id, .. } => *id,
                ApiReply::Write { id, .. } => *id,
                ApiReply::Error { id, .. } => *id,
                ApiReply::Leave => return Ok(reply),
            };
            if id == req_id {
                return Ok(reply);
            }
            pf_debug!(self.id; "discarding stale reply for request {}", id);
        }
    }

    fn take_req_id(&mut self) -> RequestId {
        self.next_req += 1;
        self.next_req
    }

    /// Probes the server for liveness.
    pub async fn ping(&mut self) -> Result<bool, BayouError> {
        let req_id = self.take_req_id();
        match self.do_rpc(ApiRequest::Ping { id: req_id }, req_id).await? {
            ApiReply::Ping { alive, .. } => Ok(alive),
            reply => Err(BayouError(format!("unexpected reply {:?}", reply))),
        }
    }

    /// Snapshot-reads rows from the full store, or from the committed store
    /// if `from_commit` is set.
    pub async fn read(
        &mut self,
        query: impl Into<String>,
        from_commit: bool,
    ) -> Result<Vec<Row>, BayouError> {
        let req_id = self.take_req_id();
        let req = ApiRequest::Read {
            id: req_id,
            query: query.into(),
            from_commit,
        };
        match self.do_rpc(req, req_id).await? {
            ApiReply::Read { rows, .. } => Ok(rows),
            ApiReply::Error { msg, .. } => Err(BayouError(msg)),
            reply => Err(BayouError(format!("unexpected reply {:?}", reply))),
        }
    }

    /// Submits one write with its undo statement, dependency check, and
    /// merge procedure. Returns `(has_conflict, was_resolved)`; a conflict
    /// that stayed unresolved is an application-level failure, but the
    /// tentative log preserves the write for audit.
    pub async fn write(
        &mut self,
        write_op: impl Into<String>,
        undo_op: impl Into<String>,
        check_op: impl Into<String>,
        merge_op: impl Into<String>,
    ) -> Result<(bool, bool), BayouError> {
        let req_id = self.take_req_id();
        let req = ApiRequest::Write {
            id: req_id,
            nonce: rand::random(),
            write_op: write_op.into(),
            undo_op: undo_op.into(),
            check_op: check_op.into(),
            merge_op: merge_op.into(),
        };
        match self.do_rpc(req, req_id).await? {
            ApiReply::Write {
                has_conflict,
                was_resolved,
                ..
            } => Ok((has_conflict, was_resolved)),
            ApiReply::Error { msg, .. } => Err(BayouError(msg)),
            reply => Err(BayouError(format!("unexpected reply {:?}", reply))),
        }
    }

    /// Sends a leave notification and forgets the connection.
    pub async fn leave(mut self) -> Result<(), BayouError> {
        let mut sent = self.api_stub.send_req(Some(&ApiRequest::Leave))?;
        while !sent {
            sent = self.api_stub.send_req(None)?;
        }
        while self.api_stub.recv_reply().await? != ApiReply::Leave {}
        pf_debug!(self.id; "left server connection");
        self.api_stub.forget();
        Ok(())
    }

    /// Claims a room at the provided day and hour. The claim conflicts if
    /// any claim for the same slot is already visible, and room claims
    /// cannot be merged. The inserted row carries a unique claim tag and
    /// the undo deletes by that tag, so the undo reverses exactly this
    /// write's effect and nothing when the write was routed through its
    /// merge procedure.
    pub async fn claim_room(
        &mut self,
        name: &str,
        day: i64,
        hour: i64,
    ) -> Result<(bool, bool), BayouError> {
        let tag = format!("{}-{}", self.id, rand::random::<u64>());
        let write_op = format!(
            "INSERT INTO rooms name=\"{}\", day={}, hour={}, claim=\"{}\"",
            name, day, hour, tag
        );
        let undo_op =
            format!("DELETE FROM rooms WHERE claim=\"{}\"", tag);
        let check_op = format!(
            "NOT EXISTS rooms WHERE name=\"{}\" AND day={} AND hour={}",
            name, day, hour
        );
        self.write(write_op, undo_op, check_op, FALSE_QUERY).await
    }

    /// Returns the claim on the room with provided name at the provided
    /// time, if any. If `only_stable` is true, tentative claims are not
    /// considered.
    pub async fn check_room(
        &mut self,
        name: &str,
        day: i64,
        hour: i64,
        only_stable: bool,
    ) -> Result<Option<Room>, BayouError> {
        let query = format!(
            "SELECT * FROM rooms WHERE name=\"{}\" AND day={} AND hour={}",
            name, day, hour
        );
        let rows = self.read(query, only_stable).await?;
        match rows.first() {
            Some(row) => Ok(Some(Room::from_row(row)?)),
            None => Ok(None),
        }
    }
}
