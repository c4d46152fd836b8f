//! Bayou client API communication stub.

use std::net::SocketAddr;

use crate::client::ClientId;
use crate::server::{ApiReply, ApiRequest};
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_connect_with_retry, BayouError,
};

use bytes::BytesMut;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

/// Client API connection stub over one replica's external API port.
pub struct ClientApiStub {
    /// My client ID.
    id: ClientId,

    /// Read-half split of the TCP connection stream.
    conn_read: OwnedReadHalf,

    /// Write-half split of the TCP connection stream.
    conn_write: OwnedWriteHalf,

    /// Reply read buffer for cancellation safety.
    read_buf: BytesMut,

    /// Request write buffer for deadlock avoidance.
    write_buf: BytesMut,

    /// Request write buffer cursor at first unwritten byte.
    write_buf_cursor: usize,
}

impl ClientApiStub {
    /// Connects to the given server address and announces my client ID.
    pub async fn new_by_connect(
        id: ClientId,
        addr: SocketAddr,
    ) -> Result<Self, BayouError> {
        pf_debug!(id; "connecting to server '{}'...", addr);
        let mut stream = tcp_connect_with_retry(addr, 10).await?;
        stream.write_u64(id).await?; // send my client ID

        let (conn_read, conn_write) = stream.into_split();
        Ok(ClientApiStub {
            id,
            conn_read,
            conn_write,
            read_buf: BytesMut::with_capacity(8 + 1024),
            write_buf: BytesMut::with_capacity(8 + 1024),
            write_buf_cursor: 0,
        })
    }

    /// Sends a request to the established server connection. Returns:
    ///   - `Ok(true)` if successful
    ///   - `Ok(false)` if socket full and may block; in this case, the
    ///     input request is saved and the next calls to `send_req()` must
    ///     give arg `req == None` to retry until successful
    ///   - `Err(err)` if any unexpected error occurs
    pub fn send_req(
        &mut self,
        req: Option<&ApiRequest>,
    ) -> Result<bool, BayouError> {
        safe_tcp_write(
            &mut self.write_buf,
            &mut self.write_buf_cursor,
            &self.conn_write,
            req,
        )
    }

    /// Receives a reply from the established server connection.
    pub async fn recv_reply(&mut self) -> Result<ApiReply, BayouError> {
        let reply =
            safe_tcp_read(&mut self.read_buf, &mut self.conn_read).await?;
        pf_trace!(self.id; "recv reply {:?}", reply);
        Ok(reply)
    }

    /// Forgets about the write-half TCP connection, consuming the stub.
    pub fn forget(self) {
        self.conn_write.forget();
    }
}
