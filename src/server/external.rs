//! Server external client-facing API module.
//!
//! Clients connect over TCP, announce their chosen ID, and exchange
//! length-prefixed rmp-serde request/reply frames. One servant task runs per
//! connected client; all requests funnel into a single channel drained by
//! the replica's event loop.

use std::net::SocketAddr;

use crate::client::ClientId;
use crate::server::{ReplicaId, Row};
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry, BayouError,
};

use bytes::BytesMut;

use serde::{Deserialize, Serialize};

use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// External API request ID type.
pub type RequestId = u64;

/// Request received from client.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub enum ApiRequest {
    /// Liveness probe.
    Ping { id: RequestId },

    /// Snapshot read from the committed or the full store.
    Read {
        id: RequestId,
        query: String,
        from_commit: bool,
    },

    /// Accept one write with its undo statement, dependency check, and
    /// merge procedure. `undo_op` must reverse exactly the effect this
    /// write ends up having, whichever of `write_op` / `merge_op` gets
    /// applied; key it to the write's own unique row identity.
    Write {
        id: RequestId,
        nonce: u64,
        write_op: String,
        undo_op: String,
        check_op: String,
        merge_op: String,
    },

    /// Client leave notification.
    Leave,
}

/// Reply back to client.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub enum ApiReply {
    Ping {
        id: RequestId,
        alive: bool,
    },

    Read {
        id: RequestId,
        rows: Vec<Row>,
    },

    Write {
        id: RequestId,
        has_conflict: bool,
        was_resolved: bool,
    },

    /// State-store error propagated back to the caller.
    Error {
        id: RequestId,
        msg: String,
    },

    /// Reply to client leave notification.
    Leave,
}

/// The external client-facing API module.
pub(crate) struct ExternalApi {
    /// My replica ID.
    me: ReplicaId,

    /// Receiver side of the req channel.
    rx_req: mpsc::UnboundedReceiver<(ClientId, ApiRequest)>,

    /// Map from client ID -> sender side of its reply channel, shared with
    /// the client acceptor task.
    tx_replies:
        flashmap::ReadHandle<ClientId, mpsc::UnboundedSender<ApiReply>>,

    /// Join handle of the client acceptor task.
    _client_acceptor_handle: JoinHandle<()>,

    /// Map from client ID -> client servant task join handles, shared with
    /// the client acceptor task.
    _client_servant_handles: flashmap::ReadHandle<ClientId, JoinHandle<()>>,
}

// ExternalApi public API implementation
impl ExternalApi {
    /// Creates a new external API module. Spawns the client acceptor task.
    /// Creates a req channel for buffering incoming client requests.
    pub(crate) async fn new_and_setup(
        me: ReplicaId,
        api_addr: SocketAddr,
    ) -> Result<Self, BayouError> {
        let (tx_req, rx_req) = mpsc::unbounded_channel();

        let (tx_replies_write, tx_replies_read) =
            flashmap::new::<ClientId, mpsc::UnboundedSender<ApiReply>>();

        let (client_servant_handles_write, client_servant_handles_read) =
            flashmap::new::<ClientId, JoinHandle<()>>();

        let client_listener = tcp_bind_with_retry(api_addr, 10).await?;
        let mut acceptor = ClientAcceptorTask::new(
            me,
            tx_req,
            client_listener,
            tx_replies_write,
            client_servant_handles_write,
        );
        let client_acceptor_handle =
            tokio::spawn(async move { acceptor.run().await });

        Ok(ExternalApi {
            me,
            rx_req,
            tx_replies: tx_replies_read,
            _client_acceptor_handle: client_acceptor_handle,
            _client_servant_handles: client_servant_handles_read,
        })
    }

    /// Waits for the next client request.
    pub(crate) async fn get_req(
        &mut self,
    ) -> Result<(ClientId, ApiRequest), BayouError> {
        match self.rx_req.recv().await {
            Some((client, req)) => Ok((client, req)),
            None => logged_err!(self.me; "req channel has been closed"),
        }
    }

    /// Sends a reply back to client by sending to its reply channel.
    pub(crate) fn send_reply(
        &mut self,
        reply: ApiReply,
        client: ClientId,
    ) -> Result<(), BayouError> {
        let tx_replies_guard = self.tx_replies.guard();
        match tx_replies_guard.get(&client) {
            Some(tx_reply) => {
                tx_reply.send(reply).map_err(BayouError::msg)?;
                Ok(())
            }
            None => logged_err!(self.me;
                "client {} not found among connected ones", client),
        }
    }
}

/// ExternalApi client acceptor task.
struct ClientAcceptorTask {
    me: ReplicaId,

    tx_req: mpsc::UnboundedSender<(ClientId, ApiRequest)>,
    client_listener: TcpListener,

    tx_replies:
        flashmap::WriteHandle<ClientId, mpsc::UnboundedSender<ApiReply>>,
    client_servant_handles: flashmap::WriteHandle<ClientId, JoinHandle<()>>,

    tx_exit: mpsc::UnboundedSender<ClientId>,
    rx_exit: mpsc::UnboundedReceiver<ClientId>,
}

impl ClientAcceptorTask {
    /// Creates the client acceptor task.
    fn new(
        me: ReplicaId,
        tx_req: mpsc::UnboundedSender<(ClientId, ApiRequest)>,
        client_listener: TcpListener,
        tx_replies: flashmap::WriteHandle<
            ClientId,
            mpsc::UnboundedSender<ApiReply>,
        >,
        client_servant_handles: flashmap::WriteHandle<ClientId, JoinHandle<()>>,
    ) -> Self {
        let (tx_exit, rx_exit) = mpsc::unbounded_channel();

        ClientAcceptorTask {
            me,
            tx_req,
            client_listener,
            tx_replies,
            client_servant_handles,
            tx_exit,
            rx_exit,
        }
    }

    /// Accepts a new client connection.
    async fn accept_new_client(
        &mut self,
        mut stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), BayouError> {
        let id = stream.read_u64().await; // receive client's ID
        if let Err(e) = id {
            return logged_err!(self.me; "error receiving new client ID: {}", e);
        }
        let id = id.unwrap();

        let mut tx_replies_guard = self.tx_replies.guard();
        if tx_replies_guard.contains_key(&id) {
            return logged_err!(self.me; "duplicate client ID listened: {}", id);
        }
        let (tx_reply, rx_reply) = mpsc::unbounded_channel();
        tx_replies_guard.insert(id, tx_reply);

        let mut servant = ClientServantTask::new(
            self.me,
            id,
            addr,
            stream,
            self.tx_req.clone(),
            rx_reply,
            self.tx_exit.clone(),
        );
        let client_servant_handle =
            tokio::spawn(async move { servant.run().await });
        let mut client_servant_handles_guard =
            self.client_servant_handles.guard();
        client_servant_handles_guard.insert(id, client_servant_handle);

        pf_debug!(self.me; "accepted new client {}", id);
        Ok(())
    }

    /// Removes handles of a left client connection.
    fn remove_left_client(&mut self, id: ClientId) -> Result<(), BayouError> {
        let mut tx_replies_guard = self.tx_replies.guard();
        if !tx_replies_guard.contains_key(&id) {
            return logged_err!(self.me; "client {} not found among connected ones",
                                        id);
        }
        tx_replies_guard.remove(id);

        let mut client_servant_handles_guard =
            self.client_servant_handles.guard();
        client_servant_handles_guard.remove(id);

        Ok(())
    }

    /// Starts the client acceptor task loop.
    async fn run(&mut self) {
        pf_debug!(self.me; "client_acceptor task spawned");

        let local_addr = self.client_listener.local_addr().unwrap();
        pf_info!(self.me; "accepting clients on '{}'", local_addr);

        loop {
            tokio::select! {
                // new client connection accepted
                accepted = self.client_listener.accept() => {
                    if let Err(e) = accepted {
                        pf_warn!(self.me; "error accepting client connection: {}", e);
                        continue;
                    }
                    let (stream, addr) = accepted.unwrap();
                    if let Err(e) = self.accept_new_client(
                        stream,
                        addr,
                    ).await {
                        pf_error!(self.me; "error accepting new client: {}", e);
                    }
                },

                // a client servant task exits
                id = self.rx_exit.recv() => {
                    let id = id.unwrap();
                    if let Err(e) = self.remove_left_client(
                        id,
                    ) {
                        pf_error!(self.me; "error removing left client {}: {}", id, e);
                    }
                },
            }
        }
    }
}

/// ExternalApi per-client servant task.
struct ClientServantTask {
    /// My replica ID.
    me: ReplicaId,
    /// Corresponding client's ID.
    id: ClientId,
    /// Corresponding client's address.
    addr: SocketAddr,

    conn_read: OwnedReadHalf,
    conn_write: OwnedWriteHalf,

    tx_req: mpsc::UnboundedSender<(ClientId, ApiRequest)>,
    read_buf: BytesMut,

    rx_reply: mpsc::UnboundedReceiver<ApiReply>,
    write_buf: BytesMut,
    write_buf_cursor: usize,
    retrying: bool,

    tx_exit: mpsc::UnboundedSender<ClientId>,
}

impl ClientServantTask {
    /// Creates a per-client servant task.
    fn new(
        me: ReplicaId,
        id: ClientId,
        addr: SocketAddr,
        conn: TcpStream,
        tx_req: mpsc::UnboundedSender<(ClientId, ApiRequest)>,
        rx_reply: mpsc::UnboundedReceiver<ApiReply>,
        tx_exit: mpsc::UnboundedSender<ClientId>,
    ) -> Self {
        let (conn_read, conn_write) = conn.into_split();

        ClientServantTask {
            me,
            id,
            addr,
            conn_read,
            conn_write,
            tx_req,
            read_buf: BytesMut::with_capacity(8 + 1024),
            rx_reply,
            write_buf: BytesMut::with_capacity(8 + 1024),
            write_buf_cursor: 0,
            retrying: false,
            tx_exit,
        }
    }

    /// Writes a reply through the TcpStream.
    fn write_reply(
        write_buf: &mut BytesMut,
        write_buf_cursor: &mut usize,
        conn_write: &OwnedWriteHalf,
        reply: Option<&ApiReply>,
    ) -> Result<bool, BayouError> {
        safe_tcp_write(write_buf, write_buf_cursor, conn_write, reply)
    }

    /// Reads a request from the TcpStream.
    async fn read_req(
        read_buf: &mut BytesMut,
        conn_read: &mut OwnedReadHalf,
    ) -> Result<ApiRequest, BayouError> {
        safe_tcp_read(read_buf, conn_read).await
    }

    /// Starts a per-client servant task loop.
    async fn run(&mut self) {
        pf_debug!(self.me; "client_servant task for {} '{}' spawned",
                           self.id, self.addr);

        loop {
            tokio::select! {
                // gets a reply to send back
                reply = self.rx_reply.recv(), if !self.retrying => {
                    match reply {
                        Some(reply) => {
                            match Self::write_reply(
                                &mut self.write_buf,
                                &mut self.write_buf_cursor,
                                &self.conn_write,
                                Some(&reply),
                            ) {
                                Ok(true) => {
                                    // pf_trace!(self.me; "replied -> {} reply {:?}", self.id, reply);
                                }
                                Ok(false) => {
                                    pf_debug!(self.me; "should start retrying reply send -> {}", self.id);
                                    self.retrying = true;
                                }
                                Err(e) => {
                                    pf_debug!(self.me; "error replying -> {}: {}", self.id, e);
                                }
                            }
                        },

                        None => break, // channel gets closed and no messages remain
                    }
                },

                // retrying last unsuccessful send
                _ = self.conn_write.writable(), if self.retrying => {
                    match Self::write_reply(
                        &mut self.write_buf,
                        &mut self.write_buf_cursor,
                        &self.conn_write,
                        None,
                    ) {
                        Ok(true) => {
                            pf_debug!(self.me; "finished retrying last reply send -> {}", self.id);
                            self.retrying = false;
                        }
                        Ok(false) => {
                            pf_debug!(self.me; "still should retry last reply send -> {}", self.id);
                        }
                        Err(e) => {
                            pf_debug!(self.me; "error retrying last reply send -> {}: {}", self.id, e);
                        }
                    }
                },

                // receives new request from client
                req = Self::read_req(&mut self.read_buf, &mut self.conn_read) => {
                    match req {
                        Ok(ApiRequest::Leave) => {
                            // client leaving, send dummy reply and break
                            if let Err(e) = Self::write_reply(
                                &mut self.write_buf,
                                &mut self.write_buf_cursor,
                                &self.conn_write,
                                Some(&ApiReply::Leave),
                            ) {
                                pf_debug!(self.me; "error replying -> {}: {}", self.id, e);
                            } else { // NOTE: skips `WouldBlock` error check here
                                pf_debug!(self.me; "client {} has left", self.id);
                            }
                            break;
                        },

                        Ok(req) => {
                            // pf_trace!(self.me; "request <- {} req {:?}", self.id, req);
                            if let Err(e) = self.tx_req.send((self.id, req)) {
                                pf_error!(self.me; "error sending to tx_req for {}: {}", self.id, e);
                            }
                        },

                        Err(_e) => {
                            break; // probably the client exited ungracefully
                        }
                    }
                },
            }
        }

        if let Err(e) = self.tx_exit.send(self.id) {
            pf_error!(self.me; "error sending exit signal for {}: {}", self.id, e);
        }
        pf_debug!(self.me; "client_servant task for {} '{}' exited",
                           self.id, self.addr);
    }
}
