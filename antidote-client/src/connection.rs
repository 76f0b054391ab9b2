//! Connection management and request dispatch.
//!
//! Responses carry no request identifier, so they are matched to requests
//! by order: one request is outstanding at a time, and each inbound frame
//! resolves the oldest pending slot.
//!
//! ```text
//! caller ─► turn lock ─► mpsc ─► writer task ─► socket
//!                                   │ push slot
//!                                   ▼
//!                           pending (VecDeque) ◄─ pop front ◄─ reader task ◄─ socket
//! ```
//!
//! A request that times out leaves its slot queued. The late response then
//! lands in the abandoned slot and is discarded instead of being handed to
//! the next caller.

use crate::config::ConnectionConfig;
use crate::error::ClientError;
use crate::transport::{self, FrameReader, FrameWriter};
use antidote_protocol::{
    decode_response, CommitTime, Encoder, Frame, MessageCode, ProtocolError, Request, Response,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

type Slot = oneshot::Sender<Result<Frame, ClientError>>;

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// A frame handed to the writer task together with its completion slot.
struct Outbound {
    frame: Bytes,
    reply: Slot,
}

struct DispatchTable {
    state: ConnectionState,
    /// Completion slots in send order.
    pending: VecDeque<Slot>,
}

/// State shared between the connection handle and its I/O tasks.
struct Shared {
    id: Uuid,
    table: Mutex<DispatchTable>,
    /// Wakes the reader task when the connection is torn down elsewhere.
    shutdown: Notify,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        self.table.lock().state
    }

    /// Marks the connection closed and fails every pending slot.
    ///
    /// `cause` goes to the oldest slot, whose response was being read when
    /// the connection broke. The others fail with `ConnectionClosed`.
    fn teardown(&self, cause: Option<ClientError>) {
        let drained: Vec<Slot> = {
            let mut table = self.table.lock();
            if table.state == ConnectionState::Closed {
                return;
            }
            table.state = ConnectionState::Closed;
            table.pending.drain(..).collect()
        };
        tracing::debug!(conn = %self.id, "Closed, failing {} pending requests", drained.len());
        let mut cause = cause;
        for slot in drained {
            let err = cause.take().unwrap_or(ClientError::ConnectionClosed);
            let _ = slot.send(Err(err));
        }
        self.shutdown.notify_one();
    }
}

/// A connection to an Antidote server.
pub struct Connection {
    config: ConnectionConfig,
    shared: Arc<Shared>,
    /// Held for a whole round trip; waiters are served in arrival order.
    turn: tokio::sync::Mutex<()>,
    /// Taken on close, which stops the writer task.
    outbound: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
    /// Commit time of the latest transaction committed through this
    /// connection.
    last_commit: Mutex<Option<CommitTime>>,
}

impl Connection {
    /// Connects to the server named by `config`.
    pub async fn connect(config: ConnectionConfig) -> Result<Self, ClientError> {
        let stream = transport::open(&config.host, config.port, config.connect_timeout).await?;
        let conn = Self::from_stream(stream, config);
        tracing::debug!(conn = %conn.id(), "Connected");
        Ok(conn)
    }

    /// Runs the protocol over an already established stream.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn from_stream<S>(stream: S, config: ConnectionConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let shared = Arc::new(Shared {
            id: Uuid::new_v4(),
            table: Mutex::new(DispatchTable {
                state: ConnectionState::Connecting,
                pending: VecDeque::new(),
            }),
            shutdown: Notify::new(),
        });

        let (reader, writer) = transport::split(stream, config.max_frame_size);
        let (tx, rx) = mpsc::unbounded_channel();
        let reader_task = tokio::spawn(read_loop(reader, shared.clone()));
        let writer_task = tokio::spawn(write_loop(writer, rx, shared.clone()));
        shared.table.lock().state = ConnectionState::Open;

        Self {
            config,
            shared,
            turn: tokio::sync::Mutex::new(()),
            outbound: Mutex::new(Some(tx)),
            reader_task,
            writer_task,
            last_commit: Mutex::new(None),
        }
    }

    /// Identifier used in this connection's log lines.
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Returns whether the connection is open.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Returns the number of requests awaiting a response, including
    /// abandoned ones whose response has not arrived yet.
    pub fn pending_count(&self) -> usize {
        self.shared.table.lock().pending.len()
    }

    /// Sends a request and waits for its response, using the configured
    /// request timeout.
    pub async fn request(&self, request: &Request) -> Result<Response, ClientError> {
        self.request_with_timeout(request, self.config.request_timeout)
            .await
    }

    /// Sends a request and waits at most `timeout` for its response.
    ///
    /// The timeout covers time spent queued behind other callers. On expiry
    /// the caller stops waiting; the server may still apply the request.
    /// An `ErrorResp` from the server is returned as [`ClientError::Server`].
    pub async fn request_with_timeout(
        &self,
        request: &Request,
        timeout: Duration,
    ) -> Result<Response, ClientError> {
        let frame = Encoder::encode_request(request)?.freeze();
        let code = request.code();

        let frame = tokio::time::timeout(timeout, self.round_trip(frame, code))
            .await
            .map_err(|_| {
                tracing::debug!(conn = %self.id(), "Request {} timed out", code);
                ClientError::Timeout
            })??;

        let expected = request.response_code();
        if frame.code != expected && frame.code != MessageCode::ErrorResp {
            // Order-based matching is no longer trustworthy.
            tracing::warn!(
                conn = %self.id(),
                "Expected {} in reply to {}, got {}; closing connection",
                expected,
                code,
                frame.code
            );
            self.shared.teardown(None);
            return Err(ProtocolError::UnexpectedMessage {
                expected,
                actual: frame.code,
            }
            .into());
        }

        match decode_response(frame)? {
            Response::Error(err) => Err(ClientError::Server {
                code: err.code,
                message: err.message,
            }),
            response => Ok(response),
        }
    }

    async fn round_trip(&self, frame: Bytes, code: MessageCode) -> Result<Frame, ClientError> {
        let _turn = self.turn.lock().await;
        if !self.is_connected() {
            return Err(ClientError::ConnectionClosed);
        }

        let (tx, rx) = oneshot::channel();
        {
            let outbound = self.outbound.lock();
            let sender = outbound.as_ref().ok_or(ClientError::ConnectionClosed)?;
            tracing::debug!(conn = %self.id(), "Sending {} ({} bytes)", code, frame.len());
            sender
                .send(Outbound { frame, reply: tx })
                .map_err(|_| ClientError::ConnectionClosed)?;
        }

        let frame = rx.await.map_err(|_| ClientError::ConnectionClosed)??;
        tracing::debug!(
            conn = %self.id(),
            "Received {} ({} bytes)",
            frame.code,
            frame.declared_len()
        );
        Ok(frame)
    }

    /// Closes the connection. Idempotent.
    ///
    /// Pending and queued requests fail with
    /// [`ClientError::ConnectionClosed`].
    pub fn close(&self) {
        let sender = self.outbound.lock().take();
        if sender.is_none() {
            return;
        }
        {
            let mut table = self.shared.table.lock();
            if table.state == ConnectionState::Open {
                table.state = ConnectionState::Closing;
            }
        }
        tracing::debug!(conn = %self.id(), "Closing connection...");
        // Dropping the sender lets the writer task shut down the socket.
        drop(sender);
        self.shared.teardown(None);
    }

    pub fn last_commit_time(&self) -> Option<CommitTime> {
        self.last_commit.lock().clone()
    }

    pub(crate) fn record_commit(&self, time: &CommitTime) {
        *self.last_commit.lock() = Some(time.clone());
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

async fn write_loop<W>(
    mut writer: FrameWriter<W>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    shared: Arc<Shared>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(Outbound { frame, reply }) = rx.recv().await {
        {
            let mut table = shared.table.lock();
            if table.state != ConnectionState::Open {
                let _ = reply.send(Err(ClientError::ConnectionClosed));
                continue;
            }
            table.pending.push_back(reply);
        }

        if let Err(e) = writer.send(&frame).await {
            tracing::warn!(conn = %shared.id, "Write failed: {}", e);
            // The slot just pushed is the newest one.
            let slot = shared.table.lock().pending.pop_back();
            if let Some(slot) = slot {
                let _ = slot.send(Err(ClientError::Io(e)));
            }
            shared.teardown(None);
            return;
        }
    }

    let _ = writer.shutdown().await;
    tracing::debug!(conn = %shared.id, "Writer stopped");
}

async fn read_loop<R>(mut reader: FrameReader<R>, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let received = tokio::select! {
            _ = shared.shutdown.notified() => break,
            received = reader.receive() => received,
        };

        match received {
            Ok(Some(frame)) => {
                let slot = shared.table.lock().pending.pop_front();
                match slot {
                    Some(slot) => {
                        if slot.send(Ok(frame)).is_err() {
                            tracing::debug!(
                                conn = %shared.id,
                                "Discarding response to an abandoned request"
                            );
                        }
                    }
                    None => {
                        tracing::warn!(
                            conn = %shared.id,
                            "Unsolicited {} frame; closing connection",
                            frame.code
                        );
                        shared.teardown(None);
                        break;
                    }
                }
            }
            Ok(None) => {
                tracing::debug!(conn = %shared.id, "Server closed the connection");
                shared.teardown(None);
                break;
            }
            Err(e) => {
                tracing::warn!(conn = %shared.id, "Read failed: {}", e);
                shared.teardown(Some(e));
                break;
            }
        }
    }
    tracing::debug!(conn = %shared.id, "Reader stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use antidote_protocol::{
        BoundObject, CrdtType, ErrorCode, ErrorResponse, TransactionDescriptor, Value,
    };
    use tokio::io::DuplexStream;
    use tokio_test::{assert_pending, assert_ready, task};

    /// Server side of an in-memory connection.
    struct MockServer {
        reader: FrameReader<tokio::io::ReadHalf<DuplexStream>>,
        writer: FrameWriter<tokio::io::WriteHalf<DuplexStream>>,
    }

    impl MockServer {
        async fn expect(&mut self) -> Request {
            let frame = self.reader.receive().await.unwrap().unwrap();
            antidote_protocol::decode_request(frame).unwrap()
        }

        async fn reply(&mut self, response: Response) {
            let encoded = Encoder::encode_response(&response).unwrap();
            self.writer.send(&encoded).await.unwrap();
        }
    }

    fn pair(config: ConnectionConfig) -> (Connection, MockServer) {
        let (client, server) = tokio::io::duplex(4096);
        let (reader, writer) = transport::split(server, config.max_frame_size);
        (
            Connection::from_stream(client, config),
            MockServer { reader, writer },
        )
    }

    fn start() -> Request {
        Request::StartTransaction { timestamp: None }
    }

    fn started(n: u8) -> Response {
        Response::StartTransaction(Ok(TransactionDescriptor::new(vec![n])))
    }

    #[tokio::test]
    async fn test_request_response() {
        let req = start();
        let (conn, mut server) = pair(ConnectionConfig::default());
        assert!(conn.is_connected());

        let (response, ()) = tokio::join!(conn.request(&req), async {
            assert_eq!(server.expect().await, start());
            server.reply(started(1)).await;
        });
        assert_eq!(response.unwrap(), started(1));
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_fifo_correlation() {
        let conn = Arc::new(pair_with_echo_server());

        let mut handles = Vec::new();
        for n in 0..8u8 {
            let conn = conn.clone();
            handles.push(tokio::spawn(async move {
                let request = Request::CommitTransaction {
                    descriptor: TransactionDescriptor::new(vec![n]),
                };
                (n, conn.request(&request).await.unwrap())
            }));
        }
        for handle in handles {
            let (n, response) = handle.await.unwrap();
            assert_eq!(
                response,
                Response::Commit(Ok(CommitTime::new(vec![n]))),
                "response for request {} misrouted",
                n
            );
        }
    }

    /// Connection whose server answers each commit with its own descriptor
    /// bytes as the commit time.
    fn pair_with_echo_server() -> Connection {
        let (conn, mut server) = pair(ConnectionConfig::default());
        tokio::spawn(async move {
            while let Ok(Some(frame)) = server.reader.receive().await {
                let request = antidote_protocol::decode_request(frame).unwrap();
                if let Request::CommitTransaction { descriptor } = request {
                    let time = CommitTime::new(descriptor.as_bytes().clone());
                    server.reply(Response::Commit(Ok(time))).await;
                }
            }
        });
        conn
    }

    #[tokio::test]
    async fn test_second_request_waits_for_first() {
        let req = start();
        let (conn, mut server) = pair(ConnectionConfig::default());

        let mut first = task::spawn(conn.request(&req));
        let mut second = task::spawn(conn.request(&req));
        assert_pending!(first.poll());
        assert_pending!(second.poll());

        // Only the first request reaches the server.
        assert_eq!(server.expect().await, start());
        assert_pending!(second.poll());

        server.reply(started(1)).await;
        while !first.is_woken() {
            tokio::task::yield_now().await;
        }
        assert_eq!(assert_ready!(first.poll()).unwrap(), started(1));

        assert_pending!(second.poll());
        assert_eq!(server.expect().await, start());
        server.reply(started(2)).await;
        while !second.is_woken() {
            tokio::task::yield_now().await;
        }
        assert_eq!(assert_ready!(second.poll()).unwrap(), started(2));
    }

    #[tokio::test]
    async fn test_timeout_discards_late_response() {
        let req = start();
        let (conn, mut server) = pair(ConnectionConfig::default());

        let result = conn
            .request_with_timeout(&start(), Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(ClientError::Timeout)));
        assert_eq!(server.expect().await, start());
        assert_eq!(conn.pending_count(), 1);

        // The late answer must not be delivered to the next request.
        let (response, ()) = tokio::join!(conn.request(&req), async {
            server.reply(started(1)).await;
            assert_eq!(server.expect().await, start());
            server.reply(started(2)).await;
        });
        assert_eq!(response.unwrap(), started(2));
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_close_fails_pending_request() {
        let req = start();
        let (conn, mut server) = pair(ConnectionConfig::default());

        let (result, ()) = tokio::join!(conn.request(&req), async {
            server.expect().await;
            conn.close();
        });
        assert!(matches!(result, Err(ClientError::ConnectionClosed)));
        assert_eq!(conn.state(), ConnectionState::Closed);

        // Idempotent, and later requests fail without I/O.
        conn.close();
        assert!(matches!(
            conn.request(&req).await,
            Err(ClientError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_close_shuts_down_socket() {
        let (conn, mut server) = pair(ConnectionConfig::default());
        conn.close();
        assert!(server.reader.receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_server_hangup_fails_pending_request() {
        let req = start();
        let (conn, mut server) = pair(ConnectionConfig::default());

        let (result, ()) = tokio::join!(conn.request(&req), async {
            server.expect().await;
            server.writer.shutdown().await.unwrap();
        });
        assert!(matches!(result, Err(ClientError::ConnectionClosed)));
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn test_error_response_is_server_error() {
        let req = start();
        let (conn, mut server) = pair(ConnectionConfig::default());

        let (result, ()) = tokio::join!(conn.request(&req), async {
            server.expect().await;
            server
                .reply(Response::Error(ErrorResponse {
                    code: ErrorCode::Timeout,
                    message: "timeout waiting for snapshot".into(),
                }))
                .await;
        });
        match result {
            Err(ClientError::Server { code, message }) => {
                assert_eq!(code, ErrorCode::Timeout);
                assert_eq!(message, "timeout waiting for snapshot");
            }
            other => panic!("expected server error, got {:?}", other),
        }
        // A server refusal leaves the connection usable.
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn test_mismatched_response_closes_connection() {
        let req = start();
        let (conn, mut server) = pair(ConnectionConfig::default());

        let (result, ()) = tokio::join!(conn.request(&req), async {
            server.expect().await;
            server.reply(Response::Operation(Ok(()))).await;
        });
        assert!(matches!(
            result,
            Err(ClientError::Protocol(ProtocolError::UnexpectedMessage { .. }))
        ));
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn test_unsolicited_frame_closes_connection() {
        let (conn, mut server) = pair(ConnectionConfig::default());
        server.reply(started(9)).await;

        for _ in 0..100 {
            if !conn.is_connected() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_oversized_response_closes_connection() {
        let config = ConnectionConfig::default().with_max_frame_size(64);
        let (conn, mut server) = pair(config);

        let big = Response::ReadObjects(Ok(vec![Value::Register(Bytes::from(vec![1u8; 128]))]));
        let objects = vec![BoundObject::new("k", CrdtType::LwwRegister, "b").unwrap()];
        let request = Request::ReadObjects {
            objects,
            descriptor: TransactionDescriptor::new(vec![1]),
        };
        let (result, ()) = tokio::join!(conn.request(&request), async {
            server.expect().await;
            server.reply(big).await;
        });
        assert!(matches!(
            result,
            Err(ClientError::Protocol(ProtocolError::FrameTooLarge { max: 64, .. }))
        ));
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn test_malformed_frame_reaches_caller() {
        let req = start();
        let (conn, mut server) = pair(ConnectionConfig::default());

        let (result, ()) = tokio::join!(conn.request(&req), async {
            server.expect().await;
            // Length 1, message code 99.
            server.writer.send(&[0, 0, 0, 1, 99]).await.unwrap();
        });
        let err = result.unwrap_err();
        assert!(
            matches!(
                err,
                ClientError::Protocol(ProtocolError::UnknownMessageCode(99))
            ),
            "unexpected error: {:?}",
            err
        );
        assert!(!err.is_network_failure());
        assert!(!conn.is_connected());

        // Later requests see a closed connection.
        let req = start();
        assert!(matches!(
            conn.request(&req).await,
            Err(ClientError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_eof_inside_frame_is_io_error() {
        let req = start();
        let (conn, mut server) = pair(ConnectionConfig::default());

        let (result, ()) = tokio::join!(conn.request(&req), async {
            server.expect().await;
            // Header promises 10 bytes, then the server goes away.
            server.writer.send(&[0, 0, 0, 10, 104, 8]).await.unwrap();
            server.writer.shutdown().await.unwrap();
        });
        match result {
            Err(ClientError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
            other => panic!("expected I/O error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_request_over_tcp() {
        let req = start();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (mut reader, mut writer) = transport::split(socket, antidote_protocol::MAX_FRAME_SIZE);
            let frame = reader.receive().await.unwrap().unwrap();
            assert_eq!(frame.code, MessageCode::StartTransaction);
            let encoded = Encoder::encode_response(&started(7)).unwrap();
            writer.send(&encoded).await.unwrap();
        });

        let conn = Connection::connect(ConnectionConfig::new("127.0.0.1", port))
            .await
            .unwrap();
        assert_eq!(conn.request(&req).await.unwrap(), started(7));
        conn.close();
    }

    #[tokio::test]
    async fn test_write_after_peer_gone() {
        let req = start();
        let (client, server) = tokio::io::duplex(64);
        drop(server);
        let conn = Connection::from_stream(client, ConnectionConfig::default());

        let err = conn.request(&req).await.unwrap_err();
        assert!(err.is_network_failure(), "unexpected error: {:?}", err);
    }

    #[tokio::test]
    async fn test_response_split_across_writes() {
        let req = start();
        let (conn, mut server) = pair(ConnectionConfig::default());
        let encoded = Encoder::encode_response(&started(3)).unwrap();

        let (result, ()) = tokio::join!(conn.request(&req), async {
            server.expect().await;
            server.writer.send(&encoded[..3]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            server.writer.send(&encoded[3..]).await.unwrap();
        });
        assert_eq!(result.unwrap(), started(3));
    }

    #[tokio::test]
    async fn test_dropped_request_keeps_order() {
        let req = start();
        let (conn, mut server) = pair(ConnectionConfig::default());

        {
            let mut abandoned = task::spawn(conn.request(&req));
            assert_pending!(abandoned.poll());
            assert_eq!(server.expect().await, start());
        }
        assert_eq!(conn.pending_count(), 1);

        let (response, ()) = tokio::join!(conn.request(&req), async {
            server.reply(started(1)).await;
            server.expect().await;
            server.reply(started(2)).await;
        });
        assert_eq!(response.unwrap(), started(2));
    }
}
