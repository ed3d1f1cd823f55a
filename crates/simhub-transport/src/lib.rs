// TCP transport for the simhub framing protocol.
//
// A `Connection` owns one socket. Writes are serialized behind an async mutex,
// reads go through a single buffered reader. `close` cancels reads at once and
// lets a frame already being written finish, bounded by `close_timeout`.
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use simhub_wire::{Frame, FrameDecoder, Kind, MARKER_END};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,
    #[error("peer ended the stream")]
    EndOfStream,
    #[error("framing error: {0}")]
    Wire(#[source] simhub_wire::Error),
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

impl From<simhub_wire::Error> for TransportError {
    fn from(err: simhub_wire::Error) -> Self {
        match err {
            simhub_wire::Error::EndOfStream => Self::EndOfStream,
            other => Self::Wire(other),
        }
    }
}

impl TransportError {
    /// True for the ways a peer normally goes away.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Closed | Self::EndOfStream)
    }
}

/// Transport-level configuration defaults.
///
/// ```
/// use simhub_transport::TransportConfig;
///
/// let config = TransportConfig::default();
/// assert_eq!(config.ack_max_attempts, 3);
/// ```
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub max_message_bytes: usize,
    pub ack_retry_interval: Duration,
    /// Total transmissions of an ack-requested message, the first included.
    pub ack_max_attempts: u32,
    pub close_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: simhub_wire::DEFAULT_MAX_MESSAGE_BYTES,
            ack_retry_interval: Duration::from_secs(10),
            ack_max_attempts: 3,
            close_timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,
}

/// One demultiplexed inbound message.
///
/// `message_id` is zero for ping and pong; `payload` is empty for everything
/// but data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub kind: Kind,
    pub message_id: u32,
    pub payload: Bytes,
}

impl Received {
    fn control(kind: Kind, message_id: u32) -> Self {
        Self {
            kind,
            message_id,
            payload: Bytes::new(),
        }
    }
}

/// TCP listener producing framed connections.
///
/// ```no_run
/// use simhub_transport::{TcpServer, TransportConfig};
///
/// async fn serve() -> simhub_transport::Result<()> {
///     let server = TcpServer::bind("127.0.0.1:0".parse().expect("addr"), TransportConfig::default()).await?;
///     let connection = server.accept().await?;
///     let _ = connection.receive().await?;
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct TcpServer {
    listener: TcpListener,
    config: TransportConfig,
}

impl TcpServer {
    pub async fn bind(addr: SocketAddr, config: TransportConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, config })
    }

    pub async fn accept(&self) -> Result<Connection> {
        let (stream, _) = self.listener.accept().await?;
        Connection::from_stream(stream, self.config.clone())
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

/// Framed, optionally acknowledged connection over one TCP socket.
///
/// Cloning is cheap; clones share the socket, the pending-ack table and the
/// closed flag.
#[derive(Debug, Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

#[derive(Debug)]
struct ConnectionInner {
    info: ConnectionInfo,
    config: TransportConfig,
    decoder: FrameDecoder,
    reader: Mutex<ReadState>,
    writer: Mutex<OwnedWriteHalf>,
    // message id -> acknowledged
    pending_acks: DashMap<u32, bool>,
    closed: AtomicBool,
    // Fires on close: pending reads and retry timers.
    cancel: CancellationToken,
    // Fires only when close times out behind a stalled write.
    abort_writes: CancellationToken,
}

#[derive(Debug)]
struct ReadState {
    half: OwnedReadHalf,
    buf: BytesMut,
}

impl Connection {
    pub async fn connect(addr: SocketAddr, config: TransportConfig) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Self::from_stream(stream, config)
    }

    pub fn from_stream(stream: TcpStream, config: TransportConfig) -> Result<Self> {
        stream.set_nodelay(true)?;
        let info = ConnectionInfo {
            peer_addr: stream.peer_addr()?,
            local_addr: stream.local_addr()?,
        };
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            inner: Arc::new(ConnectionInner {
                info,
                decoder: FrameDecoder::new(config.max_message_bytes),
                config,
                reader: Mutex::new(ReadState {
                    half: read_half,
                    buf: BytesMut::with_capacity(8 * 1024),
                }),
                writer: Mutex::new(write_half),
                pending_acks: DashMap::new(),
                closed: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                abort_writes: CancellationToken::new(),
            }),
        })
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.inner.info
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of ack-requested sends still waiting on their retry task.
    pub fn pending_ack_count(&self) -> usize {
        self.inner.pending_acks.len()
    }

    /// Sends one data message and returns its id.
    ///
    /// With `need_ack` the message is retransmitted every
    /// `ack_retry_interval` until the peer acknowledges it or
    /// `ack_max_attempts` transmissions have been made.
    pub async fn send(&self, payload: Bytes, need_ack: bool) -> Result<u32> {
        self.ensure_open()?;
        let message_id = self.next_message_id();
        let encoded = Frame::data(message_id, payload, need_ack).encode();
        if need_ack {
            self.inner.pending_acks.insert(message_id, false);
        }
        if let Err(err) = self.write_frame(&encoded).await {
            self.inner.pending_acks.remove(&message_id);
            return Err(err);
        }
        if need_ack {
            let connection = self.clone();
            tokio::spawn(async move {
                connection.retry_until_acked(message_id, encoded).await;
            });
        }
        Ok(message_id)
    }

    pub async fn send_ack(&self, message_id: u32) -> Result<()> {
        self.write_frame(&Frame::Ack { message_id }.encode()).await
    }

    pub async fn ping(&self) -> Result<()> {
        self.write_frame(&Frame::Ping.encode()).await
    }

    pub async fn pong(&self) -> Result<()> {
        self.write_frame(&Frame::Pong.encode()).await
    }

    /// Reads the next logical message.
    ///
    /// Pings are answered and acks are recorded before they are returned;
    /// ack-requested data is acknowledged once fully reassembled.
    pub async fn receive(&self) -> Result<Received> {
        self.ensure_open()?;
        let frame = tokio::select! {
            _ = self.inner.cancel.cancelled() => return Err(TransportError::Closed),
            frame = self.read_frame() => frame?,
        };
        match frame {
            Frame::Ping => {
                self.pong().await?;
                Ok(Received::control(Kind::Ping, 0))
            }
            Frame::Pong => Ok(Received::control(Kind::Pong, 0)),
            Frame::Ack { message_id } => {
                // Unknown ids are ignored so the table never grows from acks.
                if let Some(mut acked) = self.inner.pending_acks.get_mut(&message_id) {
                    *acked = true;
                }
                Ok(Received::control(Kind::Ack, message_id))
            }
            Frame::Data {
                message_id,
                need_ack,
                payload,
            } => {
                if need_ack {
                    self.send_ack(message_id).await?;
                }
                Ok(Received {
                    kind: Kind::Data,
                    message_id,
                    payload,
                })
            }
        }
    }

    /// Closes the connection once; later calls return immediately.
    ///
    /// In-flight reads are cancelled and new sends refused. A frame already
    /// being written may finish; the end marker follows it on the same write
    /// lock. If that does not happen within `close_timeout` the stalled write
    /// is aborted and the write side shut down without a marker.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cancel.cancel();
        let peer = self.inner.info.peer_addr;
        let farewell = async {
            let mut writer = self.inner.writer.lock().await;
            writer.write_all(&[MARKER_END]).await?;
            writer.shutdown().await
        };
        match tokio::time::timeout(self.inner.config.close_timeout, farewell).await {
            Ok(Ok(())) => tracing::debug!(%peer, "connection closed"),
            Ok(Err(err)) => tracing::debug!(%peer, error = %err, "close marker not delivered"),
            Err(_) => {
                tracing::debug!(%peer, "close marker timed out, aborting writes");
                self.inner.abort_writes.cancel();
                let shutdown = async {
                    let mut writer = self.inner.writer.lock().await;
                    writer.shutdown().await
                };
                let _ = tokio::time::timeout(self.inner.config.close_timeout, shutdown).await;
            }
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn next_message_id(&self) -> u32 {
        loop {
            let candidate = rand::random::<u32>();
            if !self.inner.pending_acks.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    async fn write_frame(&self, bytes: &[u8]) -> Result<()> {
        self.ensure_open()?;
        tokio::select! {
            _ = self.inner.abort_writes.cancelled() => Err(TransportError::Closed),
            result = async {
                let mut writer = self.inner.writer.lock().await;
                // Writers queued behind `close` must not follow the end marker.
                if self.is_closed() {
                    return Err(TransportError::Closed);
                }
                writer.write_all(bytes).await.map_err(TransportError::Io)
            } => result,
        }
    }

    async fn read_frame(&self) -> Result<Frame> {
        let mut reader = self.inner.reader.lock().await;
        let ReadState { half, buf } = &mut *reader;
        loop {
            if let Some(frame) = self.inner.decoder.decode(buf)? {
                return Ok(frame);
            }
            if half.read_buf(buf).await? == 0 {
                if buf.is_empty() {
                    return Err(TransportError::EndOfStream);
                }
                return Err(TransportError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-message",
                )));
            }
        }
    }

    async fn retry_until_acked(self, message_id: u32, encoded: Bytes) {
        let interval = self.inner.config.ack_retry_interval;
        let max_attempts = self.inner.config.ack_max_attempts.max(1);
        let mut attempts = 1;
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            let acked = self
                .inner
                .pending_acks
                .get(&message_id)
                .map(|entry| *entry)
                .unwrap_or(true);
            if acked {
                break;
            }
            if attempts >= max_attempts {
                metrics::counter!("simhub_ack_given_up_total").increment(1);
                tracing::debug!(message_id, attempts, "giving up on unacknowledged message");
                break;
            }
            attempts += 1;
            metrics::counter!("simhub_ack_retries_total").increment(1);
            if let Err(err) = self.write_frame(&encoded).await {
                tracing::debug!(message_id, error = %err, "retransmission failed");
                break;
            }
        }
        self.inner.pending_acks.remove(&message_id);
    }
}
