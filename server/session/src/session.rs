//! Per-connection session lifecycle and read/write driver.
//!
//! A [`Session`] owns one accepted socket from acceptance to teardown. It
//! negotiates the optional TLS layer, runs the self-perpetuating read loop
//! that feeds the reassembly buffer, and exposes `send` and an idempotent
//! `close`. One lock serializes `start` against `close`; the read loop and
//! `send` run outside it and treat "already closed" as a normal condition.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, SystemTime};

use keel_buffer::{BufferPool, PooledBuf};
use keel_wire::FrameCodec;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::deflector::Deflector;
use crate::error::SessionError;
use crate::handler::SessionHandler;
use crate::server::Server;
use crate::transport::{negotiate, IoStream, TlsContext};

/// Process-unique session key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Connecting,
    Active,
    Closed,
}

/// State guarded by the start/close lock.
struct Lifecycle {
    /// The accepted socket, present until `start` consumes it
    socket: Option<TcpStream>,
    state: State,
    /// Whether a read loop was ever spawned; decides who fires the
    /// disconnect notification
    started: bool,
}

/// One accepted TCP connection, from acceptance to teardown.
pub struct Session {
    id: SessionId,
    opened_at: SystemTime,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    config: Arc<EngineConfig>,
    pool: Arc<BufferPool>,
    codec: Arc<dyn FrameCodec>,
    handler: Arc<dyn SessionHandler>,
    tls: Option<Arc<TlsContext>>,
    lifecycle: Mutex<Lifecycle>,
    writer: Mutex<Option<WriteHalf<IoStream>>>,
    connected: AtomicBool,
    notified: AtomicBool,
    cancel: CancellationToken,
    me: Weak<Session>,
    owner: OnceLock<Weak<Server>>,
}

impl Session {
    /// Wrap a freshly accepted socket. The session does not read until
    /// [`Session::start`] is called.
    pub fn accept(
        socket: TcpStream,
        config: Arc<EngineConfig>,
        pool: Arc<BufferPool>,
        codec: Arc<dyn FrameCodec>,
        handler: Arc<dyn SessionHandler>,
        tls: Option<Arc<TlsContext>>,
    ) -> Result<Arc<Self>, SessionError> {
        let peer_addr = socket.peer_addr()?;
        let local_addr = socket.local_addr()?;

        Ok(Arc::new_cyclic(|me| Session {
            id: SessionId::generate(),
            opened_at: SystemTime::now(),
            peer_addr,
            local_addr,
            config,
            pool,
            codec,
            handler,
            tls,
            lifecycle: Mutex::new(Lifecycle {
                socket: Some(socket),
                state: State::Connecting,
                started: false,
            }),
            writer: Mutex::new(None),
            connected: AtomicBool::new(false),
            notified: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            me: me.clone(),
            owner: OnceLock::new(),
        }))
    }

    /// Configure the socket, negotiate the transport and arm the first read.
    ///
    /// No-op when the accepted socket was already consumed or the session
    /// closed before starting. On a negotiation failure the session is
    /// closed before the error returns.
    pub async fn start(&self) -> Result<(), SessionError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(socket) = lifecycle.socket.take() else {
            return Ok(());
        };

        self.apply_socket_options(&socket);

        let io = match negotiate(
            socket,
            self.tls.as_deref(),
            self.config.connect_timeout,
            self.peer_addr,
        )
        .await
        {
            Ok(io) => io,
            Err(err) => {
                lifecycle.state = State::Closed;
                self.connected.store(false, Ordering::SeqCst);
                drop(lifecycle);
                warn!(
                    session = %self.id,
                    peer = %self.peer_addr,
                    error = %err,
                    "transport negotiation failed; session closed"
                );
                self.notify_disconnected();
                return Err(err);
            }
        };

        let (reader, writer) = tokio::io::split(io);
        *self.writer.lock().await = Some(writer);

        // Fresh pooled buffers for this connection
        let scratch = self.pool.borrow();
        let deflector = Deflector::new(self.pool.borrow());

        lifecycle.state = State::Active;
        lifecycle.started = true;
        self.connected.store(true, Ordering::SeqCst);
        drop(lifecycle);

        info!(session = %self.id, peer = %self.peer_addr, "session started");

        let Some(session) = self.me.upgrade() else {
            return Err(SessionError::Closed);
        };
        tokio::spawn(async move {
            let runner = Arc::clone(&session);
            if let Err(err) = runner.read_loop(reader, scratch, deflector).await {
                error!(
                    session = %session.id,
                    peer = %session.peer_addr,
                    error = %err,
                    "session failed"
                );
            }
        });

        Ok(())
    }

    /// Tear the session down. Idempotent and safe to call from any task,
    /// including the read loop's own failure path.
    ///
    /// Stream teardown errors are logged and swallowed; the pooled buffers
    /// are returned by the read loop's cleanup, which this unblocks.
    pub async fn close(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.state == State::Closed {
            return;
        }
        lifecycle.state = State::Closed;
        lifecycle.socket = None;
        let started = lifecycle.started;
        self.connected.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        drop(lifecycle);

        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(err) = writer.shutdown().await {
                debug!(session = %self.id, error = %err, "stream teardown failed");
            }
        }

        info!(session = %self.id, peer = %self.peer_addr, "session closed");

        // A session that never armed a read loop has no cleanup task to
        // fire the notification
        if !started {
            self.notify_disconnected();
        }
    }

    /// Encode `payload` and write the full wire frame.
    ///
    /// Fails fast with [`SessionError::Closed`] when the session is not
    /// connected. A transport-level write failure closes the session and
    /// returns `Ok`; anything else propagates. Concurrent sends are
    /// serialized on the writer, each frame hits the wire contiguously.
    pub async fn send(&self, payload: &[u8]) -> Result<(), SessionError> {
        if !self.is_connected() {
            return Err(SessionError::Closed);
        }

        let wire = self.codec.encode(payload)?;

        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(SessionError::Closed);
        };

        let result = match self.config.send_timeout {
            Some(limit) => match tokio::time::timeout(limit, writer.write_all(&wire)).await {
                Ok(result) => result,
                Err(_) => Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "send timed out",
                )),
            },
            None => writer.write_all(&wire).await,
        };

        match result {
            Ok(()) => Ok(()),
            Err(err) if is_transport_fault(&err) => {
                drop(guard);
                debug!(
                    session = %self.id,
                    error = %err,
                    "send failed on dead transport; closing"
                );
                self.close().await;
                Ok(())
            }
            Err(err) => Err(SessionError::Io(err)),
        }
    }

    /// The process-unique session key.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// When the session object was constructed.
    pub fn opened_at(&self) -> SystemTime {
        self.opened_at
    }

    /// Remote endpoint, captured at acceptance and retained after close.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Local endpoint, captured at acceptance and retained after close.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether the session is currently active.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// The configured transport negotiation deadline.
    pub fn connect_timeout(&self) -> Duration {
        self.config.connect_timeout
    }

    /// The shared engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The server that accepted this session, if it is still alive.
    ///
    /// `None` for sessions constructed without a server, or after the
    /// server has been dropped; the reference is weak so sessions never
    /// keep their server alive.
    pub fn server(&self) -> Option<Arc<Server>> {
        self.owner.get().and_then(Weak::upgrade)
    }

    /// Record the accepting server. First caller wins; later calls are
    /// ignored.
    pub(crate) fn attach_server(&self, server: Weak<Server>) {
        let _ = self.owner.set(server);
    }

    fn apply_socket_options(&self, socket: &TcpStream) {
        if let Err(err) = socket.set_nodelay(self.config.no_delay) {
            warn!(session = %self.id, error = %err, "failed to set TCP_NODELAY");
        }
        if let Err(err) = socket.set_linger(self.config.linger) {
            warn!(session = %self.id, error = %err, "failed to set SO_LINGER");
        }
        let raw = socket2::SockRef::from(socket);
        if let Err(err) = raw.set_recv_buffer_size(self.config.recv_buffer_size) {
            warn!(session = %self.id, error = %err, "failed to set SO_RCVBUF");
        }
        if let Err(err) = raw.set_send_buffer_size(self.config.send_buffer_size) {
            warn!(session = %self.id, error = %err, "failed to set SO_SNDBUF");
        }
    }

    fn notify_disconnected(&self) {
        if self.notified.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(me) = self.me.upgrade() {
            self.handler.on_disconnected(&me);
        }
    }

    /// Owns the reader and both pooled buffers until the session ends,
    /// whatever the exit path. Returns the buffers exactly once and fires
    /// the disconnect notification after.
    async fn read_loop(
        self: Arc<Self>,
        mut reader: ReadHalf<IoStream>,
        mut scratch: PooledBuf,
        mut deflector: Deflector,
    ) -> Result<(), SessionError> {
        let result = pump(&self, &mut reader, &mut scratch, &mut deflector).await;

        self.close().await;
        deflector.release(&self.pool);
        self.pool.give_back(scratch);
        self.notify_disconnected();

        result
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("local_addr", &self.local_addr)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// The continuous read loop: one outstanding read, re-armed immediately
/// after the previous completion is processed.
async fn pump(
    session: &Arc<Session>,
    reader: &mut ReadHalf<IoStream>,
    scratch: &mut PooledBuf,
    deflector: &mut Deflector,
) -> Result<(), SessionError> {
    loop {
        let read_result: std::io::Result<usize> = {
            let read = reader.read(scratch.as_mut_slice());
            tokio::select! {
                biased;
                _ = session.cancel.cancelled() => return Ok(()),
                result = async {
                    match session.config.recv_timeout {
                        Some(limit) => match tokio::time::timeout(limit, read).await {
                            Ok(result) => result,
                            Err(_) => Err(std::io::Error::new(
                                std::io::ErrorKind::TimedOut,
                                "receive window idle",
                            )),
                        },
                        None => read.await,
                    }
                } => result,
            }
        };

        // Closed while the read was in flight
        if !session.is_connected() {
            return Ok(());
        }

        let received = match read_result {
            Ok(n) => n,
            // A completion on a dead transport reads as "peer gone"
            Err(err) if is_transport_fault(&err) => {
                debug!(session = %session.id, error = %err, "read completed on dead transport");
                0
            }
            Err(err) => return Err(SessionError::Io(err)),
        };

        if received == 0 {
            debug!(session = %session.id, peer = %session.peer_addr, "peer closed the stream");
            return Ok(());
        }

        deflector.append(&scratch[..received], &session.pool);

        if let Err(err) = deflector.drain(session.codec.as_ref(), |payload| {
            session.handler.on_frame(session, payload)
        }) {
            warn!(
                session = %session.id,
                peer = %session.peer_addr,
                error = %err,
                "undecodable frame stream"
            );
            return Err(SessionError::Wire(err));
        }
    }
}

/// Classify an I/O failure: transport faults are recovered by closing the
/// session, everything else is a defect and propagates.
fn is_transport_fault(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::WriteZero
    )
}
