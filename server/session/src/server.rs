//! Accept loop and live-session registry.

use std::sync::Arc;

use dashmap::DashMap;
use keel_buffer::BufferPool;
use keel_wire::FrameCodec;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::SessionError;
use crate::handler::SessionHandler;
use crate::session::{Session, SessionId};
use crate::transport::TlsContext;

/// Accepts connections and tracks every live [`Session`].
///
/// Sessions register themselves at acceptance and deregister through the
/// disconnect notification, so the registry converges on the set of live
/// connections without a reaper task.
pub struct Server {
    config: Arc<EngineConfig>,
    pool: Arc<BufferPool>,
    codec: Arc<dyn FrameCodec>,
    tls: Option<Arc<TlsContext>>,
    sessions: Arc<DashMap<SessionId, Arc<Session>>>,
    shutdown: CancellationToken,
}

impl Server {
    /// Build a server from its configuration. Loads the TLS identity up
    /// front so a bad certificate path fails here, not per connection.
    pub fn new(config: EngineConfig, codec: Arc<dyn FrameCodec>) -> Result<Self, SessionError> {
        let tls = config
            .tls
            .as_ref()
            .map(TlsContext::from_settings)
            .transpose()?
            .map(Arc::new);
        let pool = Arc::new(BufferPool::new(
            config.recv_buffer_size,
            config.max_idle_buffers,
        ));

        Ok(Self {
            config: Arc::new(config),
            pool,
            codec,
            tls,
            sessions: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Run the accept loop on `listener` until [`Server::shutdown`] is
    /// called. Each accepted connection gets its own session, registered
    /// before its transport negotiation begins.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        handler: Arc<dyn SessionHandler>,
    ) -> Result<(), SessionError> {
        let local = listener.local_addr()?;
        info!(addr = %local, "accepting connections");

        let handler: Arc<dyn SessionHandler> = Arc::new(Registered {
            inner: handler,
            sessions: Arc::clone(&self.sessions),
        });

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!(addr = %local, "accept loop stopped");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            warn!(error = %err, "accept failed");
                            continue;
                        }
                    };
                    debug!(peer = %peer, "connection accepted");

                    let session = match Session::accept(
                        socket,
                        Arc::clone(&self.config),
                        Arc::clone(&self.pool),
                        Arc::clone(&self.codec),
                        Arc::clone(&handler),
                        self.tls.clone(),
                    ) {
                        Ok(session) => session,
                        Err(err) => {
                            warn!(peer = %peer, error = %err, "failed to wrap connection");
                            continue;
                        }
                    };

                    session.attach_server(Arc::downgrade(&self));
                    self.sessions.insert(session.id(), Arc::clone(&session));
                    tokio::spawn(async move {
                        // Negotiation failures already closed the session;
                        // logged here because nobody awaits this task
                        if let Err(err) = session.start().await {
                            warn!(
                                session = %session.id(),
                                peer = %session.peer_addr(),
                                error = %err,
                                "session start failed"
                            );
                        }
                    });
                }
            }
        }
    }

    /// Stop accepting and close every live session.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.close_all().await;
    }

    /// Close every registered session. Each close is idempotent, so racing
    /// with peer-driven teardown is harmless.
    pub async fn close_all(&self) {
        let live: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for session in live {
            session.close().await;
        }
    }

    /// Look up a live session by id.
    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of currently registered sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// The shared buffer pool backing all sessions.
    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }
}

/// Handler wrapper that keeps the registry in sync with session teardown.
struct Registered {
    inner: Arc<dyn SessionHandler>,
    sessions: Arc<DashMap<SessionId, Arc<Session>>>,
}

impl SessionHandler for Registered {
    fn on_frame(&self, session: &Arc<Session>, payload: &[u8]) {
        self.inner.on_frame(session, payload);
    }

    fn on_disconnected(&self, session: &Arc<Session>) {
        self.sessions.remove(&session.id());
        self.inner.on_disconnected(session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_wire::LengthPrefixCodec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    /// Echoes every frame back and counts disconnects.
    #[derive(Default)]
    struct EchoHandler {
        frames: StdMutex<Vec<Vec<u8>>>,
        disconnects: AtomicUsize,
    }

    impl SessionHandler for EchoHandler {
        fn on_frame(&self, session: &Arc<Session>, payload: &[u8]) {
            self.frames.lock().unwrap().push(payload.to_vec());
            let session = Arc::clone(session);
            let payload = payload.to_vec();
            tokio::spawn(async move {
                let _ = session.send(&payload).await;
            });
        }

        fn on_disconnected(&self, _session: &Arc<Session>) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 2s");
    }

    async fn spawn_server() -> (Arc<Server>, std::net::SocketAddr, Arc<EchoHandler>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(
            Server::new(
                EngineConfig::default(),
                Arc::new(LengthPrefixCodec::default()),
            )
            .unwrap(),
        );
        let handler = Arc::new(EchoHandler::default());

        let acceptor = Arc::clone(&server);
        let registered = handler.clone() as Arc<dyn SessionHandler>;
        tokio::spawn(async move {
            acceptor.serve(listener, registered).await.unwrap();
        });

        (server, addr, handler)
    }

    fn frame(payload: &[u8]) -> Vec<u8> {
        LengthPrefixCodec::default().encode(payload).unwrap().to_vec()
    }

    #[tokio::test]
    async fn test_echo_roundtrip() {
        let (server, addr, handler) = spawn_server().await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&frame(b"ping")).await.unwrap();

        let mut wire = [0u8; 8];
        client.read_exact(&mut wire).await.unwrap();
        assert_eq!(&wire[..4], &4u32.to_be_bytes());
        assert_eq!(&wire[4..], b"ping");
        assert_eq!(handler.frames.lock().unwrap().as_slice(), &[b"ping".to_vec()]);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_registry_tracks_session_lifetimes() {
        let (server, addr, handler) = spawn_server().await;

        let first = TcpStream::connect(addr).await.unwrap();
        let second = TcpStream::connect(addr).await.unwrap();
        {
            let server = Arc::clone(&server);
            wait_until(move || server.session_count() == 2).await;
        }

        drop(first);
        {
            let server = Arc::clone(&server);
            wait_until(move || server.session_count() == 1).await;
        }
        assert_eq!(handler.disconnects.load(Ordering::SeqCst), 1);

        drop(second);
        {
            let server = Arc::clone(&server);
            wait_until(move || server.session_count() == 0).await;
        }

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_live_sessions() {
        let (server, addr, handler) = spawn_server().await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        {
            let server = Arc::clone(&server);
            wait_until(move || server.session_count() == 1).await;
        }

        server.shutdown().await;

        // The client observes EOF once its session is torn down
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read, 0);

        {
            let server = Arc::clone(&server);
            wait_until(move || server.session_count() == 0).await;
        }
        let handler = Arc::clone(&handler);
        wait_until(move || handler.disconnects.load(Ordering::SeqCst) == 1).await;

        // The accept loop is gone; new connections never become sessions
        if let Ok(mut late) = TcpStream::connect(addr).await {
            late.write_all(&frame(b"late")).await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert_eq!(server.session_count(), 0);
        }

        // All pooled buffers made it back
        assert_eq!(server.buffer_pool().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_lookup_by_id() {
        let (server, addr, _handler) = spawn_server().await;

        let _client = TcpStream::connect(addr).await.unwrap();
        {
            let server = Arc::clone(&server);
            wait_until(move || server.session_count() == 1).await;
        }

        let id = server
            .sessions
            .iter()
            .map(|entry| *entry.key())
            .next()
            .unwrap();
        assert!(server.get(id).is_some());

        server.shutdown().await;
        {
            let server = Arc::clone(&server);
            wait_until(move || server.get(id).is_none()).await;
        }
    }

    #[tokio::test]
    async fn test_sessions_expose_owning_server() {
        let (server, addr, _handler) = spawn_server().await;

        let _client = TcpStream::connect(addr).await.unwrap();
        {
            let server = Arc::clone(&server);
            wait_until(move || server.session_count() == 1).await;
        }

        let session = server
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .next()
            .unwrap();
        let owner = session.server().unwrap();
        assert!(Arc::ptr_eq(&owner, &server));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_bad_tls_paths_fail_at_construction() {
        let config = EngineConfig {
            tls: Some(crate::config::TlsSettings::new(
                "/nonexistent/cert.pem",
                "/nonexistent/key.pem",
            )),
            ..EngineConfig::default()
        };
        let result = Server::new(config, Arc::new(LengthPrefixCodec::default()));
        assert!(result.is_err());
    }
}
