//! Plain and TLS transport for accepted sessions.
//!
//! The negotiator either hands the accepted TCP stream back unchanged or
//! upgrades it to a server-side TLS stream, bounded by the configured
//! connect timeout. A session whose negotiation fails is left with the
//! socket closed; there is never a half-negotiated session.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::net::SocketAddr;
use std::time::Duration;

use rustls::client::danger::HandshakeSignatureValid;
use rustls::pki_types::{CertificateDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{DigitallySignedStruct, DistinguishedName, RootCertStore, ServerConfig};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use crate::config::TlsSettings;
use crate::error::SessionError;

/// Unified stream type that is either plain TCP or server-side TLS.
#[derive(Debug)]
pub enum IoStream {
    /// Plain TCP stream
    Plain(TcpStream),
    /// TLS-wrapped stream; the TLS layer exclusively owns the TCP stream
    Tls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            IoStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            IoStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            IoStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            IoStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Server-side TLS identity and client-certificate policy, built once and
/// shared by every session.
#[derive(Clone)]
pub struct TlsContext {
    acceptor: TlsAcceptor,
}

impl TlsContext {
    /// Load the server identity and build the acceptor from settings.
    pub fn from_settings(settings: &TlsSettings) -> Result<Self, SessionError> {
        // Install default crypto provider if not already set
        let _ = rustls::crypto::ring::default_provider().install_default();

        let cert_pem = read_pem(&settings.cert_file, "certificate chain")?;
        let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| SessionError::TlsConfig(format!("failed to parse certificate chain: {e}")))?;
        if certs.is_empty() {
            return Err(SessionError::TlsConfig(
                "no certificates found in certificate chain".into(),
            ));
        }

        let key_pem = read_pem(&settings.key_file, "private key")?;
        let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
            .map_err(|e| SessionError::TlsConfig(format!("failed to parse private key: {e}")))?
            .ok_or_else(|| SessionError::TlsConfig("no private key found".into()))?;

        let versions: Vec<&'static rustls::SupportedProtocolVersion> =
            if settings.protocols.is_empty() {
                rustls::ALL_VERSIONS.to_vec()
            } else {
                settings.protocols.iter().map(|p| p.as_rustls()).collect()
            };
        let builder = ServerConfig::builder_with_protocol_versions(&versions);

        let config = if settings.require_client_cert {
            let verifier = client_verifier(settings)?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)
        } else {
            builder.with_no_client_auth().with_single_cert(certs, key)
        }
        .map_err(|e| SessionError::TlsConfig(format!("server identity rejected: {e}")))?;

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
        })
    }
}

/// Build the client-certificate verifier mandated by the settings.
fn client_verifier(settings: &TlsSettings) -> Result<Arc<dyn ClientCertVerifier>, SessionError> {
    let ca_path = settings.ca_file.as_ref().ok_or_else(|| {
        SessionError::TlsConfig("client certificates required but no CA bundle configured".into())
    })?;

    let ca_pem = read_pem(ca_path, "CA bundle")?;
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut ca_pem.as_slice()) {
        let cert =
            cert.map_err(|e| SessionError::TlsConfig(format!("failed to parse CA bundle: {e}")))?;
        roots
            .add(cert)
            .map_err(|e| SessionError::TlsConfig(format!("CA certificate rejected: {e}")))?;
    }

    let mut builder = WebPkiClientVerifier::builder(Arc::new(roots));
    if settings.check_revocation {
        if let Some(crl_path) = &settings.crl_file {
            let crl_pem = read_pem(crl_path, "revocation list")?;
            let crls = rustls_pemfile::crls(&mut crl_pem.as_slice())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| {
                    SessionError::TlsConfig(format!("failed to parse revocation list: {e}"))
                })?;
            builder = builder.with_crls(crls);
        }
    }
    let inner = builder
        .build()
        .map_err(|e| SessionError::TlsConfig(format!("client verifier rejected: {e}")))?;

    if settings.allow_invalid_certs {
        Ok(Arc::new(LenientClientVerifier { inner }))
    } else {
        Ok(inner)
    }
}

fn read_pem(path: &std::path::Path, what: &str) -> Result<Vec<u8>, SessionError> {
    std::fs::read(path)
        .map_err(|e| SessionError::TlsConfig(format!("failed to read {what} {}: {e}", path.display())))
}

/// Wraps the standard client-certificate verifier and accepts certificates
/// whose validation failed, logging the bypass. Signature checks still run
/// against the presented certificate.
#[derive(Debug)]
struct LenientClientVerifier {
    inner: Arc<dyn ClientCertVerifier>,
}

impl ClientCertVerifier for LenientClientVerifier {
    fn offer_client_auth(&self) -> bool {
        self.inner.offer_client_auth()
    }

    fn client_auth_mandatory(&self) -> bool {
        self.inner.client_auth_mandatory()
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        match self.inner.verify_client_cert(end_entity, intermediates, now) {
            Ok(verified) => Ok(verified),
            Err(err) => {
                warn!(error = %err, "accepting client certificate despite validation failure");
                Ok(ClientCertVerified::assertion())
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Upgrade an accepted socket according to the TLS policy.
///
/// Returns the stream unchanged when TLS is disabled. On timeout or
/// handshake rejection the socket is dropped, so the connection is closed
/// by the time the error reaches the caller.
pub(crate) async fn negotiate(
    socket: TcpStream,
    tls: Option<&TlsContext>,
    connect_timeout: Duration,
    peer: SocketAddr,
) -> Result<IoStream, SessionError> {
    let Some(ctx) = tls else {
        return Ok(IoStream::Plain(socket));
    };

    debug!(%peer, "negotiating transport security");
    match tokio::time::timeout(connect_timeout, ctx.acceptor.accept(socket)).await {
        Ok(Ok(stream)) => {
            debug!(%peer, "transport security established");
            Ok(IoStream::Tls(Box::new(stream)))
        }
        Ok(Err(source)) => Err(SessionError::Negotiation { peer, source }),
        Err(_) => Err(SessionError::NegotiationTimeout {
            peer,
            timeout: connect_timeout,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TlsSettings;
    use rustls::pki_types::{PrivatePkcs8KeyDer, ServerName};
    use std::path::PathBuf;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_rustls::TlsConnector;

    struct TestPki {
        _dir: tempfile::TempDir,
        server: TlsSettings,
        server_cert_der: CertificateDer<'static>,
        client_cert_der: CertificateDer<'static>,
        client_key_der: Vec<u8>,
    }

    /// Self-signed server and client identities written out as PEM files.
    fn test_pki(trust_client: bool) -> TestPki {
        let dir = tempfile::tempdir().unwrap();
        let server_key = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let client_key = rcgen::generate_simple_self_signed(vec!["client".into()]).unwrap();
        // An unrelated identity; trusting it makes the real client cert fail
        // validation
        let decoy_key = rcgen::generate_simple_self_signed(vec!["decoy".into()]).unwrap();

        let write = |name: &str, contents: String| -> PathBuf {
            let path = dir.path().join(name);
            std::fs::write(&path, contents).unwrap();
            path
        };

        let cert_file = write("server.pem", server_key.cert.pem());
        let key_file = write("server.key", server_key.key_pair.serialize_pem());
        let ca_pem = if trust_client {
            client_key.cert.pem()
        } else {
            decoy_key.cert.pem()
        };
        let ca_file = write("clients.pem", ca_pem);

        let mut server = TlsSettings::new(cert_file, key_file);
        server.ca_file = Some(ca_file);

        TestPki {
            server,
            server_cert_der: server_key.cert.der().clone(),
            client_cert_der: client_key.cert.der().clone(),
            client_key_der: client_key.key_pair.serialize_der(),
            _dir: dir,
        }
    }

    fn client_config(pki: &TestPki, with_client_cert: bool) -> rustls::ClientConfig {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let mut roots = RootCertStore::empty();
        roots.add(pki.server_cert_der.clone()).unwrap();

        let builder = rustls::ClientConfig::builder().with_root_certificates(roots);
        if with_client_cert {
            builder
                .with_client_auth_cert(
                    vec![pki.client_cert_der.clone()],
                    PrivatePkcs8KeyDer::from(pki.client_key_der.clone()).into(),
                )
                .unwrap()
        } else {
            builder.with_no_client_auth()
        }
    }

    async fn accepted_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        (server, client, peer)
    }

    #[tokio::test]
    async fn test_negotiate_plain_passthrough() {
        let (server, mut client, peer) = accepted_pair().await;

        let mut stream = negotiate(server, None, Duration::from_secs(1), peer)
            .await
            .unwrap();
        assert!(matches!(stream, IoStream::Plain(_)));

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_negotiate_tls_handshake() {
        let pki = test_pki(true);
        let ctx = TlsContext::from_settings(&pki.server).unwrap();
        let (server, client, peer) = accepted_pair().await;

        let connector = TlsConnector::from(Arc::new(client_config(&pki, false)));
        let client_task = tokio::spawn(async move {
            let name = ServerName::try_from("localhost").unwrap();
            let mut tls = connector.connect(name, client).await.unwrap();
            tls.write_all(b"hello").await.unwrap();
            tls.flush().await.unwrap();
            tls
        });

        let mut stream = negotiate(server, Some(&ctx), Duration::from_secs(5), peer)
            .await
            .unwrap();
        assert!(matches!(stream, IoStream::Tls(_)));

        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        drop(client_task);
    }

    #[tokio::test]
    async fn test_negotiation_timeout_names_endpoint() {
        let pki = test_pki(true);
        let ctx = TlsContext::from_settings(&pki.server).unwrap();
        let (server, _client, peer) = accepted_pair().await;

        // The client never starts a handshake
        let timeout = Duration::from_millis(200);
        let err = negotiate(server, Some(&ctx), timeout, peer)
            .await
            .unwrap_err();

        match &err {
            SessionError::NegotiationTimeout { peer: p, timeout: t } => {
                assert_eq!(*p, peer);
                assert_eq!(*t, timeout);
            }
            other => panic!("expected negotiation timeout, got {other:?}"),
        }
        assert!(err.to_string().contains(&peer.to_string()));
    }

    #[tokio::test]
    async fn test_client_cert_rejected_without_bypass() {
        // Server trusts a decoy CA, so the client certificate fails
        // validation
        let mut pki = test_pki(false);
        pki.server.require_client_cert = true;
        let ctx = TlsContext::from_settings(&pki.server).unwrap();
        let (server, client, peer) = accepted_pair().await;

        let connector = TlsConnector::from(Arc::new(client_config(&pki, true)));
        let client_task = tokio::spawn(async move {
            let name = ServerName::try_from("localhost").unwrap();
            let _ = connector.connect(name, client).await;
        });

        let err = negotiate(server, Some(&ctx), Duration::from_secs(5), peer)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Negotiation { .. }));
        let _ = client_task.await;
    }

    #[tokio::test]
    async fn test_client_cert_accepted_with_bypass() {
        let mut pki = test_pki(false);
        pki.server.require_client_cert = true;
        pki.server.allow_invalid_certs = true;
        let ctx = TlsContext::from_settings(&pki.server).unwrap();
        let (server, client, peer) = accepted_pair().await;

        let connector = TlsConnector::from(Arc::new(client_config(&pki, true)));
        let client_task = tokio::spawn(async move {
            let name = ServerName::try_from("localhost").unwrap();
            let mut tls = connector.connect(name, client).await.unwrap();
            tls.write_all(b"ok").await.unwrap();
            tls.flush().await.unwrap();
            tls
        });

        let mut stream = negotiate(server, Some(&ctx), Duration::from_secs(5), peer)
            .await
            .unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");
        drop(client_task);
    }

    #[tokio::test]
    async fn test_valid_client_cert_accepted_strictly() {
        let mut pki = test_pki(true);
        pki.server.require_client_cert = true;
        let ctx = TlsContext::from_settings(&pki.server).unwrap();
        let (server, client, peer) = accepted_pair().await;

        let connector = TlsConnector::from(Arc::new(client_config(&pki, true)));
        let client_task = tokio::spawn(async move {
            let name = ServerName::try_from("localhost").unwrap();
            let mut tls = connector.connect(name, client).await.unwrap();
            tls.write_all(b"ok").await.unwrap();
            tls.flush().await.unwrap();
            tls
        });

        let mut stream = negotiate(server, Some(&ctx), Duration::from_secs(5), peer)
            .await
            .unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");
        drop(client_task);
    }

    #[test]
    fn test_missing_identity_files() {
        let settings = TlsSettings::new("/nonexistent/cert.pem", "/nonexistent/key.pem");
        assert!(matches!(
            TlsContext::from_settings(&settings),
            Err(SessionError::TlsConfig(_))
        ));
    }
}
