//! Keel daemon binary.
//!
//! Accepts framed TCP connections (optionally over TLS) and echoes every
//! frame back to its sender. Mostly useful for exercising the session
//! engine end to end; real deployments embed [`keel_session::Server`] with
//! their own handler.

use clap::Parser;
use keel_session::{Server, Session, SessionHandler};
use keel_wire::{DelimitedCodec, FrameCodec, LengthPrefixCodec};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info};

mod config;
mod logging;

use config::KeelConfig;

/// Framed TCP echo server
#[derive(Parser, Debug)]
#[command(name = "keeld", version, about = "Framed TCP session server")]
struct Args {
    /// Listen address, e.g. 0.0.0.0:7400
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Frame codec: length-prefix, lines
    #[arg(long, default_value = "length-prefix")]
    codec: String,

    /// Transport negotiation deadline, e.g. 10s
    #[arg(long)]
    connect_timeout: Option<humantime::Duration>,

    /// Close sessions idle for this long, e.g. 5m
    #[arg(long)]
    recv_timeout: Option<humantime::Duration>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Configuration file path
    #[arg(long, default_value = "keel.yaml")]
    config: PathBuf,
}

/// Sends every decoded frame straight back on the same session.
struct EchoHandler;

impl SessionHandler for EchoHandler {
    fn on_frame(&self, session: &Arc<Session>, payload: &[u8]) {
        debug!(
            session = %session.id(),
            bytes = payload.len(),
            "echoing frame"
        );
        let session = Arc::clone(session);
        let payload = payload.to_vec();
        tokio::spawn(async move {
            if let Err(err) = session.send(&payload).await {
                debug!(session = %session.id(), error = %err, "echo send failed");
            }
        });
    }

    fn on_disconnected(&self, session: &Arc<Session>) {
        info!(session = %session.id(), peer = %session.peer_addr(), "peer disconnected");
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(&args.log_level)?;

    info!("Starting keel v{}", env!("CARGO_PKG_VERSION"));

    let file_config = KeelConfig::load_from_file(&args.config)?;
    let mut engine = file_config.engine_config()?;

    // Flags win over the config file
    let listen = args.listen.unwrap_or(file_config.listen);
    if let Some(timeout) = args.connect_timeout {
        engine.connect_timeout = timeout.into();
    }
    if let Some(timeout) = args.recv_timeout {
        engine.recv_timeout = Some(timeout.into());
    }

    let codec: Arc<dyn FrameCodec> = match args.codec.as_str() {
        "length-prefix" => Arc::new(LengthPrefixCodec::default()),
        "lines" => Arc::new(DelimitedCodec::lines()),
        other => anyhow::bail!("Invalid codec: {other}. Use 'length-prefix' or 'lines'"),
    };

    info!(
        "Session config: connect_timeout={:?}, recv_timeout={:?}, send_timeout={:?}, tls={}",
        engine.connect_timeout,
        engine.recv_timeout,
        engine.send_timeout,
        engine.tls.is_some()
    );

    let server = Arc::new(Server::new(engine, codec)?);
    let listener = TcpListener::bind(listen).await?;
    info!("Listening on {listen}");

    let acceptor = Arc::clone(&server);
    let accept_loop = tokio::spawn(async move {
        acceptor.serve(listener, Arc::new(EchoHandler)).await
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, closing {} sessions", server.session_count());

    server.shutdown().await;
    accept_loop.await??;

    info!("Shutdown complete");
    Ok(())
}
