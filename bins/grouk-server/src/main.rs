#![forbid(unsafe_code)]

mod health;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::builder::NonEmptyStringValueParser;
use clap::Parser;
use grouk_common::{load_json, ConnectRequest, CONNECT_FAILED, CONNECT_SUCCESS, LEN_PREFIX_SIZE};
use grouk_transport::{pipe_tcp, Listener, Session, Stream, TransportConfig, TransportError};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::health::HealthStats;

#[derive(Parser, Debug)]
#[command(name = "grouk-server", version, about = "Grouk tunnel server")]
struct Args {
    /// UDP address to accept sessions on
    #[arg(long, env = "GROUK_LISTEN", default_value = "0.0.0.0:8443")]
    listen: SocketAddr,

    /// Pre-shared key clients must prove
    #[arg(
        long,
        env = "GROUK_PSK",
        hide_env_values = true,
        value_parser = NonEmptyStringValueParser::new()
    )]
    psk: String,

    /// JSON file with transport tuning
    #[arg(long, env = "GROUK_CONFIG")]
    config: Option<PathBuf>,

    /// Seconds to wait for an outbound TCP connect
    #[arg(long, default_value_t = 10)]
    dial_timeout_secs: u64,

    /// Serve a JSON status endpoint on this TCP address
    #[arg(long, env = "GROUK_HEALTH")]
    health: Option<SocketAddr>,

    /// Bearer token required by the status endpoint
    #[arg(long, env = "GROUK_HEALTH_TOKEN", hide_env_values = true)]
    health_token: Option<String>,

    /// Default log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    grouk_common::init_tracing_with_default(&args.log_level);

    let config = match &args.config {
        Some(path) => load_json::<TransportConfig>(path)
            .with_context(|| format!("loading transport config from {}", path.display()))?,
        None => TransportConfig::default(),
    };
    let dial_timeout = Duration::from_secs(args.dial_timeout_secs);
    let stats = HealthStats::new();
    if let Some(addr) = args.health {
        health::serve(addr, Arc::clone(&stats), args.health_token.clone()).await?;
    }

    let listener = Listener::bind(args.listen, args.psk.into_bytes(), config)
        .await
        .with_context(|| format!("binding {}", args.listen))?;
    info!(listen = %listener.local_addr(), "grouk server ready");

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(session) => {
                    tokio::spawn(handle_session(session, dial_timeout, Arc::clone(&stats)));
                }
                Err(e) => {
                    warn!(error = %e, "listener stopped");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    listener.close().await;
    Ok(())
}

async fn handle_session(session: Session, dial_timeout: Duration, stats: Arc<HealthStats>) {
    let _active = stats.track_session();
    let session_id = session.id();
    info!(session = session_id, peer = %session.peer_addr(), "session active");

    loop {
        match session.accept_stream().await {
            Ok(stream) => {
                let stats = Arc::clone(&stats);
                tokio::spawn(async move {
                    let _active = stats.track_stream();
                    if let Err(e) = handle_stream(stream.clone(), dial_timeout, &stats).await {
                        stats.add_error();
                        debug!(session = session_id, stream = stream.id(), error = %e, "stream ended");
                        stream.close().await;
                    }
                });
            }
            Err(e) => {
                info!(session = session_id, reason = %e, "session ended");
                break;
            }
        }
    }
    session.close().await;
}

async fn handle_stream(
    stream: Stream,
    dial_timeout: Duration,
    stats: &HealthStats,
) -> Result<()> {
    let request = match read_request(&stream).await {
        Ok(request) => request,
        Err(e) => {
            reject(&stream).await;
            return Err(e);
        }
    };
    let target = request.to_string();

    let tcp = match timeout(dial_timeout, TcpStream::connect(&target)).await {
        Ok(Ok(tcp)) => tcp,
        Ok(Err(e)) => {
            reject(&stream).await;
            return Err(e).with_context(|| format!("dialing {target}"));
        }
        Err(_) => {
            reject(&stream).await;
            bail!("dialing {target} timed out");
        }
    };

    stream.write(&[CONNECT_SUCCESS]).await?;
    info!(stream = stream.id(), %target, "relaying");
    let relayed = pipe_tcp(stream, tcp).await?;
    stats.add_bytes(relayed.total());
    debug!(%target, up = relayed.upstream, down = relayed.downstream, "relay finished");
    Ok(())
}

async fn read_request(stream: &Stream) -> Result<ConnectRequest> {
    let mut prefix = [0u8; LEN_PREFIX_SIZE];
    stream.read_exact(&mut prefix).await?;
    let len = ConnectRequest::body_len(prefix)?;

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(ConnectRequest::decode(&body)?)
}

async fn reject(stream: &Stream) {
    match stream.write(&[CONNECT_FAILED]).await {
        Ok(_) | Err(TransportError::StreamClosed) | Err(TransportError::SessionClosed) => {}
        Err(e) => debug!(stream = stream.id(), error = %e, "failed to send rejection"),
    }
}
