#![forbid(unsafe_code)]

mod socks5;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::builder::NonEmptyStringValueParser;
use clap::Parser;
use grouk_common::{load_json, ConnectRequest, CONNECT_SUCCESS};
use grouk_transport::{connect, pipe_tcp, Session, Stream, TransportConfig};
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::socks5::Reply;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "grouk-client", version, about = "Grouk tunnel client (SOCKS5 front end)")]
struct Args {
    /// Local SOCKS5 listen address
    #[arg(long, env = "GROUK_LISTEN", default_value = "127.0.0.1:1080")]
    listen: SocketAddr,

    /// Grouk server, host:port
    #[arg(long, env = "GROUK_SERVER")]
    server: String,

    /// Pre-shared key
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
    let server = lookup_host(&args.server)
        .await
        .with_context(|| format!("resolving {}", args.server))?
        .next()
        .ok_or_else(|| anyhow!("{} resolved to no addresses", args.server))?;

    let tunnel = Arc::new(Tunnel::new(server, args.psk.into_bytes(), config));
    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("binding {}", args.listen))?;
    info!(listen = %args.listen, %server, "grouk client ready");

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((conn, peer)) => {
                    let tunnel = Arc::clone(&tunnel);
                    tokio::spawn(async move {
                        if let Err(e) = handle_socks(conn, &tunnel).await {
                            debug!(%peer, error = %e, "socks connection ended");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    tunnel.shutdown().await;
    Ok(())
}

/// One shared session to the server, re-dialed on demand.
struct Tunnel {
    server: SocketAddr,
    psk: Vec<u8>,
    config: TransportConfig,
    state: Mutex<TunnelState>,
}

#[derive(Default)]
struct TunnelState {
    session: Option<Session>,
    backoff: Duration,
}

impl Tunnel {
    fn new(server: SocketAddr, psk: Vec<u8>, config: TransportConfig) -> Self {
        Self {
            server,
            psk,
            config,
            state: Mutex::new(TunnelState::default()),
        }
    }

    /// Return the live session or dial a new one.
    ///
    /// Failed dials grow the wait before the next attempt from 1s, doubling
    /// up to 30s; a successful dial resets it.
    async fn session(&self) -> Result<Session> {
        let mut state = self.state.lock().await;
        if let Some(session) = &state.session {
            if !session.is_closed() {
                return Ok(session.clone());
            }
        }
        state.session = None;

        if !state.backoff.is_zero() {
            info!(backoff = ?state.backoff, "waiting before reconnect");
            tokio::time::sleep(state.backoff).await;
        }

        info!(server = %self.server, "connecting");
        match connect(self.server, &self.psk, self.config.clone()).await {
            Ok(session) => {
                state.backoff = Duration::ZERO;
                state.session = Some(session.clone());
                Ok(session)
            }
            Err(e) => {
                state.backoff = next_backoff(state.backoff);
                Err(e).context("grouk handshake")
            }
        }
    }

    /// Drop `stale` if it is still the current session.
    async fn invalidate(&self, stale: &Session) {
        let taken = {
            let mut state = self.state.lock().await;
            match &state.session {
                Some(current) if current.id() == stale.id() => state.session.take(),
                _ => None,
            }
        };
        if let Some(session) = taken {
            session.close().await;
        }
    }

    /// Open a stream, re-dialing once if the current session refuses.
    async fn open_stream(&self) -> Result<Stream> {
        let session = self.session().await?;
        match session.open_stream().await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                warn!(session = session.id(), error = %e, "open stream failed, reconnecting");
                self.invalidate(&session).await;
                let session = self.session().await?;
                session.open_stream().await.context("open stream")
            }
        }
    }

    async fn shutdown(&self) {
        let session = self.state.lock().await.session.take();
        if let Some(session) = session {
            session.close().await;
        }
    }
}

fn next_backoff(current: Duration) -> Duration {
    if current.is_zero() {
        INITIAL_BACKOFF
    } else {
        (current * 2).min(MAX_BACKOFF)
    }
}

async fn handle_socks(mut conn: TcpStream, tunnel: &Tunnel) -> Result<()> {
    let request = socks5::handshake(&mut conn).await?;
    let target = request.to_string();
    debug!(%target, "socks connect");

    let stream = match tunnel.open_stream().await {
        Ok(stream) => stream,
        Err(e) => {
            socks5::send_reply(&mut conn, Reply::GeneralFailure).await?;
            return Err(e);
        }
    };

    if let Err(e) = negotiate(&stream, &request).await {
        stream.close().await;
        socks5::send_reply(&mut conn, Reply::ConnectionRefused).await?;
        return Err(e).with_context(|| format!("connecting to {target}"));
    }

    socks5::send_reply(&mut conn, Reply::Succeeded).await?;
    info!(%target, stream = stream.id(), "tunnel open");
    pipe_tcp(stream, conn).await?;
    debug!(%target, "tunnel closed");
    Ok(())
}

/// Send the connect request and wait for the server's status byte.
async fn negotiate(stream: &Stream, request: &ConnectRequest) -> Result<()> {
    stream.write(&request.encode_framed()?).await?;

    let mut status = [0u8; 1];
    stream.read_exact(&mut status).await?;
    if status[0] != CONNECT_SUCCESS {
        bail!("server refused with status {:#04x}", status[0]);
    }
    Ok(())
}
