//! HTTP status endpoint.
//!
//! `GET /health` returns the server's counters as JSON and, when a token is
//! configured, requires `Authorization: Bearer <token>`. `GET /ping` is
//! always open and answers `pong`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use grouk_common::constant_time_eq;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[derive(Debug)]
pub struct HealthStats {
    started: Instant,
    active_sessions: AtomicU64,
    total_sessions: AtomicU64,
    active_streams: AtomicU64,
    total_streams: AtomicU64,
    total_bytes: AtomicU64,
    errors: AtomicU64,
}

/// Decrements its gauge when dropped.
#[must_use]
pub struct Active {
    stats: Arc<HealthStats>,
    gauge: Gauge,
}

#[derive(Clone, Copy)]
enum Gauge {
    Sessions,
    Streams,
}

impl HealthStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            started: Instant::now(),
            active_sessions: AtomicU64::new(0),
            total_sessions: AtomicU64::new(0),
            active_streams: AtomicU64::new(0),
            total_streams: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        })
    }

    pub fn track_session(self: &Arc<Self>) -> Active {
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
        self.total_sessions.fetch_add(1, Ordering::Relaxed);
        Active {
            stats: Arc::clone(self),
            gauge: Gauge::Sessions,
        }
    }

    pub fn track_stream(self: &Arc<Self>) -> Active {
        self.active_streams.fetch_add(1, Ordering::Relaxed);
        self.total_streams.fetch_add(1, Ordering::Relaxed);
        Active {
            stats: Arc::clone(self),
            gauge: Gauge::Streams,
        }
    }

    pub fn add_bytes(&self, n: u64) {
        self.total_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HealthStatus {
        let uptime = self.started.elapsed();
        HealthStatus {
            status: "running",
            uptime: format_uptime(uptime),
            uptime_seconds: uptime.as_secs(),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            total_sessions: self.total_sessions.load(Ordering::Relaxed),
            active_streams: self.active_streams.load(Ordering::Relaxed),
            total_streams: self.total_streams.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Active {
    fn drop(&mut self) {
        let gauge = match self.gauge {
            Gauge::Sessions => &self.stats.active_sessions,
            Gauge::Streams => &self.stats.active_streams,
        };
        gauge.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub uptime: String,
    pub uptime_seconds: u64,
    pub active_sessions: u64,
    pub total_sessions: u64,
    pub active_streams: u64,
    pub total_streams: u64,
    pub total_bytes: u64,
    pub errors: u64,
}

#[derive(Clone)]
struct HealthState {
    stats: Arc<HealthStats>,
    token: Option<Arc<str>>,
}

pub fn router(stats: Arc<HealthStats>, token: Option<String>) -> Router {
    let state = HealthState {
        stats,
        token: token.filter(|t| !t.is_empty()).map(Arc::from),
    };
    Router::new()
        .route("/health", get(health))
        .route("/ping", get(|| async { "pong" }))
        .with_state(state)
}

async fn health(State(state): State<HealthState>, headers: HeaderMap) -> Response {
    if let Some(token) = &state.token {
        let got = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if !constant_time_eq(got, &format!("Bearer {token}")) {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (StatusCode::OK, Json(state.stats.snapshot())).into_response()
}

/// Bind `addr` and serve in the background. Bind errors are returned
/// immediately.
pub async fn serve(
    addr: SocketAddr,
    stats: Arc<HealthStats>,
    token: Option<String>,
) -> Result<SocketAddr> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding health endpoint {addr}"))?;
    let bound = listener.local_addr()?;
    let app = router(stats, token);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!(error = %e, "health endpoint stopped");
        }
    });
    info!(health = %bound, "health endpoint ready");
    Ok(bound)
}

fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    let (days, hours, mins) = (secs / 86_400, secs / 3_600 % 24, secs / 60 % 60);
    if days > 0 {
        format!("{days}d {hours}h {mins}m")
    } else if hours > 0 {
        format!("{hours}h {mins}m")
    } else {
        format!("{mins}m")
    }
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;

    async fn get_path(app: Router, path: &str, auth: Option<&str>) -> (StatusCode, Vec<u8>) {
        let mut request = Request::builder().uri(path);
        if let Some(auth) = auth {
            request = request.header(header::AUTHORIZATION, auth);
        }
        let response = app
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    #[test]
    fn guards_track_active_and_total() {
        let stats = HealthStats::new();
        let session = stats.track_session();
        let first = stats.track_stream();
        let second = stats.track_stream();
        drop(first);
        stats.add_bytes(42);
        stats.add_error();

        let status = stats.snapshot();
        assert_eq!(status.active_sessions, 1);
        assert_eq!(status.active_streams, 1);
        assert_eq!(status.total_streams, 2);
        assert_eq!(status.total_bytes, 42);
        assert_eq!(status.errors, 1);

        drop(second);
        drop(session);
        let status = stats.snapshot();
        assert_eq!(status.active_sessions, 0);
        assert_eq!(status.total_sessions, 1);
        assert_eq!(status.active_streams, 0);
    }

    #[tokio::test]
    async fn health_reports_counters_as_json() {
        let stats = HealthStats::new();
        let _session = stats.track_session();
        stats.add_bytes(7);

        let (status, body) = get_path(router(stats, None), "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "running");
        assert_eq!(json["uptime"], "0m");
        assert_eq!(json["active_sessions"], 1);
        assert_eq!(json["total_bytes"], 7);
    }

    #[tokio::test]
    async fn token_guards_health_but_not_ping() {
        let app = router(HealthStats::new(), Some("s3cret".into()));

        let (status, _) = get_path(app.clone(), "/health", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = get_path(app.clone(), "/health", Some("Bearer wrong")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = get_path(app.clone(), "/health", Some("Bearer s3cret")).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = get_path(app, "/ping", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"pong");
    }

    #[tokio::test]
    async fn serve_fails_fast_on_a_taken_port() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();
        assert!(serve(addr, HealthStats::new(), None).await.is_err());

        let bound = serve("127.0.0.1:0".parse().unwrap(), HealthStats::new(), None)
            .await
            .unwrap();
        assert_ne!(bound.port(), 0);
    }

    #[test]
    fn uptime_formatting() {
        assert_eq!(format_uptime(Duration::from_secs(59)), "0m");
        assert_eq!(format_uptime(Duration::from_secs(3_660)), "1h 1m");
        assert_eq!(format_uptime(Duration::from_secs(90_000)), "1d 1h 0m");
    }
}
