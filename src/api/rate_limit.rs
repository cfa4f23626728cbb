//! Sliding-window rate limiting middleware.
//!
//! For each client key the limiter keeps the timestamps of recent requests;
//! a request is allowed while fewer than `N` timestamps fall inside the
//! trailing window `W`. Two interchangeable backends implement the window:
//!
//! - **memory** — per-client vectors behind a mutex, with a periodic sweep
//!   that evicts clients idle for more than `2·W`;
//! - **persistent** — timestamp rows in the store, with per-key lock striping
//!   (SHA-256 of the key) so concurrent requests for one client serialize.
//!
//! The client key is the rightmost `X-Forwarded-For` entry when present,
//! otherwise the peer address; ports are stripped and IPv6 bracket syntax is
//! recognized.

use async_trait::async_trait;
use axum::{
    Json,
    extract::{ConnectInfo, Request},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::{RateLimitBackendKind, RateLimitConfig};
use crate::db::Database;
use crate::error::ApiError;

/// Stripe count for the persistent backend's per-key locks
const LOCK_STRIPES: usize = 64;

/// Paths never rate limited (liveness probes)
const EXEMPT_PATHS: &[&str] = &["/healthz", "/readyz"];

/// Outcome of a rate-limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// Request admitted
    Allowed,
    /// Request denied; retry after this many seconds
    Denied {
        /// Seconds until a slot frees up
        retry_after_secs: u64,
    },
}

/// Sliding-window storage behind the limiter
#[async_trait]
pub trait RateLimitBackend: Send + Sync {
    /// Record/check one request for `client_key` at time `now_ms`
    async fn check(&self, client_key: &str, now_ms: i64) -> crate::Result<RateDecision>;
}

/// In-memory backend: per-client hit vectors
pub struct MemoryBackend {
    hits: Mutex<HashMap<String, Vec<i64>>>,
    max_requests: u32,
    window: Duration,
}

impl MemoryBackend {
    /// Create a backend allowing `max_requests` per `window`
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            hits: Mutex::new(HashMap::new()),
            max_requests,
            window,
        }
    }

    /// Evict clients whose newest hit is older than `2·W`
    pub async fn sweep(&self, now_ms: i64) {
        let idle_cutoff = now_ms - 2 * self.window.as_millis() as i64;
        let mut hits = self.hits.lock().await;
        hits.retain(|_, times| times.last().is_some_and(|&newest| newest > idle_cutoff));
    }

    /// Number of tracked clients (observability and tests)
    pub async fn tracked_clients(&self) -> usize {
        self.hits.lock().await.len()
    }
}

#[async_trait]
impl RateLimitBackend for MemoryBackend {
    async fn check(&self, client_key: &str, now_ms: i64) -> crate::Result<RateDecision> {
        let window_ms = self.window.as_millis() as i64;
        let cutoff = now_ms - window_ms;

        let mut hits = self.hits.lock().await;
        let times = hits.entry(client_key.to_string()).or_default();
        times.retain(|&t| t > cutoff);

        if (times.len() as u32) < self.max_requests {
            times.push(now_ms);
            Ok(RateDecision::Allowed)
        } else {
            let oldest = times.first().copied().unwrap_or(now_ms);
            Ok(RateDecision::Denied {
                retry_after_secs: retry_after_secs(oldest, window_ms, now_ms),
            })
        }
    }
}

/// Store-backed backend: timestamp rows with per-key lock striping
pub struct PersistentBackend {
    db: Arc<Database>,
    max_requests: u32,
    window: Duration,
    locks: Vec<Mutex<()>>,
}

impl PersistentBackend {
    /// Create a backend over the shared store
    pub fn new(db: Arc<Database>, max_requests: u32, window: Duration) -> Self {
        Self {
            db,
            max_requests,
            window,
            locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    fn stripe(&self, client_key: &str) -> usize {
        let digest = Sha256::digest(client_key.as_bytes());
        (digest[0] as usize) % LOCK_STRIPES
    }
}

#[async_trait]
impl RateLimitBackend for PersistentBackend {
    async fn check(&self, client_key: &str, now_ms: i64) -> crate::Result<RateDecision> {
        let window_ms = self.window.as_millis() as i64;
        let cutoff = now_ms - window_ms;

        // Serialize per client key: count-then-insert must be atomic
        let _guard = self.locks[self.stripe(client_key)].lock().await;

        let count = self.db.rate_limit_count_since(client_key, cutoff).await?;
        if (count as u32) < self.max_requests {
            self.db.rate_limit_record(client_key, now_ms).await?;
            return Ok(RateDecision::Allowed);
        }

        let oldest = self
            .db
            .rate_limit_oldest_since(client_key, cutoff)
            .await?
            .unwrap_or(now_ms);
        Ok(RateDecision::Denied {
            retry_after_secs: retry_after_secs(oldest, window_ms, now_ms),
        })
    }
}

fn retry_after_secs(oldest_ms: i64, window_ms: i64, now_ms: i64) -> u64 {
    let remaining_ms = (oldest_ms + window_ms - now_ms).max(0) as u64;
    remaining_ms.div_ceil(1_000).max(1)
}

/// The limiter used by the middleware
pub struct RateLimiter {
    backend: Arc<dyn RateLimitBackend>,
    enabled: bool,
}

impl RateLimiter {
    /// Build the limiter from configuration, choosing a backend
    pub fn from_config(config: &RateLimitConfig, db: Arc<Database>) -> Self {
        let backend: Arc<dyn RateLimitBackend> = match config.backend {
            RateLimitBackendKind::Memory => {
                Arc::new(MemoryBackend::new(config.requests_per_ip, config.window))
            }
            RateLimitBackendKind::Persistent => Arc::new(PersistentBackend::new(
                db,
                config.requests_per_ip,
                config.window,
            )),
        };
        Self {
            backend,
            enabled: config.enabled,
        }
    }

    /// Limiter over an explicit backend (tests)
    pub fn new(backend: Arc<dyn RateLimitBackend>, enabled: bool) -> Self {
        Self { backend, enabled }
    }

    /// Check one request; disabled limiters always allow.
    pub async fn check(&self, client_key: &str) -> crate::Result<RateDecision> {
        if !self.enabled {
            return Ok(RateDecision::Allowed);
        }
        let now_ms = chrono::Utc::now().timestamp_millis();
        self.backend.check(client_key, now_ms).await
    }

    /// Spawn the periodic idle-client sweep for a memory backend
    pub fn spawn_sweeper(
        backend: Arc<MemoryBackend>,
        window: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let interval = (window * 2).max(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                backend.sweep(chrono::Utc::now().timestamp_millis()).await;
            }
        })
    }
}

/// Derive the rate-limit client key from headers and the peer address.
///
/// The rightmost `X-Forwarded-For` entry wins (the hop appended by our own
/// proxy); otherwise the connection's peer address. Ports are stripped and
/// bracketed IPv6 literals unwrapped.
pub fn client_key(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        if let Some(entry) = forwarded.split(',').next_back() {
            let entry = entry.trim();
            if !entry.is_empty() {
                return normalize_address(entry);
            }
        }
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Strip a port and IPv6 brackets from an address-ish string
fn normalize_address(raw: &str) -> String {
    if let Ok(addr) = raw.parse::<SocketAddr>() {
        return addr.ip().to_string();
    }
    if let Ok(ip) = raw.parse::<std::net::IpAddr>() {
        return ip.to_string();
    }
    if let Some(inner) = raw.strip_prefix('[') {
        if let Some(end) = inner.find(']') {
            return inner[..end].to_string();
        }
    }
    // host:port with an IPv4-ish host; bare IPv6 text has multiple colons
    if let Some((host, _port)) = raw.rsplit_once(':') {
        if !host.contains(':') {
            return host.to_string();
        }
    }
    raw.to_string()
}

/// Rate limiting middleware function
pub async fn rate_limit_middleware(
    axum::extract::State(limiter): axum::extract::State<Arc<RateLimiter>>,
    request: Request,
    next: axum::middleware::Next,
) -> Response {
    if EXEMPT_PATHS.contains(&request.uri().path()) {
        return next.run(request).await;
    }

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let key = client_key(request.headers(), peer);

    match limiter.check(&key).await {
        Ok(RateDecision::Allowed) => next.run(request).await,
        Ok(RateDecision::Denied { retry_after_secs }) => (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, retry_after_secs.to_string())],
            Json(ApiError::rate_limited(retry_after_secs)),
        )
            .into_response(),
        Err(e) => {
            // A broken limiter must not take the API down with it
            tracing::error!(error = %e, "rate limiter check failed, allowing request");
            next.run(request).await
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_backend_enforces_the_window() {
        let backend = MemoryBackend::new(3, Duration::from_millis(100));

        // Requests 1-3 pass, request 4 inside the window is denied
        for i in 0..3 {
            assert_eq!(
                backend.check("c", 1_000 + i).await.unwrap(),
                RateDecision::Allowed,
                "request {i}"
            );
        }
        match backend.check("c", 1_050).await.unwrap() {
            RateDecision::Denied { retry_after_secs } => assert!(retry_after_secs >= 1),
            other => panic!("expected denial, got {other:?}"),
        }

        // 150ms later the window has slid past the first burst
        assert_eq!(
            backend.check("c", 1_200).await.unwrap(),
            RateDecision::Allowed
        );
    }

    #[tokio::test]
    async fn memory_backend_isolates_clients() {
        let backend = MemoryBackend::new(1, Duration::from_secs(60));

        assert_eq!(backend.check("a", 0).await.unwrap(), RateDecision::Allowed);
        assert!(matches!(
            backend.check("a", 1).await.unwrap(),
            RateDecision::Denied { .. }
        ));
        assert_eq!(backend.check("b", 1).await.unwrap(), RateDecision::Allowed);
    }

    #[tokio::test]
    async fn memory_sweep_evicts_idle_clients() {
        let backend = MemoryBackend::new(5, Duration::from_millis(50));

        backend.check("idle", 0).await.unwrap();
        backend.check("busy", 0).await.unwrap();
        assert_eq!(backend.tracked_clients().await, 2);

        // "busy" stays active past the 2W idle cutoff; "idle" does not
        backend.check("busy", 120).await.unwrap();
        backend.sweep(150).await;

        assert_eq!(backend.tracked_clients().await, 1);
    }

    #[tokio::test]
    async fn persistent_backend_enforces_the_window() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let backend = PersistentBackend::new(db, 3, Duration::from_millis(100));

        for i in 0..3 {
            assert_eq!(
                backend.check("c", 1_000 + i).await.unwrap(),
                RateDecision::Allowed
            );
        }
        assert!(matches!(
            backend.check("c", 1_050).await.unwrap(),
            RateDecision::Denied { .. }
        ));
        assert_eq!(
            backend.check("c", 1_200).await.unwrap(),
            RateDecision::Allowed
        );
    }

    #[tokio::test]
    async fn persistent_backend_concurrent_burst_allows_exactly_the_cap() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let backend = Arc::new(PersistentBackend::new(db, 10, Duration::from_secs(60)));

        let now = chrono::Utc::now().timestamp_millis();
        let mut handles = Vec::new();
        for _ in 0..15 {
            let backend = backend.clone();
            handles.push(tokio::spawn(
                async move { backend.check("burst", now).await },
            ));
        }

        let mut allowed = 0;
        let mut denied = 0;
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                RateDecision::Allowed => allowed += 1,
                RateDecision::Denied { .. } => denied += 1,
            }
        }

        assert_eq!(allowed, 10, "exactly the cap may pass");
        assert_eq!(denied, 5);
    }

    #[tokio::test]
    async fn disabled_limiter_always_allows() {
        let backend = Arc::new(MemoryBackend::new(1, Duration::from_secs(60)));
        let limiter = RateLimiter::new(backend, false);

        for _ in 0..10 {
            assert_eq!(limiter.check("c").await.unwrap(), RateDecision::Allowed);
        }
    }

    #[test]
    fn client_key_prefers_rightmost_forwarded_entry() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            "203.0.113.7, 198.51.100.2, 192.0.2.1".parse().unwrap(),
        );
        let peer: SocketAddr = "10.0.0.1:9999".parse().unwrap();

        assert_eq!(client_key(&headers, Some(peer)), "192.0.2.1");
    }

    #[test]
    fn client_key_falls_back_to_peer_address() {
        let headers = HeaderMap::new();
        let peer: SocketAddr = "10.0.0.1:9999".parse().unwrap();
        assert_eq!(client_key(&headers, Some(peer)), "10.0.0.1");
        assert_eq!(client_key(&headers, None), "unknown");
    }

    #[test]
    fn normalize_address_strips_ports_and_brackets() {
        assert_eq!(normalize_address("192.0.2.1:8080"), "192.0.2.1");
        assert_eq!(normalize_address("192.0.2.1"), "192.0.2.1");
        assert_eq!(normalize_address("[2001:db8::1]:443"), "2001:db8::1");
        assert_eq!(normalize_address("[2001:db8::1]"), "2001:db8::1");
        assert_eq!(normalize_address("2001:db8::1"), "2001:db8::1");
        assert_eq!(normalize_address("example.internal:80"), "example.internal");
    }

    #[test]
    fn retry_after_is_at_least_one_second() {
        assert_eq!(retry_after_secs(1_000, 100, 1_050), 1);
        assert_eq!(retry_after_secs(0, 60_000, 10_000), 50);
        assert_eq!(retry_after_secs(0, 1_000, 5_000), 1);
    }
}
