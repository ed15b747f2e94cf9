//! Per-client request admission.
//!
//! Every request, including the streaming upgrade, consumes one unit of the
//! caller's quota. The whole admission map sits behind a single mutex so the
//! read-modify-write of one decision and the eviction sweep never interleave.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, warn};

use crate::{config::AdmissionConfig, AppState, ErrorBody};

const UNKNOWN_CLIENT: &str = "unknown";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("too many requests")]
    TooManyRequests,
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        match self {
            AdmissionError::TooManyRequests => (
                StatusCode::TOO_MANY_REQUESTS,
                Json(ErrorBody::new("too_many_requests")),
            )
                .into_response(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionPolicy {
    pub max_requests: u32,
    pub window: Duration,
    pub retention: Duration,
    pub sweep_interval: Duration,
}

impl From<&AdmissionConfig> for AdmissionPolicy {
    fn from(config: &AdmissionConfig) -> Self {
        Self {
            max_requests: config.max_requests_per_minute,
            window: Duration::from_secs(config.window_secs),
            retention: Duration::from_secs(config.retention_secs),
            sweep_interval: Duration::from_secs(config.sweep_interval_secs),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct AdmissionRecord {
    remaining_quota: u32,
    window_started_at: Instant,
    last_seen_at: Instant,
}

pub struct AdmissionController {
    policy: AdmissionPolicy,
    records: Mutex<HashMap<String, AdmissionRecord>>,
}

impl AdmissionController {
    pub fn new(policy: AdmissionPolicy) -> Arc<Self> {
        Arc::new(Self {
            policy,
            records: Mutex::new(HashMap::new()),
        })
    }

    pub fn policy(&self) -> AdmissionPolicy {
        self.policy
    }

    /// Admit or reject one request from `key`, returning the quota left.
    pub async fn admit(&self, key: &str) -> Result<u32, AdmissionError> {
        self.admit_at(key, Instant::now()).await
    }

    pub(crate) async fn admit_at(&self, key: &str, now: Instant) -> Result<u32, AdmissionError> {
        let mut records = self.records.lock().await;

        let Some(record) = records.get_mut(key) else {
            let remaining_quota = self.policy.max_requests.saturating_sub(1);
            records.insert(
                key.to_string(),
                AdmissionRecord {
                    remaining_quota,
                    window_started_at: now,
                    last_seen_at: now,
                },
            );
            return Ok(remaining_quota);
        };

        if now.saturating_duration_since(record.window_started_at) >= self.policy.window {
            record.remaining_quota = self.policy.max_requests;
            record.window_started_at = now;
        }
        record.last_seen_at = now;

        if record.remaining_quota == 0 {
            return Err(AdmissionError::TooManyRequests);
        }
        record.remaining_quota -= 1;
        Ok(record.remaining_quota)
    }

    /// Drop records idle longer than the retention window. Returns how many went.
    pub async fn sweep(&self) -> usize {
        self.sweep_at(Instant::now()).await
    }

    pub(crate) async fn sweep_at(&self, now: Instant) -> usize {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, record| {
            now.saturating_duration_since(record.last_seen_at) <= self.policy.retention
        });
        before - records.len()
    }

    #[cfg(test)]
    pub(crate) async fn tracked_identities(&self) -> usize {
        self.records.lock().await.len()
    }

    /// Run the eviction sweep on the policy interval until the controller is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let controller: Weak<Self> = Arc::downgrade(self);
        let period = self.policy.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(controller) = controller.upgrade() else {
                    break;
                };
                let evicted = controller.sweep().await;
                if evicted > 0 {
                    debug!(evicted, "evicted idle admission records");
                }
            }
        })
    }
}

/// Identity used for admission: proxy headers when trusted, else the peer IP.
pub fn client_key(headers: &HeaderMap, peer: Option<SocketAddr>, trust_proxy: bool) -> String {
    if trust_proxy {
        let real_ip = headers
            .get("x-real-ip")
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty());
        let forwarded = || {
            headers
                .get("x-forwarded-for")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.split(',').next())
                .map(str::trim)
                .filter(|value| !value.is_empty())
        };
        if let Some(ip) = real_ip.or_else(forwarded) {
            return ip.to_string();
        }
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

pub async fn admission_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let key = client_key(request.headers(), peer, state.trust_proxy_headers());

    match state.admission().admit(&key).await {
        Ok(_) => next.run(request).await,
        Err(err) => {
            warn!(client = %key, path = %request.uri().path(), "request rejected by admission control");
            state.record_admission_rejection();
            err.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn policy(max_requests: u32) -> AdmissionPolicy {
        AdmissionPolicy {
            max_requests,
            window: Duration::from_secs(60),
            retention: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn first_request_consumes_one_unit() {
        let controller = AdmissionController::new(policy(3));
        assert_eq!(controller.admit("10.0.0.1").await, Ok(2));
        assert_eq!(controller.admit("10.0.0.1").await, Ok(1));
        assert_eq!(controller.admit("10.0.0.1").await, Ok(0));
        assert_eq!(
            controller.admit("10.0.0.1").await,
            Err(AdmissionError::TooManyRequests)
        );
        assert_eq!(controller.admit("10.0.0.2").await, Ok(2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_never_exceed_quota() {
        let quota = 10;
        let attempts = 64;
        let controller = AdmissionController::new(policy(quota));

        let handles: Vec<_> = (0..attempts)
            .map(|_| {
                let controller = controller.clone();
                tokio::spawn(async move { controller.admit("burst").await.is_ok() })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.expect("task completes") {
                admitted += 1;
            }
        }
        assert_eq!(admitted, quota as usize);
    }

    #[tokio::test]
    async fn quota_resets_once_window_elapses() {
        let controller = AdmissionController::new(policy(2));
        let start = Instant::now();
        assert!(controller.admit_at("a", start).await.is_ok());
        assert!(controller.admit_at("a", start).await.is_ok());
        assert!(controller.admit_at("a", start).await.is_err());

        let later = start + Duration::from_secs(61);
        assert_eq!(controller.admit_at("a", later).await, Ok(1));
    }

    #[tokio::test]
    async fn rejected_requests_keep_record_alive() {
        let controller = AdmissionController::new(policy(1));
        let start = Instant::now();
        assert!(controller.admit_at("a", start).await.is_ok());

        // Hammering while exhausted refreshes last_seen, so the sweep keeps it.
        let busy = start + Duration::from_secs(30);
        assert!(controller.admit_at("a", busy).await.is_err());
        assert_eq!(controller.sweep_at(busy + Duration::from_secs(299)).await, 0);
        assert_eq!(controller.tracked_identities().await, 1);
    }

    #[tokio::test]
    async fn sweep_evicts_idle_identities_which_return_with_full_quota() {
        let controller = AdmissionController::new(policy(5));
        let start = Instant::now();
        for _ in 0..5 {
            assert!(controller.admit_at("idle", start).await.is_ok());
        }
        assert!(controller.admit_at("fresh", start + Duration::from_secs(200)).await.is_ok());

        let evicted = controller.sweep_at(start + Duration::from_secs(301)).await;
        assert_eq!(evicted, 1);
        assert_eq!(controller.tracked_identities().await, 1);
        assert_eq!(
            controller.admit_at("idle", start + Duration::from_secs(302)).await,
            Ok(4)
        );
    }

    #[test]
    fn client_key_prefers_trusted_proxy_headers() {
        let peer: SocketAddr = "192.0.2.10:4000".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.5, 10.0.0.1"),
        );

        assert_eq!(client_key(&headers, Some(peer), true), "203.0.113.5");
        assert_eq!(client_key(&headers, Some(peer), false), "192.0.2.10");

        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.7"));
        assert_eq!(client_key(&headers, Some(peer), true), "198.51.100.7");
        assert_eq!(client_key(&HeaderMap::new(), None, false), UNKNOWN_CLIENT);
    }
}
