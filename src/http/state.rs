//! Shared state behind the HTTP surface.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::config::FloodgateConfig;
use crate::error::Result;
use crate::ratelimit::WindowLimiter;

/// Network info for a client identifier, resolved best-effort.
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub ip: String,
    pub city: Option<String>,
    pub region: Option<String>,
    pub country: Option<String>,
    pub org: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loc: Option<String>,
    pub source: String,
}

impl ClientInfo {
    fn local() -> Self {
        Self {
            ip: "localhost".to_string(),
            city: Some("Local".to_string()),
            region: Some("Local".to_string()),
            country: Some("LOCAL".to_string()),
            org: Some("Local Network".to_string()),
            loc: None,
            source: "local".to_string(),
        }
    }

    fn unresolved(ip: &str) -> Self {
        Self {
            ip: ip.to_string(),
            city: None,
            region: None,
            country: None,
            org: None,
            loc: None,
            source: "unresolved".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct IpInfoResponse {
    ip: Option<String>,
    city: Option<String>,
    region: Option<String>,
    country: Option<String>,
    org: Option<String>,
    loc: Option<String>,
}

/// Last caller that touched a tested URL.
#[derive(Debug, Clone, Serialize)]
pub struct LastClient {
    pub client: String,
    pub info: ClientInfo,
    pub at: DateTime<Utc>,
}

/// Everything the handlers share: one limiter per logical purpose, the
/// outbound HTTP client, and bookkeeping that survives window resets.
pub struct AppState {
    /// Admission control for API callers, keyed by client identifier
    pub clients: Arc<WindowLimiter>,
    /// Admission control for tested URLs, keyed by URL
    pub urls: Arc<WindowLimiter>,
    /// Admission control for custom endpoints, keyed by URL
    pub custom: Arc<WindowLimiter>,
    /// Shared client for upstream requests and info lookups
    pub http: reqwest::Client,
    pub config: FloodgateConfig,

    /// Cumulative admission counters; unaffected by window resets
    pub admitted_clients: AtomicU64,
    pub admitted_urls: AtomicU64,
    pub admitted_custom: AtomicU64,

    pub last_client_for_url: DashMap<String, LastClient>,
    pub last_client_for_custom: DashMap<String, LastClient>,

    client_info_cache: DashMap<String, ClientInfo>,
    started: Instant,
}

impl AppState {
    pub fn new(config: FloodgateConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.server.upstream_timeout())
            .user_agent(concat!("floodgate/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let limits = &config.limits;
        Ok(Self {
            clients: Arc::new(WindowLimiter::new(limits.max_requests, limits.window())),
            urls: Arc::new(WindowLimiter::new(limits.max_requests, limits.window())),
            custom: Arc::new(WindowLimiter::new(limits.max_requests, limits.window())),
            http,
            config,
            admitted_clients: AtomicU64::new(0),
            admitted_urls: AtomicU64::new(0),
            admitted_custom: AtomicU64::new(0),
            last_client_for_url: DashMap::new(),
            last_client_for_custom: DashMap::new(),
            client_info_cache: DashMap::new(),
            started: Instant::now(),
        })
    }

    /// Seconds since the service started.
    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// Resolve network info for a client identifier, consulting the cache
    /// first. Lookup failures degrade to an unresolved stub; they never
    /// propagate.
    pub async fn client_info(&self, id: &str) -> ClientInfo {
        if id.is_empty() || id == "localhost" {
            return ClientInfo::local();
        }
        if let Some(cached) = self.client_info_cache.get(id) {
            return cached.clone();
        }

        let info = match self.lookup_client_info(id).await {
            Ok(info) => info,
            Err(err) => {
                debug!(id = %id, error = %err, "client info lookup failed");
                ClientInfo::unresolved(id)
            }
        };
        self.client_info_cache.insert(id.to_string(), info.clone());
        info
    }

    async fn lookup_client_info(&self, id: &str) -> Result<ClientInfo> {
        let url = match &self.config.server.ipinfo_token {
            Some(token) => format!("https://ipinfo.io/{id}?token={token}"),
            None => format!("https://ipinfo.io/{id}"),
        };
        let raw: IpInfoResponse = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(ClientInfo {
            ip: raw.ip.unwrap_or_else(|| id.to_string()),
            city: raw.city,
            region: raw.region,
            country: raw.country,
            org: raw.org,
            loc: raw.loc,
            source: "ipinfo".to_string(),
        })
    }

    /// Drop all limiter state, counters, and tracking maps.
    pub fn clear(&self) {
        self.clients.clear();
        self.urls.clear();
        self.custom.clear();
        self.admitted_clients.store(0, Ordering::Relaxed);
        self.admitted_urls.store(0, Ordering::Relaxed);
        self.admitted_custom.store(0, Ordering::Relaxed);
        self.last_client_for_url.clear();
        self.last_client_for_custom.clear();
    }
}
