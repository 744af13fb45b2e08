//! Per-identifier admission state and policy types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::time::{Duration, Instant};

/// Where a limit configuration came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitSource {
    /// Process-wide defaults
    Default,
    /// Learned from upstream response headers
    Detected,
    /// Supplied by a caller
    Custom,
}

/// Admission policy for one identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LimitConfig {
    /// Maximum admitted requests per window
    pub max_requests: u32,
    /// Window length; doubles as the cooldown length once blocked
    #[serde(rename = "window_secs", serialize_with = "serialize_secs")]
    pub window: Duration,
    /// Provenance of this policy
    pub source: LimitSource,
}

fn serialize_secs<S: Serializer>(window: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(window.as_secs())
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmitResult {
    /// Whether the request was admitted
    pub allowed: bool,
    /// Seconds until the identifier unblocks; zero when admitted
    pub time_left_secs: u64,
    /// Requests currently counted against the identifier
    pub current_count: u32,
}

/// Whether an identifier is admitting requests or cooling down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierStatus {
    Active,
    Blocked,
}

/// Point-in-time view of one tracked identifier.
#[derive(Debug, Clone, Serialize)]
pub struct IdentifierSnapshot {
    pub id: String,
    pub current_count: u32,
    pub status: IdentifierStatus,
    pub time_left_secs: u64,
    pub last_request_at: Option<DateTime<Utc>>,
    pub limits: LimitConfig,
}

/// Mutable admission state for one identifier.
///
/// All fields are read and written under the owning map's entry guard.
#[derive(Debug, Default)]
pub(super) struct IdentifierEntry {
    /// Configured policy; `None` falls back to the limiter's defaults
    pub(super) config: Option<LimitConfig>,
    /// Admission timestamps within (roughly) the current window
    pub(super) requests: Vec<Instant>,
    /// Whether the identifier is in cooldown
    pub(super) blocked: bool,
    /// Cooldown expiry; always set while `blocked` is true
    pub(super) blocked_until: Option<Instant>,
    /// Wall-clock time of the last admitted request
    pub(super) last_request: Option<DateTime<Utc>>,
}
