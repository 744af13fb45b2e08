//! Sliding-window admission control with an explicit block state.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{FloodgateError, Result};

use super::entry::{
    AdmitResult, IdentifierEntry, IdentifierSnapshot, IdentifierStatus, LimitConfig, LimitSource,
};

/// Upper bound on a block's cooldown. Windows larger than this still govern
/// request pruning, but the cooldown deadline is capped so the instant math
/// cannot overflow no matter what window a caller or a response header
/// supplies.
const MAX_COOLDOWN: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Keyed admission controller.
///
/// Each identifier owns a list of admission timestamps and an explicit
/// blocked/cooldown state. Once an identifier exceeds its limit it is blocked
/// for one full window; when the cooldown lapses the whole window restarts
/// from zero rather than sliding. All per-identifier mutation happens under
/// the map's entry guard, so concurrent checks for the same identifier are
/// serialized while different identifiers proceed in parallel.
pub struct WindowLimiter {
    entries: DashMap<String, IdentifierEntry>,
    defaults: LimitConfig,
}

impl WindowLimiter {
    /// Create a limiter with the given default policy.
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            defaults: LimitConfig {
                max_requests,
                window,
                source: LimitSource::Default,
            },
        }
    }

    /// Run one admission check for `id`, recording the request if admitted.
    pub fn check_limit(&self, id: &str) -> AdmitResult {
        self.check_limit_at(id, Instant::now())
    }

    fn check_limit_at(&self, id: &str, now: Instant) -> AdmitResult {
        let mut entry = self.entries.entry(id.to_string()).or_default();
        let limits = entry.config.unwrap_or(self.defaults);

        trace!(id = %id, limit = limits.max_requests, "checking admission");

        if entry.blocked {
            if let Some(until) = entry.blocked_until {
                // A request landing exactly at the boundary is unblocked.
                if now < until {
                    return AdmitResult {
                        allowed: false,
                        time_left_secs: ceil_secs(until.duration_since(now)),
                        current_count: entry.requests.len() as u32,
                    };
                }
            }
            debug!(id = %id, "cooldown elapsed, window restarts");
            entry.blocked = false;
            entry.blocked_until = None;
            entry.requests.clear();
        }

        entry
            .requests
            .retain(|t| now.duration_since(*t) < limits.window);

        if entry.requests.len() >= limits.max_requests as usize {
            let cooldown = limits.window.min(MAX_COOLDOWN);
            entry.blocked = true;
            // A deadline past the clock's range reads as already elapsed.
            entry.blocked_until = now.checked_add(cooldown);
            debug!(
                id = %id,
                count = entry.requests.len(),
                limit = limits.max_requests,
                "limit exceeded, blocking"
            );
            return AdmitResult {
                allowed: false,
                time_left_secs: ceil_secs(cooldown),
                current_count: entry.requests.len() as u32,
            };
        }

        entry.requests.push(now);
        entry.last_request = Some(chrono::Utc::now());
        AdmitResult {
            allowed: true,
            time_left_secs: 0,
            current_count: entry.requests.len() as u32,
        }
    }

    /// Replace the policy for `id`. Request history and blocked state are
    /// untouched; only future checks see the new policy.
    pub fn set_limits(
        &self,
        id: &str,
        max_requests: u32,
        window: Duration,
        source: LimitSource,
    ) -> Result<()> {
        if max_requests == 0 {
            return Err(FloodgateError::InvalidLimits(format!(
                "max_requests must be at least 1 for '{id}'"
            )));
        }
        if window.is_zero() {
            return Err(FloodgateError::InvalidLimits(format!(
                "window must be non-zero for '{id}'"
            )));
        }

        let mut entry = self.entries.entry(id.to_string()).or_default();
        entry.config = Some(LimitConfig {
            max_requests,
            window,
            source,
        });
        debug!(
            id = %id,
            limit = max_requests,
            window_secs = window.as_secs(),
            source = ?source,
            "limits updated"
        );
        Ok(())
    }

    /// Configured (detected or custom) policy for `id`, without the default
    /// fallback. `None` means the identifier would be governed by defaults.
    pub fn configured_limits(&self, id: &str) -> Option<LimitConfig> {
        self.entries.get(id).and_then(|e| e.config)
    }

    /// Effective policy for `id`: configured if present, defaults otherwise.
    pub fn limits_for(&self, id: &str) -> LimitConfig {
        self.configured_limits(id).unwrap_or(self.defaults)
    }

    /// Requests recorded for `id` that are still inside its window. A pure
    /// read: nothing is pruned and no block state changes.
    pub fn current_usage(&self, id: &str) -> u32 {
        self.usage_at(id, Instant::now())
    }

    fn usage_at(&self, id: &str, now: Instant) -> u32 {
        let Some(entry) = self.entries.get(id) else {
            return 0;
        };
        let limits = entry.config.unwrap_or(self.defaults);
        entry
            .requests
            .iter()
            .filter(|t| now.duration_since(**t) < limits.window)
            .count() as u32
    }

    /// Snapshot every tracked identifier, sorted by identifier.
    ///
    /// Identifiers whose cooldown has lapsed are transitioned to active as a
    /// side effect, so a snapshot never reports a stale block.
    pub fn entries(&self) -> Vec<IdentifierSnapshot> {
        self.entries_at(Instant::now())
    }

    fn entries_at(&self, now: Instant) -> Vec<IdentifierSnapshot> {
        let mut snapshots = Vec::with_capacity(self.entries.len());
        for mut item in self.entries.iter_mut() {
            let id = item.key().clone();
            let entry = item.value_mut();
            let limits = entry.config.unwrap_or(self.defaults);

            if entry.blocked {
                match entry.blocked_until {
                    Some(until) if now < until => {}
                    _ => {
                        debug!(id = %id, "cooldown elapsed, window restarts");
                        entry.blocked = false;
                        entry.blocked_until = None;
                        entry.requests.clear();
                    }
                }
            }

            let current_count = entry
                .requests
                .iter()
                .filter(|t| now.duration_since(**t) < limits.window)
                .count() as u32;

            let (status, time_left_secs) = match entry.blocked_until {
                Some(until) if entry.blocked => (
                    IdentifierStatus::Blocked,
                    ceil_secs(until.duration_since(now)),
                ),
                _ => (IdentifierStatus::Active, 0),
            };

            snapshots.push(IdentifierSnapshot {
                id,
                current_count,
                status,
                time_left_secs,
                last_request_at: entry.last_request,
                limits,
            });
        }
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    /// Evict identifiers that are idle: not blocked and with no request left
    /// inside their window. An evicted identifier loses its configured policy
    /// along with its history. Returns the number of evicted identifiers.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|id, entry| {
            let limits = entry.config.unwrap_or(self.defaults);
            entry
                .requests
                .retain(|t| now.duration_since(*t) < limits.window);
            let keep = entry.blocked || !entry.requests.is_empty();
            if !keep {
                trace!(id = %id, "evicting idle identifier");
            }
            keep
        });
        let evicted = before.saturating_sub(self.entries.len());
        if evicted > 0 {
            debug!(evicted, remaining = self.entries.len(), "sweep complete");
        }
        evicted
    }

    /// Run `sweep` on a fixed interval until the returned token is cancelled.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> CancellationToken {
        let token = CancellationToken::new();
        let shutdown = token.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep();
                    }
                    _ = shutdown.cancelled() => {
                        debug!("sweeper shutting down");
                        break;
                    }
                }
            }
        });
        token
    }

    /// Number of tracked identifiers.
    pub fn tracked(&self) -> usize {
        self.entries.len()
    }

    /// Drop all identifier state.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

/// Whole seconds remaining, rounded up so a partial second still reads as 1.
fn ceil_secs(d: Duration) -> u64 {
    d.as_millis().div_ceil(1000) as u64
}
