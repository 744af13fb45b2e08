//! Probe run reports.

use chrono::{DateTime, Utc};
use http::Method;
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::detect::DetectionResult;

/// How a probe run ended.
///
/// When several conditions coincide, cancellation wins, then rate limiting,
/// then error stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeOutcome {
    /// Request budget exhausted without pushback
    Completed,
    /// The target answered 429
    RateLimited,
    /// The target answered a non-429 error status
    ErrorStopped,
    /// The run was cancelled before reaching another terminal state
    Cancelled,
}

/// One upstream response observed during a probe.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseLog {
    pub request_number: u32,
    pub status: u16,
    pub elapsed_ms: u64,
    pub timestamp: DateTime<Utc>,
    pub rate_limit_headers: BTreeMap<String, String>,
}

/// A transport-level failure observed during a probe. These do not stop the
/// run; they are collected alongside the responses.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeFailure {
    pub request_number: u32,
    pub message: String,
}

/// Full record of one probe run.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub probe_id: Uuid,
    pub target: String,
    pub method: String,
    pub outcome: ProbeOutcome,
    pub total_requests: u32,
    pub successful_requests: u32,
    pub rate_limit_hit: bool,
    pub rate_limit_at: Option<u32>,
    pub error_at: Option<u32>,
    pub error_status: Option<u16>,
    pub cancelled: bool,
    pub detected_limits: Option<DetectionResult>,
    pub responses: Vec<ResponseLog>,
    pub errors: Vec<ProbeFailure>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl ProbeReport {
    /// Fresh report for a run that is about to start. The outcome is
    /// provisional until [`finalize`](Self::finalize) runs.
    pub(crate) fn begin(target: &str, method: &Method) -> Self {
        Self {
            probe_id: Uuid::new_v4(),
            target: target.to_string(),
            method: method.to_string(),
            outcome: ProbeOutcome::Completed,
            total_requests: 0,
            successful_requests: 0,
            rate_limit_hit: false,
            rate_limit_at: None,
            error_at: None,
            error_status: None,
            cancelled: false,
            detected_limits: None,
            responses: Vec::new(),
            errors: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub(crate) fn record_response(
        &mut self,
        request_number: u32,
        status: u16,
        elapsed_ms: u64,
        rate_limit_headers: BTreeMap<String, String>,
    ) {
        self.responses.push(ResponseLog {
            request_number,
            status,
            elapsed_ms,
            timestamp: Utc::now(),
            rate_limit_headers,
        });
    }

    pub(crate) fn record_failure(&mut self, request_number: u32, message: String) {
        self.errors.push(ProbeFailure {
            request_number,
            message,
        });
    }

    /// Stamp the end time and settle the terminal state.
    pub(crate) fn finalize(&mut self, cancelled: bool) {
        self.cancelled = cancelled;
        self.outcome = if cancelled {
            ProbeOutcome::Cancelled
        } else if self.rate_limit_hit {
            ProbeOutcome::RateLimited
        } else if self.error_at.is_some() {
            ProbeOutcome::ErrorStopped
        } else {
            ProbeOutcome::Completed
        };
        self.ended_at = Some(Utc::now());
    }
}
