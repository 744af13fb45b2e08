//! Sequential probe execution against an upstream target.

use chrono::Utc;
use http::{Method, StatusCode};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ProbeConfig;
use crate::detect;

use super::report::ProbeReport;

/// Bounds for a single probe run.
#[derive(Debug, Clone)]
pub struct ProbePolicy {
    /// Hard ceiling on issued requests
    pub max_requests: u32,
    /// Fixed delay between consecutive requests
    pub request_delay: Duration,
    /// Known limit of the target, when probing a configured endpoint
    pub limit_hint: Option<u32>,
    /// Requests issued beyond the hint before giving up
    pub limit_margin: u32,
}

impl ProbePolicy {
    pub fn from_config(config: &ProbeConfig) -> Self {
        Self {
            max_requests: config.max_requests,
            request_delay: config.request_delay(),
            limit_hint: None,
            limit_margin: config.limit_margin,
        }
    }

    /// Probe a target whose limit is already known; the budget shrinks to
    /// just past the hint.
    pub fn with_limit_hint(mut self, hint: u32) -> Self {
        self.limit_hint = Some(hint);
        self
    }

    /// Request budget for one run: the hard ceiling, or for a hinted target
    /// the hint plus margin, whichever is smaller.
    pub fn request_budget(&self) -> u32 {
        match self.limit_hint {
            Some(hint) => self.max_requests.min(hint.saturating_add(self.limit_margin)),
            None => self.max_requests,
        }
    }
}

/// Drives one probe run at a time: sequential requests with a fixed delay,
/// stopping on pushback, error status, exhausted budget, or cancellation.
pub struct ProbeOrchestrator {
    client: reqwest::Client,
    policy: ProbePolicy,
}

impl ProbeOrchestrator {
    pub fn new(client: reqwest::Client, policy: ProbePolicy) -> Self {
        Self { client, policy }
    }

    /// Run the probe to a terminal state and report what happened.
    ///
    /// Transport failures are recorded and the run continues; an HTTP error
    /// status stops it. Cancellation is observed between requests and inside
    /// the inter-request delay, never mid-request.
    pub async fn run(
        &self,
        target: &str,
        method: Method,
        cancel: &CancellationToken,
    ) -> ProbeReport {
        let budget = self.policy.request_budget();
        let mut report = ProbeReport::begin(target, &method);
        info!(
            probe_id = %report.probe_id,
            target = %target,
            method = %method,
            budget,
            "starting probe"
        );

        while report.total_requests < budget && !cancel.is_cancelled() {
            report.total_requests += 1;
            let number = report.total_requests;
            let started = Instant::now();

            match self.send(target, &method).await {
                Ok(response) => {
                    let status = response.status();
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    let headers = response.headers().clone();
                    report.record_response(
                        number,
                        status.as_u16(),
                        elapsed_ms,
                        detect::rate_limit_headers(&headers),
                    );

                    if status.as_u16() >= 400 {
                        if status == StatusCode::TOO_MANY_REQUESTS {
                            report.rate_limit_hit = true;
                            report.rate_limit_at = Some(number);
                            report.detected_limits = Some(detect::detect(&headers, status));
                            debug!(request = number, "rate limit hit, stopping");
                        } else {
                            report.error_at = Some(number);
                            report.error_status = Some(status.as_u16());
                            debug!(
                                request = number,
                                status = status.as_u16(),
                                "error status, stopping"
                            );
                        }
                        break;
                    }

                    report.successful_requests += 1;
                    if report.successful_requests == 1 && report.detected_limits.is_none() {
                        report.detected_limits = Some(detect::detect(&headers, status));
                    }
                }
                Err(err) => {
                    warn!(request = number, error = %err, "probe request failed");
                    report.record_failure(number, err.to_string());
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.policy.request_delay) => {}
            }
        }

        report.finalize(cancel.is_cancelled());
        info!(
            probe_id = %report.probe_id,
            outcome = ?report.outcome,
            total = report.total_requests,
            successful = report.successful_requests,
            "probe finished"
        );
        report
    }

    async fn send(&self, target: &str, method: &Method) -> reqwest::Result<reqwest::Response> {
        let mut request = self.client.request(method.clone(), target);
        if matches!(*method, Method::POST | Method::PUT | Method::PATCH) {
            request = request.json(&serde_json::json!({
                "test": true,
                "timestamp": Utc::now().timestamp_millis(),
            }));
        }
        request.send().await
    }
}
