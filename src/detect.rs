//! Rate-limit header detection across vendor conventions.

use chrono::{DateTime, Utc};
use http::{HeaderMap, StatusCode};
use serde::Serialize;
use std::collections::BTreeMap;

/// Assumed window when a limit is found without a usable reset.
const DEFAULT_WINDOW_SECS: u64 = 3600;
/// Conservative limit guess when only a 429 with Retry-After is available.
const FALLBACK_429_LIMIT: u32 = 10;
/// Reset values above this are candidate epoch timestamps.
const EPOCH_FLOOR: u64 = 1_000_000_000;
/// Reset values below this are taken as relative offsets in seconds.
const RELATIVE_CAP: u64 = 86_400;

/// One vendor's header naming convention.
struct Convention {
    source: &'static str,
    limit: &'static str,
    remaining: Option<&'static str>,
    reset: Option<&'static str>,
    /// Limit header carries a composite `current/max` value
    composite: bool,
}

/// Scanned top to bottom; the first convention whose limit header is present
/// claims the result. The order is part of the contract.
const CONVENTIONS: &[Convention] = &[
    // GitHub, GitLab style
    Convention {
        source: "x-ratelimit",
        limit: "x-ratelimit-limit",
        remaining: Some("x-ratelimit-remaining"),
        reset: Some("x-ratelimit-reset"),
        composite: false,
    },
    // Twitter style
    Convention {
        source: "x-rate-limit",
        limit: "x-rate-limit-limit",
        remaining: Some("x-rate-limit-remaining"),
        reset: Some("x-rate-limit-reset"),
        composite: false,
    },
    // RateLimit headers from the IETF draft
    Convention {
        source: "ratelimit",
        limit: "ratelimit-limit",
        remaining: Some("ratelimit-remaining"),
        reset: Some("ratelimit-reset"),
        composite: false,
    },
    // Cloudflare style
    Convention {
        source: "cloudflare",
        limit: "cf-ratelimit-limit",
        remaining: Some("cf-ratelimit-remaining"),
        reset: Some("cf-ratelimit-reset"),
        composite: false,
    },
    // AWS API Gateway style
    Convention {
        source: "aws",
        limit: "x-amzn-ratelimit-limit",
        remaining: Some("x-amzn-ratelimit-remaining"),
        reset: Some("x-amzn-ratelimit-reset"),
        composite: false,
    },
    // Shopify style, e.g. "17/40"
    Convention {
        source: "shopify",
        limit: "x-shopify-shop-api-call-limit",
        remaining: None,
        reset: None,
        composite: true,
    },
    // Stripe style
    Convention {
        source: "stripe",
        limit: "stripe-ratelimit-limit",
        remaining: Some("stripe-ratelimit-remaining"),
        reset: Some("stripe-ratelimit-reset"),
        composite: false,
    },
];

/// Vendor-specific quota headers consulted only when no convention matched.
const QUOTA_HEADERS: &[&str] = &[
    "x-rps-limit",
    "x-requests-per-second",
    "x-quota-limit",
    "api-rate-limit",
    "rate-limit",
    "x-api-rate-limit",
];

/// What a response's headers reveal about the upstream's rate limiting.
///
/// All fields except `source` may be absent; a response that reveals nothing
/// yields the `"unknown"` source with every field unset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetectionResult {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    pub window_secs: Option<u64>,
    pub reset_time: Option<DateTime<Utc>>,
    pub source: String,
}

impl DetectionResult {
    /// Result for a response that revealed nothing.
    pub fn unknown() -> Self {
        Self {
            limit: None,
            remaining: None,
            window_secs: None,
            reset_time: None,
            source: "unknown".to_string(),
        }
    }

    /// True when both a limit and a window were recovered, i.e. the result
    /// can be fed into an admission policy.
    pub fn is_actionable(&self) -> bool {
        self.limit.is_some() && self.window_secs.is_some()
    }
}

/// Inspect a response's headers (and status) for rate-limit information.
///
/// Free of side effects; the clock only participates in disambiguating
/// absolute reset timestamps from relative offsets.
pub fn detect(headers: &HeaderMap, status: StatusCode) -> DetectionResult {
    detect_at(headers, status, Utc::now())
}

fn detect_at(headers: &HeaderMap, status: StatusCode, now: DateTime<Utc>) -> DetectionResult {
    let mut result = DetectionResult::unknown();
    let mut matched = false;

    for convention in CONVENTIONS {
        let Some(raw_limit) = header_str(headers, convention.limit) else {
            continue;
        };

        if convention.composite && raw_limit.contains('/') {
            if let Some((current, max)) = parse_composite(raw_limit) {
                result.limit = Some(max);
                result.remaining = Some(max.saturating_sub(current));
            }
        } else {
            result.limit = leading_u32(raw_limit);
            result.remaining = convention
                .remaining
                .and_then(|name| header_str(headers, name))
                .and_then(leading_u32);
        }
        result.source = convention.source.to_string();

        if let Some(reset) = convention
            .reset
            .and_then(|name| header_str(headers, name))
            .and_then(leading_u64)
        {
            let now_epoch = now.timestamp().max(0) as u64;
            if reset > EPOCH_FLOOR && reset > now_epoch {
                result.window_secs = Some(reset - now_epoch);
                result.reset_time = DateTime::from_timestamp(reset as i64, 0);
            } else if reset < RELATIVE_CAP {
                // Zero reads as "no usable window".
                if reset > 0 {
                    result.window_secs = Some(reset);
                }
                result.reset_time = Some(now + chrono::Duration::seconds(reset as i64));
            }
            // Values between the two thresholds are ambiguous and ignored.
        }

        if result.window_secs.is_none() {
            result.window_secs = Some(DEFAULT_WINDOW_SECS);
        }

        // Presence claims the scan even when the value did not parse.
        matched = true;
        break;
    }

    if !matched && status == StatusCode::TOO_MANY_REQUESTS {
        if let Some(retry_after) = header_str(headers, "retry-after").and_then(leading_u64) {
            result.window_secs = Some(retry_after);
            result.limit = Some(FALLBACK_429_LIMIT);
            result.source = "retry-after-429".to_string();
        }
    }

    if !matched && result.limit.is_none() {
        for header in QUOTA_HEADERS {
            if let Some(limit) = header_str(headers, header).and_then(leading_u32) {
                result.limit = Some(limit);
                result.window_secs = Some(DEFAULT_WINDOW_SECS);
                result.source = format!("custom-{header}");
                break;
            }
        }
    }

    result
}

/// Rate-limit related headers from a response, for echoing back to callers.
pub fn rate_limit_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| {
            let name = name.as_str();
            name.contains("ratelimit") || name.contains("rate-limit") || name.contains("retry-after")
        })
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Leading decimal digits of a header value, tolerating structured suffixes
/// such as `100;w=60`.
fn leading_u64(value: &str) -> Option<u64> {
    let trimmed = value.trim_start();
    let end = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    trimmed[..end].parse().ok()
}

fn leading_u32(value: &str) -> Option<u32> {
    leading_u64(value).and_then(|v| u32::try_from(v).ok())
}

fn parse_composite(value: &str) -> Option<(u32, u32)> {
    let (current, max) = value.split_once('/')?;
    Some((leading_u32(current)?, leading_u32(max)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, value.parse().unwrap());
        }
        map
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_github_style_with_absolute_reset() {
        let now = fixed_now();
        let reset = now.timestamp() as u64 + 1800;
        let headers = headers(&[
            ("x-ratelimit-limit", "5000"),
            ("x-ratelimit-remaining", "4987"),
            ("x-ratelimit-reset", &reset.to_string()),
        ]);

        let result = detect_at(&headers, StatusCode::OK, now);
        assert_eq!(result.limit, Some(5000));
        assert_eq!(result.remaining, Some(4987));
        assert_eq!(result.window_secs, Some(1800));
        assert_eq!(result.reset_time, DateTime::from_timestamp(reset as i64, 0));
        assert_eq!(result.source, "x-ratelimit");
    }

    #[test]
    fn test_first_present_convention_wins() {
        let headers = headers(&[
            ("ratelimit-limit", "60"),
            ("x-rate-limit-limit", "900"),
        ]);

        let result = detect_at(&headers, StatusCode::OK, fixed_now());
        assert_eq!(result.source, "x-rate-limit");
        assert_eq!(result.limit, Some(900));
    }

    #[test]
    fn test_shopify_composite_value() {
        let headers = headers(&[("x-shopify-shop-api-call-limit", "17/40")]);

        let result = detect_at(&headers, StatusCode::OK, fixed_now());
        assert_eq!(result.limit, Some(40));
        assert_eq!(result.remaining, Some(23));
        assert_eq!(result.window_secs, Some(3600));
        assert_eq!(result.source, "shopify");
    }

    #[test]
    fn test_relative_reset_offset() {
        let now = fixed_now();
        let headers = headers(&[("ratelimit-limit", "60"), ("ratelimit-reset", "120")]);

        let result = detect_at(&headers, StatusCode::OK, now);
        assert_eq!(result.window_secs, Some(120));
        assert_eq!(result.reset_time, Some(now + chrono::Duration::seconds(120)));
        assert_eq!(result.source, "ratelimit");
    }

    #[test]
    fn test_ambiguous_reset_value_is_ignored() {
        // Too large for a relative offset, too small for an epoch timestamp.
        let headers = headers(&[("x-ratelimit-limit", "100"), ("x-ratelimit-reset", "500000")]);

        let result = detect_at(&headers, StatusCode::OK, fixed_now());
        assert_eq!(result.limit, Some(100));
        assert_eq!(result.window_secs, Some(3600));
        assert_eq!(result.reset_time, None);
    }

    #[test]
    fn test_epoch_reset_in_the_past_is_ignored() {
        let now = fixed_now();
        let stale = (now.timestamp() - 600).to_string();
        let headers = headers(&[("x-ratelimit-limit", "100"), ("x-ratelimit-reset", &stale)]);

        let result = detect_at(&headers, StatusCode::OK, now);
        assert_eq!(result.window_secs, Some(3600));
        assert_eq!(result.reset_time, None);
    }

    #[test]
    fn test_structured_header_values_parse_leading_digits() {
        let headers = headers(&[("ratelimit-limit", "100;w=60")]);

        let result = detect_at(&headers, StatusCode::OK, fixed_now());
        assert_eq!(result.limit, Some(100));
    }

    #[test]
    fn test_retry_after_fallback_needs_a_429() {
        let headers = headers(&[("retry-after", "30")]);

        let limited = detect_at(&headers, StatusCode::TOO_MANY_REQUESTS, fixed_now());
        assert_eq!(limited.limit, Some(10));
        assert_eq!(limited.window_secs, Some(30));
        assert_eq!(limited.source, "retry-after-429");

        let ok = detect_at(&headers, StatusCode::OK, fixed_now());
        assert_eq!(ok, DetectionResult::unknown());
    }

    #[test]
    fn test_retry_after_does_not_override_a_matched_convention() {
        let headers = headers(&[("x-ratelimit-limit", "100"), ("retry-after", "30")]);

        let result = detect_at(&headers, StatusCode::TOO_MANY_REQUESTS, fixed_now());
        assert_eq!(result.source, "x-ratelimit");
        assert_eq!(result.limit, Some(100));
        assert_eq!(result.window_secs, Some(3600));
    }

    #[test]
    fn test_quota_header_scan_in_declared_order() {
        let headers = headers(&[("x-quota-limit", "250"), ("rate-limit", "50")]);

        let result = detect_at(&headers, StatusCode::OK, fixed_now());
        assert_eq!(result.limit, Some(250));
        assert_eq!(result.window_secs, Some(3600));
        assert_eq!(result.source, "custom-x-quota-limit");
    }

    #[test]
    fn test_no_information_yields_unknown() {
        let headers = headers(&[("content-type", "application/json")]);

        let result = detect_at(&headers, StatusCode::OK, fixed_now());
        assert_eq!(result, DetectionResult::unknown());
        assert!(!result.is_actionable());
    }

    #[test]
    fn test_header_names_are_case_insensitive() {
        let mut map = HeaderMap::new();
        map.insert("X-RateLimit-Limit", "75".parse().unwrap());

        let result = detect_at(&map, StatusCode::OK, fixed_now());
        assert_eq!(result.limit, Some(75));
    }

    #[test]
    fn test_unparseable_limit_still_claims_the_scan() {
        let headers = headers(&[("x-ratelimit-limit", "unavailable"), ("retry-after", "30")]);

        let result = detect_at(&headers, StatusCode::TOO_MANY_REQUESTS, fixed_now());
        assert_eq!(result.limit, None);
        assert_eq!(result.source, "x-ratelimit");
        assert_eq!(result.window_secs, Some(3600));
        assert!(!result.is_actionable());
    }

    #[test]
    fn test_detection_is_deterministic() {
        let now = fixed_now();
        let headers = headers(&[
            ("x-shopify-shop-api-call-limit", "39/40"),
            ("retry-after", "12"),
        ]);

        let first = detect_at(&headers, StatusCode::TOO_MANY_REQUESTS, now);
        let second = detect_at(&headers, StatusCode::TOO_MANY_REQUESTS, now);
        assert_eq!(first, second);
    }

    #[test]
    fn test_rate_limit_header_filter() {
        let headers = headers(&[
            ("x-ratelimit-limit", "100"),
            ("retry-after", "30"),
            ("content-type", "application/json"),
            ("x-rate-limit-remaining", "4"),
        ]);

        let filtered = rate_limit_headers(&headers);
        assert_eq!(filtered.len(), 3);
        assert_eq!(filtered["x-ratelimit-limit"], "100");
        assert_eq!(filtered["retry-after"], "30");
        assert_eq!(filtered["x-rate-limit-remaining"], "4");
        assert!(!filtered.contains_key("content-type"));
    }
}
