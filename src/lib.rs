//! Floodgate - Adaptive Admission Control
//!
//! This crate implements an HTTP-facing admission control service built
//! around three cooperating pieces: a sliding-window rate limiter with an
//! explicit cooldown state, a pure detector that recognizes rate-limit
//! headers across vendor conventions, and a cancellable probe that floods a
//! target to discover its limits empirically. Detection results feed back
//! into the limiter so local policy converges on what upstreams enforce.

pub mod http;
pub mod ratelimit;
pub mod detect;
pub mod probe;
pub mod config;
pub mod error;
