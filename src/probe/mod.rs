//! Upstream probing: discover a target's rate limits by flooding it.

mod orchestrator;
mod report;

pub use orchestrator::{ProbeOrchestrator, ProbePolicy};
pub use report::{ProbeFailure, ProbeOutcome, ProbeReport, ResponseLog};
