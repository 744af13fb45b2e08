//! Admission control state and logic.

mod entry;
mod limiter;

pub use entry::{AdmitResult, IdentifierSnapshot, IdentifierStatus, LimitConfig, LimitSource};
pub use limiter::WindowLimiter;
