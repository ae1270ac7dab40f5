//! Local pacing and the reactive, process-wide error budget.
//!
//! The local buckets only account for calls; they never hold a caller back.
//! The error budget is the one place that blocks, and it blocks everyone.

mod budget;
mod limiter;

pub use budget::ErrorBudget;
pub use limiter::{RateLimitPolicy, RateLimiterRegistry, RateQuota};
