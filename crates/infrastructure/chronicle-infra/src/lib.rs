pub mod error;
pub mod net;
pub mod throttle;

// Re-exports for convenience
pub use error::{ErrorInfo, FetchError};
pub use net::{ApiClient, ApiRequest, Fetched, RawData};
pub use throttle::{ErrorBudget, RateLimitPolicy, RateLimiterRegistry, RateQuota};
