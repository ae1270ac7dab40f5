//! Central configuration constants for runtime limits and defaults, plus the
//! JSON settings file that overrides them.

mod settings;

pub use settings::{
    AppliesTo, ConfigError, EndpointSpec, EngineConfig, ErrorBudgetSettings, HttpSettings,
    QuotaSettings, RateLimitSettings, TargetQuotaSettings,
};

/// Updates per commit transaction.
pub const DEFAULT_BATCH_SIZE: usize = 200;

/// Smallest accepted batch size.
pub const MIN_BATCH_SIZE: usize = 1;

/// Largest accepted batch size.
pub const MAX_BATCH_SIZE: usize = 10_000;

/// How long a tracker may stay Running before it is force-finished. 1 hour.
pub const DEFAULT_MAX_DELAY_SECS: u64 = 60 * 60;

/// Delay before the next attempt when the remote gives no `Expires`. 20 minutes.
pub const DEFAULT_RESCHEDULE_DELAY_SECS: u64 = 20 * 60;

/// Default number of trackers synchronized at once.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Minimum allowed worker concurrency.
pub const MIN_CONCURRENCY: usize = 1;

/// Maximum allowed worker concurrency.
pub const MAX_CONCURRENCY: usize = 64;

/// Seconds between scheduler ticks in watch mode.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;

/// Below this many remaining remote errors every caller cools down.
pub const DEFAULT_ERROR_THRESHOLD: u32 = 10;

/// Added on top of the remote's reset countdown.
pub const DEFAULT_ERROR_MARGIN_SECS: u64 = 1;

/// Default bucket refill per second and burst size.
pub const DEFAULT_RATE_PER_SECOND: u32 = 20;
pub const DEFAULT_RATE_BURST: u32 = 20;

/// Rate buckets kept before the least recently used is evicted.
pub const DEFAULT_BUCKET_CAPACITY: usize = 1024;

/// Rate buckets unused this long are dropped. 10 minutes.
pub const DEFAULT_BUCKET_TTL_SECS: u64 = 10 * 60;

/// Extra attempts after a transport failure.
pub const DEFAULT_HTTP_RETRIES: u32 = 2;

/// Safety cap on pages walked per fetch.
pub const DEFAULT_MAX_PAGES: u32 = 1000;

/// Convenience function to clamp a concurrency value into allowed range.
pub fn clamp_concurrency(v: usize) -> usize {
    v.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY)
}

pub fn clamp_batch_size(v: usize) -> usize {
    v.clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE)
}
