use std::time::Duration;

use tokio::sync::Mutex;

use crate::error::ErrorInfo;

/// The remote's shared error allowance, as seen through its error headers.
///
/// When a rejected call reports fewer remaining errors than `threshold`, the
/// caller enters the single cooldown section and sleeps until the remote's
/// window resets plus `margin`. Concurrent callers queue behind it.
#[derive(Debug)]
pub struct ErrorBudget {
    threshold: u32,
    margin: Duration,
    cooldown: Mutex<()>,
}

impl ErrorBudget {
    pub fn new(threshold: u32, margin: Duration) -> Self {
        Self {
            threshold,
            margin,
            cooldown: Mutex::new(()),
        }
    }

    /// Returns the cooldown slept, if any.
    pub async fn on_client_error(&self, info: &ErrorInfo) -> Option<Duration> {
        let remaining = info.remaining?;
        if remaining >= self.threshold {
            return None;
        }
        let wait = Duration::from_secs(info.reset_secs.unwrap_or(0)) + self.margin;
        let _section = self.cooldown.lock().await;
        tracing::warn!(
            remaining,
            "remote error budget nearly exhausted; cooling down for {:?}",
            wait
        );
        tokio::time::sleep(wait).await;
        Some(wait)
    }
}

impl Default for ErrorBudget {
    fn default() -> Self {
        Self::new(10, Duration::from_secs(1))
    }
}
