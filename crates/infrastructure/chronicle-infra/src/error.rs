use std::fmt;

/// What the remote told us when it rejected a call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorInfo {
    pub status: u16,
    pub message: String,
    /// Errors the remote will still tolerate in the current window.
    pub remaining: Option<u32>,
    /// Seconds until the remote resets its error window.
    pub reset_secs: Option<u64>,
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status, self.message)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    /// The remote rejected the request (4xx).
    #[error("{0}")]
    Client(ErrorInfo),
    /// Network failure, 5xx or a response cut short.
    #[error("{0}")]
    Transport(String),
}
