use thiserror::Error;

#[derive(Debug, Error)]
pub enum NisyanError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    /// A non-success HTTP status from the graph engine or an LLM provider.
    /// The status is kept structured so retry decisions never depend on
    /// message text.
    #[error("{service} returned HTTP {status}: {message}")]
    Upstream {
        service: &'static str,
        status: u16,
        message: String,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Classification error: {0}")]
    Classification(String),

    #[error("Batch {index} failed: {message}")]
    Batch { index: usize, message: String },

    #[error("Maintenance cycle error: {0}")]
    Cycle(String),

    #[error("a maintenance cycle is already running for this graph")]
    AlreadyRunning,

    #[error("Not recoverable: {0}")]
    NotRecoverable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl NisyanError {
    /// Whether retrying the same call could plausibly succeed.
    ///
    /// Only transport-level trouble qualifies: a connection that never got
    /// a response, or a status code that signals throttling or a
    /// server-side fault. Everything else (bad input, missing nodes,
    /// unparseable payloads) fails the same way every time.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => match e.status() {
                Some(status) => retryable_status(status.as_u16()),
                // No status means the response never arrived.
                None => e.is_timeout() || e.is_connect(),
            },
            Self::Upstream { status, .. } => retryable_status(*status),
            _ => false,
        }
    }
}

/// Request timeout, rate limiting, and 5xx are worth another attempt;
/// every other status is the caller's problem.
fn retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429) || (500..=599).contains(&status)
}

pub type Result<T> = std::result::Result<T, NisyanError>;
