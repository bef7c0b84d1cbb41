use thiserror::Error;

/// Why processing a single task stopped
///
/// The worker pool branches on the variant: transport failures are retried,
/// `NotFound` is terminal, everything else is a content error and the task is
/// dropped without retry.
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("request failed: {0}")]
    Transport(String),

    #[error("not found (404)")]
    NotFound,

    #[error("unsupported charset: {0}")]
    UnsupportedCharset(String),

    #[error("failed to rewrite document: {0}")]
    Rewrite(String),

    #[error("cannot map {0} to a local path")]
    PathMapping(String),

    #[error("file write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("record store: {0}")]
    Store(String),
}

impl CrawlError {
    /// Transport failures are the only retryable class
    pub fn is_retryable(&self) -> bool {
        matches!(self, CrawlError::Transport(_))
    }
}

impl From<anyhow::Error> for CrawlError {
    fn from(err: anyhow::Error) -> Self {
        CrawlError::Store(format!("{:#}", err))
    }
}
