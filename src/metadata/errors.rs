#[derive(thiserror::Error, Debug)]
pub enum ExtractError {
    #[error("missing url")]
    MissingUrl,

    #[error("invalid url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("url scheme {0:?} is not allowed")]
    UnsupportedScheme(String),

    #[error("host {0:?} is blocked")]
    BlockedHost(String),

    #[error("unexpected error: {0:?}")]
    Internal(#[from] anyhow::Error),
}

impl ExtractError {
    /// Errors caused by the caller's input rather than by the engine.
    pub fn is_input_error(&self) -> bool {
        !matches!(self, ExtractError::Internal(_))
    }
}
