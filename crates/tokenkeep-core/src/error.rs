use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("token does not exist: {0}")]
    TokenDoesNotExist(String),

    #[error("{0}")]
    EmptyToken(String),

    #[error("{0}")]
    NotCertified(String),

    #[error("invalid audit record: {0}")]
    InvalidAudit(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("backend error: {0:#}")]
    Backend(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// Wrap this error with additional context.
    ///
    /// The context string is prepended to the message, producing a chain
    /// like `"storing token [tx:0]: conflict: ..."`. Classified kinds keep
    /// their kind; only the message gains context.
    pub fn context(self, msg: impl Into<String>) -> Self {
        let ctx = msg.into();
        match self {
            StoreError::NotFound(m) => StoreError::NotFound(format!("{ctx}: {m}")),
            StoreError::Conflict(m) => StoreError::Conflict(format!("{ctx}: {m}")),
            StoreError::TokenDoesNotExist(m) => StoreError::TokenDoesNotExist(format!("{ctx}: {m}")),
            StoreError::Backend(e) => StoreError::Backend(e.context(ctx)),
            other => other,
        }
    }
}

/// Extension trait to add `.context()` on `Result<T, StoreError>`.
///
/// Mirrors the ergonomics of `anyhow::Context`.
pub trait ResultExt<T> {
    /// If the result is `Err`, wrap the error with additional context.
    fn context(self, msg: impl Into<String>) -> Result<T>;

    /// If the result is `Err`, wrap the error with a lazily-evaluated context.
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, msg: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(msg))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| e.context(f()))
    }
}
