pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("record not found")]
    NotFound,

    #[error("another feed is stored here")]
    AlreadyExists,

    #[error("feed is not writable")]
    NotWritable,

    #[error("invalid proof: {0}")]
    InvalidProof(&'static str),

    #[error("remote did not include a signature")]
    MissingSignature,

    #[error("checksum failed for block {index}")]
    ChecksumFailed { index: u64 },

    #[error("index out of bounds: {}, length: {}", .tried, .length)]
    OutOfBounds { length: u64, tried: u64 },

    #[error("operation was cancelled")]
    Cancelled,

    #[error("operation timed out")]
    Timeout,

    #[error("feed is closed")]
    Closed,

    #[error("verified tree conflicts with committed node {index}")]
    Critical { index: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Utf8(#[from] std::string::FromUtf8Error),
}

impl Error {
    /// true for the poisoning tier, after which the feed refuses mutations
    pub fn is_critical(&self) -> bool {
        matches!(self, Error::Critical { .. })
    }
}
