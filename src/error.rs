use thiserror::Error;

/// Error taxonomy for the index engine.
///
/// `CacheIo` is the only variant callers are expected to treat as
/// non-fatal: a query cache failure degrades to an uncached lookup rather
/// than aborting the caller's operation.
#[derive(Debug, Error)]
pub enum BptError {
    #[error("file io error: {0}")]
    FileIo(#[from] std::io::Error),

    #[error("corrupt page {page_id}: {reason}")]
    CorruptPage { page_id: u32, reason: String },

    #[error("bad config: {0}")]
    BadConfig(String),

    #[error("not found")]
    NotFound,

    #[error("out of range: {0}")]
    OutOfRange(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("cache io error: {0}")]
    CacheIo(String),
}

pub type BptResult<T> = Result<T, BptError>;
