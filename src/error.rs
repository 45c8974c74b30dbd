//! Error taxonomy for every public entry point.
//!
//! Each variant maps onto a stable negative code (see [`Error::code`]) so
//! callers that bridge to the historical integer convention can keep doing so.

use crate::constants::*;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Out-of-range argument, undersized/oversized parameter, bad combination.
    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),

    /// An allocation-backed operation could not obtain memory.
    #[error("memory allocation failed")]
    MemoryAlloc,

    /// Chunk or block would exceed a hard platform limit.
    #[error("maximum buffer size exceeded")]
    MaxBufsizeExceeded,

    /// Semantic mismatch in otherwise well-formed input.
    #[error("invalid data: {0}")]
    Data(&'static str),

    /// Source buffer too small for the requested read.
    #[error("not enough bytes to read from input buffer")]
    ReadBuffer,

    /// Destination buffer too small for the produced output.
    #[error("not enough room in output buffer")]
    WriteBuffer,

    /// Named metalayer absent.
    #[error("metalayer {0:?} not found")]
    MetalayerNotFound(String),

    /// N-dim index outside the array shape.
    #[error("index out of bounds")]
    InvalidIndex,

    /// Header magic mismatch, truncated container, impossible field value.
    #[error("corrupted container: {0}")]
    Corruption(&'static str),

    /// A codec refused the data or its id is unknown to the registry.
    #[error("codec {codec} failed: {reason}")]
    CodecFailure { codec: u8, reason: &'static str },

    /// A filter refused the data or its id is unknown to the registry.
    #[error("filter {filter} failed: {reason}")]
    FilterFailure { filter: u8, reason: &'static str },

    /// Underlying file/backend operation failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Container format version not supported by this build.
    #[error("unsupported format version {0}")]
    FrameVersion(u8),

    /// Operation not valid for this container kind.
    #[error("operation not supported: {0}")]
    NotSupported(&'static str),
}

impl Error {
    /// The stable negative integer code for this error kind.
    pub fn code(&self) -> i32 {
        match self {
            Error::InvalidParam(_) => BLOSC2_ERROR_INVALID_PARAM,
            Error::MemoryAlloc => BLOSC2_ERROR_MEMORY_ALLOC,
            Error::MaxBufsizeExceeded => BLOSC2_ERROR_MAX_BUFSIZE_EXCEEDED,
            Error::Data(_) => BLOSC2_ERROR_DATA,
            Error::ReadBuffer => BLOSC2_ERROR_READ_BUFFER,
            Error::WriteBuffer => BLOSC2_ERROR_WRITE_BUFFER,
            Error::MetalayerNotFound(_) => BLOSC2_ERROR_METALAYER_NOT_FOUND,
            Error::InvalidIndex => BLOSC2_ERROR_INVALID_INDEX,
            Error::Corruption(_) => BLOSC2_ERROR_INVALID_HEADER,
            Error::CodecFailure { .. } => BLOSC2_ERROR_CODEC_SUPPORT,
            Error::FilterFailure { .. } => BLOSC2_ERROR_FILTER_PIPELINE,
            Error::Io(_) => BLOSC2_ERROR_PLUGIN_IO,
            Error::FrameVersion(_) => BLOSC2_ERROR_VERSION_SUPPORT,
            Error::NotSupported(_) => BLOSC2_ERROR_CODEC_SUPPORT,
        }
    }
}
