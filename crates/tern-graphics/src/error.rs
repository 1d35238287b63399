//! Error types for the graphics subsystem.
//!
//! Every error maps onto one of the protocol's `errno`-style response
//! codes via [`GraphicsError::code`]; the dispatcher formats failures as
//! `G…;CODE:message` response strings rather than propagating them.

use crate::types::ImageKey;

/// Errors raised while handling graphics commands.
#[derive(Debug, thiserror::Error)]
pub enum GraphicsError {
    /// Malformed command parameters, bad dimensions, format/size
    /// mismatches, unsupported compression, unknown action letters.
    #[error("{0}")]
    Invalid(String),

    /// Failed to open or map a file/shm payload source.
    #[error("{0}")]
    PayloadSource(String),

    /// Allocation failure while staging payload data.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// Decoded payload is shorter than the expected pixel size.
    #[error("insufficient image data: {actual} < {expected}")]
    ShortData { actual: usize, expected: usize },

    /// Transmitted payload exceeds the per-image ceiling.
    #[error("too much data")]
    TooMuchData,

    /// A follow-on chunk arrived with no transmission in progress.
    #[error("more payload loading refers to non-existent image")]
    OrphanChunk,

    /// A put or delete referenced an image that does not exist.
    #[error("no image found for {0}")]
    NoSuchImage(ImageKey),

    /// A put referenced an image whose payload never finished loading.
    #[error("image with id: {0} could not load its data")]
    ImageNotLoaded(u32),

    /// The escape payload could not be parsed into a command record.
    #[error("parse error: {0}")]
    Parse(String),

    /// The inline payload was not valid base64.
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
}

impl GraphicsError {
    /// The `errno`-style code used in protocol responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Invalid(_) | Self::Parse(_) | Self::Base64(_) => "EINVAL",
            Self::PayloadSource(_) => "EBADF",
            Self::OutOfMemory(_) => "ENOMEM",
            Self::ShortData { .. } => "ENODATA",
            Self::TooMuchData => "EFBIG",
            Self::OrphanChunk => "EILSEQ",
            Self::NoSuchImage(_) | Self::ImageNotLoaded(_) => "ENOENT",
        }
    }
}
