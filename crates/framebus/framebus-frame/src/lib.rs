pub mod format;
pub mod header;
pub mod record;

pub use format::{
    AudioFormat, FormatMismatch, ImageFormat, STREAM_FORMAT_SIZE, StreamFormat, required_size,
};
pub use header::{FrameHeader, HEADER_SIZE};
pub use record::FrameRecord;

/// Errors raised while encoding or decoding frame records.
#[derive(Debug, thiserror::Error)]
pub enum LayoutError {
    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("record truncated: declares {needed} bytes, only {available} present")]
    Truncated { needed: usize, available: usize },

    #[error("{what} payload is {actual} bytes, format declares {declared}")]
    PayloadMismatch {
        what: &'static str,
        declared: u64,
        actual: usize,
    },

    #[error("{what} payload of {size} bytes does not fit a u32 size field")]
    PayloadTooLarge { what: &'static str, size: u64 },

    #[error("unknown image format tag {0}")]
    UnknownImageFormat(u32),

    #[error("unknown audio format tag {0}")]
    UnknownAudioFormat(u32),
}
