use thiserror::Error;

/// Errors from parsing and serializing the RTP transport header.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RtpError {
    /// The input ended mid-field, or a declared CSRC/extension region
    /// overflows the buffer.
    #[error("buffer too short for RTP header")]
    ShortBuffer,

    /// A header extension entry declares a length exceeding the remaining
    /// extension region.
    #[error("malformed RTP header extension")]
    MalformedExtension,

    /// An extension violates the id or length bounds of its profile on
    /// serialize.
    #[error("invalid RTP header extension")]
    InvalidExtension,

    /// The padding flag is set but the padding size is zero.
    #[error("padding flag set with zero padding size")]
    InvalidPadding,
}
