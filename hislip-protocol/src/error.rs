use std::{error::Error, fmt::Display, io};

/// Errors that may occur when reading a message from a stream.
#[derive(Debug)]
pub enum ReadError {
    IoError(io::Error),
    /// Fewer bytes than a full header were handed to the header decoder.
    TruncatedHeader { got: usize },
    /// The first two bytes are not the HiSLIP prologue.
    InvalidPrologue([u8; 2]),
    TooManyBytes { max: u64, got: u64 },
}

impl ReadError {
    /// Format errors concern a single malformed header. The stream itself is
    /// still usable and the reader may continue with the next header.
    pub fn is_format_error(&self) -> bool {
        matches!(
            self,
            ReadError::TruncatedHeader { .. } | ReadError::InvalidPrologue(_)
        )
    }
}

impl From<io::Error> for ReadError {
    fn from(value: io::Error) -> Self {
        ReadError::IoError(value)
    }
}

impl Display for ReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadError::IoError(error) => write!(f, "{}", error),
            ReadError::TruncatedHeader { got } => {
                write!(f, "Truncated message header ({} bytes)", got)
            }
            ReadError::InvalidPrologue(prologue) => {
                write!(f, "Invalid message prologue {:02x?}", prologue)
            }
            ReadError::TooManyBytes { max, got } => {
                write!(f, "Message too large! Maximum is {}, but got {}", max, got)
            }
        }
    }
}

impl Error for ReadError {}
