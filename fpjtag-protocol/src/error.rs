use std::{
    error::Error,
    fmt::Display,
    io::{self},
    str::Utf8Error,
};

use crate::tap::TapState;

/// Errors that may occur when reading an envelope from a stream.
#[derive(Debug)]
pub enum ReadError {
    IoError(io::Error),
    /// The opcode byte does not name any known request.
    InvalidOpcode(u8),
    /// A field carried a different type tag than the layout requires.
    UnexpectedTag { expected: u8, got: u8 },
    /// The payload ended before all fields of the envelope were read.
    Truncated,
    /// Bytes were left over after the last field of the envelope.
    TrailingBytes(usize),
    InvalidFormat(String),
    TooManyBytes { max: usize, got: usize },
}

impl ReadError {
    /// Whether the stream is still aligned on a frame boundary after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ReadError::IoError(_) | ReadError::TooManyBytes { .. })
    }
}

impl From<io::Error> for ReadError {
    fn from(value: io::Error) -> Self {
        ReadError::IoError(value)
    }
}

impl From<Utf8Error> for ReadError {
    fn from(value: Utf8Error) -> Self {
        ReadError::InvalidFormat(format!("Invalid UTF8: {}", value))
    }
}

impl Display for ReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadError::IoError(error) => write!(f, "{}", error),
            ReadError::InvalidOpcode(opcode) => write!(f, "Received invalid opcode {}", opcode),
            ReadError::UnexpectedTag { expected, got } => write!(
                f,
                "Unexpected field tag 0x{:02x}, expected 0x{:02x}",
                got, expected
            ),
            ReadError::Truncated => write!(f, "Envelope ended before all fields were read"),
            ReadError::TrailingBytes(count) => {
                write!(f, "{} unexpected bytes after the last field", count)
            }
            ReadError::InvalidFormat(format) => write!(f, "{}", format),
            ReadError::TooManyBytes { max, got } => {
                write!(f, "Envelope too large! Maximum is {}, but got {}", max, got)
            }
        }
    }
}

impl Error for ReadError {}

/// Errors of the TAP state machine and path planner.
///
/// None of these happen while the tracked state is correct; seeing one means
/// the tracked state no longer matches the device.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TapError {
    /// A transition out of, or a path to, [`TapState::Undefined`] was requested.
    UndefinedState,
    /// The planner produced more than eight bits.
    PathTooLong { from: TapState, to: TapState },
    /// The planner has no rule for reaching the target.
    UnexpectedTarget { from: TapState, to: TapState },
}

impl Display for TapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TapError::UndefinedState => write!(f, "TAP state is undefined"),
            TapError::PathTooLong { from, to } => {
                write!(f, "TMS path from {} to {} exceeds 8 bits", from, to)
            }
            TapError::UnexpectedTarget { from, to } => {
                write!(f, "No TMS path rule from {} to {}", from, to)
            }
        }
    }
}

impl Error for TapError {}
