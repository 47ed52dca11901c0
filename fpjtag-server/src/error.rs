use std::{error::Error, fmt::Display};

use fpjtag_protocol::{Opcode, error::TapError, status};

/// A primitive programmer call failed.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HardwareError {
    /// Name of the primitive that failed.
    pub call: &'static str,
    /// The programmer's description of the failure.
    pub message: String,
}

impl HardwareError {
    pub fn new(call: &'static str, message: impl Into<String>) -> HardwareError {
        HardwareError {
            call,
            message: message.into(),
        }
    }
}

impl Display for HardwareError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}() failed : {}", self.call, self.message)
    }
}

impl Error for HardwareError {}

/// Errors of the tunnel encoder. After any of them the shadow state is undefined.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TunnelError {
    Hardware(HardwareError),
    Tap(TapError),
    /// The entry phase cannot carry the path into the shift state.
    EntryTooLong { len: u8 },
    /// A scan buffer holds fewer bytes than the field's bit count needs.
    ShortBuffer { needed: usize, len: usize },
}

impl From<HardwareError> for TunnelError {
    fn from(value: HardwareError) -> Self {
        TunnelError::Hardware(value)
    }
}

impl From<TapError> for TunnelError {
    fn from(value: TapError) -> Self {
        TunnelError::Tap(value)
    }
}

impl Display for TunnelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelError::Hardware(error) => write!(f, "{}", error),
            TunnelError::Tap(error) => write!(f, "Tunnel state tracking lost: {}", error),
            TunnelError::EntryTooLong { len } => {
                write!(f, "Entry path of {} bits does not fit the entry phase", len)
            }
            TunnelError::ShortBuffer { needed, len } => {
                write!(f, "Scan buffer of {} bytes, {} needed", len, needed)
            }
        }
    }
}

impl Error for TunnelError {}

/// Errors reported by the [`crate::driver::Driver`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DriverError {
    Hardware(HardwareError),
    Tap(TapError),
    Tunnel(TunnelError),
    /// The requested port matched none of the enumerated ports.
    NoMatchingPort {
        requested: String,
        available: Vec<String>,
    },
    /// The request needs an open programmer.
    NotInitialized,
    UnsupportedSpeed { kind: String, hz: i32 },
    InvalidOperation(String),
}

impl DriverError {
    /// Status code reported to the client for this error.
    pub fn status(&self) -> i32 {
        match self {
            DriverError::Hardware(_) | DriverError::NotInitialized => status::DEVICE_ERROR,
            DriverError::UnsupportedSpeed { .. } => status::DEVICE_ERROR,
            DriverError::Tunnel(TunnelError::Hardware(_)) => status::DEVICE_ERROR,
            DriverError::Tap(_) | DriverError::Tunnel(_) => status::FAIL,
            DriverError::NoMatchingPort { .. } => status::INIT_FAILED,
            DriverError::InvalidOperation(_) => status::SYNTAX_ERROR,
        }
    }
}

impl From<HardwareError> for DriverError {
    fn from(value: HardwareError) -> Self {
        DriverError::Hardware(value)
    }
}

impl From<TapError> for DriverError {
    fn from(value: TapError) -> Self {
        DriverError::Tap(value)
    }
}

impl From<TunnelError> for DriverError {
    fn from(value: TunnelError) -> Self {
        DriverError::Tunnel(value)
    }
}

impl Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverError::Hardware(error) => write!(f, "{}", error),
            DriverError::Tap(error) => write!(f, "{}", error),
            DriverError::Tunnel(error) => write!(f, "{}", error),
            DriverError::NoMatchingPort {
                requested,
                available,
            } => write!(
                f,
                "'{}' does not match any available port ({})",
                requested,
                if available.is_empty() {
                    "none".to_string()
                } else {
                    available.join(", ")
                }
            ),
            DriverError::NotInitialized => write!(f, "Programmer is not initialized"),
            DriverError::UnsupportedSpeed { kind, hz } => {
                write!(f, "Invalid speed {} kHz for {}", hz / 1000, kind)
            }
            DriverError::InvalidOperation(reason) => write!(f, "{}", reason),
        }
    }
}

impl Error for DriverError {}

/// An operation of a queue failed. Operations after `index` were not executed.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct QueueError {
    pub index: usize,
    pub opcode: Opcode,
    pub source: DriverError,
}

impl Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Operation {} ({}) failed: {}",
            self.index, self.opcode, self.source
        )
    }
}

impl Error for QueueError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.source)
    }
}
