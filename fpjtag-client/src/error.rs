use std::{error::Error, fmt::Display, io, net::SocketAddr};

use fpjtag_protocol::{Opcode, error::ReadError};

/// The exchange with the companion failed. The wire position is lost, so the
/// session cannot be trusted afterwards.
#[derive(Debug)]
pub enum TransportError {
    Connect { addr: SocketAddr, source: io::Error },
    Spawn(io::Error),
    Io(io::Error),
    Protocol(ReadError),
}

impl Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Connect { addr, source } => {
                write!(f, "Cannot connect to companion at {}: {}", addr, source)
            }
            TransportError::Spawn(error) => write!(f, "Cannot start companion: {}", error),
            TransportError::Io(error) => write!(f, "{}", error),
            TransportError::Protocol(error) => write!(f, "Invalid response: {}", error),
        }
    }
}

impl Error for TransportError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TransportError::Connect { source, .. } => Some(source),
            TransportError::Spawn(error) | TransportError::Io(error) => Some(error),
            TransportError::Protocol(error) => Some(error),
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(value: io::Error) -> Self {
        TransportError::Io(value)
    }
}

impl From<ReadError> for TransportError {
    fn from(value: ReadError) -> Self {
        TransportError::Protocol(value)
    }
}

#[derive(Debug)]
pub enum ClientError {
    Transport(TransportError),
    /// The companion answered with a non-zero status.
    Status { opcode: Opcode, code: i32 },
    UnexpectedResponse { opcode: Opcode },
    /// Operation `index` of a queue failed; later operations were not sent.
    Queue {
        index: usize,
        opcode: Opcode,
        source: Box<ClientError>,
    },
}

impl ClientError {
    /// Whether the session is unusable after this error.
    pub fn is_fatal(&self) -> bool {
        match self {
            ClientError::Transport(_) => true,
            ClientError::Status { .. } | ClientError::UnexpectedResponse { .. } => false,
            ClientError::Queue { source, .. } => source.is_fatal(),
        }
    }

    /// The status code reported by the companion, if any.
    pub fn status(&self) -> Option<i32> {
        match self {
            ClientError::Status { code, .. } => Some(*code),
            ClientError::Queue { source, .. } => source.status(),
            _ => None,
        }
    }
}

impl Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Transport(error) => write!(f, "{}", error),
            ClientError::Status { opcode, code } => {
                write!(f, "'{}' failed with status {}", opcode, code)
            }
            ClientError::UnexpectedResponse { opcode } => {
                write!(f, "Unexpected response to '{}'", opcode)
            }
            ClientError::Queue {
                index,
                opcode,
                source,
            } => write!(f, "Operation {} ({}) failed: {}", index, opcode, source),
        }
    }
}

impl Error for ClientError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ClientError::Transport(error) => Some(error),
            ClientError::Queue { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<TransportError> for ClientError {
    fn from(value: TransportError) -> Self {
        ClientError::Transport(value)
    }
}
