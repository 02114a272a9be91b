//! Protocol errors

use thiserror::Error;

/// Errors that can occur while opening or driving a transport
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serial port error: {0}")]
    SerialError(String),

    #[error("Not connected to node")]
    NotConnected,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Cannot frame message: {0}")]
    Frame(#[from] FrameError),
}

impl ProtocolError {
    /// Whether this error came from opening the link (as opposed to using it)
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            ProtocolError::SerialError(_)
                | ProtocolError::ConnectionFailed(_)
                | ProtocolError::PortNotFound(_)
                | ProtocolError::IoError(_)
        )
    }
}

impl From<serialport::Error> for ProtocolError {
    fn from(e: serialport::Error) -> Self {
        match e.kind() {
            serialport::ErrorKind::NoDevice => ProtocolError::PortNotFound(e.description),
            serialport::ErrorKind::Io(kind) => {
                ProtocolError::IoError(std::io::Error::new(kind, e.description))
            }
            _ => ProtocolError::SerialError(e.description),
        }
    }
}

/// Per-frame decoding failures. These never leave the reader loop; they are
/// logged and the offending bytes are dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame exceeds {limit} bytes without a delimiter ({len} buffered)")]
    Oversized { len: usize, limit: usize },

    #[error("Frame is not valid UTF-8: {0}")]
    InvalidUtf8(String),

    #[error("Message contains the frame delimiter")]
    EmbeddedDelimiter,

    #[error("I/O error while framing: {0}")]
    Io(String),
}

// `tokio_util::codec::Decoder` requires the error type to absorb I/O errors.
impl From<std::io::Error> for FrameError {
    fn from(e: std::io::Error) -> Self {
        FrameError::Io(e.to_string())
    }
}
