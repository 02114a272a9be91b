//! Serial Link Protocol
//!
//! Line-delimited text framing between the supervisor and a mesh node.
//!
//! Every frame is UTF-8 text terminated by `\r\n`. The transport layer only
//! knows about frames; decoding the JSON inside them is left to
//! [`crate::message`].

pub mod codec;
mod connection;
mod error;
pub mod serial;
mod stream;
mod transport;

pub use codec::{encode_frame, FrameCodec};
pub use connection::{ConnectionConfig, SerialTransport};
pub use error::{FrameError, ProtocolError};
pub use serial::{clear_buffers, configure_port, list_ports, open_port, PortInfo};
pub use stream::{CommunicationChannel, SerialChannel, TcpChannel};
pub use transport::{LinkStats, MessageCallback, Transport, TransportState};

pub(crate) use transport::{FrameReader, LinkCounters};

/// Frame terminator
pub const DELIMITER: &[u8] = b"\r\n";

/// Default serial device
pub const DEFAULT_PORT: &str = "/dev/ttyACM0";

/// Default baud rate for the node's USB serial console
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default read timeout in milliseconds
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 1000;

/// Maximum frame size; longer unterminated input is discarded
pub const MAX_FRAME_SIZE: usize = 8192;
