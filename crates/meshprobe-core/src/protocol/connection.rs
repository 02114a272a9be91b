//! Connection management
//!
//! [`SerialTransport`] is the framed transport over a real link: it opens
//! and configures the serial device, runs the frame reader and writes
//! outbound frames.

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::codec::Encoder;

use super::{
    serial::{clear_buffers, configure_port, list_ports, open_port, PortInfo},
    transport::{FrameReader, LinkCounters},
    CommunicationChannel, FrameCodec, LinkStats, MessageCallback, ProtocolError, SerialChannel,
    Transport, TransportState, DEFAULT_BAUD_RATE, DEFAULT_PORT, DEFAULT_READ_TIMEOUT_MS,
};

/// Connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Serial port name
    pub port_name: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Read timeout in milliseconds; bounds how long `close` waits for the reader
    pub read_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            port_name: DEFAULT_PORT.to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
        }
    }
}

impl ConnectionConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.max(1))
    }
}

/// Framed transport over a serial port or any other byte channel
pub struct SerialTransport {
    /// Connection configuration
    config: ConnectionConfig,
    /// Current state
    state: TransportState,
    /// Write half of the link
    writer: Option<Box<dyn CommunicationChannel>>,
    /// Reader thread (owns the read half)
    reader: Option<FrameReader>,
    /// Frame callback handed to each new reader
    callback: MessageCallback,
    /// Outbound framing
    codec: FrameCodec,
    /// Traffic counters, shared with the reader
    counters: Arc<LinkCounters>,
}

impl SerialTransport {
    /// Create a new transport (not yet open)
    pub fn new(config: ConnectionConfig, callback: MessageCallback) -> Self {
        Self {
            config,
            state: TransportState::Closed,
            writer: None,
            reader: None,
            callback,
            codec: FrameCodec::new(),
            counters: Arc::new(LinkCounters::default()),
        }
    }

    /// List available serial ports
    pub fn list_ports() -> Vec<PortInfo> {
        list_ports()
    }

    /// Get the connection configuration
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Open over an already-connected channel
    pub fn open_channel(
        &mut self,
        mut channel: Box<dyn CommunicationChannel>,
    ) -> Result<(), ProtocolError> {
        self.close();

        channel.set_timeout(self.config.read_timeout())?;
        let read_half = channel.try_clone()?;
        let reader = FrameReader::spawn(read_half, self.callback.clone(), self.counters.clone())?;

        self.reader = Some(reader);
        self.writer = Some(channel);
        self.state = TransportState::Open;
        Ok(())
    }
}

impl Transport for SerialTransport {
    fn open(&mut self, port_name: &str, baud_rate: u32) -> Result<(), ProtocolError> {
        self.close();
        self.config.port_name = port_name.to_string();
        self.config.baud_rate = baud_rate;

        let mut port = open_port(port_name, baud_rate, self.config.read_timeout())?;
        configure_port(port.as_mut())?;
        clear_buffers(port.as_mut())?;

        self.open_channel(Box::new(SerialChannel::new(port)))?;
        tracing::info!("opened {} at {} baud", port_name, baud_rate);
        Ok(())
    }

    fn send(&mut self, text: &str) -> Result<(), ProtocolError> {
        let writer = self.writer.as_mut().ok_or(ProtocolError::NotConnected)?;

        let mut frame = BytesMut::with_capacity(text.len() + 2);
        self.codec.encode(text, &mut frame)?;

        // No flush: on unix it waits in tcdrain for the UART to empty.
        // write_all already hands the frame to the kernel.
        writer.write_all(&frame)?;
        self.counters.record_tx(frame.len());
        tracing::trace!("sent {} bytes", frame.len());
        Ok(())
    }

    fn close(&mut self) {
        if self.state == TransportState::Closed {
            return;
        }
        self.state = TransportState::Closing;
        if let Some(mut reader) = self.reader.take() {
            reader.stop();
        }
        self.writer = None;
        self.state = TransportState::Closed;
        tracing::info!("closed {}", self.config.port_name);
    }

    fn on_message(&mut self, callback: MessageCallback) {
        self.callback = callback;
    }

    fn state(&self) -> TransportState {
        self.state
    }

    fn stats(&self) -> LinkStats {
        self.counters.snapshot()
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}
