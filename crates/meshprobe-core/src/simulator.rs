//! Simulated node
//!
//! A stand-in for a mesh node on a serial port, for running without
//! hardware. The simulated link emits a rotating list of status messages
//! at a fixed interval and answers every valid probe with a `received`
//! acknowledgement. Malformed probes are logged and ignored, like a real
//! node would. An optional loss rate drops acknowledgements using a seeded
//! RNG, so lossy runs are reproducible.
//!
//! [`SimulatedTransport`] runs the same frame reader as the serial
//! transport over this link.

use bytes::BytesMut;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio_util::codec::{Decoder, Encoder};

use crate::message::{now_millis, Message};
use crate::protocol::{
    encode_frame, CommunicationChannel, FrameCodec, FrameReader, LinkCounters, LinkStats,
    MessageCallback, ProtocolError, Transport, TransportState, DEFAULT_READ_TIMEOUT_MS,
};

/// Simulated node settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Id the node reports as `origin`
    pub node_id: String,
    /// Delay between status messages
    pub status_interval_ms: u64,
    /// Share of acknowledgements to drop, 0.0 to 1.0
    pub loss_rate: f64,
    /// RNG seed for the loss model
    pub seed: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            node_id: "NodoTest001".to_string(),
            status_interval_ms: 1000,
            loss_rate: 0.0,
            seed: 0,
        }
    }
}

/// Status messages the node cycles through
fn status_messages(node_id: &str) -> Vec<Message> {
    vec![
        Message::keep_alive(node_id, 204686),
        Message::changed_connection(node_id, 326423, "3005803657 3005803657"),
        Message::new_connection(node_id, 23319, 3005803657),
    ]
}

/// Node state shared by both halves of a link
struct NodeState {
    /// Encoded frames waiting to be read, acknowledgements first
    acks: VecDeque<Vec<u8>>,
    /// Remainder of a frame larger than the caller's read buffer
    partial: Vec<u8>,
    /// Encoded status frames
    statuses: Vec<Vec<u8>>,
    next_status: usize,
    next_status_at: Instant,
    /// Bytes written by the supervisor, not yet framed
    inbound: BytesMut,
    codec: FrameCodec,
    rng: StdRng,
    /// Set when the transport closes; readers get what is still queued,
    /// then end of stream
    shut_down: bool,
}

struct Shared {
    state: Mutex<NodeState>,
    wake: Condvar,
}

/// One handle to a simulated link
pub struct SimulatedLink {
    shared: Arc<Shared>,
    config: Arc<SimulatorConfig>,
    timeout: Duration,
}

impl SimulatedLink {
    pub fn new(config: SimulatorConfig) -> Self {
        let statuses = status_messages(&config.node_id)
            .iter()
            .filter_map(|m| encode(m).ok())
            .collect();
        let state = NodeState {
            acks: VecDeque::new(),
            partial: Vec::new(),
            statuses,
            next_status: 0,
            next_status_at: Instant::now() + Duration::from_millis(config.status_interval_ms),
            inbound: BytesMut::new(),
            codec: FrameCodec::new(),
            rng: StdRng::seed_from_u64(config.seed),
            shut_down: false,
        };
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                wake: Condvar::new(),
            }),
            config: Arc::new(SimulatorConfig {
                loss_rate: config.loss_rate.clamp(0.0, 1.0),
                ..config
            }),
            timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
        }
    }

    /// End the stream: reads return the frames already queued, then end of
    /// stream, and no further statuses are emitted
    pub fn shut_down(&self) {
        self.lock().shut_down = true;
        self.shared.wake.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, NodeState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// React to one frame from the supervisor
    fn respond(&self, state: &mut NodeState, frame: &str) {
        let probe: serde_json::Value = match serde_json::from_str(frame) {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!("simulated node: invalid message format: {}", frame);
                return;
            }
        };
        let Some(origin_ts) = probe.get("timestamp").and_then(|t| t.as_u64()) else {
            tracing::warn!("simulated node: message without timestamp: {}", frame);
            return;
        };

        if self.config.loss_rate > 0.0 && state.rng.gen_bool(self.config.loss_rate) {
            tracing::debug!("simulated node: dropping ack for {}", origin_ts);
            return;
        }

        let ack = Message::received(&self.config.node_id, now_millis(), origin_ts);
        match encode(&ack) {
            Ok(bytes) => {
                state.acks.push_back(bytes);
                self.shared.wake.notify_all();
            }
            Err(e) => tracing::error!("simulated node: cannot encode ack: {}", e),
        }
    }
}

/// Encode a message as a complete frame
fn encode(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    let text = message
        .encode()
        .map_err(|e| ProtocolError::SerialError(e.to_string()))?;
    Ok(encode_frame(&text)?)
}

/// Copy as much of `frame` as fits, keeping the rest for the next read
fn fill(buf: &mut [u8], frame: Vec<u8>, partial: &mut Vec<u8>) -> usize {
    let n = frame.len().min(buf.len());
    buf[..n].copy_from_slice(&frame[..n]);
    *partial = frame[n..].to_vec();
    n
}

impl Read for SimulatedLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let deadline = Instant::now() + self.timeout;
        let mut state = self.lock();

        loop {
            if !state.partial.is_empty() {
                let pending = std::mem::take(&mut state.partial);
                return Ok(fill(buf, pending, &mut state.partial));
            }
            if let Some(ack) = state.acks.pop_front() {
                return Ok(fill(buf, ack, &mut state.partial));
            }
            if state.shut_down {
                return Ok(0);
            }

            let now = Instant::now();
            if now >= state.next_status_at && !state.statuses.is_empty() {
                let status = state.statuses[state.next_status].clone();
                state.next_status = (state.next_status + 1) % state.statuses.len();
                let interval = Duration::from_millis(self.config.status_interval_ms.max(1));
                state.next_status_at += interval;
                return Ok(fill(buf, status, &mut state.partial));
            }
            if now >= deadline {
                return Err(io::ErrorKind::TimedOut.into());
            }

            let wait = deadline.min(state.next_status_at).saturating_duration_since(now);
            state = self
                .shared
                .wake
                .wait_timeout(state, wait)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }
}

impl Write for SimulatedLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.lock();
        state.inbound.extend_from_slice(buf);

        loop {
            let NodeState { codec, inbound, .. } = &mut *state;
            match codec.decode(inbound) {
                Ok(Some(frame)) => self.respond(&mut state, &frame),
                Ok(None) => break,
                Err(e) => tracing::warn!("simulated node: {}", e),
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl CommunicationChannel for SimulatedLink {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn try_clone(&self) -> io::Result<Box<dyn CommunicationChannel>> {
        Ok(Box::new(SimulatedLink {
            shared: self.shared.clone(),
            config: self.config.clone(),
            timeout: self.timeout,
        }))
    }
}

/// Transport backed by a simulated node
pub struct SimulatedTransport {
    config: SimulatorConfig,
    state: TransportState,
    link: Option<SimulatedLink>,
    reader: Option<FrameReader>,
    callback: MessageCallback,
    codec: FrameCodec,
    counters: Arc<LinkCounters>,
    read_timeout: Duration,
}

impl SimulatedTransport {
    pub fn new(config: SimulatorConfig, callback: MessageCallback) -> Self {
        Self {
            config,
            state: TransportState::Closed,
            link: None,
            reader: None,
            callback,
            codec: FrameCodec::new(),
            counters: Arc::new(LinkCounters::default()),
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
        }
    }

    /// Bound on how long a read waits before re-checking the stop flag
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }
}

impl Transport for SimulatedTransport {
    fn open(&mut self, port_name: &str, _baud_rate: u32) -> Result<(), ProtocolError> {
        self.close();

        let mut link = SimulatedLink::new(self.config.clone());
        link.set_timeout(self.read_timeout)?;
        let read_half = link.try_clone()?;
        let reader = FrameReader::spawn(read_half, self.callback.clone(), self.counters.clone())?;

        self.link = Some(link);
        self.reader = Some(reader);
        self.state = TransportState::Open;
        tracing::info!(
            "simulated node {} standing in for {}",
            self.config.node_id,
            port_name
        );
        Ok(())
    }

    fn send(&mut self, text: &str) -> Result<(), ProtocolError> {
        let link = self.link.as_mut().ok_or(ProtocolError::NotConnected)?;

        let mut frame = BytesMut::with_capacity(text.len() + 2);
        self.codec.encode(text, &mut frame)?;
        link.write_all(&frame)?;
        self.counters.record_tx(frame.len());
        Ok(())
    }

    fn close(&mut self) {
        if self.state == TransportState::Closed {
            return;
        }
        self.state = TransportState::Closing;
        match (&self.link, self.reader.take()) {
            (Some(link), Some(mut reader)) => {
                // Acknowledgements queued by `send` are delivered before the
                // reader sees end of stream
                link.shut_down();
                reader.finish();
            }
            (_, Some(mut reader)) => reader.stop(),
            _ => {}
        }
        self.link = None;
        self.state = TransportState::Closed;
        tracing::info!("simulated node {} closed", self.config.node_id);
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

impl Drop for SimulatedTransport {
    fn drop(&mut self) {
        self.close();
    }
}
