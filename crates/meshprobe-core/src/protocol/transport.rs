//! Transport contract and the background frame reader
//!
//! A transport owns one link to a node. While open, a dedicated reader
//! thread reads with a bounded timeout, reassembles frames with
//! [`FrameCodec`] and hands each complete frame to the registered callback,
//! in arrival order, on the reader thread itself.

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use std::io::{self, ErrorKind};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio_util::codec::Decoder;

use super::{CommunicationChannel, FrameCodec, ProtocolError};

/// Receives one decoded frame per call, on the transport's reader thread
pub type MessageCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Size of a single read from the channel
const READ_CHUNK_SIZE: usize = 512;

/// Transport lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportState {
    /// No link, no reader
    Closed,
    /// Link open, reader running
    Open,
    /// Reader is being stopped
    Closing,
}

/// A link to a node, real or simulated
pub trait Transport: Send {
    /// Open the link and start the reader. An open transport is closed first,
    /// so this also reopens.
    fn open(&mut self, port_name: &str, baud_rate: u32) -> Result<(), ProtocolError>;

    /// Frame `text` and hand it to the link. No acknowledgement is awaited.
    fn send(&mut self, text: &str) -> Result<(), ProtocolError>;

    /// Stop the reader, wait for it to exit, release the link. Idempotent.
    fn close(&mut self);

    /// Register the frame callback; takes effect on the next `open`
    fn on_message(&mut self, callback: MessageCallback);

    /// Current lifecycle state
    fn state(&self) -> TransportState;

    /// Traffic counters
    fn stats(&self) -> LinkStats;

    fn is_open(&self) -> bool {
        self.state() == TransportState::Open
    }
}

/// Snapshot of link traffic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStats {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub tx_frames: u64,
    pub rx_frames: u64,
    pub dropped_frames: u64,
}

/// Counters shared between a transport and its reader thread
#[derive(Debug, Default)]
pub(crate) struct LinkCounters {
    tx_bytes: AtomicU64,
    rx_bytes: AtomicU64,
    tx_frames: AtomicU64,
    rx_frames: AtomicU64,
    dropped_frames: AtomicU64,
}

impl LinkCounters {
    pub(crate) fn record_tx(&self, bytes: usize) {
        self.tx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.tx_frames.fetch_add(1, Ordering::Relaxed);
    }

    fn record_rx_bytes(&self, bytes: usize) {
        self.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_rx_frame(&self) {
        self.rx_frames.fetch_add(1, Ordering::Relaxed);
    }

    fn record_dropped(&self) {
        self.dropped_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> LinkStats {
        LinkStats {
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_frames: self.tx_frames.load(Ordering::Relaxed),
            rx_frames: self.rx_frames.load(Ordering::Relaxed),
            dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
        }
    }
}

/// Reader thread control states
const RUNNING: u8 = 0;
/// Exit at the next loop iteration
const STOP: u8 = 1;
/// Keep reading until the channel reports end of stream
const FINISH: u8 = 2;

/// Handle to a running reader thread
pub(crate) struct FrameReader {
    control: Arc<AtomicU8>,
    thread: Option<JoinHandle<()>>,
}

impl FrameReader {
    /// Start reading `channel` on a new thread
    pub(crate) fn spawn(
        mut channel: Box<dyn CommunicationChannel>,
        callback: MessageCallback,
        counters: Arc<LinkCounters>,
    ) -> io::Result<Self> {
        let control = Arc::new(AtomicU8::new(RUNNING));
        let control_flag = control.clone();

        let thread = thread::Builder::new()
            .name("meshprobe-reader".to_string())
            .spawn(move || {
                read_loop(channel.as_mut(), &callback, &counters, &control_flag);
                tracing::debug!("reader thread exiting");
            })?;

        Ok(Self {
            control,
            thread: Some(thread),
        })
    }

    /// Signal the thread and wait for it. Returns once the thread is gone.
    pub(crate) fn stop(&mut self) {
        self.control.store(STOP, Ordering::Release);
        self.join();
    }

    /// Wait for the thread to read the channel to its end. Only for channels
    /// that have already been told to end their stream, otherwise this waits
    /// for the peer.
    pub(crate) fn finish(&mut self) {
        self.control.store(FINISH, Ordering::Release);
        self.join();
    }

    fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("reader thread panicked");
            }
        }
    }
}

impl Drop for FrameReader {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Read, reassemble and dispatch until the reader is stopped or the
/// channel ends.
///
/// Every complete frame of a read is dispatched before the control flag is
/// checked again, so frames that arrived before a close are not lost.
fn read_loop(
    channel: &mut dyn CommunicationChannel,
    callback: &MessageCallback,
    counters: &LinkCounters,
    control: &AtomicU8,
) {
    let mut codec = FrameCodec::new();
    let mut buffer = BytesMut::with_capacity(READ_CHUNK_SIZE * 2);
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    while control.load(Ordering::Acquire) != STOP {
        match channel.read(&mut chunk) {
            Ok(0) => {
                if control.load(Ordering::Acquire) == RUNNING {
                    tracing::info!("link closed by peer");
                } else {
                    tracing::debug!("end of stream after close");
                }
                break;
            }
            Ok(n) => {
                counters.record_rx_bytes(n);
                buffer.extend_from_slice(&chunk[..n]);
                dispatch_frames(&mut codec, &mut buffer, callback, counters);
            }
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) =>
            {
                // No data this cycle
            }
            Err(e) => {
                tracing::error!("read failed, stopping reader: {}", e);
                break;
            }
        }
    }
}

/// Deliver every complete frame in `buffer`, leaving the partial remainder
pub(crate) fn dispatch_frames(
    codec: &mut FrameCodec,
    buffer: &mut BytesMut,
    callback: &MessageCallback,
    counters: &LinkCounters,
) {
    loop {
        match codec.decode(buffer) {
            Ok(Some(frame)) => {
                counters.record_rx_frame();
                callback(frame);
            }
            Ok(None) => break,
            Err(e) => {
                counters.record_dropped();
                tracing::warn!("dropping frame: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::io::{Read, Write};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Hands out its chunks, then reports end of stream
    struct FiniteChannel {
        chunks: VecDeque<Vec<u8>>,
    }

    impl Read for FiniteChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.chunks.pop_front() {
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None => Ok(0),
            }
        }
    }

    impl Write for FiniteChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl CommunicationChannel for FiniteChannel {
        fn set_timeout(&mut self, _timeout: Duration) -> io::Result<()> {
            Ok(())
        }

        fn try_clone(&self) -> io::Result<Box<dyn CommunicationChannel>> {
            Ok(Box::new(FiniteChannel {
                chunks: self.chunks.clone(),
            }))
        }
    }

    fn collecting_callback() -> (MessageCallback, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: MessageCallback =
            Arc::new(move |frame: String| sink.lock().unwrap().push(frame));
        (callback, seen)
    }

    #[test]
    fn test_dispatch_delivers_all_frames_of_a_read() {
        let (callback, seen) = collecting_callback();
        let counters = LinkCounters::default();
        let mut codec = FrameCodec::new();
        let mut buffer = BytesMut::from(&b"a\r\nb\r\nc\r\npartial"[..]);

        dispatch_frames(&mut codec, &mut buffer, &callback, &counters);

        assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(&buffer[..], b"partial");
        assert_eq!(counters.snapshot().rx_frames, 3);
    }

    #[test]
    fn test_dispatch_counts_dropped_frames() {
        let (callback, seen) = collecting_callback();
        let counters = LinkCounters::default();
        let mut codec = FrameCodec::new();
        let mut buffer = BytesMut::from(&b"\xc3\x28\r\nok\r\n"[..]);

        dispatch_frames(&mut codec, &mut buffer, &callback, &counters);

        assert_eq!(*seen.lock().unwrap(), vec!["ok"]);
        assert_eq!(counters.snapshot().dropped_frames, 1);
    }

    #[test]
    fn test_finish_delivers_everything_before_end_of_stream() {
        let (callback, seen) = collecting_callback();
        let counters = Arc::new(LinkCounters::default());
        let channel = FiniteChannel {
            chunks: VecDeque::from(vec![b"a\r\nb".to_vec(), b"\r\nc\r\n".to_vec()]),
        };

        let mut reader = FrameReader::spawn(Box::new(channel), callback, counters.clone()).unwrap();
        reader.finish();

        assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(counters.snapshot().rx_frames, 3);
    }

    #[test]
    fn test_counters_snapshot() {
        let counters = LinkCounters::default();
        counters.record_tx(10);
        counters.record_tx(5);
        counters.record_rx_bytes(7);

        let stats = counters.snapshot();
        assert_eq!(stats.tx_bytes, 15);
        assert_eq!(stats.tx_frames, 2);
        assert_eq!(stats.rx_bytes, 7);
    }
}
