use meshprobe_core::protocol::{
    CommunicationChannel, ConnectionConfig, MessageCallback, ProtocolError, SerialTransport,
    TcpChannel, Transport, TransportState,
};
use pretty_assertions::assert_eq;
use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// In-memory channel that hands out scripted chunks, one per read
#[derive(Default)]
struct Script {
    chunks: VecDeque<Vec<u8>>,
    written: Vec<u8>,
}

#[derive(Clone, Default)]
struct ScriptedChannel {
    script: Arc<Mutex<Script>>,
    timeout: Duration,
}

impl ScriptedChannel {
    fn with_chunks(chunks: &[&[u8]]) -> Self {
        let channel = Self::default();
        channel.push(chunks);
        channel
    }

    fn push(&self, chunks: &[&[u8]]) {
        let mut script = self.script.lock().unwrap();
        script.chunks.extend(chunks.iter().map(|c| c.to_vec()));
    }

    fn written(&self) -> Vec<u8> {
        self.script.lock().unwrap().written.clone()
    }
}

impl Read for ScriptedChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let chunk = self.script.lock().unwrap().chunks.pop_front();
        match chunk {
            Some(chunk) => {
                // Chunks in these tests are always smaller than the reader's buffer
                buf[..chunk.len()].copy_from_slice(&chunk);
                Ok(chunk.len())
            }
            None => {
                thread::sleep(self.timeout.min(Duration::from_millis(5)));
                Err(io::ErrorKind::TimedOut.into())
            }
        }
    }
}

impl Write for ScriptedChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.script.lock().unwrap().written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl CommunicationChannel for ScriptedChannel {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn try_clone(&self) -> io::Result<Box<dyn CommunicationChannel>> {
        Ok(Box::new(self.clone()))
    }
}

fn collecting() -> (MessageCallback, Arc<Mutex<Vec<String>>>) {
    let frames = Arc::new(Mutex::new(Vec::new()));
    let sink = frames.clone();
    let callback: MessageCallback = Arc::new(move |frame: String| sink.lock().unwrap().push(frame));
    (callback, frames)
}

/// Wait up to two seconds for `count` frames
fn wait_for(frames: &Mutex<Vec<String>>, count: usize) -> Vec<String> {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if frames.lock().unwrap().len() >= count {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    frames.lock().unwrap().clone()
}

fn fast_transport(callback: MessageCallback) -> SerialTransport {
    SerialTransport::new(
        ConnectionConfig {
            read_timeout_ms: 20,
            ..Default::default()
        },
        callback,
    )
}

#[test]
fn test_frames_split_across_reads_arrive_in_order() {
    let (callback, frames) = collecting();
    let mut transport = fast_transport(callback);
    let channel = ScriptedChannel::with_chunks(&[
        b"{\"a\":1}\r",
        b"\n{\"b\"",
        b":2}\r\n{\"c\":3}\r\n",
    ]);

    transport.open_channel(Box::new(channel)).unwrap();
    assert_eq!(transport.state(), TransportState::Open);

    let received = wait_for(&frames, 3);
    transport.close();

    assert_eq!(received, vec!["{\"a\":1}", "{\"b\":2}", "{\"c\":3}"]);
    let stats = transport.stats();
    assert_eq!(stats.rx_frames, 3);
    assert_eq!(stats.rx_bytes, 27);
}

#[test]
fn test_unterminated_frame_stays_buffered() {
    let (callback, frames) = collecting();
    let mut transport = fast_transport(callback);
    let channel = ScriptedChannel::with_chunks(&[b"{\"a\":1}\r\n{\"b\":2"]);
    let feed = channel.clone();

    transport.open_channel(Box::new(channel)).unwrap();
    assert_eq!(wait_for(&frames, 1), vec!["{\"a\":1}"]);

    // Give the reader a few more cycles; nothing else may appear
    thread::sleep(Duration::from_millis(50));
    assert_eq!(frames.lock().unwrap().len(), 1);

    feed.push(&[b"}\r\n"]);
    assert_eq!(wait_for(&frames, 2), vec!["{\"a\":1}", "{\"b\":2}"]);
    transport.close();
}

#[test]
fn test_bad_frames_are_skipped() {
    let (callback, frames) = collecting();
    let mut transport = fast_transport(callback);
    let channel = ScriptedChannel::with_chunks(&[b"one\r\n\xff\xfe\r\n\r\ntwo\r\n"]);

    transport.open_channel(Box::new(channel)).unwrap();
    let received = wait_for(&frames, 2);
    transport.close();

    assert_eq!(received, vec!["one", "two"]);
    assert_eq!(transport.stats().dropped_frames, 1);
}

#[test]
fn test_send_writes_one_frame() {
    let (callback, _frames) = collecting();
    let mut transport = fast_transport(callback);
    let channel = ScriptedChannel::default();
    let wire = channel.clone();

    transport.open_channel(Box::new(channel)).unwrap();
    transport.send("{\"x\":1}").unwrap();
    transport.close();

    assert_eq!(wire.written(), b"{\"x\":1}\r\n".to_vec());
    assert_eq!(transport.stats().tx_frames, 1);
    assert!(matches!(
        transport.send("{\"x\":2}"),
        Err(ProtocolError::NotConnected)
    ));
}

#[test]
fn test_close_then_reopen() {
    let (callback, frames) = collecting();
    let mut transport = fast_transport(callback);

    transport
        .open_channel(Box::new(ScriptedChannel::with_chunks(&[b"first\r\n"])))
        .unwrap();
    wait_for(&frames, 1);

    let started = Instant::now();
    transport.close();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(transport.state(), TransportState::Closed);
    transport.close();

    transport
        .open_channel(Box::new(ScriptedChannel::with_chunks(&[b"second\r\n"])))
        .unwrap();
    assert_eq!(wait_for(&frames, 2), vec!["first", "second"]);
    transport.close();
}

#[test]
fn test_tcp_channel_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let node = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream
            .write_all(b"{\"origin\":\"n\",\"class\":\"keepAlive\"}\r\n")
            .unwrap();

        let mut line = String::new();
        BufReader::new(stream).read_line(&mut line).unwrap();
        line
    });

    let (callback, frames) = collecting();
    let mut transport = fast_transport(callback);
    transport
        .open_channel(Box::new(TcpChannel::connect(&addr).unwrap()))
        .unwrap();

    assert_eq!(
        wait_for(&frames, 1),
        vec!["{\"origin\":\"n\",\"class\":\"keepAlive\"}"]
    );

    transport.send("{\"timestamp\":5}").unwrap();
    assert_eq!(node.join().unwrap(), "{\"timestamp\":5}\r\n");
    transport.close();
}
