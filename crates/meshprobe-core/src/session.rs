//! Probe session
//!
//! A [`Session`] is the per-run context: it owns the transport, the
//! estimator and the receiving end of the routed-message channel. The
//! transport's reader thread only routes frames and sends them down the
//! channel; everything that touches the estimator happens in
//! [`Session::step`] and [`Session::drain`], on the caller's thread.
//!
//! Times passed to the session are milliseconds since the Unix epoch (see
//! [`now_millis`](crate::message::now_millis)); tests may use any clock.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};

/// Routed messages held for the control loop. Past this, new messages are
/// dropped until the session drains.
pub const MESSAGE_QUEUE_CAPACITY: usize = 1024;

use crate::estimator::{ConfigError, Estimator, EstimatorConfig, MatchOutcome, Report};
use crate::message::Probe;
use crate::protocol::{
    ConnectionConfig, LinkStats, MessageCallback, ProtocolError, SerialTransport, Transport,
};
use crate::record::MessageRecorder;
use crate::router::{channel_callback, Route, RoutedMessage};
use crate::simulator::{SimulatedTransport, SimulatorConfig};

/// Everything needed to run a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub connection: ConnectionConfig,
    pub estimator: EstimatorConfig,
    /// Interval between reports during a probe test
    pub report_period_ms: u64,
    /// `origin` of outbound probes
    pub probe_origin: String,
    /// Node the probes are addressed to; only its acknowledgements count
    pub probe_destiny: String,
    /// Use the simulated node instead of the serial port
    pub simulate: bool,
    pub simulator: SimulatorConfig,
    /// CSV message log; `None` disables logging
    pub log_path: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            estimator: EstimatorConfig::default(),
            report_period_ms: 1000,
            probe_origin: "Supervisor".to_string(),
            probe_destiny: "NodoTest001".to_string(),
            simulate: false,
            simulator: SimulatorConfig::default(),
            log_path: Some(PathBuf::from("log.csv")),
        }
    }
}

impl SessionConfig {
    /// Load from a JSON file. Missing fields keep their defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let file_error = |reason: String| ConfigError::File {
            path: path.display().to_string(),
            reason,
        };

        let text = std::fs::read_to_string(path).map_err(|e| file_error(e.to_string()))?;
        let config: Self = serde_json::from_str(&text).map_err(|e| file_error(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.estimator.validate()?;
        if self.report_period_ms == 0 {
            return Err(ConfigError::NotPositive {
                name: "report period",
            });
        }
        Ok(())
    }
}

/// Counters for one session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub probes_sent: u64,
    pub send_failures: u64,
    /// Acknowledgements matched to an in-flight probe
    pub matched: u64,
    /// Acknowledgements with no live slot (late, evicted or unknown)
    pub unmatched: u64,
    /// Routed messages of any class
    pub messages_seen: u64,
}

pub struct Session {
    config: SessionConfig,
    transport: Box<dyn Transport>,
    messages: Receiver<RoutedMessage>,
    /// Present while a probe test runs
    estimator: Option<Estimator>,
    last_report: u64,
    recorder: Option<MessageRecorder>,
    stats: SessionStats,
}

impl Session {
    /// Create a session over the serial port, or the simulated node when
    /// `config.simulate` is set. The transport is not opened.
    pub fn new(config: SessionConfig) -> Self {
        let simulate = config.simulate;
        Self::with_transport(config, |callback, config| -> Box<dyn Transport> {
            if simulate {
                Box::new(SimulatedTransport::new(config.simulator.clone(), callback))
            } else {
                Box::new(SerialTransport::new(config.connection.clone(), callback))
            }
        })
    }

    /// Create a session over a transport built by `make` from the message
    /// callback
    pub fn with_transport<F>(config: SessionConfig, make: F) -> Self
    where
        F: FnOnce(MessageCallback, &SessionConfig) -> Box<dyn Transport>,
    {
        let (tx, rx) = mpsc::sync_channel(MESSAGE_QUEUE_CAPACITY);
        let transport = make(channel_callback(tx), &config);
        Self {
            config,
            transport,
            messages: rx,
            estimator: None,
            last_report: 0,
            recorder: None,
            stats: SessionStats::default(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Mutable settings. Estimator changes apply from the next `start_test`.
    pub fn config_mut(&mut self) -> &mut SessionConfig {
        &mut self.config
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn link_stats(&self) -> LinkStats {
        self.transport.stats()
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    /// Open the transport on the configured port
    pub fn open(&mut self) -> Result<(), ProtocolError> {
        let ConnectionConfig {
            port_name,
            baud_rate,
            ..
        } = &self.config.connection;
        self.transport.open(port_name, *baud_rate)
    }

    /// Stop any test and close the transport
    pub fn close(&mut self) {
        self.stop_test();
        self.transport.close();
    }

    /// Log routed messages to `recorder` while a test runs
    pub fn attach_recorder(&mut self, recorder: MessageRecorder) {
        self.recorder = Some(recorder);
    }

    /// Start a probe test; the first probe goes out one message period after
    /// `now`. Messages that arrived before the test are discarded.
    pub fn start_test(&mut self, now: u64) -> Result<(), ConfigError> {
        self.config.validate()?;
        self.estimator = Some(Estimator::new(&self.config.estimator, now)?);
        self.last_report = now;
        self.discard_pending();
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.start();
        }
        tracing::info!(
            "probe test started: period {} ms, window {} ms, max delay {} ms",
            self.config.estimator.message_period_ms,
            self.config.estimator.test_period_ms,
            self.config.estimator.max_response_delay_ms
        );
        Ok(())
    }

    pub fn stop_test(&mut self) {
        if self.estimator.take().is_some() {
            tracing::info!("probe test stopped");
        }
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.stop();
        }
    }

    pub fn is_testing(&self) -> bool {
        self.estimator.is_some()
    }

    /// Current report, if a test is running
    pub fn report(&self, now: u64) -> Option<Report> {
        self.estimator.as_ref().map(|e| e.report(now))
    }

    /// One control-loop iteration: send a probe if one is due, process
    /// received messages, and return a report once per report period.
    pub fn step<F>(&mut self, now: u64, observer: F) -> Option<Report>
    where
        F: FnMut(&RoutedMessage),
    {
        if let Some(timestamp) = self.estimator.as_mut().and_then(|e| e.tick(now)) {
            self.send_probe(timestamp);
        }

        self.drain(now, observer);

        let estimator = self.estimator.as_ref()?;
        if now.saturating_sub(self.last_report) < self.config.report_period_ms {
            return None;
        }
        let report = estimator.report(now);
        self.last_report += self.config.report_period_ms;
        Some(report)
    }

    /// Process every message received so far without probing. Returns the
    /// number of messages handled.
    ///
    /// Acknowledgements from the probed node are matched at `now`.
    pub fn drain<F>(&mut self, now: u64, mut observer: F) -> usize
    where
        F: FnMut(&RoutedMessage),
    {
        let mut handled = 0;
        while let Ok(routed) = self.messages.try_recv() {
            handled += 1;
            self.stats.messages_seen += 1;

            if let Route::Received { origin_ts } = routed.route {
                if routed.message.origin == self.config.probe_destiny {
                    self.match_response(origin_ts, now);
                }
            }

            if let Some(recorder) = self.recorder.as_mut() {
                if let Err(e) = recorder.record(&routed) {
                    tracing::warn!("cannot write {}: {}", recorder.path().display(), e);
                }
            }

            observer(&routed);
        }
        handled
    }

    /// Drop everything waiting in the channel
    pub fn discard_pending(&mut self) -> usize {
        self.messages.try_iter().count()
    }

    fn match_response(&mut self, origin_ts: u64, now: u64) {
        let Some(estimator) = self.estimator.as_mut() else {
            return;
        };
        match estimator.on_response(origin_ts, now) {
            MatchOutcome::Matched { elapsed_ms } => {
                self.stats.matched += 1;
                tracing::trace!("probe {} answered in {} ms", origin_ts, elapsed_ms);
            }
            MatchOutcome::Unmatched => {
                self.stats.unmatched += 1;
                tracing::debug!("no probe in flight for {}", origin_ts);
            }
        }
    }

    fn send_probe(&mut self, timestamp: u64) {
        let probe = Probe {
            origin: self.config.probe_origin.clone(),
            destiny: self.config.probe_destiny.clone(),
            timestamp,
        };
        let result = probe
            .encode()
            .map_err(|e| ProtocolError::SerialError(e.to_string()))
            .and_then(|text| self.transport.send(&text));

        match result {
            Ok(()) => self.stats.probes_sent += 1,
            Err(e) => {
                self.stats.send_failures += 1;
                tracing::warn!("probe {} not sent: {}", timestamp, e);
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
