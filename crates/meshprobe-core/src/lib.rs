//! # meshprobe Core Library
//!
//! Core functionality for the meshprobe serial link tester.

#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Line-delimited framing over a serial port (or any byte channel)
//! - A simulated mesh node for running without hardware
//! - Decoding and routing of node messages
//! - Loss and latency estimation from periodic probes
//! - CSV logging of received messages
//!
//! ## Example
//!
//! ```rust,no_run
//! use meshprobe_core::message::now_millis;
//! use meshprobe_core::session::{Session, SessionConfig};
//!
//! let mut session = Session::new(SessionConfig::default());
//! session.open()?;
//! session.start_test(now_millis())?;
//!
//! loop {
//!     if let Some(report) = session.step(now_millis(), |m| println!("{}", m.summary())) {
//!         println!("{}", report);
//!     }
//!     std::thread::sleep(std::time::Duration::from_millis(5));
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod estimator;
pub mod message;
pub mod protocol;
pub mod record;
pub mod router;
pub mod session;
pub mod simulator;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::estimator::{ConfigError, Estimator, EstimatorConfig, MatchOutcome, Report};
    pub use crate::message::{now_millis, Message, MessageClass, Probe};
    pub use crate::protocol::{
        ConnectionConfig, FrameCodec, LinkStats, ProtocolError, SerialTransport, Transport,
        TransportState,
    };
    pub use crate::record::MessageRecorder;
    pub use crate::router::{classify, Route, RoutedMessage};
    pub use crate::session::{Session, SessionConfig, SessionStats};
    pub use crate::simulator::{SimulatedTransport, SimulatorConfig};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
