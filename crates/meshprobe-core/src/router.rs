//! Message routing
//!
//! Classifies decoded messages and turns raw frames into [`RoutedMessage`]s.
//! Nothing here keeps state: the transport callback built by
//! [`channel_callback`] forwards routed messages to whoever owns the
//! receiving end of the channel.

use chrono::{DateTime, Local};
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::Arc;

use crate::message::{Message, MessageClass};
use crate::protocol::MessageCallback;

/// Where a message goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    KeepAlive,
    /// Acknowledgement of a probe; goes to the estimator
    Received { origin_ts: u64 },
    ConnectionChanged { nodes: String },
    NewConnection { node_id: String },
    /// Unknown or missing class, or a known class missing its fields
    Invalid,
}

impl Route {
    pub fn is_valid(&self) -> bool {
        !matches!(self, Route::Invalid)
    }

    /// Class-specific payload as shown to the user
    pub fn details(&self) -> String {
        match self {
            Route::KeepAlive | Route::Invalid => String::new(),
            Route::Received { origin_ts } => origin_ts.to_string(),
            Route::ConnectionChanged { nodes } => nodes.clone(),
            Route::NewConnection { node_id } => node_id.clone(),
        }
    }
}

/// Classify a message. Never fails; anything unusable is `Route::Invalid`.
pub fn classify(message: &Message) -> Route {
    match message.message_class() {
        Some(MessageClass::KeepAlive) => Route::KeepAlive,
        Some(MessageClass::Received) => message
            .origin_ts
            .map(|origin_ts| Route::Received { origin_ts })
            .unwrap_or(Route::Invalid),
        Some(MessageClass::ChangedConnection) => message
            .nodes
            .clone()
            .map(|nodes| Route::ConnectionChanged { nodes })
            .unwrap_or(Route::Invalid),
        Some(MessageClass::NewConnection) => message
            .node_id_text()
            .map(|node_id| Route::NewConnection { node_id })
            .unwrap_or(Route::Invalid),
        None => Route::Invalid,
    }
}

/// A valid message together with its route
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedMessage {
    pub message: Message,
    pub route: Route,
}

impl RoutedMessage {
    /// One-line summary: `class from origin - timestamp: details`
    pub fn summary(&self) -> String {
        format!(
            "{} from {} - {}: {}",
            self.message.class.as_deref().unwrap_or_default(),
            self.message.origin,
            self.message.timestamp_text(),
            self.route.details()
        )
    }
}

/// Decode, classify and stamp a frame. Malformed or unexpected frames are
/// logged and dropped.
pub fn route(frame: &str, received_at: DateTime<Local>) -> Option<RoutedMessage> {
    let message = match Message::decode(frame) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!("{}: {}", e, frame);
            return None;
        }
    };

    let route = classify(&message);
    if !route.is_valid() {
        tracing::warn!("unexpected message: {}", frame);
        return None;
    }

    Some(RoutedMessage {
        message: message.stamped(received_at),
        route,
    })
}

/// Transport callback that routes each frame and forwards it over `tx`.
/// The reader never blocks on a full queue; the message is dropped instead.
pub fn channel_callback(tx: SyncSender<RoutedMessage>) -> MessageCallback {
    Arc::new(move |frame: String| {
        if let Some(routed) = route(&frame, Local::now()) {
            match tx.try_send(routed) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::debug!("message queue full, dropping frame");
                }
                Err(TrySendError::Disconnected(_)) => {
                    tracing::debug!("message receiver gone, dropping frame");
                }
            }
        }
    })
}
