//! # Subscription Fabric
//!
//! Maps resource paths to lists of subscriber channels and fans change
//! notifications out to them as Server-Sent-Event frames. One registry
//! serves the whole process.
//!
//! ## Channels and backpressure
//!
//! Each subscriber owns one bounded channel (capacity
//! [`CHANNEL_CAPACITY`]). Dispatch sends are non-blocking: a full buffer
//! drops that message for that subscriber and counts as a partial delivery
//! failure, but the subscriber stays registered. Delivery is best-effort;
//! the write that triggered the dispatch succeeds regardless.
//!
//! ## Locking
//!
//! A single reader/writer lock guards the path map and every per-path list.
//! Dispatch runs under the write lock, so the order of frames seen by one
//! subscriber equals the order of dispatch calls for that path.
//!
//! ## Same-level deletes
//!
//! A `delete` dispatched with `same_level = true` means the subscribed
//! resource itself is gone: after the sends, the whole list for that path is
//! dropped under the write lock. Evicted subscribers see their channel close
//! and their streams end. This eviction is intentional.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Buffered frames per subscriber before sends start dropping.
pub const CHANNEL_CAPACITY: usize = 10;

/// How often an idle stream emits a keep-alive comment.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// The SSE comment sent as a heartbeat.
pub const KEEP_ALIVE_COMMENT: &str = ": keep-alive\n\n";

/// Sending half of a subscriber channel, held by the registry.
pub type SubscriberSender = mpsc::Sender<String>;

/// Receiving half, owned by the subscriber's response stream.
pub type SubscriberReceiver = mpsc::Receiver<String>;

/// Event kinds carried in the SSE `event:` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// A resource was created, overwritten, or patched.
    Update,
    /// A resource was deleted.
    Delete,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Update => f.write_str("update"),
            EventType::Delete => f.write_str("delete"),
        }
    }
}

/// The resource-path → subscriber-channels registry.
pub struct SubscriptionFabric {
    channels: RwLock<HashMap<String, Vec<SubscriberSender>>>,
}

impl SubscriptionFabric {
    /// An empty registry.
    pub fn new() -> Self {
        SubscriptionFabric {
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// A fresh subscriber channel with the standard capacity.
    pub fn channel() -> (SubscriberSender, SubscriberReceiver) {
        mpsc::channel(CHANNEL_CAPACITY)
    }

    /// Appends `sender` to the list for `path`. Registering the same channel
    /// twice for one path is an error; the same channel may be registered
    /// for different paths.
    pub fn register(&self, path: &str, sender: SubscriberSender) -> Result<()> {
        let mut channels = self.channels.write();
        let list = channels.entry(path.to_string()).or_default();
        if list.iter().any(|existing| existing.same_channel(&sender)) {
            warn!(path = %path, "channel already registered");
            return Err(Error::AlreadyRegistered);
        }
        list.push(sender);
        debug!(path = %path, clients = list.len(), "subscriber registered");
        Ok(())
    }

    /// Removes the first channel equal to `sender` from the list for `path`;
    /// an emptied list is dropped from the map.
    pub fn unregister(&self, path: &str, sender: &SubscriberSender) {
        let mut channels = self.channels.write();
        if let Some(list) = channels.get_mut(path) {
            if let Some(position) = list
                .iter()
                .position(|existing| existing.same_channel(sender))
            {
                list.remove(position);
                debug!(path = %path, "subscriber unregistered");
            }
            if list.is_empty() {
                channels.remove(path);
            }
        }
    }

    /// Whether `path` currently has any subscribers.
    pub fn has_clients(&self, path: &str) -> bool {
        let channels = self.channels.read();
        channels.get(path).is_some_and(|list| !list.is_empty())
    }

    /// Formats one SSE frame and sends it, non-blocking, to every subscriber
    /// at `path`.
    ///
    /// When `event_type` is a delete and `same_level` is true, the resource
    /// at `path` itself is gone and its subscriber list is purged after the
    /// sends.
    ///
    /// Returns [`Error::PartialDispatch`] if any send was dropped; callers
    /// log this and keep going.
    pub fn dispatch(
        &self,
        path: &str,
        payload: &str,
        same_level: bool,
        event_type: EventType,
    ) -> Result<()> {
        let mut channels = self.channels.write();

        let message = format_event(event_type, payload);
        let failed = match channels.get(path) {
            Some(list) => list
                .iter()
                .filter(|sender| sender.try_send(message.clone()).is_err())
                .count(),
            None => 0,
        };

        if event_type == EventType::Delete && same_level {
            channels.remove(path);
            debug!(path = %path, "resource deleted, subscriber list purged");
        }

        if failed > 0 {
            return Err(Error::PartialDispatch { failed });
        }
        Ok(())
    }
}

impl Default for SubscriptionFabric {
    fn default() -> Self {
        Self::new()
    }
}

/// Renders one SSE frame: `event:` line, `data:` line, nanosecond `id:`
/// line, blank-line terminator.
pub fn format_event(event_type: EventType, payload: &str) -> String {
    format!("event: {event_type}\ndata: {payload}\nid: {}\n\n", now_nanos())
}

fn now_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos()
}

// =============================================================================
// Tests
// =============================================================================
