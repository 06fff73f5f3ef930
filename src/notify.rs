//! Attribute change notifications.
//!
//! The engine announces every change of its observable channels through a
//! [`ChangeBroadcaster`]. [`AttributeBus`] is the in-process implementation:
//!
//! ```text
//! Observable::set --announce--> AttributeBus --mpsc (one per subscriber)--> subscribers
//!                                    |
//!                                    +-- current-value table (synthetic first delivery)
//! ```
//!
//! Unlike a `watch` channel, every announcement reaches every subscriber of
//! its attribute, in order. Subscriber queues are unbounded so that nothing is
//! ever dropped; a subscriber whose backlog reaches the configured warning
//! threshold is reported in the log.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tracing::warn;

use crate::config::NotificationConfig;

/// A single attribute change: `value` is the new value of `source/attribute`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeEvent {
    /// Name of the endpoint that owns the attribute.
    pub source: String,
    /// Attribute (channel) name.
    pub attribute: String,
    /// New value.
    pub value: serde_json::Value,
}

impl AttributeEvent {
    /// Build an event.
    pub fn new(source: &str, attribute: &str, value: serde_json::Value) -> Self {
        Self {
            source: source.to_string(),
            attribute: attribute.to_string(),
            value,
        }
    }
}

/// Push-style notification mechanism consumed by the engine.
pub trait ChangeBroadcaster: Send + Sync {
    /// Deliver `event` to all current subscribers of its attribute.
    fn announce(&self, event: AttributeEvent);
}

/// Boxed stream of attribute events returned by [`AttributeBus::subscribe`].
pub type AttributeStream = Pin<Box<dyn Stream<Item = AttributeEvent> + Send>>;

type AttributeKey = (String, String);

struct Subscriber {
    sender: mpsc::UnboundedSender<AttributeEvent>,
    /// Events sent but not yet taken from the stream.
    backlog: Arc<AtomicUsize>,
}

impl Subscriber {
    /// Queue `event`; `false` once the subscriber has gone away.
    fn deliver(&self, event: AttributeEvent, warn_at: usize) -> bool {
        let backlog = self.backlog.fetch_add(1, Ordering::Relaxed) + 1;
        if backlog == warn_at {
            warn!(
                source = %event.source,
                attribute = %event.attribute,
                backlog,
                "Attribute subscriber is falling behind"
            );
        }
        self.sender.send(event).is_ok()
    }
}

#[derive(Default)]
struct BusState {
    current: HashMap<AttributeKey, serde_json::Value>,
    subscribers: HashMap<AttributeKey, Vec<Subscriber>>,
}

/// In-process attribute broadcaster with one lossless queue per subscriber.
pub struct AttributeBus {
    state: Mutex<BusState>,
    backlog_warning: usize,
}

impl std::fmt::Debug for AttributeBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("AttributeBus")
            .field(
                "subscribers",
                &state.subscribers.values().map(Vec::len).sum::<usize>(),
            )
            .field("attributes", &state.current.len())
            .field("backlog_warning", &self.backlog_warning)
            .finish()
    }
}

impl AttributeBus {
    /// Create a bus that warns once a subscriber has `backlog_warning`
    /// undelivered events.
    pub fn new(backlog_warning: usize) -> Self {
        Self {
            state: Mutex::new(BusState::default()),
            backlog_warning: backlog_warning.max(1),
        }
    }

    /// Create a bus from the `[notifications]` configuration section.
    pub fn from_config(config: &NotificationConfig) -> Self {
        Self::new(config.backlog_warning)
    }

    /// Last announced value of `source/attribute`, if any.
    pub fn current(&self, source: &str, attribute: &str) -> Option<serde_json::Value> {
        self.state
            .lock()
            .current
            .get(&(source.to_string(), attribute.to_string()))
            .cloned()
    }

    /// Subscribe to `source/attribute`.
    ///
    /// The stream first yields the current value (if one was ever announced),
    /// then every later change in announcement order. Dropping the stream
    /// ends the subscription.
    pub fn subscribe(&self, source: &str, attribute: &str) -> AttributeStream {
        let key = (source.to_string(), attribute.to_string());
        let (sender, receiver) = mpsc::unbounded_channel();
        let subscriber = Subscriber {
            sender,
            backlog: Arc::new(AtomicUsize::new(0)),
        };
        let backlog = Arc::clone(&subscriber.backlog);

        // Seeding and registering under one lock keeps the initial value and
        // later announcements in order.
        {
            let mut state = self.state.lock();
            if let Some(value) = state.current.get(&key) {
                subscriber.deliver(
                    AttributeEvent::new(source, attribute, value.clone()),
                    self.backlog_warning,
                );
            }
            state.subscribers.entry(key).or_default().push(subscriber);
        }

        Box::pin(UnboundedReceiverStream::new(receiver).map(move |event| {
            backlog.fetch_sub(1, Ordering::Relaxed);
            event
        }))
    }
}

impl ChangeBroadcaster for AttributeBus {
    fn announce(&self, event: AttributeEvent) {
        let key = (event.source.clone(), event.attribute.clone());
        let mut state = self.state.lock();
        state.current.insert(key.clone(), event.value.clone());

        if let Some(subscribers) = state.subscribers.get_mut(&key) {
            subscribers.retain(|subscriber| subscriber.deliver(event.clone(), self.backlog_warning));
            if subscribers.is_empty() {
                state.subscribers.remove(&key);
            }
        }
    }
}
