// src/core/events.rs

//! The typed event bus publishing unified state deltas.
//!
//! Four topics, one broadcast channel each. Publication is fire-and-forget:
//! a lagging or absent subscriber never blocks the core loop, and ordering
//! is only guaranteed within one topic.

use serde_json::Value;
use strum_macros::{Display, EnumString};
use tokio::sync::broadcast::{self, Receiver, Sender};
use tracing::trace;

/// The capacity of each per-topic broadcast channel.
const TOPIC_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum EventTopic {
    /// Fleet state machine changes.
    Fleet,
    /// Node liveness changes.
    Address,
    /// Application state or failure flag changes.
    Application,
    /// Process state or location changes.
    Process,
}

/// One delta published on the bus.
#[derive(Debug, Clone)]
pub struct FleetEvent {
    pub topic: EventTopic,
    pub payload: Value,
}

/// Central hub distributing state deltas to subscribers.
#[derive(Debug)]
pub struct EventBus {
    fleet: Sender<FleetEvent>,
    address: Sender<FleetEvent>,
    application: Sender<FleetEvent>,
    process: Sender<FleetEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            fleet: broadcast::channel(TOPIC_CAPACITY).0,
            address: broadcast::channel(TOPIC_CAPACITY).0,
            application: broadcast::channel(TOPIC_CAPACITY).0,
            process: broadcast::channel(TOPIC_CAPACITY).0,
        }
    }

    fn sender(&self, topic: EventTopic) -> &Sender<FleetEvent> {
        match topic {
            EventTopic::Fleet => &self.fleet,
            EventTopic::Address => &self.address,
            EventTopic::Application => &self.application,
            EventTopic::Process => &self.process,
        }
    }

    /// Publishes a delta. Subscribers may drop; the send result is ignored.
    pub fn publish(&self, topic: EventTopic, payload: Value) {
        trace!("publish {} {}", topic, payload);
        let _ = self.sender(topic).send(FleetEvent { topic, payload });
    }

    pub fn subscribe(&self, topic: EventTopic) -> Receiver<FleetEvent> {
        self.sender(topic).subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
