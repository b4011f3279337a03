//! Event bus for pub/sub messaging
//!
//! Provides a broadcast mechanism for container lifecycle events and
//! asynchronous process-exit notifications consumed by RPC clients.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::container::ContainerState;

/// Events that can be published through the event bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// A container transitioned to a new lifecycle state
    ContainerStateChanged {
        /// Container id
        id: i32,
        /// New state
        state: ContainerState,
    },

    /// A process started with `Execute` changed state. Only emitted with
    /// `running = false` today, when the child has been reaped.
    ProcessStateChanged {
        /// Container id the process ran in
        id: i32,
        /// Host-visible pid
        pid: i32,
        /// Whether the process is still running
        running: bool,
        /// Decoded exit code (signal deaths are reported as 128 + signo)
        exit_code: i32,
    },
}

/// Event bus for broadcasting events to multiple subscribers
///
/// Uses tokio broadcast channels for efficient pub/sub messaging.
/// Subscribers that fall behind will lose messages (lagged).
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    // Keep a receiver to prevent the channel from closing
    _receiver: broadcast::Receiver<Event>,
}

impl EventBus {
    /// Create a new event bus with default capacity
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Create a new event bus with custom capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender, _receiver }
    }

    /// Subscribe to the event bus
    ///
    /// Returns a receiver that will receive all events published after
    /// subscribing.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Publish an event to all subscribers
    ///
    /// If there are no subscribers, the event is silently dropped.
    /// Returns the number of receivers that received the event.
    pub fn publish(&self, event: Event) -> usize {
        // Ignore send errors (no receivers)
        self.sender.send(event).unwrap_or(0)
    }

    /// Publish a container state change
    pub fn publish_state(&self, id: i32, state: ContainerState) -> usize {
        self.publish(Event::ContainerStateChanged { id, state })
    }

    /// Publish a process exit
    pub fn publish_process_exit(&self, id: i32, pid: i32, exit_code: i32) -> usize {
        self.publish(Event::ProcessStateChanged {
            id,
            pid,
            running: false,
            exit_code,
        })
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            _receiver: self.sender.subscribe(),
        }
    }
}
