use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::models::{StatusTransition, TaskId, TransitionResult};
use crate::state_machine::TaskStatus;

/// Structured record of a finalized transition, as seen by notifiers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub task_id: TaskId,
    pub from_status: TaskStatus,
    pub to_status: TaskStatus,
    pub result: TransitionResult,
    pub timestamp: DateTime<Utc>,
}

impl From<&StatusTransition> for TransitionEvent {
    fn from(transition: &StatusTransition) -> Self {
        Self {
            task_id: transition.task_id.clone(),
            from_status: transition.from_status,
            to_status: transition.to_status,
            result: transition.result,
            timestamp: Utc::now(),
        }
    }
}

/// Fan-out publisher for transition events
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<TransitionEvent>,
}

impl EventPublisher {
    /// Create a new event publisher with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event. Returns the number of subscribers that received it.
    pub fn publish(&self, event: TransitionEvent) -> usize {
        // send() only fails when nobody is subscribed
        self.sender.send(event).unwrap_or(0)
    }

    pub fn publish_transition(&self, transition: &StatusTransition) -> usize {
        self.publish(TransitionEvent::from(transition))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransitionEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(1000)
    }
}
