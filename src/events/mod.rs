//! # Events
//!
//! Every finalized status transition is broadcast as a [`TransitionEvent`].
//! External notifiers subscribe through a [`NotificationSink`]; nothing a
//! subscriber does can influence the outcome of a transition.

pub mod publisher;
pub mod sink;

pub use publisher::{EventPublisher, TransitionEvent};
pub use sink::{spawn_sink_forwarder, NotificationSink};
