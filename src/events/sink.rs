//! Bridge from the transition broadcast to an external notifier.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::publisher::{EventPublisher, TransitionEvent};

/// External notifier (chat, webhook, ...). Implementations are supplied by
/// the embedding application.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, event: &TransitionEvent) -> anyhow::Result<()>;
}

/// Subscribe `sink` to `publisher` on a background task. The forwarder runs
/// until the publisher and all its clones are dropped.
pub fn spawn_sink_forwarder(
    publisher: &EventPublisher,
    sink: Arc<dyn NotificationSink>,
) -> JoinHandle<()> {
    let mut receiver = publisher.subscribe();

    tokio::spawn(async move {
        info!(sink = %sink.name(), "📣 Notification forwarder started");

        loop {
            match receiver.recv().await {
                Ok(event) => {
                    if let Err(e) = sink.deliver(&event).await {
                        warn!(
                            sink = %sink.name(),
                            task_id = %event.task_id,
                            error = %e,
                            "Notification delivery failed"
                        );
                    } else {
                        debug!(sink = %sink.name(), task_id = %event.task_id, "Notification delivered");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    warn!(
                        sink = %sink.name(),
                        lagged_count = count,
                        "Notification forwarder lagged behind - some events were dropped"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }

        info!(sink = %sink.name(), "Notification forwarder stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TaskId, TransitionResult};
    use crate::state_machine::TaskStatus;
    use chrono::Utc;
    use parking_lot::Mutex;

    struct FlakySink {
        delivered: Mutex<Vec<TaskId>>,
    }

    #[async_trait]
    impl NotificationSink for FlakySink {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn deliver(&self, event: &TransitionEvent) -> anyhow::Result<()> {
            if event.task_id.as_str() == "bad" {
                anyhow::bail!("webhook returned 500");
            }
            self.delivered.lock().push(event.task_id.clone());
            Ok(())
        }
    }

    fn event(id: &str) -> TransitionEvent {
        TransitionEvent {
            task_id: TaskId::from(id),
            from_status: TaskStatus::QueuedToRun,
            to_status: TaskStatus::InProgress,
            result: TransitionResult::Success,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_sink_errors_do_not_stop_forwarding() {
        let publisher = EventPublisher::new(16);
        let sink = Arc::new(FlakySink {
            delivered: Mutex::new(Vec::new()),
        });
        let handle = spawn_sink_forwarder(&publisher, sink.clone());

        publisher.publish(event("bad"));
        publisher.publish(event("good"));
        drop(publisher);

        handle.await.unwrap();
        assert_eq!(*sink.delivered.lock(), vec![TaskId::from("good")]);
    }
}
