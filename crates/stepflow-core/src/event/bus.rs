//! Run progress fan-out.
//!
//! The executor and step runner publish `WorkflowEvent`s here; observers
//! (the CLI progress display, tests) hold an `EventSubscription`. A
//! subscription can be narrowed to a single run once its id is known, so a
//! caller may subscribe before starting a run and still see its first event.

use stepflow_types::event::WorkflowEvent;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use uuid::Uuid;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    /// `capacity` bounds how far a slow subscriber may fall behind before it
    /// starts losing events. Zero is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
            run_id: None,
        }
    }

    /// Returns how many subscriptions the event reached. Zero is normal when
    /// nobody is watching.
    pub fn publish(&self, event: WorkflowEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}

/// Receiving end of the bus, optionally scoped to one run.
pub struct EventSubscription {
    rx: broadcast::Receiver<WorkflowEvent>,
    run_id: Option<Uuid>,
}

impl EventSubscription {
    /// Only yield events of `run_id` from now on. Events already buffered
    /// for other runs are dropped as they are read.
    pub fn for_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    fn wanted(&self, event: &WorkflowEvent) -> bool {
        self.run_id.is_none_or(|id| event.run_id() == id)
    }

    /// Next matching event, or `None` once the bus is gone. Lagging skips
    /// the lost events and keeps going.
    pub async fn recv(&mut self) -> Option<WorkflowEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.wanted(&event) => return Some(event),
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    tracing::debug!(missed, "event subscriber lagged behind");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv). `None` when nothing
    /// matching is buffered.
    pub fn try_recv(&mut self) -> Option<WorkflowEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.wanted(&event) => return Some(event),
                Ok(_) | Err(TryRecvError::Lagged(_)) => {}
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Everything currently buffered for this subscription.
    pub fn drain(&mut self) -> Vec<WorkflowEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(run_id: Uuid) -> WorkflowEvent {
        WorkflowEvent::RunStarted {
            run_id,
            workflow_id: Uuid::now_v7(),
            workflow_name: "invoice-approval".to_string(),
        }
    }

    #[tokio::test]
    async fn every_subscriber_sees_published_event() {
        let bus = EventBus::new(16);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        assert_eq!(bus.publish(started(Uuid::now_v7())), 2);

        assert!(matches!(a.recv().await, Some(WorkflowEvent::RunStarted { .. })));
        assert!(matches!(b.recv().await, Some(WorkflowEvent::RunStarted { .. })));
    }

    #[test]
    fn publishing_without_subscribers_reaches_nobody() {
        let bus = EventBus::new(16);
        assert_eq!(bus.publish(started(Uuid::now_v7())), 0);
    }

    #[tokio::test]
    async fn run_scoped_subscription_filters_other_runs() {
        let bus = EventBus::new(16);
        let mine = Uuid::now_v7();
        let sub = bus.subscribe();

        bus.publish(started(Uuid::now_v7()));
        bus.publish(started(mine));
        bus.publish(WorkflowEvent::RunCancelled {
            run_id: Uuid::now_v7(),
        });
        bus.publish(WorkflowEvent::RunCancelled { run_id: mine });

        let mut sub = sub.for_run(mine);
        let events = sub.drain();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.run_id() == mine));
    }

    #[test]
    fn lagged_subscription_keeps_receiving() {
        let bus = EventBus::new(4);
        let mut sub = bus.subscribe();
        for _ in 0..10 {
            bus.publish(WorkflowEvent::RunCancelled {
                run_id: Uuid::now_v7(),
            });
        }
        assert_eq!(sub.drain().len(), 4);
    }

    #[tokio::test]
    async fn recv_ends_when_bus_dropped() {
        let bus = EventBus::new(4);
        let mut sub = bus.subscribe();
        let clone = bus.clone();
        clone.publish(started(Uuid::now_v7()));
        drop(bus);
        drop(clone);

        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_none());
    }
}
