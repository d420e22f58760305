use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, mpsc};
use tokio::time::MissedTickBehavior;

use crate::registry::{SubscriberRegistry, Topic};

/// Every session re-pushes a full snapshot on this cadence, keeping the
/// transport alive and self-healing any missed broadcast.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Transport half of a live session. Backed by a capacity-1 channel: at most
/// one delivery is in flight, a session that can't keep up just recomputes
/// the latest snapshot on its next trigger.
pub struct EventSink {
    tx: mpsc::Sender<String>,
}

#[derive(Debug)]
pub struct SinkClosed;

impl fmt::Display for SinkClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event sink closed")
    }
}

impl EventSink {
    pub async fn push(&self, frame: String) -> Result<(), SinkClosed> {
        self.tx.send(frame).await.map_err(|_| SinkClosed)
    }

    /// Resolves once the receiving half is gone (client disconnect).
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

pub fn event_channel() -> (EventSink, mpsc::Receiver<String>) {
    let (tx, rx) = mpsc::channel(1);
    (EventSink { tx }, rx)
}

/// One live connection's delivery loop.
///
/// Registers with the registry, then on every trigger (immediate first
/// heartbeat tick, later ticks, or a registry wake-up) renders a fresh full
/// snapshot and pushes it down the sink. Deliveries within the session are
/// strictly sequential.
///
/// Terminates on client disconnect, push failure, or render failure; all
/// exits run through the same teardown (the subscription guard cancels on
/// drop too, so partial teardown can't happen).
pub async fn run_session<F, Fut, E>(
    registry: SubscriberRegistry,
    topic: Topic,
    sink: EventSink,
    render: F,
) where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<String, E>>,
    E: fmt::Display,
{
    let wakeup = Arc::new(Notify::new());
    let subscription = registry.register(topic, {
        let wakeup = Arc::clone(&wakeup);
        Box::new(move || wakeup.notify_one())
    });

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {}
            _ = wakeup.notified() => {}
            _ = sink.closed() => break,
        }

        let frame = match render().await {
            Ok(frame) => frame,
            Err(err) => {
                tracing::debug!("closing live session: {err}");
                break;
            }
        };

        if sink.push(frame).await.is_err() {
            break;
        }
    }

    subscription.cancel();
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use uuid::Uuid;

    use super::*;

    fn counting_render(
        renders: Arc<AtomicUsize>,
    ) -> impl Fn() -> std::future::Ready<Result<String, Infallible>> {
        move || {
            let n = renders.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok(format!("snapshot {n}")))
        }
    }

    #[tokio::test]
    async fn pushes_a_snapshot_immediately() {
        let registry = SubscriberRegistry::new();
        let topic = Topic::Club(Uuid::now_v7());
        let (sink, mut rx) = event_channel();

        let renders = Arc::new(AtomicUsize::new(0));
        tokio::spawn(run_session(
            registry.clone(),
            topic,
            sink,
            counting_render(Arc::clone(&renders)),
        ));

        assert_eq!(rx.recv().await.as_deref(), Some("snapshot 0"));
    }

    #[tokio::test]
    async fn broadcast_triggers_a_fresh_delivery() {
        let registry = SubscriberRegistry::new();
        let topic = Topic::Club(Uuid::now_v7());
        let (sink, mut rx) = event_channel();

        let renders = Arc::new(AtomicUsize::new(0));
        tokio::spawn(run_session(
            registry.clone(),
            topic,
            sink,
            counting_render(Arc::clone(&renders)),
        ));

        assert_eq!(rx.recv().await.as_deref(), Some("snapshot 0"));

        registry.broadcast(topic);
        assert_eq!(rx.recv().await.as_deref(), Some("snapshot 1"));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_repushes_without_any_broadcast() {
        let registry = SubscriberRegistry::new();
        let topic = Topic::Inbox(Uuid::now_v7());
        let (sink, mut rx) = event_channel();

        let renders = Arc::new(AtomicUsize::new(0));
        tokio::spawn(run_session(
            registry.clone(),
            topic,
            sink,
            counting_render(Arc::clone(&renders)),
        ));

        assert_eq!(rx.recv().await.as_deref(), Some("snapshot 0"));
        // Paused time auto-advances to the next heartbeat tick.
        assert_eq!(rx.recv().await.as_deref(), Some("snapshot 1"));
    }

    #[tokio::test]
    async fn client_disconnect_tears_down_and_unregisters() {
        let registry = SubscriberRegistry::new();
        let topic = Topic::Club(Uuid::now_v7());
        let (sink, mut rx) = event_channel();

        let renders = Arc::new(AtomicUsize::new(0));
        let session = tokio::spawn(run_session(
            registry.clone(),
            topic,
            sink,
            counting_render(Arc::clone(&renders)),
        ));

        assert!(rx.recv().await.is_some());
        assert_eq!(registry.subscriber_count(topic), 1);

        drop(rx);
        session.await.unwrap();
        assert_eq!(registry.subscriber_count(topic), 0);
    }

    #[tokio::test]
    async fn render_failure_terminates_the_session() {
        let registry = SubscriberRegistry::new();
        let topic = Topic::Club(Uuid::now_v7());
        let (sink, mut rx) = event_channel();

        let session = tokio::spawn(run_session(registry.clone(), topic, sink, || {
            std::future::ready(Err::<String, _>(SinkClosed))
        }));

        session.await.unwrap();
        assert_eq!(registry.subscriber_count(topic), 0);
        assert!(rx.recv().await.is_none());
    }
}
