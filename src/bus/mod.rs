pub mod admin;
pub mod dispatch;
pub mod graph;
pub mod limiter;
pub mod listeners;
pub mod metrics;

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::time::Instant;
use tracing::debug;

use crate::config::{DispatchConfig, RateLimitConfig};
use crate::message::{Endpoint, Message, PlatformId};
use crate::store::LinkStore;

use self::dispatch::{Delivery, Dispatcher};
use self::graph::LinkGraph;
use self::limiter::{Admission, RateBucket, RateLimiter};
use self::listeners::{boxed_listener, ListenerId, ListenerRegistry};
use self::metrics::{BusMetrics, MetricsSnapshot};

pub use self::admin::BridgeError;

/// What happened to a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The source is not linked anywhere; nothing was charged or counted.
    NoDestinations,
    /// The source's rate bucket was empty.
    Dropped,
    /// Number of deliveries queued across all destinations and listeners.
    Dispatched { deliveries: usize },
}

struct BusInner {
    graph: LinkGraph,
    limiter: RateLimiter,
    listeners: ListenerRegistry,
    dispatcher: Dispatcher,
    metrics: BusMetrics,
    store: Arc<dyn LinkStore>,
}

/// Routes messages between linked chat endpoints.
///
/// Built once at startup and handed to every adapter; clones share state.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    pub fn new(
        rate_limit: RateLimitConfig,
        dispatch: &DispatchConfig,
        store: Arc<dyn LinkStore>,
    ) -> Self {
        Self {
            inner: Arc::new(BusInner {
                graph: LinkGraph::new(),
                limiter: RateLimiter::new(rate_limit),
                listeners: ListenerRegistry::new(),
                dispatcher: Dispatcher::new(dispatch.lane_capacity),
                metrics: BusMetrics::new(),
                store,
            }),
        }
    }

    /// Route a message to every endpoint reachable from its source.
    ///
    /// Never waits on listeners: deliveries are queued and run on their own
    /// lanes. Must be called from within a tokio runtime.
    pub fn publish(&self, message: Message) -> PublishOutcome {
        let inner = &self.inner;
        let destinations = inner.graph.reachable_from(&message.source);
        if destinations.is_empty() {
            return PublishOutcome::NoDestinations;
        }

        let source_type = message.source.platform.as_str();
        if let Admission::Dropped = inner.limiter.check(&message.source, message.rate_cost()) {
            debug!("Rate limited message {} from {}", message.id, message.source);
            inner.metrics.record_dropped(source_type);
            return PublishOutcome::Dropped;
        }
        inner.metrics.record_accepted(source_type);

        let message = Arc::new(message);
        let mut deliveries = 0;
        for destination in &destinations {
            if *destination == message.source {
                continue;
            }
            let platform = destination.platform.as_str();
            for (id, listener) in inner.listeners.for_platform(platform) {
                let still_registered = || inner.listeners.contains(platform, id);
                match inner
                    .dispatcher
                    .dispatch(destination, id, &listener, &message, still_registered)
                {
                    Delivery::Queued => deliveries += 1,
                    Delivery::Overflowed => inner.metrics.record_overflow(platform),
                    Delivery::ListenerGone => {}
                }
            }
        }
        PublishOutcome::Dispatched { deliveries }
    }

    /// Register a callback for messages routed to channels on `platform`.
    pub fn add_listener<F, Fut>(&self, platform: &str, listener: F) -> ListenerHandle
    where
        F: Fn(PlatformId, Arc<Message>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = self
            .inner
            .listeners
            .register(platform, boxed_listener(listener));
        ListenerHandle {
            bus: Arc::downgrade(&self.inner),
            platform: platform.to_string(),
            id,
        }
    }

    /// Every endpoint a message from `source` would be relayed to.
    pub fn reachable_from(&self, source: &Endpoint) -> BTreeSet<Endpoint> {
        self.inner.graph.reachable_from(source)
    }

    /// Snapshot of every edge currently in memory
    pub fn links(&self) -> Vec<(Endpoint, Endpoint)> {
        self.inner.graph.links()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn rate_bucket(&self, source: &Endpoint) -> Option<RateBucket> {
        self.inner.limiter.bucket(source)
    }

    /// Drop rate buckets that have refilled completely. Returns how many.
    pub fn prune_idle_buckets(&self) -> usize {
        self.inner.limiter.prune_idle(Instant::now())
    }

    pub fn tracked_sources(&self) -> usize {
        self.inner.limiter.len()
    }

    /// Close delivery lanes to endpoints no link leads to any more.
    /// Returns how many were closed.
    pub fn prune_idle_lanes(&self) -> usize {
        let targets = self.inner.graph.delivery_targets();
        self.inner
            .dispatcher
            .retain_destinations(|destination| targets.contains(destination))
    }

    pub fn open_lanes(&self) -> usize {
        self.inner.dispatcher.lane_count()
    }
}

/// Returned by [`Bus::add_listener`]; call [`ListenerHandle::unregister`] to
/// stop receiving messages. Dropping the handle leaves the listener in place.
pub struct ListenerHandle {
    bus: Weak<BusInner>,
    platform: String,
    id: ListenerId,
}

impl ListenerHandle {
    /// Returns false if the bus is gone or the listener was already removed.
    pub fn unregister(self) -> bool {
        let Some(inner) = self.bus.upgrade() else {
            return false;
        };
        let removed = inner.listeners.remove(&self.platform, self.id);
        inner.dispatcher.close_listener(self.id);
        removed
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::message::{AuthorInfo, Segment};
    use crate::store::SqliteLinkStore;
    use std::time::Duration;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    pub(crate) fn test_bus() -> Bus {
        let store = SqliteLinkStore::open_in_memory().unwrap();
        Bus::new(
            RateLimitConfig::default(),
            &DispatchConfig::default(),
            Arc::new(store),
        )
    }

    pub(crate) fn message_from(source: Endpoint, text: &str) -> Message {
        Message::new(
            AuthorInfo::new("alice", 100),
            vec![Segment::text(text)],
            source,
            1,
        )
    }

    /// Listener that forwards every (channel, message) it sees
    fn capture(bus: &Bus, platform: &str) -> UnboundedReceiver<(PlatformId, Arc<Message>)> {
        let (tx, rx) = unbounded_channel();
        bus.add_listener(platform, move |channel, message| {
            let tx = tx.clone();
            async move {
                tx.send((channel, message))?;
                anyhow::Ok(())
            }
        });
        rx
    }

    async fn next(
        rx: &mut UnboundedReceiver<(PlatformId, Arc<Message>)>,
    ) -> (PlatformId, Arc<Message>) {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for delivery")
            .expect("listener channel closed")
    }

    async fn assert_quiet(rx: &mut UnboundedReceiver<(PlatformId, Arc<Message>)>) {
        let extra = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(extra.is_err(), "unexpected extra delivery: {:?}", extra);
    }

    async fn refuse(_: PlatformId, _: Arc<Message>) -> anyhow::Result<()> {
        anyhow::bail!("send failed")
    }

    async fn explode(_: PlatformId, _: Arc<Message>) -> anyhow::Result<()> {
        panic!("adapter bug")
    }

    fn discord(channel: i64) -> Endpoint {
        Endpoint::new("discord", channel)
    }

    #[tokio::test]
    async fn test_bidirectional_end_to_end() {
        let bus = test_bus();
        let mut rx = capture(&bus, "discord");
        bus.add_bridge_link(&discord(1), &discord(2), None, true)
            .await
            .unwrap();

        let outcome = bus.publish(message_from(discord(1), "hello"));
        assert_eq!(outcome, PublishOutcome::Dispatched { deliveries: 1 });
        let (channel, msg) = next(&mut rx).await;
        assert_eq!(channel, PlatformId::Int(2));
        assert_eq!(msg.body, vec![Segment::text("hello")]);
        assert_quiet(&mut rx).await;

        bus.publish(message_from(discord(2), "back"));
        let (channel, msg) = next(&mut rx).await;
        assert_eq!(channel, PlatformId::Int(1));
        assert_eq!(msg.body, vec![Segment::text("back")]);
        assert_quiet(&mut rx).await;
    }

    #[tokio::test]
    async fn test_no_destinations_short_circuit() {
        let bus = test_bus();
        bus.add_bridge_link(&discord(1), &discord(2), None, false)
            .await
            .unwrap();

        // discord:2 has no outgoing edges
        for _ in 0..20 {
            assert_eq!(
                bus.publish(message_from(discord(2), "into the void")),
                PublishOutcome::NoDestinations
            );
        }
        assert!(bus.rate_bucket(&discord(2)).is_none());
        assert_eq!(bus.metrics(), MetricsSnapshot::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_drops_and_refills() {
        let bus = test_bus();
        let _rx = capture(&bus, "discord");
        bus.add_bridge_link(&discord(1), &discord(2), None, false)
            .await
            .unwrap();

        for _ in 0..10 {
            assert_eq!(
                bus.publish(message_from(discord(1), "spam")),
                PublishOutcome::Dispatched { deliveries: 1 }
            );
        }
        assert_eq!(
            bus.publish(message_from(discord(1), "spam")),
            PublishOutcome::Dropped
        );

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(matches!(
            bus.publish(message_from(discord(1), "spam")),
            PublishOutcome::Dispatched { .. }
        ));
        assert_eq!(
            bus.publish(message_from(discord(1), "spam")),
            PublishOutcome::Dropped
        );

        let metrics = bus.metrics();
        assert_eq!(metrics.accepted("discord"), 11);
        assert_eq!(metrics.dropped("discord"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deprioritized_authors_cost_double() {
        let bus = test_bus();
        bus.add_bridge_link(&discord(1), &discord(2), None, false)
            .await
            .unwrap();

        let mut msg = message_from(discord(1), "beep");
        msg.author.deprioritize = true;
        for _ in 0..5 {
            assert!(matches!(
                bus.publish(msg.clone()),
                PublishOutcome::Dispatched { .. }
            ));
        }
        assert_eq!(bus.publish(msg), PublishOutcome::Dropped);
    }

    #[tokio::test]
    async fn test_failing_listener_does_not_block_others() {
        let bus = test_bus();
        bus.add_listener("discord", refuse);
        bus.add_listener("discord", explode);
        let mut rx = capture(&bus, "discord");
        bus.add_bridge_link(&discord(1), &discord(2), None, false)
            .await
            .unwrap();

        assert_eq!(
            bus.publish(message_from(discord(1), "still arrives")),
            PublishOutcome::Dispatched { deliveries: 3 }
        );
        let (channel, _) = next(&mut rx).await;
        assert_eq!(channel, PlatformId::Int(2));
    }

    #[tokio::test]
    async fn test_hung_listener_does_not_block_other_destinations() {
        let bus = test_bus();
        bus.add_listener("irc", |_, _| futures::future::pending::<anyhow::Result<()>>());
        let mut rx = capture(&bus, "discord");
        let irc = Endpoint::new("irc", "#stuck");
        bus.add_bridge_link(&discord(1), &irc, None, false)
            .await
            .unwrap();
        bus.add_bridge_link(&discord(1), &discord(2), None, false)
            .await
            .unwrap();

        for n in 0..3 {
            bus.publish(message_from(discord(1), &format!("msg {}", n)));
        }
        for n in 0..3 {
            let (_, msg) = next(&mut rx).await;
            assert_eq!(msg.body, vec![Segment::text(format!("msg {}", n))]);
        }
    }

    #[tokio::test]
    async fn test_fan_out_across_platforms() {
        let bus = test_bus();
        let mut discord_rx = capture(&bus, "discord");
        let mut irc_rx = capture(&bus, "irc");
        let irc = Endpoint::new("irc", "#bridge");
        bus.add_bridge_link(&discord(1), &irc, None, true)
            .await
            .unwrap();
        bus.add_bridge_link(&irc, &discord(3), None, true)
            .await
            .unwrap();

        assert_eq!(
            bus.publish(message_from(discord(1), "hi all")),
            PublishOutcome::Dispatched { deliveries: 2 }
        );
        let (channel, _) = next(&mut irc_rx).await;
        assert_eq!(channel, PlatformId::Str("#bridge".to_string()));
        let (channel, _) = next(&mut discord_rx).await;
        assert_eq!(channel, PlatformId::Int(3));
        // never echoed back to the origin
        assert_quiet(&mut discord_rx).await;
    }

    #[tokio::test]
    async fn test_unregister_listener() {
        let bus = test_bus();
        let (tx, mut rx) = unbounded_channel();
        let handle = bus.add_listener("discord", move |channel, _| {
            let tx = tx.clone();
            async move {
                tx.send(channel)?;
                anyhow::Ok(())
            }
        });
        bus.add_bridge_link(&discord(1), &discord(2), None, false)
            .await
            .unwrap();

        bus.publish(message_from(discord(1), "one"));
        assert!(rx.recv().await.is_some());

        assert!(handle.unregister());
        assert_eq!(
            bus.publish(message_from(discord(1), "two")),
            PublishOutcome::Dispatched { deliveries: 0 }
        );
        // lanes closed, so the listener's sender is dropped with it
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unlinking_closes_lanes() {
        let bus = test_bus();
        let _rx = capture(&bus, "discord");
        for channel in 2..52 {
            // a fresh caller each time so the rate limit never kicks in
            let caller = discord(channel + 1000);
            bus.add_bridge_link(&caller, &discord(channel), None, false)
                .await
                .unwrap();
            bus.publish(message_from(caller.clone(), "ring"));
            assert_eq!(bus.open_lanes(), 1);
            bus.remove_bridge_link(&caller, &discord(channel), false)
                .await
                .unwrap();
        }
        assert!(bus.links().is_empty());
        assert_eq!(bus.open_lanes(), 0);
    }

    #[tokio::test]
    async fn test_lanes_kept_while_destination_is_linked() {
        let bus = test_bus();
        let _rx = capture(&bus, "discord");
        bus.add_bridge_link(&discord(1), &discord(2), None, false)
            .await
            .unwrap();
        bus.add_bridge_link(&discord(3), &discord(2), None, false)
            .await
            .unwrap();
        bus.publish(message_from(discord(1), "hi"));
        bus.publish(message_from(discord(3), "hi"));
        assert_eq!(bus.open_lanes(), 1);

        // discord:2 is still reachable from discord:3
        bus.remove_bridge_link(&discord(1), &discord(2), false)
            .await
            .unwrap();
        assert_eq!(bus.open_lanes(), 1);
        assert_eq!(bus.prune_idle_lanes(), 0);

        bus.remove_bridge_link(&discord(3), &discord(2), false)
            .await
            .unwrap();
        assert_eq!(bus.open_lanes(), 0);
    }

    #[tokio::test]
    async fn test_no_lane_reopened_for_unregistered_listener() {
        let bus = test_bus();
        let handle = bus.add_listener("discord", |_, _| async { anyhow::Ok(()) });
        bus.add_bridge_link(&discord(1), &discord(2), None, false)
            .await
            .unwrap();

        // a publish that snapshotted the listener before it was removed
        let snapshot = bus.inner.listeners.for_platform("discord");
        assert!(handle.unregister());

        let message = Arc::new(message_from(discord(1), "late"));
        for (id, listener) in snapshot {
            let delivery = bus.inner.dispatcher.dispatch(
                &discord(2),
                id,
                &listener,
                &message,
                || bus.inner.listeners.contains("discord", id),
            );
            assert_eq!(delivery, Delivery::ListenerGone);
        }
        assert_eq!(bus.open_lanes(), 0);
    }
}
