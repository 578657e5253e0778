use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::event::Event;

/// Receives events from the bus. Handlers run on the subscriber's own
/// delivery task; a slow or panicking handler never blocks the dispatcher.
#[async_trait]
pub trait Subscriber: Send + Sync {
    fn name(&self) -> &str {
        "subscriber"
    }

    async fn handle(&self, event: Event) -> crate::Result<()>;
}

/// Bus tuning knobs.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Per-subscriber queue bound; the oldest pending event is dropped when full.
    pub subscriber_capacity: usize,
    /// Abandon a handler invocation after this long and move on.
    pub subscriber_timeout: Option<Duration>,
    /// LRU de-dup window over event bookmarks (0 disables).
    pub dedup_window: usize,
    /// How long `close` waits for in-flight subscribers to drain.
    pub close_grace: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: 256,
            subscriber_timeout: Some(Duration::from_secs(5)),
            dedup_window: 0,
            close_grace: Duration::from_secs(5),
        }
    }
}

/// Cumulative bus counters.
#[derive(Debug, Clone, Default)]
pub struct BusStats {
    pub published: u64,
    pub deduplicated: u64,
    pub dropped: u64,
    pub handler_errors: u64,
}

pub type SubscriptionId = u64;

struct Subscription {
    id: SubscriptionId,
    name: String,
    /// `None` subscribes to every event type.
    types: Option<HashSet<String>>,
    queue: Mutex<VecDeque<Event>>,
    capacity: usize,
    notify: Notify,
    shutdown: CancellationToken,
    handler: Arc<dyn Subscriber>,
}

impl Subscription {
    fn wants(&self, event_type: &str) -> bool {
        match &self.types {
            None => true,
            Some(set) => set.contains(event_type),
        }
    }
}

struct BusInner {
    config: BusConfig,
    subscriptions: RwLock<Vec<Arc<Subscription>>>,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    tx: mpsc::UnboundedSender<Event>,
    dispatch_cancel: CancellationToken,
    dispatcher: Mutex<Option<tokio::task::JoinHandle<()>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    published: AtomicU64,
    deduplicated: AtomicU64,
    dropped: AtomicU64,
    handler_errors: AtomicU64,
}

/// Single-dispatcher fan-out bus. Publishing appends to a central ordered
/// queue; a dedicated task distributes each event to every matching
/// subscriber's bounded queue.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(BusInner {
            config,
            subscriptions: RwLock::new(Vec::new()),
            workers: Mutex::new(Vec::new()),
            tx,
            dispatch_cancel: CancellationToken::new(),
            dispatcher: Mutex::new(None),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            published: AtomicU64::new(0),
            deduplicated: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            handler_errors: AtomicU64::new(0),
        });
        let handle = tokio::spawn(dispatch_loop(Arc::clone(&inner), rx));
        *inner.dispatcher.lock() = Some(handle);
        Self { inner }
    }

    /// Append an event to the central queue. Returns `false` once closed.
    pub fn publish(&self, event: Event) -> bool {
        if self.inner.closed.load(Ordering::Acquire) {
            return false;
        }
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        self.inner.tx.send(event).is_ok()
    }

    /// Register a handler for the given event types (empty = all types).
    pub fn subscribe(
        &self,
        name: impl Into<String>,
        types: &[&str],
        handler: Arc<dyn Subscriber>,
    ) -> SubscriptionId {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let sub = Arc::new(Subscription {
            id,
            name: name.into(),
            types: if types.is_empty() {
                None
            } else {
                Some(types.iter().map(|t| t.to_string()).collect())
            },
            queue: Mutex::new(VecDeque::new()),
            capacity: self.inner.config.subscriber_capacity.max(1),
            notify: Notify::new(),
            shutdown: CancellationToken::new(),
            handler,
        });
        let worker = tokio::spawn(delivery_loop(Arc::clone(&self.inner), Arc::clone(&sub)));
        self.inner.workers.lock().push(worker);
        self.inner.subscriptions.write().push(sub);
        id
    }

    /// Forward matching events onto an unbounded channel. Handy for tests
    /// and stream consumers that drain promptly.
    pub fn subscribe_channel(
        &self,
        name: impl Into<String>,
        types: &[&str],
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(name, types, Arc::new(ChannelForwarder { tx }));
        (id, rx)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut subs = self.inner.subscriptions.write();
        if let Some(pos) = subs.iter().position(|s| s.id == id) {
            let sub = subs.remove(pos);
            sub.shutdown.cancel();
        }
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.inner.published.load(Ordering::Relaxed),
            deduplicated: self.inner.deduplicated.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
            handler_errors: self.inner.handler_errors.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting events, drain subscribers up to the grace period.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.dispatch_cancel.cancel();
        let dispatcher = self.inner.dispatcher.lock().take();
        if let Some(handle) = dispatcher {
            let _ = tokio::time::timeout(self.inner.config.close_grace, handle).await;
        }
        let subs: Vec<_> = self.inner.subscriptions.write().drain(..).collect();
        for sub in &subs {
            sub.shutdown.cancel();
        }
        let workers: Vec<_> = self.inner.workers.lock().drain(..).collect();
        for worker in workers {
            let _ = tokio::time::timeout(self.inner.config.close_grace, worker).await;
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

async fn dispatch_loop(inner: Arc<BusInner>, mut rx: mpsc::UnboundedReceiver<Event>) {
    let window = inner.config.dedup_window;
    let mut seen_order: VecDeque<String> = VecDeque::new();
    let mut seen: HashSet<String> = HashSet::new();

    loop {
        let event = tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(ev) => ev,
                None => break,
            },
            _ = inner.dispatch_cancel.cancelled() => break,
        };

        if window > 0 {
            if let Some(key) = event.dedup_key() {
                if seen.contains(&key) {
                    inner.deduplicated.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                seen.insert(key.clone());
                seen_order.push_back(key);
                while seen_order.len() > window {
                    if let Some(old) = seen_order.pop_front() {
                        seen.remove(&old);
                    }
                }
            }
        }

        let subs: Vec<Arc<Subscription>> = inner.subscriptions.read().clone();
        for sub in subs {
            if !sub.wants(&event.event_type) {
                continue;
            }
            {
                let mut queue = sub.queue.lock();
                if queue.len() >= sub.capacity {
                    queue.pop_front();
                    inner.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(subscriber = %sub.name, "subscriber queue full, dropped oldest event");
                }
                queue.push_back(event.clone());
            }
            sub.notify.notify_one();
        }
    }
}

async fn delivery_loop(inner: Arc<BusInner>, sub: Arc<Subscription>) {
    loop {
        let next = sub.queue.lock().pop_front();
        match next {
            Some(event) => {
                deliver(&inner, &sub, event).await;
            }
            None => {
                if sub.shutdown.is_cancelled() {
                    return;
                }
                tokio::select! {
                    _ = sub.notify.notified() => {}
                    _ = sub.shutdown.cancelled() => {}
                }
            }
        }
    }
}

async fn deliver(inner: &BusInner, sub: &Subscription, event: Event) {
    let handler = Arc::clone(&sub.handler);
    let event_type = event.event_type.clone();
    // Handlers run in their own task so a panic is contained as a JoinError.
    let invocation = tokio::spawn(async move { handler.handle(event).await });
    let outcome = match inner.config.subscriber_timeout {
        Some(limit) => match tokio::time::timeout(limit, invocation).await {
            Ok(joined) => joined,
            Err(_) => {
                inner.handler_errors.fetch_add(1, Ordering::Relaxed);
                warn!(subscriber = %sub.name, event = %event_type, "subscriber handler timed out, abandoning");
                return;
            }
        },
        None => invocation.await,
    };
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            inner.handler_errors.fetch_add(1, Ordering::Relaxed);
            warn!(subscriber = %sub.name, event = %event_type, error = %e, "subscriber handler failed");
        }
        Err(join_err) => {
            inner.handler_errors.fetch_add(1, Ordering::Relaxed);
            if join_err.is_panic() {
                warn!(subscriber = %sub.name, event = %event_type, "subscriber handler panicked");
            }
        }
    }
}

struct ChannelForwarder {
    tx: mpsc::UnboundedSender<Event>,
}

#[async_trait]
impl Subscriber for ChannelForwarder {
    fn name(&self) -> &str {
        "channel"
    }

    async fn handle(&self, event: Event) -> crate::Result<()> {
        let _ = self.tx.send(event);
        Ok(())
    }
}

// ── Process-wide default bus ───────────────────────────────────

static DEFAULT_BUS: OnceLock<RwLock<Option<EventBus>>> = OnceLock::new();

fn default_slot() -> &'static RwLock<Option<EventBus>> {
    DEFAULT_BUS.get_or_init(|| RwLock::new(None))
}

/// Install the process-wide default bus.
pub fn set_default(bus: EventBus) {
    *default_slot().write() = Some(bus);
}

/// The process-wide default bus, if one was installed.
pub fn default_bus() -> Option<EventBus> {
    default_slot().read().clone()
}

/// Close and remove the process-wide default bus.
pub async fn close_default() {
    let bus = default_slot().write().take();
    if let Some(bus) = bus {
        bus.close().await;
    }
}
