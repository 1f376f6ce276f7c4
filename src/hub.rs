//! Publish/subscribe fan-out for position updates and alerts.
//!
//! Each subscriber owns a bounded mailbox. Publishing never waits on a
//! subscriber: when a mailbox is full the configured [`OverflowPolicy`] either
//! drops the oldest queued event or disconnects the subscriber. The registry
//! lock is only held to look up or mutate the subscriber set, never while a
//! subscriber is being served.

use std::collections::{HashMap, VecDeque};
use std::fmt::{self, Display};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::MonitorError;
use crate::model::{Alert, Position, TripId};

/// Named topic: one trip, or the whole fleet.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    Trip(TripId),
    Fleet,
}

impl Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Trip(id) => write!(f, "trip:{id}"),
            Self::Fleet => f.write_str("fleet"),
        }
    }
}

impl FromStr for Channel {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "fleet" {
            return Ok(Self::Fleet);
        }
        match s.strip_prefix("trip:") {
            Some(id) if !id.is_empty() => Ok(Self::Trip(TripId::from(id))),
            _ => Err(MonitorError::Config(format!("unknown channel: {s}"))),
        }
    }
}

/// Latest accepted position of a trip together with its evaluation result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionUpdate {
    pub trip_id: TripId,
    pub position: Position,
    pub distance_from_route_meters: Option<f64>,
    pub is_deviated: bool,
    pub is_stopped: bool,
    /// The device has not reported for longer than the staleness threshold.
    pub device_stale: bool,
    pub published_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Event {
    PositionUpdate(PositionUpdate),
    Alert(Alert),
    FleetSnapshot(Vec<PositionUpdate>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    #[default]
    DropOldest,
    Disconnect,
}

impl FromStr for OverflowPolicy {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drop-oldest" | "drop_oldest" => Ok(Self::DropOldest),
            "disconnect" => Ok(Self::Disconnect),
            other => Err(MonitorError::Config(format!("unknown overflow policy: {other}"))),
        }
    }
}

/// Outcome of a single publish call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub dropped: usize,
    pub disconnected: usize,
}

#[derive(Debug)]
struct Mailbox {
    queue: Mutex<VecDeque<Arc<Event>>>,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

enum Push {
    Delivered,
    DroppedOldest,
    Overflowed,
    Closed,
}

impl Mailbox {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    fn push(&self, event: Arc<Event>, capacity: usize, policy: OverflowPolicy) -> Push {
        if self.closed.load(Ordering::Acquire) {
            return Push::Closed;
        }
        let outcome = {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            if queue.len() < capacity {
                queue.push_back(event);
                Push::Delivered
            } else {
                match policy {
                    OverflowPolicy::DropOldest => {
                        queue.pop_front();
                        queue.push_back(event);
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        Push::DroppedOldest
                    }
                    OverflowPolicy::Disconnect => Push::Overflowed,
                }
            }
        };
        match outcome {
            Push::Overflowed => self.close(),
            _ => self.notify.notify_one(),
        }
        outcome
    }

    fn pop(&self) -> Option<Arc<Event>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).pop_front()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

type Registry = HashMap<Channel, HashMap<u64, Arc<Mailbox>>>;

#[derive(Debug)]
struct HubInner {
    registry: RwLock<Registry>,
    next_id: AtomicU64,
    capacity: usize,
    policy: OverflowPolicy,
}

impl HubInner {
    fn remove(&self, channel: &Channel, id: u64) {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(subscribers) = registry.get_mut(channel) {
            subscribers.remove(&id);
            if subscribers.is_empty() {
                registry.remove(channel);
            }
        }
    }
}

/// Cheaply cloneable handle to the subscriber registry.
#[derive(Debug, Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    /// `capacity` bounds every subscriber's mailbox (minimum 1).
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            inner: Arc::new(HubInner {
                registry: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                capacity: capacity.max(1),
                policy,
            }),
        }
    }

    pub fn subscribe(&self, channel: Channel) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mailbox = Arc::new(Mailbox::new(self.inner.capacity));
        self.inner
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(channel.clone())
            .or_default()
            .insert(id, Arc::clone(&mailbox));
        debug!(channel = %channel, subscriber = id, "Subscriber joined");

        Subscription { id, channel, mailbox, hub: Arc::downgrade(&self.inner) }
    }

    /// Delivers `event` to every subscriber of `channel` without waiting on
    /// any of them.
    pub fn publish(&self, channel: &Channel, event: Event) -> PublishReport {
        let targets: Vec<(u64, Arc<Mailbox>)> = {
            let registry = self.inner.registry.read().unwrap_or_else(PoisonError::into_inner);
            match registry.get(channel) {
                Some(subscribers) => {
                    subscribers.iter().map(|(id, m)| (*id, Arc::clone(m))).collect()
                }
                None => return PublishReport::default(),
            }
        };

        let event = Arc::new(event);
        let mut report = PublishReport::default();
        for (id, mailbox) in targets {
            match mailbox.push(Arc::clone(&event), self.inner.capacity, self.inner.policy) {
                Push::Delivered => report.delivered += 1,
                Push::DroppedOldest => {
                    report.delivered += 1;
                    report.dropped += 1;
                    debug!(
                        channel = %channel,
                        subscriber = id,
                        "Subscriber lagging, dropped oldest event"
                    );
                }
                Push::Closed => self.inner.remove(channel, id),
                Push::Overflowed => {
                    report.disconnected += 1;
                    self.inner.remove(channel, id);
                    let err = MonitorError::PublishFailure(format!(
                        "subscriber {id} on {channel} exceeded {} queued events",
                        self.inner.capacity
                    ));
                    warn!(
                        channel = %channel,
                        subscriber = id,
                        error = %err,
                        "Subscriber disconnected"
                    );
                }
            }
        }
        report
    }

    pub fn subscriber_count(&self, channel: &Channel) -> usize {
        self.inner
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .map_or(0, HashMap::len)
    }
}

/// A registration on one channel. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    channel: Channel,
    mailbox: Arc<Mailbox>,
    hub: Weak<HubInner>,
}

impl Subscription {
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Waits for the next event. Returns `None` once the subscription has been
    /// disconnected and its queue drained.
    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        loop {
            if let Some(event) = self.mailbox.pop() {
                return Some(event);
            }
            if self.mailbox.closed.load(Ordering::Acquire) {
                return None;
            }
            self.mailbox.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<Arc<Event>> {
        self.mailbox.pop()
    }

    /// Number of events dropped because this subscriber fell behind.
    pub fn dropped(&self) -> u64 {
        self.mailbox.dropped.load(Ordering::Relaxed)
    }

    /// Enqueues an event for this subscriber only.
    pub(crate) fn prime(&self, event: Event, capacity: usize) {
        self.mailbox.push(Arc::new(event), capacity, OverflowPolicy::DropOldest);
    }

    pub fn unsubscribe(self) {}

    /// Adapts the subscription into a lazy stream of events.
    pub fn into_stream(self) -> impl Stream<Item = Arc<Event>> {
        futures::stream::unfold(self, |mut sub| async move {
            let event = sub.recv().await?;
            Some((event, sub))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.mailbox.close();
        if let Some(hub) = self.hub.upgrade() {
            hub.remove(&self.channel, self.id);
            debug!(channel = %self.channel, subscriber = self.id, "Subscriber left");
        }
    }
}
