//! State aggregator: the only writer of the snapshot.
//!
//! Design:
//! - Adapters, the registry and the dispatcher hand messages to one task
//!   through an unbounded channel (safe to use from foreign threads)
//! - The task replaces snapshot entries copy-on-write and publishes the new
//!   `Arc<Snapshot>` BEFORE notifying anyone, so a notified reader always
//!   sees the state it was told about
//! - Notifications go to callback listeners and to every
//!   [`NotificationReceiver`]: state on a lossy broadcast bus (a lagging
//!   receiver only needs the latest), availability changes and command
//!   outcomes on a lossless per-receiver queue
//! - Per-kind ordering follows channel order; nothing is promised across kinds

use crate::error::CommandError;
use crate::types::{Availability, ChangeEvent, EventSource, SubsystemKind, SubsystemState};
use chrono::{DateTime, Utc};
use log::{debug, info, trace};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

/// Broadcast channel capacity for state notifications.
/// Lagging receivers skip old states (they only need the latest).
pub const CHANNEL_CAPACITY: usize = 64;

/// One subsystem's slot in the snapshot.
#[derive(Clone, Debug, Default)]
pub struct Entry {
    pub availability: Availability,
    pub state: Option<Arc<SubsystemState>>,
    /// Wall-clock stamp of the event that produced `state`.
    pub updated: Option<DateTime<Utc>>,
    /// Monotonic instant of that event, the merge key.
    pub sampled: Option<Instant>,
    pub source: Option<EventSource>,
}

/// Aggregate state of all subsystems. Never mutated once published.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    entries: HashMap<SubsystemKind, Entry>,
}

/// Result of offering an event to the snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Merge {
    Accepted,
    /// Older than (or outranked by) what the snapshot already holds.
    Stale,
    /// The kind is not usable right now.
    Inactive,
}

impl Snapshot {
    pub fn entry(&self, kind: SubsystemKind) -> Option<&Entry> {
        self.entries.get(&kind)
    }

    pub fn availability(&self, kind: SubsystemKind) -> Availability {
        self.entries
            .get(&kind)
            .map(|e| e.availability.clone())
            .unwrap_or_default()
    }

    pub fn state(&self, kind: SubsystemKind) -> Option<&SubsystemState> {
        self.entries.get(&kind).and_then(|e| e.state.as_deref())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SubsystemKind, &Entry)> {
        self.entries.iter()
    }

    /// Latest sample wins; on a tie the higher source precedence wins
    /// (push over command-result over poll); equal keys let the newer arrival in.
    /// Ordered by the monotonic instant so a wall-clock step cannot freeze a kind.
    pub fn merge_verdict(&self, event: &ChangeEvent) -> Merge {
        let Some(entry) = self.entries.get(&event.kind()) else {
            return Merge::Inactive;
        };
        if !entry.availability.is_usable() {
            return Merge::Inactive;
        }
        match (entry.sampled, entry.source) {
            (Some(sampled), Some(source))
                if (event.sampled(), event.source().precedence())
                    < (sampled, source.precedence()) =>
            {
                Merge::Stale
            }
            _ => Merge::Accepted,
        }
    }

    fn with_event(&self, event: &ChangeEvent) -> Snapshot {
        let mut next = self.clone();
        let entry = next.entries.entry(event.kind()).or_default();
        entry.state = Some(Arc::new(event.payload().clone()));
        entry.updated = Some(event.timestamp());
        entry.sampled = Some(event.sampled());
        entry.source = Some(event.source());
        next
    }

    fn with_availability(&self, kind: SubsystemKind, availability: Availability) -> Snapshot {
        let mut next = self.clone();
        next.entries.entry(kind).or_default().availability = availability;
        next
    }
}

/// Published to UI layers.
#[derive(Clone, Debug)]
pub enum Notification {
    State {
        kind: SubsystemKind,
        state: Arc<SubsystemState>,
        availability: Availability,
        source: EventSource,
        timestamp: DateTime<Utc>,
    },
    Availability {
        kind: SubsystemKind,
        availability: Availability,
    },
    CommandApplied {
        kind: SubsystemKind,
        action: &'static str,
    },
    CommandFailed {
        kind: SubsystemKind,
        action: &'static str,
        error: CommandError,
    },
}

impl Notification {
    #[inline]
    pub fn kind(&self) -> SubsystemKind {
        match self {
            Notification::State { kind, .. }
            | Notification::Availability { kind, .. }
            | Notification::CommandApplied { kind, .. }
            | Notification::CommandFailed { kind, .. } => *kind,
        }
    }

    /// State may be coalesced; everything else must reach every receiver.
    #[inline]
    fn is_lossless(&self) -> bool {
        !matches!(self, Notification::State { .. })
    }
}

// ============ Receivers ============

/// Notification tagged with its position in the aggregator's output.
#[derive(Clone, Debug)]
struct Sequenced(u64, Notification);

type Queues = Arc<Mutex<Vec<mpsc::UnboundedSender<Sequenced>>>>;

/// One UI subscription. Drop it to unsubscribe.
///
/// Merges the state bus with the receiver's own outcome queue back into
/// aggregator order.
pub struct NotificationReceiver {
    states: broadcast::Receiver<Sequenced>,
    events: mpsc::UnboundedReceiver<Sequenced>,
    next_state: Option<Sequenced>,
    next_event: Option<Sequenced>,
    states_closed: bool,
    events_closed: bool,
}

impl NotificationReceiver {
    fn fill(&mut self) {
        while self.next_state.is_none() && !self.states_closed {
            match self.states.try_recv() {
                Ok(item) => self.next_state = Some(item),
                Err(TryRecvError::Lagged(skipped)) => {
                    debug!("Receiver lagged, skipped {} state notifications", skipped);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Closed) => self.states_closed = true,
            }
        }
        if self.next_event.is_none() && !self.events_closed {
            match self.events.try_recv() {
                Ok(item) => self.next_event = Some(item),
                Err(mpsc::error::TryRecvError::Empty) => {}
                Err(mpsc::error::TryRecvError::Disconnected) => self.events_closed = true,
            }
        }
    }

    fn take_earliest(&mut self) -> Option<Notification> {
        // Second pass: the side found empty may have received an earlier item
        // before the other side's head became visible.
        self.fill();
        self.fill();
        let state_first = match (&self.next_state, &self.next_event) {
            (Some(Sequenced(a, _)), Some(Sequenced(b, _))) => a < b,
            (Some(_), None) => true,
            _ => false,
        };
        let head = if state_first {
            self.next_state.take()
        } else {
            self.next_event.take()
        };
        head.map(|Sequenced(_, n)| n)
    }

    fn closed(&self) -> bool {
        self.states_closed && self.events_closed
    }

    /// Next notification without waiting.
    pub fn try_recv(&mut self) -> Result<Notification, TryRecvError> {
        match self.take_earliest() {
            Some(notification) => Ok(notification),
            None if self.closed() => Err(TryRecvError::Closed),
            None => Err(TryRecvError::Empty),
        }
    }

    /// Wait for the next notification. Only fails once the aggregator is gone.
    pub async fn recv(&mut self) -> Result<Notification, RecvError> {
        loop {
            if let Some(notification) = self.take_earliest() {
                return Ok(notification);
            }
            if self.closed() {
                return Err(RecvError::Closed);
            }
            tokio::select! {
                item = self.states.recv(), if !self.states_closed => match item {
                    Ok(item) => self.next_state = Some(item),
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("Receiver lagged, skipped {} state notifications", skipped);
                    }
                    Err(RecvError::Closed) => self.states_closed = true,
                },
                item = self.events.recv(), if !self.events_closed => match item {
                    Some(item) => self.next_event = Some(item),
                    None => self.events_closed = true,
                },
            }
        }
    }
}

// ============ Listeners ============

/// Handle returned by [`AggregatorHandle::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

type Listener = Arc<dyn Fn(&Notification) + Send + Sync>;

#[derive(Clone, Default)]
struct Listeners {
    inner: Arc<Mutex<Vec<(ListenerId, Listener)>>>,
}

impl Listeners {
    fn register(&self, listener: Listener) -> ListenerId {
        let id = ListenerId(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut guard) = self.inner.lock() {
            guard.push((id, listener));
        }
        id
    }

    fn unregister(&self, id: ListenerId) -> bool {
        match self.inner.lock() {
            Ok(mut guard) => {
                let before = guard.len();
                guard.retain(|(entry, _)| *entry != id);
                guard.len() != before
            }
            Err(_) => false,
        }
    }

    fn notify(&self, notification: &Notification) {
        // Call outside the lock so a listener may unregister itself.
        let listeners: Vec<Listener> = match self.inner.lock() {
            Ok(guard) => guard.iter().map(|(_, l)| Arc::clone(l)).collect(),
            Err(_) => return,
        };
        for listener in listeners {
            listener(notification);
        }
    }
}

// ============ Task ============

pub(crate) enum Inbound {
    Event(ChangeEvent),
    Availability(SubsystemKind, Availability),
    Outcome {
        kind: SubsystemKind,
        action: &'static str,
        result: Result<(), CommandError>,
        ack: oneshot::Sender<()>,
    },
    Flush(oneshot::Sender<()>),
}

struct AggregatorTask {
    current: Arc<Snapshot>,
    published: Arc<RwLock<Arc<Snapshot>>>,
    listeners: Listeners,
    bus: broadcast::Sender<Sequenced>,
    queues: Queues,
    seq: u64,
}

impl AggregatorTask {
    fn handle(&mut self, msg: Inbound) {
        match msg {
            Inbound::Event(event) => self.on_event(event),
            Inbound::Availability(kind, availability) => self.on_availability(kind, availability),
            Inbound::Outcome {
                kind,
                action,
                result,
                ack,
            } => {
                let notification = match result {
                    Ok(()) => Notification::CommandApplied { kind, action },
                    Err(error) => Notification::CommandFailed {
                        kind,
                        action,
                        error,
                    },
                };
                self.notify(notification);
                let _ = ack.send(());
            }
            Inbound::Flush(done) => {
                let _ = done.send(());
            }
        }
    }

    fn on_event(&mut self, event: ChangeEvent) {
        match self.current.merge_verdict(&event) {
            Merge::Accepted => {
                let next = Arc::new(self.current.with_event(&event));
                self.publish(next);
                trace!("{} state updated from {:?}", event.kind(), event.source());

                let kind = event.kind();
                let availability = self.current.availability(kind);
                let source = event.source();
                let timestamp = event.timestamp();
                let state = match self.current.entry(kind).and_then(|e| e.state.clone()) {
                    Some(state) => state,
                    None => Arc::new(event.into_payload()),
                };
                self.notify(Notification::State {
                    kind,
                    state,
                    availability,
                    source,
                    timestamp,
                });
            }
            Merge::Stale => {
                debug!(
                    "Dropping stale {:?} event for {} ({})",
                    event.source(),
                    event.kind(),
                    event.timestamp()
                );
            }
            Merge::Inactive => {
                debug!("Dropping event for inactive subsystem {}", event.kind());
            }
        }
    }

    fn on_availability(&mut self, kind: SubsystemKind, availability: Availability) {
        let known = self.current.entry(kind).is_some();
        if known && self.current.availability(kind) == availability {
            return;
        }
        info!("{} is now {}", kind, availability);
        let next = Arc::new(self.current.with_availability(kind, availability.clone()));
        self.publish(next);
        self.notify(Notification::Availability { kind, availability });
    }

    fn publish(&mut self, next: Arc<Snapshot>) {
        match self.published.write() {
            Ok(mut guard) => *guard = Arc::clone(&next),
            Err(poisoned) => *poisoned.into_inner() = Arc::clone(&next),
        }
        self.current = next;
    }

    fn notify(&mut self, notification: Notification) {
        self.listeners.notify(&notification);
        self.seq += 1;
        let item = Sequenced(self.seq, notification);

        if item.1.is_lossless() {
            if let Ok(mut queues) = self.queues.lock() {
                // Dropped receivers close their queue
                queues.retain(|tx| tx.send(item.clone()).is_ok());
            }
        } else {
            // No receivers is expected during startup.
            let _ = self.bus.send(item);
        }
    }
}

/// Cloneable front door to the aggregator task.
#[derive(Clone)]
pub struct AggregatorHandle {
    tx: mpsc::UnboundedSender<Inbound>,
    published: Arc<RwLock<Arc<Snapshot>>>,
    listeners: Listeners,
    bus: broadcast::Sender<Sequenced>,
    queues: Queues,
}

impl AggregatorHandle {
    /// Spawn the aggregator task on the current runtime.
    pub fn spawn() -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (bus, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        let published = Arc::new(RwLock::new(Arc::new(Snapshot::default())));
        let listeners = Listeners::default();
        let queues = Queues::default();

        let mut task = AggregatorTask {
            current: Arc::new(Snapshot::default()),
            published: Arc::clone(&published),
            listeners: listeners.clone(),
            bus: bus.clone(),
            queues: Arc::clone(&queues),
            seq: 0,
        };

        let join = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                task.handle(msg);
            }
            debug!("Aggregator channel closed");
        });

        (
            Self {
                tx,
                published,
                listeners,
                bus,
                queues,
            },
            join,
        )
    }

    /// Hand a change event to the aggregator. Non-blocking, callable from any thread.
    pub fn submit(&self, event: ChangeEvent) -> bool {
        self.tx.send(Inbound::Event(event)).is_ok()
    }

    pub(crate) fn set_availability(&self, kind: SubsystemKind, availability: Availability) {
        let _ = self.tx.send(Inbound::Availability(kind, availability));
    }

    /// Publish a command outcome and wait until listeners have seen it.
    pub(crate) async fn report_outcome(
        &self,
        kind: SubsystemKind,
        action: &'static str,
        result: Result<(), CommandError>,
    ) {
        let (ack, done) = oneshot::channel();
        if self
            .tx
            .send(Inbound::Outcome {
                kind,
                action,
                result,
                ack,
            })
            .is_ok()
        {
            let _ = done.await;
        }
    }

    /// Wait until every message queued before this call has been processed.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Inbound::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Current snapshot. Cheap: clones an `Arc`.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        match self.published.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Subscribe to notifications from now on. Drop the receiver to unsubscribe.
    pub fn subscribe(&self) -> NotificationReceiver {
        let (tx, events) = mpsc::unbounded_channel();
        if let Ok(mut queues) = self.queues.lock() {
            queues.push(tx);
        }
        NotificationReceiver {
            states: self.bus.subscribe(),
            events,
            next_state: None,
            next_event: None,
            states_closed: false,
            events_closed: false,
        }
    }

    /// Register a callback run on the aggregator task for every notification.
    /// Keep it short: it delays every later notification.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.listeners.register(Arc::new(listener))
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.unregister(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AudioDevice, AudioState, BrightnessState};
    use rand::Rng;
    use rand::seq::SliceRandom;
    use std::sync::LazyLock;
    use std::time::Duration;

    static BASE: LazyLock<Instant> = LazyLock::new(Instant::now);

    fn brightness(percent: u32) -> SubsystemState {
        SubsystemState::Brightness(BrightnessState {
            device: "intel_backlight".into(),
            percent,
        })
    }

    fn event(percent: u32, source: EventSource, secs: u64) -> ChangeEvent {
        ChangeEvent::new(brightness(percent), source).sampled_at(*BASE + Duration::from_secs(secs))
    }

    fn percent(snapshot: &Snapshot) -> Option<u32> {
        snapshot
            .state(SubsystemKind::Brightness)
            .and_then(|s| s.as_brightness())
            .map(|b| b.percent)
    }

    fn task() -> AggregatorTask {
        let (bus, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        AggregatorTask {
            current: Arc::new(Snapshot::default()),
            published: Arc::new(RwLock::new(Arc::new(Snapshot::default()))),
            listeners: Listeners::default(),
            bus,
            queues: Queues::default(),
            seq: 0,
        }
    }

    #[test]
    fn events_for_unknown_or_unavailable_kinds_are_dropped() {
        let mut task = task();
        task.handle(Inbound::Event(event(10, EventSource::Push, 0)));
        assert_eq!(percent(&task.current), None);

        task.handle(Inbound::Availability(
            SubsystemKind::Brightness,
            Availability::Unavailable,
        ));
        task.handle(Inbound::Event(event(10, EventSource::Push, 1)));
        assert_eq!(percent(&task.current), None);
    }

    #[test]
    fn later_sample_wins_and_push_wins_ties() {
        let mut task = task();
        task.handle(Inbound::Availability(
            SubsystemKind::Brightness,
            Availability::Available,
        ));

        task.handle(Inbound::Event(event(50, EventSource::Push, 10)));
        // Stale poll sampled before the push
        task.handle(Inbound::Event(event(20, EventSource::Poll, 9)));
        assert_eq!(percent(&task.current), Some(50));

        // Same instant: push stays
        task.handle(Inbound::Event(event(30, EventSource::Poll, 10)));
        assert_eq!(percent(&task.current), Some(50));

        // Newer poll replaces it
        task.handle(Inbound::Event(event(60, EventSource::Poll, 11)));
        assert_eq!(percent(&task.current), Some(60));

        // A push at the same instant as the poll takes over
        task.handle(Inbound::Event(event(70, EventSource::Push, 11)));
        assert_eq!(percent(&task.current), Some(70));
    }

    #[test]
    fn randomized_interleavings_keep_latest_event() {
        let mut rng = rand::thread_rng();

        for _ in 0..200 {
            let mut task = task();
            task.handle(Inbound::Availability(
                SubsystemKind::Brightness,
                Availability::Available,
            ));

            let count = rng.gen_range(1..20);
            let mut events: Vec<ChangeEvent> = (0..count)
                .map(|i| {
                    let source = if rng.gen_bool(0.5) {
                        EventSource::Push
                    } else {
                        EventSource::Poll
                    };
                    // Few distinct timestamps so ties are common
                    event(i as u32, source, rng.gen_range(0..5))
                })
                .collect();
            events.shuffle(&mut rng);

            let mut best: Option<(Instant, u8, u32)> = None;
            for ev in events {
                let key = (ev.sampled(), ev.source().precedence());
                let value = ev.payload().as_brightness().unwrap().percent;
                if best.is_none_or(|(ts, rank, _)| key >= (ts, rank)) {
                    best = Some((key.0, key.1, value));
                }
                task.handle(Inbound::Event(ev));
                assert_eq!(percent(&task.current), best.map(|b| b.2));
            }
        }
    }

    #[test]
    fn snapshot_is_published_before_listeners_run() {
        let mut task = task();
        let published = Arc::clone(&task.published);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);

        task.listeners.register(Arc::new(move |n: &Notification| {
            if let Notification::State { .. } = n {
                let snap = published.read().unwrap().clone();
                seen_cb.lock().unwrap().push(percent(&snap));
            }
        }));

        task.handle(Inbound::Availability(
            SubsystemKind::Brightness,
            Availability::Available,
        ));
        task.handle(Inbound::Event(event(42, EventSource::Push, 0)));
        task.handle(Inbound::Event(event(43, EventSource::Poll, 1)));

        assert_eq!(*seen.lock().unwrap(), vec![Some(42), Some(43)]);
    }

    #[test]
    fn previous_snapshot_is_not_mutated() {
        let mut task = task();
        task.handle(Inbound::Availability(
            SubsystemKind::Brightness,
            Availability::Available,
        ));
        task.handle(Inbound::Event(event(10, EventSource::Poll, 0)));
        let before = Arc::clone(&task.current);

        task.handle(Inbound::Event(event(90, EventSource::Poll, 1)));
        assert_eq!(percent(&before), Some(10));
        assert_eq!(percent(&task.current), Some(90));
    }

    #[test]
    fn unchanged_availability_is_not_renotified() {
        let mut task = task();
        let count = Arc::new(AtomicU64::new(0));
        let count_cb = Arc::clone(&count);
        task.listeners.register(Arc::new(move |n: &Notification| {
            if let Notification::Availability { .. } = n {
                count_cb.fetch_add(1, Ordering::SeqCst);
            }
        }));

        let kind = SubsystemKind::Audio;
        task.handle(Inbound::Availability(kind, Availability::Unavailable));
        task.handle(Inbound::Availability(kind, Availability::Unavailable));
        task.handle(Inbound::Availability(kind, Availability::Available));
        task.handle(Inbound::Availability(kind, Availability::Available));

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn handle_publishes_and_broadcasts() {
        let (handle, join) = AggregatorHandle::spawn();
        let mut rx = handle.subscribe();

        handle.set_availability(SubsystemKind::Audio, Availability::Available);
        let state = SubsystemState::Audio(AudioState {
            default_sink: Some("sink".into()),
            sinks: vec![AudioDevice {
                name: "sink".into(),
                volume_percent: 40,
                ..Default::default()
            }],
            ..Default::default()
        });
        assert!(handle.submit(ChangeEvent::new(state, EventSource::Push)));
        handle.flush().await;

        let snap = handle.snapshot();
        assert_eq!(
            snap.state(SubsystemKind::Audio)
                .and_then(|s| s.as_audio())
                .and_then(|a| a.volume()),
            Some(40)
        );

        assert!(matches!(
            rx.recv().await.unwrap(),
            Notification::Availability { .. }
        ));
        assert!(matches!(rx.recv().await.unwrap(), Notification::State { .. }));

        join.abort();
    }

    #[tokio::test]
    async fn removed_listener_stops_receiving() {
        let (handle, join) = AggregatorHandle::spawn();
        let count = Arc::new(AtomicU64::new(0));
        let count_cb = Arc::clone(&count);
        let id = handle.add_listener(move |_| {
            count_cb.fetch_add(1, Ordering::SeqCst);
        });

        handle.set_availability(SubsystemKind::Power, Availability::Available);
        handle.flush().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert!(handle.remove_listener(id));
        assert!(!handle.remove_listener(id));
        handle.set_availability(SubsystemKind::Power, Availability::Unavailable);
        handle.flush().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        join.abort();
    }

    #[test]
    fn wall_clock_step_back_does_not_freeze_state() {
        let mut task = task();
        task.handle(Inbound::Availability(
            SubsystemKind::Brightness,
            Availability::Available,
        ));

        // Stored before NTP pulled the clock back an hour
        let ahead = Utc::now() + chrono::Duration::hours(1);
        task.handle(Inbound::Event(ChangeEvent::with_timestamp(
            brightness(30),
            EventSource::Push,
            ahead,
        )));
        assert_eq!(percent(&task.current), Some(30));

        task.handle(Inbound::Event(ChangeEvent::new(brightness(55), EventSource::Poll)));
        assert_eq!(percent(&task.current), Some(55));
        let entry = task.current.entry(SubsystemKind::Brightness).unwrap();
        assert!(entry.updated.unwrap() < ahead);
    }

    #[tokio::test]
    async fn failed_command_survives_state_burst() {
        let (handle, join) = AggregatorHandle::spawn();
        let mut rx = handle.subscribe();
        handle.set_availability(SubsystemKind::Brightness, Availability::Available);

        handle
            .report_outcome(
                SubsystemKind::Brightness,
                "set",
                Err(CommandError::Rejected("read-only".into())),
            )
            .await;
        for percent in 0..(CHANNEL_CAPACITY as u32 * 2) {
            handle.submit(ChangeEvent::new(brightness(percent), EventSource::Poll));
        }
        handle.flush().await;

        let mut order = Vec::new();
        let mut last_percent = None;
        while let Ok(n) = rx.try_recv() {
            match &n {
                Notification::Availability { .. } => order.push("availability"),
                Notification::CommandFailed { error, .. } => {
                    assert_eq!(error.code(), "rejected");
                    order.push("failed");
                }
                Notification::State { state, .. } => {
                    last_percent = state.as_brightness().map(|b| b.percent);
                }
                Notification::CommandApplied { .. } => panic!("unexpected {:?}", n),
            }
        }
        assert_eq!(order, vec!["availability", "failed"]);
        assert_eq!(last_percent, Some(CHANNEL_CAPACITY as u32 * 2 - 1));

        join.abort();
    }

    #[tokio::test]
    async fn receiver_keeps_aggregator_order() {
        let (handle, join) = AggregatorHandle::spawn();
        let mut rx = handle.subscribe();

        handle.set_availability(SubsystemKind::Brightness, Availability::Available);
        handle.submit(ChangeEvent::new(brightness(10), EventSource::CommandResult));
        handle
            .report_outcome(SubsystemKind::Brightness, "set", Ok(()))
            .await;
        handle.submit(ChangeEvent::new(brightness(20), EventSource::Push));
        handle.flush().await;

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(match rx.recv().await.unwrap() {
                Notification::Availability { .. } => "availability",
                Notification::State { .. } => "state",
                Notification::CommandApplied { .. } => "applied",
                Notification::CommandFailed { .. } => "failed",
            });
        }
        assert_eq!(seen, vec!["availability", "state", "applied", "state"]);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        join.abort();
    }
}
