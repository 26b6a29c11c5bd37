//! Engine-wide notifications.
//!
//! Every subscriber owns a bounded channel. Emission never blocks and never
//! allocates for the payload-free events, so it is legal from the process
//! callback; a subscriber that falls behind loses events instead of stalling
//! the emitter.
//!
//! Emitting threads, per event:
//!
//! | event | emitted on |
//! |---|---|
//! | `Freewheel` | backend process thread |
//! | `Xrun`, `Halted` | backend notification or process thread |
//! | `SampleRateChanged`, `BufferSizeChanged` | control thread, or the backend thread delivering the change |
//! | `DeviceError` | backend thread or the reset worker |
//! | `DeviceListUpdateStarted`, `DeviceListChanged`, `DeviceListUpdateFinished` | device-list worker |
//! | `DeviceResetStarted`, `DeviceResetFinished` | reset worker |
//! | `Running`, `Stopped` | thread calling `start` / `stop` |
//! | `BecameSilent` | backend process thread |

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Freewheel(u32),
    Xrun,
    SampleRateChanged(u32),
    BufferSizeChanged(u32),
    DeviceError,
    DeviceListUpdateStarted,
    DeviceListChanged,
    DeviceListUpdateFinished,
    Halted(String),
    Running(u32),
    Stopped,
    DeviceResetStarted,
    DeviceResetFinished,
    BecameSilent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventKind {
    Freewheel,
    Xrun,
    SampleRateChanged,
    BufferSizeChanged,
    DeviceError,
    DeviceListUpdateStarted,
    DeviceListChanged,
    DeviceListUpdateFinished,
    Halted,
    Running,
    Stopped,
    DeviceResetStarted,
    DeviceResetFinished,
    BecameSilent,
}

impl EngineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            EngineEvent::Freewheel(_) => EventKind::Freewheel,
            EngineEvent::Xrun => EventKind::Xrun,
            EngineEvent::SampleRateChanged(_) => EventKind::SampleRateChanged,
            EngineEvent::BufferSizeChanged(_) => EventKind::BufferSizeChanged,
            EngineEvent::DeviceError => EventKind::DeviceError,
            EngineEvent::DeviceListUpdateStarted => EventKind::DeviceListUpdateStarted,
            EngineEvent::DeviceListChanged => EventKind::DeviceListChanged,
            EngineEvent::DeviceListUpdateFinished => EventKind::DeviceListUpdateFinished,
            EngineEvent::Halted(_) => EventKind::Halted,
            EngineEvent::Running(_) => EventKind::Running,
            EngineEvent::Stopped => EventKind::Stopped,
            EngineEvent::DeviceResetStarted => EventKind::DeviceResetStarted,
            EngineEvent::DeviceResetFinished => EventKind::DeviceResetFinished,
            EngineEvent::BecameSilent => EventKind::BecameSilent,
        }
    }
}

/// Set of [`EventKind`]s a subscriber wants to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventFilter(u32);

impl EventFilter {
    pub const ALL: EventFilter = EventFilter(u32::MAX);

    pub const fn none() -> Self {
        EventFilter(0)
    }

    pub fn only(kinds: &[EventKind]) -> Self {
        kinds.iter().fold(Self::none(), |filter, kind| filter.with(*kind))
    }

    pub const fn with(self, kind: EventKind) -> Self {
        EventFilter(self.0 | (1 << kind as u32))
    }

    pub const fn contains(self, kind: EventKind) -> bool {
        self.0 & (1 << kind as u32) != 0
    }
}

impl Default for EventFilter {
    fn default() -> Self {
        Self::ALL
    }
}

struct Subscriber {
    filter: EventFilter,
    tx: Sender<EngineEvent>,
    closed: AtomicBool,
}

/// Multi-subscriber fan-out for [`EngineEvent`]s.
pub struct EventHub {
    subscribers: ArcSwap<Vec<Arc<Subscriber>>>,
    capacity: usize,
    dropped: AtomicU64,
    stale: AtomicBool,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: ArcSwap::from_pointee(Vec::new()),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
            stale: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        self.subscribe_filtered(EventFilter::ALL)
    }

    pub fn subscribe_filtered(&self, filter: EventFilter) -> Receiver<EngineEvent> {
        let (tx, rx) = bounded(self.capacity);
        let subscriber = Arc::new(Subscriber {
            filter,
            tx,
            closed: AtomicBool::new(false),
        });
        let prune = self.stale.swap(false, Ordering::AcqRel);
        self.subscribers.rcu(|current| {
            let mut next: Vec<_> = current
                .iter()
                .filter(|existing| !prune || !existing.is_closed())
                .cloned()
                .collect();
            next.push(Arc::clone(&subscriber));
            next
        });
        rx
    }

    pub fn emit(&self, event: EngineEvent) {
        let kind = event.kind();
        let subscribers = self.subscribers.load();
        for subscriber in subscribers.iter() {
            if !subscriber.filter.contains(kind) {
                continue;
            }
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Disconnected(_)) => {
                    subscriber.closed.store(true, Ordering::Relaxed);
                    self.stale.store(true, Ordering::Relaxed);
                }
            }
        }
    }

    /// Events discarded because a subscriber's channel was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .load()
            .iter()
            .filter(|subscriber| !subscriber.is_closed())
            .count()
    }
}

impl Subscriber {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_subscriber_sees_each_event() {
        let hub = EventHub::new(8);
        let a = hub.subscribe();
        let b = hub.subscribe();

        hub.emit(EngineEvent::SampleRateChanged(48_000));

        assert_eq!(a.try_recv(), Ok(EngineEvent::SampleRateChanged(48_000)));
        assert_eq!(b.try_recv(), Ok(EngineEvent::SampleRateChanged(48_000)));
    }

    #[test]
    fn filters_select_kinds() {
        let hub = EventHub::new(8);
        let resets = hub.subscribe_filtered(EventFilter::only(&[
            EventKind::DeviceResetStarted,
            EventKind::DeviceResetFinished,
        ]));

        hub.emit(EngineEvent::Xrun);
        hub.emit(EngineEvent::DeviceResetStarted);
        hub.emit(EngineEvent::BufferSizeChanged(256));
        hub.emit(EngineEvent::DeviceResetFinished);

        let seen: Vec<_> = resets.try_iter().collect();
        assert_eq!(
            seen,
            vec![EngineEvent::DeviceResetStarted, EngineEvent::DeviceResetFinished]
        );
    }

    #[test]
    fn full_subscribers_drop_instead_of_blocking() {
        let hub = EventHub::new(2);
        let rx = hub.subscribe();
        for _ in 0..5 {
            hub.emit(EngineEvent::Xrun);
        }
        assert_eq!(rx.try_iter().count(), 2);
        assert_eq!(hub.dropped(), 3);
    }

    #[test]
    fn disconnected_subscribers_are_pruned() {
        let hub = EventHub::new(4);
        let gone = hub.subscribe();
        drop(gone);
        hub.emit(EngineEvent::Stopped);

        let _kept = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(hub.subscribers.load().len(), 1);
    }
}
