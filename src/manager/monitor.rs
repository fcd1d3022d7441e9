use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::types::{OriginId, StorageKind};

/// Selects which storage changes an observer is told about.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageObserverFilter {
    pub kind: StorageKind,
    pub origin: OriginId,
}

/// Registration parameters: the filter, the minimum spacing between events,
/// and whether a first event fires as soon as initial numbers are known.
#[derive(Debug, Clone)]
pub struct StorageObserverParams {
    pub filter: StorageObserverFilter,
    pub rate: Duration,
    pub dispatch_initial: bool,
}

/// Event delivered to observers after a usage-affecting change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub filter: StorageObserverFilter,
    pub usage: i64,
    pub quota: i64,
}

const EVENT_CHANNEL_CAPACITY: usize = 16;

pub(crate) struct ObserverEntry {
    pub(crate) params: StorageObserverParams,
    pub(crate) tx: mpsc::Sender<StorageEvent>,
    last_dispatch: Mutex<Option<Instant>>,
    pending: AtomicBool,
}

impl ObserverEntry {
    /// Claims the right to dispatch. Returns the delay honoring the rate
    /// limit, or `None` when a dispatch is already scheduled; that dispatch
    /// reads fresh numbers when it fires, so the new change is covered.
    pub(crate) fn try_begin_dispatch(&self) -> Option<Duration> {
        if self.pending.swap(true, Ordering::SeqCst) {
            return None;
        }
        let delay = match *self.lock_last() {
            Some(last) => self.params.rate.saturating_sub(last.elapsed()),
            None => Duration::ZERO,
        };
        Some(delay)
    }

    pub(crate) fn finish_dispatch(&self) {
        *self.lock_last() = Some(Instant::now());
        self.pending.store(false, Ordering::SeqCst);
    }

    fn lock_last(&self) -> MutexGuard<'_, Option<Instant>> {
        self.last_dispatch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Registered observers keyed by a process-unique id. Unregistration is
/// implicit: an entry whose receiver is gone is removed on the next failed
/// send.
#[derive(Default)]
pub(crate) struct ObserverRegistry {
    next_id: AtomicU64,
    entries: DashMap<u64, std::sync::Arc<ObserverEntry>>,
}

impl ObserverRegistry {
    pub(crate) fn register(
        &self,
        params: StorageObserverParams,
    ) -> (u64, mpsc::Receiver<StorageEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.entries.insert(
            id,
            std::sync::Arc::new(ObserverEntry {
                params,
                tx,
                last_dispatch: Mutex::new(None),
                pending: AtomicBool::new(false),
            }),
        );
        (id, rx)
    }

    pub(crate) fn remove(&self, id: u64) {
        self.entries.remove(&id);
    }

    pub(crate) fn get(&self, id: u64) -> Option<std::sync::Arc<ObserverEntry>> {
        self.entries.get(&id).map(|entry| entry.value().clone())
    }

    pub(crate) fn matching(
        &self,
        origin: &OriginId,
        kind: StorageKind,
    ) -> Vec<(u64, std::sync::Arc<ObserverEntry>)> {
        self.entries
            .iter()
            .filter(|entry| {
                entry.value().params.filter.kind == kind
                    && entry.value().params.filter.origin == *origin
            })
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
