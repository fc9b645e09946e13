//! In-memory store, the reference implementation of the store contract.

use super::{QueueStats, Store};
use crate::error::{JobError, JobResult};
use crate::message::{MessageId, PushOptions, ReservedMessage, Status};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
enum EntryState {
    Waiting { ready_at: Instant },
    Reserved { expires_at: Instant },
}

#[derive(Debug)]
struct Entry {
    payload: String,
    ttr: u32,
    priority: u32,
    attempt: u32,
    state: EntryState,
}

#[derive(Debug, Default)]
struct Inner {
    /// Unfinished messages keyed by id; anything issued and absent is done.
    entries: BTreeMap<u64, Entry>,
    last_id: u64,
}

impl Inner {
    /// Returns expired reservations to the waiting state.
    fn reclaim_expired(&mut self, now: Instant) {
        for (id, entry) in self.entries.iter_mut() {
            if let EntryState::Reserved { expires_at } = entry.state {
                if expires_at <= now {
                    entry.attempt += 1;
                    entry.state = EntryState::Waiting { ready_at: now };
                    warn!(job_id = id, attempt = entry.attempt, "Reclaimed message after ttr expiry");
                }
            }
        }
    }

    /// Entry of `message` if that reservation is still the latest one.
    ///
    /// An expired reservation that was swept back to waiting but not handed out
    /// again still belongs to its original holder.
    fn current_mut(&mut self, message: &ReservedMessage) -> Option<&mut Entry> {
        let entry = self.entries.get_mut(&message.id.get())?;
        let current = match entry.state {
            EntryState::Reserved { .. } => entry.attempt == message.attempt,
            EntryState::Waiting { .. } => entry.attempt == message.attempt + 1,
        };
        current.then_some(entry)
    }

    /// Removes `message` if it is the current reservation.
    fn finish(&mut self, message: &ReservedMessage) -> bool {
        if self.current_mut(message).is_none() {
            return false;
        }
        self.entries.remove(&message.id.get());
        true
    }

    fn next_ready(&self, now: Instant) -> Option<u64> {
        self.entries
            .iter()
            .filter(|(_, e)| matches!(e.state, EntryState::Waiting { ready_at } if ready_at <= now))
            .min_by_key(|(id, e)| (e.priority, **id))
            .map(|(id, _)| *id)
    }

    /// Earliest instant at which something may become reservable.
    fn next_wakeup(&self) -> Option<Instant> {
        self.entries
            .values()
            .map(|e| match e.state {
                EntryState::Waiting { ready_at } => ready_at,
                EntryState::Reserved { expires_at } => expires_at,
            })
            .min()
    }
}

/// In-memory store.
///
/// Ids are monotonic from 1. Ordering is priority (lower first) then FIFO.
/// Reservations whose ttr elapses are handed out again with `attempt + 1`.
/// Cloning creates a new handle to the **same** underlying queue.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
}

impl MemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of unfinished messages.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Returns true if there are no unfinished messages.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    fn try_reserve(&self) -> Option<ReservedMessage> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.reclaim_expired(now);

        let id = inner.next_ready(now)?;
        let entry = inner.entries.get_mut(&id)?;
        entry.state = EntryState::Reserved {
            expires_at: now + Duration::from_secs(u64::from(entry.ttr)),
        };

        Some(ReservedMessage {
            id: MessageId::new(id),
            payload: entry.payload.clone(),
            ttr: entry.ttr,
            attempt: entry.attempt,
            priority: entry.priority,
        })
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn push(&self, payload: String, options: PushOptions) -> JobResult<MessageId> {
        let id = {
            let mut inner = self.inner.lock();
            inner.last_id += 1;
            let id = inner.last_id;
            inner.entries.insert(
                id,
                Entry {
                    payload,
                    ttr: options.ttr,
                    priority: options.priority,
                    attempt: 1,
                    state: EntryState::Waiting {
                        ready_at: Instant::now() + options.delay_duration(),
                    },
                },
            );
            id
        };
        self.notify.notify_one();
        Ok(MessageId::new(id))
    }

    async fn reserve(&self, timeout: Option<Duration>) -> JobResult<Option<ReservedMessage>> {
        let Some(timeout) = timeout else {
            return Ok(self.try_reserve());
        };

        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if let Some(message) = self.try_reserve() {
                return Ok(Some(message));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            let wake = self
                .inner
                .lock()
                .next_wakeup()
                .map_or(deadline, |at| at.min(deadline));
            let _ = tokio::time::timeout_at(wake, notified).await;
        }
    }

    async fn complete(&self, message: &ReservedMessage) -> JobResult<()> {
        if self.inner.lock().finish(message) {
            debug!(job_id = %message.id, "Completed message");
        } else {
            warn!(job_id = %message.id, attempt = message.attempt, "Ignored completion of a stale reservation");
        }
        Ok(())
    }

    async fn retry(&self, message: &ReservedMessage, delay: Duration) -> JobResult<MessageId> {
        {
            let mut inner = self.inner.lock();
            match inner.current_mut(message) {
                Some(entry) => {
                    entry.attempt = message.attempt + 1;
                    entry.state = EntryState::Waiting {
                        ready_at: Instant::now() + delay,
                    };
                }
                None => {
                    warn!(job_id = %message.id, attempt = message.attempt, "Ignored retry of a stale reservation");
                    return Ok(message.id);
                }
            }
        }
        self.notify.notify_one();
        debug!(job_id = %message.id, attempt = message.attempt + 1, "Scheduled message retry");
        Ok(message.id)
    }

    async fn fail(&self, message: &ReservedMessage) -> JobResult<()> {
        if self.inner.lock().finish(message) {
            debug!(job_id = %message.id, "Failed message");
        } else {
            warn!(job_id = %message.id, attempt = message.attempt, "Ignored failure of a stale reservation");
        }
        Ok(())
    }

    async fn status(&self, id: MessageId) -> JobResult<Status> {
        let inner = self.inner.lock();
        if id.get() == 0 || id.get() > inner.last_id {
            return Err(JobError::InvalidArgument(format!("Unknown message ID: {}", id)));
        }
        Ok(match inner.entries.get(&id.get()).map(|e| e.state) {
            Some(EntryState::Waiting { .. }) => Status::Waiting,
            Some(EntryState::Reserved { expires_at }) if expires_at > Instant::now() => {
                Status::Reserved
            }
            Some(EntryState::Reserved { .. }) => Status::Waiting,
            None => Status::Done,
        })
    }

    async fn clear(&self) -> JobResult<()> {
        self.inner
            .lock()
            .entries
            .retain(|_, e| matches!(e.state, EntryState::Reserved { .. }));
        Ok(())
    }

    async fn remove(&self, id: MessageId) -> JobResult<bool> {
        Ok(self.inner.lock().entries.remove(&id.get()).is_some())
    }

    async fn stats(&self) -> JobResult<QueueStats> {
        let now = Instant::now();
        let inner = self.inner.lock();
        let mut stats = QueueStats {
            total: inner.last_id,
            ..QueueStats::default()
        };
        for entry in inner.entries.values() {
            match entry.state {
                EntryState::Waiting { ready_at } if ready_at > now => stats.delayed += 1,
                EntryState::Waiting { .. } => stats.waiting += 1,
                EntryState::Reserved { .. } => stats.reserved += 1,
            }
        }
        Ok(stats)
    }
}
