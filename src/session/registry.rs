// Expiring session registry
// One mutex guards the whole record map so exists-then-act sequences are atomic

use super::types::{EvictionEvent, RegistryStats, SessionId, SessionLease, SessionRecord};
use crate::error::SessionError;
use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug)]
struct RegistryInner {
    records: HashMap<SessionId, SessionRecord>,
    next_id: u64,
    created_total: u64,
    renewed_total: u64,
    evicted_total: u64,
}

impl RegistryInner {
    fn new() -> Self {
        Self {
            records: HashMap::new(),
            next_id: 1,
            created_total: 0,
            renewed_total: 0,
            evicted_total: 0,
        }
    }

    fn is_live(&self, id: SessionId, now: Instant) -> bool {
        self.records
            .get(&id)
            .is_some_and(|record| !record.is_expired(now))
    }

    fn renew(&mut self, id: SessionId, ttl: Duration, now: Instant) -> Result<Instant, SessionError> {
        match self.records.get_mut(&id) {
            // A record past its deadline is only waiting for the sweep
            Some(record) if !record.is_expired(now) => {
                record.renew(now, ttl);
                self.renewed_total += 1;
                Ok(record.deadline)
            }
            _ => Err(SessionError::NotFound(id)),
        }
    }

    fn add(&mut self, ttl: Duration, now: Instant) -> SessionLease {
        let id = self.allocate_id();
        let record = SessionRecord::new(id, now, ttl);
        let deadline = record.deadline;
        self.records.insert(id, record);
        self.created_total += 1;

        SessionLease {
            id,
            created: true,
            deadline,
        }
    }

    /// Monotonic allocation; after wrap-around, skips ids that are still held
    fn allocate_id(&mut self) -> SessionId {
        loop {
            let candidate = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if candidate == 0 {
                continue;
            }

            let id = SessionId::new(candidate);
            if !self.records.contains_key(&id) {
                return id;
            }
        }
    }

    fn renew_or_create(
        &mut self,
        candidate: Option<SessionId>,
        ttl: Duration,
        now: Instant,
    ) -> SessionLease {
        if let Some(id) = candidate
            && let Ok(deadline) = self.renew(id, ttl, now)
        {
            return SessionLease {
                id,
                created: false,
                deadline,
            };
        }

        self.add(ttl, now)
    }

    fn drain_expired(&mut self, now: Instant) -> Vec<SessionRecord> {
        let expired: Vec<SessionId> = self
            .records
            .values()
            .filter(|record| record.is_expired(now))
            .map(|record| record.id)
            .collect();

        let removed: Vec<SessionRecord> = expired
            .iter()
            .filter_map(|id| self.records.remove(id))
            .collect();

        self.evicted_total += removed.len() as u64;
        removed
    }
}

/// Concurrent map from session ids to renewable deadlines
///
/// Share it behind an `Arc`; the background sweep is started separately with
/// [`ExpiryRegistry::start_sweep`](crate::session::ExpiryRegistry::start_sweep).
#[derive(Debug)]
pub struct ExpiryRegistry {
    inner: Mutex<RegistryInner>,
}

impl ExpiryRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner::new()),
        }
    }

    /// True iff a live record exists for the id
    pub async fn exists(&self, id: SessionId) -> bool {
        self.inner.lock().await.is_live(id, Instant::now())
    }

    /// Push a live record's deadline out to `now + ttl`
    pub async fn renew(&self, id: SessionId, ttl: Duration) -> Result<(), SessionError> {
        self.inner
            .lock()
            .await
            .renew(id, ttl, Instant::now())
            .map(|_| ())
    }

    /// Allocate a new record and return its id
    pub async fn add(&self, ttl: Duration) -> SessionId {
        self.inner.lock().await.add(ttl, Instant::now()).id
    }

    /// Renew `candidate` if it is live, otherwise allocate a new record
    pub async fn renew_or_create(&self, candidate: Option<SessionId>, ttl: Duration) -> SessionLease {
        let lease = self
            .inner
            .lock()
            .await
            .renew_or_create(candidate, ttl, Instant::now());

        if lease.created {
            debug!("Created session {}", lease.id);
        } else {
            debug!("Renewed session {}", lease.id);
        }

        lease
    }

    /// Enter the registry's critical section
    /// The section ends when the returned guard is dropped or unlocked
    pub async fn lock(&self) -> RegistryGuard<'_> {
        RegistryGuard {
            inner: self.inner.lock().await,
        }
    }

    /// Current deadline of a live record
    pub async fn deadline(&self, id: SessionId) -> Option<Instant> {
        let now = Instant::now();
        self.inner
            .lock()
            .await
            .records
            .get(&id)
            .filter(|record| !record.is_expired(now))
            .map(|record| record.deadline)
    }

    /// Number of records not yet evicted
    pub async fn len(&self) -> usize {
        self.inner.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> RegistryStats {
        let inner = self.inner.lock().await;
        RegistryStats {
            live: inner.records.len(),
            created_total: inner.created_total,
            renewed_total: inner.renewed_total,
            evicted_total: inner.evicted_total,
        }
    }

    /// Remove every record whose deadline has passed
    /// The lock is released before the events are returned to the caller
    pub(crate) async fn evict_expired(&self, now: Instant) -> Vec<EvictionEvent> {
        let removed = {
            let mut inner = self.inner.lock().await;
            inner.drain_expired(now)
        };

        let evicted_at = Utc::now();
        removed
            .into_iter()
            .map(|record| EvictionEvent {
                id: record.id,
                deadline: record.deadline,
                evicted_at,
            })
            .collect()
    }
}

impl Default for ExpiryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive access to the registry for multi-step decisions
pub struct RegistryGuard<'a> {
    inner: MutexGuard<'a, RegistryInner>,
}

impl RegistryGuard<'_> {
    pub fn exists(&self, id: SessionId) -> bool {
        self.inner.is_live(id, Instant::now())
    }

    pub fn renew(&mut self, id: SessionId, ttl: Duration) -> Result<(), SessionError> {
        self.inner.renew(id, ttl, Instant::now()).map(|_| ())
    }

    pub fn add(&mut self, ttl: Duration) -> SessionId {
        self.inner.add(ttl, Instant::now()).id
    }

    pub fn renew_or_create(&mut self, candidate: Option<SessionId>, ttl: Duration) -> SessionLease {
        self.inner.renew_or_create(candidate, ttl, Instant::now())
    }

    pub fn unlock(self) {}
}
