// Session types and data structures

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Registry-allocated session identifier
///
/// Ids start at 1; 0 is never handed out, so a cookie carrying `0` is always
/// treated as "no session".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionId(u64);

impl SessionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// Parse a cookie value into an id
    /// Anything other than a plain non-zero decimal number is rejected
    pub fn from_cookie_value(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }

        match value.parse::<u64>() {
            Ok(0) | Err(_) => None,
            Ok(raw) => Some(Self(raw)),
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<SessionId> for u64 {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

/// Longest lifetime a record can be given
/// Larger TTLs are clamped so a deadline always fits in an `Instant`
pub const MAX_TTL: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

/// A live session tracked by the registry
#[derive(Debug, Clone)]
pub(crate) struct SessionRecord {
    pub id: SessionId,
    /// Eviction becomes due once `now >= deadline`
    pub deadline: Instant,
}

impl SessionRecord {
    pub(crate) fn new(id: SessionId, now: Instant, ttl: Duration) -> Self {
        Self {
            id,
            deadline: deadline_after(now, ttl),
        }
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    pub(crate) fn renew(&mut self, now: Instant, ttl: Duration) {
        self.deadline = deadline_after(now, ttl);
    }
}

fn deadline_after(now: Instant, ttl: Duration) -> Instant {
    now + ttl.min(MAX_TTL)
}

/// Result of an atomic renew-or-create
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLease {
    pub id: SessionId,
    /// True when a new record was allocated
    pub created: bool,
    pub deadline: Instant,
}

/// Emitted once for every record removed by the sweep
#[derive(Debug, Clone)]
pub struct EvictionEvent {
    pub id: SessionId,
    pub deadline: Instant,
    pub evicted_at: DateTime<Utc>,
}

/// Registry statistics for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub live: usize,
    pub created_total: u64,
    pub renewed_total: u64,
    pub evicted_total: u64,
}
