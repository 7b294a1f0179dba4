// Timeout notification handlers

use super::types::{EvictionEvent, SessionId};

/// Receives the id of every session evicted by the sweep
///
/// Runs on Tokio's blocking pool, one event at a time and never while the
/// registry lock is held, so implementations may block or call back into the
/// registry.
pub trait TimeoutHandler: Send + Sync + 'static {
    fn on_timeout(&self, id: SessionId);

    /// Full eviction details; defaults to [`TimeoutHandler::on_timeout`]
    fn on_eviction(&self, event: &EvictionEvent) {
        self.on_timeout(event.id)
    }
}

impl<F> TimeoutHandler for F
where
    F: Fn(SessionId) + Send + Sync + 'static,
{
    fn on_timeout(&self, id: SessionId) {
        self(id)
    }
}

/// Used when no timeout callback is registered
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTimeoutHandler;

impl TimeoutHandler for NoopTimeoutHandler {
    fn on_timeout(&self, _id: SessionId) {}
}
