// Background sweep and timeout dispatch
// The sweep evicts under the registry lock; the dispatcher notifies outside it

use super::registry::ExpiryRegistry;
use super::timeout::TimeoutHandler;
use super::types::EvictionEvent;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{self, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

impl ExpiryRegistry {
    /// Start the periodic sweep
    ///
    /// Every `period` the sweep removes records whose deadline has passed and
    /// queues one [`EvictionEvent`] per record. A separate task drains the queue
    /// and calls `handler`, so a slow or panicking handler never holds up
    /// eviction. Must be called from within a Tokio runtime.
    pub fn start_sweep<H>(self: &Arc<Self>, period: Duration, handler: H) -> SweepHandle
    where
        H: TimeoutHandler,
    {
        info!("Starting session sweep (interval: {:?})", period);

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::unbounded_channel::<EvictionEvent>();

        let registry = Arc::clone(self);
        let sweep = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {}
                }

                let events = registry.evict_expired(Instant::now()).await;
                if events.is_empty() {
                    continue;
                }

                debug!("Evicted {} expired sessions", events.len());
                for event in events {
                    if events_tx.send(event).is_err() {
                        warn!("Timeout dispatcher is gone; stopping sweep");
                        return;
                    }
                }
            }
        });

        let handler: Arc<dyn TimeoutHandler> = Arc::new(handler);
        let dispatcher = tokio::spawn(dispatch_events(events_rx, handler));

        SweepHandle {
            shutdown: shutdown_tx,
            sweep: Some(sweep),
            dispatcher: Some(dispatcher),
        }
    }
}

async fn dispatch_events(
    mut events: mpsc::UnboundedReceiver<EvictionEvent>,
    handler: Arc<dyn TimeoutHandler>,
) {
    while let Some(event) = events.recv().await {
        let id = event.id;
        debug!("Session {} timed out", id);

        // Awaiting keeps delivery ordered while the handler runs off the runtime
        let handler = Arc::clone(&handler);
        match task::spawn_blocking(move || handler.on_eviction(&event)).await {
            Ok(()) => {}
            Err(e) if e.is_panic() => error!(
                "Timeout handler panicked for session {}: {}",
                id,
                panic_message(e.into_panic().as_ref())
            ),
            Err(e) => warn!("Timeout handler for session {} did not run: {}", id, e),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "<non-string panic payload>"
    }
}

/// Owner of a running sweep
///
/// Call [`SweepHandle::stop`] for an orderly shutdown. Dropping a running
/// handle aborts the sweep and any undelivered notifications.
#[derive(Debug)]
pub struct SweepHandle {
    shutdown: watch::Sender<bool>,
    sweep: Option<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
}

impl SweepHandle {
    pub fn is_running(&self) -> bool {
        self.sweep.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop the timer and wait for already-evicted sessions to be reported
    /// No timeout callback fires once this returns
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);

        if let Some(sweep) = self.sweep.take()
            && let Err(e) = sweep.await
        {
            warn!("Session sweep task ended abnormally: {}", e);
        }

        // The sweep owned the only event sender, so the dispatcher drains and exits
        if let Some(dispatcher) = self.dispatcher.take()
            && let Err(e) = dispatcher.await
        {
            warn!("Timeout dispatcher ended abnormally: {}", e);
        }

        info!("Session sweep stopped");
    }
}

impl Drop for SweepHandle {
    fn drop(&mut self) {
        if let Some(sweep) = self.sweep.take() {
            sweep.abort();
        }
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::timeout::NoopTimeoutHandler;
    use crate::session::types::SessionId;
    use chrono::Utc;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc::UnboundedReceiver;

    const TICK: Duration = Duration::from_millis(100);

    fn channel_handler() -> (
        impl Fn(SessionId) + Send + Sync + 'static,
        UnboundedReceiver<(SessionId, Instant)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = move |id: SessionId| {
            let _ = tx.send((id, Instant::now()));
        };
        (handler, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_reports_true_id_once() {
        let registry = Arc::new(ExpiryRegistry::new());
        let (handler, mut timeouts) = channel_handler();
        let sweep = registry.start_sweep(TICK, handler);

        let _first = registry.add(Duration::from_secs(60)).await;
        let second = registry.add(Duration::from_secs(2)).await;

        tokio::time::sleep(Duration::from_secs(5)).await;

        let (id, _) = timeouts.recv().await.unwrap();
        assert_eq!(id, second);
        assert!(timeouts.try_recv().is_err());
        assert!(!registry.exists(second).await);

        sweep.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_defers_eviction() {
        let registry = Arc::new(ExpiryRegistry::new());
        let (handler, mut timeouts) = channel_handler();
        let sweep = registry.start_sweep(TICK, handler);

        let ttl = Duration::from_secs(2);
        let id = registry.add(ttl).await;

        tokio::time::sleep(Duration::from_secs(1)).await;
        registry.renew(id, ttl).await.unwrap();
        let renewed_at = Instant::now();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(timeouts.try_recv().is_err());
        assert!(registry.exists(id).await);

        let (reported, fired_at) = timeouts.recv().await.unwrap();
        assert_eq!(reported, id);
        assert!(fired_at >= renewed_at + ttl);
        assert!(!registry.exists(id).await);

        sweep.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_handler_does_not_stop_sweep() {
        let registry = Arc::new(ExpiryRegistry::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let poisoned = SessionId::new(1);
        let recorder = Arc::clone(&seen);
        let sweep = registry.start_sweep(TICK, move |id: SessionId| {
            if id == poisoned {
                panic!("handler failure");
            }
            recorder.lock().unwrap().push(id);
        });

        let first = registry.add(Duration::from_secs(1)).await;
        let second = registry.add(Duration::from_secs(2)).await;
        assert_eq!(first, poisoned);

        tokio::time::sleep(Duration::from_secs(3)).await;
        sweep.stop().await;

        assert_eq!(*seen.lock().unwrap(), vec![second]);
        assert!(registry.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_further_eviction() {
        let registry = Arc::new(ExpiryRegistry::new());
        let (handler, mut timeouts) = channel_handler();
        let sweep = registry.start_sweep(TICK, handler);
        assert!(sweep.is_running());

        sweep.stop().await;

        let id = registry.add(Duration::from_secs(1)).await;
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(timeouts.recv().await.is_none());
        // Still stored, but no longer live
        assert_eq!(registry.len().await, 1);
        assert!(!registry.exists(id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_delivers_pending_events() {
        let registry = Arc::new(ExpiryRegistry::new());
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let sweep = registry.start_sweep(TICK, move |_id: SessionId| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..10 {
            registry.add(Duration::from_millis(500)).await;
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
        sweep.stop().await;

        assert_eq!(count.load(Ordering::SeqCst), 10);
        assert_eq!(registry.stats().await.evicted_total, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_noop_handler() {
        let registry = Arc::new(ExpiryRegistry::new());
        let sweep = registry.start_sweep(TICK, NoopTimeoutHandler);

        registry.add(Duration::from_millis(200)).await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(registry.is_empty().await);
        sweep.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_handler_does_not_stall_eviction() {
        let registry = Arc::new(ExpiryRegistry::new());
        let notified = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&notified);
        let sweep = registry.start_sweep(Duration::from_millis(10), move |_id: SessionId| {
            std::thread::sleep(Duration::from_millis(300));
            counter.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..5 {
            registry.add(Duration::from_millis(50)).await;
        }

        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(registry.is_empty().await);
        assert!(notified.load(Ordering::SeqCst) < 5);

        drop(sweep);
    }

    #[tokio::test]
    async fn test_blocking_handler_does_not_block_runtime() {
        let registry = Arc::new(ExpiryRegistry::new());
        let sweep = registry.start_sweep(Duration::from_millis(10), |_id: SessionId| {
            std::thread::sleep(Duration::from_millis(300));
        });

        for _ in 0..3 {
            registry.add(Duration::from_millis(20)).await;
        }

        tokio::time::sleep(Duration::from_millis(60)).await;

        let started = std::time::Instant::now();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(started.elapsed() < Duration::from_millis(250));
        assert!(registry.is_empty().await);

        drop(sweep);
    }

    struct EventRecorder(mpsc::UnboundedSender<EvictionEvent>);

    impl TimeoutHandler for EventRecorder {
        fn on_timeout(&self, _id: SessionId) {
            panic!("on_eviction is overridden");
        }

        fn on_eviction(&self, event: &EvictionEvent) {
            let _ = self.0.send(event.clone());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_receives_eviction_details() {
        let registry = Arc::new(ExpiryRegistry::new());
        let (tx, mut events) = mpsc::unbounded_channel();
        let before = Utc::now();
        let sweep = registry.start_sweep(TICK, EventRecorder(tx));

        let id = registry.add(Duration::from_secs(1)).await;
        let deadline = registry.deadline(id).await.unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.id, id);
        assert_eq!(event.deadline, deadline);
        assert!(event.deadline <= Instant::now());
        assert!(event.evicted_at >= before);

        sweep.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sweep_races_renewals_without_double_reporting() {
        let registry = Arc::new(ExpiryRegistry::new());
        let reported = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&reported);
        let sweep = registry.start_sweep(Duration::from_millis(2), move |id: SessionId| {
            recorder.lock().unwrap().push(id);
        });

        let ttl = Duration::from_millis(5);
        let mut clients = tokio::task::JoinSet::new();
        for client in 0..8u64 {
            let registry = Arc::clone(&registry);
            clients.spawn(async move {
                let until = std::time::Instant::now() + Duration::from_millis(200);
                let mut current = None;
                let mut step = 0u64;
                while std::time::Instant::now() < until {
                    step += 1;
                    if step % 7 == 0 {
                        current = None;
                    }
                    current = Some(registry.renew_or_create(current, ttl).await.id);
                    let pause = (client + step) % 4;
                    tokio::time::sleep(Duration::from_millis(pause)).await;
                }
            });
        }
        while let Some(result) = clients.join_next().await {
            result.unwrap();
        }

        // Let every remaining record lapse and be reported
        tokio::time::sleep(Duration::from_millis(50)).await;
        sweep.stop().await;

        let reported = reported.lock().unwrap().clone();
        let unique: HashSet<_> = reported.iter().copied().collect();
        assert_eq!(unique.len(), reported.len());
        for id in &reported {
            assert!(!registry.exists(*id).await);
        }
        assert_eq!(
            reported.len() as u64,
            registry.stats().await.evicted_total
        );
        assert!(registry.is_empty().await);
    }
}
