//! Handler scheduler
//!
//! Wall-clock timers for the busy and idle handlers. Each armed timer is a
//! tokio task racing its own cancellation token; a [`TimerToken`] is the
//! only way to stop it. Timers never touch the session themselves: the
//! callback hands a [`TimerFire`] back to the owner, which decides whether
//! the fire is still relevant.

pub mod handlers;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Timer flavours
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Busy,
    Idle,
}

impl std::fmt::Display for TimerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimerKind::Busy => write!(f, "busy"),
            TimerKind::Idle => write!(f, "idle"),
        }
    }
}

/// Handle to one armed timer
#[derive(Debug, Clone)]
pub struct TimerToken {
    id: u64,
    kind: TimerKind,
    cancel: CancellationToken,
}

impl TimerToken {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> TimerKind {
        self.kind
    }

    /// True once the timer was disarmed
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl PartialEq for TimerToken {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TimerToken {}

/// Delivered to the callback each time a timer fires
#[derive(Debug, Clone)]
pub struct TimerFire {
    pub token: TimerToken,
    pub kind: TimerKind,
    /// 1 for the first fire, incremented on every repeat
    pub fire_count: u32,
    /// Time since the timer was armed
    pub elapsed: Duration,
}

#[derive(Default)]
struct SchedulerInner {
    next_id: AtomicU64,
    active: Mutex<HashMap<u64, CancellationToken>>,
}

impl SchedulerInner {
    fn remove(&self, id: u64) -> Option<CancellationToken> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&id)
    }
}

/// Owns every armed timer. Cheap to clone; clones share the same timers.
#[derive(Clone, Default)]
pub struct HandlerScheduler {
    inner: Arc<SchedulerInner>,
}

impl HandlerScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a timer that fires after `delay`, then every `repeat` if given.
    ///
    /// Must be called inside a tokio runtime.
    pub fn arm<F>(
        &self,
        kind: TimerKind,
        delay: Duration,
        repeat: Option<Duration>,
        callback: F,
    ) -> TimerToken
    where
        F: Fn(TimerFire) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        let token = TimerToken {
            id,
            kind,
            cancel: cancel.clone(),
        };

        self.inner
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id, cancel.clone());

        let inner = Arc::clone(&self.inner);
        let fire_token = token.clone();
        let repeat = repeat.filter(|r| !r.is_zero());
        tokio::spawn(async move {
            let armed_at = Instant::now();
            let mut deadline = armed_at + delay;
            let mut fire_count = 0u32;
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep_until(deadline) => {}
                }
                if cancel.is_cancelled() {
                    break;
                }
                fire_count += 1;
                callback(TimerFire {
                    token: fire_token.clone(),
                    kind,
                    fire_count,
                    elapsed: armed_at.elapsed(),
                });
                match repeat {
                    Some(every) => deadline += every,
                    None => break,
                }
            }
            inner.remove(id);
        });

        tracing::trace!(target: "deckrun::scheduler", id, %kind, ?delay, ?repeat, "timer armed");
        token
    }

    /// Stop a timer. Returns true if it was still active; calling again is a no-op.
    pub fn disarm(&self, token: &TimerToken) -> bool {
        token.cancel.cancel();
        let was_active = self.inner.remove(token.id).is_some();
        if was_active {
            tracing::trace!(target: "deckrun::scheduler", id = token.id, kind = %token.kind, "timer disarmed");
        }
        was_active
    }

    /// Number of timers still pending
    pub fn active_count(&self) -> usize {
        self.inner
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Stop every timer
    pub fn disarm_all(&self) -> usize {
        let drained: Vec<CancellationToken> = self
            .inner
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain()
            .map(|(_, cancel)| cancel)
            .collect();
        for cancel in &drained {
            cancel.cancel();
        }
        drained.len()
    }
}

impl std::fmt::Debug for HandlerScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerScheduler")
            .field("active", &self.active_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn counter() -> (Arc<AtomicU32>, impl Fn(TimerFire) + Send + Sync + 'static) {
        let count = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&count);
        (count, move |_fire: TimerFire| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_after_delay() {
        let scheduler = HandlerScheduler::new();
        let (count, callback) = counter();
        scheduler.arm(TimerKind::Busy, Duration::from_millis(500), None, callback);
        assert_eq!(scheduler.active_count(), 1);

        tokio::time::sleep(Duration::from_millis(499)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeats_until_disarmed() {
        let scheduler = HandlerScheduler::new();
        let fires = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&fires);
        let token = scheduler.arm(
            TimerKind::Busy,
            Duration::from_millis(100),
            Some(Duration::from_millis(50)),
            move |fire| sink.lock().unwrap().push((fire.fire_count, fire.elapsed)),
        );

        tokio::time::sleep(Duration::from_millis(260)).await;
        assert!(scheduler.disarm(&token));
        tokio::time::sleep(Duration::from_millis(500)).await;

        let fires = fires.lock().unwrap();
        assert_eq!(fires.len(), 4);
        assert_eq!(fires[0].0, 1);
        assert_eq!(fires[3].0, 4);
        assert_eq!(fires[3].1, Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarm_before_delay_prevents_fire() {
        let scheduler = HandlerScheduler::new();
        let (count, callback) = counter();
        let token = scheduler.arm(TimerKind::Idle, Duration::from_millis(300), None, callback);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(scheduler.disarm(&token));
        assert!(!scheduler.disarm(&token));
        assert!(token.is_cancelled());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarm_all() {
        let scheduler = HandlerScheduler::new();
        let (count, callback) = counter();
        let callback = Arc::new(callback);
        for _ in 0..3 {
            let cb = Arc::clone(&callback);
            scheduler.arm(TimerKind::Busy, Duration::from_millis(10), None, move |f| (*cb)(f));
        }
        assert_eq!(scheduler.disarm_all(), 3);
        assert_eq!(scheduler.active_count(), 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
