//! Timer port.
//!
//! The engine never sleeps. Every suspension point (pre-dial jitter, attempt
//! and inbound-open timeouts, poll ticks, vanish expiry) is scheduled through a [`Scheduler`]
//! and comes back later as a [`Timer`] input. Fired timers carry enough
//! context (attempt generation, message id) for the engine to recognise and
//! drop stale ones.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use pairchat_shared::message::MessageId;
use pairchat_shared::types::ConnectionId;

use crate::events::ConversationKey;

/// What a fired timer asks the engine to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Timer {
    /// Periodic matchmaker tick.
    Poll,
    /// Periodic cooldown-set sweep.
    CooldownSweep,
    /// The pre-dial jitter of attempt `attempt` elapsed.
    DialAfterJitter { attempt: u64 },
    /// Attempt `attempt` stayed unconfirmed for too long.
    AttemptTimeout { attempt: u64 },
    /// An accepted inbound primary `conn` never opened.
    InboundOpenTimeout { conn: ConnectionId },
    /// A message reached its expiry.
    VanishExpiry {
        conversation: ConversationKey,
        message_id: MessageId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(pub u64);

pub trait Scheduler: Send {
    /// Wall clock as seen by this scheduler.
    fn now(&self) -> DateTime<Utc>;

    /// Fire `timer` once after `delay`.
    fn schedule(&mut self, delay: Duration, timer: Timer) -> TimerHandle;

    /// Cancel a pending timer. Unknown or already fired handles are ignored.
    fn cancel(&mut self, handle: TimerHandle);
}

pub(crate) fn to_chrono(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::weeks(52))
}

// ---------------------------------------------------------------------------
// Tokio
// ---------------------------------------------------------------------------

/// Scheduler backed by spawned `tokio::time::sleep` tasks.
///
/// Fired timers are delivered on the channel returned by [`TokioScheduler::new`].
#[derive(Debug)]
pub struct TokioScheduler {
    fired: mpsc::UnboundedSender<Timer>,
    tasks: HashMap<TimerHandle, JoinHandle<()>>,
    next: u64,
}

impl TokioScheduler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Timer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                fired: tx,
                tasks: HashMap::new(),
                next: 0,
            },
            rx,
        )
    }

    /// Number of timers not yet fired or cancelled.
    pub fn pending(&self) -> usize {
        self.tasks.values().filter(|t| !t.is_finished()).count()
    }
}

impl Scheduler for TokioScheduler {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn schedule(&mut self, delay: Duration, timer: Timer) -> TimerHandle {
        self.tasks.retain(|_, task| !task.is_finished());
        self.next += 1;
        let handle = TimerHandle(self.next);
        let tx = self.fired.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(timer);
        });
        self.tasks.insert(handle, task);
        handle
    }

    fn cancel(&mut self, handle: TimerHandle) {
        if let Some(task) = self.tasks.remove(&handle) {
            task.abort();
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Manual
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct ManualInner {
    now: DateTime<Utc>,
    next: u64,
    queue: BTreeMap<(DateTime<Utc>, TimerHandle), Timer>,
    due_at: HashMap<TimerHandle, DateTime<Utc>>,
}

/// Deterministic scheduler driven by hand.
///
/// Clones share the same clock and queue, so a test can keep one clone while
/// the engine owns another. Nothing fires on its own: the test pops due
/// timers with [`ManualScheduler::pop_due`] and feeds them to the engine.
#[derive(Debug, Clone)]
pub struct ManualScheduler {
    inner: Arc<Mutex<ManualInner>>,
}

impl ManualScheduler {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManualInner {
                now: start,
                next: 0,
                queue: BTreeMap::new(),
                due_at: HashMap::new(),
            })),
        }
    }

    fn inner(&self) -> MutexGuard<'_, ManualInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Due time of the earliest pending timer.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.inner().queue.keys().next().map(|(at, _)| *at)
    }

    /// Pop the earliest timer due at or before `until`, moving the clock to
    /// its due time.
    pub fn pop_due(&self, until: DateTime<Utc>) -> Option<Timer> {
        let mut inner = self.inner();
        let key = *inner.queue.keys().next()?;
        if key.0 > until {
            return None;
        }
        let timer = inner.queue.remove(&key)?;
        inner.due_at.remove(&key.1);
        if key.0 > inner.now {
            inner.now = key.0;
        }
        trace!(timer = ?timer, at = %key.0, "Manual timer fired");
        Some(timer)
    }

    /// Move the clock forward. Never moves backwards.
    pub fn advance_clock(&self, to: DateTime<Utc>) {
        let mut inner = self.inner();
        if to > inner.now {
            inner.now = to;
        }
    }

    /// Pending timers in due order.
    pub fn pending(&self) -> Vec<Timer> {
        self.inner().queue.values().cloned().collect()
    }
}

impl Scheduler for ManualScheduler {
    fn now(&self) -> DateTime<Utc> {
        self.inner().now
    }

    fn schedule(&mut self, delay: Duration, timer: Timer) -> TimerHandle {
        let mut inner = self.inner();
        inner.next += 1;
        let handle = TimerHandle(inner.next);
        let at = inner.now + to_chrono(delay);
        inner.queue.insert((at, handle), timer);
        inner.due_at.insert(handle, at);
        handle
    }

    fn cancel(&mut self, handle: TimerHandle) {
        let mut inner = self.inner();
        if let Some(at) = inner.due_at.remove(&handle) {
            inner.queue.remove(&(at, handle));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_timers_fire_in_due_order() {
        let t0 = Utc::now();
        let mut sched = ManualScheduler::new(t0);
        sched.schedule(Duration::from_millis(200), Timer::CooldownSweep);
        sched.schedule(Duration::from_millis(100), Timer::Poll);

        let until = t0 + chrono::Duration::milliseconds(150);
        assert_eq!(sched.pop_due(until), Some(Timer::Poll));
        assert_eq!(sched.now(), t0 + chrono::Duration::milliseconds(100));
        assert_eq!(sched.pop_due(until), None);
        assert_eq!(sched.pending(), vec![Timer::CooldownSweep]);
    }

    #[test]
    fn test_manual_cancel() {
        let t0 = Utc::now();
        let mut sched = ManualScheduler::new(t0);
        let handle = sched.schedule(Duration::from_secs(1), Timer::AttemptTimeout { attempt: 1 });
        sched.cancel(handle);
        sched.cancel(handle);
        assert!(sched.pending().is_empty());
        assert_eq!(sched.next_due(), None);
    }

    #[test]
    fn test_clock_never_moves_backwards() {
        let t0 = Utc::now();
        let sched = ManualScheduler::new(t0);
        sched.advance_clock(t0 - chrono::Duration::seconds(5));
        assert_eq!(sched.now(), t0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_scheduler_fires_and_cancels() {
        let (mut sched, mut fired) = TokioScheduler::new();
        let cancelled = sched.schedule(Duration::from_millis(50), Timer::CooldownSweep);
        sched.schedule(Duration::from_millis(100), Timer::Poll);
        sched.cancel(cancelled);

        assert_eq!(fired.recv().await, Some(Timer::Poll));
        assert!(fired.try_recv().is_err());
        assert_eq!(sched.pending(), 0);
    }
}
