//! # TimerWheel: delayed callbacks with cancellation.
//!
//! A single dispatch task consumes a min-heap of `(deadline, id)` entries and
//! fires the associated callbacks when their deadline passes.
//!
//! ## Architecture
//! ```text
//! schedule(delay, cb) ─► command channel ─► dispatch task
//!                                             ├─ heap: (deadline, id)
//!                                             ├─ pending: id → callback
//!                                             └─ sleep_until(next) → fire
//! cancel(id) ────────────► command channel ──► remove from pending
//! ```
//!
//! ## Rules
//! - Ids are allocated from a monotonic counter and never reused, so a late
//!   `cancel` for an already-fired timer is a harmless no-op (this replaces
//!   the shared-pointer lifetime juggling a raw timer-id scheme would need).
//! - Callbacks run serially on the dispatch task. CPU work only; anything
//!   blocking must be handed to a worker (`tokio::spawn`).

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::RuntimeError;

/// Opaque handle identifying one scheduled callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

type Callback = Box<dyn FnOnce() + Send + 'static>;

enum Command {
    Schedule {
        at: Instant,
        id: u64,
        callback: Callback,
    },
    Cancel(u64),
}

/// Schedules delayed callbacks on a dedicated dispatch task.
pub struct TimerWheel {
    tx: mpsc::UnboundedSender<Command>,
    next_id: AtomicU64,
    closed: AtomicBool,
    token: CancellationToken,
}

impl TimerWheel {
    /// Creates the wheel and spawns its dispatch task.
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let wheel = Arc::new(Self {
            tx,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            token: token.clone(),
        });
        tokio::spawn(dispatch(rx, token));
        wheel
    }

    /// Schedules `callback` to run after `delay`.
    ///
    /// Returns the id to pass to [`TimerWheel::cancel`], or
    /// [`RuntimeError::ShuttingDown`] once teardown has begun.
    pub fn schedule(
        &self,
        delay: Duration,
        callback: impl FnOnce() + Send + 'static,
    ) -> Result<TimerId, RuntimeError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RuntimeError::ShuttingDown);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cmd = Command::Schedule {
            at: Instant::now() + delay,
            id,
            callback: Box::new(callback),
        };
        self.tx
            .send(cmd)
            .map_err(|_| RuntimeError::ShuttingDown)?;
        Ok(TimerId(id))
    }

    /// Cancels a pending timer. No-op if it already fired or never existed.
    pub fn cancel(&self, id: TimerId) {
        let _ = self.tx.send(Command::Cancel(id.0));
    }

    /// Stops accepting new timers and tears down the dispatch task.
    ///
    /// Pending callbacks that have not reached their deadline are dropped.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.token.cancel();
    }
}

async fn dispatch(mut rx: mpsc::UnboundedReceiver<Command>, token: CancellationToken) {
    let mut heap: BinaryHeap<Reverse<(Instant, u64)>> = BinaryHeap::new();
    let mut pending: HashMap<u64, Callback> = HashMap::new();

    loop {
        // Fire everything that is due; compute the next deadline.
        let now = Instant::now();
        while let Some(Reverse((at, id))) = heap.peek().copied() {
            if at > now {
                break;
            }
            heap.pop();
            if let Some(cb) = pending.remove(&id) {
                cb();
            }
        }
        let next = heap.peek().map(|Reverse((at, _))| *at);

        tokio::select! {
            _ = token.cancelled() => break,
            cmd = rx.recv() => match cmd {
                Some(Command::Schedule { at, id, callback }) => {
                    pending.insert(id, callback);
                    heap.push(Reverse((at, id)));
                }
                Some(Command::Cancel(id)) => {
                    pending.remove(&id);
                }
                None => break,
            },
            _ = async {
                match next {
                    Some(at) => sleep_until(at).await,
                    // Nothing pending: park until a command arrives.
                    None => std::future::pending::<()>().await,
                }
            } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn fires_after_delay() {
        let wheel = TimerWheel::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        wheel
            .schedule(Duration::from_millis(20), move || {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_prevents_firing() {
        let wheel = TimerWheel::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let id = wheel
            .schedule(Duration::from_millis(50), move || {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        wheel.cancel(id);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fires_in_deadline_order() {
        let wheel = TimerWheel::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for (delay_ms, tag) in [(60u64, "b"), (20, "a"), (100, "c")] {
            let o = order.clone();
            wheel
                .schedule(Duration::from_millis(delay_ms), move || {
                    o.lock().unwrap().push(tag);
                })
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn schedule_after_shutdown_fails() {
        let wheel = TimerWheel::new();
        wheel.shutdown();
        let err = wheel.schedule(Duration::from_millis(1), || {}).unwrap_err();
        assert!(matches!(err, RuntimeError::ShuttingDown));
    }
}
