//! Randomized, gateable heartbeat.
//!
//! The gossip loop must not fire when there is nothing worth gossiping — a
//! stream of empty rounds wastes bandwidth and pollutes the DAG with empty
//! self-events. So instead of a free-running interval, the timer is armed and
//! disarmed explicitly: `reset` schedules one tick, the tick disarms it, and
//! `stop` cancels a pending tick.
//!
//! All timer state lives inside its own task and is mutated only by the
//! command channels, so no external locking is involved. The `set` flag is
//! mirrored into an atomic for the dispatcher's opportunistic "reset if not
//! armed" check; that read races the timer task, and a stale view costs at
//! most one extra tick.
//!
//! Each armed interval is the configured heartbeat jittered by ±50%, which
//! keeps a cohort of validators started together from synchronizing into
//! gossip storms.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Sleep};
use tracing::trace;

/// Command-channel capacity. Commands are tiny and the sender never needs
/// more than a couple in flight.
const COMMAND_CAPACITY: usize = 8;

/// The heartbeat timer. See the module docs for the arming contract.
pub struct ControlTimer {
    reset_tx: mpsc::Sender<()>,
    stop_tx: mpsc::Sender<()>,
    shutdown_tx: mpsc::Sender<()>,
    set: Arc<AtomicBool>,
    tick_rx: Mutex<Option<mpsc::Receiver<()>>>,
    task: Mutex<Option<TimerTask>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// The receiving halves moved into the timer task on start.
struct TimerTask {
    base: Duration,
    reset_rx: mpsc::Receiver<()>,
    stop_rx: mpsc::Receiver<()>,
    shutdown_rx: mpsc::Receiver<()>,
    tick_tx: mpsc::Sender<()>,
    set: Arc<AtomicBool>,
}

impl ControlTimer {
    /// Creates a timer with the given base heartbeat. Nothing runs until
    /// [`start`](Self::start).
    pub fn new(base: Duration) -> Self {
        let (reset_tx, reset_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (stop_tx, stop_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (tick_tx, tick_rx) = mpsc::channel(1);
        let set = Arc::new(AtomicBool::new(false));
        Self {
            reset_tx,
            stop_tx,
            shutdown_tx,
            set: Arc::clone(&set),
            tick_rx: Mutex::new(Some(tick_rx)),
            task: Mutex::new(Some(TimerTask {
                base,
                reset_rx,
                stop_rx,
                shutdown_rx,
                tick_tx,
                set,
            })),
            handle: Mutex::new(None),
        }
    }

    /// Takes the tick output. Single consumer; subsequent calls return a
    /// closed channel.
    pub fn take_ticks(&self) -> mpsc::Receiver<()> {
        self.tick_rx.lock().take().unwrap_or_else(|| mpsc::channel(1).1)
    }

    /// Spawns the timer task. The timer starts **armed**, so a freshly
    /// started node runs its bootstrap gossip round without waiting for an
    /// external reset. Idempotent.
    pub fn start(&self) {
        if let Some(task) = self.task.lock().take() {
            *self.handle.lock() = Some(tokio::spawn(task.run()));
        }
    }

    /// Whether a tick is pending. Racy when read outside the timer task;
    /// callers use it only for the opportunistic reset.
    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    /// Arms the timer. A no-op once the timer has shut down.
    pub async fn reset(&self) {
        let _ = self.reset_tx.send(()).await;
    }

    /// Disarms the timer, cancelling a pending tick.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(()).await;
    }

    /// Terminates the timer task and waits for it to exit. Idempotent.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl TimerTask {
    async fn run(mut self) {
        // Armed on start; see ControlTimer::start.
        self.set.store(true, Ordering::Release);
        let mut deadline: Option<Pin<Box<Sleep>>> = Some(Box::pin(sleep(jittered(self.base))));

        loop {
            tokio::select! {
                _ = wait_armed(&mut deadline) => {
                    trace!("heartbeat tick");
                    // The consumer holds a capacity-1 channel: if it has not
                    // drained the previous tick yet, this one is redundant
                    // anyway and is dropped.
                    let _ = self.tick_tx.try_send(());
                    self.set.store(false, Ordering::Release);
                    deadline = None;
                }
                Some(()) = self.reset_rx.recv() => {
                    self.set.store(true, Ordering::Release);
                    deadline = Some(Box::pin(sleep(jittered(self.base))));
                }
                Some(()) = self.stop_rx.recv() => {
                    self.set.store(false, Ordering::Release);
                    deadline = None;
                }
                _ = self.shutdown_rx.recv() => {
                    self.set.store(false, Ordering::Release);
                    return;
                }
            }
        }
    }
}

/// Resolves when the armed deadline fires; pends forever while disarmed.
async fn wait_armed(deadline: &mut Option<Pin<Box<Sleep>>>) {
    match deadline {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

/// The base interval jittered by ±50%.
fn jittered(base: Duration) -> Duration {
    let base_ms = base.as_millis().max(1) as u64;
    let jitter = rand::thread_rng().gen_range(0..=base_ms);
    Duration::from_millis(base_ms / 2 + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    const TICK: Duration = Duration::from_millis(20);
    const PATIENCE: Duration = Duration::from_millis(500);

    #[tokio::test]
    async fn starts_armed_and_ticks_once() {
        let timer = ControlTimer::new(TICK);
        let mut ticks = timer.take_ticks();
        timer.start();

        timeout(PATIENCE, ticks.recv()).await.unwrap().unwrap();
        // The flag clears right after the tick is emitted.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!timer.is_set());

        // No second tick without a reset.
        assert!(timeout(Duration::from_millis(100), ticks.recv())
            .await
            .is_err());
        timer.shutdown().await;
    }

    #[tokio::test]
    async fn reset_rearms_after_a_tick() {
        let timer = ControlTimer::new(TICK);
        let mut ticks = timer.take_ticks();
        timer.start();

        timeout(PATIENCE, ticks.recv()).await.unwrap().unwrap();
        timer.reset().await;
        timeout(PATIENCE, ticks.recv()).await.unwrap().unwrap();
        timer.shutdown().await;
    }

    #[tokio::test]
    async fn stop_cancels_a_pending_tick() {
        // Long base so the stop lands well before the deadline.
        let timer = ControlTimer::new(Duration::from_secs(5));
        let mut ticks = timer.take_ticks();
        timer.start();

        timer.stop().await;
        // Give the command time to land, then confirm disarmed and silent.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!timer.is_set());
        assert!(timeout(Duration::from_millis(100), ticks.recv())
            .await
            .is_err());
        timer.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_terminates_and_is_idempotent() {
        let timer = ControlTimer::new(TICK);
        let _ticks = timer.take_ticks();
        timer.start();
        timer.shutdown().await;
        timer.shutdown().await;
        assert!(!timer.is_set());
        // Commands after shutdown are harmless no-ops.
        timer.reset().await;
        timer.stop().await;
    }

    #[test]
    fn jitter_stays_within_half_to_three_halves() {
        let base = Duration::from_millis(100);
        for _ in 0..200 {
            let d = jittered(base);
            assert!(d >= Duration::from_millis(50));
            assert!(d <= Duration::from_millis(150));
        }
    }
}
