use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const PENDING: u8 = 2;
const STOPPED: u8 = 3;

type Task = Box<dyn Fn() + Send + Sync>;

/// Runs a task so that no two invocations ever overlap.
///
/// Any number of threads may call [`run_or_schedule`](Self::run_or_schedule).
/// Exactly one of them runs the task; a request that arrives while the task
/// is running is remembered, and the running caller loops once more before
/// returning. The task therefore observes every state change that happened
/// before a request was made, without holding a lock while it runs.
///
/// Once [`stop`](Self::stop) is called the task never starts again.
pub struct SequentialScheduler {
    state: AtomicU8,
    task: Task,
}

impl fmt::Debug for SequentialScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state.load(Ordering::Relaxed) {
            IDLE => "idle",
            RUNNING => "running",
            PENDING => "pending",
            _ => "stopped",
        };
        f.debug_struct("SequentialScheduler")
            .field("state", &state)
            .finish()
    }
}

impl SequentialScheduler {
    /// Create a scheduler for `task`.
    pub fn new<F>(task: F) -> Arc<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        Arc::new(Self {
            state: AtomicU8::new(IDLE),
            task: Box::new(task),
        })
    }

    /// Run the task on the calling thread, or mark it for another pass if
    /// some other caller is already running it.
    pub fn run_or_schedule(&self) {
        if self.claim() {
            self.drain();
        }
    }

    /// Like [`run_or_schedule`](Self::run_or_schedule), but the run happens on
    /// a task spawned onto `handle` instead of the calling thread.
    pub fn run_or_schedule_on(self: &Arc<Self>, handle: &tokio::runtime::Handle) {
        if self.claim() {
            let this = Arc::clone(self);
            handle.spawn(async move { this.drain() });
        }
    }

    /// Permanently stop the scheduler. Idempotent.
    pub fn stop(&self) {
        self.state.store(STOPPED, Ordering::Release);
    }

    /// Whether [`stop`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.state.load(Ordering::Acquire) == STOPPED
    }

    /// Returns `true` if the caller won the right to run the task.
    fn claim(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let next = match current {
                IDLE => RUNNING,
                RUNNING => PENDING,
                _ => return false,
            };

            match self
                .state
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return next == RUNNING,
                Err(actual) => current = actual,
            }
        }
    }

    fn drain(&self) {
        loop {
            (self.task)();

            match self
                .state
                .compare_exchange(RUNNING, IDLE, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(PENDING) => {
                    if self
                        .state
                        .compare_exchange(PENDING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        return;
                    }
                }
                Err(_) => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::{Arc, Weak};

    use super::*;

    #[test]
    fn runs_once_when_idle() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let scheduler = SequentialScheduler::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        scheduler.run_or_schedule();
        scheduler.run_or_schedule();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn request_during_run_triggers_another_pass() {
        let runs = Arc::new(AtomicUsize::new(0));
        let scheduler = Arc::new_cyclic(|weak: &Weak<SequentialScheduler>| {
            let weak = weak.clone();
            let runs = runs.clone();
            SequentialScheduler {
                state: AtomicU8::new(IDLE),
                task: Box::new(move || {
                    if runs.fetch_add(1, Ordering::SeqCst) == 0 {
                        if let Some(this) = weak.upgrade() {
                            // Re-entrant request: must not recurse, must rerun.
                            this.run_or_schedule();
                            this.run_or_schedule();
                        }
                    }
                }),
            }
        });

        scheduler.run_or_schedule();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stopped_scheduler_never_runs() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let scheduler = SequentialScheduler::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        scheduler.stop();
        scheduler.stop();
        scheduler.run_or_schedule();
        assert!(scheduler.is_stopped());
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn never_overlaps_across_threads() {
        let active = Arc::new(AtomicBool::new(false));
        let overlap = Arc::new(AtomicBool::new(false));
        let runs = Arc::new(AtomicUsize::new(0));

        let scheduler = {
            let active = active.clone();
            let overlap = overlap.clone();
            let runs = runs.clone();
            SequentialScheduler::new(move || {
                if active.swap(true, Ordering::SeqCst) {
                    overlap.store(true, Ordering::SeqCst);
                }
                runs.fetch_add(1, Ordering::SeqCst);
                std::thread::yield_now();
                active.store(false, Ordering::SeqCst);
            })
        };

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let scheduler = scheduler.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        scheduler.run_or_schedule();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(!overlap.load(Ordering::SeqCst));
        assert!(runs.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn runs_on_executor() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = parking_lot::Mutex::new(Some(tx));
        let scheduler = SequentialScheduler::new(move || {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(());
            }
        });

        scheduler.run_or_schedule_on(&tokio::runtime::Handle::current());
        rx.await.unwrap();
    }
}
