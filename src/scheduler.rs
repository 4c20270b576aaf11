//! Periodic-work collaborator.
//!
//! The runtime does not own an async runtime; subsystems that need
//! periodic work (metric refreshes, adaptive sampler adaptation) receive a
//! [`Scheduler`] and register repeating tasks against it. The default
//! implementation runs tasks on a bounded pool of named worker threads; a
//! slow task occupies one worker while the others keep draining the queue,
//! so independent tasks do not delay each other.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{after, select, unbounded, Receiver, Sender};

/// A repeating task registered with a [`Scheduler`].
pub type Task = Box<dyn Fn() + Send + Sync>;

/// Schedules repeating tasks.
pub trait Scheduler: Send + Sync {
    /// Registers `task` to run every `interval`, first after one full
    /// interval. The task keeps running until the returned handle is
    /// cancelled or the scheduler shuts down.
    fn schedule_repeated(&self, interval: Duration, task: Task) -> ScheduleHandle;
}

/// Cancels a scheduled task.
///
/// Dropping the handle does not cancel; subsystems hold handles for
/// exactly as long as the configuration that created them is live.
#[derive(Clone, Debug)]
pub struct ScheduleHandle {
    cancelled: Arc<AtomicBool>,
}

impl ScheduleHandle {
    /// Stops future runs of the task. A run already in progress completes.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// `true` once [`ScheduleHandle::cancel`] has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

struct Entry {
    due: Instant,
    sequence: u64,
    interval: Duration,
    task: Arc<dyn Fn() + Send + Sync>,
    cancelled: Arc<AtomicBool>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.sequence == other.sequence
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due
            .cmp(&other.due)
            .then(self.sequence.cmp(&other.sequence))
    }
}

struct Shared {
    queue: Mutex<BinaryHeap<Reverse<Entry>>>,
    sequence: AtomicU64,
    shutdown: AtomicBool,
}

/// The default [`Scheduler`]: a fixed pool of worker threads over a shared
/// delay queue.
pub struct ThreadPoolScheduler {
    shared: Arc<Shared>,
    wake_tx: Sender<()>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ThreadPoolScheduler {
    /// Starts `pool_size` worker threads named `{name}-{index}`.
    pub fn new(name: &str, pool_size: usize) -> ThreadPoolScheduler {
        let shared = Arc::new(Shared {
            queue: Mutex::new(BinaryHeap::new()),
            sequence: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        });
        let (wake_tx, wake_rx) = unbounded::<()>();

        let mut workers = Vec::with_capacity(pool_size.max(1));
        for index in 0..pool_size.max(1) {
            let shared = shared.clone();
            let wake_rx = wake_rx.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || worker_loop(shared, wake_rx))
                .expect("failed to spawn scheduler worker");
            workers.push(handle);
        }

        ThreadPoolScheduler {
            shared,
            wake_tx,
            workers: Mutex::new(workers),
        }
    }

    /// Signals the workers to exit and joins them. Pending tasks are
    /// discarded.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()));
        for _ in &workers {
            let _ = self.wake_tx.send(());
        }
        for handle in workers {
            let _ = handle.join();
        }
    }
}

impl Scheduler for ThreadPoolScheduler {
    fn schedule_repeated(&self, interval: Duration, task: Task) -> ScheduleHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let entry = Entry {
            due: Instant::now() + interval,
            sequence: self.shared.sequence.fetch_add(1, Ordering::Relaxed),
            interval,
            task: Arc::from(task),
            cancelled: cancelled.clone(),
        };
        self.shared
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Reverse(entry));
        let _ = self.wake_tx.send(());
        ScheduleHandle { cancelled }
    }
}

impl std::fmt::Debug for ThreadPoolScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPoolScheduler").finish_non_exhaustive()
    }
}

enum Step {
    Run(Entry),
    PopHead,
    Wait(Duration),
    Idle,
}

fn worker_loop(shared: Arc<Shared>, wake_rx: Receiver<()>) {
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        let step = {
            let mut queue = shared.queue.lock().unwrap_or_else(|e| e.into_inner());
            let decision = match queue.peek() {
                Some(Reverse(next)) if next.cancelled.load(Ordering::Acquire) => Step::PopHead,
                Some(Reverse(next)) => {
                    let now = Instant::now();
                    if next.due <= now {
                        // Popped below, once the peek borrow is released.
                        Step::PopHead
                    } else {
                        Step::Wait(next.due - now)
                    }
                }
                None => Step::Idle,
            };
            match decision {
                Step::PopHead => {
                    let Reverse(entry) = queue.pop().expect("peeked entry present");
                    if entry.cancelled.load(Ordering::Acquire) {
                        continue;
                    }
                    Step::Run(entry)
                }
                other => other,
            }
        };

        match step {
            Step::Run(mut entry) => {
                (entry.task)();
                if !entry.cancelled.load(Ordering::Acquire) {
                    entry.due = Instant::now() + entry.interval;
                    entry.sequence = shared.sequence.fetch_add(1, Ordering::Relaxed);
                    shared
                        .queue
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push(Reverse(entry));
                }
            }
            Step::Wait(timeout) => {
                let timer = after(timeout);
                select! {
                    recv(wake_rx) -> msg => {
                        if msg.is_err() {
                            return;
                        }
                    }
                    recv(timer) -> _ => {}
                }
            }
            Step::Idle => {
                if wake_rx.recv().is_err() {
                    return;
                }
            }
            Step::PopHead => unreachable!("resolved while the queue lock was held"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn repeated_task_fires_until_cancelled() {
        let scheduler = ThreadPoolScheduler::new("test-scheduler", 1);
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_in_task = runs.clone();

        let handle = scheduler.schedule_repeated(
            Duration::from_millis(10),
            Box::new(move || {
                runs_in_task.fetch_add(1, Ordering::SeqCst);
            }),
        );

        thread::sleep(Duration::from_millis(120));
        handle.cancel();
        let after_cancel = runs.load(Ordering::SeqCst);
        assert!(after_cancel >= 2, "expected repeated runs, got {after_cancel}");

        thread::sleep(Duration::from_millis(60));
        let later = runs.load(Ordering::SeqCst);
        assert!(later <= after_cancel + 1, "task kept running after cancel");
    }

    #[test]
    fn slow_task_does_not_starve_others() {
        let scheduler = ThreadPoolScheduler::new("test-scheduler", 2);
        let fast_runs = Arc::new(AtomicUsize::new(0));
        let fast_in_task = fast_runs.clone();

        let slow = scheduler.schedule_repeated(
            Duration::from_millis(5),
            Box::new(|| thread::sleep(Duration::from_millis(80))),
        );
        let fast = scheduler.schedule_repeated(
            Duration::from_millis(10),
            Box::new(move || {
                fast_in_task.fetch_add(1, Ordering::SeqCst);
            }),
        );

        thread::sleep(Duration::from_millis(150));
        slow.cancel();
        fast.cancel();
        assert!(fast_runs.load(Ordering::SeqCst) >= 3);
    }
}
