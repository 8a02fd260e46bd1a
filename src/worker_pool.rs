//! Parallel frame dispatch: range mode and streaming mode (component F).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

use crate::progress::Progress;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Ready,
    Running,
    Finished,
}

/// Cooperative cancellation flag shared between the pool and worker
/// closures; checked between frames per spec §5.
#[derive(Debug, Default)]
pub struct StopFlag(AtomicBool);

impl StopFlag {
    pub fn new() -> Self {
        StopFlag(AtomicBool::new(false))
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Run `task count` items of work across `n_workers` threads, range mode.
///
/// Maintains an array of T slots with states READY/RUNNING/FINISHED. Each
/// idle worker takes the smallest-index READY slot under the shared lock,
/// marks it RUNNING, releases the lock, invokes `work(slot_index)`, then
/// re-acquires the lock to mark FINISHED and advance a progress counter.
///
/// Per the REDESIGN FLAGS resolution: the progress-bar call happens
/// *after* the slot-state lock is released, using a lock-free
/// `AtomicUsize` counter, so completion reporting does not serialise
/// behind the pool mutex. Progress remains monotone non-decreasing because
/// the counter is only ever incremented.
pub fn run_range<W>(task_count: usize, n_workers: usize, work: W, stop: &StopFlag, progress: &dyn Progress)
where
    W: Fn(usize) + Sync,
{
    if task_count == 0 {
        return;
    }
    // If N > T the pool silently reduces N to T.
    let n_workers = n_workers.clamp(1, task_count);

    let slots: Mutex<Vec<SlotState>> = Mutex::new(vec![SlotState::Ready; task_count]);
    let progress_counter = AtomicUsize::new(0);
    progress.set_total(task_count as u64);

    let next_ready = |slots: &mut Vec<SlotState>| -> Option<usize> {
        slots.iter().position(|s| *s == SlotState::Ready).map(|i| {
            slots[i] = SlotState::Running;
            i
        })
    };

    std::thread::scope(|scope| {
        for _ in 0..n_workers {
            scope.spawn(|| loop {
                if stop.is_stopped() {
                    return;
                }
                let slot = {
                    let mut guard = slots.lock().expect("worker pool mutex poisoned");
                    next_ready(&mut guard)
                };
                let Some(index) = slot else { return };

                work(index);

                {
                    let mut guard = slots.lock().expect("worker pool mutex poisoned");
                    guard[index] = SlotState::Finished;
                }
                let done = progress_counter.fetch_add(1, Ordering::SeqCst) + 1;
                progress.set_position(done as u64);
            });
        }
    });
}

/// A streaming task source. `next` must be safe to call concurrently from
/// multiple workers (e.g. behind its own internal lock); the pool serialises
/// access to it under the pool's own mutex to match the spec's
/// "get_task under the shared lock, drop the lock, execute" contract.
pub trait TaskSource<T>: Send + Sync {
    fn next_task(&self) -> Option<T>;
}

/// Run streaming mode: `get_task` (via `source`) returns items (or `None`
/// to signal exhaustion); `work` consumes each item and returns a result;
/// `done` runs on that result after each completion. Exits when
/// `get_task` returns `None` OR `max` tasks have started, whichever comes
/// first.
pub fn run_streaming<T, R, S, W, D>(source: &S, n_workers: usize, max: usize, work: W, done: D, stop: &StopFlag, progress: &dyn Progress)
where
    T: Send,
    R: Send,
    S: TaskSource<T>,
    W: Fn(T) -> R + Sync,
    D: Fn(R) + Sync,
{
    let started = Mutex::new(0usize);
    let pull_lock = Mutex::new(());
    let progress_counter = AtomicUsize::new(0);

    std::thread::scope(|scope| {
        for _ in 0..n_workers.max(1) {
            scope.spawn(|| loop {
                if stop.is_stopped() {
                    return;
                }
                let task = {
                    let _guard = pull_lock.lock().expect("pull lock poisoned");
                    let mut count = started.lock().expect("started counter poisoned");
                    if *count >= max {
                        return;
                    }
                    let Some(t) = source.next_task() else { return };
                    *count += 1;
                    t
                };

                let result = work(task);
                done(result);
                let n = progress_counter.fetch_add(1, Ordering::SeqCst) + 1;
                progress.set_position(n as u64);
            });
        }
    });
}

/// A FIFO task source backed by a mutex-protected queue, used by the
/// per-frame pipeline to feed frame paths to the streaming-mode pool.
pub struct QueueSource<T> {
    queue: Mutex<std::collections::VecDeque<T>>,
    cv: Condvar,
}

impl<T> QueueSource<T> {
    pub fn new(items: impl IntoIterator<Item = T>) -> Self {
        QueueSource {
            queue: Mutex::new(items.into_iter().collect()),
            cv: Condvar::new(),
        }
    }
}

impl<T: Send> TaskSource<T> for QueueSource<T> {
    fn next_task(&self) -> Option<T> {
        let mut guard = self.queue.lock().expect("queue mutex poisoned");
        let item = guard.pop_front();
        self.cv.notify_all();
        item
    }
}
