//! Worker thread pool.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use log;
use parking_lot::{Condvar, Mutex};

use crate::sort::SortError;

/// A unit of work executed on a pool worker.
pub type Task = Box<dyn FnOnce() -> Result<(), SortError> + Send + 'static>;

struct TaskQueue {
    tasks: VecDeque<Task>,
    stop: bool,
}

struct PoolShared {
    queue: Mutex<TaskQueue>,
    task_available: Condvar,
    /// Tasks currently executing on a worker.
    active_tasks: AtomicUsize,
    failed: AtomicBool,
    failure: Mutex<Option<SortError>>,
}

impl PoolShared {
    /// Stores `err` unless an earlier failure already occupies the slot.
    fn record_failure(&self, err: SortError) {
        let mut slot = self.failure.lock();

        if slot.is_none() && !self.failed.load(Ordering::Relaxed) {
            *slot = Some(err);
            self.failed.store(true, Ordering::Release);
        }
    }
}

/// Fixed-size thread pool executing fallible tasks in FIFO order.
///
/// The first task to fail (by error or panic) has its failure captured;
/// later failures are dropped. The captured failure surfaces at the next
/// [`ThreadPool::check_failure`] or [`ThreadPool::wait_ready`] call, which
/// is how submitters learn about errors in work they scheduled earlier.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl ThreadPool {
    /// Creates a pool with the default worker count:
    /// `max(2, hardware parallelism) - 1`, leaving one hardware thread for
    /// the submitting thread which performs its own CPU work.
    pub fn new() -> std::io::Result<Self> {
        Self::with_workers(default_worker_count())
    }

    /// Creates a pool with an explicit worker count.
    pub fn with_workers(count: usize) -> std::io::Result<Self> {
        assert!(count > 0, "a thread pool requires at least one worker");

        log::info!("initializing thread-pool (workers: {})", count);

        let shared = Arc::new(PoolShared {
            queue: Mutex::new(TaskQueue {
                tasks: VecDeque::new(),
                stop: false,
            }),
            task_available: Condvar::new(),
            active_tasks: AtomicUsize::new(0),
            failed: AtomicBool::new(false),
            failure: Mutex::new(None),
        });

        let mut workers = Vec::with_capacity(count);
        for i in 0..count {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("sort-worker-{}", i))
                .spawn(move || worker_loop(&shared))?;
            workers.push(handle);
        }

        return Ok(ThreadPool { shared, workers });
    }

    /// Number of workers in the pool.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Enqueues a task. Returns immediately; the task runs on some worker
    /// in FIFO order relative to other tasks submitted by this thread.
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() -> Result<(), SortError> + Send + 'static,
    {
        {
            let mut queue = self.shared.queue.lock();
            queue.tasks.push_back(Box::new(task));
        }

        self.shared.task_available.notify_one();
    }

    /// Re-raises the first captured task failure, if any.
    pub fn check_failure(&self) -> Result<(), SortError> {
        if !self.shared.failed.load(Ordering::Acquire) {
            return Ok(());
        }

        match self.shared.failure.lock().take() {
            Some(err) => Err(err),
            // The failure was already taken by an earlier call.
            None => Err(SortError::TaskFailed),
        }
    }

    /// Returns true while the queue is non-empty or any worker is mid-task.
    pub fn has_pending(&self) -> bool {
        if self.shared.active_tasks.load(Ordering::Acquire) != 0 {
            return true;
        }

        let queue = self.shared.queue.lock();

        return !(queue.tasks.is_empty() && self.shared.active_tasks.load(Ordering::Relaxed) == 0);
    }

    /// Busy-waits (yielding) until `flag` is observed `true` with acquire
    /// ordering, re-raising any captured task failure while waiting.
    pub fn wait_ready(&self, flag: &AtomicBool) -> Result<(), SortError> {
        while !flag.load(Ordering::Acquire) {
            thread::yield_now();

            self.check_failure()?;
        }

        return Ok(());
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        {
            let mut queue = self.shared.queue.lock();
            queue.stop = true;
        }
        self.shared.task_available.notify_all();

        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn default_worker_count() -> usize {
    let hardware = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);

    hardware.max(2) - 1
}

fn worker_loop(shared: &PoolShared) {
    loop {
        let task = {
            let mut queue = shared.queue.lock();

            while queue.tasks.is_empty() && !queue.stop {
                shared.task_available.wait(&mut queue);
            }

            if queue.stop && queue.tasks.is_empty() {
                return;
            }

            let task = queue.tasks.pop_front().expect("queue is non-empty");

            // Incremented under the queue lock so `has_pending` never sees
            // the queue empty while a popped task has not started yet.
            shared.active_tasks.fetch_add(1, Ordering::Release);

            task
        };

        match panic::catch_unwind(AssertUnwindSafe(task)) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => shared.record_failure(err),
            Err(payload) => shared.record_failure(SortError::TaskPanic(panic_message(&payload))),
        }

        // Decremented only after the failure has been recorded, so a
        // `has_pending` barrier followed by `check_failure` cannot miss it.
        shared.active_tasks.fetch_sub(1, Ordering::Release);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else if let Some(inner) = payload.downcast_ref::<Box<dyn std::any::Any + Send>>() {
        panic_message(&**inner)
    } else {
        "unknown panic payload".to_owned()
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    use super::ThreadPool;
    use crate::sort::SortError;

    fn drain(pool: &ThreadPool) {
        while pool.has_pending() {
            thread::yield_now();
        }
    }

    #[test]
    fn test_tasks_run_and_drain() {
        let pool = ThreadPool::with_workers(4).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(())
            });
        }

        drain(&pool);

        assert_eq!(counter.load(Ordering::Relaxed), 100);
        assert!(pool.check_failure().is_ok());
    }

    #[test]
    fn test_wait_ready_observes_task_flag() {
        let pool = ThreadPool::with_workers(2).unwrap();
        let flag = Arc::new(AtomicBool::new(false));

        let task_flag = Arc::clone(&flag);
        pool.submit(move || {
            task_flag.store(true, Ordering::Release);
            Ok(())
        });

        pool.wait_ready(&flag).unwrap();
        assert!(flag.load(Ordering::Acquire));
    }

    #[test]
    fn test_first_failure_wins() {
        let pool = ThreadPool::with_workers(1).unwrap();

        pool.submit(|| Err(SortError::TaskPanic("first".into())));
        pool.submit(|| Err(SortError::TaskPanic("second".into())));

        drain(&pool);

        match pool.check_failure() {
            Err(SortError::TaskPanic(message)) => assert_eq!(message, "first"),
            other => panic!("unexpected result: {:?}", other),
        }

        // The slot was already drained; later checks still fail.
        assert!(matches!(pool.check_failure(), Err(SortError::TaskFailed)));
    }

    #[test]
    fn test_panicking_task_is_captured() {
        let pool = ThreadPool::with_workers(2).unwrap();

        pool.submit(|| panic!("worker blew up"));

        drain(&pool);

        match pool.check_failure() {
            Err(SortError::TaskPanic(message)) => assert_eq!(message, "worker blew up"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_wait_ready_raises_on_failure() {
        let pool = ThreadPool::with_workers(1).unwrap();
        let flag = AtomicBool::new(false);

        pool.submit(|| Err(SortError::TaskPanic("load failed".into())));

        assert!(pool.wait_ready(&flag).is_err());
    }

    #[test]
    fn test_pool_survives_after_failure() {
        let pool = ThreadPool::with_workers(2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        pool.submit(|| panic!("boom"));
        drain(&pool);

        let task_counter = Arc::clone(&counter);
        pool.submit(move || {
            task_counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });
        drain(&pool);

        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }
}
