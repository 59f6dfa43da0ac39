//! Task queue of the gc thread.
//!
//! Synchronous requests queue in order and carry an index; their requesters
//! wait until the finished index reaches it. Asynchronous requests set a bit
//! in a priority word, so repeated requests of one kind collapse into one.

use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

use parking_lot::{Condvar, Mutex};

use crate::gc_request::GcReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcTask {
    Terminate,
    /// The backup timer fired.
    Timeout,
    Invoke(GcReason),
}

impl GcTask {
    const PRIO_TERMINATE: u32 = 0;
    const PRIO_TIMEOUT: u32 = 1;
    const PRIO_INVOKE: u32 = 2;

    fn priority(self) -> u32 {
        match self {
            GcTask::Terminate => Self::PRIO_TERMINATE,
            GcTask::Timeout => Self::PRIO_TIMEOUT,
            GcTask::Invoke(reason) => Self::PRIO_INVOKE + reason as u32,
        }
    }

    fn from_priority(prio: u32) -> Option<GcTask> {
        match prio {
            Self::PRIO_TERMINATE => Some(GcTask::Terminate),
            Self::PRIO_TIMEOUT => Some(GcTask::Timeout),
            p => GcReason::from_index((p - Self::PRIO_INVOKE) as usize).map(GcTask::Invoke),
        }
    }

    /// Overriding tasks drop every queued task of lower priority.
    fn is_overriding(self) -> bool {
        !matches!(self, GcTask::Invoke(_))
    }
}

/// Index of a task that nobody waits for.
pub const ASYNC_TASK_INDEX: u64 = u64::MAX;
/// Finished index published when the gc thread exits.
pub const TASK_INDEX_FOR_EXIT: u64 = 1;
const SYNC_TASK_MIN_INDEX: u64 = 2;

/// Lock-free set of pending async tasks, one bit per priority.
#[derive(Debug, Default)]
struct AsyncTaskWord(AtomicU32);

impl AsyncTaskWord {
    fn push(&self, task: GcTask) {
        let mask = 1u32 << task.priority();
        let overriding = task.is_overriding();
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |old| {
                Some(if overriding {
                    mask | ((mask - 1) & old)
                } else {
                    mask | old
                })
            });
    }

    /// Takes the most urgent pending task.
    fn pop(&self) -> Option<GcTask> {
        let old = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |old| {
                (old != 0).then(|| old & (old - 1))
            })
            .ok()?;
        GcTask::from_priority(old.trailing_zeros())
    }

    fn clear(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

struct SyncQueue {
    tasks: VecDeque<(GcTask, u64)>,
    next_index: u64,
}

struct FinishState {
    finished_index: u64,
    gc_started: bool,
}

pub struct GcTaskQueue {
    sync: Mutex<SyncQueue>,
    async_tasks: AsyncTaskWord,
    has_task: Condvar,
    finish: Mutex<FinishState>,
    finished: Condvar,
}

impl GcTaskQueue {
    pub fn new() -> Self {
        Self {
            sync: Mutex::new(SyncQueue {
                tasks: VecDeque::new(),
                next_index: SYNC_TASK_MIN_INDEX,
            }),
            async_tasks: AsyncTaskWord::default(),
            has_task: Condvar::new(),
            finish: Mutex::new(FinishState {
                finished_index: SYNC_TASK_MIN_INDEX,
                gc_started: false,
            }),
            finished: Condvar::new(),
        }
    }

    /// Queues a synchronous task and returns the index to wait for. If
    /// `merge` accepts a queued task, that task's index is returned instead.
    pub fn enqueue_sync(&self, task: GcTask, merge: impl Fn(&GcTask, &GcTask) -> bool) -> u64 {
        let mut queue = self.sync.lock();
        if let Some(&(_, index)) = queue.tasks.iter().rev().find(|(old, _)| merge(old, &task)) {
            return index;
        }
        queue.next_index += 1;
        let index = queue.next_index;
        queue.tasks.push_back((task, index));
        self.has_task.notify_all();
        index
    }

    pub fn enqueue_async(&self, task: GcTask) {
        self.async_tasks.push(task);
        let _queue = self.sync.lock();
        self.has_task.notify_all();
    }

    /// Blocks until a task is available. When `timeout` passes without
    /// one, a [`GcTask::Timeout`] is produced.
    pub fn dequeue(&self, timeout: Duration) -> (GcTask, u64) {
        let mut queue = self.sync.lock();
        let mut timed_out = false;
        loop {
            if let Some(entry) = queue.tasks.pop_front() {
                return entry;
            }
            if timed_out {
                self.async_tasks.push(GcTask::Timeout);
            }
            if let Some(task) = self.async_tasks.pop() {
                log::trace!("dequeue gc task {task:?}");
                return (task, ASYNC_TASK_INDEX);
            }
            timed_out = self.has_task.wait_for(&mut queue, timeout).timed_out();
        }
    }

    pub fn clear(&self) {
        self.sync.lock().tasks.clear();
        self.async_tasks.clear();
    }

    // ── Completion ────────────────────────────────────────────────────

    pub fn set_gc_started(&self) {
        self.finish.lock().gc_started = true;
    }

    pub fn is_gc_started(&self) -> bool {
        self.finish.lock().gc_started
    }

    pub fn notify_finished(&self, index: u64) {
        let mut finish = self.finish.lock();
        finish.gc_started = false;
        if index != ASYNC_TASK_INDEX {
            finish.finished_index = index;
        }
        self.finished.notify_all();
    }

    /// Waits until the task with `index` (or a later one) finished.
    pub fn wait_for_index(&self, index: u64) {
        let mut finish = self.finish.lock();
        while finish.finished_index < index && finish.finished_index != TASK_INDEX_FOR_EXIT {
            self.finished.wait(&mut finish);
        }
    }
}

impl Default for GcTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    #[test]
    fn test_async_requests_collapse() {
        let queue = GcTaskQueue::new();
        queue.enqueue_async(GcTask::Invoke(GcReason::Heu));
        queue.enqueue_async(GcTask::Invoke(GcReason::Heu));
        queue.enqueue_async(GcTask::Invoke(GcReason::Backup));
        let timeout = Duration::from_millis(10);
        // lower reason codes come first
        assert_eq!(queue.dequeue(timeout), (GcTask::Invoke(GcReason::Backup), ASYNC_TASK_INDEX));
        assert_eq!(queue.dequeue(timeout), (GcTask::Invoke(GcReason::Heu), ASYNC_TASK_INDEX));
        assert_eq!(queue.dequeue(timeout).0, GcTask::Timeout);
    }

    #[test]
    fn test_terminate_overrides_pending_requests() {
        let queue = GcTaskQueue::new();
        queue.enqueue_async(GcTask::Invoke(GcReason::Heu));
        queue.enqueue_async(GcTask::Terminate);
        assert_eq!(queue.dequeue(Duration::from_millis(10)).0, GcTask::Terminate);
        assert_eq!(queue.dequeue(Duration::from_millis(10)).0, GcTask::Timeout);
    }

    #[test]
    fn test_sync_requests_merge_by_reason() {
        let queue = GcTaskQueue::new();
        let same = |a: &GcTask, b: &GcTask| a == b;
        let a = queue.enqueue_sync(GcTask::Invoke(GcReason::User), same);
        let b = queue.enqueue_sync(GcTask::Invoke(GcReason::User), same);
        let c = queue.enqueue_sync(GcTask::Invoke(GcReason::Oom), same);
        assert_eq!(a, b);
        assert!(c > a);
        // sync tasks win over async ones
        queue.enqueue_async(GcTask::Invoke(GcReason::Heu));
        assert_eq!(queue.dequeue(Duration::from_millis(10)), (GcTask::Invoke(GcReason::User), a));
    }

    #[test]
    fn test_waiters_wake_on_finished_index() {
        let queue = Arc::new(GcTaskQueue::new());
        let index = queue.enqueue_sync(GcTask::Invoke(GcReason::User), |_, _| false);
        let waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.wait_for_index(index))
        };
        let (task, got) = queue.dequeue(Duration::from_secs(1));
        assert_eq!(task, GcTask::Invoke(GcReason::User));
        queue.set_gc_started();
        queue.notify_finished(got);
        waiter.join().expect("waiter panicked");
        assert!(!queue.is_gc_started());
    }
}
