//! Fixed-size worker pool for the parallel parts of a cycle.
//!
//! Work is queued while the pool is stopped and picked up once it starts.
//! The caller of [`GcThreadPool::wait_finish`] drains the queue alongside
//! the workers and returns once everything queued, including work queued by
//! running work, has finished.

use std::{
    collections::VecDeque,
    sync::Arc,
    thread::{self, JoinHandle},
};

use parking_lot::{Condvar, Mutex};

use crate::HeapError;

/// A unit of pool work. It receives the index of the thread running it;
/// the thread draining in `wait_finish` has index `thread_count()`.
pub type GcWork = Box<dyn FnOnce(usize) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolState {
    Stopped,
    Running,
    Exiting,
}

struct PoolQueue {
    state: PoolState,
    work: VecDeque<GcWork>,
    max_active: usize,
    busy: usize,
    waiting: usize,
}

struct PoolShared {
    queue: Mutex<PoolQueue>,
    has_work: Condvar,
    idle: Condvar,
}

pub struct GcThreadPool {
    shared: Arc<PoolShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    thread_count: usize,
}

impl GcThreadPool {
    pub fn new(thread_count: usize) -> Result<Self, HeapError> {
        let thread_count = thread_count.max(1);
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(PoolQueue {
                state: PoolState::Stopped,
                work: VecDeque::new(),
                max_active: thread_count,
                busy: 0,
                waiting: 0,
            }),
            has_work: Condvar::new(),
            idle: Condvar::new(),
        });
        let mut threads = Vec::with_capacity(thread_count);
        for index in 0..thread_count {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("kette-gc-worker-{index}"))
                .spawn(move || worker_loop(&shared, index))
                .map_err(HeapError::ThreadSpawn)?;
            threads.push(handle);
        }
        Ok(Self {
            shared,
            threads: Mutex::new(threads),
            thread_count,
        })
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// Queues `work`, waking a worker if the pool runs. While the pool is
    /// shrunk a parked worker may take the single wakeup, so all of them are
    /// woken and the excess ones park again.
    pub fn add_work(&self, work: GcWork) {
        let mut queue = self.shared.queue.lock();
        queue.work.push_back(work);
        if queue.state == PoolState::Running {
            if queue.max_active < self.thread_count {
                self.shared.has_work.notify_all();
            } else {
                self.shared.has_work.notify_one();
            }
            self.shared.idle.notify_one();
        }
    }

    pub fn start(&self) {
        let mut queue = self.shared.queue.lock();
        if queue.state == PoolState::Exiting {
            return;
        }
        queue.state = PoolState::Running;
        self.shared.has_work.notify_all();
    }

    /// Runs queued work on the calling thread until the queue is empty and
    /// every worker is idle, then stops the pool.
    pub fn wait_finish(&self) {
        let mut queue = self.shared.queue.lock();
        loop {
            if let Some(work) = queue.work.pop_front() {
                queue.busy += 1;
                drop(queue);
                work(self.thread_count);
                queue = self.shared.queue.lock();
                queue.busy -= 1;
                continue;
            }
            if queue.busy == 0 {
                break;
            }
            self.shared.idle.wait(&mut queue);
        }
        if queue.state == PoolState::Running {
            queue.state = PoolState::Stopped;
        }
    }

    /// Limits how many workers pick up work. Excess workers park; raising
    /// the limit wakes them.
    pub fn set_max_active_threads(&self, count: usize) {
        let count = count.clamp(1, self.thread_count);
        let mut queue = self.shared.queue.lock();
        if queue.max_active != count {
            log::debug!(
                "gc pool active threads {} -> {count} ({} waiting)",
                queue.max_active,
                queue.waiting
            );
        }
        let grows = count > queue.max_active;
        queue.max_active = count;
        if grows {
            self.shared.has_work.notify_all();
        }
    }

    pub fn max_active_threads(&self) -> usize {
        self.shared.queue.lock().max_active
    }

    /// Number of workers currently waiting for work.
    pub fn waiting_threads(&self) -> usize {
        self.shared.queue.lock().waiting
    }

    pub fn is_running(&self) -> bool {
        self.shared.queue.lock().state == PoolState::Running
    }

    fn exit(&self) {
        {
            let mut queue = self.shared.queue.lock();
            queue.state = PoolState::Exiting;
            queue.work.clear();
            self.shared.has_work.notify_all();
        }
        for handle in self.threads.lock().drain(..) {
            if handle.join().is_err() {
                log::error!("gc worker panicked");
            }
        }
    }
}

impl Drop for GcThreadPool {
    fn drop(&mut self) {
        self.exit();
    }
}

fn worker_loop(shared: &PoolShared, index: usize) {
    let mut queue = shared.queue.lock();
    loop {
        match queue.state {
            PoolState::Exiting => return,
            PoolState::Running if index < queue.max_active => {
                if let Some(work) = queue.work.pop_front() {
                    queue.busy += 1;
                    drop(queue);
                    work(index);
                    queue = shared.queue.lock();
                    queue.busy -= 1;
                    if queue.busy == 0 && queue.work.is_empty() {
                        shared.idle.notify_all();
                    }
                    continue;
                }
            }
            _ => {}
        }
        queue.waiting += 1;
        shared.has_work.wait(&mut queue);
        queue.waiting -= 1;
    }
}
