//! Concurrent task scheduler
//!
//! A bounded pool of workers drains a priority queue of judging tasks.
//! Higher priority dequeues first; within one priority level tasks run in
//! FIFO order. The first error raised by any task aborts the queue and is
//! re-surfaced from `join()`/`done()`; later errors are dropped.
//!
//! With `jobs == 0` the scheduler degrades to synchronous inline execution
//! inside `put`, used when parallelism is disabled.

use anyhow::{anyhow, Result};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::error::Aborted;

type TaskFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type TaskFn<T> = dyn Fn(T) -> TaskFuture + Send + Sync;

struct QueueItem<T> {
    priority: i32,
    seq: u64,
    task: T,
}

impl<T> PartialEq for QueueItem<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<T> Eq for QueueItem<T> {}

impl<T> PartialOrd for QueueItem<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for QueueItem<T> {
    // Max-heap: higher priority wins, then lower sequence number (FIFO).
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

struct State<T> {
    heap: BinaryHeap<QueueItem<T>>,
    next_seq: u64,
    /// Tasks enqueued but not yet completed.
    missing: usize,
    finished: bool,
    aborted: bool,
    first_error: Option<anyhow::Error>,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    /// Wakes workers when the queue changed.
    todo: Notify,
    /// Wakes `join` when the outstanding count reaches zero.
    all_done: Notify,
}

impl<T> Shared<T> {
    fn abort(&self) {
        let empty = {
            let mut state = self.state.lock().unwrap();
            state.aborted = true;
            let dropped = state.heap.len();
            state.heap.clear();
            state.missing -= dropped;
            state.missing == 0
        };
        self.todo.notify_waiters();
        if empty {
            self.all_done.notify_waiters();
        }
    }

    fn record_error(&self, error: anyhow::Error) {
        let mut state = self.state.lock().unwrap();
        if state.first_error.is_none() {
            state.first_error = Some(error);
        }
    }
}

/// Bounded-concurrency priority scheduler over tasks of type `T`.
pub struct TaskScheduler<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    run: Arc<TaskFn<T>>,
    workers: Vec<JoinHandle<()>>,
    jobs: usize,
}

impl<T: Send + 'static> TaskScheduler<T> {
    /// Start `jobs` workers that each loop on "pop highest-priority task,
    /// run `f`, report completion". `jobs == 0` executes tasks inline on
    /// [`put`](Self::put).
    pub fn new<F, Fut>(jobs: usize, f: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let run: Arc<TaskFn<T>> = Arc::new(move |task| -> TaskFuture { Box::pin(f(task)) });
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                heap: BinaryHeap::new(),
                next_seq: 0,
                missing: 0,
                finished: false,
                aborted: false,
                first_error: None,
            }),
            todo: Notify::new(),
            all_done: Notify::new(),
        });

        let workers = (0..jobs)
            .map(|_| {
                let shared = Arc::clone(&shared);
                let run = Arc::clone(&run);
                tokio::spawn(worker(shared, run))
            })
            .collect();

        Self {
            shared,
            run,
            workers,
            jobs,
        }
    }

    /// Enqueue one task. Higher priority runs first.
    ///
    /// Must not be called after [`done`](Self::done); silently ignored after
    /// [`abort`](Self::abort).
    pub async fn put(&self, task: T, priority: i32) {
        if self.jobs == 0 {
            {
                let state = self.shared.state.lock().unwrap();
                assert!(!state.finished, "put() called after done()");
                if state.aborted {
                    return;
                }
            }
            if let Err(error) = (self.run)(task).await {
                if !self.is_aborted() {
                    self.shared.abort();
                    self.shared.record_error(error);
                }
            }
            return;
        }

        {
            let mut state = self.shared.state.lock().unwrap();
            assert!(!state.finished, "put() called after done()");
            if state.aborted {
                return;
            }
            state.missing += 1;
            state.next_seq += 1;
            let seq = state.next_seq;
            state.heap.push(QueueItem {
                priority,
                seq,
                task,
            });
        }
        self.shared.todo.notify_one();
    }

    /// Wait until the outstanding-task count reaches zero, then surface the
    /// first captured task error, if any.
    pub async fn join(&self) -> Result<()> {
        loop {
            let notified = self.shared.all_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.shared.state.lock().unwrap();
                if state.missing == 0 {
                    return match state.first_error.take() {
                        Some(error) => Err(error),
                        None => Ok(()),
                    };
                }
            }
            notified.await;
        }
    }

    /// Mark that no more tasks will be enqueued, let the queue drain, join
    /// all workers, and surface the first captured error.
    pub async fn done(&mut self) -> Result<()> {
        self.shared.state.lock().unwrap().finished = true;
        self.shared.todo.notify_waiters();

        for handle in self.workers.drain(..) {
            if let Err(join_error) = handle.await {
                self.shared
                    .record_error(anyhow!("scheduler worker died: {join_error}"));
            }
        }

        match self.shared.state.lock().unwrap().first_error.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Discard all queued (not yet started) tasks and wake every waiter.
    /// In-flight tasks keep running; they are expected to poll
    /// [`is_aborted`](Self::is_aborted) and exit early.
    pub fn abort(&self) {
        self.shared.abort();
    }

    /// Alias for [`abort`](Self::abort), for interrupt handlers.
    pub fn stop(&self) {
        self.abort();
    }

    pub fn is_aborted(&self) -> bool {
        self.shared.state.lock().unwrap().aborted
    }

    /// Bail out of task code once an abort is pending.
    pub fn ensure_alive(&self) -> Result<(), Aborted> {
        if self.is_aborted() {
            Err(Aborted)
        } else {
            Ok(())
        }
    }
}

async fn worker<T: Send + 'static>(shared: Arc<Shared<T>>, run: Arc<TaskFn<T>>) {
    loop {
        let task = loop {
            let notified = shared.todo.notified();
            tokio::pin!(notified);
            // Register for wakeups before checking state, so a notify between
            // the check and the await is not lost.
            notified.as_mut().enable();
            {
                let mut state = shared.state.lock().unwrap();
                if state.aborted {
                    return;
                }
                if let Some(item) = state.heap.pop() {
                    break item.task;
                }
                if state.finished {
                    return;
                }
            }
            notified.await;
        };

        let mut current_error = None;
        if let Err(error) = run(task).await {
            // Only the first failing worker aborts and keeps its error.
            let already_aborted = shared.state.lock().unwrap().aborted;
            if !already_aborted {
                shared.abort();
                current_error = Some(error);
            }
        }

        let empty = {
            let mut state = shared.state.lock().unwrap();
            if state.first_error.is_none() {
                state.first_error = current_error.take();
            }
            state.missing -= 1;
            state.missing == 0
        };
        if empty {
            shared.all_done.notify_waiters();
        }
    }
}

/// Run `f` over all `tasks` at equal priority and wait for completion.
pub async fn run_tasks<T, F, Fut>(jobs: usize, f: F, tasks: Vec<T>) -> Result<()>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let mut scheduler = TaskScheduler::new(jobs, f);
    for task in tasks {
        scheduler.put(task, 0).await;
    }
    scheduler.done().await
}
