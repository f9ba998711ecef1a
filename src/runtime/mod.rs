// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod fail;
pub mod limits;
pub mod logging;
pub mod task;
pub mod timer;

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    collections::id_map::IdMap,
    config::Config,
    iowait::IoWait,
    runtime::task::{
        Task,
        TaskId,
        TaskRef,
        TaskState,
    },
};
use ::futures::task::noop_waker_ref;
use ::slab::Slab;
use ::std::{
    cell::RefCell,
    collections::VecDeque,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
        Mutex,
    },
    task::{
        Context,
        Poll,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// A coroutine: what a task runs.
pub type Operation = dyn Future<Output = ()> + Send;

thread_local! {
    /// The task the calling worker thread is currently polling, if any.
    static CURRENT_TASK: RefCell<Option<TaskRef>> = RefCell::new(None);
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Slot of a task in the task table.
#[derive(Clone, Copy, Debug)]
struct InternalId(usize);

/// FIFO of runnable tasks, shared between the scheduler and the I/O-wait
/// engine.
#[derive(Default)]
pub struct RunQueue {
    queue: Mutex<VecDeque<TaskRef>>,
}

/// Task bookkeeping: slab storage plus the randomized external-id map.
#[derive(Default)]
struct TaskTable {
    tasks: Slab<TaskRef>,
    ids: IdMap<TaskId, InternalId>,
}

/// The coroutine scheduler. Owns the task table, the run queue, and the
/// I/O-wait engine; worker threads share it behind an [Arc].
pub struct Scheduler {
    run_queue: Arc<RunQueue>,
    table: Mutex<TaskTable>,
    iowait: IoWait,
    stop: AtomicBool,
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// The task the calling thread is currently running, if it is a worker
/// polling one.
pub fn current_task() -> Option<TaskRef> {
    CURRENT_TASK.with(|current| current.borrow().clone())
}

fn set_current_task(task: Option<TaskRef>) {
    CURRENT_TASK.with(|current| *current.borrow_mut() = task);
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl RunQueue {
    pub fn push(&self, task: TaskRef) {
        self.queue.lock().expect("run queue lock poisoned").push_back(task);
    }

    pub fn pop(&self) -> Option<TaskRef> {
        self.queue.lock().expect("run queue lock poisoned").pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().expect("run queue lock poisoned").len()
    }
}

impl Scheduler {
    pub fn new(config: Config) -> Self {
        logging::initialize();
        let run_queue: Arc<RunQueue> = Arc::new(RunQueue::default());
        Self {
            iowait: IoWait::new(&config, run_queue.clone()),
            run_queue,
            table: Mutex::new(TaskTable::default()),
            stop: AtomicBool::new(false),
        }
    }

    /// Inserts the `coroutine` named `name` into the scheduler and makes it
    /// runnable.
    pub fn insert_coroutine(&self, name: &str, coroutine: Pin<Box<Operation>>) -> TaskId {
        let mut table = self.table.lock().expect("task table lock poisoned");
        let slot: usize = table.tasks.vacant_key();
        let id: TaskId = table.ids.insert_with_new_id(InternalId(slot));
        let task: TaskRef = Arc::new(Task::new(id, name.to_string(), coroutine));
        table.tasks.insert(task.clone());
        drop(table);
        trace!("insert coroutine: name={:?} id={:?}", name, id);
        self.run_queue.push(task);
        id
    }

    /// Looks a task up by its id.
    pub fn get_task(&self, id: &TaskId) -> Option<TaskRef> {
        let table = self.table.lock().expect("task table lock poisoned");
        let internal: InternalId = table.ids.get(id)?;
        table.tasks.get(internal.0).cloned()
    }

    fn remove_task(&self, id: &TaskId) {
        let mut table = self.table.lock().expect("task table lock poisoned");
        match table.ids.remove(id) {
            Some(internal) if table.tasks.try_remove(internal.0).is_some() => (),
            _ => warn!("removing task that does not exist: id={:?}", id),
        }
    }

    /// Runs one runnable task until it yields or completes. Returns false if
    /// the run queue was empty.
    pub fn poll_next(&self) -> bool {
        let task: TaskRef = match self.run_queue.pop() {
            Some(task) => task,
            None => return false,
        };
        task.set_state(TaskState::Running);
        let mut coroutine: Pin<Box<Operation>> = match task.take_coroutine() {
            Some(coroutine) => coroutine,
            None => {
                warn!("task({}) has no coroutine to run", task.id());
                return true;
            },
        };

        set_current_task(Some(task.clone()));
        let mut context: Context = Context::from_waker(noop_waker_ref());
        let result: Poll<()> = coroutine.as_mut().poll(&mut context);
        set_current_task(None);

        match result {
            Poll::Ready(()) => {
                trace!("task({}:{}) completed", task.id(), task.name());
                task.set_state(TaskState::Done);
                self.remove_task(&task.id());
            },
            Poll::Pending => {
                // Hand the coroutine back before anyone can wake the task:
                // the moment it is parked, a peer thread may re-queue it.
                task.put_coroutine(coroutine);
                if task.state() == TaskState::IoBlocked {
                    self.iowait.park(&task);
                } else {
                    // Cooperative yield with no wait attached: go around again.
                    task.set_state(TaskState::Runnable);
                    self.run_queue.push(task);
                }
            },
        }
        true
    }

    /// One pass of the I/O-wait engine. See [IoWait::wait_loop].
    pub fn wait_loop(&self, enable_block: bool) -> i64 {
        self.iowait.wait_loop(enable_block)
    }

    /// Cancels a task's wait from outside. See [IoWait::cancel].
    pub fn cancel(&self, task: &TaskRef, wait_id: u32) {
        self.iowait.cancel(task, wait_id);
    }

    /// The scheduler's main loop: drain runnable tasks, then one wait pass.
    /// Grows the epoll wait time while idle and resets it when work shows up.
    pub fn run_worker(&self) {
        while !self.stop.load(Ordering::SeqCst) {
            let mut ran: usize = 0;
            while self.poll_next() {
                ran += 1;
            }
            let dispatched: i64 = self.wait_loop(true);
            if ran == 0 && dispatched <= 0 {
                self.iowait.delay_event_wait_time();
            } else {
                self.iowait.reset_event_wait_time();
            }
        }
    }

    /// Makes every worker running [Self::run_worker] return.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// The I/O-wait engine.
    pub fn iowait(&self) -> &IoWait {
        &self.iowait
    }

    /// Number of live tasks.
    pub fn num_tasks(&self) -> usize {
        self.table.lock().expect("task table lock poisoned").tasks.len()
    }

    /// Number of tasks sitting in the run queue.
    pub fn num_runnable(&self) -> usize {
        self.run_queue.len()
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl From<u64> for InternalId {
    fn from(value: u64) -> Self {
        Self(value as usize)
    }
}

impl From<InternalId> for u64 {
    fn from(value: InternalId) -> Self {
        value.0 as u64
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::Scheduler;
    use crate::{
        config::Config,
        runtime::task::TaskId,
    };
    use ::anyhow::Result;
    use ::std::sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        Arc,
    };

    #[test]
    fn insert_creates_unique_task_ids() -> Result<()> {
        let scheduler: Scheduler = Scheduler::new(Config::default());
        let first: TaskId = scheduler.insert_coroutine("testing", Box::pin(async {}));
        let second: TaskId = scheduler.insert_coroutine("testing", Box::pin(async {}));
        crate::ensure_neq!(first, second);
        crate::ensure_eq!(scheduler.num_tasks(), 2);
        Ok(())
    }

    #[test]
    fn poll_next_completes_a_ready_coroutine() -> Result<()> {
        let scheduler: Scheduler = Scheduler::new(Config::default());
        let ran: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
        let ran2: Arc<AtomicUsize> = ran.clone();
        scheduler.insert_coroutine("testing", Box::pin(async move {
            ran2.fetch_add(1, Ordering::SeqCst);
        }));

        crate::ensure_eq!(scheduler.poll_next(), true);
        crate::ensure_eq!(ran.load(Ordering::SeqCst), 1);
        crate::ensure_eq!(scheduler.num_tasks(), 0);
        crate::ensure_eq!(scheduler.poll_next(), false);
        Ok(())
    }

    #[test]
    fn current_task_is_only_set_while_polling() -> Result<()> {
        let scheduler: Scheduler = Scheduler::new(Config::default());
        crate::ensure_eq!(super::current_task().is_none(), true);

        let observed: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
        let observed2: Arc<AtomicUsize> = observed.clone();
        scheduler.insert_coroutine("testing", Box::pin(async move {
            if super::current_task().is_some() {
                observed2.fetch_add(1, Ordering::SeqCst);
            }
        }));

        scheduler.poll_next();
        crate::ensure_eq!(observed.load(Ordering::SeqCst), 1);
        crate::ensure_eq!(super::current_task().is_none(), true);
        Ok(())
    }
}
