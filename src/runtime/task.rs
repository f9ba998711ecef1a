// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Task objects and the per-task I/O wait bookkeeping.
//!
//! A [Task] owns a boxed coroutine plus the mutable wait state that the
//! I/O-wait engine operates on while the task is parked. The engine hands the
//! kernel raw pointers to the [EpollCookie]s embedded in a task's [WaitSet],
//! so a wait set is never mutated in place: each wait installs a fresh
//! heap-allocated set whose address stays stable until every registration that
//! references it has been torn down.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    timer::TimerId,
    Operation,
};
use ::libc::c_int;
use ::std::{
    pin::Pin,
    sync::{
        atomic::{
            AtomicI64,
            AtomicIsize,
            AtomicPtr,
            AtomicU32,
            AtomicU8,
            Ordering,
        },
        Arc,
        Mutex,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Externally visible task identifier.
#[derive(Clone, Copy, Hash, PartialEq, Eq, Debug)]
pub struct TaskId(pub u64);

/// Life-cycle states of a task, as far as the I/O-wait engine is concerned.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TaskState {
    /// Sitting in the run queue, waiting for a worker.
    Runnable = 0,
    /// Being polled by a worker right now.
    Running = 1,
    /// Parked on the I/O-wait engine.
    IoBlocked = 2,
    /// Coroutine ran to completion.
    Done = 3,
}

/// A descriptor-interest pair for one wait. The cookie embedded here is what
/// the kernel hands back on readiness; its address must stay stable for as
/// long as a registration referencing it may exist.
pub struct FdEvent {
    /// File descriptor to wait on.
    fd: c_int,
    /// Requested interest, in epoll's vocabulary (EPOLLIN / EPOLLOUT / ...).
    events: u32,
    /// Kernel-side cookie for this registration.
    cookie: EpollCookie,
}

/// The per-registration cookie passed to the kernel. All fields are written
/// before the registration is installed and read back from `epoll_wait`
/// batches, possibly on other threads, hence the atomics.
pub(crate) struct EpollCookie {
    /// Owning task. Kept alive by the registration's leaked strong count.
    pub(crate) task: AtomicPtr<Task>,
    /// Wait id this registration belongs to. Stale deliveries are dropped.
    pub(crate) wait_id: AtomicU32,
    /// Back-pointer to the containing [FdEvent].
    pub(crate) parent: AtomicPtr<FdEvent>,
    /// Events reported by the kernel for this registration.
    pub(crate) reported: AtomicU32,
}

/// One wait's worth of descriptor-interest pairs. Held behind an [Arc] so the
/// registrar, the arbitrator, and the wait loop can all walk it without
/// borrowing from the task.
pub struct WaitSet {
    fds: Box<[FdEvent]>,
}

/// What a completed wait hands back to the coroutine.
pub struct WaitResult {
    /// Number of descriptors the waking `epoll_wait` batch reported ready.
    pub ready: u32,
    /// The wait's descriptors, with per-descriptor reported events filled in.
    pub fds: Option<Arc<WaitSet>>,
}

/// Per-task wait bookkeeping, owned by the task and operated on by the engine.
pub struct IoWaitData {
    /// Monotonically increasing wait counter. Names the current wait and is
    /// the key every resume path checks before touching the task.
    wait_id: AtomicU32,
    /// Number of kernel readiness events observed for the current wait.
    ready_count: AtomicU32,
    /// Requested timeout in milliseconds, -1 meaning no timer.
    timeout_ms: AtomicI64,
    /// Handle of the armed timer, if any.
    timer: Mutex<Option<TimerId>>,
    /// Descriptors of the current wait.
    wait_set: Mutex<Option<Arc<WaitSet>>>,
    /// Serializes multi-descriptor registration against cancellation.
    /// Engaged only when the wait spans more than one descriptor.
    fanout_lock: Mutex<()>,
}

/// A cooperatively scheduled task.
pub struct Task {
    /// Task identifier.
    id: TaskId,
    /// Task name, used in trace output.
    name: String,
    /// Current [TaskState].
    state: AtomicU8,
    /// Audited count of kernel-held references: one per installed epoll
    /// registration plus one per armed timer. Must be zero on drop.
    kernel_refs: AtomicIsize,
    /// Wait bookkeeping.
    io: IoWaitData,
    /// The coroutine this task runs. Taken out while a worker polls it.
    coroutine: Mutex<Option<Pin<Box<Operation>>>>,
}

/// Shared handle to a task.
pub type TaskRef = Arc<Task>;

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl FdEvent {
    /// Creates a descriptor-interest pair for `fd` with the given epoll
    /// interest mask.
    pub fn new(fd: c_int, events: u32) -> Self {
        Self {
            fd,
            events,
            cookie: EpollCookie {
                task: AtomicPtr::new(std::ptr::null_mut()),
                wait_id: AtomicU32::new(0),
                parent: AtomicPtr::new(std::ptr::null_mut()),
                reported: AtomicU32::new(0),
            },
        }
    }

    /// The file descriptor this entry waits on.
    pub fn fd(&self) -> c_int {
        self.fd
    }

    /// The requested interest mask.
    pub fn events(&self) -> u32 {
        self.events
    }

    /// The events the kernel reported for this entry, or zero if it never
    /// triggered.
    pub fn revents(&self) -> u32 {
        self.cookie.reported.load(Ordering::Acquire)
    }

    /// Address of the embedded cookie, as registered with the kernel.
    pub(crate) fn cookie_ptr(&self) -> *const EpollCookie {
        &self.cookie as *const EpollCookie
    }

    /// Stamps the cookie with its owning task and wait id, clearing any
    /// previously reported events.
    pub(crate) fn bind_cookie(&self, task: *const Task, wait_id: u32) {
        self.cookie.reported.store(0, Ordering::Relaxed);
        self.cookie.parent.store(self as *const FdEvent as *mut FdEvent, Ordering::Relaxed);
        self.cookie.wait_id.store(wait_id, Ordering::Relaxed);
        self.cookie.task.store(task as *mut Task, Ordering::Release);
    }
}

impl WaitSet {
    pub(crate) fn new(fds: Vec<FdEvent>) -> Self {
        Self {
            fds: fds.into_boxed_slice(),
        }
    }

    /// The descriptor-interest pairs of this wait, in registration order.
    pub fn fds(&self) -> &[FdEvent] {
        &self.fds
    }
}

impl WaitResult {
    /// The result of a wait that never parked (no task context).
    pub(crate) fn empty() -> Self {
        Self { ready: 0, fds: None }
    }
}

impl IoWaitData {
    fn new() -> Self {
        Self {
            wait_id: AtomicU32::new(0),
            ready_count: AtomicU32::new(0),
            timeout_ms: AtomicI64::new(-1),
            timer: Mutex::new(None),
            wait_set: Mutex::new(None),
            fanout_lock: Mutex::new(()),
        }
    }

    /// Advances to a fresh wait id and returns it.
    pub(crate) fn next_wait_id(&self) -> u32 {
        self.wait_id.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
    }

    /// The id of the current wait.
    pub(crate) fn wait_id(&self) -> u32 {
        self.wait_id.load(Ordering::SeqCst)
    }

    pub(crate) fn reset_ready_count(&self) {
        self.ready_count.store(0, Ordering::SeqCst);
    }

    pub(crate) fn increment_ready_count(&self) {
        self.ready_count.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn ready_count(&self) -> u32 {
        self.ready_count.load(Ordering::SeqCst)
    }

    pub(crate) fn set_timeout_ms(&self, timeout_ms: i64) {
        self.timeout_ms.store(timeout_ms, Ordering::SeqCst);
    }

    pub(crate) fn timeout_ms(&self) -> i64 {
        self.timeout_ms.load(Ordering::SeqCst)
    }

    pub(crate) fn set_timer(&self, timer: Option<TimerId>) {
        *self.timer.lock().expect("timer lock poisoned") = timer;
    }

    pub(crate) fn timer(&self) -> Option<TimerId> {
        *self.timer.lock().expect("timer lock poisoned")
    }

    /// Replaces the current wait set. The previous set's allocation survives
    /// until every registration that still references it has been released.
    pub(crate) fn install_wait_set(&self, wait_set: Arc<WaitSet>) {
        *self.wait_set.lock().expect("wait set lock poisoned") = Some(wait_set);
    }

    /// The current wait's descriptors.
    pub(crate) fn wait_set(&self) -> Option<Arc<WaitSet>> {
        self.wait_set.lock().expect("wait set lock poisoned").clone()
    }

    /// The multi-descriptor fan-out lock.
    pub(crate) fn fanout_lock(&self) -> &Mutex<()> {
        &self.fanout_lock
    }
}

impl Task {
    /// Creates a new task around `coroutine`.
    pub fn new(id: TaskId, name: String, coroutine: Pin<Box<Operation>>) -> Self {
        Self {
            id,
            name,
            state: AtomicU8::new(TaskState::Runnable as u8),
            kernel_refs: AtomicIsize::new(0),
            io: IoWaitData::new(),
            coroutine: Mutex::new(Some(coroutine)),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TaskState {
        match self.state.load(Ordering::SeqCst) {
            0 => TaskState::Runnable,
            1 => TaskState::Running,
            2 => TaskState::IoBlocked,
            3 => TaskState::Done,
            state => unreachable!("invalid task state: {:?}", state),
        }
    }

    pub fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Records one more kernel-held reference to this task.
    pub(crate) fn increment_ref(&self) {
        self.kernel_refs.fetch_add(1, Ordering::SeqCst);
    }

    /// Records that one kernel-held reference was released.
    pub(crate) fn decrement_ref(&self) {
        let previous: isize = self.kernel_refs.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "kernel reference counter underflow");
    }

    /// Audited count of kernel-held references.
    pub fn kernel_refs(&self) -> isize {
        self.kernel_refs.load(Ordering::SeqCst)
    }

    /// The id of the task's current wait. External cancellation passes this
    /// back so a wait that has already moved on is left alone.
    pub fn wait_id(&self) -> u32 {
        self.io.wait_id()
    }

    /// Handle of the timer armed for the current wait, if any.
    pub fn armed_timer(&self) -> Option<TimerId> {
        self.io.timer()
    }

    /// Per-task wait bookkeeping.
    pub(crate) fn io(&self) -> &IoWaitData {
        &self.io
    }

    /// Takes the coroutine out for polling.
    pub(crate) fn take_coroutine(&self) -> Option<Pin<Box<Operation>>> {
        self.coroutine.lock().expect("coroutine lock poisoned").take()
    }

    /// Puts the coroutine back after a poll returned pending.
    pub(crate) fn put_coroutine(&self, coroutine: Pin<Box<Operation>>) {
        *self.coroutine.lock().expect("coroutine lock poisoned") = Some(coroutine);
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl From<u64> for TaskId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<TaskId> for u64 {
    fn from(value: TaskId) -> Self {
        value.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        trace!("task({}:{}) delete", self.id, self.name);
        debug_assert_eq!(
            self.kernel_refs.load(Ordering::SeqCst),
            0,
            "task dropped with live kernel references"
        );
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        FdEvent,
        Task,
        TaskId,
        TaskState,
    };
    use ::anyhow::Result;

    fn dummy_task() -> Task {
        Task::new(TaskId(1), String::from("testing"), Box::pin(async {}))
    }

    #[test]
    fn wait_ids_increase_monotonically() -> Result<()> {
        let task: Task = dummy_task();
        let first: u32 = task.io().next_wait_id();
        let second: u32 = task.io().next_wait_id();
        crate::ensure_eq!(first + 1, second);
        crate::ensure_eq!(task.io().wait_id(), second);
        Ok(())
    }

    #[test]
    fn new_fd_event_reports_nothing() -> Result<()> {
        let entry: FdEvent = FdEvent::new(7, libc::EPOLLIN as u32);
        crate::ensure_eq!(entry.fd(), 7);
        crate::ensure_eq!(entry.events(), libc::EPOLLIN as u32);
        crate::ensure_eq!(entry.revents(), 0);
        Ok(())
    }

    #[test]
    fn state_transitions_round_trip() -> Result<()> {
        let task: Task = dummy_task();
        crate::ensure_eq!(task.state(), TaskState::Runnable);
        task.set_state(TaskState::IoBlocked);
        crate::ensure_eq!(task.state(), TaskState::IoBlocked);
        task.set_state(TaskState::Done);
        crate::ensure_eq!(task.state(), TaskState::Done);
        Ok(())
    }

    #[test]
    fn reference_audit_balances() -> Result<()> {
        let task: Task = dummy_task();
        task.increment_ref();
        task.increment_ref();
        crate::ensure_eq!(task.kernel_refs(), 2);
        task.decrement_ref();
        task.decrement_ref();
        crate::ensure_eq!(task.kernel_refs(), 0);
        Ok(())
    }
}
