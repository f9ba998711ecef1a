// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The I/O-wait engine.
//!
//! Tasks suspend into the engine through [io_wait], the scheduler installs
//! their kernel registrations through [IoWait::park], and every resume path
//! (readiness, timeout, external cancellation) funnels through
//! [IoWait::cancel], which guarantees that each wait wakes its task exactly
//! once. [IoWait::wait_loop] is the single-reader drain of the timer manager
//! and the split read/write epoll instances.
//!
//! Registration lifetime discipline: installing a registration leaks one
//! strong count on the owning task and one on its wait set, so the raw cookie
//! handed to the kernel can never outlive the memory it points into. Whoever
//! removes a registration from the kernel queues the paired releases on a
//! reclaim list; the list is dropped only while the loop mutex is held, which
//! is also the only place cookies coming back from `epoll_wait` are
//! dereferenced.

mod epoll;

pub use self::epoll::EpollType;

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    config::Config,
    iowait::epoll::EpollSet,
    runtime::{
        current_task,
        limits::TIMER_BATCH_SIZE,
        task::{
            EpollCookie,
            FdEvent,
            Task,
            TaskId,
            TaskRef,
            TaskState,
            WaitResult,
            WaitSet,
        },
        timer::{
            TimerId,
            TimerManager,
            TimerWake,
        },
        RunQueue,
    },
};
use ::arrayvec::ArrayVec;
use ::libc::c_int;
use ::std::{
    collections::{
        HashMap,
        HashSet,
    },
    future::Future,
    mem,
    pin::Pin,
    sync::{
        atomic::{
            AtomicU64,
            Ordering,
        },
        Arc,
        Mutex,
        MutexGuard,
        TryLockError,
    },
    task::{
        Context,
        Poll,
    },
    time::Duration,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// A deferred release of an allocation that a kernel cookie may still point
/// into. Dropped only while the loop mutex is held.
enum Reclaim {
    Task(TaskRef),
    WaitSet(Arc<WaitSet>),
}

/// State owned by whichever thread currently runs the wait loop. The mutex
/// around this is the loop mutex: it makes the loop single-reader, defers the
/// reclaim sweep to a safe point, and keeps the event buffer off the stack.
struct LoopState {
    /// Number of wait-loop passes, for trace output.
    loop_index: u64,
    /// Reusable `epoll_wait` output buffer.
    events: Vec<libc::epoll_event>,
    /// Tasks made ready by the current pass, deduplicated by task identity.
    /// Dispatch is deferred until both epoll instances are drained so the
    /// ready count covers the whole batch.
    ready: HashMap<TaskId, (TaskRef, u32)>,
}

/// The I/O-wait engine. One per scheduling domain.
pub struct IoWait {
    /// Split read/write epoll instances.
    epoll: EpollSet,
    /// Pending wait timeouts.
    timers: TimerManager,
    /// Tasks currently parked on the engine. Membership is the authoritative
    /// "not yet woken" answer: a resume path wins by removing the task.
    parked: Mutex<HashSet<TaskId>>,
    /// Expired timeouts collected by any thread, run by the loop holder.
    timeout_list: Mutex<Vec<TimerWake>>,
    /// Deferred releases, swept under the loop mutex.
    reclaim: Mutex<Vec<Reclaim>>,
    /// The loop mutex and the state it protects.
    loop_state: Mutex<LoopState>,
    /// Adaptive epoll wait time in milliseconds.
    epollwait_ms: AtomicU64,
    /// Cap for the adaptive wait time.
    max_sleep_ms: u64,
    /// Where woken tasks go, supplied by the owning scheduler.
    run_queue: Arc<RunQueue>,
}

/// Future returned by [io_wait]: parks the calling task on its first poll and
/// reports the wait's outcome on the second.
pub struct IoWaitFuture {
    fds: Option<Vec<FdEvent>>,
    timeout_ms: i64,
    yielded: bool,
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Suspends the current task until one of `fds` becomes ready, `timeout_ms`
/// elapses, or the wait is cancelled. A timeout of -1 waits forever; 0
/// degenerates to a poll. Outside task context this completes immediately
/// with an empty result.
pub fn io_wait(fds: Vec<FdEvent>, timeout_ms: i64) -> IoWaitFuture {
    IoWaitFuture {
        fds: Some(fds),
        timeout_ms,
        yielded: false,
    }
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl IoWait {
    pub fn new(config: &Config, run_queue: Arc<RunQueue>) -> Self {
        Self {
            epoll: EpollSet::new(config.epoll_event_size),
            timers: TimerManager::default(),
            parked: Mutex::new(HashSet::new()),
            timeout_list: Mutex::new(Vec::new()),
            reclaim: Mutex::new(Vec::new()),
            loop_state: Mutex::new(LoopState {
                loop_index: 0,
                events: Vec::with_capacity(config.epoll_event_size),
                ready: HashMap::new(),
            }),
            epollwait_ms: AtomicU64::new(0),
            max_sleep_ms: config.max_sleep_ms,
            run_queue,
        }
    }

    /// Installs the kernel registrations for a task that just suspended into
    /// the engine, and arms its timeout. Runs on the scheduler, never on the
    /// task itself, so the task is fully quiescent before the kernel ever
    /// sees a cookie pointing at it.
    pub fn park(&self, task: &TaskRef) {
        let io = task.io();
        let wait_set: Arc<WaitSet> = io.wait_set().expect("io-blocked task should have a wait set");

        let _fanout: Option<MutexGuard<()>> = if wait_set.fds().len() > 1 {
            Some(io.fanout_lock().lock().expect("fan-out lock poisoned"))
        } else {
            None
        };

        // Re-read the wait id under the lock: a registration installed early
        // in the loop below can trigger on another thread and start the next
        // wait before this one finishes registering.
        let wait_id: u32 = io.wait_id();

        // Park before the first registration so a wake delivered on a peer
        // thread mid-loop still finds the task here. The `task` borrow keeps
        // it alive through the body.
        self.parked.lock().expect("parked set lock poisoned").insert(task.id());

        let mut ok: bool = false;
        let mut rollback: Vec<(c_int, u32)> = Vec::with_capacity(wait_set.fds().len());
        for entry in wait_set.fds() {
            let epoll_type: EpollType = self.epoll.choose(entry.events());
            let events: u32 = entry.events() | libc::EPOLLONESHOT as u32;
            // Acquire before the add so a registration that triggers
            // immediately on a peer thread cannot release the last reference
            // out from under us.
            self.acquire_registration(task, &wait_set);
            match self.epoll.register(epoll_type, entry.fd(), events, entry.cookie_ptr() as u64) {
                Ok(()) => {
                    trace!(
                        "task({}) add fd={:?} into epoll({}) id={:?}",
                        task.id(),
                        entry.fd(),
                        epoll_type.name(),
                        wait_id
                    );
                    ok = true;
                    rollback.push((entry.fd(), entry.events()));
                },
                Err(fail) if fail.errno == libc::EEXIST => {
                    self.revoke_registration(task, &wait_set);
                    debug!("task({}) {:?}, rolling back", task.id(), fail);
                    for (fd, events) in rollback.drain(..) {
                        let rollback_type: EpollType = self.epoll.choose(events);
                        if self.epoll.unregister(rollback_type, fd).is_ok() {
                            // Only the actor that removed a registration may
                            // release it.
                            self.release_registration(task, &wait_set);
                            trace!("task({}) rollback fd={:?}", task.id(), fd);
                        }
                    }
                    ok = false;
                    break;
                },
                Err(fail) => {
                    // Skip this descriptor and keep going, the way poll()
                    // tolerates bad descriptors.
                    self.revoke_registration(task, &wait_set);
                    warn!("task({}) {:?}", task.id(), fail);
                    continue;
                },
            }
        }

        if !ok {
            // Nothing registered: hand the task straight back, it wakes with
            // a zero ready count.
            if self.parked.lock().expect("parked set lock poisoned").remove(&task.id()) {
                task.set_state(TaskState::Runnable);
                self.run_queue.push(task.clone());
            }
        } else {
            let timeout_ms: i64 = io.timeout_ms();
            if timeout_ms != -1 {
                task.increment_ref();
                let timer_id: TimerId = self.timers.expire_at(Duration::from_millis(timeout_ms.max(0) as u64), TimerWake {
                    task: task.clone(),
                    wait_id,
                });
                io.set_timer(Some(timer_id));
                trace!("task({}) armed timeout {:?}ms id={:?}", task.id(), timeout_ms, wait_id);
            }
        }
    }

    /// The wake arbitrator. Wakes `task` iff `wait_id` still names its
    /// current wait and this call is the one that removes it from the parked
    /// set; every other caller returns without effect. The winner tears down
    /// the wait's kernel registrations and re-queues the task.
    pub fn cancel(&self, task: &TaskRef, wait_id: u32) {
        if task.io().wait_id() != wait_id {
            trace!(
                "task({}) stale wake dropped: id={:?} current={:?}",
                task.id(),
                wait_id,
                task.io().wait_id()
            );
            return;
        }
        if !self.parked.lock().expect("parked set lock poisoned").remove(&task.id()) {
            return;
        }
        trace!("task({}:{}) io wakeup id={:?}", task.id(), task.name(), wait_id);

        let wait_set: Arc<WaitSet> = task.io().wait_set().expect("parked task should have a wait set");
        let _fanout: Option<MutexGuard<()>> = if wait_set.fds().len() > 1 {
            Some(task.io().fanout_lock().lock().expect("fan-out lock poisoned"))
        } else {
            None
        };

        for entry in wait_set.fds() {
            let epoll_type: EpollType = self.epoll.choose(entry.events());
            // A failed removal means a peer already removed this registration
            // (or a concurrent one-shot delivery beat us to it) and owns its
            // release; a successful one makes this call the owner.
            if self.epoll.unregister(epoll_type, entry.fd()).is_ok() {
                self.release_registration(task, &wait_set);
                trace!("task({}) clear fd={:?} from epoll({})", task.id(), entry.fd(), epoll_type.name());
            }
        }

        task.set_state(TaskState::Runnable);
        self.run_queue.push(task.clone());
    }

    /// One pass over the engine: drain expired timers, poll both epoll
    /// instances, dispatch wakes, run collected timeouts, and sweep deferred
    /// releases. Returns the number of events dispatched, or -1 when another
    /// thread already holds the loop and no timer made progress.
    pub fn wait_loop(&self, enable_block: bool) -> i64 {
        // Collect expired timers in bounded batches. This happens outside the
        // loop mutex so timers keep draining while a peer polls epoll; the
        // wakes themselves run later, under the mutex.
        let mut timer_count: i64 = 0;
        loop {
            let mut batch: ArrayVec<TimerWake, TIMER_BATCH_SIZE> = ArrayVec::new();
            if self.timers.get_expired(&mut batch) == 0 {
                break;
            }
            timer_count += batch.len() as i64;
            self.timeout_list.lock().expect("timeout list lock poisoned").extend(batch);
        }

        let mut state = match self.loop_state.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return if timer_count > 0 { timer_count } else { -1 },
            Err(TryLockError::Poisoned(_)) => panic!("loop mutex poisoned"),
        };
        state.loop_index += 1;
        let loop_index: u64 = state.loop_index;

        self.epoll.ensure_created();

        let mut epoll_count: i64 = 0;
        let LoopState { events, ready, .. } = &mut *state;
        for epoll_type in EpollType::ALL {
            // Block only on the read instance, and only when no timer already
            // produced work; the write instance is always drained non-blocking.
            let timeout_ms: c_int = if enable_block && epoll_type == EpollType::Read && timer_count == 0 {
                self.epollwait_ms.load(Ordering::SeqCst) as c_int
            } else {
                0
            };
            let n: usize = match self.epoll.wait(epoll_type, events, timeout_ms) {
                Ok(n) => n,
                Err(fail) => {
                    warn!("{:?}", fail);
                    continue;
                },
            };
            epoll_count += n as i64;

            for event in events.iter() {
                let cookie: *const EpollCookie = event.u64 as *const EpollCookie;
                // The registration behind this cookie still holds strong
                // counts on the task and wait set (releases are deferred to
                // the sweep below, which only runs under this mutex), so the
                // dereferences cannot race a free.
                unsafe {
                    (*cookie).reported.store(event.events, Ordering::Release);
                    let cookie_wait_id: u32 = (*cookie).wait_id.load(Ordering::Acquire);
                    let task_ptr: *const Task = (*cookie).task.load(Ordering::Acquire) as *const Task;
                    Arc::increment_strong_count(task_ptr);
                    let task: TaskRef = Arc::from_raw(task_ptr);
                    task.io().increment_ready_count();
                    trace!(
                        "task({}) epoll({}) trigger fd={:?} id={:?} loop_index={:?}",
                        task.id(),
                        epoll_type.name(),
                        (*(*cookie).parent.load(Ordering::Acquire)).fd(),
                        cookie_wait_id,
                        loop_index
                    );
                    // Collect now, dispatch after both instances are drained,
                    // so the ready count covers the whole batch before the
                    // task can run again.
                    ready.entry(task.id()).or_insert((task, cookie_wait_id));
                }
            }
        }

        for (_, (task, wait_id)) in ready.drain() {
            self.cancel(&task, wait_id);
        }

        // Run the timeouts collected by any thread since the last pass. A
        // stale one falls out of the arbitrator's id check.
        let pending: Vec<TimerWake> = mem::take(&mut *self.timeout_list.lock().expect("timeout list lock poisoned"));
        for wake in pending {
            trace!("task({}) io timeout id={:?}", wake.task.id(), wake.wait_id);
            self.cancel(&wake.task, wake.wait_id);
            // Consuming the wake releases the reference transferred when the
            // timer was armed.
            wake.task.decrement_ref();
        }

        // Free retired tasks and wait sets. Cookies observed by epoll_wait
        // above may point into them, so the sweep never runs outside the loop
        // mutex.
        let garbage: Vec<Reclaim> = mem::take(&mut *self.reclaim.lock().expect("reclaim lock poisoned"));
        drop(garbage);

        epoll_count + timer_count
    }

    /// Grows the epoll wait time by one millisecond, up to the configured
    /// cap. The scheduler calls this when it runs out of runnable work.
    pub fn delay_event_wait_time(&self) {
        let max_sleep_ms: u64 = self.max_sleep_ms;
        let _ = self
            .epollwait_ms
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |ms| Some((ms + 1).min(max_sleep_ms)));
    }

    /// Resets the epoll wait time to zero. The scheduler calls this when
    /// runnable work shows up.
    pub fn reset_event_wait_time(&self) {
        self.epollwait_ms.store(0, Ordering::SeqCst);
    }

    /// Whether the task is currently parked on the engine.
    pub fn is_parked(&self, id: TaskId) -> bool {
        self.parked.lock().expect("parked set lock poisoned").contains(&id)
    }

    /// Number of armed timers.
    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    /// Raw descriptor of one of the epoll instances.
    pub fn epoll_descriptor(&self, epoll_type: EpollType) -> c_int {
        self.epoll.get(epoll_type)
    }

    /// Whether this process owns live epoll descriptors.
    pub fn is_epoll_created(&self) -> bool {
        self.epoll.is_created()
    }

    /// Accounts for a registration about to be installed: one audited kernel
    /// reference, plus leaked strong counts that keep the task and the wait
    /// set (and therefore the kernel cookie) alive.
    fn acquire_registration(&self, task: &TaskRef, wait_set: &Arc<WaitSet>) {
        task.increment_ref();
        unsafe {
            Arc::increment_strong_count(Arc::as_ptr(task));
            Arc::increment_strong_count(Arc::as_ptr(wait_set));
        }
    }

    /// Undoes [Self::acquire_registration] for a registration that never made
    /// it into the kernel. No cookie exists yet, so the counts drop inline.
    fn revoke_registration(&self, task: &TaskRef, wait_set: &Arc<WaitSet>) {
        task.decrement_ref();
        unsafe {
            Arc::decrement_strong_count(Arc::as_ptr(task));
            Arc::decrement_strong_count(Arc::as_ptr(wait_set));
        }
    }

    /// Releases a registration that was removed from the kernel. A cookie for
    /// it may still sit in a peer's `epoll_wait` batch, so the drops are
    /// queued for the reclaim sweep instead of happening here.
    fn release_registration(&self, task: &TaskRef, wait_set: &Arc<WaitSet>) {
        task.decrement_ref();
        let task_ref: TaskRef = unsafe { Arc::from_raw(Arc::as_ptr(task)) };
        let wait_set_ref: Arc<WaitSet> = unsafe { Arc::from_raw(Arc::as_ptr(wait_set)) };
        let mut reclaim = self.reclaim.lock().expect("reclaim lock poisoned");
        reclaim.push(Reclaim::Task(task_ref));
        reclaim.push(Reclaim::WaitSet(wait_set_ref));
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Future for IoWaitFuture {
    type Output = WaitResult;

    fn poll(self: Pin<&mut Self>, _context: &mut Context) -> Poll<WaitResult> {
        let self_: &mut Self = self.get_mut();
        let task: TaskRef = match current_task() {
            Some(task) => task,
            None => return Poll::Ready(WaitResult::empty()),
        };

        if !self_.yielded {
            let fds: Vec<FdEvent> = self_.fds.take().expect("descriptors are consumed on first poll");
            let io = task.io();
            let wait_id: u32 = io.next_wait_id();
            task.set_state(TaskState::IoBlocked);
            io.reset_ready_count();
            io.set_timeout_ms(self_.timeout_ms);
            io.set_timer(None);

            let nfds: usize = fds.len();
            let wait_set: Arc<WaitSet> = Arc::new(WaitSet::new(fds));
            for entry in wait_set.fds() {
                entry.bind_cookie(Arc::as_ptr(&task), wait_id);
            }
            io.install_wait_set(wait_set);

            trace!(
                "task({}:{}) io wait id={:?} nfds={:?} timeout={:?}",
                task.id(),
                task.name(),
                wait_id,
                nfds,
                self_.timeout_ms
            );
            self_.yielded = true;
            // No kernel calls happen here; the scheduler installs the
            // registrations once the task has fully suspended.
            Poll::Pending
        } else {
            Poll::Ready(WaitResult {
                ready: task.io().ready_count(),
                fds: task.io().wait_set(),
            })
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
