// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Timer manager for wait timeouts.
//!
//! Timeouts are plain `{task, wait_id}` aggregates rather than captured
//! closures: the wait loop pulls expired entries in bounded batches and routes
//! each one through the wake arbitrator itself.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    limits::TIMER_BATCH_SIZE,
    task::TaskRef,
};
use ::arrayvec::ArrayVec;
use ::core::cmp::Reverse;
use ::std::{
    collections::BinaryHeap,
    sync::Mutex,
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Handle to an armed timer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TimerId(pub u64);

/// A pending wake: which task to cancel and which wait the timeout was armed
/// for. Arming one transfers a kernel-held reference to the consumer.
pub struct TimerWake {
    /// Task to wake.
    pub task: TaskRef,
    /// Wait the timeout belongs to. A task that has moved on ignores it.
    pub wait_id: u32,
}

struct TimerQueueEntry {
    expiry: Instant,
    id: TimerId,
    wake: TimerWake,
}

struct TimerHeap {
    // Use a reverse to get a min heap.
    heap: BinaryHeap<Reverse<TimerQueueEntry>>,
    next_id: u64,
}

/// Timer manager holding the pending wait timeouts.
pub struct TimerManager {
    inner: Mutex<TimerHeap>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl TimerManager {
    /// Arms a timer that expires `delay` from now and returns its handle.
    pub fn expire_at(&self, delay: Duration, wake: TimerWake) -> TimerId {
        let mut inner = self.inner.lock().expect("timer lock poisoned");
        let id: TimerId = TimerId(inner.next_id);
        inner.next_id += 1;
        inner.heap.push(Reverse(TimerQueueEntry {
            expiry: Instant::now() + delay,
            id,
            wake,
        }));
        id
    }

    /// Removes expired timers into `out`, up to its remaining capacity, and
    /// returns how many were removed.
    pub fn get_expired(&self, out: &mut ArrayVec<TimerWake, TIMER_BATCH_SIZE>) -> usize {
        let now: Instant = Instant::now();
        let mut inner = self.inner.lock().expect("timer lock poisoned");
        let mut popped: usize = 0;
        while !out.is_full() {
            match inner.heap.peek() {
                Some(Reverse(entry)) if entry.expiry <= now => {
                    let entry: TimerQueueEntry = inner.heap.pop().expect("peeked entry should pop").0;
                    trace!("timer({}) expired for task({})", entry.id.0, entry.wake.task.id());
                    out.push(entry.wake);
                    popped += 1;
                },
                _ => break,
            }
        }
        popped
    }

    /// Number of armed timers.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("timer lock poisoned").heap.len()
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for TimerManager {
    fn default() -> Self {
        Self {
            inner: Mutex::new(TimerHeap {
                heap: BinaryHeap::new(),
                next_id: 0,
            }),
        }
    }
}

impl PartialEq for TimerQueueEntry {
    fn eq(&self, other: &TimerQueueEntry) -> bool {
        // This is technically not correct. However for the usage in this module
        // we only need to compare timers by expiration.
        self.expiry == other.expiry
    }
}

impl Eq for TimerQueueEntry {}

impl PartialOrd for TimerQueueEntry {
    fn partial_cmp(&self, other: &TimerQueueEntry) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerQueueEntry {
    fn cmp(&self, other: &TimerQueueEntry) -> core::cmp::Ordering {
        // Compare timer queue entries by expiration time.
        self.expiry.cmp(&other.expiry)
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        TimerManager,
        TimerWake,
    };
    use crate::runtime::{
        limits::TIMER_BATCH_SIZE,
        task::{
            Task,
            TaskId,
            TaskRef,
        },
    };
    use ::anyhow::Result;
    use ::arrayvec::ArrayVec;
    use ::std::{
        sync::Arc,
        time::Duration,
    };

    fn dummy_task(id: u64) -> TaskRef {
        Arc::new(Task::new(TaskId(id), String::from("testing"), Box::pin(async {})))
    }

    #[test]
    fn expired_timers_come_out_in_expiry_order() -> Result<()> {
        let manager: TimerManager = TimerManager::default();
        let late: TaskRef = dummy_task(1);
        let early: TaskRef = dummy_task(2);
        manager.expire_at(Duration::from_millis(5), TimerWake {
            task: late.clone(),
            wait_id: 1,
        });
        manager.expire_at(Duration::from_millis(0), TimerWake {
            task: early.clone(),
            wait_id: 1,
        });
        crate::ensure_eq!(manager.len(), 2);

        // Only the zero-delay timer has expired so far.
        let mut batch: ArrayVec<TimerWake, TIMER_BATCH_SIZE> = ArrayVec::new();
        manager.get_expired(&mut batch);
        crate::ensure_eq!(batch.len(), 1);
        crate::ensure_eq!(batch[0].task.id(), early.id());

        // After the longer delay passes, the second one comes out too.
        std::thread::sleep(Duration::from_millis(10));
        batch.clear();
        manager.get_expired(&mut batch);
        crate::ensure_eq!(batch.len(), 1);
        crate::ensure_eq!(batch[0].task.id(), late.id());
        crate::ensure_eq!(manager.len(), 0);
        Ok(())
    }

    #[test]
    fn get_expired_is_bounded_by_batch_capacity() -> Result<()> {
        let manager: TimerManager = TimerManager::default();
        let task: TaskRef = dummy_task(1);
        for _ in 0..TIMER_BATCH_SIZE + 1 {
            manager.expire_at(Duration::from_millis(0), TimerWake {
                task: task.clone(),
                wait_id: 1,
            });
        }

        let mut batch: ArrayVec<TimerWake, TIMER_BATCH_SIZE> = ArrayVec::new();
        crate::ensure_eq!(manager.get_expired(&mut batch), TIMER_BATCH_SIZE);
        crate::ensure_eq!(manager.len(), 1);

        batch.clear();
        crate::ensure_eq!(manager.get_expired(&mut batch), 1);
        crate::ensure_eq!(manager.len(), 0);
        Ok(())
    }
}
