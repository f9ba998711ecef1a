// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::{
    last_errno,
    Fail,
};
use ::libc::c_int;
use ::std::sync::{
    atomic::{
        AtomicI32,
        Ordering,
    },
    Mutex,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Which of the two epoll instances a registration targets. Read interest
/// goes to one instance, everything else to the other, so the wait loop can
/// block on one direction while draining the other without starving it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EpollType {
    Read = 0,
    Write = 1,
}

/// The split read/write epoll descriptors, created lazily and re-created in a
/// child process after fork.
pub struct EpollSet {
    /// The two epoll descriptors, -1 while not yet created.
    fds: [AtomicI32; 2],
    /// Process that created the descriptors. A mismatch with the current pid
    /// means we are a forked child holding stale descriptors.
    owner_pid: AtomicI32,
    /// Serializes creation so exactly one thread re-creates after fork.
    create_lock: Mutex<()>,
    /// Size hint handed to `epoll_create`.
    event_size: usize,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl EpollType {
    /// Both instances, in drain order.
    pub const ALL: [EpollType; 2] = [EpollType::Read, EpollType::Write];

    /// Human-readable instance name for trace output.
    pub fn name(&self) -> &'static str {
        match self {
            EpollType::Read => "read",
            EpollType::Write => "write",
        }
    }
}

impl EpollSet {
    pub fn new(event_size: usize) -> Self {
        Self {
            fds: [AtomicI32::new(-1), AtomicI32::new(-1)],
            owner_pid: AtomicI32::new(0),
            create_lock: Mutex::new(()),
            event_size,
        }
    }

    /// Whether this process owns live epoll descriptors.
    pub fn is_created(&self) -> bool {
        self.owner_pid.load(Ordering::SeqCst) == unsafe { libc::getpid() }
    }

    /// Creates the two epoll descriptors if this process does not own live
    /// ones yet. After fork, the child's first call lands here, closes the
    /// descriptors inherited from the parent, and creates fresh ones; the
    /// parent's own descriptors are unaffected. Creation failure is fatal.
    pub fn ensure_created(&self) {
        let pid: c_int = unsafe { libc::getpid() };
        if self.owner_pid.load(Ordering::SeqCst) == pid {
            return;
        }
        let _guard = self.create_lock.lock().expect("epoll create lock poisoned");
        if self.owner_pid.load(Ordering::SeqCst) == pid {
            return;
        }

        for epoll_type in EpollType::ALL {
            let old: c_int = self.fds[epoll_type as usize].load(Ordering::SeqCst);
            if old >= 0 {
                unsafe { libc::close(old) };
            }
            // Linux ignores the size argument to epoll, it just has to be more than 0.
            let fd: c_int = unsafe { libc::epoll_create(self.event_size as c_int) };
            if fd == -1 {
                panic!("could not create epoll({}) descriptor: {:?}", epoll_type.name(), last_errno());
            }
            trace!("created epoll({}) descriptor: fd={:?}", epoll_type.name(), fd);
            self.fds[epoll_type as usize].store(fd, Ordering::SeqCst);
        }
        self.owner_pid.store(pid, Ordering::SeqCst);
    }

    /// The descriptor of the given epoll instance, creating both on first use.
    pub fn get(&self, epoll_type: EpollType) -> c_int {
        self.ensure_created();
        self.fds[epoll_type as usize].load(Ordering::SeqCst)
    }

    /// Picks the epoll instance for a registration with the given interest
    /// mask: read interest goes to the read instance, everything else to the
    /// write instance.
    pub fn choose(&self, events: u32) -> EpollType {
        if events & (libc::EPOLLIN as u32) != 0 {
            EpollType::Read
        } else {
            EpollType::Write
        }
    }

    /// Adds a registration for `fd` with the given event mask and cookie.
    pub fn register(&self, epoll_type: EpollType, fd: c_int, events: u32, cookie: u64) -> Result<(), Fail> {
        let mut event: libc::epoll_event = libc::epoll_event { events, u64: cookie };
        match unsafe { libc::epoll_ctl(self.get(epoll_type), libc::EPOLL_CTL_ADD, fd, &mut event) } {
            0 => Ok(()),
            _ => {
                let errno: c_int = last_errno();
                let cause: String = format!("failed to add fd={:?} to epoll({})", fd, epoll_type.name());
                Err(Fail::new(errno, &cause))
            },
        }
    }

    /// Removes the registration for `fd`, if it is still installed.
    pub fn unregister(&self, epoll_type: EpollType, fd: c_int) -> Result<(), Fail> {
        match unsafe { libc::epoll_ctl(self.get(epoll_type), libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) } {
            0 => Ok(()),
            _ => {
                let errno: c_int = last_errno();
                let cause: String = format!("failed to remove fd={:?} from epoll({})", fd, epoll_type.name());
                Err(Fail::new(errno, &cause))
            },
        }
    }

    /// Polls one instance into `events`, retrying on EINTR. On success the
    /// buffer length is set to the number of reported events.
    pub fn wait(&self, epoll_type: EpollType, events: &mut Vec<libc::epoll_event>, timeout_ms: c_int) -> Result<usize, Fail> {
        let epoll_fd: c_int = self.get(epoll_type);
        loop {
            let n: c_int =
                unsafe { libc::epoll_wait(epoll_fd, events.as_mut_ptr(), events.capacity() as c_int, timeout_ms) };
            if n >= 0 {
                unsafe { events.set_len(n as usize) };
                return Ok(n as usize);
            }
            let errno: c_int = last_errno();
            if errno == libc::EINTR {
                continue;
            }
            let cause: String = format!("epoll_wait({}) failed", epoll_type.name());
            return Err(Fail::new(errno, &cause));
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for EpollSet {
    fn drop(&mut self) {
        for epoll_type in EpollType::ALL {
            let fd: c_int = self.fds[epoll_type as usize].load(Ordering::SeqCst);
            if fd >= 0 {
                match unsafe { libc::close(fd) } {
                    0 => (),
                    _ => warn!("epoll({}) descriptor already closed", epoll_type.name()),
                }
            }
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        EpollSet,
        EpollType,
    };
    use ::anyhow::Result;

    #[test]
    fn creation_is_lazy() -> Result<()> {
        let epoll: EpollSet = EpollSet::new(16);
        crate::ensure_eq!(epoll.is_created(), false);

        let read_fd: libc::c_int = epoll.get(EpollType::Read);
        let write_fd: libc::c_int = epoll.get(EpollType::Write);
        crate::ensure_eq!(epoll.is_created(), true);
        crate::ensure_eq!(read_fd >= 0, true);
        crate::ensure_eq!(write_fd >= 0, true);
        crate::ensure_neq!(read_fd, write_fd);
        Ok(())
    }

    #[test]
    fn read_interest_picks_the_read_instance() -> Result<()> {
        let epoll: EpollSet = EpollSet::new(16);
        crate::ensure_eq!(epoll.choose(libc::EPOLLIN as u32), EpollType::Read);
        crate::ensure_eq!(epoll.choose((libc::EPOLLIN | libc::EPOLLOUT) as u32), EpollType::Read);
        crate::ensure_eq!(epoll.choose(libc::EPOLLOUT as u32), EpollType::Write);
        Ok(())
    }
}
