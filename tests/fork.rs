// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Fork-safety test. Kept in its own test binary so the forked child never
//! coexists with unrelated test threads.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::catwait::{
    io_wait,
    Config,
    FdEvent,
    Scheduler,
    WaitResult,
};
use ::libc::c_int;
use ::std::{
    sync::{
        Arc,
        Mutex,
    },
    time::Duration,
};

//======================================================================================================================
// Helper Functions
//======================================================================================================================

fn make_pipe() -> (c_int, c_int) {
    let mut fds: [c_int; 2] = [0; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0, "pipe() failed");
    (fds[0], fds[1])
}

/// Runs one full park/ready/resume cycle on the scheduler and reports whether
/// the wait woke with exactly one ready descriptor.
fn run_wait_cycle(scheduler: &Scheduler) -> bool {
    let (rx, tx): (c_int, c_int) = make_pipe();
    let results: Arc<Mutex<Vec<WaitResult>>> = Arc::new(Mutex::new(Vec::new()));
    let results2: Arc<Mutex<Vec<WaitResult>>> = results.clone();
    scheduler.insert_coroutine("cycle", Box::pin(async move {
        let result: WaitResult = io_wait(vec![FdEvent::new(rx, libc::EPOLLIN as u32)], -1).await;
        results2.lock().unwrap().push(result);
    }));

    if !scheduler.poll_next() {
        return false;
    }
    let byte: [u8; 1] = [0x78];
    if unsafe { libc::write(tx, byte.as_ptr() as *const libc::c_void, 1) } != 1 {
        return false;
    }
    let mut dispatched: bool = false;
    for _ in 0..100 {
        if scheduler.wait_loop(false) > 0 {
            dispatched = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    if !dispatched || !scheduler.poll_next() {
        return false;
    }
    let woke: bool = matches!(results.lock().unwrap().as_slice(), [result] if result.ready == 1);

    unsafe { libc::close(rx) };
    unsafe { libc::close(tx) };
    woke
}

//======================================================================================================================
// Scenario Tests
//======================================================================================================================

/// After fork, the child's first use of the engine re-creates both epoll
/// descriptors and waits keep working, while the parent's descriptors stay
/// usable.
#[test]
fn fork_recreates_epoll_descriptors() -> Result<()> {
    let scheduler: Scheduler = Scheduler::new(Config::default());

    // Touch the engine so the parent owns live descriptors before forking.
    catwait::ensure_eq!(run_wait_cycle(&scheduler), true);

    match unsafe { libc::fork() } {
        0 => {
            // Child: the inherited descriptors belong to the parent's pid, so
            // the first engine touch must re-create them.
            let mut ok: bool = !scheduler.iowait().is_epoll_created();
            ok = ok && run_wait_cycle(&scheduler);
            ok = ok && scheduler.iowait().is_epoll_created();
            unsafe { libc::_exit(if ok { 0 } else { 1 }) };
        },
        child_pid if child_pid > 0 => {
            let mut status: c_int = -1;
            catwait::ensure_eq!(unsafe { libc::waitpid(child_pid, &mut status, 0) }, child_pid);
            catwait::ensure_eq!(libc::WIFEXITED(status), true);
            catwait::ensure_eq!(libc::WEXITSTATUS(status), 0);

            // The parent's own descriptors are unaffected by the child.
            catwait::ensure_eq!(run_wait_cycle(&scheduler), true);
        },
        _ => anyhow::bail!("fork() failed"),
    }
    Ok(())
}
