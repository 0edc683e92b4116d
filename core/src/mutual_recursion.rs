//! Sending requests whose responses may be mutually recursive.
//!
//! Some protocol calls are legitimately re-entrant across the boundary: while
//! a request is still in flight, the peer may issue a call back to us that has
//! to be serviced *on the thread that sent the original request* (usually
//! because it touches main-thread-only state). Sending the request from the
//! calling thread and blocking on the response would deadlock those sequences.
//!
//! [`MutualRecursionHelper::fork`] sends the outbound call from a worker
//! thread instead, and turns the calling thread into a task executor until the
//! response arrives. Inbound work that must land on that thread is posted with
//! [`MutualRecursionHelper::handle`].

use crossbeam_channel::{Receiver, Sender};
use std::sync::{Condvar, Mutex};

enum ForkedTask {
    Run(Box<dyn FnOnce() + Send>),
    /// Posted by the worker when the forked function finished, unblocking the
    /// executing thread.
    Finished,
}

pub struct MutualRecursionHelper {
    /// The sender half of the currently active fork's task queue, if a fork
    /// is active. `handle()` posts through this while holding the lock, which
    /// guarantees that every posted task is either executed by the fork's
    /// executor loop or by the teardown drain.
    active_fork: Mutex<Option<Sender<ForkedTask>>>,
    /// Serializes forks: at most one may be active at a time.
    fork_finished: Condvar,
}

impl Default for MutualRecursionHelper {
    fn default() -> Self {
        Self::new()
    }
}

impl MutualRecursionHelper {
    pub fn new() -> Self {
        Self { active_fork: Mutex::new(None), fork_finished: Condvar::new() }
    }

    /// Run `f` on a worker thread while executing tasks posted with
    /// `handle()` on the calling thread, until `f` returns. `f`'s first act
    /// should be the outbound call that may provoke the re-entry.
    ///
    /// If another fork is already active the call blocks until it finishes.
    pub fn fork<R, F>(&self, f: F) -> R
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        let (task_tx, task_rx): (Sender<ForkedTask>, Receiver<ForkedTask>) =
            crossbeam_channel::unbounded();

        {
            let mut active_fork = self.active_fork.lock().unwrap_or_else(|e| e.into_inner());
            while active_fork.is_some() {
                active_fork =
                    self.fork_finished.wait(active_fork).unwrap_or_else(|e| e.into_inner());
            }
            *active_fork = Some(task_tx.clone());
        }

        // Wakes the executor loop when the worker finishes, including by
        // panic. Without the wakeup the executor would block on the queue
        // forever since the helper still holds a sender clone.
        struct FinishedGuard(Sender<ForkedTask>);

        impl Drop for FinishedGuard {
            fn drop(&mut self) {
                let _ = self.0.send(ForkedTask::Finished);
            }
        }

        let fork_result = std::thread::scope(|scope| {
            let worker = scope.spawn(move || {
                let _finished = FinishedGuard(task_tx);
                f()
            });

            // Act as the executor for inbound work until the worker finishes
            for task in &task_rx {
                match task {
                    ForkedTask::Run(task) => task(),
                    ForkedTask::Finished => break,
                }
            }

            worker.join()
        });

        // Deactivate, then run anything that was posted between the worker
        // finishing and the deactivation. `handle()` only posts while holding
        // the lock, so after this drain no task can be stranded. This runs
        // before a worker panic is propagated: a stale entry would wedge
        // every later fork and handle call on this helper.
        {
            let mut active_fork = self.active_fork.lock().unwrap_or_else(|e| e.into_inner());
            *active_fork = None;
        }
        while let Ok(task) = task_rx.try_recv() {
            if let ForkedTask::Run(task) = task {
                task();
            }
        }

        self.fork_finished.notify_one();

        match fork_result {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Run `g` on the forking thread if a fork is currently active, inline
    /// otherwise. Blocks until `g` has run either way, so its effects are
    /// observable by the caller when this returns.
    pub fn handle<R, G>(&self, g: G) -> R
    where
        R: Send,
        G: FnOnce() -> R + Send,
    {
        match self.handle_if_active(g) {
            Ok(result) => result,
            Err(g) => g(),
        }
    }

    /// Post `g` onto the active fork's executor and wait for its result, or
    /// hand `g` back when no fork is active so the caller can run it wherever
    /// it belongs (usually the main context).
    pub fn handle_if_active<R, G>(&self, g: G) -> Result<R, G>
    where
        R: Send,
        G: FnOnce() -> R + Send,
    {
        let (result_tx, result_rx) = crossbeam_channel::bounded(1);

        {
            let active_fork = self.active_fork.lock().unwrap_or_else(|e| e.into_inner());

            match active_fork.as_ref() {
                Some(task_tx) => {
                    let task: Box<dyn FnOnce() + Send + '_> = Box::new(move || {
                        let _ = result_tx.send(g());
                    });
                    // The borrows inside the task stay valid because we block
                    // on `result_rx` below before any of them can go away
                    let task: Box<dyn FnOnce() + Send + 'static> =
                        unsafe { std::mem::transmute(task) };

                    // Posting under the lock pairs with the teardown drain in
                    // `fork()`; the send itself cannot fail while the entry is
                    // still set
                    let _ = task_tx.send(ForkedTask::Run(task));
                }
                None => {
                    drop(active_fork);
                    return Err(g);
                }
            }
        }

        Ok(result_rx.recv().expect("forked task was dropped without running"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread::ThreadId;
    use std::time::Duration;

    #[test]
    fn fork_executes_posted_tasks_on_the_calling_thread() {
        let helper = Arc::new(MutualRecursionHelper::new());
        let forking_thread = std::thread::current().id();

        let (request_tx, request_rx) = crossbeam_channel::bounded::<()>(1);
        let observed = Arc::new(Mutex::new(None::<ThreadId>));

        let helper_clone = Arc::clone(&helper);
        let observed_clone = Arc::clone(&observed);
        let peer = std::thread::spawn(move || {
            request_rx.recv().unwrap();

            // The re-entrant callback: must run on the forking thread, and
            // its effect must be visible before `handle()` returns
            helper_clone.handle(|| {
                *observed_clone.lock().unwrap() = Some(std::thread::current().id());
            });
            assert!(observed_clone.lock().unwrap().is_some());
        });

        let response = helper.fork(|| {
            // The outbound call
            request_tx.send(()).unwrap();
            // Give the peer time to post the callback before we finish
            std::thread::sleep(Duration::from_millis(50));
            1234
        });

        assert_eq!(response, 1234);
        peer.join().unwrap();
        assert_eq!(*observed.lock().unwrap(), Some(forking_thread));
    }

    #[test]
    fn handle_without_active_fork_runs_inline() {
        let helper = MutualRecursionHelper::new();
        let caller = std::thread::current().id();

        let ran_on = helper.handle(std::thread::current).id();
        assert_eq!(ran_on, caller);
    }

    #[test]
    fn a_panicking_fork_does_not_wedge_the_helper() {
        let helper = MutualRecursionHelper::new();

        let panicked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            helper.fork::<(), _>(|| panic!("the plugin call blew up"));
        }));
        assert!(panicked.is_err());

        // The fork slot must have been cleared on the unwind path: later
        // forks run, and handle() falls back to running inline instead of
        // posting into a dead queue
        assert_eq!(helper.fork(|| 42), 42);
        assert_eq!(helper.handle(|| 7), 7);
    }

    #[test]
    fn forks_are_serialized() {
        let helper = Arc::new(MutualRecursionHelper::new());
        let in_fork = Arc::new(AtomicBool::new(false));

        let mut threads = Vec::new();
        for _ in 0..4 {
            let helper = Arc::clone(&helper);
            let in_fork = Arc::clone(&in_fork);
            threads.push(std::thread::spawn(move || {
                helper.fork(|| {
                    assert!(!in_fork.swap(true, Ordering::SeqCst));
                    std::thread::sleep(Duration::from_millis(10));
                    in_fork.store(false, Ordering::SeqCst);
                });
            }));
        }

        for thread in threads {
            thread.join().unwrap();
        }
    }
}
