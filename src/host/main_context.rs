//! The foreign side's single-threaded cooperative scheduler.
//!
//! Everything the loaded plugin might do that is not thread safe has to
//! happen on the thread that owns the foreign UI message pump. The main
//! context runs on that thread: other threads post work through a
//! [`MainContextHandle`], and between tasks the context ticks the event pump
//! at the configured UI frame interval.

use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use plugbridge_core::config::DEFAULT_FRAME_RATE;

enum MainThreadTask {
    Run(Box<dyn FnOnce() + Send>),
    Stop,
}

struct ContextShared {
    /// The pump interval in microseconds. Instances can only narrow it; the
    /// context keeps the minimum of everything requested.
    timer_interval_us: AtomicU64,
}

pub struct MainContext {
    tasks_tx: Sender<MainThreadTask>,
    tasks_rx: Receiver<MainThreadTask>,
    shared: Arc<ContextShared>,

    /// The installed event pump and its gate, if any. Only the main thread
    /// ever runs it, but the group worker shares the context across threads,
    /// so the slot itself has to be lockable.
    event_pump: Mutex<Option<EventPump>>,
}

struct EventPump {
    pump: Box<dyn FnMut() + Send>,
    allow: Box<dyn Fn() -> bool + Send>,
}

impl Default for MainContext {
    fn default() -> Self {
        Self::new()
    }
}

impl MainContext {
    pub fn new() -> Self {
        let (tasks_tx, tasks_rx) = crossbeam_channel::unbounded();
        let default_interval = Duration::from_secs_f64(1.0 / f64::from(DEFAULT_FRAME_RATE));

        Self {
            tasks_tx,
            tasks_rx,
            shared: Arc::new(ContextShared {
                timer_interval_us: AtomicU64::new(default_interval.as_micros() as u64),
            }),
            event_pump: Mutex::new(None),
        }
    }

    /// A cloneable, `Send` handle for posting work onto this context.
    pub fn handle(&self) -> MainContextHandle {
        MainContextHandle { tasks_tx: self.tasks_tx.clone(), shared: Arc::clone(&self.shared) }
    }

    /// Install the event pump: `pump` runs once per timer tick, but only
    /// while `allow()` returns true. The gate is how half-constructed
    /// plugins are protected from message-pump reentrancy during their init
    /// and terminate windows.
    pub fn async_handle_events(
        &self,
        pump: impl FnMut() + Send + 'static,
        allow: impl Fn() -> bool + Send + 'static,
    ) {
        *self.event_pump.lock().unwrap_or_else(|e| e.into_inner()) =
            Some(EventPump { pump: Box::new(pump), allow: Box::new(allow) });
    }

    /// Run tasks and tick the event pump until [`MainContextHandle::stop`]
    /// gets called. Must run on the thread that created the context; plugin
    /// code ends up being called from inside this loop.
    pub fn run(&self) {
        loop {
            let interval =
                Duration::from_micros(self.shared.timer_interval_us.load(Ordering::Relaxed));

            match self.tasks_rx.recv_timeout(interval) {
                Ok(MainThreadTask::Run(task)) => task(),
                Ok(MainThreadTask::Stop) => break,
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    let mut event_pump =
                        self.event_pump.lock().unwrap_or_else(|e| e.into_inner());
                    if let Some(EventPump { pump, allow }) = event_pump.as_mut() {
                        if allow() {
                            pump();
                        }
                    }
                }
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }
        }

        // Drain whatever was posted before the stop so no caller blocks on a
        // result that will never come
        while let Ok(task) = self.tasks_rx.try_recv() {
            if let MainThreadTask::Run(task) = task {
                task();
            }
        }
    }
}

#[derive(Clone)]
pub struct MainContextHandle {
    tasks_tx: Sender<MainThreadTask>,
    shared: Arc<ContextShared>,
}

impl MainContextHandle {
    /// Post `f` onto the main thread. Returns a handle to wait for its
    /// result.
    pub fn run_in_context<R, F>(&self, f: F) -> MainThreadHandle<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let (result_tx, result_rx) = crossbeam_channel::bounded(1);

        let posted = self.tasks_tx.send(MainThreadTask::Run(Box::new(move || {
            let _ = result_tx.send(f());
        })));

        MainThreadHandle { result_rx, posted: posted.is_ok() }
    }

    /// Narrow the pump interval. Requests for a slower rate than the current
    /// one are ignored; the context always runs at the fastest rate any
    /// instance asked for.
    pub fn update_timer_interval(&self, interval: Duration) {
        let new_us = interval.as_micros() as u64;
        self.shared.timer_interval_us.fetch_min(new_us, Ordering::Relaxed);
    }

    /// Make `run()` return once the tasks posted before this have drained.
    pub fn stop(&self) {
        let _ = self.tasks_tx.send(MainThreadTask::Stop);
    }
}

pub struct MainThreadHandle<R> {
    result_rx: Receiver<R>,
    posted: bool,
}

impl<R> MainThreadHandle<R> {
    /// Block until the main thread ran the task. Returns `None` when the
    /// context shut down before getting to it.
    pub fn wait(self) -> Option<R> {
        if !self.posted {
            return None;
        }

        self.result_rx.recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn tasks_run_on_the_context_thread() {
        let context = MainContext::new();
        let handle = context.handle();

        let context_thread = std::thread::current().id();
        let poster = std::thread::spawn(move || {
            let ran_on = handle.run_in_context(|| std::thread::current().id()).wait();
            handle.stop();
            ran_on
        });

        context.run();
        assert_eq!(poster.join().unwrap(), Some(context_thread));
    }

    #[test]
    fn event_pump_is_gated() {
        let context = MainContext::new();
        let handle = context.handle();
        handle.update_timer_interval(Duration::from_millis(1));

        let ticks = Arc::new(AtomicU32::new(0));
        let gate_open = Arc::new(std::sync::atomic::AtomicBool::new(false));

        {
            let ticks = Arc::clone(&ticks);
            let gate_open = Arc::clone(&gate_open);
            context.async_handle_events(
                move || {
                    ticks.fetch_add(1, Ordering::SeqCst);
                },
                move || gate_open.load(Ordering::SeqCst),
            );
        }

        let stopper = {
            let handle = handle.clone();
            let gate_open = Arc::clone(&gate_open);
            std::thread::spawn(move || {
                // Closed gate: no ticks should accumulate
                std::thread::sleep(Duration::from_millis(30));
                gate_open.store(true, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(30));
                handle.stop();
            })
        };

        context.run();
        stopper.join().unwrap();

        assert!(ticks.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn timer_interval_keeps_the_minimum() {
        let context = MainContext::new();
        let handle = context.handle();

        handle.update_timer_interval(Duration::from_millis(5));
        handle.update_timer_interval(Duration::from_millis(50));

        assert_eq!(context.shared.timer_interval_us.load(Ordering::Relaxed), 5_000);
    }
}
