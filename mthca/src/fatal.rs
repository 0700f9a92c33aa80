//! Catastrophic-error supervision.
//!
//! Each device runs one standing supervisor thread, parked on a channel.
//! A fatal signal (from an event queue interrupt or a command timeout)
//! only records the condition under a small dedicated lock and posts a
//! message. All heavy work (failing outstanding commands, halting the
//! device, notifying the client) happens on the supervisor thread, never
//! in the signaling context. Termination is an explicit message, and a
//! supervisor that never saw a fatal exits without touching the device.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{error, warn};

use crate::cmd::CommandChannel;
use crate::types::AsyncEvent;

/// Syndrome reported when the firmware error buffer is not mapped.
pub const GENERIC_SYNDROME: u32 = 0xffff_ffff;

/// Fatal sub-state of a device. Orthogonal to the lifecycle state and
/// persisting until a successful restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalState {
    /// No catastrophic condition observed.
    Clear,
    /// A fatal condition was signaled; the supervisor has not finished
    /// halting the device yet.
    Start,
    /// The device is halted. Only destroy and restart remain valid.
    Halted,
}

/// Fatal flag shared between the controller, signaling contexts, and the
/// supervisor thread. Guarded by its own lock so a fatal can be recorded
/// without waiting on the device lock.
#[derive(Debug)]
pub(crate) struct FatalShared {
    state: Mutex<FatalState>,
    halted_cv: Condvar,
}

impl FatalShared {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(FatalState::Clear),
            halted_cv: Condvar::new(),
        }
    }

    /// Record a fatal condition. Returns `true` only for the first call
    /// in this device lifetime.
    pub(crate) fn raise(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state == FatalState::Clear {
            *state = FatalState::Start;
            true
        } else {
            false
        }
    }

    pub(crate) fn get(&self) -> FatalState {
        *self.state.lock().unwrap()
    }

    pub(crate) fn is_fatal(&self) -> bool {
        self.get() != FatalState::Clear
    }

    fn set_halted(&self) {
        let mut state = self.state.lock().unwrap();
        *state = FatalState::Halted;
        self.halted_cv.notify_all();
    }

    /// Block until the supervisor finishes halting, or `timeout` expires.
    /// Returns `true` once halted.
    pub(crate) fn wait_halted(&self, timeout: Duration) -> bool {
        let state = self.state.lock().unwrap();
        let (state, result) = self
            .halted_cv
            .wait_timeout_while(state, timeout, |s| *s != FatalState::Halted)
            .unwrap();
        drop(state);
        !result.timed_out()
    }
}

enum Msg {
    Fatal,
    Shutdown,
}

/// Handle to the per-device supervisor thread.
pub(crate) struct FatalSupervisor {
    tx: Sender<Msg>,
    worker: Option<JoinHandle<()>>,
}

/// Callback slot for asynchronous device events.
pub(crate) type EventHandler = Arc<Mutex<Option<Box<dyn Fn(AsyncEvent) + Send>>>>;

impl FatalSupervisor {
    /// Spawn the supervisor for one device.
    ///
    /// `defer_halt` skips the halt register write, for configurations
    /// where an outer agent performs the halt.
    pub(crate) fn spawn(
        shared: Arc<FatalShared>,
        cmd: Arc<dyn CommandChannel>,
        handler: EventHandler,
        defer_halt: bool,
    ) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        let worker = thread::Builder::new()
            .name("mthca-catas".into())
            .spawn(move || Self::run(rx, shared, cmd, handler, defer_halt))?;
        Ok(Self {
            tx,
            worker: Some(worker),
        })
    }

    fn run(
        rx: Receiver<Msg>,
        shared: Arc<FatalShared>,
        cmd: Arc<dyn CommandChannel>,
        handler: EventHandler,
        defer_halt: bool,
    ) {
        let mut processed = false;
        while let Ok(msg) = rx.recv() {
            match msg {
                Msg::Shutdown => break,
                Msg::Fatal => {
                    // At most one fatal is processed per device lifetime.
                    if processed {
                        continue;
                    }
                    processed = true;
                    error!("catastrophic error, halting device");
                    cmd.fail_outstanding();
                    if !defer_halt {
                        cmd.halt();
                    }
                    shared.set_halted();
                    let syndrome = cmd.catas_syndrome().unwrap_or(GENERIC_SYNDROME);
                    if let Some(h) = handler.lock().unwrap().as_ref() {
                        h(AsyncEvent::CatastrophicError { syndrome });
                    }
                }
            }
        }
    }

    /// Wake the supervisor for a recorded fatal condition.
    pub(crate) fn notify_fatal(&self) {
        // A closed channel means the worker is already gone; the device
        // is being destroyed and the halt happens there.
        if self.tx.send(Msg::Fatal).is_err() {
            warn!("fatal signal after supervisor exit");
        }
    }

    /// Terminate the supervisor and join its thread.
    pub(crate) fn shutdown(mut self) {
        let _ = self.tx.send(Msg::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("fatal supervisor panicked");
            }
        }
    }
}
