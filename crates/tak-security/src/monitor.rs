// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Runtime integrity monitor: a single background thread that periodically
// runs the host's runtime checks and terminates the process on a violation.
//
// Order on a violation: violation sink (the session locks itself), pre-crash
// callback, terminator. All three run on the monitor thread.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use tak_bridge::HostEnvironment;
use tak_core::RuntimeCrashReason;
use tak_core::error::{Result, TakError};

/// Invoked synchronously on the monitor thread just before termination.
pub type PreCrashCallback = Arc<dyn Fn(RuntimeCrashReason) + Send + Sync>;
/// Notified first when a violation is detected.
pub type ViolationSink = Arc<dyn Fn(RuntimeCrashReason) + Send + Sync>;
/// Ends the process. Replaceable so tests survive a violation.
pub type Terminator = Arc<dyn Fn(RuntimeCrashReason) + Send + Sync>;

fn abort_process(reason: RuntimeCrashReason) {
    error!(%reason, "terminating process");
    std::process::abort();
}

struct Hooks {
    pre_crash: Mutex<Option<PreCrashCallback>>,
    sink: Mutex<Option<ViolationSink>>,
    terminator: Terminator,
    tripped: AtomicBool,
}

impl Hooks {
    fn fire(&self, reason: RuntimeCrashReason) {
        self.tripped.store(true, Ordering::SeqCst);
        error!(%reason, "runtime integrity violation");

        let sink = self.sink.lock().ok().and_then(|s| s.clone());
        if let Some(sink) = sink {
            sink(reason);
        }

        let callback = self.pre_crash.lock().ok().and_then(|c| c.clone());
        if let Some(callback) = callback {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(reason))).is_err() {
                warn!("pre-crash callback panicked");
            }
        }

        (self.terminator)(reason);
    }
}

/// Stop flag the worker waits on between ticks.
#[derive(Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    cv: Condvar,
}

impl StopSignal {
    fn raise(&self) {
        if let Ok(mut stopped) = self.stopped.lock() {
            *stopped = true;
        }
        self.cv.notify_all();
    }

    /// Sleep for `interval` unless stopped first. Returns `true` when the
    /// worker should exit.
    fn wait(&self, interval: Duration) -> bool {
        let Ok(guard) = self.stopped.lock() else {
            return true;
        };
        match self.cv.wait_timeout_while(guard, interval, |stopped| !*stopped) {
            Ok((stopped, _)) => *stopped,
            Err(_) => true,
        }
    }
}

struct Worker {
    handle: JoinHandle<()>,
    signal: Arc<StopSignal>,
}

impl Worker {
    fn is_alive(&self) -> bool {
        !self.handle.is_finished()
    }
}

#[derive(Default)]
struct MonitorState {
    /// Set while the monitor is expected to run.
    interval: Option<Duration>,
    worker: Option<Worker>,
}

/// Background runtime-integrity monitor. At most one worker thread exists.
pub struct RuntimeMonitor {
    host: Arc<dyn HostEnvironment>,
    min_interval: Duration,
    hooks: Arc<Hooks>,
    state: Mutex<MonitorState>,
}

impl RuntimeMonitor {
    /// Monitor that aborts the process on a violation.
    pub fn new(host: Arc<dyn HostEnvironment>, min_interval: Duration) -> Self {
        Self::with_terminator(host, min_interval, Arc::new(abort_process))
    }

    pub fn with_terminator(
        host: Arc<dyn HostEnvironment>,
        min_interval: Duration,
        terminator: Terminator,
    ) -> Self {
        Self {
            host,
            min_interval,
            hooks: Arc::new(Hooks {
                pre_crash: Mutex::new(None),
                sink: Mutex::new(None),
                terminator,
                tripped: AtomicBool::new(false),
            }),
            state: Mutex::new(MonitorState::default()),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Replace (or clear) the pre-crash callback. Takes effect on the next
    /// violation, even while running.
    pub fn set_pre_crash_callback(&self, callback: Option<PreCrashCallback>) -> Result<()> {
        *self.hooks.pre_crash.lock()? = callback;
        Ok(())
    }

    pub fn set_violation_sink(&self, sink: Option<ViolationSink>) -> Result<()> {
        *self.hooks.sink.lock()? = sink;
        Ok(())
    }

    /// Start monitoring every `interval_secs` seconds. Starting a running
    /// monitor is a successful no-op.
    pub fn start(&self, interval_secs: u64) -> Result<()> {
        let interval = Duration::from_secs(interval_secs);
        if interval < self.min_interval {
            return Err(TakError::invalid(format!(
                "monitor interval must be at least {} seconds, got {interval_secs}",
                self.min_interval.as_secs()
            )));
        }

        let mut state = self.state.lock()?;
        if state.worker.as_ref().is_some_and(Worker::is_alive) {
            debug!("runtime monitor already running");
            return Ok(());
        }
        self.hooks.tripped.store(false, Ordering::SeqCst);
        state.worker = Some(self.spawn(interval)?);
        state.interval = Some(interval);
        info!(interval_secs, "runtime monitor started");
        Ok(())
    }

    /// Stop and join the worker. Idempotent.
    pub fn stop(&self) -> Result<()> {
        let worker = {
            let mut state = self.state.lock()?;
            state.interval = None;
            state.worker.take()
        };
        let Some(worker) = worker else {
            return Ok(());
        };

        worker.signal.raise();
        // A callback running on the worker may call `stop` itself.
        if worker.handle.thread().id() != thread::current().id() && worker.handle.join().is_err() {
            warn!("runtime monitor thread had panicked");
        }
        info!("runtime monitor stopped");
        Ok(())
    }

    /// Whether the worker is alive. With `relaunch`, a monitor that should
    /// be running but whose thread died is restarted first.
    pub fn is_active(&self, relaunch: bool) -> Result<bool> {
        let mut state = self.state.lock()?;
        if state.worker.as_ref().is_some_and(Worker::is_alive) {
            return Ok(true);
        }
        let expected = state.interval.filter(|_| !self.hooks.tripped.load(Ordering::SeqCst));
        match (relaunch, expected) {
            (true, Some(interval)) => {
                warn!("runtime monitor thread died; relaunching");
                if let Some(dead) = state.worker.take() {
                    let _ = dead.handle.join();
                }
                state.worker = Some(self.spawn(interval)?);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn spawn(&self, interval: Duration) -> Result<Worker> {
        let signal = Arc::new(StopSignal::default());
        let host = Arc::clone(&self.host);
        let hooks = Arc::clone(&self.hooks);
        let worker_signal = Arc::clone(&signal);

        let handle = thread::Builder::new()
            .name("tak-runtime-monitor".into())
            .spawn(move || {
                loop {
                    if let Some(reason) = host.scan() {
                        hooks.fire(reason);
                        return;
                    }
                    if worker_signal.wait(interval) {
                        debug!("runtime monitor worker exiting");
                        return;
                    }
                }
            })
            .map_err(|e| TakError::Concurrency(format!("spawn runtime monitor: {e}")))?;

        Ok(Worker { handle, signal })
    }
}

impl Drop for RuntimeMonitor {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
