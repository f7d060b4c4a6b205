// Copyright (c) Contributors to the arcfs project.
// SPDX-License-Identifier: Apache-2.0

//! Unmounting of the filesystem after a period without use.
//!
//! The supervisor runs beside the serving loop and shares nothing with it
//! but a handful of atomics, so a tick can safely observe the filesystem
//! in the middle of any request.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};

#[cfg(test)]
#[path = "./idle_test.rs"]
mod idle_test;

const TICK: Duration = Duration::from_secs(1);

/// The current wall-clock time in whole seconds
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Filesystem usage as seen by the idle supervisor
#[derive(Debug, Default)]
pub struct Activity {
    last_access: AtomicU64,
    open: AtomicU64,
}

impl Activity {
    pub fn new() -> Self {
        let activity = Self::default();
        activity.touch();
        activity
    }

    /// Record that the filesystem is being used right now
    pub fn touch(&self) {
        self.touch_at(now_secs())
    }

    pub fn touch_at(&self, secs: u64) {
        self.last_access.store(secs, Ordering::Relaxed);
    }

    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }

    /// The number of currently open files and directories
    pub fn open_count(&self) -> u64 {
        self.open.load(Ordering::Acquire)
    }

    pub(crate) fn opened(&self) {
        self.open.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns false if there was nothing open to close
    pub(crate) fn closed(&self) -> bool {
        self.open
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// What the supervisor should do after a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// The supervisor is disarmed, stop ticking
    Stop,
    /// Check again in one second
    Reschedule,
    /// The filesystem has been idle for too long
    Interrupt,
}

#[derive(Debug)]
pub struct IdleState {
    activity: Arc<Activity>,
    timeout: AtomicU64,
    armed: AtomicBool,
}

impl IdleState {
    pub fn new(activity: Arc<Activity>) -> Self {
        Self {
            activity,
            timeout: AtomicU64::new(0),
            armed: AtomicBool::new(false),
        }
    }

    pub fn activity(&self) -> &Arc<Activity> {
        &self.activity
    }

    pub fn arm(&self, timeout_secs: u64, now: u64) {
        self.activity.touch_at(now);
        self.timeout.store(timeout_secs, Ordering::Relaxed);
        self.armed.store(true, Ordering::Release);
    }

    pub fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    /// Decide the outcome of a tick taken at `now`
    pub fn poll(&self, now: u64) -> Tick {
        let timeout = self.timeout.load(Ordering::Relaxed);
        if !self.is_armed() || timeout == 0 {
            return Tick::Stop;
        }
        let idle_for = now.saturating_sub(self.activity.last_access());
        if self.activity.open_count() == 0 && idle_for > timeout {
            Tick::Interrupt
        } else {
            Tick::Reschedule
        }
    }
}

/// Ticks once per second while armed, and interrupts the
/// process once the filesystem has gone unused for long enough.
#[derive(Debug)]
pub struct IdleSupervisor {
    state: Arc<IdleState>,
    task: Option<JoinHandle<()>>,
}

impl IdleSupervisor {
    pub fn new(activity: Arc<Activity>) -> Self {
        Self {
            state: Arc::new(IdleState::new(activity)),
            task: None,
        }
    }

    pub fn state(&self) -> &IdleState {
        &self.state
    }

    /// Start ticking, sending SIGINT to this process when idle.
    ///
    /// Must be called from within a tokio runtime. A zero timeout
    /// leaves the supervisor disabled.
    pub fn arm(&mut self, timeout_secs: u64) {
        self.arm_with(timeout_secs, interrupt_process)
    }

    /// Start ticking, calling `on_idle` once when idle
    pub fn arm_with<F>(&mut self, timeout_secs: u64, on_idle: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if timeout_secs == 0 {
            return;
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.state.arm(timeout_secs, now_secs());
        tracing::debug!(timeout_secs, "idle timeout armed");

        let state = Arc::clone(&self.state);
        self.task = Some(tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + TICK, TICK);
            loop {
                ticks.tick().await;
                match state.poll(now_secs()) {
                    Tick::Stop => break,
                    Tick::Reschedule => continue,
                    Tick::Interrupt => {
                        tracing::info!("Filesystem has been idle, shutting down");
                        on_idle();
                        break;
                    }
                }
            }
        }));
    }

    /// Cancel any pending tick and disarm
    pub fn teardown(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.state.disarm();
    }
}

impl Drop for IdleSupervisor {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn interrupt_process() {
    if let Err(err) = kill(Pid::this(), Signal::SIGINT) {
        tracing::error!(?err, "Failed to interrupt idle filesystem");
    }
}
