//! Stop-the-world coordination by safepoint polling.
//!
//! # Protocol
//!
//! 1. The collector (holding the collector lock) bumps the epoch and raises
//!    the stop flag.
//! 2. Running threads notice the flag at their next safepoint, record their
//!    stack pointer and registers, store the epoch in `stopped_epoch`, post
//!    an acknowledgement and wait for the resume epoch.
//! 3. Threads in native code (`Blocking`) already have a snapshot; the
//!    collector moves them to `Suspended` with a CAS and they cannot leave
//!    native code until resumed.
//! 4. Threads stopped inside the allocation fast path are stepped to their
//!    next safepoint and stopped again, with backoff, until none remain.
//! 5. Restart publishes the epoch as resumed and wakes everyone.
//!
//! Stale stop requests are ignored: a thread that parks for an epoch that
//! was already resumed returns immediately.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::utils::Backoff;
use parking_lot::{Condvar, Mutex};

use crate::thread::{ThreadInfo, ThreadState};

const ACK_POLL: Duration = Duration::from_millis(1);
const STEP_SLEEP: Duration = Duration::from_micros(200);

/// How a parked thread was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ParkOutcome {
    /// The world was restarted.
    Resumed,
    /// The collector asked the thread to run to its next safepoint.
    Stepped,
}

pub(crate) struct StopTheWorld {
    epoch: AtomicU64,
    stop_requested: AtomicBool,
    resumed: Mutex<u64>,
    resume_cond: Condvar,
    acks: Mutex<u64>,
    ack_cond: Condvar,
}

impl StopTheWorld {
    pub(crate) const fn new() -> Self {
        Self {
            epoch: AtomicU64::new(0),
            stop_requested: AtomicBool::new(false),
            resumed: Mutex::new(0),
            resume_cond: Condvar::new(),
            acks: Mutex::new(0),
            ack_cond: Condvar::new(),
        }
    }

    /// Cheap check for the safepoint poll.
    #[inline]
    pub(crate) fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// Park `me` until the world restarts or the collector steps it.
    pub(crate) fn park(&self, me: &ThreadInfo) -> ParkOutcome {
        let epoch = self.epoch.load(Ordering::Acquire);
        me.record_context();
        me.set_state(ThreadState::Parked);
        me.stopped_epoch.store(epoch, Ordering::Release);
        {
            let mut acks = self.acks.lock();
            *acks += 1;
            self.ack_cond.notify_all();
        }

        let mut resumed = self.resumed.lock();
        let outcome = loop {
            if *resumed >= epoch {
                break ParkOutcome::Resumed;
            }
            if me.step_request.swap(false, Ordering::AcqRel) {
                break ParkOutcome::Stepped;
            }
            self.resume_cond.wait(&mut resumed);
        };
        me.set_state(ThreadState::Running);
        outcome
    }

    /// Enter native code: the thread will not touch the heap until
    /// [`StopTheWorld::leave_blocking`].
    pub(crate) fn enter_blocking(&self, me: &ThreadInfo) {
        me.record_context();
        me.set_state(ThreadState::Blocking);
    }

    /// Leave native code, waiting out any collection that suspended us.
    pub(crate) fn leave_blocking(&self, me: &ThreadInfo) {
        loop {
            if me.transition(ThreadState::Blocking, ThreadState::Running) {
                return;
            }
            let mut resumed = self.resumed.lock();
            while me.state() == ThreadState::Suspended {
                self.resume_cond.wait(&mut resumed);
            }
        }
    }

    /// Stop every thread in `threads` except `me`. Returns the epoch and the
    /// number of critical-region restarts.
    pub(crate) fn stop_world(&self, threads: &[Arc<ThreadInfo>], me: Option<&ThreadInfo>) -> (u64, usize) {
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        self.stop_requested.store(true, Ordering::Release);

        let others: Vec<&Arc<ThreadInfo>> = threads
            .iter()
            .filter(|t| me.is_none_or(|me| !std::ptr::eq(Arc::as_ptr(*t), me)))
            .collect();
        self.wait_stopped(&others, epoch);

        let mut restarts = 0;
        let backoff = Backoff::new();
        loop {
            let critical: Vec<&Arc<ThreadInfo>> = others
                .iter()
                .copied()
                .filter(|t| {
                    t.state() == ThreadState::Parked
                        && t.in_critical_region.load(Ordering::Acquire)
                })
                .collect();
            if critical.is_empty() {
                break;
            }
            #[cfg(feature = "tracing")]
            tracing::debug!(threads = critical.len(), "restarting threads in critical region");
            {
                let _resumed = self.resumed.lock();
                for thread in &critical {
                    thread.stopped_epoch.store(0, Ordering::Release);
                    thread.step_request.store(true, Ordering::Release);
                }
                self.resume_cond.notify_all();
            }
            restarts += critical.len();
            if backoff.is_completed() {
                std::thread::sleep(STEP_SLEEP);
            } else {
                backoff.snooze();
            }
            self.wait_stopped(&critical, epoch);
        }
        (epoch, restarts)
    }

    fn wait_stopped(&self, threads: &[&Arc<ThreadInfo>], epoch: u64) {
        let mut acks = self.acks.lock();
        loop {
            let mut pending = 0;
            for thread in threads {
                if thread.stopped_epoch.load(Ordering::Acquire) == epoch {
                    continue;
                }
                if thread.transition(ThreadState::Blocking, ThreadState::Suspended) {
                    thread.stopped_epoch.store(epoch, Ordering::Release);
                    continue;
                }
                pending += 1;
            }
            if pending == 0 {
                return;
            }
            self.ack_cond.wait_for(&mut acks, ACK_POLL);
        }
    }

    /// Release every thread stopped for `epoch`.
    pub(crate) fn restart_world(&self, threads: &[Arc<ThreadInfo>], epoch: u64) {
        self.stop_requested.store(false, Ordering::Release);
        let mut resumed = self.resumed.lock();
        *resumed = epoch;
        for thread in threads {
            thread.transition(ThreadState::Suspended, ThreadState::Blocking);
        }
        self.resume_cond.notify_all();
    }
}
