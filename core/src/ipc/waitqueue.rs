//! C2: the FIFO wait queue every blocking IPC primitive is built on.
//!
//! Grounded on the scheduler's own blocking primitives
//! (`futex.rs`/`sleep.rs`): a waiter is a raw `*mut Task` plus whatever bucket
//! state protects it, blocking is `set block_reason, drop the lock,
//! block_current_task()`, and waking is `unblock_task(task)`. This module
//! generalizes that pattern into a reusable queue embedded directly in each
//! mutex/semaphore/event/queue slot (so each object's state and its waiters
//! share one lock, same as a futex bucket), and adds a `WaitCell` token so a
//! waiter can read back *why* it woke (normal wake, timeout, object
//! destroyed) and any attached payload (e.g. which event in a set fired).

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use alloc::sync::Arc;
use alloc::vec::Vec;

use slopos_abi::task::BlockReason;

use crate::platform;
use crate::scheduler::scheduler::{block_current_task, scheduler_get_current_task, unblock_task};
use crate::scheduler::task_struct::Task;

/// Shared outcome slot for one blocked waiter. Kept alive by the waiter
/// (on its stack, across the blocking call) and by the queue (until it
/// wakes the waiter or times it out), so whichever side finishes last frees
/// it.
pub struct WaitCell {
    woken: AtomicBool,
    timed_out: AtomicBool,
    destroyed: AtomicBool,
    /// Caller-defined payload attached by whoever wakes the waiter, e.g.
    /// the event index that satisfied an event-set wait.
    user_data: AtomicU32,
}

impl WaitCell {
    fn new() -> Self {
        Self {
            woken: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            user_data: AtomicU32::new(0),
        }
    }

    pub fn is_timed_out(&self) -> bool {
        self.timed_out.load(Ordering::Acquire)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn user_data(&self) -> u32 {
        self.user_data.load(Ordering::Acquire)
    }
}

struct Waiter {
    task_id: u32,
    task: *mut Task,
    deadline_tick: Option<u64>,
    enqueued_tick: u64,
    cell: Arc<WaitCell>,
}

/// Running total of ticks every woken/timed-out waiter spent blocked, for
/// [`super::stats`]'s `total_wait_time`.
static TOTAL_WAIT_TICKS: AtomicU64 = AtomicU64::new(0);

fn record_wait_duration(enqueued_tick: u64) {
    let elapsed = platform::timer_ticks().wrapping_sub(enqueued_tick);
    TOTAL_WAIT_TICKS.fetch_add(elapsed, Ordering::Relaxed);
}

/// Cumulative ticks spent blocked across every IPC wait queue.
pub fn total_wait_ticks() -> u64 {
    TOTAL_WAIT_TICKS.load(Ordering::Relaxed)
}

// SAFETY: the raw task pointer is only read/compared, and every access is
// made while holding the IrqMutex that guards the WaitQueue it lives in -
// the same contract futex.rs's FutexWaiter relies on.
unsafe impl Send for Waiter {}

/// A FIFO list of tasks blocked on one IPC object.
pub struct WaitQueue {
    waiters: Vec<Waiter>,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            waiters: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Enqueue the calling task at the back of the queue and mark it
    /// blocked for IPC. The caller must drop whatever lock guards this
    /// queue and then call [`block_current_task`] itself - mirrors
    /// `futex_wait`'s "set block_reason under the bucket lock, block after
    /// releasing it" sequencing, which avoids holding a spinlock across a
    /// context switch.
    ///
    /// Returns `None` if there is no current task (should not happen once
    /// the scheduler is up).
    pub fn prepare_wait(&mut self, deadline_tick: Option<u64>) -> Option<Arc<WaitCell>> {
        let current = scheduler_get_current_task();
        if current.is_null() {
            return None;
        }
        let task_id = unsafe { (*current).task_id };
        let cell = Arc::new(WaitCell::new());
        self.waiters.push(Waiter {
            task_id,
            task: current,
            deadline_tick,
            enqueued_tick: platform::timer_ticks(),
            cell: cell.clone(),
        });
        unsafe {
            (*current).block_reason = BlockReason::IpcWait;
        }
        Some(cell)
    }

    /// Wake the longest-waiting task. Returns `true` if anyone was woken.
    pub fn wake_one(&mut self) -> bool {
        if self.waiters.is_empty() {
            return false;
        }
        let waiter = self.waiters.remove(0);
        waiter.cell.woken.store(true, Ordering::Release);
        record_wait_duration(waiter.enqueued_tick);
        let _ = unblock_task(waiter.task);
        true
    }

    /// Wake the longest-waiting task and report its task ID, for callers
    /// (mutex unlock, C10 cleanup) that must hand ownership directly to
    /// whoever they just woke rather than dropping back to "unowned".
    pub fn wake_one_task_id(&mut self) -> Option<u32> {
        if self.waiters.is_empty() {
            return None;
        }
        let waiter = self.waiters.remove(0);
        let task_id = waiter.task_id;
        waiter.cell.woken.store(true, Ordering::Release);
        record_wait_duration(waiter.enqueued_tick);
        let _ = unblock_task(waiter.task);
        Some(task_id)
    }

    /// Wake every waiter in FIFO order. Returns the number woken.
    pub fn wake_all(&mut self) -> usize {
        let drained: Vec<Waiter> = self.waiters.drain(..).collect();
        let woken = drained.len();
        for waiter in drained {
            waiter.cell.woken.store(true, Ordering::Release);
            record_wait_duration(waiter.enqueued_tick);
            let _ = unblock_task(waiter.task);
        }
        woken
    }

    /// Wake every waiter and mark them as observing object destruction,
    /// used when a mutex/semaphore/event/queue is torn down while tasks are
    /// still blocked on it.
    pub fn wake_all_destroyed(&mut self) -> usize {
        let drained: Vec<Waiter> = self.waiters.drain(..).collect();
        let woken = drained.len();
        for waiter in drained {
            waiter.cell.destroyed.store(true, Ordering::Release);
            record_wait_duration(waiter.enqueued_tick);
            let _ = unblock_task(waiter.task);
        }
        woken
    }

    /// Wake every waiter, stamping the same `user_data` on each first. Used
    /// when one event firing must resolve every task waiting on a set that
    /// contains it, all reporting back the same firing event.
    pub fn wake_all_with_data(&mut self, user_data: u32) -> usize {
        let drained: Vec<Waiter> = self.waiters.drain(..).collect();
        let woken = drained.len();
        for waiter in drained {
            waiter.cell.user_data.store(user_data, Ordering::Release);
            waiter.cell.woken.store(true, Ordering::Release);
            record_wait_duration(waiter.enqueued_tick);
            let _ = unblock_task(waiter.task);
        }
        woken
    }

    /// Wake the longest-waiting task, stamping `user_data` first. Returns
    /// `true` if anyone was woken. Used when an auto-reset event fires into
    /// a set: exactly one set-waiter may consume the signal, same as a
    /// direct `wait` on the event itself.
    pub fn wake_one_with_data(&mut self, user_data: u32) -> bool {
        if self.waiters.is_empty() {
            return false;
        }
        let waiter = self.waiters.remove(0);
        waiter.cell.user_data.store(user_data, Ordering::Release);
        waiter.cell.woken.store(true, Ordering::Release);
        record_wait_duration(waiter.enqueued_tick);
        let _ = unblock_task(waiter.task);
        true
    }

    /// Wake the one waiter attached to `cell`, stamping `user_data` first.
    /// Used by event sets, where any member event firing must resolve a
    /// single shared wait and record which event it was.
    pub fn wake_with_data(&mut self, cell: &Arc<WaitCell>, user_data: u32) -> bool {
        let Some(idx) = self.waiters.iter().position(|w| Arc::ptr_eq(&w.cell, cell)) else {
            return false;
        };
        let waiter = self.waiters.remove(idx);
        waiter.cell.user_data.store(user_data, Ordering::Release);
        waiter.cell.woken.store(true, Ordering::Release);
        record_wait_duration(waiter.enqueued_tick);
        let _ = unblock_task(waiter.task);
        true
    }

    /// Drop any waiter belonging to `task_id` without waking it (the task
    /// is being torn down by C10 cleanup, not legitimately woken).
    pub fn remove_task(&mut self, task_id: u32) -> bool {
        let before = self.waiters.len();
        self.waiters.retain(|w| w.task_id != task_id);
        self.waiters.len() != before
    }

    /// Wake every waiter whose deadline has passed. Returns the number
    /// timed out. Called once per timer tick per object kind, mirroring
    /// `sleep::wake_due_sleepers`.
    pub fn scan_timeouts(&mut self, now_tick: u64) -> usize {
        let mut timed_out = 0;
        let mut i = 0;
        while i < self.waiters.len() {
            let due = match self.waiters[i].deadline_tick {
                Some(deadline) => tick_reached(now_tick, deadline),
                None => false,
            };
            if due {
                let waiter = self.waiters.remove(i);
                waiter.cell.timed_out.store(true, Ordering::Release);
                record_wait_duration(waiter.enqueued_tick);
                let _ = unblock_task(waiter.task);
                timed_out += 1;
            } else {
                i += 1;
            }
        }
        timed_out
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Block the calling task; resumes once another CPU calls
/// [`WaitQueue::wake_one`]/[`wake_all`]/[`wake_all_destroyed`]/[`scan_timeouts`]
/// on the queue it was enqueued on. Must be called with no IPC object lock
/// held, immediately after [`WaitQueue::prepare_wait`].
pub fn block_current_task_for_ipc() {
    block_current_task();
}

/// Same wraparound-safe comparison `sleep::tick_reached` uses, so a 64-bit
/// tick counter can wrap without spuriously firing or missing a timeout.
#[inline]
fn tick_reached(now_tick: u64, deadline_tick: u64) -> bool {
    now_tick.wrapping_sub(deadline_tick) < (1u64 << 63)
}

/// Convert a millisecond timeout into an absolute deadline tick, the same
/// way `sleep::ms_to_sleep_ticks` does.
pub fn deadline_from_timeout_ms(timeout_ms: u32) -> u64 {
    let freq = platform::timer_frequency() as u64;
    let ticks = if freq == 0 {
        1
    } else {
        (timeout_ms as u64).saturating_mul(freq).saturating_add(999) / 1000
    };
    platform::timer_ticks().wrapping_add(ticks.max(1))
}
