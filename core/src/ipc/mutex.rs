//! C4: named mutexes.
//!
//! Recursive, FIFO-fair mutual exclusion: the owning task may lock the same
//! mutex any number of times, each nested `lock` incrementing `lock_count`,
//! each `unlock` decrementing it, and the mutex only becoming free again
//! once `lock_count` returns to zero. Each slot pairs its own
//! `owner`/`lock_count` state with an embedded [`WaitQueue`] behind one
//! `IrqMutex`, the same locking shape `futex.rs` uses per bucket - state and
//! waiters are always mutated together, so there is never a window where a
//! waiter is enqueued against a lock state that has already changed under
//! it.

use slopos_abi::ipc::IpcHandle;
use slopos_lib::{klog_debug, klog_warn, IrqMutex};

use super::error::{IpcError, IpcResult};
use super::object::{ObjectKind, ObjectName, REGISTRY};
use super::stats;
use super::waitqueue::{WaitQueue, block_current_task_for_ipc, deadline_from_timeout_ms};
use super::MAX_MUTEXES;

struct MutexSlot {
    active: bool,
    /// `None` means the mutex is free (no task holds it).
    owner_task_id: Option<u32>,
    lock_count: u32,
    wait_queue: WaitQueue,
}

impl MutexSlot {
    const fn empty() -> Self {
        Self {
            active: false,
            owner_task_id: None,
            lock_count: 0,
            wait_queue: WaitQueue::new(),
        }
    }
}

static POOL: [IrqMutex<MutexSlot>; MAX_MUTEXES] = {
    const SLOT: IrqMutex<MutexSlot> = IrqMutex::new(MutexSlot::empty());
    [SLOT; MAX_MUTEXES]
};

fn claim_free_slot() -> Option<usize> {
    for (idx, slot_lock) in POOL.iter().enumerate() {
        let mut slot = slot_lock.lock();
        if !slot.active {
            slot.active = true;
            slot.owner_task_id = None;
            slot.lock_count = 0;
            return Some(idx);
        }
    }
    None
}

fn pool_index(handle: IpcHandle) -> IpcResult<usize> {
    let header = REGISTRY.resolve(handle)?;
    if header.kind != ObjectKind::Mutex {
        return Err(IpcError::InvalidHandle);
    }
    Ok(header.pool_index as usize)
}

/// Create a new named mutex, initially unlocked.
pub fn create(name: &str, owner_task_id: u32) -> IpcResult<IpcHandle> {
    let object_name = ObjectName::new(name)?;
    let Some(pool_idx) = claim_free_slot() else {
        stats::record_allocation_failure();
        klog_warn!("ipc: mutex pool exhausted, name={}", name);
        return Err(IpcError::NoResources);
    };

    match REGISTRY.register(ObjectKind::Mutex, object_name, owner_task_id, pool_idx as u16) {
        Ok(handle) => Ok(handle),
        Err(e) => {
            POOL[pool_idx].lock().active = false;
            Err(e)
        }
    }
}

/// Destroy a mutex, waking any blocked waiters with `Destroyed`.
pub fn destroy(handle: IpcHandle) -> IpcResult<()> {
    let header = REGISTRY.unregister(handle)?;
    if header.kind != ObjectKind::Mutex {
        return Err(IpcError::InvalidHandle);
    }
    let mut slot = POOL[header.pool_index as usize].lock();
    slot.wait_queue.wake_all_destroyed();
    *slot = MutexSlot::empty();
    stats::record_object_destroyed();
    klog_debug!("ipc: destroyed mutex handle={:#x}", handle.0);
    Ok(())
}

/// Acquire the mutex, blocking up to `timeout_ms` (`None` = forever). The
/// current owner may re-enter any number of times; each entry must be
/// matched with one `unlock` before any other task can take the lock.
pub fn lock(handle: IpcHandle, task_id: u32, timeout_ms: Option<u32>) -> IpcResult<()> {
    loop {
        let deadline = timeout_ms.map(deadline_from_timeout_ms);
        let cell = {
            let idx = pool_index(handle)?;
            let mut slot = POOL[idx].lock();

            if slot.owner_task_id == Some(task_id) {
                slot.lock_count += 1;
                stats::record_mutex_lock(false);
                return Ok(());
            }
            if slot.owner_task_id.is_none() {
                slot.owner_task_id = Some(task_id);
                slot.lock_count = 1;
                stats::record_mutex_lock(false);
                return Ok(());
            }

            stats::record_mutex_lock(true);
            match slot.wait_queue.prepare_wait(deadline) {
                Some(cell) => cell,
                None => return Err(IpcError::InvalidArg),
            }
        };

        block_current_task_for_ipc();

        if cell.is_destroyed() {
            return Err(IpcError::Destroyed);
        }
        if cell.is_timed_out() {
            stats::record_wait_timeout();
            return Err(IpcError::Timeout);
        }
        // Woken because the lock was handed to us directly (see `unlock`);
        // the owner field and lock_count are already set for `task_id`.
        // Re-validate the handle in the (rare) case it was destroyed and
        // recreated between wake and this check.
        let idx = pool_index(handle)?;
        let slot = POOL[idx].lock();
        if slot.owner_task_id == Some(task_id) {
            return Ok(());
        }
        // Spurious: go around again.
    }
}

/// Acquire without blocking. Recurses for the current owner exactly like
/// [`lock`]; returns `Busy` if another task holds it.
pub fn trylock(handle: IpcHandle, task_id: u32) -> IpcResult<()> {
    let idx = pool_index(handle)?;
    let mut slot = POOL[idx].lock();
    if slot.owner_task_id == Some(task_id) {
        slot.lock_count += 1;
        stats::record_mutex_lock(false);
        return Ok(());
    }
    if slot.owner_task_id.is_some() {
        return Err(IpcError::Busy);
    }
    slot.owner_task_id = Some(task_id);
    slot.lock_count = 1;
    stats::record_mutex_lock(false);
    Ok(())
}

/// Release one level of recursion. Fails with `NotOwner` if `task_id` does
/// not hold the lock. Only when `lock_count` reaches zero does the mutex
/// become free, at which point ownership is handed directly to the next
/// FIFO waiter (if any) rather than dropped back to "unlocked" and raced
/// for by new lockers - this is what makes the wait queue FIFO-fair.
pub fn unlock(handle: IpcHandle, task_id: u32) -> IpcResult<()> {
    let idx = pool_index(handle)?;
    let mut slot = POOL[idx].lock();

    if slot.owner_task_id != Some(task_id) {
        stats::record_permission_failure();
        klog_warn!(
            "ipc: unlock by non-owner task_id={} handle={:#x}",
            task_id,
            handle.0
        );
        return Err(IpcError::NotOwner);
    }

    slot.lock_count -= 1;
    if slot.lock_count == 0 {
        slot.owner_task_id = slot.wait_queue.wake_one_task_id();
        if slot.owner_task_id.is_some() {
            slot.lock_count = 1;
        }
    }
    Ok(())
}

/// Remove `task_id`'s ownership/queue membership on task termination (C10).
/// If it owned the lock, hands it to the next waiter exactly like `unlock`
/// regardless of how deep its recursion was.
pub fn cleanup_task(task_id: u32) {
    for slot_lock in POOL.iter() {
        let mut slot = slot_lock.lock();
        if !slot.active {
            continue;
        }
        slot.wait_queue.remove_task(task_id);
        if slot.owner_task_id == Some(task_id) {
            slot.owner_task_id = slot.wait_queue.wake_one_task_id();
            slot.lock_count = if slot.owner_task_id.is_some() { 1 } else { 0 };
        }
    }
    // Mutexes task_id created are destroyed now, refcount-gated exactly like
    // an explicit destroy() call.
    for header in REGISTRY.owned_by(task_id) {
        if header.kind == ObjectKind::Mutex {
            let _ = destroy(header.handle);
        }
    }
}

/// Drive timed-out lockers to completion. Called once per timer tick.
pub fn scan_timeouts(now_tick: u64) {
    for slot_lock in POOL.iter() {
        let mut slot = slot_lock.lock();
        if !slot.active {
            continue;
        }
        let timed_out = slot.wait_queue.scan_timeouts(now_tick);
        for _ in 0..timed_out {
            stats::record_wait_timeout();
        }
    }
}

/// Total tasks currently blocked on any mutex, for [`super::stats`].
pub fn waiter_count() -> usize {
    POOL.iter().map(|s| s.lock().wait_queue.len()).sum()
}
