//! C5: named counting semaphores.
//!
//! Same pool/registry/wait-queue shape as [`super::mutex`], minus owner
//! tracking: a semaphore has no notion of who holds it, only how many units
//! are available. `post` hands a unit directly to the longest-waiting task
//! when the queue is non-empty instead of incrementing the counter and
//! racing new waiters in - the counting analogue of the mutex's
//! direct-handoff `unlock`.

use slopos_abi::ipc::IpcHandle;
use slopos_lib::{klog_debug, klog_warn, IrqMutex};

use super::error::{IpcError, IpcResult};
use super::object::{ObjectKind, ObjectName, REGISTRY};
use super::stats;
use super::waitqueue::{WaitQueue, block_current_task_for_ipc, deadline_from_timeout_ms};
use super::MAX_SEMAPHORES;

struct SemaphoreSlot {
    active: bool,
    count: u32,
    max_count: u32,
    wait_queue: WaitQueue,
}

impl SemaphoreSlot {
    const fn empty() -> Self {
        Self {
            active: false,
            count: 0,
            max_count: 0,
            wait_queue: WaitQueue::new(),
        }
    }
}

static POOL: [IrqMutex<SemaphoreSlot>; MAX_SEMAPHORES] = {
    const SLOT: IrqMutex<SemaphoreSlot> = IrqMutex::new(SemaphoreSlot::empty());
    [SLOT; MAX_SEMAPHORES]
};

fn claim_free_slot() -> Option<usize> {
    for (idx, slot_lock) in POOL.iter().enumerate() {
        let mut slot = slot_lock.lock();
        if !slot.active {
            slot.active = true;
            return Some(idx);
        }
    }
    None
}

fn pool_index(handle: IpcHandle) -> IpcResult<usize> {
    let header = REGISTRY.resolve(handle)?;
    if header.kind != ObjectKind::Semaphore {
        return Err(IpcError::InvalidHandle);
    }
    Ok(header.pool_index as usize)
}

/// Create a counting semaphore with `initial_count` units available, capped
/// at `max_count`. `initial_count` above `max_count` is rejected rather than
/// silently clamped.
pub fn create(
    name: &str,
    owner_task_id: u32,
    initial_count: u32,
    max_count: u32,
) -> IpcResult<IpcHandle> {
    if max_count == 0 || initial_count > max_count {
        return Err(IpcError::InvalidArg);
    }
    let object_name = ObjectName::new(name)?;
    let Some(pool_idx) = claim_free_slot() else {
        stats::record_allocation_failure();
        klog_warn!("ipc: semaphore pool exhausted, name={}", name);
        return Err(IpcError::NoResources);
    };
    {
        let mut slot = POOL[pool_idx].lock();
        slot.count = initial_count;
        slot.max_count = max_count;
    }

    match REGISTRY.register(
        ObjectKind::Semaphore,
        object_name,
        owner_task_id,
        pool_idx as u16,
    ) {
        Ok(handle) => Ok(handle),
        Err(e) => {
            POOL[pool_idx].lock().active = false;
            Err(e)
        }
    }
}

pub fn destroy(handle: IpcHandle) -> IpcResult<()> {
    let header = REGISTRY.unregister(handle)?;
    if header.kind != ObjectKind::Semaphore {
        return Err(IpcError::InvalidHandle);
    }
    let mut slot = POOL[header.pool_index as usize].lock();
    slot.wait_queue.wake_all_destroyed();
    *slot = SemaphoreSlot::empty();
    stats::record_object_destroyed();
    klog_debug!("ipc: destroyed semaphore handle={:#x}", handle.0);
    Ok(())
}

/// Acquire one unit, blocking up to `timeout_ms` (`None` = forever).
pub fn wait(handle: IpcHandle, timeout_ms: Option<u32>) -> IpcResult<()> {
    stats::record_semaphore_wait();
    let deadline = timeout_ms.map(deadline_from_timeout_ms);
    let cell = {
        let idx = pool_index(handle)?;
        let mut slot = POOL[idx].lock();

        if slot.count > 0 {
            slot.count -= 1;
            return Ok(());
        }

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
        stats::record_semaphore_timeout();
        stats::record_wait_timeout();
        return Err(IpcError::Timeout);
    }
    // Woken by `post` handing us a unit directly.
    Ok(())
}

/// Acquire one unit without blocking.
pub fn trywait(handle: IpcHandle) -> IpcResult<()> {
    let idx = pool_index(handle)?;
    let mut slot = POOL[idx].lock();
    if slot.count == 0 {
        return Err(IpcError::WouldBlock);
    }
    slot.count -= 1;
    Ok(())
}

/// Release one unit: hands it straight to the longest-waiting task if any
/// are blocked, otherwise increments the counter. Fails with `Overflow` if
/// the counter is already at `max_count` and nobody is waiting.
pub fn post(handle: IpcHandle) -> IpcResult<()> {
    let idx = pool_index(handle)?;
    let mut slot = POOL[idx].lock();

    if slot.wait_queue.wake_one() {
        return Ok(());
    }
    if slot.count >= slot.max_count {
        klog_warn!("ipc: semaphore overflow handle={:#x}", handle.0);
        return Err(IpcError::Overflow);
    }
    slot.count += 1;
    Ok(())
}

/// Current number of available units (does not count blocked waiters).
pub fn getvalue(handle: IpcHandle) -> IpcResult<u32> {
    let idx = pool_index(handle)?;
    Ok(POOL[idx].lock().count)
}

pub fn cleanup_task(task_id: u32) {
    for slot_lock in POOL.iter() {
        let mut slot = slot_lock.lock();
        if !slot.active {
            continue;
        }
        slot.wait_queue.remove_task(task_id);
    }
    // Semaphores task_id created are destroyed now, refcount-gated exactly
    // like an explicit destroy() call.
    for header in REGISTRY.owned_by(task_id) {
        if header.kind == ObjectKind::Semaphore {
            let _ = destroy(header.handle);
        }
    }
}

pub fn scan_timeouts(now_tick: u64) {
    for slot_lock in POOL.iter() {
        let mut slot = slot_lock.lock();
        if !slot.active {
            continue;
        }
        let timed_out = slot.wait_queue.scan_timeouts(now_tick);
        for _ in 0..timed_out {
            stats::record_semaphore_timeout();
            stats::record_wait_timeout();
        }
    }
}

/// Total tasks currently blocked on any semaphore, for [`super::stats`].
pub fn waiter_count() -> usize {
    POOL.iter().map(|s| s.lock().wait_queue.len()).sum()
}
