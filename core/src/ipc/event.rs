//! C6: events and event sets.
//!
//! An event is a single sticky boolean with two reset disciplines:
//! auto-reset clears itself the instant it wakes one waiter (matching
//! Win32 `CreateEvent(bManualReset=FALSE)`), manual-reset stays signaled
//! until explicitly `reset`. An event set groups up to
//! [`super::MAX_EVENTS_PER_SET`] events so a task can block until any one
//! (or, with `WAIT_ALL`, every one) of them fires; `wait` on a set reports
//! back which member event it was via the wait queue's `user_data` token
//! (see `waitqueue::WaitCell`).

use alloc::vec::Vec;

use slopos_abi::ipc::{EventSetWaitFlags, IpcHandle};
use slopos_lib::{klog_debug, klog_warn, IrqMutex};

use super::error::{IpcError, IpcResult};
use super::object::{ObjectKind, ObjectName, REGISTRY};
use super::stats;
use super::waitqueue::{WaitQueue, block_current_task_for_ipc, deadline_from_timeout_ms};
use super::{MAX_EVENTS, MAX_EVENTS_PER_SET, MAX_EVENT_SETS};

/// Whether a signaled event auto-clears after waking a single waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventResetMode {
    AutoReset,
    ManualReset,
}

struct EventSlot {
    active: bool,
    mode: EventResetMode,
    signaled: bool,
    wait_queue: WaitQueue,
}

impl EventSlot {
    const fn empty() -> Self {
        Self {
            active: false,
            mode: EventResetMode::ManualReset,
            signaled: false,
            wait_queue: WaitQueue::new(),
        }
    }
}

static EVENTS: [IrqMutex<EventSlot>; MAX_EVENTS] = {
    const SLOT: IrqMutex<EventSlot> = IrqMutex::new(EventSlot::empty());
    [SLOT; MAX_EVENTS]
};

fn claim_free_event_slot() -> Option<usize> {
    for (idx, slot_lock) in EVENTS.iter().enumerate() {
        let mut slot = slot_lock.lock();
        if !slot.active {
            slot.active = true;
            return Some(idx);
        }
    }
    None
}

fn event_pool_index(handle: IpcHandle) -> IpcResult<usize> {
    let header = REGISTRY.resolve(handle)?;
    if header.kind != ObjectKind::Event {
        return Err(IpcError::InvalidHandle);
    }
    Ok(header.pool_index as usize)
}

pub fn create(name: &str, owner_task_id: u32, mode: EventResetMode) -> IpcResult<IpcHandle> {
    let object_name = ObjectName::new(name)?;
    let Some(pool_idx) = claim_free_event_slot() else {
        stats::record_allocation_failure();
        klog_warn!("ipc: event pool exhausted, name={}", name);
        return Err(IpcError::NoResources);
    };
    EVENTS[pool_idx].lock().mode = mode;

    match REGISTRY.register(ObjectKind::Event, object_name, owner_task_id, pool_idx as u16) {
        Ok(handle) => Ok(handle),
        Err(e) => {
            EVENTS[pool_idx].lock().active = false;
            Err(e)
        }
    }
}

/// Destroy an event. If it is still referenced by one or more event sets,
/// the handle is invalidated for the owner but teardown is deferred until
/// the last set releases its reference (via `remove_from_set`/`destroy_set`)
/// - the C1 refcount-closure invariant.
pub fn destroy(handle: IpcHandle) -> IpcResult<()> {
    let header = REGISTRY.resolve(handle)?;
    if header.kind != ObjectKind::Event {
        return Err(IpcError::InvalidHandle);
    }
    if !REGISTRY.decref(handle)? {
        return Ok(());
    }
    REGISTRY.unregister(handle)?;
    let mut slot = EVENTS[header.pool_index as usize].lock();
    slot.wait_queue.wake_all_destroyed();
    *slot = EventSlot::empty();
    stats::record_object_destroyed();
    klog_debug!("ipc: destroyed event handle={:#x}", handle.0);
    Ok(())
}

/// Signal the event, waking exactly one waiter if auto-reset, or every
/// waiter (and staying signaled for future waiters) if manual-reset.
pub fn signal(handle: IpcHandle) -> IpcResult<()> {
    let idx = event_pool_index(handle)?;
    let mut slot = EVENTS[idx].lock();
    stats::record_event_signal();

    let mode = slot.mode;
    let consumed_directly = match mode {
        EventResetMode::AutoReset => {
            if slot.wait_queue.wake_one() {
                // Handed straight to a waiter; stays unsignaled for the
                // next caller to check, exactly like a semaphore handoff.
                true
            } else {
                slot.signaled = true;
                false
            }
        }
        EventResetMode::ManualReset => {
            slot.signaled = true;
            slot.wait_queue.wake_all();
            false
        }
    };
    drop(slot);
    // An auto-reset signal already handed to a direct waiter is spent;
    // only notify sets when nobody direct-waiting consumed it.
    if !(mode == EventResetMode::AutoReset && consumed_directly) {
        notify_sets_of_signal(handle, mode);
    }
    Ok(())
}

/// Manual-reset only in spirit, but callable on any event: clears the
/// sticky signaled flag without affecting already-woken waiters.
pub fn reset(handle: IpcHandle) -> IpcResult<()> {
    let idx = event_pool_index(handle)?;
    EVENTS[idx].lock().signaled = false;
    Ok(())
}

/// Block until the event is signaled (or already is), up to `timeout_ms`.
pub fn wait(handle: IpcHandle, timeout_ms: Option<u32>) -> IpcResult<()> {
    let deadline = timeout_ms.map(deadline_from_timeout_ms);
    let cell = {
        let idx = event_pool_index(handle)?;
        let mut slot = EVENTS[idx].lock();

        if slot.signaled {
            if slot.mode == EventResetMode::AutoReset {
                slot.signaled = false;
            }
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
        stats::record_wait_timeout();
        return Err(IpcError::Timeout);
    }
    Ok(())
}

pub fn cleanup_task(task_id: u32) {
    for slot_lock in EVENTS.iter() {
        let mut slot = slot_lock.lock();
        if slot.active {
            slot.wait_queue.remove_task(task_id);
        }
    }
    for slot_lock in EVENT_SETS.iter() {
        let mut slot = slot_lock.lock();
        if slot.active {
            slot.wait_queue.remove_task(task_id);
        }
    }
    // Objects task_id created are destroyed now, refcount-gated exactly
    // like an explicit destroy()/destroy_set() call - an event still
    // referenced by a live set outlives its creator's exit.
    for header in REGISTRY.owned_by(task_id) {
        match header.kind {
            ObjectKind::Event => {
                let _ = destroy(header.handle);
            }
            ObjectKind::EventSet => {
                let _ = destroy_set(header.handle);
            }
            _ => {}
        }
    }
}

pub fn scan_timeouts(now_tick: u64) {
    for slot_lock in EVENTS.iter() {
        let mut slot = slot_lock.lock();
        if !slot.active {
            continue;
        }
        for _ in 0..slot.wait_queue.scan_timeouts(now_tick) {
            stats::record_wait_timeout();
        }
    }
    for slot_lock in EVENT_SETS.iter() {
        let mut slot = slot_lock.lock();
        if !slot.active {
            continue;
        }
        for _ in 0..slot.wait_queue.scan_timeouts(now_tick) {
            stats::record_wait_timeout();
        }
    }
}

// =============================================================================
// Event sets
// =============================================================================

struct EventSetSlot {
    active: bool,
    /// Registered handle is `IpcHandle::default()` (slot 0/generation 0,
    /// never a valid handle) for unused member slots.
    members: [IpcHandle; MAX_EVENTS_PER_SET],
    member_count: usize,
    wait_queue: WaitQueue,
}

impl EventSetSlot {
    const fn empty() -> Self {
        Self {
            active: false,
            members: [IpcHandle(0); MAX_EVENTS_PER_SET],
            member_count: 0,
            wait_queue: WaitQueue::new(),
        }
    }
}

static EVENT_SETS: [IrqMutex<EventSetSlot>; MAX_EVENT_SETS] = {
    const SLOT: IrqMutex<EventSetSlot> = IrqMutex::new(EventSetSlot::empty());
    [SLOT; MAX_EVENT_SETS]
};

fn claim_free_set_slot() -> Option<usize> {
    for (idx, slot_lock) in EVENT_SETS.iter().enumerate() {
        let mut slot = slot_lock.lock();
        if !slot.active {
            slot.active = true;
            return Some(idx);
        }
    }
    None
}

fn set_pool_index(handle: IpcHandle) -> IpcResult<usize> {
    let header = REGISTRY.resolve(handle)?;
    if header.kind != ObjectKind::EventSet {
        return Err(IpcError::InvalidHandle);
    }
    Ok(header.pool_index as usize)
}

/// Create an event set over `members` (each must already be a registered
/// event). Each member gets one extra [`super::object::Registry`] reference,
/// held until `remove_from_set`/`destroy_set` releases it again - this is
/// what lets a member event outlive its owner's own handle while the set
/// still references it (C1's refcount-closure invariant).
pub fn create_set(name: &str, owner_task_id: u32, members: &[IpcHandle]) -> IpcResult<IpcHandle> {
    if members.is_empty() || members.len() > MAX_EVENTS_PER_SET {
        return Err(IpcError::InvalidArg);
    }
    for &member in members {
        event_pool_index(member)?;
    }

    let object_name = ObjectName::new(name)?;
    let Some(pool_idx) = claim_free_set_slot() else {
        stats::record_allocation_failure();
        klog_warn!("ipc: event set pool exhausted, name={}", name);
        return Err(IpcError::NoResources);
    };
    {
        let mut slot = EVENT_SETS[pool_idx].lock();
        for (i, &member) in members.iter().enumerate() {
            slot.members[i] = member;
        }
        slot.member_count = members.len();
    }

    let handle = match REGISTRY.register(
        ObjectKind::EventSet,
        object_name,
        owner_task_id,
        pool_idx as u16,
    ) {
        Ok(handle) => handle,
        Err(e) => {
            EVENT_SETS[pool_idx].lock().active = false;
            return Err(e);
        }
    };

    for &member in members {
        let _ = REGISTRY.incref(member);
    }
    Ok(handle)
}

pub fn destroy_set(handle: IpcHandle) -> IpcResult<()> {
    let header = REGISTRY.unregister(handle)?;
    if header.kind != ObjectKind::EventSet {
        return Err(IpcError::InvalidHandle);
    }
    let mut slot = EVENT_SETS[header.pool_index as usize].lock();
    slot.wait_queue.wake_all_destroyed();
    let members: Vec<IpcHandle> = slot.members[..slot.member_count].to_vec();
    *slot = EventSetSlot::empty();
    drop(slot);
    for member in members {
        release_member(member);
    }
    stats::record_object_destroyed();
    Ok(())
}

/// Add `member` (an already-registered event) to `handle`'s set, taking one
/// extra registry reference on it. O(n) over the set's small member array.
pub fn add_to_set(handle: IpcHandle, member: IpcHandle) -> IpcResult<()> {
    event_pool_index(member)?;
    let set_idx = set_pool_index(handle)?;
    {
        let mut slot = EVENT_SETS[set_idx].lock();
        if slot.members[..slot.member_count].contains(&member) {
            return Ok(());
        }
        if slot.member_count >= MAX_EVENTS_PER_SET {
            stats::record_allocation_failure();
            return Err(IpcError::NoResources);
        }
        slot.members[slot.member_count] = member;
        slot.member_count += 1;
    }
    let _ = REGISTRY.incref(member);
    Ok(())
}

/// Remove `member` from `handle`'s set, releasing its extra registry
/// reference. A no-op if `member` was not in the set.
pub fn remove_from_set(handle: IpcHandle, member: IpcHandle) -> IpcResult<()> {
    let set_idx = set_pool_index(handle)?;
    let removed = {
        let mut slot = EVENT_SETS[set_idx].lock();
        match slot.members[..slot.member_count].iter().position(|&m| m == member) {
            Some(pos) => {
                for j in pos..slot.member_count - 1 {
                    slot.members[j] = slot.members[j + 1];
                }
                slot.member_count -= 1;
                true
            }
            None => false,
        }
    };
    if removed {
        release_member(member);
    }
    Ok(())
}

/// Release one set-held reference on a member event, tearing it down if
/// this was the last reference (mirrors the decref/teardown split `destroy`
/// uses - it validates ownership and decrefs, this is the "actually tear
/// down" half, invoked only when the count hits zero).
fn release_member(member: IpcHandle) {
    match REGISTRY.decref(member) {
        Ok(true) => {
            if let Ok(header) = REGISTRY.unregister(member) {
                let mut slot = EVENTS[header.pool_index as usize].lock();
                slot.wait_queue.wake_all_destroyed();
                *slot = EventSlot::empty();
                stats::record_object_destroyed();
            }
        }
        Ok(false) | Err(_) => {}
    }
}

fn set_members(set_idx: usize) -> Vec<IpcHandle> {
    let slot = EVENT_SETS[set_idx].lock();
    slot.members[..slot.member_count].to_vec()
}

/// Block until one member event is signaled (default), or, with
/// `flags.WAIT_ALL`, until every member event has been signaled at least
/// once since this call started. Returns the handle of the event that
/// satisfied the wait (insertion-order tie-break: the lowest-indexed member
/// already signaled at the time of the call wins).
pub fn wait_set(
    handle: IpcHandle,
    flags: EventSetWaitFlags,
    timeout_ms: Option<u32>,
) -> IpcResult<IpcHandle> {
    let set_idx = set_pool_index(handle)?;
    let members = set_members(set_idx);

    if flags.contains(EventSetWaitFlags::WAIT_ALL) {
        return wait_set_all(set_idx, &members, timeout_ms);
    }

    // First, insertion-order check for an already-signaled member.
    for &member in members.iter() {
        if let Ok(member_idx) = event_pool_index(member) {
            let mut event_slot = EVENTS[member_idx].lock();
            if event_slot.signaled {
                if event_slot.mode == EventResetMode::AutoReset {
                    event_slot.signaled = false;
                }
                return Ok(member);
            }
        }
    }

    let deadline = timeout_ms.map(deadline_from_timeout_ms);
    let cell = {
        let mut slot = EVENT_SETS[set_idx].lock();
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
    Ok(IpcHandle(cell.user_data()))
}

fn wait_set_all(
    set_idx: usize,
    members: &[IpcHandle],
    timeout_ms: Option<u32>,
) -> IpcResult<IpcHandle> {
    let deadline = timeout_ms.map(deadline_from_timeout_ms);
    loop {
        let mut all_signaled = true;
        for &member in members {
            let member_idx = event_pool_index(member)?;
            if !EVENTS[member_idx].lock().signaled {
                all_signaled = false;
                break;
            }
        }
        if all_signaled {
            return Ok(*members.last().expect("validated non-empty on create_set"));
        }

        let cell = {
            let mut slot = EVENT_SETS[set_idx].lock();
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
        // Woken by a member firing; loop to re-check whether all are now
        // signaled, since a single signal only guarantees one of them.
    }
}

/// Called by [`signal`] on every event set that lists `event_handle` as a
/// member, so a set-level wait can be woken with the firing event attached.
/// Manual-reset events stay signaled for every observer, so every matching
/// set-waiter is woken. Auto-reset events are a single-consumer handoff
/// even through a set: at most one set-waiter across every set is woken,
/// mirroring the "exactly one waiter served per signal" direct-wait rule.
pub(super) fn notify_sets_of_signal(event_handle: IpcHandle, mode: EventResetMode) {
    for slot_lock in EVENT_SETS.iter() {
        let mut slot = slot_lock.lock();
        if !slot.active {
            continue;
        }
        if slot.members[..slot.member_count].contains(&event_handle) {
            match mode {
                EventResetMode::ManualReset => {
                    slot.wait_queue.wake_all_with_data(event_handle.0);
                }
                EventResetMode::AutoReset => {
                    if slot.wait_queue.wake_one_with_data(event_handle.0) {
                        return;
                    }
                }
            }
        }
    }
}

/// Total tasks currently blocked on any event or event set, for
/// [`super::stats`].
pub fn waiter_count() -> usize {
    let events: usize = EVENTS.iter().map(|s| s.lock().wait_queue.len()).sum();
    let sets: usize = EVENT_SETS.iter().map(|s| s.lock().wait_queue.len()).sum();
    events + sets
}
