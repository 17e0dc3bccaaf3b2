//! C8: per-task registry of owned message queues, with designated default
//! send/receive queues.
//!
//! Same small fixed-capacity-table-plus-linear-scan shape as
//! [`super::object::Registry`], but keyed by `task_id` instead of object
//! name: each task gets up to [`super::MAX_QUEUES_PER_TASK`] queue handles,
//! and the first one registered becomes both the default send and default
//! receive queue until the caller points elsewhere.

use slopos_abi::ipc::{IpcHandle, QueueLookupMode};
use slopos_abi::task::MAX_TASKS;
use slopos_lib::{klog_warn, IrqMutex};

use super::error::{IpcError, IpcResult};
use super::MAX_QUEUES_PER_TASK;

#[derive(Clone, Copy)]
struct TaskQueues {
    active: bool,
    task_id: u32,
    queues: [IpcHandle; MAX_QUEUES_PER_TASK],
    count: usize,
    default_send_idx: usize,
    default_recv_idx: usize,
}

impl TaskQueues {
    const fn empty() -> Self {
        Self {
            active: false,
            task_id: 0,
            queues: [IpcHandle::INVALID; MAX_QUEUES_PER_TASK],
            count: 0,
            default_send_idx: 0,
            default_recv_idx: 0,
        }
    }
}

struct Table {
    entries: [TaskQueues; MAX_TASKS],
}

impl Table {
    const fn new() -> Self {
        Self {
            entries: [TaskQueues::empty(); MAX_TASKS],
        }
    }

    fn find(&self, task_id: u32) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.active && e.task_id == task_id)
    }
}

static TABLE: IrqMutex<Table> = IrqMutex::new(Table::new());

/// Register `handle` as owned by `task_id`. If this is the task's first
/// queue, it becomes both the default send and default receive queue.
pub fn register(task_id: u32, handle: IpcHandle) -> IpcResult<()> {
    let mut table = TABLE.lock();

    let idx = match table.find(task_id) {
        Some(idx) => idx,
        None => {
            let free = table.entries.iter().position(|e| !e.active).ok_or_else(|| {
                klog_warn!("ipc: queue registry full, task_id={}", task_id);
                IpcError::NoResources
            })?;
            table.entries[free] = TaskQueues {
                active: true,
                task_id,
                ..TaskQueues::empty()
            };
            free
        }
    };

    let entry = &mut table.entries[idx];
    if entry.count >= MAX_QUEUES_PER_TASK {
        klog_warn!("ipc: task_id={} already at MAX_QUEUES_PER_TASK", task_id);
        return Err(IpcError::NoResources);
    }
    entry.queues[entry.count] = handle;
    entry.count += 1;
    Ok(())
}

/// Remove `handle` from `task_id`'s queue list. If it was a default
/// send/receive queue, the default falls back to index 0 (or is left
/// dangling - `find` simply returns `None` - if the list is now empty).
pub fn unregister(task_id: u32, handle: IpcHandle) {
    let mut table = TABLE.lock();
    let Some(idx) = table.find(task_id) else {
        return;
    };
    let entry = &mut table.entries[idx];
    let Some(pos) = entry.queues[..entry.count].iter().position(|&h| h == handle) else {
        return;
    };
    for j in pos..entry.count - 1 {
        entry.queues[j] = entry.queues[j + 1];
    }
    entry.count -= 1;
    if entry.default_send_idx >= entry.count {
        entry.default_send_idx = 0;
    }
    if entry.default_recv_idx >= entry.count {
        entry.default_recv_idx = 0;
    }
}

/// Point `task_id`'s default send or receive queue at `handle`, which must
/// already be one of its registered queues.
pub fn set_default(task_id: u32, handle: IpcHandle, mode: QueueLookupMode) -> IpcResult<()> {
    let mut table = TABLE.lock();
    let idx = table.find(task_id).ok_or(IpcError::NotFound)?;
    let entry = &mut table.entries[idx];
    let pos = entry.queues[..entry.count]
        .iter()
        .position(|&h| h == handle)
        .ok_or(IpcError::NotFound)?;
    match mode {
        QueueLookupMode::Send => entry.default_send_idx = pos,
        QueueLookupMode::Receive => entry.default_recv_idx = pos,
        QueueLookupMode::Any => {
            entry.default_send_idx = pos;
            entry.default_recv_idx = pos;
        }
    }
    Ok(())
}

/// Resolve `task_id`'s queue for `mode`. `Any` returns the default send
/// queue if present, else the default receive queue, else the first
/// registered queue.
pub fn find(task_id: u32, mode: QueueLookupMode) -> Option<IpcHandle> {
    let table = TABLE.lock();
    let idx = table.find(task_id)?;
    let entry = &table.entries[idx];
    if entry.count == 0 {
        return None;
    }
    let handle = match mode {
        QueueLookupMode::Send => entry.queues[entry.default_send_idx],
        QueueLookupMode::Receive => entry.queues[entry.default_recv_idx],
        QueueLookupMode::Any => entry.queues[entry.default_send_idx],
    };
    Some(handle)
}

/// Remove `task_id`'s entire registration (C10). The queues themselves are
/// destroyed through the general refcount path, not here.
pub fn cleanup_task(task_id: u32) {
    let mut table = TABLE.lock();
    if let Some(idx) = table.find(task_id) {
        table.entries[idx] = TaskQueues::empty();
    }
}
