//! C7: bounded priority message queues.
//!
//! Conceptually built on C4+C5 (an internal mutex guarding the ring, plus
//! `msg_available`/`space_available` counting semaphores) - but rather than
//! nesting calls into [`super::mutex`]/[`super::semaphore`] (which would
//! mean dropping and reacquiring this module's own pool lock around a
//! context switch, the same hazard `futex.rs` avoids by never blocking
//! while holding a bucket lock), each queue slot embeds its own space/message
//! counters and a pair of [`WaitQueue`]s directly, the same shape
//! `mutex.rs`/`semaphore.rs` already use. The net blocking/ordering
//! semantics are identical either way.

use core::sync::atomic::{AtomicU64, Ordering};

use slopos_abi::ipc::{IpcHandle, Message, MessageFlags, MessagePriority, QueueLookupMode, MAX_MESSAGE_SIZE};
use slopos_lib::{klog_debug, klog_warn, IrqMutex};

use crate::platform;

use super::error::{IpcError, IpcResult};
use super::object::{ObjectKind, ObjectName, REGISTRY};
use super::queue_registry;
use super::stats;
use super::waitqueue::{block_current_task_for_ipc, deadline_from_timeout_ms, WaitQueue};
use super::{MAX_MESSAGE_QUEUES, MAX_QUEUE_DEPTH};

/// Reply messages unanswered this long are flagged `TIMED_OUT` by
/// `scan_timeouts` - a notification only; senders must inspect the flag.
const REPLY_TIMEOUT_MS: u64 = 30_000;

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

fn next_message_id() -> u64 {
    NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed)
}

struct QueueSlot {
    active: bool,
    capacity: usize,
    count: usize,
    high_count: usize,
    urgent_count: usize,
    timeout_count: u64,
    /// Dense, priority-ordered store: `entries[0]` is the next message a
    /// `receive` returns, `entries[count - 1]` was inserted most recently
    /// among its priority's lowest-priority run.
    entries: [Message; MAX_QUEUE_DEPTH],
    space_waiters: WaitQueue,
    msg_waiters: WaitQueue,
}

impl QueueSlot {
    const fn empty() -> Self {
        Self {
            active: false,
            capacity: 0,
            count: 0,
            high_count: 0,
            urgent_count: 0,
            timeout_count: 0,
            entries: [Message::empty(); MAX_QUEUE_DEPTH],
            space_waiters: WaitQueue::new(),
            msg_waiters: WaitQueue::new(),
        }
    }

    fn bump_priority_counter(&mut self, priority: MessagePriority, delta: isize) {
        let counter = match priority {
            MessagePriority::High => &mut self.high_count,
            MessagePriority::Urgent => &mut self.urgent_count,
            _ => return,
        };
        *counter = (*counter as isize + delta).max(0) as usize;
    }

    /// Insert keeping `entries[0..count]` in descending priority order,
    /// FIFO within a priority class. A `Urgent`-priority message sent with
    /// `MessageFlags::PRIORITY` skips the scan and goes straight to the
    /// head via a single bulk shift; everything else walks back from the
    /// tail to the last entry whose priority is `>=` the new message's and
    /// inserts right after it.
    fn insert(&mut self, msg: Message) {
        let insert_at = if msg.priority == MessagePriority::Urgent
            && msg.flags.contains(MessageFlags::PRIORITY)
        {
            0
        } else {
            let mut insert_at = 0;
            let mut i = self.count;
            while i > 0 {
                if self.entries[i - 1].priority >= msg.priority {
                    insert_at = i;
                    break;
                }
                i -= 1;
            }
            insert_at
        };
        let mut j = self.count;
        while j > insert_at {
            self.entries[j] = self.entries[j - 1];
            j -= 1;
        }
        self.entries[insert_at] = msg;
        self.count += 1;
        self.bump_priority_counter(msg.priority, 1);
    }

    fn remove_head(&mut self) -> Message {
        let msg = self.entries[0];
        for j in 0..self.count - 1 {
            self.entries[j] = self.entries[j + 1];
        }
        self.count -= 1;
        self.bump_priority_counter(msg.priority, -1);
        msg
    }

    /// Remove every message with `sender == task_id || receiver == task_id`
    /// (C10 cleanup), compacting the store and waking senders whose space
    /// just freed up. Returns the number removed.
    fn remove_for_task(&mut self, task_id: u32) -> usize {
        let mut removed = 0;
        let mut i = 0;
        while i < self.count {
            if self.entries[i].sender == task_id || self.entries[i].receiver == task_id {
                self.bump_priority_counter(self.entries[i].priority, -1);
                for j in i..self.count - 1 {
                    self.entries[j] = self.entries[j + 1];
                }
                self.count -= 1;
                removed += 1;
            } else {
                i += 1;
            }
        }
        for _ in 0..removed {
            self.space_waiters.wake_one();
        }
        removed
    }
}

static POOL: [IrqMutex<QueueSlot>; MAX_MESSAGE_QUEUES] = {
    const SLOT: IrqMutex<QueueSlot> = IrqMutex::new(QueueSlot::empty());
    [SLOT; MAX_MESSAGE_QUEUES]
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
    if header.kind != ObjectKind::MessageQueue {
        return Err(IpcError::InvalidHandle);
    }
    Ok(header.pool_index as usize)
}

/// Create a queue of the given `capacity` (`<= MAX_QUEUE_DEPTH`), and
/// register it in the queue registry (C8) for `owner_task_id`.
pub fn create(name: &str, owner_task_id: u32, capacity: usize) -> IpcResult<IpcHandle> {
    if capacity == 0 || capacity > MAX_QUEUE_DEPTH {
        return Err(IpcError::InvalidArg);
    }
    let object_name = ObjectName::new(name)?;
    let Some(pool_idx) = claim_free_slot() else {
        stats::record_allocation_failure();
        klog_warn!("ipc: message queue pool exhausted, name={}", name);
        return Err(IpcError::NoResources);
    };
    POOL[pool_idx].lock().capacity = capacity;

    let handle = match REGISTRY.register(
        ObjectKind::MessageQueue,
        object_name,
        owner_task_id,
        pool_idx as u16,
    ) {
        Ok(handle) => handle,
        Err(e) => {
            POOL[pool_idx].lock().active = false;
            return Err(e);
        }
    };

    if let Err(e) = queue_registry::register(owner_task_id, handle) {
        let _ = destroy(handle);
        return Err(e);
    }
    Ok(handle)
}

pub fn destroy(handle: IpcHandle) -> IpcResult<()> {
    let header = REGISTRY.unregister(handle)?;
    if header.kind != ObjectKind::MessageQueue {
        return Err(IpcError::InvalidHandle);
    }
    queue_registry::unregister(header.owner_task_id, handle);
    let mut slot = POOL[header.pool_index as usize].lock();
    slot.space_waiters.wake_all_destroyed();
    slot.msg_waiters.wake_all_destroyed();
    *slot = QueueSlot::empty();
    stats::record_object_destroyed();
    klog_debug!("ipc: destroyed message queue handle={:#x}", handle.0);
    Ok(())
}

/// Send `payload` with the given `priority`/`flags`, blocking up to
/// `timeout_ms` (`None` = forever) if the queue is full. `MessageFlags::NONBLOCK`
/// overrides `timeout_ms` and fails immediately with `WouldBlock` instead.
/// Returns the newly assigned, globally unique message ID.
pub fn send(
    handle: IpcHandle,
    sender_task_id: u32,
    receiver_task_id: u32,
    priority: MessagePriority,
    flags: MessageFlags,
    payload: &[u8],
    timeout_ms: Option<u32>,
) -> IpcResult<u64> {
    send_inner(
        handle,
        sender_task_id,
        receiver_task_id,
        priority,
        flags,
        0,
        payload,
        timeout_ms,
    )
}

#[allow(clippy::too_many_arguments)]
fn send_inner(
    handle: IpcHandle,
    sender_task_id: u32,
    receiver_task_id: u32,
    priority: MessagePriority,
    flags: MessageFlags,
    reply_id: u64,
    payload: &[u8],
    timeout_ms: Option<u32>,
) -> IpcResult<u64> {
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(IpcError::InvalidArg);
    }
    let msg_id = next_message_id();
    let mut msg = Message::empty();
    msg.id = msg_id;
    msg.sender = sender_task_id;
    msg.receiver = receiver_task_id;
    msg.priority = priority;
    msg.flags = flags;
    msg.reply_id = reply_id;
    msg.timestamp = platform::timer_ticks();
    msg.size = payload.len();
    msg.payload[..payload.len()].copy_from_slice(payload);

    let nonblock = flags.contains(MessageFlags::NONBLOCK);
    let deadline = timeout_ms.map(deadline_from_timeout_ms);

    loop {
        let cell = {
            let idx = pool_index(handle)?;
            let mut slot = POOL[idx].lock();

            if slot.count < slot.capacity {
                slot.insert(msg);
                stats::record_message_sent();
                slot.msg_waiters.wake_one();
                return Ok(msg_id);
            }
            if nonblock {
                return Err(IpcError::WouldBlock);
            }
            match slot.space_waiters.prepare_wait(deadline) {
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
        // Woken because space freed up; loop to re-check and insert.
    }
}

/// Receive the highest-priority, oldest-within-priority message, blocking up
/// to `timeout_ms` (`None` = forever) if the queue is empty.
pub fn receive(handle: IpcHandle, timeout_ms: Option<u32>) -> IpcResult<Message> {
    let deadline = timeout_ms.map(deadline_from_timeout_ms);
    loop {
        let cell = {
            let idx = pool_index(handle)?;
            let mut slot = POOL[idx].lock();

            if slot.count > 0 {
                let msg = slot.remove_head();
                stats::record_message_received();
                slot.space_waiters.wake_one();
                return Ok(msg);
            }
            match slot.msg_waiters.prepare_wait(deadline) {
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
    }
}

/// Non-blocking receive; `Err(WouldBlock)` if the queue is empty.
pub fn try_receive(handle: IpcHandle) -> IpcResult<Message> {
    let idx = pool_index(handle)?;
    let mut slot = POOL[idx].lock();
    if slot.count == 0 {
        return Err(IpcError::WouldBlock);
    }
    let msg = slot.remove_head();
    stats::record_message_received();
    slot.space_waiters.wake_one();
    Ok(msg)
}

/// Reply to `original`, routing to `original.sender`'s default receive
/// queue. Fails with `NotFound` if the sender has no such queue registered -
/// falling back to "any registered queue" here was a known bug upstream.
pub fn reply(original: &Message, payload: &[u8]) -> IpcResult<u64> {
    let dest = queue_registry::find(original.sender, QueueLookupMode::Receive).ok_or_else(|| {
        klog_warn!("ipc: reply has no destination queue, sender={}", original.sender);
        IpcError::NotFound
    })?;
    send_inner(
        dest,
        original.receiver,
        original.sender,
        MessagePriority::High,
        MessageFlags::RESPONSE,
        original.id,
        payload,
        None,
    )
}

/// Remove `task_id`'s blocked waiters and any messages it sent/was
/// addressed to (C10), compacting the ring.
pub fn cleanup_task(task_id: u32) {
    for slot_lock in POOL.iter() {
        let mut slot = slot_lock.lock();
        if !slot.active {
            continue;
        }
        slot.space_waiters.remove_task(task_id);
        slot.msg_waiters.remove_task(task_id);
        slot.remove_for_task(task_id);
    }
    queue_registry::cleanup_task(task_id);
    // Queues task_id created are destroyed now, refcount-gated exactly like
    // an explicit destroy() call.
    for header in REGISTRY.owned_by(task_id) {
        if header.kind == ObjectKind::MessageQueue {
            let _ = destroy(header.handle);
        }
    }
}

/// Drive timed-out senders/receivers to completion, and flag unanswered
/// `WAIT_REPLY` messages older than [`REPLY_TIMEOUT_MS`]. Called once per
/// timer tick.
pub fn scan_timeouts(now_tick: u64) {
    let freq = platform::timer_frequency() as u64;
    let reply_timeout_ticks = if freq == 0 {
        1
    } else {
        REPLY_TIMEOUT_MS.saturating_mul(freq) / 1000
    };

    for slot_lock in POOL.iter() {
        let mut slot = slot_lock.lock();
        if !slot.active {
            continue;
        }
        for _ in 0..slot.space_waiters.scan_timeouts(now_tick) {
            stats::record_wait_timeout();
        }
        for _ in 0..slot.msg_waiters.scan_timeouts(now_tick) {
            stats::record_wait_timeout();
        }

        for i in 0..slot.count {
            let msg = &mut slot.entries[i];
            if msg.flags.contains(MessageFlags::WAIT_REPLY)
                && !msg.flags.contains(MessageFlags::TIMED_OUT)
                && now_tick.wrapping_sub(msg.timestamp) >= reply_timeout_ticks
            {
                msg.flags |= MessageFlags::TIMED_OUT;
                slot.timeout_count += 1;
            }
        }
    }
}

/// Total tasks currently blocked sending to or receiving from any queue,
/// for [`super::stats`].
pub fn waiter_count() -> usize {
    POOL.iter()
        .map(|s| {
            let slot = s.lock();
            slot.space_waiters.len() + slot.msg_waiters.len()
        })
        .sum()
}
