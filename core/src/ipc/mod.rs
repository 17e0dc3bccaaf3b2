//! IPC core: mutexes, counting semaphores, events/event-sets, priority
//! message queues, and named shared-memory segments, plus the cross-cutting
//! object registry, wait-queue machinery, statistics, and task-cleanup hook
//! that tie them together.
//!
//! Every object kind follows the same shape: a fixed-capacity pool of
//! `IrqMutex`-guarded slots, a [`object::Registry`] entry for name lookup and
//! ownership tracking, and a [`waitqueue::WaitQueue`] embedded in the slot
//! for FIFO blocking. See `object.rs` for the shared header/registry model
//! and `waitqueue.rs` for the blocking primitive every other module builds
//! on.

pub mod cleanup;
pub mod error;
pub mod event;
pub mod message_queue;
pub mod mutex;
pub mod object;
pub mod queue_registry;
pub mod semaphore;
pub mod shared_memory;
pub mod stats;
pub mod waitqueue;

#[cfg(any(test, feature = "itests"))]
pub mod ipc_tests;

pub use error::{IpcError, IpcResult};
pub use object::ObjectKind;
pub use stats::IpcStatsSnapshot;

/// Maximum number of mutexes live at once.
pub const MAX_MUTEXES: usize = 64;
/// Maximum number of counting semaphores live at once.
pub const MAX_SEMAPHORES: usize = 64;
/// Maximum number of individual events live at once.
pub const MAX_EVENTS: usize = 64;
/// Maximum number of event sets live at once.
pub const MAX_EVENT_SETS: usize = 32;
/// Maximum number of member events a single event set can track.
pub const MAX_EVENTS_PER_SET: usize = 16;
/// Maximum number of message queues live at once.
pub const MAX_MESSAGE_QUEUES: usize = 32;
/// Maximum number of messages a single queue can hold.
pub const MAX_QUEUE_DEPTH: usize = 64;
/// Maximum number of named shared-memory segments live at once.
pub const MAX_SHARED_SEGMENTS: usize = 64;
/// Maximum number of per-task mappings of a single shared-memory segment.
pub const MAX_MAPPINGS_PER_SEGMENT: usize = 8;
/// Maximum number of distinct queues a single task may own (see C8).
pub const MAX_QUEUES_PER_TASK: usize = 8;

/// Total registry slots: every object of every kind is registered centrally
/// so names are unique across kinds, not just within one pool.
pub const MAX_IPC_OBJECTS: usize =
    MAX_MUTEXES + MAX_SEMAPHORES + MAX_EVENTS + MAX_EVENT_SETS + MAX_MESSAGE_QUEUES + MAX_SHARED_SEGMENTS;

/// Drive timed waits to completion. Called once per timer tick from
/// [`crate::scheduler::scheduler::scheduler_timer_tick`], the same way
/// [`crate::scheduler::sleep::wake_due_sleepers`] drains the sleep queue.
pub fn ipc_timer_tick(now_tick: u64) {
    mutex::scan_timeouts(now_tick);
    semaphore::scan_timeouts(now_tick);
    event::scan_timeouts(now_tick);
    message_queue::scan_timeouts(now_tick);
}
