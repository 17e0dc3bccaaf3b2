//! C3: process-wide IPC statistics.
//!
//! Plain atomic counters bumped by every primitive on the hot path, snapshot
//! into a `Copy` struct for callers — the same shape as
//! `lifecycle::get_scheduler_stats`/`per_cpu::get_total_switches`.

use core::sync::atomic::{AtomicU64, Ordering};

use super::object::{ObjectKind, REGISTRY};
use super::waitqueue;
use super::{event, message_queue, mutex, semaphore};

struct Counters {
    mutex_locks: AtomicU64,
    mutex_contended: AtomicU64,
    semaphore_waits: AtomicU64,
    semaphore_timeouts: AtomicU64,
    events_signaled: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    shm_segments_created: AtomicU64,
    shm_bytes_mapped: AtomicU64,
    objects_destroyed: AtomicU64,
    wait_timeouts: AtomicU64,
    allocation_failures: AtomicU64,
    permission_failures: AtomicU64,
}

impl Counters {
    const fn new() -> Self {
        Self {
            mutex_locks: AtomicU64::new(0),
            mutex_contended: AtomicU64::new(0),
            semaphore_waits: AtomicU64::new(0),
            semaphore_timeouts: AtomicU64::new(0),
            events_signaled: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            shm_segments_created: AtomicU64::new(0),
            shm_bytes_mapped: AtomicU64::new(0),
            objects_destroyed: AtomicU64::new(0),
            wait_timeouts: AtomicU64::new(0),
            allocation_failures: AtomicU64::new(0),
            permission_failures: AtomicU64::new(0),
        }
    }
}

static COUNTERS: Counters = Counters::new();

/// Immutable, `Copy` point-in-time view of process-wide IPC state. The
/// `live_*`/`active_waiters`/`total_wait_ticks` fields are computed from the
/// registry and wait queues at snapshot time rather than kept as running
/// counters, since unregister/wake already maintain that state for their own
/// purposes.
#[derive(Debug, Clone, Copy, Default)]
pub struct IpcStatsSnapshot {
    pub mutex_locks: u64,
    pub mutex_contended: u64,
    pub semaphore_waits: u64,
    pub semaphore_timeouts: u64,
    pub events_signaled: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub shm_segments_created: u64,
    pub shm_bytes_mapped: u64,
    pub objects_created: u64,
    pub objects_destroyed: u64,
    pub wait_timeouts: u64,
    pub timeout_failures: u64,
    pub allocation_failures: u64,
    pub permission_failures: u64,
    pub total_wait_ticks: u64,
    pub active_waiters: usize,
    pub live_mutexes: usize,
    pub live_semaphores: usize,
    pub live_events: usize,
    pub live_event_sets: usize,
    pub live_message_queues: usize,
    pub live_shared_segments: usize,
}

pub fn snapshot() -> IpcStatsSnapshot {
    let live = REGISTRY.live_counts();
    let live_of = |kind: ObjectKind| {
        live.iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    };

    IpcStatsSnapshot {
        mutex_locks: COUNTERS.mutex_locks.load(Ordering::Relaxed),
        mutex_contended: COUNTERS.mutex_contended.load(Ordering::Relaxed),
        semaphore_waits: COUNTERS.semaphore_waits.load(Ordering::Relaxed),
        semaphore_timeouts: COUNTERS.semaphore_timeouts.load(Ordering::Relaxed),
        events_signaled: COUNTERS.events_signaled.load(Ordering::Relaxed),
        messages_sent: COUNTERS.messages_sent.load(Ordering::Relaxed),
        messages_received: COUNTERS.messages_received.load(Ordering::Relaxed),
        shm_segments_created: COUNTERS.shm_segments_created.load(Ordering::Relaxed),
        shm_bytes_mapped: COUNTERS.shm_bytes_mapped.load(Ordering::Relaxed),
        objects_created: REGISTRY.created_total(),
        objects_destroyed: COUNTERS.objects_destroyed.load(Ordering::Relaxed),
        wait_timeouts: COUNTERS.wait_timeouts.load(Ordering::Relaxed),
        timeout_failures: COUNTERS.wait_timeouts.load(Ordering::Relaxed),
        allocation_failures: COUNTERS.allocation_failures.load(Ordering::Relaxed),
        permission_failures: COUNTERS.permission_failures.load(Ordering::Relaxed),
        total_wait_ticks: waitqueue::total_wait_ticks(),
        active_waiters: mutex::waiter_count()
            + semaphore::waiter_count()
            + event::waiter_count()
            + message_queue::waiter_count(),
        live_mutexes: live_of(ObjectKind::Mutex),
        live_semaphores: live_of(ObjectKind::Semaphore),
        live_events: live_of(ObjectKind::Event),
        live_event_sets: live_of(ObjectKind::EventSet),
        live_message_queues: live_of(ObjectKind::MessageQueue),
        live_shared_segments: live_of(ObjectKind::SharedMemory),
    }
}

pub(super) fn record_mutex_lock(contended: bool) {
    COUNTERS.mutex_locks.fetch_add(1, Ordering::Relaxed);
    if contended {
        COUNTERS.mutex_contended.fetch_add(1, Ordering::Relaxed);
    }
}

pub(super) fn record_semaphore_wait() {
    COUNTERS.semaphore_waits.fetch_add(1, Ordering::Relaxed);
}

pub(super) fn record_event_signal() {
    COUNTERS.events_signaled.fetch_add(1, Ordering::Relaxed);
}

pub(super) fn record_message_sent() {
    COUNTERS.messages_sent.fetch_add(1, Ordering::Relaxed);
}

pub(super) fn record_message_received() {
    COUNTERS.messages_received.fetch_add(1, Ordering::Relaxed);
}

pub(super) fn record_shm_created() {
    COUNTERS.shm_segments_created.fetch_add(1, Ordering::Relaxed);
}

pub(super) fn record_shm_mapped(bytes: usize) {
    COUNTERS
        .shm_bytes_mapped
        .fetch_add(bytes as u64, Ordering::Relaxed);
}

pub(super) fn record_object_destroyed() {
    COUNTERS.objects_destroyed.fetch_add(1, Ordering::Relaxed);
}

pub(super) fn record_wait_timeout() {
    COUNTERS.wait_timeouts.fetch_add(1, Ordering::Relaxed);
}

pub(super) fn record_semaphore_timeout() {
    COUNTERS.semaphore_timeouts.fetch_add(1, Ordering::Relaxed);
}

/// Bumped whenever `create`/`map` fails with `NoResources` - a pool or the
/// registry itself was full.
pub(super) fn record_allocation_failure() {
    COUNTERS.allocation_failures.fetch_add(1, Ordering::Relaxed);
}

/// Bumped whenever an operation fails with `NotOwner`/`PermissionDenied`.
pub(super) fn record_permission_failure() {
    COUNTERS.permission_failures.fetch_add(1, Ordering::Relaxed);
}
