//! Integration tests for the IPC core: one scenario per primitive plus the
//! cross-cutting registry/stats/cleanup machinery, in the style of
//! `slopos_mm::tests`'s `shm` suite.
//!
//! None of these drive a real blocking wait - there is no scheduler running
//! under the test harness to wake a blocked task, so every case either stays
//! on the trylock/trywait/try_receive/nonblocking-send path, or calls `wait`
//! only on an event already signaled before the call. `mutex::unlock`/
//! `semaphore::post`'s direct-handoff behavior still lets two-task contention
//! be exercised without ever blocking: with no waiter queued, a second task's
//! `lock`/`wait` after an `unlock`/`post` completes immediately.

use slopos_abi::ipc::{
    EventSetWaitFlags, MessageFlags, MessagePriority, QueueLookupMode, ShmCreateFlags,
    ShmPermissions,
};
use slopos_lib::testing::TestResult;
use slopos_lib::{assert_eq_test, assert_ok, assert_test, fail, pass};

use super::event::{self, EventResetMode};
use super::message_queue;
use super::mutex;
use super::object::REGISTRY;
use super::queue_registry;
use super::semaphore;
use super::shared_memory;
use super::stats;

const TASK_A: u32 = 9001;
const TASK_B: u32 = 9002;

/// Recursive lock/unlock by the owner, then direct handoff to a second task
/// once the owner's last `unlock` drops the recursion count to zero.
pub fn test_mutex_recursion_and_handoff() -> TestResult {
    let handle = assert_ok!(mutex::create("test.mutex.recursion", TASK_A));

    assert_ok!(mutex::lock(handle, TASK_A, None));
    assert_ok!(mutex::lock(handle, TASK_A, None));
    assert_test!(
        mutex::trylock(handle, TASK_B).is_err(),
        "second task should not acquire while owner holds nested lock"
    );

    assert_ok!(mutex::unlock(handle, TASK_A));
    assert_test!(
        mutex::trylock(handle, TASK_B).is_err(),
        "mutex should still be held after only one of two unlocks"
    );

    assert_ok!(mutex::unlock(handle, TASK_A));
    // Wait queue was empty at the final unlock, so ownership reverts to
    // free rather than handing off - this is what makes the following
    // trylock succeed without blocking.
    assert_ok!(mutex::trylock(handle, TASK_B));
    assert_ok!(mutex::unlock(handle, TASK_B));

    let _ = mutex::destroy(handle);
    pass!()
}

pub fn test_mutex_unlock_not_owner() -> TestResult {
    let handle = assert_ok!(mutex::create("test.mutex.not_owner", TASK_A));
    assert_ok!(mutex::lock(handle, TASK_A, None));

    assert_test!(
        mutex::unlock(handle, TASK_B).is_err(),
        "unlock by non-owner should fail"
    );

    assert_ok!(mutex::unlock(handle, TASK_A));
    let _ = mutex::destroy(handle);
    pass!()
}

/// Bounded counting semaphore: acquire to zero, `trywait` fails, `post`
/// refills, `Overflow` once back at `max_count` with nobody waiting.
pub fn test_semaphore_bounded_post_wait() -> TestResult {
    let handle = assert_ok!(semaphore::create("test.sem.bounded", TASK_A, 2, 2));

    assert_ok!(semaphore::trywait(handle));
    assert_ok!(semaphore::trywait(handle));
    assert_test!(
        semaphore::trywait(handle).is_err(),
        "trywait should fail once the semaphore is drained"
    );

    assert_ok!(semaphore::post(handle));
    assert_ok!(semaphore::post(handle));
    assert_test!(
        semaphore::post(handle).is_err(),
        "post past max_count with no waiters should overflow"
    );

    assert_eq_test!(semaphore::getvalue(handle), Ok(2));
    let _ = semaphore::destroy(handle);
    pass!()
}

pub fn test_semaphore_create_rejects_bad_bounds() -> TestResult {
    assert_test!(
        semaphore::create("test.sem.bad_bounds", TASK_A, 5, 2).is_err(),
        "initial_count above max_count should be rejected"
    );
    pass!()
}

/// Auto-reset events clear on the waking `wait`/`signal`; manual-reset stay
/// signaled until `reset`.
pub fn test_event_auto_vs_manual_reset() -> TestResult {
    let auto = assert_ok!(event::create(
        "test.event.auto",
        TASK_A,
        EventResetMode::AutoReset
    ));
    assert_ok!(event::signal(auto));
    // No waiter was queued, so the signal latches; this wait observes it
    // already signaled and clears it again without ever blocking.
    assert_ok!(event::wait(auto, Some(0)));
    assert_test!(
        event::wait(auto, Some(0)).is_err(),
        "auto-reset event should have cleared itself after the first wait"
    );
    let _ = event::destroy(auto);

    let manual = assert_ok!(event::create(
        "test.event.manual",
        TASK_A,
        EventResetMode::ManualReset
    ));
    assert_ok!(event::signal(manual));
    assert_ok!(event::wait(manual, Some(0)));
    assert_ok!(
        event::wait(manual, Some(0)),
        "manual-reset event should stay signaled across multiple waits"
    );
    assert_ok!(event::reset(manual));
    assert_test!(
        event::wait(manual, Some(0)).is_err(),
        "event should no longer be signaled after reset"
    );
    let _ = event::destroy(manual);
    pass!()
}

/// An event set reports the lowest-indexed already-signaled member.
pub fn test_event_set_tie_break() -> TestResult {
    let e0 = assert_ok!(event::create(
        "test.eventset.member0",
        TASK_A,
        EventResetMode::ManualReset
    ));
    let e1 = assert_ok!(event::create(
        "test.eventset.member1",
        TASK_A,
        EventResetMode::ManualReset
    ));
    let set = assert_ok!(event::create_set(
        "test.eventset.set",
        TASK_A,
        &[e0, e1]
    ));

    assert_ok!(event::signal(e1));
    assert_ok!(event::signal(e0));

    let fired = assert_ok!(event::wait_set(set, EventSetWaitFlags::empty(), Some(0)));
    assert_eq_test!(fired, e0, "lowest-indexed signaled member should win the tie");

    let _ = event::destroy_set(set);
    let _ = event::destroy(e0);
    let _ = event::destroy(e1);
    pass!()
}

/// Messages come back out in priority order, FIFO within a priority class.
pub fn test_message_queue_priority_ordering() -> TestResult {
    let handle = assert_ok!(message_queue::create("test.mq.priority", TASK_A, 4));

    assert_ok!(message_queue::send(
        handle,
        TASK_A,
        TASK_B,
        MessagePriority::Normal,
        MessageFlags::empty(),
        b"normal-1",
        None,
    ));
    assert_ok!(message_queue::send(
        handle,
        TASK_A,
        TASK_B,
        MessagePriority::Urgent,
        MessageFlags::empty(),
        b"urgent",
        None,
    ));
    assert_ok!(message_queue::send(
        handle,
        TASK_A,
        TASK_B,
        MessagePriority::Normal,
        MessageFlags::empty(),
        b"normal-2",
        None,
    ));

    let first = assert_ok!(message_queue::try_receive(handle));
    assert_eq_test!(first.priority, MessagePriority::Urgent, "urgent message should come first");

    let second = assert_ok!(message_queue::try_receive(handle));
    assert_eq_test!(&second.payload[..second.size], b"normal-1", "normal messages should stay FIFO");

    let third = assert_ok!(message_queue::try_receive(handle));
    assert_eq_test!(&third.payload[..third.size], b"normal-2");

    assert_test!(
        message_queue::try_receive(handle).is_err(),
        "queue should be empty after draining all three"
    );

    let _ = message_queue::destroy(handle);
    pass!()
}

pub fn test_message_queue_full_nonblocking() -> TestResult {
    let handle = assert_ok!(message_queue::create("test.mq.full", TASK_A, 1));

    assert_ok!(message_queue::send(
        handle,
        TASK_A,
        TASK_B,
        MessagePriority::Normal,
        MessageFlags::empty(),
        b"only-slot",
        None,
    ));
    let overflow = message_queue::send(
        handle,
        TASK_A,
        TASK_B,
        MessagePriority::Normal,
        MessageFlags::NONBLOCK,
        b"no-room",
        None,
    );
    assert_test!(overflow.is_err(), "NONBLOCK send against a full queue should fail immediately");

    let _ = message_queue::destroy(handle);
    pass!()
}

/// `reply` routes to the sender's default receive queue, and fails with
/// `NotFound` if the sender never registered one.
pub fn test_message_queue_reply_routing() -> TestResult {
    let handle = assert_ok!(message_queue::create("test.mq.reply.req", TASK_B, 2));
    let reply_queue = assert_ok!(message_queue::create("test.mq.reply.resp", TASK_A, 2));
    assert_ok!(queue_registry::set_default(
        TASK_A,
        reply_queue,
        QueueLookupMode::Receive
    ));

    assert_ok!(message_queue::send(
        handle,
        TASK_A,
        TASK_B,
        MessagePriority::Normal,
        MessageFlags::WAIT_REPLY,
        b"ping",
        None,
    ));
    let request = assert_ok!(message_queue::try_receive(handle));
    assert_ok!(message_queue::reply(&request, b"pong"));

    let response = assert_ok!(message_queue::try_receive(reply_queue));
    assert_test!(
        response.flags.contains(MessageFlags::RESPONSE),
        "reply should carry the RESPONSE flag"
    );
    assert_eq_test!(&response.payload[..response.size], b"pong");

    let _ = message_queue::destroy(handle);
    let _ = message_queue::destroy(reply_queue);
    pass!()
}

pub fn test_message_queue_reply_no_default_queue() -> TestResult {
    let handle = assert_ok!(message_queue::create("test.mq.reply.orphan", TASK_A, 1));
    let msg = assert_ok!(message_queue::send(
        handle,
        99_999,
        TASK_A,
        MessagePriority::Normal,
        MessageFlags::empty(),
        b"hello",
        None,
    ));
    let request = assert_ok!(message_queue::try_receive(handle));
    assert_eq_test!(request.id, msg);
    assert_test!(
        message_queue::reply(&request, b"nobody").is_err(),
        "reply to a sender with no registered receive queue should fail NotFound"
    );
    let _ = message_queue::destroy(handle);
    pass!()
}

/// Create, map-free round trip through the registry: grow is rejected
/// without `RESIZABLE`, and a second `create` of the same `EXCL` name fails.
pub fn test_shared_memory_create_destroy_and_excl() -> TestResult {
    let handle = assert_ok!(shared_memory::create(
        "test.shm.segment",
        TASK_A,
        4096,
        ShmPermissions::READ | ShmPermissions::WRITE,
        ShmCreateFlags::EXCL,
    ));

    assert_test!(
        shared_memory::create(
            "test.shm.segment",
            TASK_A,
            4096,
            ShmPermissions::READ,
            ShmCreateFlags::EXCL,
        )
        .is_err(),
        "EXCL create of an existing name should fail AlreadyExists"
    );

    assert_test!(
        shared_memory::destroy(handle, TASK_B).is_err(),
        "destroy by a non-owner task should fail"
    );

    assert_ok!(shared_memory::destroy(handle, TASK_A));
    pass!()
}

/// `cleanup_task` (C10) must drop a task's mutex ownership, hand the lock
/// off to nobody since no one else is waiting, and remove it from the
/// registry's name-to-owner bookkeeping used by `owned_by`.
pub fn test_cleanup_task_releases_mutex_ownership() -> TestResult {
    let handle = assert_ok!(mutex::create("test.cleanup.mutex", TASK_A));
    assert_ok!(mutex::lock(handle, TASK_A, None));

    mutex::cleanup_task(TASK_A);

    assert_ok!(mutex::trylock(handle, TASK_B));
    assert_ok!(mutex::unlock(handle, TASK_B));
    let _ = mutex::destroy(handle);
    pass!()
}

/// Destroying an event still referenced by a set defers teardown until the
/// set releases it (C1's refcount-closure invariant).
pub fn test_event_destroy_deferred_while_in_set() -> TestResult {
    let member = assert_ok!(event::create(
        "test.cleanup.event_member",
        TASK_A,
        EventResetMode::ManualReset
    ));
    let set = assert_ok!(event::create_set("test.cleanup.event_set", TASK_A, &[member]));

    assert_ok!(event::destroy(member));
    // Still referenced by the set: signaling should not yet fail with
    // InvalidHandle even though the owner's own handle was released.
    assert_ok!(event::signal(member));

    let _ = event::destroy_set(set);
    assert_test!(
        event::signal(member).is_err(),
        "event should be fully torn down once the set releases its reference"
    );
    pass!()
}

/// Process-wide counters move in the expected direction across a handful of
/// operations; exact values depend on suite ordering so only deltas and
/// invariants are checked, not absolute counts.
pub fn test_stats_snapshot_reflects_activity() -> TestResult {
    let before = stats::snapshot();

    let handle = assert_ok!(mutex::create("test.stats.mutex", TASK_A));
    assert_ok!(mutex::lock(handle, TASK_A, None));
    assert_ok!(mutex::unlock(handle, TASK_A));
    let _ = mutex::destroy(handle);

    let after = stats::snapshot();
    assert_test!(
        after.mutex_locks > before.mutex_locks,
        "mutex_locks should have increased"
    );
    assert_test!(
        after.objects_created > before.objects_created,
        "objects_created is a lifetime counter and should only grow"
    );
    assert_test!(
        after.objects_destroyed > before.objects_destroyed,
        "objects_destroyed should have increased after destroy"
    );
    assert_eq_test!(
        after.live_mutexes, before.live_mutexes,
        "the mutex created and destroyed in this test should net to zero live mutexes"
    );
    assert_test!(
        REGISTRY.resolve(handle).is_err(),
        "handle should be unresolvable after destroy"
    );
    pass!()
}

slopos_lib::define_test_suite!(
    ipc,
    [
        test_mutex_recursion_and_handoff,
        test_mutex_unlock_not_owner,
        test_semaphore_bounded_post_wait,
        test_semaphore_create_rejects_bad_bounds,
        test_event_auto_vs_manual_reset,
        test_event_set_tie_break,
        test_message_queue_priority_ordering,
        test_message_queue_full_nonblocking,
        test_message_queue_reply_routing,
        test_message_queue_reply_no_default_queue,
        test_shared_memory_create_destroy_and_excl,
        test_cleanup_task_releases_mutex_ownership,
        test_event_destroy_deferred_while_in_set,
        test_stats_snapshot_reflects_activity,
    ]
);
