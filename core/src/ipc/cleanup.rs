//! C10: the task-cleanup hook invoked by the scheduler when a task
//! terminates.
//!
//! Mirrors `video_task_cleanup`/`shm_cleanup_task` in
//! `scheduler::task::cleanup_terminated_task_resources` - one free function
//! per subsystem, called in a fixed order so a mutex a terminated task owned
//! is released to its waiters before the message queues that might be
//! waiting on that same task are scanned:
//! mutexes -> semaphores -> events/sets -> message queues -> shared memory.
//! Each subsystem only tears down *per-task* state (wait-queue membership,
//! ownership, mappings); objects the task owned outright are only destroyed
//! once their refcount reaches zero, same as any other `decref` path.

use slopos_lib::klog_debug;

use super::{event, message_queue, mutex, semaphore, shared_memory};

/// Release every piece of per-task IPC state for `task_id`. Called once,
/// from the scheduler's terminated-task teardown path, after the task has
/// been marked `Terminated` but before its `Task` struct is freed.
pub fn cleanup_task(task_id: u32) {
    klog_debug!("ipc: cleaning up task_id={}", task_id);
    mutex::cleanup_task(task_id);
    semaphore::cleanup_task(task_id);
    event::cleanup_task(task_id);
    message_queue::cleanup_task(task_id);
    shared_memory::cleanup_task(task_id);
}
