//! Error taxonomy shared by every IPC primitive.

use core::fmt;

/// Failure modes common to mutexes, semaphores, events, message queues and
/// shared-memory segments. Mirrors the `MmError`/`VfsError` convention: a
/// plain `Copy` enum with a `Display` impl, never a panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    /// The handle's slot/generation pair does not refer to a live object.
    InvalidHandle,
    /// An argument was out of range or otherwise malformed.
    InvalidArg,
    /// A non-blocking call could not complete immediately.
    WouldBlock,
    /// A blocking call's timeout elapsed before it could complete.
    Timeout,
    /// The object is held or otherwise not available to this caller right now.
    Busy,
    /// The caller does not own the object (e.g. unlocking a mutex it does
    /// not hold, destroying a segment it did not create).
    NotOwner,
    /// An object with this name is already registered.
    AlreadyExists,
    /// No object with this name is registered.
    NotFound,
    /// A fixed-capacity pool (objects, waiters, queue slots, pages) is full.
    NoResources,
    /// The object was destroyed while the caller was waiting on it.
    Destroyed,
    /// The caller's requested access exceeds what it was granted.
    PermissionDenied,
    /// A counter or ring buffer would exceed its maximum value/capacity.
    Overflow,
}

impl fmt::Display for IpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            IpcError::InvalidHandle => "invalid or stale IPC handle",
            IpcError::InvalidArg => "invalid argument",
            IpcError::WouldBlock => "operation would block",
            IpcError::Timeout => "operation timed out",
            IpcError::Busy => "object is busy",
            IpcError::NotOwner => "caller does not own this object",
            IpcError::AlreadyExists => "an object with this name already exists",
            IpcError::NotFound => "no object with this name is registered",
            IpcError::NoResources => "no free IPC object slots",
            IpcError::Destroyed => "object was destroyed while waiting",
            IpcError::PermissionDenied => "permission denied",
            IpcError::Overflow => "counter or capacity overflow",
        };
        f.write_str(msg)
    }
}

pub type IpcResult<T = ()> = Result<T, IpcError>;
