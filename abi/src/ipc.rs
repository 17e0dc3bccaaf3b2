//! IPC ABI types shared between the kernel IPC core and userland callers:
//! object handles, name/size limits, and permission/creation bitflags for
//! mutexes, semaphores, events, message queues, and shared-memory segments.

use bitflags::bitflags;

/// Maximum length (bytes, not counting a NUL terminator) of a registered
/// IPC object name.
pub const MAX_IPC_NAME_LENGTH: usize = 64;

/// Maximum payload size of a single message-queue message.
pub const MAX_MESSAGE_SIZE: usize = 1024;

/// Sentinel returned in place of a handle when an operation fails before a
/// slot is allocated.
pub const INVALID_IPC_HANDLE: u32 = 0xFFFF_FFFF;

/// An opaque, ABI-stable reference to a registered IPC object.
///
/// Encodes a registry slot index in the low 16 bits and a generation counter
/// in the high 16 bits, so a handle to a destroyed-and-reused slot never
/// silently aliases the new occupant.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct IpcHandle(pub u32);

impl IpcHandle {
    pub const INVALID: Self = Self(INVALID_IPC_HANDLE);

    #[inline]
    pub const fn new(slot: u16, generation: u16) -> Self {
        Self(((generation as u32) << 16) | (slot as u32))
    }

    #[inline]
    pub const fn slot(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    #[inline]
    pub const fn generation(self) -> u16 {
        (self.0 >> 16) as u16
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 != INVALID_IPC_HANDLE
    }
}

bitflags! {
    /// Access permissions requested when mapping a named shared-memory
    /// segment into a task's address space.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ShmPermissions: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXEC = 0x4;
    }
}

bitflags! {
    /// Flags governing shared-memory segment creation and lifecycle.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ShmCreateFlags: u32 {
        /// Fail with `AlreadyExists` instead of returning the existing
        /// segment when a segment of this name is already registered.
        const EXCL = 0x1;
        /// Allow `shm_resize` to grow or shrink this segment after creation.
        const RESIZABLE = 0x2;
        /// Zero-fill newly allocated pages (the default; explicit for
        /// callers that want to assert on it).
        const ZERO_INIT = 0x4;
        /// Lower the `WRITABLE` bit and set the `COW` bit on every mapping
        /// of this segment instead of mapping it directly writable.
        const COW = 0x8;
        /// Accepted for ABI compatibility; no persistence layer exists,
        /// so this is a no-op.
        const PERSIST = 0x10;
        /// Accepted for ABI compatibility; no page-locking/pinning support
        /// exists yet, so this is a no-op.
        const LOCKED = 0x20;
    }
}

bitflags! {
    /// Flags controlling event-set membership semantics.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct EventSetWaitFlags: u32 {
        /// Wait for every member event to be signaled, not just one.
        const WAIT_ALL = 0x1;
    }
}

/// Delivery priority of a message-queue message. Ordered so that a plain
/// numeric comparison (`HIGH > NORMAL`) matches queue precedence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum MessagePriority {
    Low = 0,
    Normal = 1,
    High = 2,
    Urgent = 3,
}

bitflags! {
    /// Per-send/per-message flags on a message-queue message.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MessageFlags: u32 {
        /// Caller requested `send`/`receive` never block.
        const NONBLOCK = 0x1;
        /// Sender expects (and is waiting for) a reply; `scan_timeouts`
        /// marks this message with `TIMED_OUT` after it goes unanswered.
        const WAIT_REPLY = 0x2;
        /// This message is itself a reply to an earlier `WAIT_REPLY` send.
        const RESPONSE = 0x4;
        /// Set by `scan_timeouts` on a `WAIT_REPLY` message that exceeded
        /// the reply deadline; a notification only, not an error return.
        const TIMED_OUT = 0x8;
        /// Synonym for `NONBLOCK` at the syscall boundary; some callers
        /// spell a non-blocking request this way instead.
        const NOWAIT = 0x10;
        /// Caller asserts `priority == Urgent` should cut straight to the
        /// head of the queue via a bulk shift rather than the usual
        /// backward priority scan.
        const PRIORITY = 0x20;
    }
}

/// A single message-queue message. Fixed layout so it can sit directly in a
/// ring buffer slot with no indirection.
#[derive(Clone, Copy)]
pub struct Message {
    pub id: u64,
    pub sender: u32,
    pub receiver: u32,
    pub priority: MessagePriority,
    pub flags: MessageFlags,
    pub reply_id: u64,
    pub timestamp: u64,
    pub size: usize,
    pub payload: [u8; MAX_MESSAGE_SIZE],
}

impl Message {
    pub const fn empty() -> Self {
        Self {
            id: 0,
            sender: 0,
            receiver: 0,
            priority: MessagePriority::Normal,
            flags: MessageFlags::empty(),
            reply_id: 0,
            timestamp: 0,
            size: 0,
            payload: [0; MAX_MESSAGE_SIZE],
        }
    }
}

/// Which of a task's registered queues a lookup should resolve to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueLookupMode {
    Send,
    Receive,
    Any,
}
