//! C1: uniform object header and central registry.
//!
//! Every mutex, semaphore, event, event set, message queue and
//! shared-memory segment is registered here under a unique name so it can
//! be looked up, enumerated, and diagnosed the same way regardless of kind.
//! The registry only tracks identity and ownership; the object's actual
//! state (lock word, ring buffer, page list, ...) lives in that kind's own
//! fixed-capacity pool, addressed by `pool_index`.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use slopos_abi::ipc::{IpcHandle, MAX_IPC_NAME_LENGTH};
use slopos_lib::{klog_warn, IrqRwLock};

use super::error::{IpcError, IpcResult};
use super::MAX_IPC_OBJECTS;

/// The kind of object a registry entry/handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Mutex,
    Semaphore,
    Event,
    EventSet,
    MessageQueue,
    SharedMemory,
}

/// A fixed-capacity, NUL-free object name.
#[derive(Clone, Copy)]
pub struct ObjectName {
    bytes: [u8; MAX_IPC_NAME_LENGTH],
    len: u8,
}

impl ObjectName {
    pub const EMPTY: Self = Self {
        bytes: [0; MAX_IPC_NAME_LENGTH],
        len: 0,
    };

    pub fn new(name: &str) -> IpcResult<Self> {
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.len() > MAX_IPC_NAME_LENGTH {
            return Err(IpcError::InvalidArg);
        }
        let mut buf = [0u8; MAX_IPC_NAME_LENGTH];
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            bytes: buf,
            len: bytes.len() as u8,
        })
    }

    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }
}

impl PartialEq for ObjectName {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}
impl Eq for ObjectName {}

/// A snapshot of a live registry entry, returned by [`Registry::dump_all`]
/// and [`Registry::resolve`].
#[derive(Clone, Copy)]
pub struct ObjectHeader {
    pub handle: IpcHandle,
    pub kind: ObjectKind,
    pub name: ObjectName,
    pub owner_task_id: u32,
    pub pool_index: u16,
    pub ref_count: u32,
}

#[derive(Clone, Copy)]
struct RegistryEntry {
    active: bool,
    generation: u16,
    kind: ObjectKind,
    name: ObjectName,
    owner_task_id: u32,
    pool_index: u16,
    /// Extra references beyond the creator's own, e.g. an event held by an
    /// event set, or a shared-memory segment held by a per-task mapping.
    /// `unregister` is a forced removal used by kinds with no secondary
    /// referrers (mutex/semaphore/message queue); [`decref`] is the
    /// refcount-gated teardown path events and shared memory use.
    ref_count: u32,
}

impl RegistryEntry {
    const fn empty() -> Self {
        Self {
            active: false,
            generation: 0,
            kind: ObjectKind::Mutex,
            name: ObjectName::EMPTY,
            owner_task_id: 0,
            pool_index: 0,
            ref_count: 0,
        }
    }
}

/// Result of [`Registry::check_health`]: a best-effort diagnostic pass over
/// every slot, not a correctness proof.
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthReport {
    pub live_objects: usize,
    pub free_slots: usize,
    /// Slots whose generation wrapped to 0 without being marked inactive
    /// (would silently alias a fresh handle of generation 0).
    pub generation_anomalies: usize,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.generation_anomalies == 0
    }
}

struct RegistryInner {
    entries: [RegistryEntry; MAX_IPC_OBJECTS],
}

impl RegistryInner {
    const fn new() -> Self {
        Self {
            entries: [RegistryEntry::empty(); MAX_IPC_OBJECTS],
        }
    }
}

pub struct Registry {
    inner: IrqRwLock<RegistryInner>,
    created_total: AtomicU64,
}

impl Registry {
    const fn new() -> Self {
        Self {
            inner: IrqRwLock::new(RegistryInner::new()),
            created_total: AtomicU64::new(0),
        }
    }

    /// Lifetime count of objects ever registered, for [`super::stats`].
    pub fn created_total(&self) -> u64 {
        self.created_total.load(Ordering::Relaxed)
    }

    /// Live objects of each kind, for [`super::stats`].
    pub fn live_counts(&self) -> [(ObjectKind, usize); 6] {
        let inner = self.inner.read();
        let mut counts = [
            (ObjectKind::Mutex, 0usize),
            (ObjectKind::Semaphore, 0),
            (ObjectKind::Event, 0),
            (ObjectKind::EventSet, 0),
            (ObjectKind::MessageQueue, 0),
            (ObjectKind::SharedMemory, 0),
        ];
        for entry in inner.entries.iter().filter(|e| e.active) {
            for (kind, count) in counts.iter_mut() {
                if *kind == entry.kind {
                    *count += 1;
                }
            }
        }
        counts
    }

    /// Register a new object. Fails with `AlreadyExists` if `name` is
    /// already taken by a live object of any kind, or `NoResources` if the
    /// registry is full.
    pub fn register(
        &self,
        kind: ObjectKind,
        name: ObjectName,
        owner_task_id: u32,
        pool_index: u16,
    ) -> IpcResult<IpcHandle> {
        let mut inner = self.inner.write();

        if inner
            .entries
            .iter()
            .any(|e| e.active && e.name == name)
        {
            klog_warn!("ipc: registry name already taken, name={}", name.as_str());
            return Err(IpcError::AlreadyExists);
        }

        let slot = inner.entries.iter().position(|e| !e.active).ok_or_else(|| {
            klog_warn!("ipc: registry full, name={}", name.as_str());
            IpcError::NoResources
        })?;

        let generation = inner.entries[slot].generation.wrapping_add(1).max(1);
        inner.entries[slot] = RegistryEntry {
            active: true,
            generation,
            kind,
            name,
            owner_task_id,
            pool_index,
            ref_count: 1,
        };

        self.created_total.fetch_add(1, Ordering::Relaxed);
        Ok(IpcHandle::new(slot as u16, generation))
    }

    /// Add one reference to an already-registered object, e.g. an event
    /// added to an event set. Fails with `InvalidHandle` if it is not live.
    pub fn incref(&self, handle: IpcHandle) -> IpcResult<()> {
        let mut inner = self.inner.write();
        let slot = handle.slot() as usize;
        let entry = inner
            .entries
            .get_mut(slot)
            .filter(|e| e.active && e.generation == handle.generation())
            .ok_or(IpcError::InvalidHandle)?;
        entry.ref_count = entry.ref_count.saturating_add(1);
        Ok(())
    }

    /// Release one reference. Returns `true` if the count reached zero -
    /// the caller (e.g. [`super::event::destroy`]) is then responsible for
    /// actually tearing the object down and calling [`unregister`]. Returns
    /// `false` if other referrers remain, in which case the handle stays
    /// live and the caller must not free the backing pool slot.
    pub fn decref(&self, handle: IpcHandle) -> IpcResult<bool> {
        let mut inner = self.inner.write();
        let slot = handle.slot() as usize;
        let entry = inner
            .entries
            .get_mut(slot)
            .filter(|e| e.active && e.generation == handle.generation())
            .ok_or(IpcError::InvalidHandle)?;
        entry.ref_count = entry.ref_count.saturating_sub(1);
        Ok(entry.ref_count == 0)
    }

    /// Remove the registry entry for `handle`. Returns the entry so the
    /// caller can free the matching pool slot.
    pub fn unregister(&self, handle: IpcHandle) -> IpcResult<ObjectHeader> {
        let mut inner = self.inner.write();
        let slot = handle.slot() as usize;
        let entry = inner
            .entries
            .get(slot)
            .copied()
            .filter(|e| e.active && e.generation == handle.generation())
            .ok_or(IpcError::InvalidHandle)?;

        inner.entries[slot] = RegistryEntry::empty();
        inner.entries[slot].generation = entry.generation;

        Ok(ObjectHeader {
            handle,
            kind: entry.kind,
            name: entry.name,
            owner_task_id: entry.owner_task_id,
            pool_index: entry.pool_index,
            ref_count: entry.ref_count,
        })
    }

    /// Validate `handle` and return its header without removing it.
    pub fn resolve(&self, handle: IpcHandle) -> IpcResult<ObjectHeader> {
        let inner = self.inner.read();
        let slot = handle.slot() as usize;
        let entry = inner
            .entries
            .get(slot)
            .filter(|e| e.active && e.generation == handle.generation())
            .ok_or(IpcError::InvalidHandle)?;

        Ok(ObjectHeader {
            handle,
            kind: entry.kind,
            name: entry.name,
            owner_task_id: entry.owner_task_id,
            pool_index: entry.pool_index,
            ref_count: entry.ref_count,
        })
    }

    pub fn lookup_by_name(&self, kind: ObjectKind, name: &str) -> Option<IpcHandle> {
        let inner = self.inner.read();
        inner
            .entries
            .iter()
            .enumerate()
            .find(|(_, e)| e.active && e.kind == kind && e.name.as_str() == name)
            .map(|(slot, e)| IpcHandle::new(slot as u16, e.generation))
    }

    /// Snapshot of every live object header, for diagnostic consumers
    /// (`kdiag`-style dumps). Returns owned data rather than a borrowing
    /// iterator so callers can print it without holding the registry lock.
    pub fn dump_all(&self) -> Vec<ObjectHeader> {
        let inner = self.inner.read();
        inner
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.active)
            .map(|(slot, e)| ObjectHeader {
                handle: IpcHandle::new(slot as u16, e.generation),
                kind: e.kind,
                name: e.name,
                owner_task_id: e.owner_task_id,
                pool_index: e.pool_index,
                ref_count: e.ref_count,
            })
            .collect()
    }

    /// Best-effort consistency sweep used by kernel diagnostics.
    pub fn check_health(&self) -> HealthReport {
        let inner = self.inner.read();
        let mut report = HealthReport::default();
        for entry in inner.entries.iter() {
            if entry.active {
                report.live_objects += 1;
                if entry.generation == 0 || entry.ref_count == 0 {
                    report.generation_anomalies += 1;
                    klog_warn!(
                        "ipc: registry anomaly slot kind={:?} generation={} ref_count={}",
                        entry.kind,
                        entry.generation,
                        entry.ref_count
                    );
                }
            } else {
                report.free_slots += 1;
            }
        }
        report
    }

    /// Every registry entry owned by `task_id`, for cleanup on task exit.
    pub fn owned_by(&self, task_id: u32) -> Vec<ObjectHeader> {
        let inner = self.inner.read();
        inner
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.active && e.owner_task_id == task_id)
            .map(|(slot, e)| ObjectHeader {
                handle: IpcHandle::new(slot as u16, e.generation),
                kind: e.kind,
                name: e.name,
                owner_task_id: e.owner_task_id,
                pool_index: e.pool_index,
                ref_count: e.ref_count,
            })
            .collect()
    }
}

pub static REGISTRY: Registry = Registry::new();
