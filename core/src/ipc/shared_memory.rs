//! C9: named, page-aligned shared-memory segments.
//!
//! Generalizes the Wayland-style buffer manager in
//! `slopos_mm::shared_memory` (token-keyed, fixed `MAX_MAPPINGS_PER_BUFFER`,
//! bump-plus-freelist virtual address allocator) into a named, refcounted
//! segment model: a segment is registered in [`super::object`] like every
//! other IPC object, permissions are a bitset intersected at `map` time
//! rather than a binary owner/reader split, and `resize` can grow or shrink
//! the backing page list in place. The physical-page/mapping/VM plumbing
//! (`alloc_page_frames`, `map_page_4kb_in_dir`, `process_vm_get_page_dir`)
//! is the same external collaborator surface the buffer manager already
//! uses.

use alloc::vec;
use alloc::vec::Vec;

use slopos_abi::addr::{PhysAddr, VirtAddr};
use slopos_abi::ipc::{IpcHandle, ShmCreateFlags, ShmPermissions};
use slopos_lib::{align_up_u64, klog_debug, klog_warn, IrqMutex};

use slopos_mm::hhdm::PhysAddrHhdm;
use slopos_mm::mm_constants::{PageFlags, PAGE_SIZE_4KB};
use slopos_mm::page_alloc::{alloc_page_frames, free_page_frame, ALLOC_FLAG_ZERO};
use slopos_mm::paging::{map_page_4kb_in_dir, unmap_page_in_dir};
use slopos_mm::process_vm::process_vm_get_page_dir;

use crate::platform;

use super::error::{IpcError, IpcResult};
use super::object::{ObjectKind, ObjectName, REGISTRY};
use super::stats;
use super::MAX_SHARED_SEGMENTS;

/// Base of the address range this module hands out virtual ranges from.
/// Distinct from the compositor's `SHM_VADDR_BASE` in
/// `slopos_mm::shared_memory` so the two named-segment spaces never collide
/// if both are mapped into the same task.
const IPC_SHM_VADDR_BASE: u64 = 0x0000_6000_0000_0000;

const MAX_MAPPINGS: usize = super::MAX_MAPPINGS_PER_SEGMENT;

#[derive(Clone, Copy)]
struct Mapping {
    active: bool,
    task_id: u32,
    vaddr: VirtAddr,
    size: usize,
    permissions: ShmPermissions,
}

impl Mapping {
    const fn empty() -> Self {
        Self {
            active: false,
            task_id: 0,
            vaddr: VirtAddr::NULL,
            size: 0,
            permissions: ShmPermissions::empty(),
        }
    }
}

struct SegmentSlot {
    active: bool,
    size: usize,
    real_size: usize,
    permissions: ShmPermissions,
    create_flags: ShmCreateFlags,
    pages: Vec<PhysAddr>,
    mappings: [Mapping; MAX_MAPPINGS],
    creator_task_id: u32,
    creation_time: u64,
}

impl SegmentSlot {
    const fn empty() -> Self {
        Self {
            active: false,
            size: 0,
            real_size: 0,
            permissions: ShmPermissions::empty(),
            create_flags: ShmCreateFlags::empty(),
            pages: Vec::new(),
            mappings: [Mapping::empty(); MAX_MAPPINGS],
            creator_task_id: 0,
            creation_time: 0,
        }
    }

    fn mapping_count(&self) -> usize {
        self.mappings.iter().filter(|m| m.active).count()
    }
}

struct VaddrAllocator {
    next_offset: u64,
    free_list: Vec<(VirtAddr, usize)>,
}

impl VaddrAllocator {
    const fn new() -> Self {
        Self {
            next_offset: 0,
            free_list: Vec::new(),
        }
    }

    fn alloc(&mut self, size: usize) -> VirtAddr {
        let aligned = align_up_u64(size as u64, PAGE_SIZE_4KB) as usize;
        if let Some(pos) = self.free_list.iter().position(|&(_, s)| s >= aligned) {
            let (vaddr, _) = self.free_list.remove(pos);
            return vaddr;
        }
        let vaddr = VirtAddr::new(IPC_SHM_VADDR_BASE + self.next_offset);
        self.next_offset += aligned as u64 + PAGE_SIZE_4KB;
        vaddr
    }

    fn free(&mut self, vaddr: VirtAddr, size: usize) {
        let aligned = align_up_u64(size as u64, PAGE_SIZE_4KB) as usize;
        self.free_list.push((vaddr, aligned));
    }
}

struct State {
    segments: [SegmentSlot; MAX_SHARED_SEGMENTS],
    vaddrs: VaddrAllocator,
}

impl State {
    const fn new() -> Self {
        Self {
            segments: [const { SegmentSlot::empty() }; MAX_SHARED_SEGMENTS],
            vaddrs: VaddrAllocator::new(),
        }
    }
}

static STATE: IrqMutex<State> = IrqMutex::new(State::new());

fn pool_index(handle: IpcHandle) -> IpcResult<usize> {
    let header = REGISTRY.resolve(handle)?;
    if header.kind != ObjectKind::SharedMemory {
        return Err(IpcError::InvalidHandle);
    }
    Ok(header.pool_index as usize)
}

fn zero_filled_pages(real_size: usize) -> IpcResult<Vec<PhysAddr>> {
    let page_count = (real_size as u64 / PAGE_SIZE_4KB) as u32;
    let base = alloc_page_frames(page_count, ALLOC_FLAG_ZERO);
    if base.is_null() {
        stats::record_allocation_failure();
        return Err(IpcError::NoResources);
    }
    Ok((0..page_count)
        .map(|i| base.offset((i as u64) * PAGE_SIZE_4KB))
        .collect())
}

fn free_pages(pages: &[PhysAddr]) {
    for &page in pages {
        free_page_frame(page);
    }
}

/// Create (or, with `ShmCreateFlags::RESIZABLE` and an existing smaller
/// segment of the same name, grow) a named segment. Returns `AlreadyExists`
/// if the name is taken and `EXCL` was requested.
pub fn create(
    name: &str,
    owner_task_id: u32,
    size: usize,
    permissions: ShmPermissions,
    flags: ShmCreateFlags,
) -> IpcResult<IpcHandle> {
    if size == 0 {
        return Err(IpcError::InvalidArg);
    }

    if let Some(existing) = REGISTRY.lookup_by_name(ObjectKind::SharedMemory, name) {
        if flags.contains(ShmCreateFlags::EXCL) {
            return Err(IpcError::AlreadyExists);
        }
        let idx = pool_index(existing)?;
        let needs_growth = {
            let state = STATE.lock();
            size > state.segments[idx].size
        };
        if needs_growth {
            if !flags.contains(ShmCreateFlags::RESIZABLE)
                && !STATE.lock().segments[idx]
                    .create_flags
                    .contains(ShmCreateFlags::RESIZABLE)
            {
                stats::record_permission_failure();
                return Err(IpcError::PermissionDenied);
            }
            grow_segment(idx, size)?;
        }
        {
            let mut state = STATE.lock();
            state.segments[idx].permissions |= permissions;
            state.segments[idx].create_flags |= flags;
        }
        let _ = REGISTRY.incref(existing);
        return Ok(existing);
    }

    let real_size = align_up_u64(size as u64, PAGE_SIZE_4KB) as usize;
    let pages = zero_filled_pages(real_size)?;

    let Some(slot_idx) = STATE.lock().segments.iter().position(|s| !s.active) else {
        free_pages(&pages);
        stats::record_allocation_failure();
        return Err(IpcError::NoResources);
    };

    {
        let mut state = STATE.lock();
        state.segments[slot_idx] = SegmentSlot {
            active: true,
            size,
            real_size,
            permissions,
            create_flags: flags,
            pages,
            mappings: [Mapping::empty(); MAX_MAPPINGS],
            creator_task_id: owner_task_id,
            creation_time: platform::timer_ticks(),
        };
    }

    let object_name = ObjectName::new(name)?;
    match REGISTRY.register(
        ObjectKind::SharedMemory,
        object_name,
        owner_task_id,
        slot_idx as u16,
    ) {
        Ok(handle) => {
            stats::record_shm_created();
            Ok(handle)
        }
        Err(e) => {
            let mut state = STATE.lock();
            free_pages(&state.segments[slot_idx].pages);
            state.segments[slot_idx] = SegmentSlot::empty();
            Err(e)
        }
    }
}

/// Map `handle` into `task_id`'s address space. Effective permissions are
/// `requested ∩ segment.permissions`; an empty intersection is
/// `PermissionDenied` rather than a zero-access mapping.
pub fn map(handle: IpcHandle, task_id: u32, requested: ShmPermissions) -> IpcResult<VirtAddr> {
    let idx = pool_index(handle)?;
    let page_dir = process_vm_get_page_dir(task_id);
    if page_dir.is_null() {
        return Err(IpcError::InvalidArg);
    }

    let (effective, real_size, cow, pages) = {
        let state = STATE.lock();
        let seg = &state.segments[idx];
        let effective = requested & seg.permissions;
        if effective.is_empty() {
            stats::record_permission_failure();
            return Err(IpcError::PermissionDenied);
        }
        if seg.mappings.iter().all(|m| m.active) {
            stats::record_allocation_failure();
            return Err(IpcError::NoResources);
        }
        (
            effective,
            seg.real_size,
            seg.create_flags.contains(ShmCreateFlags::COW),
            seg.pages.clone(),
        )
    };

    let vaddr = STATE.lock().vaddrs.alloc(real_size);

    let mut page_flags = PageFlags::PRESENT | PageFlags::USER;
    if effective.contains(ShmPermissions::WRITE) && !cow {
        page_flags |= PageFlags::WRITABLE;
    }
    if cow {
        page_flags |= PageFlags::COW;
    }

    for (i, &page) in pages.iter().enumerate() {
        let page_vaddr = VirtAddr::new(vaddr.as_u64() + (i as u64) * PAGE_SIZE_4KB);
        if map_page_4kb_in_dir(page_dir, page_vaddr, page, page_flags.bits()) != 0 {
            for j in 0..i {
                let rollback = VirtAddr::new(vaddr.as_u64() + (j as u64) * PAGE_SIZE_4KB);
                unmap_page_in_dir(page_dir, rollback);
            }
            STATE.lock().vaddrs.free(vaddr, real_size);
            klog_warn!("ipc shm map: failed to map page {} for task {}", i, task_id);
            stats::record_allocation_failure();
            return Err(IpcError::NoResources);
        }
    }

    {
        let mut state = STATE.lock();
        let seg = &mut state.segments[idx];
        let slot = seg.mappings.iter().position(|m| !m.active).expect("checked above");
        seg.mappings[slot] = Mapping {
            active: true,
            task_id,
            vaddr,
            size: real_size,
            permissions: effective,
        };
    }
    let _ = REGISTRY.incref(handle);
    stats::record_shm_mapped(real_size);
    klog_debug!("ipc shm map: task {} -> {:#x}", task_id, vaddr.as_u64());
    Ok(vaddr)
}

/// Unmap the segment mapped at `vaddr` in `task_id`'s address space.
pub fn unmap(task_id: u32, vaddr: VirtAddr) -> IpcResult<()> {
    let found = {
        let state = STATE.lock();
        state.segments.iter().enumerate().find_map(|(idx, seg)| {
            seg.active
                .then(|| {
                    seg.mappings
                        .iter()
                        .position(|m| m.active && m.task_id == task_id && m.vaddr == vaddr)
                        .map(|map_idx| (idx, map_idx, seg.mappings[map_idx].size))
                })
                .flatten()
        })
    };
    let Some((idx, map_idx, size)) = found else {
        return Err(IpcError::NotFound);
    };

    let page_dir = process_vm_get_page_dir(task_id);
    if !page_dir.is_null() {
        let page_count = (size as u64 / PAGE_SIZE_4KB) as u64;
        for i in 0..page_count {
            let page_vaddr = VirtAddr::new(vaddr.as_u64() + i * PAGE_SIZE_4KB);
            unmap_page_in_dir(page_dir, page_vaddr);
        }
    }

    {
        let mut state = STATE.lock();
        state.segments[idx].mappings[map_idx] = Mapping::empty();
        state.vaddrs.free(vaddr, size);
    }

    let handle = REGISTRY
        .dump_all()
        .into_iter()
        .find(|h| h.kind == ObjectKind::SharedMemory && h.pool_index as usize == idx)
        .map(|h| h.handle);
    if let Some(handle) = handle {
        release_if_unreferenced(handle, idx);
    }
    Ok(())
}

/// Grow or shrink a resizable segment. Every existing mapping is remapped
/// (grow) or truncated (shrink) to match.
pub fn resize(handle: IpcHandle, new_size: usize) -> IpcResult<()> {
    let idx = pool_index(handle)?;
    if new_size == 0 {
        return Err(IpcError::InvalidArg);
    }
    let resizable = STATE.lock().segments[idx]
        .create_flags
        .contains(ShmCreateFlags::RESIZABLE);
    if !resizable {
        stats::record_permission_failure();
        return Err(IpcError::PermissionDenied);
    }

    let current_size = STATE.lock().segments[idx].size;
    if new_size > current_size {
        grow_segment(idx, new_size)
    } else if new_size < current_size {
        shrink_segment(idx, new_size)
    } else {
        Ok(())
    }
}

fn grow_segment(idx: usize, new_size: usize) -> IpcResult<()> {
    let new_real_size = align_up_u64(new_size as u64, PAGE_SIZE_4KB) as usize;
    let old_pages = STATE.lock().segments[idx].pages.clone();
    let new_pages = zero_filled_pages(new_real_size)?;

    for (i, &old_page) in old_pages.iter().enumerate() {
        let src = old_page.to_virt().as_u64() as *const u8;
        let dst = new_pages[i].to_virt().as_u64() as *mut u8;
        unsafe { core::ptr::copy_nonoverlapping(src, dst, PAGE_SIZE_4KB as usize) };
    }

    let mappings = STATE.lock().segments[idx].mappings;
    for mapping in mappings.iter().filter(|m| m.active) {
        let page_dir = process_vm_get_page_dir(mapping.task_id);
        if page_dir.is_null() {
            continue;
        }
        let mut page_flags = PageFlags::PRESENT | PageFlags::USER;
        if mapping.permissions.contains(ShmPermissions::WRITE) {
            page_flags |= PageFlags::WRITABLE;
        }
        let old_page_count = (mapping.size as u64 / PAGE_SIZE_4KB) as u64;
        for i in 0..old_page_count {
            let vaddr = VirtAddr::new(mapping.vaddr.as_u64() + i * PAGE_SIZE_4KB);
            unmap_page_in_dir(page_dir, vaddr);
        }
        for (i, &page) in new_pages.iter().enumerate() {
            let vaddr = VirtAddr::new(mapping.vaddr.as_u64() + (i as u64) * PAGE_SIZE_4KB);
            let _ = map_page_4kb_in_dir(page_dir, vaddr, page, page_flags.bits());
        }
    }

    free_pages(&old_pages);

    let mut state = STATE.lock();
    for mapping in state.segments[idx].mappings.iter_mut() {
        if mapping.active {
            mapping.size = new_real_size;
        }
    }
    state.segments[idx].pages = new_pages;
    state.segments[idx].size = new_size;
    state.segments[idx].real_size = new_real_size;
    Ok(())
}

fn shrink_segment(idx: usize, new_size: usize) -> IpcResult<()> {
    let new_real_size = align_up_u64(new_size as u64, PAGE_SIZE_4KB) as usize;
    let new_page_count = (new_real_size as u64 / PAGE_SIZE_4KB) as usize;

    let (tail_pages, mappings) = {
        let state = STATE.lock();
        let seg = &state.segments[idx];
        (seg.pages[new_page_count..].to_vec(), seg.mappings)
    };

    for mapping in mappings.iter().filter(|m| m.active) {
        let page_dir = process_vm_get_page_dir(mapping.task_id);
        if page_dir.is_null() {
            continue;
        }
        let old_page_count = (mapping.size as u64 / PAGE_SIZE_4KB) as u64;
        for i in new_page_count as u64..old_page_count {
            let vaddr = VirtAddr::new(mapping.vaddr.as_u64() + i * PAGE_SIZE_4KB);
            unmap_page_in_dir(page_dir, vaddr);
        }
    }

    free_pages(&tail_pages);

    let mut state = STATE.lock();
    for mapping in state.segments[idx].mappings.iter_mut() {
        if mapping.active {
            mapping.size = new_real_size;
        }
    }
    state.segments[idx].pages.truncate(new_page_count);
    state.segments[idx].size = new_size;
    state.segments[idx].real_size = new_real_size;
    Ok(())
}

/// Destroy `handle` if `task_id` is its creator. Like events, destruction is
/// deferred (`decref` only) while mappings remain; the last
/// `unmap`/`destroy` to drop the refcount to zero actually tears it down.
pub fn destroy(handle: IpcHandle, task_id: u32) -> IpcResult<()> {
    let header = REGISTRY.resolve(handle)?;
    if header.kind != ObjectKind::SharedMemory {
        return Err(IpcError::InvalidHandle);
    }
    if header.owner_task_id != task_id {
        stats::record_permission_failure();
        return Err(IpcError::NotOwner);
    }
    release_if_unreferenced(handle, header.pool_index as usize);
    Ok(())
}

fn release_if_unreferenced(handle: IpcHandle, idx: usize) {
    match REGISTRY.decref(handle) {
        Ok(true) => {
            let _ = REGISTRY.unregister(handle);
            let mut state = STATE.lock();
            let pages = core::mem::take(&mut state.segments[idx].pages);
            free_pages(&pages);
            state.segments[idx] = SegmentSlot::empty();
            stats::record_object_destroyed();
        }
        Ok(false) | Err(_) => {}
    }
}

/// Unmap every mapping `task_id` holds (C10); if it was the creator and the
/// refcount reaches zero, the segment is fully destroyed.
pub fn cleanup_task(task_id: u32) {
    let vaddrs: Vec<(IpcHandle, VirtAddr)> = {
        let state = STATE.lock();
        let mut found = vec![];
        for (idx, seg) in state.segments.iter().enumerate() {
            if !seg.active {
                continue;
            }
            for mapping in seg.mappings.iter() {
                if mapping.active && mapping.task_id == task_id {
                    if let Some(handle) = REGISTRY
                        .dump_all()
                        .into_iter()
                        .find(|h| h.kind == ObjectKind::SharedMemory && h.pool_index as usize == idx)
                        .map(|h| h.handle)
                    {
                        found.push((handle, mapping.vaddr));
                    }
                }
            }
        }
        found
    };
    for (_, vaddr) in &vaddrs {
        let _ = unmap(task_id, *vaddr);
    }
}
