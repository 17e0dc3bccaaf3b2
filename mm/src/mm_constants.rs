//! SlopOS Memory and Paging Constants.
//!
//! This module re-exports memory and paging constants from the crate-local
//! `memory_layout_defs`/`paging_defs` modules, kept distinct from those so
//! downstream crates have one stable import path regardless of which module
//! actually owns a given constant.
//! All code should use the type-safe `PageFlags` bitflags for page table operations.

// Re-export memory layout constants
pub use crate::memory_layout_defs::{
    BOOT_STACK_PHYS_ADDR, BOOT_STACK_SIZE, EARLY_PDPT_PHYS_ADDR, EARLY_PD_PHYS_ADDR,
    EARLY_PML4_PHYS_ADDR, EXCEPTION_STACK_GUARD_SIZE, EXCEPTION_STACK_PAGES,
    EXCEPTION_STACK_REGION_BASE, EXCEPTION_STACK_REGION_STRIDE, EXCEPTION_STACK_SIZE,
    HHDM_VIRT_BASE, KERNEL_HEAP_SIZE, KERNEL_HEAP_VBASE, KERNEL_VIRTUAL_BASE, MAX_PROCESSES,
    MMIO_VIRT_BASE, MMIO_VIRT_SIZE, PROCESS_CODE_START_VA, PROCESS_DATA_START_VA,
    PROCESS_HEAP_MAX_VA, PROCESS_HEAP_START_VA, PROCESS_STACK_SIZE_BYTES, PROCESS_STACK_TOP_VA,
    USER_SPACE_END_VA, USER_SPACE_START_VA,
};

// INVALID_PROCESS_ID is canonical in task module
pub use slopos_abi::task::INVALID_PROCESS_ID;

// Re-export paging constants
pub use crate::paging_defs::{PAGE_SIZE_1GB, PAGE_SIZE_2MB, PAGE_SIZE_4KB, PAGE_SIZE_4KB_USIZE};

// Re-export PageFlags for type-safe flag manipulation
pub use crate::paging_defs::PageFlags;
