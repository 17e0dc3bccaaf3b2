//! SlopOS Kernel-Userland ABI Types
//!
//! This crate provides the canonical definitions for all types shared between
//! the kernel and userland. Having a single source of truth eliminates:
//! - Duplicate type definitions
//! - ABI mismatches between kernel and userland
//! - The need for unsafe FFI conversions
//!
//! All types in this crate are `#[repr(C)]` for ABI stability.

#![no_std]
#![forbid(unsafe_code)]

pub mod addr;
pub mod arch;
pub mod auxv;
pub mod damage;
pub mod draw;
pub mod fs;
pub mod input;
pub mod ipc;
pub mod net;
pub mod pixel;
pub mod signal;
pub mod syscall;
pub mod task;
pub mod window;

/// Standard 4KB page size for userland memory calculations.
pub const PAGE_SIZE: u64 = 0x1000;

pub use addr::*;
pub use damage::{DamageRect, MAX_DAMAGE_REGIONS, MAX_INTERNAL_DAMAGE_REGIONS};
pub use draw::{Canvas, Color32, EncodedPixel};
pub use fs::*;
pub use input::*;
pub use ipc::*;
pub use pixel::*;
pub use syscall::*;
pub use task::*;
pub use window::*;
