//! x86_64 architecture definitions: GDT, IDT, and CPU exception vectors.
//!
//! Single source of truth for hardware-layout types the rest of the kernel
//! imports rather than keeping private copies (see `gdt`'s module docs).

pub mod exception;
pub mod gdt;
pub mod idt;
