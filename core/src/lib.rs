#![no_std]

extern crate alloc;

pub mod exec;
pub mod ipc;
pub mod irq;
pub mod irq_tests;
pub mod platform;
pub mod scheduler;
#[macro_use]
pub mod syscall;
pub mod syscall_services;

pub use scheduler::context_tests;
pub use scheduler::fate_api;
pub use scheduler::ffi_boundary;
pub use scheduler::kthread;
pub use scheduler::per_cpu;
pub use scheduler::sched_tests;
pub use scheduler::scheduler as sched;
pub use scheduler::task;
pub use scheduler::test_tasks;
pub use scheduler::work_steal;
