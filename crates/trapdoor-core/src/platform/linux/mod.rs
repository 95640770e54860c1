//! # Linux Backend
//!
//! `ptrace`-based implementation of the target traits for x86-64 Linux.
//!
//! - [`LinuxBackend`]: launch/attach and the debug-event loop
//! - [`LinuxTarget`]: memory, registers and thread holds of one process
//!
//! Both sides of one process share its tracee bookkeeping behind a mutex,
//! so a thread held through the target stays stopped when the backend
//! continues the process.
//!
//! ## References
//!
//! - [ptrace(2)](https://man7.org/linux/man-pages/man2/ptrace.2.html)
//! - [proc_pid_mem(5)](https://man7.org/linux/man-pages/man5/proc_pid_mem.5.html)

mod backend;
mod target;
mod tracee;

pub use backend::LinuxBackend;
pub use target::LinuxTarget;
