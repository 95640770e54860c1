//! # Types
//!
//! Platform-agnostic types used throughout the debugger.
//!
//! These types keep the core independent of the backend: addresses,
//! process/thread identifiers and the small register context the stepping
//! logic needs look the same whether the debuggee runs under `ptrace` or a
//! simulated target in the test-suite.

pub mod address;
pub mod process;
pub mod registers;

// Re-export all public types
pub use address::{Address, AddressRange};
pub use process::{CpuMode, CreateMethod, ProcessId, ThreadId};
pub use registers::{ThreadContext, TRACE_FLAG};
