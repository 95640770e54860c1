//! # trapdoor-core
//!
//! Breakpoint, stepping and exception-dispatch core of a native debugger.
//!
//! This crate provides:
//! - A minimal x86 instruction classifier ([`decode`])
//! - A software breakpoint table that hides its patches from memory reads
//!   ([`breakpoints`])
//! - Step strategies: single step, step over, step in, step out, range
//!   step, run-to-address ([`stepper`])
//! - The per-process trap bookkeeping that routes every single-step and
//!   breakpoint exception to its owner ([`machine`])
//! - Process/thread/module tracking and the command surface ([`process`],
//!   [`session`], [`events`])
//!
//! ## Platform Support
//!
//! - **Linux x86-64**: `ptrace` backend in [`platform::linux`]
//! - Anything else can drive the core through its own
//!   [`target::DebugBackend`]; the test-suite does so with a simulated CPU.
//!
//! ## Why unsafe code is needed
//!
//! Launching a debuggee needs `fork`, and stopping a single thread needs
//! the raw `tgkill` syscall. Both are wrapped in safe functions inside
//! [`platform::linux`]; nothing else in the crate uses `unsafe`.

#![allow(unsafe_code)] // fork and tgkill in the Linux backend

pub mod breakpoints;
pub mod decode;
pub mod error;
pub mod events;
pub mod machine;
pub mod platform;
pub mod prelude;
pub mod process;
pub mod session;
pub mod stepper;
pub mod target;
pub mod types;

pub use error::{DebuggerError, Result};
pub use session::{DebugSession, SessionConfig};
