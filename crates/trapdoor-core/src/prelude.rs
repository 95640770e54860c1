//! Common module for library exports

pub use crate::error::{DebuggerError, Result};
pub use crate::events::{ChannelCallback, DebuggerEvent, EventCallback, ProbeRunMode, RunMode};
pub use crate::machine::MachineResult;
pub use crate::platform::native_backend;
pub use crate::session::{DebugSession, SessionConfig};
pub use crate::target::{DebugBackend, DebugEvent, ExceptionCode, ExceptionRecord, LaunchInfo, ProcessTarget};
pub use crate::types::{Address, AddressRange, CpuMode, ProcessId, ThreadContext, ThreadId};
