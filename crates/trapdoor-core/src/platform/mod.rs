//! # Platform Backends
//!
//! OS implementations of [`DebugBackend`] and
//! [`ProcessTarget`](crate::target::ProcessTarget).
//!
//! - **Linux**: `ptrace` (see [`linux`])
//!   - See: [ptrace(2) man page](https://man7.org/linux/man-pages/man2/ptrace.2.html)
//!
//! Other systems have no backend yet; [`native_backend`] reports that as an
//! error so front ends can still be built there.

#[cfg(target_os = "linux")]
pub mod linux;

use crate::error::Result;
use crate::target::DebugBackend;

/// The backend for the system the debugger runs on
///
/// ## Errors
///
/// [`DebuggerError::InvalidArgument`](crate::DebuggerError::InvalidArgument)
/// on systems without a backend.
#[cfg(target_os = "linux")]
pub fn native_backend() -> Result<Box<dyn DebugBackend>>
{
    Ok(Box::new(linux::LinuxBackend::new()))
}

/// The backend for the system the debugger runs on
///
/// ## Errors
///
/// Always; this system has no backend.
#[cfg(not(target_os = "linux"))]
pub fn native_backend() -> Result<Box<dyn DebugBackend>>
{
    Err(crate::DebuggerError::InvalidArgument(format!(
        "no debug backend for {}",
        std::env::consts::OS
    )))
}
