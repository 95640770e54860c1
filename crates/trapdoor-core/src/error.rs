//! # Error Types
//!
//! General error handling for the debugger core.
//!
//! We use `thiserror` to automatically generate `Error` trait implementations
//! and nice error messages.

use std::io;

use thiserror::Error;

use crate::types::Address;

/// Main error type for debugger operations
///
/// ## Error Categories
///
/// 1. **OS errors**: Os, PartialCopy, Io, Nix (Linux), PermissionDenied
/// 2. **State errors**: WrongState, ProcessEnded, NotFound, ProcessNotFound
/// 3. **Decode errors**: Decode (the instruction at an address could not be classified)
/// 4. **Caller errors**: InvalidArgument, AttachFailed
///
/// OS errors are surfaced verbatim; the core never retries them.
#[derive(Error, Debug)]
pub enum DebuggerError
{
    /// An OS call failed
    ///
    /// `operation` names the call (for example `"write_memory"`), `source`
    /// carries the OS error unchanged.
    #[error("{operation} failed: {source}")]
    Os
    {
        /// The OS operation that failed
        operation: &'static str,
        /// The underlying OS error
        #[source]
        source: io::Error,
    },

    /// A memory read or write transferred fewer bytes than requested
    #[error("Partial copy at {address}: {transferred} of {requested} bytes")]
    PartialCopy
    {
        /// Start of the transfer
        address: Address,
        /// Bytes requested
        requested: usize,
        /// Bytes actually transferred
        transferred: usize,
    },

    /// The process or thread is not in the state the operation requires
    ///
    /// Examples:
    /// - stepping while the process is running
    /// - cancelling a step when no thread is stopped
    #[error("Wrong state: {0}")]
    WrongState(String),

    /// An id did not name a known process or thread
    #[error("Not found: {0}")]
    NotFound(String),

    /// The process is terminating or has already been torn down
    #[error("Process {0} has ended")]
    ProcessEnded(u32),

    /// The instruction at an address could not be classified
    ///
    /// Raised when fewer bytes were readable than the instruction needs.
    /// Steppers treat this as fatal to the current step.
    #[error("Cannot decode instruction at {address}")]
    Decode
    {
        /// Address of the instruction
        address: Address,
    },

    /// The process with the given PID doesn't exist or has exited
    #[error("Process not found: PID {0}")]
    ProcessNotFound(u32),

    /// Insufficient permissions to debug the target process
    ///
    /// Under Linux this usually means `ptrace_scope` forbids attaching.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Invalid argument passed to a debugger function
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Failed to launch or attach to a process
    #[error("Failed to attach to process: {0}")]
    AttachFailed(String),

    /// I/O error (for `/proc` access, etc.)
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Linux system call error reported through `nix`
    #[cfg(target_os = "linux")]
    #[error("System call failed: {0}")]
    Nix(#[from] nix::errno::Errno),
}

impl DebuggerError
{
    /// Wrap an OS error with the name of the failing operation.
    #[must_use]
    pub fn os(operation: &'static str, source: io::Error) -> Self
    {
        Self::Os { operation, source }
    }

    /// Whether this is an "access denied" style failure
    ///
    /// Suspending or resuming a thread that is already exiting fails this way;
    /// callers treat it as success since the thread is going away anyway.
    #[must_use]
    pub fn is_access_denied(&self) -> bool
    {
        match self {
            Self::PermissionDenied(_) => true,
            Self::Os { source, .. } | Self::Io(source) => source.kind() == io::ErrorKind::PermissionDenied,
            // ptrace reports ESRCH for a task that is on its way out
            #[cfg(target_os = "linux")]
            Self::Nix(errno) => matches!(
                errno,
                nix::errno::Errno::EPERM | nix::errno::Errno::EACCES | nix::errno::Errno::ESRCH
            ),
            _ => false,
        }
    }
}

/// Convenience type alias for `Result<T, DebuggerError>`
///
/// ```rust
/// use trapdoor_core::error::Result;
/// fn foo() -> Result<()>
/// {
///     Ok(())
/// }
/// ```
pub type Result<T> = std::result::Result<T, DebuggerError>;
