//! # Target Traits
//!
//! The interfaces between the platform-independent debugging core and the
//! operating system.
//!
//! Two traits split the OS surface:
//!
//! - [`ProcessTarget`]: one debugged process. Memory, thread contexts and
//!   thread suspension. The [`MachineCore`](crate::machine::MachineCore) owns
//!   one and does all breakpoint and stepping work through it.
//! - [`DebugBackend`]: the debug-event loop. Creates and attaches to
//!   processes, hands out their [`ProcessTarget`]s and reports what happens
//!   to them as [`DebugEvent`]s.
//!
//! Each platform implements both (see [`crate::platform`]). The test-suite
//! implements them over a simulated CPU, which is how the stepping logic is
//! exercised without a real debuggee.
//!
//! ## Event Protocol
//!
//! Every event returned by [`DebugBackend::wait_for_event`] leaves the
//! reporting process stopped. Nothing in that process runs again until
//! [`DebugBackend::continue_event`] is called for it.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;
use crate::types::{Address, CpuMode, ProcessId, ThreadContext, ThreadId};

/// Result of a memory read
///
/// Reads stop at the first inaccessible byte. `data` holds the readable
/// prefix and `unreadable` counts the bytes of the request that could not
/// be read, so `data.len() + unreadable` always equals the requested length.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryRead
{
    /// Bytes that were read, starting at the requested address
    pub data: Vec<u8>,
    /// Requested bytes past the end of `data` that were not accessible
    pub unreadable: usize,
}

impl MemoryRead
{
    /// Build a result for a request of `requested` bytes of which `data` were readable.
    #[must_use]
    pub fn new(data: Vec<u8>, requested: usize) -> Self
    {
        let unreadable = requested.saturating_sub(data.len());
        Self { data, unreadable }
    }

    /// Whether every requested byte was read.
    #[must_use]
    pub fn is_complete(&self) -> bool
    {
        self.unreadable == 0
    }
}

/// One debugged process, as the core sees it
///
/// Implementations talk to the OS directly and perform no breakpoint
/// bookkeeping: reads return raw memory (including any `0xCC` the debugger
/// planted), and writes go straight to the debuggee.
pub trait ProcessTarget
{
    /// Instruction width of the process.
    fn cpu_mode(&self) -> CpuMode;

    /// Read up to `len` bytes at `address`
    ///
    /// ## Errors
    ///
    /// Only fails for OS errors other than an inaccessible page. Inaccessible
    /// bytes are reported through [`MemoryRead::unreadable`].
    fn read_memory(&mut self, address: Address, len: usize) -> Result<MemoryRead>;

    /// Write `data` at `address`, returning the number of bytes written
    ///
    /// ## Errors
    ///
    /// Returns an OS error if nothing could be written.
    fn write_memory(&mut self, address: Address, data: &[u8]) -> Result<usize>;

    /// Make a code patch at `address` visible to the CPU.
    fn flush_instruction_cache(&mut self, address: Address, len: usize) -> Result<()>;

    /// Read the context of a stopped thread.
    fn get_context(&mut self, thread: ThreadId) -> Result<ThreadContext>;

    /// Write the context of a stopped thread
    ///
    /// Setting [`TRACE_FLAG`](crate::types::TRACE_FLAG) makes the thread raise
    /// exactly one single-step exception once it runs again.
    fn set_context(&mut self, thread: ThreadId, context: &ThreadContext) -> Result<()>;

    /// Keep a thread from running when the process is continued.
    fn suspend_thread(&mut self, thread: ThreadId) -> Result<()>;

    /// Undo one [`ProcessTarget::suspend_thread`].
    fn resume_thread(&mut self, thread: ThreadId) -> Result<()>;
}

/// How to start a program under the debugger
///
/// ## Example
///
/// ```rust
/// use trapdoor_core::target::LaunchInfo;
///
/// let info = LaunchInfo::new("/bin/ls").arg("-l").env("LC_ALL", "C").suspended(true);
/// assert_eq!(info.args, vec!["-l".to_string()]);
/// assert!(info.suspend);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchInfo
{
    /// Executable to run
    pub program: PathBuf,
    /// Arguments, not including the program name
    pub args: Vec<String>,
    /// Working directory, the debugger's own when `None`
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables, added to the debugger's environment
    pub env: BTreeMap<String, String>,
    /// Hold all events of the new process until
    /// [`DebugBackend::resume_launched`] is called
    pub suspend: bool,
}

impl LaunchInfo
{
    /// Describe a launch of `program` with no arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self
    {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self
    {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set one environment variable for the debuggee.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self
    {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Run the debuggee in `dir`.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self
    {
        self.working_dir = Some(dir.into());
        self
    }

    /// Start the debuggee suspended.
    #[must_use]
    pub fn suspended(mut self, suspend: bool) -> Self
    {
        self.suspend = suspend;
        self
    }
}

/// A loaded executable image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module
{
    /// Load address
    pub base: Address,
    /// Mapped size in bytes
    pub size: u64,
    /// File the image was mapped from
    pub path: PathBuf,
}

impl Module
{
    /// Whether `address` falls inside the image.
    #[must_use]
    pub fn contains(&self, address: Address) -> bool
    {
        address.offset_from(self.base).is_some_and(|offset| offset < self.size)
    }
}

/// Kind of exception a thread raised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionCode
{
    /// Trace trap after one instruction ran with the trace flag set
    SingleStep,
    /// `INT3` executed
    Breakpoint,
    /// Invalid memory access
    AccessViolation,
    /// A POSIX signal other than the ones above
    Signal(i32),
    /// Any other platform exception code
    Other(u32),
}

impl fmt::Display for ExceptionCode
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Self::SingleStep => write!(f, "single step"),
            Self::Breakpoint => write!(f, "breakpoint"),
            Self::AccessViolation => write!(f, "access violation"),
            Self::Signal(signal) => write!(f, "signal {signal}"),
            Self::Other(code) => write!(f, "exception 0x{code:08x}"),
        }
    }
}

/// Description of a raised exception
///
/// For [`ExceptionCode::Breakpoint`], `address` is the address of the trap
/// instruction itself, not the instruction pointer after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionRecord
{
    /// What happened
    pub code: ExceptionCode,
    /// Where it happened
    pub address: Address,
    /// `false` once the exception went unhandled and is being reported again
    pub first_chance: bool,
}

impl ExceptionRecord
{
    /// A first-chance exception.
    #[must_use]
    pub const fn new(code: ExceptionCode, address: Address) -> Self
    {
        Self {
            code,
            address,
            first_chance: true,
        }
    }
}

/// Something that happened in a debuggee
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugEvent
{
    /// A process was created or attached; `thread` is its first thread
    ProcessCreated
    {
        /// The process
        pid: ProcessId,
        /// Initial thread
        thread: ThreadId,
        /// Main executable, if known
        image: Option<Module>,
    },
    /// The process is gone
    ProcessExited
    {
        /// The process
        pid: ProcessId,
        /// Exit status
        code: i32,
    },
    /// A new thread started
    ThreadCreated
    {
        /// Owning process
        pid: ProcessId,
        /// The thread
        thread: ThreadId,
    },
    /// A thread finished
    ThreadExited
    {
        /// Owning process
        pid: ProcessId,
        /// The thread
        thread: ThreadId,
        /// Exit status
        code: i32,
    },
    /// An image was mapped
    ModuleLoaded
    {
        /// Owning process
        pid: ProcessId,
        /// The image
        module: Module,
    },
    /// An image was unmapped
    ModuleUnloaded
    {
        /// Owning process
        pid: ProcessId,
        /// Load address of the image
        base: Address,
    },
    /// The debuggee sent a debug string
    OutputString
    {
        /// Owning process
        pid: ProcessId,
        /// Sending thread
        thread: ThreadId,
        /// The text
        text: String,
    },
    /// A thread raised an exception
    Exception
    {
        /// Owning process
        pid: ProcessId,
        /// Faulting thread
        thread: ThreadId,
        /// What happened
        record: ExceptionRecord,
    },
    /// The process stopped because [`DebugBackend::async_break`] asked it to
    AsyncBreak
    {
        /// The process
        pid: ProcessId,
        /// Thread reported as stopped
        thread: ThreadId,
    },
}

impl DebugEvent
{
    /// The process the event belongs to.
    #[must_use]
    pub fn pid(&self) -> ProcessId
    {
        match self {
            Self::ProcessCreated { pid, .. }
            | Self::ProcessExited { pid, .. }
            | Self::ThreadCreated { pid, .. }
            | Self::ThreadExited { pid, .. }
            | Self::ModuleLoaded { pid, .. }
            | Self::ModuleUnloaded { pid, .. }
            | Self::OutputString { pid, .. }
            | Self::Exception { pid, .. }
            | Self::AsyncBreak { pid, .. } => *pid,
        }
    }

    /// The thread the event was reported on, if it names one.
    #[must_use]
    pub fn thread(&self) -> Option<ThreadId>
    {
        match self {
            Self::ProcessCreated { thread, .. }
            | Self::ThreadCreated { thread, .. }
            | Self::ThreadExited { thread, .. }
            | Self::OutputString { thread, .. }
            | Self::Exception { thread, .. }
            | Self::AsyncBreak { thread, .. } => Some(*thread),
            Self::ProcessExited { .. } | Self::ModuleLoaded { .. } | Self::ModuleUnloaded { .. } => None,
        }
    }
}

/// The OS debug-event loop
///
/// ## Lifecycle
///
/// 1. [`launch`](DebugBackend::launch) or [`attach`](DebugBackend::attach)
/// 2. [`take_target`](DebugBackend::take_target) once for the new process
/// 3. Loop on [`wait_for_event`](DebugBackend::wait_for_event), answering
///    each event with [`continue_event`](DebugBackend::continue_event)
/// 4. [`terminate`](DebugBackend::terminate) or [`detach`](DebugBackend::detach)
///
/// Backends are single-threaded: every call must come from the thread that
/// created the backend.
pub trait DebugBackend
{
    /// Start a program under the debugger
    ///
    /// The first events for the new process are
    /// [`DebugEvent::ProcessCreated`] and then a breakpoint exception (the
    /// loader breakpoint) once the image is ready to run.
    fn launch(&mut self, info: &LaunchInfo) -> Result<ProcessId>;

    /// Let a process launched with [`LaunchInfo::suspend`] start running.
    fn resume_launched(&mut self, pid: ProcessId) -> Result<()>;

    /// Attach to a running process
    ///
    /// Reported like a launch: a [`DebugEvent::ProcessCreated`], one
    /// [`DebugEvent::ThreadCreated`] per further thread, then the loader
    /// breakpoint.
    fn attach(&mut self, pid: ProcessId) -> Result<()>;

    /// Wait up to `timeout` for the next event; `None` on timeout.
    fn wait_for_event(&mut self, timeout: Duration) -> Result<Option<DebugEvent>>;

    /// Let a stopped process run again
    ///
    /// `thread` is the thread the last event was reported on. `handled` is
    /// `false` when an exception should be passed on to the debuggee.
    fn continue_event(&mut self, pid: ProcessId, thread: ThreadId, handled: bool) -> Result<()>;

    /// Kill the process. Its [`DebugEvent::ProcessExited`] still follows.
    fn terminate(&mut self, pid: ProcessId) -> Result<()>;

    /// Stop debugging the process and let it run freely.
    fn detach(&mut self, pid: ProcessId) -> Result<()>;

    /// Ask a running process to stop; reported as [`DebugEvent::AsyncBreak`].
    fn async_break(&mut self, pid: ProcessId) -> Result<()>;

    /// Hand out the [`ProcessTarget`] for a process, once.
    fn take_target(&mut self, pid: ProcessId) -> Result<Box<dyn ProcessTarget>>;
}

impl<B: DebugBackend + ?Sized> DebugBackend for Box<B>
{
    fn launch(&mut self, info: &LaunchInfo) -> Result<ProcessId>
    {
        (**self).launch(info)
    }

    fn resume_launched(&mut self, pid: ProcessId) -> Result<()>
    {
        (**self).resume_launched(pid)
    }

    fn attach(&mut self, pid: ProcessId) -> Result<()>
    {
        (**self).attach(pid)
    }

    fn wait_for_event(&mut self, timeout: Duration) -> Result<Option<DebugEvent>>
    {
        (**self).wait_for_event(timeout)
    }

    fn continue_event(&mut self, pid: ProcessId, thread: ThreadId, handled: bool) -> Result<()>
    {
        (**self).continue_event(pid, thread, handled)
    }

    fn terminate(&mut self, pid: ProcessId) -> Result<()>
    {
        (**self).terminate(pid)
    }

    fn detach(&mut self, pid: ProcessId) -> Result<()>
    {
        (**self).detach(pid)
    }

    fn async_break(&mut self, pid: ProcessId) -> Result<()>
    {
        (**self).async_break(pid)
    }

    fn take_target(&mut self, pid: ProcessId) -> Result<Box<dyn ProcessTarget>>
    {
        (**self).take_target(pid)
    }
}
