//! Process, thread and CPU-mode identifiers.

use std::fmt;

/// Process identifier (PID)
///
/// Newtype around the OS process id so a PID cannot be passed where a thread
/// id or an exit code is expected.
///
/// ## Example
///
/// ```rust
/// use trapdoor_core::types::ProcessId;
///
/// let pid = ProcessId::from(12345);
/// assert_eq!(pid.0, 12345);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u32);

impl From<u32> for ProcessId
{
    fn from(pid: u32) -> Self
    {
        ProcessId(pid)
    }
}

impl From<ProcessId> for u32
{
    fn from(pid: ProcessId) -> Self
    {
        pid.0
    }
}

impl fmt::Display for ProcessId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

/// Thread identifier
///
/// The exact meaning is backend-specific (a kernel TID under Linux), stored
/// as `u64` so the core never depends on the native type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

impl ThreadId
{
    /// Get the raw `u64` representation of the thread identifier
    ///
    /// ## Example
    ///
    /// ```rust
    /// use trapdoor_core::types::ThreadId;
    ///
    /// let thread = ThreadId::from(42);
    /// assert_eq!(thread.raw(), 42);
    /// ```
    #[must_use]
    pub fn raw(&self) -> u64
    {
        self.0
    }
}

impl From<u64> for ThreadId
{
    fn from(value: u64) -> Self
    {
        Self(value)
    }
}

impl fmt::Display for ThreadId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

/// Instruction width the debuggee executes in
///
/// The instruction decoder needs this to know whether `0x40..=0x4F` are REX
/// prefixes and which far-call/far-jump forms exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CpuMode
{
    /// 32-bit protected mode (x86)
    Bits32,
    /// 64-bit long mode (x86-64)
    #[default]
    Bits64,
}

impl CpuMode
{
    /// Size in bytes of a code pointer (return address) in this mode.
    #[must_use]
    pub const fn pointer_size(self) -> usize
    {
        match self {
            Self::Bits32 => 4,
            Self::Bits64 => 8,
        }
    }
}

impl fmt::Display for CpuMode
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Self::Bits32 => write!(f, "x86"),
            Self::Bits64 => write!(f, "x86-64"),
        }
    }
}

/// How the debugger came to control a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CreateMethod
{
    /// Started by the debugger.
    Launch,
    /// Already running, attached to afterwards.
    Attach,
}
