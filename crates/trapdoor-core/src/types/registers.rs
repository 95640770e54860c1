//! Thread context as seen by the stepping core.

use super::Address;

/// The x86 trap flag (TF, bit 8 of EFLAGS/RFLAGS)
///
/// While set, the CPU raises a single-step exception after executing one
/// instruction and clears the flag itself.
pub const TRACE_FLAG: u64 = 0x100;

/// The slice of a thread's register state the debugging core reads and writes
///
/// Only the instruction pointer, the stack pointer (to find a return address)
/// and the flags register (for the trace flag) matter to breakpoint and
/// stepping logic. Backends fill the remaining registers back in from their
/// own full register set when the context is written.
///
/// ## Example
///
/// ```rust
/// use trapdoor_core::types::{Address, ThreadContext};
///
/// let mut ctx = ThreadContext::new(Address::new(0x401000), Address::new(0x7ff000), 0x202);
/// assert!(!ctx.trace_flag());
/// ctx.set_trace_flag(true);
/// assert_eq!(ctx.flags, 0x302);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ThreadContext
{
    /// Instruction pointer (EIP/RIP)
    pub pc: Address,
    /// Stack pointer (ESP/RSP)
    pub sp: Address,
    /// Flags register (EFLAGS/RFLAGS)
    pub flags: u64,
}

impl ThreadContext
{
    /// Create a context from its three registers.
    #[must_use]
    pub const fn new(pc: Address, sp: Address, flags: u64) -> Self
    {
        Self { pc, sp, flags }
    }

    /// Whether the trace flag is set.
    #[must_use]
    pub const fn trace_flag(&self) -> bool
    {
        self.flags & TRACE_FLAG != 0
    }

    /// Set or clear the trace flag.
    pub fn set_trace_flag(&mut self, enabled: bool)
    {
        if enabled {
            self.flags |= TRACE_FLAG;
        } else {
            self.flags &= !TRACE_FLAG;
        }
    }
}
