//! Traps a thread is waiting for.

use smallvec::SmallVec;

use crate::types::{Address, AddressRange};

/// Kind of trap an [`ExpectedEvent`] waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExpectedCode
{
    /// Trace trap from the trace flag
    SingleStep,
    /// A temporary breakpoint at [`ExpectedEvent::bp_address`]
    Breakpoint,
}

/// Which stepper of a thread armed a trap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrapOwner
{
    /// The thread's client-requested step
    Stepper,
    /// The one-shot stepper that moves the thread off a breakpoint on continue
    Resume,
}

/// What kind of motion a step performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Motion
{
    /// One instruction, entering calls
    StepIn,
    /// One instruction, running calls to completion
    StepOver,
    /// Instructions until the pc leaves a range, entering calls
    RangeStepIn,
    /// Instructions until the pc leaves a range, running calls to completion
    RangeStepOver,
    /// Run until the current function returns
    StepOut,
    /// Run until an address is reached
    RunTo,
}

/// One armed trap and the clean-up to run when it fires
///
/// When the trap fires (or the step is cancelled) the actions run in this
/// order: clear the trace flag, re-patch the breakpoint at
/// `unpatched_address`, drop the temporary breakpoint at `bp_address`,
/// resume the sibling threads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedEvent
{
    /// Trap kind
    pub code: ExpectedCode,
    /// Who gets notified when it fires
    pub owner: TrapOwner,
    /// Temporary breakpoint address for [`ExpectedCode::Breakpoint`]
    pub bp_address: Option<Address>,
    /// Whether the breakpoint at `bp_address` is removed when the event goes away
    pub remove_bp: bool,
    /// Breakpoint lifted so the thread could execute the instruction under it
    pub unpatched_address: Option<Address>,
    /// Whether sibling threads were suspended for this trap
    pub resume_threads: bool,
    /// Whether the trace flag is cleared when the event goes away
    pub clear_trace_flag: bool,
    /// Motion of the step that armed the trap
    pub motion: Motion,
    /// Range of the range step that armed the trap
    pub range: Option<AddressRange>,
}

impl ExpectedEvent
{
    /// A pending trace trap.
    #[must_use]
    pub fn single_step(owner: TrapOwner, motion: Motion, range: Option<AddressRange>) -> Self
    {
        Self {
            code: ExpectedCode::SingleStep,
            owner,
            bp_address: None,
            remove_bp: false,
            unpatched_address: None,
            resume_threads: false,
            clear_trace_flag: true,
            motion,
            range,
        }
    }

    /// A pending temporary breakpoint at `address`.
    #[must_use]
    pub fn breakpoint(owner: TrapOwner, address: Address, motion: Motion, range: Option<AddressRange>) -> Self
    {
        Self {
            code: ExpectedCode::Breakpoint,
            owner,
            bp_address: Some(address),
            remove_bp: true,
            unpatched_address: None,
            resume_threads: false,
            clear_trace_flag: false,
            motion,
            range,
        }
    }

    /// Whether this event waits for a breakpoint at `address`.
    #[must_use]
    pub fn expects_breakpoint_at(&self, address: Address) -> bool
    {
        self.code == ExpectedCode::Breakpoint && self.bp_address == Some(address)
    }
}

/// Per-thread stack of expected events; usually one or two deep.
pub type ExpectedStack = SmallVec<[ExpectedEvent; 2]>;
