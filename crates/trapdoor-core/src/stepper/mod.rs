//! # Steppers
//!
//! The strategies that carry a thread through one step request.
//!
//! A stepper arms traps (the trace flag, temporary breakpoints) through a
//! [`StepperMachine`], gets told about every breakpoint and trace trap the
//! thread raises until it reports [`Stepper::is_complete`], and releases what
//! it armed when cancelled.
//!
//! ## Strategies
//!
//! | variant | used for | traps |
//! |---------|----------|-------|
//! | [`Stepper::SingleStep`] | most instructions | trace flag |
//! | [`Stepper::EmbeddedBreakpointSkip`] | an `INT3` compiled into the debuggee | none, the `INT3` itself traps |
//! | [`Stepper::BreakpointAfterInstruction`] | `REP` string instructions | breakpoint after the instruction |
//! | [`Stepper::BreakpointAfterCall`] | stepping over a call | breakpoint after the call |
//! | [`Stepper::ProbedCall`] | stepping into a call | trace flag, then breakpoint after the call |
//! | [`Stepper::RangeStep`] | stepping through a source line | one of the above per instruction |
//! | [`Stepper::RunToAddress`] | step out, run to cursor | breakpoint at the target |
//!
//! Steppers that run code for a while (a call, a run-to) may stop at a user
//! breakpoint on the way. When the thread continues from there, the stepper
//! builds a one-shot *resume stepper* ([`make_resume_stepper`]) to get past
//! that breakpoint and then keeps waiting for its own landing trap.
//!
//! Landing addresses are held by value; the breakpoint records belong to the
//! [`BreakpointTable`](crate::breakpoints::BreakpointTable).

use tracing::{debug, warn};

use crate::decode::{Instruction, InstructionCategory};
use crate::error::{DebuggerError, Result};
use crate::events::ProbeRunMode;
use crate::machine::{MachineResult, Motion};
use crate::types::{Address, AddressRange};

/// Machine services available to a stepper
///
/// Implemented by the machine for the thread being stepped. Traps armed here
/// are recorded as expected events of that thread and are cleaned up
/// automatically when they fire.
pub trait StepperMachine
{
    /// Classify the instruction at `address`, reading through breakpoints.
    ///
    /// ## Errors
    ///
    /// [`DebuggerError::Decode`] when too few bytes are readable.
    fn read_instruction(&mut self, address: Address) -> Result<Instruction>;

    /// Raise one trace trap after the next instruction.
    fn arm_single_step(&mut self) -> Result<()>;

    /// Withdraw a trace trap armed by [`StepperMachine::arm_single_step`].
    fn disarm_single_step(&mut self) -> Result<()>;

    /// Plant a temporary breakpoint at `address`.
    fn arm_breakpoint(&mut self, address: Address) -> Result<()>;

    /// Withdraw a temporary breakpoint. No-op if it already fired.
    fn disarm_breakpoint(&mut self, address: Address) -> Result<()>;

    /// Ask the client whether to stop in the function at `address`.
    fn probe_call(&mut self, address: Address, thunk: Option<AddressRange>) -> ProbeRunMode;
}

/// A stepper's reaction to a breakpoint trap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakpointVerdict
{
    /// What to do with the trap
    pub result: MachineResult,
    /// Whether the pc goes back to the trap address. `false` leaves it after the `INT3`.
    pub rewind: bool,
}

impl BreakpointVerdict
{
    const fn unclaimed(rewind: bool) -> Self
    {
        Self {
            result: MachineResult::NotHandled,
            rewind,
        }
    }

    const fn stopped() -> Self
    {
        Self {
            result: MachineResult::HandledStopped,
            rewind: true,
        }
    }
}

/// Single-step one instruction with the trace flag
#[derive(Debug, Clone)]
pub struct SingleStep
{
    start: Address,
    armed: bool,
    complete: bool,
}

/// Execute an `INT3` that belongs to the debuggee
///
/// Arms nothing; the instruction traps by itself. With `handle` set, that
/// trap completes the step. Otherwise it is left for the client to see as a
/// breakpoint.
#[derive(Debug, Clone)]
pub struct EmbeddedBreakpointSkip
{
    start: Address,
    handle: bool,
    complete: bool,
}

/// Run one long instruction to a breakpoint placed after it
#[derive(Debug, Clone)]
pub struct BreakpointAfterInstruction
{
    start: Address,
    landing: Address,
    complete: bool,
}

/// Run a call to completion, landing after it
#[derive(Debug, Clone)]
pub struct BreakpointAfterCall
{
    start: Address,
    landing: Address,
    current: Address,
    requested_ss: bool,
    resume: Option<Box<Stepper>>,
    complete: bool,
}

/// Step into a call and let the client decide whether to stop in the callee
#[derive(Debug, Clone)]
pub struct ProbedCall
{
    start: Address,
    landing: Address,
    current: Address,
    ss_order: u8,
    ss_to_handle: u8,
    enclosing: Option<AddressRange>,
    thunk: Option<AddressRange>,
    resume: Option<Box<Stepper>>,
    complete: bool,
}

/// Step instructions until the pc leaves a range
#[derive(Debug, Clone)]
pub struct RangeStep
{
    start: Address,
    step_in: bool,
    source_mode: bool,
    range: AddressRange,
    first: bool,
    inner: Option<Box<Stepper>>,
    complete: bool,
}

/// Run until a breakpoint at a target address fires
#[derive(Debug, Clone)]
pub struct RunToAddress
{
    current: Address,
    target: Address,
    motion: Motion,
    resume: Option<Box<Stepper>>,
    complete: bool,
}

/// One in-flight step
#[derive(Debug, Clone)]
pub enum Stepper
{
    /// See [`SingleStep`]
    SingleStep(SingleStep),
    /// See [`EmbeddedBreakpointSkip`]
    EmbeddedBreakpointSkip(EmbeddedBreakpointSkip),
    /// See [`BreakpointAfterInstruction`]
    BreakpointAfterInstruction(BreakpointAfterInstruction),
    /// See [`BreakpointAfterCall`]
    BreakpointAfterCall(BreakpointAfterCall),
    /// See [`ProbedCall`]
    ProbedCall(ProbedCall),
    /// See [`RangeStep`]
    RangeStep(RangeStep),
    /// See [`RunToAddress`]
    RunToAddress(RunToAddress),
}

impl Stepper
{
    /// Single-step the instruction at `start`.
    #[must_use]
    pub fn single_step(start: Address) -> Self
    {
        Self::SingleStep(SingleStep {
            start,
            armed: false,
            complete: false,
        })
    }

    /// Execute the debuggee's own `INT3` at `start`.
    #[must_use]
    pub fn embedded_skip(start: Address, handle: bool) -> Self
    {
        Self::EmbeddedBreakpointSkip(EmbeddedBreakpointSkip {
            start,
            handle,
            complete: false,
        })
    }

    /// Run the `len`-byte instruction at `start` to completion.
    #[must_use]
    pub fn after_instruction(start: Address, len: u64) -> Self
    {
        Self::BreakpointAfterInstruction(BreakpointAfterInstruction {
            start,
            landing: start + len,
            complete: false,
        })
    }

    /// Step over the `len`-byte call at `start`.
    #[must_use]
    pub fn after_call(start: Address, len: u64) -> Self
    {
        Self::BreakpointAfterCall(BreakpointAfterCall {
            start,
            landing: start + len,
            current: start,
            requested_ss: false,
            resume: None,
            complete: false,
        })
    }

    /// Step into the `len`-byte call at `start`
    ///
    /// A callee inside `enclosing` is entered without asking the client.
    #[must_use]
    pub fn probed_call(start: Address, len: u64, enclosing: Option<AddressRange>) -> Self
    {
        Self::ProbedCall(ProbedCall {
            start,
            landing: start + len,
            current: start,
            ss_order: 0,
            ss_to_handle: 1,
            enclosing,
            thunk: None,
            resume: None,
            complete: false,
        })
    }

    /// Step from `start` until the pc leaves `range`.
    #[must_use]
    pub fn range_step(start: Address, step_in: bool, source_mode: bool, range: AddressRange) -> Self
    {
        Self::RangeStep(RangeStep {
            start,
            step_in,
            source_mode,
            range,
            first: true,
            inner: None,
            complete: false,
        })
    }

    /// Run from `start` until `target` is reached.
    #[must_use]
    pub fn run_to(start: Address, target: Address, motion: Motion) -> Self
    {
        Self::RunToAddress(RunToAddress {
            current: start,
            target,
            motion,
            resume: None,
            complete: false,
        })
    }

    /// Arm the traps this step starts with
    ///
    /// ## Errors
    ///
    /// Errors from arming; nothing stays armed when this fails.
    pub fn start(&mut self, machine: &mut dyn StepperMachine) -> Result<()>
    {
        match self {
            Self::SingleStep(step) => {
                machine.arm_single_step()?;
                step.armed = true;
                Ok(())
            }
            Self::EmbeddedBreakpointSkip(_) => Ok(()),
            Self::BreakpointAfterInstruction(step) => machine.arm_breakpoint(step.landing),
            Self::BreakpointAfterCall(step) => machine.arm_breakpoint(step.landing),
            Self::ProbedCall(step) => {
                machine.arm_breakpoint(step.landing)?;
                if let Err(error) = machine.arm_single_step() {
                    // the arm error is the one to report
                    if let Err(undo) = machine.disarm_breakpoint(step.landing) {
                        warn!(address = %step.landing, error = %undo, "Landing breakpoint left armed");
                    }
                    return Err(error);
                }
                Ok(())
            }
            Self::RangeStep(step) => step.start_one(machine, step.start),
            Self::RunToAddress(step) => machine.arm_breakpoint(step.target),
        }
    }

    /// Release whatever this step still has armed.
    pub fn cancel(&mut self, machine: &mut dyn StepperMachine) -> Result<()>
    {
        match self {
            Self::SingleStep(step) => {
                if step.armed && !step.complete {
                    step.armed = false;
                    machine.disarm_single_step()?;
                }
                Ok(())
            }
            Self::EmbeddedBreakpointSkip(_) => Ok(()),
            Self::BreakpointAfterInstruction(step) => {
                if step.complete {
                    return Ok(());
                }
                machine.disarm_breakpoint(step.landing)
            }
            Self::BreakpointAfterCall(step) => {
                cancel_resume(&mut step.resume, machine)?;
                if step.requested_ss {
                    step.requested_ss = false;
                    machine.disarm_single_step()?;
                }
                if step.complete {
                    return Ok(());
                }
                machine.disarm_breakpoint(step.landing)
            }
            Self::ProbedCall(step) => {
                cancel_resume(&mut step.resume, machine)?;
                if step.complete {
                    return Ok(());
                }
                if step.ss_order < step.ss_to_handle {
                    machine.disarm_single_step()?;
                }
                machine.disarm_breakpoint(step.landing)
            }
            Self::RangeStep(step) => match step.inner.take() {
                Some(mut inner) => inner.cancel(machine),
                None => Ok(()),
            },
            Self::RunToAddress(step) => {
                cancel_resume(&mut step.resume, machine)?;
                if step.complete {
                    return Ok(());
                }
                machine.disarm_breakpoint(step.target)
            }
        }
    }

    /// Whether the step reached its goal.
    #[must_use]
    pub fn is_complete(&self) -> bool
    {
        match self {
            Self::SingleStep(step) => step.complete,
            Self::EmbeddedBreakpointSkip(step) => step.complete,
            Self::BreakpointAfterInstruction(step) => step.complete,
            Self::BreakpointAfterCall(step) => step.complete,
            Self::ProbedCall(step) => step.complete,
            Self::RangeStep(step) => step.complete,
            Self::RunToAddress(step) => step.complete,
        }
    }

    /// Whether the step survives the thread stopping at a debuggee `INT3`
    ///
    /// Steps that run code for a while (calls, run-to) can get past one
    /// with a resume stepper. Their start and landing points cannot.
    #[must_use]
    pub fn can_skip_embedded_bp(&self) -> bool
    {
        match self {
            Self::SingleStep(_) | Self::EmbeddedBreakpointSkip(_) | Self::BreakpointAfterInstruction(_) => false,
            Self::BreakpointAfterCall(step) => step.current != step.start && step.current != step.landing,
            Self::ProbedCall(step) => step.current != step.start && step.current != step.landing,
            Self::RangeStep(step) => step.inner.as_ref().is_some_and(|inner| inner.can_skip_embedded_bp()),
            Self::RunToAddress(step) => step.current != step.target,
        }
    }

    /// The thread is about to continue from a breakpoint at `pc`; arm what
    /// it takes to get past it without losing this step
    ///
    /// ## Errors
    ///
    /// Decode or arming errors. [`DebuggerError::WrongState`] for a range
    /// step with no instruction step in flight.
    pub fn request_step_away(&mut self, machine: &mut dyn StepperMachine, pc: Address) -> Result<()>
    {
        match self {
            // these already single-step or land past the instruction
            Self::SingleStep(_) | Self::EmbeddedBreakpointSkip(_) | Self::BreakpointAfterInstruction(_) => Ok(()),
            Self::BreakpointAfterCall(step) => {
                if step.current == step.start {
                    machine.arm_single_step()?;
                    step.requested_ss = true;
                    return Ok(());
                }
                replace_resume(&mut step.resume, machine, pc)
            }
            Self::ProbedCall(step) => {
                if step.current == step.start {
                    return Ok(());
                }
                replace_resume(&mut step.resume, machine, pc)
            }
            Self::RangeStep(step) => match step.inner.as_mut() {
                Some(inner) => inner.request_step_away(machine, pc),
                None => Err(DebuggerError::WrongState("range step has no instruction step in flight".into())),
            },
            Self::RunToAddress(step) => replace_resume(&mut step.resume, machine, pc),
        }
    }

    /// A breakpoint trap at `address`
    ///
    /// ## Errors
    ///
    /// Errors from the machine services the step uses.
    pub fn on_breakpoint(&mut self, machine: &mut dyn StepperMachine, address: Address) -> Result<BreakpointVerdict>
    {
        match self {
            Self::SingleStep(_) => Ok(BreakpointVerdict::unclaimed(true)),
            Self::EmbeddedBreakpointSkip(step) => {
                if address == step.start && step.handle {
                    step.complete = true;
                    return Ok(BreakpointVerdict {
                        result: MachineResult::HandledStopped,
                        rewind: false,
                    });
                }
                Ok(BreakpointVerdict::unclaimed(false))
            }
            Self::BreakpointAfterInstruction(step) => {
                if address == step.landing {
                    step.complete = true;
                    return Ok(BreakpointVerdict::stopped());
                }
                Ok(BreakpointVerdict::unclaimed(true))
            }
            Self::BreakpointAfterCall(step) => {
                step.current = address;
                if address == step.landing {
                    step.complete = true;
                    cancel_resume(&mut step.resume, machine)?;
                    return Ok(BreakpointVerdict::stopped());
                }
                resume_on_breakpoint(&mut step.resume, machine, address)
            }
            Self::ProbedCall(step) => {
                step.current = address;
                if address == step.landing {
                    step.complete = true;
                    cancel_resume(&mut step.resume, machine)?;
                    return Ok(BreakpointVerdict::stopped());
                }
                resume_on_breakpoint(&mut step.resume, machine, address)
            }
            Self::RangeStep(step) => step.on_breakpoint(machine, address),
            Self::RunToAddress(step) => {
                step.current = address;
                if address == step.target {
                    step.complete = true;
                    cancel_resume(&mut step.resume, machine)?;
                    return Ok(BreakpointVerdict::stopped());
                }
                resume_on_breakpoint(&mut step.resume, machine, address)
            }
        }
    }

    /// A trace trap; `address` is the pc after the stepped instruction
    ///
    /// ## Errors
    ///
    /// Decode errors while looking at a callee, and errors from the machine
    /// services the step uses.
    pub fn on_single_step(&mut self, machine: &mut dyn StepperMachine, address: Address) -> Result<MachineResult>
    {
        match self {
            Self::SingleStep(step) => {
                step.complete = true;
                Ok(MachineResult::HandledStopped)
            }
            Self::EmbeddedBreakpointSkip(step) => {
                step.complete = true;
                Ok(MachineResult::HandledStopped)
            }
            Self::BreakpointAfterInstruction(_) => Ok(MachineResult::NotHandled),
            Self::BreakpointAfterCall(step) => {
                step.current = address;
                if step.requested_ss {
                    step.requested_ss = false;
                    cancel_resume(&mut step.resume, machine)?;
                    return Ok(MachineResult::HandledContinue);
                }
                resume_on_single_step(&mut step.resume, machine, address)
            }
            Self::ProbedCall(step) => step.on_single_step(machine, address),
            Self::RangeStep(step) => step.on_single_step(machine, address),
            Self::RunToAddress(step) => {
                step.current = address;
                resume_on_single_step(&mut step.resume, machine, address)
            }
        }
    }

    /// The kind of motion this step performs.
    #[must_use]
    pub fn motion(&self) -> Motion
    {
        match self {
            Self::SingleStep(_) | Self::EmbeddedBreakpointSkip(_) | Self::ProbedCall(_) => Motion::StepIn,
            Self::BreakpointAfterInstruction(_) | Self::BreakpointAfterCall(_) => Motion::StepOver,
            Self::RangeStep(step) if step.step_in => Motion::RangeStepIn,
            Self::RangeStep(_) => Motion::RangeStepOver,
            Self::RunToAddress(step) => step.motion,
        }
    }

    /// The range a range step is confined to.
    #[must_use]
    pub fn range(&self) -> Option<AddressRange>
    {
        match self {
            Self::RangeStep(step) => Some(step.range),
            Self::ProbedCall(step) => step.enclosing,
            _ => None,
        }
    }

    /// Where the step's own landing breakpoint is, if it uses one.
    #[must_use]
    pub fn landing(&self) -> Option<Address>
    {
        match self {
            Self::BreakpointAfterInstruction(step) => Some(step.landing),
            Self::BreakpointAfterCall(step) => Some(step.landing),
            Self::ProbedCall(step) => Some(step.landing),
            Self::RangeStep(step) => step.inner.as_ref().and_then(|inner| inner.landing()),
            Self::RunToAddress(step) => Some(step.target),
            Self::SingleStep(_) | Self::EmbeddedBreakpointSkip(_) => None,
        }
    }
}

impl ProbedCall
{
    fn on_single_step(&mut self, machine: &mut dyn StepperMachine, address: Address) -> Result<MachineResult>
    {
        self.current = address;
        self.ss_order = self.ss_order.saturating_add(1);

        if self.ss_order > self.ss_to_handle {
            return resume_on_single_step(&mut self.resume, machine, address);
        }

        if self.ss_order == 1 {
            let instruction = machine.read_instruction(address)?;

            // incremental linking puts a jump thunk in front of the callee
            if instruction.category == InstructionCategory::Jmp {
                self.ss_to_handle = 2;
                self.thunk = Some(AddressRange::with_len(address, instruction.len_u64()));
                machine.arm_single_step()?;
                return Ok(MachineResult::HandledContinue);
            }
        }

        let mode = if self.enclosing.is_some_and(|range| range.contains(address)) {
            ProbeRunMode::Run
        } else {
            machine.probe_call(address, self.thunk)
        };
        debug!(callee = %address, ?mode, "Call probed");

        match mode {
            ProbeRunMode::Break => {
                self.complete = true;
                cancel_resume(&mut self.resume, machine)?;
                machine.disarm_breakpoint(self.landing)?;
                Ok(MachineResult::HandledStopped)
            }
            ProbeRunMode::Run => Ok(MachineResult::HandledContinue),
            ProbeRunMode::Wait => Ok(MachineResult::HandledStopped),
        }
    }
}

impl RangeStep
{
    fn start_one(&mut self, machine: &mut dyn StepperMachine, pc: Address) -> Result<()>
    {
        // only a step started on an embedded INT3 goes past it; one met later is reported
        let handle = self.first;
        self.first = false;

        let mut inner = if self.step_in {
            make_step_in_stepper(machine, pc, self.source_mode, handle)?
        } else {
            make_step_over_stepper(machine, pc, handle)?
        };
        if let Stepper::ProbedCall(call) = &mut inner {
            call.enclosing = Some(self.range);
        }

        inner.start(machine)?;
        self.inner = Some(Box::new(inner));
        Ok(())
    }

    fn inner_mut(&mut self) -> Result<&mut Stepper>
    {
        self.inner
            .as_deref_mut()
            .ok_or_else(|| DebuggerError::WrongState("range step has no instruction step in flight".into()))
    }

    fn on_breakpoint(&mut self, machine: &mut dyn StepperMachine, address: Address) -> Result<BreakpointVerdict>
    {
        let inner = self.inner_mut()?;
        let verdict = inner.on_breakpoint(machine, address)?;
        if !inner.is_complete() {
            return Ok(verdict);
        }

        // the pc is after the INT3 unless the instruction step wants it rewound
        let pc = if verdict.rewind { address } else { address + 1 };
        let result = self.handle_complete(machine, pc)?;
        Ok(BreakpointVerdict {
            result,
            rewind: verdict.rewind,
        })
    }

    fn on_single_step(&mut self, machine: &mut dyn StepperMachine, address: Address) -> Result<MachineResult>
    {
        let inner = self.inner_mut()?;
        let result = inner.on_single_step(machine, address)?;
        if !inner.is_complete() {
            return Ok(result);
        }

        self.handle_complete(machine, address)
    }

    fn handle_complete(&mut self, machine: &mut dyn StepperMachine, pc: Address) -> Result<MachineResult>
    {
        self.inner = None;

        if self.range.contains(pc) {
            self.start_one(machine, pc)?;
            return Ok(MachineResult::HandledContinue);
        }

        self.complete = true;
        Ok(MachineResult::HandledStopped)
    }
}

fn cancel_resume(resume: &mut Option<Box<Stepper>>, machine: &mut dyn StepperMachine) -> Result<()>
{
    match resume.take() {
        Some(mut stepper) => stepper.cancel(machine),
        None => Ok(()),
    }
}

fn replace_resume(resume: &mut Option<Box<Stepper>>, machine: &mut dyn StepperMachine, pc: Address) -> Result<()>
{
    cancel_resume(resume, machine)?;

    let mut stepper = make_resume_stepper(machine, pc)?;
    stepper.start(machine)?;
    *resume = Some(Box::new(stepper));
    Ok(())
}

/// Resume steppers get one trap, then they are done with.
fn resume_on_breakpoint(
    resume: &mut Option<Box<Stepper>>,
    machine: &mut dyn StepperMachine,
    address: Address,
) -> Result<BreakpointVerdict>
{
    let Some(mut stepper) = resume.take() else {
        return Ok(BreakpointVerdict::unclaimed(true));
    };

    let mut verdict = stepper.on_breakpoint(machine, address)?;
    stepper.cancel(machine)?;

    if verdict.result == MachineResult::HandledStopped {
        verdict.result = MachineResult::HandledContinue;
    }
    Ok(verdict)
}

fn resume_on_single_step(
    resume: &mut Option<Box<Stepper>>,
    machine: &mut dyn StepperMachine,
    address: Address,
) -> Result<MachineResult>
{
    let Some(mut stepper) = resume.take() else {
        return Ok(MachineResult::NotHandled);
    };

    let mut result = stepper.on_single_step(machine, address)?;
    stepper.cancel(machine)?;

    if result == MachineResult::HandledStopped {
        result = MachineResult::HandledContinue;
    }
    Ok(result)
}

/// The least it takes to execute the instruction at `pc` once
///
/// ## Errors
///
/// [`DebuggerError::Decode`] if the instruction cannot be read.
pub fn make_resume_stepper(machine: &mut dyn StepperMachine, pc: Address) -> Result<Stepper>
{
    let instruction = machine.read_instruction(pc)?;

    Ok(match instruction.category {
        InstructionCategory::RepString => Stepper::after_instruction(pc, instruction.len_u64()),
        InstructionCategory::Breakpoint => Stepper::embedded_skip(pc, true),
        _ => Stepper::single_step(pc),
    })
}

/// Step into the instruction at `pc`
///
/// Calls are probed only in `source_mode`; otherwise they are single-stepped.
/// `handle` decides whether a debuggee `INT3` at `pc` is stepped past.
///
/// ## Errors
///
/// [`DebuggerError::Decode`] if the instruction cannot be read.
pub fn make_step_in_stepper(
    machine: &mut dyn StepperMachine,
    pc: Address,
    source_mode: bool,
    handle: bool,
) -> Result<Stepper>
{
    let instruction = machine.read_instruction(pc)?;

    Ok(match instruction.category {
        InstructionCategory::Call if source_mode => Stepper::probed_call(pc, instruction.len_u64(), None),
        InstructionCategory::Breakpoint => Stepper::embedded_skip(pc, handle),
        _ => Stepper::single_step(pc),
    })
}

/// Step over the instruction at `pc`
///
/// ## Errors
///
/// [`DebuggerError::Decode`] if the instruction cannot be read.
pub fn make_step_over_stepper(machine: &mut dyn StepperMachine, pc: Address, handle: bool) -> Result<Stepper>
{
    let instruction = machine.read_instruction(pc)?;

    Ok(match instruction.category {
        InstructionCategory::RepString => Stepper::after_instruction(pc, instruction.len_u64()),
        InstructionCategory::Call => Stepper::after_call(pc, instruction.len_u64()),
        InstructionCategory::Breakpoint => Stepper::embedded_skip(pc, handle),
        _ => Stepper::single_step(pc),
    })
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::types::CpuMode;

    /// Records the services a stepper asks for, over a fixed code image.
    #[derive(Default)]
    struct Recorder
    {
        code: Vec<(Address, Vec<u8>)>,
        single_steps: i32,
        breakpoints: Vec<Address>,
        probes: Vec<Address>,
        probe_answer: ProbeRunMode,
    }

    impl Recorder
    {
        fn with_code(address: u64, bytes: &[u8]) -> Self
        {
            Self {
                code: vec![(Address::new(address), bytes.to_vec())],
                ..Self::default()
            }
        }

        fn add_code(&mut self, address: u64, bytes: &[u8])
        {
            self.code.push((Address::new(address), bytes.to_vec()));
        }
    }

    impl StepperMachine for Recorder
    {
        fn read_instruction(&mut self, address: Address) -> Result<Instruction>
        {
            let bytes = self
                .code
                .iter()
                .find_map(|(base, bytes)| {
                    let offset = address.offset_from(*base)? as usize;
                    bytes.get(offset..)
                })
                .unwrap_or(&[]);
            crate::decode::classify(bytes, CpuMode::Bits64).ok_or(DebuggerError::Decode { address })
        }

        fn arm_single_step(&mut self) -> Result<()>
        {
            self.single_steps += 1;
            Ok(())
        }

        fn disarm_single_step(&mut self) -> Result<()>
        {
            self.single_steps -= 1;
            Ok(())
        }

        fn arm_breakpoint(&mut self, address: Address) -> Result<()>
        {
            self.breakpoints.push(address);
            Ok(())
        }

        fn disarm_breakpoint(&mut self, address: Address) -> Result<()>
        {
            self.breakpoints.retain(|bp| *bp != address);
            Ok(())
        }

        fn probe_call(&mut self, address: Address, _thunk: Option<AddressRange>) -> ProbeRunMode
        {
            self.probes.push(address);
            self.probe_answer
        }
    }

    #[test]
    fn test_factories_pick_strategy_by_instruction()
    {
        let mut m = Recorder::with_code(0x1000, &[0xE8, 0, 0, 0, 0]);
        m.add_code(0x2000, &[0xF3, 0xA4]);
        m.add_code(0x3000, &[0xCC]);
        m.add_code(0x4000, &[0x90]);

        let call = Address::new(0x1000);
        let rep = Address::new(0x2000);
        let int3 = Address::new(0x3000);
        let nop = Address::new(0x4000);

        assert!(matches!(make_step_over_stepper(&mut m, call, true).unwrap(), Stepper::BreakpointAfterCall(_)));
        assert!(matches!(make_step_in_stepper(&mut m, call, true, true).unwrap(), Stepper::ProbedCall(_)));
        assert!(matches!(make_step_in_stepper(&mut m, call, false, true).unwrap(), Stepper::SingleStep(_)));
        assert!(matches!(make_resume_stepper(&mut m, call).unwrap(), Stepper::SingleStep(_)));

        assert!(matches!(make_step_over_stepper(&mut m, rep, true).unwrap(), Stepper::BreakpointAfterInstruction(_)));
        assert!(matches!(make_step_in_stepper(&mut m, rep, true, true).unwrap(), Stepper::SingleStep(_)));
        assert!(matches!(make_resume_stepper(&mut m, rep).unwrap(), Stepper::BreakpointAfterInstruction(_)));

        assert!(matches!(make_resume_stepper(&mut m, int3).unwrap(), Stepper::EmbeddedBreakpointSkip(_)));
        assert!(matches!(make_step_over_stepper(&mut m, nop, true).unwrap(), Stepper::SingleStep(_)));

        assert_eq!(make_step_over_stepper(&mut m, rep, true).unwrap().landing(), Some(Address::new(0x2002)));
        assert_eq!(make_step_over_stepper(&mut m, nop, true).unwrap().landing(), None);
    }

    #[test]
    fn test_after_call_lands_after_the_call()
    {
        let mut m = Recorder::default();
        let mut stepper = Stepper::after_call(Address::new(0x1000), 5);
        stepper.start(&mut m).unwrap();
        assert_eq!(m.breakpoints, vec![Address::new(0x1005)]);
        assert_eq!(stepper.landing(), Some(Address::new(0x1005)));
        assert!(!stepper.can_skip_embedded_bp());

        let verdict = stepper.on_breakpoint(&mut m, Address::new(0x1005)).unwrap();
        assert_eq!(verdict.result, MachineResult::HandledStopped);
        assert!(verdict.rewind);
        assert!(stepper.is_complete());
    }

    #[test]
    fn test_after_call_steps_away_from_breakpoint_in_callee()
    {
        let mut m = Recorder::with_code(0x5000, &[0x90]);
        let mut stepper = Stepper::after_call(Address::new(0x1000), 5);
        stepper.start(&mut m).unwrap();

        // user breakpoint inside the callee, not ours
        let verdict = stepper.on_breakpoint(&mut m, Address::new(0x5000)).unwrap();
        assert_eq!(verdict.result, MachineResult::NotHandled);
        assert!(stepper.can_skip_embedded_bp());

        stepper.request_step_away(&mut m, Address::new(0x5000)).unwrap();
        assert_eq!(m.single_steps, 1);

        // the resume stepper's trace trap keeps the step going
        let result = stepper.on_single_step(&mut m, Address::new(0x5001)).unwrap();
        assert_eq!(result, MachineResult::HandledContinue);
        assert!(!stepper.is_complete());
    }

    #[test]
    fn test_after_call_at_start_requests_one_single_step()
    {
        let mut m = Recorder::default();
        let mut stepper = Stepper::after_call(Address::new(0x1000), 5);
        stepper.start(&mut m).unwrap();

        stepper.request_step_away(&mut m, Address::new(0x1000)).unwrap();
        assert_eq!(m.single_steps, 1);
        assert_eq!(
            stepper.on_single_step(&mut m, Address::new(0x8000)).unwrap(),
            MachineResult::HandledContinue
        );
    }

    #[test]
    fn test_cancel_releases_landing_breakpoint()
    {
        let mut m = Recorder::default();
        let mut stepper = Stepper::run_to(Address::new(0x1000), Address::new(0x2000), Motion::RunTo);
        stepper.start(&mut m).unwrap();
        assert_eq!(m.breakpoints.len(), 1);

        stepper.cancel(&mut m).unwrap();
        assert!(m.breakpoints.is_empty());
    }

    #[test]
    fn test_embedded_skip_respects_handle()
    {
        let mut m = Recorder::default();
        let at = Address::new(0x3000);

        let mut handled = Stepper::embedded_skip(at, true);
        let verdict = handled.on_breakpoint(&mut m, at).unwrap();
        assert_eq!(verdict.result, MachineResult::HandledStopped);
        assert!(!verdict.rewind);

        let mut reported = Stepper::embedded_skip(at, false);
        let verdict = reported.on_breakpoint(&mut m, at).unwrap();
        assert_eq!(verdict.result, MachineResult::NotHandled);
        assert!(!reported.is_complete());
    }

    #[test]
    fn test_probed_call_skips_jump_thunk()
    {
        let mut m = Recorder::with_code(0x6000, &[0xE9, 0, 0x10, 0, 0]);
        m.add_code(0x7005, &[0x55]);
        m.probe_answer = ProbeRunMode::Break;

        let mut stepper = Stepper::probed_call(Address::new(0x1000), 5, None);
        stepper.start(&mut m).unwrap();
        assert_eq!(m.single_steps, 1);

        let result = stepper.on_single_step(&mut m, Address::new(0x6000)).unwrap();
        assert_eq!(result, MachineResult::HandledContinue);
        assert!(m.probes.is_empty());

        let result = stepper.on_single_step(&mut m, Address::new(0x7005)).unwrap();
        assert_eq!(result, MachineResult::HandledStopped);
        assert_eq!(m.probes, vec![Address::new(0x7005)]);
        assert!(stepper.is_complete());
        assert!(m.breakpoints.is_empty());
    }

    #[test]
    fn test_probed_call_inside_enclosing_range_is_not_probed()
    {
        let mut m = Recorder::with_code(0x1010, &[0x90]);
        let range = AddressRange::new(Address::new(0x1000), Address::new(0x10ff));

        let mut stepper = Stepper::probed_call(Address::new(0x1000), 5, Some(range));
        stepper.start(&mut m).unwrap();

        let result = stepper.on_single_step(&mut m, Address::new(0x1010)).unwrap();
        assert_eq!(result, MachineResult::HandledContinue);
        assert!(m.probes.is_empty());
        assert!(!stepper.is_complete());
    }

    #[test]
    fn test_range_step_restarts_inside_range()
    {
        let mut m = Recorder::with_code(0x1000, &[0x90, 0x90, 0x90]);
        let range = AddressRange::new(Address::new(0x1000), Address::new(0x1001));

        let mut stepper = Stepper::range_step(Address::new(0x1000), false, true, range);
        stepper.start(&mut m).unwrap();
        assert_eq!(stepper.motion(), Motion::RangeStepOver);

        assert_eq!(
            stepper.on_single_step(&mut m, Address::new(0x1001)).unwrap(),
            MachineResult::HandledContinue
        );
        assert!(!stepper.is_complete());

        assert_eq!(
            stepper.on_single_step(&mut m, Address::new(0x1002)).unwrap(),
            MachineResult::HandledStopped
        );
        assert!(stepper.is_complete());
        assert_eq!(m.single_steps, 2);
    }
}
