//! # Machine Core
//!
//! The per-process state machine that turns raw traps into debugger
//! decisions.
//!
//! The core owns the process's [`BreakpointTable`] and its
//! [`ProcessTarget`], and keeps for every thread:
//!
//! - a stack of [`ExpectedEvent`]s, the traps the thread is known to be
//!   heading for, each with the clean-up to run when it fires;
//! - the client's [`Stepper`], if a step is in flight;
//! - a one-shot *resume stepper* used to move the thread off a breakpoint.
//!
//! ## Stop/continue cycle
//!
//! 1. [`MachineCore::on_stopped`] when any debug event stops a thread
//! 2. [`MachineCore::on_exception`] if the event was an exception; the result
//!    tells the session whether to notify the client
//! 3. commands (breakpoints, memory, steps) while stopped
//! 4. [`MachineCore::on_continue`] right before the thread runs again
//!
//! The stopped thread's context is read once per stop and written back on
//! continue.

pub mod expected;
pub mod result;

use std::collections::BTreeMap;
use std::fmt;

use tracing::{debug, trace, warn};

pub use expected::{ExpectedCode, ExpectedEvent, ExpectedStack, Motion, TrapOwner};
pub use result::MachineResult;

use crate::breakpoints::{BreakpointOwner, BreakpointTable};
use crate::decode::{self, Instruction, BREAKPOINT_OPCODE, MAX_INSTRUCTION_LEN};
use crate::error::{DebuggerError, Result};
use crate::events::{CallProbe, ProbeRunMode};
use crate::process::ThreadSuspension;
use crate::stepper::{self, Stepper, StepperMachine};
use crate::target::{ExceptionCode, ExceptionRecord, MemoryRead, ProcessTarget};
use crate::types::{Address, AddressRange, CpuMode, ThreadContext, ThreadId};

/// Stepping state of one thread
#[derive(Debug, Default)]
struct ThreadState
{
    expected: ExpectedStack,
    stepper: Option<Stepper>,
    resume: Option<Stepper>,
}

#[derive(Debug)]
struct StopState
{
    thread: ThreadId,
    on_exception: bool,
    context: Option<ThreadContext>,
    dirty: bool,
}

/// Answers every call probe with "run"; used where no client can be asked.
struct NoProbe;

impl CallProbe for NoProbe
{
    fn probe(&mut self, _thread: ThreadId, _address: Address, _thunk: Option<AddressRange>) -> ProbeRunMode
    {
        ProbeRunMode::Run
    }
}

/// Keeps the first error of a series of clean-up actions.
fn keep_first(first: &mut Option<DebuggerError>, outcome: Result<()>)
{
    if let Err(error) = outcome {
        warn!(%error, "Clean-up action failed");
        first.get_or_insert(error);
    }
}

/// Log a failed undo step; the error that caused the rollback is the one reported.
fn log_rollback(outcome: Result<()>)
{
    if let Err(error) = outcome {
        warn!(%error, "Rollback incomplete");
    }
}

fn not_stopped() -> DebuggerError
{
    DebuggerError::WrongState("no thread is stopped".into())
}

/// Breakpoint and stepping engine for one process
pub struct MachineCore
{
    target: Box<dyn ProcessTarget>,
    breakpoints: BreakpointTable,
    threads: BTreeMap<ThreadId, ThreadState>,
    suspension: ThreadSuspension,
    stopped: Option<StopState>,
    pending_breakpoint: Option<Address>,
    isolate_threads: bool,
}

impl fmt::Debug for MachineCore
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("MachineCore")
            .field("cpu_mode", &self.target.cpu_mode())
            .field("breakpoints", &self.breakpoints.len())
            .field("threads", &self.threads)
            .field("suspension", &self.suspension)
            .field("stopped", &self.stopped)
            .field("pending_breakpoint", &self.pending_breakpoint)
            .finish_non_exhaustive()
    }
}

impl MachineCore
{
    /// Create a core for the process behind `target`, isolating threads
    /// while they step off breakpoints.
    #[must_use]
    pub fn new(target: Box<dyn ProcessTarget>) -> Self
    {
        Self::with_isolation(target, true)
    }

    /// Create a core, choosing whether sibling threads are suspended while
    /// a thread executes the instruction under a lifted breakpoint.
    #[must_use]
    pub fn with_isolation(target: Box<dyn ProcessTarget>, isolate_threads: bool) -> Self
    {
        Self {
            target,
            breakpoints: BreakpointTable::new(),
            threads: BTreeMap::new(),
            suspension: ThreadSuspension::new(),
            stopped: None,
            pending_breakpoint: None,
            isolate_threads,
        }
    }

    /// Instruction width of the debuggee.
    #[must_use]
    pub fn cpu_mode(&self) -> CpuMode
    {
        self.target.cpu_mode()
    }

    /// Raw access to the process, bypassing breakpoint bookkeeping.
    pub fn target_mut(&mut self) -> &mut dyn ProcessTarget
    {
        self.target.as_mut()
    }

    /// The breakpoint table.
    #[must_use]
    pub fn breakpoints(&self) -> &BreakpointTable
    {
        &self.breakpoints
    }

    /// The thread the process is stopped on, if any.
    #[must_use]
    pub fn stopped_thread(&self) -> Option<ThreadId>
    {
        self.stopped.as_ref().map(|stop| stop.thread)
    }

    /// Whether sibling threads are currently held for a breakpoint restore.
    #[must_use]
    pub fn is_isolating(&self) -> bool
    {
        self.suspension.is_active()
    }

    /// Number of traps `thread` is waiting for.
    #[must_use]
    pub fn expected_depth(&self, thread: ThreadId) -> usize
    {
        self.threads.get(&thread).map_or(0, |state| state.expected.len())
    }

    /// Whether a client step is in flight on `thread`.
    #[must_use]
    pub fn is_stepping(&self, thread: ThreadId) -> bool
    {
        self.threads.get(&thread).is_some_and(|state| state.stepper.is_some())
    }

    /// Address of the breakpoint behind the last breakpoint notification.
    #[must_use]
    pub fn pending_breakpoint(&self) -> Option<Address>
    {
        self.pending_breakpoint
    }

    // ---- lifecycle ----------------------------------------------------------

    /// A debug event stopped the process on `thread`.
    pub fn on_stopped(&mut self, thread: ThreadId)
    {
        self.threads.entry(thread).or_default();
        self.stopped = Some(StopState {
            thread,
            on_exception: false,
            context: None,
            dirty: false,
        });
    }

    /// A thread started. It is held if siblings are being isolated.
    ///
    /// ## Errors
    ///
    /// Errors suspending the new thread.
    pub fn on_create_thread(&mut self, thread: ThreadId) -> Result<()>
    {
        self.threads.entry(thread).or_default();
        self.suspension.apply_to_new_thread(self.target.as_mut(), thread)
    }

    /// A thread exited; its step is abandoned.
    pub fn on_exit_thread(&mut self, thread: ThreadId)
    {
        if self.threads.contains_key(&thread) {
            if let Err(error) = self.cancel_thread_step(thread) {
                warn!(thread = thread.raw(), %error, "Failed to cancel step of exiting thread");
            }
        }

        self.threads.remove(&thread);
        self.suspension.forget_thread(thread);
        if self.stopped_thread() == Some(thread) {
            self.stopped = None;
        }
    }

    /// Decide what an exception raised by the stopped `thread` means
    ///
    /// `probe` is asked when a step-in enters a function.
    ///
    /// ## Errors
    ///
    /// [`DebuggerError::WrongState`] if `thread` is not the stopped thread,
    /// or OS errors reading its context or cleaning up traps.
    pub fn on_exception(
        &mut self,
        thread: ThreadId,
        record: &ExceptionRecord,
        probe: &mut dyn CallProbe,
    ) -> Result<MachineResult>
    {
        let stop = self
            .stopped
            .as_mut()
            .filter(|stop| stop.thread == thread)
            .ok_or_else(|| DebuggerError::WrongState(format!("thread {thread} is not the stopped thread")))?;
        stop.on_exception = true;
        self.pending_breakpoint = None;
        self.context()?;

        let result = match record.code {
            ExceptionCode::SingleStep => self.dispatch_single_step(thread, probe)?,
            ExceptionCode::Breakpoint => self.dispatch_breakpoint(thread, record.address, probe)?,
            _ => {
                self.cancel_thread_step(thread)?;
                MachineResult::NotHandled
            }
        };

        debug!(thread = thread.raw(), code = %record.code, address = %record.address, %result, "Exception dispatched");
        Ok(result)
    }

    /// The stopped thread is about to run again
    ///
    /// Moves the thread off a breakpoint it is stopped on and writes the
    /// cached context back.
    ///
    /// ## Errors
    ///
    /// Decode or OS errors. Whatever was armed for the step-away is undone.
    pub fn on_continue(&mut self) -> Result<()>
    {
        let Some(stop) = self.stopped.as_ref() else {
            return Ok(());
        };
        let thread = stop.thread;
        let on_exception = stop.on_exception;

        // a resume stepper only has to last until the next stop
        if self.threads.get(&thread).is_some_and(|state| state.resume.is_some()) {
            if let Some((outcome, _)) = self.run_stepper(thread, TrapOwner::Resume, &mut NoProbe, |s, m| s.cancel(m)) {
                outcome?;
            }
            self.retire(thread, TrapOwner::Resume)?;
        }

        if on_exception {
            match self.context() {
                Ok(_) => self.step_off_breakpoint(thread)?,
                Err(error) if error.is_access_denied() => {
                    debug!(thread = thread.raw(), "Stopped thread is gone, nothing to restore");
                    self.stopped = None;
                    return Ok(());
                }
                Err(error) => return Err(error),
            }
        }

        self.flush_context()?;
        self.stopped = None;
        Ok(())
    }

    /// Cancel every step and release everything the core holds in the process.
    pub fn detach(&mut self) -> Result<()>
    {
        let mut first = None;

        let threads: Vec<ThreadId> = self.threads.keys().copied().collect();
        for thread in threads {
            keep_first(&mut first, self.cancel_thread_step(thread));
        }
        while self.suspension.is_active() {
            keep_first(&mut first, self.suspension.resume_others(self.target.as_mut()));
        }
        self.breakpoints.detach_all(self.target.as_mut());
        keep_first(&mut first, self.flush_context());

        debug!("Machine detached");
        first.map_or(Ok(()), Err)
    }

    // ---- commands -----------------------------------------------------------

    /// Set a user breakpoint.
    pub fn set_breakpoint(&mut self, address: Address) -> Result<()>
    {
        self.breakpoints.set(self.target.as_mut(), address, BreakpointOwner::User)
    }

    /// Remove a user breakpoint; no-op when there is none.
    pub fn remove_breakpoint(&mut self, address: Address) -> Result<()>
    {
        self.breakpoints.remove(self.target.as_mut(), address, BreakpointOwner::User)
    }

    /// Whether any breakpoint (user or stepper) is live at `address`.
    #[must_use]
    pub fn is_breakpoint_active(&self, address: Address) -> bool
    {
        self.breakpoints.is_active(address)
    }

    /// Read memory as the debuggee sees it. See [`BreakpointTable::read_clean`].
    pub fn read_memory(&mut self, address: Address, len: usize) -> Result<MemoryRead>
    {
        self.breakpoints.read_clean(self.target.as_mut(), address, len)
    }

    /// Write memory under breakpoints. See [`BreakpointTable::write_clean`].
    pub fn write_memory(&mut self, address: Address, data: &[u8]) -> Result<usize>
    {
        self.breakpoints.write_clean(self.target.as_mut(), address, data)
    }

    /// Context of the stopped thread.
    ///
    /// ## Errors
    ///
    /// [`DebuggerError::WrongState`] when nothing is stopped.
    pub fn context(&mut self) -> Result<ThreadContext>
    {
        let stop = self.stopped.as_mut().ok_or_else(not_stopped)?;
        let context = match stop.context {
            Some(context) => context,
            None => self.target.get_context(stop.thread)?,
        };
        Ok(*stop.context.insert(context))
    }

    /// Replace the context of the stopped thread
    ///
    /// The new registers stay cached until the thread runs again, so later
    /// reads in the same stop see them and the write-back on continue does
    /// not undo them.
    ///
    /// ## Errors
    ///
    /// [`DebuggerError::WrongState`] when nothing is stopped.
    pub fn set_context(&mut self, context: &ThreadContext) -> Result<()>
    {
        let stop = self.stopped.as_mut().ok_or_else(not_stopped)?;
        stop.context = Some(*context);
        stop.dirty = true;
        trace!(thread = stop.thread.raw(), pc = %context.pc, "Context replaced");
        Ok(())
    }

    /// Instruction pointer of the stopped thread.
    pub fn pc(&mut self) -> Result<Address>
    {
        Ok(self.context()?.pc)
    }

    /// Step one instruction on the stopped thread
    ///
    /// ## Errors
    ///
    /// [`DebuggerError::WrongState`] when nothing is stopped,
    /// [`DebuggerError::Decode`] if the instruction cannot be read. On error
    /// the thread is left without a step.
    pub fn set_step_instruction(&mut self, step_in: bool, source_mode: bool) -> Result<()>
    {
        self.install_step(|machine, pc| {
            if step_in {
                stepper::make_step_in_stepper(machine, pc, source_mode, true)
            } else {
                stepper::make_step_over_stepper(machine, pc, true)
            }
        })
    }

    /// Step until the stopped thread leaves `range`.
    pub fn set_step_range(&mut self, step_in: bool, source_mode: bool, range: AddressRange) -> Result<()>
    {
        self.install_step(|_, pc| Ok(Stepper::range_step(pc, step_in, source_mode, range)))
    }

    /// Run until the return address `target` is reached.
    pub fn set_step_out(&mut self, target: Address) -> Result<()>
    {
        self.install_step(|_, pc| Ok(Stepper::run_to(pc, target, Motion::StepOut)))
    }

    /// Run until `target` is reached.
    pub fn set_run_to(&mut self, target: Address) -> Result<()>
    {
        self.install_step(|_, pc| Ok(Stepper::run_to(pc, target, Motion::RunTo)))
    }

    /// Abandon the stopped thread's step and release every trap it armed
    ///
    /// ## Errors
    ///
    /// [`DebuggerError::WrongState`] when nothing is stopped, or the first
    /// failing clean-up action (the rest still run).
    pub fn cancel_step(&mut self) -> Result<()>
    {
        let thread = self.stopped_thread().ok_or_else(not_stopped)?;
        self.cancel_thread_step(thread)
    }

    // ---- dispatch -----------------------------------------------------------

    fn dispatch_single_step(&mut self, thread: ThreadId, probe: &mut dyn CallProbe) -> Result<MachineResult>
    {
        let pc = self.context()?.pc;
        let state = self.threads.entry(thread).or_default();

        // one trace trap satisfies every single-step expectation at the top
        let split = state
            .expected
            .iter()
            .rposition(|event| event.code != ExpectedCode::SingleStep)
            .map_or(0, |index| index + 1);
        let fired: ExpectedStack = state.expected.drain(split..).collect();

        if fired.is_empty() {
            if !state.expected.is_empty() {
                debug!(thread = thread.raw(), "Trace trap while waiting for a breakpoint, step abandoned");
                self.cancel_thread_step(thread)?;
            }
            return Ok(MachineResult::PendingCallbackEmbeddedStep);
        }

        let mut first = None;
        for event in fired.iter().rev() {
            keep_first(&mut first, self.run_actions(thread, event));
        }
        if let Some(error) = first {
            return Err(error);
        }

        let mut result = MachineResult::NotHandled;

        if fired.iter().any(|event| event.owner == TrapOwner::Stepper) {
            match self.run_stepper(thread, TrapOwner::Stepper, probe, |s, m| s.on_single_step(m, pc)) {
                Some((Ok(_), true)) => {
                    self.retire(thread, TrapOwner::Stepper)?;
                    result = result.combine(MachineResult::PendingCallbackStep);
                }
                Some((Ok(outcome), false)) => result = result.combine(outcome),
                Some((Err(error), _)) => return self.abandon_step(thread, &error),
                None => {}
            }
        }

        if fired.iter().any(|event| event.owner == TrapOwner::Resume) {
            match self.run_stepper(thread, TrapOwner::Resume, probe, |s, m| s.on_single_step(m, pc)) {
                Some((Ok(outcome), complete)) => {
                    if complete {
                        self.retire(thread, TrapOwner::Resume)?;
                    }
                    result = result.combine(resumed(outcome));
                }
                Some((Err(error), _)) => return self.abandon_step(thread, &error),
                None => {}
            }
        }

        if result == MachineResult::NotHandled {
            result = MachineResult::PendingCallbackEmbeddedStep;
        }
        Ok(result)
    }

    fn dispatch_breakpoint(&mut self, thread: ThreadId, address: Address, probe: &mut dyn CallProbe) -> Result<MachineResult>
    {
        let embedded = self.at_embedded_breakpoint(address);
        let state = self.threads.entry(thread).or_default();

        if state.expected.last().is_some_and(|event| event.expects_breakpoint_at(address)) {
            if let Some(event) = state.expected.pop() {
                self.run_actions(thread, &event)?;
            }
        }

        let mut result = MachineResult::NotHandled;
        let mut rewind = true;

        match self.run_stepper(thread, TrapOwner::Stepper, probe, |s, m| s.on_breakpoint(m, address)) {
            Some((Ok(verdict), complete)) => {
                rewind = verdict.rewind;
                result = verdict.result;
                if complete {
                    self.retire(thread, TrapOwner::Stepper)?;
                    result = MachineResult::PendingCallbackStep;
                }
            }
            Some((Err(error), _)) => {
                if !embedded {
                    self.set_pc(address)?;
                }
                return self.abandon_step(thread, &error);
            }
            None => {}
        }

        if result == MachineResult::NotHandled {
            match self.run_stepper(thread, TrapOwner::Resume, probe, |s, m| s.on_breakpoint(m, address)) {
                Some((Ok(verdict), complete)) => {
                    rewind = verdict.rewind;
                    result = resumed(verdict.result);
                    if complete {
                        self.retire(thread, TrapOwner::Resume)?;
                    }
                }
                Some((Err(error), _)) => return self.abandon_step(thread, &error),
                None => {}
            }
        }

        if result == MachineResult::NotHandled {
            rewind = true;
            if embedded {
                let keep = self
                    .threads
                    .get(&thread)
                    .and_then(|state| state.stepper.as_ref())
                    .is_some_and(Stepper::can_skip_embedded_bp);
                if !keep {
                    self.cancel_thread_step(thread)?;
                }
                self.pending_breakpoint = Some(address);
                result = MachineResult::PendingCallbackEmbeddedBp;
            } else if self.breakpoints.is_user(address) {
                self.pending_breakpoint = Some(address);
                result = MachineResult::PendingCallbackBp;
            } else {
                result = MachineResult::HandledContinue;
            }
        }

        if rewind {
            self.set_pc(address)?;
        }
        Ok(result)
    }

    /// Arrange for `thread` to execute the instruction under a breakpoint it
    /// is stopped on and re-arm the breakpoint right after.
    fn step_off_breakpoint(&mut self, thread: ThreadId) -> Result<()>
    {
        let pc = self.context()?.pc;
        let stepper = self.threads.get(&thread).and_then(|state| state.stepper.as_ref());
        let stepping = stepper.is_some();
        let can_skip = stepper.is_some_and(Stepper::can_skip_embedded_bp);

        if self.at_embedded_breakpoint(pc) {
            if !stepping {
                trace!(thread = thread.raw(), address = %pc, "Skipping embedded breakpoint");
                self.set_pc(pc + 1)?;
            } else if can_skip {
                if let Some((outcome, _)) =
                    self.run_stepper(thread, TrapOwner::Stepper, &mut NoProbe, |s, m| s.request_step_away(m, pc))
                {
                    outcome?;
                }
            }
            return Ok(());
        }

        if !self.breakpoints.is_patched(pc) {
            return Ok(());
        }

        let armed = if stepping {
            self.run_stepper(thread, TrapOwner::Stepper, &mut NoProbe, |s, m| s.request_step_away(m, pc))
                .map_or(Ok(()), |(outcome, _)| outcome)
        } else {
            self.start_resume_stepper(thread, pc)
        };
        if let Err(error) = armed {
            self.unwind_after_failure(thread);
            return Err(error);
        }

        if self.expected_depth(thread) == 0 {
            // the step needs nothing to get past here, the restore still does
            if let Err(error) = self.start_resume_stepper(thread, pc) {
                self.unwind_after_failure(thread);
                return Err(error);
            }
        }

        if let Err(error) = self.breakpoints.temp_unpatch(self.target.as_mut(), pc) {
            self.unwind_after_failure(thread);
            return Err(error);
        }

        let isolate = self.isolate_threads && self.threads.len() > 1;
        if isolate {
            let siblings: Vec<ThreadId> = self.threads.keys().copied().collect();
            if let Err(error) = self.suspension.suspend_others(self.target.as_mut(), siblings, thread) {
                log_rollback(self.breakpoints.temp_patch(self.target.as_mut(), pc));
                self.unwind_after_failure(thread);
                return Err(error);
            }
        }

        match self.threads.get_mut(&thread).and_then(|state| state.expected.last_mut()) {
            Some(top) => {
                top.unpatched_address = Some(pc);
                top.resume_threads = isolate;
            }
            None => {
                log_rollback(self.breakpoints.temp_patch(self.target.as_mut(), pc));
                if isolate {
                    log_rollback(self.suspension.resume_others(self.target.as_mut()));
                }
                return Err(DebuggerError::WrongState("no trap armed to restore the breakpoint".into()));
            }
        }

        debug!(thread = thread.raw(), address = %pc, isolate, "Stepping off breakpoint");
        Ok(())
    }

    fn start_resume_stepper(&mut self, thread: ThreadId, pc: Address) -> Result<()>
    {
        let mut probe = NoProbe;
        let mut host = StepHost::new(self, thread, TrapOwner::Resume, &mut probe);
        let mut resume = stepper::make_resume_stepper(&mut host, pc)?;
        host.motion = resume.motion();
        resume.start(&mut host)?;

        if let Some(state) = self.threads.get_mut(&thread) {
            state.resume = Some(resume);
        }
        Ok(())
    }

    /// Replace the stopped thread's step with the one `build` makes.
    fn install_step(&mut self, build: impl FnOnce(&mut dyn StepperMachine, Address) -> Result<Stepper>) -> Result<()>
    {
        let thread = self.stopped_thread().ok_or_else(not_stopped)?;
        self.cancel_thread_step(thread)?;
        let pc = self.context()?.pc;

        let mut probe = NoProbe;
        let mut host = StepHost::new(self, thread, TrapOwner::Stepper, &mut probe);
        let mut step = build(&mut host, pc)?;
        host.motion = step.motion();
        host.range = step.range();

        if let Err(error) = step.start(&mut host) {
            warn!(thread = thread.raw(), %error, "Step failed to start");
            self.unwind_after_failure(thread);
            return Err(error);
        }

        debug!(thread = thread.raw(), address = %pc, motion = ?step.motion(), landing = ?step.landing(), "Step started");
        if let Some(state) = self.threads.get_mut(&thread) {
            state.stepper = Some(step);
        }
        Ok(())
    }

    // ---- thread step bookkeeping --------------------------------------------

    /// Run `f` on the stepper in `owner`'s slot with a host bound to it
    ///
    /// Returns `None` when the slot is empty, otherwise the outcome and
    /// whether the stepper is complete. The stepper stays in its slot.
    fn run_stepper<T>(
        &mut self,
        thread: ThreadId,
        owner: TrapOwner,
        probe: &mut dyn CallProbe,
        f: impl FnOnce(&mut Stepper, &mut dyn StepperMachine) -> Result<T>,
    ) -> Option<(Result<T>, bool)>
    {
        let mut stepper = self.slot(thread, owner)?.take()?;

        let mut host = StepHost::new(self, thread, owner, probe);
        host.motion = stepper.motion();
        host.range = stepper.range();
        let outcome = f(&mut stepper, &mut host);
        let complete = stepper.is_complete();

        if let Some(slot) = self.slot(thread, owner) {
            *slot = Some(stepper);
        }
        Some((outcome, complete))
    }

    fn slot(&mut self, thread: ThreadId, owner: TrapOwner) -> Option<&mut Option<Stepper>>
    {
        let state = self.threads.get_mut(&thread)?;
        Some(match owner {
            TrapOwner::Stepper => &mut state.stepper,
            TrapOwner::Resume => &mut state.resume,
        })
    }

    /// Drop `owner`'s stepper and release the traps it still has armed.
    fn retire(&mut self, thread: ThreadId, owner: TrapOwner) -> Result<()>
    {
        if let Some(slot) = self.slot(thread, owner) {
            *slot = None;
        }

        let mut first = None;
        while let Some(event) = self.take_event(thread, |event| event.owner == owner) {
            keep_first(&mut first, self.run_actions(thread, &event));
        }
        first.map_or(Ok(()), Err)
    }

    fn cancel_thread_step(&mut self, thread: ThreadId) -> Result<()>
    {
        let mut first = None;

        for owner in [TrapOwner::Stepper, TrapOwner::Resume] {
            if let Some((outcome, _)) = self.run_stepper(thread, owner, &mut NoProbe, |s, m| s.cancel(m)) {
                keep_first(&mut first, outcome);
            }
            if let Some(slot) = self.slot(thread, owner) {
                *slot = None;
            }
        }

        while let Some(event) = self.take_event(thread, |_| true) {
            keep_first(&mut first, self.run_actions(thread, &event));
        }

        first.map_or(Ok(()), Err)
    }

    fn unwind_after_failure(&mut self, thread: ThreadId)
    {
        log_rollback(self.cancel_thread_step(thread));
    }

    fn abandon_step(&mut self, thread: ThreadId, error: &DebuggerError) -> Result<MachineResult>
    {
        warn!(thread = thread.raw(), %error, "Step failed, cancelling");
        self.cancel_thread_step(thread)?;
        Ok(MachineResult::NotHandled)
    }

    /// Remove the topmost expected event matching `matches`.
    fn take_event(&mut self, thread: ThreadId, matches: impl Fn(&ExpectedEvent) -> bool) -> Option<ExpectedEvent>
    {
        let state = self.threads.get_mut(&thread)?;
        let index = state.expected.iter().rposition(matches)?;
        Some(state.expected.remove(index))
    }

    fn push_event(&mut self, thread: ThreadId, event: ExpectedEvent)
    {
        self.threads.entry(thread).or_default().expected.push(event);
    }

    /// Clean up after an expected event that fired or was withdrawn.
    fn run_actions(&mut self, thread: ThreadId, event: &ExpectedEvent) -> Result<()>
    {
        let mut first = None;

        if event.clear_trace_flag {
            keep_first(&mut first, self.set_trace_flag(thread, false));
        }
        if let Some(address) = event.unpatched_address {
            keep_first(&mut first, self.breakpoints.temp_patch(self.target.as_mut(), address));
        }
        if event.remove_bp {
            if let Some(address) = event.bp_address {
                keep_first(
                    &mut first,
                    self.breakpoints.remove(self.target.as_mut(), address, BreakpointOwner::Stepper),
                );
            }
        }
        if event.resume_threads {
            keep_first(&mut first, self.suspension.resume_others(self.target.as_mut()));
        }

        trace!(
            thread = thread.raw(),
            code = ?event.code,
            owner = ?event.owner,
            motion = ?event.motion,
            range = ?event.range,
            "Expected event retired"
        );
        first.map_or(Ok(()), Err)
    }

    // ---- context ------------------------------------------------------------

    fn update_context(&mut self, f: impl FnOnce(&mut ThreadContext)) -> Result<()>
    {
        let mut context = self.context()?;
        f(&mut context);

        let stop = self.stopped.as_mut().ok_or_else(not_stopped)?;
        stop.context = Some(context);
        stop.dirty = true;
        Ok(())
    }

    fn set_pc(&mut self, pc: Address) -> Result<()>
    {
        self.update_context(|context| context.pc = pc)
    }

    fn set_trace_flag(&mut self, thread: ThreadId, enabled: bool) -> Result<()>
    {
        if self.stopped_thread() == Some(thread) {
            return self.update_context(|context| context.set_trace_flag(enabled));
        }

        let mut context = self.target.get_context(thread)?;
        context.set_trace_flag(enabled);
        self.target.set_context(thread, &context)
    }

    fn flush_context(&mut self) -> Result<()>
    {
        let Some(stop) = self.stopped.as_mut() else {
            return Ok(());
        };
        if let (true, Some(context)) = (stop.dirty, stop.context) {
            self.target.set_context(stop.thread, &context)?;
            stop.dirty = false;
        }
        Ok(())
    }

    fn at_embedded_breakpoint(&mut self, address: Address) -> bool
    {
        self.breakpoints
            .read_clean(self.target.as_mut(), address, 1)
            .is_ok_and(|read| read.data.first() == Some(&BREAKPOINT_OPCODE))
    }
}

/// A resume stepper finishing is no reason to stop.
fn resumed(result: MachineResult) -> MachineResult
{
    if result == MachineResult::HandledStopped {
        MachineResult::HandledContinue
    } else {
        result
    }
}

/// The machine as seen by one stepper of one thread
struct StepHost<'a, 'p>
{
    core: &'a mut MachineCore,
    thread: ThreadId,
    owner: TrapOwner,
    motion: Motion,
    range: Option<AddressRange>,
    probe: &'a mut (dyn CallProbe + 'p),
}

impl<'a, 'p> StepHost<'a, 'p>
{
    fn new(core: &'a mut MachineCore, thread: ThreadId, owner: TrapOwner, probe: &'a mut (dyn CallProbe + 'p)) -> Self
    {
        Self {
            core,
            thread,
            owner,
            motion: Motion::StepIn,
            range: None,
            probe,
        }
    }
}

impl StepperMachine for StepHost<'_, '_>
{
    fn read_instruction(&mut self, address: Address) -> Result<Instruction>
    {
        let mode = self.core.cpu_mode();
        let read = self.core.read_memory(address, MAX_INSTRUCTION_LEN)?;
        decode::classify(&read.data, mode).ok_or(DebuggerError::Decode { address })
    }

    fn arm_single_step(&mut self) -> Result<()>
    {
        self.core.set_trace_flag(self.thread, true)?;
        self.core
            .push_event(self.thread, ExpectedEvent::single_step(self.owner, self.motion, self.range));
        debug!(thread = self.thread.raw(), owner = ?self.owner, "Single step armed");
        Ok(())
    }

    fn disarm_single_step(&mut self) -> Result<()>
    {
        let owner = self.owner;
        match self
            .core
            .take_event(self.thread, |event| event.code == ExpectedCode::SingleStep && event.owner == owner)
        {
            Some(event) => self.core.run_actions(self.thread, &event),
            None => Ok(()),
        }
    }

    fn arm_breakpoint(&mut self, address: Address) -> Result<()>
    {
        self.core
            .breakpoints
            .set(self.core.target.as_mut(), address, BreakpointOwner::Stepper)?;
        self.core.push_event(
            self.thread,
            ExpectedEvent::breakpoint(self.owner, address, self.motion, self.range),
        );
        debug!(thread = self.thread.raw(), address = %address, owner = ?self.owner, "Temporary breakpoint armed");
        Ok(())
    }

    fn disarm_breakpoint(&mut self, address: Address) -> Result<()>
    {
        let owner = self.owner;
        match self
            .core
            .take_event(self.thread, |event| event.owner == owner && event.expects_breakpoint_at(address))
        {
            Some(event) => self.core.run_actions(self.thread, &event),
            None => Ok(()),
        }
    }

    fn probe_call(&mut self, address: Address, thunk: Option<AddressRange>) -> ProbeRunMode
    {
        self.probe.probe(self.thread, address, thunk)
    }
}
