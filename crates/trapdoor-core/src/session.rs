//! # Debug Session
//!
//! The command surface and the debug-event loop.
//!
//! A [`DebugSession`] owns a [`DebugBackend`], one [`Process`] per debuggee
//! and the client's [`EventCallback`]. The client drives it from one thread:
//! call [`DebugSession::wait_for_event`] in a loop, and issue commands
//! whenever a notification left a process stopped.
//!
//! ## Example
//!
//! ```rust,no_run
//! use trapdoor_core::events::ChannelCallback;
//! use trapdoor_core::platform;
//! use trapdoor_core::session::DebugSession;
//! use trapdoor_core::target::LaunchInfo;
//!
//! # fn main() -> trapdoor_core::Result<()> {
//! let (callback, events) = ChannelCallback::new();
//! let mut session = DebugSession::new(platform::native_backend()?, Box::new(callback));
//!
//! let pid = session.launch(&LaunchInfo::new("/bin/true"))?;
//! while session.has_live_processes() {
//!     session.wait_for_event()?;
//!     for event in events.try_iter() {
//!         println!("{}", event.describe());
//!     }
//!     if session.process(pid).is_some_and(|p| p.is_stopped()) {
//!         session.continue_process(pid, false)?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{DebuggerError, Result};
use crate::events::{EventCallback, EventKind, RunMode};
use crate::machine::{MachineCore, MachineResult};
use crate::process::Process;
use crate::target::{DebugBackend, DebugEvent, ExceptionCode, ExceptionRecord, LaunchInfo, MemoryRead};
use crate::types::{Address, AddressRange, CreateMethod, ProcessId, ThreadContext, ThreadId};

/// Session-wide settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig
{
    /// Suspend sibling threads while a thread steps off a breakpoint
    pub isolate_threads: bool,
    /// Probe calls on step-in so the client can skip functions without source
    pub source_mode: bool,
    /// How long one [`DebugSession::wait_for_event`] call blocks
    pub wait_timeout: Duration,
}

impl Default for SessionConfig
{
    fn default() -> Self
    {
        Self {
            isolate_threads: true,
            source_mode: true,
            wait_timeout: Duration::from_millis(100),
        }
    }
}

/// Debugger front door: commands plus the event loop
pub struct DebugSession<B: DebugBackend>
{
    backend: B,
    callback: Box<dyn EventCallback>,
    config: SessionConfig,
    processes: BTreeMap<ProcessId, Process>,
}

impl<B: DebugBackend> DebugSession<B>
{
    /// Create a session with the default [`SessionConfig`].
    #[must_use]
    pub fn new(backend: B, callback: Box<dyn EventCallback>) -> Self
    {
        Self::with_config(backend, callback, SessionConfig::default())
    }

    /// Create a session with explicit settings.
    #[must_use]
    pub fn with_config(backend: B, callback: Box<dyn EventCallback>, config: SessionConfig) -> Self
    {
        Self {
            backend,
            callback,
            config,
            processes: BTreeMap::new(),
        }
    }

    /// Session settings.
    #[must_use]
    pub fn config(&self) -> &SessionConfig
    {
        &self.config
    }

    /// The OS backend.
    #[must_use]
    pub fn backend(&self) -> &B
    {
        &self.backend
    }

    /// Mutable access to the OS backend.
    pub fn backend_mut(&mut self) -> &mut B
    {
        &mut self.backend
    }

    /// Look up a process, including ones that already ended.
    #[must_use]
    pub fn process(&self, pid: ProcessId) -> Option<&Process>
    {
        self.processes.get(&pid)
    }

    /// Every process the session knows about.
    pub fn processes(&self) -> impl Iterator<Item = &Process>
    {
        self.processes.values()
    }

    /// Whether any process is still running or stopped.
    #[must_use]
    pub fn has_live_processes(&self) -> bool
    {
        self.processes.values().any(|process| !process.is_deleted())
    }

    // ---- process lifetime ---------------------------------------------------

    /// Start a program under the debugger
    ///
    /// The process reports its creation through the event loop. With
    /// [`LaunchInfo::suspended`] it does not run past that until
    /// [`DebugSession::resume_launched_process`].
    ///
    /// ## Errors
    ///
    /// Backend launch errors.
    pub fn launch(&mut self, info: &LaunchInfo) -> Result<ProcessId>
    {
        let pid = self.backend.launch(info)?;
        self.register(pid, CreateMethod::Launch, Some(info.program.clone()))?;

        info!(pid = pid.0, program = %info.program.display(), suspended = info.suspend, "Process launched");
        Ok(pid)
    }

    /// Attach to a running process.
    pub fn attach(&mut self, pid: ProcessId) -> Result<()>
    {
        self.backend.attach(pid)?;
        self.register(pid, CreateMethod::Attach, None)?;

        info!(pid = pid.0, "Attached to process");
        Ok(())
    }

    fn register(&mut self, pid: ProcessId, method: CreateMethod, exe: Option<std::path::PathBuf>) -> Result<()>
    {
        let target = self.backend.take_target(pid)?;
        let machine = MachineCore::with_isolation(target, self.config.isolate_threads);
        self.processes.insert(pid, Process::new(pid, method, exe, machine));
        Ok(())
    }

    /// Let a process launched suspended start running.
    pub fn resume_launched_process(&mut self, pid: ProcessId) -> Result<()>
    {
        self.live_process(pid)?;
        self.backend.resume_launched(pid)
    }

    /// Kill a process. Its exit arrives through the event loop.
    ///
    /// ## Errors
    ///
    /// [`DebuggerError::ProcessEnded`] if it is already going away, or
    /// backend errors.
    pub fn terminate(&mut self, pid: ProcessId) -> Result<()>
    {
        let process = self.live_process(pid)?;
        process.set_terminating();
        let stopped_on = process.is_stopped().then(|| process.last_event()).flatten();

        self.backend.terminate(pid)?;

        if let Some((_, thread)) = stopped_on {
            if let Err(error) = self.backend.continue_event(pid, thread, true) {
                warn!(pid = pid.0, %error, "Continue after terminate failed");
            }
            if let Some(process) = self.processes.get_mut(&pid) {
                process.set_stopped(false);
            }
        }

        info!(pid = pid.0, "Process terminating");
        Ok(())
    }

    /// Stop debugging a process and let it run on.
    pub fn detach(&mut self, pid: ProcessId) -> Result<()>
    {
        let process = self.live_process(pid)?;
        process.machine_mut().detach()?;
        process.set_terminating();

        let trapped = matches!(
            process.last_exception().map(|record| record.code),
            Some(ExceptionCode::Breakpoint | ExceptionCode::SingleStep)
        );
        let continue_on = process
            .is_stopped()
            .then(|| process.last_event())
            .flatten()
            .filter(|_| trapped);

        if let Some((_, thread)) = continue_on {
            self.backend.continue_event(pid, thread, true)?;
        }
        self.backend.detach(pid)?;

        if let Some(process) = self.processes.get_mut(&pid) {
            process.set_deleted();
        }
        self.callback.on_process_exit(pid, 0);

        info!(pid = pid.0, "Detached from process");
        Ok(())
    }

    /// Ask a running process to stop; it reports through
    /// [`EventCallback::on_async_break_complete`].
    pub fn async_break(&mut self, pid: ProcessId) -> Result<()>
    {
        let process = self.live_process(pid)?;
        if process.is_stopped() {
            return Ok(());
        }
        self.backend.async_break(pid)
    }

    // ---- memory and breakpoints ---------------------------------------------

    /// Read debuggee memory, with breakpoints hidden
    ///
    /// A read running into unmapped memory is not an error: the readable
    /// prefix comes back and [`MemoryRead::unreadable`] counts the rest.
    pub fn read_memory(&mut self, pid: ProcessId, address: Address, len: usize) -> Result<MemoryRead>
    {
        self.live_process(pid)?.machine_mut().read_memory(address, len)
    }

    /// Write debuggee memory without disturbing breakpoints.
    pub fn write_memory(&mut self, pid: ProcessId, address: Address, data: &[u8]) -> Result<usize>
    {
        self.live_process(pid)?.machine_mut().write_memory(address, data)
    }

    /// Set a user breakpoint.
    pub fn set_breakpoint(&mut self, pid: ProcessId, address: Address) -> Result<()>
    {
        self.edit_breakpoints(pid, |machine| machine.set_breakpoint(address))
    }

    /// Remove a user breakpoint.
    pub fn remove_breakpoint(&mut self, pid: ProcessId, address: Address) -> Result<()>
    {
        self.edit_breakpoints(pid, |machine| machine.remove_breakpoint(address))
    }

    /// Breakpoint edits on a running process happen with every thread held.
    fn edit_breakpoints(&mut self, pid: ProcessId, edit: impl FnOnce(&mut MachineCore) -> Result<()>) -> Result<()>
    {
        let process = self.live_process(pid)?;
        if process.is_stopped() {
            return edit(process.machine_mut());
        }

        process.suspend()?;
        let outcome = edit(process.machine_mut());
        let resumed = process.resume();
        outcome.and(resumed)
    }

    /// Registers of the thread the process is stopped on, as they will be
    /// when it runs again.
    pub fn thread_context(&mut self, pid: ProcessId) -> Result<ThreadContext>
    {
        self.stopped_process(pid)?.machine_mut().context()
    }

    /// Replace the registers of the stopped thread. They are written back
    /// when the process continues.
    ///
    /// ## Errors
    ///
    /// [`DebuggerError::WrongState`] unless the process is stopped.
    pub fn set_thread_context(&mut self, pid: ProcessId, context: &ThreadContext) -> Result<()>
    {
        self.stopped_process(pid)?.machine_mut().set_context(context)
    }

    // ---- execution ----------------------------------------------------------

    /// Let a stopped process run
    ///
    /// `handle_exception` says whether the exception the process stopped on
    /// was dealt with. `false` passes it on to the debuggee.
    pub fn continue_process(&mut self, pid: ProcessId, handle_exception: bool) -> Result<()>
    {
        self.stopped_process(pid)?;
        self.continue_internal(pid, handle_exception)
    }

    /// Execute one instruction, entering calls if `step_in`
    ///
    /// Every step command takes `handle_exception` with the meaning it has
    /// for [`DebugSession::continue_process`].
    pub fn step_instruction(&mut self, pid: ProcessId, step_in: bool, handle_exception: bool) -> Result<()>
    {
        let source_mode = self.config.source_mode;
        self.stopped_process(pid)?
            .machine_mut()
            .set_step_instruction(step_in, source_mode)?;
        self.continue_internal(pid, handle_exception)
    }

    /// Step until the pc leaves `range`.
    pub fn step_range(
        &mut self,
        pid: ProcessId,
        step_in: bool,
        range: AddressRange,
        handle_exception: bool,
    ) -> Result<()>
    {
        let source_mode = self.config.source_mode;
        self.stopped_process(pid)?
            .machine_mut()
            .set_step_range(step_in, source_mode, range)?;
        self.continue_internal(pid, handle_exception)
    }

    /// Run until the return address `target` is reached.
    pub fn step_out(&mut self, pid: ProcessId, target: Address, handle_exception: bool) -> Result<()>
    {
        self.stopped_process(pid)?.machine_mut().set_step_out(target)?;
        self.continue_internal(pid, handle_exception)
    }

    /// Run until `target` is reached.
    pub fn run_to(&mut self, pid: ProcessId, target: Address, handle_exception: bool) -> Result<()>
    {
        self.stopped_process(pid)?.machine_mut().set_run_to(target)?;
        self.continue_internal(pid, handle_exception)
    }

    /// Abandon the step in flight on the stopped thread.
    pub fn cancel_step(&mut self, pid: ProcessId) -> Result<()>
    {
        self.stopped_process(pid)?.machine_mut().cancel_step()
    }

    fn live_process(&mut self, pid: ProcessId) -> Result<&mut Process>
    {
        let process = self
            .processes
            .get_mut(&pid)
            .ok_or_else(|| DebuggerError::NotFound(format!("process {pid}")))?;
        process.check_alive()?;
        Ok(process)
    }

    fn stopped_process(&mut self, pid: ProcessId) -> Result<&mut Process>
    {
        let process = self.live_process(pid)?;
        process.check_stopped()?;
        Ok(process)
    }

    fn continue_internal(&mut self, pid: ProcessId, handle_exception: bool) -> Result<()>
    {
        let process = self
            .processes
            .get_mut(&pid)
            .ok_or_else(|| DebuggerError::NotFound(format!("process {pid}")))?;
        let (_, thread) = process
            .last_event()
            .ok_or_else(|| DebuggerError::WrongState(format!("process {pid} has not stopped yet")))?;

        // traps are always ours, other exceptions only if the client says so
        let handled = match process.last_exception().map(|record| record.code) {
            Some(ExceptionCode::Breakpoint | ExceptionCode::SingleStep) | None => true,
            Some(_) => handle_exception,
        };

        process.machine_mut().on_continue()?;
        self.backend.continue_event(pid, thread, handled)?;
        process.set_stopped(false);

        debug!(pid = pid.0, thread = thread.raw(), handled, "Continued");
        Ok(())
    }

    // ---- event loop ---------------------------------------------------------

    /// Wait for one debug event and dispatch it
    ///
    /// Returns `false` when the timeout passed without an event.
    ///
    /// ## Errors
    ///
    /// Backend errors, or the error that handling the event raised. In the
    /// latter case [`EventCallback::on_error`] was called and the process
    /// is left stopped.
    pub fn wait_for_event(&mut self) -> Result<bool>
    {
        let Some(event) = self.backend.wait_for_event(self.config.wait_timeout)? else {
            return Ok(false);
        };
        self.dispatch_event(event)?;
        Ok(true)
    }

    /// Dispatch one event that was obtained elsewhere.
    pub fn dispatch_event(&mut self, event: DebugEvent) -> Result<()>
    {
        let pid = event.pid();
        let kind = event_kind(&event);
        debug!(pid = pid.0, ?kind, "Debug event");

        let Some(process) = self.processes.get_mut(&pid) else {
            warn!(pid = pid.0, ?kind, "Event for unknown process");
            if let Some(thread) = event.thread() {
                self.backend.continue_event(pid, thread, false)?;
            }
            return Ok(());
        };

        if let Some(thread) = event.thread() {
            let exception = match &event {
                DebugEvent::Exception { record, .. } => Some(*record),
                _ => None,
            };
            process.set_stopped(true);
            process.set_last_event(kind, thread, exception);
            process.machine_mut().on_stopped(thread);
        }

        match self.handle_event(event) {
            Ok(()) => Ok(()),
            Err(error) => {
                warn!(pid = pid.0, ?kind, %error, "Event handling failed");
                self.callback.on_error(pid, &error, kind);
                Err(error)
            }
        }
    }

    fn handle_event(&mut self, event: DebugEvent) -> Result<()>
    {
        match event {
            DebugEvent::ProcessCreated { pid, thread, image } => {
                let process = self.known_process(pid)?;
                process.add_thread(thread, None);
                process.machine_mut().on_create_thread(thread)?;
                if let Some(image) = &image {
                    process.add_module(image.clone());
                }
                process.set_started();

                self.callback.on_process_start(pid);
                if let Some(image) = &image {
                    self.callback.on_module_load(pid, image);
                }
                self.callback.on_thread_start(pid, thread);
                self.continue_internal(pid, false)
            }
            DebugEvent::ThreadCreated { pid, thread } => {
                let process = self.known_process(pid)?;
                process.add_thread(thread, None);
                process.machine_mut().on_create_thread(thread)?;
                process.apply_suspend_to_thread(thread)?;

                self.callback.on_thread_start(pid, thread);
                self.continue_internal(pid, false)
            }
            DebugEvent::ThreadExited { pid, thread, code } => {
                self.callback.on_thread_exit(pid, thread, code);

                let process = self.known_process(pid)?;
                process.delete_thread(thread);
                process.machine_mut().on_exit_thread(thread);
                self.continue_internal(pid, false)
            }
            DebugEvent::ProcessExited { pid, code } => {
                let process = self.known_process(pid)?;
                let started = process.is_started();
                process.set_deleted();

                if started {
                    self.callback.on_process_exit(pid, code);
                }
                info!(pid = pid.0, code, "Process exited");
                Ok(())
            }
            DebugEvent::ModuleLoaded { pid, module } => {
                self.known_process(pid)?.add_module(module.clone());
                self.callback.on_module_load(pid, &module);
                self.continue_internal(pid, false)
            }
            DebugEvent::ModuleUnloaded { pid, base } => {
                self.known_process(pid)?.remove_module(base);
                self.callback.on_module_unload(pid, base);
                self.continue_internal(pid, false)
            }
            DebugEvent::OutputString { pid, text, .. } => {
                self.callback.on_output_string(pid, &text);
                self.continue_internal(pid, false)
            }
            DebugEvent::AsyncBreak { pid, thread } => {
                self.callback.on_async_break_complete(pid, thread);
                Ok(())
            }
            DebugEvent::Exception { pid, thread, record } => self.handle_exception(pid, thread, &record),
        }
    }

    fn handle_exception(&mut self, pid: ProcessId, thread: ThreadId, record: &ExceptionRecord) -> Result<()>
    {
        let process = self
            .processes
            .get_mut(&pid)
            .ok_or_else(|| DebuggerError::NotFound(format!("process {pid}")))?;

        // the first trap of a new process comes from the loader
        if record.code == ExceptionCode::Breakpoint && !process.reached_loader_bp() {
            process.set_reached_loader_bp();
            info!(pid = pid.0, thread = thread.raw(), "Loader breakpoint reached");
            self.callback.on_load_complete(pid, thread);
            return Ok(());
        }

        let result = {
            let callback = &mut self.callback;
            let mut probe =
                |thread: ThreadId, address: Address, thunk: Option<AddressRange>| callback.on_call_probe(pid, thread, address, thunk);
            process.machine_mut().on_exception(thread, record, &mut probe)?
        };

        match result {
            MachineResult::PendingCallbackBp | MachineResult::PendingCallbackEmbeddedBp => {
                let embedded = result == MachineResult::PendingCallbackEmbeddedBp;
                let address = process.machine().pending_breakpoint().unwrap_or(record.address);

                match self.callback.on_breakpoint(pid, thread, address, embedded) {
                    RunMode::Run => self.continue_internal(pid, false),
                    RunMode::Wait => Ok(()),
                    RunMode::Break => self.known_process(pid)?.machine_mut().cancel_step(),
                }
            }
            MachineResult::PendingCallbackStep | MachineResult::PendingCallbackEmbeddedStep => {
                self.callback.on_step_complete(pid, thread);
                Ok(())
            }
            MachineResult::NotHandled => {
                match self.callback.on_exception(pid, thread, record.first_chance, record) {
                    RunMode::Run => self.continue_internal(pid, false),
                    RunMode::Break | RunMode::Wait => Ok(()),
                }
            }
            MachineResult::HandledStopped => Ok(()),
            MachineResult::HandledContinue => self.continue_internal(pid, false),
        }
    }

    fn known_process(&mut self, pid: ProcessId) -> Result<&mut Process>
    {
        self.processes
            .get_mut(&pid)
            .ok_or_else(|| DebuggerError::NotFound(format!("process {pid}")))
    }
}

fn event_kind(event: &DebugEvent) -> EventKind
{
    match event {
        DebugEvent::ProcessCreated { .. } => EventKind::ProcessStart,
        DebugEvent::ProcessExited { .. } => EventKind::ProcessExit,
        DebugEvent::ThreadCreated { .. } => EventKind::ThreadStart,
        DebugEvent::ThreadExited { .. } => EventKind::ThreadExit,
        DebugEvent::ModuleLoaded { .. } => EventKind::ModuleLoad,
        DebugEvent::ModuleUnloaded { .. } => EventKind::ModuleUnload,
        DebugEvent::OutputString { .. } => EventKind::OutputString,
        DebugEvent::Exception { .. } => EventKind::Exception,
        DebugEvent::AsyncBreak { .. } => EventKind::AsyncBreak,
    }
}
