//! Debugger event callbacks and helpers.
//!
//! The session reports everything that happens in a debuggee to one
//! [`EventCallback`]. Some notifications are questions: the value returned
//! from [`EventCallback::on_breakpoint`], [`EventCallback::on_exception`] and
//! [`EventCallback::on_call_probe`] decides whether the process runs on.
//!
//! Front ends that would rather consume events from a queue (the CLI, the
//! test-suite) use [`ChannelCallback`], which turns every notification into a
//! [`DebuggerEvent`] on an `mpsc` channel and answers the questions with
//! fixed policies.

use std::sync::mpsc;

use crate::error::DebuggerError;
use crate::target::{ExceptionRecord, Module};
use crate::types::{Address, AddressRange, ProcessId, ThreadId};

/// Answer to a stop notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RunMode
{
    /// Continue the process
    Run,
    /// Stay stopped and abandon the active step
    #[default]
    Break,
    /// Stay stopped but keep the active step
    Wait,
}

/// Answer to [`EventCallback::on_call_probe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProbeRunMode
{
    /// Not interesting; run to the instruction after the call
    Run,
    /// Stop here, inside the callee
    #[default]
    Break,
    /// Stay stopped with the step still pending
    Wait,
}

/// Which notification an error was raised for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind
{
    /// Process creation or attach
    ProcessStart,
    /// Process exit
    ProcessExit,
    /// Thread creation
    ThreadStart,
    /// Thread exit
    ThreadExit,
    /// Image mapped
    ModuleLoad,
    /// Image unmapped
    ModuleUnload,
    /// Debug string
    OutputString,
    /// Exception, breakpoint or step
    Exception,
    /// Async break
    AsyncBreak,
}

/// Decides whether a step entering a function should stop there
///
/// Consulted by the step-in stepper when a call lands in a new function.
/// Implemented for closures taking the thread, the callee address and the
/// thunk range (if the call went through a jump thunk).
pub trait CallProbe
{
    /// Whether to stop in the function at `address`.
    fn probe(&mut self, thread: ThreadId, address: Address, thunk: Option<AddressRange>) -> ProbeRunMode;
}

impl<F> CallProbe for F
where
    F: FnMut(ThreadId, Address, Option<AddressRange>) -> ProbeRunMode,
{
    fn probe(&mut self, thread: ThreadId, address: Address, thunk: Option<AddressRange>) -> ProbeRunMode
    {
        self(thread, address, thunk)
    }
}

/// Receiver of debugger notifications
///
/// Every method has a default so clients only implement what they need.
/// The defaults for the questions stop the process.
pub trait EventCallback
{
    /// A process was created or attached.
    fn on_process_start(&mut self, _pid: ProcessId) {}

    /// A process exited.
    fn on_process_exit(&mut self, _pid: ProcessId, _code: i32) {}

    /// A thread started.
    fn on_thread_start(&mut self, _pid: ProcessId, _thread: ThreadId) {}

    /// A thread exited.
    fn on_thread_exit(&mut self, _pid: ProcessId, _thread: ThreadId, _code: i32) {}

    /// An image was mapped.
    fn on_module_load(&mut self, _pid: ProcessId, _module: &Module) {}

    /// An image was unmapped.
    fn on_module_unload(&mut self, _pid: ProcessId, _base: Address) {}

    /// The debuggee sent a debug string.
    fn on_output_string(&mut self, _pid: ProcessId, _text: &str) {}

    /// The loader breakpoint was reached; the process is stopped and ready for breakpoints.
    fn on_load_complete(&mut self, _pid: ProcessId, _thread: ThreadId) {}

    /// An exception nobody on the debugger side handled
    ///
    /// Returning [`RunMode::Run`] passes it to the debuggee.
    fn on_exception(
        &mut self,
        _pid: ProcessId,
        _thread: ThreadId,
        _first_chance: bool,
        _record: &ExceptionRecord,
    ) -> RunMode
    {
        RunMode::Break
    }

    /// A user breakpoint, or an `INT3` compiled into the debuggee (`embedded`).
    fn on_breakpoint(&mut self, _pid: ProcessId, _thread: ThreadId, _address: Address, _embedded: bool) -> RunMode
    {
        RunMode::Break
    }

    /// A step finished; the process is stopped.
    fn on_step_complete(&mut self, _pid: ProcessId, _thread: ThreadId) {}

    /// An async break took effect; the process is stopped.
    fn on_async_break_complete(&mut self, _pid: ProcessId, _thread: ThreadId) {}

    /// A step-in entered the function at `address`. See [`CallProbe`].
    fn on_call_probe(
        &mut self,
        _pid: ProcessId,
        _thread: ThreadId,
        _address: Address,
        _thunk: Option<AddressRange>,
    ) -> ProbeRunMode
    {
        ProbeRunMode::Break
    }

    /// Handling an event failed. The process is left stopped.
    fn on_error(&mut self, _pid: ProcessId, _error: &DebuggerError, _kind: EventKind) {}
}

/// A notification, as delivered by [`ChannelCallback`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebuggerEvent
{
    /// See [`EventCallback::on_process_start`]
    ProcessStarted
    {
        /// The process
        pid: ProcessId,
    },
    /// See [`EventCallback::on_process_exit`]
    ProcessExited
    {
        /// The process
        pid: ProcessId,
        /// Exit status
        code: i32,
    },
    /// See [`EventCallback::on_thread_start`]
    ThreadStarted
    {
        /// Owning process
        pid: ProcessId,
        /// The thread
        thread: ThreadId,
    },
    /// See [`EventCallback::on_thread_exit`]
    ThreadExited
    {
        /// Owning process
        pid: ProcessId,
        /// The thread
        thread: ThreadId,
        /// Exit status
        code: i32,
    },
    /// See [`EventCallback::on_module_load`]
    ModuleLoaded
    {
        /// Owning process
        pid: ProcessId,
        /// The image
        module: Module,
    },
    /// See [`EventCallback::on_module_unload`]
    ModuleUnloaded
    {
        /// Owning process
        pid: ProcessId,
        /// Load address
        base: Address,
    },
    /// See [`EventCallback::on_output_string`]
    Output
    {
        /// Owning process
        pid: ProcessId,
        /// The text
        text: String,
    },
    /// See [`EventCallback::on_load_complete`]
    LoadComplete
    {
        /// The process
        pid: ProcessId,
        /// Thread that reached the loader breakpoint
        thread: ThreadId,
    },
    /// See [`EventCallback::on_exception`]
    Exception
    {
        /// Owning process
        pid: ProcessId,
        /// Faulting thread
        thread: ThreadId,
        /// First or second chance
        first_chance: bool,
        /// What happened
        record: ExceptionRecord,
    },
    /// See [`EventCallback::on_breakpoint`]
    Breakpoint
    {
        /// Owning process
        pid: ProcessId,
        /// Thread that hit it
        thread: ThreadId,
        /// Trap address
        address: Address,
        /// Whether the debuggee planted the trap itself
        embedded: bool,
    },
    /// See [`EventCallback::on_step_complete`]
    StepComplete
    {
        /// Owning process
        pid: ProcessId,
        /// Stepped thread
        thread: ThreadId,
    },
    /// See [`EventCallback::on_async_break_complete`]
    AsyncBreakComplete
    {
        /// The process
        pid: ProcessId,
        /// Thread reported as stopped
        thread: ThreadId,
    },
    /// See [`EventCallback::on_call_probe`]
    CallProbe
    {
        /// Owning process
        pid: ProcessId,
        /// Stepping thread
        thread: ThreadId,
        /// Callee address
        address: Address,
        /// Jump thunk the call went through
        thunk: Option<AddressRange>,
    },
    /// See [`EventCallback::on_error`]
    Error
    {
        /// Owning process
        pid: ProcessId,
        /// Rendered error
        message: String,
        /// Event being handled
        kind: EventKind,
    },
}

impl DebuggerEvent
{
    /// The process the event is about.
    #[must_use]
    pub fn pid(&self) -> ProcessId
    {
        match self {
            Self::ProcessStarted { pid }
            | Self::ProcessExited { pid, .. }
            | Self::ThreadStarted { pid, .. }
            | Self::ThreadExited { pid, .. }
            | Self::ModuleLoaded { pid, .. }
            | Self::ModuleUnloaded { pid, .. }
            | Self::Output { pid, .. }
            | Self::LoadComplete { pid, .. }
            | Self::Exception { pid, .. }
            | Self::Breakpoint { pid, .. }
            | Self::StepComplete { pid, .. }
            | Self::AsyncBreakComplete { pid, .. }
            | Self::CallProbe { pid, .. }
            | Self::Error { pid, .. } => *pid,
        }
    }

    /// Whether the process is left stopped after this notification
    /// (unless the callback's answer continued it).
    #[must_use]
    pub fn is_stop(&self) -> bool
    {
        matches!(
            self,
            Self::LoadComplete { .. }
                | Self::Exception { .. }
                | Self::Breakpoint { .. }
                | Self::StepComplete { .. }
                | Self::AsyncBreakComplete { .. }
                | Self::Error { .. }
        )
    }

    /// Human-readable description of the event.
    #[must_use]
    pub fn describe(&self) -> String
    {
        match self {
            Self::ProcessStarted { pid } => format!("Process {pid} started"),
            Self::ProcessExited { pid, code } => format!("Process {pid} exited with code: {code}"),
            Self::ThreadStarted { thread, .. } => format!("Thread {thread} started"),
            Self::ThreadExited { thread, code, .. } => format!("Thread {thread} exited with code: {code}"),
            Self::ModuleLoaded { module, .. } => {
                format!("Loaded {} at {}", module.path.display(), module.base)
            }
            Self::ModuleUnloaded { base, .. } => format!("Unloaded module at {base}"),
            Self::Output { text, .. } => format!("Output: {}", text.trim_end()),
            Self::LoadComplete { thread, .. } => format!("Load complete (thread {thread})"),
            Self::Exception {
                thread,
                first_chance,
                record,
                ..
            } => {
                let chance = if *first_chance { "first" } else { "second" };
                format!(
                    "Exception: {} at {} ({chance} chance, thread {thread})",
                    record.code, record.address
                )
            }
            Self::Breakpoint {
                thread,
                address,
                embedded,
                ..
            } => {
                if *embedded {
                    format!("Hit embedded breakpoint at {address} (thread {thread})")
                } else {
                    format!("Hit breakpoint at {address} (thread {thread})")
                }
            }
            Self::StepComplete { thread, .. } => format!("Step complete (thread {thread})"),
            Self::AsyncBreakComplete { thread, .. } => format!("Break complete (thread {thread})"),
            Self::CallProbe { address, .. } => format!("Entered function at {address}"),
            Self::Error { message, kind, .. } => format!("Error handling {kind:?} event: {message}"),
        }
    }
}

/// Sender side of the debugger event channel.
pub type DebuggerEventSender = mpsc::Sender<DebuggerEvent>;
/// Receiver side of the debugger event channel.
pub type DebuggerEventReceiver = mpsc::Receiver<DebuggerEvent>;

/// Create a new debugger event channel.
#[must_use]
pub fn event_channel() -> (DebuggerEventSender, DebuggerEventReceiver)
{
    mpsc::channel()
}

/// [`EventCallback`] that forwards every notification over a channel
///
/// Questions are answered from the policies set with the builder methods;
/// by default everything stops. A disconnected receiver is ignored.
///
/// ## Example
///
/// ```rust
/// use trapdoor_core::events::{ChannelCallback, ProbeRunMode, RunMode};
///
/// let (callback, events) = ChannelCallback::new();
/// let callback = callback.with_exception_mode(RunMode::Run).with_probe_mode(ProbeRunMode::Run);
/// # drop((callback, events));
/// ```
#[derive(Debug)]
pub struct ChannelCallback
{
    sender: DebuggerEventSender,
    breakpoint_mode: RunMode,
    exception_mode: RunMode,
    probe_mode: ProbeRunMode,
}

impl ChannelCallback
{
    /// Create a callback and the receiver for its events.
    #[must_use]
    pub fn new() -> (Self, DebuggerEventReceiver)
    {
        let (sender, receiver) = event_channel();
        (Self::with_sender(sender), receiver)
    }

    /// Create a callback sending into an existing channel.
    #[must_use]
    pub fn with_sender(sender: DebuggerEventSender) -> Self
    {
        Self {
            sender,
            breakpoint_mode: RunMode::Break,
            exception_mode: RunMode::Break,
            probe_mode: ProbeRunMode::Break,
        }
    }

    /// Answer for breakpoints.
    #[must_use]
    pub fn with_breakpoint_mode(mut self, mode: RunMode) -> Self
    {
        self.breakpoint_mode = mode;
        self
    }

    /// Answer for unhandled exceptions.
    #[must_use]
    pub fn with_exception_mode(mut self, mode: RunMode) -> Self
    {
        self.exception_mode = mode;
        self
    }

    /// Answer for call probes.
    #[must_use]
    pub fn with_probe_mode(mut self, mode: ProbeRunMode) -> Self
    {
        self.probe_mode = mode;
        self
    }

    fn send(&self, event: DebuggerEvent)
    {
        if self.sender.send(event).is_err() {
            tracing::trace!("Event receiver dropped");
        }
    }
}

impl EventCallback for ChannelCallback
{
    fn on_process_start(&mut self, pid: ProcessId)
    {
        self.send(DebuggerEvent::ProcessStarted { pid });
    }

    fn on_process_exit(&mut self, pid: ProcessId, code: i32)
    {
        self.send(DebuggerEvent::ProcessExited { pid, code });
    }

    fn on_thread_start(&mut self, pid: ProcessId, thread: ThreadId)
    {
        self.send(DebuggerEvent::ThreadStarted { pid, thread });
    }

    fn on_thread_exit(&mut self, pid: ProcessId, thread: ThreadId, code: i32)
    {
        self.send(DebuggerEvent::ThreadExited { pid, thread, code });
    }

    fn on_module_load(&mut self, pid: ProcessId, module: &Module)
    {
        self.send(DebuggerEvent::ModuleLoaded {
            pid,
            module: module.clone(),
        });
    }

    fn on_module_unload(&mut self, pid: ProcessId, base: Address)
    {
        self.send(DebuggerEvent::ModuleUnloaded { pid, base });
    }

    fn on_output_string(&mut self, pid: ProcessId, text: &str)
    {
        self.send(DebuggerEvent::Output {
            pid,
            text: text.to_string(),
        });
    }

    fn on_load_complete(&mut self, pid: ProcessId, thread: ThreadId)
    {
        self.send(DebuggerEvent::LoadComplete { pid, thread });
    }

    fn on_exception(&mut self, pid: ProcessId, thread: ThreadId, first_chance: bool, record: &ExceptionRecord)
    -> RunMode
    {
        self.send(DebuggerEvent::Exception {
            pid,
            thread,
            first_chance,
            record: *record,
        });
        self.exception_mode
    }

    fn on_breakpoint(&mut self, pid: ProcessId, thread: ThreadId, address: Address, embedded: bool) -> RunMode
    {
        self.send(DebuggerEvent::Breakpoint {
            pid,
            thread,
            address,
            embedded,
        });
        self.breakpoint_mode
    }

    fn on_step_complete(&mut self, pid: ProcessId, thread: ThreadId)
    {
        self.send(DebuggerEvent::StepComplete { pid, thread });
    }

    fn on_async_break_complete(&mut self, pid: ProcessId, thread: ThreadId)
    {
        self.send(DebuggerEvent::AsyncBreakComplete { pid, thread });
    }

    fn on_call_probe(
        &mut self,
        pid: ProcessId,
        thread: ThreadId,
        address: Address,
        thunk: Option<AddressRange>,
    ) -> ProbeRunMode
    {
        self.send(DebuggerEvent::CallProbe {
            pid,
            thread,
            address,
            thunk,
        });
        self.probe_mode
    }

    fn on_error(&mut self, pid: ProcessId, error: &DebuggerError, kind: EventKind)
    {
        self.send(DebuggerEvent::Error {
            pid,
            message: error.to_string(),
            kind,
        });
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_channel_callback_forwards_and_answers()
    {
        let (mut callback, events) = ChannelCallback::new();
        let pid = ProcessId(7);
        let thread = ThreadId(8);

        let mode = callback.on_breakpoint(pid, thread, Address::new(0x1000), false);
        assert_eq!(mode, RunMode::Break);

        let mut callback = callback.with_breakpoint_mode(RunMode::Run);
        assert_eq!(callback.on_breakpoint(pid, thread, Address::new(0x1000), true), RunMode::Run);

        let first = events.recv().unwrap();
        assert!(first.is_stop());
        assert_eq!(first.pid(), pid);
        assert!(matches!(events.recv().unwrap(), DebuggerEvent::Breakpoint { embedded: true, .. }));
    }

    #[test]
    fn test_closure_is_a_call_probe()
    {
        let mut calls = 0;
        let mut probe = |_: ThreadId, _: Address, _: Option<AddressRange>| {
            calls += 1;
            ProbeRunMode::Run
        };
        assert_eq!(probe.probe(ThreadId(1), Address::new(0x10), None), ProbeRunMode::Run);
        drop(probe);
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_describe()
    {
        let event = DebuggerEvent::ProcessExited {
            pid: ProcessId(42),
            code: 3,
        };
        assert_eq!(event.describe(), "Process 42 exited with code: 3");
    }
}
