//! # Process Model
//!
//! What the session knows about each debuggee: identity, threads, loaded
//! images and where it is in its lifecycle. Breakpoint and stepping state
//! lives in the process's [`MachineCore`].
//!
//! ## Lifecycle flags
//!
//! | flag | set when |
//! |------|----------|
//! | `started` | the creation event was reported to the client |
//! | `reached_loader_bp` | the initial loader breakpoint was seen |
//! | `stopped` | the last debug event has not been continued yet |
//! | `terminating` | terminate or detach was requested |
//! | `deleted` | the process exited or was detached |

mod suspend;

use std::collections::BTreeMap;
use std::path::PathBuf;

use tracing::debug;

pub use suspend::{ProcessSuspension, ThreadSuspension};

use crate::error::{DebuggerError, Result};
use crate::events::EventKind;
use crate::machine::MachineCore;
use crate::target::{ExceptionRecord, Module};
use crate::types::{Address, CpuMode, CreateMethod, ProcessId, ThreadId};

/// A thread of a debuggee
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thread
{
    /// Thread id
    pub id: ThreadId,
    /// Owning process
    pub process: ProcessId,
    /// Where the thread started, if the backend reports it
    pub start_address: Option<Address>,
}

/// One debuggee
#[derive(Debug)]
pub struct Process
{
    id: ProcessId,
    create_method: CreateMethod,
    exe_path: Option<PathBuf>,
    entry_point: Option<Address>,
    cpu_mode: CpuMode,
    suspension: ProcessSuspension,
    modules: BTreeMap<Address, Module>,
    threads: BTreeMap<ThreadId, Thread>,
    terminating: bool,
    deleted: bool,
    stopped: bool,
    started: bool,
    reached_loader_bp: bool,
    last_event: Option<(EventKind, ThreadId)>,
    last_exception: Option<ExceptionRecord>,
    machine: MachineCore,
}

impl Process
{
    /// Wrap a freshly launched or attached process.
    #[must_use]
    pub fn new(id: ProcessId, create_method: CreateMethod, exe_path: Option<PathBuf>, machine: MachineCore) -> Self
    {
        Self {
            id,
            create_method,
            exe_path,
            entry_point: None,
            cpu_mode: machine.cpu_mode(),
            suspension: ProcessSuspension::default(),
            modules: BTreeMap::new(),
            threads: BTreeMap::new(),
            terminating: false,
            deleted: false,
            stopped: false,
            started: false,
            reached_loader_bp: false,
            last_event: None,
            last_exception: None,
            machine,
        }
    }

    /// Process id.
    #[must_use]
    pub fn id(&self) -> ProcessId
    {
        self.id
    }

    /// Launched or attached.
    #[must_use]
    pub fn create_method(&self) -> CreateMethod
    {
        self.create_method
    }

    /// Path of the main executable.
    #[must_use]
    pub fn exe_path(&self) -> Option<&PathBuf>
    {
        self.exe_path.as_ref()
    }

    /// Base of the main executable image, once it is known.
    #[must_use]
    pub fn entry_point(&self) -> Option<Address>
    {
        self.entry_point
    }

    /// Instruction width of the debuggee.
    #[must_use]
    pub fn cpu_mode(&self) -> CpuMode
    {
        self.cpu_mode
    }

    /// Whole-process suspend count.
    #[must_use]
    pub fn suspend_count(&self) -> u32
    {
        self.suspension.count()
    }

    /// Whether terminate or detach was requested.
    #[must_use]
    pub fn is_terminating(&self) -> bool
    {
        self.terminating
    }

    /// Whether the process is gone.
    #[must_use]
    pub fn is_deleted(&self) -> bool
    {
        self.deleted
    }

    /// Whether the process waits for a command to continue.
    #[must_use]
    pub fn is_stopped(&self) -> bool
    {
        self.stopped
    }

    /// Whether the client was told the process started.
    #[must_use]
    pub fn is_started(&self) -> bool
    {
        self.started
    }

    /// Whether the loader breakpoint was seen.
    #[must_use]
    pub fn reached_loader_bp(&self) -> bool
    {
        self.reached_loader_bp
    }

    /// The event the process last stopped on.
    #[must_use]
    pub fn last_event(&self) -> Option<(EventKind, ThreadId)>
    {
        self.last_event
    }

    /// The exception the process is stopped on, if it stopped on one.
    #[must_use]
    pub fn last_exception(&self) -> Option<&ExceptionRecord>
    {
        self.last_exception.as_ref()
    }

    /// Breakpoint and stepping engine of the process.
    #[must_use]
    pub fn machine(&self) -> &MachineCore
    {
        &self.machine
    }

    /// Mutable access to the breakpoint and stepping engine.
    pub fn machine_mut(&mut self) -> &mut MachineCore
    {
        &mut self.machine
    }

    pub(crate) fn set_terminating(&mut self)
    {
        self.terminating = true;
    }

    pub(crate) fn set_deleted(&mut self)
    {
        self.deleted = true;
        self.stopped = false;
    }

    pub(crate) fn set_started(&mut self)
    {
        self.started = true;
    }

    pub(crate) fn set_reached_loader_bp(&mut self)
    {
        self.reached_loader_bp = true;
    }

    pub(crate) fn set_stopped(&mut self, stopped: bool)
    {
        self.stopped = stopped;
    }

    pub(crate) fn set_last_event(&mut self, kind: EventKind, thread: ThreadId, exception: Option<ExceptionRecord>)
    {
        self.last_event = Some((kind, thread));
        self.last_exception = exception;
    }

    /// Fail unless commands may still be issued.
    ///
    /// ## Errors
    ///
    /// [`DebuggerError::ProcessEnded`] once terminating or deleted.
    pub fn check_alive(&self) -> Result<()>
    {
        if self.deleted || self.terminating {
            return Err(DebuggerError::ProcessEnded(self.id.0));
        }
        Ok(())
    }

    /// Fail unless the process is alive and stopped.
    ///
    /// ## Errors
    ///
    /// [`DebuggerError::ProcessEnded`] or [`DebuggerError::WrongState`].
    pub fn check_stopped(&self) -> Result<()>
    {
        self.check_alive()?;
        if !self.stopped {
            return Err(DebuggerError::WrongState(format!("process {} is running", self.id)));
        }
        Ok(())
    }

    // ---- threads ------------------------------------------------------------

    /// Record a new thread.
    pub fn add_thread(&mut self, id: ThreadId, start_address: Option<Address>)
    {
        debug!(pid = self.id.0, thread = id.raw(), "Thread added");
        self.threads.insert(
            id,
            Thread {
                id,
                process: self.id,
                start_address,
            },
        );
    }

    /// Forget a thread; returns it if it was known.
    pub fn delete_thread(&mut self, id: ThreadId) -> Option<Thread>
    {
        self.threads.remove(&id)
    }

    /// Look up a thread.
    #[must_use]
    pub fn find_thread(&self, id: ThreadId) -> Option<&Thread>
    {
        self.threads.get(&id)
    }

    /// All known threads, ordered by id.
    pub fn threads(&self) -> impl Iterator<Item = &Thread>
    {
        self.threads.values()
    }

    /// Number of known threads.
    #[must_use]
    pub fn thread_count(&self) -> usize
    {
        self.threads.len()
    }

    // ---- modules ------------------------------------------------------------

    /// Record a loaded image. The first one is the main executable.
    pub fn add_module(&mut self, module: Module)
    {
        if self.entry_point.is_none() {
            self.entry_point = Some(module.base);
            if self.exe_path.is_none() {
                self.exe_path = Some(module.path.clone());
            }
        }
        self.modules.insert(module.base, module);
    }

    /// Forget the image loaded at `base`.
    pub fn remove_module(&mut self, base: Address) -> Option<Module>
    {
        self.modules.remove(&base)
    }

    /// The image containing `address`.
    #[must_use]
    pub fn find_module(&self, address: Address) -> Option<&Module>
    {
        self.modules
            .range(..=address)
            .next_back()
            .map(|(_, module)| module)
            .filter(|module| module.contains(address))
    }

    /// All loaded images, ordered by base.
    pub fn modules(&self) -> impl Iterator<Item = &Module>
    {
        self.modules.values()
    }

    // ---- whole-process suspension -------------------------------------------

    /// Suspend every thread (ref-counted).
    pub fn suspend(&mut self) -> Result<()>
    {
        let threads: Vec<ThreadId> = self.threads.keys().copied().collect();
        self.suspension.suspend(self.machine.target_mut(), threads)
    }

    /// Release one [`Process::suspend`].
    pub fn resume(&mut self) -> Result<()>
    {
        let threads: Vec<ThreadId> = self.threads.keys().copied().collect();
        self.suspension.resume(self.machine.target_mut(), threads)
    }

    /// Hold a new thread if the process is currently suspended.
    pub fn apply_suspend_to_thread(&mut self, thread: ThreadId) -> Result<()>
    {
        self.suspension.apply_to_new_thread(self.machine.target_mut(), thread)
    }
}
