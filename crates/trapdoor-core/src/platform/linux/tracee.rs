//! # Tracee Bookkeeping
//!
//! Per-process `ptrace` state shared between [`LinuxBackend`](super::LinuxBackend)
//! and [`LinuxTarget`](super::LinuxTarget).
//!
//! The backend runs the process all-stop: when one task reports something,
//! every other task is pulled into ptrace-stop with a thread-directed
//! `SIGSTOP` before the event is handed out. Stops collected while doing
//! that become queued events, reported one at a time before anything runs
//! again.
//!
//! ## Task flags
//!
//! | flag | meaning |
//! |------|---------|
//! | `stopped` | the task sits in ptrace-stop |
//! | `held` | suspend count; a held task is left stopped on continue |
//! | `stop_requested` | we sent a `SIGSTOP` that has not arrived yet |
//! | `single_step` | resume with `PTRACE_SINGLESTEP` (the trace flag) |
//! | `pending_signal` | signal to deliver on the next resume |

use std::collections::{BTreeMap, VecDeque};
use std::fs::File;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, trace, warn};

use crate::error::{DebuggerError, Result};
use crate::target::{DebugEvent, ExceptionCode, ExceptionRecord};
use crate::types::{Address, CpuMode, ProcessId, ThreadId};

/// `si_code` of an `int3` trap reported by `TRAP_BRKPT`
const TRAP_BRKPT: i32 = 0x1;
/// `si_code` of a trace trap
const TRAP_TRACE: i32 = 0x2;
/// `si_code` of an `int3` trap on x86
const SI_KERNEL: i32 = 0x80;

/// Tracee state behind a lock, one per debugged process
pub(super) type SharedTracee = Arc<Mutex<Tracee>>;

/// Lock a tracee, ignoring poisoning.
pub(super) fn lock(shared: &SharedTracee) -> MutexGuard<'_, Tracee>
{
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(super) fn thread_id(tid: Pid) -> ThreadId
{
    ThreadId(u64::from(tid.as_raw().unsigned_abs()))
}

pub(super) fn task_pid(thread: ThreadId) -> Result<Pid>
{
    i32::try_from(thread.raw())
        .map(Pid::from_raw)
        .map_err(|_| DebuggerError::InvalidArgument(format!("thread id {thread} out of range")))
}

/// Send a signal to one thread of a thread group.
#[allow(clippy::cast_lossless)]
pub(super) fn tgkill(pid: Pid, tid: Pid, signal: Signal) -> Result<()>
{
    // SAFETY: tgkill takes plain integers and touches no memory of ours
    let rc = unsafe { libc::syscall(libc::SYS_tgkill, pid.as_raw(), tid.as_raw(), signal as libc::c_int) };
    Errno::result(rc).map(drop).map_err(DebuggerError::from)
}

/// What a ptrace-stop turned out to be
enum Stop
{
    /// Something to tell the client about
    Event(DebugEvent),
    /// One of our own `SIGSTOP`s, or an event we do not report
    Quiet,
}

#[derive(Debug, Default)]
pub(super) struct Task
{
    pub(super) stopped: bool,
    pub(super) held: u32,
    pub(super) stop_requested: bool,
    pub(super) single_step: bool,
    pub(super) pending_signal: Option<Signal>,
}

#[derive(Debug)]
pub(super) struct Tracee
{
    pid: Pid,
    cpu_mode: CpuMode,
    mem: File,
    tasks: BTreeMap<Pid, Task>,
    queue: VecDeque<DebugEvent>,
    /// An event was handed out and the process has not been continued since
    reported: bool,
    break_requested: bool,
    /// Events are held back until the launch is resumed
    launch_hold: bool,
    /// Inside [`Tracee::stop_task`]; quiet stops stay stopped
    stopping: bool,
    exited: bool,
}

impl Tracee
{
    pub(super) fn new(pid: Pid, cpu_mode: CpuMode, mem: File) -> Self
    {
        Self {
            pid,
            cpu_mode,
            mem,
            tasks: BTreeMap::new(),
            queue: VecDeque::new(),
            reported: false,
            break_requested: false,
            launch_hold: false,
            stopping: false,
            exited: false,
        }
    }

    pub(super) fn pid(&self) -> Pid
    {
        self.pid
    }

    pub(super) fn process_id(&self) -> ProcessId
    {
        ProcessId(self.pid.as_raw().unsigned_abs())
    }

    pub(super) fn cpu_mode(&self) -> CpuMode
    {
        self.cpu_mode
    }

    pub(super) fn mem(&self) -> &File
    {
        &self.mem
    }

    pub(super) fn has_exited(&self) -> bool
    {
        self.exited
    }

    pub(super) fn set_launch_hold(&mut self, hold: bool)
    {
        self.launch_hold = hold;
    }

    pub(super) fn add_task(&mut self, tid: Pid, task: Task)
    {
        self.tasks.insert(tid, task);
    }

    pub(super) fn owns(&self, tid: Pid) -> bool
    {
        self.tasks.contains_key(&tid)
    }

    pub(super) fn task_ids(&self) -> Vec<Pid>
    {
        self.tasks.keys().copied().collect()
    }

    pub(super) fn push_event(&mut self, event: DebugEvent)
    {
        self.queue.push_back(event);
    }

    /// Take the next queued event, unless the launch is still held.
    pub(super) fn pop_event(&mut self) -> Option<DebugEvent>
    {
        if self.launch_hold {
            return None;
        }
        self.queue.pop_front()
    }

    pub(super) fn clear_events(&mut self)
    {
        self.queue.clear();
    }

    /// A task that must be stopped for register access.
    pub(super) fn stopped_task(&mut self, thread: ThreadId) -> Result<(Pid, &mut Task)>
    {
        let tid = task_pid(thread)?;
        let task = self
            .tasks
            .get_mut(&tid)
            .ok_or_else(|| DebuggerError::NotFound(format!("thread {thread}")))?;
        if !task.stopped {
            return Err(DebuggerError::WrongState(format!("thread {thread} is running")));
        }
        Ok((tid, task))
    }

    // ---- stopping -----------------------------------------------------------

    /// Mark the process as having reported an event on `thread`, stopping
    /// every other task first.
    pub(super) fn report(&mut self, thread: Option<ThreadId>) -> Result<()>
    {
        let except = thread.map(task_pid).transpose()?;
        self.stop_all(except)?;
        self.reported = true;
        Ok(())
    }

    /// Bring every running task except `except` into ptrace-stop.
    pub(super) fn stop_all(&mut self, except: Option<Pid>) -> Result<()>
    {
        while let Some(tid) = self
            .tasks
            .iter()
            .find(|(tid, task)| Some(**tid) != except && !task.stopped)
            .map(|(tid, _)| *tid)
        {
            self.stop_task(tid)?;
        }
        Ok(())
    }

    /// Stop one running task and wait until it is in ptrace-stop.
    pub(super) fn stop_task(&mut self, tid: Pid) -> Result<()>
    {
        let pid = self.pid;
        let Some(task) = self.tasks.get_mut(&tid) else {
            return Ok(());
        };
        if task.stopped {
            return Ok(());
        }
        if !task.stop_requested {
            match tgkill(pid, tid, Signal::SIGSTOP) {
                Ok(()) => task.stop_requested = true,
                Err(DebuggerError::Nix(Errno::ESRCH)) => {
                    // exiting; its exit status is still collected below
                    warn!(tid = tid.as_raw(), "Task vanished before it could be stopped");
                }
                Err(error) => return Err(error),
            }
        }

        self.stopping = true;
        let outcome = self.wait_stopped(tid);
        self.stopping = false;
        outcome
    }

    fn wait_stopped(&mut self, tid: Pid) -> Result<()>
    {
        loop {
            let status = waitpid(tid, Some(WaitPidFlag::__WALL))?;
            trace!(?status, "Status while stopping task");
            if let Some(event) = self.on_status(status)? {
                self.queue.push_back(event);
            }
            match self.tasks.get(&tid) {
                Some(task) if !task.stopped => continue,
                _ => return Ok(()),
            }
        }
    }

    // ---- status translation -------------------------------------------------

    /// Apply a `waitpid` status of one of our tasks
    ///
    /// Returns the event to report, if any. Quiet stops of a running
    /// process are resumed right away.
    pub(super) fn on_status(&mut self, status: WaitStatus) -> Result<Option<DebugEvent>>
    {
        let pid = self.process_id();
        match status {
            WaitStatus::Exited(tid, code) => Ok(Some(self.on_exit(tid, code))),
            WaitStatus::Signaled(tid, signal, _) => Ok(Some(self.on_exit(tid, 128 + signal as i32))),
            WaitStatus::PtraceEvent(tid, _, libc::PTRACE_EVENT_CLONE) => {
                self.mark_stopped(tid);
                let child = Pid::from_raw(i32::try_from(ptrace::getevent(tid)?).unwrap_or_default());
                if !self.tasks.contains_key(&child) {
                    // a new clone starts with a SIGSTOP of its own
                    self.tasks.insert(
                        child,
                        Task {
                            stop_requested: true,
                            ..Task::default()
                        },
                    );
                }
                debug!(parent = tid.as_raw(), child = child.as_raw(), "Thread cloned");
                Ok(Some(DebugEvent::ThreadCreated {
                    pid,
                    thread: thread_id(child),
                }))
            }
            WaitStatus::PtraceEvent(tid, _, code) => {
                debug!(tid = tid.as_raw(), code, "Ignoring ptrace event");
                self.mark_stopped(tid);
                self.resume_quiet(tid)?;
                Ok(None)
            }
            WaitStatus::Stopped(tid, signal) => {
                self.mark_stopped(tid);
                match self.classify_stop(tid, signal)? {
                    Stop::Event(event) => Ok(Some(event)),
                    Stop::Quiet => {
                        self.resume_quiet(tid)?;
                        Ok(None)
                    }
                }
            }
            WaitStatus::PtraceSyscall(_) | WaitStatus::Continued(_) | WaitStatus::StillAlive => Ok(None),
        }
    }

    fn mark_stopped(&mut self, tid: Pid)
    {
        if let Some(task) = self.tasks.get_mut(&tid) {
            task.stopped = true;
        }
    }

    fn on_exit(&mut self, tid: Pid, code: i32) -> DebugEvent
    {
        let pid = self.process_id();
        if tid == self.pid {
            self.exited = true;
            self.tasks.clear();
            self.queue.clear();
            DebugEvent::ProcessExited { pid, code }
        } else {
            self.tasks.remove(&tid);
            DebugEvent::ThreadExited {
                pid,
                thread: thread_id(tid),
                code,
            }
        }
    }

    fn classify_stop(&mut self, tid: Pid, signal: Signal) -> Result<Stop>
    {
        let pid = self.process_id();
        let thread = thread_id(tid);
        let break_requested = self.break_requested;
        let Some(task) = self.tasks.get_mut(&tid) else {
            return Ok(Stop::Quiet);
        };

        let exception = |code, address| {
            Stop::Event(DebugEvent::Exception {
                pid,
                thread,
                record: ExceptionRecord::new(code, address),
            })
        };

        match signal {
            Signal::SIGTRAP => {
                let info = ptrace::getsiginfo(tid)?;
                let rip = Address::new(ptrace::getregs(tid)?.rip);
                match info.si_code {
                    TRAP_TRACE => {
                        task.single_step = false;
                        Ok(exception(ExceptionCode::SingleStep, rip))
                    }
                    SI_KERNEL | TRAP_BRKPT => {
                        task.single_step = false;
                        Ok(exception(ExceptionCode::Breakpoint, rip.checked_sub(1).unwrap_or(rip)))
                    }
                    _ => {
                        task.pending_signal = Some(signal);
                        Ok(exception(ExceptionCode::Signal(signal as i32), rip))
                    }
                }
            }
            Signal::SIGSTOP if break_requested && tid == self.pid => {
                self.break_requested = false;
                task.stop_requested = false;
                Ok(Stop::Event(DebugEvent::AsyncBreak { pid, thread }))
            }
            Signal::SIGSTOP if task.stop_requested => {
                task.stop_requested = false;
                Ok(Stop::Quiet)
            }
            Signal::SIGSEGV | Signal::SIGBUS => {
                task.pending_signal = Some(signal);
                let rip = Address::new(ptrace::getregs(tid)?.rip);
                Ok(exception(ExceptionCode::AccessViolation, rip))
            }
            other => {
                task.pending_signal = Some(other);
                let rip = Address::new(ptrace::getregs(tid)?.rip);
                Ok(exception(ExceptionCode::Signal(other as i32), rip))
            }
        }
    }

    // ---- resuming -----------------------------------------------------------

    fn resume_quiet(&mut self, tid: Pid) -> Result<()>
    {
        if self.reported || self.launch_hold || self.stopping {
            return Ok(());
        }
        self.restart(tid)
    }

    /// Restart one stopped, unheld task.
    fn restart(&mut self, tid: Pid) -> Result<()>
    {
        let Some(task) = self.tasks.get_mut(&tid) else {
            return Ok(());
        };
        if !task.stopped || task.held > 0 {
            return Ok(());
        }

        let signal = task.pending_signal.take();
        let resumed = if task.single_step {
            ptrace::step(tid, signal)
        } else {
            ptrace::cont(tid, signal)
        };
        match resumed {
            Ok(()) => {}
            Err(Errno::ESRCH) => warn!(tid = tid.as_raw(), "Task exited while stopped"),
            Err(error) => return Err(error.into()),
        }
        task.stopped = false;
        trace!(tid = tid.as_raw(), step = task.single_step, ?signal, "Task resumed");
        Ok(())
    }

    /// Continue after the event reported on `thread`
    ///
    /// Nothing runs while queued events remain; the next one is reported
    /// instead.
    pub(super) fn continue_all(&mut self, thread: ThreadId, handled: bool) -> Result<()>
    {
        if handled {
            if let Some(task) = self.tasks.get_mut(&task_pid(thread)?) {
                task.pending_signal = None;
            }
        }
        if !self.queue.is_empty() {
            debug!(pid = self.pid.as_raw(), queued = self.queue.len(), "Continue deferred, events queued");
            return Ok(());
        }

        self.reported = false;
        for tid in self.task_ids() {
            self.restart(tid)?;
        }
        Ok(())
    }

    // ---- suspension ---------------------------------------------------------

    pub(super) fn hold(&mut self, thread: ThreadId) -> Result<()>
    {
        let tid = task_pid(thread)?;
        let task = self
            .tasks
            .get_mut(&tid)
            .ok_or_else(|| DebuggerError::NotFound(format!("thread {thread}")))?;
        task.held += 1;
        if !task.stopped {
            self.stop_task(tid)?;
        }
        Ok(())
    }

    pub(super) fn release(&mut self, thread: ThreadId) -> Result<()>
    {
        let tid = task_pid(thread)?;
        let task = self
            .tasks
            .get_mut(&tid)
            .ok_or_else(|| DebuggerError::NotFound(format!("thread {thread}")))?;
        task.held = task.held.saturating_sub(1);
        if task.held == 0 && !self.reported && self.queue.is_empty() {
            self.restart(tid)?;
        }
        Ok(())
    }

    pub(super) fn request_break(&mut self) -> Result<()>
    {
        self.break_requested = true;
        tgkill(self.pid, self.pid, Signal::SIGSTOP)
    }

    /// Stop everything and let go of every task.
    pub(super) fn detach_all(&mut self) -> Result<()>
    {
        self.stop_all(None)?;
        self.queue.clear();

        let mut stop_pending = false;
        for (tid, task) in std::mem::take(&mut self.tasks) {
            stop_pending |= task.stop_requested;
            match ptrace::detach(tid, task.pending_signal) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(error) => return Err(error.into()),
            }
        }
        if stop_pending {
            // a SIGSTOP of ours may still be queued in the kernel
            let _ = nix::sys::signal::kill(self.pid, Signal::SIGCONT);
        }
        self.exited = true;
        Ok(())
    }
}
