//! # Linux Debug Backend
//!
//! [`DebugBackend`] on top of `ptrace(2)` and `waitpid(2)`.
//!
//! ## Launch
//!
//! `fork`, then `PTRACE_TRACEME` and `execve` in the child. The child stops
//! with a `SIGTRAP` once the new image is loaded; that stop is reported as
//! [`DebugEvent::ProcessCreated`] followed by the loader breakpoint.
//!
//! ## Attach
//!
//! `PTRACE_ATTACH` on every task listed in `/proc/<pid>/task`. Reported as a
//! launch plus one [`DebugEvent::ThreadCreated`] per extra task.
//!
//! ## Event loop
//!
//! `waitpid(-1, WNOHANG | __WALL)` is polled until the timeout passes.
//! Queued events (see [`Tracee`](super::tracee::Tracee)) always go first.

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::{CStr, CString, OsString};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{chdir, execve, fork, ForkResult, Pid};
use tracing::{debug, info, warn};

use super::target::LinuxTarget;
use super::tracee::{lock, thread_id, SharedTracee, Task, Tracee};
use crate::error::{DebuggerError, Result};
use crate::target::{
    DebugBackend, DebugEvent, ExceptionCode, ExceptionRecord, LaunchInfo, Module, ProcessTarget,
};
use crate::types::{Address, CpuMode, ProcessId, ThreadId};

const POLL_INTERVAL: Duration = Duration::from_millis(1);

fn trace_options() -> ptrace::Options
{
    ptrace::Options::PTRACE_O_TRACECLONE | ptrace::Options::PTRACE_O_EXITKILL
}

fn process_pid(pid: ProcessId) -> Result<Pid>
{
    i32::try_from(pid.0)
        .map(Pid::from_raw)
        .map_err(|_| DebuggerError::InvalidArgument(format!("process id {pid} out of range")))
}

fn c_string(bytes: &[u8], what: &str) -> Result<CString>
{
    CString::new(bytes.to_vec()).map_err(|_| DebuggerError::InvalidArgument(format!("{what} contains a NUL byte")))
}

/// The debugger's environment with the launch overrides applied.
fn environment(info: &LaunchInfo) -> Result<Vec<CString>>
{
    let mut vars: BTreeMap<OsString, OsString> = std::env::vars_os().collect();
    for (key, value) in &info.env {
        vars.insert(key.into(), value.into());
    }

    vars.into_iter()
        .map(|(key, value)| {
            let mut entry = key.into_vec();
            entry.push(b'=');
            entry.extend(value.into_vec());
            c_string(&entry, "environment variable")
        })
        .collect()
}

/// Runs in the forked child; never returns.
fn exec_child(program: &CStr, argv: &[CString], envp: &[CString], working_dir: Option<&CStr>) -> !
{
    if ptrace::traceme().is_ok() && working_dir.map_or(true, |dir| chdir(dir).is_ok()) {
        let _ = execve(program, argv, envp);
    }
    // SAFETY: _exit is async-signal-safe and skips the parent's atexit handlers
    unsafe { libc::_exit(127) }
}

fn open_mem(pid: Pid) -> Result<File>
{
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(format!("/proc/{pid}/mem"))
        .map_err(|error| DebuggerError::os("open /proc/<pid>/mem", error))
}

/// Word size of the executable, from its ELF identification bytes.
fn elf_mode(pid: Pid) -> CpuMode
{
    let mut ident = [0u8; 5];
    let class = File::open(format!("/proc/{pid}/exe"))
        .and_then(|mut exe| exe.read_exact(&mut ident))
        .map(|()| ident[4]);
    match class {
        Ok(1) => CpuMode::Bits32,
        _ => CpuMode::Bits64,
    }
}

/// The main executable's mapping, from `/proc/<pid>/maps`.
fn exe_image(pid: Pid) -> Option<Module>
{
    let exe = fs::read_link(format!("/proc/{pid}/exe")).ok()?;
    let maps = fs::read_to_string(format!("/proc/{pid}/maps")).ok()?;

    let mut span: Option<(u64, u64)> = None;
    for line in maps.lines() {
        let mut fields = line.split_whitespace();
        let Some(range) = fields.next() else {
            continue;
        };
        if fields.nth(4).map(Path::new) != Some(exe.as_path()) {
            continue;
        }
        let Some((start, end)) = range.split_once('-') else {
            continue;
        };
        let (Ok(start), Ok(end)) = (u64::from_str_radix(start, 16), u64::from_str_radix(end, 16)) else {
            continue;
        };
        span = Some(span.map_or((start, end), |(low, high)| (low.min(start), high.max(end))));
    }

    let (low, high) = span?;
    Some(Module {
        base: Address::new(low),
        size: high - low,
        path: exe,
    })
}

/// Task ids of a process, thread-group leader first.
fn list_tasks(pid: Pid) -> Result<Vec<Pid>>
{
    let entries = fs::read_dir(format!("/proc/{pid}/task")).map_err(|error| match error.kind() {
        io::ErrorKind::NotFound => DebuggerError::ProcessNotFound(pid.as_raw().unsigned_abs()),
        _ => DebuggerError::Io(error),
    })?;

    let mut tasks: Vec<Pid> = entries
        .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse().ok())
        .map(Pid::from_raw)
        .collect();
    tasks.sort_by_key(|tid| (*tid != pid, tid.as_raw()));
    Ok(tasks)
}

/// Thread-group id of a task, from `/proc/<tid>/status`.
fn thread_group(tid: Pid) -> Option<Pid>
{
    let status = fs::read_to_string(format!("/proc/{tid}/status")).ok()?;
    status
        .lines()
        .find_map(|line| line.strip_prefix("Tgid:"))?
        .trim()
        .parse()
        .ok()
        .map(Pid::from_raw)
}

fn attach_error(pid: ProcessId, error: Errno) -> DebuggerError
{
    match error {
        Errno::EPERM => DebuggerError::PermissionDenied(format!(
            "ptrace attach to {pid} refused (see /proc/sys/kernel/yama/ptrace_scope)"
        )),
        Errno::ESRCH => DebuggerError::ProcessNotFound(pid.0),
        other => DebuggerError::AttachFailed(format!("ptrace attach to {pid}: {other}")),
    }
}

/// Wait for the attach stop of a freshly attached task.
fn wait_attached(tid: Pid) -> Result<Task>
{
    loop {
        match waitpid(tid, Some(WaitPidFlag::__WALL))? {
            WaitStatus::Stopped(_, Signal::SIGSTOP) => {
                return Ok(Task {
                    stopped: true,
                    ..Task::default()
                })
            }
            // stopped for something else first; the attach SIGSTOP is still due
            WaitStatus::Stopped(_, signal) => {
                return Ok(Task {
                    stopped: true,
                    stop_requested: true,
                    pending_signal: Some(signal),
                    ..Task::default()
                })
            }
            WaitStatus::Exited(..) | WaitStatus::Signaled(..) => {
                return Err(DebuggerError::AttachFailed(format!("task {tid} ended during attach")))
            }
            _ => {}
        }
    }
}

/// `ptrace`-based debug backend for Linux
///
/// ## Example
///
/// ```rust,no_run
/// use std::time::Duration;
/// use trapdoor_core::platform::linux::LinuxBackend;
/// use trapdoor_core::target::{DebugBackend, LaunchInfo};
///
/// let mut backend = LinuxBackend::new();
/// let pid = backend.launch(&LaunchInfo::new("/bin/true"))?;
/// while let Some(event) = backend.wait_for_event(Duration::from_millis(100))? {
///     println!("{event:?}");
///     if let Some(thread) = event.thread() {
///         backend.continue_event(pid, thread, true)?;
///     }
/// }
/// # Ok::<(), trapdoor_core::DebuggerError>(())
/// ```
#[derive(Debug, Default)]
pub struct LinuxBackend
{
    tracees: BTreeMap<ProcessId, SharedTracee>,
    taken: BTreeSet<ProcessId>,
}

impl LinuxBackend
{
    /// Create a backend with no debuggees.
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    fn tracee(&self, pid: ProcessId) -> Result<&SharedTracee>
    {
        self.tracees
            .get(&pid)
            .ok_or_else(|| DebuggerError::NotFound(format!("process {pid}")))
    }

    /// Start tracking a process whose tasks are all stopped.
    ///
    /// Queues the creation events and the loader breakpoint.
    fn begin(&mut self, leader: Pid, tasks: Vec<(Pid, Task)>, hold: bool) -> Result<ProcessId>
    {
        let mut tracee = Tracee::new(leader, elf_mode(leader), open_mem(leader)?);
        let pid = tracee.process_id();
        let rip = ptrace::getregs(leader)?.rip;

        tracee.push_event(DebugEvent::ProcessCreated {
            pid,
            thread: thread_id(leader),
            image: exe_image(leader),
        });
        for (tid, task) in tasks {
            if tid != leader {
                tracee.push_event(DebugEvent::ThreadCreated {
                    pid,
                    thread: thread_id(tid),
                });
            }
            tracee.add_task(tid, task);
        }
        tracee.push_event(DebugEvent::Exception {
            pid,
            thread: thread_id(leader),
            record: ExceptionRecord::new(ExceptionCode::Breakpoint, Address::new(rip)),
        });
        tracee.set_launch_hold(hold);

        self.tracees.insert(pid, Arc::new(Mutex::new(tracee)));
        Ok(pid)
    }

    fn next_queued(&self) -> Option<(ProcessId, DebugEvent)>
    {
        self.tracees
            .iter()
            .find_map(|(pid, shared)| lock(shared).pop_event().map(|event| (*pid, event)))
    }

    /// Hand an event out: stop the rest of its process and forget the
    /// process once it exited.
    fn deliver(&mut self, pid: ProcessId, event: DebugEvent) -> Result<Option<DebugEvent>>
    {
        let exited = match self.tracees.get(&pid) {
            Some(shared) => {
                let mut tracee = lock(shared);
                tracee.report(event.thread())?;
                tracee.has_exited()
            }
            None => false,
        };
        if exited {
            self.tracees.remove(&pid);
            self.taken.remove(&pid);
        }

        debug!(pid = pid.0, ?event, "Debug event");
        Ok(Some(event))
    }

    fn on_status(&mut self, status: WaitStatus) -> Result<Option<(ProcessId, DebugEvent)>>
    {
        let Some(tid) = status.pid() else {
            return Ok(None);
        };

        let owner = self
            .tracees
            .iter()
            .find(|(_, shared)| lock(shared).owns(tid))
            .map(|(pid, shared)| (*pid, Arc::clone(shared)));
        if let Some((pid, shared)) = owner {
            return Ok(lock(&shared).on_status(status)?.map(|event| (pid, event)));
        }

        self.adopt(tid, status);
        Ok(None)
    }

    /// A new clone can stop before its parent's clone event is seen.
    fn adopt(&self, tid: Pid, status: WaitStatus)
    {
        let owner = matches!(status, WaitStatus::Stopped(_, Signal::SIGSTOP))
            .then(|| thread_group(tid))
            .flatten()
            .and_then(|leader| self.tracees.values().find(|shared| lock(shared).pid() == leader));

        match owner {
            Some(shared) => {
                debug!(tid = tid.as_raw(), "New task stopped ahead of its clone event");
                lock(shared).add_task(
                    tid,
                    Task {
                        stopped: true,
                        ..Task::default()
                    },
                );
            }
            None => debug!(tid = tid.as_raw(), ?status, "Status for unknown task"),
        }
    }
}

impl DebugBackend for LinuxBackend
{
    fn launch(&mut self, info: &LaunchInfo) -> Result<ProcessId>
    {
        let program = c_string(info.program.as_os_str().as_bytes(), "program path")?;
        let mut argv = vec![program.clone()];
        for arg in &info.args {
            argv.push(c_string(arg.as_bytes(), "argument")?);
        }
        let envp = environment(info)?;
        let working_dir = info
            .working_dir
            .as_ref()
            .map(|dir| c_string(dir.as_os_str().as_bytes(), "working directory"))
            .transpose()?;

        info!(program = %info.program.display(), args = ?info.args, "Launching process");

        // SAFETY: the child only makes async-signal-safe calls before exec
        let fork_result =
            unsafe { fork() }.map_err(|error| DebuggerError::AttachFailed(format!("fork failed: {error}")))?;
        let child = match fork_result {
            ForkResult::Child => exec_child(&program, &argv, &envp, working_dir.as_deref()),
            ForkResult::Parent { child } => child,
        };

        match waitpid(child, Some(WaitPidFlag::__WALL))? {
            WaitStatus::Stopped(_, Signal::SIGTRAP) => {}
            WaitStatus::Exited(_, code) => {
                return Err(DebuggerError::AttachFailed(format!(
                    "{} exited with status {code} before it started",
                    info.program.display()
                )))
            }
            other => {
                let _ = kill(child, Signal::SIGKILL);
                return Err(DebuggerError::AttachFailed(format!("unexpected launch status {other:?}")));
            }
        }
        ptrace::setoptions(child, trace_options())?;

        let stopped = Task {
            stopped: true,
            ..Task::default()
        };
        let pid = self.begin(child, vec![(child, stopped)], info.suspend)?;
        info!(pid = pid.0, suspended = info.suspend, "Process launched");
        Ok(pid)
    }

    fn resume_launched(&mut self, pid: ProcessId) -> Result<()>
    {
        lock(self.tracee(pid)?).set_launch_hold(false);
        Ok(())
    }

    fn attach(&mut self, pid: ProcessId) -> Result<()>
    {
        let leader = process_pid(pid)?;
        let mut attached: Vec<(Pid, Task)> = Vec::new();

        for tid in list_tasks(leader)? {
            match ptrace::attach(tid) {
                Ok(()) => {}
                Err(Errno::ESRCH) if tid != leader => continue,
                Err(error) => {
                    for (tid, _) in &attached {
                        let _ = ptrace::detach(*tid, None);
                    }
                    return Err(attach_error(pid, error));
                }
            }
            let task = wait_attached(tid)?;
            ptrace::setoptions(tid, trace_options())?;
            attached.push((tid, task));
        }

        let threads = attached.len();
        self.begin(leader, attached, false)?;
        info!(pid = pid.0, threads, "Attached to process");
        Ok(())
    }

    fn wait_for_event(&mut self, timeout: Duration) -> Result<Option<DebugEvent>>
    {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some((pid, event)) = self.next_queued() {
                return self.deliver(pid, event);
            }

            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG | WaitPidFlag::__WALL)) {
                Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Ok(status) => {
                    if let Some((pid, event)) = self.on_status(status)? {
                        return self.deliver(pid, event);
                    }
                }
                Err(Errno::EINTR) => {}
                Err(error) => return Err(error.into()),
            }
        }
    }

    fn continue_event(&mut self, pid: ProcessId, thread: ThreadId, handled: bool) -> Result<()>
    {
        lock(self.tracee(pid)?).continue_all(thread, handled)
    }

    fn terminate(&mut self, pid: ProcessId) -> Result<()>
    {
        let shared = self.tracee(pid)?;
        let mut tracee = lock(shared);
        tracee.clear_events();
        tracee.set_launch_hold(false);
        match kill(tracee.pid(), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(error) => return Err(error.into()),
        }
        info!(pid = pid.0, "Sent SIGKILL");
        Ok(())
    }

    fn detach(&mut self, pid: ProcessId) -> Result<()>
    {
        let shared = self
            .tracees
            .remove(&pid)
            .ok_or_else(|| DebuggerError::NotFound(format!("process {pid}")))?;
        self.taken.remove(&pid);

        let outcome = lock(&shared).detach_all();
        if let Err(error) = &outcome {
            warn!(pid = pid.0, %error, "Detach did not complete cleanly");
        }
        outcome
    }

    fn async_break(&mut self, pid: ProcessId) -> Result<()>
    {
        lock(self.tracee(pid)?).request_break()
    }

    fn take_target(&mut self, pid: ProcessId) -> Result<Box<dyn ProcessTarget>>
    {
        let shared = Arc::clone(self.tracee(pid)?);
        if !self.taken.insert(pid) {
            return Err(DebuggerError::WrongState(format!("target of process {pid} already taken")));
        }
        Ok(Box::new(LinuxTarget::new(shared)))
    }
}
