//! # Linux Process Target
//!
//! [`ProcessTarget`] over `ptrace` and `/proc/<pid>/mem`.
//!
//! Memory goes through positional reads and writes on the `mem` file, which
//! works on stopped and running tasks alike and is not limited to one word
//! per syscall like `PTRACE_PEEKDATA`. Registers go through
//! `PTRACE_GETREGS`/`PTRACE_SETREGS`. The x86 trace flag is never written
//! to the task: it is remembered and realised as `PTRACE_SINGLESTEP` on the
//! next resume.

use std::io;
use std::os::unix::fs::FileExt;

use nix::sys::ptrace;
use tracing::trace;

use super::tracee::{lock, SharedTracee};
use crate::error::{DebuggerError, Result};
use crate::target::{MemoryRead, ProcessTarget};
use crate::types::{Address, CpuMode, ThreadContext, ThreadId, TRACE_FLAG};

const PAGE_SIZE: u64 = 0x1000;

/// One traced Linux process
#[derive(Debug)]
pub struct LinuxTarget
{
    tracee: SharedTracee,
}

impl LinuxTarget
{
    pub(super) fn new(tracee: SharedTracee) -> Self
    {
        Self { tracee }
    }
}

/// Whether a `/proc/<pid>/mem` error means "this page is not mapped".
fn is_unmapped(error: &io::Error) -> bool
{
    matches!(error.raw_os_error(), Some(libc::EIO | libc::EFAULT))
}

impl ProcessTarget for LinuxTarget
{
    fn cpu_mode(&self) -> CpuMode
    {
        lock(&self.tracee).cpu_mode()
    }

    fn read_memory(&mut self, address: Address, len: usize) -> Result<MemoryRead>
    {
        let tracee = lock(&self.tracee);
        let mut data = vec![0u8; len];
        let mut filled = 0usize;

        // page by page, so a hole ends the read exactly at its first byte
        while filled < len {
            let at = address.value().wrapping_add(filled as u64);
            let page_left = usize::try_from(PAGE_SIZE - at % PAGE_SIZE).unwrap_or(usize::MAX);
            let chunk = page_left.min(len - filled);
            match tracee.mem().read_at(&mut data[filled..filled + chunk], at) {
                Ok(0) => break,
                Ok(read) => filled += read,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) if is_unmapped(&error) => break,
                Err(error) => return Err(DebuggerError::os("read_memory", error)),
            }
        }

        data.truncate(filled);
        trace!(address = %address, requested = len, read = filled, "Read memory");
        Ok(MemoryRead::new(data, len))
    }

    fn write_memory(&mut self, address: Address, data: &[u8]) -> Result<usize>
    {
        let tracee = lock(&self.tracee);
        let mut written = 0usize;

        while written < data.len() {
            let at = address.value().wrapping_add(written as u64);
            match tracee.mem().write_at(&data[written..], at) {
                Ok(0) => break,
                Ok(count) => written += count,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) if written > 0 && is_unmapped(&error) => break,
                Err(error) => return Err(DebuggerError::os("write_memory", error)),
            }
        }

        trace!(address = %address, requested = data.len(), written, "Wrote memory");
        Ok(written)
    }

    fn flush_instruction_cache(&mut self, _address: Address, _len: usize) -> Result<()>
    {
        // x86 keeps instruction fetch coherent with stores
        Ok(())
    }

    fn get_context(&mut self, thread: ThreadId) -> Result<ThreadContext>
    {
        let mut tracee = lock(&self.tracee);
        let (tid, task) = tracee.stopped_task(thread)?;
        let regs = ptrace::getregs(tid)?;

        let mut context = ThreadContext::new(Address::new(regs.rip), Address::new(regs.rsp), regs.eflags);
        context.set_trace_flag(task.single_step);
        Ok(context)
    }

    fn set_context(&mut self, thread: ThreadId, context: &ThreadContext) -> Result<()>
    {
        let mut tracee = lock(&self.tracee);
        let (tid, task) = tracee.stopped_task(thread)?;
        let mut regs = ptrace::getregs(tid)?;

        regs.rip = context.pc.value();
        regs.rsp = context.sp.value();
        regs.eflags = context.flags & !TRACE_FLAG;
        ptrace::setregs(tid, regs)?;
        task.single_step = context.trace_flag();

        trace!(thread = thread.raw(), pc = %context.pc, step = task.single_step, "Context written");
        Ok(())
    }

    fn suspend_thread(&mut self, thread: ThreadId) -> Result<()>
    {
        lock(&self.tracee).hold(thread)
    }

    fn resume_thread(&mut self, thread: ThreadId) -> Result<()>
    {
        lock(&self.tracee).release(thread)
    }
}
