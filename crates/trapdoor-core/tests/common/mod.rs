//! Simulated debuggee shared by the integration tests
//!
//! [`SimCpu`] executes a handful of x86-64 opcodes out of one flat memory
//! image, one instruction per thread per tick, and raises the traps a real
//! CPU would: `INT3` traps with the pc after it, the trace flag traps after
//! one instruction and is cleared, fetching outside the image faults.
//!
//! [`SimBackend`] puts a [`DebugBackend`] in front of it with the event
//! order of the Linux backend: creation, one event per extra thread, the
//! loader breakpoint, and continues deferred while events are queued.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::rc::Rc;
use std::time::Duration;

use trapdoor_core::error::{DebuggerError, Result};
use trapdoor_core::events::{ChannelCallback, DebuggerEvent, DebuggerEventReceiver};
use trapdoor_core::session::{DebugSession, SessionConfig};
use trapdoor_core::target::{
    DebugBackend, DebugEvent, ExceptionCode, ExceptionRecord, LaunchInfo, MemoryRead, Module, ProcessTarget,
};
use trapdoor_core::types::{Address, CpuMode, ProcessId, ThreadContext, ThreadId, TRACE_FLAG};

/// Load address of the memory image
pub const CODE_BASE: u64 = 0x1000;
/// Size of the memory image
pub const MEMORY_SIZE: usize = 0x1_0000;
/// Initial stack pointer of every thread
pub const STACK_TOP: u64 = 0x9000;

pub const PID: ProcessId = ProcessId(4242);
pub const MAIN: ThreadId = ThreadId(1);
pub const WORKER: ThreadId = ThreadId(2);

/// Exit status of a process killed with SIGKILL
pub const KILLED: i32 = 128 + 9;
/// Exit status of a process killed by an unhandled fault
pub const FAULTED: i32 = 128 + 11;

const INITIAL_FLAGS: u64 = 0x202;
const MAX_TICKS: usize = 100_000;

/// nop; nop; call callee; nop; hlt; padding; callee: nop; ret
pub const CALL_PROGRAM: &[u8] = &[
    0x90, 0x90, 0xE8, 0x04, 0x00, 0x00, 0x00, 0x90, 0xF4, 0x90, 0x90, 0x90, 0xC3,
];
pub const CALL_SITE: u64 = 0x1002;
pub const RETURN_SITE: u64 = 0x1007;
pub const EXIT_SITE: u64 = 0x1008;
pub const CALLEE: u64 = 0x100b;
pub const CALLEE_RET: u64 = 0x100c;

/// `jmp .` forever
pub const SPIN: &[u8] = &[0xEB, 0xFE];

pub fn addr(value: u64) -> Address
{
    Address::new(value)
}

/// Register state of one simulated thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimThread
{
    pub pc: u64,
    pub sp: u64,
    pub flags: u64,
    pub suspended: u32,
}

/// Why the CPU stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimStop
{
    Exception(ExceptionCode, u64),
    Halted,
}

enum Executed
{
    Ran,
    Breakpoint(u64),
    Halted,
    Fault(u64),
}

/// A tiny x86-64 machine
#[derive(Debug)]
pub struct SimCpu
{
    memory: Vec<u8>,
    threads: BTreeMap<ThreadId, SimThread>,
    pub executed: usize,
    pub flushes: usize,
}

pub type SharedCpu = Rc<RefCell<SimCpu>>;

impl SimCpu
{
    /// A machine with `code` at [`CODE_BASE`] and [`MAIN`] about to run it.
    pub fn new(code: &[u8]) -> Self
    {
        let mut cpu = Self {
            memory: vec![0; MEMORY_SIZE],
            threads: BTreeMap::new(),
            executed: 0,
            flushes: 0,
        };
        cpu.load(CODE_BASE, code);
        cpu.add_thread(MAIN, CODE_BASE);
        cpu
    }

    pub fn shared(self) -> SharedCpu
    {
        Rc::new(RefCell::new(self))
    }

    pub fn load(&mut self, at: u64, bytes: &[u8])
    {
        let offset = self.offset(at).expect("code outside the memory image");
        self.memory[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn add_thread(&mut self, thread: ThreadId, pc: u64)
    {
        let sp = STACK_TOP - 0x1000 * (self.threads.len() as u64);
        self.threads.insert(
            thread,
            SimThread {
                pc,
                sp,
                flags: INITIAL_FLAGS,
                suspended: 0,
            },
        );
    }

    pub fn thread(&self, thread: ThreadId) -> &SimThread
    {
        self.threads.get(&thread).expect("no such simulated thread")
    }

    pub fn threads(&self) -> impl Iterator<Item = ThreadId> + '_
    {
        self.threads.keys().copied()
    }

    /// Raw memory, including any planted trap bytes.
    pub fn byte(&self, at: u64) -> Option<u8>
    {
        self.offset(at).map(|offset| self.memory[offset])
    }

    fn offset(&self, at: u64) -> Option<usize>
    {
        let offset = usize::try_from(at.checked_sub(CODE_BASE)?).ok()?;
        (offset < self.memory.len()).then_some(offset)
    }

    fn read_u64(&self, at: u64) -> Option<u64>
    {
        let offset = self.offset(at)?;
        let bytes = self.memory.get(offset..offset + 8)?;
        Some(u64::from_le_bytes(bytes.try_into().ok()?))
    }

    fn write_u64(&mut self, at: u64, value: u64) -> Option<()>
    {
        let offset = self.offset(at)?;
        self.memory.get_mut(offset..offset + 8)?.copy_from_slice(&value.to_le_bytes());
        Some(())
    }

    fn rel32(&self, at: u64) -> Option<i64>
    {
        let offset = self.offset(at)?;
        let bytes = self.memory.get(offset..offset + 4)?;
        Some(i64::from(i32::from_le_bytes(bytes.try_into().ok()?)))
    }

    /// Execute one instruction on `thread`.
    fn execute(&mut self, thread: ThreadId) -> Executed
    {
        let SimThread { pc, sp, .. } = self.thread(thread).clone();
        let Some(opcode) = self.byte(pc) else {
            return Executed::Fault(pc);
        };

        let step = match opcode {
            0x90 => Some((pc + 1, sp, Executed::Ran)),
            0xCC => Some((pc + 1, sp, Executed::Breakpoint(pc))),
            0xF4 => Some((pc + 1, sp, Executed::Halted)),
            0xEB => self
                .byte(pc + 1)
                .map(|rel| ((pc + 2).wrapping_add_signed(i64::from(rel as i8)), sp, Executed::Ran)),
            0xE9 => self
                .rel32(pc + 1)
                .map(|rel| ((pc + 5).wrapping_add_signed(rel), sp, Executed::Ran)),
            0xE8 => self.rel32(pc + 1).and_then(|rel| {
                let sp = sp - 8;
                self.write_u64(sp, pc + 5)?;
                Some(((pc + 5).wrapping_add_signed(rel), sp, Executed::Ran))
            }),
            0xC3 => self.read_u64(sp).map(|ret| (ret, sp + 8, Executed::Ran)),
            // rep movsb, run as one unit
            0xF3 if self.byte(pc + 1) == Some(0xA4) => Some((pc + 2, sp, Executed::Ran)),
            _ => None,
        };

        let Some((next_pc, next_sp, executed)) = step else {
            return Executed::Fault(pc);
        };
        if let Some(state) = self.threads.get_mut(&thread) {
            state.pc = next_pc;
            state.sp = next_sp;
        }
        self.executed += 1;
        executed
    }

    /// Run every unsuspended thread, one instruction each per tick, until one stops
    ///
    /// `None` when no thread may run.
    pub fn run(&mut self) -> Option<(ThreadId, SimStop)>
    {
        for _ in 0..MAX_TICKS {
            let runnable: Vec<ThreadId> = self
                .threads
                .iter()
                .filter(|(_, state)| state.suspended == 0)
                .map(|(thread, _)| *thread)
                .collect();
            if runnable.is_empty() {
                return None;
            }

            for thread in runnable {
                let traced = self.thread(thread).flags & TRACE_FLAG != 0;
                match self.execute(thread) {
                    Executed::Ran if traced => {
                        let state = self.threads.get_mut(&thread)?;
                        state.flags &= !TRACE_FLAG;
                        return Some((thread, SimStop::Exception(ExceptionCode::SingleStep, state.pc)));
                    }
                    Executed::Ran => {}
                    Executed::Breakpoint(at) => return Some((thread, SimStop::Exception(ExceptionCode::Breakpoint, at))),
                    Executed::Fault(at) => return Some((thread, SimStop::Exception(ExceptionCode::AccessViolation, at))),
                    Executed::Halted => return Some((thread, SimStop::Halted)),
                }
            }
        }
        panic!("simulated program did not stop");
    }

    fn remove_thread(&mut self, thread: ThreadId)
    {
        self.threads.remove(&thread);
    }
}

fn unmapped(operation: &'static str) -> DebuggerError
{
    DebuggerError::os(operation, io::Error::new(io::ErrorKind::AddrNotAvailable, "address not mapped"))
}

/// [`ProcessTarget`] over a shared [`SimCpu`]
#[derive(Debug, Clone)]
pub struct SimTarget(pub SharedCpu);

impl ProcessTarget for SimTarget
{
    fn cpu_mode(&self) -> CpuMode
    {
        CpuMode::Bits64
    }

    fn read_memory(&mut self, address: Address, len: usize) -> Result<MemoryRead>
    {
        let cpu = self.0.borrow();
        let data = match cpu.offset(address.value()) {
            Some(offset) => cpu.memory[offset..(offset + len).min(cpu.memory.len())].to_vec(),
            None => Vec::new(),
        };
        Ok(MemoryRead::new(data, len))
    }

    fn write_memory(&mut self, address: Address, data: &[u8]) -> Result<usize>
    {
        let mut cpu = self.0.borrow_mut();
        let offset = cpu.offset(address.value()).ok_or_else(|| unmapped("write_memory"))?;
        let end = (offset + data.len()).min(cpu.memory.len());
        let written = end - offset;
        cpu.memory[offset..end].copy_from_slice(&data[..written]);
        Ok(written)
    }

    fn flush_instruction_cache(&mut self, _address: Address, _len: usize) -> Result<()>
    {
        self.0.borrow_mut().flushes += 1;
        Ok(())
    }

    fn get_context(&mut self, thread: ThreadId) -> Result<ThreadContext>
    {
        let cpu = self.0.borrow();
        let state = cpu
            .threads
            .get(&thread)
            .ok_or_else(|| DebuggerError::NotFound(format!("thread {thread}")))?;
        Ok(ThreadContext::new(addr(state.pc), addr(state.sp), state.flags))
    }

    fn set_context(&mut self, thread: ThreadId, context: &ThreadContext) -> Result<()>
    {
        let mut cpu = self.0.borrow_mut();
        let state = cpu
            .threads
            .get_mut(&thread)
            .ok_or_else(|| DebuggerError::NotFound(format!("thread {thread}")))?;
        state.pc = context.pc.value();
        state.sp = context.sp.value();
        state.flags = context.flags;
        Ok(())
    }

    fn suspend_thread(&mut self, thread: ThreadId) -> Result<()>
    {
        let mut cpu = self.0.borrow_mut();
        let state = cpu
            .threads
            .get_mut(&thread)
            .ok_or_else(|| DebuggerError::NotFound(format!("thread {thread}")))?;
        state.suspended += 1;
        Ok(())
    }

    fn resume_thread(&mut self, thread: ThreadId) -> Result<()>
    {
        let mut cpu = self.0.borrow_mut();
        let state = cpu
            .threads
            .get_mut(&thread)
            .ok_or_else(|| DebuggerError::NotFound(format!("thread {thread}")))?;
        if state.suspended == 0 {
            return Err(DebuggerError::WrongState(format!("thread {thread} is not suspended")));
        }
        state.suspended -= 1;
        Ok(())
    }
}

/// One continue as the backend saw it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Continued
{
    pub pid: ProcessId,
    pub thread: ThreadId,
    pub handled: bool,
}

/// [`DebugBackend`] running one simulated process
#[derive(Debug)]
pub struct SimBackend
{
    cpu: SharedCpu,
    queue: VecDeque<DebugEvent>,
    running: bool,
    held: bool,
    target_taken: bool,
    last_exception: Option<ExceptionCode>,
    pub continues: Vec<Continued>,
    pub detached: bool,
    pub terminated: bool,
}

impl SimBackend
{
    pub fn new(cpu: SharedCpu) -> Self
    {
        Self {
            cpu,
            queue: VecDeque::new(),
            running: false,
            held: false,
            target_taken: false,
            last_exception: None,
            continues: Vec::new(),
            detached: false,
            terminated: false,
        }
    }

    /// Start a thread in the running process; it is reported on the next wait.
    pub fn spawn_thread(&mut self, thread: ThreadId, pc: u64)
    {
        self.cpu.borrow_mut().add_thread(thread, pc);
        self.queue.push_back(DebugEvent::ThreadCreated { pid: PID, thread });
    }

    fn check(&self, pid: ProcessId) -> Result<()>
    {
        if pid == PID {
            Ok(())
        } else {
            Err(DebuggerError::ProcessNotFound(pid.0))
        }
    }

    fn queue_creation(&mut self, image: Option<Module>)
    {
        let cpu = self.cpu.borrow();
        let mut threads = cpu.threads();
        let Some(main) = threads.next() else {
            return;
        };

        self.queue.push_back(DebugEvent::ProcessCreated {
            pid: PID,
            thread: main,
            image,
        });
        for thread in threads {
            self.queue.push_back(DebugEvent::ThreadCreated { pid: PID, thread });
        }
        self.queue.push_back(DebugEvent::Exception {
            pid: PID,
            thread: main,
            record: ExceptionRecord::new(ExceptionCode::Breakpoint, addr(cpu.thread(main).pc)),
        });
    }

    fn stop_event(&mut self, thread: ThreadId, stop: SimStop) -> DebugEvent
    {
        match stop {
            SimStop::Exception(code, at) => DebugEvent::Exception {
                pid: PID,
                thread,
                record: ExceptionRecord::new(code, addr(at)),
            },
            SimStop::Halted if thread == MAIN => DebugEvent::ProcessExited { pid: PID, code: 0 },
            SimStop::Halted => {
                self.cpu.borrow_mut().remove_thread(thread);
                DebugEvent::ThreadExited {
                    pid: PID,
                    thread,
                    code: 0,
                }
            }
        }
    }

    fn deliver(&mut self, event: DebugEvent) -> Option<DebugEvent>
    {
        self.last_exception = match &event {
            DebugEvent::Exception { record, .. } => Some(record.code),
            _ => None,
        };
        Some(event)
    }
}

impl DebugBackend for SimBackend
{
    fn launch(&mut self, info: &LaunchInfo) -> Result<ProcessId>
    {
        let image = Module {
            base: addr(CODE_BASE),
            size: MEMORY_SIZE as u64,
            path: info.program.clone(),
        };
        self.queue_creation(Some(image));
        self.held = info.suspend;
        Ok(PID)
    }

    fn resume_launched(&mut self, pid: ProcessId) -> Result<()>
    {
        self.check(pid)?;
        self.held = false;
        Ok(())
    }

    fn attach(&mut self, pid: ProcessId) -> Result<()>
    {
        self.check(pid)?;
        self.queue_creation(None);
        Ok(())
    }

    fn wait_for_event(&mut self, _timeout: Duration) -> Result<Option<DebugEvent>>
    {
        if self.held {
            return Ok(None);
        }
        if let Some(event) = self.queue.pop_front() {
            return Ok(self.deliver(event));
        }
        if !self.running {
            return Ok(None);
        }

        let stop = self.cpu.borrow_mut().run();
        let Some((thread, stop)) = stop else {
            return Ok(None);
        };
        self.running = false;
        let event = self.stop_event(thread, stop);
        Ok(self.deliver(event))
    }

    fn continue_event(&mut self, pid: ProcessId, thread: ThreadId, handled: bool) -> Result<()>
    {
        self.continues.push(Continued { pid, thread, handled });

        // an unhandled fault kills the debuggee
        let fatal = matches!(
            self.last_exception.take(),
            Some(ExceptionCode::AccessViolation | ExceptionCode::Signal(_))
        );
        if fatal && !handled {
            self.queue.push_back(DebugEvent::ProcessExited { pid, code: FAULTED });
            return Ok(());
        }

        self.running = self.queue.is_empty() && !self.detached;
        Ok(())
    }

    fn terminate(&mut self, pid: ProcessId) -> Result<()>
    {
        self.check(pid)?;
        self.terminated = true;
        self.held = false;
        self.running = false;
        self.queue.clear();
        self.queue.push_back(DebugEvent::ProcessExited { pid, code: KILLED });
        Ok(())
    }

    fn detach(&mut self, pid: ProcessId) -> Result<()>
    {
        self.check(pid)?;
        self.detached = true;
        self.running = false;
        self.queue.clear();
        Ok(())
    }

    fn async_break(&mut self, pid: ProcessId) -> Result<()>
    {
        self.check(pid)?;
        if self.running {
            self.running = false;
            self.queue.push_back(DebugEvent::AsyncBreak { pid, thread: MAIN });
        }
        Ok(())
    }

    fn take_target(&mut self, pid: ProcessId) -> Result<Box<dyn ProcessTarget>>
    {
        self.check(pid)?;
        if self.target_taken {
            return Err(DebuggerError::WrongState(format!("target of process {pid} already taken")));
        }
        self.target_taken = true;
        Ok(Box::new(SimTarget(Rc::clone(&self.cpu))))
    }
}

/// A session over a simulated process, plus the client's event stream
pub struct Harness
{
    pub cpu: SharedCpu,
    pub session: DebugSession<SimBackend>,
    pub events: DebuggerEventReceiver,
}

impl Harness
{
    pub fn new(cpu: SimCpu) -> Self
    {
        let (callback, events) = ChannelCallback::new();
        Self::with_callback(cpu, callback, events, SessionConfig::default())
    }

    pub fn with_callback(
        cpu: SimCpu,
        callback: ChannelCallback,
        events: DebuggerEventReceiver,
        config: SessionConfig,
    ) -> Self
    {
        let cpu = cpu.shared();
        let backend = SimBackend::new(Rc::clone(&cpu));
        Self {
            cpu,
            session: DebugSession::with_config(backend, Box::new(callback), config),
            events,
        }
    }

    /// Launch the program and run to the loader breakpoint.
    pub fn launched(cpu: SimCpu) -> Self
    {
        let mut harness = Self::new(cpu);
        harness.launch_to_loader();
        harness
    }

    pub fn launch_to_loader(&mut self) -> Vec<DebuggerEvent>
    {
        let pid = self.session.launch(&LaunchInfo::new("/sim/program")).expect("launch");
        assert_eq!(pid, PID);
        let events = self.pump();
        assert!(
            matches!(events.last(), Some(DebuggerEvent::LoadComplete { .. })),
            "expected the loader breakpoint, got {events:?}"
        );
        events
    }

    /// Dispatch events until the process stops, ends or nothing happens.
    pub fn pump(&mut self) -> Vec<DebuggerEvent>
    {
        for _ in 0..1000 {
            let got = self.session.wait_for_event().expect("event dispatch failed");
            let process = self.session.process(PID);
            let settled = process.map_or(true, |process| process.is_stopped() || process.is_deleted());
            if !got || settled {
                break;
            }
        }
        self.drain()
    }

    /// Notifications delivered so far.
    pub fn drain(&mut self) -> Vec<DebuggerEvent>
    {
        self.events.try_iter().collect()
    }

    pub fn pc(&mut self) -> u64
    {
        self.session.thread_context(PID).expect("process is not stopped").pc.value()
    }

    pub fn raw_byte(&self, at: u64) -> u8
    {
        self.cpu.borrow().byte(at).expect("address outside the memory image")
    }

    pub fn suspend_count(&self, thread: ThreadId) -> u32
    {
        self.cpu.borrow().thread(thread).suspended
    }

    pub fn is_stepping(&self) -> bool
    {
        self.session
            .process(PID)
            .is_some_and(|process| process.machine().is_stepping(MAIN))
    }
}
