//! Step strategies end to end: session commands over a simulated CPU

mod common;

use std::rc::Rc;

use common::{
    addr, Harness, SimCpu, SimTarget, CALLEE, CALLEE_RET, CALL_PROGRAM, CALL_SITE, CODE_BASE, EXIT_SITE, MAIN, PID,
    RETURN_SITE, SPIN,
};
use trapdoor_core::error::DebuggerError;
use trapdoor_core::events::{ChannelCallback, DebuggerEvent, DebuggerEventReceiver, ProbeRunMode, RunMode};
use trapdoor_core::machine::{MachineCore, MachineResult};
use trapdoor_core::session::SessionConfig;
use trapdoor_core::target::{ExceptionCode, ExceptionRecord};
use trapdoor_core::types::{Address, AddressRange, ThreadId, TRACE_FLAG};

fn step_complete() -> DebuggerEvent
{
    DebuggerEvent::StepComplete { pid: PID, thread: MAIN }
}

fn breakpoint_at(address: u64) -> DebuggerEvent
{
    DebuggerEvent::Breakpoint {
        pid: PID,
        thread: MAIN,
        address: addr(address),
        embedded: false,
    }
}

/// Launch with a custom callback and stop at the loader breakpoint.
fn launched_with(code: &[u8], callback: ChannelCallback, events: DebuggerEventReceiver) -> Harness
{
    let mut harness = Harness::with_callback(SimCpu::new(code), callback, events, SessionConfig::default());
    harness.launch_to_loader();
    harness
}

/// Step over instructions until the pc reaches `target`.
fn step_to(harness: &mut Harness, target: u64)
{
    while harness.pc() != target {
        harness.session.step_instruction(PID, false, false).unwrap();
        assert_eq!(harness.pump(), vec![step_complete()]);
    }
}

#[test]
fn test_single_step_moves_one_instruction()
{
    let mut harness = Harness::launched(SimCpu::new(CALL_PROGRAM));
    assert_eq!(harness.pc(), CODE_BASE);

    harness.session.step_instruction(PID, true, false).unwrap();
    assert_eq!(harness.pump(), vec![step_complete()]);
    assert_eq!(harness.pc(), CODE_BASE + 1);

    // the trace flag does not leak into the next run
    assert_eq!(harness.session.thread_context(PID).unwrap().flags & TRACE_FLAG, 0);
    assert!(!harness.is_stepping());
}

#[test]
fn test_step_over_call_lands_after_it()
{
    let mut harness = Harness::launched(SimCpu::new(CALL_PROGRAM));
    step_to(&mut harness, CALL_SITE);

    harness.session.step_instruction(PID, false, false).unwrap();
    assert!(harness.session.process(PID).unwrap().machine().is_breakpoint_active(addr(RETURN_SITE)));

    assert_eq!(harness.pump(), vec![step_complete()]);
    assert_eq!(harness.pc(), RETURN_SITE);

    // the landing breakpoint is gone
    assert_eq!(harness.raw_byte(RETURN_SITE), 0x90);
    assert!(harness.session.process(PID).unwrap().machine().breakpoints().is_empty());
}

#[test]
fn test_step_into_call_stops_in_callee_when_probe_breaks()
{
    let mut harness = Harness::launched(SimCpu::new(CALL_PROGRAM));
    step_to(&mut harness, CALL_SITE);

    harness.session.step_instruction(PID, true, false).unwrap();
    let events = harness.pump();
    assert_eq!(
        events,
        vec![
            DebuggerEvent::CallProbe {
                pid: PID,
                thread: MAIN,
                address: addr(CALLEE),
                thunk: None,
            },
            step_complete(),
        ]
    );
    assert_eq!(harness.pc(), CALLEE);
    assert_eq!(harness.raw_byte(RETURN_SITE), 0x90);
}

#[test]
fn test_step_into_call_runs_through_when_probe_says_run()
{
    let (callback, events) = ChannelCallback::new();
    let mut harness = launched_with(CALL_PROGRAM, callback.with_probe_mode(ProbeRunMode::Run), events);
    step_to(&mut harness, CALL_SITE);

    harness.session.step_instruction(PID, true, false).unwrap();
    let events = harness.pump();
    assert!(matches!(events.first(), Some(DebuggerEvent::CallProbe { .. })));
    assert_eq!(events.last(), Some(&step_complete()));
    assert_eq!(harness.pc(), RETURN_SITE);
}

#[test]
fn test_step_into_call_without_source_mode_is_a_single_step()
{
    let (callback, events) = ChannelCallback::new();
    let config = SessionConfig {
        source_mode: false,
        ..SessionConfig::default()
    };
    let mut harness = Harness::with_callback(SimCpu::new(CALL_PROGRAM), callback, events, config);
    harness.launch_to_loader();
    step_to(&mut harness, CALL_SITE);

    harness.session.step_instruction(PID, true, false).unwrap();
    assert_eq!(harness.pump(), vec![step_complete()]);
    assert_eq!(harness.pc(), CALLEE);
}

#[test]
fn test_step_into_jump_thunk_probes_the_real_callee()
{
    // call thunk; hlt; thunk: jmp callee; callee: nop; ret
    let code = [0xE8, 0x01, 0x00, 0x00, 0x00, 0xF4, 0xEB, 0x00, 0x90, 0xC3];
    let mut harness = Harness::launched(SimCpu::new(&code));

    harness.session.step_instruction(PID, true, false).unwrap();
    let events = harness.pump();
    assert_eq!(
        events.first(),
        Some(&DebuggerEvent::CallProbe {
            pid: PID,
            thread: MAIN,
            address: addr(CODE_BASE + 8),
            thunk: Some(AddressRange::new(addr(CODE_BASE + 6), addr(CODE_BASE + 7))),
        })
    );
    assert_eq!(harness.pc(), CODE_BASE + 8);
}

#[test]
fn test_step_out_returns_to_caller()
{
    let mut harness = Harness::launched(SimCpu::new(CALL_PROGRAM));
    step_to(&mut harness, CALL_SITE);
    harness.session.step_instruction(PID, true, false).unwrap();
    harness.pump();
    assert_eq!(harness.pc(), CALLEE);

    harness.session.step_out(PID, addr(RETURN_SITE), false).unwrap();
    assert_eq!(harness.pump(), vec![step_complete()]);
    assert_eq!(harness.pc(), RETURN_SITE);
}

#[test]
fn test_step_over_rep_string_uses_landing_breakpoint()
{
    // rep movsb; nop; hlt
    let mut harness = Harness::launched(SimCpu::new(&[0xF3, 0xA4, 0x90, 0xF4]));

    harness.session.step_instruction(PID, false, false).unwrap();
    assert!(harness.session.process(PID).unwrap().machine().is_breakpoint_active(addr(CODE_BASE + 2)));
    assert_eq!(harness.pump(), vec![step_complete()]);
    assert_eq!(harness.pc(), CODE_BASE + 2);
}

#[test]
fn test_range_step_leaves_the_range_once()
{
    let mut harness = Harness::launched(SimCpu::new(CALL_PROGRAM));
    let line = AddressRange::new(addr(CODE_BASE), addr(CODE_BASE + 1));

    harness.session.step_range(PID, false, line, false).unwrap();
    assert_eq!(harness.pump(), vec![step_complete()]);
    assert_eq!(harness.pc(), CALL_SITE);
}

#[test]
fn test_range_step_over_steps_over_calls_in_the_range()
{
    let mut harness = Harness::launched(SimCpu::new(CALL_PROGRAM));
    let line = AddressRange::new(addr(CODE_BASE), addr(RETURN_SITE - 1));

    harness.session.step_range(PID, false, line, false).unwrap();
    assert_eq!(harness.pump(), vec![step_complete()]);
    assert_eq!(harness.pc(), RETURN_SITE);
}

#[test]
fn test_range_step_in_probes_callee_outside_the_range()
{
    let mut harness = Harness::launched(SimCpu::new(CALL_PROGRAM));
    let line = AddressRange::new(addr(CODE_BASE), addr(RETURN_SITE - 1));

    harness.session.step_range(PID, true, line, false).unwrap();
    let events = harness.pump();
    assert!(matches!(events.first(), Some(DebuggerEvent::CallProbe { address, .. }) if *address == addr(CALLEE)));
    assert_eq!(events.last(), Some(&step_complete()));
    assert_eq!(harness.pc(), CALLEE);
}

#[test]
fn test_run_to_address()
{
    let mut harness = Harness::launched(SimCpu::new(CALL_PROGRAM));

    harness.session.run_to(PID, addr(EXIT_SITE), false).unwrap();
    assert_eq!(harness.pump(), vec![step_complete()]);
    assert_eq!(harness.pc(), EXIT_SITE);
    assert_eq!(harness.raw_byte(EXIT_SITE), 0xF4);
}

#[test]
fn test_step_from_user_breakpoint_keeps_it_armed()
{
    let mut harness = Harness::launched(SimCpu::new(CALL_PROGRAM));
    harness.session.set_breakpoint(PID, addr(CALLEE)).unwrap();
    harness.session.continue_process(PID, false).unwrap();
    assert_eq!(harness.pump(), vec![breakpoint_at(CALLEE)]);
    assert_eq!(harness.pc(), CALLEE);

    harness.session.step_instruction(PID, true, false).unwrap();
    // the trap is lifted while the original instruction runs
    assert_eq!(harness.raw_byte(CALLEE), 0x90);

    assert_eq!(harness.pump(), vec![step_complete()]);
    assert_eq!(harness.pc(), CALLEE_RET);
    assert_eq!(harness.raw_byte(CALLEE), 0xCC);
}

#[test]
fn test_breaking_at_user_breakpoint_cancels_step_over()
{
    let mut harness = Harness::launched(SimCpu::new(CALL_PROGRAM));
    harness.session.set_breakpoint(PID, addr(CALLEE)).unwrap();
    step_to(&mut harness, CALL_SITE);

    harness.session.step_instruction(PID, false, false).unwrap();
    assert_eq!(harness.pump(), vec![breakpoint_at(CALLEE)]);

    assert!(!harness.is_stepping());
    assert!(!harness.session.process(PID).unwrap().machine().is_breakpoint_active(addr(RETURN_SITE)));
    assert_eq!(harness.raw_byte(RETURN_SITE), 0x90);

    harness.session.continue_process(PID, false).unwrap();
    let events = harness.pump();
    assert_eq!(events, vec![DebuggerEvent::ProcessExited { pid: PID, code: 0 }]);
}

#[test]
fn test_step_over_survives_user_breakpoint_in_callee()
{
    let (callback, events) = ChannelCallback::new();
    let mut harness = launched_with(CALL_PROGRAM, callback.with_breakpoint_mode(RunMode::Wait), events);
    harness.session.set_breakpoint(PID, addr(CALLEE)).unwrap();
    step_to(&mut harness, CALL_SITE);

    harness.session.step_instruction(PID, false, false).unwrap();
    assert_eq!(harness.pump(), vec![breakpoint_at(CALLEE)]);
    assert!(harness.is_stepping());

    harness.session.continue_process(PID, false).unwrap();
    assert_eq!(harness.pump(), vec![step_complete()]);
    assert_eq!(harness.pc(), RETURN_SITE);
    assert_eq!(harness.raw_byte(CALLEE), 0xCC);
}

#[test]
fn test_run_to_passes_user_breakpoint_on_the_way()
{
    let (callback, events) = ChannelCallback::new();
    let mut harness = launched_with(CALL_PROGRAM, callback.with_breakpoint_mode(RunMode::Wait), events);
    harness.session.set_breakpoint(PID, addr(CALLEE)).unwrap();

    harness.session.run_to(PID, addr(EXIT_SITE), false).unwrap();
    assert_eq!(harness.pump(), vec![breakpoint_at(CALLEE)]);

    harness.session.continue_process(PID, false).unwrap();
    assert_eq!(harness.pump(), vec![step_complete()]);
    assert_eq!(harness.pc(), EXIT_SITE);
}

#[test]
fn test_embedded_breakpoint_is_reported_and_skipped()
{
    // nop; int3; nop; hlt
    let mut harness = Harness::launched(SimCpu::new(&[0x90, 0xCC, 0x90, 0xF4]));

    harness.session.continue_process(PID, false).unwrap();
    assert_eq!(
        harness.pump(),
        vec![DebuggerEvent::Breakpoint {
            pid: PID,
            thread: MAIN,
            address: addr(CODE_BASE + 1),
            embedded: true,
        }]
    );
    assert_eq!(harness.pc(), CODE_BASE + 1);

    harness.session.continue_process(PID, false).unwrap();
    assert_eq!(harness.pump(), vec![DebuggerEvent::ProcessExited { pid: PID, code: 0 }]);
}

#[test]
fn test_step_over_embedded_breakpoint()
{
    let mut harness = Harness::launched(SimCpu::new(&[0x90, 0xCC, 0x90, 0xF4]));
    step_to(&mut harness, CODE_BASE + 1);

    harness.session.step_instruction(PID, false, false).unwrap();
    assert_eq!(harness.pump(), vec![step_complete()]);
    assert_eq!(harness.pc(), CODE_BASE + 2);
}

#[test]
fn test_cancel_step_releases_its_traps()
{
    let mut harness = Harness::launched(SimCpu::new(SPIN));
    let target = CODE_BASE + 0x10;

    harness.session.run_to(PID, addr(target), false).unwrap();
    assert_eq!(harness.raw_byte(target), 0xCC);

    // the spin loop never gets there; break in and drop the step
    harness.session.async_break(PID).unwrap();
    assert_eq!(
        harness.pump(),
        vec![DebuggerEvent::AsyncBreakComplete { pid: PID, thread: MAIN }]
    );

    harness.session.cancel_step(PID).unwrap();
    assert!(!harness.is_stepping());
    assert!(harness.session.process(PID).unwrap().machine().breakpoints().is_empty());
    assert_eq!(harness.raw_byte(target), 0x00);
}

#[test]
fn test_stray_trace_trap_is_reported_as_embedded_step()
{
    let cpu = SimCpu::new(&[0x90]).shared();
    let mut core = MachineCore::new(Box::new(SimTarget(cpu)));
    core.on_create_thread(MAIN).unwrap();
    core.on_stopped(MAIN);

    let mut probe = |_: ThreadId, _: Address, _: Option<AddressRange>| ProbeRunMode::Run;
    let record = ExceptionRecord::new(ExceptionCode::SingleStep, addr(CODE_BASE));
    let result = core.on_exception(MAIN, &record, &mut probe).unwrap();
    assert_eq!(result, MachineResult::PendingCallbackEmbeddedStep);
}

#[test]
fn test_other_exceptions_cancel_the_step()
{
    let cpu = SimCpu::new(CALL_PROGRAM).shared();
    let mut core = MachineCore::new(Box::new(SimTarget(cpu)));
    core.on_create_thread(MAIN).unwrap();
    core.on_stopped(MAIN);

    core.set_step_instruction(false, true).unwrap();
    assert!(core.is_stepping(MAIN));
    assert_eq!(core.expected_depth(MAIN), 1);

    let mut probe = |_: ThreadId, _: Address, _: Option<AddressRange>| ProbeRunMode::Run;
    let record = ExceptionRecord::new(ExceptionCode::AccessViolation, addr(0));
    let result = core.on_exception(MAIN, &record, &mut probe).unwrap();
    assert_eq!(result, MachineResult::NotHandled);
    assert!(!core.is_stepping(MAIN));
    assert_eq!(core.expected_depth(MAIN), 0);
    assert!(!core.context().unwrap().trace_flag());
}

#[test]
fn test_other_exceptions_release_the_landing_breakpoint()
{
    let cpu = SimCpu::new(CALL_PROGRAM).shared();
    let mut core = MachineCore::new(Box::new(SimTarget(Rc::clone(&cpu))));
    core.on_create_thread(MAIN).unwrap();
    core.on_stopped(MAIN);

    let mut context = core.context().unwrap();
    context.pc = addr(CALL_SITE);
    core.set_context(&context).unwrap();

    // step over the call: a breakpoint waits at the return site
    core.set_step_instruction(false, true).unwrap();
    assert!(core.is_breakpoint_active(addr(RETURN_SITE)));
    assert_eq!(cpu.borrow().byte(RETURN_SITE), Some(0xCC));

    let mut probe = |_: ThreadId, _: Address, _: Option<AddressRange>| ProbeRunMode::Run;
    let record = ExceptionRecord::new(ExceptionCode::AccessViolation, addr(CALLEE));
    let result = core.on_exception(MAIN, &record, &mut probe).unwrap();

    assert_eq!(result, MachineResult::NotHandled);
    assert!(!core.is_stepping(MAIN));
    assert!(core.breakpoints().is_empty());
    assert_eq!(cpu.borrow().byte(RETURN_SITE), Some(0x90));
}

#[test]
fn test_exception_on_another_thread_is_rejected()
{
    let cpu = SimCpu::new(&[0x90]).shared();
    let mut core = MachineCore::new(Box::new(SimTarget(cpu)));
    core.on_stopped(MAIN);

    let mut probe = |_: ThreadId, _: Address, _: Option<AddressRange>| ProbeRunMode::Run;
    let record = ExceptionRecord::new(ExceptionCode::Breakpoint, addr(CODE_BASE));
    let error = core.on_exception(ThreadId(7), &record, &mut probe).unwrap_err();
    assert!(matches!(error, DebuggerError::WrongState(_)));
}

#[test]
fn test_step_commands_need_a_stopped_thread()
{
    let cpu = SimCpu::new(&[0x90]).shared();
    let mut core = MachineCore::new(Box::new(SimTarget(cpu)));

    assert!(matches!(core.set_step_instruction(true, true), Err(DebuggerError::WrongState(_))));
    assert!(matches!(core.cancel_step(), Err(DebuggerError::WrongState(_))));
    // nothing stopped, nothing to write back
    core.on_continue().unwrap();
}
