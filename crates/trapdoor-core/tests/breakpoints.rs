//! Breakpoint table and clean memory access over a simulated process

mod common;

use common::{addr, SimCpu, SimTarget, CODE_BASE, MEMORY_SIZE};
use trapdoor_core::breakpoints::{BreakpointOwner, BreakpointTable};
use trapdoor_core::error::DebuggerError;
use trapdoor_core::target::ProcessTarget;

const CODE: &[u8] = &[0x55, 0x48, 0x89, 0xE5, 0x90, 0xC3];

fn target() -> SimTarget
{
    SimTarget(SimCpu::new(CODE).shared())
}

fn raw(target: &mut SimTarget, at: u64, len: usize) -> Vec<u8>
{
    target.read_memory(addr(at), len).unwrap().data
}

#[test]
fn test_set_patches_and_remove_restores()
{
    let mut target = target();
    let mut table = BreakpointTable::new();
    let at = addr(CODE_BASE + 1);

    table.set(&mut target, at, BreakpointOwner::User).unwrap();
    assert_eq!(raw(&mut target, CODE_BASE + 1, 1), vec![0xCC]);

    let bp = table.get(at).unwrap();
    assert_eq!(bp.original, 0x48);
    assert!(bp.patched && bp.user);
    assert!(table.is_user(at));

    table.remove(&mut target, at, BreakpointOwner::User).unwrap();
    assert_eq!(raw(&mut target, CODE_BASE + 1, 1), vec![0x48]);
    assert!(table.is_empty());
}

#[test]
fn test_holds_are_shared_between_user_and_steppers()
{
    let mut target = target();
    let mut table = BreakpointTable::new();
    let at = addr(CODE_BASE + 4);

    table.set(&mut target, at, BreakpointOwner::User).unwrap();
    table.set(&mut target, at, BreakpointOwner::Stepper).unwrap();
    table.set(&mut target, at, BreakpointOwner::Stepper).unwrap();
    // a second user set is not a second hold
    table.set(&mut target, at, BreakpointOwner::User).unwrap();
    assert_eq!(table.get(at).unwrap().stepper_count, 2);

    table.remove(&mut target, at, BreakpointOwner::User).unwrap();
    assert!(table.is_patched(at));
    assert!(!table.is_user(at));

    table.remove(&mut target, at, BreakpointOwner::Stepper).unwrap();
    assert!(table.is_patched(at));

    table.remove(&mut target, at, BreakpointOwner::Stepper).unwrap();
    assert!(table.get(at).is_none());
    assert_eq!(raw(&mut target, CODE_BASE + 4, 1), vec![0x90]);
}

#[test]
fn test_remove_without_breakpoint_is_a_no_op()
{
    let mut target = target();
    let mut table = BreakpointTable::new();

    table.remove(&mut target, addr(CODE_BASE), BreakpointOwner::User).unwrap();
    assert!(table.is_empty());
    assert_eq!(raw(&mut target, CODE_BASE, 1), vec![0x55]);
}

#[test]
fn test_set_on_unmapped_address_leaves_table_untouched()
{
    let mut target = target();
    let mut table = BreakpointTable::new();

    let error = table
        .set(&mut target, addr(CODE_BASE + MEMORY_SIZE as u64), BreakpointOwner::User)
        .unwrap_err();
    assert!(matches!(error, DebuggerError::PartialCopy { transferred: 0, .. }));
    assert!(table.is_empty());
}

#[test]
fn test_temp_unpatch_keeps_record_until_repatched()
{
    let mut target = target();
    let mut table = BreakpointTable::new();
    let at = addr(CODE_BASE);

    table.set(&mut target, at, BreakpointOwner::User).unwrap();
    table.temp_unpatch(&mut target, at).unwrap();
    assert_eq!(raw(&mut target, CODE_BASE, 1), vec![0x55]);
    assert!(!table.is_patched(at));
    assert!(table.get(at).unwrap().locked);

    table.temp_patch(&mut target, at).unwrap();
    assert_eq!(raw(&mut target, CODE_BASE, 1), vec![0xCC]);
    assert!(!table.get(at).unwrap().locked);
}

#[test]
fn test_removing_lifted_breakpoint_erases_it_on_repatch()
{
    let mut target = target();
    let mut table = BreakpointTable::new();
    let at = addr(CODE_BASE);

    table.set(&mut target, at, BreakpointOwner::User).unwrap();
    table.temp_unpatch(&mut target, at).unwrap();

    table.remove(&mut target, at, BreakpointOwner::User).unwrap();
    assert!(table.get(at).is_some(), "a lifted record stays until it is put back");

    table.temp_patch(&mut target, at).unwrap();
    assert!(table.get(at).is_none());
    assert_eq!(raw(&mut target, CODE_BASE, 1), vec![0x55]);
}

#[test]
fn test_temp_unpatch_requires_a_breakpoint()
{
    let mut target = target();
    let mut table = BreakpointTable::new();

    let error = table.temp_unpatch(&mut target, addr(CODE_BASE)).unwrap_err();
    assert!(matches!(error, DebuggerError::NotFound(_)));
}

#[test]
fn test_read_clean_hides_traps()
{
    let mut target = target();
    let mut table = BreakpointTable::new();

    table.set(&mut target, addr(CODE_BASE), BreakpointOwner::User).unwrap();
    table.set(&mut target, addr(CODE_BASE + 5), BreakpointOwner::Stepper).unwrap();

    let clean = table.read_clean(&mut target, addr(CODE_BASE), CODE.len()).unwrap();
    assert_eq!(clean.data, CODE);
    assert!(clean.is_complete());

    // a read starting past a breakpoint is untouched by it
    let tail = table.read_clean(&mut target, addr(CODE_BASE + 1), 3).unwrap();
    assert_eq!(tail.data, vec![0x48, 0x89, 0xE5]);

    assert_eq!(raw(&mut target, CODE_BASE, 1), vec![0xCC]);
}

#[test]
fn test_read_clean_reports_unreadable_tail()
{
    let mut target = target();
    let table = BreakpointTable::new();
    let last = CODE_BASE + MEMORY_SIZE as u64 - 2;

    let read = table.read_clean(&mut target, addr(last), 8).unwrap();
    assert_eq!(read.data.len(), 2);
    assert_eq!(read.unreadable, 6);
}

#[test]
fn test_write_clean_updates_saved_byte_and_keeps_trap()
{
    let mut target = target();
    let mut table = BreakpointTable::new();
    let at = addr(CODE_BASE + 2);

    table.set(&mut target, at, BreakpointOwner::User).unwrap();

    let data = [0x11, 0x22, 0x33];
    let written = table.write_clean(&mut target, addr(CODE_BASE + 1), &data).unwrap();
    assert_eq!(written, 3);
    assert_eq!(data, [0x11, 0x22, 0x33]);

    assert_eq!(raw(&mut target, CODE_BASE + 1, 3), vec![0x11, 0xCC, 0x33]);
    assert_eq!(table.get(at).unwrap().original, 0x22);

    let clean = table.read_clean(&mut target, addr(CODE_BASE + 1), 3).unwrap();
    assert_eq!(clean.data, data);

    table.remove(&mut target, at, BreakpointOwner::User).unwrap();
    assert_eq!(raw(&mut target, CODE_BASE + 2, 1), vec![0x22]);
}

#[test]
fn test_write_clean_over_two_breakpoints_keeps_both_traps()
{
    let mut target = target();
    let mut table = BreakpointTable::new();
    let first = addr(CODE_BASE + 1);
    let second = addr(CODE_BASE + 3);

    table.set(&mut target, first, BreakpointOwner::User).unwrap();
    table.set(&mut target, second, BreakpointOwner::Stepper).unwrap();

    let clean = table.read_clean(&mut target, addr(CODE_BASE), 5).unwrap();
    assert_eq!(clean.data, &CODE[..5]);

    let data = [0x01, 0x02, 0x03, 0x04, 0x05];
    assert_eq!(table.write_clean(&mut target, addr(CODE_BASE), &data).unwrap(), 5);

    assert_eq!(raw(&mut target, CODE_BASE, 5), vec![0x01, 0xCC, 0x03, 0xCC, 0x05]);
    assert_eq!(table.get(first).unwrap().original, 0x02);
    assert_eq!(table.get(second).unwrap().original, 0x04);
    assert_eq!(table.read_clean(&mut target, addr(CODE_BASE), 5).unwrap().data, data);
}

#[test]
fn test_partial_write_commits_no_saved_byte()
{
    let mut target = target();
    let mut table = BreakpointTable::new();
    let last = CODE_BASE + MEMORY_SIZE as u64 - 1;

    table.set(&mut target, addr(last), BreakpointOwner::User).unwrap();
    let original = table.get(addr(last)).unwrap().original;

    let error = table.write_clean(&mut target, addr(last), &[0xAA, 0xBB]).unwrap_err();
    assert!(matches!(
        error,
        DebuggerError::PartialCopy {
            requested: 2,
            transferred: 1,
            ..
        }
    ));
    assert_eq!(table.get(addr(last)).unwrap().original, original);
    assert_eq!(raw(&mut target, last, 1), vec![0xCC]);
}

#[test]
fn test_detach_all_restores_every_byte()
{
    let mut target = target();
    let mut table = BreakpointTable::new();

    for offset in 0..CODE.len() as u64 {
        table.set(&mut target, addr(CODE_BASE + offset), BreakpointOwner::User).unwrap();
    }
    assert_eq!(raw(&mut target, CODE_BASE, CODE.len()), vec![0xCC; CODE.len()]);

    table.detach_all(&mut target);
    assert!(table.is_empty());
    assert_eq!(raw(&mut target, CODE_BASE, CODE.len()), CODE);
}
