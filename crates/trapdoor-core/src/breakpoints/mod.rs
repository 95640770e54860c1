//! # Breakpoint Table
//!
//! Software breakpoint bookkeeping for one debugged process.
//!
//! The table is the only thing that ever writes the trap byte (`0xCC`) into
//! the debuggee. Several parties can want a trap at the same address at once:
//! the client (a *user* breakpoint) and any number of in-flight steppers
//! (temporary landing breakpoints). Each [`Breakpoint`] tracks who holds it
//! and is patched into memory exactly while someone does.
//!
//! ## Lifecycle
//!
//! 1. [`BreakpointTable::set`]: the first holder creates the record and
//!    patches the trap in.
//! 2. [`BreakpointTable::temp_unpatch`] / [`BreakpointTable::temp_patch`]:
//!    a thread sitting on a breakpoint executes the original instruction
//!    with the trap lifted. While lifted the record is *locked* and survives
//!    even if its last holder goes away.
//! 3. [`BreakpointTable::remove`]: the last holder unpatches and erases it.
//!
//! Steppers refer to breakpoints by address only; records are owned here.
//!
//! Reads and writes of debuggee memory on behalf of the client go through
//! [`BreakpointTable::read_clean`] and [`BreakpointTable::write_clean`] (see
//! [`memory`]) so the trap bytes stay invisible outside this module.

pub mod memory;

use std::collections::BTreeMap;

use tracing::{debug, trace};

use crate::decode::BREAKPOINT_OPCODE;
use crate::error::{DebuggerError, Result};
use crate::target::ProcessTarget;
use crate::types::Address;

/// Who is asking for a breakpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakpointOwner
{
    /// The client
    User,
    /// A stepper's temporary landing breakpoint
    Stepper,
}

/// One patched (or about to be patched) address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint
{
    /// Address of the trap byte
    pub address: Address,
    /// The debuggee's own byte at `address`, valid while `patched`
    pub original: u8,
    /// Replacement for `original` staged by a clean write, committed once the write succeeds
    pub scratch: u8,
    /// Whether the trap byte is currently in memory
    pub patched: bool,
    /// Whether the client set this breakpoint
    pub user: bool,
    /// Number of in-flight steppers using this address
    pub stepper_count: u32,
    /// Temporarily lifted while a thread executes the original instruction
    pub locked: bool,
}

impl Breakpoint
{
    fn new(address: Address) -> Self
    {
        Self {
            address,
            original: 0,
            scratch: 0,
            patched: false,
            user: false,
            stepper_count: 0,
            locked: false,
        }
    }

    /// Whether anyone still wants this breakpoint.
    #[must_use]
    pub fn is_active(&self) -> bool
    {
        self.user || self.stepper_count > 0 || self.locked
    }

    fn hold(&mut self, owner: BreakpointOwner)
    {
        match owner {
            BreakpointOwner::User => self.user = true,
            BreakpointOwner::Stepper => self.stepper_count += 1,
        }
    }

    fn release(&mut self, owner: BreakpointOwner)
    {
        match owner {
            BreakpointOwner::User => self.user = false,
            BreakpointOwner::Stepper => self.stepper_count = self.stepper_count.saturating_sub(1),
        }
    }
}

/// Address-keyed table of every breakpoint in one process
///
/// All methods that touch memory take the process's [`ProcessTarget`]; the
/// table itself holds no OS resources.
///
/// ## Example
///
/// ```rust,ignore
/// let mut table = BreakpointTable::new();
/// table.set(&mut target, Address::new(0x401000), BreakpointOwner::User)?;
/// assert!(table.is_patched(Address::new(0x401000)));
///
/// // the debuggee's byte, not the trap
/// let clean = table.read_clean(&mut target, Address::new(0x401000), 1)?;
/// ```
#[derive(Debug, Default)]
pub struct BreakpointTable
{
    breakpoints: BTreeMap<Address, Breakpoint>,
}

impl BreakpointTable
{
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Take a hold on the breakpoint at `address`, patching it in if it was inactive
    ///
    /// Setting a user breakpoint that is already set is a no-op for the
    /// `user` flag. Stepper holds are counted.
    ///
    /// ## Errors
    ///
    /// Memory errors from the read of the original byte or the write of the
    /// trap. On error the table is left exactly as it was.
    pub fn set(&mut self, target: &mut dyn ProcessTarget, address: Address, owner: BreakpointOwner) -> Result<()>
    {
        // records in the table are always active; a lifted one is patched again by temp_patch
        if let Some(bp) = self.breakpoints.get_mut(&address) {
            bp.hold(owner);
            return Ok(());
        }

        let mut bp = Breakpoint::new(address);
        bp.hold(owner);
        patch(target, &mut bp)?;

        debug!(address = %address, ?owner, "Breakpoint patched");
        self.breakpoints.insert(address, bp);
        Ok(())
    }

    /// Drop a hold on the breakpoint at `address`
    ///
    /// Unpatches and erases the record once nobody holds it, unless it is
    /// locked by a temporary unpatch. Removing an address with no breakpoint
    /// is not an error.
    ///
    /// ## Errors
    ///
    /// Memory errors from restoring the original byte. The hold is given
    /// back in that case.
    pub fn remove(&mut self, target: &mut dyn ProcessTarget, address: Address, owner: BreakpointOwner) -> Result<()>
    {
        let Some(bp) = self.breakpoints.get_mut(&address) else {
            return Ok(());
        };

        let before = bp.clone();
        bp.release(owner);
        if bp.is_active() {
            return Ok(());
        }

        if let Err(error) = unpatch(target, bp) {
            *bp = before;
            return Err(error);
        }

        debug!(address = %address, ?owner, "Breakpoint removed");
        self.breakpoints.remove(&address);
        Ok(())
    }

    /// Lift the trap at `address` so the original instruction can run
    ///
    /// The record is locked until [`BreakpointTable::temp_patch`] so it is
    /// not erased while lifted.
    ///
    /// ## Errors
    ///
    /// [`DebuggerError::NotFound`] if there is no breakpoint at `address`,
    /// otherwise memory errors from the unpatch.
    pub fn temp_unpatch(&mut self, target: &mut dyn ProcessTarget, address: Address) -> Result<()>
    {
        let bp = self
            .breakpoints
            .get_mut(&address)
            .ok_or_else(|| DebuggerError::NotFound(format!("breakpoint at {address}")))?;

        unpatch(target, bp)?;
        bp.locked = true;
        trace!(address = %address, "Breakpoint lifted");
        Ok(())
    }

    /// Put back a trap lifted by [`BreakpointTable::temp_unpatch`]
    ///
    /// If every holder went away meanwhile, the record is erased instead.
    ///
    /// ## Errors
    ///
    /// Memory errors from the re-patch.
    pub fn temp_patch(&mut self, target: &mut dyn ProcessTarget, address: Address) -> Result<()>
    {
        let Some(bp) = self.breakpoints.get_mut(&address) else {
            return Ok(());
        };

        bp.locked = false;
        if bp.is_active() {
            if let Err(error) = patch(target, bp) {
                bp.locked = true;
                return Err(error);
            }
            trace!(address = %address, "Breakpoint restored");
        } else {
            self.breakpoints.remove(&address);
        }
        Ok(())
    }

    /// Unpatch every breakpoint and forget them all
    ///
    /// Best effort: an address that cannot be restored is logged and skipped.
    pub fn detach_all(&mut self, target: &mut dyn ProcessTarget)
    {
        for bp in self.breakpoints.values_mut() {
            if let Err(error) = unpatch(target, bp) {
                tracing::warn!(address = %bp.address, %error, "Failed to restore breakpoint on detach");
            }
        }
        self.breakpoints.clear();
    }

    /// The record at `address`, if any.
    #[must_use]
    pub fn get(&self, address: Address) -> Option<&Breakpoint>
    {
        self.breakpoints.get(&address)
    }

    /// Whether the trap byte is currently written at `address`.
    #[must_use]
    pub fn is_patched(&self, address: Address) -> bool
    {
        self.breakpoints.get(&address).is_some_and(|bp| bp.patched)
    }

    /// Whether the client holds a breakpoint at `address`.
    #[must_use]
    pub fn is_user(&self, address: Address) -> bool
    {
        self.breakpoints.get(&address).is_some_and(|bp| bp.user)
    }

    /// Whether anyone holds a breakpoint at `address`.
    #[must_use]
    pub fn is_active(&self, address: Address) -> bool
    {
        self.breakpoints.get(&address).is_some_and(Breakpoint::is_active)
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize
    {
        self.breakpoints.len()
    }

    /// Whether the table has no records.
    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.breakpoints.is_empty()
    }

    /// Records in address order.
    pub fn iter(&self) -> impl Iterator<Item = &Breakpoint>
    {
        self.breakpoints.values()
    }

    /// Patched records with `begin <= address < begin + len`.
    pub(crate) fn patched_in(&self, begin: Address, len: usize) -> impl Iterator<Item = &Breakpoint>
    {
        let end = begin.saturating_add(len as u64);
        self.breakpoints.range(begin..end).map(|(_, bp)| bp).filter(|bp| bp.patched)
    }

    pub(crate) fn patched_in_mut(&mut self, begin: Address, len: usize) -> impl Iterator<Item = &mut Breakpoint>
    {
        let end = begin.saturating_add(len as u64);
        self.breakpoints.range_mut(begin..end).map(|(_, bp)| bp).filter(|bp| bp.patched)
    }
}

/// Save the original byte and write the trap.
fn patch(target: &mut dyn ProcessTarget, bp: &mut Breakpoint) -> Result<()>
{
    if bp.patched {
        return Ok(());
    }

    let read = target.read_memory(bp.address, 1)?;
    let Some(&original) = read.data.first() else {
        return Err(DebuggerError::PartialCopy {
            address: bp.address,
            requested: 1,
            transferred: 0,
        });
    };

    write_byte(target, bp.address, BREAKPOINT_OPCODE)?;

    bp.original = original;
    bp.patched = true;
    Ok(())
}

/// Write the original byte back.
fn unpatch(target: &mut dyn ProcessTarget, bp: &mut Breakpoint) -> Result<()>
{
    if !bp.patched {
        return Ok(());
    }

    write_byte(target, bp.address, bp.original)?;
    bp.patched = false;
    Ok(())
}

fn write_byte(target: &mut dyn ProcessTarget, address: Address, byte: u8) -> Result<()>
{
    let written = target.write_memory(address, &[byte])?;
    if written != 1 {
        return Err(DebuggerError::PartialCopy {
            address,
            requested: 1,
            transferred: written,
        });
    }
    target.flush_instruction_cache(address, 1)
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_breakpoint_activity()
    {
        let mut bp = Breakpoint::new(Address::new(0x1000));
        assert!(!bp.is_active());

        bp.hold(BreakpointOwner::Stepper);
        bp.hold(BreakpointOwner::Stepper);
        bp.release(BreakpointOwner::Stepper);
        assert!(bp.is_active());

        bp.release(BreakpointOwner::Stepper);
        assert!(!bp.is_active());

        bp.locked = true;
        assert!(bp.is_active());
    }

    #[test]
    fn test_user_hold_is_not_counted()
    {
        let mut bp = Breakpoint::new(Address::new(0x1000));
        bp.hold(BreakpointOwner::User);
        bp.hold(BreakpointOwner::User);
        bp.release(BreakpointOwner::User);
        assert!(!bp.is_active());
    }
}
