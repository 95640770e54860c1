//! # Clean Memory Access
//!
//! Debuggee memory as the program itself would see it: every byte the
//! breakpoint table replaced with a trap reads back as the debuggee's own
//! byte, and writes over a breakpoint update the saved byte while leaving the
//! trap in place.

use tracing::trace;

use super::BreakpointTable;
use crate::decode::BREAKPOINT_OPCODE;
use crate::error::{DebuggerError, Result};
use crate::target::{MemoryRead, ProcessTarget};
use crate::types::Address;

impl BreakpointTable
{
    /// Read debuggee memory with breakpoint bytes replaced by their originals
    ///
    /// Behaves like [`ProcessTarget::read_memory`]: the readable prefix is
    /// returned and the rest is counted in [`MemoryRead::unreadable`].
    ///
    /// ## Errors
    ///
    /// OS errors from the raw read.
    pub fn read_clean(&self, target: &mut dyn ProcessTarget, address: Address, len: usize) -> Result<MemoryRead>
    {
        let mut read = target.read_memory(address, len)?;

        for bp in self.patched_in(address, read.data.len()) {
            if let Some(offset) = bp.address.offset_from(address) {
                read.data[offset as usize] = bp.original;
            }
        }

        trace!(address = %address, len, unreadable = read.unreadable, "Clean read");
        Ok(read)
    }

    /// Write debuggee memory without disturbing breakpoints
    ///
    /// Bytes landing on a patched breakpoint become that breakpoint's saved
    /// original and the trap stays in memory. `data` itself is not modified.
    ///
    /// ## Errors
    ///
    /// OS errors from the raw write, or [`DebuggerError::PartialCopy`] when
    /// fewer than `data.len()` bytes were written. In either case no saved
    /// original byte is changed.
    pub fn write_clean(&mut self, target: &mut dyn ProcessTarget, address: Address, data: &[u8]) -> Result<usize>
    {
        let mut patched = data.to_vec();
        for bp in self.patched_in_mut(address, data.len()) {
            if let Some(offset) = bp.address.offset_from(address) {
                let offset = offset as usize;
                bp.scratch = data[offset];
                patched[offset] = BREAKPOINT_OPCODE;
            }
        }

        let written = target.write_memory(address, &patched)?;
        if written != data.len() {
            return Err(DebuggerError::PartialCopy {
                address,
                requested: data.len(),
                transferred: written,
            });
        }

        for bp in self.patched_in_mut(address, data.len()) {
            bp.original = bp.scratch;
        }
        target.flush_instruction_cache(address, data.len())?;

        trace!(address = %address, len = data.len(), "Clean write");
        Ok(written)
    }
}
