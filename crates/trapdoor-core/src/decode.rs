//! # Instruction Classifier
//!
//! Just enough x86 / x86-64 decoding for stepping: the category of the
//! instruction at an address and, for the categories steppers care about,
//! its exact length.
//!
//! Steppers place landing breakpoints at `address + length`, so a wrong
//! length desynchronises every step over a call or a REP-string instruction.
//! Everything else is reported as [`InstructionCategory::Other`] with a
//! length of `0` (not computed), and is always single-stepped.
//!
//! ## Input
//!
//! The bytes passed in must already be *clean* (see
//! [`BreakpointTable::read_clean`](crate::breakpoints::BreakpointTable::read_clean)):
//! a `0xCC` in the buffer is taken to be a real trap instruction.
//!
//! ## References
//!
//! - Intel SDM Vol. 2, 2.1 "Instruction Format for Protected Mode, Real-Address Mode, and Virtual-8086 Mode"
//! - Intel SDM Vol. 2, 2.2.1 "REX Prefixes"

use crate::types::CpuMode;

/// Longest legal x86 instruction, in bytes.
pub const MAX_INSTRUCTION_LEN: usize = 15;

/// The one-byte `INT3` trap instruction.
pub const BREAKPOINT_OPCODE: u8 = 0xCC;

/// What an instruction does, as far as stepping is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstructionCategory
{
    /// `INT3`
    Breakpoint,
    /// Near or far call, direct or indirect
    Call,
    /// Unconditional jump, direct or indirect
    Jmp,
    /// String instruction with a `REP`/`REPE`/`REPNE` prefix
    RepString,
    /// `SYSCALL` or `SYSENTER`
    Syscall,
    /// Anything else
    Other,
}

/// A classified instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Instruction
{
    /// Stepping category
    pub category: InstructionCategory,
    /// Length in bytes including prefixes; `0` for [`InstructionCategory::Other`]
    pub length: usize,
}

impl Instruction
{
    /// Length as an address offset.
    #[must_use]
    pub fn len_u64(&self) -> u64
    {
        self.length as u64
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Prefixes
{
    address_size: bool,
    operand_size: bool,
    repne: bool,
    rep: bool,
}

/// Classify the instruction at the start of `bytes`
///
/// At most [`MAX_INSTRUCTION_LEN`] bytes are examined. Returns `None` when
/// the available bytes run out before the category and length are known
/// (prefixes only, a missing ModRM/SIB byte, or a computed length longer
/// than the input).
///
/// ## Example
///
/// ```rust
/// use trapdoor_core::decode::{classify, InstructionCategory};
/// use trapdoor_core::types::CpuMode;
///
/// let call = classify(&[0xE8, 0x00, 0x00, 0x00, 0x00], CpuMode::Bits32).unwrap();
/// assert_eq!(call.category, InstructionCategory::Call);
/// assert_eq!(call.length, 5);
///
/// assert!(classify(&[0xE8, 0x00], CpuMode::Bits32).is_none());
/// ```
#[must_use]
pub fn classify(bytes: &[u8], mode: CpuMode) -> Option<Instruction>
{
    let bytes = &bytes[..bytes.len().min(MAX_INSTRUCTION_LEN)];

    let (prefixes, prefix_len) = read_prefixes(bytes, mode);
    if prefix_len >= bytes.len() {
        return None;
    }

    let body = &bytes[prefix_len..];
    let (category, body_len) = classify_body(body, prefixes, mode)?;

    let length = if category == InstructionCategory::Other {
        0
    } else {
        prefix_len + body_len
    };

    if length > bytes.len() {
        return None;
    }

    Some(Instruction { category, length })
}

fn read_prefixes(bytes: &[u8], mode: CpuMode) -> (Prefixes, usize)
{
    let mut prefixes = Prefixes::default();

    for (i, &byte) in bytes.iter().enumerate() {
        match byte {
            0x67 => prefixes.address_size = true,
            0x66 => prefixes.operand_size = true,
            0xF2 => prefixes.repne = true,
            0xF3 => prefixes.rep = true,
            // lock and segment overrides don't affect anything we compute
            0xF0 | 0x2E | 0x3E | 0x26 | 0x64 | 0x65 | 0x36 => {}
            0x40..=0x4F if mode == CpuMode::Bits64 => {}
            _ => return (prefixes, i),
        }
    }

    (prefixes, bytes.len())
}

/// Category and length (excluding prefixes) of the opcode at `body[0]`.
fn classify_body(body: &[u8], prefixes: Prefixes, mode: CpuMode) -> Option<(InstructionCategory, usize)>
{
    let short_operand = prefixes.operand_size && mode == CpuMode::Bits32;

    let classified = match body[0] {
        0xCC => (InstructionCategory::Breakpoint, 1),

        0xE8 => (InstructionCategory::Call, if short_operand { 3 } else { 5 }),
        0x9A if mode == CpuMode::Bits32 => (InstructionCategory::Call, if prefixes.operand_size { 5 } else { 7 }),

        0xFF => {
            let modrm = *body.get(1)?;
            let category = match (modrm >> 3) & 7 {
                2 | 3 => InstructionCategory::Call,
                4 | 5 => InstructionCategory::Jmp,
                _ => return Some((InstructionCategory::Other, 0)),
            };
            let modrm_len = if mode == CpuMode::Bits32 && prefixes.address_size {
                modrm_len16(modrm)
            } else {
                modrm_len32(modrm, body.get(2).copied())?
            };
            (category, 1 + modrm_len)
        }

        0xEB => (InstructionCategory::Jmp, 2),
        0xE9 => (InstructionCategory::Jmp, if short_operand { 3 } else { 5 }),
        0xEA if mode == CpuMode::Bits32 => (InstructionCategory::Jmp, if prefixes.operand_size { 5 } else { 7 }),

        0x0F => match *body.get(1)? {
            0x05 | 0x34 => (InstructionCategory::Syscall, 2),
            _ => (InstructionCategory::Other, 0),
        },

        opcode if prefixes.repne && matches!(opcode, 0xA6 | 0xA7 | 0xAE | 0xAF) => {
            (InstructionCategory::RepString, 1)
        }
        opcode if prefixes.rep && matches!(opcode, 0x6C..=0x6F | 0xA4..=0xA7 | 0xAA..=0xAF) => {
            (InstructionCategory::RepString, 1)
        }

        _ => (InstructionCategory::Other, 0),
    };

    Some(classified)
}

/// Bytes taken by a 16-bit ModRM byte and its displacement.
fn modrm_len16(modrm: u8) -> usize
{
    let md = (modrm >> 6) & 3;
    let rm = modrm & 7;

    match md {
        0 if rm == 6 => 3,
        0 | 3 => 1,
        1 => 2,
        _ => 3,
    }
}

/// Bytes taken by a 32/64-bit ModRM byte, its SIB byte and its displacement.
///
/// `sib` is the byte following the ModRM byte, if one was available.
fn modrm_len32(modrm: u8, sib: Option<u8>) -> Option<usize>
{
    let md = (modrm >> 6) & 3;
    let rm = modrm & 7;

    if md == 3 {
        return Some(1);
    }

    let mut len = 1;

    if rm == 4 {
        len += 1;
        // SIB with base = 101b and mod = 00 means disp32 with no base register
        if md == 0 && sib? & 7 == 5 {
            len += 4;
        }
    }

    match md {
        1 => len += 1,
        2 => len += 4,
        _ if rm == 5 => len += 4,
        _ => {}
    }

    Some(len)
}
