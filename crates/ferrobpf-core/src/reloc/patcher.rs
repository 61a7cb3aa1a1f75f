//! In-place rewriting of relocated instructions.
//!
//! Which operand receives the value depends on the instruction:
//!
//! | Instruction            | Patched operand            |
//! |------------------------|----------------------------|
//! | ALU/ALU64 with imm     | `imm` (must fit `i32`)     |
//! | LDX / ST / STX         | `off` (must fit `i16`)     |
//! | `ld_imm64`             | `imm` of both slots        |
//!
//! Anything else is rejected.

use crate::error::{LoaderError, LoaderResult};
use crate::insn::Instruction;
use crate::program::{ProgramImage, ProgramState};

/// Write `value` into the operand of instruction `insn`.
///
/// When `expected` is given, the operand must currently hold that value (the
/// one the compiler computed against its own type layout) or the patch is
/// refused.
///
/// ## Errors
///
/// - `InvalidState` if the image is past the relocation stage
/// - `InvalidInstruction` for out-of-range indices or unpatchable opcodes
/// - `UnexpectedValue` if the operand does not hold `expected`
/// - `ValueOverflow` if `value` does not fit the operand
pub fn patch(image: &mut ProgramImage, insn: usize, value: i64, expected: Option<i64>) -> LoaderResult<()>
{
    if *image.state() != ProgramState::Raw {
        return Err(LoaderError::InvalidState {
            program: image.name().to_string(),
            from: image.state().to_string(),
            to: "patched".to_string(),
        });
    }

    let slots = image.insns_mut();
    let current = *slots.get(insn).ok_or_else(|| LoaderError::InvalidInstruction {
        index: insn,
        reason: format!("out of range for a program of {} slots", slots.len()),
    })?;

    if current.is_ld_imm64() {
        let high = slots
            .get(insn + 1)
            .copied()
            .filter(|next| next.code == 0)
            .ok_or_else(|| LoaderError::InvalidInstruction {
                index: insn,
                reason: "ld_imm64 without its second slot".to_string(),
            })?;
        let found = ((u64::from(high.imm as u32) << 32) | u64::from(current.imm as u32)) as i64;
        check_expected(insn, expected, found)?;

        let [low, high] = Instruction::ld_imm64(current.dst_reg, current.src_reg, value as u64);
        slots[insn].imm = low.imm;
        slots[insn + 1].imm = high.imm;
    } else if current.is_alu_imm() {
        check_expected(insn, expected, i64::from(current.imm))?;
        slots[insn].imm = i32::try_from(value).map_err(|_| LoaderError::ValueOverflow { insn, value })?;
    } else if current.is_memory_access() {
        check_expected(insn, expected, i64::from(current.off))?;
        slots[insn].off = i16::try_from(value).map_err(|_| LoaderError::ValueOverflow { insn, value })?;
    } else {
        return Err(LoaderError::InvalidInstruction {
            index: insn,
            reason: format!("cannot relocate {current}"),
        });
    }
    Ok(())
}

fn check_expected(insn: usize, expected: Option<i64>, found: i64) -> LoaderResult<()>
{
    match expected {
        Some(expected) if expected != found => Err(LoaderError::UnexpectedValue { insn, expected, found }),
        _ => Ok(()),
    }
}
