//! eBPF instruction encoding.
//!
//! Every instruction is 8 bytes: opcode, a register byte holding the
//! destination and source nibbles, a signed 16-bit offset and a signed 32-bit
//! immediate. `ld_imm64` is the only two-slot instruction; its second slot
//! carries the upper half of the 64-bit immediate.

use std::fmt;

use object::{Endian, Endianness};

use crate::error::{LoaderError, LoaderResult};

/// Size of one instruction slot in bytes.
pub const INSN_SIZE: usize = 8;

pub const BPF_LD: u8 = 0x00;
pub const BPF_LDX: u8 = 0x01;
pub const BPF_ST: u8 = 0x02;
pub const BPF_STX: u8 = 0x03;
pub const BPF_ALU: u8 = 0x04;
pub const BPF_JMP: u8 = 0x05;
pub const BPF_JMP32: u8 = 0x06;
pub const BPF_ALU64: u8 = 0x07;

pub const BPF_K: u8 = 0x00;
pub const BPF_X: u8 = 0x08;

pub const BPF_W: u8 = 0x00;
pub const BPF_H: u8 = 0x08;
pub const BPF_B: u8 = 0x10;
pub const BPF_DW: u8 = 0x18;

pub const BPF_IMM: u8 = 0x00;
pub const BPF_MEM: u8 = 0x60;

pub const BPF_MOV: u8 = 0xb0;
pub const BPF_CALL: u8 = 0x80;
pub const BPF_EXIT: u8 = 0x90;

/// `src_reg` of an `ld_imm64` whose immediate is a map file descriptor.
pub const BPF_PSEUDO_MAP_FD: u8 = 1;
/// `src_reg` of a call to another BPF function in the same object.
pub const BPF_PSEUDO_CALL: u8 = 1;

/// Opcode of `ld_imm64`.
pub const LD_IMM64: u8 = BPF_LD | BPF_DW | BPF_IMM;
/// Opcode of a helper call.
pub const CALL: u8 = BPF_JMP | BPF_CALL;

/// One decoded instruction slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Instruction
{
    pub code: u8,
    pub dst_reg: u8,
    pub src_reg: u8,
    pub off: i16,
    pub imm: i32,
}

impl Instruction
{
    #[must_use]
    pub const fn new(code: u8, dst_reg: u8, src_reg: u8, off: i16, imm: i32) -> Self
    {
        Self {
            code,
            dst_reg,
            src_reg,
            off,
            imm,
        }
    }

    /// `call imm` to a helper id.
    #[must_use]
    pub const fn call(id: i32) -> Self
    {
        Self::new(CALL, 0, 0, 0, id)
    }

    #[must_use]
    pub const fn exit() -> Self
    {
        Self::new(BPF_JMP | BPF_EXIT, 0, 0, 0, 0)
    }

    /// `dst = imm` (64-bit move).
    #[must_use]
    pub const fn mov64_imm(dst: u8, imm: i32) -> Self
    {
        Self::new(BPF_ALU64 | BPF_MOV | BPF_K, dst, 0, 0, imm)
    }

    /// `dst = *(size *)(src + off)`.
    #[must_use]
    pub const fn load(size: u8, dst: u8, src: u8, off: i16) -> Self
    {
        Self::new(BPF_LDX | BPF_MEM | size, dst, src, off, 0)
    }

    /// Both slots of `dst = imm64`.
    #[must_use]
    pub const fn ld_imm64(dst: u8, src: u8, value: u64) -> [Self; 2]
    {
        [
            Self::new(LD_IMM64, dst, src, 0, value as u32 as i32),
            Self::new(0, 0, 0, 0, (value >> 32) as u32 as i32),
        ]
    }

    /// Instruction class (low three opcode bits).
    #[must_use]
    pub const fn class(&self) -> u8
    {
        self.code & 0x07
    }

    #[must_use]
    pub const fn is_call(&self) -> bool
    {
        self.code == CALL
    }

    #[must_use]
    pub const fn is_ld_imm64(&self) -> bool
    {
        self.code == LD_IMM64
    }

    /// ALU/ALU64 operation with an immediate operand.
    #[must_use]
    pub const fn is_alu_imm(&self) -> bool
    {
        matches!(self.class(), BPF_ALU | BPF_ALU64) && self.code & BPF_X == BPF_K
    }

    /// Load or store through a register plus offset.
    #[must_use]
    pub const fn is_memory_access(&self) -> bool
    {
        matches!(self.class(), BPF_LDX | BPF_ST | BPF_STX)
    }

    /// Decode one slot.
    #[must_use]
    pub fn from_bytes(bytes: [u8; INSN_SIZE], endian: Endianness) -> Self
    {
        let (dst_reg, src_reg) = if endian.is_little_endian() {
            (bytes[1] & 0x0f, bytes[1] >> 4)
        } else {
            (bytes[1] >> 4, bytes[1] & 0x0f)
        };
        Self {
            code: bytes[0],
            dst_reg,
            src_reg,
            off: endian.read_u16_bytes([bytes[2], bytes[3]]) as i16,
            imm: endian.read_u32_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as i32,
        }
    }

    /// Encode one slot.
    #[must_use]
    pub fn to_bytes(&self, endian: Endianness) -> [u8; INSN_SIZE]
    {
        let regs = if endian.is_little_endian() {
            (self.src_reg << 4) | (self.dst_reg & 0x0f)
        } else {
            (self.dst_reg << 4) | (self.src_reg & 0x0f)
        };
        let off = endian.write_u16_bytes(self.off as u16);
        let imm = endian.write_u32_bytes(self.imm as u32);
        [self.code, regs, off[0], off[1], imm[0], imm[1], imm[2], imm[3]]
    }
}

impl fmt::Display for Instruction
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(
            f,
            "code=0x{:02x} dst=r{} src=r{} off={} imm={}",
            self.code, self.dst_reg, self.src_reg, self.off, self.imm
        )
    }
}

/// Decode a byte stream into instruction slots.
///
/// ## Errors
///
/// `Parse` if the length is not a multiple of [`INSN_SIZE`].
pub fn decode_all(bytes: &[u8], endian: Endianness) -> LoaderResult<Vec<Instruction>>
{
    if bytes.len() % INSN_SIZE != 0 {
        return Err(LoaderError::parse(
            "instruction stream",
            format!("{} bytes is not a multiple of {INSN_SIZE}", bytes.len()),
        ));
    }
    Ok(bytes
        .chunks_exact(INSN_SIZE)
        .map(|chunk| {
            let mut slot = [0u8; INSN_SIZE];
            slot.copy_from_slice(chunk);
            Instruction::from_bytes(slot, endian)
        })
        .collect())
}

/// Encode instruction slots back into bytes.
#[must_use]
pub fn encode_all(insns: &[Instruction], endian: Endianness) -> Vec<u8>
{
    insns.iter().flat_map(|insn| insn.to_bytes(endian)).collect()
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_register_nibbles_follow_byte_order()
    {
        let insn = Instruction::new(LD_IMM64, 1, 2, -4, 7);
        let little = insn.to_bytes(Endianness::Little);
        assert_eq!(little[1], 0x21);
        let big = insn.to_bytes(Endianness::Big);
        assert_eq!(big[1], 0x12);
        assert_eq!(Instruction::from_bytes(big, Endianness::Big), insn);
    }

    #[test]
    fn test_classification()
    {
        assert!(Instruction::call(1).is_call());
        assert!(Instruction::mov64_imm(0, 4).is_alu_imm());
        assert!(Instruction::load(BPF_W, 0, 1, 4).is_memory_access());
        assert!(Instruction::ld_imm64(1, 0, 0)[0].is_ld_imm64());
        assert!(!Instruction::exit().is_alu_imm());
    }

    #[test]
    fn test_decode_rejects_partial_slot()
    {
        assert!(decode_all(&[0u8; 12], Endianness::Little).is_err());
        let insns = decode_all(&encode_all(&[Instruction::exit()], Endianness::Little), Endianness::Little).unwrap();
        assert_eq!(insns, vec![Instruction::exit()]);
    }

    #[test]
    fn test_ld_imm64_splits_value()
    {
        let [lo, hi] = Instruction::ld_imm64(2, 0, 0x1122_3344_5566_7788);
        assert_eq!(lo.imm as u32, 0x5566_7788);
        assert_eq!(hi.imm as u32, 0x1122_3344);
    }
}
