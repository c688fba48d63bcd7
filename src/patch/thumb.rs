//! Thumb-2 instruction encoders for building patch descriptors
//!
//! Wide (32-bit) Thumb instructions are stored as two little-endian halfwords, first halfword first.

/// Core registers usable as a destination
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::missing_docs_in_private_items, missing_docs)]
pub enum Register {
    R0 = 0,
    R1,
    R2,
    R3,
    R4,
    R5,
    R6,
    R7,
    R8,
    R9,
    R10,
    R11,
    R12,
    Sp,
    Lr,
    Pc,
}

/// Lays out a wide instruction's two halfwords in memory order
const fn wide(hw1: u16, hw2: u16) -> [u8; 4] {
    let hw1 = hw1.to_le_bytes();
    let hw2 = hw2.to_le_bytes();
    [hw1[0], hw1[1], hw2[0], hw2[1]]
}

/// `nop.w`
pub const fn nop_w() -> [u8; 4] {
    wide(0xF3AF, 0x8000)
}

/// `movw rd, #imm16` (encoding T3)
pub const fn movw(rd: Register, imm16: u16) -> [u8; 4] {
    let imm4 = (imm16 >> 12) & 0xF;
    let i = (imm16 >> 11) & 0x1;
    let imm3 = (imm16 >> 8) & 0x7;
    let imm8 = imm16 & 0xFF;
    wide(
        0xF240 | (i << 10) | imm4,
        (imm3 << 12) | ((rd as u16) << 8) | imm8,
    )
}
