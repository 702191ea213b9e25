//! Bit-exact packing and unpacking of instruction words.
//!
//! Every instruction is a single 32-bit word, MSB-first:
//!
//! ```text
//! | opcode: 8 | src_mode: 2 | src_addr: 10 | dest_mode: 2 | dest_addr: 10 |
//! ```

use std::fmt;

use pondlife_util::{Bit, BitSet};

use crate::ADDRESS_SIZE;

/// How an operand address resolves to a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressMode {
    /// `address` is a word index; the value is the word stored there.
    Normal,
    /// The accumulator; the address bits are ignored.
    Accumulator,
    /// The literal address field itself, `0..1023`.
    Literal,
    /// `i = word[address] mod 2^ADDRESS_SIZE`; the value is `word[i]`.
    Indirect,
}

impl AddressMode {
    fn from_bits(bits: u32) -> Self {
        match bits {
            0b00 => AddressMode::Normal,
            0b01 => AddressMode::Accumulator,
            0b10 => AddressMode::Literal,
            0b11 => AddressMode::Indirect,
            _ => unreachable!("2-bit field"),
        }
    }

    fn bits(self) -> u32 {
        match self {
            AddressMode::Normal => 0b00,
            AddressMode::Accumulator => 0b01,
            AddressMode::Literal => 0b10,
            AddressMode::Indirect => 0b11,
        }
    }
}

/// A decoded operand: its addressing mode and raw address field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operand {
    pub mode: AddressMode,
    pub addr: u16,
}

/// A decoded instruction word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: u8,
    pub src: Operand,
    pub dest: Operand,
}

impl Instruction {
    /// Decode a 32-bit word into its fields. Any opcode byte is accepted —
    /// unrecognized ones fold to NOOP in the interpreter, not here.
    pub fn decode(word: u32) -> Self {
        let opcode = word.bit_range(24, 31) as u8;
        let src = Operand {
            mode: AddressMode::from_bits(word.bit_range(22, 23)),
            addr: word.bit_range(12, 21) as u16,
        };
        let dest = Operand {
            mode: AddressMode::from_bits(word.bit_range(10, 11)),
            addr: word.bit_range(0, 9) as u16,
        };
        Instruction { opcode, src, dest }
    }

    /// Encode back into a 32-bit word. `encode(decode(w)) == w` for every
    /// `w` whose reserved bits (there are none) round-trip, and
    /// `decode(encode(i)) == i` for every `Instruction` built from 10-bit
    /// addresses.
    pub fn encode(self) -> u32 {
        0u32
            .set_bit_range(24, 31, self.opcode as u32)
            .set_bit_range(22, 23, self.src.mode.bits())
            .set_bit_range(12, 21, self.src.addr as u32)
            .set_bit_range(10, 11, self.dest.mode.bits())
            .set_bit_range(0, 9, self.dest.addr as u32)
    }

    /// Convenience constructor used by tests and embedders building raw
    /// programs without a text assembler (out of scope for this crate).
    pub fn new(
        opcode: u8,
        src_mode: AddressMode,
        src_addr: u16,
        dest_mode: AddressMode,
        dest_addr: u16,
    ) -> Self {
        Instruction {
            opcode,
            src: Operand { mode: src_mode, addr: src_addr & (ADDRESS_SIZE_MASK) },
            dest: Operand { mode: dest_mode, addr: dest_addr & (ADDRESS_SIZE_MASK) },
        }
    }
}

const ADDRESS_SIZE_MASK: u16 = (1 << ADDRESS_SIZE) - 1;

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "op={:#04x} src={:?}({}) dest={:?}({})",
            self.opcode, self.src.mode, self.src.addr, self.dest.mode, self.dest.addr
        )
    }
}
