//! The cell model: memory, soul, energy, access rules, checksum and colour
//! (spec.md §3).

use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{MEMORY_WORDS, WORD_BYTES};

/// A cell's program memory: `MEMORY_WORDS` big-endian-unsigned 32-bit words,
/// exclusively owned by the `Cell` that holds it.
#[derive(Clone)]
pub struct Memory(Box<[u32; MEMORY_WORDS]>);

impl Memory {
    pub fn zeroed() -> Self {
        Memory(Box::new([0u32; MEMORY_WORDS]))
    }

    pub fn read(&self, index: u16) -> u32 {
        self.0[index as usize]
    }

    pub fn write(&mut self, index: u16, value: u32) {
        self.0[index as usize] = value;
    }

    pub fn words(&self) -> &[u32; MEMORY_WORDS] {
        &self.0
    }

    /// Sum of the 1024 big-endian words, mod 2^32 (spec.md §3/§8 property 7).
    pub fn checksum(&self) -> u32 {
        self.0.iter().fold(0u32, |acc, &word| acc.wrapping_add(word))
    }

    /// Overwrite the first `count` words with `src`'s first `count` words.
    pub fn copy_prefix_from(&mut self, src: &Memory, count: usize) {
        self.0[..count].copy_from_slice(&src.0[..count]);
    }

    /// Raw 4096-byte binary image of memory (spec.md §6): each word stored
    /// big-endian, in index order.
    pub fn to_image(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(MEMORY_WORDS * WORD_BYTES);
        for word in self.0.iter() {
            bytes.extend_from_slice(&word.to_be_bytes());
        }
        bytes
    }

    fn from_image(bytes: &[u8]) -> Result<Self, ImageError> {
        let expected = MEMORY_WORDS * WORD_BYTES;
        if bytes.len() != expected {
            return Err(ImageError::WrongLength {
                expected,
                actual: bytes.len(),
            });
        }
        let mut words = [0u32; MEMORY_WORDS];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(WORD_BYTES)) {
            *word = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Ok(Memory(Box::new(words)))
    }

    fn random(rng: &mut impl RngCore) -> Self {
        let mut words = [0u32; MEMORY_WORDS];
        for word in words.iter_mut() {
            *word = rng.next_u32();
        }
        Memory(Box::new(words))
    }
}

/// Failure constructing a `Cell` from a raw binary image (spec.md §6).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ImageError {
    #[error("memory image must be exactly {expected} bytes, got {actual}")]
    WrongLength { expected: usize, actual: usize },
}

/// A 32-bit lineage identifier. Equality defines "soulmate" (spec.md
/// glossary).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Soul(pub u32);

impl Soul {
    pub fn random(rng: &mut impl RngCore) -> Self {
        Soul(rng.next_u32())
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

/// One grid site: program memory, energy, and optional lineage.
#[derive(Clone)]
pub struct Cell {
    pub memory: Memory,
    pub soul: Option<Soul>,
    pub energy: u32,
    pub inanimate: bool,
}

impl Default for Cell {
    fn default() -> Self {
        Cell {
            memory: Memory::zeroed(),
            soul: None,
            energy: 0,
            inanimate: false,
        }
    }
}

impl Cell {
    pub fn new(energy: u32, soul: Option<Soul>) -> Self {
        Cell {
            memory: Memory::zeroed(),
            soul,
            energy,
            inanimate: false,
        }
    }

    /// A living cell with random memory and a fresh soul, as struck by
    /// lightning (`original_source/pond.py::Pond.lightning`).
    pub fn random(energy: u32, soul: Soul, rng: &mut impl RngCore) -> Self {
        Cell {
            memory: Memory::random(rng),
            soul: Some(soul),
            energy,
            inanimate: false,
        }
    }

    pub fn sun() -> Self {
        Cell {
            memory: Memory::zeroed(),
            soul: None,
            energy: 0,
            inanimate: true,
        }
    }

    /// Construct a cell's memory from the raw binary instruction format
    /// (spec.md §6): a 4096-byte buffer, no header.
    pub fn from_image(bytes: &[u8], energy: u32, soul: Option<Soul>) -> Result<Self, ImageError> {
        Ok(Cell {
            memory: Memory::from_image(bytes)?,
            soul,
            energy,
            inanimate: false,
        })
    }

    pub fn alive(&self) -> bool {
        !self.inanimate && self.soul.is_some()
    }

    pub fn checksum(&self) -> u32 {
        self.memory.checksum()
    }

    /// The 4 bytes of the checksum, big-endian.
    pub fn colour(&self) -> [u8; 4] {
        self.checksum().to_be_bytes()
    }

    /// A cell may be written to by `other` iff it is not alive, or shares
    /// `other`'s soul (spec.md §3).
    pub fn can_access(&self, other_soul: Option<Soul>) -> bool {
        !self.alive() || self.soul == other_soul
    }
}
