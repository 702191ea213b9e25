//! The per-cell interpreter: fetch-decode-execute, addressing modes, energy
//! accounting, and the suspension protocol (spec.md §3/§4).
//!
//! Modeled on the teacher's `Cpu` (`cpu/mod.rs`): a dense `match` over the
//! opcode byte in `exec()`, state fields borrowed for the duration of one
//! invocation rather than owned by the thing it executes on (Design Notes
//! §9, "break the cyclic ownership" between pond, interpreter and cell).

use std::collections::HashMap;
use std::f64::consts::{E, PI};

use rand::{RngCore, SeedableRng};
use rand_pcg::Pcg64;

use crate::arith;
use crate::cell::{Memory, Soul};
use crate::direction::Direction;
use crate::suspension::{ScentKind, StepOutcome, SuspensionEvent};
use crate::word::{AddressMode, Instruction, Operand};
use crate::MEMORY_WORDS;

const BIG_PI: u32 = 3_141_592_653; // floor(pi * 1e9), fits in u32
const BIG_E: u32 = 2_718_281_828u32; // floor(e * 1e9)

/// Which operand a pending pond-resolved answer (`SNIFF LIGHT_LEVEL` or
/// `LADAR`) should be written back into once the pond supplies it.
#[derive(Debug, Clone, Copy)]
enum Pending {
    Sniff(Operand),
    Ladar(Operand),
}

/// One cell's interpreter for the duration of a single `run_cell`
/// invocation (spec.md §3 "Interpreter state"). Fresh every invocation:
/// `pointer`, `accumulator` and `direction` do not persist on the `Cell`
/// between ticks (the data model in spec.md §3 carries none of them).
pub struct Vm<'a> {
    memory: &'a mut Memory,
    ether: &'a mut HashMap<u16, u32>,
    soul: Option<Soul>,
    energy: u32,
    start_energy: u32,
    pointer: u16,
    accumulator: u32,
    direction: Direction,
    pending: Option<Pending>,
}

impl<'a> Vm<'a> {
    pub fn new(
        memory: &'a mut Memory,
        ether: &'a mut HashMap<u16, u32>,
        soul: Option<Soul>,
        energy: u32,
    ) -> Self {
        Vm {
            memory,
            ether,
            soul,
            energy,
            start_energy: energy,
            pointer: 0,
            accumulator: 0,
            direction: Direction::default(),
            pending: None,
        }
    }

    pub fn energy(&self) -> u32 {
        self.energy
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn pointer(&self) -> u16 {
        self.pointer
    }

    pub fn accumulator(&self) -> u32 {
        self.accumulator
    }

    /// Run until the next suspension event (spec.md §4.6). Must not be
    /// called again after a terminal event (`Stop`, `OutOfEnergy`,
    /// `FinishedBook`) without constructing a new `Vm`.
    pub fn run(&mut self) -> SuspensionEvent {
        loop {
            match self.step() {
                StepOutcome::Continue => continue,
                StepOutcome::Suspend(event) => return event,
            }
        }
    }

    /// Feed back the pond's answer to a suspended `SNIFF LIGHT_LEVEL` and
    /// resume running (spec.md §4.8: "invokes the callback then continues
    /// the same interpreter").
    pub fn resume_sniff(&mut self, value: u32) -> SuspensionEvent {
        if let Some(Pending::Sniff(dest)) = self.pending.take() {
            self.write(dest, value);
        }
        self.run()
    }

    /// Feed back a `LADAR` scan result and resume running.
    pub fn resume_ladar(&mut self, hit: crate::suspension::LadarHit) -> SuspensionEvent {
        if let Some(Pending::Ladar(dest)) = self.pending.take() {
            self.write(dest, hit as u32);
        }
        self.run()
    }

    fn resolve_read(&self, op: Operand) -> u32 {
        match op.mode {
            AddressMode::Normal => self.memory.read(op.addr),
            AddressMode::Accumulator => self.accumulator,
            AddressMode::Literal => op.addr as u32,
            AddressMode::Indirect => {
                let i = self.indirect_index(op.addr);
                self.memory.read(i)
            }
        }
    }

    fn write(&mut self, op: Operand, value: u32) {
        match op.mode {
            AddressMode::Literal => {}
            AddressMode::Accumulator => self.accumulator = value,
            AddressMode::Normal => self.memory.write(op.addr, value),
            AddressMode::Indirect => {
                let i = self.indirect_index(op.addr);
                self.memory.write(i, value);
            }
        }
    }

    fn indirect_index(&self, addr: u16) -> u16 {
        (self.memory.read(addr) % MEMORY_WORDS as u32) as u16
    }

    /// An operand resolved and reduced to a valid word index, used by the
    /// opcodes that hand an index to the pond (`NUDGE`/`TEACH`/`ETHERWRITE`
    /// key from `dest`, `ETHERREAD` key from `src` — spec.md §5).
    fn resolve_index(&self, op: Operand) -> u16 {
        (self.resolve_read(op) % MEMORY_WORDS as u32) as u16
    }

    fn fetch(&mut self) -> Option<Instruction> {
        if self.pointer as usize >= MEMORY_WORDS {
            return None;
        }
        let word = self.memory.read(self.pointer);
        self.pointer += 1;
        Some(Instruction::decode(word))
    }

    fn advance_or_finish(&mut self) -> Option<SuspensionEvent> {
        self.pointer += 1;
        if self.pointer as usize > MEMORY_WORDS {
            Some(SuspensionEvent::FinishedBook)
        } else {
            None
        }
    }

    fn debit(&mut self, cost: u32) -> bool {
        if cost > self.energy {
            self.energy = 0;
            false
        } else {
            self.energy -= cost;
            true
        }
    }

    fn step(&mut self) -> StepOutcome {
        let ins = match self.fetch() {
            Some(ins) => ins,
            None => return StepOutcome::Suspend(SuspensionEvent::FinishedBook),
        };

        if !self.debit(opcode_cost(ins.opcode)) {
            return StepOutcome::Suspend(SuspensionEvent::OutOfEnergy);
        }

        self.exec(ins)
    }

    fn exec(&mut self, ins: Instruction) -> StepOutcome {
        match ins.opcode {
            0x00 => StepOutcome::Continue,

            0x01..=0x0A => {
                let src = self.resolve_read(ins.src);
                let dest = self.resolve_read(ins.dest);
                let result = binary_op(ins.opcode, dest, src);
                self.write(ins.dest, result);
                StepOutcome::Continue
            }

            // EXCHANGE
            0x0B => {
                let src = self.resolve_read(ins.src);
                let dest = self.resolve_read(ins.dest);
                self.write(ins.src, dest);
                self.write(ins.dest, src);
                StepOutcome::Continue
            }

            // BINVERT
            0x0C => {
                let src = self.resolve_read(ins.src);
                self.write(ins.dest, arith::binvert(src));
                StepOutcome::Continue
            }

            // ZERO
            0x0D => {
                self.write(ins.dest, 0);
                StepOutcome::Continue
            }

            // JUMP
            0x0E => {
                let test = self.resolve_read(ins.src);
                if test != 0 {
                    let dest = self.resolve_read(ins.dest);
                    self.pointer = (dest % MEMORY_WORDS as u32) as u16;
                }
                StepOutcome::Continue
            }

            // SKIP
            0x0F => {
                let src = self.resolve_read(ins.src);
                let dest = self.resolve_read(ins.dest);
                if src == dest {
                    if let Some(event) = self.advance_or_finish() {
                        return StepOutcome::Suspend(event);
                    }
                }
                StepOutcome::Continue
            }

            // SKIPLESS
            0x10 => {
                let src = self.resolve_read(ins.src);
                let dest = self.resolve_read(ins.dest);
                if src < dest {
                    if let Some(event) = self.advance_or_finish() {
                        return StepOutcome::Suspend(event);
                    }
                }
                StepOutcome::Continue
            }

            // STOP
            0x11 => StepOutcome::Suspend(SuspensionEvent::Stop),

            // SNIFF
            0x12 => self.exec_sniff(ins),

            // RANDOM
            0x13 => {
                let seed = self.resolve_read(ins.src);
                let mut rng = Pcg64::seed_from_u64(seed as u64);
                self.write(ins.dest, rng.next_u32());
                StepOutcome::Continue
            }

            // FACE
            0x14 => {
                let value = self.resolve_read(ins.src);
                self.direction = Direction::from_value(value);
                StepOutcome::Continue
            }

            // LADAR
            0x15 => {
                self.pending = Some(Pending::Ladar(ins.dest));
                StepOutcome::Suspend(SuspensionEvent::Ladar)
            }

            // ETHERREAD: key from src, value written to dest.
            0x16 => {
                let key = self.resolve_index(ins.src);
                let value = self.ether.get(&key).copied().unwrap_or(0);
                self.write(ins.dest, value);
                StepOutcome::Continue
            }

            // ETHERWRITE: key from dest, value from src (spec.md §5).
            0x17 => {
                let key = self.resolve_index(ins.dest);
                let value = self.resolve_read(ins.src);
                self.ether.insert(key, value);
                StepOutcome::Continue
            }

            // NUDGE
            0x18 => {
                let word_index = self.resolve_index(ins.dest);
                let value = self.resolve_read(ins.src);
                StepOutcome::Suspend(SuspensionEvent::Nudge { word_index, value })
            }

            // BASK
            0x19 => StepOutcome::Suspend(SuspensionEvent::Bask),

            // HANDOFF
            0x1A => StepOutcome::Suspend(SuspensionEvent::Handoff),

            // MOVE
            0x1B => {
                let cutoff = self.resolve_index(ins.src);
                let fuel = self.resolve_read(ins.dest);
                StepOutcome::Suspend(SuspensionEvent::Move { cutoff, fuel })
            }

            // PROCURE
            0x1C => {
                let amount = self.resolve_read(ins.src);
                StepOutcome::Suspend(SuspensionEvent::Procure { amount })
            }

            // BESTOW
            0x1D => {
                let amount = self.resolve_read(ins.src);
                self.energy = self.energy.saturating_sub(amount);
                StepOutcome::Suspend(SuspensionEvent::Bestow { amount })
            }

            // TEACH
            0x1E => {
                let word_index = self.resolve_index(ins.dest);
                let value = self.resolve_read(ins.src);
                StepOutcome::Suspend(SuspensionEvent::Teach { word_index, value })
            }

            // COPY
            0x1F => {
                let value = self.resolve_read(ins.src);
                self.write(ins.dest, value);
                StepOutcome::Continue
            }

            // Unrecognized opcodes fold to NOOP (spec.md §4.2).
            _ => StepOutcome::Continue,
        }
    }

    fn exec_sniff(&mut self, ins: Instruction) -> StepOutcome {
        let kind = ScentKind::from_value(self.resolve_read(ins.src));
        let value = match kind {
            ScentKind::StartEnergy => Some(self.start_energy),
            ScentKind::CurrentEnergy => Some(self.energy),
            ScentKind::Pi => Some(BIG_PI),
            ScentKind::E => Some(BIG_E),
            ScentKind::Checksum => Some(self.memory.checksum()),
            ScentKind::Soul => Some(self.soul.map_or(0, Soul::as_u32)),
            ScentKind::Unknown => Some(0),
            ScentKind::LightLevel => None,
        };
        match value {
            Some(value) => {
                self.write(ins.dest, value);
                StepOutcome::Continue
            }
            None => {
                self.pending = Some(Pending::Sniff(ins.dest));
                StepOutcome::Suspend(SuspensionEvent::Sniff)
            }
        }
    }
}

fn binary_op(opcode: u8, dest: u32, src: u32) -> u32 {
    match opcode {
        0x01 => arith::add(dest, src),
        0x02 => arith::sub(dest, src),
        0x03 => arith::mul(dest, src),
        0x04 => arith::div(dest, src),
        0x05 => arith::modulo(dest, src),
        0x06 => arith::band(dest, src),
        0x07 => arith::bor(dest, src),
        0x08 => arith::bxor(dest, src),
        0x09 => arith::lshift(dest, src),
        0x0A => arith::rshift(dest, src),
        _ => unreachable!("binary_op called with non-binary opcode"),
    }
}

/// Energy cost of each opcode (spec.md §4.2).
pub fn opcode_cost(opcode: u8) -> u32 {
    match opcode {
        0x00 => 0,
        0x01..=0x0A => 1, // binary
        0x0B => 1,        // EXCHANGE
        0x0C | 0x0D => 1, // BINVERT, ZERO
        0x0E => 1,        // JUMP
        0x0F | 0x10 => 1, // SKIP, SKIPLESS
        0x11 => 1,        // STOP
        0x12 => 1,        // SNIFF
        0x13 => 1,        // RANDOM
        0x14 => 1,        // FACE
        0x15 => 5,        // LADAR
        0x16 | 0x17 => 5, // ETHERREAD, ETHERWRITE
        0x18 => 5,        // NUDGE
        0x19 => 1,        // BASK
        0x1A => 5,        // HANDOFF
        0x1B => 5,        // MOVE
        0x1C | 0x1D | 0x1E => 5, // PROCURE, BESTOW, TEACH
        0x1F => 1,        // COPY
        _ => 0,           // unmapped opcodes are NOOP
    }
}

#[allow(dead_code)]
fn assert_constants_match_std() {
    debug_assert_eq!(BIG_PI, (PI * 1e9) as u32);
    debug_assert_eq!(BIG_E, (E * 1e9) as u32);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::word::AddressMode;

    fn vm_with(words: &[u32]) -> (Memory, HashMap<u16, u32>) {
        let mut memory = Memory::zeroed();
        for (i, &w) in words.iter().enumerate() {
            memory.write(i as u16, w);
        }
        (memory, HashMap::new())
    }

    #[test]
    fn random_is_pure_function_of_seed() {
        let random_acc = Instruction::new(0x13, AddressMode::Literal, 42, AddressMode::Accumulator, 0);
        let stop = Instruction::new(0x11, AddressMode::Literal, 0, AddressMode::Literal, 0);
        let (mut mem1, mut ether1) = vm_with(&[random_acc.encode(), stop.encode()]);
        let (mut mem2, mut ether2) = vm_with(&[random_acc.encode(), stop.encode()]);

        let mut vm1 = Vm::new(&mut mem1, &mut ether1, Some(Soul(1)), 500);
        assert_eq!(vm1.run(), SuspensionEvent::Stop);

        let mut vm2 = Vm::new(&mut mem2, &mut ether2, Some(Soul(1)), 500);
        assert_eq!(vm2.run(), SuspensionEvent::Stop);

        assert_eq!(vm1.accumulator(), vm2.accumulator());
    }

    #[test]
    fn out_of_energy_clamps_to_zero() {
        let nudge = Instruction::new(0x18, AddressMode::Literal, 0, AddressMode::Literal, 0);
        let (mut mem, mut ether) = vm_with(&[nudge.encode()]);
        let mut vm = Vm::new(&mut mem, &mut ether, Some(Soul(1)), 3);
        assert_eq!(vm.run(), SuspensionEvent::OutOfEnergy);
        assert_eq!(vm.energy(), 0);
    }

    #[test]
    fn finished_book_when_memory_is_exhausted() {
        let (mut mem, mut ether) = vm_with(&[]); // all NOOP
        let mut vm = Vm::new(&mut mem, &mut ether, None, 10_000);
        assert_eq!(vm.run(), SuspensionEvent::FinishedBook);
    }

    #[test]
    fn skip_past_last_word_finishes_immediately() {
        let mut memory = Memory::zeroed();
        let skip = Instruction::new(0x0F, AddressMode::Literal, 7, AddressMode::Literal, 7);
        memory.write((MEMORY_WORDS - 1) as u16, skip.encode());
        let mut ether = HashMap::new();
        let mut vm = Vm::new(&mut memory, &mut ether, None, 10_000);
        assert_eq!(vm.run(), SuspensionEvent::FinishedBook);
    }

    #[test]
    fn div_by_zero_through_the_interpreter_yields_sentinel() {
        // DIV <ACC>, <ACC> with accumulator left at 0 divides by zero.
        let div = Instruction::new(0x04, AddressMode::Accumulator, 0, AddressMode::Accumulator, 0);
        let stop = Instruction::new(0x11, AddressMode::Literal, 0, AddressMode::Literal, 0);
        let (mut mem, mut ether) = vm_with(&[div.encode(), stop.encode()]);
        let mut vm = Vm::new(&mut mem, &mut ether, None, 500);
        assert_eq!(vm.run(), SuspensionEvent::Stop);
        assert_eq!(vm.accumulator(), arith::DIV_BY_ZERO_SENTINEL);
    }

    #[test]
    fn sniff_internal_kind_resolves_without_suspending() {
        let sniff = Instruction::new(0x12, AddressMode::Literal, 3, AddressMode::Accumulator, 0); // PI
        let stop = Instruction::new(0x11, AddressMode::Literal, 0, AddressMode::Literal, 0);
        let (mut mem, mut ether) = vm_with(&[sniff.encode(), stop.encode()]);
        let mut vm = Vm::new(&mut mem, &mut ether, None, 500);
        assert_eq!(vm.run(), SuspensionEvent::Stop);
        assert_eq!(vm.accumulator(), BIG_PI);
    }

    #[test]
    fn sniff_light_level_suspends_and_resumes() {
        let sniff = Instruction::new(0x12, AddressMode::Literal, 7, AddressMode::Accumulator, 0); // LIGHT_LEVEL
        let stop = Instruction::new(0x11, AddressMode::Literal, 0, AddressMode::Literal, 0);
        let (mut mem, mut ether) = vm_with(&[sniff.encode(), stop.encode()]);
        let mut vm = Vm::new(&mut mem, &mut ether, None, 500);
        assert_eq!(vm.run(), SuspensionEvent::Sniff);
        assert_eq!(vm.resume_sniff(12345), SuspensionEvent::Stop);
        assert_eq!(vm.accumulator(), 12345);
    }
}
