//! The pond: grid storage, alive-set, ether map, light field, sun placement,
//! and the tick scheduler that drives each cell's interpreter through the
//! suspension protocol (spec.md §3, §4.8–§4.10, §5).
//!
//! The cyclic ownership pond ↔ interpreter ↔ cell (Design Notes §9) is broken
//! by detaching the scheduled cell (and its lineage's ether) out of the
//! pond's maps for the duration of one `run_cell` invocation, running the
//! `Vm` against the detached copies, then writing the result back in. This
//! is the same shape as the teacher splitting `Cpu` (owns registers) from
//! `Bus` (owns memory) to avoid a cell holding a reference to its own owner.

use std::collections::{BTreeSet, HashMap};

use log::{debug, trace, warn};
use rand::seq::IteratorRandom;
use rand::{RngCore, SeedableRng};
use rand_pcg::Pcg64;

use crate::cell::{Cell, Soul};
use crate::config::PondConfig;
use crate::direction::{apply_direction, Coord, Direction};
use crate::suspension::{LadarHit, SuspensionEvent};
use crate::vm::Vm;
use crate::{DIAGONAL_COST_FACTOR, LADAR_MAX_STEPS, START_ENERGY};

/// How a cell's tick ended, threaded out of the borrowed-`Vm` scope so the
/// pond can resolve it against cells it still owns.
enum Resolution {
    Terminal(SuspensionEvent, Direction),
    Handoff(Direction),
}

/// The 2D world: a sparse cell table, the set of currently-alive
/// coordinates, per-lineage ether, a precomputed light field, and the
/// seeded PRNG that drives every non-`RANDOM` random draw (spec.md §5).
///
/// `alive` is a `BTreeSet`, not a `HashSet`: `Pond::tick()` draws from it by
/// walking its iteration order, and `HashSet`'s default hasher is seeded
/// from OS entropy per-process, so the same `PondConfig.seed` would walk
/// the set in a different order (and so pick a different coordinate) on
/// every run. A `BTreeSet` iterates in a fixed, coordinate-order-determined
/// sequence, so the only source of nondeterminism in `tick()` is the pond's
/// seeded PRNG itself, as spec.md §5 requires.
pub struct Pond {
    cells: HashMap<Coord, Cell>,
    alive: BTreeSet<Coord>,
    ethers: HashMap<Soul, HashMap<u16, u32>>,
    light_level: HashMap<Coord, u32>,
    rng: Pcg64,
    width: u32,
    height: u32,
}

impl Pond {
    pub fn new(config: &PondConfig) -> Self {
        let mut rng = Pcg64::seed_from_u64(config.seed);
        let mut cells = HashMap::new();
        let mut suns = Vec::with_capacity(config.number_of_suns);

        while suns.len() < config.number_of_suns && suns.len() < (config.width * config.height) as usize {
            let x = (rng.next_u32() % config.width.max(1)) as i32;
            let y = (rng.next_u32() % config.height.max(1)) as i32;
            if suns.contains(&(x, y)) {
                continue;
            }
            suns.push((x, y));
            cells.insert((x, y), Cell::sun());
        }

        let mut light_level = HashMap::with_capacity((config.width * config.height) as usize);
        for y in 0..config.height as i32 {
            for x in 0..config.width as i32 {
                let mut total = 0.0f64;
                for &(sx, sy) in &suns {
                    let dx = (x - sx) as f64;
                    let dy = (y - sy) as f64;
                    let d2 = dx * dx + dy * dy;
                    total += if d2 == 0.0 {
                        config.sun_max_brightness as f64
                    } else {
                        config.sun_max_brightness as f64 / d2
                    };
                }
                light_level.insert((x, y), total.floor() as u32);
            }
        }

        debug!(
            "pond constructed {}x{} seed={} suns={:?}",
            config.width, config.height, config.seed, suns
        );

        Pond {
            cells,
            alive: BTreeSet::new(),
            ethers: HashMap::new(),
            light_level,
            rng,
            width: config.width,
            height: config.height,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn alive_count(&self) -> usize {
        self.alive.len()
    }

    pub fn is_alive(&self, coord: Coord) -> bool {
        self.alive.contains(&coord)
    }

    /// Read-only lookup; absent coordinates are not inserted (spec.md §3,
    /// Design Notes §9 "reads of absent entries must not mutate").
    pub fn cell(&self, coord: Coord) -> Option<&Cell> {
        self.cells.get(&coord)
    }

    pub fn light_level(&self, coord: Coord) -> u32 {
        self.light_level.get(&coord).copied().unwrap_or(0)
    }

    pub fn ether_value(&self, soul: Soul, index: u16) -> u32 {
        self.ethers
            .get(&soul)
            .and_then(|ether| ether.get(&index))
            .copied()
            .unwrap_or(0)
    }

    /// Seed a specific coordinate with a cell, for tests and embedders
    /// building a world by hand rather than through `lightning`.
    pub fn place(&mut self, coord: Coord, cell: Cell) {
        if cell.alive() {
            self.alive.insert(coord);
        } else {
            self.alive.remove(&coord);
        }
        self.cells.insert(coord, cell);
    }

    /// One scheduling round: draw uniformly from the alive-set and drive
    /// that cell's interpreter to its next break (spec.md §4.8).
    pub fn tick(&mut self) -> Option<Coord> {
        let coord = self.alive.iter().copied().choose(&mut self.rng)?;
        self.run_cell(coord);
        Some(coord)
    }

    /// The "spark of life" primitive (`original_source/pond.py::Pond.lightning`,
    /// supplementing spec.md — see SPEC_FULL.md §7): place a freshly randomised,
    /// newly souled cell and immediately run it.
    pub fn lightning(&mut self, coord: Option<Coord>) -> Coord {
        let coord = coord.unwrap_or_else(|| {
            let x = (self.rng.next_u32() % self.width.max(1)) as i32;
            let y = (self.rng.next_u32() % self.height.max(1)) as i32;
            (x, y)
        });
        let soul = Soul::random(&mut self.rng);
        let cell = Cell::random(START_ENERGY, soul, &mut self.rng);
        debug!("lightning struck {:?} soul={:?}", coord, soul);
        self.cells.insert(coord, cell);
        self.alive.insert(coord);
        self.run_cell(coord);
        coord
    }

    /// Run one cell to its next break, following neighbours across any
    /// `HANDOFF` chain (spec.md §4.6/§4.8).
    pub fn run_cell(&mut self, coord: Coord) {
        self.run_cell_inner(coord, None);
    }

    /// A `HANDOFF` chases control into the forward neighbour regardless of
    /// whether that neighbour was already alive (spec.md §4.6: "make the
    /// forward cell the new current cell", no accessibility gate). The only
    /// cell that can never become current is a sun, which never runs. A
    /// top-level (non-handoff) invocation keeps the usual requirement that
    /// the scheduled coordinate actually holds a living cell.
    fn run_cell_inner(&mut self, coord: Coord, carried_ether: Option<(Soul, HashMap<u16, u32>)>) {
        let is_handoff = carried_ether.is_some();
        let slot = self.cells.remove(&coord);
        let mut cell = match slot {
            Some(cell) if is_handoff && !cell.inanimate => cell,
            Some(cell) if !is_handoff && cell.alive() => cell,
            Some(cell) => {
                self.cells.insert(coord, cell);
                self.restore_ether(carried_ether);
                return;
            }
            None if is_handoff => Cell::default(),
            None => {
                self.restore_ether(carried_ether);
                return;
            }
        };

        let (ether_key, mut ether) = match carried_ether {
            Some(pair) => pair,
            None => {
                let cell_soul = cell.soul.expect("a cell in `alive` always carries a soul");
                (cell_soul, self.ethers.remove(&cell_soul).unwrap_or_default())
            }
        };

        let (resolution, final_energy) = {
            let mut vm = Vm::new(&mut cell.memory, &mut ether, cell.soul, cell.energy);
            let mut event = vm.run();
            let resolution = loop {
                match event {
                    SuspensionEvent::Sniff => {
                        let light = self.light_level(coord);
                        trace!("{:?} sniffs light_level={}", coord, light);
                        event = vm.resume_sniff(light);
                    }
                    SuspensionEvent::Ladar => {
                        let hit = self.scan_ladar(coord, cell.soul, vm.direction());
                        trace!("{:?} ladar hit={:?}", coord, hit);
                        event = vm.resume_ladar(hit);
                    }
                    SuspensionEvent::Teach { word_index, value } => {
                        self.resolve_teach(coord, cell.soul, vm.direction(), word_index, value);
                        event = vm.run();
                    }
                    SuspensionEvent::Bestow { amount } => {
                        self.resolve_bestow(coord, cell.soul, vm.direction(), amount);
                        event = vm.run();
                    }
                    SuspensionEvent::Handoff => break Resolution::Handoff(vm.direction()),
                    terminal => break Resolution::Terminal(terminal, vm.direction()),
                }
            };
            (resolution, vm.energy())
        };
        cell.energy = final_energy;

        match resolution {
            Resolution::Handoff(dir) => self.resolve_handoff(coord, cell, dir, ether_key, ether),
            Resolution::Terminal(event, dir) => {
                self.resolve_terminal(coord, cell, ether_key, ether, event, dir)
            }
        }
    }

    fn restore_ether(&mut self, carried_ether: Option<(Soul, HashMap<u16, u32>)>) {
        if let Some((key, ether)) = carried_ether {
            self.ethers.insert(key, ether);
        }
    }

    fn resolve_handoff(
        &mut self,
        coord: Coord,
        mut cell: Cell,
        dir: Direction,
        ether_key: Soul,
        ether: HashMap<u16, u32>,
    ) {
        if cell.energy == 0 {
            cell.soul = None;
        }
        let forward = apply_direction(coord, dir);

        if forward == coord {
            warn!("HANDOFF targeted its own coordinate at {:?}; ignoring", coord);
            debug_assert!(false, "HANDOFF must not target its own coordinate");
            self.reinsert(coord, cell);
            self.ethers.insert(ether_key, ether);
            return;
        }

        self.reinsert(coord, cell);
        self.run_cell_inner(forward, Some((ether_key, ether)));
    }

    fn resolve_terminal(
        &mut self,
        coord: Coord,
        mut cell: Cell,
        ether_key: Soul,
        ether: HashMap<u16, u32>,
        event: SuspensionEvent,
        dir: Direction,
    ) {
        match event {
            SuspensionEvent::Nudge { word_index, value } => {
                self.apply_nudge(coord, &mut cell, dir, word_index, value);
            }
            SuspensionEvent::Procure { amount } => {
                self.apply_procure(coord, &mut cell, dir, amount);
            }
            SuspensionEvent::Bask => {
                let light = self.light_level(coord);
                cell.energy = cell.energy.saturating_add(light);
                trace!("{:?} basked, energy now {}", coord, cell.energy);
            }
            SuspensionEvent::Move { cutoff, fuel } => {
                self.apply_move(coord, cell, dir, cutoff, fuel, ether_key, ether);
                return;
            }
            SuspensionEvent::Stop => trace!("{:?} stopped", coord),
            SuspensionEvent::OutOfEnergy => debug!("{:?} ran out of energy", coord),
            SuspensionEvent::FinishedBook => trace!("{:?} ran off the end of its program", coord),
            SuspensionEvent::Sniff
            | SuspensionEvent::Ladar
            | SuspensionEvent::Teach { .. }
            | SuspensionEvent::Bestow { .. } => {
                unreachable!("continuing events never reach resolve_terminal")
            }
        }
        self.reinsert(coord, cell);
        self.ethers.insert(ether_key, ether);
    }

    fn reinsert(&mut self, coord: Coord, cell: Cell) {
        if cell.alive() {
            self.alive.insert(coord);
        } else {
            self.alive.remove(&coord);
        }
        self.cells.insert(coord, cell);
    }

    fn apply_nudge(&mut self, coord: Coord, cell: &mut Cell, dir: Direction, word_index: u16, value: u32) {
        let forward = apply_direction(coord, dir);
        let nudge_energy = cell.energy;
        let nudge_soul = cell.soul;
        cell.energy = 0;
        cell.soul = None;

        let accessible = self.cells.get(&forward).map_or(true, |c| c.can_access(nudge_soul));
        if accessible && nudge_energy > 0 {
            let target = self.cells.entry(forward).or_default();
            target.energy = target.energy.saturating_add(nudge_energy);
            target.soul = nudge_soul;
            target.memory.write(word_index, value);
            if target.alive() {
                self.alive.insert(forward);
            }
        }
        debug!("{:?} nudged forward neighbour {:?}", coord, forward);
    }

    fn apply_procure(&mut self, coord: Coord, cell: &mut Cell, dir: Direction, amount: u32) {
        let forward = apply_direction(coord, dir);
        if let Some(target) = self.cells.get_mut(&forward) {
            if target.can_access(cell.soul) {
                let drained = amount.min(target.energy);
                target.energy -= drained;
                cell.energy = cell.energy.saturating_add(drained);
                if target.energy == 0 {
                    target.soul = None;
                    self.alive.remove(&forward);
                }
            }
        }
    }

    fn apply_move(
        &mut self,
        coord: Coord,
        cell: Cell,
        dir: Direction,
        cutoff: u16,
        fuel: u32,
        ether_key: Soul,
        ether: HashMap<u16, u32>,
    ) {
        let step_cost = if dir.is_diagonal() {
            ((cutoff as f64) * DIAGONAL_COST_FACTOR).ceil() as u32
        } else {
            cutoff as u32
        };

        let mut current = coord;
        let mut remaining = fuel;
        if step_cost > 0 {
            while remaining >= step_cost {
                let next = apply_direction(current, dir);
                let accessible = self.cells.get(&next).map_or(true, |c| c.can_access(cell.soul));
                if !accessible {
                    break;
                }
                remaining -= step_cost;
                current = next;
            }
        }

        if remaining > 0 {
            let beyond = apply_direction(current, dir);
            let target = self.cells.entry(beyond).or_default();
            target.energy = target.energy.saturating_add(remaining);
            if target.soul.is_none() {
                target.soul = cell.soul;
            }
            if target.alive() {
                self.alive.insert(beyond);
            }
        }

        debug!(
            "{:?} moved to {:?}, spent {} of {} fuel",
            coord,
            current,
            fuel.saturating_sub(remaining),
            fuel
        );

        let mut moved = Cell::new(cell.energy, cell.soul);
        moved.memory.copy_prefix_from(&cell.memory, cutoff as usize);

        self.alive.remove(&coord);
        self.reinsert(current, moved);
        self.ethers.insert(ether_key, ether);
    }

    fn resolve_teach(&mut self, coord: Coord, soul: Option<Soul>, dir: Direction, word_index: u16, value: u32) {
        let forward = apply_direction(coord, dir);
        let accessible = self.cells.get(&forward).map_or(true, |c| c.can_access(soul));
        if accessible {
            let target = self.cells.entry(forward).or_default();
            target.memory.write(word_index, value);
        }
        trace!("{:?} taught forward neighbour {:?}", coord, forward);
    }

    fn resolve_bestow(&mut self, coord: Coord, soul: Option<Soul>, dir: Direction, amount: u32) {
        let forward = apply_direction(coord, dir);
        let accessible = self.cells.get(&forward).map_or(true, |c| c.can_access(soul));
        if accessible {
            let target = self.cells.entry(forward).or_default();
            target.energy = target.energy.saturating_add(amount);
            target.soul = soul;
            if target.alive() {
                self.alive.insert(forward);
            }
        }
        trace!("{:?} bestowed {} energy on forward neighbour {:?}", coord, amount, forward);
    }

    fn scan_ladar(&self, coord: Coord, soul: Option<Soul>, dir: Direction) -> LadarHit {
        let mut current = coord;
        for _ in 0..LADAR_MAX_STEPS {
            current = apply_direction(current, dir);
            if let Some(hit) = self.cells.get(&current) {
                if hit.alive() {
                    return if hit.soul == soul {
                        LadarHit::Soulmate
                    } else {
                        LadarHit::Heathen
                    };
                }
            }
        }
        LadarHit::Nothing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::word::{AddressMode, Instruction};

    fn pond(seed: u64) -> Pond {
        let _ = env_logger::builder().is_test(true).try_init();
        Pond::new(&PondConfig {
            width: 64,
            height: 64,
            seed,
            ..PondConfig::default()
        })
    }

    fn program(instructions: &[Instruction]) -> Cell {
        let mut cell = Cell::new(500, Some(Soul(1)));
        for (i, ins) in instructions.iter().enumerate() {
            cell.memory.write(i as u16, (*ins).encode());
        }
        cell
    }

    fn literal(opcode: u8, src: u16, dest: u16) -> Instruction {
        Instruction::new(opcode, AddressMode::Literal, src, AddressMode::Literal, dest)
    }

    #[test]
    fn reading_absent_coordinate_does_not_insert() {
        let p = pond(1);
        assert!(p.cell((5, 5)).is_none());
        assert_eq!(p.cells.len(), 3); // only the suns
    }

    #[test]
    fn reading_absent_ether_does_not_insert() {
        let p = pond(1);
        assert_eq!(p.ether_value(Soul(7), 0), 0);
        assert!(p.ethers.is_empty());
    }

    #[test]
    fn scenario_a_energy_exhaustion_via_nudge() {
        let mut p = pond(2);
        // Default facing is WEST; an inaccessible (differently-souled, alive)
        // wall at the forward coordinate makes the nudge a no-op there.
        let wall = Cell::new(1, Some(Soul(2)));
        p.place((-1, 0), wall);

        let mut cell = program(&[literal(0x18, 0, 0)]); // NUDGE
        cell.energy = 7;
        p.place((0, 0), cell);

        p.run_cell((0, 0));

        assert!(!p.is_alive((0, 0)));
        assert_eq!(p.cell((0, 0)).unwrap().energy, 0);
        assert!(p.cell((0, 0)).unwrap().soul.is_none());
        assert_eq!(p.cell((-1, 0)).unwrap().energy, 1); // wall untouched
    }

    #[test]
    fn scenario_c_ladar_soulmate() {
        let mut p = pond(4);
        let soul = Soul(0x4343_4F4C);
        let mut left = program(&[
            Instruction::new(0x14, AddressMode::Literal, 4, AddressMode::Literal, 0), // FACE #4 (EAST)
            Instruction::new(0x15, AddressMode::Literal, 0, AddressMode::Normal, 5),  // LADAR -> word 5
        ]);
        left.soul = Some(soul);
        left.energy = 500;
        let right = Cell::new(500, Some(soul));

        p.place((0, 0), left);
        p.place((1, 0), right);
        p.run_cell((0, 0));

        assert_eq!(p.cell((0, 0)).unwrap().memory.read(5), LadarHit::Soulmate as u32);
    }

    #[test]
    fn scenario_d_bestow_creates_life() {
        let mut p = pond(5);
        let soul = Soul(99);
        let mut x = program(&[
            Instruction::new(0x14, AddressMode::Literal, 4, AddressMode::Literal, 0), // FACE east
            literal(0x1D, 100, 0),                                                    // BESTOW #100
        ]);
        x.soul = Some(soul);
        x.energy = 500;
        p.place((5, 5), x);

        p.run_cell((5, 5));

        // 500 - 1 (FACE) - 5 (BESTOW opcode cost) - 100 (donated) = 394.
        assert_eq!(p.cell((5, 5)).unwrap().energy, 394);
        assert_eq!(p.cell((6, 5)).unwrap().energy, 100);
        assert_eq!(p.cell((6, 5)).unwrap().soul, Some(soul));
        assert!(p.is_alive((6, 5)));
    }

    #[test]
    fn scenario_e_procure_drains_and_clears() {
        let mut p = pond(6);
        let soul = Soul(7);
        let mut attacker = program(&[
            Instruction::new(0x14, AddressMode::Literal, 0, AddressMode::Literal, 0), // FACE west
            literal(0x1C, 9999, 0),                                                   // PROCURE #9999
        ]);
        attacker.soul = Some(soul);
        attacker.energy = 500;
        let mut victim = Cell::new(30, Some(soul));
        victim.memory.write(0, literal(0x00, 0, 0).encode());

        p.place((5, 5), attacker);
        p.place((4, 5), victim);

        p.run_cell((5, 5));

        // 500 - 1 (FACE) - 5 (PROCURE opcode cost) + 30 (drained) = 524.
        assert_eq!(p.cell((5, 5)).unwrap().energy, 524);
        assert_eq!(p.cell((4, 5)).unwrap().energy, 0);
        assert!(p.cell((4, 5)).unwrap().soul.is_none());
        assert!(!p.is_alive((4, 5)));
    }

    #[test]
    fn scenario_f_move_relocates_prefix() {
        let mut p = pond(7);
        let soul = Soul(11);
        let mut mover = program(&[
            Instruction::new(0x14, AddressMode::Literal, 4, AddressMode::Literal, 0), // FACE east
            Instruction::new(0x1B, AddressMode::Literal, 100, AddressMode::Literal, 500), // MOVE #100,#500
        ]);
        mover.soul = Some(soul);
        mover.energy = 1000;
        mover.memory.write(2, 0xABCD_EF01);
        p.place((10, 10), mover);

        p.run_cell((10, 10));

        assert!(!p.is_alive((10, 10)));
        assert!(p.cell((10, 10)).is_none());
        let dest = p.cell((15, 10)).expect("cell relocated to (15,10)");
        assert_eq!(dest.soul, Some(soul));
        // 1000 - 1 (FACE) - 5 (MOVE opcode cost) = 994; MOVE's `fuel` operand
        // is spent from a separate budget, not from `energy` (scenario F).
        assert_eq!(dest.energy, 994);
        assert_eq!(dest.memory.read(2), 0xABCD_EF01);
        assert!(p.is_alive((15, 10)));
    }

    #[test]
    fn lightning_creates_a_living_cell() {
        let mut p = pond(8);
        let coord = p.lightning(Some((20, 20)));
        assert!(p.cell(coord).is_some());
    }

    #[test]
    fn handoff_switches_to_forward_neighbour() {
        let mut p = pond(9);
        let mut left = program(&[
            Instruction::new(0x14, AddressMode::Literal, 4, AddressMode::Literal, 0), // FACE east
            literal(0x1A, 0, 0),                                                      // HANDOFF
        ]);
        left.soul = Some(Soul(3));
        left.energy = 500;
        let mut right = program(&[literal(0x11, 0, 0)]); // STOP
        right.soul = Some(Soul(4));
        right.energy = 500;

        p.place((0, 0), left);
        p.place((1, 0), right);
        p.run_cell((0, 0));

        // Left debited FACE(1) + HANDOFF(5) and kept its own soul/energy.
        assert!(p.is_alive((0, 0)));
        assert_eq!(p.cell((0, 0)).unwrap().energy, 494);
        // Control switched to the right cell, which ran its own STOP(1).
        assert!(p.is_alive((1, 0)));
        assert_eq!(p.cell((1, 0)).unwrap().energy, 499);
    }

    #[test]
    fn handoff_into_empty_space_runs_a_silent_default_cell() {
        let mut p = pond(10);
        let mut cell = program(&[
            Instruction::new(0x14, AddressMode::Literal, 4, AddressMode::Literal, 0), // FACE east
            literal(0x1A, 0, 0),                                                      // HANDOFF
        ]);
        cell.soul = Some(Soul(5));
        cell.energy = 500;
        p.place((0, 0), cell);

        p.run_cell((0, 0));

        assert!(p.is_alive((0, 0)));
        // The forward coordinate was empty; control passed to a fresh,
        // soulless cell whose all-zero program runs to `FinishedBook`
        // without ever coming alive.
        assert!(!p.is_alive((1, 0)));
        assert!(p.cell((1, 0)).is_some());
    }

    #[test]
    fn handoff_refuses_to_hand_to_a_sun() {
        let mut p = pond(11);
        let mut cell = program(&[
            Instruction::new(0x14, AddressMode::Literal, 4, AddressMode::Literal, 0), // FACE east
            literal(0x1A, 0, 0),                                                      // HANDOFF
        ]);
        cell.soul = Some(Soul(6));
        cell.energy = 500;
        p.place((0, 0), cell);
        p.place((1, 0), Cell::sun());

        p.run_cell((0, 0));

        assert!(p.is_alive((0, 0)));
        assert!(p.cell((1, 0)).unwrap().inanimate);
    }
}
