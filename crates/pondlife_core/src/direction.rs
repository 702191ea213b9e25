//! 8-way neighbour arithmetic (spec.md §4.9).

pub type Coord = (i32, i32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    West,
    NorthWest,
    North,
    NorthEast,
    East,
    SouthEast,
    South,
    SouthWest,
}

impl Direction {
    /// `FACE`'s operand encodes direction as `0..=7` in this order.
    pub fn from_value(value: u32) -> Self {
        match value % 8 {
            0 => Direction::West,
            1 => Direction::NorthWest,
            2 => Direction::North,
            3 => Direction::NorthEast,
            4 => Direction::East,
            5 => Direction::SouthEast,
            6 => Direction::South,
            _ => Direction::SouthWest,
        }
    }

    pub fn offset(self) -> (i32, i32) {
        match self {
            Direction::West => (-1, 0),
            Direction::NorthWest => (-1, -1),
            Direction::North => (0, -1),
            Direction::NorthEast => (1, -1),
            Direction::East => (1, 0),
            Direction::SouthEast => (1, 1),
            Direction::South => (0, 1),
            Direction::SouthWest => (-1, 1),
        }
    }

    pub fn is_diagonal(self) -> bool {
        matches!(
            self,
            Direction::NorthWest
                | Direction::NorthEast
                | Direction::SouthEast
                | Direction::SouthWest
        )
    }
}

impl Default for Direction {
    /// The interpreter always starts facing west (spec.md §3).
    fn default() -> Self {
        Direction::West
    }
}

pub fn apply_direction(coord: Coord, dir: Direction) -> Coord {
    let (dx, dy) = dir.offset();
    (coord.0 + dx, coord.1 + dy)
}
