//! Ambient configuration for constructing a `Pond` (spec.md §9 "Ambient
//! engineering stack"). Mirrors the teacher's `front/config.rs` role —
//! `serde::Deserialize` only, no file I/O or CLI parsing, since the front
//! end that would own those is out of scope.

use serde::Deserialize;

use crate::{NUMBER_OF_SUNS, SUN_MAX_BRIGHTNESS};

/// Default grid dimensions (spec.md §3).
pub const DEFAULT_WIDTH: u32 = 640;
pub const DEFAULT_HEIGHT: u32 = 480;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PondConfig {
    pub width: u32,
    pub height: u32,
    pub seed: u64,
    pub number_of_suns: usize,
    pub sun_max_brightness: u32,
}

impl Default for PondConfig {
    fn default() -> Self {
        PondConfig {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            seed: 0,
            number_of_suns: NUMBER_OF_SUNS,
            sun_max_brightness: SUN_MAX_BRIGHTNESS,
        }
    }
}
