// CMaNGOS TBC - Shared Library
// Configuration and logging used by every server-side tool

pub mod config;
pub mod log;

/// Size of one map grid (tile) edge in world units
pub const SIZE_OF_GRIDS: f32 = 533.33333;

/// Number of grids along each axis of a map
pub const MAX_NUMBER_OF_GRIDS: u32 = 64;

/// Grid index of the map centre
pub const CENTER_GRID_ID: u32 = MAX_NUMBER_OF_GRIDS / 2;
