// CMaNGOS TBC - VMap collision library
// Line of sight, ray hit, ground height and area/liquid queries against
// extracted static world geometry

pub mod bih;
pub mod error;
pub mod io;
pub mod manager;
pub mod map_tree;
pub mod math;
pub mod model;
pub mod model_cache;
pub mod model_instance;

pub use error::{LoadResult, VmapError};
pub use manager::{
    convert_position_to_internal_rep, grid_coords, AreaAndLiquidData, AreaInfo, DisableFlags, DisablePolicy,
    DisableTable, LiquidFlagsLookup, LiquidInfo, LiquidTypeTable, NoDisables, VMapManager, VmapConfig,
    MAP_HALF_EXTENT,
};
pub use map_tree::{map_file_name, tile_file_name, MapFile, StaticMapTree, TileFile};
pub use math::{AaBox, Vec3};
pub use model::{GroupModel, MeshTriangle, WmoLiquid, WorldModel};
pub use model_cache::{ModelCache, ModelHandle};
pub use model_instance::{ModelIgnoreFlags, ModelSpawn};

/// File magic shared by every vmap file
pub const VMAP_MAGIC: &[u8; 4] = b"VMAP";
/// Format version; files with any other version are rejected
pub const VMAP_VERSION: &[u8; 4] = b"_7.0";

/// Returned by height queries when no ground was found
pub const VMAP_INVALID_HEIGHT_VALUE: f32 = -200000.0;

// Model spawn flags
pub const MOD_M2: u32 = 1;
pub const MOD_HAS_BOUND: u32 = 4;

/// Edge length of one liquid cell inside a WMO group
pub const LIQUID_TILE_SIZE: f32 = 533.33333 / 128.0;
