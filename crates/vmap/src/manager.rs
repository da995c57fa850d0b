// Registry of per-map spatial indexes and the public query entry points.
// All coordinates accepted and returned here are world coordinates.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use mangos_shared::config::Config;
use mangos_shared::{CENTER_GRID_ID, MAX_NUMBER_OF_GRIDS, SIZE_OF_GRIDS};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, error, trace};

use crate::error::LoadResult;
use crate::map_tree::{StaticMapTree, Tile};
use crate::math::Vec3;
use crate::model::WorldModel;
use crate::model_cache::ModelCache;
use crate::model_instance::ModelIgnoreFlags;
use crate::VMAP_INVALID_HEIGHT_VALUE;

/// Half the edge length of the world grid: the centre of the internal coordinate space
pub const MAP_HALF_EXTENT: f32 = 0.5 * MAX_NUMBER_OF_GRIDS as f32 * SIZE_OF_GRIDS;

/// World to internal coordinates. The mapping is its own inverse.
pub fn convert_position_to_internal_rep(p: Vec3) -> Vec3 {
    Vec3::new(MAP_HALF_EXTENT - p.x, MAP_HALF_EXTENT - p.y, p.z)
}

/// Grid tile (x, y) containing a world position
pub fn grid_coords(world_x: f32, world_y: f32) -> (u32, u32) {
    let max = (MAX_NUMBER_OF_GRIDS - 1) as f32;
    let gx = (CENTER_GRID_ID as f32 - world_x / SIZE_OF_GRIDS).floor().clamp(0.0, max);
    let gy = (CENTER_GRID_ID as f32 - world_y / SIZE_OF_GRIDS).floor().clamp(0.0, max);
    (gx as u32, gy as u32)
}

/// Query kinds that can be switched off per map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DisableFlags(u32);

impl DisableFlags {
    pub const AREA_FLAG: DisableFlags = DisableFlags(0x1);
    pub const HEIGHT: DisableFlags = DisableFlags(0x2);
    pub const LOS: DisableFlags = DisableFlags(0x4);
    pub const LIQUID_STATUS: DisableFlags = DisableFlags(0x8);

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn intersects(self, other: DisableFlags) -> bool {
        self.0 & other.0 != 0
    }
}

impl std::ops::BitOr for DisableFlags {
    type Output = DisableFlags;

    fn bitor(self, rhs: DisableFlags) -> DisableFlags {
        DisableFlags(self.0 | rhs.0)
    }
}

/// Per map switch consulted before every query
pub trait DisablePolicy: Send + Sync {
    fn is_vmap_disabled_for(&self, map_id: u32, flags: DisableFlags) -> bool;
}

/// Nothing is ever disabled
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDisables;

impl DisablePolicy for NoDisables {
    fn is_vmap_disabled_for(&self, _map_id: u32, _flags: DisableFlags) -> bool {
        false
    }
}

/// Disabled query kinds keyed by map id
#[derive(Debug, Clone, Default)]
pub struct DisableTable {
    maps: HashMap<u32, DisableFlags>,
}

impl DisableTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn disable(&mut self, map_id: u32, flags: DisableFlags) {
        let entry = self.maps.entry(map_id).or_default();
        *entry = *entry | flags;
    }
}

impl FromIterator<(u32, DisableFlags)> for DisableTable {
    fn from_iter<I: IntoIterator<Item = (u32, DisableFlags)>>(iter: I) -> Self {
        let mut table = DisableTable::new();
        for (map_id, flags) in iter {
            table.disable(map_id, flags);
        }
        table
    }
}

impl DisablePolicy for DisableTable {
    fn is_vmap_disabled_for(&self, map_id: u32, flags: DisableFlags) -> bool {
        self.maps.get(&map_id).is_some_and(|disabled| disabled.intersects(flags))
    }
}

/// Flags of a liquid type, matched against the mask requested by area queries
pub trait LiquidFlagsLookup: Send + Sync {
    fn liquid_flags(&self, liquid_type: u32) -> u32;
}

impl<F> LiquidFlagsLookup for F
where
    F: Fn(u32) -> u32 + Send + Sync,
{
    fn liquid_flags(&self, liquid_type: u32) -> u32 {
        self(liquid_type)
    }
}

/// Liquid type id to flags; unknown types have no flags
#[derive(Debug, Clone, Default)]
pub struct LiquidTypeTable {
    flags: HashMap<u32, u32>,
}

impl LiquidTypeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, liquid_type: u32, flags: u32) {
        self.flags.insert(liquid_type, flags);
    }
}

impl FromIterator<(u32, u32)> for LiquidTypeTable {
    fn from_iter<I: IntoIterator<Item = (u32, u32)>>(iter: I) -> Self {
        Self {
            flags: iter.into_iter().collect(),
        }
    }
}

impl LiquidFlagsLookup for LiquidTypeTable {
    fn liquid_flags(&self, liquid_type: u32) -> u32 {
        self.flags.get(&liquid_type).copied().unwrap_or(0)
    }
}

/// Construction parameters of a `VMapManager`
#[derive(Debug, Clone)]
pub struct VmapConfig {
    /// Directory holding the .vmtree, .vmtile and .vmo files
    pub vmap_dir: PathBuf,
    pub enable_line_of_sight: bool,
    pub enable_height: bool,
}

impl VmapConfig {
    pub fn new(vmap_dir: impl Into<PathBuf>) -> Self {
        Self {
            vmap_dir: vmap_dir.into(),
            enable_line_of_sight: true,
            enable_height: true,
        }
    }

    /// Read `DataDir`, `vmap.enableLOS` and `vmap.enableHeight`
    pub fn from_config(config: &Config) -> Self {
        let data_dir = config.get_string_default("DataDir", ".");
        Self {
            vmap_dir: Path::new(&data_dir).join("vmaps"),
            enable_line_of_sight: config.get_bool_default("vmap.enableLOS", true),
            enable_height: config.get_bool_default("vmap.enableHeight", true),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AreaInfo {
    pub group_id: u32,
    pub adt_id: u16,
    pub root_id: u32,
    pub mogp_flags: u32,
    pub unique_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LiquidInfo {
    pub liquid_type: u32,
    pub level: f32,
}

/// Floor below a point plus what the floor belongs to
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AreaAndLiquidData {
    pub floor_z: f32,
    pub area_info: Option<AreaInfo>,
    pub liquid_info: Option<LiquidInfo>,
}

type SharedMapTree = Arc<RwLock<StaticMapTree>>;

/// Owns the spatial index of every active map and the model cache shared by them.
///
/// Lock order is registry, then map, then the cache mutex. Tiles are built
/// before any map lock is taken for writing and dropped after it is released.
pub struct VMapManager {
    vmap_dir: PathBuf,
    enable_line_of_sight: AtomicBool,
    enable_height: AtomicBool,
    cache: Arc<ModelCache>,
    maps: RwLock<HashMap<u32, SharedMapTree>>,
    parent_maps: HashMap<u32, u32>,
    disables: Box<dyn DisablePolicy>,
    liquid_flags: Box<dyn LiquidFlagsLookup>,
}

impl VMapManager {
    pub fn new(config: VmapConfig) -> Self {
        Self {
            cache: Arc::new(ModelCache::new(&config.vmap_dir)),
            vmap_dir: config.vmap_dir,
            enable_line_of_sight: AtomicBool::new(config.enable_line_of_sight),
            enable_height: AtomicBool::new(config.enable_height),
            maps: RwLock::new(HashMap::new()),
            parent_maps: HashMap::new(),
            disables: Box::new(NoDisables),
            liquid_flags: Box::new(LiquidTypeTable::new()),
        }
    }

    pub fn with_disable_policy(mut self, policy: impl DisablePolicy + 'static) -> Self {
        self.disables = Box::new(policy);
        self
    }

    pub fn with_liquid_flags(mut self, lookup: impl LiquidFlagsLookup + 'static) -> Self {
        self.liquid_flags = Box::new(lookup);
        self
    }

    /// Install the child to parent map table from (parent, child) pairs
    pub fn initialize(&mut self, parent_map_data: impl IntoIterator<Item = (u32, u32)>) {
        for (parent, child) in parent_map_data {
            self.parent_maps.insert(child, parent);
        }
    }

    pub fn vmap_dir(&self) -> &Path {
        &self.vmap_dir
    }

    pub fn set_enable_line_of_sight_calc(&self, enabled: bool) {
        self.enable_line_of_sight.store(enabled, Ordering::Relaxed);
    }

    pub fn set_enable_height_calc(&self, enabled: bool) {
        self.enable_height.store(enabled, Ordering::Relaxed);
    }

    pub fn is_line_of_sight_calc_enabled(&self) -> bool {
        self.enable_line_of_sight.load(Ordering::Relaxed)
    }

    pub fn is_height_calc_enabled(&self) -> bool {
        self.enable_height.load(Ordering::Relaxed)
    }

    pub fn is_map_loading_enabled(&self) -> bool {
        self.is_line_of_sight_calc_enabled() || self.is_height_calc_enabled()
    }

    fn map_tree(&self, map_id: u32) -> Option<SharedMapTree> {
        self.maps.read().get(&map_id).cloned()
    }

    fn get_or_create_map_tree(&self, map_id: u32) -> Result<SharedMapTree, LoadResult> {
        if let Some(tree) = self.map_tree(map_id) {
            return Ok(tree);
        }

        let tree = match StaticMapTree::init(&self.vmap_dir, map_id, &self.cache) {
            Ok(tree) => tree,
            Err(e) => {
                error!("Could not initialize map {}: {}", map_id, e);
                return Err(e.load_result());
            }
        };

        // another thread may have registered the map meanwhile
        let (current, unused) = {
            let mut maps = self.maps.write();
            match maps.get(&map_id) {
                Some(existing) => (Arc::clone(existing), Some(tree)),
                None => {
                    let shared = Arc::new(RwLock::new(tree));
                    maps.insert(map_id, Arc::clone(&shared));
                    (shared, None)
                }
            }
        };
        drop(unused);
        Ok(current)
    }

    pub fn load_map_tile(&self, map_id: u32, tile_x: u32, tile_y: u32) -> LoadResult {
        if !self.is_map_loading_enabled() {
            return LoadResult::DisabledInConfig;
        }

        loop {
            let tree = match self.get_or_create_map_tree(map_id) {
                Ok(tree) => tree,
                Err(result) => return result,
            };

            if tree.read().has_tile(tile_x, tile_y) {
                return LoadResult::Success;
            }

            let prepared = tree.read().prepare_tile(tile_x, tile_y, &self.cache);
            match prepared {
                Ok(tile) => {
                    if self.commit_tile(map_id, &tree, tile_x, tile_y, tile) {
                        debug!("Loaded tile [{},{}] of map {}", tile_x, tile_y, map_id);
                        return LoadResult::Success;
                    }
                    debug!(
                        "Map {} was unloaded while tile [{},{}] was built, loading again",
                        map_id, tile_x, tile_y
                    );
                }
                Err(e) => {
                    error!("Could not load tile [{},{}] of map {}: {}", tile_x, tile_y, map_id, e);
                    let removed = {
                        let mut maps = self.maps.write();
                        let empty = maps
                            .get(&map_id)
                            .is_some_and(|t| Arc::ptr_eq(t, &tree) && t.read().loaded_tile_count() == 0);
                        if empty { maps.remove(&map_id) } else { None }
                    };
                    drop(removed);
                    return e.load_result();
                }
            }
        }
    }

    /// Insert a prepared tile into `tree` if `tree` is still the registered index
    /// of `map_id`. Returns false when the map was unloaded or replaced since
    /// `tree` was fetched; the tile is then dropped.
    fn commit_tile(&self, map_id: u32, tree: &SharedMapTree, tile_x: u32, tile_y: u32, tile: Option<Tile>) -> bool {
        let (committed, unused) = {
            let maps = self.maps.read();
            match maps.get(&map_id) {
                Some(current) if Arc::ptr_eq(current, tree) => {
                    (true, current.write().insert_tile(tile_x, tile_y, tile))
                }
                _ => (false, tile),
            }
        };
        drop(unused);
        committed
    }

    /// Unload one tile; the map itself goes once its last tile is gone
    pub fn unload_map_tile(&self, map_id: u32, tile_x: u32, tile_y: u32) {
        let removed = {
            let mut maps = self.maps.write();
            let Some(tree) = maps.get(&map_id).cloned() else {
                return;
            };
            let (tile, empty) = {
                let mut tree = tree.write();
                let tile = tree.remove_tile(tile_x, tile_y);
                (tile, tree.loaded_tile_count() == 0)
            };
            let map = if empty { maps.remove(&map_id) } else { None };
            (tile, map)
        };

        if removed.1.is_some() {
            debug!("Unloaded map {}", map_id);
        }
        drop(removed);
    }

    pub fn unload_map(&self, map_id: u32) {
        let Some(tree) = self.maps.write().remove(&map_id) else {
            return;
        };
        let tiles = tree.write().take_all();
        drop(tiles);
        debug!("Unloaded map {}", map_id);
    }

    pub fn is_in_line_of_sight(&self, map_id: u32, p1: Vec3, p2: Vec3, ignore_flags: ModelIgnoreFlags) -> bool {
        if !self.is_line_of_sight_calc_enabled() || self.disables.is_vmap_disabled_for(map_id, DisableFlags::LOS) {
            return true;
        }

        let Some(tree) = self.map_tree(map_id) else {
            return true;
        };
        let pos1 = convert_position_to_internal_rep(p1);
        let pos2 = convert_position_to_internal_rep(p2);
        if pos1 == pos2 {
            return true;
        }
        tree.read().is_in_line_of_sight(pos1, pos2, ignore_flags)
    }

    /// First hit on the segment p1 -> p2, moved by `modify_dist` along it. Returns p2 without a hit.
    pub fn get_object_hit_pos(&self, map_id: u32, p1: Vec3, p2: Vec3, modify_dist: f32) -> (bool, Vec3) {
        if !self.is_line_of_sight_calc_enabled() || self.disables.is_vmap_disabled_for(map_id, DisableFlags::LOS) {
            return (false, p2);
        }

        let Some(tree) = self.map_tree(map_id) else {
            return (false, p2);
        };
        let pos1 = convert_position_to_internal_rep(p1);
        let pos2 = convert_position_to_internal_rep(p2);
        let (hit, result) = tree.read().get_object_hit_pos(pos1, pos2, modify_dist);
        if !hit {
            return (false, p2);
        }
        (true, convert_position_to_internal_rep(result))
    }

    /// Height of the ground below `p`, or `VMAP_INVALID_HEIGHT_VALUE`
    pub fn get_height(&self, map_id: u32, p: Vec3, max_search_dist: f32) -> f32 {
        if !self.is_height_calc_enabled() || self.disables.is_vmap_disabled_for(map_id, DisableFlags::HEIGHT) {
            return VMAP_INVALID_HEIGHT_VALUE;
        }

        let Some(tree) = self.map_tree(map_id) else {
            return VMAP_INVALID_HEIGHT_VALUE;
        };
        let height = tree.read().get_height(convert_position_to_internal_rep(p), max_search_dist);
        trace!("Map {} height at {:?}: {}", map_id, p, height);
        if height.is_finite() { height } else { VMAP_INVALID_HEIGHT_VALUE }
    }

    /// Floor, area and liquid state at `p`. Liquid data is only reported when no
    /// liquid mask is requested or the liquid type's flags match it.
    pub fn get_area_and_liquid_data(&self, map_id: u32, p: Vec3, req_liquid_type: Option<u32>) -> Option<AreaAndLiquidData> {
        let tree = self.map_tree(map_id)?;
        let pos = convert_position_to_internal_rep(p);

        let tree = tree.read();
        let info = tree.get_location_info(pos)?;
        let (Some(instance), Some(group)) = (info.hit_instance, info.hit_model) else {
            return None;
        };

        let mut data = AreaAndLiquidData {
            floor_z: info.ground_z,
            area_info: None,
            liquid_info: None,
        };

        if !self.disables.is_vmap_disabled_for(map_id, DisableFlags::LIQUID_STATUS) {
            let liquid_type = group.liquid_type();
            let wanted = req_liquid_type.is_none_or(|mask| self.liquid_flags.liquid_flags(liquid_type) & mask != 0);
            if wanted {
                data.liquid_info = instance
                    .liquid_level(pos, group)
                    .map(|level| LiquidInfo { liquid_type, level });
            }
        }

        if !self.disables.is_vmap_disabled_for(map_id, DisableFlags::AREA_FLAG) {
            data.area_info = Some(AreaInfo {
                group_id: group.wmo_id(),
                adt_id: instance.adt_id(),
                root_id: info.root_id,
                mogp_flags: group.mogp_flags(),
                unique_id: instance.id(),
            });
        }

        Some(data)
    }

    /// Take a reference to a model outside of any tile. Pair with `release_model`.
    pub fn acquire_model(&self, name: &str) -> Option<Arc<WorldModel>> {
        self.cache.acquire(name).ok()
    }

    pub fn release_model(&self, name: &str) {
        self.cache.release(name);
    }

    /// Check that (x, y) of `map_id` could be loaded, without loading anything
    pub fn exists_map_tile(&self, map_id: u32, tile_x: u32, tile_y: u32) -> LoadResult {
        StaticMapTree::can_load_map(&self.vmap_dir, map_id, tile_x, tile_y)
    }

    pub fn get_parent_map_id(&self, map_id: u32) -> Option<u32> {
        self.parent_maps.get(&map_id).copied()
    }

    pub fn loaded_map_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.maps.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn loaded_tile_count(&self, map_id: u32) -> usize {
        self.map_tree(map_id).map_or(0, |tree| tree.read().loaded_tile_count())
    }

    pub fn loaded_model_count(&self) -> usize {
        self.cache.loaded_model_count()
    }

    pub fn model_ref_count(&self, name: &str) -> u32 {
        self.cache.ref_count(name)
    }
}

impl std::fmt::Debug for VMapManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VMapManager")
            .field("vmap_dir", &self.vmap_dir)
            .field("maps", &self.loaded_map_ids())
            .field("cache", &self.cache)
            .finish()
    }
}
