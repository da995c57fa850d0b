// Per map spatial index: loaded tiles of model placements and the queries over them

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::{debug, trace};

use crate::bih::Bih;
use crate::error::{LoadResult, Result};
use crate::io::{open_file, read_chunk, read_count, read_header, write_header};
use crate::math::{AaBox, Ray, Vec3};
use crate::model_cache::ModelCache;
use crate::model_instance::{LocationInfo, ModelIgnoreFlags, ModelInstance, ModelSpawn};

/// Upper bound on placements accepted from one file
const MAX_SPAWNS: u32 = 1 << 20;

/// Placements per BIH leaf in a tile tree
const TILE_LEAF_SIZE: u32 = 3;

/// Height searches also accept a surface lying exactly at the search limit
const HEIGHT_SEARCH_TOLERANCE: f32 = 1e-3;

pub fn map_file_name(map_id: u32) -> String {
    format!("{:03}.vmtree", map_id)
}

pub fn tile_file_name(map_id: u32, tile_x: u32, tile_y: u32) -> String {
    format!("{:03}_{:02}_{:02}.vmtile", map_id, tile_x, tile_y)
}

fn read_spawns<R: Read>(reader: &mut R) -> Result<Vec<ModelSpawn>> {
    let count = read_count(reader, MAX_SPAWNS, "spawn")?;
    let mut spawns = Vec::with_capacity(count);
    for _ in 0..count {
        spawns.push(ModelSpawn::read_from(reader)?);
    }
    Ok(spawns)
}

fn write_spawns<W: Write>(writer: &mut W, spawns: &[ModelSpawn]) -> Result<()> {
    writer.write_u32::<LittleEndian>(spawns.len() as u32)?;
    for spawn in spawns {
        spawn.write_to(writer)?;
    }
    Ok(())
}

fn create_file(path: &Path) -> Result<std::io::BufWriter<std::fs::File>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(std::io::BufWriter::new(std::fs::File::create(path)?))
}

/// Contents of a `.vmtree` file
#[derive(Debug, Clone, Default)]
pub struct MapFile {
    pub is_tiled: bool,
    /// Placements loaded with the map itself (non-tiled maps)
    pub global_spawns: Vec<ModelSpawn>,
}

impl MapFile {
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        read_header(reader)?;
        let is_tiled = reader.read_u8()? != 0;
        read_chunk(reader, b"GOBJ")?;
        let global_spawns = read_spawns(reader)?;
        Ok(Self {
            is_tiled,
            global_spawns,
        })
    }

    pub fn read_file(path: &Path) -> Result<Self> {
        let mut reader = open_file(path)?;
        Self::read_from(&mut reader)
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        write_header(writer)?;
        writer.write_u8(u8::from(self.is_tiled))?;
        writer.write_all(b"GOBJ")?;
        write_spawns(writer, &self.global_spawns)
    }

    pub fn write_file(&self, path: &Path) -> Result<()> {
        let mut out = create_file(path)?;
        self.write_to(&mut out)?;
        out.flush()?;
        Ok(())
    }
}

/// Contents of a `.vmtile` file
#[derive(Debug, Clone, Default)]
pub struct TileFile {
    pub spawns: Vec<ModelSpawn>,
}

impl TileFile {
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        read_header(reader)?;
        let spawns = read_spawns(reader)?;
        Ok(Self { spawns })
    }

    pub fn read_file(path: &Path) -> Result<Self> {
        let mut reader = open_file(path)?;
        Self::read_from(&mut reader)
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        write_header(writer)?;
        write_spawns(writer, &self.spawns)
    }

    pub fn write_file(&self, path: &Path) -> Result<()> {
        let mut out = create_file(path)?;
        self.write_to(&mut out)?;
        out.flush()?;
        Ok(())
    }
}

/// A fully constructed set of placements with its own hierarchy
#[derive(Debug)]
pub struct Tile {
    instances: Vec<ModelInstance>,
    tree: Bih,
    bound: Option<AaBox>,
}

impl Tile {
    /// Acquire every placement's model. On failure the models acquired so far
    /// are released as the partial instance list drops.
    pub fn build(spawns: Vec<ModelSpawn>, cache: &Arc<ModelCache>) -> Result<Self> {
        let mut instances = Vec::with_capacity(spawns.len());
        for spawn in spawns {
            let model = cache.acquire_handle(&spawn.name)?;
            instances.push(ModelInstance::new(spawn, model));
        }

        let bounds: Vec<AaBox> = instances.iter().map(ModelInstance::bound).collect();
        let bound = bounds.iter().copied().reduce(|mut acc, b| {
            acc.merge_box(&b);
            acc
        });
        let tree = Bih::build(&bounds, TILE_LEAF_SIZE);

        Ok(Self {
            instances,
            tree,
            bound,
        })
    }

    pub fn instances(&self) -> &[ModelInstance] {
        &self.instances
    }

    pub fn bound(&self) -> Option<AaBox> {
        self.bound
    }

    fn intersect_ray(&self, ray: &Ray, max_dist: &mut f32, stop_at_first_hit: bool, ignore_flags: ModelIgnoreFlags) -> bool {
        let Some(bound) = self.bound else {
            return false;
        };
        match ray.intersection_time(&bound) {
            Some(t) if t <= *max_dist => {}
            _ => return false,
        }

        let mut hit = false;
        self.tree.intersect_ray(ray, max_dist, stop_at_first_hit, |r, entry, dist, stop| {
            let result = self.instances[entry as usize].intersect_ray(r, dist, stop, ignore_flags);
            hit |= result;
            result
        });
        hit
    }

    fn location_info<'a>(&'a self, p: Vec3, info: &mut LocationInfo<'a>) {
        if !self.bound.is_some_and(|b| b.contains(p)) {
            return;
        }
        let instances = &self.instances;
        self.tree.intersect_point(p, |point, entry| {
            instances[entry as usize].location_info(point, info);
        });
    }
}

/// Spatial index of one map. Coordinates are in internal space.
#[derive(Debug)]
pub struct StaticMapTree {
    map_id: u32,
    base_path: PathBuf,
    is_tiled: bool,
    global: Option<Tile>,
    /// `None` marks a tile of a non-tiled map that was requested but carries no data
    tiles: HashMap<(u32, u32), Option<Tile>>,
}

impl StaticMapTree {
    /// Read the map file and load its global placements
    pub fn init(base_path: &Path, map_id: u32, cache: &Arc<ModelCache>) -> Result<Self> {
        let path = base_path.join(map_file_name(map_id));
        debug!("Initializing map tree {}", path.display());

        let map_file = MapFile::read_file(&path)?;
        let global = if map_file.global_spawns.is_empty() {
            None
        } else {
            Some(Tile::build(map_file.global_spawns, cache)?)
        };

        Ok(Self {
            map_id,
            base_path: base_path.to_path_buf(),
            is_tiled: map_file.is_tiled,
            global,
            tiles: HashMap::new(),
        })
    }

    /// Dry run of a map plus tile load: checks the files without touching the model cache
    pub fn can_load_map(base_path: &Path, map_id: u32, tile_x: u32, tile_y: u32) -> LoadResult {
        let map_file = match MapFile::read_file(&base_path.join(map_file_name(map_id))) {
            Ok(map_file) => map_file,
            Err(e) => return e.load_result(),
        };
        if !map_file.is_tiled {
            return LoadResult::Success;
        }

        match TileFile::read_file(&base_path.join(tile_file_name(map_id, tile_x, tile_y))) {
            Ok(_) => LoadResult::Success,
            Err(e) => e.load_result(),
        }
    }

    pub fn has_tile(&self, tile_x: u32, tile_y: u32) -> bool {
        self.tiles.contains_key(&(tile_x, tile_y))
    }

    pub fn loaded_tile_count(&self) -> usize {
        self.tiles.len()
    }

    /// Build the tile for (x, y) without modifying the index.
    /// Non-tiled maps have no per-tile data and yield `None`.
    pub fn prepare_tile(&self, tile_x: u32, tile_y: u32, cache: &Arc<ModelCache>) -> Result<Option<Tile>> {
        if !self.is_tiled {
            return Ok(None);
        }

        let path = self.base_path.join(tile_file_name(self.map_id, tile_x, tile_y));
        debug!("Loading tile {}", path.display());
        let tile_file = TileFile::read_file(&path)?;
        Tile::build(tile_file.spawns, cache).map(Some)
    }

    /// Make a prepared tile visible. If the tile is already loaded the new one is
    /// handed back so the caller can drop it outside any lock.
    pub fn insert_tile(&mut self, tile_x: u32, tile_y: u32, tile: Option<Tile>) -> Option<Tile> {
        if self.has_tile(tile_x, tile_y) {
            return tile;
        }
        self.tiles.insert((tile_x, tile_y), tile);
        None
    }

    /// Load (x, y) in one step. Loading a tile twice is a no-op.
    pub fn load_tile(&mut self, tile_x: u32, tile_y: u32, cache: &Arc<ModelCache>) -> LoadResult {
        if self.has_tile(tile_x, tile_y) {
            return LoadResult::Success;
        }
        match self.prepare_tile(tile_x, tile_y, cache) {
            Ok(tile) => {
                self.insert_tile(tile_x, tile_y, tile);
                LoadResult::Success
            }
            Err(e) => e.load_result(),
        }
    }

    /// Detach (x, y) from the index. The returned tile still holds its model references.
    pub fn remove_tile(&mut self, tile_x: u32, tile_y: u32) -> Option<Tile> {
        self.tiles.remove(&(tile_x, tile_y)).flatten()
    }

    /// Detach every tile, including the global placements
    pub fn take_all(&mut self) -> Vec<Tile> {
        let mut tiles: Vec<Tile> = self.tiles.drain().filter_map(|(_, tile)| tile).collect();
        tiles.extend(self.global.take());
        tiles
    }

    fn loaded_tiles(&self) -> impl Iterator<Item = &Tile> {
        self.global.iter().chain(self.tiles.values().filter_map(Option::as_ref))
    }

    pub fn instance_count(&self) -> usize {
        self.loaded_tiles().map(|tile| tile.instances.len()).sum()
    }

    fn get_intersection_time(
        &self,
        ray: &Ray,
        max_dist: &mut f32,
        stop_at_first_hit: bool,
        ignore_flags: ModelIgnoreFlags,
    ) -> bool {
        let mut hit = false;
        for tile in self.loaded_tiles() {
            if tile.intersect_ray(ray, max_dist, stop_at_first_hit, ignore_flags) {
                hit = true;
                if stop_at_first_hit {
                    break;
                }
            }
        }
        hit
    }

    pub fn is_in_line_of_sight(&self, p1: Vec3, p2: Vec3, ignore_flags: ModelIgnoreFlags) -> bool {
        let max_dist = (p2 - p1).length();
        // coordinates that overflow cannot be answered
        if !max_dist.is_finite() {
            return true;
        }
        if max_dist < 1e-10 {
            return true;
        }

        let ray = Ray::new(p1, (p2 - p1) / max_dist);
        let mut dist = max_dist;
        !self.get_intersection_time(&ray, &mut dist, true, ignore_flags)
    }

    /// Closest hit on the segment p1 -> p2. On a hit the point is moved along the
    /// ray by `modify_dist`, never back past p1. Without a hit p2 is returned.
    pub fn get_object_hit_pos(&self, p1: Vec3, p2: Vec3, modify_dist: f32) -> (bool, Vec3) {
        let max_dist = (p2 - p1).length();
        if !max_dist.is_finite() || max_dist < 1e-10 {
            return (false, p2);
        }

        let dir = (p2 - p1) / max_dist;
        let ray = Ray::new(p1, dir);
        let mut dist = max_dist;
        if !self.get_intersection_time(&ray, &mut dist, false, ModelIgnoreFlags::NOTHING) {
            return (false, p2);
        }

        let hit_pos = ray.point_at(dist);
        let result = if modify_dist < 0.0 {
            if (hit_pos - p1).length() > -modify_dist {
                hit_pos + dir * modify_dist
            } else {
                p1
            }
        } else {
            hit_pos + dir * modify_dist
        };
        trace!("Map {} object hit at {:?}", self.map_id, result);
        (true, result)
    }

    /// Height of the first surface below `p` within `max_search_dist`, or infinity
    pub fn get_height(&self, p: Vec3, max_search_dist: f32) -> f32 {
        let ray = Ray::new(p, Vec3::new(0.0, 0.0, -1.0));
        let mut max_dist = max_search_dist + HEIGHT_SEARCH_TOLERANCE;
        if self.get_intersection_time(&ray, &mut max_dist, false, ModelIgnoreFlags::NOTHING) {
            p.z - max_dist
        } else {
            f32::INFINITY
        }
    }

    /// Highest floor below `p` over every placement whose volume contains it
    pub fn get_location_info(&self, p: Vec3) -> Option<LocationInfo<'_>> {
        let mut info = LocationInfo::default();
        for tile in self.loaded_tiles() {
            tile.location_info(p, &mut info);
        }
        info.hit_model.is_some().then_some(info)
    }
}
