#![allow(dead_code)]

use std::path::Path;

use mangos_vmap::{
    convert_position_to_internal_rep, map_file_name, tile_file_name, GroupModel, MapFile, MeshTriangle, ModelSpawn,
    TileFile, VMapManager, Vec3, VmapConfig, WmoLiquid, WorldModel,
};
use tempfile::TempDir;

/// A vmaps directory populated with the crate's own writers
pub struct VmapFixture {
    pub dir: TempDir,
}

impl VmapFixture {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn manager(&self) -> VMapManager {
        VMapManager::new(VmapConfig::new(self.path()))
    }

    pub fn write_model(&self, name: &str, model: &WorldModel) {
        model.write_file(&self.path().join(format!("{}.vmo", name))).unwrap();
    }

    pub fn write_map(&self, map_id: u32, is_tiled: bool, global_spawns: Vec<ModelSpawn>) {
        MapFile {
            is_tiled,
            global_spawns,
        }
        .write_file(&self.path().join(map_file_name(map_id)))
        .unwrap();
    }

    pub fn write_tile(&self, map_id: u32, x: u32, y: u32, spawns: Vec<ModelSpawn>) {
        TileFile { spawns }
            .write_file(&self.path().join(tile_file_name(map_id, x, y)))
            .unwrap();
    }

    pub fn write_raw(&self, file_name: &str, bytes: &[u8]) {
        std::fs::write(self.path().join(file_name), bytes).unwrap();
    }
}

fn square(half: f32, z: f32, first: u32) -> (Vec<Vec3>, Vec<MeshTriangle>) {
    let vertices = vec![
        Vec3::new(-half, -half, z),
        Vec3::new(half, -half, z),
        Vec3::new(half, half, z),
        Vec3::new(-half, half, z),
    ];
    let triangles = vec![
        MeshTriangle::new(first, first + 1, first + 2),
        MeshTriangle::new(first, first + 2, first + 3),
    ];
    (vertices, triangles)
}

/// Single horizontal square at model height 0
pub fn flat_square_model(half: f32, root_id: u32) -> WorldModel {
    let (vertices, triangles) = square(half, 0.0, 0);
    WorldModel::new(root_id, 0, vec![GroupModel::new(0, 100, vertices, triangles, None)])
}

/// Floor at model height 0, roof at `height`, so points in between have a floor below them
pub fn box_model(half: f32, height: f32, root_id: u32, wmo_id: u32, liquid: Option<WmoLiquid>) -> WorldModel {
    let (mut vertices, mut triangles) = square(half, 0.0, 0);
    let (roof_v, roof_t) = square(half, height, 4);
    vertices.extend(roof_v);
    triangles.extend(roof_t);
    WorldModel::new(root_id, 0, vec![GroupModel::new(0x2000, wmo_id, vertices, triangles, liquid)])
}

/// Unrotated, unscaled placement of `name` at a world position
pub fn spawn_at(id: u32, name: &str, world: Vec3) -> ModelSpawn {
    ModelSpawn {
        flags: 0,
        adt_id: 7,
        id,
        pos: convert_position_to_internal_rep(world),
        rot: Vec3::ZERO,
        scale: 1.0,
        bound: None,
        name: name.to_string(),
    }
}
