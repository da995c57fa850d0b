// World model geometry: the immutable triangle meshes loaded from .vmo files

use std::io::{Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::bih::Bih;
use crate::error::{Result, VmapError};
use crate::io::{
    open_file, read_chunk, read_count, read_header, read_optional_chunk, read_vec3, write_header,
    write_vec3,
};
use crate::math::{AaBox, Ray, Vec3};
use crate::model_instance::ModelIgnoreFlags;
use crate::{MOD_M2, LIQUID_TILE_SIZE};

/// Upper bound on vertex/triangle/group counts accepted from a file
const MAX_ELEMENTS: u32 = 1 << 24;

/// Offset used when casting down from inside a group volume
const INSIDE_RAY_OFFSET: f32 = 0.1;

const TRIANGLE_EPSILON: f32 = 1e-5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MeshTriangle {
    pub idx0: u32,
    pub idx1: u32,
    pub idx2: u32,
}

impl MeshTriangle {
    pub fn new(idx0: u32, idx1: u32, idx2: u32) -> Self {
        Self { idx0, idx1, idx2 }
    }
}

/// Liquid surface inside a WMO group, sampled on a grid of LIQUID_TILE_SIZE cells
#[derive(Clone, Debug)]
pub struct WmoLiquid {
    tiles_x: u32,
    tiles_y: u32,
    corner: Vec3,
    liquid_type: u32,
    heights: Vec<f32>,
    flags: Vec<u8>,
}

impl WmoLiquid {
    pub fn new(tiles_x: u32, tiles_y: u32, corner: Vec3, liquid_type: u32, heights: Vec<f32>, flags: Vec<u8>) -> Self {
        Self {
            tiles_x,
            tiles_y,
            corner,
            liquid_type,
            heights,
            flags,
        }
    }

    /// A flat liquid plane without per-tile data
    pub fn flat(liquid_type: u32, height: f32) -> Self {
        Self::new(0, 0, Vec3::ZERO, liquid_type, vec![height], Vec::new())
    }

    pub fn liquid_type(&self) -> u32 {
        self.liquid_type
    }

    /// Interpolated liquid height at `pos` (model space)
    pub fn liquid_height(&self, pos: Vec3) -> Option<f32> {
        if self.flags.is_empty() {
            return self.heights.first().copied();
        }

        let tx_f = (pos.x - self.corner.x) / LIQUID_TILE_SIZE;
        if tx_f < 0.0 || tx_f as u32 >= self.tiles_x {
            return None;
        }
        let ty_f = (pos.y - self.corner.y) / LIQUID_TILE_SIZE;
        if ty_f < 0.0 || ty_f as u32 >= self.tiles_y {
            return None;
        }
        let tx = tx_f as u32;
        let ty = ty_f as u32;

        // disabled tiles carry 0x?F
        if self.flags[(tx + ty * self.tiles_x) as usize] & 0x0F == 0x0F {
            return None;
        }

        let dx = tx_f - tx as f32;
        let dy = ty_f - ty as f32;
        let row = self.tiles_x + 1;
        let h = |x: u32, y: u32| self.heights[(x + y * row) as usize];

        // two triangles per tile, split along the (0,0)-(1,1) diagonal
        let height = if dx > dy {
            let sx = h(tx + 1, ty) - h(tx, ty);
            let sy = h(tx + 1, ty + 1) - h(tx + 1, ty);
            h(tx, ty) + dx * sx + dy * sy
        } else {
            let sx = h(tx + 1, ty + 1) - h(tx, ty + 1);
            let sy = h(tx, ty + 1) - h(tx, ty);
            h(tx, ty) + dx * sx + dy * sy
        };
        Some(height)
    }

    fn height_count(tiles_x: u32, tiles_y: u32) -> usize {
        if tiles_x == 0 && tiles_y == 0 {
            1
        } else {
            ((tiles_x + 1) * (tiles_y + 1)) as usize
        }
    }

    pub fn file_size(&self) -> u32 {
        let heights = Self::height_count(self.tiles_x, self.tiles_y) as u32;
        2 * 4 + 12 + 4 + heights * 4 + self.tiles_x * self.tiles_y
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let tiles_x = reader.read_u32::<LittleEndian>()?;
        let tiles_y = reader.read_u32::<LittleEndian>()?;
        if tiles_x > 1024 || tiles_y > 1024 {
            return Err(VmapError::Corrupt(format!("liquid size {}x{}", tiles_x, tiles_y)));
        }
        let corner = read_vec3(reader)?;
        let liquid_type = reader.read_u32::<LittleEndian>()?;

        let mut heights = vec![0.0f32; Self::height_count(tiles_x, tiles_y)];
        reader.read_f32_into::<LittleEndian>(&mut heights)?;

        let mut flags = vec![0u8; (tiles_x * tiles_y) as usize];
        reader.read_exact(&mut flags)?;

        Ok(Self::new(tiles_x, tiles_y, corner, liquid_type, heights, flags))
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<LittleEndian>(self.tiles_x)?;
        writer.write_u32::<LittleEndian>(self.tiles_y)?;
        write_vec3(writer, self.corner)?;
        writer.write_u32::<LittleEndian>(self.liquid_type)?;
        for i in 0..Self::height_count(self.tiles_x, self.tiles_y) {
            let value = self.heights.get(i).copied().unwrap_or(0.0);
            writer.write_f32::<LittleEndian>(value)?;
        }
        let mut flags = self.flags.clone();
        flags.resize((self.tiles_x * self.tiles_y) as usize, 0);
        writer.write_all(&flags)?;
        Ok(())
    }
}

/// One WMO group: a triangle mesh with its own BIH and optional liquid
#[derive(Clone, Debug)]
pub struct GroupModel {
    bound: AaBox,
    mogp_flags: u32,
    group_wmo_id: u32,
    vertices: Vec<Vec3>,
    triangles: Vec<MeshTriangle>,
    mesh_tree: Bih,
    liquid: Option<WmoLiquid>,
}

impl GroupModel {
    /// Build a group from raw geometry, computing its bound and triangle hierarchy
    pub fn new(
        mogp_flags: u32,
        group_wmo_id: u32,
        vertices: Vec<Vec3>,
        triangles: Vec<MeshTriangle>,
        liquid: Option<WmoLiquid>,
    ) -> Self {
        let bound = AaBox::from_points(vertices.iter().copied()).unwrap_or_default();
        let tri_bounds: Vec<AaBox> = triangles
            .iter()
            .map(|tri| {
                AaBox::from_points(
                    [tri.idx0, tri.idx1, tri.idx2]
                        .iter()
                        .filter_map(|&i| vertices.get(i as usize).copied()),
                )
                .unwrap_or_default()
            })
            .collect();
        let mesh_tree = Bih::build(&tri_bounds, 3);

        Self {
            bound,
            mogp_flags,
            group_wmo_id,
            vertices,
            triangles,
            mesh_tree,
            liquid,
        }
    }

    pub fn bound(&self) -> AaBox {
        self.bound
    }

    pub fn mogp_flags(&self) -> u32 {
        self.mogp_flags
    }

    pub fn wmo_id(&self) -> u32 {
        self.group_wmo_id
    }

    pub fn triangle_count(&self) -> usize {
        self.triangles.len()
    }

    pub fn liquid_type(&self) -> u32 {
        self.liquid.as_ref().map_or(0, WmoLiquid::liquid_type)
    }

    pub fn liquid_level(&self, pos: Vec3) -> Option<f32> {
        self.liquid.as_ref().and_then(|liquid| liquid.liquid_height(pos))
    }

    /// Closest triangle hit closer than `distance`; shrinks `distance` on a hit
    pub fn intersect_ray(&self, ray: &Ray, distance: &mut f32, stop_at_first_hit: bool) -> bool {
        if self.triangles.is_empty() {
            return false;
        }

        let mut hit = false;
        self.mesh_tree.intersect_ray(ray, distance, stop_at_first_hit, |r, entry, dist, _| {
            if intersect_triangle(&self.triangles[entry as usize], &self.vertices, r, dist) {
                hit = true;
            }
            hit
        });
        hit
    }

    /// Distance along `down` to the surface below `pos`, if `pos` is inside this group
    pub fn is_inside_object(&self, pos: Vec3, down: Vec3) -> Option<f32> {
        if self.triangles.is_empty() || !self.bound.contains(pos) {
            return None;
        }

        let ray = Ray::new(pos - down * INSIDE_RAY_OFFSET, down);
        let mut dist = f32::INFINITY;
        self.intersect_ray(&ray, &mut dist, false)
            .then(|| dist - INSIDE_RAY_OFFSET)
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let min = read_vec3(reader)?;
        let max = read_vec3(reader)?;
        let mogp_flags = reader.read_u32::<LittleEndian>()?;
        let group_wmo_id = reader.read_u32::<LittleEndian>()?;

        read_chunk(reader, b"VERT")?;
        let _chunk_size = reader.read_u32::<LittleEndian>()?;
        let count = read_count(reader, MAX_ELEMENTS, "vertex")?;

        let mut group = Self {
            bound: AaBox::new(min, max),
            mogp_flags,
            group_wmo_id,
            vertices: Vec::new(),
            triangles: Vec::new(),
            mesh_tree: Bih::new_empty(),
            liquid: None,
        };

        // groups without collision geometry end here
        if count == 0 {
            return Ok(group);
        }

        let mut vertices = Vec::with_capacity(count);
        for _ in 0..count {
            vertices.push(read_vec3(reader)?);
        }

        read_chunk(reader, b"TRIM")?;
        let _chunk_size = reader.read_u32::<LittleEndian>()?;
        let tcount = read_count(reader, MAX_ELEMENTS, "triangle")?;
        let mut triangles = Vec::with_capacity(tcount);
        for _ in 0..tcount {
            let tri = MeshTriangle::new(
                reader.read_u32::<LittleEndian>()?,
                reader.read_u32::<LittleEndian>()?,
                reader.read_u32::<LittleEndian>()?,
            );
            if [tri.idx0, tri.idx1, tri.idx2].iter().any(|&i| i as usize >= count) {
                return Err(VmapError::Corrupt(format!(
                    "triangle references vertex beyond {}",
                    count
                )));
            }
            triangles.push(tri);
        }

        read_chunk(reader, b"MBIH")?;
        let mesh_tree = Bih::read_from(reader)?;
        mesh_tree.check_objects(triangles.len())?;

        read_chunk(reader, b"LIQU")?;
        let liquid_size = reader.read_u32::<LittleEndian>()?;
        let liquid = if liquid_size > 0 {
            Some(WmoLiquid::read_from(reader)?)
        } else {
            None
        };

        group.vertices = vertices;
        group.triangles = triangles;
        group.mesh_tree = mesh_tree;
        group.liquid = liquid;
        Ok(group)
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        write_vec3(writer, self.bound.min)?;
        write_vec3(writer, self.bound.max)?;
        writer.write_u32::<LittleEndian>(self.mogp_flags)?;
        writer.write_u32::<LittleEndian>(self.group_wmo_id)?;

        writer.write_all(b"VERT")?;
        let count = self.vertices.len() as u32;
        writer.write_u32::<LittleEndian>(4 + count * 12)?;
        writer.write_u32::<LittleEndian>(count)?;
        if count == 0 {
            return Ok(());
        }
        for v in &self.vertices {
            write_vec3(writer, *v)?;
        }

        writer.write_all(b"TRIM")?;
        let tcount = self.triangles.len() as u32;
        writer.write_u32::<LittleEndian>(4 + tcount * 12)?;
        writer.write_u32::<LittleEndian>(tcount)?;
        for tri in &self.triangles {
            writer.write_u32::<LittleEndian>(tri.idx0)?;
            writer.write_u32::<LittleEndian>(tri.idx1)?;
            writer.write_u32::<LittleEndian>(tri.idx2)?;
        }

        writer.write_all(b"MBIH")?;
        self.mesh_tree.write_to(writer)?;

        writer.write_all(b"LIQU")?;
        let liquid_size = self.liquid.as_ref().map_or(0, WmoLiquid::file_size);
        writer.write_u32::<LittleEndian>(liquid_size)?;
        if let Some(liquid) = &self.liquid {
            liquid.write_to(writer)?;
        }

        Ok(())
    }
}

/// Ray/triangle test (Moller-Trumbore). Accepts hits with 0 < t < distance.
fn intersect_triangle(tri: &MeshTriangle, vertices: &[Vec3], ray: &Ray, distance: &mut f32) -> bool {
    let p0 = vertices[tri.idx0 as usize];
    let e1 = vertices[tri.idx1 as usize] - p0;
    let e2 = vertices[tri.idx2 as usize] - p0;

    let p = ray.direction.cross(e2);
    let a = e1.dot(p);
    if a.abs() < TRIANGLE_EPSILON {
        return false;
    }

    let f = 1.0 / a;
    let s = ray.origin - p0;
    let u = f * s.dot(p);
    if !(0.0..=1.0).contains(&u) {
        return false;
    }

    let q = s.cross(e1);
    let v = f * ray.direction.dot(q);
    if v < 0.0 || u + v > 1.0 {
        return false;
    }

    let t = f * e2.dot(q);
    if t > 0.0 && t < *distance {
        *distance = t;
        return true;
    }
    false
}

/// The geometry of one model file, shared by every placement that uses it
#[derive(Debug)]
pub struct WorldModel {
    root_wmo_id: u32,
    flags: u32,
    groups: Vec<GroupModel>,
    group_tree: Bih,
}

impl WorldModel {
    pub fn new(root_wmo_id: u32, flags: u32, groups: Vec<GroupModel>) -> Self {
        let group_bounds: Vec<AaBox> = groups.iter().map(GroupModel::bound).collect();
        let group_tree = Bih::build(&group_bounds, 1);
        Self {
            root_wmo_id,
            flags,
            groups,
            group_tree,
        }
    }

    pub fn root_wmo_id(&self) -> u32 {
        self.root_wmo_id
    }

    pub fn groups(&self) -> &[GroupModel] {
        &self.groups
    }

    /// Model-space bound of all groups
    pub fn bound(&self) -> AaBox {
        self.group_tree.bounds()
    }

    pub fn intersect_ray(
        &self,
        ray: &Ray,
        distance: &mut f32,
        stop_at_first_hit: bool,
        ignore_flags: ModelIgnoreFlags,
    ) -> bool {
        if ignore_flags.contains(ModelIgnoreFlags::M2) && self.flags & MOD_M2 != 0 {
            return false;
        }

        // no need for the group tree with a single group
        if self.groups.len() == 1 {
            return self.groups[0].intersect_ray(ray, distance, stop_at_first_hit);
        }

        let mut hit = false;
        self.group_tree.intersect_ray(ray, distance, stop_at_first_hit, |r, entry, dist, stop| {
            if self.groups[entry as usize].intersect_ray(r, dist, stop) {
                hit = true;
            }
            hit
        });
        hit
    }

    /// Group whose volume contains `p` with the nearest surface along `down`
    pub fn location_info(&self, p: Vec3, down: Vec3) -> Option<(&GroupModel, f32)> {
        if self.groups.is_empty() {
            return None;
        }

        let groups = &self.groups;
        let mut best: Option<(&GroupModel, f32)> = None;
        self.group_tree.intersect_point(p, |point, entry| {
            let group = &groups[entry as usize];
            if let Some(z_dist) = group.is_inside_object(point, down) {
                if best.is_none_or(|(_, d)| z_dist < d) {
                    best = Some((group, z_dist));
                }
            }
        });
        best
    }

    pub fn read_file(path: &Path) -> Result<Self> {
        let mut reader = open_file(path)?;
        Self::read_from(&mut reader)
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        read_header(reader)?;

        read_chunk(reader, b"WMOD")?;
        let chunk_size = reader.read_u32::<LittleEndian>()?;
        if chunk_size != 8 {
            return Err(VmapError::Corrupt(format!("WMOD chunk size {}", chunk_size)));
        }
        let root_wmo_id = reader.read_u32::<LittleEndian>()?;
        let flags = reader.read_u32::<LittleEndian>()?;

        // models without groups end after the WMOD chunk
        let (groups, group_tree) = if read_optional_chunk(reader, b"GMOD")? {
            let count = read_count(reader, MAX_ELEMENTS, "group")?;
            let mut groups = Vec::with_capacity(count);
            for _ in 0..count {
                groups.push(GroupModel::read_from(reader)?);
            }
            read_chunk(reader, b"GBIH")?;
            let group_tree = Bih::read_from(reader)?;
            group_tree.check_objects(groups.len())?;
            (groups, group_tree)
        } else {
            (Vec::new(), Bih::new_empty())
        };

        Ok(Self {
            root_wmo_id,
            flags,
            groups,
            group_tree,
        })
    }

    pub fn write_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::io::BufWriter::new(std::fs::File::create(path)?);
        self.write_to(&mut out)?;
        out.flush()?;
        Ok(())
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        write_header(writer)?;
        writer.write_all(b"WMOD")?;
        writer.write_u32::<LittleEndian>(8)?;
        writer.write_u32::<LittleEndian>(self.root_wmo_id)?;
        writer.write_u32::<LittleEndian>(self.flags)?;

        if !self.groups.is_empty() {
            writer.write_all(b"GMOD")?;
            writer.write_u32::<LittleEndian>(self.groups.len() as u32)?;
            for group in &self.groups {
                group.write_to(writer)?;
            }
            writer.write_all(b"GBIH")?;
            self.group_tree.write_to(writer)?;
        }
        Ok(())
    }
}
