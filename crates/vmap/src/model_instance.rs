// Model placements: one positioned instance of a shared world model

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Result, VmapError};
use crate::io::{read_vec3, write_vec3};
use crate::math::{deg_to_rad, AaBox, Matrix3, Ray, Vec3};
use crate::model::GroupModel;
use crate::model_cache::ModelHandle;
use crate::{MOD_HAS_BOUND, MOD_M2};

const MAX_NAME_LENGTH: usize = 500;

/// Placement classes a line of sight query may skip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModelIgnoreFlags(u32);

impl ModelIgnoreFlags {
    pub const NOTHING: ModelIgnoreFlags = ModelIgnoreFlags(0x00);
    pub const M2: ModelIgnoreFlags = ModelIgnoreFlags(0x01);

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: ModelIgnoreFlags) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }
}

impl std::ops::BitOr for ModelIgnoreFlags {
    type Output = ModelIgnoreFlags;

    fn bitor(self, rhs: ModelIgnoreFlags) -> ModelIgnoreFlags {
        ModelIgnoreFlags(self.0 | rhs.0)
    }
}

/// One placement record as stored in map and tile files
#[derive(Clone, Debug, PartialEq)]
pub struct ModelSpawn {
    pub flags: u32,
    pub adt_id: u16,
    pub id: u32,
    pub pos: Vec3,
    /// Euler angles in degrees
    pub rot: Vec3,
    pub scale: f32,
    pub bound: Option<AaBox>,
    pub name: String,
}

impl ModelSpawn {
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let flags = reader.read_u32::<LittleEndian>()?;
        let adt_id = reader.read_u16::<LittleEndian>()?;
        let id = reader.read_u32::<LittleEndian>()?;
        let pos = read_vec3(reader)?;
        let rot = read_vec3(reader)?;
        let scale = reader.read_f32::<LittleEndian>()?;

        let bound = if (flags & MOD_HAS_BOUND) != 0 {
            let min = read_vec3(reader)?;
            let max = read_vec3(reader)?;
            Some(AaBox::new(min, max))
        } else {
            None
        };

        let name_len = reader.read_u32::<LittleEndian>()? as usize;
        if name_len > MAX_NAME_LENGTH {
            return Err(VmapError::Corrupt(format!("ModelSpawn name length too large: {}", name_len)));
        }
        let mut name_buf = vec![0u8; name_len];
        reader.read_exact(&mut name_buf)?;
        let name = String::from_utf8_lossy(&name_buf).to_string();

        if !(scale.is_finite() && scale > 0.0) || !pos.is_finite() || !rot.is_finite() {
            return Err(VmapError::Corrupt(format!("ModelSpawn {} has an invalid transform", id)));
        }

        Ok(Self {
            flags,
            adt_id,
            id,
            pos,
            rot,
            scale,
            bound,
            name,
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let flags = match self.bound {
            Some(_) => self.flags | MOD_HAS_BOUND,
            None => self.flags & !MOD_HAS_BOUND,
        };
        writer.write_u32::<LittleEndian>(flags)?;
        writer.write_u16::<LittleEndian>(self.adt_id)?;
        writer.write_u32::<LittleEndian>(self.id)?;
        write_vec3(writer, self.pos)?;
        write_vec3(writer, self.rot)?;
        writer.write_f32::<LittleEndian>(self.scale)?;
        if let Some(bound) = self.bound {
            write_vec3(writer, bound.min)?;
            write_vec3(writer, bound.max)?;
        }
        writer.write_u32::<LittleEndian>(self.name.len() as u32)?;
        writer.write_all(self.name.as_bytes())?;
        Ok(())
    }

    /// Model-to-world rotation
    pub fn rotation(&self) -> Matrix3 {
        Matrix3::from_euler_zyx(deg_to_rad(self.rot.y), deg_to_rad(self.rot.x), deg_to_rad(self.rot.z))
    }
}

/// Result of a location query: the highest floor below the point and what owns it
#[derive(Debug, Clone, Copy)]
pub struct LocationInfo<'a> {
    pub hit_instance: Option<&'a ModelInstance>,
    pub hit_model: Option<&'a GroupModel>,
    pub root_id: u32,
    pub ground_z: f32,
}

impl Default for LocationInfo<'_> {
    fn default() -> Self {
        Self {
            hit_instance: None,
            hit_model: None,
            root_id: 0,
            ground_z: f32::NEG_INFINITY,
        }
    }
}

/// A spawn bound to its loaded model. Dropping it releases the model reference.
#[derive(Debug)]
pub struct ModelInstance {
    spawn: ModelSpawn,
    bound: AaBox,
    rot: Matrix3,
    inv_rot: Matrix3,
    inv_scale: f32,
    model: ModelHandle,
}

impl ModelInstance {
    pub fn new(spawn: ModelSpawn, model: ModelHandle) -> Self {
        let rot = spawn.rotation();
        let bound = match spawn.bound {
            Some(bound) => bound,
            None => {
                let corners = model.bound().corners();
                AaBox::from_points(corners.iter().map(|&c| rot * (c * spawn.scale) + spawn.pos))
                    .unwrap_or_else(|| AaBox::from_point(spawn.pos))
            }
        };

        Self {
            inv_rot: rot.transpose(),
            inv_scale: 1.0 / spawn.scale,
            rot,
            bound,
            spawn,
            model,
        }
    }

    pub fn spawn(&self) -> &ModelSpawn {
        &self.spawn
    }

    pub fn id(&self) -> u32 {
        self.spawn.id
    }

    pub fn adt_id(&self) -> u16 {
        self.spawn.adt_id
    }

    pub fn bound(&self) -> AaBox {
        self.bound
    }

    fn to_model_space(&self, p: Vec3) -> Vec3 {
        self.inv_rot * (p - self.spawn.pos) * self.inv_scale
    }

    /// Intersect in model space; on a hit `max_dist` is set to the world-space distance
    pub fn intersect_ray(
        &self,
        ray: &Ray,
        max_dist: &mut f32,
        stop_at_first_hit: bool,
        ignore_flags: ModelIgnoreFlags,
    ) -> bool {
        match ray.intersection_time(&self.bound) {
            Some(t) if t <= *max_dist => {}
            _ => return false,
        }

        let model_ray = Ray::new(self.to_model_space(ray.origin), self.inv_rot * ray.direction);
        let mut distance = *max_dist * self.inv_scale;
        let hit = self
            .model
            .intersect_ray(&model_ray, &mut distance, stop_at_first_hit, ignore_flags);
        if hit {
            *max_dist = distance * self.spawn.scale;
        }
        hit
    }

    /// Update `info` if this placement has a floor below `p` higher than the current one
    pub fn location_info<'a>(&'a self, p: Vec3, info: &mut LocationInfo<'a>) -> bool {
        // M2 models carry no area information
        if self.spawn.flags & MOD_M2 != 0 {
            return false;
        }
        if !self.bound.contains(p) {
            return false;
        }

        let p_model = self.to_model_space(p);
        let z_dir_model = self.inv_rot * Vec3::new(0.0, 0.0, -1.0);

        let Some((group, z_dist)) = self.model.location_info(p_model, z_dir_model) else {
            return false;
        };

        let model_ground = p_model + z_dir_model * z_dist;
        let world_z = (self.rot * model_ground * self.spawn.scale + self.spawn.pos).z;
        if info.ground_z < world_z {
            info.ground_z = world_z;
            info.hit_instance = Some(self);
            info.hit_model = Some(group);
            info.root_id = self.model.root_wmo_id();
            return true;
        }
        false
    }

    /// World-space liquid surface height of `group` at `p`. Placements are assumed untilted.
    pub fn liquid_level(&self, p: Vec3, group: &GroupModel) -> Option<f32> {
        let p_model = self.to_model_space(p);
        group
            .liquid_level(p_model)
            .map(|z| z * self.spawn.scale + self.spawn.pos.z)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Cursor;

    pub(crate) fn spawn(id: u32, name: &str, pos: Vec3) -> ModelSpawn {
        ModelSpawn {
            flags: 0,
            adt_id: 3,
            id,
            pos,
            rot: Vec3::ZERO,
            scale: 1.0,
            bound: None,
            name: name.to_string(),
        }
    }

    #[test]
    fn test_spawn_record_round_trip() {
        let mut s = spawn(12, "World/wmo/tower.wmo", Vec3::new(1.0, 2.0, 3.0));
        s.rot = Vec3::new(0.0, 90.0, 0.0);
        s.scale = 1.5;
        s.bound = Some(AaBox::new(Vec3::ZERO, Vec3::splat(4.0)));

        let mut buf = Vec::new();
        s.write_to(&mut buf).unwrap();
        let loaded = ModelSpawn::read_from(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(loaded.flags & MOD_HAS_BOUND, MOD_HAS_BOUND);
        assert_eq!(loaded.bound, s.bound);
        assert_eq!(loaded.name, s.name);
        assert_eq!(loaded.scale, 1.5);
    }

    #[test]
    fn test_spawn_rejects_bad_records() {
        let mut s = spawn(1, "a.wmo", Vec3::ZERO);
        s.scale = 0.0;
        let mut buf = Vec::new();
        s.write_to(&mut buf).unwrap();
        assert!(ModelSpawn::read_from(&mut Cursor::new(&buf)).is_err());

        let s = spawn(1, &"x".repeat(600), Vec3::ZERO);
        let mut buf = Vec::new();
        s.write_to(&mut buf).unwrap();
        assert!(matches!(
            ModelSpawn::read_from(&mut Cursor::new(&buf)),
            Err(VmapError::Corrupt(_))
        ));
    }

    #[test]
    fn test_ignore_flags() {
        assert!(ModelIgnoreFlags::M2.contains(ModelIgnoreFlags::M2));
        assert!(!ModelIgnoreFlags::NOTHING.contains(ModelIgnoreFlags::M2));
        assert!(!ModelIgnoreFlags::M2.contains(ModelIgnoreFlags::NOTHING));
        assert_eq!((ModelIgnoreFlags::NOTHING | ModelIgnoreFlags::M2).bits(), 1);
    }
}
