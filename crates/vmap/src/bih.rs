// Bounding interval hierarchy
//
// Flat node array, three u32 words per node:
//   word0: bits 30-31 split axis (3 = leaf), bit 29 BVH2 clip node,
//          low 29 bits child offset (inner) or first object index (leaf)
//   word1/word2: left/right clip planes as raw f32 bits (inner) or object count (leaf)

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Result, VmapError};
use crate::io::{read_count, read_vec3, write_vec3};
use crate::math::{AaBox, Ray, Vec3};

pub const MAX_STACK_SIZE: usize = 64;

const LEAF_TAG: u32 = 3 << 30;
const BVH2_TAG: u32 = 1 << 29;
const OFFSET_MASK: u32 = !(7 << 29);

/// Direction components below this are treated as parallel to an axis when
/// clipping the ray against the root bounds
const PARALLEL_EPSILON: f32 = 1e-6;

/// Upper bound on words/objects accepted from a file (sanity check only)
const MAX_FILE_ELEMENTS: u32 = 1 << 28;

#[derive(Clone, Copy)]
struct StackNode {
    node: usize,
    tnear: f32,
    tfar: f32,
}

#[derive(Clone, Debug)]
pub struct Bih {
    bounds: AaBox,
    tree: Vec<u32>,
    objects: Vec<u32>,
}

impl Default for Bih {
    fn default() -> Self {
        Self::new_empty()
    }
}

impl Bih {
    pub fn new_empty() -> Self {
        Self {
            bounds: AaBox::default(),
            tree: vec![LEAF_TAG, 0, 0],
            objects: Vec::new(),
        }
    }

    pub fn bounds(&self) -> AaBox {
        self.bounds
    }

    pub fn primitive_count(&self) -> usize {
        self.objects.len()
    }

    /// Build a hierarchy over `prim_bounds`; object ids are indices into that slice
    pub fn build(prim_bounds: &[AaBox], leaf_size: u32) -> Self {
        let num_prims = prim_bounds.len();
        if num_prims == 0 {
            return Self::new_empty();
        }

        let mut bounds = prim_bounds[0];
        for pb in &prim_bounds[1..] {
            bounds.merge_box(pb);
        }

        let mut indices: Vec<u32> = (0..num_prims as u32).collect();

        // space for the root node
        let mut tree = vec![LEAF_TAG, 0, 0];

        subdivide(
            0,
            num_prims as i32 - 1,
            &mut tree,
            &mut indices,
            prim_bounds,
            leaf_size.max(1) as i32,
            bounds,
            bounds,
            0,
            1,
        );

        Self {
            bounds,
            tree,
            objects: indices,
        }
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let min = read_vec3(reader)?;
        let max = read_vec3(reader)?;

        let tree_len = read_count(reader, MAX_FILE_ELEMENTS, "BIH tree")?;
        let mut tree = vec![0u32; tree_len];
        reader.read_u32_into::<LittleEndian>(&mut tree)?;

        let object_count = read_count(reader, MAX_FILE_ELEMENTS, "BIH object")?;
        let mut objects = vec![0u32; object_count];
        reader.read_u32_into::<LittleEndian>(&mut objects)?;

        let bih = Self {
            bounds: AaBox::new(min, max),
            tree,
            objects,
        };
        bih.validate()?;
        Ok(bih)
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        write_vec3(writer, self.bounds.min)?;
        write_vec3(writer, self.bounds.max)?;
        writer.write_u32::<LittleEndian>(self.tree.len() as u32)?;
        for value in &self.tree {
            writer.write_u32::<LittleEndian>(*value)?;
        }
        writer.write_u32::<LittleEndian>(self.objects.len() as u32)?;
        for value in &self.objects {
            writer.write_u32::<LittleEndian>(*value)?;
        }
        Ok(())
    }

    /// Reject trees whose offsets point outside the node or object arrays, or
    /// whose children do not come after their parent. Traversal only terminates
    /// on trees where every reachable child index is larger than its parent's.
    fn validate(&self) -> Result<()> {
        if self.tree.len() < 3 || self.tree.len() % 3 != 0 {
            return Err(VmapError::Corrupt(format!(
                "BIH tree size {} is not a positive multiple of 3",
                self.tree.len()
            )));
        }

        for node in (0..self.tree.len()).step_by(3) {
            let tn = self.tree[node];
            let offset = (tn & OFFSET_MASK) as usize;
            let valid = if tn & BVH2_TAG != 0 {
                offset > node && offset + 2 < self.tree.len()
            } else if tn >> 30 == 3 {
                offset + self.tree[node + 1] as usize <= self.objects.len()
            } else {
                // a -inf left clip marks a node with only a right child, never visited on the left
                let left_unused = f32::from_bits(self.tree[node + 1]) == f32::NEG_INFINITY;
                (offset > node || left_unused) && offset + 3 > node && offset + 5 < self.tree.len()
            };
            if !valid {
                return Err(VmapError::Corrupt(format!("BIH node {} has an invalid child offset", node / 3)));
            }
        }
        Ok(())
    }

    /// Check that every object id is a valid index for `primitive_count` primitives
    pub fn check_objects(&self, primitive_count: usize) -> Result<()> {
        match self.objects.iter().find(|&&o| o as usize >= primitive_count) {
            Some(bad) => Err(VmapError::Corrupt(format!(
                "BIH references object {} of {}",
                bad, primitive_count
            ))),
            None => Ok(()),
        }
    }

    /// Walk every leaf the ray can reach within `max_dist`.
    /// The callback receives the object id and may shrink `max_dist`; it returns
    /// whether it registered a hit.
    pub fn intersect_ray<F>(&self, ray: &Ray, max_dist: &mut f32, stop_at_first_hit: bool, mut callback: F)
    where
        F: FnMut(&Ray, u32, &mut f32, bool) -> bool,
    {
        let mut interval_min = -1.0f32;
        let mut interval_max = -1.0f32;
        let org = ray.origin;
        let dir = ray.direction;
        let mut inv_dir = [0.0f32; 3];

        for i in 0..3 {
            inv_dir[i] = 1.0 / dir[i];
            if dir[i].abs() > PARALLEL_EPSILON {
                let mut t1 = (self.bounds.min[i] - org[i]) * inv_dir[i];
                let mut t2 = (self.bounds.max[i] - org[i]) * inv_dir[i];
                if t1 > t2 {
                    std::mem::swap(&mut t1, &mut t2);
                }
                if t1 > interval_min {
                    interval_min = t1;
                }
                if t2 < interval_max || interval_max < 0.0 {
                    interval_max = t2;
                }
                // the interval can only shrink on the remaining axes
                if interval_max <= 0.0 || interval_min >= *max_dist {
                    return;
                }
            }
        }

        if interval_min > interval_max {
            return;
        }
        interval_min = interval_min.max(0.0);
        interval_max = interval_max.min(*max_dist);

        // near/far child selection from the direction sign bits
        let mut offset_front = [0usize; 3];
        let mut offset_back = [0usize; 3];
        let mut offset_front3 = [0usize; 3];
        let mut offset_back3 = [0usize; 3];
        for i in 0..3 {
            let front = (dir[i].to_bits() >> 31) as usize;
            let back = front ^ 1;
            offset_front3[i] = front * 3;
            offset_back3[i] = back * 3;
            offset_front[i] = front + 1;
            offset_back[i] = back + 1;
        }

        let mut stack: Vec<StackNode> = Vec::with_capacity(MAX_STACK_SIZE);
        let mut node = 0usize;

        loop {
            loop {
                let tn = self.tree[node];
                let axis = (tn >> 30) as usize;
                let bvh2 = tn & BVH2_TAG != 0;
                let offset = (tn & OFFSET_MASK) as usize;

                if !bvh2 {
                    if axis < 3 {
                        let tf = (f32::from_bits(self.tree[node + offset_front[axis]]) - org[axis]) * inv_dir[axis];
                        let tb = (f32::from_bits(self.tree[node + offset_back[axis]]) - org[axis]) * inv_dir[axis];

                        // ray passes between the clip zones
                        if tf < interval_min && tb > interval_max {
                            break;
                        }

                        let back = offset + offset_back3[axis];
                        node = back;
                        // far child only
                        if tf < interval_min {
                            interval_min = if tb >= interval_min { tb } else { interval_min };
                            continue;
                        }

                        node = offset + offset_front3[axis];
                        // near child only
                        if tb > interval_max {
                            interval_max = if tf <= interval_max { tf } else { interval_max };
                            continue;
                        }

                        // both children: visit near now, far later
                        stack.push(StackNode {
                            node: back,
                            tnear: if tb >= interval_min { tb } else { interval_min },
                            tfar: interval_max,
                        });
                        interval_max = if tf <= interval_max { tf } else { interval_max };
                        continue;
                    }

                    // leaf
                    let count = self.tree[node + 1] as usize;
                    for &object in &self.objects[offset..offset + count] {
                        let hit = callback(ray, object, max_dist, stop_at_first_hit);
                        if stop_at_first_hit && hit {
                            return;
                        }
                    }
                    break;
                }

                if axis > 2 {
                    return;
                }
                let tf = (f32::from_bits(self.tree[node + offset_front[axis]]) - org[axis]) * inv_dir[axis];
                let tb = (f32::from_bits(self.tree[node + offset_back[axis]]) - org[axis]) * inv_dir[axis];
                node = offset;
                interval_min = if tf >= interval_min { tf } else { interval_min };
                interval_max = if tb <= interval_max { tb } else { interval_max };
                if interval_min > interval_max {
                    break;
                }
            }

            loop {
                let Some(entry) = stack.pop() else {
                    return;
                };
                interval_min = entry.tnear;
                if *max_dist < interval_min {
                    continue;
                }
                node = entry.node;
                interval_max = entry.tfar;
                break;
            }
        }
    }

    /// Visit every leaf object whose clip region contains `point`
    pub fn intersect_point<F>(&self, point: Vec3, mut callback: F)
    where
        F: FnMut(Vec3, u32),
    {
        if !self.bounds.contains(point) {
            return;
        }

        let mut stack: Vec<usize> = Vec::with_capacity(MAX_STACK_SIZE);
        let mut node = 0usize;

        loop {
            loop {
                let tn = self.tree[node];
                let axis = (tn >> 30) as usize;
                let bvh2 = tn & BVH2_TAG != 0;
                let offset = (tn & OFFSET_MASK) as usize;

                if !bvh2 {
                    if axis < 3 {
                        let tl = f32::from_bits(self.tree[node + 1]);
                        let tr = f32::from_bits(self.tree[node + 2]);

                        // point lies between the clip zones
                        if tl < point[axis] && tr > point[axis] {
                            break;
                        }

                        let right = offset + 3;
                        node = right;
                        if tl < point[axis] {
                            continue;
                        }

                        node = offset;
                        if tr > point[axis] {
                            continue;
                        }

                        stack.push(right);
                        continue;
                    }

                    let count = self.tree[node + 1] as usize;
                    for &object in &self.objects[offset..offset + count] {
                        callback(point, object);
                    }
                    break;
                }

                if axis > 2 {
                    return;
                }
                let tl = f32::from_bits(self.tree[node + 1]);
                let tr = f32::from_bits(self.tree[node + 2]);
                node = offset;
                if tl > point[axis] || tr < point[axis] {
                    break;
                }
            }

            match stack.pop() {
                Some(next) => node = next,
                None => return,
            }
        }
    }
}

fn create_leaf(tree: &mut [u32], node_index: usize, left: i32, right: i32) {
    tree[node_index] = LEAF_TAG | left as u32;
    tree[node_index + 1] = (right - left + 1) as u32;
}

fn alloc_node(tree: &mut Vec<u32>) -> usize {
    let index = tree.len();
    tree.extend_from_slice(&[0, 0, 0]);
    index
}

fn longest_axis(b: &AaBox) -> usize {
    let d = b.max - b.min;
    if d.x >= d.y && d.x >= d.z {
        0
    } else if d.y >= d.z {
        1
    } else {
        2
    }
}

#[allow(clippy::too_many_arguments)]
fn subdivide(
    left: i32,
    mut right: i32,
    tree: &mut Vec<u32>,
    indices: &mut [u32],
    prim_bounds: &[AaBox],
    max_prims: i32,
    mut grid_box: AaBox,
    mut node_box: AaBox,
    mut node_index: usize,
    depth: usize,
) {
    if (right - left + 1) <= max_prims || depth >= MAX_STACK_SIZE {
        create_leaf(tree, node_index, left, right);
        return;
    }

    let right_orig = right;
    let mut axis: i32 = -1;
    let mut clip_l: f32;
    let mut clip_r: f32;
    let mut prev_clip = f32::NAN;
    let mut split = f32::NAN;
    let mut was_left = true;

    loop {
        let prev_axis = axis;
        let prev_split = split;

        let a = longest_axis(&grid_box);
        axis = a as i32;
        split = 0.5 * (grid_box.min[a] + grid_box.max[a]);

        clip_l = f32::NEG_INFINITY;
        clip_r = f32::INFINITY;
        let mut node_l = f32::INFINITY;
        let mut node_r = f32::NEG_INFINITY;

        let mut i = left;
        while i <= right {
            let obj = indices[i as usize] as usize;
            let minb = prim_bounds[obj].min[a];
            let maxb = prim_bounds[obj].max[a];
            let center = (minb + maxb) * 0.5;
            if center <= split {
                i += 1;
                if clip_l < maxb {
                    clip_l = maxb;
                }
            } else {
                indices.swap(i as usize, right as usize);
                right -= 1;
                if clip_r > minb {
                    clip_r = minb;
                }
            }
            node_l = node_l.min(minb);
            node_r = node_r.max(maxb);
        }

        // cut off empty space around the primitives with a BVH2 node
        if node_l > node_box.min[a] && node_r < node_box.max[a] {
            let node_box_w = node_box.max[a] - node_box.min[a];
            let node_new_w = node_r - node_l;
            if 1.3 * node_new_w < node_box_w {
                let next_index = alloc_node(tree);
                tree[node_index] = ((a as u32) << 30) | BVH2_TAG | next_index as u32;
                tree[node_index + 1] = node_l.to_bits();
                tree[node_index + 2] = node_r.to_bits();
                node_box = node_box.with_min_axis(a, node_l).with_max_axis(a, node_r);
                subdivide(left, right_orig, tree, indices, prim_bounds, max_prims, grid_box, node_box, next_index, depth + 1);
                return;
            }
        }

        let stuck = prev_axis == axis && !prev_split.is_nan() && (prev_split - split).abs() < 1e-6;

        if right == right_orig {
            // everything went left
            if stuck {
                create_leaf(tree, node_index, left, right);
                return;
            }
            grid_box = grid_box.with_max_axis(a, split);
            if clip_l <= split {
                prev_clip = clip_l;
                was_left = true;
                continue;
            }
            prev_clip = f32::NAN;
        } else if left > right {
            // everything went right
            right = right_orig;
            if stuck {
                create_leaf(tree, node_index, left, right);
                return;
            }
            grid_box = grid_box.with_min_axis(a, split);
            if clip_r >= split {
                prev_clip = clip_r;
                was_left = false;
                continue;
            }
            prev_clip = f32::NAN;
        } else {
            // an actual split; first emit the empty-space node of the previous pass
            if prev_axis != -1 && !prev_clip.is_nan() {
                let next_index = alloc_node(tree);
                if was_left {
                    tree[node_index] = ((prev_axis as u32) << 30) | next_index as u32;
                    tree[node_index + 1] = prev_clip.to_bits();
                    tree[node_index + 2] = f32::INFINITY.to_bits();
                } else {
                    tree[node_index] = ((prev_axis as u32) << 30) | (next_index as u32 - 3);
                    tree[node_index + 1] = f32::NEG_INFINITY.to_bits();
                    tree[node_index + 2] = prev_clip.to_bits();
                }
                node_index = next_index;
            }
            break;
        }
    }

    let a = axis as usize;
    let nl = right - left + 1;
    let nr = right_orig - right;

    // children are allocated next to each other: left at offset, right at offset + 3
    let mut next_index = tree.len();
    if nl > 0 {
        alloc_node(tree);
    } else {
        next_index -= 3;
    }
    if nr > 0 {
        alloc_node(tree);
    }

    tree[node_index] = ((a as u32) << 30) | next_index as u32;
    tree[node_index + 1] = clip_l.to_bits();
    tree[node_index + 2] = clip_r.to_bits();

    let grid_box_l = grid_box.with_max_axis(a, split);
    let grid_box_r = grid_box.with_min_axis(a, split);
    let node_box_l = node_box.with_max_axis(a, clip_l);
    let node_box_r = node_box.with_min_axis(a, clip_r);

    if nl > 0 {
        subdivide(left, right, tree, indices, prim_bounds, max_prims, grid_box_l, node_box_l, next_index, depth + 1);
    }
    if nr > 0 {
        subdivide(right + 1, right_orig, tree, indices, prim_bounds, max_prims, grid_box_r, node_box_r, next_index + 3, depth + 1);
    }
}
