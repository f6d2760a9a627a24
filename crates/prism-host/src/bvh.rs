//! Binned SAH bounding volume hierarchy over triangles.
//!
//! A built hierarchy is serialized into device memory as one relocatable
//! blob, so compaction is a plain copy of its used prefix:
//!
//! ```text
//! BvhHeader | BvhNode[node_count] | BvhTriangle[triangle_count] | u32[triangle_count]
//! ```
//!
//! Triangles are stored in leaf order next to their original primitive index.

use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use prism_core::{Aabb, Ray, TriangleHit};
use prism_gpu::{GpuError, Result};

/// Magic at the start of every serialized hierarchy.
pub const BVH_MAGIC: [u8; 4] = *b"PBVH";
pub const BVH_VERSION: u32 = 1;

const BIN_COUNT: usize = 16;
const MAX_LEAF_TRIANGLES: u32 = 4;
const TRAVERSAL_STACK_DEPTH: usize = 64;
/// Scratch bytes per triangle: bounds, centroid and index.
const TEMP_BYTES_PER_TRIANGLE: u64 = 40;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct BvhHeader {
    pub magic: [u8; 4],
    pub version: u32,
    pub node_count: u32,
    pub triangle_count: u32,
    pub nodes_offset: u32,
    pub triangles_offset: u32,
    pub prim_ids_offset: u32,
    /// Bytes in use, the compacted size.
    pub total_size: u32,
}

/// Interior nodes have `count == 0` and children at `left_or_first` and
/// `left_or_first + 1`. Leaves cover `count` triangles from `left_or_first`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct BvhNode {
    pub min: [f32; 3],
    pub left_or_first: u32,
    pub max: [f32; 3],
    pub count: u32,
}

impl BvhNode {
    fn bounds(&self) -> Aabb {
        Aabb::new(Vec3::from(self.min), Vec3::from(self.max))
    }

    const fn is_leaf(&self) -> bool {
        self.count > 0
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct BvhTriangle {
    pub v0: [f32; 3],
    pub v1: [f32; 3],
    pub v2: [f32; 3],
}

const HEADER_SIZE: u64 = std::mem::size_of::<BvhHeader>() as u64;
const NODE_SIZE: u64 = std::mem::size_of::<BvhNode>() as u64;
const TRIANGLE_SIZE: u64 = std::mem::size_of::<BvhTriangle>() as u64;
const PRIM_ID_SIZE: u64 = std::mem::size_of::<u32>() as u64;

const fn serialized_size(node_count: u64, triangle_count: u64) -> u64 {
    HEADER_SIZE + node_count * NODE_SIZE + triangle_count * (TRIANGLE_SIZE + PRIM_ID_SIZE)
}

/// Output bytes a build may need: a binary tree over `n` leaves has at most
/// `2n - 1` nodes.
#[must_use]
pub const fn worst_case_size(triangle_count: u32) -> u64 {
    let n = triangle_count as u64;
    let nodes = if n == 0 { 0 } else { 2 * n - 1 };
    serialized_size(nodes, n)
}

/// Scratch bytes a build of `triangle_count` triangles needs.
#[must_use]
pub const fn temp_size(triangle_count: u32) -> u64 {
    triangle_count as u64 * TEMP_BYTES_PER_TRIANGLE
}

#[derive(Clone, Copy, Default)]
struct Bin {
    bounds: Aabb,
    count: u32,
}

/// A built hierarchy: nodes plus the leaf order of primitive indices.
#[derive(Debug, Clone)]
pub struct Bvh {
    nodes: Vec<BvhNode>,
    order: Vec<u32>,
}

impl Bvh {
    /// Build over `triangles`, indexed by primitive id.
    #[must_use]
    pub fn build(triangles: &[[Vec3; 3]]) -> Self {
        let mut builder = Builder::new(triangles);
        builder.build();
        Self {
            nodes: builder.nodes,
            order: builder.order,
        }
    }

    #[must_use]
    pub fn nodes(&self) -> &[BvhNode] {
        &self.nodes
    }

    /// Primitive ids in leaf order.
    #[must_use]
    pub fn order(&self) -> &[u32] {
        &self.order
    }

    /// Size of [`Self::serialize`] output.
    #[must_use]
    pub fn serialized_size(&self) -> u64 {
        serialized_size(self.nodes.len() as u64, self.order.len() as u64)
    }

    /// Serialize with the same `triangles` the hierarchy was built over.
    #[must_use]
    pub fn serialize(&self, triangles: &[[Vec3; 3]]) -> Vec<u8> {
        let node_count = self.nodes.len() as u64;
        let triangle_count = self.order.len() as u64;
        let nodes_offset = HEADER_SIZE;
        let triangles_offset = nodes_offset + node_count * NODE_SIZE;
        let prim_ids_offset = triangles_offset + triangle_count * TRIANGLE_SIZE;
        let total_size = self.serialized_size();

        let header = BvhHeader {
            magic: BVH_MAGIC,
            version: BVH_VERSION,
            node_count: node_count as u32,
            triangle_count: triangle_count as u32,
            nodes_offset: nodes_offset as u32,
            triangles_offset: triangles_offset as u32,
            prim_ids_offset: prim_ids_offset as u32,
            total_size: total_size as u32,
        };

        let mut bytes = Vec::with_capacity(total_size as usize);
        bytes.extend_from_slice(bytemuck::bytes_of(&header));
        bytes.extend_from_slice(bytemuck::cast_slice(&self.nodes));
        for &prim in &self.order {
            let [v0, v1, v2] = triangles[prim as usize];
            let triangle = BvhTriangle {
                v0: v0.to_array(),
                v1: v1.to_array(),
                v2: v2.to_array(),
            };
            bytes.extend_from_slice(bytemuck::bytes_of(&triangle));
        }
        bytes.extend_from_slice(bytemuck::cast_slice(&self.order));
        bytes
    }
}

struct Builder<'a> {
    triangles: &'a [[Vec3; 3]],
    bounds: Vec<Aabb>,
    centers: Vec<Vec3>,
    nodes: Vec<BvhNode>,
    order: Vec<u32>,
}

impl<'a> Builder<'a> {
    fn new(triangles: &'a [[Vec3; 3]]) -> Self {
        let bounds: Vec<Aabb> = triangles
            .iter()
            .map(|&[a, b, c]| Aabb::from_triangle(a, b, c))
            .collect();
        let centers = bounds.iter().map(Aabb::center).collect();
        Self {
            triangles,
            bounds,
            centers,
            nodes: Vec::new(),
            order: Vec::new(),
        }
    }

    fn build(&mut self) {
        if self.triangles.is_empty() {
            return;
        }
        self.order = (0..self.triangles.len() as u32).collect();
        self.nodes.reserve(2 * self.triangles.len() - 1);
        self.nodes.push(BvhNode {
            left_or_first: 0,
            count: self.triangles.len() as u32,
            ..Default::default()
        });
        self.update_bounds(0);

        let mut pending = vec![0usize];
        while let Some(node) = pending.pop() {
            if let Some(left) = self.split(node) {
                pending.push(left);
                pending.push(left + 1);
            }
        }
    }

    fn update_bounds(&mut self, index: usize) {
        let node = self.nodes[index];
        let first = node.left_or_first as usize;
        let bounds = self.order[first..first + node.count as usize]
            .iter()
            .fold(Aabb::EMPTY, |acc, &prim| acc.merge(&self.bounds[prim as usize]));
        self.nodes[index].min = bounds.min.to_array();
        self.nodes[index].max = bounds.max.to_array();
    }

    /// Split a leaf in two along the cheapest binned plane. Returns the index
    /// of the left child, `None` when the node stays a leaf.
    fn split(&mut self, index: usize) -> Option<usize> {
        let node = self.nodes[index];
        if node.count <= MAX_LEAF_TRIANGLES {
            return None;
        }
        let first = node.left_or_first as usize;
        let count = node.count as usize;
        let prims = first..first + count;

        // Bin over centroid bounds so coincident boxes still separate
        let centroid_bounds = self.order[prims.clone()]
            .iter()
            .fold(Aabb::EMPTY, |mut acc, &prim| {
                acc.expand_to_include(self.centers[prim as usize]);
                acc
            });
        let extent = centroid_bounds.size();
        let axis = if extent.x >= extent.y && extent.x >= extent.z {
            0
        } else if extent.y >= extent.z {
            1
        } else {
            2
        };
        if extent[axis] < 1e-6 {
            return None;
        }

        let split_min = centroid_bounds.min[axis];
        let scale = BIN_COUNT as f32 / extent[axis];
        let bin_of = |center: Vec3| (((center[axis] - split_min) * scale) as usize).min(BIN_COUNT - 1);

        let mut bins = [Bin::default(); BIN_COUNT];
        for &prim in &self.order[prims.clone()] {
            let bin = &mut bins[bin_of(self.centers[prim as usize])];
            bin.count += 1;
            bin.bounds = bin.bounds.merge(&self.bounds[prim as usize]);
        }

        let mut left_cost = [0.0f32; BIN_COUNT];
        let mut acc = Bin::default();
        for (i, bin) in bins.iter().enumerate() {
            acc.count += bin.count;
            acc.bounds = acc.bounds.merge(&bin.bounds);
            left_cost[i] = acc.bounds.surface_area() * acc.count as f32;
        }

        let mut best: Option<(usize, f32)> = None;
        let mut acc = Bin::default();
        for split in (1..BIN_COUNT).rev() {
            acc.count += bins[split].count;
            acc.bounds = acc.bounds.merge(&bins[split].bounds);
            let left_count = count as u32 - acc.count;
            if acc.count == 0 || left_count == 0 {
                continue;
            }
            let cost = left_cost[split - 1] + acc.bounds.surface_area() * acc.count as f32;
            if best.map_or(true, |(_, best_cost)| cost < best_cost) {
                best = Some((split, cost));
            }
        }

        let (split, _) = best?;

        let centers = &self.centers;
        let slice = &mut self.order[prims];
        let mut left = 0;
        for i in 0..slice.len() {
            if bin_of(centers[slice[i] as usize]) < split {
                slice.swap(i, left);
                left += 1;
            }
        }
        if left == 0 || left == count {
            return None;
        }

        let left_index = self.nodes.len();
        self.nodes.push(BvhNode {
            left_or_first: first as u32,
            count: left as u32,
            ..Default::default()
        });
        self.nodes.push(BvhNode {
            left_or_first: (first + left) as u32,
            count: (count - left) as u32,
            ..Default::default()
        });
        self.nodes[index].left_or_first = left_index as u32;
        self.nodes[index].count = 0;

        self.update_bounds(left_index);
        self.update_bounds(left_index + 1);
        Some(left_index)
    }
}

/// Closest intersection found by [`BvhView::intersect`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BvhHit {
    /// Index of the triangle in the build input.
    pub primitive: u32,
    pub hit: TriangleHit,
}

/// Read-only view of a serialized hierarchy in device memory.
///
/// Device memory carries no alignment guarantee, so records are copied out
/// one at a time.
#[derive(Clone, Copy, Debug)]
pub struct BvhView<'a> {
    header: BvhHeader,
    bytes: &'a [u8],
}

impl<'a> BvhView<'a> {
    /// Validate the header and every section bound.
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        let invalid = |what: &str| GpuError::InvalidHandle(format!("corrupt traversable: {what}"));

        let header: BvhHeader = bytes
            .get(..HEADER_SIZE as usize)
            .map(bytemuck::pod_read_unaligned)
            .ok_or_else(|| invalid("truncated header"))?;
        if header.magic != BVH_MAGIC {
            return Err(invalid("bad magic"));
        }
        if header.version != BVH_VERSION {
            return Err(invalid("unsupported version"));
        }

        let node_count = u64::from(header.node_count);
        let triangle_count = u64::from(header.triangle_count);
        let sections_fit = u64::from(header.nodes_offset) + node_count * NODE_SIZE
            <= u64::from(header.triangles_offset)
            && u64::from(header.triangles_offset) + triangle_count * TRIANGLE_SIZE
                <= u64::from(header.prim_ids_offset)
            && u64::from(header.prim_ids_offset) + triangle_count * PRIM_ID_SIZE
                <= u64::from(header.total_size)
            && u64::from(header.total_size) <= bytes.len() as u64;
        if !sections_fit {
            return Err(invalid("section out of bounds"));
        }
        if (node_count == 0) != (triangle_count == 0) {
            return Err(invalid("node and triangle counts disagree"));
        }

        Ok(Self {
            header,
            bytes: &bytes[..header.total_size as usize],
        })
    }

    /// Read the header of a serialized hierarchy without validating sections.
    #[must_use]
    pub fn peek_header(bytes: &[u8]) -> Option<BvhHeader> {
        bytes
            .get(..HEADER_SIZE as usize)
            .map(bytemuck::pod_read_unaligned)
            .filter(|header: &BvhHeader| header.magic == BVH_MAGIC)
    }

    #[must_use]
    pub fn header(&self) -> &BvhHeader {
        &self.header
    }

    fn record<T: Pod>(&self, offset: u32, index: u32) -> Option<T> {
        let size = std::mem::size_of::<T>();
        let start = offset as usize + index as usize * size;
        self.bytes
            .get(start..start + size)
            .map(bytemuck::pod_read_unaligned)
    }

    fn node(&self, index: u32) -> Option<BvhNode> {
        (index < self.header.node_count)
            .then(|| self.record(self.header.nodes_offset, index))
            .flatten()
    }

    fn triangle(&self, slot: u32) -> Option<BvhTriangle> {
        (slot < self.header.triangle_count)
            .then(|| self.record(self.header.triangles_offset, slot))
            .flatten()
    }

    fn primitive(&self, slot: u32) -> Option<u32> {
        (slot < self.header.triangle_count)
            .then(|| self.record(self.header.prim_ids_offset, slot))
            .flatten()
    }

    /// Closest triangle hit in `(t_min, t_max)`.
    ///
    /// Each accepted candidate is passed to `any_hit`; returning `false`
    /// ignores it.
    pub fn intersect(
        &self,
        ray: &Ray,
        t_min: f32,
        t_max: f32,
        mut any_hit: impl FnMut(u32, &TriangleHit) -> bool,
    ) -> Result<Option<BvhHit>> {
        if self.header.node_count == 0 {
            return Ok(None);
        }
        let corrupt = || GpuError::InvalidHandle("corrupt traversable: bad node link".to_string());

        let inv_dir = ray.direction.recip();
        let mut closest: Option<BvhHit> = None;
        let mut t_far = t_max;

        let mut stack = [0u32; TRAVERSAL_STACK_DEPTH];
        let mut depth = 1;
        while depth > 0 {
            depth -= 1;
            let node = self.node(stack[depth]).ok_or_else(corrupt)?;
            if node.bounds().intersect_ray(ray.origin, inv_dir, t_min, t_far).is_none() {
                continue;
            }

            if node.is_leaf() {
                for slot in node.left_or_first..node.left_or_first + node.count {
                    let tri = self.triangle(slot).ok_or_else(corrupt)?;
                    let Some(hit) = ray.intersect_triangle(
                        Vec3::from(tri.v0),
                        Vec3::from(tri.v1),
                        Vec3::from(tri.v2),
                        t_min,
                        t_far,
                    ) else {
                        continue;
                    };
                    let primitive = self.primitive(slot).ok_or_else(corrupt)?;
                    if any_hit(primitive, &hit) {
                        t_far = hit.t;
                        closest = Some(BvhHit { primitive, hit });
                    }
                }
                continue;
            }

            if depth + 2 > TRAVERSAL_STACK_DEPTH {
                return Err(GpuError::Launch("traversal stack overflow".to_string()));
            }
            let left = node.left_or_first;
            let (near, far) = self.order_children(left, ray, inv_dir)?;
            stack[depth] = far;
            stack[depth + 1] = near;
            depth += 2;
        }

        Ok(closest)
    }

    /// Children of an interior node, nearest entry first.
    fn order_children(&self, left: u32, ray: &Ray, inv_dir: Vec3) -> Result<(u32, u32)> {
        let corrupt = || GpuError::InvalidHandle("corrupt traversable: bad node link".to_string());
        let entry = |index: u32| -> Result<f32> {
            let node = self.node(index).ok_or_else(corrupt)?;
            Ok(node
                .bounds()
                .intersect_ray(ray.origin, inv_dir, 0.0, f32::INFINITY)
                .unwrap_or(f32::INFINITY))
        };
        let right = left + 1;
        if entry(right)? < entry(left)? {
            Ok((right, left))
        } else {
            Ok((left, right))
        }
    }
}
