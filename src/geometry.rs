use nalgebra::Point3;
use stl_io::read_stl;
use crate::{
    block::Block,
    error::RunnerError,
    field::FieldStore,
    kernels::CodegenContext,
    layout::PhysicalLayout,
};

/// Node classification stored in the encoded geometry map.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Fluid = 0,
    Wall = 1,
    /// Alignment padding beyond the logical lattice.
    Unused = 2,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GeometryStats {
    pub fluid: usize,
    pub wall: usize,
}

impl GeometryStats {
    /// Fraction of interior nodes that are fluid.
    pub fn fill_fraction(&self) -> f64 {
        let total = self.fluid + self.wall;
        if total == 0 {
            return 0.0;
        }
        self.fluid as f64 / total as f64
    }
}

/// Geometry of one block as seen by the runner.
pub trait GeoBlock: Send {
    /// (Re)builds the node map for `block` laid out as `layout`.
    fn reset(&mut self, block: &Block, layout: &PhysicalLayout) -> anyhow::Result<()>;

    /// One `NodeType` code per physical node, in distribution-plane order.
    fn encoded_map(&self) -> &[u32];

    fn update_context(&self, ctx: &mut CodegenContext) {
        ctx.insert("node_fluid", NodeType::Fluid as u32);
        ctx.insert("node_wall", NodeType::Wall as u32);
        ctx.insert("node_unused", NodeType::Unused as u32);
    }

    /// Geometry-dependent initialization of macroscopic fields.
    fn init_fields(&self, _fields: &mut FieldStore) -> anyhow::Result<()> {
        Ok(())
    }

    /// Node types of the logical lattice (padding stripped), for output.
    fn visualization_map(&self, layout: &PhysicalLayout) -> Vec<u32> {
        let map = self.encoded_map();
        let mut vis = Vec::with_capacity(layout.lat_nx() * layout.lat_ny() * layout.lat_nz());
        for z in 0..layout.lat_nz() {
            for y in 0..layout.lat_ny() {
                for x in 0..layout.lat_nx() {
                    vis.push(map[layout.node_index(x, y, z)]);
                }
            }
        }
        vis
    }

    /// Counts over the block interior (envelope excluded).
    fn stats(&self, block: &Block, layout: &PhysicalLayout) -> GeometryStats {
        let map = self.encoded_map();
        let env = block.envelope_size;
        let z_env = if block.dim() == 3 { env } else { 0 };
        let nz = if block.dim() == 3 { block.size[2] } else { 1 };
        let mut stats = GeometryStats::default();
        for z in 0..nz {
            for y in 0..block.size[1] {
                for x in 0..block.size[0] {
                    match map[layout.node_index(x + env, y + env, z + z_env)] {
                        t if t == NodeType::Wall as u32 => stats.wall += 1,
                        _ => stats.fluid += 1,
                    }
                }
            }
        }
        stats
    }
}

/// Fills the lattice with `fill` and the alignment padding with `Unused`.
fn base_map(layout: &PhysicalLayout, fill: NodeType) -> Vec<u32> {
    let mut map = vec![NodeType::Unused as u32; layout.num_nodes()];
    for z in 0..layout.lat_nz() {
        for y in 0..layout.lat_ny() {
            for x in 0..layout.lat_nx() {
                map[layout.node_index(x, y, z)] = fill as u32;
            }
        }
    }
    map
}

/// A block with no obstacles.
#[derive(Debug, Clone, Default)]
pub struct OpenBox {
    map: Vec<u32>,
}

impl OpenBox {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GeoBlock for OpenBox {
    fn reset(&mut self, _block: &Block, layout: &PhysicalLayout) -> anyhow::Result<()> {
        self.map = base_map(layout, NodeType::Fluid);
        Ok(())
    }

    fn encoded_map(&self) -> &[u32] {
        &self.map
    }
}

/// Wall nodes voxelized from an STL surface given in lattice units
/// (scaled by `dx`), 3-D lattices only.
#[derive(Debug, Clone)]
pub struct StlGeometry {
    triangles: Vec<[Point3<f32>; 3]>,
    dx: f32,
    map: Vec<u32>,
}

impl StlGeometry {
    pub fn from_stl(stl_path: &str, dx: f32) -> anyhow::Result<Self> {
        let mut file = std::fs::File::open(stl_path)?;
        let stl = read_stl(&mut file)?;
        let vertex = |i: usize| {
            let v = &stl.vertices[i];
            Point3::new(v[0], v[1], v[2])
        };
        let triangles = stl
            .faces
            .iter()
            .map(|face| [vertex(face.vertices[0]), vertex(face.vertices[1]), vertex(face.vertices[2])])
            .collect();
        Ok(Self::from_triangles(triangles, dx))
    }

    pub fn from_triangles(triangles: Vec<[Point3<f32>; 3]>, dx: f32) -> Self {
        Self { triangles, dx, map: Vec::new() }
    }

    fn voxelize_triangle(&mut self, vertices: &[Point3<f32>; 3], block: &Block, layout: &PhysicalLayout) {
        let env = block.envelope_size as i64;
        let dx = self.dx;

        // Triangle bounding box in global node indices.
        let lo = |axis: usize| vertices.iter().map(|v| v[axis]).fold(f32::INFINITY, f32::min);
        let hi = |axis: usize| vertices.iter().map(|v| v[axis]).fold(f32::NEG_INFINITY, f32::max);

        // Local array range covered by the box, clamped to the lattice.
        let lat = [layout.lat_nx(), layout.lat_ny(), layout.lat_nz()];
        let mut range = [(0usize, 0usize); 3];
        for axis in 0..3 {
            let origin = block.offset[axis] as i64 - env;
            let min = (lo(axis) / dx).floor() as i64 - origin;
            let max = (hi(axis) / dx).ceil() as i64 - origin;
            let min = min.clamp(0, lat[axis] as i64 - 1) as usize;
            let max = max.clamp(0, lat[axis] as i64 - 1) as usize;
            range[axis] = (min, max);
        }

        let samples_per_axis = 3;
        let total_samples = samples_per_axis * samples_per_axis * samples_per_axis;
        let threshold = dx * 0.8;

        for z in range[2].0..=range[2].1 {
            for y in range[1].0..=range[1].1 {
                for x in range[0].0..=range[0].1 {
                    let node = [x, y, z];
                    let mut inside = 0;
                    for si in 0..samples_per_axis {
                        for sj in 0..samples_per_axis {
                            for sk in 0..samples_per_axis {
                                let sub = [si, sj, sk];
                                let mut p = [0.0f32; 3];
                                for axis in 0..3 {
                                    let global = node[axis] as i64 + block.offset[axis] as i64 - env;
                                    let frac = (sub[axis] as f32 + 0.5) / samples_per_axis as f32;
                                    p[axis] = (global as f32 + frac) * dx;
                                }
                                let point = Point3::new(p[0], p[1], p[2]);
                                if point_triangle_distance(&point, vertices) < threshold {
                                    inside += 1;
                                }
                            }
                        }
                    }
                    if inside > total_samples / 2 {
                        self.map[layout.node_index(x, y, z)] = NodeType::Wall as u32;
                    }
                }
            }
        }
    }
}

impl GeoBlock for StlGeometry {
    fn reset(&mut self, block: &Block, layout: &PhysicalLayout) -> anyhow::Result<()> {
        if block.dim() != 3 {
            return Err(RunnerError::config("STL geometry requires a 3-D lattice").into());
        }
        self.map = base_map(layout, NodeType::Fluid);
        let triangles = std::mem::take(&mut self.triangles);
        for triangle in &triangles {
            self.voxelize_triangle(triangle, block, layout);
        }
        self.triangles = triangles;
        Ok(())
    }

    fn encoded_map(&self) -> &[u32] {
        &self.map
    }
}

fn point_triangle_distance(point: &Point3<f32>, triangle: &[Point3<f32>; 3]) -> f32 {
    let v0 = triangle[1] - triangle[0];
    let v1 = triangle[2] - triangle[0];
    let v2 = point - triangle[0];

    let dot00 = v0.dot(&v0);
    let dot01 = v0.dot(&v1);
    let dot02 = v0.dot(&v2);
    let dot11 = v1.dot(&v1);
    let dot12 = v1.dot(&v2);

    let denom = dot00 * dot11 - dot01 * dot01;
    if denom.abs() > f32::EPSILON {
        let u = (dot11 * dot02 - dot01 * dot12) / denom;
        let v = (dot00 * dot12 - dot01 * dot02) / denom;
        if u >= 0.0 && v >= 0.0 && u + v <= 1.0 {
            let normal = v0.cross(&v1).normalize();
            return v2.dot(&normal).abs();
        }
    }

    // Closest edge otherwise (also covers degenerate triangles).
    let d1 = point_segment_distance(point, &triangle[0], &triangle[1]);
    let d2 = point_segment_distance(point, &triangle[1], &triangle[2]);
    let d3 = point_segment_distance(point, &triangle[2], &triangle[0]);
    d1.min(d2).min(d3)
}

fn point_segment_distance(point: &Point3<f32>, a: &Point3<f32>, b: &Point3<f32>) -> f32 {
    let ab = b - a;
    let ap = point - a;
    let ab_len_sq = ab.dot(&ab);

    if ab_len_sq == 0.0 {
        return ap.magnitude();
    }

    let t = (ap.dot(&ab) / ab_len_sq).clamp(0.0, 1.0);
    let projection = a + ab * t;
    (point - projection).magnitude()
}
