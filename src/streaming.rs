//! Free-streaming reference model.
//!
//! Distributions propagate along their lattice velocity without collision.
//! Sources outside the lattice leave the value in place and wall sources
//! reflect it (full-way bounce-back). The model exists to drive the block
//! runner's pipeline end to end on any backend.

use std::sync::Arc;

use log::debug;

use crate::{
    backend::{BackendExt, BufferId, KernelEntry, KernelId, KernelSource, KernelUnit},
    error::RunnerError,
    field::{FieldId, VectorFieldId},
    geometry::NodeType,
    host::{HostKernel, HostMemory, Launch},
    kernels::{ghost_exchange_source, CodegenContext},
    lattice::VelocityGrid,
    runner::RunnerCore,
    sim::LbSimulation,
    Float,
};

pub const PROPAGATE: &str = "Propagate";
pub const PROPAGATE_MACRO: &str = "PropagateWithMacro";
pub const PERIODIC: [&str; 3] = ["ApplyPeriodicX", "ApplyPeriodicY", "ApplyPeriodicZ"];

/// Density and velocity at a global node position. Ghost nodes may have
/// negative coordinates; callers with periodic axes wrap them.
pub type InitialState = Arc<dyn Fn([i64; 3]) -> (Float, [Float; 3]) + Send + Sync>;

pub struct FreeStreaming {
    grids: Vec<VelocityGrid>,
    initial: InitialState,
    rho: Option<FieldId>,
    v: Option<VectorFieldId>,
}

impl FreeStreaming {
    pub fn new(grid: VelocityGrid, density: Float) -> Self {
        Self::with_initial_state(grid, Arc::new(move |_| (density, [0.0; 3])))
    }

    pub fn with_initial_state(grid: VelocityGrid, initial: InitialState) -> Self {
        Self {
            grids: vec![grid],
            initial,
            rho: None,
            v: None,
        }
    }

    pub fn rho(&self) -> Option<FieldId> {
        self.rho
    }

    pub fn velocity(&self) -> Option<VectorFieldId> {
        self.v
    }
}

/// Lattice constants shared by the WGSL generator and the host kernels.
#[derive(Debug, Clone)]
struct Params {
    lat: [usize; 3],
    arr_nx: usize,
    arr_ny: usize,
    dist_size: usize,
    envelope: usize,
    block_size: usize,
    dim: usize,
    basis: Vec<[i32; 3]>,
    opposite: Vec<usize>,
}

impl Params {
    fn from_context(ctx: &CodegenContext, grid: &VelocityGrid) -> anyhow::Result<Self> {
        Ok(Self {
            lat: [ctx.get_usize("lat_nx")?, ctx.get_usize("lat_ny")?, ctx.get_usize("lat_nz")?],
            arr_nx: ctx.get_usize("arr_nx")?,
            arr_ny: ctx.get_usize("arr_ny")?,
            dist_size: ctx.get_usize("dist_size")?,
            envelope: ctx.get_usize("envelope_size")?,
            block_size: ctx.get_usize("block_size")?,
            dim: ctx.get_usize("dim")?,
            basis: grid.basis.to_vec(),
            opposite: (0..grid.q()).map(|i| grid.opposite(i)).collect(),
        })
    }

    fn q(&self) -> usize {
        self.basis.len()
    }

    fn node(&self, x: usize, y: usize, z: usize) -> usize {
        x + self.arr_nx * (y + self.arr_ny * z)
    }

    fn wgsl_header(&self) -> String {
        let list = |f: &dyn Fn(usize) -> String| (0..self.q()).map(f).collect::<Vec<_>>().join(", ");
        let q = self.q();
        format!(
            r#"const LAT_NX: u32 = {}u;
const LAT_NY: u32 = {}u;
const LAT_NZ: u32 = {}u;
const ARR_NX: u32 = {}u;
const ARR_NY: u32 = {}u;
const DIST_SIZE: u32 = {}u;
const ENVELOPE: u32 = {}u;
const BLOCK_SIZE: u32 = {}u;
const Q: u32 = {q}u;
const NODE_WALL: u32 = {}u;

var<private> CX: array<i32, {q}> = array<i32, {q}>({});
var<private> CY: array<i32, {q}> = array<i32, {q}>({});
var<private> CZ: array<i32, {q}> = array<i32, {q}>({});
var<private> OPP: array<u32, {q}> = array<u32, {q}>({});

fn node(x: u32, y: u32, z: u32) -> u32 {{
    return x + ARR_NX * (y + ARR_NY * z);
}}
"#,
            self.lat[0],
            self.lat[1],
            self.lat[2],
            self.arr_nx,
            self.arr_ny,
            self.dist_size,
            self.envelope,
            self.block_size,
            NodeType::Wall as u32,
            list(&|i| self.basis[i][0].to_string()),
            list(&|i| self.basis[i][1].to_string()),
            list(&|i| self.basis[i][2].to_string()),
            list(&|i| format!("{}u", self.opposite[i])),
        )
    }

    fn wgsl_propagate(&self, with_macro: bool) -> String {
        let mut bindings = String::from(
            "@group(0) @binding(0) var<storage, read> dist_in: array<f32>;\n\
             @group(0) @binding(1) var<storage, read_write> dist_out: array<f32>;\n\
             @group(0) @binding(2) var<storage, read> geo_map: array<u32>;\n",
        );
        let mut store = String::new();
        if with_macro {
            bindings.push_str("@group(0) @binding(3) var<storage, read_write> rho: array<f32>;\n");
            let axes = ["x", "y", "z"];
            let basis = ["CX", "CY", "CZ"];
            let mut sums = String::new();
            let mut writes = String::new();
            for (i, axis) in axes.iter().enumerate().take(self.dim) {
                bindings.push_str(&format!(
                    "@group(0) @binding({}) var<storage, read_write> v{}: array<f32>;\n",
                    4 + i,
                    axis
                ));
                sums.push_str(&format!("        m{axis} = m{axis} + f32({}[d]) * f;\n", basis[i]));
                writes.push_str(&format!("        v{axis}[n] = m{axis} / r;\n"));
            }
            store = format!(
                r#"    var r = 0.0;
    var mx = 0.0;
    var my = 0.0;
    var mz = 0.0;
    for (var d = 0u; d < Q; d = d + 1u) {{
        let f = dist_out[n + DIST_SIZE * d];
        r = r + f;
{sums}    }}
    rho[n] = r;
    if (r > 0.0) {{
{writes}    }}
"#
            );
        }

        let name = if with_macro { PROPAGATE_MACRO } else { PROPAGATE };
        format!(
            r#"{header}
{bindings}
@compute @workgroup_size({bs})
fn {name}(@builtin(global_invocation_id) gid: vec3<u32>) {{
    let x = gid.x;
    let y = gid.y;
    let z = gid.z;
    if (x >= LAT_NX || y >= LAT_NY || z >= LAT_NZ) {{
        return;
    }}
    let n = node(x, y, z);
    let own = geo_map[n];
    for (var d = 0u; d < Q; d = d + 1u) {{
        var value = dist_in[n + DIST_SIZE * d];
        if (own != NODE_WALL) {{
            let sx = i32(x) - CX[d];
            let sy = i32(y) - CY[d];
            let sz = i32(z) - CZ[d];
            if (sx >= 0 && sy >= 0 && sz >= 0 && sx < i32(LAT_NX) && sy < i32(LAT_NY) && sz < i32(LAT_NZ)) {{
                let s = node(u32(sx), u32(sy), u32(sz));
                if (geo_map[s] == NODE_WALL) {{
                    value = dist_in[n + DIST_SIZE * OPP[d]];
                }} else {{
                    value = dist_in[s + DIST_SIZE * d];
                }}
            }}
        }}
        dist_out[n + DIST_SIZE * d] = value;
    }}
{store}}}
"#,
            header = self.wgsl_header(),
            bs = self.block_size,
        )
    }

    fn wgsl_periodic(&self) -> String {
        // (axis extent, first other axis, second other axis) per kernel
        let kernels = [
            (PERIODIC[0], "LAT_NX", "LAT_NY", "LAT_NZ", "node(l, a, b)", "node(LAT_NX - 2u * ENVELOPE + l, a, b)",
             "node(LAT_NX - ENVELOPE + l, a, b)", "node(ENVELOPE + l, a, b)"),
            (PERIODIC[1], "LAT_NY", "LAT_NX", "LAT_NZ", "node(a, l, b)", "node(a, LAT_NY - 2u * ENVELOPE + l, b)",
             "node(a, LAT_NY - ENVELOPE + l, b)", "node(a, ENVELOPE + l, b)"),
            (PERIODIC[2], "LAT_NZ", "LAT_NX", "LAT_NY", "node(a, b, l)", "node(a, b, LAT_NZ - 2u * ENVELOPE + l)",
             "node(a, b, LAT_NZ - ENVELOPE + l)", "node(a, b, ENVELOPE + l)"),
        ];
        let mut code = format!(
            "{}\n@group(0) @binding(0) var<storage, read_write> dist: array<f32>;\n",
            self.wgsl_header()
        );
        for (name, _extent, ext_a, ext_b, ghost_lo, src_lo, ghost_hi, src_hi) in kernels {
            code.push_str(&format!(
                r#"
@compute @workgroup_size({bs})
fn {name}(@builtin(global_invocation_id) gid: vec3<u32>) {{
    let a = gid.x;
    if (a >= {ext_a}) {{
        return;
    }}
    for (var s = 0u; s < BLOCK_SIZE; s = s + 1u) {{
        let b = gid.y * BLOCK_SIZE + s;
        if (b >= {ext_b}) {{
            break;
        }}
        for (var l = 0u; l < ENVELOPE; l = l + 1u) {{
            for (var d = 0u; d < Q; d = d + 1u) {{
                dist[{ghost_lo} + DIST_SIZE * d] = dist[{src_lo} + DIST_SIZE * d];
                dist[{ghost_hi} + DIST_SIZE * d] = dist[{src_hi} + DIST_SIZE * d];
            }}
        }}
    }}
}}
"#,
                bs = self.block_size,
            ));
        }
        code
    }
}

fn inside(p: &Params, c: [i64; 3]) -> bool {
    (0..3).all(|a| c[a] >= 0 && (c[a] as usize) < p.lat[a])
}

// args: [dist_in, dist_out, geo_map, (rho, v_x, v_y, v_z)]
fn host_propagate(p: Params, with_macro: bool) -> HostKernel {
    Arc::new(move |mem: &mut HostMemory, args: &[BufferId], launch: &Launch| {
        let wall = NodeType::Wall as u32;
        let geo = mem.words(args[2])?.to_vec();
        let mut out = mem.take(args[1])?;
        {
            let input = mem.floats(args[0])?;
            for [x, y, z] in launch.threads() {
                if x >= p.lat[0] || y >= p.lat[1] || z >= p.lat[2] {
                    continue;
                }
                let n = p.node(x, y, z);
                for d in 0..p.q() {
                    let mut value = input[n + p.dist_size * d];
                    if geo[n] != wall {
                        let c = p.basis[d];
                        let src = [x as i64 - c[0] as i64, y as i64 - c[1] as i64, z as i64 - c[2] as i64];
                        if inside(&p, src) {
                            let s = p.node(src[0] as usize, src[1] as usize, src[2] as usize);
                            value = if geo[s] == wall {
                                input[n + p.dist_size * p.opposite[d]]
                            } else {
                                input[s + p.dist_size * d]
                            };
                        }
                    }
                    out[n + p.dist_size * d] = value;
                }
            }
        }

        if with_macro {
            let mut rho = mem.take(args[3])?;
            let mut v: Vec<Vec<Float>> = (0..p.dim).map(|i| mem.take(args[4 + i])).collect::<anyhow::Result<_>>()?;
            for [x, y, z] in launch.threads() {
                if x >= p.lat[0] || y >= p.lat[1] || z >= p.lat[2] {
                    continue;
                }
                let n = p.node(x, y, z);
                let mut r = 0.0;
                let mut m = [0.0 as Float; 3];
                for d in 0..p.q() {
                    let f = out[n + p.dist_size * d];
                    r += f;
                    for (a, ma) in m.iter_mut().enumerate() {
                        *ma += p.basis[d][a] as Float * f;
                    }
                }
                rho[n] = r;
                if r > 0.0 {
                    for (a, va) in v.iter_mut().enumerate() {
                        va[n] = m[a] / r;
                    }
                }
            }
            mem.restore(args[3], rho)?;
            for (i, va) in v.into_iter().enumerate() {
                mem.restore(args[4 + i], va)?;
            }
        }
        mem.restore(args[1], out)
    })
}

// args: [dist]
fn host_periodic(p: Params, axis: usize) -> HostKernel {
    Arc::new(move |mem: &mut HostMemory, args: &[BufferId], launch: &Launch| {
        let (a_axis, b_axis) = match axis {
            0 => (1, 2),
            1 => (0, 2),
            _ => (0, 1),
        };
        let n = p.lat[axis];
        let env = p.envelope;
        let bs = p.block_size;
        let dist = mem.floats_mut(args[0])?;
        for [a, gy, _] in launch.threads() {
            if a >= p.lat[a_axis] {
                continue;
            }
            for s in 0..bs {
                let b = gy * bs + s;
                if b >= p.lat[b_axis] {
                    break;
                }
                for l in 0..env {
                    let at = |k: usize| {
                        let mut c = [0usize; 3];
                        c[axis] = k;
                        c[a_axis] = a;
                        c[b_axis] = b;
                        p.node(c[0], c[1], c[2])
                    };
                    let (ghost_lo, src_lo) = (at(l), at(n - 2 * env + l));
                    let (ghost_hi, src_hi) = (at(n - env + l), at(env + l));
                    for d in 0..p.q() {
                        let off = p.dist_size * d;
                        dist[ghost_lo + off] = dist[src_lo + off];
                        dist[ghost_hi + off] = dist[src_hi + off];
                    }
                }
            }
        }
        Ok(())
    })
}

impl LbSimulation for FreeStreaming {
    fn name(&self) -> &str {
        "free-streaming"
    }

    fn grids(&self) -> &[VelocityGrid] {
        &self.grids
    }

    fn update_context(&self, ctx: &mut CodegenContext) {
        ctx.insert("sim", self.name());
        ctx.insert("q", self.grids[0].q());
    }

    fn kernel_source(&self, ctx: &CodegenContext) -> anyhow::Result<KernelSource> {
        let p = Params::from_context(ctx, &self.grids[0])?;
        let entry = |name: &str, host: HostKernel| KernelEntry { name: name.to_string(), host };

        let source = KernelSource::new()
            .with_unit(KernelUnit {
                label: "propagate".to_string(),
                wgsl: p.wgsl_propagate(false),
                entries: vec![entry(PROPAGATE, host_propagate(p.clone(), false))],
            })
            .with_unit(KernelUnit {
                label: "propagate_macro".to_string(),
                wgsl: p.wgsl_propagate(true),
                entries: vec![entry(PROPAGATE_MACRO, host_propagate(p.clone(), true))],
            })
            .with_unit(KernelUnit {
                label: "periodic".to_string(),
                wgsl: p.wgsl_periodic(),
                entries: (0..3).map(|axis| entry(PERIODIC[axis], host_periodic(p.clone(), axis))).collect(),
            });
        Ok(source.merge(ghost_exchange_source(ctx)?))
    }

    fn init_fields(&mut self, core: &mut RunnerCore) -> anyhow::Result<()> {
        self.rho = Some(core.make_scalar_field(Some("rho")));
        self.v = Some(core.make_vector_field(Some("v")));
        Ok(())
    }

    fn initial_conditions(&mut self, core: &mut RunnerCore) -> anyhow::Result<()> {
        let (Some(rho_id), Some(v_id)) = (self.rho, self.v) else {
            return Err(RunnerError::State("fields not initialized".into()).into());
        };
        let grid = self.grids[0];
        let layout = core.layout().clone();
        let block = core.block().clone();
        let env = block.envelope_size as i64;
        let num_nodes = layout.num_nodes();
        let components = core.fields().components(v_id)?.to_vec();

        let mut dist = vec![0.0 as Float; num_nodes * grid.q()];
        let mut rho = vec![0.0 as Float; num_nodes];
        let mut vel = vec![vec![0.0 as Float; num_nodes]; components.len()];

        for z in 0..layout.lat_nz() {
            for y in 0..layout.lat_ny() {
                for x in 0..layout.lat_nx() {
                    let local = [x, y, z];
                    let mut global = [0i64; 3];
                    for a in 0..block.dim() {
                        global[a] = block.offset[a] as i64 + local[a] as i64 - env;
                    }
                    let (r, u) = (self.initial)(global);
                    let n = layout.node_index(x, y, z);
                    rho[n] = r;
                    for (a, va) in vel.iter_mut().enumerate() {
                        va[n] = u[a];
                    }
                    for d in 0..grid.q() {
                        dist[n + num_nodes * d] = grid.equilibrium(d, r, u);
                    }
                }
            }
        }

        core.fields_mut().field_mut(rho_id)?.data = rho;
        for (id, data) in components.iter().zip(vel) {
            core.fields_mut().field_mut(*id)?.data = data;
        }
        core.upload_fields()?;
        for which in 0..2 {
            let buf = core.gpu_dist(0, which)?;
            core.backend_mut().upload(buf, &dist)?;
        }
        debug!("Initialized {} distributions on block {}", dist.len(), block.id);
        Ok(())
    }

    fn get_compute_kernels(&mut self, core: &mut RunnerCore, full_output: bool) -> anyhow::Result<[KernelId; 2]> {
        let geo = core.gpu_geo_map()?;
        let mut macro_args = Vec::new();
        let name = if full_output {
            let (Some(rho), Some(v)) = (self.rho, self.v) else {
                return Err(RunnerError::State("fields not initialized".into()).into());
            };
            macro_args.push(core.gpu_field(rho)?);
            macro_args.extend(core.gpu_vector(v)?);
            PROPAGATE_MACRO
        } else {
            PROPAGATE
        };

        // Even iterations read the primary distributions.
        let mut kernels = [KernelId(0); 2];
        for (parity, kernel) in kernels.iter_mut().enumerate() {
            let src = core.gpu_dist(0, parity)?;
            let dst = core.gpu_dist(0, 1 - parity)?;
            let mut args = vec![src, dst, geo];
            args.extend(&macro_args);
            *kernel = core.get_kernel(name, &args)?;
        }
        Ok(kernels)
    }

    fn get_pbc_kernels(&mut self, core: &mut RunnerCore) -> anyhow::Result<[KernelId; 6]> {
        let mut kernels = [KernelId(0); 6];
        for which in 0..2 {
            let dist = core.gpu_dist(0, which)?;
            for axis in 0..3 {
                kernels[3 * which + axis] = core.get_kernel(PERIODIC[axis], &[dist])?;
            }
        }
        Ok(kernels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::host::HostBackend;
    use crate::kernels::COLLECT_KERNEL;

    // 4 x 3 lattice, one envelope layer, no padding.
    fn context() -> CodegenContext {
        let mut ctx = CodegenContext::new();
        for (key, value) in [
            ("lat_nx", 4usize), ("lat_ny", 3), ("lat_nz", 1), ("arr_nx", 4), ("arr_ny", 3),
            ("dist_size", 12), ("envelope_size", 1), ("block_size", 4), ("dim", 2),
            ("distrib_collect_size", 0),
        ] {
            ctx.insert(key, value);
        }
        ctx
    }

    fn setup(geo: &[u32]) -> (HostBackend, crate::backend::ModuleId, BufferId, BufferId, BufferId) {
        let sim = FreeStreaming::new(VelocityGrid::D2Q9, 1.0);
        let mut backend = HostBackend::new();
        let module = backend.build(&sim.kernel_source(&context()).unwrap()).unwrap();
        let dist: Vec<Float> = (0..9 * 12).map(|i| (100 * (i / 12) + i % 12) as Float).collect();
        let src = backend.alloc_like(&dist, "src").unwrap();
        let dst = backend.alloc_like(&vec![0.0 as Float; 9 * 12], "dst").unwrap();
        let geo = backend.alloc_like(geo, "geo").unwrap();
        (backend, module, src, dst, geo)
    }

    #[test]
    fn sources_cover_all_entry_points() {
        let sim = FreeStreaming::new(VelocityGrid::D2Q9, 1.0);
        let source = sim.kernel_source(&context()).unwrap();
        let entries = source.entry_points();
        for name in [PROPAGATE, PROPAGATE_MACRO, PERIODIC[0], PERIODIC[1], PERIODIC[2], COLLECT_KERNEL] {
            assert!(entries.contains(&name), "{}", name);
        }
        let (unit, _) = source.find(PROPAGATE_MACRO).unwrap();
        let wgsl = &source.units[unit].wgsl;
        assert!(wgsl.contains("var<storage, read_write> vy"));
        assert!(!wgsl.contains("var<storage, read_write> vz"));
        assert!(wgsl.contains("array<i32, 9>(0, 1, 0, -1, 0, 1, -1, -1, 1)"));
    }

    #[test]
    fn host_propagation_pulls_and_bounces_back() {
        let mut geo = vec![NodeType::Fluid as u32; 12];
        geo[6] = NodeType::Wall as u32;
        let (mut backend, module, src, dst, geo) = setup(&geo);
        let kernel = backend.get_kernel(module, PROPAGATE, &[src, dst, geo], [4, 1, 1]).unwrap();
        backend.run_kernel(kernel, &[1, 3]).unwrap();

        let mut out = vec![0.0 as Float; 9 * 12];
        backend.download(dst, &mut out).unwrap();
        // Node (1, 1) is index 5; its east neighbor (2, 1) is a wall.
        assert_eq!(out[12 + 5], 104.0);
        assert_eq!(out[3 * 12 + 5], 105.0);
        assert_eq!(out[3 * 12 + 6], 306.0);
        assert_eq!(out[12], 100.0);
    }

    #[test]
    fn host_periodic_copies_envelope_columns() {
        let (mut backend, module, src, _, _) = setup(&[0; 12]);
        let kernel = backend.get_kernel(module, PERIODIC[0], &[src], [4, 1, 1]).unwrap();
        backend.run_kernel(kernel, &[1, 1]).unwrap();

        let mut out = vec![0.0 as Float; 9 * 12];
        backend.download(src, &mut out).unwrap();
        for y in 0..3 {
            for d in [0, 1, 5] {
                let row = 12 * d + 4 * y;
                assert_eq!(out[row], (100 * d + 4 * y + 2) as Float);
                assert_eq!(out[row + 3], (100 * d + 4 * y + 1) as Float);
            }
        }
    }
}
