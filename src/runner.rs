//! Per-block simulation driver.
//!
//! A `BlockRunner` owns one block of the lattice: its device buffers, the
//! simulation and geometry collaborators, and one connector per neighbor.
//! `run()` initializes the block and then advances it in lockstep with its
//! neighbors, exchanging one ghost message per neighbor and iteration.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use indicatif::ProgressBar;
use log::{debug, info, warn};

use crate::{
    backend::{Backend, BackendExt, BufferId, KernelId, ModuleId},
    block::Block,
    config::Config,
    connector::{Connector, QuitEvent},
    error::RunnerError,
    field::{FieldId, FieldStore, OutputRegistration, VectorFieldId},
    geometry::{GeoBlock, OpenBox},
    ghost::GhostIndexTables,
    kernels::{CodegenContext, COLLECT_KERNEL, DISTRIBUTE_KERNEL},
    layout::{ceil_div, PhysicalLayout},
    output::{NullWriter, OutputWriter},
    sim::LbSimulation,
    Float,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Created,
    GeometryInit,
    BuffersInit,
    ComputeInit,
    FieldsInit,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// `max_iters` reached.
    Completed { iterations: usize },
    /// The quit event was set.
    Cancelled { iterations: usize },
}

impl RunOutcome {
    pub fn iterations(&self) -> usize {
        match *self {
            RunOutcome::Completed { iterations } | RunOutcome::Cancelled { iterations } => iterations,
        }
    }
}

/// Resources of a runner that simulations may use during initialization.
pub struct RunnerCore {
    block: Block,
    layout: PhysicalLayout,
    backend: Box<dyn Backend>,
    fields: FieldStore,
    module: Option<ModuleId>,
    dists: Vec<[BufferId; 2]>,
    geo_map: Option<BufferId>,
    iteration: usize,
}

impl RunnerCore {
    fn new(block: Block, layout: PhysicalLayout, backend: Box<dyn Backend>) -> Self {
        Self {
            fields: FieldStore::new(layout.clone()),
            block,
            layout,
            backend,
            module: None,
            dists: Vec::new(),
            geo_map: None,
            iteration: 0,
        }
    }

    pub fn block(&self) -> &Block {
        &self.block
    }

    pub fn layout(&self) -> &PhysicalLayout {
        &self.layout
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn backend_mut(&mut self) -> &mut dyn Backend {
        self.backend.as_mut()
    }

    pub fn fields(&self) -> &FieldStore {
        &self.fields
    }

    pub fn fields_mut(&mut self) -> &mut FieldStore {
        &mut self.fields
    }

    pub fn make_scalar_field(&mut self, name: Option<&str>) -> FieldId {
        self.fields.allocate_scalar(name)
    }

    pub fn make_vector_field(&mut self, name: Option<&str>) -> VectorFieldId {
        self.fields.allocate_vector(name)
    }

    /// Device buffer mirroring a scalar field.
    pub fn gpu_field(&self, id: FieldId) -> Result<BufferId> {
        self.fields.device_buffer(id)
    }

    /// Device buffers of a vector field's components.
    pub fn gpu_vector(&self, id: VectorFieldId) -> Result<Vec<BufferId>> {
        self.fields
            .components(id)?
            .iter()
            .map(|c| self.fields.device_buffer(*c))
            .collect()
    }

    /// Distribution buffer of velocity grid `grid`; `which` 0 is the
    /// primary copy, 1 the secondary.
    pub fn gpu_dist(&self, grid: usize, which: usize) -> Result<BufferId> {
        self.dists
            .get(grid)
            .and_then(|pair| pair.get(which))
            .copied()
            .ok_or_else(|| {
                RunnerError::State(format!("no distribution buffer {}/{} on block {}", grid, which, self.block.id)).into()
            })
    }

    pub fn gpu_geo_map(&self) -> Result<BufferId> {
        self.geo_map
            .ok_or_else(|| RunnerError::State("geometry map not on device".into()).into())
    }

    /// Binds `args` to `name` with the standard workgroup shape.
    pub fn get_kernel(&mut self, name: &str, args: &[BufferId]) -> Result<KernelId> {
        let block = self.layout.block3();
        self.get_kernel_with_block(name, args, block)
    }

    pub fn get_kernel_with_block(&mut self, name: &str, args: &[BufferId], block: [u32; 3]) -> Result<KernelId> {
        let module = self
            .module
            .ok_or_else(|| RunnerError::State("kernels not built".into()))?;
        self.backend.get_kernel(module, name, args, block)
    }

    pub fn exec_kernel(&mut self, kernel: KernelId, grid: &[u32]) -> Result<()> {
        self.backend.run_kernel(kernel, grid)
    }

    /// Host to device copy of every mirrored field.
    pub fn upload_fields(&mut self) -> Result<()> {
        self.fields.upload_all(self.backend.as_mut())
    }

    pub fn download_dist(&mut self, grid: usize, which: usize) -> Result<Vec<Float>> {
        let buf = self.gpu_dist(grid, which)?;
        let q = self.backend.buffer_size(buf).unwrap_or(0) / std::mem::size_of::<Float>();
        let mut data = vec![0.0; q];
        self.backend.download(buf, &mut data)?;
        Ok(data)
    }

    fn standard_grid(&self) -> Vec<u32> {
        self.layout.kernel_grid_size.iter().map(|&n| n as u32).collect()
    }
}

struct GhostBuffers {
    send: BufferId,
    recv: BufferId,
}

/// Gather/scatter kernels indexed by iteration parity.
struct ExchangeKernels {
    collect: [KernelId; 2],
    distrib: [KernelId; 2],
    grid: [u32; 1],
}

struct StepKernels {
    full: [KernelId; 2],
    none: [KernelId; 2],
    pbc: [KernelId; 6],
}

pub struct BlockRunner {
    config: Arc<Config>,
    state: RunnerState,
    core: RunnerCore,
    sim: Box<dyn LbSimulation>,
    geometry: Box<dyn GeoBlock>,
    output: Box<dyn OutputWriter>,
    connectors: Vec<Box<dyn Connector>>,
    quit: QuitEvent,
    progress: Option<ProgressBar>,
    tables: GhostIndexTables,
    send_buf: Vec<Float>,
    recv_buf: Vec<Float>,
    vis_map: Vec<u32>,
    ghost_bufs: Option<GhostBuffers>,
    exchange: Option<ExchangeKernels>,
    step_kernels: Option<StepKernels>,
}

impl BlockRunner {
    /// Creates a runner for `block` with an obstacle-free geometry, no
    /// output and no neighbors. Fails if the block cannot be laid out.
    pub fn new(
        config: Arc<Config>,
        block: Block,
        sim: Box<dyn LbSimulation>,
        backend: Box<dyn Backend>,
    ) -> Result<Self> {
        let layout = PhysicalLayout::new(&block.actual_size(), config.runner.block_size)?;
        Ok(Self {
            config,
            state: RunnerState::Created,
            core: RunnerCore::new(block, layout, backend),
            sim,
            geometry: Box::new(OpenBox::new()),
            output: Box::new(NullWriter),
            connectors: Vec::new(),
            quit: QuitEvent::new(),
            progress: None,
            tables: GhostIndexTables::default(),
            send_buf: Vec::new(),
            recv_buf: Vec::new(),
            vis_map: Vec::new(),
            ghost_bufs: None,
            exchange: None,
            step_kernels: None,
        })
    }

    pub fn with_geometry(mut self, geometry: Box<dyn GeoBlock>) -> Self {
        self.geometry = geometry;
        self
    }

    pub fn with_output(mut self, output: Box<dyn OutputWriter>) -> Self {
        self.output = output;
        self
    }

    pub fn with_connectors(mut self, connectors: Vec<Box<dyn Connector>>) -> Self {
        self.connectors = connectors;
        self
    }

    pub fn with_quit_event(mut self, quit: QuitEvent) -> Self {
        self.quit = quit;
        self
    }

    pub fn with_progress(mut self, bar: ProgressBar) -> Self {
        self.progress = Some(bar);
        self
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    pub fn block(&self) -> &Block {
        &self.core.block
    }

    pub fn layout(&self) -> &PhysicalLayout {
        &self.core.layout
    }

    pub fn iteration(&self) -> usize {
        self.core.iteration
    }

    pub fn core(&self) -> &RunnerCore {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut RunnerCore {
        &mut self.core
    }

    pub fn ghost_tables(&self) -> &GhostIndexTables {
        &self.tables
    }

    /// Values visible to kernel code generators.
    pub fn codegen_context(&self) -> CodegenContext {
        let block = &self.core.block;
        let layout = &self.core.layout;
        let domain = &self.config.domain;
        let mut ctx = CodegenContext::new();
        block.update_context(&mut ctx);
        self.geometry.update_context(&mut ctx);
        ctx.extend(self.core.backend.defines());

        ctx.insert("lat_nx", layout.lat_nx());
        ctx.insert("lat_ny", layout.lat_ny());
        ctx.insert("lat_nz", layout.lat_nz());
        ctx.insert("arr_nx", layout.arr_nx());
        ctx.insert("arr_ny", layout.arr_ny());
        ctx.insert("arr_nz", layout.arr_nz());

        let periodicity = [block.periodic_x(), block.periodic_y(), block.periodic_z()];
        ctx.insert("periodic_x", periodicity[0]);
        ctx.insert("periodic_y", periodicity[1]);
        ctx.insert("periodic_z", periodicity[2]);
        ctx.insert("periodicity", periodicity.to_vec());

        let mut bnd_limits = block.actual_size();
        if block.dim() == 2 {
            bnd_limits.push(1);
        }
        ctx.insert("bnd_limits", bnd_limits);
        ctx.insert("dist_size", layout.num_nodes());

        // Node offsets that wrap a global coordinate across each axis,
        // for the lower (-1) and upper (+1) boundary.
        let arr_nx = layout.arr_nx() as i64;
        let arr_ny = layout.arr_ny() as i64;
        let mut pbc_offsets = vec![
            vec![domain.lat_nx as i64, -(domain.lat_nx as i64)],
            vec![domain.lat_ny as i64 * arr_nx, -(domain.lat_ny as i64 * arr_nx)],
        ];
        if let (3, Some(nz)) = (block.dim(), domain.lat_nz) {
            pbc_offsets.push(vec![nz as i64 * arr_ny * arr_nx, -(nz as i64 * arr_ny * arr_nx)]);
        }
        ctx.insert("pbc_offsets", pbc_offsets);

        ctx.insert("distrib_collect_size", self.tables.collect_size());
        ctx.insert("block_size", layout.block_size);
        self.sim.update_context(&mut ctx);
        ctx
    }

    /// Initializes the block and runs it until `max_iters` is reached or
    /// the quit event is set. May be called once.
    pub fn run(&mut self) -> Result<RunOutcome> {
        if self.state != RunnerState::Created {
            return Err(RunnerError::State(format!(
                "block {}: run() called in state {:?}", self.core.block.id, self.state
            ))
            .into());
        }
        let result = self.init().and_then(|_| {
            self.state = RunnerState::Running;
            self.main_loop()
        });
        self.state = RunnerState::Stopped;
        result
    }

    fn init(&mut self) -> Result<()> {
        info!("Initializing block {}.", self.core.block.id);
        self.check_connectors()?;
        self.init_geometry()?;
        self.init_buffers()?;
        self.init_compute()?;

        self.state = RunnerState::FieldsInit;
        debug!("Initializing macroscopic fields.");
        self.sim.init_fields(&mut self.core)?;
        self.geometry.init_fields(&mut self.core.fields)?;
        self.register_outputs();
        self.init_device_data()?;
        debug!("Applying initial conditions.");
        self.sim.initial_conditions(&mut self.core)?;

        self.init_interblock_kernels()?;
        let full = self.sim.get_compute_kernels(&mut self.core, true)?;
        let none = self.sim.get_compute_kernels(&mut self.core, false)?;
        let pbc = self.sim.get_pbc_kernels(&mut self.core)?;
        self.step_kernels = Some(StepKernels { full, none, pbc });

        if self.config.runner.output {
            self.save_output()?;
        }
        Ok(())
    }

    fn check_connectors(&self) -> Result<()> {
        let mut expected = self.core.block.neighbors();
        expected.sort_unstable();
        let mut actual: Vec<_> = self.connectors.iter().map(|c| c.neighbor()).collect();
        actual.sort_unstable();
        if expected != actual {
            return Err(RunnerError::config(format!(
                "block {}: connectors to {:?} do not match neighbors {:?}",
                self.core.block.id, actual, expected
            ))
            .into());
        }
        Ok(())
    }

    fn init_geometry(&mut self) -> Result<()> {
        self.state = RunnerState::GeometryInit;
        debug!("Initializing geometry of block {}.", self.core.block.id);
        self.geometry.reset(&self.core.block, &self.core.layout)?;
        if self.geometry.encoded_map().len() != self.core.layout.num_nodes() {
            return Err(RunnerError::config(format!(
                "geometry map has {} nodes, layout {}",
                self.geometry.encoded_map().len(),
                self.core.layout.num_nodes()
            ))
            .into());
        }
        self.vis_map = self.geometry.visualization_map(&self.core.layout);
        let stats = self.geometry.stats(&self.core.block, &self.core.layout);
        debug!("Block {}: {} fluid, {} wall nodes ({:.1}% fluid)",
               self.core.block.id, stats.fluid, stats.wall, 100.0 * stats.fill_fraction());
        Ok(())
    }

    fn init_buffers(&mut self) -> Result<()> {
        self.state = RunnerState::BuffersInit;
        let grid = self
            .sim
            .grids()
            .first()
            .copied()
            .ok_or_else(|| RunnerError::config(format!("simulation {} defines no grids", self.sim.name())))?;
        self.tables = GhostIndexTables::build(&self.core.block, &self.core.layout, &grid)?;
        self.send_buf = vec![0.0; self.tables.collect_size()];
        self.recv_buf = vec![0.0; self.tables.collect_size()];
        debug!("Block {}: {} ghost values per exchange", self.core.block.id, self.tables.collect_size());
        Ok(())
    }

    fn init_compute(&mut self) -> Result<()> {
        self.state = RunnerState::ComputeInit;
        let ctx = self.codegen_context();
        let source = self.sim.kernel_source(&ctx)?;
        debug!("Building {} kernels for block {} on {}",
               self.sim.name(), self.core.block.id, self.core.backend.name());
        self.core.module = Some(self.core.backend.build(&source)?);
        Ok(())
    }

    fn register_outputs(&mut self) {
        for registration in self.core.fields.take_registrations() {
            match registration {
                OutputRegistration::Scalar(name, id) => self.output.register_scalar(&name, id),
                OutputRegistration::Vector(name, id) => self.output.register_vector(&name, id),
            }
        }
        self.output.register_geometry(&self.vis_map);
    }

    fn init_device_data(&mut self) -> Result<()> {
        let core = &mut self.core;
        core.fields.mirror_all(core.backend.as_mut())?;

        let bytes = self.tables.collect_size() * std::mem::size_of::<Float>();
        let send = core.backend.alloc_buf(bytes, "ghost send")?;
        let recv = core.backend.alloc_buf(bytes, "ghost recv")?;
        self.ghost_bufs = Some(GhostBuffers { send, recv });

        for (g, grid) in self.sim.grids().iter().enumerate() {
            let bytes = core.layout.dist_bytes(grid.q());
            let primary = core.backend.alloc_buf(bytes, &format!("dist{} primary", g))?;
            let secondary = core.backend.alloc_buf(bytes, &format!("dist{} secondary", g))?;
            core.dists.push([primary, secondary]);
        }
        core.geo_map = Some(core.backend.alloc_like(self.geometry.encoded_map(), "geo map")?);
        Ok(())
    }

    fn init_interblock_kernels(&mut self) -> Result<()> {
        let Some(bufs) = &self.ghost_bufs else {
            return Err(RunnerError::State("ghost buffers not allocated".into()).into());
        };
        if self.tables.is_empty() {
            return Ok(());
        }
        let (send, recv) = (bufs.send, bufs.recv);
        let core = &mut self.core;
        let collect_idx = core.backend.alloc_like(&self.tables.collect_idx, "collect idx")?;
        let distrib_idx = core.backend.alloc_like(&self.tables.distrib_idx, "distrib idx")?;
        let primary = core.gpu_dist(0, 0)?;
        let secondary = core.gpu_dist(0, 1)?;

        // Collection follows the bulk step that wrote the other buffer;
        // distribution targets the buffer the next bulk step reads.
        let collect = [
            core.get_kernel(COLLECT_KERNEL, &[collect_idx, secondary, send])?,
            core.get_kernel(COLLECT_KERNEL, &[collect_idx, primary, send])?,
        ];
        let distrib = [
            core.get_kernel(DISTRIBUTE_KERNEL, &[distrib_idx, primary, recv])?,
            core.get_kernel(DISTRIBUTE_KERNEL, &[distrib_idx, secondary, recv])?,
        ];
        let grid = [ceil_div(self.tables.collect_size(), core.layout.block_size) as u32];
        self.exchange = Some(ExchangeKernels { collect, distrib, grid });
        Ok(())
    }

    fn save_output(&mut self) -> Result<()> {
        self.core.fields.flush_to_host(self.core.backend.as_mut())?;
        self.output.save(self.core.iteration, &self.core.fields)
    }

    fn main_loop(&mut self) -> Result<RunOutcome> {
        let max_iters = self.config.runner.max_iters;
        let every = self.config.runner.every.max(1);
        info!("Starting simulation on block {}.", self.core.block.id);
        if max_iters == 0 {
            warn!("Running infinite simulation.");
        }

        loop {
            let output_req = (self.core.iteration + 1) % every == 0;
            self.step(output_req)?;
            self.send_data()?;

            if output_req && self.config.runner.output_required {
                self.save_output()?;
            }
            if let Some(bar) = &self.progress {
                bar.set_position(self.core.iteration as u64);
            }

            if max_iters > 0 && self.core.iteration >= max_iters {
                info!("Simulation completed after {} iterations.", self.core.iteration);
                return Ok(RunOutcome::Completed { iterations: self.core.iteration });
            }
            if self.quit.is_set() || !self.recv_data()? {
                info!("Simulation termination requested.");
                return Ok(RunOutcome::Cancelled { iterations: self.core.iteration });
            }

            if let Some(exchange) = &self.exchange {
                let kernel = exchange.distrib[self.core.iteration & 1];
                self.core.backend.run_kernel(kernel, &exchange.grid)?;
            }
        }
    }

    /// Bulk update, periodic boundaries and ghost collection of one
    /// iteration. Advances the iteration counter.
    fn step(&mut self, output_req: bool) -> Result<()> {
        let start_time = Instant::now();
        let kernels = self
            .step_kernels
            .as_ref()
            .ok_or_else(|| RunnerError::State("compute kernels not initialized".into()))?;
        let parity = self.core.iteration & 1;
        let bulk = if output_req { kernels.full[parity] } else { kernels.none[parity] };
        let pbc = kernels.pbc;

        let core = &mut self.core;
        core.backend.sync()?;
        let grid = core.standard_grid();
        core.backend.run_kernel(bulk, &grid)?;
        core.backend.sync()?;

        // Periodic kernels act on the buffer the bulk step just wrote.
        let base = if parity == 0 { 3 } else { 0 };
        let lat = [core.layout.lat_nx(), core.layout.lat_ny(), core.layout.lat_nz()];
        let bs = core.layout.block_size;
        let periodic = [core.block.periodic_x(), core.block.periodic_y(), core.block.periodic_z()];
        let others = [(1, 2), (0, 2), (0, 1)];
        for axis in 0..3 {
            if !periodic[axis] {
                continue;
            }
            let (a, b) = others[axis];
            let second = if core.block.dim() == 3 { ceil_div(lat[b], bs) } else { 1 };
            let grid = [ceil_div(lat[a], bs) as u32, second as u32];
            core.backend.run_kernel(pbc[base + axis], &grid)?;
        }

        if let Some(exchange) = &self.exchange {
            core.backend.run_kernel(exchange.collect[parity], &exchange.grid)?;
        }
        core.iteration += 1;

        let elapsed = start_time.elapsed();
        if elapsed.as_millis() > 10 {
            debug!("Block {} step took: {:.2}ms", core.block.id, elapsed.as_secs_f64() * 1000.0);
        }
        Ok(())
    }

    fn send_data(&mut self) -> Result<()> {
        if self.connectors.is_empty() {
            return Ok(());
        }
        if let Some(bufs) = &self.ghost_bufs {
            if !self.send_buf.is_empty() {
                self.core.backend.download(bufs.send, &mut self.send_buf)?;
            }
        }
        for connector in &self.connectors {
            let mut message = Vec::with_capacity(self.tables.message_len(connector.neighbor()));
            for segment in self.tables.send_segments(connector.neighbor()) {
                message.extend_from_slice(&self.send_buf[segment.range()]);
            }
            connector.send(&message)?;
        }
        Ok(())
    }

    /// Returns false if cancelled before every neighbor's data arrived.
    fn recv_data(&mut self) -> Result<bool> {
        if self.connectors.is_empty() {
            return Ok(true);
        }
        for connector in &self.connectors {
            let neighbor = connector.neighbor();
            let mut message = vec![0.0; self.tables.message_len(neighbor)];
            if !connector.recv(&mut message, &self.quit)? {
                return Ok(false);
            }
            let mut start = 0;
            for segment in self.tables.recv_segments(neighbor) {
                self.recv_buf[segment.range()].copy_from_slice(&message[start..start + segment.len]);
                start += segment.len;
            }
        }
        if let Some(bufs) = &self.ghost_bufs {
            if !self.recv_buf.is_empty() {
                self.core.backend.upload(bufs.recv, &self.recv_buf)?;
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::{
        block::decompose_x,
        host::HostBackend,
        lattice::{GridModel, VelocityGrid},
        streaming::{FreeStreaming, PERIODIC, PROPAGATE, PROPAGATE_MACRO},
    };

    #[derive(Clone, Default)]
    struct Counts {
        sends: Arc<AtomicUsize>,
        recvs: Arc<AtomicUsize>,
    }

    /// Stand-in neighbor that answers every receive with zeros.
    struct ZeroConnector {
        neighbor: usize,
        counts: Counts,
    }

    impl Connector for ZeroConnector {
        fn neighbor(&self) -> usize {
            self.neighbor
        }

        fn send(&self, _data: &[Float]) -> Result<()> {
            self.counts.sends.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn recv(&self, buf: &mut [Float], _quit: &QuitEvent) -> Result<bool> {
            self.counts.recvs.fetch_add(1, Ordering::SeqCst);
            buf.fill(0.0);
            Ok(true)
        }
    }

    /// Records saved iterations and optionally sets the quit event.
    struct Recorder {
        saves: Arc<Mutex<Vec<usize>>>,
        quit_at: Option<(usize, QuitEvent)>,
    }

    impl OutputWriter for Recorder {
        fn register_scalar(&mut self, _name: &str, _id: FieldId) {}

        fn register_vector(&mut self, _name: &str, _id: VectorFieldId) {}

        fn save(&mut self, iteration: usize, _fields: &FieldStore) -> Result<()> {
            self.saves.lock().unwrap().push(iteration);
            if let Some((at, quit)) = &self.quit_at {
                if *at == iteration {
                    quit.set();
                }
            }
            Ok(())
        }
    }

    fn config(size: &[usize], f: impl FnOnce(&mut Config)) -> Arc<Config> {
        let mut config = Config::for_lattice(size, GridModel::D2Q9);
        config.runner.block_size = 4;
        f(&mut config);
        Arc::new(config)
    }

    fn single_block(config: &Config) -> Block {
        let d = &config.domain;
        decompose_x(&d.global_size(), 1, d.envelope_size, d.periodicity())
            .unwrap()
            .remove(0)
    }

    fn wrapped_density(l: i64) -> crate::streaming::InitialState {
        Arc::new(move |g: [i64; 3]| {
            let (x, y) = (g[0].rem_euclid(l), g[1].rem_euclid(l));
            (1.0 + 0.01 * (x + l * y) as Float, [0.0; 3])
        })
    }

    #[test]
    fn run_is_single_shot() {
        let config = config(&[8, 4], |c| c.runner.max_iters = 1);
        let sim = Box::new(FreeStreaming::new(VelocityGrid::D2Q9, 1.0));
        let mut runner =
            BlockRunner::new(config.clone(), single_block(&config), sim, Box::new(HostBackend::new())).unwrap();
        assert_eq!(runner.state(), RunnerState::Created);
        assert_eq!(runner.run().unwrap(), RunOutcome::Completed { iterations: 1 });
        assert_eq!(runner.state(), RunnerState::Stopped);
        let err = runner.run().unwrap_err();
        assert!(matches!(err.downcast_ref::<RunnerError>(), Some(RunnerError::State(_))));
    }

    #[test]
    fn zero_block_size_fails_at_construction() {
        let config = config(&[8, 4], |c| c.runner.block_size = 0);
        let sim = Box::new(FreeStreaming::new(VelocityGrid::D2Q9, 1.0));
        assert!(BlockRunner::new(config.clone(), single_block(&config), sim, Box::new(HostBackend::new())).is_err());
    }

    #[test]
    fn buffers_alternate_by_parity() {
        let config = config(&[8, 6], |c| {
            c.domain.periodic_x = true;
            c.runner.max_iters = 4;
            c.runner.every = 2;
        });
        let backend = HostBackend::new();
        let trace = backend.trace();
        let sim = Box::new(FreeStreaming::new(VelocityGrid::D2Q9, 1.0));
        let mut runner = BlockRunner::new(config.clone(), single_block(&config), sim, Box::new(backend)).unwrap();
        assert_eq!(runner.run().unwrap(), RunOutcome::Completed { iterations: 4 });

        let primary = runner.core().gpu_dist(0, 0).unwrap();
        let secondary = runner.core().gpu_dist(0, 1).unwrap();
        let launches = trace.launches();

        let bulk: Vec<_> = launches
            .iter()
            .filter(|(name, _)| name == PROPAGATE || name == PROPAGATE_MACRO)
            .collect();
        let names: Vec<&str> = bulk.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec![PROPAGATE, PROPAGATE_MACRO, PROPAGATE, PROPAGATE_MACRO]);
        let sources: Vec<BufferId> = bulk.iter().map(|(_, args)| args[0]).collect();
        assert_eq!(sources, vec![primary, secondary, primary, secondary]);

        let periodic: Vec<BufferId> = launches
            .iter()
            .filter(|(name, _)| name == PERIODIC[0])
            .map(|(_, args)| args[0])
            .collect();
        assert_eq!(periodic, vec![secondary, primary, secondary, primary]);
        assert!(launches.iter().all(|(name, _)| name != PERIODIC[1] && name != COLLECT_KERNEL));
    }

    #[test]
    fn stops_at_max_iters_before_receiving() {
        let config = config(&[16, 4], |c| c.runner.max_iters = 5);
        let mut blocks = decompose_x(&[16, 4], 2, 1, [false; 3]).unwrap();
        let block = blocks.remove(0);
        let counts = Counts::default();
        let connector = ZeroConnector { neighbor: 1, counts: counts.clone() };
        let backend = HostBackend::new();
        let trace = backend.trace();
        let sim = Box::new(FreeStreaming::new(VelocityGrid::D2Q9, 1.0));

        let mut runner = BlockRunner::new(config, block, sim, Box::new(backend))
            .unwrap()
            .with_connectors(vec![Box::new(connector)]);
        assert_eq!(runner.run().unwrap(), RunOutcome::Completed { iterations: 5 });
        assert_eq!(counts.sends.load(Ordering::SeqCst), 5);
        assert_eq!(counts.recvs.load(Ordering::SeqCst), 4);
        assert_eq!(runner.ghost_tables().collect_size(), 4 * 3);

        let launches = trace.launches();
        let count = |name: &str| launches.iter().filter(|(n, _)| n == name).count();
        assert_eq!(count(PROPAGATE), 5);
        assert_eq!(count(COLLECT_KERNEL), 5);
        assert_eq!(count(DISTRIBUTE_KERNEL), 4);
    }

    #[test]
    fn quit_during_output_skips_receive() {
        let quit = QuitEvent::new();
        let saves = Arc::new(Mutex::new(Vec::new()));
        let config = config(&[16, 4], |c| {
            c.runner.every = 1;
            c.runner.output_required = true;
        });
        let mut blocks = decompose_x(&[16, 4], 2, 1, [false; 3]).unwrap();
        let counts = Counts::default();
        let sim = Box::new(FreeStreaming::new(VelocityGrid::D2Q9, 1.0));

        let mut runner = BlockRunner::new(config, blocks.remove(0), sim, Box::new(HostBackend::new()))
            .unwrap()
            .with_connectors(vec![Box::new(ZeroConnector { neighbor: 1, counts: counts.clone() })])
            .with_output(Box::new(Recorder { saves: saves.clone(), quit_at: Some((3, quit.clone())) }))
            .with_quit_event(quit);
        assert_eq!(runner.run().unwrap(), RunOutcome::Cancelled { iterations: 3 });
        assert_eq!(*saves.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(counts.sends.load(Ordering::SeqCst), 3);
        assert_eq!(counts.recvs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn initial_state_is_saved_when_output_enabled() {
        let saves = Arc::new(Mutex::new(Vec::new()));
        let config = config(&[8, 4], |c| {
            c.runner.output = true;
            c.runner.max_iters = 2;
        });
        let sim = Box::new(FreeStreaming::new(VelocityGrid::D2Q9, 1.0));
        let mut runner = BlockRunner::new(config.clone(), single_block(&config), sim, Box::new(HostBackend::new()))
            .unwrap()
            .with_output(Box::new(Recorder { saves: saves.clone(), quit_at: None }));
        runner.run().unwrap();
        assert_eq!(*saves.lock().unwrap(), vec![0]);
    }

    #[test]
    fn missing_connector_is_rejected() {
        let config = config(&[16, 4], |c| c.runner.max_iters = 1);
        let mut blocks = decompose_x(&[16, 4], 2, 1, [false; 3]).unwrap();
        let sim = Box::new(FreeStreaming::new(VelocityGrid::D2Q9, 1.0));
        let mut runner = BlockRunner::new(config, blocks.remove(1), sim, Box::new(HostBackend::new())).unwrap();
        let err = runner.run().unwrap_err();
        assert!(matches!(err.downcast_ref::<RunnerError>(), Some(RunnerError::Config(_))));
    }

    #[test]
    fn context_describes_block() {
        let config = config(&[10, 6], |c| c.domain.periodic_y = true);
        let sim = Box::new(FreeStreaming::new(VelocityGrid::D2Q9, 1.0));
        let runner = BlockRunner::new(config.clone(), single_block(&config), sim, Box::new(HostBackend::new())).unwrap();
        let ctx = runner.codegen_context();
        assert_eq!(ctx.get_usize("lat_nx").unwrap(), 12);
        assert_eq!(ctx.get_usize("arr_nx").unwrap(), 12);
        assert_eq!(ctx.get_usize("lat_ny").unwrap(), 8);
        assert_eq!(ctx.get_usize("lat_nz").unwrap(), 1);
        assert_eq!(ctx.get_usize("dist_size").unwrap(), 96);
        assert_eq!(ctx.get_usize("q").unwrap(), 9);
        assert!(ctx.get_bool("periodic_y"));
        assert!(!ctx.get_bool("periodic_x"));
        assert_eq!(ctx.get("bnd_limits"), Some(&serde_json::json!([12, 8, 1])));
        assert_eq!(ctx.get("pbc_offsets"), Some(&serde_json::json!([[10, -10], [72, -72]])));
    }

    #[test]
    fn periodic_block_streams_with_wraparound() {
        let l = 6usize;
        let grid = VelocityGrid::D2Q9;
        let config = config(&[l, l], |c| {
            c.domain.periodic_x = true;
            c.domain.periodic_y = true;
            c.runner.max_iters = 1;
        });
        let density = wrapped_density(l as i64);
        let sim = Box::new(FreeStreaming::with_initial_state(grid, density.clone()));
        let mut runner = BlockRunner::new(config.clone(), single_block(&config), sim, Box::new(HostBackend::new())).unwrap();
        runner.run().unwrap();

        let layout = runner.layout().clone();
        let n = layout.num_nodes();
        let dist = runner.core_mut().download_dist(0, 1).unwrap();
        for y in 1..=l {
            for x in 1..=l {
                for d in 0..grid.q() {
                    let c = grid.basis[d];
                    let src = [x as i64 - 1 - c[0] as i64, y as i64 - 1 - c[1] as i64, 0];
                    let expected = grid.equilibrium(d, density(src).0, [0.0; 3]);
                    assert_eq!(dist[layout.node_index(x, y, 0) + n * d], expected, "x={} y={} d={}", x, y, d);
                }
            }
        }
    }

    #[test]
    fn periodic_block_returns_after_full_revolution() {
        let l = 6usize;
        let grid = VelocityGrid::D2Q9;
        let config = config(&[l, l], |c| {
            c.domain.periodic_x = true;
            c.domain.periodic_y = true;
            c.runner.max_iters = l;
        });
        let density = wrapped_density(l as i64);
        let sim = Box::new(FreeStreaming::with_initial_state(grid, density.clone()));
        let mut runner = BlockRunner::new(config.clone(), single_block(&config), sim, Box::new(HostBackend::new())).unwrap();
        assert_eq!(runner.run().unwrap(), RunOutcome::Completed { iterations: l });

        // Six steps end on the primary buffer.
        let layout = runner.layout().clone();
        let n = layout.num_nodes();
        let dist = runner.core_mut().download_dist(0, 0).unwrap();
        for y in 1..=l {
            for x in 1..=l {
                let rho = density([x as i64 - 1, y as i64 - 1, 0]).0;
                for d in 0..grid.q() {
                    assert_eq!(dist[layout.node_index(x, y, 0) + n * d], grid.equilibrium(d, rho, [0.0; 3]));
                }
            }
        }
    }
}
