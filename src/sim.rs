use crate::{
    backend::{KernelId, KernelSource},
    kernels::CodegenContext,
    lattice::VelocityGrid,
    runner::RunnerCore,
};

/// Capabilities a physics model provides to the block runner.
///
/// The runner owns the model as `Box<dyn LbSimulation>` and hands it the
/// runner's resources (`RunnerCore`) for allocation and kernel lookup.
pub trait LbSimulation: Send {
    fn name(&self) -> &str;

    /// Velocity grids of the model; one pair of distribution buffers is
    /// allocated per grid.
    fn grids(&self) -> &[VelocityGrid];

    /// Adds model-specific values to the code generation context.
    fn update_context(&self, _ctx: &mut CodegenContext) {}

    /// Kernel code for the context produced by the runner. Must provide the
    /// ghost exchange entry points next to the model's own kernels.
    fn kernel_source(&self, ctx: &CodegenContext) -> anyhow::Result<KernelSource>;

    /// Allocates the macroscopic fields of the model.
    fn init_fields(&mut self, core: &mut RunnerCore) -> anyhow::Result<()>;

    /// Fills fields and distributions before the first step. Device
    /// buffers exist at this point.
    fn initial_conditions(&mut self, core: &mut RunnerCore) -> anyhow::Result<()>;

    /// Bulk step kernels indexed by iteration parity. `full_output` selects
    /// the variant that also updates the macroscopic fields.
    fn get_compute_kernels(&mut self, core: &mut RunnerCore, full_output: bool) -> anyhow::Result<[KernelId; 2]>;

    /// Periodic boundary kernels: X, Y, Z on the primary distributions,
    /// then X, Y, Z on the secondary ones.
    fn get_pbc_kernels(&mut self, core: &mut RunnerCore) -> anyhow::Result<[KernelId; 6]>;
}
