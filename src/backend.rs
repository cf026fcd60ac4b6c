//! Compute device contract used by the block runner.
//!
//! Devices hand out opaque handles for buffers, modules and kernels; the
//! runner never holds device objects directly. Launches are asynchronous
//! with respect to the host until `sync()` is called; transfers are blocking
//! and ordered after every launch submitted before them.

use bytemuck::Pod;

use crate::{host::HostKernel, kernels::CodegenContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelId(pub usize);

/// One named kernel entry point. `host` is the reference implementation run
/// by the host backend; device backends compile the unit's WGSL instead.
#[derive(Clone)]
pub struct KernelEntry {
    pub name: String,
    pub host: HostKernel,
}

/// A self-contained piece of kernel code, compiled as one shader module.
#[derive(Clone)]
pub struct KernelUnit {
    pub label: String,
    pub wgsl: String,
    pub entries: Vec<KernelEntry>,
}

/// Kernel code handed to `Backend::build`.
#[derive(Clone, Default)]
pub struct KernelSource {
    pub units: Vec<KernelUnit>,
}

impl KernelSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_unit(mut self, unit: KernelUnit) -> Self {
        self.units.push(unit);
        self
    }

    pub fn merge(mut self, other: KernelSource) -> Self {
        self.units.extend(other.units);
        self
    }

    /// Unit index and entry for a kernel name.
    pub fn find(&self, name: &str) -> Option<(usize, &KernelEntry)> {
        self.units.iter().enumerate().find_map(|(i, unit)| {
            unit.entries.iter().find(|e| e.name == name).map(|e| (i, e))
        })
    }

    pub fn entry_points(&self) -> Vec<&str> {
        self.units
            .iter()
            .flat_map(|u| u.entries.iter().map(|e| e.name.as_str()))
            .collect()
    }
}

pub trait Backend: Send {
    fn name(&self) -> &str;

    /// Values merged into the code generation context.
    fn defines(&self) -> CodegenContext;

    fn build(&mut self, source: &KernelSource) -> anyhow::Result<ModuleId>;

    /// Binds `args` (in binding order) to the entry point `name` of `module`.
    fn get_kernel(
        &mut self,
        module: ModuleId,
        name: &str,
        args: &[BufferId],
        block: [u32; 3],
    ) -> anyhow::Result<KernelId>;

    /// Queues a launch of `grid` workgroups (1 to 3 axes, X first).
    fn run_kernel(&mut self, kernel: KernelId, grid: &[u32]) -> anyhow::Result<()>;

    /// Blocks until every queued launch has completed.
    fn sync(&mut self) -> anyhow::Result<()>;

    fn alloc_buf(&mut self, size: usize, label: &str) -> anyhow::Result<BufferId>;

    fn buffer_size(&self, buf: BufferId) -> Option<usize>;

    /// Host to device copy of `data` into the start of `buf`.
    fn to_buf(&mut self, buf: BufferId, data: &[u8]) -> anyhow::Result<()>;

    /// Device to host copy of the first `data.len()` bytes of `buf`.
    fn from_buf(&mut self, buf: BufferId, data: &mut [u8]) -> anyhow::Result<()>;
}

/// Typed transfers on top of the byte-level `Backend` calls.
pub trait BackendExt {
    fn alloc_like<T: Pod>(&mut self, data: &[T], label: &str) -> anyhow::Result<BufferId>;
    fn upload<T: Pod>(&mut self, buf: BufferId, data: &[T]) -> anyhow::Result<()>;
    fn download<T: Pod>(&mut self, buf: BufferId, data: &mut [T]) -> anyhow::Result<()>;
}

impl<B: Backend + ?Sized> BackendExt for B {
    fn alloc_like<T: Pod>(&mut self, data: &[T], label: &str) -> anyhow::Result<BufferId> {
        let buf = self.alloc_buf(std::mem::size_of_val(data), label)?;
        if !data.is_empty() {
            self.to_buf(buf, bytemuck::cast_slice(data))?;
        }
        Ok(buf)
    }

    fn upload<T: Pod>(&mut self, buf: BufferId, data: &[T]) -> anyhow::Result<()> {
        self.to_buf(buf, bytemuck::cast_slice(data))
    }

    fn download<T: Pod>(&mut self, buf: BufferId, data: &mut [T]) -> anyhow::Result<()> {
        self.from_buf(buf, bytemuck::cast_slice_mut(data))
    }
}
