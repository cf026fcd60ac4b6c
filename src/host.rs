//! Host reference executor.
//!
//! Runs kernels as Rust closures over word-addressed host memory. Launch
//! semantics mirror a device queue: `run_kernel` only enqueues, and queued
//! launches execute in submission order on `sync()` or before any transfer.
//! Every call is recorded in a trace that tests use to check the step
//! protocol.

use std::sync::{Arc, Mutex};

use anyhow::Context;
use log::debug;

use crate::{
    backend::{Backend, BufferId, KernelEntry, KernelId, KernelSource, ModuleId},
    error::RunnerError,
    kernels::CodegenContext,
    Float,
};

/// Launch geometry passed to host kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Launch {
    pub grid: [u32; 3],
    pub block: [u32; 3],
}

impl Launch {
    /// Number of threads along each axis (`grid * block`).
    pub fn extent(&self) -> [usize; 3] {
        [
            (self.grid[0] * self.block[0]) as usize,
            (self.grid[1] * self.block[1]) as usize,
            (self.grid[2] * self.block[2]) as usize,
        ]
    }

    /// Global invocation ids in X-fastest order.
    pub fn threads(&self) -> impl Iterator<Item = [usize; 3]> {
        let [nx, ny, nz] = self.extent();
        (0..nz).flat_map(move |z| (0..ny).flat_map(move |y| (0..nx).map(move |x| [x, y, z])))
    }
}

pub type HostKernel =
    Arc<dyn Fn(&mut HostMemory, &[BufferId], &Launch) -> anyhow::Result<()> + Send + Sync>;

/// Device memory of the host backend. Buffers are stored as 32-bit words so
/// they can be viewed as `f32` or `u32` slices.
#[derive(Debug, Default)]
pub struct HostMemory {
    buffers: Vec<Vec<u32>>,
}

impl HostMemory {
    fn get(&self, buf: BufferId) -> anyhow::Result<&Vec<u32>> {
        self.buffers
            .get(buf.0)
            .ok_or_else(|| RunnerError::device(format!("unknown buffer {}", buf.0)).into())
    }

    fn get_mut(&mut self, buf: BufferId) -> anyhow::Result<&mut Vec<u32>> {
        self.buffers
            .get_mut(buf.0)
            .ok_or_else(|| RunnerError::device(format!("unknown buffer {}", buf.0)).into())
    }

    pub fn words(&self, buf: BufferId) -> anyhow::Result<&[u32]> {
        Ok(self.get(buf)?.as_slice())
    }

    pub fn floats(&self, buf: BufferId) -> anyhow::Result<&[Float]> {
        Ok(bytemuck::cast_slice(self.get(buf)?.as_slice()))
    }

    pub fn floats_mut(&mut self, buf: BufferId) -> anyhow::Result<&mut [Float]> {
        Ok(bytemuck::cast_slice_mut(self.get_mut(buf)?.as_mut_slice()))
    }

    /// Moves a buffer out so a kernel can write it while reading others.
    /// Must be returned with `restore`.
    pub fn take(&mut self, buf: BufferId) -> anyhow::Result<Vec<Float>> {
        let words = std::mem::take(self.get_mut(buf)?);
        Ok(bytemuck::allocation::cast_vec(words))
    }

    pub fn restore(&mut self, buf: BufferId, data: Vec<Float>) -> anyhow::Result<()> {
        *self.get_mut(buf)? = bytemuck::allocation::cast_vec(data);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    Launch { name: String, args: Vec<BufferId>, grid: [u32; 3] },
    Sync,
    ToDevice(BufferId),
    FromDevice(BufferId),
}

/// Shared view of a host backend's trace, usable after the backend has
/// been moved into a runner.
#[derive(Debug, Clone, Default)]
pub struct TraceHandle {
    events: Arc<Mutex<Vec<TraceEvent>>>,
}

impl TraceHandle {
    fn push(&self, event: TraceEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }

    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }

    /// Names of launched kernels, in submission order.
    pub fn launches(&self) -> Vec<(String, Vec<BufferId>)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                TraceEvent::Launch { name, args, .. } => Some((name, args)),
                _ => None,
            })
            .collect()
    }
}

struct BoundKernel {
    entry: KernelEntry,
    args: Vec<BufferId>,
    block: [u32; 3],
}

pub struct HostBackend {
    memory: HostMemory,
    labels: Vec<String>,
    sizes: Vec<usize>,
    modules: Vec<KernelSource>,
    kernels: Vec<BoundKernel>,
    pending: Vec<(KernelId, [u32; 3])>,
    trace: TraceHandle,
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HostBackend {
    pub fn new() -> Self {
        Self {
            memory: HostMemory::default(),
            labels: Vec::new(),
            sizes: Vec::new(),
            modules: Vec::new(),
            kernels: Vec::new(),
            pending: Vec::new(),
            trace: TraceHandle::default(),
        }
    }

    pub fn trace(&self) -> TraceHandle {
        self.trace.clone()
    }

    pub fn label(&self, buf: BufferId) -> Option<&str> {
        self.labels.get(buf.0).map(|s| s.as_str())
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        for (kernel, grid) in std::mem::take(&mut self.pending) {
            let bound = &self.kernels[kernel.0];
            let launch = Launch { grid, block: bound.block };
            (bound.entry.host)(&mut self.memory, &bound.args, &launch)
                .with_context(|| format!("kernel {} failed", bound.entry.name))?;
        }
        Ok(())
    }

    fn check_range(&self, buf: BufferId, len: usize) -> anyhow::Result<()> {
        let size = self
            .sizes
            .get(buf.0)
            .copied()
            .ok_or_else(|| RunnerError::device(format!("unknown buffer {}", buf.0)))?;
        if len > size {
            return Err(RunnerError::device(format!(
                "copy of {} bytes exceeds buffer {} ({} bytes)", len, self.labels[buf.0], size
            ))
            .into());
        }
        Ok(())
    }
}

impl Backend for HostBackend {
    fn name(&self) -> &str {
        "host"
    }

    fn defines(&self) -> CodegenContext {
        let mut ctx = CodegenContext::new();
        ctx.insert("backend", "host");
        ctx
    }

    fn build(&mut self, source: &KernelSource) -> anyhow::Result<ModuleId> {
        debug!("Building host module with entry points {:?}", source.entry_points());
        self.modules.push(source.clone());
        Ok(ModuleId(self.modules.len() - 1))
    }

    fn get_kernel(
        &mut self,
        module: ModuleId,
        name: &str,
        args: &[BufferId],
        block: [u32; 3],
    ) -> anyhow::Result<KernelId> {
        let source = self
            .modules
            .get(module.0)
            .ok_or_else(|| RunnerError::device(format!("unknown module {}", module.0)))?;
        let (_, entry) = source
            .find(name)
            .ok_or_else(|| RunnerError::device(format!("kernel {} not found", name)))?;
        for arg in args {
            if arg.0 >= self.sizes.len() {
                return Err(RunnerError::device(format!(
                    "kernel {} bound to unknown buffer {}", name, arg.0
                ))
                .into());
            }
        }
        self.kernels.push(BoundKernel {
            entry: entry.clone(),
            args: args.to_vec(),
            block,
        });
        Ok(KernelId(self.kernels.len() - 1))
    }

    fn run_kernel(&mut self, kernel: KernelId, grid: &[u32]) -> anyhow::Result<()> {
        let bound = self
            .kernels
            .get(kernel.0)
            .ok_or_else(|| RunnerError::device(format!("unknown kernel {}", kernel.0)))?;
        if grid.is_empty() || grid.len() > 3 {
            return Err(RunnerError::device(format!(
                "invalid launch grid {:?} for {}", grid, bound.entry.name
            ))
            .into());
        }
        let mut grid3 = [1u32; 3];
        grid3[..grid.len()].copy_from_slice(grid);
        self.trace.push(TraceEvent::Launch {
            name: bound.entry.name.clone(),
            args: bound.args.clone(),
            grid: grid3,
        });
        self.pending.push((kernel, grid3));
        Ok(())
    }

    fn sync(&mut self) -> anyhow::Result<()> {
        self.flush()?;
        self.trace.push(TraceEvent::Sync);
        Ok(())
    }

    fn alloc_buf(&mut self, size: usize, label: &str) -> anyhow::Result<BufferId> {
        let words = size.div_ceil(4).max(1);
        self.memory.buffers.push(vec![0; words]);
        self.labels.push(label.to_string());
        self.sizes.push(size);
        Ok(BufferId(self.memory.buffers.len() - 1))
    }

    fn buffer_size(&self, buf: BufferId) -> Option<usize> {
        self.sizes.get(buf.0).copied()
    }

    fn to_buf(&mut self, buf: BufferId, data: &[u8]) -> anyhow::Result<()> {
        self.check_range(buf, data.len())?;
        self.flush()?;
        let words = self.memory.get_mut(buf)?;
        bytemuck::cast_slice_mut::<u32, u8>(words.as_mut_slice())[..data.len()].copy_from_slice(data);
        self.trace.push(TraceEvent::ToDevice(buf));
        Ok(())
    }

    fn from_buf(&mut self, buf: BufferId, data: &mut [u8]) -> anyhow::Result<()> {
        self.check_range(buf, data.len())?;
        self.flush()?;
        let words = self.memory.get(buf)?;
        data.copy_from_slice(&bytemuck::cast_slice::<u32, u8>(words.as_slice())[..data.len()]);
        self.trace.push(TraceEvent::FromDevice(buf));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendExt, KernelUnit};

    fn scale_source() -> KernelSource {
        let host: HostKernel = Arc::new(|mem: &mut HostMemory, args: &[BufferId], launch: &Launch| {
            let data = mem.floats_mut(args[0])?;
            for [x, _, _] in launch.threads() {
                if x < data.len() {
                    data[x] *= 2.0;
                }
            }
            Ok(())
        });
        KernelSource::new().with_unit(KernelUnit {
            label: "scale".into(),
            wgsl: String::new(),
            entries: vec![KernelEntry { name: "Scale".into(), host }],
        })
    }

    #[test]
    fn launches_are_deferred_until_sync() {
        let mut backend = HostBackend::new();
        let buf = backend.alloc_like(&[1.0f32, 2.0, 3.0], "data").unwrap();
        let module = backend.build(&scale_source()).unwrap();
        let kernel = backend.get_kernel(module, "Scale", &[buf], [4, 1, 1]).unwrap();

        backend.run_kernel(kernel, &[1]).unwrap();
        assert_eq!(backend.memory.floats(buf).unwrap(), &[1.0, 2.0, 3.0]);
        backend.sync().unwrap();
        assert_eq!(backend.memory.floats(buf).unwrap(), &[2.0, 4.0, 6.0]);
    }

    #[test]
    fn transfers_wait_for_queued_launches() {
        let mut backend = HostBackend::new();
        let buf = backend.alloc_like(&[1.0f32, 1.0], "data").unwrap();
        let module = backend.build(&scale_source()).unwrap();
        let kernel = backend.get_kernel(module, "Scale", &[buf], [2, 1, 1]).unwrap();
        backend.run_kernel(kernel, &[1]).unwrap();

        let mut out = [0.0f32; 2];
        backend.download(buf, &mut out).unwrap();
        assert_eq!(out, [2.0, 2.0]);

        let trace = backend.trace().events();
        assert!(matches!(trace.last(), Some(TraceEvent::FromDevice(b)) if *b == buf));
    }

    #[test]
    fn unknown_kernel_and_oversized_copy_fail() {
        let mut backend = HostBackend::new();
        let buf = backend.alloc_buf(8, "small").unwrap();
        let module = backend.build(&scale_source()).unwrap();
        assert!(backend.get_kernel(module, "Missing", &[buf], [1, 1, 1]).is_err());
        assert!(backend.upload(buf, &[0.0f32; 3]).is_err());
        assert!(backend.run_kernel(KernelId(7), &[1]).is_err());
    }

    #[test]
    fn launch_threads_cover_grid_times_block() {
        let launch = Launch { grid: [2, 3, 1], block: [4, 1, 1] };
        assert_eq!(launch.extent(), [8, 3, 1]);
        assert_eq!(launch.threads().count(), 24);
        assert_eq!(launch.threads().nth(9), Some([1, 1, 0]));
    }
}
