use anyhow::Result;
use log::{debug, info};

use crate::{
    backend::{Backend, BufferId, KernelId, KernelSource, ModuleId},
    error::RunnerError,
    kernels::CodegenContext,
};

struct GpuModule {
    source: KernelSource,
    shaders: Vec<wgpu::ShaderModule>,
}

struct GpuKernel {
    name: String,
    pipeline: wgpu::ComputePipeline,
    bind_group: wgpu::BindGroup,
}

struct GpuBuffer {
    buffer: wgpu::Buffer,
    size: usize,
}

/// Backend running WGSL kernels through wgpu.
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_name: String,
    modules: Vec<GpuModule>,
    kernels: Vec<GpuKernel>,
    buffers: Vec<GpuBuffer>,
}

fn aligned(size: usize) -> u64 {
    (size.div_ceil(4) * 4).max(4) as u64
}

impl WgpuBackend {
    pub async fn new() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                force_fallback_adapter: false,
                compatible_surface: None,
            })
            .await?;

        let adapter_info = adapter.get_info();
        info!("GPU Adapter Selected: {} ({:?}, {:?}, {:?})",
              adapter_info.name, adapter_info.vendor, adapter_info.device_type, adapter_info.backend);

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                    label: None,
                    memory_hints: wgpu::MemoryHints::Performance,
                    ..Default::default()
                },
            )
            .await?;

        Ok(Self {
            device,
            queue,
            adapter_name: adapter_info.name,
            modules: Vec::new(),
            kernels: Vec::new(),
            buffers: Vec::new(),
        })
    }

    /// Blocking constructor for callers outside an async context.
    pub fn new_blocking() -> Result<Self> {
        pollster::block_on(Self::new())
    }

    fn buffer(&self, buf: BufferId) -> Result<&GpuBuffer> {
        self.buffers
            .get(buf.0)
            .ok_or_else(|| RunnerError::device(format!("unknown buffer {}", buf.0)).into())
    }

    fn check_range(&self, buf: BufferId, len: usize) -> Result<()> {
        let size = self.buffer(buf)?.size;
        if len > size {
            return Err(RunnerError::device(format!(
                "copy of {} bytes exceeds buffer {} ({} bytes)", len, buf.0, size
            ))
            .into());
        }
        Ok(())
    }

    /// Runs `f` inside a validation error scope and turns a captured error
    /// into a device error.
    fn validated<T>(&self, what: &str, f: impl FnOnce(&wgpu::Device) -> T) -> Result<T> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f(&self.device);
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(RunnerError::device(format!("{}: {}", what, err)).into());
        }
        Ok(value)
    }
}

impl Backend for WgpuBackend {
    fn name(&self) -> &str {
        &self.adapter_name
    }

    fn defines(&self) -> CodegenContext {
        let mut ctx = CodegenContext::new();
        ctx.insert("backend", "wgpu");
        ctx.insert("max_workgroup_size_x", self.device.limits().max_compute_workgroup_size_x);
        ctx
    }

    fn build(&mut self, source: &KernelSource) -> Result<ModuleId> {
        let mut shaders = Vec::with_capacity(source.units.len());
        for unit in &source.units {
            debug!("Compiling shader module {}", unit.label);
            let shader = self.validated(&format!("shader {} failed to compile", unit.label), |device| {
                device.create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some(&unit.label),
                    source: wgpu::ShaderSource::Wgsl(unit.wgsl.as_str().into()),
                })
            })?;
            shaders.push(shader);
        }
        self.modules.push(GpuModule { source: source.clone(), shaders });
        Ok(ModuleId(self.modules.len() - 1))
    }

    fn get_kernel(
        &mut self,
        module: ModuleId,
        name: &str,
        args: &[BufferId],
        _block: [u32; 3],
    ) -> Result<KernelId> {
        // Workgroup size is fixed in the generated WGSL.
        let gpu_module = self
            .modules
            .get(module.0)
            .ok_or_else(|| RunnerError::device(format!("unknown module {}", module.0)))?;
        let (unit, _) = gpu_module
            .source
            .find(name)
            .ok_or_else(|| RunnerError::device(format!("kernel {} not found", name)))?;
        let shader = &gpu_module.shaders[unit];

        let pipeline = self.validated(&format!("pipeline {}", name), |device| {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(name),
                layout: None,
                module: shader,
                entry_point: Some(name),
                compilation_options: Default::default(),
                cache: None,
            })
        })?;

        let mut entries = Vec::with_capacity(args.len());
        for (binding, arg) in args.iter().enumerate() {
            entries.push(wgpu::BindGroupEntry {
                binding: binding as u32,
                resource: self.buffer(*arg)?.buffer.as_entire_binding(),
            });
        }
        let layout = pipeline.get_bind_group_layout(0);
        let bind_group = self.validated(&format!("bind group of {}", name), |device| {
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(name),
                layout: &layout,
                entries: &entries,
            })
        })?;

        self.kernels.push(GpuKernel { name: name.to_string(), pipeline, bind_group });
        Ok(KernelId(self.kernels.len() - 1))
    }

    fn run_kernel(&mut self, kernel: KernelId, grid: &[u32]) -> Result<()> {
        let gpu_kernel = self
            .kernels
            .get(kernel.0)
            .ok_or_else(|| RunnerError::device(format!("unknown kernel {}", kernel.0)))?;
        if grid.is_empty() || grid.len() > 3 {
            return Err(RunnerError::device(format!(
                "invalid launch grid {:?} for {}", grid, gpu_kernel.name
            ))
            .into());
        }
        let mut grid3 = [1u32; 3];
        grid3[..grid.len()].copy_from_slice(grid);

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(&gpu_kernel.name),
        });
        {
            let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(&gpu_kernel.name),
                timestamp_writes: None,
            });
            compute_pass.set_pipeline(&gpu_kernel.pipeline);
            compute_pass.set_bind_group(0, &gpu_kernel.bind_group, &[]);
            compute_pass.dispatch_workgroups(grid3[0], grid3[1], grid3[2]);
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        let _ = self.device.poll(wgpu::MaintainBase::Wait);
        Ok(())
    }

    fn alloc_buf(&mut self, size: usize, label: &str) -> Result<BufferId> {
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: aligned(size),
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        self.buffers.push(GpuBuffer { buffer, size });
        Ok(BufferId(self.buffers.len() - 1))
    }

    fn buffer_size(&self, buf: BufferId) -> Option<usize> {
        self.buffers.get(buf.0).map(|b| b.size)
    }

    fn to_buf(&mut self, buf: BufferId, data: &[u8]) -> Result<()> {
        self.check_range(buf, data.len())?;
        if data.len() % 4 != 0 {
            return Err(RunnerError::device(format!(
                "upload of {} bytes is not word aligned", data.len()
            ))
            .into());
        }
        if !data.is_empty() {
            self.queue.write_buffer(&self.buffer(buf)?.buffer, 0, data);
        }
        Ok(())
    }

    fn from_buf(&mut self, buf: BufferId, data: &mut [u8]) -> Result<()> {
        self.check_range(buf, data.len())?;
        if data.is_empty() {
            return Ok(());
        }
        let copy_size = aligned(data.len());

        let staging_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Staging Buffer"),
            size: copy_size,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Copy Encoder"),
        });
        encoder.copy_buffer_to_buffer(&self.buffer(buf)?.buffer, 0, &staging_buffer, 0, copy_size);
        self.queue.submit(std::iter::once(encoder.finish()));

        let buffer_slice = staging_buffer.slice(..);
        let (sender, receiver) = futures::channel::oneshot::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });

        let _ = self.device.poll(wgpu::MaintainBase::Wait);
        pollster::block_on(receiver)?
            .map_err(|e| RunnerError::device(format!("mapping buffer {} failed: {}", buf.0, e)))?;

        {
            let mapped = buffer_slice.get_mapped_range();
            data.copy_from_slice(&mapped[..data.len()]);
        }
        staging_buffer.unmap();
        Ok(())
    }
}
