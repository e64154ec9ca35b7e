//! WGSL bridge: runs generated kernels through wgpu.
//!
//! Buffer arguments bind to `@binding(0..)` in argument order. Scalar
//! arguments are packed, in order, into a uniform block at
//! `@binding(3)`. Local-memory arguments are dropped: WGSL sizes
//! workgroup memory in source.
//!
//! Kernels cannot fault on arithmetic here: WGSL integer division by zero
//! returns the dividend, so only validation errors become
//! `ExecutionError`.

use std::collections::HashMap;

use wgpu::util::DeviceExt;

use crate::bridge::{BridgeStats, CompiledKernel, DeviceBuffer, Dialect, KernelArg, NativeBridge};
use crate::error::{Error, Result};
use crate::kir::FUSED_WORKGROUP_SIZE;

const PARAMS_BINDING: u32 = 3;
const MAX_SCALAR_ARGS: usize = 3;

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct LaunchParams {
    arg0: u32,
    arg1: u32,
    arg2: u32,
    _pad: u32,
}

pub struct WgpuBridge {
    device: wgpu::Device,
    queue: wgpu::Queue,
    next_id: u64,
    pipelines: HashMap<u64, wgpu::ComputePipeline>,
    buffers: HashMap<u64, wgpu::Buffer>,
    stats: BridgeStats,
}

impl WgpuBridge {
    /// Bring up the first high-performance adapter.
    pub fn try_new() -> Result<Self> {
        let (device, queue) = super::try_create_device()
            .ok_or_else(|| Error::DeviceUnavailable("no wgpu adapter found".to_string()))?;
        Ok(Self::from_device(device, queue))
    }

    pub fn from_device(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        Self {
            device,
            queue,
            next_id: 0,
            pipelines: HashMap::new(),
            buffers: HashMap::new(),
            stats: BridgeStats::default(),
        }
    }

    fn fresh_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn buffer(&self, handle: &DeviceBuffer) -> Result<&wgpu::Buffer> {
        self.buffers
            .get(&handle.id)
            .ok_or_else(|| Error::execution(format!("unknown device buffer {}", handle.id)))
    }

    fn pop_error_scope(&self) -> Option<wgpu::Error> {
        pollster::block_on(self.device.pop_error_scope())
    }
}

impl NativeBridge for WgpuBridge {
    fn dialect(&self) -> Dialect {
        Dialect::Wgsl
    }

    fn compile(&mut self, source: &str, entry_point: &str) -> Result<CompiledKernel> {
        self.stats.compiles += 1;
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(entry_point),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry_point),
                layout: None,
                module: &module,
                entry_point: Some(entry_point),
                compilation_options: Default::default(),
                cache: None,
            });
        if let Some(err) = self.pop_error_scope() {
            return Err(Error::compilation(entry_point, err.to_string()));
        }

        let id = self.fresh_id();
        self.pipelines.insert(id, pipeline);
        tracing::debug!(entry_point, id, "wgsl pipeline created");
        Ok(CompiledKernel {
            id,
            entry_point: entry_point.to_string(),
        })
    }

    fn allocate(&mut self, size_bytes: usize) -> Result<DeviceBuffer> {
        self.stats.allocations += 1;
        // Bindings need at least one element and copies need 4-byte sizes.
        let size = (size_bytes.max(4).div_ceil(4) * 4) as u64;
        let limit = self.device.limits().max_storage_buffer_binding_size as u64;
        if size > limit {
            return Err(Error::execution(format!(
                "buffer of {} bytes exceeds the device binding limit of {}",
                size, limit
            )));
        }
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("hadope_data"),
            size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let id = self.fresh_id();
        self.buffers.insert(id, buffer);
        Ok(DeviceBuffer { id, size_bytes })
    }

    fn transfer_to_device(&mut self, data: &[i32], handle: &DeviceBuffer) -> Result<()> {
        self.stats.uploads += 1;
        let buffer = self.buffer(handle)?;
        if data.len() > handle.len() {
            return Err(Error::execution(format!(
                "upload of {} elements into a buffer of {}",
                data.len(),
                handle.len()
            )));
        }
        if !data.is_empty() {
            self.queue
                .write_buffer(buffer, 0, bytemuck::cast_slice(data));
            self.queue.submit(std::iter::empty());
        }
        Ok(())
    }

    fn transfer_from_device(&mut self, handle: &DeviceBuffer) -> Result<Vec<i32>> {
        self.stats.downloads += 1;
        let buffer = self.buffer(handle)?;
        let size = buffer.size();
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("hadope_staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("hadope_readback"),
            });
        encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, size);
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|_| Error::execution("GPU readback channel closed"))?
            .map_err(|e| Error::execution(format!("GPU readback failed: {}", e)))?;

        let data = slice.get_mapped_range();
        let mut values: Vec<i32> = bytemuck::cast_slice(&data).to_vec();
        drop(data);
        staging.unmap();

        values.truncate(handle.len());
        Ok(values)
    }

    fn launch(
        &mut self,
        kernel: &CompiledKernel,
        args: &[KernelArg],
        global_size: usize,
        local_size: Option<usize>,
    ) -> Result<()> {
        self.stats.launches += 1;
        let pipeline = self.pipelines.get(&kernel.id).ok_or_else(|| {
            Error::execution(format!("kernel `{}` was not compiled", kernel.entry_point))
        })?;

        let group = local_size.unwrap_or(FUSED_WORKGROUP_SIZE as usize).max(1);
        if local_size.is_some() && global_size % group != 0 {
            return Err(Error::execution(format!(
                "{}: global size {} is not a multiple of local size {}",
                kernel.entry_point, global_size, group
            )));
        }
        let workgroups = global_size.div_ceil(group);
        let max_groups = self.device.limits().max_compute_workgroups_per_dimension as usize;
        if workgroups > max_groups {
            return Err(Error::execution(format!(
                "{}: {} workgroups exceed the device limit of {}",
                kernel.entry_point, workgroups, max_groups
            )));
        }
        if workgroups == 0 {
            return Ok(());
        }

        let mut storage = Vec::new();
        let mut scalars = Vec::new();
        for arg in args {
            match arg {
                KernelArg::Buffer(handle) => storage.push(self.buffer(handle)?),
                KernelArg::Local(_) => {}
                KernelArg::Uint(v) => scalars.push(*v),
            }
        }
        if scalars.len() > MAX_SCALAR_ARGS {
            return Err(Error::execution(format!(
                "{}: at most {} scalar arguments are supported",
                kernel.entry_point, MAX_SCALAR_ARGS
            )));
        }

        let params_buf = (!scalars.is_empty()).then(|| {
            scalars.resize(MAX_SCALAR_ARGS, 0);
            let params = LaunchParams {
                arg0: scalars[0],
                arg1: scalars[1],
                arg2: scalars[2],
                _pad: 0,
            };
            self.device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("hadope_params"),
                    contents: bytemuck::bytes_of(&params),
                    usage: wgpu::BufferUsages::UNIFORM,
                })
        });

        let mut entries: Vec<wgpu::BindGroupEntry> = storage
            .iter()
            .enumerate()
            .map(|(binding, buffer)| wgpu::BindGroupEntry {
                binding: binding as u32,
                resource: buffer.as_entire_binding(),
            })
            .collect();
        if let Some(params) = &params_buf {
            entries.push(wgpu::BindGroupEntry {
                binding: PARAMS_BINDING,
                resource: params.as_entire_binding(),
            });
        }

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("hadope_bind_group"),
            layout: &pipeline.get_bind_group_layout(0),
            entries: &entries,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("hadope_dispatch"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(kernel.entry_point.as_str()),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(workgroups as u32, 1, 1);
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        self.device.poll(wgpu::Maintain::Wait);
        if let Some(err) = self.pop_error_scope() {
            return Err(Error::execution(format!("{}: {}", kernel.entry_point, err)));
        }
        Ok(())
    }

    fn release(&mut self, handle: DeviceBuffer) {
        if let Some(buffer) = self.buffers.remove(&handle.id) {
            buffer.destroy();
        }
    }

    fn stats(&self) -> BridgeStats {
        self.stats
    }
}
