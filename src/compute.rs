//! wgpu implementation of [`ComputeDevice`].
//!
//! Operand buffers occupy bindings `0..operand_count` of group 0, the last
//! one writable; the push block sits right after them as a uniform.
//! Specialization constants become pipeline-overridable constants keyed by
//! their numeric id.  wgpu reports object-creation errors asynchronously,
//! so every creation runs inside an error scope that is popped before
//! returning.

use std::borrow::Cow;
use std::sync::Arc;

use wgpu::{BindGroup, BindGroupLayout, Buffer, ComputePipeline, PipelineLayout, ShaderModuleDescriptor, ShaderSource};

use crate::buffer::GpuBuffer;
use crate::config::DeviceLimits;
use crate::context::GpuContext;
use crate::device::{ComputeDevice, KernelBlob, KernelSource};
use crate::error::{DispatchError, Result};
use crate::payload::{PushPayload, SpecializationPayload};

/// Binding layout plus the uniform buffer carrying the push block.
pub struct WgpuLayout {
    bind_group_layout: BindGroupLayout,
    pipeline_layout: PipelineLayout,
    push_buffer: Arc<Buffer>,
    operand_count: usize,
}

pub struct WgpuBindings {
    bind_group: BindGroup,
    push_buffer: Arc<Buffer>,
}

fn buffer_entry(binding: u32, ty: wgpu::BufferBindingType) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

impl GpuContext {
    /// Run `create` inside validation and out-of-memory error scopes.
    fn scoped<T>(&self, stage: &'static str, create: impl FnOnce() -> T) -> Result<T> {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = create();
        let validation = pollster::block_on(self.device.pop_error_scope());
        let out_of_memory = pollster::block_on(self.device.pop_error_scope());
        match validation.or(out_of_memory) {
            Some(err) => Err(DispatchError::ResourceCreation {
                stage,
                message: err.to_string(),
            }),
            None => Ok(value),
        }
    }
}

fn shader_source(kernel: &KernelBlob) -> Result<ShaderSource<'_>> {
    match &kernel.source {
        KernelSource::SpirV(bytes) => {
            if bytes.is_empty() || bytes.len() % 4 != 0 {
                return Err(DispatchError::ResourceCreation {
                    stage: "shader module",
                    message: format!("SPIR-V blob '{}' has length {}", kernel.label, bytes.len()),
                });
            }
            Ok(wgpu::util::make_spirv(bytes))
        }
        KernelSource::Wgsl(text) => Ok(ShaderSource::Wgsl(Cow::Borrowed(text.as_ref()))),
    }
}

impl ComputeDevice for GpuContext {
    type Buffer = GpuBuffer<f32>;
    type Layout = WgpuLayout;
    type Pipeline = ComputePipeline;
    type Bindings = WgpuBindings;

    fn limits(&self) -> DeviceLimits {
        DeviceLimits::from(&self.device.limits())
    }

    fn buffer_len(&self, buffer: &GpuBuffer<f32>) -> usize {
        buffer.len
    }

    fn create_layout(&self, label: &str, operand_count: usize) -> Result<WgpuLayout> {
        if operand_count == 0 {
            return Err(DispatchError::Configuration("layout needs at least one operand".into()));
        }
        self.scoped("binding layout", || {
            let writable = operand_count - 1;
            let mut entries: Vec<wgpu::BindGroupLayoutEntry> = (0..operand_count as u32)
                .map(|binding| {
                    let read_only = binding as usize != writable;
                    buffer_entry(binding, wgpu::BufferBindingType::Storage { read_only })
                })
                .collect();
            entries.push(buffer_entry(operand_count as u32, wgpu::BufferBindingType::Uniform));

            let bind_group_layout = self
                .device
                .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some(label),
                    entries: &entries,
                });
            let pipeline_layout = self
                .device
                .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                    label: Some(label),
                    bind_group_layouts: &[&bind_group_layout],
                    push_constant_ranges: &[],
                });
            let push_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("push_payload"),
                size: PushPayload::SIZE,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            WgpuLayout {
                bind_group_layout,
                pipeline_layout,
                push_buffer: Arc::new(push_buffer),
                operand_count,
            }
        })
    }

    fn create_pipeline(
        &self,
        layout: &WgpuLayout,
        kernel: &KernelBlob,
        payload: &SpecializationPayload,
    ) -> Result<ComputePipeline> {
        let source = shader_source(kernel)?;
        let module = self.scoped("shader module", || {
            self.device.create_shader_module(ShaderModuleDescriptor {
                label: Some(kernel.label),
                source,
            })
        })?;

        let overrides = payload.overrides();
        let constants: Vec<(&str, f64)> = overrides
            .iter()
            .map(|(id, value)| (id.as_str(), *value))
            .collect();
        self.scoped("compute pipeline", || {
            self.device
                .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(kernel.label),
                    layout: Some(&layout.pipeline_layout),
                    module: &module,
                    entry_point: Some(kernel.entry_point),
                    compilation_options: wgpu::PipelineCompilationOptions {
                        constants: &constants,
                        zero_initialize_workgroup_memory: true,
                    },
                    cache: None,
                })
        })
    }

    fn bind(&self, layout: &WgpuLayout, buffers: &[&GpuBuffer<f32>]) -> Result<WgpuBindings> {
        if buffers.len() != layout.operand_count {
            return Err(DispatchError::Refused(format!(
                "layout has {} operand slots, got {} buffers",
                layout.operand_count,
                buffers.len()
            )));
        }
        let mut entries: Vec<wgpu::BindGroupEntry> = buffers
            .iter()
            .enumerate()
            .map(|(binding, operand)| wgpu::BindGroupEntry {
                binding: binding as u32,
                resource: operand.buffer.as_entire_binding(),
            })
            .collect();
        entries.push(wgpu::BindGroupEntry {
            binding: layout.operand_count as u32,
            resource: layout.push_buffer.as_entire_binding(),
        });
        let bind_group = self.scoped("bind group", || {
            self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("operand_bind_group"),
                layout: &layout.bind_group_layout,
                entries: &entries,
            })
        })?;
        Ok(WgpuBindings {
            bind_group,
            push_buffer: layout.push_buffer.clone(),
        })
    }

    fn submit_and_wait(
        &self,
        pipeline: &ComputePipeline,
        bindings: &WgpuBindings,
        push: &PushPayload,
        groups: [u32; 3],
    ) -> Result<()> {
        // The previous submission has completed, so the push block can be
        // overwritten in place.
        self.queue
            .write_buffer(&bindings.push_buffer, 0, bytemuck::bytes_of(push));

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("dispatch_encoder"),
            });
        {
            let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("dispatch_pass"),
                timestamp_writes: None,
            });
            cpass.set_pipeline(pipeline);
            cpass.set_bind_group(0, &bindings.bind_group, &[]);
            let [x, y, z] = groups;
            cpass.dispatch_workgroups(x, y, z);
        }
        let index = self.queue.submit(Some(encoder.finish()));
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(DispatchError::Execution(err.to_string()));
        }

        self.device
            .poll(wgpu::PollType::WaitForSubmissionIndex(index))
            .map_err(|e| DispatchError::Execution(format!("waiting for submission failed: {e}")))?;
        Ok(())
    }
}
