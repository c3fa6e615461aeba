use std::borrow::Cow;
use std::collections::HashMap;

use wgpu::util::DeviceExt;

use super::context::GpuDevice;
use super::lower::LoweredProgram;
use crate::context::{ActiveUniform, UniformLocation};
use crate::error::{CompileError, CompositorError, ShaderStage};
use crate::types::UniformType;
use crate::uniforms::UniformValue;

/// Where a uniform location writes to inside its program.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum UniformSlot {
    Block { offset: u32, ty: UniformType },
    Sampler(usize),
}

/// A linked program: shader modules, bind group layouts, the uniform block
/// and its CPU shadow, plus one render pipeline per target format.
pub(crate) struct ProgramObject {
    vertex: wgpu::ShaderModule,
    fragment: wgpu::ShaderModule,
    layout: wgpu::PipelineLayout,
    pub uniform_layout: wgpu::BindGroupLayout,
    pub sampler_layout: wgpu::BindGroupLayout,
    pub uniform_buffer: wgpu::Buffer,
    pub shadow: Vec<u8>,
    /// Texture unit each sampler slot reads from.
    pub sampler_units: Vec<i32>,
    pub active: Vec<ActiveUniform>,
    pub vertices: Option<(wgpu::Buffer, u32)>,
    pipelines: HashMap<wgpu::TextureFormat, Option<wgpu::RenderPipeline>>,
}

impl ProgramObject {
    /// Creates modules and layouts, then links against the canvas format so
    /// interface mismatches surface at compile time. `next_location` hands
    /// out context-wide uniform locations.
    pub(crate) fn compile(
        gpu: &GpuDevice,
        lowered: LoweredProgram,
        canvas_format: wgpu::TextureFormat,
        next_location: &mut dyn FnMut() -> UniformLocation,
    ) -> Result<(Self, Vec<(UniformLocation, UniformSlot)>), CompileError> {
        let vertex = gpu
            .scoped(|device| {
                device.create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some("doodle vertex shader"),
                    source: wgpu::ShaderSource::Glsl {
                        shader: Cow::Owned(lowered.vertex),
                        stage: wgpu::naga::ShaderStage::Vertex,
                        defines: &[],
                    },
                })
            })
            .map_err(|log| CompileError::new(ShaderStage::Vertex, log))?;
        let fragment = gpu
            .scoped(|device| {
                device.create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some("doodle fragment shader"),
                    source: wgpu::ShaderSource::Glsl {
                        shader: Cow::Owned(lowered.fragment),
                        stage: wgpu::naga::ShaderStage::Fragment,
                        defines: &[],
                    },
                })
            })
            .map_err(|log| CompileError::new(ShaderStage::Fragment, log))?;

        let device = &gpu.device;
        let uniform_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("doodle uniform layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        });
        let sampler_entries = sampler_layout_entries(lowered.samplers.len());
        let sampler_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("doodle sampler layout"),
            entries: &sampler_entries,
        });
        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("doodle pipeline layout"),
            bind_group_layouts: &[&uniform_layout, &sampler_layout],
            push_constant_ranges: &[],
        });
        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("doodle uniforms"),
            size: u64::from(lowered.block_size),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut slots = Vec::new();
        let mut active = Vec::new();
        for uniform in &lowered.uniforms {
            let location = next_location();
            active.push(ActiveUniform {
                name: uniform.name.clone(),
                ty: uniform.ty,
                location,
            });
            slots.push((
                location,
                UniformSlot::Block {
                    offset: uniform.offset,
                    ty: uniform.ty,
                },
            ));
        }
        for (index, name) in lowered.samplers.iter().enumerate() {
            let location = next_location();
            active.push(ActiveUniform {
                name: name.clone(),
                ty: UniformType::Sampler2D,
                location,
            });
            slots.push((location, UniformSlot::Sampler(index)));
        }

        let mut program = Self {
            vertex,
            fragment,
            layout,
            uniform_layout,
            sampler_layout,
            uniform_buffer,
            shadow: vec![0; lowered.block_size as usize],
            sampler_units: vec![0; lowered.samplers.len()],
            active,
            vertices: None,
            pipelines: HashMap::new(),
        };
        let pipeline = gpu
            .scoped(|device| program.build_pipeline(device, canvas_format))
            .map_err(|log| CompileError::new(ShaderStage::Link, log))?;
        program.pipelines.insert(canvas_format, Some(pipeline));
        Ok((program, slots))
    }

    /// Pipeline rendering into `format`, built on first use. A failed build
    /// is remembered so it is reported once.
    pub(crate) fn pipeline(
        &mut self,
        gpu: &GpuDevice,
        format: wgpu::TextureFormat,
    ) -> Option<wgpu::RenderPipeline> {
        if !self.pipelines.contains_key(&format) {
            let built = gpu.scoped(|device| self.build_pipeline(device, format));
            let pipeline = match built {
                Ok(pipeline) => Some(pipeline),
                Err(log) => {
                    tracing::warn!(?format, error = %log, "failed to build pipeline for target format");
                    None
                }
            };
            self.pipelines.insert(format, pipeline);
        }
        self.pipelines.get(&format).cloned().flatten()
    }

    fn build_pipeline(&self, device: &wgpu::Device, format: wgpu::TextureFormat) -> wgpu::RenderPipeline {
        device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("doodle pipeline"),
            layout: Some(&self.layout),
            vertex: wgpu::VertexState {
                module: &self.vertex,
                entry_point: Some("main"),
                buffers: &[wgpu::VertexBufferLayout {
                    array_stride: 8,
                    step_mode: wgpu::VertexStepMode::Vertex,
                    attributes: &[wgpu::VertexAttribute {
                        format: wgpu::VertexFormat::Float32x2,
                        offset: 0,
                        shader_location: 0,
                    }],
                }],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: None,
                polygon_mode: wgpu::PolygonMode::Fill,
                unclipped_depth: false,
                conservative: false,
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState {
                count: 1,
                mask: !0,
                alpha_to_coverage_enabled: false,
            },
            fragment: Some(wgpu::FragmentState {
                module: &self.fragment,
                entry_point: Some("main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }),
            multiview: None,
            cache: None,
        })
    }

    pub(crate) fn upload_vertices(&mut self, device: &wgpu::Device, vertices: &[f32]) {
        let count = (vertices.len() / 2) as u32;
        self.vertices = (count > 0).then(|| {
            let buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("doodle vertices"),
                contents: bytemuck::cast_slice(vertices),
                usage: wgpu::BufferUsages::VERTEX,
            });
            (buffer, count)
        });
    }

    pub(crate) fn write_uniform(
        &mut self,
        slot: UniformSlot,
        value: &UniformValue,
    ) -> Result<(), CompositorError> {
        match slot {
            UniformSlot::Sampler(index) => {
                let UniformValue::Int(unit) = value else {
                    return Err(CompositorError::Uniform(format!(
                        "sampler uniforms take a texture unit, got {value:?}"
                    )));
                };
                if let Some(slot) = self.sampler_units.get_mut(index) {
                    *slot = *unit;
                }
                Ok(())
            }
            UniformSlot::Block { offset, ty } => {
                let expected = match value {
                    UniformValue::Float(_) => UniformType::Float,
                    UniformValue::Vec2(_) => UniformType::Vec2,
                    UniformValue::Vec3(_) => UniformType::Vec3,
                    UniformValue::Vec4(_) => UniformType::Vec4,
                    UniformValue::Int(_) => UniformType::Int,
                };
                if expected != ty {
                    return Err(CompositorError::Uniform(format!(
                        "{value:?} does not match declared type {ty:?}"
                    )));
                }
                let bytes: &[u8] = match value {
                    UniformValue::Float(v) => bytemuck::bytes_of(v),
                    UniformValue::Vec2(v) => bytemuck::cast_slice(v),
                    UniformValue::Vec3(v) => bytemuck::cast_slice(v),
                    UniformValue::Vec4(v) => bytemuck::cast_slice(v),
                    UniformValue::Int(v) => bytemuck::bytes_of(v),
                };
                let start = offset as usize;
                let target = self
                    .shadow
                    .get_mut(start..start + bytes.len())
                    .ok_or_else(|| CompositorError::Uniform("write past the uniform block".into()))?;
                target.copy_from_slice(bytes);
                Ok(())
            }
        }
    }
}

/// Texture at `2k`, sampler at `2k + 1` for every sampler slot `k`.
fn sampler_layout_entries(count: usize) -> Vec<wgpu::BindGroupLayoutEntry> {
    (0..count as u32)
        .flat_map(|slot| {
            [
                wgpu::BindGroupLayoutEntry {
                    binding: slot * 2,
                    visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: slot * 2 + 1,
                    visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ]
        })
        .collect()
}
