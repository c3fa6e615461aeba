//! wgpu implementation of [`GraphicsContext`].
//!
//! - `context` creates a headless instance/device/queue.
//! - `lower` rewrites GL-style GLSL into the Vulkan dialect naga accepts.
//! - `pipeline` links lowered programs and owns their uniform blocks.
//! - `textures` tracks mutable texture storage and shared samplers.
//!
//! Draws and clears are recorded into one pending command encoder which is
//! submitted before any queue write, readback or explicit flush, so GPU
//! work observes the same ordering as the immediate-mode calls.

mod context;
mod lower;
mod pipeline;
mod textures;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crossbeam_channel::TryRecvError;
use wgpu::util::DeviceExt;

pub use context::{GpuPowerPreference, WgpuOptions};

use self::context::GpuDevice;
use self::pipeline::{ProgramObject, UniformSlot};
use self::textures::{check_length, expand_pixels, storage_format, SamplerCache, TextureObject};
use crate::context::{
    ActiveUniform, CapabilityReport, FramebufferId, GraphicsContext, ProgramId, TexImage,
    TexSubImage, TextureId, UniformLocation,
};
use crate::error::{CompileError, CompositorError};
use crate::texture::exceeds;
use crate::types::{Capability, FilterMode, TextureParameters};
use crate::uniforms::UniformValue;

const CANVAS_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;
const READBACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolved render target of the next clear or draw.
struct Target {
    view: wgpu::TextureView,
    format: wgpu::TextureFormat,
    texture: Option<TextureId>,
    width: u32,
    height: u32,
}

pub struct WgpuContext {
    gpu: GpuDevice,
    programs: HashMap<ProgramId, ProgramObject>,
    locations: HashMap<UniformLocation, (ProgramId, UniformSlot)>,
    textures: HashMap<TextureId, TextureObject>,
    framebuffers: HashMap<FramebufferId, TextureId>,
    units: HashMap<u32, TextureId>,
    samplers: SamplerCache,
    placeholder: (wgpu::TextureView, wgpu::Sampler),
    canvas: TextureObject,
    program: Option<ProgramId>,
    target: Option<FramebufferId>,
    viewport: (u32, u32, u32, u32),
    encoder: Option<wgpu::CommandEncoder>,
    next_id: u32,
    report: CapabilityReport,
}

impl WgpuContext {
    pub fn new(options: WgpuOptions) -> Result<Self, CompositorError> {
        let gpu = GpuDevice::new(options)?;
        let mut samplers = SamplerCache::default();

        // Unbound units sample as opaque black, like an incomplete GL texture.
        let placeholder = gpu.device.create_texture_with_data(
            &gpu.queue,
            &wgpu::TextureDescriptor {
                label: Some("doodle placeholder"),
                size: wgpu::Extent3d {
                    width: 1,
                    height: 1,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu::TextureFormat::Rgba8Unorm,
                usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                view_formats: &[],
            },
            wgpu::util::TextureDataOrder::LayerMajor,
            &[0, 0, 0, 255],
        );
        let placeholder_sampler =
            samplers.get(&gpu.device, &TextureParameters::clamped(FilterMode::Nearest));

        Ok(Self {
            gpu,
            programs: HashMap::new(),
            locations: HashMap::new(),
            textures: HashMap::new(),
            framebuffers: HashMap::new(),
            units: HashMap::new(),
            samplers,
            placeholder: (
                placeholder.create_view(&wgpu::TextureViewDescriptor::default()),
                placeholder_sampler,
            ),
            canvas: TextureObject::new(),
            program: None,
            target: None,
            viewport: (0, 0, 0, 0),
            encoder: None,
            next_id: 1,
            report: CapabilityReport::default(),
        })
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn submit_pending(&mut self) {
        if let Some(encoder) = self.encoder.take() {
            self.gpu.queue.submit(Some(encoder.finish()));
        }
    }

    fn resolve_target(&self) -> Option<Target> {
        let (record, texture) = match self.target {
            None => (&self.canvas, None),
            Some(framebuffer) => {
                let texture = *self.framebuffers.get(&framebuffer)?;
                (self.textures.get(&texture)?, Some(texture))
            }
        };
        Some(Target {
            view: record.attachment_view()?,
            format: record.format,
            texture,
            width: record.width,
            height: record.height,
        })
    }

    /// Texture and sampler bound to `unit`, or the placeholder when the unit
    /// is empty, unusable, or is the texture being rendered to.
    fn sampled(&mut self, unit: i32, target: Option<TextureId>) -> (wgpu::TextureView, wgpu::Sampler) {
        let record = u32::try_from(unit)
            .ok()
            .and_then(|unit| self.units.get(&unit).copied())
            .filter(|texture| Some(*texture) != target)
            .and_then(|texture| self.textures.get(&texture));
        let Some(record) = record else {
            return self.placeholder.clone();
        };
        if record.format == wgpu::TextureFormat::Rgba32Float && !self.gpu.float32_filterable {
            tracing::debug!(unit, "float texture is not filterable on this device; sampling placeholder");
            return self.placeholder.clone();
        }
        match record.view() {
            Some(view) => (view, self.samplers.get(&self.gpu.device, &record.parameters)),
            None => self.placeholder.clone(),
        }
    }

    fn record_clear(&mut self, target: &Target) {
        let encoder = self.encoder.get_or_insert_with(|| {
            self.gpu
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("doodle frame encoder"),
                })
        });
        let _pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("doodle clear"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &target.view,
                depth_slice: None,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            occlusion_query_set: None,
            timestamp_writes: None,
        });
    }

    fn wait_for_map(&self, slice: wgpu::BufferSlice<'_>) -> Result<(), CompositorError> {
        let (sender, receiver) = crossbeam_channel::bounded(1);
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        let deadline = Instant::now() + READBACK_TIMEOUT;
        loop {
            let _ = self.gpu.device.poll(wgpu::PollType::Poll);
            match receiver.try_recv() {
                Ok(result) => {
                    return result.map_err(|err| {
                        CompositorError::Device(format!("canvas readback failed: {err}"))
                    })
                }
                Err(TryRecvError::Empty) if Instant::now() < deadline => std::thread::yield_now(),
                Err(TryRecvError::Empty) => {
                    return Err(CompositorError::Device("timed out waiting for canvas readback".into()))
                }
                Err(TryRecvError::Disconnected) => {
                    return Err(CompositorError::Device("canvas readback was dropped".into()))
                }
            }
        }
    }
}

impl GraphicsContext for WgpuContext {
    fn compile_program(&mut self, vertex: &str, fragment: &str) -> Result<ProgramId, CompileError> {
        let lowered = lower::lower_program(vertex, fragment)?;
        let mut next = self.next_id;
        let (program, slots) = ProgramObject::compile(&self.gpu, lowered, CANVAS_FORMAT, &mut || {
            let location = UniformLocation(next);
            next += 1;
            location
        })?;
        self.next_id = next;
        let id = ProgramId(self.next_id());
        for (location, slot) in slots {
            self.locations.insert(location, (id, slot));
        }
        self.programs.insert(id, program);
        Ok(id)
    }

    fn active_uniforms(&self, program: ProgramId) -> Vec<ActiveUniform> {
        self.programs
            .get(&program)
            .map(|program| program.active.clone())
            .unwrap_or_default()
    }

    fn upload_vertices(&mut self, program: ProgramId, vertices: &[f32]) -> Result<(), CompositorError> {
        let record = self.programs.get_mut(&program).ok_or(CompositorError::UnknownHandle {
            kind: "program",
            id: program.0,
        })?;
        record.upload_vertices(&self.gpu.device, vertices);
        Ok(())
    }

    fn use_program(&mut self, program: Option<ProgramId>) {
        self.program = program;
    }

    fn delete_program(&mut self, program: ProgramId) {
        if self.programs.remove(&program).is_some() {
            self.locations.retain(|_, (owner, _)| *owner != program);
        }
        if self.program == Some(program) {
            self.program = None;
        }
    }

    fn set_uniform(&mut self, location: UniformLocation, value: &UniformValue) -> Result<(), CompositorError> {
        let (program, slot) = *self.locations.get(&location).ok_or(CompositorError::UnknownHandle {
            kind: "uniform location",
            id: location.0,
        })?;
        let record = self.programs.get_mut(&program).ok_or(CompositorError::UnknownHandle {
            kind: "program",
            id: program.0,
        })?;
        record.write_uniform(slot, value)
    }

    fn create_texture(&mut self) -> Result<TextureId, CompositorError> {
        let id = TextureId(self.next_id());
        self.textures.insert(id, TextureObject::new());
        Ok(id)
    }

    fn delete_texture(&mut self, texture: TextureId) {
        self.textures.remove(&texture);
        self.units.retain(|_, bound| *bound != texture);
    }

    fn bind_texture(&mut self, unit: u32, texture: Option<TextureId>) {
        match texture {
            Some(texture) => self.units.insert(unit, texture),
            None => self.units.remove(&unit),
        };
    }

    fn texture_parameters(&mut self, texture: TextureId, parameters: &TextureParameters) {
        if let Some(record) = self.textures.get_mut(&texture) {
            record.parameters = *parameters;
        }
    }

    fn tex_image(&mut self, texture: TextureId, image: &TexImage<'_>) -> Result<(), CompositorError> {
        let format = storage_format(image.format, image.ty)?;
        if image.width == 0 || image.height == 0 {
            return Err(CompositorError::InvalidUpload("texture size must be non-zero".into()));
        }
        let limit = self.gpu.max_texture_dimension;
        if image.width > limit || image.height > limit {
            return Err(CompositorError::allocation(
                "texture",
                format!("{}x{} exceeds the {limit} pixel limit", image.width, image.height),
            ));
        }
        if let Some(data) = image.data {
            check_length(image.format, image.ty, image.width, image.height, data)?;
        }
        self.submit_pending();
        let record = self.textures.get_mut(&texture).ok_or(CompositorError::UnknownHandle {
            kind: "texture",
            id: texture.0,
        })?;
        if image.level == 0 {
            record.allocate(&self.gpu.device, format, image.width, image.height, 1);
        } else if !record.has_level(image.level) {
            tracing::debug!(level = image.level, "mip level not allocated; ignoring upload");
            return Ok(());
        }
        if let Some(data) = image.data {
            let pixels = expand_pixels(image.format, data);
            record.write(&self.gpu.queue, image.level, 0, 0, image.width, image.height, &pixels);
        }
        Ok(())
    }

    fn tex_sub_image(&mut self, texture: TextureId, image: &TexSubImage<'_>) -> Result<(), CompositorError> {
        let format = storage_format(image.format, image.ty)?;
        check_length(image.format, image.ty, image.width, image.height, image.data)?;
        self.submit_pending();
        let record = self.textures.get_mut(&texture).ok_or(CompositorError::UnknownHandle {
            kind: "texture",
            id: texture.0,
        })?;
        if !record.has_level(image.level) || record.format != format {
            return Err(CompositorError::InvalidUpload(
                "sub-image update needs storage of the same format".into(),
            ));
        }
        let level_width = (record.width >> image.level).max(1);
        let level_height = (record.height >> image.level).max(1);
        if exceeds(image.x, image.width, level_width) || exceeds(image.y, image.height, level_height) {
            return Err(CompositorError::InvalidUpload(format!(
                "{}x{} update at ({}, {}) exceeds {level_width}x{level_height} storage",
                image.width, image.height, image.x, image.y
            )));
        }
        let pixels = expand_pixels(image.format, image.data);
        record.write(
            &self.gpu.queue,
            image.level,
            image.x,
            image.y,
            image.width,
            image.height,
            &pixels,
        );
        Ok(())
    }

    fn generate_mipmap(&mut self, texture: TextureId) {
        self.submit_pending();
        if let Some(record) = self.textures.get_mut(&texture) {
            record.generate_mipmaps(&self.gpu.device, &self.gpu.queue);
        }
    }

    fn create_framebuffer(&mut self, texture: TextureId) -> Result<FramebufferId, CompositorError> {
        if !self.textures.contains_key(&texture) {
            return Err(CompositorError::UnknownHandle {
                kind: "texture",
                id: texture.0,
            });
        }
        let id = FramebufferId(self.next_id());
        self.framebuffers.insert(id, texture);
        Ok(id)
    }

    fn delete_framebuffer(&mut self, framebuffer: FramebufferId) {
        self.framebuffers.remove(&framebuffer);
        if self.target == Some(framebuffer) {
            self.target = None;
        }
    }

    fn bind_framebuffer(&mut self, framebuffer: Option<FramebufferId>) {
        self.target = framebuffer;
    }

    fn viewport(&mut self, x: u32, y: u32, width: u32, height: u32) {
        self.viewport = (x, y, width, height);
    }

    fn clear(&mut self) {
        if let Some(target) = self.resolve_target() {
            self.record_clear(&target);
        }
    }

    fn draw_arrays(&mut self, first: u32, count: u32) {
        let Some(program_id) = self.program else {
            return;
        };
        let Some(target) = self.resolve_target() else {
            return;
        };
        let (x, y, width, height) = self.viewport;
        if x >= target.width || y >= target.height {
            return;
        }
        let width = width.min(target.width - x);
        let height = height.min(target.height - y);
        if width == 0 || height == 0 {
            return;
        }

        let units = match self.programs.get(&program_id) {
            Some(program) => program.sampler_units.clone(),
            None => return,
        };
        let bound: Vec<(wgpu::TextureView, wgpu::Sampler)> = units
            .iter()
            .map(|unit| self.sampled(*unit, target.texture))
            .collect();

        let Some(program) = self.programs.get_mut(&program_id) else {
            return;
        };
        let Some((vertex_buffer, vertex_count)) = program.vertices.clone() else {
            return;
        };
        let end = first.saturating_add(count).min(vertex_count);
        if first >= end {
            return;
        }
        let Some(pipeline) = program.pipeline(&self.gpu, target.format) else {
            return;
        };

        let device = &self.gpu.device;
        let entries: Vec<wgpu::BindGroupEntry<'_>> = bound
            .iter()
            .enumerate()
            .flat_map(|(slot, (view, sampler))| {
                let binding = slot as u32 * 2;
                [
                    wgpu::BindGroupEntry {
                        binding,
                        resource: wgpu::BindingResource::TextureView(view),
                    },
                    wgpu::BindGroupEntry {
                        binding: binding + 1,
                        resource: wgpu::BindingResource::Sampler(sampler),
                    },
                ]
            })
            .collect();
        let sampler_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("doodle samplers"),
            layout: &program.sampler_layout,
            entries: &entries,
        });
        let uniform_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("doodle uniforms"),
            layout: &program.uniform_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: program.uniform_buffer.as_entire_binding(),
            }],
        });
        let staging = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("doodle uniform staging"),
            contents: &program.shadow,
            usage: wgpu::BufferUsages::COPY_SRC,
        });

        let encoder = self.encoder.get_or_insert_with(|| {
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("doodle frame encoder"),
            })
        });
        encoder.copy_buffer_to_buffer(
            &staging,
            0,
            &program.uniform_buffer,
            0,
            program.shadow.len() as u64,
        );
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("doodle draw"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &target.view,
                depth_slice: None,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Load,
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            occlusion_query_set: None,
            timestamp_writes: None,
        });
        // Clip space is flipped in the vertex stage, so GL's bottom-left
        // viewport origin maps directly onto texture rows.
        pass.set_viewport(x as f32, y as f32, width as f32, height as f32, 0.0, 1.0);
        pass.set_pipeline(&pipeline);
        pass.set_bind_group(0, &uniform_group, &[]);
        pass.set_bind_group(1, &sampler_group, &[]);
        pass.set_vertex_buffer(0, vertex_buffer.slice(..));
        pass.draw(first..end, 0..1);
    }

    fn resize_canvas(&mut self, width: u32, height: u32) -> Result<(), CompositorError> {
        let limit = self.gpu.max_texture_dimension;
        if width > limit || height > limit {
            return Err(CompositorError::allocation(
                "canvas",
                format!("{width}x{height} exceeds the {limit} pixel limit"),
            ));
        }
        self.submit_pending();
        // A fresh texture starts zeroed.
        self.canvas = TextureObject::new();
        if width > 0 && height > 0 {
            self.canvas
                .allocate(&self.gpu.device, CANVAS_FORMAT, width, height, 1);
        }
        Ok(())
    }

    fn canvas_size(&self) -> (u32, u32) {
        (self.canvas.width, self.canvas.height)
    }

    fn read_pixels(&mut self, x: u32, y: u32, width: u32, height: u32) -> Result<Vec<u8>, CompositorError> {
        let (canvas_width, canvas_height) = self.canvas_size();
        if exceeds(x, width, canvas_width) || exceeds(y, height, canvas_height) {
            return Err(CompositorError::Device(format!(
                "read of {width}x{height} at ({x}, {y}) outside {canvas_width}x{canvas_height} canvas"
            )));
        }
        let Some(canvas) = self.canvas.texture.clone().filter(|_| width > 0 && height > 0) else {
            return Ok(Vec::new());
        };
        self.submit_pending();

        let row_bytes = width * 4;
        let padded_row = row_bytes.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
            * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let buffer = self.gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("doodle readback"),
            size: u64::from(padded_row) * u64::from(height),
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("doodle readback encoder"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &canvas,
                mip_level: 0,
                origin: wgpu::Origin3d { x, y, z: 0 },
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.gpu.queue.submit(Some(encoder.finish()));

        let slice = buffer.slice(..);
        self.wait_for_map(slice)?;
        let mut pixels = Vec::with_capacity(row_bytes as usize * height as usize);
        {
            let mapped = slice.get_mapped_range();
            for row in mapped.chunks(padded_row as usize) {
                pixels.extend_from_slice(&row[..row_bytes as usize]);
            }
        }
        buffer.unmap();
        Ok(pixels)
    }

    fn supports(&mut self, capability: Capability) -> bool {
        let available = match capability {
            Capability::FloatLinear => self.gpu.float32_filterable,
            Capability::FloatTextures | Capability::HalfFloatTextures | Capability::HalfFloatLinear => true,
        };
        self.report.check(capability, available)
    }

    fn flush(&mut self) -> Result<(), CompositorError> {
        self.submit_pending();
        let _ = self.gpu.device.poll(wgpu::PollType::Poll);
        Ok(())
    }
}
