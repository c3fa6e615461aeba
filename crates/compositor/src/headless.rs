//! A recording [`GraphicsContext`] that needs no GPU.
//!
//! Uploads, bindings, uniform writes and draws go to a log unless recording
//! is switched off. Textures keep their bytes, and draws into the canvas
//! fill the viewport with a per-program paint colour so frame composition
//! can be checked pixel by pixel. Used by the test suite and by the
//! `headless` backend of the binary for dry runs.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::context::{
    ActiveUniform, CapabilityReport, FramebufferId, GraphicsContext, ProgramId, TexImage,
    TexSubImage, TextureId, UniformLocation,
};
use crate::error::{CompileError, CompositorError, ShaderStage};
use crate::glsl::{self, Qualifier};
use crate::texture::exceeds;
use crate::types::{Capability, PixelFormat, TextureParameters, UniformType};
use crate::uniforms::UniformValue;

/// One recorded context call.
#[derive(Clone, Debug, PartialEq)]
pub enum Call {
    Uniform {
        program: ProgramId,
        name: String,
        value: UniformValue,
    },
    BindTexture {
        unit: u32,
        texture: Option<TextureId>,
    },
    TexImage {
        texture: TextureId,
        level: u32,
        width: u32,
        height: u32,
        format: PixelFormat,
    },
    TexSubImage {
        texture: TextureId,
        level: u32,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },
    BindFramebuffer(Option<FramebufferId>),
    Viewport {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },
    Draw {
        program: Option<ProgramId>,
        target: Option<FramebufferId>,
        count: u32,
    },
}

/// State captured at the moment of a draw call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DrawRecord {
    pub program: Option<ProgramId>,
    pub target: Option<FramebufferId>,
    pub viewport: (u32, u32, u32, u32),
    /// Texture bound to each unit, empty units omitted.
    pub textures: BTreeMap<u32, TextureId>,
}

#[derive(Debug)]
struct ProgramRecord {
    uniforms: Vec<ActiveUniform>,
}

#[derive(Debug)]
struct TextureRecord {
    width: u32,
    height: u32,
    texel_bytes: usize,
    data: Vec<u8>,
    mipmaps: u32,
}

pub struct HeadlessContext {
    calls: Vec<Call>,
    draws: Vec<DrawRecord>,
    next_id: u32,
    programs: HashMap<ProgramId, ProgramRecord>,
    locations: HashMap<UniformLocation, (ProgramId, String)>,
    textures: HashMap<TextureId, TextureRecord>,
    framebuffers: HashMap<FramebufferId, TextureId>,
    units: BTreeMap<u32, TextureId>,
    program: Option<ProgramId>,
    target: Option<FramebufferId>,
    viewport: (u32, u32, u32, u32),
    canvas: (u32, u32),
    pixels: Vec<u8>,
    paint: HashMap<ProgramId, [u8; 4]>,
    capabilities: HashSet<Capability>,
    report: CapabilityReport,
    fail_uniforms: bool,
    fail_textures: bool,
    starved: HashSet<TextureId>,
    recording: bool,
}

impl Default for HeadlessContext {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessContext {
    /// A context offering every optional capability.
    pub fn new() -> Self {
        Self::with_capabilities(&[
            Capability::FloatTextures,
            Capability::FloatLinear,
            Capability::HalfFloatTextures,
            Capability::HalfFloatLinear,
        ])
    }

    pub fn with_capabilities(capabilities: &[Capability]) -> Self {
        Self {
            calls: Vec::new(),
            draws: Vec::new(),
            next_id: 1,
            programs: HashMap::new(),
            locations: HashMap::new(),
            textures: HashMap::new(),
            framebuffers: HashMap::new(),
            units: BTreeMap::new(),
            program: None,
            target: None,
            viewport: (0, 0, 0, 0),
            canvas: (0, 0),
            pixels: Vec::new(),
            paint: HashMap::new(),
            capabilities: capabilities.iter().copied().collect(),
            report: CapabilityReport::default(),
            fail_uniforms: false,
            fail_textures: false,
            starved: HashSet::new(),
            recording: true,
        }
    }

    /// Stops logging calls and draws. Pixels and resource state are kept,
    /// so long runs stay bounded in memory.
    pub fn without_recording(mut self) -> Self {
        self.recording = false;
        self
    }

    fn record(&mut self, call: Call) {
        if self.recording {
            self.calls.push(call);
        }
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn calls(&self) -> &[Call] {
        &self.calls
    }

    pub fn clear_calls(&mut self) {
        self.calls.clear();
        self.draws.clear();
    }

    pub fn draws(&self) -> &[DrawRecord] {
        &self.draws
    }

    /// Number of GPU writes to uniforms called `name`, across programs.
    pub fn uniform_writes(&self, name: &str) -> usize {
        self.calls
            .iter()
            .filter(|call| matches!(call, Call::Uniform { name: written, .. } if written == name))
            .count()
    }

    /// Most recent value written to a uniform called `name`.
    pub fn last_uniform(&self, name: &str) -> Option<UniformValue> {
        self.calls.iter().rev().find_map(|call| match call {
            Call::Uniform {
                name: written,
                value,
                ..
            } if written == name => Some(*value),
            _ => None,
        })
    }

    /// Most recent value written to `name` of one program.
    pub fn last_uniform_of(&self, program: ProgramId, name: &str) -> Option<UniformValue> {
        self.calls.iter().rev().find_map(|call| match call {
            Call::Uniform {
                program: owner,
                name: written,
                value,
            } if *owner == program && written == name => Some(*value),
            _ => None,
        })
    }

    pub fn fail_uniform_writes(&mut self, fail: bool) {
        self.fail_uniforms = fail;
    }

    pub fn fail_texture_allocation(&mut self, fail: bool) {
        self.fail_textures = fail;
    }

    /// Makes every later storage allocation for `texture` run out of memory.
    pub fn fail_texture_storage(&mut self, texture: TextureId) {
        self.starved.insert(texture);
    }

    /// Colour that draws of `program` into the canvas fill their viewport
    /// with. Programs without one leave the canvas untouched.
    pub fn set_paint(&mut self, program: ProgramId, rgba: [u8; 4]) {
        self.paint.insert(program, rgba);
    }

    pub fn texture_data(&self, texture: TextureId) -> Option<&[u8]> {
        self.textures.get(&texture).map(|record| record.data.as_slice())
    }

    pub fn texture_size(&self, texture: TextureId) -> Option<(u32, u32)> {
        self.textures
            .get(&texture)
            .map(|record| (record.width, record.height))
    }

    pub fn mipmap_generations(&self, texture: TextureId) -> u32 {
        self.textures
            .get(&texture)
            .map(|record| record.mipmaps)
            .unwrap_or(0)
    }

    pub fn live_programs(&self) -> usize {
        self.programs.len()
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    pub fn live_framebuffers(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn capability_reported(&self, capability: Capability) -> bool {
        self.report.reported(capability)
    }

    fn texture_mut(&mut self, texture: TextureId) -> Result<&mut TextureRecord, CompositorError> {
        self.textures
            .get_mut(&texture)
            .ok_or(CompositorError::UnknownHandle {
                kind: "texture",
                id: texture.0,
            })
    }

    fn paint_canvas(&mut self, rgba: [u8; 4]) {
        let (canvas_width, canvas_height) = self.canvas;
        let (x, y, width, height) = self.viewport;
        let x_end = x.saturating_add(width).min(canvas_width);
        let y_end = y.saturating_add(height).min(canvas_height);
        for row in y..y_end {
            for column in x..x_end {
                let offset = ((row * canvas_width + column) * 4) as usize;
                self.pixels[offset..offset + 4].copy_from_slice(&rgba);
            }
        }
    }
}

fn reflect_uniforms(sources: [&str; 2], next_location: &mut dyn FnMut() -> u32) -> Vec<ActiveUniform> {
    let mut seen = HashSet::new();
    let mut uniforms = Vec::new();
    for source in sources {
        for declaration in glsl::declarations(source) {
            if declaration.qualifier != Qualifier::Uniform {
                continue;
            }
            for declarator in declaration.names {
                if !seen.insert(declarator.name.clone()) {
                    continue;
                }
                let ty = if declarator.array.is_some() {
                    UniformType::Unsupported
                } else {
                    UniformType::from_glsl(&declaration.ty)
                };
                uniforms.push(ActiveUniform {
                    name: declarator.name,
                    ty,
                    location: UniformLocation(next_location()),
                });
            }
        }
    }
    uniforms
}

impl GraphicsContext for HeadlessContext {
    fn compile_program(&mut self, vertex: &str, fragment: &str) -> Result<ProgramId, CompileError> {
        if glsl::entry_point(vertex).is_none() {
            return Err(CompileError::new(ShaderStage::Vertex, "no 'void main()' defined"));
        }
        if glsl::entry_point(fragment).is_none() {
            return Err(CompileError::new(ShaderStage::Fragment, "no 'void main()' defined"));
        }
        let program = ProgramId(self.next_id());
        let mut next = self.next_id;
        let uniforms = reflect_uniforms([vertex, fragment], &mut || {
            let location = next;
            next += 1;
            location
        });
        self.next_id = next;
        for uniform in &uniforms {
            self.locations
                .insert(uniform.location, (program, uniform.name.clone()));
        }
        self.programs.insert(program, ProgramRecord { uniforms });
        Ok(program)
    }

    fn active_uniforms(&self, program: ProgramId) -> Vec<ActiveUniform> {
        self.programs
            .get(&program)
            .map(|record| record.uniforms.clone())
            .unwrap_or_default()
    }

    fn upload_vertices(&mut self, program: ProgramId, _vertices: &[f32]) -> Result<(), CompositorError> {
        if !self.programs.contains_key(&program) {
            return Err(CompositorError::UnknownHandle {
                kind: "program",
                id: program.0,
            });
        }
        Ok(())
    }

    fn use_program(&mut self, program: Option<ProgramId>) {
        self.program = program;
    }

    fn delete_program(&mut self, program: ProgramId) {
        if let Some(record) = self.programs.remove(&program) {
            for uniform in record.uniforms {
                self.locations.remove(&uniform.location);
            }
        }
        if self.program == Some(program) {
            self.program = None;
        }
    }

    fn set_uniform(&mut self, location: UniformLocation, value: &UniformValue) -> Result<(), CompositorError> {
        if self.fail_uniforms {
            return Err(CompositorError::Uniform("context lost".into()));
        }
        let (program, name) = self
            .locations
            .get(&location)
            .cloned()
            .ok_or(CompositorError::UnknownHandle {
                kind: "uniform location",
                id: location.0,
            })?;
        self.record(Call::Uniform {
            program,
            name,
            value: *value,
        });
        Ok(())
    }

    fn create_texture(&mut self) -> Result<TextureId, CompositorError> {
        if self.fail_textures {
            return Err(CompositorError::allocation("texture", "out of memory"));
        }
        let texture = TextureId(self.next_id());
        self.textures.insert(
            texture,
            TextureRecord {
                width: 0,
                height: 0,
                texel_bytes: 4,
                data: Vec::new(),
                mipmaps: 0,
            },
        );
        Ok(texture)
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
        self.record(Call::BindTexture { unit, texture });
    }

    fn texture_parameters(&mut self, _texture: TextureId, _parameters: &TextureParameters) {}

    fn tex_image(&mut self, texture: TextureId, image: &TexImage<'_>) -> Result<(), CompositorError> {
        let texel_bytes = image.format.channels() * image.ty.bytes();
        let expected = image.width as usize * image.height as usize * texel_bytes;
        if image.data.is_some_and(|data| data.len() != expected) {
            return Err(CompositorError::InvalidUpload(format!(
                "expected {expected} bytes of texel data"
            )));
        }
        if self.starved.contains(&texture) {
            return Err(CompositorError::allocation("texture storage", "out of memory"));
        }
        let record = self.texture_mut(texture)?;
        if image.level == 0 {
            record.width = image.width;
            record.height = image.height;
            record.texel_bytes = texel_bytes;
            record.data = image
                .data
                .map(<[u8]>::to_vec)
                .unwrap_or_else(|| vec![0; expected]);
        }
        self.record(Call::TexImage {
            texture,
            level: image.level,
            width: image.width,
            height: image.height,
            format: image.format,
        });
        Ok(())
    }

    fn tex_sub_image(&mut self, texture: TextureId, image: &TexSubImage<'_>) -> Result<(), CompositorError> {
        let record = self.texture_mut(texture)?;
        if exceeds(image.x, image.width, record.width) || exceeds(image.y, image.height, record.height) {
            return Err(CompositorError::InvalidUpload(
                "sub-image outside texture storage".into(),
            ));
        }
        if image.level == 0 {
            let stride = record.width as usize * record.texel_bytes;
            let row_bytes = image.width as usize * record.texel_bytes;
            for (row, chunk) in image.data.chunks_exact(row_bytes).enumerate() {
                let start = (image.y as usize + row) * stride + image.x as usize * record.texel_bytes;
                record.data[start..start + row_bytes].copy_from_slice(chunk);
            }
        }
        self.record(Call::TexSubImage {
            texture,
            level: image.level,
            x: image.x,
            y: image.y,
            width: image.width,
            height: image.height,
        });
        Ok(())
    }

    fn generate_mipmap(&mut self, texture: TextureId) {
        if let Some(record) = self.textures.get_mut(&texture) {
            record.mipmaps += 1;
        }
    }

    fn create_framebuffer(&mut self, texture: TextureId) -> Result<FramebufferId, CompositorError> {
        if !self.textures.contains_key(&texture) {
            return Err(CompositorError::UnknownHandle {
                kind: "texture",
                id: texture.0,
            });
        }
        let framebuffer = FramebufferId(self.next_id());
        self.framebuffers.insert(framebuffer, texture);
        Ok(framebuffer)
    }

    fn delete_framebuffer(&mut self, framebuffer: FramebufferId) {
        self.framebuffers.remove(&framebuffer);
        if self.target == Some(framebuffer) {
            self.target = None;
        }
    }

    fn bind_framebuffer(&mut self, framebuffer: Option<FramebufferId>) {
        self.target = framebuffer;
        self.record(Call::BindFramebuffer(framebuffer));
    }

    fn viewport(&mut self, x: u32, y: u32, width: u32, height: u32) {
        self.viewport = (x, y, width, height);
        self.record(Call::Viewport {
            x,
            y,
            width,
            height,
        });
    }

    fn clear(&mut self) {
        match self.target {
            None => self.pixels.fill(0),
            Some(framebuffer) => {
                if let Some(texture) = self.framebuffers.get(&framebuffer).copied() {
                    if let Some(record) = self.textures.get_mut(&texture) {
                        record.data.fill(0);
                    }
                }
            }
        }
    }

    fn draw_arrays(&mut self, _first: u32, count: u32) {
        if self.recording {
            self.draws.push(DrawRecord {
                program: self.program,
                target: self.target,
                viewport: self.viewport,
                textures: self.units.clone(),
            });
        }
        if self.target.is_none() {
            if let Some(rgba) = self.program.and_then(|program| self.paint.get(&program).copied()) {
                self.paint_canvas(rgba);
            }
        }
        self.record(Call::Draw {
            program: self.program,
            target: self.target,
            count,
        });
    }

    fn resize_canvas(&mut self, width: u32, height: u32) -> Result<(), CompositorError> {
        self.canvas = (width, height);
        self.pixels = vec![0; width as usize * height as usize * 4];
        Ok(())
    }

    fn canvas_size(&self) -> (u32, u32) {
        self.canvas
    }

    fn read_pixels(&mut self, x: u32, y: u32, width: u32, height: u32) -> Result<Vec<u8>, CompositorError> {
        let (canvas_width, canvas_height) = self.canvas;
        if exceeds(x, width, canvas_width) || exceeds(y, height, canvas_height) {
            return Err(CompositorError::Device(format!(
                "read of {width}x{height} at ({x}, {y}) outside {canvas_width}x{canvas_height} canvas"
            )));
        }
        let mut out = Vec::with_capacity(width as usize * height as usize * 4);
        for row in y..y + height {
            let start = ((row * canvas_width + x) * 4) as usize;
            out.extend_from_slice(&self.pixels[start..start + width as usize * 4]);
        }
        Ok(out)
    }

    fn supports(&mut self, capability: Capability) -> bool {
        let available = self.capabilities.contains(&capability);
        self.report.check(capability, available)
    }

    fn flush(&mut self) -> Result<(), CompositorError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::DEFAULT_VERTEX_SHADER;
    use crate::types::PixelType;

    #[test]
    fn missing_entry_point_fails_compilation() {
        let mut gl = HeadlessContext::new();
        let err = gl
            .compile_program(DEFAULT_VERTEX_SHADER, "void mainImage() {}")
            .unwrap_err();
        assert_eq!(err.stage, ShaderStage::Fragment);
        assert_eq!(gl.live_programs(), 0);
    }

    #[test]
    fn uniforms_are_reflected_once_with_unique_locations() {
        let mut gl = HeadlessContext::new();
        let a = gl
            .compile_program(DEFAULT_VERTEX_SHADER, "uniform float t; uniform vec2 r[2];\nvoid main() {}")
            .unwrap();
        let b = gl
            .compile_program("uniform float t;\nvoid main() {}", "uniform float t;\nvoid main() {}")
            .unwrap();
        let first = gl.active_uniforms(a);
        assert_eq!(first.len(), 2);
        assert_eq!(first[1].ty, UniformType::Unsupported);
        let second = gl.active_uniforms(b);
        assert_eq!(second.len(), 1);
        assert_ne!(first[0].location, second[0].location);
    }

    #[test]
    fn canvas_draws_fill_the_viewport() {
        let mut gl = HeadlessContext::new();
        let program = gl.compile_program(DEFAULT_VERTEX_SHADER, "void main() {}").unwrap();
        gl.set_paint(program, [1, 2, 3, 4]);
        gl.resize_canvas(4, 4).unwrap();
        gl.bind_framebuffer(None);
        gl.viewport(0, 0, 2, 1);
        gl.use_program(Some(program));
        gl.draw_arrays(0, 6);

        let bottom = gl.read_pixels(0, 0, 4, 1).unwrap();
        assert_eq!(&bottom[..8], &[1, 2, 3, 4, 1, 2, 3, 4]);
        assert_eq!(&bottom[8..], &[0; 8]);
        assert_eq!(gl.read_pixels(0, 1, 4, 1).unwrap(), vec![0; 16]);
        assert!(gl.read_pixels(0, 0, 5, 1).is_err());
    }

    #[test]
    fn sub_images_patch_stored_rows() {
        let mut gl = HeadlessContext::new();
        let texture = gl.create_texture().unwrap();
        gl.tex_image(
            texture,
            &TexImage {
                level: 0,
                format: PixelFormat::Luminance,
                ty: PixelType::UnsignedByte,
                width: 2,
                height: 2,
                data: None,
            },
        )
        .unwrap();
        gl.tex_sub_image(
            texture,
            &TexSubImage {
                level: 0,
                x: 1,
                y: 1,
                width: 1,
                height: 1,
                format: PixelFormat::Luminance,
                ty: PixelType::UnsignedByte,
                data: &[7],
            },
        )
        .unwrap();
        assert_eq!(gl.texture_data(texture), Some(&[0, 0, 0, 7][..]));
    }

    #[test]
    fn unrecorded_context_still_paints() {
        let mut gl = HeadlessContext::new().without_recording();
        let program = gl.compile_program(DEFAULT_VERTEX_SHADER, "void main() {}").unwrap();
        gl.set_paint(program, [9, 8, 7, 6]);
        gl.resize_canvas(2, 1).unwrap();
        gl.bind_framebuffer(None);
        gl.viewport(0, 0, 2, 1);
        gl.use_program(Some(program));
        for _ in 0..100 {
            gl.draw_arrays(0, 6);
        }
        gl.flush().unwrap();

        assert!(gl.calls().is_empty());
        assert!(gl.draws().is_empty());
        assert_eq!(gl.read_pixels(0, 0, 2, 1).unwrap(), vec![9, 8, 7, 6, 9, 8, 7, 6]);
        assert_eq!(gl.live_programs(), 1);
    }

    #[test]
    fn regions_past_u32_max_are_rejected() {
        let mut gl = HeadlessContext::new();
        gl.resize_canvas(2, 2).unwrap();
        assert!(gl.read_pixels(u32::MAX, 0, 1, 1).is_err());
        assert!(gl.read_pixels(0, 1, 1, u32::MAX).is_err());

        let texture = gl.create_texture().unwrap();
        gl.tex_image(
            texture,
            &TexImage {
                level: 0,
                format: PixelFormat::Luminance,
                ty: PixelType::UnsignedByte,
                width: 2,
                height: 2,
                data: None,
            },
        )
        .unwrap();
        let far = TexSubImage {
            level: 0,
            x: u32::MAX,
            y: 0,
            width: 1,
            height: 1,
            format: PixelFormat::Luminance,
            ty: PixelType::UnsignedByte,
            data: &[7],
        };
        assert!(gl.tex_sub_image(texture, &far).is_err());
        assert_eq!(gl.texture_data(texture), Some(&[0, 0, 0, 0][..]));
    }
}
