//! The seam between the render graph and a concrete graphics API.
//!
//! `GraphicsContext` mirrors an immediate-mode GL API: texture
//! units are global binding slots, uniform writes land on whichever program
//! owns the location, and all coordinates use a bottom-left origin. Rows
//! returned by [`GraphicsContext::read_pixels`] are ordered bottom to top.

use std::collections::HashSet;

use crate::error::{CompileError, CompositorError};
use crate::types::{Capability, PixelFormat, PixelType, TextureParameters, UniformType};
use crate::uniforms::UniformValue;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgramId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FramebufferId(pub u32);

/// Location of one uniform. Locations are unique across every program of a
/// context, so a write never needs the owning program to be bound.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UniformLocation(pub u32);

/// A uniform reported as active after linking.
#[derive(Clone, Debug, PartialEq)]
pub struct ActiveUniform {
    pub name: String,
    pub ty: UniformType,
    pub location: UniformLocation,
}

/// Full (re)allocation of one mip level.
#[derive(Clone, Copy, Debug)]
pub struct TexImage<'a> {
    pub level: u32,
    pub format: PixelFormat,
    pub ty: PixelType,
    pub width: u32,
    pub height: u32,
    /// `None` allocates storage without defining its contents.
    pub data: Option<&'a [u8]>,
}

/// Update of a sub-rectangle inside existing storage.
#[derive(Clone, Copy, Debug)]
pub struct TexSubImage<'a> {
    pub level: u32,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub ty: PixelType,
    pub data: &'a [u8],
}

pub trait GraphicsContext {
    fn compile_program(&mut self, vertex: &str, fragment: &str) -> Result<ProgramId, CompileError>;
    fn active_uniforms(&self, program: ProgramId) -> Vec<ActiveUniform>;
    /// Sets the flat `[x0, y0, x1, y1, ...]` position stream for a program.
    fn upload_vertices(&mut self, program: ProgramId, vertices: &[f32])
        -> Result<(), CompositorError>;
    fn use_program(&mut self, program: Option<ProgramId>);
    fn delete_program(&mut self, program: ProgramId);

    /// One call is one GPU state write.
    fn set_uniform(
        &mut self,
        location: UniformLocation,
        value: &UniformValue,
    ) -> Result<(), CompositorError>;

    fn create_texture(&mut self) -> Result<TextureId, CompositorError>;
    fn delete_texture(&mut self, texture: TextureId);
    fn bind_texture(&mut self, unit: u32, texture: Option<TextureId>);
    fn texture_parameters(&mut self, texture: TextureId, parameters: &TextureParameters);
    fn tex_image(&mut self, texture: TextureId, image: &TexImage<'_>)
        -> Result<(), CompositorError>;
    fn tex_sub_image(
        &mut self,
        texture: TextureId,
        image: &TexSubImage<'_>,
    ) -> Result<(), CompositorError>;
    fn generate_mipmap(&mut self, texture: TextureId);

    fn create_framebuffer(&mut self, texture: TextureId) -> Result<FramebufferId, CompositorError>;
    fn delete_framebuffer(&mut self, framebuffer: FramebufferId);
    /// `None` selects the shared canvas.
    fn bind_framebuffer(&mut self, framebuffer: Option<FramebufferId>);
    fn viewport(&mut self, x: u32, y: u32, width: u32, height: u32);
    /// Clears the whole bound target to transparent black.
    fn clear(&mut self);
    fn draw_arrays(&mut self, first: u32, count: u32);

    fn resize_canvas(&mut self, width: u32, height: u32) -> Result<(), CompositorError>;
    fn canvas_size(&self) -> (u32, u32);
    /// RGBA8 pixels of a canvas region, bottom row first.
    fn read_pixels(&mut self, x: u32, y: u32, width: u32, height: u32)
        -> Result<Vec<u8>, CompositorError>;

    /// Reports whether an optional feature is available. Implementations
    /// emit a diagnostic the first time a missing capability is queried.
    fn supports(&mut self, capability: Capability) -> bool;
    /// Submits all recorded work.
    fn flush(&mut self) -> Result<(), CompositorError>;
}

/// Remembers which missing capabilities were already reported.
#[derive(Debug, Default)]
pub struct CapabilityReport {
    reported: HashSet<Capability>,
}

impl CapabilityReport {
    pub fn check(&mut self, capability: Capability, available: bool) -> bool {
        if !available && self.reported.insert(capability) {
            tracing::warn!(%capability, "graphics capability unavailable; feature disabled");
        }
        available
    }

    pub fn reported(&self, capability: Capability) -> bool {
        self.reported.contains(&capability)
    }
}
