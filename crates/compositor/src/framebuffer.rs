use crate::context::{FramebufferId, GraphicsContext, TexImage, TextureId};
use crate::error::CompositorError;
use crate::types::{Capability, FilterMode, PixelFormat, PixelType, TextureParameters};

/// Color storage used for offscreen node targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetFormat {
    Rgba8,
    Rgba16Float,
    Rgba32Float,
}

impl TargetFormat {
    /// Picks the most precise filterable format the context offers.
    pub fn select(gl: &mut dyn GraphicsContext) -> Self {
        if gl.supports(Capability::FloatTextures) && gl.supports(Capability::FloatLinear) {
            TargetFormat::Rgba32Float
        } else if gl.supports(Capability::HalfFloatTextures)
            && gl.supports(Capability::HalfFloatLinear)
        {
            TargetFormat::Rgba16Float
        } else {
            TargetFormat::Rgba8
        }
    }

    pub fn pixel_type(self) -> PixelType {
        match self {
            TargetFormat::Rgba8 => PixelType::UnsignedByte,
            TargetFormat::Rgba16Float => PixelType::HalfFloat,
            TargetFormat::Rgba32Float => PixelType::Float,
        }
    }
}

/// A framebuffer with one color texture attached.
#[derive(Debug)]
pub struct RenderTarget {
    framebuffer: FramebufferId,
    texture: TextureId,
    format: TargetFormat,
    size: Option<(u32, u32)>,
}

impl RenderTarget {
    pub fn new(gl: &mut dyn GraphicsContext, format: TargetFormat) -> Result<Self, CompositorError> {
        let texture = gl.create_texture()?;
        gl.texture_parameters(texture, &TextureParameters::clamped(FilterMode::Nearest));
        let framebuffer = match gl.create_framebuffer(texture) {
            Ok(framebuffer) => framebuffer,
            Err(err) => {
                gl.delete_texture(texture);
                return Err(err);
            }
        };
        Ok(Self {
            framebuffer,
            texture,
            format,
            size: None,
        })
    }

    pub fn framebuffer(&self) -> FramebufferId {
        self.framebuffer
    }

    pub fn texture(&self) -> TextureId {
        self.texture
    }

    pub fn size(&self) -> Option<(u32, u32)> {
        self.size
    }

    /// Selects this target and sets the viewport to its size.
    pub fn bind(&self, gl: &mut dyn GraphicsContext) {
        gl.bind_framebuffer(Some(self.framebuffer));
        let (width, height) = self.size.unwrap_or((0, 0));
        gl.viewport(0, 0, width, height);
    }

    /// Reallocates the color storage when the size changed. Returns whether
    /// anything happened.
    pub fn resize(
        &mut self,
        gl: &mut dyn GraphicsContext,
        width: u32,
        height: u32,
    ) -> Result<bool, CompositorError> {
        if self.size == Some((width, height)) {
            return Ok(false);
        }
        gl.tex_image(
            self.texture,
            &TexImage {
                level: 0,
                format: PixelFormat::Rgba,
                ty: self.format.pixel_type(),
                width,
                height,
                data: None,
            },
        )?;
        self.size = Some((width, height));
        Ok(true)
    }

    /// Switches to clamped linear filtering for reads by another draw.
    pub fn prepare_for_sampling(&self, gl: &mut dyn GraphicsContext) {
        gl.texture_parameters(self.texture, &TextureParameters::clamped(FilterMode::Linear));
    }

    pub fn dispose(self, gl: &mut dyn GraphicsContext) {
        gl.delete_framebuffer(self.framebuffer);
        gl.delete_texture(self.texture);
    }
}

/// Output storage of a child node: the target drawn this frame and, with
/// feedback enabled, the one holding the previous frame.
#[derive(Debug)]
pub struct FramebufferPair {
    current: RenderTarget,
    previous: Option<RenderTarget>,
}

impl FramebufferPair {
    pub fn new(gl: &mut dyn GraphicsContext, feedback: bool) -> Result<Self, CompositorError> {
        let format = TargetFormat::select(gl);
        if format == TargetFormat::Rgba8 {
            tracing::warn!("float render targets unavailable; node output limited to 8-bit");
        }
        let current = RenderTarget::new(gl, format)?;
        let previous = if feedback {
            match RenderTarget::new(gl, format) {
                Ok(target) => Some(target),
                Err(err) => {
                    current.dispose(gl);
                    return Err(err);
                }
            }
        } else {
            None
        };
        Ok(Self { current, previous })
    }

    pub fn has_feedback(&self) -> bool {
        self.previous.is_some()
    }

    pub fn current(&self) -> &RenderTarget {
        &self.current
    }

    pub fn previous(&self) -> Option<&RenderTarget> {
        self.previous.as_ref()
    }

    /// Exchanges roles so last frame's output becomes `previous`.
    pub fn swap(&mut self) {
        if let Some(previous) = self.previous.as_mut() {
            std::mem::swap(&mut self.current, previous);
        }
    }

    pub fn bind(&self, gl: &mut dyn GraphicsContext) {
        self.current.bind(gl);
    }

    pub fn resize(
        &mut self,
        gl: &mut dyn GraphicsContext,
        width: u32,
        height: u32,
    ) -> Result<(), CompositorError> {
        if let Some(previous) = self.previous.as_mut() {
            previous.resize(gl, width, height)?;
        }
        self.current.resize(gl, width, height)?;
        Ok(())
    }

    /// Swaps (with feedback), sizes both targets and binds the one to draw
    /// into.
    pub fn begin_frame(
        &mut self,
        gl: &mut dyn GraphicsContext,
        width: u32,
        height: u32,
    ) -> Result<(), CompositorError> {
        self.swap();
        self.resize(gl, width, height)?;
        self.bind(gl);
        Ok(())
    }

    pub fn dispose(self, gl: &mut dyn GraphicsContext) {
        self.current.dispose(gl);
        if let Some(previous) = self.previous {
            previous.dispose(gl);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{Call, HeadlessContext};

    #[test]
    fn resize_is_idempotent() {
        let mut gl = HeadlessContext::new();
        let mut target = RenderTarget::new(&mut gl, TargetFormat::Rgba8).unwrap();
        assert!(target.resize(&mut gl, 32, 16).unwrap());
        assert!(!target.resize(&mut gl, 32, 16).unwrap());
        assert!(target.resize(&mut gl, 16, 16).unwrap());
        let allocations = gl
            .calls()
            .iter()
            .filter(|call| matches!(call, Call::TexImage { .. }))
            .count();
        assert_eq!(allocations, 2);
    }

    #[test]
    fn bind_sets_viewport_to_target_size() {
        let mut gl = HeadlessContext::new();
        let mut target = RenderTarget::new(&mut gl, TargetFormat::Rgba8).unwrap();
        target.resize(&mut gl, 40, 30).unwrap();
        gl.clear_calls();
        target.bind(&mut gl);
        assert_eq!(
            gl.calls(),
            &[
                Call::BindFramebuffer(Some(target.framebuffer())),
                Call::Viewport {
                    x: 0,
                    y: 0,
                    width: 40,
                    height: 30
                }
            ]
        );
    }

    #[test]
    fn swap_alternates_previous_target() {
        let mut gl = HeadlessContext::new();
        let mut pair = FramebufferPair::new(&mut gl, true).unwrap();
        let first = pair.current().framebuffer();
        let second = pair.previous().unwrap().framebuffer();

        pair.begin_frame(&mut gl, 8, 8).unwrap();
        assert_eq!(pair.current().framebuffer(), second);
        assert_eq!(pair.previous().unwrap().framebuffer(), first);

        pair.begin_frame(&mut gl, 8, 8).unwrap();
        assert_eq!(pair.current().framebuffer(), first);
        assert_eq!(pair.previous().unwrap().framebuffer(), second);
    }

    #[test]
    fn format_degrades_with_capabilities() {
        let mut gl = HeadlessContext::with_capabilities(&[Capability::HalfFloatTextures, Capability::HalfFloatLinear]);
        assert_eq!(TargetFormat::select(&mut gl), TargetFormat::Rgba16Float);

        let mut bare = HeadlessContext::with_capabilities(&[]);
        assert_eq!(TargetFormat::select(&mut bare), TargetFormat::Rgba8);
        assert!(bare.capability_reported(Capability::FloatTextures));
    }

    #[test]
    fn dispose_releases_both_targets() {
        let mut gl = HeadlessContext::new();
        let pair = FramebufferPair::new(&mut gl, true).unwrap();
        assert_eq!(gl.live_framebuffers(), 2);
        pair.dispose(&mut gl);
        assert_eq!(gl.live_framebuffers(), 0);
        assert_eq!(gl.live_textures(), 0);
    }
}
