//! Render-graph compositor for GLSL fragment shaders.
//!
//! A [`ShaderProgram`] is one node of a tree: children render into their own
//! offscreen targets first and are sampled by their parent through texture
//! units. Roots are attached to [`Surface`]s, which the [`Renderer`] drives
//! once per animation tick over a single shared canvas:
//!
//! ```text
//!   Renderer::tick ──▶ Surface::render ──▶ ShaderProgram::render (children first)
//!          │                  │                     │
//!          │                  │                     └─▶ UniformCache ─▶ GraphicsContext
//!          │                  └─▶ read_pixels ─▶ Presentation::present
//!          └─▶ GlobalUniformState (time, delta, frame, date, orientation)
//! ```
//!
//! All GPU access goes through the [`GraphicsContext`] trait. [`WgpuContext`]
//! renders on real hardware; [`headless::HeadlessContext`] records calls and
//! simulates enough state to test the graph without a device.

mod compile;
mod context;
mod error;
mod framebuffer;
pub(crate) mod glsl;
#[cfg(feature = "wgpu-backend")]
mod gpu;
pub mod headless;
mod program;
mod renderer;
mod sources;
mod surface;
mod texture;
mod types;
mod uniforms;

pub use compile::{
    prepare_fragment_source, uniform_declarations, UniformSpec, BASE_UNIFORMS,
    DEFAULT_VERTEX_SHADER, DEFAULT_VERTICES, FEEDBACK_UNIFORM,
};
pub use context::{
    ActiveUniform, CapabilityReport, FramebufferId, GraphicsContext, ProgramId, TexImage,
    TexSubImage, TextureId, UniformLocation,
};
pub use error::{CompileError, CompositorError, ShaderStage};
pub use framebuffer::{FramebufferPair, RenderTarget, TargetFormat};
#[cfg(feature = "wgpu-backend")]
pub use gpu::{GpuPowerPreference, WgpuContext, WgpuOptions};
pub use program::{NodeFuture, ProgramSource, ShaderProgram};
pub use renderer::{FrameContext, Renderer, RendererOptions, SurfaceId, TickOutcome};
pub use sources::{
    AudioTexture, ChannelFeed, FrameFeed, MediaElement, MediaInput, MediaOptions, MediaRegistry,
    MediaTexture, SourceFrame, SourceKind, SpectrumAnalyser, TextureSource, SPECTRUM_BINS,
};
pub use surface::{LayoutRect, PointerEvent, Presentation, Surface};
pub use texture::{
    floor_power_of_two, is_power_of_two, Texture, TextureUnitAllocator, TextureUpload,
};
pub use types::{
    Capability, FilterMode, PixelFormat, PixelType, TextureParameters, UniformType, WrapMode,
};
pub use uniforms::{GlobalUniformState, UniformCache, UniformState, UniformValue};
