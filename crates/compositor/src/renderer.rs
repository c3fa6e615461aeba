//! The shared animation loop.

use std::time::{Duration, Instant};

use crate::context::GraphicsContext;
use crate::error::CompositorError;
use crate::program::ShaderProgram;
use crate::surface::{PointerEvent, Surface};
use crate::uniforms::GlobalUniformState;

const STATS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RendererOptions {
    /// Physical pixels per logical pixel.
    pub pixel_ratio: f32,
}

impl Default for RendererOptions {
    fn default() -> Self {
        Self { pixel_ratio: 1.0 }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    /// No surface is registered; the loop is stopped.
    Idle,
    Rendered { surfaces: usize },
}

#[derive(Debug)]
struct CanvasState {
    /// Largest logical size requested so far.
    logical: (u32, u32),
    pixel_ratio: f32,
}

impl CanvasState {
    fn physical(&self, width: u32, height: u32) -> (u32, u32) {
        (
            (width as f32 * self.pixel_ratio).floor() as u32,
            (height as f32 * self.pixel_ratio).floor() as u32,
        )
    }
}

/// What a surface gets while it renders: the shared context, the canvas it
/// may ask to grow and the global uniforms of this tick.
pub struct FrameContext<'a> {
    gl: &'a mut dyn GraphicsContext,
    canvas: &'a mut CanvasState,
    globals: &'a GlobalUniformState,
}

impl FrameContext<'_> {
    pub fn gl(&mut self) -> &mut dyn GraphicsContext {
        &mut *self.gl
    }

    pub fn globals(&self) -> &GlobalUniformState {
        self.globals
    }

    pub fn pixel_ratio(&self) -> f32 {
        self.canvas.pixel_ratio
    }

    /// Physical size of a logical region.
    pub fn physical_size(&self, width: u32, height: u32) -> (u32, u32) {
        self.canvas.physical(width, height)
    }

    /// Grows the shared canvas to hold a logical `width`x`height` region.
    /// The canvas never shrinks.
    pub fn request_size(&mut self, width: u32, height: u32) -> Result<(), CompositorError> {
        let (logical_width, logical_height) = self.canvas.logical;
        self.canvas.logical = (logical_width.max(width), logical_height.max(height));
        let (wanted_width, wanted_height) =
            self.canvas.physical(self.canvas.logical.0, self.canvas.logical.1);
        let (current_width, current_height) = self.gl.canvas_size();
        let target = (current_width.max(wanted_width), current_height.max(wanted_height));
        if target != (current_width, current_height) {
            tracing::debug!(width = target.0, height = target.1, "growing shared canvas");
            self.gl.resize_canvas(target.0, target.1)?;
        }
        Ok(())
    }
}

struct Registered {
    id: SurfaceId,
    surface: Surface,
}

/// Owns the graphics context and drives every registered surface from one
/// loop.
pub struct Renderer<C: GraphicsContext> {
    context: C,
    canvas: CanvasState,
    globals: GlobalUniformState,
    surfaces: Vec<Registered>,
    next_surface: u64,
    running: bool,
    frames_since_report: u64,
    last_report: Option<Instant>,
}

impl<C: GraphicsContext> Renderer<C> {
    pub fn new(context: C, options: RendererOptions) -> Self {
        Self {
            context,
            canvas: CanvasState {
                logical: (0, 0),
                pixel_ratio: sanitize_ratio(options.pixel_ratio),
            },
            globals: GlobalUniformState::new(),
            surfaces: Vec::new(),
            next_surface: 0,
            running: false,
            frames_since_report: 0,
            last_report: None,
        }
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut C {
        &mut self.context
    }

    pub fn globals(&self) -> &GlobalUniformState {
        &self.globals
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Physical canvas size.
    pub fn canvas_size(&self) -> (u32, u32) {
        self.context.canvas_size()
    }

    pub fn pixel_ratio(&self) -> f32 {
        self.canvas.pixel_ratio
    }

    pub fn set_pixel_ratio(&mut self, ratio: f32) {
        self.canvas.pixel_ratio = sanitize_ratio(ratio);
    }

    pub fn set_orientation(&mut self, alpha: f32, beta: f32, gamma: f32) {
        self.globals.set_orientation(alpha, beta, gamma);
    }

    /// Adds a surface and starts the loop if it was stopped. A (re)started
    /// loop begins with a zero delta.
    pub fn register_surface(&mut self, surface: Surface) -> SurfaceId {
        let id = SurfaceId(self.next_surface);
        self.next_surface += 1;
        tracing::info!(surface = surface.name(), "surface registered");
        self.surfaces.push(Registered { id, surface });
        if !self.running {
            self.running = true;
            self.globals.restart();
        }
        id
    }

    /// Detaches a surface without releasing its programs. The loop stops once
    /// no surface is left.
    pub fn unregister_surface(&mut self, id: SurfaceId) -> Option<Surface> {
        let index = self.surfaces.iter().position(|entry| entry.id == id)?;
        let surface = self.surfaces.remove(index).surface;
        tracing::info!(surface = surface.name(), "surface unregistered");
        if self.surfaces.is_empty() {
            self.running = false;
        }
        Some(surface)
    }

    /// Unregisters a surface and disposes its program tree.
    pub fn remove_surface(&mut self, id: SurfaceId) -> bool {
        match self.unregister_surface(id) {
            Some(surface) => {
                surface.dispose(&mut self.context);
                true
            }
            None => false,
        }
    }

    pub fn surface(&self, id: SurfaceId) -> Option<&Surface> {
        self.surfaces
            .iter()
            .find(|entry| entry.id == id)
            .map(|entry| &entry.surface)
    }

    pub fn surface_mut(&mut self, id: SurfaceId) -> Option<&mut Surface> {
        self.surfaces
            .iter_mut()
            .find(|entry| entry.id == id)
            .map(|entry| &mut entry.surface)
    }

    /// Installs the root program of a registered surface.
    pub fn set_program(&mut self, id: SurfaceId, program: ShaderProgram) -> Result<(), CompositorError> {
        let Some(entry) = self.surfaces.iter_mut().find(|entry| entry.id == id) else {
            program.dispose(&mut self.context);
            return Err(CompositorError::UnknownHandle {
                kind: "surface",
                id: id.0 as u32,
            });
        };
        entry.surface.set_program(&mut self.context, program);
        Ok(())
    }

    pub fn pointer(&mut self, id: SurfaceId, event: PointerEvent) {
        if let Some(surface) = self.surface_mut(id) {
            surface.pointer(event);
        }
    }

    /// Runs one animation frame. Failures of individual surfaces are logged
    /// and do not affect the others.
    pub fn tick(&mut self, now: Instant) -> Result<TickOutcome, CompositorError> {
        if !self.running || self.surfaces.is_empty() {
            self.running = false;
            return Ok(TickOutcome::Idle);
        }
        self.globals.advance(now);

        let mut rendered = 0;
        for entry in &mut self.surfaces {
            entry.surface.tick();
            let mut frame = FrameContext {
                gl: &mut self.context,
                canvas: &mut self.canvas,
                globals: &self.globals,
            };
            match entry.surface.render(&mut frame) {
                Ok(true) => rendered += 1,
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(surface = entry.surface.name(), error = %err, "surface failed to render");
                }
            }
        }
        self.context.flush()?;
        self.report_stats(now);
        Ok(TickOutcome::Rendered { surfaces: rendered })
    }

    fn report_stats(&mut self, now: Instant) {
        self.frames_since_report += 1;
        let last = *self.last_report.get_or_insert(now);
        let elapsed = now.saturating_duration_since(last);
        if elapsed >= STATS_INTERVAL {
            let fps = self.frames_since_report as f64 / elapsed.as_secs_f64();
            let (width, height) = self.context.canvas_size();
            tracing::debug!(
                fps = format_args!("{fps:.1}"),
                surfaces = self.surfaces.len(),
                canvas_width = width,
                canvas_height = height,
                time = self.globals.time(),
                "renderer stats"
            );
            self.frames_since_report = 0;
            self.last_report = Some(now);
        }
    }

    /// Tears down every surface on the current context and continues on
    /// `context` with fresh state. Returns the previous context.
    pub fn reset(&mut self, context: C) -> C {
        self.dispose_surfaces();
        let previous = std::mem::replace(&mut self.context, context);
        self.canvas.logical = (0, 0);
        self.globals = GlobalUniformState::new();
        self.frames_since_report = 0;
        self.last_report = None;
        tracing::info!("renderer reset");
        previous
    }

    /// Releases every surface and hands back the context.
    pub fn dispose(mut self) -> C {
        self.dispose_surfaces();
        self.context
    }

    fn dispose_surfaces(&mut self) {
        for entry in self.surfaces.drain(..) {
            entry.surface.dispose(&mut self.context);
        }
        self.running = false;
    }
}

fn sanitize_ratio(ratio: f32) -> f32 {
    if ratio.is_finite() && ratio > 0.0 {
        ratio
    } else {
        tracing::warn!(ratio, "invalid pixel ratio; using 1.0");
        1.0
    }
}
