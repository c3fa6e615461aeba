//! Output regions multiplexed over the shared canvas.

use image::{imageops, RgbaImage};

use crate::compile::{MOUSE, MOUSE_DRAG, RESOLUTION};
use crate::context::GraphicsContext;
use crate::error::CompositorError;
use crate::program::ShaderProgram;
use crate::renderer::FrameContext;
use crate::uniforms::{UniformState, UniformValue};

/// Placement of a presentation target in viewport coordinates (logical
/// pixels, top-left origin).
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LayoutRect {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

impl LayoutRect {
    pub fn new(left: f32, top: f32, width: f32, height: f32) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    pub fn right(&self) -> f32 {
        self.left + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.top + self.height
    }

    /// Whether any part of the rectangle touches a `width`x`height`
    /// viewport.
    pub fn intersects_viewport(&self, width: f32, height: f32) -> bool {
        self.bottom() >= 0.0 && self.right() >= 0.0 && self.top <= height && self.left <= width
    }
}

/// Where a surface's frames end up.
pub trait Presentation {
    fn layout(&self) -> LayoutRect;
    /// Logical size of the visible viewport.
    fn viewport(&self) -> (f32, f32);
    /// Receives one rendered frame, top row first.
    fn present(&mut self, frame: &RgbaImage) -> Result<(), CompositorError>;
}

/// Pointer input in viewport coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PointerEvent {
    Down { x: f32, y: f32 },
    Move { x: f32, y: f32 },
    Up,
}

pub struct Surface {
    name: String,
    presentation: Box<dyn Presentation>,
    program: Option<ShaderProgram>,
    forced_width: Option<u32>,
    forced_height: Option<u32>,
    width: u32,
    height: u32,
    visible: bool,
    mouse: [f32; 2],
    drag: [f32; 4],
    pointer_down: bool,
    pointer_seen: bool,
}

impl Surface {
    pub fn new(name: impl Into<String>, presentation: Box<dyn Presentation>) -> Self {
        let mut surface = Self {
            name: name.into(),
            presentation,
            program: None,
            forced_width: None,
            forced_height: None,
            width: 0,
            height: 0,
            visible: false,
            mouse: [0.0; 2],
            drag: [0.0; 4],
            pointer_down: false,
            pointer_seen: false,
        };
        surface.tick();
        surface
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Overrides the layout size. Zero clears an override.
    pub fn force_size(&mut self, width: u32, height: u32) {
        self.forced_width = (width > 0).then_some(width);
        self.forced_height = (height > 0).then_some(height);
        self.tick();
    }

    /// Installs the root program, disposing any previous one.
    pub fn set_program(&mut self, gl: &mut dyn GraphicsContext, program: ShaderProgram) {
        if let Some(previous) = self.program.replace(program) {
            previous.dispose(gl);
        }
    }

    pub fn program(&self) -> Option<&ShaderProgram> {
        self.program.as_ref()
    }

    pub fn program_mut(&mut self) -> Option<&mut ShaderProgram> {
        self.program.as_mut()
    }

    /// Logical size.
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn mouse(&self) -> [f32; 2] {
        self.mouse
    }

    pub fn mouse_drag(&self) -> [f32; 4] {
        self.drag
    }

    /// Refreshes size and visibility from the layout and re-arms pointer
    /// move handling.
    pub fn tick(&mut self) {
        let layout = self.presentation.layout();
        let (viewport_width, viewport_height) = self.presentation.viewport();
        self.width = self
            .forced_width
            .unwrap_or_else(|| layout.width.max(0.0).floor() as u32);
        self.height = self
            .forced_height
            .unwrap_or_else(|| layout.height.max(0.0).floor() as u32);
        self.visible = layout.intersects_viewport(viewport_width, viewport_height);
        self.pointer_seen = false;
    }

    /// Applies a pointer event. Only the first move between two ticks is
    /// taken into account.
    pub fn pointer(&mut self, event: PointerEvent) {
        let layout = self.presentation.layout();
        let local = |x: f32, y: f32| {
            [
                x - layout.left.floor(),
                layout.height.floor() - (y - layout.top.floor()),
            ]
        };
        match event {
            PointerEvent::Down { x, y } => {
                let [x, y] = local(x, y);
                self.pointer_down = true;
                self.mouse = [x, y];
                self.drag = [x, y, x, y];
            }
            PointerEvent::Move { x, y } => {
                if self.pointer_seen {
                    return;
                }
                self.pointer_seen = true;
                let [x, y] = local(x, y);
                self.mouse = [x, y];
                if self.pointer_down {
                    self.drag[0] = x;
                    self.drag[1] = y;
                }
            }
            PointerEvent::Up => {
                self.pointer_down = false;
                if self.drag[2] > 0.0 {
                    self.drag[2] = -self.drag[2];
                }
                if self.drag[3] > 0.0 {
                    self.drag[3] = -self.drag[3];
                }
            }
        }
    }

    /// Resolution and pointer uniforms for a render at `width`x`height`
    /// physical pixels. Pointer values are scaled to the same space.
    pub fn uniforms(&self, width: u32, height: u32, pixel_ratio: f32) -> [UniformState; 3] {
        let [mx, my] = self.mouse;
        let [d0, d1, d2, d3] = self.drag;
        [
            UniformState::new(RESOLUTION, UniformValue::Vec2([width as f32, height as f32])),
            UniformState::new(MOUSE, UniformValue::Vec2([mx * pixel_ratio, my * pixel_ratio])),
            UniformState::new(
                MOUSE_DRAG,
                UniformValue::Vec4([
                    d0 * pixel_ratio,
                    d1 * pixel_ratio,
                    d2 * pixel_ratio,
                    d3 * pixel_ratio,
                ]),
            ),
        ]
    }

    /// Draws the program tree into the shared canvas and hands the
    /// bottom-left region it covers to the presentation, flipped upright.
    /// Returns `Ok(false)` when nothing was drawn.
    pub fn render(&mut self, frame: &mut FrameContext<'_>) -> Result<bool, CompositorError> {
        if !self.visible || self.program.is_none() {
            return Ok(false);
        }
        let (width, height) = frame.physical_size(self.width, self.height);
        if width == 0 || height == 0 {
            return Ok(false);
        }
        frame.request_size(self.width, self.height)?;

        let mut uniforms = frame.globals().uniforms().to_vec();
        uniforms.extend(self.uniforms(width, height, frame.pixel_ratio()));
        if let Some(program) = self.program.as_mut() {
            program.render(frame.gl(), width, height, &uniforms)?;
        }

        let pixels = frame.gl().read_pixels(0, 0, width, height)?;
        let image = RgbaImage::from_raw(width, height, pixels).ok_or_else(|| {
            CompositorError::Present(format!("canvas readback is not {width}x{height} RGBA"))
        })?;
        self.presentation.present(&imageops::flip_vertical(&image))?;
        Ok(true)
    }

    pub fn dispose(self, gl: &mut dyn GraphicsContext) {
        if let Some(program) = self.program {
            program.dispose(gl);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(LayoutRect);

    impl Presentation for Fixed {
        fn layout(&self) -> LayoutRect {
            self.0
        }

        fn viewport(&self) -> (f32, f32) {
            (320.0, 240.0)
        }

        fn present(&mut self, _frame: &RgbaImage) -> Result<(), CompositorError> {
            Ok(())
        }
    }

    fn surface(layout: LayoutRect) -> Surface {
        Surface::new("pointer", Box::new(Fixed(layout)))
    }

    #[test]
    fn pointer_coordinates_use_bottom_left_origin() {
        let mut surface = surface(LayoutRect::new(10.4, 20.6, 100.0, 50.8));
        surface.pointer(PointerEvent::Down { x: 15.0, y: 25.0 });
        assert_eq!(surface.mouse(), [5.0, 45.0]);
        assert_eq!(surface.mouse_drag(), [5.0, 45.0, 5.0, 45.0]);
    }

    #[test]
    fn drag_tracks_moves_and_goes_negative_on_release() {
        let mut surface = surface(LayoutRect::new(0.0, 0.0, 100.0, 100.0));
        surface.pointer(PointerEvent::Down { x: 10.0, y: 90.0 });
        surface.pointer(PointerEvent::Move { x: 30.0, y: 60.0 });
        assert_eq!(surface.mouse_drag(), [30.0, 40.0, 10.0, 10.0]);

        surface.pointer(PointerEvent::Up);
        assert_eq!(surface.mouse_drag(), [30.0, 40.0, -10.0, -10.0]);
        surface.pointer(PointerEvent::Up);
        assert_eq!(surface.mouse_drag(), [30.0, 40.0, -10.0, -10.0]);

        surface.tick();
        surface.pointer(PointerEvent::Move { x: 50.0, y: 50.0 });
        assert_eq!(surface.mouse(), [50.0, 50.0]);
        assert_eq!(surface.mouse_drag(), [30.0, 40.0, -10.0, -10.0]);
    }

    #[test]
    fn only_first_move_per_tick_is_applied() {
        let mut surface = surface(LayoutRect::new(0.0, 0.0, 100.0, 100.0));
        surface.tick();
        surface.pointer(PointerEvent::Move { x: 1.0, y: 99.0 });
        surface.pointer(PointerEvent::Move { x: 2.0, y: 98.0 });
        assert_eq!(surface.mouse(), [1.0, 1.0]);
        surface.tick();
        surface.pointer(PointerEvent::Move { x: 2.0, y: 98.0 });
        assert_eq!(surface.mouse(), [2.0, 2.0]);
    }

    #[test]
    fn visibility_follows_viewport_intersection() {
        assert!(surface(LayoutRect::new(-50.0, -50.0, 60.0, 60.0)).is_visible());
        assert!(surface(LayoutRect::new(320.0, 240.0, 10.0, 10.0)).is_visible());
        assert!(!surface(LayoutRect::new(0.0, 241.0, 10.0, 10.0)).is_visible());
        assert!(!surface(LayoutRect::new(-20.0, 0.0, 10.0, 10.0)).is_visible());
    }

    #[test]
    fn forced_size_takes_precedence_when_positive() {
        let mut surface = surface(LayoutRect::new(0.0, 0.0, 99.9, 50.2));
        assert_eq!(surface.size(), (99, 50));
        surface.force_size(300, 0);
        assert_eq!(surface.size(), (300, 50));
        surface.force_size(0, 0);
        assert_eq!(surface.size(), (99, 50));
    }

    #[test]
    fn pointer_uniforms_scale_with_pixel_ratio() {
        let mut surface = surface(LayoutRect::new(0.0, 0.0, 10.0, 10.0));
        surface.pointer(PointerEvent::Down { x: 2.0, y: 6.0 });
        let [resolution, mouse, drag] = surface.uniforms(20, 20, 2.0);
        assert_eq!(resolution.value, UniformValue::Vec2([20.0, 20.0]));
        assert_eq!(mouse.value, UniformValue::Vec2([4.0, 8.0]));
        assert_eq!(drag.name(true), "iMouse");
        assert_eq!(drag.value, UniformValue::Vec4([4.0, 8.0, 4.0, 8.0]));
    }
}
