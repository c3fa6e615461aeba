use std::cell::Cell;
use std::path::PathBuf;
use std::rc::Rc;

use compositor::{CompositorError, LayoutRect, Presentation};
use image::RgbaImage;

/// Writes every presented frame of one surface as `<name>-<index>.png`.
pub struct PngSequence {
    dir: PathBuf,
    name: String,
    layout: LayoutRect,
    viewport: (f32, f32),
    written: Rc<Cell<u32>>,
}

impl PngSequence {
    pub fn new(
        dir: PathBuf,
        name: &str,
        layout: LayoutRect,
        viewport: (f32, f32),
    ) -> (Self, Rc<Cell<u32>>) {
        let written = Rc::new(Cell::new(0));
        let sequence = Self {
            dir,
            name: name.to_string(),
            layout,
            viewport,
            written: Rc::clone(&written),
        };
        (sequence, written)
    }

    pub fn frame_path(&self, index: u32) -> PathBuf {
        self.dir.join(format!("{}-{index:05}.png", self.name))
    }
}

impl Presentation for PngSequence {
    fn layout(&self) -> LayoutRect {
        self.layout
    }

    fn viewport(&self) -> (f32, f32) {
        self.viewport
    }

    fn present(&mut self, frame: &RgbaImage) -> Result<(), CompositorError> {
        let index = self.written.get();
        let path = self.frame_path(index);
        frame
            .save(&path)
            .map_err(|err| CompositorError::Present(format!("{}: {err}", path.display())))?;
        self.written.set(index + 1);
        tracing::debug!(surface = %self.name, path = %path.display(), "frame written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_numbered_per_surface() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sequence, written) = PngSequence::new(
            dir.path().to_path_buf(),
            "main",
            LayoutRect::new(0.0, 0.0, 2.0, 2.0),
            (2.0, 2.0),
        );
        let frame = RgbaImage::from_pixel(2, 2, image::Rgba([10, 20, 30, 255]));
        sequence.present(&frame).unwrap();
        sequence.present(&frame).unwrap();

        assert_eq!(written.get(), 2);
        assert!(dir.path().join("main-00000.png").exists());
        let second = image::open(dir.path().join("main-00001.png")).unwrap().to_rgba8();
        assert_eq!(second.get_pixel(1, 1).0, [10, 20, 30, 255]);
    }
}
