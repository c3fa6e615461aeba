//! Texture sources a program samples besides its child nodes.
//!
//! Acquisition stays outside the engine: images decode on a worker thread,
//! video and camera frames arrive through a [`FrameFeed`], referenced
//! elements come from a [`MediaRegistry`], and audio spectra from a
//! [`SpectrumAnalyser`]. Each source pushes its own uniforms and uploads
//! during [`TextureSource::update`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::thread;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use image::RgbaImage;

use crate::context::GraphicsContext;
use crate::error::CompositorError;
use crate::texture::{Texture, TextureUpload};
use crate::types::{FilterMode, PixelFormat, TextureParameters, WrapMode};
use crate::uniforms::{UniformCache, UniformValue};

/// What a source gets to touch while its program is being updated.
pub struct SourceFrame<'a> {
    gl: &'a mut dyn GraphicsContext,
    uniforms: &'a mut UniformCache,
}

impl<'a> SourceFrame<'a> {
    pub fn new(gl: &'a mut dyn GraphicsContext, uniforms: &'a mut UniformCache) -> Self {
        Self { gl, uniforms }
    }

    /// Writes a uniform of the program being updated through its cache.
    pub fn set_uniform(&mut self, name: &str, value: UniformValue) -> Result<bool, CompositorError> {
        self.uniforms.write(self.gl, name, value)
    }

    pub fn gl(&mut self) -> &mut dyn GraphicsContext {
        self.gl
    }
}

pub trait TextureSource {
    /// Uniform name the source's texture unit is published under.
    fn name(&self) -> &str;
    /// Called once per frame before the owning program draws.
    fn update(&mut self, frame: &mut SourceFrame<'_>) -> Result<(), CompositorError>;
    fn dispose(self: Box<Self>, gl: &mut dyn GraphicsContext);
}

/// How a texture source string is acquired, decided once at setup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    Image,
    Video,
    Canvas,
    Camera,
    ElementRef,
}

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "gif", "bmp"];
const VIDEO_EXTENSIONS: [&str; 4] = ["mp4", "3gp", "webm", "ogv"];

impl SourceKind {
    /// Classifies a `src` string by extension. Anything that is neither an
    /// image nor a video file is treated as an element reference.
    pub fn classify(src: &str, camera: bool) -> Self {
        if camera {
            return SourceKind::Camera;
        }
        match media_extension(src) {
            Some(ext) if VIDEO_EXTENSIONS.contains(&ext.as_str()) => SourceKind::Video,
            Some(ext) if IMAGE_EXTENSIONS.contains(&ext.as_str()) => SourceKind::Image,
            _ => SourceKind::ElementRef,
        }
    }
}

fn media_extension(src: &str) -> Option<String> {
    let path = src.split('?').next().unwrap_or(src);
    let (stem, ext) = path.rsplit_once('.')?;
    let stem_ends_in_word = stem
        .chars()
        .last()
        .is_some_and(|c| c.is_alphanumeric() || c == '_');
    if !stem_ends_in_word || ext.is_empty() || ext.contains('/') {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Producer of frames for video-like sources.
pub trait FrameFeed: Send {
    /// Most recent frame produced since the last poll, if any.
    fn poll_frame(&mut self) -> Option<RgbaImage>;
}

/// Feed filled from another thread through a channel.
pub struct ChannelFeed {
    receiver: Receiver<RgbaImage>,
}

impl ChannelFeed {
    pub fn new() -> (Sender<RgbaImage>, Self) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        (sender, Self { receiver })
    }
}

impl FrameFeed for ChannelFeed {
    fn poll_frame(&mut self) -> Option<RgbaImage> {
        self.receiver.try_iter().last()
    }
}

/// Media that can be referenced by selector instead of by file.
pub enum MediaElement {
    Image(RgbaImage),
    Canvas(RgbaImage),
    Video(Box<dyn FrameFeed>),
}

/// Lookup table for element references, video feeds and the camera.
#[derive(Default)]
pub struct MediaRegistry {
    base_dir: PathBuf,
    elements: HashMap<String, MediaElement>,
    camera: Option<Box<dyn FrameFeed>>,
}

impl MediaRegistry {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Self::default()
        }
    }

    /// Registers media under a selector or a video `src` string.
    pub fn insert(&mut self, selector: impl Into<String>, element: MediaElement) {
        self.elements.insert(selector.into(), element);
    }

    pub fn set_camera(&mut self, feed: Box<dyn FrameFeed>) {
        self.camera = Some(feed);
    }

    /// Turns a `src` string into something a [`MediaTexture`] can poll.
    /// Emits a diagnostic and returns `None` when nothing can be selected.
    pub fn resolve(&mut self, src: &str, camera: bool) -> Option<MediaInput> {
        let kind = SourceKind::classify(src, camera);
        let input = match kind {
            SourceKind::Camera => self.camera.take().map(MediaInput::Camera),
            SourceKind::Image => Some(MediaInput::Image(self.base_dir.join(src))),
            SourceKind::Video | SourceKind::ElementRef | SourceKind::Canvas => {
                self.elements.remove(src).map(|element| match element {
                    MediaElement::Image(image) => MediaInput::Still(SourceKind::Image, image),
                    MediaElement::Canvas(image) => MediaInput::Still(SourceKind::Canvas, image),
                    MediaElement::Video(feed) => MediaInput::Video(feed),
                })
            }
        };
        if input.is_none() {
            tracing::warn!(src, ?kind, "no media could be selected for texture source");
        }
        input
    }
}

pub enum MediaInput {
    /// Image file decoded on a worker thread.
    Image(PathBuf),
    /// Already decoded pixels from an image or canvas element.
    Still(SourceKind, RgbaImage),
    Video(Box<dyn FrameFeed>),
    Camera(Box<dyn FrameFeed>),
}

impl MediaInput {
    pub fn kind(&self) -> SourceKind {
        match self {
            MediaInput::Image(_) => SourceKind::Image,
            MediaInput::Still(kind, _) => *kind,
            MediaInput::Video(_) => SourceKind::Video,
            MediaInput::Camera(_) => SourceKind::Camera,
        }
    }
}

/// Sampling and refresh options for a media texture.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MediaOptions {
    pub parameters: TextureParameters,
    /// Re-upload still images every frame instead of only rebinding.
    pub force_update: bool,
}

impl Default for MediaOptions {
    fn default() -> Self {
        Self {
            parameters: TextureParameters {
                wrap_s: WrapMode::Repeat,
                wrap_t: WrapMode::Repeat,
                min_filter: FilterMode::LinearMipmapLinear,
                mag_filter: FilterMode::Linear,
            },
            force_update: false,
        }
    }
}

enum MediaState {
    Loading {
        path: PathBuf,
        receiver: Receiver<Result<RgbaImage, String>>,
    },
    Still(RgbaImage),
    Feed(Box<dyn FrameFeed>),
    Failed,
}

/// Image, canvas, video or camera texture published as `<name>` (unit) and
/// `<name>_resolution`.
pub struct MediaTexture {
    name: String,
    kind: SourceKind,
    texture: Texture,
    parameters: TextureParameters,
    force_update: bool,
    resolution: [f32; 2],
    state: MediaState,
}

impl MediaTexture {
    pub fn new(
        gl: &mut dyn GraphicsContext,
        unit: u32,
        name: impl Into<String>,
        input: MediaInput,
        options: MediaOptions,
    ) -> Result<Self, CompositorError> {
        let kind = input.kind();
        let mut texture = Texture::new(gl, unit)?;
        let mut parameters = options.parameters;
        let state = match input {
            MediaInput::Image(path) => MediaState::Loading {
                receiver: spawn_image_load(path.clone()),
                path,
            },
            MediaInput::Still(_, image) => MediaState::Still(image),
            MediaInput::Video(feed) | MediaInput::Camera(feed) => {
                parameters = TextureParameters::clamped(FilterMode::Linear);
                texture.set_parameters(gl, parameters);
                MediaState::Feed(feed)
            }
        };

        let mut media = Self {
            name: name.into(),
            kind,
            texture,
            parameters,
            force_update: options.force_update,
            resolution: [0.0, 0.0],
            state,
        };
        if let MediaState::Still(image) = &media.state {
            let image = image.clone();
            media.install(gl, &image)?;
        }
        Ok(media)
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn unit(&self) -> u32 {
        self.texture.unit()
    }

    pub fn resolution(&self) -> [f32; 2] {
        self.resolution
    }

    pub fn is_loading(&self) -> bool {
        matches!(self.state, MediaState::Loading { .. })
    }

    fn install(&mut self, gl: &mut dyn GraphicsContext, image: &RgbaImage) -> Result<(), CompositorError> {
        let (width, height) = image.dimensions();
        self.resolution = [width as f32, height as f32];
        self.texture.set_parameters(gl, self.parameters);
        self.texture.upload(gl, &TextureUpload::pixels(image))?;
        Ok(())
    }

    fn poll_load(&mut self, gl: &mut dyn GraphicsContext) -> Result<(), CompositorError> {
        let MediaState::Loading { path, receiver } = &self.state else {
            return Ok(());
        };
        let outcome = match receiver.try_recv() {
            Ok(outcome) => outcome,
            Err(TryRecvError::Empty) => return Ok(()),
            Err(TryRecvError::Disconnected) => Err("image loader exited without a result".into()),
        };
        match outcome {
            Ok(image) => {
                self.install(gl, &image)?;
                self.state = MediaState::Still(image);
            }
            Err(reason) => {
                tracing::warn!(src = %path.display(), %reason, "failed loading texture source");
                self.state = MediaState::Failed;
            }
        }
        Ok(())
    }
}

fn spawn_image_load(path: PathBuf) -> Receiver<Result<RgbaImage, String>> {
    let (sender, receiver) = crossbeam_channel::bounded(1);
    thread::spawn(move || {
        let result = load_image(&path);
        let _ = sender.send(result);
    });
    receiver
}

fn load_image(path: &Path) -> Result<RgbaImage, String> {
    image::open(path)
        .map(|image| image.to_rgba8())
        .map_err(|err| err.to_string())
}

impl TextureSource for MediaTexture {
    fn name(&self) -> &str {
        &self.name
    }

    fn update(&mut self, frame: &mut SourceFrame<'_>) -> Result<(), CompositorError> {
        self.poll_load(frame.gl())?;

        let unit = self.texture.unit() as i32;
        frame.set_uniform(&self.name, UniformValue::Int(unit))?;
        let resolution_name = format!("{}_resolution", self.name);
        frame.set_uniform(&resolution_name, UniformValue::Vec2(self.resolution))?;

        let fresh = match &mut self.state {
            MediaState::Feed(feed) => feed.poll_frame(),
            MediaState::Still(image) if self.force_update => Some(image.clone()),
            _ => None,
        };
        match fresh {
            Some(image) => {
                let (width, height) = image.dimensions();
                self.resolution = [width as f32, height as f32];
                self.texture.upload(frame.gl(), &TextureUpload::pixels(&image))?;
            }
            None => self.texture.shallow(frame.gl()),
        }
        Ok(())
    }

    fn dispose(self: Box<Self>, gl: &mut dyn GraphicsContext) {
        self.texture.dispose(gl);
    }
}

/// Number of frequency bins and waveform samples per audio frame.
pub const SPECTRUM_BINS: usize = 512;

/// Supplies byte spectra for an [`AudioTexture`].
pub trait SpectrumAnalyser: Send {
    /// False while paused, ended or not yet buffered.
    fn is_active(&self) -> bool;
    fn frequency_data(&mut self, out: &mut [u8]);
    fn waveform_data(&mut self, out: &mut [u8]);
}

/// 512x2 luminance texture: row 0 holds frequency magnitudes, row 1 the
/// waveform.
pub struct AudioTexture {
    name: String,
    texture: Texture,
    analyser: Box<dyn SpectrumAnalyser>,
    frequency: Vec<u8>,
    waveform: Vec<u8>,
}

impl AudioTexture {
    pub fn new(
        gl: &mut dyn GraphicsContext,
        unit: u32,
        name: impl Into<String>,
        analyser: Box<dyn SpectrumAnalyser>,
    ) -> Result<Self, CompositorError> {
        let mut texture = Texture::with_upload(
            gl,
            unit,
            &TextureUpload {
                internal_format: PixelFormat::Luminance,
                format: PixelFormat::Luminance,
                width: SPECTRUM_BINS as u32,
                height: 2,
                buffer: None,
                ..TextureUpload::default()
            },
        )?;
        texture.set_parameters(
            gl,
            TextureParameters {
                wrap_s: WrapMode::ClampToEdge,
                wrap_t: WrapMode::ClampToEdge,
                min_filter: FilterMode::Nearest,
                mag_filter: FilterMode::Linear,
            },
        );
        Ok(Self {
            name: name.into(),
            texture,
            analyser,
            frequency: vec![0; SPECTRUM_BINS],
            waveform: vec![0; SPECTRUM_BINS],
        })
    }

    fn upload_row(&mut self, gl: &mut dyn GraphicsContext, row: u32) -> Result<(), CompositorError> {
        let data = if row == 0 { &self.frequency } else { &self.waveform };
        self.texture.upload(
            gl,
            &TextureUpload {
                internal_format: PixelFormat::Luminance,
                format: PixelFormat::Luminance,
                offset_x: Some(0),
                offset_y: Some(row),
                width: SPECTRUM_BINS as u32,
                height: 1,
                buffer: Some(data),
                ..TextureUpload::default()
            },
        )?;
        Ok(())
    }
}

impl TextureSource for AudioTexture {
    fn name(&self) -> &str {
        &self.name
    }

    fn update(&mut self, frame: &mut SourceFrame<'_>) -> Result<(), CompositorError> {
        let unit = self.texture.unit() as i32;
        frame.set_uniform(&self.name, UniformValue::Int(unit))?;
        if self.analyser.is_active() {
            self.analyser.frequency_data(&mut self.frequency);
            self.analyser.waveform_data(&mut self.waveform);
            self.upload_row(frame.gl(), 0)?;
            self.upload_row(frame.gl(), 1)?;
        }
        Ok(())
    }

    fn dispose(self: Box<Self>, gl: &mut dyn GraphicsContext) {
        self.texture.dispose(gl);
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::context::ProgramId;
    use crate::headless::{Call, HeadlessContext};

    fn program(gl: &mut HeadlessContext, uniforms: &str) -> (ProgramId, UniformCache) {
        let fragment = format!("{uniforms}\nvoid main() {{}}");
        let program = gl
            .compile_program(crate::compile::DEFAULT_VERTEX_SHADER, &fragment)
            .unwrap();
        let cache = UniformCache::for_program(&*gl, program);
        (program, cache)
    }

    #[test]
    fn classifies_sources_by_extension() {
        assert_eq!(SourceKind::classify("noise.PNG", false), SourceKind::Image);
        assert_eq!(SourceKind::classify("tex/a.jpg?v=2", false), SourceKind::Image);
        assert_eq!(SourceKind::classify("clip.webm", false), SourceKind::Video);
        assert_eq!(SourceKind::classify("#my-canvas", false), SourceKind::ElementRef);
        assert_eq!(SourceKind::classify(".png", false), SourceKind::ElementRef);
        assert_eq!(SourceKind::classify("clip.webm", true), SourceKind::Camera);
    }

    #[test]
    fn missing_selector_resolves_to_nothing() {
        let mut registry = MediaRegistry::new(".");
        assert!(registry.resolve("#nope", false).is_none());
        assert!(registry.resolve("movie.mp4", false).is_none());
        assert!(registry.resolve("", true).is_none());
    }

    #[test]
    fn canvas_element_publishes_unit_and_resolution() {
        let mut gl = HeadlessContext::new();
        let (_, mut cache) = program(&mut gl, "uniform sampler2D u_canvas; uniform vec2 u_canvas_resolution;");
        let mut registry = MediaRegistry::new(".");
        registry.insert("#canvas", MediaElement::Canvas(RgbaImage::new(32, 16)));
        let input = registry.resolve("#canvas", false).unwrap();
        assert_eq!(input.kind(), SourceKind::Canvas);
        let mut media = MediaTexture::new(&mut gl, 2, "u_canvas", input, MediaOptions::default()).unwrap();

        let mut frame = SourceFrame::new(&mut gl, &mut cache);
        media.update(&mut frame).unwrap();
        assert_eq!(gl.last_uniform("u_canvas"), Some(UniformValue::Int(2)));
        assert_eq!(
            gl.last_uniform("u_canvas_resolution"),
            Some(UniformValue::Vec2([32.0, 16.0]))
        );
    }

    #[test]
    fn still_images_rebind_without_reupload() {
        let mut gl = HeadlessContext::new();
        let (_, mut cache) = program(&mut gl, "uniform sampler2D u_img;");
        let input = MediaInput::Still(SourceKind::Image, RgbaImage::new(4, 4));
        let mut media = MediaTexture::new(&mut gl, 0, "u_img", input, MediaOptions::default()).unwrap();
        gl.clear_calls();
        media.update(&mut SourceFrame::new(&mut gl, &mut cache)).unwrap();
        assert!(!gl.calls().iter().any(|call| matches!(call, Call::TexImage { .. })));

        let mut forced = MediaTexture::new(
            &mut gl,
            1,
            "u_img",
            MediaInput::Still(SourceKind::Image, RgbaImage::new(4, 4)),
            MediaOptions {
                force_update: true,
                ..MediaOptions::default()
            },
        )
        .unwrap();
        gl.clear_calls();
        forced.update(&mut SourceFrame::new(&mut gl, &mut cache)).unwrap();
        assert!(gl.calls().iter().any(|call| matches!(call, Call::TexImage { .. })));
    }

    #[test]
    fn video_feed_uploads_only_new_frames() {
        let mut gl = HeadlessContext::new();
        let (_, mut cache) = program(&mut gl, "uniform sampler2D u_video;");
        let (sender, feed) = ChannelFeed::new();
        let mut media = MediaTexture::new(
            &mut gl,
            0,
            "u_video",
            MediaInput::Video(Box::new(feed)),
            MediaOptions::default(),
        )
        .unwrap();
        assert_eq!(
            media.texture.parameters(),
            &TextureParameters::clamped(FilterMode::Linear)
        );

        gl.clear_calls();
        media.update(&mut SourceFrame::new(&mut gl, &mut cache)).unwrap();
        assert!(!gl.calls().iter().any(|call| matches!(call, Call::TexImage { .. })));

        sender.send(RgbaImage::new(6, 3)).unwrap();
        media.update(&mut SourceFrame::new(&mut gl, &mut cache)).unwrap();
        assert!(gl.calls().contains(&Call::TexImage {
            texture: media.texture.id(),
            level: 0,
            width: 6,
            height: 3,
            format: PixelFormat::Rgba,
        }));
        assert_eq!(media.resolution(), [6.0, 3.0]);
    }

    #[test]
    fn image_files_load_in_the_background() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tile.png");
        RgbaImage::new(8, 8).save(&path).unwrap();

        let mut gl = HeadlessContext::new();
        let (_, mut cache) = program(&mut gl, "uniform sampler2D u_tile;");
        let mut registry = MediaRegistry::new(dir.path());
        let input = registry.resolve("tile.png", false).unwrap();
        let mut media = MediaTexture::new(&mut gl, 0, "u_tile", input, MediaOptions::default()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while media.is_loading() && Instant::now() < deadline {
            media.update(&mut SourceFrame::new(&mut gl, &mut cache)).unwrap();
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!media.is_loading());
        assert_eq!(media.resolution(), [8.0, 8.0]);
        assert!(gl.mipmap_generations(media.texture.id()) > 0);
    }

    struct Ramp {
        active: bool,
    }

    impl SpectrumAnalyser for Ramp {
        fn is_active(&self) -> bool {
            self.active
        }

        fn frequency_data(&mut self, out: &mut [u8]) {
            for (index, value) in out.iter_mut().enumerate() {
                *value = index as u8;
            }
        }

        fn waveform_data(&mut self, out: &mut [u8]) {
            out.fill(128);
        }
    }

    #[test]
    fn audio_rows_are_sub_uploaded_while_active() {
        let mut gl = HeadlessContext::new();
        let (_, mut cache) = program(&mut gl, "uniform sampler2D u_audio0;");
        let mut audio = AudioTexture::new(&mut gl, 1, "u_audio0", Box::new(Ramp { active: true })).unwrap();
        gl.clear_calls();
        audio.update(&mut SourceFrame::new(&mut gl, &mut cache)).unwrap();

        let rows: Vec<u32> = gl
            .calls()
            .iter()
            .filter_map(|call| match call {
                Call::TexSubImage { y, width, height, .. } => {
                    assert_eq!((*width, *height), (SPECTRUM_BINS as u32, 1));
                    Some(*y)
                }
                _ => None,
            })
            .collect();
        assert_eq!(rows, vec![0, 1]);
        assert_eq!(gl.last_uniform("u_audio0"), Some(UniformValue::Int(1)));

        let data = gl.texture_data(audio.texture.id()).unwrap();
        assert_eq!(data[5], 5);
        assert_eq!(data[SPECTRUM_BINS], 128);
    }

    #[test]
    fn idle_audio_only_publishes_its_unit() {
        let mut gl = HeadlessContext::new();
        let (_, mut cache) = program(&mut gl, "uniform sampler2D u_audio0;");
        let mut audio = AudioTexture::new(&mut gl, 0, "u_audio0", Box::new(Ramp { active: false })).unwrap();
        gl.clear_calls();
        audio.update(&mut SourceFrame::new(&mut gl, &mut cache)).unwrap();
        assert!(!gl.calls().iter().any(|call| matches!(call, Call::TexSubImage { .. })));
    }
}
