use image::imageops::{self, FilterType};
use image::RgbaImage;

use crate::context::{GraphicsContext, TexImage, TexSubImage, TextureId};
use crate::error::CompositorError;
use crate::types::{PixelFormat, PixelType, TextureParameters};

/// Hands out texture units for one program. Units are never reused, even
/// after the texture holding one is disposed.
#[derive(Debug, Default)]
pub struct TextureUnitAllocator {
    next: u32,
}

impl TextureUnitAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_unit(&mut self) -> u32 {
        let unit = self.next;
        self.next += 1;
        unit
    }

    /// Number of units handed out so far.
    pub fn allocated(&self) -> u32 {
        self.next
    }
}

const BLACK_PIXEL: [u8; 4] = [0, 0, 0, 255];

/// Options for one [`Texture::upload`] call.
///
/// Supplying both offsets turns the upload into a sub-region update of the
/// existing storage; otherwise the level is reallocated. `pixels` takes
/// precedence over `buffer` and always carries RGBA8 data with its own size.
#[derive(Clone, Copy, Debug)]
pub struct TextureUpload<'a> {
    pub level: u32,
    pub internal_format: PixelFormat,
    pub offset_x: Option<u32>,
    pub offset_y: Option<u32>,
    pub width: u32,
    pub height: u32,
    pub border: u32,
    pub format: PixelFormat,
    pub ty: PixelType,
    /// Reverses row order so top-down images land bottom-up.
    pub flip_y: bool,
    pub buffer: Option<&'a [u8]>,
    pub pixels: Option<&'a RgbaImage>,
}

impl Default for TextureUpload<'_> {
    fn default() -> Self {
        Self {
            level: 0,
            internal_format: PixelFormat::Rgba,
            offset_x: None,
            offset_y: None,
            width: 1,
            height: 1,
            border: 0,
            format: PixelFormat::Rgba,
            ty: PixelType::UnsignedByte,
            flip_y: true,
            buffer: Some(&BLACK_PIXEL),
            pixels: None,
        }
    }
}

impl<'a> TextureUpload<'a> {
    pub fn pixels(image: &'a RgbaImage) -> Self {
        Self {
            pixels: Some(image),
            buffer: None,
            ..Self::default()
        }
    }
}

/// Whether `start..start + len` reaches past `limit`, overflow included.
pub(crate) fn exceeds(start: u32, len: u32, limit: u32) -> bool {
    start.checked_add(len).map_or(true, |end| end > limit)
}

pub fn is_power_of_two(value: u32) -> bool {
    value != 0 && value & (value - 1) == 0
}

pub fn floor_power_of_two(value: u32) -> u32 {
    if value == 0 {
        0
    } else {
        1 << (31 - value.leading_zeros())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Storage {
    width: u32,
    height: u32,
    format: PixelFormat,
    ty: PixelType,
}

/// A GPU texture bound to a fixed unit of its owning program.
#[derive(Debug)]
pub struct Texture {
    id: TextureId,
    unit: u32,
    parameters: TextureParameters,
    storage: Option<Storage>,
    pow2: Option<RgbaImage>,
}

impl Texture {
    /// Creates the texture holding a single opaque black pixel.
    pub fn new(gl: &mut dyn GraphicsContext, unit: u32) -> Result<Self, CompositorError> {
        Self::with_upload(gl, unit, &TextureUpload::default())
    }

    pub fn with_upload(
        gl: &mut dyn GraphicsContext,
        unit: u32,
        upload: &TextureUpload<'_>,
    ) -> Result<Self, CompositorError> {
        let id = gl.create_texture()?;
        let mut texture = Self {
            id,
            unit,
            parameters: TextureParameters::default(),
            storage: None,
            pow2: None,
        };
        if let Err(err) = texture.upload(gl, upload) {
            gl.delete_texture(id);
            return Err(err);
        }
        Ok(texture)
    }

    pub fn id(&self) -> TextureId {
        self.id
    }

    pub fn unit(&self) -> u32 {
        self.unit
    }

    pub fn parameters(&self) -> &TextureParameters {
        &self.parameters
    }

    /// Dimensions of level 0.
    pub fn size(&self) -> Option<(u32, u32)> {
        self.storage.map(|storage| (storage.width, storage.height))
    }

    /// Size of the power-of-two fallback buffer, once one was needed.
    pub fn fallback_size(&self) -> Option<(u32, u32)> {
        self.pow2.as_ref().map(|image| image.dimensions())
    }

    fn bind(&self, gl: &mut dyn GraphicsContext) {
        gl.bind_texture(self.unit, Some(self.id));
    }

    pub fn set_parameters(&mut self, gl: &mut dyn GraphicsContext, parameters: TextureParameters) {
        self.parameters = parameters;
        self.bind(gl);
        gl.texture_parameters(self.id, &self.parameters);
    }

    /// Rebinds and reapplies parameters without touching pixel data.
    pub fn shallow(&self, gl: &mut dyn GraphicsContext) {
        self.bind(gl);
        gl.texture_parameters(self.id, &self.parameters);
    }

    /// Uploads pixel data. Returns `Ok(false)` when the upload was skipped
    /// because the source has no area.
    pub fn upload(
        &mut self,
        gl: &mut dyn GraphicsContext,
        upload: &TextureUpload<'_>,
    ) -> Result<bool, CompositorError> {
        if upload.border != 0 {
            return Err(CompositorError::InvalidUpload(format!(
                "border must be 0, got {}",
                upload.border
            )));
        }
        if upload.internal_format != upload.format {
            return Err(CompositorError::InvalidUpload(format!(
                "internal format {:?} does not match format {:?}",
                upload.internal_format, upload.format
            )));
        }

        self.shallow(gl);

        let mut from_pixels = false;
        let (width, height, data): (u32, u32, Option<Vec<u8>>) = match upload.pixels {
            Some(pixels) => {
                let (width, height) = pixels.dimensions();
                if width == 0 || height == 0 {
                    tracing::warn!(width, height, "texture source has no area; update skipped");
                    return Ok(false);
                }
                if upload.format != PixelFormat::Rgba || upload.ty != PixelType::UnsignedByte {
                    return Err(CompositorError::InvalidUpload(
                        "pixel sources upload as RGBA unsigned bytes".into(),
                    ));
                }
                from_pixels = true;
                let source = self.power_of_two_source(pixels);
                let (width, height) = source.dimensions();
                let data = if upload.flip_y {
                    imageops::flip_vertical(source).into_raw()
                } else {
                    source.as_raw().clone()
                };
                (width, height, Some(data))
            }
            None => {
                let data = match upload.buffer {
                    Some(buffer) => {
                        let row = upload.width as usize * upload.format.channels() * upload.ty.bytes();
                        let expected = row * upload.height as usize;
                        if buffer.len() != expected {
                            return Err(CompositorError::InvalidUpload(format!(
                                "buffer holds {} bytes, {}x{} {:?} needs {expected}",
                                buffer.len(),
                                upload.width,
                                upload.height,
                                upload.format
                            )));
                        }
                        Some(if upload.flip_y {
                            flip_rows(buffer, row)
                        } else {
                            buffer.to_vec()
                        })
                    }
                    None => None,
                };
                (upload.width, upload.height, data)
            }
        };

        match (upload.offset_x, upload.offset_y) {
            (Some(x), Some(y)) => {
                let storage = self.storage.ok_or_else(|| {
                    CompositorError::InvalidUpload("sub-region update before allocation".into())
                })?;
                if exceeds(x, width, storage.width) || exceeds(y, height, storage.height) {
                    return Err(CompositorError::InvalidUpload(format!(
                        "{width}x{height} at ({x}, {y}) exceeds {}x{} texture",
                        storage.width, storage.height
                    )));
                }
                if storage.format != upload.format || storage.ty != upload.ty {
                    return Err(CompositorError::InvalidUpload(
                        "sub-region format differs from texture storage".into(),
                    ));
                }
                let data = data.ok_or_else(|| {
                    CompositorError::InvalidUpload("sub-region update without data".into())
                })?;
                gl.tex_sub_image(
                    self.id,
                    &TexSubImage {
                        level: upload.level,
                        x,
                        y,
                        width,
                        height,
                        format: upload.format,
                        ty: upload.ty,
                        data: &data,
                    },
                )?;
            }
            _ => {
                gl.tex_image(
                    self.id,
                    &TexImage {
                        level: upload.level,
                        format: upload.format,
                        ty: upload.ty,
                        width,
                        height,
                        data: data.as_deref(),
                    },
                )?;
                if upload.level == 0 {
                    self.storage = Some(Storage {
                        width,
                        height,
                        format: upload.format,
                        ty: upload.ty,
                    });
                }
            }
        }

        if from_pixels
            && is_power_of_two(width)
            && is_power_of_two(height)
            && self.parameters.min_filter.is_mipmapped()
        {
            gl.generate_mipmap(self.id);
        }
        Ok(true)
    }

    /// Returns the image to upload, downscaling into the owned fallback
    /// buffer when the sampling state needs power-of-two dimensions.
    fn power_of_two_source<'a>(&'a mut self, pixels: &'a RgbaImage) -> &'a RgbaImage {
        let (width, height) = pixels.dimensions();
        if !self.parameters.requires_power_of_two()
            || (is_power_of_two(width) && is_power_of_two(height))
        {
            return pixels;
        }
        let (target_width, target_height) = match &self.pow2 {
            Some(buffer) => buffer.dimensions(),
            None => {
                let size = (floor_power_of_two(width), floor_power_of_two(height));
                tracing::warn!(
                    width,
                    height,
                    resized_width = size.0,
                    resized_height = size.1,
                    "texture is not a power of two; resizing"
                );
                size
            }
        };
        let resized = imageops::resize(pixels, target_width, target_height, FilterType::Triangle);
        &*self.pow2.insert(resized)
    }

    pub fn dispose(self, gl: &mut dyn GraphicsContext) {
        gl.delete_texture(self.id);
    }
}

fn flip_rows(buffer: &[u8], row: usize) -> Vec<u8> {
    if row == 0 {
        return buffer.to_vec();
    }
    buffer
        .chunks_exact(row)
        .rev()
        .flatten()
        .copied()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{Call, HeadlessContext};
    use crate::types::{FilterMode, WrapMode};

    fn uploads(gl: &HeadlessContext) -> Vec<(u32, u32)> {
        gl.calls()
            .iter()
            .filter_map(|call| match call {
                Call::TexImage { width, height, .. } => Some((*width, *height)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn allocator_is_strictly_increasing() {
        let mut units = TextureUnitAllocator::new();
        let issued: Vec<u32> = (0..4).map(|_| units.next_unit()).collect();
        assert_eq!(issued, vec![0, 1, 2, 3]);
        assert_eq!(units.allocated(), 4);
    }

    #[test]
    fn power_of_two_helpers() {
        assert!(is_power_of_two(64));
        assert!(!is_power_of_two(100));
        assert!(!is_power_of_two(0));
        assert_eq!(floor_power_of_two(100), 64);
        assert_eq!(floor_power_of_two(1), 1);
        assert_eq!(floor_power_of_two(1024), 1024);
    }

    #[test]
    fn new_texture_holds_one_black_pixel() {
        let mut gl = HeadlessContext::new();
        let texture = Texture::new(&mut gl, 3).unwrap();
        assert_eq!(texture.size(), Some((1, 1)));
        assert!(gl.calls().contains(&Call::BindTexture {
            unit: 3,
            texture: Some(texture.id())
        }));
        assert_eq!(gl.texture_data(texture.id()), Some(&[0, 0, 0, 255][..]));
    }

    #[test]
    fn clamped_linear_texture_uploads_at_native_size() {
        let mut gl = HeadlessContext::new();
        let mut texture = Texture::new(&mut gl, 0).unwrap();
        texture.set_parameters(&mut gl, TextureParameters::clamped(FilterMode::Linear));
        let image = RgbaImage::new(100, 100);
        assert!(texture.upload(&mut gl, &TextureUpload::pixels(&image)).unwrap());
        assert_eq!(texture.fallback_size(), None);
        assert_eq!(uploads(&gl).last(), Some(&(100, 100)));
        assert_eq!(gl.mipmap_generations(texture.id()), 0);
    }

    #[test]
    fn repeating_texture_falls_back_to_power_of_two_once() {
        let mut gl = HeadlessContext::new();
        let mut texture = Texture::new(&mut gl, 0).unwrap();
        texture.set_parameters(
            &mut gl,
            TextureParameters {
                wrap_s: WrapMode::Repeat,
                wrap_t: WrapMode::Repeat,
                min_filter: FilterMode::LinearMipmapLinear,
                mag_filter: FilterMode::Linear,
            },
        );
        let image = RgbaImage::new(100, 100);
        texture.upload(&mut gl, &TextureUpload::pixels(&image)).unwrap();
        assert_eq!(texture.fallback_size(), Some((64, 64)));
        assert_eq!(uploads(&gl).last(), Some(&(64, 64)));
        assert_eq!(gl.mipmap_generations(texture.id()), 1);

        let larger = RgbaImage::new(300, 200);
        texture.upload(&mut gl, &TextureUpload::pixels(&larger)).unwrap();
        assert_eq!(texture.fallback_size(), Some((64, 64)));
        assert_eq!(uploads(&gl).last(), Some(&(64, 64)));
    }

    #[test]
    fn zero_area_source_is_skipped() {
        let mut gl = HeadlessContext::new();
        let mut texture = Texture::new(&mut gl, 0).unwrap();
        gl.clear_calls();
        let empty = RgbaImage::new(0, 10);
        assert!(!texture.upload(&mut gl, &TextureUpload::pixels(&empty)).unwrap());
        assert!(!gl
            .calls()
            .iter()
            .any(|call| matches!(call, Call::TexImage { .. } | Call::TexSubImage { .. })));
    }

    #[test]
    fn pixel_sources_are_flipped_bottom_up() {
        let mut gl = HeadlessContext::new();
        let mut texture = Texture::new(&mut gl, 0).unwrap();
        texture.set_parameters(&mut gl, TextureParameters::clamped(FilterMode::Nearest));
        let mut image = RgbaImage::new(1, 2);
        image.put_pixel(0, 0, image::Rgba([255, 0, 0, 255]));
        image.put_pixel(0, 1, image::Rgba([0, 0, 255, 255]));
        texture.upload(&mut gl, &TextureUpload::pixels(&image)).unwrap();
        assert_eq!(
            gl.texture_data(texture.id()),
            Some(&[0, 0, 255, 255, 255, 0, 0, 255][..])
        );
    }

    #[test]
    fn sub_region_must_fit_existing_storage() {
        let mut gl = HeadlessContext::new();
        let mut texture = Texture::with_upload(
            &mut gl,
            0,
            &TextureUpload {
                internal_format: PixelFormat::Luminance,
                format: PixelFormat::Luminance,
                width: 4,
                height: 2,
                buffer: None,
                ..TextureUpload::default()
            },
        )
        .unwrap();
        let row = [9u8; 4];
        let row_update = TextureUpload {
            internal_format: PixelFormat::Luminance,
            format: PixelFormat::Luminance,
            offset_x: Some(0),
            offset_y: Some(1),
            width: 4,
            height: 1,
            buffer: Some(&row),
            ..TextureUpload::default()
        };
        assert!(texture.upload(&mut gl, &row_update).unwrap());

        let too_wide = [0u8; 8];
        let overflow = TextureUpload {
            width: 8,
            buffer: Some(&too_wide),
            ..row_update
        };
        assert!(matches!(
            texture.upload(&mut gl, &overflow),
            Err(CompositorError::InvalidUpload(_))
        ));
    }

    #[test]
    fn offsets_near_u32_max_are_rejected() {
        let mut gl = HeadlessContext::new();
        let mut texture = Texture::with_upload(
            &mut gl,
            0,
            &TextureUpload {
                width: 2,
                height: 2,
                buffer: None,
                ..TextureUpload::default()
            },
        )
        .unwrap();
        let pixel = [1u8; 4];
        let far_right = TextureUpload {
            offset_x: Some(u32::MAX),
            offset_y: Some(0),
            width: 1,
            height: 1,
            buffer: Some(&pixel),
            ..TextureUpload::default()
        };
        assert!(matches!(
            texture.upload(&mut gl, &far_right),
            Err(CompositorError::InvalidUpload(_))
        ));
        let far_down = TextureUpload {
            offset_x: Some(0),
            offset_y: Some(u32::MAX),
            ..far_right
        };
        assert!(matches!(
            texture.upload(&mut gl, &far_down),
            Err(CompositorError::InvalidUpload(_))
        ));
        assert_eq!(texture.size(), Some((2, 2)));
    }

    #[test]
    fn region_end_overflow_counts_as_out_of_bounds() {
        assert!(exceeds(u32::MAX, 1, u32::MAX));
        assert!(exceeds(3, 2, 4));
        assert!(!exceeds(2, 2, 4));
    }

    #[test]
    fn mismatched_buffer_length_is_rejected() {
        let mut gl = HeadlessContext::new();
        let mut texture = Texture::new(&mut gl, 0).unwrap();
        let short = [0u8; 3];
        let upload = TextureUpload {
            buffer: Some(&short),
            ..TextureUpload::default()
        };
        assert!(texture.upload(&mut gl, &upload).is_err());
        assert_eq!(texture.size(), Some((1, 1)));
    }
}
