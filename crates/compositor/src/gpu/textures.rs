//! Texture storage and sampler state on the wgpu side.
//!
//! GL textures are mutable: any `tex_image` call may change their size or
//! format. Each record therefore owns an optional `wgpu::Texture` that is
//! recreated whenever its shape changes.

use std::borrow::Cow;
use std::collections::HashMap;

use image::{imageops, RgbaImage};

use crate::error::CompositorError;
use crate::types::{FilterMode, PixelFormat, PixelType, TextureParameters, WrapMode};

const TEXTURE_USAGE: wgpu::TextureUsages = wgpu::TextureUsages::TEXTURE_BINDING
    .union(wgpu::TextureUsages::COPY_DST)
    .union(wgpu::TextureUsages::COPY_SRC)
    .union(wgpu::TextureUsages::RENDER_ATTACHMENT);

/// Storage format for uploaded pixels. Luminance is expanded to RGBA since
/// wgpu has no replicating single-channel format.
pub(crate) fn storage_format(
    format: PixelFormat,
    ty: PixelType,
) -> Result<wgpu::TextureFormat, CompositorError> {
    match (format, ty) {
        (_, PixelType::UnsignedByte) => Ok(wgpu::TextureFormat::Rgba8Unorm),
        (PixelFormat::Rgba, PixelType::HalfFloat) => Ok(wgpu::TextureFormat::Rgba16Float),
        (PixelFormat::Rgba, PixelType::Float) => Ok(wgpu::TextureFormat::Rgba32Float),
        (PixelFormat::Luminance, ty) => Err(CompositorError::InvalidUpload(format!(
            "luminance textures only support unsigned bytes, got {ty:?}"
        ))),
    }
}

/// Converts uploaded bytes into the layout of [`storage_format`].
pub(crate) fn expand_pixels(format: PixelFormat, data: &[u8]) -> Cow<'_, [u8]> {
    match format {
        PixelFormat::Rgba => Cow::Borrowed(data),
        PixelFormat::Luminance => Cow::Owned(
            data.iter()
                .flat_map(|&value| [value, value, value, u8::MAX])
                .collect(),
        ),
    }
}

pub(crate) fn check_length(
    format: PixelFormat,
    ty: PixelType,
    width: u32,
    height: u32,
    data: &[u8],
) -> Result<(), CompositorError> {
    let expected = width as usize * height as usize * format.channels() * ty.bytes();
    if data.len() != expected {
        return Err(CompositorError::InvalidUpload(format!(
            "{width}x{height} {format:?}/{ty:?} upload needs {expected} bytes, got {}",
            data.len()
        )));
    }
    Ok(())
}

fn address_mode(wrap: WrapMode) -> wgpu::AddressMode {
    match wrap {
        WrapMode::Repeat => wgpu::AddressMode::Repeat,
        WrapMode::ClampToEdge => wgpu::AddressMode::ClampToEdge,
        WrapMode::MirroredRepeat => wgpu::AddressMode::MirrorRepeat,
    }
}

/// Splits a GL filter into its texel filter and mip filter.
fn split_filter(filter: FilterMode) -> (wgpu::FilterMode, wgpu::FilterMode) {
    use wgpu::FilterMode::{Linear, Nearest};
    match filter {
        FilterMode::Nearest => (Nearest, Nearest),
        FilterMode::Linear => (Linear, Nearest),
        FilterMode::NearestMipmapNearest => (Nearest, Nearest),
        FilterMode::LinearMipmapNearest => (Linear, Nearest),
        FilterMode::NearestMipmapLinear => (Nearest, Linear),
        FilterMode::LinearMipmapLinear => (Linear, Linear),
    }
}

pub(crate) fn sampler_descriptor(parameters: &TextureParameters) -> wgpu::SamplerDescriptor<'static> {
    let (min_filter, mipmap_filter) = split_filter(parameters.min_filter);
    let (mag_filter, _) = split_filter(parameters.mag_filter);
    wgpu::SamplerDescriptor {
        label: Some("doodle sampler"),
        address_mode_u: address_mode(parameters.wrap_s),
        address_mode_v: address_mode(parameters.wrap_t),
        address_mode_w: wgpu::AddressMode::ClampToEdge,
        mag_filter,
        min_filter,
        mipmap_filter,
        ..Default::default()
    }
}

/// Samplers shared between textures with identical parameters.
#[derive(Default)]
pub(crate) struct SamplerCache {
    samplers: HashMap<TextureParameters, wgpu::Sampler>,
}

impl SamplerCache {
    pub(crate) fn get(&mut self, device: &wgpu::Device, parameters: &TextureParameters) -> wgpu::Sampler {
        self.samplers
            .entry(*parameters)
            .or_insert_with(|| device.create_sampler(&sampler_descriptor(parameters)))
            .clone()
    }
}

/// Mip levels 1.. of `base`, each half the size of the previous one.
pub(crate) fn mip_chain(base: &RgbaImage) -> Vec<RgbaImage> {
    let mut levels = Vec::new();
    let (mut width, mut height) = base.dimensions();
    let mut previous = base.clone();
    while width > 1 || height > 1 {
        width = (width / 2).max(1);
        height = (height / 2).max(1);
        let level = imageops::resize(&previous, width, height, imageops::FilterType::Triangle);
        levels.push(level.clone());
        previous = level;
    }
    levels
}

pub(crate) struct TextureObject {
    pub texture: Option<wgpu::Texture>,
    pub format: wgpu::TextureFormat,
    pub width: u32,
    pub height: u32,
    pub parameters: TextureParameters,
    mip_levels: u32,
    /// CPU copy of level 0 for RGBA8 textures, kept for mip generation.
    level0: Option<Vec<u8>>,
}

impl TextureObject {
    pub(crate) fn new() -> Self {
        Self {
            texture: None,
            format: wgpu::TextureFormat::Rgba8Unorm,
            width: 0,
            height: 0,
            parameters: TextureParameters::default(),
            mip_levels: 0,
            level0: None,
        }
    }

    pub(crate) fn view(&self) -> Option<wgpu::TextureView> {
        self.texture
            .as_ref()
            .map(|texture| texture.create_view(&wgpu::TextureViewDescriptor::default()))
    }

    /// Level-0 view used as a render attachment.
    pub(crate) fn attachment_view(&self) -> Option<wgpu::TextureView> {
        self.texture.as_ref().map(|texture| {
            texture.create_view(&wgpu::TextureViewDescriptor {
                base_mip_level: 0,
                mip_level_count: Some(1),
                ..Default::default()
            })
        })
    }

    /// Reallocates storage when the shape changes; contents become undefined.
    pub(crate) fn allocate(
        &mut self,
        device: &wgpu::Device,
        format: wgpu::TextureFormat,
        width: u32,
        height: u32,
        mip_levels: u32,
    ) {
        let unchanged = self.texture.is_some()
            && self.format == format
            && self.width == width
            && self.height == height
            && self.mip_levels == mip_levels;
        if unchanged {
            return;
        }
        self.texture = Some(device.create_texture(&wgpu::TextureDescriptor {
            label: Some("doodle texture"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: mip_levels,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: TEXTURE_USAGE,
            view_formats: &[],
        }));
        self.format = format;
        self.width = width;
        self.height = height;
        self.mip_levels = mip_levels;
        self.level0 = None;
    }

    pub(crate) fn has_level(&self, level: u32) -> bool {
        self.texture.is_some() && level < self.mip_levels
    }

    /// Writes a tightly packed region. `data` is already in storage layout.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn write(
        &mut self,
        queue: &wgpu::Queue,
        level: u32,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        data: &[u8],
    ) {
        let Some(texture) = self.texture.as_ref() else {
            return;
        };
        let bytes_per_pixel = self.format.block_copy_size(None).unwrap_or(4);
        queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: level,
                origin: wgpu::Origin3d { x, y, z: 0 },
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(width * bytes_per_pixel),
                rows_per_image: Some(height),
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        if level == 0 && self.format == wgpu::TextureFormat::Rgba8Unorm {
            self.remember_level0(x, y, width, height, data);
        }
    }

    fn remember_level0(&mut self, x: u32, y: u32, width: u32, height: u32, data: &[u8]) {
        let full = x == 0 && y == 0 && width == self.width && height == self.height;
        if full {
            self.level0 = Some(data.to_vec());
            return;
        }
        let stride = self.width as usize * 4;
        let Some(level0) = self.level0.as_mut() else {
            return;
        };
        let row_bytes = width as usize * 4;
        for row in 0..height as usize {
            let dst = (y as usize + row) * stride + x as usize * 4;
            let src = row * row_bytes;
            if let (Some(dst), Some(src)) = (
                level0.get_mut(dst..dst + row_bytes),
                data.get(src..src + row_bytes),
            ) {
                dst.copy_from_slice(src);
            }
        }
    }

    /// Rebuilds the full mip chain from the CPU copy of level 0.
    pub(crate) fn generate_mipmaps(&mut self, device: &wgpu::Device, queue: &wgpu::Queue) {
        let Some(base) = self
            .level0
            .clone()
            .and_then(|pixels| RgbaImage::from_raw(self.width, self.height, pixels))
        else {
            tracing::debug!(
                format = ?self.format,
                "mipmaps need RGBA8 contents uploaded from the CPU; skipping"
            );
            return;
        };
        let levels = 32 - self.width.max(self.height).leading_zeros();
        self.allocate(device, self.format, self.width, self.height, levels);
        self.write(queue, 0, 0, 0, base.width(), base.height(), base.as_raw());
        for (index, level) in mip_chain(&base).iter().enumerate() {
            self.write(
                queue,
                index as u32 + 1,
                0,
                0,
                level.width(),
                level.height(),
                level.as_raw(),
            );
        }
    }
}
