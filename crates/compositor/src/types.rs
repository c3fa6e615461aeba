use std::fmt;

/// Texture coordinate wrapping applied outside the `[0, 1]` range.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum WrapMode {
    #[default]
    Repeat,
    ClampToEdge,
    MirroredRepeat,
}

/// Minification/magnification filters. The mipmap variants are only
/// meaningful for minification; magnification treats them as their base
/// filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FilterMode {
    Nearest,
    Linear,
    NearestMipmapNearest,
    LinearMipmapNearest,
    NearestMipmapLinear,
    LinearMipmapLinear,
}

impl FilterMode {
    /// True when sampling consults the mip chain.
    pub fn is_mipmapped(self) -> bool {
        !matches!(self, FilterMode::Nearest | FilterMode::Linear)
    }
}

/// Sampling state for one texture.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureParameters {
    pub wrap_s: WrapMode,
    pub wrap_t: WrapMode,
    pub min_filter: FilterMode,
    pub mag_filter: FilterMode,
}

impl Default for TextureParameters {
    /// Matches the state a freshly created GL texture starts with.
    fn default() -> Self {
        Self {
            wrap_s: WrapMode::Repeat,
            wrap_t: WrapMode::Repeat,
            min_filter: FilterMode::NearestMipmapLinear,
            mag_filter: FilterMode::Linear,
        }
    }
}

impl TextureParameters {
    /// Clamp-to-edge on both axes with the same filter for min and mag.
    pub fn clamped(filter: FilterMode) -> Self {
        Self {
            wrap_s: WrapMode::ClampToEdge,
            wrap_t: WrapMode::ClampToEdge,
            min_filter: filter,
            mag_filter: filter,
        }
    }

    /// Non-clamped wrapping and mipmapped minification only work on
    /// power-of-two images.
    pub fn requires_power_of_two(&self) -> bool {
        self.wrap_s != WrapMode::ClampToEdge
            || self.wrap_t != WrapMode::ClampToEdge
            || self.min_filter.is_mipmapped()
    }
}

/// Channel layout of uploaded pixel data.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    #[default]
    Rgba,
    /// Single channel replicated into RGB when sampled; alpha reads as 1.
    Luminance,
}

impl PixelFormat {
    pub fn channels(self) -> usize {
        match self {
            PixelFormat::Rgba => 4,
            PixelFormat::Luminance => 1,
        }
    }
}

/// Component storage of uploaded pixel data.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PixelType {
    #[default]
    UnsignedByte,
    HalfFloat,
    Float,
}

impl PixelType {
    pub fn bytes(self) -> usize {
        match self {
            PixelType::UnsignedByte => 1,
            PixelType::HalfFloat => 2,
            PixelType::Float => 4,
        }
    }
}

/// Optional device features the engine degrades around.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Capability {
    FloatTextures,
    FloatLinear,
    HalfFloatTextures,
    HalfFloatLinear,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Capability::FloatTextures => "float textures",
            Capability::FloatLinear => "linear filtering of float textures",
            Capability::HalfFloatTextures => "half-float textures",
            Capability::HalfFloatLinear => "linear filtering of half-float textures",
        };
        f.write_str(label)
    }
}

/// Declared type of an active uniform as reported by the context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UniformType {
    Float,
    Vec2,
    Vec3,
    Vec4,
    Int,
    Sampler2D,
    /// Anything the cache does not write (matrices, arrays, bools, ...).
    Unsupported,
}

impl UniformType {
    /// Maps a GLSL type keyword onto the cached uniform kinds.
    pub fn from_glsl(keyword: &str) -> Self {
        match keyword {
            "float" => UniformType::Float,
            "vec2" => UniformType::Vec2,
            "vec3" => UniformType::Vec3,
            "vec4" => UniformType::Vec4,
            "int" => UniformType::Int,
            "sampler2D" => UniformType::Sampler2D,
            _ => UniformType::Unsupported,
        }
    }
}
