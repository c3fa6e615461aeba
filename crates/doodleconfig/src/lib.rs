use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("failed to read configuration {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A render job: renderer settings plus the surfaces to drive.
#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    pub version: u32,
    #[serde(default)]
    pub renderer: RendererSettings,
    #[serde(default)]
    pub media: Vec<MediaConfig>,
    #[serde(default)]
    pub surfaces: Vec<SurfaceConfig>,
    /// Directory relative paths resolve against.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerSetting {
    #[default]
    Low,
    High,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RendererSettings {
    #[serde(default = "default_pixel_ratio")]
    pub pixel_ratio: f32,
    #[serde(
        default = "default_frame_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub frame_interval: Duration,
    #[serde(default = "default_frames")]
    pub frames: u32,
    #[serde(default)]
    pub power: PowerSetting,
    /// Device orientation `[alpha, beta, gamma]` in degrees.
    #[serde(default)]
    pub orientation: Option<[f32; 3]>,
}

impl Default for RendererSettings {
    fn default() -> Self {
        Self {
            pixel_ratio: default_pixel_ratio(),
            frame_interval: default_frame_interval(),
            frames: default_frames(),
            power: PowerSetting::default(),
            orientation: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Canvas,
}

/// Pixels registered under a selector so texture sources can reference them
/// by name instead of by file.
#[derive(Debug, Clone, Deserialize)]
pub struct MediaConfig {
    pub selector: String,
    pub path: PathBuf,
    #[serde(default = "default_media_kind")]
    pub kind: MediaKind,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SurfaceConfig {
    pub name: String,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub left: f32,
    #[serde(default)]
    pub top: f32,
    pub fragment: PathBuf,
    #[serde(default)]
    pub vertex: Option<PathBuf>,
    #[serde(default)]
    pub shadertoy: bool,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub textures: Vec<TextureConfig>,
    #[serde(default)]
    pub pointer: Vec<PointerScript>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub prevbuffer: bool,
    pub fragment: PathBuf,
    #[serde(default)]
    pub vertex: Option<PathBuf>,
    /// Inherits the parent's dialect when unset.
    #[serde(default)]
    pub shadertoy: Option<bool>,
    /// Load sources on a worker thread and attach on a later frame.
    #[serde(default)]
    pub deferred: bool,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub textures: Vec<TextureConfig>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WrapSetting {
    #[default]
    Repeat,
    ClampToEdge,
    MirroredRepeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterSetting {
    Nearest,
    Linear,
    NearestMipmapNearest,
    LinearMipmapNearest,
    NearestMipmapLinear,
    LinearMipmapLinear,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TextureConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub src: String,
    #[serde(default)]
    pub camera: bool,
    #[serde(default)]
    pub wrap_s: WrapSetting,
    #[serde(default)]
    pub wrap_t: WrapSetting,
    #[serde(default = "default_min_filter")]
    pub min_filter: FilterSetting,
    #[serde(default = "default_mag_filter")]
    pub mag_filter: FilterSetting,
    #[serde(default)]
    pub force_update: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointerAction {
    Down,
    Move,
    Up,
}

/// Pointer input replayed before the given frame renders. Coordinates are
/// viewport pixels with a top-left origin.
#[derive(Debug, Clone, Deserialize)]
pub struct PointerScript {
    pub frame: u32,
    pub action: PointerAction,
    #[serde(default)]
    pub x: f32,
    #[serde(default)]
    pub y: f32,
}

fn default_pixel_ratio() -> f32 {
    1.0
}

fn default_frame_interval() -> Duration {
    Duration::from_millis(16)
}

fn default_frames() -> u32 {
    60
}

fn default_media_kind() -> MediaKind {
    MediaKind::Image
}

fn default_min_filter() -> FilterSetting {
    FilterSetting::LinearMipmapLinear
}

fn default_mag_filter() -> FilterSetting {
    FilterSetting::Linear
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    struct Visitor;
    impl<'de> de::Visitor<'de> for Visitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a duration as number of seconds or human-readable string")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            parse_duration(v).map_err(E::custom)
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Duration::from_secs(v))
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v < 0 {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Duration::from_secs(v as u64))
        }

        fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.is_nan() || v.is_sign_negative() || v.is_infinite() {
                return Err(E::custom("duration must be a finite non-negative number"));
            }
            Ok(Duration::from_secs_f64(v))
        }
    }

    deserializer.deserialize_any(Visitor)
}

/// Parses `"16ms"`-style durations or plain seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let trimmed = raw.trim();
    if let Ok(seconds) = trimmed.parse::<f64>() {
        if seconds.is_finite() && seconds >= 0.0 {
            return Ok(Duration::from_secs_f64(seconds));
        }
        return Err(format!("invalid duration '{raw}': must be non-negative"));
    }
    humantime::parse_duration(trimmed).map_err(|err| format!("invalid duration '{raw}': {err}"))
}

impl JobConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let raw: JobConfig = toml::from_str(input)?;
        raw.validate()?;
        Ok(raw)
    }

    /// Reads and validates a job file; relative paths inside it resolve
    /// against its directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&text)?;
        config.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(config)
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn surface(&self, name: &str) -> Option<&SurfaceConfig> {
        self.surfaces.iter().find(|surface| surface.name == name)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != 1 {
            return Err(ConfigError::Invalid(format!(
                "unsupported config version {}; expected 1",
                self.version
            )));
        }

        let renderer = &self.renderer;
        if !renderer.pixel_ratio.is_finite() || renderer.pixel_ratio <= 0.0 {
            return Err(ConfigError::Invalid(
                "renderer.pixel_ratio must be a positive number".into(),
            ));
        }
        if renderer.frame_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "renderer.frame_interval must be greater than zero".into(),
            ));
        }
        if renderer.frames == 0 {
            return Err(ConfigError::Invalid(
                "renderer.frames must be at least 1".into(),
            ));
        }

        let mut selectors = HashSet::new();
        for media in &self.media {
            if media.selector.trim().is_empty() {
                return Err(ConfigError::Invalid("media selector may not be empty".into()));
            }
            if !selectors.insert(media.selector.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "media selector '{}' is defined twice",
                    media.selector
                )));
            }
        }

        if self.surfaces.is_empty() {
            return Err(ConfigError::Invalid(
                "config must define at least one surface".into(),
            ));
        }

        let mut names = HashSet::new();
        for surface in &self.surfaces {
            let name = surface.name.trim();
            if name.is_empty() {
                return Err(ConfigError::Invalid("surface name may not be empty".into()));
            }
            if !names.insert(name) {
                return Err(ConfigError::Invalid(format!(
                    "surface name '{name}' is used more than once"
                )));
            }
            if surface.width == 0 || surface.height == 0 {
                return Err(ConfigError::Invalid(format!(
                    "surface '{name}' must have a positive width and height"
                )));
            }
            if !surface.left.is_finite() || !surface.top.is_finite() {
                return Err(ConfigError::Invalid(format!(
                    "surface '{name}' position must be finite"
                )));
            }
            for script in &surface.pointer {
                if !script.x.is_finite() || !script.y.is_finite() {
                    return Err(ConfigError::Invalid(format!(
                        "surface '{name}' pointer event at frame {} has a non-finite position",
                        script.frame
                    )));
                }
            }
            validate_children(&format!("surface '{name}'"), &surface.nodes, &surface.textures)?;
        }

        Ok(())
    }
}

/// Sibling nodes and textures share one namespace under their parent.
fn validate_children(
    parent: &str,
    nodes: &[NodeConfig],
    textures: &[TextureConfig],
) -> Result<(), ConfigError> {
    let mut names = HashSet::new();
    let explicit = nodes
        .iter()
        .filter_map(|node| node.name.as_deref())
        .chain(textures.iter().filter_map(|texture| texture.name.as_deref()));
    for name in explicit {
        if name.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "{parent} has a child with an empty name"
            )));
        }
        if !names.insert(name) {
            return Err(ConfigError::Invalid(format!(
                "{parent} has more than one child named '{name}'"
            )));
        }
    }

    for texture in textures {
        if texture.src.trim().is_empty() && !texture.camera {
            return Err(ConfigError::Invalid(format!(
                "{parent} has a texture without a src"
            )));
        }
    }

    for node in nodes {
        let label = match &node.name {
            Some(name) => format!("node '{name}'"),
            None => format!("unnamed node under {parent}"),
        };
        if node.deferred && (!node.nodes.is_empty() || !node.textures.is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "{label} is deferred and may not have nodes or textures of its own"
            )));
        }
        validate_children(&label, &node.nodes, &node.textures)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r##"
version = 1

[renderer]
pixel_ratio = 2.0
frame_interval = "20ms"
frames = 3
power = "high"

[[media]]
selector = "#logo"
path = "logo.png"
kind = "canvas"

[[surfaces]]
name = "main"
width = 64
height = 32
fragment = "main.frag"
shadertoy = true

[[surfaces.nodes]]
name = "layer0"
prevbuffer = true
fragment = "layer0.frag"

[[surfaces.nodes.nodes]]
fragment = "inner.frag"
deferred = true

[[surfaces.textures]]
name = "u_noise"
src = "noise.png"
wrap_s = "clamp_to_edge"
min_filter = "nearest"

[[surfaces.pointer]]
frame = 1
action = "down"
x = 4
y = 8
"##;

    #[test]
    fn parses_sample_config() {
        let config = JobConfig::from_toml_str(SAMPLE).expect("parse config");
        assert_eq!(config.renderer.frame_interval, Duration::from_millis(20));
        assert_eq!(config.renderer.power, PowerSetting::High);
        assert_eq!(config.media[0].kind, MediaKind::Canvas);

        let surface = config.surface("main").unwrap();
        assert!(surface.shadertoy);
        assert_eq!(surface.nodes[0].name.as_deref(), Some("layer0"));
        assert!(surface.nodes[0].nodes[0].deferred);
        assert_eq!(surface.nodes[0].nodes[0].shadertoy, None);

        let texture = &surface.textures[0];
        assert_eq!(texture.wrap_s, WrapSetting::ClampToEdge);
        assert_eq!(texture.wrap_t, WrapSetting::Repeat);
        assert_eq!(texture.min_filter, FilterSetting::Nearest);
        assert_eq!(texture.mag_filter, FilterSetting::Linear);
        assert_eq!(surface.pointer[0].action, PointerAction::Down);
    }

    #[test]
    fn renderer_settings_have_defaults() {
        let config = JobConfig::from_toml_str(
            r#"
version = 1

[[surfaces]]
name = "only"
width = 8
height = 8
fragment = "a.frag"
"#,
        )
        .unwrap();
        assert_eq!(config.renderer.pixel_ratio, 1.0);
        assert_eq!(config.renderer.frames, 60);
        assert_eq!(config.renderer.frame_interval, Duration::from_millis(16));
        assert_eq!(config.renderer.power, PowerSetting::Low);
    }

    #[test]
    fn durations_accept_seconds() {
        assert_eq!(parse_duration("0.5").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert!(parse_duration("-1").is_err());
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn rejects_duplicate_surface_names() {
        let err = JobConfig::from_toml_str(
            r#"
version = 1

[[surfaces]]
name = "a"
width = 8
height = 8
fragment = "a.frag"

[[surfaces]]
name = "a"
width = 8
height = 8
fragment = "b.frag"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_sibling_name_clash_between_node_and_texture() {
        let err = JobConfig::from_toml_str(
            r#"
version = 1

[[surfaces]]
name = "a"
width = 8
height = 8
fragment = "a.frag"

[[surfaces.nodes]]
name = "u_shared"
fragment = "n.frag"

[[surfaces.textures]]
name = "u_shared"
src = "t.png"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("u_shared"));
    }

    #[test]
    fn rejects_deferred_node_with_children() {
        let err = JobConfig::from_toml_str(
            r#"
version = 1

[[surfaces]]
name = "a"
width = 8
height = 8
fragment = "a.frag"

[[surfaces.nodes]]
fragment = "n.frag"
deferred = true

[[surfaces.nodes.textures]]
src = "t.png"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_zero_sizes_and_versions() {
        let zero = r#"
version = 1

[[surfaces]]
name = "a"
width = 0
height = 8
fragment = "a.frag"
"#;
        assert!(matches!(
            JobConfig::from_toml_str(zero),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            JobConfig::from_toml_str("version = 2"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            JobConfig::from_toml_str("version = 1"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn load_resolves_paths_next_to_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.toml");
        std::fs::write(
            &path,
            "version = 1\n[[surfaces]]\nname = \"a\"\nwidth = 4\nheight = 4\nfragment = \"a.frag\"\n",
        )
        .unwrap();
        let config = JobConfig::load(&path).unwrap();
        assert_eq!(
            config.resolve(&config.surfaces[0].fragment),
            dir.path().join("a.frag")
        );

        let missing = JobConfig::load(&dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Io { .. }));
    }
}
