use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "doodle",
    author,
    version,
    about = "Render GLSL shader graphs offscreen to PNG frames"
)]
pub struct Cli {
    /// Render job description (TOML).
    #[arg(value_name = "JOB")]
    pub job: PathBuf,

    /// Directory the PNG frames are written to.
    #[arg(long, value_name = "DIR", env = "DOODLE_OUTPUT", default_value = "frames")]
    pub output: PathBuf,

    /// Graphics backend: `wgpu` renders on the GPU, `headless` records calls
    /// without one.
    #[arg(long, value_enum, env = "DOODLE_BACKEND", default_value_t = Backend::Wgpu)]
    pub backend: Backend,

    /// Number of animation ticks to render (overrides `renderer.frames`).
    #[arg(long, value_name = "COUNT")]
    pub frames: Option<u32>,

    /// Time between ticks, e.g. `16ms` or `0.5` (overrides `renderer.frame_interval`).
    #[arg(long, value_name = "DURATION", value_parser = parse_interval)]
    pub frame_interval: Option<Duration>,

    /// Physical pixels per logical pixel (overrides `renderer.pixel_ratio`).
    #[arg(long, value_name = "RATIO")]
    pub pixel_ratio: Option<f32>,

    /// Pace ticks against the wall clock instead of a virtual one.
    #[arg(long)]
    pub realtime: bool,

    /// Write a JSON summary of the run to this path.
    #[arg(long, value_name = "PATH")]
    pub summary: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    Wgpu,
    Headless,
}

impl Backend {
    pub fn label(self) -> &'static str {
        match self {
            Backend::Wgpu => "wgpu",
            Backend::Headless => "headless",
        }
    }
}

pub fn parse() -> Cli {
    Cli::parse()
}

pub fn parse_interval(value: &str) -> Result<Duration, String> {
    let interval = doodleconfig::parse_duration(value)?;
    if interval.is_zero() {
        return Err("frame interval must be greater than zero".to_string());
    }
    Ok(interval)
}
