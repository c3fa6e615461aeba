use std::cell::Cell;
use std::path::Path;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use compositor::headless::HeadlessContext;
use compositor::{
    GpuPowerPreference, GraphicsContext, LayoutRect, PointerEvent, Renderer, RendererOptions,
    Surface, SurfaceId, TickOutcome, WgpuContext, WgpuOptions,
};
use doodleconfig::{JobConfig, PointerAction, PowerSetting};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use crate::cli::{Backend, Cli};
use crate::job;
use crate::output::PngSequence;

pub fn initialise_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[derive(Debug, Serialize)]
struct RunSummary {
    backend: &'static str,
    frames: u32,
    canvas: [u32; 2],
    surfaces: Vec<SurfaceSummary>,
}

#[derive(Debug, Serialize)]
struct SurfaceSummary {
    name: String,
    frames_written: u32,
}

struct ActiveSurface {
    id: SurfaceId,
    name: String,
    written: Rc<Cell<u32>>,
}

pub fn run(cli: Cli) -> Result<()> {
    let mut config = JobConfig::load(&cli.job)
        .with_context(|| format!("failed to load render job {}", cli.job.display()))?;
    apply_overrides(&mut config, &cli)?;
    std::fs::create_dir_all(&cli.output)
        .with_context(|| format!("failed to create output directory {}", cli.output.display()))?;

    tracing::info!(
        job = %cli.job.display(),
        backend = cli.backend.label(),
        frames = config.renderer.frames,
        surfaces = config.surfaces.len(),
        "starting render job"
    );

    let summary = match cli.backend {
        Backend::Wgpu => {
            let power = match config.renderer.power {
                PowerSetting::Low => GpuPowerPreference::Low,
                PowerSetting::High => GpuPowerPreference::High,
            };
            let context = WgpuContext::new(WgpuOptions {
                power,
                ..WgpuOptions::default()
            })
            .context("failed to initialise the wgpu backend")?;
            drive(context, &config, &cli)?
        }
        Backend::Headless => drive(HeadlessContext::new().without_recording(), &config, &cli)?,
    };

    for surface in &summary.surfaces {
        tracing::info!(surface = %surface.name, frames = surface.frames_written, "surface finished");
    }
    if let Some(path) = &cli.summary {
        write_summary(path, &summary)?;
    }
    Ok(())
}

fn apply_overrides(config: &mut JobConfig, cli: &Cli) -> Result<()> {
    if let Some(frames) = cli.frames {
        config.renderer.frames = frames;
    }
    if let Some(interval) = cli.frame_interval {
        config.renderer.frame_interval = interval;
    }
    if let Some(ratio) = cli.pixel_ratio {
        config.renderer.pixel_ratio = ratio;
    }
    config
        .validate()
        .context("command-line overrides produce an invalid job")
}

fn drive<C: GraphicsContext>(context: C, config: &JobConfig, cli: &Cli) -> Result<RunSummary> {
    let mut renderer = Renderer::new(
        context,
        RendererOptions {
            pixel_ratio: config.renderer.pixel_ratio,
        },
    );
    if let Some([alpha, beta, gamma]) = config.renderer.orientation {
        renderer.set_orientation(alpha, beta, gamma);
    }

    let viewport = config.surfaces.iter().fold((0.0f32, 0.0f32), |(w, h), surface| {
        (
            w.max(surface.left + surface.width as f32),
            h.max(surface.top + surface.height as f32),
        )
    });

    let mut registry = job::media_registry(config)?;
    let mut active = Vec::new();
    for surface_config in &config.surfaces {
        let layout = LayoutRect::new(
            surface_config.left,
            surface_config.top,
            surface_config.width as f32,
            surface_config.height as f32,
        );
        let (sequence, written) =
            PngSequence::new(cli.output.clone(), &surface_config.name, layout, viewport);
        let mut surface = Surface::new(surface_config.name.clone(), Box::new(sequence));
        surface.force_size(surface_config.width, surface_config.height);

        let program = job::build_surface_program(
            renderer.context_mut(),
            config,
            surface_config,
            &mut registry,
        )?;
        let id = renderer.register_surface(surface);
        renderer
            .set_program(id, program)
            .with_context(|| format!("failed to attach program to surface '{}'", surface_config.name))?;
        active.push(ActiveSurface {
            id,
            name: surface_config.name.clone(),
            written,
        });
    }

    let frames = config.renderer.frames;
    let interval = config.renderer.frame_interval;
    let start = Instant::now();
    for frame in 0..frames {
        for (surface, surface_config) in active.iter().zip(&config.surfaces) {
            for script in surface_config.pointer.iter().filter(|s| s.frame == frame) {
                let event = match script.action {
                    PointerAction::Down => PointerEvent::Down {
                        x: script.x,
                        y: script.y,
                    },
                    PointerAction::Move => PointerEvent::Move {
                        x: script.x,
                        y: script.y,
                    },
                    PointerAction::Up => PointerEvent::Up,
                };
                renderer.pointer(surface.id, event);
            }
        }

        let now = frame_time(start, interval, frame, cli.realtime)?;
        match renderer
            .tick(now)
            .with_context(|| format!("frame {frame} failed"))?
        {
            TickOutcome::Idle => break,
            TickOutcome::Rendered { surfaces } => {
                tracing::debug!(frame, surfaces, "tick rendered");
            }
        }
    }

    let (width, height) = renderer.canvas_size();
    let summary = RunSummary {
        backend: cli.backend.label(),
        frames,
        canvas: [width, height],
        surfaces: active
            .iter()
            .map(|surface| SurfaceSummary {
                name: surface.name.clone(),
                frames_written: surface.written.get(),
            })
            .collect(),
    };
    drop(renderer.dispose());
    Ok(summary)
}

/// Virtual clock by default; with `realtime` the loop sleeps until the
/// frame is due.
fn frame_time(start: Instant, interval: Duration, frame: u32, realtime: bool) -> Result<Instant> {
    let due = interval
        .checked_mul(frame)
        .and_then(|offset| start.checked_add(offset))
        .with_context(|| format!("frame {frame} at {interval:?} intervals overflows the clock"))?;
    if realtime {
        let now = Instant::now();
        if due > now {
            thread::sleep(due - now);
        }
        Ok(Instant::now())
    } else {
        Ok(due)
    }
}

fn write_summary(path: &Path, summary: &RunSummary) -> Result<()> {
    let json = serde_json::to_string_pretty(summary).context("failed to encode run summary")?;
    std::fs::write(path, json)
        .with_context(|| format!("failed to write run summary {}", path.display()))
}
