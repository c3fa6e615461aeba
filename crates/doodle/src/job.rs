//! Turns a job description into program trees.

use std::path::Path;

use anyhow::{Context, Result};
use compositor::{
    FilterMode, GraphicsContext, MediaElement, MediaOptions, MediaRegistry, NodeFuture,
    ProgramSource, ShaderProgram, TextureParameters, WrapMode,
};
use doodleconfig::{
    FilterSetting, JobConfig, MediaKind, NodeConfig, SurfaceConfig, TextureConfig, WrapSetting,
};

/// Registry holding every `[[media]]` entry under its selector.
pub fn media_registry(config: &JobConfig) -> Result<MediaRegistry> {
    let mut registry = MediaRegistry::new(&config.base_dir);
    for media in &config.media {
        let path = config.resolve(&media.path);
        let image = image::open(&path)
            .with_context(|| {
                format!(
                    "failed to load media '{}' from {}",
                    media.selector,
                    path.display()
                )
            })?
            .to_rgba8();
        let element = match media.kind {
            MediaKind::Image => MediaElement::Image(image),
            MediaKind::Canvas => MediaElement::Canvas(image),
        };
        registry.insert(media.selector.clone(), element);
    }
    Ok(registry)
}

/// Builds a surface's root program with all of its nodes and textures.
pub fn build_surface_program(
    gl: &mut dyn GraphicsContext,
    config: &JobConfig,
    surface: &SurfaceConfig,
    registry: &mut MediaRegistry,
) -> Result<ShaderProgram> {
    let fragment = config.resolve(&surface.fragment);
    let vertex = surface.vertex.as_ref().map(|path| config.resolve(path));
    let source = read_source(&fragment, vertex.as_deref(), surface.shadertoy)?;
    let mut program = ShaderProgram::new(gl, &source)
        .with_context(|| format!("failed to create program for surface '{}'", surface.name))?;
    if let Err(err) = attach_children(
        gl,
        config,
        &mut program,
        &surface.nodes,
        &surface.textures,
        surface.shadertoy,
        registry,
    ) {
        program.dispose(gl);
        return Err(err);
    }
    Ok(program)
}

fn attach_children(
    gl: &mut dyn GraphicsContext,
    config: &JobConfig,
    parent: &mut ShaderProgram,
    nodes: &[NodeConfig],
    textures: &[TextureConfig],
    shadertoy: bool,
    registry: &mut MediaRegistry,
) -> Result<()> {
    for node in nodes {
        let dialect = node.shadertoy.unwrap_or(shadertoy);
        let fragment = config.resolve(&node.fragment);
        let vertex = node.vertex.as_ref().map(|path| config.resolve(path));

        if node.deferred {
            let future = NodeFuture::spawn(move || {
                read_source(&fragment, vertex.as_deref(), dialect).map_err(|err| format!("{err:#}"))
            });
            let name = parent.add_pending_node(node.name.as_deref(), future, node.prevbuffer)?;
            tracing::debug!(node = %name, "deferred node scheduled");
            continue;
        }

        let source = read_source(&fragment, vertex.as_deref(), dialect)?;
        let mut child = ShaderProgram::new(gl, &source)
            .with_context(|| format!("failed to create node from {}", fragment.display()))?;
        if let Err(err) = attach_children(
            gl,
            config,
            &mut child,
            &node.nodes,
            &node.textures,
            dialect,
            registry,
        ) {
            child.dispose(gl);
            return Err(err);
        }
        let name = parent.add_node(gl, child, node.name.as_deref(), node.prevbuffer)?;
        tracing::debug!(node = %name, feedback = node.prevbuffer, "node attached");
    }

    for texture in textures {
        // Unresolvable sources have already been reported; the rest of the
        // graph still renders.
        let Some(input) = registry.resolve(&texture.src, texture.camera) else {
            continue;
        };
        let name = parent.add_texture(gl, texture.name.as_deref(), input, media_options(texture))?;
        tracing::debug!(texture = %name, src = %texture.src, "texture attached");
    }
    Ok(())
}

fn read_source(fragment: &Path, vertex: Option<&Path>, shadertoy: bool) -> Result<ProgramSource> {
    let mut source = ProgramSource::read(fragment, shadertoy)
        .with_context(|| format!("failed to read fragment shader {}", fragment.display()))?;
    if let Some(vertex) = vertex {
        let text = std::fs::read_to_string(vertex)
            .with_context(|| format!("failed to read vertex shader {}", vertex.display()))?;
        source = source.with_vertex(text);
    }
    Ok(source)
}

pub fn media_options(texture: &TextureConfig) -> MediaOptions {
    MediaOptions {
        parameters: TextureParameters {
            wrap_s: wrap_mode(texture.wrap_s),
            wrap_t: wrap_mode(texture.wrap_t),
            min_filter: filter_mode(texture.min_filter),
            mag_filter: filter_mode(texture.mag_filter),
        },
        force_update: texture.force_update,
    }
}

fn wrap_mode(setting: WrapSetting) -> WrapMode {
    match setting {
        WrapSetting::Repeat => WrapMode::Repeat,
        WrapSetting::ClampToEdge => WrapMode::ClampToEdge,
        WrapSetting::MirroredRepeat => WrapMode::MirroredRepeat,
    }
}

fn filter_mode(setting: FilterSetting) -> FilterMode {
    match setting {
        FilterSetting::Nearest => FilterMode::Nearest,
        FilterSetting::Linear => FilterMode::Linear,
        FilterSetting::NearestMipmapNearest => FilterMode::NearestMipmapNearest,
        FilterSetting::LinearMipmapNearest => FilterMode::LinearMipmapNearest,
        FilterSetting::NearestMipmapLinear => FilterMode::NearestMipmapLinear,
        FilterSetting::LinearMipmapLinear => FilterMode::LinearMipmapLinear,
    }
}
