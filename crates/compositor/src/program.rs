//! The render-graph node.

use std::path::Path;
use std::thread;

use crossbeam_channel::{Receiver, TryRecvError};

use crate::compile::{self, DEFAULT_VERTEX_SHADER, DEFAULT_VERTICES, FEEDBACK_UNIFORM};
use crate::context::{GraphicsContext, ProgramId, TextureId};
use crate::error::CompositorError;
use crate::framebuffer::FramebufferPair;
use crate::sources::{
    AudioTexture, MediaInput, MediaOptions, MediaTexture, SourceFrame, SpectrumAnalyser,
    TextureSource,
};
use crate::texture::TextureUnitAllocator;
use crate::uniforms::{UniformCache, UniformState, UniformValue};

/// Shader sources and geometry for one node.
#[derive(Clone, Debug, PartialEq)]
pub struct ProgramSource {
    pub vertex: String,
    pub fragment: String,
    /// Flat `[x0, y0, x1, y1, ...]` positions.
    pub vertices: Vec<f32>,
    /// Fragment is written against `mainImage` and the `i*` uniform names.
    pub shadertoy: bool,
}

impl ProgramSource {
    /// Fragment shader over the default full-screen quad.
    pub fn fragment(fragment: impl Into<String>) -> Self {
        Self {
            vertex: DEFAULT_VERTEX_SHADER.to_string(),
            fragment: fragment.into(),
            vertices: DEFAULT_VERTICES.to_vec(),
            shadertoy: false,
        }
    }

    pub fn shadertoy(fragment: impl Into<String>) -> Self {
        Self {
            shadertoy: true,
            ..Self::fragment(fragment)
        }
    }

    pub fn with_vertex(mut self, vertex: impl Into<String>) -> Self {
        self.vertex = vertex.into();
        self
    }

    pub fn with_vertices(mut self, vertices: Vec<f32>) -> Self {
        self.vertices = vertices;
        self
    }

    /// Reads a fragment shader from disk.
    pub fn read(path: &Path, shadertoy: bool) -> std::io::Result<Self> {
        let fragment = std::fs::read_to_string(path)?;
        let mut source = Self::fragment(fragment);
        source.shadertoy = shadertoy;
        Ok(source)
    }
}

/// Program sources produced off the render loop.
pub enum NodeFuture {
    Ready(ProgramSource),
    Threaded {
        receiver: Receiver<Result<ProgramSource, String>>,
    },
}

impl NodeFuture {
    /// Runs `load` on a worker thread.
    pub fn spawn<F>(load: F) -> Self
    where
        F: FnOnce() -> Result<ProgramSource, String> + Send + 'static,
    {
        let (sender, receiver) = crossbeam_channel::bounded(1);
        thread::spawn(move || {
            let _ = sender.send(load());
        });
        NodeFuture::Threaded { receiver }
    }

    fn poll(&mut self) -> Option<Result<ProgramSource, String>> {
        match self {
            NodeFuture::Ready(source) => Some(Ok(source.clone())),
            NodeFuture::Threaded { receiver } => match receiver.try_recv() {
                Ok(result) => Some(result),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Disconnected) => {
                    Some(Err("node loader disconnected before returning a result".into()))
                }
            },
        }
    }
}

enum ChildSlot {
    Ready(Box<ShaderProgram>),
    Pending { future: NodeFuture, feedback: bool },
    Failed,
}

struct ChildNode {
    name: String,
    unit: u32,
    slot: ChildSlot,
}

impl ChildNode {
    fn node(&self) -> Option<&ShaderProgram> {
        match &self.slot {
            ChildSlot::Ready(node) => Some(node),
            _ => None,
        }
    }

    /// Instantiates a finished deferred child. Failures leave the slot
    /// permanently empty.
    fn poll_pending(&mut self, gl: &mut dyn GraphicsContext) {
        let ChildSlot::Pending { future, feedback } = &mut self.slot else {
            return;
        };
        let feedback = *feedback;
        let Some(loaded) = future.poll() else {
            return;
        };
        self.slot = match loaded.map_err(|reason| CompositorError::Source {
            src: self.name.clone(),
            reason,
        }) {
            Ok(source) => match build_child(gl, &source, feedback) {
                Ok(node) => {
                    tracing::debug!(node = %self.name, unit = self.unit, "deferred node ready");
                    ChildSlot::Ready(Box::new(node))
                }
                Err(err) => {
                    tracing::warn!(node = %self.name, error = %err, "failed to create deferred node");
                    ChildSlot::Failed
                }
            },
            Err(err) => {
                tracing::warn!(node = %self.name, error = %err, "failed to load deferred node");
                ChildSlot::Failed
            }
        };
    }

    fn dispose(self, gl: &mut dyn GraphicsContext) {
        if let ChildSlot::Ready(node) = self.slot {
            node.dispose(gl);
        }
    }
}

fn build_child(
    gl: &mut dyn GraphicsContext,
    source: &ProgramSource,
    feedback: bool,
) -> Result<ShaderProgram, CompositorError> {
    let mut node = ShaderProgram::new(gl, source)?;
    if let Err(err) = node.to_fbo(gl, feedback) {
        node.dispose(gl);
        return Err(err);
    }
    Ok(node)
}

/// Offscreen output of a node that is itself a child.
struct NodeOutput {
    framebuffers: FramebufferPair,
    feedback_unit: Option<u32>,
}

#[derive(Debug, Default)]
struct NameCounters {
    node: u32,
    texture: u32,
    audio: u32,
}

/// One compiled program with its children, texture sources and, when it is
/// a child itself, its offscreen targets.
pub struct ShaderProgram {
    handle: Option<ProgramId>,
    uniforms: UniformCache,
    shadertoy: bool,
    vertex_count: u32,
    units: TextureUnitAllocator,
    children: Vec<ChildNode>,
    sources: Vec<Box<dyn TextureSource>>,
    output: Option<NodeOutput>,
    rendered: bool,
    counters: NameCounters,
}

impl ShaderProgram {
    /// Compiles and links a node. A compile or link failure is reported and
    /// yields a node that clears its target without drawing.
    pub fn new(gl: &mut dyn GraphicsContext, source: &ProgramSource) -> Result<Self, CompositorError> {
        let fragment = compile::prepare_fragment_source(&source.fragment, source.shadertoy);
        let handle = match gl.compile_program(&source.vertex, &fragment) {
            Ok(handle) => Some(handle),
            Err(err) => {
                tracing::warn!(stage = %err.stage, log = %err.log, "shader program failed to build");
                None
            }
        };
        let mut uniforms = UniformCache::new();
        if let Some(handle) = handle {
            if let Err(err) = gl.upload_vertices(handle, &source.vertices) {
                gl.delete_program(handle);
                return Err(err);
            }
            uniforms = UniformCache::for_program(&*gl, handle);
        }
        Ok(Self {
            handle,
            uniforms,
            shadertoy: source.shadertoy,
            vertex_count: (source.vertices.len() / 2) as u32,
            units: TextureUnitAllocator::new(),
            children: Vec::new(),
            sources: Vec::new(),
            output: None,
            rendered: false,
            counters: NameCounters::default(),
        })
    }

    pub fn handle(&self) -> Option<ProgramId> {
        self.handle
    }

    pub fn is_valid(&self) -> bool {
        self.handle.is_some()
    }

    pub fn is_shadertoy(&self) -> bool {
        self.shadertoy
    }

    pub fn has_rendered(&self) -> bool {
        self.rendered
    }

    /// Hands out the next texture unit of this program. Units can only be
    /// reserved before the first render.
    pub fn reserve_texture_unit(&mut self) -> Result<u32, CompositorError> {
        if self.rendered {
            return Err(CompositorError::GraphFrozen);
        }
        Ok(self.units.next_unit())
    }

    pub fn allocated_units(&self) -> u32 {
        self.units.allocated()
    }

    /// Gives this node offscreen targets so a parent can sample it. With
    /// `feedback` the node also samples its own previous frame through
    /// `u_prevbuffer`.
    pub fn to_fbo(&mut self, gl: &mut dyn GraphicsContext, feedback: bool) -> Result<(), CompositorError> {
        if self.output.is_some() {
            return Ok(());
        }
        let feedback_unit = if feedback {
            Some(self.reserve_texture_unit()?)
        } else {
            None
        };
        let framebuffers = FramebufferPair::new(gl, feedback)?;
        self.output = Some(NodeOutput {
            framebuffers,
            feedback_unit,
        });
        Ok(())
    }

    /// Texture holding the node's latest output.
    pub fn output_texture(&self) -> Option<TextureId> {
        self.output
            .as_ref()
            .map(|output| output.framebuffers.current().texture())
    }

    pub fn feedback_unit(&self) -> Option<u32> {
        self.output.as_ref().and_then(|output| output.feedback_unit)
    }

    fn name_taken(&self, name: &str) -> bool {
        self.children.iter().any(|child| child.name == name)
            || self.sources.iter().any(|source| source.name() == name)
    }

    fn claim_name(&mut self, name: Option<&str>, prefix: &str) -> Result<String, CompositorError> {
        if let Some(name) = name {
            if self.name_taken(name) {
                return Err(CompositorError::DuplicateNode(name.to_string()));
            }
            return Ok(name.to_string());
        }
        loop {
            let counter = match prefix {
                "u_texture" => &mut self.counters.texture,
                "u_audio" => &mut self.counters.audio,
                _ => &mut self.counters.node,
            };
            let candidate = format!("{prefix}{counter}");
            *counter += 1;
            if !self.name_taken(&candidate) {
                return Ok(candidate);
            }
        }
    }

    /// Adopts `child` as a sampler of this program and returns the name its
    /// output is published under.
    pub fn add_node(
        &mut self,
        gl: &mut dyn GraphicsContext,
        mut child: ShaderProgram,
        name: Option<&str>,
        feedback: bool,
    ) -> Result<String, CompositorError> {
        let claimed = if self.rendered {
            Err(CompositorError::GraphFrozen)
        } else {
            self.claim_name(name, "u_node")
        };
        let name = match claimed {
            Ok(name) => name,
            Err(err) => {
                child.dispose(gl);
                return Err(err);
            }
        };
        if let Err(err) = child.to_fbo(gl, feedback) {
            child.dispose(gl);
            return Err(err);
        }
        let unit = self.units.next_unit();
        tracing::debug!(node = %name, unit, feedback, "child node added");
        self.children.push(ChildNode {
            name: name.clone(),
            unit,
            slot: ChildSlot::Ready(Box::new(child)),
        });
        Ok(name)
    }

    /// Reserves a child's name and unit now and builds it once `future`
    /// resolves. Until then the child contributes nothing.
    pub fn add_pending_node(
        &mut self,
        name: Option<&str>,
        future: NodeFuture,
        feedback: bool,
    ) -> Result<String, CompositorError> {
        let name = self.claim_name(name, "u_node")?;
        let unit = self.reserve_texture_unit()?;
        self.children.push(ChildNode {
            name: name.clone(),
            unit,
            slot: ChildSlot::Pending { future, feedback },
        });
        Ok(name)
    }

    /// Disposes a child and its subtree. Its unit is not handed out again.
    pub fn remove_node(&mut self, gl: &mut dyn GraphicsContext, name: &str) -> bool {
        let Some(index) = self.children.iter().position(|child| child.name == name) else {
            return false;
        };
        self.children.remove(index).dispose(gl);
        true
    }

    pub fn child(&self, name: &str) -> Option<&ShaderProgram> {
        self.children
            .iter()
            .find(|child| child.name == name)
            .and_then(ChildNode::node)
    }

    /// Unit a child's output is bound to while this program draws.
    pub fn child_unit(&self, name: &str) -> Option<u32> {
        self.children
            .iter()
            .find(|child| child.name == name)
            .map(|child| child.unit)
    }

    pub fn child_names(&self) -> impl Iterator<Item = &str> {
        self.children.iter().map(|child| child.name.as_str())
    }

    /// Adds a source that already holds a unit from
    /// [`reserve_texture_unit`](Self::reserve_texture_unit).
    pub fn add_source(&mut self, source: Box<dyn TextureSource>) -> Result<(), CompositorError> {
        if self.name_taken(source.name()) {
            return Err(CompositorError::DuplicateNode(source.name().to_string()));
        }
        self.sources.push(source);
        Ok(())
    }

    /// Adds an image, canvas, video or camera texture.
    pub fn add_texture(
        &mut self,
        gl: &mut dyn GraphicsContext,
        name: Option<&str>,
        input: MediaInput,
        options: MediaOptions,
    ) -> Result<String, CompositorError> {
        let name = self.claim_name(name, "u_texture")?;
        let unit = self.reserve_texture_unit()?;
        let texture = MediaTexture::new(gl, unit, name.clone(), input, options)?;
        self.sources.push(Box::new(texture));
        Ok(name)
    }

    pub fn add_audio(
        &mut self,
        gl: &mut dyn GraphicsContext,
        name: Option<&str>,
        analyser: Box<dyn SpectrumAnalyser>,
    ) -> Result<String, CompositorError> {
        let name = self.claim_name(name, "u_audio")?;
        let unit = self.reserve_texture_unit()?;
        let audio = AudioTexture::new(gl, unit, name.clone(), analyser)?;
        self.sources.push(Box::new(audio));
        Ok(name)
    }

    /// Renders children, then this program into its own targets (when it is a
    /// child) or into the currently selected canvas region.
    pub fn render(
        &mut self,
        gl: &mut dyn GraphicsContext,
        width: u32,
        height: u32,
        uniforms: &[UniformState],
    ) -> Result<(), CompositorError> {
        for child in &mut self.children {
            child.poll_pending(gl);
            if let ChildSlot::Ready(node) = &mut child.slot {
                if let Err(err) = node.render(gl, width, height, uniforms) {
                    tracing::warn!(node = %child.name, error = %err, "child node failed to render");
                }
            }
        }

        match self.output.as_mut() {
            Some(output) => output.framebuffers.begin_frame(gl, width, height)?,
            None => {
                gl.bind_framebuffer(None);
                gl.viewport(0, 0, width, height);
            }
        }
        gl.clear();
        self.rendered = true;

        let Some(handle) = self.handle else {
            return Ok(());
        };
        gl.use_program(Some(handle));
        self.update(gl, uniforms)?;
        gl.draw_arrays(0, self.vertex_count);
        Ok(())
    }

    fn update(&mut self, gl: &mut dyn GraphicsContext, uniforms: &[UniformState]) -> Result<(), CompositorError> {
        for state in uniforms {
            self.uniforms.write(gl, state.name(self.shadertoy), state.value)?;
        }

        for source in &mut self.sources {
            let mut frame = SourceFrame::new(gl, &mut self.uniforms);
            if let Err(err) = source.update(&mut frame) {
                tracing::warn!(source = source.name(), error = %err, "texture source update failed");
            }
        }

        if let Some(output) = &self.output {
            if let (Some(unit), Some(previous)) = (output.feedback_unit, output.framebuffers.previous()) {
                self.uniforms
                    .write(gl, FEEDBACK_UNIFORM, UniformValue::Int(unit as i32))?;
                gl.bind_texture(unit, Some(previous.texture()));
                previous.prepare_for_sampling(gl);
            }
        }

        for child in &self.children {
            self.uniforms
                .write(gl, &child.name, UniformValue::Int(child.unit as i32))?;
            let target = child
                .node()
                .and_then(|node| node.output.as_ref())
                .map(|output| output.framebuffers.current());
            match target {
                Some(target) => {
                    gl.bind_texture(child.unit, Some(target.texture()));
                    target.prepare_for_sampling(gl);
                }
                None => gl.bind_texture(child.unit, None),
            }
        }
        Ok(())
    }

    /// Releases the program, its sources and targets, and every descendant.
    pub fn dispose(self, gl: &mut dyn GraphicsContext) {
        for child in self.children {
            child.dispose(gl);
        }
        for source in self.sources {
            source.dispose(gl);
        }
        if let Some(output) = self.output {
            output.framebuffers.dispose(gl);
        }
        if let Some(handle) = self.handle {
            gl.delete_program(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use image::RgbaImage;

    use super::*;
    use crate::headless::{Call, HeadlessContext};
    use crate::sources::SourceKind;

    const PLAIN: &str = "void main() { gl_FragColor = vec4(1.0); }";

    fn sampler(name: &str) -> ProgramSource {
        ProgramSource::fragment(format!(
            "uniform sampler2D {name};\nvoid main() {{ gl_FragColor = texture2D({name}, vec2(0.5)); }}"
        ))
    }

    fn globals() -> Vec<UniformState> {
        crate::uniforms::GlobalUniformState::new().uniforms().to_vec()
    }

    fn draw_position(gl: &HeadlessContext, program: Option<ProgramId>) -> Option<usize> {
        gl.calls()
            .iter()
            .position(|call| matches!(call, Call::Draw { program: drawn, .. } if *drawn == program))
    }

    #[test]
    fn child_renders_before_parent_and_is_sampled_at_its_unit() {
        let mut gl = HeadlessContext::new();
        let mut root = ShaderProgram::new(&mut gl, &sampler("layer0")).unwrap();
        let child = ShaderProgram::new(&mut gl, &ProgramSource::fragment(PLAIN)).unwrap();
        let child_handle = child.handle();
        let name = root.add_node(&mut gl, child, Some("layer0"), false).unwrap();
        assert_eq!(name, "layer0");
        let unit = root.child_unit("layer0").unwrap();
        let output = root.child("layer0").unwrap().output_texture().unwrap();

        gl.clear_calls();
        root.render(&mut gl, 64, 32, &globals()).unwrap();

        let child_draw = draw_position(&gl, child_handle).unwrap();
        let root_draw = draw_position(&gl, root.handle()).unwrap();
        assert!(child_draw < root_draw);
        assert_eq!(
            gl.last_uniform_of(root.handle().unwrap(), "layer0"),
            Some(UniformValue::Int(unit as i32))
        );
        let root_record = &gl.draws()[1];
        assert_eq!(root_record.target, None);
        assert_eq!(root_record.textures.get(&unit), Some(&output));
        assert_eq!(gl.texture_size(output), Some((64, 32)));
    }

    #[test]
    fn feedback_alternates_previous_buffer() {
        let mut gl = HeadlessContext::new();
        let mut root = ShaderProgram::new(&mut gl, &sampler("trail")).unwrap();
        let child = ShaderProgram::new(&mut gl, &sampler(FEEDBACK_UNIFORM)).unwrap();
        let child_handle = child.handle().unwrap();
        root.add_node(&mut gl, child, Some("trail"), true).unwrap();
        let feedback_unit = root.child("trail").unwrap().feedback_unit().unwrap();

        let mut targets = Vec::new();
        let mut sampled = Vec::new();
        let mut feedback_writes = Vec::new();
        for frame in 0..3 {
            gl.clear_calls();
            root.render(&mut gl, 8, 8, &globals()).unwrap();
            let record = gl
                .draws()
                .iter()
                .find(|draw| draw.program == Some(child_handle))
                .unwrap();
            targets.push(record.target.unwrap());
            sampled.push(record.textures[&feedback_unit]);
            if frame == 0 {
                assert_eq!(
                    gl.last_uniform_of(child_handle, FEEDBACK_UNIFORM),
                    Some(UniformValue::Int(feedback_unit as i32))
                );
            }
            feedback_writes.push(gl.uniform_writes(FEEDBACK_UNIFORM));
        }
        assert_ne!(targets[0], targets[1]);
        assert_eq!(targets[0], targets[2]);
        assert_ne!(sampled[0], sampled[1]);
        assert_eq!(sampled[0], sampled[2]);
        // The unit never changes, so only the first frame writes it.
        assert_eq!(feedback_writes, [1, 0, 0]);
    }

    #[test]
    fn units_are_unique_across_added_and_removed_children() {
        let mut gl = HeadlessContext::new();
        let mut root = ShaderProgram::new(&mut gl, &ProgramSource::fragment(PLAIN)).unwrap();
        let mut units = Vec::new();
        for _ in 0..3 {
            let child = ShaderProgram::new(&mut gl, &ProgramSource::fragment(PLAIN)).unwrap();
            let name = root.add_node(&mut gl, child, None, false).unwrap();
            units.push(root.child_unit(&name).unwrap());
        }
        assert!(root.remove_node(&mut gl, "u_node1"));
        let child = ShaderProgram::new(&mut gl, &ProgramSource::fragment(PLAIN)).unwrap();
        let name = root.add_node(&mut gl, child, None, false).unwrap();
        units.push(root.child_unit(&name).unwrap());
        assert_eq!(units, vec![0, 1, 2, 3]);
        assert_eq!(name, "u_node3");
        assert_eq!(root.allocated_units(), 4);
    }

    #[test]
    fn unnamed_children_skip_taken_names() {
        let mut gl = HeadlessContext::new();
        let mut root = ShaderProgram::new(&mut gl, &ProgramSource::fragment(PLAIN)).unwrap();
        let named = ShaderProgram::new(&mut gl, &ProgramSource::fragment(PLAIN)).unwrap();
        root.add_node(&mut gl, named, Some("u_node0"), false).unwrap();
        let unnamed = ShaderProgram::new(&mut gl, &ProgramSource::fragment(PLAIN)).unwrap();
        assert_eq!(root.add_node(&mut gl, unnamed, None, false).unwrap(), "u_node1");

        let duplicate = ShaderProgram::new(&mut gl, &ProgramSource::fragment(PLAIN)).unwrap();
        assert!(matches!(
            root.add_node(&mut gl, duplicate, Some("u_node0"), false),
            Err(CompositorError::DuplicateNode(_))
        ));
    }

    #[test]
    fn units_cannot_be_reserved_after_first_render() {
        let mut gl = HeadlessContext::new();
        let mut root = ShaderProgram::new(&mut gl, &ProgramSource::fragment(PLAIN)).unwrap();
        root.render(&mut gl, 4, 4, &[]).unwrap();
        assert!(matches!(root.reserve_texture_unit(), Err(CompositorError::GraphFrozen)));
        let late = ShaderProgram::new(&mut gl, &ProgramSource::fragment(PLAIN)).unwrap();
        assert!(matches!(
            root.add_node(&mut gl, late, None, false),
            Err(CompositorError::GraphFrozen)
        ));
        assert_eq!(gl.live_programs(), 1);
    }

    #[test]
    fn broken_child_does_not_stop_siblings() {
        let mut gl = HeadlessContext::new();
        let mut root = ShaderProgram::new(&mut gl, &ProgramSource::fragment(PLAIN)).unwrap();
        let broken = ShaderProgram::new(&mut gl, &ProgramSource::fragment("void notmain() {}")).unwrap();
        assert!(!broken.is_valid());
        root.add_node(&mut gl, broken, Some("broken"), false).unwrap();
        let healthy = ShaderProgram::new(&mut gl, &ProgramSource::fragment(PLAIN)).unwrap();
        let healthy_handle = healthy.handle();
        root.add_node(&mut gl, healthy, Some("healthy"), false).unwrap();

        root.render(&mut gl, 4, 4, &[]).unwrap();
        assert!(draw_position(&gl, healthy_handle).is_some());
        assert!(draw_position(&gl, root.handle()).is_some());
        assert_eq!(gl.draws().len(), 2);
    }

    #[test]
    fn child_without_target_memory_is_released() {
        let mut gl = HeadlessContext::new();
        let mut root = ShaderProgram::new(&mut gl, &sampler("kept")).unwrap();
        let kept = ShaderProgram::new(&mut gl, &ProgramSource::fragment(PLAIN)).unwrap();
        let kept_handle = kept.handle();
        root.add_node(&mut gl, kept, Some("kept"), false).unwrap();
        let textures = gl.live_textures();
        let framebuffers = gl.live_framebuffers();

        gl.fail_texture_allocation(true);
        let starved = ShaderProgram::new(&mut gl, &ProgramSource::fragment(PLAIN)).unwrap();
        assert!(matches!(
            root.add_node(&mut gl, starved, Some("starved"), true),
            Err(CompositorError::Allocation { .. })
        ));
        gl.fail_texture_allocation(false);
        assert!(root.child("starved").is_none());
        assert_eq!(gl.live_programs(), 2);
        assert_eq!(gl.live_textures(), textures);
        assert_eq!(gl.live_framebuffers(), framebuffers);

        // Neither the name nor a unit was consumed.
        let retry = ShaderProgram::new(&mut gl, &ProgramSource::fragment(PLAIN)).unwrap();
        root.add_node(&mut gl, retry, Some("starved"), false).unwrap();
        assert_eq!(root.child_unit("starved"), Some(1));

        gl.clear_calls();
        root.render(&mut gl, 4, 4, &globals()).unwrap();
        assert!(draw_position(&gl, kept_handle).is_some());
        assert!(draw_position(&gl, root.handle()).is_some());
        assert_eq!(gl.draws().len(), 3);
    }

    #[test]
    fn child_failing_to_resize_does_not_stop_siblings() {
        let mut gl = HeadlessContext::new();
        let mut root = ShaderProgram::new(&mut gl, &sampler("healthy")).unwrap();
        let starved = ShaderProgram::new(&mut gl, &ProgramSource::fragment(PLAIN)).unwrap();
        let starved_handle = starved.handle();
        root.add_node(&mut gl, starved, Some("starved"), false).unwrap();
        let healthy = ShaderProgram::new(&mut gl, &ProgramSource::fragment(PLAIN)).unwrap();
        let healthy_handle = healthy.handle();
        root.add_node(&mut gl, healthy, Some("healthy"), false).unwrap();
        let output = root.child("starved").unwrap().output_texture().unwrap();
        gl.fail_texture_storage(output);

        for _ in 0..2 {
            gl.clear_calls();
            root.render(&mut gl, 4, 4, &globals()).unwrap();
            assert_eq!(draw_position(&gl, starved_handle), None);
            assert!(draw_position(&gl, healthy_handle).is_some());
            assert!(draw_position(&gl, root.handle()).is_some());
            assert_eq!(gl.draws().len(), 2);
        }
        assert!(!root.child("starved").unwrap().has_rendered());
        let healthy_output = root.child("healthy").unwrap().output_texture().unwrap();
        assert_eq!(gl.texture_size(healthy_output), Some((4, 4)));

        root.dispose(&mut gl);
        assert_eq!(gl.live_programs(), 0);
        assert_eq!(gl.live_textures(), 0);
        assert_eq!(gl.live_framebuffers(), 0);
    }

    #[test]
    fn shadertoy_programs_receive_dialect_uniforms() {
        let mut gl = HeadlessContext::new();
        let toy = "void mainImage(out vec4 c, in vec2 p) { c = vec4(iTime); }";
        let mut program = ShaderProgram::new(&mut gl, &ProgramSource::shadertoy(toy)).unwrap();
        assert!(program.is_shadertoy());
        program.render(&mut gl, 4, 4, &globals()).unwrap();
        assert_eq!(gl.last_uniform("iTime"), Some(UniformValue::Float(0.0)));
        assert_eq!(gl.uniform_writes("u_time"), 0);
    }

    #[test]
    fn pending_child_renders_once_loaded() {
        let mut gl = HeadlessContext::new();
        let mut root = ShaderProgram::new(&mut gl, &sampler("late")).unwrap();
        let (sender, receiver) = crossbeam_channel::bounded(1);
        let name = root
            .add_pending_node(Some("late"), NodeFuture::Threaded { receiver }, false)
            .unwrap();
        let unit = root.child_unit(&name).unwrap();

        root.render(&mut gl, 4, 4, &[]).unwrap();
        assert_eq!(gl.draws().len(), 1);
        assert_eq!(gl.draws()[0].textures.get(&unit), None);

        sender.send(Ok(ProgramSource::fragment(PLAIN))).unwrap();
        gl.clear_calls();
        root.render(&mut gl, 4, 4, &[]).unwrap();
        assert_eq!(gl.draws().len(), 2);
        let output = root.child("late").unwrap().output_texture();
        assert_eq!(gl.draws()[1].textures.get(&unit).copied(), output);
    }

    #[test]
    fn pending_child_loaded_on_a_worker_thread() {
        let mut gl = HeadlessContext::new();
        let mut root = ShaderProgram::new(&mut gl, &ProgramSource::fragment(PLAIN)).unwrap();
        root.add_pending_node(
            Some("worker"),
            NodeFuture::spawn(|| Ok(ProgramSource::fragment(PLAIN))),
            true,
        )
        .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while root.child("worker").is_none() && Instant::now() < deadline {
            root.render(&mut gl, 4, 4, &[]).unwrap();
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(root.child("worker").unwrap().feedback_unit().is_some());
    }

    #[test]
    fn failed_load_leaves_child_empty() {
        let mut gl = HeadlessContext::new();
        let mut root = ShaderProgram::new(&mut gl, &ProgramSource::fragment(PLAIN)).unwrap();
        root.add_pending_node(None, NodeFuture::spawn(|| Err("missing file".into())), false)
            .unwrap();
        for _ in 0..3 {
            root.render(&mut gl, 4, 4, &[]).unwrap();
        }
        assert!(root.child("u_node0").is_none());
    }

    #[test]
    fn textures_publish_units_and_share_the_name_space() {
        let mut gl = HeadlessContext::new();
        let mut root = ShaderProgram::new(
            &mut gl,
            &ProgramSource::fragment("uniform sampler2D u_texture0;\nvoid main() {}"),
        )
        .unwrap();
        let image = MediaInput::Still(SourceKind::Image, RgbaImage::new(2, 2));
        let name = root
            .add_texture(&mut gl, None, image, MediaOptions::default())
            .unwrap();
        assert_eq!(name, "u_texture0");
        let child = ShaderProgram::new(&mut gl, &ProgramSource::fragment(PLAIN)).unwrap();
        assert!(root.add_node(&mut gl, child, Some("u_texture0"), false).is_err());

        root.render(&mut gl, 4, 4, &[]).unwrap();
        assert_eq!(gl.last_uniform("u_texture0"), Some(UniformValue::Int(0)));
    }

    #[test]
    fn dispose_releases_the_whole_tree() {
        let mut gl = HeadlessContext::new();
        let mut root = ShaderProgram::new(&mut gl, &ProgramSource::fragment(PLAIN)).unwrap();
        let mut middle = ShaderProgram::new(&mut gl, &ProgramSource::fragment(PLAIN)).unwrap();
        let leaf = ShaderProgram::new(&mut gl, &ProgramSource::fragment(PLAIN)).unwrap();
        middle.add_node(&mut gl, leaf, None, true).unwrap();
        root.add_node(&mut gl, middle, None, false).unwrap();
        root.render(&mut gl, 4, 4, &[]).unwrap();

        root.dispose(&mut gl);
        assert_eq!(gl.live_programs(), 0);
        assert_eq!(gl.live_textures(), 0);
        assert_eq!(gl.live_framebuffers(), 0);
    }
}
