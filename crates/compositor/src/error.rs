use std::fmt;

/// Stage a compile diagnostic belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Link,
}

impl fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ShaderStage::Vertex => "vertex",
            ShaderStage::Fragment => "fragment",
            ShaderStage::Link => "link",
        })
    }
}

/// Compile or link diagnostics returned by a graphics context.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{stage} stage failed: {log}")]
pub struct CompileError {
    pub stage: ShaderStage,
    pub log: String,
}

impl CompileError {
    pub fn new(stage: ShaderStage, log: impl Into<String>) -> Self {
        Self {
            stage,
            log: log.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CompositorError {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error("failed to allocate {resource}: {reason}")]
    Allocation {
        resource: &'static str,
        reason: String,
    },
    #[error("a child node named '{0}' already exists under this program")]
    DuplicateNode(String),
    #[error("texture units must be allocated before the program first renders")]
    GraphFrozen,
    #[error("invalid texture upload: {0}")]
    InvalidUpload(String),
    #[error("uniform write rejected: {0}")]
    Uniform(String),
    #[error("unknown {kind} handle {id}")]
    UnknownHandle { kind: &'static str, id: u32 },
    #[error("graphics device error: {0}")]
    Device(String),
    #[error("failed to present frame: {0}")]
    Present(String),
    #[error("failed to load media source '{src}': {reason}")]
    Source { src: String, reason: String },
}

impl CompositorError {
    pub(crate) fn allocation(resource: &'static str, reason: impl fmt::Display) -> Self {
        CompositorError::Allocation {
            resource,
            reason: reason.to_string(),
        }
    }
}
