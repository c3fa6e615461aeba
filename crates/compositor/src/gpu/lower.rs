//! Rewrites GL-style shader pairs into the Vulkan GLSL dialect the wgpu GLSL
//! frontend accepts.
//!
//! Loose uniforms are gathered into one std140 block shared by both stages
//! and every `sampler2D` becomes a texture/sampler pair. Macros map the
//! original names back onto the new declarations so shader bodies compile
//! untouched. The vertex stage negates `gl_Position.y`, which keeps texture
//! memory bottom-row-first exactly as GL lays it out.

use std::collections::HashSet;

use crate::error::{CompileError, ShaderStage};
use crate::glsl::{self, Declaration, Qualifier};
use crate::types::UniformType;

const BLOCK_NAME: &str = "doodle_ubo";
const USER_MAIN: &str = "doodle_user_main";

/// One loose uniform placed inside the std140 block.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct BlockUniform {
    pub name: String,
    pub ty: UniformType,
    pub offset: u32,
}

#[derive(Debug)]
pub(crate) struct LoweredProgram {
    pub vertex: String,
    pub fragment: String,
    pub uniforms: Vec<BlockUniform>,
    /// Block size in bytes, rounded to 16 and never zero.
    pub block_size: u32,
    /// Sampler uniform names; slot `k` binds texture `2k` and sampler `2k + 1`.
    pub samplers: Vec<String>,
}

enum Global {
    Block { ty: String, name: String, array: Option<u32> },
    Sampler(String),
}

pub(crate) fn lower_program(vertex: &str, fragment: &str) -> Result<LoweredProgram, CompileError> {
    let vertex_decls = glsl::declarations(vertex);
    let fragment_decls = glsl::declarations(fragment);

    let mut seen = HashSet::new();
    let mut globals = Vec::new();
    collect_uniforms(&vertex_decls, ShaderStage::Vertex, &mut seen, &mut globals)?;
    collect_uniforms(&fragment_decls, ShaderStage::Fragment, &mut seen, &mut globals)?;

    let mut prelude = String::new();
    let mut uniforms = Vec::new();
    let mut offset = 0u32;
    let mut members = String::new();
    let mut defines = String::new();
    for global in &globals {
        let Global::Block { ty, name, array } = global else {
            continue;
        };
        let (size, align) = std140_layout(ty, *array).ok_or_else(|| {
            CompileError::new(ShaderStage::Link, format!("uniform '{name}' has unsupported type '{ty}'"))
        })?;
        offset = align_to(offset, align);
        uniforms.push(BlockUniform {
            name: name.clone(),
            ty: if array.is_some() {
                UniformType::Unsupported
            } else {
                UniformType::from_glsl(ty)
            },
            offset,
        });
        let suffix = array.map(|len| format!("[{len}]")).unwrap_or_default();
        members.push_str(&format!("    {ty} _{name}{suffix};\n"));
        defines.push_str(&format!("#define {name} {BLOCK_NAME}._{name}\n"));
        offset += size;
    }
    if !members.is_empty() {
        prelude.push_str(&format!(
            "layout(std140, set = 0, binding = 0) uniform DoodleUniforms {{\n{members}}} {BLOCK_NAME};\n"
        ));
        prelude.push_str(&defines);
    }

    let samplers: Vec<String> = globals
        .iter()
        .filter_map(|global| match global {
            Global::Sampler(name) => Some(name.clone()),
            Global::Block { .. } => None,
        })
        .collect();
    for (slot, name) in samplers.iter().enumerate() {
        let texture = 2 * slot;
        let sampler = texture + 1;
        prelude.push_str(&format!(
            "layout(set = 1, binding = {texture}) uniform texture2D doodle_tex{slot};\n\
             layout(set = 1, binding = {sampler}) uniform sampler doodle_smp{slot};\n\
             #define {name} sampler2D(doodle_tex{slot}, doodle_smp{slot})\n"
        ));
    }
    prelude.push_str("#define texture2D texture\n#define texture2DLod textureLod\n");

    let attributes: Vec<(&str, &str)> = vertex_decls
        .iter()
        .filter(|decl| decl.qualifier == Qualifier::Attribute)
        .flat_map(|decl| decl.names.iter().map(move |d| (decl.ty.as_str(), d.name.as_str())))
        .collect();
    if attributes.len() > 1 {
        return Err(CompileError::new(
            ShaderStage::Vertex,
            "only a single vec2 position attribute is supported",
        ));
    }

    let mut vertex_head = String::new();
    for (location, (ty, name)) in attributes.iter().enumerate() {
        vertex_head.push_str(&format!("layout(location = {location}) in {ty} {name};\n"));
    }

    let mut varyings = Vec::new();
    let mut location = 0u32;
    for decl in vertex_decls.iter().filter(|d| d.qualifier == Qualifier::Varying) {
        for declarator in &decl.names {
            let count = array_length(declarator.array.as_deref(), &declarator.name, ShaderStage::Vertex)?;
            let suffix = count.map(|len| format!("[{len}]")).unwrap_or_default();
            vertex_head.push_str(&format!(
                "layout(location = {location}) out {} {}{suffix};\n",
                decl.ty, declarator.name
            ));
            varyings.push((declarator.name.clone(), location));
            location += count.unwrap_or(1);
        }
    }

    let mut fragment_head =
        String::from("layout(location = 0) out vec4 doodle_FragColor;\n#define gl_FragColor doodle_FragColor\n");
    for decl in fragment_decls.iter().filter(|d| d.qualifier == Qualifier::Varying) {
        for declarator in &decl.names {
            let Some((_, location)) = varyings.iter().find(|(name, _)| *name == declarator.name) else {
                return Err(CompileError::new(
                    ShaderStage::Link,
                    format!("varying '{}' is not written by the vertex stage", declarator.name),
                ));
            };
            let count = array_length(declarator.array.as_deref(), &declarator.name, ShaderStage::Fragment)?;
            let suffix = count.map(|len| format!("[{len}]")).unwrap_or_default();
            fragment_head.push_str(&format!(
                "layout(location = {location}) in {} {}{suffix};\n",
                decl.ty, declarator.name
            ));
        }
    }

    let entry = glsl::entry_point(vertex)
        .ok_or_else(|| CompileError::new(ShaderStage::Vertex, "missing `void main()` entry point"))?;
    let mut vertex_body = strip_declarations(vertex, &vertex_decls);
    vertex_body.replace_range(entry, USER_MAIN);
    vertex_body.push_str(&format!(
        "\nvoid main() {{\n    {USER_MAIN}();\n    gl_Position.y = -gl_Position.y;\n}}\n"
    ));
    if glsl::entry_point(fragment).is_none() {
        return Err(CompileError::new(ShaderStage::Fragment, "missing `void main()` entry point"));
    }
    let fragment_body = strip_declarations(fragment, &fragment_decls);

    let assemble = |head: &str, body: &str| format!("#version 450\n{prelude}{head}#line 1\n{body}");
    Ok(LoweredProgram {
        vertex: assemble(&vertex_head, &vertex_body),
        fragment: assemble(&fragment_head, &fragment_body),
        uniforms,
        block_size: align_to(offset, 16).max(16),
        samplers,
    })
}

fn collect_uniforms(
    decls: &[Declaration],
    stage: ShaderStage,
    seen: &mut HashSet<String>,
    globals: &mut Vec<Global>,
) -> Result<(), CompileError> {
    for decl in decls.iter().filter(|d| d.qualifier == Qualifier::Uniform) {
        for declarator in &decl.names {
            if !seen.insert(declarator.name.clone()) {
                continue;
            }
            let array = array_length(declarator.array.as_deref(), &declarator.name, stage)?;
            if decl.ty == "sampler2D" {
                if array.is_some() {
                    return Err(CompileError::new(
                        stage,
                        format!("sampler array '{}' is not supported", declarator.name),
                    ));
                }
                globals.push(Global::Sampler(declarator.name.clone()));
            } else {
                globals.push(Global::Block {
                    ty: decl.ty.clone(),
                    name: declarator.name.clone(),
                    array,
                });
            }
        }
    }
    Ok(())
}

fn array_length(raw: Option<&str>, name: &str, stage: ShaderStage) -> Result<Option<u32>, CompileError> {
    match raw {
        None => Ok(None),
        Some(text) => text.parse::<u32>().ok().filter(|len| *len > 0).map(Some).ok_or_else(|| {
            CompileError::new(stage, format!("'{name}' needs a literal array size, found '{text}'"))
        }),
    }
}

/// Size and alignment under std140 rules.
fn std140_layout(ty: &str, array: Option<u32>) -> Option<(u32, u32)> {
    let (size, align) = match ty {
        "float" | "int" | "uint" | "bool" => (4, 4),
        "vec2" | "ivec2" | "uvec2" | "bvec2" => (8, 8),
        "vec3" | "ivec3" | "uvec3" | "bvec3" => (12, 16),
        "vec4" | "ivec4" | "uvec4" | "bvec4" => (16, 16),
        "mat2" => (32, 16),
        "mat3" => (48, 16),
        "mat4" => (64, 16),
        _ => return None,
    };
    Some(match array {
        None => (size, align),
        Some(len) => (align_to(size, 16) * len, 16),
    })
}

fn align_to(value: u32, align: u32) -> u32 {
    value.div_ceil(align) * align
}

/// Blanks the given declarations together with `#version`/`#extension`
/// lines, keeping line numbers stable.
fn strip_declarations(source: &str, decls: &[Declaration]) -> String {
    let mut bytes = source.as_bytes().to_vec();
    for decl in decls {
        for byte in &mut bytes[decl.span.clone()] {
            if *byte != b'\n' {
                *byte = b' ';
            }
        }
    }
    let text = String::from_utf8_lossy(&bytes);
    let mut out = String::with_capacity(text.len());
    for line in text.split_inclusive('\n') {
        let directive = line.trim_start();
        if directive.starts_with("#version") || directive.starts_with("#extension") {
            if line.ends_with('\n') {
                out.push('\n');
            }
        } else {
            out.push_str(line);
        }
    }
    out
}
