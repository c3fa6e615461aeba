//! Fragment source preparation and the built-in uniform table.

/// One of the uniforms every fragment shader receives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UniformSpec {
    pub name: &'static str,
    /// Name used by shaders written in the shadertoy dialect.
    pub toy_name: &'static str,
    pub glsl_type: &'static str,
}

pub const TIME: UniformSpec = UniformSpec {
    name: "u_time",
    toy_name: "iTime",
    glsl_type: "float",
};
pub const DELTA: UniformSpec = UniformSpec {
    name: "u_delta",
    toy_name: "iTimeDelta",
    glsl_type: "float",
};
pub const DATE: UniformSpec = UniformSpec {
    name: "u_date",
    toy_name: "iDate",
    glsl_type: "vec4",
};
pub const FRAME: UniformSpec = UniformSpec {
    name: "u_frame",
    toy_name: "iFrame",
    glsl_type: "int",
};
pub const ORIENTATION: UniformSpec = UniformSpec {
    name: "u_orientation",
    toy_name: "iOrientation",
    glsl_type: "vec3",
};
pub const RESOLUTION: UniformSpec = UniformSpec {
    name: "u_resolution",
    toy_name: "iResolution",
    glsl_type: "vec2",
};
pub const MOUSE: UniformSpec = UniformSpec {
    name: "u_mouse",
    toy_name: "iCurrentMouse",
    glsl_type: "vec2",
};
pub const MOUSE_DRAG: UniformSpec = UniformSpec {
    name: "u_mousedrag",
    toy_name: "iMouse",
    glsl_type: "vec4",
};

/// Global, orientation and surface uniforms in declaration order.
pub const BASE_UNIFORMS: [UniformSpec; 8] = [
    TIME,
    DELTA,
    DATE,
    FRAME,
    ORIENTATION,
    RESOLUTION,
    MOUSE,
    MOUSE_DRAG,
];

/// Sampler a feedback-enabled node reads its previous frame from.
pub const FEEDBACK_UNIFORM: &str = "u_prevbuffer";

pub const DEFAULT_VERTEX_SHADER: &str =
    "attribute vec2 position;\nvoid main() {\n  gl_Position = vec4(position, 0.0, 1.0);\n}";

/// Two triangles covering clip space.
pub const DEFAULT_VERTICES: [f32; 12] = [
    -1.0, 1.0, 1.0, 1.0, 1.0, -1.0, -1.0, 1.0, 1.0, -1.0, -1.0, -1.0,
];

/// Rewrites a fragment shader into the form handed to the context.
///
/// Dialect sources have their `mainImage(out vec4 A, in vec2 B)` entry point
/// turned into `main()`, with `A` aliased to `gl_FragColor` and `B` to
/// `gl_FragCoord.xy`. Every source then gets the base uniform block and a
/// `precision highp float;` directive prepended.
pub fn prepare_fragment_source(source: &str, shadertoy: bool) -> String {
    let mut body = source.to_string();
    if shadertoy {
        body = strip_version(&body);
        let io = find_shadertoy_io(&body);
        body = body.replacen("mainImage", "main", 1);
        if let Some(io) = find_shadertoy_io(&body) {
            body.replace_range(io.range, "()");
        }
        if let Some(io) = io {
            body = format!(
                "#define {} gl_FragColor\n#define {} gl_FragCoord.xy\n{body}",
                io.color, io.coord
            );
        }
    }

    let mut prepared = String::from("precision highp float;\n");
    prepared.push_str(&uniform_declarations(shadertoy));
    prepared.push_str(&body);
    prepared
}

/// `uniform <type> <name>;` lines for the base uniforms.
pub fn uniform_declarations(shadertoy: bool) -> String {
    BASE_UNIFORMS
        .iter()
        .map(|spec| {
            let name = if shadertoy { spec.toy_name } else { spec.name };
            format!("uniform {} {name};\n", spec.glsl_type)
        })
        .collect()
}

fn strip_version(source: &str) -> String {
    let trimmed = source.trim_start();
    if trimmed.starts_with("#version") {
        let rest = trimmed.find('\n').map(|end| &trimmed[end + 1..]).unwrap_or("");
        rest.to_string()
    } else {
        source.to_string()
    }
}

#[derive(Debug, PartialEq, Eq)]
struct ShadertoyIo {
    range: std::ops::Range<usize>,
    color: String,
    coord: String,
}

/// Finds `( out vec4 <color> , in vec2 <coord> )`, whitespace-insensitive.
fn find_shadertoy_io(source: &str) -> Option<ShadertoyIo> {
    source
        .match_indices('(')
        .find_map(|(start, _)| match_io_at(source, start))
}

fn match_io_at(source: &str, start: usize) -> Option<ShadertoyIo> {
    let mut cursor = Cursor {
        text: source,
        pos: start + 1,
    };
    cursor.skip_space();
    cursor.keyword("out")?;
    cursor.require_space()?;
    cursor.keyword("vec4")?;
    cursor.require_space()?;
    let color = cursor.token(',')?;
    cursor.skip_space();
    cursor.literal(',')?;
    cursor.skip_space();
    cursor.keyword("in")?;
    cursor.require_space()?;
    cursor.keyword("vec2")?;
    cursor.require_space()?;
    let coord = cursor.token(')')?;
    cursor.skip_space();
    cursor.literal(')')?;
    Some(ShadertoyIo {
        range: start..cursor.pos,
        color,
        coord,
    })
}

struct Cursor<'a> {
    text: &'a str,
    pos: usize,
}

impl Cursor<'_> {
    fn rest(&self) -> &str {
        &self.text[self.pos..]
    }

    fn skip_space(&mut self) -> usize {
        let rest = self.rest();
        let skipped = rest.len() - rest.trim_start().len();
        self.pos += skipped;
        skipped
    }

    fn require_space(&mut self) -> Option<()> {
        (self.skip_space() > 0).then_some(())
    }

    fn keyword(&mut self, word: &str) -> Option<()> {
        self.rest().starts_with(word).then(|| self.pos += word.len())
    }

    fn literal(&mut self, c: char) -> Option<()> {
        self.rest().starts_with(c).then(|| self.pos += c.len_utf8())
    }

    fn token(&mut self, stop: char) -> Option<String> {
        let rest = self.rest();
        let end = rest
            .find(|c: char| c.is_whitespace() || c == stop)
            .unwrap_or(rest.len());
        if end == 0 {
            return None;
        }
        let token = rest[..end].to_string();
        self.pos += end;
        Some(token)
    }
}
