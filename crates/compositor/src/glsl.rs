//! Just enough GLSL scanning to find global declarations and the entry point.
//!
//! Shader sources stay opaque text; this only recognises top-level
//! `uniform`/`attribute`/`varying`/`precision` statements so that contexts can
//! reflect uniforms and rewrite declarations for their target language.

use std::ops::Range;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Qualifier {
    Uniform,
    Attribute,
    Varying,
    Precision,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Declarator {
    pub name: String,
    pub array: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Declaration {
    pub qualifier: Qualifier,
    pub ty: String,
    pub names: Vec<Declarator>,
    /// Byte range in the original source, trailing `;` included.
    pub span: Range<usize>,
}

const PRECISIONS: [&str; 3] = ["lowp", "mediump", "highp"];

/// Replaces comments and preprocessor lines with spaces, keeping newlines and
/// byte offsets intact.
pub(crate) fn mask_source(source: &str) -> String {
    #[derive(PartialEq)]
    enum State {
        Code,
        LineComment,
        BlockComment,
        Directive,
    }

    let bytes = source.as_bytes();
    let mut masked = bytes.to_vec();
    let mut state = State::Code;
    let mut line_start = true;
    let mut index = 0;
    while index < bytes.len() {
        let byte = bytes[index];
        let next = bytes.get(index + 1).copied();
        match state {
            State::Code => {
                if byte == b'/' && next == Some(b'/') {
                    state = State::LineComment;
                } else if byte == b'/' && next == Some(b'*') {
                    state = State::BlockComment;
                    masked[index] = b' ';
                    masked[index + 1] = b' ';
                    index += 2;
                    continue;
                } else if byte == b'#' && line_start {
                    state = State::Directive;
                }
            }
            State::BlockComment => {
                if byte == b'*' && next == Some(b'/') {
                    masked[index] = b' ';
                    masked[index + 1] = b' ';
                    index += 2;
                    state = State::Code;
                    continue;
                }
            }
            State::LineComment => {
                if byte == b'\n' {
                    state = State::Code;
                }
            }
            State::Directive => {
                if byte == b'\\' && next == Some(b'\n') {
                    masked[index] = b' ';
                    index += 2;
                    continue;
                }
                if byte == b'\n' {
                    state = State::Code;
                }
            }
        }

        if state != State::Code && byte != b'\n' {
            masked[index] = b' ';
        }
        if byte == b'\n' {
            line_start = true;
        } else if !byte.is_ascii_whitespace() {
            line_start = false;
        }
        index += 1;
    }

    String::from_utf8_lossy(&masked).into_owned()
}

/// Top-level declarations in source order.
pub(crate) fn declarations(source: &str) -> Vec<Declaration> {
    let masked = mask_source(source);
    let mut found = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (index, byte) in masked.bytes().enumerate() {
        match byte {
            b'{' => {
                depth += 1;
                start = index + 1;
            }
            b'}' => {
                depth = depth.saturating_sub(1);
                start = index + 1;
            }
            b';' if depth == 0 => {
                if let Some(declaration) = parse_statement(&masked[start..index], start, index + 1)
                {
                    found.push(declaration);
                }
                start = index + 1;
            }
            _ => {}
        }
    }
    found
}

fn parse_statement(text: &str, offset: usize, end: usize) -> Option<Declaration> {
    let leading = text.len() - text.trim_start().len();
    let mut rest = text.trim();
    let qualifier = match take_word(&mut rest)? {
        "uniform" => Qualifier::Uniform,
        "attribute" => Qualifier::Attribute,
        "varying" => Qualifier::Varying,
        "precision" => Qualifier::Precision,
        _ => return None,
    };
    let span = offset + leading..end;
    if qualifier == Qualifier::Precision {
        return Some(Declaration {
            qualifier,
            ty: String::new(),
            names: Vec::new(),
            span,
        });
    }

    let mut ty = take_word(&mut rest)?;
    while PRECISIONS.contains(&ty) {
        ty = take_word(&mut rest)?;
    }
    let names = rest
        .split(',')
        .filter_map(|raw| {
            let raw = raw.trim();
            let name_end = raw
                .find(|c: char| c == '[' || c.is_whitespace())
                .unwrap_or(raw.len());
            let name = &raw[..name_end];
            if name.is_empty() {
                return None;
            }
            let array = raw[name_end..]
                .trim()
                .strip_prefix('[')
                .and_then(|inner| inner.strip_suffix(']'))
                .map(|inner| inner.trim().to_string());
            Some(Declarator {
                name: name.to_string(),
                array,
            })
        })
        .collect();

    Some(Declaration {
        qualifier,
        ty: ty.to_string(),
        names,
        span,
    })
}

fn take_word<'a>(rest: &mut &'a str) -> Option<&'a str> {
    let trimmed = rest.trim_start();
    if trimmed.is_empty() {
        return None;
    }
    let end = trimmed
        .find(|c: char| c.is_whitespace())
        .unwrap_or(trimmed.len());
    let (word, tail) = trimmed.split_at(end);
    *rest = tail.trim_start();
    Some(word)
}

fn is_ident(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_'
}

/// Byte range of the `main` identifier in a `void main(` definition.
pub(crate) fn entry_point(source: &str) -> Option<Range<usize>> {
    let masked = mask_source(source);
    let bytes = masked.as_bytes();
    let mut search = 0;
    while let Some(found) = masked[search..].find("main") {
        let start = search + found;
        let end = start + 4;
        search = end;
        if start > 0 && is_ident(bytes[start - 1]) {
            continue;
        }
        if bytes.get(end).copied().is_some_and(is_ident) {
            continue;
        }
        let after = masked[end..].trim_start();
        if !after.starts_with('(') {
            continue;
        }
        let before = masked[..start].trim_end();
        if before.ends_with("void") {
            let keyword_start = before.len() - 4;
            if keyword_start == 0 || !is_ident(bytes[keyword_start - 1]) {
                return Some(start..end);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_uniforms_outside_functions() {
        let source = "precision highp float;\n\
                      uniform float u_time; // seconds\n\
                      uniform vec2 a, b[4];\n\
                      /* uniform float hidden; */\n\
                      void main() { float uniform_like = 1.0; }\n";
        let found = declarations(source);
        assert_eq!(found.len(), 3);
        assert_eq!(found[0].qualifier, Qualifier::Precision);
        assert_eq!(found[1].ty, "float");
        assert_eq!(found[1].names[0].name, "u_time");
        assert_eq!(&source[found[1].span.clone()], "uniform float u_time;");
        assert_eq!(found[2].names.len(), 2);
        assert_eq!(found[2].names[1].array.as_deref(), Some("4"));
    }

    #[test]
    fn skips_precision_qualifiers_and_directives() {
        let source = "#define FOO uniform float nope;\nvarying highp vec2 v_uv;\n";
        let found = declarations(source);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].qualifier, Qualifier::Varying);
        assert_eq!(found[0].ty, "vec2");
    }

    #[test]
    fn locates_entry_point() {
        let source = "float mainly() { return 1.0; }\nvoid  main () {}";
        let range = entry_point(source).expect("main");
        assert_eq!(&source[range], "main");
        assert!(entry_point("void mainImage(out vec4 c, in vec2 p) {}").is_none());
    }
}
