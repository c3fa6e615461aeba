use std::collections::HashMap;
use std::time::Instant;

use chrono::{DateTime, Datelike, Local, Timelike};

use crate::compile::{self, UniformSpec};
use crate::context::{GraphicsContext, ProgramId, UniformLocation};
use crate::error::CompositorError;
use crate::types::UniformType;

/// A value that can be written to a cached uniform.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum UniformValue {
    Float(f32),
    Vec2([f32; 2]),
    Vec3([f32; 3]),
    Vec4([f32; 4]),
    /// Integers and sampler texture units.
    Int(i32),
}

impl UniformValue {
    /// Bitwise equality: `-0.0` differs from `0.0`, identical NaNs match.
    pub fn same_bits(&self, other: &UniformValue) -> bool {
        fn eq(a: &[f32], b: &[f32]) -> bool {
            a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
        }
        match (self, other) {
            (UniformValue::Float(a), UniformValue::Float(b)) => a.to_bits() == b.to_bits(),
            (UniformValue::Vec2(a), UniformValue::Vec2(b)) => eq(a, b),
            (UniformValue::Vec3(a), UniformValue::Vec3(b)) => eq(a, b),
            (UniformValue::Vec4(a), UniformValue::Vec4(b)) => eq(a, b),
            (UniformValue::Int(a), UniformValue::Int(b)) => a == b,
            _ => false,
        }
    }

    fn fits(&self, ty: UniformType) -> bool {
        matches!(
            (self, ty),
            (UniformValue::Float(_), UniformType::Float)
                | (UniformValue::Vec2(_), UniformType::Vec2)
                | (UniformValue::Vec3(_), UniformType::Vec3)
                | (UniformValue::Vec4(_), UniformType::Vec4)
                | (UniformValue::Int(_), UniformType::Int | UniformType::Sampler2D)
        )
    }
}

#[derive(Debug)]
struct UniformEntry {
    location: UniformLocation,
    ty: UniformType,
    last: Option<UniformValue>,
}

/// Per-program cache that turns repeated writes of an unchanged value into
/// no-ops.
#[derive(Debug, Default)]
pub struct UniformCache {
    entries: HashMap<String, UniformEntry>,
}

impl UniformCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares every active uniform of a linked program.
    pub fn for_program(gl: &dyn GraphicsContext, program: ProgramId) -> Self {
        let mut cache = Self::new();
        for uniform in gl.active_uniforms(program) {
            cache.declare(&uniform.name, uniform.ty, uniform.location);
        }
        cache
    }

    /// Registers one uniform. Unsupported types get no entry and report
    /// `false`.
    pub fn declare(&mut self, name: &str, ty: UniformType, location: UniformLocation) -> bool {
        if ty == UniformType::Unsupported {
            tracing::debug!(uniform = name, "ignoring uniform of unsupported type");
            return false;
        }
        self.entries.insert(
            name.to_string(),
            UniformEntry {
                location,
                ty,
                last: None,
            },
        );
        true
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn location(&self, name: &str) -> Option<UniformLocation> {
        self.entries.get(name).map(|entry| entry.location)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Writes `value` unless it equals the cached one. Returns whether a GPU
    /// write happened; unknown names and mismatched types are skipped.
    pub fn write(
        &mut self,
        gl: &mut dyn GraphicsContext,
        name: &str,
        value: UniformValue,
    ) -> Result<bool, CompositorError> {
        let Some(entry) = self.entries.get_mut(name) else {
            return Ok(false);
        };
        if !value.fits(entry.ty) {
            tracing::debug!(uniform = name, ty = ?entry.ty, ?value, "uniform type mismatch; write skipped");
            return Ok(false);
        }
        if entry.last.is_some_and(|last| last.same_bits(&value)) {
            return Ok(false);
        }
        gl.set_uniform(entry.location, &value)?;
        entry.last = Some(value);
        Ok(true)
    }
}

/// A named value pushed into every program each frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UniformState {
    pub spec: UniformSpec,
    pub value: UniformValue,
}

impl UniformState {
    pub fn new(spec: UniformSpec, value: UniformValue) -> Self {
        Self { spec, value }
    }

    pub fn name(&self, shadertoy: bool) -> &'static str {
        if shadertoy {
            self.spec.toy_name
        } else {
            self.spec.name
        }
    }
}

/// Time, date, frame and orientation values shared by every surface.
#[derive(Clone, Debug, Default)]
pub struct GlobalUniformState {
    time: f32,
    delta: f32,
    date: [f32; 4],
    frame: i32,
    ticks: u64,
    orientation: [f32; 3],
    last_tick: Option<Instant>,
}

impl GlobalUniformState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances one tick using the local wall clock for the date.
    pub fn advance(&mut self, now: Instant) {
        self.advance_with_date(now, Local::now());
    }

    /// Advances one tick. The first tick after construction or
    /// [`restart`](Self::restart) has a zero delta.
    pub fn advance_with_date(&mut self, now: Instant, date: DateTime<Local>) {
        let delta = self
            .last_tick
            .map(|last| now.saturating_duration_since(last).as_secs_f32())
            .unwrap_or(0.0);
        self.last_tick = Some(now);
        self.delta = delta;
        self.time += delta;
        self.ticks += 1;
        self.frame = self.ticks.min(i32::MAX as u64) as i32;

        let seconds_since_midnight =
            date.num_seconds_from_midnight() as f32 + date.nanosecond() as f32 / 1_000_000_000.0;
        self.date = [
            date.year() as f32,
            date.month() as f32,
            date.day() as f32,
            seconds_since_midnight,
        ];
    }

    /// Forgets the previous tick so the next delta is zero. Elapsed time and
    /// the frame counter continue.
    pub fn restart(&mut self) {
        self.last_tick = None;
    }

    pub fn set_orientation(&mut self, alpha: f32, beta: f32, gamma: f32) {
        self.orientation = [alpha, beta, gamma];
    }

    pub fn time(&self) -> f32 {
        self.time
    }

    pub fn delta(&self) -> f32 {
        self.delta
    }

    pub fn frame(&self) -> i32 {
        self.frame
    }

    pub fn date(&self) -> [f32; 4] {
        self.date
    }

    pub fn uniforms(&self) -> [UniformState; 5] {
        [
            UniformState::new(compile::TIME, UniformValue::Float(self.time)),
            UniformState::new(compile::DELTA, UniformValue::Float(self.delta)),
            UniformState::new(compile::DATE, UniformValue::Vec4(self.date)),
            UniformState::new(compile::FRAME, UniformValue::Int(self.frame)),
            UniformState::new(compile::ORIENTATION, UniformValue::Vec3(self.orientation)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeZone;

    use super::*;
    use crate::headless::HeadlessContext;

    fn program_with(gl: &mut HeadlessContext, declarations: &str) -> ProgramId {
        let fragment = format!("{declarations}\nvoid main() {{ gl_FragColor = vec4(1.0); }}");
        gl.compile_program(compile::DEFAULT_VERTEX_SHADER, &fragment)
            .expect("compile")
    }

    #[test]
    fn repeated_values_are_written_once() {
        let mut gl = HeadlessContext::new();
        let program = program_with(
            &mut gl,
            "uniform float f; uniform vec2 a; uniform vec3 b; uniform vec4 c; uniform int i; uniform sampler2D s;",
        );
        let mut cache = UniformCache::for_program(&gl, program);
        let values = [
            ("f", UniformValue::Float(0.5)),
            ("a", UniformValue::Vec2([1.0, 2.0])),
            ("b", UniformValue::Vec3([1.0, 2.0, 3.0])),
            ("c", UniformValue::Vec4([1.0, 2.0, 3.0, 4.0])),
            ("i", UniformValue::Int(7)),
            ("s", UniformValue::Int(2)),
        ];
        for (name, value) in values {
            assert!(cache.write(&mut gl, name, value).unwrap());
            assert!(!cache.write(&mut gl, name, value).unwrap());
            assert_eq!(gl.uniform_writes(name), 1, "{name}");
        }
    }

    #[test]
    fn single_component_change_is_detected() {
        let mut gl = HeadlessContext::new();
        let program = program_with(&mut gl, "uniform vec4 c;");
        let mut cache = UniformCache::for_program(&gl, program);
        cache
            .write(&mut gl, "c", UniformValue::Vec4([0.0, 0.0, 0.0, 0.0]))
            .unwrap();
        for component in 0..4 {
            let mut next = [0.0; 4];
            next[component] = 1.0;
            let before = gl.uniform_writes("c");
            assert!(cache.write(&mut gl, "c", UniformValue::Vec4(next)).unwrap());
            assert_eq!(gl.uniform_writes("c"), before + 1);
            assert_eq!(gl.last_uniform("c"), Some(UniformValue::Vec4(next)));
            cache
                .write(&mut gl, "c", UniformValue::Vec4([0.0; 4]))
                .unwrap();
        }
    }

    #[test]
    fn unsupported_and_unknown_uniforms_are_ignored() {
        let mut gl = HeadlessContext::new();
        let program = program_with(&mut gl, "uniform mat4 m; uniform float f;");
        let mut cache = UniformCache::for_program(&gl, program);
        assert!(!cache.contains("m"));
        assert!(!cache.write(&mut gl, "m", UniformValue::Float(1.0)).unwrap());
        assert!(!cache.write(&mut gl, "missing", UniformValue::Float(1.0)).unwrap());
        assert!(!cache.write(&mut gl, "f", UniformValue::Int(1)).unwrap());
        assert_eq!(gl.uniform_writes("f"), 0);
    }

    #[test]
    fn failed_write_leaves_cache_untouched() {
        let mut gl = HeadlessContext::new();
        let program = program_with(&mut gl, "uniform float f;");
        let mut cache = UniformCache::for_program(&gl, program);
        gl.fail_uniform_writes(true);
        assert!(cache.write(&mut gl, "f", UniformValue::Float(1.0)).is_err());
        gl.fail_uniform_writes(false);
        assert!(cache.write(&mut gl, "f", UniformValue::Float(1.0)).unwrap());
    }

    #[test]
    fn negative_zero_counts_as_a_change() {
        let a = UniformValue::Float(0.0);
        let b = UniformValue::Float(-0.0);
        assert!(!a.same_bits(&b));
        assert!(UniformValue::Float(f32::NAN).same_bits(&UniformValue::Float(f32::NAN)));
    }

    #[test]
    fn time_starts_at_zero_then_accumulates() {
        let date = Local.with_ymd_and_hms(2024, 3, 9, 1, 2, 3).unwrap();
        let start = Instant::now();
        let mut globals = GlobalUniformState::new();

        globals.advance_with_date(start, date);
        assert_eq!(globals.time(), 0.0);
        assert_eq!(globals.delta(), 0.0);
        assert_eq!(globals.frame(), 1);
        assert_eq!(globals.date(), [2024.0, 3.0, 9.0, 3723.0]);

        globals.advance_with_date(start + Duration::from_micros(16_700), date);
        assert!((globals.time() - 0.0167).abs() < 1e-4);
        assert!((globals.delta() - 0.0167).abs() < 1e-4);
        assert_eq!(globals.frame(), 2);
    }

    #[test]
    fn restart_zeroes_the_next_delta_only() {
        let date = Local.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let start = Instant::now();
        let mut globals = GlobalUniformState::new();
        globals.advance_with_date(start, date);
        globals.advance_with_date(start + Duration::from_millis(500), date);
        globals.restart();
        globals.advance_with_date(start + Duration::from_secs(10), date);
        assert_eq!(globals.delta(), 0.0);
        assert!((globals.time() - 0.5).abs() < 1e-6);
        assert_eq!(globals.frame(), 3);
    }

    #[test]
    fn shadertoy_programs_resolve_toy_names() {
        let globals = GlobalUniformState::new();
        let [time, ..] = globals.uniforms();
        assert_eq!(time.name(false), "u_time");
        assert_eq!(time.name(true), "iTime");
    }
}
