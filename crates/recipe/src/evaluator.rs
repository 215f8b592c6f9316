//! Expression evaluation for recipe fields.
//!
//! An expression is a JSON value. Strings are templates containing
//! `{{name}}` or `{{name:width}}` fields, arrays evaluate element by element,
//! and objects name exactly one [`Operator`].

use crate::error::{EvalError, EvalResult};
use regex::Regex;
use serde_json::{Map, Number, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// Variable bindings visible to an expression.
pub type Env = Map<String, Value>;

const FIELD_PATTERN: &str = r"\{\{([A-Za-z_][A-Za-z0-9_]*)(?::(\d*))?\}\}";

/// Most values a single range may expand to.
pub const MAX_RANGE_VALUES: u64 = 100_000;

fn field_regex() -> &'static Regex {
    static FIELD: OnceLock<Regex> = OnceLock::new();
    // Literal pattern, checked by the parse tests.
    FIELD.get_or_init(|| Regex::new(FIELD_PATTERN).expect("field pattern compiles"))
}

/// Target type for [`coerce`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coercion {
    /// true / false
    Boolean,
    /// Integer or float
    Number,
    /// Text
    String,
    /// List of values
    Array,
    /// `{start, end, step}`
    Range,
}

impl Coercion {
    /// Lowercase name, as used in error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            Coercion::Boolean => "boolean",
            Coercion::Number => "number",
            Coercion::String => "string",
            Coercion::Array => "array",
            Coercion::Range => "range",
        }
    }
}

impl fmt::Display for Coercion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Coercion {
    type Err = EvalError;

    fn from_str(s: &str) -> EvalResult<Self> {
        match s {
            "boolean" => Ok(Coercion::Boolean),
            "number" => Ok(Coercion::Number),
            "string" => Ok(Coercion::String),
            "array" => Ok(Coercion::Array),
            "range" => Ok(Coercion::Range),
            other => Err(EvalError::UnknownCoercion(other.to_string())),
        }
    }
}

/// Operators that may appear as the single key of an object expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    /// `{"$foreach": [var, range, body]}`
    Foreach,
}

impl Operator {
    /// Look up an operator by its object key.
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "$foreach" => Some(Operator::Foreach),
            _ => None,
        }
    }

    fn eval(self, args: &Value, env: &Env) -> EvalResult<Value> {
        match self {
            Operator::Foreach => eval_foreach(args, env),
        }
    }
}

/// An inclusive numeric range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Range {
    /// First value
    pub start: f64,
    /// Last value (inclusive)
    pub end: f64,
    /// Increment, always positive
    pub step: f64,
}

impl Range {
    /// Build a range, rejecting steps that would never reach `end`.
    pub fn new(start: f64, end: f64, step: f64) -> EvalResult<Self> {
        if !(start.is_finite() && end.is_finite() && step.is_finite()) || step <= 0.0 {
            return Err(EvalError::InvalidRange(format!(
                "{{start: {}, end: {}, step: {}}}",
                start, end, step
            )));
        }
        let count = if end < start { 0.0 } else { ((end - start) / step).floor() + 1.0 };
        if count > MAX_RANGE_VALUES as f64 {
            return Err(EvalError::RangeTooLarge {
                count,
                max: MAX_RANGE_VALUES,
            });
        }
        Ok(Self { start, end, step })
    }

    /// The values from `start` up to and including `end`.
    pub fn values(&self) -> impl Iterator<Item = Value> + '_ {
        let mut current = self.start;
        std::iter::from_fn(move || {
            if current > self.end {
                return None;
            }
            let value = number_value(current);
            current += self.step;
            Some(value)
        })
    }

    /// Read a range previously produced by [`coerce`].
    pub fn from_value(value: &Value) -> EvalResult<Self> {
        match coerce(value.clone(), Some(Coercion::Range))? {
            Value::Object(map) => Range::new(
                map.get("start").and_then(Value::as_f64).unwrap_or_default(),
                map.get("end").and_then(Value::as_f64).unwrap_or_default(),
                map.get("step").and_then(Value::as_f64).unwrap_or(1.0),
            ),
            other => Err(EvalError::InvalidRange(other.to_string())),
        }
    }

    fn to_value(self) -> Value {
        let mut map = Map::new();
        map.insert("start".into(), number_value(self.start));
        map.insert("end".into(), number_value(self.end));
        map.insert("step".into(), number_value(self.step));
        Value::Object(map)
    }
}

/// Width and padding of a template field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Format {
    /// Minimum rendered width of numbers
    pub width: Option<usize>,
    /// Pad with zeros instead of spaces
    pub leading_zeros: bool,
}

/// A `{{key:width}}` field in a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Substitution {
    /// Variable name
    pub key: String,
    /// Formatting
    pub format: Format,
}

/// One piece of a parsed template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplatePart {
    /// Text copied as is
    Literal(String),
    /// A substitution field
    Field(Substitution),
}

/// Split a string into literal text and substitution fields.
pub fn parse_template(input: &str) -> EvalResult<Vec<TemplatePart>> {
    let mut parts = Vec::new();
    let mut last = 0;
    for caps in field_regex().captures_iter(input) {
        let Some(whole) = caps.get(0) else { continue };
        if whole.start() > last {
            parts.push(TemplatePart::Literal(input[last..whole.start()].to_string()));
        }
        let mut format = Format::default();
        if let Some(spec) = caps.get(2).map(|m| m.as_str()).filter(|s| !s.is_empty()) {
            format.leading_zeros = spec.starts_with('0');
            format.width = Some(
                spec.parse()
                    .map_err(|_| EvalError::InvalidWidth(spec.to_string()))?,
            );
        }
        parts.push(TemplatePart::Field(Substitution {
            key: caps[1].to_string(),
            format,
        }));
        last = whole.end();
    }
    if input.len() > last {
        parts.push(TemplatePart::Literal(input[last..].to_string()));
    }
    Ok(parts)
}

/// Render a parsed template to a string.
pub fn eval_template(template: &[TemplatePart], env: &Env) -> EvalResult<String> {
    let mut out = String::new();
    for part in template {
        match part {
            TemplatePart::Literal(text) => out.push_str(text),
            TemplatePart::Field(sub) => {
                let value = lookup(env, &sub.key)?;
                let rendered = render(value);
                if let (Value::Number(_), Some(width)) = (value, sub.format.width) {
                    let pad = if sub.format.leading_zeros { '0' } else { ' ' };
                    for _ in rendered.chars().count()..width {
                        out.push(pad);
                    }
                }
                out.push_str(&rendered);
            }
        }
    }
    Ok(out)
}

/// Evaluate an expression, optionally coercing the result.
pub fn eval(expr: &Value, env: &Env, hint: Option<Coercion>) -> EvalResult<Value> {
    match expr {
        Value::Bool(_) | Value::Number(_) => coerce(expr.clone(), hint),
        Value::String(s) => {
            let template = parse_template(s)?;
            if hint == Some(Coercion::String) {
                return Ok(Value::String(eval_template(&template, env)?));
            }
            let value = match template.as_slice() {
                // A lone field yields the variable itself, not its text.
                [TemplatePart::Field(sub)] if sub.format.width.is_none() => {
                    lookup(env, &sub.key)?.clone()
                }
                _ => Value::String(eval_template(&template, env)?),
            };
            coerce(value, hint)
        }
        Value::Array(items) => {
            let items = items
                .iter()
                .map(|item| eval(item, env, None))
                .collect::<EvalResult<Vec<_>>>()?;
            coerce(Value::Array(items), hint)
        }
        Value::Object(map) => {
            let mut found: Option<(&str, Operator, &Value)> = None;
            for (key, args) in map {
                if let Some(op) = Operator::from_key(key) {
                    if let Some((first, _, _)) = found {
                        return Err(EvalError::ConflictingOperators(
                            first.to_string(),
                            key.clone(),
                        ));
                    }
                    found = Some((key.as_str(), op, args));
                }
            }
            match found {
                Some((_, op, args)) => coerce(op.eval(args, env)?, hint),
                None => Err(EvalError::Unsupported(expr.to_string())),
            }
        }
        Value::Null => Err(EvalError::Unsupported("null".to_string())),
    }
}

/// Evaluate a list expression and flatten nested lists, coercing each item.
pub fn eval_array(expr: &Value, env: &Env, item: Option<Coercion>) -> EvalResult<Vec<Value>> {
    let Value::Array(items) = eval(expr, env, Some(Coercion::Array))? else {
        return Err(EvalError::ExpectedArray(expr.to_string()));
    };
    let mut flat = Vec::with_capacity(items.len());
    flatten_into(items, item, &mut flat)?;
    Ok(flat)
}

fn flatten_into(items: Vec<Value>, item: Option<Coercion>, out: &mut Vec<Value>) -> EvalResult<()> {
    for value in items {
        match value {
            Value::Array(nested) => flatten_into(nested, item, out)?,
            leaf => out.push(coerce(leaf, item)?),
        }
    }
    Ok(())
}

/// Evaluate a list expression into strings.
pub fn eval_strings(expr: &Value, env: &Env) -> EvalResult<Vec<String>> {
    Ok(eval_array(expr, env, Some(Coercion::String))?
        .into_iter()
        .map(|v| render(&v))
        .collect())
}

/// Evaluate an expression into a string.
pub fn eval_string(expr: &Value, env: &Env) -> EvalResult<String> {
    Ok(render(&eval(expr, env, Some(Coercion::String))?))
}

/// Convert a value to another type.
pub fn coerce(value: Value, to: Option<Coercion>) -> EvalResult<Value> {
    let Some(to) = to else { return Ok(value) };
    let from = type_name(&value);
    let fail = || EvalError::Conversion { from, to: to.as_str() };
    match (value, to) {
        (Value::Bool(b), Coercion::Boolean) => Ok(Value::Bool(b)),
        (Value::Bool(b), Coercion::Number) => Ok(Value::from(u8::from(b))),
        (Value::Bool(b), Coercion::String) => Ok(Value::String(b.to_string())),

        (Value::Number(n), Coercion::Number) => Ok(Value::Number(n)),
        (Value::Number(n), Coercion::Boolean) => Ok(Value::Bool(as_f64(&n) != 0.0)),
        (Value::Number(n), Coercion::String) => Ok(Value::String(format_number(&n))),

        (Value::String(s), Coercion::String) => Ok(Value::String(s)),
        (Value::String(s), Coercion::Boolean) => Ok(Value::Bool(!s.is_empty())),
        (Value::String(s), Coercion::Number) => parse_number(&s),

        (Value::Array(items), Coercion::Array) => Ok(Value::Array(items)),
        (Value::Array(items), Coercion::Range) => {
            if items.len() < 2 || items.len() > 3 {
                return Err(EvalError::RangeLength);
            }
            let mut bounds = Vec::with_capacity(3);
            for item in items {
                bounds.push(number_of(coerce(item, Some(Coercion::Number))?));
            }
            let step = bounds.get(2).copied().unwrap_or(1.0);
            Ok(Range::new(bounds[0], bounds[1], step)?.to_value())
        }

        (Value::Object(map), Coercion::Range)
            if map.contains_key("start") && map.contains_key("end") =>
        {
            let field = |name: &str| -> EvalResult<Option<f64>> {
                match map.get(name) {
                    Some(v) => Ok(Some(number_of(coerce(v.clone(), Some(Coercion::Number))?))),
                    None => Ok(None),
                }
            };
            let start = field("start")?.unwrap_or_default();
            let end = field("end")?.unwrap_or_default();
            let step = field("step")?.unwrap_or(1.0);
            Ok(Range::new(start, end, step)?.to_value())
        }

        _ => Err(fail()),
    }
}

fn eval_foreach(args: &Value, env: &Env) -> EvalResult<Value> {
    let arity_error = || EvalError::InvalidArguments(format!("$foreach requires 3 arguments: {}", args));
    let Value::Array(items) = args else { return Err(arity_error()) };
    let [var, range, body] = items.as_slice() else { return Err(arity_error()) };
    let range = Range::from_value(&eval(range, env, Some(Coercion::Range))?)?;
    let var = match var {
        Value::String(name) if !name.is_empty() => name,
        _ => {
            return Err(EvalError::InvalidArguments(
                "$foreach variable name must be a string".to_string(),
            ))
        }
    };
    let mut scope = env.clone();
    let mut result = Vec::new();
    for value in range.values() {
        scope.insert(var.clone(), value);
        result.push(eval(body, &scope, None)?);
    }
    Ok(Value::Array(result))
}

fn lookup<'a>(env: &'a Env, key: &str) -> EvalResult<&'a Value> {
    env.get(key).ok_or_else(|| EvalError::UnknownName(key.to_string()))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn parse_number(s: &str) -> EvalResult<Value> {
    let trimmed = s.trim();
    if let Ok(n) = trimmed.parse::<i64>() {
        return Ok(Value::from(n));
    }
    match trimmed.parse::<f64>() {
        Ok(f) if f.is_finite() => Ok(number_value(f)),
        _ => Err(EvalError::NotANumber(s.to_string())),
    }
}

fn as_f64(n: &Number) -> f64 {
    n.as_f64().unwrap_or_default()
}

fn number_of(value: Value) -> f64 {
    value.as_f64().unwrap_or_default()
}

/// Whole numbers are stored as integers so they render without a fraction.
fn number_value(f: f64) -> Value {
    if f.fract() == 0.0 && f.abs() < 9.0e15 {
        Value::from(f as i64)
    } else {
        Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn format_number(n: &Number) -> String {
    if n.is_i64() || n.is_u64() {
        return n.to_string();
    }
    let f = as_f64(n);
    if f.fract() == 0.0 && f.abs() < 9.0e15 {
        format!("{}", f as i64)
    } else {
        format!("{}", f)
    }
}

/// Text form of a value as used inside templates.
pub fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => format_number(n),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        Value::Array(items) => items.iter().map(render).collect::<Vec<_>>().join(","),
        Value::Object(_) => value.to_string(),
    }
}
