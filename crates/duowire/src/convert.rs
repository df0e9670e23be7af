//! # Value Conversion
//!
//! Coerces a decoded value into the type a handler declared. The caller may
//! have sent `"5"` where the handler takes an `i32`; the converter decides
//! whether that is acceptable and produces the normalized value.
//!
//! ## Invariants
//! - Conversion never widens or narrows silently: out-of-range integers and
//!   fractional numbers bound for an integer type are rejected.
//! - `any` and named types pass through untouched.

use std::fmt;

use serde_json::Map;
use serde_json::Number;
use serde_json::Value;

use crate::types::TypeDesc;
use crate::types::value_kind;

/// A value could not be coerced to the requested type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertError {
    /// The type that was requested at the failing position.
    pub expected: TypeDesc,
    /// Runtime kind of the offending value (see [`value_kind`]).
    pub actual: &'static str,
    /// Location inside a nested value, empty at the top level.
    pub path: String,
}

impl ConvertError {
    fn new(expected: &TypeDesc, value: &Value) -> Self {
        Self {
            expected: expected.clone(),
            actual: value_kind(value),
            path: String::new(),
        }
    }

    fn within(mut self, segment: impl fmt::Display) -> Self {
        self.path = format!("{}{}", segment, self.path);
        self
    }
}

impl fmt::Display for ConvertError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "expected {}, found {}", self.expected, self.actual)?;
        if !self.path.is_empty() {
            write!(f, " at {}", self.path)?;
        }
        Ok(())
    }
}

impl std::error::Error for ConvertError {}

/// Coerces runtime values into declared types.
pub trait Converter: Send + Sync + 'static {
    fn convert(&self, value: Value, target: &TypeDesc) -> Result<Value, ConvertError>;
}

/// The default coercion rules.
///
/// Accepts exact matches, numeric strings for numeric types, integral floats
/// for integer types, `"true"`/`"false"` for booleans and renders scalars to
/// text for `string`. Containers convert element-wise.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardConverter;

impl Converter for StandardConverter {
    fn convert(&self, value: Value, target: &TypeDesc) -> Result<Value, ConvertError> {
        coerce(value, target)
    }
}

fn coerce(value: Value, target: &TypeDesc) -> Result<Value, ConvertError> {
    match target {
        TypeDesc::Any | TypeDesc::Named(_) => Ok(value),
        TypeDesc::Unit => match value {
            Value::Null => Ok(Value::Null),
            other => Err(ConvertError::new(target, &other)),
        },
        TypeDesc::Bool => match value {
            Value::Bool(b) => Ok(Value::Bool(b)),
            Value::String(ref s) if s.eq_ignore_ascii_case("true") => Ok(Value::Bool(true)),
            Value::String(ref s) if s.eq_ignore_ascii_case("false") => Ok(Value::Bool(false)),
            other => Err(ConvertError::new(target, &other)),
        },
        TypeDesc::I32 | TypeDesc::I64 | TypeDesc::U32 | TypeDesc::U64 => {
            integer(&value, target).ok_or_else(|| ConvertError::new(target, &value))
        }
        TypeDesc::F32 | TypeDesc::F64 => {
            float(&value).ok_or_else(|| ConvertError::new(target, &value))
        }
        TypeDesc::Char => match value {
            Value::String(s) if s.chars().count() == 1 => Ok(Value::String(s)),
            other => Err(ConvertError::new(target, &other)),
        },
        TypeDesc::String => match value {
            Value::String(s) => Ok(Value::String(s)),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            other => Err(ConvertError::new(target, &other)),
        },
        TypeDesc::Option(inner) => match value {
            Value::Null => Ok(Value::Null),
            other => coerce(other, inner),
        },
        TypeDesc::List(inner) => match value {
            Value::Array(items) => items
                .into_iter()
                .enumerate()
                .map(|(i, item)| coerce(item, inner).map_err(|e| e.within(format_args!("[{}]", i))))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            other => Err(ConvertError::new(target, &other)),
        },
        TypeDesc::Tuple(items) => match value {
            Value::Array(values) if values.len() == items.len() => values
                .into_iter()
                .zip(items)
                .enumerate()
                .map(|(i, (v, ty))| coerce(v, ty).map_err(|e| e.within(format_args!("[{}]", i))))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            other => Err(ConvertError::new(target, &other)),
        },
        TypeDesc::Map(inner) => match value {
            Value::Object(entries) => {
                let mut out = Map::with_capacity(entries.len());
                for (key, v) in entries {
                    let converted = coerce(v, inner).map_err(|e| e.within(format_args!(".{}", key)))?;
                    out.insert(key, converted);
                }
                Ok(Value::Object(out))
            }
            other => Err(ConvertError::new(target, &other)),
        },
    }
}

fn integer(value: &Value, target: &TypeDesc) -> Option<Value> {
    let wide: i128 = match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i as i128
            } else if let Some(u) = n.as_u64() {
                u as i128
            } else {
                integral(n.as_f64()?)?
            }
        }
        Value::String(s) => {
            let s = s.trim();
            match s.parse::<i128>() {
                Ok(v) => v,
                Err(_) => integral(s.parse::<f64>().ok()?)?,
            }
        }
        _ => return None,
    };

    let (min, max) = match target {
        TypeDesc::I32 => (i32::MIN as i128, i32::MAX as i128),
        TypeDesc::I64 => (i64::MIN as i128, i64::MAX as i128),
        TypeDesc::U32 => (0, u32::MAX as i128),
        TypeDesc::U64 => (0, u64::MAX as i128),
        _ => return None,
    };
    if wide < min || wide > max {
        return None;
    }

    if wide < 0 {
        Some(Value::from(wide as i64))
    } else {
        Some(Value::from(wide as u64))
    }
}

/// Whole floats only; `2.5` is not an integer.
fn integral(f: f64) -> Option<i128> {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 1.9e19 {
        Some(f as i128)
    } else {
        None
    }
}

fn float(value: &Value) -> Option<Value> {
    let f = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    Number::from_f64(f).map(Value::Number)
}
