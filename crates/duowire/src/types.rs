//! # Type Descriptors
//!
//! A `TypeDesc` names a type on the wire. Generic witnesses travel as the
//! canonical text form (`list<i32>`, `option<string>`, `tuple<i64,bool>`), and
//! handlers declare their parameter types with the same vocabulary.
//!
//! Any identifier that is not a built-in name is a `Named` type. The converter
//! treats named types as opaque and leaves their values untouched.
//!
//! ## Invariants
//! - Parsing never nests deeper than [`MAX_TYPE_DEPTH`], whatever the input.
//! - [`TypeDesc::to_wire`] only yields text that parses back to the same descriptor.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::error::Error;

/// Deepest nesting of type arguments the parser accepts.
pub const MAX_TYPE_DEPTH: usize = 64;

/// A wire-level type descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeDesc {
    Unit,
    Bool,
    I32,
    I64,
    U32,
    U64,
    F32,
    F64,
    Char,
    String,
    /// Accepts any value unchanged.
    Any,
    List(Box<TypeDesc>),
    Option(Box<TypeDesc>),
    /// String-keyed map with uniform values.
    Map(Box<TypeDesc>),
    Tuple(Vec<TypeDesc>),
    /// A user type known to both ends by name.
    Named(String),
}

impl TypeDesc {
    pub fn list(inner: TypeDesc) -> Self {
        Self::List(Box::new(inner))
    }

    pub fn option(inner: TypeDesc) -> Self {
        Self::Option(Box::new(inner))
    }

    pub fn map(inner: TypeDesc) -> Self {
        Self::Map(Box::new(inner))
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }

    /// Canonical text for the wire, refused unless the peer would parse it
    /// back into this exact descriptor.
    ///
    /// Catches `Named` types that collide with built-in names (`named("list")`,
    /// `named("int")`) or contain characters outside the type-name alphabet.
    pub fn to_wire(&self) -> Result<String, Error> {
        let text = self.to_string();
        let parsed: TypeDesc = text.parse()?;
        if parsed != *self {
            return Err(Error::InvalidTypeDesc {
                input: text,
                reason: format!("reads back as '{}'", parsed),
            });
        }
        Ok(text)
    }

    /// True for the fixed-width integer types.
    pub fn is_integer(&self) -> bool {
        matches!(self, Self::I32 | Self::I64 | Self::U32 | Self::U64)
    }

    /// Replaces every `Named` occurrence of a generic parameter with its witness.
    ///
    /// `params[i]` is bound to `witnesses[i]`; names without a witness are left alone.
    pub fn substitute(&self, params: &[String], witnesses: &[TypeDesc]) -> TypeDesc {
        match self {
            Self::Named(name) => params
                .iter()
                .position(|p| p == name)
                .and_then(|i| witnesses.get(i))
                .cloned()
                .unwrap_or_else(|| self.clone()),
            Self::List(inner) => Self::list(inner.substitute(params, witnesses)),
            Self::Option(inner) => Self::option(inner.substitute(params, witnesses)),
            Self::Map(inner) => Self::map(inner.substitute(params, witnesses)),
            Self::Tuple(items) => {
                Self::Tuple(items.iter().map(|t| t.substitute(params, witnesses)).collect())
            }
            _ => self.clone(),
        }
    }

    fn scalar(name: &str) -> Option<Self> {
        let ty = match name {
            "unit" => Self::Unit,
            "bool" => Self::Bool,
            "i32" | "int" => Self::I32,
            "i64" | "long" => Self::I64,
            "u32" | "uint" => Self::U32,
            "u64" | "ulong" => Self::U64,
            "f32" | "float" => Self::F32,
            "f64" | "double" => Self::F64,
            "char" => Self::Char,
            "string" => Self::String,
            "any" => Self::Any,
            _ => return None,
        };
        Some(ty)
    }
}

impl fmt::Display for TypeDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unit => f.write_str("unit"),
            Self::Bool => f.write_str("bool"),
            Self::I32 => f.write_str("i32"),
            Self::I64 => f.write_str("i64"),
            Self::U32 => f.write_str("u32"),
            Self::U64 => f.write_str("u64"),
            Self::F32 => f.write_str("f32"),
            Self::F64 => f.write_str("f64"),
            Self::Char => f.write_str("char"),
            Self::String => f.write_str("string"),
            Self::Any => f.write_str("any"),
            Self::List(inner) => write!(f, "list<{}>", inner),
            Self::Option(inner) => write!(f, "option<{}>", inner),
            Self::Map(inner) => write!(f, "map<{}>", inner),
            Self::Tuple(items) => {
                f.write_str("tuple<")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str(">")
            }
            Self::Named(name) => f.write_str(name),
        }
    }
}

impl FromStr for TypeDesc {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parser = Parser { input: s, pos: 0 };
        let ty = parser.desc(1)?;
        parser.skip_ws();
        if parser.pos != s.len() {
            return Err(parser.fail("unexpected input after type"));
        }
        Ok(ty)
    }
}

/// Recursive descent over `ident ('<' desc (',' desc)* '>')?`, bounded by
/// [`MAX_TYPE_DEPTH`].
struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn desc(&mut self, depth: usize) -> Result<TypeDesc, Error> {
        if depth > MAX_TYPE_DEPTH {
            return Err(self.fail(&format!("type nesting exceeds {} levels", MAX_TYPE_DEPTH)));
        }
        self.skip_ws();
        let name = self.ident()?;
        self.skip_ws();

        if !self.eat('<') {
            if matches!(name, "list" | "option" | "map" | "tuple") {
                return Err(self.fail(&format!("{} requires type arguments", name)));
            }
            return Ok(TypeDesc::scalar(name).unwrap_or_else(|| TypeDesc::Named(name.to_string())));
        }

        let mut args = vec![self.desc(depth + 1)?];
        loop {
            self.skip_ws();
            if self.eat('>') {
                break;
            }
            if !self.eat(',') {
                return Err(self.fail("expected ',' or '>'"));
            }
            args.push(self.desc(depth + 1)?);
        }

        match (name, args.len()) {
            ("list", 1) => Ok(TypeDesc::List(Box::new(args.remove(0)))),
            ("option", 1) => Ok(TypeDesc::Option(Box::new(args.remove(0)))),
            ("map", 1) => Ok(TypeDesc::Map(Box::new(args.remove(0)))),
            ("tuple", _) => Ok(TypeDesc::Tuple(args)),
            ("list" | "option" | "map", n) => {
                Err(self.fail(&format!("{} takes one type argument, got {}", name, n)))
            }
            _ => Err(self.fail(&format!("'{}' does not take type arguments", name))),
        }
    }

    fn ident(&mut self) -> Result<&'a str, Error> {
        let rest = &self.input[self.pos..];
        let len = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '/' | '-')))
            .unwrap_or(rest.len());
        if len == 0 {
            return Err(self.fail("expected a type name"));
        }
        self.pos += len;
        Ok(&rest[..len])
    }

    fn eat(&mut self, c: char) -> bool {
        if self.input[self.pos..].starts_with(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    fn skip_ws(&mut self) {
        let rest = &self.input[self.pos..];
        self.pos += rest.len() - rest.trim_start().len();
    }

    fn fail(&self, reason: &str) -> Error {
        const SHOWN: usize = 64;
        let input = match self.input.char_indices().nth(SHOWN) {
            Some((cut, _)) => format!("{}...", &self.input[..cut]),
            None => self.input.to_string(),
        };
        Error::InvalidTypeDesc {
            input,
            reason: format!("{} at offset {}", reason, self.pos),
        }
    }
}

/// Describes the runtime kind of a decoded value, for diagnostics.
pub fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}
