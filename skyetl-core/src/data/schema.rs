//! Column kinds, cell values, and kind inference for raw text input.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Declared kind of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Integer,
    Float,
    Boolean,
    String,
}

impl ColumnKind {
    /// Widest kind able to hold values of both `self` and `other` without loss.
    pub fn unify(self, other: ColumnKind) -> ColumnKind {
        use ColumnKind::*;
        match (self, other) {
            (a, b) if a == b => a,
            (Integer, Float) | (Float, Integer) => Float,
            _ => String,
        }
    }

    /// SQL column type used when a sink creates a table.
    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnKind::Integer | ColumnKind::Boolean => "INTEGER",
            ColumnKind::Float => "REAL",
            ColumnKind::String => "TEXT",
        }
    }
}

impl fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnKind::Integer => write!(f, "integer"),
            ColumnKind::Float => write!(f, "float"),
            ColumnKind::Boolean => write!(f, "boolean"),
            ColumnKind::String => write!(f, "string"),
        }
    }
}

/// A named, typed column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
}

impl Column {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// A single cell.
///
/// Equality and hashing compare floats by bit pattern (with `-0.0` folded into
/// `0.0` and every NaN equal to every other NaN) so rows can be used as set keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Textual form used for join-key matching. Null never matches anything.
    pub fn key_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Bool(b) => Some(b.to_string()),
            Value::Int(i) => Some(i.to_string()),
            Value::Float(f) => Some(f.to_string()),
            Value::Str(s) => Some(s.clone()),
        }
    }

    /// Numeric view of the value, if it has one. Strings are parsed leniently.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Null => None,
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Str(s) => s.trim().parse::<f64>().ok(),
        }
    }

    /// Convert the value into `kind`, widening only. Values that cannot be
    /// represented are rendered as text when `kind` is `String`.
    pub fn widen_to(self, kind: ColumnKind) -> Value {
        match (self, kind) {
            (Value::Null, _) => Value::Null,
            (Value::Int(i), ColumnKind::Float) => Value::Float(i as f64),
            (Value::Bool(b), ColumnKind::String) => Value::Str(b.to_string()),
            (Value::Int(i), ColumnKind::String) => Value::Str(i.to_string()),
            (Value::Float(f), ColumnKind::String) => Value::Str(f.to_string()),
            (v, _) => v,
        }
    }

    /// Kind the value naturally belongs to. Null has none.
    pub fn kind(&self) -> Option<ColumnKind> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(ColumnKind::Boolean),
            Value::Int(_) => Some(ColumnKind::Integer),
            Value::Float(_) => Some(ColumnKind::Float),
            Value::Str(_) => Some(ColumnKind::String),
        }
    }

    /// Convert into `kind` without losing information, parsing text where
    /// needed. Gives the value back unchanged when `kind` cannot hold it.
    pub fn convert_to(self, kind: ColumnKind) -> std::result::Result<Value, Value> {
        match (self, kind) {
            (Value::Null, _) => Ok(Value::Null),
            (v, ColumnKind::String) => Ok(v.widen_to(ColumnKind::String)),
            (Value::Int(i), ColumnKind::Integer) => Ok(Value::Int(i)),
            (Value::Int(i), ColumnKind::Float) => Ok(Value::Float(i as f64)),
            (Value::Float(f), ColumnKind::Float) => Ok(Value::Float(f)),
            (Value::Bool(b), ColumnKind::Boolean) => Ok(Value::Bool(b)),
            (Value::Str(s), kind) => match parse_cell(Some(&s), kind) {
                Value::Str(_) => Err(Value::Str(s)),
                parsed => Ok(parsed),
            },
            (v, _) => Err(v),
        }
    }

    /// Kind-independent identity of the cell: two cells that would be equal
    /// once their column is widened to text share the same key.
    pub fn canonical(&self) -> Value {
        match self {
            Value::Null => Value::Null,
            Value::Float(f) if *f == 0.0 => Value::Str("0".into()),
            other => Value::Str(other.to_string()),
        }
    }

    fn float_bits(f: f64) -> u64 {
        if f.is_nan() {
            f64::NAN.to_bits()
        } else if f == 0.0 {
            0.0f64.to_bits()
        } else {
            f.to_bits()
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => Value::float_bits(*a) == Value::float_bits(*b),
            (Value::Str(a), Value::Str(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Bool(b) => b.hash(state),
            Value::Int(i) => i.hash(state),
            Value::Float(f) => Value::float_bits(*f).hash(state),
            Value::Str(s) => s.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s {
        "true" | "True" | "TRUE" => Some(true),
        "false" | "False" | "FALSE" => Some(false),
        _ => None,
    }
}

/// Infer the kind of a column from its raw text cells. Empty cells are nulls
/// and do not vote. An all-null column is a string column.
pub fn infer_column_kind<'a>(values: impl IntoIterator<Item = Option<&'a str>>) -> ColumnKind {
    let mut all_int = true;
    let mut all_float = true;
    let mut all_bool = true;
    let mut seen = false;

    for v in values.into_iter().flatten() {
        seen = true;
        let v = v.trim();
        if all_int && v.parse::<i64>().is_err() {
            all_int = false;
        }
        if all_float && v.parse::<f64>().is_err() {
            all_float = false;
        }
        if all_bool && parse_bool(v).is_none() {
            all_bool = false;
        }
        if !all_int && !all_float && !all_bool {
            return ColumnKind::String;
        }
    }

    if !seen {
        return ColumnKind::String;
    }
    if all_int {
        ColumnKind::Integer
    } else if all_float {
        ColumnKind::Float
    } else if all_bool {
        ColumnKind::Boolean
    } else {
        ColumnKind::String
    }
}

/// Parse a raw text cell as `kind`. Cells that do not parse stay as text so
/// no input is lost; callers only pass kinds produced by [`infer_column_kind`].
pub fn parse_cell(raw: Option<&str>, kind: ColumnKind) -> Value {
    let Some(raw) = raw else {
        return Value::Null;
    };
    let trimmed = raw.trim();
    match kind {
        ColumnKind::Integer => trimmed
            .parse::<i64>()
            .map(Value::Int)
            .unwrap_or_else(|_| Value::Str(raw.to_string())),
        ColumnKind::Float => trimmed
            .parse::<f64>()
            .map(Value::Float)
            .unwrap_or_else(|_| Value::Str(raw.to_string())),
        ColumnKind::Boolean => parse_bool(trimmed)
            .map(Value::Bool)
            .unwrap_or_else(|| Value::Str(raw.to_string())),
        ColumnKind::String => Value::Str(raw.to_string()),
    }
}
