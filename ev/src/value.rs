//! Typed event values

use std::fmt;

use serde::Serialize;

use crate::text::Text;

/// Kind tag of a [`Value`], used in type-mismatch errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Void,
    Int,
    Float,
    Str,
    Date,
    Time,
    NanoDate,
    NanoTime,
    Remove,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Void => "void",
            ValueKind::Int => "int",
            ValueKind::Float => "float",
            ValueKind::Str => "string",
            ValueKind::Date => "date",
            ValueKind::Time => "time",
            ValueKind::NanoDate => "nanodate",
            ValueKind::NanoTime => "nanotime",
            ValueKind::Remove => "remove",
        };
        f.write_str(name)
    }
}

/// A single argument, attribute or variable value
///
/// Dates are absolute timestamps and times are durations, both in
/// microseconds; the `Nano*` variants carry nanoseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    /// Absent positional argument
    #[default]
    Void,
    Int(i64),
    Float(f64),
    Str(Text),
    Date(i64),
    Time(i64),
    NanoDate(i64),
    NanoTime(i64),
    /// Marker in update events: delete the field it is assigned to
    Remove,
}

impl Value {
    /// String value copied into its own buffer
    pub fn str(s: &str) -> Self {
        Value::Str(Text::new(s))
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Void => ValueKind::Void,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::Str(_) => ValueKind::Str,
            Value::Date(_) => ValueKind::Date,
            Value::Time(_) => ValueKind::Time,
            Value::NanoDate(_) => ValueKind::NanoDate,
            Value::NanoTime(_) => ValueKind::NanoTime,
            Value::Remove => ValueKind::Remove,
        }
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Value::Void)
    }

    pub fn is_remove(&self) -> bool {
        matches!(self, Value::Remove)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(t) => Some(t.as_str()),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&Text> {
        match self {
            Value::Str(t) => Some(t),
            _ => None,
        }
    }

    /// True for the four date/time kinds
    pub fn is_temporal(&self) -> bool {
        matches!(
            self,
            Value::Date(_) | Value::Time(_) | Value::NanoDate(_) | Value::NanoTime(_)
        )
    }

    /// True for dates and times carrying nanoseconds
    pub fn is_nano(&self) -> bool {
        matches!(self, Value::NanoDate(_) | Value::NanoTime(_))
    }

    /// Raw integer of a date/time in its own unit
    pub fn temporal_raw(&self) -> Option<i64> {
        match self {
            Value::Date(v) | Value::Time(v) | Value::NanoDate(v) | Value::NanoTime(v) => Some(*v),
            _ => None,
        }
    }

    /// Date/time in microseconds, flooring nanosecond values
    pub fn micros(&self) -> Option<i64> {
        match self {
            Value::Date(v) | Value::Time(v) => Some(*v),
            Value::NanoDate(v) | Value::NanoTime(v) => Some(v.div_euclid(1000)),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::str(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(Text::from(s))
    }
}

impl From<Text> for Value {
    fn from(t: Text) -> Self {
        Value::Str(t)
    }
}

/// Human-oriented rendering, not the wire encoding
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Void => f.write_str("<void>"),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Str(t) => f.write_str(t),
            Value::Date(v) => write!(f, "date:{}us", v),
            Value::Time(v) => write!(f, "time:{}us", v),
            Value::NanoDate(v) => write!(f, "date:{}ns", v),
            Value::NanoTime(v) => write!(f, "time:{}ns", v),
            Value::Remove => f.write_str("<remove>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind() {
        assert_eq!(Value::from(3i64).kind(), ValueKind::Int);
        assert_eq!(Value::str("x").kind(), ValueKind::Str);
        assert_eq!(Value::NanoDate(1).kind(), ValueKind::NanoDate);
        assert_eq!(Value::default().kind(), ValueKind::Void);
    }

    #[test]
    fn test_micros_floors_nanos() {
        assert_eq!(Value::NanoDate(1_999).micros(), Some(1));
        assert_eq!(Value::NanoTime(-1).micros(), Some(-1));
        assert_eq!(Value::Date(7).micros(), Some(7));
        assert_eq!(Value::Int(7).micros(), None);
    }

    #[test]
    fn test_serialize_json() {
        let json = serde_json::to_string(&Value::from(42i64)).unwrap();
        assert_eq!(json, r#"{"type":"int","value":42}"#);
        let json = serde_json::to_string(&Value::str("a")).unwrap();
        assert_eq!(json, r#"{"type":"str","value":"a"}"#);
    }
}
