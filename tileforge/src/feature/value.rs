//! Scalar attribute values.

use std::fmt;

/// A scalar tag or attribute value. The key space is open; values are one of
/// the four scalar kinds the MVT value pool distinguishes for our purposes.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    I64(i64),
    F64(f64),
    Bool(bool),
    Str(String),
}

impl FieldValue {
    /// Best-effort string view (used by tag matching and translations).
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::I64(v) => write!(f, "{}", v),
            FieldValue::F64(v) => write!(f, "{}", v),
            FieldValue::Bool(v) => write!(f, "{}", v),
            FieldValue::Str(v) => f.write_str(v),
        }
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::I64(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::I64(v as i64)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::F64(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Str(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(v.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_matches_scalar() {
        assert_eq!(FieldValue::from(7i64).to_string(), "7");
        assert_eq!(FieldValue::from(true).to_string(), "true");
        assert_eq!(FieldValue::from("XXX").to_string(), "XXX");
    }

    #[test]
    fn test_as_str_only_for_strings() {
        assert_eq!(FieldValue::from("a").as_str(), Some("a"));
        assert_eq!(FieldValue::from(1i64).as_str(), None);
    }
}
