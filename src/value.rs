//! Runtime values
//!
//! The value domain the interpreter and guards operate over. Values are
//! cheap to clone (integers and interned strings) and hashable so they can
//! live in constant pools and be compared by guards.

use std::fmt;
use std::sync::Arc;

/// A runtime value
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    /// Absence of a value
    Nil,
    /// Boolean
    Bool(bool),
    /// 64-bit signed integer
    Long(i64),
    /// Immutable string
    Str(Arc<str>),
}

/// The runtime category of a value, used by kind guards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Nil,
    Bool,
    Long,
    Str,
}

impl Value {
    /// Get the runtime category of this value
    #[inline]
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Nil => ValueKind::Nil,
            Value::Bool(_) => ValueKind::Bool,
            Value::Long(_) => ValueKind::Long,
            Value::Str(_) => ValueKind::Str,
        }
    }

    /// Name of the value's type, for error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Long(_) => "long",
            Value::Str(_) => "str",
        }
    }

    /// Truthiness used by conditional jumps
    #[inline]
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Nil => false,
            Value::Bool(b) => *b,
            Value::Long(n) => *n != 0,
            Value::Str(s) => !s.is_empty(),
        }
    }

    /// Construct a string value
    pub fn str(s: impl Into<Arc<str>>) -> Self {
        Value::Str(s.into())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Long(n) => write!(f, "{}", n),
            Value::Str(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Long(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind() {
        assert_eq!(Value::Nil.kind(), ValueKind::Nil);
        assert_eq!(Value::Long(7).kind(), ValueKind::Long);
        assert_eq!(Value::str("x").kind(), ValueKind::Str);
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::Nil.is_truthy());
        assert!(!Value::Long(0).is_truthy());
        assert!(Value::Long(-1).is_truthy());
        assert!(!Value::str("").is_truthy());
        assert!(Value::Bool(true).is_truthy());
    }
}
