use std::{
    cmp::Ordering,
    fmt,
    hash::{Hash, Hasher},
};

use super::{PrimType, Renames, Var, fold::format_float};

/// A float literal with total equality and ordering, so it can key maps.
#[derive(Debug, Clone, Copy)]
pub struct FloatLit(pub f64);

impl PartialEq for FloatLit {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == Ordering::Equal
    }
}

impl Eq for FloatLit {}

impl Hash for FloatLit {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

impl PartialOrd for FloatLit {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FloatLit {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// An operand: either an immediate literal or a variable.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Arg {
    Int(i64),
    Float(FloatLit),
    Str(String),
    Bool(bool),
    Var(Var),
}

impl Arg {
    pub fn float(value: f64) -> Self {
        Arg::Float(FloatLit(value))
    }

    pub fn str(value: impl Into<String>) -> Self {
        Arg::Str(value.into())
    }

    pub fn var(&self) -> Option<&Var> {
        match self {
            Arg::Var(var) => Some(var),
            _ => None,
        }
    }

    pub fn is_var(&self) -> bool {
        matches!(self, Arg::Var(_))
    }

    pub fn is_literal(&self) -> bool {
        !self.is_var()
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Arg::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Arg::Float(value) => Some(value.0),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Arg::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Arg::Str(value) => Some(value),
            _ => None,
        }
    }

    /// The primitive type of a literal.
    pub fn literal_type(&self) -> Option<PrimType> {
        match self {
            Arg::Int(_) => Some(PrimType::Int),
            Arg::Float(_) => Some(PrimType::Float),
            Arg::Str(_) => Some(PrimType::String),
            Arg::Bool(_) => Some(PrimType::Bool),
            Arg::Var(_) => None,
        }
    }

    /// Applies a substitution, returning the replacement if there is one.
    pub fn renamed(&self, renames: &Renames) -> Option<Arg> {
        let var = self.var()?;
        renames.get(var).filter(|new| *new != self).cloned()
    }
}

impl From<Var> for Arg {
    fn from(value: Var) -> Self {
        Arg::Var(value)
    }
}

impl From<&Var> for Arg {
    fn from(value: &Var) -> Self {
        Arg::Var(value.clone())
    }
}

impl From<i64> for Arg {
    fn from(value: i64) -> Self {
        Arg::Int(value)
    }
}

impl From<bool> for Arg {
    fn from(value: bool) -> Self {
        Arg::Bool(value)
    }
}

impl From<f64> for Arg {
    fn from(value: f64) -> Self {
        Arg::float(value)
    }
}

impl From<&str> for Arg {
    fn from(value: &str) -> Self {
        Arg::Str(value.to_string())
    }
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Int(value) => write!(f, "{value}"),
            Arg::Float(value) => f.write_str(&format_float(value.0)),
            Arg::Str(value) => write!(f, "{value:?}"),
            Arg::Bool(value) => write!(f, "{value}"),
            Arg::Var(var) => write!(f, "{var}"),
        }
    }
}
