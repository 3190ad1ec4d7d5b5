use std::{borrow::Borrow, cmp::Ordering, collections::HashMap, fmt};

use educe::Educe;

pub mod arg;
pub mod builder;
pub mod computed;
pub mod continuation;
pub mod errors;
pub mod fold;
pub mod instruction;
pub mod opcode;
pub mod printer;
pub mod scope;
pub mod tree;

pub use arg::{Arg, FloatLit};
pub use errors::IrError;
pub use scope::ScopedMap;

/// Variable substitutions, resolved through nested scopes.
pub type Renames = ScopedMap<Var, Arg>;

/// Variables known to hold a literal value.
pub type Constants = HashMap<Var, Arg>;

/// Primitive value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PrimType {
    Int,
    Float,
    String,
    Bool,
    Void,
    Blob,
}

impl fmt::Display for PrimType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PrimType::Int => "int",
            PrimType::Float => "float",
            PrimType::String => "string",
            PrimType::Bool => "boolean",
            PrimType::Void => "void",
            PrimType::Blob => "blob",
        })
    }
}

/// A IR type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Type {
    /// A single-assignment cell holding a primitive; readers block until it's written.
    Future(PrimType),
    /// A plain local value.
    Value(PrimType),
    /// A future holding a reference to some other storage.
    Ref(Box<Type>),
    /// An integer keyed container of the member type.
    Array(Box<Type>),
    /// A named struct with futures as fields.
    Struct(String),
}

impl Type {
    pub fn is_value(&self) -> bool {
        matches!(self, Type::Value(_))
    }

    pub fn is_future(&self) -> bool {
        matches!(self, Type::Future(_))
    }

    pub fn is_ref(&self) -> bool {
        matches!(self, Type::Ref(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Type::Array(_))
    }

    pub fn prim(&self) -> Option<PrimType> {
        match self {
            Type::Future(p) | Type::Value(p) => Some(*p),
            _ => None,
        }
    }

    /// The type obtained by fetching the contents of a future or a reference.
    pub fn retrieved(&self) -> Option<Type> {
        match self {
            Type::Future(p) => Some(Type::Value(*p)),
            Type::Ref(inner) => Some((**inner).clone()),
            _ => None,
        }
    }

    /// The member type of an array.
    pub fn member(&self) -> Option<&Type> {
        match self {
            Type::Array(member) => Some(member),
            _ => None,
        }
    }

    /// The future type that stores values of this type.
    pub fn future_of(&self) -> Type {
        match self {
            Type::Value(p) => Type::Future(*p),
            other => other.clone(),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Future(p) => write!(f, "{p}"),
            Type::Value(p) => write!(f, "${p}"),
            Type::Ref(inner) => write!(f, "*({inner})"),
            Type::Array(member) => write!(f, "{member}[]"),
            Type::Struct(name) => write!(f, "struct {name}"),
        }
    }
}

/// Where a variable's storage lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Storage {
    /// A plain value owned by the declaring block.
    Local,
    /// A future allocated by the declaring block.
    Future,
    /// Points at storage owned elsewhere, nothing is allocated.
    Alias,
    /// A program-wide constant.
    GlobalConst,
}

impl fmt::Display for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Storage::Local => "local",
            Storage::Future => "future",
            Storage::Alias => "alias",
            Storage::GlobalConst => "global_const",
        })
    }
}

/// How a variable came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DefKind {
    InArg,
    OutArg,
    Local,
    /// Compiler-introduced temporary.
    Temp,
}

/// A named storage location.
///
/// Identity is the name alone: after uniquifying, names are unique within a function.
/// Variables are never mutated in place, replacing one means substituting every occurrence.
#[derive(Debug, Clone, Educe)]
#[educe(PartialEq, Eq, Hash)]
pub struct Var {
    pub name: String,
    #[educe(PartialEq(ignore), Hash(ignore))]
    pub ty: Type,
    #[educe(PartialEq(ignore), Hash(ignore))]
    pub storage: Storage,
    #[educe(PartialEq(ignore), Hash(ignore))]
    pub def: DefKind,
}

impl Var {
    pub fn new(name: impl Into<String>, ty: Type, storage: Storage, def: DefKind) -> Self {
        Self {
            name: name.into(),
            ty,
            storage,
            def,
        }
    }

    /// A compiler temporary whose storage follows from the type.
    pub fn temp(name: impl Into<String>, ty: Type) -> Self {
        let storage = if ty.is_value() {
            Storage::Local
        } else {
            Storage::Future
        };
        Self::new(name, ty, storage, DefKind::Temp)
    }

    pub fn with_name(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }

    /// Whether writes to this variable are observable outside the function.
    pub fn is_escaping(&self) -> bool {
        matches!(self.storage, Storage::Alias | Storage::GlobalConst)
            || matches!(self.def, DefKind::InArg | DefKind::OutArg)
    }

    pub fn is_value(&self) -> bool {
        self.ty.is_value()
    }
}

impl PartialOrd for Var {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Var {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name.cmp(&other.name)
    }
}

impl Borrow<str> for Var {
    fn borrow(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Which operands a substitution may touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenameMode {
    /// Inputs, outputs and variables defined by continuations.
    All,
    /// Only the places where a variable is read.
    InputsOnly,
}

/// What a pass has proven about variables at a program point.
pub trait Facts {
    /// The literal the variable is known to hold.
    fn constant(&self, var: &Var) -> Option<Arg>;

    /// Whether the variable is known to already hold its value.
    fn is_closed(&self, var: &Var) -> bool;

    /// Resolves an argument to a literal if possible.
    fn literal(&self, arg: &Arg) -> Option<Arg> {
        match arg {
            Arg::Var(var) => self.constant(var),
            lit => Some(lit.clone()),
        }
    }

    /// Whether reading the argument can't block.
    fn is_available(&self, arg: &Arg) -> bool {
        match arg {
            Arg::Var(var) => var.is_value() || self.is_closed(var),
            _ => true,
        }
    }
}

/// No facts at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFacts;

impl Facts for NoFacts {
    fn constant(&self, _var: &Var) -> Option<Arg> {
        None
    }

    fn is_closed(&self, _var: &Var) -> bool {
        false
    }
}

impl Facts for Constants {
    fn constant(&self, var: &Var) -> Option<Arg> {
        self.get(var).cloned()
    }

    fn is_closed(&self, var: &Var) -> bool {
        self.contains_key(var)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn var_identity_is_the_name() {
        let a = Var::new("x", Type::Future(PrimType::Int), Storage::Future, DefKind::Local);
        let b = Var::new("x", Type::Value(PrimType::Int), Storage::Local, DefKind::Temp);
        assert_eq!(a, b);

        let set: HashSet<Var> = [a.clone(), b].into_iter().collect();
        assert_eq!(set.len(), 1);
        assert!(set.contains("x"));
        assert_ne!(a, a.with_name("y"));
    }

    #[test]
    fn escaping_storage() {
        let alias = Var::new("a", Type::Future(PrimType::Int), Storage::Alias, DefKind::Local);
        let out = Var::new("o", Type::Future(PrimType::Int), Storage::Future, DefKind::OutArg);
        let local = Var::temp("t", Type::Future(PrimType::Int));
        assert!(alias.is_escaping());
        assert!(out.is_escaping());
        assert!(!local.is_escaping());
    }

    #[test]
    fn retrieved_types() {
        let r = Type::Ref(Box::new(Type::Future(PrimType::String)));
        assert_eq!(r.retrieved(), Some(Type::Future(PrimType::String)));
        assert_eq!(
            Type::Future(PrimType::Float).retrieved(),
            Some(Type::Value(PrimType::Float))
        );
        assert_eq!(Type::Struct("s".into()).retrieved(), None);
    }
}
