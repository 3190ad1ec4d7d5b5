use std::fmt;

use itertools::Itertools;

use super::{Arg, ScopedMap, Var, fold::BuiltinOp, opcode::Opcode};

/// The operation part of a value-numbering key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueOp {
    /// A container, reference or future primitive.
    Op(Opcode),
    Async(BuiltinOp),
    Local(BuiltinOp),
    /// A side effect free function call.
    Call { function: String, local: bool },
}

/// A canonical `(operation, operands)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ValueKey {
    pub op: ValueOp,
    pub operands: Vec<Arg>,
}

impl ValueKey {
    pub fn new(op: ValueOp, operands: Vec<Arg>) -> Self {
        Self { op, operands }
    }

    /// Sorts the operands of commutative operators so equal expressions share a key.
    pub fn canonical(op: ValueOp, mut operands: Vec<Arg>) -> Self {
        if let ValueOp::Async(builtin) | ValueOp::Local(builtin) = &op {
            if builtin.is_commutative() {
                operands.sort();
            }
        }
        Self { op, operands }
    }

    pub fn of(opcode: Opcode, operands: impl IntoIterator<Item = Arg>) -> Self {
        Self::new(ValueOp::Op(opcode), operands.into_iter().collect())
    }
}

impl fmt::Display for ValueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match &self.op {
            ValueOp::Op(opcode) => opcode.name().to_string(),
            ValueOp::Async(op) => format!("async {op}"),
            ValueOp::Local(op) => format!("local {op}"),
            ValueOp::Call { function, .. } => function.clone(),
        };
        write!(f, "{op}({})", self.operands.iter().join(", "))
    }
}

/// A fact established by an instruction: evaluating `key` yields `value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputedValue {
    pub key: ValueKey,
    pub value: Arg,
    /// The value is available without blocking once the producer ran.
    pub closed: bool,
}

impl ComputedValue {
    pub fn new(key: ValueKey, value: impl Into<Arg>, closed: bool) -> Self {
        Self {
            key,
            value: value.into(),
            closed,
        }
    }
}

/// Known computed values, scoped along the block tree.
pub type ValueTable = ScopedMap<ValueKey, Arg>;

impl ScopedMap<ValueKey, Arg> {
    /// Records the fact unless an equivalent value is already known.
    pub fn add(&mut self, value: ComputedValue) -> bool {
        self.insert_if_absent(value.key, value.value)
    }

    /// The referent of a reference, if a store or load of it was seen.
    pub fn referent(&self, reference: &Var) -> Option<&Arg> {
        self.get(&ValueKey::of(Opcode::LoadRef, [Arg::Var(reference.clone())]))
    }

    /// The value stored into a future, if known.
    pub fn stored_value(&self, future: &Var) -> Option<&Arg> {
        self.get(&ValueKey::of(Opcode::Load, [Arg::Var(future.clone())]))
    }
}
