use thiserror::Error;

/// Internal invariant violations.
///
/// These never describe a mistake in the user's program: they mean the front end drove the
/// construction protocol incorrectly or an optimizer pass broke one of the tree invariants.
/// Every pass propagates them to the pipeline entry point, which aborts the optimization.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum IrError {
    #[error("unbalanced construction: expected to close {expected}, but the innermost open construct is {found}")]
    UnbalancedNesting {
        expected: &'static str,
        found: String,
    },
    #[error("no function is currently open")]
    NoOpenFunction,
    #[error("function {name:?} is still open")]
    FunctionStillOpen { name: String },
    #[error("no block is open to receive {what}")]
    NoOpenBlock { what: &'static str },
    #[error("use of undeclared variable {name:?}")]
    UndeclaredVariable { name: String },
    #[error("variable {name:?} is declared twice in the same block")]
    DuplicateDeclaration { name: String },
    #[error("global constant {name:?} is declared twice")]
    DuplicateGlobal { name: String },
    #[error("{what} used outside of a loop")]
    LoopControlOutsideLoop { what: &'static str },
    #[error("case index {index} is out of range for a switch with {blocks} blocks")]
    CaseOutOfRange { index: usize, blocks: usize },
    #[error("cannot remove variable {name:?}: it is required by {construct}")]
    RemovingRequiredVar {
        name: String,
        construct: &'static str,
    },
    #[error("make immediate for {instruction}: got {found} {what}, expected {expected}")]
    MakeImmediateArity {
        instruction: String,
        what: &'static str,
        found: usize,
        expected: usize,
    },
    #[error("{instruction} cannot be made immediate")]
    NotImmediate { instruction: String },
    #[error("{op}: operand {index} has literal {found}, which does not match the operator layout")]
    LiteralTypeMismatch {
        op: &'static str,
        index: usize,
        found: String,
    },
    #[error("{op}: expected {expected} operands, found {found}")]
    OperandCount {
        op: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("{op}: expected {expected} outputs, found {found}")]
    OutputCount {
        op: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("{op} is not a container or reference operation")]
    MisplacedOpcode { op: &'static str },
    #[error("{instruction}: operand {index} must be a variable, found {found}")]
    ExpectedVariable {
        instruction: String,
        index: usize,
        found: String,
    },
}
