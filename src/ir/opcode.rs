use std::{collections::HashMap, fmt, sync::OnceLock};

use super::fold::BuiltinOp;

/// Every operation kind an instruction can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Opcode {
    Comment,
    CallBuiltin,
    CallApp,
    CallComposite,
    CallLocal,
    AsyncOp,
    LocalOp,
    LoopContinue,
    LoopBreak,
    /// `[future] <- [value]`
    Store,
    /// `[value] <- [future]`
    Load,
    /// `[ref] <- [var]`
    StoreRef,
    /// `[alias] <- [ref]`
    LoadRef,
    /// `[future] <- [ref]`
    Deref,
    /// `[alias] <- [var]`
    CopyRef,
    /// `[ref] <- [array, index future]`
    ArrayLookupFuture,
    /// `[ref] <- [array, index value]`
    ArrayLookupRefImm,
    /// `[alias] <- [closed array, index value]`
    ArrayLookupImm,
    /// `[array] <- [index future, member]`
    ArrayInsertFuture,
    /// `[array] <- [index value, member]`
    ArrayInsertImm,
    /// `[array] <- [key0, member0, key1, member1, ...]`
    ArrayBuild,
    /// `[array] <- []`
    ArrayDecrWriters,
    /// `[alias] <- [struct, field name]`
    StructLookup,
    /// `[struct] <- [field name, member]`
    StructInsert,
}

/// Fixed number of outputs and inputs of an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arity {
    pub outputs: usize,
    pub inputs: usize,
}

/// Static metadata of an opcode.
#[derive(Debug, Clone, Copy)]
pub struct OpcodeInfo {
    pub name: &'static str,
    /// Side effects regardless of operands. Calls and builtin ops refine this per callee.
    pub side_effects: bool,
    /// The output is an existing container that is written, not a fresh definition.
    pub mutates_container: bool,
    /// `None` for variadic layouts.
    pub arity: Option<Arity>,
}

impl Opcode {
    pub const ALL: [Opcode; 24] = [
        Opcode::Comment,
        Opcode::CallBuiltin,
        Opcode::CallApp,
        Opcode::CallComposite,
        Opcode::CallLocal,
        Opcode::AsyncOp,
        Opcode::LocalOp,
        Opcode::LoopContinue,
        Opcode::LoopBreak,
        Opcode::Store,
        Opcode::Load,
        Opcode::StoreRef,
        Opcode::LoadRef,
        Opcode::Deref,
        Opcode::CopyRef,
        Opcode::ArrayLookupFuture,
        Opcode::ArrayLookupRefImm,
        Opcode::ArrayLookupImm,
        Opcode::ArrayInsertFuture,
        Opcode::ArrayInsertImm,
        Opcode::ArrayBuild,
        Opcode::ArrayDecrWriters,
        Opcode::StructLookup,
        Opcode::StructInsert,
    ];

    pub fn info(self) -> &'static OpcodeInfo {
        static TABLE: OnceLock<Vec<OpcodeInfo>> = OnceLock::new();
        let table = TABLE.get_or_init(|| Opcode::ALL.iter().map(|op| op.describe()).collect());
        &table[self as usize]
    }

    pub fn name(self) -> &'static str {
        self.info().name
    }

    pub fn mutates_container(self) -> bool {
        self.info().mutates_container
    }

    fn describe(self) -> OpcodeInfo {
        let (name, side_effects, mutates_container, arity) = match self {
            Opcode::Comment => ("comment", true, false, None),
            Opcode::CallBuiltin => ("call_builtin", true, false, None),
            Opcode::CallApp => ("call_app", true, false, None),
            Opcode::CallComposite => ("call_composite", true, false, None),
            Opcode::CallLocal => ("call_local", true, false, None),
            Opcode::AsyncOp => ("async_op", false, false, None),
            Opcode::LocalOp => ("local_op", false, false, None),
            Opcode::LoopContinue => ("loop_continue", true, false, None),
            Opcode::LoopBreak => ("loop_break", true, false, None),
            Opcode::Store => ("store", false, false, Some((1, 1))),
            Opcode::Load => ("load", false, false, Some((1, 1))),
            Opcode::StoreRef => ("store_ref", false, false, Some((1, 1))),
            Opcode::LoadRef => ("load_ref", false, false, Some((1, 1))),
            Opcode::Deref => ("deref", false, false, Some((1, 1))),
            Opcode::CopyRef => ("copy_ref", false, false, Some((1, 1))),
            Opcode::ArrayLookupFuture => ("array_lookup_future", false, false, Some((1, 2))),
            Opcode::ArrayLookupRefImm => ("array_lookup_ref_imm", false, false, Some((1, 2))),
            Opcode::ArrayLookupImm => ("array_lookup_imm", false, false, Some((1, 2))),
            Opcode::ArrayInsertFuture => ("array_insert_future", false, true, Some((1, 2))),
            Opcode::ArrayInsertImm => ("array_insert_imm", false, true, Some((1, 2))),
            Opcode::ArrayBuild => ("array_build", false, true, None),
            Opcode::ArrayDecrWriters => ("array_decr_writers", false, true, Some((1, 0))),
            Opcode::StructLookup => ("struct_lookup", false, false, Some((1, 2))),
            Opcode::StructInsert => ("struct_insert", false, true, Some((1, 2))),
        };
        OpcodeInfo {
            name,
            side_effects,
            mutates_container,
            arity: arity.map(|(outputs, inputs)| Arity { outputs, inputs }),
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The immediate form of a builtin function, usable once its inputs are available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalEquivalent {
    Op(BuiltinOp),
    Function(&'static str),
}

/// Static metadata of a well known builtin function.
#[derive(Debug, Clone, Copy)]
pub struct BuiltinFunctionInfo {
    pub side_effects: bool,
    pub local: Option<LocalEquivalent>,
}

const UNKNOWN_BUILTIN: BuiltinFunctionInfo = BuiltinFunctionInfo {
    side_effects: true,
    local: None,
};

fn builtin_table() -> &'static HashMap<&'static str, BuiltinFunctionInfo> {
    static TABLE: OnceLock<HashMap<&'static str, BuiltinFunctionInfo>> = OnceLock::new();
    TABLE.get_or_init(|| {
        use LocalEquivalent::{Function, Op};

        let entries: [(&str, bool, LocalEquivalent); 22] = [
            ("strcat", false, Op(BuiltinOp::StrCat)),
            ("toint", false, Op(BuiltinOp::ParseInt)),
            ("tofloat", false, Op(BuiltinOp::ParseFloat)),
            ("fromint", false, Op(BuiltinOp::IntToStr)),
            ("fromfloat", false, Op(BuiltinOp::FloatToStr)),
            ("itof", false, Op(BuiltinOp::IntToFloat)),
            ("max_integer", false, Op(BuiltinOp::MaxInt)),
            ("min_integer", false, Op(BuiltinOp::MinInt)),
            ("abs_integer", false, Op(BuiltinOp::AbsInt)),
            ("pow_integer", false, Op(BuiltinOp::PowInt)),
            ("pow_float", false, Op(BuiltinOp::PowFloat)),
            ("floor", false, Op(BuiltinOp::Floor)),
            ("ceil", false, Op(BuiltinOp::Ceil)),
            ("round", false, Op(BuiltinOp::Round)),
            ("sqrt", false, Op(BuiltinOp::Sqrt)),
            ("exp", false, Op(BuiltinOp::Exp)),
            ("log", false, Op(BuiltinOp::Log)),
            ("strlen", false, Function("strlen_local")),
            ("trace", true, Op(BuiltinOp::Trace)),
            ("assert", true, Op(BuiltinOp::Assert)),
            ("assertEqual", true, Op(BuiltinOp::AssertEq)),
            ("sleep", true, Function("sleep_local")),
        ];

        entries
            .into_iter()
            .map(|(name, side_effects, local)| {
                (
                    name,
                    BuiltinFunctionInfo {
                        side_effects,
                        local: Some(local),
                    },
                )
            })
            .collect()
    })
}

/// Metadata for a builtin function. Unknown functions are side effecting with no local form.
pub fn builtin_function(name: &str) -> BuiltinFunctionInfo {
    builtin_table().get(name).copied().unwrap_or(UNKNOWN_BUILTIN)
}

/// Whether a local (immediate) function may have side effects.
pub fn local_function_side_effects(name: &str) -> bool {
    builtin_table()
        .values()
        .find(|info| matches!(info.local, Some(LocalEquivalent::Function(f)) if f == name))
        .is_none_or(|info| info.side_effects)
}
