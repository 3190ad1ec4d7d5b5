//! Hoists literals shared across call sites into program-wide constants.

use std::collections::HashMap;

use tracing::debug;

use crate::ir::{
    Arg, DefKind, IrError, Storage, Type, Var,
    fold::format_float,
    instruction::{CallKind, ExecMode, Instruction},
    tree::{Function, Program},
};

pub const PASS_NAME: &str = "promote-constants";

/// Literal operands that may be replaced by a closed future.
fn promotable(inst: &Instruction) -> Option<&[Arg]> {
    match inst {
        Instruction::Builtin(b) if b.mode == ExecMode::Async => Some(b.inputs.as_slice()),
        Instruction::Call(call) if call.kind != CallKind::Local => Some(call.inputs.as_slice()),
        _ => None,
    }
}

fn promotable_mut(inst: &mut Instruction) -> Option<&mut Vec<Arg>> {
    match inst {
        Instruction::Builtin(b) if b.mode == ExecMode::Async => Some(&mut b.inputs),
        Instruction::Call(call) if call.kind != CallKind::Local => Some(&mut call.inputs),
        _ => None,
    }
}

fn sanitize(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '-' => 'm',
            c if c.is_ascii_alphanumeric() => c,
            _ => '_',
        })
        .collect()
}

/// The name a global holding `value` gets, before disambiguation.
pub fn canonical_name(value: &Arg) -> Option<String> {
    let suffix = match value {
        Arg::Int(v) if *v < 0 => format!("im{}", v.unsigned_abs()),
        Arg::Int(v) => format!("i{v}"),
        Arg::Float(v) => format!("f{}", sanitize(&format_float(v.0))),
        Arg::Str(s) => format!("s{}", sanitize(&s.chars().take(24).collect::<String>())),
        Arg::Bool(b) => format!("b{b}"),
        Arg::Var(_) => return None,
    };
    Some(format!("__c_{suffix}"))
}

fn function_names(func: &Function) -> impl Iterator<Item = &str> {
    let declared = func
        .blocks_preorder(func.body)
        .into_iter()
        .flat_map(move |block| func.block(block).variables.iter().map(|v| v.name.as_str()))
        .collect::<Vec<_>>();
    func.inputs
        .iter()
        .chain(&func.outputs)
        .map(|v| v.name.as_str())
        .chain(declared)
}

fn unique_name(program: &Program, base: String) -> String {
    let taken = |name: &str| {
        program.globals.contains_key(name)
            || program
                .functions
                .iter()
                .any(|f| function_names(f).any(|n| n == name))
    };
    let mut name = base.clone();
    let mut suffix = 0;
    while taken(&name) {
        suffix += 1;
        name = format!("{base}_{suffix}");
    }
    name
}

/// Replaces every literal used at two or more call sites with a global constant.
///
/// Literals already held by a global reuse it. Returns whether anything was replaced.
pub fn promote_constants(program: &mut Program) -> Result<bool, IrError> {
    let mut uses: HashMap<Arg, usize> = HashMap::new();
    for func in &program.functions {
        for block in func.blocks_preorder(func.body) {
            let inputs = func.block(block).instructions.iter().filter_map(promotable);
            for arg in inputs.flatten().filter(|a| a.is_literal()) {
                *uses.entry(arg.clone()).or_default() += 1;
            }
        }
    }

    let mut shared: Vec<Arg> = uses
        .into_iter()
        .filter(|(_, count)| *count >= 2)
        .map(|(value, _)| value)
        .collect();
    shared.sort();
    if shared.is_empty() {
        return Ok(false);
    }

    let existing: HashMap<Arg, Var> = program
        .globals
        .values()
        .map(|g| (g.value.clone(), g.var.clone()))
        .collect();
    let mut promoted: HashMap<Arg, Var> = HashMap::new();
    for value in shared {
        if let Some(var) = existing.get(&value) {
            promoted.insert(value, var.clone());
            continue;
        }
        let (Some(prim), Some(base)) = (value.literal_type(), canonical_name(&value)) else {
            continue;
        };
        let name = unique_name(program, base);
        let var = Var::new(name, Type::Future(prim), Storage::GlobalConst, DefKind::Local);
        debug!(global = %var, %value, "promoting shared constant");
        program.add_global(var.clone(), value.clone())?;
        promoted.insert(value, var);
    }

    for func in &mut program.functions {
        for var in promoted.values() {
            func.reserve_name(var.name.clone());
        }
        for block in func.blocks_preorder(func.body) {
            let insts = &mut func.block_mut(block).instructions;
            for inputs in insts.iter_mut().filter_map(promotable_mut) {
                for arg in inputs.iter_mut() {
                    if let Some(var) = promoted.get(arg) {
                        *arg = Arg::Var(var.clone());
                    }
                }
            }
        }
    }
    Ok(!promoted.is_empty())
}
