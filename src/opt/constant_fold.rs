use std::collections::{HashMap, hash_map::Entry};

use tracing::{debug, trace};

use super::{FunctionPass, PassContext, dead_code, flatten};
use crate::{
    driver::config::OptimizerSettings,
    ir::{
        Arg, Constants, IrError, RenameMode, Renames, Var, instruction::Instruction,
        tree::Function,
    },
};

/// Propagates literal values, folds operators over them and resolves branches they decide.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConstantFold;

impl FunctionPass for ConstantFold {
    fn name(&self) -> &'static str {
        "constant-fold"
    }

    fn enabled(&self, settings: &OptimizerSettings) -> bool {
        settings.constant_fold && settings.fold_rounds > 0
    }

    fn run(&self, function: &mut Function, cx: &mut PassContext<'_>) -> Result<bool, IrError> {
        let mut changed = false;
        for round in 0..cx.settings.fold_rounds {
            let progress = fold_round(function, cx)?;
            trace!(round, progress, "constant folding round");
            if !progress {
                break;
            }
            changed = true;
        }
        changed |= dead_code::eliminate(function)?;
        Ok(changed)
    }
}

/// What the writers of a variable agree it holds. `None` once any writer is unknown or two
/// writers disagree.
type Writes = HashMap<Var, Option<Arg>>;

fn record_writes(func: &Function, known: &Constants) -> Result<Writes, IrError> {
    let mut writes = Writes::new();
    for block in func.blocks_preorder(func.body) {
        for inst in &func.block(block).instructions {
            let folded: HashMap<Var, Arg> = inst
                .constant_fold(known)?
                .unwrap_or_default()
                .into_iter()
                .collect();
            for out in inst.outputs() {
                let value = folded.get(&out).cloned();
                match writes.entry(out) {
                    Entry::Vacant(entry) => {
                        entry.insert(value);
                    }
                    Entry::Occupied(mut entry) => {
                        if *entry.get() != value {
                            entry.insert(None);
                        }
                    }
                }
            }
        }
    }
    Ok(writes)
}

/// Variables whose every write is the same known literal, computed to a fixpoint.
pub fn known_constants(func: &Function, globals: &Constants) -> Result<Constants, IrError> {
    let mut known = globals.clone();
    loop {
        let mut next = globals.clone();
        next.extend(
            record_writes(func, &known)?
                .into_iter()
                .filter_map(|(var, value)| Some((var, value?))),
        );
        if next == known {
            return Ok(known);
        }
        known = next;
    }
}

/// Occurrences of known variables in places that read them.
fn known_reads(func: &Function, known: &Constants) -> usize {
    let mut count = 0;
    for block in func.blocks_preorder(func.body) {
        let data = func.block(block);
        for inst in &data.instructions {
            count += inst.read_vars().iter().filter(|v| known.contains_key(*v)).count();
        }
        for cont in &data.continuations {
            count += func
                .cont(*cont)
                .required_vars()
                .iter()
                .filter(|v| known.contains_key(*v))
                .count();
        }
    }
    count
}

/// Rewrites computations with a known result into a plain copy of the literal.
fn replace_folded(func: &mut Function, known: &Constants) -> usize {
    let mut replaced = 0;
    for block in func.blocks_preorder(func.body) {
        for inst in &mut func.block_mut(block).instructions {
            if !matches!(inst, Instruction::Builtin(_) | Instruction::Call(_))
                || inst.has_side_effects()
            {
                continue;
            }
            let outputs = inst.outputs();
            let [out] = outputs.as_slice() else {
                continue;
            };
            let Some(value) = known.get(out) else {
                continue;
            };
            let copy = Instruction::copy(out, value.clone());
            if copy != *inst {
                trace!(%inst, %value, "replacing folded computation");
                *inst = copy;
                replaced += 1;
            }
        }
    }
    replaced
}

fn fold_round(func: &mut Function, cx: &mut PassContext<'_>) -> Result<bool, IrError> {
    let known = known_constants(func, &cx.globals)?;

    let before = known_reads(func, &known);
    let renames: Renames = known.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    func.rename_vars(func.body, &renames, RenameMode::InputsOnly);
    let substituted = known_reads(func, &known) < before;
    let replaced = replace_folded(func, &known);

    let mut resolved = 0;
    for cont in func.conts_preorder(func.body) {
        if func.conts.get(cont).is_some() && flatten::resolve(func, cont, &known)? {
            resolved += 1;
        }
    }

    for block in func.blocks_preorder(func.body) {
        let failures: Vec<String> = func
            .block(block)
            .instructions
            .iter()
            .filter_map(|inst| inst.failed_assertion(&known))
            .collect();
        for failure in failures {
            cx.warn(format!("in function {}: assertion will fail: {failure}", func.name));
        }
    }

    let changed = substituted || replaced > 0 || resolved > 0;
    if changed {
        debug!(
            function = %func.name,
            constants = known.len(),
            replaced,
            resolved,
            "folded constants"
        );
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{
        DefKind, PrimType, Storage, Type,
        continuation::{ContinuationKind, IfStatement},
        fold::BuiltinOp,
        tree::Program,
    };

    fn future(name: &str, prim: PrimType) -> Var {
        Var::new(name, Type::Future(prim), Storage::Future, DefKind::Local)
    }

    fn int(name: &str) -> Var {
        future(name, PrimType::Int)
    }

    fn run(func: &mut Function) -> (bool, Vec<String>) {
        let settings = OptimizerSettings::default();
        let program = Program::default();
        let mut cx = PassContext::new(&settings, &program);
        let changed = ConstantFold.run(func, &mut cx).unwrap();
        (changed, cx.warnings)
    }

    #[test]
    fn folds_chain_into_single_store() {
        let out = Var::new("o", Type::Future(PrimType::Int), Storage::Future, DefKind::OutArg);
        let mut func = Function::new("f", vec![], vec![out.clone()]);
        let body = func.body;
        func.declare(body, int("x")).unwrap();
        func.declare(body, int("y")).unwrap();
        let insts = &mut func.block_mut(body).instructions;
        insts.push(Instruction::store(&int("x"), Arg::Int(2)));
        insts.push(Instruction::async_op(
            BuiltinOp::PlusInt,
            Some(int("y")),
            vec![int("x").into(), Arg::Int(3)],
        ));
        insts.push(Instruction::async_op(BuiltinOp::Copy, Some(out.clone()), vec![int("y").into()]));

        let (changed, warnings) = run(&mut func);
        assert!(changed);
        assert!(warnings.is_empty());
        let block = func.block(body);
        assert_eq!(block.instructions, vec![Instruction::store(&out, Arg::Int(5))]);
        assert!(block.variables.is_empty());
    }

    #[test]
    fn conflicting_writers_are_not_constant() {
        let mut func = Function::new("f", vec![], vec![]);
        let body = func.body;
        func.declare(body, int("x")).unwrap();
        let insts = &mut func.block_mut(body).instructions;
        insts.push(Instruction::store(&int("x"), Arg::Int(1)));
        insts.push(Instruction::store(&int("x"), Arg::Int(2)));

        let known = known_constants(&func, &Constants::new()).unwrap();
        assert!(known.is_empty());
    }

    #[test]
    fn resolves_branch_on_folded_condition() {
        let flag = future("t", PrimType::Bool);
        let mut func = Function::new("f", vec![], vec![]);
        let body = func.body;
        func.declare(body, flag.clone()).unwrap();
        func.block_mut(body).instructions.push(Instruction::store(&flag, Arg::Bool(true)));
        let cont = func.add_continuation(
            body,
            ContinuationKind::If(IfStatement {
                cond: Arg::Var(flag),
            }),
        );
        for value in [1, 2] {
            let child = func.add_child(cont);
            func.block_mut(child)
                .instructions
                .push(Instruction::async_op(BuiltinOp::Trace, None, vec![Arg::Int(value)]));
        }

        assert!(run(&mut func).0);
        let block = func.block(body);
        assert!(block.continuations.is_empty());
        assert_eq!(
            block.instructions,
            vec![Instruction::async_op(BuiltinOp::Trace, None, vec![Arg::Int(1)])]
        );
    }

    #[test]
    fn failing_assertion_is_reported_once() {
        let mut func = Function::new("f", vec![], vec![]);
        let body = func.body;
        let flag = future("ok", PrimType::Bool);
        func.declare(body, flag.clone()).unwrap();
        let insts = &mut func.block_mut(body).instructions;
        insts.push(Instruction::store(&flag, Arg::Bool(false)));
        insts.push(Instruction::async_op(
            BuiltinOp::Assert,
            None,
            vec![flag.into(), Arg::str("boom")],
        ));

        let (_, warnings) = run(&mut func);
        assert_eq!(warnings, vec!["in function f: assertion will fail: boom".to_string()]);
        assert_eq!(func.block(body).instructions.len(), 1);
    }
}
