use std::collections::{BTreeSet, HashSet};

use tracing::trace;

use super::{FunctionPass, PassContext};
use crate::ir::{
    IrError, Storage, Var,
    instruction::Instruction,
    tree::{BlockId, ContId, Function},
};

/// Recomputes the variables threaded into constructs that don't inherit their parent's scope.
///
/// Runs last: earlier passes substitute and drop variables freely without keeping the
/// passed-in and keep-open lists exact.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fixup;

impl FunctionPass for Fixup {
    fn name(&self) -> &'static str {
        "fixup"
    }

    fn run(&self, function: &mut Function, _cx: &mut PassContext<'_>) -> Result<bool, IrError> {
        let mut changed = false;
        for cont in function.conts_preorder(function.body) {
            if !function.cont(cont).inherits_parent_vars() {
                changed |= fix_continuation(function, cont);
            }
        }
        Ok(changed)
    }
}

/// Variables read and written inside a continuation's children.
#[derive(Default)]
struct Usage {
    used: BTreeSet<Var>,
    written: HashSet<Var>,
    declared: HashSet<Var>,
    continues: Vec<(BlockId, usize)>,
}

fn usage(func: &Function, cont: ContId) -> Usage {
    let mut usage = Usage::default();
    usage.declared.extend(func.cont(cont).defined_vars());
    for child in &func.cont(cont).children {
        for block in func.blocks_preorder(*child) {
            let data = func.block(block);
            usage.declared.extend(data.variables.iter().cloned());
            for (index, inst) in data.instructions.iter().enumerate() {
                usage.used.extend(inst.mentioned_vars());
                usage.written.extend(inst.outputs());
                if let Instruction::LoopContinue(lc) = inst {
                    if lc.loop_id == Some(cont) {
                        usage.continues.push((block, index));
                    }
                }
            }
            usage.used.extend(data.cleanups.iter().cloned());
            for inner in &data.continuations {
                let inner = func.cont(*inner);
                usage.declared.extend(inner.defined_vars());
                usage.used.extend(inner.required_vars());
            }
        }
    }
    usage
}

/// Keeps the surviving entries of `current` in order and appends the rest sorted.
fn reconcile(current: &[Var], wanted: &BTreeSet<Var>) -> Vec<Var> {
    current
        .iter()
        .filter(|v| wanted.contains(*v))
        .cloned()
        .chain(wanted.iter().filter(|v| !current.contains(v)).cloned())
        .collect()
}

fn fix_continuation(func: &mut Function, cont: ContId) -> bool {
    let usage = usage(func, cont);
    let passed: BTreeSet<Var> = usage
        .used
        .iter()
        .filter(|v| !usage.declared.contains(*v) && v.storage != Storage::GlobalConst)
        .cloned()
        .collect();
    let keep_open: BTreeSet<Var> = passed
        .iter()
        .filter(|v| usage.written.contains(*v) && !v.is_value())
        .cloned()
        .collect();

    let data = func.cont_mut(cont);
    let new_passed = reconcile(&data.passed_vars, &passed);
    let new_keep_open = reconcile(&data.keep_open_vars, &keep_open);
    if new_passed == data.passed_vars && new_keep_open == data.keep_open_vars {
        return false;
    }
    let added: Vec<Var> = new_passed
        .iter()
        .filter(|v| !data.passed_vars.contains(v))
        .cloned()
        .collect();
    trace!(
        construct = data.name(),
        passed = new_passed.len(),
        keep_open = new_keep_open.len(),
        "fixed up passed variables"
    );
    data.passed_vars = new_passed;
    data.keep_open_vars = new_keep_open;

    for (block, index) in usage.continues {
        if let Instruction::LoopContinue(lc) = &mut func.block_mut(block).instructions[index] {
            for var in &added {
                if !lc.passed_vars.contains(var) {
                    lc.passed_vars.push(var.clone());
                }
            }
        }
    }
    true
}
