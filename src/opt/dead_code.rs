use std::collections::HashSet;

use tracing::{debug, trace};

use super::{FunctionPass, PassContext};
use crate::{
    driver::config::OptimizerSettings,
    ir::{
        IrError, Var,
        continuation::{ContinuationKind, ForeachLoop, RangeLoop},
        instruction::Instruction,
        tree::Function,
    },
};

#[derive(Debug, Clone, Copy, Default)]
pub struct DeadCode;

impl FunctionPass for DeadCode {
    fn name(&self) -> &'static str {
        "dead-code"
    }

    fn enabled(&self, settings: &OptimizerSettings) -> bool {
        settings.dead_code_elim
    }

    fn run(&self, function: &mut Function, _cx: &mut PassContext<'_>) -> Result<bool, IrError> {
        eliminate(function)
    }
}

/// Variables whose value the instruction depends on. Loop control lists only forward
/// variables and don't keep them alive.
fn uses(inst: &Instruction) -> Vec<Var> {
    match inst {
        Instruction::LoopContinue(cont) => cont
            .new_vals
            .iter()
            .filter_map(|a| a.var())
            .cloned()
            .collect(),
        Instruction::LoopBreak(_) => vec![],
        other => other.read_vars(),
    }
}

fn needed_vars(func: &Function) -> HashSet<Var> {
    let mut needed: HashSet<Var> = func.outputs.iter().cloned().collect();
    for block in func.blocks_preorder(func.body) {
        let data = func.block(block);
        for inst in &data.instructions {
            needed.extend(uses(inst));
        }
        for cont in &data.continuations {
            needed.extend(func.cont(*cont).required_vars());
        }
    }
    needed
}

fn remove_dead_instructions(func: &mut Function, needed: &HashSet<Var>) -> usize {
    let mut removed = 0;
    for block in func.blocks_preorder(func.body) {
        let instructions = &mut func.block_mut(block).instructions;
        let before = instructions.len();
        instructions.retain(|inst| {
            let dead = !inst.has_side_effects()
                && inst.outputs().iter().all(|out| !needed.contains(out));
            if dead {
                trace!(%inst, "removing dead instruction");
            }
            !dead
        });
        removed += before - instructions.len();
    }
    removed
}

/// Declared variables, and loop counters, that nothing mentions any more.
fn unused_vars(func: &Function, needed: &HashSet<Var>) -> HashSet<Var> {
    let mut mentioned = needed.clone();
    let mut candidates = Vec::new();
    for block in func.blocks_preorder(func.body) {
        let data = func.block(block);
        candidates.extend(data.variables.iter().cloned());
        for inst in &data.instructions {
            mentioned.extend(uses(inst));
            mentioned.extend(inst.outputs());
        }
        for cont in &data.continuations {
            match &func.cont(*cont).kind {
                ContinuationKind::Foreach(ForeachLoop {
                    counter: Some(counter),
                    ..
                })
                | ContinuationKind::Range(RangeLoop {
                    counter: Some(counter),
                    ..
                }) => candidates.push(counter.clone()),
                _ => {}
            }
        }
    }
    candidates
        .into_iter()
        .filter(|v| !mentioned.contains(v) && !func.is_argument(v))
        .collect()
}

/// Removes side effect free instructions whose results are never used, then the
/// declarations left unused, until nothing changes.
pub fn eliminate(func: &mut Function) -> Result<bool, IrError> {
    let mut changed = false;
    loop {
        let needed = needed_vars(func);
        let instructions = remove_dead_instructions(func, &needed);
        let unused = unused_vars(func, &needed);
        if !unused.is_empty() {
            trace!(?unused, "removing unused variables");
            func.remove_vars(func.body, &unused)?;
        }
        if instructions == 0 && unused.is_empty() {
            break;
        }
        debug!(function = %func.name, instructions, vars = unused.len(), "dead code removed");
        changed = true;
    }
    Ok(changed)
}
