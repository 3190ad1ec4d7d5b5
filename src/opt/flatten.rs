use tracing::{debug, trace};

use super::{FunctionPass, PassContext};
use crate::{
    driver::config::OptimizerSettings,
    ir::{
        Facts, IrError, NoFacts,
        continuation::Predicted,
        tree::{ContId, Function},
    },
};

/// Inlines nested blocks and continuations whose outcome is statically known, and drops
/// continuations that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct Flatten;

impl FunctionPass for Flatten {
    fn name(&self) -> &'static str {
        "flatten"
    }

    fn enabled(&self, settings: &OptimizerSettings) -> bool {
        settings.flatten_nested
    }

    fn run(&self, function: &mut Function, _cx: &mut PassContext<'_>) -> Result<bool, IrError> {
        flatten(function)
    }
}

/// Replaces the continuation by the child that is known to run, or removes it if no child
/// ever runs. Returns whether the tree changed.
pub fn resolve(func: &mut Function, cont: ContId, facts: &dyn Facts) -> Result<bool, IrError> {
    if func.is_noop_cont(cont) {
        trace!(construct = func.cont(cont).name(), "removing empty continuation");
        func.remove_continuation(cont);
        return Ok(true);
    }
    match func.cont(cont).branch_predict(facts) {
        Some(Predicted::Block { block, bindings }) => {
            trace!(construct = func.cont(cont).name(), "inlining predicted block");
            func.inline_block(cont, block, bindings)?;
            Ok(true)
        }
        Some(Predicted::Nothing) => {
            trace!(construct = func.cont(cont).name(), "removing continuation that never runs");
            func.remove_continuation(cont);
            Ok(true)
        }
        None => Ok(false),
    }
}

pub fn flatten(func: &mut Function) -> Result<bool, IrError> {
    let mut rounds = 0;
    loop {
        let mut progress = false;
        for cont in func.conts_preorder(func.body) {
            // Inlining a parent may already have dropped this one.
            if func.conts.get(cont).is_none() {
                continue;
            }
            progress |= resolve(func, cont, &NoFacts)?;
        }
        if !progress {
            break;
        }
        rounds += 1;
    }
    if rounds > 0 {
        debug!(function = %func.name, rounds, "flattened");
    }
    Ok(rounds > 0)
}
