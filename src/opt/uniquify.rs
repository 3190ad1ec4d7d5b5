use std::{collections::HashSet, sync::Arc};

use tracing::{debug, trace};

use super::{FunctionPass, PassContext};
use crate::ir::{
    Arg, IrError, RenameMode, Renames,
    instruction::rename_var,
    tree::{BlockId, Function},
};

/// Renames shadowing declarations so every variable name is declared once per function.
#[derive(Debug, Clone, Copy, Default)]
pub struct Uniquify;

impl FunctionPass for Uniquify {
    fn name(&self) -> &'static str {
        "uniquify"
    }

    fn run(&self, function: &mut Function, cx: &mut PassContext<'_>) -> Result<bool, IrError> {
        let globals: Vec<String> = cx.globals.keys().map(|v| v.name.clone()).collect();
        Ok(uniquify(function, globals))
    }
}

struct Walk<'f> {
    func: &'f mut Function,
    seen: HashSet<String>,
    renamed: usize,
}

/// Makes declared names unique. `reserved` names are treated as already declared.
pub fn uniquify(func: &mut Function, reserved: impl IntoIterator<Item = String>) -> bool {
    let mut seen: HashSet<String> = func
        .inputs
        .iter()
        .chain(&func.outputs)
        .map(|v| v.name.clone())
        .collect();
    for name in reserved {
        func.reserve_name(name.clone());
        seen.insert(name);
    }

    let body = func.body;
    let mut walk = Walk {
        func,
        seen,
        renamed: 0,
    };
    walk.block(body, &Arc::new(Renames::new()));
    if walk.renamed > 0 {
        debug!(function = %walk.func.name, renamed = walk.renamed, "uniquified names");
    }
    walk.renamed > 0
}

impl Walk<'_> {
    fn block(&mut self, block: BlockId, parent: &Arc<Renames>) {
        let mut scope = Renames::child(parent);

        let declared = self.func.block(block).variables.clone();
        let mut variables = Vec::with_capacity(declared.len());
        for var in declared {
            if self.seen.insert(var.name.clone()) {
                variables.push(var);
                continue;
            }
            let fresh = self.func.fresh_var(&var);
            trace!(old = %var, new = %fresh, "renaming shadowing declaration");
            self.seen.insert(fresh.name.clone());
            scope.insert(var, Arg::Var(fresh.clone()));
            variables.push(fresh);
            self.renamed += 1;
        }

        let data = self.func.block_mut(block);
        data.variables = variables;
        for inst in &mut data.instructions {
            inst.rename(&scope, RenameMode::All);
        }
        for var in &mut data.cleanups {
            rename_var(var, &scope);
        }

        let scope = Arc::new(scope);
        for cont in self.func.block(block).continuations.clone() {
            let cont_data = self.func.cont_mut(cont);
            cont_data.rename_inputs(&scope);

            let mut defs = Renames::child(&scope);
            for var in cont_data.defined_vars() {
                if self.seen.insert(var.name.clone()) {
                    continue;
                }
                let fresh = self.func.fresh_var(&var);
                self.seen.insert(fresh.name.clone());
                defs.insert(var, Arg::Var(fresh));
                self.renamed += 1;
            }
            self.func.cont_mut(cont).rename_defined(&defs);

            let defs = Arc::new(defs);
            for child in self.func.cont(cont).children.clone() {
                self.block(child, &defs);
            }
        }
    }
}
