//! Forward dataflow over the block tree.
//!
//! Walks every block in program order carrying three scoped facts: computed values for
//! value numbering, variables known to be closed, and pending substitutions. Recomputations
//! are replaced by the earlier result, blocking instructions whose inputs are closed are
//! rewritten into immediate form, and waits on closed variables are eliminated.

use std::sync::Arc;

use tracing::{debug, trace};

use super::{FunctionPass, PassContext, dead_code};
use crate::{
    driver::config::OptimizerSettings,
    ir::{
        Arg, Constants, DefKind, Facts, IrError, RenameMode, Renames, ScopedMap, Storage, Var,
        computed::{ComputedValue, ValueKey, ValueTable},
        continuation::{ContinuationKind, Predicted},
        instruction::{Fetched, Instruction, MakeImmRequest, OutputSubst},
        opcode::Opcode,
        tree::{BlockId, ContId, Function},
    },
};

#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardDataflow;

impl FunctionPass for ForwardDataflow {
    fn name(&self) -> &'static str {
        "forward-dataflow"
    }

    fn enabled(&self, settings: &OptimizerSettings) -> bool {
        settings.forward_dataflow
    }

    fn run(&self, function: &mut Function, cx: &mut PassContext<'_>) -> Result<bool, IrError> {
        let changes = analyze(function, &cx.globals, cx.settings.make_immediate)?;
        if changes > 0 {
            debug!(function = %function.name, changes, "forward dataflow");
        }
        let cleaned = dead_code::eliminate(function)?;
        Ok(changes > 0 || cleaned)
    }
}

type Closed = ScopedMap<Var, ()>;

/// The facts visible at the start of a block.
#[derive(Debug, Clone)]
struct Scope {
    values: Arc<ValueTable>,
    closed: Arc<Closed>,
    renames: Arc<Renames>,
}

struct Known<'a> {
    values: &'a ValueTable,
    closed: &'a Closed,
}

impl Facts for Known<'_> {
    fn constant(&self, var: &Var) -> Option<Arg> {
        self.values
            .stored_value(var)
            .filter(|value| value.is_literal())
            .cloned()
    }

    fn is_closed(&self, var: &Var) -> bool {
        self.closed.contains_key(var) || self.constant(var).is_some()
    }
}

/// Facts accumulated while walking the instructions of one block.
struct BlockState {
    values: ValueTable,
    closed: Closed,
    renames: Renames,
    /// Substitutions applied to the whole block subtree once the block is done.
    pending: Renames,
    emitted: Vec<Instruction>,
}

impl BlockState {
    fn facts(&self) -> Known<'_> {
        Known {
            values: &self.values,
            closed: &self.closed,
        }
    }

    fn learn(&mut self, value: ComputedValue) {
        if value.closed {
            if let Arg::Var(var) = &value.value {
                self.closed.insert(var.clone(), ());
            }
        }
        self.values.add(value);
    }

    fn record(&mut self, inst: &Instruction) {
        for value in inst.computed_values(&self.values) {
            self.learn(value);
        }
        for var in inst.closed_after() {
            self.closed.insert(var, ());
        }
    }

    fn emit(&mut self, inst: Instruction) {
        self.record(&inst);
        self.emitted.push(inst);
    }
}

/// Runs the analysis and rewrites over the function, returning the number of changes.
pub fn analyze(
    func: &mut Function,
    globals: &Constants,
    make_immediate: bool,
) -> Result<usize, IrError> {
    let mut values = ValueTable::new();
    let mut closed = Closed::new();
    for (var, value) in globals {
        values.add(ComputedValue::new(
            ValueKey::of(Opcode::Load, [Arg::Var(var.clone())]),
            value.clone(),
            true,
        ));
        closed.insert(var.clone(), ());
    }
    let root = Scope {
        values: Arc::new(values),
        closed: Arc::new(closed),
        renames: Arc::new(Renames::new()),
    };

    let body = func.body;
    let mut walk = Walk {
        func,
        make_immediate,
        changes: 0,
    };
    walk.block(body, &root, vec![])?;
    Ok(walk.changes)
}

struct Walk<'f> {
    func: &'f mut Function,
    make_immediate: bool,
    changes: usize,
}

impl Walk<'_> {
    fn block(&mut self, block: BlockId, parent: &Scope, entry_closed: Vec<Var>) -> Result<(), IrError> {
        let mut closed = Closed::child(&parent.closed);
        closed.extend(entry_closed.into_iter().map(|var| (var, ())));
        let mut st = BlockState {
            values: ValueTable::child(&parent.values),
            closed,
            renames: Renames::child(&parent.renames),
            pending: Renames::new(),
            emitted: Vec::new(),
        };

        let instructions = std::mem::take(&mut self.func.block_mut(block).instructions);
        for inst in instructions {
            self.instruction(block, inst, &mut st)?;
        }
        self.func.block_mut(block).instructions = st.emitted;

        let scope = Scope {
            values: Arc::new(st.values),
            closed: Arc::new(st.closed),
            renames: Arc::new(st.renames),
        };
        let mut queue = self.func.block(block).continuations.clone();
        let mut next = 0;
        while let Some(cont) = queue.get(next).copied() {
            next += 1;
            if self.func.conts.get(cont).is_none() {
                continue;
            }
            if self.continuation(cont, &scope)? {
                let current = self.func.block(block).continuations.clone();
                for spliced in current {
                    if !queue.contains(&spliced) {
                        queue.push(spliced);
                    }
                }
            }
        }

        if !st.pending.is_empty() {
            self.func.rename_vars(block, &st.pending, RenameMode::InputsOnly);
        }
        Ok(())
    }

    /// Returns whether the continuation was inlined into its parent.
    fn continuation(&mut self, cont: ContId, scope: &Scope) -> Result<bool, IrError> {
        let facts = Known {
            values: &scope.values,
            closed: &scope.closed,
        };
        let data = self.func.cont_mut(cont);
        data.rename_inputs(&scope.renames);

        if let ContinuationKind::Wait(wait) = &mut data.kind {
            if !wait.explicit {
                let before = wait.wait_vars.len();
                wait.wait_vars
                    .retain(|var| !var.is_value() && !facts.is_closed(var));
                if wait.wait_vars.len() < before {
                    trace!(wait = %wait.name, "pruned closed wait variables");
                    self.changes += 1;
                }
            }
        }

        let prediction = match data.kind {
            ContinuationKind::Nested => None,
            _ => data.branch_predict(&facts),
        };
        match prediction {
            Some(Predicted::Block { block, bindings }) => {
                trace!(construct = data.name(), "inlining resolved continuation");
                self.func.inline_block(cont, block, bindings)?;
                self.changes += 1;
                Ok(true)
            }
            Some(Predicted::Nothing) => {
                self.func.remove_continuation(cont);
                self.changes += 1;
                Ok(false)
            }
            None => {
                let entry = data.closed_in_children();
                for child in data.children.clone() {
                    self.block(child, scope, entry.clone())?;
                }
                Ok(false)
            }
        }
    }

    fn instruction(
        &mut self,
        block: BlockId,
        mut inst: Instruction,
        st: &mut BlockState,
    ) -> Result<(), IrError> {
        inst.rename(&st.renames, RenameMode::InputsOnly);
        if let Some(short) = inst.short_circuit(&st.values) {
            trace!(%inst, %short, "short circuited indirection");
            inst = short;
            self.changes += 1;
        }

        if let Some((key, out)) = inst.value_key() {
            let existing = st.values.get(&key).cloned();
            if let Some(existing) = existing.filter(|e| e.var() != Some(&out)) {
                self.changes += 1;
                match &existing {
                    Arg::Var(prev) if self.can_replace(block, &out, prev) => {
                        trace!(%out, %prev, "reusing computed value");
                        st.renames.insert(out.clone(), existing.clone());
                        st.pending.insert(out, existing.clone());
                    }
                    _ => {
                        let copy = Instruction::copy(&out, existing.clone());
                        trace!(%inst, %copy, "replacing recomputation");
                        st.emit(copy);
                    }
                }
                return Ok(());
            }
        }

        if self.make_immediate {
            if let Some(req) = inst.can_make_immediate(&st.facts()) {
                if self.immediate(block, &inst, &req, st)? {
                    return Ok(());
                }
            }
        }
        st.emit(inst);
        Ok(())
    }

    /// Whether every use of `out` may read `prev` instead.
    fn can_replace(&self, block: BlockId, out: &Var, prev: &Var) -> bool {
        self.func.block(block).declares(out)
            && !out.is_escaping()
            && prev.ty == out.ty
            && prev.storage == out.storage
    }

    /// The contents of a future or reference, if an earlier store or fetch revealed them.
    fn known_contents(var: &Var, st: &BlockState) -> Option<Arg> {
        let opcode = if var.ty.is_ref() {
            Opcode::LoadRef
        } else {
            Opcode::Load
        };
        let retrieved = var.ty.retrieved()?;
        st.values
            .get(&ValueKey::of(opcode, [Arg::Var(var.clone())]))
            .filter(|value| match value {
                Arg::Var(v) => v.ty == retrieved,
                _ => true,
            })
            .cloned()
    }

    /// Rewrites `inst` into its immediate form. Returns false if it can't be expressed.
    fn immediate(
        &mut self,
        block: BlockId,
        inst: &Instruction,
        req: &MakeImmRequest,
        st: &mut BlockState,
    ) -> Result<bool, IrError> {
        let Some(output_types) = req
            .outputs
            .iter()
            .map(|out| out.ty.retrieved())
            .collect::<Option<Vec<_>>>()
        else {
            return Ok(false);
        };
        if req.inputs.iter().any(|var| var.ty.retrieved().is_none()) {
            return Ok(false);
        }

        let mut inputs = Vec::with_capacity(req.inputs.len());
        for var in &req.inputs {
            if let Some(known) = Self::known_contents(var, st) {
                inputs.push(known);
                continue;
            }
            let name = self.func.fresh_name(&var.name);
            let fetched = Instruction::fetched_var(var, name).ok_or_else(|| {
                IrError::NotImmediate {
                    instruction: inst.to_string(),
                }
            })?;
            self.func.declare(block, fetched.clone())?;
            st.emit(Instruction::fetch(&fetched, var));
            inputs.push(Arg::Var(fetched));
        }

        let mut outputs = Vec::with_capacity(output_types.len());
        for (out, ty) in req.outputs.iter().zip(output_types) {
            let value = self.func.fresh_temp(&out.name, ty);
            self.func.declare(block, value.clone())?;
            outputs.push(value);
        }

        let new_output = match &req.changed_output {
            Some((old, ty)) => {
                let storage = if ty.is_value() {
                    Storage::Local
                } else {
                    Storage::Alias
                };
                let var = Var::new(self.func.fresh_name(&old.name), ty.clone(), storage, DefKind::Temp);
                self.func.declare(block, var.clone())?;
                Some(var)
            }
            None => None,
        };

        let change = inst.make_immediate(
            req,
            &Fetched {
                inputs,
                outputs: outputs.clone(),
                new_output,
            },
        )?;
        trace!(%inst, "made immediate");

        for value in inst.computed_values(&st.values) {
            st.learn(value);
        }
        for new in change.instructions {
            new.validate()?;
            st.emit(new);
        }
        for (out, value) in req.outputs.iter().zip(&outputs) {
            st.emit(Instruction::store(out, Arg::Var(value.clone())));
        }
        if let Some(OutputSubst { old, new }) = change.output_subst {
            st.emit(Instruction::store_ref(&old, &new));
        }
        self.changes += 1;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{
        PrimType, Type,
        continuation::WaitStatement,
        fold::BuiltinOp,
        tree::Program,
    };

    fn int(name: &str) -> Var {
        Var::new(name, Type::Future(PrimType::Int), Storage::Future, DefKind::Local)
    }

    fn input(name: &str) -> Var {
        Var::new(name, Type::Future(PrimType::Int), Storage::Future, DefKind::InArg)
    }

    fn trace_of(var: &Var) -> Instruction {
        Instruction::async_op(BuiltinOp::Trace, None, vec![var.into()])
    }

    fn run(func: &mut Function) -> bool {
        let settings = OptimizerSettings::default();
        let program = Program::default();
        let mut cx = PassContext::new(&settings, &program);
        ForwardDataflow.run(func, &mut cx).unwrap()
    }

    #[test]
    fn commuted_recomputation_is_reused() {
        let a = input("a");
        let mut func = Function::new("f", vec![a.clone()], vec![]);
        let body = func.body;
        func.declare(body, int("y1")).unwrap();
        func.declare(body, int("y2")).unwrap();
        let insts = &mut func.block_mut(body).instructions;
        insts.push(trace_of(&int("y2")));
        insts.push(Instruction::async_op(
            BuiltinOp::PlusInt,
            Some(int("y1")),
            vec![a.clone().into(), Arg::Int(1)],
        ));
        insts.push(Instruction::async_op(
            BuiltinOp::PlusInt,
            Some(int("y2")),
            vec![Arg::Int(1), a.into()],
        ));

        assert!(run(&mut func));
        let block = func.block(body);
        assert_eq!(block.instructions.len(), 2);
        assert_eq!(block.instructions[0], trace_of(&int("y1")));
        assert_eq!(block.variables, vec![int("y1")]);
    }

    #[test]
    fn load_of_stored_literal_becomes_local_copy() {
        let v = Var::new("v", Type::Value(PrimType::Int), Storage::Local, DefKind::Local);
        let mut func = Function::new("f", vec![], vec![]);
        let body = func.body;
        func.declare(body, int("x")).unwrap();
        func.declare(body, v.clone()).unwrap();
        let insts = &mut func.block_mut(body).instructions;
        insts.push(Instruction::store(&int("x"), Arg::Int(3)));
        insts.push(Instruction::load(&v, &int("x")));
        insts.push(trace_of(&v));

        assert!(run(&mut func));
        let block = func.block(body);
        assert_eq!(
            block.instructions,
            vec![
                Instruction::local_op(BuiltinOp::Copy, Some(v.clone()), vec![Arg::Int(3)]),
                Instruction::local_op(BuiltinOp::Trace, None, vec![v.into()]),
            ]
        );
    }

    fn wait_on(func: &mut Function, var: &Var, explicit: bool) -> ContId {
        let body = func.body;
        let cont = func.add_continuation(
            body,
            ContinuationKind::Wait(WaitStatement {
                name: format!("wait_{}", var.name),
                wait_vars: vec![var.clone()],
                explicit,
            }),
        );
        let child = func.add_child(cont);
        func.block_mut(child).instructions.push(trace_of(var));
        cont
    }

    #[test]
    fn waits_on_closed_variables_are_inlined() {
        let a = input("a");
        let mut func = Function::new("f", vec![a.clone()], vec![]);
        let body = func.body;
        func.declare(body, int("x")).unwrap();
        func.block_mut(body)
            .instructions
            .push(Instruction::store(&int("x"), Arg::Int(1)));
        wait_on(&mut func, &int("x"), true);
        let pending = wait_on(&mut func, &a, false);

        assert!(run(&mut func));
        let block = func.block(body);
        assert_eq!(block.continuations, vec![pending]);
        assert_eq!(block.instructions.len(), 2);
        match &func.cont(pending).kind {
            ContinuationKind::Wait(wait) => assert_eq!(wait.wait_vars, vec![a]),
            other => panic!("unexpected {}", other.name()),
        }
    }

    #[test]
    fn closed_inputs_make_builtins_immediate() {
        let a = input("a");
        let out = Var::new("y", Type::Future(PrimType::Int), Storage::Future, DefKind::OutArg);
        let mut func = Function::new("f", vec![a.clone()], vec![out.clone()]);
        let body = func.body;
        let cont = func.add_continuation(
            body,
            ContinuationKind::Wait(WaitStatement {
                name: "w".into(),
                wait_vars: vec![a.clone()],
                explicit: false,
            }),
        );
        let child = func.add_child(cont);
        func.block_mut(child).instructions.push(Instruction::async_op(
            BuiltinOp::PlusInt,
            Some(out.clone()),
            vec![a.into(), Arg::Int(1)],
        ));

        assert!(run(&mut func));
        let opcodes: Vec<Opcode> = func
            .block(child)
            .instructions
            .iter()
            .map(Instruction::opcode)
            .collect();
        assert_eq!(opcodes, vec![Opcode::Load, Opcode::LocalOp, Opcode::Store]);
        assert_eq!(func.block(child).variables.len(), 2);
    }
}
