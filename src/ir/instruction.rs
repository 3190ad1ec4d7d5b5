use std::fmt;

use itertools::Itertools;

use super::{
    Arg, DefKind, Facts, IrError, RenameMode, Renames, Storage, Type, Var,
    computed::{ComputedValue, ValueKey, ValueOp, ValueTable},
    fold::{self, BuiltinOp},
    opcode::{self, Arity, LocalEquivalent, Opcode},
    tree::ContId,
};

/// Whether an operator runs once its inputs are ready, or right away on plain values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecMode {
    Async,
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Builtin,
    /// An external application, opaque to the optimizer.
    App,
    /// A user function.
    Composite,
    /// An immediate builtin working on plain values.
    Local,
}

impl CallKind {
    pub fn opcode(self) -> Opcode {
        match self {
            CallKind::Builtin => Opcode::CallBuiltin,
            CallKind::App => Opcode::CallApp,
            CallKind::Composite => Opcode::CallComposite,
            CallKind::Local => Opcode::CallLocal,
        }
    }
}

/// A container, reference or future primitive. The operand layout is fixed by the opcode.
#[derive(Debug, Clone, PartialEq)]
pub struct TurbineOp {
    pub op: Opcode,
    /// For container mutations this is the container being written.
    pub outputs: Vec<Var>,
    pub inputs: Vec<Arg>,
}

impl TurbineOp {
    /// Whether a literal may replace the variable at an input position.
    pub fn accepts_literal(&self, index: usize) -> bool {
        match self.op {
            Opcode::Store | Opcode::Load => true,
            Opcode::ArrayLookupFuture
            | Opcode::ArrayLookupRefImm
            | Opcode::ArrayLookupImm
            | Opcode::StructLookup => index == 1,
            Opcode::ArrayInsertFuture | Opcode::ArrayInsertImm | Opcode::StructInsert => {
                index == 0
            }
            Opcode::ArrayBuild => index % 2 == 0,
            _ => false,
        }
    }

    /// Checks operand counts and that literals only appear where the layout allows them.
    pub fn validate(&self) -> Result<(), IrError> {
        let arity = match self.op.info().arity {
            Some(arity) => arity,
            None if self.op == Opcode::ArrayBuild => Arity {
                outputs: 1,
                inputs: self.inputs.len().next_multiple_of(2),
            },
            None => {
                return Err(IrError::MisplacedOpcode {
                    op: self.op.name(),
                });
            }
        };
        if self.outputs.len() != arity.outputs {
            return Err(IrError::OutputCount {
                op: self.op.name(),
                expected: arity.outputs,
                found: self.outputs.len(),
            });
        }
        if self.inputs.len() != arity.inputs {
            return Err(IrError::OperandCount {
                op: self.op.name(),
                expected: arity.inputs,
                found: self.inputs.len(),
            });
        }

        match self
            .inputs
            .iter()
            .enumerate()
            .find(|(index, arg)| arg.is_literal() && !self.accepts_literal(*index))
        {
            Some((index, found)) => Err(IrError::ExpectedVariable {
                instruction: Instruction::Op(self.clone()).to_string(),
                index,
                found: found.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Whether the op writes its output, as opposed to binding an alias or a value to it.
    fn writes_output(&self) -> bool {
        self.op.mutates_container()
            || matches!(
                self.op,
                Opcode::Store
                    | Opcode::StoreRef
                    | Opcode::Deref
                    | Opcode::ArrayLookupFuture
                    | Opcode::ArrayLookupRefImm
            )
    }

    fn output(&self) -> &Var {
        &self.outputs[0]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuiltinInstr {
    pub mode: ExecMode,
    pub op: BuiltinOp,
    pub output: Option<Var>,
    pub inputs: Vec<Arg>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub kind: CallKind,
    pub function: String,
    pub outputs: Vec<Var>,
    pub inputs: Vec<Arg>,
}

/// Re-enters the enclosing loop with new values for its loop variables.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopContinue {
    /// The loop this belongs to, linked during construction.
    pub loop_id: Option<ContId>,
    pub new_vals: Vec<Arg>,
    /// Extra variables threaded into the next iteration.
    pub passed_vars: Vec<Var>,
    /// Whether the next iteration waits for each loop variable.
    pub blocking: Vec<bool>,
}

/// Leaves the enclosing loop, dropping the writers the loop held on `close_vars`.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopBreak {
    pub loop_id: Option<ContId>,
    pub close_vars: Vec<Var>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Comment(String),
    Op(TurbineOp),
    Builtin(BuiltinInstr),
    Call(FunctionCall),
    LoopContinue(LoopContinue),
    LoopBreak(LoopBreak),
}

/// What an instruction needs before it can be rewritten into its immediate form.
#[derive(Debug, Clone, PartialEq)]
pub struct MakeImmRequest {
    /// Outputs the immediate form produces as plain values, to be stored back afterwards.
    pub outputs: Vec<Var>,
    /// Inputs whose contents have to be fetched first.
    pub inputs: Vec<Var>,
    /// An output that is replaced by a variable of a different type.
    pub changed_output: Option<(Var, Type)>,
}

/// The values the caller fetched for a [`MakeImmRequest`], in request order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Fetched {
    pub inputs: Vec<Arg>,
    pub outputs: Vec<Var>,
    pub new_output: Option<Var>,
}

/// Every later use of `old` must be threaded through `new`.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSubst {
    pub old: Var,
    pub new: Var,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MakeImmChange {
    pub instructions: Vec<Instruction>,
    pub output_subst: Option<OutputSubst>,
}

pub(crate) fn rename_arg(arg: &mut Arg, renames: &Renames, allow_literal: bool) {
    if let Some(new) = arg.renamed(renames) {
        if new.is_var() || allow_literal {
            *arg = new;
        }
    }
}

pub(crate) fn rename_var(var: &mut Var, renames: &Renames) {
    if let Some(Arg::Var(new)) = renames.get(var) {
        *var = new.clone();
    }
}

fn input_vars(inputs: &[Arg]) -> impl Iterator<Item = &Var> {
    inputs.iter().filter_map(Arg::var)
}

/// Future or reference inputs, the ones a consumer may block on.
fn future_vars(inputs: &[Arg]) -> Vec<Var> {
    input_vars(inputs)
        .filter(|v| !v.is_value())
        .cloned()
        .unique()
        .collect()
}

fn fetchable(var: &Var) -> bool {
    var.ty.is_future() || var.ty.is_ref()
}

fn substitute(args: &[Arg], from: &[Var], to: &[Arg]) -> Vec<Arg> {
    args.iter()
        .map(|arg| match arg {
            Arg::Var(var) => from
                .iter()
                .position(|f| f == var)
                .map(|i| to[i].clone())
                .unwrap_or_else(|| arg.clone()),
            lit => lit.clone(),
        })
        .collect()
}

impl Instruction {
    pub fn comment(text: impl Into<String>) -> Self {
        Instruction::Comment(text.into())
    }

    pub fn op(op: Opcode, outputs: Vec<Var>, inputs: Vec<Arg>) -> Self {
        Instruction::Op(TurbineOp {
            op,
            outputs,
            inputs,
        })
    }

    pub fn store(dst: &Var, src: impl Into<Arg>) -> Self {
        Self::op(Opcode::Store, vec![dst.clone()], vec![src.into()])
    }

    pub fn load(dst: &Var, src: &Var) -> Self {
        Self::op(Opcode::Load, vec![dst.clone()], vec![src.into()])
    }

    pub fn store_ref(dst: &Var, referent: &Var) -> Self {
        Self::op(Opcode::StoreRef, vec![dst.clone()], vec![referent.into()])
    }

    pub fn load_ref(alias: &Var, reference: &Var) -> Self {
        Self::op(Opcode::LoadRef, vec![alias.clone()], vec![reference.into()])
    }

    pub fn deref(dst: &Var, reference: &Var) -> Self {
        Self::op(Opcode::Deref, vec![dst.clone()], vec![reference.into()])
    }

    pub fn copy_ref(alias: &Var, target: &Var) -> Self {
        Self::op(Opcode::CopyRef, vec![alias.clone()], vec![target.into()])
    }

    pub fn array_lookup_future(dst: &Var, array: &Var, index: impl Into<Arg>) -> Self {
        Self::op(
            Opcode::ArrayLookupFuture,
            vec![dst.clone()],
            vec![array.into(), index.into()],
        )
    }

    pub fn array_lookup_ref_imm(dst: &Var, array: &Var, index: impl Into<Arg>) -> Self {
        Self::op(
            Opcode::ArrayLookupRefImm,
            vec![dst.clone()],
            vec![array.into(), index.into()],
        )
    }

    pub fn array_lookup_imm(alias: &Var, array: &Var, index: impl Into<Arg>) -> Self {
        Self::op(
            Opcode::ArrayLookupImm,
            vec![alias.clone()],
            vec![array.into(), index.into()],
        )
    }

    pub fn array_insert_future(array: &Var, index: impl Into<Arg>, member: &Var) -> Self {
        Self::op(
            Opcode::ArrayInsertFuture,
            vec![array.clone()],
            vec![index.into(), member.into()],
        )
    }

    pub fn array_insert_imm(array: &Var, index: impl Into<Arg>, member: &Var) -> Self {
        Self::op(
            Opcode::ArrayInsertImm,
            vec![array.clone()],
            vec![index.into(), member.into()],
        )
    }

    pub fn array_build(array: &Var, members: &[(Arg, Var)]) -> Self {
        let inputs = members
            .iter()
            .flat_map(|(key, member)| [key.clone(), Arg::Var(member.clone())])
            .collect();
        Self::op(Opcode::ArrayBuild, vec![array.clone()], inputs)
    }

    pub fn array_decr_writers(array: &Var) -> Self {
        Self::op(Opcode::ArrayDecrWriters, vec![array.clone()], vec![])
    }

    pub fn struct_lookup(alias: &Var, target: &Var, field: &str) -> Self {
        Self::op(
            Opcode::StructLookup,
            vec![alias.clone()],
            vec![target.into(), Arg::str(field)],
        )
    }

    pub fn struct_insert(target: &Var, field: &str, member: &Var) -> Self {
        Self::op(
            Opcode::StructInsert,
            vec![target.clone()],
            vec![Arg::str(field), member.into()],
        )
    }

    pub fn builtin(mode: ExecMode, op: BuiltinOp, output: Option<Var>, inputs: Vec<Arg>) -> Self {
        Instruction::Builtin(BuiltinInstr {
            mode,
            op,
            output,
            inputs,
        })
    }

    pub fn async_op(op: BuiltinOp, output: Option<Var>, inputs: Vec<Arg>) -> Self {
        Self::builtin(ExecMode::Async, op, output, inputs)
    }

    pub fn local_op(op: BuiltinOp, output: Option<Var>, inputs: Vec<Arg>) -> Self {
        Self::builtin(ExecMode::Local, op, output, inputs)
    }

    pub fn call(
        kind: CallKind,
        function: impl Into<String>,
        outputs: Vec<Var>,
        inputs: Vec<Arg>,
    ) -> Self {
        Instruction::Call(FunctionCall {
            kind,
            function: function.into(),
            outputs,
            inputs,
        })
    }

    /// An instruction making `dst` hold the same value as `src`.
    pub fn copy(dst: &Var, src: Arg) -> Self {
        if let (Storage::Alias, Arg::Var(target)) = (dst.storage, &src) {
            return Self::copy_ref(dst, target);
        }
        if dst.is_value() {
            return Self::local_op(BuiltinOp::Copy, Some(dst.clone()), vec![src]);
        }
        if src.var().is_some_and(|v| !v.is_value()) {
            Self::async_op(BuiltinOp::Copy, Some(dst.clone()), vec![src])
        } else {
            Self::store(dst, src)
        }
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Instruction::Comment(_) => Opcode::Comment,
            Instruction::Op(op) => op.op,
            Instruction::Builtin(b) => match b.mode {
                ExecMode::Async => Opcode::AsyncOp,
                ExecMode::Local => Opcode::LocalOp,
            },
            Instruction::Call(call) => call.kind.opcode(),
            Instruction::LoopContinue(_) => Opcode::LoopContinue,
            Instruction::LoopBreak(_) => Opcode::LoopBreak,
        }
    }

    /// All inputs. A mutated container counts as an input too.
    pub fn inputs(&self) -> Vec<Arg> {
        match self {
            Instruction::Comment(_) => vec![],
            Instruction::Op(op) if op.op.mutates_container() => op
                .outputs
                .iter()
                .map(Arg::from)
                .chain(op.inputs.iter().cloned())
                .collect(),
            Instruction::Op(op) => op.inputs.clone(),
            Instruction::Builtin(b) => b.inputs.clone(),
            Instruction::Call(call) => call.inputs.clone(),
            Instruction::LoopContinue(cont) => cont
                .new_vals
                .iter()
                .cloned()
                .chain(cont.passed_vars.iter().map(Arg::from))
                .collect(),
            Instruction::LoopBreak(brk) => brk.close_vars.iter().map(Arg::from).collect(),
        }
    }

    pub fn outputs(&self) -> Vec<Var> {
        match self {
            Instruction::Op(op) => op.outputs.clone(),
            Instruction::Builtin(b) => b.output.iter().cloned().collect(),
            Instruction::Call(call) => call.outputs.clone(),
            Instruction::Comment(_)
            | Instruction::LoopContinue(_)
            | Instruction::LoopBreak(_) => vec![],
        }
    }

    /// Outputs that are existing containers being written rather than fresh definitions.
    pub fn modified_outputs(&self) -> Vec<Var> {
        match self {
            Instruction::Op(op) if op.op.mutates_container() => op.outputs.clone(),
            _ => vec![],
        }
    }

    /// Variables whose current value this instruction reads.
    pub fn read_vars(&self) -> Vec<Var> {
        match self {
            Instruction::Op(op) => input_vars(&op.inputs).cloned().collect(),
            other => other
                .inputs()
                .iter()
                .filter_map(Arg::var)
                .cloned()
                .collect(),
        }
    }

    /// Checks the operand layout against the opcode or operator.
    pub fn validate(&self) -> Result<(), IrError> {
        match self {
            Instruction::Op(op) => op.validate(),
            Instruction::Builtin(b) => {
                let operands = b.inputs.iter().cloned().map(Some).collect_vec();
                b.op.check_operands(&operands)
            }
            Instruction::Comment(_)
            | Instruction::Call(_)
            | Instruction::LoopContinue(_)
            | Instruction::LoopBreak(_) => Ok(()),
        }
    }

    /// Every variable mentioned, read or written.
    pub fn mentioned_vars(&self) -> Vec<Var> {
        let mut vars = self.read_vars();
        vars.extend(self.outputs());
        vars
    }

    pub fn has_side_effects(&self) -> bool {
        let intrinsic = match self {
            Instruction::Comment(_)
            | Instruction::LoopContinue(_)
            | Instruction::LoopBreak(_) => true,
            Instruction::Op(op) => op.op.info().side_effects,
            Instruction::Builtin(b) => b.op.has_side_effects(),
            Instruction::Call(call) => match call.kind {
                CallKind::Builtin => opcode::builtin_function(&call.function).side_effects,
                CallKind::Local => opcode::local_function_side_effects(&call.function),
                CallKind::App | CallKind::Composite => true,
            },
        };
        intrinsic || self.writes_escaping_output()
    }

    fn writes_escaping_output(&self) -> bool {
        match self {
            Instruction::Op(op) => op.writes_output() && op.outputs.iter().any(Var::is_escaping),
            Instruction::Builtin(BuiltinInstr {
                mode: ExecMode::Async,
                output: Some(out),
                ..
            }) => out.is_escaping(),
            Instruction::Call(call) => call.outputs.iter().any(Var::is_escaping),
            _ => false,
        }
    }

    pub fn rename(&mut self, renames: &Renames, mode: RenameMode) {
        let outputs_too = mode == RenameMode::All;
        match self {
            Instruction::Comment(_) => {}
            Instruction::Op(op) => {
                for i in 0..op.inputs.len() {
                    let allow_literal = op.accepts_literal(i);
                    rename_arg(&mut op.inputs[i], renames, allow_literal);
                }
                if outputs_too || op.op.mutates_container() {
                    op.outputs.iter_mut().for_each(|v| rename_var(v, renames));
                }
            }
            Instruction::Builtin(b) => {
                b.inputs
                    .iter_mut()
                    .for_each(|a| rename_arg(a, renames, true));
                if outputs_too {
                    b.output.iter_mut().for_each(|v| rename_var(v, renames));
                }
            }
            Instruction::Call(call) => {
                call.inputs
                    .iter_mut()
                    .for_each(|a| rename_arg(a, renames, true));
                if outputs_too {
                    call.outputs.iter_mut().for_each(|v| rename_var(v, renames));
                }
            }
            Instruction::LoopContinue(cont) => {
                cont.new_vals
                    .iter_mut()
                    .for_each(|a| rename_arg(a, renames, true));
                cont.passed_vars = cont
                    .passed_vars
                    .iter()
                    .filter_map(|v| match renames.get(v) {
                        Some(Arg::Var(new)) => Some(new.clone()),
                        Some(_) => None,
                        None => Some(v.clone()),
                    })
                    .unique()
                    .collect();
            }
            Instruction::LoopBreak(brk) => {
                brk.close_vars
                    .iter_mut()
                    .for_each(|v| rename_var(v, renames));
            }
        }
    }

    fn literal_inputs(inputs: &[Arg], facts: &dyn Facts) -> Vec<Option<Arg>> {
        inputs.iter().map(|a| facts.literal(a)).collect()
    }

    /// Computes the constants this instruction produces when its inputs are known.
    pub fn constant_fold(&self, facts: &dyn Facts) -> Result<Option<Vec<(Var, Arg)>>, IrError> {
        let folded = match self {
            Instruction::Builtin(b) => match &b.output {
                Some(out) => fold::evaluate(b.op, &Self::literal_inputs(&b.inputs, facts))?
                    .map(|value| vec![(out.clone(), value)]),
                None => None,
            },
            Instruction::Op(op) if matches!(op.op, Opcode::Store | Opcode::Load) => facts
                .literal(&op.inputs[0])
                .map(|value| vec![(op.output().clone(), value)]),
            Instruction::Call(call) if call.kind == CallKind::Builtin => {
                match (opcode::builtin_function(&call.function).local, call.outputs.as_slice()) {
                    (Some(LocalEquivalent::Op(op)), [out]) if op.has_output() => {
                        fold::evaluate(op, &Self::literal_inputs(&call.inputs, facts))?
                            .map(|value| vec![(out.clone(), value)])
                    }
                    _ => None,
                }
            }
            _ => None,
        };
        Ok(folded)
    }

    /// The message of an assertion that is statically known to fail.
    pub fn failed_assertion(&self, facts: &dyn Facts) -> Option<String> {
        match self {
            Instruction::Builtin(b) => {
                fold::assertion_failure(b.op, &Self::literal_inputs(&b.inputs, facts))
            }
            Instruction::Call(call) if call.kind == CallKind::Builtin => {
                match opcode::builtin_function(&call.function).local {
                    Some(LocalEquivalent::Op(op)) => {
                        fold::assertion_failure(op, &Self::literal_inputs(&call.inputs, facts))
                    }
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// Inputs the instruction has to wait on before it can run.
    pub fn blocking_inputs(&self) -> Vec<Var> {
        match self {
            Instruction::Builtin(b) if b.mode == ExecMode::Async => future_vars(&b.inputs),
            Instruction::Op(op) => match op.op {
                Opcode::Load | Opcode::LoadRef | Opcode::Deref => future_vars(&op.inputs),
                Opcode::ArrayLookupFuture => future_vars(&op.inputs[1..]),
                Opcode::ArrayInsertFuture => future_vars(&op.inputs[..1]),
                _ => vec![],
            },
            Instruction::Call(call) if matches!(call.kind, CallKind::Builtin | CallKind::App) => {
                future_vars(&call.inputs)
            }
            Instruction::LoopContinue(cont) => cont
                .new_vals
                .iter()
                .zip(&cont.blocking)
                .filter(|(_, blocking)| **blocking)
                .filter_map(|(arg, _)| arg.var())
                .filter(|v| !v.is_value())
                .cloned()
                .collect(),
            _ => vec![],
        }
    }

    /// Variables known to be closed once this instruction has run.
    pub fn closed_after(&self) -> Vec<Var> {
        match self {
            Instruction::Op(op) => match op.op {
                Opcode::Store | Opcode::StoreRef | Opcode::ArrayBuild => op.outputs.clone(),
                // Fetching a value is only valid once the source is closed.
                Opcode::Load | Opcode::LoadRef => input_vars(&op.inputs)
                    .cloned()
                    .chain(op.outputs.iter().filter(|v| v.is_value()).cloned())
                    .collect(),
                _ => vec![],
            },
            Instruction::Builtin(b) if b.mode == ExecMode::Local => {
                b.output.iter().cloned().collect()
            }
            Instruction::Call(call) if call.kind == CallKind::Local => call
                .outputs
                .iter()
                .filter(|v| v.is_value())
                .cloned()
                .collect(),
            _ => vec![],
        }
    }

    /// Decides whether the instruction has an immediate form given what is known to be closed.
    pub fn can_make_immediate(&self, facts: &dyn Facts) -> Option<MakeImmRequest> {
        let ready = |arg: &Arg| facts.is_available(arg);
        let request = |inputs: Vec<Var>, outputs: Vec<Var>, changed_output| MakeImmRequest {
            outputs,
            inputs,
            changed_output,
        };

        match self {
            Instruction::Builtin(b) if b.mode == ExecMode::Async => {
                let inputs = future_vars(&b.inputs);
                let output_ok = b.output.as_ref().is_none_or(|out| out.ty.is_future());
                (output_ok && inputs.iter().all(|v| facts.is_closed(v) && fetchable(v)))
                    .then(|| request(inputs, b.output.iter().cloned().collect(), None))
            }
            Instruction::Call(call) if call.kind == CallKind::Builtin => {
                let local = opcode::builtin_function(&call.function).local?;
                if let LocalEquivalent::Op(op) = local {
                    if call.outputs.len() != usize::from(op.has_output()) {
                        return None;
                    }
                }
                let inputs = future_vars(&call.inputs);
                let ready = call.outputs.iter().all(|out| out.ty.is_future())
                    && inputs.iter().all(|v| facts.is_closed(v) && fetchable(v));
                ready.then(|| request(inputs, call.outputs.clone(), None))
            }
            Instruction::Op(op) => {
                let out = op.outputs.first()?;
                match op.op {
                    Opcode::ArrayLookupFuture | Opcode::ArrayLookupRefImm => {
                        let (array, index) = (&op.inputs[0], &op.inputs[1]);
                        let fetch: Vec<Var> = index
                            .var()
                            .filter(|v| !v.is_value())
                            .cloned()
                            .into_iter()
                            .collect();
                        if !ready(index) || !fetch.iter().all(fetchable) {
                            return None;
                        }
                        let array_closed = array.var().is_some_and(|a| facts.is_closed(a));
                        match out.ty.retrieved() {
                            Some(member) if array_closed => {
                                Some(request(fetch, vec![], Some((out.clone(), member))))
                            }
                            _ if op.op == Opcode::ArrayLookupFuture => {
                                Some(request(fetch, vec![], None))
                            }
                            _ => None,
                        }
                    }
                    Opcode::ArrayInsertFuture => {
                        let index = &op.inputs[0];
                        let fetch: Vec<Var> = index
                            .var()
                            .filter(|v| !v.is_value())
                            .cloned()
                            .into_iter()
                            .collect();
                        (ready(index) && fetch.iter().all(fetchable))
                            .then(|| request(fetch, vec![], None))
                    }
                    Opcode::Deref => {
                        let reference = op.inputs[0].var()?;
                        (facts.is_closed(reference) && out.ty.is_future())
                            .then(|| request(vec![reference.clone()], vec![], None))
                    }
                    _ => None,
                }
            }
            _ => None,
        }
    }

    fn check_fetched(&self, req: &MakeImmRequest, fetched: &Fetched) -> Result<(), IrError> {
        let checks = [
            ("inputs", fetched.inputs.len(), req.inputs.len()),
            ("outputs", fetched.outputs.len(), req.outputs.len()),
            (
                "changed outputs",
                usize::from(fetched.new_output.is_some()),
                usize::from(req.changed_output.is_some()),
            ),
        ];
        for (what, found, expected) in checks {
            if found != expected {
                return Err(IrError::MakeImmediateArity {
                    instruction: self.to_string(),
                    what,
                    found,
                    expected,
                });
            }
        }
        Ok(())
    }

    /// Rewrites the instruction into its immediate form.
    ///
    /// `req` must come from [`Instruction::can_make_immediate`] on this instruction. The
    /// caller stores `fetched.outputs` back into `req.outputs` and threads any returned
    /// output substitution through every later use.
    pub fn make_immediate(
        &self,
        req: &MakeImmRequest,
        fetched: &Fetched,
    ) -> Result<MakeImmChange, IrError> {
        self.check_fetched(req, fetched)?;
        let not_immediate = || IrError::NotImmediate {
            instruction: self.to_string(),
        };
        let values = |args: &[Arg]| substitute(args, &req.inputs, &fetched.inputs);
        let single = |instruction| MakeImmChange {
            instructions: vec![instruction],
            output_subst: None,
        };

        match self {
            Instruction::Builtin(b) if b.mode == ExecMode::Async => Ok(single(
                Instruction::local_op(b.op, fetched.outputs.first().cloned(), values(&b.inputs)),
            )),
            Instruction::Call(call) if call.kind == CallKind::Builtin => {
                match opcode::builtin_function(&call.function).local {
                    Some(LocalEquivalent::Op(op)) => Ok(single(Instruction::local_op(
                        op,
                        fetched.outputs.first().cloned(),
                        values(&call.inputs),
                    ))),
                    Some(LocalEquivalent::Function(name)) => Ok(single(Instruction::call(
                        CallKind::Local,
                        name,
                        fetched.outputs.clone(),
                        values(&call.inputs),
                    ))),
                    None => Err(not_immediate()),
                }
            }
            Instruction::Op(op) => {
                let inputs = values(&op.inputs);
                match (op.op, &req.changed_output, &fetched.new_output) {
                    (
                        Opcode::ArrayLookupFuture | Opcode::ArrayLookupRefImm,
                        Some((old, _)),
                        Some(new),
                    ) => {
                        let array = inputs[0].var().ok_or_else(not_immediate)?;
                        Ok(MakeImmChange {
                            instructions: vec![Instruction::array_lookup_imm(
                                new,
                                array,
                                inputs[1].clone(),
                            )],
                            output_subst: Some(OutputSubst {
                                old: old.clone(),
                                new: new.clone(),
                            }),
                        })
                    }
                    (Opcode::ArrayLookupFuture, None, None) => Ok(single(Instruction::op(
                        Opcode::ArrayLookupRefImm,
                        op.outputs.clone(),
                        inputs,
                    ))),
                    (Opcode::ArrayInsertFuture, None, None) => Ok(single(Instruction::op(
                        Opcode::ArrayInsertImm,
                        op.outputs.clone(),
                        inputs,
                    ))),
                    (Opcode::Deref, None, None) => Ok(single(Instruction::async_op(
                        BuiltinOp::Copy,
                        Some(op.output().clone()),
                        inputs,
                    ))),
                    _ => Err(not_immediate()),
                }
            }
            _ => Err(not_immediate()),
        }
    }

    /// The key whose value is this instruction's freshly defined output.
    pub fn value_key(&self) -> Option<(ValueKey, Var)> {
        match self {
            Instruction::Op(op) => {
                let out = op.outputs.first()?.clone();
                let key = match op.op {
                    Opcode::Load
                    | Opcode::LoadRef
                    | Opcode::Deref
                    | Opcode::CopyRef
                    | Opcode::ArrayLookupRefImm
                    | Opcode::ArrayLookupImm
                    | Opcode::StructLookup => ValueKey::of(op.op, op.inputs.iter().cloned()),
                    // With a literal index the reference is the same one the immediate form returns.
                    Opcode::ArrayLookupFuture if op.inputs[1].is_literal() => {
                        ValueKey::of(Opcode::ArrayLookupRefImm, op.inputs.iter().cloned())
                    }
                    Opcode::ArrayLookupFuture => ValueKey::of(op.op, op.inputs.iter().cloned()),
                    _ => return None,
                };
                Some((key, out))
            }
            Instruction::Builtin(b) if !b.op.has_side_effects() => {
                let op = match b.mode {
                    ExecMode::Async => ValueOp::Async(b.op),
                    ExecMode::Local => ValueOp::Local(b.op),
                };
                Some((ValueKey::canonical(op, b.inputs.clone()), b.output.clone()?))
            }
            Instruction::Call(call)
                if matches!(call.kind, CallKind::Builtin | CallKind::Local)
                    && !self.has_side_effects()
                    && call.outputs.len() == 1 =>
            {
                let op = ValueOp::Call {
                    function: call.function.clone(),
                    local: call.kind == CallKind::Local,
                };
                Some((ValueKey::new(op, call.inputs.clone()), call.outputs[0].clone()))
            }
            _ => None,
        }
    }

    /// The equivalences this instruction establishes.
    pub fn computed_values(&self, table: &ValueTable) -> Vec<ComputedValue> {
        let mut values = Vec::new();

        if let Some((key, out)) = self.value_key() {
            let closed = match self {
                Instruction::Op(op) => op.op == Opcode::Load,
                _ => self.closed_after().contains(&out),
            };
            values.push(ComputedValue::new(key, out, closed));
        }

        let Instruction::Op(op) = self else {
            return values;
        };
        let Some(out) = op.outputs.first() else {
            return values;
        };

        match op.op {
            Opcode::Store => {
                let src = op.inputs[0].clone();
                if let Arg::Var(src) = &src {
                    values.push(ComputedValue::new(
                        ValueKey::of(Opcode::Store, [Arg::from(src)]),
                        out,
                        true,
                    ));
                }
                values.push(ComputedValue::new(
                    ValueKey::of(Opcode::Load, [Arg::from(out)]),
                    src,
                    true,
                ));
            }
            Opcode::Load => {
                if let Some(src) = op.inputs[0].var() {
                    values.push(ComputedValue::new(
                        ValueKey::of(Opcode::Store, [Arg::from(out)]),
                        src,
                        true,
                    ));
                }
            }
            Opcode::StoreRef => {
                values.push(ComputedValue::new(
                    ValueKey::of(Opcode::LoadRef, [Arg::from(out)]),
                    op.inputs[0].clone(),
                    false,
                ));
            }
            Opcode::ArrayLookupRefImm | Opcode::ArrayLookupFuture
                if op.op == Opcode::ArrayLookupRefImm || op.inputs[1].is_literal() =>
            {
                let member =
                    table.get(&ValueKey::of(Opcode::ArrayLookupImm, op.inputs.iter().cloned()));
                if let Some(member) = member {
                    values.push(ComputedValue::new(
                        ValueKey::of(Opcode::LoadRef, [Arg::from(out)]),
                        member.clone(),
                        false,
                    ));
                }
            }
            Opcode::ArrayInsertImm => {
                values.push(ComputedValue::new(
                    ValueKey::of(Opcode::ArrayLookupImm, [Arg::from(out), op.inputs[0].clone()]),
                    op.inputs[1].clone(),
                    false,
                ));
            }
            Opcode::ArrayBuild => {
                for (key, member) in op.inputs.iter().tuples() {
                    values.push(ComputedValue::new(
                        ValueKey::of(Opcode::ArrayLookupImm, [Arg::from(out), key.clone()]),
                        member.clone(),
                        false,
                    ));
                }
            }
            Opcode::StructInsert => {
                values.push(ComputedValue::new(
                    ValueKey::of(Opcode::StructLookup, [Arg::from(out), op.inputs[0].clone()]),
                    op.inputs[1].clone(),
                    false,
                ));
            }
            _ => {}
        }

        values
    }

    /// A cheaper equivalent when a fact makes the indirection unnecessary.
    pub fn short_circuit(&self, table: &ValueTable) -> Option<Instruction> {
        let Instruction::Op(op) = self else {
            return None;
        };
        if op.op != Opcode::Deref {
            return None;
        }
        let reference = op.inputs[0].var()?;
        match table.referent(reference)? {
            Arg::Var(target) if target.ty == op.output().ty => Some(Instruction::async_op(
                BuiltinOp::Copy,
                Some(op.output().clone()),
                vec![Arg::from(target)],
            )),
            _ => None,
        }
    }

    /// The variable holding the fetched contents of `source`.
    pub fn fetched_var(source: &Var, name: String) -> Option<Var> {
        let ty = source.ty.retrieved()?;
        let storage = if ty.is_value() {
            Storage::Local
        } else {
            Storage::Alias
        };
        Some(Var::new(name, ty, storage, DefKind::Temp))
    }

    /// The instruction fetching the contents of `source` into `dst`.
    pub fn fetch(dst: &Var, source: &Var) -> Instruction {
        if source.ty.is_ref() {
            Instruction::load_ref(dst, source)
        } else {
            Instruction::load(dst, source)
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Comment(text) => write!(f, "# {text}"),
            Instruction::Op(op) if op.op.mutates_container() => write!(
                f,
                "{} {} <- ({})",
                op.op,
                op.outputs.iter().join(", "),
                op.inputs.iter().join(", ")
            ),
            Instruction::Op(op) => write!(
                f,
                "{} = {}({})",
                op.outputs.iter().join(", "),
                op.op,
                op.inputs.iter().join(", ")
            ),
            Instruction::Builtin(b) => {
                let mode = match b.mode {
                    ExecMode::Async => "async",
                    ExecMode::Local => "local",
                };
                if let Some(out) = &b.output {
                    write!(f, "{out} = ")?;
                }
                write!(f, "{mode} {}({})", b.op, b.inputs.iter().join(", "))
            }
            Instruction::Call(call) => {
                if !call.outputs.is_empty() {
                    write!(f, "{} = ", call.outputs.iter().join(", "))?;
                }
                write!(
                    f,
                    "{} {}({})",
                    call.kind.opcode(),
                    call.function,
                    call.inputs.iter().join(", ")
                )
            }
            Instruction::LoopContinue(cont) => {
                let vals = cont
                    .new_vals
                    .iter()
                    .zip_longest(&cont.blocking)
                    .map(|pair| match pair.left_and_right() {
                        (Some(val), Some(&true)) => format!("{val} #blocking"),
                        (Some(val), _) => val.to_string(),
                        (None, _) => String::new(),
                    })
                    .join(", ");
                write!(f, "loop_continue({vals})")?;
                if !cont.passed_vars.is_empty() {
                    write!(f, " #passin[{}]", cont.passed_vars.iter().join(", "))?;
                }
                Ok(())
            }
            Instruction::LoopBreak(brk) => {
                write!(f, "loop_break")?;
                if !brk.close_vars.is_empty() {
                    write!(f, " #close[{}]", brk.close_vars.iter().join(", "))?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::ir::{Constants, NoFacts, PrimType};

    fn future(name: &str) -> Var {
        Var::new(name, Type::Future(PrimType::Int), Storage::Future, DefKind::Local)
    }

    fn value(name: &str) -> Var {
        Var::new(name, Type::Value(PrimType::Int), Storage::Local, DefKind::Local)
    }

    fn array(name: &str) -> Var {
        Var::new(
            name,
            Type::Array(Box::new(Type::Future(PrimType::Int))),
            Storage::Future,
            DefKind::Local,
        )
    }

    fn reference(name: &str) -> Var {
        Var::new(
            name,
            Type::Ref(Box::new(Type::Future(PrimType::Int))),
            Storage::Future,
            DefKind::Local,
        )
    }

    struct Closed(HashSet<Var>);

    impl Facts for Closed {
        fn constant(&self, _var: &Var) -> Option<Arg> {
            None
        }

        fn is_closed(&self, var: &Var) -> bool {
            self.0.contains(var)
        }
    }

    fn closed(vars: &[Var]) -> Closed {
        Closed(vars.iter().cloned().collect())
    }

    #[test]
    fn insert_classifies_container_as_input_and_output() {
        let insert = Instruction::array_insert_imm(&array("A"), Arg::Int(0), &future("m"));
        assert!(insert.inputs().contains(&Arg::Var(array("A"))));
        assert_eq!(insert.outputs(), vec![array("A")]);
        assert_eq!(insert.modified_outputs(), vec![array("A")]);
        assert_eq!(insert.read_vars(), vec![future("m")]);
        assert!(!insert.has_side_effects());

        let out = Var::new("A", array("A").ty, Storage::Future, DefKind::OutArg);
        assert!(Instruction::array_insert_imm(&out, Arg::Int(0), &future("m")).has_side_effects());
    }

    #[test]
    fn side_effects_follow_callee() {
        let pure = Instruction::call(CallKind::Builtin, "strcat", vec![future("s")], vec![]);
        let app = Instruction::call(CallKind::App, "echo", vec![], vec![]);
        let unknown = Instruction::call(CallKind::Builtin, "launch", vec![], vec![]);
        assert!(!pure.has_side_effects());
        assert!(app.has_side_effects());
        assert!(unknown.has_side_effects());
        assert!(Instruction::async_op(BuiltinOp::Trace, None, vec![Arg::Int(1)]).has_side_effects());
    }

    #[test]
    fn rename_respects_literal_slots() {
        let mut renames = Renames::new();
        renames.insert(future("i"), Arg::Int(3));
        renames.insert(array("A"), Arg::Var(array("B")));

        let mut lookup = Instruction::array_lookup_future(&reference("r"), &array("A"), &future("i"));
        lookup.rename(&renames, RenameMode::InputsOnly);
        assert_eq!(
            lookup,
            Instruction::array_lookup_future(&reference("r"), &array("B"), Arg::Int(3))
        );

        // A reference target can't be a literal.
        renames.insert(future("x"), Arg::Int(1));
        let mut store_ref = Instruction::store_ref(&reference("r"), &future("x"));
        store_ref.rename(&renames, RenameMode::All);
        assert_eq!(store_ref, Instruction::store_ref(&reference("r"), &future("x")));
    }

    #[test]
    fn inputs_only_leaves_definitions_alone() {
        let mut renames = Renames::new();
        renames.insert(future("a"), Arg::Var(future("b")));
        renames.insert(future("o"), Arg::Var(future("p")));
        let mut op = Instruction::async_op(BuiltinOp::PlusInt, Some(future("o")), vec![future("a").into(), Arg::Int(1)]);
        op.rename(&renames, RenameMode::InputsOnly);
        assert_eq!(op.outputs(), vec![future("o")]);
        assert_eq!(op.read_vars(), vec![future("b")]);

        op.rename(&renames, RenameMode::All);
        assert_eq!(op.outputs(), vec![future("p")]);
    }

    #[test]
    fn fold_with_known_inputs() {
        let mut known = Constants::new();
        known.insert(future("a"), Arg::Int(4));
        let op = Instruction::async_op(
            BuiltinOp::MultInt,
            Some(future("o")),
            vec![future("a").into(), Arg::Int(5)],
        );
        assert_eq!(
            op.constant_fold(&known),
            Ok(Some(vec![(future("o"), Arg::Int(20))]))
        );
        assert_eq!(op.constant_fold(&NoFacts), Ok(None));

        let call = Instruction::call(
            CallKind::Builtin,
            "strcat",
            vec![future("s")],
            vec![Arg::str("a"), Arg::str("b")],
        );
        assert_eq!(
            call.constant_fold(&NoFacts),
            Ok(Some(vec![(future("s"), Arg::str("ab"))]))
        );
    }

    #[test]
    fn assertions_are_reported_not_folded() {
        let assert = Instruction::async_op(
            BuiltinOp::Assert,
            None,
            vec![Arg::Bool(false), Arg::str("nope")],
        );
        assert_eq!(assert.constant_fold(&NoFacts), Ok(None));
        assert_eq!(assert.failed_assertion(&NoFacts), Some("nope".to_string()));
    }

    #[test]
    fn lookup_becomes_immediate_in_two_steps() {
        let lookup = Instruction::array_lookup_future(&reference("r"), &array("A"), &future("i"));
        assert_eq!(lookup.can_make_immediate(&closed(&[])), None);

        let req = lookup
            .can_make_immediate(&closed(&[future("i")]))
            .expect("index closed");
        assert_eq!(req.inputs, vec![future("i")]);
        assert_eq!(req.changed_output, None);
        let change = lookup
            .make_immediate(
                &req,
                &Fetched {
                    inputs: vec![value("i_v").into()],
                    ..Default::default()
                },
            )
            .expect("rewrite");
        assert_eq!(
            change.instructions,
            vec![Instruction::array_lookup_ref_imm(&reference("r"), &array("A"), &value("i_v"))]
        );

        let req = lookup
            .can_make_immediate(&closed(&[future("i"), array("A")]))
            .expect("array closed");
        let (old, ty) = req.changed_output.clone().expect("output changes");
        assert_eq!(old, reference("r"));
        assert_eq!(ty, Type::Future(PrimType::Int));
        let member = Var::new("m", ty, Storage::Alias, DefKind::Temp);
        let change = lookup
            .make_immediate(
                &req,
                &Fetched {
                    inputs: vec![value("i_v").into()],
                    outputs: vec![],
                    new_output: Some(member.clone()),
                },
            )
            .expect("rewrite");
        assert_eq!(
            change.output_subst,
            Some(OutputSubst {
                old: reference("r"),
                new: member.clone()
            })
        );
        assert_eq!(
            change.instructions,
            vec![Instruction::array_lookup_imm(&member, &array("A"), &value("i_v"))]
        );
    }

    #[test]
    fn make_immediate_checks_arity() {
        let op = Instruction::async_op(
            BuiltinOp::PlusInt,
            Some(future("o")),
            vec![future("a").into(), future("b").into()],
        );
        let req = op
            .can_make_immediate(&closed(&[future("a"), future("b")]))
            .expect("inputs closed");
        assert_eq!(req.inputs, vec![future("a"), future("b")]);
        assert_eq!(req.outputs, vec![future("o")]);

        let err = op.make_immediate(
            &req,
            &Fetched {
                inputs: vec![value("a_v").into()],
                outputs: vec![value("o_v")],
                new_output: None,
            },
        );
        assert!(matches!(
            err,
            Err(IrError::MakeImmediateArity {
                what: "inputs",
                found: 1,
                expected: 2,
                ..
            })
        ));

        let change = op
            .make_immediate(
                &req,
                &Fetched {
                    inputs: vec![value("a_v").into(), Arg::Int(2)],
                    outputs: vec![value("o_v")],
                    new_output: None,
                },
            )
            .expect("rewrite");
        assert_eq!(
            change.instructions,
            vec![Instruction::local_op(
                BuiltinOp::PlusInt,
                Some(value("o_v")),
                vec![value("a_v").into(), Arg::Int(2)]
            )]
        );
    }

    #[test]
    fn deref_short_circuits_through_known_referent() {
        let deref = Instruction::deref(&future("f"), &reference("r"));
        let mut table = ValueTable::new();
        assert_eq!(deref.short_circuit(&table), None);

        for cv in Instruction::store_ref(&reference("r"), &future("x")).computed_values(&table) {
            table.add(cv);
        }
        assert_eq!(
            deref.short_circuit(&table),
            Some(Instruction::async_op(
                BuiltinOp::Copy,
                Some(future("f")),
                vec![future("x").into()]
            ))
        );
    }

    #[test]
    fn store_and_load_are_inverses() {
        let table = ValueTable::new();
        let values = Instruction::store(&future("f"), &value("v")).computed_values(&table);
        let load_key = ValueKey::of(Opcode::Load, [Arg::from(future("f"))]);
        assert!(values.iter().any(|cv| cv.key == load_key && cv.value == Arg::from(value("v"))));

        let (key, out) = Instruction::load(&value("w"), &future("f"))
            .value_key()
            .expect("load defines a value");
        assert_eq!(key, load_key);
        assert_eq!(out, value("w"));
    }

    #[test]
    fn copy_picks_the_right_primitive() {
        assert_eq!(Instruction::copy(&value("a"), Arg::Int(1)).opcode(), Opcode::LocalOp);
        assert_eq!(Instruction::copy(&future("a"), Arg::Int(1)).opcode(), Opcode::Store);
        assert_eq!(
            Instruction::copy(&future("a"), future("b").into()).opcode(),
            Opcode::AsyncOp
        );
        let alias = Var::new("a", Type::Future(PrimType::Int), Storage::Alias, DefKind::Temp);
        assert_eq!(
            Instruction::copy(&alias, future("b").into()).opcode(),
            Opcode::CopyRef
        );
    }

    #[test]
    fn blocking_inputs_skip_values_and_unblocked_loop_vars() {
        let op = Instruction::async_op(
            BuiltinOp::PlusInt,
            Some(future("o")),
            vec![future("a").into(), value("v").into(), Arg::Int(1)],
        );
        assert_eq!(op.blocking_inputs(), vec![future("a")]);

        let lookup = Instruction::array_lookup_future(&reference("r"), &array("A"), future("i"));
        assert_eq!(lookup.blocking_inputs(), vec![future("i")]);

        let next = Instruction::LoopContinue(LoopContinue {
            loop_id: None,
            new_vals: vec![future("x").into(), future("y").into()],
            passed_vars: vec![],
            blocking: vec![false, true],
        });
        assert_eq!(next.blocking_inputs(), vec![future("y")]);
        assert!(Instruction::comment("hi").blocking_inputs().is_empty());
    }

    #[test]
    fn constructors_match_their_layouts() {
        let a = array("A");
        let r = reference("r");
        let built = [
            Instruction::store(&future("x"), Arg::Int(1)),
            Instruction::load(&value("v"), &future("x")),
            Instruction::deref(&future("x"), &r),
            Instruction::array_lookup_future(&r, &a, Arg::Int(0)),
            Instruction::array_insert_imm(&a, Arg::Int(0), &future("x")),
            Instruction::array_build(&a, &[(Arg::Int(0), future("x")), (Arg::Int(1), future("y"))]),
            Instruction::array_decr_writers(&a),
            Instruction::struct_insert(&a, "f", &future("x")),
            Instruction::async_op(BuiltinOp::PlusInt, Some(future("z")), vec![Arg::Int(1), future("x").into()]),
        ];
        for inst in &built {
            assert_eq!(inst.validate(), Ok(()), "{inst}");
        }
    }

    #[test]
    fn layout_violations_are_reported() {
        let x = future("x");
        assert_eq!(
            Instruction::op(Opcode::Store, vec![x.clone()], vec![]).validate(),
            Err(IrError::OperandCount {
                op: "store",
                expected: 1,
                found: 0,
            })
        );
        assert_eq!(
            Instruction::op(Opcode::Store, vec![], vec![Arg::Int(1), Arg::Int(2)]).validate(),
            Err(IrError::OutputCount {
                op: "store",
                expected: 1,
                found: 0,
            })
        );
        assert!(matches!(
            Instruction::op(Opcode::Deref, vec![x.clone()], vec![Arg::Int(1)]).validate(),
            Err(IrError::ExpectedVariable { index: 0, .. })
        ));
        assert!(matches!(
            Instruction::op(Opcode::ArrayBuild, vec![array("A")], vec![Arg::Int(0)]).validate(),
            Err(IrError::OperandCount { expected: 2, found: 1, .. })
        ));
        assert_eq!(
            Instruction::op(Opcode::CallApp, vec![x], vec![]).validate(),
            Err(IrError::MisplacedOpcode { op: "call_app" })
        );
        assert!(matches!(
            Instruction::local_op(BuiltinOp::PlusInt, None, vec![Arg::Bool(true), Arg::Int(1)])
                .validate(),
            Err(IrError::LiteralTypeMismatch { index: 0, .. })
        ));
    }
}
