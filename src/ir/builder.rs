use std::sync::Arc;

use tracing::{debug, instrument, trace};

use super::{
    Arg, IrError, ScopedMap, Var,
    continuation::{
        ContinuationKind, ForeachLoop, IfStatement, Loop, RangeLoop, SwitchStatement,
        WaitStatement,
    },
    fold::BuiltinOp,
    instruction::{CallKind, Instruction, LoopBreak, LoopContinue},
    tree::{AppFunction, BlockId, BuiltinFunction, ContId, Function, Program},
};

/// The construction protocol.
///
/// Front ends drive it to build a program, and [`replay`] drives it again to hand an
/// optimized program to a concrete backend. Every `start_*` call is matched by exactly
/// one `end_*` call before the enclosing block is closed.
pub trait CodeGenerator {
    fn declare_builtin(&mut self, builtin: &BuiltinFunction) -> Result<(), IrError>;
    fn declare_app(&mut self, app: &AppFunction) -> Result<(), IrError>;
    fn add_global_const(&mut self, var: &Var, value: &Arg) -> Result<(), IrError>;

    fn start_function(&mut self, name: &str, inputs: &[Var], outputs: &[Var])
    -> Result<(), IrError>;
    fn end_function(&mut self) -> Result<(), IrError>;

    fn declare_variable(&mut self, var: &Var) -> Result<(), IrError>;
    /// Drops the array's writer count when the current block finishes.
    fn close_on_exit(&mut self, array: &Var) -> Result<(), IrError>;
    fn instruction(&mut self, instruction: &Instruction) -> Result<(), IrError>;

    fn start_nested_block(&mut self) -> Result<(), IrError>;
    fn end_nested_block(&mut self) -> Result<(), IrError>;

    fn start_if_statement(&mut self, cond: &Arg, has_else: bool) -> Result<(), IrError>;
    fn start_else_block(&mut self) -> Result<(), IrError>;
    fn end_if_statement(&mut self) -> Result<(), IrError>;

    fn start_switch_statement(
        &mut self,
        value: &Arg,
        labels: &[i64],
        has_default: bool,
    ) -> Result<(), IrError>;
    /// Starts case `index`; the default block comes after every labeled case.
    fn start_case(&mut self, index: usize) -> Result<(), IrError>;
    fn end_switch_statement(&mut self) -> Result<(), IrError>;

    fn start_wait_statement(
        &mut self,
        wait: &WaitStatement,
        passed: &[Var],
        keep_open: &[Var],
    ) -> Result<(), IrError>;
    fn end_wait_statement(&mut self) -> Result<(), IrError>;

    fn start_foreach_loop(
        &mut self,
        lp: &ForeachLoop,
        passed: &[Var],
        keep_open: &[Var],
    ) -> Result<(), IrError>;
    fn end_foreach_loop(&mut self) -> Result<(), IrError>;

    fn start_range_loop(
        &mut self,
        lp: &RangeLoop,
        passed: &[Var],
        keep_open: &[Var],
    ) -> Result<(), IrError>;
    fn end_range_loop(&mut self) -> Result<(), IrError>;

    fn start_loop(&mut self, lp: &Loop, passed: &[Var], keep_open: &[Var])
    -> Result<(), IrError>;
    fn loop_continue(
        &mut self,
        new_vals: &[Arg],
        passed_vars: &[Var],
        blocking: &[bool],
    ) -> Result<(), IrError>;
    fn loop_break(&mut self, close_vars: &[Var]) -> Result<(), IrError>;
    fn end_loop(&mut self) -> Result<(), IrError>;

    fn comment(&mut self, text: &str) -> Result<(), IrError> {
        self.instruction(&Instruction::comment(text))
    }

    fn assign(&mut self, dst: &Var, src: Arg) -> Result<(), IrError> {
        self.instruction(&Instruction::store(dst, src))
    }

    fn retrieve(&mut self, dst: &Var, src: &Var) -> Result<(), IrError> {
        self.instruction(&Instruction::load(dst, src))
    }

    fn assign_ref(&mut self, dst: &Var, referent: &Var) -> Result<(), IrError> {
        self.instruction(&Instruction::store_ref(dst, referent))
    }

    fn retrieve_ref(&mut self, alias: &Var, reference: &Var) -> Result<(), IrError> {
        self.instruction(&Instruction::load_ref(alias, reference))
    }

    fn dereference(&mut self, dst: &Var, reference: &Var) -> Result<(), IrError> {
        self.instruction(&Instruction::deref(dst, reference))
    }

    fn copy_ref(&mut self, alias: &Var, target: &Var) -> Result<(), IrError> {
        self.instruction(&Instruction::copy_ref(alias, target))
    }

    fn array_lookup_future(&mut self, dst: &Var, array: &Var, index: Arg) -> Result<(), IrError> {
        self.instruction(&Instruction::array_lookup_future(dst, array, index))
    }

    fn array_lookup_ref_imm(&mut self, dst: &Var, array: &Var, index: Arg) -> Result<(), IrError> {
        self.instruction(&Instruction::array_lookup_ref_imm(dst, array, index))
    }

    fn array_lookup_imm(&mut self, alias: &Var, array: &Var, index: Arg) -> Result<(), IrError> {
        self.instruction(&Instruction::array_lookup_imm(alias, array, index))
    }

    fn array_insert_future(&mut self, array: &Var, index: Arg, member: &Var) -> Result<(), IrError> {
        self.instruction(&Instruction::array_insert_future(array, index, member))
    }

    fn array_insert_imm(&mut self, array: &Var, index: Arg, member: &Var) -> Result<(), IrError> {
        self.instruction(&Instruction::array_insert_imm(array, index, member))
    }

    fn array_build(&mut self, array: &Var, members: &[(Arg, Var)]) -> Result<(), IrError> {
        self.instruction(&Instruction::array_build(array, members))
    }

    fn array_decr_writers(&mut self, array: &Var) -> Result<(), IrError> {
        self.instruction(&Instruction::array_decr_writers(array))
    }

    fn struct_lookup(&mut self, alias: &Var, target: &Var, field: &str) -> Result<(), IrError> {
        self.instruction(&Instruction::struct_lookup(alias, target, field))
    }

    fn struct_insert(&mut self, target: &Var, field: &str, member: &Var) -> Result<(), IrError> {
        self.instruction(&Instruction::struct_insert(target, field, member))
    }

    fn async_op(
        &mut self,
        op: BuiltinOp,
        output: Option<&Var>,
        inputs: Vec<Arg>,
    ) -> Result<(), IrError> {
        self.instruction(&Instruction::async_op(op, output.cloned(), inputs))
    }

    fn local_op(
        &mut self,
        op: BuiltinOp,
        output: Option<&Var>,
        inputs: Vec<Arg>,
    ) -> Result<(), IrError> {
        self.instruction(&Instruction::local_op(op, output.cloned(), inputs))
    }

    fn call_function(
        &mut self,
        kind: CallKind,
        function: &str,
        outputs: &[Var],
        inputs: &[Arg],
    ) -> Result<(), IrError> {
        self.instruction(&Instruction::call(
            kind,
            function,
            outputs.to_vec(),
            inputs.to_vec(),
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Construct {
    Function,
    Nested,
    If,
    Switch,
    Wait,
    Foreach,
    Range,
    Loop,
}

impl Construct {
    fn name(self) -> &'static str {
        match self {
            Construct::Function => "function",
            Construct::Nested => "nested block",
            Construct::If => "if statement",
            Construct::Switch => "switch statement",
            Construct::Wait => "wait statement",
            Construct::Foreach => "foreach loop",
            Construct::Range => "range loop",
            Construct::Loop => "loop",
        }
    }
}

type NameScope = ScopedMap<String, Var>;

#[derive(Debug)]
struct Frame {
    construct: Construct,
    cont: Option<ContId>,
    /// The block receiving declarations and instructions, if a case has been started.
    block: Option<BlockId>,
    scope: Arc<NameScope>,
}

/// Builds a [`Program`] from the construction protocol, checking the nesting discipline and
/// that every variable is declared before it's used.
#[derive(Debug, Default)]
pub struct IrBuilder {
    program: Program,
    function: Option<Function>,
    frames: Vec<Frame>,
}

impl IrBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// The finished program. Fails if a function is still open.
    pub fn finish(self) -> Result<Program, IrError> {
        match self.function {
            Some(function) => Err(IrError::FunctionStillOpen {
                name: function.name,
            }),
            None => Ok(self.program),
        }
    }

    fn func(&mut self) -> Result<&mut Function, IrError> {
        self.function.as_mut().ok_or(IrError::NoOpenFunction)
    }

    fn top(&self) -> Result<&Frame, IrError> {
        self.frames.last().ok_or(IrError::NoOpenFunction)
    }

    fn top_mut(&mut self) -> Result<&mut Frame, IrError> {
        self.frames.last_mut().ok_or(IrError::NoOpenFunction)
    }

    fn current_block(&self, what: &'static str) -> Result<BlockId, IrError> {
        self.top()?.block.ok_or(IrError::NoOpenBlock { what })
    }

    fn check_declared<'a>(&self, vars: impl IntoIterator<Item = &'a Var>) -> Result<(), IrError> {
        let scope = &self.top()?.scope;
        for var in vars {
            if !scope.contains_key(var.name.as_str()) {
                return Err(IrError::UndeclaredVariable {
                    name: var.name.clone(),
                });
            }
        }
        Ok(())
    }

    fn check_args<'a>(&self, args: impl IntoIterator<Item = &'a Arg>) -> Result<(), IrError> {
        self.check_declared(args.into_iter().filter_map(Arg::var))
    }

    /// The scope a fresh child block of the innermost construct starts from.
    fn enclosing_scope(&self) -> Result<Arc<NameScope>, IrError> {
        let parent = self
            .frames
            .len()
            .checked_sub(2)
            .and_then(|i| self.frames.get(i))
            .ok_or(IrError::NoOpenFunction)?;
        Ok(Arc::new(NameScope::child(&parent.scope)))
    }

    fn push_cont(
        &mut self,
        construct: Construct,
        kind: ContinuationKind,
        passed: &[Var],
        keep_open: &[Var],
        children: usize,
    ) -> Result<(), IrError> {
        let parent = self.current_block(construct.name())?;
        self.check_declared(passed.iter().chain(keep_open))?;

        let mut scope = NameScope::child(&self.top()?.scope);
        let func = self.func()?;
        let cont = func.add_continuation(parent, kind);
        for _ in 0..children {
            func.add_child(cont);
        }
        let cont_data = func.cont_mut(cont);
        cont_data.passed_vars = passed.to_vec();
        cont_data.keep_open_vars = keep_open.to_vec();
        for var in cont_data.defined_vars() {
            scope.insert(var.name.clone(), var);
        }
        let first = cont_data.children.first().copied();
        let block = if construct == Construct::Switch {
            None
        } else {
            first
        };

        trace!(construct = construct.name(), "open");
        self.frames.push(Frame {
            construct,
            cont: Some(cont),
            block,
            scope: Arc::new(scope),
        });
        Ok(())
    }

    fn pop(&mut self, expected: Construct) -> Result<Frame, IrError> {
        let found = self.top()?.construct;
        if found != expected {
            return Err(IrError::UnbalancedNesting {
                expected: expected.name(),
                found: found.name().to_string(),
            });
        }
        trace!(construct = expected.name(), "close");
        self.frames.pop().ok_or(IrError::NoOpenFunction)
    }

    /// Switches the innermost construct to its child block `index`.
    fn enter_child(&mut self, expected: Construct, index: usize) -> Result<(), IrError> {
        let frame = self.top()?;
        if frame.construct != expected {
            return Err(IrError::UnbalancedNesting {
                expected: expected.name(),
                found: frame.construct.name().to_string(),
            });
        }
        let cont = frame.cont.ok_or(IrError::NoOpenBlock {
            what: expected.name(),
        })?;
        let function = self.function.as_ref().ok_or(IrError::NoOpenFunction)?;
        let children = function.cont(cont).children.clone();
        let block = *children.get(index).ok_or(IrError::CaseOutOfRange {
            index,
            blocks: children.len(),
        })?;
        let scope = self.enclosing_scope()?;
        let frame = self.top_mut()?;
        frame.block = Some(block);
        frame.scope = scope;
        Ok(())
    }

    fn innermost_loop(&self, what: &'static str) -> Result<ContId, IrError> {
        self.frames
            .iter()
            .rev()
            .find(|f| f.construct == Construct::Loop)
            .and_then(|f| f.cont)
            .ok_or(IrError::LoopControlOutsideLoop { what })
    }

    fn push_instruction(&mut self, instruction: Instruction) -> Result<(), IrError> {
        instruction.validate()?;
        let block = self.current_block("instruction")?;
        self.func()?.block_mut(block).instructions.push(instruction);
        Ok(())
    }
}

impl CodeGenerator for IrBuilder {
    fn declare_builtin(&mut self, builtin: &BuiltinFunction) -> Result<(), IrError> {
        self.program.builtins.push(builtin.clone());
        Ok(())
    }

    fn declare_app(&mut self, app: &AppFunction) -> Result<(), IrError> {
        self.program.apps.push(app.clone());
        Ok(())
    }

    fn add_global_const(&mut self, var: &Var, value: &Arg) -> Result<(), IrError> {
        self.program.add_global(var.clone(), value.clone())
    }

    #[instrument(level = "debug", skip_all, fields(name = name))]
    fn start_function(
        &mut self,
        name: &str,
        inputs: &[Var],
        outputs: &[Var],
    ) -> Result<(), IrError> {
        if let Some(open) = &self.function {
            return Err(IrError::FunctionStillOpen {
                name: open.name.clone(),
            });
        }
        debug!("start function");

        let mut function = Function::new(name, inputs.to_vec(), outputs.to_vec());
        let scope: NameScope = self
            .program
            .globals
            .values()
            .map(|g| g.var.clone())
            .chain(inputs.iter().cloned())
            .chain(outputs.iter().cloned())
            .map(|var| (var.name.clone(), var))
            .collect();
        for global in self.program.globals.keys() {
            function.reserve_name(global.clone());
        }

        self.frames.push(Frame {
            construct: Construct::Function,
            cont: None,
            block: Some(function.body),
            scope: Arc::new(scope),
        });
        self.function = Some(function);
        Ok(())
    }

    fn end_function(&mut self) -> Result<(), IrError> {
        self.pop(Construct::Function)?;
        let function = self.function.take().ok_or(IrError::NoOpenFunction)?;
        debug!(name = %function.name, blocks = function.blocks.len(), "end function");
        self.program.functions.push(function);
        Ok(())
    }

    fn declare_variable(&mut self, var: &Var) -> Result<(), IrError> {
        let block = self.current_block("declaration")?;
        self.func()?.declare(block, var.clone())?;
        let frame = self.top_mut()?;
        Arc::make_mut(&mut frame.scope).insert(var.name.clone(), var.clone());
        Ok(())
    }

    fn close_on_exit(&mut self, array: &Var) -> Result<(), IrError> {
        self.check_declared([array])?;
        let block = self.current_block("cleanup")?;
        self.func()?.block_mut(block).cleanups.push(array.clone());
        Ok(())
    }

    fn instruction(&mut self, instruction: &Instruction) -> Result<(), IrError> {
        match instruction {
            Instruction::LoopContinue(cont) => {
                self.loop_continue(&cont.new_vals, &cont.passed_vars, &cont.blocking)
            }
            Instruction::LoopBreak(brk) => self.loop_break(&brk.close_vars),
            other => {
                self.check_declared(&other.mentioned_vars())?;
                self.push_instruction(other.clone())
            }
        }
    }

    fn start_nested_block(&mut self) -> Result<(), IrError> {
        self.push_cont(Construct::Nested, ContinuationKind::Nested, &[], &[], 1)
    }

    fn end_nested_block(&mut self) -> Result<(), IrError> {
        self.pop(Construct::Nested).map(drop)
    }

    fn start_if_statement(&mut self, cond: &Arg, has_else: bool) -> Result<(), IrError> {
        self.check_args([cond])?;
        trace!(has_else, "if statement");
        // The else block always exists; an empty one means there is no else branch.
        self.push_cont(
            Construct::If,
            ContinuationKind::If(IfStatement { cond: cond.clone() }),
            &[],
            &[],
            2,
        )
    }

    fn start_else_block(&mut self) -> Result<(), IrError> {
        self.enter_child(Construct::If, 1)
    }

    fn end_if_statement(&mut self) -> Result<(), IrError> {
        self.pop(Construct::If).map(drop)
    }

    fn start_switch_statement(
        &mut self,
        value: &Arg,
        labels: &[i64],
        has_default: bool,
    ) -> Result<(), IrError> {
        self.check_args([value])?;
        self.push_cont(
            Construct::Switch,
            ContinuationKind::Switch(SwitchStatement {
                value: value.clone(),
                labels: labels.to_vec(),
                has_default,
            }),
            &[],
            &[],
            labels.len() + usize::from(has_default),
        )
    }

    fn start_case(&mut self, index: usize) -> Result<(), IrError> {
        self.enter_child(Construct::Switch, index)
    }

    fn end_switch_statement(&mut self) -> Result<(), IrError> {
        self.pop(Construct::Switch).map(drop)
    }

    fn start_wait_statement(
        &mut self,
        wait: &WaitStatement,
        passed: &[Var],
        keep_open: &[Var],
    ) -> Result<(), IrError> {
        self.check_declared(&wait.wait_vars)?;
        self.push_cont(
            Construct::Wait,
            ContinuationKind::Wait(wait.clone()),
            passed,
            keep_open,
            1,
        )
    }

    fn end_wait_statement(&mut self) -> Result<(), IrError> {
        self.pop(Construct::Wait).map(drop)
    }

    fn start_foreach_loop(
        &mut self,
        lp: &ForeachLoop,
        passed: &[Var],
        keep_open: &[Var],
    ) -> Result<(), IrError> {
        self.check_declared([&lp.array])?;
        self.push_cont(
            Construct::Foreach,
            ContinuationKind::Foreach(lp.clone()),
            passed,
            keep_open,
            1,
        )
    }

    fn end_foreach_loop(&mut self) -> Result<(), IrError> {
        self.pop(Construct::Foreach).map(drop)
    }

    fn start_range_loop(
        &mut self,
        lp: &RangeLoop,
        passed: &[Var],
        keep_open: &[Var],
    ) -> Result<(), IrError> {
        self.check_args([&lp.start, &lp.end, &lp.increment])?;
        self.push_cont(
            Construct::Range,
            ContinuationKind::Range(lp.clone()),
            passed,
            keep_open,
            1,
        )
    }

    fn end_range_loop(&mut self) -> Result<(), IrError> {
        self.pop(Construct::Range).map(drop)
    }

    fn start_loop(&mut self, lp: &Loop, passed: &[Var], keep_open: &[Var]) -> Result<(), IrError> {
        self.check_args(lp.vars.iter().map(|v| &v.init))?;
        self.push_cont(
            Construct::Loop,
            ContinuationKind::Loop(lp.clone()),
            passed,
            keep_open,
            1,
        )
    }

    fn loop_continue(
        &mut self,
        new_vals: &[Arg],
        passed_vars: &[Var],
        blocking: &[bool],
    ) -> Result<(), IrError> {
        let loop_id = self.innermost_loop("loop_continue")?;
        self.check_args(new_vals)?;
        self.check_declared(passed_vars)?;
        self.push_instruction(Instruction::LoopContinue(LoopContinue {
            loop_id: Some(loop_id),
            new_vals: new_vals.to_vec(),
            passed_vars: passed_vars.to_vec(),
            blocking: blocking.to_vec(),
        }))
    }

    fn loop_break(&mut self, close_vars: &[Var]) -> Result<(), IrError> {
        let loop_id = self.innermost_loop("loop_break")?;
        self.check_declared(close_vars)?;
        self.push_instruction(Instruction::LoopBreak(LoopBreak {
            loop_id: Some(loop_id),
            close_vars: close_vars.to_vec(),
        }))
    }

    fn end_loop(&mut self) -> Result<(), IrError> {
        self.pop(Construct::Loop).map(drop)
    }
}

fn is_empty_block(func: &Function, block: BlockId) -> bool {
    let block = func.block(block);
    block.variables.is_empty()
        && block.instructions.is_empty()
        && block.continuations.is_empty()
        && block.cleanups.is_empty()
}

/// Drives a backend with the whole program.
pub fn replay(program: &Program, backend: &mut dyn CodeGenerator) -> Result<(), IrError> {
    for builtin in &program.builtins {
        backend.declare_builtin(builtin)?;
    }
    for app in &program.apps {
        backend.declare_app(app)?;
    }
    for global in program.globals.values() {
        backend.add_global_const(&global.var, &global.value)?;
    }
    for function in &program.functions {
        replay_function(function, backend)?;
    }
    Ok(())
}

pub fn replay_function(function: &Function, backend: &mut dyn CodeGenerator) -> Result<(), IrError> {
    backend.start_function(&function.name, &function.inputs, &function.outputs)?;
    replay_block(function, function.body, backend)?;
    backend.end_function()
}

fn replay_block(
    func: &Function,
    block: BlockId,
    backend: &mut dyn CodeGenerator,
) -> Result<(), IrError> {
    let data = func.block(block);
    for var in &data.variables {
        backend.declare_variable(var)?;
    }
    for instruction in &data.instructions {
        backend.instruction(instruction)?;
    }
    for cont in &data.continuations {
        replay_cont(func, *cont, backend)?;
    }
    for array in &data.cleanups {
        backend.close_on_exit(array)?;
    }
    Ok(())
}

fn replay_children(
    func: &Function,
    cont: ContId,
    backend: &mut dyn CodeGenerator,
) -> Result<(), IrError> {
    for child in &func.cont(cont).children {
        replay_block(func, *child, backend)?;
    }
    Ok(())
}

fn replay_cont(func: &Function, id: ContId, backend: &mut dyn CodeGenerator) -> Result<(), IrError> {
    let cont = func.cont(id);
    let (passed, keep_open) = (&cont.passed_vars, &cont.keep_open_vars);
    match &cont.kind {
        ContinuationKind::Nested => {
            backend.start_nested_block()?;
            replay_children(func, id, backend)?;
            backend.end_nested_block()
        }
        ContinuationKind::If(stmt) => {
            let else_block = cont
                .children
                .get(1)
                .copied()
                .filter(|b| !is_empty_block(func, *b));
            backend.start_if_statement(&stmt.cond, else_block.is_some())?;
            if let Some(then) = cont.children.first() {
                replay_block(func, *then, backend)?;
            }
            if let Some(other) = else_block {
                backend.start_else_block()?;
                replay_block(func, other, backend)?;
            }
            backend.end_if_statement()
        }
        ContinuationKind::Switch(stmt) => {
            backend.start_switch_statement(&stmt.value, &stmt.labels, stmt.has_default)?;
            for (index, child) in cont.children.iter().enumerate() {
                backend.start_case(index)?;
                replay_block(func, *child, backend)?;
            }
            backend.end_switch_statement()
        }
        ContinuationKind::Wait(wait) => {
            backend.start_wait_statement(wait, passed, keep_open)?;
            replay_children(func, id, backend)?;
            backend.end_wait_statement()
        }
        ContinuationKind::Foreach(lp) => {
            backend.start_foreach_loop(lp, passed, keep_open)?;
            replay_children(func, id, backend)?;
            backend.end_foreach_loop()
        }
        ContinuationKind::Range(lp) => {
            backend.start_range_loop(lp, passed, keep_open)?;
            replay_children(func, id, backend)?;
            backend.end_range_loop()
        }
        ContinuationKind::Loop(lp) => {
            backend.start_loop(lp, passed, keep_open)?;
            replay_children(func, id, backend)?;
            backend.end_loop()
        }
    }
}
