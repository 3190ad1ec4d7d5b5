//! Range loop unrolling.
//!
//! A loop unrolled `k` times steps by `k` increments. Its body is followed by `k - 1`
//! copies, each nested in the previous one, running iteration `i + j * increment`. When the
//! trip count is not known to be a multiple of `k`, each copy is guarded by a bounds check.

use std::cmp;

use tracing::{debug, trace};

use super::{FunctionPass, PassContext, flatten, uniquify};
use crate::{
    driver::config::OptimizerSettings,
    ir::{
        Arg, IrError, NoFacts, PrimType, RenameMode, Renames, Type, Var,
        continuation::{ContinuationKind, IfStatement, RangeLoop},
        fold::BuiltinOp,
        instruction::Instruction,
        tree::{BlockId, BlockParent, ContId, Function},
    },
};

#[derive(Debug, Clone, Copy, Default)]
pub struct Unroll;

impl FunctionPass for Unroll {
    fn name(&self) -> &'static str {
        "loop-unroll"
    }

    fn enabled(&self, settings: &OptimizerSettings) -> bool {
        settings.loop_unroll && settings.max_unroll > 1
    }

    fn run(&self, function: &mut Function, cx: &mut PassContext<'_>) -> Result<bool, IrError> {
        let mut unrolled = 0;
        for cont in function.conts_preorder(function.body) {
            if function.conts.get(cont).is_some()
                && unroll_range(function, cont, cx.settings.max_unroll)?
            {
                unrolled += 1;
            }
        }
        if unrolled == 0 {
            return Ok(false);
        }
        debug!(function = %function.name, unrolled, "unrolled range loops");

        // Copies repeat the body's declarations.
        let globals: Vec<String> = cx.globals.keys().map(|v| v.name.clone()).collect();
        uniquify::uniquify(function, globals);
        flatten::flatten(function)?;
        Ok(true)
    }
}

/// A loop we know how to unroll, with the chosen factor.
struct Plan {
    lp: RangeLoop,
    body: BlockId,
    factor: i64,
    increment: i64,
    /// Every outer iteration runs all copies.
    exact: bool,
}

fn plan(func: &Function, cont: ContId, max_unroll: u32) -> Option<Plan> {
    let data = func.cont(cont);
    let ContinuationKind::Range(lp) = &data.kind else {
        return None;
    };
    let factor = i64::from(cmp::min(lp.desired_unroll, max_unroll));
    let increment = lp.increment.as_int().filter(|inc| *inc != 0)?;
    let [body] = data.children.as_slice() else {
        return None;
    };
    if factor <= 1 || !lp.var.is_value() {
        return None;
    }
    increment.checked_mul(factor)?;

    let exact = lp
        .trip_count(&NoFacts)
        .is_some_and(|count| count % factor == 0);
    // Bounds checks run as local ops, so the end bound must be readable without waiting.
    let end_available = match &lp.end {
        Arg::Var(var) => var.is_value(),
        _ => true,
    };
    if !exact && !end_available {
        return None;
    }
    Some(Plan {
        lp: lp.clone(),
        body: *body,
        factor,
        increment,
        exact,
    })
}

fn local_int_op(op: BuiltinOp, out: &Var, lhs: &Var, rhs: Arg) -> Instruction {
    Instruction::local_op(op, Some(out.clone()), vec![Arg::Var(lhs.clone()), rhs])
}

fn unroll_range(func: &mut Function, cont: ContId, max_unroll: u32) -> Result<bool, IrError> {
    let Some(plan) = plan(func, cont, max_unroll) else {
        return Ok(false);
    };
    let Plan {
        mut lp,
        body,
        factor,
        increment,
        exact,
    } = plan;
    trace!(loop_name = %lp.name, factor, exact, "unrolling range loop");

    let copies: Vec<BlockId> = (1..factor)
        .map(|_| func.clone_block(body, BlockParent::Function))
        .collect();

    let mut current = body;
    for (j, copy) in (1..factor).zip(copies) {
        let var = func.fresh_var(&lp.var);
        func.declare(current, var.clone())?;
        func.block_mut(current).instructions.push(local_int_op(
            BuiltinOp::PlusInt,
            &var,
            &lp.var,
            Arg::Int(j * increment),
        ));

        let guard = if exact {
            func.add_continuation(current, ContinuationKind::Nested)
        } else {
            // A shift that wraps around lands below `i`, failing the second check.
            let (within, advanced) = if increment > 0 {
                (BuiltinOp::LteInt, BuiltinOp::GtInt)
            } else {
                (BuiltinOp::GteInt, BuiltinOp::LtInt)
            };
            let in_range = func.fresh_temp("unroll_in_range", Type::Value(PrimType::Bool));
            let no_wrap = func.fresh_temp("unroll_no_wrap", Type::Value(PrimType::Bool));
            let check = func.fresh_temp("unroll_check", Type::Value(PrimType::Bool));
            for temp in [&in_range, &no_wrap, &check] {
                func.declare(current, temp.clone())?;
            }
            let insts = &mut func.block_mut(current).instructions;
            insts.push(local_int_op(within, &in_range, &var, lp.end.clone()));
            insts.push(local_int_op(advanced, &no_wrap, &var, Arg::Var(lp.var.clone())));
            insts.push(Instruction::local_op(
                BuiltinOp::And,
                Some(check.clone()),
                vec![Arg::Var(in_range), Arg::Var(no_wrap)],
            ));
            func.add_continuation(
                current,
                ContinuationKind::If(IfStatement {
                    cond: Arg::Var(check),
                }),
            )
        };

        func.block_mut(copy).parent = BlockParent::Cont(guard);
        func.cont_mut(guard).children.push(copy);
        if !exact {
            func.add_child(guard);
        }

        let mut renames = Renames::new();
        renames.insert(lp.var.clone(), Arg::Var(var));
        func.rename_vars(copy, &renames, RenameMode::InputsOnly);

        if let Some(counter) = &lp.counter {
            let shifted = func.fresh_var(counter);
            let mut renames = Renames::new();
            renames.insert(counter.clone(), Arg::Var(shifted.clone()));
            func.rename_vars(copy, &renames, RenameMode::InputsOnly);
            func.declare(copy, shifted.clone())?;
            func.block_mut(copy).instructions.insert(
                0,
                local_int_op(BuiltinOp::PlusInt, &shifted, counter, Arg::Int(j)),
            );
        }
        current = copy;
    }

    if let Some(counter) = lp.counter.take() {
        let outer = func.fresh_var(&counter);
        func.declare(body, counter.clone())?;
        func.block_mut(body).instructions.insert(
            0,
            local_int_op(BuiltinOp::MultInt, &counter, &outer, Arg::Int(factor)),
        );
        lp.counter = Some(outer);
    }

    lp.increment = Arg::Int(increment * factor);
    lp.desired_unroll = 1;
    func.cont_mut(cont).kind = ContinuationKind::Range(lp);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::ir::{
        DefKind, Storage,
        fold::evaluate,
        instruction::{ExecMode, Instruction},
        tree::Program,
    };

    fn int_value(name: &str) -> Var {
        Var::new(name, Type::Value(PrimType::Int), Storage::Local, DefKind::Local)
    }

    fn trace_of(var: &Var) -> Instruction {
        Instruction::async_op(BuiltinOp::Trace, None, vec![var.into()])
    }

    fn range(end: i64, unroll: u32, counter: Option<Var>) -> (Function, ContId) {
        let mut func = Function::new("f", vec![], vec![]);
        let body = func.body;
        let cont = func.add_continuation(
            body,
            ContinuationKind::Range(RangeLoop {
                name: "r".into(),
                var: int_value("i"),
                counter: counter.clone(),
                start: Arg::Int(0),
                end: Arg::Int(end),
                increment: Arg::Int(1),
                sync: false,
                split_degree: 16,
                desired_unroll: unroll,
            }),
        );
        let child = func.add_child(cont);
        func.block_mut(child).instructions.push(trace_of(&int_value("i")));
        if let Some(counter) = &counter {
            func.block_mut(child).instructions.push(trace_of(counter));
        }
        (func, cont)
    }

    fn run(func: &mut Function) -> bool {
        let settings = OptimizerSettings::for_level(crate::driver::config::OptLevel::Aggressive);
        let program = Program::default();
        let mut cx = PassContext::new(&settings, &program);
        Unroll.run(func, &mut cx).unwrap()
    }

    fn range_of(func: &Function, cont: ContId) -> &RangeLoop {
        match &func.cont(cont).kind {
            ContinuationKind::Range(lp) => lp,
            other => panic!("expected a range loop, found {}", other.name()),
        }
    }

    #[test]
    fn uneven_trip_count_guards_copies() {
        let (mut func, cont) = range(2, 2, None);
        assert!(run(&mut func));

        let lp = range_of(&func, cont);
        assert_eq!(lp.increment, Arg::Int(2));
        assert_eq!(lp.desired_unroll, 1);

        let body = func.cont(cont).children[0];
        let block = func.block(body);
        assert_eq!(block.instructions.len(), 5);
        assert_eq!(block.continuations.len(), 1);
        let guard = func.cont(block.continuations[0]);
        assert!(matches!(guard.kind, ContinuationKind::If(_)));
        assert_eq!(guard.children.len(), 2);

        let shifted = block.instructions[1].outputs()[0].clone();
        let copy = func.block(guard.children[0]);
        assert_eq!(copy.instructions, vec![trace_of(&shifted)]);
        assert!(func.block(guard.children[1]).instructions.is_empty());
    }

    #[test]
    fn even_trip_count_is_flattened_with_counters() {
        let (mut func, cont) = range(3, 2, Some(int_value("n")));
        assert!(run(&mut func));

        let lp = range_of(&func, cont);
        let outer = lp.counter.clone().unwrap();
        assert_ne!(outer, int_value("n"));

        let body = func.cont(cont).children[0];
        let block = func.block(body);
        assert!(block.continuations.is_empty());
        let ops: Vec<String> = block.instructions.iter().map(|i| i.to_string()).collect();
        assert_eq!(ops.len(), 7, "{ops:?}");
        assert_eq!(
            block.instructions[0],
            local_int_op(BuiltinOp::MultInt, &int_value("n"), &outer, Arg::Int(2))
        );
        assert_eq!(block.instructions[4].read_vars(), vec![int_value("n")]);
        let shifted_counter = block.instructions[4].outputs()[0].clone();
        assert_eq!(block.instructions[6], trace_of(&shifted_counter));
    }

    #[test]
    fn loops_without_literal_step_are_left_alone() {
        let (mut func, cont) = range(8, 4, None);
        let lp = match &mut func.cont_mut(cont).kind {
            ContinuationKind::Range(lp) => lp,
            _ => unreachable!(),
        };
        lp.increment = Arg::Var(int_value("step"));
        assert!(!run(&mut func));
    }

    /// Runs the local ops of the unrolled body for outer iteration `i` and reads the guard.
    fn copy_runs(func: &Function, cont: ContId, i: i64) -> bool {
        let body = func.block(func.cont(cont).children[0]);
        let mut env = HashMap::from([(range_of(func, cont).var.clone(), Arg::Int(i))]);
        for inst in &body.instructions {
            let Instruction::Builtin(b) = inst else {
                continue;
            };
            if b.mode != ExecMode::Local {
                continue;
            }
            let args: Vec<Option<Arg>> = b
                .inputs
                .iter()
                .map(|arg| match arg {
                    Arg::Var(var) => env.get(var).cloned(),
                    lit => Some(lit.clone()),
                })
                .collect();
            if let (Some(out), Some(value)) = (&b.output, evaluate(b.op, &args).unwrap()) {
                env.insert(out.clone(), value);
            }
        }
        let ContinuationKind::If(guard) = &func.cont(body.continuations[0]).kind else {
            panic!("expected a guard");
        };
        env.get(guard.cond.var().unwrap()) == Some(&Arg::Bool(true))
    }

    #[test]
    fn guards_hold_near_the_end_of_the_int_range() {
        let (mut func, cont) = range(i64::MAX - 1, 2, None);
        if let ContinuationKind::Range(lp) = &mut func.cont_mut(cont).kind {
            lp.increment = Arg::Int(3);
        }
        assert!(run(&mut func));

        assert!(copy_runs(&func, cont, 0));
        assert!(copy_runs(&func, cont, i64::MAX - 4));
        assert!(!copy_runs(&func, cont, i64::MAX - 3));
        // i + 3 wraps around to a negative value here.
        assert!(!copy_runs(&func, cont, i64::MAX - 2));
    }
}
