use flowir::{
    driver::{
        compile,
        config::{Config, OptLevel},
    },
    ir::{
        Arg, DefKind, PrimType, Type,
        builder::{CodeGenerator, IrBuilder, replay},
        continuation::{ContinuationKind, ForeachLoop, Loop, LoopVar, RangeLoop, WaitStatement},
        fold::BuiltinOp,
        instruction::Instruction,
        opcode::Opcode,
        printer::Printer,
    },
};
use test_case::test_case;

use crate::common::{
    build_main, input, instructions, int, int_array, int_value, main_of, optimize_at, output,
    print, traced,
};

mod common;

#[test]
fn constant_branch_folds_to_single_store() {
    let x = output("x");
    let mut program = build_main(&[], &[x.clone()], |b| {
        b.start_if_statement(&Arg::Bool(true), true)?;
        b.assign(&x, Arg::Int(3))?;
        b.start_else_block()?;
        b.assign(&x, Arg::Int(4))?;
        b.end_if_statement()
    });

    let report = optimize_at(&mut program, OptLevel::Default);
    assert!(report.did_change("flatten"));
    let main = main_of(&program);
    let body = main.block(main.body);
    assert!(body.continuations.is_empty());
    assert_eq!(body.instructions, vec![Instruction::store(&x, Arg::Int(3))]);
}

#[test]
fn range_loop_is_unrolled_with_guarded_copy() {
    let mut program = build_main(&[], &[], |b| {
        let lp = RangeLoop {
            name: "r".into(),
            var: int_value("i"),
            counter: None,
            start: Arg::Int(0),
            end: Arg::Int(2),
            increment: Arg::Int(1),
            sync: false,
            split_degree: 16,
            desired_unroll: 2,
        };
        b.start_range_loop(&lp, &[], &[])?;
        b.async_op(BuiltinOp::Trace, None, vec![int_value("i").into()])?;
        b.end_range_loop()
    });

    let report = optimize_at(&mut program, OptLevel::Aggressive);
    assert!(report.did_change("loop-unroll"));
    let main = main_of(&program);
    let [range] = main.block(main.body).continuations[..] else {
        panic!("expected a single loop:\n{}", print(&program));
    };
    let ContinuationKind::Range(lp) = &main.cont(range).kind else {
        panic!("expected a range loop");
    };
    assert_eq!(lp.increment, Arg::Int(2));
    assert_eq!(lp.desired_unroll, 1);

    let body = main.block(main.cont(range).children[0]);
    let [guard] = body.continuations[..] else {
        panic!("expected a guarded copy:\n{}", print(&program));
    };
    assert!(matches!(main.cont(guard).kind, ContinuationKind::If(_)));
    assert_eq!(traced(main).len(), 2);
}

#[test]
fn duplicate_array_lookups_collapse() {
    let array = input("A", Type::Array(Box::new(Type::Future(PrimType::Int))));
    let out = output("o");
    let reference = |name: &str| {
        flowir::ir::Var::new(
            name,
            Type::Ref(Box::new(Type::Future(PrimType::Int))),
            flowir::ir::Storage::Future,
            DefKind::Local,
        )
    };
    let mut program = build_main(&[array.clone()], &[out.clone()], |b| {
        for (r, v) in [("r1", "v1"), ("r2", "v2")] {
            b.declare_variable(&reference(r))?;
            b.declare_variable(&int(v))?;
            b.array_lookup_future(&reference(r), &array, Arg::Int(0))?;
            b.dereference(&int(v), &reference(r))?;
        }
        b.async_op(
            BuiltinOp::PlusInt,
            Some(&out),
            vec![int("v1").into(), int("v2").into()],
        )
    });

    optimize_at(&mut program, OptLevel::Default);
    let main = main_of(&program);
    let lookups = instructions(main)
        .into_iter()
        .filter(|inst| {
            matches!(
                inst.opcode(),
                Opcode::ArrayLookupFuture | Opcode::ArrayLookupRefImm | Opcode::ArrayLookupImm
            )
        })
        .count();
    assert_eq!(lookups, 1, "{}", print(&program));

    let sum = instructions(main)
        .into_iter()
        .find(|inst| inst.outputs().contains(&out))
        .expect("output is still written");
    let inputs = sum.inputs();
    assert_eq!(inputs.len(), 2);
    assert_eq!(inputs[0], inputs[1]);
}

#[test]
fn closed_waits_are_eliminated_and_open_ones_kept() {
    let a = input("a", Type::Future(PrimType::Int));
    let mut program = build_main(&[a.clone()], &[], |b| {
        b.declare_variable(&int("x"))?;
        b.assign(&int("x"), Arg::Int(1))?;
        let explicit = WaitStatement {
            name: "explicit".into(),
            wait_vars: vec![int("x")],
            explicit: true,
        };
        b.start_wait_statement(&explicit, &[int("x")], &[])?;
        b.async_op(BuiltinOp::Trace, None, vec![int("x").into()])?;
        b.end_wait_statement()?;

        let pending = WaitStatement {
            name: "pending".into(),
            wait_vars: vec![a.clone()],
            explicit: false,
        };
        b.start_wait_statement(&pending, &[a.clone()], &[])?;
        b.async_op(BuiltinOp::Trace, None, vec![a.clone().into()])?;
        b.end_wait_statement()
    });

    optimize_at(&mut program, OptLevel::Default);
    let main = main_of(&program);
    let [wait] = main.block(main.body).continuations[..] else {
        panic!("expected one remaining wait:\n{}", print(&program));
    };
    let ContinuationKind::Wait(stmt) = &main.cont(wait).kind else {
        panic!("expected a wait statement");
    };
    assert_eq!(stmt.name, "pending");
    assert_eq!(stmt.wait_vars, vec![a.clone()]);
    assert_eq!(main.cont(wait).passed_vars, vec![a]);
    assert_eq!(traced(main)[0], vec![Arg::Int(1)]);
}

#[test]
fn dead_code_keeps_observable_effects() {
    let a = input("a", Type::Future(PrimType::Int));
    let out = output("o");
    let mut program = build_main(&[a.clone()], &[out.clone()], |b| {
        b.declare_variable(&int("unused"))?;
        b.async_op(
            BuiltinOp::PlusInt,
            Some(&int("unused")),
            vec![a.clone().into(), Arg::Int(1)],
        )?;
        b.async_op(BuiltinOp::Trace, None, vec![a.clone().into()])?;
        b.async_op(BuiltinOp::Copy, Some(&out), vec![a.clone().into()])
    });

    optimize_at(&mut program, OptLevel::Less);
    let main = main_of(&program);
    let body = main.block(main.body);
    assert!(body.variables.is_empty());
    assert_eq!(
        body.instructions,
        vec![
            Instruction::async_op(BuiltinOp::Trace, None, vec![a.clone().into()]),
            Instruction::async_op(BuiltinOp::Copy, Some(out), vec![a.into()]),
        ]
    );
}

#[test]
fn shadowed_declarations_stay_distinct() {
    let mut program = build_main(&[], &[], |b| {
        b.declare_variable(&int("x"))?;
        b.assign(&int("x"), Arg::Int(1))?;
        b.start_nested_block()?;
        b.declare_variable(&int("x"))?;
        b.assign(&int("x"), Arg::Int(2))?;
        b.async_op(BuiltinOp::Trace, None, vec![int("x").into()])?;
        b.end_nested_block()?;
        b.async_op(BuiltinOp::Trace, None, vec![int("x").into()])
    });

    optimize_at(&mut program, OptLevel::Less);
    let main = main_of(&program);
    assert!(main.block(main.body).continuations.is_empty());
    assert_eq!(
        traced(main),
        vec![vec![Arg::Int(1)], vec![Arg::Int(2)]],
        "{}",
        print(&program)
    );
}

#[test_case(1, 10; "first label")]
#[test_case(2, 20; "second label")]
#[test_case(7, 30; "default")]
fn switch_on_literal_is_predicted(value: i64, expected: i64) {
    let mut program = build_main(&[], &[], |b| {
        b.start_switch_statement(&Arg::Int(value), &[1, 2], true)?;
        for (index, traced) in [10, 20, 30].into_iter().enumerate() {
            b.start_case(index)?;
            b.async_op(BuiltinOp::Trace, None, vec![Arg::Int(traced)])?;
        }
        b.end_switch_statement()
    });

    optimize_at(&mut program, OptLevel::Less);
    let main = main_of(&program);
    assert!(main.block(main.body).continuations.is_empty());
    assert_eq!(traced(main), vec![vec![Arg::Int(expected)]]);
}

#[test]
fn replay_reproduces_the_program() {
    let array = int_array("A", DefKind::InArg);
    let out = output("o");
    let program = build_main(&[array.clone()], &[out.clone()], |b| {
        b.declare_variable(&int("sum"))?;
        let each = ForeachLoop {
            name: "each".into(),
            array: array.clone(),
            member: int("m"),
            counter: Some(int_value("k")),
            sync: false,
            split_degree: 8,
        };
        b.start_foreach_loop(&each, &[array.clone()], &[])?;
        b.async_op(BuiltinOp::Trace, None, vec![int("m").into(), int_value("k").into()])?;
        b.end_foreach_loop()?;

        let lp = Loop {
            name: "count".into(),
            vars: vec![LoopVar {
                var: int_value("n"),
                init: Arg::Int(0),
                blocking: false,
            }],
        };
        b.start_loop(&lp, &[out.clone()], &[out.clone()])?;
        b.declare_variable(&int_value("more"))?;
        b.local_op(
            BuiltinOp::LtInt,
            Some(&int_value("more")),
            vec![int_value("n").into(), Arg::Int(3)],
        )?;
        b.start_if_statement(&int_value("more").into(), true)?;
        b.declare_variable(&int_value("next"))?;
        b.local_op(
            BuiltinOp::PlusInt,
            Some(&int_value("next")),
            vec![int_value("n").into(), Arg::Int(1)],
        )?;
        b.loop_continue(&[int_value("next").into()], &[out.clone()], &[false])?;
        b.start_else_block()?;
        b.assign(&out, int_value("n").into())?;
        b.loop_break(&[])?;
        b.end_if_statement()?;
        b.end_loop()?;
        b.assign(&int("sum"), Arg::Int(0))
    });

    let mut rebuilt = IrBuilder::new();
    replay(&program, &mut rebuilt).unwrap();
    let rebuilt = rebuilt.finish().unwrap();
    assert_eq!(print(&rebuilt), print(&program));
    assert_eq!(program.to_string(), print(&program));
}

#[test]
fn compile_optimizes_then_emits() {
    let x = output("x");
    let mut program = build_main(&[], &[x.clone()], |b| {
        b.start_nested_block()?;
        b.assign(&x, Arg::Int(1))?;
        b.end_nested_block()
    });

    let config: Config = "opt_level = \"less\"".parse().unwrap();
    let mut printer = Printer::new();
    let report = compile(&mut program, &config, &mut printer).unwrap();
    assert!(report.did_change("flatten"));
    assert!(report.warnings.is_empty());
    assert_eq!(printer.finish(), print(&program));
}
