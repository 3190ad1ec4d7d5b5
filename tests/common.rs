use flowir::{
    driver::config::{OptLevel, OptimizerSettings},
    ir::{
        Arg, DefKind, IrError, PrimType, Storage, Type, Var,
        builder::{CodeGenerator, IrBuilder, replay},
        fold::BuiltinOp,
        instruction::Instruction,
        printer::Printer,
        tree::{Function, Program},
    },
    opt::{OptimizeReport, optimize},
};
use tracing_subscriber::EnvFilter;

/// Routes pass logs to the test output; set `RUST_LOG=flowir=trace` to see them.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[allow(unused)]
pub fn int(name: &str) -> Var {
    Var::new(name, Type::Future(PrimType::Int), Storage::Future, DefKind::Local)
}

#[allow(unused)]
pub fn int_value(name: &str) -> Var {
    Var::new(name, Type::Value(PrimType::Int), Storage::Local, DefKind::Local)
}

#[allow(unused)]
pub fn input(name: &str, ty: Type) -> Var {
    Var::new(name, ty, Storage::Future, DefKind::InArg)
}

#[allow(unused)]
pub fn output(name: &str) -> Var {
    Var::new(name, Type::Future(PrimType::Int), Storage::Future, DefKind::OutArg)
}

#[allow(unused)]
pub fn int_array(name: &str, def: DefKind) -> Var {
    Var::new(
        name,
        Type::Array(Box::new(Type::Future(PrimType::Int))),
        Storage::Future,
        def,
    )
}

/// Builds a program with a single function `main` through the construction protocol.
#[track_caller]
pub fn build_main(
    inputs: &[Var],
    outputs: &[Var],
    body: impl FnOnce(&mut IrBuilder) -> Result<(), IrError>,
) -> Program {
    let mut builder = IrBuilder::new();
    builder
        .start_function("main", inputs, outputs)
        .expect("failed to start main");
    body(&mut builder).expect("failed to build main");
    builder.end_function().expect("failed to end main");
    builder.finish().expect("failed to finish program")
}

#[allow(unused)]
#[track_caller]
pub fn optimize_at(program: &mut Program, level: OptLevel) -> OptimizeReport {
    init_logging();
    let settings = OptimizerSettings::for_level(level);
    optimize(program, &settings).expect("optimizer failed")
}

#[allow(unused)]
#[track_caller]
pub fn print(program: &Program) -> String {
    let mut printer = Printer::new();
    replay(program, &mut printer).expect("replay failed");
    printer.finish()
}

#[allow(unused)]
pub fn main_of(program: &Program) -> &Function {
    program.function("main").expect("no main function")
}

/// Every instruction of the function, in tree preorder.
#[allow(unused)]
pub fn instructions(func: &Function) -> Vec<&Instruction> {
    func.blocks_preorder(func.body)
        .into_iter()
        .flat_map(move |block| func.block(block).instructions.iter())
        .collect()
}

/// The operands of every trace, in tree preorder, whether async or local.
#[allow(unused)]
pub fn traced(func: &Function) -> Vec<Vec<Arg>> {
    instructions(func)
        .into_iter()
        .filter_map(|inst| match inst {
            Instruction::Builtin(b) if b.op == BuiltinOp::Trace => Some(b.inputs.clone()),
            _ => None,
        })
        .collect()
}
