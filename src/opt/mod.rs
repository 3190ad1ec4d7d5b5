//! The optimizer pipeline.
//!
//! Every pass rewrites a [`Function`] in place and reports whether it changed anything.
//! Passes run sequentially, in a fixed order, on one function at a time.

use tracing::{debug, info, instrument};

use crate::{
    driver::config::OptimizerSettings,
    ir::{Constants, IrError, printer::Printer, tree::{Function, Program}},
};

pub mod constant_fold;
pub mod dataflow;
pub mod dead_code;
pub mod fixup;
pub mod flatten;
pub mod fusion;
pub mod globals;
pub mod uniquify;
pub mod unroll;

/// State shared by the passes run over one program.
#[derive(Debug)]
pub struct PassContext<'a> {
    pub settings: &'a OptimizerSettings,
    /// Program-wide constants, known in every function.
    pub globals: Constants,
    /// Non-fatal diagnostics about the user's program.
    pub warnings: Vec<String>,
}

impl<'a> PassContext<'a> {
    pub fn new(settings: &'a OptimizerSettings, program: &Program) -> Self {
        let globals = program
            .globals
            .values()
            .map(|g| (g.var.clone(), g.value.clone()))
            .collect();
        Self {
            settings,
            globals,
            warnings: Vec::new(),
        }
    }

    /// Reports a diagnostic once, however many rounds rediscover it.
    pub fn warn(&mut self, message: String) {
        if self.warnings.contains(&message) {
            return;
        }
        tracing::warn!("{message}");
        self.warnings.push(message);
    }
}

pub trait FunctionPass {
    fn name(&self) -> &'static str;

    fn enabled(&self, _settings: &OptimizerSettings) -> bool {
        true
    }

    /// Rewrites the function, returning whether anything changed.
    fn run(&self, function: &mut Function, cx: &mut PassContext<'_>) -> Result<bool, IrError>;
}

/// What an optimization run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptimizeReport {
    /// Passes that changed the program, in the order they first did.
    pub changed: Vec<&'static str>,
    pub warnings: Vec<String>,
}

impl OptimizeReport {
    fn record(&mut self, pass: &'static str) {
        if !self.changed.contains(&pass) {
            self.changed.push(pass);
        }
    }

    pub fn did_change(&self, pass: &str) -> bool {
        self.changed.iter().any(|p| *p == pass)
    }
}

fn dump(function: &Function, pass: &str) {
    let mut printer = Printer::new();
    if crate::ir::builder::replay_function(function, &mut printer).is_ok() {
        debug!(function = %function.name, pass, "ir after pass:\n{}", printer.finish());
    }
}

fn run_pass(
    pass: &dyn FunctionPass,
    function: &mut Function,
    cx: &mut PassContext<'_>,
    report: &mut OptimizeReport,
) -> Result<(), IrError> {
    if !pass.enabled(cx.settings) {
        return Ok(());
    }
    let changed = pass.run(function, cx)?;
    debug!(function = %function.name, pass = pass.name(), changed, "pass finished");
    if changed {
        report.record(pass.name());
        if cx.settings.log_ir {
            dump(function, pass.name());
        }
    }
    Ok(())
}

/// Runs the configured pipeline over the whole program.
#[instrument(level = "debug", skip_all, fields(functions = program.functions.len()))]
pub fn optimize(
    program: &mut Program,
    settings: &OptimizerSettings,
) -> Result<OptimizeReport, IrError> {
    let mut report = OptimizeReport::default();
    let mut cx = PassContext::new(settings, program);

    let early: [&dyn FunctionPass; 4] = [
        &uniquify::Uniquify,
        &flatten::Flatten,
        &constant_fold::ConstantFold,
        &dead_code::DeadCode,
    ];
    let late: [&dyn FunctionPass; 4] = [
        &fusion::Fusion,
        &dataflow::ForwardDataflow,
        &dead_code::DeadCode,
        &flatten::Flatten,
    ];

    for round in 0..settings.opt_passes.max(1) {
        debug!(round, "optimizer round");
        for function in &mut program.functions {
            for pass in early {
                run_pass(pass, function, &mut cx, &mut report)?;
            }
            if round == 0 {
                run_pass(&unroll::Unroll, function, &mut cx, &mut report)?;
            }
            for pass in late {
                run_pass(pass, function, &mut cx, &mut report)?;
            }
        }
    }

    if settings.promote_constants && globals::promote_constants(program)? {
        report.record(globals::PASS_NAME);
    }
    for function in &mut program.functions {
        run_pass(&fixup::Fixup, function, &mut cx, &mut report)?;
    }

    report.warnings = cx.warnings;
    info!(changed = ?report.changed, warnings = report.warnings.len(), "optimization finished");
    Ok(report)
}
