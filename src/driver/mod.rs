use tracing::{info, instrument};

use crate::{
    ir::{
        IrError,
        builder::{CodeGenerator, replay},
        tree::Program,
    },
    opt::{OptimizeReport, optimize},
};

pub mod config;

use config::Config;

/// Optimizes `program` with the configured settings, then replays it into `backend`.
#[instrument(level = "info", skip_all, fields(opt_level = ?config.opt_level))]
pub fn compile(
    program: &mut Program,
    config: &Config,
    backend: &mut dyn CodeGenerator,
) -> Result<OptimizeReport, IrError> {
    let settings = config.settings();
    let report = optimize(program, &settings)?;
    replay(program, backend)?;
    info!(
        functions = program.functions.len(),
        globals = program.globals.len(),
        "program emitted"
    );
    Ok(report)
}
