use itertools::Itertools;
use tracing::{debug, trace};

use super::{FunctionPass, PassContext};
use crate::{
    driver::config::OptimizerSettings,
    ir::{
        Arg, IrError, RenameMode, Renames, Var,
        tree::{BlockId, ContId, Function},
    },
};

/// Merges sibling loops over the same iteration space into one loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fusion;

impl FunctionPass for Fusion {
    fn name(&self) -> &'static str {
        "loop-fusion"
    }

    fn enabled(&self, settings: &OptimizerSettings) -> bool {
        settings.loop_fusion
    }

    fn run(&self, function: &mut Function, _cx: &mut PassContext<'_>) -> Result<bool, IrError> {
        let mut fused = 0;
        for block in function.blocks_preorder(function.body) {
            while let Some((first, second)) = fusable_pair(function, block) {
                fuse(function, first, second)?;
                fused += 1;
            }
        }
        if fused > 0 {
            debug!(function = %function.name, fused, "fused loops");
        }
        Ok(fused > 0)
    }
}

fn fusable_pair(func: &Function, block: BlockId) -> Option<(ContId, ContId)> {
    // Blocks dropped by an earlier fusion in this walk are skipped.
    let data = func.blocks.get(block)?;
    data.continuations
        .iter()
        .tuple_combinations()
        .find(|(a, b)| {
            let (a, b) = (func.cont(**a), func.cont(**b));
            a.children.len() == 1 && b.children.len() == 1 && a.fusable_with(b)
        })
        .map(|(a, b)| (*a, *b))
}

/// Moves the body of `second` into `first` and removes `second`.
pub fn fuse(func: &mut Function, first: ContId, second: ContId) -> Result<(), IrError> {
    let renames: Renames = func
        .cont(second)
        .defined_vars()
        .into_iter()
        .zip(func.cont(first).defined_vars())
        .map(|(old, new)| (old, Arg::Var(new)))
        .collect();
    trace!(
        first = func.cont(first).name(),
        renamed = renames.to_map().len(),
        "fusing sibling loops"
    );

    let source = func.cont(second).children[0];
    let target = func.cont(first).children[0];
    func.rename_vars(source, &renames, RenameMode::InputsOnly);
    func.splice_block(source, target)?;

    let (passed, keep_open) = {
        let other = func.cont(second);
        (other.passed_vars.clone(), other.keep_open_vars.clone())
    };
    let merged = func.cont_mut(first);
    let union = |ours: &mut Vec<Var>, theirs: Vec<Var>| {
        *ours = std::mem::take(ours).into_iter().chain(theirs).unique().collect();
    };
    union(&mut merged.passed_vars, passed);
    union(&mut merged.keep_open_vars, keep_open);
    func.remove_continuation(second);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{
        DefKind, PrimType, Storage, Type, Var,
        continuation::{ContinuationKind, ForeachLoop},
        fold::BuiltinOp,
        instruction::Instruction,
        tree::Program,
    };

    fn int(name: &str) -> Var {
        Var::new(name, Type::Future(PrimType::Int), Storage::Future, DefKind::Local)
    }

    fn array(name: &str) -> Var {
        Var::new(
            name,
            Type::Array(Box::new(Type::Future(PrimType::Int))),
            Storage::Future,
            DefKind::Local,
        )
    }

    fn foreach(func: &mut Function, over: &Var, member: &str, passed: &[Var]) -> ContId {
        let body = func.body;
        let lp = func.add_continuation(
            body,
            ContinuationKind::Foreach(ForeachLoop {
                name: format!("each_{member}"),
                array: over.clone(),
                member: int(member),
                counter: None,
                sync: false,
                split_degree: 16,
            }),
        );
        func.cont_mut(lp).passed_vars = passed.to_vec();
        let child = func.add_child(lp);
        func.block_mut(child).instructions.push(Instruction::async_op(
            BuiltinOp::Trace,
            None,
            vec![int(member).into()],
        ));
        lp
    }

    fn run(func: &mut Function) -> bool {
        let settings = OptimizerSettings::default();
        let program = Program::default();
        let mut cx = PassContext::new(&settings, &program);
        Fusion.run(func, &mut cx).unwrap()
    }

    #[test]
    fn fuses_loops_over_same_array() {
        let mut func = Function::new("f", vec![], vec![]);
        let body = func.body;
        func.declare(body, array("A")).unwrap();
        func.declare(body, array("B")).unwrap();
        let first = foreach(&mut func, &array("A"), "m1", &[array("A"), int("p")]);
        foreach(&mut func, &array("A"), "m2", &[array("A"), int("q")]);
        let other = foreach(&mut func, &array("B"), "m3", &[]);

        assert!(run(&mut func));
        assert_eq!(func.block(body).continuations, vec![first, other]);
        let fused = func.cont(first);
        assert_eq!(fused.passed_vars, vec![array("A"), int("p"), int("q")]);
        let child = fused.children[0];
        let reads: Vec<Vec<Var>> = func
            .block(child)
            .instructions
            .iter()
            .map(|i| i.read_vars())
            .collect();
        assert_eq!(reads, vec![vec![int("m1")], vec![int("m1")]]);
        assert!(!run(&mut func));
    }
}
