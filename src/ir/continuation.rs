use std::collections::HashSet;

use itertools::Itertools;

use super::{
    Arg, Facts, IrError, RenameMode, Renames, Var,
    instruction::{rename_arg, rename_var},
    tree::BlockId,
};

#[derive(Debug, Clone, PartialEq)]
pub struct IfStatement {
    pub cond: Arg,
}

/// Integer-labeled cases, followed by the default block when there is one.
#[derive(Debug, Clone, PartialEq)]
pub struct SwitchStatement {
    pub value: Arg,
    pub labels: Vec<i64>,
    pub has_default: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForeachLoop {
    pub name: String,
    pub array: Var,
    pub member: Var,
    pub counter: Option<Var>,
    /// Each iteration completes before the next starts.
    pub sync: bool,
    /// Fan-out factor of the recursive parallel split.
    pub split_degree: u32,
}

/// Iterates `var` from `start` to `end` inclusive.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeLoop {
    pub name: String,
    pub var: Var,
    pub counter: Option<Var>,
    pub start: Arg,
    pub end: Arg,
    pub increment: Arg,
    pub sync: bool,
    pub split_degree: u32,
    pub desired_unroll: u32,
}

impl RangeLoop {
    /// The statically known number of iterations.
    pub fn trip_count(&self, facts: &dyn Facts) -> Option<i64> {
        let start = facts.literal(&self.start)?.as_int()?;
        let end = facts.literal(&self.end)?.as_int()?;
        let increment = facts.literal(&self.increment)?.as_int()?;
        trip_count(start, end, increment)
    }
}

pub fn trip_count(start: i64, end: i64, increment: i64) -> Option<i64> {
    let (start, end, increment) = (i128::from(start), i128::from(end), i128::from(increment));
    let count = match increment {
        0 => return None,
        inc if inc > 0 && end < start => 0,
        inc if inc < 0 && end > start => 0,
        inc => (end - start) / inc + 1,
    };
    i64::try_from(count).ok()
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoopVar {
    pub var: Var,
    pub init: Arg,
    /// The body of each iteration waits for this variable.
    pub blocking: bool,
}

/// A tail-recursive loop. The first loop variable is the condition checked by the body.
#[derive(Debug, Clone, PartialEq)]
pub struct Loop {
    pub name: String,
    pub vars: Vec<LoopVar>,
}

impl Loop {
    pub fn condition(&self) -> Option<&LoopVar> {
        self.vars.first()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WaitStatement {
    pub name: String,
    pub wait_vars: Vec<Var>,
    /// Written by the user rather than synthesized by the compiler.
    pub explicit: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContinuationKind {
    Nested,
    If(IfStatement),
    Switch(SwitchStatement),
    Foreach(ForeachLoop),
    Range(RangeLoop),
    Loop(Loop),
    Wait(WaitStatement),
}

impl ContinuationKind {
    pub fn name(&self) -> &'static str {
        match self {
            ContinuationKind::Nested => "nested block",
            ContinuationKind::If(_) => "if statement",
            ContinuationKind::Switch(_) => "switch statement",
            ContinuationKind::Foreach(_) => "foreach loop",
            ContinuationKind::Range(_) => "range loop",
            ContinuationKind::Loop(_) => "loop",
            ContinuationKind::Wait(_) => "wait statement",
        }
    }
}

/// A control flow construct owning one or more child blocks.
#[derive(Debug, Clone, PartialEq)]
pub struct Continuation {
    pub kind: ContinuationKind,
    /// The block this continuation lives in.
    pub parent: BlockId,
    pub children: Vec<BlockId>,
    /// Outer variables visible inside, for constructs that don't inherit their parent's scope.
    pub passed_vars: Vec<Var>,
    /// Outer variables written inside, kept open until the construct finishes.
    pub keep_open_vars: Vec<Var>,
}

/// The outcome of statically resolving a continuation.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicted {
    /// Exactly this child runs, once, with the given variables bound first.
    Block {
        block: BlockId,
        bindings: Vec<(Var, Arg)>,
    },
    /// No child ever runs.
    Nothing,
}

impl Predicted {
    fn block(block: BlockId) -> Self {
        Predicted::Block {
            block,
            bindings: vec![],
        }
    }
}

fn arg_vars<'a>(args: impl IntoIterator<Item = &'a Arg>) -> impl Iterator<Item = Var> {
    args.into_iter().filter_map(Arg::var).cloned()
}

/// Renames a list of variables. Variables replaced by a literal are dropped.
fn rename_var_list(vars: &mut Vec<Var>, renames: &Renames) {
    *vars = vars
        .iter()
        .filter_map(|v| match renames.get(v) {
            Some(Arg::Var(new)) => Some(new.clone()),
            Some(_) => None,
            None => Some(v.clone()),
        })
        .unique()
        .collect();
}

impl Continuation {
    pub fn new(kind: ContinuationKind, parent: BlockId) -> Self {
        Self {
            kind,
            parent,
            children: Vec::new(),
            passed_vars: Vec::new(),
            keep_open_vars: Vec::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// Variables the construct itself evaluates; they must never be removed.
    pub fn required_vars(&self) -> Vec<Var> {
        match &self.kind {
            ContinuationKind::Nested => vec![],
            ContinuationKind::If(stmt) => arg_vars([&stmt.cond]).collect(),
            ContinuationKind::Switch(stmt) => arg_vars([&stmt.value]).collect(),
            ContinuationKind::Foreach(lp) => vec![lp.array.clone()],
            ContinuationKind::Range(lp) => {
                arg_vars([&lp.start, &lp.end, &lp.increment]).collect()
            }
            ContinuationKind::Loop(lp) => lp
                .vars
                .iter()
                .map(|v| v.var.clone())
                .chain(arg_vars(lp.vars.iter().map(|v| &v.init)))
                .collect(),
            ContinuationKind::Wait(wait) => wait.wait_vars.clone(),
        }
    }

    /// Variables defined by the construct and visible inside its children.
    pub fn defined_vars(&self) -> Vec<Var> {
        match &self.kind {
            ContinuationKind::Foreach(lp) => std::iter::once(lp.member.clone())
                .chain(lp.counter.clone())
                .collect(),
            ContinuationKind::Range(lp) => std::iter::once(lp.var.clone())
                .chain(lp.counter.clone())
                .collect(),
            ContinuationKind::Loop(lp) => lp.vars.iter().map(|v| v.var.clone()).collect(),
            _ => vec![],
        }
    }

    /// Whether outer variables are visible inside without being passed in.
    pub fn inherits_parent_vars(&self) -> bool {
        matches!(
            self.kind,
            ContinuationKind::Nested | ContinuationKind::If(_) | ContinuationKind::Switch(_)
        )
    }

    /// Variables that must be closed before any child runs.
    pub fn blocking_vars(&self) -> Vec<Var> {
        match &self.kind {
            ContinuationKind::Wait(wait) => wait.wait_vars.clone(),
            ContinuationKind::Foreach(lp) => vec![lp.array.clone()],
            ContinuationKind::Loop(lp) => arg_vars(
                lp.vars
                    .iter()
                    .filter(|v| v.blocking)
                    .map(|v| &v.init),
            )
            .filter(|v| !v.is_value())
            .collect(),
            _ => vec![],
        }
    }

    /// Variables known to be closed inside the children.
    pub fn closed_in_children(&self) -> Vec<Var> {
        let mut closed = self.blocking_vars();
        match &self.kind {
            ContinuationKind::Range(lp) => {
                closed.push(lp.var.clone());
                closed.extend(lp.counter.clone());
            }
            ContinuationKind::Foreach(lp) => closed.extend(lp.counter.clone()),
            ContinuationKind::Loop(lp) => closed.extend(
                lp.vars
                    .iter()
                    .filter(|v| v.blocking || v.var.is_value())
                    .map(|v| v.var.clone()),
            ),
            _ => {}
        }
        closed
    }

    /// Applies a substitution to this construct's own fields. Children are left to the caller.
    ///
    /// Defined variables are only touched in [`RenameMode::All`].
    pub fn rename(&mut self, renames: &Renames, mode: RenameMode) {
        self.rename_inputs(renames);
        if mode == RenameMode::All {
            self.rename_defined(renames);
        }
    }

    /// Renames the places evaluated in the parent's scope.
    pub fn rename_inputs(&mut self, renames: &Renames) {
        match &mut self.kind {
            ContinuationKind::Nested => {}
            ContinuationKind::If(stmt) => rename_arg(&mut stmt.cond, renames, true),
            ContinuationKind::Switch(stmt) => rename_arg(&mut stmt.value, renames, true),
            ContinuationKind::Foreach(lp) => rename_var(&mut lp.array, renames),
            ContinuationKind::Range(lp) => {
                for arg in [&mut lp.start, &mut lp.end, &mut lp.increment] {
                    rename_arg(arg, renames, true);
                }
            }
            ContinuationKind::Loop(lp) => {
                for loop_var in &mut lp.vars {
                    rename_arg(&mut loop_var.init, renames, true);
                }
            }
            ContinuationKind::Wait(wait) => rename_var_list(&mut wait.wait_vars, renames),
        }
        rename_var_list(&mut self.passed_vars, renames);
        rename_var_list(&mut self.keep_open_vars, renames);
    }

    /// Renames the variables this construct defines for its children.
    pub fn rename_defined(&mut self, renames: &Renames) {
        match &mut self.kind {
            ContinuationKind::Foreach(ForeachLoop {
                member, counter, ..
            }) => {
                rename_var(member, renames);
                counter.iter_mut().for_each(|c| rename_var(c, renames));
            }
            ContinuationKind::Range(RangeLoop { var, counter, .. }) => {
                rename_var(var, renames);
                counter.iter_mut().for_each(|c| rename_var(c, renames));
            }
            ContinuationKind::Loop(lp) => {
                for loop_var in &mut lp.vars {
                    rename_var(&mut loop_var.var, renames);
                }
            }
            _ => {}
        }
    }

    /// Forgets removed variables. Removing a required variable is an internal error.
    pub fn remove_vars(&mut self, removed: &HashSet<Var>) -> Result<(), IrError> {
        if let Some(var) = self.required_vars().iter().find(|v| removed.contains(*v)) {
            return Err(IrError::RemovingRequiredVar {
                name: var.name.clone(),
                construct: self.name(),
            });
        }

        match &mut self.kind {
            ContinuationKind::Foreach(ForeachLoop { counter, .. })
            | ContinuationKind::Range(RangeLoop { counter, .. }) => {
                if counter.as_ref().is_some_and(|c| removed.contains(c)) {
                    *counter = None;
                }
            }
            _ => {}
        }
        self.passed_vars.retain(|v| !removed.contains(v));
        self.keep_open_vars.retain(|v| !removed.contains(v));
        Ok(())
    }

    /// Resolves which child will run, if that is statically known.
    pub fn branch_predict(&self, facts: &dyn Facts) -> Option<Predicted> {
        match &self.kind {
            ContinuationKind::Nested => Some(Predicted::block(*self.children.first()?)),
            ContinuationKind::If(stmt) => {
                let taken = match facts.literal(&stmt.cond)? {
                    Arg::Bool(b) => b,
                    Arg::Int(i) => i != 0,
                    _ => return None,
                };
                let index = if taken { 0 } else { 1 };
                Some(
                    self.children
                        .get(index)
                        .map(|b| Predicted::block(*b))
                        .unwrap_or(Predicted::Nothing),
                )
            }
            ContinuationKind::Switch(stmt) => {
                let value = facts.literal(&stmt.value)?.as_int()?;
                let index = match stmt.labels.iter().position(|l| *l == value) {
                    Some(index) => index,
                    None if stmt.has_default => stmt.labels.len(),
                    None => return Some(Predicted::Nothing),
                };
                Some(Predicted::block(*self.children.get(index)?))
            }
            ContinuationKind::Range(lp) => match lp.trip_count(facts)? {
                0 => Some(Predicted::Nothing),
                1 => {
                    let start = facts.literal(&lp.start)?;
                    let mut bindings = vec![(lp.var.clone(), start)];
                    bindings.extend(lp.counter.clone().map(|c| (c, Arg::Int(0))));
                    Some(Predicted::Block {
                        block: *self.children.first()?,
                        bindings,
                    })
                }
                _ => None,
            },
            ContinuationKind::Wait(wait) => wait
                .wait_vars
                .iter()
                .all(|v| v.is_value() || facts.is_closed(v))
                .then(|| self.children.first().map(|b| Predicted::block(*b)))
                .flatten(),
            ContinuationKind::Foreach(_) | ContinuationKind::Loop(_) => None,
        }
    }

    /// Whether the two constructs iterate over the same space and may share one body.
    pub fn fusable_with(&self, other: &Continuation) -> bool {
        match (&self.kind, &other.kind) {
            (ContinuationKind::Foreach(a), ContinuationKind::Foreach(b)) => {
                a.array == b.array
                    && a.sync == b.sync
                    && a.split_degree == b.split_degree
                    && a.counter.is_some() == b.counter.is_some()
            }
            (ContinuationKind::Range(a), ContinuationKind::Range(b)) => {
                a.start == b.start
                    && a.end == b.end
                    && a.increment == b.increment
                    && a.sync == b.sync
                    && a.split_degree == b.split_degree
                    && a.desired_unroll == b.desired_unroll
                    && a.counter.is_some() == b.counter.is_some()
            }
            _ => false,
        }
    }
}
