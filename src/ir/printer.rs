use std::fmt;

use itertools::Itertools;

use super::{
    Arg, IrError, Var,
    builder::{CodeGenerator, replay},
    continuation::{ForeachLoop, Loop, RangeLoop, WaitStatement},
    instruction::{Instruction, LoopBreak, LoopContinue},
    tree::{AppFunction, BuiltinFunction, Program},
};

/// A backend rendering the program as indented text, one construct per line.
#[derive(Debug, Default)]
pub struct Printer {
    out: String,
    indent: usize,
    /// Labels and whether a case block is open, per open switch.
    switches: Vec<(Vec<i64>, bool)>,
}

fn signature(vars: &[Var]) -> String {
    vars.iter().map(|v| format!("{} {v}", v.ty)).join(", ")
}

fn annotations(passed: &[Var], keep_open: &[Var]) -> String {
    let mut text = String::new();
    if !passed.is_empty() {
        text.push_str(&format!(" #passin[{}]", passed.iter().join(", ")));
    }
    if !keep_open.is_empty() {
        text.push_str(&format!(" #keepopen[{}]", keep_open.iter().join(", ")));
    }
    text
}

fn loop_flags(sync: bool, split_degree: u32) -> String {
    let sync = if sync { " #sync" } else { "" };
    format!("{sync} #split[{split_degree}]")
}

impl Printer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finish(self) -> String {
        self.out
    }

    fn line(&mut self, text: impl AsRef<str>) {
        for _ in 0..self.indent {
            self.out.push_str("  ");
        }
        self.out.push_str(text.as_ref());
        self.out.push('\n');
    }

    fn open(&mut self, text: impl AsRef<str>) -> Result<(), IrError> {
        self.line(format!("{} {{", text.as_ref()));
        self.indent += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(), IrError> {
        self.indent = self.indent.saturating_sub(1);
        self.line("}");
        Ok(())
    }
}

impl CodeGenerator for Printer {
    fn declare_builtin(&mut self, builtin: &BuiltinFunction) -> Result<(), IrError> {
        self.line(format!(
            "builtin {} = {} ({}) -> ({})",
            builtin.name,
            builtin.symbol,
            builtin.ty.inputs.iter().join(", "),
            builtin.ty.outputs.iter().join(", ")
        ));
        Ok(())
    }

    fn declare_app(&mut self, app: &AppFunction) -> Result<(), IrError> {
        self.line(format!(
            "app {}({}) -> ({})",
            app.name,
            signature(&app.inputs),
            signature(&app.outputs)
        ));
        Ok(())
    }

    fn add_global_const(&mut self, var: &Var, value: &Arg) -> Result<(), IrError> {
        self.line(format!("const {} {var} = {value}", var.ty));
        Ok(())
    }

    fn start_function(
        &mut self,
        name: &str,
        inputs: &[Var],
        outputs: &[Var],
    ) -> Result<(), IrError> {
        self.open(format!(
            "function {name}({}) -> ({})",
            signature(inputs),
            signature(outputs)
        ))
    }

    fn end_function(&mut self) -> Result<(), IrError> {
        self.close()
    }

    fn declare_variable(&mut self, var: &Var) -> Result<(), IrError> {
        self.line(format!("declare {} {var} #{}", var.ty, var.storage));
        Ok(())
    }

    fn close_on_exit(&mut self, array: &Var) -> Result<(), IrError> {
        self.line(format!("close_on_exit {array}"));
        Ok(())
    }

    fn instruction(&mut self, instruction: &Instruction) -> Result<(), IrError> {
        self.line(instruction.to_string());
        Ok(())
    }

    fn start_nested_block(&mut self) -> Result<(), IrError> {
        self.open("nested")
    }

    fn end_nested_block(&mut self) -> Result<(), IrError> {
        self.close()
    }

    fn start_if_statement(&mut self, cond: &Arg, _has_else: bool) -> Result<(), IrError> {
        self.open(format!("if ({cond})"))
    }

    fn start_else_block(&mut self) -> Result<(), IrError> {
        self.indent = self.indent.saturating_sub(1);
        self.open("} else")
    }

    fn end_if_statement(&mut self) -> Result<(), IrError> {
        self.close()
    }

    fn start_switch_statement(
        &mut self,
        value: &Arg,
        labels: &[i64],
        _has_default: bool,
    ) -> Result<(), IrError> {
        self.switches.push((labels.to_vec(), false));
        self.open(format!("switch ({value})"))
    }

    fn start_case(&mut self, index: usize) -> Result<(), IrError> {
        let (label, case_open) = match self.switches.last_mut() {
            Some((labels, open)) => (labels.get(index).copied(), std::mem::replace(open, true)),
            None => {
                return Err(IrError::UnbalancedNesting {
                    expected: "switch statement",
                    found: "case outside a switch".into(),
                });
            }
        };
        if case_open {
            self.close()?;
        }
        match label {
            Some(label) => self.open(format!("case {label}")),
            None => self.open("default"),
        }
    }

    fn end_switch_statement(&mut self) -> Result<(), IrError> {
        if let Some((_, true)) = self.switches.pop() {
            self.close()?;
        }
        self.close()
    }

    fn start_wait_statement(
        &mut self,
        wait: &WaitStatement,
        passed: &[Var],
        keep_open: &[Var],
    ) -> Result<(), IrError> {
        let explicit = if wait.explicit { " #explicit" } else { "" };
        self.open(format!(
            "wait {} ({}){explicit}{}",
            wait.name,
            wait.wait_vars.iter().join(", "),
            annotations(passed, keep_open)
        ))
    }

    fn end_wait_statement(&mut self) -> Result<(), IrError> {
        self.close()
    }

    fn start_foreach_loop(
        &mut self,
        lp: &ForeachLoop,
        passed: &[Var],
        keep_open: &[Var],
    ) -> Result<(), IrError> {
        let counter = lp
            .counter
            .as_ref()
            .map(|c| format!(", {c}"))
            .unwrap_or_default();
        self.open(format!(
            "foreach {} {}{counter} in {}{}{}",
            lp.name,
            lp.member,
            lp.array,
            loop_flags(lp.sync, lp.split_degree),
            annotations(passed, keep_open)
        ))
    }

    fn end_foreach_loop(&mut self) -> Result<(), IrError> {
        self.close()
    }

    fn start_range_loop(
        &mut self,
        lp: &RangeLoop,
        passed: &[Var],
        keep_open: &[Var],
    ) -> Result<(), IrError> {
        let counter = lp
            .counter
            .as_ref()
            .map(|c| format!(", {c}"))
            .unwrap_or_default();
        let unroll = if lp.desired_unroll > 1 {
            format!(" #unroll[{}]", lp.desired_unroll)
        } else {
            String::new()
        };
        self.open(format!(
            "range {} {}{counter} = {} to {} step {}{}{unroll}{}",
            lp.name,
            lp.var,
            lp.start,
            lp.end,
            lp.increment,
            loop_flags(lp.sync, lp.split_degree),
            annotations(passed, keep_open)
        ))
    }

    fn end_range_loop(&mut self) -> Result<(), IrError> {
        self.close()
    }

    fn start_loop(&mut self, lp: &Loop, passed: &[Var], keep_open: &[Var]) -> Result<(), IrError> {
        let vars = lp
            .vars
            .iter()
            .map(|v| {
                let blocking = if v.blocking { " #blocking" } else { "" };
                format!("{} {} = {}{blocking}", v.var.ty, v.var, v.init)
            })
            .join(", ");
        self.open(format!(
            "loop {} ({vars}){}",
            lp.name,
            annotations(passed, keep_open)
        ))
    }

    fn loop_continue(
        &mut self,
        new_vals: &[Arg],
        passed_vars: &[Var],
        blocking: &[bool],
    ) -> Result<(), IrError> {
        self.instruction(&Instruction::LoopContinue(LoopContinue {
            loop_id: None,
            new_vals: new_vals.to_vec(),
            passed_vars: passed_vars.to_vec(),
            blocking: blocking.to_vec(),
        }))
    }

    fn loop_break(&mut self, close_vars: &[Var]) -> Result<(), IrError> {
        self.instruction(&Instruction::LoopBreak(LoopBreak {
            loop_id: None,
            close_vars: close_vars.to_vec(),
        }))
    }

    fn end_loop(&mut self) -> Result<(), IrError> {
        self.close()
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut printer = Printer::new();
        replay(self, &mut printer).map_err(|_| fmt::Error)?;
        f.write_str(&printer.finish())
    }
}
