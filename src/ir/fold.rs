use std::fmt;

use super::{Arg, IrError, PrimType};

/// Operators with a local (immediate) implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BuiltinOp {
    PlusInt,
    MinusInt,
    MultInt,
    DivInt,
    ModInt,
    NegateInt,
    AbsInt,
    MaxInt,
    MinInt,
    PowInt,
    PlusFloat,
    MinusFloat,
    MultFloat,
    DivFloat,
    NegateFloat,
    AbsFloat,
    MaxFloat,
    MinFloat,
    PowFloat,
    Floor,
    Ceil,
    Round,
    Sqrt,
    Exp,
    Log,
    EqInt,
    NeqInt,
    LtInt,
    LteInt,
    GtInt,
    GteInt,
    EqFloat,
    NeqFloat,
    LtFloat,
    LteFloat,
    GtFloat,
    GteFloat,
    EqString,
    NeqString,
    EqBool,
    NeqBool,
    And,
    Or,
    Xor,
    Not,
    StrCat,
    IntToStr,
    FloatToStr,
    ParseInt,
    ParseFloat,
    IntToFloat,
    FloatToInt,
    Copy,
    Assert,
    AssertEq,
    Trace,
}

impl BuiltinOp {
    pub fn name(self) -> &'static str {
        use BuiltinOp::*;
        match self {
            PlusInt => "plus_int",
            MinusInt => "minus_int",
            MultInt => "mult_int",
            DivInt => "div_int",
            ModInt => "mod_int",
            NegateInt => "negate_int",
            AbsInt => "abs_int",
            MaxInt => "max_int",
            MinInt => "min_int",
            PowInt => "pow_int",
            PlusFloat => "plus_float",
            MinusFloat => "minus_float",
            MultFloat => "mult_float",
            DivFloat => "div_float",
            NegateFloat => "negate_float",
            AbsFloat => "abs_float",
            MaxFloat => "max_float",
            MinFloat => "min_float",
            PowFloat => "pow_float",
            Floor => "floor",
            Ceil => "ceil",
            Round => "round",
            Sqrt => "sqrt",
            Exp => "exp",
            Log => "log",
            EqInt => "eq_int",
            NeqInt => "neq_int",
            LtInt => "lt_int",
            LteInt => "lte_int",
            GtInt => "gt_int",
            GteInt => "gte_int",
            EqFloat => "eq_float",
            NeqFloat => "neq_float",
            LtFloat => "lt_float",
            LteFloat => "lte_float",
            GtFloat => "gt_float",
            GteFloat => "gte_float",
            EqString => "eq_string",
            NeqString => "neq_string",
            EqBool => "eq_bool",
            NeqBool => "neq_bool",
            And => "and",
            Or => "or",
            Xor => "xor",
            Not => "not",
            StrCat => "strcat",
            IntToStr => "int_to_str",
            FloatToStr => "float_to_str",
            ParseInt => "parse_int",
            ParseFloat => "parse_float",
            IntToFloat => "int_to_float",
            FloatToInt => "float_to_int",
            Copy => "copy",
            Assert => "assert",
            AssertEq => "assert_eq",
            Trace => "trace",
        }
    }

    pub fn has_side_effects(self) -> bool {
        matches!(self, BuiltinOp::Assert | BuiltinOp::AssertEq | BuiltinOp::Trace)
    }

    /// Whether the operator produces an output.
    pub fn has_output(self) -> bool {
        !self.has_side_effects()
    }

    pub fn is_commutative(self) -> bool {
        use BuiltinOp::*;
        matches!(
            self,
            PlusInt
                | MultInt
                | MaxInt
                | MinInt
                | PlusFloat
                | MultFloat
                | MaxFloat
                | MinFloat
                | EqInt
                | NeqInt
                | EqFloat
                | NeqFloat
                | EqString
                | NeqString
                | EqBool
                | NeqBool
                | And
                | Or
                | Xor
        )
    }

    /// Number of operands, `None` when variadic.
    pub fn arity(self) -> Option<usize> {
        use BuiltinOp::*;
        match self {
            StrCat | Trace => None,
            NegateInt | AbsInt | NegateFloat | AbsFloat | Floor | Ceil | Round | Sqrt | Exp
            | Log | Not | IntToStr | FloatToStr | ParseInt | ParseFloat | IntToFloat
            | FloatToInt | Copy => Some(1),
            AssertEq => Some(3),
            _ => Some(2),
        }
    }

    /// The literal type expected at an operand position, `None` for any type.
    pub fn operand_type(self, index: usize) -> Option<PrimType> {
        use BuiltinOp::*;
        match self {
            PlusInt | MinusInt | MultInt | DivInt | ModInt | NegateInt | AbsInt | MaxInt
            | MinInt | PowInt | EqInt | NeqInt | LtInt | LteInt | GtInt | GteInt | IntToStr
            | IntToFloat => Some(PrimType::Int),
            PlusFloat | MinusFloat | MultFloat | DivFloat | NegateFloat | AbsFloat | MaxFloat
            | MinFloat | PowFloat | Floor | Ceil | Round | Sqrt | Exp | Log | EqFloat
            | NeqFloat | LtFloat | LteFloat | GtFloat | GteFloat | FloatToStr | FloatToInt => {
                Some(PrimType::Float)
            }
            EqString | NeqString | StrCat | ParseInt | ParseFloat => Some(PrimType::String),
            EqBool | NeqBool | And | Or | Xor | Not => Some(PrimType::Bool),
            Assert if index == 0 => Some(PrimType::Bool),
            Assert => Some(PrimType::String),
            AssertEq if index == 2 => Some(PrimType::String),
            AssertEq | Copy | Trace => None,
        }
    }

    /// Checks operand count and the type of every literal operand.
    pub fn check_operands(self, args: &[Option<Arg>]) -> Result<(), IrError> {
        if let Some(expected) = self.arity() {
            if args.len() != expected {
                return Err(IrError::OperandCount {
                    op: self.name(),
                    expected,
                    found: args.len(),
                });
            }
        }

        for (index, arg) in args.iter().enumerate() {
            let (Some(found), Some(expected)) = (
                arg.as_ref().and_then(Arg::literal_type),
                self.operand_type(index),
            ) else {
                continue;
            };
            if found != expected {
                return Err(IrError::LiteralTypeMismatch {
                    op: self.name(),
                    index,
                    found: arg.as_ref().map(ToString::to_string).unwrap_or_default(),
                });
            }
        }

        Ok(())
    }
}

impl fmt::Display for BuiltinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Formats a float the way the target runtime prints it.
pub fn format_float(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }

    let text = format!("{value:?}");
    match text.split_once('e') {
        Some((mantissa, exp)) if !exp.starts_with('-') => format!("{mantissa}e+{exp}"),
        _ => text,
    }
}

/// Evaluates an operator over operands that are known literals (`Some`) or unknown (`None`).
///
/// Returns `Ok(None)` when the result can't be decided at compile time: an operand is
/// unknown, the operator has side effects, or the runtime would raise an error.
pub fn evaluate(op: BuiltinOp, args: &[Option<Arg>]) -> Result<Option<Arg>, IrError> {
    op.check_operands(args)?;

    if op.has_side_effects() {
        return Ok(None);
    }

    match op {
        BuiltinOp::And if args.iter().any(|a| matches!(a, Some(Arg::Bool(false)))) => {
            return Ok(Some(Arg::Bool(false)));
        }
        BuiltinOp::Or if args.iter().any(|a| matches!(a, Some(Arg::Bool(true)))) => {
            return Ok(Some(Arg::Bool(true)));
        }
        _ => {}
    }

    let Some(known) = args
        .iter()
        .map(|a| a.as_ref().filter(|a| a.is_literal()).cloned())
        .collect::<Option<Vec<_>>>()
    else {
        return Ok(None);
    };

    Ok(evaluate_known(op, &known))
}

fn finite(value: f64) -> Option<Arg> {
    value.is_finite().then(|| Arg::float(value))
}

fn evaluate_known(op: BuiltinOp, args: &[Arg]) -> Option<Arg> {
    use BuiltinOp::*;

    let int = |i: usize| args[i].as_int();
    let float = |i: usize| args[i].as_float();
    let boolean = |i: usize| args[i].as_bool();
    let string = |i: usize| args[i].as_str();

    let result = match op {
        PlusInt => Arg::Int(int(0)?.wrapping_add(int(1)?)),
        MinusInt => Arg::Int(int(0)?.wrapping_sub(int(1)?)),
        MultInt => Arg::Int(int(0)?.wrapping_mul(int(1)?)),
        DivInt => {
            let divisor = int(1)?;
            if divisor == 0 {
                return None;
            }
            Arg::Int(int(0)?.wrapping_div(divisor))
        }
        ModInt => {
            let divisor = int(1)?;
            if divisor == 0 {
                return None;
            }
            Arg::Int(int(0)?.wrapping_rem(divisor))
        }
        NegateInt => Arg::Int(int(0)?.wrapping_neg()),
        AbsInt => Arg::Int(int(0)?.wrapping_abs()),
        MaxInt => Arg::Int(int(0)?.max(int(1)?)),
        MinInt => Arg::Int(int(0)?.min(int(1)?)),
        PowInt => return finite((int(0)? as f64).powf(int(1)? as f64)),
        PlusFloat => return finite(float(0)? + float(1)?),
        MinusFloat => return finite(float(0)? - float(1)?),
        MultFloat => return finite(float(0)? * float(1)?),
        DivFloat => {
            let divisor = float(1)?;
            if divisor == 0.0 {
                return None;
            }
            return finite(float(0)? / divisor);
        }
        NegateFloat => Arg::float(-float(0)?),
        AbsFloat => Arg::float(float(0)?.abs()),
        MaxFloat | MinFloat => {
            let (a, b) = (float(0)?, float(1)?);
            if a.is_nan() || b.is_nan() {
                return None;
            }
            Arg::float(if op == MaxFloat { a.max(b) } else { a.min(b) })
        }
        PowFloat => return finite(float(0)?.powf(float(1)?)),
        Floor => Arg::float(float(0)?.floor()),
        Ceil => Arg::float(float(0)?.ceil()),
        Round => Arg::float(float(0)?.round()),
        Sqrt => return finite(float(0)?.sqrt()),
        Exp => return finite(float(0)?.exp()),
        Log => return finite(float(0)?.ln()),
        EqInt => Arg::Bool(int(0)? == int(1)?),
        NeqInt => Arg::Bool(int(0)? != int(1)?),
        LtInt => Arg::Bool(int(0)? < int(1)?),
        LteInt => Arg::Bool(int(0)? <= int(1)?),
        GtInt => Arg::Bool(int(0)? > int(1)?),
        GteInt => Arg::Bool(int(0)? >= int(1)?),
        EqFloat => Arg::Bool(float(0)? == float(1)?),
        NeqFloat => Arg::Bool(float(0)? != float(1)?),
        LtFloat => Arg::Bool(float(0)? < float(1)?),
        LteFloat => Arg::Bool(float(0)? <= float(1)?),
        GtFloat => Arg::Bool(float(0)? > float(1)?),
        GteFloat => Arg::Bool(float(0)? >= float(1)?),
        EqString => Arg::Bool(string(0)? == string(1)?),
        NeqString => Arg::Bool(string(0)? != string(1)?),
        EqBool => Arg::Bool(boolean(0)? == boolean(1)?),
        NeqBool => Arg::Bool(boolean(0)? != boolean(1)?),
        And => Arg::Bool(boolean(0)? && boolean(1)?),
        Or => Arg::Bool(boolean(0)? || boolean(1)?),
        Xor => Arg::Bool(boolean(0)? ^ boolean(1)?),
        Not => Arg::Bool(!boolean(0)?),
        StrCat => {
            let mut out = String::new();
            for arg in args {
                out.push_str(arg.as_str()?);
            }
            Arg::Str(out)
        }
        IntToStr => Arg::Str(int(0)?.to_string()),
        FloatToStr => Arg::Str(format_float(float(0)?)),
        ParseInt => Arg::Int(string(0)?.parse().ok()?),
        ParseFloat => return finite(string(0)?.parse().ok()?),
        IntToFloat => Arg::float(int(0)? as f64),
        FloatToInt => {
            let value = float(0)?.trunc();
            if !value.is_finite() || value < i64::MIN as f64 || value >= i64::MAX as f64 {
                return None;
            }
            Arg::Int(value as i64)
        }
        Copy => args[0].clone(),
        Assert | AssertEq | Trace => return None,
    };

    Some(result)
}

/// The message of an assertion that is statically known to fail at runtime.
pub fn assertion_failure(op: BuiltinOp, args: &[Option<Arg>]) -> Option<String> {
    match (op, args) {
        (BuiltinOp::Assert, [Some(Arg::Bool(false)), message]) => Some(
            message
                .as_ref()
                .and_then(|m| m.as_str().map(str::to_string))
                .unwrap_or_else(|| "assertion failed".to_string()),
        ),
        (BuiltinOp::AssertEq, [Some(a), Some(b), message])
            if a.is_literal() && b.is_literal() && a != b =>
        {
            let message = message
                .as_ref()
                .and_then(|m| m.as_str())
                .unwrap_or("assertEqual failed");
            Some(format!("{message}: {a} != {b}"))
        }
        _ => None,
    }
}
