//! Deterministic primitives: arithmetic, comparison, logic and arrays.

use std::fmt;
use std::sync::Arc;

use rand::RngCore;

use crate::engine::errors::ExecError;
use crate::engine::procedure::{Args, Procedure, Psp, SimpleSp};
use crate::engine::value::Value;

type Op = fn(&[Value]) -> Result<Value, ExecError>;

/// A pure function of its operand values.
pub struct DeterministicPsp {
    name: &'static str,
    min_args: usize,
    max_args: usize,
    op: Op,
}

impl DeterministicPsp {
    pub fn new(name: &'static str, min_args: usize, max_args: usize, op: Op) -> Self {
        Self {
            name,
            min_args,
            max_args,
            op,
        }
    }
}

impl fmt::Debug for DeterministicPsp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeterministicPsp({})", self.name)
    }
}

impl Psp for DeterministicPsp {
    fn simulate(&self, args: &Args, _rng: &mut dyn RngCore) -> Result<Value, ExecError> {
        args.check_arity(self.name, self.min_args, self.max_args)?;
        (self.op)(&args.operands)
    }
}

fn numbers(name: &str, values: &[Value]) -> Result<Vec<f64>, ExecError> {
    values.iter().map(|v| v.expect_number(name)).collect()
}

fn add(values: &[Value]) -> Result<Value, ExecError> {
    Ok(Value::Number(numbers("+", values)?.iter().sum()))
}

fn sub(values: &[Value]) -> Result<Value, ExecError> {
    match numbers("-", values)?.as_slice() {
        [x] => Ok(Value::Number(-x)),
        [x, y] => Ok(Value::Number(x - y)),
        _ => Err(ExecError::Evaluation("- expects one or two arguments".into())),
    }
}

fn mul(values: &[Value]) -> Result<Value, ExecError> {
    Ok(Value::Number(numbers("*", values)?.iter().product()))
}

fn div(values: &[Value]) -> Result<Value, ExecError> {
    match numbers("/", values)?.as_slice() {
        [_, y] if *y == 0.0 => Err(ExecError::Evaluation("division by zero".into())),
        [x, y] => Ok(Value::Number(x / y)),
        _ => Err(ExecError::Evaluation("/ expects two arguments".into())),
    }
}

fn compare(name: &str, values: &[Value], cmp: fn(f64, f64) -> bool) -> Result<Value, ExecError> {
    let xs = numbers(name, values)?;
    Ok(Value::Bool(xs.windows(2).all(|w| cmp(w[0], w[1]))))
}

fn eq(values: &[Value]) -> Result<Value, ExecError> {
    Ok(Value::Bool(values.windows(2).all(|w| w[0] == w[1])))
}

fn lt(values: &[Value]) -> Result<Value, ExecError> {
    compare("<", values, |a, b| a < b)
}

fn gt(values: &[Value]) -> Result<Value, ExecError> {
    compare(">", values, |a, b| a > b)
}

fn lte(values: &[Value]) -> Result<Value, ExecError> {
    compare("<=", values, |a, b| a <= b)
}

fn gte(values: &[Value]) -> Result<Value, ExecError> {
    compare(">=", values, |a, b| a >= b)
}

fn not(values: &[Value]) -> Result<Value, ExecError> {
    Ok(Value::Bool(!values[0].is_truthy()))
}

fn array(values: &[Value]) -> Result<Value, ExecError> {
    Ok(Value::Array(values.to_vec().into()))
}

fn exp(values: &[Value]) -> Result<Value, ExecError> {
    Ok(Value::Number(values[0].expect_number("exp")?.exp()))
}

fn log(values: &[Value]) -> Result<Value, ExecError> {
    let x = values[0].expect_number("log")?;
    if x < 0.0 {
        return Err(ExecError::Evaluation(format!("log of negative number {}", x)));
    }
    Ok(Value::Number(x.ln()))
}

fn sqrt(values: &[Value]) -> Result<Value, ExecError> {
    let x = values[0].expect_number("sqrt")?;
    if x < 0.0 {
        return Err(ExecError::Evaluation(format!("sqrt of negative number {}", x)));
    }
    Ok(Value::Number(x.sqrt()))
}

pub(super) fn procedures() -> Vec<(&'static str, Arc<dyn Procedure>)> {
    let table: [(&'static str, usize, usize, Op); 14] = [
        ("+", 0, usize::MAX, add),
        ("-", 1, 2, sub),
        ("*", 0, usize::MAX, mul),
        ("/", 2, 2, div),
        ("=", 2, usize::MAX, eq),
        ("<", 2, usize::MAX, lt),
        (">", 2, usize::MAX, gt),
        ("<=", 2, usize::MAX, lte),
        (">=", 2, usize::MAX, gte),
        ("not", 1, 1, not),
        ("array", 0, usize::MAX, array),
        ("exp", 1, 1, exp),
        ("log", 1, 1, log),
        ("sqrt", 1, 1, sqrt),
    ];
    table
        .into_iter()
        .map(|(name, min, max, op)| {
            let psp = Arc::new(DeterministicPsp::new(name, min, max, op));
            let sp: Arc<dyn Procedure> = Arc::new(SimpleSp::output_only(name, psp));
            (name, sp)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic_folds_over_operands() {
        let xs = [Value::Number(2.0), Value::Number(3.0), Value::Number(4.0)];
        assert_eq!(add(&xs).unwrap(), Value::Number(9.0));
        assert_eq!(mul(&xs).unwrap(), Value::Number(24.0));
        assert_eq!(sub(&xs[..1]).unwrap(), Value::Number(-2.0));
        assert_eq!(lt(&xs).unwrap(), Value::Bool(true));
        assert_eq!(gt(&xs).unwrap(), Value::Bool(false));
    }

    #[test]
    fn invalid_arithmetic_is_an_evaluation_error() {
        let zero = [Value::Number(1.0), Value::Number(0.0)];
        assert!(matches!(div(&zero), Err(ExecError::Evaluation(_))));
        assert!(matches!(
            add(&[Value::symbol("a")]),
            Err(ExecError::Evaluation(_))
        ));
        assert!(matches!(log(&[Value::Number(-1.0)]), Err(ExecError::Evaluation(_))));
    }
}
