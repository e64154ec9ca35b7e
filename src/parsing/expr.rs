//! Expression builder: stack-machine reduction of an opcode stream.

use std::fmt;

use super::decode::Opcode;
use crate::error::{Error, Result};

/// Name of the implicit closure parameter inside kernel bodies.
pub const PARAMETER: &str = "x";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
        }
    }

    pub fn from_symbol(s: &str) -> Option<Self> {
        match s {
            "+" => Some(BinaryOp::Add),
            "-" => Some(BinaryOp::Sub),
            "*" => Some(BinaryOp::Mul),
            "/" => Some(BinaryOp::Div),
            _ => None,
        }
    }

    /// Neutral element used to pad and seed scans.
    pub fn identity(self) -> i32 {
        match self {
            BinaryOp::Add | BinaryOp::Sub => 0,
            BinaryOp::Mul | BinaryOp::Div => 1,
        }
    }

    /// Whether regrouping `a op b op c` keeps the result. Only these
    /// operators can be scanned or reduced as a parallel tree.
    pub fn is_associative(self) -> bool {
        matches!(self, BinaryOp::Add | BinaryOp::Mul)
    }

    /// Apply with 32-bit wrapping semantics; division by zero is a fault.
    pub fn apply(self, a: i32, b: i32) -> Result<i32> {
        match self {
            BinaryOp::Add => Ok(a.wrapping_add(b)),
            BinaryOp::Sub => Ok(a.wrapping_sub(b)),
            BinaryOp::Mul => Ok(a.wrapping_mul(b)),
            BinaryOp::Div => {
                if b == 0 {
                    Err(Error::execution("integer division by zero"))
                } else {
                    Ok(a.wrapping_div(b))
                }
            }
        }
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Infix arithmetic over the implicit parameter and integer literals.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Expression {
    Param,
    Literal(i32),
    Binary {
        op: BinaryOp,
        lhs: Box<Expression>,
        rhs: Box<Expression>,
    },
}

impl Expression {
    pub fn binary(op: BinaryOp, lhs: Expression, rhs: Expression) -> Self {
        Expression::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    /// Evaluate on the host for parameter value `x`.
    pub fn eval(&self, x: i32) -> Result<i32> {
        match self {
            Expression::Param => Ok(x),
            Expression::Literal(v) => Ok(*v),
            Expression::Binary { op, lhs, rhs } => op.apply(lhs.eval(x)?, rhs.eval(x)?),
        }
    }

    /// True if the expression reads the parameter anywhere.
    pub fn uses_param(&self) -> bool {
        match self {
            Expression::Param => true,
            Expression::Literal(_) => false,
            Expression::Binary { lhs, rhs, .. } => lhs.uses_param() || rhs.uses_param(),
        }
    }
}

/// Every binary operand is parenthesised, so no precedence table is needed.
impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Param => f.write_str(PARAMETER),
            Expression::Literal(v) => write!(f, "{}", v),
            Expression::Binary { op, lhs, rhs } => write!(f, "({}) {} ({})", lhs, op, rhs),
        }
    }
}

/// Reduce a post-order opcode stream to one expression.
///
/// Operands push; a binary opcode pops `b` then `a` and pushes `(a) op (b)`.
pub fn build(ops: &[Opcode]) -> Result<Expression> {
    let mut stack: Vec<Expression> = Vec::with_capacity(ops.len());

    for (i, op) in ops.iter().enumerate() {
        match *op {
            Opcode::LoadParam => stack.push(Expression::Param),
            Opcode::PushConst(v) => stack.push(Expression::Literal(v)),
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div => {
                let (Some(b), Some(a)) = (stack.pop(), stack.pop()) else {
                    return Err(Error::MalformedExpression(format!(
                        "`{}` at position {} needs two operands",
                        op, i
                    )));
                };
                let bin = op.binary_op().ok_or_else(|| {
                    Error::MalformedExpression(format!("`{}` is not a binary operator", op))
                })?;
                stack.push(Expression::binary(bin, a, b));
            }
        }
    }

    match stack.len() {
        1 => stack
            .pop()
            .ok_or_else(|| Error::MalformedExpression("empty stack".to_string())),
        n => Err(Error::MalformedExpression(format!(
            "expected exactly one value after reduction, found {}",
            n
        ))),
    }
}
