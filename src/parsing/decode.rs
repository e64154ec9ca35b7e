//! Instruction decoder: raw instruction records → opcode vocabulary.

use std::fmt;

use super::expr::BinaryOp;
use super::trace::{
    ClosureTrace, Instruction, OPT_DIV, OPT_MINUS, OPT_MULT, OPT_PLUS, PUSH_OBJECT,
};
use crate::error::{Error, Result};

/// The opcodes the expression builder understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opcode {
    LoadParam,
    PushConst(i32),
    Add,
    Sub,
    Mul,
    Div,
}

impl Opcode {
    /// The binary operator this opcode applies, if any.
    pub fn binary_op(self) -> Option<BinaryOp> {
        match self {
            Opcode::Add => Some(BinaryOp::Add),
            Opcode::Sub => Some(BinaryOp::Sub),
            Opcode::Mul => Some(BinaryOp::Mul),
            Opcode::Div => Some(BinaryOp::Div),
            Opcode::LoadParam | Opcode::PushConst(_) => None,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Opcode::LoadParam => write!(f, "load_param"),
            Opcode::PushConst(v) => write!(f, "push {}", v),
            Opcode::Add => write!(f, "add"),
            Opcode::Sub => write!(f, "sub"),
            Opcode::Mul => write!(f, "mul"),
            Opcode::Div => write!(f, "div"),
        }
    }
}

/// Classify every instruction of `trace`.
///
/// Fails on the first instruction outside the vocabulary; no partial
/// result is returned.
pub fn decode(trace: &ClosureTrace) -> Result<Vec<Opcode>> {
    trace
        .instructions()
        .iter()
        .enumerate()
        .map(|(position, inst)| decode_one(inst, position))
        .collect()
}

fn decode_one(inst: &Instruction, position: usize) -> Result<Opcode> {
    let m = inst.mnemonic.as_str();
    let unsupported = || Error::UnsupportedInstruction {
        mnemonic: inst.to_string(),
        position,
    };

    if m.starts_with("getlocal") {
        return Ok(Opcode::LoadParam);
    }
    // Specialised literal encodings come before the generic push.
    if is_int2fix(m, '0') {
        return Ok(Opcode::PushConst(0));
    }
    if is_int2fix(m, '1') {
        return Ok(Opcode::PushConst(1));
    }
    if m == PUSH_OBJECT {
        return inst
            .operands
            .first()
            .and_then(|operand| operand.parse::<i32>().ok())
            .map(Opcode::PushConst)
            .ok_or_else(unsupported);
    }

    match m {
        OPT_PLUS => Ok(Opcode::Add),
        OPT_MINUS => Ok(Opcode::Sub),
        OPT_MULT => Ok(Opcode::Mul),
        OPT_DIV => Ok(Opcode::Div),
        _ => Err(unsupported()),
    }
}

/// Matches both `putobject_INT2FIX_0_` and the older
/// `putobject_OP_INT2FIX_O_0_C_` spelling.
fn is_int2fix(mnemonic: &str, digit: char) -> bool {
    let modern = format!("putobject_INT2FIX_{}_", digit);
    let legacy = format!("putobject_OP_INT2FIX_O_{}_C_", digit);
    mnemonic == modern || mnemonic == legacy
}
