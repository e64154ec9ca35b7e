//! Instruction traces of host closures.
//!
//! A trace is the linear, post-order instruction sequence of a one-argument
//! closure. Traces come from two places:
//!
//! - `from_disassembly` reads instruction-sequence disassembly text
//!   (`0002 putobject 1`, `0004 opt_plus <calldata...>`), keeping local
//!   loads, object pushes and `opt_*` instructions.
//! - `record` runs a Rust closure over a [`Traced`] parameter whose
//!   operator overloads append the same instructions the disassembler
//!   would print.

use std::fmt;
use std::ops::{Add, Div, Mul, Sub};

use crate::span::Span;

pub(crate) const LOAD_PARAM: &str = "getlocal_WC_0";
pub(crate) const PUSH_OBJECT: &str = "putobject";
pub(crate) const PUSH_ZERO: &str = "putobject_INT2FIX_0_";
pub(crate) const PUSH_ONE: &str = "putobject_INT2FIX_1_";
pub(crate) const OPT_PLUS: &str = "opt_plus";
pub(crate) const OPT_MINUS: &str = "opt_minus";
pub(crate) const OPT_MULT: &str = "opt_mult";
pub(crate) const OPT_DIV: &str = "opt_div";

/// One raw instruction record: mnemonic plus operand text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instruction {
    pub mnemonic: String,
    pub operands: Vec<String>,
    /// Location in the disassembly text, when read from one.
    pub span: Option<Span>,
}

impl Instruction {
    pub fn new(mnemonic: &str, operands: &[&str]) -> Self {
        Self {
            mnemonic: mnemonic.to_string(),
            operands: operands.iter().map(|s| s.to_string()).collect(),
            span: None,
        }
    }

    fn push_int(value: i32) -> Self {
        match value {
            0 => Instruction::new(PUSH_ZERO, &[]),
            1 => Instruction::new(PUSH_ONE, &[]),
            v => Instruction::new(PUSH_OBJECT, &[&v.to_string()]),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mnemonic)?;
        for op in &self.operands {
            write!(f, " {}", op)?;
        }
        Ok(())
    }
}

/// Ordered instruction sequence of one closure.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClosureTrace {
    instructions: Vec<Instruction>,
}

impl ClosureTrace {
    pub fn new(instructions: Vec<Instruction>) -> Self {
        Self { instructions }
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Record the trace of `f` applied to the implicit parameter.
    pub fn record<F>(f: F) -> Self
    where
        F: FnOnce(Traced) -> Traced,
    {
        let result = f(Traced::param());
        Self {
            instructions: result.instructions,
        }
    }

    /// Extract the arithmetic-relevant instructions from disassembly text.
    ///
    /// Each listing line may start with a numeric offset; the next token is
    /// the mnemonic, and operands run until the trailing `(line)` marker.
    /// Header, local-table and control lines (`leave`, `nop`, ...) are
    /// skipped.
    pub fn from_disassembly(source: &str) -> Self {
        let mut instructions = Vec::new();
        let mut line_start = 0usize;

        for line in source.split_inclusive('\n') {
            let offset = line_start;
            line_start += line.len();

            let content = line.trim_end();
            let body = content.trim_start();
            let Some(body) = strip_offset(body) else {
                continue;
            };

            let mut tokens = body.split_whitespace();
            let Some(mnemonic) = tokens.next() else {
                continue;
            };
            if !is_arithmetic_candidate(mnemonic) {
                continue;
            }

            let operands: Vec<String> = tokens
                .take_while(|tok| !tok.starts_with('('))
                .map(|tok| tok.to_string())
                .collect();

            let start = offset + (content.len() - body.len());
            let end = offset + content.len();
            instructions.push(Instruction {
                mnemonic: mnemonic.to_string(),
                operands,
                span: Some(Span::new(start as u32, end as u32)),
            });
        }

        Self { instructions }
    }
}

/// Strip a leading `0004` style offset column. Returns `None` for lines
/// that carry no instruction at all.
fn strip_offset(line: &str) -> Option<&str> {
    let digits = line.bytes().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 {
        return if line.is_empty() { None } else { Some(line) };
    }
    let rest = &line[digits..];
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let rest = rest.trim_start();
    if rest.is_empty() {
        None
    } else {
        Some(rest)
    }
}

fn is_arithmetic_candidate(mnemonic: &str) -> bool {
    mnemonic.starts_with("getlocal")
        || mnemonic.starts_with(PUSH_OBJECT)
        || mnemonic.starts_with("opt_")
}

// ─── Recording ─────────────────────────────────────────────────────

/// A value inside a recorded closure: the post-order instructions that
/// compute it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Traced {
    instructions: Vec<Instruction>,
}

impl Traced {
    fn param() -> Self {
        Self {
            instructions: vec![Instruction::new(LOAD_PARAM, &["x@0"])],
        }
    }

    fn combine(mut self, rhs: Traced, mnemonic: &str) -> Self {
        self.instructions.extend(rhs.instructions);
        self.instructions.push(Instruction::new(mnemonic, &[]));
        self
    }
}

impl From<i32> for Traced {
    fn from(value: i32) -> Self {
        Self {
            instructions: vec![Instruction::push_int(value)],
        }
    }
}

macro_rules! traced_binop {
    ($trait:ident, $method:ident, $mnemonic:expr) => {
        impl<R: Into<Traced>> $trait<R> for Traced {
            type Output = Traced;

            fn $method(self, rhs: R) -> Traced {
                self.combine(rhs.into(), $mnemonic)
            }
        }

        impl $trait<Traced> for i32 {
            type Output = Traced;

            fn $method(self, rhs: Traced) -> Traced {
                Traced::from(self).combine(rhs, $mnemonic)
            }
        }
    };
}

traced_binop!(Add, add, OPT_PLUS);
traced_binop!(Sub, sub, OPT_MINUS);
traced_binop!(Mul, mul, OPT_MULT);
traced_binop!(Div, div, OPT_DIV);
