//! Closure translation: instruction trace → opcodes → infix expression.
//!
//! ```text
//! ClosureTrace ─decode→ Vec<Opcode> ─build→ Expression ─render→ "(x) + (1)"
//! ```
//!
//! The translator accepts a flat arithmetic subset only: one implicit
//! parameter, integer literals, and `+ - * /`. Anything else is rejected
//! before a task is touched.

pub mod decode;
pub mod expr;
pub mod trace;

pub use decode::{decode, Opcode};
pub use expr::{build, BinaryOp, Expression, PARAMETER};
pub use trace::{ClosureTrace, Instruction, Traced};

use crate::error::Result;

/// Decode and reduce a trace in one step.
pub fn translate(trace: &ClosureTrace) -> Result<Expression> {
    let ops = decode(trace)?;
    build(&ops)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translate_recorded_closure() {
        let trace = ClosureTrace::record(|x| (x + 1) * 2);
        let expr = translate(&trace).unwrap();
        insta::assert_snapshot!(expr.to_string(), @"((x) + (1)) * (2)");
    }

    #[test]
    fn test_translate_rejects_unknown() {
        let trace = ClosureTrace::from_disassembly("0000 getlocal_WC_0 x@0\n0002 opt_ltlt\n");
        assert!(translate(&trace).is_err());
    }
}
