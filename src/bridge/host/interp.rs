//! Parser and interpreter for fused elementwise kernels.
//!
//! Accepts the OpenCL C subset the fused lowering emits:
//!
//! ```text
//! __kernel void NAME(__global int* data_array) {
//!   int x;                                  declaration
//!   int global_id = get_global_id(0);       index binding
//!   x = data_array[global_id];              load
//!   x = (x) + (1);                          assignment
//!   data_array[global_id] = x;              store
//! }
//! ```
//!
//! Assignment right-hand sides are integer expressions over declared
//! variables with `+ - * /`, unary `-`, `==` and parentheses.

use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::parsing::BinaryOp;

const DATA_ARRAY: &str = "data_array";
const INDEX_BINDING: &str = "int global_id = get_global_id(0)";
const ELEMENT: &str = "data_array[global_id]";

#[derive(Clone, Debug, PartialEq, Eq)]
enum HostExpr {
    Lit(i32),
    Var(usize),
    Neg(Box<HostExpr>),
    Bin(BinaryOp, Box<HostExpr>, Box<HostExpr>),
    Eq(Box<HostExpr>, Box<HostExpr>),
}

impl HostExpr {
    fn eval(&self, slots: &[i32]) -> Result<i32> {
        match self {
            HostExpr::Lit(v) => Ok(*v),
            HostExpr::Var(slot) => Ok(slots[*slot]),
            HostExpr::Neg(inner) => Ok(inner.eval(slots)?.wrapping_neg()),
            HostExpr::Bin(op, lhs, rhs) => op.apply(lhs.eval(slots)?, rhs.eval(slots)?),
            HostExpr::Eq(lhs, rhs) => Ok((lhs.eval(slots)? == rhs.eval(slots)?) as i32),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Step {
    Load(usize),
    Assign(usize, HostExpr),
    Store(usize),
}

/// A compiled fused kernel: one program run per element.
#[derive(Clone, Debug)]
pub(crate) struct FusedProgram {
    variables: Vec<String>,
    steps: Vec<Step>,
}

impl FusedProgram {
    /// Parse the kernel named `entry_point` out of `source`. Errors are
    /// compiler-style diagnostic text.
    pub(crate) fn parse(source: &str, entry_point: &str) -> std::result::Result<Self, String> {
        let body = kernel_body(source, entry_point)?;
        let mut program = FusedProgram {
            variables: Vec::new(),
            steps: Vec::new(),
        };
        let mut index_bound = false;

        for raw in body.split(';') {
            let stmt = raw.split_whitespace().collect::<Vec<_>>().join(" ");
            if stmt.is_empty() {
                continue;
            }
            if stmt == INDEX_BINDING {
                index_bound = true;
                continue;
            }
            if let Some((lhs, rhs)) = stmt.split_once(" = ") {
                if lhs == ELEMENT || rhs == ELEMENT {
                    if !index_bound {
                        return Err(format!("`global_id` used before declaration in `{}`", stmt));
                    }
                }
                if lhs == ELEMENT {
                    let slot = program.slot(rhs)?;
                    program.steps.push(Step::Store(slot));
                } else if rhs == ELEMENT {
                    let slot = program.slot(lhs)?;
                    program.steps.push(Step::Load(slot));
                } else {
                    let slot = program.slot(lhs)?;
                    let expr = ExprParser::new(rhs, &program.variables).parse()?;
                    program.steps.push(Step::Assign(slot, expr));
                }
                continue;
            }
            if let Some(name) = stmt.strip_prefix("int ") {
                if !is_identifier(name) {
                    return Err(format!("expected identifier in declaration `{}`", stmt));
                }
                if program.variables.iter().any(|v| v == name) {
                    return Err(format!("redefinition of `{}`", name));
                }
                program.variables.push(name.to_string());
                continue;
            }
            return Err(format!("unrecognised statement `{}`", stmt));
        }

        if !program.steps.iter().any(|s| matches!(s, Step::Store(_))) {
            return Err(format!("kernel `{}` never stores to `{}`", entry_point, DATA_ARRAY));
        }
        Ok(program)
    }

    fn slot(&self, name: &str) -> std::result::Result<usize, String> {
        self.variables
            .iter()
            .position(|v| v == name)
            .ok_or_else(|| format!("use of undeclared identifier `{}`", name))
    }

    fn run_element(&self, value: i32, slots: &mut [i32]) -> Result<i32> {
        slots.fill(0);
        let mut result = value;
        for step in &self.steps {
            match step {
                Step::Load(slot) => slots[*slot] = value,
                Step::Assign(slot, expr) => slots[*slot] = expr.eval(slots)?,
                Step::Store(slot) => result = slots[*slot],
            }
        }
        Ok(result)
    }

    /// Run the kernel over every element of `data`, in parallel.
    pub(crate) fn run(&self, data: &mut [i32]) -> Result<()> {
        let width = self.variables.len();
        data.par_iter_mut().try_for_each_init(
            || vec![0; width],
            |slots, element| {
                *element = self.run_element(*element, slots)?;
                Ok::<(), Error>(())
            },
        )
    }
}

/// Text between the braces of `__kernel void entry_point(...)`.
pub(crate) fn kernel_body<'a>(
    source: &'a str,
    entry_point: &str,
) -> std::result::Result<&'a str, String> {
    let header = format!("__kernel void {}(", entry_point);
    let start = source
        .find(&header)
        .ok_or_else(|| format!("no kernel named `{}` in source", entry_point))?;
    let open = source[start..]
        .find('{')
        .map(|i| start + i)
        .ok_or_else(|| format!("kernel `{}` has no body", entry_point))?;

    let mut depth = 0usize;
    for (i, c) in source[open..].char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Ok(&source[open + 1..open + i]);
                }
            }
            _ => {}
        }
    }
    Err(format!("unterminated body of kernel `{}`", entry_point))
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// ─── Expressions ───────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq)]
enum Token {
    Int(i64),
    Ident(String),
    Op(BinaryOp),
    EqEq,
    LParen,
    RParen,
}

fn tokenize(text: &str) -> std::result::Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::EqEq);
                i += 2;
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let digits: String = chars[start..i].iter().collect();
                let value = digits
                    .parse::<i64>()
                    .map_err(|_| format!("integer literal `{}` out of range", digits))?;
                tokens.push(Token::Int(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            c => match BinaryOp::from_symbol(&c.to_string()) {
                Some(op) => {
                    tokens.push(Token::Op(op));
                    i += 1;
                }
                None => return Err(format!("unexpected character `{}`", c)),
            },
        }
    }
    Ok(tokens)
}

/// Precedence climbing: `==` below `+ -` below `* /` below unary `-`.
struct ExprParser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    variables: &'a [String],
    text: &'a str,
}

impl<'a> ExprParser<'a> {
    fn new(text: &'a str, variables: &'a [String]) -> Self {
        Self {
            tokens: Vec::new(),
            pos: 0,
            variables,
            text,
        }
    }

    fn parse(mut self) -> std::result::Result<HostExpr, String> {
        self.tokens = tokenize(self.text)?;
        let expr = self.equality()?;
        if self.pos != self.tokens.len() {
            return Err(format!("unexpected trailing tokens in `{}`", self.text));
        }
        Ok(expr)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn equality(&mut self) -> std::result::Result<HostExpr, String> {
        let lhs = self.additive()?;
        if self.peek() == Some(&Token::EqEq) {
            self.pos += 1;
            let rhs = self.additive()?;
            return Ok(HostExpr::Eq(Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn additive(&mut self) -> std::result::Result<HostExpr, String> {
        let mut lhs = self.multiplicative()?;
        while let Some(Token::Op(op @ (BinaryOp::Add | BinaryOp::Sub))) = self.peek().cloned() {
            self.pos += 1;
            let rhs = self.multiplicative()?;
            lhs = HostExpr::Bin(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn multiplicative(&mut self) -> std::result::Result<HostExpr, String> {
        let mut lhs = self.unary()?;
        while let Some(Token::Op(op @ (BinaryOp::Mul | BinaryOp::Div))) = self.peek().cloned() {
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = HostExpr::Bin(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> std::result::Result<HostExpr, String> {
        if self.peek() == Some(&Token::Op(BinaryOp::Sub)) {
            self.pos += 1;
            // `-2147483648` is the one literal that only fits once negated.
            if let Some(Token::Int(v)) = self.peek().cloned() {
                if v == 1 << 31 {
                    self.pos += 1;
                    return Ok(HostExpr::Lit(i32::MIN));
                }
            }
            return Ok(HostExpr::Neg(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> std::result::Result<HostExpr, String> {
        let token = self
            .peek()
            .cloned()
            .ok_or_else(|| format!("unexpected end of expression `{}`", self.text))?;
        self.pos += 1;
        match token {
            Token::Int(v) => i32::try_from(v)
                .map(HostExpr::Lit)
                .map_err(|_| format!("integer literal `{}` out of range", v)),
            Token::Ident(name) => self
                .variables
                .iter()
                .position(|v| *v == name)
                .map(HostExpr::Var)
                .ok_or_else(|| format!("use of undeclared identifier `{}`", name)),
            Token::LParen => {
                let inner = self.equality()?;
                if self.peek() != Some(&Token::RParen) {
                    return Err(format!("expected `)` in `{}`", self.text));
                }
                self.pos += 1;
                Ok(inner)
            }
            other => Err(format!("unexpected token {:?} in `{}`", other, self.text)),
        }
    }
}
