//! Named datasets and named operations.
//!
//! Both registries are plain lookup tables owned by the caller and passed
//! to the device operations that need them.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::parsing::{translate, BinaryOp, ClosureTrace, Expression, Traced};

/// Name → initial host array, resolved before `load`.
#[derive(Clone, Debug, Default)]
pub struct DataSetRegistry {
    sets: BTreeMap<String, Vec<i32>>,
}

impl DataSetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dataset, replacing any previous one of the same name.
    pub fn register(&mut self, name: impl Into<String>, data: Vec<i32>) -> &mut Self {
        let name = name.into();
        tracing::debug!(dataset = %name, len = data.len(), "dataset registered");
        self.sets.insert(name, data);
        self
    }

    pub fn get(&self, name: &str) -> Result<&[i32]> {
        self.sets
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::UnknownDataSet(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.sets.keys().map(String::as_str)
    }
}

/// Name → translated expression, for maps requested by name.
#[derive(Clone, Debug, Default)]
pub struct OperationRegistry {
    operations: BTreeMap<String, Expression>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry preloaded with common elementwise operations.
    pub fn with_builtins() -> Self {
        use BinaryOp::*;
        use Expression::{Literal, Param};

        let mut registry = Self::new();
        registry
            .register("increment", Expression::binary(Add, Param, Literal(1)))
            .register("decrement", Expression::binary(Sub, Param, Literal(1)))
            .register("double", Expression::binary(Mul, Param, Literal(2)))
            .register("halve", Expression::binary(Div, Param, Literal(2)))
            .register("square", Expression::binary(Mul, Param, Param))
            .register("negate", Expression::binary(Sub, Literal(0), Param));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, expr: Expression) -> &mut Self {
        let name = name.into();
        tracing::debug!(operation = %name, expression = %expr, "operation registered");
        self.operations.insert(name, expr);
        self
    }

    /// Register a closure by recording and translating it.
    pub fn register_fn<F>(&mut self, name: impl Into<String>, f: F) -> Result<&mut Self>
    where
        F: FnOnce(Traced) -> Traced,
    {
        let expr = translate(&ClosureTrace::record(f))?;
        Ok(self.register(name, expr))
    }

    /// Register an operation from instruction-sequence disassembly.
    pub fn register_disassembly(&mut self, name: impl Into<String>, listing: &str) -> Result<&mut Self> {
        let expr = translate(&ClosureTrace::from_disassembly(listing))?;
        Ok(self.register(name, expr))
    }

    pub fn get(&self, name: &str) -> Result<&Expression> {
        self.operations
            .get(name)
            .ok_or_else(|| Error::UnknownOperation(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.operations.keys().map(String::as_str)
    }
}
