//! Configuration of the scan / reduction kernel family.

use std::fmt;

use crate::config::{Config, Features};
use crate::error::{Error, Result};
use crate::kir::{self, ElementType};
use crate::parsing::BinaryOp;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScanStyle {
    /// `out[i] = in[0] op ... op in[i]`
    Inclusive,
    /// `out[i] = in[0] op ... op in[i-1]`, `out[0] = 0`
    Exclusive,
}

impl ScanStyle {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "inclusive" => Some(ScanStyle::Inclusive),
            "exclusive" => Some(ScanStyle::Exclusive),
            _ => None,
        }
    }
}

impl fmt::Display for ScanStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanStyle::Inclusive => f.write_str("inclusive"),
            ScanStyle::Exclusive => f.write_str("exclusive"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ScanConfig {
    pub style: ScanStyle,
    pub element_type: ElementType,
    pub operator: BinaryOp,
    pub bank_count: u32,
    pub eliminate_bank_conflicts: bool,
}

impl ScanConfig {
    pub fn new(style: ScanStyle, operator: BinaryOp) -> Self {
        Self {
            style,
            element_type: ElementType::Int,
            operator,
            bank_count: 32,
            eliminate_bank_conflicts: false,
        }
    }

    /// Scan using the configured bank count, eliminating bank conflicts
    /// whenever the global feature flag allows it.
    pub fn from_config(style: ScanStyle, operator: BinaryOp, config: &Config) -> Self {
        Self {
            bank_count: config.scan.bank_count,
            ..Self::new(style, operator)
        }
        .eliminate_bank_conflicts(true, &config.features)
    }

    pub fn with_bank_count(mut self, bank_count: u32) -> Result<Self> {
        if !bank_count.is_power_of_two() {
            return Err(Error::Config(format!(
                "bank count {} is not a power of two",
                bank_count
            )));
        }
        self.bank_count = bank_count;
        Ok(self)
    }

    /// Request conflict-free addressing; only honoured when the feature
    /// flag is on.
    pub fn eliminate_bank_conflicts(mut self, requested: bool, features: &Features) -> Self {
        self.eliminate_bank_conflicts = requested && features.avoid_bank_conflicts;
        self
    }

    /// Fails when the bank-offset macro would fold two local indices of a
    /// `group_size`-thread group onto one shared-memory slot.
    pub fn check_local_layout(&self, group_size: u32) -> Result<()> {
        kir::check_local_layout(
            group_size,
            self.log2_bank_count(),
            self.eliminate_bank_conflicts,
        )
    }

    pub fn log2_bank_count(&self) -> u32 {
        self.bank_count.trailing_zeros()
    }

    pub fn descriptor(&self) -> String {
        format!(
            "{} {} scan over {} (banks={}, eliminate_conflicts={})",
            self.style,
            self.operator,
            self.element_type,
            self.bank_count,
            self.eliminate_bank_conflicts
        )
    }
}
