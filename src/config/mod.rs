//! Runtime configuration: feature flags and scan defaults.
//!
//! Read from a small TOML file:
//!
//! ```toml
//! [features]
//! avoid_bank_conflicts = true
//!
//! [scan]
//! banks = 32
//! work_group_size = 128
//! ```

use std::path::Path;

use crate::error::{Error, Result};
use crate::kir;

/// Largest work-group size the scan kernels are laid out for.
pub const MAX_WORK_GROUP_SIZE: u32 = 256;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Config {
    pub features: Features,
    pub scan: ScanDefaults,
}

/// Global feature switches.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Features {
    /// Gate for the scan kernels' conflict-free bank addressing. When off,
    /// no scan eliminates bank conflicts whatever it requests.
    pub avoid_bank_conflicts: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanDefaults {
    /// Shared-memory bank count; a power of two.
    pub bank_count: u32,
    /// Threads per work group; each group scans twice as many elements.
    pub work_group_size: u32,
}

impl Default for ScanDefaults {
    fn default() -> Self {
        Self {
            bank_count: 32,
            work_group_size: 128,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Config> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read '{}': {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    /// Section-aware minimal TOML parsing. Unknown sections and keys are
    /// ignored; known keys with bad values are errors.
    pub fn parse(content: &str) -> Result<Config> {
        let mut config = Config::default();
        let mut current_section = String::new();

        for (lineno, line) in content.lines().enumerate() {
            let trimmed = strip_comment(line).trim();
            if trimmed.is_empty() {
                continue;
            }
            if trimmed.starts_with('[') && trimmed.ends_with(']') {
                current_section = trimmed[1..trimmed.len() - 1].trim().to_string();
                continue;
            }
            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(Error::Config(format!(
                    "line {}: expected `key = value`",
                    lineno + 1
                )));
            };
            let key = key.trim().trim_matches('"');
            let value = value.trim();

            match (current_section.as_str(), key) {
                ("features", "avoid_bank_conflicts") => {
                    config.features.avoid_bank_conflicts = parse_bool(key, value)?;
                }
                ("scan", "banks") | ("scan", "bank_count") => {
                    config.scan.bank_count = parse_u32(key, value)?;
                }
                ("scan", "work_group_size") => {
                    config.scan.work_group_size = parse_u32(key, value)?;
                }
                _ => {}
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.scan.bank_count.is_power_of_two() {
            return Err(Error::Config(format!(
                "bank count {} is not a power of two",
                self.scan.bank_count
            )));
        }
        let wg = self.scan.work_group_size;
        if !wg.is_power_of_two() || wg > MAX_WORK_GROUP_SIZE {
            return Err(Error::Config(format!(
                "work group size {} must be a power of two no larger than {}",
                wg, MAX_WORK_GROUP_SIZE
            )));
        }
        if self.features.avoid_bank_conflicts {
            kir::check_local_layout(wg, self.scan.bank_count.trailing_zeros(), true)?;
        }
        Ok(())
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(pos) => &line[..pos],
        None => line,
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(Error::Config(format!(
            "`{}` expects true or false, got `{}`",
            key, value
        ))),
    }
}

fn parse_u32(key: &str, value: &str) -> Result<u32> {
    value
        .replace('_', "")
        .parse::<u32>()
        .map_err(|_| Error::Config(format!("`{}` expects an integer, got `{}`", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(!config.features.avoid_bank_conflicts);
        assert_eq!(config.scan.bank_count, 32);
        assert_eq!(config.scan.work_group_size, 128);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_sections() {
        let config = Config::parse(
            r#"
# device tuning
[features]
avoid_bank_conflicts = true   # gate

[scan]
banks = 16
work_group_size = 64

[unrelated]
banks = 3
"#,
        )
        .unwrap();
        assert!(config.features.avoid_bank_conflicts);
        assert_eq!(config.scan.bank_count, 16);
        assert_eq!(config.scan.work_group_size, 64);
    }

    #[test]
    fn test_parse_rejects_bad_values() {
        assert!(Config::parse("[features]\navoid_bank_conflicts = yes\n").is_err());
        assert!(Config::parse("[scan]\nbanks = twelve\n").is_err());
        assert!(Config::parse("[scan]\nbanks = 12\n").is_err());
        assert!(Config::parse("[scan]\nwork_group_size = 512\n").is_err());
        assert!(Config::parse("[scan]\nwork_group_size = 0\n").is_err());
        assert!(Config::parse("[scan]\njust a line\n").is_err());
    }

    #[test]
    fn test_parse_rejects_folding_bank_layout() {
        let few_banks = "[scan]\nbanks = 1\nwork_group_size = 128\n";
        assert!(Config::parse(few_banks).is_ok());

        let err =
            Config::parse(&format!("[features]\navoid_bank_conflicts = true\n{few_banks}"))
                .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("1 banks"));

        let fits = "[features]\navoid_bank_conflicts = true\n\
                    [scan]\nbanks = 1\nwork_group_size = 16\n";
        assert!(Config::parse(fits).is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hadope.toml");
        fs::write(&path, "[scan]\nwork_group_size = 32\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.scan.work_group_size, 32);
        assert_eq!(config.scan.bank_count, 32);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
