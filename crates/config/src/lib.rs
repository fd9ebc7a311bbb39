//! # Config - engine tuning knobs
//!
//! All settings have defaults and can be overridden from the environment:
//!
//! ```text
//! RIPTIDE_MAX_LAST        last-run count that makes a partition a merge candidate (default: 4)
//! RIPTIDE_MAX_LAST_FILES  hard cap on last-runs per partition                     (default: 16)
//! RIPTIDE_BLOCK_ROWS      rows per block written by the merge                     (default: 4096)
//! ```

use thiserror::Error;

/// Default last-run count at which a partition is compacted.
pub const DEFAULT_MAX_LAST: usize = 4;

/// Default hard cap on the number of last-runs one partition may hold.
pub const DEFAULT_MAX_LAST_FILES: usize = 16;

/// Default number of rows per block emitted by the merge.
pub const DEFAULT_BLOCK_ROWS: usize = 4096;

/// Errors produced while loading or validating configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable held something that is not a number.
    #[error("{var}: cannot parse '{value}' as an unsigned integer")]
    Parse { var: &'static str, value: String },

    /// A value parsed fine but is outside the accepted range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Settings shared by the write path and the merge engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// A partition with at least this many last-runs is a merge candidate.
    pub max_last: usize,
    /// Writes that would push a partition above this many last-runs are rejected.
    pub max_last_files: usize,
    /// A merge output block is flushed once it holds this many rows.
    pub block_rows: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_last: DEFAULT_MAX_LAST,
            max_last_files: DEFAULT_MAX_LAST_FILES,
            block_rows: DEFAULT_BLOCK_ROWS,
        }
    }
}

impl EngineConfig {
    /// Builds a config from the `RIPTIDE_*` environment variables, falling
    /// back to defaults for unset ones.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup, so
    /// tests do not have to mutate the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let cfg = Self {
            max_last: parse_var(&lookup, "RIPTIDE_MAX_LAST", defaults.max_last)?,
            max_last_files: parse_var(
                &lookup,
                "RIPTIDE_MAX_LAST_FILES",
                defaults.max_last_files,
            )?,
            block_rows: parse_var(&lookup, "RIPTIDE_BLOCK_ROWS", defaults.block_rows)?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_last == 0 {
            return Err(ConfigError::Invalid("max_last must be at least 1".into()));
        }
        if self.max_last > self.max_last_files {
            return Err(ConfigError::Invalid(format!(
                "max_last ({}) exceeds max_last_files ({})",
                self.max_last, self.max_last_files
            )));
        }
        if self.block_rows == 0 {
            return Err(ConfigError::Invalid("block_rows must be at least 1".into()));
        }
        Ok(())
    }
}

fn parse_var<F>(lookup: &F, var: &'static str, default: usize) -> Result<usize, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Parse { var, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_when_nothing_set() {
        let cfg = EngineConfig::from_lookup(|_| None).unwrap();
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = EngineConfig::from_lookup(lookup_from(&[
            ("RIPTIDE_MAX_LAST", "2"),
            ("RIPTIDE_BLOCK_ROWS", " 128 "),
        ]))
        .unwrap();
        assert_eq!(cfg.max_last, 2);
        assert_eq!(cfg.block_rows, 128);
        assert_eq!(cfg.max_last_files, DEFAULT_MAX_LAST_FILES);
    }

    #[test]
    fn garbage_value_is_an_error() {
        let err = EngineConfig::from_lookup(lookup_from(&[("RIPTIDE_MAX_LAST", "four")]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::Parse {
                var: "RIPTIDE_MAX_LAST",
                value: "four".into()
            }
        );
    }

    #[test]
    fn threshold_above_cap_is_rejected() {
        let cfg = EngineConfig {
            max_last: 20,
            max_last_files: 16,
            block_rows: 1,
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn zero_block_rows_is_rejected() {
        let err = EngineConfig::from_lookup(lookup_from(&[("RIPTIDE_BLOCK_ROWS", "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
