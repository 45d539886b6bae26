//! # Environment Configuration
//!
//! Settings every burrow tool shares, read from the environment so a user can
//! set them once per shell:
//!
//! | variable | meaning | default |
//! |---|---|---|
//! | `BURROW_OFFSETS` | version table file | none |
//! | `BURROW_TARGET` | process name or pid to attach to | none |
//! | `BURROW_MAX_CSTRING` | cap for C string reads, in bytes | 4096 |
//!
//! Empty values count as unset. Command-line flags are layered on top by the
//! tool itself.

use std::env;
use std::path::PathBuf;

/// Environment variable naming the version table file
pub const OFFSETS_VAR: &str = "BURROW_OFFSETS";

/// Environment variable naming the default target
pub const TARGET_VAR: &str = "BURROW_TARGET";

/// Environment variable capping C string reads
pub const MAX_CSTRING_VAR: &str = "BURROW_MAX_CSTRING";

/// Default cap for C string reads
pub const DEFAULT_MAX_CSTRING: usize = 4096;

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError
{
    /// A variable holds something unusable
    #[error("Invalid value for {name}: '{value}' ({reason})")]
    InvalidValue
    {
        /// Variable name
        name: &'static str,
        /// The offending value
        value: String,
        /// What is wrong with it
        reason: String,
    },
}

/// Shared tool settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolkitConfig
{
    /// Version table to identify targets with
    pub offsets: Option<PathBuf>,
    /// Default target selector
    pub target: Option<String>,
    /// Longest C string a tool reads
    pub max_cstring: usize,
}

impl Default for ToolkitConfig
{
    fn default() -> Self
    {
        Self {
            offsets: None,
            target: None,
            max_cstring: DEFAULT_MAX_CSTRING,
        }
    }
}

impl ToolkitConfig
{
    /// Read the process environment.
    ///
    /// ## Errors
    ///
    /// `InvalidValue` if `BURROW_MAX_CSTRING` is not a positive integer.
    pub fn from_env() -> Result<Self, ConfigError>
    {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Read settings through `lookup` instead of the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError>
    {
        let get = |name: &str| lookup(name).map(|value| value.trim().to_string()).filter(|value| !value.is_empty());

        let max_cstring = match get(MAX_CSTRING_VAR) {
            None => DEFAULT_MAX_CSTRING,
            Some(value) => match value.parse::<usize>() {
                Ok(0) => {
                    return Err(ConfigError::InvalidValue {
                        name: MAX_CSTRING_VAR,
                        value,
                        reason: "must be greater than zero".to_string(),
                    });
                }
                Ok(max) => max,
                Err(e) => {
                    return Err(ConfigError::InvalidValue {
                        name: MAX_CSTRING_VAR,
                        value,
                        reason: e.to_string(),
                    });
                }
            },
        };

        Ok(Self {
            offsets: get(OFFSETS_VAR).map(PathBuf::from),
            target: get(TARGET_VAR),
            max_cstring,
        })
    }
}

#[cfg(test)]
mod tests
{
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String>
    {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults()
    {
        let config = ToolkitConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, ToolkitConfig::default());
        assert_eq!(config.max_cstring, 4096);
    }

    #[test]
    fn test_values_are_read()
    {
        let config = ToolkitConfig::from_lookup(lookup(&[
            (OFFSETS_VAR, "/etc/burrow/symbols.toml"),
            (TARGET_VAR, " Dwarf_Fortress "),
            (MAX_CSTRING_VAR, "256"),
        ]))
        .unwrap();
        assert_eq!(config.offsets, Some(PathBuf::from("/etc/burrow/symbols.toml")));
        assert_eq!(config.target.as_deref(), Some("Dwarf_Fortress"));
        assert_eq!(config.max_cstring, 256);
    }

    #[test]
    fn test_empty_values_are_unset()
    {
        let config = ToolkitConfig::from_lookup(lookup(&[(TARGET_VAR, ""), (MAX_CSTRING_VAR, "  ")])).unwrap();
        assert_eq!(config.target, None);
        assert_eq!(config.max_cstring, DEFAULT_MAX_CSTRING);
    }

    #[test]
    fn test_bad_cap_is_rejected()
    {
        for bad in ["0", "-1", "lots"] {
            let err = ToolkitConfig::from_lookup(lookup(&[(MAX_CSTRING_VAR, bad)])).unwrap_err();
            assert!(matches!(err, ConfigError::InvalidValue { name: MAX_CSTRING_VAR, .. }));
        }
    }
}
