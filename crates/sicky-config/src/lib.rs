//! Configuration for a sicky process.
//!
//! One document describes which registry backends to connect (`consul`,
//! `mdns`, `redis`), the services this process cares about, the reconcile
//! interval and, optionally, the instance it advertises about itself.
//! YAML, TOML and JSON are accepted; `${VAR}` and `${VAR:-default}` are
//! expanded before parsing and the result is validated.

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod builder;
pub mod loader;
pub mod types;
pub mod validator;

pub use builder::ConfigBuilder;
pub use loader::{load_config, load_from_file, load_from_str};
pub use types::{
    AdvertiseConfig, Config, ConsulConfig, MdnsConfig, ObservabilityConfig, ReconcileConfig,
    RedisConfig, RegistriesConfig, ServerConfig, ServiceConfig, TopicConfig,
};
pub use validator::validate_config;

use sicky_core::{Error, Result};
use std::path::Path;

/// Syntax of a configuration document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// `.yaml` / `.yml`
    Yaml,
    /// `.toml`
    Toml,
    /// `.json`
    Json,
}

impl ConfigFormat {
    /// Pick the format from a file extension, ignoring case
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .map(str::to_ascii_lowercase)
            .ok_or_else(|| {
                Error::Config(format!("{} has no extension to detect its format", path.display()))
            })?;

        match ext.as_str() {
            "yaml" | "yml" => Ok(Self::Yaml),
            "toml" => Ok(Self::Toml),
            "json" => Ok(Self::Json),
            other => Err(Error::Config(format!(
                "Unsupported config format '.{other}' (expected yaml, yml, toml or json)"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_extension() {
        let cases = [
            ("sicky.yml", ConfigFormat::Yaml),
            ("/etc/sicky/config.YAML", ConfigFormat::Yaml),
            ("sicky.toml", ConfigFormat::Toml),
            ("sicky.Json", ConfigFormat::Json),
        ];
        for (path, format) in cases {
            assert_eq!(ConfigFormat::from_path(Path::new(path)).unwrap(), format, "{path}");
        }
    }

    #[test]
    fn test_unsupported_format() {
        let err = ConfigFormat::from_path(Path::new("sicky.ini")).unwrap_err();
        assert!(err.to_string().contains(".ini"));
        assert!(ConfigFormat::from_path(Path::new("sicky")).is_err());
    }
}
