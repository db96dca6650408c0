//! Configuration loading

use crate::{Config, ConfigFormat};
use regex::Regex;
use sicky_core::{Error, Result};
use std::env;
use std::fs;
use std::path::Path;

/// Load configuration from a file
pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();

    let content = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read config file: {e}")))?;

    let format = ConfigFormat::from_path(path)?;

    load_from_str(&content, format)
}

/// Expand environment variables in configuration string
/// Supports syntax: ${VAR} and ${VAR:-default}
fn expand_env_vars(content: &str) -> Result<String> {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(:-([^}]*))?\}")
        .map_err(|e| Error::Config(format!("Invalid regex: {e}")))?;

    let mut result = String::with_capacity(content.len());
    let mut last_match = 0;

    for cap in re.captures_iter(content) {
        let (Some(full_match), Some(var_name)) = (cap.get(0), cap.get(1)) else {
            continue;
        };
        let var_name = var_name.as_str();
        let default_value = cap.get(3).map(|m| m.as_str());

        let value = match (env::var(var_name), default_value) {
            (Ok(val), _) => val,
            (Err(_), Some(default)) => default.to_string(),
            (Err(_), None) => {
                return Err(Error::Config(format!(
                    "Environment variable '{var_name}' not set and no default provided"
                )));
            }
        };

        result.push_str(&content[last_match..full_match.start()]);
        result.push_str(&value);
        last_match = full_match.end();
    }

    result.push_str(&content[last_match..]);

    Ok(result)
}

/// Load configuration from a string
pub fn load_from_str(content: &str, format: ConfigFormat) -> Result<Config> {
    let expanded_content = expand_env_vars(content)?;

    let config = match format {
        ConfigFormat::Yaml => serde_yaml::from_str(&expanded_content)
            .map_err(|e| Error::Config(format!("Failed to parse YAML: {e}")))?,
        ConfigFormat::Toml => toml::from_str(&expanded_content)
            .map_err(|e| Error::Config(format!("Failed to parse TOML: {e}")))?,
        ConfigFormat::Json => serde_json::from_str(&expanded_content)
            .map_err(|e| Error::Config(format!("Failed to parse JSON: {e}")))?,
    };

    Ok(config)
}

/// Load and validate configuration
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let config = load_from_file(path)?;

    crate::validator::validate_config(&config)?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    const SAMPLE_YAML: &str = r#"
registries:
  consul:
    address: "http://consul.internal:8500"
    wait_time: "30s"
  mdns: {}
reconcile:
  interval_secs: 10
services:
  - name: orders
    kind: grpc
advertise:
  service: orders
  address: "10.0.0.1"
  servers:
    - kind: grpc
      port: 9000
"#;

    #[test]
    fn test_load_yaml() {
        let config = load_from_str(SAMPLE_YAML, ConfigFormat::Yaml).unwrap();

        let consul = config.registries.consul.unwrap();
        assert_eq!(consul.address, "http://consul.internal:8500");
        assert_eq!(consul.wait_time, Duration::from_secs(30));
        assert_eq!(consul.retry_interval, Duration::from_secs(5));

        let mdns = config.registries.mdns.unwrap();
        assert_eq!(mdns.domain, "local.");
        assert_eq!(mdns.protocols.len(), 4);

        assert!(config.registries.redis.is_none());
        assert_eq!(config.reconcile.interval_secs, 10);
        assert_eq!(config.services[0].name, "orders");

        let advertise = config.advertise.unwrap();
        assert_eq!(advertise.network, "tcp");
        assert_eq!(advertise.servers[0].port, 9000);
    }

    #[test]
    fn test_load_toml() {
        let content = r#"
[reconcile]
interval_secs = 0

[registries.redis]
address = "redis.internal:6379"
db = 3
ttl = "1m"

[[services]]
name = "billing"
"#;
        let config = load_from_str(content, ConfigFormat::Toml).unwrap();
        let redis = config.registries.redis.unwrap();
        assert_eq!(redis.db, 3);
        assert_eq!(redis.ttl, Some(Duration::from_secs(60)));
        assert_eq!(redis.notify_key, "sicky:notify");
        assert_eq!(config.reconcile.interval_secs, 0);
    }

    #[test]
    fn test_load_json_defaults() {
        let config = load_from_str("{}", ConfigFormat::Json).unwrap();
        assert_eq!(config.registries.enabled_count(), 0);
        assert_eq!(config.reconcile.interval_secs, 30);
        assert_eq!(config.observability.log_level, "info");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(SAMPLE_YAML.as_bytes()).unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.services.len(), 1);
    }

    #[test]
    fn test_env_var_with_default() {
        env::remove_var("SICKY_UNDEFINED_CONSUL");

        let content = r#"
registries:
  consul:
    address: "${SICKY_UNDEFINED_CONSUL:-http://127.0.0.1:8500}"
"#;
        let config = load_from_str(content, ConfigFormat::Yaml).unwrap();
        assert_eq!(
            config.registries.consul.unwrap().address,
            "http://127.0.0.1:8500"
        );
    }

    #[test]
    fn test_env_var_override() {
        env::set_var("SICKY_TEST_REDIS", "10.1.1.1:6380");

        let content = r#"
registries:
  redis:
    address: "${SICKY_TEST_REDIS:-127.0.0.1:6379}"
"#;
        let config = load_from_str(content, ConfigFormat::Yaml).unwrap();
        assert_eq!(config.registries.redis.unwrap().address, "10.1.1.1:6380");

        env::remove_var("SICKY_TEST_REDIS");
    }

    #[test]
    fn test_missing_env_var_no_default() {
        env::remove_var("SICKY_MISSING_VAR");

        let result = load_from_str("advertise: ${SICKY_MISSING_VAR}", ConfigFormat::Yaml);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("SICKY_MISSING_VAR"));
    }

    #[test]
    fn test_multiple_env_vars() {
        env::set_var("SICKY_HOST", "localhost");
        env::set_var("SICKY_PORT", "8500");

        let expanded = expand_env_vars("http://${SICKY_HOST}:${SICKY_PORT}/v1").unwrap();
        assert_eq!(expanded, "http://localhost:8500/v1");

        env::remove_var("SICKY_HOST");
        env::remove_var("SICKY_PORT");
    }
}
