//! Configuration loading for the command line.

use anyhow::{Context, Result};
use hostvirt_engine::EngineConfig;
use std::path::Path;
use tracing::{debug, info};

use crate::cli::Args;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/hostvirt/engine.yaml";

/// Load the engine configuration and apply CLI overrides.
///
/// An explicit `--config` must exist; the default location is optional.
pub fn load(args: &Args) -> Result<EngineConfig> {
    let config = match &args.config {
        Some(path) => {
            let config = EngineConfig::load(path).with_context(|| format!("Failed to load config {}", path))?;
            info!(config_path = %path, "Configuration loaded");
            config
        }
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            let config = EngineConfig::load(DEFAULT_CONFIG_PATH)
                .with_context(|| format!("Failed to load config {}", DEFAULT_CONFIG_PATH))?;
            info!(config_path = %DEFAULT_CONFIG_PATH, "Configuration loaded from default location");
            config
        }
        None => {
            debug!("No config file found, using defaults");
            EngineConfig::default()
        }
    };
    Ok(with_cli_overrides(config, args))
}

fn with_cli_overrides(mut config: EngineConfig, args: &Args) -> EngineConfig {
    if let Some(ref uri) = args.uri {
        config.uri = uri.clone();
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;

    #[test]
    fn test_explicit_config_with_uri_override() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "uri: qemu+ssh://root@kvm-01/system\nstorage:\n  default_pool:\n    name: vms\n    path: /srv/vms"
        )
        .unwrap();
        let path = file.path().to_string_lossy().to_string();

        let args = Args::try_parse_from(["hostvirt", "--config", path.as_str(), "pool", "list"]).unwrap();
        let config = load(&args).unwrap();
        assert_eq!(config.uri, "qemu+ssh://root@kvm-01/system");
        assert_eq!(config.storage.default_pool.name, "vms");

        let args = Args::try_parse_from([
            "hostvirt",
            "--config",
            path.as_str(),
            "--uri",
            "qemu:///session",
            "pool",
            "list",
        ])
        .unwrap();
        assert_eq!(load(&args).unwrap().uri, "qemu:///session");
    }

    #[test]
    fn test_missing_explicit_config_is_an_error() {
        let args = Args::try_parse_from(["hostvirt", "--config", "/nonexistent/engine.yaml", "pool", "list"]).unwrap();
        assert!(load(&args).is_err());
    }
}
