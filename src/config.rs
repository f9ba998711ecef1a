// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::limits;
use ::std::{
    fs::File,
    io::Read,
};
use ::yaml_rust::{
    Yaml,
    YamlLoader,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Runtime configuration for the scheduler and its I/O-wait engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Capacity of the epoll event buffer used by each wait-loop pass.
    pub epoll_event_size: usize,
    /// Upper bound, in milliseconds, for the adaptive epoll wait time.
    pub max_sleep_ms: u64,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Config {
    /// Loads a configuration from a YAML file. Keys that are absent fall
    /// back to their built-in defaults.
    pub fn new(config_path: String) -> Self {
        let mut config_s: String = String::new();
        File::open(config_path)
            .expect("config file should exist")
            .read_to_string(&mut config_s)
            .expect("config file should be readable");
        let config = YamlLoader::load_from_str(&config_s).expect("config file should be well-formed YAML");
        let config_obj: &Yaml = match &config[..] {
            [c] => c,
            _ => panic!("config file should hold a single document"),
        };

        let mut options: Self = Self::default();
        if let Some(epoll_event_size) = config_obj["catwait"]["epoll_event_size"].as_i64() {
            options.epoll_event_size = epoll_event_size as usize;
        }
        if let Some(max_sleep_ms) = config_obj["catwait"]["max_sleep_ms"].as_i64() {
            options.max_sleep_ms = max_sleep_ms as u64;
        }
        options
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for Config {
    fn default() -> Self {
        Self {
            epoll_event_size: limits::EPOLL_EVENT_SIZE_DEFAULT,
            max_sleep_ms: limits::MAX_SLEEP_MS_DEFAULT,
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::Config;
    use crate::runtime::limits;
    use ::anyhow::Result;
    use ::std::io::Write;

    #[test]
    fn default_config_uses_built_in_limits() -> Result<()> {
        let config: Config = Config::default();
        crate::ensure_eq!(config.epoll_event_size, limits::EPOLL_EVENT_SIZE_DEFAULT);
        crate::ensure_eq!(config.max_sleep_ms, limits::MAX_SLEEP_MS_DEFAULT);
        Ok(())
    }

    #[test]
    fn yaml_config_overrides_defaults() -> Result<()> {
        let path: std::path::PathBuf = std::env::temp_dir().join("catwait-config-test.yaml");
        let mut file: std::fs::File = std::fs::File::create(&path)?;
        writeln!(file, "catwait:\n  epoll_event_size: 256\n  max_sleep_ms: 5")?;

        let config: Config = Config::new(path.to_string_lossy().to_string());
        crate::ensure_eq!(config.epoll_event_size, 256);
        crate::ensure_eq!(config.max_sleep_ms, 5);

        std::fs::remove_file(&path)?;
        Ok(())
    }
}
