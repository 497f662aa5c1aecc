//! YAML config loading and saving
//!
//! Loading never fails: a missing or unreadable file yields the type's
//! default and a log line, so a broken config can't keep the engine from
//! starting. Saving reports errors through `anyhow`.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

/// Load a config from a YAML file, falling back to `T::default()`
pub fn load_config<T>(path: &Path) -> T
where
    T: DeserializeOwned + Default,
{
    if !path.exists() {
        log::info!("load_config: {:?} not found, using defaults", path);
        return T::default();
    }

    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            log::warn!("load_config: failed to read {:?}: {}, using defaults", path, e);
            return T::default();
        }
    };

    match serde_yaml::from_str::<T>(&contents) {
        Ok(config) => {
            log::info!("load_config: loaded {:?}", path);
            config
        }
        Err(e) => {
            log::warn!("load_config: failed to parse {:?}: {}, using defaults", path, e);
            T::default()
        }
    }
}

/// Save a config as YAML, creating parent directories as needed
pub fn save_config<T>(config: &T, path: &Path) -> Result<()>
where
    T: Serialize,
{
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
    }

    let yaml = serde_yaml::to_string(config).context("Failed to serialize config to YAML")?;
    std::fs::write(path, yaml).with_context(|| format!("Failed to write config file: {:?}", path))?;

    log::info!("save_config: wrote {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SamplerConfig;
    use crate::timestretch::StretchBackend;

    #[test]
    fn test_load_nonexistent_returns_default() {
        let config: SamplerConfig = load_config(Path::new("/nonexistent/tessera/sampler.yaml"));
        assert_eq!(config, SamplerConfig::default());
    }

    #[test]
    fn test_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sampler.yaml");

        let config = SamplerConfig {
            voices: 8,
            backend: StretchBackend::PhaseVocoder,
            time_warp: true,
            ..Default::default()
        };

        save_config(&config, &path).unwrap();
        let loaded: SamplerConfig = load_config(&path);
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_garbage_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sampler.yaml");
        std::fs::write(&path, "voices: [not, a, number").unwrap();

        let loaded: SamplerConfig = load_config(&path);
        assert_eq!(loaded, SamplerConfig::default());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sampler.yaml");
        std::fs::write(&path, "voices: 4\nbackend: granular\n").unwrap();

        let loaded: SamplerConfig = load_config(&path);
        assert_eq!(loaded.voices, 4);
        assert_eq!(loaded.backend, StretchBackend::Granular);
        assert_eq!(loaded.fade_in_samples, SamplerConfig::default().fade_in_samples);
    }
}
