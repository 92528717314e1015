use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

/// Engine settings. Every field has a default, so an empty document is valid.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Upper bound for a single remote call, in milliseconds.
    pub remote_timeout_ms: u64,
    /// Whether the device is assumed connected when the engine starts.
    pub start_online: bool,
    /// Queue entries failing this many times are logged at error level.
    pub max_attempts_logged: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { remote_timeout_ms: 10_000, start_online: true, max_attempts_logged: 5 }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    /// Parse and validate a YAML configuration document.
    ///
    /// # Errors
    /// Returns an error when the document is malformed, names an unknown field, or sets a
    /// zero timeout.
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config = if raw.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str::<Self>(raw).context("failed to parse engine config")?
        };
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns an error when the file cannot be read or fails [`EngineConfig::from_yaml_str`].
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config at {}", path.display()))?;
        Self::from_yaml_str(&raw)
    }

    fn validate(&self) -> Result<()> {
        if self.remote_timeout_ms == 0 {
            return Err(anyhow!("remote_timeout_ms MUST be greater than zero"));
        }
        if self.max_attempts_logged == 0 {
            return Err(anyhow!("max_attempts_logged MUST be greater than zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn empty_document_yields_defaults() -> Result<()> {
        assert_eq!(EngineConfig::from_yaml_str("")?, EngineConfig::default());
        Ok(())
    }

    #[test]
    fn partial_document_keeps_other_defaults() -> Result<()> {
        let config = EngineConfig::from_yaml_str("remote_timeout_ms: 250\nstart_online: false\n")?;
        assert_eq!(config.remote_timeout(), Duration::from_millis(250));
        assert!(!config.start_online);
        assert_eq!(config.max_attempts_logged, EngineConfig::default().max_attempts_logged);
        Ok(())
    }

    #[test]
    fn rejects_zero_timeout_and_unknown_fields() {
        assert!(EngineConfig::from_yaml_str("remote_timeout_ms: 0").is_err());
        assert!(EngineConfig::from_yaml_str("remote_timeout: 5").is_err());
    }

    #[test]
    fn loads_from_file() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "max_attempts_logged: 3")?;
        let config = EngineConfig::load(file.path())?;
        assert_eq!(config.max_attempts_logged, 3);
        Ok(())
    }
}
