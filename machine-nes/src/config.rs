//! Runner configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Settings read from `config.json`, overridable from the command line.
/// Changing the CPU implementation takes effect on the next start.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Selected CPU implementation: `interpret`, `amd64`, `dynarec` or
    /// `lua`.
    pub cpu: String,
    /// Frames to run in headless mode.
    pub frames: u32,
}

impl Default for Configuration {
    fn default() -> Self {
        // The interpreter is guaranteed to exist on every host.
        Self { cpu: "interpret".to_string(), frames: 60 }
    }
}

impl Configuration {
    /// Loads the configuration; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, String> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(path)
            .map_err(|error| format!("Failed to read {}: {error}", path.display()))?;

        serde_json::from_str(&text)
            .map_err(|error| format!("Failed to parse {}: {error}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_missing() {
        let config = Configuration::load(Path::new("/nonexistent/config.json")).unwrap();
        assert_eq!(config.cpu, "interpret");
        assert_eq!(config.frames, 60);
    }

    #[test]
    fn partial_files_fall_back_to_defaults() {
        let config: Configuration = serde_json::from_str(r#"{ "cpu": "lua" }"#).unwrap();
        assert_eq!(config.cpu, "lua");
        assert_eq!(config.frames, 60);
    }
}
