// Copyright 2025 STARGA Inc.
// Licensed under the Apache License, Version 2.0 (the “License”);
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at:
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an “AS IS” BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Part of the MIND project (Machine Intelligence Native Design).

//! Engine settings, read from the `[engine]` table of a TOML file.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse engine configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid engine configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Run the to-be-recorded analysis; when off every overwrite is taped.
    pub enable_tbr: bool,
    /// Per-block iteration cap of the analysis.
    pub max_tbr_passes: usize,
    pub verbose: bool,
    /// Emit the all-parameter overload for partial vector/reverse requests.
    pub emit_overloads: bool,
    /// Emit smart-tape checkpoints around writes to caller memory.
    pub smart_tape: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enable_tbr: true,
            max_tbr_passes: 64,
            verbose: false,
            emit_overloads: true,
            smart_tape: true,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    engine: EngineConfig,
}

impl EngineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(content)?;
        if file.engine.max_tbr_passes == 0 {
            return Err(ConfigError::Invalid("max_tbr_passes must be at least 1".into()));
        }
        Ok(file.engine)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        #[derive(Serialize)]
        struct Out<'a> {
            engine: &'a EngineConfig,
        }
        toml::to_string_pretty(&Out { engine: self })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let cfg = EngineConfig::from_toml_str("[engine]\nverbose = true\n").unwrap();
        assert!(cfg.verbose);
        assert!(cfg.enable_tbr);
        assert_eq!(cfg.max_tbr_passes, 64);
        assert_eq!(EngineConfig::from_toml_str("").unwrap(), EngineConfig::default());
    }

    #[test]
    fn rejects_zero_pass_cap() {
        let err = EngineConfig::from_toml_str("[engine]\nmax_tbr_passes = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn round_trips_through_toml() {
        let cfg = EngineConfig {
            smart_tape: false,
            ..EngineConfig::default()
        };
        let text = cfg.to_toml().unwrap();
        assert_eq!(EngineConfig::from_toml_str(&text).unwrap(), cfg);
    }
}
