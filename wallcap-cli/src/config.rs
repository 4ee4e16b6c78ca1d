//! Wall configuration file.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use wallcap_ipc::{ContentFilter, EngineConfig, SessionConfig, StreamParameters};

/// Engine tuning plus the tiles of the wall.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WallConfig {
    pub engine: EngineConfig,
    pub sessions: Vec<SessionConfig>,
}

impl WallConfig {
    /// Load a config from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// A wall of `count` display tiles sharing `parameters`.
    pub fn with_displays(count: usize, parameters: StreamParameters) -> Self {
        let sessions = (0..count as u32)
            .map(|display_id| {
                SessionConfig::new(
                    parameters.clone(),
                    ContentFilter::Display {
                        display_id,
                        excluded_windows: Vec::new(),
                    },
                )
            })
            .collect();

        Self {
            engine: EngineConfig::default(),
            sessions,
        }
    }

    /// Check engine tuning and every tile.
    pub fn validate(&self) -> Result<()> {
        self.engine.validate().context("Invalid engine config")?;
        for (index, session) in self.sessions.iter().enumerate() {
            session
                .validate()
                .with_context(|| format!("Invalid session {index}"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_partial_config() {
        let json = r#"{
            "engine": { "channel_capacity": 5 },
            "sessions": [
                { "filter": { "kind": "window", "window_id": 12 } },
                { "filter": { "kind": "display", "display_id": 2 },
                  "parameters": { "width": 1280, "height": 720, "frame_rate": 30 } }
            ]
        }"#;

        let config: WallConfig = serde_json::from_str(json).unwrap();
        config.validate().unwrap();

        assert_eq!(config.engine.channel_capacity, 5);
        assert_eq!(config.engine.stop_timeout_ms, 2_000);
        assert_eq!(config.sessions.len(), 2);
        assert_eq!(
            config.sessions[0].filter,
            ContentFilter::Window { window_id: 12 }
        );
        assert_eq!(config.sessions[1].parameters.frame_rate, 30);
        assert_eq!(config.sessions[1].parameters.queue_depth, 3);
    }

    #[test]
    fn test_invalid_session_is_reported() {
        let mut config = WallConfig::with_displays(2, StreamParameters::default());
        config.sessions[1].parameters.frame_rate = 0;

        let error = config.validate().unwrap_err();
        assert!(format!("{error:#}").contains("Invalid session 1"));
    }
}
