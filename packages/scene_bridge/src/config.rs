//! Bridge configuration.
//!
//! Every field has a default, so a config file only needs the values it
//! changes. The same structure can be embedded in a session file.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};

/// Resource limits applied to every extension's Rhai engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SandboxLimits {
    /// Operations per script call; stops runaway loops.
    pub max_operations: u64,
    pub max_call_levels: usize,
    pub max_expr_depth: usize,
    pub max_string_size: usize,
    pub max_array_size: usize,
    pub max_map_size: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            max_operations: 100_000,
            max_call_levels: 64,
            max_expr_depth: 64,
            max_string_size: 10_000,
            max_array_size: 1_000,
            max_map_size: 500,
        }
    }
}

impl SandboxLimits {
    pub fn apply(&self, engine: &mut rhai::Engine) {
        engine.set_max_expr_depths(self.max_expr_depth, self.max_expr_depth);
        engine.set_max_call_levels(self.max_call_levels);
        engine.set_max_operations(self.max_operations);
        engine.set_max_string_size(self.max_string_size);
        engine.set_max_array_size(self.max_array_size);
        engine.set_max_map_size(self.max_map_size);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeConfig {
    /// Host version reported to extensions as `api.version`.
    pub version: String,
    pub api_version: u32,
    pub engine_name: String,
    pub sandbox: SandboxLimits,
    pub max_logs_per_tick: u32,
    /// Diagnostics retained per instance.
    pub max_diagnostics: usize,
    /// Upper bound on command/message drain rounds in a single pump.
    pub max_pump_rounds: usize,
    /// Install the inspection hook that captures each composed common slice.
    pub debug_inspect: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            api_version: 1,
            engine_name: "headless".to_string(),
            sandbox: SandboxLimits::default(),
            max_logs_per_tick: 100,
            max_diagnostics: 32,
            max_pump_rounds: 8,
            debug_inspect: false,
        }
    }
}

impl BridgeConfig {
    pub fn load(path: impl AsRef<Path>) -> BridgeResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| BridgeError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| BridgeError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        log::debug!("Loaded bridge config from {}", path.display());
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: BridgeConfig = serde_json::from_value(json!({
            "engineName": "globe",
            "sandbox": { "maxOperations": 5000 },
            "debugInspect": true
        }))
        .unwrap();
        assert_eq!(config.engine_name, "globe");
        assert_eq!(config.sandbox.max_operations, 5000);
        assert_eq!(config.sandbox.max_call_levels, 64);
        assert_eq!(config.max_pump_rounds, 8);
        assert!(config.debug_inspect);
    }

    #[test]
    fn test_load_reports_path() {
        match BridgeConfig::load("/nonexistent/bridge.json") {
            Err(BridgeError::Io { path, .. }) => assert_eq!(path, "/nonexistent/bridge.json"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_limits_stop_runaway_scripts() {
        let mut engine = rhai::Engine::new();
        SandboxLimits {
            max_operations: 1_000,
            ..Default::default()
        }
        .apply(&mut engine);
        assert!(engine.run("loop {}").is_err());
    }
}
