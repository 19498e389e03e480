use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

/// Engine configuration.
///
/// Declared per-node and per-workflow timeouts are data only; enforcement is
/// driven by an external poller. The step budget is the in-process backstop
/// against graphs that loop at runtime.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Maximum node executions per instance before the run is failed.
    pub max_steps_per_instance: u32,
    /// Default node timeout when a node declares none.
    pub default_node_timeout_minutes: u32,
    /// Default due window for approval requests without an explicit due date.
    pub default_approval_due_hours: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps_per_instance: 1000,
            default_node_timeout_minutes: 60,
            default_approval_due_hours: 72,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_env("FLOWFORGE")
    }

    /// Load configuration from environment with custom prefix.
    pub fn load_from_env(prefix: &str) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(
                Environment::with_prefix(prefix)
                    .separator("__")
                    .try_parsing(true),
            )
            .set_default("max_steps_per_instance", 1000)?
            .set_default("default_node_timeout_minutes", 60)?
            .set_default("default_approval_due_hours", 72)?;

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load configuration from file with environment overrides.
    pub fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix("FLOWFORGE").separator("__"));

        let config = builder.build()?;
        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::load_from_env("FLOWFORGE_TEST_UNSET").unwrap();
        assert_eq!(config.max_steps_per_instance, 1000);
        assert_eq!(config.default_approval_due_hours, 72);
    }
}
