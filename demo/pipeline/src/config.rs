//! Demo scenario configuration

use serde::{Deserialize, Serialize};

/// Knobs for the pipeline demo scenario
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioConfig {
    /// Interface the demo traffic flows on
    pub interface_name: String,
    /// Orders generated by the source adapter
    pub order_count: usize,
    /// How many of those are duplicates of earlier orders
    pub duplicate_count: usize,
    /// Transient broker failures injected into the first publishes
    pub send_failures: u32,
    /// Batch size hint for the source adapter
    pub batch_size: usize,
    /// Surfaced failures before the outage demo trips the breaker
    pub breaker_failure_threshold: u32,
    /// Seconds the breaker stays open before probing
    pub breaker_open_seconds: u64,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            interface_name: "CustomerOrders".to_string(),
            order_count: 8,
            duplicate_count: 2,
            send_failures: 2,
            batch_size: 3,
            breaker_failure_threshold: 2,
            breaker_open_seconds: 2,
        }
    }
}

impl ScenarioConfig {
    /// Load from a TOML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ScenarioConfig = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse scenario: {}", e))?;
        Ok(config)
    }
}
