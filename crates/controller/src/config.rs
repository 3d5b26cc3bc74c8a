//! Controller configuration

use anyhow::Result;
use controller_lib::{
    orchestrator::DrainConfig, ChannelConfig, OrchestratorConfig, SelectorConfig, SweeperConfig,
};
use serde::Deserialize;
use std::time::Duration;

/// Controller configuration, loaded from `FLEET_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    /// Identifier carried on structured log events
    #[serde(default = "default_controller_id")]
    pub controller_id: String,

    /// API server port for the agent protocol and operator surface
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Expected agent heartbeat interval in seconds
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Deliveries before a command is dead-lettered
    #[serde(default = "default_max_delivery_attempts")]
    pub max_delivery_attempts: u32,

    /// Bound on waiting for a command acknowledgment, in seconds
    #[serde(default = "default_ack_wait")]
    pub ack_wait_secs: u64,

    /// Bound on waiting for a replacement to become ready, in seconds
    #[serde(default = "default_provision_timeout")]
    pub provision_timeout_secs: u64,

    /// Node drain timeout in seconds
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,

    /// When true a drain timeout rolls the switch back instead of
    /// proceeding best-effort
    #[serde(default)]
    pub drain_timeout_aborts: bool,

    /// Wait between zombie-marking the source and terminating it, in seconds
    #[serde(default = "default_decommission_grace")]
    pub decommission_grace_secs: u64,

    /// Reconciliation sweep interval in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Automatic evaluation interval in seconds
    #[serde(default = "default_evaluation_interval")]
    pub evaluation_interval_secs: u64,

    /// Candidate scoring weight on normalized price
    #[serde(default = "default_price_weight")]
    pub price_weight: f64,

    /// Candidate scoring weight on the model risk score
    #[serde(default = "default_risk_weight")]
    pub risk_weight: f64,

    /// Poison TTL override in seconds; unset keeps the 15 day default
    #[serde(default)]
    pub poison_ttl_secs: Option<u64>,
}

fn default_controller_id() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "fleet-controller".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_max_delivery_attempts() -> u32 {
    5
}

fn default_ack_wait() -> u64 {
    120
}

fn default_provision_timeout() -> u64 {
    120
}

fn default_drain_timeout() -> u64 {
    300
}

fn default_decommission_grace() -> u64 {
    60
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_evaluation_interval() -> u64 {
    300
}

fn default_price_weight() -> f64 {
    0.6
}

fn default_risk_weight() -> f64 {
    0.4
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            controller_id: default_controller_id(),
            api_port: default_api_port(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            max_delivery_attempts: default_max_delivery_attempts(),
            ack_wait_secs: default_ack_wait(),
            provision_timeout_secs: default_provision_timeout(),
            drain_timeout_secs: default_drain_timeout(),
            drain_timeout_aborts: false,
            decommission_grace_secs: default_decommission_grace(),
            sweep_interval_secs: default_sweep_interval(),
            evaluation_interval_secs: default_evaluation_interval(),
            price_weight: default_price_weight(),
            risk_weight: default_risk_weight(),
            poison_ttl_secs: None,
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("FLEET"))
            .build()?;

        Ok(config.try_deserialize().unwrap_or_default())
    }

    /// Visibility timeout tracks the heartbeat interval so a command is
    /// redelivered after roughly three missed polls
    pub fn channel(&self) -> ChannelConfig {
        let heartbeat = Duration::from_secs(self.heartbeat_interval_secs);
        ChannelConfig {
            heartbeat_interval: heartbeat,
            visibility_timeout: heartbeat * 3,
            max_delivery_attempts: self.max_delivery_attempts,
            ack_wait: Duration::from_secs(self.ack_wait_secs),
        }
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            provision_timeout: Duration::from_secs(self.provision_timeout_secs),
            drain: DrainConfig {
                timeout: Duration::from_secs(self.drain_timeout_secs),
                ..DrainConfig::default()
            },
            drain_timeout_aborts: self.drain_timeout_aborts,
            decommission_grace: Duration::from_secs(self.decommission_grace_secs),
            command_timeout: Duration::from_secs(self.ack_wait_secs),
            ..OrchestratorConfig::default()
        }
    }

    pub fn sweeper(&self) -> SweeperConfig {
        SweeperConfig {
            interval: Duration::from_secs(self.sweep_interval_secs),
            ..SweeperConfig::default()
        }
    }

    pub fn selector(&self) -> SelectorConfig {
        SelectorConfig {
            price_weight: self.price_weight,
            risk_weight: self.risk_weight,
            ..SelectorConfig::default()
        }
    }
}
