use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::remotestate::TrackerConfig;
use crate::retry::{RetryFactory, RetryPolicy};
use crate::types::UnitId;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Unit this agent runs for, as `application/number`.
    pub unit: String,
    /// Model document to load at startup.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_file: Option<PathBuf>,
    pub retry_delay_ms: u64,
    pub retry_max_duration_ms: u64,
    pub update_status_interval_secs: u64,
    /// Overrides the egress CIDRs advertised on every relation.
    pub egress_subnets: Vec<String>,
    /// Wait for a public address on cross-model relations.
    pub poll_public: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            unit: "ubuntu/0".into(),
            model_file: None,
            retry_delay_ms: 3_000,
            retry_max_duration_ms: 30_000,
            update_status_interval_secs: 300,
            egress_subnets: Vec::new(),
            poll_public: true,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let mut config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("uniterd.toml"))
            .merge(Json::file("uniterd.json"))
            .merge(Env::prefixed("UNITERD_"))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // Comma-separated override, handy in container environments
        if let Ok(list) = std::env::var("UNITERD_EGRESS_SUBNETS_LIST") {
            config.egress_subnets = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        self.unit_id()?;
        self.egress()?;
        if self.update_status_interval_secs == 0 {
            anyhow::bail!("update_status_interval_secs must be positive");
        }
        Ok(())
    }

    pub fn unit_id(&self) -> anyhow::Result<UnitId> {
        self.unit
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid unit {:?}: {}", self.unit, e))
    }

    pub fn egress(&self) -> anyhow::Result<Vec<IpNet>> {
        self.egress_subnets
            .iter()
            .map(|cidr| {
                cidr.parse()
                    .map_err(|e| anyhow::anyhow!("Invalid egress subnet {:?}: {}", cidr, e))
            })
            .collect()
    }

    pub fn retry_factory(&self) -> RetryFactory {
        RetryPolicy::factory(
            Duration::from_millis(self.retry_delay_ms),
            Duration::from_millis(self.retry_max_duration_ms),
        )
    }

    pub fn tracker(&self) -> TrackerConfig {
        TrackerConfig {
            update_status_interval: Duration::from_secs(self.update_status_interval_secs),
        }
    }
}
