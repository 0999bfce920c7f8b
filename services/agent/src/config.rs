use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::time::Duration;

// Agent configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    // HTTP/WebSocket listener bind address.
    pub bind: SocketAddr,
    // Metrics HTTP listener bind address.
    pub metrics_bind: SocketAddr,
    // Hard cap on concurrently live sessions.
    pub max_sessions: usize,
    // Per-session outbound queue depth.
    pub outbound_queue_capacity: usize,
    // Scheduler evaluation tick; finer than the finest subscription interval.
    pub scheduler_tick_ms: u64,
    // Transport keep-alive ping period.
    pub keep_alive_secs: u64,
    // Read deadline; refreshed by any inbound frame.
    pub read_deadline_secs: u64,
    // Collector refresh period.
    pub collect_interval_secs: u64,
}

pub const DEFAULT_MAX_SESSIONS: usize = 128;
pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_SCHEDULER_TICK_MS: u64 = 100;
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 30;
pub const DEFAULT_READ_DEADLINE_SECS: u64 = 60;
pub const DEFAULT_COLLECT_INTERVAL_SECS: u64 = 2;

#[derive(Debug, Deserialize)]
struct AgentConfigOverride {
    bind: Option<String>,
    metrics_bind: Option<String>,
    max_sessions: Option<usize>,
    outbound_queue_capacity: Option<usize>,
    scheduler_tick_ms: Option<u64>,
    keep_alive_secs: Option<u64>,
    read_deadline_secs: Option<u64>,
    collect_interval_secs: Option<u64>,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        // Environment variables provide defaults for local development.
        let bind = std::env::var("SKIFF_BIND")
            .unwrap_or_else(|_| "0.0.0.0:7000".to_string())
            .parse()
            .with_context(|| "parse SKIFF_BIND")?;
        let metrics_bind = std::env::var("SKIFF_METRICS_BIND")
            .unwrap_or_else(|_| "0.0.0.0:9100".to_string())
            .parse()
            .with_context(|| "parse SKIFF_METRICS_BIND")?;
        let max_sessions = std::env::var("SKIFF_MAX_SESSIONS")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_SESSIONS);
        let outbound_queue_capacity = std::env::var("SKIFF_OUTBOUND_QUEUE")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_OUTBOUND_QUEUE_CAPACITY);
        let scheduler_tick_ms = std::env::var("SKIFF_SCHEDULER_TICK_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_SCHEDULER_TICK_MS);
        let keep_alive_secs = std::env::var("SKIFF_KEEPALIVE_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_KEEP_ALIVE_SECS);
        let read_deadline_secs = std::env::var("SKIFF_READ_DEADLINE_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_READ_DEADLINE_SECS);
        let collect_interval_secs = std::env::var("SKIFF_COLLECT_INTERVAL_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_COLLECT_INTERVAL_SECS);
        Ok(Self {
            bind,
            metrics_bind,
            max_sessions,
            outbound_queue_capacity,
            scheduler_tick_ms,
            keep_alive_secs,
            read_deadline_secs,
            collect_interval_secs,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("SKIFF_AGENT_CONFIG") {
            // YAML overrides allow ops-friendly config files.
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read SKIFF_AGENT_CONFIG: {path}"))?;
            let override_cfg: AgentConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse agent config yaml")?;
            if let Some(value) = override_cfg.bind {
                config.bind = value.parse().with_context(|| "parse bind")?;
            }
            if let Some(value) = override_cfg.metrics_bind {
                config.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
            }
            if let Some(value) = override_cfg.max_sessions
                && value > 0
            {
                config.max_sessions = value;
            }
            if let Some(value) = override_cfg.outbound_queue_capacity
                && value > 0
            {
                config.outbound_queue_capacity = value;
            }
            if let Some(value) = override_cfg.scheduler_tick_ms
                && value > 0
            {
                config.scheduler_tick_ms = value;
            }
            if let Some(value) = override_cfg.keep_alive_secs
                && value > 0
            {
                config.keep_alive_secs = value;
            }
            if let Some(value) = override_cfg.read_deadline_secs
                && value > 0
            {
                config.read_deadline_secs = value;
            }
            if let Some(value) = override_cfg.collect_interval_secs
                && value > 0
            {
                config.collect_interval_secs = value;
            }
        }
        Ok(config)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn read_deadline(&self) -> Duration {
        Duration::from_secs(self.read_deadline_secs)
    }

    pub fn collect_interval(&self) -> Duration {
        Duration::from_secs(self.collect_interval_secs)
    }
}
