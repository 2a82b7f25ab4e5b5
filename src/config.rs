use std::{str::FromStr, time::Duration};

use anyhow::{bail, Context, Result};

use crate::sensors::simulation::SimulationPolicy;

/// Which copy of a threshold set is consulted first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThresholdSource {
    /// Remote value merged with the cache by `updated_at`; cache on failure.
    #[default]
    RemoteFirst,
    /// Cached value if present, remote only on a miss.
    CacheFirst,
}

impl FromStr for ThresholdSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "remote_first" => Ok(ThresholdSource::RemoteFirst),
            "cache_first" => Ok(ThresholdSource::CacheFirst),
            other => bail!("unknown threshold source: {other}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres URL; the in-memory store is used when unset.
    pub database_url: Option<String>,
    pub session_secret: String,
    pub server_host: String,
    pub server_port: u16,
    pub simulation_interval: Duration,
    pub simulation_policy: SimulationPolicy,
    pub threshold_source: ThresholdSource,
    /// Chart points kept per user.
    pub chart_history_len: usize,
    pub cache_snapshot_path: Option<String>,
    pub notify_webhook_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .with_context(|| format!("missing required env var: {key}"))
        };
        let optional = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_owned());
        let maybe = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let interval_ms: u64 = optional("SIMULATION_INTERVAL_MS", "1000")
            .parse()
            .context("SIMULATION_INTERVAL_MS must be a positive integer")?;
        if interval_ms == 0 {
            bail!("SIMULATION_INTERVAL_MS must be a positive integer");
        }

        let chart_history_len: usize = optional("CHART_HISTORY_LEN", "24")
            .parse()
            .context("CHART_HISTORY_LEN must be a positive integer")?;
        if chart_history_len == 0 {
            bail!("CHART_HISTORY_LEN must be a positive integer");
        }

        Ok(Self {
            database_url: maybe("DATABASE_URL"),
            session_secret: required("SESSION_SECRET")?,
            server_host: optional("SERVER_HOST", "0.0.0.0"),
            server_port: optional("SERVER_PORT", "8080")
                .parse()
                .context("SERVER_PORT must be a valid port number")?,
            simulation_interval: Duration::from_millis(interval_ms),
            simulation_policy: optional("SIMULATION_POLICY", "gate_effect")
                .parse()
                .context("SIMULATION_POLICY must be `drift` or `gate_effect`")?,
            threshold_source: optional("THRESHOLD_SOURCE", "remote_first")
                .parse()
                .context("THRESHOLD_SOURCE must be `remote_first` or `cache_first`")?,
            chart_history_len,
            cache_snapshot_path: maybe("CACHE_SNAPSHOT_PATH"),
            notify_webhook_url: maybe("NOTIFY_WEBHOOK_URL"),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply() {
        let c = config(&[("SESSION_SECRET", "s3cret")]).unwrap();
        assert!(c.database_url.is_none());
        assert_eq!(c.server_host, "0.0.0.0");
        assert_eq!(c.server_port, 8080);
        assert_eq!(c.simulation_interval, Duration::from_millis(1000));
        assert_eq!(c.simulation_policy, SimulationPolicy::GateEffect);
        assert_eq!(c.threshold_source, ThresholdSource::RemoteFirst);
        assert_eq!(c.chart_history_len, 24);
        assert!(c.cache_snapshot_path.is_none());
        assert!(c.notify_webhook_url.is_none());
    }

    #[test]
    fn session_secret_is_required() {
        let err = config(&[]).unwrap_err();
        assert!(err.to_string().contains("SESSION_SECRET"));
        assert!(config(&[("SESSION_SECRET", "")]).is_err());
    }

    #[test]
    fn overrides_are_parsed() {
        let c = config(&[
            ("SESSION_SECRET", "k"),
            ("DATABASE_URL", "postgres://localhost/nitcat"),
            ("SERVER_PORT", "9000"),
            ("SIMULATION_INTERVAL_MS", "250"),
            ("SIMULATION_POLICY", "drift"),
            ("THRESHOLD_SOURCE", "cache_first"),
            ("CHART_HISTORY_LEN", "48"),
        ])
        .unwrap();
        assert_eq!(c.database_url.as_deref(), Some("postgres://localhost/nitcat"));
        assert_eq!(c.server_port, 9000);
        assert_eq!(c.simulation_interval, Duration::from_millis(250));
        assert_eq!(c.simulation_policy, SimulationPolicy::Drift);
        assert_eq!(c.threshold_source, ThresholdSource::CacheFirst);
        assert_eq!(c.chart_history_len, 48);
    }

    #[test]
    fn malformed_values_fail_with_context() {
        let err = config(&[("SESSION_SECRET", "k"), ("SERVER_PORT", "eighty")]).unwrap_err();
        assert!(err.to_string().contains("SERVER_PORT"));

        assert!(config(&[("SESSION_SECRET", "k"), ("SIMULATION_INTERVAL_MS", "0")]).is_err());
        assert!(config(&[("SESSION_SECRET", "k"), ("THRESHOLD_SOURCE", "both")]).is_err());
        assert!(config(&[("SESSION_SECRET", "k"), ("SIMULATION_POLICY", "random")]).is_err());
    }

    #[test]
    fn threshold_source_parses_case_insensitively() {
        assert_eq!("Cache_First".parse::<ThresholdSource>().unwrap(), ThresholdSource::CacheFirst);
    }
}
