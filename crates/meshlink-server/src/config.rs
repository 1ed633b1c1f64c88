//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the relay can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::str::FromStr;

use meshlink_shared::constants::{
    EMPTY_SESSION_GRACE_SECS, PARTICIPANT_TIMEOUT_SECS, SESSION_TTL_SECS, SWEEP_INTERVAL_SECS,
};
use meshlink_store::StoreConfig;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) API server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// Human-readable name for this relay instance.
    /// Env: `INSTANCE_NAME`
    pub instance_name: String,

    /// Env: `SESSION_TTL_SECS`
    pub session_ttl_secs: i64,

    /// Participants silent for longer than this are pruned.
    /// Env: `PARTICIPANT_TIMEOUT_SECS`
    pub participant_timeout_secs: i64,

    /// Env: `EMPTY_SESSION_GRACE_SECS`
    pub empty_session_grace_secs: i64,

    /// Env: `SWEEP_INTERVAL_SECS`
    pub sweep_interval_secs: u64,

    /// Maximum participants per session (0 = unlimited).
    /// Env: `MAX_PARTICIPANTS`
    pub max_participants: usize,

    /// Sustained requests per second per client IP.
    /// Env: `RATE_LIMIT_RPS`
    pub rate_limit_rps: f64,

    /// Env: `RATE_LIMIT_BURST`
    pub rate_limit_burst: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let store = StoreConfig::default();
        Self {
            http_addr: ([0, 0, 0, 0], 8080).into(),
            instance_name: "meshlink relay".to_string(),
            session_ttl_secs: SESSION_TTL_SECS,
            participant_timeout_secs: PARTICIPANT_TIMEOUT_SECS,
            empty_session_grace_secs: EMPTY_SESSION_GRACE_SECS,
            sweep_interval_secs: SWEEP_INTERVAL_SECS,
            max_participants: store.max_participants,
            // Polling clients issue a few requests per second each.
            rate_limit_rps: 20.0,
            rate_limit_burst: 60.0,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        parse_into(&lookup, "HTTP_ADDR", &mut config.http_addr);

        if let Some(name) = lookup("INSTANCE_NAME") {
            config.instance_name = name;
        }

        parse_into(&lookup, "SESSION_TTL_SECS", &mut config.session_ttl_secs);
        parse_into(&lookup, "PARTICIPANT_TIMEOUT_SECS", &mut config.participant_timeout_secs);
        parse_into(&lookup, "EMPTY_SESSION_GRACE_SECS", &mut config.empty_session_grace_secs);
        parse_into(&lookup, "SWEEP_INTERVAL_SECS", &mut config.sweep_interval_secs);
        parse_into(&lookup, "MAX_PARTICIPANTS", &mut config.max_participants);
        parse_into(&lookup, "RATE_LIMIT_RPS", &mut config.rate_limit_rps);
        parse_into(&lookup, "RATE_LIMIT_BURST", &mut config.rate_limit_burst);

        if config.sweep_interval_secs == 0 {
            tracing::warn!("SWEEP_INTERVAL_SECS must be positive, using default");
            config.sweep_interval_secs = SWEEP_INTERVAL_SECS;
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            session_ttl: chrono::Duration::seconds(self.session_ttl_secs),
            participant_timeout: chrono::Duration::seconds(self.participant_timeout_secs),
            empty_session_grace: chrono::Duration::seconds(self.empty_session_grace_secs),
            max_participants: self.max_participants,
            ..StoreConfig::default()
        }
    }
}

fn parse_into<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T) {
    let Some(value) = lookup(key) else {
        return;
    };
    match value.trim().parse::<T>() {
        Ok(parsed) => *target = parsed,
        Err(_) => tracing::warn!(key, value = %value, "Invalid value, using default"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.participant_timeout_secs, 150);
        assert_eq!(config.sweep_interval_secs, 60);
    }

    #[test]
    fn test_values_from_environment() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("HTTP_ADDR", "127.0.0.1:9000"),
            ("INSTANCE_NAME", "lab"),
            ("MAX_PARTICIPANTS", "4"),
            ("PARTICIPANT_TIMEOUT_SECS", " 30 "),
            ("RATE_LIMIT_RPS", "2.5"),
        ]));
        assert_eq!(config.http_addr, ([127, 0, 0, 1], 9000).into());
        assert_eq!(config.instance_name, "lab");
        assert_eq!(config.max_participants, 4);
        assert_eq!(config.participant_timeout_secs, 30);
        assert_eq!(config.rate_limit_rps, 2.5);

        let store = config.store_config();
        assert_eq!(store.participant_timeout, chrono::Duration::seconds(30));
        assert_eq!(store.max_participants, 4);
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("HTTP_ADDR", "not-an-addr"),
            ("SESSION_TTL_SECS", "soon"),
            ("SWEEP_INTERVAL_SECS", "0"),
        ]));
        let defaults = ServerConfig::default();
        assert_eq!(config.http_addr, defaults.http_addr);
        assert_eq!(config.session_ttl_secs, defaults.session_ttl_secs);
        assert_eq!(config.sweep_interval_secs, defaults.sweep_interval_secs);
    }
}
