//! Forwarder configuration.
//!
//! [`ForwarderConfig`] is a `clap::Args` so a host binary can flatten it
//! into its own command line. Every option also reads a `FLOWTAP_*`
//! environment variable, which is how an embedded forwarder (no command
//! line of its own) is configured via [`ForwarderConfig::from_env`].

use std::time::Duration;

use clap::{Args, Parser};

use crate::error::{FlowtapError, Result};
use crate::event::EventSchema;
use crate::queue::{DEFAULT_CAPACITY, QueueFullPolicy};
use crate::transport::TransportKind;

pub use crate::transport::DEFAULT_ENDPOINT;

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_REDIS_LIST: &str = "mitm_channel";
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_CACHE_MAX_ENTRIES: usize = 10_000;

/// Runtime configuration of the forwarding pipeline.
#[derive(Debug, Clone, Args)]
pub struct ForwarderConfig {
    /// Outbound transport
    #[arg(long, env = "FLOWTAP_TRANSPORT", value_enum, default_value_t = TransportKind::Zmq)]
    pub transport: TransportKind,

    /// Publish endpoint for the zmq transport
    #[arg(long, env = "FLOWTAP_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    pub endpoint: String,

    /// Connection URL for the redis transport (credentials go in the URL)
    #[arg(long, env = "FLOWTAP_REDIS_URL", default_value = DEFAULT_REDIS_URL)]
    pub redis_url: String,

    /// List that events are pushed onto
    #[arg(long, env = "FLOWTAP_REDIS_LIST", default_value = DEFAULT_REDIS_LIST)]
    pub redis_list: String,

    /// Maximum number of events waiting for the delivery worker
    #[arg(long, env = "FLOWTAP_QUEUE_CAPACITY", default_value_t = DEFAULT_CAPACITY)]
    pub queue_capacity: usize,

    /// Behaviour of capture callbacks when the queue is full
    #[arg(
        long,
        env = "FLOWTAP_QUEUE_FULL_POLICY",
        value_enum,
        default_value_t = QueueFullPolicy::Block
    )]
    pub queue_full_policy: QueueFullPolicy,

    /// Emitted event shapes
    #[arg(long, env = "FLOWTAP_SCHEMA", value_enum, default_value_t = EventSchema::Enriched)]
    pub schema: EventSchema,

    /// Age after which an unanswered request is evicted
    #[arg(
        long,
        env = "FLOWTAP_CACHE_TTL",
        default_value = "5m",
        value_parser = humantime::parse_duration
    )]
    pub cache_ttl: Duration,

    /// How often the correlation cache is swept
    #[arg(
        long,
        env = "FLOWTAP_CACHE_SWEEP_INTERVAL",
        default_value = "30s",
        value_parser = humantime::parse_duration
    )]
    pub cache_sweep_interval: Duration,

    /// Entry count above which an insert triggers a sweep
    #[arg(long, env = "FLOWTAP_CACHE_MAX_ENTRIES", default_value_t = DEFAULT_CACHE_MAX_ENTRIES)]
    pub cache_max_entries: usize,
}

#[derive(Parser)]
#[command(name = "flowtap")]
struct EnvOnly {
    #[command(flatten)]
    config: ForwarderConfig,
}

impl ForwarderConfig {
    /// Build from `FLOWTAP_*` environment variables and defaults.
    pub fn from_env() -> Result<Self> {
        let parsed = EnvOnly::try_parse_from(["flowtap"])
            .map_err(|e| FlowtapError::config(e.to_string()))?;
        parsed.config.validate()?;
        Ok(parsed.config)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(FlowtapError::config("queue capacity must be greater than zero"));
        }
        if self.cache_ttl.is_zero() {
            return Err(FlowtapError::config("cache TTL must be greater than zero"));
        }
        if self.cache_sweep_interval.is_zero() {
            return Err(FlowtapError::config("cache sweep interval must be greater than zero"));
        }
        match self.transport {
            TransportKind::Zmq if self.endpoint.trim().is_empty() => {
                Err(FlowtapError::config("publish endpoint must not be empty"))
            }
            TransportKind::Redis if self.redis_list.trim().is_empty() => {
                Err(FlowtapError::config("redis list name must not be empty"))
            }
            _ => Ok(()),
        }
    }
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Zmq,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            redis_url: DEFAULT_REDIS_URL.to_string(),
            redis_list: DEFAULT_REDIS_LIST.to_string(),
            queue_capacity: DEFAULT_CAPACITY,
            queue_full_policy: QueueFullPolicy::Block,
            schema: EventSchema::Enriched,
            cache_ttl: DEFAULT_CACHE_TTL,
            cache_sweep_interval: DEFAULT_CACHE_SWEEP_INTERVAL,
            cache_max_entries: DEFAULT_CACHE_MAX_ENTRIES,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "FLOWTAP_TRANSPORT",
        "FLOWTAP_ENDPOINT",
        "FLOWTAP_QUEUE_CAPACITY",
        "FLOWTAP_QUEUE_FULL_POLICY",
        "FLOWTAP_SCHEMA",
        "FLOWTAP_CACHE_TTL",
    ];

    fn clear_env() {
        for var in VARS {
            // SAFETY: serialized tests, no other thread reads the environment.
            unsafe { std::env::remove_var(var) };
        }
    }

    #[test]
    #[serial]
    fn test_from_env_defaults_match_default() {
        clear_env();
        let config = ForwarderConfig::from_env().unwrap();
        let default = ForwarderConfig::default();

        assert_eq!(config.transport, default.transport);
        assert_eq!(config.endpoint, "tcp://*:5555");
        assert_eq!(config.queue_capacity, 1000);
        assert_eq!(config.queue_full_policy, QueueFullPolicy::Block);
        assert_eq!(config.schema, EventSchema::Enriched);
        assert_eq!(config.cache_ttl, default.cache_ttl);
        assert_eq!(config.cache_sweep_interval, default.cache_sweep_interval);
        assert_eq!(config.cache_max_entries, default.cache_max_entries);
        assert_eq!(config.redis_list, "mitm_channel");
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        clear_env();
        // SAFETY: serialized tests, no other thread reads the environment.
        unsafe {
            std::env::set_var("FLOWTAP_ENDPOINT", "tcp://127.0.0.1:7000");
            std::env::set_var("FLOWTAP_QUEUE_CAPACITY", "16");
            std::env::set_var("FLOWTAP_QUEUE_FULL_POLICY", "drop-newest");
            std::env::set_var("FLOWTAP_SCHEMA", "legacy");
            std::env::set_var("FLOWTAP_CACHE_TTL", "90s");
        }

        let config = ForwarderConfig::from_env().unwrap();
        clear_env();

        assert_eq!(config.endpoint, "tcp://127.0.0.1:7000");
        assert_eq!(config.queue_capacity, 16);
        assert_eq!(config.queue_full_policy, QueueFullPolicy::DropNewest);
        assert_eq!(config.schema, EventSchema::Legacy);
        assert_eq!(config.cache_ttl, Duration::from_secs(90));
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_zero_capacity() {
        clear_env();
        // SAFETY: serialized tests, no other thread reads the environment.
        unsafe { std::env::set_var("FLOWTAP_QUEUE_CAPACITY", "0") };

        let err = ForwarderConfig::from_env().unwrap_err();
        clear_env();
        assert!(matches!(err, FlowtapError::Config { .. }));
    }

    #[test]
    fn test_validate_rejects_empty_redis_list() {
        let config = ForwarderConfig {
            transport: TransportKind::Redis,
            redis_list: "  ".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_flatten_into_host_cli() {
        clear_env();
        #[derive(Parser)]
        struct HostCli {
            #[arg(long)]
            listen: String,
            #[command(flatten)]
            flowtap: ForwarderConfig,
        }

        let cli = HostCli::try_parse_from([
            "host",
            "--listen",
            "0.0.0.0:8080",
            "--transport",
            "redis",
            "--redis-list",
            "traffic",
            "--cache-sweep-interval",
            "1m",
        ])
        .unwrap();

        assert_eq!(cli.listen, "0.0.0.0:8080");
        assert_eq!(cli.flowtap.transport, TransportKind::Redis);
        assert_eq!(cli.flowtap.redis_list, "traffic");
        assert_eq!(cli.flowtap.cache_sweep_interval, Duration::from_secs(60));
    }
}
