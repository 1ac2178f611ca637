//! Configuration management for the replication service
//!
//! This module handles loading configuration from environment variables.
//! A node names a base store and at least one of a listen address
//! (`REPLICATE_TO`) and a primary address (`REPLICATE_FROM`); supplying
//! both creates a cascaded primary-over-secondary. A checkpoint recorder
//! is configured with `RECORD_TO` plus `REPLICATE_FROM` and needs no base
//! store.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::checkpoint::DEFAULT_ROTATE_SIZE;
use crate::errors::{ReplicationError, ReplicationResult};
use crate::secondary::SecondaryOptions;

/// Configuration for one replication node
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Base store directory; not used in recorder mode
    pub store_path: Option<PathBuf>,
    /// Open the base store with a blob area
    pub store_blobs: bool,
    /// Listen address for secondaries
    pub replicate_to: Option<String>,
    /// Primary address to subscribe to
    pub replicate_from: Option<String>,
    /// Checkpoint-log destination; captures the stream instead of applying it
    pub record_to: Option<PathBuf>,
    /// Verify stream digests at each transaction boundary
    pub check_checksums: bool,
    /// Empty-frame keepalive period; zero disables
    pub keep_alive_delay: Duration,
    /// Delay between reconnect attempts
    pub reconnect_delay: Duration,
    /// Checkpoint-log rotation threshold in bytes
    pub rotate_size: u64,
}

impl NodeConfig {
    /// Load configuration from environment variables
    ///
    /// # Environment Variables
    ///
    /// Required (one of):
    /// - `REPLICATE_TO`: listen address, e.g. "0.0.0.0:8100"
    /// - `REPLICATE_FROM`: primary address, e.g. "primary.example.com:8100"
    ///
    /// Optional (with defaults):
    /// - `STORE_PATH`: base store directory (required unless recording)
    /// - `STORE_BLOBS`: open the store with a blob area (default: false)
    /// - `RECORD_TO`: checkpoint-log directory; with `REPLICATE_FROM`,
    ///   capture the stream instead of applying it
    /// - `CHECK_CHECKSUMS`: verify stream digests (default: true)
    /// - `KEEP_ALIVE_DELAY`: keepalive period in seconds, 0 disables
    ///   (default: 0)
    /// - `RECONNECT_DELAY`: reconnect delay in seconds (default: 60)
    /// - `ROTATE_SIZE`: checkpoint-log rotation threshold in bytes
    ///   (default: 500 MiB)
    pub fn from_env() -> ReplicationResult<Self> {
        Self::from_env_with_overrides(None, None, None, None)
    }

    /// Load from the environment, preferring explicit (command-line)
    /// overrides where given.
    pub fn from_env_with_overrides(
        store_path: Option<PathBuf>,
        replicate_to: Option<String>,
        replicate_from: Option<String>,
        record_to: Option<PathBuf>,
    ) -> ReplicationResult<Self> {
        Self::validate_and_create(
            store_path.or_else(|| env::var("STORE_PATH").ok().map(PathBuf::from)),
            parse_bool("STORE_BLOBS", env::var("STORE_BLOBS").ok(), false)?,
            replicate_to.or_else(|| env::var("REPLICATE_TO").ok()),
            replicate_from.or_else(|| env::var("REPLICATE_FROM").ok()),
            record_to.or_else(|| env::var("RECORD_TO").ok().map(PathBuf::from)),
            parse_bool("CHECK_CHECKSUMS", env::var("CHECK_CHECKSUMS").ok(), true)?,
            parse_secs("KEEP_ALIVE_DELAY", env::var("KEEP_ALIVE_DELAY").ok(), 0)?,
            parse_secs("RECONNECT_DELAY", env::var("RECONNECT_DELAY").ok(), 60)?,
            parse_u64("ROTATE_SIZE", env::var("ROTATE_SIZE").ok(), DEFAULT_ROTATE_SIZE)?,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn validate_and_create(
        store_path: Option<PathBuf>,
        store_blobs: bool,
        replicate_to: Option<String>,
        replicate_from: Option<String>,
        record_to: Option<PathBuf>,
        check_checksums: bool,
        keep_alive_delay: Duration,
        reconnect_delay: Duration,
        rotate_size: u64,
    ) -> ReplicationResult<Self> {
        if replicate_to.is_none() && replicate_from.is_none() {
            return Err(ReplicationError::config(
                "You must specify REPLICATE_TO and/or REPLICATE_FROM",
            ));
        }

        if let (Some(to), Some(from)) = (&replicate_to, &replicate_from) {
            if to == from {
                return Err(ReplicationError::config(
                    "Values for REPLICATE_TO and REPLICATE_FROM must be different",
                ));
            }
        }

        if record_to.is_some() {
            if replicate_from.is_none() {
                return Err(ReplicationError::config(
                    "RECORD_TO requires REPLICATE_FROM",
                ));
            }
            if replicate_to.is_some() {
                return Err(ReplicationError::config(
                    "RECORD_TO cannot be combined with REPLICATE_TO",
                ));
            }
        } else if store_path.is_none() {
            return Err(ReplicationError::config(
                "Missing required STORE_PATH environment variable",
            ));
        }

        if let Some(path) = &store_path {
            if path.as_os_str().is_empty() {
                return Err(ReplicationError::config("STORE_PATH cannot be empty"));
            }
        }

        if rotate_size == 0 {
            return Err(ReplicationError::config("ROTATE_SIZE cannot be zero"));
        }

        Ok(Self {
            store_path,
            store_blobs,
            replicate_to,
            replicate_from,
            record_to,
            check_checksums,
            keep_alive_delay,
            reconnect_delay,
            rotate_size,
        })
    }

    /// Options for the secondary/recorder client side of this node
    pub fn secondary_options(&self) -> SecondaryOptions {
        SecondaryOptions {
            reconnect_delay: self.reconnect_delay,
            check_checksums: self.check_checksums,
            keep_alive_delay: self.keep_alive_delay,
        }
    }

    pub fn is_recorder(&self) -> bool {
        self.record_to.is_some()
    }
}

fn parse_bool(name: &str, value: Option<String>, default: bool) -> ReplicationResult<bool> {
    match value.as_deref() {
        None => Ok(default),
        Some(v) => match v.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(ReplicationError::config(format!(
                "{name} must be a boolean, got {other:?}"
            ))),
        },
    }
}

fn parse_u64(name: &str, value: Option<String>, default: u64) -> ReplicationResult<u64> {
    match value {
        None => Ok(default),
        Some(v) => v
            .parse()
            .map_err(|_| ReplicationError::config(format!("{name} must be an integer, got {v:?}"))),
    }
}

fn parse_secs(name: &str, value: Option<String>, default: u64) -> ReplicationResult<Duration> {
    Ok(Duration::from_secs(parse_u64(name, value, default)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(
        store_path: Option<&str>,
        replicate_to: Option<&str>,
        replicate_from: Option<&str>,
        record_to: Option<&str>,
    ) -> ReplicationResult<NodeConfig> {
        NodeConfig::validate_and_create(
            store_path.map(PathBuf::from),
            false,
            replicate_to.map(String::from),
            replicate_from.map(String::from),
            record_to.map(PathBuf::from),
            true,
            Duration::ZERO,
            Duration::from_secs(60),
            DEFAULT_ROTATE_SIZE,
        )
    }

    #[test]
    fn test_requires_a_replication_address() {
        let result = config(Some("/data/store"), None, None, None);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("REPLICATE_TO"));
    }

    #[test]
    fn test_primary_configuration() {
        let config = config(Some("/data/store"), Some("0.0.0.0:8100"), None, None).unwrap();
        assert!(!config.is_recorder());
        assert_eq!(config.replicate_to.as_deref(), Some("0.0.0.0:8100"));
    }

    #[test]
    fn test_cascade_requires_distinct_addresses() {
        let result = config(
            Some("/data/store"),
            Some("127.0.0.1:8100"),
            Some("127.0.0.1:8100"),
            None,
        );
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("different"));
    }

    #[test]
    fn test_cascade_configuration() {
        let config = config(
            Some("/data/store"),
            Some("0.0.0.0:8100"),
            Some("primary:8100"),
            None,
        )
        .unwrap();
        assert!(config.replicate_to.is_some());
        assert!(config.replicate_from.is_some());
    }

    #[test]
    fn test_secondary_requires_store() {
        let result = config(None, None, Some("primary:8100"), None);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("STORE_PATH"));
    }

    #[test]
    fn test_recorder_needs_no_store() {
        let config = config(None, None, Some("primary:8100"), Some("/data/log")).unwrap();
        assert!(config.is_recorder());
    }

    #[test]
    fn test_recorder_requires_replicate_from() {
        let result = config(None, Some("0.0.0.0:8100"), None, Some("/data/log"));
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_bool_values() {
        assert!(parse_bool("X", Some("true".into()), false).unwrap());
        assert!(parse_bool("X", Some("ON".into()), false).unwrap());
        assert!(!parse_bool("X", Some("0".into()), true).unwrap());
        assert!(parse_bool("X", None, true).unwrap());
        assert!(parse_bool("X", Some("maybe".into()), true).is_err());
    }

    #[test]
    fn test_parse_durations() {
        assert_eq!(
            parse_secs("X", Some("30".into()), 60).unwrap(),
            Duration::from_secs(30)
        );
        assert_eq!(parse_secs("X", None, 60).unwrap(), Duration::from_secs(60));
        assert!(parse_secs("X", Some("soon".into()), 60).is_err());
    }
}
