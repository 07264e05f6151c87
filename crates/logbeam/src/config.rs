// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::buffer::archive::DEFAULT_ARCHIVE_BATCH_SIZE;
use crate::buffer::live::DEFAULT_LIVE_CAPACITY;
use crate::discovery::DiscoveryConfig;
use crate::errors::ConfigError;

const DEFAULT_STORAGE_DIR: &str = ".logbeam";

#[derive(Debug, Clone)]
pub struct Config {
    /// Collector base URL (`http(s)://` or `ws(s)://`). `None` leaves the
    /// pipeline buffering until an endpoint is configured or discovered.
    pub endpoint: Option<String>,
    pub secret: Option<String>,
    pub storage_dir: PathBuf,
    /// Initial sensitivity policy.
    pub sensitive: bool,
    pub live_enabled: bool,
    pub live_capacity: usize,
    pub archive_enabled: bool,
    pub archive_batch_size: usize,
    /// Positions allocated per persisted write; 1 persists every allocation.
    pub position_persist_interval: u64,
    pub request_timeout: Duration,
    pub retry_backoff_base: Duration,
    pub retry_backoff_max: Duration,
    /// zstd level for archive uploads, 0 disables compression.
    pub compression_level: i32,
    pub proxy_https: Option<String>,
    pub live_view_port: Option<u16>,
    pub discovery_enabled: bool,
    pub discovery: DiscoveryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            endpoint: None,
            secret: None,
            storage_dir: PathBuf::from(DEFAULT_STORAGE_DIR),
            sensitive: false,
            live_enabled: true,
            live_capacity: DEFAULT_LIVE_CAPACITY,
            archive_enabled: true,
            archive_batch_size: DEFAULT_ARCHIVE_BATCH_SIZE,
            position_persist_interval: 1,
            request_timeout: Duration::from_millis(5000),
            retry_backoff_base: Duration::from_millis(100),
            retry_backoff_max: Duration::from_millis(30_000),
            compression_level: 0,
            proxy_https: None,
            live_view_port: None,
            discovery_enabled: false,
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl Config {
    /// Builds a config from `LOGBEAM_*` environment variables on top of the defaults.
    pub fn from_env() -> Result<Config, ConfigError> {
        let defaults = Config::default();
        let config = Config {
            endpoint: non_empty_var("LOGBEAM_ENDPOINT"),
            secret: non_empty_var("LOGBEAM_SECRET"),
            storage_dir: non_empty_var("LOGBEAM_STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.storage_dir),
            sensitive: parse_var("LOGBEAM_SENSITIVE", defaults.sensitive, parse_bool)?,
            live_enabled: parse_var("LOGBEAM_LIVE_ENABLED", defaults.live_enabled, parse_bool)?,
            live_capacity: parse_var("LOGBEAM_LIVE_CAPACITY", defaults.live_capacity, parse_positive)?,
            archive_enabled: parse_var(
                "LOGBEAM_ARCHIVE_ENABLED",
                defaults.archive_enabled,
                parse_bool,
            )?,
            archive_batch_size: parse_var(
                "LOGBEAM_ARCHIVE_BATCH_SIZE",
                defaults.archive_batch_size,
                parse_positive,
            )?,
            position_persist_interval: parse_var(
                "LOGBEAM_POSITION_PERSIST_INTERVAL",
                defaults.position_persist_interval,
                parse_positive,
            )?,
            request_timeout: parse_var(
                "LOGBEAM_REQUEST_TIMEOUT_MS",
                defaults.request_timeout,
                parse_millis,
            )?,
            retry_backoff_base: parse_var(
                "LOGBEAM_RETRY_BACKOFF_BASE_MS",
                defaults.retry_backoff_base,
                parse_millis,
            )?,
            retry_backoff_max: parse_var(
                "LOGBEAM_RETRY_BACKOFF_MAX_MS",
                defaults.retry_backoff_max,
                parse_millis,
            )?,
            compression_level: parse_var(
                "LOGBEAM_COMPRESSION_LEVEL",
                defaults.compression_level,
                |raw| raw.parse::<i32>().ok().filter(|level| (0..=22).contains(level)),
            )?,
            proxy_https: non_empty_var("LOGBEAM_PROXY_HTTPS")
                .or_else(|| non_empty_var("HTTPS_PROXY")),
            live_view_port: match non_empty_var("LOGBEAM_LIVE_VIEW_PORT") {
                Some(raw) => Some(raw.parse::<u16>().map_err(|_| ConfigError::InvalidValue {
                    var: "LOGBEAM_LIVE_VIEW_PORT",
                    value: raw,
                })?),
                None => None,
            },
            discovery_enabled: parse_var("LOGBEAM_DISCOVERY", defaults.discovery_enabled, parse_bool)?,
            discovery: defaults.discovery,
        };
        if config.endpoint.is_some() && config.secret.is_none() {
            return Err(ConfigError::Missing("LOGBEAM_SECRET"));
        }
        Ok(config)
    }

    pub fn position_path(&self) -> PathBuf {
        self.storage_dir.join("position")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.storage_dir.join("archive")
    }
}

fn non_empty_var(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_var<T>(
    var: &'static str,
    default: T,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<T, ConfigError> {
    match non_empty_var(var) {
        None => Ok(default),
        Some(raw) => parse(&raw).ok_or(ConfigError::InvalidValue { var, value: raw }),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_positive<T: FromStr + PartialOrd + Default>(raw: &str) -> Option<T> {
    raw.parse::<T>().ok().filter(|value| *value > T::default())
}

fn parse_millis(raw: &str) -> Option<Duration> {
    raw.parse::<u64>().ok().map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "LOGBEAM_ENDPOINT",
        "LOGBEAM_SECRET",
        "LOGBEAM_STORAGE_DIR",
        "LOGBEAM_SENSITIVE",
        "LOGBEAM_LIVE_CAPACITY",
        "LOGBEAM_ARCHIVE_BATCH_SIZE",
        "LOGBEAM_COMPRESSION_LEVEL",
        "LOGBEAM_PROXY_HTTPS",
        "HTTPS_PROXY",
        "LOGBEAM_LIVE_VIEW_PORT",
        "LOGBEAM_RETRY_BACKOFF_MAX_MS",
    ];

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults_without_env() {
        clear_env();
        let config = Config::from_env().expect("config");
        assert_eq!(config.endpoint, None);
        assert_eq!(config.storage_dir, PathBuf::from(".logbeam"));
        assert!(!config.sensitive);
        assert_eq!(config.live_capacity, 1000);
        assert_eq!(config.archive_batch_size, 100);
        assert_eq!(config.live_view_port, None);
        assert_eq!(config.archive_dir(), PathBuf::from(".logbeam/archive"));
    }

    #[test]
    #[serial]
    fn test_reads_overrides() {
        clear_env();
        env::set_var("LOGBEAM_ENDPOINT", "https://collector.example.com");
        env::set_var("LOGBEAM_SECRET", "s3cret");
        env::set_var("LOGBEAM_SENSITIVE", "TRUE");
        env::set_var("LOGBEAM_LIVE_CAPACITY", "5");
        env::set_var("LOGBEAM_ARCHIVE_BATCH_SIZE", "3");
        env::set_var("LOGBEAM_RETRY_BACKOFF_MAX_MS", "2500");
        env::set_var("LOGBEAM_LIVE_VIEW_PORT", "9999");
        let config = Config::from_env().expect("config");
        assert_eq!(config.endpoint.as_deref(), Some("https://collector.example.com"));
        assert_eq!(config.secret.as_deref(), Some("s3cret"));
        assert!(config.sensitive);
        assert_eq!(config.live_capacity, 5);
        assert_eq!(config.archive_batch_size, 3);
        assert_eq!(config.retry_backoff_max, Duration::from_millis(2500));
        assert_eq!(config.live_view_port, Some(9999));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_proxy_falls_back_to_https_proxy() {
        clear_env();
        env::set_var("HTTPS_PROXY", "http://proxy:3128");
        let config = Config::from_env().expect("config");
        assert_eq!(config.proxy_https.as_deref(), Some("http://proxy:3128"));

        env::set_var("LOGBEAM_PROXY_HTTPS", "http://other:3128");
        let config = Config::from_env().expect("config");
        assert_eq!(config.proxy_https.as_deref(), Some("http://other:3128"));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_values_are_rejected() {
        clear_env();
        env::set_var("LOGBEAM_LIVE_CAPACITY", "0");
        assert_eq!(
            Config::from_env().unwrap_err(),
            ConfigError::InvalidValue {
                var: "LOGBEAM_LIVE_CAPACITY",
                value: "0".to_string()
            }
        );
        clear_env();

        env::set_var("LOGBEAM_COMPRESSION_LEVEL", "40");
        assert!(Config::from_env().is_err());
        clear_env();

        env::set_var("LOGBEAM_SENSITIVE", "maybe");
        assert!(Config::from_env().is_err());
        clear_env();
    }

    #[test]
    #[serial]
    fn test_endpoint_requires_secret() {
        clear_env();
        env::set_var("LOGBEAM_ENDPOINT", "http://127.0.0.1:8126");
        assert_eq!(
            Config::from_env().unwrap_err(),
            ConfigError::Missing("LOGBEAM_SECRET")
        );
        clear_env();
    }
}
