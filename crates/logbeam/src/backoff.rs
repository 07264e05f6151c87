// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub base: Duration,
    pub max: Duration,
    /// Growth applied per consecutive failure.
    pub factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            factor: 2.0,
        }
    }
}

impl From<&Config> for BackoffConfig {
    fn from(config: &Config) -> Self {
        Self {
            base: config.retry_backoff_base,
            max: config.retry_backoff_max.max(config.retry_backoff_base),
            ..Self::default()
        }
    }
}

/// Consecutive-failure tracker. A success resets it to the base delay.
#[derive(Debug, Clone)]
pub struct BackoffState {
    config: BackoffConfig,
    error_count: u32,
}

impl BackoffState {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            error_count: 0,
        }
    }

    /// Registers a failure and returns the delay before the next attempt.
    pub fn register_error(&mut self) -> Duration {
        self.error_count = self.error_count.saturating_add(1);
        // Past 64 doublings every sane base is far beyond the cap.
        let exponent = self.error_count.saturating_sub(1).min(64) as i32;
        let delay = self.config.base.as_secs_f64() * self.config.factor.powi(exponent);
        let capped = delay.min(self.config.max.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    pub fn register_success(&mut self) {
        self.error_count = 0;
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_caps_and_resets() {
        let mut state = BackoffState::new(BackoffConfig {
            base: Duration::from_millis(100),
            max: Duration::from_millis(500),
            factor: 2.0,
        });

        assert_eq!(state.register_error(), Duration::from_millis(100));
        assert_eq!(state.register_error(), Duration::from_millis(200));
        assert_eq!(state.register_error(), Duration::from_millis(400));
        assert_eq!(state.register_error(), Duration::from_millis(500));
        assert_eq!(state.error_count(), 4);

        state.register_success();
        assert_eq!(state.error_count(), 0);
        assert_eq!(state.register_error(), Duration::from_millis(100));
    }

    #[test]
    fn test_many_failures_stay_at_the_cap() {
        let mut state = BackoffState::new(BackoffConfig::default());
        for _ in 0..500 {
            state.register_error();
        }
        assert_eq!(state.register_error(), Duration::from_secs(30));
    }

    #[test]
    fn test_from_config_never_caps_below_base() {
        let config = Config {
            retry_backoff_base: Duration::from_secs(2),
            retry_backoff_max: Duration::from_secs(1),
            ..Config::default()
        };
        let backoff = BackoffConfig::from(&config);
        assert_eq!(backoff.max, Duration::from_secs(2));
    }
}
