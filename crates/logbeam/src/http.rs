// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::error::Error;
use std::time::Duration;

use tracing::error;

use crate::config::Config;

/// Builds the client shared by the handshake and archive uploads.
///
/// An unusable proxy setting is logged and the client falls back to a direct
/// connection rather than leaving the pipeline without a transport.
#[must_use]
pub fn get_client(config: &Config) -> reqwest::Client {
    match build_client(config) {
        Ok(client) => client,
        Err(e) => {
            error!(
                "Unable to parse proxy configuration: {}, falling back to direct connection",
                e
            );
            match build_client_without_proxy(config) {
                Ok(client) => client,
                Err(inner) => {
                    error!(
                        "Failed to build HTTP client without proxy: {}, using reqwest defaults",
                        inner
                    );
                    reqwest::Client::new()
                }
            }
        }
    }
}

fn build_client(config: &Config) -> Result<reqwest::Client, Box<dyn Error>> {
    build_client_inner(config, true)
}

fn build_client_without_proxy(config: &Config) -> Result<reqwest::Client, Box<dyn Error>> {
    build_client_inner(config, false)
}

fn build_client_inner(config: &Config, allow_proxy: bool) -> Result<reqwest::Client, Box<dyn Error>> {
    let mut client = reqwest::Client::builder()
        .timeout(config.request_timeout)
        .pool_idle_timeout(Some(Duration::from_secs(270)))
        .tcp_keepalive(Some(Duration::from_secs(120)));

    if allow_proxy {
        if let Some(https_uri) = &config.proxy_https {
            let proxy = reqwest::Proxy::https(https_uri.clone())?;
            client = client.proxy(proxy);
        }
    }

    Ok(client.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_builds_with_proxy() {
        let config = Config {
            proxy_https: Some("http://proxy.internal:3128".to_string()),
            ..Config::default()
        };
        assert!(build_client(&config).is_ok());
    }

    #[test]
    #[traced_test]
    fn test_invalid_proxy_falls_back_to_direct() {
        let config = Config {
            proxy_https: Some("not a url at all".to_string()),
            ..Config::default()
        };
        assert!(build_client(&config).is_err());
        let _client = get_client(&config);
        assert!(logs_contain("falling back to direct connection"));
    }
}
