// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared fixtures for the pipeline integration tests

pub mod mock_server;

use std::path::Path;
use std::time::Duration;

use logbeam::dispatcher::PipelineStatus;
use logbeam::{ApplicationInfo, Config, Shipper};

pub fn app() -> ApplicationInfo {
    ApplicationInfo {
        app_id: "com.example.app".to_string(),
        version: "1.2.3".to_string(),
        build: "45".to_string(),
        os: "linux".to_string(),
        device_model: "x86_64".to_string(),
        device_id: "device-1".to_string(),
    }
}

/// Archive-only pipeline pointed at `endpoint`, with fast retries.
pub fn archive_config(dir: &Path, endpoint: &str) -> Config {
    Config {
        endpoint: Some(endpoint.to_string()),
        secret: Some("s3cret".to_string()),
        storage_dir: dir.to_path_buf(),
        live_enabled: false,
        archive_batch_size: 3,
        retry_backoff_base: Duration::from_millis(10),
        retry_backoff_max: Duration::from_millis(50),
        ..Config::default()
    }
}

/// Polls the pipeline status until `condition` holds or five seconds pass.
pub async fn wait_for_status(
    shipper: &Shipper,
    condition: impl Fn(&PipelineStatus) -> bool,
) -> bool {
    for _ in 0..500 {
        if shipper.status().await.is_some_and(|status| condition(&status)) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

pub fn archive_drained(status: &PipelineStatus) -> bool {
    status.archive_empty && !status.archive_in_flight
}
