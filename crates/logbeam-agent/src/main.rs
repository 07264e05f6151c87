// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;
use std::fs;
use std::path::Path;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use logbeam::{ApplicationInfo, Config, LogEvent, LogLevel, Shipper};

const DEVICE_ID_FILE: &str = "device-id";
const STDIN_LABEL: &str = "stdin";

#[tokio::main]
pub async fn main() {
    let log_level = env::var("LOGBEAM_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());
    let env_filter = format!("h2=off,hyper=off,rustls=off,tungstenite=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    if let Err(e) = run().await {
        error!("logbeam agent stopped: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = Config::from_env().context("invalid configuration")?;
    fs::create_dir_all(&config.storage_dir).with_context(|| {
        format!(
            "could not create storage directory {}",
            config.storage_dir.display()
        )
    })?;
    let app = application_info(&config.storage_dir)?;
    info!("Starting logbeam agent as sender {}", app.sender_id());

    let has_endpoint = config.endpoint.is_some();
    let live_enabled = config.live_enabled;
    let shipper = Shipper::start(config, app)
        .await
        .context("could not start log pipeline")?;

    if has_endpoint {
        match shipper.connect().await {
            Ok(()) => info!("Connected to collector"),
            Err(e) => warn!("Collector unavailable, records will be archived: {e}"),
        }
        if live_enabled {
            if let Err(e) = shipper.start_live().await {
                debug!("Live channel not started: {e}");
            }
        }
    } else {
        info!("No collector endpoint configured, records will be archived locally");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !line.is_empty() {
                        shipper.log(LogEvent::new(LogLevel::Info, STDIN_LABEL, line));
                    }
                }
                Ok(None) => {
                    debug!("Reached end of input");
                    break;
                }
                Err(e) => {
                    error!("Failed to read from stdin: {e}");
                    break;
                }
            },
        }
    }

    if let Some(status) = shipper.status().await {
        debug!(
            "Shutting down with connection {} and {} delivered batches",
            status.connection, status.delivered_batches
        );
    }
    shipper.shutdown().await;
    Ok(())
}

/// Reads the host facts from the environment. The device id is generated once
/// and kept in the storage directory so positions and sender id stay stable.
fn application_info(storage_dir: &Path) -> anyhow::Result<ApplicationInfo> {
    let device_id = match env::var("LOGBEAM_DEVICE_ID") {
        Ok(id) if !id.is_empty() => id,
        _ => persisted_device_id(storage_dir)?,
    };
    Ok(ApplicationInfo {
        app_id: env::var("LOGBEAM_APP_ID").unwrap_or_else(|_| "logbeam-agent".to_string()),
        version: env!("CARGO_PKG_VERSION").to_string(),
        build: env::var("LOGBEAM_APP_BUILD").unwrap_or_default(),
        os: env::consts::OS.to_string(),
        device_model: env::consts::ARCH.to_string(),
        device_id,
    })
}

fn persisted_device_id(storage_dir: &Path) -> anyhow::Result<String> {
    let path = storage_dir.join(DEVICE_ID_FILE);
    match fs::read_to_string(&path) {
        Ok(id) if !id.trim().is_empty() => return Ok(id.trim().to_string()),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("could not read {}", path.display()));
        }
    }
    let id = Uuid::new_v4().to_string();
    fs::write(&path, &id).with_context(|| format!("could not write {}", path.display()))?;
    Ok(id)
}
