// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Client-side log shipping.
//!
//! Events are redacted under the current sensitivity policy, numbered by the
//! [`sequencer`], staged in a lossy live ring and a durable archive
//! ([`buffer`]), and delivered by the [`dispatcher`] through a [`transport`]
//! to a remote collector. [`server`] streams records to viewers on the LAN and
//! [`discovery`] advertises and resolves endpoints there. [`shipper`] wires
//! it all together.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod backoff;
pub mod buffer;
pub mod config;
pub mod discovery;
pub mod dispatcher;
pub mod errors;
pub mod http;
pub mod record;
pub mod redaction;
pub mod sequencer;
pub mod server;
pub mod shipper;
pub mod transport;
pub mod wire;

pub use config::Config;
pub use record::{ApplicationInfo, LogLevel, LogRecord, SourceLocation};
pub use redaction::{FieldTag, LogEvent, LogField, LogMessage, LogValue, Loggable};
pub use shipper::Shipper;
