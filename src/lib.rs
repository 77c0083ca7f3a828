//! Turkis - zero-downtime deployments for a single Docker host
//!
//! The monitor in this crate:
//! - Watches container lifecycle events on the shared `turkis-public` network
//! - Reconciles a per-application "winning deployment" view from container labels
//! - Renders and atomically publishes the HAProxy configuration, then reloads it
//! - Keeps Let's Encrypt certificates fresh for every advertised domain
//! - Hot-reloads renewed certificates through the HAProxy admin socket
//! - Answers ACME HTTP-01 challenges on an internal port behind the proxy

pub mod acme;
pub mod challenge;
pub mod config;
pub mod docker;
pub mod error;
pub mod haproxy;
pub mod labels;
pub mod monitor;
pub mod proxy_config;
pub mod registry;
