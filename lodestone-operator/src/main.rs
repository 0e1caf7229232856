//! The Lodestone operator.

mod adapters;
mod app;
mod backends;
mod config;
mod controller;
#[cfg(test)]
mod fixtures;
mod names;
#[cfg(test)]
mod names_test;
mod sync;
mod tracker;
#[cfg(test)]
mod tracker_test;

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::prelude::*;

use crate::app::App;
use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Setup tracing/logging system.
    tracing_subscriber::registry()
        // Filter spans based on the RUST_LOG env var.
        .with(tracing_subscriber::EnvFilter::from_default_env())
        // Send a copy of all spans to stdout in compact form.
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_ansi(true),
        )
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging/tracing system")?;

    let cfg = Arc::new(Config::new()?);
    tracing::info!(namespace = %cfg.namespace, "starting Lodestone Operator");
    if let Err(err) = App::new(cfg).await?.spawn().await.context("error joining app handle").and_then(|res| res) {
        tracing::error!(error = ?err);
    }

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    Ok(())
}
