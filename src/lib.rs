//! An embeddable SMTP/LMTP protocol core.
//!
//! Wires together the [`transport`] layer, the [`proxy`] and [`auth`]
//! parsers/engines, the [`model`] types, and the [`dispatcher`] state machine
//! behind a single [`server::Server`] frontend. Embedders supply policy by
//! implementing [`handler::Handler`]; `smtp_core` supplies the protocol.

pub mod auth;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod model;
pub mod proxy;
pub mod server;
pub mod transport;

use std::sync::Arc;

use anyhow::Result;
use log::{error, info};
use tokio_util::sync::CancellationToken;

use handler::Handler;
use server::Server;

/// Runs a `smtp_core` server with the given handler until `shutdown` fires
/// or a fatal startup error occurs (bad TLS material, unbindable address).
///
/// Configuration is loaded from `SMTP_CORE_*` environment variables; see
/// [`config::Config::from_env`].
pub async fn run(handler: Arc<dyn Handler>, shutdown: CancellationToken) -> Result<()> {
    let config = config::Config::from_env()?;
    info!(
        "Starting {} v{} ({})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        if config.lmtp_mode { "LMTP" } else { "SMTP" }
    );

    let server = Server::new(config, handler, shutdown);
    if let Err(e) = server.run().await {
        error!("server exited with error: {}", e);
        return Err(e.into());
    }
    Ok(())
}
