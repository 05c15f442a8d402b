use std::sync::Arc;

use log::error;
use tokio_util::sync::CancellationToken;

#[path = "../demos/echo_handler.rs"]
mod echo_handler;

#[tokio::main]
async fn main() {
    env_logger::init_from_env(env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"));

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_shutdown.cancel();
        }
    });

    let handler: Arc<dyn smtp_core::handler::Handler> = Arc::new(echo_handler::EchoHandler::default());

    if let Err(e) = smtp_core::run(handler, shutdown).await {
        error!("Application error: {}", e);
        std::process::exit(1);
    }
}
