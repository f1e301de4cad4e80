//! Network layer for the journal service
//!
//! This module contains the HTTP API and the Unix-socket server runtime for
//! the `server` subcommand.

pub mod http_api;

use std::error::Error;
use std::sync::Arc;

use tracing::{error, info};

use crate::backend::Journal;
use crate::server::http_api::create_router;

/// Bind the Unix socket and serve the journal API until shutdown.
///
/// A stale socket left by a previous instance is unlinked before binding.
pub async fn run_server(
    journal: Arc<Journal>,
    unixsocket: &str,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    match std::fs::remove_file(unixsocket) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(Box::<dyn Error + Send + Sync>::from(format!(
                "Failed to unlink stale socket {unixsocket}: {e}"
            )))
        }
    }

    let app = create_router(journal);
    let listener = tokio::net::UnixListener::bind(unixsocket)
        .map_err(|e| Box::<dyn Error + Send + Sync>::from(format!("Listener error: {e}")))?;

    info!("🚀 Journal server listening on {}", unixsocket);

    tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(e) = result {
                error!("Server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("🛑 Received shutdown signal, shutting down gracefully");
        }
    }

    let _ = std::fs::remove_file(unixsocket);
    Ok(())
}
