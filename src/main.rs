use std::sync::Arc;

use tracing::{error, info};

use filedock::web::WebServer;
use filedock::{Backend, Config};

#[tokio::main]
async fn main() {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());

    // Load configuration
    let config = match Config::load_with_env(&path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {path}: {e}");
            std::process::exit(1);
        }
    };

    // Initialize logging
    if let Err(e) = filedock::logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
        // Fall back to console-only logging
        filedock::logging::init_console_only(&config.logging.level);
    }

    info!("FileDock - file manager connector");

    let backend = match Backend::build(&config) {
        Ok(backend) => backend,
        Err(e) => {
            error!(error = %e, "Failed to start connector");
            std::process::exit(1);
        }
    };

    let server = match WebServer::new(&config.server, Arc::clone(backend.connector())) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "Invalid server configuration");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!(error = %e, "Web server stopped");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }
}
