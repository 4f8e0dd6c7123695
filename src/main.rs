//! Edge node entry point.

use bmcl_edge::config::EdgeConfig;
use std::path::Path;
use tracing::error;

#[tokio::main]
async fn main() {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.json".to_string());
    let config = match EdgeConfig::from_file(Path::new(&config_path)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("cannot load {}: {}", config_path, e);
            std::process::exit(1);
        }
    };

    if let Err(e) = bmcl_edge::observability::init(&config.observability) {
        eprintln!("cannot initialize logging: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = bmcl_edge::run(config).await {
        error!(error = %e, "edge node failed");
        std::process::exit(1);
    }
}
