mod cli;
mod command;
mod config;
mod logger;
mod runtime;
mod sandbox;

use anyhow::Result;
use tracing::{error, info};

fn main() -> Result<()> {
    // Sandbox runtimes write only to their console
    if cli::is_entrypoint() {
        return cli::run();
    }

    logger::init()?;
    info!(command = ?std::env::args().nth(1), "botvisor start");

    match cli::run() {
        Ok(result) => {
            info!("botvisor finished successfully");
            Ok(result)
        }
        Err(err) => {
            error!(error = ?err, "botvisor failed");
            Err(err)
        }
    }
}
