use anyhow::{Context, Result};
use std::sync::Arc;
use std::sync::mpsc;
use tracing::info;

use crate::config::Config;
use crate::sandbox::rpc::{self, RpcContext, RpcServer};
use crate::sandbox::supervisor::{RuntimeCommand, ServerTarget, Supervisor, SupervisorOptions};

/// Run the supervisor until Ctrl-C, then stop every sandbox.
pub fn run(listen: Option<&str>) -> Result<()> {
    let config = Config::load()?;
    let listen = listen.unwrap_or(config.listen());

    let supervisor = Arc::new(Supervisor::new(SupervisorOptions {
        workspace_root: config.workspace_root(),
        runtime: RuntimeCommand::current_exe()?,
        server: ServerTarget {
            host: config.server.host().to_string(),
            port: config.server.port(),
        },
        console_limit: config.console_limit(),
    })?);

    let token = match &config.token {
        Some(token) => token.clone(),
        None => rpc::generate_token()?,
    };

    let server = RpcServer::bind(listen)?;
    let addr = server.local_addr();
    server.spawn(Arc::new(RpcContext {
        supervisor: Arc::clone(&supervisor),
        token: token.clone(),
    }));

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("Failed to install Ctrl-C handler")?;

    info!(
        %addr,
        workspace_root = %supervisor.workspace_root().display(),
        "serve:listening"
    );
    println!("botvisor listening on {addr}");
    println!("workspaces: {}", supervisor.workspace_root().display());
    if config.token.is_none() {
        println!("token: {token}");
    }

    let _ = rx.recv();

    println!("Stopping all sandboxes...");
    supervisor.shutdown();
    info!("serve:stopped");
    Ok(())
}
