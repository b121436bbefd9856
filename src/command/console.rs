use anyhow::Result;
use std::io::Write;
use std::thread;
use std::time::Duration;

use super::args::ClientArgs;
use crate::sandbox::rpc::{RpcClient, RpcRequest, RpcResponse};
use crate::sandbox::supervisor::{BOT_OFF_MESSAGE, SandboxStatus};

const FOLLOW_INTERVAL: Duration = Duration::from_millis(500);

/// Print the drained console. With `follow`, keep polling until the
/// sandbox has no live process and nothing left to print.
pub fn run(client: &ClientArgs, id: &str, follow: bool) -> Result<()> {
    let mut client = client.client()?;
    let mut stdout = std::io::stdout();

    loop {
        let content = fetch(&mut client, id)?;
        if content == BOT_OFF_MESSAGE {
            if !follow {
                println!("{content}");
            }
            return Ok(());
        }

        write!(stdout, "{content}")?;
        stdout.flush()?;

        if !follow {
            println!();
            return Ok(());
        }
        if content.is_empty() && !is_live(&mut client, id)? {
            println!();
            return Ok(());
        }
        thread::sleep(FOLLOW_INTERVAL);
    }
}

fn fetch(client: &mut RpcClient, id: &str) -> Result<String> {
    let response = client.call(&RpcRequest::ConsoleSnapshot { id: id.to_string() })?;
    match response {
        RpcResponse::Console { content } => Ok(content),
        other => Err(super::unexpected(other)),
    }
}

fn is_live(client: &mut RpcClient, id: &str) -> Result<bool> {
    let response = client.call(&RpcRequest::Status { id: id.to_string() })?;
    match response {
        RpcResponse::Status { status } => Ok(matches!(
            status,
            Some(SandboxStatus::Spawned { .. } | SandboxStatus::Running { .. })
        )),
        other => Err(super::unexpected(other)),
    }
}
