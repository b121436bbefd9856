use anyhow::Result;

use super::args::ClientArgs;
use crate::sandbox::rpc::{RpcRequest, RpcResponse};
use crate::sandbox::supervisor::BOT_OFF_MESSAGE;

pub fn run(client: &ClientArgs, id: &str) -> Result<()> {
    let response = client.client()?.call(&RpcRequest::Status { id: id.to_string() })?;
    match response {
        RpcResponse::Status { status: Some(status) } => println!("{id}: {status}"),
        RpcResponse::Status { status: None } => println!("{id}: {BOT_OFF_MESSAGE}"),
        other => return Err(super::unexpected(other)),
    }
    Ok(())
}
