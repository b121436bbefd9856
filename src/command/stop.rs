use anyhow::Result;

use super::args::ClientArgs;
use crate::sandbox::rpc::RpcRequest;

pub fn run(client: &ClientArgs, id: &str) -> Result<()> {
    let response = client.client()?.call(&RpcRequest::StopScript { id: id.to_string() })?;
    super::expect_ok(response)?;
    println!("Stopped {id}");
    Ok(())
}
