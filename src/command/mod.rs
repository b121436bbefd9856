pub mod args;
pub mod console;
pub mod entrypoint;
pub mod list;
pub mod serve;
pub mod start;
pub mod status;
pub mod stop;

use anyhow::{Result, anyhow};

use crate::sandbox::rpc::RpcResponse;

/// Turn a response of the wrong shape into an error.
pub(crate) fn unexpected(response: RpcResponse) -> anyhow::Error {
    anyhow!("Unexpected response from supervisor: {response:?}")
}

/// Expect a bare `Ok` acknowledgement.
pub(crate) fn expect_ok(response: RpcResponse) -> Result<()> {
    match response {
        RpcResponse::Ok => Ok(()),
        other => Err(unexpected(other)),
    }
}
