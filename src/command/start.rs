use anyhow::{Context, Result, bail};
use std::fs;
use std::path::PathBuf;

use super::args::ClientArgs;
use crate::sandbox::rpc::{RpcRequest, RpcResponse};
use crate::sandbox::supervisor::{ALREADY_STARTED_MESSAGE, StartOutcome, StartRequest};

pub struct StartArgs {
    pub id: String,
    pub script: PathBuf,
    pub name: String,
    pub auth: Option<String>,
    pub password: Option<String>,
    pub parameter: Option<String>,
}

pub fn run(client: &ClientArgs, args: StartArgs) -> Result<()> {
    let request = build_request(args)?;
    let id = request.id.clone();

    let response = client.client()?.call(&RpcRequest::StartScript(request))?;
    let RpcResponse::Started { outcome } = response else {
        return Err(super::unexpected(response));
    };

    match outcome {
        StartOutcome::Started { pid } => {
            println!("Started {id} (pid {pid})");
            Ok(())
        }
        StartOutcome::Rejected => bail!("{ALREADY_STARTED_MESSAGE}"),
        StartOutcome::Failed { message } => bail!("{message}"),
    }
}

fn build_request(args: StartArgs) -> Result<StartRequest> {
    let script = fs::read_to_string(&args.script)
        .with_context(|| format!("Failed to read script {}", args.script.display()))?;
    let parameter = args
        .parameter
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .context("--parameter must be valid JSON")?;

    Ok(StartRequest {
        id: args.id,
        script,
        name: args.name,
        auth: args.auth,
        password: args.password,
        parameter,
    })
}
