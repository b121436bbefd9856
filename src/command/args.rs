use anyhow::{Result, anyhow};

use crate::config::Config;
use crate::sandbox::rpc::RpcClient;

/// Connection options shared by every command that talks to a running
/// supervisor.
#[derive(clap::Args, Debug)]
pub struct ClientArgs {
    /// Supervisor address (defaults to the configured `listen` address)
    #[arg(long, env = "BOTVISOR_CONNECT")]
    pub connect: Option<String>,

    /// RPC token printed by `botvisor serve`
    #[arg(long, env = "BOTVISOR_TOKEN", hide_env_values = true)]
    pub token: Option<String>,
}

impl ClientArgs {
    /// Resolve address and token against the config, then connect.
    pub fn client(&self) -> Result<RpcClient> {
        let config = Config::load()?;
        let (addr, token) = self.resolve(&config)?;
        RpcClient::connect(&addr, &token)
    }

    fn resolve(&self, config: &Config) -> Result<(String, String)> {
        let addr = self
            .connect
            .clone()
            .unwrap_or_else(|| config.listen().to_string());
        let token = self
            .token
            .clone()
            .or_else(|| config.token.clone())
            .ok_or_else(|| {
                anyhow!("No RPC token: pass --token, set BOTVISOR_TOKEN or configure `token`")
            })?;
        Ok((addr, token))
    }
}
