use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::runtime::{DEFAULT_SERVER_HOST, DEFAULT_SERVER_PORT};
use crate::sandbox::console::DEFAULT_CONSOLE_LIMIT;

pub const DEFAULT_LISTEN: &str = "127.0.0.1:7878";
pub const DEFAULT_WORKSPACE_ROOT: &str = "workspaces";

/// Game server the bots connect to.
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct ServerConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

impl ServerConfig {
    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or(DEFAULT_SERVER_HOST)
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_SERVER_PORT)
    }
}

/// Configuration for the supervisor, read from botvisor.yaml
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct Config {
    /// Address the RPC server listens on (default 127.0.0.1:7878)
    #[serde(default)]
    pub listen: Option<String>,

    /// Shared RPC secret. A random one is generated at startup if unset.
    #[serde(default)]
    pub token: Option<String>,

    /// Directory holding one workspace per sandbox (default `workspaces`)
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,

    /// Maximum console length in characters
    #[serde(default)]
    pub console_limit: Option<usize>,

    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// Load and merge global and project configurations, then apply
    /// environment overrides.
    pub fn load() -> anyhow::Result<Self> {
        debug!("config:loading");
        let global_config = Self::load_global()?.unwrap_or_default();
        let project_config = Self::load_from_path(Path::new("botvisor.yaml"))?.unwrap_or_default();

        let config = global_config
            .merge(project_config)
            .with_overrides(|key| std::env::var(key).ok())?;

        debug!(
            listen = config.listen(),
            workspace_root = %config.workspace_root().display(),
            has_token = config.token.is_some(),
            "config:loaded"
        );
        Ok(config)
    }

    /// Load configuration from a specific path.
    fn load_from_path(path: &Path) -> anyhow::Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        debug!(path = %path.display(), "config:reading file");
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("Failed to parse config at {}: {}", path.display(), e))?;
        Ok(Some(config))
    }

    /// Load the global configuration file from the XDG config directory.
    fn load_global() -> anyhow::Result<Option<Self>> {
        if let Some(home_dir) = home::home_dir() {
            for name in ["config.yaml", "config.yml"] {
                let path = home_dir.join(".config/botvisor").join(name);
                if path.exists() {
                    return Self::load_from_path(&path);
                }
            }
        }
        Ok(None)
    }

    /// Merge a project config into a global config. Project values win.
    fn merge(self, project: Self) -> Self {
        Self {
            listen: project.listen.or(self.listen),
            token: project.token.or(self.token),
            workspace_root: project.workspace_root.or(self.workspace_root),
            console_limit: project.console_limit.or(self.console_limit),
            server: ServerConfig {
                host: project.server.host.or(self.server.host),
                port: project.server.port.or(self.server.port),
            },
        }
    }

    /// Apply `BOTVISOR_*` and `MINECRAFT_*` environment overrides.
    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |key: &str| lookup(key).filter(|value| !value.is_empty());

        if let Some(listen) = var("BOTVISOR_LISTEN") {
            self.listen = Some(listen);
        }
        if let Some(token) = var("BOTVISOR_TOKEN") {
            self.token = Some(token);
        }
        if let Some(root) = var("BOTVISOR_WORKSPACES") {
            self.workspace_root = Some(PathBuf::from(root));
        }
        if let Some(host) = var("MINECRAFT_HOST") {
            self.server.host = Some(host);
        }
        if let Some(port) = var("MINECRAFT_PORT") {
            let port = port
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid MINECRAFT_PORT `{port}`"))?;
            self.server.port = Some(port);
        }
        Ok(self)
    }

    pub fn listen(&self) -> &str {
        self.listen.as_deref().unwrap_or(DEFAULT_LISTEN)
    }

    pub fn workspace_root(&self) -> PathBuf {
        self.workspace_root
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKSPACE_ROOT))
    }

    /// Console cap; zero is treated as unset.
    pub fn console_limit(&self) -> usize {
        match self.console_limit {
            Some(limit) if limit > 0 => limit,
            _ => DEFAULT_CONSOLE_LIMIT,
        }
    }
}
