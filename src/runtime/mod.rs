//! The bot runtime: what executes inside a sandbox process.
//!
//! The supervisor re-invokes the botvisor binary with the hidden
//! `_entrypoint` subcommand. The runtime reads its identity from the
//! environment, loads the staged script and hands control to its `main`
//! function. Everything it prints ends up in the sandbox console.

pub mod connection;
pub mod loader;

use mlua::{Lua, LuaSerdeExt, Value, Variadic};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use crate::sandbox::control::{CONTROL_FD_ENV, ControlClient, ControlMessage};
use crate::sandbox::supervisor::WORKSPACE_ROOT_ENV;
use crate::sandbox::workspace::{WorkspaceError, WorkspaceStore};
use connection::ConnectionFactory;
use loader::LoadError;

pub const DEFAULT_SERVER_HOST: &str = "localhost";
pub const DEFAULT_SERVER_PORT: u16 = 25565;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Missing environment variable `{0}`")]
    MissingVar(&'static str),

    #[error("Invalid port `{0}`")]
    InvalidPort(String),

    #[error("Invalid parameter JSON: {0}")]
    InvalidParameter(#[source] serde_json::Error),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("Failed to prepare script environment: {0}")]
    Setup(#[source] mlua::Error),

    #[error("Script failed: {0}")]
    Script(#[source] mlua::Error),
}

impl RuntimeError {
    /// Process exit code: 1 when the script itself failed, 2 when it never
    /// got to run.
    pub fn exit_code(&self) -> i32 {
        match self {
            RuntimeError::Script(_) => 1,
            _ => 2,
        }
    }
}

/// Configuration handed to the runtime by the supervisor.
#[derive(Debug, Clone)]
pub struct RuntimeEnv {
    pub id: String,
    pub name: String,
    pub auth: Option<String>,
    pub password: Option<String>,
    pub parameter: Option<serde_json::Value>,
    pub host: String,
    pub port: u16,
    pub workspace_root: PathBuf,
}

impl RuntimeEnv {
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, RuntimeError> {
        let optional = |key: &str| lookup(key).filter(|value| !value.is_empty());

        let id = optional("id").ok_or(RuntimeError::MissingVar("id"))?;
        let name = optional("name").ok_or(RuntimeError::MissingVar("name"))?;

        let parameter = optional("parameter")
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(RuntimeError::InvalidParameter)?;

        let port = match optional("port") {
            Some(raw) => raw.parse().map_err(|_| RuntimeError::InvalidPort(raw))?,
            None => DEFAULT_SERVER_PORT,
        };

        Ok(Self {
            id,
            name,
            auth: optional("auth"),
            password: optional("password"),
            parameter,
            host: optional("host").unwrap_or_else(|| DEFAULT_SERVER_HOST.to_string()),
            port,
            workspace_root: optional(WORKSPACE_ROOT_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("workspaces")),
        })
    }
}

/// Run the runtime and return the process exit code.
pub fn run() -> i32 {
    match execute(|key| std::env::var(key).ok()) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("{e}");
            e.exit_code()
        }
    }
}

fn execute(lookup: impl Fn(&str) -> Option<String>) -> Result<(), RuntimeError> {
    let env = RuntimeEnv::from_lookup(&lookup)?;
    let script_path = WorkspaceStore::new(&env.workspace_root).script_path(&env.id)?;

    let lua = Lua::new();
    install_globals(&lua).map_err(RuntimeError::Setup)?;
    let entry = loader::load(&lua, &script_path)?;

    let connect = ConnectionFactory::new(&env)
        .into_lua_function(&lua)
        .map_err(RuntimeError::Setup)?;
    let parameter = match &env.parameter {
        Some(value) => lua.to_value(value).map_err(RuntimeError::Setup)?,
        None => Value::Nil,
    };

    let control = open_control(lookup(CONTROL_FD_ENV).as_deref());
    if let Some(client) = &control {
        let ready = ControlMessage::Ready {
            pid: std::process::id(),
        };
        if let Err(e) = lock(client).send(&ready) {
            eprintln!("control channel unavailable: {e:#}");
        }
    }
    install_log(&lua, control).map_err(RuntimeError::Setup)?;

    entry.call(connect, parameter).map_err(RuntimeError::Script)
}

/// The channel is optional, so failures only go to stderr.
fn open_control(raw_fd: Option<&str>) -> Option<Arc<Mutex<ControlClient>>> {
    match ControlClient::from_var(raw_fd) {
        Ok(client) => client.map(|client| Arc::new(Mutex::new(client))),
        Err(e) => {
            eprintln!("control channel unavailable: {e:#}");
            None
        }
    }
}

fn lock(client: &Mutex<ControlClient>) -> MutexGuard<'_, ControlClient> {
    client.lock().unwrap_or_else(PoisonError::into_inner)
}

/// `log(...)` sends a diagnostic to the supervisor's log instead of the
/// console. Without a control channel it falls back to stderr.
fn install_log(lua: &Lua, control: Option<Arc<Mutex<ControlClient>>>) -> mlua::Result<()> {
    let log = lua.create_function(move |_, values: Variadic<Value>| {
        let message = render_line(&values)?;
        let sent = control.as_ref().is_some_and(|client| {
            lock(client)
                .send(&ControlMessage::Log {
                    message: message.clone(),
                })
                .is_ok()
        });
        if !sent {
            eprintln!("{message}");
        }
        Ok(())
    })?;
    lua.globals().set("log", log)
}

/// Replace `print` with a line-flushing version and add `sleep(seconds)`.
///
/// Stdout is a pipe inside a sandbox, so the stock `print` would sit in a
/// block buffer until the script exits.
fn install_globals(lua: &Lua) -> mlua::Result<()> {
    let print = lua.create_function(|_, values: Variadic<Value>| {
        let line = render_line(&values)?;
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{line}")
            .and_then(|()| stdout.flush())
            .map_err(mlua::Error::external)
    })?;
    lua.globals().set("print", print)?;

    let sleep = lua.create_function(|_, seconds: f64| {
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(mlua::Error::external(format!(
                "sleep expects a non-negative number of seconds, got {seconds}"
            )));
        }
        thread::sleep(Duration::from_secs_f64(seconds));
        Ok(())
    })?;
    lua.globals().set("sleep", sleep)?;

    Ok(())
}

/// Format `print` arguments the way Lua does: `tostring` of each, tab separated.
fn render_line(values: &[Value]) -> mlua::Result<String> {
    let parts = values
        .iter()
        .map(|value| value.to_string())
        .collect::<mlua::Result<Vec<_>>>()?;
    Ok(parts.join("\t"))
}
