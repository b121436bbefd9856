//! Process supervisor for bot sandboxes.
//!
//! Owns the registry of sandboxes keyed by id, turns a start request into a
//! staged workspace plus a runtime child process, pumps the child's output
//! into its console and reclaims everything on stop.
//!
//! The supervisor never reports failures to its caller as errors. Staging
//! and spawn failures, as well as rejected duplicate starts, are recorded as
//! a process-less sandbox whose console explains what happened.

use anyhow::{Context, Result};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io::Read;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::console::{ConsoleBuffer, DEFAULT_CONSOLE_LIMIT};
use super::control::{self, ControlMessage};
use super::workspace::WorkspaceStore;

/// Console text for an id with no sandbox.
pub const BOT_OFF_MESSAGE: &str = "The bot is off";

/// Console text left behind by a rejected duplicate start.
pub const ALREADY_STARTED_MESSAGE: &str = "Failed to start bot:\nAlready started?";

/// Environment variable telling the runtime where workspaces live.
pub const WORKSPACE_ROOT_ENV: &str = "BOTVISOR_WORKSPACE_ROOT";

/// How often the reaper thread checks whether its child has exited.
const REAP_INTERVAL: Duration = Duration::from_millis(50);

/// Everything needed to launch one bot script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    pub id: String,
    pub script: String,
    pub name: String,
    #[serde(default)]
    pub auth: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub parameter: Option<serde_json::Value>,
}

/// Lifecycle state of a registered sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SandboxStatus {
    /// A duplicate start replaced whatever was registered before.
    Rejected,
    /// Staging or spawning failed; the console holds the reason.
    Failed,
    /// The runtime process exists but has not reported readiness yet.
    Spawned { pid: u32 },
    /// The runtime loaded the script and entered its main function.
    Running { pid: u32 },
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
    },
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxStatus::Rejected => write!(f, "rejected"),
            SandboxStatus::Failed => write!(f, "failed"),
            SandboxStatus::Spawned { pid } => write!(f, "spawned (pid {pid})"),
            SandboxStatus::Running { pid } => write!(f, "running (pid {pid})"),
            SandboxStatus::Exited {
                code: Some(code), ..
            } => write!(f, "exited (code {code})"),
            SandboxStatus::Exited {
                signal: Some(signal),
                ..
            } => write!(f, "exited (signal {signal})"),
            SandboxStatus::Exited { .. } => write!(f, "exited"),
        }
    }
}

/// Result of a start request, available as soon as `start` returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum StartOutcome {
    Started { pid: u32 },
    Rejected,
    Failed { message: String },
}

/// Program (and leading arguments) spawned for every sandbox.
#[derive(Debug, Clone)]
pub struct RuntimeCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl RuntimeCommand {
    /// Re-invoke the running binary in runtime mode.
    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe().context("Failed to locate the botvisor binary")?;
        Ok(Self {
            program,
            args: vec![crate::cli::ENTRYPOINT_COMMAND.to_string()],
        })
    }
}

/// Game server the runtime connects bots to.
#[derive(Debug, Clone)]
pub struct ServerTarget {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub workspace_root: PathBuf,
    pub runtime: RuntimeCommand,
    pub server: ServerTarget,
    pub console_limit: usize,
}

struct Sandbox {
    console: Arc<Mutex<ConsoleBuffer>>,
    status: Arc<Mutex<SandboxStatus>>,
    process: Option<ProcessHandle>,
}

impl Sandbox {
    /// A sandbox without a process whose console holds a single message.
    fn detached(message: &str, status: SandboxStatus, limit: usize) -> Self {
        Self {
            console: Arc::new(Mutex::new(ConsoleBuffer::with_message(message, limit))),
            status: Arc::new(Mutex::new(status)),
            process: None,
        }
    }
}

struct ProcessHandle {
    pid: u32,
    child: Arc<Mutex<Child>>,
}

impl ProcessHandle {
    fn is_running(&self) -> bool {
        matches!(lock(&self.child).try_wait(), Ok(None))
    }

    /// Ask the process to terminate. A process that already exited counts as
    /// terminated.
    fn terminate(&self) -> Result<()> {
        // Holding the child lock keeps the reaper from reaping the pid
        // between the liveness check and the signal.
        let mut child = lock(&self.child);
        if child
            .try_wait()
            .context("Failed to query process state")?
            .is_some()
        {
            return Ok(());
        }
        let pid = i32::try_from(self.pid).context("Process id out of range")?;
        signal::kill(Pid::from_raw(pid), Signal::SIGTERM)
            .with_context(|| format!("Failed to signal process {}", self.pid))
    }
}

pub struct Supervisor {
    workspaces: WorkspaceStore,
    runtime: RuntimeCommand,
    server: ServerTarget,
    console_limit: usize,
    registry: Mutex<HashMap<String, Sandbox>>,
    /// Serializes starts so two requests for one id cannot both pass the
    /// duplicate check while staging.
    start_lock: Mutex<()>,
}

impl Supervisor {
    pub fn new(options: SupervisorOptions) -> Result<Self> {
        // The runtime resolves scripts from its own cwd, so the root must be
        // absolute.
        let root = std::path::absolute(&options.workspace_root).with_context(|| {
            format!(
                "Failed to resolve workspace root {}",
                options.workspace_root.display()
            )
        })?;
        let console_limit = if options.console_limit == 0 {
            DEFAULT_CONSOLE_LIMIT
        } else {
            options.console_limit
        };
        info!(root = %root.display(), runtime = %options.runtime.program.display(), "supervisor:init");

        Ok(Self {
            workspaces: WorkspaceStore::new(root),
            runtime: options.runtime,
            server: options.server,
            console_limit,
            registry: Mutex::new(HashMap::new()),
            start_lock: Mutex::new(()),
        })
    }

    pub fn workspace_root(&self) -> &Path {
        self.workspaces.root()
    }

    /// Start a sandbox for `request.id`.
    ///
    /// Any existing entry for the id, live or not, is replaced by a rejected
    /// sandbox carrying [`ALREADY_STARTED_MESSAGE`].
    pub fn start(&self, request: StartRequest) -> StartOutcome {
        let _serial = lock(&self.start_lock);
        let id = request.id.clone();

        {
            let mut registry = self.lock_registry();
            if let Some(previous) = registry.get(&id) {
                if let Some(process) = &previous.process
                    && process.is_running()
                {
                    warn!(id = %id, pid = process.pid, "sandbox:duplicate start orphans running process");
                } else {
                    info!(id = %id, "sandbox:duplicate start rejected");
                }
                registry.insert(
                    id,
                    Sandbox::detached(
                        ALREADY_STARTED_MESSAGE,
                        SandboxStatus::Rejected,
                        self.console_limit,
                    ),
                );
                return StartOutcome::Rejected;
            }
        }

        info!(
            id = %id,
            name = %request.name,
            auth = ?request.auth,
            has_parameter = request.parameter.is_some(),
            "sandbox:starting"
        );

        match self.launch(&request) {
            Ok(sandbox) => {
                let pid = sandbox.process.as_ref().map(|p| p.pid).unwrap_or_default();
                info!(id = %id, pid, "sandbox:started");
                self.lock_registry().insert(id, sandbox);
                StartOutcome::Started { pid }
            }
            Err(e) => {
                let message = format!("{e:#}");
                warn!(id = %id, error = %message, "sandbox:start failed");
                self.lock_registry().insert(
                    id,
                    Sandbox::detached(
                        &format!("Failed to start bot:\n{message}"),
                        SandboxStatus::Failed,
                        self.console_limit,
                    ),
                );
                StartOutcome::Failed { message }
            }
        }
    }

    fn launch(&self, request: &StartRequest) -> Result<Sandbox> {
        let dir = self
            .workspaces
            .stage(&request.id, &request.script)
            .context("Failed to stage script")?;

        let mut cmd = Command::new(&self.runtime.program);
        cmd.args(&self.runtime.args)
            .current_dir(&dir)
            .env("id", &request.id)
            .env("name", &request.name)
            .env("host", &self.server.host)
            .env("port", self.server.port.to_string())
            .env(WORKSPACE_ROOT_ENV, self.workspaces.root())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Optional values are removed rather than inherited when absent
        for (key, value) in [("auth", &request.auth), ("password", &request.password)] {
            match value {
                Some(value) => cmd.env(key, value),
                None => cmd.env_remove(key),
            };
        }
        match &request.parameter {
            Some(parameter) => {
                let json =
                    serde_json::to_string(parameter).context("Failed to encode parameter")?;
                cmd.env("parameter", json);
            }
            None => {
                cmd.env_remove("parameter");
            }
        }

        let (control_end, child_end) = control::pair()?;
        control::attach(&mut cmd, &child_end);

        debug!(id = %request.id, program = %self.runtime.program.display(), args = ?self.runtime.args, "sandbox:spawn");
        let mut child = cmd.spawn().with_context(|| {
            format!(
                "Failed to spawn runtime {}",
                self.runtime.program.display()
            )
        })?;
        drop(child_end);

        let pid = child.id();
        let console = Arc::new(Mutex::new(ConsoleBuffer::new(self.console_limit)));
        let status = Arc::new(Mutex::new(SandboxStatus::Spawned { pid }));

        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(spawn_pump(stdout, Arc::clone(&console)));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(spawn_pump(stderr, Arc::clone(&console)));
        }

        let ready_status = Arc::clone(&status);
        let control_id = request.id.clone();
        control::spawn_reader(request.id.clone(), control_end, move |message| {
            match message {
                ControlMessage::Ready { pid: reported } => {
                    let mut status = lock(&ready_status);
                    if let SandboxStatus::Spawned { pid } = *status {
                        debug!(id = %control_id, pid, reported, "sandbox:ready");
                        *status = SandboxStatus::Running { pid };
                    }
                }
                ControlMessage::Log { message } => {
                    info!(id = %control_id, message = %message, "sandbox:runtime log");
                }
            }
        });

        let child = Arc::new(Mutex::new(child));
        spawn_reaper(
            request.id.clone(),
            Arc::clone(&child),
            pumps,
            Arc::clone(&console),
            Arc::clone(&status),
        );

        Ok(Sandbox {
            console,
            status,
            process: Some(ProcessHandle { pid, child }),
        })
    }

    /// Stop the sandbox for `id` and reclaim its workspace.
    ///
    /// The registry entry is removed before the process is signalled. If the
    /// signal cannot be delivered the workspace is left in place.
    pub fn stop(&self, id: &str) {
        let Some(sandbox) = self.lock_registry().remove(id) else {
            debug!(id, "sandbox:stop ignored, not registered");
            return;
        };
        info!(id, "sandbox:stopping");

        if let Some(process) = &sandbox.process
            && let Err(e) = process.terminate()
        {
            let error = format!("{e:#}");
            warn!(id, pid = process.pid, error = %error, "sandbox:failed to kill, keeping workspace");
            return;
        }

        if let Err(e) = self.workspaces.destroy(id) {
            warn!(id, error = %e, "sandbox:workspace removal failed");
        }
    }

    /// Drain the console of `id`, or report that the bot is off.
    pub fn console_snapshot(&self, id: &str) -> String {
        let console = self
            .lock_registry()
            .get(id)
            .map(|sandbox| Arc::clone(&sandbox.console));
        match console {
            Some(console) => lock(&console).drain(),
            None => BOT_OFF_MESSAGE.to_string(),
        }
    }

    pub fn status(&self, id: &str) -> Option<SandboxStatus> {
        self.lock_registry()
            .get(id)
            .map(|sandbox| lock(&sandbox.status).clone())
    }

    /// All registered sandboxes, sorted by id.
    pub fn list(&self) -> Vec<(String, SandboxStatus)> {
        let mut entries: Vec<_> = self
            .lock_registry()
            .iter()
            .map(|(id, sandbox)| (id.clone(), lock(&sandbox.status).clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Stop every registered sandbox.
    pub fn shutdown(&self) {
        let ids: Vec<String> = self.lock_registry().keys().cloned().collect();
        info!(count = ids.len(), "supervisor:shutdown");
        for id in ids {
            self.stop(&id);
        }
    }

    fn lock_registry(&self) -> MutexGuard<'_, HashMap<String, Sandbox>> {
        lock(&self.registry)
    }
}

/// Lock a mutex, recovering the data if a pump thread panicked while
/// holding it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Copy a child stream into the console until EOF.
fn spawn_pump<R>(mut reader: R, console: Arc<Mutex<ConsoleBuffer>>) -> thread::JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buf = [0u8; 4096];
        let mut pending = Vec::new();
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break, // EOF
                Ok(n) => {
                    let text = decode_utf8(&mut pending, &buf[..n]);
                    lock(&console).append(&text);
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        if !pending.is_empty() {
            lock(&console).append(&String::from_utf8_lossy(&pending));
        }
    })
}

/// Decode `data` appended to `pending`, keeping an incomplete trailing UTF-8
/// sequence in `pending` for the next read. Invalid bytes elsewhere become
/// U+FFFD.
fn decode_utf8(pending: &mut Vec<u8>, data: &[u8]) -> String {
    pending.extend_from_slice(data);
    let mut complete = pending.len();
    let mut offset = 0;
    while let Err(e) = std::str::from_utf8(&pending[offset..]) {
        match e.error_len() {
            Some(invalid) => offset += e.valid_up_to() + invalid,
            None => {
                complete = offset + e.valid_up_to();
                break;
            }
        }
    }
    let rest = pending.split_off(complete);
    let text = String::from_utf8_lossy(pending).into_owned();
    *pending = rest;
    text
}

/// Wait for the child, then record its exit once all output has been read.
fn spawn_reaper(
    id: String,
    child: Arc<Mutex<Child>>,
    pumps: Vec<thread::JoinHandle<()>>,
    console: Arc<Mutex<ConsoleBuffer>>,
    status: Arc<Mutex<SandboxStatus>>,
) {
    thread::spawn(move || {
        let exit = loop {
            match lock(&child).try_wait() {
                Ok(Some(exit)) => break Some(exit),
                Ok(None) => {}
                Err(e) => {
                    warn!(id = %id, error = %e, "sandbox:wait failed");
                    break None;
                }
            }
            thread::sleep(REAP_INTERVAL);
        };

        for pump in pumps {
            let _ = pump.join();
        }

        let Some(exit) = exit else {
            return;
        };
        info!(id = %id, code = ?exit.code(), signal = ?exit.signal(), "sandbox:exited");
        lock(&console).append(&exit_notice(&exit));
        *lock(&status) = SandboxStatus::Exited {
            code: exit.code(),
            signal: exit.signal(),
        };
    });
}

fn exit_notice(exit: &ExitStatus) -> String {
    match (exit.code(), exit.signal()) {
        (Some(code), _) => format!("\nScript exited with code {code}"),
        (None, Some(signal)) => format!("\nScript exited with signal {signal}"),
        (None, None) => "\nScript exited".to_string(),
    }
}
