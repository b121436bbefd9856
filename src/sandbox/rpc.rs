//! TCP RPC protocol between the record layer and the supervisor.
//!
//! The supervisor runs an RPC server; callers (the record layer, or the
//! botvisor CLI) connect, send an auth header line and then JSON-lines
//! requests, one response line per request.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info};

use super::supervisor::{SandboxStatus, StartOutcome, StartRequest, Supervisor};

// ── Protocol types ──────────────────────────────────────────────────────

/// RPC request sent from a caller to the supervisor.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RpcRequest {
    StartScript(StartRequest),
    StopScript { id: String },
    ConsoleSnapshot { id: String },
    Status { id: String },
    List,
    Heartbeat,
}

/// One row of a `List` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxEntry {
    pub id: String,
    pub status: SandboxStatus,
}

/// RPC response sent from the supervisor to a caller.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RpcResponse {
    Ok,
    Started { outcome: StartOutcome },
    Console { content: String },
    Status { status: Option<SandboxStatus> },
    Sandboxes { entries: Vec<SandboxEntry> },
    Error { message: String },
}

// ── Server ──────────────────────────────────────────────────────────────

/// Context available to RPC request handlers.
pub struct RpcContext {
    pub supervisor: Arc<Supervisor>,
    /// Shared secret for authenticating RPC requests.
    pub token: String,
}

/// TCP RPC server that accepts caller connections.
pub struct RpcServer {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl RpcServer {
    pub fn bind(addr: impl ToSocketAddrs + std::fmt::Display) -> Result<Self> {
        let listener = TcpListener::bind(&addr)
            .with_context(|| format!("Failed to bind RPC listener on {addr}"))?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "RPC server bound");
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Spawn a background thread that accepts connections and dispatches handlers.
    pub fn spawn(self, ctx: Arc<RpcContext>) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            for stream in self.listener.incoming() {
                match stream {
                    Ok(stream) => {
                        let ctx = Arc::clone(&ctx);
                        thread::spawn(move || {
                            if let Err(e) = handle_connection(stream, &ctx) {
                                debug!(error = %e, "RPC connection ended");
                            }
                        });
                    }
                    Err(e) => {
                        debug!(error = %e, "RPC accept error, shutting down");
                        break;
                    }
                }
            }
        })
    }
}

/// Generate a random token for RPC authentication.
pub fn generate_token() -> Result<String> {
    let mut bytes = [0u8; 16];
    getrandom::fill(&mut bytes).map_err(|e| anyhow!("Failed to generate RPC token: {e}"))?;
    Ok(bytes.iter().map(|b| format!("{b:02x}")).collect())
}

// ── Connection handler ──────────────────────────────────────────────────

/// Header line sent by client before requests. Contains the auth token.
#[derive(Debug, Serialize, Deserialize)]
struct AuthHeader {
    token: String,
}

fn handle_connection(stream: TcpStream, ctx: &RpcContext) -> Result<()> {
    let peer = stream.peer_addr().ok();
    debug!(?peer, "RPC connection accepted");

    let mut reader = BufReader::new(&stream);
    let mut writer = stream.try_clone().context("Failed to clone TCP stream")?;

    // First line must be auth header
    let mut auth_line = String::new();
    reader.read_line(&mut auth_line)?;
    let auth: AuthHeader =
        serde_json::from_str(auth_line.trim()).context("Failed to parse auth header")?;

    if auth.token != ctx.token {
        let resp = RpcResponse::Error {
            message: "Invalid token".to_string(),
        };
        write_response(&mut writer, &resp)?;
        return Ok(());
    }

    for line in reader.lines() {
        let line = line.context("Failed to read RPC request line")?;
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<RpcRequest>(&line) {
            Ok(request) => {
                debug!(request = request_kind(&request), "RPC request received");
                dispatch_request(request, &ctx.supervisor)
            }
            Err(e) => RpcResponse::Error {
                message: format!("Failed to parse RPC request: {e}"),
            },
        };
        debug!(?response, "RPC response");

        write_response(&mut writer, &response)?;
    }

    Ok(())
}

fn write_response(writer: &mut impl Write, response: &RpcResponse) -> Result<()> {
    let mut json = serde_json::to_string(response)?;
    json.push('\n');
    writer.write_all(json.as_bytes())?;
    writer.flush()?;
    Ok(())
}

/// Request name for logging; start requests carry credentials and script
/// source, so they are never logged whole.
fn request_kind(request: &RpcRequest) -> &'static str {
    match request {
        RpcRequest::StartScript(_) => "StartScript",
        RpcRequest::StopScript { .. } => "StopScript",
        RpcRequest::ConsoleSnapshot { .. } => "ConsoleSnapshot",
        RpcRequest::Status { .. } => "Status",
        RpcRequest::List => "List",
        RpcRequest::Heartbeat => "Heartbeat",
    }
}

// ── Request dispatch ────────────────────────────────────────────────────

fn dispatch_request(request: RpcRequest, supervisor: &Supervisor) -> RpcResponse {
    match request {
        RpcRequest::Heartbeat => RpcResponse::Ok,
        RpcRequest::StartScript(start) => RpcResponse::Started {
            outcome: supervisor.start(start),
        },
        RpcRequest::StopScript { id } => {
            supervisor.stop(&id);
            RpcResponse::Ok
        }
        RpcRequest::ConsoleSnapshot { id } => RpcResponse::Console {
            content: supervisor.console_snapshot(&id),
        },
        RpcRequest::Status { id } => RpcResponse::Status {
            status: supervisor.status(&id),
        },
        RpcRequest::List => RpcResponse::Sandboxes {
            entries: supervisor
                .list()
                .into_iter()
                .map(|(id, status)| SandboxEntry { id, status })
                .collect(),
        },
    }
}

// ── Client ──────────────────────────────────────────────────────────────

/// RPC client used by the botvisor CLI to drive a running supervisor.
pub struct RpcClient {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl RpcClient {
    /// Connect to `addr` and authenticate with `token`.
    pub fn connect(addr: &str, token: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .with_context(|| format!("Failed to connect to supervisor at {addr}"))?;

        let writer = stream.try_clone().context("Failed to clone TCP stream")?;
        let reader = BufReader::new(stream);

        let auth = AuthHeader {
            token: token.to_string(),
        };
        let mut auth_json = serde_json::to_string(&auth)?;
        auth_json.push('\n');
        (&writer).write_all(auth_json.as_bytes())?;
        (&writer).flush()?;

        Ok(Self { reader, writer })
    }

    /// Send a request and receive a response.
    pub fn call(&mut self, request: &RpcRequest) -> Result<RpcResponse> {
        let mut req_json = serde_json::to_string(request)?;
        req_json.push('\n');
        (&self.writer).write_all(req_json.as_bytes())?;
        (&self.writer).flush()?;

        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(anyhow!("Supervisor closed the connection"));
        }

        let response: RpcResponse = serde_json::from_str(&line)
            .with_context(|| format!("Failed to parse RPC response: {}", line.trim()))?;
        match response {
            RpcResponse::Error { message } => Err(anyhow!("Supervisor error: {message}")),
            other => Ok(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::supervisor::{RuntimeCommand, ServerTarget, SupervisorOptions};
    use std::path::PathBuf;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn start_server() -> (TempDir, SocketAddr, String) {
        let tmp = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(SupervisorOptions {
            workspace_root: tmp.path().join("workspaces"),
            runtime: RuntimeCommand {
                program: PathBuf::from("/bin/sh"),
                args: vec!["script.lua".to_string()],
            },
            server: ServerTarget {
                host: "localhost".to_string(),
                port: 25565,
            },
            console_limit: 1024,
        })
        .unwrap();

        let server = RpcServer::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr();
        let token = generate_token().unwrap();
        let ctx = Arc::new(RpcContext {
            supervisor: Arc::new(supervisor),
            token: token.clone(),
        });
        let _handle = server.spawn(ctx);
        (tmp, addr, token)
    }

    #[test]
    fn test_request_serialization_start_script() {
        let req = RpcRequest::StartScript(StartRequest {
            id: "bot-1".to_string(),
            script: "return {}".to_string(),
            name: "Steve".to_string(),
            auth: None,
            password: None,
            parameter: Some(serde_json::json!([1, 2])),
        });
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"type\":\"StartScript\""));
        assert!(json.contains("\"id\":\"bot-1\""));
        assert!(json.contains("\"parameter\":[1,2]"));
    }

    #[test]
    fn test_request_optional_fields_default() {
        let req: RpcRequest = serde_json::from_str(
            r#"{"type":"StartScript","id":"a","script":"x","name":"Steve"}"#,
        )
        .unwrap();
        match req {
            RpcRequest::StartScript(start) => {
                assert_eq!(start.auth, None);
                assert_eq!(start.password, None);
                assert_eq!(start.parameter, None);
            }
            other => panic!("Wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_response_serialization() {
        let resp = RpcResponse::Started {
            outcome: StartOutcome::Started { pid: 10 },
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert_eq!(
            json,
            r#"{"type":"Started","outcome":{"result":"started","pid":10}}"#
        );

        let resp = RpcResponse::Status {
            status: Some(SandboxStatus::Running { pid: 3 }),
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert_eq!(
            json,
            r#"{"type":"Status","status":{"state":"running","pid":3}}"#
        );
    }

    #[test]
    fn test_generate_token_is_random_hex() {
        let a = generate_token().unwrap();
        let b = generate_token().unwrap();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_client_server_heartbeat_roundtrip() {
        let (_tmp, addr, token) = start_server();
        let mut client = RpcClient::connect(&addr.to_string(), &token).unwrap();
        let resp = client.call(&RpcRequest::Heartbeat).unwrap();
        assert!(matches!(resp, RpcResponse::Ok));
    }

    #[test]
    fn test_client_server_invalid_token() {
        let (_tmp, addr, _token) = start_server();
        let mut client = RpcClient::connect(&addr.to_string(), "wrong-token").unwrap();
        let err = client.call(&RpcRequest::Heartbeat).unwrap_err();
        assert!(err.to_string().contains("Invalid token"));
    }

    #[test]
    fn test_console_of_unknown_bot() {
        let (_tmp, addr, token) = start_server();
        let mut client = RpcClient::connect(&addr.to_string(), &token).unwrap();
        let resp = client
            .call(&RpcRequest::ConsoleSnapshot {
                id: "ghost".to_string(),
            })
            .unwrap();
        match resp {
            RpcResponse::Console { content } => assert_eq!(content, "The bot is off"),
            other => panic!("Expected Console, got {other:?}"),
        }
    }

    #[test]
    fn test_start_console_stop_over_rpc() {
        let (tmp, addr, token) = start_server();
        let mut client = RpcClient::connect(&addr.to_string(), &token).unwrap();

        let resp = client
            .call(&RpcRequest::StartScript(StartRequest {
                id: "a".to_string(),
                script: "printf x".to_string(),
                name: "Steve".to_string(),
                auth: None,
                password: None,
                parameter: None,
            }))
            .unwrap();
        assert!(matches!(
            resp,
            RpcResponse::Started {
                outcome: StartOutcome::Started { .. }
            }
        ));

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut seen = String::new();
        while Instant::now() < deadline && !seen.contains("Script exited with code 0") {
            if let RpcResponse::Console { content } = client
                .call(&RpcRequest::ConsoleSnapshot { id: "a".to_string() })
                .unwrap()
            {
                seen.push_str(&content);
            }
            thread::sleep(Duration::from_millis(20));
        }
        assert!(seen.starts_with('x'), "console was {seen:?}");
        assert!(seen.ends_with("\nScript exited with code 0"));

        let resp = client.call(&RpcRequest::List).unwrap();
        let RpcResponse::Sandboxes { entries } = resp else {
            panic!("Expected Sandboxes");
        };
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "a");

        assert!(matches!(
            client
                .call(&RpcRequest::StopScript { id: "a".to_string() })
                .unwrap(),
            RpcResponse::Ok
        ));
        assert!(matches!(
            client
                .call(&RpcRequest::Status { id: "a".to_string() })
                .unwrap(),
            RpcResponse::Status { status: None }
        ));
        assert!(!tmp.path().join("workspaces").join("a").exists());
    }

    #[test]
    fn test_malformed_request_gets_error() {
        let (_tmp, addr, token) = start_server();
        let mut client = RpcClient::connect(&addr.to_string(), &token).unwrap();
        (&client.writer).write_all(b"{\"type\":\"Nope\"}\n").unwrap();
        let mut line = String::new();
        client.reader.read_line(&mut line).unwrap();
        assert!(line.contains("Failed to parse RPC request"));

        // The connection stays usable
        assert!(matches!(
            client.call(&RpcRequest::Heartbeat).unwrap(),
            RpcResponse::Ok
        ));
    }
}
