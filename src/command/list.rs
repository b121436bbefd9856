use anyhow::Result;
use tabled::{
    Table, Tabled,
    settings::{Padding, Style, object::Columns},
};

use super::args::ClientArgs;
use crate::sandbox::rpc::{RpcRequest, RpcResponse, SandboxEntry};
use crate::sandbox::supervisor::SandboxStatus;

#[derive(Tabled)]
struct SandboxRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "STATE")]
    state: String,
    #[tabled(rename = "PID")]
    pid: String,
}

impl From<SandboxEntry> for SandboxRow {
    fn from(entry: SandboxEntry) -> Self {
        let (state, pid) = match &entry.status {
            SandboxStatus::Spawned { pid } => ("spawned".to_string(), pid.to_string()),
            SandboxStatus::Running { pid } => ("running".to_string(), pid.to_string()),
            other => (other.to_string(), "-".to_string()),
        };
        Self {
            id: entry.id,
            state,
            pid,
        }
    }
}

pub fn run(client: &ClientArgs) -> Result<()> {
    let response = client.client()?.call(&RpcRequest::List)?;
    let RpcResponse::Sandboxes { entries } = response else {
        return Err(super::unexpected(response));
    };

    if entries.is_empty() {
        println!("No sandboxes");
        return Ok(());
    }

    println!("{}", render(entries));
    Ok(())
}

fn render(entries: Vec<SandboxEntry>) -> String {
    let rows: Vec<SandboxRow> = entries.into_iter().map(SandboxRow::from).collect();
    let mut table = Table::new(rows);
    table
        .with(Style::blank())
        .modify(Columns::new(0..3), Padding::new(0, 1, 0, 0));
    table.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_rows() {
        let output = render(vec![
            SandboxEntry {
                id: "lumberjack".to_string(),
                status: SandboxStatus::Running { pid: 4242 },
            },
            SandboxEntry {
                id: "miner".to_string(),
                status: SandboxStatus::Exited {
                    code: Some(1),
                    signal: None,
                },
            },
        ]);
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("ID") && lines[0].contains("STATE"));
        assert!(lines[1].contains("lumberjack") && lines[1].contains("4242"));
        assert!(lines[2].contains("miner") && lines[2].contains("exited (code 1)"));
    }
}
