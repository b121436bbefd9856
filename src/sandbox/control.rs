//! Side channel between the supervisor and a runtime process.
//!
//! The supervisor creates a Unix socket pair per sandbox. The child end is
//! placed on [`CONTROL_FD`] in the runtime process and advertised through
//! [`CONTROL_FD_ENV`]. Both sides exchange JSON lines.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::process::Command;
use std::thread;
use tracing::{debug, trace};

/// Descriptor the child end of the channel lands on inside the runtime.
pub const CONTROL_FD: RawFd = 3;

pub const CONTROL_FD_ENV: &str = "BOTVISOR_CONTROL_FD";

/// Message sent from a runtime process to the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// The script loaded and its entry function is about to run.
    Ready { pid: u32 },
    /// Free-form diagnostic that should not end up in the console.
    Log { message: String },
}

/// Create the socket pair: `(supervisor end, child end)`.
pub fn pair() -> Result<(UnixStream, UnixStream)> {
    UnixStream::pair().context("Failed to create control socket pair")
}

/// Arrange for `child_end` to be inherited as [`CONTROL_FD`] by `cmd`.
///
/// The caller must keep `child_end` open until the command has spawned and
/// drop it afterwards.
pub fn attach(cmd: &mut Command, child_end: &UnixStream) {
    let fd = child_end.as_raw_fd();
    cmd.env(CONTROL_FD_ENV, CONTROL_FD.to_string());

    // SAFETY: the closure only calls async-signal-safe libc functions
    // (dup2, fcntl) between fork and exec.
    unsafe {
        cmd.pre_exec(move || {
            if fd == CONTROL_FD {
                // dup2 onto itself keeps FD_CLOEXEC, so clear it explicitly
                let flags = libc::fcntl(fd, libc::F_GETFD);
                if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
            } else if libc::dup2(fd, CONTROL_FD) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

/// Read messages from the supervisor end until the child closes it.
pub fn spawn_reader<F>(id: String, stream: UnixStream, mut on_message: F) -> thread::JoinHandle<()>
where
    F: FnMut(ControlMessage) + Send + 'static,
{
    thread::spawn(move || {
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    debug!(id = %id, error = %e, "control:read failed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ControlMessage>(&line) {
                Ok(message) => {
                    trace!(id = %id, ?message, "control:message");
                    on_message(message);
                }
                Err(e) => debug!(id = %id, error = %e, line = %line, "control:invalid message"),
            }
        }
        trace!(id = %id, "control:closed");
    })
}

/// Runtime-side handle on the channel.
pub struct ControlClient {
    stream: UnixStream,
}

impl ControlClient {
    /// Open the inherited channel named by a [`CONTROL_FD_ENV`] value, if
    /// the supervisor provided one.
    pub fn from_var(raw: Option<&str>) -> Result<Option<Self>> {
        let Some(raw) = raw.filter(|raw| !raw.is_empty()) else {
            return Ok(None);
        };
        let fd: RawFd = raw
            .parse()
            .with_context(|| format!("{CONTROL_FD_ENV} is not a descriptor: {raw}"))?;
        if fd < 0 {
            return Err(anyhow!("{CONTROL_FD_ENV} is negative: {fd}"));
        }
        // SAFETY: the supervisor hands over exactly this descriptor and
        // nothing else in the runtime process owns it.
        let stream = unsafe { UnixStream::from_raw_fd(fd) };
        Ok(Some(Self::from_stream(stream)))
    }

    pub fn from_stream(stream: UnixStream) -> Self {
        Self { stream }
    }

    pub fn send(&mut self, message: &ControlMessage) -> Result<()> {
        let mut json = serde_json::to_string(message)?;
        json.push('\n');
        self.stream.write_all(json.as_bytes())?;
        self.stream.flush()?;
        Ok(())
    }
}
