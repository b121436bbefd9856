//! Client connections to the game server.
//!
//! Scripts never see credentials. They receive a `connect` function bound to
//! the sandbox's identity; each call opens a TCP connection, sends a JSON
//! login line and hands back a [`Connection`] object.

use mlua::{Function, Lua, UserData, UserDataMethods};
use serde::{Deserialize, Serialize};
use std::io::{self, BufRead, BufReader, Write};
use std::net::{Shutdown, TcpStream};

use super::RuntimeEnv;

/// First line written on every new connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Handshake {
    Login {
        username: String,
        auth: Option<String>,
        password: Option<String>,
    },
}

/// Creates connections bound to one bot identity and server.
#[derive(Debug, Clone)]
pub struct ConnectionFactory {
    host: String,
    port: u16,
    username: String,
    auth: Option<String>,
    password: Option<String>,
}

impl ConnectionFactory {
    pub fn new(env: &RuntimeEnv) -> Self {
        Self {
            host: env.host.clone(),
            port: env.port,
            username: env.name.clone(),
            auth: env.auth.clone(),
            password: env.password.clone(),
        }
    }

    pub fn connect(&self) -> io::Result<Connection> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))?;
        let mut connection = Connection {
            reader: BufReader::new(stream.try_clone()?),
            writer: stream,
        };

        let login = Handshake::Login {
            username: self.username.clone(),
            auth: self.auth.clone(),
            password: self.password.clone(),
        };
        let json = serde_json::to_string(&login).map_err(io::Error::other)?;
        connection.send_line(&json)?;
        Ok(connection)
    }

    /// Expose the factory to scripts as a zero-argument `connect()` function.
    pub fn into_lua_function(self, lua: &Lua) -> mlua::Result<Function> {
        lua.create_function(move |_, ()| {
            self.connect().map_err(|e| {
                mlua::Error::external(format!(
                    "Failed to connect to {}:{}: {e}",
                    self.host, self.port
                ))
            })
        })
    }
}

/// An open connection. Scripts use `send(line)`, `recv()` and `close()`.
pub struct Connection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Connection {
    fn send_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }

    /// Next line from the server without its terminator, `None` at EOF.
    fn recv_line(&mut self) -> io::Result<Option<String>> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        let trimmed = line.trim_end_matches(['\r', '\n']).len();
        line.truncate(trimmed);
        Ok(Some(line))
    }
}

impl UserData for Connection {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method_mut("send", |_, this, line: String| {
            this.send_line(&line).map_err(mlua::Error::external)
        });
        methods.add_method_mut("recv", |_, this, ()| {
            this.recv_line().map_err(mlua::Error::external)
        });
        methods.add_method("close", |_, this, ()| {
            match this.writer.shutdown(Shutdown::Both) {
                Ok(()) => Ok(()),
                // Already closed by the peer
                Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
                Err(e) => Err(mlua::Error::external(e)),
            }
        });
    }
}
