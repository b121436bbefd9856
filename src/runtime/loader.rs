//! Script loading and the entry contract.
//!
//! A bot script is a Lua chunk that either returns a table with a `main`
//! function or defines a global `main`:
//!
//! ```lua
//! return {
//!     main = function(connect, parameter)
//!         local bot = connect()
//!         bot:send("hello")
//!     end,
//! }
//! ```

use mlua::{Function, Lua, Value};
use std::io;
use std::path::{Path, PathBuf};

/// Name of the function every script must provide.
pub const ENTRY_FUNCTION: &str = "main";

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Failed to read script {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Script has a syntax error: {0}")]
    Syntax(String),

    #[error("Script failed while loading: {0}")]
    Evaluate(#[source] mlua::Error),

    #[error("Script does not provide a `main` function (return {{ main = function(connect, parameter) ... end }})")]
    MissingEntry,
}

/// A loaded script whose entry function has been located.
pub struct EntryPoint {
    main: Function,
}

impl EntryPoint {
    /// Run the script's `main(connect, parameter)` to completion.
    pub fn call(&self, connect: Function, parameter: Value) -> mlua::Result<()> {
        self.main.call::<()>((connect, parameter))
    }
}

pub fn load(lua: &Lua, path: &Path) -> Result<EntryPoint, LoadError> {
    let source = std::fs::read_to_string(path).map_err(|source| LoadError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let chunk_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "script".to_string());
    load_source(lua, &source, &chunk_name)
}

pub fn load_source(lua: &Lua, source: &str, chunk_name: &str) -> Result<EntryPoint, LoadError> {
    let chunk = lua
        .load(source)
        .set_name(format!("={chunk_name}"))
        .into_function()
        .map_err(|e| match e {
            mlua::Error::SyntaxError { message, .. } => LoadError::Syntax(message),
            other => LoadError::Evaluate(other),
        })?;

    let exported: Value = chunk.call(()).map_err(LoadError::Evaluate)?;

    if let Value::Table(module) = &exported
        && let Ok(Value::Function(main)) = module.get::<Value>(ENTRY_FUNCTION)
    {
        return Ok(EntryPoint { main });
    }

    match lua.globals().get::<Value>(ENTRY_FUNCTION) {
        Ok(Value::Function(main)) => Ok(EntryPoint { main }),
        _ => Err(LoadError::MissingEntry),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_connect(lua: &Lua) -> Function {
        lua.create_function(|_, ()| Ok(())).unwrap()
    }

    #[test]
    fn test_exported_main_is_called_with_parameter() {
        let lua = Lua::new();
        let entry = load_source(
            &lua,
            r#"
            return {
                main = function(connect, parameter)
                    seen = parameter
                end,
            }
            "#,
            "script.lua",
        )
        .unwrap();

        entry.call(noop_connect(&lua), Value::Integer(42)).unwrap();
        assert_eq!(lua.globals().get::<i64>("seen").unwrap(), 42);
    }

    #[test]
    fn test_global_main_is_accepted() {
        let lua = Lua::new();
        let entry = load_source(
            &lua,
            "function main(connect, parameter) called = true end",
            "script.lua",
        )
        .unwrap();

        entry.call(noop_connect(&lua), Value::Nil).unwrap();
        assert!(lua.globals().get::<bool>("called").unwrap());
    }

    #[test]
    fn test_connect_is_passed_through() {
        let lua = Lua::new();
        let entry = load_source(
            &lua,
            "return { main = function(connect) result = connect() end }",
            "script.lua",
        )
        .unwrap();
        let connect = lua.create_function(|_, ()| Ok("connected")).unwrap();

        entry.call(connect, Value::Nil).unwrap();
        assert_eq!(lua.globals().get::<String>("result").unwrap(), "connected");
    }

    #[test]
    fn test_missing_main() {
        let lua = Lua::new();
        let err = load_source(&lua, "return { start = function() end }", "script.lua")
            .err()
            .unwrap();
        assert!(matches!(err, LoadError::MissingEntry));
    }

    #[test]
    fn test_main_must_be_a_function() {
        let lua = Lua::new();
        let err = load_source(&lua, "return { main = 5 }", "script.lua")
            .err()
            .unwrap();
        assert!(matches!(err, LoadError::MissingEntry));
    }

    #[test]
    fn test_syntax_error() {
        let lua = Lua::new();
        let err = load_source(&lua, "return {", "script.lua").err().unwrap();
        let LoadError::Syntax(message) = err else {
            panic!("Expected syntax error, got {err:?}");
        };
        assert!(message.contains("script.lua"));
    }

    #[test]
    fn test_error_while_loading() {
        let lua = Lua::new();
        let err = load_source(&lua, "error('boom')", "script.lua")
            .err()
            .unwrap();
        assert!(matches!(err, LoadError::Evaluate(_)));
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_error_inside_main_propagates() {
        let lua = Lua::new();
        let entry = load_source(
            &lua,
            "return { main = function() error('kaput') end }",
            "script.lua",
        )
        .unwrap();
        let err = entry.call(noop_connect(&lua), Value::Nil).unwrap_err();
        assert!(err.to_string().contains("kaput"));
    }

    #[test]
    fn test_load_missing_file() {
        let lua = Lua::new();
        let tmp = tempfile::tempdir().unwrap();
        let err = load(&lua, &tmp.path().join("script.lua")).err().unwrap();
        assert!(matches!(err, LoadError::Read { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let lua = Lua::new();
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("script.lua");
        std::fs::write(&path, "return { main = function() ran = 1 end }").unwrap();

        load(&lua, &path)
            .unwrap()
            .call(noop_connect(&lua), Value::Nil)
            .unwrap();
        assert_eq!(lua.globals().get::<i64>("ran").unwrap(), 1);
    }
}
