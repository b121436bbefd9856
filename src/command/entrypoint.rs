use anyhow::Result;

use crate::runtime;

/// Run the staged script of the sandbox this process was spawned for.
/// Never returns: the exit code is the script's outcome.
pub fn run() -> Result<()> {
    std::process::exit(runtime::run());
}
