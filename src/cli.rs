use crate::command;
use crate::command::args::ClientArgs;
use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use std::path::PathBuf;

/// Hidden subcommand the supervisor uses to launch a sandbox runtime.
pub const ENTRYPOINT_COMMAND: &str = "_entrypoint";

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "botvisor")]
#[command(about = "Runs user-supplied bot scripts as isolated, supervised processes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervisor and its RPC server
    Serve {
        /// Address to listen on (overrides config `listen`)
        #[arg(long)]
        listen: Option<String>,
    },

    /// Stage a script and start it as a sandbox
    Start {
        /// Sandbox id
        id: String,

        /// Path to the Lua script to run
        #[arg(short, long, value_hint = clap::ValueHint::FilePath)]
        script: PathBuf,

        /// Player name the bot logs in as
        #[arg(short, long)]
        name: String,

        /// Authentication mode passed to the bot
        #[arg(long)]
        auth: Option<String>,

        /// Account password passed to the bot
        #[arg(long)]
        password: Option<String>,

        /// JSON value handed to the script's `main`
        #[arg(short, long)]
        parameter: Option<String>,

        #[command(flatten)]
        client: ClientArgs,
    },

    /// Terminate a sandbox and remove its workspace
    Stop {
        id: String,

        #[command(flatten)]
        client: ClientArgs,
    },

    /// Print (and drain) a sandbox's console
    Console {
        id: String,

        /// Keep polling until the bot is off
        #[arg(short, long)]
        follow: bool,

        #[command(flatten)]
        client: ClientArgs,
    },

    /// Show the state of one sandbox
    Status {
        id: String,

        #[command(flatten)]
        client: ClientArgs,
    },

    /// List all tracked sandboxes
    #[command(visible_alias = "ls")]
    List {
        #[command(flatten)]
        client: ClientArgs,
    },

    /// Generate shell completions
    Completions {
        /// The shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },

    /// Run a staged script inside a sandbox process (internal use)
    #[command(hide = true, name = "_entrypoint")]
    Entrypoint,
}

/// True when the process was launched as a sandbox runtime. Checked before
/// clap parsing so the runtime never touches the supervisor's log file.
pub fn is_entrypoint() -> bool {
    std::env::args().nth(1).as_deref() == Some(ENTRYPOINT_COMMAND)
}

// --- Public Entry Point ---
pub fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { listen } => command::serve::run(listen.as_deref()),
        Commands::Start {
            id,
            script,
            name,
            auth,
            password,
            parameter,
            client,
        } => command::start::run(
            &client,
            command::start::StartArgs {
                id,
                script,
                name,
                auth,
                password,
                parameter,
            },
        ),
        Commands::Stop { id, client } => command::stop::run(&client, &id),
        Commands::Console { id, follow, client } => command::console::run(&client, &id, follow),
        Commands::Status { id, client } => command::status::run(&client, &id),
        Commands::List { client } => command::list::run(&client),
        Commands::Completions { shell } => {
            generate_completions(shell);
            Ok(())
        }
        Commands::Entrypoint => command::entrypoint::run(),
    }
}

fn generate_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut std::io::stdout());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_start() {
        let cli = Cli::try_parse_from([
            "botvisor",
            "start",
            "miner",
            "--script",
            "miner.lua",
            "--name",
            "Steve",
            "--parameter",
            r#"{"depth": 12}"#,
            "--token",
            "abc",
        ])
        .unwrap();
        let Commands::Start {
            id,
            script,
            name,
            auth,
            parameter,
            client,
            ..
        } = cli.command
        else {
            panic!("Expected start command");
        };
        assert_eq!(id, "miner");
        assert_eq!(script, PathBuf::from("miner.lua"));
        assert_eq!(name, "Steve");
        assert_eq!(auth, None);
        assert_eq!(parameter.as_deref(), Some(r#"{"depth": 12}"#));
        assert_eq!(client.token.as_deref(), Some("abc"));
    }

    #[test]
    fn test_entrypoint_is_hidden() {
        let help = Cli::command().render_long_help().to_string();
        assert!(!help.contains(ENTRYPOINT_COMMAND));
        assert!(matches!(
            Cli::try_parse_from(["botvisor", ENTRYPOINT_COMMAND])
                .unwrap()
                .command,
            Commands::Entrypoint
        ));
    }
}
