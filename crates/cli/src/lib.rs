pub mod commands;
pub mod logging;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "stagewise",
    about = "Stagewise operator CLI",
    long_about = "Inspect effective pipeline configuration and replay recorded orchestration runs.",
    after_help = "Examples:\n  stagewise config\n  stagewise replay fixtures/quote.json\n  stagewise --config stagewise.toml replay run.json --message \"confirm\""
)]
pub struct Cli {
    #[arg(long, global = true, help = "Config file to load instead of stagewise.toml")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Run one request through the pipeline against recorded model replies")]
    Replay {
        #[arg(help = "JSON fixture with the input, per-role model replies, tools and results")]
        fixture: PathBuf,
        #[arg(long, help = "Replace the fixture's user message")]
        message: Option<String>,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Config => {
            commands::CommandReport::printed(commands::config::run(cli.config.as_deref()), 0)
        }
        Command::Replay { fixture, message } => {
            commands::replay::run(cli.config.as_deref(), &fixture, message.as_deref())
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
