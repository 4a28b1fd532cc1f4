//! qmi-dp command - inspect WWAN data ports and their data path options.

mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "qmi-dp", version, about = "QMI data path inspection tool")]
struct Cli {
    /// Output JSON.
    #[arg(short = 'j', long)]
    json: bool,

    /// Pretty print JSON.
    #[arg(short = 'p', long)]
    pretty: bool,

    /// Log debug messages.
    #[arg(short = 'v', long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show driver, endpoint and kernel data modes of a data port.
    #[command(visible_alias = "i")]
    Info(commands::info::InfoCmd),

    /// Bring a data port up or down.
    #[command(visible_alias = "l")]
    Link(commands::link::LinkCmd),

    /// Show the data format combinations in order of preference.
    #[command(visible_alias = "c")]
    Combinations(commands::combinations::CombinationsCmd),

    /// Show the default port configuration.
    Config(commands::config::ConfigCmd),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    let output = commands::Output {
        json: cli.json,
        pretty: cli.pretty,
    };

    let result = match cli.command {
        Command::Info(cmd) => cmd.run(&output),
        Command::Link(cmd) => cmd.run().await,
        Command::Combinations(cmd) => cmd.run(&output),
        Command::Config(cmd) => cmd.run(&output),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
