use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use dockwatch_cli::cli::{Cli, Commands};
use dockwatch_cli::commands;
use dockwatch_cli::output::OutputWriter;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let writer = OutputWriter::new(cli.output);
    let result = match cli.command {
        Commands::Scan(args) => commands::scan::execute(args, &cli.config, &writer).await,
        Commands::Update(args) => commands::update::execute(args, &cli.config, &writer).await,
        Commands::Config(args) => commands::config::execute(args, &cli.config, &writer).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(u8::try_from(e.exit_code()).unwrap_or(1))
        }
    }
}
