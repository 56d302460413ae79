// Copyright 2026 Locator Harvest Contributors
// SPDX-License-Identifier: Apache-2.0

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use locator_harvest::cli;
use locator_harvest::cli::config_cmd::ConfigArgs;
use locator_harvest::cli::discover_cmd::DiscoverArgs;
use locator_harvest::cli::output::{ENV_JSON, ENV_QUIET};
use locator_harvest::cli::run_cmd::RunArgs;
use locator_harvest::cli::SettingsArgs;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "harvest",
    about = "Harvest store-locator results: discover the search form, run it per query, validate, extract",
    version,
    after_help = "Run 'harvest <command> --help' for details on each command."
)]
struct Cli {
    /// Output results as JSON (machine-readable)
    #[arg(long, global = true)]
    json: bool,

    /// Suppress non-essential output
    #[arg(long, short, global = true)]
    quiet: bool,

    /// Enable verbose/debug logging
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Harvest every site in a list for every query key
    Run(RunArgs),
    /// Discover one site's locator page and search form
    Discover(DiscoverArgs),
    /// Inspect or reset stored site config
    Config(ConfigArgs),
    /// Check environment and diagnose issues
    Doctor(SettingsArgs),
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

fn init_tracing(cli: &Cli) -> Result<()> {
    let directive = if cli.verbose {
        "locator_harvest=debug"
    } else if cli.quiet {
        "locator_harvest=warn"
    } else {
        "locator_harvest=info"
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive.parse()?))
        .with_writer(std::io::stderr);
    if cli.json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set global flags via environment variables so all modules can check them
    if cli.json {
        std::env::set_var(ENV_JSON, "1");
    }
    if cli.quiet {
        std::env::set_var(ENV_QUIET, "1");
    }
    init_tracing(&cli)?;

    let result = match cli.command {
        Commands::Run(args) => cli::run_cmd::run(args).await,
        Commands::Discover(args) => cli::discover_cmd::run(args).await.map(|()| 0),
        Commands::Config(args) => cli::config_cmd::run(args).await.map(|()| 0),
        Commands::Doctor(args) => cli::doctor::run(args).await.map(|()| 0),
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "harvest", &mut std::io::stdout());
            Ok(0)
        }
    };

    // Consistent exit codes: 0=records harvested / command succeeded, 1=error
    match result {
        Ok(0) => Ok(()),
        Ok(code) => std::process::exit(code),
        Err(e) => {
            if cli.json {
                println!(
                    "{}",
                    serde_json::json!({ "error": true, "message": format!("{e:#}") })
                );
            } else if !cli.quiet {
                eprintln!("  Error: {e:#}");
            }
            std::process::exit(1);
        }
    }
}
