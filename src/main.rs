// Copyright 2026 Percolator Contributors
// SPDX-License-Identifier: Apache-2.0

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use percolator::cli;

#[derive(Parser)]
#[command(
    name = "percolator",
    about = "Percolator — keeps a proxy subscription freshly brewed",
    version,
    after_help = "Run 'percolator <command> --help' for details on each command.\nRun 'percolator' with no command to start the daemon."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon: HTTP surface plus the scheduled refresher
    Serve,
    /// Run one refresh cycle and exit
    Refresh,
    /// Show the current snapshot state
    Status,
    /// Check environment and diagnose issues
    Doctor,
    /// Generate shell completion scripts
    Completions {
        /// Shell type (bash, zsh, fish, powershell)
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let result = match cli.command {
        // No subcommand → run the daemon
        None | Some(Commands::Serve) => cli::serve::run().await,
        Some(Commands::Refresh) => cli::refresh::run().await,
        Some(Commands::Status) => cli::status::run().await,
        Some(Commands::Doctor) => cli::doctor::run().await,
        Some(Commands::Completions { shell }) => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "percolator", &mut std::io::stdout());
            Ok(())
        }
    };

    if let Err(e) = &result {
        eprintln!("  Error: {e:#}");
        std::process::exit(1);
    }
    result
}
