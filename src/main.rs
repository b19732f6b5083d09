mod catalog;
mod cli;
mod config;
mod db;
mod ipc;
mod job;
mod logging;
mod runner;
mod server;
mod utils;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use catalog::Tool;
use cli::JobArgs;
use config::AppConfig;
use utils::AppPaths;

#[derive(Parser, Debug)]
#[command(author, version, about = "Homelab operator console", long_about = None)]
struct Cli {
    /// Application directory; defaults to ~/app/fouchger_homelab
    #[arg(long, global = true, env = "HOMELAB_ROOT")]
    root: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the console and accept jobs from other invocations
    Serve,
    /// Run a command here and wait for it
    Run(JobArgs),
    /// Hand a command to the running console
    Submit(JobArgs),
    /// Run every check for one tool
    Preflight {
        #[arg(value_enum)]
        tool: Tool,
    },
    /// List the preflight checks
    Checks,
    /// Show the most recent runs
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    /// Show one run and its captured output
    Show {
        run_id: String,
        #[arg(long)]
        stderr: bool,
    },
    /// Print the effective configuration
    Config,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let paths = AppPaths::resolve(cli.root)?;
    paths.ensure()?;
    logging::init(&paths.log_file())?;
    let config = AppConfig::load(&paths.config_file())?;

    let ok = match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            server::serve(&paths, &config)?;
            true
        }
        Commands::Run(args) => cli::run(&paths, &config, args)?,
        Commands::Submit(args) => {
            cli::submit(&paths, args)?;
            true
        }
        Commands::Preflight { tool } => cli::preflight(&paths, &config, tool)?,
        Commands::Checks => {
            cli::checks();
            true
        }
        Commands::History { limit, json } => {
            cli::history(&paths, limit, json)?;
            true
        }
        Commands::Show { run_id, stderr } => {
            cli::show(&paths, &run_id, stderr)?;
            true
        }
        Commands::Config => {
            cli::show_config(&paths, &config)?;
            true
        }
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}
