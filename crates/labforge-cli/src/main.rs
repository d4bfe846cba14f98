mod commands;
mod logging;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::{EXIT_CONFIG_ERROR, EXIT_FAILURE};
use labforge_core::install_signal_handler;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "labforge",
    version,
    about = "Declarative lab environment provisioning over a flaky remote substrate"
)]
struct Cli {
    /// Path to the lab configuration file.
    #[arg(long, default_value = "labforge.toml", global = true)]
    config: PathBuf,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Execute the deployment pipeline.
    Deploy {
        /// First step to execute (steps before it are counted but skipped).
        #[arg(long, default_value_t = 1)]
        start_step: usize,
        /// Last step to execute; defaults to the final step of the plan.
        #[arg(long)]
        end_step: Option<usize>,
        /// Print the numbered plan and exit without executing anything.
        #[arg(long, default_value_t = false)]
        planonly: bool,
    },
    /// Destroy every configured unit and generated template archive.
    Cleanup,
    /// Cleanup followed by a full deploy.
    Redeploy,
    /// Show unit and template status from the host.
    Status {
        /// Output results as structured JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Archive the configured data roots into timestamped tarballs.
    Backup,
    /// Restore the configured data roots from a named backup.
    Restore {
        /// Name of the backup to restore, as printed by `backup`.
        #[arg(long)]
        backup_name: String,
    },
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        return match commands::completions::run::<Cli>(*shell) {
            Ok(code) => ExitCode::from(code),
            Err(msg) => {
                eprintln!("error: {msg}");
                ExitCode::from(EXIT_FAILURE)
            }
        };
    }

    let cfg = match labforge_config::parse_config_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("error: config error: {e}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let _log_guard = logging::init(&cfg.log_dir, cli.verbose, cli.trace);
    install_signal_handler();

    let result = match cli.command {
        Commands::Deploy {
            start_step,
            end_step,
            planonly,
        } => commands::deploy::run(&cfg, start_step, end_step, planonly),
        Commands::Cleanup => commands::cleanup::run(&cfg),
        Commands::Redeploy => commands::redeploy::run(&cfg),
        Commands::Status { json } => commands::status::run(&cfg, json),
        Commands::Backup => commands::backup::run(&cfg),
        Commands::Restore { backup_name } => commands::restore::run(&cfg, &backup_name),
        Commands::Completions { .. } => unreachable!("handled before config load"),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("config error:") {
                EXIT_CONFIG_ERROR
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}
