mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "tutor-cli")]
#[command(about = "Tutor CLI - Run lesson code locally through the execution engine", long_about = None)]
struct Cli {
    /// Toolchain config file (defaults to TUTOR_TOOLCHAINS_CONFIG or config/toolchains.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile and run a source file
    Run {
        /// Source file to execute
        file: PathBuf,

        /// File whose contents are fed to the program's stdin
        #[arg(long)]
        stdin: Option<PathBuf>,

        /// Run time limit in milliseconds (clamped to the engine maximum)
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Toolchain name (defaults to TUTOR_TOOLCHAIN or kotlin)
        #[arg(short, long)]
        toolchain: Option<String>,

        /// Print the full result as JSON instead of the summary
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// List configured toolchains
    Toolchains,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            stdin,
            timeout_ms,
            toolchain,
            json,
        } => {
            let options = commands::RunOptions {
                file,
                stdin,
                timeout_ms,
                toolchain,
                json,
            };
            let code = commands::run_file(cli.config.as_deref(), options).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Toolchains => {
            commands::list_toolchains(cli.config.as_deref())?;
        }
    }

    Ok(())
}
