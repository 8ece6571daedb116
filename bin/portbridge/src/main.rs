mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "portbridge")]
#[command(about = "Background worker bridging content scripts and extension UIs", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker and accept port and runtime connections
    Serve {
        /// Port to listen on (overrides config gateway.port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to (overrides config gateway.host)
        #[arg(long)]
        host: Option<String>,
    },

    /// Show configuration and storage status
    Status,

    /// Inspect or clear the pending request queue
    Pending {
        #[command(subcommand)]
        command: PendingCommands,
    },
}

#[derive(Subcommand)]
enum PendingCommands {
    /// List queued requests, oldest first
    List {
        /// Only show requests of this type
        #[arg(long = "type")]
        kind: Option<String>,

        /// Print raw JSON
        #[arg(long)]
        json: bool,
    },
    /// Discard every queued request without answering it
    Clear {
        /// Reason recorded in the log
        #[arg(long, default_value = "cleared from cli")]
        reason: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Serve { port, host } => {
            commands::serve::run(host, port).await?;
        }
        Commands::Status => {
            commands::status::run().await?;
        }
        Commands::Pending { command } => match command {
            PendingCommands::List { kind, json } => {
                commands::pending::list(kind, json).await?;
            }
            PendingCommands::Clear { reason } => {
                commands::pending::clear(&reason).await?;
            }
        },
    }

    Ok(())
}
