use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "momentum", version, about = "Momentum scoring and intervention CLI")]
struct Cli {
    /// Database file (default: ~/.config/momentum/momentum.db)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Config file (default: ~/.config/momentum/momentum.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Event ingestion and erasure
    Event {
        #[command(subcommand)]
        action: commands::event::EventAction,
    },
    /// Daily scores
    Score {
        #[command(subcommand)]
        action: commands::score::ScoreAction,
    },
    /// Batch evaluation of all active users
    Batch {
        #[command(subcommand)]
        action: commands::batch::BatchAction,
    },
    /// Intervention log and dispatch outbox
    Interventions {
        #[command(subcommand)]
        action: commands::interventions::InterventionsAction,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: commands::config::ConfigAction,
    },
    /// Insert default scores for days with no score
    Backfill(commands::backfill::BackfillArgs),
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let ctx = commands::Context::new(cli.db, cli.config);
    let result = match cli.command {
        Commands::Event { action } => commands::event::run(&ctx, action),
        Commands::Score { action } => commands::score::run(&ctx, action),
        Commands::Batch { action } => commands::batch::run(&ctx, action),
        Commands::Interventions { action } => commands::interventions::run(&ctx, action),
        Commands::Config { action } => commands::config::run(&ctx, action),
        Commands::Backfill(args) => commands::backfill::run(&ctx, args),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
