use chrono::Utc;
use clap::Subcommand;
use std::time::Duration;

use super::{date_or_today, print_json, CliResult, Context};

const SHUTDOWN_GRACE_SECS: u64 = 5;

#[derive(Subcommand)]
pub enum BatchAction {
    /// Evaluate every active user
    Run {
        /// Target date, YYYY-MM-DD (default: today)
        #[arg(long)]
        date: Option<String>,
    },
}

pub fn run(ctx: &Context, action: BatchAction) -> CliResult {
    match action {
        BatchAction::Run { date } => {
            let now = Utc::now();
            let target = date_or_today(date.as_deref(), now.date_naive())?;
            let pipeline = ctx.pipeline()?;
            let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
            let result = runtime.block_on(pipeline.run_batch(target, now));
            // Abandoned workers stop at their deadline; do not wait on them past that.
            runtime.shutdown_timeout(Duration::from_secs(SHUTDOWN_GRACE_SECS));
            print_json(&result?)
        }
    }
}
