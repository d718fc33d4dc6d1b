use chrono::Utc;
use clap::Args;

use super::{print_json, CliResult, Context};

#[derive(Args)]
pub struct BackfillArgs {
    /// Number of days ending today to fill
    #[arg(long, default_value_t = 7)]
    days: u32,
    /// Count missing rows without writing them
    #[arg(long)]
    dry_run: bool,
}

pub fn run(ctx: &Context, args: BackfillArgs) -> CliResult {
    let now = Utc::now();
    let db = ctx.open_db()?;
    let summary = db.backfill_missing_scores(args.days, now.date_naive(), args.dry_run, now)?;
    tracing::info!(missing = summary.missing, dry_run = summary.dry_run, "backfill finished");
    print_json(&summary)
}
