use chrono::{Duration, Utc};
use clap::Subcommand;

use super::{date_or_today, print_json, require_user, CliResult, Context};

#[derive(Subcommand)]
pub enum ScoreAction {
    /// Compute and store a user's score (and evaluate interventions for today)
    Compute {
        #[arg(long)]
        user: String,
        /// Target date, YYYY-MM-DD (default: today)
        #[arg(long)]
        date: Option<String>,
    },
    /// Show stored scores
    History {
        #[arg(long)]
        user: String,
        /// Number of days ending today
        #[arg(long, default_value_t = 14)]
        days: u32,
    },
}

pub fn run(ctx: &Context, action: ScoreAction) -> CliResult {
    let now = Utc::now();
    let today = now.date_naive();
    match action {
        ScoreAction::Compute { user, date } => {
            require_user(&user)?;
            let target = date_or_today(date.as_deref(), today)?;
            let db = ctx.open_db()?;
            let pipeline = ctx.pipeline()?;
            let run = pipeline.run_user(&db, &user, target, now)?;
            print_json(&run)
        }
        ScoreAction::History { user, days } => {
            require_user(&user)?;
            let db = ctx.open_db()?;
            let from = today - Duration::days(i64::from(days.saturating_sub(1)));
            let history = db.score_history(&user, from, today)?;
            print_json(&history)
        }
    }
}
