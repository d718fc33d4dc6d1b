use chrono::Utc;
use clap::Subcommand;
use serde_json::json;

use super::{print_json, CliResult, Context};

#[derive(Subcommand)]
pub enum InterventionsAction {
    /// List the intervention log, newest last
    List {
        /// Only this user's interventions
        #[arg(long)]
        user: Option<String>,
    },
    /// Show undelivered dispatch requests
    Outbox,
    /// Mark a queued dispatch request as delivered
    Ack {
        /// Outbox entry id
        id: i64,
    },
}

pub fn run(ctx: &Context, action: InterventionsAction) -> CliResult {
    let db = ctx.open_db()?;
    match action {
        InterventionsAction::List { user } => {
            print_json(&db.intervention_records(user.as_deref())?)
        }
        InterventionsAction::Outbox => print_json(&db.pending_dispatches()?),
        InterventionsAction::Ack { id } => {
            let delivered = db.mark_dispatch_delivered(id, Utc::now())?;
            if !delivered {
                eprintln!("no pending outbox entry: {id}");
                std::process::exit(1);
            }
            print_json(&json!({ "id": id, "delivered": true }))
        }
    }
}
