use chrono::{DateTime, Utc};
use clap::Subcommand;
use momentum_core::{Event, EventType, ValidationError};
use serde_json::json;

use super::{print_json, require_user, CliResult, Context};

#[derive(Subcommand)]
pub enum EventAction {
    /// Record an event and run the incremental evaluation for high-signal types
    Add {
        #[arg(long)]
        user: String,
        /// Event type (e.g. "lesson_completion", "journal_entry")
        #[arg(long = "type")]
        event_type: String,
        /// Occurrence time, RFC 3339 (default: now)
        #[arg(long)]
        at: Option<String>,
        /// Event payload as a JSON object
        #[arg(long, default_value = "{}")]
        value: String,
    },
    /// Tombstone every event of a user
    Erase {
        #[arg(long)]
        user: String,
    },
}

pub fn run(ctx: &Context, action: EventAction) -> CliResult {
    match action {
        EventAction::Add {
            user,
            event_type,
            at,
            value,
        } => {
            require_user(&user)?;
            let now = Utc::now();
            let occurred_at = match at {
                Some(raw) => DateTime::parse_from_rfc3339(&raw)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|e| ValidationError::InvalidValue {
                        field: "at".into(),
                        message: e.to_string(),
                    })?,
                None => now,
            };
            let value: serde_json::Value =
                serde_json::from_str(&value).map_err(|e| ValidationError::InvalidValue {
                    field: "value".into(),
                    message: e.to_string(),
                })?;

            let event_type = EventType::parse(&event_type);
            if !event_type.is_known() {
                tracing::warn!(%event_type, "unknown event type, it will not contribute to scores");
            }
            let mut event = Event::new(user, event_type, occurred_at, value);

            let db = ctx.open_db()?;
            event.id = db.insert_event(&event)?;
            let pipeline = ctx.pipeline()?;
            let evaluation = pipeline.on_event_written(&db, &event, now)?;
            print_json(&json!({ "event": event, "evaluation": evaluation }))
        }
        EventAction::Erase { user } => {
            require_user(&user)?;
            let db = ctx.open_db()?;
            let tombstoned = db.tombstone_user_events(&user)?;
            print_json(&json!({ "user_id": user, "tombstoned": tombstoned }))
        }
    }
}
