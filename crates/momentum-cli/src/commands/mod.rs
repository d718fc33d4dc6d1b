pub mod backfill;
pub mod batch;
pub mod config;
pub mod event;
pub mod interventions;
pub mod score;

use chrono::NaiveDate;
use momentum_core::{Database, InterventionConfig, OutboxGateway, Pipeline, ValidationError};
use std::path::PathBuf;
use std::sync::Arc;

pub type CliResult = Result<(), Box<dyn std::error::Error>>;

/// Paths resolved from the global `--db` / `--config` flags.
pub struct Context {
    db_path: Option<PathBuf>,
    config_path: Option<PathBuf>,
}

impl Context {
    pub fn new(db_path: Option<PathBuf>, config_path: Option<PathBuf>) -> Self {
        Self { db_path, config_path }
    }

    pub fn db_path(&self) -> Result<PathBuf, Box<dyn std::error::Error>> {
        match &self.db_path {
            Some(path) => Ok(path.clone()),
            None => Ok(Database::default_path()?),
        }
    }

    pub fn config_path(&self) -> Result<PathBuf, Box<dyn std::error::Error>> {
        match &self.config_path {
            Some(path) => Ok(path.clone()),
            None => Ok(InterventionConfig::default_path()?),
        }
    }

    pub fn open_db(&self) -> Result<Database, Box<dyn std::error::Error>> {
        Ok(Database::open_at(&self.db_path()?)?)
    }

    /// Loads the config, writing defaults on first use. An invalid file fails.
    pub fn load_config(&self) -> Result<InterventionConfig, Box<dyn std::error::Error>> {
        Ok(InterventionConfig::load_or_init(&self.config_path()?)?)
    }

    /// Pipeline that queues dispatches into the database outbox.
    pub fn pipeline(&self) -> Result<Pipeline, Box<dyn std::error::Error>> {
        let config = Arc::new(self.load_config()?);
        let db_path = self.db_path()?;
        let gateway = OutboxGateway::new(Database::open_at(&db_path)?);
        Ok(Pipeline::new(db_path, config, Arc::new(gateway)))
    }
}

pub fn require_user(user_id: &str) -> Result<(), ValidationError> {
    if user_id.trim().is_empty() {
        return Err(ValidationError::EmptyId("user".into()));
    }
    Ok(())
}

pub fn parse_date(raw: &str) -> Result<NaiveDate, ValidationError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| ValidationError::InvalidDate(raw.to_string()))
}

/// `--date` if given, otherwise today (UTC).
pub fn date_or_today(raw: Option<&str>, today: NaiveDate) -> Result<NaiveDate, ValidationError> {
    raw.map(parse_date).transpose().map(|d| d.unwrap_or(today))
}

pub fn print_json<T: serde::Serialize>(value: &T) -> CliResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
