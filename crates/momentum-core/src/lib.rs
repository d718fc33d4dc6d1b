//! # Momentum Core Library
//!
//! This library turns a stream of user-behavior events into a decayed,
//! normalized daily momentum score, classifies it into a motivational zone,
//! and decides when a supportive intervention should fire. The `momentum`
//! CLI is a thin operator layer over the same library.
//!
//! ## Architecture
//!
//! - **Score Calculator**: weighted, time-decayed, deduplicated daily score
//!   over a trailing event window, normalized to 0-100
//! - **Zone Classifier**: Rising / Steady / NeedsCare with hysteresis
//! - **Pattern Detector**: sustained low state, sharp drop, sustained high
//!   state and irregular oscillation over recent history
//! - **Rate Limiter**: atomic per-user, per-type caps enforced in SQLite
//! - **Intervention Engine**: acts on at most one candidate per run and
//!   hands it to a [`DispatchGateway`]
//! - **Pipeline**: per-user evaluation, batch worker pool and the
//!   incremental on-write path
//!
//! ## Key Components
//!
//! - [`ScoreCalculator`]: daily score computation
//! - [`Database`]: events, scores, intervention log and outbox
//! - [`InterventionConfig`]: TOML configuration with validation
//! - [`Pipeline`]: batch and incremental entry points

pub mod dispatch;
pub mod engine;
pub mod error;
pub mod events;
pub mod patterns;
pub mod pipeline;
pub mod rate_limit;
pub mod retry;
pub mod scoring;
pub mod storage;
pub mod zones;

pub use dispatch::{
    Channel, DispatchError, DispatchGateway, DispatchRequest, DispatchStatus, OutboxGateway,
};
pub use engine::{EvaluationOutcome, InterventionEngine, InterventionRecord};
pub use error::{ConfigError, CoreError, DatabaseError, ValidationError};
pub use events::{Event, EventPayload, EventSource, EventType};
pub use patterns::{InterventionCandidate, PatternDetector, PatternType, Priority};
pub use pipeline::{BatchReport, Pipeline, UserReport, UserRun, UserStatus};
pub use rate_limit::{InterventionType, RateLimitCounter, RateLimiter};
pub use retry::RetryPolicy;
pub use scoring::{DailyScore, ScoreBreakdown, ScoreCalculator};
pub use storage::{BackfillSummary, ConfigHandle, Database, InterventionConfig, OutboxEntry};
pub use zones::{ScorePoint, Zone, ZoneClassifier};
