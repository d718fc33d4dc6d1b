//! Boundary to the notification and coach-scheduling systems.
//!
//! The engine hands a [`DispatchRequest`] to a [`DispatchGateway`] and never
//! waits for delivery. Whatever the gateway reports is kept only as the
//! audit status of the intervention record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

use crate::storage::Database;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Push,
    CoachCall,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Push => "push",
            Channel::CoachCall => "coach_call",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "push" => Some(Channel::Push),
            "coach_call" => Some(Channel::CoachCall),
            _ => None,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One delivery request. Requests of the same intervention share a
/// `correlation_id`, which is also the intervention record id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub user_id: String,
    pub channel: Channel,
    pub template_id: String,
    pub payload: serde_json::Value,
    pub correlation_id: Uuid,
}

/// Best-effort outcome recorded on the intervention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    /// Every request was accepted by the gateway
    Dispatched,
    /// At least one request was rejected; the intervention still counts
    Failed,
}

impl DispatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchStatus::Dispatched => "dispatched",
            DispatchStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "dispatched" => Some(DispatchStatus::Dispatched),
            "failed" => Some(DispatchStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("dispatch gateway unavailable: {0}")]
    Unavailable(String),
}

/// Every delivery backend implements this trait.
pub trait DispatchGateway: Send + Sync {
    /// Unique identifier used in logs.
    fn name(&self) -> &str;

    /// Hand off a request. Must not block on delivery.
    fn dispatch(&self, request: &DispatchRequest) -> Result<(), DispatchError>;
}

/// Gateway that appends requests to the `dispatch_outbox` table for the
/// delivery side to drain.
pub struct OutboxGateway {
    db: Mutex<Database>,
}

impl OutboxGateway {
    pub fn new(db: Database) -> Self {
        Self { db: Mutex::new(db) }
    }

    fn enqueue(&self, request: &DispatchRequest, now: DateTime<Utc>) -> Result<i64, DispatchError> {
        let db = self
            .db
            .lock()
            .map_err(|_| DispatchError::Unavailable("outbox connection poisoned".into()))?;
        db.enqueue_dispatch(request, now)
            .map_err(|e| DispatchError::Unavailable(e.to_string()))
    }
}

impl DispatchGateway for OutboxGateway {
    fn name(&self) -> &str {
        "outbox"
    }

    fn dispatch(&self, request: &DispatchRequest) -> Result<(), DispatchError> {
        let id = self.enqueue(request, Utc::now())?;
        tracing::debug!(
            outbox_id = id,
            user_id = %request.user_id,
            channel = %request.channel,
            correlation_id = %request.correlation_id,
            "dispatch request queued"
        );
        Ok(())
    }
}
