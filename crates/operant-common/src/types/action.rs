//! Action records
//!
//! An [`ActionRecord`] describes one behavioral event: either a tracked
//! observation, or a reinforced action carrying the decision that was
//! served for it. Records are immutable once queued, except for metadata
//! merging at capture time.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{OperantError, Result};
use crate::time::{timezone_offset_ms, utc_now_ms};

/// One behavioral event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionRecord {
    /// Identifier of the behavior, as configured remotely
    pub action_id: String,
    /// Decision served for the action; set only on reported records
    pub decision: Option<String>,
    /// Caller-supplied event details, insertion-ordered
    pub metadata: Option<Map<String, Value>>,
    /// Time the action occurred, UTC milliseconds
    pub occurred_at_utc_ms: i64,
    /// Local timezone offset at capture time, milliseconds
    pub timezone_offset_ms: i64,
}

impl ActionRecord {
    /// Create a record stamped with the current time and local offset
    pub fn new(action_id: impl Into<String>) -> Self {
        Self {
            action_id: action_id.into(),
            decision: None,
            metadata: None,
            occurred_at_utc_ms: utc_now_ms(),
            timezone_offset_ms: timezone_offset_ms(),
        }
    }

    /// Attach the decision served for this action
    pub fn with_decision(mut self, decision: impl Into<String>) -> Self {
        self.decision = Some(decision.into());
        self
    }

    /// Attach caller-supplied metadata
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Merge additional metadata; new keys overwrite existing on conflict
    pub fn merge_metadata(&mut self, new_data: Map<String, Value>) {
        match &mut self.metadata {
            Some(existing) => {
                for (key, value) in new_data {
                    existing.insert(key, value);
                }
            }
            None => self.metadata = Some(new_data),
        }
    }

    /// Validate the record
    pub fn validate(&self) -> Result<()> {
        if self.action_id.is_empty() {
            return Err(OperantError::Validation("action_id is required".into()));
        }
        Ok(())
    }
}
