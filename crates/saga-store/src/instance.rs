//! The persisted record of one saga run.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{SagaId, Status};

/// Free-form key/value data.
pub type DataMap = serde_json::Map<String, Value>;

/// Runtime record of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    pub index: usize,
    pub name: String,
    pub status: Status,
    /// Action attempts made so far, across runs.
    pub attempt: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_msg: String,
    /// Values produced by the action, read by its compensation and later steps.
    #[serde(default)]
    pub data: DataMap,
}

impl StepState {
    pub fn new(index: usize, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            status: Status::Pending,
            attempt: 0,
            started_at: None,
            finished_at: None,
            error_msg: String::new(),
            data: DataMap::new(),
        }
    }
}

/// One saga run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: SagaId,
    pub name: String,
    /// Immutable after creation.
    #[serde(default)]
    pub input: DataMap,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Index of the next step to run, `0..=steps.len()`.
    pub current: usize,
    /// Optimistic-concurrency token, bumped by every successful save.
    pub revision: u64,
    pub steps: Vec<StepState>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Instance {
    /// Creates a pending instance with one pending step per name.
    pub fn new<I, S>(
        id: SagaId,
        name: impl Into<String>,
        step_names: I,
        input: DataMap,
        metadata: BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let steps = step_names
            .into_iter()
            .enumerate()
            .map(|(index, name)| StepState::new(index, name))
            .collect();
        Self {
            id,
            name: name.into(),
            input,
            status: Status::Pending,
            created_at: now,
            updated_at: now,
            current: 0,
            revision: 0,
            steps,
            metadata,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns true once every step has been run.
    pub fn is_finished(&self) -> bool {
        self.current >= self.steps.len()
    }

    pub fn increment_revision(&mut self) {
        self.revision += 1;
    }
}
