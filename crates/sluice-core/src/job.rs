//! Query jobs and their terminal results

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One result row, column order preserved
pub type Row = Map<String, Value>;

/// Identifier of one query-execution attempt
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Mint a fresh random id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Job lifecycle. `Running` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Complete,
    Error,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Terminal outcome handed out by `get_job_result`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum JobResult {
    Complete { rows: Vec<Row> },
    Error { message: String },
    Canceled,
}

impl JobResult {
    pub fn status(&self) -> JobStatus {
        match self {
            Self::Complete { .. } => JobStatus::Complete,
            Self::Error { .. } => JobStatus::Error,
            Self::Canceled => JobStatus::Canceled,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Rows of a completed job
    pub fn rows(&self) -> Option<&[Row]> {
        match self {
            Self::Complete { rows } => Some(rows),
            _ => None,
        }
    }
}
