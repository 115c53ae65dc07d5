use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::fmt;

/// Reserved ledger index of the record holding an execution's continuation token
pub const TASK_TOKEN: &str = "TASK_TOKEN";

/// Sort key of a ledger record within its execution
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum LedgerIndex {
    /// One outstanding human-review subtask
    Subtask(String),
    /// The sentinel holding the continuation token
    TaskToken,
}

impl LedgerIndex {
    pub fn as_str(&self) -> &str {
        match self {
            LedgerIndex::Subtask(id) => id,
            LedgerIndex::TaskToken => TASK_TOKEN,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        matches!(self, LedgerIndex::TaskToken)
    }
}

impl From<String> for LedgerIndex {
    fn from(value: String) -> Self {
        if value == TASK_TOKEN {
            LedgerIndex::TaskToken
        } else {
            LedgerIndex::Subtask(value)
        }
    }
}

impl From<&str> for LedgerIndex {
    fn from(value: &str) -> Self {
        LedgerIndex::from(value.to_string())
    }
}

impl From<LedgerIndex> for String {
    fn from(value: LedgerIndex) -> Self {
        match value {
            LedgerIndex::Subtask(id) => id,
            LedgerIndex::TaskToken => TASK_TOKEN.to_string(),
        }
    }
}

impl fmt::Display for LedgerIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single ledger entry keyed by `(execution_id, index)`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerRecord {
    pub execution_id: String,
    pub index: LedgerIndex,
    /// Only set on the sentinel
    pub task_token: Option<String>,
    pub metadata: JsonValue,
    pub created_at: DateTime<Utc>,
}

impl LedgerRecord {
    pub fn subtask(execution_id: &str, subtask_id: &str, metadata: JsonValue) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            index: LedgerIndex::Subtask(subtask_id.to_string()),
            task_token: None,
            metadata,
            created_at: Utc::now(),
        }
    }

    pub fn sentinel(execution_id: &str, task_token: &str) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            index: LedgerIndex::TaskToken,
            task_token: Some(task_token.to_string()),
            metadata: JsonValue::Object(Default::default()),
            created_at: Utc::now(),
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.index.is_sentinel()
    }
}

/// One page of a ledger scan
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub records: Vec<LedgerRecord>,
    /// Index to resume after; `None` when the execution has no further records
    pub next_cursor: Option<String>,
}

/// Outcome delivered to a paused workflow
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ResumeOutcome {
    Success { data: JsonValue },
    Failure { code: String, message: String },
}

impl ResumeOutcome {
    pub fn success(data: JsonValue) -> Self {
        ResumeOutcome::Success { data }
    }

    pub fn failure(code: impl Into<String>, message: impl Into<String>) -> Self {
        ResumeOutcome::Failure {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ResumeOutcome::Success { .. })
    }

    /// Wire shape handed to the orchestrator: `{ok: true, data}` or `{ok: false, error}`
    pub fn to_payload(&self) -> JsonValue {
        match self {
            ResumeOutcome::Success { data } => json!({ "ok": true, "data": data }),
            ResumeOutcome::Failure { code, message } => json!({
                "ok": false,
                "error": { "code": code, "message": message },
            }),
        }
    }
}

/// Result of tearing down a review resource
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Teardown {
    Removed,
    AlreadyRemoved,
}

/// Result of signalling a paused workflow
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Resumption {
    Delivered,
    /// The token was already used (or is no longer known); nothing was sent
    AlreadyConsumed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_from_string_recognizes_sentinel() {
        assert_eq!(LedgerIndex::from("TASK_TOKEN"), LedgerIndex::TaskToken);
        assert_eq!(
            LedgerIndex::from("E1-a"),
            LedgerIndex::Subtask("E1-a".to_string())
        );
        assert_eq!(LedgerIndex::TaskToken.to_string(), TASK_TOKEN);
    }

    #[test]
    fn test_resume_outcome_payload_shape() {
        let ok = ResumeOutcome::success(json!({"ExecutionId": "E1"})).to_payload();
        assert_eq!(ok["ok"], true);
        assert_eq!(ok["data"]["ExecutionId"], "E1");

        let failed = ResumeOutcome::failure("ReviewSetupFailed", "boom").to_payload();
        assert_eq!(failed["ok"], false);
        assert_eq!(failed["error"]["code"], "ReviewSetupFailed");
        assert_eq!(failed["error"]["message"], "boom");
    }
}
