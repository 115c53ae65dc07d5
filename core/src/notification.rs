//! Inbound completion notifications and subtask identifier parsing

use serde::Deserialize;

use crate::error::BarrierError;
use crate::types::TASK_TOKEN;

/// A subtask reported as finished by the review service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionNotification {
    pub subtask_id: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NotificationWire {
    Direct {
        #[serde(rename = "subtaskIdentifier")]
        subtask_identifier: String,
    },
    // Status-change event as emitted by the review service itself
    Envelope {
        detail: EnvelopeDetail,
    },
    Bare(String),
}

#[derive(Deserialize)]
struct EnvelopeDetail {
    #[serde(rename = "humanLoopName")]
    human_loop_name: String,
}

impl CompletionNotification {
    pub fn new(subtask_id: impl Into<String>) -> Self {
        Self {
            subtask_id: subtask_id.into(),
        }
    }

    /// Decode a notification from its JSON form
    ///
    /// Accepts `{"subtaskIdentifier": ...}`, the review service envelope
    /// `{"detail": {"humanLoopName": ...}}`, or a JSON string.
    pub fn from_json(input: &str) -> Result<Self, BarrierError> {
        let wire: NotificationWire = serde_json::from_str(input)
            .map_err(|e| BarrierError::parse(input, format!("invalid notification: {}", e)))?;

        let subtask_id = match wire {
            NotificationWire::Direct { subtask_identifier } => subtask_identifier,
            NotificationWire::Envelope { detail } => detail.human_loop_name,
            NotificationWire::Bare(id) => id,
        };

        Ok(Self::new(subtask_id))
    }

    /// Decode either a JSON notification or a raw subtask identifier
    pub fn from_input(input: &str) -> Result<Self, BarrierError> {
        let trimmed = input.trim();
        if trimmed.starts_with('{') || trimmed.starts_with('"') {
            Self::from_json(trimmed)
        } else {
            Ok(Self::new(trimmed))
        }
    }
}

/// A subtask identifier split into `<execution_id><separator><suffix>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtaskId {
    raw: String,
    split: usize,
    separator_len: usize,
}

impl SubtaskId {
    /// Split on the LAST occurrence of `separator`
    ///
    /// The execution id may itself contain the separator, the suffix may not.
    pub fn parse(raw: &str, separator: char) -> Result<Self, BarrierError> {
        if raw == TASK_TOKEN {
            return Err(BarrierError::parse(raw, "reserved sentinel index"));
        }

        let split = raw
            .rfind(separator)
            .ok_or_else(|| BarrierError::parse(raw, format!("no '{}' separator", separator)))?;

        if split == 0 {
            return Err(BarrierError::parse(raw, "empty execution id"));
        }
        let separator_len = separator.len_utf8();
        if split + separator_len == raw.len() {
            return Err(BarrierError::parse(raw, "empty subtask suffix"));
        }

        Ok(Self {
            raw: raw.to_string(),
            split,
            separator_len,
        })
    }

    pub fn execution_id(&self) -> &str {
        &self.raw[..self.split]
    }

    pub fn suffix(&self) -> &str {
        &self.raw[self.split + self.separator_len..]
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Compose an identifier the way the dispatcher names its subtasks
    pub fn compose(execution_id: &str, separator: char, suffix: &str) -> Result<Self, BarrierError> {
        if suffix.contains(separator) {
            return Err(BarrierError::parse(
                suffix,
                format!("subtask suffix must not contain '{}'", separator),
            ));
        }
        Self::parse(&format!("{}{}{}", execution_id, separator, suffix), separator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_splits_on_last_separator() {
        let id = SubtaskId::parse("exec-123-subtaskA", '-').unwrap();
        assert_eq!(id.execution_id(), "exec-123");
        assert_eq!(id.suffix(), "subtaskA");
        assert_eq!(id.as_str(), "exec-123-subtaskA");
    }

    #[test]
    fn test_parse_execution_id_with_many_separators() {
        let id = SubtaskId::parse("a-b-c-d-7", '-').unwrap();
        assert_eq!(id.execution_id(), "a-b-c-d");
        assert_eq!(id.suffix(), "7");
    }

    #[test]
    fn test_parse_rejects_malformed_identifiers() {
        for raw in ["nosep", "-suffix", "exec-", "", "TASK_TOKEN"] {
            let err = SubtaskId::parse(raw, '-').unwrap_err();
            assert!(matches!(err, BarrierError::Parse { .. }), "{raw}");
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn test_parse_multibyte_separator() {
        let id = SubtaskId::parse("run·1·x", '·').unwrap();
        assert_eq!(id.execution_id(), "run·1");
        assert_eq!(id.suffix(), "x");
    }

    #[test]
    fn test_compose_rejects_separator_in_suffix() {
        assert!(SubtaskId::compose("E1", '-', "a-b").is_err());
        let id = SubtaskId::compose("E-1", '-', "3").unwrap();
        assert_eq!(id.as_str(), "E-1-3");
        assert_eq!(id.execution_id(), "E-1");
    }

    #[test]
    fn test_notification_wire_forms() {
        let direct = CompletionNotification::from_json(r#"{"subtaskIdentifier": "E1-a"}"#).unwrap();
        assert_eq!(direct.subtask_id, "E1-a");

        let envelope = CompletionNotification::from_json(
            r#"{"source": "aws.sagemaker", "detail": {"humanLoopName": "E1-b", "humanLoopStatus": "Completed"}}"#,
        )
        .unwrap();
        assert_eq!(envelope.subtask_id, "E1-b");

        let bare = CompletionNotification::from_input("  E1-c \n").unwrap();
        assert_eq!(bare.subtask_id, "E1-c");

        assert!(CompletionNotification::from_json(r#"{"other": 1}"#).is_err());
    }
}
