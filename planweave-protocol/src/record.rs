//! The closed set of record types carried on the generation stream.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ParseFailure;
use crate::patch::PatchOp;

/// Lifecycle comments emitted around a turn. Observers key UI state off
/// these markers, so their spelling is part of the wire contract.
pub mod markers {
    pub const CHAT_START: &str = "CHAT_START";
    pub const CHAT_COMPLETE: &str = "CHAT_COMPLETE";
    pub const MODERATION_START: &str = "MODERATION_START";
    pub const MODERATING: &str = "MODERATING";
}

/// Actions the stream can instruct a client to take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS), ts(export))]
pub enum LockoutAction {
    #[serde(rename = "SHOW_ACCOUNT_LOCKED")]
    ShowAccountLocked,
}

/// A single record on the wire. Every record is a JSON object tagged by
/// its `type` field; anything outside this set is a parse failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS), ts(export))]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Record {
    /// A document mutation produced by the model.
    Patch {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reasoning: Option<String>,
        value: PatchOp,
    },
    /// Conversational text addressed to the user. Ends the assistant's
    /// document-editing phase for the turn.
    Prompt { message: String },
    /// The assistant cannot continue this turn.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// A full document snapshot, used for recovery and auditing.
    State {
        value: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reasoning: Option<String>,
    },
    /// A lifecycle marker; see [`markers`].
    Comment { value: String },
    /// The moderation verdict for the turn that just completed.
    Moderation {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default)]
        categories: Vec<String>,
    },
    /// An instruction for the client, e.g. account lockout.
    Action { action: LockoutAction },
    /// The persistent id assigned to the assistant message.
    Id { value: String },
}

/// Parse one delimited record.
///
/// Failures are logged with the offending text and returned as
/// [`ParseFailure`] so the caller can skip the record and continue.
pub fn parse_record(raw: &str) -> Result<Record, ParseFailure> {
    match serde_json::from_str::<Record>(raw) {
        Ok(record) => Ok(record),
        Err(err) => {
            tracing::warn!(raw, error = %err, "skipping unparseable record");
            Err(ParseFailure::new(raw, err.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_patch_record() {
        let raw = r#"{"type":"patch","reasoning":"adding the title","value":{"op":"add","path":"/title","value":"Forces"}}"#;
        let record = parse_record(raw).unwrap();
        match record {
            Record::Patch { reasoning, value } => {
                assert_eq!(reasoning.as_deref(), Some("adding the title"));
                assert_eq!(value.path(), "/title");
            }
            other => panic!("expected patch, got {other:?}"),
        }
    }

    #[test]
    fn parses_prompt_record() {
        let raw = r#"{"type":"prompt","message":"Shall I fill in the starter quiz?"}"#;
        assert_eq!(
            parse_record(raw).unwrap(),
            Record::Prompt {
                message: "Shall I fill in the starter quiz?".into()
            }
        );
    }

    #[test]
    fn parses_lifecycle_comment() {
        let raw = r#"{"type":"comment","value":"CHAT_START"}"#;
        assert_eq!(
            parse_record(raw).unwrap(),
            Record::Comment {
                value: markers::CHAT_START.into()
            }
        );
    }

    #[test]
    fn parses_moderation_and_action_records() {
        let raw = r#"{"type":"moderation","id":"mod-1","categories":["l/strong-language"]}"#;
        match parse_record(raw).unwrap() {
            Record::Moderation { id, categories } => {
                assert_eq!(id.as_deref(), Some("mod-1"));
                assert_eq!(categories, vec!["l/strong-language"]);
            }
            other => panic!("expected moderation, got {other:?}"),
        }

        let raw = r#"{"type":"action","action":"SHOW_ACCOUNT_LOCKED"}"#;
        assert_eq!(
            parse_record(raw).unwrap(),
            Record::Action {
                action: LockoutAction::ShowAccountLocked
            }
        );
    }

    #[test]
    fn parses_state_snapshot() {
        let raw = r#"{"type":"state","value":{"title":"Forces"}}"#;
        match parse_record(raw).unwrap() {
            Record::State { value, .. } => assert_eq!(value, json!({"title": "Forces"})),
            other => panic!("expected state, got {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_a_parse_failure() {
        let raw = r#"{"type":"telemetry","value":1}"#;
        let err = parse_record(raw).unwrap_err();
        assert_eq!(err.raw, raw);
    }

    #[test]
    fn truncated_json_is_a_parse_failure() {
        assert!(parse_record(r#"{"type":"patch","value":{"op":"add","#).is_err());
    }

    #[test]
    fn patch_without_value_is_a_parse_failure() {
        assert!(parse_record(r#"{"type":"patch"}"#).is_err());
    }
}
