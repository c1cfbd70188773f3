// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use freja_config::ThinkingLevel;
use freja_model::Message;

/// File-operation lists chained across compactions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileOpsDetails {
    #[serde(default)]
    pub read_files: Vec<String>,
    #[serde(default)]
    pub modified_files: Vec<String>,
}

/// Type-specific payload of one persisted entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryPayload {
    /// File header; always the first line, the root of the entry tree.
    Session { cwd: String, created_at: DateTime<Utc> },
    Message { message: Message },
    /// Application-defined entry, opaque to the core.
    CustomMessage { tag: String, payload: Value },
    /// Summary of an abandoned branch, written when forking away from it.
    BranchSummary { summary: String },
    /// A compaction boundary: context before `first_kept_entry_id` is
    /// replaced by `summary` on this path.
    Compaction {
        summary: String,
        first_kept_entry_id: String,
        tokens_before: u64,
        #[serde(default)]
        details: FileOpsDetails,
    },
    ThinkingLevelChange { thinking_level: ThinkingLevel },
    ModelChange { provider: String, model_id: String },
    /// A user-assigned name for the state at this point of the path.
    Label { label: String },
}

impl EntryPayload {
    /// Whether the payload is a conversation message (as opposed to a
    /// settings change or marker).  Used by the compaction cut-point rules.
    pub fn is_message(&self) -> bool {
        matches!(
            self,
            Self::Message { .. }
                | Self::CustomMessage { .. }
                | Self::BranchSummary { .. }
                | Self::Compaction { .. }
        )
    }
}

/// One line of the session log.  `parent` is `None` only on the header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEntry {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EntryPayload,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(payload: EntryPayload) -> SessionEntry {
        SessionEntry {
            id: "01J000000000000000000000AA".into(),
            parent: Some("01J000000000000000000000A0".into()),
            timestamp: Utc::now(),
            payload,
        }
    }

    #[test]
    fn header_serialises_with_session_tag() {
        let e = SessionEntry {
            id: "01J0000000000000000000000X".into(),
            parent: None,
            timestamp: Utc::now(),
            payload: EntryPayload::Session { cwd: "/home/user/proj".into(), created_at: Utc::now() },
        };
        let line = serde_json::to_string(&e).unwrap();
        assert!(line.contains(r#""type":"session""#), "got: {line}");
        assert!(!line.contains("\"parent\""), "root has no parent field: {line}");
    }

    #[test]
    fn message_entry_round_trips() {
        let e = entry(EntryPayload::Message { message: Message::user("hi") });
        let line = serde_json::to_string(&e).unwrap();
        let back: SessionEntry = serde_json::from_str(&line).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn compaction_entry_round_trips_with_details() {
        let e = entry(EntryPayload::Compaction {
            summary: "## Goal\nship it".into(),
            first_kept_entry_id: "01J000000000000000000000A5".into(),
            tokens_before: 120_000,
            details: FileOpsDetails {
                read_files: vec!["src/lib.rs".into()],
                modified_files: vec!["src/agent.rs".into()],
            },
        });
        let line = serde_json::to_string(&e).unwrap();
        assert!(line.contains(r#""type":"compaction""#));
        let back: SessionEntry = serde_json::from_str(&line).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn all_type_tags_have_their_documented_spelling() {
        let cases: Vec<(EntryPayload, &str)> = vec![
            (EntryPayload::CustomMessage { tag: "t".into(), payload: Value::Null }, "custom_message"),
            (EntryPayload::BranchSummary { summary: "s".into() }, "branch_summary"),
            (
                EntryPayload::ThinkingLevelChange { thinking_level: ThinkingLevel::High },
                "thinking_level_change",
            ),
            (
                EntryPayload::ModelChange { provider: "mock".into(), model_id: "m".into() },
                "model_change",
            ),
            (EntryPayload::Label { label: "v1".into() }, "label"),
        ];
        for (payload, tag) in cases {
            let line = serde_json::to_string(&entry(payload)).unwrap();
            assert!(line.contains(&format!(r#""type":"{tag}""#)), "missing {tag} in {line}");
        }
    }

    #[test]
    fn is_message_classification() {
        assert!(EntryPayload::Message { message: Message::user("x") }.is_message());
        assert!(EntryPayload::BranchSummary { summary: "s".into() }.is_message());
        assert!(!EntryPayload::Label { label: "l".into() }.is_message());
        assert!(!EntryPayload::ThinkingLevelChange { thinking_level: ThinkingLevel::Off }.is_message());
    }
}
