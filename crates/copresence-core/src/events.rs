//! Wire messages between a viewer's transport and its session.

use serde::{Deserialize, Serialize};

use crate::diff::PresenceEvent;
use crate::errors::{PresenceError, Result};
use crate::ids::{RoomId, SessionToken, ViewerId};
use crate::presence::{PresenceRecord, Position};

/// Inbound command from a viewer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Caret moved.
    CursorMoved {
        /// Line of the caret.
        line: u32,
        /// Column of the caret.
        column: u32,
    },
    /// A range was highlighted.
    TextSelected {
        /// Anchor of the drag.
        start: Position,
        /// Head of the drag.
        end: Position,
    },
    /// Highlight removed.
    SelectionCleared,
    /// Application-level keepalive; also triggers a pending resync.
    Heartbeat,
    /// The viewer is leaving for good.
    Disconnect,
}

impl ClientCommand {
    /// Decode a text frame.
    ///
    /// Anything that is not a well-formed command (non-numeric or negative
    /// coordinates, missing fields, unknown `type`) is `MalformedInput`.
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| PresenceError::MalformedInput(e.to_string()))
    }

    /// Whether this command edits the presence record (and so is throttled).
    #[must_use]
    pub fn is_presence_update(&self) -> bool {
        matches!(
            self,
            Self::CursorMoved { .. } | Self::TextSelected { .. } | Self::SelectionCleared
        )
    }
}

/// Full membership of a room at one sequence number.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Room the snapshot describes.
    pub room_id: RoomId,
    /// The receiving viewer's own id.
    pub viewer_id: ViewerId,
    /// Token to present when reconnecting.
    pub resume_token: SessionToken,
    /// Room sequence the snapshot was taken at.
    pub seq: u64,
    /// Every record live at `seq`.
    pub records: Vec<PresenceRecord>,
}

/// Outbound event to a viewer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Sent at join, on resume, and after any resync.
    InitialSnapshot(Snapshot),
    /// Sent on every change after the snapshot.
    PresenceDiff(PresenceEvent),
}

impl ServerEvent {
    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::PresenceDiff;
    use assert_matches::assert_matches;

    #[test]
    fn parse_cursor_moved() {
        let cmd = ClientCommand::parse(r#"{"type":"cursor_moved","line":5,"column":10}"#).unwrap();
        assert_eq!(cmd, ClientCommand::CursorMoved { line: 5, column: 10 });
        assert!(cmd.is_presence_update());
    }

    #[test]
    fn parse_text_selected() {
        let cmd = ClientCommand::parse(
            r#"{"type":"text_selected","start":{"line":1,"column":0},"end":{"line":2,"column":4}}"#,
        )
        .unwrap();
        assert_matches!(cmd, ClientCommand::TextSelected { .. });
    }

    #[test]
    fn parse_unit_commands() {
        assert_eq!(
            ClientCommand::parse(r#"{"type":"selection_cleared"}"#).unwrap(),
            ClientCommand::SelectionCleared
        );
        assert_eq!(
            ClientCommand::parse(r#"{"type":"heartbeat"}"#).unwrap(),
            ClientCommand::Heartbeat
        );
        assert!(!ClientCommand::Disconnect.is_presence_update());
    }

    #[test]
    fn non_numeric_coordinates_are_malformed() {
        let err = ClientCommand::parse(r#"{"type":"cursor_moved","line":"five","column":10}"#)
            .unwrap_err();
        assert_matches!(err, PresenceError::MalformedInput(_));
    }

    #[test]
    fn negative_and_fractional_coordinates_are_malformed() {
        assert!(ClientCommand::parse(r#"{"type":"cursor_moved","line":-1,"column":0}"#).is_err());
        assert!(ClientCommand::parse(r#"{"type":"cursor_moved","line":1.5,"column":0}"#).is_err());
    }

    #[test]
    fn structurally_invalid_selection_is_malformed() {
        assert!(ClientCommand::parse(r#"{"type":"text_selected","start":{"line":1}}"#).is_err());
        assert!(ClientCommand::parse(r#"{"type":"warp_drive"}"#).is_err());
        assert!(ClientCommand::parse("not json").is_err());
    }

    #[test]
    fn snapshot_event_shape() {
        let event = ServerEvent::InitialSnapshot(Snapshot {
            room_id: RoomId::from("doc-1"),
            viewer_id: ViewerId::from("anon-1"),
            resume_token: SessionToken::from("tok"),
            seq: 0,
            records: vec![],
        });
        let value: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "initial_snapshot");
        assert_eq!(value["roomId"], "doc-1");
        assert_eq!(value["resumeToken"], "tok");
        assert!(value["records"].as_array().unwrap().is_empty());
    }

    #[test]
    fn diff_event_round_trips() {
        let record = PresenceRecord::new(ViewerId::from("a"), "A", "#fff");
        let event = ServerEvent::PresenceDiff(PresenceEvent {
            room_id: RoomId::from("doc-1"),
            seq: 7,
            diff: PresenceDiff::join(record),
        });
        let json = event.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "presence_diff");
        assert_eq!(value["seq"], 7);
        let back: ServerEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
