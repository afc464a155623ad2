//! Presence records and partial updates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::ViewerId;

/// A caret location in the shared document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    /// Zero-based line.
    pub line: u32,
    /// Zero-based column.
    pub column: u32,
}

impl Position {
    /// Create a position.
    #[must_use]
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

/// A highlighted range. Always stored with `start <= end`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Selection {
    /// First position of the range.
    pub start: Position,
    /// Last position of the range.
    pub end: Position,
}

impl Selection {
    /// Build a selection, swapping the endpoints of a backwards drag.
    #[must_use]
    pub fn new(a: Position, b: Position) -> Self {
        if a <= b {
            Self { start: a, end: b }
        } else {
            Self { start: b, end: a }
        }
    }
}

/// Whether the viewer's transport is currently attached.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Transport attached.
    #[default]
    Active,
    /// Transport lost, record kept while the grace window runs.
    Disconnected,
}

/// Live state of one viewer in one room.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    /// Unique within the room.
    pub viewer_id: ViewerId,
    /// Label shown next to the cursor.
    pub display_name: String,
    /// CSS hex color, fixed for the session.
    pub color: String,
    /// Caret position, if known.
    pub cursor: Option<Position>,
    /// Highlighted range, if any.
    pub selection: Option<Selection>,
    /// When the record was tracked.
    pub joined_at: DateTime<Utc>,
    /// When the record last changed.
    pub last_update_at: DateTime<Utc>,
    /// Transport state; `Disconnected` means "reconnecting".
    pub connection_state: ConnectionState,
    /// Counter value for anonymous viewers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anonymous_number: Option<u64>,
}

impl PresenceRecord {
    /// Fresh record with no cursor or selection, stamped `now`.
    #[must_use]
    pub fn new(viewer_id: ViewerId, display_name: impl Into<String>, color: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            viewer_id,
            display_name: display_name.into(),
            color: color.into(),
            cursor: None,
            selection: None,
            joined_at: now,
            last_update_at: now,
            connection_state: ConnectionState::Active,
            anonymous_number: None,
        }
    }

    /// True while the viewer's transport is gone but the grace window runs.
    #[must_use]
    pub fn is_reconnecting(&self) -> bool {
        self.connection_state == ConnectionState::Disconnected
    }

    /// Merge `patch` into this record. Unset fields are left alone.
    ///
    /// Returns `true` if any field changed.
    pub fn apply_patch(&mut self, patch: &PresencePatch, now: DateTime<Utc>) -> bool {
        let mut changed = false;
        if let Some(cursor) = patch.cursor {
            changed |= self.cursor != cursor;
            self.cursor = cursor;
        }
        if let Some(selection) = patch.selection {
            changed |= self.selection != selection;
            self.selection = selection;
        }
        if let Some(state) = patch.connection_state {
            changed |= self.connection_state != state;
            self.connection_state = state;
        }
        if changed {
            self.last_update_at = now;
        }
        changed
    }
}

/// Partial update to a [`PresenceRecord`].
///
/// The outer `Option` means "touch this field"; `Some(None)` clears it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PresencePatch {
    /// New cursor.
    pub cursor: Option<Option<Position>>,
    /// New selection.
    pub selection: Option<Option<Selection>>,
    /// New transport state.
    pub connection_state: Option<ConnectionState>,
}

impl PresencePatch {
    /// Move the cursor.
    #[must_use]
    pub fn cursor(position: Position) -> Self {
        Self {
            cursor: Some(Some(position)),
            ..Self::default()
        }
    }

    /// Set the selection.
    #[must_use]
    pub fn selection(selection: Selection) -> Self {
        Self {
            selection: Some(Some(selection)),
            ..Self::default()
        }
    }

    /// Remove the selection.
    #[must_use]
    pub fn clear_selection() -> Self {
        Self {
            selection: Some(None),
            ..Self::default()
        }
    }

    /// Change the transport state.
    #[must_use]
    pub fn connection_state(state: ConnectionState) -> Self {
        Self {
            connection_state: Some(state),
            ..Self::default()
        }
    }

    /// Whether the patch touches nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cursor.is_none() && self.selection.is_none() && self.connection_state.is_none()
    }
}
