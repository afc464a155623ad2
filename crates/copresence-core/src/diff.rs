//! Join/leave diffs and the consumer-side merge.
//!
//! An update is expressed as a leave of the old record plus a join of the
//! new one under the same viewer id. Every diff a room emits is wrapped in a
//! [`PresenceEvent`] carrying the room's sequence number, which is what makes
//! [`PresenceView::apply`] idempotent.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::{RoomId, ViewerId};
use crate::presence::PresenceRecord;

/// Incremental membership change for one room.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceDiff {
    /// Records added or replaced.
    pub joins: BTreeMap<ViewerId, PresenceRecord>,
    /// Records removed or replaced.
    pub leaves: BTreeMap<ViewerId, PresenceRecord>,
}

impl PresenceDiff {
    /// A viewer arrived.
    #[must_use]
    pub fn join(record: PresenceRecord) -> Self {
        let mut diff = Self::default();
        let _ = diff.joins.insert(record.viewer_id.clone(), record);
        diff
    }

    /// A viewer left.
    #[must_use]
    pub fn leave(record: PresenceRecord) -> Self {
        let mut diff = Self::default();
        let _ = diff.leaves.insert(record.viewer_id.clone(), record);
        diff
    }

    /// A viewer's record changed.
    #[must_use]
    pub fn replace(old: PresenceRecord, new: PresenceRecord) -> Self {
        let mut diff = Self::leave(old);
        let _ = diff.joins.insert(new.viewer_id.clone(), new);
        diff
    }

    /// Whether the diff carries nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.joins.is_empty() && self.leaves.is_empty()
    }
}

/// A diff stamped with its position in the room's total order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEvent {
    /// Room the diff belongs to.
    pub room_id: RoomId,
    /// Strictly increasing per room.
    pub seq: u64,
    /// The change itself.
    #[serde(flatten)]
    pub diff: PresenceDiff,
}

/// A consumer's copy of a room's membership.
///
/// Seeded from a snapshot, then advanced by events. Events at or below the
/// last applied sequence are ignored, so replays are harmless.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PresenceView {
    records: BTreeMap<ViewerId, PresenceRecord>,
    last_seq: u64,
}

impl PresenceView {
    /// Empty view at sequence zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace everything with a snapshot taken at `seq`.
    pub fn reset(&mut self, seq: u64, records: impl IntoIterator<Item = PresenceRecord>) {
        self.records = records
            .into_iter()
            .map(|r| (r.viewer_id.clone(), r))
            .collect();
        self.last_seq = seq;
    }

    /// Merge an event. Returns `false` if it was already applied.
    pub fn apply(&mut self, event: &PresenceEvent) -> bool {
        if event.seq <= self.last_seq {
            return false;
        }
        for viewer_id in event.diff.leaves.keys() {
            let _ = self.records.remove(viewer_id);
        }
        for (viewer_id, record) in &event.diff.joins {
            let _ = self.records.insert(viewer_id.clone(), record.clone());
        }
        self.last_seq = event.seq;
        true
    }

    /// Sequence of the last applied event or snapshot.
    #[must_use]
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Look up one viewer.
    #[must_use]
    pub fn get(&self, viewer_id: &ViewerId) -> Option<&PresenceRecord> {
        self.records.get(viewer_id)
    }

    /// Number of viewers in view.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nobody is in view.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All records, ordered by viewer id.
    pub fn records(&self) -> impl Iterator<Item = &PresenceRecord> {
        self.records.values()
    }
}
