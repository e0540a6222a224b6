//! Relation end-points.
//!
//! End-points live in per-transaction arenas keyed by [`RelationEndPointId`].
//! They refer to each other by id only; every operation that needs to reach
//! another end-point receives the arena through an [`EndPointContext`].

use std::collections::BTreeMap;

use relsync_core::{RelationEndPointId, TransactionId};
use serde::{Deserialize, Serialize};

use crate::load_tracker::LoadTracker;
use crate::persistence::LoadContext;

pub mod real;
pub mod virtual_end_point;

pub use real::RealObjectEndPoint;
pub use virtual_end_point::{VirtualEndPoint, VirtualEndPointSnapshot};

/// Whether a real end-point is reflected in its opposite virtual end-point's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    /// The opposite virtual end-point is incomplete; the answer is not known yet.
    Unknown,
    /// The end-point is part of the opposite's materialized data.
    Synchronized,
    /// The end-point exists but the opposite's loaded data does not contain it.
    Unsynchronized,
}

/// Everything a virtual end-point may touch besides itself.
pub struct EndPointContext<'a, 'env> {
    /// The transaction owning the end-points.
    pub transaction: TransactionId,
    /// All real end-points of the transaction.
    pub real_end_points: &'a mut BTreeMap<RelationEndPointId, RealObjectEndPoint>,
    /// Lazy-load counters of the transaction.
    pub load_tracker: &'a mut LoadTracker,
    /// Collaborators: persistence, data-keeper factory and listener.
    pub env: &'a mut LoadContext<'env>,
}

impl EndPointContext<'_, '_> {
    /// Change the sync state of a registered real end-point.
    ///
    /// Unknown ids are ignored: the end-point may belong to an object that is
    /// not loaded in this transaction.
    pub(crate) fn set_sync_state(&mut self, end_point: &RelationEndPointId, state: SyncState) {
        if let Some(real) = self.real_end_points.get_mut(end_point) {
            real.set_sync_state(state);
        }
    }

    /// Sync state of a registered real end-point.
    pub(crate) fn sync_state(&self, end_point: &RelationEndPointId) -> Option<SyncState> {
        self.real_end_points
            .get(end_point)
            .map(RealObjectEndPoint::sync_state)
    }
}
