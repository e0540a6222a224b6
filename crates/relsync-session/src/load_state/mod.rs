//! Load states of virtual end-points.
//!
//! A virtual end-point is always in exactly one of two states. The state is
//! replaced as a whole on every transition, never patched in place.

use std::collections::{BTreeMap, BTreeSet};

use relsync_core::{Error, RelationEndPointId, Result, TransactionErrorKind};
use serde::{Deserialize, Serialize};

use crate::data_keeper::{VirtualEndPointDataKeeper, VirtualEndPointDataKeeperSnapshot};

pub mod complete;
pub mod incomplete;

pub use complete::CompleteLoadState;
pub use incomplete::IncompleteLoadState;

/// The current load state of a virtual end-point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VirtualEndPointLoadState {
    /// Related objects not loaded.
    Incomplete(IncompleteLoadState),
    /// Related objects loaded and materialized in a data keeper.
    Complete(CompleteLoadState),
}

impl Default for VirtualEndPointLoadState {
    fn default() -> Self {
        VirtualEndPointLoadState::Incomplete(IncompleteLoadState::new())
    }
}

impl VirtualEndPointLoadState {
    /// Whether the related objects are loaded.
    pub fn is_data_complete(&self) -> bool {
        match self {
            VirtualEndPointLoadState::Incomplete(state) => state.is_data_complete(),
            VirtualEndPointLoadState::Complete(state) => state.is_data_complete(),
        }
    }

    /// Flatten into a serializable snapshot.
    pub fn snapshot(&self) -> LoadStateSnapshot {
        match self {
            VirtualEndPointLoadState::Incomplete(state) => LoadStateSnapshot::Incomplete {
                original_opposite_end_points: state.original_opposite_end_points().cloned().collect(),
            },
            VirtualEndPointLoadState::Complete(state) => LoadStateSnapshot::Complete {
                data_keeper: state.data_keeper().snapshot(),
                unsynchronized_opposite_end_points: state
                    .unsynchronized_opposite_end_points()
                    .cloned()
                    .collect(),
            },
        }
    }

    /// Rebuild a state from a snapshot.
    ///
    /// Rejects snapshots that break the bookkeeping rules: a keeper for a
    /// different end-point, duplicate opposite end-points, or an unsynchronized
    /// end-point whose object is part of the loaded data.
    pub fn from_snapshot(end_point_id: &RelationEndPointId, snapshot: LoadStateSnapshot) -> Result<Self> {
        let invalid = |message: String| {
            Error::transaction(
                TransactionErrorKind::InvalidSnapshot,
                format!("load state of '{end_point_id}': {message}"),
            )
        };

        match snapshot {
            LoadStateSnapshot::Incomplete {
                original_opposite_end_points,
            } => {
                let mut state = IncompleteLoadState::new();
                let mut seen = BTreeSet::new();
                for opposite in original_opposite_end_points {
                    if !seen.insert(opposite.object_id().clone()) {
                        return Err(invalid(format!("'{opposite}' is registered twice")));
                    }
                    state.restore_original_opposite_end_point(opposite);
                }
                Ok(VirtualEndPointLoadState::Incomplete(state))
            }
            LoadStateSnapshot::Complete {
                data_keeper,
                unsynchronized_opposite_end_points,
            } => {
                if data_keeper.end_point_id != *end_point_id {
                    return Err(invalid(format!(
                        "data keeper belongs to '{}'",
                        data_keeper.end_point_id
                    )));
                }
                let data_keeper = VirtualEndPointDataKeeper::from_snapshot(data_keeper)?;
                let mut unsynchronized = BTreeMap::new();
                for opposite in unsynchronized_opposite_end_points {
                    if data_keeper.contains_original_object_id(opposite.object_id()) {
                        return Err(invalid(format!(
                            "'{opposite}' is unsynchronized but its object is part of the data"
                        )));
                    }
                    if unsynchronized
                        .insert(opposite.object_id().clone(), opposite.clone())
                        .is_some()
                    {
                        return Err(invalid(format!("'{opposite}' is registered twice")));
                    }
                }
                Ok(VirtualEndPointLoadState::Complete(
                    CompleteLoadState::from_parts(data_keeper, unsynchronized),
                ))
            }
        }
    }
}

/// Serializable form of a [`VirtualEndPointLoadState`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LoadStateSnapshot {
    /// Not loaded; only the known original opposite end-points.
    Incomplete {
        /// Real end-points registered while incomplete.
        original_opposite_end_points: Vec<RelationEndPointId>,
    },
    /// Loaded.
    Complete {
        /// The materialized data.
        data_keeper: VirtualEndPointDataKeeperSnapshot,
        /// Real end-points not reflected in the data.
        unsynchronized_opposite_end_points: Vec<RelationEndPointId>,
    },
}
