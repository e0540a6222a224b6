//! The Complete load state.

use std::collections::BTreeMap;

use relsync_core::{Error, InvariantViolationKind, ObjectId, RelationEndPointId, Result};

use super::incomplete::IncompleteLoadState;
use crate::data_keeper::VirtualEndPointDataKeeper;
use crate::end_point::{EndPointContext, SyncState};

/// A virtual end-point whose related objects are loaded.
///
/// Two independent "out of sync" conditions are tracked here:
///
/// - items in the data keeper that no real end-point vouches for
///   (see [`is_synchronized`](Self::is_synchronized));
/// - real end-points pointing at the owner that the loaded data does not
///   contain (the unsynchronized opposite end-points).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompleteLoadState {
    data_keeper: VirtualEndPointDataKeeper,
    unsynchronized_opposite_end_points: BTreeMap<ObjectId, RelationEndPointId>,
}

impl CompleteLoadState {
    /// Wrap a data keeper.
    pub fn new(data_keeper: VirtualEndPointDataKeeper) -> Self {
        Self {
            data_keeper,
            unsynchronized_opposite_end_points: BTreeMap::new(),
        }
    }

    pub(crate) fn from_parts(
        data_keeper: VirtualEndPointDataKeeper,
        unsynchronized_opposite_end_points: BTreeMap<ObjectId, RelationEndPointId>,
    ) -> Self {
        Self {
            data_keeper,
            unsynchronized_opposite_end_points,
        }
    }

    /// Always `true`.
    pub fn is_data_complete(&self) -> bool {
        true
    }

    /// The materialized data.
    pub fn data_keeper(&self) -> &VirtualEndPointDataKeeper {
        &self.data_keeper
    }

    /// Related objects as the application sees them.
    pub fn current_data(&self) -> &[ObjectId] {
        self.data_keeper.current_data()
    }

    /// Related objects as loaded or last committed.
    pub fn original_data(&self) -> &[ObjectId] {
        self.data_keeper.original_data()
    }

    /// Real end-points pointing at the owner that the loaded data does not contain.
    pub fn unsynchronized_opposite_end_points(&self) -> impl Iterator<Item = &RelationEndPointId> {
        self.unsynchronized_opposite_end_points.values()
    }

    /// Fails: the data is already complete.
    pub fn mark_data_complete(&self, end_point_id: &RelationEndPointId) -> Result<()> {
        Err(Error::invariant(
            InvariantViolationKind::AlreadyComplete,
            end_point_id.clone(),
            "the data is already complete",
        ))
    }

    /// Hand the end-point back to the Incomplete state.
    ///
    /// Notifies the listener, installs a fresh [`IncompleteLoadState`] through
    /// `set_state`, and returns every original opposite end-point (synchronized
    /// or not) so the caller re-registers them on the new state.
    pub fn mark_data_incomplete(
        self,
        end_point_id: &RelationEndPointId,
        ctx: &EndPointContext<'_, '_>,
        set_state: impl FnOnce(IncompleteLoadState),
    ) -> Vec<RelationEndPointId> {
        ctx.env
            .listener
            .relation_end_point_unloading(ctx.transaction, end_point_id);

        set_state(IncompleteLoadState::new());

        let originals: Vec<RelationEndPointId> = self
            .data_keeper
            .original_opposite_end_points()
            .cloned()
            .chain(self.unsynchronized_opposite_end_points.into_values())
            .collect();
        tracing::debug!(
            end_point = %end_point_id,
            opposites = originals.len(),
            "Virtual end-point marked incomplete"
        );
        originals
    }

    /// Register a real end-point whose original foreign key points at the owner.
    ///
    /// If the loaded data already contains the opposite object the end-point is
    /// synchronized; otherwise it is filed as unsynchronized.
    pub fn register_original_opposite_end_point(
        &mut self,
        end_point_id: &RelationEndPointId,
        opposite: &RelationEndPointId,
        ctx: &mut EndPointContext<'_, '_>,
    ) -> Result<()> {
        let object_id = opposite.object_id();
        if self.data_keeper.contains_original_object_id(object_id) {
            self.data_keeper
                .register_original_opposite_end_point(object_id.clone(), opposite.clone())?;
            ctx.set_sync_state(opposite, SyncState::Synchronized);
        } else {
            if self.unsynchronized_opposite_end_points.contains_key(object_id) {
                return Err(Error::invariant(
                    InvariantViolationKind::DuplicateEndPoint,
                    end_point_id.clone(),
                    format!("opposite end-point '{opposite}' is already registered"),
                ));
            }
            self.unsynchronized_opposite_end_points
                .insert(object_id.clone(), opposite.clone());
            ctx.set_sync_state(opposite, SyncState::Unsynchronized);
            tracing::debug!(
                end_point = %end_point_id,
                opposite = %opposite,
                "Registered unsynchronized opposite end-point"
            );
        }
        Ok(())
    }

    /// Remove `opposite` if it is one of the unsynchronized end-points.
    ///
    /// Returns `false` when it is not; unregistering a synchronized end-point
    /// requires the owner to go back to the Incomplete state first.
    pub fn unregister_unsynchronized_opposite_end_point(
        &mut self,
        opposite: &RelationEndPointId,
    ) -> bool {
        match self.unsynchronized_opposite_end_points.get(opposite.object_id()) {
            Some(registered) if registered == opposite => {
                self.unsynchronized_opposite_end_points
                    .remove(opposite.object_id());
                true
            }
            _ => false,
        }
    }

    /// Add `opposite` to the current view. It must be synchronized.
    pub fn register_current_opposite_end_point(
        &mut self,
        end_point_id: &RelationEndPointId,
        opposite: &RelationEndPointId,
        ctx: &EndPointContext<'_, '_>,
    ) -> Result<()> {
        match ctx.sync_state(opposite) {
            Some(SyncState::Synchronized) => self
                .data_keeper
                .register_current_opposite_end_point(opposite.object_id().clone(), opposite.clone()),
            Some(state) => Err(Error::invariant(
                InvariantViolationKind::UnsynchronizedOppositeEndPoint,
                end_point_id.clone(),
                format!(
                    "opposite end-point '{opposite}' is {state:?}; synchronize it before changing the relation"
                ),
            )),
            None => Err(Error::invariant(
                InvariantViolationKind::MissingEndPoint,
                end_point_id.clone(),
                format!("opposite end-point '{opposite}' is not registered in this transaction"),
            )),
        }
    }

    /// Remove `opposite` from the current view.
    pub fn unregister_current_opposite_end_point(&mut self, opposite: &RelationEndPointId) -> Result<()> {
        self.data_keeper
            .unregister_current_opposite_end_point(opposite.object_id())
    }

    /// Whether every loaded item is backed by a real end-point.
    pub fn is_synchronized(&self) -> bool {
        self.data_keeper.original_items_without_end_points().is_empty()
    }

    /// Drop every loaded item that no real end-point backs.
    pub fn synchronize(&mut self, end_point_id: &RelationEndPointId) -> Result<()> {
        let items: Vec<ObjectId> = self
            .data_keeper
            .original_items_without_end_points()
            .iter()
            .cloned()
            .collect();
        for item in &items {
            self.data_keeper
                .unregister_original_item_without_end_point(item)?;
        }
        if !items.is_empty() {
            tracing::debug!(
                end_point = %end_point_id,
                dropped = items.len(),
                "Synchronized virtual end-point"
            );
        }
        Ok(())
    }

    /// Move `opposite` from the unsynchronized set into the loaded data.
    pub fn synchronize_opposite_end_point(
        &mut self,
        end_point_id: &RelationEndPointId,
        opposite: &RelationEndPointId,
        ctx: &mut EndPointContext<'_, '_>,
    ) -> Result<()> {
        let object_id = opposite.object_id();
        match self.unsynchronized_opposite_end_points.get(object_id) {
            Some(registered) if registered == opposite => {}
            _ => {
                return Err(Error::invariant(
                    InvariantViolationKind::NotUnsynchronized,
                    end_point_id.clone(),
                    format!(
                        "opposite end-point '{opposite}' is not in the list of unsynchronized end-points"
                    ),
                ));
            }
        }

        self.data_keeper
            .register_original_opposite_end_point(object_id.clone(), opposite.clone())?;
        self.unsynchronized_opposite_end_points.remove(object_id);
        ctx.set_sync_state(opposite, SyncState::Synchronized);
        tracing::debug!(
            end_point = %end_point_id,
            opposite = %opposite,
            "Synchronized opposite end-point"
        );
        Ok(())
    }

    /// Whether the current view differs from the original one.
    pub fn has_changed(&self) -> bool {
        self.data_keeper.has_data_changed()
    }

    /// original := current.
    pub fn commit(&mut self) {
        self.data_keeper.commit();
    }

    /// current := original.
    pub fn rollback(&mut self) {
        self.data_keeper.rollback();
    }

    /// Replace the current view with the one of `source`.
    pub fn set_data_from(&mut self, source: &CompleteLoadState) {
        self.data_keeper.set_data_from(&source.data_keeper);
    }
}
