//! The Incomplete load state.

use std::collections::BTreeMap;

use relsync_core::{
    Cardinality, Error, InvariantViolationKind, ObjectId, RelationEndPointId, Result,
    outcome_into_result,
};

use super::complete::CompleteLoadState;
use crate::end_point::{EndPointContext, SyncState};

/// A virtual end-point whose related objects have not been loaded.
///
/// Holds only the real end-points already known to point at the owner
/// ("original opposite end-points"). Their sync state stays
/// [`SyncState::Unknown`] until the data is loaded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncompleteLoadState {
    original_opposite_end_points: BTreeMap<ObjectId, RelationEndPointId>,
}

impl IncompleteLoadState {
    /// An incomplete state with no known opposite end-points.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Always `false`.
    pub fn is_data_complete(&self) -> bool {
        false
    }

    /// Real end-points registered while the data was incomplete.
    pub fn original_opposite_end_points(&self) -> impl Iterator<Item = &RelationEndPointId> {
        self.original_opposite_end_points.values()
    }

    /// Remember `opposite` until the data is loaded; its sync state becomes unknown.
    pub fn register_original_opposite_end_point(
        &mut self,
        end_point_id: &RelationEndPointId,
        opposite: &RelationEndPointId,
        ctx: &mut EndPointContext<'_, '_>,
    ) -> Result<()> {
        let object_id = opposite.object_id();
        if self.original_opposite_end_points.contains_key(object_id) {
            return Err(Error::invariant(
                InvariantViolationKind::DuplicateEndPoint,
                end_point_id.clone(),
                format!("opposite end-point '{opposite}' is already registered"),
            ));
        }
        self.original_opposite_end_points
            .insert(object_id.clone(), opposite.clone());
        ctx.set_sync_state(opposite, SyncState::Unknown);
        Ok(())
    }

    pub(crate) fn restore_original_opposite_end_point(&mut self, opposite: RelationEndPointId) {
        self.original_opposite_end_points
            .insert(opposite.object_id().clone(), opposite);
    }

    /// Forget a previously registered opposite end-point.
    pub fn unregister_original_opposite_end_point(
        &mut self,
        end_point_id: &RelationEndPointId,
        opposite: &RelationEndPointId,
    ) -> Result<()> {
        match self.original_opposite_end_points.get(opposite.object_id()) {
            Some(registered) if registered == opposite => {
                self.original_opposite_end_points.remove(opposite.object_id());
                Ok(())
            }
            _ => Err(Error::invariant(
                InvariantViolationKind::OppositeEndPointNotRegistered,
                end_point_id.clone(),
                format!("opposite end-point '{opposite}' has not been registered"),
            )),
        }
    }

    /// Fails: the data is already incomplete.
    pub fn mark_data_incomplete(&self, end_point_id: &RelationEndPointId) -> Result<()> {
        Err(Error::invariant(
            InvariantViolationKind::AlreadyIncomplete,
            end_point_id.clone(),
            "the data is already incomplete",
        ))
    }

    /// Fails: an opposite end-point cannot be synchronized against unloaded data.
    pub fn synchronize_opposite_end_point(
        &self,
        end_point_id: &RelationEndPointId,
        opposite: &RelationEndPointId,
    ) -> Result<()> {
        Err(Error::invariant(
            InvariantViolationKind::NotComplete,
            end_point_id.clone(),
            format!(
                "cannot synchronize opposite end-point '{opposite}' while the data is incomplete"
            ),
        ))
    }

    /// Nothing is materialized, so nothing has changed.
    pub fn has_changed(&self) -> bool {
        false
    }

    /// No-op.
    pub fn commit(&mut self) {}

    /// No-op.
    pub fn rollback(&mut self) {}

    /// Ask the persistence collaborator for the related objects.
    pub fn load_data(
        &self,
        end_point_id: &RelationEndPointId,
        ctx: &mut EndPointContext<'_, '_>,
    ) -> Result<Vec<ObjectId>> {
        ctx.load_tracker.record_load(end_point_id);
        let cx = ctx.env.cx;
        let items = outcome_into_result(
            ctx.env
                .persistence
                .load_opposite_objects(cx, end_point_id),
        )?;
        tracing::debug!(
            end_point = %end_point_id,
            items = items.len(),
            "Lazy-loaded relation end-point"
        );
        Ok(items)
    }

    /// Build the Complete state for `items`.
    ///
    /// Every item starts as an "original item without end-point"; the known
    /// opposite end-points are then registered against the new state, which
    /// marks each one synchronized or unsynchronized. `self` is left untouched,
    /// so on failure the end-point simply stays incomplete.
    pub fn mark_data_complete(
        &self,
        end_point_id: &RelationEndPointId,
        cardinality: Cardinality,
        items: Vec<ObjectId>,
        ctx: &mut EndPointContext<'_, '_>,
    ) -> Result<CompleteLoadState> {
        let mut data_keeper = ctx.env.keeper_factory.create(end_point_id, cardinality);
        for item in items {
            data_keeper.register_original_item_without_end_point(item)?;
        }

        let mut complete = CompleteLoadState::new(data_keeper);
        for opposite in self.original_opposite_end_points.values() {
            if let Err(error) =
                complete.register_original_opposite_end_point(end_point_id, opposite, ctx)
            {
                for opposite in self.original_opposite_end_points.values() {
                    ctx.set_sync_state(opposite, SyncState::Unknown);
                }
                return Err(error);
            }
        }

        Ok(complete)
    }

    /// Load the related objects and build the Complete state.
    pub fn ensure_data_complete(
        &self,
        end_point_id: &RelationEndPointId,
        cardinality: Cardinality,
        ctx: &mut EndPointContext<'_, '_>,
    ) -> Result<CompleteLoadState> {
        let items = self.load_data(end_point_id, ctx)?;
        self.mark_data_complete(end_point_id, cardinality, items, ctx)
    }
}
