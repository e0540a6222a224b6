//! Virtual end-points and the load-then-delegate protocol.

use relsync_core::{
    Cardinality, Error, InvariantViolationKind, ObjectId, RelationEndPointId, Result,
    TransactionErrorKind,
};
use serde::{Deserialize, Serialize};

use super::EndPointContext;
use crate::load_state::{CompleteLoadState, LoadStateSnapshot, VirtualEndPointLoadState};

/// The side of a relation that has no foreign key of its own.
///
/// Its data is derived from the real end-points pointing at the owner. Every
/// accessor first makes the data complete (lazily loading it through the
/// persistence collaborator) and then delegates to the Complete state, so
/// callers never check completeness themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualEndPoint {
    id: RelationEndPointId,
    cardinality: Cardinality,
    load_state: VirtualEndPointLoadState,
}

impl VirtualEndPoint {
    /// Create an end-point in the Incomplete state.
    pub fn new(id: RelationEndPointId, cardinality: Cardinality) -> Self {
        Self {
            id,
            cardinality,
            load_state: VirtualEndPointLoadState::default(),
        }
    }

    /// The end-point id.
    pub fn id(&self) -> &RelationEndPointId {
        &self.id
    }

    /// Whether the end-point holds one or many objects.
    pub fn cardinality(&self) -> Cardinality {
        self.cardinality
    }

    /// The current load state.
    pub fn load_state(&self) -> &VirtualEndPointLoadState {
        &self.load_state
    }

    /// Whether the related objects are loaded. Never triggers a load.
    pub fn is_data_complete(&self) -> bool {
        self.load_state.is_data_complete()
    }

    /// The Complete state, if the data is loaded. Never triggers a load.
    pub fn complete_state(&self) -> Option<&CompleteLoadState> {
        match &self.load_state {
            VirtualEndPointLoadState::Complete(state) => Some(state),
            VirtualEndPointLoadState::Incomplete(_) => None,
        }
    }

    /// Whether the current data differs from the original data. Never triggers a load.
    pub fn has_changed(&self) -> bool {
        match &self.load_state {
            VirtualEndPointLoadState::Incomplete(state) => state.has_changed(),
            VirtualEndPointLoadState::Complete(state) => state.has_changed(),
        }
    }

    /// Load the related objects unless they already are. Idempotent.
    pub fn ensure_data_complete(&mut self, ctx: &mut EndPointContext<'_, '_>) -> Result<()> {
        if let VirtualEndPointLoadState::Incomplete(state) = &self.load_state {
            let complete = state.ensure_data_complete(&self.id, self.cardinality, ctx)?;
            self.install_complete(complete, ctx);
        }
        Ok(())
    }

    /// Complete the end-point with `items` without asking the persistence collaborator.
    pub fn mark_data_complete(
        &mut self,
        items: Vec<ObjectId>,
        ctx: &mut EndPointContext<'_, '_>,
    ) -> Result<()> {
        match &self.load_state {
            VirtualEndPointLoadState::Complete(state) => state.mark_data_complete(&self.id),
            VirtualEndPointLoadState::Incomplete(state) => {
                let complete = state.mark_data_complete(&self.id, self.cardinality, items, ctx)?;
                self.install_complete(complete, ctx);
                Ok(())
            }
        }
    }

    fn install_complete(&mut self, complete: CompleteLoadState, ctx: &mut EndPointContext<'_, '_>) {
        tracing::debug!(
            end_point = %self.id,
            items = complete.current_data().len(),
            unsynchronized = complete.unsynchronized_opposite_end_points().count(),
            "Virtual end-point marked complete"
        );
        self.load_state = VirtualEndPointLoadState::Complete(complete);
        ctx.env
            .listener
            .relation_end_point_loaded(ctx.transaction, &self.id);
    }

    /// Forget the loaded data.
    ///
    /// The known original opposite end-points are re-registered on the new
    /// Incomplete state, so their sync state becomes unknown again.
    pub fn mark_data_incomplete(&mut self, ctx: &mut EndPointContext<'_, '_>) -> Result<()> {
        match std::mem::take(&mut self.load_state) {
            VirtualEndPointLoadState::Incomplete(state) => {
                let result = state.mark_data_incomplete(&self.id);
                self.load_state = VirtualEndPointLoadState::Incomplete(state);
                result
            }
            VirtualEndPointLoadState::Complete(state) => {
                let load_state = &mut self.load_state;
                let originals = state.mark_data_incomplete(&self.id, ctx, |incomplete| {
                    *load_state = VirtualEndPointLoadState::Incomplete(incomplete);
                });
                for opposite in &originals {
                    self.register_original_opposite_end_point(opposite, ctx)?;
                }
                Ok(())
            }
        }
    }

    fn loaded_state(&mut self, ctx: &mut EndPointContext<'_, '_>) -> Result<&mut CompleteLoadState> {
        self.ensure_data_complete(ctx)?;
        match &mut self.load_state {
            VirtualEndPointLoadState::Complete(state) => Ok(state),
            VirtualEndPointLoadState::Incomplete(_) => Err(Error::invariant(
                InvariantViolationKind::NotComplete,
                self.id.clone(),
                "the data is still incomplete after loading",
            )),
        }
    }

    /// Register a real end-point whose original foreign key points at the owner.
    ///
    /// Never triggers a load.
    pub fn register_original_opposite_end_point(
        &mut self,
        opposite: &RelationEndPointId,
        ctx: &mut EndPointContext<'_, '_>,
    ) -> Result<()> {
        match &mut self.load_state {
            VirtualEndPointLoadState::Incomplete(state) => {
                state.register_original_opposite_end_point(&self.id, opposite, ctx)
            }
            VirtualEndPointLoadState::Complete(state) => {
                state.register_original_opposite_end_point(&self.id, opposite, ctx)
            }
        }
    }

    /// Unregister a real end-point registered as original opposite.
    ///
    /// Removing an unsynchronized end-point is cheap. Removing a synchronized
    /// one invalidates the loaded data, so the end-point goes back to the
    /// Incomplete state first and the end-point is removed from there.
    pub fn unregister_original_opposite_end_point(
        &mut self,
        opposite: &RelationEndPointId,
        ctx: &mut EndPointContext<'_, '_>,
    ) -> Result<()> {
        if let VirtualEndPointLoadState::Complete(state) = &mut self.load_state {
            if state.unregister_unsynchronized_opposite_end_point(opposite) {
                return Ok(());
            }
            self.mark_data_incomplete(ctx)?;
        }
        match &mut self.load_state {
            VirtualEndPointLoadState::Incomplete(state) => {
                state.unregister_original_opposite_end_point(&self.id, opposite)
            }
            VirtualEndPointLoadState::Complete(_) => Err(Error::invariant(
                InvariantViolationKind::AlreadyComplete,
                self.id.clone(),
                "the data is still complete after being marked incomplete",
            )),
        }
    }

    /// Add a synchronized real end-point to the current data.
    pub fn register_current_opposite_end_point(
        &mut self,
        opposite: &RelationEndPointId,
        ctx: &mut EndPointContext<'_, '_>,
    ) -> Result<()> {
        let id = self.id.clone();
        let state = self.loaded_state(ctx)?;
        state.register_current_opposite_end_point(&id, opposite, ctx)
    }

    /// Remove a real end-point from the current data.
    pub fn unregister_current_opposite_end_point(
        &mut self,
        opposite: &RelationEndPointId,
        ctx: &mut EndPointContext<'_, '_>,
    ) -> Result<()> {
        self.loaded_state(ctx)?
            .unregister_current_opposite_end_point(opposite)
    }

    /// The related objects as the application sees them.
    pub fn get_data(&mut self, ctx: &mut EndPointContext<'_, '_>) -> Result<Vec<ObjectId>> {
        Ok(self.loaded_state(ctx)?.current_data().to_vec())
    }

    /// The related objects as loaded or last committed.
    pub fn get_original_data(&mut self, ctx: &mut EndPointContext<'_, '_>) -> Result<Vec<ObjectId>> {
        Ok(self.loaded_state(ctx)?.original_data().to_vec())
    }

    /// Whether every loaded item is backed by a real end-point.
    pub fn is_synchronized(&mut self, ctx: &mut EndPointContext<'_, '_>) -> Result<bool> {
        Ok(self.loaded_state(ctx)?.is_synchronized())
    }

    /// Drop loaded items that no real end-point backs.
    pub fn synchronize(&mut self, ctx: &mut EndPointContext<'_, '_>) -> Result<()> {
        let id = self.id.clone();
        self.loaded_state(ctx)?.synchronize(&id)
    }

    /// Move an unsynchronized real end-point into the loaded data.
    ///
    /// Fails while the data is incomplete.
    pub fn synchronize_opposite_end_point(
        &mut self,
        opposite: &RelationEndPointId,
        ctx: &mut EndPointContext<'_, '_>,
    ) -> Result<()> {
        match &mut self.load_state {
            VirtualEndPointLoadState::Incomplete(state) => {
                state.synchronize_opposite_end_point(&self.id, opposite)
            }
            VirtualEndPointLoadState::Complete(state) => {
                state.synchronize_opposite_end_point(&self.id, opposite, ctx)
            }
        }
    }

    /// Replace the current data with the current data of `source`.
    ///
    /// `source` must be complete; this end-point is loaded first if needed.
    pub fn set_data_from(
        &mut self,
        source: &VirtualEndPoint,
        ctx: &mut EndPointContext<'_, '_>,
    ) -> Result<()> {
        let Some(source_state) = source.complete_state() else {
            return Err(Error::invariant(
                InvariantViolationKind::NotComplete,
                source.id.clone(),
                "cannot copy data from an incomplete end-point",
            ));
        };
        self.loaded_state(ctx)?.set_data_from(source_state);
        Ok(())
    }

    /// Make the current data the original data.
    pub fn commit(&mut self) {
        match &mut self.load_state {
            VirtualEndPointLoadState::Incomplete(state) => state.commit(),
            VirtualEndPointLoadState::Complete(state) => state.commit(),
        }
    }

    /// Reset the current data to the original data.
    pub fn rollback(&mut self) {
        match &mut self.load_state {
            VirtualEndPointLoadState::Incomplete(state) => state.rollback(),
            VirtualEndPointLoadState::Complete(state) => state.rollback(),
        }
    }

    /// Flatten into a serializable snapshot.
    pub fn snapshot(&self) -> VirtualEndPointSnapshot {
        VirtualEndPointSnapshot {
            id: self.id.clone(),
            cardinality: self.cardinality,
            load_state: self.load_state.snapshot(),
        }
    }

    /// Rebuild an end-point from a snapshot.
    pub fn from_snapshot(snapshot: VirtualEndPointSnapshot) -> Result<Self> {
        let load_state = VirtualEndPointLoadState::from_snapshot(&snapshot.id, snapshot.load_state)?;
        if let VirtualEndPointLoadState::Complete(state) = &load_state {
            if state.data_keeper().cardinality() != snapshot.cardinality {
                return Err(Error::transaction(
                    TransactionErrorKind::InvalidSnapshot,
                    format!("cardinality of '{}' does not match its data keeper", snapshot.id),
                ));
            }
        }
        Ok(Self {
            id: snapshot.id,
            cardinality: snapshot.cardinality,
            load_state,
        })
    }
}

/// Serializable form of a [`VirtualEndPoint`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualEndPointSnapshot {
    /// The end-point id.
    pub id: RelationEndPointId,
    /// Cardinality.
    pub cardinality: Cardinality,
    /// Load state, with its data keeper if complete.
    pub load_state: LoadStateSnapshot,
}
