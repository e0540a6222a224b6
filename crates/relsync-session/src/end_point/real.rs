//! Foreign-key holding end-points.

use relsync_core::{DataContainer, ObjectId, RelationEndPointId, Result, Value};
use serde::{Deserialize, Serialize};

use super::SyncState;

/// The side of a relation that is backed by a foreign key.
///
/// The foreign key itself lives in the owning object's [`DataContainer`]; the
/// end-point only carries its identity and its sync state, and reads or
/// writes the key through the container it is handed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealObjectEndPoint {
    id: RelationEndPointId,
    sync_state: SyncState,
}

impl RealObjectEndPoint {
    /// Create an end-point in the given sync state.
    pub fn new(id: RelationEndPointId, sync_state: SyncState) -> Self {
        Self { id, sync_state }
    }

    /// The end-point id (owning object + foreign-key property).
    pub fn id(&self) -> &RelationEndPointId {
        &self.id
    }

    /// The object owning the foreign key.
    pub fn object_id(&self) -> &ObjectId {
        self.id.object_id()
    }

    /// The foreign-key property.
    pub fn property_name(&self) -> &str {
        self.id.property_name()
    }

    /// Current sync state.
    pub fn sync_state(&self) -> SyncState {
        self.sync_state
    }

    /// Whether the end-point is known to be synchronized.
    pub fn is_synchronized(&self) -> bool {
        self.sync_state == SyncState::Synchronized
    }

    pub(crate) fn set_sync_state(&mut self, sync_state: SyncState) {
        if self.sync_state != sync_state {
            tracing::trace!(
                end_point = %self.id,
                from = ?self.sync_state,
                to = ?sync_state,
                "Real end-point sync state changed"
            );
        }
        self.sync_state = sync_state;
    }

    /// The related object in the current view.
    pub fn opposite_object_id(&self, container: &DataContainer) -> Option<ObjectId> {
        container
            .get(self.property_name())
            .and_then(Value::as_reference)
            .cloned()
    }

    /// The related object as loaded or last committed.
    pub fn original_opposite_object_id(&self, container: &DataContainer) -> Option<ObjectId> {
        container
            .original(self.property_name())
            .and_then(Value::as_reference)
            .cloned()
    }

    /// Point the foreign key at `target`.
    pub fn set_opposite_object_id(
        &self,
        container: &mut DataContainer,
        target: Option<ObjectId>,
    ) -> Result<()> {
        container.set_value(self.property_name(), Value::from_reference(target))
    }

    /// Whether the foreign key differs from its original value.
    pub fn has_changed(&self, container: &DataContainer) -> bool {
        container.has_property_changed(self.property_name())
    }

    /// Make the current foreign key the original one.
    pub fn commit(&self, container: &mut DataContainer) {
        container.commit_property(self.property_name());
    }

    /// Reset the foreign key to its original value.
    pub fn rollback(&self, container: &mut DataContainer) {
        container.rollback_property(self.property_name());
    }
}
