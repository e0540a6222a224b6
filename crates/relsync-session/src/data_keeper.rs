//! Materialized data of one virtual end-point.
//!
//! A [`VirtualEndPointDataKeeper`] owns the related-object sequence of one
//! complete virtual end-point in two views: the *original* view (as loaded, or
//! as of the last commit) and the *current* view the application works with.
//! It also remembers which real end-points back each item, and which loaded
//! items have no backing end-point yet.

use std::collections::{BTreeMap, BTreeSet};

use relsync_core::{
    Cardinality, Error, InvariantViolationKind, ObjectId, RelationEndPointId, Result,
    TransactionErrorKind,
};
use serde::{Deserialize, Serialize};

/// Creates a fresh data keeper on every Incomplete → Complete transition.
pub trait DataKeeperFactory {
    /// Build an empty keeper for `end_point_id`.
    fn create(
        &self,
        end_point_id: &RelationEndPointId,
        cardinality: Cardinality,
    ) -> VirtualEndPointDataKeeper;
}

/// Factory producing plain [`VirtualEndPointDataKeeper`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultDataKeeperFactory;

impl DataKeeperFactory for DefaultDataKeeperFactory {
    fn create(
        &self,
        end_point_id: &RelationEndPointId,
        cardinality: Cardinality,
    ) -> VirtualEndPointDataKeeper {
        VirtualEndPointDataKeeper::new(end_point_id.clone(), cardinality)
    }
}

/// Owns the related-object collection of one virtual end-point and its change snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualEndPointDataKeeper {
    end_point_id: RelationEndPointId,
    cardinality: Cardinality,
    original_data: Vec<ObjectId>,
    current_data: Vec<ObjectId>,
    /// Opposite object -> its real end-point, for the original view.
    original_opposite_end_points: BTreeMap<ObjectId, RelationEndPointId>,
    /// Opposite object -> its real end-point, for the current view.
    current_opposite_end_points: BTreeMap<ObjectId, RelationEndPointId>,
    original_items_without_end_points: BTreeSet<ObjectId>,
}

impl VirtualEndPointDataKeeper {
    /// Create an empty keeper.
    pub fn new(end_point_id: RelationEndPointId, cardinality: Cardinality) -> Self {
        Self {
            end_point_id,
            cardinality,
            original_data: Vec::new(),
            current_data: Vec::new(),
            original_opposite_end_points: BTreeMap::new(),
            current_opposite_end_points: BTreeMap::new(),
            original_items_without_end_points: BTreeSet::new(),
        }
    }

    /// The end-point this keeper belongs to.
    pub fn end_point_id(&self) -> &RelationEndPointId {
        &self.end_point_id
    }

    /// Cardinality of the end-point.
    pub fn cardinality(&self) -> Cardinality {
        self.cardinality
    }

    /// Related objects as the application sees them.
    pub fn current_data(&self) -> &[ObjectId] {
        &self.current_data
    }

    /// Related objects as loaded or last committed.
    pub fn original_data(&self) -> &[ObjectId] {
        &self.original_data
    }

    /// Real end-points backing the original view.
    pub fn original_opposite_end_points(&self) -> impl Iterator<Item = &RelationEndPointId> {
        self.original_opposite_end_points.values()
    }

    /// Real end-points backing the current view.
    pub fn current_opposite_end_points(&self) -> impl Iterator<Item = &RelationEndPointId> {
        self.current_opposite_end_points.values()
    }

    /// Loaded items no real end-point has vouched for yet.
    pub fn original_items_without_end_points(&self) -> &BTreeSet<ObjectId> {
        &self.original_items_without_end_points
    }

    /// Whether `object_id` is part of the original view.
    pub fn contains_original_object_id(&self, object_id: &ObjectId) -> bool {
        self.original_opposite_end_points.contains_key(object_id)
            || self.original_items_without_end_points.contains(object_id)
    }

    fn violation(&self, kind: InvariantViolationKind, message: String) -> Error {
        Error::invariant(kind, self.end_point_id.clone(), message)
    }

    fn check_room(&self, data: &[ObjectId], object_id: &ObjectId) -> Result<()> {
        if self.cardinality == Cardinality::One && data.iter().any(|item| item != object_id) {
            return Err(self.violation(
                InvariantViolationKind::CardinalityViolation,
                format!(
                    "cannot add '{object_id}': the end-point already holds '{}'",
                    data[0]
                ),
            ));
        }
        Ok(())
    }

    /// Add a loaded item that has no real end-point registered for it yet.
    pub fn register_original_item_without_end_point(&mut self, object_id: ObjectId) -> Result<()> {
        if self.contains_original_object_id(&object_id) {
            return Err(self.violation(
                InvariantViolationKind::DuplicateEndPoint,
                format!("item '{object_id}' is already part of the original data"),
            ));
        }
        self.check_room(&self.original_data, &object_id)?;
        self.original_data.push(object_id.clone());
        if !self.current_data.contains(&object_id) {
            self.current_data.push(object_id.clone());
        }
        self.original_items_without_end_points.insert(object_id);
        Ok(())
    }

    /// Drop an original item that no real end-point backs.
    pub fn unregister_original_item_without_end_point(&mut self, object_id: &ObjectId) -> Result<()> {
        if !self.original_items_without_end_points.remove(object_id) {
            return Err(self.violation(
                InvariantViolationKind::MissingEndPoint,
                format!("item '{object_id}' is not an original item without end-point"),
            ));
        }
        self.original_data.retain(|item| item != object_id);
        self.current_data.retain(|item| item != object_id);
        Ok(())
    }

    /// Record `end_point` as backing `object_id` in both views.
    ///
    /// An item loaded without end-point becomes backed; otherwise the item is
    /// added to the original and current data together.
    pub fn register_original_opposite_end_point(
        &mut self,
        object_id: ObjectId,
        end_point: RelationEndPointId,
    ) -> Result<()> {
        if self.original_opposite_end_points.contains_key(&object_id) {
            return Err(self.violation(
                InvariantViolationKind::DuplicateEndPoint,
                format!("opposite end-point '{end_point}' is already registered"),
            ));
        }
        if !self.original_items_without_end_points.remove(&object_id) {
            self.check_room(&self.original_data, &object_id)?;
            self.check_room(&self.current_data, &object_id)?;
            self.original_data.push(object_id.clone());
            if !self.current_data.contains(&object_id) {
                self.current_data.push(object_id.clone());
            }
        }
        self.current_opposite_end_points
            .insert(object_id.clone(), end_point.clone());
        self.original_opposite_end_points.insert(object_id, end_point);
        Ok(())
    }

    /// Forget `object_id` in both views.
    pub fn unregister_original_opposite_end_point(&mut self, object_id: &ObjectId) -> Result<()> {
        let Some(end_point) = self.original_opposite_end_points.remove(object_id) else {
            return Err(self.violation(
                InvariantViolationKind::OppositeEndPointNotRegistered,
                format!("no original opposite end-point is registered for '{object_id}'"),
            ));
        };
        self.current_opposite_end_points.remove(object_id);
        self.original_data.retain(|item| item != object_id);
        self.current_data.retain(|item| item != object_id);
        tracing::trace!(
            end_point = %self.end_point_id,
            opposite = %end_point,
            "Unregistered original opposite end-point"
        );
        Ok(())
    }

    /// Add `object_id` to the current view only.
    pub fn register_current_opposite_end_point(
        &mut self,
        object_id: ObjectId,
        end_point: RelationEndPointId,
    ) -> Result<()> {
        if self.current_opposite_end_points.contains_key(&object_id) {
            return Err(self.violation(
                InvariantViolationKind::DuplicateEndPoint,
                format!("current opposite end-point '{end_point}' is already registered"),
            ));
        }
        self.check_room(&self.current_data, &object_id)?;
        if !self.current_data.contains(&object_id) {
            self.current_data.push(object_id.clone());
        }
        self.current_opposite_end_points.insert(object_id, end_point);
        Ok(())
    }

    /// Remove `object_id` from the current view only.
    pub fn unregister_current_opposite_end_point(&mut self, object_id: &ObjectId) -> Result<()> {
        if self.current_opposite_end_points.remove(object_id).is_none() {
            return Err(self.violation(
                InvariantViolationKind::MissingEndPoint,
                format!("no current opposite end-point is registered for '{object_id}'"),
            ));
        }
        self.current_data.retain(|item| item != object_id);
        Ok(())
    }

    /// Whether the current view differs from the original one, compared as identity sets.
    pub fn has_data_changed(&self) -> bool {
        let original: BTreeSet<&ObjectId> = self.original_data.iter().collect();
        let current: BTreeSet<&ObjectId> = self.current_data.iter().collect();
        original != current
    }

    /// original := current.
    pub fn commit(&mut self) {
        self.original_data.clone_from(&self.current_data);
        self.original_opposite_end_points
            .clone_from(&self.current_opposite_end_points);
        let current = &self.current_data;
        let backed = &self.current_opposite_end_points;
        self.original_items_without_end_points
            .retain(|item| current.contains(item) && !backed.contains_key(item));
    }

    /// current := original.
    pub fn rollback(&mut self) {
        self.current_data.clone_from(&self.original_data);
        self.current_opposite_end_points
            .clone_from(&self.original_opposite_end_points);
    }

    /// Replace the current view with the current view of `source`.
    ///
    /// Used when a sub-transaction writes its relation changes into its parent.
    pub fn set_data_from(&mut self, source: &VirtualEndPointDataKeeper) {
        self.current_data.clone_from(&source.current_data);
        self.current_opposite_end_points
            .clone_from(&source.current_opposite_end_points);
    }

    /// Flatten into a serializable snapshot.
    pub fn snapshot(&self) -> VirtualEndPointDataKeeperSnapshot {
        VirtualEndPointDataKeeperSnapshot {
            end_point_id: self.end_point_id.clone(),
            cardinality: self.cardinality,
            original_data: self.original_data.clone(),
            current_data: self.current_data.clone(),
            original_opposite_end_points: self.original_opposite_end_points.values().cloned().collect(),
            current_opposite_end_points: self.current_opposite_end_points.values().cloned().collect(),
            original_items_without_end_points: self
                .original_items_without_end_points
                .iter()
                .cloned()
                .collect(),
        }
    }

    /// Rebuild a keeper from a snapshot, checking that the views are consistent.
    pub fn from_snapshot(snapshot: VirtualEndPointDataKeeperSnapshot) -> Result<Self> {
        let invalid = |message: String| {
            Error::transaction(
                TransactionErrorKind::InvalidSnapshot,
                format!("data keeper of '{}': {message}", snapshot.end_point_id),
            )
        };

        if snapshot.cardinality == Cardinality::One
            && (snapshot.original_data.len() > 1 || snapshot.current_data.len() > 1)
        {
            return Err(invalid("one-valued end-point holds several objects".into()));
        }

        let by_object = |end_points: &[RelationEndPointId]| {
            end_points
                .iter()
                .map(|end_point| (end_point.object_id().clone(), end_point.clone()))
                .collect::<BTreeMap<_, _>>()
        };
        let original_opposite_end_points = by_object(&snapshot.original_opposite_end_points);
        let current_opposite_end_points = by_object(&snapshot.current_opposite_end_points);
        let original_items_without_end_points: BTreeSet<ObjectId> = snapshot
            .original_items_without_end_points
            .iter()
            .cloned()
            .collect();

        for object_id in original_opposite_end_points.keys() {
            if !snapshot.original_data.contains(object_id) {
                return Err(invalid(format!("'{object_id}' has an end-point but no data")));
            }
        }
        for object_id in current_opposite_end_points.keys() {
            if !snapshot.current_data.contains(object_id) {
                return Err(invalid(format!("'{object_id}' has an end-point but no data")));
            }
        }
        for object_id in &original_items_without_end_points {
            if original_opposite_end_points.contains_key(object_id)
                || !snapshot.original_data.contains(object_id)
            {
                return Err(invalid(format!(
                    "'{object_id}' is not a valid item without end-point"
                )));
            }
        }

        Ok(Self {
            end_point_id: snapshot.end_point_id,
            cardinality: snapshot.cardinality,
            original_data: snapshot.original_data,
            current_data: snapshot.current_data,
            original_opposite_end_points,
            current_opposite_end_points,
            original_items_without_end_points,
        })
    }
}

/// Serializable form of a [`VirtualEndPointDataKeeper`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualEndPointDataKeeperSnapshot {
    /// The owning end-point.
    pub end_point_id: RelationEndPointId,
    /// Cardinality of the end-point.
    pub cardinality: Cardinality,
    /// Original related objects, in order.
    pub original_data: Vec<ObjectId>,
    /// Current related objects, in order.
    pub current_data: Vec<ObjectId>,
    /// Real end-points backing the original view.
    pub original_opposite_end_points: Vec<RelationEndPointId>,
    /// Real end-points backing the current view.
    pub current_opposite_end_points: Vec<RelationEndPointId>,
    /// Loaded items without a backing end-point.
    pub original_items_without_end_points: Vec<ObjectId>,
}
