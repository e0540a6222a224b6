//! Identity map of relation end-points.

use std::collections::BTreeMap;

use relsync_core::{
    Cardinality, Error, InvariantViolationKind, ObjectId, RelationEndPointId, Result,
};

use crate::end_point::{RealObjectEndPoint, VirtualEndPoint};

/// All end-points of one transaction, at most one instance per id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelationEndPointMap {
    real_end_points: BTreeMap<RelationEndPointId, RealObjectEndPoint>,
    virtual_end_points: BTreeMap<RelationEndPointId, VirtualEndPoint>,
}

impl RelationEndPointMap {
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered real end-points.
    pub fn real_count(&self) -> usize {
        self.real_end_points.len()
    }

    /// Number of registered virtual end-points.
    pub fn virtual_count(&self) -> usize {
        self.virtual_end_points.len()
    }

    /// Look up a real end-point.
    pub fn real(&self, id: &RelationEndPointId) -> Option<&RealObjectEndPoint> {
        self.real_end_points.get(id)
    }

    /// Look up a virtual end-point.
    pub fn virtual_end_point(&self, id: &RelationEndPointId) -> Option<&VirtualEndPoint> {
        self.virtual_end_points.get(id)
    }

    /// Iterate real end-points in id order.
    pub fn real_end_points(&self) -> impl Iterator<Item = &RealObjectEndPoint> {
        self.real_end_points.values()
    }

    /// Iterate virtual end-points in id order.
    pub fn virtual_end_points(&self) -> impl Iterator<Item = &VirtualEndPoint> {
        self.virtual_end_points.values()
    }

    /// Register a real end-point; a second registration for the same id fails.
    pub fn register_real(&mut self, end_point: RealObjectEndPoint) -> Result<()> {
        if self.real_end_points.contains_key(end_point.id()) {
            return Err(Error::invariant(
                InvariantViolationKind::DuplicateEndPoint,
                end_point.id().clone(),
                "a real end-point with this id is already registered",
            ));
        }
        self.real_end_points.insert(end_point.id().clone(), end_point);
        Ok(())
    }

    /// Register a virtual end-point; a second registration for the same id fails.
    pub fn register_virtual(&mut self, end_point: VirtualEndPoint) -> Result<()> {
        if self.virtual_end_points.contains_key(end_point.id()) {
            return Err(Error::invariant(
                InvariantViolationKind::DuplicateEndPoint,
                end_point.id().clone(),
                "a virtual end-point with this id is already registered",
            ));
        }
        self.virtual_end_points
            .insert(end_point.id().clone(), end_point);
        Ok(())
    }

    /// The virtual end-point for `id`, created in the Incomplete state on first access.
    ///
    /// The real end-points are lent out alongside, since a virtual end-point
    /// reads and updates them while it loads.
    pub fn get_or_create_virtual(
        &mut self,
        id: &RelationEndPointId,
        cardinality: Cardinality,
    ) -> (
        &mut VirtualEndPoint,
        &mut BTreeMap<RelationEndPointId, RealObjectEndPoint>,
    ) {
        let end_point = self
            .virtual_end_points
            .entry(id.clone())
            .or_insert_with(|| {
                tracing::trace!(end_point = %id, "Created virtual end-point");
                VirtualEndPoint::new(id.clone(), cardinality)
            });
        (end_point, &mut self.real_end_points)
    }

    /// Remove a real end-point.
    pub fn remove_real(&mut self, id: &RelationEndPointId) -> Option<RealObjectEndPoint> {
        self.real_end_points.remove(id)
    }

    /// Remove every end-point owned by `object_id`.
    pub fn remove_end_points_of(&mut self, object_id: &ObjectId) {
        self.real_end_points
            .retain(|id, _| id.object_id() != object_id);
        self.virtual_end_points
            .retain(|id, _| id.object_id() != object_id);
    }

    /// Commit every end-point.
    ///
    /// Real end-points are committed by the caller, which owns the data
    /// containers holding their foreign keys.
    pub fn commit_virtual_end_points(&mut self) {
        for end_point in self.virtual_end_points.values_mut() {
            end_point.commit();
        }
    }

    /// Roll back every virtual end-point.
    pub fn rollback_virtual_end_points(&mut self) {
        for end_point in self.virtual_end_points.values_mut() {
            end_point.rollback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::end_point::SyncState;

    fn orders_of(key: i64) -> RelationEndPointId {
        RelationEndPointId::new(ObjectId::new("Customer", key), "orders")
    }

    #[test]
    fn test_get_or_create_keeps_the_first_instance() {
        let mut map = RelationEndPointMap::new();
        let (created, _) = map.get_or_create_virtual(&orders_of(1), Cardinality::Many);
        assert_eq!(created.cardinality(), Cardinality::Many);
        assert!(!created.is_data_complete());

        // A later request with other parameters still gets the existing end-point.
        let (again, reals) = map.get_or_create_virtual(&orders_of(1), Cardinality::One);
        assert_eq!(again.cardinality(), Cardinality::Many);
        assert!(reals.is_empty());
        assert_eq!(map.virtual_count(), 1);

        let err = map
            .register_virtual(VirtualEndPoint::new(orders_of(1), Cardinality::Many))
            .unwrap_err();
        assert_eq!(err.invariant_kind(), Some(InvariantViolationKind::DuplicateEndPoint));
    }

    #[test]
    fn test_get_or_create_lends_registered_reals() {
        let mut map = RelationEndPointMap::new();
        let real_id = RelationEndPointId::new(ObjectId::new("Order", 1), "customer");
        map.register_real(RealObjectEndPoint::new(real_id.clone(), SyncState::Unknown))
            .unwrap();

        let (_, reals) = map.get_or_create_virtual(&orders_of(1), Cardinality::Many);
        reals
            .get_mut(&real_id)
            .unwrap()
            .set_sync_state(SyncState::Synchronized);
        assert!(map.real(&real_id).unwrap().is_synchronized());
        assert_eq!(map.virtual_count(), 1);
    }

    #[test]
    fn test_duplicate_real_registration_fails() {
        let mut map = RelationEndPointMap::new();
        let id = RelationEndPointId::new(ObjectId::new("Order", 1), "customer");
        map.register_real(RealObjectEndPoint::new(id.clone(), SyncState::Synchronized))
            .unwrap();
        let err = map
            .register_real(RealObjectEndPoint::new(id, SyncState::Unknown))
            .unwrap_err();
        assert_eq!(err.invariant_kind(), Some(InvariantViolationKind::DuplicateEndPoint));
        assert_eq!(map.real_count(), 1);
    }

    #[test]
    fn test_remove_end_points_of_object() {
        let mut map = RelationEndPointMap::new();
        map.get_or_create_virtual(&orders_of(1), Cardinality::Many);
        map.get_or_create_virtual(&orders_of(2), Cardinality::Many);
        map.register_real(RealObjectEndPoint::new(
            RelationEndPointId::new(ObjectId::new("Customer", 1), "region"),
            SyncState::Synchronized,
        ))
        .unwrap();

        map.remove_end_points_of(&ObjectId::new("Customer", 1));
        assert_eq!(map.virtual_count(), 1);
        assert_eq!(map.real_count(), 0);
        assert!(map.virtual_end_point(&orders_of(2)).is_some());
    }
}
