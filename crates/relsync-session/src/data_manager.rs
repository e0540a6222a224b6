//! Per-transaction registry of data containers and relation end-points.
//!
//! The [`DataManager`] is the arena behind one transaction level. It owns
//! every [`DataContainer`] and every end-point of that level and keeps both
//! sides of each bidirectional relation consistent while objects are loaded,
//! modified, deleted, unloaded, committed and rolled back.
//!
//! Loads go through the [`LoadContext`] handed to each call; the manager never
//! holds on to its collaborators.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use relsync_core::{
    Cardinality, DataContainer, DataContainerState, EndPointKind, Error, InvariantViolationKind,
    LoadErrorKind, MappingConfiguration, MappingErrorKind, ObjectId, RelationEndPointDefinition,
    RelationEndPointId, Result, TransactionErrorKind, TransactionId, Value, outcome_into_result,
};
use serde::{Deserialize, Serialize};

use crate::end_point::{
    EndPointContext, RealObjectEndPoint, SyncState, VirtualEndPoint, VirtualEndPointSnapshot,
};
use crate::end_point_map::RelationEndPointMap;
use crate::load_tracker::LoadTracker;
use crate::persistence::{LoadContext, PersistableData};

/// Data containers and end-points of one transaction level.
#[derive(Debug, Clone)]
pub struct DataManager {
    transaction: TransactionId,
    mapping: Arc<MappingConfiguration>,
    data_containers: BTreeMap<ObjectId, DataContainer>,
    end_points: RelationEndPointMap,
    invalid_objects: BTreeSet<ObjectId>,
    load_tracker: LoadTracker,
}

impl DataManager {
    /// Create an empty manager for `transaction`.
    pub fn new(
        transaction: TransactionId,
        mapping: Arc<MappingConfiguration>,
        load_tracker: LoadTracker,
    ) -> Self {
        Self {
            transaction,
            mapping,
            data_containers: BTreeMap::new(),
            end_points: RelationEndPointMap::new(),
            invalid_objects: BTreeSet::new(),
            load_tracker,
        }
    }

    /// The transaction this manager belongs to.
    pub fn transaction(&self) -> TransactionId {
        self.transaction
    }

    /// The shared mapping metadata.
    pub fn mapping(&self) -> &Arc<MappingConfiguration> {
        &self.mapping
    }

    /// Lazy-load counters of this level.
    pub fn load_tracker(&self) -> &LoadTracker {
        &self.load_tracker
    }

    /// The end-point arena.
    pub fn end_points(&self) -> &RelationEndPointMap {
        &self.end_points
    }

    /// A loaded data container. Never triggers a load.
    pub fn data_container(&self, object_id: &ObjectId) -> Option<&DataContainer> {
        self.data_containers.get(object_id)
    }

    /// All loaded data containers in id order.
    pub fn data_containers(&self) -> impl Iterator<Item = &DataContainer> {
        self.data_containers.values()
    }

    /// Whether the object was discarded in this transaction.
    pub fn is_invalid(&self, object_id: &ObjectId) -> bool {
        self.invalid_objects.contains(object_id)
    }

    /// Objects discarded in this transaction.
    pub fn invalid_objects(&self) -> impl Iterator<Item = &ObjectId> {
        self.invalid_objects.iter()
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// The data container of `object_id`, loading it on first access.
    pub fn get_data_container(
        &mut self,
        object_id: &ObjectId,
        env: &mut LoadContext<'_>,
    ) -> Result<&DataContainer> {
        self.ensure_loaded(object_id, env)?;
        self.data_containers
            .get(object_id)
            .ok_or_else(|| Error::ObjectInvalid(object_id.clone()))
    }

    fn ensure_loaded(&mut self, object_id: &ObjectId, env: &mut LoadContext<'_>) -> Result<()> {
        if self.invalid_objects.contains(object_id) {
            return Err(Error::ObjectInvalid(object_id.clone()));
        }
        if self.data_containers.contains_key(object_id) {
            return Ok(());
        }
        self.mapping.require_class(object_id.class_id())?;

        let cx = env.cx;
        match outcome_into_result(env.persistence.load_data_container(cx, object_id)) {
            Ok(container) => {
                if container.id() != object_id {
                    return Err(Error::load(
                        LoadErrorKind::Storage,
                        format!(
                            "requested '{object_id}' but the data source returned '{}'",
                            container.id()
                        ),
                    ));
                }
                self.register_data_container(container, env)
            }
            Err(Error::ObjectInvalid(invalid)) => {
                self.invalid_objects.insert(invalid.clone());
                Err(Error::ObjectInvalid(invalid))
            }
            Err(error) => Err(error),
        }
    }

    /// Register a loaded data container and its real end-points.
    ///
    /// Each foreign key whose original value references an object is
    /// registered as original opposite end-point of that object's virtual
    /// end-point. A key that is null, or whose relation has no opposite, starts
    /// synchronized.
    pub fn register_data_container(
        &mut self,
        container: DataContainer,
        env: &mut LoadContext<'_>,
    ) -> Result<()> {
        let object_id = container.id().clone();
        if self.data_containers.contains_key(&object_id) || self.invalid_objects.contains(&object_id) {
            return Err(Error::transaction(
                TransactionErrorKind::ObjectAlreadyExists,
                format!("object '{object_id}' is already registered in {}", self.transaction),
            ));
        }

        let mapping = Arc::clone(&self.mapping);
        let mut registrations = Vec::new();
        for definition in mapping.real_end_point_definitions(object_id.class_id()) {
            let real_id = definition.end_point_id(object_id.clone());
            if self.end_points.real(&real_id).is_some() {
                return Err(Error::invariant(
                    InvariantViolationKind::DuplicateEndPoint,
                    real_id,
                    "a real end-point with this id is already registered",
                ));
            }
            let opposite = container
                .original(&definition.property_name)
                .and_then(Value::as_reference)
                .and_then(|target| definition.opposite_end_point_id(target.clone()));
            registrations.push((real_id, opposite));
        }

        let mut registered: Vec<(RelationEndPointId, Option<RelationEndPointId>)> = Vec::new();
        for (real_id, opposite) in registrations {
            let sync_state = if opposite.is_some() {
                SyncState::Unknown
            } else {
                SyncState::Synchronized
            };
            let result = self
                .end_points
                .register_real(RealObjectEndPoint::new(real_id.clone(), sync_state))
                .and_then(|()| match &opposite {
                    Some(opposite) => self.with_virtual(opposite, env, |end_point, ctx| {
                        end_point.register_original_opposite_end_point(&real_id, ctx)
                    }),
                    None => Ok(()),
                });
            if let Err(error) = result {
                self.end_points.remove_real(&real_id);
                self.undo_registrations(&registered, env);
                return Err(error);
            }
            registered.push((real_id, opposite));
        }

        self.data_containers.insert(object_id.clone(), container);
        env.listener.object_loaded(self.transaction, &object_id);
        tracing::debug!(
            transaction = %self.transaction,
            object = %object_id,
            real_end_points = registered.len(),
            "Registered data container"
        );
        Ok(())
    }

    fn undo_registrations(
        &mut self,
        registered: &[(RelationEndPointId, Option<RelationEndPointId>)],
        env: &mut LoadContext<'_>,
    ) {
        for (real_id, opposite) in registered.iter().rev() {
            if let Some(opposite) = opposite {
                if let Err(error) = self.with_virtual(opposite, env, |end_point, ctx| {
                    end_point.unregister_original_opposite_end_point(real_id, ctx)
                }) {
                    tracing::warn!(
                        end_point = %real_id,
                        error = %error,
                        "Failed to undo end-point registration"
                    );
                }
            }
            self.end_points.remove_real(real_id);
        }
    }

    /// Create a new object.
    ///
    /// Scalar values are stored as given; foreign keys are applied through the
    /// relation machinery so the opposite virtual end-points see the new object.
    pub fn new_object(
        &mut self,
        object_id: &ObjectId,
        values: impl IntoIterator<Item = (String, Value)>,
        env: &mut LoadContext<'_>,
    ) -> Result<()> {
        if self.data_containers.contains_key(object_id) || self.invalid_objects.contains(object_id) {
            return Err(Error::transaction(
                TransactionErrorKind::ObjectAlreadyExists,
                format!("object '{object_id}' already exists in {}", self.transaction),
            ));
        }
        let mapping = Arc::clone(&self.mapping);
        let class_id = object_id.class_id();
        let mut values = mapping.normalize_values(class_id, values)?;

        let mut foreign_keys = Vec::new();
        for definition in mapping.real_end_point_definitions(class_id) {
            if let Some(value) = values.get_mut(&definition.property_name) {
                if let Some(target) = std::mem::replace(value, Value::Null).as_reference() {
                    foreign_keys.push((definition.end_point_id(object_id.clone()), target.clone()));
                }
            }
        }
        for (_, target) in &foreign_keys {
            self.check_usable(target, env)?;
        }

        self.register_new_container(DataContainer::new_object(object_id.clone(), values), env)?;
        for (real_id, target) in foreign_keys {
            self.set_real(&real_id, Some(target), env)?;
        }
        tracing::debug!(transaction = %self.transaction, object = %object_id, "Created new object");
        Ok(())
    }

    /// Register a container created in this transaction (or written into it
    /// by a sub-transaction). Its real end-points start synchronized and its
    /// virtual end-points start complete and empty.
    fn register_new_container(
        &mut self,
        container: DataContainer,
        env: &mut LoadContext<'_>,
    ) -> Result<()> {
        let object_id = container.id().clone();
        let mapping = Arc::clone(&self.mapping);
        for definition in mapping.real_end_point_definitions(object_id.class_id()) {
            self.end_points.register_real(RealObjectEndPoint::new(
                definition.end_point_id(object_id.clone()),
                SyncState::Synchronized,
            ))?;
        }
        self.data_containers.insert(object_id.clone(), container);
        for definition in mapping.virtual_end_point_definitions(object_id.class_id()) {
            let id = definition.end_point_id(object_id.clone());
            self.with_virtual(&id, env, |end_point, ctx| {
                if end_point.is_data_complete() {
                    Ok(())
                } else {
                    end_point.mark_data_complete(Vec::new(), ctx)
                }
            })?;
        }
        Ok(())
    }

    /// Load a virtual end-point's data and the data containers of its items.
    ///
    /// Items loaded without a backing end-point get their containers loaded so
    /// that their foreign keys register. If that fails the end-point goes back
    /// to the Incomplete state before the error is returned.
    pub fn ensure_virtual_complete(
        &mut self,
        end_point_id: &RelationEndPointId,
        env: &mut LoadContext<'_>,
    ) -> Result<()> {
        if self
            .end_points
            .virtual_end_point(end_point_id)
            .is_some_and(VirtualEndPoint::is_data_complete)
        {
            return Ok(());
        }
        self.with_virtual(end_point_id, env, |end_point, ctx| end_point.ensure_data_complete(ctx))?;

        let pending: Vec<ObjectId> = self
            .end_points
            .virtual_end_point(end_point_id)
            .and_then(VirtualEndPoint::complete_state)
            .map(|state| {
                state
                    .data_keeper()
                    .original_items_without_end_points()
                    .iter()
                    .filter(|item| {
                        !self.data_containers.contains_key(*item) && !self.invalid_objects.contains(*item)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        for item in pending {
            match self.ensure_loaded(&item, env) {
                Ok(()) | Err(Error::ObjectInvalid(_)) => {}
                Err(error) => {
                    if let Err(unload_error) = self.with_virtual(end_point_id, env, |end_point, ctx| {
                        end_point.mark_data_incomplete(ctx)
                    }) {
                        tracing::warn!(
                            end_point = %end_point_id,
                            error = %unload_error,
                            "Failed to reset end-point after a failed item load"
                        );
                    }
                    return Err(error);
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Current value of a scalar property.
    pub fn get_value(
        &mut self,
        object_id: &ObjectId,
        property: &str,
        env: &mut LoadContext<'_>,
    ) -> Result<Value> {
        self.check_scalar(object_id, property)?;
        let container = self.get_data_container(object_id, env)?;
        container.get(property).cloned().ok_or_else(|| {
            Error::mapping(
                MappingErrorKind::UnknownProperty,
                format!("object '{object_id}' has no property '{property}'"),
            )
        })
    }

    /// The objects on the other side of `end_point_id`, as currently seen.
    ///
    /// A real end-point yields at most one object.
    pub fn get_related_object_ids(
        &mut self,
        end_point_id: &RelationEndPointId,
        env: &mut LoadContext<'_>,
    ) -> Result<Vec<ObjectId>> {
        let definition = self.mapping.require_end_point(end_point_id)?.clone();
        self.ensure_loaded(end_point_id.object_id(), env)?;
        if !definition.is_virtual() {
            return Ok(self.current_foreign_key(end_point_id)?.into_iter().collect());
        }
        self.ensure_virtual_complete(end_point_id, env)?;
        self.with_virtual(end_point_id, env, |end_point, ctx| end_point.get_data(ctx))
    }

    /// The objects on the other side of `end_point_id`, as loaded or last committed.
    pub fn get_original_related_object_ids(
        &mut self,
        end_point_id: &RelationEndPointId,
        env: &mut LoadContext<'_>,
    ) -> Result<Vec<ObjectId>> {
        let definition = self.mapping.require_end_point(end_point_id)?.clone();
        self.ensure_loaded(end_point_id.object_id(), env)?;
        if !definition.is_virtual() {
            return Ok(self.original_foreign_key(end_point_id)?.into_iter().collect());
        }
        self.ensure_virtual_complete(end_point_id, env)?;
        self.with_virtual(end_point_id, env, |end_point, ctx| end_point.get_original_data(ctx))
    }

    /// The single related object of a real or one-valued virtual end-point.
    pub fn get_related_object(
        &mut self,
        end_point_id: &RelationEndPointId,
        env: &mut LoadContext<'_>,
    ) -> Result<Option<ObjectId>> {
        let definition = self.mapping.require_end_point(end_point_id)?;
        if definition.cardinality() == Cardinality::Many {
            return Err(wrong_kind(end_point_id, "is a collection; use get_related_object_ids"));
        }
        Ok(self
            .get_related_object_ids(end_point_id, env)?
            .into_iter()
            .next())
    }

    // ========================================================================
    // Modifications
    // ========================================================================

    /// Set a scalar property.
    pub fn set_value(
        &mut self,
        object_id: &ObjectId,
        property: &str,
        value: Value,
        env: &mut LoadContext<'_>,
    ) -> Result<()> {
        self.check_scalar(object_id, property)?;
        self.check_usable(object_id, env)?;
        let container = self
            .data_containers
            .get_mut(object_id)
            .ok_or_else(|| Error::ObjectInvalid(object_id.clone()))?;
        container.set_value(property, value)
    }

    /// Point a real or one-valued virtual end-point at `target`.
    ///
    /// Both sides of the relation are updated. For one-to-one relations the
    /// previous holder of `target` loses it.
    pub fn set_related_object(
        &mut self,
        end_point_id: &RelationEndPointId,
        target: Option<ObjectId>,
        env: &mut LoadContext<'_>,
    ) -> Result<()> {
        let definition = self.mapping.require_end_point(end_point_id)?.clone();
        match definition.kind {
            EndPointKind::Real => self.set_real(end_point_id, target, env),
            EndPointKind::Virtual(Cardinality::Many) => Err(wrong_kind(
                end_point_id,
                "is a collection; use insert_related or remove_related",
            )),
            EndPointKind::Virtual(Cardinality::One) => {
                let owner = end_point_id.object_id().clone();
                self.check_usable(&owner, env)?;
                let current = self.get_related_object(end_point_id, env)?;
                if current == target {
                    return Ok(());
                }
                let real_property = opposite_property(&definition, end_point_id)?;
                if let Some(target) = &target {
                    check_class(end_point_id, target, &definition.opposite_class_id)?;
                }
                if let Some(current) = current {
                    self.set_real(&RelationEndPointId::new(current, real_property.clone()), None, env)?;
                }
                if let Some(target) = target {
                    self.set_real(&RelationEndPointId::new(target, real_property), Some(owner), env)?;
                }
                Ok(())
            }
        }
    }

    /// Add `item` to a virtual end-point by pointing its foreign key at the owner.
    pub fn insert_related(
        &mut self,
        end_point_id: &RelationEndPointId,
        item: &ObjectId,
        env: &mut LoadContext<'_>,
    ) -> Result<()> {
        let definition = self.require_virtual(end_point_id)?;
        if definition.cardinality() == Cardinality::One {
            return self.set_related_object(end_point_id, Some(item.clone()), env);
        }
        check_class(end_point_id, item, &definition.opposite_class_id)?;
        let owner = end_point_id.object_id().clone();
        self.check_usable(&owner, env)?;
        let real_property = opposite_property(&definition, end_point_id)?;
        self.set_real(&RelationEndPointId::new(item.clone(), real_property), Some(owner), env)
    }

    /// Remove `item` from a virtual end-point by clearing its foreign key.
    pub fn remove_related(
        &mut self,
        end_point_id: &RelationEndPointId,
        item: &ObjectId,
        env: &mut LoadContext<'_>,
    ) -> Result<()> {
        let definition = self.require_virtual(end_point_id)?;
        self.check_usable(end_point_id.object_id(), env)?;
        let items = self.get_related_object_ids(end_point_id, env)?;
        if !items.contains(item) {
            return Err(Error::invariant(
                InvariantViolationKind::MissingEndPoint,
                end_point_id.clone(),
                format!("'{item}' is not part of the current data"),
            ));
        }
        let real_property = opposite_property(&definition, end_point_id)?;
        self.set_real(&RelationEndPointId::new(item.clone(), real_property), None, env)
    }

    /// Change the foreign key behind a real end-point and update both sides.
    fn set_real(
        &mut self,
        real_id: &RelationEndPointId,
        target: Option<ObjectId>,
        env: &mut LoadContext<'_>,
    ) -> Result<()> {
        let definition = self.mapping.require_end_point(real_id)?.clone();
        if definition.is_virtual() {
            return Err(wrong_kind(real_id, "is not a foreign-key property"));
        }
        let owner = real_id.object_id().clone();
        self.check_usable(&owner, env)?;
        let current = self.current_foreign_key(real_id)?;
        if current == target {
            return Ok(());
        }
        if let Some(target) = &target {
            check_class(real_id, target, &definition.opposite_class_id)?;
            self.check_usable(target, env)?;
        }

        let Some(opposite_property) = definition.opposite_property_name.clone() else {
            return self.write_foreign_key(real_id, target);
        };
        let opposite_of = |object_id: &ObjectId| RelationEndPointId::new(object_id.clone(), opposite_property.clone());

        let original = self.original_foreign_key(real_id)?;
        let mut affected = BTreeSet::new();
        for object_id in [&original, &current, &target].into_iter().flatten() {
            if !self.invalid_objects.contains(object_id) {
                affected.insert(object_id.clone());
            }
        }
        for object_id in &affected {
            self.ensure_virtual_complete(&opposite_of(object_id), env)?;
        }

        match self.sync_state(real_id)? {
            SyncState::Synchronized => {}
            state => {
                return Err(Error::invariant(
                    InvariantViolationKind::UnsynchronizedOppositeEndPoint,
                    real_id.clone(),
                    format!("the end-point is {state:?}; synchronize it before changing the relation"),
                ));
            }
        }

        let opposite_cardinality = self
            .mapping
            .opposite_definition(&definition)
            .map_or(Cardinality::Many, RelationEndPointDefinition::cardinality);
        if let (Cardinality::One, Some(target)) = (opposite_cardinality, &target) {
            let target_end_point = opposite_of(target);
            let holders: Vec<ObjectId> = self
                .with_virtual(&target_end_point, env, |end_point, ctx| end_point.get_data(ctx))?
                .into_iter()
                .filter(|holder| *holder != owner)
                .collect();
            // A holder whose own foreign key does not point at the target
            // cannot be cleared, so the target would never have room.
            for holder in &holders {
                let holder_key = self.current_foreign_key(&definition.end_point_id(holder.clone()));
                if !matches!(holder_key, Ok(Some(ref key)) if key == target) {
                    return Err(Error::invariant(
                        InvariantViolationKind::CardinalityViolation,
                        target_end_point,
                        format!(
                            "'{holder}' is held without a matching foreign key; synchronize the end-point before assigning '{owner}'"
                        ),
                    ));
                }
            }
            for holder in holders {
                self.set_real(&definition.end_point_id(holder), None, env)?;
            }
        }

        if let Some(current) = &current {
            self.with_virtual(&opposite_of(current), env, |end_point, ctx| {
                end_point.unregister_current_opposite_end_point(real_id, ctx)
            })?;
        }
        self.write_foreign_key(real_id, target.clone())?;
        if let Some(target) = &target {
            self.with_virtual(&opposite_of(target), env, |end_point, ctx| {
                end_point.register_current_opposite_end_point(real_id, ctx)
            })?;
        }
        tracing::debug!(
            transaction = %self.transaction,
            end_point = %real_id,
            from = ?current,
            to = ?target,
            "Relation changed"
        );
        Ok(())
    }

    /// Delete an object: clear every relation it takes part in, then mark it deleted.
    ///
    /// A new object is discarded right away.
    pub fn delete_object(&mut self, object_id: &ObjectId, env: &mut LoadContext<'_>) -> Result<()> {
        self.check_usable(object_id, env)?;
        let mapping = Arc::clone(&self.mapping);

        for definition in mapping.real_end_point_definitions(object_id.class_id()) {
            self.set_real(&definition.end_point_id(object_id.clone()), None, env)?;
        }
        for definition in mapping.virtual_end_point_definitions(object_id.class_id()) {
            let end_point_id = definition.end_point_id(object_id.clone());
            let real_property = opposite_property(definition, &end_point_id)?;
            for item in self.get_related_object_ids(&end_point_id, env)? {
                let item_end_point = RelationEndPointId::new(item, real_property.clone());
                if self.current_foreign_key(&item_end_point)?.as_ref() == Some(object_id) {
                    self.set_real(&item_end_point, None, env)?;
                }
            }
        }

        let container = self
            .data_containers
            .get_mut(object_id)
            .ok_or_else(|| Error::ObjectInvalid(object_id.clone()))?;
        let was_new = container.is_new();
        container.delete()?;
        if was_new {
            self.discard_object(object_id);
        }
        tracing::debug!(
            transaction = %self.transaction,
            object = %object_id,
            discarded = was_new,
            "Deleted object"
        );
        Ok(())
    }

    fn discard_object(&mut self, object_id: &ObjectId) {
        self.data_containers.remove(object_id);
        self.end_points.remove_end_points_of(object_id);
        self.invalid_objects.insert(object_id.clone());
    }

    // ========================================================================
    // Unloading
    // ========================================================================

    /// Forget the loaded data of an unchanged virtual end-point.
    ///
    /// Does nothing if the end-point is not complete.
    pub fn unload_virtual_end_point(
        &mut self,
        end_point_id: &RelationEndPointId,
        env: &mut LoadContext<'_>,
    ) -> Result<()> {
        self.require_virtual(end_point_id)?;
        let Some(end_point) = self.end_points.virtual_end_point(end_point_id) else {
            return Ok(());
        };
        if !end_point.is_data_complete() {
            return Ok(());
        }
        if end_point.has_changed() {
            return Err(cannot_unload(format!("end-point '{end_point_id}' has changed")));
        }
        if self
            .data_containers
            .get(end_point_id.object_id())
            .is_some_and(DataContainer::is_new)
        {
            return Err(cannot_unload(format!(
                "end-point '{end_point_id}' belongs to a new object"
            )));
        }
        self.with_virtual(end_point_id, env, |end_point, ctx| end_point.mark_data_incomplete(ctx))
    }

    /// Remove an unchanged object from the transaction.
    ///
    /// Its foreign keys are unregistered from the opposite virtual end-points,
    /// which go back to the Incomplete state when the key was synchronized.
    /// Its own virtual end-points stay registered but become incomplete.
    pub fn unload_object(&mut self, object_id: &ObjectId, env: &mut LoadContext<'_>) -> Result<()> {
        let Some(container) = self.data_containers.get(object_id) else {
            return Ok(());
        };
        if container.state() != DataContainerState::Unchanged {
            return Err(cannot_unload(format!(
                "object '{object_id}' is {:?}",
                container.state()
            )));
        }

        let mapping = Arc::clone(&self.mapping);
        let class_id = object_id.class_id();
        let virtual_ids: Vec<RelationEndPointId> = mapping
            .virtual_end_point_definitions(class_id)
            .map(|definition| definition.end_point_id(object_id.clone()))
            .collect();
        let reals: Vec<(RelationEndPointId, Option<RelationEndPointId>)> = mapping
            .real_end_point_definitions(class_id)
            .map(|definition| {
                let real_id = definition.end_point_id(object_id.clone());
                let opposite = container
                    .original(&definition.property_name)
                    .and_then(Value::as_reference)
                    .and_then(|target| definition.opposite_end_point_id(target.clone()));
                (real_id, opposite)
            })
            .collect();

        let changed = virtual_ids
            .iter()
            .chain(reals.iter().filter_map(|(_, opposite)| opposite.as_ref()))
            .find(|id| {
                self.end_points
                    .virtual_end_point(id)
                    .is_some_and(VirtualEndPoint::has_changed)
            });
        if let Some(changed) = changed {
            return Err(cannot_unload(format!(
                "object '{object_id}' takes part in the changed relation '{changed}'"
            )));
        }

        env.listener.object_unloading(self.transaction, object_id);
        for (real_id, opposite) in &reals {
            if let Some(opposite) = opposite {
                if self.end_points.virtual_end_point(opposite).is_some() {
                    self.with_virtual(opposite, env, |end_point, ctx| {
                        end_point.unregister_original_opposite_end_point(real_id, ctx)
                    })?;
                }
            }
            self.end_points.remove_real(real_id);
        }
        for id in &virtual_ids {
            if self
                .end_points
                .virtual_end_point(id)
                .is_some_and(VirtualEndPoint::is_data_complete)
            {
                self.with_virtual(id, env, |end_point, ctx| end_point.mark_data_incomplete(ctx))?;
            }
        }
        self.data_containers.remove(object_id);
        tracing::debug!(transaction = %self.transaction, object = %object_id, "Unloaded object");
        Ok(())
    }

    // ========================================================================
    // Synchronization
    // ========================================================================

    /// Whether an end-point is in sync with its opposite side.
    ///
    /// For a virtual end-point: every loaded item is backed by a real
    /// end-point. For a real end-point: it is reflected in the data of the
    /// virtual end-point its original foreign key points at.
    pub fn is_synchronized(
        &mut self,
        end_point_id: &RelationEndPointId,
        env: &mut LoadContext<'_>,
    ) -> Result<bool> {
        let definition = self.mapping.require_end_point(end_point_id)?.clone();
        self.ensure_loaded(end_point_id.object_id(), env)?;
        if definition.is_virtual() {
            self.ensure_virtual_complete(end_point_id, env)?;
            return self.with_virtual(end_point_id, env, |end_point, ctx| end_point.is_synchronized(ctx));
        }
        self.resolve_sync_state(end_point_id, &definition, env)?;
        Ok(self.sync_state(end_point_id)? == SyncState::Synchronized)
    }

    /// Bring an end-point back in sync with its opposite side.
    ///
    /// A virtual end-point drops loaded items that no real end-point backs; an
    /// unsynchronized real end-point is moved into its opposite's data.
    pub fn synchronize(
        &mut self,
        end_point_id: &RelationEndPointId,
        env: &mut LoadContext<'_>,
    ) -> Result<()> {
        let definition = self.mapping.require_end_point(end_point_id)?.clone();
        self.ensure_loaded(end_point_id.object_id(), env)?;
        if definition.is_virtual() {
            self.ensure_virtual_complete(end_point_id, env)?;
            return self.with_virtual(end_point_id, env, |end_point, ctx| end_point.synchronize(ctx));
        }
        let Some(opposite) = self.resolve_sync_state(end_point_id, &definition, env)? else {
            return Ok(());
        };
        if self.sync_state(end_point_id)? == SyncState::Unsynchronized {
            self.with_virtual(&opposite, env, |end_point, ctx| {
                end_point.synchronize_opposite_end_point(end_point_id, ctx)
            })?;
        }
        Ok(())
    }

    /// Complete the virtual end-point a real end-point was registered on, so
    /// its sync state is known. Returns that end-point, if any.
    fn resolve_sync_state(
        &mut self,
        real_id: &RelationEndPointId,
        definition: &RelationEndPointDefinition,
        env: &mut LoadContext<'_>,
    ) -> Result<Option<RelationEndPointId>> {
        let opposite = self
            .original_foreign_key(real_id)?
            .filter(|target| !self.invalid_objects.contains(target))
            .and_then(|target| definition.opposite_end_point_id(target));
        if let Some(opposite) = &opposite {
            if self.sync_state(real_id)? == SyncState::Unknown {
                self.ensure_virtual_complete(opposite, env)?;
            }
        }
        Ok(opposite)
    }

    // ========================================================================
    // Commit / rollback
    // ========================================================================

    /// Check that committing cannot leave dangling end-points.
    pub fn validate_commit(&self) -> Result<()> {
        for real in self.end_points.real_end_points() {
            if !self.data_containers.contains_key(real.object_id()) {
                return Err(Error::invariant(
                    InvariantViolationKind::MissingEndPoint,
                    real.id().clone(),
                    "the real end-point has no data container",
                ));
            }
        }
        Ok(())
    }

    /// Make every pending change permanent at this level.
    ///
    /// Deleted objects are discarded and become invalid.
    pub fn commit(&mut self) -> Result<()> {
        self.validate_commit()?;

        for real in self.end_points.real_end_points() {
            if let Some(container) = self.data_containers.get_mut(real.object_id()) {
                real.commit(container);
            }
        }
        self.end_points.commit_virtual_end_points();

        let mut discarded = Vec::new();
        for (object_id, container) in &mut self.data_containers {
            if container.is_deleted() {
                discarded.push(object_id.clone());
            }
            container.commit_state();
        }
        for object_id in &discarded {
            self.discard_object(object_id);
        }
        tracing::debug!(
            transaction = %self.transaction,
            discarded = discarded.len(),
            "Data manager committed"
        );
        Ok(())
    }

    /// Discard every pending change at this level.
    ///
    /// New objects are discarded and become invalid.
    pub fn rollback(&mut self) {
        self.end_points.rollback_virtual_end_points();
        for real in self.end_points.real_end_points() {
            if let Some(container) = self.data_containers.get_mut(real.object_id()) {
                real.rollback(container);
            }
        }

        let mut discarded = Vec::new();
        for (object_id, container) in &mut self.data_containers {
            if container.is_new() {
                discarded.push(object_id.clone());
            }
            container.rollback_state();
        }
        for object_id in &discarded {
            self.discard_object(object_id);
        }
        tracing::debug!(
            transaction = %self.transaction,
            discarded = discarded.len(),
            "Data manager rolled back"
        );
    }

    /// Objects that would be written by a commit, in id order.
    pub fn persistable_data(&self) -> Vec<PersistableData> {
        self.data_containers
            .values()
            .filter_map(|container| {
                let object_id = container.id();
                let changed_end_points: Vec<RelationEndPointId> = self
                    .mapping
                    .virtual_end_point_definitions(object_id.class_id())
                    .map(|definition| definition.end_point_id(object_id.clone()))
                    .filter(|id| {
                        self.end_points
                            .virtual_end_point(id)
                            .is_some_and(VirtualEndPoint::has_changed)
                    })
                    .collect();
                if !container.has_changed() && changed_end_points.is_empty() {
                    return None;
                }
                Some(PersistableData {
                    object_id: object_id.clone(),
                    state: container.state(),
                    values: container.current_values(),
                    original_values: container.original_values(),
                    changed_end_points,
                })
            })
            .collect()
    }

    /// Whether a commit would change anything.
    pub fn has_changed(&self) -> bool {
        self.data_containers.values().any(DataContainer::has_changed)
            || self.end_points.virtual_end_points().any(VirtualEndPoint::has_changed)
    }

    /// Write the pending changes of a sub-transaction into this (parent) level.
    ///
    /// Runs in three steps: property values (foreign keys included) of every
    /// changed object are copied, creating objects that are new in the
    /// sub-transaction; the current data of every changed virtual end-point
    /// is copied; finally deletions are applied. On error this manager may be
    /// partially updated; the caller restores it from a backup.
    pub fn apply_changes_from(&mut self, sub: &DataManager, env: &mut LoadContext<'_>) -> Result<()> {
        for (object_id, sub_container) in &sub.data_containers {
            if !sub_container.has_changed() {
                continue;
            }
            if sub_container.is_new() {
                self.register_new_container(
                    DataContainer::new_object(object_id.clone(), sub_container.current_values()),
                    env,
                )?;
            } else {
                self.ensure_loaded(object_id, env)?;
                let container = self
                    .data_containers
                    .get_mut(object_id)
                    .ok_or_else(|| Error::ObjectInvalid(object_id.clone()))?;
                container.set_current_values_from(sub_container)?;
            }
        }

        for sub_end_point in sub.end_points.virtual_end_points() {
            if !sub_end_point.is_data_complete() || !sub_end_point.has_changed() {
                continue;
            }
            self.with_virtual(sub_end_point.id(), env, |end_point, ctx| {
                end_point.set_data_from(sub_end_point, ctx)
            })?;
        }

        for (object_id, sub_container) in &sub.data_containers {
            if !sub_container.is_deleted() {
                continue;
            }
            let container = self
                .data_containers
                .get_mut(object_id)
                .ok_or_else(|| Error::ObjectInvalid(object_id.clone()))?;
            let was_new = container.is_new();
            container.delete()?;
            if was_new {
                self.discard_object(object_id);
            }
        }

        tracing::debug!(
            parent = %self.transaction,
            sub = %sub.transaction,
            "Applied sub-transaction changes"
        );
        Ok(())
    }

    // ========================================================================
    // Snapshots and diagnostics
    // ========================================================================

    /// Flatten into a serializable snapshot.
    pub fn snapshot(&self) -> DataManagerSnapshot {
        DataManagerSnapshot {
            transaction: self.transaction,
            data_containers: self.data_containers.values().cloned().collect(),
            real_end_points: self.end_points.real_end_points().cloned().collect(),
            virtual_end_points: self
                .end_points
                .virtual_end_points()
                .map(VirtualEndPoint::snapshot)
                .collect(),
            invalid_objects: self.invalid_objects.iter().cloned().collect(),
        }
    }

    /// Rebuild a manager from a snapshot.
    ///
    /// Every real end-point needs its data container, and every end-point
    /// registered with a complete virtual end-point must exist and be
    /// synchronized.
    pub fn from_snapshot(
        snapshot: DataManagerSnapshot,
        mapping: Arc<MappingConfiguration>,
        load_tracker: LoadTracker,
    ) -> Result<Self> {
        let transaction = snapshot.transaction;
        let invalid = |message: String| {
            Error::transaction(
                TransactionErrorKind::InvalidSnapshot,
                format!("data manager of {transaction}: {message}"),
            )
        };

        let mut manager = Self::new(transaction, Arc::clone(&mapping), load_tracker);
        for container in snapshot.data_containers {
            mapping.require_class(container.id().class_id())?;
            let object_id = container.id().clone();
            if manager.data_containers.insert(object_id.clone(), container).is_some() {
                return Err(invalid(format!("object '{object_id}' appears twice")));
            }
        }
        for real in snapshot.real_end_points {
            if !manager.data_containers.contains_key(real.object_id()) {
                return Err(invalid(format!("real end-point '{}' has no data container", real.id())));
            }
            manager
                .end_points
                .register_real(real)
                .map_err(|error| invalid(error.to_string()))?;
        }
        for end_point in snapshot.virtual_end_points {
            let definition = mapping.require_end_point(&end_point.id)?;
            if definition.cardinality() != end_point.cardinality || !definition.is_virtual() {
                return Err(invalid(format!(
                    "end-point '{}' does not match its mapping",
                    end_point.id
                )));
            }
            manager
                .end_points
                .register_virtual(VirtualEndPoint::from_snapshot(end_point)?)
                .map_err(|error| invalid(error.to_string()))?;
        }
        for end_point in manager.end_points.virtual_end_points() {
            let Some(state) = end_point.complete_state() else {
                continue;
            };
            for opposite in state.data_keeper().current_opposite_end_points() {
                match manager.end_points.real(opposite).map(RealObjectEndPoint::sync_state) {
                    Some(SyncState::Synchronized) => {}
                    other => {
                        return Err(invalid(format!(
                            "'{opposite}' is registered with '{}' but is {other:?}",
                            end_point.id()
                        )));
                    }
                }
            }
        }
        manager.invalid_objects = snapshot.invalid_objects.into_iter().collect();
        Ok(manager)
    }

    /// Counters for diagnostics.
    pub fn counts(&self) -> DataManagerCounts {
        let complete = self
            .end_points
            .virtual_end_points()
            .filter(|end_point| end_point.is_data_complete())
            .count();
        DataManagerCounts {
            data_containers: self.data_containers.len(),
            real_end_points: self.end_points.real_count(),
            complete_virtual_end_points: complete,
            incomplete_virtual_end_points: self.end_points.virtual_count() - complete,
            pending_changes: self.persistable_data().len(),
            invalid_objects: self.invalid_objects.len(),
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Run `f` against the virtual end-point `id` (created on first access)
    /// with a context over this manager's real end-points.
    fn with_virtual<T>(
        &mut self,
        id: &RelationEndPointId,
        env: &mut LoadContext<'_>,
        f: impl FnOnce(&mut VirtualEndPoint, &mut EndPointContext<'_, '_>) -> Result<T>,
    ) -> Result<T> {
        let cardinality = self.require_virtual(id)?.cardinality();
        let (end_point, real_end_points) = self
            .end_points
            .get_or_create_virtual(id, cardinality);
        let mut ctx = EndPointContext {
            transaction: self.transaction,
            real_end_points,
            load_tracker: &mut self.load_tracker,
            env,
        };
        f(end_point, &mut ctx)
    }

    fn require_virtual(&self, id: &RelationEndPointId) -> Result<RelationEndPointDefinition> {
        let definition = self.mapping.require_end_point(id)?;
        if !definition.is_virtual() {
            return Err(wrong_kind(id, "is a foreign-key property, not a virtual end-point"));
        }
        Ok(definition.clone())
    }

    fn check_scalar(&self, object_id: &ObjectId, property: &str) -> Result<()> {
        if self.mapping.is_relation_property(object_id.class_id(), property) {
            return Err(Error::mapping(
                MappingErrorKind::WrongPropertyKind,
                format!(
                    "'{}.{property}' is a relation property; use the relation operations",
                    object_id.class_id()
                ),
            ));
        }
        Ok(())
    }

    /// Load `object_id` and make sure it can still be modified.
    fn check_usable(&mut self, object_id: &ObjectId, env: &mut LoadContext<'_>) -> Result<()> {
        if self.get_data_container(object_id, env)?.is_deleted() {
            return Err(Error::transaction(
                TransactionErrorKind::ObjectDeleted,
                format!("object '{object_id}' is deleted"),
            ));
        }
        Ok(())
    }

    fn real_end_point(&self, real_id: &RelationEndPointId) -> Result<(&RealObjectEndPoint, &DataContainer)> {
        let real = self.end_points.real(real_id).ok_or_else(|| {
            Error::invariant(
                InvariantViolationKind::MissingEndPoint,
                real_id.clone(),
                "the real end-point is not registered in this transaction",
            )
        })?;
        let container = self
            .data_containers
            .get(real_id.object_id())
            .ok_or_else(|| Error::ObjectInvalid(real_id.object_id().clone()))?;
        Ok((real, container))
    }

    fn sync_state(&self, real_id: &RelationEndPointId) -> Result<SyncState> {
        Ok(self.real_end_point(real_id)?.0.sync_state())
    }

    fn current_foreign_key(&self, real_id: &RelationEndPointId) -> Result<Option<ObjectId>> {
        let (real, container) = self.real_end_point(real_id)?;
        Ok(real.opposite_object_id(container))
    }

    fn original_foreign_key(&self, real_id: &RelationEndPointId) -> Result<Option<ObjectId>> {
        let (real, container) = self.real_end_point(real_id)?;
        Ok(real.original_opposite_object_id(container))
    }

    fn write_foreign_key(&mut self, real_id: &RelationEndPointId, target: Option<ObjectId>) -> Result<()> {
        let real = self.end_points.real(real_id).ok_or_else(|| {
            Error::invariant(
                InvariantViolationKind::MissingEndPoint,
                real_id.clone(),
                "the real end-point is not registered in this transaction",
            )
        })?;
        let container = self
            .data_containers
            .get_mut(real_id.object_id())
            .ok_or_else(|| Error::ObjectInvalid(real_id.object_id().clone()))?;
        real.set_opposite_object_id(container, target)
    }
}

fn wrong_kind(end_point_id: &RelationEndPointId, message: &str) -> Error {
    Error::mapping(
        MappingErrorKind::WrongPropertyKind,
        format!("'{end_point_id}' {message}"),
    )
}

fn cannot_unload(message: String) -> Error {
    Error::transaction(TransactionErrorKind::CannotUnload, message)
}

fn check_class(end_point_id: &RelationEndPointId, object_id: &ObjectId, expected: &str) -> Result<()> {
    if object_id.class_id() == expected {
        return Ok(());
    }
    Err(Error::mapping(
        MappingErrorKind::ClassMismatch,
        format!("'{end_point_id}' relates to '{expected}' objects, not '{object_id}'"),
    ))
}

fn opposite_property(
    definition: &RelationEndPointDefinition,
    end_point_id: &RelationEndPointId,
) -> Result<String> {
    definition.opposite_property_name.clone().ok_or_else(|| {
        Error::invariant(
            InvariantViolationKind::MissingEndPoint,
            end_point_id.clone(),
            "the relation has no opposite end-point",
        )
    })
}

/// Serializable form of a [`DataManager`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataManagerSnapshot {
    /// Owning transaction.
    pub transaction: TransactionId,
    /// Loaded data containers.
    pub data_containers: Vec<DataContainer>,
    /// Real end-points with their sync state.
    pub real_end_points: Vec<RealObjectEndPoint>,
    /// Virtual end-points with their load state.
    pub virtual_end_points: Vec<VirtualEndPointSnapshot>,
    /// Discarded objects.
    pub invalid_objects: Vec<ObjectId>,
}

/// Counters describing one [`DataManager`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataManagerCounts {
    /// Loaded data containers.
    pub data_containers: usize,
    /// Registered real end-points.
    pub real_end_points: usize,
    /// Virtual end-points whose data is loaded.
    pub complete_virtual_end_points: usize,
    /// Virtual end-points whose data is not loaded.
    pub incomplete_virtual_end_points: usize,
    /// Objects a commit would write.
    pub pending_changes: usize,
    /// Discarded objects.
    pub invalid_objects: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        ManagerHarness, computer, computer_of, customer, customer_of, order, orders_of, person,
    };

    fn seeded() -> ManagerHarness {
        let mut harness = ManagerHarness::new();
        harness.insert_customer(1, "Ada");
        harness.insert_customer(2, "Grace");
        harness.insert_order(1, Some(1));
        harness.insert_order(2, Some(1));
        harness.insert_order(3, Some(2));
        harness
    }

    #[test]
    fn test_identity_map_reuses_the_loaded_end_point() {
        let mut harness = seeded();
        harness
            .run(|manager, env| manager.get_related_object_ids(&orders_of(1), env))
            .unwrap();

        // A change routed through the same end-point must find it complete,
        // not a fresh incomplete instance that would load again.
        harness
            .run(|manager, env| manager.insert_related(&orders_of(1), &order(3), env))
            .unwrap();
        let orders = harness
            .run(|manager, env| manager.get_related_object_ids(&orders_of(1), env))
            .unwrap();
        assert_eq!(orders, vec![order(1), order(2), order(3)]);
        assert_eq!(harness.store.relation_loads(&orders_of(1)), 1);

        let end_point = harness.manager.end_points().virtual_end_point(&orders_of(1)).unwrap();
        assert!(end_point.is_data_complete());
        assert!(end_point.has_changed());
        assert!(harness.manager.end_points().virtual_end_point(&orders_of(2)).is_some());
    }

    #[test]
    fn test_loading_collection_registers_items_and_synchronizes_them() {
        let mut harness = seeded();
        let orders = harness
            .run(|manager, env| manager.get_related_object_ids(&orders_of(1), env))
            .unwrap();
        assert_eq!(orders, vec![order(1), order(2)]);

        let manager = &harness.manager;
        assert!(manager.data_container(&order(1)).is_some());
        for key in [1, 2] {
            let real = manager.end_points().real(&customer_of(key)).unwrap();
            assert_eq!(real.sync_state(), SyncState::Synchronized);
        }
        let synchronized = harness
            .run(|manager, env| manager.is_synchronized(&orders_of(1), env))
            .unwrap();
        assert!(synchronized);
    }

    #[test]
    fn test_loading_order_first_leaves_real_unknown_until_collection_loads() {
        let mut harness = seeded();
        harness
            .run(|manager, env| manager.get_data_container(&order(3), env).map(|_| ()))
            .unwrap();
        assert_eq!(
            harness.manager.end_points().real(&customer_of(3)).unwrap().sync_state(),
            SyncState::Unknown
        );
        assert!(
            !harness
                .manager
                .end_points()
                .virtual_end_point(&orders_of(2))
                .unwrap()
                .is_data_complete()
        );

        let synchronized = harness
            .run(|manager, env| manager.is_synchronized(&customer_of(3), env))
            .unwrap();
        assert!(synchronized);
        assert_eq!(harness.store.relation_loads(&orders_of(2)), 1);
    }

    #[test]
    fn test_set_related_object_moves_order_between_customers() {
        let mut harness = seeded();
        harness
            .run(|manager, env| manager.set_related_object(&customer_of(1), Some(customer(2)), env))
            .unwrap();

        let (first, second) = harness
            .run(|manager, env| {
                Ok((
                    manager.get_related_object_ids(&orders_of(1), env)?,
                    manager.get_related_object_ids(&orders_of(2), env)?,
                ))
            })
            .unwrap();
        assert_eq!(first, vec![order(2)]);
        assert_eq!(second, vec![order(3), order(1)]);
        assert_eq!(
            harness.manager.data_container(&order(1)).unwrap().state(),
            DataContainerState::Changed
        );
        assert!(harness.manager.has_changed());
    }

    #[test]
    fn test_insert_and_remove_related_route_through_foreign_key() {
        let mut harness = seeded();
        harness
            .run(|manager, env| manager.insert_related(&orders_of(2), &order(1), env))
            .unwrap();
        let target = harness
            .run(|manager, env| manager.get_related_object(&customer_of(1), env))
            .unwrap();
        assert_eq!(target, Some(customer(2)));

        harness
            .run(|manager, env| manager.remove_related(&orders_of(2), &order(3), env))
            .unwrap();
        let orders = harness
            .run(|manager, env| manager.get_related_object_ids(&orders_of(2), env))
            .unwrap();
        assert_eq!(orders, vec![order(1)]);

        let err = harness
            .run(|manager, env| manager.remove_related(&orders_of(2), &order(2), env))
            .unwrap_err();
        assert_eq!(err.invariant_kind(), Some(InvariantViolationKind::MissingEndPoint));
    }

    #[test]
    fn test_one_to_one_clears_previous_holder() {
        let mut harness = ManagerHarness::new();
        harness.insert_person(1);
        harness.insert_person(2);
        harness.insert_computer(1, Some(1));

        harness
            .run(|manager, env| manager.set_related_object(&computer_of(2), Some(computer(1)), env))
            .unwrap();

        let (first, second, owner) = harness
            .run(|manager, env| {
                Ok((
                    manager.get_related_object(&computer_of(1), env)?,
                    manager.get_related_object(&computer_of(2), env)?,
                    manager.get_related_object(&RelationEndPointId::new(computer(1), "owner"), env)?,
                ))
            })
            .unwrap();
        assert_eq!(first, None);
        assert_eq!(second, Some(computer(1)));
        assert_eq!(owner, Some(person(2)));
    }

    #[test]
    fn test_new_object_with_foreign_key_appears_in_collection() {
        let mut harness = seeded();
        harness
            .run(|manager, env| {
                manager.new_object(
                    &order(10),
                    [
                        ("number".to_string(), Value::from("A-10")),
                        ("customer".to_string(), Value::from(customer(2))),
                    ],
                    env,
                )
            })
            .unwrap();

        let orders = harness
            .run(|manager, env| manager.get_related_object_ids(&orders_of(2), env))
            .unwrap();
        assert_eq!(orders, vec![order(3), order(10)]);
        let data = harness.manager.persistable_data();
        assert_eq!(data.len(), 2);
        assert_eq!(data[0].object_id, customer(2));
        assert_eq!(data[0].changed_end_points, vec![orders_of(2)]);
        assert_eq!(data[1].state, DataContainerState::New);

        let err = harness
            .run(|manager, env| manager.new_object(&order(10), [], env))
            .unwrap_err();
        assert_eq!(err.transaction_kind(), Some(TransactionErrorKind::ObjectAlreadyExists));
    }

    #[test]
    fn test_set_value_rejects_relation_properties() {
        let mut harness = seeded();
        let err = harness
            .run(|manager, env| manager.set_value(&order(1), "customer", Value::Null, env))
            .unwrap_err();
        assert!(matches!(err, Error::Mapping(_)));

        harness
            .run(|manager, env| manager.set_value(&order(1), "number", Value::from("X"), env))
            .unwrap();
        let value = harness
            .run(|manager, env| manager.get_value(&order(1), "number", env))
            .unwrap();
        assert_eq!(value, Value::from("X"));
    }

    #[test]
    fn test_delete_object_clears_relations_both_ways() {
        let mut harness = seeded();
        harness
            .run(|manager, env| manager.delete_object(&customer(1), env))
            .unwrap();

        let manager = &harness.manager;
        assert_eq!(
            manager.data_container(&customer(1)).unwrap().state(),
            DataContainerState::Deleted
        );
        for key in [1, 2] {
            assert_eq!(
                manager.data_container(&order(key)).unwrap().get("customer"),
                Some(&Value::Null)
            );
        }

        let err = harness
            .run(|manager, env| manager.set_value(&customer(1), "name", Value::from("x"), env))
            .unwrap_err();
        assert_eq!(err.transaction_kind(), Some(TransactionErrorKind::ObjectDeleted));

        harness.manager.commit().unwrap();
        assert!(harness.manager.is_invalid(&customer(1)));
        let err = harness
            .run(|manager, env| manager.get_data_container(&customer(1), env).map(|_| ()))
            .unwrap_err();
        assert!(matches!(err, Error::ObjectInvalid(_)));
    }

    #[test]
    fn test_deleting_new_object_discards_it() {
        let mut harness = seeded();
        harness
            .run(|manager, env| {
                manager.new_object(&order(11), [("customer".to_string(), Value::from(customer(1)))], env)?;
                manager.delete_object(&order(11), env)
            })
            .unwrap();
        assert!(harness.manager.is_invalid(&order(11)));
        assert!(harness.manager.data_container(&order(11)).is_none());
        let orders = harness
            .run(|manager, env| manager.get_related_object_ids(&orders_of(1), env))
            .unwrap();
        assert_eq!(orders, vec![order(1), order(2)]);
    }

    #[test]
    fn test_commit_then_rollback_keeps_committed_state() {
        let mut harness = seeded();
        harness
            .run(|manager, env| manager.set_related_object(&customer_of(1), Some(customer(2)), env))
            .unwrap();
        harness.manager.commit().unwrap();
        harness.manager.rollback();

        assert!(!harness.manager.has_changed());
        let orders = harness
            .run(|manager, env| manager.get_related_object_ids(&orders_of(2), env))
            .unwrap();
        assert_eq!(orders, vec![order(3), order(1)]);
    }

    #[test]
    fn test_rollback_restores_relations_and_discards_new_objects() {
        let mut harness = seeded();
        harness
            .run(|manager, env| {
                manager.set_related_object(&customer_of(1), Some(customer(2)), env)?;
                manager.new_object(&order(12), [("customer".to_string(), Value::from(customer(1)))], env)
            })
            .unwrap();
        harness.manager.rollback();

        assert!(harness.manager.is_invalid(&order(12)));
        let (first, second) = harness
            .run(|manager, env| {
                Ok((
                    manager.get_related_object_ids(&orders_of(1), env)?,
                    manager.get_related_object_ids(&orders_of(2), env)?,
                ))
            })
            .unwrap();
        assert_eq!(first, vec![order(1), order(2)]);
        assert_eq!(second, vec![order(3)]);
        assert!(!harness.manager.has_changed());
    }

    #[test]
    fn test_unload_virtual_end_point_requires_unchanged_data() {
        let mut harness = seeded();
        harness
            .run(|manager, env| manager.get_related_object_ids(&orders_of(1), env).map(|_| ()))
            .unwrap();
        harness
            .run(|manager, env| manager.unload_virtual_end_point(&orders_of(1), env))
            .unwrap();
        assert!(
            !harness
                .manager
                .end_points()
                .virtual_end_point(&orders_of(1))
                .unwrap()
                .is_data_complete()
        );
        assert_eq!(
            harness.manager.end_points().real(&customer_of(1)).unwrap().sync_state(),
            SyncState::Unknown
        );

        harness
            .run(|manager, env| manager.remove_related(&orders_of(1), &order(1), env))
            .unwrap();
        let err = harness
            .run(|manager, env| manager.unload_virtual_end_point(&orders_of(1), env))
            .unwrap_err();
        assert_eq!(err.transaction_kind(), Some(TransactionErrorKind::CannotUnload));
        assert_eq!(harness.store.relation_loads(&orders_of(1)), 2);
    }

    #[test]
    fn test_unload_object_forces_opposite_incomplete() {
        let mut harness = seeded();
        harness
            .run(|manager, env| manager.get_related_object_ids(&orders_of(1), env).map(|_| ()))
            .unwrap();
        harness
            .run(|manager, env| manager.unload_object(&order(1), env))
            .unwrap();

        let manager = &harness.manager;
        assert!(manager.data_container(&order(1)).is_none());
        assert!(manager.end_points().real(&customer_of(1)).is_none());
        assert!(
            !manager
                .end_points()
                .virtual_end_point(&orders_of(1))
                .unwrap()
                .is_data_complete()
        );

        let orders = harness
            .run(|manager, env| manager.get_related_object_ids(&orders_of(1), env))
            .unwrap();
        assert_eq!(orders, vec![order(1), order(2)]);
    }

    #[test]
    fn test_unload_changed_object_fails() {
        let mut harness = seeded();
        harness
            .run(|manager, env| manager.set_value(&order(1), "number", Value::from("changed"), env))
            .unwrap();
        let err = harness
            .run(|manager, env| manager.unload_object(&order(1), env))
            .unwrap_err();
        assert_eq!(err.transaction_kind(), Some(TransactionErrorKind::CannotUnload));
    }

    #[test]
    fn test_unsynchronized_real_end_point_blocks_changes_until_synchronized() {
        let mut harness = seeded();
        harness
            .run(|manager, env| manager.get_data_container(&order(2), env).map(|_| ()))
            .unwrap();
        // Another writer moves order 2 to customer 2 behind the transaction's back.
        harness
            .store
            .update(&order(2), "customer", Value::from(customer(2)))
            .unwrap();

        let synchronized = harness
            .run(|manager, env| manager.is_synchronized(&customer_of(2), env))
            .unwrap();
        assert!(!synchronized);
        assert_eq!(
            harness.manager.end_points().real(&customer_of(2)).unwrap().sync_state(),
            SyncState::Unsynchronized
        );

        let err = harness
            .run(|manager, env| manager.set_related_object(&customer_of(2), None, env))
            .unwrap_err();
        assert_eq!(
            err.invariant_kind(),
            Some(InvariantViolationKind::UnsynchronizedOppositeEndPoint)
        );

        harness
            .run(|manager, env| manager.synchronize(&customer_of(2), env))
            .unwrap();
        assert_eq!(
            harness.manager.end_points().real(&customer_of(2)).unwrap().sync_state(),
            SyncState::Synchronized
        );
        let orders = harness
            .run(|manager, env| manager.get_related_object_ids(&orders_of(1), env))
            .unwrap();
        assert_eq!(orders, vec![order(1), order(2)]);
    }

    #[test]
    fn test_collection_with_foreign_item_is_not_synchronized() {
        let mut harness = seeded();
        harness
            .run(|manager, env| manager.get_data_container(&order(3), env).map(|_| ()))
            .unwrap();
        harness
            .store
            .update(&order(3), "customer", Value::from(customer(1)))
            .unwrap();

        let synchronized = harness
            .run(|manager, env| manager.is_synchronized(&orders_of(1), env))
            .unwrap();
        assert!(!synchronized);

        harness
            .run(|manager, env| manager.synchronize(&orders_of(1), env))
            .unwrap();
        let orders = harness
            .run(|manager, env| manager.get_related_object_ids(&orders_of(1), env))
            .unwrap();
        assert_eq!(orders, vec![order(1), order(2)]);
    }

    #[test]
    fn test_one_to_one_target_held_without_foreign_key_rejects_the_change() {
        let mut harness = ManagerHarness::new();
        harness.insert_person(1);
        harness.insert_person(2);
        harness.insert_computer(1, Some(1));
        harness.insert_computer(2, None);
        harness
            .run(|manager, env| manager.get_data_container(&computer(2), env).map(|_| ()))
            .unwrap();
        // Computer 2 is assigned to person 2 after it was loaded ownerless.
        harness
            .store
            .update(&computer(2), "owner", Value::from(person(2)))
            .unwrap();
        let owner_of_first = RelationEndPointId::new(computer(1), "owner");

        let err = harness
            .run(|manager, env| manager.set_related_object(&owner_of_first, Some(person(2)), env))
            .unwrap_err();
        assert_eq!(err.invariant_kind(), Some(InvariantViolationKind::CardinalityViolation));

        let (owner, first, second) = harness
            .run(|manager, env| {
                Ok((
                    manager.get_related_object(&owner_of_first, env)?,
                    manager.get_related_object(&computer_of(1), env)?,
                    manager.get_related_object(&computer_of(2), env)?,
                ))
            })
            .unwrap();
        assert_eq!(owner, Some(person(1)));
        assert_eq!(first, Some(computer(1)));
        assert_eq!(second, Some(computer(2)));
        assert!(!harness.manager.has_changed());

        // Once the stale item is dropped the assignment goes through.
        harness
            .run(|manager, env| manager.synchronize(&computer_of(2), env))
            .unwrap();
        harness
            .run(|manager, env| manager.set_related_object(&owner_of_first, Some(person(2)), env))
            .unwrap();
        let (first, second) = harness
            .run(|manager, env| {
                Ok((
                    manager.get_related_object(&computer_of(1), env)?,
                    manager.get_related_object(&computer_of(2), env)?,
                ))
            })
            .unwrap();
        assert_eq!(first, None);
        assert_eq!(second, Some(computer(1)));
    }

    #[test]
    fn test_commit_backs_collection_item_loaded_without_end_point() {
        let mut harness = seeded();
        harness.insert_order(9, None);
        harness
            .run(|manager, env| manager.get_data_container(&order(9), env).map(|_| ()))
            .unwrap();
        harness
            .store
            .update(&order(9), "customer", Value::from(customer(1)))
            .unwrap();
        let orders = harness
            .run(|manager, env| manager.get_related_object_ids(&orders_of(1), env))
            .unwrap();
        assert_eq!(orders, vec![order(1), order(2), order(9)]);

        harness
            .run(|manager, env| manager.insert_related(&orders_of(1), &order(9), env))
            .unwrap();
        harness.manager.commit().unwrap();

        let synchronized = harness
            .run(|manager, env| manager.is_synchronized(&orders_of(1), env))
            .unwrap();
        assert!(synchronized);
        harness
            .run(|manager, env| manager.synchronize(&orders_of(1), env))
            .unwrap();
        let (orders, customer_of_nine) = harness
            .run(|manager, env| {
                Ok((
                    manager.get_related_object_ids(&orders_of(1), env)?,
                    manager.get_related_object(&customer_of(9), env)?,
                ))
            })
            .unwrap();
        assert_eq!(orders, vec![order(1), order(2), order(9)]);
        assert_eq!(customer_of_nine, Some(customer(1)));
    }

    #[test]
    fn test_failed_item_load_resets_collection() {
        let mut harness = seeded();
        harness.store.fail_loads_of(order(2), "disk error");

        let err = harness
            .run(|manager, env| manager.get_related_object_ids(&orders_of(1), env))
            .unwrap_err();
        assert!(matches!(err, Error::Load(_)));
        assert!(
            !harness
                .manager
                .end_points()
                .virtual_end_point(&orders_of(1))
                .unwrap()
                .is_data_complete()
        );
    }

    #[test]
    fn test_snapshot_round_trip_through_json() {
        let mut harness = seeded();
        harness
            .run(|manager, env| {
                manager.get_data_container(&order(3), env)?;
                manager.set_related_object(&customer_of(1), Some(customer(2)), env)
            })
            .unwrap();

        let json = serde_json::to_string(&harness.manager.snapshot()).unwrap();
        let snapshot: DataManagerSnapshot = serde_json::from_str(&json).unwrap();
        let restored = DataManager::from_snapshot(
            snapshot,
            Arc::clone(harness.manager.mapping()),
            LoadTracker::new(),
        )
        .unwrap();
        assert_eq!(restored.snapshot(), harness.manager.snapshot());
        assert_eq!(restored.counts(), harness.manager.counts());
    }

    #[test]
    fn test_snapshot_with_orphan_real_end_point_is_rejected() {
        let mut harness = seeded();
        harness
            .run(|manager, env| manager.get_data_container(&order(1), env).map(|_| ()))
            .unwrap();
        let mut snapshot = harness.manager.snapshot();
        snapshot.data_containers.clear();
        let err = DataManager::from_snapshot(
            snapshot,
            Arc::clone(harness.manager.mapping()),
            LoadTracker::new(),
        )
        .unwrap_err();
        assert_eq!(err.transaction_kind(), Some(TransactionErrorKind::InvalidSnapshot));
    }

    #[test]
    fn test_counts() {
        let mut harness = seeded();
        harness
            .run(|manager, env| {
                manager.get_related_object_ids(&orders_of(1), env)?;
                manager.set_value(&customer(1), "name", Value::from("Ada L."), env)
            })
            .unwrap();
        let counts = harness.manager.counts();
        assert_eq!(counts.data_containers, 3);
        // Two orders plus the customer's region key.
        assert_eq!(counts.real_end_points, 3);
        assert_eq!(counts.complete_virtual_end_points, 1);
        assert_eq!(counts.pending_changes, 1);
    }
}
