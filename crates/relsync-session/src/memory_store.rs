//! An in-memory persistence collaborator.
//!
//! Rows are stored as property maps keyed by object id. Relations are
//! answered by scanning the foreign keys of the real side, the same way a
//! relational store answers them with a `WHERE fk = ?` query.

use std::collections::BTreeMap;
use std::sync::Arc;

use asupersync::{Cx, Outcome};
use relsync_core::{
    DataContainer, DataContainerState, Error, LoadErrorKind, MappingConfiguration,
    MappingErrorKind, ObjectId, RelationEndPointId, Result, Value,
};

use crate::persistence::{PersistableData, PersistenceStrategy};

/// A [`PersistenceStrategy`] backed by a map of rows.
///
/// Counts every load so tests can assert how often the engine reached the
/// data source. Failures can be injected per call or per object.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    mapping: Arc<MappingConfiguration>,
    rows: BTreeMap<ObjectId, BTreeMap<String, Value>>,
    container_loads: BTreeMap<ObjectId, usize>,
    relation_loads: BTreeMap<RelationEndPointId, usize>,
    persist_calls: usize,
    fail_next: Option<String>,
    failing_objects: BTreeMap<ObjectId, String>,
}

impl InMemoryStore {
    /// Create an empty store for `mapping`.
    pub fn new(mapping: Arc<MappingConfiguration>) -> Self {
        Self {
            mapping,
            rows: BTreeMap::new(),
            container_loads: BTreeMap::new(),
            relation_loads: BTreeMap::new(),
            persist_calls: 0,
            fail_next: None,
            failing_objects: BTreeMap::new(),
        }
    }

    /// Insert or replace a row. Missing properties default to NULL.
    pub fn insert(
        &mut self,
        object_id: ObjectId,
        values: impl IntoIterator<Item = (String, Value)>,
    ) -> Result<()> {
        let values = self.mapping.normalize_values(object_id.class_id(), values)?;
        self.rows.insert(object_id, values);
        Ok(())
    }

    /// Change one stored value, as another writer would.
    pub fn update(&mut self, object_id: &ObjectId, property: &str, value: Value) -> Result<()> {
        let row = self.rows.get_mut(object_id).ok_or_else(|| not_found(object_id))?;
        let slot = row.get_mut(property).ok_or_else(|| {
            Error::mapping(
                MappingErrorKind::UnknownProperty,
                format!("class '{}' has no property '{property}'", object_id.class_id()),
            )
        })?;
        *slot = value;
        Ok(())
    }

    /// Remove a row.
    pub fn remove(&mut self, object_id: &ObjectId) -> Option<BTreeMap<String, Value>> {
        self.rows.remove(object_id)
    }

    /// A stored row.
    pub fn row(&self, object_id: &ObjectId) -> Option<&BTreeMap<String, Value>> {
        self.rows.get(object_id)
    }

    /// Whether a row exists.
    pub fn contains(&self, object_id: &ObjectId) -> bool {
        self.rows.contains_key(object_id)
    }

    /// Number of stored rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the store holds no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// How often the data container of `object_id` was loaded.
    pub fn container_loads(&self, object_id: &ObjectId) -> usize {
        self.container_loads.get(object_id).copied().unwrap_or(0)
    }

    /// How often the related objects of `end_point` were loaded.
    pub fn relation_loads(&self, end_point: &RelationEndPointId) -> usize {
        self.relation_loads.get(end_point).copied().unwrap_or(0)
    }

    /// Total number of relation loads.
    pub fn total_relation_loads(&self) -> usize {
        self.relation_loads.values().sum()
    }

    /// How often [`persist`](PersistenceStrategy::persist) was called.
    pub fn persist_calls(&self) -> usize {
        self.persist_calls
    }

    /// Make the next call fail with a storage error.
    pub fn fail_next_operation(&mut self, message: impl Into<String>) {
        self.fail_next = Some(message.into());
    }

    /// Make every load of `object_id` fail until [`clear_failures`](Self::clear_failures).
    pub fn fail_loads_of(&mut self, object_id: ObjectId, message: impl Into<String>) {
        self.failing_objects.insert(object_id, message.into());
    }

    /// Remove every injected failure.
    pub fn clear_failures(&mut self) {
        self.fail_next = None;
        self.failing_objects.clear();
    }

    fn take_failure(&mut self) -> Option<Error> {
        self.fail_next
            .take()
            .map(|message| Error::load(LoadErrorKind::Storage, message))
    }

    fn related_rows(&self, end_point: &RelationEndPointId) -> Result<Vec<ObjectId>> {
        let definition = self.mapping.require_end_point(end_point)?;
        let Some(real) = self
            .mapping
            .opposite_definition(definition)
            .filter(|opposite| !opposite.is_virtual())
        else {
            return Err(Error::mapping(
                MappingErrorKind::WrongPropertyKind,
                format!("'{end_point}' is not a virtual end-point"),
            ));
        };
        let owner = end_point.object_id();
        Ok(self
            .rows
            .iter()
            .filter(|(id, row)| {
                id.class_id() == real.class_id
                    && row
                        .get(&real.property_name)
                        .and_then(Value::as_reference)
                        .is_some_and(|target| target == owner)
            })
            .map(|(id, _)| id.clone())
            .collect())
    }
}

impl PersistenceStrategy for InMemoryStore {
    fn load_data_container(&mut self, cx: &Cx, object_id: &ObjectId) -> Outcome<DataContainer, Error> {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        if let Some(error) = self.take_failure() {
            return Outcome::Err(error);
        }
        if let Some(message) = self.failing_objects.get(object_id) {
            return Outcome::Err(Error::load(LoadErrorKind::Storage, message.clone()));
        }
        *self.container_loads.entry(object_id.clone()).or_default() += 1;
        match self.rows.get(object_id) {
            Some(row) => {
                tracing::trace!(object = %object_id, "Loaded row");
                Outcome::Ok(DataContainer::new_loaded(object_id.clone(), row.clone()))
            }
            None => Outcome::Err(not_found(object_id)),
        }
    }

    fn load_opposite_objects(
        &mut self,
        cx: &Cx,
        end_point: &RelationEndPointId,
    ) -> Outcome<Vec<ObjectId>, Error> {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        if let Some(error) = self.take_failure() {
            return Outcome::Err(error);
        }
        *self.relation_loads.entry(end_point.clone()).or_default() += 1;
        match self.related_rows(end_point) {
            Ok(items) => {
                tracing::trace!(end_point = %end_point, items = items.len(), "Scanned related rows");
                Outcome::Ok(items)
            }
            Err(error) => Outcome::Err(error),
        }
    }

    fn persist(&mut self, cx: &Cx, data: &[PersistableData]) -> Outcome<(), Error> {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        if let Some(error) = self.take_failure() {
            return Outcome::Err(error);
        }
        self.persist_calls += 1;
        for item in data {
            if item.state == DataContainerState::Deleted {
                self.rows.remove(&item.object_id);
            } else {
                self.rows.insert(item.object_id.clone(), item.values.clone());
            }
        }
        tracing::debug!(rows = data.len(), "Persisted changes");
        Outcome::Ok(())
    }
}

fn not_found(object_id: &ObjectId) -> Error {
    Error::load(
        LoadErrorKind::ObjectNotFound,
        format!("object '{object_id}' does not exist"),
    )
}
