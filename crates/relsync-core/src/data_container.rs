//! Per-transaction property storage for one object.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, MappingErrorKind, Result, TransactionErrorKind};
use crate::object_id::ObjectId;
use crate::value::Value;

/// Observable state of a data container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataContainerState {
    /// Created in this transaction, not yet committed.
    New,
    /// Loaded, no property differs from its original value.
    Unchanged,
    /// Loaded, at least one property differs from its original value.
    Changed,
    /// Marked for deletion.
    Deleted,
    /// Discarded; the object can no longer be used in this transaction.
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum Lifecycle {
    New,
    Existing,
    Deleted,
    Discarded,
}

/// Original and current value of one property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyValue {
    /// Value at load time or at the last commit.
    pub original: Value,
    /// Value as seen by the application.
    pub current: Value,
}

impl PropertyValue {
    fn unchanged(value: Value) -> Self {
        Self {
            original: value.clone(),
            current: value,
        }
    }

    /// Whether the current value differs from the original one.
    #[must_use]
    pub fn has_changed(&self) -> bool {
        self.original != self.current
    }
}

/// Holds the original and current property values of one object in one transaction.
///
/// Foreign keys of real end-points are stored here like any other property.
/// A discarded container never comes back to life.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataContainer {
    id: ObjectId,
    lifecycle: Lifecycle,
    values: BTreeMap<String, PropertyValue>,
}

impl DataContainer {
    /// A container for an object loaded from a data source.
    pub fn new_loaded(id: ObjectId, values: BTreeMap<String, Value>) -> Self {
        Self::with_lifecycle(id, Lifecycle::Existing, values)
    }

    /// A container for an object created in this transaction.
    pub fn new_object(id: ObjectId, values: BTreeMap<String, Value>) -> Self {
        Self::with_lifecycle(id, Lifecycle::New, values)
    }

    fn with_lifecycle(id: ObjectId, lifecycle: Lifecycle, values: BTreeMap<String, Value>) -> Self {
        Self {
            id,
            lifecycle,
            values: values
                .into_iter()
                .map(|(name, value)| (name, PropertyValue::unchanged(value)))
                .collect(),
        }
    }

    /// The object this container belongs to.
    #[must_use]
    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> DataContainerState {
        match self.lifecycle {
            Lifecycle::New => DataContainerState::New,
            Lifecycle::Deleted => DataContainerState::Deleted,
            Lifecycle::Discarded => DataContainerState::Invalid,
            Lifecycle::Existing if self.values.values().any(PropertyValue::has_changed) => {
                DataContainerState::Changed
            }
            Lifecycle::Existing => DataContainerState::Unchanged,
        }
    }

    /// Whether the object was created in this transaction.
    #[must_use]
    pub fn is_new(&self) -> bool {
        self.lifecycle == Lifecycle::New
    }

    /// Whether the object is marked for deletion.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.lifecycle == Lifecycle::Deleted
    }

    /// Whether the container was discarded.
    #[must_use]
    pub fn is_discarded(&self) -> bool {
        self.lifecycle == Lifecycle::Discarded
    }

    /// Whether committing this container would change anything.
    #[must_use]
    pub fn has_changed(&self) -> bool {
        self.state() != DataContainerState::Unchanged
    }

    /// Current value of a property.
    pub fn get(&self, property: &str) -> Option<&Value> {
        self.values.get(property).map(|value| &value.current)
    }

    /// Original value of a property.
    pub fn original(&self, property: &str) -> Option<&Value> {
        self.values.get(property).map(|value| &value.original)
    }

    /// Whether a single property differs from its original value.
    pub fn has_property_changed(&self, property: &str) -> bool {
        self.values.get(property).is_some_and(PropertyValue::has_changed)
    }

    /// Iterate property names and current values.
    pub fn properties(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values
            .iter()
            .map(|(name, value)| (name.as_str(), &value.current))
    }

    /// Copy of all current values.
    #[must_use]
    pub fn current_values(&self) -> BTreeMap<String, Value> {
        self.values
            .iter()
            .map(|(name, value)| (name.clone(), value.current.clone()))
            .collect()
    }

    /// Copy of all original values.
    #[must_use]
    pub fn original_values(&self) -> BTreeMap<String, Value> {
        self.values
            .iter()
            .map(|(name, value)| (name.clone(), value.original.clone()))
            .collect()
    }

    fn check_usable(&self) -> Result<()> {
        match self.lifecycle {
            Lifecycle::Discarded => Err(Error::ObjectInvalid(self.id.clone())),
            Lifecycle::Deleted => Err(Error::transaction(
                TransactionErrorKind::ObjectDeleted,
                format!("object '{}' is deleted", self.id),
            )),
            Lifecycle::New | Lifecycle::Existing => Ok(()),
        }
    }

    /// Set the current value of a property.
    pub fn set_value(&mut self, property: &str, value: Value) -> Result<()> {
        self.check_usable()?;
        let id = &self.id;
        let slot = self.values.get_mut(property).ok_or_else(|| {
            Error::mapping(
                MappingErrorKind::UnknownProperty,
                format!("object '{id}' has no property '{property}'"),
            )
        })?;
        slot.current = value;
        Ok(())
    }

    /// Make the current value of one property its original value.
    pub fn commit_property(&mut self, property: &str) {
        if let Some(value) = self.values.get_mut(property) {
            value.original = value.current.clone();
        }
    }

    /// Reset one property to its original value.
    pub fn rollback_property(&mut self, property: &str) {
        if let Some(value) = self.values.get_mut(property) {
            value.current = value.original.clone();
        }
    }

    /// Make the current state permanent at this transaction level.
    ///
    /// New and changed containers become unchanged; deleted ones are discarded.
    pub fn commit_state(&mut self) {
        match self.lifecycle {
            Lifecycle::Deleted => self.lifecycle = Lifecycle::Discarded,
            Lifecycle::Discarded => {}
            Lifecycle::New | Lifecycle::Existing => {
                self.lifecycle = Lifecycle::Existing;
                for value in self.values.values_mut() {
                    value.original = value.current.clone();
                }
            }
        }
    }

    /// Discard pending changes.
    ///
    /// New containers are discarded; deleted ones come back as existing.
    pub fn rollback_state(&mut self) {
        match self.lifecycle {
            Lifecycle::New => self.lifecycle = Lifecycle::Discarded,
            Lifecycle::Discarded => {}
            Lifecycle::Deleted | Lifecycle::Existing => {
                self.lifecycle = Lifecycle::Existing;
                for value in self.values.values_mut() {
                    value.current = value.original.clone();
                }
            }
        }
    }

    /// Mark the object for deletion. A new object is discarded right away.
    pub fn delete(&mut self) -> Result<()> {
        self.check_usable()?;
        self.lifecycle = match self.lifecycle {
            Lifecycle::New => Lifecycle::Discarded,
            _ => Lifecycle::Deleted,
        };
        Ok(())
    }

    /// Discard the container.
    pub fn discard(&mut self) {
        self.lifecycle = Lifecycle::Discarded;
    }

    /// Overwrite the current values with the current values of `other`.
    ///
    /// Used when a sub-transaction writes its changes into its parent.
    pub fn set_current_values_from(&mut self, other: &DataContainer) -> Result<()> {
        self.check_usable()?;
        for (name, value) in &other.values {
            if let Some(slot) = self.values.get_mut(name) {
                slot.current = value.current.clone();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order() -> DataContainer {
        let mut values = BTreeMap::new();
        values.insert("number".to_string(), Value::from(1));
        values.insert(
            "customer".to_string(),
            Value::Reference(ObjectId::new("Customer", 1)),
        );
        DataContainer::new_loaded(ObjectId::new("Order", 1), values)
    }

    #[test]
    fn test_loaded_container_is_unchanged() {
        let container = order();
        assert_eq!(container.state(), DataContainerState::Unchanged);
        assert!(!container.has_changed());
    }

    #[test]
    fn test_set_value_marks_changed_and_commit_clears() {
        let mut container = order();
        container.set_value("number", Value::from(2)).unwrap();
        assert_eq!(container.state(), DataContainerState::Changed);
        assert!(container.has_property_changed("number"));
        assert_eq!(container.original("number"), Some(&Value::BigInt(1)));

        container.commit_state();
        assert_eq!(container.state(), DataContainerState::Unchanged);
        assert_eq!(container.original("number"), Some(&Value::BigInt(2)));
    }

    #[test]
    fn test_rollback_restores_original_values() {
        let mut container = order();
        container.set_value("number", Value::from(9)).unwrap();
        container.rollback_state();
        assert_eq!(container.get("number"), Some(&Value::BigInt(1)));
        assert_eq!(container.state(), DataContainerState::Unchanged);
    }

    #[test]
    fn test_property_level_commit_and_rollback() {
        let mut container = order();
        container.set_value("customer", Value::Null).unwrap();
        container.set_value("number", Value::from(5)).unwrap();
        container.commit_property("customer");
        assert!(!container.has_property_changed("customer"));
        assert!(container.has_property_changed("number"));
        container.rollback_property("number");
        assert_eq!(container.state(), DataContainerState::Unchanged);
    }

    #[test]
    fn test_unknown_property_is_rejected() {
        let mut container = order();
        let err = container.set_value("color", Value::from("red")).unwrap_err();
        assert!(matches!(err, Error::Mapping(_)));
    }

    #[test]
    fn test_delete_then_commit_discards() {
        let mut container = order();
        container.delete().unwrap();
        assert_eq!(container.state(), DataContainerState::Deleted);
        assert!(container.set_value("number", Value::from(3)).is_err());
        container.commit_state();
        assert_eq!(container.state(), DataContainerState::Invalid);
        assert!(matches!(container.delete(), Err(Error::ObjectInvalid(_))));
    }

    #[test]
    fn test_delete_then_rollback_restores() {
        let mut container = order();
        container.delete().unwrap();
        container.rollback_state();
        assert_eq!(container.state(), DataContainerState::Unchanged);
    }

    #[test]
    fn test_new_object_lifecycle() {
        let mut container = DataContainer::new_object(ObjectId::new("Order", 2), BTreeMap::new());
        assert_eq!(container.state(), DataContainerState::New);
        container.rollback_state();
        assert!(container.is_discarded());
        container.rollback_state();
        assert!(container.is_discarded());

        let mut container = DataContainer::new_object(ObjectId::new("Order", 3), BTreeMap::new());
        container.delete().unwrap();
        assert!(container.is_discarded());
    }

    #[test]
    fn test_serde_round_trip_keeps_pending_changes() {
        let mut container = order();
        container.set_value("number", Value::from(4)).unwrap();
        let json = serde_json::to_string(&container).unwrap();
        let restored: DataContainer = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, container);
        assert_eq!(restored.state(), DataContainerState::Changed);
    }
}
