//! Object identity.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The physical key of a persistent object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyValue {
    /// Integer key (auto-increment style).
    Int(i64),
    /// Textual key (natural keys, UUID strings).
    Text(String),
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Int(value) => write!(f, "{value}"),
            KeyValue::Text(value) => f.write_str(value),
        }
    }
}

impl From<i64> for KeyValue {
    fn from(value: i64) -> Self {
        KeyValue::Int(value)
    }
}

impl From<i32> for KeyValue {
    fn from(value: i32) -> Self {
        KeyValue::Int(i64::from(value))
    }
}

impl From<&str> for KeyValue {
    fn from(value: &str) -> Self {
        KeyValue::Text(value.to_string())
    }
}

impl From<String> for KeyValue {
    fn from(value: String) -> Self {
        KeyValue::Text(value)
    }
}

/// Globally unique identifier of a persistent object: class id plus key.
///
/// Immutable once created. Ordering is by class id, then key, which gives
/// every map keyed by `ObjectId` a deterministic iteration order.
///
/// # Example
///
/// ```
/// use relsync_core::ObjectId;
///
/// let id = ObjectId::new("Order", 42);
/// assert_eq!(id.class_id(), "Order");
/// assert_eq!(id.to_string(), "Order|42");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId {
    class_id: String,
    value: KeyValue,
}

impl ObjectId {
    /// Create an object id.
    pub fn new(class_id: impl Into<String>, value: impl Into<KeyValue>) -> Self {
        Self {
            class_id: class_id.into(),
            value: value.into(),
        }
    }

    /// The mapped class this object belongs to.
    #[must_use]
    pub fn class_id(&self) -> &str {
        &self.class_id
    }

    /// The physical key.
    #[must_use]
    pub fn value(&self) -> &KeyValue {
        &self.value
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.class_id, self.value)
    }
}
