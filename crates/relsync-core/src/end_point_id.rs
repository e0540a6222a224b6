//! Relation end-point identity.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::object_id::ObjectId;

/// Identifies one navigable relation property of one object.
///
/// Used as the key of every end-point registry: within one transaction at
/// most one end-point instance exists per `RelationEndPointId`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelationEndPointId {
    object_id: ObjectId,
    property_name: String,
}

impl RelationEndPointId {
    /// Create an end-point id.
    pub fn new(object_id: ObjectId, property_name: impl Into<String>) -> Self {
        Self {
            object_id,
            property_name: property_name.into(),
        }
    }

    /// The object owning the relation property.
    #[must_use]
    pub fn object_id(&self) -> &ObjectId {
        &self.object_id
    }

    /// The relation property name.
    #[must_use]
    pub fn property_name(&self) -> &str {
        &self.property_name
    }
}

impl fmt::Display for RelationEndPointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.object_id, self.property_name)
    }
}
