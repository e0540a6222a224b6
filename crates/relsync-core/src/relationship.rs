//! Relationship metadata for relsync.
//!
//! Relations are described once, up front, and shared immutably (usually via
//! `Arc`) by every transaction. Each relation contributes one or two
//! end-point definitions:
//!
//! - a **real** end-point: the foreign-key property stored in the data
//!   container of the referencing object;
//! - a **virtual** end-point: the opposite side, with no storage of its own.
//!   Its value is derived from the real end-points that point at it.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::end_point_id::RelationEndPointId;
use crate::error::{Error, MappingErrorKind, Result};
use crate::object_id::ObjectId;
use crate::value::Value;

/// How many objects a virtual end-point can hold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cardinality {
    /// At most one related object (one-to-one).
    One,
    /// Any number of related objects (the "many" side seen from the "one" side).
    #[default]
    Many,
}

/// Whether an end-point is backed by a foreign key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndPointKind {
    /// Foreign-key holder.
    Real,
    /// Derived side with the given cardinality.
    Virtual(Cardinality),
}

/// The kind of relation between two classes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RelationKind {
    /// One `Customer` has many `Order`s; each `Order` holds the foreign key.
    #[default]
    OneToMany,
    /// One `Person` has at most one `Computer`; the `Computer` holds the foreign key.
    OneToOne,
    /// A foreign key with no navigable opposite side.
    Unidirectional,
}

/// Metadata about one navigable side of a relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationEndPointDefinition {
    /// Class owning the property.
    pub class_id: String,
    /// Relation property name.
    pub property_name: String,
    /// Real (foreign key) or virtual.
    pub kind: EndPointKind,
    /// Class of the related objects.
    pub opposite_class_id: String,
    /// Property on the related class that points back, if the relation is bidirectional.
    pub opposite_property_name: Option<String>,
}

impl RelationEndPointDefinition {
    /// Whether this end-point has no backing foreign key.
    #[must_use]
    pub fn is_virtual(&self) -> bool {
        matches!(self.kind, EndPointKind::Virtual(_))
    }

    /// Cardinality of the end-point; real end-points always hold at most one object.
    #[must_use]
    pub fn cardinality(&self) -> Cardinality {
        match self.kind {
            EndPointKind::Real => Cardinality::One,
            EndPointKind::Virtual(cardinality) => cardinality,
        }
    }

    /// The end-point id of this property on `object_id`.
    #[must_use]
    pub fn end_point_id(&self, object_id: ObjectId) -> RelationEndPointId {
        RelationEndPointId::new(object_id, self.property_name.clone())
    }

    /// The id of the opposite end-point on `opposite_object_id`, for bidirectional relations.
    #[must_use]
    pub fn opposite_end_point_id(&self, opposite_object_id: ObjectId) -> Option<RelationEndPointId> {
        self.opposite_property_name
            .as_ref()
            .map(|property| RelationEndPointId::new(opposite_object_id, property.clone()))
    }
}

/// A relation between two classes.
///
/// # Example
///
/// ```
/// use relsync_core::{RelationDefinition, RelationKind};
///
/// let rel = RelationDefinition::one_to_many("Customer", "orders", "Order", "customer");
/// assert_eq!(rel.kind(), RelationKind::OneToMany);
/// assert_eq!(rel.end_points().len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationDefinition {
    kind: RelationKind,
    real_class: String,
    foreign_key_property: String,
    target_class: String,
    virtual_property: Option<String>,
}

impl RelationDefinition {
    /// One object of `one_class` holds many objects of `many_class` in
    /// `collection_property`; `many_class.foreign_key_property` points back.
    pub fn one_to_many(
        one_class: impl Into<String>,
        collection_property: impl Into<String>,
        many_class: impl Into<String>,
        foreign_key_property: impl Into<String>,
    ) -> Self {
        Self {
            kind: RelationKind::OneToMany,
            real_class: many_class.into(),
            foreign_key_property: foreign_key_property.into(),
            target_class: one_class.into(),
            virtual_property: Some(collection_property.into()),
        }
    }

    /// `virtual_class.virtual_property` holds at most one object of
    /// `real_class`, whose `foreign_key_property` points back.
    pub fn one_to_one(
        virtual_class: impl Into<String>,
        virtual_property: impl Into<String>,
        real_class: impl Into<String>,
        foreign_key_property: impl Into<String>,
    ) -> Self {
        Self {
            kind: RelationKind::OneToOne,
            real_class: real_class.into(),
            foreign_key_property: foreign_key_property.into(),
            target_class: virtual_class.into(),
            virtual_property: Some(virtual_property.into()),
        }
    }

    /// A foreign key on `real_class` pointing to `target_class`, not navigable backwards.
    pub fn unidirectional(
        real_class: impl Into<String>,
        foreign_key_property: impl Into<String>,
        target_class: impl Into<String>,
    ) -> Self {
        Self {
            kind: RelationKind::Unidirectional,
            real_class: real_class.into(),
            foreign_key_property: foreign_key_property.into(),
            target_class: target_class.into(),
            virtual_property: None,
        }
    }

    /// Kind of relation.
    #[must_use]
    pub fn kind(&self) -> RelationKind {
        self.kind
    }

    /// The end-point definitions contributed by this relation (real side first).
    #[must_use]
    pub fn end_points(&self) -> Vec<RelationEndPointDefinition> {
        let mut end_points = vec![RelationEndPointDefinition {
            class_id: self.real_class.clone(),
            property_name: self.foreign_key_property.clone(),
            kind: EndPointKind::Real,
            opposite_class_id: self.target_class.clone(),
            opposite_property_name: self.virtual_property.clone(),
        }];
        if let Some(virtual_property) = &self.virtual_property {
            let cardinality = match self.kind {
                RelationKind::OneToOne => Cardinality::One,
                RelationKind::OneToMany | RelationKind::Unidirectional => Cardinality::Many,
            };
            end_points.push(RelationEndPointDefinition {
                class_id: self.target_class.clone(),
                property_name: virtual_property.clone(),
                kind: EndPointKind::Virtual(cardinality),
                opposite_class_id: self.real_class.clone(),
                opposite_property_name: Some(self.foreign_key_property.clone()),
            });
        }
        end_points
    }
}

/// A mapped class and its scalar properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDefinition {
    class_id: String,
    properties: Vec<String>,
}

impl ClassDefinition {
    /// Create a class definition without properties.
    pub fn new(class_id: impl Into<String>) -> Self {
        Self {
            class_id: class_id.into(),
            properties: Vec::new(),
        }
    }

    /// Add a scalar property.
    #[must_use]
    pub fn property(mut self, name: impl Into<String>) -> Self {
        self.properties.push(name.into());
        self
    }

    /// The class id.
    #[must_use]
    pub fn class_id(&self) -> &str {
        &self.class_id
    }

    /// Scalar property names in definition order.
    #[must_use]
    pub fn properties(&self) -> &[String] {
        &self.properties
    }
}

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern is a valid regex")
    })
}

fn check_identifier(what: &str, name: &str) -> Result<()> {
    if identifier_pattern().is_match(name) {
        Ok(())
    } else {
        Err(Error::mapping(
            MappingErrorKind::InvalidIdentifier,
            format!("{what} '{name}' is not a valid identifier"),
        ))
    }
}

/// Immutable mapping metadata shared by all transactions.
#[derive(Debug, Clone, Default)]
pub struct MappingConfiguration {
    classes: BTreeMap<String, ClassDefinition>,
    end_points: BTreeMap<String, BTreeMap<String, RelationEndPointDefinition>>,
}

impl MappingConfiguration {
    /// Start building a mapping.
    #[must_use]
    pub fn builder() -> MappingBuilder {
        MappingBuilder::default()
    }

    /// Look up a class.
    pub fn class(&self, class_id: &str) -> Option<&ClassDefinition> {
        self.classes.get(class_id)
    }

    /// Look up a class, failing with a mapping error if it is unknown.
    pub fn require_class(&self, class_id: &str) -> Result<&ClassDefinition> {
        self.class(class_id).ok_or_else(|| {
            Error::mapping(
                MappingErrorKind::UnknownClass,
                format!("class '{class_id}' is not mapped"),
            )
        })
    }

    /// All mapped classes in id order.
    pub fn classes(&self) -> impl Iterator<Item = &ClassDefinition> {
        self.classes.values()
    }

    /// Look up a relation end-point definition.
    pub fn end_point_definition(
        &self,
        class_id: &str,
        property_name: &str,
    ) -> Option<&RelationEndPointDefinition> {
        self.end_points.get(class_id)?.get(property_name)
    }

    /// Look up the definition behind an end-point id, failing if the property is not a relation.
    pub fn require_end_point(&self, id: &RelationEndPointId) -> Result<&RelationEndPointDefinition> {
        let class_id = id.object_id().class_id();
        self.require_class(class_id)?;
        self.end_point_definition(class_id, id.property_name())
            .ok_or_else(|| {
                Error::mapping(
                    MappingErrorKind::UnknownProperty,
                    format!(
                        "'{}' is not a relation property of class '{class_id}'",
                        id.property_name()
                    ),
                )
            })
    }

    /// All relation end-point definitions of a class.
    pub fn end_point_definitions<'a>(
        &'a self,
        class_id: &str,
    ) -> impl Iterator<Item = &'a RelationEndPointDefinition> + 'a {
        self.end_points
            .get(class_id)
            .into_iter()
            .flat_map(|by_property| by_property.values())
    }

    /// Foreign-key end-point definitions of a class.
    pub fn real_end_point_definitions<'a>(
        &'a self,
        class_id: &str,
    ) -> impl Iterator<Item = &'a RelationEndPointDefinition> + 'a {
        self.end_point_definitions(class_id)
            .filter(|definition| !definition.is_virtual())
    }

    /// Virtual end-point definitions of a class.
    pub fn virtual_end_point_definitions<'a>(
        &'a self,
        class_id: &str,
    ) -> impl Iterator<Item = &'a RelationEndPointDefinition> + 'a {
        self.end_point_definitions(class_id)
            .filter(|definition| definition.is_virtual())
    }

    /// The definition on the other side of a bidirectional relation.
    pub fn opposite_definition(
        &self,
        definition: &RelationEndPointDefinition,
    ) -> Option<&RelationEndPointDefinition> {
        let property = definition.opposite_property_name.as_deref()?;
        self.end_point_definition(&definition.opposite_class_id, property)
    }

    /// Whether `property_name` is a relation property of the class.
    pub fn is_relation_property(&self, class_id: &str, property_name: &str) -> bool {
        self.end_point_definition(class_id, property_name).is_some()
    }

    /// Names of the properties a data container of the class stores:
    /// scalar properties followed by foreign keys.
    pub fn storage_properties(&self, class_id: &str) -> Result<Vec<String>> {
        let class = self.require_class(class_id)?;
        let mut names = class.properties().to_vec();
        names.extend(
            self.real_end_point_definitions(class_id)
                .map(|definition| definition.property_name.clone()),
        );
        Ok(names)
    }

    /// Check property values for an object of `class_id`.
    ///
    /// Unknown properties fail; missing ones default to NULL. Foreign keys must
    /// be NULL or reference an object of the related class.
    pub fn normalize_values(
        &self,
        class_id: &str,
        values: impl IntoIterator<Item = (String, Value)>,
    ) -> Result<BTreeMap<String, Value>> {
        let mut normalized: BTreeMap<String, Value> = self
            .storage_properties(class_id)?
            .into_iter()
            .map(|name| (name, Value::Null))
            .collect();
        for (name, value) in values {
            let Some(slot) = normalized.get_mut(&name) else {
                return Err(Error::mapping(
                    MappingErrorKind::UnknownProperty,
                    format!("class '{class_id}' has no property '{name}'"),
                ));
            };
            if let Some(definition) = self.end_point_definition(class_id, &name) {
                match &value {
                    Value::Null => {}
                    Value::Reference(target)
                        if target.class_id() == definition.opposite_class_id => {}
                    other => {
                        return Err(Error::mapping(
                            MappingErrorKind::ClassMismatch,
                            format!(
                                "foreign key '{class_id}.{name}' must reference a '{}', got {other:?}",
                                definition.opposite_class_id
                            ),
                        ));
                    }
                }
            }
            *slot = value;
        }
        Ok(normalized)
    }
}

/// Builder for [`MappingConfiguration`].
#[derive(Debug, Clone, Default)]
pub struct MappingBuilder {
    classes: Vec<ClassDefinition>,
    relations: Vec<RelationDefinition>,
}

impl MappingBuilder {
    /// Add a class.
    #[must_use]
    pub fn class(mut self, class: ClassDefinition) -> Self {
        self.classes.push(class);
        self
    }

    /// Add a relation.
    #[must_use]
    pub fn relation(mut self, relation: RelationDefinition) -> Self {
        self.relations.push(relation);
        self
    }

    /// Validate and build the mapping.
    pub fn build(self) -> Result<MappingConfiguration> {
        let mut mapping = MappingConfiguration::default();

        for class in self.classes {
            check_identifier("class id", class.class_id())?;
            for (index, property) in class.properties().iter().enumerate() {
                check_identifier("property", property)?;
                if class.properties()[..index].contains(property) {
                    return Err(Error::mapping(
                        MappingErrorKind::Duplicate,
                        format!(
                            "property '{property}' is defined twice on class '{}'",
                            class.class_id()
                        ),
                    ));
                }
            }
            if mapping.classes.contains_key(class.class_id()) {
                return Err(Error::mapping(
                    MappingErrorKind::Duplicate,
                    format!("class '{}' is defined twice", class.class_id()),
                ));
            }
            mapping.classes.insert(class.class_id().to_string(), class);
        }

        for relation in &self.relations {
            for definition in relation.end_points() {
                check_identifier("property", &definition.property_name)?;
                let class = mapping.require_class(&definition.class_id)?;
                mapping.require_class(&definition.opposite_class_id)?;
                let clashes_with_scalar = class
                    .properties()
                    .iter()
                    .any(|property| *property == definition.property_name);
                let by_property = mapping
                    .end_points
                    .entry(definition.class_id.clone())
                    .or_default();
                if clashes_with_scalar || by_property.contains_key(&definition.property_name) {
                    return Err(Error::mapping(
                        MappingErrorKind::Duplicate,
                        format!(
                            "property '{}' is defined twice on class '{}'",
                            definition.property_name, definition.class_id
                        ),
                    ));
                }
                by_property.insert(definition.property_name.clone(), definition);
            }
        }

        tracing::debug!(
            classes = mapping.classes.len(),
            relations = self.relations.len(),
            "Built mapping configuration"
        );

        Ok(mapping)
    }
}
