//! Core types for relsync.
//!
//! `relsync-core` is the **value layer** of the workspace. Everything here is
//! either immutable and freely shareable between transactions, or owned by
//! exactly one transaction.
//!
//! # Role In The Architecture
//!
//! - **Identity**: `ObjectId` and `RelationEndPointId` key every registry in the
//!   engine. `TransactionId` names one level of a transaction hierarchy.
//! - **Storage**: `DataContainer` holds the original and current property values of
//!   one object, foreign keys included.
//! - **Metadata**: `MappingConfiguration` describes classes and relations and is
//!   shared (via `Arc`) by every transaction.
//! - **Structured concurrency**: re-exports `Cx` and `Outcome` from asupersync; the
//!   persistence collaborator is cancel-aware and reports through `Outcome`.
//!
//! The engine itself lives in `relsync-session`; most applications use the
//! `relsync` facade.

pub use asupersync::{Cx, Outcome};

pub mod data_container;
pub mod end_point_id;
pub mod error;
pub mod object_id;
pub mod relationship;
pub mod transaction_id;
pub mod value;

pub use data_container::{DataContainer, DataContainerState, PropertyValue};
pub use end_point_id::RelationEndPointId;
pub use error::{
    Error, InvariantViolation, InvariantViolationKind, LoadError, LoadErrorKind, MappingError,
    MappingErrorKind, Result, TransactionError, TransactionErrorKind, TransactionInactiveError,
    outcome_into_result,
};
pub use object_id::{KeyValue, ObjectId};
pub use relationship::{
    Cardinality, ClassDefinition, EndPointKind, MappingBuilder, MappingConfiguration,
    RelationDefinition, RelationEndPointDefinition, RelationKind,
};
pub use transaction_id::TransactionId;
pub use value::Value;
