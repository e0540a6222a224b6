//! Error types shared by every relsync crate.
//!
//! Errors are grouped by who is at fault:
//!
//! - [`InvariantViolation`]: the caller broke an end-point protocol rule
//!   (double transition, unknown opposite end-point, ...). Never retried.
//! - [`TransactionInactiveError`]: a mutation was routed to an ancestor
//!   transaction instead of the active leaf of its hierarchy.
//! - [`LoadError`]: the persistence collaborator failed. The end-point that
//!   requested the load stays incomplete, so a retry is possible.
//!
//! Errors produced by a collaborator are handed back to the caller as they
//! were returned; the engine never wraps them.

use std::fmt;

use asupersync::Outcome;

use crate::end_point_id::RelationEndPointId;
use crate::object_id::ObjectId;
use crate::transaction_id::TransactionId;

/// Result type used throughout relsync.
pub type Result<T> = std::result::Result<T, Error>;

/// The top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An end-point protocol rule was broken.
    #[error(transparent)]
    InvariantViolation(#[from] InvariantViolation),
    /// A mutation was attempted on an inactive transaction.
    #[error(transparent)]
    TransactionInactive(#[from] TransactionInactiveError),
    /// Loading data from the persistence collaborator failed.
    #[error(transparent)]
    Load(#[from] LoadError),
    /// Transaction hierarchy misuse (unknown transaction, unload of changed data, ...).
    #[error(transparent)]
    Transaction(#[from] TransactionError),
    /// The operation does not match the mapping metadata.
    #[error(transparent)]
    Mapping(#[from] MappingError),
    /// The object was deleted and committed, discarded, or rolled back as new.
    #[error("object '{0}' is invalid in this transaction")]
    ObjectInvalid(ObjectId),
    /// Snapshot encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Free-form error raised by collaborators.
    #[error("{0}")]
    Custom(String),
}

impl Error {
    /// Build an [`Error::InvariantViolation`].
    pub fn invariant(
        kind: InvariantViolationKind,
        end_point: RelationEndPointId,
        message: impl Into<String>,
    ) -> Self {
        Error::InvariantViolation(InvariantViolation {
            kind,
            end_point,
            message: message.into(),
        })
    }

    /// Build an [`Error::TransactionInactive`] naming the rejected operation.
    pub fn inactive(operation: impl Into<String>, transaction: TransactionId) -> Self {
        Error::TransactionInactive(TransactionInactiveError {
            operation: operation.into(),
            transaction,
        })
    }

    /// Build an [`Error::Load`] without an underlying source.
    pub fn load(kind: LoadErrorKind, message: impl Into<String>) -> Self {
        Error::Load(LoadError {
            kind,
            message: message.into(),
            source: None,
        })
    }

    /// Build an [`Error::Transaction`].
    pub fn transaction(kind: TransactionErrorKind, message: impl Into<String>) -> Self {
        Error::Transaction(TransactionError {
            kind,
            message: message.into(),
        })
    }

    /// Build an [`Error::Mapping`].
    pub fn mapping(kind: MappingErrorKind, message: impl Into<String>) -> Self {
        Error::Mapping(MappingError {
            kind,
            message: message.into(),
        })
    }

    /// The invariant that was violated, if this is an invariant violation.
    pub fn invariant_kind(&self) -> Option<InvariantViolationKind> {
        match self {
            Error::InvariantViolation(violation) => Some(violation.kind),
            _ => None,
        }
    }

    /// The transaction error kind, if this is a transaction error.
    pub fn transaction_kind(&self) -> Option<TransactionErrorKind> {
        match self {
            Error::Transaction(error) => Some(error.kind),
            _ => None,
        }
    }

    /// The load error kind, if this is a load error.
    pub fn load_kind(&self) -> Option<LoadErrorKind> {
        match self {
            Error::Load(error) => Some(error.kind),
            _ => None,
        }
    }

    /// The mapping error kind, if this is a mapping error.
    pub fn mapping_kind(&self) -> Option<MappingErrorKind> {
        match self {
            Error::Mapping(error) => Some(error.kind),
            _ => None,
        }
    }

    /// Whether the error was raised because the target transaction is inactive.
    pub fn is_transaction_inactive(&self) -> bool {
        matches!(self, Error::TransactionInactive(_))
    }
}

// ============================================================================
// Invariant violations
// ============================================================================

/// Which end-point rule was broken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvariantViolationKind {
    /// `mark_data_complete` on an end-point whose data is already complete.
    AlreadyComplete,
    /// `mark_data_incomplete` on an end-point whose data is already incomplete.
    AlreadyIncomplete,
    /// Unregistering an opposite end-point that was never registered.
    OppositeEndPointNotRegistered,
    /// Synchronizing an opposite end-point that is not in the unsynchronized set.
    NotUnsynchronized,
    /// An unsynchronized real end-point was used where a synchronized one is required.
    UnsynchronizedOppositeEndPoint,
    /// A second end-point or registration for the same id.
    DuplicateEndPoint,
    /// An end-point id that is not registered in the transaction.
    MissingEndPoint,
    /// A one-valued end-point would hold more than one object.
    CardinalityViolation,
    /// A complete end-point was required but the data is still incomplete.
    NotComplete,
}

impl InvariantViolationKind {
    /// Short human readable name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            InvariantViolationKind::AlreadyComplete => "data already complete",
            InvariantViolationKind::AlreadyIncomplete => "data already incomplete",
            InvariantViolationKind::OppositeEndPointNotRegistered => {
                "opposite end-point not registered"
            }
            InvariantViolationKind::NotUnsynchronized => "not in unsynchronized list",
            InvariantViolationKind::UnsynchronizedOppositeEndPoint => {
                "opposite end-point is unsynchronized"
            }
            InvariantViolationKind::DuplicateEndPoint => "duplicate end-point",
            InvariantViolationKind::MissingEndPoint => "missing end-point",
            InvariantViolationKind::CardinalityViolation => "cardinality violation",
            InvariantViolationKind::NotComplete => "data not complete",
        }
    }
}

impl fmt::Display for InvariantViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An end-point protocol rule was broken by the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invariant violation ({kind}) on end-point '{end_point}': {message}")]
pub struct InvariantViolation {
    /// The broken rule.
    pub kind: InvariantViolationKind,
    /// The end-point the operation was applied to.
    pub end_point: RelationEndPointId,
    /// Details, usually naming the opposite end-point involved.
    pub message: String,
}

// ============================================================================
// Transaction errors
// ============================================================================

/// A mutation reached a transaction that is not the active leaf of its hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "cannot {operation}: transaction {transaction} is inactive; route the change through its active sub-transaction"
)]
pub struct TransactionInactiveError {
    /// The rejected operation.
    pub operation: String,
    /// The inactive transaction.
    pub transaction: TransactionId,
}

/// Kinds of transaction hierarchy errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// The transaction id does not belong to this hierarchy.
    UnknownTransaction,
    /// A root-only operation was applied to a sub-transaction or vice versa.
    NotASubTransaction,
    /// The nesting limit from the configuration was reached.
    NestingTooDeep,
    /// Unloading was refused because the data has pending changes.
    CannotUnload,
    /// A new object reused the id of a known object.
    ObjectAlreadyExists,
    /// The object is deleted in this transaction.
    ObjectDeleted,
    /// A snapshot could not be turned back into live state.
    InvalidSnapshot,
    /// The persistence collaborator refused to persist the changes.
    PersistFailed,
}

impl TransactionErrorKind {
    /// Short human readable name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            TransactionErrorKind::UnknownTransaction => "unknown transaction",
            TransactionErrorKind::NotASubTransaction => "not a sub-transaction",
            TransactionErrorKind::NestingTooDeep => "nesting too deep",
            TransactionErrorKind::CannotUnload => "cannot unload",
            TransactionErrorKind::ObjectAlreadyExists => "object already exists",
            TransactionErrorKind::ObjectDeleted => "object deleted",
            TransactionErrorKind::InvalidSnapshot => "invalid snapshot",
            TransactionErrorKind::PersistFailed => "persist failed",
        }
    }
}

impl fmt::Display for TransactionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transaction hierarchy misuse.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("transaction error ({kind}): {message}")]
pub struct TransactionError {
    /// What went wrong.
    pub kind: TransactionErrorKind,
    /// Details.
    pub message: String,
}

// ============================================================================
// Load errors
// ============================================================================

/// Kinds of persistence collaborator failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadErrorKind {
    /// The requested object does not exist in the data source.
    ObjectNotFound,
    /// The data source could not be reached or returned garbage.
    Storage,
    /// The load was cancelled through its `Cx`.
    Cancelled,
    /// The collaborator panicked.
    Panicked,
}

impl LoadErrorKind {
    /// Short human readable name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            LoadErrorKind::ObjectNotFound => "object not found",
            LoadErrorKind::Storage => "storage failure",
            LoadErrorKind::Cancelled => "cancelled",
            LoadErrorKind::Panicked => "panicked",
        }
    }
}

impl fmt::Display for LoadErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The persistence collaborator failed.
#[derive(Debug, thiserror::Error)]
#[error("load error ({kind}): {message}")]
pub struct LoadError {
    /// What went wrong.
    pub kind: LoadErrorKind,
    /// Details.
    pub message: String,
    /// Underlying error, if any.
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

// ============================================================================
// Mapping errors
// ============================================================================

/// Kinds of mapping metadata errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingErrorKind {
    /// The class id is not part of the mapping.
    UnknownClass,
    /// The property is not defined on the class.
    UnknownProperty,
    /// The property exists but is the wrong kind for the operation.
    WrongPropertyKind,
    /// The identifier is not a valid class or property name.
    InvalidIdentifier,
    /// The same name was defined twice.
    Duplicate,
    /// A related object has the wrong class for the relation.
    ClassMismatch,
}

impl MappingErrorKind {
    /// Short human readable name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            MappingErrorKind::UnknownClass => "unknown class",
            MappingErrorKind::UnknownProperty => "unknown property",
            MappingErrorKind::WrongPropertyKind => "wrong property kind",
            MappingErrorKind::InvalidIdentifier => "invalid identifier",
            MappingErrorKind::Duplicate => "duplicate definition",
            MappingErrorKind::ClassMismatch => "class mismatch",
        }
    }
}

impl fmt::Display for MappingErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The operation does not fit the mapping metadata.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("mapping error ({kind}): {message}")]
pub struct MappingError {
    /// What went wrong.
    pub kind: MappingErrorKind,
    /// Details.
    pub message: String,
}

// ============================================================================
// Outcome bridge
// ============================================================================

/// Convert a collaborator `Outcome` into a `Result`.
///
/// `Err` values pass through untouched. Cancellation and panics become
/// [`LoadError`]s so the engine can treat them like any other failed load.
pub fn outcome_into_result<T>(outcome: Outcome<T, Error>) -> Result<T> {
    match outcome {
        Outcome::Ok(value) => Ok(value),
        Outcome::Err(error) => Err(error),
        Outcome::Cancelled(reason) => Err(Error::load(
            LoadErrorKind::Cancelled,
            format!("load cancelled: {reason:?}"),
        )),
        Outcome::Panicked(payload) => Err(Error::load(
            LoadErrorKind::Panicked,
            format!("loader panicked: {payload:?}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_id::ObjectId;

    fn end_point() -> RelationEndPointId {
        RelationEndPointId::new(ObjectId::new("Customer", 1), "orders")
    }

    #[test]
    fn test_invariant_message_names_end_point() {
        let err = Error::invariant(
            InvariantViolationKind::AlreadyComplete,
            end_point(),
            "cannot mark complete twice",
        );
        let text = err.to_string();
        assert!(text.contains("Customer|1/orders"), "{text}");
        assert!(text.contains("data already complete"), "{text}");
        assert_eq!(
            err.invariant_kind(),
            Some(InvariantViolationKind::AlreadyComplete)
        );
    }

    #[test]
    fn test_inactive_message_names_operation() {
        let err = Error::inactive("set a relation", TransactionId::new(3));
        assert!(err.is_transaction_inactive());
        assert!(err.to_string().contains("cannot set a relation"));
        assert!(err.to_string().contains("tx#3"));
    }

    #[test]
    fn test_outcome_err_passes_through_unchanged() {
        let outcome: Outcome<(), Error> = Outcome::Err(Error::Custom("disk on fire".into()));
        match outcome_into_result(outcome) {
            Err(Error::Custom(msg)) => assert_eq!(msg, "disk on fire"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_outcome_ok_is_ok() {
        let outcome: Outcome<u8, Error> = Outcome::Ok(7);
        assert_eq!(outcome_into_result(outcome).unwrap(), 7);
    }

    #[test]
    fn test_kind_accessors() {
        let err = Error::transaction(TransactionErrorKind::CannotUnload, "changed");
        assert_eq!(err.transaction_kind(), Some(TransactionErrorKind::CannotUnload));
        assert_eq!(err.load_kind(), None);
        let err = Error::load(LoadErrorKind::ObjectNotFound, "gone");
        assert_eq!(err.load_kind(), Some(LoadErrorKind::ObjectNotFound));
        assert!(err.to_string().contains("object not found"));
    }
}
