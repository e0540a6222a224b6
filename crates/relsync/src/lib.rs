//! Transaction-scoped relation consistency for object-relational mappers.
//!
//! `relsync` is the user-facing facade of the workspace. It re-exports the value
//! types of `relsync-core` and the transaction engine of `relsync-session`.
//!
//! # What It Does
//!
//! - Tracks the objects loaded into a transaction, each in exactly one
//!   [`DataContainer`]
//! - Keeps both sides of a bidirectional relation consistent: changing a foreign
//!   key moves the object between the collections on the other side
//! - Loads a relation's related objects lazily, exactly once, and warns about
//!   N+1 load patterns on the `relsync::lazy_load` tracing target
//! - Nests sub-transactions that see their parent's state and commit into it
//!
//! # Example
//!
//! ```ignore
//! use relsync::prelude::*;
//!
//! let mapping = MappingConfiguration::builder()
//!     .class(ClassDefinition::new("Customer").property("name"))
//!     .class(ClassDefinition::new("Order").property("number"))
//!     .relation(RelationDefinition::one_to_many("Customer", "orders", "Order", "customer"))
//!     .build()?;
//! let mapping = Arc::new(mapping);
//!
//! let mut tx = ClientTransaction::new(InMemoryStore::new(Arc::clone(&mapping)), mapping);
//! let root = tx.root_id();
//! let orders = RelationEndPointId::new(ObjectId::new("Customer", 1), "orders");
//! let loaded = tx.get_related_objects(&cx, root, &orders)?;
//! ```

pub use relsync_core::{
    Cardinality, ClassDefinition, Cx, DataContainer, DataContainerState, EndPointKind, Error,
    InvariantViolation, InvariantViolationKind, KeyValue, LoadError, LoadErrorKind, MappingBuilder,
    MappingConfiguration, MappingError, MappingErrorKind, ObjectId, Outcome, PropertyValue,
    RelationDefinition, RelationEndPointDefinition, RelationEndPointId, RelationKind, Result,
    TransactionError, TransactionErrorKind, TransactionId, TransactionInactiveError, Value,
    outcome_into_result,
};
pub use relsync_session::{
    ClientTransaction, ClientTransactionSnapshot, DataKeeperFactory, DataManager,
    DataManagerCounts, DataManagerSnapshot, DefaultDataKeeperFactory, InMemoryStore,
    LazyLoadStats, ListenerCollection, LoadContext, LoadTracker, NullListener, PersistableData,
    PersistenceStrategy, SyncState, TracingListener, TransactionConfig, TransactionDebugInfo,
    TransactionLevelInfo, TransactionListener, VirtualEndPointDataKeeper,
};

/// Lower-level building blocks, for custom persistence strategies and tooling.
pub mod engine {
    pub use relsync_session::{
        CompleteLoadState, EndPointContext, IncompleteLoadState, LoadStateSnapshot,
        ParentTransactionStrategy, RealObjectEndPoint, RelationEndPointMap, VirtualEndPoint,
        VirtualEndPointDataKeeperSnapshot, VirtualEndPointLoadState, VirtualEndPointSnapshot,
    };
}

/// Everything needed to map classes and drive a transaction.
pub mod prelude {
    pub use std::sync::Arc;

    pub use crate::{
        ClassDefinition, ClientTransaction, Cx, DataContainerState, Error, InMemoryStore,
        MappingConfiguration, ObjectId, Outcome, PersistenceStrategy, RelationDefinition,
        RelationEndPointId, Result, TransactionConfig, TransactionId, TransactionListener, Value,
    };
}
