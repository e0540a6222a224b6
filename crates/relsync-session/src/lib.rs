//! Client transactions and relation consistency for relsync.
//!
//! A [`ClientTransaction`] tracks loaded objects, keeps both sides of every
//! bidirectional relation consistent, loads related objects lazily and exactly
//! once, and supports nested sub-transactions that commit into their parent.
//!
//! # Design Philosophy
//!
//! - **Arena ownership**: every end-point lives in the [`DataManager`] of its
//!   transaction and is addressed by id; there are no back-pointers
//! - **Explicit load state**: a virtual end-point is either Incomplete (only the
//!   ids of end-points pointing at it are known) or Complete (a data keeper
//!   holds original and current related objects)
//! - **Cancel-aware loading**: the [`PersistenceStrategy`] takes a `Cx` and
//!   reports through `Outcome`
//! - **Only the leaf mutates**: a transaction with an open sub-transaction
//!   rejects every change with [`Error::TransactionInactive`](relsync_core::Error)
//!
//! # Example
//!
//! ```ignore
//! let mut tx = ClientTransaction::new(store, mapping);
//! let root = tx.root_id();
//!
//! // Lazily loads the customer's orders, once.
//! let orders = tx.get_related_objects(&cx, root, &orders_of_customer)?;
//!
//! // Work in isolation, then write the changes into the parent.
//! let sub = tx.create_sub_transaction(root)?;
//! tx.set_related_object(&cx, sub, &order_customer, Some(other_customer))?;
//! tx.commit(&cx, sub)?;
//! tx.discard_sub_transaction(sub)?;
//!
//! // Hand the changes to the store.
//! tx.commit(&cx, root)?;
//! ```

pub mod data_keeper;
pub mod data_manager;
pub mod end_point;
pub mod end_point_map;
pub mod listener;
pub mod load_state;
pub mod load_tracker;
pub mod memory_store;
pub mod persistence;
pub mod transaction;

#[cfg(test)]
mod test_support;

pub use data_keeper::{
    DataKeeperFactory, DefaultDataKeeperFactory, VirtualEndPointDataKeeper,
    VirtualEndPointDataKeeperSnapshot,
};
pub use data_manager::{DataManager, DataManagerCounts, DataManagerSnapshot};
pub use end_point::{
    EndPointContext, RealObjectEndPoint, SyncState, VirtualEndPoint, VirtualEndPointSnapshot,
};
pub use end_point_map::RelationEndPointMap;
pub use listener::{ListenerCollection, NullListener, TracingListener, TransactionListener};
pub use load_state::{
    CompleteLoadState, IncompleteLoadState, LoadStateSnapshot, VirtualEndPointLoadState,
};
pub use load_tracker::{LazyLoadStats, LoadTracker};
pub use memory_store::InMemoryStore;
pub use persistence::{LoadContext, ParentTransactionStrategy, PersistableData, PersistenceStrategy};
pub use transaction::{
    ClientTransaction, ClientTransactionSnapshot, TransactionDebugInfo, TransactionLevelInfo,
};

// ============================================================================
// Transaction Configuration
// ============================================================================

/// Configuration for [`ClientTransaction`] behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionConfig {
    /// Whether lazy loads of virtual end-points are counted.
    pub track_lazy_loads: bool,
    /// Loads of one relation after which an N+1 warning is logged.
    pub lazy_load_warning_threshold: usize,
    /// Maximum number of nested sub-transactions.
    pub max_nesting_depth: usize,
    /// Mirror every listener event as a `tracing` debug record.
    pub trace_events: bool,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            track_lazy_loads: true,
            lazy_load_warning_threshold: 3,
            max_nesting_depth: 16,
            trace_events: false,
        }
    }
}

impl TransactionConfig {
    /// Enable or disable lazy-load tracking.
    #[must_use]
    pub fn track_lazy_loads(mut self, enabled: bool) -> Self {
        self.track_lazy_loads = enabled;
        self
    }

    /// Set the N+1 warning threshold.
    #[must_use]
    pub fn lazy_load_warning_threshold(mut self, threshold: usize) -> Self {
        self.lazy_load_warning_threshold = threshold;
        self
    }

    /// Set the maximum sub-transaction depth.
    #[must_use]
    pub fn max_nesting_depth(mut self, depth: usize) -> Self {
        self.max_nesting_depth = depth;
        self
    }

    /// Enable or disable the tracing listener.
    #[must_use]
    pub fn trace_events(mut self, enabled: bool) -> Self {
        self.trace_events = enabled;
        self
    }
}
