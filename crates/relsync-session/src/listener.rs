//! Transaction listeners.
//!
//! Listeners observe a transaction hierarchy. They are called with `&self`
//! and never receive mutable access to transaction state.

use relsync_core::{ObjectId, RelationEndPointId, TransactionId};

/// Observer of transaction events. Every method defaults to a no-op.
pub trait TransactionListener {
    /// A data container was loaded into `transaction`.
    fn object_loaded(&self, transaction: TransactionId, object_id: &ObjectId) {
        let _ = (transaction, object_id);
    }

    /// A data container is about to be unloaded from `transaction`.
    fn object_unloading(&self, transaction: TransactionId, object_id: &ObjectId) {
        let _ = (transaction, object_id);
    }

    /// A virtual end-point became complete.
    fn relation_end_point_loaded(&self, transaction: TransactionId, end_point: &RelationEndPointId) {
        let _ = (transaction, end_point);
    }

    /// A complete virtual end-point is about to become incomplete.
    fn relation_end_point_unloading(
        &self,
        transaction: TransactionId,
        end_point: &RelationEndPointId,
    ) {
        let _ = (transaction, end_point);
    }

    /// `transaction` is about to commit the given changed objects.
    fn transaction_committing(&self, transaction: TransactionId, changed_objects: &[ObjectId]) {
        let _ = (transaction, changed_objects);
    }

    /// `transaction` committed.
    fn transaction_committed(&self, transaction: TransactionId) {
        let _ = transaction;
    }

    /// `transaction` rolled back.
    fn transaction_rolled_back(&self, transaction: TransactionId) {
        let _ = transaction;
    }

    /// A sub-transaction of `parent` was created.
    fn sub_transaction_created(&self, parent: TransactionId, sub: TransactionId) {
        let _ = (parent, sub);
    }

    /// A sub-transaction of `parent` was discarded.
    fn sub_transaction_discarded(&self, parent: TransactionId, sub: TransactionId) {
        let _ = (parent, sub);
    }
}

/// Listener that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullListener;

impl TransactionListener for NullListener {}

/// Mirrors every event as a `tracing` debug record.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingListener;

impl TransactionListener for TracingListener {
    fn object_loaded(&self, transaction: TransactionId, object_id: &ObjectId) {
        tracing::debug!(%transaction, object = %object_id, "Object loaded");
    }

    fn object_unloading(&self, transaction: TransactionId, object_id: &ObjectId) {
        tracing::debug!(%transaction, object = %object_id, "Object unloading");
    }

    fn relation_end_point_loaded(&self, transaction: TransactionId, end_point: &RelationEndPointId) {
        tracing::debug!(%transaction, end_point = %end_point, "Relation end-point loaded");
    }

    fn relation_end_point_unloading(
        &self,
        transaction: TransactionId,
        end_point: &RelationEndPointId,
    ) {
        tracing::debug!(%transaction, end_point = %end_point, "Relation end-point unloading");
    }

    fn transaction_committing(&self, transaction: TransactionId, changed_objects: &[ObjectId]) {
        tracing::debug!(
            %transaction,
            changed = changed_objects.len(),
            "Transaction committing"
        );
    }

    fn transaction_committed(&self, transaction: TransactionId) {
        tracing::debug!(%transaction, "Transaction committed");
    }

    fn transaction_rolled_back(&self, transaction: TransactionId) {
        tracing::debug!(%transaction, "Transaction rolled back");
    }

    fn sub_transaction_created(&self, parent: TransactionId, sub: TransactionId) {
        tracing::debug!(%parent, %sub, "Sub-transaction created");
    }

    fn sub_transaction_discarded(&self, parent: TransactionId, sub: TransactionId) {
        tracing::debug!(%parent, %sub, "Sub-transaction discarded");
    }
}

/// Fans every event out to a list of listeners, in registration order.
#[derive(Default)]
pub struct ListenerCollection {
    listeners: Vec<Box<dyn TransactionListener + Send + Sync>>,
}

impl ListenerCollection {
    /// Create an empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a listener.
    pub fn add(&mut self, listener: Box<dyn TransactionListener + Send + Sync>) {
        self.listeners.push(listener);
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// Whether no listener is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

impl std::fmt::Debug for ListenerCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerCollection")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl TransactionListener for ListenerCollection {
    fn object_loaded(&self, transaction: TransactionId, object_id: &ObjectId) {
        for listener in &self.listeners {
            listener.object_loaded(transaction, object_id);
        }
    }

    fn object_unloading(&self, transaction: TransactionId, object_id: &ObjectId) {
        for listener in &self.listeners {
            listener.object_unloading(transaction, object_id);
        }
    }

    fn relation_end_point_loaded(&self, transaction: TransactionId, end_point: &RelationEndPointId) {
        for listener in &self.listeners {
            listener.relation_end_point_loaded(transaction, end_point);
        }
    }

    fn relation_end_point_unloading(
        &self,
        transaction: TransactionId,
        end_point: &RelationEndPointId,
    ) {
        for listener in &self.listeners {
            listener.relation_end_point_unloading(transaction, end_point);
        }
    }

    fn transaction_committing(&self, transaction: TransactionId, changed_objects: &[ObjectId]) {
        for listener in &self.listeners {
            listener.transaction_committing(transaction, changed_objects);
        }
    }

    fn transaction_committed(&self, transaction: TransactionId) {
        for listener in &self.listeners {
            listener.transaction_committed(transaction);
        }
    }

    fn transaction_rolled_back(&self, transaction: TransactionId) {
        for listener in &self.listeners {
            listener.transaction_rolled_back(transaction);
        }
    }

    fn sub_transaction_created(&self, parent: TransactionId, sub: TransactionId) {
        for listener in &self.listeners {
            listener.sub_transaction_created(parent, sub);
        }
    }

    fn sub_transaction_discarded(&self, parent: TransactionId, sub: TransactionId) {
        for listener in &self.listeners {
            listener.sub_transaction_discarded(parent, sub);
        }
    }
}
