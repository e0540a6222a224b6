//! Client transactions and the sub-transaction hierarchy.
//!
//! A [`ClientTransaction`] owns one [`DataManager`] per hierarchy level, root
//! first. Only the innermost (leaf) level is active: every mutation names the
//! transaction it targets and is rejected with
//! [`Error::TransactionInactive`] unless that transaction is the leaf. Reads
//! (and the lazy loads they trigger) are allowed on every level.
//!
//! A sub-transaction loads through [`ParentTransactionStrategy`], so it sees
//! the parent's current state. Its changes stay local until it commits, which
//! writes them into the parent. Committing the root hands the pending changes
//! to the [`PersistenceStrategy`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use asupersync::Cx;
use relsync_core::{
    DataContainer, DataContainerState, Error, MappingConfiguration, ObjectId, RelationEndPointId,
    Result, TransactionErrorKind, TransactionId, Value, outcome_into_result,
};
use serde::{Deserialize, Serialize};

use crate::TransactionConfig;
use crate::data_keeper::{DataKeeperFactory, DefaultDataKeeperFactory};
use crate::data_manager::{DataManager, DataManagerCounts, DataManagerSnapshot};
use crate::listener::{ListenerCollection, TracingListener, TransactionListener};
use crate::load_tracker::{LazyLoadStats, LoadTracker};
use crate::persistence::{LoadContext, ParentTransactionStrategy, PersistenceStrategy};

/// A transaction hierarchy over one persistence collaborator.
pub struct ClientTransaction<S: PersistenceStrategy> {
    store: S,
    mapping: Arc<MappingConfiguration>,
    config: TransactionConfig,
    keeper_factory: Box<dyn DataKeeperFactory + Send + Sync>,
    listeners: ListenerCollection,
    /// Root first; the last level is the active one.
    levels: Vec<DataManager>,
    next_id: u64,
}

impl<S: PersistenceStrategy> fmt::Debug for ClientTransaction<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientTransaction")
            .field("levels", &self.levels.len())
            .field("active", &self.active_id())
            .field("listeners", &self.listeners.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S: PersistenceStrategy> ClientTransaction<S> {
    /// Create a root transaction with the default configuration.
    pub fn new(store: S, mapping: Arc<MappingConfiguration>) -> Self {
        Self::with_config(store, mapping, TransactionConfig::default())
    }

    /// Create a root transaction.
    pub fn with_config(store: S, mapping: Arc<MappingConfiguration>, config: TransactionConfig) -> Self {
        let mut listeners = ListenerCollection::new();
        if config.trace_events {
            listeners.add(Box::new(TracingListener));
        }
        let root = DataManager::new(TransactionId::new(1), Arc::clone(&mapping), new_load_tracker(&config));
        tracing::info!(transaction = %root.transaction(), "Created root transaction");
        Self {
            store,
            mapping,
            config,
            keeper_factory: Box::new(DefaultDataKeeperFactory),
            listeners,
            levels: vec![root],
            next_id: 2,
        }
    }

    /// Use `factory` for every data keeper created from now on.
    #[must_use]
    pub fn with_keeper_factory(mut self, factory: Box<dyn DataKeeperFactory + Send + Sync>) -> Self {
        self.keeper_factory = factory;
        self
    }

    /// Register a listener for every level of the hierarchy.
    pub fn add_listener(&mut self, listener: Box<dyn TransactionListener + Send + Sync>) {
        self.listeners.add(listener);
    }

    /// The configuration.
    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    /// The shared mapping metadata.
    pub fn mapping(&self) -> &Arc<MappingConfiguration> {
        &self.mapping
    }

    /// The persistence collaborator.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Mutable access to the persistence collaborator.
    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Id of the root transaction.
    pub fn root_id(&self) -> TransactionId {
        self.levels
            .first()
            .map_or(TransactionId::new(1), DataManager::transaction)
    }

    /// Id of the active (innermost) transaction.
    pub fn active_id(&self) -> TransactionId {
        self.levels
            .last()
            .map_or(TransactionId::new(1), DataManager::transaction)
    }

    /// Number of sub-transactions below the root.
    pub fn depth(&self) -> usize {
        self.levels.len().saturating_sub(1)
    }

    /// Whether `transaction` is the active level.
    pub fn is_active(&self, transaction: TransactionId) -> bool {
        self.active_id() == transaction
    }

    /// Ids of every level, root first.
    pub fn transactions(&self) -> Vec<TransactionId> {
        self.levels.iter().map(DataManager::transaction).collect()
    }

    /// The data manager of one level.
    pub fn data_manager(&self, transaction: TransactionId) -> Result<&DataManager> {
        let index = self.level_index(transaction)?;
        Ok(&self.levels[index])
    }

    fn level_index(&self, transaction: TransactionId) -> Result<usize> {
        self.levels
            .iter()
            .position(|level| level.transaction() == transaction)
            .ok_or_else(|| {
                Error::transaction(
                    TransactionErrorKind::UnknownTransaction,
                    format!("{transaction} is not part of this hierarchy"),
                )
            })
    }

    fn require_active(&self, transaction: TransactionId, operation: &str) -> Result<usize> {
        let index = self.level_index(transaction)?;
        if index + 1 != self.levels.len() {
            return Err(Error::inactive(operation, transaction));
        }
        Ok(index)
    }

    /// Run `f` on one level with a load context wired to its ancestors.
    ///
    /// `mutation` names the operation when it modifies the level; mutations
    /// are only allowed on the active level.
    fn with_level<T>(
        &mut self,
        cx: &Cx,
        transaction: TransactionId,
        mutation: Option<&str>,
        f: impl FnOnce(&mut DataManager, &mut LoadContext<'_>) -> Result<T>,
    ) -> Result<T> {
        let index = match mutation {
            Some(operation) => self.require_active(transaction, operation)?,
            None => self.level_index(transaction)?,
        };
        let (ancestors, rest) = self.levels.split_at_mut(index);
        let manager = &mut rest[0];
        let keeper_factory: &dyn DataKeeperFactory = self.keeper_factory.as_ref();
        let listener: &dyn TransactionListener = &self.listeners;
        if ancestors.is_empty() {
            let mut env = LoadContext {
                cx,
                persistence: &mut self.store,
                keeper_factory,
                listener,
            };
            f(manager, &mut env)
        } else {
            let mut parents =
                ParentTransactionStrategy::new(ancestors, &mut self.store, keeper_factory, listener);
            let mut env = LoadContext {
                cx,
                persistence: &mut parents,
                keeper_factory,
                listener,
            };
            f(manager, &mut env)
        }
    }

    // ========================================================================
    // Objects
    // ========================================================================

    /// The data container of an object, loading it on first access.
    pub fn load_object(&mut self, cx: &Cx, transaction: TransactionId, object_id: &ObjectId) -> Result<DataContainer> {
        self.with_level(cx, transaction, None, |manager, env| {
            manager.get_data_container(object_id, env).cloned()
        })
    }

    /// State of an object; a discarded object is [`DataContainerState::Invalid`].
    pub fn object_state(
        &mut self,
        cx: &Cx,
        transaction: TransactionId,
        object_id: &ObjectId,
    ) -> Result<DataContainerState> {
        self.with_level(cx, transaction, None, |manager, env| {
            if manager.is_invalid(object_id) {
                return Ok(DataContainerState::Invalid);
            }
            match manager.get_data_container(object_id, env) {
                Ok(container) => Ok(container.state()),
                Err(Error::ObjectInvalid(_)) => Ok(DataContainerState::Invalid),
                Err(error) => Err(error),
            }
        })
    }

    /// Current value of a scalar property.
    pub fn get_value(
        &mut self,
        cx: &Cx,
        transaction: TransactionId,
        object_id: &ObjectId,
        property: &str,
    ) -> Result<Value> {
        self.with_level(cx, transaction, None, |manager, env| {
            manager.get_value(object_id, property, env)
        })
    }

    /// Create a new object.
    #[tracing::instrument(level = "debug", skip(self, cx, values))]
    pub fn new_object(
        &mut self,
        cx: &Cx,
        transaction: TransactionId,
        object_id: &ObjectId,
        values: impl IntoIterator<Item = (String, Value)>,
    ) -> Result<()> {
        self.with_level(cx, transaction, Some("new_object"), |manager, env| {
            manager.new_object(object_id, values, env)
        })
    }

    /// Set a scalar property.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub fn set_value(
        &mut self,
        cx: &Cx,
        transaction: TransactionId,
        object_id: &ObjectId,
        property: &str,
        value: Value,
    ) -> Result<()> {
        self.with_level(cx, transaction, Some("set_value"), |manager, env| {
            manager.set_value(object_id, property, value, env)
        })
    }

    /// Delete an object and clear every relation it takes part in.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub fn delete_object(&mut self, cx: &Cx, transaction: TransactionId, object_id: &ObjectId) -> Result<()> {
        self.with_level(cx, transaction, Some("delete_object"), |manager, env| {
            manager.delete_object(object_id, env)
        })
    }

    /// Remove an unchanged object from one level.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub fn unload_object(&mut self, cx: &Cx, transaction: TransactionId, object_id: &ObjectId) -> Result<()> {
        self.with_level(cx, transaction, Some("unload_object"), |manager, env| {
            manager.unload_object(object_id, env)
        })
    }

    // ========================================================================
    // Relations
    // ========================================================================

    /// Current related objects of an end-point.
    pub fn get_related_objects(
        &mut self,
        cx: &Cx,
        transaction: TransactionId,
        end_point: &RelationEndPointId,
    ) -> Result<Vec<ObjectId>> {
        self.with_level(cx, transaction, None, |manager, env| {
            manager.get_related_object_ids(end_point, env)
        })
    }

    /// Related objects of an end-point as loaded or last committed.
    pub fn get_original_related_objects(
        &mut self,
        cx: &Cx,
        transaction: TransactionId,
        end_point: &RelationEndPointId,
    ) -> Result<Vec<ObjectId>> {
        self.with_level(cx, transaction, None, |manager, env| {
            manager.get_original_related_object_ids(end_point, env)
        })
    }

    /// The single related object of a real or one-valued end-point.
    pub fn get_related_object(
        &mut self,
        cx: &Cx,
        transaction: TransactionId,
        end_point: &RelationEndPointId,
    ) -> Result<Option<ObjectId>> {
        self.with_level(cx, transaction, None, |manager, env| {
            manager.get_related_object(end_point, env)
        })
    }

    /// Whether a virtual end-point's data is loaded in `transaction`. Never loads.
    pub fn is_data_complete(&self, transaction: TransactionId, end_point: &RelationEndPointId) -> Result<bool> {
        Ok(self
            .data_manager(transaction)?
            .end_points()
            .virtual_end_point(end_point)
            .is_some_and(|end_point| end_point.is_data_complete()))
    }

    /// Point a real or one-valued end-point at `target`.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub fn set_related_object(
        &mut self,
        cx: &Cx,
        transaction: TransactionId,
        end_point: &RelationEndPointId,
        target: Option<ObjectId>,
    ) -> Result<()> {
        self.with_level(cx, transaction, Some("set_related_object"), |manager, env| {
            manager.set_related_object(end_point, target, env)
        })
    }

    /// Add an object to a collection end-point.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub fn insert_related(
        &mut self,
        cx: &Cx,
        transaction: TransactionId,
        end_point: &RelationEndPointId,
        item: &ObjectId,
    ) -> Result<()> {
        self.with_level(cx, transaction, Some("insert_related"), |manager, env| {
            manager.insert_related(end_point, item, env)
        })
    }

    /// Remove an object from a collection end-point.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub fn remove_related(
        &mut self,
        cx: &Cx,
        transaction: TransactionId,
        end_point: &RelationEndPointId,
        item: &ObjectId,
    ) -> Result<()> {
        self.with_level(cx, transaction, Some("remove_related"), |manager, env| {
            manager.remove_related(end_point, item, env)
        })
    }

    /// Forget the loaded data of an unchanged virtual end-point.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub fn unload_virtual_end_point(
        &mut self,
        cx: &Cx,
        transaction: TransactionId,
        end_point: &RelationEndPointId,
    ) -> Result<()> {
        self.with_level(cx, transaction, Some("unload_virtual_end_point"), |manager, env| {
            manager.unload_virtual_end_point(end_point, env)
        })
    }

    /// Whether an end-point is in sync with its opposite side.
    pub fn is_synchronized(
        &mut self,
        cx: &Cx,
        transaction: TransactionId,
        end_point: &RelationEndPointId,
    ) -> Result<bool> {
        self.with_level(cx, transaction, None, |manager, env| {
            manager.is_synchronized(end_point, env)
        })
    }

    /// Bring an end-point back in sync with its opposite side.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub fn synchronize(
        &mut self,
        cx: &Cx,
        transaction: TransactionId,
        end_point: &RelationEndPointId,
    ) -> Result<()> {
        self.with_level(cx, transaction, Some("synchronize"), |manager, env| {
            manager.synchronize(end_point, env)
        })
    }

    // ========================================================================
    // Commit / rollback
    // ========================================================================

    /// Commit the active level.
    ///
    /// The root hands its changes to the persistence collaborator first and
    /// only commits in memory once they are stored. A sub-transaction writes
    /// its changes into its parent; if that fails the parent is restored.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub fn commit(&mut self, cx: &Cx, transaction: TransactionId) -> Result<()> {
        let index = self.require_active(transaction, "commit")?;
        let start = std::time::Instant::now();

        let data = self.levels[index].persistable_data();
        let changed: Vec<ObjectId> = data.iter().map(|entry| entry.object_id.clone()).collect();
        tracing::info!(%transaction, changed = changed.len(), "Committing transaction");
        self.levels[index].validate_commit()?;
        self.listeners.transaction_committing(transaction, &changed);

        if index == 0 {
            if !data.is_empty() {
                outcome_into_result(self.store.persist(cx, &data))?;
            }
            self.levels[0].commit()?;
        } else {
            self.commit_into_parent(cx, index)?;
        }

        self.listeners.transaction_committed(transaction);
        tracing::info!(
            %transaction,
            elapsed = ?start.elapsed(),
            "Transaction committed"
        );
        Ok(())
    }

    fn commit_into_parent(&mut self, cx: &Cx, index: usize) -> Result<()> {
        let (ancestors, rest) = self.levels.split_at_mut(index);
        let sub = &mut rest[0];
        let Some((parent, grand_parents)) = ancestors.split_last_mut() else {
            return Err(Error::transaction(
                TransactionErrorKind::NotASubTransaction,
                format!("{} has no parent", sub.transaction()),
            ));
        };
        let keeper_factory: &dyn DataKeeperFactory = self.keeper_factory.as_ref();
        let listener: &dyn TransactionListener = &self.listeners;

        let backup = parent.clone();
        let result = if grand_parents.is_empty() {
            let mut env = LoadContext {
                cx,
                persistence: &mut self.store,
                keeper_factory,
                listener,
            };
            parent.apply_changes_from(sub, &mut env)
        } else {
            let mut strategy =
                ParentTransactionStrategy::new(grand_parents, &mut self.store, keeper_factory, listener);
            let mut env = LoadContext {
                cx,
                persistence: &mut strategy,
                keeper_factory,
                listener,
            };
            parent.apply_changes_from(sub, &mut env)
        };

        if let Err(error) = result.and_then(|()| sub.commit()) {
            tracing::warn!(
                parent = %parent.transaction(),
                sub = %sub.transaction(),
                error = %error,
                "Sub-transaction commit failed; parent restored"
            );
            *parent = backup;
            return Err(error);
        }
        Ok(())
    }

    /// Discard every pending change of the active level.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn rollback(&mut self, transaction: TransactionId) -> Result<()> {
        let index = self.require_active(transaction, "rollback")?;
        tracing::info!(%transaction, "Rolling back transaction");
        self.levels[index].rollback();
        self.listeners.transaction_rolled_back(transaction);
        Ok(())
    }

    // ========================================================================
    // Hierarchy
    // ========================================================================

    /// Open a sub-transaction below the active level, which becomes inactive.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn create_sub_transaction(&mut self, parent: TransactionId) -> Result<TransactionId> {
        self.require_active(parent, "create_sub_transaction")?;
        if self.depth() >= self.config.max_nesting_depth {
            return Err(Error::transaction(
                TransactionErrorKind::NestingTooDeep,
                format!(
                    "cannot nest more than {} sub-transactions",
                    self.config.max_nesting_depth
                ),
            ));
        }
        let sub = TransactionId::new(self.next_id);
        self.next_id += 1;
        self.levels.push(DataManager::new(
            sub,
            Arc::clone(&self.mapping),
            new_load_tracker(&self.config),
        ));
        self.listeners.sub_transaction_created(parent, sub);
        tracing::info!(%parent, %sub, depth = self.depth(), "Created sub-transaction");
        Ok(sub)
    }

    /// Drop the active sub-transaction and its uncommitted changes; its parent
    /// becomes active again.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn discard_sub_transaction(&mut self, sub: TransactionId) -> Result<()> {
        let index = self.level_index(sub)?;
        if index == 0 {
            return Err(Error::transaction(
                TransactionErrorKind::NotASubTransaction,
                format!("{sub} is the root transaction"),
            ));
        }
        if index + 1 != self.levels.len() {
            return Err(Error::inactive("discard_sub_transaction", sub));
        }
        self.levels.pop();
        let parent = self.active_id();
        self.listeners.sub_transaction_discarded(parent, sub);
        tracing::info!(%parent, %sub, "Discarded sub-transaction");
        Ok(())
    }

    // ========================================================================
    // Diagnostics and snapshots
    // ========================================================================

    /// Lazy-load statistics of one level.
    pub fn load_stats(&self, transaction: TransactionId) -> Result<LazyLoadStats> {
        Ok(self.data_manager(transaction)?.load_tracker().stats())
    }

    /// A summary of every level.
    pub fn debug_state(&self) -> TransactionDebugInfo {
        let active = self.active_id();
        TransactionDebugInfo {
            root: self.root_id(),
            active,
            depth: self.depth(),
            levels: self
                .levels
                .iter()
                .map(|level| TransactionLevelInfo {
                    transaction: level.transaction(),
                    is_active: level.transaction() == active,
                    counts: level.counts(),
                    lazy_loads: level.load_tracker().stats(),
                })
                .collect(),
        }
    }

    /// Flatten the whole hierarchy into a serializable snapshot.
    pub fn snapshot(&self) -> ClientTransactionSnapshot {
        ClientTransactionSnapshot {
            next_id: self.next_id,
            levels: self.levels.iter().map(DataManager::snapshot).collect(),
        }
    }

    /// Replace the hierarchy with the one in `snapshot`.
    ///
    /// Nothing changes if the snapshot is rejected.
    pub fn restore(&mut self, snapshot: ClientTransactionSnapshot) -> Result<()> {
        if snapshot.levels.is_empty() {
            return Err(invalid_snapshot("the snapshot has no levels"));
        }
        let mut previous: Option<TransactionId> = None;
        for level in &snapshot.levels {
            let id = level.transaction;
            if previous.is_some_and(|previous| previous >= id) {
                return Err(invalid_snapshot(format!("{id} is out of order")));
            }
            if id.get() >= snapshot.next_id {
                return Err(invalid_snapshot(format!(
                    "{id} is not below the next id {}",
                    snapshot.next_id
                )));
            }
            previous = Some(id);
        }

        let levels = snapshot
            .levels
            .into_iter()
            .map(|level| {
                DataManager::from_snapshot(level, Arc::clone(&self.mapping), new_load_tracker(&self.config))
            })
            .collect::<Result<Vec<_>>>()?;
        self.levels = levels;
        self.next_id = snapshot.next_id;
        tracing::info!(levels = self.levels.len(), "Restored transaction hierarchy");
        Ok(())
    }
}

fn new_load_tracker(config: &TransactionConfig) -> LoadTracker {
    let mut tracker = LoadTracker::new().with_threshold(config.lazy_load_warning_threshold);
    if !config.track_lazy_loads {
        tracker.disable();
    }
    tracker
}

fn invalid_snapshot(message: impl Into<String>) -> Error {
    Error::transaction(TransactionErrorKind::InvalidSnapshot, message)
}

/// Serializable form of a [`ClientTransaction`] hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientTransactionSnapshot {
    /// Id the next sub-transaction will get.
    pub next_id: u64,
    /// One data manager per level, root first.
    pub levels: Vec<DataManagerSnapshot>,
}

impl ClientTransactionSnapshot {
    /// Encode as JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|error| Error::Serialization(error.to_string()))
    }

    /// Decode from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|error| Error::Serialization(error.to_string()))
    }
}

/// Summary of a transaction hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionDebugInfo {
    /// The root transaction.
    pub root: TransactionId,
    /// The active transaction.
    pub active: TransactionId,
    /// Number of sub-transactions.
    pub depth: usize,
    /// Per-level details, root first.
    pub levels: Vec<TransactionLevelInfo>,
}

/// Summary of one level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionLevelInfo {
    /// The level's transaction.
    pub transaction: TransactionId,
    /// Whether mutations are allowed.
    pub is_active: bool,
    /// Object and end-point counts.
    pub counts: DataManagerCounts,
    /// Lazy-load statistics.
    pub lazy_loads: LazyLoadStats,
}

impl TransactionDebugInfo {
    /// Pending changes summed over all levels.
    pub fn pending_changes(&self) -> usize {
        self.levels.iter().map(|level| level.counts.pending_changes).sum()
    }

    /// Tracked objects per level.
    pub fn tracked_objects(&self) -> BTreeMap<TransactionId, usize> {
        self.levels
            .iter()
            .map(|level| (level.transaction, level.counts.data_containers))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::InMemoryStore;
    use crate::test_support::{Event, RecordingListener, customer, customer_of, mapping, order, orders_of};
    use relsync_core::LoadErrorKind;

    const ROOT: TransactionId = TransactionId::new(1);

    fn seeded_store() -> InMemoryStore {
        let mut store = InMemoryStore::new(mapping());
        for (key, name) in [(1, "Ada"), (2, "Grace"), (3, "Barbara")] {
            store
                .insert(customer(key), [("name".to_string(), Value::from(name))])
                .unwrap();
        }
        for (key, owner) in [(1, 1), (2, 1), (3, 2)] {
            store
                .insert(
                    order(key),
                    [
                        ("number".to_string(), Value::from(format!("N-{key}"))),
                        ("customer".to_string(), Value::from(customer(owner))),
                    ],
                )
                .unwrap();
        }
        store
    }

    fn transaction() -> (ClientTransaction<InMemoryStore>, RecordingListener) {
        transaction_with(TransactionConfig::default())
    }

    fn transaction_with(config: TransactionConfig) -> (ClientTransaction<InMemoryStore>, RecordingListener) {
        let listener = RecordingListener::new();
        let mut tx = ClientTransaction::with_config(seeded_store(), mapping(), config);
        tx.add_listener(Box::new(listener.clone()));
        (tx, listener)
    }

    #[test]
    fn test_mutation_on_inactive_parent_is_rejected() {
        let cx = Cx::for_testing();
        let (mut tx, _) = transaction();
        let sub = tx.create_sub_transaction(ROOT).unwrap();
        assert!(tx.is_active(sub));
        assert!(!tx.is_active(ROOT));

        let err = tx
            .set_value(&cx, ROOT, &order(1), "number", Value::from("X"))
            .unwrap_err();
        assert!(err.is_transaction_inactive());
        assert!(err.to_string().contains("set_value"));

        // Reads still work on the parent.
        let value = tx.get_value(&cx, ROOT, &order(1), "number").unwrap();
        assert_eq!(value, Value::from("N-1"));

        let err = tx.commit(&cx, ROOT).unwrap_err();
        assert!(err.is_transaction_inactive());
        let err = tx.create_sub_transaction(ROOT).unwrap_err();
        assert!(err.is_transaction_inactive());
    }

    #[test]
    fn test_unknown_transaction_is_rejected() {
        let cx = Cx::for_testing();
        let (mut tx, _) = transaction();
        let err = tx
            .get_value(&cx, TransactionId::new(99), &order(1), "number")
            .unwrap_err();
        assert_eq!(err.transaction_kind(), Some(TransactionErrorKind::UnknownTransaction));
    }

    #[test]
    fn test_sub_transaction_isolates_changes_until_discarded() {
        let cx = Cx::for_testing();
        let (mut tx, listener) = transaction();
        tx.set_related_object(&cx, ROOT, &customer_of(1), Some(customer(2)))
            .unwrap();

        let sub = tx.create_sub_transaction(ROOT).unwrap();
        let orders = tx.get_related_objects(&cx, sub, &orders_of(2)).unwrap();
        assert_eq!(orders, vec![order(3), order(1)]);

        tx.remove_related(&cx, sub, &orders_of(2), &order(3)).unwrap();
        assert_eq!(tx.get_related_objects(&cx, sub, &orders_of(2)).unwrap(), vec![order(1)]);

        tx.discard_sub_transaction(sub).unwrap();
        assert!(tx.is_active(ROOT));
        let orders = tx.get_related_objects(&cx, ROOT, &orders_of(2)).unwrap();
        assert_eq!(orders, vec![order(3), order(1)]);
        assert!(listener.events().contains(&Event::SubCreated(ROOT, sub)));
        assert!(listener.events().contains(&Event::SubDiscarded(ROOT, sub)));
    }

    #[test]
    fn test_sub_commit_writes_into_parent_and_root_commit_persists() {
        let cx = Cx::for_testing();
        let (mut tx, listener) = transaction();
        let sub = tx.create_sub_transaction(ROOT).unwrap();

        tx.delete_object(&cx, sub, &order(3)).unwrap();
        tx.insert_related(&cx, sub, &orders_of(2), &order(2)).unwrap();
        tx.new_object(
            &cx,
            sub,
            &order(10),
            [("customer".to_string(), Value::from(customer(1)))],
        )
        .unwrap();
        tx.commit(&cx, sub).unwrap();
        tx.discard_sub_transaction(sub).unwrap();

        assert_eq!(tx.object_state(&cx, ROOT, &order(3)).unwrap(), DataContainerState::Deleted);
        assert_eq!(tx.object_state(&cx, ROOT, &order(10)).unwrap(), DataContainerState::New);
        assert_eq!(
            tx.get_related_objects(&cx, ROOT, &orders_of(1)).unwrap(),
            vec![order(1), order(10)]
        );
        assert_eq!(tx.get_related_objects(&cx, ROOT, &orders_of(2)).unwrap(), vec![order(2)]);
        assert_eq!(tx.store().persist_calls(), 0);

        tx.commit(&cx, ROOT).unwrap();
        let store = tx.store();
        assert_eq!(store.persist_calls(), 1);
        assert!(!store.contains(&order(3)));
        assert_eq!(
            store.row(&order(2)).unwrap().get("customer"),
            Some(&Value::from(customer(2)))
        );
        assert!(store.contains(&order(10)));
        assert_eq!(tx.object_state(&cx, ROOT, &order(3)).unwrap(), DataContainerState::Invalid);
        assert!(listener.events().contains(&Event::Committed(sub)));
        assert!(listener.events().contains(&Event::Committed(ROOT)));
    }

    #[test]
    fn test_committing_event_lists_the_persisted_objects() {
        let cx = Cx::for_testing();
        let (mut tx, listener) = transaction();
        tx.set_related_object(&cx, ROOT, &customer_of(3), Some(customer(1)))
            .unwrap();
        tx.commit(&cx, ROOT).unwrap();

        let committing: Vec<Vec<ObjectId>> = listener
            .events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Committing(id, changed) if id == ROOT => Some(changed),
                _ => None,
            })
            .collect();
        assert_eq!(committing.len(), 1);
        assert!(committing[0].contains(&order(3)));
        assert!(committing[0].contains(&customer(1)));
        assert_eq!(tx.store().persist_calls(), 1);

        // Nothing left to write: the listener hears an empty list and the store is not called.
        tx.commit(&cx, ROOT).unwrap();
        assert!(listener.events().contains(&Event::Committing(ROOT, Vec::new())));
        assert_eq!(tx.store().persist_calls(), 1);
    }

    #[test]
    fn test_object_deleted_in_parent_is_invalid_in_sub() {
        let cx = Cx::for_testing();
        let (mut tx, _) = transaction();
        tx.delete_object(&cx, ROOT, &order(1)).unwrap();
        let sub = tx.create_sub_transaction(ROOT).unwrap();

        let err = tx.get_value(&cx, sub, &order(1), "number").unwrap_err();
        assert!(matches!(err, Error::ObjectInvalid(_)));
        assert_eq!(tx.object_state(&cx, sub, &order(1)).unwrap(), DataContainerState::Invalid);
        assert_eq!(tx.get_related_objects(&cx, sub, &orders_of(1)).unwrap(), vec![order(2)]);
    }

    #[test]
    fn test_failed_persist_keeps_changes_pending() {
        let cx = Cx::for_testing();
        let (mut tx, listener) = transaction();
        tx.set_value(&cx, ROOT, &customer(1), "name", Value::from("Ada L."))
            .unwrap();
        tx.store_mut().fail_next_operation("disk full");

        let err = tx.commit(&cx, ROOT).unwrap_err();
        assert_eq!(err.load_kind(), Some(LoadErrorKind::Storage));
        assert_eq!(tx.object_state(&cx, ROOT, &customer(1)).unwrap(), DataContainerState::Changed);
        assert!(!listener.events().contains(&Event::Committed(ROOT)));

        tx.commit(&cx, ROOT).unwrap();
        assert_eq!(
            tx.store().row(&customer(1)).unwrap().get("name"),
            Some(&Value::from("Ada L."))
        );
        assert_eq!(
            listener.events().last(),
            Some(&Event::Committed(ROOT))
        );
    }

    #[test]
    fn test_rollback_reverts_root_changes() {
        let cx = Cx::for_testing();
        let (mut tx, listener) = transaction();
        tx.set_related_object(&cx, ROOT, &customer_of(2), Some(customer(3)))
            .unwrap();
        tx.rollback(ROOT).unwrap();

        assert_eq!(
            tx.get_related_object(&cx, ROOT, &customer_of(2)).unwrap(),
            Some(customer(1))
        );
        assert!(tx.get_related_objects(&cx, ROOT, &orders_of(3)).unwrap().is_empty());
        assert_eq!(listener.events().last(), Some(&Event::RolledBack(ROOT)));
    }

    #[test]
    fn test_nesting_depth_is_limited() {
        let (mut tx, _) = transaction_with(TransactionConfig::default().max_nesting_depth(2));
        let first = tx.create_sub_transaction(ROOT).unwrap();
        let second = tx.create_sub_transaction(first).unwrap();
        let err = tx.create_sub_transaction(second).unwrap_err();
        assert_eq!(err.transaction_kind(), Some(TransactionErrorKind::NestingTooDeep));
        assert_eq!(tx.depth(), 2);
    }

    #[test]
    fn test_discard_rules() {
        let (mut tx, _) = transaction();
        let err = tx.discard_sub_transaction(ROOT).unwrap_err();
        assert_eq!(err.transaction_kind(), Some(TransactionErrorKind::NotASubTransaction));

        let first = tx.create_sub_transaction(ROOT).unwrap();
        let second = tx.create_sub_transaction(first).unwrap();
        let err = tx.discard_sub_transaction(first).unwrap_err();
        assert!(err.is_transaction_inactive());

        tx.discard_sub_transaction(second).unwrap();
        tx.discard_sub_transaction(first).unwrap();
        assert_eq!(tx.transactions(), vec![ROOT]);
    }

    #[test]
    fn test_lazy_load_stats_flag_n_plus_one() {
        let cx = Cx::for_testing();
        let (mut tx, _) =
            transaction_with(TransactionConfig::default().lazy_load_warning_threshold(2));
        for key in 1..=3 {
            tx.get_related_objects(&cx, ROOT, &orders_of(key)).unwrap();
        }
        let stats = tx.load_stats(ROOT).unwrap();
        assert_eq!(stats.total_loads, 3);
        assert_eq!(stats.relations_loaded, 1);
        assert_eq!(stats.potential_n_plus_one, 1);

        let (mut quiet, _) =
            transaction_with(TransactionConfig::default().track_lazy_loads(false));
        quiet.get_related_objects(&cx, ROOT, &orders_of(1)).unwrap();
        assert_eq!(quiet.load_stats(ROOT).unwrap().total_loads, 0);
    }

    #[test]
    fn test_snapshot_restores_hierarchy() {
        let cx = Cx::for_testing();
        let (mut tx, _) = transaction();
        tx.set_related_object(&cx, ROOT, &customer_of(1), Some(customer(2)))
            .unwrap();
        let sub = tx.create_sub_transaction(ROOT).unwrap();
        tx.set_value(&cx, sub, &order(1), "number", Value::from("moved"))
            .unwrap();

        let json = tx.snapshot().to_json().unwrap();
        let (mut restored, _) = transaction();
        restored
            .restore(ClientTransactionSnapshot::from_json(&json).unwrap())
            .unwrap();

        let counts = |info: TransactionDebugInfo| -> Vec<DataManagerCounts> {
            info.levels.into_iter().map(|level| level.counts).collect()
        };
        assert_eq!(counts(restored.debug_state()), counts(tx.debug_state()));
        assert_eq!(restored.snapshot(), tx.snapshot());
        assert_eq!(restored.active_id(), sub);
        assert_eq!(
            restored.get_value(&cx, sub, &order(1), "number").unwrap(),
            Value::from("moved")
        );
        assert_eq!(restored.store().total_relation_loads(), 0);
    }

    #[test]
    fn test_restore_rejects_bad_snapshots() {
        let (mut tx, _) = transaction();
        let mut snapshot = tx.snapshot();
        snapshot.next_id = 1;
        let err = tx.restore(snapshot).unwrap_err();
        assert_eq!(err.transaction_kind(), Some(TransactionErrorKind::InvalidSnapshot));

        let err = ClientTransactionSnapshot::from_json("{not json").unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
        assert_eq!(tx.transactions(), vec![ROOT]);
    }

    #[derive(Debug, Default)]
    struct CountingFactory {
        created: std::sync::atomic::AtomicUsize,
    }

    impl DataKeeperFactory for Arc<CountingFactory> {
        fn create(
            &self,
            end_point_id: &RelationEndPointId,
            cardinality: relsync_core::Cardinality,
        ) -> crate::data_keeper::VirtualEndPointDataKeeper {
            self.created.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            DefaultDataKeeperFactory.create(end_point_id, cardinality)
        }
    }

    #[test]
    fn test_custom_keeper_factory_is_used_on_every_level() {
        let cx = Cx::for_testing();
        let factory = Arc::new(CountingFactory::default());
        let mut tx = ClientTransaction::new(seeded_store(), mapping())
            .with_keeper_factory(Box::new(Arc::clone(&factory)));
        tx.get_related_objects(&cx, ROOT, &orders_of(1)).unwrap();
        let sub = tx.create_sub_transaction(ROOT).unwrap();
        tx.get_related_objects(&cx, sub, &orders_of(1)).unwrap();

        assert_eq!(factory.created.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn test_debug_state_counts_levels() {
        let cx = Cx::for_testing();
        let (mut tx, _) = transaction();
        tx.get_related_objects(&cx, ROOT, &orders_of(1)).unwrap();
        tx.set_value(&cx, ROOT, &order(1), "number", Value::from("x"))
            .unwrap();
        let sub = tx.create_sub_transaction(ROOT).unwrap();

        let info = tx.debug_state();
        assert_eq!(info.depth, 1);
        assert_eq!(info.active, sub);
        assert_eq!(info.pending_changes(), 1);
        assert_eq!(info.tracked_objects().get(&ROOT), Some(&3));
        assert!(info.levels[1].is_active);
        assert!(!info.levels[0].is_active);
    }
}
