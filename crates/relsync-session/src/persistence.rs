//! The persistence collaborator and the sub-transaction loading strategy.

use std::collections::BTreeMap;

use asupersync::{Cx, Outcome};
use relsync_core::{
    DataContainer, DataContainerState, Error, ObjectId, RelationEndPointId, TransactionErrorKind,
    Value,
};
use serde::{Deserialize, Serialize};

use crate::data_keeper::DataKeeperFactory;
use crate::data_manager::DataManager;
use crate::listener::TransactionListener;

/// Supplies data to a transaction and stores its committed changes.
///
/// Every method receives the caller's `Cx` and reports through `Outcome`;
/// implementations should check `cx.cancel_reason()` before doing I/O.
pub trait PersistenceStrategy {
    /// Load the data container of one object.
    fn load_data_container(&mut self, cx: &Cx, object_id: &ObjectId) -> Outcome<DataContainer, Error>;

    /// The objects related through the virtual end-point `end_point`.
    ///
    /// Called exactly once per Incomplete → Complete transition.
    fn load_opposite_objects(
        &mut self,
        cx: &Cx,
        end_point: &RelationEndPointId,
    ) -> Outcome<Vec<ObjectId>, Error>;

    /// Store the changes of a committing root transaction.
    fn persist(&mut self, cx: &Cx, data: &[PersistableData]) -> Outcome<(), Error>;
}

/// Collaborators available while a transaction loads data.
pub struct LoadContext<'a> {
    /// Capability context of the current call.
    pub cx: &'a Cx,
    /// Where data comes from.
    pub persistence: &'a mut dyn PersistenceStrategy,
    /// Builds data keepers for newly completed virtual end-points.
    pub keeper_factory: &'a dyn DataKeeperFactory,
    /// Receives transaction events.
    pub listener: &'a dyn TransactionListener,
}

/// One changed object, as handed to [`PersistenceStrategy::persist`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistableData {
    /// The object.
    pub object_id: ObjectId,
    /// `New`, `Changed` or `Deleted`.
    pub state: DataContainerState,
    /// Current property values, foreign keys included.
    pub values: BTreeMap<String, Value>,
    /// Original property values.
    pub original_values: BTreeMap<String, Value>,
    /// Virtual end-points of the object whose related objects changed.
    pub changed_end_points: Vec<RelationEndPointId>,
}

/// Loads data for a sub-transaction from its parent transaction.
///
/// `parents` holds the ancestors of the sub-transaction, root first; the last
/// element is the direct parent. Loads the parent cannot answer from memory
/// recurse up the chain and finally reach `root`.
pub struct ParentTransactionStrategy<'a, S: PersistenceStrategy> {
    parents: &'a mut [DataManager],
    root: &'a mut S,
    keeper_factory: &'a dyn DataKeeperFactory,
    listener: &'a dyn TransactionListener,
}

impl<'a, S: PersistenceStrategy> ParentTransactionStrategy<'a, S> {
    /// Create a strategy over the given ancestors.
    pub fn new(
        parents: &'a mut [DataManager],
        root: &'a mut S,
        keeper_factory: &'a dyn DataKeeperFactory,
        listener: &'a dyn TransactionListener,
    ) -> Self {
        Self {
            parents,
            root,
            keeper_factory,
            listener,
        }
    }

    fn with_parent<T>(
        &mut self,
        cx: &Cx,
        f: impl FnOnce(&mut DataManager, &mut LoadContext<'_>) -> relsync_core::Result<T>,
        fallback: impl FnOnce(&mut S, &Cx) -> Outcome<T, Error>,
    ) -> Outcome<T, Error> {
        let Some((parent, ancestors)) = self.parents.split_last_mut() else {
            return fallback(&mut *self.root, cx);
        };
        let result = if ancestors.is_empty() {
            let mut env = LoadContext {
                cx,
                persistence: &mut *self.root,
                keeper_factory: self.keeper_factory,
                listener: self.listener,
            };
            f(parent, &mut env)
        } else {
            let mut grand_parents =
                ParentTransactionStrategy::new(ancestors, &mut *self.root, self.keeper_factory, self.listener);
            let mut env = LoadContext {
                cx,
                persistence: &mut grand_parents,
                keeper_factory: self.keeper_factory,
                listener: self.listener,
            };
            f(parent, &mut env)
        };
        match result {
            Ok(value) => Outcome::Ok(value),
            Err(error) => Outcome::Err(error),
        }
    }
}

impl<S: PersistenceStrategy> PersistenceStrategy for ParentTransactionStrategy<'_, S> {
    fn load_data_container(&mut self, cx: &Cx, object_id: &ObjectId) -> Outcome<DataContainer, Error> {
        self.with_parent(
            cx,
            |parent, env| {
                let container = parent.get_data_container(object_id, env)?;
                if container.is_deleted() {
                    return Err(Error::ObjectInvalid(object_id.clone()));
                }
                Ok(DataContainer::new_loaded(
                    object_id.clone(),
                    container.current_values(),
                ))
            },
            |root, cx| root.load_data_container(cx, object_id),
        )
    }

    fn load_opposite_objects(
        &mut self,
        cx: &Cx,
        end_point: &RelationEndPointId,
    ) -> Outcome<Vec<ObjectId>, Error> {
        self.with_parent(
            cx,
            |parent, env| parent.get_related_object_ids(end_point, env),
            |root, cx| root.load_opposite_objects(cx, end_point),
        )
    }

    fn persist(&mut self, _cx: &Cx, _data: &[PersistableData]) -> Outcome<(), Error> {
        Outcome::Err(Error::transaction(
            TransactionErrorKind::PersistFailed,
            "a sub-transaction commits into its parent, not into the data source",
        ))
    }
}
