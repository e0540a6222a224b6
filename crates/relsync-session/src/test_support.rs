//! Fixtures shared by the unit tests of this crate.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use asupersync::{Cx, Outcome};
use relsync_core::{
    ClassDefinition, DataContainer, Error, LoadErrorKind, MappingConfiguration, ObjectId, RelationDefinition,
    RelationEndPointId, Result, TransactionId, Value,
};

use crate::data_keeper::DefaultDataKeeperFactory;
use crate::data_manager::DataManager;
use crate::end_point::{EndPointContext, RealObjectEndPoint, SyncState};
use crate::listener::TransactionListener;
use crate::load_tracker::LoadTracker;
use crate::memory_store::InMemoryStore;
use crate::persistence::{LoadContext, PersistableData, PersistenceStrategy};

pub fn customer(key: i64) -> ObjectId {
    ObjectId::new("Customer", key)
}

pub fn order(key: i64) -> ObjectId {
    ObjectId::new("Order", key)
}

pub fn person(key: i64) -> ObjectId {
    ObjectId::new("Person", key)
}

pub fn computer(key: i64) -> ObjectId {
    ObjectId::new("Computer", key)
}

/// `Customer|key/orders`
pub fn orders_of(key: i64) -> RelationEndPointId {
    RelationEndPointId::new(customer(key), "orders")
}

/// `Order|key/customer`
pub fn customer_of(key: i64) -> RelationEndPointId {
    RelationEndPointId::new(order(key), "customer")
}

/// `Person|key/computer`
pub fn computer_of(key: i64) -> RelationEndPointId {
    RelationEndPointId::new(person(key), "computer")
}

/// Customer 1:n Order, Person 1:1 Computer, Customer -> Region.
pub fn mapping() -> Arc<MappingConfiguration> {
    let mapping = MappingConfiguration::builder()
        .class(ClassDefinition::new("Customer").property("name"))
        .class(ClassDefinition::new("Order").property("number"))
        .class(ClassDefinition::new("Person").property("name"))
        .class(ClassDefinition::new("Computer").property("serial"))
        .class(ClassDefinition::new("Region").property("name"))
        .relation(RelationDefinition::one_to_many("Customer", "orders", "Order", "customer"))
        .relation(RelationDefinition::one_to_one("Person", "computer", "Computer", "owner"))
        .relation(RelationDefinition::unidirectional("Customer", "region", "Region"))
        .build()
        .expect("fixture mapping is valid");
    Arc::new(mapping)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ObjectLoaded(ObjectId),
    ObjectUnloading(ObjectId),
    EndPointLoaded(RelationEndPointId),
    EndPointUnloading(RelationEndPointId),
    Committing(TransactionId, Vec<ObjectId>),
    Committed(TransactionId),
    RolledBack(TransactionId),
    SubCreated(TransactionId, TransactionId),
    SubDiscarded(TransactionId, TransactionId),
}

/// Records every event; clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct RecordingListener {
    events: Arc<Mutex<Vec<Event>>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().expect("listener lock poisoned").clone()
    }

    fn push(&self, event: Event) {
        self.events.lock().expect("listener lock poisoned").push(event);
    }
}

impl TransactionListener for RecordingListener {
    fn object_loaded(&self, _transaction: TransactionId, object_id: &ObjectId) {
        self.push(Event::ObjectLoaded(object_id.clone()));
    }

    fn object_unloading(&self, _transaction: TransactionId, object_id: &ObjectId) {
        self.push(Event::ObjectUnloading(object_id.clone()));
    }

    fn relation_end_point_loaded(&self, _transaction: TransactionId, end_point: &RelationEndPointId) {
        self.push(Event::EndPointLoaded(end_point.clone()));
    }

    fn relation_end_point_unloading(&self, _transaction: TransactionId, end_point: &RelationEndPointId) {
        self.push(Event::EndPointUnloading(end_point.clone()));
    }

    fn transaction_committing(&self, transaction: TransactionId, changed_objects: &[ObjectId]) {
        self.push(Event::Committing(transaction, changed_objects.to_vec()));
    }

    fn transaction_committed(&self, transaction: TransactionId) {
        self.push(Event::Committed(transaction));
    }

    fn transaction_rolled_back(&self, transaction: TransactionId) {
        self.push(Event::RolledBack(transaction));
    }

    fn sub_transaction_created(&self, parent: TransactionId, sub: TransactionId) {
        self.push(Event::SubCreated(parent, sub));
    }

    fn sub_transaction_discarded(&self, parent: TransactionId, sub: TransactionId) {
        self.push(Event::SubDiscarded(parent, sub));
    }
}

/// Canned answers for end-point level tests.
#[derive(Debug, Default)]
pub struct FakeStore {
    opposites: BTreeMap<RelationEndPointId, Vec<ObjectId>>,
    opposite_loads: BTreeMap<RelationEndPointId, usize>,
    fail_next: Option<String>,
}

impl FakeStore {
    pub fn set_opposites(&mut self, end_point: RelationEndPointId, items: Vec<ObjectId>) {
        self.opposites.insert(end_point, items);
    }

    pub fn opposite_loads(&self, end_point: &RelationEndPointId) -> usize {
        self.opposite_loads.get(end_point).copied().unwrap_or(0)
    }

    pub fn fail_next_load(&mut self, message: &str) {
        self.fail_next = Some(message.to_string());
    }
}

impl PersistenceStrategy for FakeStore {
    fn load_data_container(&mut self, _cx: &Cx, object_id: &ObjectId) -> Outcome<DataContainer, Error> {
        Outcome::Err(Error::load(
            LoadErrorKind::ObjectNotFound,
            format!("no container for '{object_id}'"),
        ))
    }

    fn load_opposite_objects(
        &mut self,
        _cx: &Cx,
        end_point: &RelationEndPointId,
    ) -> Outcome<Vec<ObjectId>, Error> {
        if let Some(message) = self.fail_next.take() {
            return Outcome::Err(Error::load(LoadErrorKind::Storage, message));
        }
        *self.opposite_loads.entry(end_point.clone()).or_default() += 1;
        Outcome::Ok(self.opposites.get(end_point).cloned().unwrap_or_default())
    }

    fn persist(&mut self, _cx: &Cx, _data: &[PersistableData]) -> Outcome<(), Error> {
        Outcome::Ok(())
    }
}

/// A bare end-point arena over a [`FakeStore`], for virtual end-point tests.
pub struct Harness {
    pub store: FakeStore,
    pub tracker: LoadTracker,
    pub listener: RecordingListener,
    pub reals: BTreeMap<RelationEndPointId, RealObjectEndPoint>,
    cx: Cx,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            store: FakeStore::default(),
            tracker: LoadTracker::new(),
            listener: RecordingListener::new(),
            reals: BTreeMap::new(),
            cx: Cx::for_testing(),
        }
    }

    /// Register `Order|key/customer` with an unknown sync state.
    pub fn add_real(&mut self, order_id: ObjectId) {
        let id = RelationEndPointId::new(order_id, "customer");
        self.reals
            .insert(id.clone(), RealObjectEndPoint::new(id, SyncState::Unknown));
    }

    pub fn set_sync_state(&mut self, key: i64, state: SyncState) {
        if let Some(real) = self.reals.get_mut(&customer_of(key)) {
            real.set_sync_state(state);
        }
    }

    pub fn sync_state(&self, key: i64) -> SyncState {
        self.reals
            .get(&customer_of(key))
            .map(RealObjectEndPoint::sync_state)
            .expect("real end-point registered")
    }

    pub fn with_ctx<T>(&mut self, f: impl FnOnce(&mut EndPointContext<'_, '_>) -> Result<T>) -> Result<T> {
        let mut env = LoadContext {
            cx: &self.cx,
            persistence: &mut self.store,
            keeper_factory: &DefaultDataKeeperFactory,
            listener: &self.listener,
        };
        let mut ctx = EndPointContext {
            transaction: TransactionId::new(1),
            real_end_points: &mut self.reals,
            load_tracker: &mut self.tracker,
            env: &mut env,
        };
        f(&mut ctx)
    }
}

/// A [`DataManager`] over an [`InMemoryStore`].
pub struct ManagerHarness {
    pub manager: DataManager,
    pub store: InMemoryStore,
    pub listener: RecordingListener,
    cx: Cx,
}

impl ManagerHarness {
    pub fn new() -> Self {
        let mapping = mapping();
        Self {
            manager: DataManager::new(TransactionId::new(1), Arc::clone(&mapping), LoadTracker::new()),
            store: InMemoryStore::new(mapping),
            listener: RecordingListener::new(),
            cx: Cx::for_testing(),
        }
    }

    pub fn insert_customer(&mut self, key: i64, name: &str) {
        self.store
            .insert(customer(key), [("name".to_string(), Value::from(name))])
            .expect("valid customer row");
    }

    pub fn insert_order(&mut self, key: i64, customer_key: Option<i64>) {
        self.store
            .insert(
                order(key),
                [
                    ("number".to_string(), Value::from(format!("N-{key}"))),
                    ("customer".to_string(), Value::from_reference(customer_key.map(customer))),
                ],
            )
            .expect("valid order row");
    }

    pub fn insert_person(&mut self, key: i64) {
        self.store
            .insert(person(key), [("name".to_string(), Value::from(format!("P-{key}")))])
            .expect("valid person row");
    }

    pub fn insert_computer(&mut self, key: i64, owner_key: Option<i64>) {
        self.store
            .insert(
                computer(key),
                [("owner".to_string(), Value::from_reference(owner_key.map(person)))],
            )
            .expect("valid computer row");
    }

    pub fn run<T>(&mut self, f: impl FnOnce(&mut DataManager, &mut LoadContext<'_>) -> Result<T>) -> Result<T> {
        let mut env = LoadContext {
            cx: &self.cx,
            persistence: &mut self.store,
            keeper_factory: &DefaultDataKeeperFactory,
            listener: &self.listener,
        };
        f(&mut self.manager, &mut env)
    }
}
