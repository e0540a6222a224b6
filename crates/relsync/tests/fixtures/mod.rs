//! Shared fixtures for relsync integration tests.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use relsync::{
    ClassDefinition, ClientTransaction, InMemoryStore, MappingConfiguration, ObjectId,
    RelationDefinition, RelationEndPointId, TransactionConfig, TransactionId, TransactionListener,
    Value,
};

pub const ROOT: TransactionId = TransactionId::new(1);

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

pub fn orders_of(key: i64) -> RelationEndPointId {
    RelationEndPointId::new(customer(key), "orders")
}

pub fn customer_of(key: i64) -> RelationEndPointId {
    RelationEndPointId::new(order(key), "customer")
}

pub fn computer_of(key: i64) -> RelationEndPointId {
    RelationEndPointId::new(person(key), "computer")
}

pub fn owner_of(key: i64) -> RelationEndPointId {
    RelationEndPointId::new(computer(key), "owner")
}

pub fn mapping() -> Arc<MappingConfiguration> {
    let mapping = MappingConfiguration::builder()
        .class(ClassDefinition::new("Customer").property("name"))
        .class(ClassDefinition::new("Order").property("number"))
        .class(ClassDefinition::new("Person").property("name"))
        .class(ClassDefinition::new("Computer").property("serial"))
        .relation(RelationDefinition::one_to_many("Customer", "orders", "Order", "customer"))
        .relation(RelationDefinition::one_to_one("Person", "computer", "Computer", "owner"))
        .build()
        .expect("fixture mapping is valid");
    Arc::new(mapping)
}

/// Customers 1-3; orders 1 and 2 of customer 1, order 3 of customer 2;
/// persons 1-2; computer 1 owned by person 1.
pub fn shop() -> InMemoryStore {
    let mut store = InMemoryStore::new(mapping());
    for (key, name) in [(1, "Ada"), (2, "Grace"), (3, "Barbara")] {
        store
            .insert(customer(key), [("name".to_string(), Value::from(name))])
            .expect("customer row");
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
            .expect("order row");
    }
    for key in [1, 2] {
        store
            .insert(person(key), [("name".to_string(), Value::from(format!("P-{key}")))])
            .expect("person row");
    }
    store
        .insert(
            computer(1),
            [
                ("serial".to_string(), Value::from("SN-1")),
                ("owner".to_string(), Value::from(person(1))),
            ],
        )
        .expect("computer row");
    store
}

/// Records listener events as short strings; clones share the log.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().expect("recorder lock").clone()
    }

    pub fn contains(&self, event: &str) -> bool {
        self.events().iter().any(|recorded| recorded == event)
    }

    fn push(&self, event: String) {
        self.events.lock().expect("recorder lock").push(event);
    }
}

impl TransactionListener for Recorder {
    fn object_loaded(&self, transaction: TransactionId, object_id: &ObjectId) {
        self.push(format!("loaded {transaction} {object_id}"));
    }

    fn relation_end_point_loaded(&self, transaction: TransactionId, end_point: &RelationEndPointId) {
        self.push(format!("end-point loaded {transaction} {end_point}"));
    }

    fn relation_end_point_unloading(&self, transaction: TransactionId, end_point: &RelationEndPointId) {
        self.push(format!("end-point unloading {transaction} {end_point}"));
    }

    fn transaction_committed(&self, transaction: TransactionId) {
        self.push(format!("committed {transaction}"));
    }

    fn transaction_rolled_back(&self, transaction: TransactionId) {
        self.push(format!("rolled back {transaction}"));
    }

    fn sub_transaction_created(&self, parent: TransactionId, sub: TransactionId) {
        self.push(format!("created {sub} under {parent}"));
    }

    fn sub_transaction_discarded(&self, parent: TransactionId, sub: TransactionId) {
        self.push(format!("discarded {sub} under {parent}"));
    }
}

pub fn transaction() -> (ClientTransaction<InMemoryStore>, Recorder) {
    transaction_with(TransactionConfig::default())
}

pub fn transaction_with(config: TransactionConfig) -> (ClientTransaction<InMemoryStore>, Recorder) {
    let recorder = Recorder::default();
    let mut tx = ClientTransaction::with_config(shop(), mapping(), config);
    tx.add_listener(Box::new(recorder.clone()));
    (tx, recorder)
}
