//! A small application wired to the outbox: one event type received by a
//! handler per layer, with receipts recorded only when the handler's
//! transaction commits.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use sourced_outbox::{
    Channel, ChannelRouter, DomainEvent, EventPublisher, HandlerError, HandlerRegistry,
    InMemoryOutboxStore, MemoryTransaction, OutboxChannel, TransactionContext,
};

pub const REPOSITORY: &str = "repository";
pub const APPLICATION_SERVICE: &str = "application-service";
pub const DOMAIN_SERVICE: &str = "domain-service";
pub const OUTBOUND_SERVICE: &str = "outbound-service";
pub const QUERY_CLIENT: &str = "query-client";

pub const LAYERS: [&str; 5] = [
    REPOSITORY,
    APPLICATION_SERVICE,
    DOMAIN_SERVICE,
    OUTBOUND_SERVICE,
    QUERY_CLIENT,
];

/// Name that makes the domain-service handler fail after doing its work.
pub const DOMAIN_SERVICE_ROLLBACK: &str = "TestDomainServiceRollback";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ADomainEvent {
    pub name: String,
}

impl ADomainEvent {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

impl DomainEvent for ADomainEvent {
    const EVENT_TYPE: &'static str = "ADomainEvent";
}

/// Published but listened to by nobody.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnreceivedDomainEvent {
    pub name: String,
}

impl DomainEvent for UnreceivedDomainEvent {
    const EVENT_TYPE: &'static str = "UnreceivedDomainEvent";
}

/// Expected to reach an aggregate handler; nothing is registered for it here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateClosed {
    pub aggregate_id: String,
}

impl DomainEvent for AggregateClosed {
    const EVENT_TYPE: &'static str = "AggregateClosed";
    const AGGREGATE_SCOPED: bool = true;
}

/// Every handler for this event rejects it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedEverywhere {
    pub reason: String,
}

impl DomainEvent for RejectedEverywhere {
    const EVENT_TYPE: &'static str = "RejectedEverywhere";
}

/// (handler id, event name) pairs committed by handlers.
#[derive(Clone, Default)]
pub struct Receipts {
    inner: Arc<Mutex<Vec<(String, String)>>>,
}

impl Receipts {
    /// Record a receipt that becomes visible only if `tx` commits.
    pub fn record(&self, tx: &mut MemoryTransaction, handler: &str, name: &str) {
        let inner = Arc::clone(&self.inner);
        let receipt = (handler.to_string(), name.to_string());
        tx.on_commit(Box::new(move || inner.lock().unwrap().push(receipt)));
    }

    pub fn handlers_for(&self, name: &str) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, n)| n == name)
            .map(|(h, _)| h.clone())
            .collect()
    }

    pub fn count(&self, handler: &str, name: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .filter(|(h, n)| h == handler && n == name)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}

/// Test application state shared with the handlers.
#[derive(Clone)]
pub struct App {
    pub store: Arc<InMemoryOutboxStore>,
    pub receipts: Receipts,
    /// While set, the domain-service handler fails for `DOMAIN_SERVICE_ROLLBACK`.
    pub domain_service_fails: Arc<AtomicBool>,
}

impl App {
    pub fn new() -> Self {
        Self::with_store(InMemoryOutboxStore::new())
    }

    pub fn with_store(store: InMemoryOutboxStore) -> Self {
        Self {
            store: Arc::new(store),
            receipts: Receipts::default(),
            domain_service_fails: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn heal_domain_service(&self) {
        self.domain_service_fails.store(false, Ordering::SeqCst);
    }

    pub fn registry(&self) -> HandlerRegistry<MemoryTransaction> {
        let mut registry = HandlerRegistry::new();

        for layer in LAYERS {
            let receipts = self.receipts.clone();
            let fails = Arc::clone(&self.domain_service_fails);
            registry
                .on::<ADomainEvent, _>(layer, move |event, tx| {
                    receipts.record(tx, layer, &event.name);
                    if layer == DOMAIN_SERVICE
                        && event.name == DOMAIN_SERVICE_ROLLBACK
                        && fails.load(Ordering::SeqCst)
                    {
                        return Err(HandlerError::Rejected("domain rule violated".into()));
                    }
                    Ok(())
                })
                .unwrap();
        }

        for layer in [REPOSITORY, QUERY_CLIENT] {
            registry
                .on::<RejectedEverywhere, _>(layer, |event, _| {
                    Err(HandlerError::Rejected(event.reason.clone()))
                })
                .unwrap();
        }

        registry.declare::<AggregateClosed>();
        registry
    }

    pub fn publisher(&self) -> EventPublisher<MemoryTransaction> {
        let router = ChannelRouter::builder()
            .channel(Channel::outbox(
                "outbox",
                OutboxChannel::new(Arc::clone(&self.store)),
            ))
            .default_channel("outbox")
            .build()
            .unwrap();
        EventPublisher::new(Arc::new(router))
    }
}
