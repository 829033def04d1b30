//! Explicit handler registry.
//!
//! Handlers are bound to event type names at startup. The dispatcher asks
//! the registry for the bindings of each delivered event; nothing is
//! discovered at runtime.
//!
//! ```ignore
//! let mut registry = HandlerRegistry::<SqliteTransaction>::new();
//! registry
//!     .on::<OrderPlaced, _>("billing", |event, tx| {
//!         let conn = tx.connection();
//!         conn.execute("INSERT INTO invoices (order_id) VALUES (?1)", [&event.order_id])?;
//!         Ok(())
//!     })?
//!     .on::<OrderPlaced, _>("shipping", |event, tx| schedule_shipment(tx, event))?;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{HandlerError, RegistrationError};
use crate::event::{DomainEvent, EventId, SerializedEvent};
use crate::serializer::{EventSerializer, JsonSerializer};

/// One event as seen by a handler.
#[derive(Clone, Copy, Debug)]
pub struct Delivery<'a> {
    pub event_id: EventId,
    pub event: &'a SerializedEvent,
}

impl<'a> Delivery<'a> {
    pub fn new(event_id: EventId, event: &'a SerializedEvent) -> Self {
        Self { event_id, event }
    }

    pub fn event_type(&self) -> &str {
        &self.event.event_type
    }
}

/// Type-erased handler body. It runs inside the transaction it is given.
pub type HandlerFn<Tx> =
    Arc<dyn Fn(&Delivery<'_>, &mut Tx) -> Result<(), HandlerError> + Send + Sync>;

/// A handler bound to an event type.
pub struct HandlerBinding<Tx> {
    pub handler_id: String,
    handler: HandlerFn<Tx>,
}

impl<Tx> HandlerBinding<Tx> {
    pub fn new(handler_id: impl Into<String>, handler: HandlerFn<Tx>) -> Self {
        Self {
            handler_id: handler_id.into(),
            handler,
        }
    }

    pub fn call(&self, delivery: &Delivery<'_>, tx: &mut Tx) -> Result<(), HandlerError> {
        (self.handler)(delivery, tx)
    }
}

impl<Tx> Clone for HandlerBinding<Tx> {
    fn clone(&self) -> Self {
        Self {
            handler_id: self.handler_id.clone(),
            handler: Arc::clone(&self.handler),
        }
    }
}

impl<Tx> fmt::Debug for HandlerBinding<Tx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerBinding")
            .field("handler_id", &self.handler_id)
            .finish_non_exhaustive()
    }
}

/// The handlers that should receive one event type.
#[derive(Debug)]
pub struct ExecutionContext<Tx> {
    pub event_type: String,
    pub handlers: Vec<HandlerBinding<Tx>>,
    /// Whether delivering the event to no handler at all counts as a failure.
    pub aggregate_scoped: bool,
}

impl<Tx> ExecutionContext<Tx> {
    pub fn empty(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            handlers: Vec::new(),
            aggregate_scoped: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Resolves the handlers for an event type.
pub trait ExecutionContextDetector<Tx>: Send + Sync {
    fn detect(&self, event_type: &str) -> ExecutionContext<Tx>;
}

struct Registration<Tx> {
    handlers: Vec<HandlerBinding<Tx>>,
    aggregate_scoped: bool,
}

impl<Tx> Default for Registration<Tx> {
    fn default() -> Self {
        Self {
            handlers: Vec::new(),
            aggregate_scoped: false,
        }
    }
}

/// Handlers keyed by event type name, kept in registration order.
///
/// Typed handlers decode the payload with the registry's serializer, which
/// must match the one events were published with.
pub struct HandlerRegistry<Tx, Z = JsonSerializer> {
    serializer: Arc<Z>,
    registrations: HashMap<String, Registration<Tx>>,
}

impl<Tx> HandlerRegistry<Tx, JsonSerializer>
where
    Tx: 'static,
{
    pub fn new() -> Self {
        Self::with_serializer(JsonSerializer)
    }
}

impl<Tx> Default for HandlerRegistry<Tx, JsonSerializer>
where
    Tx: 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<Tx, Z> HandlerRegistry<Tx, Z>
where
    Tx: 'static,
    Z: EventSerializer,
{
    pub fn with_serializer(serializer: Z) -> Self {
        Self {
            serializer: Arc::new(serializer),
            registrations: HashMap::new(),
        }
    }

    /// Bind a typed handler to `E`.
    pub fn on<E, F>(&mut self, handler_id: &str, handler: F) -> Result<&mut Self, RegistrationError>
    where
        E: DomainEvent,
        F: Fn(&E, &mut Tx) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let serializer = Arc::clone(&self.serializer);
        let body: HandlerFn<Tx> = Arc::new(move |delivery: &Delivery<'_>, tx: &mut Tx| {
            let event: E = delivery.event.decode(serializer.as_ref())?;
            handler(&event, tx)
        });

        self.declare::<E>();
        self.bind(E::EVENT_TYPE, HandlerBinding::new(handler_id, body))
    }

    /// Bind a handler that receives the raw delivery, for events with no Rust type.
    pub fn on_raw<F>(
        &mut self,
        event_type: &str,
        handler_id: &str,
        handler: F,
    ) -> Result<&mut Self, RegistrationError>
    where
        F: Fn(&Delivery<'_>, &mut Tx) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.bind(event_type, HandlerBinding::new(handler_id, Arc::new(handler)))
    }

    /// Make `E` known without binding a handler, so its scope is honored
    /// even when nothing listens to it.
    pub fn declare<E: DomainEvent>(&mut self) -> &mut Self {
        let registration = self
            .registrations
            .entry(E::EVENT_TYPE.to_string())
            .or_default();
        registration.aggregate_scoped |= E::AGGREGATE_SCOPED;
        self
    }

    fn bind(
        &mut self,
        event_type: &str,
        binding: HandlerBinding<Tx>,
    ) -> Result<&mut Self, RegistrationError> {
        let registration = self.registrations.entry(event_type.to_string()).or_default();
        if registration
            .handlers
            .iter()
            .any(|existing| existing.handler_id == binding.handler_id)
        {
            return Err(RegistrationError::DuplicateHandler {
                event_type: event_type.to_string(),
                handler_id: binding.handler_id,
            });
        }
        registration.handlers.push(binding);
        Ok(self)
    }

    /// Handler ids bound to `event_type`, in registration order.
    pub fn handler_ids(&self, event_type: &str) -> Vec<&str> {
        self.registrations
            .get(event_type)
            .map(|r| r.handlers.iter().map(|h| h.handler_id.as_str()).collect())
            .unwrap_or_default()
    }

    pub fn event_types(&self) -> Vec<&str> {
        self.registrations.keys().map(|s| s.as_str()).collect()
    }
}

impl<Tx, Z> ExecutionContextDetector<Tx> for HandlerRegistry<Tx, Z>
where
    Tx: 'static,
    Z: EventSerializer,
{
    fn detect(&self, event_type: &str) -> ExecutionContext<Tx> {
        match self.registrations.get(event_type) {
            Some(registration) => ExecutionContext {
                event_type: event_type.to_string(),
                handlers: registration.handlers.clone(),
                aggregate_scoped: registration.aggregate_scoped,
            },
            None => ExecutionContext::empty(event_type),
        }
    }
}
