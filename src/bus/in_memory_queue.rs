//! In-memory broker for tests and single-process deployments.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use crate::error::PublishError;

use super::{BrokerMessage, Publisher, Subscriber};

/// Thread-safe in-memory broker implementing both `Publisher` and `Subscriber`.
///
/// Messages go to an append-only log. Each subscriber handle tracks its own
/// read position, so `new_subscriber()` gives an independent consumer of
/// the same stream. A nacked message is redelivered to the handle that
/// rejected it before any newer message.
///
/// ```
/// use sourced_outbox::bus::{BrokerMessage, InMemoryQueue, Publisher, Subscriber};
///
/// let queue = InMemoryQueue::new();
/// queue.publish(BrokerMessage::new("evt-1", "OrderCreated", b"{}".to_vec())).unwrap();
///
/// let message = queue.poll(100).unwrap().unwrap();
/// assert_eq!(message.event_type, "OrderCreated");
/// ```
#[derive(Clone)]
pub struct InMemoryQueue {
    log: Arc<RwLock<Vec<BrokerMessage>>>,
    offline: Arc<AtomicBool>,
    position: Arc<Mutex<usize>>,
    redeliver: Arc<Mutex<VecDeque<BrokerMessage>>>,
    acked: Arc<Mutex<Vec<String>>>,
    nacked: Arc<Mutex<Vec<(String, String)>>>,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<T>(_: PoisonError<T>) -> PublishError {
    PublishError::ConnectionFailed("in-memory queue lock poisoned".into())
}

fn read<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(PoisonError::into_inner)
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self {
            log: Arc::new(RwLock::new(Vec::new())),
            offline: Arc::new(AtomicBool::new(false)),
            position: Arc::new(Mutex::new(0)),
            redeliver: Arc::new(Mutex::new(VecDeque::new())),
            acked: Arc::new(Mutex::new(Vec::new())),
            nacked: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A handle sharing the same log with its own read position.
    pub fn new_subscriber(&self) -> Self {
        Self {
            log: Arc::clone(&self.log),
            offline: Arc::clone(&self.offline),
            position: Arc::new(Mutex::new(0)),
            redeliver: Arc::new(Mutex::new(VecDeque::new())),
            acked: Arc::new(Mutex::new(Vec::new())),
            nacked: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Make every handle refuse publishes with `ConnectionFailed`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn messages(&self) -> Vec<BrokerMessage> {
        self.log
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn event_types(&self) -> Vec<String> {
        self.messages().into_iter().map(|m| m.event_type).collect()
    }

    pub fn len(&self) -> usize {
        self.log.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids acknowledged through this handle.
    pub fn acknowledged(&self) -> Vec<String> {
        read(&self.acked).clone()
    }

    /// (id, reason) pairs rejected through this handle.
    pub fn rejected(&self) -> Vec<(String, String)> {
        read(&self.nacked).clone()
    }

    fn next_message(&self) -> Result<Option<BrokerMessage>, PublishError> {
        if let Some(message) = self.redeliver.lock().map_err(poisoned)?.pop_front() {
            return Ok(Some(message));
        }

        let log = self.log.read().map_err(poisoned)?;
        let mut pos = self.position.lock().map_err(poisoned)?;
        if *pos < log.len() {
            let message = log[*pos].clone();
            *pos += 1;
            return Ok(Some(message));
        }
        Ok(None)
    }
}

impl Publisher for InMemoryQueue {
    fn publish(&self, message: BrokerMessage) -> Result<(), PublishError> {
        self.publish_batch(vec![message])
    }

    fn publish_batch(&self, messages: Vec<BrokerMessage>) -> Result<(), PublishError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(PublishError::ConnectionFailed("in-memory queue is offline".into()));
        }
        self.log.write().map_err(poisoned)?.extend(messages);
        Ok(())
    }
}

impl Subscriber for InMemoryQueue {
    fn poll(&self, timeout_ms: u64) -> Result<Option<BrokerMessage>, PublishError> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);

        loop {
            if let Some(message) = self.next_message()? {
                return Ok(Some(message));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn ack(&self, message_id: &str) -> Result<(), PublishError> {
        self.acked.lock().map_err(poisoned)?.push(message_id.to_string());
        Ok(())
    }

    fn nack(&self, message_id: &str, reason: &str) -> Result<(), PublishError> {
        self.nacked
            .lock()
            .map_err(poisoned)?
            .push((message_id.to_string(), reason.to_string()));

        let message = self
            .log
            .read()
            .map_err(poisoned)?
            .iter()
            .find(|m| m.id == message_id)
            .cloned();
        if let Some(message) = message {
            self.redeliver.lock().map_err(poisoned)?.push_back(message);
        }
        Ok(())
    }
}
