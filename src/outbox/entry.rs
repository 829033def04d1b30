use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::{EventId, SerializedEvent};

/// Outcome of a delivery attempt, as stored in `processing_result`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingResult {
    /// Every handler succeeded (or there were none to run).
    Ok,
    /// Every handler failed, or the attempt was rejected outright.
    Failed,
    /// Some handlers succeeded and at least one failed.
    FailedPartially,
    /// The batch stayed in flight past the delivery timeout.
    DeliveryTimedOut,
}

impl ProcessingResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Failed => "FAILED",
            Self::FailedPartially => "FAILED_PARTIALLY",
            Self::DeliveryTimedOut => "DELIVERY_TIMED_OUT",
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl fmt::Display for ProcessingResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingResult {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OK" => Ok(Self::Ok),
            "FAILED" => Ok(Self::Failed),
            "FAILED_PARTIALLY" => Ok(Self::FailedPartially),
            "DELIVERY_TIMED_OUT" => Ok(Self::DeliveryTimedOut),
            other => Err(format!("unknown processing result: {}", other)),
        }
    }
}

/// Where an entry sits in its delivery lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    InFlight,
    Delivered,
    Failed,
    PartiallyDelivered,
    TimedOut,
}

impl DeliveryState {
    /// Terminal states are never picked up again without an operator re-publish.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::InFlight)
    }
}

/// Identifier stamped on every entry claimed by one fetch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(Uuid);

impl BatchId {
    pub fn new() -> Self {
        BatchId(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(BatchId)
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One row of the outbox table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: EventId,
    pub domain_event: SerializedEvent,
    pub inserted: DateTime<Utc>,
    pub batch_id: Option<BatchId>,
    pub processing_result: Option<ProcessingResult>,
    pub delivery_started: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    /// A fresh, unclaimed entry.
    pub fn new(domain_event: SerializedEvent, inserted: DateTime<Utc>) -> Self {
        Self {
            id: EventId::new(),
            domain_event,
            inserted,
            batch_id: None,
            processing_result: None,
            delivery_started: None,
        }
    }

    pub fn event_type(&self) -> &str {
        &self.domain_event.event_type
    }

    pub fn state(&self) -> DeliveryState {
        match self.processing_result {
            Some(ProcessingResult::Ok) => DeliveryState::Delivered,
            Some(ProcessingResult::Failed) => DeliveryState::Failed,
            Some(ProcessingResult::FailedPartially) => DeliveryState::PartiallyDelivered,
            Some(ProcessingResult::DeliveryTimedOut) => DeliveryState::TimedOut,
            None if self.batch_id.is_some() => DeliveryState::InFlight,
            None => DeliveryState::Pending,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state() == DeliveryState::Pending
    }

    pub fn is_in_flight(&self) -> bool {
        self.state() == DeliveryState::InFlight
    }

    /// Whether a result write-back may still land on this entry.
    ///
    /// A late result replaces a timeout classification; any other result is final.
    pub(crate) fn accepts_result(&self) -> bool {
        matches!(
            self.processing_result,
            None | Some(ProcessingResult::DeliveryTimedOut)
        )
    }

    /// Whether an operator may put the entry back into the pending state.
    pub fn can_republish(&self) -> bool {
        matches!(
            self.processing_result,
            Some(ProcessingResult::Failed)
                | Some(ProcessingResult::FailedPartially)
                | Some(ProcessingResult::DeliveryTimedOut)
        )
    }

    pub(crate) fn claim(&mut self, batch_id: BatchId, now: DateTime<Utc>) {
        self.batch_id = Some(batch_id);
        self.delivery_started = Some(now);
    }

    pub(crate) fn reset_to_pending(&mut self) {
        self.batch_id = None;
        self.delivery_started = None;
        self.processing_result = None;
    }
}

/// Entries claimed together by one fetch, in delivery order.
#[derive(Clone, Debug, PartialEq)]
pub struct Batch {
    pub id: BatchId,
    pub entries: Vec<OutboxEntry>,
}

impl Batch {
    pub fn new(id: BatchId, entries: Vec<OutboxEntry>) -> Self {
        Self { id, entries }
    }

    pub fn empty() -> Self {
        Self::new(BatchId::new(), Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn event_ids(&self) -> Vec<EventId> {
        self.entries.iter().map(|e| e.id).collect()
    }

    /// A batch with the same id holding only the entries that match.
    pub fn subset<F>(&self, mut keep: F) -> Batch
    where
        F: FnMut(&OutboxEntry) -> bool,
    {
        Batch::new(
            self.id,
            self.entries.iter().filter(|e| keep(e)).cloned().collect(),
        )
    }
}
