//! Handler resolution and execution.
//!
//! ```text
//! Batch ──▶ Dispatcher ──detect──▶ ExecutionContextDetector (HandlerRegistry)
//!               │
//!               ├──invoke──▶ HandlerInvoker (TransactionalInvoker | IdempotencyGuard)
//!               │               one transaction per handler
//!               ▼
//!          OutboxStore: sent_successfully / mark_failed_in_batch
//! ```

mod dispatcher;
mod idempotency;
mod invoker;
mod registry;

pub use dispatcher::{aggregate_result, BatchReport, Dispatcher, EventReport};
pub use idempotency::IdempotencyGuard;
pub use invoker::{HandlerInvoker, HandlerOutcome, TransactionalInvoker};
pub use registry::{
    Delivery, ExecutionContext, ExecutionContextDetector, HandlerBinding, HandlerFn,
    HandlerRegistry,
};
