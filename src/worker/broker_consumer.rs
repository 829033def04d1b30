//! Consume side of broker channels.

use std::sync::mpsc::{channel, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::bus::Subscriber;
use crate::dispatch::Dispatcher;
use crate::outbox::OutboxStore;

/// Counters from a stopped consumer.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Messages whose handlers all succeeded (acked).
    pub messages_handled: usize,
    /// Messages with at least one failed handler (nacked).
    pub messages_failed: usize,
    /// Poll cycles completed.
    pub polls: usize,
}

/// A background thread that polls a broker subscriber and hands each
/// message to the dispatcher.
///
/// A message is acked when its result is `OK` and nacked otherwise, leaving
/// redelivery to the broker. Pair it with an idempotent dispatcher so
/// redelivered messages do not repeat handlers that already succeeded.
pub struct BrokerConsumer {
    channel: String,
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<ConsumerStats>>,
}

impl BrokerConsumer {
    /// `receive_timeout` bounds each poll and so how quickly `stop` is noticed.
    pub fn spawn<S>(
        channel_name: &str,
        subscriber: Arc<dyn Subscriber>,
        dispatcher: Dispatcher<S>,
        receive_timeout: Duration,
    ) -> std::io::Result<Self>
    where
        S: OutboxStore + 'static,
    {
        let (stop_tx, stop_rx) = channel();
        let name = channel_name.to_string();
        let timeout_ms = u64::try_from(receive_timeout.as_millis()).unwrap_or(u64::MAX);

        let handle = thread::Builder::new()
            .name(format!("broker-consumer-{}", channel_name))
            .spawn(move || {
                let mut stats = ConsumerStats::default();

                loop {
                    match stop_rx.try_recv() {
                        Ok(()) | Err(TryRecvError::Disconnected) => break,
                        Err(TryRecvError::Empty) => {}
                    }

                    stats.polls += 1;

                    let message = match subscriber.poll(timeout_ms) {
                        Ok(Some(message)) => message,
                        Ok(None) => continue,
                        Err(err) => {
                            warn!(channel = %name, error = %err, "Broker poll failed");
                            thread::sleep(receive_timeout);
                            continue;
                        }
                    };

                    let report = dispatcher
                        .dispatch_event(message.event_id(), &message.to_serialized_event());

                    let acknowledged = if report.result.is_ok() {
                        stats.messages_handled += 1;
                        subscriber.ack(&message.id)
                    } else {
                        stats.messages_failed += 1;
                        let reason = format!(
                            "{}: failed handlers {}",
                            report.result,
                            report.failed_handlers().join(", ")
                        );
                        subscriber.nack(&message.id, &reason)
                    };

                    match acknowledged {
                        Ok(()) => debug!(
                            channel = %name,
                            message_id = %message.id,
                            result = %report.result,
                            "Broker message processed"
                        ),
                        Err(err) => warn!(
                            channel = %name,
                            message_id = %message.id,
                            error = %err,
                            "Broker acknowledgement failed"
                        ),
                    }
                }

                stats
            })?;

        Ok(Self {
            channel: channel_name.to_string(),
            stop_tx,
            handle: Some(handle),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Stop consuming and wait for the message in hand to finish.
    pub fn stop(mut self) -> ConsumerStats {
        let _ = self.stop_tx.send(());
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or_default(),
            None => ConsumerStats::default(),
        }
    }

    /// Signal the consumer to stop without waiting.
    pub fn signal_stop(&self) {
        let _ = self.stop_tx.send(());
    }
}

impl Drop for BrokerConsumer {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
    }
}
