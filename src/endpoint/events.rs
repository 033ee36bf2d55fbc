//! Event publication.
//!
//! Endpoints declare events as data-driven mappings applied to the validated
//! handler output; the pipeline publishes them only when the final response
//! status is in the success range. Publishers implement the narrow
//! [`EventPublisher`] contract; two ship with the crate: a no-op publisher
//! that logs, and a buffered publisher that batches messages to a sink from
//! a background task.

use crate::context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::registry::{ResolvedServices, ServiceDescriptor};
use crate::tools::system;

const EVENT_BUFFER_SIZE: usize = 8192;
const EVENT_FLUSH_INTERVAL_SECONDS: u64 = 15;
const AUTOMATIC_FLUSH_SIZE: usize = 64;

/// One published event.
#[derive(Debug, Clone, Serialize)]
pub struct EventMessage {
    pub event_type: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    /// Id of the request that produced the event, when one was bound.
    pub request_id: Option<String>,
}

/// Where events go.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, messages: &[EventMessage]) -> anyhow::Result<()>;

    /// Flushes buffered messages and releases resources.
    async fn close(&self) -> anyhow::Result<()>;
}

/// Descriptor for an event publisher registered in the service registry.
pub type EventPublisherDescriptor = ServiceDescriptor<Arc<dyn EventPublisher>>;

/// Retrieves the publisher a resolved descriptor points at.
pub fn resolve_event_publisher(
    services: &ResolvedServices,
    descriptor: &EventPublisherDescriptor,
) -> anyhow::Result<Arc<dyn EventPublisher>> {
    Ok(services.get(descriptor)?.as_ref().clone())
}

/// A data-driven event rule applied to the handler output.
#[derive(Clone)]
pub struct EventMapping {
    event_type: &'static str,
    payload: Arc<dyn Fn(&Value) -> Value + Send + Sync>,
}

impl EventMapping {
    pub fn new(
        event_type: &'static str,
        payload: impl Fn(&Value) -> Value + Send + Sync + 'static,
    ) -> Self {
        EventMapping {
            event_type,
            payload: Arc::new(payload),
        }
    }

    pub(crate) fn evaluate(&self, output: &Value) -> EventMessage {
        EventMessage {
            event_type: self.event_type.to_string(),
            payload: (self.payload)(output),
            timestamp: Utc::now(),
            request_id: context::request_id().ok(),
        }
    }
}

/// Evaluates every mapping against the output, in declaration order.
pub(crate) fn evaluate_event_mappings(mappings: &[EventMapping], output: &Value) -> Vec<EventMessage> {
    mappings.iter().map(|mapping| mapping.evaluate(output)).collect()
}

/// Publisher that logs events at debug level and drops them.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(&self, messages: &[EventMessage]) -> anyhow::Result<()> {
        for message in messages {
            match serde_json::to_string(message) {
                Ok(json) => tracing::debug!("Received an event of type {}: {}", message.event_type, json),
                Err(err) => tracing::error!(
                    "Failed to serialize event of type {}: {:#}",
                    message.event_type,
                    err
                ),
            }
        }
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Destination of a [`BufferedEventPublisher`] batch.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send_batch(&self, batch: Vec<EventMessage>) -> anyhow::Result<()>;
}

/// Publisher that buffers messages and flushes batches to a sink from a
/// background task, either when the buffer fills up or on a fixed interval.
///
/// `close` drains the buffer and waits for the background task to finish.
pub struct BufferedEventPublisher {
    tx: Mutex<Option<mpsc::Sender<EventMessage>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BufferedEventPublisher {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        let (tx, rx) = mpsc::channel::<EventMessage>(EVENT_BUFFER_SIZE);
        let worker = tokio::spawn(async move {
            run_background_loop(sink, rx).await;
        });

        BufferedEventPublisher {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        }
    }
}

async fn run_background_loop(sink: Arc<dyn EventSink>, mut rx: mpsc::Receiver<EventMessage>) {
    let mut buffer = Vec::new();
    let mut interval = tokio::time::interval(Duration::from_secs(EVENT_FLUSH_INTERVAL_SECONDS));

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(message) => {
                    buffer.push(message);
                    if buffer.len() >= AUTOMATIC_FLUSH_SIZE {
                        flush_batch(sink.as_ref(), &mut buffer).await;
                    }
                }
                // Channel closed, flush remaining events below.
                None => break,
            },
            _ = interval.tick() => {
                flush_batch(sink.as_ref(), &mut buffer).await;
            }
        }

        if !system::is_running() {
            break;
        }
    }

    flush_batch(sink.as_ref(), &mut buffer).await;
}

#[tracing::instrument(level = "debug", skip_all)]
async fn flush_batch(sink: &dyn EventSink, buffer: &mut Vec<EventMessage>) {
    if buffer.is_empty() {
        return;
    }

    let batch: Vec<EventMessage> = buffer.drain(..).collect();
    if let Err(err) = sink.send_batch(batch).await {
        tracing::error!(?err, "Failed to send batch of events to the sink");
    }
}

#[async_trait]
impl EventPublisher for BufferedEventPublisher {
    async fn publish(&self, messages: &[EventMessage]) -> anyhow::Result<()> {
        let tx = self
            .tx
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("Event publisher is closed"))?;

        for message in messages {
            tx.send(message.clone())
                .await
                .map_err(|_| anyhow::anyhow!("Event publisher worker has stopped"))?;
        }

        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        // Dropping the sender closes the channel; the worker drains and exits.
        self.tx.lock().unwrap().take();

        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            worker.await.ok();
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CollectingSink {
        batches: Mutex<Vec<Vec<EventMessage>>>,
        total: AtomicUsize,
    }

    #[async_trait]
    impl EventSink for Arc<CollectingSink> {
        async fn send_batch(&self, batch: Vec<EventMessage>) -> anyhow::Result<()> {
            self.total.fetch_add(batch.len(), Ordering::SeqCst);
            self.batches.lock().unwrap().push(batch);
            Ok(())
        }
    }

    fn message(event_type: &str) -> EventMessage {
        EventMessage {
            event_type: event_type.to_string(),
            payload: json!({}),
            timestamp: Utc::now(),
            request_id: None,
        }
    }

    #[test]
    fn mapping_applies_the_payload_function_to_the_output() {
        let mapping = EventMapping::new("user.created", |out| json!({"userId": out["id"]}));
        let evaluated = mapping.evaluate(&json!({"id": 7}));
        assert_eq!(evaluated.event_type, "user.created");
        assert_eq!(evaluated.payload, json!({"userId": 7}));
    }

    #[tokio::test]
    async fn close_flushes_everything_that_was_published() {
        let sink = Arc::new(CollectingSink::default());
        let publisher = BufferedEventPublisher::new(Arc::new(sink.clone()));

        publisher
            .publish(&[message("a"), message("b"), message("c")])
            .await
            .unwrap();
        publisher.close().await.unwrap();

        assert_eq!(sink.total.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn publishing_after_close_is_an_error() {
        let sink = Arc::new(CollectingSink::default());
        let publisher = BufferedEventPublisher::new(Arc::new(sink.clone()));

        publisher.close().await.unwrap();
        assert!(publisher.publish(&[message("late")]).await.is_err());
    }

    #[tokio::test]
    async fn a_full_buffer_flushes_without_waiting_for_the_interval() {
        let sink = Arc::new(CollectingSink::default());
        let publisher = BufferedEventPublisher::new(Arc::new(sink.clone()));

        let burst: Vec<EventMessage> = (0..AUTOMATIC_FLUSH_SIZE).map(|_| message("burst")).collect();
        publisher.publish(&burst).await.unwrap();

        // Give the worker a chance to run; the size trigger must fire well
        // before the 15s interval.
        for _ in 0..100 {
            if sink.total.load(Ordering::SeqCst) >= AUTOMATIC_FLUSH_SIZE {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(sink.total.load(Ordering::SeqCst), AUTOMATIC_FLUSH_SIZE);

        publisher.close().await.unwrap();
    }
}
