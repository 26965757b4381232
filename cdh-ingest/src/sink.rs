use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use cdh_core::RawEvent;
use futures_util::FutureExt;
use tokio::sync::{Mutex, mpsc};

use crate::state::IngestState;

#[derive(Debug, thiserror::Error)]
#[error("sink failed: {0}")]
pub struct SinkError(pub Box<dyn std::error::Error + Send + Sync + 'static>);

impl SinkError {
    pub fn msg(message: impl Into<String>) -> Self {
        Self(message.into().into())
    }
}

/// Downstream consumer of accepted events.
///
/// Called at most once per event id, in feed order, never concurrently. A
/// failure affects only the event at hand.
#[async_trait]
pub trait EventSink: Send + 'static {
    async fn on_event(&mut self, event: RawEvent) -> Result<(), SinkError>;
}

/// Sink that only writes each event to the log.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn on_event(&mut self, event: RawEvent) -> Result<(), SinkError> {
        let event_dtm = event
            .payload
            .pointer("/Event/MessageData/EventDtm")
            .and_then(|v| v.as_str());

        tracing::info!(
            event_id = ?event.event_id,
            sequence = ?event.sequence,
            event_dtm,
            "Received event"
        );
        Ok(())
    }
}

/// Forwards events to an [`mpsc`] channel. Handy for embedding the client
/// in another task.
#[derive(Debug, Clone)]
pub struct ChannelSink(pub mpsc::Sender<RawEvent>);

#[async_trait]
impl EventSink for ChannelSink {
    async fn on_event(&mut self, event: RawEvent) -> Result<(), SinkError> {
        self.0
            .send(event)
            .await
            .map_err(|_| SinkError::msg("event receiver dropped"))
    }
}

/// Drains `rx` into `sink` until every sender is gone. A sink that returns
/// an error or panics loses only the event at hand.
pub(crate) async fn run_sink<K: EventSink>(
    mut sink: K,
    mut rx: mpsc::Receiver<RawEvent>,
    state: Arc<Mutex<IngestState>>,
) {
    while let Some(event) = rx.recv().await {
        let event_id = event.event_id.clone();
        match AssertUnwindSafe(sink.on_event(event)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(error = %e, event_id = ?event_id, "Sink failed to process event");
                state.lock().await.record_sink_error();
            }
            Err(_) => {
                tracing::error!(event_id = ?event_id, "Sink panicked while processing event");
                state.lock().await.record_sink_error();
            }
        }
    }

    tracing::debug!("Sink consumer finished");
}
