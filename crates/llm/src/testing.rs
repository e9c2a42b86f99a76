//! Scripted in-process provider used by tests in this and downstream crates.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use rig::completion::CompletionError;
use tokio::sync::Notify;

use super::provider::{
    BoxFuture, LlmProvider, ProviderError, ProviderRequest, ProviderResult, ProviderStreamHandle,
    ProviderWorker, StreamEventPayload, make_event_stream,
};

pub const SCRIPTED_PROVIDER_ID: &str = "scripted";

/// Replays a fixed event script for every stream, optionally parking on a gate part way through.
pub struct ScriptedProvider {
    events: Vec<StreamEventPayload>,
    gate: Option<(usize, Arc<Notify>)>,
    stream_calls: AtomicUsize,
    complete_calls: AtomicUsize,
    last_request: Mutex<Option<ProviderRequest>>,
}

impl ScriptedProvider {
    pub fn with_events(events: impl IntoIterator<Item = StreamEventPayload>) -> Self {
        Self {
            events: events.into_iter().collect(),
            gate: None,
            stream_calls: AtomicUsize::new(0),
            complete_calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        }
    }

    /// Streams each delta in order, then `Done`.
    pub fn replying<I, S>(deltas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let events = deltas
            .into_iter()
            .map(|delta| StreamEventPayload::Delta(delta.into()))
            .chain(std::iter::once(StreamEventPayload::Done));
        Self::with_events(events)
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_events([StreamEventPayload::Error(message.into())])
    }

    /// Emits the first `after` events, then waits for `gate` before emitting the rest.
    pub fn gated(mut self, after: usize, gate: Arc<Notify>) -> Self {
        self.gate = Some((after, gate));
        self
    }

    pub fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }

    pub fn complete_calls(&self) -> usize {
        self.complete_calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<ProviderRequest> {
        self.last_request
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, request: &ProviderRequest) {
        *self
            .last_request
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(request.clone());
    }
}

impl LlmProvider for ScriptedProvider {
    fn id(&self) -> &str {
        SCRIPTED_PROVIDER_ID
    }

    fn name(&self) -> &str {
        "Scripted"
    }

    fn default_model(&self) -> &str {
        "scripted-model"
    }

    fn accepts_media_type(&self, media_type: &str) -> bool {
        media_type.starts_with("image/")
            || media_type.starts_with("audio/")
            || media_type.starts_with("text/")
            || media_type == "application/pdf"
    }

    fn complete<'a>(&'a self, request: ProviderRequest) -> BoxFuture<'a, ProviderResult<String>> {
        Box::pin(async move {
            self.complete_calls.fetch_add(1, Ordering::SeqCst);
            self.record(&request);
            if request.is_empty() {
                return Err(ProviderError::EmptyRequest { stage: "complete" });
            }

            let mut text = String::new();
            for event in &self.events {
                match event {
                    StreamEventPayload::Delta(delta) => text.push_str(delta),
                    StreamEventPayload::ChunkError(_) => {}
                    StreamEventPayload::Done => return Ok(text),
                    StreamEventPayload::Error(message) => {
                        return Err(ProviderError::CompletionsFailed {
                            stage: "complete",
                            source: CompletionError::ProviderError(message.clone()),
                        });
                    }
                }
            }
            Ok(text)
        })
    }

    fn stream_chat(&self, request: ProviderRequest) -> ProviderResult<ProviderStreamHandle> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        self.record(&request);
        if request.is_empty() {
            return Err(ProviderError::EmptyRequest {
                stage: "stream-chat",
            });
        }

        let (event_tx, stream, mut cancel_rx) = make_event_stream();
        let events = self.events.clone();
        let gate = self.gate.clone();

        let worker: ProviderWorker = Box::pin(async move {
            for (index, event) in events.into_iter().enumerate() {
                if let Some((after, gate)) = &gate
                    && index == *after
                {
                    tokio::select! {
                        _ = &mut cancel_rx => return,
                        _ = gate.notified() => {}
                    }
                }
                if event_tx.send(event).is_err() {
                    return;
                }
                tokio::task::yield_now().await;
            }
        });

        Ok(ProviderStreamHandle { stream, worker })
    }
}
