//! Model Client Adapter: one capability surface over plain, streaming and multi-modal calls.
//!
//! Backends speak in text deltas over [`ProviderEventStream`]. The adapter turns that into a
//! [`CompletionStream`] of cumulative text so consumers only ever hold "the text so far".

use std::sync::Arc;

use snafu::{ResultExt, Snafu};
use tokio::task::JoinHandle;

use super::attachment::{Attachment, AttachmentError, AttachmentInfo, convert_attachments};
use super::model::GenerationOptions;
use super::provider::{
    LlmProvider, ProviderError, ProviderEventStream, ProviderRequest, StreamEventPayload,
};

pub type ModelResult<T> = Result<T, ModelError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ModelError {
    #[snafu(display("model request failed on `{stage}`: {source}"))]
    Request {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("model stream reported an error: {message}"))]
    Stream {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("model stream ended before a terminal event"))]
    StreamEndedEarly { stage: &'static str },
}

#[derive(Debug)]
pub enum CompletionEvent {
    /// Cumulative text received so far, never a delta.
    Partial(String),
    Completed(String),
    Failed(ModelError),
}

enum StreamSource {
    Live {
        events: ProviderEventStream,
        worker: JoinHandle<()>,
    },
    Rejected(Option<ModelError>),
}

/// Lazy, finite, non-restartable sequence of cumulative-text increments.
///
/// Dropping the stream cancels the backend worker.
pub struct CompletionStream {
    source: StreamSource,
    text: String,
    finished: bool,
    skipped_chunks: usize,
}

impl CompletionStream {
    fn live(events: ProviderEventStream, worker: JoinHandle<()>) -> Self {
        Self {
            source: StreamSource::Live { events, worker },
            text: String::new(),
            finished: false,
            skipped_chunks: 0,
        }
    }

    fn rejected(error: ModelError) -> Self {
        Self {
            source: StreamSource::Rejected(Some(error)),
            text: String::new(),
            finished: false,
            skipped_chunks: 0,
        }
    }

    pub fn skipped_chunks(&self) -> usize {
        self.skipped_chunks
    }

    pub async fn next(&mut self) -> Option<CompletionEvent> {
        if self.finished {
            return None;
        }

        let events = match &mut self.source {
            StreamSource::Rejected(error) => {
                self.finished = true;
                return error.take().map(CompletionEvent::Failed);
            }
            StreamSource::Live { events, .. } => events,
        };

        loop {
            let Some(payload) = events.recv().await else {
                self.finished = true;
                return Some(CompletionEvent::Failed(ModelError::StreamEndedEarly {
                    stage: "stream-recv",
                }));
            };

            match payload {
                StreamEventPayload::Delta(delta) => {
                    if delta.is_empty() {
                        continue;
                    }
                    self.text.push_str(&delta);
                    return Some(CompletionEvent::Partial(self.text.clone()));
                }
                StreamEventPayload::ChunkError(message) => {
                    self.skipped_chunks += 1;
                    tracing::warn!(
                        error = %message,
                        skipped_chunks = self.skipped_chunks,
                        "skipping malformed stream chunk"
                    );
                }
                StreamEventPayload::Done => {
                    self.finished = true;
                    return Some(CompletionEvent::Completed(std::mem::take(&mut self.text)));
                }
                StreamEventPayload::Error(message) => {
                    self.finished = true;
                    return Some(CompletionEvent::Failed(ModelError::Stream {
                        stage: "stream-event",
                        message,
                    }));
                }
            }
        }
    }

    /// Drains the stream, handing every cumulative text to `on_chunk`, and returns the final text.
    pub async fn collect_with(mut self, mut on_chunk: impl FnMut(&str)) -> ModelResult<String> {
        while let Some(event) = self.next().await {
            match event {
                CompletionEvent::Partial(text) => on_chunk(&text),
                CompletionEvent::Completed(text) => return Ok(text),
                CompletionEvent::Failed(error) => return Err(error),
            }
        }

        StreamEndedEarlySnafu {
            stage: "collect-stream",
        }
        .fail()
    }
}

impl Drop for CompletionStream {
    fn drop(&mut self) {
        if let StreamSource::Live { events, worker } = &mut self.source {
            events.cancel();
            if !self.finished {
                worker.abort();
            }
        }
    }
}

/// Streaming multi-modal call plus the per-attachment conversion report.
pub struct MultimodalRequest {
    pub stream: CompletionStream,
    pub accepted: Vec<AttachmentInfo>,
    pub rejected: Vec<AttachmentError>,
}

/// Explicitly constructed client; no process-wide state.
#[derive(Clone)]
pub struct ModelClient {
    provider: Arc<dyn LlmProvider>,
    options: GenerationOptions,
}

impl ModelClient {
    pub fn new(provider: Arc<dyn LlmProvider>, options: GenerationOptions) -> Self {
        Self { provider, options }
    }

    pub fn provider(&self) -> &dyn LlmProvider {
        self.provider.as_ref()
    }

    pub fn options(&self) -> &GenerationOptions {
        &self.options
    }

    fn request(&self, prompt: &str) -> ProviderRequest {
        let mut request = ProviderRequest::new(self.options.model_id.clone(), prompt);
        if let Some(instruction) = &self.options.system_instruction {
            request = request.with_system_instruction(instruction.clone());
        }
        if let Some(temperature) = self.options.temperature {
            request = request.with_temperature(temperature);
        }
        if let Some(max_output_tokens) = self.options.max_output_tokens {
            request = request.with_max_output_tokens(max_output_tokens);
        }
        if let Some(top_k) = self.options.top_k {
            request = request.with_top_k(top_k);
        }
        if let Some(top_p) = self.options.top_p {
            request = request.with_top_p(top_p);
        }
        request
    }

    /// Single-shot completion without incremental updates.
    pub async fn complete(&self, prompt: &str) -> ModelResult<String> {
        self.provider
            .complete(self.request(prompt))
            .await
            .context(RequestSnafu {
                stage: "complete",
            })
    }

    pub fn complete_streaming(&self, prompt: &str) -> CompletionStream {
        self.open_stream(self.request(prompt))
    }

    pub fn complete_multimodal(&self, prompt: &str, attachments: &[Attachment]) -> MultimodalRequest {
        let converted = convert_attachments(attachments, |media_type| {
            self.provider.accepts_media_type(media_type)
        });

        if !converted.rejected.is_empty() {
            tracing::warn!(
                provider_id = %self.provider.id(),
                accepted = converted.accepted.len(),
                rejected = converted.rejected.len(),
                "continuing multi-modal request without rejected attachments"
            );
        }

        let request = self.request(prompt).with_parts(converted.parts);
        MultimodalRequest {
            stream: self.open_stream(request),
            accepted: converted.accepted,
            rejected: converted.rejected,
        }
    }

    fn open_stream(&self, request: ProviderRequest) -> CompletionStream {
        tracing::debug!(
            provider_id = %self.provider.id(),
            model_id = %request.model_id,
            parts = request.parts.len(),
            "opening completion stream"
        );

        match self.provider.stream_chat(request) {
            Ok(handle) => CompletionStream::live(handle.stream, tokio::spawn(handle.worker)),
            Err(source) => {
                tracing::error!(
                    provider_id = %self.provider.id(),
                    error = %source,
                    "provider refused to open a stream"
                );
                CompletionStream::rejected(ModelError::Request {
                    stage: "open-stream",
                    source,
                })
            }
        }
    }
}
