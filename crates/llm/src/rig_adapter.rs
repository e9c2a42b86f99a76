use futures::StreamExt;
use rig::completion::{CompletionError, CompletionModel, CompletionRequestBuilder};
use rig::http_client::sse::{Event, GenericEventSource};
use rig::message::{AssistantContent, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::providers::gemini;
use rig::providers::gemini::completion::gemini_api_types::{
    AdditionalParameters, Blob, Content, GenerateContentRequest, GenerationConfig, Part, PartKind,
    Role,
};
use rig::providers::gemini::streaming::StreamGenerateContentResponse;
use rig::streaming::StreamedAssistantContent;
use snafu::{ResultExt, ensure};
use tokio::sync::{mpsc, oneshot};

use super::attachment::InlinePart;
use super::model::DEFAULT_GEMINI_MODEL;
use super::provider::{
    BoxFuture, CompletionsFailedSnafu, EmptyCompletionSnafu, EmptyRequestSnafu,
    EncodeRequestSnafu, HttpClientSnafu, LlmProvider, MissingApiKeySnafu, ProviderConfig,
    ProviderError, ProviderRequest, ProviderResult, ProviderStreamHandle, ProviderWorker,
    StreamEventPayload, make_event_stream,
};

pub const GEMINI_PROVIDER_ID: &str = "gemini";

/// Inline media Gemini takes, as (normalized MIME, MIME sent on the wire).
const GEMINI_INLINE_MEDIA_TYPES: &[(&str, &str)] = &[
    ("image/jpeg", "image/jpeg"),
    ("image/jpg", "image/jpeg"),
    ("image/png", "image/png"),
    ("image/webp", "image/webp"),
    ("image/heic", "image/heic"),
    ("image/heif", "image/heif"),
    ("audio/webm", "audio/webm"),
    ("audio/wav", "audio/wav"),
    ("audio/x-wav", "audio/wav"),
    ("audio/mp3", "audio/mp3"),
    ("audio/mpeg", "audio/mp3"),
    ("audio/aiff", "audio/aiff"),
    ("audio/aac", "audio/aac"),
    ("audio/ogg", "audio/ogg"),
    ("audio/flac", "audio/flac"),
    ("application/pdf", "application/pdf"),
    ("text/plain", "text/plain"),
    ("text/html", "text/html"),
    ("text/css", "text/css"),
    ("text/markdown", "text/md"),
    ("text/md", "text/md"),
    ("text/csv", "text/csv"),
    ("text/xml", "text/xml"),
    ("text/rtf", "text/rtf"),
];

fn gemini_mime_type(media_type: &str) -> Option<&'static str> {
    GEMINI_INLINE_MEDIA_TYPES
        .iter()
        .find(|(accepted, _)| *accepted == media_type)
        .map(|(_, wire)| *wire)
}

/// Text decoded from one server-sent event of an inline-media stream.
#[derive(Debug, Default, PartialEq)]
struct InlineChunk {
    deltas: Vec<String>,
    finished: bool,
}

pub struct GeminiProvider {
    config: ProviderConfig,
}

impl GeminiProvider {
    pub fn new(config: ProviderConfig) -> ProviderResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "gemini-provider-new",
                provider_id: config.provider_id.clone(),
            }
        );

        Ok(Self { config })
    }

    fn build_client(config: &ProviderConfig) -> ProviderResult<gemini::Client> {
        let mut builder = gemini::Client::builder().api_key(config.api_key.as_str());
        if !config.base_url.is_empty() {
            builder = builder.base_url(config.base_url.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    fn generation_config(request: &ProviderRequest) -> GenerationConfig {
        GenerationConfig {
            temperature: request.temperature,
            max_output_tokens: request.max_output_tokens,
            top_k: request.top_k.and_then(|top_k| i32::try_from(top_k).ok()),
            top_p: request.top_p,
            ..GenerationConfig::default()
        }
    }

    fn system_instruction(request: &ProviderRequest) -> Option<&str> {
        request
            .system_instruction
            .as_deref()
            .filter(|instruction| !instruction.trim().is_empty())
    }

    /// Inline parts go out under their own MIME, so media the typed message model lacks still fits.
    fn to_inline_data(part: &InlinePart) -> Option<Part> {
        let mime_type = gemini_mime_type(&part.media_type)?;
        Some(Part {
            part: PartKind::InlineData(Blob {
                mime_type: mime_type.to_string(),
                data: part.data_base64.clone(),
            }),
            ..Part::default()
        })
    }

    /// Builds the single user turn: prompt text first, then inline parts in order.
    fn prompt_content(request: &ProviderRequest) -> ProviderResult<Content> {
        let mut parts = Vec::with_capacity(request.parts.len() + 1);
        if !request.prompt.trim().is_empty() {
            parts.push(Part::from(request.prompt.as_str()));
        }

        for part in &request.parts {
            match Self::to_inline_data(part) {
                Some(inline) => parts.push(inline),
                None => tracing::warn!(
                    media_type = %part.media_type,
                    "dropping inline part gemini cannot take"
                ),
            }
        }

        ensure!(
            !parts.is_empty(),
            EmptyRequestSnafu {
                stage: "build-prompt-content",
            }
        );

        Ok(Content {
            parts,
            role: Some(Role::User),
        })
    }

    fn inline_request(request: &ProviderRequest) -> ProviderResult<GenerateContentRequest> {
        Ok(GenerateContentRequest {
            contents: vec![Self::prompt_content(request)?],
            tools: None,
            tool_config: None,
            generation_config: Some(Self::generation_config(request)),
            safety_settings: None,
            system_instruction: Self::system_instruction(request).map(|instruction| Content {
                parts: vec![Part::from(instruction)],
                role: None,
            }),
            additional_params: None,
        })
    }

    fn configure<M>(
        mut builder: CompletionRequestBuilder<M>,
        request: &ProviderRequest,
    ) -> ProviderResult<CompletionRequestBuilder<M>>
    where
        M: CompletionModel,
    {
        if let Some(instruction) = Self::system_instruction(request) {
            builder = builder.preamble(instruction.to_string());
        }

        // Gemini drops every sampling knob unless a generationConfig rides along.
        let params = AdditionalParameters::default().with_config(Self::generation_config(request));
        let params = serde_json::to_value(params).context(EncodeRequestSnafu {
            stage: "encode-generation-config",
        })?;

        Ok(builder.additional_params(params))
    }

    fn emit(event_tx: &mpsc::UnboundedSender<StreamEventPayload>, payload: StreamEventPayload) {
        let _ = event_tx.send(payload);
    }

    fn fail(
        event_tx: &mpsc::UnboundedSender<StreamEventPayload>,
        request: &ProviderRequest,
        error: ProviderError,
    ) {
        tracing::error!(
            model_id = %request.model_id,
            error = %error,
            "failed to open provider stream"
        );
        Self::emit(event_tx, StreamEventPayload::Error(error.to_string()));
    }

    fn map_stream_item<R>(item: StreamedAssistantContent<R>) -> Option<StreamEventPayload>
    where
        R: Clone + Unpin,
    {
        match item {
            StreamedAssistantContent::Text(text) if !text.text.is_empty() => {
                Some(StreamEventPayload::Delta(text.text))
            }
            // Thinking output is not part of the visible answer.
            StreamedAssistantContent::Text(_)
            | StreamedAssistantContent::Reasoning(_)
            | StreamedAssistantContent::ReasoningDelta { .. }
            | StreamedAssistantContent::ToolCall { .. }
            | StreamedAssistantContent::ToolCallDelta { .. }
            | StreamedAssistantContent::Final(_) => None,
        }
    }

    /// A decode failure of one chunk leaves the connection usable; anything else ends the stream.
    fn is_chunk_fault(error: &CompletionError) -> bool {
        matches!(error, CompletionError::JsonError(_))
    }

    fn decode_chunk(data: &str) -> Result<InlineChunk, serde_json::Error> {
        let response: StreamGenerateContentResponse = serde_json::from_str(data)?;
        let Some(candidate) = response.candidates.into_iter().next() else {
            return Ok(InlineChunk::default());
        };

        let deltas = candidate
            .content
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|part| match part {
                        Part {
                            part: PartKind::Text(text),
                            thought,
                            ..
                        } if thought != Some(true) && !text.is_empty() => Some(text),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(InlineChunk {
            deltas,
            finished: candidate.finish_reason.is_some(),
        })
    }

    async fn run_stream_worker(
        config: ProviderConfig,
        request: ProviderRequest,
        event_tx: mpsc::UnboundedSender<StreamEventPayload>,
        cancel_rx: oneshot::Receiver<()>,
    ) {
        let client = match Self::build_client(&config) {
            Ok(client) => client,
            Err(error) => {
                tracing::error!(
                    provider_id = %config.provider_id,
                    error = %error,
                    "failed to build gemini client"
                );
                Self::emit(&event_tx, StreamEventPayload::Error(error.to_string()));
                return;
            }
        };

        if request.parts.is_empty() {
            Self::stream_text(client, request, event_tx, cancel_rx).await;
        } else {
            Self::stream_inline(client, request, event_tx, cancel_rx).await;
        }
    }

    async fn stream_text(
        client: gemini::Client,
        request: ProviderRequest,
        event_tx: mpsc::UnboundedSender<StreamEventPayload>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let model = client.completion_model(request.model_id.clone());
        let prompt = RigMessage::user(request.prompt.clone());
        let builder = match Self::configure(model.completion_request(prompt), &request) {
            Ok(builder) => builder,
            Err(error) => return Self::fail(&event_tx, &request, error),
        };

        let mut stream = match builder.stream().await {
            Ok(stream) => stream,
            Err(source) => {
                let error = ProviderError::CompletionsFailed {
                    stage: "open-stream",
                    source,
                };
                return Self::fail(&event_tx, &request, error);
            }
        };

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    // Cancel the upstream Rig stream so provider IO stops promptly.
                    tracing::debug!(model_id = %request.model_id, "provider stream cancelled");
                    stream.cancel();
                    return;
                }
                next_item = stream.next() => {
                    match next_item {
                        Some(Ok(item)) => {
                            if let Some(payload) = Self::map_stream_item(item)
                                && event_tx.send(payload).is_err()
                            {
                                return;
                            }
                        }
                        Some(Err(source)) if Self::is_chunk_fault(&source) => {
                            tracing::warn!(
                                model_id = %request.model_id,
                                error = %source,
                                "skipping undecodable stream chunk"
                            );
                            Self::emit(&event_tx, StreamEventPayload::ChunkError(source.to_string()));
                        }
                        Some(Err(source)) => {
                            tracing::warn!(
                                model_id = %request.model_id,
                                error = %source,
                                "provider stream emitted an error chunk"
                            );
                            let error = ProviderError::CompletionsFailed {
                                stage: "stream-chunk",
                                source,
                            };
                            Self::emit(&event_tx, StreamEventPayload::Error(error.to_string()));
                            return;
                        }
                        None => break,
                    }
                }
            }
        }

        Self::emit(&event_tx, StreamEventPayload::Done);
    }

    /// Streams a request carrying inline media straight against `streamGenerateContent`.
    async fn stream_inline(
        client: gemini::Client,
        request: ProviderRequest,
        event_tx: mpsc::UnboundedSender<StreamEventPayload>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let body = match Self::inline_request(&request).and_then(|body| {
            serde_json::to_vec(&body).context(EncodeRequestSnafu {
                stage: "encode-inline-request",
            })
        }) {
            Ok(body) => body,
            Err(error) => return Self::fail(&event_tx, &request, error),
        };

        let path = format!("/v1beta/models/{}:streamGenerateContent", request.model_id);
        let http_request = client.post_sse(path).and_then(|builder| {
            builder
                .header("Content-Type", "application/json")
                .body(body)
                .map_err(rig::http_client::Error::from)
        });
        let http_request = match http_request {
            Ok(http_request) => http_request,
            Err(source) => {
                let error = ProviderError::HttpClient {
                    stage: "build-inline-request",
                    source,
                };
                return Self::fail(&event_tx, &request, error);
            }
        };

        tracing::debug!(
            model_id = %request.model_id,
            parts = request.parts.len(),
            "opening inline media stream"
        );
        let mut events = GenericEventSource::new(client, http_request);

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    tracing::debug!(model_id = %request.model_id, "provider stream cancelled");
                    events.close();
                    return;
                }
                next_event = events.next() => {
                    match next_event {
                        Some(Ok(Event::Open)) => {}
                        Some(Ok(Event::Message(message))) => {
                            if message.data.trim().is_empty() {
                                continue;
                            }
                            match Self::decode_chunk(&message.data) {
                                Ok(chunk) => {
                                    for delta in chunk.deltas {
                                        if event_tx.send(StreamEventPayload::Delta(delta)).is_err() {
                                            events.close();
                                            return;
                                        }
                                    }
                                    if chunk.finished {
                                        break;
                                    }
                                }
                                Err(source) => {
                                    tracing::warn!(
                                        model_id = %request.model_id,
                                        error = %source,
                                        "skipping undecodable stream chunk"
                                    );
                                    Self::emit(&event_tx, StreamEventPayload::ChunkError(source.to_string()));
                                }
                            }
                        }
                        Some(Err(rig::http_client::Error::StreamEnded)) | None => break,
                        Some(Err(source)) => {
                            let error = ProviderError::HttpClient {
                                stage: "inline-stream",
                                source,
                            };
                            tracing::warn!(
                                model_id = %request.model_id,
                                error = %error,
                                "inline media stream failed"
                            );
                            Self::emit(&event_tx, StreamEventPayload::Error(error.to_string()));
                            events.close();
                            return;
                        }
                    }
                }
            }
        }

        events.close();
        Self::emit(&event_tx, StreamEventPayload::Done);
    }

    async fn complete_text(&self, request: ProviderRequest) -> ProviderResult<String> {
        let client = Self::build_client(&self.config)?;
        let model = client.completion_model(request.model_id.clone());
        let prompt = RigMessage::user(request.prompt.clone());

        let response = Self::configure(model.completion_request(prompt), &request)?
            .send()
            .await
            .context(CompletionsFailedSnafu {
                stage: "send-completion",
            })?;

        Ok(response
            .choice
            .iter()
            .filter_map(|content| match content {
                AssistantContent::Text(text) => Some(text.text.as_str()),
                _ => None,
            })
            .collect())
    }

    /// Drains an inline media stream into one string.
    async fn complete_inline(&self, request: ProviderRequest) -> ProviderResult<String> {
        let client = Self::build_client(&self.config)?;
        let (event_tx, mut stream, cancel_rx) = make_event_stream();
        let worker = Self::stream_inline(client, request, event_tx, cancel_rx);

        let collect = async move {
            let mut text = String::new();
            while let Some(event) = stream.recv().await {
                match event {
                    StreamEventPayload::Delta(delta) => text.push_str(&delta),
                    StreamEventPayload::ChunkError(_) => {}
                    StreamEventPayload::Done => break,
                    StreamEventPayload::Error(message) => {
                        return Err(ProviderError::CompletionsFailed {
                            stage: "inline-completion",
                            source: CompletionError::ProviderError(message),
                        });
                    }
                }
            }
            Ok(text)
        };

        let ((), text) = tokio::join!(worker, collect);
        text
    }

    async fn complete_once(&self, request: ProviderRequest) -> ProviderResult<String> {
        ensure!(
            !request.is_empty(),
            EmptyRequestSnafu {
                stage: "complete",
            }
        );

        let text = if request.parts.is_empty() {
            self.complete_text(request).await?
        } else {
            self.complete_inline(request).await?
        };

        ensure!(
            !text.is_empty(),
            EmptyCompletionSnafu {
                stage: "read-completion",
            }
        );
        Ok(text)
    }
}

impl LlmProvider for GeminiProvider {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn name(&self) -> &str {
        "Google Gemini"
    }

    fn default_model(&self) -> &str {
        DEFAULT_GEMINI_MODEL
    }

    fn accepts_media_type(&self, media_type: &str) -> bool {
        gemini_mime_type(media_type).is_some()
    }

    fn complete<'a>(&'a self, request: ProviderRequest) -> BoxFuture<'a, ProviderResult<String>> {
        Box::pin(self.complete_once(request))
    }

    fn stream_chat(&self, request: ProviderRequest) -> ProviderResult<ProviderStreamHandle> {
        ensure!(
            !request.is_empty(),
            EmptyRequestSnafu {
                stage: "stream-chat",
            }
        );

        let (event_tx, stream, cancel_rx) = make_event_stream();
        let worker: ProviderWorker = Box::pin(Self::run_stream_worker(
            self.config.clone(),
            request,
            event_tx,
            cancel_rx,
        ));

        Ok(ProviderStreamHandle { stream, worker })
    }
}
