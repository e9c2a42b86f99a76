use std::sync::Arc;

use studybuddy_llm::{Attachment, AttachmentInfo, CompletionStream, ModelClient, ModelError};

use crate::frame::FrameClock;
use crate::message::{ChatTurn, Settlement, TurnId};
use crate::store::MessageStore;
use crate::throttle::StreamThrottler;

/// Shown in place of the assistant reply when an exchange fails.
pub const FAILURE_MESSAGE: &str = "Sorry, I encountered an error. Please try again.";

/// Everything the user hands over in one submission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExchangeInput {
    pub text: String,
    pub attachments: Vec<Attachment>,
    pub voice_clip: Option<Attachment>,
}

impl ExchangeInput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_voice_clip(mut self, clip: Attachment) -> Self {
        self.voice_clip = Some(clip);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.attachments.is_empty() && self.voice_clip.is_none()
    }

    /// Files first, then the voice clip. The text is kept exactly as typed.
    fn into_parts(self) -> (String, Vec<Attachment>) {
        let mut attachments = self.attachments;
        attachments.extend(self.voice_clip);
        (self.text, attachments)
    }
}

/// Settles the assistant turn as failed if `submit` is dropped before it settles.
struct PendingExchange<'a> {
    store: &'a MessageStore,
    assistant_id: TurnId,
    failure_message: &'a str,
    settled: bool,
}

impl<'a> PendingExchange<'a> {
    fn new(store: &'a MessageStore, assistant_id: TurnId, failure_message: &'a str) -> Self {
        Self {
            store,
            assistant_id,
            failure_message,
            settled: false,
        }
    }

    fn settle(&mut self, settlement: Settlement) {
        self.settled = true;
        self.store.settle(self.assistant_id, settlement);
    }
}

impl Drop for PendingExchange<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        tracing::warn!(
            assistant_turn = %self.assistant_id,
            "exchange abandoned before it settled"
        );
        self.store.settle(
            self.assistant_id,
            Settlement::Failed {
                message: self.failure_message.to_string(),
                error: ABANDONED_ERROR.to_string(),
            },
        );
    }
}

const ABANDONED_ERROR: &str = "exchange was abandoned before the reply finished";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    EmptyInput,
    ExchangeOutstanding,
}

#[derive(Debug)]
pub enum ExchangeOutcome {
    /// Nothing was appended to the transcript.
    Rejected(RejectReason),
    Completed {
        assistant_turn: TurnId,
        text: String,
    },
    Failed {
        assistant_turn: TurnId,
        error: ModelError,
    },
}

/// Drives one request/response cycle: optimistic append, throttled streaming, settlement.
#[derive(Clone)]
pub struct ExchangeOrchestrator {
    store: MessageStore,
    client: ModelClient,
    clock: Arc<dyn FrameClock>,
    failure_message: String,
}

impl ExchangeOrchestrator {
    pub fn new(store: MessageStore, client: ModelClient, clock: Arc<dyn FrameClock>) -> Self {
        Self {
            store,
            client,
            clock,
            failure_message: FAILURE_MESSAGE.to_string(),
        }
    }

    pub fn with_failure_message(mut self, message: impl Into<String>) -> Self {
        self.failure_message = message.into();
        self
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn client(&self) -> &ModelClient {
        &self.client
    }

    pub async fn submit(&self, input: ExchangeInput) -> ExchangeOutcome {
        if input.is_empty() {
            tracing::debug!("ignoring empty submission");
            return ExchangeOutcome::Rejected(RejectReason::EmptyInput);
        }

        let (prompt, attachments) = input.into_parts();
        let descriptors = attachments
            .iter()
            .map(Attachment::info)
            .collect::<Vec<AttachmentInfo>>();

        let user_turn = ChatTurn::user(prompt.clone(), descriptors);
        let assistant_turn = ChatTurn::assistant_streaming();
        let user_id = user_turn.id;
        let assistant_id = assistant_turn.id;

        if !self.store.begin_exchange(user_turn, assistant_turn) {
            tracing::debug!("ignoring submission while an exchange is outstanding");
            return ExchangeOutcome::Rejected(RejectReason::ExchangeOutstanding);
        }

        tracing::info!(
            user_turn = %user_id,
            assistant_turn = %assistant_id,
            attachments = attachments.len(),
            "exchange submitted"
        );

        let mut pending = PendingExchange::new(&self.store, assistant_id, &self.failure_message);

        // Let observers render the optimistic turns before the model call starts.
        tokio::task::yield_now().await;

        let throttler =
            StreamThrottler::new(self.store.clone(), assistant_id, Arc::clone(&self.clock));
        let result = self
            .open_stream(&prompt, &attachments)
            .collect_with(|text| throttler.notify(text))
            .await;

        let outcome = match result {
            Ok(text) => {
                pending.settle(Settlement::Complete(text.clone()));
                tracing::info!(
                    assistant_turn = %assistant_id,
                    chars = text.chars().count(),
                    flushes = throttler.flush_count(),
                    "exchange completed"
                );
                ExchangeOutcome::Completed {
                    assistant_turn: assistant_id,
                    text,
                }
            }
            Err(error) => {
                tracing::warn!(
                    assistant_turn = %assistant_id,
                    error = %error,
                    "exchange failed"
                );
                pending.settle(Settlement::Failed {
                    message: self.failure_message.clone(),
                    error: error.to_string(),
                });
                ExchangeOutcome::Failed {
                    assistant_turn: assistant_id,
                    error,
                }
            }
        };

        throttler.cancel();
        outcome
    }

    fn open_stream(&self, prompt: &str, attachments: &[Attachment]) -> CompletionStream {
        if attachments.is_empty() {
            return self.client.complete_streaming(prompt);
        }

        // Rejected attachments are already logged by the conversion step.
        let request = self.client.complete_multimodal(prompt, attachments);
        tracing::debug!(
            accepted = request.accepted.len(),
            rejected = request.rejected.len(),
            "multi-modal request opened"
        );
        request.stream
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use studybuddy_llm::testing::ScriptedProvider;
    use studybuddy_llm::{GenerationOptions, StreamEventPayload};
    use tokio::sync::Notify;

    use super::*;
    use crate::frame::FixedRateFrameClock;
    use crate::message::{Role, TurnStatus};

    fn orchestrator(provider: Arc<ScriptedProvider>) -> ExchangeOrchestrator {
        let client = ModelClient::new(provider, GenerationOptions::new("scripted-model"));
        ExchangeOrchestrator::new(
            MessageStore::new(),
            client,
            Arc::new(FixedRateFrameClock::default()),
        )
    }

    async fn wait_for_outstanding(store: &MessageStore) {
        while !store.exchange_outstanding() {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn plain_text_exchange_completes() {
        let provider = Arc::new(ScriptedProvider::replying(["2 + 2 ", "equals 4."]));
        let orchestrator = orchestrator(provider.clone());

        let outcome = orchestrator.submit(ExchangeInput::text("What is 2+2?")).await;

        let (assistant_turn, text) = match outcome {
            ExchangeOutcome::Completed {
                assistant_turn,
                text,
            } => (assistant_turn, text),
            other => panic!("expected completion, got {other:?}"),
        };
        assert_eq!(text, "2 + 2 equals 4.");

        let transcript = orchestrator.store().transcript();
        assert_eq!(transcript.turns.len(), 2);
        assert!(!transcript.exchange_outstanding);

        let user = &transcript.turns[0];
        assert_eq!(user.role, Role::User);
        assert_eq!(user.text, "What is 2+2?");
        assert_eq!(user.attachments, Some(Vec::new()));

        let assistant = transcript.turn(assistant_turn).expect("assistant turn");
        assert_eq!(assistant.role, Role::Assistant);
        assert_eq!(assistant.status, TurnStatus::Complete);
        assert_eq!(assistant.text, "2 + 2 equals 4.");
        assert_eq!(provider.stream_calls(), 1);
        assert!(provider.last_request().expect("request").parts.is_empty());
    }

    #[tokio::test]
    async fn network_error_leaves_failed_turn_with_fixed_message() {
        let provider = Arc::new(ScriptedProvider::with_events([
            StreamEventPayload::Delta("Partial ans".to_string()),
            StreamEventPayload::Error("network unreachable".to_string()),
        ]));
        let orchestrator = orchestrator(provider);

        let outcome = orchestrator.submit(ExchangeInput::text("Explain osmosis")).await;

        let (assistant_turn, error) = match outcome {
            ExchangeOutcome::Failed {
                assistant_turn,
                error,
            } => (assistant_turn, error),
            other => panic!("expected failure, got {other:?}"),
        };
        assert!(error.to_string().contains("network unreachable"));

        let transcript = orchestrator.store().transcript();
        assert_eq!(transcript.turns.len(), 2);
        assert!(!transcript.exchange_outstanding);
        assert!(
            transcript
                .last_error
                .as_deref()
                .is_some_and(|cause| cause.contains("network unreachable"))
        );

        let user = &transcript.turns[0];
        assert_eq!(user.text, "Explain osmosis");
        assert_eq!(user.status, TurnStatus::Complete);

        let assistant = transcript.turn(assistant_turn).expect("assistant turn");
        assert_eq!(assistant.status, TurnStatus::Failed);
        assert_eq!(assistant.text, FAILURE_MESSAGE);
    }

    #[tokio::test]
    async fn unfinished_stream_fails_the_exchange() {
        let provider = Arc::new(ScriptedProvider::with_events([StreamEventPayload::Delta(
            "cut off".to_string(),
        )]));
        let orchestrator = orchestrator(provider).with_failure_message("try later");

        let outcome = orchestrator.submit(ExchangeInput::text("hi")).await;

        assert!(matches!(
            outcome,
            ExchangeOutcome::Failed {
                error: ModelError::StreamEndedEarly { .. },
                ..
            }
        ));
        assert_eq!(orchestrator.store().snapshot()[1].text, "try later");
    }

    #[tokio::test]
    async fn bad_attachment_is_skipped_and_exchange_completes() {
        let provider = Arc::new(ScriptedProvider::replying(["Both pages cover mitosis."]));
        let orchestrator = orchestrator(provider.clone());
        let input = ExchangeInput::text("Summarize these").with_attachments(vec![
            Attachment::new("page-1.png", "image/png", vec![0x89, 0x50, 0x4e, 0x47]),
            Attachment::new("corrupt.png", "image/png", Vec::new()),
        ]);

        let outcome = orchestrator.submit(input).await;

        assert!(matches!(outcome, ExchangeOutcome::Completed { .. }));
        let sent = provider.last_request().expect("request recorded");
        assert_eq!(sent.parts.len(), 1);
        assert_eq!(sent.parts[0].media_type, "image/png");

        let user = &orchestrator.store().snapshot()[0];
        let names = user
            .attachments
            .as_ref()
            .map(|infos| infos.iter().map(|info| info.name.as_str()).collect::<Vec<_>>());
        assert_eq!(names, Some(vec!["page-1.png", "corrupt.png"]));
    }

    #[tokio::test]
    async fn voice_clip_alone_is_sent_as_audio_part() {
        let provider = Arc::new(ScriptedProvider::replying(["You asked about photosynthesis."]));
        let orchestrator = orchestrator(provider.clone());
        let clip = Attachment::new("voice-message.webm", "audio/webm", vec![1, 2, 3, 4]);

        let outcome = orchestrator
            .submit(ExchangeInput::text("  ").with_voice_clip(clip))
            .await;

        assert!(matches!(outcome, ExchangeOutcome::Completed { .. }));
        let sent = provider.last_request().expect("request recorded");
        assert_eq!(sent.prompt, "  ");
        assert_eq!(sent.parts.len(), 1);
        assert_eq!(sent.parts[0].media_type, "audio/webm");

        let user = &orchestrator.store().snapshot()[0];
        assert_eq!(
            user.attachments.as_ref().map(Vec::len),
            Some(1),
            "voice clip is listed on the user turn"
        );
    }

    #[tokio::test]
    async fn user_turn_keeps_the_text_as_typed() {
        let provider = Arc::new(ScriptedProvider::replying(["Noted."]));
        let orchestrator = orchestrator(provider.clone());
        let typed = "  Line one\n  indented line two\n";

        let outcome = orchestrator.submit(ExchangeInput::text(typed)).await;

        assert!(matches!(outcome, ExchangeOutcome::Completed { .. }));
        assert_eq!(orchestrator.store().snapshot()[0].text, typed);
        assert_eq!(provider.last_request().expect("request").prompt, typed);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_exchange_settles_as_failed() {
        let gate = Arc::new(Notify::new());
        let provider =
            Arc::new(ScriptedProvider::replying(["Half ", "done."]).gated(1, Arc::clone(&gate)));
        let orchestrator = orchestrator(provider.clone());

        let running = tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move { orchestrator.submit(ExchangeInput::text("Explain DNA")).await }
        });
        wait_for_outstanding(orchestrator.store()).await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        running.abort();
        assert!(running.await.is_err_and(|error| error.is_cancelled()));

        let transcript = orchestrator.store().transcript();
        assert!(!transcript.exchange_outstanding);
        assert_eq!(transcript.turns[1].status, TurnStatus::Failed);
        assert_eq!(transcript.turns[1].text, FAILURE_MESSAGE);
        assert_eq!(transcript.last_error.as_deref(), Some(ABANDONED_ERROR));

        // Let the aborted worker unwind, then leave a permit for the next stream's gate.
        tokio::time::sleep(Duration::from_millis(1)).await;
        gate.notify_one();
        let next = orchestrator.submit(ExchangeInput::text("Try again")).await;
        assert!(matches!(next, ExchangeOutcome::Completed { .. }));
        assert_eq!(provider.stream_calls(), 2);
    }

    #[tokio::test]
    async fn empty_input_is_rejected_without_touching_the_store() {
        let provider = Arc::new(ScriptedProvider::replying(["unused"]));
        let orchestrator = orchestrator(provider.clone());

        let outcome = orchestrator.submit(ExchangeInput::text(" \n\t ")).await;

        assert!(matches!(
            outcome,
            ExchangeOutcome::Rejected(RejectReason::EmptyInput)
        ));
        assert!(orchestrator.store().is_empty());
        assert_eq!(provider.stream_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn second_submission_is_rejected_while_streaming() {
        let gate = Arc::new(Notify::new());
        let provider = Arc::new(
            ScriptedProvider::replying(["Cells ", "divide."]).gated(1, Arc::clone(&gate)),
        );
        let orchestrator = orchestrator(provider.clone());

        let first = tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move { orchestrator.submit(ExchangeInput::text("What is mitosis?")).await }
        });
        wait_for_outstanding(orchestrator.store()).await;

        // One frame later the partial reply is visible while the stream is parked.
        tokio::time::sleep(Duration::from_millis(40)).await;
        let assistant = orchestrator.store().snapshot()[1].clone();
        assert_eq!(assistant.status, TurnStatus::Streaming);
        assert_eq!(assistant.text, "Cells ");

        let second = orchestrator
            .submit(ExchangeInput::text("And meiosis?"))
            .await;
        assert!(matches!(
            second,
            ExchangeOutcome::Rejected(RejectReason::ExchangeOutstanding)
        ));
        assert_eq!(orchestrator.store().len(), 2);
        assert_eq!(provider.stream_calls(), 1);

        gate.notify_one();
        let outcome = first.await.expect("exchange task joins");
        assert!(matches!(
            outcome,
            ExchangeOutcome::Completed { ref text, .. } if text == "Cells divide."
        ));
        assert_eq!(orchestrator.store().snapshot()[1].text, "Cells divide.");
    }
}
