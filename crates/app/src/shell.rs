use std::path::Path;

use snafu::ResultExt;
use studybuddy_chat::{Attachment, ExchangeInput, ExchangeOrchestrator, ExchangeOutcome};

use crate::command::{Command, HELP_TEXT, guess_media_type};
use crate::error::{AppResult, ReadAttachmentSnafu};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Line-driven front end: queues attachments and submits prompts.
pub struct Shell {
    orchestrator: ExchangeOrchestrator,
    queued: Vec<Attachment>,
}

impl Shell {
    pub fn new(orchestrator: ExchangeOrchestrator) -> Self {
        Self {
            orchestrator,
            queued: Vec::new(),
        }
    }

    pub fn queued(&self) -> &[Attachment] {
        &self.queued
    }

    /// Handles one input line. Notices for the user are returned through `notice`.
    pub async fn handle_line(&mut self, line: &str, notice: &mut Vec<String>) -> AppResult<Flow> {
        let Some(command) = Command::parse(line) else {
            return Ok(Flow::Continue);
        };

        match command {
            Command::Quit => return Ok(Flow::Quit),
            Command::Help => notice.push(HELP_TEXT.to_string()),
            Command::Unknown(raw) => notice.push(format!("unknown command `{raw}`, try /help")),
            Command::ClearAttachments => {
                let dropped = self.queued.len();
                self.queued.clear();
                notice.push(format!("dropped {dropped} queued attachment(s)"));
            }
            Command::Detach(position) => {
                if position <= self.queued.len() {
                    let dropped = self.queued.remove(position - 1);
                    notice.push(format!("dropped {}", dropped.name));
                } else {
                    notice.push(format!(
                        "no queued attachment #{position}, {} queued",
                        self.queued.len()
                    ));
                }
            }
            Command::Attach(path) => {
                let attachment = read_attachment(&path).await?;
                notice.push(format!(
                    "queued {} ({}, {} bytes)",
                    attachment.name,
                    attachment.media_type,
                    attachment.data.len()
                ));
                self.queued.push(attachment);
            }
            Command::Prompt(text) => {
                let input =
                    ExchangeInput::text(text).with_attachments(std::mem::take(&mut self.queued));
                if let ExchangeOutcome::Rejected(reason) = self.orchestrator.submit(input).await {
                    notice.push(format!("message not sent: {reason:?}"));
                }
            }
        }

        Ok(Flow::Continue)
    }
}

async fn read_attachment(path: &Path) -> AppResult<Attachment> {
    let data = tokio::fs::read(path).await.context(ReadAttachmentSnafu {
        stage: "read-attachment",
        path: path.to_path_buf(),
    })?;
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    Ok(Attachment::new(name, guess_media_type(path), data))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use studybuddy_chat::{FixedRateFrameClock, MessageStore, TurnStatus};
    use studybuddy_llm::testing::ScriptedProvider;
    use studybuddy_llm::{GenerationOptions, ModelClient};

    use super::*;
    use crate::error::AppError;

    fn shell(provider: Arc<ScriptedProvider>) -> Shell {
        let client = ModelClient::new(provider, GenerationOptions::new("scripted-model"));
        Shell::new(ExchangeOrchestrator::new(
            MessageStore::new(),
            client,
            Arc::new(FixedRateFrameClock::default()),
        ))
    }

    #[tokio::test]
    async fn unreadable_attachment_is_reported_and_not_queued() {
        let mut shell = shell(Arc::new(ScriptedProvider::replying(["unused"])));
        let mut notice = Vec::new();

        let result = shell
            .handle_line("/attach /definitely/not/here.png", &mut notice)
            .await;

        assert!(matches!(result, Err(AppError::ReadAttachment { .. })));
        assert!(shell.queued().is_empty());
    }

    #[tokio::test]
    async fn queued_files_travel_with_the_next_prompt() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("cell.png");
        std::fs::write(&path, [0x89, b'P', b'N', b'G']).expect("write fixture");

        let provider = Arc::new(ScriptedProvider::replying(["A plant cell."]));
        let mut shell = shell(provider.clone());
        let mut notice = Vec::new();

        let flow = shell
            .handle_line(&format!("/attach {}", path.display()), &mut notice)
            .await
            .expect("attachment queued");
        assert_eq!(flow, Flow::Continue);
        assert_eq!(shell.queued().len(), 1);
        assert_eq!(shell.queued()[0].media_type, "image/png");

        shell
            .handle_line("What is this?", &mut notice)
            .await
            .expect("prompt submitted");

        assert!(shell.queued().is_empty());
        let sent = provider.last_request().expect("request recorded");
        assert_eq!(sent.prompt, "What is this?");
        assert_eq!(sent.parts.len(), 1);

        let turns = shell.orchestrator.store().snapshot();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].status, TurnStatus::Complete);
        assert_eq!(turns[1].text, "A plant cell.");
    }

    #[tokio::test]
    async fn detach_drops_one_queued_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut shell = shell(Arc::new(ScriptedProvider::replying(["unused"])));
        let mut notice = Vec::new();
        for name in ["week1.pdf", "diagram.png", "notes.txt"] {
            let path = dir.path().join(name);
            std::fs::write(&path, b"data").expect("write fixture");
            shell
                .handle_line(&format!("/attach {}", path.display()), &mut notice)
                .await
                .expect("attachment queued");
        }
        notice.clear();

        shell
            .handle_line("/detach 2", &mut notice)
            .await
            .expect("detach succeeds");
        shell
            .handle_line("/detach 5", &mut notice)
            .await
            .expect("detach succeeds");

        let names = shell
            .queued()
            .iter()
            .map(|attachment| attachment.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, ["week1.pdf", "notes.txt"]);
        assert_eq!(
            notice,
            ["dropped diagram.png", "no queued attachment #5, 2 queued"]
        );
    }

    #[tokio::test]
    async fn clear_and_quit_commands() {
        let mut shell = shell(Arc::new(ScriptedProvider::replying(["unused"])));
        let mut notice = Vec::new();

        let flow = shell
            .handle_line("/clear-attachments", &mut notice)
            .await
            .expect("clear succeeds");
        assert_eq!(flow, Flow::Continue);
        assert_eq!(notice, ["dropped 0 queued attachment(s)"]);

        let flow = shell.handle_line("/quit", &mut notice).await.expect("quit");
        assert_eq!(flow, Flow::Quit);
    }
}
