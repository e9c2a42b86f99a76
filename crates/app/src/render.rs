use std::collections::HashMap;

use studybuddy_chat::{ChatTurn, Role, Transcript, TurnId, TurnStatus};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

/// Shown after the assistant header until the first reply text arrives.
pub const PENDING_MARKER: &str = "thinking...";

#[derive(Debug, Default)]
struct PrintedTurn {
    text: String,
    waiting: bool,
    finished: bool,
}

/// Turns successive transcript snapshots into append-only terminal output.
#[derive(Debug, Default)]
pub struct TranscriptPrinter {
    printed: HashMap<TurnId, PrintedTurn>,
}

impl TranscriptPrinter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Output needed to bring the terminal up to date with `transcript`.
    pub fn render(&mut self, transcript: &Transcript) -> String {
        let mut output = String::new();

        for turn in &transcript.turns {
            let printed = self.printed.entry(turn.id).or_insert_with(|| {
                output.push_str(header(turn));
                PrintedTurn::default()
            });
            if printed.finished {
                continue;
            }

            if turn.text.is_empty() && !turn.status.is_terminal() {
                if transcript.exchange_outstanding && !printed.waiting {
                    output.push_str(PENDING_MARKER);
                    printed.waiting = true;
                }
                continue;
            }
            // The reply starts on its own line below the marker.
            if std::mem::take(&mut printed.waiting) {
                output.push('\n');
            }

            match turn.text.strip_prefix(printed.text.as_str()) {
                Some(suffix) => output.push_str(suffix),
                // Replaced rather than extended, e.g. by the failure message.
                None => {
                    output.push('\n');
                    output.push_str(&turn.text);
                }
            }
            printed.text.clone_from(&turn.text);

            if turn.status.is_terminal() {
                if turn.status == TurnStatus::Failed {
                    output.push_str(" [failed]");
                }
                output.push('\n');
                if let Some(names) = attachment_line(turn) {
                    output.push_str(&names);
                }
                printed.finished = true;
            }
        }

        output
    }
}

fn header(turn: &ChatTurn) -> &'static str {
    match turn.role {
        Role::User => "you> ",
        Role::Assistant => "assistant> ",
    }
}

fn attachment_line(turn: &ChatTurn) -> Option<String> {
    let attachments = turn.attachments.as_ref().filter(|infos| !infos.is_empty())?;
    let names = attachments
        .iter()
        .map(|info| info.name.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    Some(format!("     attached: {names}\n"))
}

/// Writes transcript changes to `out` until the store goes away.
pub async fn print_transcript<W>(mut updates: watch::Receiver<Transcript>, mut out: W)
where
    W: AsyncWrite + Unpin,
{
    let mut printer = TranscriptPrinter::new();

    loop {
        let chunk = printer.render(&updates.borrow_and_update());
        if !chunk.is_empty() {
            if let Err(error) = out.write_all(chunk.as_bytes()).await {
                tracing::warn!(error = %error, "transcript printer stopped");
                return;
            }
            if let Err(error) = out.flush().await {
                tracing::warn!(error = %error, "transcript printer stopped");
                return;
            }
        }

        if updates.changed().await.is_err() {
            return;
        }
    }
}
