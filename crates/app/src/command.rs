use std::path::{Path, PathBuf};

pub const FALLBACK_MEDIA_TYPE: &str = "application/octet-stream";

/// One line of terminal input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Attach(PathBuf),
    ClearAttachments,
    /// Drops one queued file by its 1-based position.
    Detach(usize),
    Help,
    Quit,
    Prompt(String),
    Unknown(String),
}

impl Command {
    /// Blank lines yield `None`.
    /// Prompts are passed through as typed.
    pub fn parse(raw: &str) -> Option<Self> {
        let line = raw.trim();
        if line.is_empty() {
            return None;
        }

        let Some(rest) = line.strip_prefix('/') else {
            return Some(Self::Prompt(raw.to_string()));
        };

        let (name, argument) = match rest.split_once(char::is_whitespace) {
            Some((name, argument)) => (name, argument.trim()),
            None => (rest, ""),
        };

        let command = match name {
            "attach" if !argument.is_empty() => Self::Attach(PathBuf::from(argument)),
            "clear-attachments" => Self::ClearAttachments,
            "detach" => match argument.parse::<usize>() {
                Ok(position) if position > 0 => Self::Detach(position),
                _ => Self::Unknown(line.to_string()),
            },
            "help" => Self::Help,
            "quit" | "exit" => Self::Quit,
            _ => Self::Unknown(line.to_string()),
        };
        Some(command)
    }
}

pub const HELP_TEXT: &str = "\
commands:
  /attach <path>        queue a file for the next message
  /detach <n>           drop the n-th queued file
  /clear-attachments    drop queued files
  /quit                 leave
anything else is sent as a message";

/// Media type from the file extension, `application/octet-stream` when unknown.
pub fn guess_media_type(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|extension| extension.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    match extension.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "md" => "text/markdown",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        "webm" => "audio/webm",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "flac" => "audio/flac",
        "m4a" => "audio/mp4",
        _ => FALLBACK_MEDIA_TYPE,
    }
}
