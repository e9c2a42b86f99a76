use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use snafu::{ResultExt, Snafu};
use studybuddy_llm::AttachmentInfo;
use uuid::Uuid;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("chat id '{raw}' is invalid for {id_type}"))]
    InvalidId {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
        source: uuid::Error,
    },
}

pub type ChatResult<T> = Result<T, ChatError>;

macro_rules! define_chat_id {
    ($name:ident, $id_type:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new_v7() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn parse(raw: &str) -> ChatResult<Self> {
                let parsed = Uuid::parse_str(raw).context(InvalidIdSnafu {
                    stage: "parse-chat-id",
                    id_type: $id_type,
                    raw: raw.to_string(),
                })?;
                Ok(Self(parsed))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(formatter, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ChatError;

            fn from_str(raw: &str) -> ChatResult<Self> {
                Self::parse(raw)
            }
        }
    };
}

define_chat_id!(TurnId, "turn-id");

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Assistant,
}

/// Lifecycle status for one turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TurnStatus {
    Pending,
    Streaming,
    Complete,
    Failed,
}

impl TurnStatus {
    /// Terminal turns are frozen: neither text nor status may change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

/// One entry in the visible transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTurn {
    pub id: TurnId,
    pub role: Role,
    pub text: String,
    /// Present on user turns only.
    pub attachments: Option<Vec<AttachmentInfo>>,
    pub status: TurnStatus,
    pub created_at_unix_millis: u64,
}

impl ChatTurn {
    /// A settled user turn carrying the submitted text and attachment descriptors.
    pub fn user(text: impl Into<String>, attachments: Vec<AttachmentInfo>) -> Self {
        Self {
            id: TurnId::new_v7(),
            role: Role::User,
            text: text.into(),
            attachments: Some(attachments),
            status: TurnStatus::Complete,
            created_at_unix_millis: current_unix_timestamp_millis(),
        }
    }

    /// Creates an assistant placeholder while streaming.
    pub fn assistant_streaming() -> Self {
        Self {
            id: TurnId::new_v7(),
            role: Role::Assistant,
            text: String::new(),
            attachments: None,
            status: TurnStatus::Streaming,
            created_at_unix_millis: current_unix_timestamp_millis(),
        }
    }

    /// Applies `patch` and reports whether anything changed.
    pub(crate) fn apply(&mut self, patch: TurnPatch) -> bool {
        let mut changed = false;

        if let Some(text) = patch.text
            && text != self.text
        {
            self.text = text;
            changed = true;
        }

        if let Some(status) = patch.status
            && status != self.status
        {
            self.status = status;
            changed = true;
        }

        changed
    }
}

/// Partial update addressed to one turn.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TurnPatch {
    pub text: Option<String>,
    pub status: Option<TurnStatus>,
}

impl TurnPatch {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            status: None,
        }
    }

    pub fn status(status: TurnStatus) -> Self {
        Self {
            text: None,
            status: Some(status),
        }
    }

    pub fn with_status(mut self, status: TurnStatus) -> Self {
        self.status = Some(status);
        self
    }
}

/// Phase-two resolution of an assistant placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Complete(String),
    Failed {
        /// User-facing text that replaces whatever streamed so far.
        message: String,
        /// Diagnostic cause recorded as the transcript error flag.
        error: String,
    },
}

impl Settlement {
    pub(crate) fn into_patch(self) -> (TurnPatch, Option<String>) {
        match self {
            Self::Complete(text) => (TurnPatch::text(text).with_status(TurnStatus::Complete), None),
            Self::Failed { message, error } => (
                TurnPatch::text(message).with_status(TurnStatus::Failed),
                Some(error),
            ),
        }
    }
}

/// Everything presentation needs, re-published after every store mutation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Transcript {
    pub turns: Vec<ChatTurn>,
    pub exchange_outstanding: bool,
    pub last_error: Option<String>,
    pub revision: u64,
}

impl Transcript {
    pub fn turn(&self, id: TurnId) -> Option<&ChatTurn> {
        self.turns.iter().find(|turn| turn.id == id)
    }
}

fn current_unix_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| {
            u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
        })
}
