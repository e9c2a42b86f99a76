mod frame;
mod message;
mod orchestrator;
mod recording;
mod store;
mod throttle;

pub use frame::{DEFAULT_FRAME_INTERVAL, FixedRateFrameClock, FrameClock};
pub use message::{
    ChatError, ChatResult, ChatTurn, Role, Settlement, Transcript, TurnId, TurnPatch, TurnStatus,
};
pub use orchestrator::{
    ExchangeInput, ExchangeOrchestrator, ExchangeOutcome, FAILURE_MESSAGE, RejectReason,
};
pub use recording::{CaptureStream, RecordingSession, VOICE_CLIP_MEDIA_TYPE, VOICE_CLIP_NAME};
pub use store::MessageStore;
pub use studybuddy_llm::{Attachment, AttachmentInfo};
pub use throttle::StreamThrottler;
