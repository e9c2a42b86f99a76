use studybuddy_llm::Attachment;

pub const VOICE_CLIP_NAME: &str = "voice-message.webm";
pub const VOICE_CLIP_MEDIA_TYPE: &str = "audio/webm";

/// Live microphone capture owned by a recording session.
pub trait CaptureStream: Send {
    /// Stops every track. Called exactly once per session.
    fn stop_tracks(&mut self);
}

/// Buffers encoded audio chunks until the user stops or abandons the recording.
pub struct RecordingSession<S: CaptureStream> {
    stream: Option<S>,
    chunks: Vec<Vec<u8>>,
}

impl<S: CaptureStream> RecordingSession<S> {
    pub fn start(stream: S) -> Self {
        tracing::debug!("recording started");
        Self {
            stream: Some(stream),
            chunks: Vec::new(),
        }
    }

    pub fn push_chunk(&mut self, chunk: Vec<u8>) {
        if chunk.is_empty() {
            return;
        }
        self.chunks.push(chunk);
    }

    pub fn captured_bytes(&self) -> usize {
        self.chunks.iter().map(Vec::len).sum()
    }

    /// Releases the capture stream and returns the recorded clip, if any audio arrived.
    pub fn stop(mut self) -> Option<Attachment> {
        self.release();

        let data = std::mem::take(&mut self.chunks).concat();
        if data.is_empty() {
            tracing::debug!("recording stopped without audio");
            return None;
        }

        tracing::debug!(bytes = data.len(), "recording stopped");
        Some(Attachment::new(VOICE_CLIP_NAME, VOICE_CLIP_MEDIA_TYPE, data))
    }

    /// Releases the capture stream and discards everything recorded.
    pub fn abort(mut self) {
        self.release();
        self.chunks.clear();
        tracing::debug!("recording aborted");
    }

    fn release(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.stop_tracks();
        }
    }
}

impl<S: CaptureStream> Drop for RecordingSession<S> {
    fn drop(&mut self) {
        self.release();
    }
}
