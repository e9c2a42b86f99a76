use std::sync::Arc;

mod attachment;
mod client;
mod model;
mod provider;
mod rig_adapter;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use attachment::{
    Attachment, AttachmentError, AttachmentInfo, ConvertedAttachments, InlinePart,
    convert_attachments, normalize_media_type, to_inline_part,
};
pub use client::{
    CompletionEvent, CompletionStream, ModelClient, ModelError, ModelResult, MultimodalRequest,
};
pub use model::{
    DEFAULT_GEMINI_MODEL, DEFAULT_MAX_OUTPUT_TOKENS, DEFAULT_SYSTEM_INSTRUCTION,
    DEFAULT_TEMPERATURE, DEFAULT_TOP_K, DEFAULT_TOP_P, GenerationOptions,
};
pub use provider::{
    BoxFuture, LlmProvider, ProviderConfig, ProviderError, ProviderEventStream, ProviderRequest,
    ProviderResult, ProviderStreamHandle, ProviderWorker, StreamEventPayload,
};
pub use rig_adapter::{GEMINI_PROVIDER_ID, GeminiProvider};

pub fn create_provider(mut config: ProviderConfig) -> ProviderResult<Arc<dyn LlmProvider>> {
    if config.provider_id.trim().is_empty() {
        config.provider_id = GEMINI_PROVIDER_ID.to_string();
    }

    match config.provider_id.as_str() {
        "gemini" | "google" => {
            config.provider_id = GEMINI_PROVIDER_ID.to_string();
            Ok(Arc::new(GeminiProvider::new(config)?))
        }
        _ => Err(ProviderError::UnsupportedProvider {
            stage: "create-provider",
            provider_id: config.provider_id,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_provider_id_defaults_to_gemini() {
        let provider = create_provider(ProviderConfig::new("", "test-key", ""))
            .unwrap_or_else(|error| panic!("gemini provider should build: {error}"));
        assert_eq!(provider.id(), GEMINI_PROVIDER_ID);
        assert_eq!(provider.default_model(), DEFAULT_GEMINI_MODEL);
    }

    #[test]
    fn missing_api_key_is_rejected() {
        let result = create_provider(ProviderConfig::new("gemini", "  ", ""));
        assert!(matches!(result, Err(ProviderError::MissingApiKey { .. })));
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let result = create_provider(ProviderConfig::new("openai", "key", ""));
        assert!(matches!(
            result,
            Err(ProviderError::UnsupportedProvider { provider_id, .. }) if provider_id == "openai"
        ));
    }
}
