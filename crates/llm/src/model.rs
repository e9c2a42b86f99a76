pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash-preview-04-17";
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_MAX_OUTPUT_TOKENS: u64 = 2048;
pub const DEFAULT_TOP_K: u32 = 1;
pub const DEFAULT_TOP_P: f64 = 1.0;
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are a helpful and knowledgeable AI assistant. \
     Provide clear, accurate, and engaging responses.";

/// Per-client generation knobs applied to every request the adapter issues.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOptions {
    pub model_id: String,
    pub system_instruction: Option<String>,
    pub temperature: Option<f64>,
    pub max_output_tokens: Option<u64>,
    pub top_k: Option<u32>,
    pub top_p: Option<f64>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_GEMINI_MODEL.to_string(),
            system_instruction: Some(DEFAULT_SYSTEM_INSTRUCTION.to_string()),
            temperature: Some(DEFAULT_TEMPERATURE),
            max_output_tokens: Some(DEFAULT_MAX_OUTPUT_TOKENS),
            top_k: Some(DEFAULT_TOP_K),
            top_p: Some(DEFAULT_TOP_P),
        }
    }
}

impl GenerationOptions {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            ..Self::default()
        }
    }

    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        let instruction = instruction.into();
        self.system_instruction = if instruction.trim().is_empty() {
            None
        } else {
            Some(instruction)
        };
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_output_tokens(mut self, max_output_tokens: u64) -> Self {
        self.max_output_tokens = Some(max_output_tokens);
        self
    }

    pub fn with_top_k(mut self, top_k: u32) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn with_top_p(mut self, top_p: f64) -> Self {
        self.top_p = Some(top_p);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_system_instruction_is_dropped() {
        let options = GenerationOptions::new("gemini-test").with_system_instruction("   ");
        assert_eq!(options.system_instruction, None);
        assert_eq!(options.model_id, "gemini-test");
        assert_eq!(options.temperature, Some(DEFAULT_TEMPERATURE));
    }

    #[test]
    fn defaults_use_greedy_sampling() {
        let options = GenerationOptions::default();
        assert_eq!(options.top_k, Some(1));
        assert_eq!(options.top_p, Some(1.0));
        assert_eq!(options.max_output_tokens, Some(2048));

        let options = options.with_top_k(40).with_top_p(0.95);
        assert_eq!(options.top_k, Some(40));
        assert_eq!(options.top_p, Some(0.95));
    }
}
