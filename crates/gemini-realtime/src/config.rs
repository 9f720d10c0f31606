use std::time::Duration;

pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";
pub const DEFAULT_MODEL: &str = "models/gemini-2.0-flash-live-001";
pub const DEFAULT_VOICE: &str = "Aoede";
pub const DEFAULT_SETUP_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are a helpful assistant that can manage forms through voice commands. \
You have access to three functions: open_form() opens a new form for data entry, \
fill_field(field_name, value) fills a field with a value, and submit_form() submits the completed form. \
When users want to fill out a form or enter data, first open a form, then fill fields as they provide information, \
and finally submit the form when they are ready. Be conversational and confirm each action. Respond naturally through voice.";

/// Connection settings for one Gemini Live session.
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub endpoint: String,
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
    /// How long `connect()` waits for `setupComplete`.
    pub setup_timeout: Duration,
}

impl GeminiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            setup_timeout: DEFAULT_SETUP_TIMEOUT,
        }
    }

    pub(crate) fn url(&self) -> String {
        format!("{}?key={}", self.endpoint, self.api_key)
    }
}
