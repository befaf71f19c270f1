//! Chat message types and per-call generation configuration.

use serde::{Deserialize, Serialize};

/// Message role in a chat exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A chat message in OpenAI wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// Per-call generation parameters. Each response mode carries its own config;
/// `deterministic_eval` pins temperature to 0 and top_p to 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self { temperature: 0.5, top_p: 0.9, max_tokens: 768 }
    }
}

impl GenerationConfig {
    /// Force deterministic sampling (temperature 0, top_p 1).
    pub fn deterministic(mut self) -> Self {
        self.temperature = 0.0;
        self.top_p = 1.0;
        self
    }
}

/// Statistics collected while streaming a completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamStats {
    pub tokens_generated: usize,
    pub time_to_first_token_ms: Option<u64>,
    pub total_duration_ms: u64,
    pub model_used: String,
}

impl StreamStats {
    pub fn tokens_per_second(&self) -> f32 {
        if self.total_duration_ms == 0 {
            return 0.0;
        }
        self.tokens_generated as f32 / (self.total_duration_ms as f32 / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic_config() {
        let config = GenerationConfig { temperature: 0.7, top_p: 0.9, max_tokens: 512 };
        let det = config.deterministic();
        assert_eq!(det.temperature, 0.0);
        assert_eq!(det.top_p, 1.0);
        assert_eq!(det.max_tokens, 512);
    }

    #[test]
    fn test_tokens_per_second() {
        let stats = StreamStats {
            tokens_generated: 100,
            total_duration_ms: 2000,
            ..Default::default()
        };
        assert!((stats.tokens_per_second() - 50.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_message_roles_serialize_lowercase() {
        let msg = Message::system("hej");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"role\":\"system\""));
    }
}
