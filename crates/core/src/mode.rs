//! Response modes and evidence levels.

use serde::{Deserialize, Serialize};

/// Response mode for a query. Each mode carries its own system prompt and
/// generation configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseMode {
    /// Smalltalk, greetings, meta-questions. No retrieval.
    Chat,
    /// Default: helpful answers, general knowledge allowed with separation.
    Assist,
    /// Formal legal answers strictly grounded in retrieved sources.
    Evidence,
}

impl ResponseMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseMode::Chat => "chat",
            ResponseMode::Assist => "assist",
            ResponseMode::Evidence => "evidence",
        }
    }

    /// Parse a caller-supplied mode string. `"auto"` and unknown values
    /// return `None`, meaning the classifier decides.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "chat" => Some(ResponseMode::Chat),
            "assist" => Some(ResponseMode::Assist),
            "evidence" => Some(ResponseMode::Evidence),
            _ => None,
        }
    }
}

impl std::fmt::Display for ResponseMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Evidence confidence level derived from source quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EvidenceLevel {
    /// Multiple high-scoring statute/bill sources.
    High,
    /// Some relevant sources with lower scores.
    Low,
    /// No relevant sources.
    None,
}

impl EvidenceLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceLevel::High => "HIGH",
            EvidenceLevel::Low => "LOW",
            EvidenceLevel::None => "NONE",
        }
    }
}

impl std::fmt::Display for EvidenceLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parse() {
        assert_eq!(ResponseMode::parse("evidence"), Some(ResponseMode::Evidence));
        assert_eq!(ResponseMode::parse("CHAT"), Some(ResponseMode::Chat));
        assert_eq!(ResponseMode::parse("auto"), None);
        assert_eq!(ResponseMode::parse("nonsense"), None);
    }

    #[test]
    fn test_evidence_level_serialization() {
        let json = serde_json::to_string(&EvidenceLevel::High).unwrap();
        assert_eq!(json, "\"HIGH\"");
    }
}
