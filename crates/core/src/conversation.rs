//! Conversation types.
//!
//! The service is stateless: the caller supplies the full history on every
//! call and nothing is stored between requests. Only the last six turns are
//! ever consulted for decontextualization.

use serde::{Deserialize, Serialize};

/// Maximum number of trailing turns used for decontextualization.
pub const HISTORY_WINDOW: usize = 6;

/// Role of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

/// A single turn in the conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: TurnRole::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: TurnRole::Assistant, content: content.into() }
    }
}

/// The trailing window of a history, newest turns last.
pub fn history_window(history: &[Turn]) -> &[Turn] {
    let start = history.len().saturating_sub(HISTORY_WINDOW);
    &history[start..]
}

/// Render history turns as `"{role}: {content}"` lines for the retriever,
/// dropping turns with empty content.
pub fn render_history(history: &[Turn]) -> Vec<String> {
    history_window(history)
        .iter()
        .filter(|t| !t.content.is_empty())
        .map(|t| {
            let role = match t.role {
                TurnRole::User => "user",
                TurnRole::Assistant => "assistant",
            };
            format!("{}: {}", role, t.content)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_window_truncates() {
        let history: Vec<Turn> = (0..10).map(|i| Turn::user(format!("q{i}"))).collect();
        let window = history_window(&history);
        assert_eq!(window.len(), HISTORY_WINDOW);
        assert_eq!(window[0].content, "q4");
        assert_eq!(window.last().unwrap().content, "q9");
    }

    #[test]
    fn test_render_history_filters_empty() {
        let history = vec![
            Turn::user("Berätta om GDPR."),
            Turn::assistant(""),
            Turn::user("Och samtycke?"),
        ];
        let rendered = render_history(&history);
        assert_eq!(rendered.len(), 2);
        assert_eq!(rendered[0], "user: Berätta om GDPR.");
        assert_eq!(rendered[1], "user: Och samtycke?");
    }

    #[test]
    fn test_empty_history_is_empty() {
        assert!(render_history(&[]).is_empty());
    }
}
