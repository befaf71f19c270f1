//! Indexed document types.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// An indexed passage. Immutable once indexed; the service only reads these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Opaque identifier.
    pub id: String,
    /// Document title.
    pub title: String,
    /// Passage body or snippet.
    pub content: String,
    /// Document-type tag: "sfs", "prop", "sou", "guide", "research", ...
    pub doc_type: Option<String>,
    /// Originating collection name.
    pub collection: String,
    /// Optional document date (ISO-8601 string as stored in the index).
    pub date: Option<String>,
    /// Remaining metadata.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Document {
    pub fn new(id: impl Into<String>, title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            content: content.into(),
            doc_type: None,
            collection: String::new(),
            date: None,
            metadata: HashMap::new(),
        }
    }
}
