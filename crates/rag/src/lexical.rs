//! Lexical search using Tantivy (BM25).
//!
//! Keyword retrieval sidecar for hybrid search. The analyzer lowercases and
//! applies the Swedish stemmer; compound expansion happens at query time via
//! [`crate::compound::CompoundSplitter`] so `yttrandefrihetsgrundlagen` also
//! matches documents mentioning `yttrandefrihet`.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::path::Path;
use tantivy::{
    collector::TopDocs,
    query::QueryParser,
    schema::{Field, OwnedValue, Schema, TextFieldIndexing, TextOptions, STORED, STRING},
    tokenizer::{Language, LowerCaser, RemoveLongFilter, SimpleTokenizer, Stemmer, TextAnalyzer},
    Index, IndexReader, IndexWriter, TantivyDocument,
};

use lagrum_core::{Error, LexicalHit, LexicalSearch, Result};

use crate::compound::CompoundSplitter;

/// Lexical index configuration.
#[derive(Debug, Clone)]
pub struct LexicalConfig {
    /// Index directory; in-RAM when `None`.
    pub index_path: Option<String>,
    /// Default result cutoff.
    pub top_k: usize,
    /// Enable Swedish stemming.
    pub stemming: bool,
    /// Enable compound expansion of query terms.
    pub compound_expansion: bool,
}

impl Default for LexicalConfig {
    fn default() -> Self {
        Self { index_path: None, top_k: 20, stemming: true, compound_expansion: true }
    }
}

/// BM25 index over the corpus.
pub struct LexicalIndex {
    index: Index,
    reader: IndexReader,
    writer: RwLock<Option<IndexWriter>>,
    id_field: Field,
    text_field: Field,
    title_field: Field,
    config: LexicalConfig,
    splitter: CompoundSplitter,
}

impl LexicalIndex {
    pub fn new(config: LexicalConfig) -> Result<Self> {
        let mut schema_builder = Schema::builder();

        let text_options = TextOptions::default()
            .set_indexing_options(
                TextFieldIndexing::default()
                    .set_tokenizer("swedish")
                    .set_index_option(tantivy::schema::IndexRecordOption::WithFreqsAndPositions),
            )
            .set_stored();

        let id_field = schema_builder.add_text_field("id", STRING | STORED);
        let text_field = schema_builder.add_text_field("text", text_options.clone());
        let title_field = schema_builder.add_text_field("title", text_options);
        let schema = schema_builder.build();

        let index = if let Some(ref path) = config.index_path {
            let dir = tantivy::directory::MmapDirectory::open(Path::new(path))
                .map_err(|e| Error::Retrieval(format!("lexical index open: {e}")))?;
            Index::open_or_create(dir, schema.clone())
                .map_err(|e| Error::Retrieval(format!("lexical index create: {e}")))?
        } else {
            Index::create_in_ram(schema.clone())
        };

        index.tokenizers().register("swedish", Self::build_analyzer(&config));

        let reader =
            index.reader().map_err(|e| Error::Retrieval(format!("lexical reader: {e}")))?;
        let writer = index
            .writer(50_000_000)
            .map_err(|e| Error::Retrieval(format!("lexical writer: {e}")))?;

        tracing::info!(
            stemming = config.stemming,
            compound_expansion = config.compound_expansion,
            in_memory = config.index_path.is_none(),
            "Lexical index created"
        );

        Ok(Self {
            index,
            reader,
            writer: RwLock::new(Some(writer)),
            id_field,
            text_field,
            title_field,
            config,
            splitter: CompoundSplitter::new(),
        })
    }

    fn build_analyzer(config: &LexicalConfig) -> TextAnalyzer {
        let base = TextAnalyzer::builder(SimpleTokenizer::default())
            .filter(RemoveLongFilter::limit(100))
            .filter(LowerCaser);

        if config.stemming {
            base.filter(Stemmer::new(Language::Swedish)).build()
        } else {
            base.build()
        }
    }

    /// Index a batch of documents. Used by tests and the external indexer
    /// bridge; the query path never writes.
    pub fn add_documents(&self, docs: &[(String, String, String)]) -> Result<()> {
        let mut guard = self.writer.write();
        let writer = guard
            .as_mut()
            .ok_or_else(|| Error::Retrieval("lexical writer closed".to_string()))?;

        for (id, title, text) in docs {
            let mut doc = TantivyDocument::default();
            doc.add_text(self.id_field, id);
            doc.add_text(self.title_field, title);
            doc.add_text(self.text_field, text);
            writer
                .add_document(doc)
                .map_err(|e| Error::Retrieval(format!("lexical add: {e}")))?;
        }
        writer.commit().map_err(|e| Error::Retrieval(format!("lexical commit: {e}")))?;
        self.reader.reload().map_err(|e| Error::Retrieval(format!("lexical reload: {e}")))?;
        Ok(())
    }

    fn search_sync(&self, query: &str, cutoff: usize) -> Result<Vec<LexicalHit>> {
        let expanded = if self.config.compound_expansion {
            self.splitter.expand_query(query)
        } else {
            query.to_string()
        };

        // Strip query-syntax metacharacters; SFS numbers like "2018:218"
        // would otherwise parse as field queries.
        let expanded: String = expanded
            .chars()
            .map(|c| match c {
                ':' | '"' | '\'' | '(' | ')' | '[' | ']' | '{' | '}' | '^' | '~' | '*' | '?'
                | '!' | '\\' | '+' | '-' => ' ',
                _ => c,
            })
            .collect();

        let searcher = self.reader.searcher();
        let parser = QueryParser::for_index(&self.index, vec![self.text_field, self.title_field]);
        let parsed = parser
            .parse_query(&expanded)
            .map_err(|e| Error::Retrieval(format!("lexical query parse: {e}")))?;

        let top_docs = searcher
            .search(&parsed, &TopDocs::with_limit(cutoff.max(1)))
            .map_err(|e| Error::Retrieval(format!("lexical search: {e}")))?;

        let mut hits = Vec::with_capacity(top_docs.len());
        for (score, addr) in top_docs {
            let doc: TantivyDocument = searcher
                .doc(addr)
                .map_err(|e| Error::Retrieval(format!("lexical doc fetch: {e}")))?;
            let field_str = |field: Field| -> String {
                doc.get_first(field)
                    .and_then(|v| match v {
                        OwnedValue::Str(s) => Some(s.clone()),
                        _ => None,
                    })
                    .unwrap_or_default()
            };
            hits.push(LexicalHit {
                id: field_str(self.id_field),
                score,
                text: field_str(self.text_field),
                title: field_str(self.title_field),
            });
        }
        Ok(hits)
    }
}

#[async_trait]
impl LexicalSearch for LexicalIndex {
    async fn search(&self, query: &str, cutoff: usize) -> Result<Vec<LexicalHit>> {
        // Tantivy search is CPU-bound; it is short enough to run inline for
        // the cutoffs used here, but must not panic the runtime on a poison.
        self.search_sync(query, cutoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_with_docs() -> LexicalIndex {
        let index = LexicalIndex::new(LexicalConfig::default()).unwrap();
        index
            .add_documents(&[
                (
                    "sfs-1998-204".to_string(),
                    "Personuppgiftslag (1998:204)".to_string(),
                    "Denna lag har till syfte att skydda människor mot att deras personliga integritet kränks genom behandling av personuppgifter.".to_string(),
                ),
                (
                    "sfs-1949-105".to_string(),
                    "Tryckfrihetsförordning (1949:105)".to_string(),
                    "Med tryckfrihet förstås varje svensk medborgares rätt att utge skrifter.".to_string(),
                ),
                (
                    "guide-1".to_string(),
                    "Att begära ut allmän handling".to_string(),
                    "Så här gör du för att begära ut en allmän handling från en myndighet.".to_string(),
                ),
            ])
            .unwrap();
        index
    }

    #[tokio::test]
    async fn test_basic_search() {
        let index = index_with_docs();
        let hits = index.search("personuppgifter", 10).await.unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].id, "sfs-1998-204");
    }

    #[tokio::test]
    async fn test_stemming_matches_inflections() {
        let index = index_with_docs();
        // "skrifter" indexed; "skrift" should match via the Swedish stemmer
        let hits = index.search("skrift", 10).await.unwrap();
        assert!(hits.iter().any(|h| h.id == "sfs-1949-105"));
    }

    #[tokio::test]
    async fn test_cutoff_respected() {
        let index = index_with_docs();
        let hits = index.search("myndighet handling lag", 1).await.unwrap();
        assert!(hits.len() <= 1);
    }

    #[tokio::test]
    async fn test_no_match_is_empty_not_error() {
        let index = index_with_docs();
        let hits = index.search("kvantfysik", 10).await.unwrap();
        assert!(hits.is_empty());
    }
}
