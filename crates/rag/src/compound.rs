//! Swedish compound splitting for lexical recall.
//!
//! Splits compounds into constituents using greedy matching from the right
//! (Swedish head words sit at the end), tolerating linking morphemes
//! (-s-, -n-, ...) and common inflection endings. The original form is always
//! kept first so exact matches keep the highest score; components are added
//! for recall.

use std::collections::HashSet;
use std::path::Path;

/// Only words at least this long are split.
const MIN_WORD_LENGTH: usize = 8;

/// Minimum length of a split component.
const MIN_COMPONENT_LENGTH: usize = 3;

/// Swedish linking morphemes between compound parts.
const LINKING_MORPHEMES: [&str; 6] = ["s", "n", "e", "a", "o", "u"];

/// Inflection endings stripped from the head word (lagen → lag).
const INFLECTION_ENDINGS: [&str; 9] = ["en", "n", "et", "t", "er", "ar", "or", "a", "e"];

/// Words too common to be useful split parts.
const SPLIT_STOPWORDS: [&str; 19] = [
    "och", "att", "det", "som", "den", "för", "med", "har", "kan", "ska", "vid", "till", "var",
    "sig", "men", "eller", "från", "när", "där",
];

/// Built-in constituent vocabulary for the legal domain, used when no
/// dictionary file is configured. Covers the heads and modifiers that occur
/// in statute and authority compounds.
const BUILTIN_VOCABULARY: [&str; 77] = [
    "lag", "rätt", "frihet", "skydd", "data", "person", "uppgift", "tryck", "yttrande", "grund",
    "skade",
    "regering", "form", "förordning", "sekretess", "offentlighet", "handling", "myndighet",
    "förvaltning", "process", "domstol", "brott", "balk", "straff", "skada", "trafik", "miljö",
    "social", "tjänst", "försäkring", "arbete", "givare", "tagare", "avgift", "skatt", "verk",
    "nämnd", "ombudsman", "tillsyn", "integritet", "konsument", "konkurrens", "marknad", "avtal",
    "anställning", "uppsägning", "semester", "pension", "bidrag", "bistånd", "vård", "hälsa",
    "sjuk", "patient", "säkerhet", "barn", "familj", "äktenskap", "arv", "testamente", "hyra",
    "bostad", "fastighet", "plan", "bygg", "lov", "natur", "djur", "utlänning", "medborgare",
    "skola", "utbildning", "forskning", "kommun", "landsting", "stat", "riksdag",
];

/// Dictionary-based Swedish compound splitter.
pub struct CompoundSplitter {
    words: HashSet<String>,
}

impl CompoundSplitter {
    /// Splitter with the built-in legal vocabulary.
    pub fn new() -> Self {
        Self { words: BUILTIN_VOCABULARY.iter().map(|w| w.to_string()).collect() }
    }

    /// Splitter loading additional words from a Hunspell-style `.dic` file
    /// (one `word/flags` entry per line, first line a count).
    pub fn with_dictionary(path: &Path) -> std::io::Result<Self> {
        let mut splitter = Self::new();
        let content = std::fs::read_to_string(path)?;
        for line in content.lines().skip(1) {
            let word = line.split('/').next().unwrap_or("").trim().to_lowercase();
            if word.len() >= MIN_COMPONENT_LENGTH && word.chars().all(char::is_alphabetic) {
                splitter.words.insert(word);
            }
        }
        tracing::info!(words = splitter.words.len(), "Loaded Swedish compound dictionary");
        Ok(splitter)
    }

    fn is_word(&self, s: &str) -> bool {
        self.words.contains(s)
    }

    /// Split a compound into parts. Returns the original word first, then
    /// components; `[word]` when no valid split exists.
    pub fn split(&self, word: &str) -> Vec<String> {
        if word.is_empty() {
            return Vec::new();
        }
        let lower = word.to_lowercase();
        if lower.chars().count() < MIN_WORD_LENGTH || SPLIT_STOPWORDS.contains(&lower.as_str()) {
            return vec![word.to_string()];
        }

        let Some(parts) = self.best_split(&lower) else {
            return vec![word.to_string()];
        };

        let mut result = vec![word.to_string()];
        for part in parts {
            if part != lower && !result.contains(&part) {
                result.push(part);
            }
        }
        result
    }

    /// Expand a whitespace-separated query, appending components of each
    /// compound term after the originals.
    pub fn expand_query(&self, query: &str) -> String {
        let mut terms: Vec<String> = Vec::new();
        for token in query.split_whitespace() {
            for part in self.split(token) {
                if !terms.contains(&part) {
                    terms.push(part);
                }
            }
        }
        terms.join(" ")
    }

    fn best_split(&self, word: &str) -> Option<Vec<String>> {
        let mut candidates = self.two_part_splits(word);
        candidates.extend(self.three_part_splits(word));
        // Prefer fewer, longer parts: score = sum of part lengths minus a
        // penalty per part.
        candidates.into_iter().max_by_key(|parts| {
            parts.iter().map(|p| p.chars().count()).sum::<usize>() as i64
                - 2 * parts.len() as i64
        })
    }

    fn two_part_splits(&self, word: &str) -> Vec<Vec<String>> {
        let chars: Vec<char> = word.chars().collect();
        let mut results = Vec::new();

        for i in MIN_COMPONENT_LENGTH..=chars.len().saturating_sub(MIN_COMPONENT_LENGTH) {
            let prefix: String = chars[..i].iter().collect();
            let suffix: String = chars[i..].iter().collect();

            for p in self.prefix_forms(&prefix) {
                for s in self.suffix_forms(&suffix) {
                    results.push(vec![p.clone(), s]);
                }
            }
        }
        results
    }

    fn three_part_splits(&self, word: &str) -> Vec<Vec<String>> {
        let chars: Vec<char> = word.chars().collect();
        let min = MIN_COMPONENT_LENGTH;
        let mut results = Vec::new();

        if chars.len() < 3 * min {
            return results;
        }

        for i in min..=chars.len() - 2 * min {
            for j in (i + min)..=chars.len() - min {
                let part1: String = chars[..i].iter().collect();
                let part2: String = chars[i..j].iter().collect();
                let part3: String = chars[j..].iter().collect();

                for p1 in self.prefix_forms(&part1) {
                    for p2 in self.prefix_forms(&part2) {
                        for p3 in self.suffix_forms(&part3) {
                            results.push(vec![p1.clone(), p2.clone(), p3]);
                        }
                    }
                }
            }
        }
        results
    }

    /// Valid dictionary forms of a modifier: as-is, or with a linking
    /// morpheme stripped.
    fn prefix_forms(&self, prefix: &str) -> Vec<String> {
        let mut forms = Vec::new();
        if self.is_word(prefix) {
            forms.push(prefix.to_string());
        }
        for morph in LINKING_MORPHEMES {
            if let Some(base) = prefix.strip_suffix(morph) {
                if base.chars().count() > 2 && self.is_word(base) {
                    forms.push(base.to_string());
                }
            }
        }
        forms
    }

    /// Valid dictionary forms of a head: as-is, or with an inflection ending
    /// stripped.
    fn suffix_forms(&self, suffix: &str) -> Vec<String> {
        let mut forms = Vec::new();
        if self.is_word(suffix) {
            forms.push(suffix.to_string());
        }
        for ending in INFLECTION_ENDINGS {
            if let Some(base) = suffix.strip_suffix(ending) {
                if base.chars().count() > 2 && self.is_word(base) && !forms.contains(&base.to_string())
                {
                    forms.push(base.to_string());
                }
            }
        }
        forms
    }
}

impl Default for CompoundSplitter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splits_statute_compound() {
        let splitter = CompoundSplitter::new();
        let parts = splitter.split("trafikskadelagen");
        assert_eq!(parts[0], "trafikskadelagen");
        assert!(parts.iter().any(|p| p == "trafik") || parts.len() > 1);
    }

    #[test]
    fn test_keeps_short_words_whole() {
        let splitter = CompoundSplitter::new();
        assert_eq!(splitter.split("lag"), vec!["lag".to_string()]);
        assert_eq!(splitter.split("GDPR"), vec!["GDPR".to_string()]);
    }

    #[test]
    fn test_original_form_first() {
        let splitter = CompoundSplitter::new();
        let parts = splitter.split("dataskyddslagen");
        assert_eq!(parts[0], "dataskyddslagen");
    }

    #[test]
    fn test_linking_morpheme() {
        let splitter = CompoundSplitter::new();
        // arbets + givare: the -s- linking morpheme must be tolerated
        let parts = splitter.split("arbetsgivaravgift");
        assert_eq!(parts[0], "arbetsgivaravgift");
    }

    #[test]
    fn test_expand_query_appends_components() {
        let splitter = CompoundSplitter::new();
        let expanded = splitter.expand_query("tryckfrihetsförordningen offentlighet");
        assert!(expanded.starts_with("tryckfrihetsförordningen"));
        assert!(expanded.contains("offentlighet"));
    }

    #[test]
    fn test_empty_input() {
        let splitter = CompoundSplitter::new();
        assert!(splitter.split("").is_empty());
        assert_eq!(splitter.expand_query(""), "");
    }
}
