//! Core domain model and keyword matching for Lookout.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "lookout-core";

/// Kind of page a source points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Group,
    Marketplace,
}

impl SourceKind {
    pub fn label(self) -> &'static str {
        match self {
            SourceKind::Group => "Group",
            SourceKind::Marketplace => "Marketplace",
        }
    }
}

/// One monitored origin: a group page or a marketplace search page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub kind: SourceKind,
    pub url: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Raw listing candidate extracted from page markup. Produced fresh each
/// cycle, never persisted directly.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub source_kind: SourceKind,
    pub source_url: String,
    pub title: String,
    pub body: String,
    pub url: String,
    pub author: Option<String>,
    pub posted_at: Option<DateTime<Utc>>,
}

/// Audit entry for a matched listing. Immutable once written.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchRecord {
    pub source: String,
    pub author: String,
    pub content: String,
    pub group_url: Option<String>,
    pub post_time: Option<DateTime<Utc>>,
    pub found_at: DateTime<Utc>,
}

/// Character-safe truncation for notification summaries.
pub fn clip(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Reduces a word to its base lexical form. Implementations must not fail:
/// a token no rule applies to passes through unchanged.
pub trait Lemmatizer: Send + Sync {
    fn lemma(&self, word: &str) -> String;
}

/// Noun-plural reduction: a small irregular dictionary plus suffix rules.
///
/// Lemma-level matching tolerates inflection ("book" vs "books") better
/// than exact-token matching. False positives from over-reduction just cost
/// a dismissable alert; false negatives cost a missed listing.
#[derive(Debug, Default, Clone, Copy)]
pub struct DictionaryLemmatizer;

// Sorted for binary search.
const IRREGULAR_PLURALS: &[(&str, &str)] = &[
    ("children", "child"),
    ("feet", "foot"),
    ("geese", "goose"),
    ("men", "man"),
    ("mice", "mouse"),
    ("people", "person"),
    ("teeth", "tooth"),
    ("women", "woman"),
];

impl Lemmatizer for DictionaryLemmatizer {
    fn lemma(&self, word: &str) -> String {
        if let Ok(idx) = IRREGULAR_PLURALS.binary_search_by_key(&word, |(plural, _)| *plural) {
            return IRREGULAR_PLURALS[idx].1.to_string();
        }
        if word.len() > 4 && word.ends_with("ies") {
            return format!("{}y", &word[..word.len() - 3]);
        }
        if word.len() > 4
            && ["sses", "xes", "ches", "shes", "zes"]
                .iter()
                .any(|suffix| word.ends_with(suffix))
        {
            return word[..word.len() - 2].to_string();
        }
        if word.len() > 3
            && word.ends_with('s')
            && !word.ends_with("ss")
            && !word.ends_with("us")
            && !word.ends_with("is")
        {
            return word[..word.len() - 1].to_string();
        }
        word.to_string()
    }
}

/// Lowercase and split into word tokens on non-alphanumeric boundaries.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

/// Lemma-normalized keyword set. Built once at startup, immutable for the
/// process lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordProfile {
    lemmas: HashSet<String>,
}

impl KeywordProfile {
    pub fn build(keywords: &[String], lemmatizer: &dyn Lemmatizer) -> Self {
        let lemmas = keywords
            .iter()
            .flat_map(|keyword| tokenize(keyword))
            .map(|token| lemmatizer.lemma(&token))
            .collect();
        Self { lemmas }
    }

    pub fn is_empty(&self) -> bool {
        self.lemmas.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lemmas.len()
    }

    pub fn contains_lemma(&self, lemma: &str) -> bool {
        self.lemmas.contains(lemma)
    }
}

/// Tests free text for membership against a keyword profile.
pub struct TextMatcher {
    profile: KeywordProfile,
    lemmatizer: Box<dyn Lemmatizer>,
}

impl TextMatcher {
    pub fn new(profile: KeywordProfile, lemmatizer: Box<dyn Lemmatizer>) -> Self {
        Self {
            profile,
            lemmatizer,
        }
    }

    /// True iff any lemma of `text` is in the profile. Empty or
    /// whitespace-only text never matches.
    pub fn matches(&self, text: &str) -> bool {
        if text.trim().is_empty() {
            return false;
        }
        tokenize(text)
            .iter()
            .any(|token| self.profile.contains_lemma(&self.lemmatizer.lemma(token)))
    }
}
