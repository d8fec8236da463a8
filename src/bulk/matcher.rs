//! Resolves a seller's free-text product description against the catalog.

use crate::models::CatalogProduct;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Similarity policy. All values are in `[0, 1]`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MatcherConfig {
    /// Candidates scoring below this are ignored; if none clear it the row
    /// becomes a new catalog product.
    pub min_similarity: f64,
    /// A lone top candidate must reach this to be matched without review.
    pub high_confidence: f64,
    /// Candidates within this distance of the top score count as tied.
    pub ambiguity_margin: f64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            min_similarity: 0.55,
            high_confidence: 0.85,
            ambiguity_margin: 0.05,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Candidate {
    pub product_id: Uuid,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchDecision {
    Match {
        product_id: Uuid,
        confidence: f64,
        exact: bool,
    },
    Ambiguous {
        candidates: Vec<Candidate>,
    },
    New,
}

struct Entry {
    product_id: Uuid,
    key: String,
    tokens: BTreeSet<String>,
}

/// Matcher over a fixed catalog snapshot. Decisions are a pure function of
/// the snapshot, the config and the input text.
pub struct ProductMatcher {
    config: MatcherConfig,
    entries: Vec<Entry>,
}

impl ProductMatcher {
    pub fn new(config: MatcherConfig, catalog: &[CatalogProduct]) -> Self {
        let mut entries: Vec<Entry> = catalog
            .iter()
            .map(|product| {
                let key = match_key(&product.name, product.brand.as_deref());
                Entry {
                    product_id: product.id,
                    tokens: tokens(&key),
                    key,
                }
            })
            .collect();
        entries.sort_by(|a, b| a.product_id.cmp(&b.product_id));
        Self { config, entries }
    }

    pub fn decide(&self, name: &str, brand: Option<&str>) -> MatchDecision {
        let key = match_key(name, brand);
        if key.is_empty() {
            return MatchDecision::New;
        }
        let query_tokens = tokens(&key);

        let mut scored: Vec<(Candidate, bool)> = self
            .entries
            .iter()
            .filter_map(|entry| {
                let exact = entry.key == key;
                let score = if exact {
                    1.0
                } else {
                    similarity_with_tokens(&key, &query_tokens, &entry.key, &entry.tokens)
                };
                (score >= self.config.min_similarity).then_some((
                    Candidate {
                        product_id: entry.product_id,
                        score,
                    },
                    exact,
                ))
            })
            .collect();

        scored.sort_by(|(a, _), (b, _)| {
            b.score
                .total_cmp(&a.score)
                .then(a.product_id.cmp(&b.product_id))
        });

        let Some(&(top, top_exact)) = scored.first() else {
            return MatchDecision::New;
        };

        let tied: Vec<Candidate> = scored
            .iter()
            .map(|(candidate, _)| *candidate)
            .take_while(|candidate| {
                top.score - candidate.score <= self.config.ambiguity_margin + f64::EPSILON
            })
            .collect();

        if tied.len() > 1 || top.score < self.config.high_confidence {
            return MatchDecision::Ambiguous { candidates: tied };
        }

        MatchDecision::Match {
            product_id: top.product_id,
            confidence: round_score(top.score),
            exact: top_exact,
        }
    }
}

/// Case-folds, turns punctuation into spaces and collapses whitespace.
pub fn normalize(text: &str) -> String {
    text.chars()
        .map(|ch| {
            if ch.is_alphanumeric() {
                ch.to_lowercase().next().unwrap_or(ch)
            } else {
                ' '
            }
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Normalized `brand name`, without repeating a brand the name already
/// starts with. Also the catalog's uniqueness key.
pub fn match_key(name: &str, brand: Option<&str>) -> String {
    let name = normalize(name);
    let brand = brand.map(normalize).filter(|b| !b.is_empty());
    match brand {
        Some(brand) if name == brand || name.starts_with(&format!("{brand} ")) => name,
        Some(brand) if name.is_empty() => brand,
        Some(brand) => format!("{brand} {name}"),
        None => name,
    }
}

/// Best of token-set overlap and edit-distance ratio over normalized text.
fn similarity_with_tokens(
    a: &str,
    a_tokens: &BTreeSet<String>,
    b: &str,
    b_tokens: &BTreeSet<String>,
) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    let shared = a_tokens.intersection(b_tokens).count();
    let dice = (2 * shared) as f64 / (a_tokens.len() + b_tokens.len()) as f64;
    dice.max(levenshtein_ratio(a, b))
}

fn tokens(normalized: &str) -> BTreeSet<String> {
    normalized.split(' ').filter(|t| !t.is_empty()).map(str::to_string).collect()
}

fn levenshtein_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let longest = a.len().max(b.len());
    if longest == 0 {
        return 1.0;
    }
    1.0 - levenshtein(&a, &b) as f64 / longest as f64
}

fn levenshtein(a: &[char], b: &[char]) -> usize {
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

fn round_score(score: f64) -> f64 {
    (score * 1000.0).round() / 1000.0
}
