//! Cross-batch and cross-file merging of candidate items.
//!
//! Two candidates are duplicates when they share a category and their
//! [`similarity`] reaches the configured threshold. Merging repeats until a
//! full pass changes nothing, so running the result through again is a no-op.

use std::collections::{BTreeSet, HashSet};

use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use chatkb_shared::{CandidateItem, DedupSettings, KnowledgeItem};

/// Hex chars of the SHA-256 digest kept in an item id.
const ID_HEX_LEN: usize = 12;

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "at", "be", "by", "for", "from", "has", "have", "in", "is", "it",
    "its", "of", "on", "or", "so", "that", "the", "their", "this", "to", "was", "we", "were",
    "with", "you", "your",
];

/// Lowercase alphanumerics only.
pub fn normalize(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

fn tokens(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .filter(|w| !STOP_WORDS.contains(&w.as_str()))
        .collect()
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(b).count();
    let union = a.len() + b.len() - shared;
    shared as f64 / union as f64
}

// ---------------------------------------------------------------------------
// Working set
// ---------------------------------------------------------------------------

struct Entry {
    item: CandidateItem,
    title_norm: String,
    title_tokens: BTreeSet<String>,
    content_tokens: BTreeSet<String>,
}

impl Entry {
    fn new(item: CandidateItem) -> Self {
        let mut entry = Self {
            item,
            title_norm: String::new(),
            title_tokens: BTreeSet::new(),
            content_tokens: BTreeSet::new(),
        };
        entry.reindex();
        entry
    }

    fn reindex(&mut self) {
        self.title_norm = normalize(&self.item.title);
        self.title_tokens = tokens(&self.item.title);
        self.content_tokens = tokens(&self.item.content);
    }

    /// Fold `other` into `self`. The longer content wins along with its
    /// title; ties keep `self`.
    fn absorb(&mut self, other: Entry) {
        let Entry { item, .. } = other;
        if item.content.chars().count() > self.item.content.chars().count() {
            self.item.title = item.title;
            self.item.content = item.content;
            self.reindex();
        }
        self.item.tags.extend(item.tags);
    }
}

fn entry_similarity(a: &Entry, b: &Entry) -> f64 {
    if !a.title_norm.is_empty() && a.title_norm == b.title_norm {
        return 1.0;
    }
    jaccard(&a.title_tokens, &b.title_tokens).max(jaccard(&a.content_tokens, &b.content_tokens))
}

/// Similarity of two candidates in `[0, 1]`, ignoring category.
pub fn similarity(a: &CandidateItem, b: &CandidateItem) -> f64 {
    entry_similarity(&Entry::new(a.clone()), &Entry::new(b.clone()))
}

/// One merge pass in first-seen order. Returns the survivors and the number
/// of merges.
fn merge_pass(entries: Vec<Entry>, threshold: f64) -> (Vec<Entry>, usize) {
    let mut out: Vec<Entry> = Vec::with_capacity(entries.len());
    let mut merges = 0;

    for entry in entries {
        let target = out.iter_mut().find(|kept| {
            kept.item.category == entry.item.category
                && entry_similarity(kept, &entry) >= threshold
        });
        match target {
            Some(kept) => {
                kept.absorb(entry);
                merges += 1;
            }
            None => out.push(entry),
        }
    }

    (out, merges)
}

/// Stable id from category, normalized title and normalized content.
pub fn item_id(item: &CandidateItem) -> String {
    let mut hasher = Sha256::new();
    hasher.update(item.category.label().as_bytes());
    hasher.update(b"|");
    hasher.update(normalize(&item.title).as_bytes());
    hasher.update(b"|");
    hasher.update(normalize(&item.content).as_bytes());
    let hex = format!("{:x}", hasher.finalize());
    hex[..ID_HEX_LEN].to_string()
}

// ---------------------------------------------------------------------------
// Public entry point
// ---------------------------------------------------------------------------

/// Merge near-duplicates and assign ids.
///
/// Output is ordered by category display order, then by the order in which
/// each surviving item was first seen.
#[instrument(skip_all, fields(candidates = candidates.len(), threshold = settings.similarity_threshold))]
pub fn deduplicate(candidates: Vec<CandidateItem>, settings: &DedupSettings) -> Vec<KnowledgeItem> {
    let threshold = settings.similarity_threshold;
    let mut entries: Vec<Entry> = candidates.into_iter().map(Entry::new).collect();
    let mut passes = 0;
    let mut total_merges = 0;

    loop {
        passes += 1;
        let (next, merges) = merge_pass(entries, threshold);
        entries = next;
        total_merges += merges;
        if merges == 0 {
            break;
        }
    }

    // Stable: first-seen order survives within each category.
    entries.sort_by_key(|e| e.item.category);

    let mut used: HashSet<String> = HashSet::with_capacity(entries.len());
    let items: Vec<KnowledgeItem> = entries
        .into_iter()
        .map(|entry| {
            let base = item_id(&entry.item);
            let mut id = base.clone();
            let mut n = 2;
            while !used.insert(id.clone()) {
                id = format!("{base}-{n}");
                n += 1;
            }
            let CandidateItem {
                category,
                title,
                content,
                tags,
            } = entry.item;
            KnowledgeItem {
                id,
                category,
                title,
                content,
                tags,
            }
        })
        .collect();

    debug!(passes, merges = total_merges, items = items.len(), "deduplication finished");
    items
}
