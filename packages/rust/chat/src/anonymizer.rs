//! Privacy gate between chat messages and the extraction service.
//!
//! [`AnonymizedMessage`] can only be built here. Everything the batcher and
//! the extraction client accept is made of them, so raw or filtered messages
//! cannot reach the service by any other route.

use regex::Regex;
use tracing::debug;

use crate::filter::{FilteredMessage, strip_mentions};

/// Stand-in for a scrubbed sender name.
const PLACEHOLDER: &str = "[member]";

/// Message text with sender, timestamps and mentions removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnonymizedMessage {
    text: String,
}

impl AnonymizedMessage {
    pub fn text(&self) -> &str {
        &self.text
    }

    /// A slice of an already anonymized text. Used by the batcher when
    /// splitting oversized messages.
    pub(crate) fn fragment(text: String) -> Self {
        Self { text }
    }
}

struct Rule {
    re: Regex,
    /// Sender rules may leave [`PLACEHOLDER`] behind; stamp rules never do.
    sender: bool,
}

/// Single-space a label so exported NBSP or doubled spaces match the
/// collapsed message text.
fn normalize_label(label: &str) -> String {
    label.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

impl Rule {
    /// Case-insensitive match on a sender label. `whole_word` anchors each
    /// edge that is a word character, so "Al" leaves "Alvarez" alone.
    fn sender(label: &str, whole_word: bool) -> Option<Self> {
        let label = normalize_label(label);
        let (first, last) = (label.chars().next()?, label.chars().last()?);
        let body = label
            .split(' ')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(r"\s+");
        let lead = if whole_word && is_word_char(first) { r"\b" } else { "" };
        let trail = if whole_word && is_word_char(last) { r"\b" } else { "" };
        let re = Regex::new(&format!("(?i){lead}{body}{trail}")).ok()?;
        Some(Self { re, sender: true })
    }

    fn literal(s: &str) -> Option<Self> {
        if s.trim().is_empty() {
            return None;
        }
        let re = Regex::new(&regex::escape(s)).ok()?;
        Some(Self { re, sender: false })
    }

    fn apply(&self, text: &str, placeholder: bool) -> String {
        let replacement = if placeholder && self.sender {
            PLACEHOLDER
        } else {
            ""
        };
        self.re.replace_all(text, replacement).into_owned()
    }
}

/// Collapse whitespace runs inside lines and drop blank lines.
fn collapse(text: &str) -> String {
    text.lines()
        .map(|l| l.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Scrubs every known sender label plus each message's own stamp.
///
/// A message's own sender is removed wherever it occurs, even inside a
/// word. Other roster labels only match as whole words.
pub struct Anonymizer {
    roster: Vec<(String, Rule)>,
}

impl Anonymizer {
    /// Build from every sender label seen in the run, including senders whose
    /// messages were filtered out (they can still be named by others).
    pub fn with_roster<'a>(senders: impl IntoIterator<Item = &'a str>) -> Self {
        let mut labels: Vec<String> = senders
            .into_iter()
            .map(normalize_label)
            .filter(|s| !s.is_empty())
            .collect();
        // Longest first so "Jane Doe" is scrubbed before "Jane".
        labels.sort_by(|a, b| b.chars().count().cmp(&a.chars().count()).then(a.cmp(b)));
        labels.dedup_by(|a, b| a.to_lowercase() == b.to_lowercase());

        let roster = labels
            .into_iter()
            .filter_map(|label| Rule::sender(&label, true).map(|rule| (label.to_lowercase(), rule)))
            .collect();
        Self { roster }
    }

    /// Strip identity from one message. Returns `None` when nothing is left.
    pub fn anonymize(&self, message: FilteredMessage) -> Option<AnonymizedMessage> {
        let raw = &message.raw;

        let mut extra: Vec<Rule> = Vec::new();
        let own = normalize_label(&raw.sender).to_lowercase();
        extra.extend(Rule::sender(&raw.sender, false));
        let stamp = raw.stamp();
        let ascii_time = raw.time.replace(|c: char| c.is_whitespace(), " ");
        for literal in [stamp.as_str(), raw.date.as_str(), raw.time.as_str(), ascii_time.as_str()] {
            extra.extend(Rule::literal(literal));
        }

        let rules: Vec<&Rule> = extra
            .iter()
            .chain(
                self.roster
                    .iter()
                    .filter(|(label, _)| *label != own)
                    .map(|(_, rule)| rule),
            )
            .collect();
        // A placeholder some rule would match again is never inserted.
        let placeholder = !rules.iter().any(|rule| rule.re.is_match(PLACEHOLDER));

        let mut text = collapse(&strip_mentions(&message.text));
        let mut first_pass = placeholder;
        loop {
            let before = text.clone();
            for rule in &rules {
                text = rule.apply(&text, first_pass);
            }
            text = collapse(&text);
            first_pass = false;
            if text == before {
                break;
            }
        }

        if text.is_empty() {
            None
        } else {
            Some(AnonymizedMessage { text })
        }
    }

    /// Anonymize in order, dropping messages that end up empty.
    pub fn anonymize_all(&self, messages: Vec<FilteredMessage>) -> Vec<AnonymizedMessage> {
        let total = messages.len();
        let out: Vec<AnonymizedMessage> = messages
            .into_iter()
            .filter_map(|m| {
                let source = m.source().to_string();
                let anonymized = self.anonymize(m);
                if anonymized.is_none() {
                    debug!(%source, "message empty after anonymizing");
                }
                anonymized
            })
            .collect();
        debug!(total, kept = out.len(), roster = self.roster.len(), "messages anonymized");
        out
    }
}
