//! Heuristic noise filter.
//!
//! Drops messages that carry no durable information before they cost an
//! extraction call. Best-effort: noise that slips through is ignored by the
//! extraction service later.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use chatkb_shared::FilterSettings;

use crate::parser::RawMessage;

/// Why a message was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NoiseKind {
    /// Nothing left after removing mentions and links.
    Empty,
    /// Membership/system notices and media placeholders.
    System,
    /// Reactions, emoji and one-word acknowledgements.
    Reaction,
    /// Below the minimum length.
    TooShort,
    /// Meetup coordination ("on my way", "running late").
    Logistics,
}

/// Outcome of classifying one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Keep; carries the cleaned text.
    Signal(String),
    Noise(NoiseKind),
}

/// A message that survived the filter, with its cleaned text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilteredMessage {
    pub(crate) raw: RawMessage,
    pub(crate) text: String,
}

impl FilteredMessage {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn sender(&self) -> &str {
        &self.raw.sender
    }

    pub fn source(&self) -> &str {
        &self.raw.source
    }
}

// ---------------------------------------------------------------------------
// Phrase lists
// ---------------------------------------------------------------------------

const SYSTEM_MARKERS: &[&str] = &[
    "joined from the community",
    "joined using a group link",
    "joined using this group",
    "was added",
    "left the group",
    "changed the group name",
    "changed the group description",
    "changed the group icon",
    "changed this group's",
    "changed the subject",
    "changed their phone number",
    "changed to a new number",
    "image omitted",
    "video omitted",
    "document omitted",
    "contact card omitted",
    "gif omitted",
    "sticker omitted",
    "audio omitted",
    "this message was deleted",
    "you deleted this message",
    "messages and calls are end-to-end encrypted",
    "this message was edited",
    "created this group",
    "created group",
];

const ACKNOWLEDGEMENTS: &[&str] = &[
    "yes", "no", "ok", "okay", "sure", "great", "perfect", "thanks", "thank you", "amazing",
    "awesome", "love this", "love it", "same", "same here", "me too", "agreed", "absolutely",
    "definitely", "sounds good", "got it", "noted", "of course", "exactly", "nice", "cute",
    "cool", "wow", "oh wow", "sweet", "wonderful", "lovely", "welcome", "hi", "hello", "haha",
    "lol", "yay", "so cute", "congrats", "congratulations", "❤️", "🙏", "👍", "😍", "🥰", "💕",
    "♥️", "❤", "🤍", "💛",
];

const COORDINATION_PHRASES: &[&str] = &[
    "i'm on my way",
    "on my way",
    "i'm here",
    "we're here",
    "almost there",
    "running late",
    "running 5",
    "running ten",
    "min late",
    "mins late",
    "be there in",
    "heading over",
    "heading out",
    "see you soon",
    "see you there",
    "we'll be there",
    "just arrived",
    "just got here",
    "just got to",
    "we are at",
    "we're at",
    "i'm at",
    "i am at",
    "walking over",
    "walking up",
    "walking down",
];

/// Poll headers as exported, each preceded by a left-to-right mark. Matched
/// on the raw text since the mark is stripped before the other checks.
const POLL_MARKERS: &[&str] = &["\u{200e}POLL:", "\u{200e}OPTION:"];

/// Subject words that mark "<subject> left" as conversation, not a notice.
const PERSONAL_SUBJECTS: &[&str] = &["i", "we", "you", "they", "he", "she", "everyone", "just"];

/// Characters stripped from both ends before acknowledgement matching.
const ACK_TRIM: &[char] = &['!', '.', ',', '?', ' ', '🎉', '🎊', '😊', '😀'];

/// `@~Name` mentions as exported, with the name wrapped in U+2068/U+2069 isolates.
static MENTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@\u{2068}[^\u{2069}]*\u{2069}").expect("mention regex"));

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://\S+").expect("url regex"));

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Remove exported @mentions and invisible direction marks; trim.
pub(crate) fn strip_mentions(text: &str) -> String {
    let without = MENTION_RE.replace_all(text, "");
    without
        .chars()
        .filter(|c| !matches!(c, '\u{200e}' | '\u{200f}' | '\u{2068}' | '\u{2069}'))
        .collect::<String>()
        .trim()
        .to_string()
}

fn is_system(lower: &str) -> bool {
    if SYSTEM_MARKERS.iter().any(|m| lower.contains(m)) {
        return true;
    }
    // "<name> left": short notices only, so "we just left" survives.
    lower.ends_with(" left")
        && lower.split_whitespace().count() <= 4
        && !lower
            .split_whitespace()
            .any(|w| PERSONAL_SUBJECTS.contains(&w))
}

fn is_poll(raw: &str) -> bool {
    POLL_MARKERS.iter().any(|m| raw.contains(m))
}

fn is_reaction(text: &str, lower: &str) -> bool {
    if !text.chars().any(char::is_alphanumeric) {
        return true;
    }
    let core = lower.trim_matches(ACK_TRIM);
    ACKNOWLEDGEMENTS.contains(&core)
}

fn is_logistics(lower: &str, settings: &FilterSettings) -> bool {
    lower.chars().count() < settings.logistics_max_chars
        && COORDINATION_PHRASES.iter().any(|p| lower.contains(p))
}

/// Classify one message as signal or noise.
pub fn classify(message: &RawMessage, settings: &FilterSettings) -> Verdict {
    if is_poll(&message.text) {
        return Verdict::Noise(NoiseKind::System);
    }

    let text = strip_mentions(&message.text);
    if URL_RE.replace_all(&text, "").trim().is_empty() {
        return Verdict::Noise(NoiseKind::Empty);
    }

    let lower = text.to_lowercase().replace('\u{2019}', "'");

    if is_system(&lower) {
        return Verdict::Noise(NoiseKind::System);
    }
    if is_reaction(&text, &lower) {
        return Verdict::Noise(NoiseKind::Reaction);
    }
    if text.chars().count() < settings.min_chars {
        return Verdict::Noise(NoiseKind::TooShort);
    }
    if is_logistics(&lower, settings) {
        return Verdict::Noise(NoiseKind::Logistics);
    }

    Verdict::Signal(text)
}

/// Keep the signal messages, in order.
pub fn filter_messages(
    messages: Vec<RawMessage>,
    settings: &FilterSettings,
) -> Vec<FilteredMessage> {
    let total = messages.len();
    let mut dropped: BTreeMap<NoiseKind, usize> = BTreeMap::new();
    let mut kept = Vec::new();

    for raw in messages {
        match classify(&raw, settings) {
            Verdict::Signal(text) => kept.push(FilteredMessage { raw, text }),
            Verdict::Noise(kind) => *dropped.entry(kind).or_default() += 1,
        }
    }

    debug!(total, kept = kept.len(), ?dropped, "noise filter applied");
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(text: &str) -> RawMessage {
        RawMessage {
            source: "test".into(),
            sender: "Jane".into(),
            timestamp: None,
            date: "1/15/24".into(),
            time: "9:00 AM".into(),
            text: text.into(),
        }
    }

    fn verdict(text: &str) -> Verdict {
        classify(&msg(text), &FilterSettings::default())
    }

    #[test]
    fn reactions_and_emoji_are_noise() {
        assert_eq!(verdict("👍"), Verdict::Noise(NoiseKind::Reaction));
        assert_eq!(verdict("Thanks!!"), Verdict::Noise(NoiseKind::Reaction));
        assert_eq!(verdict("so cute 🎉"), Verdict::Noise(NoiseKind::Reaction));
        assert_eq!(verdict("❤️❤️❤️"), Verdict::Noise(NoiseKind::Reaction));
    }

    #[test]
    fn system_notices_are_noise() {
        assert_eq!(verdict("\u{200e}image omitted"), Verdict::Noise(NoiseKind::System));
        assert_eq!(
            verdict("Messages and calls are end-to-end encrypted. No one outside can read them."),
            Verdict::Noise(NoiseKind::System)
        );
        assert_eq!(verdict("Maria left"), Verdict::Noise(NoiseKind::System));
        assert_eq!(
            verdict("Jane changed their phone number to a new number"),
            Verdict::Noise(NoiseKind::System)
        );
    }

    #[test]
    fn personal_left_is_not_a_notice() {
        assert!(is_system("maria left"));
        assert!(!is_system("we just left"));
        assert!(!is_system("we left"));
        assert!(!is_system("i think they left"));
    }

    #[test]
    fn poll_markers_only_match_exported_polls() {
        assert_eq!(
            verdict("\u{200e}POLL:\nBest pediatrician near the park?\n\u{200e}OPTION: Dr. Lee (2 votes)"),
            Verdict::Noise(NoiseKind::System)
        );
        let text = "Another option: Dr. Lee on 86th is great with newborns";
        assert_eq!(verdict(text), Verdict::Signal(text.into()));
    }

    #[test]
    fn left_inside_real_content_survives() {
        let text = "The pharmacy on the left side of Broadway has the formula in stock";
        assert!(matches!(verdict(text), Verdict::Signal(_)));
    }

    #[test]
    fn logistics_and_short_messages_are_noise() {
        assert_eq!(verdict("running 5 min late"), Verdict::Noise(NoiseKind::TooShort));
        assert_eq!(
            verdict("running late, be there in ten minutes!"),
            Verdict::Noise(NoiseKind::Logistics)
        );
        assert_eq!(verdict("see you at 10"), Verdict::Noise(NoiseKind::TooShort));
    }

    #[test]
    fn long_messages_with_coordination_phrases_survive() {
        let text = "On my way to Dr. Smith's office on W 72nd, they have walk-in hours for vaccines every Tuesday morning";
        assert!(matches!(verdict(text), Verdict::Signal(_)));
    }

    #[test]
    fn url_only_messages_are_empty() {
        assert_eq!(verdict("https://example.com/some/page"), Verdict::Noise(NoiseKind::Empty));
    }

    #[test]
    fn mentions_are_stripped_from_signal() {
        let v = verdict("@\u{2068}~Maria\u{2069} Dr. Smith at 123 Main St is a great pediatrician");
        assert_eq!(
            v,
            Verdict::Signal("Dr. Smith at 123 Main St is a great pediatrician".into())
        );
    }

    #[test]
    fn filter_keeps_order() {
        let kept = filter_messages(
            vec![
                msg("First useful message about swim classes at the Y"),
                msg("👍"),
                msg("Second useful message about the 72nd street playground"),
            ],
            &FilterSettings::default(),
        );
        assert_eq!(kept.len(), 2);
        assert!(kept[0].text().starts_with("First"));
        assert!(kept[1].text().starts_with("Second"));
        assert_eq!(kept[0].sender(), "Jane");
    }
}
