//! Validation of extraction replies into candidate items.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use chatkb_shared::{CandidateItem, Category, ChatKbError, Result};

static OPEN_FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^```(?:json|JSON)?\s*").expect("valid open fence regex"));

static CLOSE_FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*```$").expect("valid close fence regex"));

/// One element as the service writes it. Everything is checked afterwards.
#[derive(Debug, Deserialize)]
struct WireItem {
    category: String,
    title: String,
    content: String,
    #[serde(default)]
    tags: Vec<String>,
}

fn strip_fences(reply: &str) -> &str {
    let trimmed = reply.trim();
    let start = OPEN_FENCE_RE.find(trimmed).map_or(0, |m| m.end());
    let body = &trimmed[start..];
    let end = CLOSE_FENCE_RE.find(body).map_or(body.len(), |m| m.start());
    &body[..end]
}

/// Lowercase, trim, drop a leading `#`, collapse inner whitespace.
pub fn normalize_tag(tag: &str) -> Option<String> {
    let tag = tag.trim().trim_start_matches('#');
    let folded = tag
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    (!folded.is_empty()).then_some(folded)
}

fn validate(wire: WireItem) -> Option<CandidateItem> {
    let title = wire.title.trim();
    let content = wire.content.trim();
    if title.is_empty() || content.is_empty() {
        return None;
    }

    let category = Category::coerce(&wire.category);
    if category == Category::Other && !wire.category.trim().eq_ignore_ascii_case("other") {
        debug!(category = %wire.category, "unknown category mapped to Other");
    }

    let tags: BTreeSet<String> = wire.tags.iter().filter_map(|t| normalize_tag(t)).collect();

    Some(CandidateItem {
        category,
        title: title.to_string(),
        content: content.to_string(),
        tags,
    })
}

/// Parse a reply into candidate items.
///
/// The reply must be a JSON array, optionally wrapped in a Markdown code
/// fence. Elements that do not match the item schema are dropped one by one;
/// anything that is not an array is a [`ChatKbError::MalformedResponse`].
pub fn parse_reply(reply: &str) -> Result<Vec<CandidateItem>> {
    let body = strip_fences(reply);
    let value: Value = serde_json::from_str(body)
        .map_err(|e| ChatKbError::MalformedResponse(format!("reply is not JSON: {e}")))?;

    let Value::Array(elements) = value else {
        return Err(ChatKbError::MalformedResponse(
            "reply is not a JSON array".into(),
        ));
    };

    let total = elements.len();
    let items: Vec<CandidateItem> = elements
        .into_iter()
        .enumerate()
        .filter_map(|(i, element)| match serde_json::from_value::<WireItem>(element) {
            Ok(wire) => {
                let item = validate(wire);
                if item.is_none() {
                    debug!(element = i, "dropping item with empty title or content");
                }
                item
            }
            Err(e) => {
                debug!(element = i, error = %e, "dropping item that does not match schema");
                None
            }
        })
        .collect();

    debug!(total, kept = items.len(), "reply parsed");
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_array() {
        let reply = r#"[{"category":"Pediatricians & Specialists","title":"Dr. Smith","content":"Dr. Smith at Tribeca Pediatrics is great with newborns","tags":["Pediatrician","newborn"]}]"#;
        let items = parse_reply(reply).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].category, Category::PediatricCare);
        assert_eq!(items[0].title, "Dr. Smith");
        assert!(items[0].tags.contains("pediatrician"));
    }

    #[test]
    fn strips_code_fences() {
        let reply = "```json\n[{\"category\":\"OB/GYNs\",\"title\":\"Dr. Lee\",\"content\":\"Very calm OB\",\"tags\":[]}]\n```";
        let items = parse_reply(reply).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].category, Category::PrenatalCare);

        assert!(parse_reply("```\n[]\n```").unwrap().is_empty());
    }

    #[test]
    fn empty_array_is_ok() {
        assert!(parse_reply("[]").unwrap().is_empty());
    }

    #[test]
    fn non_array_is_malformed() {
        let err = parse_reply(r#"{"items": []}"#).unwrap_err();
        assert!(matches!(err, ChatKbError::MalformedResponse(_)));

        let err = parse_reply("Sorry, I can't help with that.").unwrap_err();
        assert!(matches!(err, ChatKbError::MalformedResponse(_)));
    }

    #[test]
    fn bad_elements_are_dropped_individually() {
        let reply = r##"[
            {"category":"Home Services","title":"Good plumber","content":"Ask for Joe at ABC Plumbing","tags":["plumber"]},
            {"category":"Home Services","title":"","content":"no title"},
            {"category":"Home Services","content":"missing title field"},
            "just a string",
            {"category":"Made Up","title":"Farmers market","content":"Saturdays at 77th St","tags":["  Market ", "#Food", "", "market"]}
        ]"##;
        let items = parse_reply(reply).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].title, "Good plumber");
        assert_eq!(items[1].category, Category::Other);
        let tags: Vec<_> = items[1].tags.iter().map(String::as_str).collect();
        assert_eq!(tags, ["food", "market"]);
    }

    #[test]
    fn legacy_local_tips_label_is_accepted() {
        let reply = r#"[{"category":"UWS Local Tips","title":"Splash pad","content":"Open from June","tags":["park"]}]"#;
        let items = parse_reply(reply).unwrap();
        assert_eq!(items[0].category, Category::LocalTips);
    }
}
