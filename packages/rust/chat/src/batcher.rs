//! Size-bounded batching of anonymized messages.

use chatkb_shared::BatchSettings;
use tracing::debug;

use crate::anonymizer::AnonymizedMessage;

/// Prefix of each rendered message line.
pub const BULLET: &str = "• ";

/// Rendered chars per message beyond its text: the bullet plus a newline.
pub const BULLET_OVERHEAD: usize = 3;

/// An ordered group of messages sent to the extraction service in one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    index: usize,
    messages: Vec<AnonymizedMessage>,
}

impl Batch {
    /// Position of this batch in the run, starting at 0.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn messages(&self) -> &[AnonymizedMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Upper bound on the rendered size, in chars.
    pub fn size(&self) -> usize {
        self.messages.iter().map(message_cost).sum()
    }

    /// The batch as sent to the service: one `• text` line per message.
    pub fn render(&self) -> String {
        self.messages
            .iter()
            .map(|m| format!("{BULLET}{}", m.text()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn message_cost(message: &AnonymizedMessage) -> usize {
    message.text().chars().count() + BULLET_OVERHEAD
}

/// Split text into consecutive pieces of at most `limit` chars, breaking after
/// whitespace when one falls in the back half of a piece. Concatenating the
/// pieces yields the input.
fn split_text(text: &str, limit: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut pieces = Vec::new();
    let mut start = 0;

    while start < chars.len() {
        let mut end = (start + limit).min(chars.len());
        if end < chars.len() {
            if let Some(ws) = chars[start..end].iter().rposition(|c| c.is_whitespace()) {
                if ws + 1 > limit / 2 {
                    end = start + ws + 1;
                }
            }
        }
        pieces.push(chars[start..end].iter().collect());
        start = end;
    }

    pieces
}

/// Partition messages into batches.
///
/// Every batch stays within `max_chars` rendered chars and `max_messages`
/// messages. A message that alone exceeds `max_chars` is split into
/// consecutive fragments.
pub fn make_batches(messages: Vec<AnonymizedMessage>, settings: &BatchSettings) -> Vec<Batch> {
    let max_messages = settings.max_messages.max(1);
    let max_chars = settings.max_chars.max(BULLET_OVERHEAD + 1);
    let text_limit = max_chars - BULLET_OVERHEAD;

    let mut batches: Vec<Batch> = Vec::new();
    let mut current: Vec<AnonymizedMessage> = Vec::new();
    let mut current_size = 0;
    let mut split_count = 0;

    for message in messages {
        let pieces = if message_cost(&message) > max_chars {
            split_count += 1;
            split_text(message.text(), text_limit)
                .into_iter()
                .map(AnonymizedMessage::fragment)
                .collect()
        } else {
            vec![message]
        };

        for piece in pieces {
            let cost = message_cost(&piece);
            if !current.is_empty()
                && (current_size + cost > max_chars || current.len() >= max_messages)
            {
                batches.push(Batch {
                    index: batches.len(),
                    messages: std::mem::take(&mut current),
                });
                current_size = 0;
            }
            current_size += cost;
            current.push(piece);
        }
    }

    if !current.is_empty() {
        batches.push(Batch {
            index: batches.len(),
            messages: current,
        });
    }

    debug!(batches = batches.len(), split_count, max_chars, max_messages, "batches built");
    batches
}
