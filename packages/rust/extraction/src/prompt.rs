//! Fixed instruction and per-batch prompt for the extraction service.

use std::sync::LazyLock;

use chatkb_chat::Batch;
use chatkb_shared::Category;

use crate::service::CompletionRequest;

/// Maximum title length requested from the service.
pub const TITLE_MAX_CHARS: usize = 60;

const USER_PROMPT_HEADER: &str = "Extract knowledge from these chat messages:\n\n";

fn category_hint(category: Category) -> &'static str {
    match category {
        Category::PediatricCare => {
            "doctor and specialist recommendations (name, practice, location, specific notes)"
        }
        Category::PrenatalCare => "obstetrician and midwife recommendations",
        Category::ClassesActivities => {
            "swimming, music, gymnastics, story time (include age range, location, cost if mentioned)"
        }
        Category::Fitness => "postnatal yoga, personal trainers, gyms",
        Category::Dining => "restaurants with stroller access, changing tables, notes",
        Category::Childcare => "daycares, nanny agencies, babysitters, night nurses",
        Category::ProductsGear => "formula, strollers, cribs, gear, nursery items",
        Category::HomeServices => "cleaners, handymen, local services",
        Category::PersonalCare => "hair, massage, self-care for parents",
        Category::LocalTips => "parks, playgrounds, bike spots, local resources, events",
        Category::ParentingTips => "feeding advice, sleep tips, health, development",
        Category::Other => "useful knowledge that fits nowhere else",
    }
}

static SYSTEM_PROMPT: LazyLock<String> = LazyLock::new(|| {
    let categories = Category::ALL
        .iter()
        .map(|c| format!("- \"{}\": {}", c.label(), category_hint(*c)))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "You extract useful, searchable knowledge from community chat conversations.

You will receive messages from a local parents' group chat. Your job is to:
1. Identify messages containing genuinely useful knowledge (recommendations, tips, resources, advice)
2. Extract each piece of knowledge as a structured item
3. Ignore social coordination (meeting times, \"on my way\"), small talk and pure emotional responses

Use these categories (use the EXACT name):
{categories}

Output a JSON array. Each item:
{{
  \"category\": \"exact category name\",
  \"title\": \"concise title under {TITLE_MAX_CHARS} chars\",
  \"content\": \"useful description with key details (names, addresses, prices, age ranges, specific notes)\",
  \"tags\": [\"tag1\", \"tag2\", \"tag3\"]
}}

Rules:
- Use 2-4 lowercase tags per item
- Never include the names of the people who posted, only the information they shared
- Do include names of doctors, businesses and products
- If multiple messages discuss the same thing, combine them into one item
- Return [] if the batch contains no useful knowledge
- Return ONLY a JSON array, no other text"
    )
});

/// The fixed system instruction sent with every batch.
pub fn system_prompt() -> &'static str {
    &SYSTEM_PROMPT
}

/// Build the request for one batch.
pub fn build_request(batch: &Batch) -> CompletionRequest {
    CompletionRequest {
        system: system_prompt().to_string(),
        prompt: format!("{USER_PROMPT_HEADER}{}", batch.render()),
    }
}
