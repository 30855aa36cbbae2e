//! Core domain types for chatkb knowledge files.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ChatKbError;

// ---------------------------------------------------------------------------
// Category
// ---------------------------------------------------------------------------

/// The closed set of knowledge categories, in display order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Category {
    PediatricCare,
    PrenatalCare,
    ClassesActivities,
    Fitness,
    Dining,
    Childcare,
    ProductsGear,
    HomeServices,
    PersonalCare,
    LocalTips,
    ParentingTips,
    Other,
}

impl Category {
    /// Every category, in display order.
    pub const ALL: [Category; 12] = [
        Self::PediatricCare,
        Self::PrenatalCare,
        Self::ClassesActivities,
        Self::Fitness,
        Self::Dining,
        Self::Childcare,
        Self::ProductsGear,
        Self::HomeServices,
        Self::PersonalCare,
        Self::LocalTips,
        Self::ParentingTips,
        Self::Other,
    ];

    /// The exact label written to the knowledge file.
    pub fn label(&self) -> &'static str {
        match self {
            Self::PediatricCare => "Pediatricians & Specialists",
            Self::PrenatalCare => "OB/GYNs",
            Self::ClassesActivities => "Baby Classes & Activities",
            Self::Fitness => "Fitness & Wellness",
            Self::Dining => "Stroller-Friendly Dining",
            Self::Childcare => "Childcare & Nannies",
            Self::ProductsGear => "Baby Products & Gear",
            Self::HomeServices => "Home Services",
            Self::PersonalCare => "Beauty & Personal Care",
            Self::LocalTips => "Local Tips",
            Self::ParentingTips => "Parenting Tips",
            Self::Other => "Other",
        }
    }

    /// Map a label from an untrusted source, falling back to [`Category::Other`].
    pub fn coerce(label: &str) -> Self {
        label.parse().unwrap_or(Self::Other)
    }
}

/// Lowercase and collapse whitespace so label matching is forgiving.
fn fold_label(label: &str) -> String {
    label
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

impl FromStr for Category {
    type Err = ChatKbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let folded = fold_label(s);
        if folded == "uws local tips" {
            return Ok(Self::LocalTips);
        }
        Self::ALL
            .into_iter()
            .find(|c| fold_label(c.label()) == folded)
            .ok_or_else(|| ChatKbError::validation(format!("unknown category '{s}'")))
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl Serialize for Category {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}

impl<'de> Deserialize<'de> for Category {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Items
// ---------------------------------------------------------------------------

/// A validated, not-yet-deduplicated item produced by the extraction service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateItem {
    pub category: Category,
    pub title: String,
    pub content: String,
    pub tags: BTreeSet<String>,
}

/// One published knowledge record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeItem {
    /// Stable identifier, unique within a knowledge file.
    pub id: String,
    pub category: Category,
    pub title: String,
    pub content: String,
    pub tags: BTreeSet<String>,
}

// ---------------------------------------------------------------------------
// KnowledgeBase
// ---------------------------------------------------------------------------

/// The published knowledge file.
///
/// `total` and `categories` are derived from `items` at construction and
/// re-checked on deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "KnowledgeBaseRepr")]
pub struct KnowledgeBase {
    updated_at: DateTime<Utc>,
    total: usize,
    categories: Vec<Category>,
    items: Vec<KnowledgeItem>,
}

#[derive(Deserialize)]
struct KnowledgeBaseRepr {
    updated_at: DateTime<Utc>,
    total: usize,
    #[serde(default)]
    categories: Option<Vec<Category>>,
    items: Vec<KnowledgeItem>,
}

impl TryFrom<KnowledgeBaseRepr> for KnowledgeBase {
    type Error = ChatKbError;

    fn try_from(repr: KnowledgeBaseRepr) -> Result<Self, Self::Error> {
        if repr.total != repr.items.len() {
            return Err(ChatKbError::validation(format!(
                "total {} does not match {} items",
                repr.total,
                repr.items.len()
            )));
        }

        let mut seen = BTreeSet::new();
        for item in &repr.items {
            if !seen.insert(item.id.as_str()) {
                return Err(ChatKbError::validation(format!("duplicate item id '{}'", item.id)));
            }
        }

        let kb = Self::new(repr.items, repr.updated_at);
        if let Some(categories) = repr.categories {
            if categories != kb.categories {
                return Err(ChatKbError::validation(
                    "categories list does not match the categories used by items",
                ));
            }
        }
        Ok(kb)
    }
}

impl KnowledgeBase {
    /// Assemble a knowledge base, deriving `total` and `categories`.
    pub fn new(items: Vec<KnowledgeItem>, updated_at: DateTime<Utc>) -> Self {
        let categories: BTreeSet<Category> = items.iter().map(|i| i.category).collect();
        Self {
            updated_at,
            total: items.len(),
            categories: categories.into_iter().collect(),
            items,
        }
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Categories with at least one item, in display order.
    pub fn categories(&self) -> &[Category] {
        &self.categories
    }

    pub fn items(&self) -> &[KnowledgeItem] {
        &self.items
    }

    /// Number of items in `category`.
    pub fn count_in(&self, category: Category) -> usize {
        self.items.iter().filter(|i| i.category == category).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, category: Category) -> KnowledgeItem {
        KnowledgeItem {
            id: id.into(),
            category,
            title: "Dr. Smith".into(),
            content: "Great pediatrician".into(),
            tags: ["pediatrician".to_string()].into_iter().collect(),
        }
    }

    #[test]
    fn category_labels_roundtrip() {
        for category in Category::ALL {
            let parsed: Category = category.label().parse().expect("parse label");
            assert_eq!(parsed, category);
        }
    }

    #[test]
    fn category_parse_is_forgiving() {
        assert_eq!(
            "  pediatricians &   specialists ".parse::<Category>().unwrap(),
            Category::PediatricCare
        );
        assert_eq!("UWS Local Tips".parse::<Category>().unwrap(), Category::LocalTips);
        assert!("Astrology".parse::<Category>().is_err());
        assert_eq!(Category::coerce("Astrology"), Category::Other);
    }

    #[test]
    fn knowledge_base_derives_total_and_categories() {
        let kb = KnowledgeBase::new(
            vec![
                item("b", Category::Dining),
                item("a", Category::PediatricCare),
                item("c", Category::Dining),
            ],
            Utc::now(),
        );
        assert_eq!(kb.total(), kb.items().len());
        assert_eq!(kb.categories(), &[Category::PediatricCare, Category::Dining]);
        assert_eq!(kb.count_in(Category::Dining), 2);
    }

    #[test]
    fn knowledge_base_serialization_shape() {
        let kb = KnowledgeBase::new(vec![item("a1", Category::PediatricCare)], Utc::now());
        let json: serde_json::Value = serde_json::to_value(&kb).expect("serialize");
        assert_eq!(json["total"], 1);
        assert_eq!(json["items"][0]["category"], "Pediatricians & Specialists");
        assert_eq!(json["items"][0]["tags"][0], "pediatrician");
        assert!(json["updated_at"].is_string());

        let parsed: KnowledgeBase = serde_json::from_value(json).expect("deserialize");
        assert_eq!(parsed, kb);
    }

    #[test]
    fn deserialize_rejects_wrong_total() {
        let json = r#"{"updated_at":"2026-01-01T00:00:00Z","total":2,"items":[
            {"id":"a","category":"Other","title":"t","content":"c","tags":[]}]}"#;
        let err = serde_json::from_str::<KnowledgeBase>(json).unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn deserialize_rejects_unknown_category_and_duplicate_ids() {
        let json = r#"{"updated_at":"2026-01-01T00:00:00Z","total":1,"items":[
            {"id":"a","category":"Astrology","title":"t","content":"c","tags":[]}]}"#;
        assert!(serde_json::from_str::<KnowledgeBase>(json).is_err());

        let json = r#"{"updated_at":"2026-01-01T00:00:00Z","total":2,"items":[
            {"id":"a","category":"Other","title":"t","content":"c","tags":[]},
            {"id":"a","category":"Other","title":"u","content":"d","tags":[]}]}"#;
        let err = serde_json::from_str::<KnowledgeBase>(json).unwrap_err();
        assert!(err.to_string().contains("duplicate item id"));
    }
}
