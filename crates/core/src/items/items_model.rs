//! Item domain model, drafts and patches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::constants::MAX_ITEM_TEXT_CHARS;
use crate::errors::{Error, Result};

/// Item priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(Error::invalid_item(format!("Unknown priority '{}'", other))),
        }
    }
}

/// The synchronized unit. `id` is the primary key for every reconciliation step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: String,
    pub text: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub description: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub done: bool,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub priority: Priority,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Last-writer-wins ordering only; never user editable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Generate a client-side item id. UUIDv7 keeps ids roughly time ordered.
pub fn new_item_id() -> String {
    Uuid::now_v7().to_string()
}

fn normalize_text(text: &str) -> Result<String> {
    let text = text.trim();
    if text.is_empty() {
        return Err(Error::invalid_item("Item text must not be empty"));
    }
    if text.chars().count() > MAX_ITEM_TEXT_CHARS {
        return Err(Error::invalid_item(format!(
            "Item text exceeds {} characters",
            MAX_ITEM_TEXT_CHARS
        )));
    }
    Ok(text.to_string())
}

fn normalize_tags<I, S>(tags: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    tags.into_iter()
        .map(|tag| tag.as_ref().trim().to_string())
        .filter(|tag| !tag.is_empty())
        .collect()
}

/// Fields supplied by the presentation layer when adding an item.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemDraft {
    pub text: String,
    pub description: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
    pub priority: Option<Priority>,
    pub tags: Vec<String>,
}

impl ItemDraft {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_due_date(mut self, due_date: DateTime<Utc>) -> Self {
        self.due_date = Some(due_date);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Build the full item, applying defaults.
    pub fn into_item(self, id: String, now: DateTime<Utc>) -> Result<Item> {
        Ok(Item {
            id,
            text: normalize_text(&self.text)?,
            description: self
                .description
                .map(|d| d.trim().to_string())
                .unwrap_or_default(),
            done: false,
            due_date: self.due_date,
            priority: self.priority.unwrap_or_default(),
            tags: normalize_tags(self.tags),
            created_at: Some(now),
            updated_at: Some(now),
        })
    }
}

/// Partial update merged over an existing item.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemPatch {
    pub text: Option<String>,
    pub description: Option<String>,
    pub done: Option<bool>,
    /// `Some(None)` clears the due date.
    pub due_date: Option<Option<DateTime<Utc>>>,
    pub priority: Option<Priority>,
    pub tags: Option<Vec<String>>,
}

impl ItemPatch {
    pub fn done(done: bool) -> Self {
        Self {
            done: Some(done),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn apply_to(&self, current: &Item, now: DateTime<Utc>) -> Result<Item> {
        let mut next = current.clone();
        if let Some(text) = &self.text {
            next.text = normalize_text(text)?;
        }
        if let Some(description) = &self.description {
            next.description = description.trim().to_string();
        }
        if let Some(done) = self.done {
            next.done = done;
        }
        if let Some(due_date) = self.due_date {
            next.due_date = due_date;
        }
        if let Some(priority) = self.priority {
            next.priority = priority;
        }
        if let Some(tags) = &self.tags {
            next.tags = normalize_tags(tags);
        }
        next.updated_at = Some(now);
        Ok(next)
    }
}
