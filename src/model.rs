use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A quote as kept in the local collection. `text` is the identity used when
/// comparing against the remote set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Quote {
    pub text: String,
    pub category: String,
}

impl Quote {
    pub fn new(text: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            category: category.into(),
        }
    }

    /// Case-insensitive category comparison used by filtering.
    pub fn in_category(&self, category: &str) -> bool {
        self.category.to_lowercase() == category.to_lowercase()
    }
}

impl fmt::Display for Quote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\" ({})", self.text, self.category)
    }
}

/// A quote as seen on the remote side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteQuote {
    pub id: String,
    pub text: String,
    pub category: String,
}

impl RemoteQuote {
    pub fn to_quote(&self) -> Quote {
        Quote::new(self.text.clone(), self.category.clone())
    }
}

/// Category filter persisted under `lastSelectedCategory`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CategoryFilter {
    #[default]
    All,
    /// Always stored lowercased.
    Named(String),
}

impl CategoryFilter {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("all") {
            CategoryFilter::All
        } else {
            CategoryFilter::Named(trimmed.to_lowercase())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            CategoryFilter::All => "all",
            CategoryFilter::Named(name) => name,
        }
    }

    pub fn matches(&self, quote: &Quote) -> bool {
        match self {
            CategoryFilter::All => true,
            CategoryFilter::Named(name) => quote.in_category(name),
        }
    }
}

/// A quote waiting for confirmed delivery to the remote side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub quote: Quote,
    pub queued_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    pub fn new(quote: Quote) -> Self {
        Self {
            id: Uuid::new_v4(),
            quote,
            queued_at: Utc::now(),
            attempts: 0,
            next_attempt_at: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }
}

/// Where a sync cycle currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    FlushingOutbox,
    Fetching,
    AwaitingResolution,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::FlushingOutbox => "flushing-outbox",
            SyncState::Fetching => "fetching",
            SyncState::AwaitingResolution => "awaiting-manual-resolution",
        }
    }
}

/// How a non-empty diff is applied.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConflictMode {
    /// Remote wins without asking.
    #[default]
    Auto,
    /// Diff is held until the user resolves or dismisses it.
    Manual,
}

impl ConflictMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictMode::Auto => "auto",
            ConflictMode::Manual => "manual",
        }
    }
}
