//! The local quote collection, held in memory and mirrored to the `kv` table.
//!
//! Every mutation rewrites the whole collection under [`db::KEY_QUOTES`]. The
//! "last viewed" quote is session state only: it lives on the store value and
//! is never written to the database.
use anyhow::{Context, Result};
use rand::Rng;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::db::{self, Pool};
use crate::model::{CategoryFilter, Quote};

pub const MIN_TEXT_LEN: usize = 10;
pub const MIN_CATEGORY_LEN: usize = 2;

const SEED_QUOTES: [(&str, &str); 4] = [
    ("Be the change you wish to see in the world.", "Inspiration"),
    ("Life is what happens when you're busy making other plans.", "Life"),
    ("The only way to do great work is to love what you do.", "Work"),
    ("In the middle of difficulty lies opportunity.", "Motivation"),
];

/// Rejected user input. Nothing is mutated when one of these is returned.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("quote must be at least {} characters long", MIN_TEXT_LEN)]
    TextTooShort,
    #[error("category must be at least {} characters long", MIN_CATEGORY_LEN)]
    CategoryTooShort,
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("import is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("import must be a JSON array of quotes")]
    NotAnArray,
    #[error("item {0} is missing a non-empty text or category")]
    InvalidQuote(usize),
}

/// Trim and check a submitted quote.
pub fn validate_quote(text: &str, category: &str) -> Result<Quote, ValidationError> {
    let text = text.trim();
    let category = category.trim();
    if text.chars().count() < MIN_TEXT_LEN {
        return Err(ValidationError::TextTooShort);
    }
    if category.chars().count() < MIN_CATEGORY_LEN {
        return Err(ValidationError::CategoryTooShort);
    }
    Ok(Quote::new(text, category))
}

pub fn seed_quotes() -> Vec<Quote> {
    SEED_QUOTES
        .iter()
        .map(|(text, category)| Quote::new(*text, *category))
        .collect()
}

/// Parse an exported collection. Every item must carry a non-empty `text` and
/// `category`; a single bad item rejects the whole import.
pub fn parse_import(raw: &str) -> Result<Vec<Quote>, ImportError> {
    let value: Value = serde_json::from_str(raw)?;
    let Value::Array(items) = value else {
        return Err(ImportError::NotAnArray);
    };
    items
        .into_iter()
        .enumerate()
        .map(|(idx, item)| {
            let text = item.get("text").and_then(Value::as_str).unwrap_or_default();
            let category = item
                .get("category")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if text.is_empty() || category.is_empty() {
                Err(ImportError::InvalidQuote(idx))
            } else {
                Ok(Quote::new(text, category))
            }
        })
        .collect()
}

#[derive(Debug)]
pub struct QuoteStore {
    pool: Pool,
    quotes: Vec<Quote>,
    selected: CategoryFilter,
    last_viewed: Option<Quote>,
}

impl QuoteStore {
    /// Load the collection and the selected category, seeding the built-in
    /// quotes when nothing has been stored yet.
    #[instrument(skip_all)]
    pub async fn load(pool: Pool) -> Result<Self> {
        let quotes = match db::get_json::<Vec<Quote>>(&pool, db::KEY_QUOTES).await? {
            Some(quotes) => quotes,
            None => {
                debug!("no stored quotes; seeding defaults");
                seed_quotes()
            }
        };
        let selected = db::get_item(&pool, db::KEY_LAST_SELECTED_CATEGORY)
            .await?
            .map(|raw| CategoryFilter::parse(&raw))
            .unwrap_or_default();
        Ok(Self {
            pool,
            quotes,
            selected,
            last_viewed: None,
        })
    }

    /// Write the whole collection back and remember its last quote as the
    /// session's last viewed quote.
    pub async fn save(&mut self) -> Result<()> {
        self.commit(self.quotes.clone()).await
    }

    /// Persist `quotes`, then make it the live collection. A failed write
    /// leaves the store as it was.
    async fn commit(&mut self, quotes: Vec<Quote>) -> Result<()> {
        db::set_json(&self.pool, db::KEY_QUOTES, &quotes)
            .await
            .context("failed to persist quotes")?;
        self.last_viewed = quotes.last().cloned();
        self.quotes = quotes;
        Ok(())
    }

    pub fn quotes(&self) -> &[Quote] {
        &self.quotes
    }

    pub fn len(&self) -> usize {
        self.quotes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quotes.is_empty()
    }

    /// First quote with exactly this text.
    pub fn find(&self, text: &str) -> Option<&Quote> {
        self.quotes.iter().find(|q| q.text == text)
    }

    pub fn last_viewed(&self) -> Option<&Quote> {
        self.last_viewed.as_ref()
    }

    /// Validate and append a user-submitted quote.
    ///
    /// Validation failures come back as [`ValidationError`] inside the
    /// `anyhow::Error` and leave the collection untouched.
    #[instrument(skip_all)]
    pub async fn add(&mut self, text: &str, category: &str) -> Result<Quote> {
        let quote = validate_quote(text, category)?;
        let mut quotes = self.quotes.clone();
        quotes.push(quote.clone());
        self.commit(quotes).await?;
        info!(category = %quote.category, total = self.quotes.len(), "quote added");
        Ok(quote)
    }

    /// Replace the whole collection and persist it.
    pub async fn replace_all(&mut self, quotes: Vec<Quote>) -> Result<()> {
        self.commit(quotes).await
    }

    /// Append `accepted` and move every quote whose text appears in
    /// `recategorized` to the given category, then persist once.
    pub async fn apply_changes(
        &mut self,
        accepted: Vec<Quote>,
        recategorized: &[(String, String)],
    ) -> Result<()> {
        let mut quotes = self.quotes.clone();
        for (text, category) in recategorized {
            for quote in quotes.iter_mut().filter(|q| &q.text == text) {
                quote.category = category.clone();
            }
        }
        quotes.extend(accepted);
        self.commit(quotes).await
    }

    /// Unique categories in first-seen order.
    pub fn categories(&self) -> Vec<String> {
        let mut seen: Vec<String> = Vec::new();
        for quote in &self.quotes {
            if !seen.contains(&quote.category) {
                seen.push(quote.category.clone());
            }
        }
        seen
    }

    pub fn selected_category(&self) -> &CategoryFilter {
        &self.selected
    }

    pub async fn select_category(&mut self, filter: CategoryFilter) -> Result<()> {
        db::set_item(&self.pool, db::KEY_LAST_SELECTED_CATEGORY, filter.as_str())
            .await
            .context("failed to persist selected category")?;
        self.selected = filter;
        Ok(())
    }

    /// Uniform draw among quotes accepted by `filter`.
    pub fn random_quote<R: Rng + ?Sized>(
        &self,
        filter: &CategoryFilter,
        rng: &mut R,
    ) -> Option<&Quote> {
        let candidates: Vec<&Quote> = self.quotes.iter().filter(|q| filter.matches(q)).collect();
        if candidates.is_empty() {
            return None;
        }
        Some(candidates[rng.random_range(0..candidates.len())])
    }

    /// Remember `filter` and draw a quote from it.
    pub async fn filter_quotes<R: Rng + ?Sized>(
        &mut self,
        filter: CategoryFilter,
        rng: &mut R,
    ) -> Result<Option<Quote>> {
        self.select_category(filter).await?;
        Ok(self.random_quote(&self.selected, rng).cloned())
    }

    pub fn export_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.quotes).context("failed to serialize quotes")
    }

    /// Append every quote from an exported collection. Returns how many were
    /// imported.
    #[instrument(skip_all)]
    pub async fn import_json(&mut self, raw: &str) -> Result<usize> {
        let imported = parse_import(raw)?;
        let count = imported.len();
        let mut quotes = self.quotes.clone();
        quotes.extend(imported);
        self.commit(quotes).await?;
        info!(count, total = self.quotes.len(), "quotes imported");
        Ok(count)
    }
}
