//! `catalog.book_search`: one searchable row per book.
//!
//! Soft-deleted books keep their row with `deleted = true`; the visibility
//! filter is applied per query, so privileged readers still see them.

use std::cmp::Ordering;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use folio_auth::TenantContext;
use folio_catalog::{Book, BookEvent, BookId};
use folio_core::{AggregateId, TenantId, Translations};
use folio_events::StreamAggregate;

use crate::event_store::RecordedEvent;
use crate::read_model::{ReadModelError, TenantStore};

use super::{Projection, ProjectionError, already_applied, decode_scoped};

pub const BOOK_SEARCH: &str = "catalog.book_search";

/// Who is reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// Soft-deleted rows are hidden.
    #[default]
    Public,
    /// Soft-deleted rows are returned with their flag set.
    Privileged,
}

impl From<&TenantContext> for Visibility {
    fn from(ctx: &TenantContext) -> Self {
        if ctx.is_privileged() {
            Visibility::Privileged
        } else {
            Visibility::Public
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookSearchRow {
    pub book_id: BookId,
    pub tenant_id: TenantId,
    pub default_language: String,
    pub title: Translations,
    pub description: Translations,
    pub author: String,
    pub tags: Vec<String>,
    pub like_count: u64,
    pub deleted: bool,
    /// Stream version this row reflects.
    pub version: u64,
    /// Global position of the last event folded into this row.
    pub last_position: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BookSearchRow {
    /// Upsert default for an event that arrives before any row exists.
    fn blank(event: &RecordedEvent) -> Self {
        Self {
            book_id: BookId(event.aggregate_id),
            tenant_id: event.tenant_id.clone(),
            default_language: String::new(),
            title: Translations::new(),
            description: Translations::new(),
            author: String::new(),
            tags: Vec::new(),
            like_count: 0,
            deleted: false,
            version: 0,
            last_position: 0,
            created_at: event.occurred_at,
            updated_at: event.committed_at,
        }
    }

    /// Fold one event into a row.
    ///
    /// Returns `None` when the row already reflects the event, so replays
    /// leave it untouched.
    pub fn fold(row: Option<Self>, event: &RecordedEvent) -> Result<Option<Self>, ProjectionError> {
        if already_applied(row.as_ref().map(|r| r.last_position), event) {
            return Ok(None);
        }
        let payload: BookEvent = decode_scoped(event)?;
        let mut row = row.unwrap_or_else(|| Self::blank(event));

        match payload {
            BookEvent::BookCreated(e) => {
                row.default_language = e.default_language;
                row.title = e.title;
                row.description = e.description;
                row.author = e.author;
                row.tags = e.tags;
                row.created_at = e.occurred_at;
            }
            BookEvent::BookRevised(e) => {
                if let Some(title) = &e.title {
                    row.title.apply_patch(title, e.replace_translations);
                }
                if let Some(description) = &e.description {
                    row.description.apply_patch(description, e.replace_translations);
                }
                if let Some(author) = e.author {
                    row.author = author;
                }
                if let Some(tags) = e.tags {
                    row.tags = tags;
                }
            }
            BookEvent::BookLiked(_) => row.like_count += 1,
            BookEvent::BookUnliked(_) => row.like_count = row.like_count.saturating_sub(1),
            BookEvent::BookDeleted(_) => row.deleted = true,
            BookEvent::BookRestored(_) => row.deleted = false,
        }

        row.version = event.sequence_number;
        row.last_position = event.global_position;
        row.updated_at = event.committed_at;
        Ok(Some(row))
    }

    pub fn is_visible_to(&self, visibility: Visibility) -> bool {
        !self.deleted || visibility == Visibility::Privileged
    }

    /// Title in `language`, falling back to the default language.
    pub fn title_in(&self, language: &str) -> Option<&str> {
        self.title
            .get(language)
            .or_else(|| self.title.get(&self.default_language))
    }

    fn sort_title(&self) -> String {
        self.title
            .get(&self.default_language)
            .unwrap_or_default()
            .to_lowercase()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookSort {
    #[default]
    Title,
    MostLiked,
    RecentlyUpdated,
}

/// Basic filter/sort over book rows. No relevance ranking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookQuery {
    /// Case-insensitive substring over every title translation and the author.
    pub text: Option<String>,
    /// Only books with a title in this language.
    pub language: Option<String>,
    pub author: Option<String>,
    pub tag: Option<String>,
    pub visibility: Visibility,
    pub sort: BookSort,
    pub limit: usize,
    pub offset: usize,
}

impl Default for BookQuery {
    fn default() -> Self {
        Self {
            text: None,
            language: None,
            author: None,
            tag: None,
            visibility: Visibility::Public,
            sort: BookSort::Title,
            limit: 50,
            offset: 0,
        }
    }
}

impl BookQuery {
    fn matches(&self, row: &BookSearchRow) -> bool {
        if !row.is_visible_to(self.visibility) {
            return false;
        }
        if let Some(text) = self.text.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            let needle = text.to_lowercase();
            if !row.title.matches_text(&needle) && !row.author.to_lowercase().contains(&needle) {
                return false;
            }
        }
        if let Some(language) = &self.language {
            if !row.title.contains(&language.trim().to_lowercase()) {
                return false;
            }
        }
        if let Some(author) = &self.author {
            if !row.author.eq_ignore_ascii_case(author.trim()) {
                return false;
            }
        }
        if let Some(tag) = &self.tag {
            let tag = tag.trim().to_lowercase();
            if !row.tags.iter().any(|t| *t == tag) {
                return false;
            }
        }
        true
    }

    fn compare(&self, a: &BookSearchRow, b: &BookSearchRow) -> Ordering {
        let primary = match self.sort {
            BookSort::Title => a.sort_title().cmp(&b.sort_title()),
            BookSort::MostLiked => b.like_count.cmp(&a.like_count),
            BookSort::RecentlyUpdated => b.updated_at.cmp(&a.updated_at),
        };
        primary.then_with(|| a.book_id.cmp(&b.book_id))
    }
}

/// Builds and queries `catalog.book_search` rows.
#[derive(Debug)]
pub struct BookSearchProjection<S> {
    store: S,
}

impl<S> BookSearchProjection<S>
where
    S: TenantStore<BookSearchRow>,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// A row from another tenant, or a deleted row read publicly, is `None`.
    pub async fn get(
        &self,
        tenant_id: &TenantId,
        book_id: AggregateId,
        visibility: Visibility,
    ) -> Result<Option<BookSearchRow>, ReadModelError> {
        Ok(self
            .store
            .get(tenant_id, book_id)
            .await?
            .filter(|row| row.is_visible_to(visibility)))
    }

    pub async fn search(
        &self,
        tenant_id: &TenantId,
        query: &BookQuery,
    ) -> Result<Vec<BookSearchRow>, ReadModelError> {
        let mut rows: Vec<_> = self
            .store
            .list(tenant_id)
            .await?
            .into_iter()
            .filter(|row| query.matches(row))
            .collect();
        rows.sort_by(|a, b| query.compare(a, b));

        Ok(rows
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .collect())
    }
}

#[async_trait]
impl<S> Projection for BookSearchProjection<S>
where
    S: TenantStore<BookSearchRow>,
{
    fn name(&self) -> &'static str {
        BOOK_SEARCH
    }

    fn handles(&self, event: &RecordedEvent) -> bool {
        event.aggregate_type == <Book as StreamAggregate>::AGGREGATE_TYPE
    }

    async fn apply(&self, event: &RecordedEvent) -> Result<(), ProjectionError> {
        let existing = self.store.get(&event.tenant_id, event.aggregate_id).await?;
        if let Some(row) = BookSearchRow::fold(existing, event)? {
            self.store
                .upsert(&event.tenant_id, event.aggregate_id, row)
                .await?;
        }
        Ok(())
    }

    async fn clear_tenant(&self, tenant_id: &TenantId) -> Result<(), ProjectionError> {
        self.store.clear_tenant(tenant_id).await?;
        Ok(())
    }
}
