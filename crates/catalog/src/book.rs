use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use folio_core::translations::normalize_language;
use folio_core::{AccountId, Aggregate, AggregateId, AggregateRoot, DomainError, TenantId, Translations};
use folio_events::{Event, StreamAggregate, TenantScoped};

/// Book identifier (tenant-scoped via `tenant_id` fields in events).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BookId(pub AggregateId);

impl BookId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for BookId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Aggregate
// ─────────────────────────────────────────────────────────────────────────────

/// Aggregate root: Book.
///
/// # Invariants
/// - The title always has an entry in the default language.
/// - An account likes a book at most once.
/// - A deleted book cannot be revised or liked until it is restored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Book {
    id: BookId,
    tenant_id: TenantId,
    default_language: String,
    title: Translations,
    description: Translations,
    author: String,
    tags: BTreeSet<String>,
    liked_by: BTreeSet<AccountId>,
    deleted: bool,
    version: u64,
    created: bool,
}

impl Book {
    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn default_language(&self) -> &str {
        &self.default_language
    }

    pub fn title(&self) -> &Translations {
        &self.title
    }

    pub fn description(&self) -> &Translations {
        &self.description
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn like_count(&self) -> usize {
        self.liked_by.len()
    }

    pub fn is_liked_by(&self, account_id: AccountId) -> bool {
        self.liked_by.contains(&account_id)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn is_created(&self) -> bool {
        self.created
    }
}

impl AggregateRoot for Book {
    type Id = BookId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateBook {
    pub default_language: String,
    pub title: Translations,
    pub description: Translations,
    pub author: String,
    pub tags: Vec<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Partial update. `None` fields are left alone; translation maps merge into
/// the current ones unless `replace_translations` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviseBook {
    pub title: Option<Translations>,
    pub description: Option<Translations>,
    pub author: Option<String>,
    pub tags: Option<Vec<String>>,
    pub replace_translations: bool,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LikeBook {
    pub account_id: AccountId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlikeBook {
    pub account_id: AccountId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteBook {
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreBook {
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookCommand {
    CreateBook(CreateBook),
    ReviseBook(ReviseBook),
    LikeBook(LikeBook),
    UnlikeBook(UnlikeBook),
    DeleteBook(DeleteBook),
    RestoreBook(RestoreBook),
}

// ─────────────────────────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookCreated {
    pub tenant_id: TenantId,
    pub book_id: BookId,
    pub default_language: String,
    pub title: Translations,
    pub description: Translations,
    pub author: String,
    pub tags: Vec<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Carries only what changed. Translation patches are merges unless
/// `replace_translations` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookRevised {
    pub tenant_id: TenantId,
    pub book_id: BookId,
    pub title: Option<Translations>,
    pub description: Option<Translations>,
    pub author: Option<String>,
    pub tags: Option<Vec<String>>,
    pub replace_translations: bool,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookLiked {
    pub tenant_id: TenantId,
    pub book_id: BookId,
    pub account_id: AccountId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookUnliked {
    pub tenant_id: TenantId,
    pub book_id: BookId,
    pub account_id: AccountId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookDeleted {
    pub tenant_id: TenantId,
    pub book_id: BookId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookRestored {
    pub tenant_id: TenantId,
    pub book_id: BookId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookEvent {
    BookCreated(BookCreated),
    BookRevised(BookRevised),
    BookLiked(BookLiked),
    BookUnliked(BookUnliked),
    BookDeleted(BookDeleted),
    BookRestored(BookRestored),
}

impl BookEvent {
    pub const CREATED: &'static str = "catalog.book.created";
    pub const REVISED: &'static str = "catalog.book.revised";
    pub const LIKED: &'static str = "catalog.book.liked";
    pub const UNLIKED: &'static str = "catalog.book.unliked";
    pub const DELETED: &'static str = "catalog.book.deleted";
    pub const RESTORED: &'static str = "catalog.book.restored";
}

impl Event for BookEvent {
    fn event_type(&self) -> &'static str {
        match self {
            BookEvent::BookCreated(_) => Self::CREATED,
            BookEvent::BookRevised(_) => Self::REVISED,
            BookEvent::BookLiked(_) => Self::LIKED,
            BookEvent::BookUnliked(_) => Self::UNLIKED,
            BookEvent::BookDeleted(_) => Self::DELETED,
            BookEvent::BookRestored(_) => Self::RESTORED,
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            BookEvent::BookCreated(e) => e.occurred_at,
            BookEvent::BookRevised(e) => e.occurred_at,
            BookEvent::BookLiked(e) => e.occurred_at,
            BookEvent::BookUnliked(e) => e.occurred_at,
            BookEvent::BookDeleted(e) => e.occurred_at,
            BookEvent::BookRestored(e) => e.occurred_at,
        }
    }
}

impl TenantScoped for BookEvent {
    fn tenant_id(&self) -> &TenantId {
        match self {
            BookEvent::BookCreated(e) => &e.tenant_id,
            BookEvent::BookRevised(e) => &e.tenant_id,
            BookEvent::BookLiked(e) => &e.tenant_id,
            BookEvent::BookUnliked(e) => &e.tenant_id,
            BookEvent::BookDeleted(e) => &e.tenant_id,
            BookEvent::BookRestored(e) => &e.tenant_id,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Behaviour
// ─────────────────────────────────────────────────────────────────────────────

impl Aggregate for Book {
    type Command = BookCommand;
    type Event = BookEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            BookEvent::BookCreated(e) => {
                self.default_language = e.default_language.clone();
                self.title = e.title.clone();
                self.description = e.description.clone();
                self.author = e.author.clone();
                self.tags = e.tags.iter().cloned().collect();
                self.created = true;
            }
            BookEvent::BookRevised(e) => {
                if let Some(title) = &e.title {
                    self.title.apply_patch(title, e.replace_translations);
                }
                if let Some(description) = &e.description {
                    self.description.apply_patch(description, e.replace_translations);
                }
                if let Some(author) = &e.author {
                    self.author = author.clone();
                }
                if let Some(tags) = &e.tags {
                    self.tags = tags.iter().cloned().collect();
                }
            }
            BookEvent::BookLiked(e) => {
                self.liked_by.insert(e.account_id);
            }
            BookEvent::BookUnliked(e) => {
                self.liked_by.remove(&e.account_id);
            }
            BookEvent::BookDeleted(_) => self.deleted = true,
            BookEvent::BookRestored(_) => self.deleted = false,
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            BookCommand::CreateBook(cmd) => self.handle_create(cmd),
            BookCommand::ReviseBook(cmd) => self.handle_revise(cmd),
            BookCommand::LikeBook(cmd) => self.handle_like(cmd),
            BookCommand::UnlikeBook(cmd) => self.handle_unlike(cmd),
            BookCommand::DeleteBook(cmd) => self.handle_delete(cmd),
            BookCommand::RestoreBook(cmd) => self.handle_restore(cmd),
        }
    }
}

impl StreamAggregate for Book {
    const AGGREGATE_TYPE: &'static str = "catalog.book";

    fn empty(tenant_id: &TenantId, aggregate_id: AggregateId) -> Self {
        Self {
            id: BookId(aggregate_id),
            tenant_id: tenant_id.clone(),
            default_language: String::new(),
            title: Translations::new(),
            description: Translations::new(),
            author: String::new(),
            tags: BTreeSet::new(),
            liked_by: BTreeSet::new(),
            deleted: false,
            version: 0,
            created: false,
        }
    }

    fn is_creation(command: &Self::Command) -> bool {
        matches!(command, BookCommand::CreateBook(_))
    }
}

impl Book {
    fn ensure_created(&self) -> Result<(), DomainError> {
        if self.created {
            Ok(())
        } else {
            Err(DomainError::not_found())
        }
    }

    fn ensure_visible(&self) -> Result<(), DomainError> {
        self.ensure_created()?;
        if self.deleted {
            return Err(DomainError::invariant("book is deleted"));
        }
        Ok(())
    }

    fn handle_create(&self, cmd: &CreateBook) -> Result<Vec<BookEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("book already exists"));
        }
        let default_language = normalize_language(&cmd.default_language)?;
        validate_texts(&cmd.title, "title")?;
        validate_texts(&cmd.description, "description")?;
        if !cmd.title.contains(&default_language) {
            return Err(DomainError::validation(format!(
                "title requires a {default_language} translation"
            )));
        }
        let author = validate_author(&cmd.author)?;
        let tags = normalize_tags(&cmd.tags)?;

        Ok(vec![BookEvent::BookCreated(BookCreated {
            tenant_id: self.tenant_id.clone(),
            book_id: self.id,
            default_language,
            title: cmd.title.clone(),
            description: cmd.description.clone(),
            author,
            tags,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_revise(&self, cmd: &ReviseBook) -> Result<Vec<BookEvent>, DomainError> {
        self.ensure_visible()?;
        if cmd.title.is_none()
            && cmd.description.is_none()
            && cmd.author.is_none()
            && cmd.tags.is_none()
        {
            return Err(DomainError::validation("revision changes nothing"));
        }
        if let Some(title) = &cmd.title {
            validate_texts(title, "title")?;
            let mut next = self.title.clone();
            next.apply_patch(title, cmd.replace_translations);
            if !next.contains(&self.default_language) {
                return Err(DomainError::validation(format!(
                    "title requires a {} translation",
                    self.default_language
                )));
            }
        }
        if let Some(description) = &cmd.description {
            validate_texts(description, "description")?;
        }
        let author = cmd.author.as_deref().map(validate_author).transpose()?;
        let tags = cmd.tags.as_deref().map(normalize_tags).transpose()?;

        Ok(vec![BookEvent::BookRevised(BookRevised {
            tenant_id: self.tenant_id.clone(),
            book_id: self.id,
            title: cmd.title.clone(),
            description: cmd.description.clone(),
            author,
            tags,
            replace_translations: cmd.replace_translations,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_like(&self, cmd: &LikeBook) -> Result<Vec<BookEvent>, DomainError> {
        self.ensure_visible()?;
        if self.is_liked_by(cmd.account_id) {
            return Err(DomainError::conflict("book already liked by this account"));
        }

        Ok(vec![BookEvent::BookLiked(BookLiked {
            tenant_id: self.tenant_id.clone(),
            book_id: self.id,
            account_id: cmd.account_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_unlike(&self, cmd: &UnlikeBook) -> Result<Vec<BookEvent>, DomainError> {
        self.ensure_created()?;
        if !self.is_liked_by(cmd.account_id) {
            return Err(DomainError::validation("book is not liked by this account"));
        }

        Ok(vec![BookEvent::BookUnliked(BookUnliked {
            tenant_id: self.tenant_id.clone(),
            book_id: self.id,
            account_id: cmd.account_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_delete(&self, cmd: &DeleteBook) -> Result<Vec<BookEvent>, DomainError> {
        self.ensure_created()?;
        if self.deleted {
            return Err(DomainError::conflict("book is already deleted"));
        }

        Ok(vec![BookEvent::BookDeleted(BookDeleted {
            tenant_id: self.tenant_id.clone(),
            book_id: self.id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_restore(&self, cmd: &RestoreBook) -> Result<Vec<BookEvent>, DomainError> {
        self.ensure_created()?;
        if !self.deleted {
            return Err(DomainError::conflict("book is not deleted"));
        }

        Ok(vec![BookEvent::BookRestored(BookRestored {
            tenant_id: self.tenant_id.clone(),
            book_id: self.id,
            occurred_at: cmd.occurred_at,
        })])
    }
}

fn validate_texts(texts: &Translations, field: &str) -> Result<(), DomainError> {
    if texts.iter().any(|(_, text)| text.trim().is_empty()) {
        return Err(DomainError::validation(format!("{field} translations cannot be empty")));
    }
    Ok(())
}

fn validate_author(raw: &str) -> Result<String, DomainError> {
    let author = raw.trim();
    if author.is_empty() {
        return Err(DomainError::validation("author cannot be empty"));
    }
    Ok(author.to_string())
}

/// Trimmed, lowercased, deduplicated and sorted.
fn normalize_tags(raw: &[String]) -> Result<Vec<String>, DomainError> {
    let mut tags = BTreeSet::new();
    for tag in raw {
        let tag = tag.trim().to_lowercase();
        if tag.is_empty() {
            return Err(DomainError::validation("tags cannot be empty"));
        }
        tags.insert(tag);
    }
    Ok(tags.into_iter().collect())
}
