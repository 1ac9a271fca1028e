//! Localized text values keyed by language tag.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// A set of translations of one piece of text, keyed by normalized language tag
/// (`en`, `pt-br`, ...).
///
/// Updates are merges by default: a patch only touches the languages it names.
/// Wholesale replacement is a separate, explicit operation.
///
/// Deserialization normalizes every key, so a payload keyed `"EN"` is read as
/// `en`; invalid or colliding tags are rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<String, String>",
    into = "BTreeMap<String, String>"
)]
pub struct Translations(BTreeMap<String, String>);

impl TryFrom<BTreeMap<String, String>> for Translations {
    type Error = DomainError;

    fn try_from(raw: BTreeMap<String, String>) -> Result<Self, Self::Error> {
        let mut normalized = BTreeMap::new();
        for (language, text) in raw {
            let key = normalize_language(&language)?;
            if normalized.insert(key, text).is_some() {
                return Err(DomainError::validation(format!(
                    "language tag {language:?} given twice"
                )));
            }
        }
        Ok(Self(normalized))
    }
}

impl From<Translations> for BTreeMap<String, String> {
    fn from(translations: Translations) -> Self {
        translations.0
    }
}

impl Translations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(language: &str, text: impl Into<String>) -> Result<Self, DomainError> {
        let mut t = Self::new();
        t.insert(language, text)?;
        Ok(t)
    }

    pub fn insert(&mut self, language: &str, text: impl Into<String>) -> Result<(), DomainError> {
        let language = normalize_language(language)?;
        self.0.insert(language, text.into());
        Ok(())
    }

    /// Builder form of [`Translations::insert`].
    pub fn with(mut self, language: &str, text: impl Into<String>) -> Result<Self, DomainError> {
        self.insert(language, text)?;
        Ok(self)
    }

    pub fn get(&self, language: &str) -> Option<&str> {
        let language = normalize_language(language).ok()?;
        self.0.get(&language).map(String::as_str)
    }

    pub fn contains(&self, language: &str) -> bool {
        self.get(language).is_some()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Overlay `patch` onto `self`; languages absent from the patch are kept.
    pub fn merge(&mut self, patch: &Translations) {
        for (language, text) in &patch.0 {
            self.0.insert(language.clone(), text.clone());
        }
    }

    /// Merge or replace depending on `replace`.
    pub fn apply_patch(&mut self, patch: &Translations, replace: bool) {
        if replace {
            *self = patch.clone();
        } else {
            self.merge(patch);
        }
    }

    /// Case-insensitive substring match against any translation.
    pub fn matches_text(&self, needle_lowercase: &str) -> bool {
        self.0
            .values()
            .any(|text| text.to_lowercase().contains(needle_lowercase))
    }
}

/// Normalize a language tag: trimmed, lowercased, ASCII alphanumeric subtags
/// joined by `-` (BCP 47 shape, not validated against the registry).
pub fn normalize_language(raw: &str) -> Result<String, DomainError> {
    let tag = raw.trim().to_ascii_lowercase().replace('_', "-");
    let valid = !tag.is_empty()
        && tag.len() <= 35
        && tag.split('-').enumerate().all(|(i, sub)| {
            let min = if i == 0 { 2 } else { 1 };
            (min..=8).contains(&sub.len()) && sub.chars().all(|c| c.is_ascii_alphanumeric())
        });
    if valid {
        Ok(tag)
    } else {
        Err(DomainError::validation(format!("invalid language tag: {raw:?}")))
    }
}
