//! Versioned wish storage.
//!
//! Every write is conditional on `metadata.resource_version`: the store
//! accepts it only when the caller observed the latest committed version,
//! which is what keeps concurrent reservations from overbooking a wish.

mod memory;

pub use memory::{InMemoryStore, run_compactor};

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::limits::*;
use crate::model::{Event, Wish, WishSpec};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("wish {namespace}/{name} not found")]
    NotFound { namespace: String, name: String },
    #[error("wish {namespace}/{name} already exists")]
    AlreadyExists { namespace: String, name: String },
    #[error("wish {name} was modified: expected version {expected}, found {actual}")]
    Conflict {
        name: String,
        expected: u64,
        actual: u64,
    },
    #[error("invalid wish: {0}")]
    Invalid(String),
    #[error("storage I/O error: {0}")]
    Io(String),
}

#[async_trait]
pub trait WishStore: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Wish, StoreError>;

    async fn list(&self, namespace: &str) -> Result<Vec<Wish>, StoreError>;

    /// Change feed for a namespace. Subscribe before listing to avoid missing writes.
    fn watch(&self, namespace: &str) -> broadcast::Receiver<Event>;

    /// Create a wish with a fresh uid and version 1.
    async fn create(&self, wish: Wish) -> Result<Wish, StoreError>;

    /// Replace the status of `wish`, provided `wish.metadata.resource_version`
    /// still matches the stored object. The spec is never touched.
    async fn update_status(&self, wish: &Wish) -> Result<Wish, StoreError>;

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError>;
}

/// Admission checks applied when a wish is created.
pub fn validate_wish(wish: &Wish) -> Result<(), StoreError> {
    let name = wish.name();
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(StoreError::Invalid("name must be 1..=253 characters".into()));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
    {
        return Err(StoreError::Invalid(format!(
            "name {name:?} must consist of lowercase letters, digits, '-' or '.'"
        )));
    }
    validate_spec(&wish.spec)
}

pub fn validate_spec(spec: &WishSpec) -> Result<(), StoreError> {
    if spec.title.trim().is_empty() {
        return Err(StoreError::Invalid("title is required".into()));
    }
    if spec.title.len() > MAX_TITLE_LEN {
        return Err(StoreError::Invalid("title too long".into()));
    }
    if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&spec.priority) {
        return Err(StoreError::Invalid(format!(
            "priority must be between {MIN_PRIORITY} and {MAX_PRIORITY}"
        )));
    }
    if spec.quantity < 0 {
        return Err(StoreError::Invalid("quantity must not be negative".into()));
    }
    let texts = [
        &spec.image_url,
        &spec.official_url,
        &spec.msrp,
        &spec.description,
    ];
    if texts.iter().any(|t| t.len() > MAX_TEXT_LEN) {
        return Err(StoreError::Invalid("text field too long".into()));
    }
    let lists = [&spec.purchase_urls, &spec.tags, &spec.context_tags];
    if lists.iter().any(|l| l.len() > MAX_LIST_LEN) {
        return Err(StoreError::Invalid("too many list entries".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wish(name: &str, spec: WishSpec) -> Wish {
        Wish::new("default", name, spec)
    }

    #[test]
    fn accepts_minimal_wish() {
        assert!(validate_wish(&wish("lamp", WishSpec::titled("Lamp"))).is_ok());
    }

    #[test]
    fn rejects_blank_title() {
        let err = validate_wish(&wish("lamp", WishSpec::titled("  "))).unwrap_err();
        assert!(err.to_string().contains("title"));
    }

    #[test]
    fn rejects_priority_out_of_range() {
        let mut spec = WishSpec::titled("Lamp");
        spec.priority = 6;
        assert!(validate_wish(&wish("lamp", spec.clone())).is_err());
        spec.priority = 5;
        assert!(validate_wish(&wish("lamp", spec)).is_ok());
    }

    #[test]
    fn zero_quantity_is_accepted_negative_is_not() {
        let mut spec = WishSpec::titled("Lamp");
        spec.quantity = 0;
        assert!(validate_spec(&spec).is_ok());
        spec.quantity = -1;
        assert!(validate_spec(&spec).is_err());
    }

    #[test]
    fn rejects_bad_names() {
        for bad in ["", "Lamp", "a/b", "a b"] {
            assert!(
                validate_wish(&wish(bad, WishSpec::titled("x"))).is_err(),
                "{bad:?} should be rejected"
            );
        }
    }
}
