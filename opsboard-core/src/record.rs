//! Inventory record edits: owner and tags.

use serde::Deserialize;

use crate::error::{CoreError, Result};
use crate::store::{HostRecord, HostStore};

/// Partial update for a record. `None` fields are left as they are.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HostUpdate {
    pub owner: Option<String>,
    pub tags: Option<Vec<String>>,
}

/// Trim, lowercase, drop empties and deduplicate, keeping first-seen
/// order.
pub fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut seen = Vec::new();
    for tag in tags {
        let tag = tag.trim().to_lowercase();
        if !tag.is_empty() && !seen.contains(&tag) {
            seen.push(tag);
        }
    }
    seen
}

/// Apply an owner/tags update to the named record and persist it.
/// Returns the updated record.
pub async fn update_host(
    store: &dyn HostStore,
    hostname: &str,
    update: HostUpdate,
) -> Result<HostRecord> {
    let mut record = store
        .find_by_hostname(hostname)
        .await?
        .ok_or_else(|| CoreError::HostNotFound(hostname.to_string()))?;

    if let Some(owner) = update.owner {
        let owner = owner.trim().to_string();
        record.owner = (!owner.is_empty()).then_some(owner);
    }
    if let Some(tags) = update.tags {
        record.tags = normalize_tags(&tags);
    }
    store.save(record.clone()).await?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryHostStore;

    fn tags(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn normalization_trims_lowercases_and_dedupes() {
        let normalized = normalize_tags(&tags(&[" Prod ", "web", "PROD", "", "  "]));
        assert_eq!(normalized, vec!["prod".to_string(), "web".to_string()]);
    }

    #[tokio::test]
    async fn update_replaces_tags_and_owner() {
        let store = MemoryHostStore::with_records([HostRecord {
            owner: Some("old".into()),
            tags: vec!["legacy".into()],
            ..HostRecord::new("web1")
        }]);

        let updated = update_host(
            &store,
            "web1",
            HostUpdate {
                owner: Some("  Alice ".into()),
                tags: Some(tags(&["Prod", "prod", "db"])),
            },
        )
        .await
        .unwrap();

        assert_eq!(updated.owner.as_deref(), Some("Alice"));
        assert_eq!(updated.tags, vec!["prod".to_string(), "db".to_string()]);
    }

    #[tokio::test]
    async fn blank_owner_clears_the_field() {
        let store = MemoryHostStore::with_records([HostRecord {
            owner: Some("old".into()),
            ..HostRecord::new("web1")
        }]);

        let updated = update_host(
            &store,
            "web1",
            HostUpdate {
                owner: Some("   ".into()),
                tags: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(updated.owner, None);
    }

    #[tokio::test]
    async fn none_fields_leave_record_untouched() {
        let store = MemoryHostStore::with_records([HostRecord {
            owner: Some("alice".into()),
            tags: vec!["prod".into()],
            ..HostRecord::new("web1")
        }]);

        let updated = update_host(&store, "web1", HostUpdate::default())
            .await
            .unwrap();
        assert_eq!(updated.owner.as_deref(), Some("alice"));
        assert_eq!(updated.tags, vec!["prod".to_string()]);
    }

    #[tokio::test]
    async fn unknown_host_is_an_error() {
        let store = MemoryHostStore::new();
        let err = update_host(&store, "nope", HostUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::HostNotFound(_)));
    }
}
