// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Static field mapping from master field names to local field names.
//!
//! Replicas may store a subset of the master's fields under different names.
//! The mapping is declared once at registration and validated there; a bad
//! mapping is a configuration error and stops the boot.

use crate::envelope::InstanceData;
use crate::error::{ReplicationError, Result};
use std::collections::{BTreeSet, HashSet};

/// Incoming (master) field -> local field.
///
/// An identity mapping keeps every incoming field whose name is also a local
/// field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldMapping {
    entries: Option<Vec<(String, String)>>,
}

impl FieldMapping {
    /// Explicit table of `(incoming, local)` pairs.
    pub fn new<I, A, B>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (A, B)>,
        A: Into<String>,
        B: Into<String>,
    {
        Self {
            entries: Some(pairs.into_iter().map(|(a, b)| (a.into(), b.into())).collect()),
        }
    }

    pub fn identity() -> Self {
        Self { entries: None }
    }

    pub fn is_identity(&self) -> bool {
        self.entries.is_none()
    }

    /// Check the table against the local schema.
    pub fn validate(&self, local_fields: &BTreeSet<String>, primary_key: &str) -> Result<()> {
        if !local_fields.contains(primary_key) {
            return Err(ReplicationError::Config(format!(
                "primary key '{}' is not a local field",
                primary_key
            )));
        }

        let Some(entries) = &self.entries else {
            return Ok(());
        };

        let mut targets = HashSet::new();
        for (source, target) in entries {
            if !targets.insert(target.as_str()) {
                return Err(ReplicationError::Config(format!(
                    "field mapping has duplicate target '{}'",
                    target
                )));
            }
            if !local_fields.contains(target) {
                return Err(ReplicationError::Config(format!(
                    "field mapping '{}' -> '{}' targets an unknown local field",
                    source, target
                )));
            }
        }

        if !targets.contains(primary_key) {
            return Err(ReplicationError::Config(format!(
                "field mapping does not map the primary key '{}'",
                primary_key
            )));
        }

        Ok(())
    }

    /// Rename incoming fields to local names, dropping fields the replica
    /// does not store.
    pub fn map(&self, data: &InstanceData, local_fields: &BTreeSet<String>) -> InstanceData {
        match &self.entries {
            None => data
                .iter()
                .filter(|(name, _)| local_fields.contains(name.as_str()))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
            Some(entries) => entries
                .iter()
                .filter_map(|(source, target)| data.get(source).map(|v| (target.clone(), v.clone())))
                .collect(),
        }
    }

    /// Incoming field name that feeds a local field.
    pub fn source_for<'a>(&'a self, local: &'a str) -> Option<&'a str> {
        match &self.entries {
            None => Some(local),
            Some(entries) => entries
                .iter()
                .find(|(_, target)| target == local)
                .map(|(source, _)| source.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_identity_requires_primary_key() {
        let mapping = FieldMapping::identity();
        assert!(mapping.validate(&fields(&["id", "name"]), "id").is_ok());
        assert!(mapping.validate(&fields(&["name"]), "id").is_err());
    }

    #[test]
    fn test_duplicate_target_rejected() {
        let mapping = FieldMapping::new([("id", "id"), ("name", "title"), ("label", "title")]);
        let err = mapping.validate(&fields(&["id", "title"]), "id").unwrap_err();
        assert!(err.to_string().contains("duplicate target"));
    }

    #[test]
    fn test_unknown_local_field_rejected() {
        let mapping = FieldMapping::new([("id", "id"), ("name", "nickname")]);
        let err = mapping.validate(&fields(&["id", "name"]), "id").unwrap_err();
        assert!(err.to_string().contains("unknown local field"));
    }

    #[test]
    fn test_missing_primary_key_rejected() {
        let mapping = FieldMapping::new([("name", "name")]);
        let err = mapping.validate(&fields(&["id", "name"]), "id").unwrap_err();
        assert!(err.to_string().contains("primary key"));
    }

    #[test]
    fn test_valid_mapping() {
        let mapping = FieldMapping::new([("pk", "id"), ("name", "title")]);
        assert!(mapping.validate(&fields(&["id", "title"]), "id").is_ok());
        assert_eq!(mapping.source_for("id"), Some("pk"));
        assert_eq!(mapping.source_for("other"), None);
    }

    #[test]
    fn test_identity_map_drops_unknown_fields() {
        let data = json!({"id": 1, "name": "a", "secret": true});
        let mapped = FieldMapping::identity().map(data.as_object().unwrap(), &fields(&["id", "name"]));
        assert_eq!(mapped.len(), 2);
        assert!(mapped.get("secret").is_none());
    }

    #[test]
    fn test_explicit_map_renames() {
        let data = json!({"pk": 1, "name": "a", "extra": 0});
        let mapping = FieldMapping::new([("pk", "id"), ("name", "title")]);
        let mapped = mapping.map(data.as_object().unwrap(), &fields(&["id", "title"]));
        assert_eq!(mapped["id"], 1);
        assert_eq!(mapped["title"], "a");
        assert!(mapped.get("extra").is_none());
    }
}
