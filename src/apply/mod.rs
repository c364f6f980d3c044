// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replica-side idempotent apply.
//!
//! Every envelope a consumer accepts ends up in a [`ReplicaHandler`]. The
//! stock handler, [`ReplicaModel`], compares the incoming revision with the
//! stored one so that duplicates, reordering and redelivery all converge on
//! the master's latest state:
//!
//! ```text
//! DELETE  absent  -> Applied(AlreadyDeleted)
//!         present -> Applied(Deleted)
//! SAVE    absent                -> Applied(Created)
//!         incoming >  stored    -> Applied(Updated)
//!         incoming == stored    -> Applied(Duplicate)    (no write)
//!         incoming <  stored    -> Applied(Stale)        (no write)
//! SYNC    as SAVE, but incoming == stored is rewritten
//! ```
//!
//! The stored revision is checked again when writing, so concurrent applies
//! for the same row cannot move it backwards.
//!
//! Missing or ill-typed `revision`, `updated_at` or primary key is a permanent
//! rejection. Store failures keep their classification.
//!
//! Handlers are collected in a [`ReplicaRegistry`] at startup; registering two
//! handlers for one entity type is a configuration error.

pub mod mapping;
pub mod store;

pub use mapping::FieldMapping;
pub use store::{
    MemoryReplicaStore, ReplicaRecord, ReplicaStore, RevisionGuard, StoreError, StoreFuture,
    StoreResult, StoredRevision, UpdateResult,
};

use crate::envelope::{Envelope, InstanceData, InstanceKey, SignalType};
use crate::error::{ReplicationError, Result};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, warn};

/// What a successful apply did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyAction {
    Created,
    Updated,
    Deleted,
    /// Same revision already stored.
    Duplicate,
    /// Older revision than stored; write skipped.
    Stale,
    /// DELETE for a row that does not exist.
    AlreadyDeleted,
}

impl ApplyAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
            Self::Duplicate => "duplicate",
            Self::Stale => "stale",
            Self::AlreadyDeleted => "already_deleted",
        }
    }

    /// Whether the replica was written.
    pub fn wrote(&self) -> bool {
        matches!(self, Self::Created | Self::Updated | Self::Deleted)
    }
}

impl fmt::Display for ApplyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of applying one envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Replica is consistent with the envelope. Ack.
    Applied(ApplyAction),
    /// Will never succeed. Log and ack.
    RejectedPermanent(String),
    /// May succeed later. Schedule a redelivery.
    RejectedTransient(String),
}

impl ApplyOutcome {
    fn from_store(err: StoreError) -> Self {
        match err {
            StoreError::Transient(msg) => Self::RejectedTransient(msg),
            StoreError::Permanent(msg) => Self::RejectedPermanent(msg),
        }
    }
}

/// Boxed future returned by [`ReplicaHandler::apply`].
pub type ApplyFuture<'a> = Pin<Box<dyn Future<Output = ApplyOutcome> + Send + 'a>>;

/// Applies envelopes of one entity type to the replica.
pub trait ReplicaHandler: Send + Sync + 'static {
    fn entity_type(&self) -> &str;

    /// Called once at registration. Errors stop the boot.
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    fn apply<'a>(&'a self, envelope: &'a Envelope) -> ApplyFuture<'a>;
}

// =============================================================================
// ReplicaModel
// =============================================================================

/// Revision-guarded handler over a [`ReplicaStore`].
pub struct ReplicaModel<S> {
    entity_type: String,
    primary_key: String,
    fields: BTreeSet<String>,
    mapping: FieldMapping,
    store: Arc<S>,
}

impl<S: ReplicaStore> ReplicaModel<S> {
    /// `fields` are the local field names, primary key included.
    pub fn new<I, F>(
        entity_type: impl Into<String>,
        primary_key: impl Into<String>,
        fields: I,
        store: Arc<S>,
    ) -> Self
    where
        I: IntoIterator<Item = F>,
        F: Into<String>,
    {
        Self {
            entity_type: entity_type.into(),
            primary_key: primary_key.into(),
            fields: fields.into_iter().map(Into::into).collect(),
            mapping: FieldMapping::identity(),
            store,
        }
    }

    #[must_use]
    pub fn with_mapping(mut self, mapping: FieldMapping) -> Self {
        self.mapping = mapping;
        self
    }

    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Incoming fields renamed to local names.
    pub fn map_fields(&self, data: &InstanceData) -> InstanceData {
        self.mapping.map(data, &self.fields)
    }

    fn key_of(&self, envelope: &Envelope) -> Option<InstanceKey> {
        let source = self.mapping.source_for(&self.primary_key).unwrap_or(self.primary_key.as_str());
        envelope.key_or_field(source)
    }

    async fn apply_delete(&self, envelope: &Envelope) -> ApplyOutcome {
        let Some(key) = self.key_of(envelope) else {
            return ApplyOutcome::RejectedPermanent("DELETE without primary key".into());
        };

        match self.store.delete(&key).await {
            Ok(true) => ApplyOutcome::Applied(ApplyAction::Deleted),
            Ok(false) => {
                debug!(entity_type = %self.entity_type, key = %key, "DELETE for absent row");
                ApplyOutcome::Applied(ApplyAction::AlreadyDeleted)
            }
            Err(e) => ApplyOutcome::from_store(e),
        }
    }

    async fn apply_upsert(&self, envelope: &Envelope) -> ApplyOutcome {
        let Some(revision) = envelope.revision() else {
            return ApplyOutcome::RejectedPermanent("missing or non-integer revision".into());
        };
        let Some(updated_at) = envelope.updated_at() else {
            return ApplyOutcome::RejectedPermanent("missing or invalid updated_at".into());
        };
        let Some(key) = self.key_of(envelope) else {
            return ApplyOutcome::RejectedPermanent("missing primary key".into());
        };

        let current = match self.store.revision(&key).await {
            Ok(current) => current,
            Err(e) => return ApplyOutcome::from_store(e),
        };

        let record = ReplicaRecord {
            key,
            revision,
            updated_at,
            fields: self.map_fields(&envelope.instance_data),
        };

        let Some(current) = current else {
            return match self.store.create(record).await {
                Ok(()) => ApplyOutcome::Applied(ApplyAction::Created),
                Err(e) => ApplyOutcome::from_store(e),
            };
        };

        if revision < current.revision {
            debug!(
                entity_type = %self.entity_type,
                key = %record.key,
                incoming = revision,
                stored = current.revision,
                "Skipping stale revision"
            );
            return ApplyOutcome::Applied(ApplyAction::Stale);
        }

        if revision == current.revision && envelope.signal_type == SignalType::Save {
            return ApplyOutcome::Applied(ApplyAction::Duplicate);
        }

        if revision > current.revision.saturating_add(1) {
            warn!(
                entity_type = %self.entity_type,
                key = %record.key,
                incoming = revision,
                stored = current.revision,
                "Revision gap, intermediate changes were lost or filtered"
            );
        }

        let guard = match envelope.signal_type {
            SignalType::Sync => RevisionGuard::NewerOrEqual,
            _ => RevisionGuard::Newer,
        };
        let key = record.key.clone();
        match self.store.update(record, guard).await {
            Ok(UpdateResult::Written) => ApplyOutcome::Applied(ApplyAction::Updated),
            Ok(UpdateResult::Superseded(stored)) => {
                debug!(
                    entity_type = %self.entity_type,
                    key = %key,
                    incoming = revision,
                    stored = stored.revision,
                    "Row moved on concurrently, write skipped"
                );
                if stored.revision == revision {
                    ApplyOutcome::Applied(ApplyAction::Duplicate)
                } else {
                    ApplyOutcome::Applied(ApplyAction::Stale)
                }
            }
            Err(e) => ApplyOutcome::from_store(e),
        }
    }
}

impl<S: ReplicaStore> ReplicaHandler for ReplicaModel<S> {
    fn entity_type(&self) -> &str {
        &self.entity_type
    }

    fn validate(&self) -> Result<()> {
        if self.entity_type.trim().is_empty() {
            return Err(ReplicationError::Config("entity type must not be empty".into()));
        }
        self.mapping
            .validate(&self.fields, &self.primary_key)
            .map_err(|e| ReplicationError::Config(format!("{}: {}", self.entity_type, e)))
    }

    fn apply<'a>(&'a self, envelope: &'a Envelope) -> ApplyFuture<'a> {
        Box::pin(async move {
            match envelope.signal_type {
                SignalType::Delete => self.apply_delete(envelope).await,
                SignalType::Save | SignalType::Sync => self.apply_upsert(envelope).await,
            }
        })
    }
}

impl<S> fmt::Debug for ReplicaModel<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicaModel")
            .field("entity_type", &self.entity_type)
            .field("primary_key", &self.primary_key)
            .field("fields", &self.fields)
            .field("mapping", &self.mapping)
            .finish()
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Startup table of handlers keyed by entity type.
#[derive(Default, Clone)]
pub struct ReplicaRegistry {
    handlers: HashMap<String, Arc<dyn ReplicaHandler>>,
}

impl ReplicaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and add a handler.
    pub fn register<H: ReplicaHandler>(&mut self, handler: H) -> Result<()> {
        self.register_arc(Arc::new(handler))
    }

    pub fn register_arc(&mut self, handler: Arc<dyn ReplicaHandler>) -> Result<()> {
        handler.validate()?;

        let entity_type = handler.entity_type().to_string();
        if self.handlers.contains_key(&entity_type) {
            return Err(ReplicationError::Config(format!(
                "handler for entity type '{}' registered twice",
                entity_type
            )));
        }

        debug!(entity_type = %entity_type, "Registered replica handler");
        self.handlers.insert(entity_type, handler);
        Ok(())
    }

    pub fn get(&self, entity_type: &str) -> Option<&Arc<dyn ReplicaHandler>> {
        self.handlers.get(entity_type)
    }

    /// Registered entity types, sorted.
    pub fn entity_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Apply through the registered handler, `None` if there is none.
    pub async fn apply(&self, envelope: &Envelope) -> Option<ApplyOutcome> {
        let handler = self.get(&envelope.entity_type)?;
        Some(handler.apply(envelope).await)
    }
}

impl fmt::Debug for ReplicaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicaRegistry")
            .field("entity_types", &self.entity_types())
            .finish()
    }
}
