//! Append-only audit trail of entity state transitions.
//!
//! Every mutating call on the other components ends by appending exactly
//! one entry here, whether the mutation succeeded or failed. Entries are
//! never updated or deleted; a failure to append is escalated to the
//! caller as fatal rather than swallowed.

use crate::error::LedgerError;
use crate::types::{Actor, EntityType, Role, TimeStamp};
use chrono::Utc;
use std::sync::Arc;

const AUDIT_TREE: &str = "audit";

/// Status of the mutation attempt an entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum AuditStatus {
    #[n(0)]
    Success,
    #[n(1)]
    Failure,
}

/// Before/after snapshot of the field the transition changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct ChangeSet {
    #[n(0)]
    pub before: Option<String>,
    #[n(1)]
    pub after: Option<String>,
}

impl ChangeSet {
    pub fn transition(before: impl Into<String>, after: impl Into<String>) -> Self {
        Self {
            before: Some(before.into()),
            after: Some(after.into()),
        }
    }
    pub fn created(after: impl Into<String>) -> Self {
        Self {
            before: None,
            after: Some(after.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct AuditEntry {
    /// Hex-encoded append sequence number, assigned by the ledger.
    #[n(0)]
    pub entry_id: String,
    #[n(1)]
    pub entity_type: EntityType,
    #[n(2)]
    pub entity_id: String,
    #[n(3)]
    pub action: String,
    #[n(4)]
    pub performed_by: String,
    #[n(5)]
    pub performed_by_role: Role,
    #[n(6)]
    pub timestamp: TimeStamp<Utc>,
    #[n(7)]
    pub changes: ChangeSet,
    #[n(8)]
    pub status: AuditStatus,
    #[n(9)]
    pub description: String,
    /// sha256 over the CBOR encoding of the entry with this field blank.
    #[n(10)]
    pub entry_hash: String,
}

impl AuditEntry {
    pub fn new(
        entity_type: EntityType,
        entity_id: impl Into<String>,
        action: impl Into<String>,
        actor: &Actor,
        changes: ChangeSet,
        status: AuditStatus,
        description: impl Into<String>,
    ) -> Self {
        Self {
            entry_id: String::new(),
            entity_type,
            entity_id: entity_id.into(),
            action: action.into(),
            performed_by: actor.id.clone(),
            performed_by_role: actor.role,
            timestamp: TimeStamp::new(),
            changes,
            status,
            description: description.into(),
            entry_hash: String::new(),
        }
    }

    /// Compute the content hash and return it with the CBOR encoding of
    /// the sealed entry.
    pub fn seal(mut self) -> anyhow::Result<(Self, Vec<u8>)> {
        self.entry_hash.clear();
        let payload = minicbor::to_vec(&self)?;
        self.entry_hash = sha256::digest(&payload);
        let sealed = minicbor::to_vec(&self)?;
        Ok((self, sealed))
    }

    /// Recompute the content hash and compare against the stored one.
    pub fn verify(&self) -> anyhow::Result<bool> {
        let mut unsealed = self.clone();
        unsealed.entry_hash.clear();
        let payload = minicbor::to_vec(&unsealed)?;
        Ok(sha256::digest(&payload) == self.entry_hash)
    }
}

/// Read-side filter. All fields are conjunctive; results are paginated
/// and always newest-first.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub entity_type: Option<EntityType>,
    pub entity_id: Option<String>,
    pub action: Option<String>,
    pub performed_by: Option<String>,
    pub from: Option<TimeStamp<Utc>>,
    pub to: Option<TimeStamp<Utc>>,
    pub page: usize,
    pub per_page: usize,
}

impl AuditQuery {
    pub fn new() -> Self {
        Self {
            per_page: 50,
            ..Self::default()
        }
    }
    pub fn for_entity(mut self, entity_type: EntityType, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type);
        self.entity_id = Some(entity_id.into());
        self
    }
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }
    pub fn by_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.performed_by = Some(actor_id.into());
        self
    }
    pub fn between(mut self, from: TimeStamp<Utc>, to: TimeStamp<Utc>) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }
    pub fn page(mut self, page: usize, per_page: usize) -> Self {
        self.page = page;
        self.per_page = per_page;
        self
    }

    fn matches(&self, entry: &AuditEntry) -> bool {
        if let Some(t) = self.entity_type {
            if entry.entity_type != t {
                return false;
            }
        }
        if let Some(id) = &self.entity_id {
            if &entry.entity_id != id {
                return false;
            }
        }
        if let Some(action) = &self.action {
            if &entry.action != action {
                return false;
            }
        }
        if let Some(actor) = &self.performed_by {
            if &entry.performed_by != actor {
                return false;
            }
        }
        if let Some(from) = &self.from {
            if entry.timestamp < *from {
                return false;
            }
        }
        if let Some(to) = &self.to {
            if entry.timestamp > *to {
                return false;
            }
        }
        true
    }
}

#[derive(Clone)]
pub struct AuditLedger {
    db: Arc<sled::Db>,
    tree: sled::Tree,
}

impl AuditLedger {
    pub fn new(db: Arc<sled::Db>) -> anyhow::Result<Self> {
        let tree = db.open_tree(AUDIT_TREE)?;
        Ok(Self { db, tree })
    }

    /// Append one entry. Any failure here is an `AuditWriteFailed` and
    /// must propagate to the caller of the mutation being recorded.
    pub fn append(&self, mut entry: AuditEntry) -> anyhow::Result<AuditEntry> {
        let seq = self
            .db
            .generate_id()
            .map_err(|e| LedgerError::AuditWriteFailed(e.to_string()))?;
        entry.entry_id = hex::encode(seq.to_be_bytes());

        let (entry, sealed) = entry
            .seal()
            .map_err(|e| LedgerError::AuditWriteFailed(e.to_string()))?;

        self.tree
            .insert(seq.to_be_bytes(), sealed)
            .map_err(|e| LedgerError::AuditWriteFailed(e.to_string()))?;

        tracing::debug!(
            entry_id = %entry.entry_id,
            entity = entry.entity_type.as_str(),
            action = %entry.action,
            "audit entry appended"
        );
        Ok(entry)
    }

    /// Filtered, paginated read, newest entries first.
    pub fn query(&self, query: &AuditQuery) -> anyhow::Result<Vec<AuditEntry>> {
        let per_page = if query.per_page == 0 {
            50
        } else {
            query.per_page
        };
        let mut hits = Vec::new();
        let mut skipped = 0usize;
        let skip = query.page * per_page;

        // Keys are big-endian sequence numbers, so reverse iteration
        // yields append order newest-first.
        for item in self.tree.iter().rev() {
            let (_, value) = item.map_err(|e| LedgerError::Storage(e.to_string()))?;
            let entry: AuditEntry = minicbor::decode(&value)?;
            if !query.matches(&entry) {
                continue;
            }
            if skipped < skip {
                skipped += 1;
                continue;
            }
            hits.push(entry);
            if hits.len() == per_page {
                break;
            }
        }
        Ok(hits)
    }
}
