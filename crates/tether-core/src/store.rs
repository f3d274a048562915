//! Entity-store contracts used by reconciliation and auditing, plus a
//! sled-backed vault implementing all of them with one tree per entity kind.

use crate::error::StoreError;
use crate::models::{AuditEntry, EngramEntry, PersonaFact};
use sled::{Db, Tree};
use std::path::Path;

/// Separates the user scope from the rest of a tree key.
const SCOPE_SEP: char = '\u{1f}';

const TREE_ENGRAMS: &str = "engrams";
const TREE_PERSONA: &str = "persona_facts";
const TREE_AUDIT: &str = "tool_audit";
const TREE_SESSIONS: &str = "sessions";

/// Engram storage: unique per `(user_id, key)`.
pub trait EngramStore: Send + Sync {
    fn find_by_key(&self, user_id: &str, key: &str) -> Result<Option<EngramEntry>, StoreError>;
    fn write(&self, entry: &EngramEntry) -> Result<(), StoreError>;
}

/// Persona fact storage.
pub trait PersonaStore: Send + Sync {
    fn get_all(&self, user_id: &str) -> Result<Vec<PersonaFact>, StoreError>;
    fn create(&self, fact: &PersonaFact) -> Result<(), StoreError>;
}

/// Resolves the user's current session, if any, for tagging engrams.
pub trait SessionResolver: Send + Sync {
    fn current_session(&self, user_id: &str) -> Option<String>;
}

/// Append-only record of tool executions.
pub trait AuditLog: Send + Sync {
    fn record(&self, entry: &AuditEntry) -> Result<(), StoreError>;
}

fn scoped(user_id: &str, rest: &str) -> String {
    format!("{}{}{}", user_id, SCOPE_SEP, rest)
}

fn scope_prefix(user_id: &str) -> String {
    format!("{}{}", user_id, SCOPE_SEP)
}

/// Sled database with one tree per synchronized entity kind.
pub struct SledVault {
    db: Db,
    engrams: Tree,
    persona: Tree,
    audit: Tree,
    sessions: Tree,
}

impl SledVault {
    /// Opens or creates the vault directory at `path`.
    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Vault that lives only as long as the process (tests, dry runs).
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self, StoreError> {
        Ok(Self {
            engrams: db.open_tree(TREE_ENGRAMS)?,
            persona: db.open_tree(TREE_PERSONA)?,
            audit: db.open_tree(TREE_AUDIT)?,
            sessions: db.open_tree(TREE_SESSIONS)?,
            db,
        })
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    /// All engrams of a user, in key order.
    pub fn engrams_for(&self, user_id: &str) -> Result<Vec<EngramEntry>, StoreError> {
        scan_json(&self.engrams, user_id)
    }

    /// Audit entries of a user, oldest first.
    pub fn audit_for(&self, user_id: &str) -> Result<Vec<AuditEntry>, StoreError> {
        scan_json(&self.audit, user_id)
    }

    pub fn set_session(&self, user_id: &str, session_id: &str) -> Result<(), StoreError> {
        self.sessions.insert(user_id.as_bytes(), session_id.as_bytes())?;
        Ok(())
    }
}

fn scan_json<T: serde::de::DeserializeOwned>(tree: &Tree, user_id: &str) -> Result<Vec<T>, StoreError> {
    let mut out = Vec::new();
    for item in tree.scan_prefix(scope_prefix(user_id).as_bytes()) {
        let (_, value) = item?;
        out.push(serde_json::from_slice(&value)?);
    }
    Ok(out)
}

impl EngramStore for SledVault {
    fn find_by_key(&self, user_id: &str, key: &str) -> Result<Option<EngramEntry>, StoreError> {
        match self.engrams.get(scoped(user_id, key).as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write(&self, entry: &EngramEntry) -> Result<(), StoreError> {
        if entry.key.trim().is_empty() {
            return Err(StoreError::Other("engram key must not be empty".to_string()));
        }
        let bytes = serde_json::to_vec(entry)?;
        self.engrams
            .insert(scoped(&entry.user_id, &entry.key).as_bytes(), bytes)?;
        Ok(())
    }
}

impl PersonaStore for SledVault {
    fn get_all(&self, user_id: &str) -> Result<Vec<PersonaFact>, StoreError> {
        scan_json(&self.persona, user_id)
    }

    fn create(&self, fact: &PersonaFact) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(fact)?;
        self.persona
            .insert(scoped(&fact.user_id, &fact.id.to_string()).as_bytes(), bytes)?;
        Ok(())
    }
}

impl AuditLog for SledVault {
    fn record(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        let rest = format!("{:020}-{}", entry.recorded_at.timestamp_millis().max(0), entry.id);
        let bytes = serde_json::to_vec(entry)?;
        self.audit.insert(scoped(&entry.user_id, &rest).as_bytes(), bytes)?;
        Ok(())
    }
}

impl SessionResolver for SledVault {
    fn current_session(&self, user_id: &str) -> Option<String> {
        match self.sessions.get(user_id.as_bytes()) {
            Ok(Some(bytes)) => String::from_utf8(bytes.to_vec()).ok().filter(|s| !s.is_empty()),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "session lookup failed");
                None
            }
        }
    }
}
