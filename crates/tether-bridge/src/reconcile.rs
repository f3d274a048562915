//! Merges client-reported state into cloud entities without duplicates.
//!
//! Memories and skills become engrams keyed per user; persona lists become
//! persona facts deduplicated by case-insensitive content. The three sections
//! are independent: a bad section is logged and skipped, the others still run.

use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tether_core::{
    EngramEntry, EngramKind, EngramStore, PersonaCategory, PersonaFact, PersonaStore,
    SessionResolver, SyncPayload,
};
use tracing::{debug, info, warn};

pub const MEMORY_KEY_PREFIX: &str = "local_memory_";
pub const SKILL_KEY_PREFIX: &str = "local_skill_";
pub const MEMORY_SOURCE: &str = "sync";
pub const SKILL_SOURCE: &str = "skill_sync";
pub const PERSONA_SOURCE: &str = "sync";
pub const PERSONA_CONFIDENCE: f64 = 0.8;

#[derive(Debug, Deserialize)]
struct MemoryItem {
    id: i64,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    summary: String,
}

#[derive(Debug, Default, Deserialize)]
struct PersonaSection {
    #[serde(default)]
    traits: Vec<String>,
    #[serde(default)]
    user_facts: BTreeMap<String, String>,
    #[serde(default)]
    preferences: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct SkillItem {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    content: String,
}

pub fn memory_key(id: i64) -> String {
    format!("{}{}", MEMORY_KEY_PREFIX, id)
}

pub fn skill_key(name: &str) -> String {
    format!("{}{}", SKILL_KEY_PREFIX, name)
}

/// Counts for one section of a sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SectionReport {
    pub created: usize,
    pub skipped: usize,
    pub failed: usize,
    /// The section was present but could not be decoded.
    pub rejected: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub memories: SectionReport,
    pub persona: SectionReport,
    pub skills: SectionReport,
}

pub struct StateReconciler {
    engrams: Arc<dyn EngramStore>,
    persona: Arc<dyn PersonaStore>,
    sessions: Option<Arc<dyn SessionResolver>>,
}

impl StateReconciler {
    pub fn new(engrams: Arc<dyn EngramStore>, persona: Arc<dyn PersonaStore>) -> Self {
        Self {
            engrams,
            persona,
            sessions: None,
        }
    }

    pub fn with_sessions(mut self, sessions: Arc<dyn SessionResolver>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// Applies whichever sections are present. Never fails; see the report.
    pub fn sync_state(&self, user_id: &str, payload: &SyncPayload) -> SyncReport {
        let session_id = self
            .sessions
            .as_ref()
            .and_then(|s| s.current_session(user_id));
        let mut report = SyncReport::default();
        if let Some(memories) = &payload.memories {
            report.memories = self.sync_memories(user_id, session_id.clone(), memories);
        }
        if let Some(persona) = &payload.persona {
            report.persona = self.sync_persona(user_id, persona);
        }
        if let Some(skills) = &payload.skills {
            report.skills = self.sync_skills(user_id, session_id, skills);
        }
        info!(
            user_id = %user_id,
            memories = report.memories.created,
            persona = report.persona.created,
            skills = report.skills.created,
            "sync applied"
        );
        report
    }

    pub fn sync_memories(&self, user_id: &str, session_id: Option<String>, raw: &Value) -> SectionReport {
        let items: Vec<MemoryItem> = match Vec::deserialize(raw) {
            Ok(items) => items,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "memories section rejected");
                return SectionReport {
                    rejected: true,
                    ..SectionReport::default()
                };
            }
        };
        let mut report = SectionReport::default();
        for item in items {
            let entry = EngramEntry::new(
                user_id,
                EngramKind::from_memory_type(&item.kind),
                memory_key(item.id),
                item.content,
            )
            .with_summary(item.summary)
            .with_source(MEMORY_SOURCE)
            .with_session(session_id.clone());
            self.upsert_engram(&entry, &mut report);
        }
        debug!(user_id = %user_id, ?report, "memories reconciled");
        report
    }

    pub fn sync_skills(&self, user_id: &str, session_id: Option<String>, raw: &Value) -> SectionReport {
        let items: Vec<SkillItem> = match Vec::deserialize(raw) {
            Ok(items) => items,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "skills section rejected");
                return SectionReport {
                    rejected: true,
                    ..SectionReport::default()
                };
            }
        };
        let mut report = SectionReport::default();
        for item in items {
            if item.name.trim().is_empty() {
                report.skipped += 1;
                continue;
            }
            let entry = EngramEntry::new(user_id, EngramKind::DaemonOutput, skill_key(&item.name), item.content)
                .with_summary(item.description)
                .with_source(SKILL_SOURCE)
                .with_session(session_id.clone());
            self.upsert_engram(&entry, &mut report);
        }
        debug!(user_id = %user_id, ?report, "skills reconciled");
        report
    }

    /// Write-if-absent. Existing keys are never overwritten.
    fn upsert_engram(&self, entry: &EngramEntry, report: &mut SectionReport) {
        match self.engrams.find_by_key(&entry.user_id, &entry.key) {
            Ok(Some(_)) => report.skipped += 1,
            Ok(None) => match self.engrams.write(entry) {
                Ok(()) => report.created += 1,
                Err(e) => {
                    warn!(key = %entry.key, error = %e, "engram write failed");
                    report.failed += 1;
                }
            },
            Err(e) => {
                warn!(key = %entry.key, error = %e, "engram lookup failed; item skipped");
                report.failed += 1;
            }
        }
    }

    pub fn sync_persona(&self, user_id: &str, raw: &Value) -> SectionReport {
        let section = if raw.is_null() {
            PersonaSection::default()
        } else {
            match PersonaSection::deserialize(raw) {
                Ok(section) => section,
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "persona section rejected");
                    return SectionReport {
                        rejected: true,
                        ..SectionReport::default()
                    };
                }
            }
        };

        let existing = match self.persona.get_all(user_id) {
            Ok(facts) => facts,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "could not load persona facts; section skipped");
                return SectionReport {
                    failed: 1,
                    ..SectionReport::default()
                };
            }
        };
        let mut seen: HashSet<String> = existing.iter().map(|f| f.content.to_lowercase()).collect();

        let candidates = section
            .traits
            .into_iter()
            .map(|t| (PersonaCategory::Personality, t))
            .chain(
                section
                    .user_facts
                    .iter()
                    .map(|(k, v)| (PersonaCategory::Expertise, format!("{}: {}", k, v))),
            )
            .chain(
                section
                    .preferences
                    .iter()
                    .map(|(k, v)| (PersonaCategory::Communication, format!("{}: {}", k, v))),
            );

        let mut report = SectionReport::default();
        for (category, content) in candidates {
            if content.trim().is_empty() {
                report.skipped += 1;
                continue;
            }
            // Seen set grows as facts are created, so repeats within one payload collapse.
            if !seen.insert(content.to_lowercase()) {
                report.skipped += 1;
                continue;
            }
            let fact = PersonaFact::new(user_id, category, content, PERSONA_CONFIDENCE, PERSONA_SOURCE);
            match self.persona.create(&fact) {
                Ok(()) => report.created += 1,
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "persona fact create failed");
                    report.failed += 1;
                }
            }
        }
        debug!(user_id = %user_id, ?report, "persona reconciled");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced() {
        assert_eq!(memory_key(42), "local_memory_42");
        assert_eq!(skill_key("summarize"), "local_skill_summarize");
    }

    #[test]
    fn persona_section_tolerates_missing_lists() {
        let section = PersonaSection::deserialize(&serde_json::json!({ "traits": ["calm"] }))
            .expect("decode");
        assert_eq!(section.traits, vec!["calm".to_string()]);
        assert!(section.user_facts.is_empty());
    }
}
