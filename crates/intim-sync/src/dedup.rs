use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

/// Outcome of the trigger call that marked a subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    Accepted,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupEntry {
    pub marked_at: DateTime<Utc>,
    pub outcome: TriggerOutcome,
}

/// Subjects already triggered by this process. Lost on restart.
#[derive(Debug, Default)]
pub struct DedupCache {
    entries: Mutex<HashMap<String, DedupEntry>>,
}

impl DedupCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, DedupEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn contains(&self, subject_id: &str) -> bool {
        self.entries().contains_key(subject_id)
    }

    /// Mark the subject. Returns false if it was already marked, in which case
    /// the first entry is kept.
    pub fn mark(&self, subject_id: &str, outcome: TriggerOutcome) -> bool {
        let mut entries = self.entries();
        if entries.contains_key(subject_id) {
            return false;
        }
        entries.insert(
            subject_id.to_string(),
            DedupEntry {
                marked_at: Utc::now(),
                outcome,
            },
        );
        true
    }

    pub fn entry(&self, subject_id: &str) -> Option<DedupEntry> {
        self.entries().get(subject_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subjects whose trigger call failed, with the error text, sorted by id.
    pub fn failures(&self) -> Vec<(String, String)> {
        let mut failed = self
            .entries()
            .iter()
            .filter_map(|(id, entry)| match &entry.outcome {
                TriggerOutcome::Failed(reason) => Some((id.clone(), reason.clone())),
                TriggerOutcome::Accepted => None,
            })
            .collect::<Vec<_>>();
        failed.sort();
        failed
    }
}
