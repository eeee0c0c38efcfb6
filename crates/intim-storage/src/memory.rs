//! In-process store with the same semantics as [`crate::PgStore`]. Backs tests
//! and single-process dry runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use intim_core::{Subject, SubjectProfile, SubjectType, SyncTarget};

use crate::{PendingSubject, StoreError, SubjectRepository, WatermarkStore};

#[derive(Debug, Default)]
struct Tables {
    subjects: HashMap<String, Subject>,
    targets: HashMap<String, SyncTarget>,
    watermarks: HashMap<String, DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    fail_watermarks: AtomicBool,
    watermark_writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert_subject(&self, subject: Subject, target: Option<SyncTarget>) {
        let mut tables = self.tables();
        if let Some(target) = target {
            tables.targets.insert(subject.id.clone(), target);
        }
        tables.subjects.insert(subject.id.clone(), subject);
    }

    pub fn subject(&self, subject_id: &str) -> Option<Subject> {
        self.tables().subjects.get(subject_id).cloned()
    }

    /// Make every following watermark write fail.
    pub fn fail_watermark_writes(&self, fail: bool) {
        self.fail_watermarks.store(fail, Ordering::SeqCst);
    }

    pub fn watermark_writes(&self) -> usize {
        self.watermark_writes.load(Ordering::SeqCst)
    }
}

fn is_incomplete(subject: &Subject) -> bool {
    subject.registration_key.is_none()
        || (subject.organization_code.is_none()
            && matches!(subject.subject_type, None | Some(SubjectType::Company)))
}

#[async_trait]
impl SubjectRepository for MemoryStore {
    async fn find_incomplete(&self) -> Result<Vec<PendingSubject>, StoreError> {
        let tables = self.tables();
        let mut subjects = tables
            .subjects
            .values()
            .filter(|s| is_incomplete(s))
            .filter_map(|s| {
                tables.targets.get(&s.id).map(|t| {
                    (
                        s.created_at,
                        PendingSubject {
                            subject_id: s.id.clone(),
                            access_token: s.access_token.clone(),
                            sink_database_id: t.sink_database_id.clone(),
                            validation_database_id: t.validation_database_id.clone(),
                        },
                    )
                })
            })
            .collect::<Vec<_>>();
        subjects.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.subject_id.cmp(&b.1.subject_id)));
        Ok(subjects.into_iter().map(|(_, p)| p).collect())
    }

    async fn complete_profile(
        &self,
        subject_id: &str,
        profile: &SubjectProfile,
    ) -> Result<Option<SyncTarget>, StoreError> {
        let mut tables = self.tables();
        let Some(target) = tables.targets.get(subject_id).cloned() else {
            return Ok(None);
        };
        let Some(subject) = tables.subjects.get_mut(subject_id) else {
            return Ok(None);
        };
        subject.registration_key = Some(profile.registration_key().to_string());
        subject.organization_code = profile.organization_code().map(ToString::to_string);
        subject.subject_type = Some(profile.subject_type());
        Ok(Some(target))
    }
}

#[async_trait]
impl WatermarkStore for MemoryStore {
    async fn upsert_watermark(
        &self,
        subject_id: &str,
        treated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.watermark_writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_watermarks.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("watermark writes disabled".into()));
        }
        self.tables()
            .watermarks
            .insert(subject_id.to_string(), treated_at);
        Ok(())
    }

    async fn watermark(&self, subject_id: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.tables().watermarks.get(subject_id).copied())
    }
}
