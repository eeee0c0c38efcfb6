//! In-memory fakes for the adapter traits.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use intim_adapters::{
    LookupError, NoticeSink, NoticeSource, PipelineTrigger, SinkError, TriggerError, ValidationRow,
    ValidationSource, ValidationStoreError,
};
use intim_core::{
    normalize_record, DayDescriptor, NormalizedRecord, RawJournal, RawRecord, Subject,
    SubjectCredentials, SyncTarget, TransformOptions, TriggerRequest,
};
use intim_storage::{BackoffPolicy, MemoryStore, PendingSubject};

use crate::config::DispatchConfig;

pub fn associate_request(subject_id: &str) -> TriggerRequest {
    let creds = SubjectCredentials::new(subject_id, "KEY", "token", format!("sink-{subject_id}"))
        .unwrap();
    TriggerRequest::associate(creds)
}

pub fn company_request(subject_id: &str) -> TriggerRequest {
    let creds = SubjectCredentials::new(subject_id, "KEY", "token", format!("sink-{subject_id}"))
        .unwrap();
    TriggerRequest::company(creds, "1234").unwrap()
}

pub fn fast_dispatch() -> DispatchConfig {
    DispatchConfig {
        backoff: BackoffPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            jitter: 0.0,
        },
        ..DispatchConfig::default()
    }
}

pub fn record_with(title: &str, treated_at: Option<DateTime<Utc>>) -> NormalizedRecord {
    let raw = RawRecord {
        title: Some(title.to_string()),
        ..Default::default()
    };
    let mut record = normalize_record(&raw, &TransformOptions::default());
    record.treated_at = treated_at;
    record.treated_at_raw = treated_at.map(|t| t.to_rfc3339());
    record
}

#[derive(Default)]
struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlight {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Returns `per_day` records for every day, each treated on that day.
pub struct ScriptedSource {
    per_day: usize,
    failing: HashMap<DayDescriptor, u16>,
    delay: Duration,
    seen: Mutex<Vec<DayDescriptor>>,
    in_flight: InFlight,
}

impl ScriptedSource {
    pub fn new(per_day: usize) -> Self {
        Self {
            per_day,
            failing: HashMap::new(),
            delay: Duration::ZERO,
            seen: Mutex::new(Vec::new()),
            in_flight: InFlight::default(),
        }
    }

    pub fn failing_on(mut self, day: DayDescriptor, status: u16) -> Self {
        self.failing.insert(day, status);
        self
    }

    pub fn with_delay_ms(mut self, ms: u64) -> Self {
        self.delay = Duration::from_millis(ms);
        self
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn days_seen(&self) -> Vec<DayDescriptor> {
        self.seen.lock().unwrap().clone()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.in_flight.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NoticeSource for ScriptedSource {
    async fn fetch_day(
        &self,
        _request: &TriggerRequest,
        day: DayDescriptor,
    ) -> Result<Vec<RawRecord>, LookupError> {
        self.in_flight.enter();
        self.seen.lock().unwrap().push(day);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.leave();

        if let Some(status) = self.failing.get(&day) {
            return Err(LookupError::Status(*status));
        }
        Ok((0..self.per_day)
            .map(|i| RawRecord {
                title: Some(format!("{day}#{i}")),
                journal: Some(RawJournal {
                    name: Some("DJE".into()),
                    treated_at: Some(day.date().format("%Y-%m-%d").to_string()),
                    published_at: None,
                }),
                ..Default::default()
            })
            .collect())
    }
}

/// Accepts every page except those whose title is scripted to fail.
#[derive(Default)]
pub struct ScriptedSink {
    failing: HashMap<String, u16>,
    attempts: Mutex<HashMap<String, usize>>,
    in_flight: InFlight,
}

impl ScriptedSink {
    pub fn always_failing(mut self, title: &str, status: u16) -> Self {
        self.failing.insert(title.to_string(), status);
        self
    }

    pub fn attempts(&self, title: &str) -> usize {
        self.attempts.lock().unwrap().get(title).copied().unwrap_or(0)
    }

    pub fn total_attempts(&self) -> usize {
        self.attempts.lock().unwrap().values().sum()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.in_flight.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NoticeSink for ScriptedSink {
    async fn create_page(
        &self,
        _target_id: &str,
        _access_token: &str,
        record: &NormalizedRecord,
    ) -> Result<(), SinkError> {
        self.in_flight.enter();
        *self
            .attempts
            .lock()
            .unwrap()
            .entry(record.title.clone())
            .or_default() += 1;
        tokio::task::yield_now().await;
        self.in_flight.leave();

        let Some(status) = self.failing.get(&record.title).copied() else {
            return Ok(());
        };
        let body = "scripted failure".to_string();
        match status {
            401 | 403 => Err(SinkError::Auth { status, body }),
            _ => Err(SinkError::Status { status, body }),
        }
    }
}

pub fn row(
    id: &str,
    key: Option<&str>,
    org: Option<&str>,
    kind: Option<&str>,
) -> ValidationRow {
    ValidationRow {
        id: id.to_string(),
        registration_key: key.map(str::to_string),
        organization_code: org.map(str::to_string),
        subject_type: kind.map(str::to_string),
    }
}

/// Rows per validation database id. Unknown ids have no rows.
#[derive(Default)]
pub struct StaticValidation {
    rows: HashMap<String, Vec<ValidationRow>>,
    failing: HashSet<String>,
    panicking: HashSet<String>,
}

impl StaticValidation {
    pub fn with_rows(mut self, database_id: &str, rows: Vec<ValidationRow>) -> Self {
        self.rows.insert(database_id.to_string(), rows);
        self
    }

    pub fn failing_for(mut self, database_id: &str) -> Self {
        self.failing.insert(database_id.to_string());
        self
    }

    pub fn panicking_for(mut self, database_id: &str) -> Self {
        self.panicking.insert(database_id.to_string());
        self
    }
}

#[async_trait]
impl ValidationSource for StaticValidation {
    async fn query_rows(
        &self,
        database_id: &str,
        _access_token: &str,
    ) -> Result<Vec<ValidationRow>, ValidationStoreError> {
        if self.panicking.contains(database_id) {
            panic!("validation store exploded");
        }
        if self.failing.contains(database_id) {
            return Err(ValidationStoreError::Status {
                status: 500,
                body: "down".into(),
            });
        }
        Ok(self.rows.get(database_id).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
pub struct RecordingTrigger {
    fail: bool,
    requests: Mutex<Vec<TriggerRequest>>,
}

impl RecordingTrigger {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<TriggerRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl PipelineTrigger for RecordingTrigger {
    async fn trigger(&self, request: TriggerRequest) -> Result<(), TriggerError> {
        self.requests.lock().unwrap().push(request);
        if self.fail {
            return Err(TriggerError::Rejected {
                status: 503,
                body: "unavailable".into(),
            });
        }
        Ok(())
    }
}

/// Subject with an empty profile and a sync target `sink-<id>` /
/// `validation-<id>`.
pub fn seed_subject(store: &MemoryStore, id: &str) {
    seed_subject_with_token(store, id, "token");
}

pub fn seed_subject_with_token(store: &MemoryStore, id: &str, access_token: &str) {
    store.insert_subject(
        Subject {
            id: id.to_string(),
            name: id.to_string(),
            email: format!("{id}@example.com"),
            registration_key: None,
            organization_code: None,
            subject_type: None,
            access_token: access_token.to_string(),
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        },
        Some(SyncTarget {
            subject_id: id.to_string(),
            sink_database_id: format!("sink-{id}"),
            validation_database_id: format!("validation-{id}"),
        }),
    );
}

pub fn pending_subject(id: &str) -> PendingSubject {
    PendingSubject {
        subject_id: id.to_string(),
        access_token: "token".to_string(),
        sink_database_id: format!("sink-{id}"),
        validation_database_id: format!("validation-{id}"),
    }
}
