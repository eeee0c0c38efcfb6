//! Core domain model for the legal-notice sync: subjects, day descriptors,
//! trigger requests and the raw/normalized notice records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod transform;

pub use transform::{normalize_record, TransformOptions};

pub const CRATE_NAME: &str = "intim-core";

/// Kind of registered subject. Companies are looked up with an extra
/// organization code; associates only need their registration key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubjectType {
    Associate,
    Company,
}

impl SubjectType {
    pub fn as_str(self) -> &'static str {
        match self {
            SubjectType::Associate => "associate",
            SubjectType::Company => "company",
        }
    }

    pub fn requires_organization_code(self) -> bool {
        matches!(self, SubjectType::Company)
    }
}

impl fmt::Display for SubjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubjectType {
    type Err = ValidationError;

    // The staging store is filled in by hand, in Portuguese.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "associate" | "associado" => Ok(SubjectType::Associate),
            "company" | "empresa" => Ok(SubjectType::Company),
            other => Err(ValidationError::UnknownSubjectType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("unknown subject type `{0}` (expected associate or company)")]
    UnknownSubjectType(String),
}

/// Persisted subject row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub id: String,
    pub name: String,
    pub email: String,
    pub registration_key: Option<String>,
    pub organization_code: Option<String>,
    pub subject_type: Option<SubjectType>,
    pub access_token: String,
    pub created_at: DateTime<Utc>,
}

/// Sink collections provisioned for a subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTarget {
    pub subject_id: String,
    /// Collection that receives normalized notices.
    pub sink_database_id: String,
    /// Collection the subject fills in with their profile (validation store).
    pub validation_database_id: String,
}

/// Validated profile fields. A company profile always carries its
/// organization code; an associate profile never does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectProfile {
    registration_key: String,
    organization_code: Option<String>,
    subject_type: SubjectType,
}

impl SubjectProfile {
    pub fn new(
        registration_key: impl Into<String>,
        organization_code: Option<String>,
        subject_type: SubjectType,
    ) -> Result<Self, ValidationError> {
        let registration_key = non_blank(registration_key.into(), "registration_key")?;
        let organization_code = match subject_type {
            SubjectType::Company => Some(non_blank(
                organization_code.unwrap_or_default(),
                "organization_code",
            )?),
            SubjectType::Associate => None,
        };
        Ok(Self {
            registration_key,
            organization_code,
            subject_type,
        })
    }

    pub fn registration_key(&self) -> &str {
        &self.registration_key
    }

    pub fn organization_code(&self) -> Option<&str> {
        self.organization_code.as_deref()
    }

    pub fn subject_type(&self) -> SubjectType {
        self.subject_type
    }
}

fn non_blank(value: String, field: &'static str) -> Result<String, ValidationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(ValidationError::MissingField(field))
    } else {
        Ok(trimmed.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid calendar date {day:02}/{month:02}/{year}")]
pub struct InvalidDate {
    pub day: u32,
    pub month: u32,
    pub year: i32,
}

/// One calendar day to query. Only constructible for real dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DayDescriptor {
    date: NaiveDate,
}

impl DayDescriptor {
    pub fn new(day: u32, month: u32, year: i32) -> Result<Self, InvalidDate> {
        NaiveDate::from_ymd_opt(year, month, day)
            .map(|date| Self { date })
            .ok_or(InvalidDate { day, month, year })
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self { date }
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn day(&self) -> u32 {
        self.date.day()
    }

    pub fn month(&self) -> u32 {
        self.date.month()
    }

    pub fn year(&self) -> i32 {
        self.date.year()
    }

    /// `dd/mm/yyyy`, the format the lookup API expects.
    pub fn lookup_format(&self) -> String {
        self.date.format("%d/%m/%Y").to_string()
    }
}

impl fmt::Display for DayDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.lookup_format())
    }
}

/// The `lookback_days` days strictly before `today`, newest first.
pub fn rolling_window(today: NaiveDate, lookback_days: u32) -> Vec<DayDescriptor> {
    (1..=i64::from(lookback_days))
        .filter_map(|offset| today.checked_sub_signed(Duration::days(offset)))
        .map(DayDescriptor::from_date)
        .collect()
}

/// Credentials shared by both trigger shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectCredentials {
    subject_id: String,
    registration_key: String,
    access_token: String,
    sink_target_id: String,
}

impl SubjectCredentials {
    pub fn new(
        subject_id: impl Into<String>,
        registration_key: impl Into<String>,
        access_token: impl Into<String>,
        sink_target_id: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        Ok(Self {
            subject_id: non_blank(subject_id.into(), "subject_id")?,
            registration_key: non_blank(registration_key.into(), "registration_key")?,
            access_token: non_blank(access_token.into(), "access_token")?,
            sink_target_id: non_blank(sink_target_id.into(), "sink_target_id")?,
        })
    }

    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    pub fn registration_key(&self) -> &str {
        &self.registration_key
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn sink_target_id(&self) -> &str {
        &self.sink_target_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompanyTrigger {
    credentials: SubjectCredentials,
    organization_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociateTrigger {
    credentials: SubjectCredentials,
}

/// A pipeline run request. Each shape enforces its own required fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerRequest {
    Company(CompanyTrigger),
    Associate(AssociateTrigger),
}

impl TriggerRequest {
    pub fn company(
        credentials: SubjectCredentials,
        organization_code: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        Ok(TriggerRequest::Company(CompanyTrigger {
            credentials,
            organization_code: non_blank(organization_code.into(), "organization_code")?,
        }))
    }

    pub fn associate(credentials: SubjectCredentials) -> Self {
        TriggerRequest::Associate(AssociateTrigger { credentials })
    }

    pub fn from_profile(
        subject_id: &str,
        access_token: &str,
        sink_target_id: &str,
        profile: &SubjectProfile,
    ) -> Result<Self, ValidationError> {
        let credentials = SubjectCredentials::new(
            subject_id,
            profile.registration_key(),
            access_token,
            sink_target_id,
        )?;
        match profile.organization_code() {
            Some(code) => Self::company(credentials, code),
            None => Ok(Self::associate(credentials)),
        }
    }

    pub fn credentials(&self) -> &SubjectCredentials {
        match self {
            TriggerRequest::Company(c) => &c.credentials,
            TriggerRequest::Associate(a) => &a.credentials,
        }
    }

    pub fn subject_id(&self) -> &str {
        self.credentials().subject_id()
    }

    pub fn subject_type(&self) -> SubjectType {
        match self {
            TriggerRequest::Company(_) => SubjectType::Company,
            TriggerRequest::Associate(_) => SubjectType::Associate,
        }
    }

    pub fn organization_code(&self) -> Option<&str> {
        match self {
            TriggerRequest::Company(c) => Some(&c.organization_code),
            TriggerRequest::Associate(_) => None,
        }
    }
}

/// Wire shape of the trigger endpoint body. Every field is optional on the
/// wire so that missing fields surface as a validation error, not a decode
/// failure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerPayload {
    #[serde(default)]
    pub registration_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_code: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub subject_id: Option<String>,
    #[serde(default)]
    pub sink_target_id: Option<String>,
    #[serde(default)]
    pub subject_type: Option<String>,
}

impl TryFrom<TriggerPayload> for TriggerRequest {
    type Error = ValidationError;

    fn try_from(payload: TriggerPayload) -> Result<Self, Self::Error> {
        let subject_type: SubjectType = payload
            .subject_type
            .as_deref()
            .ok_or(ValidationError::MissingField("subject_type"))?
            .parse()?;
        let credentials = SubjectCredentials::new(
            payload.subject_id.unwrap_or_default(),
            payload.registration_key.unwrap_or_default(),
            payload.access_token.unwrap_or_default(),
            payload.sink_target_id.unwrap_or_default(),
        )?;
        match subject_type {
            SubjectType::Company => {
                TriggerRequest::company(credentials, payload.organization_code.unwrap_or_default())
            }
            SubjectType::Associate => Ok(TriggerRequest::associate(credentials)),
        }
    }
}

impl From<&TriggerRequest> for TriggerPayload {
    fn from(request: &TriggerRequest) -> Self {
        let credentials = request.credentials();
        Self {
            registration_key: Some(credentials.registration_key().to_string()),
            organization_code: request.organization_code().map(ToString::to_string),
            access_token: Some(credentials.access_token().to_string()),
            subject_id: Some(credentials.subject_id().to_string()),
            sink_target_id: Some(credentials.sink_target_id().to_string()),
            subject_type: Some(request.subject_type().as_str().to_string()),
        }
    }
}

/// Journal block of a lookup record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawJournal {
    #[serde(rename = "nomeJornal", default)]
    pub name: Option<String>,
    #[serde(rename = "dataTratamento", default)]
    pub treated_at: Option<String>,
    #[serde(rename = "dataDisponibilizacao_Publicacao", default)]
    pub published_at: Option<String>,
}

/// One notice as returned by the lookup API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    #[serde(rename = "termoReferenciaData", default)]
    pub reference_date: Option<String>,
    #[serde(rename = "titulo", default)]
    pub title: Option<String>,
    #[serde(rename = "cabecalho", default)]
    pub header: Option<String>,
    #[serde(rename = "textoPublicacao", default)]
    pub text: Option<String>,
    #[serde(rename = "rodape", default)]
    pub footer: Option<String>,
    #[serde(rename = "numeroUnicoProcesso", default)]
    pub process_number: Option<String>,
    #[serde(rename = "numeroPublicacao", default)]
    pub publication_number: Option<i64>,
    #[serde(rename = "numeroArquivo", default)]
    pub file_number: Option<i64>,
    #[serde(rename = "codigoRelacionamento", default)]
    pub relationship_code: Option<i64>,
    #[serde(rename = "jornal", default)]
    pub journal: Option<RawJournal>,
}

impl RawRecord {
    pub fn treated_at_raw(&self) -> Option<&str> {
        self.journal.as_ref()?.treated_at.as_deref()
    }
}

/// Target-schema projection of a [`RawRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub journal_name: String,
    /// Verbatim treated timestamp, forwarded as-is to the sink.
    pub treated_at_raw: Option<String>,
    /// Parsed treated timestamp, used for watermarks.
    pub treated_at: Option<DateTime<Utc>>,
    pub published_at: Option<String>,
    pub process_number: String,
    pub publication_chunks: Vec<String>,
    pub title: String,
    pub header: String,
    pub footer: String,
    pub publication_number: Option<i64>,
    pub file_number: Option<i64>,
    pub relationship_code: Option<i64>,
}

impl NormalizedRecord {
    pub fn publication(&self) -> String {
        self.publication_chunks.concat()
    }
}
