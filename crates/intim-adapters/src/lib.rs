//! Adapters for the external services the pipeline talks to: the notice
//! lookup API, the sink (pages + database queries) and the trigger endpoint.

use async_trait::async_trait;
use intim_core::{DayDescriptor, NormalizedRecord, RawRecord, TriggerPayload, TriggerRequest};
use intim_storage::{build_http_client, classify_status, HttpClientConfig, RetryDisposition};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "intim-adapters";

pub const DEFAULT_SINK_BASE_URL: &str = "https://api.notion.com/v1";
pub const DEFAULT_SINK_API_VERSION: &str = "2022-06-28";

pub const PROP_REGISTRATION_KEY: &str = "Chave de Acesso";
pub const PROP_ORGANIZATION_CODE: &str = "Código AASP";
pub const PROP_SUBJECT_TYPE: &str = "Tipo";

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("lookup transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("{0}")]
    Status(u16),
    #[error("undecodable lookup body: {0}")]
    Decode(String),
}

/// Per-day source of raw notices.
#[async_trait]
pub trait NoticeSource: Send + Sync {
    async fn fetch_day(
        &self,
        request: &TriggerRequest,
        day: DayDescriptor,
    ) -> Result<Vec<RawRecord>, LookupError>;
}

const BATCH_KEY: &str = "intimacoes";

const RECORD_KEYS: [&str; 10] = [
    "termoReferenciaData",
    "titulo",
    "cabecalho",
    "textoPublicacao",
    "rodape",
    "numeroUnicoProcesso",
    "numeroPublicacao",
    "numeroArquivo",
    "codigoRelacionamento",
    "jornal",
];

/// Lookup answers come as `{"intimacoes": [...]}`, a bare list or a single
/// record. An object with none of the record fields is an empty answer. Any
/// record that fails to decode fails the whole body.
fn decode_lookup_body(text: &str) -> Result<Vec<RawRecord>, LookupError> {
    let decode_err = |e: serde_json::Error| LookupError::Decode(e.to_string());
    let value: JsonValue = serde_json::from_str(text).map_err(decode_err)?;
    match value {
        JsonValue::Object(mut map) => {
            if let Some(batch) = map.remove(BATCH_KEY) {
                return serde_json::from_value(batch).map_err(decode_err);
            }
            if !RECORD_KEYS.iter().any(|key| map.contains_key(*key)) {
                return Ok(Vec::new());
            }
            let record = serde_json::from_value(JsonValue::Object(map)).map_err(decode_err)?;
            Ok(vec![record])
        }
        JsonValue::Array(_) => serde_json::from_value(value).map_err(decode_err),
        other => Err(LookupError::Decode(format!("unexpected lookup body: {other}"))),
    }
}

#[derive(Debug, Clone)]
pub struct LookupClient {
    http: reqwest::Client,
    base_url: String,
}

impl LookupClient {
    pub fn new(base_url: impl Into<String>, config: &HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            http: build_http_client(config)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl NoticeSource for LookupClient {
    async fn fetch_day(
        &self,
        request: &TriggerRequest,
        day: DayDescriptor,
    ) -> Result<Vec<RawRecord>, LookupError> {
        let key = request.credentials().registration_key();
        let date = day.lookup_format();
        let builder = match request.organization_code() {
            Some(code) => self
                .http
                .get(format!("{}/api/Empresa/intimacao", self.base_url))
                .query(&[("chave", key), ("codigoPessoaAssociado", code), ("data", date.as_str())]),
            None => self
                .http
                .get(format!("{}/api/Associado/intimacao/json", self.base_url))
                .query(&[("chave", key), ("data", date.as_str()), ("diferencial", "false")]),
        };

        let resp = builder.send().await?;
        let status = resp.status();
        if status != StatusCode::OK {
            warn!(%day, status = status.as_u16(), "lookup returned non-success status");
            return Err(LookupError::Status(status.as_u16()));
        }
        let text = resp.text().await?;
        let records = decode_lookup_body(&text)?;
        debug!(%day, count = records.len(), "lookup day fetched");
        Ok(records)
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink transport error: {message}")]
    Transport { message: String, retryable: bool },
    #[error("sink rejected credentials ({status}): {body}")]
    Auth { status: u16, body: String },
    #[error("sink returned {status}: {body}")]
    Status { status: u16, body: String },
}

impl SinkError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            SinkError::Transport { retryable: true, .. } => RetryDisposition::Retryable,
            SinkError::Transport { .. } => RetryDisposition::NonRetryable,
            SinkError::Auth { .. } => RetryDisposition::AuthRejected,
            SinkError::Status { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
        }
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        let retryable =
            intim_storage::classify_reqwest_error(&err) == RetryDisposition::Retryable;
        SinkError::Transport {
            message: err.to_string(),
            retryable,
        }
    }
}

/// Downstream store for normalized notices; one call per record.
#[async_trait]
pub trait NoticeSink: Send + Sync {
    async fn create_page(
        &self,
        target_id: &str,
        access_token: &str,
        record: &NormalizedRecord,
    ) -> Result<(), SinkError>;
}

fn rich_text(content: &str) -> JsonValue {
    json!([{ "text": { "content": content } }])
}

fn date_property(value: Option<&str>) -> JsonValue {
    match value {
        Some(start) => json!({ "date": { "start": start } }),
        None => json!({ "date": null }),
    }
}

/// Sink page properties for one record. Property names are those of the
/// provisioned notice collection.
pub fn page_properties(record: &NormalizedRecord) -> JsonValue {
    let publication = record
        .publication_chunks
        .iter()
        .map(|chunk| json!({ "text": { "content": chunk } }))
        .collect::<Vec<_>>();

    json!({
        "Jornal": { "title": rich_text(&record.journal_name) },
        "Tratado em": date_property(record.treated_at_raw.as_deref()),
        "Disponibilização": date_property(record.published_at.as_deref()),
        "Nº do Processo": { "rich_text": rich_text(&record.process_number) },
        "Publicação": { "rich_text": publication },
        "Título": { "rich_text": rich_text(&record.title) },
        "Cabeçalho": { "rich_text": rich_text(&record.header) },
        "Rodapé": { "rich_text": rich_text(&record.footer) },
        "Nº Publicação": { "number": record.publication_number },
        "Nº Arquivo": { "number": record.file_number },
        "Cod Relacionamento": { "number": record.relationship_code },
    })
}

#[derive(Debug, Clone)]
pub struct NotionSink {
    http: reqwest::Client,
    base_url: String,
    api_version: String,
}

impl NotionSink {
    pub fn new(
        base_url: impl Into<String>,
        api_version: impl Into<String>,
        config: &HttpClientConfig,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            http: build_http_client(config)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_version: api_version.into(),
        })
    }
}

#[async_trait]
impl NoticeSink for NotionSink {
    async fn create_page(
        &self,
        target_id: &str,
        access_token: &str,
        record: &NormalizedRecord,
    ) -> Result<(), SinkError> {
        let resp = self
            .http
            .post(format!("{}/pages", self.base_url))
            .bearer_auth(access_token)
            .header("Notion-Version", &self.api_version)
            .json(&json!({
                "parent": { "database_id": target_id },
                "properties": page_properties(record),
            }))
            .send()
            .await
            .map_err(SinkError::from_reqwest)?;

        let status = resp.status();
        if status == StatusCode::OK {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        match classify_status(status) {
            RetryDisposition::AuthRejected => Err(SinkError::Auth {
                status: status.as_u16(),
                body,
            }),
            _ => Err(SinkError::Status {
                status: status.as_u16(),
                body,
            }),
        }
    }
}

/// Profile fields read from one row of a subject's validation store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationRow {
    pub id: String,
    pub registration_key: Option<String>,
    pub organization_code: Option<String>,
    pub subject_type: Option<String>,
}

#[derive(Debug, Error)]
pub enum ValidationStoreError {
    #[error("validation store transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("validation store returned {status}: {body}")]
    Status { status: u16, body: String },
}

#[async_trait]
pub trait ValidationSource: Send + Sync {
    async fn query_rows(
        &self,
        database_id: &str,
        access_token: &str,
    ) -> Result<Vec<ValidationRow>, ValidationStoreError>;
}

fn text_property(properties: &JsonValue, name: &str) -> Option<String> {
    let prop = properties.get(name)?;
    let fragments = prop
        .get("rich_text")
        .or_else(|| prop.get("title"))?
        .as_array()?;
    let first = fragments.first()?;
    first
        .get("text")
        .and_then(|t| t.get("content"))
        .or_else(|| first.get("plain_text"))
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

pub fn parse_validation_rows(results: &[JsonValue]) -> Vec<ValidationRow> {
    results
        .iter()
        .map(|item| {
            let properties = item.get("properties").cloned().unwrap_or(JsonValue::Null);
            ValidationRow {
                id: item
                    .get("id")
                    .and_then(JsonValue::as_str)
                    .unwrap_or_default()
                    .to_string(),
                registration_key: text_property(&properties, PROP_REGISTRATION_KEY),
                organization_code: text_property(&properties, PROP_ORGANIZATION_CODE),
                subject_type: text_property(&properties, PROP_SUBJECT_TYPE),
            }
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct QueryPage {
    #[serde(default)]
    results: Vec<JsonValue>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NotionValidationStore {
    http: reqwest::Client,
    base_url: String,
    api_version: String,
}

impl NotionValidationStore {
    pub fn new(
        base_url: impl Into<String>,
        api_version: impl Into<String>,
        config: &HttpClientConfig,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            http: build_http_client(config)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_version: api_version.into(),
        })
    }
}

#[async_trait]
impl ValidationSource for NotionValidationStore {
    async fn query_rows(
        &self,
        database_id: &str,
        access_token: &str,
    ) -> Result<Vec<ValidationRow>, ValidationStoreError> {
        let url = format!("{}/databases/{}/query", self.base_url, database_id);
        let mut rows = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let body = match &cursor {
                Some(c) => json!({ "start_cursor": c }),
                None => json!({}),
            };
            let resp = self
                .http
                .post(&url)
                .bearer_auth(access_token)
                .header("Notion-Version", &self.api_version)
                .json(&body)
                .send()
                .await?;
            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(ValidationStoreError::Status {
                    status: status.as_u16(),
                    body,
                });
            }
            let page: QueryPage = resp.json().await?;
            rows.extend(parse_validation_rows(&page.results));
            match (page.has_more, page.next_cursor) {
                (true, Some(next)) => cursor = Some(next),
                _ => break,
            }
        }
        Ok(rows)
    }
}

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("trigger transport error: {0}")]
    Transport(String),
    #[error("trigger rejected ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("pipeline unavailable: {0}")]
    Unavailable(String),
}

/// Starts a pipeline run for a subject. Implementations return once the run
/// is accepted, not when it finishes.
#[async_trait]
pub trait PipelineTrigger: Send + Sync {
    async fn trigger(&self, request: TriggerRequest) -> Result<(), TriggerError>;
}

/// Posts to the trigger endpoint of a (possibly remote) pipeline service.
#[derive(Debug, Clone)]
pub struct HttpTrigger {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpTrigger {
    pub fn new(endpoint: impl Into<String>, config: &HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            http: build_http_client(config)?,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl PipelineTrigger for HttpTrigger {
    async fn trigger(&self, request: TriggerRequest) -> Result<(), TriggerError> {
        let resp = self
            .http
            .post(&self.endpoint)
            .json(&TriggerPayload::from(&request))
            .send()
            .await
            .map_err(|e| TriggerError::Transport(e.to_string()))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        Err(TriggerError::Rejected {
            status: status.as_u16(),
            body: resp.text().await.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use intim_core::{normalize_record, SubjectCredentials, TransformOptions};
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn company() -> TriggerRequest {
        let creds = SubjectCredentials::new("user-1", "KEY123", "tok", "db-1").unwrap();
        TriggerRequest::company(creds, "9876").unwrap()
    }

    fn associate() -> TriggerRequest {
        let creds = SubjectCredentials::new("user-2", "KEY456", "tok", "db-2").unwrap();
        TriggerRequest::associate(creds)
    }

    fn day() -> DayDescriptor {
        DayDescriptor::new(4, 12, 2024).unwrap()
    }

    #[tokio::test]
    async fn company_lookup_sends_organization_code_and_formatted_date() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/Empresa/intimacao"))
            .and(query_param("chave", "KEY123"))
            .and(query_param("codigoPessoaAssociado", "9876"))
            .and(query_param("data", "04/12/2024"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "intimacoes": [{ "titulo": "A" }, { "titulo": "B" }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = LookupClient::new(server.uri(), &HttpClientConfig::default()).unwrap();
        let records = client.fetch_day(&company(), day()).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].title.as_deref(), Some("B"));
    }

    #[tokio::test]
    async fn associate_lookup_uses_json_endpoint_and_accepts_single_record() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/Associado/intimacao/json"))
            .and(query_param("chave", "KEY456"))
            .and(query_param("diferencial", "false"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "titulo": "Only" })))
            .mount(&server)
            .await;

        let client = LookupClient::new(server.uri(), &HttpClientConfig::default()).unwrap();
        let records = client.fetch_day(&associate(), day()).await.unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn lookup_surfaces_status_as_error_detail() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = LookupClient::new(server.uri(), &HttpClientConfig::default()).unwrap();
        let err = client.fetch_day(&associate(), day()).await.unwrap_err();
        assert_eq!(err.to_string(), "503");
    }

    #[tokio::test]
    async fn batch_with_one_undecodable_record_is_a_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/Empresa/intimacao"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "intimacoes": [
                    { "titulo": "ok", "numeroPublicacao": 811 },
                    { "titulo": "bad", "numeroPublicacao": "812" }
                ]
            })))
            .mount(&server)
            .await;

        let client = LookupClient::new(server.uri(), &HttpClientConfig::default()).unwrap();
        let err = client.fetch_day(&company(), day()).await.unwrap_err();
        assert!(matches!(err, LookupError::Decode(_)), "got {err:?}");
    }

    #[test]
    fn lookup_body_shapes() {
        assert!(decode_lookup_body("{}").unwrap().is_empty());
        assert!(decode_lookup_body(r#"{"mensagem":"sem dados"}"#).unwrap().is_empty());
        assert_eq!(decode_lookup_body(r#"[{"titulo":"a"},{"titulo":"b"}]"#).unwrap().len(), 2);
        assert!(matches!(
            decode_lookup_body(r#"{"titulo":"a","numeroArquivo":"x"}"#),
            Err(LookupError::Decode(_))
        ));
        assert!(matches!(decode_lookup_body("null"), Err(LookupError::Decode(_))));
    }

    #[tokio::test]
    async fn sink_posts_properties_with_bearer_and_version() {
        let server = MockServer::start().await;
        let record = normalize_record(
            &RawRecord {
                title: Some("T".into()),
                ..Default::default()
            },
            &TransformOptions::default(),
        );
        Mock::given(method("POST"))
            .and(path("/pages"))
            .and(header("authorization", "Bearer tok"))
            .and(header("notion-version", DEFAULT_SINK_API_VERSION))
            .and(body_json(json!({
                "parent": { "database_id": "db-1" },
                "properties": page_properties(&record),
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sink =
            NotionSink::new(server.uri(), DEFAULT_SINK_API_VERSION, &HttpClientConfig::default())
                .unwrap();
        sink.create_page("db-1", "tok", &record).await.unwrap();
    }

    #[tokio::test]
    async fn sink_maps_unauthorized_to_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad token"))
            .mount(&server)
            .await;

        let sink =
            NotionSink::new(server.uri(), DEFAULT_SINK_API_VERSION, &HttpClientConfig::default())
                .unwrap();
        let record = normalize_record(&RawRecord::default(), &TransformOptions::default());
        let err = sink.create_page("db", "tok", &record).await.unwrap_err();
        assert_eq!(err.disposition(), RetryDisposition::AuthRejected);
    }

    #[test]
    fn page_properties_use_null_for_missing_numbers_and_dates() {
        let record = normalize_record(&RawRecord::default(), &TransformOptions::default());
        let props = page_properties(&record);
        assert_eq!(props["Nº Arquivo"]["number"], JsonValue::Null);
        assert_eq!(props["Tratado em"]["date"], JsonValue::Null);
        assert_eq!(props["Publicação"]["rich_text"], json!([]));
        assert_eq!(props["Título"]["rich_text"][0]["text"]["content"], "No Title");
    }

    #[test]
    fn validation_rows_parse_rich_text_properties() {
        let rows = parse_validation_rows(&[json!({
            "id": "row-1",
            "properties": {
                "Chave de Acesso": { "rich_text": [{ "text": { "content": " KEY " } }] },
                "Código AASP": { "rich_text": [] },
                "Tipo": { "rich_text": [{ "plain_text": "associado" }] }
            }
        })]);
        assert_eq!(
            rows,
            vec![ValidationRow {
                id: "row-1".into(),
                registration_key: Some("KEY".into()),
                organization_code: None,
                subject_type: Some("associado".into()),
            }]
        );
    }

    #[tokio::test]
    async fn validation_query_follows_cursor() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/databases/val-1/query"))
            .and(body_json(json!({ "start_cursor": "c2" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{ "id": "r2", "properties": {} }],
                "has_more": false
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/databases/val-1/query"))
            .and(body_json(json!({})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{ "id": "r1", "properties": {} }],
                "has_more": true,
                "next_cursor": "c2"
            })))
            .mount(&server)
            .await;

        let store = NotionValidationStore::new(
            server.uri(),
            DEFAULT_SINK_API_VERSION,
            &HttpClientConfig::default(),
        )
        .unwrap();
        let rows = store.query_rows("val-1", "tok").await.unwrap();
        assert_eq!(rows.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), vec!["r1", "r2"]);
    }

    #[tokio::test]
    async fn http_trigger_posts_typed_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/trigger"))
            .and(body_json(json!({
                "registration_key": "KEY123",
                "organization_code": "9876",
                "access_token": "tok",
                "subject_id": "user-1",
                "sink_target_id": "db-1",
                "subject_type": "company"
            })))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let trigger =
            HttpTrigger::new(format!("{}/trigger", server.uri()), &HttpClientConfig::default())
                .unwrap();
        trigger.trigger(company()).await.unwrap();
    }

    #[tokio::test]
    async fn http_trigger_reports_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("missing"))
            .mount(&server)
            .await;

        let trigger = HttpTrigger::new(server.uri(), &HttpClientConfig::default()).unwrap();
        let err = trigger.trigger(associate()).await.unwrap_err();
        assert!(matches!(err, TriggerError::Rejected { status: 400, .. }));
    }
}
