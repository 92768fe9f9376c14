use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::config::HttpSettings;
use crate::rewrite::ImageFetcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Categories,
    Questions,
    Answers,
}

impl ResourceKind {
    pub fn api_name(self) -> &'static str {
        match self {
            Self::Categories => "categories",
            Self::Questions => "questions",
            Self::Answers => "answers",
        }
    }

    /// Categories come back as one complete list; the other kinds are paged.
    pub fn is_paged(self) -> bool {
        !matches!(self, Self::Categories)
    }
}

/// An undecoded API response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPage {
    pub content_type: String,
    pub body: String,
}

impl RawPage {
    pub fn json(body: impl Into<String>) -> Self {
        Self {
            content_type: "application/json".to_string(),
            body: body.into(),
        }
    }

    pub fn csv(body: impl Into<String>) -> Self {
        Self {
            content_type: "text/csv".to_string(),
            body: body.into(),
        }
    }
}

pub trait RecordSource {
    /// Fetch one page of `kind`. `page` is `None` for unpaged resources.
    fn fetch_page(&mut self, kind: ResourceKind, page: Option<u32>) -> Result<RawPage>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("unsupported response content type `{0}` (expected text/csv or application/json)")]
    UnsupportedFormat(String),
    #[error("malformed CSV payload: {0}")]
    Csv(#[from] csv::Error),
    #[error("malformed JSON payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Decode a response body according to its media type.
pub fn decode_records<T: DeserializeOwned>(
    content_type: &str,
    body: &str,
) -> Result<Vec<T>, SourceError> {
    let media_type = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    match media_type.as_str() {
        "text/csv" => decode_csv(body),
        "application/json" => decode_json(body),
        _ => Err(SourceError::UnsupportedFormat(content_type.to_string())),
    }
}

fn decode_json<T: DeserializeOwned>(body: &str) -> Result<Vec<T>, SourceError> {
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(body)?)
}

fn decode_csv<T: DeserializeOwned>(body: &str) -> Result<Vec<T>, SourceError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(body.as_bytes());
    let headers = reader
        .headers()?
        .iter()
        .map(|header| header.trim().to_string())
        .collect::<Vec<_>>();

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row?;
        let mut object = Map::new();
        for (header, cell) in headers.iter().zip(row.iter()) {
            object.insert(header.clone(), coerce_cell(cell));
        }
        records.push(serde_json::from_value(Value::Object(object))?);
    }
    Ok(records)
}

/// CSV cells are untyped; map them onto the JSON scalars the record types expect.
fn coerce_cell(cell: &str) -> Value {
    let trimmed = cell.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    if let Ok(number) = trimmed.parse::<i64>() {
        return Value::from(number);
    }
    match trimmed {
        "true" | "True" | "TRUE" => return Value::Bool(true),
        "false" | "False" | "FALSE" => return Value::Bool(false),
        _ => {}
    }
    if (trimmed.starts_with('[') || trimmed.starts_with('{'))
        && let Ok(value) = serde_json::from_str::<Value>(trimmed)
    {
        return value;
    }
    Value::String(cell.to_string())
}

/// Fetch every record of `kind`, paging from 1 until an empty page.
pub fn fetch_all<T, S>(source: &mut S, kind: ResourceKind) -> Result<Vec<T>>
where
    T: DeserializeOwned,
    S: RecordSource + ?Sized,
{
    if !kind.is_paged() {
        let raw = source.fetch_page(kind, None)?;
        return decode_records(&raw.content_type, &raw.body)
            .with_context(|| format!("failed to decode {}", kind.api_name()));
    }

    let mut output = Vec::new();
    let mut page = 1u32;
    loop {
        let records = fetch_records::<T, S>(source, kind, page)?;
        if records.is_empty() {
            break;
        }
        output.extend(records);
        page += 1;
    }
    Ok(output)
}

/// Fetch and decode a single page.
pub fn fetch_records<T, S>(source: &mut S, kind: ResourceKind, page: u32) -> Result<Vec<T>>
where
    T: DeserializeOwned,
    S: RecordSource + ?Sized,
{
    let raw = source.fetch_page(kind, Some(page))?;
    decode_records(&raw.content_type, &raw.body)
        .with_context(|| format!("failed to decode {} page {page}", kind.api_name()))
}

pub struct HelpjuiceClient {
    client: Client,
    api_base: String,
    api_key: String,
    settings: HttpSettings,
    last_request_at: Option<Instant>,
    request_count: usize,
}

impl HelpjuiceClient {
    pub fn new(api_base: &str, api_key: &str, settings: HttpSettings) -> Result<Self> {
        let client = build_client(&settings).context("failed to build API HTTP client")?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            settings,
            last_request_at: None,
            request_count: 0,
        })
    }

    fn apply_rate_limit(&mut self) {
        let delay = Duration::from_millis(self.settings.rate_limit_ms);
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
    }

    fn wait_before_retry(&self, attempt: usize) {
        sleep(Duration::from_millis(
            self.settings
                .retry_delay_ms
                .saturating_mul(attempt as u64 + 1),
        ));
    }
}

impl RecordSource for HelpjuiceClient {
    fn fetch_page(&mut self, kind: ResourceKind, page: Option<u32>) -> Result<RawPage> {
        let url = format!("{}/{}", self.api_base, kind.api_name());
        let mut pairs = Vec::with_capacity(2);
        if let Some(page) = page {
            pairs.push(("page", page.to_string()));
        }
        pairs.push(("api_key", self.api_key.clone()));

        for attempt in 0..=self.settings.retries {
            self.apply_rate_limit();
            self.request_count += 1;
            debug!(resource = kind.api_name(), ?page, attempt, "requesting records");
            let response = self
                .client
                .get(&url)
                .header("User-Agent", self.settings.user_agent.clone())
                .query(&pairs)
                .send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        if attempt < self.settings.retries && is_retryable_status(status) {
                            self.wait_before_retry(attempt);
                            continue;
                        }
                        bail!("{} request failed with HTTP {status}", kind.api_name());
                    }
                    let content_type = response
                        .headers()
                        .get("content-type")
                        .and_then(|value| value.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    let body = response
                        .text()
                        .with_context(|| format!("failed to read {} response", kind.api_name()))?;
                    return Ok(RawPage { content_type, body });
                }
                Err(error) => {
                    if attempt < self.settings.retries && is_retryable_error(&error) {
                        self.wait_before_retry(attempt);
                        continue;
                    }
                    return Err(error)
                        .with_context(|| format!("failed to call {} API", kind.api_name()));
                }
            }
        }

        bail!("{} request exhausted retry budget", kind.api_name())
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

/// Plain HTTP GET for image assets; kept apart from the API client so the
/// rewrite pass can borrow it while the record source is paging.
pub struct HttpDownloader {
    client: Client,
    settings: HttpSettings,
}

impl HttpDownloader {
    pub fn new(settings: HttpSettings) -> Result<Self> {
        let client = build_client(&settings).context("failed to build download HTTP client")?;
        Ok(Self { client, settings })
    }
}

impl ImageFetcher for HttpDownloader {
    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let mut last_error = None::<String>;
        for attempt in 0..=self.settings.retries {
            match self
                .client
                .get(url)
                .header("User-Agent", self.settings.user_agent.clone())
                .send()
            {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let bytes = response
                            .bytes()
                            .with_context(|| format!("failed to read {url}"))?;
                        return Ok(bytes.to_vec());
                    }
                    last_error = Some(format!("HTTP {} while fetching {url}", status.as_u16()));
                    if !is_retryable_status(status) {
                        break;
                    }
                }
                Err(error) => {
                    let retryable = is_retryable_error(&error);
                    last_error = Some(format!("failed to fetch {url}: {error}"));
                    if !retryable {
                        break;
                    }
                }
            }
            if attempt < self.settings.retries {
                sleep(Duration::from_millis(
                    self.settings
                        .retry_delay_ms
                        .saturating_mul(attempt as u64 + 1),
                ));
            }
        }
        let message = last_error.unwrap_or_else(|| format!("failed to fetch {url}"));
        bail!("{message}")
    }
}

fn build_client(settings: &HttpSettings) -> reqwest::Result<Client> {
    Client::builder()
        .timeout(Duration::from_millis(settings.timeout_ms))
        .build()
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use anyhow::Result;

    use super::{
        RawPage, RecordSource, ResourceKind, SourceError, decode_records, fetch_all,
    };
    use crate::model::{Category, Question};

    #[derive(Default)]
    struct PagedSource {
        pages: BTreeMap<(&'static str, Option<u32>), RawPage>,
        request_count: usize,
    }

    impl RecordSource for PagedSource {
        fn fetch_page(&mut self, kind: ResourceKind, page: Option<u32>) -> Result<RawPage> {
            self.request_count += 1;
            Ok(self
                .pages
                .get(&(kind.api_name(), page))
                .cloned()
                .unwrap_or_else(|| RawPage::json("[]")))
        }

        fn request_count(&self) -> usize {
            self.request_count
        }
    }

    #[test]
    fn decodes_json_with_charset_parameter() {
        let records: Vec<Category> = decode_records(
            "application/json; charset=utf-8",
            r#"[{"id": 1, "name": "Guides", "codename": "guides", "parent_id": null}]"#,
        )
        .expect("decode");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "Guides");
    }

    #[test]
    fn decodes_csv_with_header_row() {
        let body = "id,name,codename,parent_id,created_at\n1,Guides,guides,,2020-01-01\n2,Setup,setup,1,2020-01-02\n";
        let records: Vec<Category> = decode_records("text/csv", body).expect("decode");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].parent_id, None);
        assert_eq!(records[1].parent_id, Some(1));
        assert_eq!(records[1].created_at.as_deref(), Some("2020-01-02"));
    }

    #[test]
    fn csv_list_cells_are_split() {
        let body = "id,name,codename,categories,tags\n10,Install,install,\"2,7\",\"setup,linux\"\n11,2024 Notes,notes,5,2020\n";
        let records: Vec<Question> = decode_records("text/csv", body).expect("decode");
        assert_eq!(records[0].categories.len(), 2);
        assert_eq!(records[0].categories[1].id, 7);
        assert_eq!(records[0].tags, vec!["setup", "linux"]);
        assert_eq!(records[1].categories[0].id, 5);
        assert_eq!(records[1].tags, vec!["2020"]);
    }

    #[test]
    fn rejects_unsupported_content_type() {
        let error = decode_records::<Category>("text/html", "<html></html>").expect_err("must fail");
        assert!(matches!(error, SourceError::UnsupportedFormat(ref kind) if kind == "text/html"));
    }

    #[test]
    fn fetch_all_pages_until_empty() {
        let mut source = PagedSource::default();
        source.pages.insert(
            ("questions", Some(1)),
            RawPage::json(r#"[{"id": 1, "name": "A"}, {"id": 2, "name": "B"}]"#),
        );
        source.pages.insert(
            ("questions", Some(2)),
            RawPage::csv("id,name\n3,C\n"),
        );

        let questions: Vec<Question> =
            fetch_all(&mut source, ResourceKind::Questions).expect("fetch");
        assert_eq!(questions.iter().map(|q| q.id).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(source.request_count(), 3);
    }

    #[test]
    fn categories_are_fetched_unpaged() {
        let mut source = PagedSource::default();
        source.pages.insert(
            ("categories", None),
            RawPage::json(r#"[{"id": 1, "name": "Guides"}]"#),
        );

        let categories: Vec<Category> =
            fetch_all(&mut source, ResourceKind::Categories).expect("fetch");
        assert_eq!(categories.len(), 1);
        assert_eq!(source.request_count(), 1);
    }

    #[test]
    fn unsupported_page_aborts_fetch() {
        let mut source = PagedSource::default();
        source.pages.insert(
            ("answers", Some(1)),
            RawPage {
                content_type: "application/xml".to_string(),
                body: "<answers/>".to_string(),
            },
        );
        let error = fetch_all::<crate::model::Answer, _>(&mut source, ResourceKind::Answers)
            .expect_err("must fail");
        assert!(error.to_string().contains("failed to decode answers page 1"));
        assert!(
            error
                .root_cause()
                .to_string()
                .contains("unsupported response content type")
        );
    }
}
