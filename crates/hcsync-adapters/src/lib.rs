//! Upstream delivery-feed adapters.
//!
//! Each adapter fetches a raw payload and parses it into un-normalized
//! [`DeliverySnapshotEntry`] rows. Name correction happens downstream; the
//! adapters only apply feed hygiene (trimming, header and sentinel rows).

use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use hcsync_core::DeliverySnapshotEntry;
use hcsync_storage::{HttpFetcher, RequestSpec, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "hcsync-adapters";

pub const APPIAN_PRODUCTION_URL: &str =
    "https://dcck.appiancloud.com/suite/webapi/recent-order-data";
pub const SHEETS_API_URL: &str = "https://sheets.googleapis.com/v4/spreadsheets";
pub const STORE_PRODUCTS_RANGE: &str = "Blueprint - Store Products";

/// Summary rows a tabular feed appends after the per-store rows.
pub const GRAND_TOTAL_SENTINEL: &str = "Grand Total";
const SHEET_HEADER_ROWS: usize = 2;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("upstream feed unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AdapterError {
    fn malformed(feed: &str, detail: impl std::fmt::Display) -> Self {
        Self::UpstreamUnavailable(format!("malformed {feed} payload: {detail}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadFormat {
    Appian,
    SheetValues,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPayload {
    pub feed: &'static str,
    pub source: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

impl FetchedPayload {
    pub fn extension(&self) -> &'static str {
        "json"
    }
}

/// Where the run's delivery snapshot comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedConfig {
    Appian {
        url: String,
        api_key: String,
    },
    Sheets {
        api_url: String,
        spreadsheet_id: String,
        range: String,
        access_token: String,
    },
    File {
        path: PathBuf,
    },
}

#[async_trait]
pub trait SnapshotSource: Send + Sync {
    fn feed_id(&self) -> &'static str;

    async fn fetch_payload(&self, http: &HttpFetcher) -> Result<FetchedPayload, AdapterError>;

    fn parse_snapshot(
        &self,
        payload: &FetchedPayload,
    ) -> Result<Vec<DeliverySnapshotEntry>, AdapterError>;
}

/// Fetch and parse in one step; callers that archive payloads use the two halves directly.
pub async fn fetch_snapshot(
    source: &dyn SnapshotSource,
    http: &HttpFetcher,
) -> Result<Vec<DeliverySnapshotEntry>, AdapterError> {
    let payload = source.fetch_payload(http).await?;
    source.parse_snapshot(&payload)
}

pub fn source_for_feed(feed: &FeedConfig) -> Box<dyn SnapshotSource> {
    match feed {
        FeedConfig::Appian { url, api_key } => Box::new(AppianSource {
            url: url.clone(),
            api_key: api_key.clone(),
        }),
        FeedConfig::Sheets {
            api_url,
            spreadsheet_id,
            range,
            access_token,
        } => Box::new(SheetsSource {
            api_url: api_url.clone(),
            spreadsheet_id: spreadsheet_id.clone(),
            range: range.clone(),
            access_token: access_token.clone(),
        }),
        FeedConfig::File { path } => Box::new(FileSource { path: path.clone() }),
    }
}

/// Accepts `YYYY-MM-DD`, `M/D/YYYY` and RFC 3339 timestamps; blank means no delivery date.
pub fn parse_delivery_date(raw: &str) -> Option<Result<NaiveDate, String>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let parsed = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%m/%d/%Y"))
        .ok()
        .or_else(|| {
            DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|ts| ts.date_naive())
        });
    Some(parsed.ok_or_else(|| format!("unrecognised delivery date {raw:?}")))
}

fn delivery_date(feed: &str, raw: Option<&str>) -> Result<Option<NaiveDate>, AdapterError> {
    match raw.and_then(parse_delivery_date) {
        None => Ok(None),
        Some(Ok(date)) => Ok(Some(date)),
        Some(Err(detail)) => Err(AdapterError::malformed(feed, detail)),
    }
}

fn cell_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppianRecord {
    store_name: String,
    #[serde(default)]
    products: Vec<String>,
    #[serde(default)]
    last_delivery_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AppianResponse {
    data: Vec<AppianRecord>,
}

#[derive(Debug, Deserialize)]
struct SheetValuesResponse {
    #[serde(default)]
    values: Vec<Vec<JsonValue>>,
}

pub fn parse_appian_payload(body: &[u8]) -> Result<Vec<DeliverySnapshotEntry>, AdapterError> {
    let response: AppianResponse =
        serde_json::from_slice(body).map_err(|e| AdapterError::malformed("appian", e))?;
    response
        .data
        .into_iter()
        .map(|record| {
            Ok(DeliverySnapshotEntry {
                store_name: record.store_name.trim().to_string(),
                products: record
                    .products
                    .iter()
                    .map(|p| p.trim())
                    .filter(|p| !p.is_empty())
                    .map(ToString::to_string)
                    .collect(),
                last_delivery_date: delivery_date("appian", record.last_delivery_date.as_deref())?,
            })
        })
        .collect()
}

/// Rows follow the "Blueprint - Store Products" layout: two header rows, then
/// `store name | last delivery | product...` with blank cells between products.
pub fn parse_sheet_rows(
    rows: &[Vec<JsonValue>],
) -> Result<Vec<DeliverySnapshotEntry>, AdapterError> {
    let mut entries = Vec::new();
    for row in rows.iter().skip(SHEET_HEADER_ROWS) {
        let cells = row.iter().map(cell_text).collect::<Vec<_>>();
        let Some(store_name) = cells.first().filter(|name| !name.is_empty()) else {
            continue;
        };
        if store_name == GRAND_TOTAL_SENTINEL {
            debug!("skipping grand total row");
            continue;
        }
        entries.push(DeliverySnapshotEntry {
            store_name: store_name.clone(),
            last_delivery_date: delivery_date("sheets", cells.get(1).map(String::as_str))?,
            products: cells
                .iter()
                .skip(2)
                .filter(|p| !p.is_empty())
                .cloned()
                .collect(),
        });
    }
    Ok(entries)
}

pub fn parse_sheet_payload(body: &[u8]) -> Result<Vec<DeliverySnapshotEntry>, AdapterError> {
    let response: SheetValuesResponse =
        serde_json::from_slice(body).map_err(|e| AdapterError::malformed("sheets", e))?;
    parse_sheet_rows(&response.values)
}

/// Tell an Appian payload from a sheet-values payload by its top-level key.
pub fn detect_payload_format(body: &[u8]) -> Result<PayloadFormat, AdapterError> {
    let value: JsonValue =
        serde_json::from_slice(body).map_err(|e| AdapterError::malformed("file", e))?;
    if value.get("data").is_some() {
        Ok(PayloadFormat::Appian)
    } else if value.get("values").is_some() {
        Ok(PayloadFormat::SheetValues)
    } else {
        Err(AdapterError::malformed(
            "file",
            "expected a top-level \"data\" or \"values\" key",
        ))
    }
}

async fn fetch_remote(
    http: &HttpFetcher,
    feed: &'static str,
    spec: RequestSpec,
) -> Result<FetchedPayload, AdapterError> {
    let fetched_at = Utc::now();
    let response = http
        .send(feed, &spec)
        .await
        .map_err(|e| AdapterError::UpstreamUnavailable(format!("{feed}: {e}")))?;
    Ok(FetchedPayload {
        feed,
        source: response.final_url,
        body: response.body,
        fetched_at,
    })
}

#[derive(Debug, Clone)]
pub struct AppianSource {
    pub url: String,
    pub api_key: String,
}

#[async_trait]
impl SnapshotSource for AppianSource {
    fn feed_id(&self) -> &'static str {
        "appian"
    }

    async fn fetch_payload(&self, http: &HttpFetcher) -> Result<FetchedPayload, AdapterError> {
        let spec = RequestSpec::get(&self.url)
            .header("Appian-Api-Key", &self.api_key)
            .header("Accept", "application/json");
        fetch_remote(http, self.feed_id(), spec).await
    }

    fn parse_snapshot(
        &self,
        payload: &FetchedPayload,
    ) -> Result<Vec<DeliverySnapshotEntry>, AdapterError> {
        parse_appian_payload(&payload.body)
    }
}

#[derive(Debug, Clone)]
pub struct SheetsSource {
    pub api_url: String,
    pub spreadsheet_id: String,
    pub range: String,
    pub access_token: String,
}

impl SheetsSource {
    pub fn values_url(&self) -> Result<Url, AdapterError> {
        let mut url = Url::parse(&self.api_url)
            .with_context(|| format!("parsing sheets api url {}", self.api_url))?;
        url.path_segments_mut()
            .map_err(|_| {
                AdapterError::UpstreamUnavailable("sheets api url cannot be a base".into())
            })?
            .pop_if_empty()
            .extend([self.spreadsheet_id.as_str(), "values", self.range.as_str()]);
        Ok(url)
    }
}

#[async_trait]
impl SnapshotSource for SheetsSource {
    fn feed_id(&self) -> &'static str {
        "sheets"
    }

    async fn fetch_payload(&self, http: &HttpFetcher) -> Result<FetchedPayload, AdapterError> {
        let spec = RequestSpec::get(self.values_url()?.as_str()).bearer(&self.access_token);
        fetch_remote(http, self.feed_id(), spec).await
    }

    fn parse_snapshot(
        &self,
        payload: &FetchedPayload,
    ) -> Result<Vec<DeliverySnapshotEntry>, AdapterError> {
        parse_sheet_payload(&payload.body)
    }
}

/// Reads a locally exported payload; used for manual runs and fixtures.
#[derive(Debug, Clone)]
pub struct FileSource {
    pub path: PathBuf,
}

#[async_trait]
impl SnapshotSource for FileSource {
    fn feed_id(&self) -> &'static str {
        "file"
    }

    async fn fetch_payload(&self, _http: &HttpFetcher) -> Result<FetchedPayload, AdapterError> {
        let body = fs::read(&self.path).map_err(|e| {
            AdapterError::UpstreamUnavailable(format!("reading {}: {e}", self.path.display()))
        })?;
        Ok(FetchedPayload {
            feed: self.feed_id(),
            source: self.path.display().to_string(),
            body,
            fetched_at: Utc::now(),
        })
    }

    fn parse_snapshot(
        &self,
        payload: &FetchedPayload,
    ) -> Result<Vec<DeliverySnapshotEntry>, AdapterError> {
        match detect_payload_format(&payload.body)? {
            PayloadFormat::Appian => parse_appian_payload(&payload.body),
            PayloadFormat::SheetValues => parse_sheet_payload(&payload.body),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn delivery_dates_accept_feed_formats() {
        assert_eq!(parse_delivery_date("2020-04-20"), Some(Ok(date(2020, 4, 20))));
        assert_eq!(parse_delivery_date("4/9/2020"), Some(Ok(date(2020, 4, 9))));
        assert_eq!(
            parse_delivery_date("2020-04-20T14:30:00Z"),
            Some(Ok(date(2020, 4, 20)))
        );
        assert_eq!(parse_delivery_date("  "), None);
        assert!(matches!(parse_delivery_date("last tuesday"), Some(Err(_))));
    }

    #[test]
    fn appian_payload_keeps_raw_names() {
        let body = json!({
            "data": [
                {
                    "storeName": "Ken Mart Inc",
                    "products": ["Grapes, Red Seedless, Fresh Cut", " "],
                    "lastDeliveryDate": "2020-04-20"
                },
                { "storeName": "Z-Mart", "products": [], "lastDeliveryDate": null }
            ]
        });
        let entries = parse_appian_payload(body.to_string().as_bytes()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].store_name, "Ken Mart Inc");
        assert_eq!(entries[0].products, vec!["Grapes, Red Seedless, Fresh Cut".to_string()]);
        assert_eq!(entries[0].last_delivery_date, Some(date(2020, 4, 20)));
        assert_eq!(entries[1].last_delivery_date, None);
    }

    #[test]
    fn appian_payload_without_data_is_upstream_unavailable() {
        let err = parse_appian_payload(br#"{"error":"nope"}"#).unwrap_err();
        assert!(matches!(err, AdapterError::UpstreamUnavailable(_)));
    }

    #[test]
    fn bad_dates_make_the_payload_malformed() {
        let body = json!({ "data": [{ "storeName": "A", "lastDeliveryDate": "soon" }] });
        let err = parse_appian_payload(body.to_string().as_bytes()).unwrap_err();
        assert!(err.to_string().contains("malformed appian payload"));
    }

    #[test]
    fn sheet_rows_skip_headers_blanks_and_grand_total() {
        let rows = vec![
            vec![json!("Date Range Length"), json!("7")],
            vec![json!("Store"), json!("Last Delivery"), json!("Products")],
            vec![
                json!("Nams Market"),
                json!("4/20/2020"),
                json!("Kale (bunch)"),
                json!(""),
                json!("Frozen Peas"),
            ],
            vec![],
            vec![json!(""), json!("4/20/2020"), json!("Orphan")],
            vec![json!("Grand Total"), json!(""), json!("42")],
        ];
        let entries = parse_sheet_rows(&rows).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].store_name, "Nams Market");
        assert_eq!(
            entries[0].products,
            vec!["Kale (bunch)".to_string(), "Frozen Peas".to_string()]
        );
        assert_eq!(entries[0].last_delivery_date, Some(date(2020, 4, 20)));
    }

    #[test]
    fn payload_format_is_detected_from_top_level_key() {
        assert_eq!(detect_payload_format(br#"{"data":[]}"#).unwrap(), PayloadFormat::Appian);
        assert_eq!(
            detect_payload_format(br#"{"range":"x","values":[]}"#).unwrap(),
            PayloadFormat::SheetValues
        );
        assert!(detect_payload_format(br#"{"rows":[]}"#).is_err());
    }

    #[test]
    fn sheets_values_url_encodes_the_range() {
        let source = SheetsSource {
            api_url: SHEETS_API_URL.to_string(),
            spreadsheet_id: "sheet123".to_string(),
            range: STORE_PRODUCTS_RANGE.to_string(),
            access_token: "token".to_string(),
        };
        assert_eq!(
            source.values_url().unwrap().as_str(),
            "https://sheets.googleapis.com/v4/spreadsheets/sheet123/values/Blueprint%20-%20Store%20Products"
        );
    }

    #[test]
    fn registry_maps_feeds_to_sources() {
        let source = source_for_feed(&FeedConfig::File {
            path: PathBuf::from("fixtures/appian/sample/response.json"),
        });
        assert_eq!(source.feed_id(), "file");
        let source = source_for_feed(&FeedConfig::Appian {
            url: APPIAN_PRODUCTION_URL.to_string(),
            api_key: "k".to_string(),
        });
        assert_eq!(source.feed_id(), "appian");
    }
}
