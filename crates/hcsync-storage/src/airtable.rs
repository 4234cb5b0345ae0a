use async_trait::async_trait;
use hcsync_core::{Base, CustomerRecord, ProductRecord, RecordUpdate, StoreRecord, Table};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use tracing::{debug, info, warn};

use crate::{
    chunk_count, FetchError, HttpFetcher, RecordStore, RequestSpec, StoreError,
    MAX_RECORDS_PER_REQUEST,
};

/// Record ids are looked up this many at a time to keep formula URLs short.
const IDS_PER_FORMULA: usize = 50;
const PAGE_SIZE: &str = "100";

#[derive(Debug, Clone)]
pub struct AirtableConfig {
    pub api_url: String,
    pub api_key: String,
    pub dev_base_id: String,
    pub prod_base_id: String,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    records: Vec<AirtableRecord>,
    #[serde(default)]
    offset: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AirtableRecord {
    id: String,
    #[serde(default)]
    fields: JsonMap<String, JsonValue>,
}

/// [`RecordStore`] backed by the Airtable REST API, one base id per [`Base`].
#[derive(Debug)]
pub struct AirtableStore {
    http: HttpFetcher,
    config: AirtableConfig,
}

impl AirtableStore {
    pub fn new(http: HttpFetcher, config: AirtableConfig) -> Self {
        Self { http, config }
    }

    fn base_id(&self, base: Base) -> Result<&str, StoreError> {
        let id = match base {
            Base::Dev => self.config.dev_base_id.as_str(),
            Base::Prod => self.config.prod_base_id.as_str(),
        };
        if id.trim().is_empty() {
            return Err(StoreError::UnknownBase(base));
        }
        Ok(id)
    }

    fn table_url(&self, base: Base, table: Table) -> Result<String, StoreError> {
        Ok(format!(
            "{}/{}/{}",
            self.config.api_url.trim_end_matches('/'),
            self.base_id(base)?,
            table.table_name()
        ))
    }

    fn request(&self, method: Method, url: &str) -> RequestSpec {
        RequestSpec::new(method, url).bearer(&self.config.api_key)
    }

    async fn list_records(
        &self,
        base: Base,
        table: Table,
        formula: Option<&str>,
    ) -> Result<Vec<AirtableRecord>, StoreError> {
        let url = self.table_url(base, table)?;
        let mut records = Vec::new();
        let mut offset: Option<String> = None;

        loop {
            let mut spec = self.request(Method::GET, &url).query("pageSize", PAGE_SIZE);
            if let Some(formula) = formula {
                spec = spec.query("filterByFormula", formula);
            }
            if let Some(offset) = &offset {
                spec = spec.query("offset", offset.clone());
            }

            let response = self
                .http
                .send(table.table_name(), &spec)
                .await
                .map_err(|source| StoreError::Read { base, table, source })?;
            let page: ListResponse = serde_json::from_slice(&response.body)
                .map_err(|source| StoreError::Decode { base, table, source })?;

            records.extend(page.records);
            match page.offset {
                Some(next) => offset = Some(next),
                None => break,
            }
        }

        debug!(%base, %table, count = records.len(), "listed records");
        Ok(records)
    }

    async fn list_typed<T: DeserializeOwned>(
        &self,
        base: Base,
        table: Table,
        formula: Option<&str>,
    ) -> Result<Vec<T>, StoreError> {
        let records = self.list_records(base, table, formula).await?;
        Ok(decode_records(base, table, records))
    }

    async fn write_chunks(
        &self,
        base: Base,
        table: Table,
        method: Method,
        bodies: Vec<JsonValue>,
    ) -> Result<Vec<AirtableRecord>, StoreError> {
        let url = self.table_url(base, table)?;
        let total_chunks = chunk_count(bodies.len());
        let mut written = Vec::with_capacity(bodies.len());

        for (index, chunk) in bodies.chunks(MAX_RECORDS_PER_REQUEST).enumerate() {
            let write_failure = |applied_chunks: usize, source: FetchError| {
                StoreError::WriteFailure {
                    base,
                    table,
                    applied_chunks,
                    total_chunks,
                    source,
                }
            };
            let spec = self
                .request(method.clone(), &url)
                .json(json!({ "records": chunk }));
            let response = self
                .http
                .send(table.table_name(), &spec)
                .await
                .map_err(|source| write_failure(index, source))?;
            // The chunk was accepted even when its echo cannot be read back.
            let page = decode_write_response(&response.final_url, &response.body)
                .map_err(|source| write_failure(index + 1, source))?;
            written.extend(page.records);
        }

        info!(
            %base,
            %table,
            records = bodies.len(),
            chunks = total_chunks,
            %method,
            "wrote records"
        );
        Ok(written)
    }
}

fn decode_write_response(url: &str, body: &[u8]) -> Result<ListResponse, FetchError> {
    serde_json::from_slice(body).map_err(|source| FetchError::Body {
        url: url.to_string(),
        source,
    })
}

/// Rows that fail to decode (blank rows lack their name field) are logged and skipped.
fn decode_records<T: DeserializeOwned>(
    base: Base,
    table: Table,
    records: Vec<AirtableRecord>,
) -> Vec<T> {
    records
        .into_iter()
        .filter_map(|record| {
            let id = record.id.clone();
            let mut object = record.fields;
            object.insert("id".to_string(), JsonValue::String(record.id));
            match serde_json::from_value(JsonValue::Object(object)) {
                Ok(decoded) => Some(decoded),
                Err(error) => {
                    warn!(%base, %table, id = %id, %error, "skipping undecodable record");
                    None
                }
            }
        })
        .collect()
}

fn record_id_formula(ids: &[String]) -> String {
    let clauses = ids
        .iter()
        .map(|id| format!("RECORD_ID()='{}'", id.replace('\'', "\\'")))
        .collect::<Vec<_>>()
        .join(",");
    format!("OR({clauses})")
}

#[async_trait]
impl RecordStore for AirtableStore {
    async fn get_all_stores(&self, base: Base) -> Result<Vec<StoreRecord>, StoreError> {
        self.list_typed(base, Table::Stores, None).await
    }

    async fn get_all_products(&self, base: Base) -> Result<Vec<ProductRecord>, StoreError> {
        self.list_typed(base, Table::Products, None).await
    }

    async fn get_all_customers(&self, base: Base) -> Result<Vec<CustomerRecord>, StoreError> {
        self.list_typed(base, Table::Customers, None).await
    }

    async fn get_stores_by_ids(
        &self,
        base: Base,
        ids: &[String],
    ) -> Result<Vec<StoreRecord>, StoreError> {
        let mut stores = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(IDS_PER_FORMULA) {
            let formula = record_id_formula(chunk);
            stores.extend(
                self.list_typed::<StoreRecord>(base, Table::Stores, Some(&formula))
                    .await?,
            );
        }
        Ok(stores)
    }

    async fn update_many(
        &self,
        base: Base,
        table: Table,
        updates: &[RecordUpdate],
    ) -> Result<(), StoreError> {
        let bodies = updates
            .iter()
            .map(|u| json!({ "id": u.id, "fields": u.fields }))
            .collect();
        self.write_chunks(base, table, Method::PATCH, bodies).await?;
        Ok(())
    }

    async fn create_many(
        &self,
        base: Base,
        table: Table,
        records: &[JsonMap<String, JsonValue>],
    ) -> Result<Vec<String>, StoreError> {
        let bodies = records.iter().map(|fields| json!({ "fields": fields })).collect();
        let created = self.write_chunks(base, table, Method::POST, bodies).await?;
        Ok(created.into_iter().map(|r| r.id).collect())
    }
}
