use std::collections::HashMap;

use async_trait::async_trait;
use hcsync_core::{Base, CustomerRecord, ProductRecord, RecordUpdate, StoreRecord, Table};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map as JsonMap, Value as JsonValue};
use tokio::sync::Mutex;

use crate::{chunk_count, FetchError, RecordStore, StoreError, MAX_RECORDS_PER_REQUEST};

/// One successful `update_many`/`create_many` call, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteCall {
    pub base: Base,
    pub table: Table,
    pub created: bool,
    pub ids: Vec<String>,
}

#[derive(Debug, Default)]
struct MemoryBase {
    stores: Vec<StoreRecord>,
    products: Vec<ProductRecord>,
    customers: Vec<CustomerRecord>,
}

#[derive(Debug, Default)]
struct MemoryState {
    bases: HashMap<Base, MemoryBase>,
    next_id: u64,
    writes: Vec<WriteCall>,
    fail_after_chunks: HashMap<(Base, Table), usize>,
}

/// In-process [`RecordStore`] used by tests and dry runs.
///
/// Honors the same chunked-write contract as the remote store, including
/// partial application when a chunk fails.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    state: Mutex<MemoryState>,
}

trait Keyed: Serialize + DeserializeOwned {
    fn id(&self) -> &str;
}

impl Keyed for StoreRecord {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Keyed for ProductRecord {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Keyed for CustomerRecord {
    fn id(&self) -> &str {
        &self.id
    }
}

fn merge_fields<T: Keyed>(
    record: &T,
    fields: &JsonMap<String, JsonValue>,
) -> Result<T, serde_json::Error> {
    let mut value = serde_json::to_value(record)?;
    if let JsonValue::Object(object) = &mut value {
        for (name, field) in fields {
            object.insert(name.clone(), field.clone());
        }
    }
    serde_json::from_value(value)
}

fn from_fields<T: Keyed>(
    id: String,
    fields: &JsonMap<String, JsonValue>,
) -> Result<T, serde_json::Error> {
    let mut object = fields.clone();
    object.insert("id".to_string(), JsonValue::String(id));
    serde_json::from_value(JsonValue::Object(object))
}

fn rejected(
    base: Base,
    table: Table,
    status: u16,
    applied_chunks: usize,
    total_chunks: usize,
) -> StoreError {
    StoreError::WriteFailure {
        base,
        table,
        applied_chunks,
        total_chunks,
        source: FetchError::HttpStatus {
            status,
            url: format!("memory://{base}/{table}"),
        },
    }
}

fn apply_updates<T: Keyed>(
    base: Base,
    table: Table,
    records: &mut [T],
    updates: &[RecordUpdate],
    fail_after: Option<usize>,
) -> Result<(), StoreError> {
    let total_chunks = chunk_count(updates.len());
    for (index, chunk) in updates.chunks(MAX_RECORDS_PER_REQUEST).enumerate() {
        if fail_after == Some(index) {
            return Err(rejected(base, table, 503, index, total_chunks));
        }
        // A chunk is validated before any of it is applied.
        let mut patched = Vec::with_capacity(chunk.len());
        for update in chunk {
            let Some(position) = records.iter().position(|r| r.id() == update.id) else {
                return Err(rejected(base, table, 404, index, total_chunks));
            };
            let merged = merge_fields(&records[position], &update.fields)
                .map_err(|source| StoreError::Decode { base, table, source })?;
            patched.push((position, merged));
        }
        for (position, merged) in patched {
            records[position] = merged;
        }
    }
    Ok(())
}

fn apply_creates<T: Keyed>(
    base: Base,
    table: Table,
    records: &mut Vec<T>,
    new_records: &[JsonMap<String, JsonValue>],
    next_id: &mut u64,
    fail_after: Option<usize>,
) -> Result<Vec<String>, StoreError> {
    let total_chunks = chunk_count(new_records.len());
    let mut ids = Vec::with_capacity(new_records.len());
    for (index, chunk) in new_records.chunks(MAX_RECORDS_PER_REQUEST).enumerate() {
        if fail_after == Some(index) {
            return Err(rejected(base, table, 503, index, total_chunks));
        }
        for fields in chunk {
            *next_id += 1;
            let id = format!("rec{}{:05}", base.as_str().to_ascii_lowercase(), next_id);
            let record = from_fields(id.clone(), fields)
                .map_err(|source| StoreError::Decode { base, table, source })?;
            records.push(record);
            ids.push(id);
        }
    }
    Ok(ids)
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stores(mut self, base: Base, stores: Vec<StoreRecord>) -> Self {
        self.state.get_mut().bases.entry(base).or_default().stores = stores;
        self
    }

    pub fn with_products(mut self, base: Base, products: Vec<ProductRecord>) -> Self {
        self.state.get_mut().bases.entry(base).or_default().products = products;
        self
    }

    pub fn with_customers(mut self, base: Base, customers: Vec<CustomerRecord>) -> Self {
        self.state.get_mut().bases.entry(base).or_default().customers = customers;
        self
    }

    /// Make writes to `table` fail once `chunks` chunks of a call have been applied.
    pub async fn fail_writes_after(&self, base: Base, table: Table, chunks: usize) {
        self.state
            .lock()
            .await
            .fail_after_chunks
            .insert((base, table), chunks);
    }

    pub async fn stores(&self, base: Base) -> Vec<StoreRecord> {
        let state = self.state.lock().await;
        state.bases.get(&base).map(|b| b.stores.clone()).unwrap_or_default()
    }

    pub async fn products(&self, base: Base) -> Vec<ProductRecord> {
        let state = self.state.lock().await;
        state.bases.get(&base).map(|b| b.products.clone()).unwrap_or_default()
    }

    pub async fn write_log(&self) -> Vec<WriteCall> {
        self.state.lock().await.writes.clone()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get_all_stores(&self, base: Base) -> Result<Vec<StoreRecord>, StoreError> {
        Ok(self.stores(base).await)
    }

    async fn get_all_products(&self, base: Base) -> Result<Vec<ProductRecord>, StoreError> {
        Ok(self.products(base).await)
    }

    async fn get_all_customers(&self, base: Base) -> Result<Vec<CustomerRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.bases.get(&base).map(|b| b.customers.clone()).unwrap_or_default())
    }

    async fn update_many(
        &self,
        base: Base,
        table: Table,
        updates: &[RecordUpdate],
    ) -> Result<(), StoreError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let fail_after = state.fail_after_chunks.get(&(base, table)).copied();
        let data = state.bases.entry(base).or_default();
        match table {
            Table::Stores => apply_updates(base, table, &mut data.stores, updates, fail_after)?,
            Table::Products => apply_updates(base, table, &mut data.products, updates, fail_after)?,
            Table::Customers => {
                apply_updates(base, table, &mut data.customers, updates, fail_after)?
            }
        }
        state.writes.push(WriteCall {
            base,
            table,
            created: false,
            ids: updates.iter().map(|u| u.id.clone()).collect(),
        });
        Ok(())
    }

    async fn create_many(
        &self,
        base: Base,
        table: Table,
        records: &[JsonMap<String, JsonValue>],
    ) -> Result<Vec<String>, StoreError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let fail_after = state.fail_after_chunks.get(&(base, table)).copied();
        let data = state.bases.entry(base).or_default();
        let next_id = &mut state.next_id;
        let ids = match table {
            Table::Stores => {
                apply_creates(base, table, &mut data.stores, records, next_id, fail_after)?
            }
            Table::Products => {
                apply_creates(base, table, &mut data.products, records, next_id, fail_after)?
            }
            Table::Customers => {
                apply_creates(base, table, &mut data.customers, records, next_id, fail_after)?
            }
        };
        state.writes.push(WriteCall {
            base,
            table,
            created: true,
            ids: ids.clone(),
        });
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn update(id: &str, fields: JsonValue) -> RecordUpdate {
        RecordUpdate {
            id: id.to_string(),
            fields: fields.as_object().cloned().unwrap_or_default(),
        }
    }

    #[tokio::test]
    async fn updates_merge_into_existing_records() {
        let store = MemoryRecordStore::new()
            .with_stores(Base::Dev, vec![StoreRecord::new("rec1", "Ken Mart")]);
        store
            .update_many(
                Base::Dev,
                Table::Stores,
                &[update("rec1", json!({ "productIds": ["p1"], "latestDelivery": "2020-04-20" }))],
            )
            .await
            .unwrap();

        let stores = store.stores(Base::Dev).await;
        assert_eq!(stores[0].product_ids, vec!["p1".to_string()]);
        assert_eq!(stores[0].store_name, "Ken Mart");
        assert!(store.stores(Base::Prod).await.is_empty());
    }

    #[tokio::test]
    async fn failing_chunk_leaves_earlier_chunks_applied() {
        let stores = (0..15)
            .map(|i| StoreRecord::new(format!("rec{i}"), format!("Store {i}")))
            .collect();
        let store = MemoryRecordStore::new().with_stores(Base::Prod, stores);
        store.fail_writes_after(Base::Prod, Table::Stores, 1).await;

        let updates = (0..15)
            .map(|i| update(&format!("rec{i}"), json!({ "productIds": ["p"] })))
            .collect::<Vec<_>>();
        let err = store
            .update_many(Base::Prod, Table::Stores, &updates)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            StoreError::WriteFailure { applied_chunks: 1, total_chunks: 2, .. }
        ));
        let after = store.stores(Base::Prod).await;
        assert_eq!(after[9].product_ids, vec!["p".to_string()]);
        assert!(after[10].product_ids.is_empty());
        assert!(store.write_log().await.is_empty());
    }

    #[tokio::test]
    async fn unknown_ids_reject_the_chunk() {
        let store = MemoryRecordStore::new();
        let err = store
            .update_many(Base::Dev, Table::Stores, &[update("nope", json!({}))])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::WriteFailure { applied_chunks: 0, .. }));
    }

    #[tokio::test]
    async fn creates_assign_base_local_ids() {
        let store = MemoryRecordStore::new();
        let fields = json!({ "fullName": "Kale, (bunch)" }).as_object().cloned().unwrap();
        let dev = store.create_many(Base::Dev, Table::Products, &[fields.clone()]).await.unwrap();
        let prod = store.create_many(Base::Prod, Table::Products, &[fields]).await.unwrap();

        assert_ne!(dev, prod);
        assert!(prod[0].starts_with("recprod"));
        assert_eq!(store.products(Base::Prod).await[0].full_name, "Kale, (bunch)");
        assert_eq!(store.write_log().await.len(), 2);
    }
}
