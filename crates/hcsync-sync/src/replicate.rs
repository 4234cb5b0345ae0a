//! DEV to PROD replication of per-record field values.
//!
//! Records are joined across bases by business key only. Ids and linked-record
//! columns are base-local and never leave DEV; which columns do travel is
//! configured in `rules/replication.yaml`.

use std::path::Path;

use anyhow::{bail, Context, Result};
use hcsync_core::{AmbiguousKey, Base, ProductRecord, RecordUpdate, StoreRecord, Table};
use hcsync_storage::RecordStore;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::{info, info_span, warn, Instrument};

use crate::keyed::{BusinessKeyed, KeyIndex};

pub const REPLICATION_RULES_FILE: &str = "rules/replication.yaml";

/// Columns that must never be copied between bases.
const BASE_LOCAL_FIELDS: &[&str] = &["id", "productIds"];

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReplicationSchema {
    pub version: u32,
    pub stores: Vec<String>,
    pub products: Vec<String>,
}

impl ReplicationSchema {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let schema: Self = serde_yaml::from_str(text).context("parsing replication rules")?;
        schema.validate()?;
        Ok(schema)
    }

    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let path = root.join(REPLICATION_RULES_FILE);
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        for (table, fields, key) in [
            (Table::Stores, &self.stores, "storeName"),
            (Table::Products, &self.products, "fullName"),
        ] {
            if let Some(field) = fields.iter().find(|f| BASE_LOCAL_FIELDS.contains(&f.as_str())) {
                bail!("{table} whitelist contains base-local field {field:?}");
            }
            if !fields.iter().any(|f| f == key) {
                bail!("{table} whitelist must include the business key {key:?}");
            }
        }
        Ok(())
    }

    pub fn fields_for(&self, table: Table) -> &[String] {
        match table {
            Table::Stores => &self.stores,
            Table::Products => &self.products,
            Table::Customers => &[],
        }
    }
}

/// A record type whose whitelisted columns can be copied between bases.
pub trait Replicable: BusinessKeyed + Serialize {
    /// Whitelisted column values. Columns the record lacks are skipped when
    /// `for_create`, and sent as null otherwise so PROD matches an emptied DEV cell.
    fn project(&self, fields: &[String], for_create: bool) -> Result<JsonMap<String, JsonValue>> {
        let JsonValue::Object(all) = serde_json::to_value(self)
            .with_context(|| format!("serializing {} record {}", Self::TABLE, self.record_id()))?
        else {
            bail!("{} record {} is not an object", Self::TABLE, self.record_id());
        };
        let mut out = JsonMap::new();
        for field in fields {
            match all.get(field) {
                Some(value) => {
                    out.insert(field.clone(), value.clone());
                }
                None if for_create => {}
                None => {
                    out.insert(field.clone(), JsonValue::Null);
                }
            }
        }
        Ok(out)
    }
}

impl Replicable for StoreRecord {}

impl Replicable for ProductRecord {}

/// Field maps for DEV records whose business key has no PROD record.
pub fn plan_creates<R: Replicable>(
    dev: &[R],
    prod: &[R],
    fields: &[String],
) -> Result<Vec<JsonMap<String, JsonValue>>> {
    let prod_index = KeyIndex::build(Base::Prod, prod);
    let mut seen = std::collections::HashSet::new();
    let mut creates = Vec::new();
    for record in dev {
        let key = record.business_key();
        if prod_index.contains(key) || !seen.insert(key) {
            continue;
        }
        creates.push(record.project(fields, true)?);
    }
    Ok(creates)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldSyncPlan {
    pub updates: Vec<RecordUpdate>,
    pub ambiguous_keys: Vec<AmbiguousKey>,
    /// DEV keys with no PROD counterpart; only non-empty if creation failed upstream.
    pub unmatched_keys: Vec<String>,
}

/// One PROD update per distinct DEV business key, addressed by the PROD id.
pub fn plan_field_sync<R: Replicable>(
    dev: &[R],
    prod: &[R],
    fields: &[String],
) -> Result<FieldSyncPlan> {
    let dev_index = KeyIndex::build(Base::Dev, dev);
    let prod_index = KeyIndex::build(Base::Prod, prod);
    let mut plan = FieldSyncPlan::default();
    plan.ambiguous_keys.extend(dev_index.ambiguous.iter().cloned());
    plan.ambiguous_keys.extend(prod_index.ambiguous.iter().cloned());

    for record in dev {
        let key = record.business_key();
        let is_first = dev_index
            .get(key)
            .is_some_and(|first| first.record_id() == record.record_id());
        if !is_first {
            continue;
        }
        match prod_index.get(key) {
            Some(target) => plan.updates.push(RecordUpdate {
                id: target.record_id().to_string(),
                fields: record.project(fields, false)?,
            }),
            None => plan.unmatched_keys.push(key.to_string()),
        }
    }
    Ok(plan)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub created_ids: Vec<String>,
    pub field_updates: usize,
    pub ambiguous_keys: Vec<AmbiguousKey>,
}

/// Products first, then stores. Each table creates missing PROD records,
/// re-reads PROD, then pushes whitelisted fields onto every matched record.
pub async fn synchronize(
    store: &dyn RecordStore,
    schema: &ReplicationSchema,
) -> Result<SyncOutcome> {
    let mut outcome = SyncOutcome::default();

    let products = schema.fields_for(Table::Products);
    let dev = store.get_all_products(Base::Dev).await.context("reading DEV products")?;
    let prod = store.get_all_products(Base::Prod).await.context("reading PROD products")?;
    let creates = plan_creates(&dev, &prod, products)?;
    create_missing(store, Table::Products, &creates, &mut outcome).await?;
    let prod = store.get_all_products(Base::Prod).await.context("re-reading PROD products")?;
    let plan = plan_field_sync(&dev, &prod, products)?;
    push_fields(store, Table::Products, plan, &mut outcome).await?;

    let stores = schema.fields_for(Table::Stores);
    let dev = store.get_all_stores(Base::Dev).await.context("reading DEV stores")?;
    let prod = store.get_all_stores(Base::Prod).await.context("reading PROD stores")?;
    let creates = plan_creates(&dev, &prod, stores)?;
    create_missing(store, Table::Stores, &creates, &mut outcome).await?;
    let prod = store.get_all_stores(Base::Prod).await.context("re-reading PROD stores")?;
    let plan = plan_field_sync(&dev, &prod, stores)?;
    push_fields(store, Table::Stores, plan, &mut outcome).await?;

    Ok(outcome)
}

async fn create_missing(
    store: &dyn RecordStore,
    table: Table,
    creates: &[JsonMap<String, JsonValue>],
    outcome: &mut SyncOutcome,
) -> Result<()> {
    if creates.is_empty() {
        return Ok(());
    }
    let ids = store
        .create_many(Base::Prod, table, creates)
        .instrument(info_span!("replicate_create", table = %table, records = creates.len()))
        .await
        .with_context(|| format!("creating {table} in PROD"))?;
    info!(table = %table, created = ids.len(), "created PROD records missing from DEV copy");
    outcome.created_ids.extend(ids);
    Ok(())
}

async fn push_fields(
    store: &dyn RecordStore,
    table: Table,
    plan: FieldSyncPlan,
    outcome: &mut SyncOutcome,
) -> Result<()> {
    for key in &plan.unmatched_keys {
        warn!(table = %table, key = %key, "DEV record has no PROD counterpart after create phase");
    }
    if !plan.updates.is_empty() {
        store
            .update_many(Base::Prod, table, &plan.updates)
            .instrument(info_span!(
                "replicate_fields",
                table = %table,
                records = plan.updates.len()
            ))
            .await
            .with_context(|| format!("pushing {table} fields to PROD"))?;
    }
    info!(table = %table, updated = plan.updates.len(), "pushed DEV field values to PROD");
    outcome.field_updates += plan.updates.len();
    outcome.ambiguous_keys.extend(plan.ambiguous_keys);
    Ok(())
}
