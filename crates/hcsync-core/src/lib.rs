//! Core domain model for the Healthy Corners delivery sync.
//!
//! Records mirror the record-store schema: every table row is an opaque,
//! base-local `id` plus a set of named fields. Field names follow the
//! record store's camelCase column names so records round-trip through serde
//! without a mapping layer.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "hcsync-core";

/// Date format used by the record store for date-only fields.
pub const RECORD_DATE_FORMAT: &str = "%Y-%m-%d";

/// One of the two independently-keyed copies of the record-store schema.
///
/// Ids are never shared between bases; the same logical store has a
/// different id in DEV and PROD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Base {
    Dev,
    Prod,
}

impl Base {
    pub const ALL: [Base; 2] = [Base::Dev, Base::Prod];

    pub fn as_str(&self) -> &'static str {
        match self {
            Base::Dev => "DEV",
            Base::Prod => "PROD",
        }
    }
}

impl fmt::Display for Base {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown base {0:?}; expected DEV or PROD")]
pub struct ParseBaseError(String);

impl FromStr for Base {
    type Err = ParseBaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEV" => Ok(Base::Dev),
            "PROD" => Ok(Base::Prod),
            _ => Err(ParseBaseError(s.to_string())),
        }
    }
}

/// Record-store tables touched by the sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Table {
    Stores,
    Products,
    Customers,
}

impl Table {
    pub fn table_name(&self) -> &'static str {
        match self {
            Table::Stores => "Stores",
            Table::Products => "Products",
            Table::Customers => "Customers",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

/// Which correction table a raw feed name is looked up in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NameKind {
    Store,
    Product,
}

/// One store's row in an upstream delivery snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliverySnapshotEntry {
    pub store_name: String,
    #[serde(default)]
    pub products: Vec<String>,
    #[serde(default)]
    pub last_delivery_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreRecord {
    pub id: String,
    pub store_name: String,
    #[serde(default)]
    pub product_ids: Vec<String>,
    #[serde(default)]
    pub latest_delivery: Option<NaiveDate>,
    #[serde(default)]
    pub do_not_display: bool,
    /// Remaining columns (address, hours, coordinates, ...) carried untyped.
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

impl StoreRecord {
    pub fn new(id: impl Into<String>, store_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            store_name: store_name.into(),
            product_ids: Vec::new(),
            latest_delivery: None,
            do_not_display: false,
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductRecord {
    pub id: String,
    pub full_name: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

impl ProductRecord {
    pub fn new(id: impl Into<String>, full_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            full_name: full_name.into(),
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub favorite_store_ids: Vec<String>,
    #[serde(default)]
    pub delivery_notifications: Vec<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

/// Generic `{id, fields}` patch handed to the record store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordUpdate {
    pub id: String,
    pub fields: JsonMap<String, JsonValue>,
}

/// Field values the reconciliation engine writes onto a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreFields {
    pub product_ids: Vec<String>,
    /// `None` leaves the column untouched; `Some(None)` writes an empty date.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_delivery: Option<Option<NaiveDate>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreFieldUpdate {
    pub id: String,
    pub fields: StoreFields,
}

impl StoreFieldUpdate {
    pub fn clear(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: StoreFields {
                product_ids: Vec::new(),
                latest_delivery: None,
            },
        }
    }

    pub fn delivery(
        id: impl Into<String>,
        product_ids: Vec<String>,
        latest_delivery: Option<NaiveDate>,
    ) -> Self {
        Self {
            id: id.into(),
            fields: StoreFields {
                product_ids,
                latest_delivery: Some(latest_delivery),
            },
        }
    }

    pub fn to_record_update(&self) -> RecordUpdate {
        let mut fields = JsonMap::new();
        fields.insert(
            "productIds".to_string(),
            JsonValue::from(self.fields.product_ids.clone()),
        );
        if let Some(latest) = self.fields.latest_delivery {
            let value = match latest {
                Some(date) => JsonValue::String(date.format(RECORD_DATE_FORMAT).to_string()),
                None => JsonValue::Null,
            };
            fields.insert("latestDelivery".to_string(), value);
        }
        RecordUpdate {
            id: self.id.clone(),
            fields,
        }
    }
}

/// A business key that resolved to more than one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AmbiguousKey {
    pub base: Base,
    pub table: Table,
    pub key: String,
    pub chosen_id: String,
    pub candidate_ids: Vec<String>,
}

/// Outcome report of one reconciliation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationResult {
    pub updated_store_names: BTreeSet<String>,
    pub no_delivery_store_names: BTreeSet<String>,
    pub missing_store_names: BTreeSet<String>,
    pub missing_product_names: BTreeSet<String>,
    /// Stores whose linkage was kept because of the retention grace window.
    #[serde(default)]
    pub retained_store_names: BTreeSet<String>,
    #[serde(default)]
    pub ambiguous_keys: Vec<AmbiguousKey>,
    /// Closest canonical name for each missing store/product, when one is close enough.
    #[serde(default)]
    pub suggestions: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifiableCustomer {
    pub name: String,
    pub phone_number: Option<String>,
    pub favorite_stores: Vec<String>,
}
