//! Snapshot-to-record-store reconciliation.
//!
//! The engine is pure: it turns one delivery snapshot plus the current store
//! and product tables of a base into store writes and a report. Writes come in
//! two passes, clears for stores without a delivery and sets for stores in the
//! snapshot, and must be applied in that order.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{Days, NaiveDate};
use hcsync_core::{
    Base, DeliverySnapshotEntry, ProductRecord, ReconciliationResult, StoreFieldUpdate,
    StoreRecord,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::keyed::KeyIndex;
use crate::normalize::NameNormalizer;

pub const DEFAULT_RETENTION_WINDOW_DAYS: u32 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileConfig {
    /// Stores without a delivery keep their products while their last delivery
    /// is at most this many days old. Zero disables the grace period.
    pub retention_window_days: u32,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            retention_window_days: DEFAULT_RETENTION_WINDOW_DAYS,
        }
    }
}

impl ReconcileConfig {
    fn retains(&self, latest_delivery: Option<NaiveDate>, today: NaiveDate) -> bool {
        if self.retention_window_days == 0 {
            return false;
        }
        let Some(latest) = latest_delivery else {
            return false;
        };
        let earliest = today
            .checked_sub_days(Days::new(u64::from(self.retention_window_days)))
            .unwrap_or(NaiveDate::MIN);
        earliest <= latest && latest <= today
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcilePlan {
    pub clears: Vec<StoreFieldUpdate>,
    pub sets: Vec<StoreFieldUpdate>,
    pub report: ReconciliationResult,
}

impl ReconcilePlan {
    /// All writes in apply order: clears, then sets.
    pub fn writes(&self) -> impl Iterator<Item = &StoreFieldUpdate> {
        self.clears.iter().chain(self.sets.iter())
    }

    pub fn write_count(&self) -> usize {
        self.clears.len() + self.sets.len()
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileEngine {
    normalizer: NameNormalizer,
    config: ReconcileConfig,
}

impl ReconcileEngine {
    pub fn new(normalizer: NameNormalizer, config: ReconcileConfig) -> Self {
        Self { normalizer, config }
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    pub fn normalizer(&self) -> &NameNormalizer {
        &self.normalizer
    }

    pub fn reconcile(
        &self,
        base: Base,
        snapshot: &[DeliverySnapshotEntry],
        stores: &[StoreRecord],
        products: &[ProductRecord],
        today: NaiveDate,
    ) -> ReconcilePlan {
        let store_index = KeyIndex::build(base, stores);
        let product_index = KeyIndex::build(base, products);

        let mut report = ReconciliationResult::default();
        report.ambiguous_keys.extend(store_index.ambiguous.iter().cloned());
        report.ambiguous_keys.extend(product_index.ambiguous.iter().cloned());

        let mut sets: Vec<StoreFieldUpdate> = Vec::new();
        let mut set_slot: HashMap<String, usize> = HashMap::new();

        for raw in snapshot {
            let entry = self.normalizer.normalize_entry(raw);
            let Some(store) = store_index.get(&entry.store_name) else {
                info!(
                    base = %base,
                    store = %entry.store_name,
                    "snapshot store not in record store"
                );
                report.missing_store_names.insert(entry.store_name);
                continue;
            };

            let mut product_ids: Vec<String> = Vec::new();
            for name in &entry.products {
                match product_index.get(name) {
                    Some(product) => {
                        if !product_ids.contains(&product.id) {
                            product_ids.push(product.id.clone());
                        }
                    }
                    None => {
                        if report.missing_product_names.insert(name.clone()) {
                            info!(
                                base = %base,
                                product = %name,
                                "snapshot product not in record store"
                            );
                        }
                    }
                }
            }

            let update =
                StoreFieldUpdate::delivery(store.id.clone(), product_ids, entry.last_delivery_date);
            match set_slot.get(&store.id) {
                Some(&slot) => {
                    warn!(
                        base = %base,
                        store = %store.store_name,
                        "store listed twice in snapshot; keeping the later row"
                    );
                    sets[slot] = update;
                }
                None => {
                    set_slot.insert(store.id.clone(), sets.len());
                    sets.push(update);
                }
            }
            report.updated_store_names.insert(store.store_name.clone());
        }

        let mut clears = Vec::new();
        for store in stores {
            if report.updated_store_names.contains(&store.store_name) {
                continue;
            }
            report.no_delivery_store_names.insert(store.store_name.clone());
            if self.config.retains(store.latest_delivery, today) {
                debug!(
                    base = %base,
                    store = %store.store_name,
                    latest_delivery = ?store.latest_delivery,
                    "within retention window; keeping product linkage"
                );
                report.retained_store_names.insert(store.store_name.clone());
                continue;
            }
            clears.push(StoreFieldUpdate::clear(store.id.clone()));
        }

        report.suggestions = suggestions(
            &report.missing_store_names,
            store_index.keys().collect(),
            &report.missing_product_names,
            product_index.keys().collect(),
        );

        ReconcilePlan {
            clears,
            sets,
            report,
        }
    }
}

fn suggestions(
    missing_stores: &BTreeSet<String>,
    mut store_names: Vec<&str>,
    missing_products: &BTreeSet<String>,
    mut product_names: Vec<&str>,
) -> BTreeMap<String, String> {
    store_names.sort_unstable();
    product_names.sort_unstable();
    let mut out = BTreeMap::new();
    for (missing, candidates) in [
        (missing_stores, &store_names),
        (missing_products, &product_names),
    ] {
        for name in missing {
            if let Some(best) = NameNormalizer::suggest(name, candidates.iter().copied()) {
                out.insert(name.clone(), best);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn today() -> NaiveDate {
        date(2020, 4, 20)
    }

    fn normalizer() -> NameNormalizer {
        NameNormalizer::from_yaml_str(
            r#"
version: 1
stores:
  "Ken Mart Inc": "Ken Mart"
products:
  "Grapes, Red seedless, Fresh Cut": "Grapes, Red (6 oz)"
"#,
        )
        .unwrap()
    }

    fn engine(retention_window_days: u32) -> ReconcileEngine {
        ReconcileEngine::new(
            normalizer(),
            ReconcileConfig {
                retention_window_days,
            },
        )
    }

    fn entry(store: &str, products: &[&str], last: Option<NaiveDate>) -> DeliverySnapshotEntry {
        DeliverySnapshotEntry {
            store_name: store.to_string(),
            products: products.iter().map(|p| p.to_string()).collect(),
            last_delivery_date: last,
        }
    }

    fn store(id: &str, name: &str, product_ids: &[&str], latest: Option<NaiveDate>) -> StoreRecord {
        let mut record = StoreRecord::new(id, name);
        record.product_ids = product_ids.iter().map(|p| p.to_string()).collect();
        record.latest_delivery = latest;
        record
    }

    fn products() -> Vec<ProductRecord> {
        vec![
            ProductRecord::new("prodGrapes", "Grapes, Red (6 oz)"),
            ProductRecord::new("prodKale", "Kale, (bunch)"),
        ]
    }

    /// Applies a plan the way a record store would, clears first.
    fn apply(stores: &[StoreRecord], plan: &ReconcilePlan) -> Vec<StoreRecord> {
        let mut next = stores.to_vec();
        for write in plan.writes() {
            let target = next.iter_mut().find(|s| s.id == write.id).unwrap();
            target.product_ids = write.fields.product_ids.clone();
            if let Some(latest) = write.fields.latest_delivery {
                target.latest_delivery = latest;
            }
        }
        next
    }

    #[test]
    fn normalized_names_resolve_to_record_ids() {
        let snapshot = [entry(
            "Ken Mart Inc",
            &["Grapes, Red seedless, Fresh Cut"],
            Some(today()),
        )];
        let stores = [store("recKen", "Ken Mart", &[], None)];

        let plan = engine(9).reconcile(Base::Prod, &snapshot, &stores, &products(), today());

        assert!(plan.clears.is_empty());
        assert_eq!(
            plan.sets,
            vec![StoreFieldUpdate::delivery(
                "recKen",
                vec!["prodGrapes".to_string()],
                Some(today())
            )]
        );
        assert!(plan.report.updated_store_names.contains("Ken Mart"));
        assert!(plan.report.missing_product_names.is_empty());
    }

    #[test]
    fn stale_store_outside_the_window_is_cleared() {
        let stores = [store("recZ", "Z-Mart", &["prodKale"], Some(date(2020, 4, 5)))];

        let plan = engine(9).reconcile(Base::Prod, &[], &stores, &products(), today());

        assert_eq!(plan.clears, vec![StoreFieldUpdate::clear("recZ")]);
        assert!(plan.sets.is_empty());
        assert!(plan.report.no_delivery_store_names.contains("Z-Mart"));
    }

    #[test]
    fn retention_boundary_is_inclusive() {
        let stores = [
            store("recEdge", "Edge Mart", &["prodKale"], Some(date(2020, 4, 11))),
            store("recOld", "Old Mart", &["prodKale"], Some(date(2020, 4, 10))),
        ];

        let plan = engine(9).reconcile(Base::Prod, &[], &stores, &products(), today());

        assert_eq!(plan.clears, vec![StoreFieldUpdate::clear("recOld")]);
        assert!(plan.report.retained_store_names.contains("Edge Mart"));
        assert_eq!(plan.report.no_delivery_store_names.len(), 2);
    }

    #[test]
    fn zero_window_clears_every_store_without_a_delivery() {
        let stores = [
            store("recToday", "Today Mart", &["prodKale"], Some(today())),
            store("recNull", "Null Mart", &["prodKale"], None),
            store("recFuture", "Future Mart", &["prodKale"], Some(date(2020, 4, 25))),
        ];

        let plan = engine(0).reconcile(Base::Dev, &[], &stores, &products(), today());
        assert_eq!(plan.clears.len(), 3);

        let plan = engine(9).reconcile(Base::Dev, &[], &stores, &products(), today());
        assert_eq!(plan.clears.len(), 2);
        assert!(plan.report.retained_store_names.contains("Today Mart"));
    }

    #[test]
    fn unmatched_names_are_reported_without_writes() {
        let snapshot = [
            entry("Corner Pantry", &["Kale, (bunch)"], Some(today())),
            entry(
                "Ken Mart Inc",
                &["Dragonfruit, Whole", "Kale, (bunch)", "Dragonfruit, Whole"],
                Some(today()),
            ),
        ];
        let stores = [store("recKen", "Ken Mart", &[], None)];

        let plan = engine(9).reconcile(Base::Prod, &snapshot, &stores, &products(), today());

        assert_eq!(
            plan.report.missing_store_names.iter().collect::<Vec<_>>(),
            vec!["Corner Pantry"]
        );
        assert_eq!(
            plan.report.missing_product_names.iter().collect::<Vec<_>>(),
            vec!["Dragonfruit, Whole"]
        );
        assert_eq!(plan.sets.len(), 1);
        assert_eq!(plan.sets[0].fields.product_ids, vec!["prodKale"]);
        assert!(plan.writes().all(|w| w.id == "recKen"));
        assert!(!plan.report.no_delivery_store_names.contains("Corner Pantry"));
    }

    #[test]
    fn every_unmentioned_store_is_a_no_delivery_store_exactly_once() {
        let snapshot = [entry("Ken Mart Inc", &[], Some(today()))];
        let stores = [
            store("recKen", "Ken Mart", &[], None),
            store("recA", "A Mart", &[], None),
            store("recB", "B Mart", &[], None),
        ];

        let plan = engine(9).reconcile(Base::Prod, &snapshot, &stores, &products(), today());

        assert_eq!(
            plan.report.no_delivery_store_names.iter().collect::<Vec<_>>(),
            vec!["A Mart", "B Mart"]
        );
        assert!(plan
            .report
            .updated_store_names
            .is_disjoint(&plan.report.no_delivery_store_names));
    }

    #[test]
    fn second_run_over_applied_state_produces_the_same_writes() {
        let snapshot = [entry(
            "Ken Mart Inc",
            &["Grapes, Red seedless, Fresh Cut"],
            Some(today()),
        )];
        let stores = [
            store("recKen", "Ken Mart", &["prodKale"], Some(date(2020, 4, 1))),
            store("recZ", "Z-Mart", &["prodKale"], Some(date(2020, 4, 5))),
        ];
        let engine = engine(9);

        let first = engine.reconcile(Base::Prod, &snapshot, &stores, &products(), today());
        let applied = apply(&stores, &first);
        let second = engine.reconcile(Base::Prod, &snapshot, &applied, &products(), today());

        assert_eq!(first, second);
        assert_eq!(apply(&applied, &second), applied);
    }

    #[test]
    fn duplicate_store_names_use_the_first_record() {
        let snapshot = [entry("Ken Mart Inc", &["Kale, (bunch)"], Some(today()))];
        let stores = [
            store("recKen1", "Ken Mart", &[], None),
            store("recKen2", "Ken Mart", &[], None),
        ];

        let plan = engine(9).reconcile(Base::Prod, &snapshot, &stores, &products(), today());

        assert_eq!(plan.sets.len(), 1);
        assert_eq!(plan.sets[0].id, "recKen1");
        assert!(plan.clears.is_empty());
        assert_eq!(plan.report.ambiguous_keys.len(), 1);
        assert_eq!(plan.report.ambiguous_keys[0].candidate_ids, vec!["recKen1", "recKen2"]);
    }

    #[test]
    fn repeated_snapshot_rows_collapse_to_one_write() {
        let snapshot = [
            entry("Ken Mart", &["Kale, (bunch)"], Some(date(2020, 4, 19))),
            entry("Ken Mart Inc", &["Grapes, Red (6 oz)"], Some(today())),
        ];
        let stores = [store("recKen", "Ken Mart", &[], None)];

        let plan = engine(9).reconcile(Base::Prod, &snapshot, &stores, &products(), today());

        assert_eq!(
            plan.sets,
            vec![StoreFieldUpdate::delivery(
                "recKen",
                vec!["prodGrapes".to_string()],
                Some(today())
            )]
        );
    }

    #[test]
    fn missing_names_carry_close_suggestions() {
        let snapshot = [entry("Ken Mart Inc", &["Kale (bunch) "], Some(today()))];
        let stores = [store("recKen", "Ken Mart", &[], None)];

        let plan = engine(9).reconcile(Base::Prod, &snapshot, &stores, &products(), today());

        assert_eq!(
            plan.report.suggestions.get("Kale (bunch) ").map(String::as_str),
            Some("Kale, (bunch)")
        );
    }
}
