use std::collections::HashMap;

use hcsync_core::{AmbiguousKey, Base, ProductRecord, StoreRecord, Table};
use tracing::warn;

/// A record addressed across bases by a human-meaningful unique field.
pub trait BusinessKeyed {
    const TABLE: Table;

    fn record_id(&self) -> &str;

    fn business_key(&self) -> &str;
}

impl BusinessKeyed for StoreRecord {
    const TABLE: Table = Table::Stores;

    fn record_id(&self) -> &str {
        &self.id
    }

    fn business_key(&self) -> &str {
        &self.store_name
    }
}

impl BusinessKeyed for ProductRecord {
    const TABLE: Table = Table::Products;

    fn record_id(&self) -> &str {
        &self.id
    }

    fn business_key(&self) -> &str {
        &self.full_name
    }
}

/// Business key -> first record carrying it, in input order.
///
/// Later records sharing a key are never returned; each such key is reported
/// once in `ambiguous`.
pub struct KeyIndex<'a, R> {
    first: HashMap<&'a str, &'a R>,
    pub ambiguous: Vec<AmbiguousKey>,
}

impl<'a, R: BusinessKeyed> KeyIndex<'a, R> {
    pub fn build(base: Base, records: &'a [R]) -> Self {
        let mut first: HashMap<&'a str, &'a R> = HashMap::new();
        let mut collisions: Vec<(&'a str, Vec<String>)> = Vec::new();
        for record in records {
            let key = record.business_key();
            let Some(chosen) = first.get(key).copied() else {
                first.insert(key, record);
                continue;
            };
            match collisions.iter_mut().find(|(k, _)| *k == key) {
                Some((_, ids)) => ids.push(record.record_id().to_string()),
                None => collisions.push((
                    key,
                    vec![chosen.record_id().to_string(), record.record_id().to_string()],
                )),
            }
        }

        let ambiguous = collisions
            .into_iter()
            .map(|(key, candidate_ids)| {
                let chosen_id = candidate_ids[0].clone();
                warn!(
                    base = %base,
                    table = %R::TABLE,
                    key,
                    chosen_id = %chosen_id,
                    candidates = candidate_ids.len(),
                    "business key matches several records; using the first"
                );
                AmbiguousKey {
                    base,
                    table: R::TABLE,
                    key: key.to_string(),
                    chosen_id,
                    candidate_ids,
                }
            })
            .collect();

        Self { first, ambiguous }
    }

    pub fn get(&self, key: &str) -> Option<&'a R> {
        self.first.get(key).copied()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.first.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &'a str> + '_ {
        self.first.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_record_wins_and_collisions_are_reported_once() {
        let stores = vec![
            StoreRecord::new("rec1", "Ken Mart"),
            StoreRecord::new("rec2", "Nam's Market"),
            StoreRecord::new("rec3", "Ken Mart"),
            StoreRecord::new("rec4", "Ken Mart"),
        ];
        let index = KeyIndex::build(Base::Prod, &stores);

        assert_eq!(index.get("Ken Mart").map(|s| s.id.as_str()), Some("rec1"));
        assert!(index.contains("Nam's Market"));
        assert_eq!(index.ambiguous.len(), 1);
        let collision = &index.ambiguous[0];
        assert_eq!(collision.table, Table::Stores);
        assert_eq!(collision.chosen_id, "rec1");
        assert_eq!(collision.candidate_ids, vec!["rec1", "rec3", "rec4"]);
    }
}
