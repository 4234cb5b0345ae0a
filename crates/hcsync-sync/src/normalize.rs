//! Feed-name corrections loaded from `rules/name_corrections.yaml`.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{bail, Context, Result};
use hcsync_core::{DeliverySnapshotEntry, NameKind};
use serde::Deserialize;
use strsim::jaro_winkler;

pub const NAME_CORRECTIONS_FILE: &str = "rules/name_corrections.yaml";

/// Minimum Jaro-Winkler score for a canonical name to be offered as a suggestion.
pub const SUGGESTION_THRESHOLD: f64 = 0.85;

#[derive(Debug, Clone, Deserialize)]
struct NameCorrectionsFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    stores: BTreeMap<String, String>,
    #[serde(default)]
    products: BTreeMap<String, String>,
}

/// Static lookup from feed spellings to canonical record-store names.
#[derive(Debug, Clone, Default)]
pub struct NameNormalizer {
    stores: HashMap<String, String>,
    products: HashMap<String, String>,
}

impl NameNormalizer {
    pub fn new(
        stores: impl IntoIterator<Item = (String, String)>,
        products: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        Self {
            stores: stores.into_iter().collect(),
            products: products.into_iter().collect(),
        }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: NameCorrectionsFile =
            serde_yaml::from_str(text).context("parsing name corrections")?;
        for (kind, table) in [("stores", &file.stores), ("products", &file.products)] {
            if let Some((raw, _)) = table
                .iter()
                .find(|(raw, canonical)| raw.trim().is_empty() || canonical.trim().is_empty())
            {
                bail!("empty name in {kind} corrections (key {raw:?})");
            }
        }
        Ok(Self::new(file.stores, file.products))
    }

    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let path = root.join(NAME_CORRECTIONS_FILE);
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    fn table(&self, kind: NameKind) -> &HashMap<String, String> {
        match kind {
            NameKind::Store => &self.stores,
            NameKind::Product => &self.products,
        }
    }

    pub fn len(&self, kind: NameKind) -> usize {
        self.table(kind).len()
    }

    /// Unmapped names are assumed canonical and returned unchanged.
    pub fn normalize(&self, raw: &str, kind: NameKind) -> String {
        self.table(kind)
            .get(raw)
            .cloned()
            .unwrap_or_else(|| raw.to_string())
    }

    pub fn normalize_entry(&self, entry: &DeliverySnapshotEntry) -> DeliverySnapshotEntry {
        DeliverySnapshotEntry {
            store_name: self.normalize(&entry.store_name, NameKind::Store),
            products: entry
                .products
                .iter()
                .map(|p| self.normalize(p, NameKind::Product))
                .collect(),
            last_delivery_date: entry.last_delivery_date,
        }
    }

    /// Closest candidate to `raw`, if any scores at least [`SUGGESTION_THRESHOLD`].
    pub fn suggest<'a>(raw: &str, candidates: impl IntoIterator<Item = &'a str>) -> Option<String> {
        let needle = fold_name(raw);
        let mut best: Option<(f64, &str)> = None;
        for candidate in candidates {
            let score = jaro_winkler(&needle, &fold_name(candidate));
            if score >= SUGGESTION_THRESHOLD && best.map_or(true, |(top, _)| score > top) {
                best = Some((score, candidate));
            }
        }
        best.map(|(_, name)| name.to_string())
    }
}

fn fold_name(input: &str) -> String {
    input
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn workspace_root() -> std::path::PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
    }

    #[test]
    fn unmapped_names_pass_through() {
        let normalizer = NameNormalizer::default();
        assert_eq!(normalizer.normalize("Z-Mart", NameKind::Store), "Z-Mart");
    }

    #[test]
    fn tables_are_kind_specific() {
        let normalizer = NameNormalizer::new(
            [("Kale".to_string(), "Kale Market".to_string())],
            [("Kale".to_string(), "Kale, (bunch)".to_string())],
        );
        assert_eq!(normalizer.normalize("Kale", NameKind::Store), "Kale Market");
        assert_eq!(normalizer.normalize("Kale", NameKind::Product), "Kale, (bunch)");
    }

    #[test]
    fn checked_in_rules_load() {
        let normalizer = NameNormalizer::from_workspace_root(&workspace_root()).unwrap();
        assert_eq!(normalizer.normalize("Ken Mart Inc", NameKind::Store), "Ken Mart");
        assert_eq!(normalizer.normalize("Nams Market", NameKind::Store), "Nam's Market");
        assert_eq!(
            normalizer.normalize("Grapes, Red seedless, Fresh Cut", NameKind::Product),
            "Grapes, Red (6 oz)"
        );
        assert!(normalizer.len(NameKind::Product) > 30);
    }

    #[test]
    fn entries_are_normalized_field_by_field() {
        let normalizer = NameNormalizer::from_yaml_str(
            "version: 1\nstores:\n  \"Ken Mart Inc\": \"Ken Mart\"\nproducts:\n  \"Frozen Peas\": \"Peas, Frozen\"\n",
        )
        .unwrap();
        let entry = DeliverySnapshotEntry {
            store_name: "Ken Mart Inc".to_string(),
            products: vec!["Frozen Peas".to_string(), "Kale, (bunch)".to_string()],
            last_delivery_date: NaiveDate::from_ymd_opt(2020, 4, 20),
        };
        let normalized = normalizer.normalize_entry(&entry);
        assert_eq!(normalized.store_name, "Ken Mart");
        assert_eq!(normalized.products, vec!["Peas, Frozen", "Kale, (bunch)"]);
        assert_eq!(normalized.last_delivery_date, entry.last_delivery_date);
    }

    #[test]
    fn empty_corrections_are_rejected() {
        let err = NameNormalizer::from_yaml_str("version: 1\nstores:\n  \"Nams Market\": \"\"\n")
            .unwrap_err();
        assert!(err.to_string().contains("empty name"));
    }

    #[test]
    fn suggestions_pick_the_closest_canonical_name() {
        let candidates = ["Peas, Frozen", "Kale, (bunch)", "Spinach, Frozen"];
        assert_eq!(
            NameNormalizer::suggest("Kale (bunch) ", candidates),
            Some("Kale, (bunch)".to_string())
        );
        assert_eq!(NameNormalizer::suggest("Dragonfruit, Whole", candidates), None);
    }
}
