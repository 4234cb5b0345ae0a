//! Reconciliation runs, DEV/PROD replication and notification selection,
//! wired to the record store and the configured delivery feed.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local, NaiveDate, Utc};
use hcsync_adapters::{
    source_for_feed, FeedConfig, SnapshotSource, SHEETS_API_URL, STORE_PRODUCTS_RANGE,
};
use hcsync_core::{Base, NotifiableCustomer, ReconciliationResult, StoreFieldUpdate, Table};
use hcsync_storage::{
    AirtableConfig, AirtableStore, FeedArchive, HttpClientConfig, HttpFetcher, RecordStore,
    TokenBucketConfig,
};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

mod keyed;
pub mod normalize;
pub mod notify;
pub mod reconcile;
pub mod replicate;

pub use keyed::{BusinessKeyed, KeyIndex};
pub use normalize::NameNormalizer;
pub use reconcile::{ReconcileConfig, ReconcileEngine, ReconcilePlan};
pub use replicate::{ReplicationSchema, SyncOutcome};

pub const AIRTABLE_API_URL: &str = "https://api.airtable.com/v0";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub airtable: AirtableConfig,
    pub feed: FeedConfig,
    pub retention_window_days: u32,
    pub scheduler_enabled: bool,
    pub reconcile_cron: String,
    pub notify_cron: String,
    pub scheduled_base: Base,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub workspace_root: PathBuf,
    pub artifacts_dir: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let or = |name: &str, default: &str| var(name).unwrap_or_else(|| default.to_string());

        let feed = match or("HCSYNC_FEED", "appian").to_ascii_lowercase().as_str() {
            "appian" => FeedConfig::Appian {
                url: or("APPIAN_API_URL", hcsync_adapters::APPIAN_PRODUCTION_URL),
                api_key: or("APPIAN_API_KEY", ""),
            },
            "sheets" => FeedConfig::Sheets {
                api_url: SHEETS_API_URL.to_string(),
                spreadsheet_id: var("GOOGLE_SHEETS_SPREADSHEET_ID")
                    .context("HCSYNC_FEED=sheets requires GOOGLE_SHEETS_SPREADSHEET_ID")?,
                range: or("GOOGLE_SHEETS_RANGE", STORE_PRODUCTS_RANGE),
                access_token: or("GOOGLE_SHEETS_ACCESS_TOKEN", ""),
            },
            "file" => FeedConfig::File {
                path: var("HCSYNC_FEED_FILE")
                    .map(PathBuf::from)
                    .context("HCSYNC_FEED=file requires HCSYNC_FEED_FILE")?,
            },
            other => bail!("unknown HCSYNC_FEED {other:?}; expected appian, sheets or file"),
        };

        let retention_window_days = match var("HCSYNC_RETENTION_DAYS") {
            Some(v) => v
                .trim()
                .parse()
                .with_context(|| format!("parsing HCSYNC_RETENTION_DAYS={v:?}"))?,
            None => reconcile::DEFAULT_RETENTION_WINDOW_DAYS,
        };

        Ok(Self {
            airtable: AirtableConfig {
                api_url: or("AIRTABLE_API_URL", AIRTABLE_API_URL),
                api_key: or("AIRTABLE_API_KEY", ""),
                dev_base_id: or("AIRTABLE_DEV_BASE_ID", ""),
                prod_base_id: or("AIRTABLE_PROD_BASE_ID", ""),
            },
            feed,
            retention_window_days,
            scheduler_enabled: var("HCSYNC_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            reconcile_cron: or("HCSYNC_RECONCILE_CRON", "0 11 * * *"),
            notify_cron: or("HCSYNC_NOTIFY_CRON", "0 22 * * *"),
            scheduled_base: or("HCSYNC_SCHEDULED_BASE", "PROD")
                .parse()
                .context("parsing HCSYNC_SCHEDULED_BASE")?,
            user_agent: or("HCSYNC_USER_AGENT", "hcsync/0.1"),
            http_timeout_secs: var("HCSYNC_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            workspace_root: PathBuf::from(or("HCSYNC_WORKSPACE_ROOT", ".")),
            artifacts_dir: PathBuf::from(or("ARTIFACTS_DIR", "./artifacts")),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileRunSummary {
    pub run_id: Uuid,
    pub base: Base,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub today: NaiveDate,
    pub dry_run: bool,
    pub feed: String,
    pub payload_sha256: String,
    pub snapshot_entries: usize,
    pub cleared_stores: usize,
    pub set_stores: usize,
    pub result: ReconciliationResult,
    pub reports_dir: String,
}

pub struct SyncPipeline {
    config: SyncConfig,
    http: HttpFetcher,
    archive: FeedArchive,
    store: Arc<dyn RecordStore>,
    source: Box<dyn SnapshotSource>,
    engine: ReconcileEngine,
    schema: ReplicationSchema,
    run_lock: Mutex<()>,
    today_override: Option<NaiveDate>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let http_config = HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        };
        let http = HttpFetcher::new(http_config.clone())?;
        let record_http = HttpFetcher::new(HttpClientConfig {
            token_bucket: Some(TokenBucketConfig::record_store()),
            ..http_config
        })?;
        let store: Arc<dyn RecordStore> =
            Arc::new(AirtableStore::new(record_http, config.airtable.clone()));

        let normalizer = NameNormalizer::from_workspace_root(&config.workspace_root)?;
        let engine = ReconcileEngine::new(
            normalizer,
            ReconcileConfig {
                retention_window_days: config.retention_window_days,
            },
        );
        let schema = ReplicationSchema::from_workspace_root(&config.workspace_root)?;

        Ok(Self {
            archive: FeedArchive::new(config.artifacts_dir.clone()),
            source: source_for_feed(&config.feed),
            config,
            http,
            store,
            engine,
            schema,
            run_lock: Mutex::new(()),
            today_override: None,
        })
    }

    pub fn with_record_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_source(mut self, source: Box<dyn SnapshotSource>) -> Self {
        self.source = source;
        self
    }

    /// Pin the calendar day used for retention and notification checks.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today_override = Some(today);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn today(&self) -> NaiveDate {
        self.today_override
            .unwrap_or_else(|| Local::now().date_naive())
    }

    /// Fetch the feed, reconcile `base` against it and apply the writes, clears first.
    ///
    /// Runs are serialized per pipeline. A failed feed fetch aborts before any
    /// write; a failed write leaves earlier chunks applied and is returned.
    pub async fn run_reconcile(&self, base: Base, dry_run: bool) -> Result<ReconcileRunSummary> {
        let _running = self.run_lock.lock().await;
        let run_id = Uuid::new_v4();
        let span = info_span!("reconcile", %run_id, base = %base, dry_run);
        self.reconcile_inner(run_id, base, dry_run)
            .instrument(span)
            .await
    }

    async fn reconcile_inner(
        &self,
        run_id: Uuid,
        base: Base,
        dry_run: bool,
    ) -> Result<ReconcileRunSummary> {
        let started_at = Utc::now();
        let today = self.today();

        let payload = self
            .source
            .fetch_payload(&self.http)
            .await
            .with_context(|| format!("fetching {} feed", self.source.feed_id()))?;
        let archived = self
            .archive
            .archive(payload.fetched_at, payload.feed, payload.extension(), &payload.body)
            .await?;
        let snapshot = self
            .source
            .parse_snapshot(&payload)
            .with_context(|| format!("parsing {} feed from {}", payload.feed, payload.source))?;
        info!(
            feed = payload.feed,
            entries = snapshot.len(),
            sha256 = %archived.content_hash,
            "fetched delivery snapshot"
        );

        let stores = self.store.get_all_stores(base).await?;
        let products = self.store.get_all_products(base).await?;
        let plan = self
            .engine
            .reconcile(base, &snapshot, &stores, &products, today);
        info!(
            updated = plan.report.updated_store_names.len(),
            no_delivery = plan.report.no_delivery_store_names.len(),
            missing_stores = plan.report.missing_store_names.len(),
            missing_products = plan.report.missing_product_names.len(),
            writes = plan.write_count(),
            "reconciliation planned"
        );

        if !dry_run {
            self.apply_store_writes(base, &plan.clears, "clear stale linkage")
                .await?;
            self.apply_store_writes(base, &plan.sets, "set delivered products")
                .await?;
        }

        let finished_at = Utc::now();
        let mut summary = ReconcileRunSummary {
            run_id,
            base,
            started_at,
            finished_at,
            today,
            dry_run,
            feed: payload.feed.to_string(),
            payload_sha256: archived.content_hash,
            snapshot_entries: snapshot.len(),
            cleared_stores: plan.clears.len(),
            set_stores: plan.sets.len(),
            result: plan.report,
            reports_dir: String::new(),
        };
        let reports_dir = write_reports(&self.config.workspace_root, &summary).await?;
        summary.reports_dir = reports_dir.display().to_string();
        Ok(summary)
    }

    async fn apply_store_writes(
        &self,
        base: Base,
        writes: &[StoreFieldUpdate],
        phase: &str,
    ) -> Result<()> {
        if writes.is_empty() {
            return Ok(());
        }
        let updates: Vec<_> = writes.iter().map(StoreFieldUpdate::to_record_update).collect();
        self.store
            .update_many(base, Table::Stores, &updates)
            .await
            .with_context(|| format!("{phase} on {} {base} stores", updates.len()))?;
        info!(phase, records = updates.len(), "applied store writes");
        Ok(())
    }

    pub async fn run_replicate(&self) -> Result<SyncOutcome> {
        let _running = self.run_lock.lock().await;
        let outcome = replicate::synchronize(self.store.as_ref(), &self.schema)
            .instrument(info_span!("replicate", run_id = %Uuid::new_v4()))
            .await?;
        info!(
            created = outcome.created_ids.len(),
            field_updates = outcome.field_updates,
            ambiguous = outcome.ambiguous_keys.len(),
            "replication complete"
        );
        Ok(outcome)
    }

    /// Shares the run lock so selection never reads store links mid-reconcile.
    pub async fn select_notifiable(&self, base: Base) -> Result<Vec<NotifiableCustomer>> {
        let _running = self.run_lock.lock().await;
        let customers = self.store.get_all_customers(base).await?;
        let favorite_ids: Vec<String> = customers
            .iter()
            .filter(|c| notify::wants_sms(c))
            .flat_map(|c| c.favorite_store_ids.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if favorite_ids.is_empty() {
            return Ok(Vec::new());
        }
        let stores = self.store.get_stores_by_ids(base, &favorite_ids).await?;
        let selected = notify::select_notifiable(&customers, &stores, self.today());
        info!(
            base = %base,
            customers = customers.len(),
            selected = selected.len(),
            "selected customers to notify"
        );
        Ok(selected)
    }

    /// Reconcile then notification selection on their cron schedules, when enabled.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let base = self.config.scheduled_base;
        let sched = JobScheduler::new().await.context("creating scheduler")?;

        let pipeline = Arc::clone(self);
        let cron = self.config.reconcile_cron.as_str();
        let job = Job::new_async(cron, move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_reconcile(base, false).await {
                    Ok(summary) => info!(run_id = %summary.run_id, "scheduled reconcile finished"),
                    Err(err) => error!(error = ?err, "scheduled reconcile failed"),
                }
            })
        })
        .with_context(|| format!("creating reconcile job for cron {cron}"))?;
        sched.add(job).await.context("adding reconcile job")?;

        let pipeline = Arc::clone(self);
        let cron = self.config.notify_cron.as_str();
        let job = Job::new_async(cron, move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.select_notifiable(base).await {
                    Ok(selected) => {
                        for customer in &selected {
                            info!(
                                customer = %customer.name,
                                stores = ?customer.favorite_stores,
                                "customer due a delivery notification"
                            );
                        }
                    }
                    Err(err) => error!(error = ?err, "scheduled notification selection failed"),
                }
            })
        })
        .with_context(|| format!("creating notify job for cron {cron}"))?;
        sched.add(job).await.context("adding notify job")?;

        Ok(Some(sched))
    }
}

pub fn pipeline_from_env() -> Result<SyncPipeline> {
    SyncPipeline::new(SyncConfig::from_env()?)
}

async fn write_reports(workspace_root: &Path, summary: &ReconcileRunSummary) -> Result<PathBuf> {
    let reports_dir = workspace_root
        .join("reports")
        .join(summary.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let result = &summary.result;
    let files = [
        ("reconcile_report.json", serde_json::to_vec_pretty(summary)),
        (
            "missing_stores.json",
            serde_json::to_vec_pretty(&result.missing_store_names),
        ),
        (
            "missing_products.json",
            serde_json::to_vec_pretty(&result.missing_product_names),
        ),
    ];
    for (name, bytes) in files {
        let bytes = bytes.with_context(|| format!("serializing {name}"))?;
        fs::write(reports_dir.join(name), bytes)
            .await
            .with_context(|| format!("writing {name}"))?;
    }

    fs::write(reports_dir.join("run_brief.md"), run_brief(summary))
        .await
        .context("writing run_brief.md")?;
    Ok(reports_dir)
}

fn run_brief(summary: &ReconcileRunSummary) -> String {
    let result = &summary.result;
    let list = |names: &BTreeSet<String>| {
        if names.is_empty() {
            "- none".to_string()
        } else {
            names
                .iter()
                .map(|n| match result.suggestions.get(n) {
                    Some(s) => format!("- {n} (did you mean `{s}`?)"),
                    None => format!("- {n}"),
                })
                .collect::<Vec<_>>()
                .join("\n")
        }
    };
    format!(
        "# Delivery Reconcile Brief\n\n- Run ID: `{}`\n- Base: {}\n- Day: {}\n- Dry run: {}\n- Feed: {} (`{}`)\n- Snapshot entries: {}\n- Stores updated: {}\n- Stores without delivery: {} ({} kept by retention window, {} cleared)\n- Ambiguous keys: {}\n\n## Missing Stores\n{}\n\n## Missing Products\n{}\n",
        summary.run_id,
        summary.base,
        summary.today,
        summary.dry_run,
        summary.feed,
        summary.payload_sha256,
        summary.snapshot_entries,
        result.updated_store_names.len(),
        result.no_delivery_store_names.len(),
        result.retained_store_names.len(),
        summary.cleared_stores,
        result.ambiguous_keys.len(),
        list(&result.missing_store_names),
        list(&result.missing_product_names),
    )
}

/// Markdown digest of the most recent `runs` reconcile reports.
pub fn report_recent_markdown(runs: usize, workspace_root: Option<PathBuf>) -> Result<String> {
    let root = workspace_root.unwrap_or_else(|| PathBuf::from("."));
    let reports_root = root.join("reports");
    let mut summaries = Vec::new();
    for entry in std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
    {
        let entry = entry.with_context(|| format!("reading {}", reports_root.display()))?;
        let path = entry.path().join("reconcile_report.json");
        if !path.is_file() {
            continue;
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let summary: ReconcileRunSummary = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        summaries.push(summary);
    }
    summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));

    let mut lines = vec!["# Delivery Reconcile Report".to_string(), String::new()];
    for summary in summaries.into_iter().take(runs.max(1)) {
        let result = &summary.result;
        lines.push(format!(
            "## Run `{}` ({} {})",
            summary.run_id,
            summary.base,
            summary.started_at.format("%Y-%m-%d %H:%M UTC")
        ));
        if summary.dry_run {
            lines.push("- dry run, nothing written".to_string());
        }
        lines.push(format!("- stores updated: {}", result.updated_store_names.len()));
        lines.push(format!(
            "- stores without delivery: {} (cleared {})",
            result.no_delivery_store_names.len(),
            summary.cleared_stores
        ));
        lines.push(format!("- missing stores: {}", result.missing_store_names.len()));
        lines.push(format!("- missing products: {}", result.missing_product_names.len()));
        lines.push(format!("- brief: `{}/run_brief.md`", summary.reports_dir));
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn config_defaults() {
        let config = SyncConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.retention_window_days, 9);
        assert_eq!(config.scheduled_base, Base::Prod);
        assert_eq!(config.reconcile_cron, "0 11 * * *");
        assert!(!config.scheduler_enabled);
        assert_eq!(config.airtable.api_url, AIRTABLE_API_URL);
        assert!(matches!(config.feed, FeedConfig::Appian { .. }));
    }

    #[test]
    fn config_reads_feed_and_overrides() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("HCSYNC_FEED", "file"),
            ("HCSYNC_FEED_FILE", "fixtures/appian/sample/response.json"),
            ("HCSYNC_RETENTION_DAYS", "0"),
            ("HCSYNC_SCHEDULED_BASE", "dev"),
            ("HCSYNC_SCHEDULER_ENABLED", "true"),
        ]))
        .unwrap();
        assert_eq!(
            config.feed,
            FeedConfig::File {
                path: PathBuf::from("fixtures/appian/sample/response.json")
            }
        );
        assert_eq!(config.retention_window_days, 0);
        assert_eq!(config.scheduled_base, Base::Dev);
        assert!(config.scheduler_enabled);
    }

    #[test]
    fn config_rejects_incomplete_feeds() {
        assert!(SyncConfig::from_lookup(lookup(&[("HCSYNC_FEED", "file")])).is_err());
        assert!(SyncConfig::from_lookup(lookup(&[("HCSYNC_FEED", "sheets")])).is_err());
        assert!(SyncConfig::from_lookup(lookup(&[("HCSYNC_FEED", "csv")])).is_err());
        assert!(SyncConfig::from_lookup(lookup(&[("HCSYNC_RETENTION_DAYS", "nine")])).is_err());
    }

    #[tokio::test]
    async fn notification_selection_waits_for_a_running_sync() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
        let root = root.display().to_string();
        let config =
            SyncConfig::from_lookup(lookup(&[("HCSYNC_WORKSPACE_ROOT", root.as_str())])).unwrap();
        let pipeline = SyncPipeline::new(config)
            .unwrap()
            .with_record_store(Arc::new(hcsync_storage::MemoryRecordStore::new()));

        let running = pipeline.run_lock.lock().await;
        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            pipeline.select_notifiable(Base::Prod),
        )
        .await;
        assert!(blocked.is_err(), "selection ran while the lock was held");

        drop(running);
        let selected = pipeline.select_notifiable(Base::Prod).await.unwrap();
        assert!(selected.is_empty());
    }
}
