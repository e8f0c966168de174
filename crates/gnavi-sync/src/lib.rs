//! Reconciliation pipeline: merges scraped CSV drafts into the persisted
//! `grants` table, sweeps cross-batch duplicates, records sync logs and
//! reports data-quality anomalies.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gnavi_core::{GrantDraft, GrantRecord, Level, NormalizedTitle, OrgDirectory};
use serde::Serialize;
use sqlx::{PgPool, Row};
use tracing::{info, warn};

pub const CRATE_NAME: &str = "gnavi-sync";

pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_ERROR: &str = "error";

/// One row ready for the batch upsert: a resolved draft plus its
/// normalized conflict key.
#[derive(Debug, Clone)]
pub struct GrantUpsert {
    pub title_key: NormalizedTitle,
    pub draft: GrantDraft,
}

/// Minimal projection the sweep works from.
#[derive(Debug, Clone)]
pub struct TitleIndexRow {
    pub id: i64,
    pub title: String,
    pub updated_at: DateTime<Utc>,
}

/// Projection for read-only data-quality checks.
#[derive(Debug, Clone)]
pub struct AuditRow {
    pub id: i64,
    pub title: String,
    pub organization: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncLogEntry {
    pub source: String,
    pub records_synced: i32,
    pub status: String,
    pub message: String,
}

/// Store boundary. Atomicity of each call is delegated to the backing
/// database; the pipeline adds no transaction discipline of its own.
#[async_trait]
pub trait GrantStore: Send + Sync {
    /// Bulk existence lookup: which of the given keys are already persisted.
    async fn existing_title_keys(
        &self,
        keys: &[NormalizedTitle],
    ) -> Result<HashSet<NormalizedTitle>>;

    /// Single batch upsert keyed on the normalized title.
    async fn upsert_grants(&self, rows: &[GrantUpsert]) -> Result<()>;

    async fn title_index(&self) -> Result<Vec<TitleIndexRow>>;

    /// Single batch delete; returns the number of rows removed.
    async fn delete_by_ids(&self, ids: &[i64]) -> Result<u64>;

    async fn append_sync_log(&self, entry: &SyncLogEntry) -> Result<()>;

    async fn audit_rows(&self) -> Result<Vec<AuditRow>>;
}

/// Postgres-backed store used by the CLI and the scheduler-less batch runs.
#[derive(Debug, Clone)]
pub struct PgGrantStore {
    pool: PgPool,
}

impl PgGrantStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("connecting to database")?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running migrations")?;
        Ok(())
    }
}

#[async_trait]
impl GrantStore for PgGrantStore {
    async fn existing_title_keys(
        &self,
        keys: &[NormalizedTitle],
    ) -> Result<HashSet<NormalizedTitle>> {
        let key_strings: Vec<String> = keys.iter().map(|k| k.as_str().to_string()).collect();
        let rows = sqlx::query("SELECT title_key FROM grants WHERE title_key = ANY($1)")
            .bind(&key_strings)
            .fetch_all(&self.pool)
            .await
            .context("looking up existing title keys")?;
        let mut existing = HashSet::with_capacity(rows.len());
        for row in rows {
            let key: String = row.try_get("title_key")?;
            existing.insert(NormalizedTitle::new(&key));
        }
        Ok(existing)
    }

    async fn upsert_grants(&self, rows: &[GrantUpsert]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut builder = sqlx::QueryBuilder::<sqlx::Postgres>::new(
            "INSERT INTO grants (type, title, title_key, description, organization, level, \
             area_prefecture, area_city, industry, target_type, max_amount, subsidy_rate, \
             url, source_url) ",
        );
        builder.push_values(rows.iter(), |mut b, row| {
            b.push_bind(row.draft.grant_type.clone())
                .push_bind(row.draft.title.clone())
                .push_bind(row.title_key.as_str().to_string())
                .push_bind(row.draft.description.clone())
                .push_bind(row.draft.organization.clone())
                .push_bind(row.draft.level.as_str())
                .push_bind(row.draft.area_prefecture.clone())
                .push_bind(row.draft.area_city.clone())
                .push_bind(row.draft.industry.clone())
                .push_bind(row.draft.target_type.clone())
                .push_bind(row.draft.max_amount.clone())
                .push_bind(row.draft.subsidy_rate.clone())
                .push_bind(row.draft.url.clone())
                .push_bind(row.draft.source_url.clone());
        });
        builder.push(
            " ON CONFLICT (title_key) DO UPDATE SET \
             type = EXCLUDED.type, title = EXCLUDED.title, \
             description = EXCLUDED.description, organization = EXCLUDED.organization, \
             level = EXCLUDED.level, area_prefecture = EXCLUDED.area_prefecture, \
             area_city = EXCLUDED.area_city, industry = EXCLUDED.industry, \
             target_type = EXCLUDED.target_type, max_amount = EXCLUDED.max_amount, \
             subsidy_rate = EXCLUDED.subsidy_rate, url = EXCLUDED.url, \
             source_url = EXCLUDED.source_url, updated_at = NOW()",
        );
        builder
            .build()
            .execute(&self.pool)
            .await
            .context("upserting grants batch")?;
        Ok(())
    }

    async fn title_index(&self) -> Result<Vec<TitleIndexRow>> {
        let rows = sqlx::query("SELECT id, title, updated_at FROM grants")
            .fetch_all(&self.pool)
            .await
            .context("loading title index")?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(TitleIndexRow {
                id: row.try_get("id")?,
                title: row.try_get("title")?,
                updated_at: row.try_get("updated_at")?,
            });
        }
        Ok(out)
    }

    async fn delete_by_ids(&self, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query("DELETE FROM grants WHERE id = ANY($1)")
            .bind(ids.to_vec())
            .execute(&self.pool)
            .await
            .context("deleting duplicate grants")?;
        Ok(result.rows_affected())
    }

    async fn append_sync_log(&self, entry: &SyncLogEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO sync_logs (source, records_synced, status, message) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(&entry.source)
        .bind(entry.records_synced)
        .bind(&entry.status)
        .bind(&entry.message)
        .execute(&self.pool)
        .await
        .context("inserting sync log")?;
        Ok(())
    }

    async fn audit_rows(&self) -> Result<Vec<AuditRow>> {
        let rows = sqlx::query(
            "SELECT id, title, organization, url, created_at, updated_at FROM grants",
        )
        .fetch_all(&self.pool)
        .await
        .context("loading audit rows")?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(AuditRow {
                id: row.try_get("id")?,
                title: row.try_get("title")?,
                organization: row.try_get("organization")?,
                url: row.try_get("url")?,
                created_at: row.try_get("created_at")?,
                updated_at: row.try_get("updated_at")?,
            });
        }
        Ok(out)
    }
}

#[derive(Debug, Clone)]
struct MemoryGrant {
    record: GrantRecord,
    title_key: NormalizedTitle,
}

/// In-memory store for pipeline tests; mirrors the Postgres semantics of
/// upsert-on-title-key and batch delete.
#[derive(Debug, Default)]
pub struct MemoryGrantStore {
    inner: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    grants: Vec<MemoryGrant>,
    sync_logs: Vec<SyncLogEntry>,
}

impl MemoryGrantStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<GrantRecord> {
        self.inner
            .lock()
            .expect("memory store lock")
            .grants
            .iter()
            .map(|g| g.record.clone())
            .collect()
    }

    pub fn sync_logs(&self) -> Vec<SyncLogEntry> {
        self.inner.lock().expect("memory store lock").sync_logs.clone()
    }

    /// Inserts a row with explicit timestamps, bypassing the upsert key.
    /// Lets tests recreate historical duplicate states.
    pub fn seed(&self, draft: GrantDraft, created_at: DateTime<Utc>, updated_at: DateTime<Utc>) {
        let mut state = self.inner.lock().expect("memory store lock");
        state.next_id += 1;
        let title_key = NormalizedTitle::new(&draft.title);
        let id = state.next_id;
        state.grants.push(MemoryGrant {
            record: record_from_draft(id, &draft, created_at, updated_at),
            title_key,
        });
    }
}

fn record_from_draft(
    id: i64,
    draft: &GrantDraft,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
) -> GrantRecord {
    GrantRecord {
        id,
        grant_type: draft.grant_type.clone(),
        title: draft.title.clone(),
        description: draft.description.clone(),
        organization: draft.organization.clone(),
        level: draft.level,
        area_prefecture: draft.area_prefecture.clone(),
        area_city: draft.area_city.clone(),
        industry: draft.industry.clone(),
        target_type: draft.target_type.clone(),
        max_amount: draft.max_amount.clone(),
        subsidy_rate: draft.subsidy_rate.clone(),
        url: draft.url.clone(),
        source_url: draft.source_url.clone(),
        created_at,
        updated_at,
    }
}

#[async_trait]
impl GrantStore for MemoryGrantStore {
    async fn existing_title_keys(
        &self,
        keys: &[NormalizedTitle],
    ) -> Result<HashSet<NormalizedTitle>> {
        let state = self.inner.lock().expect("memory store lock");
        let wanted: HashSet<&NormalizedTitle> = keys.iter().collect();
        Ok(state
            .grants
            .iter()
            .filter(|g| wanted.contains(&g.title_key))
            .map(|g| g.title_key.clone())
            .collect())
    }

    async fn upsert_grants(&self, rows: &[GrantUpsert]) -> Result<()> {
        let now = Utc::now();
        let mut state = self.inner.lock().expect("memory store lock");
        for row in rows {
            if let Some(existing) = state
                .grants
                .iter_mut()
                .find(|g| g.title_key == row.title_key)
            {
                let id = existing.record.id;
                let created_at = existing.record.created_at;
                existing.record = record_from_draft(id, &row.draft, created_at, now);
            } else {
                state.next_id += 1;
                let id = state.next_id;
                state.grants.push(MemoryGrant {
                    record: record_from_draft(id, &row.draft, now, now),
                    title_key: row.title_key.clone(),
                });
            }
        }
        Ok(())
    }

    async fn title_index(&self) -> Result<Vec<TitleIndexRow>> {
        let state = self.inner.lock().expect("memory store lock");
        Ok(state
            .grants
            .iter()
            .map(|g| TitleIndexRow {
                id: g.record.id,
                title: g.record.title.clone(),
                updated_at: g.record.updated_at,
            })
            .collect())
    }

    async fn delete_by_ids(&self, ids: &[i64]) -> Result<u64> {
        let victims: HashSet<i64> = ids.iter().copied().collect();
        let mut state = self.inner.lock().expect("memory store lock");
        let before = state.grants.len();
        state.grants.retain(|g| !victims.contains(&g.record.id));
        Ok((before - state.grants.len()) as u64)
    }

    async fn append_sync_log(&self, entry: &SyncLogEntry) -> Result<()> {
        let mut state = self.inner.lock().expect("memory store lock");
        state.sync_logs.push(entry.clone());
        Ok(())
    }

    async fn audit_rows(&self) -> Result<Vec<AuditRow>> {
        let state = self.inner.lock().expect("memory store lock");
        Ok(state
            .grants
            .iter()
            .map(|g| AuditRow {
                id: g.record.id,
                title: g.record.title.clone(),
                organization: g.record.organization.clone(),
                url: g.record.url.clone(),
                created_at: g.record.created_at,
                updated_at: g.record.updated_at,
            })
            .collect())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    pub new_count: usize,
    pub updated_count: usize,
    pub discarded: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceOutcome {
    pub label: String,
    pub status: String,
    pub outcome: SyncOutcome,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub sources: Vec<SourceOutcome>,
    pub deleted_duplicates: u64,
}

/// One CSV input for a sync run.
#[derive(Debug, Clone)]
pub struct SyncSource {
    pub label: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub data_dir: PathBuf,
}

impl SyncConfig {
    /// Missing credentials are a fatal configuration error: the process
    /// should exit before any work begins.
    pub fn from_env() -> Result<Self> {
        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL is not set")?;
        let data_dir = std::env::var("GNAVI_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));
        Ok(Self {
            database_url,
            data_dir,
        })
    }

    /// The three scraper outputs a full run reconciles, in order.
    pub fn default_sources(&self) -> Vec<SyncSource> {
        [
            ("national", "fetched_national_grants.csv"),
            ("yamagata", "fetched_pref_yamagata.csv"),
            ("city_yamagata", "fetched_city_yamagata.csv"),
        ]
        .into_iter()
        .map(|(label, file)| SyncSource {
            label: label.to_string(),
            path: self.data_dir.join(file),
        })
        .collect()
    }
}

pub struct SyncPipeline<S: GrantStore> {
    store: S,
    orgs: OrgDirectory,
}

impl<S: GrantStore> SyncPipeline<S> {
    pub fn new(store: S, orgs: OrgDirectory) -> Self {
        Self { store, orgs }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Merges one source's drafts into the table.
    ///
    /// Order of operations: resolve each draft's URL, keep the first draft
    /// per normalized title, split new vs. update with one bulk lookup,
    /// then upsert the whole batch in a single call. A batch failure aborts
    /// this source only.
    pub async fn reconcile(
        &self,
        source: &str,
        drafts: Vec<GrantDraft>,
    ) -> Result<SyncOutcome> {
        let mut seen: HashSet<NormalizedTitle> = HashSet::new();
        let mut kept: Vec<GrantUpsert> = Vec::with_capacity(drafts.len());
        let mut discarded = 0usize;

        for mut draft in drafts {
            let title_key = NormalizedTitle::new(&draft.title);
            if title_key.is_empty() {
                warn!(source, "dropping draft with empty title");
                discarded += 1;
                continue;
            }
            if !seen.insert(title_key.clone()) {
                info!(source, title = %title_key, "duplicate within batch, keeping first occurrence");
                discarded += 1;
                continue;
            }
            draft.url = self.orgs.resolve_url(&draft.url, &draft.organization);
            kept.push(GrantUpsert { title_key, draft });
        }

        let keys: Vec<NormalizedTitle> = kept.iter().map(|r| r.title_key.clone()).collect();
        let existing = self.store.existing_title_keys(&keys).await?;
        let updated_count = kept
            .iter()
            .filter(|r| existing.contains(&r.title_key))
            .count();
        let new_count = kept.len() - updated_count;

        self.store.upsert_grants(&kept).await?;
        Ok(SyncOutcome {
            new_count,
            updated_count,
            discarded,
        })
    }

    /// Reconciles one CSV file and records a sync log row either way.
    /// Errors never escape: failure isolation is per source.
    pub async fn sync_source(&self, source: &SyncSource) -> SourceOutcome {
        let drafts = match gnavi_ingest::read_grant_drafts(&source.path) {
            Ok(drafts) if drafts.is_empty() => {
                return self
                    .finish_source(source, Err(anyhow::anyhow!("no usable rows in file")))
                    .await;
            }
            Ok(drafts) => drafts,
            Err(err) => {
                return self.finish_source(source, Err(err.into())).await;
            }
        };
        let result = self.reconcile(&source.label, drafts).await;
        self.finish_source(source, result).await
    }

    async fn finish_source(
        &self,
        source: &SyncSource,
        result: Result<SyncOutcome>,
    ) -> SourceOutcome {
        match result {
            Ok(outcome) => {
                let message = format!(
                    "synced: {} new, {} updated, {} discarded",
                    outcome.new_count, outcome.updated_count, outcome.discarded
                );
                let synced = outcome.new_count + outcome.updated_count;
                self.write_sync_log(&source.label, synced as i32, STATUS_SUCCESS, &message)
                    .await;
                SourceOutcome {
                    label: source.label.clone(),
                    status: STATUS_SUCCESS.to_string(),
                    outcome,
                    message,
                }
            }
            Err(err) => {
                let message = format!("{err:#}");
                self.write_sync_log(&source.label, 0, STATUS_ERROR, &message)
                    .await;
                SourceOutcome {
                    label: source.label.clone(),
                    status: STATUS_ERROR.to_string(),
                    outcome: SyncOutcome::default(),
                    message,
                }
            }
        }
    }

    /// Best-effort audit write; a logging failure is printed, never raised.
    async fn write_sync_log(&self, source: &str, records: i32, status: &str, message: &str) {
        let entry = SyncLogEntry {
            source: source.to_string(),
            records_synced: records,
            status: status.to_string(),
            message: message.to_string(),
        };
        if let Err(err) = self.store.append_sync_log(&entry).await {
            warn!(source, "sync log write failed: {err:#}");
        }
        info!(source, status, records, "{message}");
    }

    /// Collapses persisted rows sharing a normalized title into one
    /// survivor each. Survivor policy: the most recently updated row wins,
    /// ties broken by highest id. One batch delete, no retry.
    pub async fn sweep(&self) -> Result<u64> {
        let rows = self.store.title_index().await?;
        let mut groups: HashMap<NormalizedTitle, Vec<&TitleIndexRow>> = HashMap::new();
        for row in &rows {
            groups
                .entry(NormalizedTitle::new(&row.title))
                .or_default()
                .push(row);
        }

        let mut victims: Vec<i64> = Vec::new();
        for (key, members) in &groups {
            if members.len() < 2 {
                continue;
            }
            let Some(survivor) = members.iter().max_by_key(|m| (m.updated_at, m.id)) else {
                continue;
            };
            info!(title = %key, survivor = survivor.id, "collapsing duplicate group of {}", members.len());
            victims.extend(
                members
                    .iter()
                    .filter(|m| m.id != survivor.id)
                    .map(|m| m.id),
            );
        }

        if victims.is_empty() {
            return Ok(0);
        }
        victims.sort_unstable();
        self.store.delete_by_ids(&victims).await
    }

    /// Full run: every source in order, then the sweep, with sync log rows
    /// for each stage. A failed source never blocks the next one.
    pub async fn run(&self, sources: &[SyncSource]) -> RunSummary {
        let mut outcomes = Vec::with_capacity(sources.len());
        for source in sources {
            outcomes.push(self.sync_source(source).await);
        }

        let deleted_duplicates = match self.sweep().await {
            Ok(deleted) => {
                let message = if deleted == 0 {
                    "no duplicates found".to_string()
                } else {
                    format!("removed {deleted} duplicate rows")
                };
                self.write_sync_log("deduplication", deleted as i32, STATUS_SUCCESS, &message)
                    .await;
                deleted
            }
            Err(err) => {
                self.write_sync_log("deduplication", 0, STATUS_ERROR, &format!("{err:#}"))
                    .await;
                0
            }
        };

        RunSummary {
            sources: outcomes,
            deleted_duplicates,
        }
    }
}

/// Read-only data-quality report. Anomalies are surfaced, never repaired
/// here and never allowed to block reconciliation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditReport {
    pub total: usize,
    pub invalid_url_count: usize,
    pub invalid_url_by_org: BTreeMap<String, usize>,
    pub timestamp_anomaly_ids: Vec<i64>,
    pub duplicate_title_groups: usize,
}

pub async fn audit<S: GrantStore>(store: &S) -> Result<AuditReport> {
    let rows = store.audit_rows().await?;
    let mut report = AuditReport {
        total: rows.len(),
        ..AuditReport::default()
    };

    let mut title_counts: HashMap<NormalizedTitle, usize> = HashMap::new();
    for row in &rows {
        if !gnavi_core::is_valid_url(Some(&row.url)) {
            report.invalid_url_count += 1;
            *report
                .invalid_url_by_org
                .entry(row.organization.clone())
                .or_default() += 1;
        }
        if row.updated_at < row.created_at {
            report.timestamp_anomaly_ids.push(row.id);
        }
        *title_counts
            .entry(NormalizedTitle::new(&row.title))
            .or_default() += 1;
    }
    report.duplicate_title_groups = title_counts.values().filter(|&&n| n > 1).count();
    report.timestamp_anomaly_ids.sort_unstable();
    Ok(report)
}

/// Convenience used by tests and call sites that already hold drafts.
pub fn draft(title: &str, organization: &str, url: &str) -> GrantDraft {
    GrantDraft {
        grant_type: "補助金".to_string(),
        title: title.to_string(),
        organization: organization.to_string(),
        level: Level::National,
        url: url.to_string(),
        ..GrantDraft::default()
    }
}
