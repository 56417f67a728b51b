//! The moving parts between the spreadsheet and the ledger: the periodic
//! sync worker, the watermark-driven commission reconciler, and the
//! integrity probe that explains disagreements between sheet and database.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Days, NaiveDate, Utc};
use ctv_core::{
    is_completed_status, khach_hang_transaction_id, phone_suffix9, plan_cskh, plan_direct,
    NewVisit, ParentMap, PhoneIndex, RateTable, SourceTag, Visit, Watermark,
    RETURNING_WINDOW_DAYS,
};
use ctv_sheets::{parse_tab, resolve_tab_title, SheetClient, SheetError};
use ctv_storage::{Store, StoreError, VisitSyncRow};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ctv-sync";

/// Seconds between worker cycles unless `SYNC_PERIOD_SECS` overrides it.
pub const DEFAULT_PERIOD_SECS: u64 = 30;

/// After this many consecutive failed cycles the sleep starts stretching.
pub const FAILURE_STRETCH_AFTER: u32 = 10;

/// Ceiling for the stretched sleep between failed cycles.
pub const MAX_CYCLE_DELAY: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Sheet(#[from] SheetError),
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// How sheet rows are mapped onto existing `khach_hang` rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    /// Insert only the rows beyond the current DB count for the tab.
    /// Cheap, but blind to edits of rows already synced.
    AppendByCount,
    /// Match sheet rows to DB rows by 9-digit phone suffix and overwrite
    /// the mutable fields on a match.
    PhoneUpsert,
    /// Wipe the tab's rows and reinsert everything. Invalidates row ids;
    /// callers must follow with a full recompute.
    FullReplace,
}

impl SyncStrategy {
    pub fn parse(value: &str) -> Option<SyncStrategy> {
        match value.trim().to_lowercase().as_str() {
            "append" | "append_by_count" => Some(SyncStrategy::AppendByCount),
            "upsert" | "phone_upsert" => Some(SyncStrategy::PhoneUpsert),
            "replace" | "full_replace" => Some(SyncStrategy::FullReplace),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub period: Duration,
    pub strategy: SyncStrategy,
    /// Per-tab overrides of the default strategy.
    pub overrides: HashMap<SourceTag, SyncStrategy>,
    /// Gates the returning-customer lookup behind the CSKH attribution.
    pub phone_matching: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(DEFAULT_PERIOD_SECS),
            strategy: SyncStrategy::PhoneUpsert,
            overrides: HashMap::new(),
            phone_matching: true,
        }
    }
}

impl SyncConfig {
    /// `SYNC_STRATEGY` wins; otherwise `SYNC_USE_PHONE_MATCHING=false`
    /// falls back to append-by-count, matching the behavior the flag had
    /// before strategies were named. `SYNC_STRATEGY_THAM_MY` and friends
    /// override a single tab.
    pub fn from_env() -> Self {
        let mut config = SyncConfig::default();
        if let Ok(raw) = std::env::var("SYNC_PERIOD_SECS") {
            if let Ok(secs) = raw.trim().parse::<u64>() {
                config.period = Duration::from_secs(secs.max(1));
            }
        }
        let phone_matching = std::env::var("SYNC_USE_PHONE_MATCHING")
            .map(|raw| !matches!(raw.trim().to_lowercase().as_str(), "false" | "0" | "no"))
            .unwrap_or(true);
        config.phone_matching = phone_matching;
        config.strategy = std::env::var("SYNC_STRATEGY")
            .ok()
            .and_then(|raw| SyncStrategy::parse(&raw))
            .unwrap_or(if phone_matching {
                SyncStrategy::PhoneUpsert
            } else {
                SyncStrategy::AppendByCount
            });
        for tag in SourceTag::ALL {
            let key = format!("SYNC_STRATEGY_{}", tag.as_str().to_uppercase());
            if let Some(strategy) = std::env::var(key).ok().and_then(|raw| SyncStrategy::parse(&raw)) {
                config.overrides.insert(tag, strategy);
            }
        }
        config
    }

    pub fn strategy_for(&self, tag: SourceTag) -> SyncStrategy {
        self.overrides.get(&tag).copied().unwrap_or(self.strategy)
    }
}

/// Accepts the stored tag value plus the spellings operators actually type
/// ("tham my", "nha-khoa", "gioithieu").
pub fn parse_source_tag(raw: &str) -> Option<SourceTag> {
    let folded = ctv_core::normalize_label(raw).replace(['-', '_', ' '], "");
    match folded.as_str() {
        "thammy" => Some(SourceTag::ThamMy),
        "nhakhoa" => Some(SourceTag::NhaKhoa),
        "gioithieu" => Some(SourceTag::GioiThieu),
        _ => None,
    }
}

/// Sleep before the next cycle. Healthy workers keep the base period; after
/// [`FAILURE_STRETCH_AFTER`] consecutive failures the sleep grows linearly
/// with each further failure, capped at [`MAX_CYCLE_DELAY`].
pub fn cycle_delay(period: Duration, consecutive_failures: u32) -> Duration {
    if consecutive_failures < FAILURE_STRETCH_AFTER {
        return period;
    }
    let stretch = consecutive_failures - FAILURE_STRETCH_AFTER + 2;
    period.saturating_mul(stretch).min(MAX_CYCLE_DELAY)
}

// ---------------------------------------------------------------------------
// Row reconciliation plans (pure)
// ---------------------------------------------------------------------------

/// Sheet rows beyond the current DB count for the tab. A sheet shorter than
/// the DB yields nothing; append-by-count never deletes.
pub fn rows_beyond_count(rows: &[NewVisit], db_count: i64) -> &[NewVisit] {
    let skip = usize::try_from(db_count).unwrap_or(usize::MAX).min(rows.len());
    &rows[skip..]
}

#[derive(Debug, Default)]
pub struct UpsertPlan {
    pub inserts: Vec<NewVisit>,
    pub updates: Vec<(i64, NewVisit)>,
    pub unchanged: usize,
}

/// Diff parsed sheet rows against the DB projection by 9-digit phone
/// suffix. Repeated phones pair up in order, so two visits by the same
/// customer stay two rows instead of collapsing into one.
pub fn plan_phone_upsert(parsed: &[NewVisit], existing: &[VisitSyncRow]) -> UpsertPlan {
    let mut by_suffix: HashMap<String, VecDeque<&VisitSyncRow>> = HashMap::new();
    for row in existing {
        by_suffix
            .entry(phone_suffix9(&row.phone))
            .or_default()
            .push_back(row);
    }
    let mut plan = UpsertPlan::default();
    for row in parsed {
        let suffix = phone_suffix9(&row.phone);
        match by_suffix.get_mut(&suffix).and_then(VecDeque::pop_front) {
            Some(db_row) => {
                if mutable_fields_differ(row, db_row) {
                    plan.updates.push((db_row.id, row.clone()));
                } else {
                    plan.unchanged += 1;
                }
            }
            None => plan.inserts.push(row.clone()),
        }
    }
    plan
}

/// The sheet stays authoritative for amount, status, closer and the
/// appointment date; everything else keeps its first-synced value.
fn mutable_fields_differ(sheet: &NewVisit, db: &VisitSyncRow) -> bool {
    sheet.gross != db.gross
        || sheet.status != db.status
        || sheet.closer != db.closer
        || sheet.appt_date != db.appt_date
}

// ---------------------------------------------------------------------------
// Commission attribution (pure decision over fetched history)
// ---------------------------------------------------------------------------

/// Start of the returning-customer window for a visit on `visit_date`.
pub fn returning_window_start(visit_date: NaiveDate) -> NaiveDate {
    visit_date
        .checked_sub_days(Days::new(RETURNING_WINDOW_DAYS as u64))
        .unwrap_or(visit_date)
}

/// The original collaborator of a returning customer: the closer of the
/// earliest completed prior visit (history is date-ascending) that resolves
/// to a collaborator. Only visits strictly before the current one count as
/// prior (same-day ties break by id); a later visit already in the table
/// must not turn a first visit into a returning one. `None` means first
/// visit, or no prior closer that was ever a collaborator, and therefore
/// no CSKH rows.
pub fn cskh_originator(
    history: &[Visit],
    index: &PhoneIndex,
    current_id: i64,
    current_date: NaiveDate,
) -> Option<String> {
    history
        .iter()
        .filter(|v| {
            v.id != current_id
                && matches!(
                    v.appt_date.or(v.date_entered),
                    Some(date) if (date, v.id) < (current_date, current_id)
                )
                && is_completed_status(&v.status)
        })
        .find_map(|v| index.resolve(&v.closer).map(str::to_string))
}

/// Transaction ids a cycle must re-plan even though they sit at or below
/// the watermark: rows the phone-keyed upsert edited in place. Ids above
/// the watermark are dropped here because `visits_above` already covers
/// them.
pub fn edits_to_replan(edited_ids: &[i64], kh_watermark: i64) -> Vec<i64> {
    let mut ids: Vec<i64> = edited_ids
        .iter()
        .copied()
        .filter(|id| *id <= kh_watermark)
        .collect();
    ids.sort_unstable();
    ids.dedup();
    ids
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RecomputeOutcome {
    pub visits_processed: usize,
    pub services_processed: usize,
    pub commission_rows: usize,
    pub watermark: Watermark,
}

/// Walks `khach_hang` and `services` above the watermark, emits commission
/// rows, and advances the watermark in the same transaction. Id order makes
/// a second run over the same ids a no-op.
pub struct Reconciler<'a> {
    store: &'a Store,
    phone_matching: bool,
}

impl<'a> Reconciler<'a> {
    pub fn new(store: &'a Store, phone_matching: bool) -> Self {
        Self {
            store,
            phone_matching,
        }
    }

    pub async fn run(&self) -> Result<RecomputeOutcome, SyncError> {
        self.run_with_edits(&[]).await
    }

    /// One reconcile pass. `edited_ids` are rows the phone-keyed upsert
    /// rewrote this cycle; the ones at or below the watermark get their
    /// commission rows re-planned even though the watermark scan skips
    /// them, so a closer or status edit pays out on the next cycle instead
    /// of waiting for an admin recompute.
    pub async fn run_with_edits(&self, edited_ids: &[i64]) -> Result<RecomputeOutcome, SyncError> {
        let watermark = self.store.watermark().await?;
        let parents = self.store.parent_map().await?;
        // Read past the memo: rate edits land from the web process.
        let rates = self.store.rate_table_fresh().await;
        let index = PhoneIndex::build(self.store.collaborator_codes().await?);

        let visits = self.store.visits_above(watermark.last_kh_max_id).await?;
        let edits = self
            .store
            .visits_by_ids(&edits_to_replan(edited_ids, watermark.last_kh_max_id))
            .await?;
        let services = self.store.services_above(watermark.last_svc_max_id).await?;

        let mut outcome = RecomputeOutcome {
            watermark,
            ..Default::default()
        };
        let mut tx = self.store.begin().await?;

        for visit in &edits {
            // Delete-then-insert also clears rows for an edit that walked a
            // visit back from completed.
            let plan = if is_completed_status(&visit.status) && visit.gross > 0 {
                self.plan_visit(&parents, &rates, &index, visit).await?
            } else {
                Vec::new()
            };
            outcome.commission_rows += Store::replace_commissions_in(
                &mut tx,
                khach_hang_transaction_id(visit.id),
                &plan,
            )
            .await?;
            outcome.visits_processed += 1;
        }

        for visit in &visits {
            outcome.watermark.last_kh_max_id = outcome.watermark.last_kh_max_id.max(visit.id);
            if !is_completed_status(&visit.status) {
                continue;
            }
            let plan = self.plan_visit(&parents, &rates, &index, visit).await?;
            outcome.commission_rows += Store::replace_commissions_in(
                &mut tx,
                khach_hang_transaction_id(visit.id),
                &plan,
            )
            .await?;
            outcome.visits_processed += 1;
        }

        for service in &services {
            outcome.watermark.last_svc_max_id =
                outcome.watermark.last_svc_max_id.max(service.id);
            if !is_completed_status(&service.status) {
                continue;
            }
            // Legacy service lines only ever pay the direct chain.
            let plan = match index.resolve(&service.closer) {
                Some(code) => plan_direct(&parents, &rates, code, service.amount),
                None => Vec::new(),
            };
            outcome.commission_rows +=
                Store::replace_commissions_in(&mut tx, service.id, &plan).await?;
            outcome.services_processed += 1;
        }

        Store::advance_watermark_in(&mut tx, outcome.watermark).await?;
        tx.commit().await.map_err(StoreError::from)?;

        if outcome.commission_rows > 0 {
            info!(
                visits = outcome.visits_processed,
                services = outcome.services_processed,
                rows = outcome.commission_rows,
                "commission recompute emitted rows"
            );
        }
        Ok(outcome)
    }

    /// Truncate the ledger, reset the watermark, and rebuild from id zero.
    /// The one sanctioned backwards watermark move.
    pub async fn recompute_all(&self) -> Result<RecomputeOutcome, SyncError> {
        self.store.truncate_commissions().await?;
        self.store.reset_watermark().await?;
        self.run().await
    }

    /// Commission rows for one completed visit. A closer that resolves to a
    /// collaborator pays the direct chain; a staff closure of a returning
    /// customer pays CSKH to the original collaborator and their parent.
    async fn plan_visit(
        &self,
        parents: &ParentMap,
        rates: &RateTable,
        index: &PhoneIndex,
        visit: &Visit,
    ) -> Result<Vec<ctv_core::PlannedCommission>, SyncError> {
        if let Some(code) = index.resolve(&visit.closer) {
            return Ok(plan_direct(parents, rates, code, visit.gross));
        }
        if !self.phone_matching {
            return Ok(Vec::new());
        }
        let Some(visit_date) = visit.appt_date.or(visit.date_entered) else {
            return Ok(Vec::new());
        };
        let history = self
            .store
            .visits_matching_phone_since(
                &phone_suffix9(&visit.phone),
                returning_window_start(visit_date),
            )
            .await?;
        match cskh_originator(&history, index, visit.id, visit_date) {
            Some(origin) => Ok(plan_cskh(parents, rates, &origin, visit.gross)),
            None => Ok(Vec::new()),
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct TabOutcome {
    pub source: SourceTag,
    pub title: Option<String>,
    pub fetched: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub dropped_missing_phone: usize,
    pub malformed_cells: usize,
    pub referrers_created: usize,
    pub error: Option<String>,
}

impl TabOutcome {
    fn empty(source: SourceTag) -> Self {
        Self {
            source,
            title: None,
            fetched: 0,
            inserted: 0,
            updated: 0,
            unchanged: 0,
            dropped_missing_phone: 0,
            malformed_cells: 0,
            referrers_created: 0,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tabs: Vec<TabOutcome>,
    pub recompute: RecomputeOutcome,
}

impl CycleSummary {
    pub fn inserted_total(&self) -> usize {
        self.tabs.iter().map(|t| t.inserted).sum()
    }

    /// A cycle counts as failed only when every tab failed; one bad tab
    /// must not starve the others.
    pub fn all_tabs_failed(&self) -> bool {
        !self.tabs.is_empty() && self.tabs.iter().all(|t| t.error.is_some())
    }
}

/// The periodic sheet-to-Postgres worker. Tabs are isolated from each
/// other; the recompute runs once per cycle over whatever landed.
pub struct Worker<C: SheetClient + ?Sized> {
    store: Arc<Store>,
    client: Arc<C>,
    config: SyncConfig,
}

impl<C: SheetClient + ?Sized> Worker<C> {
    pub fn new(store: Arc<Store>, client: Arc<C>, config: SyncConfig) -> Self {
        Self {
            store,
            client,
            config,
        }
    }

    pub async fn run_forever(&self) -> Result<(), SyncError> {
        let mut consecutive_failures = 0u32;
        loop {
            match self.run_cycle().await {
                Ok(summary) if summary.all_tabs_failed() => {
                    consecutive_failures += 1;
                    warn!(
                        cycle = %summary.cycle_id,
                        failures = consecutive_failures,
                        "every tab failed this cycle"
                    );
                }
                Ok(summary) => {
                    consecutive_failures = 0;
                    info!(
                        cycle = %summary.cycle_id,
                        inserted = summary.inserted_total(),
                        commission_rows = summary.recompute.commission_rows,
                        "sync cycle finished"
                    );
                }
                Err(err) => {
                    consecutive_failures += 1;
                    warn!(error = %err, failures = consecutive_failures, "sync cycle failed");
                }
            }
            tokio::time::sleep(cycle_delay(self.config.period, consecutive_failures)).await;
        }
    }

    /// One full pass: every tab, the heartbeat, then the recompute.
    pub async fn run_cycle(&self) -> Result<CycleSummary, SyncError> {
        let cycle_id = Uuid::new_v4();
        let started_at = Utc::now();
        let titles = self.client.worksheet_titles().await?;

        let mut tabs = Vec::with_capacity(SourceTag::ALL.len());
        let mut edited_ids = Vec::new();
        for tag in SourceTag::ALL {
            let outcome = match self.sync_tab(&titles, tag).await {
                Ok((outcome, edited)) => {
                    edited_ids.extend(edited);
                    outcome
                }
                Err(err) => {
                    warn!(source = tag.as_str(), error = %err, "tab sync failed");
                    let mut outcome = TabOutcome::empty(tag);
                    outcome.error = Some(err.to_string());
                    outcome
                }
            };
            tabs.push(outcome);
        }

        let inserted: usize = tabs.iter().map(|t| t.inserted).sum();
        self.store.advance_heartbeat(inserted as i64).await?;

        let recompute = Reconciler::new(&self.store, self.config.phone_matching)
            .run_with_edits(&edited_ids)
            .await?;

        Ok(CycleSummary {
            cycle_id,
            started_at,
            finished_at: Utc::now(),
            tabs,
            recompute,
        })
    }

    /// Full-replace import of one tab, used by the stepped hard reset.
    /// Does not touch the other tabs, the heartbeat, or the ledger.
    pub async fn import_tab(&self, tag: SourceTag) -> Result<TabOutcome, SyncError> {
        let titles = self.client.worksheet_titles().await?;
        let title = resolve_tab_title(&titles, tag)
            .ok_or(SheetError::TabNotFound { tag: tag.as_str() })?;
        let matrix = self.client.read_matrix(&title).await?;
        let parsed = parse_tab(tag, &matrix);

        let mut outcome = TabOutcome::empty(tag);
        outcome.title = Some(title);
        outcome.fetched = parsed.rows.len();
        outcome.dropped_missing_phone = parsed.dropped_missing_phone;
        outcome.malformed_cells = parsed.malformed_cells;

        let deleted = self.store.delete_visits_by_source(tag).await?;
        info!(source = tag.as_str(), deleted, "hard reset reimporting tab");
        outcome.inserted = self.store.insert_visits(&parsed.rows).await?;
        Ok(outcome)
    }

    /// Syncs one tab, returning its outcome plus the ids of rows the
    /// phone-keyed upsert edited in place (the reconciler re-plans those).
    async fn sync_tab(
        &self,
        titles: &[String],
        tag: SourceTag,
    ) -> Result<(TabOutcome, Vec<i64>), SyncError> {
        let title = resolve_tab_title(titles, tag)
            .ok_or(SheetError::TabNotFound { tag: tag.as_str() })?;
        let matrix = self.client.read_matrix(&title).await?;
        let parsed = parse_tab(tag, &matrix);

        let mut outcome = TabOutcome::empty(tag);
        outcome.title = Some(title);
        outcome.fetched = parsed.rows.len();
        outcome.dropped_missing_phone = parsed.dropped_missing_phone;
        outcome.malformed_cells = parsed.malformed_cells;

        // Referral rows carry the referrer's phone in the closer column;
        // unseen referrers become collaborator accounts before attribution.
        if tag == SourceTag::GioiThieu {
            for row in &parsed.rows {
                if !row.closer.trim().is_empty()
                    && self.store.ensure_referrer_collaborator(&row.closer).await?
                {
                    outcome.referrers_created += 1;
                }
            }
        }

        let mut edited_ids = Vec::new();
        match self.config.strategy_for(tag) {
            SyncStrategy::AppendByCount => {
                let count = self.store.count_visits(tag).await?;
                let fresh = rows_beyond_count(&parsed.rows, count);
                outcome.inserted = self.store.insert_visits(fresh).await?;
            }
            SyncStrategy::PhoneUpsert => {
                let existing = self.store.visits_for_sync(tag).await?;
                let plan = plan_phone_upsert(&parsed.rows, &existing);
                for (id, row) in &plan.updates {
                    self.store.update_visit_mutable(*id, row).await?;
                    edited_ids.push(*id);
                }
                outcome.updated = plan.updates.len();
                outcome.unchanged = plan.unchanged;
                outcome.inserted = self.store.insert_visits(&plan.inserts).await?;
            }
            SyncStrategy::FullReplace => {
                let deleted = self.store.delete_visits_by_source(tag).await?;
                if deleted > 0 {
                    info!(source = tag.as_str(), deleted, "full replace wiped tab rows");
                }
                outcome.inserted = self.store.insert_visits(&parsed.rows).await?;
            }
        }
        Ok((outcome, edited_ids))
    }
}

// ---------------------------------------------------------------------------
// Integrity probe
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct CountCheck {
    pub source: SourceTag,
    pub sheet_rows: usize,
    pub sheet_dropped: usize,
    pub db_rows: i64,
    pub delta: i64,
    pub diagnosis: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MissingReport {
    pub source: SourceTag,
    pub missing_phones: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceVisit {
    pub visit: Visit,
    pub commissions: Vec<ctv_core::CommissionRow>,
    pub diagnosis: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceReport {
    pub phone_suffix: String,
    pub resolves_to_collaborator: Option<String>,
    pub visits: Vec<TraceVisit>,
    /// Sheet rows whose phone matches, across all tabs.
    pub sheet_rows: Vec<NewVisit>,
    pub diagnosis: String,
}

/// Read-only checks for "the sheet says X, the report says Y" disputes.
pub struct IntegrityProbe<'a, C: SheetClient + ?Sized> {
    store: &'a Store,
    client: &'a C,
}

impl<'a, C: SheetClient + ?Sized> IntegrityProbe<'a, C> {
    pub fn new(store: &'a Store, client: &'a C) -> Self {
        Self { store, client }
    }

    /// Usable sheet rows vs DB rows per tab, with a plain-language verdict.
    pub async fn counts(&self) -> Result<Vec<CountCheck>, SyncError> {
        let titles = self.client.worksheet_titles().await?;
        let mut checks = Vec::with_capacity(SourceTag::ALL.len());
        for tag in SourceTag::ALL {
            let check = match resolve_tab_title(&titles, tag) {
                None => CountCheck {
                    source: tag,
                    sheet_rows: 0,
                    sheet_dropped: 0,
                    db_rows: self.store.count_visits(tag).await?,
                    delta: 0,
                    diagnosis: "no worksheet matches this tab's title variants".to_string(),
                },
                Some(title) => {
                    let matrix = self.client.read_matrix(&title).await?;
                    let parsed = parse_tab(tag, &matrix);
                    let db_rows = self.store.count_visits(tag).await?;
                    let delta = parsed.rows.len() as i64 - db_rows;
                    CountCheck {
                        source: tag,
                        sheet_rows: parsed.rows.len(),
                        sheet_dropped: parsed.dropped_missing_phone,
                        db_rows,
                        delta,
                        diagnosis: count_diagnosis(delta, parsed.dropped_missing_phone),
                    }
                }
            };
            checks.push(check);
        }
        Ok(checks)
    }

    /// Phones present in the sheet with no DB row sharing the suffix.
    pub async fn missing(&self, tag: SourceTag) -> Result<MissingReport, SyncError> {
        let titles = self.client.worksheet_titles().await?;
        let title = resolve_tab_title(&titles, tag)
            .ok_or(SheetError::TabNotFound { tag: tag.as_str() })?;
        let matrix = self.client.read_matrix(&title).await?;
        let parsed = parse_tab(tag, &matrix);

        let existing = self.store.visits_for_sync(tag).await?;
        let known: std::collections::HashSet<String> = existing
            .iter()
            .map(|row| phone_suffix9(&row.phone))
            .collect();

        let mut missing_phones = Vec::new();
        for row in &parsed.rows {
            if !known.contains(&phone_suffix9(&row.phone)) {
                missing_phones.push(row.phone.clone());
            }
        }
        missing_phones.dedup();
        Ok(MissingReport {
            source: tag,
            missing_phones,
        })
    }

    /// [`missing`](Self::missing) across every tab; tabs with no matching
    /// worksheet are skipped rather than failing the whole check.
    pub async fn missing_all(&self) -> Result<Vec<MissingReport>, SyncError> {
        let mut reports = Vec::with_capacity(SourceTag::ALL.len());
        for tag in SourceTag::ALL {
            match self.missing(tag).await {
                Ok(report) => reports.push(report),
                Err(SyncError::Sheet(SheetError::TabNotFound { .. })) => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(reports)
    }

    /// Every visit and commission row attached to a phone, with a per-visit
    /// explanation of why it did or did not pay out.
    pub async fn trace(&self, phone: &str) -> Result<TraceReport, SyncError> {
        let suffix = phone_suffix9(phone);
        let index = PhoneIndex::build(self.store.collaborator_codes().await?);
        let visits = self.store.visits_matching_phone(&suffix).await?;

        let mut traced = Vec::with_capacity(visits.len());
        for visit in visits {
            let commissions = self
                .store
                .commissions_for_transaction(khach_hang_transaction_id(visit.id))
                .await?;
            let diagnosis = visit_diagnosis(&visit, &index, &commissions);
            traced.push(TraceVisit {
                visit,
                commissions,
                diagnosis,
            });
        }

        // Sheet side is best-effort: an unreachable tab leaves a gap, not
        // a failed trace.
        let mut sheet_rows = Vec::new();
        match self.client.worksheet_titles().await {
            Err(err) => warn!(error = %err, "trace could not list worksheets"),
            Ok(titles) => {
                for tag in SourceTag::ALL {
                    let Some(title) = resolve_tab_title(&titles, tag) else {
                        continue;
                    };
                    match self.client.read_matrix(&title).await {
                        Err(err) => {
                            warn!(source = tag.as_str(), error = %err, "trace skipped tab")
                        }
                        Ok(matrix) => sheet_rows.extend(
                            parse_tab(tag, &matrix)
                                .rows
                                .into_iter()
                                .filter(|row| phone_suffix9(&row.phone) == suffix),
                        ),
                    }
                }
            }
        }

        let diagnosis = trace_diagnosis(traced.len(), sheet_rows.len());
        Ok(TraceReport {
            phone_suffix: suffix.clone(),
            resolves_to_collaborator: index.resolve(&suffix).map(str::to_string),
            visits: traced,
            sheet_rows,
            diagnosis,
        })
    }
}

fn trace_diagnosis(db_rows: usize, sheet_rows: usize) -> String {
    if db_rows == 0 && sheet_rows > 0 {
        "present in the sheet but absent from the database; append-by-count may have missed it, \
         force a phone-keyed sync of the tab"
            .to_string()
    } else if db_rows == 0 {
        "no rows in the sheet or the database for this phone".to_string()
    } else {
        format!("{db_rows} database rows, {sheet_rows} matching sheet rows")
    }
}

fn count_diagnosis(delta: i64, dropped: usize) -> String {
    if delta == 0 {
        "sheet and database agree".to_string()
    } else if delta > 0 {
        format!("sheet is ahead by {delta} rows; waiting on the next sync cycle")
    } else if dropped > 0 {
        format!(
            "database is ahead by {} rows; sheet rows may have been deleted ({dropped} sheet rows also lack a phone)",
            -delta
        )
    } else {
        format!("database is ahead by {} rows; sheet rows may have been deleted", -delta)
    }
}

fn visit_diagnosis(
    visit: &Visit,
    index: &PhoneIndex,
    commissions: &[ctv_core::CommissionRow],
) -> String {
    if !is_completed_status(&visit.status) {
        return format!("status '{}' is not completed; no payout expected", visit.status);
    }
    if visit.gross <= 0 {
        return "completed but zero amount; no payout expected".to_string();
    }
    if commissions.is_empty() {
        return match index.resolve(&visit.closer) {
            Some(_) => "completed with a collaborator closer but no rows; recompute needed"
                .to_string(),
            None => format!(
                "closer '{}' is not a collaborator and no returning-customer origin was found",
                visit.closer
            ),
        };
    }
    format!("{} commission rows emitted", commissions.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctv_core::CommissionKind;

    fn visit(id: i64, phone: &str, status: &str, closer: &str, date: (i32, u32, u32)) -> Visit {
        Visit {
            id,
            date_entered: NaiveDate::from_ymd_opt(date.0, date.1, date.2),
            name: "Khach".to_string(),
            phone: phone.to_string(),
            branch: String::new(),
            appt_date: NaiveDate::from_ymd_opt(date.0, date.1, date.2),
            time: String::new(),
            service: String::new(),
            gross: 1_000_000,
            deposit: 0,
            balance: 0,
            closer: closer.to_string(),
            note: String::new(),
            status: status.to_string(),
            source: SourceTag::ThamMy,
            region: None,
        }
    }

    fn new_visit(phone: &str, gross: i64, status: &str, closer: &str) -> NewVisit {
        NewVisit {
            date_entered: None,
            name: "Khach".to_string(),
            phone: phone.to_string(),
            branch: String::new(),
            appt_date: None,
            time: String::new(),
            service: String::new(),
            gross,
            deposit: 0,
            balance: 0,
            closer: closer.to_string(),
            note: String::new(),
            status: status.to_string(),
            source: SourceTag::ThamMy,
            region: None,
        }
    }

    fn sync_row(id: i64, phone: &str, gross: i64, status: &str, closer: &str) -> VisitSyncRow {
        VisitSyncRow {
            id,
            phone: phone.to_string(),
            gross,
            status: status.to_string(),
            closer: closer.to_string(),
            appt_date: None,
        }
    }

    #[test]
    fn delay_stays_flat_until_threshold() {
        let period = Duration::from_secs(30);
        assert_eq!(cycle_delay(period, 0), period);
        assert_eq!(cycle_delay(period, 9), period);
        assert_eq!(cycle_delay(period, 10), Duration::from_secs(60));
        assert_eq!(cycle_delay(period, 12), Duration::from_secs(120));
        assert_eq!(cycle_delay(period, 50), MAX_CYCLE_DELAY);
    }

    #[test]
    fn strategy_parsing_and_env_fallback() {
        assert_eq!(SyncStrategy::parse("upsert"), Some(SyncStrategy::PhoneUpsert));
        assert_eq!(
            SyncStrategy::parse("APPEND_BY_COUNT"),
            Some(SyncStrategy::AppendByCount)
        );
        assert_eq!(SyncStrategy::parse("replace"), Some(SyncStrategy::FullReplace));
        assert_eq!(SyncStrategy::parse("delta"), None);
    }

    #[test]
    fn per_tab_strategy_overrides() {
        let mut config = SyncConfig::default();
        config.strategy = SyncStrategy::AppendByCount;
        config
            .overrides
            .insert(SourceTag::GioiThieu, SyncStrategy::PhoneUpsert);
        assert_eq!(config.strategy_for(SourceTag::ThamMy), SyncStrategy::AppendByCount);
        assert_eq!(config.strategy_for(SourceTag::GioiThieu), SyncStrategy::PhoneUpsert);
    }

    #[test]
    fn trace_diagnosis_points_at_sync_strategy() {
        assert!(trace_diagnosis(0, 2).contains("force a phone-keyed sync"));
        assert!(trace_diagnosis(0, 0).contains("no rows"));
        assert!(trace_diagnosis(3, 3).contains("3 database rows"));
    }

    #[test]
    fn source_tag_spellings() {
        assert_eq!(parse_source_tag("tham_my"), Some(SourceTag::ThamMy));
        assert_eq!(parse_source_tag("Thẩm Mỹ"), Some(SourceTag::ThamMy));
        assert_eq!(parse_source_tag("nha-khoa"), Some(SourceTag::NhaKhoa));
        assert_eq!(parse_source_tag("gioithieu"), Some(SourceTag::GioiThieu));
        assert_eq!(parse_source_tag("spa"), None);
    }

    #[test]
    fn append_by_count_skips_existing_rows() {
        let rows: Vec<NewVisit> = (0..5)
            .map(|i| new_visit(&format!("090123456{i}"), 100, "chưa đến", ""))
            .collect();
        assert_eq!(rows_beyond_count(&rows, 3).len(), 2);
        assert_eq!(rows_beyond_count(&rows, 5).len(), 0);
        // Sheet shorter than DB: nothing to append, nothing deleted.
        assert_eq!(rows_beyond_count(&rows, 9).len(), 0);
    }

    #[test]
    fn phone_upsert_pairs_by_suffix_and_detects_changes() {
        let parsed = vec![
            new_visit("0901234567", 500, "đã đến làm", "anna"),
            new_visit("0907777777", 300, "chưa đến", ""),
        ];
        let existing = vec![sync_row(41, "84901234567", 500, "chưa đến", "anna")];
        let plan = plan_phone_upsert(&parsed, &existing);
        // Status flipped on the matched row, second phone is brand new.
        assert_eq!(plan.updates.len(), 1);
        assert_eq!(plan.updates[0].0, 41);
        assert_eq!(plan.inserts.len(), 1);
        assert_eq!(plan.inserts[0].phone, "0907777777");
        assert_eq!(plan.unchanged, 0);
    }

    #[test]
    fn phone_upsert_keeps_repeat_visits_separate() {
        let parsed = vec![
            new_visit("0901234567", 500, "đã đến làm", "anna"),
            new_visit("0901234567", 900, "chưa đến", ""),
        ];
        let existing = vec![
            sync_row(1, "0901234567", 500, "đã đến làm", "anna"),
            sync_row(2, "0901234567", 700, "chưa đến", ""),
        ];
        let plan = plan_phone_upsert(&parsed, &existing);
        assert_eq!(plan.unchanged, 1);
        assert_eq!(plan.updates.len(), 1);
        assert_eq!(plan.updates[0].0, 2);
        assert!(plan.inserts.is_empty());
    }

    #[test]
    fn unchanged_rows_produce_no_writes() {
        let parsed = vec![new_visit("0901234567", 500, "đã đến làm", "anna")];
        let existing = vec![sync_row(7, "0901234567", 500, "đã đến làm", "anna")];
        let plan = plan_phone_upsert(&parsed, &existing);
        assert!(plan.updates.is_empty());
        assert!(plan.inserts.is_empty());
        assert_eq!(plan.unchanged, 1);
    }

    #[test]
    fn originator_is_earliest_resolvable_completed_visit() {
        let index = PhoneIndex::build(["0905550001", "0905550002"]);
        let history = vec![
            visit(1, "0901111111", "đã đến làm", "0905550002", (2025, 1, 10)),
            visit(2, "0901111111", "hủy", "0905550001", (2025, 3, 1)),
            visit(3, "0901111111", "đã đến làm", "Thu Ha (CSKH)", (2025, 6, 1)),
        ];
        let current = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
        // Visit 3 is the current one; visit 2 was cancelled.
        assert_eq!(
            cskh_originator(&history, &index, 3, current),
            Some("0905550002".to_string())
        );
        // First ever visit: nothing before it.
        assert_eq!(cskh_originator(&history[2..], &index, 3, current), None);
    }

    #[test]
    fn originator_ignores_visits_after_the_current_one() {
        let index = PhoneIndex::build(["0905550001"]);
        // Staff-closed June visit; the only collaborator-closed visit is in
        // July, so the customer is still on their first visit in June.
        let history = vec![
            visit(3, "0901111111", "đã đến làm", "CSKH", (2025, 6, 1)),
            visit(4, "0901111111", "đã đến làm", "0905550001", (2025, 7, 1)),
        ];
        let current = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
        assert_eq!(cskh_originator(&history, &index, 3, current), None);
        // Same day counts as prior only for a lower id.
        let same_day = vec![
            visit(2, "0901111111", "đã đến làm", "0905550001", (2025, 6, 1)),
            visit(3, "0901111111", "đã đến làm", "CSKH", (2025, 6, 1)),
        ];
        assert_eq!(
            cskh_originator(&same_day, &index, 3, current),
            Some("0905550001".to_string())
        );
    }

    #[test]
    fn originator_ignores_unresolvable_closers() {
        let index = PhoneIndex::build(["0905550001"]);
        let history = vec![
            visit(1, "0901111111", "đã đến làm", "Le Tan", (2025, 1, 10)),
            visit(2, "0901111111", "đã đến làm", "0905550001", (2025, 2, 10)),
            visit(3, "0901111111", "đã đến làm", "CSKH", (2025, 6, 1)),
        ];
        // The staff-closed first visit is skipped, not a dead end.
        assert_eq!(
            cskh_originator(&history, &index, 3, NaiveDate::from_ymd_opt(2025, 6, 1).unwrap()),
            Some("0905550001".to_string())
        );
    }

    #[test]
    fn upsert_edits_below_the_watermark_get_replanned() {
        // Rows 500 and 200 were edited in place and sit below the
        // watermark, so the cycle must re-plan them; 900 is above it and
        // the watermark scan picks it up instead.
        assert_eq!(edits_to_replan(&[500, 900, 200, 500], 800), vec![200, 500]);
        assert!(edits_to_replan(&[], 800).is_empty());
    }

    #[test]
    fn window_start_is_365_days_back() {
        let date = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
        assert_eq!(
            returning_window_start(date),
            NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
        );
    }

    #[test]
    fn one_failed_tab_does_not_fail_the_cycle() {
        let mut ok = TabOutcome::empty(SourceTag::ThamMy);
        ok.inserted = 3;
        let mut bad = TabOutcome::empty(SourceTag::NhaKhoa);
        bad.error = Some("sheet api returned status 503".to_string());
        let summary = CycleSummary {
            cycle_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            tabs: vec![ok, bad.clone()],
            recompute: RecomputeOutcome::default(),
        };
        assert!(!summary.all_tabs_failed());
        assert_eq!(summary.inserted_total(), 3);

        let all_bad = CycleSummary {
            tabs: vec![bad.clone(), bad],
            ..summary
        };
        assert!(all_bad.all_tabs_failed());
    }

    #[test]
    fn count_diagnosis_wording() {
        assert!(count_diagnosis(0, 0).contains("agree"));
        assert!(count_diagnosis(4, 0).contains("ahead by 4"));
        assert!(count_diagnosis(-2, 0).contains("database is ahead by 2"));
        assert!(count_diagnosis(-2, 3).contains("lack a phone"));
    }

    #[test]
    fn trace_diagnosis_explains_missing_rows() {
        let index = PhoneIndex::build(["0905550001"]);
        let pending = visit(1, "0901111111", "chưa đến", "0905550001", (2025, 5, 1));
        assert!(visit_diagnosis(&pending, &index, &[]).contains("not completed"));

        let done = visit(2, "0901111111", "đã đến làm", "0905550001", (2025, 5, 2));
        assert!(visit_diagnosis(&done, &index, &[]).contains("recompute needed"));

        let staff = visit(3, "0901111111", "đã đến làm", "Le Tan", (2025, 5, 3));
        assert!(visit_diagnosis(&staff, &index, &[]).contains("not a collaborator"));

        let rows = vec![ctv_core::CommissionRow {
            id: 1,
            transaction_id: -2,
            collaborator_code: "0905550001".to_string(),
            level: 0,
            rate: 0.25,
            transaction_amount: 1_000_000,
            commission_amount: 250_000,
            kind: CommissionKind::Direct,
            created_at: Utc::now(),
        }];
        assert!(visit_diagnosis(&done, &index, &rows).contains("1 commission rows"));
    }
}
