//! Weekly alert reconciliation: one tracked search per user, one provider
//! query per route, per-user price filtering and per-row state updates.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use farewatch_adapters::{SearchOutcome, SearchParams, SearchProvider};
use farewatch_core::present::results_embed;
use farewatch_core::{
    filter_within_budget, Color, Embed, FlightCandidate, Message, NotificationSink, Recipient,
    RouteKey, TrackedSearch,
};
use farewatch_storage::FareStore;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod config;
pub mod scheduler;

pub use config::{AppConfig, ConfigError};
pub use scheduler::AlertScheduler;

pub const CRATE_NAME: &str = "farewatch-alerts";

#[derive(Debug, Clone, Serialize)]
pub struct AlertRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pending_rows: usize,
    pub rows_undecodable: usize,
    pub selected_rows: usize,
    pub provider_queries: usize,
    pub routes_failed: usize,
    pub alerts_sent: usize,
    pub rows_without_match: usize,
    pub rows_skipped: usize,
    pub write_failures: usize,
    pub notify_failures: usize,
}

impl AlertRunSummary {
    fn begin(started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at,
            finished_at: started_at,
            pending_rows: 0,
            rows_undecodable: 0,
            selected_rows: 0,
            provider_queries: 0,
            routes_failed: 0,
            alerts_sent: 0,
            rows_without_match: 0,
            rows_skipped: 0,
            write_failures: 0,
            notify_failures: 0,
        }
    }
}

/// Picks the single row each user is evaluated on: least recently checked
/// first (never checked sorts earliest), then earliest outbound (undated sorts
/// last), then lowest id. Output is ordered by user id.
pub fn select_one_per_user(rows: Vec<TrackedSearch>) -> Vec<TrackedSearch> {
    let mut by_user: BTreeMap<String, Vec<TrackedSearch>> = BTreeMap::new();
    for row in rows {
        by_user.entry(row.user_id.clone()).or_default().push(row);
    }
    by_user
        .into_values()
        .filter_map(|mut rows| {
            rows.sort_by_key(selection_key);
            rows.into_iter().next()
        })
        .collect()
}

fn selection_key(row: &TrackedSearch) -> (DateTime<Utc>, NaiveDate, i64) {
    (
        row.last_checked.unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
        row.outbound_date.unwrap_or(NaiveDate::MAX),
        row.id,
    )
}

pub fn alert_embed(
    row: &TrackedSearch,
    matches: &[FlightCandidate],
    deep_link: Option<&str>,
) -> Embed {
    results_embed(
        format!(
            "🎯 Great news we found flights within your price of ${} from {} → {}",
            row.max_price, row.departure, row.arrival
        ),
        format!("Found {} flights under your threshold:", matches.len()),
        Color::GREEN,
        matches,
        deep_link,
    )
}

/// A route fetch shared by every selected row with the same [`RouteKey`];
/// `None` records a failed fetch.
type RouteCache = HashMap<RouteKey, Option<Arc<SearchOutcome>>>;

#[derive(Clone)]
pub struct AlertJob {
    store: Arc<dyn FareStore>,
    provider: Arc<dyn SearchProvider>,
    sink: Arc<dyn NotificationSink>,
    provider_timeout: Duration,
    running: Arc<Mutex<()>>,
}

impl AlertJob {
    pub fn new(
        store: Arc<dyn FareStore>,
        provider: Arc<dyn SearchProvider>,
        sink: Arc<dyn NotificationSink>,
        provider_timeout: Duration,
    ) -> Self {
        Self {
            store,
            provider,
            sink,
            provider_timeout,
            running: Arc::new(Mutex::new(())),
        }
    }

    pub async fn run_once(&self) -> Result<AlertRunSummary> {
        self.run_at(Utc::now()).await
    }

    /// Runs unless another run holds the guard; overlapping triggers are
    /// skipped, never queued.
    pub async fn run_guarded(&self) -> Option<AlertRunSummary> {
        let Ok(_guard) = self.running.try_lock() else {
            warn!("alert run already in progress; skipping trigger");
            return None;
        };
        match self.run_at(Utc::now()).await {
            Ok(summary) => Some(summary),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "alert run aborted");
                None
            }
        }
    }

    /// One reconciliation pass with `now` as the clock. Only loading the
    /// pending rows can fail the whole run.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<AlertRunSummary> {
        let mut summary = AlertRunSummary::begin(now);
        let span = info_span!("alert_run", run_id = %summary.run_id);

        async {
            let pending = self
                .store
                .pending_tracked_searches()
                .await
                .context("loading pending tracked searches")?;
            summary.pending_rows = pending.rows.len();
            summary.rows_undecodable = pending.undecodable;
            if pending.rows.is_empty() {
                info!("no pending tracked searches");
            }

            let selected = select_one_per_user(pending.rows);
            summary.selected_rows = selected.len();

            let today = now.date_naive();
            let mut cache = RouteCache::new();
            for row in &selected {
                self.reconcile_row(row, now, today, &mut cache, &mut summary).await;
            }

            summary.finished_at = Utc::now().max(now);
            info!(
                pending = summary.pending_rows,
                undecodable = summary.rows_undecodable,
                selected = summary.selected_rows,
                provider_queries = summary.provider_queries,
                routes_failed = summary.routes_failed,
                alerts_sent = summary.alerts_sent,
                without_match = summary.rows_without_match,
                skipped = summary.rows_skipped,
                write_failures = summary.write_failures,
                notify_failures = summary.notify_failures,
                "alert run complete"
            );
            Ok::<_, anyhow::Error>(())
        }
        .instrument(span)
        .await?;

        Ok(summary)
    }

    async fn reconcile_row(
        &self,
        row: &TrackedSearch,
        now: DateTime<Utc>,
        today: NaiveDate,
        cache: &mut RouteCache,
        summary: &mut AlertRunSummary,
    ) {
        let Some(key) = row.route_key() else {
            warn!(
                row_id = row.id,
                user_id = %row.user_id,
                "tracked search has unusable dates; skipping"
            );
            summary.rows_skipped += 1;
            self.mark_checked(row, now, summary).await;
            return;
        };

        let Some(outcome) = self.fetch_route(&key, today, cache, summary).await else {
            summary.rows_skipped += 1;
            return;
        };

        self.mark_checked(row, now, summary).await;

        let matches = filter_within_budget(&outcome.candidates, row.max_price);
        if matches.is_empty() {
            summary.rows_without_match += 1;
            return;
        }

        let embed = alert_embed(row, &matches, outcome.deep_link_url.as_deref());
        if let Err(err) = self.sink.send(&Recipient::Broadcast, &Message::Embed(embed)).await {
            warn!(row_id = row.id, error = %err, "alert notification failed");
            summary.notify_failures += 1;
            return;
        }
        summary.alerts_sent += 1;

        if let Err(err) = self.store.mark_alert_sent(row.id).await {
            warn!(row_id = row.id, error = %err, "could not flag tracked search as alerted");
            summary.write_failures += 1;
        }
    }

    async fn mark_checked(
        &self,
        row: &TrackedSearch,
        now: DateTime<Utc>,
        summary: &mut AlertRunSummary,
    ) {
        if let Err(err) = self.store.mark_checked(row.id, now).await {
            warn!(row_id = row.id, error = %err, "could not update last_checked");
            summary.write_failures += 1;
        }
    }

    async fn fetch_route(
        &self,
        key: &RouteKey,
        today: NaiveDate,
        cache: &mut RouteCache,
        summary: &mut AlertRunSummary,
    ) -> Option<Arc<SearchOutcome>> {
        if let Some(cached) = cache.get(key) {
            return cached.clone();
        }

        let (outbound, return_date) = key.window_from(today);
        let params = SearchParams::round_trip(
            key.departure.clone(),
            key.arrival.clone(),
            outbound,
            return_date,
        );
        summary.provider_queries += 1;

        let search = tokio::time::timeout(self.provider_timeout, self.provider.search(&params));
        let fetched = match search.await {
            Ok(Ok(outcome)) => Some(Arc::new(outcome)),
            Ok(Err(err)) => {
                warn!(route = %key, error = %err, "route search failed");
                None
            }
            Err(_) => {
                let timeout_secs = self.provider_timeout.as_secs();
                warn!(route = %key, timeout_secs, "route search timed out");
                None
            }
        };
        if fetched.is_none() {
            summary.routes_failed += 1;
        }
        cache.insert(key.clone(), fetched.clone());
        fetched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use farewatch_core::{parse_iso_date, IataCode};

    fn row(
        id: i64,
        user: &str,
        last_checked: Option<&str>,
        outbound: Option<&str>,
    ) -> TrackedSearch {
        TrackedSearch {
            id,
            user_id: user.into(),
            departure: IataCode::parse("PEK").unwrap(),
            arrival: IataCode::parse("AUS").unwrap(),
            outbound_date: outbound.map(|d| parse_iso_date(d).unwrap()),
            return_date: Some(parse_iso_date("2025-12-31").unwrap()),
            max_price: 500,
            last_checked: last_checked.map(|t| {
                DateTime::parse_from_rfc3339(t).unwrap().with_timezone(&Utc)
            }),
            alert_sent: false,
        }
    }

    #[test]
    fn never_checked_rows_win_then_earliest_outbound() {
        let picked = select_one_per_user(vec![
            row(1, "u1", Some("2025-07-01T00:00:00Z"), Some("2024-01-01")),
            row(2, "u1", None, Some("2024-03-01")),
            row(3, "u1", None, Some("2024-01-01")),
        ]);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].id, 3);
    }

    #[test]
    fn undated_rows_sort_after_dated_ones() {
        let picked = select_one_per_user(vec![
            row(4, "u1", None, None),
            row(9, "u1", None, Some("2030-01-01")),
        ]);
        assert_eq!(picked[0].id, 9);
    }

    #[test]
    fn identical_keys_fall_back_to_lowest_id() {
        let picked = select_one_per_user(vec![
            row(8, "u1", None, Some("2024-01-01")),
            row(5, "u1", None, Some("2024-01-01")),
            row(6, "u2", None, None),
        ]);
        assert_eq!(picked.iter().map(|r| r.id).collect::<Vec<_>>(), vec![5, 6]);
    }

    #[test]
    fn alert_embed_names_threshold_and_route() {
        let tracked = row(1, "u1", None, Some("2025-12-01"));
        let matches = vec![FlightCandidate {
            price: Some(450),
            ..Default::default()
        }];
        let embed = alert_embed(&tracked, &matches, Some("https://example.test/flights"));
        assert_eq!(
            embed.title,
            "🎯 Great news we found flights within your price of $500 from PEK → AUS"
        );
        assert_eq!(embed.description.as_deref(), Some("Found 1 flights under your threshold:"));
        assert_eq!(embed.color, Color::GREEN);
        assert_eq!(embed.fields.len(), 2);
    }
}
