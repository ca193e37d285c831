//! Typed persistence operations over the three farewatch tables.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use farewatch_core::{DealCacheEntry, IataCode, NewTrackedSearch, TrackedSearch, UserSetting};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::warn;

use crate::postgrest::{Filter, Query, RowBatch, StoreConfig, TableClient};
use crate::HttpClientConfig;

pub const TRACKED_SEARCH_TABLE: &str = "FlightTracking";
pub const USER_SETTING_TABLE: &str = "UserSetting";
pub const DEAL_CACHE_TABLE: &str = "TodaysDeals";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("store returned http {status} for {table}: {body}")]
    HttpStatus {
        status: u16,
        table: String,
        body: String,
    },
    #[error("could not decode rows from {table}: {source}")]
    Decode {
        table: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{table} returned no row for a write that should produce one")]
    MissingRow { table: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait FareStore: Send + Sync {
    /// Tracked searches whose alert has not been sent yet. Rows that do not
    /// decode are counted in [`RowBatch::undecodable`].
    async fn pending_tracked_searches(&self) -> Result<RowBatch<TrackedSearch>, StoreError>;

    async fn tracked_searches_for_user(
        &self,
        user_id: &str,
    ) -> Result<RowBatch<TrackedSearch>, StoreError>;

    async fn insert_tracked_search(
        &self,
        search: &NewTrackedSearch,
    ) -> Result<TrackedSearch, StoreError>;

    async fn mark_checked(&self, id: i64, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn mark_alert_sent(&self, id: i64) -> Result<(), StoreError>;

    /// Removes every row of `user_id` for the route regardless of dates or
    /// price; returns the removed rows.
    async fn delete_tracked_route(
        &self,
        user_id: &str,
        departure: &IataCode,
        arrival: &IataCode,
    ) -> Result<Vec<TrackedSearch>, StoreError>;

    /// Insert-or-update keyed on the user identifier.
    async fn upsert_user_setting(&self, setting: &UserSetting) -> Result<(), StoreError>;

    async fn home_airport(&self, user_id: &str) -> Result<Option<IataCode>, StoreError>;

    /// Most recent snapshot for the pair created inside the freshness window.
    async fn fresh_deal(
        &self,
        region: &str,
        destination: &IataCode,
        now: DateTime<Utc>,
    ) -> Result<Option<DealCacheEntry>, StoreError>;

    async fn insert_deal(&self, entry: &DealCacheEntry) -> Result<(), StoreError>;
}

#[derive(Debug, Deserialize)]
struct HomeAirportRow {
    #[serde(default)]
    home_airport: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IgnoredRow {}

/// [`FareStore`] backed by a hosted PostgREST endpoint.
#[derive(Debug, Clone)]
pub struct PostgrestStore {
    tables: TableClient,
}

impl PostgrestStore {
    pub fn new(config: &StoreConfig, http: &HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            tables: TableClient::new(config, http)?,
        })
    }

    pub fn from_client(tables: TableClient) -> Self {
        Self { tables }
    }

    async fn patch_tracked(&self, id: i64, patch: serde_json::Value) -> Result<(), StoreError> {
        let updated: Vec<IgnoredRow> = self
            .tables
            .update(TRACKED_SEARCH_TABLE, &patch, &[Filter::eq("id", id)])
            .await?;
        if updated.is_empty() {
            return Err(StoreError::MissingRow {
                table: TRACKED_SEARCH_TABLE.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl FareStore for PostgrestStore {
    async fn pending_tracked_searches(&self) -> Result<RowBatch<TrackedSearch>, StoreError> {
        let query = Query::table(TRACKED_SEARCH_TABLE).filter(Filter::eq("alert_sent", false));
        self.tables.select_each(&query).await
    }

    async fn tracked_searches_for_user(
        &self,
        user_id: &str,
    ) -> Result<RowBatch<TrackedSearch>, StoreError> {
        let query = Query::table(TRACKED_SEARCH_TABLE).filter(Filter::eq("user_id", user_id));
        self.tables.select_each(&query).await
    }

    async fn insert_tracked_search(
        &self,
        search: &NewTrackedSearch,
    ) -> Result<TrackedSearch, StoreError> {
        let rows: Vec<TrackedSearch> = self.tables.insert(TRACKED_SEARCH_TABLE, search).await?;
        rows.into_iter().next().ok_or_else(|| StoreError::MissingRow {
            table: TRACKED_SEARCH_TABLE.to_string(),
        })
    }

    async fn mark_checked(&self, id: i64, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.patch_tracked(id, json!({ "last_checked": at.to_rfc3339() }))
            .await
    }

    async fn mark_alert_sent(&self, id: i64) -> Result<(), StoreError> {
        self.patch_tracked(id, json!({ "alert_sent": true })).await
    }

    async fn delete_tracked_route(
        &self,
        user_id: &str,
        departure: &IataCode,
        arrival: &IataCode,
    ) -> Result<Vec<TrackedSearch>, StoreError> {
        self.tables
            .delete(
                TRACKED_SEARCH_TABLE,
                &[
                    Filter::eq("user_id", user_id),
                    Filter::eq("departure_id", departure),
                    Filter::eq("arrival_id", arrival),
                ],
            )
            .await
    }

    async fn upsert_user_setting(&self, setting: &UserSetting) -> Result<(), StoreError> {
        let _rows: Vec<IgnoredRow> = self
            .tables
            .upsert(USER_SETTING_TABLE, setting, "user_id")
            .await?;
        Ok(())
    }

    async fn home_airport(&self, user_id: &str) -> Result<Option<IataCode>, StoreError> {
        let rows: Vec<HomeAirportRow> = self
            .tables
            .select(
                &Query::table(USER_SETTING_TABLE)
                    .columns("home_airport")
                    .filter(Filter::eq("user_id", user_id))
                    .limit(1),
            )
            .await?;
        let Some(raw) = rows.into_iter().next().and_then(|r| r.home_airport) else {
            return Ok(None);
        };
        match IataCode::parse(&raw) {
            Ok(code) => Ok(Some(code)),
            Err(err) => {
                warn!(user_id, %err, "ignoring malformed stored home airport");
                Ok(None)
            }
        }
    }

    async fn fresh_deal(
        &self,
        region: &str,
        destination: &IataCode,
        now: DateTime<Utc>,
    ) -> Result<Option<DealCacheEntry>, StoreError> {
        let cutoff = DealCacheEntry::freshness_cutoff(now);
        let rows: Vec<DealCacheEntry> = self
            .tables
            .select(
                &Query::table(DEAL_CACHE_TABLE)
                    .filter(Filter::eq("region", region))
                    .filter(Filter::eq("airport_code", destination))
                    .filter(Filter::gte("created_at", cutoff.to_rfc3339()))
                    .order_desc("created_at")
                    .limit(1),
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn insert_deal(&self, entry: &DealCacheEntry) -> Result<(), StoreError> {
        let _rows: Vec<IgnoredRow> = self.tables.insert(DEAL_CACHE_TABLE, entry).await?;
        Ok(())
    }
}
