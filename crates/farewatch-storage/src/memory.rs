//! In-process [`FareStore`] for tests and offline dry runs.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use farewatch_core::{DealCacheEntry, IataCode, NewTrackedSearch, TrackedSearch, UserSetting};
use serde_json::Value;

use crate::postgrest::{decode_each_row, RowBatch};
use crate::store::{FareStore, StoreError, TRACKED_SEARCH_TABLE};

#[derive(Debug, Default)]
struct State {
    next_id: i64,
    tracked: BTreeMap<i64, TrackedSearch>,
    /// Rows kept as stored JSON, decoded on every read like hosted rows.
    raw_tracked: Vec<Value>,
    settings: BTreeMap<String, UserSetting>,
    deals: Vec<DealCacheEntry>,
    failing_rows: HashSet<i64>,
    writes: usize,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tracked(rows: impl IntoIterator<Item = TrackedSearch>) -> Self {
        let store = Self::new();
        for row in rows {
            store.seed_tracked(row);
        }
        store
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }

    pub fn seed_tracked(&self, row: TrackedSearch) {
        if let Ok(mut state) = self.state.lock() {
            state.next_id = state.next_id.max(row.id);
            state.tracked.insert(row.id, row);
        }
    }

    /// Stores a tracked-search row as raw JSON, valid or not.
    pub fn seed_raw_tracked(&self, row: Value) {
        if let Ok(mut state) = self.state.lock() {
            state.raw_tracked.push(row);
        }
    }

    fn tracked_where(
        &self,
        keep: impl Fn(&TrackedSearch) -> bool,
        keep_raw: impl Fn(&Value) -> bool,
    ) -> Result<RowBatch<TrackedSearch>, StoreError> {
        let state = self.lock()?;
        let raw: Vec<Value> = state.raw_tracked.iter().filter(|v| keep_raw(v)).cloned().collect();
        let mut batch = decode_each_row(TRACKED_SEARCH_TABLE, raw);
        batch
            .rows
            .extend(state.tracked.values().filter(|row| keep(row)).cloned());
        Ok(batch)
    }

    pub fn seed_deal(&self, entry: DealCacheEntry) {
        if let Ok(mut state) = self.state.lock() {
            state.deals.push(entry);
        }
    }

    /// Updates to this row id fail with [`StoreError::Unavailable`].
    pub fn fail_writes_for(&self, id: i64) {
        if let Ok(mut state) = self.state.lock() {
            state.failing_rows.insert(id);
        }
    }

    pub fn tracked(&self) -> Vec<TrackedSearch> {
        self.state
            .lock()
            .map(|s| s.tracked.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn tracked_row(&self, id: i64) -> Option<TrackedSearch> {
        self.state.lock().ok()?.tracked.get(&id).cloned()
    }

    pub fn deals(&self) -> Vec<DealCacheEntry> {
        self.state.lock().map(|s| s.deals.clone()).unwrap_or_default()
    }

    pub fn write_count(&self) -> usize {
        self.state.lock().map(|s| s.writes).unwrap_or_default()
    }

    fn update_row(
        &self,
        id: i64,
        apply: impl FnOnce(&mut TrackedSearch),
    ) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if state.failing_rows.contains(&id) {
            return Err(StoreError::Unavailable(format!("write to row {id} rejected")));
        }
        let row = state.tracked.get_mut(&id).ok_or_else(|| StoreError::MissingRow {
            table: TRACKED_SEARCH_TABLE.to_string(),
        })?;
        apply(row);
        state.writes += 1;
        Ok(())
    }
}

#[async_trait]
impl FareStore for MemoryStore {
    async fn pending_tracked_searches(&self) -> Result<RowBatch<TrackedSearch>, StoreError> {
        self.tracked_where(
            |row| !row.alert_sent,
            |raw| raw.get("alert_sent").and_then(Value::as_bool) != Some(true),
        )
    }

    async fn tracked_searches_for_user(
        &self,
        user_id: &str,
    ) -> Result<RowBatch<TrackedSearch>, StoreError> {
        self.tracked_where(
            |row| row.user_id == user_id,
            |raw| raw.get("user_id").and_then(Value::as_str) == Some(user_id),
        )
    }

    async fn insert_tracked_search(
        &self,
        search: &NewTrackedSearch,
    ) -> Result<TrackedSearch, StoreError> {
        let mut state = self.lock()?;
        state.next_id += 1;
        let row = TrackedSearch {
            id: state.next_id,
            user_id: search.user_id.clone(),
            departure: search.departure.clone(),
            arrival: search.arrival.clone(),
            outbound_date: Some(search.outbound_date),
            return_date: Some(search.return_date),
            max_price: search.max_price,
            last_checked: search.last_checked,
            alert_sent: search.alert_sent,
        };
        state.tracked.insert(row.id, row.clone());
        state.writes += 1;
        Ok(row)
    }

    async fn mark_checked(&self, id: i64, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.update_row(id, |row| row.last_checked = Some(at))
    }

    async fn mark_alert_sent(&self, id: i64) -> Result<(), StoreError> {
        self.update_row(id, |row| row.alert_sent = true)
    }

    async fn delete_tracked_route(
        &self,
        user_id: &str,
        departure: &IataCode,
        arrival: &IataCode,
    ) -> Result<Vec<TrackedSearch>, StoreError> {
        let mut state = self.lock()?;
        let doomed: Vec<i64> = state
            .tracked
            .values()
            .filter(|row| {
                row.user_id == user_id && &row.departure == departure && &row.arrival == arrival
            })
            .map(|row| row.id)
            .collect();
        let removed: Vec<TrackedSearch> = doomed
            .into_iter()
            .filter_map(|id| state.tracked.remove(&id))
            .collect();
        state.writes += 1;
        Ok(removed)
    }

    async fn upsert_user_setting(&self, setting: &UserSetting) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        state.settings.insert(setting.user_id.clone(), setting.clone());
        state.writes += 1;
        Ok(())
    }

    async fn home_airport(&self, user_id: &str) -> Result<Option<IataCode>, StoreError> {
        Ok(self
            .lock()?
            .settings
            .get(user_id)
            .map(|s| s.home_airport.clone()))
    }

    async fn fresh_deal(
        &self,
        region: &str,
        destination: &IataCode,
        now: DateTime<Utc>,
    ) -> Result<Option<DealCacheEntry>, StoreError> {
        Ok(self
            .lock()?
            .deals
            .iter()
            .filter(|d| d.region == region && &d.destination == destination && d.is_fresh(now))
            .max_by_key(|d| d.created_at)
            .cloned())
    }

    async fn insert_deal(&self, entry: &DealCacheEntry) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        state.deals.push(entry.clone());
        state.writes += 1;
        Ok(())
    }
}
