use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use farewatch_adapters::{
    ProviderError, ReplayProvider, SearchOutcome, SearchParams, SearchProvider,
};
use farewatch_alerts::{select_one_per_user, AlertJob};
use farewatch_core::notify::RecordingSink;
use farewatch_core::{parse_iso_date, FlightCandidate, IataCode, Message, Recipient, TrackedSearch};
use farewatch_storage::MemoryStore;

fn code(s: &str) -> IataCode {
    IataCode::parse(s).unwrap()
}

fn ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

fn june_first() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 9, 30, 0).single().unwrap()
}

fn tracked(
    id: i64,
    user: &str,
    route: (&str, &str),
    dates: (Option<&str>, Option<&str>),
    max_price: u32,
) -> TrackedSearch {
    TrackedSearch {
        id,
        user_id: user.into(),
        departure: code(route.0),
        arrival: code(route.1),
        outbound_date: dates.0.map(|d| parse_iso_date(d).unwrap()),
        return_date: dates.1.map(|d| parse_iso_date(d).unwrap()),
        max_price,
        last_checked: None,
        alert_sent: false,
    }
}

fn outcome(prices: &[Option<u32>]) -> SearchOutcome {
    SearchOutcome {
        candidates: prices
            .iter()
            .map(|price| FlightCandidate {
                price: *price,
                total_duration_minutes: Some(900),
                legs: Vec::new(),
            })
            .collect(),
        deep_link_url: Some("https://www.google.com/travel/flights?q=test".into()),
    }
}

fn job(
    store: &Arc<MemoryStore>,
    provider: &Arc<ReplayProvider>,
    sink: &Arc<RecordingSink>,
) -> AlertJob {
    AlertJob::new(store.clone(), provider.clone(), sink.clone(), Duration::from_secs(5))
}

const WEEK: (Option<&str>, Option<&str>) = (Some("2024-01-01"), Some("2024-01-08"));

#[tokio::test]
async fn shared_route_is_queried_once_per_run() {
    let store = Arc::new(MemoryStore::with_tracked([
        tracked(1, "u1", ("PEK", "AUS"), WEEK, 500),
        tracked(2, "u2", ("PEK", "AUS"), WEEK, 500),
        tracked(3, "u3", ("PEK", "AUS"), (Some("2024-02-10"), Some("2024-02-17")), 500),
        tracked(4, "u4", ("PEK", "AUS"), (Some("2024-01-01"), Some("2024-01-04")), 500),
    ]));
    let provider = Arc::new(ReplayProvider::with_outcome(outcome(&[Some(720)])));
    let sink = Arc::new(RecordingSink::new());

    let summary = job(&store, &provider, &sink).run_at(june_first()).await.unwrap();

    assert_eq!(summary.selected_rows, 4);
    assert_eq!(summary.provider_queries, 2);
    assert_eq!(provider.call_count(), 2);
    assert!(store.tracked().iter().all(|row| row.last_checked == Some(june_first())));
}

#[tokio::test]
async fn each_user_is_evaluated_once_per_run() {
    let store = Arc::new(MemoryStore::with_tracked([
        tracked(1, "u1", ("PEK", "AUS"), WEEK, 500),
        tracked(2, "u1", ("JFK", "LHR"), WEEK, 500),
        tracked(3, "u1", ("SFO", "NRT"), WEEK, 500),
        tracked(4, "u2", ("SFO", "NRT"), WEEK, 500),
    ]));
    let provider = Arc::new(ReplayProvider::with_outcome(outcome(&[Some(450)])));
    let sink = Arc::new(RecordingSink::new());

    let summary = job(&store, &provider, &sink).run_at(june_first()).await.unwrap();

    assert_eq!(summary.pending_rows, 4);
    assert_eq!(summary.selected_rows, 2);
    assert_eq!(summary.alerts_sent, 2);
    let checked: Vec<i64> = store
        .tracked()
        .iter()
        .filter(|row| row.last_checked.is_some())
        .map(|row| row.id)
        .collect();
    assert_eq!(checked, vec![1, 4]);
}

#[tokio::test]
async fn never_checked_row_is_selected_regardless_of_order() {
    let fresh = tracked(10, "u1", ("PEK", "AUS"), (None, None), 500);
    let checked = TrackedSearch {
        last_checked: Some(ts("2024-01-01T00:00:00Z")),
        ..tracked(11, "u1", ("PEK", "AUS"), (Some("2024-03-01"), Some("2024-03-08")), 500)
    };

    for rows in [vec![fresh.clone(), checked.clone()], vec![checked.clone(), fresh.clone()]] {
        let picked = select_one_per_user(rows);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].id, 10);
    }

    let store = Arc::new(MemoryStore::with_tracked([checked, fresh]));
    let provider = Arc::new(ReplayProvider::with_outcome(outcome(&[Some(100)])));
    let sink = Arc::new(RecordingSink::new());
    let summary = job(&store, &provider, &sink).run_at(june_first()).await.unwrap();

    // The undated winner cannot be searched; it is marked checked and skipped.
    assert_eq!(summary.rows_skipped, 1);
    assert_eq!(provider.call_count(), 0);
    assert_eq!(store.tracked_row(10).unwrap().last_checked, Some(june_first()));
    assert_eq!(store.tracked_row(11).unwrap().last_checked, Some(ts("2024-01-01T00:00:00Z")));
}

#[tokio::test]
async fn second_run_sends_no_duplicate_alerts() {
    let store = Arc::new(MemoryStore::with_tracked([
        tracked(1, "u1", ("PEK", "AUS"), WEEK, 500),
        tracked(2, "u2", ("PEK", "AUS"), WEEK, 300),
    ]));
    let provider = Arc::new(ReplayProvider::with_outcome(outcome(&[Some(450)])));
    let sink = Arc::new(RecordingSink::new());
    let job = job(&store, &provider, &sink);

    let first = job.run_at(june_first()).await.unwrap();
    let second = job.run_at(june_first()).await.unwrap();

    assert_eq!(first.alerts_sent, 1);
    assert_eq!(second.alerts_sent, 0);
    assert_eq!(second.selected_rows, 1);
    assert_eq!(sink.sent().len(), 1);
    assert!(store.tracked_row(1).unwrap().alert_sent);
    assert!(!store.tracked_row(2).unwrap().alert_sent);
}

#[tokio::test]
async fn query_dates_are_recomputed_from_today() {
    let store = Arc::new(MemoryStore::with_tracked([tracked(1, "u1", ("PEK", "AUS"), WEEK, 500)]));
    let provider = Arc::new(ReplayProvider::new());
    let sink = Arc::new(RecordingSink::new());

    job(&store, &provider, &sink).run_at(june_first()).await.unwrap();

    let calls = provider.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].outbound_date, parse_iso_date("2024-06-01").unwrap());
    assert_eq!(calls[0].return_date, Some(parse_iso_date("2024-06-08").unwrap()));
}

#[tokio::test]
async fn alerts_carry_matches_in_provider_order() {
    let store = Arc::new(MemoryStore::with_tracked([tracked(1, "u1", ("PEK", "AUS"), WEEK, 500)]));
    let provider = Arc::new(ReplayProvider::with_outcome(outcome(&[
        Some(480),
        Some(550),
        None,
        Some(450),
        Some(300),
        Some(499),
    ])));
    let sink = Arc::new(RecordingSink::new());

    job(&store, &provider, &sink).run_at(june_first()).await.unwrap();

    let sent = sink.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, Recipient::Broadcast);
    let Message::Embed(embed) = &sent[0].1 else {
        panic!("alert should be an embed");
    };
    let names: Vec<&str> = embed.fields.iter().map(|f| f.name.as_str()).collect();
    assert!(names[0].starts_with("💵 $480"));
    assert!(names[1].starts_with("💵 $450"));
    assert!(names[2].starts_with("💵 $300"));
    assert_eq!(names[3], "🔗 View on Google Flights");
    assert_eq!(embed.description.as_deref(), Some("Found 4 flights under your threshold:"));
}

#[tokio::test]
async fn failing_route_leaves_rows_unchecked_and_is_queried_once() {
    let store = Arc::new(MemoryStore::with_tracked([
        tracked(1, "u1", ("JFK", "LHR"), WEEK, 500),
        tracked(2, "u2", ("JFK", "LHR"), WEEK, 500),
        tracked(3, "u3", ("PEK", "AUS"), WEEK, 500),
    ]));
    let provider = Arc::new(
        ReplayProvider::with_outcome(outcome(&[Some(200)])).failing_route(
            &code("JFK"),
            &code("LHR"),
            "quota exhausted",
        ),
    );
    let sink = Arc::new(RecordingSink::new());

    let summary = job(&store, &provider, &sink).run_at(june_first()).await.unwrap();

    assert_eq!(provider.call_count(), 2);
    assert_eq!(summary.routes_failed, 1);
    assert_eq!(summary.rows_skipped, 2);
    assert_eq!(summary.alerts_sent, 1);
    assert_eq!(store.tracked_row(1).unwrap().last_checked, None);
    assert_eq!(store.tracked_row(2).unwrap().last_checked, None);
    assert!(store.tracked_row(3).unwrap().alert_sent);
}

#[tokio::test]
async fn write_failure_on_one_row_does_not_stop_the_rest() {
    let store = Arc::new(MemoryStore::with_tracked([
        tracked(1, "u1", ("PEK", "AUS"), WEEK, 500),
        tracked(2, "u2", ("PEK", "AUS"), WEEK, 500),
    ]));
    store.fail_writes_for(1);
    let provider = Arc::new(ReplayProvider::with_outcome(outcome(&[Some(400)])));
    let sink = Arc::new(RecordingSink::new());

    let summary = job(&store, &provider, &sink).run_at(june_first()).await.unwrap();

    assert_eq!(summary.write_failures, 2);
    assert_eq!(summary.alerts_sent, 2);
    assert!(!store.tracked_row(1).unwrap().alert_sent);
    let second = store.tracked_row(2).unwrap();
    assert!(second.alert_sent);
    assert_eq!(second.last_checked, Some(june_first()));
}

#[tokio::test]
async fn undelivered_alert_keeps_row_pending() {
    let store = Arc::new(MemoryStore::with_tracked([tracked(1, "u1", ("PEK", "AUS"), WEEK, 500)]));
    let provider = Arc::new(ReplayProvider::with_outcome(outcome(&[Some(400)])));
    let sink = Arc::new(RecordingSink::failing());

    let summary = job(&store, &provider, &sink).run_at(june_first()).await.unwrap();

    assert_eq!(summary.notify_failures, 1);
    let row = store.tracked_row(1).unwrap();
    assert!(!row.alert_sent);
    assert_eq!(row.last_checked, Some(june_first()));
}

#[tokio::test]
async fn empty_selection_is_a_no_op() {
    let store = Arc::new(MemoryStore::new());
    let provider = Arc::new(ReplayProvider::new());
    let sink = Arc::new(RecordingSink::new());

    let summary = job(&store, &provider, &sink).run_at(june_first()).await.unwrap();

    assert_eq!(summary.selected_rows, 0);
    assert_eq!(provider.call_count(), 0);
    assert_eq!(store.write_count(), 0);
}

struct StalledProvider;

#[async_trait]
impl SearchProvider for StalledProvider {
    fn provider_id(&self) -> &'static str {
        "stalled"
    }

    async fn search(&self, _params: &SearchParams) -> Result<SearchOutcome, ProviderError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(SearchOutcome::default())
    }
}

#[tokio::test(start_paused = true)]
async fn slow_provider_is_cut_off_by_the_job_timeout() {
    let store = Arc::new(MemoryStore::with_tracked([tracked(1, "u1", ("PEK", "AUS"), WEEK, 500)]));
    let sink = Arc::new(RecordingSink::new());
    let job = AlertJob::new(
        store.clone(),
        Arc::new(StalledProvider),
        sink,
        Duration::from_secs(30),
    );

    let summary = job.run_at(june_first()).await.unwrap();

    assert_eq!(summary.routes_failed, 1);
    assert_eq!(store.tracked_row(1).unwrap().last_checked, None);
}

#[tokio::test(start_paused = true)]
async fn overlapping_trigger_is_skipped() {
    let store = Arc::new(MemoryStore::with_tracked([tracked(1, "u1", ("PEK", "AUS"), WEEK, 500)]));
    let sink = Arc::new(RecordingSink::new());
    let job = AlertJob::new(store, Arc::new(StalledProvider), sink, Duration::from_secs(30));

    let background = job.clone();
    let first = tokio::spawn(async move { background.run_guarded().await });
    tokio::task::yield_now().await;

    assert!(job.run_guarded().await.is_none());
    assert!(first.await.unwrap().is_some());
}

#[tokio::test]
async fn malformed_stored_rows_are_counted_not_fatal() {
    let row = tracked(1, "u1", ("PEK", "AUS"), WEEK, 600);
    let store = Arc::new(MemoryStore::with_tracked([row]));
    store.seed_raw_tracked(serde_json::json!({
        "id": 2, "user_id": "u2", "departure_id": "BEIJING", "arrival_id": "AUS",
        "outbound_date": "2024-01-01", "return_date": "2024-01-08", "max_price": 600,
        "last_checked": null, "alert_sent": false
    }));
    let provider = Arc::new(ReplayProvider::with_outcome(outcome(&[Some(550)])));
    let sink = Arc::new(RecordingSink::new());

    let summary = job(&store, &provider, &sink).run_at(june_first()).await.unwrap();

    assert_eq!(summary.rows_undecodable, 1);
    assert_eq!(summary.pending_rows, 1);
    assert_eq!(summary.alerts_sent, 1);
    assert!(store.tracked_row(1).unwrap().alert_sent);
}
