//! Flight search provider contract + the SerpAPI Google Flights adapter.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use farewatch_core::{AirportStop, FlightCandidate, FlightLeg, IataCode};
use farewatch_storage::{HttpClientConfig, SimpleTokenBucket};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "farewatch-adapters";

pub const SERPAPI_ENDPOINT: &str = "https://serpapi.com/search.json";
const NO_RESULTS_MARKER: &str = "hasn't returned any results";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TripType {
    RoundTrip,
    OneWay,
}

impl TripType {
    fn as_param(self) -> &'static str {
        match self {
            TripType::RoundTrip => "1",
            TripType::OneWay => "2",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchParams {
    pub departure: IataCode,
    pub arrival: IataCode,
    pub outbound_date: NaiveDate,
    pub return_date: Option<NaiveDate>,
    pub currency: String,
    pub locale: String,
    pub trip_type: TripType,
}

impl SearchParams {
    pub fn round_trip(
        departure: IataCode,
        arrival: IataCode,
        outbound_date: NaiveDate,
        return_date: NaiveDate,
    ) -> Self {
        Self {
            departure,
            arrival,
            outbound_date,
            return_date: Some(return_date),
            currency: "USD".to_string(),
            locale: "en".to_string(),
            trip_type: TripType::RoundTrip,
        }
    }

    pub fn one_way(departure: IataCode, arrival: IataCode, outbound_date: NaiveDate) -> Self {
        Self {
            departure,
            arrival,
            outbound_date,
            return_date: None,
            currency: "USD".to_string(),
            locale: "en".to_string(),
            trip_type: TripType::OneWay,
        }
    }

    /// Query parameters for the Google Flights engine, without the API key.
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("engine", "google_flights".to_string()),
            ("departure_id", self.departure.to_string()),
            ("arrival_id", self.arrival.to_string()),
            ("outbound_date", self.outbound_date.format("%Y-%m-%d").to_string()),
            ("currency", self.currency.clone()),
            ("hl", self.locale.clone()),
            ("type", self.trip_type.as_param().to_string()),
        ];
        if let (TripType::RoundTrip, Some(return_date)) = (self.trip_type, self.return_date) {
            pairs.push(("return_date", return_date.format("%Y-%m-%d").to_string()));
        }
        pairs
    }
}

/// Normalized provider answer: candidates in provider order plus a link to
/// the provider's own results page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchOutcome {
    pub candidates: Vec<FlightCandidate>,
    pub deep_link_url: Option<String>,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("search request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("search timed out after {0:?}")]
    Timeout(Duration),
    #[error("search provider returned http {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("search provider error: {0}")]
    Api(String),
    #[error("malformed search response: {0}")]
    Decode(#[from] serde_json::Error),
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    fn provider_id(&self) -> &'static str;

    async fn search(&self, params: &SearchParams) -> Result<SearchOutcome, ProviderError>;
}

#[derive(Debug, Deserialize)]
struct RawSearchResponse {
    #[serde(default)]
    best_flights: Vec<RawItinerary>,
    #[serde(default)]
    other_flights: Vec<RawItinerary>,
    #[serde(default)]
    search_metadata: Option<RawSearchMetadata>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSearchMetadata {
    #[serde(default)]
    google_flights_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawItinerary {
    #[serde(default)]
    flights: Vec<RawLeg>,
    #[serde(default)]
    total_duration: Option<f64>,
    #[serde(default)]
    price: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawLeg {
    #[serde(default)]
    departure_airport: Option<RawAirport>,
    #[serde(default)]
    arrival_airport: Option<RawAirport>,
    #[serde(default)]
    airline: Option<String>,
    #[serde(default)]
    flight_number: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawAirport {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    time: Option<String>,
}

fn whole_units(value: Option<f64>) -> Option<u32> {
    value
        .filter(|v| v.is_finite() && *v >= 0.0 && *v <= f64::from(u32::MAX))
        .map(|v| v.round() as u32)
}

fn airport_to_core(raw: Option<RawAirport>) -> AirportStop {
    raw.map(|a| AirportStop {
        code: a.id,
        name: a.name,
        time: a.time,
    })
    .unwrap_or_default()
}

fn itinerary_to_core(raw: RawItinerary) -> FlightCandidate {
    FlightCandidate {
        price: whole_units(raw.price),
        total_duration_minutes: whole_units(raw.total_duration),
        legs: raw
            .flights
            .into_iter()
            .map(|leg| FlightLeg {
                airline: leg.airline,
                flight_number: leg.flight_number,
                departure: airport_to_core(leg.departure_airport),
                arrival: airport_to_core(leg.arrival_airport),
            })
            .collect(),
    }
}

/// Normalizes a raw Google Flights response body: `best_flights` first, then
/// `other_flights`. The "no results" error the engine reports for empty
/// searches becomes an empty outcome.
pub fn parse_search_response(body: &str) -> Result<SearchOutcome, ProviderError> {
    let raw: RawSearchResponse = serde_json::from_str(body)?;
    if let Some(error) = raw.error {
        if error.contains(NO_RESULTS_MARKER) {
            return Ok(SearchOutcome::default());
        }
        return Err(ProviderError::Api(error));
    }
    let deep_link_url = raw
        .search_metadata
        .and_then(|m| m.google_flights_url)
        .filter(|url| !url.trim().is_empty());
    let candidates = raw
        .best_flights
        .into_iter()
        .chain(raw.other_flights)
        .map(itinerary_to_core)
        .collect();
    Ok(SearchOutcome {
        candidates,
        deep_link_url,
    })
}

/// Live SerpAPI client. Requests are never retried here.
#[derive(Debug)]
pub struct SerpApiProvider {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
    timeout: Duration,
    token_bucket: Option<SimpleTokenBucket>,
}

impl SerpApiProvider {
    pub fn new(api_key: impl Into<String>, http: &HttpClientConfig) -> Result<Self> {
        Ok(Self {
            client: http.build_client()?,
            api_key: api_key.into(),
            endpoint: SERPAPI_ENDPOINT.to_string(),
            timeout: http.timeout,
            token_bucket: http.token_bucket(),
        })
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl SearchProvider for SerpApiProvider {
    fn provider_id(&self) -> &'static str {
        "serpapi-google-flights"
    }

    async fn search(&self, params: &SearchParams) -> Result<SearchOutcome, ProviderError> {
        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let span = info_span!(
            "provider_search",
            departure = %params.departure,
            arrival = %params.arrival,
            outbound = %params.outbound_date,
        );
        async {
            let mut query = params.query_pairs();
            query.push(("api_key", self.api_key.clone()));

            let response = self
                .client
                .get(self.endpoint.as_str())
                .query(&query)
                .send()
                .await
                .map_err(|err| self.classify(err))?;
            let status = response.status();
            let body = response.text().await.map_err(|err| self.classify(err))?;
            if !status.is_success() {
                // SerpAPI reports bad keys and exhausted quotas as JSON `error` bodies.
                let detail = serde_json::from_str::<RawSearchResponse>(&body)
                    .ok()
                    .and_then(|r| r.error)
                    .unwrap_or(body);
                return Err(ProviderError::HttpStatus {
                    status: status.as_u16(),
                    body: detail,
                });
            }
            let outcome = parse_search_response(&body)?;
            debug!(candidates = outcome.candidates.len(), "provider search complete");
            Ok::<_, ProviderError>(outcome)
        }
        .instrument(span)
        .await
    }
}

impl SerpApiProvider {
    fn classify(&self, err: reqwest::Error) -> ProviderError {
        if err.is_timeout() {
            ProviderError::Timeout(self.timeout)
        } else {
            ProviderError::Request(err)
        }
    }
}

/// Replays canned outcomes instead of calling a live provider. Used for
/// offline runs (`--replay`) and as the provider double in tests; every call
/// is recorded.
#[derive(Debug, Default)]
pub struct ReplayProvider {
    default: Option<SearchOutcome>,
    routes: HashMap<(IataCode, IataCode), std::result::Result<SearchOutcome, String>>,
    calls: Mutex<Vec<SearchParams>>,
}

impl ReplayProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_outcome(outcome: SearchOutcome) -> Self {
        Self {
            default: Some(outcome),
            ..Self::default()
        }
    }

    /// Loads a recorded raw provider response from disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let body = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let outcome =
            parse_search_response(&body).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::with_outcome(outcome))
    }

    pub fn on_route(
        mut self,
        departure: &IataCode,
        arrival: &IataCode,
        outcome: SearchOutcome,
    ) -> Self {
        self.routes
            .insert((departure.clone(), arrival.clone()), Ok(outcome));
        self
    }

    pub fn failing_route(
        mut self,
        departure: &IataCode,
        arrival: &IataCode,
        message: &str,
    ) -> Self {
        self.routes
            .insert((departure.clone(), arrival.clone()), Err(message.to_string()));
        self
    }

    pub fn calls(&self) -> Vec<SearchParams> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or_default()
    }
}

#[async_trait]
impl SearchProvider for ReplayProvider {
    fn provider_id(&self) -> &'static str {
        "replay"
    }

    async fn search(&self, params: &SearchParams) -> Result<SearchOutcome, ProviderError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(params.clone());
        }
        match self
            .routes
            .get(&(params.departure.clone(), params.arrival.clone()))
        {
            Some(Ok(outcome)) => Ok(outcome.clone()),
            Some(Err(message)) => Err(ProviderError::Api(message.clone())),
            None => Ok(self.default.clone().unwrap_or_default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(s: &str) -> IataCode {
        IataCode::parse(s).unwrap()
    }

    fn date(s: &str) -> NaiveDate {
        farewatch_core::parse_iso_date(s).unwrap()
    }

    #[test]
    fn round_trip_query_carries_both_dates() {
        let params = SearchParams::round_trip(
            code("PEK"),
            code("AUS"),
            date("2025-07-05"),
            date("2025-07-11"),
        );
        let pairs = params.query_pairs();
        assert!(pairs.contains(&("engine", "google_flights".to_string())));
        assert!(pairs.contains(&("outbound_date", "2025-07-05".to_string())));
        assert!(pairs.contains(&("return_date", "2025-07-11".to_string())));
        assert!(pairs.contains(&("type", "1".to_string())));
        assert!(pairs.contains(&("currency", "USD".to_string())));
        assert!(!pairs.iter().any(|(k, _)| *k == "api_key"));
    }

    #[test]
    fn one_way_query_omits_return_date() {
        let params = SearchParams::one_way(code("AUS"), code("SIN"), date("2025-07-25"));
        let pairs = params.query_pairs();
        assert!(pairs.contains(&("type", "2".to_string())));
        assert!(!pairs.iter().any(|(k, _)| *k == "return_date"));
    }

    #[test]
    fn best_flights_precede_other_flights() {
        let body = r#"{
            "search_metadata": {"google_flights_url": "https://www.google.com/travel/flights?q=x"},
            "best_flights": [{"price": 720, "total_duration": 900, "flights": []}],
            "other_flights": [{"price": 550.4, "flights": [{
                "airline": "United", "flight_number": "UA 1",
                "departure_airport":
                    {"id": "PEK", "name": "Beijing Capital", "time": "2025-07-05 08:00"},
                "arrival_airport":
                    {"id": "AUS", "name": "Austin-Bergstrom", "time": "2025-07-05 20:00"}}]},
                {"total_duration": 1000, "flights": []}]
        }"#;
        let outcome = parse_search_response(body).unwrap();
        let prices: Vec<_> = outcome.candidates.iter().map(|c| c.price).collect();
        assert_eq!(prices, vec![Some(720), Some(550), None]);
        assert_eq!(outcome.candidates[1].legs[0].departure.code.as_deref(), Some("PEK"));
        assert_eq!(
            outcome.deep_link_url.as_deref(),
            Some("https://www.google.com/travel/flights?q=x")
        );
    }

    #[test]
    fn engine_errors_are_classified() {
        let empty = parse_search_response(
            r#"{"error": "Google Flights hasn't returned any results for this query."}"#,
        )
        .unwrap();
        assert!(empty.candidates.is_empty());

        let err = parse_search_response(r#"{"error": "Invalid API key."}"#).unwrap_err();
        assert!(matches!(err, ProviderError::Api(msg) if msg == "Invalid API key."));

        assert!(matches!(parse_search_response("<html>"), Err(ProviderError::Decode(_))));
    }

    #[tokio::test]
    async fn replay_provider_records_calls_and_route_overrides() {
        let cheap = SearchOutcome {
            candidates: vec![FlightCandidate {
                price: Some(99),
                ..Default::default()
            }],
            deep_link_url: None,
        };
        let provider = ReplayProvider::new()
            .on_route(&code("PEK"), &code("AUS"), cheap.clone())
            .failing_route(&code("JFK"), &code("LHR"), "quota exhausted");

        let hit = provider
            .search(&SearchParams::one_way(code("PEK"), code("AUS"), date("2025-07-25")))
            .await
            .unwrap();
        assert_eq!(hit, cheap);
        let miss = provider
            .search(&SearchParams::one_way(code("SFO"), code("AUS"), date("2025-07-25")))
            .await
            .unwrap();
        assert!(miss.candidates.is_empty());
        assert!(provider
            .search(&SearchParams::one_way(code("JFK"), code("LHR"), date("2025-07-25")))
            .await
            .is_err());
        assert_eq!(provider.call_count(), 3);
    }
}
