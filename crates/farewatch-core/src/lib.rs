//! Core domain model for farewatch: tracked searches, user settings, deal
//! snapshots and the normalized flight candidates the provider returns.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod notify;
pub mod present;

pub use notify::{Color, Embed, EmbedField, Message, NotificationSink, Recipient, Reply, SinkError};

pub const CRATE_NAME: &str = "farewatch-core";

/// Deal snapshots younger than this suppress a live provider query.
pub const DEAL_FRESHNESS_HOURS: i64 = 24;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("`{0}` is not a 3-letter IATA airport code")]
    InvalidAirportCode(String),
    #[error("`{0}` is not a date in YYYY-MM-DD format")]
    InvalidDate(String),
    #[error("`{0}` is not a whole-dollar price")]
    InvalidPrice(String),
    #[error("max price cannot be negative (got {0})")]
    NegativePrice(i64),
    #[error("outbound date {outbound} must be before return date {return_date}")]
    DatesOutOfOrder {
        outbound: NaiveDate,
        return_date: NaiveDate,
    },
}

/// Uppercase 3-letter IATA airport code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IataCode(String);

impl IataCode {
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let trimmed = input.trim();
        if trimmed.len() == 3 && trimmed.chars().all(|c| c.is_ascii_alphabetic()) {
            Ok(Self(trimmed.to_ascii_uppercase()))
        } else {
            Err(ValidationError::InvalidAirportCode(input.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IataCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for IataCode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for IataCode {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<IataCode> for String {
    fn from(code: IataCode) -> Self {
        code.0
    }
}

pub fn parse_iso_date(input: &str) -> Result<NaiveDate, ValidationError> {
    NaiveDate::parse_from_str(input.trim(), "%Y-%m-%d")
        .map_err(|_| ValidationError::InvalidDate(input.to_string()))
}

pub fn parse_max_price(input: &str) -> Result<u32, ValidationError> {
    let value: i64 = input
        .trim()
        .trim_start_matches('$')
        .parse()
        .map_err(|_| ValidationError::InvalidPrice(input.to_string()))?;
    if value < 0 {
        return Err(ValidationError::NegativePrice(value));
    }
    u32::try_from(value).map_err(|_| ValidationError::InvalidPrice(input.to_string()))
}

/// A persisted round-trip price watch.
///
/// Dates are optional because older rows in the hosted table may carry nulls;
/// rows created through [`NewTrackedSearch`] always have both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedSearch {
    pub id: i64,
    pub user_id: String,
    #[serde(rename = "departure_id")]
    pub departure: IataCode,
    #[serde(rename = "arrival_id")]
    pub arrival: IataCode,
    #[serde(default)]
    pub outbound_date: Option<NaiveDate>,
    #[serde(default)]
    pub return_date: Option<NaiveDate>,
    pub max_price: u32,
    #[serde(default)]
    pub last_checked: Option<DateTime<Utc>>,
    #[serde(default)]
    pub alert_sent: bool,
}

impl TrackedSearch {
    /// Days between outbound and return; `None` when a date is missing or the
    /// range is not strictly positive.
    pub fn trip_length_days(&self) -> Option<i64> {
        let days = (self.return_date? - self.outbound_date?).num_days();
        (days > 0).then_some(days)
    }

    pub fn route_key(&self) -> Option<RouteKey> {
        Some(RouteKey {
            departure: self.departure.clone(),
            arrival: self.arrival.clone(),
            trip_days: self.trip_length_days()?,
        })
    }
}

/// Insert payload for a tracked search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewTrackedSearch {
    pub user_id: String,
    #[serde(rename = "departure_id")]
    pub departure: IataCode,
    #[serde(rename = "arrival_id")]
    pub arrival: IataCode,
    pub outbound_date: NaiveDate,
    pub return_date: NaiveDate,
    pub max_price: u32,
    pub alert_sent: bool,
    pub last_checked: Option<DateTime<Utc>>,
}

impl NewTrackedSearch {
    pub fn new(
        user_id: impl Into<String>,
        departure: IataCode,
        arrival: IataCode,
        outbound_date: NaiveDate,
        return_date: NaiveDate,
        max_price: u32,
        created_at: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        if outbound_date >= return_date {
            return Err(ValidationError::DatesOutOfOrder {
                outbound: outbound_date,
                return_date,
            });
        }
        Ok(Self {
            user_id: user_id.into(),
            departure,
            arrival,
            outbound_date,
            return_date,
            max_price,
            alert_sent: false,
            last_checked: Some(created_at),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSetting {
    pub user_id: String,
    pub home_airport: IataCode,
}

/// Cached cheapest one-way fare for a (region, destination) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealCacheEntry {
    pub region: String,
    #[serde(rename = "airport_code")]
    pub destination: IataCode,
    #[serde(default)]
    pub price: Option<u32>,
    #[serde(rename = "flight_url", default)]
    pub url: String,
    pub created_at: DateTime<Utc>,
}

impl DealCacheEntry {
    pub fn freshness_cutoff(now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::hours(DEAL_FRESHNESS_HOURS)
    }

    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.created_at >= Self::freshness_cutoff(now)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AirportStop {
    pub code: Option<String>,
    pub name: Option<String>,
    pub time: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlightLeg {
    pub airline: Option<String>,
    pub flight_number: Option<String>,
    pub departure: AirportStop,
    pub arrival: AirportStop,
}

/// One normalized itinerary returned by the search provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlightCandidate {
    pub price: Option<u32>,
    pub total_duration_minutes: Option<u32>,
    pub legs: Vec<FlightLeg>,
}

impl FlightCandidate {
    /// A candidate without a price never fits a budget.
    pub fn within_budget(&self, max_price: u32) -> bool {
        self.price.is_some_and(|price| price <= max_price)
    }
}

/// Keeps provider order.
pub fn filter_within_budget(
    candidates: &[FlightCandidate],
    max_price: u32,
) -> Vec<FlightCandidate> {
    candidates
        .iter()
        .filter(|c| c.within_budget(max_price))
        .cloned()
        .collect()
}

/// Cheapest priced candidate; unpriced ones only win when nothing is priced.
pub fn cheapest(candidates: &[FlightCandidate]) -> Option<&FlightCandidate> {
    candidates
        .iter()
        .min_by_key(|c| (c.price.is_none(), c.price.unwrap_or(u32::MAX)))
}

/// Stable sort by price ascending, unpriced last.
pub fn sort_cheapest_first(candidates: &mut [FlightCandidate]) {
    candidates.sort_by_key(|c| (c.price.is_none(), c.price.unwrap_or(u32::MAX)));
}

/// Provider queries are deduplicated per route and trip length.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteKey {
    pub departure: IataCode,
    pub arrival: IataCode,
    pub trip_days: i64,
}

impl RouteKey {
    /// Same trip length, shifted to start on `today`.
    pub fn window_from(&self, today: NaiveDate) -> (NaiveDate, NaiveDate) {
        (today, today + Duration::days(self.trip_days))
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}/{}d", self.departure, self.arrival, self.trip_days)
    }
}
