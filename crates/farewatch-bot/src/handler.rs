//! Interactive command handlers. Every invocation produces a [`Reply`] for
//! the caller; failures become short visible messages.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use farewatch_adapters::{ProviderError, SearchParams, SearchProvider};
use farewatch_core::present::{
    price_label, results_embed, truncate_field_value, DEFAULT_FLIGHTS_URL, PROVIDER_FOOTER,
};
use farewatch_core::{
    cheapest, filter_within_budget, sort_cheapest_first, Color, DealCacheEntry, Embed,
    FlightCandidate, IataCode, Message, NewTrackedSearch, Reply, TrackedSearch, UserSetting,
    ValidationError,
};
use farewatch_storage::{FareStore, StoreError};
use thiserror::Error;
use tracing::{info, warn};

use crate::command::{parse_command, Command, LookupRequest, COMMANDS, DEFAULT_PREFIX};
use crate::regions::DealRegions;

/// Live deal searches render at most this many results.
pub const DEALS_SHOWN: usize = 2;
/// Chat platform limit on fields per embed.
pub const MAX_EMBED_FIELDS: usize = 25;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("⚠️ API error: {0}")]
    Provider(#[from] ProviderError),
    #[error("⚠️ Storage error: {0}")]
    Store(#[from] StoreError),
    #[error("⚠️ {0}")]
    Invalid(#[from] ValidationError),
}

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Clone)]
pub struct CommandHandler {
    store: Arc<dyn FareStore>,
    provider: Arc<dyn SearchProvider>,
    regions: DealRegions,
    prefix: String,
    clock: Clock,
}

impl CommandHandler {
    pub fn new(
        store: Arc<dyn FareStore>,
        provider: Arc<dyn SearchProvider>,
        regions: DealRegions,
    ) -> Self {
        Self {
            store,
            provider,
            regions,
            prefix: DEFAULT_PREFIX.to_string(),
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Handles one chat line from `user_id`; `None` when the line is not a
    /// command.
    pub async fn handle_line(&self, user_id: &str, line: &str) -> Option<Reply> {
        match parse_command(&self.prefix, line) {
            Ok(Some(command)) => Some(self.dispatch(user_id, command).await),
            Ok(None) => None,
            Err(err) => Some(Reply::text(err.to_string())),
        }
    }

    pub async fn dispatch(&self, user_id: &str, command: Command) -> Reply {
        info!(user_id, command = ?command, "handling command");
        let result = match command {
            Command::LookupFlight(request) => return self.lookup_flight(user_id, &request).await,
            Command::MyFlights => self.my_flights(user_id).await,
            Command::DeleteFlight { departure, arrival } => {
                self.delete_flight(user_id, &departure, &arrival).await
            }
            Command::SetHome { airport } => self.set_home(user_id, airport).await,
            Command::TodaysDeals => return self.todays_deals(user_id).await,
            Command::Help => Ok(Reply::embed(self.help_embed())),
        };
        result.unwrap_or_else(|err| {
            warn!(user_id, error = %err, "command failed");
            Reply::text(err.to_string())
        })
    }

    pub async fn lookup_flight(&self, user_id: &str, request: &LookupRequest) -> Reply {
        let reply = Reply::text(format!(
            "🔍 Searching for flights from `{}` to `{}` under **${}**...",
            request.departure, request.arrival, request.max_price
        ));
        match self.lookup_results(user_id, request).await {
            Ok(message) => push(reply, message),
            Err(err) => {
                warn!(user_id, error = %err, "lookup failed");
                reply.then_text(err.to_string())
            }
        }
    }

    async fn lookup_results(
        &self,
        user_id: &str,
        request: &LookupRequest,
    ) -> Result<Message, CommandError> {
        let params = SearchParams::round_trip(
            request.departure.clone(),
            request.arrival.clone(),
            request.outbound_date,
            request.return_date,
        );
        let outcome = self.provider.search(&params).await?;
        if outcome.candidates.is_empty() {
            return Ok(Message::Text("❌ No flights found.".to_string()));
        }
        let deep_link = outcome.deep_link_url.as_deref();

        let matches = filter_within_budget(&outcome.candidates, request.max_price);
        if !matches.is_empty() {
            return Ok(Message::Embed(results_embed(
                format!("🎯 Flights Under ${}", request.max_price),
                format!("Found {} flights under your threshold:", matches.len()),
                Color::GREEN,
                &matches,
                deep_link,
            )));
        }

        let tracked = NewTrackedSearch::new(
            user_id,
            request.departure.clone(),
            request.arrival.clone(),
            request.outbound_date,
            request.return_date,
            request.max_price,
            (self.clock)(),
        )?;
        let saved = self.store.insert_tracked_search(&tracked).await?;
        info!(user_id, row_id = saved.id, "saved tracked search");

        let best: Vec<FlightCandidate> =
            cheapest(&outcome.candidates).cloned().into_iter().collect();
        Ok(Message::Embed(results_embed(
            "💡 No flights under your price range",
            "We've saved your search and will check again weekly. Here's the current best flights:",
            Color::ORANGE,
            &best,
            deep_link,
        )))
    }

    pub async fn my_flights(&self, user_id: &str) -> Result<Reply, CommandError> {
        let batch = self.store.tracked_searches_for_user(user_id).await?;
        let unreadable = match batch.undecodable {
            0 => None,
            1 => Some("1 saved alert could not be read.".to_string()),
            n => Some(format!("{n} saved alerts could not be read.")),
        };
        let rows = batch.rows;
        if rows.is_empty() {
            let text = "The current user doesn't have any saved flight price alerts";
            return Ok(match unreadable {
                Some(note) => Reply::text(format!("{text}\n{note}")),
                None => Reply::text(text),
            });
        }

        let mut description =
            "These are the flights that are going to be checked for weekly updates.".to_string();
        if rows.len() > MAX_EMBED_FIELDS {
            description.push_str(&format!("\nShowing {MAX_EMBED_FIELDS} of {}.", rows.len()));
        }
        if let Some(note) = unreadable {
            description.push('\n');
            description.push_str(&note);
        }
        let mut embed =
            Embed::new("Your Tracked Flight Alerts", Color::BLUE).description(description);
        for row in rows.iter().take(MAX_EMBED_FIELDS) {
            let route = format!("{} -> {}", row.departure, row.arrival);
            embed = embed.field(route, tracked_summary(row));
        }
        Ok(Reply::embed(embed))
    }

    pub async fn delete_flight(
        &self,
        user_id: &str,
        departure: &IataCode,
        arrival: &IataCode,
    ) -> Result<Reply, CommandError> {
        let removed = self.store.delete_tracked_route(user_id, departure, arrival).await?;
        let text = match removed.len() {
            0 => format!("No saved alerts found for `{departure} → {arrival}`."),
            1 => format!("Deleted 1 saved alert for `{departure} → {arrival}`."),
            n => format!("Deleted {n} saved alerts for `{departure} → {arrival}`."),
        };
        Ok(Reply::text(text))
    }

    pub async fn set_home(&self, user_id: &str, airport: IataCode) -> Result<Reply, CommandError> {
        let setting = UserSetting {
            user_id: user_id.to_string(),
            home_airport: airport,
        };
        self.store.upsert_user_setting(&setting).await?;
        Ok(Reply::text(format!(
            "Your hometown airport has been updated to `{}`.",
            setting.home_airport
        )))
    }

    pub async fn todays_deals(&self, user_id: &str) -> Reply {
        let home = match self.store.home_airport(user_id).await {
            Ok(Some(home)) => home,
            Ok(None) => {
                return Reply::text(format!(
                    "✈️ You still need to set a hometown airport. \
                     Please run `{}set_home` with your desired IATA code.",
                    self.prefix
                ))
            }
            Err(err) => return Reply::text(CommandError::from(err).to_string()),
        };
        let Some((region, destination)) = self.pick_destination() else {
            return Reply::text("No deal destinations are configured.");
        };

        let reply = Reply::text(format!("🔎 Finding today's best deals from `{home}`..."));
        match self.deal_results(&home, &region, &destination).await {
            Ok(message) => push(reply, message),
            Err(err) => {
                warn!(user_id, error = %err, "deal search failed");
                reply.then_text(err.to_string())
            }
        }
    }

    fn pick_destination(&self) -> Option<(String, IataCode)> {
        let mut rng = rand::thread_rng();
        self.regions
            .pick(&mut rng)
            .map(|(region, destination)| (region.to_string(), destination.clone()))
    }

    async fn deal_results(
        &self,
        home: &IataCode,
        region: &str,
        destination: &IataCode,
    ) -> Result<Message, CommandError> {
        let now = (self.clock)();
        let embed = Embed::new("🔥 Best Flight Deals Today", Color::BLUE)
            .description("Here are some one-way options to popular destinations!");

        let cached = match self.store.fresh_deal(region, destination, now).await {
            Ok(hit) => hit,
            Err(err) => {
                warn!(
                    region,
                    %destination,
                    error = %err,
                    "deal cache lookup failed; searching live"
                );
                None
            }
        };
        if let Some(hit) = cached {
            let url = if hit.url.trim().is_empty() {
                DEFAULT_FLIGHTS_URL
            } else {
                hit.url.as_str()
            };
            return Ok(Message::Embed(
                embed
                    .field(
                        deal_title(region, destination, hit.price),
                        format!("📦 Pulled from cache (last 24 hrs)\n🔗 [Google Flights]({url})"),
                    )
                    .footer(PROVIDER_FOOTER),
            ));
        }

        let tomorrow = now.date_naive() + Duration::days(1);
        let params = SearchParams::one_way(home.clone(), destination.clone(), tomorrow);
        let outcome = self.provider.search(&params).await?;
        let mut candidates = outcome.candidates;
        if candidates.is_empty() {
            return Ok(Message::Text("😔 No flights found right now. Try again later!".to_string()));
        }
        sort_cheapest_first(&mut candidates);
        let url = outcome.deep_link_url.unwrap_or_default();

        let mut embed = embed;
        for candidate in candidates.iter().take(DEALS_SHOWN) {
            embed = embed.field(
                deal_title(region, destination, candidate.price),
                deal_summary(candidate, &url),
            );
        }

        let top = &candidates[0];
        let entry = DealCacheEntry {
            region: region.to_string(),
            destination: destination.clone(),
            price: top.price,
            url: url.clone(),
            created_at: now,
        };
        if let Err(err) = self.store.insert_deal(&entry).await {
            warn!(region, %destination, error = %err, "could not cache deal");
        }

        Ok(Message::Embed(embed.footer(PROVIDER_FOOTER)))
    }

    pub fn help_embed(&self) -> Embed {
        let mut embed = Embed::new("Flight Tracker Bot Commands", Color::BLUE)
            .description("Here's how to use the bot to track and manage flights:");
        for spec in COMMANDS {
            let usage = format!("`{}`", spec.usage(&self.prefix));
            embed = embed.field(usage, spec.help_text(&self.prefix));
        }
        embed
    }
}

fn push(mut reply: Reply, message: Message) -> Reply {
    reply.messages.push(message);
    reply
}

fn tracked_summary(row: &TrackedSearch) -> String {
    let date = |d: Option<chrono::NaiveDate>| d.map_or_else(|| "?".to_string(), |d| d.to_string());
    let status = if row.alert_sent { "\nAlert sent" } else { "" };
    format!(
        "{} -> {}\nMax Price: ${}{status}",
        date(row.outbound_date),
        date(row.return_date),
        row.max_price
    )
}

fn deal_title(region: &str, destination: &IataCode, price: Option<u32>) -> String {
    format!("{region} → {destination} | 💵 ${}", price_label(price))
}

fn deal_summary(candidate: &FlightCandidate, url: &str) -> String {
    let url = if url.trim().is_empty() { DEFAULT_FLIGHTS_URL } else { url };
    let duration = candidate
        .total_duration_minutes
        .map_or_else(|| "N/A".to_string(), |m| format!("{m} min"));
    let text = match candidate.legs.first() {
        Some(leg) => format!(
            "**{} {}**\n{} → {}\n🕒 {} → {} ({duration})\n🔗 [View on Google Flights]({url})",
            leg.airline.as_deref().unwrap_or("Unknown"),
            leg.flight_number.as_deref().unwrap_or("N/A"),
            leg.departure.code.as_deref().unwrap_or("Unknown"),
            leg.arrival.code.as_deref().unwrap_or("Unknown"),
            leg.departure.time.as_deref().unwrap_or("N/A"),
            leg.arrival.time.as_deref().unwrap_or("N/A"),
        ),
        None => format!("🕒 {duration}\n🔗 [View on Google Flights]({url})"),
    };
    truncate_field_value(&text)
}
