//! Rendering of flight candidates into notification payloads.

use crate::notify::{Color, Embed, EmbedField, Message};
use crate::{FlightCandidate, FlightLeg};

pub const PROVIDER_FOOTER: &str = "Powered by SerpAPI + Google Flights";
pub const MAX_RESULTS_SHOWN: usize = 3;
/// Platform limit for a single embed field value.
pub const FIELD_VALUE_LIMIT: usize = 1024;
pub const DEFAULT_FLIGHTS_URL: &str = "https://www.google.com/travel/flights";

fn or_unknown<'a>(value: Option<&'a str>, fallback: &'static str) -> &'a str {
    match value {
        Some(v) if !v.trim().is_empty() => v,
        _ => fallback,
    }
}

pub fn leg_text(leg: &FlightLeg) -> String {
    format!(
        "✈️ **{} {}**\n{} ({}) → {} ({})\n🕒 {} → {}",
        or_unknown(leg.airline.as_deref(), "Unknown Airline"),
        or_unknown(leg.flight_number.as_deref(), "N/A"),
        or_unknown(leg.departure.name.as_deref(), "Unknown"),
        or_unknown(leg.departure.code.as_deref(), "???"),
        or_unknown(leg.arrival.name.as_deref(), "Unknown"),
        or_unknown(leg.arrival.code.as_deref(), "???"),
        or_unknown(leg.departure.time.as_deref(), "N/A"),
        or_unknown(leg.arrival.time.as_deref(), "N/A"),
    )
}

pub fn price_label(price: Option<u32>) -> String {
    price.map_or_else(|| "?".to_string(), |p| p.to_string())
}

pub fn candidate_field(candidate: &FlightCandidate) -> EmbedField {
    let duration = candidate
        .total_duration_minutes
        .map_or_else(|| "?".to_string(), |d| d.to_string());
    let legs = candidate.legs.iter().map(leg_text).collect::<Vec<_>>();
    let value = if legs.is_empty() {
        "No leg details returned.".to_string()
    } else {
        legs.join("\n\n")
    };
    EmbedField {
        name: format!(
            "💵 ${} | 🧭 Duration: {} min",
            price_label(candidate.price),
            duration
        ),
        value: truncate_field_value(&value),
        inline: false,
    }
}

/// Embed with one field per candidate (first three, provider order) and an
/// optional deep-link field.
pub fn results_embed(
    title: impl Into<String>,
    description: impl Into<String>,
    color: Color,
    candidates: &[FlightCandidate],
    deep_link: Option<&str>,
) -> Embed {
    let mut embed = Embed::new(title, color).description(description);
    for candidate in candidates.iter().take(MAX_RESULTS_SHOWN) {
        embed.push_field(candidate_field(candidate));
    }
    if let Some(url) = deep_link.filter(|u| !u.trim().is_empty()) {
        embed = embed.field("🔗 View on Google Flights", format!("[Open Link]({url})"));
    }
    embed.footer(PROVIDER_FOOTER)
}

pub fn truncate_field_value(value: &str) -> String {
    if value.chars().count() <= FIELD_VALUE_LIMIT {
        return value.to_string();
    }
    let mut out: String = value.chars().take(FIELD_VALUE_LIMIT - 1).collect();
    out.push('…');
    out
}

/// Plain-text form used for console output and logs.
pub fn render_plain(message: &Message) -> String {
    match message {
        Message::Text(text) => text.clone(),
        Message::Embed(embed) => {
            let mut lines = vec![format!("== {} ==", embed.title)];
            if let Some(description) = &embed.description {
                lines.push(description.clone());
            }
            for field in &embed.fields {
                lines.push(String::new());
                lines.push(format!("[{}]", field.name));
                lines.push(field.value.clone());
            }
            if let Some(footer) = &embed.footer {
                lines.push(String::new());
                lines.push(format!("-- {}", footer.text));
            }
            lines.join("\n")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AirportStop;

    fn leg(airline: &str, number: &str, from: &str, to: &str) -> FlightLeg {
        FlightLeg {
            airline: Some(airline.into()),
            flight_number: Some(number.into()),
            departure: AirportStop {
                code: Some(from.into()),
                name: Some(format!("{from} International")),
                time: Some("2025-07-05 08:10".into()),
            },
            arrival: AirportStop {
                code: Some(to.into()),
                name: Some(format!("{to} Airport")),
                time: Some("2025-07-05 18:45".into()),
            },
        }
    }

    fn candidate(price: u32) -> FlightCandidate {
        FlightCandidate {
            price: Some(price),
            total_duration_minutes: Some(905),
            legs: vec![
                leg("Air China", "CA 983", "PEK", "LAX"),
                leg("United", "UA 1520", "LAX", "AUS"),
            ],
        }
    }

    #[test]
    fn candidate_field_lists_legs_in_order() {
        let field = candidate_field(&candidate(550));
        assert_eq!(field.name, "💵 $550 | 🧭 Duration: 905 min");
        let first = field.value.find("CA 983").unwrap();
        let second = field.value.find("UA 1520").unwrap();
        assert!(first < second);
        assert!(field.value.contains("PEK International (PEK) → LAX Airport (LAX)"));
    }

    #[test]
    fn missing_leg_details_fall_back_to_placeholders() {
        let field = candidate_field(&FlightCandidate {
            price: None,
            total_duration_minutes: None,
            legs: vec![FlightLeg::default()],
        });
        assert_eq!(field.name, "💵 $? | 🧭 Duration: ? min");
        assert!(field.value.contains("Unknown Airline N/A"));
    }

    #[test]
    fn results_embed_caps_at_three_and_appends_link() {
        let candidates: Vec<_> = [400, 420, 450, 480, 500].into_iter().map(candidate).collect();
        let link = Some("https://example.test/f");
        let embed = results_embed("t", "d", Color::GREEN, &candidates, link);
        assert_eq!(embed.fields.len(), 4);
        assert!(embed.fields[0].name.contains("$400"));
        assert!(embed.fields[2].name.contains("$450"));
        assert_eq!(embed.fields[3].value, "[Open Link](https://example.test/f)");
        assert_eq!(embed.footer.as_ref().map(|f| f.text.as_str()), Some(PROVIDER_FOOTER));

        let no_link = results_embed("t", "d", Color::GREEN, &candidates[..1], Some(""));
        assert_eq!(no_link.fields.len(), 1);
    }

    #[test]
    fn long_values_are_truncated_on_char_boundaries() {
        let long = "✈".repeat(FIELD_VALUE_LIMIT + 10);
        let out = truncate_field_value(&long);
        assert_eq!(out.chars().count(), FIELD_VALUE_LIMIT);
        assert!(out.ends_with('…'));
    }

    #[test]
    fn plain_rendering_includes_fields() {
        let embed = results_embed("Flights", "desc", Color::GREEN, &[candidate(450)], None);
        let text = render_plain(&Message::Embed(embed));
        assert!(text.starts_with("== Flights =="));
        assert!(text.contains("[💵 $450 | 🧭 Duration: 905 min]"));
    }
}
