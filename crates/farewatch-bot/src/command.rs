//! Prefix command grammar.

use chrono::NaiveDate;
use farewatch_core::{parse_iso_date, parse_max_price, IataCode, ValidationError};
use thiserror::Error;

pub const DEFAULT_PREFIX: &str = "!";

/// Name, argument synopsis and help text for every command.
pub const COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        name: "lookup_flight",
        args: "<from> <to> <outbound_date> <return_date> <max_price>",
        help: "Search a round-trip flight. If nothing is under your price the search is saved and \
               checked again every week.\n\
               **Example:** `{prefix}lookup_flight PEK AUS 2025-07-05 2025-07-11 600`\n\n\
               • `from` / `to` = IATA airport codes (e.g. PEK, AUS)\n\
               • `outbound_date` / `return_date` = YYYY-MM-DD\n\
               • `max_price` = price threshold in USD",
    },
    CommandSpec {
        name: "my_flights",
        args: "",
        help: "List the flight price alerts you are tracking.",
    },
    CommandSpec {
        name: "delete_flight",
        args: "<from> <to>",
        help: "Remove every saved alert you have for a route, whatever its dates or max price.",
    },
    CommandSpec {
        name: "set_home",
        args: "<IATA>",
        help: "Set your hometown airport, used by the daily deals command.",
    },
    CommandSpec {
        name: "todays_deals",
        args: "",
        help: "One-way deals from your hometown airport that may be gone tomorrow.",
    },
    CommandSpec {
        name: "help",
        args: "",
        help: "Show this message.",
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSpec {
    pub name: &'static str,
    pub args: &'static str,
    pub help: &'static str,
}

impl CommandSpec {
    pub fn usage(&self, prefix: &str) -> String {
        if self.args.is_empty() {
            format!("{prefix}{}", self.name)
        } else {
            format!("{prefix}{} {}", self.name, self.args)
        }
    }

    pub fn help_text(&self, prefix: &str) -> String {
        self.help.replace("{prefix}", prefix)
    }

    fn find(name: &str) -> Option<&'static CommandSpec> {
        COMMANDS.iter().find(|spec| spec.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupRequest {
    pub departure: IataCode,
    pub arrival: IataCode,
    pub outbound_date: NaiveDate,
    pub return_date: NaiveDate,
    pub max_price: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    LookupFlight(LookupRequest),
    MyFlights,
    DeleteFlight { departure: IataCode, arrival: IataCode },
    SetHome { airport: IataCode },
    TodaysDeals,
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("Unknown command `{name}`. Try `{prefix}help`.")]
    UnknownCommand { name: String, prefix: String },
    #[error("Usage: `{usage}`")]
    Usage { usage: String },
    #[error("⚠️ {0}")]
    Invalid(#[from] ValidationError),
}

/// Parses one chat line. `Ok(None)` means the line is not addressed to the
/// bot (no prefix, or the prefix alone).
pub fn parse_command(prefix: &str, line: &str) -> Result<Option<Command>, ParseError> {
    let Some(body) = line.trim().strip_prefix(prefix) else {
        return Ok(None);
    };
    let mut words = body.split_whitespace();
    let Some(name) = words.next() else {
        return Ok(None);
    };
    let args: Vec<&str> = words.collect();
    let name = name.to_ascii_lowercase();

    let Some(spec) = CommandSpec::find(&name) else {
        return Err(ParseError::UnknownCommand {
            name,
            prefix: prefix.to_string(),
        });
    };
    let arity = if spec.args.is_empty() {
        0
    } else {
        spec.args.split_whitespace().count()
    };
    if args.len() != arity {
        return Err(ParseError::Usage {
            usage: spec.usage(prefix),
        });
    }

    let command = match spec.name {
        "lookup_flight" => {
            let outbound_date = parse_iso_date(args[2])?;
            let return_date = parse_iso_date(args[3])?;
            if outbound_date >= return_date {
                return Err(ValidationError::DatesOutOfOrder {
                    outbound: outbound_date,
                    return_date,
                }
                .into());
            }
            Command::LookupFlight(LookupRequest {
                departure: IataCode::parse(args[0])?,
                arrival: IataCode::parse(args[1])?,
                outbound_date,
                return_date,
                max_price: parse_max_price(args[4])?,
            })
        }
        "my_flights" => Command::MyFlights,
        "delete_flight" => Command::DeleteFlight {
            departure: IataCode::parse(args[0])?,
            arrival: IataCode::parse(args[1])?,
        },
        "set_home" => Command::SetHome {
            airport: IataCode::parse(args[0])?,
        },
        "todays_deals" => Command::TodaysDeals,
        _ => Command::Help,
    };
    Ok(Some(command))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(s: &str) -> IataCode {
        IataCode::parse(s).unwrap()
    }

    #[test]
    fn lookup_arguments_are_validated_and_normalized() {
        let command = parse_command("!", "!lookup_flight pek aus 2025-07-05 2025-07-11 600")
            .unwrap()
            .unwrap();
        assert_eq!(
            command,
            Command::LookupFlight(LookupRequest {
                departure: code("PEK"),
                arrival: code("AUS"),
                outbound_date: parse_iso_date("2025-07-05").unwrap(),
                return_date: parse_iso_date("2025-07-11").unwrap(),
                max_price: 600,
            })
        );
    }

    #[test]
    fn invalid_lookup_arguments_are_rejected() {
        assert!(matches!(
            parse_command("!", "!lookup_flight PEK AUS 07/05/2025 2025-07-11 600"),
            Err(ParseError::Invalid(ValidationError::InvalidDate(_)))
        ));
        assert!(matches!(
            parse_command("!", "!lookup_flight PEK AUS 2025-07-11 2025-07-05 600"),
            Err(ParseError::Invalid(ValidationError::DatesOutOfOrder { .. }))
        ));
        assert!(matches!(
            parse_command("!", "!lookup_flight PEK AUSTIN 2025-07-05 2025-07-11 600"),
            Err(ParseError::Invalid(ValidationError::InvalidAirportCode(_)))
        ));
        assert!(matches!(
            parse_command("!", "!lookup_flight PEK AUS 2025-07-05 2025-07-11 -1"),
            Err(ParseError::Invalid(ValidationError::NegativePrice(-1)))
        ));
    }

    #[test]
    fn wrong_arity_reports_usage() {
        let err = parse_command("!", "!delete_flight PEK").unwrap_err();
        assert_eq!(err.to_string(), "Usage: `!delete_flight <from> <to>`");
        assert!(parse_command("!", "!my_flights extra").is_err());
    }

    #[test]
    fn non_commands_are_ignored() {
        assert_eq!(parse_command("!", "hello there"), Ok(None));
        assert_eq!(parse_command("!", "!"), Ok(None));
        assert!(matches!(
            parse_command("!", "!track_flight PEK AUS"),
            Err(ParseError::UnknownCommand { .. })
        ));
    }

    #[test]
    fn custom_prefix_and_case_insensitive_names() {
        assert_eq!(
            parse_command("?", "?SET_HOME sfo").unwrap(),
            Some(Command::SetHome { airport: code("SFO") })
        );
        assert_eq!(parse_command("?", "!help").unwrap(), None);
        assert_eq!(parse_command("?", "?help").unwrap(), Some(Command::Help));
    }
}
