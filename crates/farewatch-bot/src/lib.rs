//! Chat-facing side of farewatch: command grammar, handlers, the daily-deals
//! region table, and Discord delivery over REST plus the gateway.

pub mod command;
pub mod discord;
pub mod gateway;
pub mod handler;
pub mod regions;

pub use command::{parse_command, Command, LookupRequest, ParseError, COMMANDS};
pub use discord::DiscordSink;
pub use gateway::GatewayListener;
pub use handler::{CommandError, CommandHandler};
pub use regions::{DealRegions, Region};

pub const CRATE_NAME: &str = "farewatch-bot";
