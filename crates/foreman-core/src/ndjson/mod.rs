//! NDJSON codec for the agent stream-json protocol.
//!
//! The reader turns lines from an agent's stdout into canonical message
//! types (tolerant of unknown fields and types); the writer produces the
//! user-turn lines fed to its stdin.

mod encode;
mod parser;
mod types;

pub use encode::user_turn;
pub use parser::{parse_line, parse_value};
pub use types::*;
