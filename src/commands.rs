//! Demo message handlers shipped with the binary.
//!
//! - `EchoHandler`: sends every message straight back
//! - `CommandHandler`: answers a handful of lookup commands
//!
//! Replies are plain English text. The country and city answers are fixed.

use crate::handler::{MessageHandler, Session};
use crate::websocket::OpCode;
use chrono::{DateTime, Local, TimeZone};
use tracing::{debug, trace};

/// Echoes messages back to the sender.
///
/// Text comes back as text, binary as binary, and pings are answered with a
/// pong carrying the same payload.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

impl MessageHandler for EchoHandler {
    fn on_message(&mut self, session: &mut Session<'_>, payload: &[u8]) {
        let reply = match session.opcode() {
            OpCode::Text => OpCode::Text,
            OpCode::Binary => OpCode::Binary,
            OpCode::Ping => OpCode::Pong,
            OpCode::Pong | OpCode::Close => return,
        };
        trace!(conn_id = session.id(), len = payload.len(), "Echo");
        if let Err(e) = session.send(payload, reply) {
            debug!(conn_id = session.id(), error = %e, "Echo failed");
        }
    }
}

/// Answers `date`, `time`, `country` and `city`.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandHandler;

impl CommandHandler {
    /// Response text for a command at the given instant.
    pub fn respond<Tz: TimeZone>(command: &str, now: &DateTime<Tz>) -> String
    where
        Tz::Offset: std::fmt::Display,
    {
        match command.trim() {
            "date" => now.format("%d.%m.%Y").to_string(),
            "time" => now.format("%H:%M:%S").to_string(),
            "country" => "Russia".to_string(),
            "city" => "Moscow".to_string(),
            _ => "Unknown command".to_string(),
        }
    }
}

impl MessageHandler for CommandHandler {
    fn on_message(&mut self, session: &mut Session<'_>, payload: &[u8]) {
        if session.opcode() != OpCode::Text {
            return;
        }
        let command = String::from_utf8_lossy(payload);
        let response = Self::respond(&command, &Local::now());
        debug!(conn_id = session.id(), command = %command, "Command");
        if let Err(e) = session.send_text(&response) {
            debug!(conn_id = session.id(), error = %e, "Command reply failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 3).unwrap()
    }

    #[test]
    fn test_date_and_time() {
        assert_eq!(CommandHandler::respond("date", &at()), "09.03.2024");
        assert_eq!(CommandHandler::respond("time", &at()), "07:05:03");
    }

    #[test]
    fn test_fixed_answers() {
        assert_eq!(CommandHandler::respond("country", &at()), "Russia");
        assert_eq!(CommandHandler::respond("city", &at()), "Moscow");
    }

    #[test]
    fn test_unknown_command() {
        assert_eq!(CommandHandler::respond("weather", &at()), "Unknown command");
        assert_eq!(CommandHandler::respond("", &at()), "Unknown command");
    }
}
