use log::warn;
use serde::Deserialize;
use serde_json::Value;

use crate::error::CommandError;

/// A command sent by a subscriber over its WebSocket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `symbols: None` keeps the current filter.
    Subscribe { symbols: Option<Vec<String>> },
    Unsubscribe,
}

pub fn parse_command(text: &str) -> Result<Command, CommandError> {
    let message: Value = serde_json::from_str(text)?;

    let action = message
        .get("action")
        .and_then(Value::as_str)
        .ok_or(CommandError::MissingAction)?;

    match action {
        "subscribe" => Ok(Command::Subscribe {
            symbols: parse_symbols(message.get("symbols")),
        }),
        "unsubscribe" => Ok(Command::Unsubscribe),
        other => Err(CommandError::UnknownAction(other.to_string())),
    }
}

fn parse_symbols(value: Option<&Value>) -> Option<Vec<String>> {
    match value {
        None | Some(Value::Null) => None,
        Some(value) => match Vec::<String>::deserialize(value) {
            Ok(symbols) => Some(symbols),
            Err(e) => {
                warn!("Ignoring malformed symbols list: {}", e);
                None
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subscribe_with_symbols() {
        let command = parse_command(r#"{"action":"subscribe","symbols":["XBTUSD","ETHUSD"]}"#).unwrap();
        assert_eq!(
            command,
            Command::Subscribe {
                symbols: Some(vec!["XBTUSD".to_string(), "ETHUSD".to_string()])
            }
        );
    }

    #[test]
    fn test_parse_subscribe_without_symbols() {
        let command = parse_command(r#"{"action":"subscribe"}"#).unwrap();
        assert_eq!(command, Command::Subscribe { symbols: None });
    }

    #[test]
    fn test_parse_subscribe_with_malformed_symbols() {
        for text in [
            r#"{"action":"subscribe","symbols":"XBTUSD"}"#,
            r#"{"action":"subscribe","symbols":["XBTUSD",7]}"#,
            r#"{"action":"subscribe","symbols":null}"#,
        ] {
            assert_eq!(parse_command(text).unwrap(), Command::Subscribe { symbols: None });
        }
    }

    #[test]
    fn test_parse_empty_symbols_list() {
        let command = parse_command(r#"{"action":"subscribe","symbols":[]}"#).unwrap();
        assert_eq!(command, Command::Subscribe { symbols: Some(vec![]) });
    }

    #[test]
    fn test_parse_unsubscribe() {
        let command = parse_command(r#"{"action":"unsubscribe","symbols":["XBTUSD"]}"#).unwrap();
        assert_eq!(command, Command::Unsubscribe);
    }

    #[test]
    fn test_parse_invalid_commands() {
        assert!(matches!(parse_command("hello"), Err(CommandError::Decode(_))));
        assert!(matches!(parse_command(r#"{"symbols":["XBTUSD"]}"#), Err(CommandError::MissingAction)));
        assert!(matches!(parse_command(r#"{"action":1}"#), Err(CommandError::MissingAction)));
        assert!(matches!(parse_command(r#"["subscribe"]"#), Err(CommandError::MissingAction)));
        assert!(matches!(
            parse_command(r#"{"action":"unsubscribe_all"}"#),
            Err(CommandError::UnknownAction(action)) if action == "unsubscribe_all"
        ));
    }
}
