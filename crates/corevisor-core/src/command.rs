use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Control commands accepted from any command source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Start,
    Stop,
    Exit,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown command: {0:?}")]
pub struct UnknownCommand(pub String);

impl FromStr for Command {
    type Err = UnknownCommand;

    /// Parses a token case-insensitively, ignoring surrounding whitespace
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.trim().to_ascii_lowercase();
        match token.as_str() {
            "start" => Ok(Command::Start),
            "stop" => Ok(Command::Stop),
            "exit" => Ok(Command::Exit),
            _ => Err(UnknownCommand(token)),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::Start => "start",
            Command::Stop => "stop",
            Command::Exit => "exit",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!("start".parse::<Command>(), Ok(Command::Start));
        assert_eq!("  STOP\r\n".parse::<Command>(), Ok(Command::Stop));
        assert_eq!("Exit".parse::<Command>(), Ok(Command::Exit));
    }

    #[test]
    fn test_unknown_command() {
        let err = "restart".parse::<Command>().unwrap_err();
        assert_eq!(err, UnknownCommand("restart".into()));
        assert!("".parse::<Command>().is_err());
    }
}
