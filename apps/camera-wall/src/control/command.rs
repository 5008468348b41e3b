use serde_json::{Map, Value};
use thiserror::Error;

/// A control request, already validated far enough to be dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    AddStream { id: String, url: String },
    RemoveStream { id: String },
    /// Missing or non-numeric dimensions keep their current value.
    Grid { rows: Option<i64>, cols: Option<i64> },
}

/// Why a control record produced no command.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("blank record")]
    Blank,
    #[error("malformed record: {0}")]
    Malformed(String),
    #[error("record has no cmd")]
    MissingVerb,
    #[error("unknown command: {0}")]
    UnknownVerb(String),
    #[error("{verb} without {field}")]
    MissingField {
        verb: &'static str,
        field: &'static str,
    },
}

impl Command {
    pub const ADD_STREAM: &'static str = "add_stream";
    pub const REMOVE_STREAM: &'static str = "remove_stream";
    pub const GRID: &'static str = "grid";

    /// Parse one newline-delimited record: `{"cmd": "<verb>", "payload": {...}}`.
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(CommandError::Blank);
        }

        let record: Value =
            serde_json::from_str(line).map_err(|e| CommandError::Malformed(e.to_string()))?;
        let Value::Object(record) = record else {
            return Err(CommandError::Malformed("not a JSON object".to_string()));
        };

        let verb = record
            .get("cmd")
            .and_then(Value::as_str)
            .filter(|v| !v.is_empty())
            .ok_or(CommandError::MissingVerb)?;

        let empty = Map::new();
        let payload = record
            .get("payload")
            .and_then(Value::as_object)
            .unwrap_or(&empty);

        Self::from_parts(verb, payload)
    }

    /// Build a command from a verb and its payload object.
    pub fn from_parts(verb: &str, payload: &Map<String, Value>) -> Result<Self, CommandError> {
        match verb {
            Self::ADD_STREAM => Ok(Command::AddStream {
                id: required_str(payload, Self::ADD_STREAM, "id")?,
                url: required_str(payload, Self::ADD_STREAM, "url")?,
            }),
            Self::REMOVE_STREAM => Ok(Command::RemoveStream {
                id: required_str(payload, Self::REMOVE_STREAM, "id")?,
            }),
            Self::GRID => Ok(Command::Grid {
                rows: integer(payload, "rows"),
                cols: integer(payload, "cols"),
            }),
            other => Err(CommandError::UnknownVerb(other.to_string())),
        }
    }

    pub fn verb(&self) -> &'static str {
        match self {
            Command::AddStream { .. } => Self::ADD_STREAM,
            Command::RemoveStream { .. } => Self::REMOVE_STREAM,
            Command::Grid { .. } => Self::GRID,
        }
    }
}

fn required_str(
    payload: &Map<String, Value>,
    verb: &'static str,
    field: &'static str,
) -> Result<String, CommandError> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or(CommandError::MissingField { verb, field })
}

/// Integer field; integral floats count, anything else is absent.
fn integer(payload: &Map<String, Value>, field: &str) -> Option<i64> {
    let value = payload.get(field)?;
    if let Some(n) = value.as_i64() {
        return Some(n);
    }
    value
        .as_f64()
        .filter(|f| f.fract() == 0.0 && *f >= i64::MIN as f64 && *f <= i64::MAX as f64)
        .map(|f| f as i64)
}
