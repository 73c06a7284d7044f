//! Line-oriented wire protocol spoken between relays and the server
//!
//! Every command is a single newline-terminated ASCII line of the form
//! `<verb>[ <payload>]`.
//!
//! | Direction      | Line                   |
//! |----------------|------------------------|
//! | relay → server | `id <name>`            |
//! | server → relay | `ok`                   |
//! | server → relay | `beat <seconds>`       |
//! | relay → server | `ping`                 |
//! | server → relay | `pong`                 |
//! | server → relay | `get <n1,n2,...>`      |
//! | relay → server | `got <n-sub:v,...>`    |
//! | relay → server | `add <name>[:t1,t2]`   |
//! | relay → server | `remove <name>`        |
//! | either         | `close`                |

use std::fmt;

use tracing::trace;

/// Reserved relay-side collector name, used by [`crate::Relay::info`].
pub const CONNECTED: &str = "_connected";

/// Characters that carry meaning inside `get`/`got`/`add` payloads.
pub const METACHARACTERS: [char; 3] = ['-', ':', ','];

/// Sentinel stored when a reading cannot be parsed as a number.
pub const UNPARSABLE: &str = "-1";

/// Longest heartbeat interval either side accepts, one day.
pub const MAX_HEARTBEAT_SECS: u64 = 24 * 60 * 60;

/// A single decoded wire command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Id(String),
    Ok,
    Beat(u64),
    Ping,
    Pong,
    Get(Vec<String>),
    Got(Vec<Reading>),
    Add { name: String, tags: Vec<String> },
    Remove(String),
    Close,
}

/// One `key:value` entry of a `got` payload
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    /// Collector name (the part of the key before the first `-`)
    pub name: String,

    /// Full metric key, `name` or `name-sub`
    pub key: String,

    /// Numeric string, or [`UNPARSABLE`]
    pub value: String,
}

/// Errors produced while decoding a wire line
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// The line was empty
    Empty,

    /// The verb is not part of the protocol
    UnknownCommand(String),

    /// The verb requires a payload but none was given
    MissingArgument(&'static str),

    /// The payload could not be decoded
    InvalidArgument(&'static str, String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Empty => write!(f, "empty command"),
            ProtocolError::UnknownCommand(verb) => write!(f, "unknown command '{verb}'"),
            ProtocolError::MissingArgument(verb) => write!(f, "missing argument for '{verb}'"),
            ProtocolError::InvalidArgument(verb, arg) => {
                write!(f, "invalid argument for '{verb}': {arg}")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

impl Command {
    /// Decode a single line (with or without its trailing newline).
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim_end_matches(['\n', '\r']);
        if line.is_empty() {
            return Err(ProtocolError::Empty);
        }

        let (verb, payload) = match line.split_once(' ') {
            Some((verb, payload)) => (verb, Some(payload)),
            None => (line, None),
        };

        match verb {
            "ok" => Ok(Command::Ok),
            "ping" => Ok(Command::Ping),
            "pong" => Ok(Command::Pong),
            "close" => Ok(Command::Close),
            "id" => match payload {
                Some(id) if !id.is_empty() => Ok(Command::Id(id.to_string())),
                _ => Err(ProtocolError::MissingArgument("id")),
            },
            "beat" => {
                let payload = payload.ok_or(ProtocolError::MissingArgument("beat"))?;
                payload
                    .trim()
                    .parse()
                    .map(Command::Beat)
                    .map_err(|_| ProtocolError::InvalidArgument("beat", payload.to_string()))
            }
            "get" => Ok(Command::Get(split_list(payload.unwrap_or_default()))),
            "got" => Ok(Command::Got(parse_readings(payload.unwrap_or_default()))),
            "add" => {
                let payload = payload.ok_or(ProtocolError::MissingArgument("add"))?;
                let (name, tags) = match payload.split_once(':') {
                    Some((name, tags)) => (name, split_list(tags)),
                    None => (payload, vec![]),
                };
                if name.is_empty() {
                    return Err(ProtocolError::InvalidArgument("add", payload.to_string()));
                }
                Ok(Command::Add {
                    name: name.to_string(),
                    tags,
                })
            }
            "remove" => match payload {
                Some(name) if !name.is_empty() => Ok(Command::Remove(name.to_string())),
                _ => Err(ProtocolError::MissingArgument("remove")),
            },
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }

    /// Encode as a wire line, including the trailing newline.
    pub fn to_line(&self) -> String {
        format!("{self}\n")
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Id(id) => write!(f, "id {id}"),
            Command::Ok => write!(f, "ok"),
            Command::Beat(secs) => write!(f, "beat {secs}"),
            Command::Ping => write!(f, "ping"),
            Command::Pong => write!(f, "pong"),
            Command::Get(names) => write!(f, "get {}", names.join(",")),
            Command::Got(readings) => {
                let joined = readings
                    .iter()
                    .map(|r| format!("{}:{}", r.key, r.value))
                    .collect::<Vec<_>>()
                    .join(",");
                write!(f, "got {joined}")
            }
            Command::Add { name, tags } if tags.is_empty() => write!(f, "add {name}"),
            Command::Add { name, tags } => write!(f, "add {name}:{}", tags.join(",")),
            Command::Remove(name) => write!(f, "remove {name}"),
            Command::Close => write!(f, "close"),
        }
    }
}

/// Format one reading the way a relay answers a `get`.
///
/// An empty sub-name means the reading is the metric itself.
pub fn format_reading(name: &str, sub: &str, value: f64) -> String {
    if sub.is_empty() {
        format!("{name}:{value:.4}")
    } else {
        format!("{name}-{sub}:{value:.4}")
    }
}

/// Whether `name` may be used as a collector name.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name != CONNECTED && !name.contains(METACHARACTERS)
}

fn split_list(payload: &str) -> Vec<String> {
    payload
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(String::from)
        .collect()
}

/// Decode the payload of a `got` line.
///
/// Entries without a `:` or with an empty key are dropped; the rest of the
/// line is still processed. Values that are not finite numbers become
/// [`UNPARSABLE`].
pub fn parse_readings(payload: &str) -> Vec<Reading> {
    payload
        .split(',')
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| {
            let Some((key, value)) = entry.split_once(':') else {
                trace!("dropping malformed reading '{entry}'");
                return None;
            };
            if key.is_empty() {
                trace!("dropping reading without a name '{entry}'");
                return None;
            }

            let name = key.split_once('-').map_or(key, |(name, _)| name);
            let value = match value.trim().parse::<f64>() {
                Ok(number) if number.is_finite() => value.trim().to_string(),
                _ => {
                    trace!("unparsable value in reading '{entry}'");
                    UNPARSABLE.to_string()
                }
            };

            Some(Reading {
                name: name.to_string(),
                key: key.to_string(),
                value,
            })
        })
        .collect()
}
