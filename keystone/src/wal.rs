//! Write-ahead log records and their ASCII line format.
//!
//! One record per `'\n'`-terminated line. `Display` and `FromStr` are
//! exact inverses; recovery refuses any line that does not round-trip.

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use crate::error::KeystoneError;

/// The three data mutations an edit record can describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Insert => write!(f, "INSERT"),
            Action::Update => write!(f, "UPDATE"),
            Action::Delete => write!(f, "DELETE"),
        }
    }
}

impl FromStr for Action {
    type Err = KeystoneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INSERT" => Ok(Action::Insert),
            "UPDATE" => Ok(Action::Update),
            "DELETE" => Ok(Action::Delete),
            other => Err(KeystoneError::BadLogLine(format!("unknown action {other}"))),
        }
    }
}

/// One record of the write-ahead log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// A table was created.
    Table { table_type: String, name: String },
    /// A data mutation, with enough state to invert it.
    Edit {
        client: Uuid,
        table: String,
        action: Action,
        key: i64,
        old_value: i64,
        new_value: i64,
    },
    /// A transaction began.
    Start { client: Uuid },
    /// A transaction committed.
    Commit { client: Uuid },
    /// Ids of the transactions still active at checkpoint time.
    Checkpoint { clients: Vec<Uuid> },
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogRecord::Table { table_type, name } => {
                write!(f, "< create {table_type} table {name} >")
            }
            LogRecord::Edit {
                client,
                table,
                action,
                key,
                old_value,
                new_value,
            } => write!(
                f,
                "< {client}, edit, {table}, {action}, key={key}, oldval={old_value}, newval={new_value} >"
            ),
            LogRecord::Start { client } => write!(f, "< {client} start >"),
            LogRecord::Commit { client } => write!(f, "< {client} commit >"),
            LogRecord::Checkpoint { clients } => {
                let ids = clients
                    .iter()
                    .map(|c| c.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "< checkpoint [{ids}] >")
            }
        }
    }
}

impl FromStr for LogRecord {
    type Err = KeystoneError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let bad = || KeystoneError::BadLogLine(line.to_string());
        let body = line
            .trim()
            .strip_prefix('<')
            .and_then(|s| s.strip_suffix('>'))
            .ok_or_else(bad)?
            .trim();

        if let Some(rest) = body.strip_prefix("create ") {
            let mut tokens = rest.split_whitespace();
            let table_type = tokens.next().ok_or_else(bad)?;
            if tokens.next() != Some("table") {
                return Err(bad());
            }
            let name = tokens.next().ok_or_else(bad)?;
            if tokens.next().is_some() {
                return Err(bad());
            }
            return Ok(LogRecord::Table {
                table_type: table_type.to_string(),
                name: name.to_string(),
            });
        }

        if let Some(rest) = body.strip_prefix("checkpoint ") {
            let inner = rest
                .trim()
                .strip_prefix('[')
                .and_then(|s| s.strip_suffix(']'))
                .ok_or_else(bad)?;
            let mut clients = Vec::new();
            for token in inner.split(',') {
                let token = token.trim();
                if token.is_empty() {
                    continue;
                }
                clients.push(Uuid::parse_str(token).map_err(|_| bad())?);
            }
            return Ok(LogRecord::Checkpoint { clients });
        }

        if body.contains(", edit, ") {
            let fields: Vec<&str> = body.split(", ").collect();
            if fields.len() != 7 || fields[1] != "edit" {
                return Err(bad());
            }
            let client = Uuid::parse_str(fields[0]).map_err(|_| bad())?;
            let table = fields[2].to_string();
            let action: Action = fields[3].parse()?;
            let key = parse_field(fields[4], "key=").ok_or_else(bad)?;
            let old_value = parse_field(fields[5], "oldval=").ok_or_else(bad)?;
            let new_value = parse_field(fields[6], "newval=").ok_or_else(bad)?;
            return Ok(LogRecord::Edit {
                client,
                table,
                action,
                key,
                old_value,
                new_value,
            });
        }

        let mut tokens = body.split_whitespace();
        let id = tokens.next().ok_or_else(bad)?;
        let verb = tokens.next().ok_or_else(bad)?;
        if tokens.next().is_some() {
            return Err(bad());
        }
        let client = Uuid::parse_str(id).map_err(|_| bad())?;
        match verb {
            "start" => Ok(LogRecord::Start { client }),
            "commit" => Ok(LogRecord::Commit { client }),
            _ => Err(bad()),
        }
    }
}

fn parse_field(token: &str, prefix: &str) -> Option<i64> {
    token.strip_prefix(prefix)?.parse().ok()
}
