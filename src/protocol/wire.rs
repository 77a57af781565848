//! Worker wire protocol: slash commands followed by a JSON body.
//!
//! ```text
//! /claim    {"execution_id", "bot_id", "claimed_at"?}
//! /status   {"execution_id", "bot_id", "message"?}
//! /complete {"execution_id", "bot_id", "status", "results"?, "error_message"?, "completed_at"?}
//! /failed   {"execution_id", "bot_id", "status", "results"?, "error_message"?, "completed_at"?}
//! /checkin  {"bot_id", "timestamp"?}
//! ```
//!
//! `/complete` and `/failed` share one body, and its `status` (`completed` or
//! `failed`) picks the outcome, whichever word the worker used.
//!
//! Inbound text is untrusted. It is parsed once into a [`WireCommand`] and
//! anything that does not fit is a [`ProtocolError`].

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::error::ProtocolError;

/// Command word, optional `@botname` suffix, then the body.
static COMMAND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^/(claim|status|complete|failed|checkin)(?:@\w+)?(?:\s+(.*))?$")
        .expect("command regex is valid")
});

const DEFAULT_STATUS_MESSAGE: &str = "Working...";
const DEFAULT_ERROR_MESSAGE: &str = "Unknown error";

/// A parsed worker command.
#[derive(Debug, Clone, PartialEq)]
pub enum WireCommand {
    Claim {
        execution_id: Uuid,
        bot_id: Uuid,
        claimed_at: Option<DateTime<Utc>>,
    },
    Status {
        execution_id: Uuid,
        bot_id: Uuid,
        message: String,
    },
    Complete {
        execution_id: Uuid,
        bot_id: Uuid,
        results: serde_json::Value,
        completed_at: Option<DateTime<Utc>>,
    },
    Failed {
        execution_id: Uuid,
        bot_id: Uuid,
        error_message: String,
        completed_at: Option<DateTime<Utc>>,
    },
    Checkin {
        bot_id: Uuid,
        timestamp: Option<DateTime<Utc>>,
    },
}

#[derive(Deserialize)]
struct ClaimBody {
    execution_id: Uuid,
    bot_id: Uuid,
    #[serde(default)]
    claimed_at: Option<String>,
}

#[derive(Deserialize)]
struct StatusBody {
    execution_id: Uuid,
    bot_id: Uuid,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct ResultBody {
    execution_id: Uuid,
    bot_id: Uuid,
    status: String,
    #[serde(default)]
    results: Option<serde_json::Value>,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    completed_at: Option<String>,
}

#[derive(Deserialize)]
struct CheckinBody {
    bot_id: Uuid,
    #[serde(default)]
    timestamp: Option<String>,
}

impl WireCommand {
    /// Parse one inbound message.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let text = text.trim();
        let caps = COMMAND_RE
            .captures(text)
            .ok_or_else(|| ProtocolError::UnknownCommand(first_word(text).to_string()))?;

        let command = caps.get(1).map_or("", |m| m.as_str());
        let body = caps.get(2).map_or("", |m| m.as_str().trim());

        match command {
            "claim" => {
                let b: ClaimBody = decode(command, body)?;
                Ok(Self::Claim {
                    execution_id: b.execution_id,
                    bot_id: b.bot_id,
                    claimed_at: parse_optional_timestamp(command, "claimed_at", b.claimed_at)?,
                })
            }
            "status" => {
                let b: StatusBody = decode(command, body)?;
                Ok(Self::Status {
                    execution_id: b.execution_id,
                    bot_id: b.bot_id,
                    message: b.message.unwrap_or_else(|| DEFAULT_STATUS_MESSAGE.to_string()),
                })
            }
            "complete" | "failed" => {
                let b: ResultBody = decode(command, body)?;
                let completed_at = parse_optional_timestamp(command, "completed_at", b.completed_at)?;
                match b.status.as_str() {
                    "completed" => Ok(Self::Complete {
                        execution_id: b.execution_id,
                        bot_id: b.bot_id,
                        results: b
                            .results
                            .filter(|r| !r.is_null())
                            .unwrap_or_else(|| serde_json::json!({})),
                        completed_at,
                    }),
                    "failed" => Ok(Self::Failed {
                        execution_id: b.execution_id,
                        bot_id: b.bot_id,
                        error_message: b
                            .error_message
                            .unwrap_or_else(|| DEFAULT_ERROR_MESSAGE.to_string()),
                        completed_at,
                    }),
                    other => Err(ProtocolError::InvalidStatus {
                        command: command.to_string(),
                        status: other.to_string(),
                    }),
                }
            }
            "checkin" => {
                let b: CheckinBody = decode(command, body)?;
                Ok(Self::Checkin {
                    bot_id: b.bot_id,
                    timestamp: parse_optional_timestamp(command, "timestamp", b.timestamp)?,
                })
            }
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }

    /// Command word without the slash.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Claim { .. } => "claim",
            Self::Status { .. } => "status",
            Self::Complete { .. } => "complete",
            Self::Failed { .. } => "failed",
            Self::Checkin { .. } => "checkin",
        }
    }

    /// The bot that sent the command.
    pub fn bot_id(&self) -> Uuid {
        match self {
            Self::Claim { bot_id, .. }
            | Self::Status { bot_id, .. }
            | Self::Complete { bot_id, .. }
            | Self::Failed { bot_id, .. }
            | Self::Checkin { bot_id, .. } => *bot_id,
        }
    }
}

fn first_word(text: &str) -> &str {
    text.split_whitespace().next().unwrap_or("")
}

fn decode<T: DeserializeOwned>(command: &str, body: &str) -> Result<T, ProtocolError> {
    if body.is_empty() {
        return Err(ProtocolError::MalformedPayload {
            command: command.to_string(),
            reason: "missing JSON body".to_string(),
        });
    }
    serde_json::from_str(body).map_err(|e| ProtocolError::MalformedPayload {
        command: command.to_string(),
        reason: e.to_string(),
    })
}

fn parse_optional_timestamp(
    command: &str,
    field: &str,
    raw: Option<String>,
) -> Result<Option<DateTime<Utc>>, ProtocolError> {
    match raw {
        None => Ok(None),
        Some(s) => parse_timestamp(&s)
            .map(Some)
            .ok_or_else(|| ProtocolError::MalformedPayload {
                command: command.to_string(),
                reason: format!("{field} is not an ISO-8601 timestamp: {s}"),
            }),
    }
}

/// Parse an ISO-8601 timestamp. Values without an offset are taken as UTC.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|ndt| ndt.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXEC: &str = "6f1c2a8e-8d4b-4f0e-9a61-0b7e5c3d2a10";
    const BOT: &str = "0d9e8f7a-1b2c-4d3e-8f4a-5b6c7d8e9f01";

    #[test]
    fn parses_claim() {
        let text = format!(
            r#"/claim {{"execution_id": "{EXEC}", "bot_id": "{BOT}", "claimed_at": "2026-03-01T10:00:00Z"}}"#
        );
        let cmd = WireCommand::parse(&text).unwrap();
        assert_eq!(
            cmd,
            WireCommand::Claim {
                execution_id: EXEC.parse().unwrap(),
                bot_id: BOT.parse().unwrap(),
                claimed_at: parse_timestamp("2026-03-01T10:00:00Z"),
            }
        );
        assert_eq!(cmd.name(), "claim");
    }

    #[test]
    fn claim_time_is_optional() {
        let text = format!(r#"/claim {{"execution_id": "{EXEC}", "bot_id": "{BOT}"}}"#);
        assert!(matches!(
            WireCommand::parse(&text).unwrap(),
            WireCommand::Claim { claimed_at: None, .. }
        ));
    }

    #[test]
    fn accepts_bot_mention_suffix() {
        let text = format!(r#"/checkin@UrzaBot {{"bot_id": "{BOT}"}}"#);
        let cmd = WireCommand::parse(&text).unwrap();
        assert_eq!(cmd.bot_id(), BOT.parse::<Uuid>().unwrap());
    }

    #[test]
    fn multiline_body() {
        let text = format!("/status\n{{\n  \"execution_id\": \"{EXEC}\",\n  \"bot_id\": \"{BOT}\"\n}}");
        assert!(matches!(
            WireCommand::parse(&text).unwrap(),
            WireCommand::Status { ref message, .. } if message == "Working..."
        ));
    }

    #[test]
    fn complete_defaults_results() {
        let text = format!(
            r#"/complete {{"execution_id": "{EXEC}", "bot_id": "{BOT}", "status": "completed"}}"#
        );
        assert!(matches!(
            WireCommand::parse(&text).unwrap(),
            WireCommand::Complete { ref results, completed_at: None, .. } if *results == serde_json::json!({})
        ));
    }

    #[test]
    fn failed_defaults_error_message() {
        let text = format!(
            r#"/failed {{"execution_id": "{EXEC}", "bot_id": "{BOT}", "status": "failed"}}"#
        );
        assert!(matches!(
            WireCommand::parse(&text).unwrap(),
            WireCommand::Failed { ref error_message, .. } if error_message == "Unknown error"
        ));
    }

    #[test]
    fn status_field_picks_outcome() {
        let text = format!(
            r#"/complete {{"execution_id": "{EXEC}", "bot_id": "{BOT}", "status": "failed", "error_message": "x"}}"#
        );
        let cmd = WireCommand::parse(&text).unwrap();
        assert!(matches!(cmd, WireCommand::Failed { ref error_message, .. } if error_message == "x"));
        assert_eq!(cmd.name(), "failed");

        let text = format!(
            r#"/failed {{"execution_id": "{EXEC}", "bot_id": "{BOT}", "status": "completed", "results": {{"ok": true}}}}"#
        );
        assert!(matches!(
            WireCommand::parse(&text).unwrap(),
            WireCommand::Complete { ref results, .. } if *results == serde_json::json!({"ok": true})
        ));
    }

    #[test]
    fn unknown_result_status_is_invalid() {
        for command in ["complete", "failed"] {
            let text = format!(
                r#"/{command} {{"execution_id": "{EXEC}", "bot_id": "{BOT}", "status": "cancelled"}}"#
            );
            assert!(
                matches!(WireCommand::parse(&text), Err(ProtocolError::InvalidStatus { .. })),
                "expected invalid status for /{command}"
            );
        }
    }

    #[test]
    fn result_requires_status() {
        let text = format!(r#"/complete {{"execution_id": "{EXEC}", "bot_id": "{BOT}"}}"#);
        assert!(matches!(
            WireCommand::parse(&text),
            Err(ProtocolError::MalformedPayload { .. })
        ));
    }

    #[test]
    fn malformed_payloads() {
        let bad_id = format!(r#"/claim {{"execution_id": "nope", "bot_id": "{BOT}"}}"#);
        let bad_time = format!(
            r#"/claim {{"execution_id": "{EXEC}", "bot_id": "{BOT}", "claimed_at": "yesterday"}}"#
        );
        for text in [
            "/claim {not valid json",
            "/claim",
            "/claim []",
            r#"/claim {"bot_id": "abc"}"#,
            bad_id.as_str(),
            bad_time.as_str(),
            "/checkin {}",
        ] {
            assert!(
                matches!(WireCommand::parse(text), Err(ProtocolError::MalformedPayload { .. })),
                "expected malformed: {text}"
            );
        }
    }

    #[test]
    fn non_commands_are_unknown() {
        for text in ["hello there", "/claimx {}", "/start", "", "🎯 *New Task Available*"] {
            assert!(
                matches!(WireCommand::parse(text), Err(ProtocolError::UnknownCommand(_))),
                "expected unknown: {text}"
            );
        }
    }

    #[test]
    fn timestamp_forms() {
        let z = parse_timestamp("2026-03-01T10:00:00Z").unwrap();
        assert_eq!(parse_timestamp("2026-03-01T10:00:00+00:00"), Some(z));
        assert_eq!(parse_timestamp("2026-03-01T10:00:00"), Some(z));
        assert_eq!(parse_timestamp("2026-03-01T12:00:00+02:00"), Some(z));
        assert!(parse_timestamp("2026-03-01T10:00:00.250").is_some());
        assert!(parse_timestamp("soon").is_none());
    }
}
