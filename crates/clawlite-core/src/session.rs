use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ClawLiteError, Result};

/// Canonical session identifier: `<channel>:<chat>[:<thread>]`.
///
/// Channel-originated sessions use the channel name as the first segment
/// (`telegram:42`, `telegram:42:7` for a topic thread); local surfaces use
/// `cli:<id>` and `ws:<id>`; the heartbeat runs as `heartbeat:system`;
/// subagents run as `sub:<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Parse and validate a raw session id string.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let (channel, rest) = raw
            .split_once(':')
            .ok_or_else(|| ClawLiteError::Session(format!("malformed session id: {raw}")))?;
        if channel.is_empty() || rest.is_empty() {
            return Err(ClawLiteError::Session(format!(
                "malformed session id: {raw}"
            )));
        }
        Ok(Self(raw.to_string()))
    }

    /// Build a session id from channel-originated coordinates.
    pub fn for_channel(channel: &str, chat: &str, thread: Option<&str>) -> Self {
        match thread {
            Some(t) if !t.is_empty() => Self(format!("{channel}:{chat}:{t}")),
            _ => Self(format!("{channel}:{chat}")),
        }
    }

    /// The channel segment (everything before the first colon).
    pub fn channel(&self) -> &str {
        self.0.split(':').next().unwrap_or("")
    }

    /// The chat segment (second colon-separated field), if present.
    pub fn chat(&self) -> Option<&str> {
        self.0.splitn(3, ':').nth(1)
    }

    /// The thread segment (third colon-separated field), if present.
    pub fn thread(&self) -> Option<&str> {
        self.0.splitn(3, ':').nth(2)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filename-safe form used for the per-session JSONL log.
    pub fn file_stem(&self) -> String {
        self.0
            .chars()
            .map(|c| {
                if c.is_alphanumeric() || matches!(c, '-' | '_' | ':' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_channel_qualified_ids() {
        assert!(SessionId::parse("telegram:42").is_ok());
        assert!(SessionId::parse("telegram:42:7").is_ok());
        assert!(SessionId::parse("cli:demo").is_ok());
    }

    #[test]
    fn parse_rejects_malformed_ids() {
        assert!(SessionId::parse("no-colon").is_err());
        assert!(SessionId::parse(":42").is_err());
        assert!(SessionId::parse("telegram:").is_err());
    }

    #[test]
    fn segments() {
        let id = SessionId::for_channel("telegram", "42", Some("7"));
        assert_eq!(id.as_str(), "telegram:42:7");
        assert_eq!(id.channel(), "telegram");
        assert_eq!(id.chat(), Some("42"));
        assert_eq!(id.thread(), Some("7"));

        let flat = SessionId::for_channel("telegram", "42", None);
        assert_eq!(flat.thread(), None);
    }

    #[test]
    fn file_stem_sanitizes() {
        let id = SessionId::parse("ws:a/b c").unwrap();
        assert_eq!(id.file_stem(), "ws:a_b_c");
    }
}
