use crate::realtime::codec::{ChatMessage, RealtimeEvent};
use std::fmt;
use std::str::FromStr;

/// Remainder of `content` after `prefix`, if it starts with it
///
/// Plain prefix match: `"!ping"` also matches `"!pingback"`.
pub fn match_prefix<'a>(content: &'a str, prefix: &str) -> Option<&'a str> {
    content.strip_prefix(prefix)
}

/// Whitespace-separated arguments of a command remainder
pub fn tokenize(remainder: &str) -> Vec<Arg> {
    remainder.split_whitespace().map(Arg::from).collect()
}

/// One command argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arg(String);

impl Arg {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn parse<T: FromStr>(&self) -> Option<T> {
        self.0.parse().ok()
    }

    /// Mention of the form `@name`, without the sigil
    pub fn mention(&self) -> Option<&str> {
        self.0.strip_prefix('@').filter(|name| !name.is_empty())
    }
}

impl From<&str> for Arg {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A chat message that matched a command prefix
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub ndc_id: i64,
    pub message: ChatMessage,
    pub content: String,
}

impl CommandContext {
    /// Context for `event` when its chat message content starts with `prefix`
    pub fn matching(event: &RealtimeEvent, prefix: &str) -> Option<Self> {
        let message = event.chat_message()?;
        let content = message.content.clone().filter(|c| !c.is_empty())?;
        match_prefix(&content, prefix)?;

        Some(Self {
            ndc_id: event.ndc_id(),
            message,
            content,
        })
    }

    pub fn thread_id(&self) -> Option<&str> {
        self.message.thread_id.as_deref()
    }

    pub fn args(&self, prefix: &str) -> Vec<Arg> {
        match_prefix(&self.content, prefix)
            .map(tokenize)
            .unwrap_or_default()
    }
}
