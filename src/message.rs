use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// Opaque identifier of a channel, user or message on some platform.
/// Discord and Telegram use integers, IRC uses names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PlatformId {
    Int(i64),
    Str(String),
}

impl PlatformId {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            PlatformId::Int(id) => Some(*id),
            PlatformId::Str(_) => None,
        }
    }
}

impl fmt::Display for PlatformId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformId::Int(id) => write!(f, "{}", id),
            PlatformId::Str(name) => write!(f, "{}", name),
        }
    }
}

impl From<i64> for PlatformId {
    fn from(id: i64) -> Self {
        PlatformId::Int(id)
    }
}

impl From<i32> for PlatformId {
    fn from(id: i32) -> Self {
        PlatformId::Int(i64::from(id))
    }
}

impl From<String> for PlatformId {
    fn from(raw: String) -> Self {
        PlatformId::from(raw.as_str())
    }
}

impl From<&str> for PlatformId {
    /// Numeric strings become `Int`, anything else stays a string.
    fn from(raw: &str) -> Self {
        match raw.parse::<i64>() {
            Ok(id) => PlatformId::Int(id),
            Err(_) => PlatformId::Str(raw.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    #[error("endpoint '{0}' must look like platform:channel")]
    MissingSeparator(String),
    #[error("endpoint '{0}' has an empty platform tag")]
    EmptyPlatform(String),
    #[error("endpoint '{0}' has an empty channel id")]
    EmptyChannel(String),
    #[error("platform tag '{0}' may only contain letters, digits, '-', '_' and '.'")]
    InvalidPlatform(String),
}

/// One addressable chat location: a (platform, channel) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub platform: String,
    pub channel: PlatformId,
}

impl Endpoint {
    pub fn new(platform: impl Into<String>, channel: impl Into<PlatformId>) -> Self {
        Self {
            platform: platform.into(),
            channel: channel.into(),
        }
    }

    /// Build an endpoint from an already-split platform tag and raw channel id,
    /// validating both.
    pub fn parse(platform: &str, channel: &str) -> Result<Self, EndpointError> {
        let endpoint = Self::new(platform.trim(), channel.trim());
        endpoint.validate()?;
        Ok(endpoint)
    }

    /// Check the platform tag and channel id are usable as a graph node.
    pub fn validate(&self) -> Result<(), EndpointError> {
        if self.platform.is_empty() {
            return Err(EndpointError::EmptyPlatform(self.to_string()));
        }
        if matches!(&self.channel, PlatformId::Str(name) if name.trim().is_empty()) {
            return Err(EndpointError::EmptyChannel(self.to_string()));
        }
        if !self
            .platform
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(EndpointError::InvalidPlatform(self.platform.clone()));
        }
        Ok(())
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (platform, channel) = s
            .split_once(':')
            .ok_or_else(|| EndpointError::MissingSeparator(s.to_string()))?;
        Self::parse(platform, channel)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.platform, self.channel)
    }
}

/// Author identity on the origin platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorInfo {
    pub name: String,
    pub id: PlatformId,
    #[serde(default)]
    pub avatar_url: Option<String>,
    /// Bots and other low-priority authors pay double rate-limit cost.
    #[serde(default)]
    pub deprioritize: bool,
}

impl AuthorInfo {
    pub fn new(name: impl Into<String>, id: impl Into<PlatformId>) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            avatar_url: None,
            deprioritize: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MentionKind {
    #[serde(rename = "user_mention")]
    User,
    #[serde(rename = "channel_mention")]
    Channel,
    /// A kind this build does not know how to render.
    #[serde(other)]
    Unknown,
}

/// One run of a message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Segment {
    Text {
        text: String,
    },
    Mention {
        kind: MentionKind,
        name: String,
        id: PlatformId,
    },
}

impl Segment {
    pub fn text(text: impl Into<String>) -> Self {
        Segment::Text { text: text.into() }
    }

    pub fn mention(kind: MentionKind, name: impl Into<String>, id: impl Into<PlatformId>) -> Self {
        Segment::Mention {
            kind,
            name: name.into(),
            id: id.into(),
        }
    }
}

/// The message being replied to, if any.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Reply {
    #[default]
    None,
    /// The message was a reply but the original could not be located.
    Unresolved,
    Resolved {
        author: AuthorInfo,
        body: Vec<Segment>,
    },
}

/// Opaque pass-through; the bus never fetches attachment content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub url: String,
}

/// Platform-agnostic envelope carried through the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub author: AuthorInfo,
    pub body: Vec<Segment>,
    pub source: Endpoint,
    /// Platform-native id of the message on its source platform.
    pub id: PlatformId,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// IRC-style "/me" emote.
    #[serde(default)]
    pub action: bool,
    #[serde(default)]
    pub reply: Reply,
}

impl Message {
    pub fn new(
        author: AuthorInfo,
        body: Vec<Segment>,
        source: Endpoint,
        id: impl Into<PlatformId>,
    ) -> Self {
        Self {
            author,
            body,
            source,
            id: id.into(),
            attachments: Vec::new(),
            action: false,
            reply: Reply::None,
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_action(mut self, action: bool) -> Self {
        self.action = action;
        self
    }

    pub fn with_reply(mut self, reply: Reply) -> Self {
        self.reply = reply;
        self
    }

    /// Cost this message charges against its source's rate bucket
    pub fn rate_cost(&self) -> f64 {
        if self.author.deprioritize {
            2.0
        } else {
            1.0
        }
    }
}

/// Render a body as plain text for platforms without rich mentions.
/// Segments of an unrecognized kind are logged and skipped.
pub fn render_plain(body: &[Segment]) -> String {
    let mut out = String::new();
    for segment in body {
        match segment {
            Segment::Text { text } => out.push_str(text),
            Segment::Mention {
                kind: MentionKind::User,
                name,
                ..
            } => {
                out.push('@');
                out.push_str(name);
            }
            Segment::Mention {
                kind: MentionKind::Channel,
                name,
                ..
            } => {
                out.push('#');
                out.push_str(name);
            }
            Segment::Mention {
                kind: MentionKind::Unknown,
                name,
                id,
            } => {
                warn!("Unrecognized mention segment for {} ({})", name, id);
            }
        }
    }
    out
}
