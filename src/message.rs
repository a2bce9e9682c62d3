//! Message Classifier
//!
//! Converts a raw pushed event into a typed message record: resolves the
//! bot's own id and the sender/origin/recipient display names through the
//! control client, detects at-mentions and pats, and rejects content types
//! the pipeline does not handle.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::control::{ControlClient, ControlError};

/// Origin marker distinguishing group chats from single chats
const GROUP_MARKER: &str = "@chatroom";

/// Four-per-em space terminating an at-mention in message bodies
const MENTION_DELIMITER: char = '\u{2005}';

/// A pat arrives as ordinary text in a fixed shape, not as its own
/// content-type code.
static PAT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^"?([^"]+?)"? patted (.+)$"#).expect("pat pattern"));

/// Error types for classification
#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("unsupported content type code {0}")]
    UnsupportedContentType(i64),

    #[error(transparent)]
    Control(#[from] ControlError),
}

/// Wire-level content classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Text,
    Pat,
    Image,
    Voice,
}

impl ContentKind {
    /// Map a wire content-type code
    ///
    /// Pat shares code 1 with text and is detected from the body instead.
    pub fn from_code(code: i64) -> Result<Self, ClassifyError> {
        match code {
            1 => Ok(ContentKind::Text),
            3 => Ok(ContentKind::Image),
            34 => Ok(ContentKind::Voice),
            other => Err(ClassifyError::UnsupportedContentType(other)),
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentKind::Text => write!(f, "text"),
            ContentKind::Pat => write!(f, "pat"),
            ContentKind::Image => write!(f, "image"),
            ContentKind::Voice => write!(f, "voice"),
        }
    }
}

/// One event as pushed by the injected agent
#[derive(Debug, Clone, Deserialize)]
pub struct RawEvent {
    #[serde(rename = "msgId")]
    pub message_id: i64,

    #[serde(default)]
    pub timestamp: i64,

    /// Group id for group messages, otherwise the peer's user id
    #[serde(rename = "fromGroup")]
    pub origin: String,

    #[serde(rename = "fromUser")]
    pub sender: String,

    /// Nonzero when the bot itself sent this message
    #[serde(rename = "isSendMsg", default)]
    pub self_sent: i64,

    #[serde(rename = "type")]
    pub content_type: i64,

    #[serde(default)]
    pub content: String,
}

impl RawEvent {
    pub fn is_self_sent(&self) -> bool {
        self.self_sent != 0
    }

    /// Single chats carry the peer id in both origin and sender
    pub fn is_single_origin(&self) -> bool {
        self.origin == self.sender
    }

    pub fn is_group_origin(&self) -> bool {
        self.origin.contains(GROUP_MARKER)
    }
}

/// Who a pat is aimed at, when the body is a pat at all
pub fn pat_target(content: &str) -> Option<&str> {
    PAT_PATTERN
        .captures(content)
        .and_then(|captures| captures.get(2))
        .map(|target| target.as_str())
}

fn contains_mention(content: &str, nickname: &str) -> bool {
    content.contains(&format!("@{}{}", nickname, MENTION_DELIMITER))
}

/// A fully classified message, constructed once per event and immutable
#[derive(Debug, Clone)]
pub struct ClassifiedMessage {
    pub message_id: i64,
    pub timestamp: i64,
    pub is_group: bool,
    pub is_self_sent: bool,

    pub sender_id: String,
    pub sender_nickname: String,

    /// Group id in group chats, sender id otherwise
    pub origin_id: String,
    pub origin_nickname: String,

    /// Group display name, resolved for group chats only
    pub group_nickname: Option<String>,

    /// The bot itself
    pub recipient_id: String,
    pub recipient_nickname: String,

    pub kind: ContentKind,
    pub content: String,

    /// Set when a group message at-mentions the bot
    pub is_mentioned: bool,
}

impl ClassifiedMessage {
    /// Classify one raw event
    ///
    /// Sender, origin, and recipient names are resolved as three separate
    /// round trips even when they coincide; nickname resolution runs before
    /// the content-type check. Unsupported content aborts the whole record,
    /// no partial message is produced.
    pub async fn classify(
        client: &ControlClient,
        raw: &RawEvent,
        is_group: bool,
    ) -> Result<Self, ClassifyError> {
        let recipient_id = client.self_identity().await?.user_id.clone();

        let group_nickname = if is_group {
            Some(client.resolve_nickname(&raw.origin, None).await?)
        } else {
            None
        };

        let member_group = if is_group {
            Some(raw.origin.as_str())
        } else {
            None
        };
        let sender_nickname = client.resolve_nickname(&raw.sender, member_group).await?;
        let origin_nickname = client.resolve_nickname(&raw.origin, member_group).await?;
        let recipient_nickname = client.resolve_nickname(&recipient_id, member_group).await?;

        let is_mentioned = is_group && contains_mention(&raw.content, &recipient_nickname);

        let kind = match ContentKind::from_code(raw.content_type)? {
            ContentKind::Text if pat_target(&raw.content).is_some() => ContentKind::Pat,
            ContentKind::Text => ContentKind::Text,
            ContentKind::Image | ContentKind::Voice => {
                return Err(ClassifyError::UnsupportedContentType(raw.content_type))
            }
            ContentKind::Pat => unreachable!("from_code never produces ContentKind::Pat"),
        };

        debug!(
            "classified message: msg_id={}, kind={}, group={}, sender={}, mentioned={}",
            raw.message_id, kind, is_group, sender_nickname, is_mentioned
        );

        Ok(Self {
            message_id: raw.message_id,
            timestamp: raw.timestamp,
            is_group,
            is_self_sent: raw.is_self_sent(),
            sender_id: raw.sender.clone(),
            sender_nickname,
            origin_id: raw.origin.clone(),
            origin_nickname,
            group_nickname,
            recipient_id,
            recipient_nickname,
            kind,
            content: raw.content.clone(),
            is_mentioned,
        })
    }
}
