//! Dispatch Router
//!
//! Applies policy to classified messages and hands the survivors to the
//! external conversation engine: replayed events are deduplicated inside a
//! bounded window, self-sent events are dropped, single chats are gated by
//! the sender whitelist, and group pats only pass when aimed at the bot.
//! Replies travel back through the control client.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::control::{ControlClient, ControlError};
use crate::message::{pat_target, ClassifiedMessage, ClassifyError, ContentKind, RawEvent};

/// Recently-seen message ids kept for replay suppression
const SEEN_WINDOW: usize = 1024;

/// Unit of work handed to the conversation engine
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub kind: ContentKind,
    pub content: String,
    pub is_group: bool,
    pub message: ClassifiedMessage,
}

/// Sink consuming composed work items; the core's sole egress besides
/// direct replies
#[async_trait]
pub trait WorkSink: Send + Sync {
    async fn produce(&self, item: WorkItem);
}

/// Sink that only logs, for running the bridge without an engine attached
pub struct LoggingSink;

#[async_trait]
impl WorkSink for LoggingSink {
    async fn produce(&self, item: WorkItem) {
        info!(
            "work item: kind={}, group={}, sender={}, content={}",
            item.kind, item.is_group, item.message.sender_nickname, item.content
        );
    }
}

/// A reply routed back to the originating chat
#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    Image(PathBuf),
    File(PathBuf),
}

/// Insertion-ordered set bounded by capacity; oldest ids age out first
struct SeenWindow {
    order: VecDeque<i64>,
    seen: HashSet<i64>,
    capacity: usize,
}

impl SeenWindow {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Record an id, returning false when it was already inside the window
    fn insert(&mut self, id: i64) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

/// Routes classified messages to the work sink per dispatch policy
pub struct Dispatcher {
    client: Arc<ControlClient>,
    whitelist: HashSet<String>,
    sink: Arc<dyn WorkSink>,
    seen: Mutex<SeenWindow>,
}

impl Dispatcher {
    pub fn new(
        client: Arc<ControlClient>,
        whitelist: impl IntoIterator<Item = String>,
        sink: Arc<dyn WorkSink>,
    ) -> Self {
        Self {
            client,
            whitelist: whitelist.into_iter().collect(),
            sink,
            seen: Mutex::new(SeenWindow::new(SEEN_WINDOW)),
        }
    }

    /// Route one raw event
    ///
    /// Unsupported content types are skipped quietly; control failures
    /// during classification propagate to the caller.
    pub async fn dispatch(&self, raw: RawEvent) -> Result<(), ClassifyError> {
        if !self.seen.lock().insert(raw.message_id) {
            debug!("dropping replayed event: msg_id={}", raw.message_id);
            return Ok(());
        }
        if raw.is_self_sent() {
            debug!("ignoring self-sent event: msg_id={}", raw.message_id);
            return Ok(());
        }

        if raw.is_single_origin() {
            self.dispatch_single(&raw).await
        } else if raw.is_group_origin() {
            self.dispatch_group(&raw).await
        } else {
            debug!(
                "ignoring event from unrecognized origin: msg_id={}, origin={}",
                raw.message_id, raw.origin
            );
            Ok(())
        }
    }

    async fn dispatch_single(&self, raw: &RawEvent) -> Result<(), ClassifyError> {
        let Some(message) = self.classify(raw, false).await? else {
            return Ok(());
        };

        if !self.whitelist.contains(&message.sender_nickname) {
            debug!(
                "sender not whitelisted: msg_id={}, sender={}",
                message.message_id, message.sender_nickname
            );
            return Ok(());
        }
        // An echoed copy of the bot's own send carries the bot as sender
        if message.sender_id == message.recipient_id {
            debug!("ignoring echoed send: msg_id={}", message.message_id);
            return Ok(());
        }

        self.produce(message).await;
        Ok(())
    }

    async fn dispatch_group(&self, raw: &RawEvent) -> Result<(), ClassifyError> {
        let Some(message) = self.classify(raw, true).await? else {
            return Ok(());
        };

        if message.kind == ContentKind::Pat
            && pat_target(&message.content) != Some(message.recipient_nickname.as_str())
        {
            debug!(
                "ignoring pat aimed at someone else: msg_id={}",
                message.message_id
            );
            return Ok(());
        }

        self.produce(message).await;
        Ok(())
    }

    async fn classify(
        &self,
        raw: &RawEvent,
        is_group: bool,
    ) -> Result<Option<ClassifiedMessage>, ClassifyError> {
        match ClassifiedMessage::classify(&self.client, raw, is_group).await {
            Ok(message) => Ok(Some(message)),
            Err(ClassifyError::UnsupportedContentType(code)) => {
                debug!(
                    "skipping unsupported content: msg_id={}, code={}",
                    raw.message_id, code
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn produce(&self, message: ClassifiedMessage) {
        let item = WorkItem {
            kind: message.kind,
            content: message.content.clone(),
            is_group: message.is_group,
            message,
        };
        self.sink.produce(item).await;
    }

    /// Send a reply back to the chat a message originated from
    ///
    /// A group text reply to a message that at-mentioned the bot mentions
    /// the original sender in turn. Send failures were already downgraded
    /// to sentinels at the client layer; only control-channel failures
    /// surface here.
    pub async fn send_reply(
        &self,
        reply: Reply,
        destination: &ClassifiedMessage,
    ) -> Result<(), ControlError> {
        match reply {
            Reply::Text(text) => {
                if destination.is_group && destination.is_mentioned {
                    self.client
                        .send_mention(
                            &text,
                            &destination.origin_id,
                            &[destination.sender_id.as_str()],
                        )
                        .await?;
                } else {
                    self.client.send_text(&text, &destination.origin_id).await?;
                }
            }
            Reply::Image(path) => {
                self.client.send_image(&path, &destination.origin_id).await?;
            }
            Reply::File(path) => {
                self.client.send_file(&path, &destination.origin_id).await?;
            }
        }
        Ok(())
    }
}
