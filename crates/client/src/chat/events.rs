use tokio::sync::mpsc;

use crate::chat::message::{ClientMessageId, Message};
use crate::upload::{Attachment, AttachmentId};

/// How the reply to a submission is being delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryPath {
    Streaming,
    Polling,
}

/// Notification emitted by the session after every observable change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    MessageAppended(Message),
    /// The open AI message grew or received its server id.
    MessageUpdated(Message),
    /// A partially streamed message was replaced by the resolved copy.
    MessageReplaced {
        previous: ClientMessageId,
        message: Message,
    },
    /// The log was replaced by server history.
    HistoryLoaded(Vec<Message>),
    Loading(bool),
    /// The agent is composing; drives the loading indicator only.
    Composing(bool),
    /// Intermediate agent activity. Never stored in the log.
    Action(String),
    DeliveryPath(DeliveryPath),
    ChannelDegraded {
        reason: String,
    },
    PollFailed {
        error: String,
        consecutive_failures: u32,
    },
    SubmissionFailed {
        error: String,
    },
    AttachmentChanged(Attachment),
    AttachmentRemoved(AttachmentId),
}

/// Receiving side of a session's update feed.
pub struct SessionUpdates {
    events: mpsc::UnboundedReceiver<SessionUpdate>,
}

impl SessionUpdates {
    pub async fn recv(&mut self) -> Option<SessionUpdate> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SessionUpdate> {
        self.events.try_recv().ok()
    }

    /// Collects everything already queued without waiting.
    pub fn drain(&mut self) -> Vec<SessionUpdate> {
        let mut updates = Vec::new();
        while let Some(update) = self.try_recv() {
            updates.push(update);
        }
        updates
    }
}

pub(crate) fn make_update_stream() -> (mpsc::UnboundedSender<SessionUpdate>, SessionUpdates) {
    let (update_tx, update_rx) = mpsc::unbounded_channel();
    (update_tx, SessionUpdates { events: update_rx })
}
