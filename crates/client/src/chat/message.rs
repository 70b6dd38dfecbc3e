use std::fmt;

use chatwire_api::{MessageFile, RemoteMessage, Role};
use uuid::Uuid;

/// Locally generated message identifier, stable for the lifetime of the message in the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientMessageId(pub Uuid);

impl ClientMessageId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ClientMessageId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// One chat message as the client sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub client_id: ClientMessageId,
    /// Durable server identifier, filled in once the server assigns one.
    pub server_id: Option<u64>,
    pub role: Role,
    pub text: String,
    pub files: Vec<MessageFile>,
}

impl Message {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            client_id: ClientMessageId::generate(),
            server_id: None,
            role,
            text: text.into(),
            files: Vec::new(),
        }
    }

    /// Optimistic local echo of a user submission.
    pub fn human(text: impl Into<String>, files: Vec<MessageFile>) -> Self {
        Self {
            files,
            ..Self::new(Role::Human, text)
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }

    pub fn from_remote(remote: RemoteMessage) -> Self {
        Self {
            client_id: ClientMessageId::generate(),
            server_id: remote.id,
            role: remote.role,
            text: remote.text,
            files: remote.files,
        }
    }
}

/// Result of applying one streamed fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentOutcome {
    /// The fragment extended the already open AI message.
    Appended(ClientMessageId),
    /// No AI message was open, so a new one was created from the fragment.
    Opened(ClientMessageId),
}

impl FragmentOutcome {
    pub fn message_id(self) -> ClientMessageId {
        match self {
            Self::Appended(id) | Self::Opened(id) => id,
        }
    }
}

/// Ordered message log for one conversation.
///
/// Append-only, except that the single open AI message accumulates fragments in place and
/// receives its server id retroactively. The open message is tracked explicitly; it is never
/// re-derived from the tail of the log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationLog {
    messages: Vec<Message>,
    open_ai_message: Option<ClientMessageId>,
}

impl ConversationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages in display order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Number of messages, including an open AI message.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Looks a message up by its local id.
    pub fn get(&self, client_id: ClientMessageId) -> Option<&Message> {
        self.messages
            .iter()
            .find(|message| message.client_id == client_id)
    }

    /// The AI message still receiving fragments, if any.
    pub fn open_ai_message(&self) -> Option<&Message> {
        self.open_ai_message.and_then(|client_id| self.get(client_id))
    }

    /// Appends a finished message. Never use this for streamed AI output.
    pub fn push(&mut self, message: Message) -> ClientMessageId {
        let client_id = message.client_id;
        self.messages.push(message);
        client_id
    }

    /// Appends a fragment to the open AI message, opening one if none exists.
    pub fn append_fragment(&mut self, fragment: &str) -> FragmentOutcome {
        if let Some(open_id) = self.open_ai_message
            && let Some(message) = self.find_mut(open_id)
        {
            message.text.push_str(fragment);
            return FragmentOutcome::Appended(open_id);
        }

        let message = Message::new(Role::Ai, fragment);
        let client_id = message.client_id;
        self.messages.push(message);
        self.open_ai_message = Some(client_id);
        FragmentOutcome::Opened(client_id)
    }

    /// Assigns the durable id to the open AI message and closes it.
    ///
    /// Returns `None` when no AI message is open.
    pub fn close_open_message(&mut self, server_id: u64) -> Option<ClientMessageId> {
        let open_id = self.open_ai_message.take()?;
        let message = self.find_mut(open_id)?;
        message.server_id = Some(server_id);
        Some(open_id)
    }

    /// Stops extending the open AI message without assigning a server id.
    pub fn seal_open_message(&mut self) -> Option<ClientMessageId> {
        self.open_ai_message.take()
    }

    /// Removes a partially streamed AI message so a resolved copy can take its place.
    pub fn discard_open_message(&mut self) -> Option<Message> {
        let open_id = self.open_ai_message.take()?;
        let index = self
            .messages
            .iter()
            .position(|message| message.client_id == open_id)?;
        Some(self.messages.remove(index))
    }

    /// Replaces the whole log with the server history.
    pub fn reset_from_history(&mut self, history: Vec<RemoteMessage>) {
        self.open_ai_message = None;
        self.messages = history.into_iter().map(Message::from_remote).collect();
    }

    fn find_mut(&mut self, client_id: ClientMessageId) -> Option<&mut Message> {
        self.messages
            .iter_mut()
            .find(|message| message.client_id == client_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragments_concatenate_in_delivery_order() {
        let mut log = ConversationLog::new();
        log.push(Message::human("Hello", Vec::new()));

        let fragments = ["Hi", " there", ",", " how", " can I help?"];
        let mut outcomes = fragments
            .iter()
            .map(|fragment| log.append_fragment(fragment))
            .collect::<Vec<_>>();

        let first = outcomes.remove(0);
        assert!(matches!(first, FragmentOutcome::Opened(_)));
        assert!(
            outcomes
                .iter()
                .all(|outcome| *outcome == FragmentOutcome::Appended(first.message_id()))
        );

        assert_eq!(log.len(), 2);
        let open = log.open_ai_message().expect("message should be open");
        assert_eq!(open.text, fragments.concat());
        assert_eq!(open.role, Role::Ai);
        assert_eq!(open.server_id, None);
    }

    #[test]
    fn closed_message_is_never_extended_again() {
        let mut log = ConversationLog::new();
        let first = log.append_fragment("first").message_id();
        assert_eq!(log.close_open_message(42), Some(first));
        assert!(log.open_ai_message().is_none());

        let second = log.append_fragment("second");
        assert!(matches!(second, FragmentOutcome::Opened(_)));
        assert_ne!(second.message_id(), first);

        let closed = log.get(first).expect("closed message stays in the log");
        assert_eq!(closed.text, "first");
        assert_eq!(closed.server_id, Some(42));
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn close_without_open_message_is_a_no_op() {
        let mut log = ConversationLog::new();
        log.push(Message::system("connected"));
        assert_eq!(log.close_open_message(7), None);
        assert_eq!(log.messages()[0].server_id, None);
    }

    #[test]
    fn discarding_the_open_message_keeps_the_rest() {
        let mut log = ConversationLog::new();
        let human = log.push(Message::human("q", Vec::new()));
        log.append_fragment("partial");

        let discarded = log.discard_open_message().expect("open message is discarded");
        assert_eq!(discarded.text, "partial");
        assert_eq!(log.len(), 1);
        assert_eq!(log.messages()[0].client_id, human);
        assert!(log.discard_open_message().is_none());
    }

    #[test]
    fn sealed_message_keeps_text_and_stops_growing() {
        let mut log = ConversationLog::new();
        let sealed = log.append_fragment("half an ans").message_id();
        assert_eq!(log.seal_open_message(), Some(sealed));

        let next = log.append_fragment("fresh");
        assert!(matches!(next, FragmentOutcome::Opened(_)));
        let sealed = log.get(sealed).expect("sealed message stays");
        assert_eq!(sealed.text, "half an ans");
        assert_eq!(sealed.server_id, None);
    }

    #[test]
    fn history_reset_drops_open_tracking() {
        let mut log = ConversationLog::new();
        log.append_fragment("stale");
        log.reset_from_history(vec![
            RemoteMessage::new(Some(1), Role::Human, "a"),
            RemoteMessage::new(Some(2), Role::Ai, "b"),
        ]);

        assert!(log.open_ai_message().is_none());
        assert_eq!(log.len(), 2);
        assert_eq!(log.messages()[1].server_id, Some(2));
        assert!(matches!(log.append_fragment("c"), FragmentOutcome::Opened(_)));
    }
}
