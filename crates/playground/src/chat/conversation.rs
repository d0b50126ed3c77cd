use super::message::{Message, Role};

/// Ordered, session-owned transcript.
///
/// Insertion order is the transcript order and the request context order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationStore {
    messages: Vec<Message>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn append(&mut self, role: Role, content: impl Into<String>) {
        self.messages.push(Message::new(role, content));
    }

    /// Removes the message at `index`, shifting later messages down by one.
    ///
    /// An out-of-range index is a silent no-op: a stale row index from a redraw
    /// must never take down the session.
    pub fn delete_at(&mut self, index: usize) -> Option<Message> {
        if index >= self.messages.len() {
            tracing::debug!(
                index,
                message_count = self.messages.len(),
                "ignoring delete for out-of-range message index"
            );
            return None;
        }

        Some(self.messages.remove(index))
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Builds the exact message sequence handed to the provider.
    ///
    /// The system prompt is prepended only when it is non-blank; it is sent as
    /// typed, without trimming.
    pub fn to_request_payload(&self, system_prompt: &str) -> Vec<Message> {
        let mut payload = Vec::with_capacity(self.messages.len() + 1);
        if !system_prompt.trim().is_empty() {
            payload.push(Message::system(system_prompt));
        }
        payload.extend(self.messages.iter().cloned());
        payload
    }

    pub fn total_characters(&self) -> usize {
        self.messages
            .iter()
            .map(|message| message.content.chars().count())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_message_store() -> ConversationStore {
        let mut store = ConversationStore::new();
        store.append(Role::User, "hi");
        store.append(Role::Assistant, "hello");
        store
    }

    #[test]
    fn delete_out_of_range_leaves_store_unchanged() {
        let mut store = two_message_store();
        let before = store.clone();

        assert_eq!(store.delete_at(5), None);
        assert_eq!(store.delete_at(2), None);
        assert_eq!(store, before);
    }

    #[test]
    fn delete_shifts_later_messages_down() {
        let mut store = two_message_store();
        store.append(Role::User, "again");

        assert_eq!(store.delete_at(0), Some(Message::user("hi")));
        assert_eq!(
            store.messages(),
            &[Message::assistant("hello"), Message::user("again")]
        );
    }

    #[test]
    fn payload_prepends_non_blank_system_prompt() {
        let store = two_message_store();

        let payload = store.to_request_payload("You are a helpful assistant.");
        assert_eq!(payload.len(), 3);
        assert_eq!(payload[0], Message::system("You are a helpful assistant."));
        assert_eq!(&payload[1..], store.messages());

        assert_eq!(store.to_request_payload(" \n\t"), store.messages().to_vec());
    }

    #[test]
    fn clear_empties_everything() {
        let mut store = two_message_store();
        store.clear();
        assert!(store.is_empty());
        assert_eq!(store.total_characters(), 0);
    }

    #[test]
    fn total_characters_counts_chars_not_bytes() {
        let mut store = ConversationStore::new();
        store.append(Role::User, "héllo");
        store.append(Role::Assistant, "");
        assert_eq!(store.total_characters(), 5);
    }
}
