//! Conversation and message store.
//!
//! Single source of truth for chat state. Every operation is synchronous,
//! total and free of I/O; the coordinator and the pagination controller are
//! the only writers. Two orderings hold after every call:
//! - each conversation's messages ascend by `created_at`, unique by [`MessageKey`];
//! - the conversation list descends by `last_message_at` (missing = epoch).

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use scholaris_shared::{Conversation, ConversationPatch, LastMessage, Message, MessageKey};
use tokio::sync::RwLock;

/// Store handle shared by the coordinator, the pagination controller and readers.
pub type SharedStore = Arc<RwLock<ChatStore>>;

#[derive(Debug, Default, Clone)]
pub struct ChatStore {
    conversations: Vec<Conversation>,
    messages: HashMap<i64, Vec<Message>>,
    /// `None` once the oldest page has been loaded. Absent until the first fetch.
    cursors: HashMap<i64, Option<i64>>,
    typing: HashMap<i64, BTreeSet<i64>>,
    current_conversation_id: Option<i64>,
}

fn contains_key(list: &[Message], key: &MessageKey) -> bool {
    list.iter().any(|m| m.key().as_ref() == Some(key))
}

/// Insert keeping ascending `created_at`; equal timestamps keep arrival order.
fn insert_sorted(list: &mut Vec<Message>, message: Message) {
    let pos = list.partition_point(|m| m.created_at <= message.created_at);
    list.insert(pos, message);
}

/// Drop the pending entry a confirmed message supersedes and return it.
fn take_pending_twin(list: &mut Vec<Message>, confirmed: &Message) -> Option<Message> {
    let (Some(_), Some(cid)) = (confirmed.id, confirmed.client_message_id.as_ref()) else {
        return None;
    };
    let pos = list
        .iter()
        .position(|m| m.is_pending() && m.client_message_id.as_ref() == Some(cid))?;
    Some(list.remove(pos))
}

/// Whether `last` is the summary built from the pending message `pending`.
fn summarises_pending(last: &LastMessage, pending: &Message) -> bool {
    last.id.is_none() && last.sender_id == pending.sender_id && last.created_at == pending.created_at
}

impl ChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedStore {
        Arc::new(RwLock::new(Self::new()))
    }

    // --- Reads ---

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn conversation(&self, conversation_id: i64) -> Option<&Conversation> {
        self.conversations
            .iter()
            .find(|c| c.conversation_id == conversation_id)
    }

    pub fn messages(&self, conversation_id: i64) -> &[Message] {
        self.messages
            .get(&conversation_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Pagination cursor; `None` when nothing older remains or nothing was fetched yet.
    pub fn cursor(&self, conversation_id: i64) -> Option<i64> {
        self.cursors.get(&conversation_id).copied().flatten()
    }

    /// Whether a first page has been fetched for this conversation.
    pub fn is_loaded(&self, conversation_id: i64) -> bool {
        self.cursors.contains_key(&conversation_id)
    }

    pub fn current_conversation_id(&self) -> Option<i64> {
        self.current_conversation_id
    }

    pub fn typing_users(&self, conversation_id: i64) -> Vec<i64> {
        self.typing
            .get(&conversation_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn total_unread(&self) -> u32 {
        self.conversations.iter().map(|c| c.unread_count).sum()
    }

    /// Conversation holding the message with server id `message_id`.
    pub fn locate_message(&self, message_id: i64) -> Option<i64> {
        self.messages.iter().find_map(|(conversation_id, list)| {
            list.iter()
                .any(|m| m.id == Some(message_id))
                .then_some(*conversation_id)
        })
    }

    // --- Conversations ---

    fn sort_conversations(&mut self) {
        self.conversations
            .sort_by(|a, b| b.activity_at().cmp(&a.activity_at()));
    }

    fn conversation_mut(&mut self, conversation_id: i64) -> Option<&mut Conversation> {
        self.conversations
            .iter_mut()
            .find(|c| c.conversation_id == conversation_id)
    }

    /// Replace the whole list (from a list fetch).
    pub fn set_conversations(&mut self, conversations: Vec<Conversation>) {
        let mut seen = HashSet::new();
        self.conversations = conversations
            .into_iter()
            .filter(|c| seen.insert(c.conversation_id))
            .collect();
        self.sort_conversations();
    }

    pub fn upsert_conversation(&mut self, conversation: Conversation) {
        match self.conversation_mut(conversation.conversation_id) {
            Some(existing) => *existing = conversation,
            None => self.conversations.push(conversation),
        }
        self.sort_conversations();
    }

    /// Overlay a partial update, or insert it when it is a full conversation.
    /// Returns `false` for a partial update of an unknown conversation.
    pub fn apply_conversation_patch(&mut self, patch: &ConversationPatch) -> bool {
        if let Some(existing) = self.conversation_mut(patch.conversation_id) {
            existing.apply(patch);
            self.sort_conversations();
            return true;
        }
        match patch.to_conversation() {
            Some(conversation) => {
                self.upsert_conversation(conversation);
                true
            }
            None => false,
        }
    }

    /// Set the summary shown in the conversation list. A new summary also
    /// moves `last_message_at`; clearing it leaves the timestamp alone.
    pub fn update_conversation_last_message(
        &mut self,
        conversation_id: i64,
        last_message: Option<LastMessage>,
    ) {
        let Some(conversation) = self.conversation_mut(conversation_id) else {
            return;
        };
        if let Some(last) = &last_message {
            conversation.last_message_at = Some(last.created_at);
        }
        conversation.last_message = last_message;
        self.sort_conversations();
    }

    /// Restore a summary captured earlier (rollback of an optimistic send).
    pub fn restore_conversation_summary(
        &mut self,
        conversation_id: i64,
        last_message: Option<LastMessage>,
        last_message_at: Option<DateTime<Utc>>,
    ) {
        let Some(conversation) = self.conversation_mut(conversation_id) else {
            return;
        };
        conversation.last_message = last_message;
        conversation.last_message_at = last_message_at;
        self.sort_conversations();
    }

    pub fn set_unread_count(&mut self, conversation_id: i64, unread_count: u32) {
        if let Some(conversation) = self.conversation_mut(conversation_id) {
            conversation.unread_count = unread_count;
        }
    }

    pub fn increment_unread(&mut self, conversation_id: i64) {
        if let Some(conversation) = self.conversation_mut(conversation_id) {
            conversation.unread_count = conversation.unread_count.saturating_add(1);
        }
    }

    pub fn mark_conversation_as_read(&mut self, conversation_id: i64) {
        self.set_unread_count(conversation_id, 0);
    }

    /// Drop the conversation along with its messages, cursor and typing state.
    pub fn remove_conversation(&mut self, conversation_id: i64) {
        self.conversations
            .retain(|c| c.conversation_id != conversation_id);
        self.messages.remove(&conversation_id);
        self.cursors.remove(&conversation_id);
        self.typing.remove(&conversation_id);
        if self.current_conversation_id == Some(conversation_id) {
            self.current_conversation_id = None;
        }
    }

    pub fn set_current_conversation_id(&mut self, conversation_id: Option<i64>) {
        self.current_conversation_id = conversation_id;
    }

    pub fn set_cursor(&mut self, conversation_id: i64, cursor: Option<i64>) {
        self.cursors.insert(conversation_id, cursor);
    }

    // --- Messages ---

    /// Replace (`append == false`) or extend with an older page (`append == true`).
    ///
    /// Replacement keeps the first occurrence of each key. Appending skips
    /// messages whose key is already present. Both leave the list sorted.
    pub fn set_messages(&mut self, conversation_id: i64, messages: Vec<Message>, append: bool) {
        let mut confirmed = Vec::new();
        let list = self.messages.entry(conversation_id).or_default();
        if !append {
            list.clear();
        }
        for mut message in messages {
            message.conversation_id = conversation_id;
            if let Some(key) = message.key() {
                if contains_key(list, &key) {
                    continue;
                }
            }
            if let Some(pending) = take_pending_twin(list, &message) {
                confirmed.push((pending, message.summary()));
            }
            list.push(message);
        }
        list.sort_by_key(|m| m.created_at);

        for (pending, summary) in confirmed {
            self.confirm_summary(conversation_id, &pending, summary);
        }
    }

    /// Add a live message. Returns `false` when an entry with the same key
    /// already exists. A confirmed message replaces its pending twin (same
    /// `client_message_id`, no server id) instead of duplicating it.
    ///
    /// When the conversation summary still describes that pending entry it is
    /// upgraded to the confirmed message, so later edits and deletes by
    /// server id find it.
    pub fn add_message(&mut self, message: Message) -> bool {
        let conversation_id = message.conversation_id;
        let list = self.messages.entry(conversation_id).or_default();
        if let Some(key) = message.key() {
            if contains_key(list, &key) {
                return false;
            }
        }
        let replaced = take_pending_twin(list, &message);
        let summary = message.summary();
        insert_sorted(list, message);

        if let Some(pending) = replaced {
            self.confirm_summary(conversation_id, &pending, summary);
        }
        true
    }

    fn confirm_summary(&mut self, conversation_id: i64, pending: &Message, summary: LastMessage) {
        let Some(conversation) = self.conversation_mut(conversation_id) else {
            return;
        };
        if !conversation
            .last_message
            .as_ref()
            .is_some_and(|last| summarises_pending(last, pending))
        {
            return;
        }
        conversation.last_message_at = Some(summary.created_at);
        conversation.last_message = Some(summary);
        self.sort_conversations();
    }

    /// Replace the body of the message with server id `message_id`, and of the
    /// conversation summary when it points at that message.
    pub fn update_message(&mut self, conversation_id: i64, message_id: i64, body: &str) -> bool {
        let Some(message) = self
            .messages
            .get_mut(&conversation_id)
            .and_then(|list| list.iter_mut().find(|m| m.id == Some(message_id)))
        else {
            return false;
        };
        message.body = Some(body.to_string());

        if let Some(last) = self
            .conversation_mut(conversation_id)
            .and_then(|c| c.last_message.as_mut())
        {
            if last.id == Some(message_id) {
                last.body = Some(body.to_string());
            }
        }
        true
    }

    /// Remove by server id. The conversation summary is left for the caller to recompute.
    pub fn remove_message(&mut self, conversation_id: i64, message_id: i64) -> Option<Message> {
        let list = self.messages.get_mut(&conversation_id)?;
        let pos = list.iter().position(|m| m.id == Some(message_id))?;
        Some(list.remove(pos))
    }

    /// Remove a still-pending message by its client id.
    pub fn remove_pending(&mut self, conversation_id: i64, client_message_id: &str) -> bool {
        let Some(list) = self.messages.get_mut(&conversation_id) else {
            return false;
        };
        let before = list.len();
        list.retain(|m| !(m.is_pending() && m.client_message_id.as_deref() == Some(client_message_id)));
        list.len() != before
    }

    // --- Typing ---

    pub fn set_typing_users(&mut self, conversation_id: i64, users: impl IntoIterator<Item = i64>) {
        let set: BTreeSet<i64> = users.into_iter().collect();
        if set.is_empty() {
            self.typing.remove(&conversation_id);
        } else {
            self.typing.insert(conversation_id, set);
        }
    }

    pub fn add_typing_user(&mut self, conversation_id: i64, user_id: i64) {
        self.typing.entry(conversation_id).or_default().insert(user_id);
    }

    pub fn remove_typing_user(&mut self, conversation_id: i64, user_id: i64) {
        if let Some(set) = self.typing.get_mut(&conversation_id) {
            set.remove(&user_id);
            if set.is_empty() {
                self.typing.remove(&conversation_id);
            }
        }
    }

    pub fn clear_typing_users(&mut self, conversation_id: i64) {
        self.typing.remove(&conversation_id);
    }

    pub fn clear_all_typing(&mut self) {
        self.typing.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use scholaris_shared::{ChatUser, MessageType, UserRole};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn msg(id: i64, secs: i64) -> Message {
        Message {
            id: Some(id),
            client_message_id: None,
            conversation_id: 5,
            sender_id: 1,
            body: Some(format!("m{}", id)),
            created_at: at(secs),
            kind: MessageType::Text,
            file_url: None,
        }
    }

    fn conv(id: i64, last_at: Option<i64>) -> Conversation {
        Conversation {
            conversation_id: id,
            other_user: ChatUser {
                id: 100 + id,
                username: format!("user{}", id),
                email: None,
                role: UserRole::Student,
            },
            last_message: None,
            unread_count: 0,
            last_message_at: last_at.map(at),
        }
    }

    fn ids(store: &ChatStore, conversation_id: i64) -> Vec<Option<i64>> {
        store.messages(conversation_id).iter().map(|m| m.id).collect()
    }

    #[test]
    fn test_set_messages_then_append_older_page() {
        let mut store = ChatStore::new();
        store.set_messages(5, vec![msg(2, 20), msg(1, 10)], false);
        assert_eq!(ids(&store, 5), vec![Some(1), Some(2)]);

        store.set_messages(5, vec![msg(0, 0), msg(1, 10)], true);
        assert_eq!(ids(&store, 5), vec![Some(0), Some(1), Some(2)]);
    }

    #[test]
    fn test_replace_dedups_first_occurrence_wins() {
        let mut store = ChatStore::new();
        let mut dup = msg(1, 10);
        dup.body = Some("second".into());
        store.set_messages(5, vec![msg(1, 10), dup, msg(3, 5)], false);

        assert_eq!(ids(&store, 5), vec![Some(3), Some(1)]);
        assert_eq!(store.messages(5)[1].body.as_deref(), Some("m1"));
    }

    #[test]
    fn test_add_message_is_idempotent_and_sorted() {
        let mut store = ChatStore::new();
        store.set_messages(5, vec![msg(1, 10), msg(3, 30)], false);

        assert!(store.add_message(msg(2, 20)));
        assert!(!store.add_message(msg(2, 20)));
        assert_eq!(ids(&store, 5), vec![Some(1), Some(2), Some(3)]);
    }

    #[test]
    fn test_confirmation_replaces_pending_entry() {
        let mut store = ChatStore::new();
        let pending = Message::pending(5, 1, "hi", "c1");
        assert!(store.add_message(pending.clone()));

        let mut confirmed = pending;
        confirmed.id = Some(99);
        assert!(store.add_message(confirmed.clone()));
        assert!(!store.add_message(confirmed));

        let list = store.messages(5);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].key(), Some(MessageKey::Id(99)));
    }

    #[test]
    fn test_confirmation_upgrades_pending_summary() {
        let mut store = ChatStore::new();
        store.upsert_conversation(conv(5, Some(0)));
        let pending = Message::pending(5, 1, "hi", "c1");
        store.add_message(pending.clone());
        store.update_conversation_last_message(5, Some(pending.summary()));

        let mut confirmed = pending;
        confirmed.id = Some(99);
        confirmed.created_at = at(500);
        store.add_message(confirmed);

        let last = store.conversation(5).and_then(|c| c.last_message.clone());
        assert_eq!(last.as_ref().and_then(|l| l.id), Some(99));
        assert_eq!(store.conversation(5).and_then(|c| c.last_message_at), Some(at(500)));

        assert!(store.update_message(5, 99, "edited"));
        let last = store.conversation(5).and_then(|c| c.last_message.clone());
        assert_eq!(last.and_then(|l| l.body).as_deref(), Some("edited"));
    }

    #[test]
    fn test_confirmation_leaves_newer_summary_alone() {
        let mut store = ChatStore::new();
        store.upsert_conversation(conv(5, Some(0)));
        let pending = Message::pending(5, 1, "hi", "c1");
        store.add_message(pending.clone());
        store.update_conversation_last_message(5, Some(msg(7, 9_000).summary()));

        let mut confirmed = pending;
        confirmed.id = Some(99);
        store.add_message(confirmed);

        let last = store.conversation(5).and_then(|c| c.last_message.clone());
        assert_eq!(last.and_then(|l| l.id), Some(7));
    }

    #[test]
    fn test_older_page_with_confirmed_copy_of_pending() {
        let mut store = ChatStore::new();
        store.add_message(Message::pending(5, 1, "hi", "c1"));
        let mut confirmed = msg(7, 0);
        confirmed.client_message_id = Some("c1".into());
        store.set_messages(5, vec![confirmed], true);
        assert_eq!(ids(&store, 5), vec![Some(7)]);
    }

    #[test]
    fn test_conversations_sorted_newest_first() {
        let mut store = ChatStore::new();
        store.set_conversations(vec![conv(1, Some(10)), conv(2, None), conv(3, Some(30))]);
        let order: Vec<i64> = store.conversations().iter().map(|c| c.conversation_id).collect();
        assert_eq!(order, vec![3, 1, 2]);

        store.update_conversation_last_message(2, Some(msg(9, 40).summary()));
        assert_eq!(store.conversations()[0].conversation_id, 2);

        store.upsert_conversation(conv(1, Some(50)));
        assert_eq!(store.conversations()[0].conversation_id, 1);
        assert_eq!(store.conversations().len(), 3);
    }

    #[test]
    fn test_partial_patch_of_unknown_conversation_is_ignored() {
        let mut store = ChatStore::new();
        let patch = ConversationPatch {
            conversation_id: 8,
            other_user: None,
            last_message: None,
            unread_count: Some(3),
            last_message_at: None,
        };
        assert!(!store.apply_conversation_patch(&patch));
        assert!(store.conversation(8).is_none());

        assert!(store.apply_conversation_patch(&conv(8, Some(1)).into()));
        assert!(store.apply_conversation_patch(&patch));
        assert_eq!(store.conversation(8).map(|c| c.unread_count), Some(3));
    }

    #[test]
    fn test_update_message_touches_summary() {
        let mut store = ChatStore::new();
        store.upsert_conversation(conv(5, None));
        store.set_messages(5, vec![msg(1, 10), msg(2, 20)], false);
        store.update_conversation_last_message(5, Some(msg(2, 20).summary()));

        assert!(store.update_message(5, 2, "edited"));
        assert_eq!(store.messages(5)[1].body.as_deref(), Some("edited"));
        let last = store.conversation(5).and_then(|c| c.last_message.clone());
        assert_eq!(last.and_then(|l| l.body).as_deref(), Some("edited"));

        assert!(store.update_message(5, 1, "older"));
        let last = store.conversation(5).and_then(|c| c.last_message.clone());
        assert_eq!(last.and_then(|l| l.body).as_deref(), Some("edited"));

        assert!(!store.update_message(5, 42, "nope"));
    }

    #[test]
    fn test_remove_message_and_locate() {
        let mut store = ChatStore::new();
        store.set_messages(5, vec![msg(1, 10), msg(2, 20)], false);
        assert_eq!(store.locate_message(2), Some(5));
        assert_eq!(store.remove_message(5, 2).and_then(|m| m.id), Some(2));
        assert_eq!(store.locate_message(2), None);
        assert!(store.remove_message(5, 2).is_none());
    }

    #[test]
    fn test_unread_accounting() {
        let mut store = ChatStore::new();
        store.upsert_conversation(conv(5, None));
        store.set_unread_count(5, 2);
        for _ in 0..3 {
            store.increment_unread(5);
        }
        assert_eq!(store.conversation(5).map(|c| c.unread_count), Some(5));
        assert_eq!(store.total_unread(), 5);
        store.mark_conversation_as_read(5);
        assert_eq!(store.conversation(5).map(|c| c.unread_count), Some(0));
    }

    #[test]
    fn test_remove_conversation_purges_everything() {
        let mut store = ChatStore::new();
        store.upsert_conversation(conv(5, None));
        store.set_messages(5, vec![msg(1, 10)], false);
        store.set_cursor(5, Some(1));
        store.add_typing_user(5, 7);
        store.set_current_conversation_id(Some(5));

        store.remove_conversation(5);
        assert!(store.conversation(5).is_none());
        assert!(store.messages(5).is_empty());
        assert!(!store.is_loaded(5));
        assert!(store.typing_users(5).is_empty());
        assert_eq!(store.current_conversation_id(), None);
    }

    #[test]
    fn test_typing_set() {
        let mut store = ChatStore::new();
        store.add_typing_user(5, 7);
        store.add_typing_user(5, 8);
        store.add_typing_user(5, 7);
        assert_eq!(store.typing_users(5), vec![7, 8]);

        store.remove_typing_user(5, 7);
        assert_eq!(store.typing_users(5), vec![8]);

        store.set_typing_users(5, [1, 2]);
        store.clear_typing_users(5);
        assert!(store.typing_users(5).is_empty());
    }

    #[test]
    fn test_cursor_states() {
        let mut store = ChatStore::new();
        assert!(!store.is_loaded(5));
        assert_eq!(store.cursor(5), None);

        store.set_cursor(5, Some(40));
        assert!(store.is_loaded(5));
        assert_eq!(store.cursor(5), Some(40));

        store.set_cursor(5, None);
        assert!(store.is_loaded(5));
        assert_eq!(store.cursor(5), None);
    }

    #[test]
    fn test_remove_pending_rollback() {
        let mut store = ChatStore::new();
        store.add_message(Message::pending(5, 1, "hi", "c1"));
        assert!(store.remove_pending(5, "c1"));
        assert!(!store.remove_pending(5, "c1"));
        assert!(store.messages(5).is_empty());
    }
}
