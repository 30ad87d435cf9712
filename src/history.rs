//! The cached message list of one session.
//!
//! Ordering invariant: server-confirmed messages are kept in ascending id
//! order; locally sent messages that the server has not confirmed yet follow
//! them in send order. A message id appears at most once.

use crate::models::{Message, MessagePage, WordTranslation};
use uuid::Uuid;

/// Lifecycle of an optimistically echoed message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Delivery {
    Pending,
    Sent,
    Failed { reason: String },
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChatEntry {
    /// Set for messages sent from this client; used to find the entry again
    /// when the server answers.
    pub local_id: Option<Uuid>,
    pub message: Message,
    pub delivery: Delivery,
}

impl ChatEntry {
    pub fn confirmed(message: Message) -> Self {
        Self {
            local_id: None,
            message,
            delivery: Delivery::Sent,
        }
    }

    pub fn pending(local_id: Uuid, message: Message) -> Self {
        Self {
            local_id: Some(local_id),
            message,
            delivery: Delivery::Pending,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.delivery == Delivery::Sent
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.delivery, Delivery::Failed { .. })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Upsert {
    Added,
    Updated,
    Unchanged,
}

/// What a page merge did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub added: usize,
    pub updated: usize,
}

impl MergeStats {
    pub fn changed(&self) -> bool {
        self.added > 0 || self.updated > 0
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MessageHistory {
    pub session_id: i64,
    pub entries: Vec<ChatEntry>,
    /// Highest page number merged so far; 0 when nothing was fetched.
    pub loaded_pages: u32,
    pub has_more: bool,
}

impl MessageHistory {
    pub fn empty(session_id: i64) -> Self {
        Self {
            session_id,
            entries: Vec::new(),
            loaded_pages: 0,
            has_more: false,
        }
    }

    pub fn from_page(session_id: i64, page: MessagePage) -> Self {
        let mut history = Self::empty(session_id);
        history.merge_page(page);
        history
    }

    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.entries.iter().map(|e| &e.message)
    }

    /// Entries the UI renders (system messages are hidden).
    pub fn visible(&self) -> impl Iterator<Item = &ChatEntry> {
        self.entries.iter().filter(|e| e.message.is_visible())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find_local(&self, local_id: Uuid) -> Option<&ChatEntry> {
        self.entries.iter().find(|e| e.local_id == Some(local_id))
    }

    /// Merges a fetched page, de-duplicating by message id.
    ///
    /// Paging metadata only follows the page when it is at least as old as
    /// anything loaded before, so refreshing page 1 does not reset how far
    /// back the user has scrolled.
    pub fn merge_page(&mut self, page: MessagePage) -> MergeStats {
        if page.page >= self.loaded_pages {
            self.loaded_pages = page.page;
            self.has_more = page.has_more;
        }
        let mut stats = MergeStats::default();
        for message in page.messages {
            match self.upsert_message(message) {
                Upsert::Added => stats.added += 1,
                Upsert::Updated => stats.updated += 1,
                Upsert::Unchanged => {}
            }
        }
        stats
    }

    /// Inserts or refreshes a single confirmed message. Returns whether the
    /// history changed.
    pub fn upsert(&mut self, message: Message) -> bool {
        self.upsert_message(message) != Upsert::Unchanged
    }

    fn upsert_message(&mut self, mut message: Message) -> Upsert {
        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|e| e.is_confirmed() && e.message.id == message.id)
        {
            // Translations patched in locally survive a refetch that lacks them.
            if message.translation.is_none() {
                message.translation = existing.message.translation.clone();
            }
            if message.word_translations.is_none() {
                message.word_translations = existing.message.word_translations.clone();
            }
            if existing.message == message {
                return Upsert::Unchanged;
            }
            existing.message = message;
            return Upsert::Updated;
        }
        let index = self.insertion_index(message.id);
        self.entries.insert(index, ChatEntry::confirmed(message));
        Upsert::Added
    }

    /// Before the first confirmed entry with a larger id, otherwise right
    /// after the last confirmed entry.
    fn insertion_index(&self, message_id: i64) -> usize {
        self.entries
            .iter()
            .position(|e| e.is_confirmed() && e.message.id > message_id)
            .unwrap_or_else(|| {
                self.entries
                    .iter()
                    .rposition(ChatEntry::is_confirmed)
                    .map_or(0, |i| i + 1)
            })
    }

    pub fn push_pending(&mut self, local_id: Uuid, message: Message) {
        self.entries.push(ChatEntry::pending(local_id, message));
    }

    /// Replaces the local entry with the server's copy, placed by id among
    /// the confirmed entries. If a refetch already brought that message in,
    /// the local entry is dropped instead so the id stays unique.
    pub fn confirm_local(&mut self, local_id: Uuid, message: Message) -> bool {
        let Some(index) = self.entries.iter().position(|e| e.local_id == Some(local_id)) else {
            return false;
        };
        self.entries.remove(index);
        if self
            .entries
            .iter()
            .any(|e| e.is_confirmed() && e.message.id == message.id)
        {
            self.upsert_message(message);
            return true;
        }
        let index = self.insertion_index(message.id);
        self.entries.insert(
            index,
            ChatEntry {
                local_id: Some(local_id),
                message,
                delivery: Delivery::Sent,
            },
        );
        true
    }

    pub fn mark_failed(&mut self, local_id: Uuid, reason: &str) -> bool {
        match self
            .entries
            .iter_mut()
            .find(|e| e.local_id == Some(local_id) && e.delivery == Delivery::Pending)
        {
            Some(entry) => {
                entry.delivery = Delivery::Failed {
                    reason: reason.to_string(),
                };
                true
            }
            None => false,
        }
    }

    /// Puts a failed entry back to pending and returns its content for resending.
    pub fn retry_local(&mut self, local_id: Uuid) -> Option<String> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.local_id == Some(local_id) && e.is_failed())?;
        entry.delivery = Delivery::Pending;
        Some(entry.message.content.clone())
    }

    /// Drops a locally sent entry whatever its delivery state.
    pub fn remove_local(&mut self, local_id: Uuid) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.local_id != Some(local_id));
        self.entries.len() != before
    }

    /// Drops a failed entry at the user's request.
    pub fn discard_failed(&mut self, local_id: Uuid) -> bool {
        let before = self.entries.len();
        self.entries
            .retain(|e| !(e.local_id == Some(local_id) && e.is_failed()));
        self.entries.len() != before
    }

    /// Writes fetched translations into the matching message.
    pub fn apply_translation(
        &mut self,
        message_id: i64,
        translation: Option<&str>,
        words: Option<&[WordTranslation]>,
    ) -> bool {
        let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.is_confirmed() && e.message.id == message_id)
        else {
            return false;
        };
        let mut changed = false;
        if let Some(translation) = translation {
            if entry.message.translation.as_deref() != Some(translation) {
                entry.message.translation = Some(translation.to_string());
                changed = true;
            }
        }
        if let Some(words) = words {
            if entry.message.word_translations.as_deref() != Some(words) {
                entry.message.word_translations = Some(words.to_vec());
                changed = true;
            }
        }
        changed
    }

    /// Points the history at its reconciled server session id.
    pub fn retarget(&mut self, session_id: i64) -> bool {
        if self.session_id == session_id
            && self.entries.iter().all(|e| e.message.session_id == session_id)
        {
            return false;
        }
        self.session_id = session_id;
        for entry in &mut self.entries {
            entry.message.session_id = session_id;
        }
        true
    }

    /// Takes over the unconfirmed entries of another history.
    pub fn adopt_local_entries(&mut self, other: MessageHistory) -> bool {
        let mut changed = false;
        for entry in other.entries.into_iter().filter(|e| !e.is_confirmed()) {
            if entry.local_id.is_some() && self.entries.iter().any(|e| e.local_id == entry.local_id)
            {
                continue;
            }
            self.entries.push(entry);
            changed = true;
        }
        changed
    }
}
