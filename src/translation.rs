//! On-demand translations, fetched once per message and kept until
//! invalidated.
//!
//! Full-text and word-level translations live in separate slots. Whether a
//! translation is shown is UI state and not tracked here.

use crate::api::RemoteDataService;
use crate::cache::CacheStore;
use crate::config::StaleTimes;
use crate::error::{ChatError, Result};
use crate::history::MessageHistory;
use crate::inflight::InFlight;
use crate::models::{Message, WordTranslation, WordTranslationSet};
use crate::overlay::{self, Segment};
use crate::query_keys::QueryKey;
use dashmap::DashMap;
use futures::FutureExt;
use std::sync::Arc;

/// What the cache knows about one translation slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TranslationState {
    /// Never requested, or the last request failed.
    Absent,
    Loading,
    Present,
}

#[derive(Clone)]
pub struct TranslationCache {
    store: CacheStore,
    service: Arc<dyn RemoteDataService>,
    stale_times: StaleTimes,
    full: InFlight<i64, String>,
    words: InFlight<i64, WordTranslationSet>,
    // Bumped by `invalidate`; a fetch only writes back if it is unchanged.
    epochs: Arc<DashMap<i64, u64>>,
}

impl TranslationCache {
    pub fn new(
        store: CacheStore,
        service: Arc<dyn RemoteDataService>,
        stale_times: StaleTimes,
    ) -> Self {
        Self {
            store,
            service,
            stale_times,
            full: InFlight::new(),
            words: InFlight::new(),
            epochs: Arc::new(DashMap::new()),
        }
    }

    pub fn cached_full_translation(&self, message_id: i64) -> Option<String> {
        self.store
            .get::<String>(QueryKey::MessageTranslation(message_id))
            .map(|entry| entry.value)
    }

    pub fn cached_word_translations(&self, message_id: i64) -> Option<WordTranslationSet> {
        self.store
            .get::<WordTranslationSet>(QueryKey::MessageWordTranslations(message_id))
            .map(|entry| entry.value)
    }

    pub fn full_translation_state(&self, message_id: i64) -> TranslationState {
        if self.store.contains(QueryKey::MessageTranslation(message_id)) {
            TranslationState::Present
        } else if self.full.is_pending(&message_id) {
            TranslationState::Loading
        } else {
            TranslationState::Absent
        }
    }

    pub fn word_translation_state(&self, message_id: i64) -> TranslationState {
        if self.store.contains(QueryKey::MessageWordTranslations(message_id)) {
            TranslationState::Present
        } else if self.words.is_pending(&message_id) {
            TranslationState::Loading
        } else {
            TranslationState::Absent
        }
    }

    /// Full translation of a message. Concurrent calls for the same message
    /// share one request; failures are not cached.
    pub async fn get_full_translation(&self, message_id: i64) -> Result<String> {
        if let Some(translation) = self.cached_full_translation(message_id) {
            return Ok(translation);
        }
        let this = self.clone();
        self.full
            .run(message_id, move || {
                async move {
                    log::debug!("Fetching translation of message {}", message_id);
                    let epoch = this.epoch(message_id);
                    let fetched = this.service.translate(message_id).await;
                    let translation = match fetched {
                        Ok(body) => body.translation,
                        Err(e) => return Err(this.fetch_failed(message_id, e)),
                    };
                    if this.write_if_current(message_id, epoch, || {
                        this.store_full(message_id, &translation)
                    }) {
                        log::info!("Cached translation of message {}", message_id);
                    }
                    Ok(translation)
                }
                .boxed()
            })
            .await
    }

    /// Word-level translations of an assistant message. Also fills the
    /// full-translation slot when it is still empty.
    pub async fn get_word_translations(&self, message_id: i64) -> Result<WordTranslationSet> {
        if let Some(set) = self.cached_word_translations(message_id) {
            return Ok(set);
        }
        let this = self.clone();
        self.words
            .run(message_id, move || {
                async move {
                    log::debug!("Fetching word translations of message {}", message_id);
                    let epoch = this.epoch(message_id);
                    let set = match this.service.translate_with_words(message_id).await {
                        Ok(set) => set,
                        Err(e) => return Err(this.fetch_failed(message_id, e)),
                    };
                    let written = this.write_if_current(message_id, epoch, || {
                        this.store.set(
                            QueryKey::MessageWordTranslations(message_id),
                            set.clone(),
                            this.stale_times.translations(),
                        );
                        if !this.store.contains(QueryKey::MessageTranslation(message_id)) {
                            this.store_full(message_id, &set.translation);
                        }
                        this.patch_histories(message_id, None, Some(&set.word_translations));
                    });
                    if written {
                        log::info!(
                            "Cached {} word translations of message {}",
                            set.word_translations.len(),
                            message_id
                        );
                    }
                    Ok(set)
                }
                .boxed()
            })
            .await
    }

    /// Like [`get_word_translations`](Self::get_word_translations), refusing
    /// messages that do not get word-level translations.
    pub async fn get_word_translations_for(&self, message: &Message) -> Result<WordTranslationSet> {
        if !message.supports_word_translation() {
            return Err(ChatError::validation(format!(
                "Word translations are only available for assistant messages (message {})",
                message.id
            )));
        }
        self.get_word_translations(message.id).await
    }

    /// Segments for rendering `message` with its word overlay. Falls back to
    /// word translations carried on the message itself.
    pub fn overlay(&self, message: &Message) -> Vec<Segment> {
        let cached = self.cached_word_translations(message.id);
        let words: &[WordTranslation] = match (&cached, &message.word_translations) {
            (Some(set), _) => &set.word_translations,
            (None, Some(words)) => words,
            (None, None) => &[],
        };
        overlay::tokenize(&message.content, words)
    }

    /// Forgets both slots so the next request fetches again. A fetch still
    /// in flight for the message returns its result without caching it.
    pub fn invalidate(&self, message_id: i64) -> usize {
        *self.epochs.entry(message_id).or_insert(0) += 1;
        self.store.remove_prefix(QueryKey::Message(message_id))
    }

    fn epoch(&self, message_id: i64) -> u64 {
        self.epochs.get(&message_id).map_or(0, |epoch| *epoch)
    }

    /// Runs `write` unless the message was invalidated since `epoch` was read.
    /// The epoch stays locked during `write`, so an `invalidate` racing with
    /// it lands afterwards and removes what was written.
    fn write_if_current(&self, message_id: i64, epoch: u64, write: impl FnOnce()) -> bool {
        let current = self.epochs.entry(message_id).or_insert(0);
        if *current != epoch {
            log::debug!("Dropping translation of message {}: invalidated in flight", message_id);
            return false;
        }
        write();
        true
    }

    fn store_full(&self, message_id: i64, translation: &str) {
        self.store.set(
            QueryKey::MessageTranslation(message_id),
            translation.to_string(),
            self.stale_times.translations(),
        );
        self.patch_histories(message_id, Some(translation), None);
    }

    /// Copies fetched translations into every cached history holding the message.
    fn patch_histories(
        &self,
        message_id: i64,
        translation: Option<&str>,
        words: Option<&[WordTranslation]>,
    ) {
        self.store
            .update_all::<MessageHistory, _>(QueryKey::Agents, |_, history| {
                history.apply_translation(message_id, translation, words)
            });
    }

    fn fetch_failed(&self, message_id: i64, err: ChatError) -> ChatError {
        log::error!("Failed to translate message {}: {}", message_id, err);
        if err.is_not_found() {
            self.invalidate(message_id);
        }
        err
    }
}
