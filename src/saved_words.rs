use crate::api::RemoteDataService;
use crate::cache::CacheStore;
use crate::config::StaleTimes;
use crate::error::{ChatError, Result};
use crate::inflight::InFlight;
use crate::models::{NewSavedWord, SavedWord, SavedWordUpdate};
use crate::query_keys::{normalize_word, normalize_word_list, QueryKey};
use futures::FutureExt;
use std::collections::HashSet;
use std::sync::Arc;

/// The user's vocabulary list and "is this word saved" lookups.
///
/// Lookups are keyed on the normalised word list, so the same set of words in
/// another order or casing hits the same entry. Every mutation invalidates
/// the whole `[saved-words]` subtree.
#[derive(Clone)]
pub struct SavedWordBook {
    store: CacheStore,
    service: Arc<dyn RemoteDataService>,
    stale_times: StaleTimes,
    matching: InFlight<String, Vec<SavedWord>>,
}

impl SavedWordBook {
    pub fn new(store: CacheStore, service: Arc<dyn RemoteDataService>, stale_times: StaleTimes) -> Self {
        Self {
            store,
            service,
            stale_times,
            matching: InFlight::new(),
        }
    }

    pub async fn list(&self) -> Result<Vec<SavedWord>> {
        if let Some(entry) = self.store.get::<Vec<SavedWord>>(QueryKey::SavedWordList) {
            if !entry.is_stale() {
                return Ok(entry.value);
            }
        }
        let words = self.service.list_saved_words().await?;
        log::info!("Fetched {} saved words", words.len());
        self.store.set(
            QueryKey::SavedWordList,
            words.clone(),
            self.stale_times.saved_words(),
        );
        Ok(words)
    }

    /// Saved entries among `words`.
    pub async fn find_matching<S: AsRef<str>>(&self, words: &[S]) -> Result<Vec<SavedWord>> {
        let normalized = normalize_word_list(words);
        if normalized.is_empty() {
            return Ok(Vec::new());
        }
        let key = QueryKey::saved_word_matches(normalized.as_slice());
        if let Some(entry) = self.store.get::<Vec<SavedWord>>(&key) {
            if !entry.is_stale() {
                return Ok(entry.value);
            }
        }

        let joined = normalized.join(",");
        let this = self.clone();
        self.matching
            .run(joined, move || {
                async move {
                    let found: Vec<SavedWord> =
                        match this.service.match_saved_words(&normalized).await {
                            Ok(found) => found,
                            Err(e) => {
                                log::error!("Failed to look up saved words: {}", e);
                                return Err(e);
                            }
                        };
                    log::debug!("{} of {} words are saved", found.len(), normalized.len());
                    this.store
                        .set(&key, found.clone(), this.stale_times.saved_words());
                    Ok(found)
                }
                .boxed()
            })
            .await
    }

    pub async fn is_saved(&self, word: &str) -> Result<bool> {
        Ok(!self.saved_set(&[word]).await?.is_empty())
    }

    /// Normalised forms of those `words` that are saved.
    pub async fn saved_set<S: AsRef<str>>(&self, words: &[S]) -> Result<HashSet<String>> {
        let found = self.find_matching(words).await?;
        let wanted: HashSet<String> = normalize_word_list(words).into_iter().collect();
        Ok(found
            .iter()
            .map(|saved| normalize_word(&saved.word))
            .filter(|word| wanted.contains(word))
            .collect())
    }

    pub async fn save(&self, word: NewSavedWord) -> Result<SavedWord> {
        if word.word.trim().is_empty() || word.translation.trim().is_empty() {
            return Err(ChatError::validation("Word and translation are required."));
        }
        let saved = self.service.save_word(&word).await?;
        log::info!("Saved word '{}' as {}", saved.word, saved.id);
        self.after_mutation(|words| {
            words.retain(|w| w.id != saved.id);
            words.push(saved.clone());
            true
        });
        Ok(saved)
    }

    pub async fn update(&self, word_id: i64, update: SavedWordUpdate) -> Result<SavedWord> {
        if update
            .translation
            .as_deref()
            .is_some_and(|t| t.trim().is_empty())
        {
            return Err(ChatError::validation("Translation cannot be empty."));
        }
        let saved = match self.service.update_saved_word(word_id, &update).await {
            Ok(saved) => saved,
            Err(e) => {
                if e.is_not_found() {
                    self.after_mutation(|words| remove_word(words, word_id));
                }
                return Err(e);
            }
        };
        self.after_mutation(|words| match words.iter_mut().find(|w| w.id == word_id) {
            Some(word) => {
                *word = saved.clone();
                true
            }
            None => false,
        });
        Ok(saved)
    }

    /// Deletes a saved word. Already deleted counts as success.
    pub async fn delete(&self, word_id: i64) -> Result<()> {
        match self.service.delete_saved_word(word_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                log::warn!("Saved word {} was already deleted", word_id);
            }
            Err(e) => return Err(e),
        }
        self.after_mutation(|words| remove_word(words, word_id));
        Ok(())
    }

    fn after_mutation<F>(&self, edit: F)
    where
        F: FnOnce(&mut Vec<SavedWord>) -> bool,
    {
        self.store.update::<Vec<SavedWord>, _>(QueryKey::SavedWordList, edit);
        self.store.invalidate(QueryKey::SavedWords);
    }
}

fn remove_word(words: &mut Vec<SavedWord>, word_id: i64) -> bool {
    let before = words.len();
    words.retain(|w| w.id != word_id);
    words.len() != before
}
