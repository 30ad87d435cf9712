// Declare the modules
pub mod agents;
pub mod api;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod history;
pub mod inflight;
pub mod models;
pub mod overlay;
pub mod query_keys;
pub mod saved_words;
pub mod state;
pub mod translation;

pub use agents::AgentDirectory;
pub use api::{HttpDataService, RemoteDataService};
pub use cache::{CacheEntry, CacheEvent, CacheStore, CreationClaim, Transaction, NEVER_STALE};
pub use config::{ClientConfig, SessionCreation, StaleTimes};
pub use coordinator::{
    AlwaysConfirm, ConfirmRequest, PageOutcome, RenameOutcome, Selection, SendOutcome,
    SessionCoordinator, SessionPhase, UserConfirmation,
};
pub use error::{ChatError, Result};
pub use history::{ChatEntry, Delivery, MessageHistory};
pub use overlay::{tokenize, Segment};
pub use query_keys::{KeyPath, KeySegment, QueryKey};
pub use saved_words::SavedWordBook;
pub use state::ClientState;
pub use translation::{TranslationCache, TranslationState};

/// Installs `env_logger` with `info` as the default filter; `RUST_LOG`
/// overrides it. Calling it again is harmless.
pub fn init_logging() {
    let env = env_logger::Env::default().default_filter_or("info");
    if env_logger::Builder::from_env(env).try_init().is_err() {
        log::debug!("Logger already initialised");
    }
}
