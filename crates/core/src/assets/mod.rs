use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{pattern::Rgb, provider::StoryProvider, session::TagId, Result, StoryboxError};

/// Display data for a figurine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterInfo {
    pub name: String,
    #[serde(default)]
    pub color: Option<Rgb>,
}

impl CharacterInfo {
    /// Deterministic stand-in used when a tag cannot be resolved.
    pub fn fallback(tag: TagId) -> Self {
        Self {
            name: format!("char_{tag}"),
            color: None,
        }
    }
}

/// Files produced for one story.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoryAssets {
    pub audio: PathBuf,
    pub timeline: Option<PathBuf>,
}

/// Cache-through character lookup. Only successful lookups are cached, so a
/// tag that failed once is retried on its next placement.
pub struct CharacterRegistry {
    provider: Arc<dyn StoryProvider>,
    cache: Mutex<HashMap<TagId, CharacterInfo>>,
}

impl CharacterRegistry {
    pub fn new(provider: Arc<dyn StoryProvider>) -> Self {
        Self {
            provider,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Never fails: provider errors and poisoned caches degrade to
    /// [`CharacterInfo::fallback`].
    pub fn resolve(&self, tag: TagId) -> CharacterInfo {
        match self.cached(tag) {
            Ok(Some(info)) => return info,
            Ok(None) => {}
            Err(err) => warn!(error = %err, "character cache unavailable"),
        }

        match self.provider.character(tag) {
            Ok(info) => {
                debug!(tag, name = %info.name, "resolved character");
                if let Ok(mut cache) = self.lock_cache() {
                    cache.insert(tag, info.clone());
                }
                info
            }
            Err(err) => {
                warn!(tag, error = %err, "character lookup failed, using fallback");
                CharacterInfo::fallback(tag)
            }
        }
    }

    pub fn cached(&self, tag: TagId) -> Result<Option<CharacterInfo>> {
        Ok(self.lock_cache()?.get(&tag).cloned())
    }

    fn lock_cache(&self) -> Result<MutexGuard<'_, HashMap<TagId, CharacterInfo>>> {
        self.cache
            .lock()
            .map_err(|_| StoryboxError::Poisoned("character cache"))
    }
}

impl std::fmt::Debug for CharacterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CharacterRegistry").finish()
    }
}
