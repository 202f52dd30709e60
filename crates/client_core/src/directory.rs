use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::{domain::UserId, protocol::UserProfile};
use tracing::warn;

/// Identity/directory collaborator: batched display-metadata lookup.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Resolves display metadata for the given ids. Partial results are
    /// allowed; callers substitute fallbacks for ids that stay unresolved.
    async fn resolve_users(&self, ids: &[UserId]) -> Result<Vec<UserProfile>>;
}

pub struct MissingDirectory;

#[async_trait]
impl Directory for MissingDirectory {
    async fn resolve_users(&self, _ids: &[UserId]) -> Result<Vec<UserProfile>> {
        Err(anyhow!("directory resolver is unavailable"))
    }
}

/// Synchronous view over resolved display metadata, with a deterministic
/// fallback for ids that never resolved.
pub trait DisplayNames: Send + Sync {
    fn display_name(&self, id: &UserId) -> String;
    fn is_current_user(&self, id: &UserId) -> bool;
}

/// Read-through cache over a [`Directory`]. Lookup failures stop here: every
/// consumer gets a profile, falling back to the raw id as display name, and
/// no error propagates further.
pub struct ProfileCache {
    current_user: UserId,
    directory: Arc<dyn Directory>,
    profiles: RwLock<HashMap<UserId, UserProfile>>,
}

impl ProfileCache {
    pub fn new(current_user: UserId, directory: Arc<dyn Directory>) -> Self {
        Self {
            current_user,
            directory,
            profiles: RwLock::new(HashMap::new()),
        }
    }

    pub fn current_user(&self) -> &UserId {
        &self.current_user
    }

    pub fn peek(&self, id: &UserId) -> Option<UserProfile> {
        self.profiles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn fallback(id: &UserId) -> UserProfile {
        UserProfile {
            user_id: id.clone(),
            display_name: id.0.clone(),
            avatar_url: String::new(),
        }
    }

    fn store(&self, profiles: Vec<UserProfile>) {
        let mut guard = self
            .profiles
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for profile in profiles {
            guard.insert(profile.user_id.clone(), profile);
        }
    }

    /// Resolves one id, consulting the cache first. A failed or partial
    /// lookup yields the raw-id fallback; the fallback is not cached so a
    /// later lookup can still succeed.
    pub async fn resolve(&self, id: &UserId) -> UserProfile {
        if let Some(profile) = self.peek(id) {
            return profile;
        }

        match self.directory.resolve_users(std::slice::from_ref(id)).await {
            Ok(profiles) => {
                self.store(profiles);
                self.peek(id).unwrap_or_else(|| {
                    warn!(user_id = %id, "directory returned no profile; using fallback");
                    Self::fallback(id)
                })
            }
            Err(err) => {
                warn!(user_id = %id, "directory lookup failed: {err}; using fallback");
                Self::fallback(id)
            }
        }
    }

    /// Warms the cache for a batch of ids, ignoring failures. Display reads
    /// fall back per id until a later lookup succeeds.
    pub async fn prime(&self, ids: &[UserId]) {
        let missing: Vec<UserId> = {
            let guard = self
                .profiles
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            ids.iter()
                .filter(|id| !guard.contains_key(*id))
                .cloned()
                .collect()
        };
        if missing.is_empty() {
            return;
        }

        match self.directory.resolve_users(&missing).await {
            Ok(profiles) => self.store(profiles),
            Err(err) => warn!("directory batch lookup failed: {err}"),
        }
    }
}

impl DisplayNames for ProfileCache {
    fn display_name(&self, id: &UserId) -> String {
        self.peek(id)
            .map(|profile| profile.display_name)
            .unwrap_or_else(|| id.0.clone())
    }

    fn is_current_user(&self, id: &UserId) -> bool {
        *id == self.current_user
    }
}

#[cfg(test)]
#[path = "tests/directory_tests.rs"]
mod tests;
