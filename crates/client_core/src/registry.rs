use std::{
    collections::HashMap,
    sync::{Arc, PoisonError},
};

use shared::{
    domain::{SessionId, SessionKind, UserId},
    protocol::WireMessage,
};
use tokio::sync::Mutex;

use crate::{
    api::SessionListing,
    error::{CoreError, CoreResult},
    session::{Session, SessionEnv},
};

pub type SetChangedListener = Box<dyn Fn(&SessionId) + Send + Sync>;

struct RegistryState {
    sessions: HashMap<SessionId, Arc<Session>>,
    cache_loaded: bool,
}

/// The authoritative map of live sessions for one signed-in identity. Every
/// lookup, creation and inbound route goes through here, so at most one
/// `Session` instance exists per id.
pub struct SessionRegistry {
    env: Arc<SessionEnv>,
    listing: Arc<dyn SessionListing>,
    state: Mutex<RegistryState>,
    set_listener: std::sync::Mutex<Option<SetChangedListener>>,
}

impl SessionRegistry {
    pub fn new(env: Arc<SessionEnv>, listing: Arc<dyn SessionListing>) -> Arc<Self> {
        Arc::new(Self {
            env,
            listing,
            state: Mutex::new(RegistryState {
                sessions: HashMap::new(),
                cache_loaded: false,
            }),
            set_listener: std::sync::Mutex::new(None),
        })
    }

    /// Pure lookup; never creates.
    pub async fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.state.lock().await.sessions.get(id).map(Arc::clone)
    }

    /// Returns the session for `peer`, creating and registering it on first
    /// reference. Title and avatar are enriched asynchronously; until the
    /// directory answers, the session displays its id.
    pub async fn get_or_create(self: &Arc<Self>, peer: &UserId, kind: SessionKind) -> Arc<Session> {
        let id = SessionId::derive(kind, self.env.current_user(), peer);
        let session = {
            let mut state = self.state.lock().await;
            if let Some(existing) = state.sessions.get(&id) {
                return Arc::clone(existing);
            }
            let session = Session::new(id.clone(), kind, peer.clone(), Arc::clone(&self.env));
            state.sessions.insert(id.clone(), Arc::clone(&session));
            session
        };
        self.notify_set_changed(&id);
        self.spawn_enrichment(Arc::clone(&session));
        session
    }

    fn spawn_enrichment(&self, session: Arc<Session>) {
        let profiles = Arc::clone(&self.env.profiles);
        tokio::spawn(async move {
            let profile = profiles.resolve(session.peer()).await;
            session.apply_profile(&profile).await;
        });
    }

    /// All sessions, most recently updated first.
    pub async fn list(&self) -> Vec<Arc<Session>> {
        let sessions: Vec<Arc<Session>> = {
            let state = self.state.lock().await;
            state.sessions.values().cloned().collect()
        };
        let mut keyed = Vec::with_capacity(sessions.len());
        for session in sessions {
            keyed.push((session.update_at().await, session));
        }
        keyed.sort_by(|a, b| b.0.cmp(&a.0));
        keyed.into_iter().map(|(_, session)| session).collect()
    }

    /// Reconciles the in-memory set against the server listing, creating any
    /// missing sessions and leaving existing ones untouched. The first call
    /// after sign-in also restores sessions from the durable cache.
    pub async fn refresh(self: &Arc<Self>) -> CoreResult<Vec<Arc<Session>>> {
        let needs_load = !self.state.lock().await.cache_loaded;
        if needs_load {
            self.load_cached().await?;
            self.state.lock().await.cache_loaded = true;
        }

        let summaries = self
            .listing
            .list_sessions()
            .await
            .map_err(CoreError::transport)?;
        for summary in summaries {
            let _ = self.get_or_create(&summary.to, summary.kind).await;
        }
        Ok(self.list().await)
    }

    async fn load_cached(&self) -> CoreResult<()> {
        let records = self
            .env
            .sessions_cache
            .get_all_sessions()
            .await
            .map_err(CoreError::persistence)?;
        for record in records {
            let id = record.session_id.clone();
            let inserted = {
                let mut state = self.state.lock().await;
                if state.sessions.contains_key(&id) {
                    false
                } else {
                    state
                        .sessions
                        .insert(id.clone(), Session::from_record(&record, Arc::clone(&self.env)));
                    true
                }
            };
            if inserted {
                self.notify_set_changed(&id);
            }
        }
        Ok(())
    }

    /// Routes one inbound message to its session, creating the session
    /// synchronously first if this is the opening message of a new
    /// conversation. No inbound message is ever dropped for "session not
    /// found".
    pub async fn route_inbound(
        self: &Arc<Self>,
        kind: SessionKind,
        message: &WireMessage,
    ) -> CoreResult<()> {
        let me = self.env.current_user();
        let peer = match kind {
            SessionKind::Channel => message.to.clone(),
            SessionKind::Direct => {
                if message.from == *me {
                    message.to.clone()
                } else {
                    message.from.clone()
                }
            }
        };
        let session = self.get_or_create(&peer, kind).await;
        session.on_inbound_message(message).await
    }

    /// Deletes a session and its persisted history. Session removal is a
    /// registry-level operation; sessions are never destroyed from inside.
    pub async fn remove(&self, id: &SessionId) -> CoreResult<()> {
        let removed = self.state.lock().await.sessions.remove(id);
        if removed.is_some() {
            self.notify_set_changed(id);
        }
        self.env
            .sessions_cache
            .remove_session(id)
            .await
            .map_err(CoreError::persistence)?;
        self.env
            .messages_cache
            .delete_messages_for_session(id)
            .await
            .map_err(CoreError::persistence)
    }

    /// Installs the single session-set-changed listener, replacing any
    /// previous one. Pass `None` to detach.
    pub fn set_update_listener(&self, listener: Option<SetChangedListener>) {
        *self
            .set_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = listener;
    }

    fn notify_set_changed(&self, id: &SessionId) {
        let guard = self
            .set_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(listener) = guard.as_ref() {
            listener(id);
        }
    }

    /// Marks the session currently focused by the UI; new messages for it do
    /// not count as unread.
    pub async fn set_selected(&self, id: Option<SessionId>) {
        *self.env.selected.write().await = id;
    }

    pub async fn selected(&self) -> Option<SessionId> {
        self.env.selected.read().await.clone()
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
