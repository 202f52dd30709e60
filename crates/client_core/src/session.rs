use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use shared::{
    cache::{MessageCache, MessageRecord, SessionCache, SessionRecord},
    domain::{ClientMessageId, SessionId, SessionKind, UserId},
    protocol::{MessageKind, UserProfile, WireMessage},
};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::warn;

use crate::{
    directory::{DisplayNames, ProfileCache},
    error::{CoreError, CoreResult},
    message::{ChatMessage, DeliveryState, MergeOutcome, MessageSnapshot},
    transport::Transport,
};

/// A typing signal is shown until this long after its latest refresh.
pub const TYPING_WINDOW: Duration = Duration::from_secs(3);

/// Collaborators shared by the registry and every session it owns. Built once
/// per signed-in identity and dropped on sign-out.
pub struct SessionEnv {
    pub profiles: Arc<ProfileCache>,
    pub transport: Arc<dyn Transport>,
    pub sessions_cache: Arc<dyn SessionCache>,
    pub messages_cache: Arc<dyn MessageCache>,
    /// Session currently focused by the UI; consulted by the unread rule.
    pub selected: RwLock<Option<SessionId>>,
}

impl SessionEnv {
    pub fn new(
        profiles: Arc<ProfileCache>,
        transport: Arc<dyn Transport>,
        sessions_cache: Arc<dyn SessionCache>,
        messages_cache: Arc<dyn MessageCache>,
    ) -> Arc<Self> {
        Arc::new(Self {
            profiles,
            transport,
            sessions_cache,
            messages_cache,
            selected: RwLock::new(None),
        })
    }

    pub fn current_user(&self) -> &UserId {
        self.profiles.current_user()
    }
}

/// Denormalized session header, emitted on every session-updated event and
/// rendered by list rows.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub kind: SessionKind,
    pub peer: UserId,
    pub title: String,
    pub avatar: String,
    pub unread_count: u32,
    pub last_message: String,
    pub last_message_sender: String,
    pub update_at: i64,
}

#[derive(Debug, Default)]
struct TypingState {
    refreshed_at: Option<Instant>,
}

impl TypingState {
    fn refresh(&mut self, now: Instant) {
        self.refreshed_at = Some(now);
    }

    fn is_typing(&self, now: Instant) -> bool {
        self.refreshed_at
            .is_some_and(|at| now.duration_since(at) < TYPING_WINDOW)
    }
}

struct SessionState {
    title: String,
    avatar: String,
    unread_count: u32,
    last_message: String,
    last_message_sender: String,
    update_at: i64,
    /// Message arena; entries are never removed individually, so indices
    /// stay stable for the maps below.
    arena: Vec<ChatMessage>,
    /// Arena indices sorted ascending by the order key each message had when
    /// it was inserted. Later updates never move an entry.
    order: Vec<(i64, usize)>,
    by_client_id: HashMap<ClientMessageId, usize>,
    typing: TypingState,
}

enum PersistOp {
    Add(MessageRecord, SessionRecord),
    Update(MessageRecord),
}

/// One conversation: its ordered, deduplicated message history and the
/// denormalized header the session list renders.
pub struct Session {
    id: SessionId,
    kind: SessionKind,
    peer: UserId,
    env: Arc<SessionEnv>,
    state: Mutex<SessionState>,
    messages_tx: broadcast::Sender<MessageSnapshot>,
    updates_tx: broadcast::Sender<SessionInfo>,
}

impl Session {
    fn build(
        id: SessionId,
        kind: SessionKind,
        peer: UserId,
        env: Arc<SessionEnv>,
        state: SessionState,
    ) -> Arc<Self> {
        let (messages_tx, _) = broadcast::channel(256);
        let (updates_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            id,
            kind,
            peer,
            env,
            state: Mutex::new(state),
            messages_tx,
            updates_tx,
        })
    }

    pub(crate) fn new(
        id: SessionId,
        kind: SessionKind,
        peer: UserId,
        env: Arc<SessionEnv>,
    ) -> Arc<Self> {
        let state = SessionState {
            title: id.0.clone(),
            avatar: String::new(),
            unread_count: 0,
            last_message: "-".to_string(),
            last_message_sender: "-".to_string(),
            update_at: 0,
            arena: Vec::new(),
            order: Vec::new(),
            by_client_id: HashMap::new(),
            typing: TypingState::default(),
        };
        Self::build(id, kind, peer, env, state)
    }

    pub(crate) fn from_record(record: &SessionRecord, env: Arc<SessionEnv>) -> Arc<Self> {
        let state = SessionState {
            title: record.title.clone(),
            avatar: record.avatar.clone(),
            unread_count: record.unread_count,
            last_message: record.last_message.clone(),
            last_message_sender: record.last_message_sender.clone(),
            update_at: record.update_at,
            arena: Vec::new(),
            order: Vec::new(),
            by_client_id: HashMap::new(),
            typing: TypingState::default(),
        };
        Self::build(
            record.session_id.clone(),
            record.kind,
            record.peer.clone(),
            env,
            state,
        )
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn peer(&self) -> &UserId {
        &self.peer
    }

    pub async fn info(&self) -> SessionInfo {
        let state = self.state.lock().await;
        self.info_locked(&state)
    }

    pub async fn update_at(&self) -> i64 {
        self.state.lock().await.update_at
    }

    pub async fn unread_count(&self) -> u32 {
        self.state.lock().await.unread_count
    }

    /// Per-session new-message stream.
    pub fn subscribe_messages(&self) -> broadcast::Receiver<MessageSnapshot> {
        self.messages_tx.subscribe()
    }

    /// Per-session header-change stream (title/avatar/unread/last-message).
    pub fn subscribe_updates(&self) -> broadcast::Receiver<SessionInfo> {
        self.updates_tx.subscribe()
    }

    pub async fn send_text(&self, body: &str) -> CoreResult<MessageSnapshot> {
        self.send(body, MessageKind::Text).await
    }

    pub async fn send_image(&self, url: &str) -> CoreResult<MessageSnapshot> {
        self.send(url, MessageKind::Image).await
    }

    /// Builds a pending message, shows it locally before any network round
    /// trip, then dispatches it. The acknowledged copy merges back in under
    /// the same client id, upgrading the pending row in place.
    pub async fn send(&self, body: &str, kind: MessageKind) -> CoreResult<MessageSnapshot> {
        let me = self.env.current_user().clone();
        let pending = ChatMessage::pending(
            self.id.clone(),
            me.clone(),
            self.peer.clone(),
            body,
            kind,
        );
        let wire = pending.to_wire();
        let client_id = pending.client_id.clone();
        self.absorb(pending).await?;

        match self.env.transport.send_message(self.kind, wire).await {
            Ok(confirmed) => {
                let mut message = ChatMessage::from_wire(self.id.clone(), &me, &confirmed);
                // The confirmation merges under the id we generated even if
                // the server echoed none.
                message.client_id = client_id;
                message.delivery = DeliveryState::Sent;
                self.absorb(message).await
            }
            Err(err) => {
                self.mark_send_failed(&client_id).await;
                Err(CoreError::transport(err))
            }
        }
    }

    /// Merge entry point for traffic arriving from the transport.
    pub async fn on_inbound_message(&self, wire: &WireMessage) -> CoreResult<()> {
        self.env
            .profiles
            .prime(std::slice::from_ref(&wire.from))
            .await;
        let mut message = ChatMessage::from_wire(self.id.clone(), self.env.current_user(), wire);
        if message.from_me {
            message.delivery = DeliveryState::Sent;
        }
        self.absorb(message).await.map(|_| ())
    }

    /// The merge algorithm. Known client ids update in place and keep their
    /// list position; novel ones insert at their sorted position. Conflating
    /// the two paths would produce duplicate rows or lost ordering.
    async fn absorb(&self, incoming: ChatMessage) -> CoreResult<MessageSnapshot> {
        let selected = self.env.selected.read().await.clone();
        let names: &dyn DisplayNames = &*self.env.profiles;

        let (snapshot, info, new_message, persist) = {
            let mut state = self.state.lock().await;
            match state.by_client_id.get(&incoming.client_id).copied() {
                Some(idx) => {
                    let outcome = state.arena[idx].merge(&incoming);
                    let snapshot = state.arena[idx].snapshot();
                    if outcome == MergeOutcome::Rejected {
                        return Ok(snapshot);
                    }
                    let record = state.arena[idx].to_record();
                    let info = self.info_locked(&state);
                    (snapshot, info, false, PersistOp::Update(record))
                }
                None => {
                    let display = incoming.display_content(names);
                    let sender_name = if incoming.from_me {
                        "You".to_string()
                    } else {
                        names.display_name(&incoming.sender)
                    };
                    let counts_as_unread = !incoming.from_me
                        && selected.as_ref() != Some(&self.id);
                    let key = incoming.order_key();
                    let snapshot = incoming.snapshot();
                    let record = incoming.to_record();

                    let idx = state.arena.len();
                    state.arena.push(incoming);
                    let pos = state
                        .order
                        .iter()
                        .position(|(existing, _)| *existing > key)
                        .unwrap_or(state.order.len());
                    state.order.insert(pos, (key, idx));
                    state
                        .by_client_id
                        .insert(snapshot.client_id.clone(), idx);

                    if counts_as_unread {
                        state.unread_count += 1;
                    }
                    state.last_message = display;
                    state.last_message_sender = sender_name;
                    state.update_at = snapshot.send_at;

                    let info = self.info_locked(&state);
                    let session_record = self.record_locked(&state);
                    (snapshot, info, true, PersistOp::Add(record, session_record))
                }
            }
        };

        if new_message {
            let _ = self.messages_tx.send(snapshot.clone());
        }
        let _ = self.updates_tx.send(info);

        match persist {
            PersistOp::Add(message_record, session_record) => {
                self.env
                    .messages_cache
                    .add_message(&message_record)
                    .await
                    .map_err(CoreError::persistence)?;
                self.env
                    .sessions_cache
                    .upsert_session(&session_record)
                    .await
                    .map_err(CoreError::persistence)?;
            }
            PersistOp::Update(message_record) => {
                self.env
                    .messages_cache
                    .update_message(&message_record)
                    .await
                    .map_err(CoreError::persistence)?;
            }
        }

        Ok(snapshot)
    }

    async fn mark_send_failed(&self, client_id: &ClientMessageId) {
        let info = {
            let mut state = self.state.lock().await;
            let Some(&idx) = state.by_client_id.get(client_id) else {
                return;
            };
            state.arena[idx].delivery = DeliveryState::Failed;
            self.info_locked(&state)
        };
        let _ = self.updates_tx.send(info);
    }

    /// Idempotent. Zeroes the counter and pushes the change to listeners and
    /// the durable mirror.
    pub async fn clear_unread(&self) -> CoreResult<()> {
        let (info, record) = {
            let mut state = self.state.lock().await;
            state.unread_count = 0;
            (self.info_locked(&state), self.record_locked(&state))
        };
        let _ = self.updates_tx.send(info);
        self.env
            .sessions_cache
            .upsert_session(&record)
            .await
            .map_err(CoreError::persistence)
    }

    /// Clears the in-memory history first so the UI empties immediately; a
    /// failing durable delete is surfaced but does not bring the rows back.
    pub async fn clear_message_history(&self) -> CoreResult<()> {
        let info = {
            let mut state = self.state.lock().await;
            state.arena.clear();
            state.order.clear();
            state.by_client_id.clear();
            state.last_message = "-".to_string();
            state.last_message_sender = "-".to_string();
            self.info_locked(&state)
        };
        let _ = self.updates_tx.send(info);
        self.env
            .messages_cache
            .delete_messages_for_session(&self.id)
            .await
            .map_err(CoreError::persistence)
    }

    /// Ordered snapshot of the in-memory history. Not a live view.
    pub async fn messages(&self) -> Vec<MessageSnapshot> {
        let state = self.state.lock().await;
        state
            .order
            .iter()
            .map(|&(_, idx)| state.arena[idx].snapshot())
            .collect()
    }

    /// In-memory messages ordered before the given key, or all of them when
    /// no bound is given. An empty result with an empty arena means the
    /// caller should page older history in from the cache or history API.
    pub async fn message_history(&self, before: Option<i64>) -> Vec<MessageSnapshot> {
        let state = self.state.lock().await;
        state
            .order
            .iter()
            .filter(|(key, _)| before.map_or(true, |bound| *key < bound))
            .map(|&(_, idx)| state.arena[idx].snapshot())
            .collect()
    }

    /// Seeds the in-memory history from cached records: no unread counting,
    /// no events, no writes back to the cache.
    pub async fn hydrate(&self, records: &[MessageRecord]) {
        let current_user = self.env.current_user().clone();
        let mut state = self.state.lock().await;
        for record in records {
            let message = ChatMessage::from_record(&current_user, record);
            if state.by_client_id.contains_key(&message.client_id) {
                continue;
            }
            let key = message.order_key();
            let client_id = message.client_id.clone();
            let idx = state.arena.len();
            state.arena.push(message);
            let pos = state
                .order
                .iter()
                .position(|(existing, _)| *existing > key)
                .unwrap_or(state.order.len());
            state.order.insert(pos, (key, idx));
            state.by_client_id.insert(client_id, idx);
        }
    }

    /// Latest-wins typing signal: stays on only while refreshes keep coming.
    pub async fn note_typing(&self) {
        self.state.lock().await.typing.refresh(Instant::now());
    }

    pub async fn is_typing(&self) -> bool {
        self.state.lock().await.typing.is_typing(Instant::now())
    }

    pub(crate) async fn apply_profile(&self, profile: &UserProfile) {
        let (info, record) = {
            let mut state = self.state.lock().await;
            state.title = profile.display_name.clone();
            state.avatar = profile.avatar_url.clone();
            (self.info_locked(&state), self.record_locked(&state))
        };
        let _ = self.updates_tx.send(info);
        if let Err(err) = self.env.sessions_cache.upsert_session(&record).await {
            warn!(session_id = %self.id, "failed to persist session metadata: {err}");
        }
    }

    fn info_locked(&self, state: &SessionState) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            kind: self.kind,
            peer: self.peer.clone(),
            title: state.title.clone(),
            avatar: state.avatar.clone(),
            unread_count: state.unread_count,
            last_message: state.last_message.clone(),
            last_message_sender: state.last_message_sender.clone(),
            update_at: state.update_at,
        }
    }

    fn record_locked(&self, state: &SessionState) -> SessionRecord {
        SessionRecord {
            session_id: self.id.clone(),
            kind: self.kind,
            peer: self.peer.clone(),
            title: state.title.clone(),
            avatar: state.avatar.clone(),
            unread_count: state.unread_count,
            last_message: state.last_message.clone(),
            last_message_sender: state.last_message_sender.clone(),
            update_at: state.update_at,
        }
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
