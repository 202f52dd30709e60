use std::sync::{Arc, PoisonError};

use anyhow::Result;
use futures::StreamExt;
use shared::{
    cache::{MessageCache, SessionCache},
    domain::{SessionKind, UserId},
    protocol::TransportFrame,
};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::warn;

pub mod api;
pub mod config;
pub mod directory;
pub mod error;
pub mod message;
pub mod registry;
pub mod session;
pub mod transport;

pub use api::{ApiClient, HistoryFetch, MissingListing, SessionListing};
pub use config::{load_settings, ClientConfig};
pub use directory::{Directory, DisplayNames, MissingDirectory, ProfileCache};
pub use error::{CoreError, CoreResult};
pub use message::{ChatMessage, DeliveryState, MergeOutcome, MessageSnapshot};
pub use registry::{SessionRegistry, SetChangedListener};
pub use session::{Session, SessionEnv, SessionInfo};
pub use transport::{MissingTransport, Transport, WsTransport};

/// Everything the engine needs for one signed-in identity. Constructed at
/// sign-in, passed to whoever needs it, dropped at sign-out; there is no
/// process-global state.
pub struct ClientContext {
    config: ClientConfig,
    env: Arc<SessionEnv>,
    registry: Arc<SessionRegistry>,
    pump: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ClientContext {
    pub fn new(
        config: ClientConfig,
        current_user: UserId,
        transport: Arc<dyn Transport>,
        directory: Arc<dyn Directory>,
        listing: Arc<dyn SessionListing>,
        sessions_cache: Arc<dyn SessionCache>,
        messages_cache: Arc<dyn MessageCache>,
    ) -> Arc<Self> {
        let profiles = Arc::new(ProfileCache::new(current_user, directory));
        let env = SessionEnv::new(profiles, transport, sessions_cache, messages_cache);
        let registry = SessionRegistry::new(Arc::clone(&env), listing);
        Arc::new(Self {
            config,
            env,
            registry,
            pump: std::sync::Mutex::new(None),
        })
    }

    /// Wires a context from configuration alone: per-identity sqlite store,
    /// HTTP api client for directory and listing, websocket transport.
    pub async fn bootstrap(config: ClientConfig, current_user: UserId) -> Result<Arc<Self>> {
        let database_url = storage::database_url_for_identity(&config.data_dir, &current_user);
        let store = Arc::new(storage::Storage::new(&database_url).await?);
        let api = Arc::new(ApiClient::new(
            config.api_base_url.clone(),
            current_user.clone(),
        ));
        let transport = WsTransport::connect(&config.ws_url, config.send_ack_timeout()).await?;

        Ok(Self::new(
            config,
            current_user,
            transport,
            Arc::clone(&api) as Arc<dyn Directory>,
            api as Arc<dyn SessionListing>,
            Arc::clone(&store) as Arc<dyn SessionCache>,
            store as Arc<dyn MessageCache>,
        ))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn current_user(&self) -> &UserId {
        self.env.current_user()
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn profiles(&self) -> &Arc<ProfileCache> {
        &self.env.profiles
    }

    /// Starts forwarding the transport's inbound stream into the registry.
    /// Calling it again replaces the previous pump.
    pub fn start(&self) {
        let mut inbound = BroadcastStream::new(self.env.transport.subscribe_inbound());
        let registry = Arc::clone(&self.registry);
        let handle = tokio::spawn(async move {
            while let Some(frame) = inbound.next().await {
                match frame {
                    Ok(TransportFrame::DirectMessage { message }) => {
                        if let Err(err) =
                            registry.route_inbound(SessionKind::Direct, &message).await
                        {
                            warn!("failed to absorb direct message: {err}");
                        }
                    }
                    Ok(TransportFrame::ChannelMessage { message }) => {
                        if let Err(err) =
                            registry.route_inbound(SessionKind::Channel, &message).await
                        {
                            warn!("failed to absorb channel message: {err}");
                        }
                    }
                    // Acks are resolved inside the transport's send path.
                    Ok(TransportFrame::Ack { .. }) => {}
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(skipped, "inbound stream lagged; messages were dropped");
                    }
                }
            }
        });
        let previous = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Stops the inbound pump. Dropping the last reference afterwards
    /// releases the registry, its sessions and all collaborators.
    pub fn shutdown(&self) {
        let handle = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

impl Drop for ClientContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}
