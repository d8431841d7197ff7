//! Wires the session components together.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::account::Account;
use crate::api::ApiClient;
use crate::auth::{AuthApi, RefreshCoordinator, RehydrateOutcome, Rehydrator};
use crate::config::Config;
use crate::notify::{LogNotifier, Notifier};
use crate::orders::OrderSink;
use crate::realtime::{RealtimeCoordinator, RealtimeHandle, RealtimeTransport};
use crate::session::SessionStore;
use crate::storage::{FileStorage, SecureStorage};
use crate::transport::{HttpTransport, ReqwestTransport};

/// One signed-in (or signed-out) client: a single Session Store shared by
/// the interceptor, the account operations, the rehydrator and any realtime
/// coordinator started from it.
pub struct Courier {
    config: Config,
    session: Arc<SessionStore>,
    refresh: RefreshCoordinator,
    api: ApiClient,
    account: Account,
    rehydrator: Rehydrator,
}

impl Courier {
    pub fn new(
        config: Config,
        http: Arc<dyn HttpTransport>,
        storage: Arc<dyn SecureStorage>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let session = Arc::new(SessionStore::new());
        let auth = AuthApi::new(Arc::clone(&http), config.refresh.clone());
        let refresh = RefreshCoordinator::new(
            auth.clone(),
            Arc::clone(&storage),
            Arc::clone(&session),
            Arc::clone(&notifier),
        );
        let api = ApiClient::new(
            http,
            Arc::clone(&session),
            refresh.clone(),
            Arc::clone(&notifier),
        );
        let account = Account::new(
            auth.clone(),
            api.clone(),
            Arc::clone(&storage),
            Arc::clone(&session),
        );
        let rehydrator = Rehydrator::new(auth, storage, Arc::clone(&session), notifier);

        Self {
            config,
            session,
            refresh,
            api,
            account,
            rehydrator,
        }
    }

    /// Builds a client with the default collaborators: reqwest against
    /// `config.api_url`, file storage under the courier home, and a
    /// log-only notifier.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn from_config(config: Config) -> Result<Self> {
        let http = ReqwestTransport::new(&config.api_url, config.request_timeout())
            .with_context(|| format!("Failed to create HTTP client for {}", config.api_url))?;
        info!(api_url = %config.api_url, "courier client ready");
        Ok(Self::new(
            config,
            Arc::new(http),
            Arc::new(FileStorage::default()),
            Arc::new(LogNotifier),
        ))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn session(&self) -> &Arc<SessionStore> {
        &self.session
    }

    pub fn refresh(&self) -> &RefreshCoordinator {
        &self.refresh
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    /// Restores the previous session from the stored refresh token. Await
    /// this before choosing between the signed-in and signed-out routes.
    pub async fn rehydrate(&self) -> RehydrateOutcome {
        self.rehydrator.rehydrate().await
    }

    /// Starts keeping a realtime channel open while this client is signed in.
    pub fn start_realtime(
        &self,
        transport: Arc<dyn RealtimeTransport>,
        sink: Arc<dyn OrderSink>,
    ) -> RealtimeHandle {
        RealtimeCoordinator::new(transport, sink, self.config.realtime.clone())
            .spawn(self.session.subscribe())
    }
}
