/// Client facade: session, caches, push channel and reconciler for one process
use crate::backend::{Backend, HttpBackend};
use crate::cache::{CacheKey, CacheStore};
use crate::config::Config;
use crate::error::{ClientError, Result};
use crate::model::{ConnectionSummary, Conversation, Principal};
use crate::push::PushChannel;
use crate::reconciler::ConversationReconciler;
use crate::session::Session;
use crate::utils::Notifier;
use crate::view::ConversationView;
use std::sync::{Arc, Mutex};
use tokio::time::timeout;
use tracing::{info, warn};

pub struct Client<B: Backend> {
    config: Config,
    backend: Arc<B>,
    session: Session,
    conversations: Arc<CacheStore<Conversation>>,
    connections: CacheStore<Vec<ConnectionSummary>>,
    notifier: Notifier,
    reconciler: Mutex<Option<Arc<ConversationReconciler<B>>>>,
}

impl Client<HttpBackend> {
    /// Client talking to the configured REST backend
    pub fn connect_http(config: Config) -> Result<Self> {
        let backend = HttpBackend::new(&config)?;
        Ok(Self::new(config, backend))
    }
}

impl<B: Backend> Client<B> {
    pub fn new(config: Config, backend: B) -> Self {
        Self {
            config,
            backend: Arc::new(backend),
            session: Session::new(),
            conversations: Arc::new(CacheStore::new()),
            connections: CacheStore::new(),
            notifier: Notifier::new(),
            reconciler: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn conversations(&self) -> &Arc<CacheStore<Conversation>> {
        &self.conversations
    }

    /// Ask the backend who the session belongs to: a user first, then a company
    pub async fn restore_session(&self) -> Result<Option<Principal>> {
        let principal = match self.bounded(self.backend.authenticated_user()).await {
            Ok(Some(user)) => Some(Principal::User(user)),
            Ok(None) => match self.bounded(self.backend.authenticated_company()).await {
                Ok(company) => company.map(Principal::Company),
                Err(e) => return Err(self.report("Session check failed", e)),
            },
            Err(e) => return Err(self.report("Session check failed", e)),
        };

        match &principal {
            Some(p) => {
                info!("Session belongs to {} ({})", p.identity().display_name, p.identity().id);
                self.session.establish(p.clone());
            }
            None => {
                self.session.clear();
            }
        }
        Ok(principal)
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<Principal> {
        let email = email.trim();
        if email.is_empty() || password.is_empty() {
            return Err(ClientError::Validation(
                "email and password are required".to_string(),
            ));
        }

        if let Err(e) = self.bounded(self.backend.login_user(email, password)).await {
            return Err(self.report("Login failed", e));
        }
        match self.restore_session().await? {
            Some(principal) => {
                self.notifier.info("Login successful");
                Ok(principal)
            }
            None => Err(self.report(
                "Login failed",
                ClientError::Unauthorized("login did not establish a session".to_string()),
            )),
        }
    }

    /// End the session. Local state is dropped even when the backend call fails.
    pub async fn logout(&self) -> Result<()> {
        let Some(principal) = self.session.current() else {
            return Ok(());
        };

        let outcome = self
            .bounded(self.backend.logout(!principal.is_user()))
            .await;

        self.session.clear();
        self.conversations.clear().await;
        self.connections.clear().await;
        if let Some(reconciler) = lock_reconciler(&self.reconciler).take() {
            reconciler.push().shutdown();
        }
        info!("Logged out {}", principal.identity().id);

        match outcome {
            Ok(()) => {
                self.notifier.info("Logout successful");
                Ok(())
            }
            Err(e) => Err(self.report("Logout failed on the server", e)),
        }
    }

    /// Accepted connections of the logged-in user (the messaging screen)
    pub async fn inbox(&self) -> Result<Vec<ConnectionSummary>> {
        let user_id = self.session.user_id().ok_or(ClientError::NotAuthenticated)?;
        let key = CacheKey::connections(&user_id);
        if !self.connections.is_stale(&key).await {
            if let Some(cached) = self.connections.value(&key).await {
                return Ok(cached);
            }
        }
        let fetch = self.bounded(self.backend.connections());
        self.connections
            .fetch_with(&key, fetch)
            .await
            .map_err(|e| self.report("Connections could not be loaded", e))
    }

    pub async fn refresh_inbox(&self) -> bool {
        match self.session.user_id() {
            Some(user_id) => self.connections.invalidate(&CacheKey::connections(&user_id)).await,
            None => false,
        }
    }

    /// Reconciler for the logged-in user, created on first use.
    ///
    /// Creating it does not connect; the push channel starts with the first view.
    pub fn reconciler(&self) -> Result<Arc<ConversationReconciler<B>>> {
        let user_id = self.session.user_id().ok_or(ClientError::NotAuthenticated)?;
        let mut slot = lock_reconciler(&self.reconciler);
        if let Some(existing) = slot.as_ref() {
            if existing.push().self_id() == user_id {
                return Ok(existing.clone());
            }
            warn!("Session user changed, replacing push channel");
            existing.push().shutdown();
        }

        let reconciler = Arc::new(ConversationReconciler::new(
            self.backend.clone(),
            self.session.clone(),
            self.conversations.clone(),
            PushChannel::new(&self.config, user_id),
            self.notifier.clone(),
            self.config.request_timeout,
        ));
        *slot = Some(reconciler.clone());
        Ok(reconciler)
    }

    /// Enter the conversation with `peer_id`. Only users can message.
    pub fn open_conversation(&self, peer_id: &str) -> Result<ConversationView<B>> {
        ConversationView::open(self.reconciler()?, peer_id)
    }

    /// One-shot fetch of a conversation, bypassing views
    pub async fn conversation(&self, peer_id: &str) -> Result<Option<Conversation>> {
        self.reconciler()?.fetch(peer_id).await
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        timeout(self.config.request_timeout, fut).await.map_err(|_| {
            ClientError::Timeout(format!(
                "request took longer than {:?}",
                self.config.request_timeout
            ))
        })?
    }

    fn report(&self, context: &str, e: ClientError) -> ClientError {
        self.notifier.error(format!("{}: {}", context, e));
        e
    }
}

fn lock_reconciler<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
