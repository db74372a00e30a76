//! Session lifecycle: login, logout, token refresh and the proactive refresh
//! timer.
//!
//! [`SessionManager`] is the single owner of the [`Session`]. It hands the
//! transport a token supplier, listens for its unauthorized notifications and
//! tells it to replay or discard parked requests once a refresh resolves.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use super::claims;
use super::session::{refresh_delay, Session, SessionInfo, SessionState, TokenPair};
use crate::api::{execute, ApiError, ApiRequest, ApiTransport, RequestIssuer, TransportEvent};
use crate::config::{ClientConfig, ConfigError};
use crate::models::{decode_user, TokenResponse, User};
use crate::utils::validation;

pub const LOGIN_ENDPOINT: &str = "/auth/login";
pub const LOGOUT_ENDPOINT: &str = "/auth/logout";
pub const REFRESH_ENDPOINT: &str = "/auth/refresh";
pub const CURRENT_USER_ENDPOINT: &str = "/auth/me";

/// Buffered session events per subscriber before the oldest are dropped.
const EVENT_CAPACITY: usize = 32;

/// Session lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    LoggedIn { user_id: Option<u64> },
    TokensRefreshed,
    RefreshFailed(ApiError),
    /// A refresh failed and the session was cleared. Sent once per failure.
    SessionExpired,
    LoggedOut,
    CurrentUserLoaded(User),
}

struct ManagerInner {
    transport: Arc<dyn RequestIssuer>,
    session: Mutex<Session>,
    events: broadcast::Sender<SessionEvent>,
}

impl ManagerInner {
    fn lock_session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Cheap to clone; clones share one session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    /// Wire a manager to a transport and the receiving end of its event
    /// channel. Must be called within a tokio runtime.
    pub fn new(
        transport: Arc<dyn RequestIssuer>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new(ManagerInner {
            transport,
            session: Mutex::new(Session::new()),
            events: tx,
        });

        let weak = Arc::downgrade(&inner);
        inner.transport.set_token_supplier(Arc::new(move || {
            let inner = weak.upgrade()?;
            let token = inner.lock_session().access_token().map(str::to_string);
            token
        }));

        tokio::spawn(listen_for_transport_events(Arc::downgrade(&inner), events));

        Self { inner }
    }

    /// Build the HTTP transport from configuration and wire a manager to it.
    pub fn connect(config: &ClientConfig) -> Result<Self, ConfigError> {
        let (transport, events) = ApiTransport::new(config)?;
        Ok(Self::new(Arc::new(transport), events))
    }

    /// The transport this session authenticates, for other services to share.
    pub fn transport(&self) -> Arc<dyn RequestIssuer> {
        Arc::clone(&self.inner.transport)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn info(&self) -> SessionInfo {
        self.inner.lock_session().info()
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock_session().state()
    }

    pub fn user_id(&self) -> Option<u64> {
        self.inner.lock_session().user_id()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.lock_session().is_authenticated()
    }

    /// Log in with email and password.
    ///
    /// Input is checked locally first; a malformed email or empty password
    /// fails with [`ApiError::Validation`] without touching the network.
    pub async fn login(&self, email: &str, password: &str) -> Result<SessionInfo, ApiError> {
        if !validation::is_valid_email(email) {
            return Err(ApiError::Validation("Invalid email format".to_string()));
        }
        if !validation::is_non_empty(password) {
            return Err(ApiError::Validation("Password cannot be empty".to_string()));
        }

        self.inner.lock_session().set_state(SessionState::Authenticating);
        info!("Logging in");

        let request = ApiRequest::post(LOGIN_ENDPOINT)
            .with_json(json!({ "email": email, "password": password }))
            .without_reauth();

        match self.request_tokens(request).await {
            Ok(tokens) => {
                let (info, superseded) = {
                    let mut session = self.inner.lock_session();
                    let superseded = session.supersede();
                    session.apply_tokens(tokens);
                    self.arm_refresh_timer(&mut session);
                    (session.info(), superseded)
                };
                if superseded {
                    debug!("Login replaced a session that was refreshing");
                    self.inner.transport.replay_pending();
                }
                info!(user_id = ?info.user_id, "Login successful");
                self.inner.emit(SessionEvent::LoggedIn {
                    user_id: info.user_id,
                });
                Ok(info)
            }
            Err(e) => {
                let mut session = self.inner.lock_session();
                if session.state() == SessionState::Authenticating {
                    let fallback = if session.access_token().is_some() {
                        SessionState::Authenticated
                    } else {
                        SessionState::Anonymous
                    };
                    session.set_state(fallback);
                }
                warn!(error = %e, "Login failed");
                Err(e)
            }
        }
    }

    /// Log out on the server, then forget the local session.
    ///
    /// Local state is only cleared when the server confirms; on failure the
    /// session is left as it was.
    pub async fn logout(&self) -> Result<(), ApiError> {
        info!("Logging out");
        let request = ApiRequest::post(LOGOUT_ENDPOINT);
        if let Err(failure) = execute(self.inner.transport.as_ref(), request).await {
            let e = ApiError::from(failure);
            warn!(error = %e, "Logout failed, keeping local session");
            return Err(e);
        }

        self.inner.lock_session().clear();
        info!("Logged out");
        self.inner.emit(SessionEvent::LoggedOut);
        Ok(())
    }

    /// Exchange the refresh token for a new token pair.
    ///
    /// Returns immediately if a refresh is already running. On success parked
    /// requests are replayed; on failure they are discarded, the session is
    /// cleared and [`SessionEvent::SessionExpired`] is sent.
    pub async fn refresh(&self) -> Result<(), ApiError> {
        let (refresh_token, generation) = {
            let mut session = self.inner.lock_session();
            if session.is_refreshing() {
                debug!("Token refresh already in progress");
                return Ok(());
            }
            let Some(token) = session.refresh_token().map(str::to_string) else {
                drop(session);
                warn!("No refresh token, dropping queued requests");
                self.inner.transport.discard_pending();
                return Err(ApiError::Validation("Refresh token cannot be empty".to_string()));
            };
            session.begin_refresh();
            (token, session.generation())
        };

        info!("Refreshing access token");
        let request = ApiRequest::post(REFRESH_ENDPOINT)
            .with_json(json!({ "refresh_token": refresh_token }))
            .without_reauth();
        let result = self.request_tokens(request).await;

        let mut session = self.inner.lock_session();
        if session.generation() != generation {
            // A newer login already replayed the queue and owns it now
            let replaced = session.access_token().is_some();
            drop(session);
            if replaced {
                debug!("Session replaced while refreshing, dropping refresh result");
                return Err(ApiError::Authentication(
                    "Session replaced during token refresh".to_string(),
                ));
            }
            debug!("Session ended while refreshing, dropping refresh result");
            self.inner.transport.discard_pending();
            return Err(ApiError::Authentication(
                "Session ended during token refresh".to_string(),
            ));
        }

        match result {
            Ok(mut tokens) => {
                // Servers that do not rotate refresh tokens omit it
                if tokens.refresh_token.is_empty() {
                    tokens.refresh_token = refresh_token;
                }
                session.apply_tokens(tokens);
                session.finish_refresh();
                self.arm_refresh_timer(&mut session);
                drop(session);

                info!("Access token refreshed");
                self.inner.transport.replay_pending();
                self.inner.emit(SessionEvent::TokensRefreshed);
                Ok(())
            }
            Err(e) => {
                session.clear();
                drop(session);

                warn!(error = %e, "Token refresh failed, session expired");
                self.inner.transport.discard_pending();
                self.inner.emit(SessionEvent::RefreshFailed(e.clone()));
                self.inner.emit(SessionEvent::SessionExpired);
                Err(e)
            }
        }
    }

    /// Fetch the signed-in user and adopt its id for the session.
    pub async fn current_user(&self) -> Result<User, ApiError> {
        let request = ApiRequest::get(CURRENT_USER_ENDPOINT);
        let reply = execute(self.inner.transport.as_ref(), request).await?;
        let user = decode_user(&reply.body)?;

        if user.id > 0 {
            self.inner.lock_session().set_user_id(user.id as u64);
        }
        debug!(user_id = user.id, "Loaded current user");
        self.inner.emit(SessionEvent::CurrentUserLoaded(user.clone()));
        Ok(user)
    }

    /// (Re)arm the proactive refresh timer from the current access token.
    pub fn start_refresh_timer(&self) {
        let mut session = self.inner.lock_session();
        self.arm_refresh_timer(&mut session);
    }

    pub fn stop_refresh_timer(&self) {
        self.inner.lock_session().disarm_timer();
    }

    async fn request_tokens(&self, request: ApiRequest) -> Result<TokenPair, ApiError> {
        let reply = execute(self.inner.transport.as_ref(), request).await?;
        reply.json::<TokenResponse>()?.into_tokens()
    }

    fn arm_refresh_timer(&self, session: &mut Session) {
        session.disarm_timer();

        let Some(expires_in) = session.access_token().and_then(claims::expires_in_secs) else {
            debug!("Access token carries no expiry, proactive refresh disabled");
            return;
        };

        let delay = refresh_delay(expires_in);
        let Some(deadline) = Instant::now().checked_add(delay) else {
            debug!(expires_in, "Token expiry too far ahead, proactive refresh disabled");
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            sleep_until(deadline).await;
            if let Some(inner) = weak.upgrade() {
                SessionManager { inner }.on_refresh_timer(deadline).await;
            }
        });
        session.arm_timer(deadline, task.abort_handle());
        debug!(expires_in, delay_secs = delay.as_secs(), "Proactive token refresh scheduled");
    }

    async fn on_refresh_timer(&self, deadline: Instant) {
        let due = {
            let mut session = self.inner.lock_session();
            // Release the slot first so the re-arm after refresh does not
            // abort this task
            session.take_fired_timer(deadline)
                && session.refresh_token().is_some()
                && !session.is_refreshing()
        };
        if !due {
            return;
        }

        info!("Access token nearing expiry, refreshing");
        if let Err(e) = self.refresh().await {
            debug!(error = %e, "Proactive refresh failed");
        }
    }

    async fn handle_unauthorized(&self) {
        if let Err(e) = self.refresh().await {
            debug!(error = %e, "Refresh after unauthorized response failed");
        }
    }
}

async fn listen_for_transport_events(
    weak: Weak<ManagerInner>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = weak.upgrade() else {
            break;
        };
        let manager = SessionManager { inner };
        match event {
            TransportEvent::Unauthorized => manager.handle_unauthorized().await,
        }
    }
    debug!("Transport event listener stopped");
}
