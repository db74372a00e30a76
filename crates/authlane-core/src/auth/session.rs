use std::fmt;
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio::time::Instant;

use super::claims;

/// Refresh this long before the access token expires.
pub const REFRESH_BEFORE_EXPIRY_SECS: i64 = 60;

/// Never schedule a refresh sooner than this.
pub const MIN_REFRESH_DELAY_SECS: i64 = 1;

pub const DEFAULT_TOKEN_TYPE: &str = "Bearer";

/// Delay before proactively refreshing a token with `expires_in` seconds left.
///
/// Normally one minute ahead of expiry. Tokens living less than two minutes
/// are refreshed at their halfway point instead, and the result is never
/// below one second.
pub fn refresh_delay(expires_in: i64) -> Duration {
    let secs = if expires_in < REFRESH_BEFORE_EXPIRY_SECS * 2 {
        expires_in / 2
    } else {
        expires_in - REFRESH_BEFORE_EXPIRY_SECS
    };
    Duration::from_secs(secs.max(MIN_REFRESH_DELAY_SECS) as u64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Anonymous,
    Authenticating,
    Authenticated,
    Refreshing,
}

/// Tokens issued by the login and refresh endpoints.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("token_type", &self.token_type)
            .finish()
    }
}

/// Read-only view of the session, safe to hand to callers and to log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub state: SessionState,
    pub user_id: Option<u64>,
    pub token_type: Option<String>,
    /// Seconds until the access token expires, if it carries an expiry.
    pub expires_in: Option<i64>,
    pub has_refresh_token: bool,
    /// Time left until the proactive refresh fires, if one is scheduled.
    pub refresh_scheduled_in: Option<Duration>,
}

struct RefreshTimer {
    deadline: Instant,
    handle: AbortHandle,
}

/// Token state owned by the session manager.
#[derive(Default)]
pub struct Session {
    access_token: String,
    refresh_token: String,
    token_type: String,
    user_id: Option<u64>,
    state: SessionState,
    refreshing: bool,
    refresh_timer: Option<RefreshTimer>,
    /// Bumped whenever the session is cleared, so an in-flight refresh can
    /// tell that the session it belonged to is gone.
    generation: u64,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    pub fn access_token(&self) -> Option<&str> {
        Some(self.access_token.as_str()).filter(|t| !t.is_empty())
    }

    pub fn refresh_token(&self) -> Option<&str> {
        Some(self.refresh_token.as_str()).filter(|t| !t.is_empty())
    }

    pub fn user_id(&self) -> Option<u64> {
        self.user_id
    }

    pub fn set_user_id(&mut self, user_id: u64) {
        self.user_id = Some(user_id);
    }

    pub fn is_refreshing(&self) -> bool {
        self.refreshing
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// True when an access token is held and its claims show time remaining.
    /// Pure: no I/O and no mutation.
    pub fn is_authenticated(&self) -> bool {
        match self.access_token() {
            Some(token) => claims::expires_in_secs(token).is_some_and(|secs| secs > 0),
            None => false,
        }
    }

    /// Store freshly issued tokens. The user id follows the token subject when
    /// it can be decoded and is otherwise left as it was.
    pub fn apply_tokens(&mut self, tokens: TokenPair) {
        if let Some(subject) = claims::subject(&tokens.access_token) {
            self.user_id = Some(subject);
        }
        self.access_token = tokens.access_token;
        self.refresh_token = tokens.refresh_token;
        self.token_type = tokens.token_type;
        self.state = SessionState::Authenticated;
    }

    /// Mark a refresh as started. Returns false if one is already running.
    pub fn begin_refresh(&mut self) -> bool {
        if self.refreshing {
            return false;
        }
        self.refreshing = true;
        self.state = SessionState::Refreshing;
        true
    }

    pub fn finish_refresh(&mut self) {
        self.refreshing = false;
        if self.state == SessionState::Refreshing {
            self.state = SessionState::Authenticated;
        }
    }

    /// Invalidate any refresh still in flight without dropping the tokens.
    /// Returns true if one was running.
    pub fn supersede(&mut self) -> bool {
        let was_refreshing = self.refreshing;
        self.refreshing = false;
        self.generation += 1;
        was_refreshing
    }

    /// Forget all tokens and stop the refresh timer.
    pub fn clear(&mut self) {
        self.disarm_timer();
        self.access_token.clear();
        self.refresh_token.clear();
        self.token_type.clear();
        self.user_id = None;
        self.refreshing = false;
        self.state = SessionState::Anonymous;
        self.generation += 1;
    }

    /// Install a new refresh timer, aborting any previous one first.
    pub fn arm_timer(&mut self, deadline: Instant, handle: AbortHandle) {
        self.disarm_timer();
        self.refresh_timer = Some(RefreshTimer { deadline, handle });
    }

    pub fn disarm_timer(&mut self) {
        if let Some(timer) = self.refresh_timer.take() {
            timer.handle.abort();
        }
    }

    /// Claim the timer slot for the timer that fired at `deadline`. Returns
    /// false if that timer was superseded in the meantime.
    pub fn take_fired_timer(&mut self, deadline: Instant) -> bool {
        match self.refresh_timer {
            Some(ref timer) if timer.deadline == deadline => {
                self.refresh_timer = None;
                true
            }
            _ => false,
        }
    }

    pub fn has_timer(&self) -> bool {
        self.refresh_timer.is_some()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            state: self.state,
            user_id: self.user_id,
            token_type: Some(self.token_type.clone()).filter(|t| !t.is_empty()),
            expires_in: self.access_token().and_then(claims::expires_in_secs),
            has_refresh_token: self.refresh_token().is_some(),
            refresh_scheduled_in: self
                .refresh_timer
                .as_ref()
                .map(|timer| timer.deadline.saturating_duration_since(Instant::now())),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("user_id", &self.user_id)
            .field("has_access_token", &self.access_token().is_some())
            .field("has_refresh_token", &self.refresh_token().is_some())
            .field("refreshing", &self.refreshing)
            .field("timer_armed", &self.has_timer())
            .finish()
    }
}
