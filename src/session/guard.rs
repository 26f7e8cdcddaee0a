//! Request wrapper that detects authentication loss and recovers from it.

use super::persist::SessionStore;
use crate::cache::FetchOrigin;
use crate::error::FetchError;
use crate::events::{EventBus, EventKind, EventSource, SyncEvent};
use crate::http::{HttpRequest, HttpResponse, Requester};
use crate::types::Identity;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Authentication state of the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthState {
    /// No identity known; requests pass through untouched.
    Anonymous,
    /// An identity was restored locally but the server has not confirmed it.
    Unverified,
    Authenticated,
    /// A 401 was observed; new requests wait for the outcome.
    Recovering,
    /// Terminal until the next login.
    LoggedOut,
}

/// Snapshot of the session.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionState {
    pub user: Option<Identity>,
    pub last_verified_at: Option<Instant>,
    pub auth: AuthState,
    pub recovering: bool,
}

/// Session guard configuration.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Endpoint returning the current identity.
    pub verify_path: String,
    /// Interval of the liveness check while the session is unverified.
    pub liveness_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            verify_path: "/api/auth/me".to_string(),
            liveness_interval: Duration::from_secs(30),
        }
    }
}

/// Result of asking the server who we are.
enum Verification {
    Confirmed(Identity),
    Rejected,
    Inconclusive(FetchError),
}

type LogoutHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct SessionRecord {
    user: Option<Identity>,
    last_verified_at: Option<Instant>,
}

/// Wraps the [`Requester`] with 401 detection and silent recovery.
///
/// On the first 401 the guard enters `Recovering` and verifies the session
/// once. Requests issued meanwhile wait for the outcome instead of hitting
/// the server with dead credentials. A confirmed session replays the
/// original request exactly once; a rejected one logs out.
pub struct SessionGuard {
    requester: Arc<dyn Requester>,
    store: Arc<dyn SessionStore>,
    bus: Arc<EventBus>,
    config: SessionConfig,
    state: watch::Sender<AuthState>,
    record: Mutex<SessionRecord>,
    logout_hooks: Mutex<Vec<LogoutHook>>,
    expiry_notified: AtomicBool,
    recoveries: AtomicU64,
}

impl SessionGuard {
    pub fn new(
        requester: Arc<dyn Requester>,
        store: Arc<dyn SessionStore>,
        bus: Arc<EventBus>,
        config: SessionConfig,
    ) -> Self {
        let (state, _) = watch::channel(AuthState::Anonymous);
        Self {
            requester,
            store,
            bus,
            config,
            state,
            record: Mutex::new(SessionRecord::default()),
            logout_hooks: Mutex::new(Vec::new()),
            expiry_notified: AtomicBool::new(false),
            recoveries: AtomicU64::new(0),
        }
    }

    pub fn auth_state(&self) -> AuthState {
        *self.state.borrow()
    }

    /// Receiver for auth state transitions.
    pub fn watch(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    pub fn session(&self) -> SessionState {
        let auth = self.auth_state();
        let record = self.record.lock();
        SessionState {
            user: record.user.clone(),
            last_verified_at: record.last_verified_at,
            auth,
            recovering: auth == AuthState::Recovering,
        }
    }

    pub fn current_user(&self) -> Option<Identity> {
        self.record.lock().user.clone()
    }

    /// Number of recoveries started.
    pub fn recoveries(&self) -> u64 {
        self.recoveries.load(Ordering::Relaxed)
    }

    /// Register a hook run once per transition to `LoggedOut`.
    pub fn on_logout<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.logout_hooks.lock().push(Arc::new(hook));
    }

    /// Load the persisted identity. The session stays `Unverified` until the
    /// server confirms it.
    pub fn restore(&self) -> Option<Identity> {
        let identity = match self.store.load() {
            Ok(identity) => identity,
            Err(e) => {
                warn!(error = %e, "discarding unreadable session record");
                if let Err(e) = self.store.clear() {
                    warn!(error = %e, "failed to remove session record");
                }
                None
            }
        };

        if let Some(ref user) = identity {
            self.record.lock().user = Some(user.clone());
            self.state.send_replace(AuthState::Unverified);
            debug!(user = %user.id, "restored session identity");
        }
        identity
    }

    /// Record a successful sign-in.
    pub fn login(&self, identity: Identity) {
        if let Err(e) = self.store.save(&identity) {
            warn!(error = %e, "failed to persist session identity");
        }
        info!(user = %identity.id, role = identity.role.as_str(), "session established");
        {
            let mut record = self.record.lock();
            record.user = Some(identity);
            record.last_verified_at = Some(Instant::now());
        }
        self.expiry_notified.store(false, Ordering::SeqCst);
        self.state.send_replace(AuthState::Authenticated);
    }

    /// Explicit sign-out. Runs the logout hooks but raises no expiry notice.
    pub fn logout(&self) {
        self.expiry_notified.store(true, Ordering::SeqCst);
        self.terminate("logout");
    }

    /// Send `request`, recovering from a 401 at most once.
    pub async fn execute(
        &self,
        request: HttpRequest,
        origin: FetchOrigin,
    ) -> Result<HttpResponse, FetchError> {
        self.wait_for_recovery(origin).await?;

        let response = self.requester.send(request.clone()).await?;
        if !response.is_unauthorized() {
            return Ok(response);
        }

        if !self.on_unauthorized(&request).await {
            return Err(FetchError::SessionExpired);
        }

        let path = request.path.clone();
        let replay = self.requester.send(request).await?;
        if replay.is_unauthorized() {
            warn!(path = %path, "replayed request still unauthorized");
            return Err(FetchError::Unauthorized);
        }
        Ok(replay)
    }

    /// Send a `GET` through [`execute`](Self::execute) and unwrap the body.
    pub async fn get_json(
        &self,
        path: &str,
        origin: FetchOrigin,
    ) -> Result<serde_json::Value, FetchError> {
        self.execute(HttpRequest::get(path), origin)
            .await?
            .into_result()
    }

    /// Handle a 401 observed for `request`. Returns whether the session is
    /// usable again.
    ///
    /// Only the first caller performs the verification; concurrent callers
    /// wait for its outcome.
    pub async fn on_unauthorized(&self, request: &HttpRequest) -> bool {
        let mut previous = AuthState::Anonymous;
        let leader = self.state.send_if_modified(|state| match *state {
            AuthState::Authenticated | AuthState::Unverified => {
                previous = *state;
                *state = AuthState::Recovering;
                true
            }
            _ => false,
        });

        if !leader {
            return match self.auth_state() {
                AuthState::Recovering => {
                    matches!(
                        self.resolved_state().await,
                        AuthState::Authenticated | AuthState::Unverified
                    )
                }
                AuthState::Anonymous => {
                    debug!(path = %request.path, "unauthorized without a session");
                    false
                }
                AuthState::LoggedOut => false,
                AuthState::Authenticated | AuthState::Unverified => true,
            };
        }

        self.recoveries.fetch_add(1, Ordering::Relaxed);
        warn!(path = %request.path, "request unauthorized, verifying session");

        match self.verify().await {
            Verification::Confirmed(identity) => {
                self.confirm(identity);
            }
            Verification::Rejected => {
                self.expire();
                return false;
            }
            Verification::Inconclusive(error) => {
                warn!(error = %error, "session verification inconclusive");
                self.state.send_if_modified(|state| {
                    if *state != AuthState::Recovering {
                        return false;
                    }
                    *state = previous;
                    true
                });
            }
        }
        matches!(
            self.auth_state(),
            AuthState::Authenticated | AuthState::Unverified
        )
    }

    /// Ask the server whether the session is still valid and apply the answer.
    pub async fn verify_session(&self) -> Result<Identity, FetchError> {
        match self.verify().await {
            Verification::Confirmed(identity) => {
                if self.confirm(identity.clone()) || self.auth_state() == AuthState::Authenticated {
                    Ok(identity)
                } else {
                    Err(FetchError::SessionExpired)
                }
            }
            Verification::Rejected => {
                self.expire();
                Err(FetchError::SessionExpired)
            }
            Verification::Inconclusive(error) => {
                debug!(error = %error, "session verification inconclusive");
                Err(error)
            }
        }
    }

    /// Run a recovery without a triggering 401, deferring requests until the
    /// session is confirmed or lost.
    pub async fn force_reauth(&self) -> bool {
        let request = HttpRequest::get(self.config.verify_path.clone());
        self.on_unauthorized(&request).await
    }

    /// Verify the session every `liveness_interval` while it is unverified.
    pub async fn run_liveness(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.liveness_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if self.auth_state() == AuthState::Unverified {
                debug!("liveness check");
                let _ = self.verify_session().await;
            }
        }
    }

    async fn wait_for_recovery(&self, origin: FetchOrigin) -> Result<(), FetchError> {
        match self.auth_state() {
            AuthState::LoggedOut if origin == FetchOrigin::Background => {
                Err(FetchError::SessionExpired)
            }
            AuthState::Recovering => {
                debug!(?origin, "deferring request until session recovery completes");
                match self.resolved_state().await {
                    AuthState::LoggedOut => Err(FetchError::SessionExpired),
                    _ => Ok(()),
                }
            }
            _ => Ok(()),
        }
    }

    async fn resolved_state(&self) -> AuthState {
        let mut rx = self.state.subscribe();
        let resolved = match rx.wait_for(|s| *s != AuthState::Recovering).await {
            Ok(state) => *state,
            Err(_) => AuthState::LoggedOut,
        };
        resolved
    }

    async fn verify(&self) -> Verification {
        let request = HttpRequest::get(self.config.verify_path.clone());
        match self.requester.send(request).await {
            Ok(response) if response.is_success() => {
                match serde_json::from_value::<Identity>(response.body) {
                    Ok(identity) => Verification::Confirmed(identity),
                    Err(e) => Verification::Inconclusive(FetchError::Decode(e.to_string())),
                }
            }
            Ok(response) if response.status == 401 || response.status == 403 => {
                Verification::Rejected
            }
            Ok(response) => match response.into_result() {
                Err(error) => Verification::Inconclusive(error),
                Ok(_) => Verification::Inconclusive(FetchError::Decode("unexpected status".into())),
            },
            Err(error) => Verification::Inconclusive(error),
        }
    }

    /// Apply a confirmed identity. Only a session still awaiting an answer
    /// is promoted; a sign-out that landed meanwhile stands.
    ///
    /// The record and the store are written under the state lock so a
    /// concurrent `terminate` clears them after this, never before.
    fn confirm(&self, identity: Identity) -> bool {
        let applied = self.state.send_if_modified(|state| match *state {
            AuthState::Recovering | AuthState::Unverified => {
                if let Err(e) = self.store.save(&identity) {
                    warn!(error = %e, "failed to persist session identity");
                }
                let mut record = self.record.lock();
                record.user = Some(identity.clone());
                record.last_verified_at = Some(Instant::now());
                *state = AuthState::Authenticated;
                true
            }
            _ => false,
        });
        if applied {
            debug!(user = %identity.id, "session confirmed");
        } else {
            debug!(user = %identity.id, state = ?self.auth_state(), "stale confirmation ignored");
        }
        applied
    }

    fn expire(&self) {
        if !self.terminate("session expired") {
            return;
        }
        if !self.expiry_notified.swap(true, Ordering::SeqCst) {
            self.bus
                .publish(SyncEvent::new(EventKind::SessionExpired, EventSource::Engine));
        }
    }

    /// Transition to `LoggedOut`. Returns false if already there.
    fn terminate(&self, reason: &str) -> bool {
        let previous = self.state.send_replace(AuthState::LoggedOut);
        if previous == AuthState::LoggedOut {
            return false;
        }

        info!(reason, "session terminated");
        {
            let mut record = self.record.lock();
            record.user = None;
            record.last_verified_at = None;
        }
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "failed to clear session record");
        }

        let hooks: Vec<LogoutHook> = self.logout_hooks.lock().clone();
        for hook in hooks {
            hook();
        }
        true
    }
}
