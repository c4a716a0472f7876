//! Session lifecycle management
//!
//! The single source of truth for whether portal work may proceed, and
//! the only place that holds a live driver handle. Login is a two-phase
//! handoff: `trigger_login` opens the portal and returns the CAPTCHA
//! image, then `confirm_login` waits (bounded) for the driver to observe
//! that a human completed the login. Nothing in here can finish an
//! authentication on its own.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::driver::{
    DriverError, EligibilityFilter, EligibleBill, ExtendOutcome, ExtensionParams, PortalDriver,
    PortalDriverFactory,
};

use super::store::{Session, SessionState, SessionStore, StoreError};

/// Session-level errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("An active session already exists for profile '{0}'")]
    AlreadyActive(String),

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session {0} is not authenticated")]
    NotAuthenticated(String),

    #[error("Session expired")]
    Expired,

    #[error("Session is busy with another operation")]
    ConcurrencyConflict,

    #[error("Login was not completed within the CAPTCHA window")]
    CaptchaTimeout,

    #[error("Session {id} cannot do that in state {state:?}")]
    InvalidState { id: String, state: SessionState },

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("Session store error: {0}")]
    Store(#[from] StoreError),
}

/// Timing and refresh knobs, derived from the application config.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// How long an authenticated session stays valid
    pub session_timeout: Duration,
    /// How long the human gets to complete the login
    pub captcha_completion_timeout: Duration,
    /// How often the driver is asked whether login completed
    pub login_poll_interval: Duration,
    /// Extend `expires_at` on release when enabled
    pub auto_refresh: bool,
    /// Refresh only when remaining validity drops below this
    pub refresh_threshold: Duration,
    /// Hard cap for every portal call made through a lease
    pub portal_call_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(8 * 60 * 60),
            captcha_completion_timeout: Duration::from_secs(300),
            login_poll_interval: Duration::from_secs(2),
            auto_refresh: true,
            refresh_threshold: Duration::from_secs(30 * 60),
            portal_call_timeout: Duration::from_secs(60),
        }
    }
}

/// Result of phase one of the login handoff.
#[derive(Debug)]
pub struct LoginHandoff {
    pub session_id: String,
    /// PNG bytes of the CAPTCHA the human has to solve
    pub captcha_image: Vec<u8>,
}

/// Live per-session state: the persisted record, the exclusively-owned
/// driver handle, the lease mutex and a revocation epoch.
struct SessionEntry {
    record: RwLock<Session>,
    driver: RwLock<Option<Arc<dyn PortalDriver>>>,
    lease_lock: Arc<Mutex<()>>,
    /// Bumped on invalidate/expire; an outstanding lease that observes a
    /// different epoch is revoked.
    epoch: AtomicU64,
}

impl SessionEntry {
    fn new(record: Session, driver: Option<Arc<dyn PortalDriver>>) -> Self {
        Self {
            record: RwLock::new(record),
            driver: RwLock::new(driver),
            lease_lock: Arc::new(Mutex::new(())),
            epoch: AtomicU64::new(0),
        }
    }
}

/// Exclusive right to drive one session's portal connection.
///
/// Holding the lease is holding the session's mutex: dropping it (on any
/// exit path, including panics) releases the session. All portal calls go
/// through the lease so revocation and per-call timeouts apply uniformly.
pub struct SessionLease {
    session_id: String,
    entry: Arc<SessionEntry>,
    epoch: u64,
    call_timeout: Duration,
    _guard: OwnedMutexGuard<()>,
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease")
            .field("session_id", &self.session_id)
            .field("epoch", &self.epoch)
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

impl SessionLease {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Validate the lease and hand out the driver for one call.
    async fn checked_driver(&self) -> Result<Arc<dyn PortalDriver>, SessionError> {
        if self.entry.epoch.load(Ordering::Acquire) != self.epoch {
            return Err(SessionError::Expired);
        }
        {
            let record = self.entry.record.read().await;
            if record.state != SessionState::Authenticated {
                return Err(SessionError::Expired);
            }
            if record.is_expired_at(Utc::now()) {
                return Err(SessionError::Expired);
            }
        }
        self.entry
            .driver
            .read()
            .await
            .clone()
            .ok_or(SessionError::Expired)
    }

    /// Attempt one extension through the leased session.
    ///
    /// A call that exceeds the hard timeout is classified transient; a
    /// result that lands after the lease was revoked is not trusted.
    pub async fn extend_bill(
        &self,
        ewb_number: &str,
        params: &ExtensionParams,
    ) -> Result<ExtendOutcome, SessionError> {
        let driver = self.checked_driver().await?;

        let outcome =
            match tokio::time::timeout(self.call_timeout, driver.extend_bill(ewb_number, params))
                .await
            {
                Err(_) => ExtendOutcome::TransientError {
                    message: format!(
                        "Portal call exceeded {}s",
                        self.call_timeout.as_secs()
                    ),
                },
                Ok(Err(e)) => return Err(SessionError::Driver(e)),
                Ok(Ok(outcome)) => outcome,
            };

        self.checked_driver().await?;
        Ok(outcome)
    }

    /// Resolve the bills matching an auto-select filter.
    pub async fn resolve_eligible(
        &self,
        filter: &EligibilityFilter,
    ) -> Result<Vec<EligibleBill>, SessionError> {
        let driver = self.checked_driver().await?;
        match tokio::time::timeout(self.call_timeout, driver.resolve_eligible(filter)).await {
            Err(_) => Err(SessionError::Driver(DriverError::NavigationFailed(
                "Eligibility query timed out".into(),
            ))),
            Ok(result) => Ok(result?),
        }
    }

    /// Read one bill's portal-side state.
    pub async fn read_bill_state(
        &self,
        ewb_number: &str,
    ) -> Result<crate::driver::BillState, SessionError> {
        let driver = self.checked_driver().await?;
        match tokio::time::timeout(self.call_timeout, driver.read_bill_state(ewb_number)).await {
            Err(_) => Err(SessionError::Driver(DriverError::NavigationFailed(
                "Bill lookup timed out".into(),
            ))),
            Ok(result) => Ok(result?),
        }
    }
}

/// Owns every session's state machine, driver handle and lease.
pub struct SessionManager {
    entries: RwLock<HashMap<String, Arc<SessionEntry>>>,
    store: Arc<dyn SessionStore>,
    factory: Arc<dyn PortalDriverFactory>,
    settings: RwLock<SessionSettings>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        factory: Arc<dyn PortalDriverFactory>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            store,
            factory,
            settings: RwLock::new(settings),
        }
    }

    pub async fn set_settings(&self, settings: SessionSettings) {
        *self.settings.write().await = settings;
    }

    async fn settings(&self) -> SessionSettings {
        self.settings.read().await.clone()
    }

    /// Restore persisted records. A live browser context cannot survive a
    /// restart, so records that claim to be logged in are demoted to
    /// Expired before they become visible.
    pub async fn restore(&self) -> Result<usize, SessionError> {
        let records = self.store.list(None).await?;
        let mut restored = 0;

        let mut entries = self.entries.write().await;
        for mut record in records {
            if record.state.is_live() {
                record.state = SessionState::Expired;
                self.store.save(&record).await?;
            }
            entries
                .entry(record.id.clone())
                .or_insert_with(|| Arc::new(SessionEntry::new(record, None)));
            restored += 1;
        }

        if restored > 0 {
            info!("Restored {} session record(s) from store", restored);
        }
        Ok(restored)
    }

    async fn entry(&self, session_id: &str) -> Result<Arc<SessionEntry>, SessionError> {
        self.entries
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    /// Phase one of the login handoff: open the portal login page and
    /// capture the CAPTCHA for the human.
    ///
    /// Refuses when the profile already has a live, unexpired session
    /// unless `force` is set (which invalidates the old one first). The
    /// driver resource is released on every failure path.
    pub async fn trigger_login(
        &self,
        owner_profile: &str,
        force: bool,
    ) -> Result<LoginHandoff, SessionError> {
        if let Some(existing) = self.find_live_session(owner_profile).await {
            if force {
                info!(
                    "Forcing new login for '{}', invalidating session {}",
                    owner_profile, existing
                );
                self.invalidate(&existing).await?;
            } else {
                return Err(SessionError::AlreadyActive(owner_profile.to_string()));
            }
        }

        let mut record = Session::new(owner_profile);
        let session_id = record.id.clone();
        info!("Login triggered for '{}' (session {})", owner_profile, session_id);

        let driver = self.factory.launch(&session_id).await?;

        if let Err(e) = driver.open_login_surface().await {
            driver.close().await;
            return Err(e.into());
        }

        let captcha_image = match driver.capture_captcha().await {
            Ok(image) => image,
            Err(e) => {
                driver.close().await;
                return Err(e.into());
            }
        };

        let settings = self.settings().await;
        record.state = SessionState::AwaitingCaptcha;
        // The CAPTCHA window doubles as this state's lifetime: if nobody
        // confirms, the sweep expires the session.
        record.expires_at = Some(
            Utc::now()
                + chrono::Duration::from_std(settings.captcha_completion_timeout)
                    .unwrap_or_else(|_| chrono::Duration::seconds(300)),
        );
        if let Err(e) = self.store.save(&record).await {
            driver.close().await;
            return Err(e.into());
        }

        self.entries.write().await.insert(
            session_id.clone(),
            Arc::new(SessionEntry::new(record, Some(driver))),
        );

        Ok(LoginHandoff {
            session_id,
            captcha_image,
        })
    }

    /// Re-capture the CAPTCHA image without changing session state.
    pub async fn refresh_captcha(&self, session_id: &str) -> Result<Vec<u8>, SessionError> {
        let entry = self.entry(session_id).await?;

        let state = entry.record.read().await.state;
        if state != SessionState::AwaitingCaptcha {
            return Err(SessionError::InvalidState {
                id: session_id.to_string(),
                state,
            });
        }

        let driver = entry
            .driver
            .read()
            .await
            .clone()
            .ok_or(SessionError::Expired)?;
        Ok(driver.capture_captcha().await?)
    }

    /// Phase two of the login handoff: wait (bounded) for the driver to
    /// observe that the human finished logging in.
    ///
    /// No lock is held across the wait. Success transitions the session
    /// to Authenticated with a fresh expiry; an exhausted window expires
    /// the session and releases the driver.
    pub async fn confirm_login(&self, session_id: &str) -> Result<Session, SessionError> {
        let entry = self.entry(session_id).await?;
        let settings = self.settings().await;
        let deadline = tokio::time::Instant::now() + settings.captcha_completion_timeout;

        loop {
            let state = entry.record.read().await.state;
            match state {
                SessionState::AwaitingCaptcha => {}
                // Another confirm call won the race.
                SessionState::Authenticated => return Ok(entry.record.read().await.clone()),
                other => {
                    return Err(SessionError::InvalidState {
                        id: session_id.to_string(),
                        state: other,
                    })
                }
            }

            let driver = entry
                .driver
                .read()
                .await
                .clone()
                .ok_or(SessionError::Expired)?;

            let completed = driver
                .detect_login_completion(settings.login_poll_interval)
                .await
                .unwrap_or(false);

            if completed {
                let record = {
                    let mut record = entry.record.write().await;
                    // The state may have flipped while we were polling.
                    if record.state != SessionState::AwaitingCaptcha {
                        return Err(SessionError::InvalidState {
                            id: session_id.to_string(),
                            state: record.state,
                        });
                    }
                    record.state = SessionState::Authenticated;
                    let now = Utc::now();
                    record.last_activity_at = now;
                    record.expires_at = Some(
                        now + chrono::Duration::from_std(settings.session_timeout)
                            .unwrap_or_else(|_| chrono::Duration::hours(8)),
                    );
                    record.clone()
                };
                self.store.save(&record).await?;
                info!("Session {} authenticated (expires {:?})", session_id, record.expires_at);
                return Ok(record);
            }

            if tokio::time::Instant::now() >= deadline {
                warn!("Session {} login window elapsed without completion", session_id);
                if let Err(e) = self.expire_entry(&entry, SessionState::Expired).await {
                    warn!("Failed to expire session {}: {}", session_id, e);
                }
                return Err(SessionError::CaptchaTimeout);
            }
        }
    }

    /// Acquire the exclusive lease over one session.
    ///
    /// Waits up to `wait` for the current holder to release; a zero wait
    /// fails fast. State and expiry are checked lazily both before and
    /// after queueing, so an expired session is refused even if no sweep
    /// has run yet.
    pub async fn acquire(
        &self,
        session_id: &str,
        wait: Duration,
    ) -> Result<SessionLease, SessionError> {
        let entry = self.entry(session_id).await?;
        self.check_acquirable(&entry, session_id).await?;

        let guard = tokio::time::timeout(wait, entry.lease_lock.clone().lock_owned())
            .await
            .map_err(|_| SessionError::ConcurrencyConflict)?;

        // The session may have died while we queued for the lock.
        self.check_acquirable(&entry, session_id).await?;

        let settings = self.settings().await;
        debug!("Lease acquired on session {}", session_id);
        Ok(SessionLease {
            session_id: session_id.to_string(),
            epoch: entry.epoch.load(Ordering::Acquire),
            entry,
            call_timeout: settings.portal_call_timeout,
            _guard: guard,
        })
    }

    async fn check_acquirable(
        &self,
        entry: &Arc<SessionEntry>,
        session_id: &str,
    ) -> Result<(), SessionError> {
        let (state, expired) = {
            let record = entry.record.read().await;
            (record.state, record.is_expired_at(Utc::now()))
        };

        match state {
            SessionState::Authenticated if expired => {
                self.expire_entry(entry, SessionState::Expired).await?;
                Err(SessionError::Expired)
            }
            SessionState::Authenticated => Ok(()),
            _ => Err(SessionError::NotAuthenticated(session_id.to_string())),
        }
    }

    /// Return a lease, refreshing activity and (when enabled and close to
    /// expiry) extending the session via a driver keep-alive.
    pub async fn release(&self, lease: SessionLease) {
        let SessionLease {
            session_id,
            entry,
            epoch,
            _guard,
            ..
        } = lease;

        if entry.epoch.load(Ordering::Acquire) != epoch {
            // Revoked while held; nothing left to refresh.
            debug!("Lease on session {} released after revocation", session_id);
            return;
        }

        let settings = self.settings().await;
        let now = Utc::now();

        let refresh = {
            let mut record = entry.record.write().await;
            record.last_activity_at = now;
            settings.auto_refresh
                && record.state == SessionState::Authenticated
                && record
                    .expires_at
                    .map(|e| {
                        (e - now).to_std().unwrap_or(Duration::ZERO) < settings.refresh_threshold
                    })
                    .unwrap_or(false)
        };

        if refresh {
            let driver = entry.driver.read().await.clone();
            if let Some(driver) = driver {
                match driver.keep_alive().await {
                    Ok(()) => {
                        let mut record = entry.record.write().await;
                        record.expires_at = Some(
                            now + chrono::Duration::from_std(settings.session_timeout)
                                .unwrap_or_else(|_| chrono::Duration::hours(8)),
                        );
                        info!("Session {} refreshed (expires {:?})", session_id, record.expires_at);
                    }
                    Err(e) => {
                        warn!("Session {} keep-alive failed, expiring: {}", session_id, e);
                        let _ = self.expire_entry(&entry, SessionState::Expired).await;
                        return;
                    }
                }
            }
        }

        let record = entry.record.read().await.clone();
        if let Err(e) = self.store.save(&record).await {
            warn!("Failed to persist session {}: {}", session_id, e);
        }
        debug!("Lease released on session {}", session_id);
    }

    /// Force a session out of service. Safe to call while a lease is
    /// held: the epoch bump revokes it and its next use fails.
    pub async fn invalidate(&self, session_id: &str) -> Result<(), SessionError> {
        let entry = self.entry(session_id).await?;
        self.expire_entry(&entry, SessionState::Invalidated).await
    }

    async fn expire_entry(
        &self,
        entry: &Arc<SessionEntry>,
        target: SessionState,
    ) -> Result<(), SessionError> {
        entry.epoch.fetch_add(1, Ordering::AcqRel);

        let record = {
            let mut record = entry.record.write().await;
            if record.state.is_live() {
                record.state = target;
            }
            record.last_activity_at = Utc::now();
            record.clone()
        };

        // The driver handle is released unconditionally; Expired and
        // Invalidated sessions hold no live browser context.
        let driver = entry.driver.write().await.take();
        if let Some(driver) = driver {
            driver.close().await;
        }

        self.store.save(&record).await?;
        info!("Session {} -> {:?}", record.id, record.state);
        Ok(())
    }

    /// Expire every session whose deadline has passed. Returns how many
    /// were transitioned.
    pub async fn sweep_expired(&self) -> usize {
        let entries: Vec<Arc<SessionEntry>> =
            self.entries.read().await.values().cloned().collect();

        let now = Utc::now();
        let mut swept = 0;

        for entry in entries {
            let due = {
                let record = entry.record.read().await;
                record.state.is_live() && record.is_expired_at(now)
            };
            if due {
                if let Err(e) = self.expire_entry(&entry, SessionState::Expired).await {
                    warn!("Sweep failed to expire a session: {}", e);
                } else {
                    swept += 1;
                }
            }
        }

        if swept > 0 {
            info!("Expiry sweep transitioned {} session(s)", swept);
        }
        swept
    }

    /// Background sweep task.
    pub fn spawn_sweeper(manager: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                manager.sweep_expired().await;
            }
        })
    }

    /// Snapshot of one session record.
    pub async fn get(&self, session_id: &str) -> Result<Session, SessionError> {
        let entry = self.entry(session_id).await?;
        let snapshot = entry.record.read().await.clone();
        Ok(snapshot)
    }

    /// Snapshots of all known sessions, newest first.
    pub async fn list(&self) -> Vec<Session> {
        let entries: Vec<Arc<SessionEntry>> =
            self.entries.read().await.values().cloned().collect();

        let mut sessions = Vec::with_capacity(entries.len());
        for entry in entries {
            sessions.push(entry.record.read().await.clone());
        }
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        sessions
    }

    /// Read one bill's state through a short-lived lease.
    pub async fn read_bill(
        &self,
        session_id: &str,
        ewb_number: &str,
    ) -> Result<crate::driver::BillState, SessionError> {
        let lease = self.acquire(session_id, Duration::ZERO).await?;
        let result = lease.read_bill_state(ewb_number).await;
        self.release(lease).await;
        result
    }

    async fn find_live_session(&self, owner_profile: &str) -> Option<String> {
        let entries: Vec<Arc<SessionEntry>> =
            self.entries.read().await.values().cloned().collect();

        let now = Utc::now();
        for entry in entries {
            let record = entry.record.read().await;
            if record.owner_profile == owner_profile
                && record.state.is_live()
                && !record.is_expired_at(now)
            {
                return Some(record.id.clone());
            }
        }
        None
    }

    #[cfg(test)]
    pub(crate) async fn force_expiry_at(
        &self,
        session_id: &str,
        at: chrono::DateTime<Utc>,
    ) {
        if let Ok(entry) = self.entry(session_id).await {
            entry.record.write().await.expires_at = Some(at);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::testing::{FakeDriverFactory, FakePortalDriver};
    use crate::session::store::MemorySessionStore;
    use std::sync::atomic::Ordering;

    fn test_settings() -> SessionSettings {
        SessionSettings {
            session_timeout: Duration::from_secs(3600),
            captcha_completion_timeout: Duration::from_millis(200),
            login_poll_interval: Duration::from_millis(20),
            auto_refresh: false,
            refresh_threshold: Duration::from_secs(60),
            portal_call_timeout: Duration::from_secs(5),
        }
    }

    fn manager_with(
        driver: Arc<FakePortalDriver>,
        settings: SessionSettings,
    ) -> Arc<SessionManager> {
        Arc::new(SessionManager::new(
            Arc::new(MemorySessionStore::new()),
            Arc::new(FakeDriverFactory::new(driver)),
            settings,
        ))
    }

    #[tokio::test]
    async fn test_trigger_login_enters_awaiting_captcha() {
        let driver = Arc::new(FakePortalDriver::new());
        let manager = manager_with(driver, test_settings());

        let handoff = manager.trigger_login("default", false).await.unwrap();
        assert!(!handoff.captcha_image.is_empty());

        let session = manager.get(&handoff.session_id).await.unwrap();
        assert_eq!(session.state, SessionState::AwaitingCaptcha);
    }

    #[tokio::test]
    async fn test_second_login_for_profile_conflicts_unless_forced() {
        let driver = Arc::new(FakePortalDriver::new());
        let manager = manager_with(driver, test_settings());

        let first = manager.trigger_login("default", false).await.unwrap();
        let err = manager.trigger_login("default", false).await.unwrap_err();
        assert!(matches!(err, SessionError::AlreadyActive(_)));

        let second = manager.trigger_login("default", true).await.unwrap();
        assert_ne!(first.session_id, second.session_id);
        let old = manager.get(&first.session_id).await.unwrap();
        assert_eq!(old.state, SessionState::Invalidated);
    }

    #[tokio::test]
    async fn test_failed_launch_leaves_no_session_behind() {
        let driver = Arc::new(FakePortalDriver::new());
        let factory = Arc::new(FakeDriverFactory::new(driver));
        factory.fail_launch.store(true, Ordering::Relaxed);
        let manager = SessionManager::new(
            Arc::new(MemorySessionStore::new()),
            factory,
            test_settings(),
        );

        assert!(manager.trigger_login("default", false).await.is_err());
        assert!(manager.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_confirm_login_authenticates_and_sets_expiry() {
        let driver = Arc::new(FakePortalDriver::new());
        driver.set_login_complete(true);
        let manager = manager_with(driver, test_settings());

        let handoff = manager.trigger_login("default", false).await.unwrap();
        let session = manager.confirm_login(&handoff.session_id).await.unwrap();

        assert_eq!(session.state, SessionState::Authenticated);
        assert!(session.expires_at.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn test_captcha_timeout_expires_session_and_closes_driver() {
        // Scenario: login triggered, no completion signal arrives in time.
        let driver = Arc::new(FakePortalDriver::new());
        let manager = manager_with(driver.clone(), test_settings());

        let handoff = manager.trigger_login("default", false).await.unwrap();
        let err = manager.confirm_login(&handoff.session_id).await.unwrap_err();
        assert!(matches!(err, SessionError::CaptchaTimeout));

        let session = manager.get(&handoff.session_id).await.unwrap();
        assert_eq!(session.state, SessionState::Expired);
        assert!(driver.closed.load(Ordering::Relaxed));

        // Any acquire against it now refuses.
        let err = manager
            .acquire(&handoff.session_id, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::NotAuthenticated(_)));
    }

    async fn authenticated_session(manager: &SessionManager) -> String {
        let handoff = manager.trigger_login("default", false).await.unwrap();
        manager.confirm_login(&handoff.session_id).await.unwrap();
        handoff.session_id
    }

    #[tokio::test]
    async fn test_lease_is_exclusive() {
        // Two concurrent acquires with a zero wait: exactly one proceeds.
        let driver = Arc::new(FakePortalDriver::new());
        driver.set_login_complete(true);
        let manager = manager_with(driver, test_settings());
        let id = authenticated_session(&manager).await;

        let lease = manager.acquire(&id, Duration::ZERO).await.unwrap();
        let err = manager.acquire(&id, Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, SessionError::ConcurrencyConflict));

        manager.release(lease).await;
        let lease = manager.acquire(&id, Duration::ZERO).await.unwrap();
        manager.release(lease).await;
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let driver = Arc::new(FakePortalDriver::new());
        driver.set_login_complete(true);
        let manager = manager_with(driver, test_settings());
        let id = authenticated_session(&manager).await;

        let lease = manager.acquire(&id, Duration::ZERO).await.unwrap();

        let waiter = {
            let manager = manager.clone();
            let id = id.clone();
            tokio::spawn(async move { manager.acquire(&id, Duration::from_secs(2)).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.release(lease).await;

        let second = waiter.await.unwrap().unwrap();
        manager.release(second).await;
    }

    #[tokio::test]
    async fn test_expiry_is_enforced_lazily_at_acquire() {
        let driver = Arc::new(FakePortalDriver::new());
        driver.set_login_complete(true);
        let manager = manager_with(driver, test_settings());
        let id = authenticated_session(&manager).await;

        manager
            .force_expiry_at(&id, Utc::now() - chrono::Duration::seconds(1))
            .await;

        // No sweep has run, yet the acquire must refuse.
        let err = manager.acquire(&id, Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, SessionError::Expired));
        assert_eq!(manager.get(&id).await.unwrap().state, SessionState::Expired);
    }

    #[tokio::test]
    async fn test_invalidate_revokes_held_lease() {
        let driver = Arc::new(FakePortalDriver::new());
        driver.set_login_complete(true);
        let manager = manager_with(driver.clone(), test_settings());
        let id = authenticated_session(&manager).await;

        let lease = manager.acquire(&id, Duration::ZERO).await.unwrap();
        manager.invalidate(&id).await.unwrap();

        let err = lease
            .extend_bill("391000000000", &ExtensionParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Expired));
        assert!(driver.closed.load(Ordering::Relaxed));

        manager.release(lease).await;
    }

    #[tokio::test]
    async fn test_sweep_expires_overdue_sessions() {
        let driver = Arc::new(FakePortalDriver::new());
        driver.set_login_complete(true);
        let manager = manager_with(driver, test_settings());
        let id = authenticated_session(&manager).await;

        assert_eq!(manager.sweep_expired().await, 0);

        manager
            .force_expiry_at(&id, Utc::now() - chrono::Duration::seconds(1))
            .await;
        assert_eq!(manager.sweep_expired().await, 1);
        assert_eq!(manager.get(&id).await.unwrap().state, SessionState::Expired);
    }

    #[tokio::test]
    async fn test_release_auto_refreshes_near_expiry() {
        let driver = Arc::new(FakePortalDriver::new());
        driver.set_login_complete(true);
        let mut settings = test_settings();
        settings.auto_refresh = true;
        settings.session_timeout = Duration::from_secs(3600);
        // Threshold above the timeout so every release refreshes.
        settings.refresh_threshold = Duration::from_secs(7200);
        let manager = manager_with(driver.clone(), settings);
        let id = authenticated_session(&manager).await;

        let before = manager.get(&id).await.unwrap().expires_at.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let lease = manager.acquire(&id, Duration::ZERO).await.unwrap();
        manager.release(lease).await;

        assert!(driver.keep_alive_calls.load(Ordering::Relaxed) >= 1);
        let after = manager.get(&id).await.unwrap().expires_at.unwrap();
        assert!(after > before);
    }

    #[tokio::test]
    async fn test_restore_demotes_stale_authenticated_records() {
        let store = Arc::new(MemorySessionStore::new());
        let mut record = Session::new("default");
        record.state = SessionState::Authenticated;
        record.expires_at = Some(Utc::now() + chrono::Duration::hours(1));
        store.save(&record).await.unwrap();

        let driver = Arc::new(FakePortalDriver::new());
        let manager = SessionManager::new(
            store,
            Arc::new(FakeDriverFactory::new(driver)),
            test_settings(),
        );

        assert_eq!(manager.restore().await.unwrap(), 1);
        assert_eq!(
            manager.get(&record.id).await.unwrap().state,
            SessionState::Expired
        );
    }
}
