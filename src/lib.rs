//! E-way Bill Extender
//!
//! Automates extending e-way bills on the government portal through one
//! authenticated browser session. Login stays manual (the human solves
//! the CAPTCHA); single extensions, CSV batches and auto-selection of
//! expiring bills then run against the saved session.

pub mod driver;
pub mod ops;
pub mod progress;
pub mod session;
pub mod web;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{error, info, warn};

use driver::{ChromiumDriverConfig, EligibilityFilter, PortalDriverFactory};
use ops::{Orchestrator, OrchestratorConfig, RetryPolicy};
use progress::ProgressChannel;
use session::{FileSessionStore, SessionManager, SessionSettings};

/// Application configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    /// Label for the operator profile sessions belong to
    #[serde(default = "default_owner_profile")]
    pub owner_profile: String,

    /// Session lifetime after authentication, in minutes
    #[serde(default = "default_session_timeout")]
    pub session_timeout_minutes: u64,
    /// Extend the session on release when it is close to expiry
    #[serde(default = "default_true")]
    pub auto_refresh_session: bool,
    /// Refresh only when remaining validity drops below this
    #[serde(default = "default_refresh_threshold")]
    pub refresh_threshold_minutes: u64,
    /// How long the human gets to complete the CAPTCHA login, in seconds
    #[serde(default = "default_captcha_timeout")]
    pub captcha_completion_timeout_secs: u64,
    /// How often the driver is polled for login completion, in seconds
    #[serde(default = "default_login_poll")]
    pub login_poll_interval_secs: u64,
    /// Background expiry sweep interval, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Retries per item after the first transient failure
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max")]
    pub retry_max_delay_ms: u64,
    /// How long batch operations queue for the session lease, in seconds
    #[serde(default = "default_lease_wait")]
    pub lease_wait_timeout_secs: u64,
    /// Hard cap on every portal call, in seconds
    #[serde(default = "default_portal_call_timeout")]
    pub portal_call_timeout_secs: u64,

    /// Default thresholds for auto-selecting expiring bills
    #[serde(default)]
    pub auto_select: EligibilityFilter,

    /// Browser driver configuration
    #[serde(default)]
    pub driver: ChromiumDriverConfig,
}

fn default_owner_profile() -> String {
    "default".to_string()
}
fn default_session_timeout() -> u64 {
    480
}
fn default_true() -> bool {
    true
}
fn default_refresh_threshold() -> u64 {
    30
}
fn default_captcha_timeout() -> u64 {
    300
}
fn default_login_poll() -> u64 {
    2
}
fn default_sweep_interval() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    2
}
fn default_retry_base() -> u64 {
    1000
}
fn default_retry_max() -> u64 {
    30000
}
fn default_lease_wait() -> u64 {
    30
}
fn default_portal_call_timeout() -> u64 {
    60
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            owner_profile: default_owner_profile(),
            session_timeout_minutes: default_session_timeout(),
            auto_refresh_session: true,
            refresh_threshold_minutes: default_refresh_threshold(),
            captcha_completion_timeout_secs: default_captcha_timeout(),
            login_poll_interval_secs: default_login_poll(),
            sweep_interval_secs: default_sweep_interval(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base(),
            retry_max_delay_ms: default_retry_max(),
            lease_wait_timeout_secs: default_lease_wait(),
            portal_call_timeout_secs: default_portal_call_timeout(),
            auto_select: EligibilityFilter::default(),
            driver: ChromiumDriverConfig::default(),
        }
    }
}

/// Get application directory path (config, logs, sessions)
pub fn app_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("ewaybill-extender"))
}

/// Get log directory path (shared across modules)
pub fn log_dir() -> Option<PathBuf> {
    app_dir().map(|p| p.join("logs"))
}

/// Directory holding persisted session records
pub fn sessions_dir() -> Option<PathBuf> {
    app_dir().map(|p| p.join("sessions"))
}

impl AppConfig {
    /// Get config file path
    fn config_path() -> Option<PathBuf> {
        app_dir().map(|p| p.join("config.json"))
    }

    /// Load config from file
    pub fn load() -> Self {
        if let Some(path) = Self::config_path() {
            if path.exists() {
                match std::fs::read_to_string(&path) {
                    Ok(content) => match serde_json::from_str(&content) {
                        Ok(config) => {
                            info!("Loaded config from {:?}", path);
                            return config;
                        }
                        Err(e) => {
                            warn!("Failed to parse config file: {}", e);
                        }
                    },
                    Err(e) => {
                        warn!("Failed to read config file: {}", e);
                    }
                }
            }
        }
        Self::default()
    }

    /// Save config to file
    pub fn save(&self) {
        if let Some(path) = Self::config_path() {
            // Create parent directory if needed
            if let Some(parent) = path.parent() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    error!("Failed to create config directory: {}", e);
                    return;
                }
            }

            match serde_json::to_string_pretty(self) {
                Ok(content) => {
                    if let Err(e) = std::fs::write(&path, content) {
                        error!("Failed to save config: {}", e);
                    } else {
                        info!("Config saved to {:?}", path);
                    }
                }
                Err(e) => {
                    error!("Failed to serialize config: {}", e);
                }
            }
        }
    }

    /// Session manager settings derived from this config
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            session_timeout: Duration::from_secs(self.session_timeout_minutes * 60),
            captcha_completion_timeout: Duration::from_secs(self.captcha_completion_timeout_secs),
            login_poll_interval: Duration::from_secs(self.login_poll_interval_secs.max(1)),
            auto_refresh: self.auto_refresh_session,
            refresh_threshold: Duration::from_secs(self.refresh_threshold_minutes * 60),
            portal_call_timeout: Duration::from_secs(self.portal_call_timeout_secs.max(1)),
        }
    }

    /// Orchestrator settings derived from this config
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            retry: RetryPolicy {
                max_retries: self.max_retries,
                base_delay_ms: self.retry_base_delay_ms,
                max_delay_ms: self.retry_max_delay_ms,
            },
            lease_wait_timeout: Duration::from_secs(self.lease_wait_timeout_secs),
        }
    }
}

/// Application state shared across the app
pub struct AppState {
    /// Application configuration
    pub config: Arc<RwLock<AppConfig>>,
    /// Session lifecycle manager
    pub sessions: Arc<SessionManager>,
    /// Operation orchestrator
    pub orchestrator: Arc<Orchestrator>,
    /// Progress event fan-out
    pub progress: Arc<ProgressChannel>,
}

impl AppState {
    /// Create application state around the given portal driver factory.
    pub fn new(factory: Arc<dyn PortalDriverFactory>) -> Self {
        let config = AppConfig::load();

        let store = Arc::new(FileSessionStore::new(
            sessions_dir().unwrap_or_else(|| PathBuf::from("data/sessions")),
        ));
        let sessions = Arc::new(SessionManager::new(
            store,
            factory,
            config.session_settings(),
        ));

        let progress = Arc::new(ProgressChannel::new());
        let orchestrator = Arc::new(Orchestrator::new(
            sessions.clone(),
            progress.clone(),
            config.orchestrator_config(),
        ));

        Self {
            config: Arc::new(RwLock::new(config)),
            sessions,
            orchestrator,
            progress,
        }
    }

    /// Restore persisted sessions and start the background expiry sweep.
    pub async fn start(&self) {
        if let Err(e) = self.sessions.restore().await {
            warn!("Session restore failed: {}", e);
        }

        let interval = self.config.read().await.sweep_interval_secs.max(1);
        let _ = SessionManager::spawn_sweeper(self.sessions.clone(), Duration::from_secs(interval));
        info!("Expiry sweep running every {}s", interval);
    }

    /// Apply and persist new settings.
    pub async fn configure(&self, config: AppConfig) {
        self.sessions.set_settings(config.session_settings()).await;
        self.orchestrator
            .set_config(config.orchestrator_config())
            .await;

        config.save();
        *self.config.write().await = config;

        info!("Application configured");
    }
}

/// Initialize logging (console + daily-rolling file)
pub fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false);

    if let Some(log_dir) = log_dir() {
        let _ = std::fs::create_dir_all(&log_dir);
        let file_appender = tracing_appender::rolling::daily(&log_dir, "ewaybill-extender.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_writer(non_blocking);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.session_timeout_minutes, 480);
        assert_eq!(config.max_retries, 2);
        assert!(config.auto_refresh_session);
        assert_eq!(config.auto_select.days_to_expiry, 1);
    }

    #[test]
    fn test_derived_settings_use_sane_floors() {
        let config = AppConfig {
            login_poll_interval_secs: 0,
            portal_call_timeout_secs: 0,
            ..Default::default()
        };
        let settings = config.session_settings();
        assert_eq!(settings.login_poll_interval, Duration::from_secs(1));
        assert_eq!(settings.portal_call_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_config_roundtrips_through_json() {
        let config = AppConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: AppConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.session_timeout_minutes, config.session_timeout_minutes);
        assert_eq!(parsed.owner_profile, config.owner_profile);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let parsed: AppConfig = serde_json::from_str(r#"{"maxRetries": 5}"#).unwrap();
        assert_eq!(parsed.max_retries, 5);
        assert_eq!(parsed.session_timeout_minutes, 480);
    }
}
