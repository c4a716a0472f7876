//! Portal driver contract
//!
//! Everything that touches the e-way bill portal goes through the
//! `PortalDriver` trait. The session manager owns driver handles
//! exclusively; the orchestrator only reaches them through lease-scoped
//! calls. `ChromiumPortalDriver` is the shipped implementation.

mod chromium;
#[cfg(test)]
pub(crate) mod testing;

pub use chromium::{ChromiumDriverConfig, ChromiumDriverFactory, ChromiumPortalDriver};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Driver-level errors
///
/// These are faults of the driver itself (browser gone, element layout
/// changed, launch failure), not portal-side answers. A fault aborts the
/// current operation; portal answers travel in [`ExtendOutcome`].
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Failed to launch browser: {0}")]
    LaunchFailed(String),

    #[error("Navigation failed: {0}")]
    NavigationFailed(String),

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Page evaluation failed: {0}")]
    EvaluationFailed(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Parameters for one extension attempt.
///
/// Mirrors the portal's extension form: a reason, the extra distance still
/// to cover, and the vehicle currently carrying the consignment.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionParams {
    /// Extension reason shown to the portal
    #[serde(default = "default_reason")]
    pub reason: String,
    /// Remaining distance in kilometers
    #[serde(default)]
    pub extra_distance_km: Option<f64>,
    /// Vehicle number, required by the portal for road transport
    #[serde(default)]
    pub vehicle_number: Option<String>,
}

fn default_reason() -> String {
    "Vehicle Breakdown".to_string()
}

impl Default for ExtensionParams {
    fn default() -> Self {
        Self {
            reason: default_reason(),
            extra_distance_km: None,
            vehicle_number: None,
        }
    }
}

/// Portal answer to one extension attempt.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExtendOutcome {
    /// Portal accepted the extension
    Extended { valid_until: Option<String> },
    /// Portal refused for a business reason (not yet in the extension
    /// window, already maximally extended, ...). Never retried.
    BusinessRejected { reason: String },
    /// Network-class failure; the caller may retry
    TransientError { message: String },
}

/// Filter for auto-selecting bills to extend.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EligibilityFilter {
    /// Select bills whose validity ends within this many days
    pub days_to_expiry: u32,
    /// Skip bills that already consumed this many extensions
    pub max_extensions: u32,
}

impl Default for EligibilityFilter {
    fn default() -> Self {
        Self {
            days_to_expiry: 1,
            max_extensions: 3,
        }
    }
}

/// One bill returned by the portal's consolidated report.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EligibleBill {
    pub ewb_number: String,
    pub valid_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub extensions_used: u32,
}

/// Current portal-side state of a bill.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillState {
    pub ewb_number: String,
    pub valid_until: Option<String>,
    pub from_place: Option<String>,
    pub to_place: Option<String>,
    pub vehicle_number: Option<String>,
}

/// Imperative operations against the portal through one browser context.
///
/// Every method must come back within a bounded time; the lease layer
/// wraps calls in a hard timeout and classifies an elapsed timeout as a
/// transient failure. Implementations never complete a login themselves:
/// `detect_login_completion` only observes what the human did.
#[async_trait]
pub trait PortalDriver: Send + Sync {
    /// Navigate the context to the portal login page.
    async fn open_login_surface(&self) -> Result<(), DriverError>;

    /// Capture the current CAPTCHA challenge as PNG bytes.
    async fn capture_captcha(&self) -> Result<Vec<u8>, DriverError>;

    /// Wait up to `timeout` for the post-login portal state to appear.
    /// Returns `false` if the human has not completed login yet.
    async fn detect_login_completion(&self, timeout: Duration) -> Result<bool, DriverError>;

    /// Drive the extension form for one bill and classify the answer.
    async fn extend_bill(
        &self,
        ewb_number: &str,
        params: &ExtensionParams,
    ) -> Result<ExtendOutcome, DriverError>;

    /// Query the portal for bills matching the filter, in portal order.
    async fn resolve_eligible(
        &self,
        filter: &EligibilityFilter,
    ) -> Result<Vec<EligibleBill>, DriverError>;

    /// Read the current state of one bill.
    async fn read_bill_state(&self, ewb_number: &str) -> Result<BillState, DriverError>;

    /// Lightweight request that keeps the portal session warm.
    async fn keep_alive(&self) -> Result<(), DriverError>;

    /// Tear the browser context down. Idempotent.
    async fn close(&self);
}

/// Launches one driver handle per login attempt.
#[async_trait]
pub trait PortalDriverFactory: Send + Sync {
    async fn launch(&self, session_id: &str) -> Result<Arc<dyn PortalDriver>, DriverError>;
}
