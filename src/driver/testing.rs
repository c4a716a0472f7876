//! Scripted portal driver for tests
//!
//! Deterministic stand-in for the chromium driver: per-bill outcome
//! scripts, a switchable login signal and optional gates to synchronize
//! tests with mid-batch events.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, Notify};

use super::{
    BillState, DriverError, EligibilityFilter, EligibleBill, ExtendOutcome, ExtensionParams,
    PortalDriver, PortalDriverFactory,
};

/// One scripted response to an `extend_bill` call.
pub enum ScriptedCall {
    /// Return the outcome immediately
    Outcome(ExtendOutcome),
    /// Fail at the driver level
    Fault(String),
    /// Park until the test releases the notify, then return the outcome
    GatedOutcome(Arc<Notify>, ExtendOutcome),
}

/// A fully scripted portal driver.
#[derive(Default)]
pub struct FakePortalDriver {
    /// Per-bill FIFO of responses; an exhausted (or missing) script
    /// succeeds by default.
    extend_script: Mutex<HashMap<String, VecDeque<ScriptedCall>>>,
    /// Bills returned by `resolve_eligible`
    eligible: Mutex<Vec<EligibleBill>>,
    /// Whether `detect_login_completion` reports success
    login_complete: AtomicBool,
    /// Total extend calls observed
    pub extend_calls: AtomicU32,
    /// Keep-alive calls observed
    pub keep_alive_calls: AtomicU32,
    /// Set once `close` ran
    pub closed: AtomicBool,
    /// Every extend call's bill number is sent here, in order
    call_log: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl FakePortalDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for the given bill.
    pub async fn script(&self, ewb_number: &str, call: ScriptedCall) {
        self.extend_script
            .lock()
            .await
            .entry(ewb_number.to_string())
            .or_default()
            .push_back(call);
    }

    pub async fn set_eligible(&self, bills: Vec<EligibleBill>) {
        *self.eligible.lock().await = bills;
    }

    pub fn set_login_complete(&self, complete: bool) {
        self.login_complete.store(complete, Ordering::Relaxed);
    }

    /// Receive each extend call's bill number as it happens.
    pub async fn watch_calls(&self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.call_log.lock().await = Some(tx);
        rx
    }
}

#[async_trait]
impl PortalDriver for FakePortalDriver {
    async fn open_login_surface(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn capture_captcha(&self) -> Result<Vec<u8>, DriverError> {
        Ok(vec![0x89, b'P', b'N', b'G'])
    }

    async fn detect_login_completion(&self, timeout: Duration) -> Result<bool, DriverError> {
        if self.login_complete.load(Ordering::Relaxed) {
            return Ok(true);
        }
        tokio::time::sleep(timeout).await;
        Ok(self.login_complete.load(Ordering::Relaxed))
    }

    async fn extend_bill(
        &self,
        ewb_number: &str,
        _params: &ExtensionParams,
    ) -> Result<ExtendOutcome, DriverError> {
        self.extend_calls.fetch_add(1, Ordering::Relaxed);
        if let Some(tx) = self.call_log.lock().await.as_ref() {
            let _ = tx.send(ewb_number.to_string());
        }

        let next = self
            .extend_script
            .lock()
            .await
            .get_mut(ewb_number)
            .and_then(|q| q.pop_front());

        match next {
            None => Ok(ExtendOutcome::Extended { valid_until: None }),
            Some(ScriptedCall::Outcome(outcome)) => Ok(outcome),
            Some(ScriptedCall::Fault(msg)) => Err(DriverError::ConnectionLost(msg)),
            Some(ScriptedCall::GatedOutcome(gate, outcome)) => {
                gate.notified().await;
                Ok(outcome)
            }
        }
    }

    async fn resolve_eligible(
        &self,
        _filter: &EligibilityFilter,
    ) -> Result<Vec<EligibleBill>, DriverError> {
        Ok(self.eligible.lock().await.clone())
    }

    async fn read_bill_state(&self, ewb_number: &str) -> Result<BillState, DriverError> {
        Ok(BillState {
            ewb_number: ewb_number.to_string(),
            valid_until: None,
            from_place: None,
            to_place: None,
            vehicle_number: None,
        })
    }

    async fn keep_alive(&self) -> Result<(), DriverError> {
        self.keep_alive_calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

/// Hands the same fake driver to every launch.
pub struct FakeDriverFactory {
    driver: Arc<FakePortalDriver>,
    /// When set, launches fail (for trigger-login failure paths)
    pub fail_launch: AtomicBool,
}

impl FakeDriverFactory {
    pub fn new(driver: Arc<FakePortalDriver>) -> Self {
        Self {
            driver,
            fail_launch: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl PortalDriverFactory for FakeDriverFactory {
    async fn launch(&self, _session_id: &str) -> Result<Arc<dyn PortalDriver>, DriverError> {
        if self.fail_launch.load(Ordering::Relaxed) {
            return Err(DriverError::LaunchFailed("scripted launch failure".into()));
        }
        Ok(self.driver.clone())
    }
}
