//! Chromium-backed portal driver
//!
//! Drives the e-way bill portal through a real Chrome instance. One
//! driver owns one browser context; the session manager launches one per
//! login and closes it when the session dies. Login stays fully manual:
//! this driver only opens the login page, hands the CAPTCHA image out and
//! watches for the post-login state the human produces.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::{Browser, BrowserConfig, Page};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use futures::StreamExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{
    BillState, DriverError, EligibilityFilter, EligibleBill, ExtendOutcome, ExtensionParams,
    PortalDriver, PortalDriverFactory,
};

/// Find Chrome/Chromium executable on the system
fn find_chrome() -> Option<PathBuf> {
    let candidates: Vec<PathBuf> = if cfg!(target_os = "windows") {
        let mut paths = vec![
            PathBuf::from(r"C:\Program Files\Google\Chrome\Application\chrome.exe"),
            PathBuf::from(r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe"),
        ];
        if let Ok(local) = std::env::var("LOCALAPPDATA") {
            paths.push(PathBuf::from(format!(
                r"{}\Google\Chrome\Application\chrome.exe",
                local
            )));
        }
        paths
    } else if cfg!(target_os = "macos") {
        vec![PathBuf::from(
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        )]
    } else {
        vec![
            PathBuf::from("/usr/bin/google-chrome"),
            PathBuf::from("/usr/bin/google-chrome-stable"),
            PathBuf::from("/usr/bin/chromium"),
            PathBuf::from("/usr/bin/chromium-browser"),
        ]
    };

    candidates.into_iter().find(|p| p.exists())
}

/// Configuration for the chromium driver
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChromiumDriverConfig {
    /// Path to Chrome/Chromium executable (auto-detected if unset)
    pub chrome_path: Option<String>,
    /// Run in headless mode. A human cannot solve a CAPTCHA in a headless
    /// window, so this only makes sense behind remote display tooling.
    pub headless: bool,
    /// Window width
    pub window_width: u32,
    /// Window height
    pub window_height: u32,
    /// Portal login page
    pub login_url: String,
    /// Portal extension form page
    pub extension_url: String,
    /// Portal consolidated report page
    pub report_url: String,
}

impl Default for ChromiumDriverConfig {
    fn default() -> Self {
        Self {
            chrome_path: None,
            headless: false,
            window_width: 1440,
            window_height: 900,
            login_url: "https://ewaybillgst.gov.in/Login.aspx".to_string(),
            extension_url: "https://ewaybillgst.gov.in/Others/EWBExtend.aspx".to_string(),
            report_url: "https://ewaybillgst.gov.in/Reports/ConsReport_New.aspx".to_string(),
        }
    }
}

/// Success/error phrases the portal renders after a form submit.
const SUCCESS_INDICATORS: &[&str] = &[
    "successfully extended",
    "extension successful",
    "extended successfully",
    "extension completed",
];

const REJECTION_INDICATORS: &[&str] = &[
    "not eligible",
    "cannot be extended",
    "unable to extend",
    "already extended",
    "not found",
    "invalid e-way bill",
    "expired",
];

/// A portal driver over one Chrome instance.
pub struct ChromiumPortalDriver {
    id: String,
    config: ChromiumDriverConfig,
    browser: RwLock<Option<Browser>>,
    page: RwLock<Option<Page>>,
    alive: Arc<AtomicBool>,
}

impl ChromiumPortalDriver {
    /// Launch a browser context for one login session.
    pub async fn launch(
        config: ChromiumDriverConfig,
        session_id: &str,
    ) -> Result<Self, DriverError> {
        info!(
            "Launching portal browser for session {} (headless: {})",
            session_id, config.headless
        );

        if config.chrome_path.is_none() && find_chrome().is_none() {
            return Err(DriverError::LaunchFailed(
                "Chrome not found. Install Google Chrome or Chromium and restart.".to_string(),
            ));
        }

        let user_data_dir = std::env::temp_dir()
            .join("ewaybill-extender")
            .join("browser_data")
            .join(session_id);
        let _ = std::fs::create_dir_all(&user_data_dir);

        let mut builder = BrowserConfig::builder();

        if !config.headless {
            builder = builder.with_head();
        }

        if let Some(ref path) = config.chrome_path {
            builder = builder.chrome_executable(path);
        } else if let Some(chrome_path) = find_chrome() {
            debug!("Auto-detected Chrome at: {}", chrome_path.display());
            builder = builder.chrome_executable(chrome_path);
        }

        builder = builder
            .user_data_dir(&user_data_dir)
            .window_size(config.window_width, config.window_height)
            .arg("--no-default-browser-check")
            .arg("--disable-notifications")
            .arg("--disable-save-password-bubble")
            // Required when running as root (e.g., in Docker or on a VPS)
            .arg("--no-sandbox");

        let browser_config = builder
            .build()
            .map_err(DriverError::LaunchFailed)?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| DriverError::LaunchFailed(e.to_string()))?;

        // When the handler stream ends, Chrome has disconnected.
        let alive = Arc::new(AtomicBool::new(true));
        let alive_for_handler = alive.clone();
        let handler_id = session_id.to_string();
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Session {} CDP error: {}", handler_id, e);
                }
            }
            warn!("Session {} Chrome disconnected (event handler ended)", handler_id);
            alive_for_handler.store(false, Ordering::Relaxed);
        });

        // Chrome opens with a blank tab; reuse it and drop any extras.
        let page = {
            let mut pages = browser
                .pages()
                .await
                .map_err(|e| DriverError::LaunchFailed(e.to_string()))?;

            let main_page = if !pages.is_empty() {
                pages.remove(0)
            } else {
                browser
                    .new_page("about:blank")
                    .await
                    .map_err(|e| DriverError::LaunchFailed(e.to_string()))?
            };

            for extra in pages {
                let _ = extra.close().await;
            }

            main_page
        };

        info!("Portal browser ready for session {}", session_id);

        Ok(Self {
            id: session_id.to_string(),
            config,
            browser: RwLock::new(Some(browser)),
            page: RwLock::new(Some(page)),
            alive,
        })
    }

    /// Check the browser process is still attached.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    async fn page(&self) -> Result<Page, DriverError> {
        if !self.is_alive() {
            return Err(DriverError::ConnectionLost("Browser disconnected".into()));
        }
        self.page
            .read()
            .await
            .clone()
            .ok_or_else(|| DriverError::ConnectionLost("No active page".into()))
    }

    /// Navigate, classifying failures as transient (network-class).
    async fn goto(&self, url: &str) -> Result<Option<ExtendOutcome>, DriverError> {
        let page = self.page().await?;
        debug!("Session {} navigating to: {}", self.id, url);
        if let Err(e) = page.goto(url).await {
            return Ok(Some(ExtendOutcome::TransientError {
                message: format!("Navigation failed: {}", e),
            }));
        }
        let _ = page.wait_for_navigation().await;
        Ok(None)
    }

    /// Evaluate a JS expression, deserializing the result.
    async fn evaluate<T: serde::de::DeserializeOwned>(&self, expr: &str) -> Result<T, DriverError> {
        let page = self.page().await?;
        page.evaluate(expr)
            .await
            .map_err(|e| DriverError::EvaluationFailed(e.to_string()))?
            .into_value::<T>()
            .map_err(|e| DriverError::EvaluationFailed(e.to_string()))
    }

    /// Find the first element matching any of the given selectors.
    async fn find_any(
        &self,
        selectors: &[&str],
    ) -> Result<chromiumoxide::element::Element, DriverError> {
        let page = self.page().await?;
        for sel in selectors {
            if let Ok(el) = page.find_element(*sel).await {
                return Ok(el);
            }
        }
        Err(DriverError::ElementNotFound(selectors.join(", ")))
    }

    /// Clear an input via JS, then type into it.
    async fn fill(&self, selectors: &[&str], value: &str) -> Result<(), DriverError> {
        let element = self.find_any(selectors).await?;
        let _ = element.focus().await;
        // Clear any stale value before typing; the portal keeps form state
        // across postbacks.
        let clear = format!(
            "(() => {{ for (const s of {}) {{ const e = document.querySelector(s); if (e) {{ e.value = ''; return true; }} }} return false; }})()",
            serde_json::to_string(selectors).unwrap_or_else(|_| "[]".into())
        );
        let _: bool = self.evaluate(&clear).await.unwrap_or(false);
        element
            .type_str(value)
            .await
            .map_err(|e| DriverError::EvaluationFailed(e.to_string()))?;
        Ok(())
    }

    /// Lower-cased full page text.
    async fn page_text(&self) -> Result<String, DriverError> {
        let text: String = self
            .evaluate("document.body ? document.body.innerText : ''")
            .await?;
        Ok(text.to_lowercase())
    }

    /// First visible portal error message, if any.
    async fn read_error_banner(&self) -> Result<Option<String>, DriverError> {
        let expr = r#"(() => {
            const sels = ['.error', '.alert-danger', '[id*="lblError"]', '[id*="error"]', 'span[style*="color:Red"]', 'span[style*="color: red"]'];
            for (const s of sels) {
                const e = document.querySelector(s);
                if (e && e.innerText && e.innerText.trim()) return e.innerText.trim();
            }
            return null;
        })()"#;
        self.evaluate(expr).await
    }

    /// Pick a reason in the extension form's dropdown, matching by text.
    async fn select_reason(&self, reason: &str) -> Result<(), DriverError> {
        let expr = format!(
            r#"(() => {{
                const sel = document.querySelector('select[id*="ddlReason"], select[name*="ddlReason"], select[id*="Reason"]');
                if (!sel) return false;
                const want = {reason};
                for (const opt of sel.options) {{
                    if (opt.text.toLowerCase().includes(want.toLowerCase())) {{
                        sel.value = opt.value;
                        sel.dispatchEvent(new Event('change', {{ bubbles: true }}));
                        return true;
                    }}
                }}
                return false;
            }})()"#,
            reason = serde_json::to_string(reason).unwrap_or_else(|_| "\"\"".into())
        );
        let matched: bool = self.evaluate(&expr).await?;
        if !matched {
            debug!("Session {} reason '{}' not in dropdown, leaving default", self.id, reason);
        }
        Ok(())
    }
}

#[async_trait]
impl PortalDriver for ChromiumPortalDriver {
    async fn open_login_surface(&self) -> Result<(), DriverError> {
        let page = self.page().await?;
        page.goto(self.config.login_url.as_str())
            .await
            .map_err(|e| DriverError::NavigationFailed(e.to_string()))?;
        let _ = page.wait_for_navigation().await;
        Ok(())
    }

    async fn capture_captcha(&self) -> Result<Vec<u8>, DriverError> {
        let element = self
            .find_any(&["#imgcaptcha", "img[src*='Captcha']", "img[src*='captcha']"])
            .await?;
        element
            .screenshot(CaptureScreenshotFormat::Png)
            .await
            .map_err(|e| DriverError::EvaluationFailed(format!("CAPTCHA capture failed: {}", e)))
    }

    async fn detect_login_completion(&self, timeout: Duration) -> Result<bool, DriverError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let page = self.page().await?;
            let url = page
                .url()
                .await
                .map_err(|e| DriverError::ConnectionLost(e.to_string()))?
                .unwrap_or_default();

            // The portal redirects away from Login.aspx once the human has
            // signed in; a logged-in marker confirms it.
            if !url.to_lowercase().contains("login") {
                let marker: bool = self
                    .evaluate(
                        r#"(() => {
                            const t = document.body ? document.body.innerText.toLowerCase() : '';
                            return t.includes('logout') || t.includes('log out') || t.includes('dashboard') || t.includes('welcome');
                        })()"#,
                    )
                    .await
                    .unwrap_or(false);
                if marker {
                    info!("Session {} post-login state detected", self.id);
                    return Ok(true);
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    async fn extend_bill(
        &self,
        ewb_number: &str,
        params: &ExtensionParams,
    ) -> Result<ExtendOutcome, DriverError> {
        if let Some(outcome) = self.goto(&self.config.extension_url).await? {
            return Ok(outcome);
        }
        tokio::time::sleep(Duration::from_millis(1500)).await;

        self.fill(
            &["input[id*='txtEwbNo']", "input[name*='txtEwbNo']"],
            ewb_number,
        )
        .await?;

        let get_details = self
            .find_any(&[
                "input[value*='Get Details']",
                "input[value*='Get']",
                "button[id*='btnGet']",
                "input[id*='btnGet']",
            ])
            .await?;
        get_details
            .click()
            .await
            .map_err(|e| DriverError::EvaluationFailed(e.to_string()))?;
        tokio::time::sleep(Duration::from_millis(2500)).await;

        // An error banner at this point means the portal refused the bill
        // itself (bad number, outside the extension window, ...).
        if let Some(banner) = self.read_error_banner().await? {
            return Ok(ExtendOutcome::BusinessRejected { reason: banner });
        }

        self.select_reason(&params.reason).await?;

        if let Some(km) = params.extra_distance_km {
            self.fill(
                &[
                    "input[id*='txtRemainingDistance']",
                    "input[id*='txtDistance']",
                    "input[name*='Distance']",
                ],
                &format!("{}", km),
            )
            .await
            .ok();
        }

        if let Some(ref vehicle) = params.vehicle_number {
            if !vehicle.is_empty() {
                self.fill(
                    &["input[id*='txtVehNo']", "input[name*='txtVehNo']"],
                    vehicle,
                )
                .await
                .ok();
            }
        }

        let submit = self
            .find_any(&[
                "input[value*='Submit']",
                "input[value*='Extend']",
                "input[id*='btnSubmit']",
                "button[id*='btnSubmit']",
            ])
            .await?;
        submit
            .click()
            .await
            .map_err(|e| DriverError::EvaluationFailed(e.to_string()))?;
        tokio::time::sleep(Duration::from_millis(4000)).await;

        let text = self.page_text().await?;

        if SUCCESS_INDICATORS.iter().any(|s| text.contains(s)) {
            // Validity shown after a successful extension, e.g. "valid upto 21/03/2026"
            let valid_until = text
                .split("valid upto")
                .nth(1)
                .and_then(|rest| rest.split_whitespace().next())
                .map(|s| s.trim_matches(|c: char| !c.is_ascii_digit() && c != '/').to_string())
                .filter(|s| !s.is_empty());
            return Ok(ExtendOutcome::Extended { valid_until });
        }

        if let Some(banner) = self.read_error_banner().await? {
            return Ok(ExtendOutcome::BusinessRejected { reason: banner });
        }

        if REJECTION_INDICATORS.iter().any(|s| text.contains(s)) {
            return Ok(ExtendOutcome::BusinessRejected {
                reason: "Portal refused the extension".to_string(),
            });
        }

        // No clear verdict on the page; treat as transient so the caller
        // retries rather than mis-reporting success.
        Ok(ExtendOutcome::TransientError {
            message: "No confirmation found after submit".to_string(),
        })
    }

    async fn resolve_eligible(
        &self,
        filter: &EligibilityFilter,
    ) -> Result<Vec<EligibleBill>, DriverError> {
        self.goto(&self.config.report_url)
            .await?
            .map_or(Ok(()), |o| match o {
                ExtendOutcome::TransientError { message } => {
                    Err(DriverError::NavigationFailed(message))
                }
                _ => Ok(()),
            })?;
        tokio::time::sleep(Duration::from_millis(2500)).await;

        // Scrape the report grid: a 12-digit number column, a validity
        // column, and (when present) an extensions-used column.
        let rows: Vec<serde_json::Value> = self
            .evaluate(
                r#"(() => {
                    const out = [];
                    for (const tr of document.querySelectorAll('table tr')) {
                        const cells = Array.from(tr.querySelectorAll('td')).map(td => td.innerText.trim());
                        const ewb = cells.find(c => /^\d{12}$/.test(c));
                        if (!ewb) continue;
                        const validUntil = cells.find(c => /^\d{2}\/\d{2}\/\d{4}/.test(c)) || null;
                        const ext = cells.find(c => /^\d{1,2}$/.test(c)) || null;
                        out.push({ ewb: ewb, validUntil: validUntil, extensions: ext });
                    }
                    return out;
                })()"#,
            )
            .await?;

        let now = Utc::now();
        let window = chrono::Duration::days(i64::from(filter.days_to_expiry));
        let mut eligible = Vec::new();

        for row in rows {
            let ewb = match row.get("ewb").and_then(|v| v.as_str()) {
                Some(e) => e.to_string(),
                None => continue,
            };
            let valid_until = row
                .get("validUntil")
                .and_then(|v| v.as_str())
                .and_then(parse_portal_date);
            let extensions_used = row
                .get("extensions")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<u32>().ok())
                .unwrap_or(0);

            let expiring = match valid_until {
                Some(ts) => ts >= now && ts - now <= window,
                // No readable validity: let the portal be the judge.
                None => true,
            };

            if expiring && extensions_used < filter.max_extensions {
                eligible.push(EligibleBill {
                    ewb_number: ewb,
                    valid_until,
                    extensions_used,
                });
            }
        }

        info!(
            "Session {} resolved {} eligible bill(s) within {} day(s)",
            self.id,
            eligible.len(),
            filter.days_to_expiry
        );
        Ok(eligible)
    }

    async fn read_bill_state(&self, ewb_number: &str) -> Result<BillState, DriverError> {
        if let Some(ExtendOutcome::TransientError { message }) =
            self.goto(&self.config.extension_url).await?
        {
            return Err(DriverError::NavigationFailed(message));
        }
        tokio::time::sleep(Duration::from_millis(1500)).await;

        self.fill(
            &["input[id*='txtEwbNo']", "input[name*='txtEwbNo']"],
            ewb_number,
        )
        .await?;
        let get_details = self
            .find_any(&["input[value*='Get']", "button[id*='btnGet']", "input[id*='btnGet']"])
            .await?;
        get_details
            .click()
            .await
            .map_err(|e| DriverError::EvaluationFailed(e.to_string()))?;
        tokio::time::sleep(Duration::from_millis(2500)).await;

        let state: serde_json::Value = self
            .evaluate(
                r#"(() => {
                    const grab = (pat) => {
                        const el = document.querySelector(`[id*="${pat}"]`);
                        return el && el.innerText ? el.innerText.trim() : (el && el.value ? el.value : null);
                    };
                    return {
                        validUntil: grab('lblValid') || grab('ValidUpto'),
                        fromPlace: grab('FromPlace'),
                        toPlace: grab('ToPlace'),
                        vehicle: grab('VehNo'),
                    };
                })()"#,
            )
            .await?;

        Ok(BillState {
            ewb_number: ewb_number.to_string(),
            valid_until: state
                .get("validUntil")
                .and_then(|v| v.as_str())
                .map(String::from),
            from_place: state
                .get("fromPlace")
                .and_then(|v| v.as_str())
                .map(String::from),
            to_place: state.get("toPlace").and_then(|v| v.as_str()).map(String::from),
            vehicle_number: state
                .get("vehicle")
                .and_then(|v| v.as_str())
                .map(String::from),
        })
    }

    async fn keep_alive(&self) -> Result<(), DriverError> {
        let _: String = self.evaluate("document.title").await?;
        Ok(())
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::Relaxed);

        {
            let mut page = self.page.write().await;
            if let Some(p) = page.take() {
                let _ = p.close().await;
            }
        }

        {
            let mut browser = self.browser.write().await;
            if let Some(mut b) = browser.take() {
                let _ = b.close().await;
                let _ = b.wait().await;
            }
        }

        info!("Portal browser for session {} closed", self.id);
    }
}

/// Parse the portal's `dd/mm/yyyy` / `dd/mm/yyyy hh:mm` date strings.
fn parse_portal_date(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%d/%m/%Y %H:%M") {
        return Some(Utc.from_utc_datetime(&dt));
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%d/%m/%Y") {
        return d.and_hms_opt(23, 59, 59).map(|dt| Utc.from_utc_datetime(&dt));
    }
    None
}

/// Launches one chromium driver per login session.
pub struct ChromiumDriverFactory {
    config: ChromiumDriverConfig,
}

impl ChromiumDriverFactory {
    pub fn new(config: ChromiumDriverConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PortalDriverFactory for ChromiumDriverFactory {
    async fn launch(&self, session_id: &str) -> Result<Arc<dyn PortalDriver>, DriverError> {
        let driver = ChromiumPortalDriver::launch(self.config.clone(), session_id).await?;
        Ok(Arc::new(driver))
    }
}
