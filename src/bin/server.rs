//! E-way Bill Extender - Standalone Web Server
//!
//! Runs the automation core with a web dashboard accessible via browser.
//! Build: `cargo build --release --bin server`
//!
//! Environment variables:
//! - `EWB_WEB_PORT` - Server port (default: 8080)
//! - `EWB_WEB_USER` - Basic auth username (default: "admin")
//! - `EWB_WEB_PASS` - Basic auth password (auth disabled if not set)

use std::sync::Arc;
use tracing::info;

use app_lib::driver::ChromiumDriverFactory;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _guard = app_lib::init_logging();

    info!("Starting E-way Bill Extender (server mode)");

    if let Some(dir) = app_lib::log_dir() {
        info!("Log files saved to: {}", dir.display());
    }

    // Read port from environment
    let port: u16 = std::env::var("EWB_WEB_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);

    // Log auth status
    if std::env::var("EWB_WEB_PASS").map(|p| !p.is_empty()).unwrap_or(false) {
        let user = std::env::var("EWB_WEB_USER").unwrap_or_else(|_| "admin".to_string());
        info!("Basic auth enabled (user: {})", user);
    } else {
        info!("Basic auth disabled (set EWB_WEB_PASS to enable)");
    }

    // Initialize application state around the chromium portal driver
    let state = {
        let config = app_lib::AppConfig::load();
        let mut driver_config = config.driver.clone();

        // The human must see the browser to solve the CAPTCHA. Only run
        // headless when a display is genuinely absent (remote tooling can
        // still attach through Xvfb).
        let has_display = cfg!(target_os = "windows")
            || cfg!(target_os = "macos")
            || std::env::var("DISPLAY").map(|d| !d.is_empty()).unwrap_or(false);

        if !has_display && !driver_config.headless {
            info!("Server mode: no DISPLAY - forcing headless browser");
            driver_config.headless = true;
        } else if has_display && driver_config.headless {
            info!("Server mode: display available - CAPTCHA login needs a visible browser");
        }

        Arc::new(app_lib::AppState::new(Arc::new(ChromiumDriverFactory::new(
            driver_config,
        ))))
    };

    state.start().await;

    info!("Application state initialized");
    info!("Dashboard: http://0.0.0.0:{}", port);

    // Start the web server (blocks until shutdown)
    app_lib::web::start_server(state, port)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;

    Ok(())
}
