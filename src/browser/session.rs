use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use thirtyfour::prelude::*;
use thirtyfour::Capabilities;
use thirtyfour::common::capabilities::firefox::FirefoxPreferences;
use tokio::time::sleep;
use tracing::{debug, error, warn};
use url::Url;

use crate::browser::actions::Action;
use crate::browser::renderer::{ElementItem, RenderOutput, RenderSession, Renderer};
use crate::browser::script;
use crate::cli::config::RendererSettings;
use crate::error::RenderError;
use crate::group::config::{BrowserChoice, TaskConfig};
use crate::proxy::ProxyConfig;

/// Poll interval while waiting for `wait_for_selector`
const SELECTOR_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Render collaborator driving Chrome or Firefox through a WebDriver server
pub struct WebDriverRenderer {
    settings: RendererSettings,
}

impl WebDriverRenderer {
    pub fn new(settings: RendererSettings) -> Self {
        Self { settings }
    }

    fn chrome_capabilities(&self, config: &TaskConfig, proxy: Option<&ProxyConfig>) -> WebDriverResult<Capabilities> {
        let mut caps = DesiredCapabilities::chrome();
        let profile = config.device.profile();
        let (width, height) = config.viewport();

        if self.settings.headless {
            caps.set_headless()?;
        }
        caps.add_chrome_arg("--disable-dev-shm-usage")?;
        caps.add_chrome_arg("--disable-extensions")?;
        caps.add_chrome_arg("--disable-gpu")?;
        caps.add_chrome_arg("--no-first-run")?;
        caps.add_chrome_arg("--no-sandbox")?;

        if profile.is_mobile {
            let mut emulation = json!({
                "deviceMetrics": {
                    "width": width,
                    "height": height,
                    "pixelRatio": profile.pixel_ratio,
                    "touch": true,
                }
            });
            if let Some(user_agent) = config.effective_user_agent() {
                emulation["userAgent"] = json!(user_agent);
            }
            caps.add_chrome_option("mobileEmulation", emulation)?;
        } else {
            caps.add_chrome_arg(&format!("--window-size={},{}", width, height))?;
            if let Some(user_agent) = config.effective_user_agent() {
                caps.add_chrome_arg(&format!("--user-agent={}", user_agent))?;
            }
        }

        if config.disable_javascript {
            caps.add_chrome_arg("--blink-settings=scriptEnabled=false")?;
        }

        if let Some(proxy) = proxy {
            caps.add_chrome_arg(&format!("--proxy-server={}", proxy_server(proxy)))?;
        }

        Ok(caps.into())
    }

    fn firefox_capabilities(&self, config: &TaskConfig, proxy: Option<&ProxyConfig>) -> WebDriverResult<Capabilities> {
        let mut caps = DesiredCapabilities::firefox();
        let mut prefs = FirefoxPreferences::new();

        if self.settings.headless {
            caps.add_firefox_arg("-headless")?;
        }

        if let Some(user_agent) = config.effective_user_agent() {
            prefs.set_user_agent(user_agent)?;
        }

        if config.disable_javascript {
            prefs.set("javascript.enabled", false)?;
        }

        if let Some(proxy) = proxy {
            // Manual proxy configuration
            prefs.set("network.proxy.type", 1)?;
            if proxy.protocol.starts_with("socks") {
                prefs.set("network.proxy.socks", proxy.host.clone())?;
                prefs.set("network.proxy.socks_port", proxy.port)?;
            } else {
                prefs.set("network.proxy.http", proxy.host.clone())?;
                prefs.set("network.proxy.http_port", proxy.port)?;
                prefs.set("network.proxy.ssl", proxy.host.clone())?;
                prefs.set("network.proxy.ssl_port", proxy.port)?;
            }
        }

        caps.set_preferences(prefs)?;
        Ok(caps.into())
    }

    async fn start_driver(&self, config: &TaskConfig, proxy: Option<&ProxyConfig>) -> Result<WebDriver, RenderError> {
        if proxy.map_or(false, |p| p.username.is_some()) {
            warn!("WebDriver sessions cannot authenticate against proxies; credentials are ignored");
        }

        let (server, caps) = match config.browser {
            BrowserChoice::Chrome => (&self.settings.chrome_url, self.chrome_capabilities(config, proxy)?),
            BrowserChoice::Firefox => (&self.settings.firefox_url, self.firefox_capabilities(config, proxy)?),
        };

        debug!("Starting {} session on {}", config.browser, server);
        let driver = WebDriver::new(server, caps)
            .await
            .map_err(|e| RenderError::Connect(e.to_string()))?;

        driver
            .set_page_load_timeout(Duration::from_secs(self.settings.request_timeout_secs))
            .await?;

        Ok(driver)
    }
}

#[async_trait]
impl Renderer for WebDriverRenderer {
    async fn connect(
        &self,
        config: &TaskConfig,
        proxy: Option<&ProxyConfig>,
    ) -> Result<Box<dyn RenderSession>, RenderError> {
        let driver = self.start_driver(config, proxy).await?;
        let mut session = WebDriverSession {
            driver: Some(driver),
            pixel_ratio: config.device.profile().pixel_ratio,
        };

        // A session only counts once the page is loaded through this proxy
        if let Err(e) = session.load_page_and_check(config).await {
            session.close().await;
            return Err(e);
        }

        Ok(Box::new(session))
    }
}

/// Live browser with the target page loaded
pub struct WebDriverSession {
    driver: Option<WebDriver>,
    pixel_ratio: f64,
}

impl WebDriverSession {
    fn driver(&self) -> Result<&WebDriver, RenderError> {
        self.driver
            .as_ref()
            .ok_or_else(|| RenderError::Capture("browser session already closed".to_string()))
    }

    async fn load_page_and_check(&self, config: &TaskConfig) -> Result<(), RenderError> {
        let driver = self.driver()?;

        sleep(config.before_load_delay()).await;

        debug!("Loading {}", config.url);
        driver.goto(&config.url).await.map_err(|e| RenderError::Navigation {
            url: config.url.clone(),
            reason: e.to_string(),
        })?;

        sleep(config.after_load_delay()).await;

        if let Some(selector) = &config.wait_for_selector {
            driver
                .query(By::Css(selector.as_str()))
                .wait(config.selector_timeout(), SELECTOR_POLL_INTERVAL)
                .first()
                .await
                .map_err(|_| RenderError::Timeout(config.selector_timeout()))?;
        }

        let current = driver.current_url().await?;
        check_hostname(&config.url, current.as_str())
    }

    /// Run a script whose failure should not abort the capture
    async fn safe_execute(&self, script: &str) -> Option<serde_json::Value> {
        let driver = self.driver().ok()?;
        match driver.execute(script, Vec::new()).await {
            Ok(ret) => Some(ret.json().clone()),
            Err(e) => {
                warn!("Script failed: {}", e);
                None
            }
        }
    }

    async fn perform_actions(&self, actions: &[Action], pause: Duration) {
        for action in actions {
            let js = action.to_javascript();
            debug!("Performing {:?}: {}", action, js);
            self.safe_execute(&js).await;
            self.safe_execute(script::TRIGGER_REFLOW).await;
            sleep(pause).await;
        }
    }

    async fn detect_elements(&self, config: &TaskConfig) -> Option<Vec<ElementItem>> {
        let driver = self.driver().ok()?;
        self.safe_execute(script::TRIGGER_REFLOW).await;

        let args = vec![
            json!(config.full_page_screenshot),
            json!(config.capture_invisible_elements),
            json!(self.pixel_ratio),
        ];
        let ret = match driver.execute(script::DETECT_ELEMENTS, args).await {
            Ok(ret) => ret,
            Err(e) => {
                warn!("Element detection failed: {}", e);
                return None;
            }
        };

        match serde_json::from_value::<Vec<ElementItem>>(ret.json().clone()) {
            Ok(items) => Some(items),
            Err(e) => {
                warn!("Unexpected element detection result: {}", e);
                None
            }
        }
    }

    async fn full_page_screenshot(&self, config: &TaskConfig) -> Result<Vec<u8>, RenderError> {
        let driver = self.driver()?;
        let (width, height) = config.viewport();

        let size: Option<(u32, u32)> = self
            .safe_execute(script::DOCUMENT_SIZE)
            .await
            .and_then(|v| serde_json::from_value(v).ok());

        match size {
            Some((_, page_height)) if page_height > height => {
                driver.set_window_rect(0, 0, width.into(), page_height.into()).await?;
                let png = driver.screenshot_as_png().await;
                driver.set_window_rect(0, 0, width.into(), height.into()).await?;
                Ok(png?)
            }
            _ => Ok(driver.screenshot_as_png().await?),
        }
    }
}

#[async_trait]
impl RenderSession for WebDriverSession {
    async fn render(&mut self, config: &TaskConfig) -> Result<RenderOutput, RenderError> {
        let mut actions = config.actions.clone().unwrap_or_default();
        if config.full_page_screenshot && !actions.is_empty() {
            actions.push(Action::ScrollToTop);
        }
        self.perform_actions(&actions, config.scroll_pause()).await;

        let elements = if config.capture_visible_elements || config.capture_invisible_elements {
            self.detect_elements(config).await
        } else {
            None
        };

        let screenshot = if config.full_page_screenshot {
            self.full_page_screenshot(config).await?
        } else {
            self.driver()?.screenshot_as_png().await?
        };

        Ok(RenderOutput {
            screenshot,
            elements,
            labelled_screenshot: None,
        })
    }

    async fn close(&mut self) {
        if let Some(driver) = self.driver.take() {
            if let Err(e) = driver.quit().await {
                error!("Error closing browser session: {}", e);
            }
            debug!("Browser session closed");
        }
    }
}

impl Drop for WebDriverSession {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            // Spawn a task to quit the driver
            tokio::spawn(async move {
                if let Err(e) = driver.quit().await {
                    error!("Error closing browser session during drop: {}", e);
                }
            });
        }
    }
}

/// Value of Chrome's `--proxy-server`; credentials cannot be passed this way
fn proxy_server(proxy: &ProxyConfig) -> String {
    format!("{}://{}", proxy.protocol, proxy.address())
}

fn normalize_hostname(host: &str) -> &str {
    host.strip_prefix("www.").unwrap_or(host)
}

/// Fail when the browser ended up on another host than requested
pub fn check_hostname(requested: &str, current: &str) -> Result<(), RenderError> {
    let host_of = |url: &str| {
        Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| normalize_hostname(h).to_string()))
            .unwrap_or_default()
    };

    let expected = host_of(requested);
    let actual = host_of(current);
    if expected == actual {
        Ok(())
    } else {
        Err(RenderError::HostnameMismatch { expected, actual })
    }
}
