use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

use crate::browser::actions::Action;
use crate::browser::device::Device;
use crate::error::{Error, Result};
use crate::proxy::ProxyChain;
use crate::storage::artifacts::ArtifactLocation;

/// Browser used to render the page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BrowserChoice {
    #[default]
    Chrome,
    Firefox,
}

impl fmt::Display for BrowserChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrowserChoice::Chrome => write!(f, "chrome"),
            BrowserChoice::Firefox => write!(f, "firefox"),
        }
    }
}

/// Browser window dimensions, written as `WIDTHxHEIGHT`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WindowSize {
    pub width: u32,
    pub height: u32,
}

impl FromStr for WindowSize {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let invalid = || format!("window_size must be in the format 'widthxheight', e.g. '1920x1080', got '{}'", s);
        let (width, height) = s.split_once('x').ok_or_else(invalid)?;
        let width = width.parse().map_err(|_| invalid())?;
        let height = height.parse().map_err(|_| invalid())?;
        Ok(Self { width, height })
    }
}

impl TryFrom<String> for WindowSize {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<WindowSize> for String {
    fn from(size: WindowSize) -> Self {
        size.to_string()
    }
}

impl fmt::Display for WindowSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Fully resolved configuration of one screenshot task
///
/// Produced once, when the group is created, by layering the per-site override
/// over the group default. Everything downstream (queue payload, artifact folder
/// name, render collaborator) works from this concrete value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub url: String,
    pub browser: BrowserChoice,
    pub device: Device,
    pub full_page_screenshot: bool,
    pub capture_visible_elements: bool,
    pub capture_invisible_elements: bool,
    pub window_size: Option<WindowSize>,
    pub user_agent: Option<String>,
    pub proxy: Option<ProxyChain>,

    /// Seconds to wait once the page has loaded
    pub wait_after_load: f64,

    /// Seconds to wait before loading; drawn at random (0..5s) when unset
    pub wait_before_load: Option<f64>,

    pub wait_for_selector: Option<String>,
    pub wait_for_selector_timeout: f64,

    /// Pause between scripted actions, in seconds
    pub scroll_pause_time: f64,

    pub actions: Option<Vec<Action>>,
    pub disable_javascript: bool,
}

/// Partial configuration; unset fields inherit from the layer below
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TaskConfigOverride {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser: Option<BrowserChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<Device>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_page_screenshot: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture_visible_elements: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture_invisible_elements: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_size: Option<WindowSize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyChain>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_after_load: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_before_load: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_for_selector: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_for_selector_timeout: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scroll_pause_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actions: Option<Vec<Action>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disable_javascript: Option<bool>,
}

impl TaskConfigOverride {
    /// Layer `top` over `self`; set fields of `top` win, lists are replaced wholesale
    pub fn layered(&self, top: &TaskConfigOverride) -> TaskConfigOverride {
        TaskConfigOverride {
            url: top.url.clone().or_else(|| self.url.clone()),
            browser: top.browser.or(self.browser),
            device: top.device.or(self.device),
            full_page_screenshot: top.full_page_screenshot.or(self.full_page_screenshot),
            capture_visible_elements: top.capture_visible_elements.or(self.capture_visible_elements),
            capture_invisible_elements: top.capture_invisible_elements.or(self.capture_invisible_elements),
            window_size: top.window_size.or(self.window_size),
            user_agent: top.user_agent.clone().or_else(|| self.user_agent.clone()),
            proxy: top.proxy.clone().or_else(|| self.proxy.clone()),
            wait_after_load: top.wait_after_load.or(self.wait_after_load),
            wait_before_load: top.wait_before_load.or(self.wait_before_load),
            wait_for_selector: top.wait_for_selector.clone().or_else(|| self.wait_for_selector.clone()),
            wait_for_selector_timeout: top.wait_for_selector_timeout.or(self.wait_for_selector_timeout),
            scroll_pause_time: top.scroll_pause_time.or(self.scroll_pause_time),
            actions: top.actions.clone().or_else(|| self.actions.clone()),
            disable_javascript: top.disable_javascript.or(self.disable_javascript),
        }
    }

    /// Fill the remaining gaps with built-in defaults and validate the result
    pub fn into_config(self) -> Result<TaskConfig> {
        let url = self
            .url
            .ok_or_else(|| Error::InvalidConfig("url is required".to_string()))?;
        validate_url(&url)?;

        let wait_after_load = validate_seconds("wait_after_load", self.wait_after_load.unwrap_or(5.0))?;
        let wait_before_load = self
            .wait_before_load
            .map(|secs| validate_seconds("wait_before_load", secs))
            .transpose()?;
        let wait_for_selector_timeout =
            validate_seconds("wait_for_selector_timeout", self.wait_for_selector_timeout.unwrap_or(10.0))?;
        let scroll_pause_time = validate_seconds("scroll_pause_time", self.scroll_pause_time.unwrap_or(0.1))?;

        if let Some(actions) = &self.actions {
            for action in actions {
                action.validate().map_err(Error::InvalidConfig)?;
            }
        }

        Ok(TaskConfig {
            url,
            browser: self.browser.unwrap_or_default(),
            device: self.device.unwrap_or_default(),
            full_page_screenshot: self.full_page_screenshot.unwrap_or(true),
            capture_visible_elements: self.capture_visible_elements.unwrap_or(true),
            capture_invisible_elements: self.capture_invisible_elements.unwrap_or(false),
            window_size: self.window_size,
            user_agent: self.user_agent,
            // An empty list means "no proxy"
            proxy: self.proxy.filter(|chain| !chain.is_empty()),
            wait_after_load,
            wait_before_load,
            wait_for_selector: self.wait_for_selector,
            wait_for_selector_timeout,
            scroll_pause_time,
            actions: self.actions,
            disable_javascript: self.disable_javascript.unwrap_or(false),
        })
    }
}

/// One entry of a group request: a bare URL or a URL with a partial override
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SiteSpec {
    Url(String),
    Config(TaskConfigOverride),
}

impl From<&str> for SiteSpec {
    fn from(url: &str) -> Self {
        SiteSpec::Url(url.to_string())
    }
}

impl SiteSpec {
    /// Compute the effective config for this site
    ///
    /// The default's own `url` is ignored; the site always supplies it. `position`
    /// is only used in the error message.
    pub fn resolve(&self, default: &TaskConfigOverride, position: usize) -> Result<TaskConfig> {
        let base = TaskConfigOverride {
            url: None,
            ..default.clone()
        };

        let effective = match self {
            SiteSpec::Url(url) => base.layered(&TaskConfigOverride {
                url: Some(url.clone()),
                ..Default::default()
            }),
            SiteSpec::Config(site) => {
                if site.url.is_none() {
                    return Err(Error::InvalidConfig(format!(
                        "url is required in sites' items, position {}",
                        position
                    )));
                }
                base.layered(site)
            }
        };

        effective.into_config().map_err(|e| match e {
            Error::InvalidConfig(reason) => Error::InvalidConfig(format!("site {}: {}", position, reason)),
            other => other,
        })
    }
}

/// Check the URL against stricter constraints than plain parsing
pub fn validate_url(url: &str) -> Result<Url> {
    let parsed = Url::parse(url).map_err(|e| Error::InvalidConfig(format!("invalid url '{}': {}", url, e)))?;

    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(Error::InvalidConfig(format!(
            "invalid url scheme in '{}' (only 'http' and 'https' are allowed)",
            url
        )));
    }

    match parsed.host_str() {
        None | Some("") => {
            return Err(Error::InvalidConfig(format!("missing network location in url '{}'", url)));
        }
        Some(host) if host.contains("..") => {
            return Err(Error::InvalidConfig(format!("url '{}' contains consecutive dots in the host", url)));
        }
        Some(_) => {}
    }

    Ok(parsed)
}

/// Upper bound accepted for any wait, pause or timeout parameter
pub const MAX_WAIT_SECS: f64 = 3600.0;

fn validate_seconds(field: &str, secs: f64) -> Result<f64> {
    if secs.is_finite() && (0.0..=MAX_WAIT_SECS).contains(&secs) {
        Ok(secs)
    } else {
        Err(Error::InvalidConfig(format!(
            "{} must be between 0 and {} seconds",
            field, MAX_WAIT_SECS
        )))
    }
}

/// Seconds to a `Duration`, clamped to `MAX_WAIT_SECS`
///
/// Configs arriving off the queue were not necessarily resolved here, so
/// out-of-range or non-finite values must not panic.
fn seconds(secs: f64) -> Duration {
    if secs.is_nan() {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs.min(MAX_WAIT_SECS)).unwrap_or(Duration::ZERO)
}

impl TaskConfig {
    /// Hostname of the target, sanitised for use as a path component
    pub fn host(&self) -> String {
        let host = Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| "unknown-host".to_string());

        host.replace("..", "").replace('/', "").replace('\\', "")
    }

    /// Deterministic digest of the whole effective config
    ///
    /// Two configs produce the same digest iff every field is equal, proxy
    /// credentials included.
    pub fn config_hash(&self) -> String {
        // serde_json orders object keys deterministically for a given struct
        let canonical = serde_json::to_string(self).unwrap_or_default();
        format!("{:x}", Sha256::digest(canonical.as_bytes()))
    }

    /// Folder this task's artifacts are written to
    pub fn artifact_location(&self) -> ArtifactLocation {
        let host = self.host();
        let mode = if self.full_page_screenshot { "fullpage" } else { "viewport" };
        let folder = format!("{}__{}__{}__{}", host, self.browser, mode, self.config_hash());
        ArtifactLocation { host, folder }
    }

    /// JSON snapshot with proxy passwords masked, as written to `config.json`
    pub fn masked_json(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        if let (Some(chain), Some(map)) = (&self.proxy, value.as_object_mut()) {
            map.insert("proxy".to_string(), serde_json::json!(chain.masked()));
        }
        value
    }

    pub fn after_load_delay(&self) -> Duration {
        seconds(self.wait_after_load)
    }

    pub fn before_load_delay(&self) -> Duration {
        seconds(self.wait_before_load.unwrap_or(0.0))
    }

    pub fn selector_timeout(&self) -> Duration {
        seconds(self.wait_for_selector_timeout)
    }

    pub fn scroll_pause(&self) -> Duration {
        seconds(self.scroll_pause_time)
    }

    /// Upper bound for opening a session and loading the page, before `grace`
    pub fn session_budget(&self, grace: Duration) -> Duration {
        let selector = if self.wait_for_selector.is_some() {
            self.selector_timeout()
        } else {
            Duration::ZERO
        };
        self.before_load_delay()
            .saturating_add(self.after_load_delay())
            .saturating_add(selector)
            .saturating_add(grace)
    }

    /// Upper bound for actions, capture and element detection, before `grace`
    pub fn render_budget(&self, grace: Duration) -> Duration {
        let steps = u32::try_from(self.actions.as_ref().map_or(0, |a| a.len()))
            .unwrap_or(u32::MAX)
            .saturating_add(1);
        self.scroll_pause().saturating_mul(steps).saturating_add(grace)
    }

    /// Viewport to apply, the explicit window size winning over the device
    pub fn viewport(&self) -> (u32, u32) {
        match self.window_size {
            Some(size) => (size.width, size.height),
            None => {
                let profile = self.device.profile();
                (profile.width, profile.height)
            }
        }
    }

    /// User agent to apply, the explicit one winning over the device default
    pub fn effective_user_agent(&self) -> Option<String> {
        self.user_agent
            .clone()
            .or_else(|| self.device.profile().user_agent.map(str::to_string))
    }
}
