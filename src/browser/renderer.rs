use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RenderError;
use crate::group::config::TaskConfig;
use crate::proxy::ProxyConfig;

/// A page element found by the detection pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementItem {
    pub id: u64,
    pub parent_id: Option<u64>,

    /// `(left, top, right, bottom)` in screenshot pixels
    pub bbox: (i64, i64, i64, i64),

    pub tag_name: String,
    pub label: String,
    pub position: String,
    pub is_visible: bool,
    pub css_selector: String,
}

/// Raw output of one render
#[derive(Debug, Clone, Default)]
pub struct RenderOutput {
    /// PNG bytes
    pub screenshot: Vec<u8>,

    /// Present when element capture was requested
    pub elements: Option<Vec<ElementItem>>,

    /// Screenshot with element boxes drawn, when the collaborator supplies one
    pub labelled_screenshot: Option<Vec<u8>>,
}

/// Entry point of the render/detect collaborator
///
/// `connect` must only succeed once the page is loaded and verified through the
/// given proxy, so that a failed egress is detected before anything is rendered.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Open a working browser session for `config`, bound to `proxy` when given
    async fn connect(
        &self,
        config: &TaskConfig,
        proxy: Option<&ProxyConfig>,
    ) -> Result<Box<dyn RenderSession>, RenderError>;
}

/// A live, verified browser session
#[async_trait]
pub trait RenderSession: Send {
    /// Run the scripted actions and capture the screenshot (and elements)
    async fn render(&mut self, config: &TaskConfig) -> Result<RenderOutput, RenderError>;

    /// Release the browser; errors are logged, never surfaced
    async fn close(&mut self);
}
