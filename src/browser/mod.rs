pub mod actions;
pub mod device;
pub mod remote;
pub mod renderer;
pub mod script;
pub mod session;

use anyhow::{bail, Result};
use std::sync::Arc;
use tracing::debug;

use crate::cli::config::RendererSettings;

// Re-export common types
pub use remote::RemoteRenderer;
pub use renderer::Renderer;
pub use session::WebDriverRenderer;

/// Build the render collaborator selected by `renderer.kind`
pub fn create_renderer(settings: &RendererSettings) -> Result<Arc<dyn Renderer>> {
    debug!("Using {} renderer", settings.kind);
    match settings.kind.as_str() {
        "webdriver" => Ok(Arc::new(WebDriverRenderer::new(settings.clone()))),
        "remote" => Ok(Arc::new(RemoteRenderer::new(settings)?)),
        other => bail!("Unsupported renderer type: {}", other),
    }
}
