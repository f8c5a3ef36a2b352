use anyhow::Context;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error};

use crate::browser::renderer::{ElementItem, RenderOutput, RenderSession, Renderer};
use crate::cli::config::RendererSettings;
use crate::error::RenderError;
use crate::group::config::TaskConfig;
use crate::proxy::ProxyConfig;

#[derive(Debug, Clone, Serialize)]
pub struct OpenSessionRequest<'a> {
    pub config: &'a TaskConfig,
    pub proxy: Option<&'a ProxyConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenSessionResponse {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RenderRequest<'a> {
    pub config: &'a TaskConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RenderResponse {
    /// Base64 encoded PNG
    pub screenshot: String,
    #[serde(default)]
    pub elements: Option<Vec<ElementItem>>,
    #[serde(default)]
    pub labelled_screenshot: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ServiceError {
    error: String,
}

/// Render collaborator hosted behind an HTTP browser service
///
/// `POST /sessions` opens a browser bound to the proxy and loads the page,
/// `POST /sessions/{id}/render` captures it and `DELETE /sessions/{id}` ends it.
pub struct RemoteRenderer {
    client: Client,
    base_url: String,
}

impl RemoteRenderer {
    pub fn new(settings: &RendererSettings) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: settings.service_url.trim_end_matches('/').to_string(),
        })
    }
}

/// Turn a non-success response into the service's own error message
async fn service_error(response: Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ServiceError>(&body) {
        Ok(e) => e.error,
        Err(_) if body.is_empty() => format!("service answered {}", status),
        Err(_) => format!("service answered {}: {}", status, body),
    }
}

#[async_trait]
impl Renderer for RemoteRenderer {
    async fn connect(
        &self,
        config: &TaskConfig,
        proxy: Option<&ProxyConfig>,
    ) -> Result<Box<dyn RenderSession>, RenderError> {
        let endpoint = format!("{}/sessions", self.base_url);
        debug!("Opening remote session for {}", config.url);

        let response = self
            .client
            .post(&endpoint)
            .json(&OpenSessionRequest { config, proxy })
            .send()
            .await
            .map_err(|e| RenderError::Connect(e.to_string()))?;

        if !response.status().is_success() {
            return Err(RenderError::Connect(service_error(response).await));
        }

        let opened: OpenSessionResponse = response.json().await?;
        debug!("Remote session {} ready", opened.session_id);

        Ok(Box::new(RemoteSession {
            client: self.client.clone(),
            endpoint: format!("{}/sessions/{}", self.base_url, opened.session_id),
            open: true,
        }))
    }
}

/// Session held by the remote service
pub struct RemoteSession {
    client: Client,
    endpoint: String,
    open: bool,
}

#[async_trait]
impl RenderSession for RemoteSession {
    async fn render(&mut self, config: &TaskConfig) -> Result<RenderOutput, RenderError> {
        let response = self
            .client
            .post(format!("{}/render", self.endpoint))
            .json(&RenderRequest { config })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(RenderError::Service(service_error(response).await));
        }

        let rendered: RenderResponse = response.json().await?;

        let screenshot = STANDARD
            .decode(rendered.screenshot.as_bytes())
            .map_err(|e| RenderError::Capture(format!("invalid screenshot encoding: {}", e)))?;

        let labelled_screenshot = rendered
            .labelled_screenshot
            .map(|data| STANDARD.decode(data.as_bytes()))
            .transpose()
            .map_err(|e| RenderError::Capture(format!("invalid labelled screenshot encoding: {}", e)))?;

        Ok(RenderOutput {
            screenshot,
            elements: rendered.elements,
            labelled_screenshot,
        })
    }

    async fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;

        match self.client.delete(&self.endpoint).send().await {
            Ok(response) if response.status().is_success() => debug!("Remote session closed"),
            Ok(response) => error!("Error closing remote session: {}", response.status()),
            Err(e) => error!("Error closing remote session: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::config::{SiteSpec, TaskConfigOverride};
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn renderer(server: &MockServer) -> RemoteRenderer {
        let settings = RendererSettings {
            kind: "remote".to_string(),
            service_url: format!("{}/", server.uri()),
            request_timeout_secs: 5,
            ..Default::default()
        };
        RemoteRenderer::new(&settings).unwrap()
    }

    fn config() -> TaskConfig {
        SiteSpec::from("https://example.com")
            .resolve(&TaskConfigOverride::default(), 0)
            .unwrap()
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/sessions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"session_id": "s1"})))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/sessions/s1/render"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "screenshot": STANDARD.encode(b"png-bytes"),
                "elements": [{
                    "id": 1, "parent_id": null, "bbox": [0, 0, 100, 50],
                    "tag_name": "body", "label": "body", "position": "static",
                    "is_visible": true, "css_selector": "html body"
                }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("DELETE"))
            .and(path("/sessions/s1"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let config = config();
        let mut session = renderer(&server).connect(&config, None).await.unwrap();
        let output = session.render(&config).await.unwrap();
        session.close().await;
        session.close().await;

        assert_eq!(output.screenshot, b"png-bytes");
        assert_eq!(output.elements.unwrap()[0].bbox, (0, 0, 100, 50));
        assert!(output.labelled_screenshot.is_none());
    }

    #[tokio::test]
    async fn test_failed_session_is_a_connect_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/sessions"))
            .respond_with(
                ResponseTemplate::new(502).set_body_json(json!({"error": "proxy tunnel failed"})),
            )
            .mount(&server)
            .await;

        let proxy = ProxyConfig {
            host: "p".to_string(),
            port: 1,
            username: None,
            password: None,
            protocol: "http".to_string(),
        };
        let err = match renderer(&server).connect(&config(), Some(&proxy)).await {
            Ok(_) => panic!("session should not open"),
            Err(e) => e,
        };
        assert!(matches!(err, RenderError::Connect(ref msg) if msg == "proxy tunnel failed"));
    }

    #[tokio::test]
    async fn test_render_failure_is_a_service_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/sessions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"session_id": "s2"})))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/sessions/s2/render"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let config = config();
        let mut session = renderer(&server).connect(&config, None).await.unwrap();
        let err = session.render(&config).await.unwrap_err();
        assert!(matches!(err, RenderError::Service(_)));
    }
}
