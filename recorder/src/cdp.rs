//! Chrome DevTools Protocol adapter for the recorder and the page hook.

use std::sync::Arc;

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::inspector::EventDetached;
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent,
    EventResponseReceived, GetResponseBodyParams, RequestId,
};
use chromiumoxide::{Browser, Page};
use futures::StreamExt;
use futures::stream::BoxStream;
use pagetap_protocol::SurfaceId;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::RecorderError;
use crate::recorder::{AttachedSession, DebugSession, DebugTarget, NetworkEvent, ResponseBody};

/// Buffered network events per attached surface.
const EVENT_BUFFER: usize = 512;

fn cdp_err(e: impl std::fmt::Display) -> RecorderError {
    RecorderError::Cdp(e.to_string())
}

#[derive(Debug, Deserialize)]
struct VersionInfo {
    #[serde(rename = "webSocketDebuggerUrl")]
    web_socket_debugger_url: String,
    #[serde(rename = "Browser", default)]
    browser: Option<String>,
}

/// Resolve the browser websocket URL from `http://{host}:{port}/json/version`.
pub async fn discover_websocket_url(host: &str, port: u16) -> Result<String, RecorderError> {
    let url = format!("http://{host}:{port}/json/version");
    let info: VersionInfo = reqwest::get(&url)
        .await
        .map_err(|e| RecorderError::Discovery(format!("{url}: {e}")))?
        .error_for_status()
        .map_err(|e| RecorderError::Discovery(format!("{url}: {e}")))?
        .json()
        .await
        .map_err(|e| RecorderError::Discovery(format!("{url}: {e}")))?;
    tracing::debug!(browser = ?info.browser, "devtools endpoint discovered");
    Ok(info.web_socket_debugger_url)
}

/// A connection to a running browser's debugging endpoint.
pub struct CdpBrowser {
    browser: Browser,
    handler: JoinHandle<()>,
    surface_filter: Option<String>,
}

impl CdpBrowser {
    /// Connect to the browser listening on `127.0.0.1:{debug_port}`.
    pub async fn connect(
        debug_port: u16,
        surface_filter: Option<String>,
    ) -> Result<Self, RecorderError> {
        let ws_url = discover_websocket_url("127.0.0.1", debug_port).await?;
        let (browser, mut handler) = Browser::connect(ws_url).await.map_err(cdp_err)?;
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::debug!(error = %e, "devtools handler error");
                }
            }
            tracing::warn!("devtools connection closed");
        });
        tracing::info!(debug_port, "connected to browser");
        Ok(Self {
            browser,
            handler,
            surface_filter,
        })
    }

    pub fn is_alive(&self) -> bool {
        !self.handler.is_finished()
    }

    fn eligible_url(&self, url: Option<&str>) -> bool {
        match (&self.surface_filter, url) {
            (None, _) => true,
            (Some(filter), Some(url)) => url.contains(filter.as_str()),
            (Some(_), None) => false,
        }
    }

    /// Page targets whose URL passes the surface filter.
    pub async fn pages(&self) -> Result<Vec<(SurfaceId, Page)>, RecorderError> {
        let mut eligible = Vec::new();
        for page in self.browser.pages().await.map_err(cdp_err)? {
            let url = page.url().await.map_err(cdp_err)?;
            if self.eligible_url(url.as_deref()) {
                eligible.push((surface_id(&page), page));
            }
        }
        Ok(eligible)
    }

    pub async fn page(&self, surface: &SurfaceId) -> Result<Page, RecorderError> {
        self.browser
            .pages()
            .await
            .map_err(cdp_err)?
            .into_iter()
            .find(|page| &surface_id(page) == surface)
            .ok_or_else(|| RecorderError::SurfaceNotFound(surface.clone()))
    }
}

impl Drop for CdpBrowser {
    fn drop(&mut self) {
        self.handler.abort();
    }
}

pub fn surface_id(page: &Page) -> SurfaceId {
    SurfaceId::new(page.target_id().inner().clone())
}

/// [`DebugTarget`] over a connected browser.
pub struct CdpTarget {
    browser: Arc<CdpBrowser>,
}

impl CdpTarget {
    pub fn new(browser: Arc<CdpBrowser>) -> Self {
        Self { browser }
    }
}

#[async_trait]
impl DebugTarget for CdpTarget {
    async fn surfaces(&self) -> Result<Vec<SurfaceId>, RecorderError> {
        Ok(self
            .browser
            .pages()
            .await?
            .into_iter()
            .map(|(id, _)| id)
            .collect())
    }

    async fn attach(&self, surface: &SurfaceId) -> Result<AttachedSession, RecorderError> {
        let page = self.browser.page(surface).await?;
        page.execute(EnableParams::default())
            .await
            .map_err(cdp_err)?;
        let events = network_events(&page).await?;
        Ok(AttachedSession {
            session: Arc::new(CdpSession { page }),
            events,
        })
    }
}

/// Merge the page's network listeners into one channel. A `Detached` event
/// follows once every listener has ended.
async fn network_events(page: &Page) -> Result<mpsc::Receiver<NetworkEvent>, RecorderError> {
    let sent = page
        .event_listener::<EventRequestWillBeSent>()
        .await
        .map_err(cdp_err)?
        .map(|e| NetworkEvent::RequestWillBeSent {
            request_id: e.request_id.inner().clone(),
            url: e.request.url.clone(),
            method: e.request.method.clone(),
        });
    let responses = page
        .event_listener::<EventResponseReceived>()
        .await
        .map_err(cdp_err)?
        .map(|e| NetworkEvent::ResponseReceived {
            request_id: e.request_id.inner().clone(),
            url: e.response.url.clone(),
            status: u16::try_from(e.response.status).unwrap_or_default(),
            mime_type: e.response.mime_type.clone(),
        });
    let finished = page
        .event_listener::<EventLoadingFinished>()
        .await
        .map_err(cdp_err)?
        .map(|e| NetworkEvent::LoadingFinished {
            request_id: e.request_id.inner().clone(),
        });
    let failed = page
        .event_listener::<EventLoadingFailed>()
        .await
        .map_err(cdp_err)?
        .map(|e| NetworkEvent::LoadingFailed {
            request_id: e.request_id.inner().clone(),
            error_text: e.error_text.clone(),
        });
    let detached = page
        .event_listener::<EventDetached>()
        .await
        .map_err(cdp_err)?
        .map(|e| NetworkEvent::Detached {
            reason: e.reason.clone(),
        });

    let streams: Vec<BoxStream<'static, NetworkEvent>> = vec![
        sent.boxed(),
        responses.boxed(),
        finished.boxed(),
        failed.boxed(),
        detached.boxed(),
    ];
    let mut merged = futures::stream::select_all(streams);
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    tokio::spawn(async move {
        while let Some(event) = merged.next().await {
            if tx.send(event).await.is_err() {
                return;
            }
        }
        let _ = tx
            .send(NetworkEvent::Detached {
                reason: "target closed".to_string(),
            })
            .await;
    });
    Ok(rx)
}

pub struct CdpSession {
    page: Page,
}

#[async_trait]
impl DebugSession for CdpSession {
    async fn response_body(&self, request_id: &str) -> Result<ResponseBody, RecorderError> {
        let response = self
            .page
            .execute(GetResponseBodyParams::new(RequestId::new(request_id)))
            .await
            .map_err(|e| RecorderError::Body(e.to_string()))?;
        Ok(ResponseBody {
            body: response.result.body.clone(),
            base64_encoded: response.result.base64_encoded,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn discovers_websocket_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/json/version"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "Browser": "Chrome/126.0",
                "webSocketDebuggerUrl": "ws://127.0.0.1:9222/devtools/browser/abc"
            })))
            .mount(&server)
            .await;

        let address = server.address();
        let url = discover_websocket_url(&address.ip().to_string(), address.port())
            .await
            .unwrap();
        assert_eq!(url, "ws://127.0.0.1:9222/devtools/browser/abc");
    }

    #[tokio::test]
    async fn discovery_reports_missing_endpoint() {
        let server = MockServer::start().await;
        let address = server.address();
        let err = discover_websocket_url(&address.ip().to_string(), address.port())
            .await
            .unwrap_err();
        assert!(matches!(err, RecorderError::Discovery(_)));
    }
}
