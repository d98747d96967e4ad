//! Installs the interception hook into a page and carries envelopes across
//! the page boundary.
//!
//! The page script reaches the bridge through a `Runtime.addBinding`
//! function; the bridge reaches the page by evaluating
//! `window.__pagetap.deliver(..)`.

use async_trait::async_trait;
use chromiumoxide::Page;
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::cdp::js_protocol::runtime::{AddBindingParams, EventBindingCalled};
use futures::StreamExt;
use pagetap_core::bridge::{HostPort, PortError};
use pagetap_core::config::MatcherConfig;
use pagetap_protocol::{ENVELOPE_VERSION, Envelope};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::RecorderError;

pub const BINDING_NAME: &str = "__pagetapEmit";

const HOOK_SOURCE: &str = include_str!("hook.js");
const SETTINGS_PLACEHOLDER: &str = "__PAGETAP_SETTINGS__";

#[derive(Debug, Serialize, PartialEq)]
struct JsPattern {
    source: String,
    flags: &'static str,
}

#[derive(Debug, Serialize)]
struct HookSettings<'a> {
    binding: &'static str,
    version: u32,
    include: Vec<JsPattern>,
    exclude: Vec<JsPattern>,
    hosts: &'a [String],
}

/// Leading `(?i)` becomes the `i` flag; the rest of the syntax the matcher
/// accepts is shared with JavaScript.
fn js_pattern(pattern: &str) -> JsPattern {
    match pattern.strip_prefix("(?i)") {
        Some(rest) => JsPattern {
            source: rest.to_string(),
            flags: "i",
        },
        None => JsPattern {
            source: pattern.to_string(),
            flags: "",
        },
    }
}

/// The hook script with the matcher settings baked in.
pub fn hook_script(matcher: &MatcherConfig) -> Result<String, RecorderError> {
    let settings = HookSettings {
        binding: BINDING_NAME,
        version: ENVELOPE_VERSION,
        include: matcher.include.iter().map(|p| js_pattern(p)).collect(),
        exclude: matcher.exclude.iter().map(|p| js_pattern(p)).collect(),
        hosts: &matcher.hosts,
    };
    let settings = serde_json::to_string(&settings)
        .map_err(|e| RecorderError::Cdp(format!("hook settings: {e}")))?;
    Ok(HOOK_SOURCE.replace(SETTINGS_PLACEHOLDER, &settings))
}

/// The expression that hands `envelope` to the installed hook.
pub fn delivery_expression(envelope: &Envelope) -> String {
    format!(
        "window.__pagetap && window.__pagetap.deliver({})",
        envelope.to_line()
    )
}

/// Expose the binding and install the hook for current and future documents.
pub async fn install(page: &Page, matcher: &MatcherConfig) -> Result<(), RecorderError> {
    let script = hook_script(matcher)?;
    page.execute(AddBindingParams::new(BINDING_NAME))
        .await
        .map_err(|e| RecorderError::Cdp(e.to_string()))?;
    page.execute(AddScriptToEvaluateOnNewDocumentParams::new(script.clone()))
        .await
        .map_err(|e| RecorderError::Cdp(e.to_string()))?;
    page.evaluate(script)
        .await
        .map_err(|e| RecorderError::Cdp(e.to_string()))?;
    tracing::info!("interception hook installed");
    Ok(())
}

/// Forward envelopes the page emits through the binding into `tx`, parsed
/// but not opened. Several pages may share one sender. The returned task
/// ends when the page goes away or `tx` closes.
pub async fn forward_page_envelopes(
    page: &Page,
    tx: mpsc::Sender<Envelope>,
) -> Result<JoinHandle<()>, RecorderError> {
    let mut calls = page
        .event_listener::<EventBindingCalled>()
        .await
        .map_err(|e| RecorderError::Cdp(e.to_string()))?;
    Ok(tokio::spawn(async move {
        while let Some(call) = calls.next().await {
            if call.name != BINDING_NAME {
                continue;
            }
            match Envelope::parse(&call.payload) {
                Ok(envelope) => {
                    if tx.send(envelope).await.is_err() {
                        return;
                    }
                }
                Err(e) => tracing::debug!(error = %e, "page emitted unparseable envelope"),
            }
        }
        tracing::debug!("page binding stream ended");
    }))
}

/// [`HostPort`] that evaluates deliveries in the page.
pub struct CdpHostPort {
    page: Page,
}

impl CdpHostPort {
    pub fn new(page: Page) -> Self {
        Self { page }
    }
}

#[async_trait]
impl HostPort for CdpHostPort {
    async fn deliver(&self, envelope: Envelope) -> Result<(), PortError> {
        self.page
            .evaluate(delivery_expression(&envelope))
            .await
            .map(|_| ())
            .map_err(|e| PortError::Send(e.to_string()))
    }
}
