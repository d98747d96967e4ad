//! Task delegation: data-category classification of captures.
//!
//! Weighted keyword rules are always available. An external classifier, when
//! configured, is tried first under a timeout; any failure falls back to the
//! rules so the pipeline never waits on an unavailable collaborator.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use pagetap_protocol::{Capture, DataCategory};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use crate::config::ClassifierConfig;

pub const TASK_CLASSIFY: &str = "classify";
pub const TASK_INFER_SCHEMA: &str = "infer_schema";
pub const DELEGATE_SUMMARIZE: &str = "summarize";

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("classifier credentials missing (set ${env})")]
    MissingCredentials { env: String },

    #[error("classifier request failed: {0}")]
    Http(String),

    #[error("classifier declined: {0}")]
    Declined(String),

    #[error("classifier response invalid: {0}")]
    InvalidResponse(String),

    #[error("classifier timed out after {0:?}")]
    Timeout(Duration),
}

/// Where a classification came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationSource {
    Rules,
    External,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub data_category: DataCategory,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delegate_to: Option<String>,
    pub source: ClassificationSource,
    pub confidence: f32,
    /// Signals that matched (rules only).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub matched_signals: Vec<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Rules
// ─────────────────────────────────────────────────────────────────────────────

// Format: (needle, weight, is_strong_signal)
const MEDICATION_SIGNALS: &[(&str, f32, bool)] = &[
    ("medication", 0.5, true),
    ("prescription", 0.4, true),
    ("meds", 0.3, false),
    ("dosage", 0.25, false),
    ("rxnorm", 0.4, true),
];

const ALLERGY_SIGNALS: &[(&str, f32, bool)] = &[
    ("allerg", 0.5, true),
    ("reaction", 0.2, false),
    ("intolerance", 0.35, true),
    ("severity", 0.1, false),
];

const PROBLEM_SIGNALS: &[(&str, f32, bool)] = &[
    ("problem", 0.45, true),
    ("diagnos", 0.4, true),
    ("condition", 0.3, false),
    ("icd", 0.3, true),
];

const VITAL_SIGNALS: &[(&str, f32, bool)] = &[
    ("vital", 0.5, true),
    ("blood_pressure", 0.35, false),
    ("heart_rate", 0.3, false),
    ("bmi", 0.2, false),
    ("temperature", 0.2, false),
];

const LAB_SIGNALS: &[(&str, f32, bool)] = &[
    ("lab", 0.45, true),
    ("result", 0.2, false),
    ("loinc", 0.4, true),
    ("specimen", 0.3, false),
    ("reference_range", 0.3, false),
];

const IMMUNIZATION_SIGNALS: &[(&str, f32, bool)] = &[
    ("immuniz", 0.5, true),
    ("vaccin", 0.45, true),
    ("cvx", 0.3, false),
];

const ENCOUNTER_SIGNALS: &[(&str, f32, bool)] = &[
    ("encounter", 0.5, true),
    ("visit", 0.3, false),
    ("appointment", 0.3, false),
];

const ORDER_SIGNALS: &[(&str, f32, bool)] = &[
    ("order", 0.45, true),
    ("referral", 0.3, false),
];

const DEMOGRAPHIC_SIGNALS: &[(&str, f32, bool)] = &[
    ("demographic", 0.5, true),
    ("date_of_birth", 0.35, false),
    ("dob", 0.25, false),
    ("gender", 0.2, false),
    ("address", 0.15, false),
];

const NOTE_SIGNALS: &[(&str, f32, bool)] = &[
    ("note", 0.45, true),
    ("narrative", 0.35, false),
    ("progress", 0.15, false),
    ("soap", 0.3, false),
];

const DOCUMENT_SIGNALS: &[(&str, f32, bool)] = &[
    ("document", 0.5, true),
    ("attachment", 0.35, false),
    ("scan", 0.2, false),
    ("pdf", 0.25, false),
];

const SIGNAL_TABLES: &[(DataCategory, &[(&str, f32, bool)])] = &[
    (DataCategory::Medications, MEDICATION_SIGNALS),
    (DataCategory::Allergies, ALLERGY_SIGNALS),
    (DataCategory::Problems, PROBLEM_SIGNALS),
    (DataCategory::Vitals, VITAL_SIGNALS),
    (DataCategory::Labs, LAB_SIGNALS),
    (DataCategory::Immunizations, IMMUNIZATION_SIGNALS),
    (DataCategory::Encounters, ENCOUNTER_SIGNALS),
    (DataCategory::Orders, ORDER_SIGNALS),
    (DataCategory::Demographics, DEMOGRAPHIC_SIGNALS),
    (DataCategory::Notes, NOTE_SIGNALS),
    (DataCategory::Documents, DOCUMENT_SIGNALS),
];

/// Matches in the URL path count fully; matches in payload keys count this much.
const KEY_SIGNAL_FACTOR: f32 = 0.6;

/// Weighted keyword classifier over the URL path and top-level payload keys.
#[derive(Debug, Clone)]
pub struct RuleClassifier {
    min_confidence: f32,
}

impl Default for RuleClassifier {
    fn default() -> Self {
        Self {
            min_confidence: 0.3,
        }
    }
}

impl RuleClassifier {
    pub fn new(min_confidence: f32) -> Self {
        Self { min_confidence }
    }

    pub fn classify(&self, capture: &Capture) -> Classification {
        let path = url_path(&capture.url).to_ascii_lowercase();
        let keys = top_level_keys(&capture.body).join(" ").to_ascii_lowercase();

        let mut best: Option<(DataCategory, f32, Vec<String>)> = None;
        for (category, signals) in SIGNAL_TABLES {
            let (score, matched) = score_signals(&path, &keys, signals);
            if score > best.as_ref().map_or(0.0, |b| b.1) {
                best = Some((*category, score, matched));
            }
        }

        match best {
            Some((category, confidence, matched)) if confidence >= self.min_confidence => {
                classification(category, ClassificationSource::Rules, confidence, matched)
            }
            _ => classification(
                DataCategory::Unknown,
                ClassificationSource::Rules,
                0.0,
                Vec::new(),
            ),
        }
    }
}

fn score_signals(path: &str, keys: &str, signals: &[(&str, f32, bool)]) -> (f32, Vec<String>) {
    let mut total = 0.0f32;
    let mut matched = Vec::new();
    let mut has_strong_signal = false;

    for (needle, weight, is_strong) in signals {
        let weight = if path.contains(needle) {
            *weight
        } else if keys.contains(needle) {
            weight * KEY_SIGNAL_FACTOR
        } else {
            continue;
        };
        total += weight;
        matched.push((*needle).to_string());
        has_strong_signal |= *is_strong;
    }

    if has_strong_signal && matched.len() >= 2 {
        total *= 1.2;
    }
    (total.min(1.0), matched)
}

fn classification(
    data_category: DataCategory,
    source: ClassificationSource,
    confidence: f32,
    matched_signals: Vec<String>,
) -> Classification {
    Classification {
        data_category,
        delegate_to: data_category
            .is_narrative()
            .then(|| DELEGATE_SUMMARIZE.to_string()),
        source,
        confidence,
        matched_signals,
    }
}

fn url_path(url: &str) -> &str {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    match without_query.find("://") {
        Some(scheme_end) => {
            let rest = &without_query[scheme_end + 3..];
            rest.find('/').map_or("", |i| &rest[i..])
        }
        None => without_query,
    }
}

fn top_level_keys(body: &Value) -> Vec<&str> {
    match body {
        Value::Object(map) => map.keys().map(String::as_str).collect(),
        Value::Array(items) => match items.first() {
            Some(Value::Object(map)) => map.keys().map(String::as_str).collect(),
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// External classifier
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait ExternalClassifier: Send + Sync {
    /// Run `task_tag` against `structured_payload`, returning the task result.
    async fn run(&self, task_tag: &str, structured_payload: Value)
    -> Result<Value, ClassifierError>;
}

#[derive(Debug, Serialize)]
struct ClassifierRequest<'a> {
    task_tag: &'a str,
    structured_payload: Value,
}

#[derive(Debug, Deserialize)]
struct ClassifierResponse {
    success: bool,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExternalCategory {
    data_category: String,
    #[serde(default)]
    delegate_to: Option<String>,
    #[serde(default)]
    confidence: Option<f32>,
}

#[derive(Debug, Clone)]
enum Credentials {
    /// Read from this environment variable on every call.
    Env(String),
    Static(String),
}

/// HTTP client for the external classifier/summarizer.
pub struct HttpClassifier {
    client: reqwest::Client,
    endpoint: String,
    credentials: Credentials,
}

impl HttpClassifier {
    pub fn new(endpoint: impl Into<String>, api_key_env: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            credentials: Credentials::Env(api_key_env.into()),
        }
    }

    pub fn with_api_key(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            credentials: Credentials::Static(api_key.into()),
        }
    }

    fn api_key(&self) -> Result<String, ClassifierError> {
        match &self.credentials {
            Credentials::Static(key) => Ok(key.clone()),
            Credentials::Env(env) => match std::env::var(env) {
                Ok(key) if !key.trim().is_empty() => Ok(key),
                _ => Err(ClassifierError::MissingCredentials { env: env.clone() }),
            },
        }
    }
}

#[async_trait]
impl ExternalClassifier for HttpClassifier {
    async fn run(
        &self,
        task_tag: &str,
        structured_payload: Value,
    ) -> Result<Value, ClassifierError> {
        let api_key = self.api_key()?;
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(&ClassifierRequest {
                task_tag,
                structured_payload,
            })
            .send()
            .await
            .map_err(|e| ClassifierError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClassifierError::Http(format!("status {status}")));
        }
        let body: ClassifierResponse = response
            .json()
            .await
            .map_err(|e| ClassifierError::InvalidResponse(e.to_string()))?;
        if !body.success {
            return Err(ClassifierError::Declined(
                body.error.unwrap_or_else(|| "no reason given".to_string()),
            ));
        }
        body.result
            .ok_or_else(|| ClassifierError::InvalidResponse("success without result".to_string()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Delegator
// ─────────────────────────────────────────────────────────────────────────────

pub struct TaskDelegator {
    rules: RuleClassifier,
    external: Option<Arc<dyn ExternalClassifier>>,
    timeout: Duration,
    infer_schema: bool,
    fallbacks: AtomicU64,
    credentials_warned: AtomicBool,
}

impl TaskDelegator {
    /// Rules only.
    pub fn rules_only(rules: RuleClassifier) -> Self {
        Self {
            rules,
            external: None,
            timeout: Duration::from_secs(3),
            infer_schema: false,
            fallbacks: AtomicU64::new(0),
            credentials_warned: AtomicBool::new(false),
        }
    }

    pub fn new(
        rules: RuleClassifier,
        external: Option<Arc<dyn ExternalClassifier>>,
        timeout: Duration,
        infer_schema: bool,
    ) -> Self {
        Self {
            external,
            timeout,
            infer_schema,
            ..Self::rules_only(rules)
        }
    }

    pub fn from_config(config: &ClassifierConfig) -> Self {
        let external = config.endpoint.as_ref().map(|endpoint| {
            Arc::new(HttpClassifier::new(endpoint, &config.api_key_env))
                as Arc<dyn ExternalClassifier>
        });
        Self::new(
            RuleClassifier::new(config.min_confidence),
            external,
            config.timeout(),
            config.infer_schema,
        )
    }

    /// Times the rules were used because the external classifier failed.
    pub fn fallbacks(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }

    pub fn has_external(&self) -> bool {
        self.external.is_some()
    }

    async fn run_external(
        &self,
        external: &dyn ExternalClassifier,
        task_tag: &str,
        payload: Value,
    ) -> Result<Value, ClassifierError> {
        match tokio::time::timeout(self.timeout, external.run(task_tag, payload)).await {
            Ok(result) => result,
            Err(_) => Err(ClassifierError::Timeout(self.timeout)),
        }
    }

    fn note_failure(&self, task_tag: &str, err: &ClassifierError) {
        if matches!(err, ClassifierError::MissingCredentials { .. }) {
            // Expected in unconfigured deployments; say so once.
            if !self.credentials_warned.swap(true, Ordering::Relaxed) {
                tracing::info!(task = task_tag, "{err}; using rule-based classification");
            }
            return;
        }
        tracing::warn!(task = task_tag, error = %err, "external classifier unavailable");
    }

    pub async fn classify(&self, capture: &Capture) -> Classification {
        let Some(external) = self.external.as_deref() else {
            return self.rules.classify(capture);
        };

        let payload = json!({
            "url": capture.url,
            "method": capture.method,
            "top_level_keys": top_level_keys(&capture.body),
        });
        let outcome = self
            .run_external(external, TASK_CLASSIFY, payload)
            .await
            .and_then(|value| {
                serde_json::from_value::<ExternalCategory>(value)
                    .map_err(|e| ClassifierError::InvalidResponse(e.to_string()))
            })
            .and_then(|parsed| match DataCategory::parse(&parsed.data_category) {
                Some(category) => Ok((category, parsed)),
                None => Err(ClassifierError::InvalidResponse(format!(
                    "unknown category {:?}",
                    parsed.data_category
                ))),
            });

        match outcome {
            Ok((category, parsed)) => {
                let mut result = classification(
                    category,
                    ClassificationSource::External,
                    parsed.confidence.unwrap_or(1.0).clamp(0.0, 1.0),
                    Vec::new(),
                );
                if parsed.delegate_to.is_some() {
                    result.delegate_to = parsed.delegate_to;
                }
                result
            }
            Err(err) => {
                self.fallbacks.fetch_add(1, Ordering::Relaxed);
                self.note_failure(TASK_CLASSIFY, &err);
                self.rules.classify(capture)
            }
        }
    }

    /// Ask the external classifier for a schema of this capture's body.
    /// `None` when disabled, unconfigured, or on any failure.
    pub async fn infer_schema(&self, capture: &Capture) -> Option<Value> {
        if !self.infer_schema {
            return None;
        }
        let external = self.external.as_deref()?;
        let payload = json!({
            "url": capture.url,
            "method": capture.method,
            "body": capture.body,
        });
        match self.run_external(external, TASK_INFER_SCHEMA, payload).await {
            Ok(schema) => Some(schema),
            Err(err) => {
                self.note_failure(TASK_INFER_SCHEMA, &err);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagetap_protocol::SourceChannel;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{body_partial_json, header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn capture(url: &str, body: Value) -> Capture {
        Capture::new(SourceChannel::PrimaryHook, "GET", url, 200, body)
    }

    #[test]
    fn rules_use_url_path() {
        let rules = RuleClassifier::default();
        let c = rules.classify(&capture(
            "https://h.example/chart/1/medications",
            json!({"items": []}),
        ));
        assert_eq!(c.data_category, DataCategory::Medications);
        assert_eq!(c.source, ClassificationSource::Rules);
        assert!(c.delegate_to.is_none());
    }

    #[test]
    fn rules_use_payload_keys_when_path_is_generic() {
        let rules = RuleClassifier::default();
        let c = rules.classify(&capture(
            "/data?chart_id=5",
            json!([{"allergen": "peanut", "allergy_reaction": "hives", "intolerance": true}]),
        ));
        assert_eq!(c.data_category, DataCategory::Allergies);
    }

    #[test]
    fn narrative_categories_are_delegated() {
        let rules = RuleClassifier::default();
        let c = rules.classify(&capture("https://h.example/chart/1/notes", json!({})));
        assert_eq!(c.data_category, DataCategory::Notes);
        assert_eq!(c.delegate_to.as_deref(), Some(DELEGATE_SUMMARIZE));
    }

    #[test]
    fn weak_signals_stay_unknown() {
        let rules = RuleClassifier::default();
        let c = rules.classify(&capture("https://h.example/api/session", json!({"token": 1})));
        assert_eq!(c.data_category, DataCategory::Unknown);
        assert_eq!(c.confidence, 0.0);
    }

    struct Failing(ClassifierError);

    #[async_trait]
    impl ExternalClassifier for Failing {
        async fn run(&self, _task: &str, _payload: Value) -> Result<Value, ClassifierError> {
            Err(match &self.0 {
                ClassifierError::MissingCredentials { env } => {
                    ClassifierError::MissingCredentials { env: env.clone() }
                }
                other => ClassifierError::Http(other.to_string()),
            })
        }
    }

    struct Hanging;

    #[async_trait]
    impl ExternalClassifier for Hanging {
        async fn run(&self, _task: &str, _payload: Value) -> Result<Value, ClassifierError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(json!({"data_category": "labs"}))
        }
    }

    fn delegator(external: Arc<dyn ExternalClassifier>) -> TaskDelegator {
        TaskDelegator::new(
            RuleClassifier::default(),
            Some(external),
            Duration::from_millis(50),
            true,
        )
    }

    #[tokio::test]
    async fn falls_back_on_missing_credentials() {
        let d = delegator(Arc::new(Failing(ClassifierError::MissingCredentials {
            env: "X".to_string(),
        })));
        let c = d.classify(&capture("https://h/chart/1/vitals", json!({}))).await;
        assert_eq!(c.source, ClassificationSource::Rules);
        assert_eq!(c.data_category, DataCategory::Vitals);
        assert_eq!(d.fallbacks(), 1);
    }

    #[tokio::test]
    async fn falls_back_on_error_and_timeout() {
        let d = delegator(Arc::new(Failing(ClassifierError::Http("boom".to_string()))));
        let c = d.classify(&capture("https://h/chart/1/labs", json!({}))).await;
        assert_eq!(c.source, ClassificationSource::Rules);

        let d = delegator(Arc::new(Hanging));
        let c = d.classify(&capture("https://h/chart/1/labs", json!({}))).await;
        assert_eq!(c.source, ClassificationSource::Rules);
        assert_eq!(c.data_category, DataCategory::Labs);
        assert_eq!(d.infer_schema(&capture("/x", json!({}))).await, None);
    }

    #[tokio::test]
    async fn http_classifier_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer secret"))
            .and(body_partial_json(json!({"task_tag": "classify"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "result": {"data_category": "documents", "confidence": 0.9}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"task_tag": "infer_schema"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "result": {"type": "array"}
            })))
            .mount(&server)
            .await;

        let d = delegator(Arc::new(HttpClassifier::with_api_key(server.uri(), "secret")));
        let c = d.classify(&capture("https://h/api/x", json!([]))).await;
        assert_eq!(c.source, ClassificationSource::External);
        assert_eq!(c.data_category, DataCategory::Documents);
        assert_eq!(c.delegate_to.as_deref(), Some(DELEGATE_SUMMARIZE));
        assert_eq!(
            d.infer_schema(&capture("https://h/api/x", json!([]))).await,
            Some(json!({"type": "array"}))
        );
    }

    struct Answers(Value);

    #[async_trait]
    impl ExternalClassifier for Answers {
        async fn run(&self, _task: &str, _payload: Value) -> Result<Value, ClassifierError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn unknown_external_category_falls_back() {
        let d = delegator(Arc::new(Answers(json!({"data_category": "horoscopes"}))));
        let c = d.classify(&capture("https://h/chart/1/vitals", json!({}))).await;
        assert_eq!(c.source, ClassificationSource::Rules);
        assert_eq!(c.data_category, DataCategory::Vitals);
        assert_eq!(d.fallbacks(), 1);
    }

    #[tokio::test]
    async fn http_classifier_reports_missing_env_credentials() {
        let classifier =
            HttpClassifier::new("http://127.0.0.1:1", "PAGETAP_TEST_KEY_THAT_IS_NEVER_SET");
        let err = classifier.run(TASK_CLASSIFY, json!({})).await.unwrap_err();
        assert!(matches!(err, ClassifierError::MissingCredentials { .. }));
    }

    #[tokio::test]
    async fn declined_response_falls_back() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"success": false, "error": "quota"})),
            )
            .mount(&server)
            .await;
        let d = delegator(Arc::new(HttpClassifier::with_api_key(server.uri(), "k")));
        let c = d.classify(&capture("https://h/chart/1/orders", json!({}))).await;
        assert_eq!(c.source, ClassificationSource::Rules);
        assert_eq!(c.data_category, DataCategory::Orders);
    }
}
