//! LLM relevance filter: prompt building, verdict parsing and the retrying filter stage.

use std::sync::Arc;

use async_trait::async_trait;
use oppbot_core::Opportunity;
use oppbot_storage::{
    classify_reqwest_error, classify_status, RetryDisposition, RetryFailure, RetryPolicy,
};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const SYSTEM_PROMPT: &str = "You are a job analyzer for college students.";

pub fn build_prompt(instruction: &str, candidates: &[Opportunity]) -> String {
    let mut prompt = instruction.to_string();
    for opp in candidates {
        prompt.push_str(&format!(
            "\nCompany: {}\nTitle: {}\nLocation: {}\n",
            opp.employer, opp.title, opp.location
        ));
    }
    prompt
}

// ----------------- VERDICT PARSING -----------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerdictParseError {
    #[error("classifier response was empty")]
    Empty,
    #[error("classifier response is not a JSON array: {0}")]
    Malformed(String),
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // drop the language tag line
    let rest = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    let rest = rest.trim_end();
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

fn is_true(value: &JsonValue) -> bool {
    match value {
        JsonValue::Bool(b) => *b,
        JsonValue::String(s) => s.trim().eq_ignore_ascii_case("true"),
        other => other.to_string().eq_ignore_ascii_case("true"),
    }
}

/// The response is lowercased before decoding, so `[True, False]` reads as JSON too.
/// Any element other than `true`/`"true"` is a rejection.
pub fn parse_verdicts(response: &str) -> Result<Vec<bool>, VerdictParseError> {
    let body = strip_code_fence(response.trim()).to_ascii_lowercase();
    if body.is_empty() {
        return Err(VerdictParseError::Empty);
    }
    let values: Vec<JsonValue> = serde_json::from_str(&body)
        .map_err(|err| VerdictParseError::Malformed(err.to_string()))?;
    Ok(values.iter().map(is_true).collect())
}

/// Positional pairing; stops at the shorter list.
pub fn apply_verdicts(candidates: Vec<Opportunity>, verdicts: &[bool]) -> Vec<Opportunity> {
    candidates
        .into_iter()
        .zip(verdicts.iter().copied())
        .filter_map(|(opp, keep)| keep.then_some(opp))
        .collect()
}

// ----------------- CLASSIFIER TRANSPORT -----------------

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("classifier request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("classifier returned http {status}: {body}")]
    Status { status: u16, body: String },
    #[error("classifier response had no content")]
    EmptyResponse,
}

impl ClassifierError {
    pub fn is_retryable(&self) -> bool {
        let disposition = match self {
            ClassifierError::Transport(err) => classify_reqwest_error(err),
            ClassifierError::Status { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            ClassifierError::EmptyResponse => RetryDisposition::Retryable,
        };
        disposition == RetryDisposition::Retryable
    }
}

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, prompt: &str) -> Result<String, ClassifierError>;
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponseRaw {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OpenAiClassifier {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiClassifier {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl Classifier for OpenAiClassifier {
    async fn classify(&self, prompt: &str) -> Result<String, ClassifierError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: 0.0,
        };
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, error = %body, "classifier api error");
            return Err(ClassifierError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let raw: ChatResponseRaw = response.json().await?;
        let content = raw
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or(ClassifierError::EmptyResponse)?;
        debug!(model = %self.model, chars = content.len(), "classifier responded");
        Ok(content)
    }
}

// ----------------- FILTER STAGE -----------------

#[derive(Debug, Error)]
enum AttemptError {
    #[error(transparent)]
    Classifier(#[from] ClassifierError),
    #[error(transparent)]
    Verdicts(#[from] VerdictParseError),
}

impl AttemptError {
    fn is_retryable(&self) -> bool {
        match self {
            AttemptError::Classifier(err) => err.is_retryable(),
            AttemptError::Verdicts(_) => true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FilterReport {
    pub kept: Vec<Opportunity>,
    pub verdicts: Vec<bool>,
    pub attempts: usize,
    /// Every attempt failed; `kept` is empty.
    pub exhausted: bool,
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct RelevanceFilter {
    classifier: Option<Arc<dyn Classifier>>,
    retry: RetryPolicy,
}

impl RelevanceFilter {
    pub fn new(classifier: Arc<dyn Classifier>, retry: RetryPolicy) -> Self {
        Self {
            classifier: Some(classifier),
            retry,
        }
    }

    pub fn disabled() -> Self {
        Self {
            classifier: None,
            retry: RetryPolicy::default(),
        }
    }

    pub async fn filter(&self, candidates: Vec<Opportunity>, instruction: &str) -> FilterReport {
        let Some(classifier) = &self.classifier else {
            return FilterReport {
                verdicts: vec![true; candidates.len()],
                kept: candidates,
                ..FilterReport::default()
            };
        };
        if candidates.is_empty() {
            return FilterReport::default();
        }

        let prompt = build_prompt(instruction, &candidates);
        let outcome = self
            .retry
            .run(
                |attempt| {
                    let classifier = Arc::clone(classifier);
                    let prompt = prompt.as_str();
                    async move {
                        debug!(attempt, "classifying candidates");
                        let text = classifier.classify(prompt).await?;
                        Ok::<_, AttemptError>(parse_verdicts(&text)?)
                    }
                },
                AttemptError::is_retryable,
            )
            .await;

        match outcome {
            Ok(done) => {
                if done.value.len() != candidates.len() {
                    warn!(
                        candidates = candidates.len(),
                        verdicts = done.value.len(),
                        "verdict count mismatch; pairing positionally"
                    );
                }
                let total = candidates.len();
                let kept = apply_verdicts(candidates, &done.value);
                info!(candidates = total, kept = kept.len(), attempts = done.attempts, "filtered");
                FilterReport {
                    kept,
                    verdicts: done.value,
                    attempts: done.attempts,
                    exhausted: false,
                    error: None,
                }
            }
            Err(RetryFailure {
                last_error,
                attempts,
                exhausted,
            }) => {
                warn!(
                    attempts,
                    exhausted,
                    error = %last_error,
                    dropped = candidates.len(),
                    "relevance filter gave up; nothing from this batch is ingested"
                );
                FilterReport {
                    kept: Vec::new(),
                    verdicts: Vec::new(),
                    attempts,
                    exhausted,
                    error: Some(last_error.to_string()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use oppbot_core::Category;

    fn opp(employer: &str) -> Opportunity {
        Opportunity::new(employer, "Engineer", "Remote", "https://x.example", Category::FullTime)
    }

    /// Replays canned responses, repeating the last one.
    struct Scripted {
        responses: Mutex<Vec<Result<String, ClassifierError>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(responses: Vec<Result<String, ClassifierError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Classifier for Scripted {
        async fn classify(&self, _prompt: &str) -> Result<String, ClassifierError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            if responses.len() > 1 {
                responses.remove(0)
            } else {
                match &responses[0] {
                    Ok(text) => Ok(text.clone()),
                    Err(ClassifierError::Status { status, body }) => Err(ClassifierError::Status {
                        status: *status,
                        body: body.clone(),
                    }),
                    Err(_) => Err(ClassifierError::EmptyResponse),
                }
            }
        }
    }

    fn fast() -> RetryPolicy {
        RetryPolicy::new(5, Duration::from_millis(1))
    }

    #[test]
    fn prompt_lists_each_candidate() {
        let prompt = build_prompt("Judge these.", &[opp("Acme"), opp("Globex")]);
        assert_eq!(
            prompt,
            "Judge these.\nCompany: Acme\nTitle: Engineer\nLocation: Remote\n\
             \nCompany: Globex\nTitle: Engineer\nLocation: Remote\n"
        );
    }

    #[test]
    fn verdicts_parse_common_shapes() {
        assert_eq!(parse_verdicts("[true,false,true]").unwrap(), vec![true, false, true]);
        assert_eq!(parse_verdicts("[\"True\",\"FALSE\"]").unwrap(), vec![true, false]);
        assert_eq!(parse_verdicts("[True, False]").unwrap(), vec![true, false]);
        assert_eq!(
            parse_verdicts("```json\n[false, true]\n```").unwrap(),
            vec![false, true]
        );
    }

    #[test]
    fn unknown_elements_count_as_rejections() {
        assert_eq!(parse_verdicts(r#"["True","yes"]"#).unwrap(), vec![true, false]);
        assert_eq!(parse_verdicts("[true, null]").unwrap(), vec![true, false]);
        assert_eq!(parse_verdicts("[1, 0]").unwrap(), vec![false, false]);
    }

    #[test]
    fn verdicts_reject_non_json() {
        assert_eq!(parse_verdicts("  "), Err(VerdictParseError::Empty));
        assert!(matches!(
            parse_verdicts("Sure! Here is the list: [true]"),
            Err(VerdictParseError::Malformed(_))
        ));
        assert!(matches!(
            parse_verdicts("True False True"),
            Err(VerdictParseError::Malformed(_))
        ));
    }

    #[test]
    fn verdicts_pair_positionally_and_truncate() {
        let candidates = vec![opp("x"), opp("y"), opp("z")];
        let kept = apply_verdicts(candidates.clone(), &[true, false, true]);
        assert_eq!(kept, vec![opp("x"), opp("z")]);

        let kept = apply_verdicts(candidates, &[true, false]);
        assert_eq!(kept, vec![opp("x")]);
    }

    #[tokio::test]
    async fn empty_input_skips_the_classifier() {
        let classifier = Scripted::new(vec![Ok("[true]".into())]);
        let filter = RelevanceFilter::new(classifier.clone(), fast());
        let report = filter.filter(Vec::new(), "judge").await;
        assert!(report.kept.is_empty());
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn malformed_responses_are_retried() {
        let classifier = Scripted::new(vec![
            Ok("I think the first one".into()),
            Ok("[true, false]".into()),
        ]);
        let filter = RelevanceFilter::new(classifier.clone(), fast());
        let report = filter.filter(vec![opp("a"), opp("b")], "judge").await;
        assert_eq!(report.kept, vec![opp("a")]);
        assert_eq!(report.attempts, 2);
        assert!(!report.exhausted);
    }

    #[tokio::test]
    async fn exhausted_retries_yield_an_empty_batch() {
        let classifier = Scripted::new(vec![Ok("nope".into())]);
        let filter = RelevanceFilter::new(classifier.clone(), fast());
        let report = filter.filter(vec![opp("a"), opp("b")], "judge").await;
        assert!(report.exhausted);
        assert!(report.kept.is_empty());
        assert_eq!(report.attempts, 5);
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn client_errors_stop_immediately() {
        let classifier = Scripted::new(vec![Err(ClassifierError::Status {
            status: 401,
            body: "bad key".into(),
        })]);
        let filter = RelevanceFilter::new(classifier.clone(), fast());
        let report = filter.filter(vec![opp("a")], "judge").await;
        assert!(!report.exhausted);
        assert!(report.kept.is_empty());
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);
        assert!(report.error.unwrap().contains("401"));
    }

    #[tokio::test]
    async fn server_errors_use_the_retry_budget() {
        let classifier = Scripted::new(vec![
            Err(ClassifierError::Status {
                status: 503,
                body: String::new(),
            }),
            Ok("[true]".into()),
        ]);
        let filter = RelevanceFilter::new(classifier.clone(), fast());
        let report = filter.filter(vec![opp("a")], "judge").await;
        assert_eq!(report.kept, vec![opp("a")]);
        assert_eq!(report.attempts, 2);
    }

    #[tokio::test]
    async fn disabled_filter_passes_everything() {
        let report = RelevanceFilter::disabled()
            .filter(vec![opp("a"), opp("b")], "judge")
            .await;
        assert_eq!(report.kept.len(), 2);
        assert_eq!(report.attempts, 0);
    }
}
