//! AI verdicts for enriched listings.
//!
//! The model is asked for a JSON object. Replies are repaired (code fences,
//! surrounding prose) and validated against the verdict schema; a reply that
//! parses but fails validation is kept as a best-effort verdict tagged
//! `validated = false` in case no later attempt does better.

use crate::{
    config::JudgeConfig,
    llm::{ChatBackend, ChatOptions, ContentPart, LlmError, LlmMessage},
    models::{DetailRecord, Judgement, Verdict},
    retry::RetryPolicy,
};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const MARKER_NOT_CONFIGURED: &str = "ai_not_configured";
pub const MARKER_INVALID: &str = "ai_invalid_response";
pub const MARKER_SKIPPED: &str = "ai_skipped";

const TOP_LEVEL: [&str; 5] = [
    "prompt_version",
    "is_recommended",
    "reason",
    "risk_tags",
    "criteria_analysis",
];
const CRITERIA: [&str; 7] = [
    "model_chip",
    "battery_health",
    "condition",
    "history",
    "seller_type",
    "shipping",
    "seller_credit",
];
const SELLER_TYPE: [&str; 4] = ["status", "persona", "comment", "analysis_details"];
const ANALYSIS_DETAILS: [&str; 4] = [
    "temporal_analysis",
    "selling_behavior",
    "buying_behavior",
    "behavioral_summary",
];

#[derive(Debug, Clone, PartialEq)]
pub enum JudgeOutcome {
    Verdict(Verdict),
    Invalid,
    NotConfigured,
}

impl JudgeOutcome {
    pub fn into_judgement(self) -> Judgement {
        match self {
            JudgeOutcome::Verdict(verdict) => Judgement::Verdict { verdict },
            JudgeOutcome::Invalid => Judgement::error(MARKER_INVALID),
            JudgeOutcome::NotConfigured => Judgement::error(MARKER_NOT_CONFIGURED),
        }
    }
}

#[async_trait]
pub trait Judge: Send + Sync {
    fn is_enabled(&self) -> bool;

    /// `images` are data URLs.
    async fn judge(&self, record: &DetailRecord, images: &[String], rubric: &str) -> JudgeOutcome;
}

/// `retry` covers transport failures of a single call; `config.max_attempts`
/// counts replies, each at a lower temperature than the last.
pub struct AiJudge {
    backend: Arc<dyn ChatBackend>,
    config: JudgeConfig,
    max_tokens: u32,
    retry: RetryPolicy,
}

impl AiJudge {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        config: JudgeConfig,
        max_tokens: u32,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            backend,
            config,
            max_tokens,
            retry,
        }
    }

    fn temperature(&self, attempt: u32) -> f32 {
        (self.config.initial_temperature * 0.5f32.powi(attempt as i32)).max(0.0)
    }
}

#[async_trait]
impl Judge for AiJudge {
    fn is_enabled(&self) -> bool {
        self.backend.is_configured()
    }

    async fn judge(&self, record: &DetailRecord, images: &[String], rubric: &str) -> JudgeOutcome {
        if !self.backend.is_configured() || rubric.trim().is_empty() {
            return JudgeOutcome::NotConfigured;
        }
        let messages = [build_message(record, images, rubric)];
        let mut best_effort: Option<Value> = None;

        for attempt in 0..self.config.max_attempts {
            let options = ChatOptions {
                temperature: self.temperature(attempt),
                max_tokens: self.max_tokens,
                json_mode: true,
            };
            let reply = self
                .retry
                .run("llm_chat", LlmError::is_transient, |_| {
                    self.backend.chat(&messages, options)
                })
                .await;
            let reply = match reply {
                Ok(reply) => reply,
                Err(LlmError::NotConfigured) => return JudgeOutcome::NotConfigured,
                Err(err) => {
                    warn!(target = "argus.judge", attempt = attempt + 1, error = %err, "llm_call_failed");
                    continue;
                }
            };
            if self.config.debug {
                debug!(target = "argus.judge", attempt = attempt + 1, raw = %reply.text, "llm_raw_reply");
            }
            let Some(parsed) = parse_reply(&reply.text) else {
                warn!(target = "argus.judge", attempt = attempt + 1, "verdict_unparseable");
                continue;
            };
            match validate(&parsed) {
                Ok(()) => {
                    info!(
                        target = "argus.judge",
                        attempt = attempt + 1,
                        link = %record.listing.link,
                        "verdict_validated"
                    );
                    return JudgeOutcome::Verdict(Verdict {
                        validated: true,
                        body: parsed,
                    });
                }
                Err(problem) => {
                    warn!(target = "argus.judge", attempt = attempt + 1, problem = %problem, "verdict_invalid");
                    best_effort = Some(parsed);
                }
            }
        }

        match best_effort {
            Some(body) => {
                warn!(target = "argus.judge", link = %record.listing.link, "verdict_unvalidated");
                JudgeOutcome::Verdict(Verdict {
                    validated: false,
                    body,
                })
            }
            None => JudgeOutcome::Invalid,
        }
    }
}

fn build_message(record: &DetailRecord, images: &[String], rubric: &str) -> LlmMessage {
    let record_json = serde_json::to_string_pretty(record).unwrap_or_else(|_| "{}".into());
    let prompt = format!(
        "Based on your expertise and my requirements, analyse the following complete listing JSON:\n\n```json\n{record_json}\n```\n\n{rubric}\n"
    );
    let mut parts: Vec<ContentPart> = images.iter().map(ContentPart::image).collect();
    parts.push(ContentPart::text(prompt));
    LlmMessage::user(parts)
}

/// Direct parse, then fence stripping, then the outermost balanced object.
pub fn parse_reply(text: &str) -> Option<Value> {
    let as_object = |candidate: &str| {
        serde_json::from_str::<Value>(candidate.trim())
            .ok()
            .filter(Value::is_object)
    };
    as_object(text)
        .or_else(|| as_object(&strip_markdown_fence(text)))
        .or_else(|| embedded_objects(text).find_map(as_object))
}

fn strip_markdown_fence(input: &str) -> String {
    let trimmed = input.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let mut body = Vec::new();
    for line in trimmed.lines().skip(1) {
        if line.trim_start().starts_with("```") {
            break;
        }
        body.push(line);
    }
    body.join("\n")
}

/// Every balanced `{ ... }` span, one per opening brace, in order of position.
fn embedded_objects(text: &str) -> impl Iterator<Item = &str> {
    text.match_indices('{')
        .filter_map(|(start, _)| balanced_from(text, start))
}

/// The span starting at `start` whose braces balance, ignoring braces inside strings.
fn balanced_from(text: &str, start: usize) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

pub fn validate(verdict: &Value) -> Result<(), String> {
    let obj = verdict.as_object().ok_or("verdict is not an object")?;
    if let Some(missing) = TOP_LEVEL.iter().find(|key| !obj.contains_key(**key)) {
        return Err(format!("missing field `{missing}`"));
    }
    if !obj.get("is_recommended").is_some_and(Value::is_boolean) {
        return Err("`is_recommended` is not a boolean".into());
    }
    if !obj.get("risk_tags").is_some_and(Value::is_array) {
        return Err("`risk_tags` is not a list".into());
    }
    let criteria = obj
        .get("criteria_analysis")
        .and_then(Value::as_object)
        .ok_or("`criteria_analysis` is not an object")?;
    if let Some(missing) = CRITERIA.iter().find(|key| !criteria.contains_key(**key)) {
        return Err(format!("criteria_analysis missing `{missing}`"));
    }
    let seller_type = criteria
        .get("seller_type")
        .and_then(Value::as_object)
        .ok_or("`seller_type` is not an object")?;
    if let Some(missing) = SELLER_TYPE.iter().find(|key| !seller_type.contains_key(**key)) {
        return Err(format!("seller_type missing `{missing}`"));
    }
    let details = seller_type
        .get("analysis_details")
        .and_then(Value::as_object)
        .ok_or("`analysis_details` is not an object")?;
    if let Some(missing) = ANALYSIS_DETAILS.iter().find(|key| !details.contains_key(**key)) {
        return Err(format!("analysis_details missing `{missing}`"));
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmResponse;
    use crate::models::{Listing, SellerProfile, UNKNOWN};
    use chrono::Utc;
    use std::sync::Mutex;

    struct ScriptedBackend {
        replies: Mutex<Vec<Result<String, LlmError>>>,
        temperatures: Mutex<Vec<f32>>,
    }

    impl ScriptedBackend {
        fn new(replies: Vec<Result<String, LlmError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies),
                temperatures: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        fn is_configured(&self) -> bool {
            true
        }

        async fn chat(
            &self,
            _messages: &[LlmMessage],
            options: ChatOptions,
        ) -> Result<LlmResponse, LlmError> {
            self.temperatures.lock().expect("lock").push(options.temperature);
            let mut replies = self.replies.lock().expect("lock");
            let next = if replies.is_empty() {
                Err(LlmError::Http("exhausted".into()))
            } else {
                replies.remove(0)
            };
            next.map(|text| LlmResponse { text, usage: None })
        }
    }

    fn record() -> DetailRecord {
        DetailRecord {
            capture_time: Utc::now(),
            task_name: "t".into(),
            keyword: "k".into(),
            listing: Listing {
                id: "1".into(),
                title: "A7M4".into(),
                price: "¥11000".into(),
                original_price: UNKNOWN.into(),
                wants: UNKNOWN.into(),
                seller_name: "s".into(),
                area: UNKNOWN.into(),
                link: "https://x/item?id=1".into(),
                publish_time: UNKNOWN.into(),
                tags: vec![],
                image_urls: vec![],
            },
            seller_profile: SellerProfile::default(),
        }
    }

    fn judge(backend: Arc<ScriptedBackend>) -> AiJudge {
        AiJudge::new(backend, JudgeConfig::default(), 4000, RetryPolicy::immediate(1))
    }

    #[test]
    fn schema_validation() {
        assert!(validate(&fixtures::verdict(true)).is_ok());
        let mut missing = fixtures::verdict(true);
        missing.as_object_mut().expect("obj").remove("risk_tags");
        assert!(validate(&missing).is_err());
        let mut stringy = fixtures::verdict(true);
        stringy["is_recommended"] = Value::String("true".into());
        assert!(validate(&stringy).is_err());
        let mut shallow = fixtures::verdict(true);
        shallow["criteria_analysis"]["seller_type"]
            .as_object_mut()
            .expect("obj")
            .remove("analysis_details");
        assert!(validate(&shallow).is_err());
    }

    #[test]
    fn repairs_fenced_and_wrapped_replies() {
        let fenced = "```json\n{\"a\": 1}\n```";
        assert_eq!(parse_reply(fenced).expect("fenced")["a"], 1);
        let wrapped = "Sure! Here it is: {\"reason\": \"has } brace\", \"n\": {\"m\": 2}} thanks";
        let parsed = parse_reply(wrapped).expect("wrapped");
        assert_eq!(parsed["n"]["m"], 2);
        assert_eq!(parsed["reason"], "has } brace");
        let valid = fixtures::verdict(false).to_string();
        let prefixed = format!("Use {{x}} format: {valid}");
        assert_eq!(parse_reply(&prefixed).expect("later object"), fixtures::verdict(false));
        assert!(parse_reply("no json here").is_none());
        assert!(parse_reply("[1, 2]").is_none());
    }

    #[tokio::test]
    async fn retries_with_lower_temperature_until_valid() {
        let valid = fixtures::verdict(true).to_string();
        let backend = ScriptedBackend::new(vec![Ok("garbage".into()), Ok(format!("```json\n{valid}\n```"))]);
        let outcome = judge(backend.clone()).judge(&record(), &[], "rubric").await;
        match outcome {
            JudgeOutcome::Verdict(v) => {
                assert!(v.validated);
                assert!(v.is_recommended());
            }
            other => panic!("unexpected {other:?}"),
        }
        let temps = backend.temperatures.lock().expect("lock").clone();
        assert_eq!(temps, vec![0.1, 0.05]);
    }

    #[tokio::test]
    async fn transport_errors_retry_at_the_same_temperature() {
        let valid = fixtures::verdict(true).to_string();
        let backend = ScriptedBackend::new(vec![Err(LlmError::Http("HTTP 502".into())), Ok(valid)]);
        let judge = AiJudge::new(
            backend.clone(),
            JudgeConfig::default(),
            4000,
            RetryPolicy::immediate(2),
        );
        match judge.judge(&record(), &[], "rubric").await {
            JudgeOutcome::Verdict(v) => assert!(v.validated),
            other => panic!("unexpected {other:?}"),
        }
        let temps = backend.temperatures.lock().expect("lock").clone();
        assert_eq!(temps, vec![0.1, 0.1]);
    }

    #[tokio::test]
    async fn best_effort_is_tagged_unvalidated() {
        let partial = serde_json::json!({"is_recommended": true, "reason": "looks fine"}).to_string();
        let backend = ScriptedBackend::new(vec![Ok(partial.clone()), Ok(partial.clone()), Ok(partial)]);
        match judge(backend).judge(&record(), &[], "rubric").await {
            JudgeOutcome::Verdict(v) => {
                assert!(!v.validated);
                assert!(!v.is_recommended());
                assert_eq!(v.reason(), "looks fine");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn nothing_parseable_is_invalid() {
        let backend = ScriptedBackend::new(vec![
            Ok("nope".into()),
            Err(LlmError::Http("HTTP 500".into())),
            Ok("still nope".into()),
        ]);
        let outcome = judge(backend).judge(&record(), &[], "rubric").await;
        assert_eq!(outcome, JudgeOutcome::Invalid);
        assert!(!outcome.into_judgement().is_recommended());
    }

    #[tokio::test]
    async fn empty_rubric_means_not_configured() {
        let backend = ScriptedBackend::new(vec![]);
        let outcome = judge(backend).judge(&record(), &[], "  ").await;
        assert_eq!(outcome, JudgeOutcome::NotConfigured);
    }
}
