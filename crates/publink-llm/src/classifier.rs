//! The results classifier: does this publication report the registered
//! trial's results?
//!
//! Synchronous mode sends one completion per pair; batch mode serializes
//! the same request to a JSONL line with `custom_id = "{trial}__{pmid}"`
//! and the output is matched back by that id. Both modes run the same
//! verdict parser.

use std::sync::Arc;

use publink_common::config::ReasoningEffort;
use publink_common::TokenSpend;
use publink_discovery::Publication;
use publink_registry::Registration;
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use crate::client::{CompletionApi, CompletionRequest, Message};
use crate::schema::{parse_verdict, results_schema};

pub const RESULTS_SYSTEM_PROMPT: &str = "\
You compare a clinical-trial registration against a candidate publication \
and decide whether the publication reports results of that registered \
trial. A publication reports results when it presents outcome data from \
the study the registration describes, not merely its protocol, design, or \
a different study by the same group. Answer with the structured verdict: \
has_results as a boolean and a reason of at most two sentences.";

/// One stored classification per (trial, PMID) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub has_results: bool,
    pub reason: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Classification {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            has_results: false,
            reason: String::new(),
            prompt_tokens: 0,
            completion_tokens: 0,
            success: false,
            error: Some(error.into()),
        }
    }
}

pub fn custom_id(trial_id: &str, pmid: &str) -> String {
    format!("{trial_id}__{pmid}")
}

/// Inverse of [`custom_id`]. Trial ids never contain `__`, so the first
/// separator wins.
pub fn parse_custom_id(id: &str) -> Option<(String, String)> {
    let (trial, pmid) = id.split_once("__")?;
    if trial.is_empty() || pmid.is_empty() {
        return None;
    }
    Some((trial.to_string(), pmid.to_string()))
}

fn field(label: &str, value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| format!("{label}: {v}"))
}

/// Assemble the user prompt from the registration and publication fields.
pub fn build_user_prompt(registration: &Registration, publication: &Publication) -> String {
    let mut lines = vec!["REGISTRATION".to_string()];
    lines.extend(
        [
            field("Trial ID", Some(registration.trial_id.as_str())),
            field("Brief title", registration.brief_title.as_deref()),
            field("Official title", registration.official_title.as_deref()),
            field("Organization", registration.organization.as_deref()),
            field("Study type", registration.study_type.as_deref()),
            field("Brief summary", registration.brief_summary.as_deref()),
            field("Detailed description", registration.detailed_description.as_deref()),
        ]
        .into_iter()
        .flatten(),
    );

    lines.push(String::new());
    lines.push("PUBLICATION".to_string());
    lines.extend(
        [
            field("Title", publication.title.as_deref()),
            field("Authors", publication.authors.as_deref()),
            field("Abstract", publication.abstract_text.as_deref()),
        ]
        .into_iter()
        .flatten(),
    );

    lines.join("\n")
}

pub struct Classifier {
    api: Arc<dyn CompletionApi>,
    model: String,
    reasoning: ReasoningEffort,
    max_tokens: u32,
    system_prompt: String,
    spend: Arc<TokenSpend>,
}

impl Classifier {
    pub fn new(
        api: Arc<dyn CompletionApi>,
        model: String,
        reasoning: ReasoningEffort,
        max_tokens: u32,
        system_prompt: Option<String>,
        spend: Arc<TokenSpend>,
    ) -> Self {
        Self {
            api,
            model,
            reasoning,
            max_tokens,
            system_prompt: system_prompt.unwrap_or_else(|| RESULTS_SYSTEM_PROMPT.to_string()),
            spend,
        }
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// Synchronous classification; failures are captured in the record,
    /// never raised.
    #[instrument(skip(self, registration, publication),
                 fields(trial_id = %registration.trial_id, pmid = %publication.pmid))]
    pub async fn classify(
        &self,
        registration: &Registration,
        publication: &Publication,
    ) -> Classification {
        let request = CompletionRequest {
            model: self.model.clone(),
            reasoning: self.reasoning,
            max_tokens: self.max_tokens,
            schema_name: "results_verdict".to_string(),
            schema: results_schema(),
            messages: vec![
                Message::system(&self.system_prompt),
                Message::user(build_user_prompt(registration, publication)),
            ],
        };

        match self.api.complete(request).await {
            Ok(completion) => {
                self.spend
                    .record(completion.prompt_tokens, completion.completion_tokens);
                match parse_verdict(&completion.parsed) {
                    Ok(verdict) => Classification {
                        has_results: verdict.has_results,
                        reason: verdict.reason,
                        prompt_tokens: completion.prompt_tokens,
                        completion_tokens: completion.completion_tokens,
                        success: true,
                        error: None,
                    },
                    Err(e) => {
                        warn!(error = %e, "Verdict parse failed");
                        Classification::failure(e.to_string())
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Classification request failed");
                Classification::failure(e.to_string())
            }
        }
    }

    /// The same request in batch form: one JSONL object addressed to the
    /// chat-completions endpoint.
    pub fn batch_request(
        &self,
        registration: &Registration,
        publication: &Publication,
    ) -> serde_json::Value {
        serde_json::json!({
            "custom_id": custom_id(&registration.trial_id, &publication.pmid),
            "method": "POST",
            "url": "/v1/chat/completions",
            "body": {
                "model": self.model,
                "messages": [
                    { "role": "system", "content": self.system_prompt },
                    { "role": "user", "content": build_user_prompt(registration, publication) }
                ],
                "max_completion_tokens": self.max_tokens,
                "reasoning_effort": self.reasoning.as_str(),
                "response_format": {
                    "type": "json_schema",
                    "json_schema": {
                        "name": "results_verdict",
                        "strict": true,
                        "schema": results_schema(),
                    }
                }
            }
        })
    }
}

/// Parse one line of a batch output file into its custom id and the
/// resulting classification. The first text part of the message output
/// carries the verdict; anything missing or malformed yields a failed
/// classification, never a panic.
pub fn parse_batch_output_line(line: &str) -> Option<(String, Classification)> {
    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(_) => return None,
    };
    let id = value["custom_id"].as_str()?.to_string();

    if !value["error"].is_null() {
        let message = value["error"]["message"]
            .as_str()
            .unwrap_or("request-level batch error");
        return Some((id, Classification::failure(message)));
    }

    let body = &value["response"]["body"];
    let prompt_tokens = body["usage"]["prompt_tokens"].as_u64().unwrap_or(0);
    let completion_tokens = body["usage"]["completion_tokens"].as_u64().unwrap_or(0);

    let Some(content) = body["choices"][0]["message"]["content"].as_str() else {
        return Some((id, Classification::failure("no text output in response")));
    };

    let classification = match serde_json::from_str::<serde_json::Value>(content)
        .map_err(|e| publink_common::PublinkError::Parse(e.to_string()))
        .and_then(|parsed| parse_verdict(&parsed))
    {
        Ok(verdict) => Classification {
            has_results: verdict.has_results,
            reason: verdict.reason,
            prompt_tokens,
            completion_tokens,
            success: true,
            error: None,
        },
        Err(e) => {
            let mut failed = Classification::failure(e.to_string());
            failed.prompt_tokens = prompt_tokens;
            failed.completion_tokens = completion_tokens;
            failed
        }
    };
    Some((id, classification))
}

#[cfg(test)]
mod tests {
    use super::*;
    use publink_common::Registry;

    fn pair() -> (Registration, Publication) {
        let mut reg = Registration::new("NCT00000001", Registry::Ctgov);
        reg.brief_title = Some("Aspirin for Headache".to_string());
        reg.organization = Some("University Hospital".to_string());
        reg.brief_summary = Some("A trial of aspirin.".to_string());
        let mut publication = Publication::from_pmid("111");
        publication.title = Some("Aspirin trial results".to_string());
        publication.authors = Some("Jane Doe".to_string());
        publication.abstract_text = Some("We report outcomes.".to_string());
        (reg, publication)
    }

    #[test]
    fn test_custom_id_roundtrip() {
        assert_eq!(custom_id("NCT00000001", "111"), "NCT00000001__111");
        assert_eq!(
            parse_custom_id("NCT00000001__111"),
            Some(("NCT00000001".to_string(), "111".to_string()))
        );
        assert_eq!(
            parse_custom_id("2004-000446-20__222"),
            Some(("2004-000446-20".to_string(), "222".to_string()))
        );
        assert_eq!(parse_custom_id("no-separator"), None);
        assert_eq!(parse_custom_id("__111"), None);
    }

    #[test]
    fn test_user_prompt_skips_empty_fields() {
        let (reg, publication) = pair();
        let prompt = build_user_prompt(&reg, &publication);
        assert!(prompt.contains("Trial ID: NCT00000001"));
        assert!(prompt.contains("Brief title: Aspirin for Headache"));
        assert!(prompt.contains("Organization: University Hospital"));
        assert!(prompt.contains("Abstract: We report outcomes."));
        assert!(!prompt.contains("Official title"));
        assert!(!prompt.contains("Detailed description"));
    }

    #[test]
    fn test_batch_request_shape() {
        let (reg, publication) = pair();
        let classifier = Classifier::new(
            Arc::new(NoopApi),
            "gpt-4o".to_string(),
            ReasoningEffort::Medium,
            2000,
            None,
            Arc::new(TokenSpend::new()),
        );
        let request = classifier.batch_request(&reg, &publication);
        assert_eq!(request["custom_id"], "NCT00000001__111");
        assert_eq!(request["url"], "/v1/chat/completions");
        assert_eq!(request["body"]["model"], "gpt-4o");
        assert_eq!(request["body"]["reasoning_effort"], "medium");
        assert_eq!(
            request["body"]["response_format"]["json_schema"]["name"],
            "results_verdict"
        );
    }

    #[test]
    fn test_parse_batch_output_success_line() {
        let line = serde_json::json!({
            "custom_id": "NCT00000001__111",
            "response": {
                "status_code": 200,
                "body": {
                    "choices": [{ "message": {
                        "content": "{\"has_results\": true, \"reason\": \"Reports outcomes.\"}"
                    }}],
                    "usage": { "prompt_tokens": 120, "completion_tokens": 18 }
                }
            },
            "error": null
        })
        .to_string();

        let (id, classification) = parse_batch_output_line(&line).unwrap();
        assert_eq!(id, "NCT00000001__111");
        assert!(classification.success);
        assert!(classification.has_results);
        assert_eq!(classification.prompt_tokens, 120);
    }

    #[test]
    fn test_parse_batch_output_malformed_content_fails_closed() {
        let line = serde_json::json!({
            "custom_id": "NCT00000001__111",
            "response": { "body": { "choices": [{ "message": { "content": "not json" } }] } },
            "error": null
        })
        .to_string();

        let (_, classification) = parse_batch_output_line(&line).unwrap();
        assert!(!classification.success);
        assert!(!classification.has_results);
        assert!(classification.error.is_some());
    }

    #[test]
    fn test_parse_batch_output_request_error() {
        let line = serde_json::json!({
            "custom_id": "NCT00000001__222",
            "response": null,
            "error": { "message": "rate limited" }
        })
        .to_string();

        let (_, classification) = parse_batch_output_line(&line).unwrap();
        assert!(!classification.success);
        assert_eq!(classification.error.as_deref(), Some("rate limited"));
    }

    struct NoopApi;

    #[async_trait::async_trait]
    impl CompletionApi for NoopApi {
        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> publink_common::Result<crate::client::Completion> {
            Err(publink_common::PublinkError::LlmSync("noop".to_string()))
        }
    }
}
