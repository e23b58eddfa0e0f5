//! LLM query generation for the pubmed_gpt strategies.
//!
//! v1 asks for a single PubMed query; v2 asks for a bundle of keywords,
//! investigators, and search strings. Batch runs pre-materialize these
//! through the batch API with `custom_id = trialId`; the live driver
//! generates them on the spot through the same prompts.

use std::sync::Arc;

use async_trait::async_trait;
use publink_common::config::ReasoningEffort;
use publink_common::{Result, TokenSpend};
use publink_discovery::{QueryBundle, QueryGenerator};
use publink_registry::Registration;

use crate::client::{CompletionApi, CompletionRequest, Message};
use crate::schema::{parse_query_v1, parse_query_v2, query_v1_schema, query_v2_schema};

pub const QUERY_V1_SYSTEM_PROMPT: &str = "\
You are given the JSON record of a clinical-trial registration. Produce \
ONE PubMed search query that would find peer-reviewed publications \
reporting this trial's results. Prefer precise identifiers and title \
phrases over broad terms. Return the structured object with the query.";

pub const QUERY_V2_SYSTEM_PROMPT: &str = "\
You are given the JSON record of a clinical-trial registration. Extract \
search material for finding publications of this trial: up to 4 topic \
keywords, up to 3 investigator names, up to 6 complete PubMed search \
strings, and up to 3 extra fallback queries. Return the structured \
bundle.";

/// The registration as the model sees it. Fields that would leak the
/// answer (the registry's own results claim and its linked publications)
/// are stripped before prompting.
pub fn registration_payload(registration: &Registration) -> serde_json::Value {
    let mut value = serde_json::to_value(registration).unwrap_or_default();
    if let Some(map) = value.as_object_mut() {
        map.remove("has_results");
        map.remove("linked_pubmed_ids");
        map.remove("references");
    }
    value
}

fn query_messages(system_prompt: &str, registration: &Registration) -> Vec<Message> {
    vec![
        Message::system(system_prompt),
        Message::user(registration_payload(registration).to_string()),
    ]
}

/// One batch JSONL request for a query-generation variant;
/// `custom_id` is the trial id itself.
pub fn batch_request(
    registration: &Registration,
    system_prompt: &str,
    schema_name: &str,
    schema: serde_json::Value,
    model: &str,
    reasoning: ReasoningEffort,
    max_tokens: u32,
) -> serde_json::Value {
    serde_json::json!({
        "custom_id": registration.trial_id,
        "method": "POST",
        "url": "/v1/chat/completions",
        "body": {
            "model": model,
            "messages": query_messages(system_prompt, registration),
            "max_completion_tokens": max_tokens,
            "reasoning_effort": reasoning.as_str(),
            "response_format": {
                "type": "json_schema",
                "json_schema": { "name": schema_name, "strict": true, "schema": schema }
            }
        }
    })
}

/// Parse one query-generation batch output line into the trial id and
/// the model's parsed JSON content.
pub fn parse_query_batch_line(line: &str) -> Option<(String, Result<serde_json::Value>)> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    let trial_id = value["custom_id"].as_str()?.to_string();

    if !value["error"].is_null() {
        let message = value["error"]["message"].as_str().unwrap_or("batch error");
        return Some((
            trial_id,
            Err(publink_common::PublinkError::Parse(message.to_string())),
        ));
    }

    let content = match value["response"]["body"]["choices"][0]["message"]["content"].as_str() {
        Some(c) => c,
        None => {
            return Some((
                trial_id,
                Err(publink_common::PublinkError::Parse(
                    "no text output in response".to_string(),
                )),
            ))
        }
    };
    let parsed = serde_json::from_str(content)
        .map_err(|e| publink_common::PublinkError::Parse(format!("query output: {e}")));
    Some((trial_id, parsed))
}

/// Live-mode generator backing the pubmed_gpt strategies.
pub struct QueryGen {
    api: Arc<dyn CompletionApi>,
    model_v1: String,
    model_v2: String,
    reasoning_v1: ReasoningEffort,
    reasoning_v2: ReasoningEffort,
    max_tokens_v1: u32,
    max_tokens_v2: u32,
    system_prompt_v1: String,
    system_prompt_v2: String,
    spend: Arc<TokenSpend>,
}

impl QueryGen {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: Arc<dyn CompletionApi>,
        model_v1: String,
        model_v2: String,
        reasoning_v1: ReasoningEffort,
        reasoning_v2: ReasoningEffort,
        max_tokens_v1: u32,
        max_tokens_v2: u32,
        system_prompt_v1: Option<String>,
        system_prompt_v2: Option<String>,
        spend: Arc<TokenSpend>,
    ) -> Self {
        Self {
            api,
            model_v1,
            model_v2,
            reasoning_v1,
            reasoning_v2,
            max_tokens_v1,
            max_tokens_v2,
            system_prompt_v1: system_prompt_v1
                .unwrap_or_else(|| QUERY_V1_SYSTEM_PROMPT.to_string()),
            system_prompt_v2: system_prompt_v2
                .unwrap_or_else(|| QUERY_V2_SYSTEM_PROMPT.to_string()),
            spend,
        }
    }
}

#[async_trait]
impl QueryGenerator for QueryGen {
    async fn query_v1(&self, registration: &Registration) -> anyhow::Result<String> {
        let completion = self
            .api
            .complete(CompletionRequest {
                model: self.model_v1.clone(),
                reasoning: self.reasoning_v1,
                max_tokens: self.max_tokens_v1,
                schema_name: "pubmed_query".to_string(),
                schema: query_v1_schema(),
                messages: query_messages(&self.system_prompt_v1, registration),
            })
            .await?;
        self.spend
            .record(completion.prompt_tokens, completion.completion_tokens);
        Ok(parse_query_v1(&completion.parsed)?)
    }

    async fn query_v2(&self, registration: &Registration) -> anyhow::Result<QueryBundle> {
        let completion = self
            .api
            .complete(CompletionRequest {
                model: self.model_v2.clone(),
                reasoning: self.reasoning_v2,
                max_tokens: self.max_tokens_v2,
                schema_name: "pubmed_query_bundle".to_string(),
                schema: query_v2_schema(),
                messages: query_messages(&self.system_prompt_v2, registration),
            })
            .await?;
        self.spend
            .record(completion.prompt_tokens, completion.completion_tokens);
        Ok(parse_query_v2(&completion.parsed)?)
    }
}
