//! Response schemas and the validating parsers shared by the batch and
//! synchronous paths.

use publink_common::{PublinkError, Result};
use publink_discovery::QueryBundle;
use serde::{Deserialize, Serialize};

/// The classifier's verdict on one (registration, publication) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsVerdict {
    pub has_results: bool,
    pub reason: String,
}

pub fn results_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "has_results": {
                "type": "boolean",
                "description": "True iff this publication reports results of the registered trial."
            },
            "reason": {
                "type": "string",
                "description": "Justification in at most two sentences."
            }
        },
        "required": ["has_results", "reason"],
        "additionalProperties": false
    })
}

pub fn query_v1_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "query": {
                "type": "string",
                "description": "A single PubMed search query for publications of this trial."
            }
        },
        "required": ["query"],
        "additionalProperties": false
    })
}

pub fn query_v2_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "keywords":       { "type": "array", "items": { "type": "string" }, "maxItems": 4 },
            "investigators":  { "type": "array", "items": { "type": "string" }, "maxItems": 3 },
            "search_strings": { "type": "array", "items": { "type": "string" }, "maxItems": 6 },
            "extra_queries":  { "type": "array", "items": { "type": "string" }, "maxItems": 3 }
        },
        "required": ["keywords", "investigators", "search_strings", "extra_queries"],
        "additionalProperties": false
    })
}

/// `has_results` is strictly boolean; anything else is a parse failure,
/// never a silent false.
pub fn parse_verdict(value: &serde_json::Value) -> Result<ResultsVerdict> {
    let has_results = value["has_results"]
        .as_bool()
        .ok_or_else(|| PublinkError::Parse("has_results missing or not a boolean".to_string()))?;
    let reason = value["reason"]
        .as_str()
        .unwrap_or("")
        .trim()
        .to_string();
    Ok(ResultsVerdict { has_results, reason })
}

pub fn parse_query_v1(value: &serde_json::Value) -> Result<String> {
    value["query"]
        .as_str()
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty())
        .ok_or_else(|| PublinkError::Parse("query missing or empty".to_string()))
}

pub fn parse_query_v2(value: &serde_json::Value) -> Result<QueryBundle> {
    let mut bundle: QueryBundle = serde_json::from_value(value.clone())
        .map_err(|e| PublinkError::Parse(format!("query bundle: {e}")))?;
    bundle.clamp();
    Ok(bundle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_verdict_accepts_booleans_only() {
        let ok = parse_verdict(&serde_json::json!({
            "has_results": true,
            "reason": "Reports primary outcome."
        }))
        .unwrap();
        assert!(ok.has_results);
        assert_eq!(ok.reason, "Reports primary outcome.");

        for bad in [
            serde_json::json!({ "has_results": "true", "reason": "string bool" }),
            serde_json::json!({ "has_results": 1, "reason": "numeric bool" }),
            serde_json::json!({ "reason": "missing flag" }),
        ] {
            assert!(parse_verdict(&bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_parse_query_v1_rejects_empty() {
        assert!(parse_query_v1(&serde_json::json!({ "query": "  " })).is_err());
        assert_eq!(
            parse_query_v1(&serde_json::json!({ "query": " NCT1[si] " })).unwrap(),
            "NCT1[si]"
        );
    }

    #[test]
    fn test_parse_query_v2_clamps_limits() {
        let value = serde_json::json!({
            "keywords": ["a", "b", "c", "d", "e", "f"],
            "investigators": [],
            "search_strings": ["q1"],
            "extra_queries": []
        });
        let bundle = parse_query_v2(&value).unwrap();
        assert_eq!(bundle.keywords.len(), 4);
        assert_eq!(bundle.search_strings, vec!["q1"]);
    }

    #[test]
    fn test_schemas_are_strict_objects() {
        for schema in [results_schema(), query_v1_schema(), query_v2_schema()] {
            assert_eq!(schema["type"], "object");
            assert_eq!(schema["additionalProperties"], false);
        }
    }
}
