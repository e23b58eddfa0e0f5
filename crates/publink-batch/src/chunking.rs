//! Packing classification requests into bounded chunks.
//!
//! Two caps hold simultaneously: a request count and an effective byte
//! size (the configured maximum scaled by the safety buffer). When the
//! next request would overflow either, the current chunk is sealed and a
//! new one starts.

use publink_common::{PublinkError, Result};

/// One serialized batch request ready to be written to a JSONL chunk.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub custom_id: String,
    pub line: String,
    pub estimated_tokens: u64,
}

impl PreparedRequest {
    pub fn new(custom_id: String, body: &serde_json::Value, estimated_tokens: u64) -> Self {
        Self {
            custom_id,
            line: body.to_string(),
            estimated_tokens,
        }
    }

    /// Bytes this request occupies in the file, newline included.
    fn byte_len(&self) -> usize {
        self.line.len() + 1
    }
}

/// `ceil((|system| + |user|) / 4)` plus the fixed per-request overhead.
pub fn estimate_tokens(system_prompt: &str, user_prompt: &str, system_tokens_per_request: u64) -> u64 {
    let chars = (system_prompt.len() + user_prompt.len()) as u64;
    chars.div_ceil(4) + system_tokens_per_request
}

/// A sealed chunk: its lines plus the totals recorded in Progress.
#[derive(Debug, Default)]
pub struct ChunkPlan {
    pub requests: Vec<PreparedRequest>,
    pub request_count: usize,
    pub size_bytes: usize,
    pub estimated_tokens: u64,
}

impl ChunkPlan {
    pub fn jsonl(&self) -> String {
        let mut out = String::with_capacity(self.size_bytes);
        for request in &self.requests {
            out.push_str(&request.line);
            out.push('\n');
        }
        out
    }
}

pub fn pack_chunks(
    requests: Vec<PreparedRequest>,
    max_requests_per_chunk: usize,
    effective_max_bytes: usize,
) -> Result<Vec<ChunkPlan>> {
    let mut chunks = Vec::new();
    let mut current = ChunkPlan::default();

    for request in requests {
        let bytes = request.byte_len();
        if bytes > effective_max_bytes {
            return Err(PublinkError::Config(format!(
                "request {} serializes to {bytes} bytes, above the effective cap of {effective_max_bytes}; raise batch.max_bytes_per_batch",
                request.custom_id
            )));
        }

        let overflows = current.request_count + 1 > max_requests_per_chunk
            || current.size_bytes + bytes > effective_max_bytes;
        if overflows && current.request_count > 0 {
            chunks.push(std::mem::take(&mut current));
        }

        current.request_count += 1;
        current.size_bytes += bytes;
        current.estimated_tokens += request.estimated_tokens;
        current.requests.push(request);
    }

    if current.request_count > 0 {
        chunks.push(current);
    }
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: &str, payload_bytes: usize, tokens: u64) -> PreparedRequest {
        // Line length is padded content; byte_len adds the newline.
        PreparedRequest {
            custom_id: id.to_string(),
            line: "x".repeat(payload_bytes),
            estimated_tokens: tokens,
        }
    }

    #[test]
    fn test_estimate_tokens_matches_formula() {
        assert_eq!(estimate_tokens("abcd", "efgh", 25), 2 + 25);
        assert_eq!(estimate_tokens("abc", "", 25), 1 + 25); // ceil(3/4)
        assert_eq!(estimate_tokens("", "", 10), 10);
    }

    #[test]
    fn test_packs_respect_request_count_cap() {
        let requests = (0..7).map(|i| request(&format!("r{i}"), 10, 5)).collect();
        let chunks = pack_chunks(requests, 3, 10_000).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].request_count, 3);
        assert_eq!(chunks[1].request_count, 3);
        assert_eq!(chunks[2].request_count, 1);
    }

    #[test]
    fn test_packs_respect_byte_cap() {
        // Each request occupies 101 bytes; cap of 250 fits two per chunk.
        let requests = (0..5).map(|i| request(&format!("r{i}"), 100, 5)).collect();
        let chunks = pack_chunks(requests, 100, 250).unwrap();
        assert_eq!(chunks.len(), 3);
        for chunk in &chunks {
            assert!(chunk.size_bytes <= 250);
            assert!(chunk.request_count <= 2);
        }
    }

    #[test]
    fn test_oversized_single_request_is_config_error() {
        let requests = vec![request("huge", 1000, 5)];
        let err = pack_chunks(requests, 100, 500).unwrap_err();
        assert!(matches!(err, PublinkError::Config(_)));
    }

    #[test]
    fn test_empty_input_packs_to_no_chunks() {
        assert!(pack_chunks(Vec::new(), 10, 100).unwrap().is_empty());
    }

    #[test]
    fn test_jsonl_roundtrip_preserves_request_list() {
        let requests: Vec<PreparedRequest> = (0..3)
            .map(|i| {
                let body = serde_json::json!({ "custom_id": format!("t{i}__p{i}") });
                PreparedRequest::new(format!("t{i}__p{i}"), &body, 10)
            })
            .collect();
        let chunks = pack_chunks(requests, 10, 10_000).unwrap();
        assert_eq!(chunks.len(), 1);

        let parsed: Vec<serde_json::Value> = chunks[0]
            .jsonl()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[1]["custom_id"], "t1__p1");
    }

    #[test]
    fn test_token_totals_accumulate_per_chunk() {
        let requests = (0..4).map(|i| request(&format!("r{i}"), 10, 7)).collect();
        let chunks = pack_chunks(requests, 2, 10_000).unwrap();
        assert_eq!(chunks[0].estimated_tokens, 14);
        assert_eq!(chunks[1].estimated_tokens, 14);
    }
}
