//! Process-wide LLM token accounting.
//!
//! One counter per run, created by the driver and passed explicitly to
//! everything that talks to the LLM service.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct TokenSpend {
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
}

impl TokenSpend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, prompt_tokens: u64, completion_tokens: u64) {
        self.prompt_tokens.fetch_add(prompt_tokens, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion_tokens, Ordering::Relaxed);
    }

    pub fn prompt_tokens(&self) -> u64 {
        self.prompt_tokens.load(Ordering::Relaxed)
    }

    pub fn completion_tokens(&self) -> u64 {
        self.completion_tokens.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.prompt_tokens() + self.completion_tokens()
    }
}
