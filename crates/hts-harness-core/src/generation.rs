//! Text-generation capability trait.
//!
//! Every call is bounded: [`CompletionRequest`] always carries a token cap
//! and a timeout. Providers live in the application crate.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

/// A bounded completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub timeout: Duration,
}

/// Generated text plus the usage the provider reported. Both counts are
/// zero when the provider reported none.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

impl Completion {
    pub fn total_tokens(&self) -> u64 {
        self.tokens_in + self.tokens_out
    }
}

/// An opaque `complete(prompt, max_tokens, timeout) -> text` capability.
#[async_trait]
pub trait Generator: Send + Sync {
    fn model_name(&self) -> &str;
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion>;
}
