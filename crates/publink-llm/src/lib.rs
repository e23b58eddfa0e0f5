//! publink-llm — LLM service client (synchronous completion and the
//! asynchronous Files+Batches surface), the results classifier, and the
//! query-generation prompt builders.

pub mod classifier;
pub mod client;
pub mod querygen;
pub mod schema;

pub use classifier::{Classification, Classifier};
pub use client::{
    BatchApi, BatchJob, BatchStatus, Completion, CompletionApi, CompletionRequest, LlmClient,
    Message,
};
pub use querygen::QueryGen;
