//! publink-batch — The resumable staged batch runner: durable Progress,
//! chunk packing, daily token budgets, the stage-machine orchestrator,
//! and the summary outputs.

pub mod budget;
pub mod chunking;
pub mod input;
pub mod orchestrator;
pub mod progress;
pub mod summary;

pub use orchestrator::{Orchestrator, OrchestratorServices};
pub use progress::{Chunk, ChunkStatus, Progress, Stage};
pub use summary::TrialSummary;
