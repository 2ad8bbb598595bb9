pub mod dryrun;
pub mod engine;
pub mod export;
pub mod gemini;
pub mod matting;
pub mod model;
pub mod orchestrator;
pub mod preprocess;
pub mod prompts;
pub mod retry;

pub use dryrun::DryrunModel;
pub use engine::StickerEngine;
pub use gemini::{GeminiClient, GeminiModels};
pub use model::GenerativeModel;
pub use orchestrator::{EngineConfig, GenerationOrchestrator, QuotaStatus};
pub use retry::RetryPolicy;
