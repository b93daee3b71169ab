//! Conversation context budget management
//!
//! Keeps LLM conversation threads within a token budget. Per turn the
//! orchestrator decides whether to pass the thread through unchanged, reuse
//! it as-is, or migrate it into a new thread composed of a compressed,
//! PII-scrubbed summary plus the most recent messages. All backend calls run
//! through circuit breakers so an unhealthy service degrades the pipeline to
//! passthrough instead of blocking the conversation.

pub mod breaker;
pub mod cache;
pub mod error;
pub mod llm;
pub mod manager;
pub mod metrics;
pub mod models;
pub mod optimizer;
pub mod privacy;
pub mod settings;
pub mod summarizer;
pub mod tokenizer;

pub use breaker::{BreakerState, BreakerStats, CircuitBreaker, CircuitBreakerConfig};
pub use cache::{CacheStats, TtlCache, TtlCacheConfig};
pub use error::{ContextError, Result};
pub use llm::{ChatCompletionParams, HttpLlmClient, HttpLlmConfig, LlmBackend, MessageOrder, ThreadMessage};
pub use manager::{
    ContextManager, ContextManagerConfig, ManagerStats, PrepareThreadRequest,
    PrepareThreadResponse, TurnAction, TurnDiagnostics,
};
pub use models::{ContentPart, Message, MessageContent, MessageRole, ThreadAnalysis};
pub use optimizer::{
    OptimizationLevel, OptimizationRecommendation, UsageOptimizer, UsageOptimizerConfig,
};
pub use privacy::{PiiRule, PiiScrubber, PiiScrubberConfig, ScrubResult};
pub use settings::{Settings, SettingsStore};
pub use summarizer::{
    detect_language, Language, MessageSummarizer, SummarizerConfig, SummaryRequest, SummaryResult,
};
pub use tokenizer::{SplitMessages, TokenCount, TokenCounter, TokenCounterConfig};
