//! Per-turn context orchestration
//!
//! Decides, per turn, whether the conversation passes through unchanged,
//! reuses its existing thread, or migrates into a new thread composed of a
//! compressed summary plus the most recent messages. The conversational path
//! never hard-fails here; the worst case is an unoptimized passthrough turn.

use crate::breaker::{BreakerStats, CircuitBreaker};
use crate::cache::{keys, CacheStats, TtlCache, TtlCacheConfig};
use crate::error::Result;
use crate::llm::{LlmBackend, MessageOrder};
use crate::metrics::METRICS;
use crate::models::{Message, MessageRole, ThreadAnalysis};
use crate::optimizer::{OptimizationLevel, OptimizationRecommendation, UsageOptimizer};
use crate::settings::{Settings, SettingsStore};
use crate::summarizer::{detect_language, Language, MessageSummarizer, SummaryRequest};
use crate::tokenizer::TokenCounter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct ContextManagerConfig {
    /// Administrative switch, independent of the persisted settings flag.
    pub enabled: bool,
    pub settings_cache_ttl: Duration,
    /// Threads shorter than this are never summarized.
    pub min_messages_for_summary: usize,
    /// Prefix marking the summary message in a replacement thread.
    pub summary_tag: String,
    pub summary_target_tokens: usize,
    pub aggressive_summary_target_tokens: usize,
    /// Model name recorded with usage metrics.
    pub model: String,
}

impl Default for ContextManagerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            settings_cache_ttl: Duration::from_secs(300),
            min_messages_for_summary: 5,
            summary_tag: "[CONVERSATION_SUMMARY]".to_string(),
            summary_target_tokens: 512,
            aggressive_summary_target_tokens: 256,
            model: "gpt-4o-mini".to_string(),
        }
    }
}

/// Per-turn request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrepareThreadRequest {
    pub thread_id: Option<String>,
    /// Newest incoming user message; drives summary language detection.
    pub incoming_message: Option<String>,
}

/// Terminal action of a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnAction {
    Passthrough,
    ReuseThread,
    NewThreadWithSummary,
}

impl TurnAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnAction::Passthrough => "passthrough",
            TurnAction::ReuseThread => "reuse_thread",
            TurnAction::NewThreadWithSummary => "new_thread_with_summary",
        }
    }
}

/// Diagnostics attached to every turn response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnDiagnostics {
    pub original_tokens: usize,
    pub final_tokens: usize,
    pub tokens_reduced: usize,
    /// Rounded to the nearest integer percent.
    pub reduction_percent: u32,
    pub original_message_count: usize,
    pub live_message_count: usize,
    pub pii_removed: usize,
    pub optimization_level: OptimizationLevel,
    pub processing_time_ms: u64,
}

impl Default for TurnDiagnostics {
    fn default() -> Self {
        Self {
            original_tokens: 0,
            final_tokens: 0,
            tokens_reduced: 0,
            reduction_percent: 0,
            original_message_count: 0,
            live_message_count: 0,
            pii_removed: 0,
            optimization_level: OptimizationLevel::None,
            processing_time_ms: 0,
        }
    }
}

/// Per-turn response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareThreadResponse {
    pub action: TurnAction,
    /// The thread the caller should continue on; a new id after migration.
    pub thread_id: Option<String>,
    pub diagnostics: TurnDiagnostics,
    /// Human-readable note, populated when optimization was skipped.
    pub recommendation: Option<String>,
}

/// Aggregate statistics over the whole subsystem
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerStats {
    pub settings: Settings,
    pub settings_cache: CacheStats,
    pub summary_cache: CacheStats,
    pub token_cache_entries: usize,
    pub thread_breaker: BreakerStats,
    pub summarization_breaker: BreakerStats,
}

/// The context-budget orchestrator.
///
/// Concurrent turns for the same thread id are not serialized: two racing
/// turns may each build a replacement thread. The caller adopts whichever
/// response it consumes and the next turn starts from that id, so the race
/// self-heals at the cost of one orphaned thread.
pub struct ContextManager {
    config: ContextManagerConfig,
    backend: Arc<dyn LlmBackend>,
    counter: Arc<TokenCounter>,
    summarizer: Arc<MessageSummarizer>,
    optimizer: Arc<UsageOptimizer>,
    store: Arc<SettingsStore>,
    thread_breaker: Arc<CircuitBreaker>,
    summarization_breaker: Arc<CircuitBreaker>,
    settings_cache: TtlCache<Settings>,
}

impl ContextManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ContextManagerConfig,
        backend: Arc<dyn LlmBackend>,
        counter: Arc<TokenCounter>,
        summarizer: Arc<MessageSummarizer>,
        optimizer: Arc<UsageOptimizer>,
        store: Arc<SettingsStore>,
        thread_breaker: Arc<CircuitBreaker>,
        summarization_breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            config,
            backend,
            counter,
            summarizer,
            optimizer,
            store,
            thread_breaker,
            summarization_breaker,
            settings_cache: TtlCache::new(TtlCacheConfig::default()),
        }
    }

    /// Run the per-turn decision state machine.
    ///
    /// Never fails: any error degrades to `passthrough` with the cause in
    /// the `recommendation` field, so the conversation can always proceed.
    pub async fn prepare_thread_for_run(
        &self,
        request: &PrepareThreadRequest,
    ) -> PrepareThreadResponse {
        let started = Instant::now();

        match self.run_turn(request, started).await {
            Ok(response) => {
                METRICS.record_turn(response.action.as_str());
                response
            }
            Err(e) => {
                if e.is_breaker_open() {
                    warn!("Turn rejected by open circuit breaker: {}", e);
                } else {
                    warn!("Turn failed, passing thread through unchanged: {}", e);
                }
                METRICS.record_turn("passthrough");

                PrepareThreadResponse {
                    action: TurnAction::Passthrough,
                    thread_id: request.thread_id.clone(),
                    diagnostics: TurnDiagnostics {
                        processing_time_ms: started.elapsed().as_millis() as u64,
                        ..Default::default()
                    },
                    recommendation: Some(format!("Context optimization skipped: {}", e)),
                }
            }
        }
    }

    /// Persist the enabled flag. Unlike turn processing this propagates
    /// persistence errors; silently losing an explicit setting change would
    /// be misleading.
    pub async fn toggle_enabled(&self, enabled: bool) -> Result<Settings> {
        let settings = self.store.save_partial(|s| s.enabled = enabled).await?;
        self.settings_cache.set_with_ttl(
            &keys::system_settings(),
            settings.clone(),
            self.config.settings_cache_ttl,
        );
        info!(enabled, "Context optimization toggled");
        Ok(settings)
    }

    pub async fn get_stats(&self) -> ManagerStats {
        ManagerStats {
            settings: self.settings().await,
            settings_cache: self.settings_cache.stats(),
            summary_cache: self.summarizer.cache_stats(),
            token_cache_entries: self.counter.cached_entries(),
            thread_breaker: self.thread_breaker.stats(),
            summarization_breaker: self.summarization_breaker.stats(),
        }
    }

    /// Recompute the optimizer recommendation immediately.
    pub async fn force_optimization(&self) -> OptimizationRecommendation {
        self.optimizer.optimize_usage(true).await
    }

    pub fn clear_all_caches(&self) {
        self.settings_cache.clear();
        self.summarizer.clear_cache();
        self.counter.clear_cache();
        self.optimizer.clear_cache();
        info!("All caches cleared");
    }

    /// Spawn the periodic cache sweeps. Call once from the composition root;
    /// the tasks run on fixed intervals independent of request traffic.
    pub fn spawn_background_tasks(&self) -> Vec<JoinHandle<()>> {
        vec![
            self.settings_cache.spawn_sweeper(),
            self.summarizer.spawn_cache_sweeper(),
            self.optimizer.spawn_cache_sweeper(),
        ]
    }

    async fn run_turn(
        &self,
        request: &PrepareThreadRequest,
        started: Instant,
    ) -> Result<PrepareThreadResponse> {
        if !self.config.enabled {
            return Ok(Self::passthrough(request.thread_id.clone(), started));
        }

        let settings = self.settings().await;
        if !settings.enabled {
            return Ok(Self::passthrough(request.thread_id.clone(), started));
        }

        let thread_id = match request.thread_id.as_deref() {
            Some(id) => id,
            None => {
                return Ok(self.reuse(None, &ThreadAnalysis::default(), &settings, started));
            }
        };

        let messages = self.fetch_messages(thread_id).await?;
        let analysis = ThreadAnalysis::of(
            &messages,
            settings.live_budget,
            settings.hard_cap,
            self.config.min_messages_for_summary,
        );

        if !analysis.needs_optimization {
            return Ok(self.reuse(Some(thread_id), &analysis, &settings, started));
        }

        // Settings always act as the ceiling the optimizer cannot exceed.
        // With auto-optimize off the settings budget applies unchanged.
        let (effective_budget, level, aggressive) = if settings.auto_optimize {
            let recommendation = self.optimizer.optimize_usage(false).await;
            (
                recommendation.live_budget.min(settings.live_budget),
                recommendation.level,
                recommendation.aggressive_summary,
            )
        } else {
            (settings.live_budget, settings.optimization_level, false)
        };

        let split = self
            .counter
            .split_messages_by_budget(&messages, effective_budget);
        if split.old_messages.is_empty() {
            debug!("Precise split found nothing to summarize");
            return Ok(self.reuse(Some(thread_id), &analysis, &settings, started));
        }

        let language = self.turn_language(request, &messages);
        let target_tokens = if aggressive {
            self.config.aggressive_summary_target_tokens
        } else {
            self.config.summary_target_tokens
        };

        let summary = self
            .summarizer
            .summarize_messages(&SummaryRequest {
                messages: split.old_messages.clone(),
                target_tokens: Some(target_tokens),
                language,
            })
            .await?;

        let new_thread_id = self.build_replacement_thread(&summary.summary, &split.live_messages).await?;

        let original_tokens = analysis.total_tokens;
        let live_tokens: usize = split.live_messages.iter().map(|m| m.token_count).sum();
        let final_tokens = live_tokens + summary.summary_tokens;
        let tokens_reduced = original_tokens.saturating_sub(final_tokens);
        let reduction_percent = if original_tokens == 0 {
            0
        } else {
            ((tokens_reduced as f64 / original_tokens as f64) * 100.0).round() as u32
        };

        let cost = self.optimizer.estimate_cost(original_tokens as u64);
        self.optimizer
            .add_usage_metric(original_tokens as u64, cost, &self.config.model);
        METRICS.tokens_reduced.observe(tokens_reduced as f64);

        info!(
            old_thread = thread_id,
            new_thread = %new_thread_id,
            original_tokens,
            final_tokens,
            reduction_percent,
            "Thread migrated to summary + live suffix"
        );

        Ok(PrepareThreadResponse {
            action: TurnAction::NewThreadWithSummary,
            thread_id: Some(new_thread_id),
            diagnostics: TurnDiagnostics {
                original_tokens,
                final_tokens,
                tokens_reduced,
                reduction_percent,
                original_message_count: analysis.message_count,
                live_message_count: split.live_messages.len(),
                pii_removed: summary.pii_removed,
                optimization_level: level,
                processing_time_ms: started.elapsed().as_millis() as u64,
            },
            recommendation: None,
        })
    }

    /// Settings read through the cache; bounds store reads to roughly one
    /// per TTL window regardless of request rate.
    async fn settings(&self) -> Settings {
        let key = keys::system_settings();
        if let Some(settings) = self.settings_cache.get(&key) {
            return settings;
        }

        let settings = self.store.load().await;
        self.settings_cache
            .set_with_ttl(&key, settings.clone(), self.config.settings_cache_ttl);
        settings
    }

    async fn fetch_messages(&self, thread_id: &str) -> Result<Vec<Message>> {
        let backend = Arc::clone(&self.backend);
        let id = thread_id.to_string();
        let thread_messages = self
            .thread_breaker
            .execute(move || async move {
                backend.list_messages(&id, None, MessageOrder::Ascending).await
            })
            .await?;

        let messages = thread_messages
            .iter()
            .map(|m| Message::new(m.role, m.content.extract_text()))
            .collect();
        Ok(self.counter.count_each(messages))
    }

    /// Create the replacement thread: the tagged summary message always goes
    /// first, then every live message in its original relative order.
    async fn build_replacement_thread(
        &self,
        summary: &str,
        live_messages: &[Message],
    ) -> Result<String> {
        let backend = Arc::clone(&self.backend);
        let new_thread_id = self
            .thread_breaker
            .execute(move || async move { backend.create_thread().await })
            .await?;

        let tagged = format!("{} {}", self.config.summary_tag, summary);
        self.append(&new_thread_id, MessageRole::System, &tagged).await?;

        for message in live_messages {
            self.append(&new_thread_id, message.role, &message.content)
                .await?;
        }

        Ok(new_thread_id)
    }

    async fn append(&self, thread_id: &str, role: MessageRole, text: &str) -> Result<()> {
        let backend = Arc::clone(&self.backend);
        let id = thread_id.to_string();
        let body = text.to_string();
        self.thread_breaker
            .execute(move || async move { backend.append_message(&id, role, &body).await })
            .await
    }

    fn turn_language(&self, request: &PrepareThreadRequest, messages: &[Message]) -> Language {
        if let Some(incoming) = request.incoming_message.as_deref() {
            return detect_language(incoming);
        }
        messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| detect_language(&m.content))
            .unwrap_or(Language::English)
    }

    fn passthrough(thread_id: Option<String>, started: Instant) -> PrepareThreadResponse {
        PrepareThreadResponse {
            action: TurnAction::Passthrough,
            thread_id,
            diagnostics: TurnDiagnostics {
                processing_time_ms: started.elapsed().as_millis() as u64,
                ..Default::default()
            },
            recommendation: None,
        }
    }

    fn reuse(
        &self,
        thread_id: Option<&str>,
        analysis: &ThreadAnalysis,
        settings: &Settings,
        started: Instant,
    ) -> PrepareThreadResponse {
        PrepareThreadResponse {
            action: TurnAction::ReuseThread,
            thread_id: thread_id.map(|s| s.to_string()),
            diagnostics: TurnDiagnostics {
                original_tokens: analysis.total_tokens,
                final_tokens: analysis.total_tokens,
                original_message_count: analysis.message_count,
                live_message_count: analysis.message_count,
                optimization_level: settings.optimization_level,
                processing_time_ms: started.elapsed().as_millis() as u64,
                ..Default::default()
            },
            recommendation: None,
        }
    }
}
