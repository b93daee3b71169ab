//! PII-safe chunked summarization of old conversation history
//!
//! Converts the "old" slice of a thread into a compact Q&A-style summary.
//! Input too large for one completion call is chunked, summarized per chunk,
//! and consolidated with one further call. Results are cached so identical
//! re-summarization requests are idempotent and cheap.

use crate::breaker::CircuitBreaker;
use crate::cache::{keys, TtlCache, TtlCacheConfig};
use crate::error::Result;
use crate::llm::{ChatCompletionParams, LlmBackend};
use crate::metrics::METRICS;
use crate::models::Message;
use crate::privacy::PiiScrubber;
use crate::tokenizer::TokenCounter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Summary language
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Turkish,
    English,
}

impl Language {
    pub fn as_tag(&self) -> &'static str {
        match self {
            Language::Turkish => "tr",
            Language::English => "en",
        }
    }
}

const TURKISH_CHARS: &str = "çğıöşüÇĞİÖŞÜ";
const TURKISH_WORDS: &[&str] = &[
    "ve", "bir", "bu", "için", "nasıl", "merhaba", "değil", "evet", "hayır", "teşekkür", "lütfen",
    "ile",
];
const ENGLISH_WORDS: &[&str] = &[
    "the", "and", "is", "what", "how", "hello", "please", "you", "thanks", "with",
];

/// Heuristic language detection over the newest user text.
///
/// Turkish-specific diacritics and stopwords are weighted double so that a
/// short Turkish sentence containing borrowed English words still detects as
/// Turkish.
pub fn detect_language(text: &str) -> Language {
    let diacritics = text.chars().filter(|c| TURKISH_CHARS.contains(*c)).count();

    let lower = text.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric() && !TURKISH_CHARS.contains(c))
        .filter(|w| !w.is_empty())
        .collect();

    let turkish_hits = words.iter().filter(|w| TURKISH_WORDS.contains(w)).count();
    let english_hits = words.iter().filter(|w| ENGLISH_WORDS.contains(w)).count();

    let turkish_score = diacritics * 2 + turkish_hits * 2;
    if turkish_score > 0 && turkish_score >= english_hits {
        Language::Turkish
    } else {
        Language::English
    }
}

/// Summarizer configuration
#[derive(Debug, Clone)]
pub struct SummarizerConfig {
    pub model: String,
    pub temperature: f32,
    /// Chunk budget when the request carries no target token count.
    pub max_chunk_tokens: usize,
    /// Output bound per completion call.
    pub max_summary_tokens: usize,
    pub cache_ttl: Duration,
    /// Output bound for the ad hoc quick path.
    pub quick_max_tokens: usize,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            temperature: 0.3,
            max_chunk_tokens: 2000,
            max_summary_tokens: 500,
            cache_ttl: Duration::from_secs(30 * 60),
            quick_max_tokens: 150,
        }
    }
}

/// Summarization request
#[derive(Debug, Clone)]
pub struct SummaryRequest {
    pub messages: Vec<Message>,
    pub target_tokens: Option<usize>,
    pub language: Language,
}

/// Summarization result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryResult {
    pub summary: String,
    pub original_tokens: usize,
    pub summary_tokens: usize,
    /// `summary_tokens / original_tokens`, 0 when the input was empty.
    pub compression_ratio: f64,
    pub pii_removed: usize,
    pub processing_time_ms: u64,
}

impl SummaryResult {
    fn empty() -> Self {
        Self {
            summary: String::new(),
            original_tokens: 0,
            summary_tokens: 0,
            compression_ratio: 0.0,
            pii_removed: 0,
            processing_time_ms: 0,
        }
    }
}

/// Chunked, cached, PII-scrubbing message summarizer.
pub struct MessageSummarizer {
    backend: Arc<dyn LlmBackend>,
    breaker: Arc<CircuitBreaker>,
    counter: Arc<TokenCounter>,
    scrubber: Arc<PiiScrubber>,
    cache: TtlCache<SummaryResult>,
    config: SummarizerConfig,
}

impl MessageSummarizer {
    pub fn new(
        backend: Arc<dyn LlmBackend>,
        breaker: Arc<CircuitBreaker>,
        counter: Arc<TokenCounter>,
        scrubber: Arc<PiiScrubber>,
        config: SummarizerConfig,
    ) -> Self {
        Self {
            backend,
            breaker,
            counter,
            scrubber,
            cache: TtlCache::new(TtlCacheConfig::default()),
            config,
        }
    }

    /// Summarize a list of old messages into one compact summary.
    pub async fn summarize_messages(&self, request: &SummaryRequest) -> Result<SummaryResult> {
        let started = Instant::now();

        let cache_key = keys::summary(&self.request_hash(request));
        if let Some(cached) = self.cache.get(&cache_key) {
            debug!("Summary cache hit");
            return Ok(cached);
        }

        // Mask PII before anything leaves the process; drop messages that
        // are empty after cleaning.
        let (cleaned, pii_report) = self.scrubber.scrub_messages(&request.messages);
        let cleaned: Vec<Message> = cleaned
            .into_iter()
            .filter(|m| !m.content.trim().is_empty())
            .collect();

        if cleaned.is_empty() {
            return Ok(SummaryResult::empty());
        }

        let cleaned = self.counter.count_each(cleaned);
        let original_tokens: usize = cleaned.iter().map(|m| m.token_count).sum();

        let chunk_budget = request.target_tokens.unwrap_or(self.config.max_chunk_tokens);
        let chunks = chunk_by_budget(&cleaned, chunk_budget);
        debug!(
            chunks = chunks.len(),
            original_tokens, "Summarizing old messages"
        );

        let mut chunk_summaries = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            let summary = self
                .summarize_chunk(chunk, request.language)
                .await
                .map_err(|e| {
                    METRICS.record_summarization(false);
                    e
                })?;
            chunk_summaries.push(summary);
        }

        let summary = if chunk_summaries.len() == 1 {
            chunk_summaries.remove(0)
        } else {
            self.consolidate(&chunk_summaries, request.language)
                .await
                .map_err(|e| {
                    METRICS.record_summarization(false);
                    e
                })?
        };

        let summary_tokens = self.counter.count(&summary).tokens;
        let compression_ratio = if original_tokens == 0 {
            0.0
        } else {
            summary_tokens as f64 / original_tokens as f64
        };

        let result = SummaryResult {
            summary,
            original_tokens,
            summary_tokens,
            compression_ratio,
            pii_removed: pii_report.total_removed,
            processing_time_ms: started.elapsed().as_millis() as u64,
        };

        self.cache
            .set_with_ttl(&cache_key, result.clone(), self.config.cache_ttl);
        METRICS.record_summarization(true);
        Ok(result)
    }

    /// Best-effort short summary outside the main pipeline. Never fails; a
    /// backend problem yields a fixed placeholder instead.
    pub async fn quick_summary(&self, text: &str, language: Language) -> String {
        if text.trim().is_empty() {
            return String::new();
        }

        let cleaned = self.scrubber.scrub(text).cleaned_text;
        let params = ChatCompletionParams {
            model: self.config.model.clone(),
            system_prompt: quick_prompt(language).to_string(),
            user_prompt: cleaned,
            temperature: self.config.temperature,
            max_output_tokens: self.config.quick_max_tokens,
        };

        let backend = Arc::clone(&self.backend);
        let outcome = self
            .breaker
            .execute(move || async move { backend.create_chat_completion(&params).await })
            .await;

        match outcome {
            Ok(summary) => summary,
            Err(e) => {
                warn!("Quick summary failed: {}", e);
                match language {
                    Language::Turkish => "Özet oluşturulamadı.".to_string(),
                    Language::English => "Summary could not be generated.".to_string(),
                }
            }
        }
    }

    pub fn cache_stats(&self) -> crate::cache::CacheStats {
        self.cache.stats()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Spawn the periodic sweep of the summary result cache.
    pub fn spawn_cache_sweeper(&self) -> tokio::task::JoinHandle<()> {
        self.cache.spawn_sweeper()
    }

    async fn summarize_chunk(&self, chunk: &[Message], language: Language) -> Result<String> {
        let transcript = chunk
            .iter()
            .map(|m| format!("{}: {}", m.role.as_str(), m.content))
            .collect::<Vec<_>>()
            .join("\n");

        self.complete(system_prompt(language), transcript).await
    }

    async fn consolidate(&self, summaries: &[String], language: Language) -> Result<String> {
        let combined = summaries.join("\n\n---\n\n");
        self.complete(consolidation_prompt(language), combined).await
    }

    async fn complete(&self, system_prompt: &str, user_prompt: String) -> Result<String> {
        let params = ChatCompletionParams {
            model: self.config.model.clone(),
            system_prompt: system_prompt.to_string(),
            user_prompt,
            temperature: self.config.temperature,
            max_output_tokens: self.config.max_summary_tokens,
        };

        let backend = Arc::clone(&self.backend);
        self.breaker
            .execute(move || async move { backend.create_chat_completion(&params).await })
            .await
    }

    fn request_hash(&self, request: &SummaryRequest) -> String {
        let mut hasher = Sha256::new();
        for message in &request.messages {
            hasher.update(message.role.as_str().as_bytes());
            hasher.update(b"\x1f");
            hasher.update(message.content.as_bytes());
            hasher.update(b"\x1e");
        }
        hasher.update(request.target_tokens.unwrap_or(0).to_le_bytes());
        hasher.update(request.language.as_tag().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Group messages into contiguous chunks whose token sums stay within
/// `chunk_budget`. A single over-budget message becomes its own chunk rather
/// than being split mid-message or dropped.
fn chunk_by_budget(messages: &[Message], chunk_budget: usize) -> Vec<Vec<Message>> {
    let mut chunks: Vec<Vec<Message>> = Vec::new();
    let mut current: Vec<Message> = Vec::new();
    let mut current_tokens = 0usize;

    for message in messages {
        if !current.is_empty() && current_tokens + message.token_count > chunk_budget {
            chunks.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current_tokens += message.token_count;
        current.push(message.clone());
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}

fn system_prompt(language: Language) -> &'static str {
    match language {
        Language::Turkish => {
            "Aşağıdaki konuşma geçmişini Soru-Cevap formatında özetle. \
             Her önemli konu için kullanıcının sorusunu ve verilen cevabın özünü \
             tek satırda yaz. Kararları, kısıtları ve açık kalan konuları koru. \
             Yeni bilgi ekleme."
        }
        Language::English => {
            "Summarize the following conversation history in a question-and-answer \
             format. For each significant topic write the user's question and the \
             essence of the answer on one line. Preserve decisions, constraints, \
             and open items. Do not invent new information."
        }
    }
}

fn consolidation_prompt(language: Language) -> &'static str {
    match language {
        Language::Turkish => {
            "Aşağıdaki kısmi özetleri tek bir tutarlı Soru-Cevap özetinde birleştir. \
             Tekrarlanan maddeleri çıkar, kronolojik sırayı koru."
        }
        Language::English => {
            "Merge the following partial summaries into a single coherent \
             question-and-answer summary. Remove duplicated items and keep \
             chronological order."
        }
    }
}

fn quick_prompt(language: Language) -> &'static str {
    match language {
        Language::Turkish => "Aşağıdaki metni iki üç cümleyle özetle.",
        Language::English => "Summarize the following text in two or three sentences.",
    }
}
