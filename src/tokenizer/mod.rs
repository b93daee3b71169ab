//! Token counting and budget-aware message splitting
//!
//! Uses tiktoken (cl100k_base) when it can be constructed, falling back to a
//! character-ratio estimate otherwise. Counts are cached per distinct content.

use crate::models::Message;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tiktoken_rs::{cl100k_base, CoreBPE};
use tracing::{debug, warn};

/// Tokenizer configuration
#[derive(Debug, Clone)]
pub struct TokenCounterConfig {
    /// Characters per token for the fallback estimator. Tuned slightly below
    /// English-only ratios to account for multi-byte Turkish characters.
    pub chars_per_token: f64,
    /// Content longer than this is keyed by hash instead of verbatim.
    pub hash_key_threshold: usize,
    pub cache_ttl: Duration,
}

impl Default for TokenCounterConfig {
    fn default() -> Self {
        Self {
            chars_per_token: 3.5,
            hash_key_threshold: 1000,
            cache_ttl: Duration::from_secs(600),
        }
    }
}

/// Result of counting a piece of text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenCount {
    pub tokens: usize,
    pub characters: usize,
    pub words: usize,
}

/// Messages split into a live suffix and an old prefix
#[derive(Debug, Clone)]
pub struct SplitMessages {
    pub live_messages: Vec<Message>,
    pub old_messages: Vec<Message>,
}

struct CountEntry {
    count: TokenCount,
    inserted_at: Instant,
}

/// Token counter with a per-content result cache.
///
/// If the precise tokenizer cannot be constructed the failure is logged once
/// and the counter stays on the approximate estimator for the process
/// lifetime; construction is never retried per call.
pub struct TokenCounter {
    bpe: Option<CoreBPE>,
    cache: Mutex<HashMap<String, CountEntry>>,
    config: TokenCounterConfig,
}

impl TokenCounter {
    pub fn new(config: TokenCounterConfig) -> Self {
        let bpe = match cl100k_base() {
            Ok(bpe) => Some(bpe),
            Err(e) => {
                warn!(
                    "Precise tokenizer unavailable, using character estimate: {}",
                    e
                );
                None
            }
        };

        Self {
            bpe,
            cache: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(TokenCounterConfig::default())
    }

    /// Count tokens, characters, and words in `text`.
    pub fn count(&self, text: &str) -> TokenCount {
        if text.is_empty() {
            return TokenCount {
                tokens: 0,
                characters: 0,
                words: 0,
            };
        }

        let key = self.cache_key(text);

        {
            let cache = self.cache.lock().unwrap();
            if let Some(entry) = cache.get(&key) {
                if entry.inserted_at.elapsed() < self.config.cache_ttl {
                    return entry.count;
                }
            }
        }

        let characters = text.chars().count();
        let words = text.split_whitespace().count();
        let tokens = match &self.bpe {
            Some(bpe) => bpe.encode_with_special_tokens(text).len(),
            None => (characters as f64 / self.config.chars_per_token).ceil() as usize,
        };

        let count = TokenCount {
            tokens,
            characters,
            words,
        };

        let mut cache = self.cache.lock().unwrap();
        // Sweep entries whose TTL elapsed whenever a new one is inserted.
        let ttl = self.config.cache_ttl;
        cache.retain(|_, entry| entry.inserted_at.elapsed() < ttl);
        cache.insert(
            key,
            CountEntry {
                count,
                inserted_at: Instant::now(),
            },
        );

        count
    }

    /// Sum of token counts over a message list, counting any message whose
    /// cached count is missing.
    pub fn count_messages(&self, messages: &[Message]) -> usize {
        messages.iter().map(|m| self.message_tokens(m)).sum()
    }

    /// Attach a token count to each message that does not carry one yet.
    pub fn count_each(&self, messages: Vec<Message>) -> Vec<Message> {
        messages
            .into_iter()
            .map(|m| {
                let tokens = self.message_tokens(&m);
                m.with_token_count(tokens)
            })
            .collect()
    }

    /// Split messages into a live suffix and an old prefix by budget.
    ///
    /// Scans from the newest message backward, greedily keeping messages
    /// while the cumulative token count stays within `live_budget`. The
    /// newest message is always kept even when it alone exceeds the budget.
    /// Both halves preserve the original relative order.
    pub fn split_messages_by_budget(
        &self,
        messages: &[Message],
        live_budget: usize,
    ) -> SplitMessages {
        let mut live: Vec<Message> = Vec::new();
        let mut cumulative = 0usize;
        let mut cut = messages.len();

        for (index, message) in messages.iter().enumerate().rev() {
            let tokens = self.message_tokens(message);
            if !live.is_empty() && cumulative + tokens > live_budget {
                break;
            }
            cumulative += tokens;
            live.push(message.clone().with_token_count(tokens));
            cut = index;
        }

        live.reverse();
        let old_messages = messages[..cut]
            .iter()
            .map(|m| m.clone().with_token_count(self.message_tokens(m)))
            .collect();

        debug!(
            live = live.len(),
            old = cut,
            live_tokens = cumulative,
            budget = live_budget,
            "Split messages by budget"
        );

        SplitMessages {
            live_messages: live,
            old_messages,
        }
    }

    /// True when the precise tokenizer is active.
    pub fn is_precise(&self) -> bool {
        self.bpe.is_some()
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.lock().unwrap().len()
    }

    pub fn clear_cache(&self) {
        self.cache.lock().unwrap().clear();
    }

    fn message_tokens(&self, message: &Message) -> usize {
        if message.token_count > 0 {
            message.token_count
        } else {
            self.count(&message.content).tokens
        }
    }

    fn cache_key(&self, text: &str) -> String {
        if text.len() > self.config.hash_key_threshold {
            let mut hasher = Sha256::new();
            hasher.update(text.as_bytes());
            hex::encode(hasher.finalize())
        } else {
            text.to_string()
        }
    }
}
