//! Usage-driven optimization level selection
//!
//! Inspects recent token/cost usage and produces a coarse optimization level
//! with an associated live-token budget and summarization aggressiveness.
//! The recommendation is cached and recomputed only periodically or on
//! demand, and must never block the primary chat path: any failure yields a
//! hardcoded medium fallback.

use crate::cache::{keys, TtlCache, TtlCacheConfig};
use crate::error::Result;
use crate::settings::SettingsStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Coarse optimization tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizationLevel {
    High,
    Medium,
    Low,
    /// Only appears in diagnostics of passthrough turns.
    None,
}

impl OptimizationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptimizationLevel::High => "high",
            OptimizationLevel::Medium => "medium",
            OptimizationLevel::Low => "low",
            OptimizationLevel::None => "none",
        }
    }
}

/// Usage trend over the trailing window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageTrend {
    Increasing,
    Decreasing,
    Stable,
}

/// Per-level budget and aggressiveness preset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelPreset {
    pub live_budget: usize,
    pub summary_ratio: f64,
    pub aggressive_summary: bool,
}

/// Optimizer configuration
#[derive(Debug, Clone)]
pub struct UsageOptimizerConfig {
    /// Average daily tokens above this select the high level.
    pub high_threshold: u64,
    /// Average daily tokens above this select the medium level.
    pub medium_threshold: u64,
    /// Trailing window for daily aggregates, in days.
    pub trailing_days: i64,
    pub recommendation_ttl: Duration,
    pub ring_capacity: usize,
    pub cost_per_1k_tokens: f64,
    pub high: LevelPreset,
    pub medium: LevelPreset,
    pub low: LevelPreset,
}

impl Default for UsageOptimizerConfig {
    fn default() -> Self {
        Self {
            high_threshold: 50_000,
            medium_threshold: 15_000,
            trailing_days: 7,
            recommendation_ttl: Duration::from_secs(3600),
            ring_capacity: 1000,
            cost_per_1k_tokens: 0.002,
            high: LevelPreset {
                live_budget: 3000,
                summary_ratio: 0.7,
                aggressive_summary: true,
            },
            medium: LevelPreset {
                live_budget: 5000,
                summary_ratio: 0.5,
                aggressive_summary: false,
            },
            low: LevelPreset {
                live_budget: 8000,
                summary_ratio: 0.3,
                aggressive_summary: false,
            },
        }
    }
}

/// Projected monthly savings if the recommendation is applied
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectedSavings {
    pub token_reduction: u64,
    pub cost_reduction: f64,
}

/// Recommendation produced per refresh
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationRecommendation {
    pub level: OptimizationLevel,
    pub live_budget: usize,
    pub summary_ratio: f64,
    pub aggressive_summary: bool,
    pub reasoning: String,
    pub projected_savings: ProjectedSavings,
}

#[derive(Debug, Clone)]
struct UsageMetric {
    tokens: u64,
    cost: f64,
    #[allow(dead_code)]
    model: String,
    at: DateTime<Utc>,
}

/// Usage inspector and level selector.
pub struct UsageOptimizer {
    store: Arc<SettingsStore>,
    ring: Arc<Mutex<VecDeque<UsageMetric>>>,
    cache: TtlCache<OptimizationRecommendation>,
    config: UsageOptimizerConfig,
}

impl UsageOptimizer {
    pub fn new(store: Arc<SettingsStore>, config: UsageOptimizerConfig) -> Self {
        Self {
            store,
            ring: Arc::new(Mutex::new(VecDeque::new())),
            cache: TtlCache::new(TtlCacheConfig::default()),
            config,
        }
    }

    /// Produce (or reuse) the current recommendation. Never fails; any error
    /// along the way degrades to the medium fallback.
    pub async fn optimize_usage(&self, force_refresh: bool) -> OptimizationRecommendation {
        if !force_refresh {
            if let Some(cached) = self.cache.get(&keys::recommendation()) {
                return cached;
            }
        }

        let recommendation = match self.compute_recommendation().await {
            Ok(recommendation) => recommendation,
            Err(e) => {
                warn!("Usage optimization failed, using medium fallback: {}", e);
                self.fallback_recommendation()
            }
        };

        self.cache.set_with_ttl(
            &keys::recommendation(),
            recommendation.clone(),
            self.config.recommendation_ttl,
        );
        recommendation
    }

    /// Record one request's usage. The settings-store update runs as a
    /// detached task with its own error boundary; persistence failure is
    /// logged, never surfaced.
    pub fn add_usage_metric(&self, tokens: u64, cost: f64, model: &str) {
        {
            let mut ring = self.ring.lock().unwrap();
            if ring.len() >= self.config.ring_capacity {
                ring.pop_front();
            }
            ring.push_back(UsageMetric {
                tokens,
                cost,
                model: model.to_string(),
                at: Utc::now(),
            });
        }

        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            let result = store
                .save_partial(|settings| {
                    settings.usage.total_tokens_used += tokens;
                    settings.usage.total_cost += cost;
                    settings.usage.request_count += 1;
                })
                .await;
            if let Err(e) = result {
                warn!("Usage metric persistence failed: {}", e);
            }
        });
    }

    /// Estimated cost of a token count under the configured price.
    pub fn estimate_cost(&self, tokens: u64) -> f64 {
        tokens as f64 / 1000.0 * self.config.cost_per_1k_tokens
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Spawn the periodic sweep of the recommendation cache.
    pub fn spawn_cache_sweeper(&self) -> tokio::task::JoinHandle<()> {
        self.cache.spawn_sweeper()
    }

    async fn compute_recommendation(&self) -> Result<OptimizationRecommendation> {
        let daily = self.daily_totals();
        let window_days = self.config.trailing_days.max(1) as u64;
        let total: u64 = daily.iter().sum();
        let average_daily = total / window_days;

        let trend = trend_of(&daily);
        let level = if average_daily > self.config.high_threshold {
            OptimizationLevel::High
        } else if average_daily > self.config.medium_threshold {
            OptimizationLevel::Medium
        } else {
            OptimizationLevel::Low
        };
        let preset = self.preset_for(level);

        let mut reasoning = format!(
            "Average daily usage of {} tokens over the last {} days selects the {} level.",
            average_daily, window_days, level.as_str()
        );
        if trend == UsageTrend::Increasing {
            reasoning.push_str(
                " Usage is trending upward; applying the recommendation early is strongly advised.",
            );
        }

        let monthly_tokens = average_daily * 30;
        let token_reduction = (monthly_tokens as f64 * preset.summary_ratio) as u64;
        let projected_savings = ProjectedSavings {
            token_reduction,
            cost_reduction: self.estimate_cost(token_reduction),
        };

        self.store
            .save_partial(|settings| settings.optimization_level = level)
            .await?;

        debug!(level = level.as_str(), average_daily, "Computed recommendation");

        Ok(OptimizationRecommendation {
            level,
            live_budget: preset.live_budget,
            summary_ratio: preset.summary_ratio,
            aggressive_summary: preset.aggressive_summary,
            reasoning,
            projected_savings,
        })
    }

    /// Token totals bucketed by day over the trailing window, oldest first.
    fn daily_totals(&self) -> Vec<u64> {
        let days = self.config.trailing_days.max(1) as usize;
        let mut buckets = vec![0u64; days];
        let today = Utc::now().date_naive();

        let ring = self.ring.lock().unwrap();
        for metric in ring.iter() {
            let age = (today - metric.at.date_naive()).num_days();
            if age >= 0 && (age as usize) < days {
                buckets[days - 1 - age as usize] += metric.tokens;
            }
        }

        buckets
    }

    fn preset_for(&self, level: OptimizationLevel) -> LevelPreset {
        match level {
            OptimizationLevel::High => self.config.high.clone(),
            OptimizationLevel::Low => self.config.low.clone(),
            _ => self.config.medium.clone(),
        }
    }

    fn fallback_recommendation(&self) -> OptimizationRecommendation {
        let preset = self.config.medium.clone();
        OptimizationRecommendation {
            level: OptimizationLevel::Medium,
            live_budget: preset.live_budget,
            summary_ratio: preset.summary_ratio,
            aggressive_summary: preset.aggressive_summary,
            reasoning: "Usage data unavailable; applying the medium level as a safe default."
                .to_string(),
            projected_savings: ProjectedSavings {
                token_reduction: 0,
                cost_reduction: 0.0,
            },
        }
    }
}

/// Compare the mean of the first half of the window to the mean of the
/// second half; under 10% relative change counts as stable.
fn trend_of(daily: &[u64]) -> UsageTrend {
    if daily.len() < 2 {
        return UsageTrend::Stable;
    }

    let mid = daily.len() / 2;
    let first: f64 = daily[..mid].iter().sum::<u64>() as f64 / mid as f64;
    let second: f64 =
        daily[mid..].iter().sum::<u64>() as f64 / (daily.len() - mid) as f64;

    if first == 0.0 {
        return if second > 0.0 {
            UsageTrend::Increasing
        } else {
            UsageTrend::Stable
        };
    }

    let change = (second - first) / first;
    if change.abs() < 0.10 {
        UsageTrend::Stable
    } else if change > 0.0 {
        UsageTrend::Increasing
    } else {
        UsageTrend::Decreasing
    }
}
