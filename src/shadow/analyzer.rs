//! Shadow performance analyzer.
//!
//! Each pass rebuilds the full snapshot table from resolved outcomes (per
//! variation, per strategy plus `OVERALL`, per configured window) and then
//! looks for challengers that beat the champion on a parameter they change.
//!
//! Comparisons use the size-weighted return of each outcome so that
//! position-size variations are distinguishable from the champion, and only
//! outcomes whose decision used the parameters that variation resolves to
//! under the current champion. Evidence gathered before a promotion
//! therefore never supports a value that was not simulated. Snapshots still
//! describe every resolved outcome in the window. A
//! challenger qualifies for a parameter when, in at least one window, it has
//! the minimum sample, a positive delta and a bootstrap p-value under the
//! threshold, and no other window with enough data on both sides shows it
//! behind. Of the qualifying challengers for a parameter, the one with the
//! lowest p-value wins; ties go to the larger sample, then the larger delta.

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::registry::{VariationId, VariationRegistry};
use super::stats::{self, Bootstrap};
use crate::params::{ChampionConfig, ChampionHandle};
use crate::storage::ShadowStore;
use crate::types::{PerformanceSnapshot, Recommendation, ResolvedShadow, SupportingStats, OVERALL};

/// Analyzer settings.
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    pub windows_hours: Vec<u32>,
    /// Resolved outcomes a challenger needs before it is compared.
    pub min_samples: usize,
    /// One-sided p-value threshold.
    pub p_threshold: f64,
    /// Per-side sample needed for a window to count in the durability check.
    pub durability_min_samples: usize,
    pub bootstrap: Bootstrap,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            windows_hours: vec![24, 168],
            min_samples: 30,
            p_threshold: 0.10,
            durability_min_samples: 10,
            bootstrap: Bootstrap::default(),
        }
    }
}

/// Result of one analyzer pass.
#[derive(Debug, Clone, Default)]
pub struct AnalysisReport {
    pub snapshots: usize,
    pub recommendations: Vec<Recommendation>,
    /// Parameters skipped because a recommendation is already pending.
    pub skipped_pending: usize,
}

/// Per-window sample for one (variation, strategy).
#[derive(Debug, Clone, Default)]
struct Sample {
    pnl: Vec<f64>,
    weighted: Vec<f64>,
}

type Key = (VariationId, String);

/// A challenger that cleared the gates for one parameter.
#[derive(Debug, Clone)]
struct Candidate {
    variation: VariationId,
    value: f64,
    stats: SupportingStats,
}

impl Candidate {
    /// Lower p first, then larger sample, then larger delta.
    fn beats(&self, other: &Candidate) -> bool {
        let (a, b) = (&self.stats, &other.stats);
        if (a.p_value - b.p_value).abs() > 1e-12 {
            return a.p_value < b.p_value;
        }
        if a.challenger_samples != b.challenger_samples {
            return a.challenger_samples > b.challenger_samples;
        }
        a.delta > b.delta
    }
}

pub struct ShadowAnalyzer {
    store: Arc<dyn ShadowStore>,
    registry: Arc<VariationRegistry>,
    champion: Arc<ChampionHandle>,
    config: AnalyzerConfig,
}

impl ShadowAnalyzer {
    pub fn new(
        store: Arc<dyn ShadowStore>,
        registry: Arc<VariationRegistry>,
        champion: Arc<ChampionHandle>,
        config: AnalyzerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            champion,
            config,
        }
    }

    /// Recompute snapshots and emit (and persist) recommendations as of `now`.
    pub async fn generate_recommendations(&self, now: DateTime<Utc>) -> anyhow::Result<AnalysisReport> {
        let longest = self.config.windows_hours.iter().copied().max().unwrap_or(0);
        let resolved = self
            .store
            .resolved_since(now - Duration::hours(i64::from(longest)))
            .await?;

        let champion = self.champion.snapshot().await;

        let all: Vec<&ResolvedShadow> = resolved.iter().collect();
        let snapshots = self.snapshots(&self.bucket(&all, now), now);
        self.store.replace_snapshots(&snapshots).await?;

        let current: Vec<&ResolvedShadow> = resolved
            .iter()
            .filter(|r| self.under_current_params(r, &champion))
            .collect();
        if current.len() < resolved.len() {
            debug!(
                excluded = resolved.len() - current.len(),
                "Outcomes from earlier parameter sets left out of comparisons"
            );
        }
        let samples = self.bucket(&current, now);

        let pending: HashSet<(String, String)> = self
            .store
            .pending_recommendations()
            .await?
            .into_iter()
            .map(|r| (r.strategy, r.parameter))
            .collect();

        let mut report = AnalysisReport {
            snapshots: snapshots.len(),
            ..Default::default()
        };

        for (strategy, base) in &champion.strategies {
            // parameter -> best candidate so far
            let mut best: BTreeMap<String, Candidate> = BTreeMap::new();

            for variation in self.registry.variations() {
                if variation.id.is_champion() {
                    continue;
                }
                let resolved_params = self.registry.resolve(variation.id, base);
                let changed = resolved_params.differing(base);
                if changed.is_empty() {
                    continue;
                }
                let Some(stats) = self.qualify(&samples, variation.id, strategy) else {
                    continue;
                };

                for parameter in changed {
                    let Some(value) = resolved_params.get(&parameter) else {
                        continue;
                    };
                    let candidate = Candidate {
                        variation: variation.id,
                        value,
                        stats: stats.clone(),
                    };
                    match best.get(&parameter) {
                        Some(current) if !candidate.beats(current) => {}
                        _ => {
                            best.insert(parameter, candidate);
                        }
                    }
                }
            }

            for (parameter, candidate) in best {
                if pending.contains(&(strategy.clone(), parameter.clone())) {
                    debug!(%strategy, %parameter, "Recommendation already pending; not re-issuing");
                    report.skipped_pending += 1;
                    continue;
                }
                let Some(current_value) = base.get(&parameter) else {
                    continue;
                };
                report.recommendations.push(Recommendation {
                    id: Uuid::new_v4(),
                    strategy: strategy.clone(),
                    parameter,
                    current_value,
                    recommended_value: candidate.value,
                    variation: candidate.variation,
                    stats: candidate.stats,
                    generated_at: now,
                });
            }
        }

        if !report.recommendations.is_empty() {
            self.store.insert_recommendations(&report.recommendations).await?;
        }
        for rec in &report.recommendations {
            info!(recommendation = %rec, "Recommendation generated");
        }
        info!(
            snapshots = report.snapshots,
            recommendations = report.recommendations.len(),
            "Analyzer pass complete"
        );
        Ok(report)
    }

    /// Window → (variation, strategy) → sample. Every outcome also lands in
    /// its variation's `OVERALL` bucket.
    fn bucket(&self, resolved: &[&ResolvedShadow], now: DateTime<Utc>) -> BTreeMap<u32, BTreeMap<Key, Sample>> {
        let mut out: BTreeMap<u32, BTreeMap<Key, Sample>> = BTreeMap::new();
        for &window in &self.config.windows_hours {
            let since = now - Duration::hours(i64::from(window));
            let buckets = out.entry(window).or_default();
            for r in resolved.iter().filter(|r| r.decided_at >= since) {
                for strategy in [r.strategy.as_str(), OVERALL] {
                    let sample = buckets.entry((r.variation, strategy.to_string())).or_default();
                    sample.pnl.push(r.outcome.pnl_pct);
                    sample.weighted.push(r.weighted_return());
                }
            }
        }
        out
    }

    /// True when `r` was decided with exactly the parameters its variation
    /// resolves to today.
    fn under_current_params(&self, r: &ResolvedShadow, champion: &ChampionConfig) -> bool {
        let Some(base) = champion.params(&r.strategy) else {
            return false;
        };
        let expected = self.registry.resolve(r.variation, base);
        expected.differing(&r.params).is_empty() && r.params.differing(&expected).is_empty()
    }

    fn snapshots(&self, samples: &BTreeMap<u32, BTreeMap<Key, Sample>>, now: DateTime<Utc>) -> Vec<PerformanceSnapshot> {
        let mut out = Vec::new();
        for (&window, buckets) in samples {
            for ((variation, strategy), sample) in buckets {
                let champion = buckets.get(&(VariationId::Champion, strategy.clone()));
                let (delta, p_value) = match champion {
                    Some(base) if !variation.is_champion() && !base.weighted.is_empty() => (
                        Some(stats::mean(&sample.weighted) - stats::mean(&base.weighted)),
                        self.config.bootstrap.p_value(&sample.weighted, &base.weighted),
                    ),
                    _ => (None, None),
                };
                out.push(PerformanceSnapshot {
                    variation: *variation,
                    strategy: strategy.clone(),
                    window_hours: window,
                    trade_count: sample.pnl.len(),
                    win_rate: stats::win_rate(&sample.pnl),
                    avg_pnl_pct: stats::mean(&sample.pnl),
                    median_pnl_pct: stats::median(&sample.pnl),
                    avg_weighted_return: stats::mean(&sample.weighted),
                    delta_vs_champion: delta,
                    p_value,
                    computed_at: now,
                });
            }
        }
        out
    }

    /// Best qualifying window for `variation` on `strategy`, if any, after
    /// the durability check across the other windows.
    fn qualify(
        &self,
        samples: &BTreeMap<u32, BTreeMap<Key, Sample>>,
        variation: VariationId,
        strategy: &str,
    ) -> Option<SupportingStats> {
        let pair = |window: u32| {
            let buckets = samples.get(&window)?;
            let challenger = buckets.get(&(variation, strategy.to_string()))?;
            let champion = buckets.get(&(VariationId::Champion, strategy.to_string()))?;
            Some((challenger, champion))
        };

        let mut chosen: Option<SupportingStats> = None;
        for &window in &self.config.windows_hours {
            let Some((challenger, champion)) = pair(window) else {
                continue;
            };
            if challenger.weighted.len() < self.config.min_samples {
                debug!(%variation, strategy, window, n = challenger.weighted.len(), "Below minimum sample");
                continue;
            }
            let delta = stats::mean(&challenger.weighted) - stats::mean(&champion.weighted);
            if delta <= 0.0 {
                continue;
            }
            let Some(p_value) = self.config.bootstrap.p_value(&challenger.weighted, &champion.weighted) else {
                continue;
            };
            if p_value >= self.config.p_threshold {
                debug!(%variation, strategy, window, p_value, "Not significant");
                continue;
            }

            let candidate = SupportingStats {
                window_hours: window,
                challenger_samples: challenger.weighted.len(),
                champion_samples: champion.weighted.len(),
                challenger_win_rate: stats::win_rate(&challenger.pnl),
                champion_win_rate: stats::win_rate(&champion.pnl),
                challenger_mean: stats::mean(&challenger.weighted),
                champion_mean: stats::mean(&champion.weighted),
                delta,
                p_value,
            };
            let better = match &chosen {
                Some(c) => candidate.p_value < c.p_value,
                None => true,
            };
            if better {
                chosen = Some(candidate);
            }
        }

        let chosen = chosen?;
        let durable = self.config.windows_hours.iter().all(|&window| {
            if window == chosen.window_hours {
                return true;
            }
            match pair(window) {
                Some((c, b))
                    if c.weighted.len() >= self.config.durability_min_samples
                        && b.weighted.len() >= self.config.durability_min_samples =>
                {
                    stats::mean(&c.weighted) >= stats::mean(&b.weighted)
                }
                _ => true,
            }
        });
        if !durable {
            debug!(%variation, strategy, "Significant in one window but behind in another");
            return None;
        }
        Some(chosen)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
