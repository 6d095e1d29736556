//! Load-balancing strategies over the eligible model set

use crate::catalog::Model;
use crate::health::HealthStatus;
use dashmap::DashMap;
use rand::distributions::{Distribution, WeightedIndex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    RoundRobin,
    Weighted,
    LeastConnections,
    ResponseTime,
    #[default]
    CostOptimized,
}

impl LoadBalancingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalancingStrategy::RoundRobin => "round_robin",
            LoadBalancingStrategy::Weighted => "weighted",
            LoadBalancingStrategy::LeastConnections => "least_connections",
            LoadBalancingStrategy::ResponseTime => "response_time",
            LoadBalancingStrategy::CostOptimized => "cost_optimized",
        }
    }
}

impl fmt::Display for LoadBalancingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadBalancingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "round_robin" => Ok(LoadBalancingStrategy::RoundRobin),
            "weighted" => Ok(LoadBalancingStrategy::Weighted),
            "least_connections" => Ok(LoadBalancingStrategy::LeastConnections),
            "response_time" => Ok(LoadBalancingStrategy::ResponseTime),
            "cost_optimized" => Ok(LoadBalancingStrategy::CostOptimized),
            _ => Err(format!("unknown load balancing strategy: {}", s)),
        }
    }
}

/// Weights of the cost-optimized score terms
///
/// Only the relative order matters to callers; the defaults rank
/// cost > quality > speed > health > latency.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub cost: f64,
    pub quality: f64,
    pub speed: f64,
    pub health: f64,
    pub latency: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            cost: 0.35,
            quality: 0.25,
            speed: 0.20,
            health: 0.12,
            latency: 0.08,
        }
    }
}

impl ScoreWeights {
    /// True when the weights keep the documented factor ordering
    pub fn is_ordered(&self) -> bool {
        self.cost >= self.quality
            && self.quality >= self.speed
            && self.speed >= self.health
            && self.health >= self.latency
            && self.latency >= 0.0
    }
}

/// An eligible model plus the live data selection needs
#[derive(Debug, Clone)]
pub struct Candidate<'a> {
    pub model: &'a Model,
    pub status: HealthStatus,
    pub avg_latency_ms: Option<f64>,
    /// Cost of the reference workload; `None` when unknown
    pub reference_cost: Option<f64>,
}

/// Individual terms of a cost-optimized score, each 0.0 - 1.0
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreBreakdown {
    pub cost: f64,
    pub quality: f64,
    pub speed: f64,
    pub health: f64,
    pub latency: f64,
    pub total: f64,
}

impl fmt::Display for ScoreBreakdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "score {:.3} (cost {:.2}, quality {:.2}, speed {:.2}, health {:.2}, latency {:.2})",
            self.total, self.cost, self.quality, self.speed, self.health, self.latency
        )
    }
}

/// Score one candidate against the cheapest known reference cost in its set
pub fn score(
    candidate: &Candidate<'_>,
    cheapest: Option<f64>,
    weights: &ScoreWeights,
) -> ScoreBreakdown {
    let cost = match (candidate.reference_cost, cheapest) {
        (Some(c), _) if c <= 0.0 => 1.0,
        (Some(c), Some(min)) => (min / c).clamp(0.0, 1.0),
        _ => 0.0,
    };
    let quality = candidate.model.quality as f64 / 10.0;
    let speed = candidate.model.speed as f64 / 10.0;
    let health = candidate.status.score();
    let latency = candidate
        .avg_latency_ms
        .map(|ms| 1.0 / (1.0 + ms / 1000.0))
        .unwrap_or(1.0);

    let total = weights.cost * cost
        + weights.quality * quality
        + weights.speed * speed
        + weights.health * health
        + weights.latency * latency;

    ScoreBreakdown {
        cost,
        quality,
        speed,
        health,
        latency,
        total,
    }
}

/// Chosen candidate and a short description of why
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub index: usize,
    pub reason: String,
}

/// Shared selection state: round-robin cursor and in-flight call counts
#[derive(Debug, Default)]
pub struct Selector {
    cursor: AtomicUsize,
    in_flight: DashMap<String, usize>,
}

impl Selector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_flight(&self, model_id: &str) -> usize {
        self.in_flight.get(model_id).map(|c| *c).unwrap_or(0)
    }

    /// Count a call against `model_id` until the guard is dropped
    pub fn begin_call(&self, model_id: &str) -> InFlightGuard<'_> {
        *self.in_flight.entry(model_id.to_string()).or_insert(0) += 1;
        InFlightGuard {
            counts: &self.in_flight,
            model_id: model_id.to_string(),
        }
    }

    /// Pick one of `candidates`. Returns `None` only for an empty set.
    pub fn select(
        &self,
        strategy: LoadBalancingStrategy,
        candidates: &[Candidate<'_>],
        weights: &ScoreWeights,
        model_weights: &HashMap<String, f64>,
    ) -> Option<Selection> {
        if candidates.is_empty() {
            return None;
        }

        let selection = match strategy {
            LoadBalancingStrategy::RoundRobin => {
                let index = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
                Selection {
                    index,
                    reason: format!("round robin slot {} of {}", index + 1, candidates.len()),
                }
            }
            LoadBalancingStrategy::Weighted => {
                let weights: Vec<f64> = candidates
                    .iter()
                    .map(|c| {
                        model_weights
                            .get(&c.model.id)
                            .copied()
                            .unwrap_or(1.0)
                            .max(0.0)
                    })
                    .collect();
                let index = match WeightedIndex::new(&weights) {
                    Ok(dist) => dist.sample(&mut rand::thread_rng()),
                    // All weights zero: fall back to the first candidate
                    Err(_) => 0,
                };
                Selection {
                    index,
                    reason: format!("weighted draw (weight {})", weights[index]),
                }
            }
            LoadBalancingStrategy::LeastConnections => {
                let (index, count) = candidates
                    .iter()
                    .enumerate()
                    .map(|(i, c)| (i, self.in_flight(&c.model.id)))
                    .min_by_key(|&(i, count)| (count, i))?;
                Selection {
                    index,
                    reason: format!("least connections ({} in flight)", count),
                }
            }
            LoadBalancingStrategy::ResponseTime => {
                // Models without samples sort first so they get measured
                let (index, latency) = candidates
                    .iter()
                    .enumerate()
                    .map(|(i, c)| (i, c.avg_latency_ms))
                    .min_by(|a, b| {
                        let (x, y) = (a.1.unwrap_or(0.0), b.1.unwrap_or(0.0));
                        x.total_cmp(&y).then(a.0.cmp(&b.0))
                    })?;
                let reason = match latency {
                    Some(ms) => format!("fastest average response ({:.0}ms)", ms),
                    None => "no latency samples yet".to_string(),
                };
                Selection { index, reason }
            }
            LoadBalancingStrategy::CostOptimized => {
                let cheapest = cheapest_cost(candidates);
                let (index, breakdown) = candidates
                    .iter()
                    .enumerate()
                    .map(|(i, c)| (i, score(c, cheapest, weights)))
                    .max_by(|a, b| a.1.total.total_cmp(&b.1.total).then(b.0.cmp(&a.0)))?;
                Selection {
                    index,
                    reason: format!("cost optimized {}", breakdown),
                }
            }
        };

        Some(selection)
    }
}

fn cheapest_cost(candidates: &[Candidate<'_>]) -> Option<f64> {
    candidates
        .iter()
        .filter_map(|c| c.reference_cost)
        .filter(|c| *c > 0.0)
        .min_by(|a, b| a.total_cmp(b))
}

/// Decrements the in-flight count for a model when dropped
pub struct InFlightGuard<'a> {
    counts: &'a DashMap<String, usize>,
    model_id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Some(mut count) = self.counts.get_mut(&self.model_id) {
            *count = count.saturating_sub(1);
        }
    }
}
