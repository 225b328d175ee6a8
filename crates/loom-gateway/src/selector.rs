use std::cmp::Ordering;
use std::collections::HashMap;

use loom_core::{HealthRecord, Policy, Priority, Request};

/// A provider as seen by the selector: enough to score it without touching
/// the registry locks directly (§4.2, "a snapshot of health and weights").
#[derive(Debug, Clone)]
pub struct Candidate {
    pub provider_id: String,
    pub health: HealthRecord,
    pub weight: f64,
    pub estimated_cost: f64,
}

/// Static mapping from a `session_class` to its preferred provider/model and
/// an ordered fallback list, loaded from `provider_selection.session_type_mapping`.
#[derive(Debug, Clone, Default)]
pub struct SessionMapping {
    pub preferred_provider: String,
    pub fallback_to: Vec<String>,
}

/// Pure scoring function over a snapshot of candidates; holds no mutable
/// state of its own beyond the session mapping table (§4.2).
pub struct Selector {
    session_mappings: HashMap<String, SessionMapping>,
}

impl Selector {
    pub fn new(session_mappings: HashMap<String, SessionMapping>) -> Self {
        Self { session_mappings }
    }

    /// Narrow `candidates` to those implied by `policy`, then apply the
    /// strategy for `policy.priority`. Returns `None` on an empty candidate
    /// set (the Gateway turns that into `NoHealthyProvider`).
    pub fn choose(&self, request: &Request, candidates: &[Candidate]) -> Option<String> {
        let policy = &request.policy;
        let filtered = self.apply_policy_filter(policy, candidates);
        if filtered.is_empty() {
            return None;
        }
        self.choose_by_strategy(policy.priority, &filtered)
    }

    /// `preferred_provider` always wins over `session_class` when both are
    /// present; `session_class`'s mapping is only consulted when
    /// `preferred_provider` is absent (DESIGN.md, Open Question).
    fn apply_policy_filter<'a>(&self, policy: &Policy, candidates: &'a [Candidate]) -> Vec<&'a Candidate> {
        if let Some(preferred) = &policy.preferred_provider {
            let preferred_match: Vec<&Candidate> =
                candidates.iter().filter(|c| &c.provider_id == preferred).collect();
            if !preferred_match.is_empty() {
                return preferred_match;
            }
            return candidates.iter().collect();
        }

        if let Some(session_class) = &policy.session_class {
            if let Some(mapping) = self.session_mappings.get(session_class) {
                let mut ordered_ids = vec![mapping.preferred_provider.clone()];
                ordered_ids.extend(mapping.fallback_to.clone());
                let narrowed: Vec<&Candidate> = ordered_ids
                    .iter()
                    .filter_map(|id| candidates.iter().find(|c| &c.provider_id == id))
                    .collect();
                if !narrowed.is_empty() {
                    return narrowed;
                }
            }
        }

        candidates.iter().collect()
    }

    fn choose_by_strategy(&self, priority: Priority, candidates: &[&Candidate]) -> Option<String> {
        match priority {
            Priority::Cost => Self::pick_min_cost(candidates),
            Priority::Speed => Self::pick_min_latency(candidates),
            Priority::Quality => Self::pick_max_quality(candidates),
            Priority::Balanced => Self::pick_weighted_random(candidates),
        }
    }

    fn pick_min_cost(candidates: &[&Candidate]) -> Option<String> {
        candidates
            .iter()
            .min_by(|a, b| {
                a.estimated_cost
                    .partial_cmp(&b.estimated_cost)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| {
                        b.health
                            .rolling_success_rate
                            .partial_cmp(&a.health.rolling_success_rate)
                            .unwrap_or(Ordering::Equal)
                    })
                    .then_with(|| a.provider_id.cmp(&b.provider_id))
            })
            .map(|c| c.provider_id.clone())
    }

    fn pick_min_latency(candidates: &[&Candidate]) -> Option<String> {
        candidates
            .iter()
            .min_by(|a, b| {
                a.health
                    .avg_latency_ms
                    .partial_cmp(&b.health.avg_latency_ms)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| {
                        b.health
                            .rolling_success_rate
                            .partial_cmp(&a.health.rolling_success_rate)
                            .unwrap_or(Ordering::Equal)
                    })
                    .then_with(|| a.provider_id.cmp(&b.provider_id))
            })
            .map(|c| c.provider_id.clone())
    }

    fn pick_max_quality(candidates: &[&Candidate]) -> Option<String> {
        candidates
            .iter()
            .max_by(|a, b| {
                a.health
                    .rolling_success_rate
                    .partial_cmp(&b.health.rolling_success_rate)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| {
                        b.health
                            .avg_latency_ms
                            .partial_cmp(&a.health.avg_latency_ms)
                            .unwrap_or(Ordering::Equal)
                    })
                    .then_with(|| b.provider_id.cmp(&a.provider_id))
            })
            .map(|c| c.provider_id.clone())
    }

    /// Weighted random with score = `weight × success_rate × 1/max(avg_latency, 0.1)`.
    /// Weights are clamped to `[0.1, 10]`; a weight of exactly 0 is treated
    /// as 0.1 to keep selection non-degenerate.
    fn pick_weighted_random(candidates: &[&Candidate]) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        let scored: Vec<(f64, &Candidate)> = candidates
            .iter()
            .map(|c| {
                let weight = if c.weight <= 0.0 { 0.1 } else { c.weight.clamp(0.1, 10.0) };
                let latency_divisor = c.health.avg_latency_ms.max(0.1);
                let score = weight * c.health.rolling_success_rate.max(0.0001) / latency_divisor;
                (score, *c)
            })
            .collect();

        let total: f64 = scored.iter().map(|(s, _)| s).sum();
        if total <= 0.0 {
            return candidates.first().map(|c| c.provider_id.clone());
        }

        let mut roll = rand::random::<f64>() * total;
        for (score, candidate) in &scored {
            if roll <= *score {
                return Some(candidate.provider_id.clone());
            }
            roll -= score;
        }
        scored.last().map(|(_, c)| c.provider_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_core::HealthRecord;

    fn candidate(id: &str, success_rate: f64, latency_ms: f64, cost: f64) -> Candidate {
        Candidate {
            provider_id: id.to_string(),
            health: HealthRecord {
                rolling_success_rate: success_rate,
                avg_latency_ms: latency_ms,
                ..HealthRecord::default()
            },
            weight: 1.0,
            estimated_cost: cost,
        }
    }

    #[test]
    fn empty_candidates_returns_none() {
        let selector = Selector::new(HashMap::new());
        let request = Request::new("hi");
        assert_eq!(selector.choose(&request, &[]), None);
    }

    #[test]
    fn cost_strategy_picks_cheapest() {
        let selector = Selector::new(HashMap::new());
        let mut request = Request::new("hi");
        request.policy.priority = Priority::Cost;
        let candidates = vec![candidate("a", 1.0, 100.0, 0.05), candidate("b", 1.0, 100.0, 0.01)];
        assert_eq!(selector.choose(&request, &candidates), Some("b".to_string()));
    }

    #[test]
    fn speed_strategy_picks_lowest_latency() {
        let selector = Selector::new(HashMap::new());
        let mut request = Request::new("hi");
        request.policy.priority = Priority::Speed;
        let candidates = vec![candidate("a", 1.0, 300.0, 0.01), candidate("b", 1.0, 50.0, 0.01)];
        assert_eq!(selector.choose(&request, &candidates), Some("b".to_string()));
    }

    #[test]
    fn quality_strategy_picks_highest_success_rate() {
        let selector = Selector::new(HashMap::new());
        let mut request = Request::new("hi");
        request.policy.priority = Priority::Quality;
        let candidates = vec![candidate("a", 0.8, 100.0, 0.01), candidate("b", 0.99, 100.0, 0.01)];
        assert_eq!(selector.choose(&request, &candidates), Some("b".to_string()));
    }

    #[test]
    fn preferred_provider_wins_over_session_class() {
        let mut mappings = HashMap::new();
        mappings.insert(
            "reasoning_tasks".to_string(),
            SessionMapping {
                preferred_provider: "a".to_string(),
                fallback_to: vec![],
            },
        );
        let selector = Selector::new(mappings);
        let mut request = Request::new("hi");
        request.policy.session_class = Some("reasoning_tasks".to_string());
        request.policy.preferred_provider = Some("b".to_string());
        request.policy.priority = Priority::Cost;
        let candidates = vec![candidate("a", 1.0, 100.0, 0.01), candidate("b", 1.0, 100.0, 0.05)];
        assert_eq!(selector.choose(&request, &candidates), Some("b".to_string()));
    }

    #[test]
    fn session_class_narrows_candidates_when_no_preferred_provider() {
        let mut mappings = HashMap::new();
        mappings.insert(
            "chinese_content".to_string(),
            SessionMapping {
                preferred_provider: "a".to_string(),
                fallback_to: vec!["b".to_string()],
            },
        );
        let selector = Selector::new(mappings);
        let mut request = Request::new("hi");
        request.policy.session_class = Some("chinese_content".to_string());
        request.policy.priority = Priority::Cost;
        let candidates = vec![candidate("a", 1.0, 100.0, 0.05), candidate("c", 1.0, 100.0, 0.001)];
        assert_eq!(selector.choose(&request, &candidates), Some("a".to_string()));
    }

    #[test]
    fn zero_weight_is_treated_as_point_one() {
        let selector = Selector::new(HashMap::new());
        let candidates = vec![Candidate {
            provider_id: "a".to_string(),
            health: HealthRecord {
                rolling_success_rate: 1.0,
                avg_latency_ms: 10.0,
                ..HealthRecord::default()
            },
            weight: 0.0,
            estimated_cost: 0.0,
        }];
        let refs: Vec<&Candidate> = candidates.iter().collect();
        assert_eq!(Selector::pick_weighted_random(&refs), Some("a".to_string()));
    }
}
