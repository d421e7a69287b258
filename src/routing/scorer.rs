//! Server selection scoring.
//!
//! Ranks eligible servers with a weighted sum of five components, each in
//! `[0.0, 1.0]`:
//!
//! | Component        | Default weight | Value                                              |
//! |------------------|----------------|----------------------------------------------------|
//! | capability match | 0.35           | matched / (required + preferred)                   |
//! | load             | 0.25           | `1 − current_load`                                 |
//! | response time    | 0.20           | `1 − mean_ms / latency_ceiling_ms` (1.0 if no data)|
//! | cost             | 0.15           | `1 − cost / max_acceptable_cost`                   |
//! | availability     | 0.05           | `availability_score`                               |
//!
//! The highest total wins; ties go to the earliest-registered server.

use std::collections::HashMap;

use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use super::capability::Requirements;
use super::registry::ServerSnapshot;
use crate::config::ScoringConfig;
use crate::RouterError;

/// Per-component contributions for one server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    /// Server id.
    pub server_id: String,
    /// Unweighted capability-match component.
    pub capability_match: f64,
    /// Unweighted inverse-load component.
    pub load: f64,
    /// Unweighted inverse-response-time component.
    pub response_time: f64,
    /// Unweighted cost-efficiency component.
    pub cost: f64,
    /// Unweighted availability component.
    pub availability: f64,
    /// Weighted total.
    pub total: f64,
}

/// Picks the best server among eligible candidates.
///
/// Scoring is a pure function of the snapshots passed in. Selection counters
/// are bookkeeping only and never feed back into scores.
#[derive(Debug)]
pub struct SelectionScorer {
    config: ScoringConfig,
    selections: DashMap<String, u64>,
}

impl SelectionScorer {
    /// Create a scorer with the given weights and ceilings.
    pub fn new(config: ScoringConfig) -> Self {
        Self {
            config,
            selections: DashMap::new(),
        }
    }

    /// Score one server against `requirements`.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn breakdown(&self, server: &ServerSnapshot, requirements: &Requirements) -> ScoreBreakdown {
        let weights = &self.config.weights;

        let required: Vec<_> = requirements.required_capabilities().collect();
        let preferred = &requirements.constraints.preferred;
        let wanted = required.len() + preferred.len();
        let matched = required
            .iter()
            .filter(|c| server.capabilities.contains(**c))
            .count()
            + preferred
                .iter()
                .filter(|c| server.capabilities.contains(*c))
                .count();
        let capability_match = if wanted == 0 {
            1.0
        } else {
            matched as f64 / wanted as f64
        };

        let load = 1.0 - server.current_load.clamp(0.0, 1.0);

        let response_time = match server.mean_response_ms {
            Some(mean) if self.config.latency_ceiling_ms > 0.0 => {
                1.0 - (mean / self.config.latency_ceiling_ms).clamp(0.0, 1.0)
            }
            _ => 1.0,
        };

        let cost = if self.config.max_acceptable_cost > 0.0 {
            (1.0 - server.cost_per_request / self.config.max_acceptable_cost).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let availability = server.availability_score.clamp(0.0, 1.0);

        let total = weights.capability_match * capability_match
            + weights.load * load
            + weights.response_time * response_time
            + weights.cost * cost
            + weights.availability * availability;

        ScoreBreakdown {
            server_id: server.id.clone(),
            capability_match,
            load,
            response_time,
            cost,
            availability,
            total,
        }
    }

    /// Score every candidate, best first. Equal totals keep registration order.
    pub fn rank(&self, eligible: &[ServerSnapshot], requirements: &Requirements) -> Vec<ScoreBreakdown> {
        let mut ordered: Vec<&ServerSnapshot> = eligible.iter().collect();
        ordered.sort_by_key(|s| s.registration_order);
        let mut scored: Vec<ScoreBreakdown> = ordered
            .into_iter()
            .map(|s| self.breakdown(s, requirements))
            .collect();
        // Stable sort keeps registration order among ties.
        scored.sort_by(|a, b| b.total.total_cmp(&a.total));
        scored
    }

    /// Pick the highest-scoring server and count the selection.
    ///
    /// # Errors
    ///
    /// [`RouterError::NoEligibleServer`] when `eligible` is empty.
    pub fn select(
        &self,
        eligible: &[ServerSnapshot],
        requirements: &Requirements,
    ) -> Result<ServerSnapshot, RouterError> {
        let best = self
            .rank(eligible, requirements)
            .into_iter()
            .next()
            .and_then(|b| eligible.iter().find(|s| s.id == b.server_id).map(|s| (b, s)));

        let Some((breakdown, server)) = best else {
            return Err(RouterError::NoEligibleServer {
                capability: requirements.capability.clone(),
            });
        };

        debug!(
            server_id = %server.id,
            capability = %requirements.capability,
            score = breakdown.total,
            candidates = eligible.len(),
            "server selected"
        );
        *self.selections.entry(server.id.clone()).or_insert(0) += 1;
        Ok(server.clone())
    }

    /// Times `server_id` has been selected.
    pub fn selection_count(&self, server_id: &str) -> u64 {
        self.selections.get(server_id).map_or(0, |c| *c)
    }

    /// All selection counters.
    pub fn selection_counts(&self) -> HashMap<String, u64> {
        self.selections
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }
}

impl Default for SelectionScorer {
    fn default() -> Self {
        Self::new(ScoringConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::registry::ServerStatus;
    use crate::routing::Capability;
    use std::collections::HashSet;

    fn snap(id: &str, order: usize, cost: f64, load: f64) -> ServerSnapshot {
        ServerSnapshot {
            id: id.into(),
            registration_order: order,
            capabilities: [Capability::Search].into_iter().collect::<HashSet<_>>(),
            status: ServerStatus::Active,
            cost_per_request: cost,
            current_load: load,
            active_requests: 0,
            queue_depth: 0,
            mean_response_ms: None,
            success_count: 0,
            error_count: 0,
            availability_score: 1.0,
            consecutive_failures: 0,
            last_check: None,
            requests_this_minute: 0,
            requests_this_hour: 0,
            rate_limited: false,
        }
    }

    fn req() -> Requirements {
        Requirements::new(Capability::Search)
    }

    #[test]
    fn test_cheaper_server_beats_slightly_less_loaded_one() {
        let scorer = SelectionScorer::default();
        let servers = [snap("a", 0, 0.01, 0.1), snap("b", 1, 0.05, 0.05)];
        let chosen = scorer.select(&servers, &req()).map(|s| s.id);
        assert_eq!(chosen.ok().as_deref(), Some("a"));
    }

    #[test]
    fn test_large_load_advantage_outweighs_cost() {
        let scorer = SelectionScorer::default();
        let servers = [snap("a", 0, 0.01, 0.85), snap("b", 1, 0.05, 0.0)];
        let chosen = scorer.select(&servers, &req()).map(|s| s.id);
        assert_eq!(chosen.ok().as_deref(), Some("b"));
    }

    #[test]
    fn test_ties_break_by_registration_order() {
        let scorer = SelectionScorer::default();
        let servers = [snap("late", 5, 0.02, 0.2), snap("early", 1, 0.02, 0.2)];
        let chosen = scorer.select(&servers, &req()).map(|s| s.id);
        assert_eq!(chosen.ok().as_deref(), Some("early"));
    }

    #[test]
    fn test_selection_is_deterministic_and_counted() {
        let scorer = SelectionScorer::default();
        let servers = [snap("a", 0, 0.03, 0.3), snap("b", 1, 0.02, 0.4), snap("c", 2, 0.01, 0.5)];
        let first = scorer.select(&servers, &req()).map(|s| s.id).ok();
        for _ in 0..10 {
            assert_eq!(scorer.select(&servers, &req()).map(|s| s.id).ok(), first);
        }
        let total: u64 = scorer.selection_counts().values().sum();
        assert_eq!(total, 11);
    }

    #[test]
    fn test_empty_candidates_is_no_eligible_server() {
        let scorer = SelectionScorer::default();
        assert!(matches!(
            scorer.select(&[], &req()),
            Err(RouterError::NoEligibleServer { .. })
        ));
    }

    #[test]
    fn test_preferred_capability_raises_match_component() {
        let scorer = SelectionScorer::default();
        let mut plain = snap("plain", 0, 0.02, 0.2);
        let mut rich = snap("rich", 1, 0.02, 0.2);
        rich.capabilities.insert(Capability::Analysis);
        plain.availability_score = 1.0;
        let req = req().prefer(Capability::Analysis);
        assert!((scorer.breakdown(&plain, &req).capability_match - 0.5).abs() < 1e-9);
        assert!((scorer.breakdown(&rich, &req).capability_match - 1.0).abs() < 1e-9);
        assert_eq!(scorer.select(&[plain, rich], &req).map(|s| s.id).ok().as_deref(), Some("rich"));
    }

    #[test]
    fn test_components_clamped_to_unit_interval() {
        let scorer = SelectionScorer::default();
        let mut s = snap("x", 0, 5.0, 0.0);
        s.mean_response_ms = Some(50_000.0);
        let b = scorer.breakdown(&s, &req());
        assert_eq!(b.cost, 0.0);
        assert_eq!(b.response_time, 0.0);
        assert!(b.total >= 0.0 && b.total <= 1.0);
    }
}
