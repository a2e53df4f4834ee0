//! Per-call cost accounting and aggregation.

use std::collections::HashMap;

use crate::types::TokenUsage;

/// Per-million-token pricing for a model.
#[derive(Debug, Clone, Copy)]
pub struct Pricing {
    pub prompt_price_per_million: f64,
    pub completion_price_per_million: f64,
}

/// `cost = (promptTokens/1e6)*promptPrice + (completionTokens/1e6)*completionPrice`.
///
/// Zero tokens yields zero cost; the result is linear in each token count.
#[must_use]
pub fn calculate_cost(usage: TokenUsage, pricing: Pricing) -> f64 {
    (f64::from(usage.prompt) / 1_000_000.0) * pricing.prompt_price_per_million
        + (f64::from(usage.completion) / 1_000_000.0) * pricing.completion_price_per_million
}

/// One priced call, attributing cost to a provider and member for aggregation.
#[derive(Debug, Clone)]
pub struct CostEntry {
    pub provider: String,
    pub member_id: String,
    pub cost: f64,
}

/// Aggregate totals across a set of [`CostEntry`] values.
#[derive(Debug, Clone, Default)]
pub struct CostSummary {
    pub total: f64,
    pub by_provider: HashMap<String, f64>,
    pub by_member: HashMap<String, f64>,
}

/// `total = sum(c_i)`, `by_provider[p] = sum of c_i where p_i == p`,
/// `by_member[m] = sum of c_i where m_i == m`.
#[must_use]
pub fn aggregate_costs(entries: &[CostEntry]) -> CostSummary {
    let mut summary = CostSummary::default();
    for entry in entries {
        summary.total += entry.cost;
        *summary.by_provider.entry(entry.provider.clone()).or_insert(0.0) += entry.cost;
        *summary.by_member.entry(entry.member_id.clone()).or_insert(0.0) += entry.cost;
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f64 = 1e-6;

    #[test]
    fn zero_tokens_yields_zero_cost() {
        let pricing = Pricing {
            prompt_price_per_million: 10.0,
            completion_price_per_million: 30.0,
        };
        let cost = calculate_cost(TokenUsage { prompt: 0, completion: 0 }, pricing);
        assert!((cost - 0.0).abs() < EPSILON);
    }

    #[test]
    fn cost_is_linear_in_tokens() {
        let pricing = Pricing {
            prompt_price_per_million: 10.0,
            completion_price_per_million: 30.0,
        };
        let one = calculate_cost(TokenUsage { prompt: 1_000_000, completion: 0 }, pricing);
        let two = calculate_cost(TokenUsage { prompt: 2_000_000, completion: 0 }, pricing);
        assert!((two - 2.0 * one).abs() < EPSILON);
        assert!((one - 10.0).abs() < EPSILON);
    }

    #[test]
    fn aggregate_costs_sums_match_totals() {
        let entries = vec![
            CostEntry { provider: "openai".into(), member_id: "m1".into(), cost: 1.5 },
            CostEntry { provider: "openai".into(), member_id: "m2".into(), cost: 2.5 },
            CostEntry { provider: "anthropic".into(), member_id: "m3".into(), cost: 4.0 },
        ];
        let summary = aggregate_costs(&entries);
        assert!((summary.total - 8.0).abs() < EPSILON);
        assert!((summary.by_provider["openai"] - 4.0).abs() < EPSILON);
        assert!((summary.by_provider["anthropic"] - 4.0).abs() < EPSILON);
        assert!((summary.by_member["m1"] - 1.5).abs() < EPSILON);
    }

    #[test]
    fn empty_entries_yield_zero_summary() {
        let summary = aggregate_costs(&[]);
        assert!((summary.total - 0.0).abs() < EPSILON);
        assert!(summary.by_provider.is_empty());
    }
}
