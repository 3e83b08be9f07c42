// Deterministic scenario-finance engine
//
// Pure function: three compounded projections (baseline / optimistic /
// pessimistic) from five numeric inputs, NPV at a fixed discount rate,
// and a fixed-weight expected value. Called as a tool by the execution
// agent; never touches the network or the database.

use serde::{Deserialize, Serialize};

const DISCOUNT_RATE: f64 = 0.1;
const BASE_COST_RATIO: f64 = 0.7;
const DEFAULT_VOLATILITY: f64 = 0.15;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioInput {
    pub baseline_revenue: f64,
    pub growth_rate: f64,
    pub cost_reduction: f64,
    pub time_horizon_years: u32,
    #[serde(default = "default_volatility")]
    pub volatility: f64,
}

fn default_volatility() -> f64 {
    DEFAULT_VOLATILITY
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct YearProjection {
    pub year: u32,
    pub revenue: f64,
    pub costs: f64,
    pub profit: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioSummary {
    #[serde(rename = "baselineNPV")]
    pub baseline_npv: f64,
    #[serde(rename = "optimisticNPV")]
    pub optimistic_npv: f64,
    #[serde(rename = "pessimisticNPV")]
    pub pessimistic_npv: f64,
    pub expected_value: f64,
    pub risk_adjusted_return: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioOutput {
    pub baseline: Vec<YearProjection>,
    pub optimistic: Vec<YearProjection>,
    pub pessimistic: Vec<YearProjection>,
    pub summary: ScenarioSummary,
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

fn build_scenario(input: &ScenarioInput, revenue_mult: f64, cost_mult: f64) -> Vec<YearProjection> {
    let mut years = Vec::with_capacity(input.time_horizon_years as usize);
    let mut revenue = input.baseline_revenue;
    for year in 1..=input.time_horizon_years {
        let adjusted_growth = input.growth_rate * revenue_mult;
        revenue *= 1.0 + adjusted_growth;
        let costs = revenue * BASE_COST_RATIO * cost_mult * (1.0 - input.cost_reduction);
        years.push(YearProjection {
            year,
            revenue: round2(revenue),
            costs: round2(costs),
            profit: round2(revenue - costs),
        });
    }
    years
}

fn npv(years: &[YearProjection]) -> f64 {
    years
        .iter()
        .enumerate()
        .map(|(i, y)| y.profit / (1.0 + DISCOUNT_RATE).powi(i as i32 + 1))
        .sum()
}

/// Run the three-way scenario projection. Deterministic: identical inputs
/// always yield bit-identical rounded outputs.
pub fn run_scenario(input: &ScenarioInput) -> ScenarioOutput {
    let v = input.volatility;

    let baseline = build_scenario(input, 1.0, 1.0);
    let optimistic = build_scenario(input, 1.0 + v, 1.0 - v * 0.5);
    let pessimistic = build_scenario(input, 1.0 - v, 1.0 + v * 0.5);

    let baseline_npv = round2(npv(&baseline));
    let optimistic_npv = round2(npv(&optimistic));
    let pessimistic_npv = round2(npv(&pessimistic));
    let expected_value = round2(optimistic_npv * 0.25 + baseline_npv * 0.5 + pessimistic_npv * 0.25);
    let risk_adjusted_return = round2((expected_value / input.baseline_revenue - 1.0) * 100.0);

    ScenarioOutput {
        baseline,
        optimistic,
        pessimistic,
        summary: ScenarioSummary {
            baseline_npv,
            optimistic_npv,
            pessimistic_npv,
            expected_value,
            risk_adjusted_return,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_input() -> ScenarioInput {
        ScenarioInput {
            baseline_revenue: 1_000_000.0,
            growth_rate: 0.1,
            cost_reduction: 0.05,
            time_horizon_years: 5,
            volatility: 0.15,
        }
    }

    #[test]
    fn test_deterministic_output() {
        let a = run_scenario(&sample_input());
        let b = run_scenario(&sample_input());
        assert_eq!(a, b);
        assert_eq!(a.summary.baseline_npv, b.summary.baseline_npv);
    }

    #[test]
    fn test_scenario_ordering() {
        let out = run_scenario(&sample_input());
        assert!(out.summary.pessimistic_npv <= out.summary.baseline_npv);
        assert!(out.summary.baseline_npv <= out.summary.optimistic_npv);
    }

    #[test]
    fn test_expected_value_blend() {
        let out = run_scenario(&sample_input());
        let s = &out.summary;
        // Recompute the blend exactly as the engine does
        let expected = ((s.optimistic_npv * 0.25 + s.baseline_npv * 0.5 + s.pessimistic_npv * 0.25)
            * 100.0)
            .round()
            / 100.0;
        assert_eq!(s.expected_value, expected);
    }

    #[test]
    fn test_year_count_matches_horizon() {
        let out = run_scenario(&sample_input());
        assert_eq!(out.baseline.len(), 5);
        assert_eq!(out.optimistic.len(), 5);
        assert_eq!(out.pessimistic.len(), 5);
        assert_eq!(out.baseline[0].year, 1);
        assert_eq!(out.baseline[4].year, 5);
    }

    #[test]
    fn test_profit_is_revenue_minus_costs() {
        let out = run_scenario(&sample_input());
        for y in &out.baseline {
            // Rounded independently, so allow a cent of drift
            assert!((y.profit - (y.revenue - y.costs)).abs() < 0.02);
        }
    }

    #[test]
    fn test_zero_volatility_collapses_scenarios() {
        let input = ScenarioInput {
            volatility: 0.0,
            ..sample_input()
        };
        let out = run_scenario(&input);
        assert_eq!(out.summary.baseline_npv, out.summary.optimistic_npv);
        assert_eq!(out.summary.baseline_npv, out.summary.pessimistic_npv);
        assert_eq!(out.summary.expected_value, out.summary.baseline_npv);
    }

    #[test]
    fn test_volatility_defaults_on_deserialize() {
        let input: ScenarioInput = serde_json::from_str(
            r#"{"baselineRevenue":500000,"growthRate":0.08,"costReduction":0.05,"timeHorizonYears":3}"#,
        )
        .unwrap();
        assert_eq!(input.volatility, 0.15);
    }
}
