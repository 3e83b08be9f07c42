// Deterministic fixture model
//
// Stands in for the live endpoint when no credential is configured. Each
// agent gets canned output of exactly the shape the live model is prompted
// for, so the parse -> validate -> persist path is identical in both modes.

use async_trait::async_trait;
use serde_json::json;

use super::{CompletionKind, CompletionRequest, LanguageModel};
use crate::agents::AgentKey;
use crate::error::Result;

#[derive(Default)]
pub struct FixtureModel;

impl FixtureModel {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl LanguageModel for FixtureModel {
    fn model_used(&self) -> String {
        "mock".to_string()
    }

    async fn complete(&self, req: CompletionRequest) -> Result<String> {
        // Refinement in mock mode hands the current content back unchanged.
        if let CompletionKind::Refine { current } = &req.kind {
            return Ok(serde_json::to_string(current).expect("value serializes"));
        }

        Ok(match req.agent_key {
            AgentKey::ProjectDefinition => project_definition_fixture(),
            AgentKey::IssuesTree => issues_tree_fixture(),
            AgentKey::MeceCritic => critic_fixture(),
            AgentKey::Hypothesis => hypothesis_fixture(),
            AgentKey::Execution => String::new(), // execution never calls the model
            AgentKey::Summary => summary_fixture(),
            AgentKey::Presentation => presentation_fixture(),
        })
    }
}

fn project_definition_fixture() -> String {
    json!({
        "decision_statement": "Determine the optimal strategic approach to the stated objective",
        "governing_question": "Should we pursue the proposed strategy, given the stated constraints, by the next 12-month planning cycle?",
        "decision_owner": "Executive Leadership / Project Sponsor",
        "decision_deadline": "Within 4-6 weeks of project initiation",
        "success_metrics": [
            {"metric_name": "Revenue Impact", "definition": "Net incremental revenue attributable to the initiative", "threshold_or_target": ">$1M within 12 months"},
            {"metric_name": "ROI", "definition": "Return on investment over the project period", "threshold_or_target": ">15% annualized"},
            {"metric_name": "Implementation Feasibility", "definition": "Assessed probability of successful execution", "threshold_or_target": ">70% confidence"}
        ],
        "alternatives": [
            "Pursue full-scale implementation immediately",
            "Phased rollout starting with pilot program",
            "Partner or acquire capability externally",
            "Do nothing — maintain current trajectory"
        ],
        "constraints": {
            "budget": "To be confirmed; assume moderate investment envelope",
            "regulatory": "Standard industry compliance requirements apply",
            "time": "Decision needed within current planning cycle",
            "political": "Stakeholder alignment required across key business units",
            "operational": "Must be achievable with existing team capacity plus reasonable augmentation"
        },
        "assumptions": [
            "Current market conditions remain broadly stable over the analysis period",
            "Organization has willingness to allocate resources if the case is compelling",
            "Data sufficient for directional analysis is available or obtainable",
            "No major regulatory changes expected in the near term"
        ],
        "initial_hypothesis": "The proposed initiative is likely to deliver positive returns, but the magnitude depends on execution speed and market timing. A phased approach may reduce risk while preserving upside.",
        "key_uncertainties": [
            "Actual market size and addressable share",
            "Competitive response timeline and intensity",
            "Internal execution capability and speed",
            "Customer adoption rate assumptions"
        ],
        "information_gaps": [
            "Detailed competitive landscape data",
            "Customer willingness-to-pay research",
            "Internal cost structure for new capabilities",
            "Regulatory timeline for any required approvals"
        ]
    })
    .to_string()
}

fn issues_tree_fixture() -> String {
    json!({
        "issues": [
            {"id": "1", "parentId": null, "text": "Market Entry Strategy", "priority": "high"},
            {"id": "2", "parentId": "1", "text": "Target Market Sizing", "priority": "high"},
            {"id": "3", "parentId": "2", "text": "Addressable Market Segments", "priority": "high"},
            {"id": "4", "parentId": "2", "text": "Growth Rate Projections", "priority": "medium"},
            {"id": "5", "parentId": "1", "text": "Competitive Landscape", "priority": "medium"},
            {"id": "6", "parentId": "5", "text": "Key Competitor Positioning", "priority": "medium"},
            {"id": "7", "parentId": "5", "text": "Barrier to Entry Analysis", "priority": "high"},
            {"id": "8", "parentId": null, "text": "Revenue Model Design", "priority": "high"},
            {"id": "9", "parentId": "8", "text": "Pricing Strategy", "priority": "high"},
            {"id": "10", "parentId": "9", "text": "Price Elasticity Testing", "priority": "medium"},
            {"id": "11", "parentId": "9", "text": "Tiered Pricing Structure", "priority": "high"},
            {"id": "12", "parentId": "8", "text": "Channel Mix Selection", "priority": "medium"},
            {"id": "13", "parentId": "12", "text": "Direct Sales Capacity", "priority": "medium"},
            {"id": "14", "parentId": "12", "text": "Partner Distribution", "priority": "low"},
            {"id": "15", "parentId": null, "text": "Operational Readiness", "priority": "medium"},
            {"id": "16", "parentId": "15", "text": "Team Scaling Plan", "priority": "medium"},
            {"id": "17", "parentId": "16", "text": "Hiring Pipeline", "priority": "medium"},
            {"id": "18", "parentId": "16", "text": "Training Programs", "priority": "low"},
            {"id": "19", "parentId": "15", "text": "Technology Infrastructure", "priority": "low"},
            {"id": "20", "parentId": "19", "text": "Platform Architecture", "priority": "low"},
            {"id": "21", "parentId": "19", "text": "Data Pipeline Setup", "priority": "medium"}
        ]
    })
    .to_string()
}

fn critic_fixture() -> String {
    json!({
        "verdict": "approved",
        "scores": {
            "overlap": {"score": 5, "details": "No overlap between sibling branches"},
            "coverage": {"score": 4, "details": "Key dimensions covered: market, revenue, operations"},
            "mixedLogics": {"score": 4, "details": "Consistent strategic decomposition at each level"},
            "branchBalance": {"score": 4, "details": "Balanced across 3 root branches (7/7/7 nodes)"},
            "labelQuality": {"score": 5, "details": "All labels are specific and descriptive"}
        },
        "overallScore": 4,
        "revisionInstructions": ""
    })
    .to_string()
}

fn hypothesis_fixture() -> String {
    json!({
        "hypotheses": [
            {
                "issueNodeId": "1",
                "statement": "If we address \"Market Entry Strategy\", we can achieve 15-25% improvement in the target metric",
                "metric": "Revenue growth %",
                "dataSource": "Industry benchmarks",
                "method": "scenario_analysis"
            },
            {
                "issueNodeId": "8",
                "statement": "If we address \"Revenue Model Design\", we can achieve 15-25% improvement in the target metric",
                "metric": "Cost reduction %",
                "dataSource": "Internal financials",
                "method": "scenario_analysis"
            },
            {
                "issueNodeId": "15",
                "statement": "If we address \"Operational Readiness\", we can achieve 15-25% improvement in the target metric",
                "metric": "Market share %",
                "dataSource": "Market research",
                "method": "scenario_analysis"
            }
        ],
        "analysisPlan": [
            {
                "hypothesisIndex": 0,
                "method": "run_scenario_tool",
                "parameters": {"baselineRevenue": 1000000.0, "growthRate": 0.08, "costReduction": 0.05, "timeHorizonYears": 5, "volatility": 0.15},
                "requiredDataset": "Financial projections + market data"
            },
            {
                "hypothesisIndex": 1,
                "method": "run_scenario_tool",
                "parameters": {"baselineRevenue": 1500000.0, "growthRate": 0.10, "costReduction": 0.08, "timeHorizonYears": 5, "volatility": 0.15},
                "requiredDataset": "Financial projections + market data"
            },
            {
                "hypothesisIndex": 2,
                "method": "run_scenario_tool",
                "parameters": {"baselineRevenue": 2000000.0, "growthRate": 0.12, "costReduction": 0.11, "timeHorizonYears": 5, "volatility": 0.15},
                "requiredDataset": "Financial projections + market data"
            }
        ]
    })
    .to_string()
}

fn summary_fixture() -> String {
    "# Executive Summary\n\n\
     ## Key Findings\n\
     - Scenario analysis across baseline, optimistic, and pessimistic cases shows positive expected NPV\n\
     - Risk-adjusted returns support a phased entry over a single large commitment\n\
     - The highest-priority issues concentrate in market sizing and pricing design\n\n\
     ## Recommendation\n\
     Based on scenario analysis across baseline, optimistic, and pessimistic cases, the proposed \
     strategy shows positive expected returns. The risk-adjusted analysis suggests proceeding with \
     a phased implementation approach, prioritizing the highest-NPV initiatives first.\n\n\
     ## Next Steps\n\
     1. Validate assumptions with stakeholder interviews\n\
     2. Develop detailed implementation roadmap\n\
     3. Establish KPI tracking framework\n\
     4. Begin Phase 1 execution within 30 days"
        .to_string()
}

fn presentation_fixture() -> String {
    json!({
        "slides": [
            {"slideIndex": 0, "layout": "title_slide", "title": "Consulting Analysis", "subtitle": "Strategic Analysis & Recommendations", "bodyJson": {}, "notesText": "Welcome and introductions"},
            {"slideIndex": 1, "layout": "section_header", "title": "Executive Summary", "subtitle": "Key findings from our analysis", "bodyJson": {}, "notesText": "Transition to executive overview"},
            {"slideIndex": 2, "layout": "title_body", "title": "Objective & Scope", "subtitle": null, "bodyJson": {"bullets": ["Project objective and constraints", "Multi-scenario financial modeling", "Risk-adjusted return analysis", "Data-driven recommendations"]}, "notesText": "Review the project scope and analytical approach"},
            {"slideIndex": 3, "layout": "metrics", "title": "Key Financial Metrics", "subtitle": null, "bodyJson": {"metrics": [{"label": "Expected NPV", "value": "$850K", "change": "+22%"}, {"label": "Best Case", "value": "$1.2M", "change": "Upside"}, {"label": "Risk-Adj Return", "value": "18%", "change": "+5pp"}]}, "notesText": "Walk through each metric and its implications"},
            {"slideIndex": 4, "layout": "two_column", "title": "Scenario Comparison", "subtitle": null, "bodyJson": {"leftTitle": "Baseline Scenario", "leftBullets": ["Conservative growth assumptions", "Moderate cost efficiencies", "Stable market conditions"], "rightTitle": "Optimistic Scenario", "rightBullets": ["Accelerated market capture", "Full cost reduction realized", "Favorable competitive dynamics"]}, "notesText": "Compare the two primary scenarios"},
            {"slideIndex": 5, "layout": "title_body", "title": "Key Findings", "subtitle": null, "bodyJson": {"bullets": ["Market entry economics are favorable", "Pricing structure drives most upside", "Operational readiness is the gating factor"]}, "notesText": "Detail each hypothesis and supporting evidence"},
            {"slideIndex": 6, "layout": "title_body", "title": "Recommendations", "subtitle": null, "bodyJson": {"bullets": ["Proceed with phased implementation", "Prioritize highest-NPV initiatives", "Establish KPI tracking framework", "Conduct monthly progress reviews"]}, "notesText": "Present the recommended course of action"},
            {"slideIndex": 7, "layout": "title_body", "title": "Next Steps", "subtitle": "30-60-90 Day Plan", "bodyJson": {"bullets": ["Days 1-30: Stakeholder alignment", "Days 31-60: Pilot program launch", "Days 61-90: Scale & optimize", "Ongoing: Monthly KPI review"]}, "notesText": "Outline the implementation timeline"},
            {"slideIndex": 8, "layout": "section_header", "title": "Thank You", "subtitle": "Questions & Discussion", "bodyJson": {}, "notesText": "Open floor for Q&A"}
        ]
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::extract_json;

    fn request(key: AgentKey) -> CompletionRequest {
        CompletionRequest {
            agent_key: key,
            system: String::new(),
            user: String::new(),
            model: "mock".into(),
            max_tokens: 1024,
            kind: CompletionKind::Generate,
        }
    }

    #[tokio::test]
    async fn test_fixture_outputs_parse() {
        let model = FixtureModel::new();
        for key in [
            AgentKey::ProjectDefinition,
            AgentKey::IssuesTree,
            AgentKey::MeceCritic,
            AgentKey::Hypothesis,
            AgentKey::Presentation,
        ] {
            let raw = model.complete(request(key)).await.unwrap();
            extract_json(&raw).unwrap();
        }
    }

    #[tokio::test]
    async fn test_summary_fixture_is_markdown() {
        let model = FixtureModel::new();
        let raw = model.complete(request(AgentKey::Summary)).await.unwrap();
        assert!(raw.starts_with("# Executive Summary"));
    }

    #[tokio::test]
    async fn test_refine_echoes_current_content() {
        let model = FixtureModel::new();
        let current = serde_json::json!({"summaryText": "keep me"});
        let raw = model
            .complete(CompletionRequest {
                kind: CompletionKind::Refine {
                    current: current.clone(),
                },
                ..request(AgentKey::Summary)
            })
            .await
            .unwrap();
        assert_eq!(extract_json(&raw).unwrap(), current);
    }
}
