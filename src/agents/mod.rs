// Pipeline agents
//
// One async function per stage. Each builds a prompt from typed inputs,
// invokes the language-model strategy, and validates the parsed output
// against a typed shape before anything is persisted. The execution agent
// is the exception: it calls the scenario engine instead of the model.

pub mod critic;
pub mod prompts;

pub use critic::{run_issues_with_critic, CriticLogEntry, CriticResult, IssuesOutcome};
pub use prompts::AgentSettings;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{CaseworkError, Result};
use crate::llm::{CompletionKind, CompletionRequest, LanguageModel};
use crate::parse::{extract_json, extract_typed};
use crate::scenario::{run_scenario, ScenarioInput, ScenarioOutput};

/// Push-based progress notification: `(message, type)`. Types mirror the
/// SSE event names: "status", "llm", "critic", "progress". Must be
/// non-blocking; called zero or more times per agent invocation.
pub type ProgressFn = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// No-op progress sink for callers that don't stream.
pub fn silent_progress() -> ProgressFn {
    Arc::new(|_, _| {})
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKey {
    ProjectDefinition,
    IssuesTree,
    MeceCritic,
    Hypothesis,
    Execution,
    Summary,
    Presentation,
}

impl AgentKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKey::ProjectDefinition => "project_definition",
            AgentKey::IssuesTree => "issues_tree",
            AgentKey::MeceCritic => "mece_critic",
            AgentKey::Hypothesis => "hypothesis",
            AgentKey::Execution => "execution",
            AgentKey::Summary => "summary",
            AgentKey::Presentation => "presentation",
        }
    }
}

impl FromStr for AgentKey {
    type Err = CaseworkError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "project_definition" => Ok(AgentKey::ProjectDefinition),
            "issues_tree" => Ok(AgentKey::IssuesTree),
            "mece_critic" => Ok(AgentKey::MeceCritic),
            "hypothesis" => Ok(AgentKey::Hypothesis),
            "execution" => Ok(AgentKey::Execution),
            "summary" => Ok(AgentKey::Summary),
            "presentation" => Ok(AgentKey::Presentation),
            other => Err(CaseworkError::Invalid(format!("unknown agent key \"{other}\""))),
        }
    }
}

/// Everything an agent invocation needs, resolved by the orchestrator.
pub struct AgentContext<'a> {
    pub model: &'a dyn LanguageModel,
    pub settings: AgentSettings,
    pub progress: ProgressFn,
    /// Preformatted retrieval context, empty when the vault has nothing.
    pub rag_context: String,
}

impl<'a> AgentContext<'a> {
    fn request(&self, key: AgentKey, user: String, kind: CompletionKind) -> CompletionRequest {
        CompletionRequest {
            agent_key: key,
            system: self.settings.system_prompt.clone(),
            user,
            model: self.settings.model.clone(),
            max_tokens: self.settings.max_tokens,
            kind,
        }
    }

    fn with_rag(&self, prompt: String) -> String {
        if self.rag_context.is_empty() {
            prompt
        } else {
            format!("{prompt}\n\n{}", self.rag_context)
        }
    }
}

// ---------------------------------------------------------------------------
// Typed agent outputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl FromStr for Priority {
    type Err = CaseworkError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            other => Err(CaseworkError::Invalid(format!("unknown priority \"{other}\""))),
        }
    }
}

/// Issue node as emitted by the model: string IDs, parent references that
/// may arrive before their parents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueNodeOut {
    pub id: String,
    #[serde(rename = "parentId")]
    pub parent_id: Option<String>,
    pub text: String,
    pub priority: Priority,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuesPayload {
    pub issues: Vec<IssueNodeOut>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessMetric {
    pub metric_name: String,
    #[serde(default)]
    pub definition: String,
    #[serde(default)]
    pub threshold_or_target: String,
}

/// Decision framing produced by the project-definition agent. Lists default
/// to empty so a sparse but well-formed response still validates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectDefinition {
    pub decision_statement: String,
    pub governing_question: String,
    #[serde(default)]
    pub decision_owner: String,
    #[serde(default)]
    pub decision_deadline: String,
    #[serde(default)]
    pub success_metrics: Vec<SuccessMetric>,
    #[serde(default)]
    pub alternatives: Vec<String>,
    #[serde(default)]
    pub constraints: Value,
    #[serde(default)]
    pub assumptions: Vec<String>,
    #[serde(default)]
    pub initial_hypothesis: String,
    #[serde(default)]
    pub key_uncertainties: Vec<String>,
    #[serde(default)]
    pub information_gaps: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HypothesisOut {
    #[serde(rename = "issueNodeId", default)]
    pub issue_node_id: Option<String>,
    pub statement: String,
    pub metric: String,
    #[serde(rename = "dataSource", default)]
    pub data_source: String,
    #[serde(default)]
    pub method: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanEntryOut {
    #[serde(rename = "hypothesisIndex")]
    pub hypothesis_index: usize,
    pub method: String,
    pub parameters: ScenarioInput,
    #[serde(rename = "requiredDataset", default)]
    pub required_dataset: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HypothesesPayload {
    pub hypotheses: Vec<HypothesisOut>,
    #[serde(rename = "analysisPlan", default)]
    pub analysis_plan: Vec<PlanEntryOut>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    #[serde(rename = "toolName")]
    pub tool_name: String,
    pub inputs: ScenarioInput,
    pub outputs: ScenarioOutput,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryPayload {
    #[serde(rename = "summaryText")]
    pub summary_text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlideOut {
    #[serde(rename = "slideIndex")]
    pub slide_index: i64,
    pub layout: String,
    pub title: String,
    #[serde(default)]
    pub subtitle: Option<String>,
    #[serde(rename = "bodyJson", default)]
    pub body_json: Value,
    #[serde(rename = "notesText", default)]
    pub notes_text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlidesPayload {
    pub slides: Vec<SlideOut>,
}

/// A persisted issue node handed to downstream agents (real DB id).
#[derive(Debug, Clone)]
pub struct IssueRef {
    pub id: i64,
    pub text: String,
    pub priority: String,
}

/// A hypothesis paired with its model-run summary, for prompt building.
#[derive(Debug, Clone)]
pub struct HypothesisResult {
    pub statement: String,
    pub metric: String,
    pub run_summary: Option<Value>,
}

// ---------------------------------------------------------------------------
// Agent functions
// ---------------------------------------------------------------------------

pub async fn project_definition_agent(
    ctx: &AgentContext<'_>,
    objective: &str,
    constraints: &str,
) -> Result<ProjectDefinition> {
    let progress = &ctx.progress;
    progress("Starting Project Definition agent...", "status");

    let user = ctx.with_rag(format!(
        "Project Objective: {objective}\n\nConstraints & Context: {constraints}"
    ));
    progress(&format!("Calling LLM with model {}...", ctx.settings.model), "llm");
    let raw = ctx
        .model
        .complete(ctx.request(AgentKey::ProjectDefinition, user, CompletionKind::Generate))
        .await?;
    progress("LLM response received, parsing output...", "llm");

    let parsed: ProjectDefinition = extract_typed(&raw)?;
    progress(
        &format!(
            "Analysis complete. Generated project definition with {} success metrics.",
            parsed.success_metrics.len()
        ),
        "status",
    );
    Ok(parsed)
}

pub async fn hypothesis_agent(
    ctx: &AgentContext<'_>,
    issues: &[IssueRef],
) -> Result<HypothesesPayload> {
    let progress = &ctx.progress;
    progress("Starting Hypothesis agent...", "status");

    let issues_list = issues
        .iter()
        .map(|i| format!("- [ID:{}] {} ({})", i.id, i.text, i.priority))
        .collect::<Vec<_>>()
        .join("\n");

    progress(&format!("Calling LLM with model {}...", ctx.settings.model), "llm");
    let raw = ctx
        .model
        .complete(ctx.request(
            AgentKey::Hypothesis,
            format!("Issues:\n{issues_list}"),
            CompletionKind::Generate,
        ))
        .await?;
    progress("LLM response received, parsing output...", "llm");

    let parsed: HypothesesPayload = extract_typed(&raw)?;
    progress(
        &format!("Analysis complete. Generated {} hypotheses.", parsed.hypotheses.len()),
        "status",
    );
    Ok(parsed)
}

/// Deterministic: one scenario-engine call per plan entry, no model.
pub fn execution_agent(plans: &[ScenarioInput], progress: &ProgressFn) -> Vec<ExecutionRecord> {
    progress("Starting Execution agent...", "status");

    let mut results = Vec::with_capacity(plans.len());
    for (idx, params) in plans.iter().enumerate() {
        progress(&format!("Running scenario {} of {}...", idx + 1, plans.len()), "status");
        let outputs = run_scenario(params);
        results.push(ExecutionRecord {
            tool_name: "run_scenario_tool".to_string(),
            inputs: params.clone(),
            outputs,
        });
    }

    progress(
        &format!("Analysis complete. Generated {} scenario results.", results.len()),
        "status",
    );
    results
}

pub async fn summary_agent(
    ctx: &AgentContext<'_>,
    objective: &str,
    constraints: &str,
    results: &[HypothesisResult],
) -> Result<SummaryPayload> {
    let progress = &ctx.progress;
    progress("Starting Summary agent...", "status");

    let hyp_list = results
        .iter()
        .map(|r| {
            let run = r
                .run_summary
                .as_ref()
                .map(|v| v.to_string())
                .unwrap_or_else(|| "\"No results\"".to_string());
            format!("Hypothesis: {}\nMetric: {}\nModel Results: {run}", r.statement, r.metric)
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    progress(&format!("Calling LLM with model {}...", ctx.settings.model), "llm");
    let user = format!(
        "Objective: {objective}\nConstraints: {constraints}\n\nHypotheses & Results:\n{hyp_list}"
    );
    let summary_text = ctx
        .model
        .complete(ctx.request(AgentKey::Summary, user, CompletionKind::Generate))
        .await?;
    progress("LLM response received, parsing output...", "llm");
    progress("Analysis complete. Generated executive summary.", "status");

    let summary_text = if summary_text.is_empty() {
        "Summary generation failed.".to_string()
    } else {
        summary_text
    };
    Ok(SummaryPayload { summary_text })
}

pub async fn presentation_agent(
    ctx: &AgentContext<'_>,
    project_name: &str,
    objective: &str,
    narrative: Option<&str>,
    results: &[HypothesisResult],
) -> Result<SlidesPayload> {
    let progress = &ctx.progress;
    progress("Starting Presentation agent...", "status");

    let hyp_summary = results
        .iter()
        .map(|r| {
            let outcome = match &r.run_summary {
                Some(summary) => format!(
                    "NPV: ${}, Risk-Adj Return: {}%",
                    summary.get("expectedValue").cloned().unwrap_or(Value::Null),
                    summary.get("riskAdjustedReturn").cloned().unwrap_or(Value::Null)
                ),
                None => "No results".to_string(),
            };
            format!("- {} ({}): {outcome}", r.statement, r.metric)
        })
        .collect::<Vec<_>>()
        .join("\n");

    progress(&format!("Calling LLM with model {}...", ctx.settings.model), "llm");
    let user = format!(
        "Project: {project_name}\nObjective: {objective}\n\nExecutive Summary:\n{}\n\nHypotheses & Results:\n{hyp_summary}",
        narrative.unwrap_or("No summary available")
    );
    let raw = ctx
        .model
        .complete(ctx.request(AgentKey::Presentation, user, CompletionKind::Generate))
        .await?;
    progress("LLM response received, parsing output...", "llm");

    let parsed: SlidesPayload = extract_typed(&raw)?;
    progress(
        &format!("Analysis complete. Generated {} slides.", parsed.slides.len()),
        "status",
    );
    Ok(parsed)
}

/// Rework a deliverable against user feedback. The model must return the
/// complete updated payload, never a partial patch.
pub async fn refine_agent(
    ctx: &AgentContext<'_>,
    agent_key: AgentKey,
    current: &Value,
    feedback: &str,
    objective: &str,
    constraints: &str,
) -> Result<Value> {
    let progress = &ctx.progress;
    progress("Processing your feedback...", "progress");

    let current_pretty =
        serde_json::to_string_pretty(current).map_err(|e| CaseworkError::Parse(e.to_string()))?;
    let user = format!(
        "You previously generated the following output for this project:\n\n\
         Project Objective: {objective}\nConstraints: {constraints}\n\n\
         Your previous output:\n{current_pretty}\n\n\
         The user has requested the following changes:\n\"{feedback}\"\n\n\
         Please regenerate the COMPLETE output incorporating the user's feedback. \
         Return the FULL updated output in the same JSON format as before. \
         Do not return partial updates - return the entire revised document."
    );

    progress(
        &format!("Calling LLM with model {} to refine output...", ctx.settings.model),
        "llm",
    );
    let raw = ctx
        .model
        .complete(ctx.request(
            agent_key,
            user,
            CompletionKind::Refine {
                current: current.clone(),
            },
        ))
        .await?;
    progress("LLM response received, parsing refined output...", "llm");

    let parsed = extract_json(&raw)?;
    progress("Refinement complete.", "status");
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::FixtureModel;

    fn ctx<'a>(model: &'a FixtureModel, key: AgentKey) -> AgentContext<'a> {
        AgentContext {
            model,
            settings: AgentSettings::default_for(key),
            progress: silent_progress(),
            rag_context: String::new(),
        }
    }

    #[tokio::test]
    async fn test_project_definition_validates_shape() {
        let model = FixtureModel::new();
        let result =
            project_definition_agent(&ctx(&model, AgentKey::ProjectDefinition), "grow", "budget")
                .await
                .unwrap();
        assert!(!result.success_metrics.is_empty());
        assert!(!result.governing_question.is_empty());
    }

    #[tokio::test]
    async fn test_hypothesis_agent_links_plans() {
        let model = FixtureModel::new();
        let issues = vec![IssueRef {
            id: 1,
            text: "Market Entry".into(),
            priority: "high".into(),
        }];
        let result = hypothesis_agent(&ctx(&model, AgentKey::Hypothesis), &issues)
            .await
            .unwrap();
        assert_eq!(result.hypotheses.len(), result.analysis_plan.len());
        for plan in &result.analysis_plan {
            assert!(plan.hypothesis_index < result.hypotheses.len());
        }
    }

    #[tokio::test]
    async fn test_execution_agent_runs_every_plan() {
        let plans = vec![
            ScenarioInput {
                baseline_revenue: 1_000_000.0,
                growth_rate: 0.1,
                cost_reduction: 0.05,
                time_horizon_years: 5,
                volatility: 0.15,
            };
            3
        ];
        let results = execution_agent(&plans, &silent_progress());
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.tool_name == "run_scenario_tool"));
    }

    #[tokio::test]
    async fn test_summary_agent_never_empty() {
        let model = FixtureModel::new();
        let result = summary_agent(&ctx(&model, AgentKey::Summary), "obj", "cons", &[])
            .await
            .unwrap();
        assert!(!result.summary_text.is_empty());
    }

    #[tokio::test]
    async fn test_presentation_agent_orders_slides() {
        let model = FixtureModel::new();
        let result = presentation_agent(
            &ctx(&model, AgentKey::Presentation),
            "Acme Expansion",
            "grow",
            Some("summary"),
            &[],
        )
        .await
        .unwrap();
        assert!(result.slides.len() >= 2);
        assert_eq!(result.slides[0].slide_index, 0);
    }
}
