// Pipeline orchestrator
//
// Owns the dependency wiring (storage, model, retriever) and implements
// every stage transition. All mutating operations on one project are
// serialized through a per-project async mutex, so two concurrent run-next
// calls cannot both observe the same stage and double-advance.

use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::agents::{
    self, execution_agent, hypothesis_agent, presentation_agent, project_definition_agent,
    refine_agent, run_issues_with_critic, summary_agent, AgentContext, AgentKey, AgentSettings,
    ExecutionRecord, HypothesisResult, IssueRef, IssuesOutcome, ProgressFn, ProjectDefinition,
    SlidesPayload, SummaryPayload,
};
use crate::config::Config;
use crate::deliverables::{update_deliverable_envelope, unwrap_deliverable_content, wrap_deliverable_content, WrapInput};
use crate::error::{CaseworkError, Result};
use crate::llm::{FixtureModel, LanguageModel, LiveModel};
use crate::rag::{gather_context, ContextRetriever, NoRetriever, DEFAULT_MAX_CHUNKS};
use crate::scenario::ScenarioInput;
use crate::stage::{RedoStep, Stage, StepStatus};
use crate::store::{Deliverable, InstanceStep, Project, Storage, TreeInsertReport};

/// Default workflow template: one step per pipeline agent, in run order.
pub const DEFAULT_TEMPLATE_STEPS: [(&str, &str); 6] = [
    ("Project Definition", "project_definition"),
    ("Issues Tree", "issues_tree"),
    ("Hypotheses & Analysis Plan", "hypothesis"),
    ("Execution", "execution"),
    ("Executive Summary", "summary"),
    ("Presentation", "presentation"),
];

pub struct App {
    pub storage: Storage,
    pub model: Arc<dyn LanguageModel>,
    pub retriever: Arc<dyn ContextRetriever>,
    locks: DashMap<i64, Arc<Mutex<()>>>,
}

#[derive(Debug, Serialize)]
pub struct RunOutcome {
    pub project: Project,
    pub deliverable: Option<Deliverable>,
}

/// What an agent produced, before persistence.
enum AgentOutput {
    Definition(ProjectDefinition),
    Issues(IssuesOutcome),
    Hypotheses(agents::HypothesesPayload),
    Execution(Vec<(Option<i64>, ExecutionRecord)>),
    Summary(SummaryPayload),
    Presentation(SlidesPayload),
}

impl App {
    pub fn new(
        storage: Storage,
        model: Arc<dyn LanguageModel>,
        retriever: Arc<dyn ContextRetriever>,
    ) -> Self {
        Self {
            storage,
            model,
            retriever,
            locks: DashMap::new(),
        }
    }

    /// Build the application from loaded configuration. Without an API key
    /// the fixture model is used and the whole pipeline stays runnable.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let storage = Storage::open(&config.db_path)?;
        let model: Arc<dyn LanguageModel> = match &config.api_key {
            Some(key) if !key.is_empty() => Arc::new(LiveModel::new(
                key.clone(),
                config.base_url.clone(),
                config.default_model.clone(),
                config.truncation_retries,
            )?),
            _ => Arc::new(FixtureModel::new()),
        };
        Ok(Self::new(storage, model, Arc::new(NoRetriever)))
    }

    pub async fn ensure_defaults(&self) -> Result<()> {
        self.storage
            .ensure_default_template(&DEFAULT_TEMPLATE_STEPS)
            .await?;
        Ok(())
    }

    fn project_lock(&self, project_id: i64) -> Arc<Mutex<()>> {
        self.locks
            .entry(project_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn agent_settings(&self, key: AgentKey) -> Result<AgentSettings> {
        match self.storage.get_agent_config(key.as_str()).await? {
            Some(stored) => Ok(AgentSettings {
                system_prompt: stored.system_prompt,
                model: stored.model,
                max_tokens: stored.max_tokens,
            }),
            None => Ok(AgentSettings::default_for(key)),
        }
    }

    // ------------------------------------------------------------------
    // Project lifecycle
    // ------------------------------------------------------------------

    pub async fn create_project(
        &self,
        name: &str,
        objective: &str,
        constraints: &str,
    ) -> Result<Project> {
        let project = self.storage.create_project(name, objective, constraints).await?;
        let template_id = self
            .storage
            .ensure_default_template(&DEFAULT_TEMPLATE_STEPS)
            .await?;
        self.storage.create_instance(project.id, template_id).await?;
        Ok(project)
    }

    /// Run the next agent in the pipeline and advance to its draft stage.
    pub async fn run_next(&self, project_id: i64, progress: ProgressFn) -> Result<RunOutcome> {
        let lock = self.project_lock(project_id);
        let _guard = lock.lock().await;

        let project = self.storage.get_project(project_id).await?;
        let target = project.stage.run_next_target().ok_or_else(|| {
            CaseworkError::IllegalTransition(format!(
                "Cannot run next step from stage \"{}\"",
                project.stage
            ))
        })?;
        let agent = target
            .agent_for_draft()
            .ok_or_else(|| CaseworkError::IllegalTransition("no agent for target stage".into()))?;

        let step = self.find_step(project_id, agent).await?;
        self.run_agent_step(&project, step.as_ref(), agent, target, progress)
            .await
    }

    /// Run one workflow step by ID. Legal when the step's agent is what
    /// the global stage machine would run next, or when the step already
    /// ran (completed or failed) and the project has reached its draft
    /// stage; a re-run rewinds the stage to that draft and writes a new
    /// artifact version.
    pub async fn run_step(&self, step_id: i64, progress: ProgressFn) -> Result<RunOutcome> {
        let (step, project_id) = self.storage.get_step(step_id).await?;
        let lock = self.project_lock(project_id);
        let _guard = lock.lock().await;

        let project = self.storage.get_project(project_id).await?;
        let agent: AgentKey = step.agent_key.parse()?;
        let draft = draft_stage_for_agent(agent);
        let rerunnable = matches!(step.status, StepStatus::Completed | StepStatus::Failed)
            && project.stage.index() >= draft.index();
        let target = match project
            .stage
            .run_next_target()
            .filter(|t| t.agent_for_draft() == Some(agent))
        {
            Some(target) => target,
            None if rerunnable => draft,
            None => {
                return Err(CaseworkError::IllegalTransition(format!(
                    "Step \"{}\" cannot run while the project is at stage \"{}\"",
                    step.name, project.stage
                )))
            }
        };

        self.run_agent_step(&project, Some(&step), agent, target, progress)
            .await
    }

    async fn run_agent_step(
        &self,
        project: &Project,
        step: Option<&InstanceStep>,
        agent: AgentKey,
        target: Stage,
        progress: ProgressFn,
    ) -> Result<RunOutcome> {
        let step_id = step.map(|s| s.id);
        if let Some(id) = step_id {
            self.storage
                .update_step_status(id, StepStatus::Running, None)
                .await?;
        }

        // capture progress messages for the step's chat transcript
        let captured: Arc<std::sync::Mutex<Vec<(String, String)>>> =
            Arc::new(std::sync::Mutex::new(Vec::new()));
        let progress: ProgressFn = if step_id.is_some() {
            let inner = progress;
            let sink = captured.clone();
            Arc::new(move |message: &str, kind: &str| {
                inner(message, kind);
                if let Ok(mut rows) = sink.lock() {
                    rows.push((kind.to_string(), message.to_string()));
                }
            })
        } else {
            progress
        };
        let log_id = self
            .storage
            .insert_run_log(
                project.id,
                step_id,
                agent.as_str(),
                "pending",
                "",
                &self.model.model_used(),
            )
            .await?;

        let output = match self.run_agent(project, agent, &progress).await {
            Ok(output) => output,
            Err(e) => {
                let message = format!("Agent failed: {e}");
                if let Some(id) = step_id {
                    self.storage
                        .update_step_status(id, StepStatus::Failed, Some(&message))
                        .await?;
                    self.flush_progress_log(id, &captured).await;
                }
                self.storage
                    .update_run_log(log_id, "failed", &message, None)
                    .await?;
                return Err(CaseworkError::agent_failed(e));
            }
        };
        if let Some(id) = step_id {
            self.flush_progress_log(id, &captured).await;
        }

        let (title, payload, summary) = self.persist_output(project, &output).await?;
        self.storage.update_project_stage(project.id, target).await?;

        let envelope = wrap_deliverable_content(WrapInput {
            payload,
            agent_key: Some(agent.as_str().to_string()),
            step_id,
            deliverable_title: Some(title.clone()),
        });
        let deliverable = self
            .storage
            .create_deliverable(project.id, step_id, &title, &envelope)
            .await?;

        if let Some(id) = step_id {
            self.storage
                .update_step_status(id, StepStatus::Completed, None)
                .await?;
        }
        self.storage
            .update_run_log(log_id, "success", &summary, Some(&envelope))
            .await?;

        let project = self.storage.get_project(project.id).await?;
        Ok(RunOutcome {
            project,
            deliverable: Some(deliverable),
        })
    }

    /// Append captured progress messages to the step's chat transcript.
    /// Best-effort: a failed insert is logged, never fatal.
    async fn flush_progress_log(
        &self,
        step_id: i64,
        captured: &std::sync::Mutex<Vec<(String, String)>>,
    ) {
        let rows = match captured.lock() {
            Ok(mut rows) => std::mem::take(&mut *rows),
            Err(_) => return,
        };
        for (kind, message) in rows {
            if let Err(e) = self.storage.insert_chat_message(step_id, &kind, &message).await {
                tracing::warn!(step_id, error = %e, "failed to record progress message");
            }
        }
    }

    async fn find_step(&self, project_id: i64, agent: AgentKey) -> Result<Option<InstanceStep>> {
        let instance = match self.storage.instance_for_project(project_id).await {
            Ok(instance) => instance,
            Err(CaseworkError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(instance
            .steps
            .into_iter()
            .find(|s| s.agent_key == agent.as_str()))
    }

    async fn run_agent(
        &self,
        project: &Project,
        agent: AgentKey,
        progress: &ProgressFn,
    ) -> Result<AgentOutput> {
        let settings = self.agent_settings(agent).await?;
        let rag_context = gather_context(
            self.retriever.as_ref(),
            project.id,
            &project.objective,
            DEFAULT_MAX_CHUNKS,
        )
        .await;
        let ctx = AgentContext {
            model: self.model.as_ref(),
            settings,
            progress: progress.clone(),
            rag_context,
        };

        match agent {
            AgentKey::ProjectDefinition => {
                let def =
                    project_definition_agent(&ctx, &project.objective, &project.constraints_text)
                        .await?;
                Ok(AgentOutput::Definition(def))
            }
            AgentKey::IssuesTree => {
                let outcome =
                    run_issues_with_critic(&ctx, &project.objective, &project.constraints_text)
                        .await?;
                Ok(AgentOutput::Issues(outcome))
            }
            AgentKey::Hypothesis => {
                let version = self
                    .storage
                    .latest_issue_version(project.id)
                    .await?
                    .ok_or_else(|| CaseworkError::Invalid("No issues tree available".into()))?;
                let nodes = self.storage.list_issue_nodes(project.id, version).await?;
                let issues: Vec<IssueRef> = nodes
                    .into_iter()
                    .map(|n| IssueRef {
                        id: n.id,
                        text: n.text,
                        priority: n.priority,
                    })
                    .collect();
                let payload = hypothesis_agent(&ctx, &issues).await?;
                Ok(AgentOutput::Hypotheses(payload))
            }
            AgentKey::Execution => {
                let version = self
                    .storage
                    .latest_hypothesis_version(project.id)
                    .await?
                    .ok_or_else(|| CaseworkError::Invalid("No analysis plan available".into()))?;
                let entries = self.storage.list_plan_entries(project.id, version).await?;

                let mut plans = Vec::with_capacity(entries.len());
                let mut hypothesis_ids = Vec::with_capacity(entries.len());
                for entry in entries {
                    let input: ScenarioInput = serde_json::from_value(entry.parameters)
                        .map_err(|e| CaseworkError::Parse(e.to_string()))?;
                    validate_scenario_input(&input)?;
                    plans.push(input);
                    hypothesis_ids.push(entry.hypothesis_id);
                }

                let records = execution_agent(&plans, progress);
                let paired = hypothesis_ids
                    .into_iter()
                    .map(Some)
                    .zip(records)
                    .map(|(id, rec)| (id, rec))
                    .collect();
                Ok(AgentOutput::Execution(paired))
            }
            AgentKey::Summary => {
                let results = self.hypothesis_results(project.id).await?;
                let payload = summary_agent(
                    &ctx,
                    &project.objective,
                    &project.constraints_text,
                    &results,
                )
                .await?;
                Ok(AgentOutput::Summary(payload))
            }
            AgentKey::Presentation => {
                let results = self.hypothesis_results(project.id).await?;
                let narrative = self.storage.latest_narrative(project.id).await?;
                let payload = presentation_agent(
                    &ctx,
                    &project.name,
                    &project.objective,
                    narrative.as_ref().map(|n| n.summary_text.as_str()),
                    &results,
                )
                .await?;
                Ok(AgentOutput::Presentation(payload))
            }
            AgentKey::MeceCritic => Err(CaseworkError::Invalid(
                "mece_critic is not a standalone pipeline step".into(),
            )),
        }
    }

    /// Join hypotheses with their latest scenario results for the summary
    /// and presentation prompts.
    async fn hypothesis_results(&self, project_id: i64) -> Result<Vec<HypothesisResult>> {
        let Some(version) = self.storage.latest_hypothesis_version(project_id).await? else {
            return Ok(Vec::new());
        };
        let hypotheses = self.storage.list_hypotheses(project_id, version).await?;

        let runs = match self.storage.latest_model_run_version(project_id).await? {
            Some(run_version) => self.storage.list_model_runs(project_id, run_version).await?,
            None => Vec::new(),
        };

        Ok(hypotheses
            .into_iter()
            .map(|h| {
                let run_summary = runs
                    .iter()
                    .find(|r| r.hypothesis_id == Some(h.id))
                    .and_then(|r| r.outputs.get("summary").cloned());
                HypothesisResult {
                    statement: h.statement,
                    metric: h.metric,
                    run_summary,
                }
            })
            .collect())
    }

    /// Persist agent output to its artifact tables and return the
    /// deliverable title, payload, and run-log summary line.
    async fn persist_output(
        &self,
        project: &Project,
        output: &AgentOutput,
    ) -> Result<(String, Value, String)> {
        match output {
            AgentOutput::Definition(def) => {
                let payload =
                    serde_json::to_value(def).map_err(|e| CaseworkError::Parse(e.to_string()))?;
                Ok((
                    "Project Definition".to_string(),
                    payload,
                    "Generated project definition".to_string(),
                ))
            }
            AgentOutput::Issues(outcome) => {
                let version = self.storage.next_issue_version(project.id).await?;
                let report: TreeInsertReport = self
                    .storage
                    .insert_issue_tree(project.id, version, &outcome.issues)
                    .await?;
                let stored = self.storage.list_issue_nodes(project.id, version).await?;

                let payload = json!({
                    "issues": stored,
                    "criticLog": outcome.critic_log,
                    "nodeReport": report,
                });
                Ok((
                    "Issues Tree".to_string(),
                    payload,
                    format!(
                        "Inserted {} issue nodes ({} dropped)",
                        report.inserted, report.dropped
                    ),
                ))
            }
            AgentOutput::Hypotheses(payload) => {
                let version = self.storage.next_hypothesis_version(project.id).await?;
                self.storage
                    .insert_hypotheses_with_plan(project.id, version, payload)
                    .await?;
                let hypotheses = self.storage.list_hypotheses(project.id, version).await?;
                let plan = self.storage.list_plan_entries(project.id, version).await?;

                let count = hypotheses.len();
                let body = json!({
                    "hypotheses": hypotheses,
                    "analysisPlan": plan,
                });
                Ok((
                    "Hypotheses & Analysis Plan".to_string(),
                    body,
                    format!("Generated {count} hypotheses"),
                ))
            }
            AgentOutput::Execution(records) => {
                let version = self.storage.next_model_run_version(project.id).await?;
                let rows: Vec<(Option<i64>, String, Value, Value)> = records
                    .iter()
                    .map(|(hypothesis_id, rec)| {
                        Ok((
                            *hypothesis_id,
                            rec.tool_name.clone(),
                            serde_json::to_value(&rec.inputs)
                                .map_err(|e| CaseworkError::Parse(e.to_string()))?,
                            serde_json::to_value(&rec.outputs)
                                .map_err(|e| CaseworkError::Parse(e.to_string()))?,
                        ))
                    })
                    .collect::<Result<_>>()?;
                self.storage.insert_model_runs(project.id, version, &rows).await?;
                let stored = self.storage.list_model_runs(project.id, version).await?;

                let payload = json!({ "results": stored });
                Ok((
                    "Execution Results".to_string(),
                    payload,
                    format!("Ran {} scenario analyses", records.len()),
                ))
            }
            AgentOutput::Summary(summary) => {
                self.storage
                    .insert_narrative(project.id, &summary.summary_text)
                    .await?;
                let payload = json!({ "summaryText": summary.summary_text });
                Ok((
                    "Executive Summary".to_string(),
                    payload,
                    "Generated executive summary".to_string(),
                ))
            }
            AgentOutput::Presentation(slides) => {
                let rows: Vec<(i64, String, String, Option<String>, Value, Option<String>)> =
                    slides
                        .slides
                        .iter()
                        .map(|s| {
                            (
                                s.slide_index,
                                s.layout.clone(),
                                s.title.clone(),
                                s.subtitle.clone(),
                                s.body_json.clone(),
                                s.notes_text.clone(),
                            )
                        })
                        .collect();
                let version = self.storage.insert_slides(project.id, &rows).await?;
                let stored = self.storage.list_slides(project.id, version).await?;

                let payload = json!({ "slides": stored });
                Ok((
                    "Presentation Deck".to_string(),
                    payload,
                    format!("Generated {} slides", rows.len()),
                ))
            }
        }
    }

    // ------------------------------------------------------------------
    // Approval and redo
    // ------------------------------------------------------------------

    pub async fn approve(&self, project_id: i64) -> Result<Project> {
        let lock = self.project_lock(project_id);
        let _guard = lock.lock().await;

        let project = self.storage.get_project(project_id).await?;
        let target = project.stage.approve_target().ok_or_else(|| {
            CaseworkError::IllegalTransition(format!(
                "Cannot approve from stage \"{}\"",
                project.stage
            ))
        })?;

        if let Some(agent) = project.stage.agent_for_draft() {
            if let Some(step) = self.find_step(project_id, agent).await? {
                self.storage
                    .update_step_status(step.id, StepStatus::Approved, None)
                    .await?;
                if let Some(deliverable) = self.storage.latest_deliverable_for_step(step.id).await? {
                    self.storage.set_deliverable_locked(deliverable.id, true).await?;
                }
            }
        }

        self.storage.update_project_stage(project_id, target).await?;
        self.storage.get_project(project_id).await
    }

    pub async fn unapprove(&self, project_id: i64) -> Result<Project> {
        let lock = self.project_lock(project_id);
        let _guard = lock.lock().await;

        let project = self.storage.get_project(project_id).await?;
        let target = project.stage.unapprove_target().ok_or_else(|| {
            CaseworkError::IllegalTransition(format!(
                "Cannot unapprove from stage \"{}\"",
                project.stage
            ))
        })?;

        if let Some(agent) = target.agent_for_draft() {
            if let Some(step) = self.find_step(project_id, agent).await? {
                self.storage
                    .update_step_status(step.id, StepStatus::Completed, None)
                    .await?;
                if let Some(deliverable) = self.storage.latest_deliverable_for_step(step.id).await? {
                    self.storage.set_deliverable_locked(deliverable.id, false).await?;
                }
            }
        }

        self.storage.update_project_stage(project_id, target).await?;
        self.storage.get_project(project_id).await
    }

    /// Rewind to just before the named step's draft stage. Existing
    /// artifact versions are kept; re-running writes a new version.
    pub async fn redo(&self, project_id: i64, step: RedoStep) -> Result<Project> {
        let lock = self.project_lock(project_id);
        let _guard = lock.lock().await;

        let project = self.storage.get_project(project_id).await?;
        if project.stage.index() < step.draft_stage().index() {
            return Err(CaseworkError::IllegalTransition(format!(
                "Cannot redo \"{}\": the step has not run yet (stage \"{}\")",
                step.as_str(),
                project.stage
            )));
        }

        // reset this step and everything after it
        if let Ok(instance) = self.storage.instance_for_project(project_id).await {
            let rewind_index = step.draft_stage().index();
            for s in &instance.steps {
                let agent: AgentKey = s.agent_key.parse()?;
                let step_draft = draft_stage_for_agent(agent);
                if step_draft.index() >= rewind_index && s.status != StepStatus::NotStarted {
                    self.storage
                        .update_step_status(s.id, StepStatus::NotStarted, None)
                        .await?;
                }
            }
        }

        self.storage
            .update_project_stage(project_id, step.rewind_target())
            .await?;
        self.storage.get_project(project_id).await
    }

    // ------------------------------------------------------------------
    // Step-level approval and refinement
    // ------------------------------------------------------------------

    pub async fn approve_step(&self, step_id: i64) -> Result<InstanceStep> {
        let (step, project_id) = self.storage.get_step(step_id).await?;
        let lock = self.project_lock(project_id);
        let _guard = lock.lock().await;

        if step.status != StepStatus::Completed {
            return Err(CaseworkError::IllegalTransition(format!(
                "Cannot approve step with status \"{}\"",
                step.status.as_str()
            )));
        }

        self.storage
            .update_step_status(step_id, StepStatus::Approved, None)
            .await?;
        if let Some(deliverable) = self.storage.latest_deliverable_for_step(step_id).await? {
            self.storage.set_deliverable_locked(deliverable.id, true).await?;
        }

        // keep the global stage in sync when this step is the current draft
        let project = self.storage.get_project(project_id).await?;
        let agent: AgentKey = step.agent_key.parse()?;
        if project.stage.agent_for_draft() == Some(agent) {
            if let Some(target) = project.stage.approve_target() {
                self.storage.update_project_stage(project_id, target).await?;
            }
        }

        let (step, _) = self.storage.get_step(step_id).await?;
        Ok(step)
    }

    /// Undo a step approval. Refused while any later step has started:
    /// downstream work already depends on this artifact.
    pub async fn unapprove_step(&self, step_id: i64) -> Result<InstanceStep> {
        let (step, project_id) = self.storage.get_step(step_id).await?;
        let lock = self.project_lock(project_id);
        let _guard = lock.lock().await;

        if step.status != StepStatus::Approved {
            return Err(CaseworkError::IllegalTransition(format!(
                "Cannot unapprove step with status \"{}\"",
                step.status.as_str()
            )));
        }
        let later = self.storage.steps_after(step_id).await?;
        if later.iter().any(|s| s.status != StepStatus::NotStarted) {
            return Err(CaseworkError::IllegalTransition(
                "Cannot unapprove: later steps have already started".into(),
            ));
        }

        self.storage
            .update_step_status(step_id, StepStatus::Completed, None)
            .await?;
        if let Some(deliverable) = self.storage.latest_deliverable_for_step(step_id).await? {
            self.storage.set_deliverable_locked(deliverable.id, false).await?;
        }

        let project = self.storage.get_project(project_id).await?;
        let agent: AgentKey = step.agent_key.parse()?;
        if let Some(target) = project.stage.unapprove_target() {
            if target.agent_for_draft() == Some(agent) {
                self.storage.update_project_stage(project_id, target).await?;
            }
        }

        let (step, _) = self.storage.get_step(step_id).await?;
        Ok(step)
    }

    /// Apply user feedback to a completed step's deliverable in place.
    /// Chat history is best-effort: a failed history write never fails the
    /// refinement itself.
    pub async fn refine_step(
        &self,
        step_id: i64,
        feedback: &str,
        progress: ProgressFn,
    ) -> Result<Deliverable> {
        let (step, project_id) = self.storage.get_step(step_id).await?;
        let lock = self.project_lock(project_id);
        let _guard = lock.lock().await;

        if !matches!(step.status, StepStatus::Completed | StepStatus::Approved) {
            return Err(CaseworkError::IllegalTransition(format!(
                "Cannot refine step with status \"{}\"",
                step.status.as_str()
            )));
        }

        let project = self.storage.get_project(project_id).await?;
        let deliverable = self
            .storage
            .latest_deliverable_for_step(step_id)
            .await?
            .ok_or(CaseworkError::NotFound("Deliverable"))?;
        if deliverable.locked {
            return Err(CaseworkError::IllegalTransition(
                "Deliverable is locked; unapprove the step first".into(),
            ));
        }

        if let Err(e) = self.storage.insert_chat_message(step_id, "user", feedback).await {
            tracing::warn!(step_id, error = %e, "failed to record chat message");
        }

        let agent: AgentKey = step.agent_key.parse()?;
        let settings = self.agent_settings(agent).await?;
        let ctx = AgentContext {
            model: self.model.as_ref(),
            settings,
            progress,
            rag_context: String::new(),
        };

        let current = unwrap_deliverable_content(&deliverable.content).clone();
        let refined = refine_agent(
            &ctx,
            agent,
            &current,
            feedback,
            &project.objective,
            &project.constraints_text,
        )
        .await?;

        let updated = update_deliverable_envelope(
            &deliverable.content,
            WrapInput {
                payload: refined,
                agent_key: Some(agent.as_str().to_string()),
                step_id: Some(step_id),
                deliverable_title: Some(deliverable.title.clone()),
            },
        );
        self.storage
            .update_deliverable_content(deliverable.id, &updated)
            .await?;

        if let Err(e) = self
            .storage
            .insert_chat_message(
                step_id,
                "assistant",
                "I've updated the deliverable based on your feedback.",
            )
            .await
        {
            tracing::warn!(step_id, error = %e, "failed to record chat message");
        }

        self.storage.get_deliverable(deliverable.id).await
    }

    // ------------------------------------------------------------------
    // Read side
    // ------------------------------------------------------------------

    /// Latest version of every artifact for a project, for the artifacts
    /// read API.
    pub async fn artifacts(&self, project_id: i64) -> Result<Value> {
        self.storage.get_project(project_id).await?;

        let issues = match self.storage.latest_issue_version(project_id).await? {
            Some(v) => self.storage.list_issue_nodes(project_id, v).await?,
            None => Vec::new(),
        };
        let hypotheses = match self.storage.latest_hypothesis_version(project_id).await? {
            Some(v) => self.storage.list_hypotheses(project_id, v).await?,
            None => Vec::new(),
        };
        let model_runs = match self.storage.latest_model_run_version(project_id).await? {
            Some(v) => self.storage.list_model_runs(project_id, v).await?,
            None => Vec::new(),
        };
        let narrative = self.storage.latest_narrative(project_id).await?;
        let slides = match self.storage.latest_slide_version(project_id).await? {
            Some(v) => self.storage.list_slides(project_id, v).await?,
            None => Vec::new(),
        };

        Ok(json!({
            "issues": issues,
            "hypotheses": hypotheses,
            "modelRuns": model_runs,
            "narrative": narrative,
            "slides": slides,
        }))
    }
}

fn draft_stage_for_agent(agent: AgentKey) -> Stage {
    match agent {
        AgentKey::ProjectDefinition => Stage::DefinitionDraft,
        AgentKey::IssuesTree => Stage::IssuesDraft,
        AgentKey::Hypothesis => Stage::HypothesesDraft,
        AgentKey::Execution => Stage::ExecutionDone,
        AgentKey::Summary => Stage::SummaryDraft,
        AgentKey::Presentation => Stage::PresentationDraft,
        AgentKey::MeceCritic => Stage::IssuesDraft,
    }
}

fn validate_scenario_input(input: &ScenarioInput) -> Result<()> {
    if !(input.baseline_revenue.is_finite() && input.baseline_revenue >= 0.0) {
        return Err(CaseworkError::Invalid(
            "baselineRevenue must be a non-negative number".into(),
        ));
    }
    if !(0.0..=1.0).contains(&input.growth_rate.abs()) {
        return Err(CaseworkError::Invalid("growthRate must be within [-1, 1]".into()));
    }
    if !(0.0..=1.0).contains(&input.cost_reduction) {
        return Err(CaseworkError::Invalid("costReduction must be within [0, 1]".into()));
    }
    if input.time_horizon_years == 0 || input.time_horizon_years > 50 {
        return Err(CaseworkError::Invalid(
            "timeHorizonYears must be between 1 and 50".into(),
        ));
    }
    if !(0.0..=1.0).contains(&input.volatility) {
        return Err(CaseworkError::Invalid("volatility must be within [0, 1]".into()));
    }
    Ok(())
}
