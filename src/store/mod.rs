// Persistence layer
//
// SQLite with WAL mode behind an async mutex. Every write that touches
// more than one row runs inside a single transaction so a failure never
// leaves a half-written artifact.

use anyhow::Context;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::agents::{HypothesesPayload, IssueNodeOut};
use crate::error::{CaseworkError, Result};
use crate::stage::{Stage, StepStatus};

/// Worklist passes allowed when inserting an issue tree whose nodes may
/// reference parents that appear later in the list.
const MAX_INSERT_PASSES: usize = 10;

fn conversion_err(idx: usize, e: CaseworkError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub objective: String,
    pub constraints_text: String,
    pub stage: Stage,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTemplate {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub steps: Vec<TemplateStep>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateStep {
    pub id: i64,
    pub step_index: i64,
    pub name: String,
    pub agent_key: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInstance {
    pub id: i64,
    pub project_id: i64,
    pub template_id: i64,
    pub status: String,
    pub steps: Vec<InstanceStep>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStep {
    pub id: i64,
    pub instance_id: i64,
    pub step_index: i64,
    pub name: String,
    pub agent_key: String,
    pub status: StepStatus,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Deliverable {
    pub id: i64,
    pub project_id: i64,
    pub step_id: Option<i64>,
    pub title: String,
    pub content: Value,
    pub version: i64,
    pub locked: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueNode {
    pub id: i64,
    pub project_id: i64,
    pub version: i64,
    pub parent_id: Option<i64>,
    pub text: String,
    pub priority: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Hypothesis {
    pub id: i64,
    pub project_id: i64,
    pub version: i64,
    pub issue_node_id: Option<i64>,
    pub statement: String,
    pub metric: String,
    pub data_source: String,
    pub method: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanEntry {
    pub id: i64,
    pub hypothesis_id: i64,
    pub method: String,
    pub parameters: Value,
    pub required_dataset: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRun {
    pub id: i64,
    pub project_id: i64,
    pub version: i64,
    pub hypothesis_id: Option<i64>,
    pub tool_name: String,
    pub inputs: Value,
    pub outputs: Value,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Narrative {
    pub id: i64,
    pub project_id: i64,
    pub version: i64,
    pub summary_text: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Slide {
    pub id: i64,
    pub project_id: i64,
    pub version: i64,
    pub slide_index: i64,
    pub layout: String,
    pub title: String,
    pub subtitle: Option<String>,
    pub body_json: Value,
    pub notes_text: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunLog {
    pub id: i64,
    pub project_id: i64,
    pub step_id: Option<i64>,
    pub agent_key: String,
    pub status: String,
    pub message: String,
    pub output_json: Option<Value>,
    pub model_used: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: i64,
    pub step_id: i64,
    pub role: String,
    pub content: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub agent_key: String,
    pub system_prompt: String,
    pub model: String,
    pub max_tokens: u32,
}

/// Result of a multi-pass tree insertion. `dropped` counts nodes whose
/// parent reference never resolved; the caller reports them, it does not
/// fail the step.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TreeInsertReport {
    pub inserted: usize,
    pub dropped: usize,
}

#[derive(Clone)]
pub struct Storage {
    db: Arc<Mutex<Connection>>,
}

impl Storage {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let schema = include_str!("schema.sql");
        conn.execute_batch(schema)?;

        tracing::info!("database initialized: {}", path.display());

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    // ------------------------------------------------------------------
    // Projects
    // ------------------------------------------------------------------

    pub async fn create_project(
        &self,
        name: &str,
        objective: &str,
        constraints: &str,
    ) -> Result<Project> {
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO projects (name, objective, constraints_text) VALUES (?1, ?2, ?3)",
            params![name, objective, constraints],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_project(id).await
    }

    pub async fn get_project(&self, id: i64) -> Result<Project> {
        let conn = self.db.lock().await;
        conn.query_row(
            "SELECT id, name, objective, constraints_text, stage, created_at
             FROM projects WHERE id = ?1",
            [id],
            row_to_project,
        )
        .optional()?
        .ok_or(CaseworkError::NotFound("Project"))
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, name, objective, constraints_text, stage, created_at
             FROM projects ORDER BY id DESC",
        )?;
        let rows = stmt
            .query_map([], row_to_project)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub async fn update_project_stage(&self, id: i64, stage: Stage) -> Result<()> {
        let conn = self.db.lock().await;
        let changed = conn.execute(
            "UPDATE projects SET stage = ?1 WHERE id = ?2",
            params![stage.as_str(), id],
        )?;
        if changed == 0 {
            return Err(CaseworkError::NotFound("Project"));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Workflow templates and instances
    // ------------------------------------------------------------------

    /// Seed the default template when the table is empty. Idempotent.
    pub async fn ensure_default_template(&self, steps: &[(&str, &str)]) -> Result<i64> {
        let mut conn = self.db.lock().await;
        if let Some(id) = conn
            .query_row(
                "SELECT id FROM workflow_templates WHERE name = 'Consulting Analysis'",
                [],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
        {
            return Ok(id);
        }

        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO workflow_templates (name, description)
             VALUES ('Consulting Analysis', 'Structured decision analysis from definition to presentation')",
            [],
        )?;
        let template_id = tx.last_insert_rowid();
        for (idx, (name, agent_key)) in steps.iter().enumerate() {
            tx.execute(
                "INSERT INTO workflow_template_steps (template_id, step_index, name, agent_key)
                 VALUES (?1, ?2, ?3, ?4)",
                params![template_id, idx as i64, name, agent_key],
            )?;
        }
        tx.commit()?;
        Ok(template_id)
    }

    pub async fn list_templates(&self) -> Result<Vec<WorkflowTemplate>> {
        let conn = self.db.lock().await;
        let mut stmt =
            conn.prepare("SELECT id, name, description FROM workflow_templates ORDER BY id")?;
        let templates = stmt
            .query_map([], |row| {
                Ok(WorkflowTemplate {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    description: row.get(2)?,
                    steps: Vec::new(),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut out = Vec::with_capacity(templates.len());
        let mut step_stmt = conn.prepare(
            "SELECT id, step_index, name, agent_key FROM workflow_template_steps
             WHERE template_id = ?1 ORDER BY step_index",
        )?;
        for mut template in templates {
            template.steps = step_stmt
                .query_map([template.id], |row| {
                    Ok(TemplateStep {
                        id: row.get(0)?,
                        step_index: row.get(1)?,
                        name: row.get(2)?,
                        agent_key: row.get(3)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            out.push(template);
        }
        Ok(out)
    }

    /// Instantiate a template for a project, copying its steps in one
    /// transaction.
    pub async fn create_instance(&self, project_id: i64, template_id: i64) -> Result<i64> {
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;

        let steps: Vec<(i64, String, String)> = {
            let mut stmt = tx.prepare(
                "SELECT step_index, name, agent_key FROM workflow_template_steps
                 WHERE template_id = ?1 ORDER BY step_index",
            )?;
            let rows = stmt
                .query_map([template_id], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        if steps.is_empty() {
            return Err(CaseworkError::NotFound("Workflow template"));
        }

        tx.execute(
            "INSERT INTO workflow_instances (project_id, template_id) VALUES (?1, ?2)",
            params![project_id, template_id],
        )?;
        let instance_id = tx.last_insert_rowid();
        for (step_index, name, agent_key) in steps {
            tx.execute(
                "INSERT INTO workflow_instance_steps (instance_id, step_index, name, agent_key)
                 VALUES (?1, ?2, ?3, ?4)",
                params![instance_id, step_index, name, agent_key],
            )?;
        }
        tx.commit()?;
        Ok(instance_id)
    }

    pub async fn instance_for_project(&self, project_id: i64) -> Result<WorkflowInstance> {
        let conn = self.db.lock().await;
        let instance = conn
            .query_row(
                "SELECT id, project_id, template_id, status FROM workflow_instances
                 WHERE project_id = ?1 ORDER BY id DESC LIMIT 1",
                [project_id],
                |row| {
                    Ok(WorkflowInstance {
                        id: row.get(0)?,
                        project_id: row.get(1)?,
                        template_id: row.get(2)?,
                        status: row.get(3)?,
                        steps: Vec::new(),
                    })
                },
            )
            .optional()?
            .ok_or(CaseworkError::NotFound("Workflow instance"))?;

        let mut stmt = conn.prepare(
            "SELECT id, instance_id, step_index, name, agent_key, status, error_message
             FROM workflow_instance_steps WHERE instance_id = ?1 ORDER BY step_index",
        )?;
        let steps = stmt
            .query_map([instance.id], row_to_step)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(WorkflowInstance { steps, ..instance })
    }

    pub async fn get_step(&self, step_id: i64) -> Result<(InstanceStep, i64)> {
        let conn = self.db.lock().await;
        conn.query_row(
            "SELECT s.id, s.instance_id, s.step_index, s.name, s.agent_key, s.status,
                    s.error_message, i.project_id
             FROM workflow_instance_steps s
             JOIN workflow_instances i ON i.id = s.instance_id
             WHERE s.id = ?1",
            [step_id],
            |row| Ok((row_to_step(row)?, row.get::<_, i64>(7)?)),
        )
        .optional()?
        .ok_or(CaseworkError::NotFound("Workflow step"))
    }

    pub async fn steps_after(&self, step_id: i64) -> Result<Vec<InstanceStep>> {
        let (step, _) = self.get_step(step_id).await?;
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, instance_id, step_index, name, agent_key, status, error_message
             FROM workflow_instance_steps
             WHERE instance_id = ?1 AND step_index > ?2 ORDER BY step_index",
        )?;
        let steps = stmt
            .query_map(params![step.instance_id, step.step_index], row_to_step)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(steps)
    }

    pub async fn update_step_status(
        &self,
        step_id: i64,
        status: StepStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let conn = self.db.lock().await;
        let changed = conn.execute(
            "UPDATE workflow_instance_steps SET status = ?1, error_message = ?2 WHERE id = ?3",
            params![status.as_str(), error_message, step_id],
        )?;
        if changed == 0 {
            return Err(CaseworkError::NotFound("Workflow step"));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Issue trees
    // ------------------------------------------------------------------

    pub async fn next_issue_version(&self, project_id: i64) -> Result<i64> {
        let conn = self.db.lock().await;
        let version: i64 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM issue_nodes WHERE project_id = ?1",
            [project_id],
            |row| row.get(0),
        )?;
        Ok(version)
    }

    /// Insert a tree whose nodes carry model-assigned string IDs and may
    /// arrive in any order. Nodes are inserted over repeated passes as
    /// their parents resolve; whatever is left after the pass budget is
    /// dropped and counted. The whole insertion is one transaction.
    pub async fn insert_issue_tree(
        &self,
        project_id: i64,
        version: i64,
        nodes: &[IssueNodeOut],
    ) -> Result<TreeInsertReport> {
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;

        let mut id_map: HashMap<&str, i64> = HashMap::new();
        let mut pending: Vec<&IssueNodeOut> = nodes.iter().collect();
        let mut inserted = 0usize;

        for _ in 0..MAX_INSERT_PASSES {
            if pending.is_empty() {
                break;
            }
            let mut deferred = Vec::new();
            let mut progressed = false;

            for node in pending {
                let parent_db_id = match node.parent_id.as_deref() {
                    None => None,
                    Some(parent) => match id_map.get(parent) {
                        Some(&db_id) => Some(db_id),
                        None => {
                            deferred.push(node);
                            continue;
                        }
                    },
                };

                tx.execute(
                    "INSERT INTO issue_nodes (project_id, version, parent_id, text, priority)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        project_id,
                        version,
                        parent_db_id,
                        node.text,
                        node.priority.as_str()
                    ],
                )?;
                id_map.insert(node.id.as_str(), tx.last_insert_rowid());
                inserted += 1;
                progressed = true;
            }

            pending = deferred;
            if !progressed {
                break;
            }
        }

        let dropped = pending.len();
        if dropped > 0 {
            tracing::warn!(project_id, dropped, "issue nodes dropped: unresolved parent references");
        }
        tx.commit()?;
        Ok(TreeInsertReport { inserted, dropped })
    }

    pub async fn list_issue_nodes(&self, project_id: i64, version: i64) -> Result<Vec<IssueNode>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, project_id, version, parent_id, text, priority FROM issue_nodes
             WHERE project_id = ?1 AND version = ?2 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![project_id, version], |row| {
                Ok(IssueNode {
                    id: row.get(0)?,
                    project_id: row.get(1)?,
                    version: row.get(2)?,
                    parent_id: row.get(3)?,
                    text: row.get(4)?,
                    priority: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub async fn latest_issue_version(&self, project_id: i64) -> Result<Option<i64>> {
        let conn = self.db.lock().await;
        let version: Option<i64> = conn.query_row(
            "SELECT MAX(version) FROM issue_nodes WHERE project_id = ?1",
            [project_id],
            |row| row.get(0),
        )?;
        Ok(version)
    }

    // ------------------------------------------------------------------
    // Hypotheses and analysis plan
    // ------------------------------------------------------------------

    pub async fn next_hypothesis_version(&self, project_id: i64) -> Result<i64> {
        let conn = self.db.lock().await;
        let version: i64 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM hypotheses WHERE project_id = ?1",
            [project_id],
            |row| row.get(0),
        )?;
        Ok(version)
    }

    /// Insert hypotheses and their plan entries in one transaction. Plan
    /// entries pointing at an out-of-range hypothesis index are dropped
    /// with a warning rather than failing the batch.
    pub async fn insert_hypotheses_with_plan(
        &self,
        project_id: i64,
        version: i64,
        payload: &HypothesesPayload,
    ) -> Result<Vec<i64>> {
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;

        let mut hypothesis_ids = Vec::with_capacity(payload.hypotheses.len());
        for hyp in &payload.hypotheses {
            // dangling issue references degrade to NULL rather than
            // violating the foreign key
            let issue_node_id: Option<i64> = match hyp
                .issue_node_id
                .as_deref()
                .and_then(|s| s.parse::<i64>().ok())
            {
                Some(id) => {
                    let exists: bool = tx.query_row(
                        "SELECT EXISTS(SELECT 1 FROM issue_nodes WHERE id = ?1)",
                        [id],
                        |row| row.get(0),
                    )?;
                    exists.then_some(id)
                }
                None => None,
            };
            tx.execute(
                "INSERT INTO hypotheses (project_id, version, issue_node_id, statement, metric, data_source, method)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    project_id,
                    version,
                    issue_node_id,
                    hyp.statement,
                    hyp.metric,
                    hyp.data_source,
                    hyp.method
                ],
            )?;
            hypothesis_ids.push(tx.last_insert_rowid());
        }

        for plan in &payload.analysis_plan {
            let Some(&hypothesis_id) = hypothesis_ids.get(plan.hypothesis_index) else {
                tracing::warn!(
                    project_id,
                    hypothesis_index = plan.hypothesis_index,
                    "analysis plan entry dropped: hypothesis index out of range"
                );
                continue;
            };
            let parameters = serde_json::to_string(&plan.parameters)
                .map_err(|e| CaseworkError::Parse(e.to_string()))?;
            tx.execute(
                "INSERT INTO analysis_plan (project_id, version, hypothesis_id, method, parameters, required_dataset)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    project_id,
                    version,
                    hypothesis_id,
                    plan.method,
                    parameters,
                    plan.required_dataset
                ],
            )?;
        }

        tx.commit()?;
        Ok(hypothesis_ids)
    }

    pub async fn list_hypotheses(&self, project_id: i64, version: i64) -> Result<Vec<Hypothesis>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, project_id, version, issue_node_id, statement, metric, data_source, method
             FROM hypotheses WHERE project_id = ?1 AND version = ?2 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![project_id, version], |row| {
                Ok(Hypothesis {
                    id: row.get(0)?,
                    project_id: row.get(1)?,
                    version: row.get(2)?,
                    issue_node_id: row.get(3)?,
                    statement: row.get(4)?,
                    metric: row.get(5)?,
                    data_source: row.get(6)?,
                    method: row.get(7)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub async fn latest_hypothesis_version(&self, project_id: i64) -> Result<Option<i64>> {
        let conn = self.db.lock().await;
        let version: Option<i64> = conn.query_row(
            "SELECT MAX(version) FROM hypotheses WHERE project_id = ?1",
            [project_id],
            |row| row.get(0),
        )?;
        Ok(version)
    }

    pub async fn list_plan_entries(&self, project_id: i64, version: i64) -> Result<Vec<PlanEntry>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, hypothesis_id, method, parameters, required_dataset FROM analysis_plan
             WHERE project_id = ?1 AND version = ?2 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![project_id, version], |row| {
                let raw: String = row.get(3)?;
                let parameters = serde_json::from_str(&raw).map_err(|e| {
                    conversion_err(3, CaseworkError::Parse(e.to_string()))
                })?;
                Ok(PlanEntry {
                    id: row.get(0)?,
                    hypothesis_id: row.get(1)?,
                    method: row.get(2)?,
                    parameters,
                    required_dataset: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Model runs, narratives, slides
    // ------------------------------------------------------------------

    pub async fn next_model_run_version(&self, project_id: i64) -> Result<i64> {
        let conn = self.db.lock().await;
        let version: i64 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM model_runs WHERE project_id = ?1",
            [project_id],
            |row| row.get(0),
        )?;
        Ok(version)
    }

    pub async fn insert_model_runs(
        &self,
        project_id: i64,
        version: i64,
        runs: &[(Option<i64>, String, Value, Value)],
    ) -> Result<()> {
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;
        for (hypothesis_id, tool_name, inputs, outputs) in runs {
            tx.execute(
                "INSERT INTO model_runs (project_id, version, hypothesis_id, tool_name, inputs, outputs)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    project_id,
                    version,
                    hypothesis_id,
                    tool_name,
                    inputs.to_string(),
                    outputs.to_string()
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub async fn list_model_runs(&self, project_id: i64, version: i64) -> Result<Vec<ModelRun>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, project_id, version, hypothesis_id, tool_name, inputs, outputs, created_at
             FROM model_runs WHERE project_id = ?1 AND version = ?2 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![project_id, version], |row| {
                let inputs_raw: String = row.get(5)?;
                let outputs_raw: String = row.get(6)?;
                let inputs = serde_json::from_str(&inputs_raw)
                    .map_err(|e| conversion_err(5, CaseworkError::Parse(e.to_string())))?;
                let outputs = serde_json::from_str(&outputs_raw)
                    .map_err(|e| conversion_err(6, CaseworkError::Parse(e.to_string())))?;
                Ok(ModelRun {
                    id: row.get(0)?,
                    project_id: row.get(1)?,
                    version: row.get(2)?,
                    hypothesis_id: row.get(3)?,
                    tool_name: row.get(4)?,
                    inputs,
                    outputs,
                    created_at: row.get(7)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub async fn latest_model_run_version(&self, project_id: i64) -> Result<Option<i64>> {
        let conn = self.db.lock().await;
        let version: Option<i64> = conn.query_row(
            "SELECT MAX(version) FROM model_runs WHERE project_id = ?1",
            [project_id],
            |row| row.get(0),
        )?;
        Ok(version)
    }

    pub async fn insert_narrative(&self, project_id: i64, summary_text: &str) -> Result<i64> {
        let conn = self.db.lock().await;
        let version: i64 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM narratives WHERE project_id = ?1",
            [project_id],
            |row| row.get(0),
        )?;
        conn.execute(
            "INSERT INTO narratives (project_id, version, summary_text) VALUES (?1, ?2, ?3)",
            params![project_id, version, summary_text],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn latest_narrative(&self, project_id: i64) -> Result<Option<Narrative>> {
        let conn = self.db.lock().await;
        let row = conn
            .query_row(
                "SELECT id, project_id, version, summary_text, created_at FROM narratives
                 WHERE project_id = ?1 ORDER BY version DESC LIMIT 1",
                [project_id],
                |row| {
                    Ok(Narrative {
                        id: row.get(0)?,
                        project_id: row.get(1)?,
                        version: row.get(2)?,
                        summary_text: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub async fn insert_slides(
        &self,
        project_id: i64,
        slides: &[(i64, String, String, Option<String>, Value, Option<String>)],
    ) -> Result<i64> {
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;
        let version: i64 = tx.query_row(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM slides WHERE project_id = ?1",
            [project_id],
            |row| row.get(0),
        )?;
        for (slide_index, layout, title, subtitle, body_json, notes_text) in slides {
            tx.execute(
                "INSERT INTO slides (project_id, version, slide_index, layout, title, subtitle, body_json, notes_text)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    project_id,
                    version,
                    slide_index,
                    layout,
                    title,
                    subtitle,
                    body_json.to_string(),
                    notes_text
                ],
            )?;
        }
        tx.commit()?;
        Ok(version)
    }

    pub async fn list_slides(&self, project_id: i64, version: i64) -> Result<Vec<Slide>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, project_id, version, slide_index, layout, title, subtitle, body_json, notes_text
             FROM slides WHERE project_id = ?1 AND version = ?2 ORDER BY slide_index",
        )?;
        let rows = stmt
            .query_map(params![project_id, version], |row| {
                let body_raw: String = row.get(7)?;
                let body_json = serde_json::from_str(&body_raw)
                    .map_err(|e| conversion_err(7, CaseworkError::Parse(e.to_string())))?;
                Ok(Slide {
                    id: row.get(0)?,
                    project_id: row.get(1)?,
                    version: row.get(2)?,
                    slide_index: row.get(3)?,
                    layout: row.get(4)?,
                    title: row.get(5)?,
                    subtitle: row.get(6)?,
                    body_json,
                    notes_text: row.get(8)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub async fn latest_slide_version(&self, project_id: i64) -> Result<Option<i64>> {
        let conn = self.db.lock().await;
        let version: Option<i64> = conn.query_row(
            "SELECT MAX(version) FROM slides WHERE project_id = ?1",
            [project_id],
            |row| row.get(0),
        )?;
        Ok(version)
    }

    // ------------------------------------------------------------------
    // Deliverables
    // ------------------------------------------------------------------

    pub async fn create_deliverable(
        &self,
        project_id: i64,
        step_id: Option<i64>,
        title: &str,
        content: &Value,
    ) -> Result<Deliverable> {
        let conn = self.db.lock().await;
        let version: i64 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM deliverables
             WHERE project_id = ?1 AND step_id IS ?2",
            params![project_id, step_id],
            |row| row.get(0),
        )?;
        conn.execute(
            "INSERT INTO deliverables (project_id, step_id, title, content, version)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![project_id, step_id, title, content.to_string(), version],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_deliverable(id).await
    }

    pub async fn get_deliverable(&self, id: i64) -> Result<Deliverable> {
        let conn = self.db.lock().await;
        conn.query_row(
            "SELECT id, project_id, step_id, title, content, version, locked, created_at
             FROM deliverables WHERE id = ?1",
            [id],
            row_to_deliverable,
        )
        .optional()?
        .ok_or(CaseworkError::NotFound("Deliverable"))
    }

    pub async fn latest_deliverable_for_step(&self, step_id: i64) -> Result<Option<Deliverable>> {
        let conn = self.db.lock().await;
        let row = conn
            .query_row(
                "SELECT id, project_id, step_id, title, content, version, locked, created_at
                 FROM deliverables WHERE step_id = ?1 ORDER BY version DESC LIMIT 1",
                [step_id],
                row_to_deliverable,
            )
            .optional()?;
        Ok(row)
    }

    pub async fn list_deliverables(&self, project_id: i64) -> Result<Vec<Deliverable>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, project_id, step_id, title, content, version, locked, created_at
             FROM deliverables WHERE project_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map([project_id], row_to_deliverable)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub async fn update_deliverable_content(&self, id: i64, content: &Value) -> Result<()> {
        let conn = self.db.lock().await;
        let changed = conn.execute(
            "UPDATE deliverables SET content = ?1 WHERE id = ?2",
            params![content.to_string(), id],
        )?;
        if changed == 0 {
            return Err(CaseworkError::NotFound("Deliverable"));
        }
        Ok(())
    }

    pub async fn set_deliverable_locked(&self, id: i64, locked: bool) -> Result<()> {
        let conn = self.db.lock().await;
        let changed = conn.execute(
            "UPDATE deliverables SET locked = ?1 WHERE id = ?2",
            params![locked as i64, id],
        )?;
        if changed == 0 {
            return Err(CaseworkError::NotFound("Deliverable"));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Run logs and step chat
    // ------------------------------------------------------------------

    pub async fn insert_run_log(
        &self,
        project_id: i64,
        step_id: Option<i64>,
        agent_key: &str,
        status: &str,
        message: &str,
        model_used: &str,
    ) -> Result<i64> {
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO run_logs (project_id, step_id, agent_key, status, message, model_used)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![project_id, step_id, agent_key, status, message, model_used],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn update_run_log(
        &self,
        id: i64,
        status: &str,
        message: &str,
        output: Option<&Value>,
    ) -> Result<()> {
        let conn = self.db.lock().await;
        conn.execute(
            "UPDATE run_logs SET status = ?1, message = ?2, output_json = ?3 WHERE id = ?4",
            params![status, message, output.map(Value::to_string), id],
        )?;
        Ok(())
    }

    pub async fn list_run_logs(&self, project_id: i64) -> Result<Vec<RunLog>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, project_id, step_id, agent_key, status, message, output_json, model_used, created_at
             FROM run_logs WHERE project_id = ?1 ORDER BY id DESC",
        )?;
        let rows = stmt
            .query_map([project_id], |row| {
                let output_raw: Option<String> = row.get(6)?;
                let output_json = match output_raw {
                    Some(raw) => Some(serde_json::from_str(&raw).map_err(|e| {
                        conversion_err(6, CaseworkError::Parse(e.to_string()))
                    })?),
                    None => None,
                };
                Ok(RunLog {
                    id: row.get(0)?,
                    project_id: row.get(1)?,
                    step_id: row.get(2)?,
                    agent_key: row.get(3)?,
                    status: row.get(4)?,
                    message: row.get(5)?,
                    output_json,
                    model_used: row.get(7)?,
                    created_at: row.get(8)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub async fn insert_chat_message(&self, step_id: i64, role: &str, content: &str) -> Result<i64> {
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO step_chat_messages (step_id, role, content) VALUES (?1, ?2, ?3)",
            params![step_id, role, content],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn list_chat_messages(&self, step_id: i64) -> Result<Vec<ChatMessage>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, step_id, role, content, created_at FROM step_chat_messages
             WHERE step_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map([step_id], |row| {
                Ok(ChatMessage {
                    id: row.get(0)?,
                    step_id: row.get(1)?,
                    role: row.get(2)?,
                    content: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Agent configs
    // ------------------------------------------------------------------

    pub async fn get_agent_config(&self, agent_key: &str) -> Result<Option<AgentConfig>> {
        let conn = self.db.lock().await;
        let row = conn
            .query_row(
                "SELECT agent_key, system_prompt, model, max_tokens FROM agent_configs
                 WHERE agent_key = ?1",
                [agent_key],
                row_to_agent_config,
            )
            .optional()?;
        Ok(row)
    }

    pub async fn list_agent_configs(&self) -> Result<Vec<AgentConfig>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT agent_key, system_prompt, model, max_tokens FROM agent_configs ORDER BY agent_key",
        )?;
        let rows = stmt
            .query_map([], row_to_agent_config)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub async fn upsert_agent_config(&self, config: &AgentConfig) -> Result<()> {
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO agent_configs (agent_key, system_prompt, model, max_tokens)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(agent_key) DO UPDATE SET
                 system_prompt = excluded.system_prompt,
                 model = excluded.model,
                 max_tokens = excluded.max_tokens",
            params![
                config.agent_key,
                config.system_prompt,
                config.model,
                config.max_tokens
            ],
        )?;
        Ok(())
    }
}

fn row_to_project(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
    let stage_raw: String = row.get(4)?;
    let stage = stage_raw.parse().map_err(|e| conversion_err(4, e))?;
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        objective: row.get(2)?,
        constraints_text: row.get(3)?,
        stage,
        created_at: row.get(5)?,
    })
}

fn row_to_step(row: &rusqlite::Row<'_>) -> rusqlite::Result<InstanceStep> {
    let status_raw: String = row.get(5)?;
    let status = status_raw.parse().map_err(|e| conversion_err(5, e))?;
    Ok(InstanceStep {
        id: row.get(0)?,
        instance_id: row.get(1)?,
        step_index: row.get(2)?,
        name: row.get(3)?,
        agent_key: row.get(4)?,
        status,
        error_message: row.get(6)?,
    })
}

fn row_to_deliverable(row: &rusqlite::Row<'_>) -> rusqlite::Result<Deliverable> {
    let content_raw: String = row.get(4)?;
    let content = serde_json::from_str(&content_raw)
        .map_err(|e| conversion_err(4, CaseworkError::Parse(e.to_string())))?;
    Ok(Deliverable {
        id: row.get(0)?,
        project_id: row.get(1)?,
        step_id: row.get(2)?,
        title: row.get(3)?,
        content,
        version: row.get(5)?,
        locked: row.get::<_, i64>(6)? != 0,
        created_at: row.get(7)?,
    })
}

fn row_to_agent_config(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentConfig> {
    Ok(AgentConfig {
        agent_key: row.get(0)?,
        system_prompt: row.get(1)?,
        model: row.get(2)?,
        max_tokens: row.get::<_, i64>(3)? as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{HypothesisOut, PlanEntryOut, Priority};
    use crate::scenario::ScenarioInput;
    use tempfile::TempDir;

    async fn storage() -> (Storage, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Storage::open(&dir.path().join("test.db")).unwrap();
        (store, dir)
    }

    fn node(id: &str, parent: Option<&str>) -> IssueNodeOut {
        IssueNodeOut {
            id: id.to_string(),
            parent_id: parent.map(String::from),
            text: format!("Issue {id}"),
            priority: Priority::Medium,
        }
    }

    #[tokio::test]
    async fn test_project_round_trip() {
        let (store, _dir) = storage().await;
        let project = store.create_project("Acme", "grow", "budget").await.unwrap();
        assert_eq!(project.stage, Stage::Created);

        store
            .update_project_stage(project.id, Stage::DefinitionDraft)
            .await
            .unwrap();
        let loaded = store.get_project(project.id).await.unwrap();
        assert_eq!(loaded.stage, Stage::DefinitionDraft);
    }

    #[tokio::test]
    async fn test_missing_project_is_not_found() {
        let (store, _dir) = storage().await;
        let err = store.get_project(999).await.unwrap_err();
        assert!(matches!(err, CaseworkError::NotFound("Project")));
    }

    #[tokio::test]
    async fn test_tree_insert_resolves_child_before_parent() {
        let (store, _dir) = storage().await;
        let project = store.create_project("p", "o", "c").await.unwrap();

        // child listed before its parent; needs a second pass
        let nodes = vec![node("2", Some("1")), node("1", None), node("3", Some("2"))];
        let report = store.insert_issue_tree(project.id, 1, &nodes).await.unwrap();
        assert_eq!(report.inserted, 3);
        assert_eq!(report.dropped, 0);

        let stored = store.list_issue_nodes(project.id, 1).await.unwrap();
        assert_eq!(stored.len(), 3);
        let roots: Vec<_> = stored.iter().filter(|n| n.parent_id.is_none()).collect();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].text, "Issue 1");
    }

    #[tokio::test]
    async fn test_tree_insert_drops_orphans() {
        let (store, _dir) = storage().await;
        let project = store.create_project("p", "o", "c").await.unwrap();

        let nodes = vec![node("1", None), node("2", Some("missing"))];
        let report = store.insert_issue_tree(project.id, 1, &nodes).await.unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(report.dropped, 1);
        assert_eq!(store.list_issue_nodes(project.id, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_hypotheses_plan_links_by_index() {
        let (store, _dir) = storage().await;
        let project = store.create_project("p", "o", "c").await.unwrap();

        let input = ScenarioInput {
            baseline_revenue: 1_000_000.0,
            growth_rate: 0.1,
            cost_reduction: 0.05,
            time_horizon_years: 5,
            volatility: 0.15,
        };
        let payload = HypothesesPayload {
            hypotheses: vec![
                HypothesisOut {
                    issue_node_id: None,
                    statement: "h1".into(),
                    metric: "NPV".into(),
                    data_source: "model".into(),
                    method: "scenario_analysis".into(),
                },
                HypothesisOut {
                    issue_node_id: None,
                    statement: "h2".into(),
                    metric: "NPV".into(),
                    data_source: "model".into(),
                    method: "scenario_analysis".into(),
                },
            ],
            analysis_plan: vec![
                PlanEntryOut {
                    hypothesis_index: 1,
                    method: "run_scenario_tool".into(),
                    parameters: input.clone(),
                    required_dataset: "".into(),
                },
                // out of range: dropped, not fatal
                PlanEntryOut {
                    hypothesis_index: 7,
                    method: "run_scenario_tool".into(),
                    parameters: input,
                    required_dataset: "".into(),
                },
            ],
        };

        let ids = store
            .insert_hypotheses_with_plan(project.id, 1, &payload)
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);

        let plan = store.list_plan_entries(project.id, 1).await.unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].hypothesis_id, ids[1]);
    }

    #[tokio::test]
    async fn test_deliverable_versions_increment_per_step() {
        let (store, _dir) = storage().await;
        let project = store.create_project("p", "o", "c").await.unwrap();

        let content = serde_json::json!({"type": "summary", "version": 1, "payload": {}});
        let d1 = store
            .create_deliverable(project.id, None, "Summary", &content)
            .await
            .unwrap();
        let d2 = store
            .create_deliverable(project.id, None, "Summary", &content)
            .await
            .unwrap();
        assert_eq!(d1.version, 1);
        assert_eq!(d2.version, 2);
    }

    #[tokio::test]
    async fn test_instance_copies_template_steps() {
        let (store, _dir) = storage().await;
        let project = store.create_project("p", "o", "c").await.unwrap();
        let template_id = store
            .ensure_default_template(&[("Define", "project_definition"), ("Issues", "issues_tree")])
            .await
            .unwrap();

        // idempotent
        let again = store
            .ensure_default_template(&[("Define", "project_definition")])
            .await
            .unwrap();
        assert_eq!(template_id, again);

        store.create_instance(project.id, template_id).await.unwrap();
        let instance = store.instance_for_project(project.id).await.unwrap();
        assert_eq!(instance.steps.len(), 2);
        assert_eq!(instance.steps[0].agent_key, "project_definition");
        assert_eq!(instance.steps[0].status, StepStatus::NotStarted);
    }

    #[tokio::test]
    async fn test_agent_config_upsert() {
        let (store, _dir) = storage().await;
        assert!(store.get_agent_config("summary").await.unwrap().is_none());

        let config = AgentConfig {
            agent_key: "summary".into(),
            system_prompt: "be brief".into(),
            model: "gpt-5-nano".into(),
            max_tokens: 4096,
        };
        store.upsert_agent_config(&config).await.unwrap();
        store
            .upsert_agent_config(&AgentConfig {
                max_tokens: 2048,
                ..config.clone()
            })
            .await
            .unwrap();

        let loaded = store.get_agent_config("summary").await.unwrap().unwrap();
        assert_eq!(loaded.max_tokens, 2048);
        assert_eq!(store.list_agent_configs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_run_log_lifecycle() {
        let (store, _dir) = storage().await;
        let project = store.create_project("p", "o", "c").await.unwrap();
        let log_id = store
            .insert_run_log(project.id, None, "summary", "pending", "", "mock")
            .await
            .unwrap();
        let output = serde_json::json!({"summaryText": "done"});
        store
            .update_run_log(log_id, "success", "done", Some(&output))
            .await
            .unwrap();

        let logs = store.list_run_logs(project.id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, "success");
        assert_eq!(logs[0].message, "done");
        assert_eq!(logs[0].output_json, Some(output));

        // a failed run keeps no output payload
        let failed_id = store
            .insert_run_log(project.id, None, "summary", "pending", "", "mock")
            .await
            .unwrap();
        store
            .update_run_log(failed_id, "failed", "Agent failed: boom", None)
            .await
            .unwrap();
        let logs = store.list_run_logs(project.id).await.unwrap();
        assert_eq!(logs[0].status, "failed");
        assert!(logs[0].output_json.is_none());
    }
}
