// Issues-tree generation with MECE critique
//
// The tree goes through a bounded generate -> critique -> revise loop.
// Every critic verdict is appended to a log that ships with the final
// deliverable, so reviewers can see why a tree was accepted.

use serde::{Deserialize, Serialize};

use super::prompts::{default_prompt, AgentSettings};
use super::{AgentContext, AgentKey, IssueNodeOut, IssuesPayload};
use crate::error::Result;
use crate::llm::CompletionKind;
use crate::parse::extract_typed;

/// Revisions allowed after the first draft. The critic therefore runs at
/// most `MAX_REVISIONS + 1` times per project.
pub const MAX_REVISIONS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Approved,
    Revise,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimensionScore {
    pub score: f64,
    #[serde(default)]
    pub details: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriticScores {
    pub overlap: DimensionScore,
    pub coverage: DimensionScore,
    #[serde(rename = "mixedLogics")]
    pub mixed_logics: DimensionScore,
    #[serde(rename = "branchBalance")]
    pub branch_balance: DimensionScore,
    #[serde(rename = "labelQuality")]
    pub label_quality: DimensionScore,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriticResult {
    pub verdict: Verdict,
    pub scores: CriticScores,
    #[serde(rename = "overallScore")]
    pub overall_score: f64,
    #[serde(rename = "revisionInstructions", default)]
    pub revision_instructions: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriticLogEntry {
    pub iteration: usize,
    pub critic: CriticResult,
}

/// Final tree plus the full critique history.
#[derive(Debug, Clone)]
pub struct IssuesOutcome {
    pub issues: Vec<IssueNodeOut>,
    pub critic_log: Vec<CriticLogEntry>,
}

/// Render the tree the way the critic prompt expects: depth-first with
/// two-space indentation per level, roots first in emission order.
pub fn format_tree_for_critic(objective: &str, nodes: &[IssueNodeOut]) -> String {
    let mut lines = Vec::with_capacity(nodes.len());
    let roots: Vec<&IssueNodeOut> = nodes.iter().filter(|n| n.parent_id.is_none()).collect();
    for root in roots {
        render_subtree(root, nodes, 0, &mut lines);
    }

    format!(
        "Governing Question / Objective: {objective}\n\nIssues Tree ({} nodes):\n{}",
        nodes.len(),
        lines.join("\n")
    )
}

fn render_subtree(node: &IssueNodeOut, all: &[IssueNodeOut], depth: usize, out: &mut Vec<String>) {
    out.push(format!(
        "{}- [{}] {}",
        "  ".repeat(depth),
        node.priority.as_str().to_uppercase(),
        node.text
    ));
    for child in all.iter().filter(|n| n.parent_id.as_deref() == Some(node.id.as_str())) {
        render_subtree(child, all, depth + 1, out);
    }
}

async fn generate_tree(
    ctx: &AgentContext<'_>,
    objective: &str,
    constraints: &str,
    revision: Option<(&[IssueNodeOut], &CriticResult)>,
) -> Result<Vec<IssueNodeOut>> {
    let (user, kind) = match revision {
        None => (
            ctx.with_rag(format!(
                "Project Objective: {objective}\n\nConstraints & Context: {constraints}"
            )),
            CompletionKind::Generate,
        ),
        Some((tree, critique)) => {
            let scores = &critique.scores;
            let prompt = format!(
                "Project Objective: {objective}\n\nConstraints & Context: {constraints}\n\n\
                 Your previous issues tree was reviewed and needs revision.\n\n\
                 Previous tree:\n{}\n\n\
                 Review scores (1-5):\n\
                 - Overlap: {} ({})\n\
                 - Coverage: {} ({})\n\
                 - Mixed logics: {} ({})\n\
                 - Branch balance: {} ({})\n\
                 - Label quality: {} ({})\n\n\
                 Revision instructions: {}\n\n\
                 Produce a revised issues tree addressing every instruction. \
                 Return the complete tree in the same JSON format.",
                format_tree_for_critic(objective, tree),
                scores.overlap.score,
                scores.overlap.details,
                scores.coverage.score,
                scores.coverage.details,
                scores.mixed_logics.score,
                scores.mixed_logics.details,
                scores.branch_balance.score,
                scores.branch_balance.details,
                scores.label_quality.score,
                scores.label_quality.details,
                critique.revision_instructions,
            );
            (prompt, CompletionKind::Revise)
        }
    };

    let raw = ctx
        .model
        .complete(ctx.request(AgentKey::IssuesTree, user, kind))
        .await?;
    let payload: IssuesPayload = extract_typed(&raw)?;
    Ok(payload.issues)
}

/// Evaluate a tree. A malformed critic response never fails the pipeline:
/// it degrades to a synthetic approval so the tree stands as-is.
async fn critique_tree(
    ctx: &AgentContext<'_>,
    objective: &str,
    tree: &[IssueNodeOut],
) -> Result<CriticResult> {
    let settings = AgentSettings {
        system_prompt: default_prompt(AgentKey::MeceCritic).to_string(),
        ..ctx.settings.clone()
    };
    let raw = ctx
        .model
        .complete(crate::llm::CompletionRequest {
            agent_key: AgentKey::MeceCritic,
            system: settings.system_prompt,
            user: format_tree_for_critic(objective, tree),
            model: settings.model,
            max_tokens: settings.max_tokens,
            kind: CompletionKind::Generate,
        })
        .await?;

    match extract_typed::<CriticResult>(&raw) {
        Ok(result) => Ok(result),
        Err(e) => {
            tracing::warn!(error = %e, "critic output unparseable, approving tree as-is");
            Ok(synthetic_approval())
        }
    }
}

fn synthetic_approval() -> CriticResult {
    let neutral = || DimensionScore {
        score: 3.0,
        details: "Critic evaluation failed; default score.".to_string(),
    };
    CriticResult {
        verdict: Verdict::Approved,
        scores: CriticScores {
            overlap: neutral(),
            coverage: neutral(),
            mixed_logics: neutral(),
            branch_balance: neutral(),
            label_quality: neutral(),
        },
        overall_score: 3.0,
        revision_instructions: String::new(),
    }
}

/// Generate an issues tree and run it through the critique loop.
///
/// At most `MAX_REVISIONS` regenerations happen after the initial draft;
/// when the budget runs out the last tree is accepted regardless of the
/// final verdict, with the full log preserved.
pub async fn run_issues_with_critic(
    ctx: &AgentContext<'_>,
    objective: &str,
    constraints: &str,
) -> Result<IssuesOutcome> {
    let progress = &ctx.progress;
    progress("Starting Issues Tree agent...", "status");

    progress(&format!("Calling LLM with model {}...", ctx.settings.model), "llm");
    let mut tree = generate_tree(ctx, objective, constraints, None).await?;
    progress(&format!("Generated issues tree with {} nodes.", tree.len()), "status");

    let mut critic_log = Vec::new();
    for iteration in 0..=MAX_REVISIONS {
        progress(
            &format!("Running MECE critique (iteration {})...", iteration + 1),
            "critic",
        );
        let critique = critique_tree(ctx, objective, &tree).await?;
        let approved = critique.verdict == Verdict::Approved;
        critic_log.push(CriticLogEntry {
            iteration,
            critic: critique.clone(),
        });

        if approved {
            progress(
                &format!("Tree approved by critic (score {}).", critique.overall_score),
                "critic",
            );
            break;
        }
        if iteration == MAX_REVISIONS {
            progress("Revision budget exhausted, accepting current tree.", "critic");
            break;
        }

        progress(
            &format!("Critic requested revision (score {}), regenerating...", critique.overall_score),
            "critic",
        );
        tree = generate_tree(ctx, objective, constraints, Some((&tree, &critique))).await?;
        progress(&format!("Revised issues tree has {} nodes.", tree.len()), "status");
    }

    progress(
        &format!("Analysis complete. Final tree has {} nodes.", tree.len()),
        "status",
    );
    Ok(IssuesOutcome { issues: tree, critic_log })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{silent_progress, Priority};
    use crate::error::CaseworkError;
    use crate::llm::{CompletionRequest, FixtureModel, LanguageModel};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn node(id: &str, parent: Option<&str>, text: &str, priority: Priority) -> IssueNodeOut {
        IssueNodeOut {
            id: id.to_string(),
            parent_id: parent.map(|p| p.to_string()),
            text: text.to_string(),
            priority,
        }
    }

    fn ctx<'a>(model: &'a dyn LanguageModel) -> AgentContext<'a> {
        AgentContext {
            model,
            settings: AgentSettings::default_for(AgentKey::IssuesTree),
            progress: silent_progress(),
            rag_context: String::new(),
        }
    }

    /// Always answers "revise" to the critic prompt, valid trees otherwise.
    struct AlwaysRevise {
        critic_calls: AtomicUsize,
        tree_calls: AtomicUsize,
    }

    #[async_trait]
    impl LanguageModel for AlwaysRevise {
        fn model_used(&self) -> String {
            "mock".into()
        }

        async fn complete(&self, req: CompletionRequest) -> crate::error::Result<String> {
            match req.agent_key {
                AgentKey::MeceCritic => {
                    self.critic_calls.fetch_add(1, Ordering::SeqCst);
                    Ok(r#"{
                        "verdict": "revise",
                        "scores": {
                            "overlap": {"score": 2, "details": "siblings overlap"},
                            "coverage": {"score": 3, "details": ""},
                            "mixedLogics": {"score": 3, "details": ""},
                            "branchBalance": {"score": 3, "details": ""},
                            "labelQuality": {"score": 2, "details": "vague"}
                        },
                        "overallScore": 2.6,
                        "revisionInstructions": "Split the revenue branch."
                    }"#
                    .to_string())
                }
                _ => {
                    self.tree_calls.fetch_add(1, Ordering::SeqCst);
                    Ok(r#"{"issues":[{"id":"1","parentId":null,"text":"Root","priority":"high"}]}"#
                        .to_string())
                }
            }
        }
    }

    /// Critic that returns prose instead of JSON.
    struct BrokenCritic;

    #[async_trait]
    impl LanguageModel for BrokenCritic {
        fn model_used(&self) -> String {
            "mock".into()
        }

        async fn complete(&self, req: CompletionRequest) -> crate::error::Result<String> {
            match req.agent_key {
                AgentKey::MeceCritic => Ok("The tree looks fine to me.".to_string()),
                _ => Ok(
                    r#"{"issues":[{"id":"1","parentId":null,"text":"Root","priority":"high"}]}"#
                        .to_string(),
                ),
            }
        }
    }

    /// Generation that never yields parseable JSON.
    struct BrokenGenerator;

    #[async_trait]
    impl LanguageModel for BrokenGenerator {
        fn model_used(&self) -> String {
            "mock".into()
        }

        async fn complete(&self, _req: CompletionRequest) -> crate::error::Result<String> {
            Ok("no json here at all".to_string())
        }
    }

    #[tokio::test]
    async fn test_loop_terminates_after_max_revisions() {
        let model = AlwaysRevise {
            critic_calls: AtomicUsize::new(0),
            tree_calls: AtomicUsize::new(0),
        };
        let outcome = run_issues_with_critic(&ctx(&model), "obj", "cons").await.unwrap();

        // initial draft + MAX_REVISIONS revisions, one critique each
        assert_eq!(model.critic_calls.load(Ordering::SeqCst), MAX_REVISIONS + 1);
        assert_eq!(model.tree_calls.load(Ordering::SeqCst), MAX_REVISIONS + 1);
        assert_eq!(outcome.critic_log.len(), MAX_REVISIONS + 1);
        assert_eq!(outcome.critic_log.last().unwrap().critic.verdict, Verdict::Revise);
    }

    #[tokio::test]
    async fn test_early_exit_on_approval() {
        let model = FixtureModel::new();
        let outcome = run_issues_with_critic(&ctx(&model), "obj", "cons").await.unwrap();

        assert_eq!(outcome.critic_log.len(), 1);
        assert_eq!(outcome.critic_log[0].critic.verdict, Verdict::Approved);
        assert!(!outcome.issues.is_empty());
    }

    #[tokio::test]
    async fn test_unparseable_critic_degrades_to_approval() {
        let outcome = run_issues_with_critic(&ctx(&BrokenCritic), "obj", "cons")
            .await
            .unwrap();

        assert_eq!(outcome.critic_log.len(), 1);
        assert_eq!(outcome.critic_log[0].critic.verdict, Verdict::Approved);
        assert_eq!(outcome.critic_log[0].critic.overall_score, 3.0);
    }

    #[tokio::test]
    async fn test_unparseable_tree_fails() {
        let err = run_issues_with_critic(&ctx(&BrokenGenerator), "obj", "cons")
            .await
            .unwrap_err();
        assert!(matches!(err, CaseworkError::Parse(_)));
    }

    #[test]
    fn test_tree_render_indents_by_depth() {
        let nodes = vec![
            node("1", None, "Revenue", Priority::High),
            node("2", Some("1"), "Pricing", Priority::Medium),
            node("3", Some("2"), "Discount policy", Priority::Low),
            node("4", None, "Costs", Priority::High),
        ];
        let rendered = format_tree_for_critic("Grow margin", &nodes);

        assert!(rendered.starts_with("Governing Question / Objective: Grow margin"));
        assert!(rendered.contains("Issues Tree (4 nodes):"));
        assert!(rendered.contains("- [HIGH] Revenue"));
        assert!(rendered.contains("\n  - [MEDIUM] Pricing"));
        assert!(rendered.contains("\n    - [LOW] Discount policy"));
        assert!(rendered.contains("\n- [HIGH] Costs"));
    }
}
