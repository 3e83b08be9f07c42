// Global project stage machine
//
// A project moves through a fixed total order of stages. Three operations
// exist: run-next (invoke the next agent, advance to its draft stage),
// approve (draft -> approved, last approval -> complete), and redo
// (rewind to just before a step's draft stage). Every transition is table
// driven; anything not in a table is rejected without mutation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::agents::AgentKey;
use crate::error::CaseworkError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Created,
    DefinitionDraft,
    DefinitionApproved,
    IssuesDraft,
    IssuesApproved,
    HypothesesDraft,
    HypothesesApproved,
    ExecutionDone,
    ExecutionApproved,
    SummaryDraft,
    SummaryApproved,
    PresentationDraft,
    Complete,
}

pub const STAGE_ORDER: [Stage; 13] = [
    Stage::Created,
    Stage::DefinitionDraft,
    Stage::DefinitionApproved,
    Stage::IssuesDraft,
    Stage::IssuesApproved,
    Stage::HypothesesDraft,
    Stage::HypothesesApproved,
    Stage::ExecutionDone,
    Stage::ExecutionApproved,
    Stage::SummaryDraft,
    Stage::SummaryApproved,
    Stage::PresentationDraft,
    Stage::Complete,
];

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Created => "created",
            Stage::DefinitionDraft => "definition_draft",
            Stage::DefinitionApproved => "definition_approved",
            Stage::IssuesDraft => "issues_draft",
            Stage::IssuesApproved => "issues_approved",
            Stage::HypothesesDraft => "hypotheses_draft",
            Stage::HypothesesApproved => "hypotheses_approved",
            Stage::ExecutionDone => "execution_done",
            Stage::ExecutionApproved => "execution_approved",
            Stage::SummaryDraft => "summary_draft",
            Stage::SummaryApproved => "summary_approved",
            Stage::PresentationDraft => "presentation_draft",
            Stage::Complete => "complete",
        }
    }

    /// Position in the total order.
    pub fn index(&self) -> usize {
        STAGE_ORDER.iter().position(|s| s == self).expect("stage in order")
    }

    /// Draft stage reached by running the next agent from this stage, or
    /// None when running is illegal from here.
    pub fn run_next_target(&self) -> Option<Stage> {
        match self {
            Stage::Created => Some(Stage::DefinitionDraft),
            Stage::DefinitionApproved => Some(Stage::IssuesDraft),
            Stage::IssuesApproved => Some(Stage::HypothesesDraft),
            Stage::HypothesesApproved => Some(Stage::ExecutionDone),
            Stage::ExecutionApproved => Some(Stage::SummaryDraft),
            Stage::SummaryApproved => Some(Stage::PresentationDraft),
            _ => None,
        }
    }

    /// Stage reached by approving this draft stage, or None when approval
    /// is illegal from here. The final approval jumps straight to Complete.
    pub fn approve_target(&self) -> Option<Stage> {
        match self {
            Stage::DefinitionDraft => Some(Stage::DefinitionApproved),
            Stage::IssuesDraft => Some(Stage::IssuesApproved),
            Stage::HypothesesDraft => Some(Stage::HypothesesApproved),
            Stage::ExecutionDone => Some(Stage::ExecutionApproved),
            Stage::SummaryDraft => Some(Stage::SummaryApproved),
            Stage::PresentationDraft => Some(Stage::Complete),
            _ => None,
        }
    }

    /// Inverse of approve_target.
    pub fn unapprove_target(&self) -> Option<Stage> {
        match self {
            Stage::DefinitionApproved => Some(Stage::DefinitionDraft),
            Stage::IssuesApproved => Some(Stage::IssuesDraft),
            Stage::HypothesesApproved => Some(Stage::HypothesesDraft),
            Stage::ExecutionApproved => Some(Stage::ExecutionDone),
            Stage::SummaryApproved => Some(Stage::SummaryDraft),
            Stage::Complete => Some(Stage::PresentationDraft),
            _ => None,
        }
    }

    /// Agent that produces the artifact for this draft stage.
    pub fn agent_for_draft(&self) -> Option<AgentKey> {
        match self {
            Stage::DefinitionDraft => Some(AgentKey::ProjectDefinition),
            Stage::IssuesDraft => Some(AgentKey::IssuesTree),
            Stage::HypothesesDraft => Some(AgentKey::Hypothesis),
            Stage::ExecutionDone => Some(AgentKey::Execution),
            Stage::SummaryDraft => Some(AgentKey::Summary),
            Stage::PresentationDraft => Some(AgentKey::Presentation),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = CaseworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        STAGE_ORDER
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| CaseworkError::Invalid(format!("unknown stage \"{s}\"")))
    }
}

/// Named pipeline steps a user can ask to redo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedoStep {
    Definition,
    Issues,
    Hypotheses,
    Execution,
    Summary,
    Presentation,
}

impl RedoStep {
    /// Stage the project rewinds to: one stage before this step's draft.
    pub fn rewind_target(&self) -> Stage {
        match self {
            RedoStep::Definition => Stage::Created,
            RedoStep::Issues => Stage::DefinitionApproved,
            RedoStep::Hypotheses => Stage::IssuesApproved,
            RedoStep::Execution => Stage::HypothesesApproved,
            RedoStep::Summary => Stage::ExecutionApproved,
            RedoStep::Presentation => Stage::SummaryApproved,
        }
    }

    /// Draft stage this step produces; redo is legal only when the project
    /// has reached at least this stage (i.e. the step has actually run).
    pub fn draft_stage(&self) -> Stage {
        match self {
            RedoStep::Definition => Stage::DefinitionDraft,
            RedoStep::Issues => Stage::IssuesDraft,
            RedoStep::Hypotheses => Stage::HypothesesDraft,
            RedoStep::Execution => Stage::ExecutionDone,
            RedoStep::Summary => Stage::SummaryDraft,
            RedoStep::Presentation => Stage::PresentationDraft,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RedoStep::Definition => "definition",
            RedoStep::Issues => "issues",
            RedoStep::Hypotheses => "hypotheses",
            RedoStep::Execution => "execution",
            RedoStep::Summary => "summary",
            RedoStep::Presentation => "presentation",
        }
    }
}

impl FromStr for RedoStep {
    type Err = CaseworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "definition" => Ok(RedoStep::Definition),
            "issues" => Ok(RedoStep::Issues),
            "hypotheses" => Ok(RedoStep::Hypotheses),
            "execution" => Ok(RedoStep::Execution),
            "summary" => Ok(RedoStep::Summary),
            "presentation" => Ok(RedoStep::Presentation),
            other => Err(CaseworkError::Invalid(format!("Invalid step \"{other}\""))),
        }
    }
}

/// Per-step status, independent of the global project stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    NotStarted,
    Running,
    Completed,
    Failed,
    Approved,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::NotStarted => "not_started",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Approved => "approved",
        }
    }
}

impl FromStr for StepStatus {
    type Err = CaseworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(StepStatus::NotStarted),
            "running" => Ok(StepStatus::Running),
            "completed" => Ok(StepStatus::Completed),
            "failed" => Ok(StepStatus::Failed),
            "approved" => Ok(StepStatus::Approved),
            other => Err(CaseworkError::Invalid(format!("unknown step status \"{other}\""))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_order_is_strict() {
        for pair in STAGE_ORDER.windows(2) {
            assert!(pair[0].index() < pair[1].index());
        }
    }

    #[test]
    fn test_run_next_advances_one_draft() {
        assert_eq!(Stage::Created.run_next_target(), Some(Stage::DefinitionDraft));
        assert_eq!(Stage::SummaryApproved.run_next_target(), Some(Stage::PresentationDraft));
        assert_eq!(Stage::Complete.run_next_target(), None);
        assert_eq!(Stage::DefinitionDraft.run_next_target(), None);
    }

    #[test]
    fn test_approve_unapprove_are_inverses() {
        for stage in STAGE_ORDER {
            if let Some(approved) = stage.approve_target() {
                assert_eq!(approved.unapprove_target(), Some(stage));
            }
        }
    }

    #[test]
    fn test_final_approval_completes() {
        assert_eq!(Stage::PresentationDraft.approve_target(), Some(Stage::Complete));
    }

    #[test]
    fn test_redo_rewinds_before_draft() {
        for step in [
            RedoStep::Definition,
            RedoStep::Issues,
            RedoStep::Hypotheses,
            RedoStep::Execution,
            RedoStep::Summary,
            RedoStep::Presentation,
        ] {
            assert_eq!(step.rewind_target().index() + 1, step.draft_stage().index());
        }
    }

    #[test]
    fn test_stage_round_trips_through_strings() {
        for stage in STAGE_ORDER {
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), stage);
        }
    }
}
