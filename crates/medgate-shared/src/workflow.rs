//! Named multi-step workflows.
//!
//! A workflow is an ordered chain of task steps run through the single-call
//! contract. Access is gated by role before the first step runs; execution
//! stops at the first failing step.

use crate::error::MediatorError;
use crate::packet::Role;
use crate::request::{ProcessRequest, TaskKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub task: TaskKind,
    /// Instruction prepended to the caller's input for this step
    pub instruction: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    pub description: String,
    pub required_roles: Vec<Role>,
    pub steps: Vec<WorkflowStep>,
}

impl WorkflowDefinition {
    pub fn permits(&self, role: &str) -> bool {
        Role::parse(role)
            .map(|r| self.required_roles.contains(&r))
            .unwrap_or(false)
    }

    pub fn check_access(&self, role: &str) -> Result<(), MediatorError> {
        if self.permits(role) {
            return Ok(());
        }
        let allowed: Vec<&str> = self.required_roles.iter().map(|r| r.as_str()).collect();
        Err(MediatorError::PermissionDenied(format!(
            "workflow '{}' requires one of [{}], caller role is '{}'",
            self.name,
            allowed.join(", "),
            role
        )))
    }

    /// Request for step `index`, chaining the previous step's output
    pub fn step_request(&self, index: usize, base: &ProcessRequest, previous_output: Option<&str>) -> Option<ProcessRequest> {
        let step = self.steps.get(index)?;
        let mut req = base.clone();
        req.task = Some(step.task);

        let mut input = format!("{}\n\n{}", step.instruction, base.input);
        if let Some(prev) = previous_output {
            input.push_str("\n\n[Previous step output]\n");
            input.push_str(prev);
        }
        req.input = input;
        Some(req)
    }
}

fn step(task: TaskKind, instruction: &str) -> WorkflowStep {
    WorkflowStep {
        task,
        instruction: instruction.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct WorkflowCatalog {
    workflows: BTreeMap<String, WorkflowDefinition>,
}

impl Default for WorkflowCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl WorkflowCatalog {
    pub fn empty() -> Self {
        Self {
            workflows: BTreeMap::new(),
        }
    }

    pub fn builtin() -> Self {
        let mut catalog = Self::empty();
        catalog.register(WorkflowDefinition {
            name: "oncology_case_review".to_string(),
            description: "Summarize, support diagnosis, and propose a treatment plan".to_string(),
            required_roles: vec![Role::Clinician, Role::Oncologist],
            steps: vec![
                step(TaskKind::ClinicalSummary, "Summarize the oncology case."),
                step(TaskKind::DiagnosisSupport, "Assess staging and differential diagnosis."),
                step(TaskKind::TreatmentPlan, "Propose a treatment plan consistent with the assessment."),
            ],
        });
        catalog.register(WorkflowDefinition {
            name: "patient_discharge".to_string(),
            description: "Discharge summary followed by patient instructions".to_string(),
            required_roles: vec![Role::Clinician, Role::Nurse, Role::Oncologist],
            steps: vec![
                step(TaskKind::Documentation, "Draft the discharge summary."),
                step(TaskKind::PatientEducation, "Write discharge instructions in plain language."),
            ],
        });
        catalog.register(WorkflowDefinition {
            name: "lab_review".to_string(),
            description: "Interpret lab results and summarize for the chart".to_string(),
            required_roles: vec![Role::Clinician, Role::Oncologist, Role::Nurse, Role::Technician],
            steps: vec![
                step(TaskKind::LabInterpretation, "Interpret these laboratory results."),
                step(TaskKind::ClinicalSummary, "Summarize the interpretation for the chart."),
            ],
        });
        catalog.register(WorkflowDefinition {
            name: "research_synthesis".to_string(),
            description: "Literature answer condensed into a summary".to_string(),
            required_roles: vec![Role::Researcher, Role::Oncologist, Role::Admin],
            steps: vec![
                step(TaskKind::ResearchQuery, "Answer the research question with citations."),
                step(TaskKind::ClinicalSummary, "Condense the findings into a short synthesis."),
            ],
        });
        catalog
    }

    /// Insert or replace a definition
    pub fn register(&mut self, def: WorkflowDefinition) {
        self.workflows.insert(def.name.clone(), def);
    }

    pub fn get(&self, name: &str) -> Result<&WorkflowDefinition, MediatorError> {
        self.workflows
            .get(name)
            .ok_or_else(|| MediatorError::UnknownWorkflow(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.workflows.keys().map(|k| k.as_str())
    }
}
