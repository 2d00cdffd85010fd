//! Workflow execution tests

mod common;

use common::{harness, shared_registry};
use medgate_shared::audit::AuditFilter;
use medgate_shared::request::{ProcessRequest, TaskKind};
use medgated::provider::{FakeGenerator, FakeReply};
use std::sync::Arc;

fn base(role: &str) -> ProcessRequest {
    ProcessRequest::new("u-wf", role, "oncology", TaskKind::ClinicalSummary, "58F, stage II breast cancer")
}

#[tokio::test]
async fn test_nurse_denied_oncology_review() {
    let fake = Arc::new(FakeGenerator::always("ok"));
    let h = harness(shared_registry(fake.clone()));

    let result = h.mediator.execute_workflow("oncology_case_review", base("nurse")).await;

    assert!(!result.success);
    assert!(result.results.is_empty());
    assert_eq!(result.error.unwrap().code, "PERMISSION_DENIED");
    assert_eq!(fake.call_count(), 0);
}

#[tokio::test]
async fn test_unknown_workflow() {
    let h = harness(shared_registry(Arc::new(FakeGenerator::always("ok"))));
    let result = h.mediator.execute_workflow("tumor_board", base("oncologist")).await;
    assert!(!result.success);
    assert_eq!(result.error.unwrap().code, "UNKNOWN_WORKFLOW");
}

#[tokio::test]
async fn test_steps_chain_previous_output() {
    let fake = Arc::new(FakeGenerator::scripted(vec![
        FakeReply::text("SUMMARY-OUT"),
        FakeReply::text("DIAGNOSIS-OUT"),
        FakeReply::text("PLAN-OUT"),
    ]));
    let h = harness(shared_registry(fake.clone()));

    let result = h.mediator.execute_workflow("oncology_case_review", base("oncologist")).await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.results.len(), 3);
    let outputs: Vec<&str> = result.results.iter().filter_map(|r| r.output.as_deref()).collect();
    assert_eq!(outputs, vec!["SUMMARY-OUT", "DIAGNOSIS-OUT", "PLAN-OUT"]);

    let prompts = fake.prompts();
    assert!(!prompts[0].contains("[Previous step output]"));
    assert!(prompts[1].contains("[Previous step output]\nSUMMARY-OUT"));
    assert!(prompts[2].contains("[Previous step output]\nDIAGNOSIS-OUT"));
    assert!(prompts[2].contains(TaskKind::TreatmentPlan.intent()));

    // One audit record per step
    let records = h.mediator.get_audit_log(&AuditFilter::default()).await.unwrap();
    assert_eq!(records.len(), 3);
}

#[tokio::test]
async fn test_stops_at_first_failing_step() {
    // Step one succeeds, then the whole cascade fails for step two
    let fake = Arc::new(FakeGenerator::scripted(vec![
        FakeReply::text("SUMMARY-OUT"),
        FakeReply::fail("down"),
        FakeReply::fail("down"),
        FakeReply::fail("down"),
        FakeReply::fail("down"),
    ]));
    let h = harness(shared_registry(fake.clone()));

    let result = h.mediator.execute_workflow("oncology_case_review", base("oncologist")).await;

    assert!(!result.success);
    assert_eq!(result.results.len(), 1);
    assert_eq!(result.results[0].output.as_deref(), Some("SUMMARY-OUT"));
    assert_eq!(result.error.unwrap().code, "ALL_MODELS_FAILED");
    // Step three never ran
    assert_eq!(fake.call_count(), 5);
}
