use anyhow::Context;
use sled::open;
use std::sync::Arc;
use well_cost::afe::{AfeDetails, AfeStatus, AfeType, AfeUpdate, CostActualInput, LineItemInput, VarianceReview};
use well_cost::approval::{ApprovalMatrixEntry, ApprovalStatus};
use well_cost::economics::{AnalysisStatus, CashFlowInput, Recommendation, ScenarioAdjustment};
use well_cost::interest::{Consent, JibStatus};
use well_cost::service::AnalysisRequest;
use well_cost::{ActionContext, Actor, EngineConfig, TimeStamp, WellCostService};

use tempfile::{TempDir, tempdir};

// Each test gets its own sled database in a temp dir; sled holds a file lock
// per database.
fn service(name: &str) -> anyhow::Result<(TempDir, WellCostService)> {
    service_with(name, EngineConfig::default())
}

fn service_with(name: &str, config: EngineConfig) -> anyhow::Result<(TempDir, WellCostService)> {
    let temp_dir = tempdir()?;
    let db = open(temp_dir.path().join(name))?;
    let service = WellCostService::new(Arc::new(db), config)?;
    Ok((temp_dir, service))
}

fn ctx(user: &str) -> ActionContext {
    let now = TimeStamp::new_with(2025, 6, 2, 9, 0, 0).expect("valid date");
    ActionContext::new(Actor::new(user), now)
}

fn date(month: u32, day: u32) -> TimeStamp<chrono::Utc> {
    TimeStamp::new_with(2025, month, day, 0, 0, 0).expect("valid date")
}

fn details(title: &str, well: &str, cost: f64) -> AfeDetails {
    AfeDetails::new()
        .set_title(title)
        .set_well(well)
        .set_well_type("Onshore")
        .set_estimated_cost(cost)
}

#[test]
fn afe_moves_through_a_two_level_chain() -> anyhow::Result<()> {
    let (_dir, service) = service("two_level.db")?;
    let admin = ctx("admin");
    service.register_matrix_entry(
        ApprovalMatrixEntry::new("SUP", "Superintendent", 0.0, 1_000_000.0, 1, "SUPERINTENDENT")
            .set_approver("sup_1"),
        &admin,
    )?;
    service.register_matrix_entry(
        ApprovalMatrixEntry::new("VP", "VP Drilling", 0.0, 5_000_000.0, 2, "VP").set_approver("vp_1"),
        &admin,
    )?;

    let planner = ctx("planner");
    let afe = service.create_afe(details("Drill A-1", "well_a1", 450_000.0), &planner)?;
    assert_eq!(afe.afe_number, "AFE-2025-00001");
    assert_eq!(afe.status, AfeStatus::Draft);

    // no line items yet
    let err = service.submit_for_approval(&afe.id, &planner).unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");
    assert_eq!(service.get_afe(&afe.id)?.status, AfeStatus::Draft);

    service.add_line_item(&afe.id, LineItemInput::new("DRILLING", "Rig days", 10.0, 30_000.0), &planner)?;
    let afe = service.add_line_item(
        &afe.id,
        LineItemInput::new("COMPLETION", "Frac spread", 1.0, 200_000.0),
        &planner,
    )?;
    assert_eq!(afe.estimated_cost, 500_000.0);

    let afe = service
        .submit_for_approval(&afe.id, &planner)
        .context("AFE failed on submit: ")?;
    assert_eq!(afe.status, AfeStatus::PendingApproval);
    assert_eq!(afe.approval_chain.len(), 2);
    let pending = afe.pending_approval().context("no pending approval")?;
    assert_eq!(pending.level, 1);
    assert_eq!(service.pending_approvals_for("sup_1")?.len(), 1);
    assert!(service.pending_approvals_for("vp_1")?.is_empty());

    // level 1 belongs to the superintendent
    let err = service.approve(&afe.id, None, &ctx("vp_1")).unwrap_err();
    assert_eq!(err.code(), "FORBIDDEN");

    let afe = service.approve(&afe.id, Some("ok".into()), &ctx("sup_1"))?;
    assert_eq!(afe.status, AfeStatus::PendingApproval);
    assert_eq!(afe.pending_approval().map(|a| a.level), Some(2));

    let afe = service
        .approve(&afe.id, Some("within budget".into()), &ctx("vp_1"))
        .context("AFE failed on final approval: ")?;
    assert_eq!(afe.status, AfeStatus::Approved);
    assert_eq!(afe.approved_cost, 500_000.0);
    assert!(afe.pending_approval().is_none());

    // approved headers are locked for ordinary users
    let update = AfeUpdate {
        title: Some("Drill A-1 (rev)".into()),
        ..Default::default()
    };
    let err = service.update_afe(&afe.id, update.clone(), &planner).unwrap_err();
    assert_eq!(err.code(), "FORBIDDEN");
    let afe = service.update_afe(&afe.id, update, &ActionContext::new(Actor::admin("root"), planner.now.clone()))?;
    assert_eq!(afe.title, "Drill A-1 (rev)");

    let afe = service.activate(&afe.id, &planner)?;
    assert_eq!(afe.status, AfeStatus::Active);
    let afe = service.close(&afe.id, &planner)?;
    assert_eq!(afe.status, AfeStatus::Closed);
    assert_eq!(afe.history.len(), 4);

    let err = service
        .post_cost_actual(&afe.id, CostActualInput::new("DRILLING", 10.0, date(6, 3)), &planner)
        .unwrap_err();
    assert_eq!(err.code(), "STATE_ERROR");
    Ok(())
}

#[test]
fn empty_matrix_means_a_single_step() -> anyhow::Result<()> {
    let (_dir, service) = service("single_step.db")?;
    let planner = ctx("planner");
    let afe = service.create_afe(details("Workover", "well_b2", 80_000.0), &planner)?;
    service.add_line_item(&afe.id, LineItemInput::new("WORKOVER", "Rig", 2.0, 40_000.0), &planner)?;
    service.submit_for_approval(&afe.id, &planner)?;

    let afe = service.approve(&afe.id, None, &ctx("anyone"))?;
    assert_eq!(afe.status, AfeStatus::Approved);
    assert_eq!(afe.approvals.len(), 1);

    // nothing left to decide
    let err = service.approve(&afe.id, None, &ctx("anyone")).unwrap_err();
    assert_eq!(err.code(), "STATE_ERROR");
    Ok(())
}

#[test]
fn revision_delegation_and_escalation() -> anyhow::Result<()> {
    let (_dir, service) = service("revision.db")?;
    service.register_matrix_entry(
        ApprovalMatrixEntry::new("SUP", "Superintendent", 0.0, 1_000_000.0, 1, "SUPERINTENDENT")
            .set_approver("sup_1"),
        &ctx("admin"),
    )?;
    let planner = ctx("planner");
    let afe = service.create_afe(details("Drill C-3", "well_c3", 100_000.0), &planner)?;
    service.add_line_item(&afe.id, LineItemInput::new("DRILLING", "Rig", 1.0, 100_000.0), &planner)?;
    service.submit_for_approval(&afe.id, &planner)?;

    let afe = service.return_for_revision(&afe.id, Some("split the rig line".into()), &ctx("sup_1"))?;
    assert_eq!(afe.status, AfeStatus::Revision);
    assert_eq!(afe.revision_comments.as_deref(), Some("split the rig line"));
    assert!(afe.pending_approval().is_none());

    let afe = service.submit_for_approval(&afe.id, &planner)?;
    assert_eq!(afe.status, AfeStatus::PendingApproval);
    assert_eq!(afe.approvals.len(), 2);

    let afe = service.delegate_approval(&afe.id, "deputy", &ctx("sup_1"))?;
    assert_eq!(service.pending_approvals_for("deputy")?.len(), 1);
    let err = service.approve(&afe.id, None, &ctx("sup_1")).unwrap_err();
    assert_eq!(err.code(), "FORBIDDEN");

    let afe = service.escalate_approval(&afe.id, &ctx("planner"))?;
    let pending = afe.pending_approval().context("no pending approval")?;
    assert_eq!(pending.level, 2);
    assert!(pending.is_escalated);

    let afe = service.approve(&afe.id, None, &ctx("deputy"))?;
    assert_eq!(afe.status, AfeStatus::Approved);
    Ok(())
}

#[test]
fn variance_flag_is_raised_accepted_and_raised_again() -> anyhow::Result<()> {
    let (_dir, service) = service("variance.db")?;
    let planner = ctx("planner");
    let afe = service.create_afe(details("Drill D-4", "well_d4", 1_000.0), &planner)?;
    service.add_line_item(&afe.id, LineItemInput::new("DRILLING", "Rig", 1.0, 1_000.0), &planner)?;

    let afe = service.post_cost_actual(&afe.id, CostActualInput::new("DRILLING", 1_050.0, date(6, 1)), &planner)?;
    assert_eq!(afe.actual_cost, 1_050.0);
    assert_eq!(afe.variance_review, VarianceReview::Clear);
    assert_eq!(afe.cost_actuals[0].document_number, "CA-2025-000001");

    let afe = service.post_cost_actual(&afe.id, CostActualInput::new("CASING", 100.0, date(6, 1)), &planner)?;
    assert_eq!(afe.variance_review, VarianceReview::PendingReview);
    assert!((afe.variance_pct() - 15.0).abs() < 1e-9);

    let afe = service.request_variance_explanation(&afe.id, "drilling_eng", &ctx("controller"))?;
    assert_eq!(
        afe.variance_review,
        VarianceReview::ExplanationRequested { from: "drilling_eng".into() }
    );
    let afe = service.approve_variance(&afe.id, Some("casing price increase".into()), &ctx("controller"))?;
    assert_eq!(afe.variance_review, VarianceReview::Accepted);

    // a posting that stays over the threshold flags the AFE again
    let afe = service.post_cost_actual(&afe.id, CostActualInput::new("CASING", 10.0, date(6, 2)), &planner)?;
    assert_eq!(afe.variance_review, VarianceReview::PendingReview);

    let breakdown = service.variance_breakdown(&afe.id)?;
    let casing = breakdown
        .iter()
        .find(|v| v.cost_element == "CASING")
        .context("no casing row")?;
    assert_eq!(casing.estimated, 0.0);
    assert_eq!(casing.actual, 110.0);

    let findings = service.validate_afe(&afe.id)?;
    assert!(findings.iter().any(|f| f.rule_code == "VARIANCE_THRESHOLD"));
    Ok(())
}

#[test]
fn reversal_offsets_the_original_posting() -> anyhow::Result<()> {
    let (_dir, service) = service("reversal.db")?;
    let planner = ctx("planner");
    let afe = service.create_afe(details("Drill E-5", "well_e5", 5_000.0), &planner)?;
    let afe = service.post_cost_actual(&afe.id, CostActualInput::new("DRILLING", 700.0, date(5, 20)), &planner)?;
    let posting_id = afe.cost_actuals[0].id.clone();

    let afe = service.reverse_cost_actual(&afe.id, &posting_id, "wrong AFE", &ctx("controller"))?;
    assert_eq!(afe.actual_cost, 0.0);
    assert_eq!(afe.cost_actuals.len(), 2);
    assert!(afe.cost_actuals[0].is_reversed);
    let reversal = &afe.cost_actuals[1];
    assert_eq!(reversal.amount, -700.0);
    assert_eq!(reversal.reversal_of.as_deref(), Some(posting_id.as_str()));
    assert!(reversal.document_number.ends_with("-REV"));

    let err = service
        .reverse_cost_actual(&afe.id, &posting_id, "again", &ctx("controller"))
        .unwrap_err();
    assert_eq!(err.code(), "STATE_ERROR");
    Ok(())
}

#[test]
fn reallocation_moves_a_posting_between_afes() -> anyhow::Result<()> {
    let (_dir, service) = service("reallocation.db")?;
    let planner = ctx("planner");
    let source = service.create_afe(details("Drill F-6", "well_f6", 5_000.0), &planner)?;
    let target = service.create_afe(details("Drill F-7", "well_f7", 5_000.0), &planner)?;
    service.add_wbs_element(&target.id, "1.1", "Drilling", 1, 2_000.0, &planner)?;

    let source = service.post_cost_actual(&source.id, CostActualInput::new("DRILLING", 1_200.0, date(5, 2)), &planner)?;
    let posting_id = source.cost_actuals[0].id.clone();

    let err = service
        .reallocate_cost_actual(&source.id, &posting_id, &source.id, None, &planner)
        .unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");

    // unknown WBS on the target: nothing moves
    let err = service
        .reallocate_cost_actual(&source.id, &posting_id, &target.id, Some("9.9".into()), &planner)
        .unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");
    assert_eq!(service.get_afe(&source.id)?.actual_cost, 1_200.0);

    let (source, target) =
        service.reallocate_cost_actual(&source.id, &posting_id, &target.id, Some("1.1".into()), &planner)?;
    assert_eq!(source.actual_cost, 0.0);
    assert_eq!(target.actual_cost, 1_200.0);
    assert_eq!(target.cost_actuals[0].wbs_code.as_deref(), Some("1.1"));
    assert_eq!(service.afe_summary(&target.id)?.actual_cost, 1_200.0);
    Ok(())
}

#[test]
fn commitments_roll_up_while_open() -> anyhow::Result<()> {
    let (_dir, service) = service("commitments.db")?;
    let planner = ctx("planner");
    let afe = service.create_afe(details("Drill G-8", "well_g8", 5_000.0), &planner)?;
    let afe = service.add_commitment(
        &afe.id,
        well_cost::afe::CommitmentInput::new("PO-100", 2_000.0).set_vendor("vendor_1"),
        &planner,
    )?;
    assert_eq!(afe.committed_cost, 2_000.0);
    let commitment_id = afe.commitments[0].id.clone();

    let err = service
        .add_commitment(&afe.id, well_cost::afe::CommitmentInput::new("PO-100", 1.0), &planner)
        .unwrap_err();
    assert_eq!(err.code(), "CONFLICT_ERROR");

    let afe = service.consume_commitment(&afe.id, &commitment_id, 500.0, &planner)?;
    assert_eq!(afe.committed_cost, 1_500.0);
    let afe = service.close_commitment(&afe.id, &commitment_id, &planner)?;
    assert_eq!(afe.committed_cost, 0.0);
    Ok(())
}

#[test]
fn supplements_are_numbered_after_their_parent() -> anyhow::Result<()> {
    let (_dir, service) = service("supplements.db")?;
    let planner = ctx("planner");
    let parent = service.create_afe(details("Drill H-9", "well_h9", 10_000.0), &planner)?;

    let err = service
        .create_supplement(&parent.id, 2_000.0, None, &planner)
        .unwrap_err();
    assert_eq!(err.code(), "STATE_ERROR");

    service.add_line_item(&parent.id, LineItemInput::new("DRILLING", "Rig", 1.0, 10_000.0), &planner)?;
    service.submit_for_approval(&parent.id, &planner)?;
    service.approve(&parent.id, None, &ctx("boss"))?;

    let first = service.create_supplement(&parent.id, 2_000.0, Some("stuck pipe".into()), &planner)?;
    assert_eq!(first.afe_number, format!("{}-S1", parent.afe_number));
    assert_eq!(first.afe_type, AfeType::Supplement);
    assert_eq!(first.parent_afe_id.as_deref(), Some(parent.id.as_str()));
    assert_eq!(first.status, AfeStatus::Draft);
    assert_eq!(first.well_type.as_deref(), Some("Onshore"));

    let second = service.create_supplement(&parent.id, 500.0, None, &planner)?;
    assert_eq!(second.afe_number, format!("{}-S2", parent.afe_number));
    assert_eq!(service.get_afe_by_number(&second.afe_number)?.id, second.id);

    // a deleted draft leaves a gap rather than a collision
    service.delete_afe(&first.id, &planner)?;
    let third = service.create_supplement(&parent.id, 750.0, None, &planner)?;
    assert_eq!(third.afe_number, format!("{}-S3", parent.afe_number));
    assert_eq!(service.afes_by_well("well_h9")?.len(), 3);
    Ok(())
}

#[test]
fn numbers_are_unique_and_released_on_delete() -> anyhow::Result<()> {
    let (_dir, service) = service("numbers.db")?;
    let planner = ctx("planner");

    let claimed = service.create_afe(
        details("Manual", "well_j1", 1_000.0).set_afe_number("AFE-2025-00001"),
        &planner,
    )?;
    let generated = service.create_afe(details("Generated", "well_j1", 1_000.0), &planner)?;
    assert_eq!(generated.afe_number, "AFE-2025-00002");

    let err = service
        .create_afe(details("Dup", "well_j1", 1_000.0).set_afe_number("AFE-2025-00001"), &planner)
        .unwrap_err();
    assert_eq!(err.code(), "CONFLICT_ERROR");

    service.delete_afe(&claimed.id, &planner)?;
    assert_eq!(service.get_afe(&claimed.id).unwrap_err().code(), "NOT_FOUND");
    service.create_afe(
        details("Reuse", "well_j1", 1_000.0).set_afe_number("AFE-2025-00001"),
        &planner,
    )?;

    service.add_line_item(&generated.id, LineItemInput::new("DRILLING", "Rig", 1.0, 1_000.0), &planner)?;
    service.submit_for_approval(&generated.id, &planner)?;
    let err = service.delete_afe(&generated.id, &planner).unwrap_err();
    assert_eq!(err.code(), "STATE_ERROR");
    assert_eq!(service.afes_by_well("well_j1")?.len(), 2);
    Ok(())
}

#[test]
fn stale_snapshot_cannot_overwrite_a_newer_write() -> anyhow::Result<()> {
    let (_dir, service) = service("concurrency.db")?;
    let planner = ctx("planner");
    let afe = service.create_afe(details("Drill K-1", "well_k1", 1_000.0), &planner)?;

    let stale = service.store().afes.load(&afe.id)?;
    service.add_line_item(&afe.id, LineItemInput::new("DRILLING", "Rig", 1.0, 900.0), &planner)?;

    let mut edited = stale.value.clone();
    edited.title = "lost update".into();
    let err = service.store().afes.replace(&stale, &edited).unwrap_err();
    assert_eq!(err.code(), "CONFLICT_ERROR");

    let current = service.get_afe(&afe.id)?;
    assert_eq!(current.title, "Drill K-1");
    assert_eq!(current.estimated_cost, 900.0);
    Ok(())
}

#[test]
fn partner_billing_continues_past_a_failed_partner() -> anyhow::Result<()> {
    let (_dir, service) = service("jib.db")?;
    let landman = ctx("landman");
    service.add_partner_interest("well_m1", "partner_a", 60.0, None, &landman)?;
    service.add_partner_interest("well_m1", "partner_b", 40.0, Some(35.0), &landman)?;

    let err = service
        .add_partner_interest("well_m1", "partner_c", 10.0, None, &landman)
        .unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");
    let err = service
        .add_partner_interest("well_m1", "partner_a", 1.0, None, &landman)
        .unwrap_err();
    assert_eq!(err.code(), "CONFLICT_ERROR");

    let validation = service.validate_partner_interests("well_m1")?;
    assert!(validation.is_valid);
    assert_eq!(validation.total_working_interest, 100.0);
    assert!(!service.validate_partner_interests("well_unknown")?.is_valid);

    let (from, to) = (date(1, 1), date(1, 31));
    service.create_jib_statement("well_m1", "partner_a", from.clone(), to.clone(), &landman)?;

    let report = service.generate_jib_statements("well_m1", from.clone(), to.clone(), &landman)?;
    assert_eq!(report.created.len(), 1);
    assert_eq!(report.created[0].partner_id, "partner_b");
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].partner_id, "partner_a");
    assert_eq!(report.failures[0].error.code(), "CONFLICT_ERROR");

    let statement = &report.created[0];
    service.add_jib_line_item(&statement.id, "Rig", Some("DRILLING".into()), 800.0, &landman)?;
    service.add_jib_line_item(&statement.id, "Mud", None, 200.0, &landman)?;

    let err = service.send_jib(&statement.id, &landman).unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");

    let statement = service.calculate_jib(&statement.id, &landman)?;
    assert_eq!(statement.total_amount, 1_000.0);
    assert!((statement.partner_share - 400.0).abs() < 1e-9);

    let statement = service.send_jib(&statement.id, &landman)?;
    assert_eq!(statement.status, JibStatus::Sent);
    let statement = service.mark_jib_paid(&statement.id, "WIRE-77", &landman)?;
    assert_eq!(statement.status, JibStatus::Paid);
    let err = service
        .mark_jib_disputed(&statement.id, "too late", &landman)
        .unwrap_err();
    assert_eq!(err.code(), "STATE_ERROR");

    assert_eq!(service.jib_statements_for_partner("partner_b", 2025)?.len(), 1);
    assert!(service.jib_statements_for_partner("partner_b", 2024)?.is_empty());

    // a partner without an interest in the well is never billed a zero share
    let stray = service.create_jib_statement("well_m1", "partner_z", from, to, &landman)?;
    let err = service.calculate_jib(&stray.id, &landman).unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");
    Ok(())
}

#[test]
fn costs_are_allocated_by_working_interest() -> anyhow::Result<()> {
    let (_dir, service) = service("allocation.db")?;
    let planner = ctx("planner");
    let afe = service.create_afe(details("Drill N-1", "well_n1", 10_000.0), &planner)?;

    service.post_cost_actual(&afe.id, CostActualInput::new("DRILLING", 1_000.0, date(4, 1)), &planner)?;
    let err = service.allocate_costs(&afe.id, &planner).unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");

    service.add_partner_interest("well_n1", "partner_a", 75.0, None, &planner)?;
    service.add_partner_interest("well_n1", "partner_b", 25.0, None, &planner)?;

    let afe = service.post_cost_actual(&afe.id, CostActualInput::new("CASING", 500.0, date(4, 2)), &planner)?;
    let casing_id = afe.cost_actuals[1].id.clone();
    service.reverse_cost_actual(&afe.id, &casing_id, "duplicate invoice", &planner)?;

    let allocations = service.allocate_costs(&afe.id, &planner)?;
    assert_eq!(allocations.len(), 6);
    let partner_a: f64 = allocations
        .iter()
        .filter(|a| a.partner_id == "partner_a")
        .map(|a| a.net_amount)
        .sum();
    assert!((partner_a - 750.0).abs() < 1e-9);

    // already allocated postings are not split twice
    assert!(service.allocate_costs(&afe.id, &planner)?.is_empty());
    assert!(service.get_afe(&afe.id)?.cost_actuals.iter().all(|ca| ca.is_allocated));
    Ok(())
}

#[test]
fn economics_analysis_from_draft_to_approved() -> anyhow::Result<()> {
    use rand::SeedableRng;

    let (_dir, service) = service("economics.db")?;
    let analyst = ctx("analyst");
    let afe = service.create_afe(details("Drill P-1", "well_p1", 1_000.0), &analyst)?;

    let analysis = service.create_analysis_from_afe(&afe.id, None, &analyst)?;
    assert_eq!(analysis.analysis_number, "ECON-2025-0001");
    assert_eq!(analysis.well_id, "well_p1");
    assert_eq!(analysis.discount_rate_pct, 10.0);

    // no flows, nothing to submit
    let err = service.submit_analysis(&analysis.id, &analyst).unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");

    service.add_cash_flow(&analysis.id, CashFlowInput::new(0).set_capex(1_000.0), &analyst)?;
    service.add_cash_flow(&analysis.id, CashFlowInput::new(1).set_revenue(600.0), &analyst)?;
    let analysis = service.add_cash_flow(&analysis.id, CashFlowInput::new(2).set_revenue(600.0), &analyst)?;

    let metrics = analysis.metrics.clone().context("metrics missing")?;
    assert!((metrics.npv - 41.3223).abs() < 1e-3);
    let irr = metrics.irr_pct.context("IRR missing")?;
    assert!((irr - 13.07).abs() < 0.01);
    assert!(metrics.payback_period.is_some());

    let err = service
        .add_cash_flow(&analysis.id, CashFlowInput::new(2).set_revenue(1.0), &analyst)
        .unwrap_err();
    assert_eq!(err.code(), "CONFLICT_ERROR");

    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let analysis = service.run_monte_carlo_with(&analysis.id, &mut rng, &analyst)?;
    let run = analysis.monte_carlo.clone().context("no monte carlo run")?;
    assert_eq!(run.summary.iterations, 1000);
    assert!(run.summary.p10 <= run.summary.p50 && run.summary.p50 <= run.summary.p90);

    let tornado = service.run_sensitivity_analysis(&analysis.id, &analyst)?;
    assert_eq!(tornado.len(), 5);
    assert!(tornado.windows(2).all(|w| w[0].impact >= w[1].impact));

    let downside = service.evaluate_scenario(
        &analysis.id,
        &ScenarioAdjustment {
            price_multiplier: 0.8,
            ..Default::default()
        },
    )?;
    assert!(downside.npv < metrics.npv);

    let analysis = service.submit_analysis(&analysis.id, &analyst)?;
    assert_eq!(analysis.status, AnalysisStatus::PendingApproval);

    // the figures under review are frozen
    let err = service
        .add_cash_flow(&analysis.id, CashFlowInput::new(3).set_revenue(10.0), &analyst)
        .unwrap_err();
    assert_eq!(err.code(), "STATE_ERROR");
    let err = service.run_sensitivity_analysis(&analysis.id, &analyst).unwrap_err();
    assert_eq!(err.code(), "STATE_ERROR");

    let analysis = service.approve_analysis(&analysis.id, Some("go".into()), &ctx("manager"))?;
    assert_eq!(analysis.status, AnalysisStatus::Approved);
    assert_eq!(analysis.approved_by.as_deref(), Some("manager"));

    let err = service
        .add_cash_flow(&analysis.id, CashFlowInput::new(3).set_revenue(10.0), &analyst)
        .unwrap_err();
    assert_eq!(err.code(), "STATE_ERROR");
    assert_eq!(service.delete_analysis(&analysis.id).unwrap_err().code(), "STATE_ERROR");
    let mut rng = rand::rngs::StdRng::seed_from_u64(8);
    let err = service
        .run_monte_carlo_with(&analysis.id, &mut rng, &analyst)
        .unwrap_err();
    assert_eq!(err.code(), "STATE_ERROR");
    let stored = service.get_analysis(&analysis.id)?;
    assert_eq!(stored.monte_carlo, analysis.monte_carlo);

    let empty = service.create_analysis(AnalysisRequest::new("Blank", "well_p1"), &analyst)?;
    let rows = service.compare_analyses(&[empty.id.as_str(), analysis.id.as_str()])?;
    assert_eq!(rows[0].analysis_id, analysis.id);
    assert_eq!(rows[0].recommendation, Recommendation::Proceed);
    assert_eq!(rows[1].recommendation, Recommendation::Review);
    assert_eq!(service.analyses_by_well("well_p1")?.len(), 2);

    service.delete_analysis(&empty.id)?;
    assert_eq!(service.get_analysis(&empty.id).unwrap_err().code(), "NOT_FOUND");
    Ok(())
}

#[test]
fn rejected_analysis_keeps_its_comments() -> anyhow::Result<()> {
    let (_dir, service) = service("economics_reject.db")?;
    let analyst = ctx("analyst");
    let request = AnalysisRequest::new("Infill", "well_q1").set_discount_rate(8.0);
    let analysis = service.create_analysis(request, &analyst)?;
    assert_eq!(analysis.discount_rate_pct, 8.0);

    let err = service
        .create_analysis(AnalysisRequest::new("Orphan", "well_q1").set_afe("afe_missing"), &analyst)
        .unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");

    // flows that never turn positive have no IRR
    let analysis = service.add_cash_flow(&analysis.id, CashFlowInput::new(0).set_capex(500.0), &analyst)?;
    let metrics = analysis.metrics.clone().context("metrics missing")?;
    assert!(metrics.irr_pct.is_none());

    service.submit_analysis(&analysis.id, &analyst)?;
    let analysis = service.reject_analysis(&analysis.id, Some("no payback".into()), &ctx("manager"))?;
    assert_eq!(analysis.status, AnalysisStatus::Rejected);
    assert_eq!(analysis.rejection_comments.as_deref(), Some("no payback"));
    assert_eq!(analysis.approvals[0].decided_by.as_deref(), Some("manager"));
    Ok(())
}

#[test]
fn pending_afe_cannot_outgrow_its_approval_chain() -> anyhow::Result<()> {
    let (_dir, service) = service("pending_edit.db")?;
    let admin = ctx("admin");
    service.register_matrix_entry(
        ApprovalMatrixEntry::new("SUP", "Superintendent", 0.0, 1_000.0, 1, "SUPERINTENDENT")
            .set_approver("sup_1"),
        &admin,
    )?;
    service.register_matrix_entry(
        ApprovalMatrixEntry::new("CEO", "Chief Executive", 1_000.01, 1e12, 2, "CEO").set_approver("ceo_1"),
        &admin,
    )?;

    let planner = ctx("planner");
    let afe = service.create_afe(details("Drill R-1", "well_r1", 500.0), &planner)?;
    let afe = service.add_line_item(&afe.id, LineItemInput::new("DRILLING", "Rig", 1.0, 500.0), &planner)?;
    let line_id = afe.line_items[0].id.clone();
    let afe = service.submit_for_approval(&afe.id, &planner)?;
    assert_eq!(afe.approval_chain.len(), 1);

    let err = service
        .add_line_item(&afe.id, LineItemInput::new("DRILLING", "Extra rig", 1.0, 5_000_000.0), &planner)
        .unwrap_err();
    assert_eq!(err.code(), "STATE_ERROR");
    let root = ActionContext::new(Actor::admin("root"), planner.now.clone());
    let err = service
        .update_line_item(&afe.id, &line_id, LineItemInput::new("DRILLING", "Rig", 10_000.0, 500.0), &root)
        .unwrap_err();
    assert_eq!(err.code(), "STATE_ERROR");
    let update = AfeUpdate {
        requested_cost: Some(9_000_000.0),
        ..Default::default()
    };
    assert_eq!(service.update_afe(&afe.id, update, &root).unwrap_err().code(), "STATE_ERROR");
    assert_eq!(service.remove_line_item(&afe.id, &line_id, &planner).unwrap_err().code(), "STATE_ERROR");

    let afe = service.approve(&afe.id, None, &ctx("sup_1"))?;
    assert_eq!(afe.status, AfeStatus::Approved);
    assert_eq!(afe.approved_cost, 500.0);

    // growing the estimate means going back through revision
    let afe = service.create_afe(details("Drill R-2", "well_r1", 500.0), &planner)?;
    service.add_line_item(&afe.id, LineItemInput::new("DRILLING", "Rig", 1.0, 500.0), &planner)?;
    service.submit_for_approval(&afe.id, &planner)?;
    service.return_for_revision(&afe.id, Some("add the extra rig".into()), &ctx("sup_1"))?;
    service.add_line_item(&afe.id, LineItemInput::new("DRILLING", "Extra rig", 1.0, 5_000_000.0), &planner)?;
    let afe = service.submit_for_approval(&afe.id, &planner)?;
    assert_eq!(afe.approval_chain.len(), 1);
    assert_eq!(afe.pending_approval().and_then(|a| a.assignee()), Some("ceo_1"));
    Ok(())
}

#[test]
fn line_item_edits_rederive_the_estimate() -> anyhow::Result<()> {
    let (_dir, service) = service("line_items.db")?;
    let planner = ctx("planner");
    let afe = service.create_afe(details("Drill S-1", "well_s1", 1_000.0), &planner)?;
    assert_eq!(afe.estimated_cost, 1_000.0);

    service.add_line_item(&afe.id, LineItemInput::new("DRILLING", "Rig", 2.0, 100.0), &planner)?;
    let afe = service.add_line_item(&afe.id, LineItemInput::new("CASING", "Casing", 1.0, 50.0), &planner)?;
    assert_eq!(afe.estimated_cost, 250.0);
    let (rig, casing) = (afe.line_items[0].id.clone(), afe.line_items[1].id.clone());

    let afe = service.update_line_item(&afe.id, &rig, LineItemInput::new("DRILLING", "Rig", 3.0, 100.0), &planner)?;
    assert_eq!(afe.line_items[0].total_cost, 300.0);
    assert_eq!(afe.estimated_cost, 350.0);

    let afe = service.remove_line_item(&afe.id, &casing, &planner)?;
    assert_eq!(afe.estimated_cost, 300.0);
    let err = service.remove_line_item(&afe.id, &casing, &planner).unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");

    // with no line items the requested amount stands
    let afe = service.remove_line_item(&afe.id, &rig, &planner)?;
    assert_eq!(afe.estimated_cost, 1_000.0);
    Ok(())
}

#[test]
fn recomputing_totals_is_idempotent() -> anyhow::Result<()> {
    let (_dir, service) = service("recompute.db")?;
    let planner = ctx("planner");
    let afe = service.create_afe(details("Drill T-1", "well_t1", 1_000.0), &planner)?;
    service.add_line_item(&afe.id, LineItemInput::new("DRILLING", "Rig", 1.0, 800.0), &planner)?;
    let afe = service.post_cost_actual(&afe.id, CostActualInput::new("DRILLING", 300.0, date(6, 1)), &planner)?;

    // consistent totals: nothing is written
    let auditor = ctx("auditor");
    let totals = service.recompute_afe_totals(&afe.id, &auditor)?;
    assert_eq!(totals, afe.totals());
    assert_eq!(service.recompute_afe_totals(&afe.id, &auditor)?, totals);
    assert_eq!(service.get_afe(&afe.id)?.audit.modified_by, "planner");

    // totals that drifted from the child records are re-derived and saved
    let snapshot = service.store().afes.load(&afe.id)?;
    let mut drifted = snapshot.value.clone();
    drifted.actual_cost = 5.0;
    drifted.estimated_cost = 1.0;
    service.store().afes.replace(&snapshot, &drifted)?;

    let totals = service.recompute_afe_totals(&afe.id, &auditor)?;
    assert_eq!(totals.estimated_cost, 800.0);
    assert_eq!(totals.actual_cost, 300.0);
    let stored = service.get_afe(&afe.id)?;
    assert_eq!(stored.actual_cost, 300.0);
    assert_eq!(stored.audit.modified_by, "auditor");
    Ok(())
}

#[test]
fn cancelling_closes_the_pending_approval() -> anyhow::Result<()> {
    let (_dir, service) = service("cancel.db")?;
    let planner = ctx("planner");
    let afe = service.create_afe(details("Drill U-1", "well_u1", 1_000.0), &planner)?;
    service.add_line_item(&afe.id, LineItemInput::new("DRILLING", "Rig", 1.0, 1_000.0), &planner)?;
    service.submit_for_approval(&afe.id, &planner)?;

    let afe = service.cancel(&afe.id, Some("rig unavailable".into()), &planner)?;
    assert_eq!(afe.status, AfeStatus::Cancelled);
    assert!(afe.pending_approval().is_none());
    assert_eq!(afe.approvals.len(), 1);
    assert_eq!(afe.approvals[0].status, ApprovalStatus::Rejected);
    assert_eq!(afe.approvals[0].comments.as_deref(), Some("rig unavailable"));
    assert!(service.pending_approvals_for("planner")?.is_empty());

    let err = service.cancel(&afe.id, None, &planner).unwrap_err();
    assert_eq!(err.code(), "STATE_ERROR");
    Ok(())
}

#[test]
fn cash_flow_edits_recompute_the_metrics() -> anyhow::Result<()> {
    use rand::SeedableRng;

    let (_dir, service) = service("cash_flows.db")?;
    let analyst = ctx("analyst");
    let analysis = service.create_analysis(AnalysisRequest::new("Base", "well_v1"), &analyst)?;
    service.add_cash_flow(&analysis.id, CashFlowInput::new(0).set_capex(1_000.0), &analyst)?;
    service.add_cash_flow(&analysis.id, CashFlowInput::new(1).set_revenue(600.0), &analyst)?;
    let analysis = service.add_cash_flow(&analysis.id, CashFlowInput::new(2).set_revenue(600.0), &analyst)?;
    let year_two = analysis
        .cash_flows
        .iter()
        .find(|cf| cf.year == 2)
        .map(|cf| cf.id.clone())
        .context("year 2 missing")?;

    let mut rng = rand::rngs::StdRng::seed_from_u64(3);
    let analysis = service.run_monte_carlo_with(&analysis.id, &mut rng, &analyst)?;
    assert!(analysis.monte_carlo.is_some());

    // -1000 + 600/1.1 + 1100/1.21
    let analysis = service.update_cash_flow(
        &analysis.id,
        &year_two,
        CashFlowInput::new(2).set_revenue(1_100.0),
        &analyst,
    )?;
    let npv = analysis.metrics.as_ref().map(|m| m.npv).context("metrics missing")?;
    assert!((npv - 454.5454).abs() < 1e-3);
    assert!(analysis.monte_carlo.is_none());

    let err = service
        .update_cash_flow(&analysis.id, &year_two, CashFlowInput::new(1).set_revenue(1.0), &analyst)
        .unwrap_err();
    assert_eq!(err.code(), "CONFLICT_ERROR");
    let err = service
        .update_cash_flow(&analysis.id, "cf_missing", CashFlowInput::new(7), &analyst)
        .unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");

    let analysis = service.remove_cash_flow(&analysis.id, &year_two, &analyst)?;
    let npv = analysis.metrics.as_ref().map(|m| m.npv).context("metrics missing")?;
    assert!((npv + 454.5454).abs() < 1e-3);

    // a recompute over unchanged flows reproduces the stored figures
    let snapshot = service.store().analyses.load(&analysis.id)?;
    let mut cleared = snapshot.value.clone();
    cleared.metrics = None;
    service.store().analyses.replace(&snapshot, &cleared)?;
    let recomputed = service.recompute_analysis_metrics(&analysis.id, &analyst)?;
    let metrics = recomputed.metrics.context("metrics missing")?;
    assert!((metrics.npv + 454.5454).abs() < 1e-3);

    for flow in &recomputed.cash_flows {
        service.remove_cash_flow(&recomputed.id, &flow.id, &analyst)?;
    }
    assert!(service.get_analysis(&recomputed.id)?.metrics.is_none());
    let err = service.recompute_analysis_metrics(&recomputed.id, &analyst).unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");
    Ok(())
}

#[test]
fn seeded_monte_carlo_is_reproducible() -> anyhow::Result<()> {
    use rand::SeedableRng;

    let mut config = EngineConfig::default();
    config.economics.monte_carlo.seed = Some(42);
    config.economics.monte_carlo.iterations = 250;
    let (_dir, service) = service_with("monte_carlo.db", config)?;
    let analyst = ctx("analyst");

    let mut ids = vec![];
    for name in ["Seeded", "Injected"] {
        let analysis = service.create_analysis(AnalysisRequest::new(name, "well_w1"), &analyst)?;
        service.add_cash_flow(&analysis.id, CashFlowInput::new(0).set_capex(1_000.0), &analyst)?;
        service.add_cash_flow(&analysis.id, CashFlowInput::new(1).set_revenue(700.0), &analyst)?;
        service.add_cash_flow(&analysis.id, CashFlowInput::new(2).set_revenue(700.0), &analyst)?;
        ids.push(analysis.id);
    }

    let first = service.run_monte_carlo(&ids[0], &analyst)?.monte_carlo.context("no run")?;
    let again = service.run_monte_carlo(&ids[0], &analyst)?.monte_carlo.context("no run")?;
    assert_eq!(first.summary, again.summary);
    assert_eq!(first.summary.iterations, 250);

    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    let injected = service
        .run_monte_carlo_with(&ids[1], &mut rng, &analyst)?
        .monte_carlo
        .context("no run")?;
    assert_eq!(injected.summary, first.summary);

    let empty = service.create_analysis(AnalysisRequest::new("Empty", "well_w1"), &analyst)?;
    let err = service.run_monte_carlo(&empty.id, &analyst).unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");
    Ok(())
}

#[test]
fn partner_interests_are_managed_under_the_ceiling() -> anyhow::Result<()> {
    let (_dir, service) = service("interests.db")?;
    let landman = ctx("landman");
    assert!(service.partner_interests("well_x1")?.is_empty());

    service.add_partner_interest("well_x1", "partner_a", 60.0, None, &landman)?;
    service.add_partner_interest("well_x1", "partner_b", 30.0, Some(25.0), &landman)?;

    let well = service.update_partner_interest("well_x1", "partner_b", 40.0, None, &landman)?;
    let b = well.interest_of("partner_b")?;
    assert_eq!(b.working_interest, 40.0);
    assert_eq!(b.net_revenue_interest, 25.0);
    assert!(service.validate_partner_interests("well_x1")?.is_valid);

    // over 100 % through any path is refused and nothing is written
    let err = service
        .update_partner_interest("well_x1", "partner_a", 61.0, None, &landman)
        .unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");
    let err = service
        .add_partner_interest("well_x1", "partner_c", 0.5, None, &landman)
        .unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");
    assert_eq!(service.validate_partner_interests("well_x1")?.total_working_interest, 100.0);

    let err = service
        .update_partner_interest("well_x1", "partner_z", 1.0, None, &landman)
        .unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");

    let well = service.remove_partner_interest("well_x1", "partner_b", &landman)?;
    assert_eq!(well.interests.len(), 1);
    assert_eq!(well.total_working_interest(), 60.0);
    assert_eq!(
        service.remove_partner_interest("well_x1", "partner_b", &landman).unwrap_err().code(),
        "NOT_FOUND"
    );
    service.add_partner_interest("well_x1", "partner_c", 40.0, None, &landman)?;

    let well = service.grant_consent("well_x1", "partner_a", &landman)?;
    assert!(matches!(well.interest_of("partner_a")?.consent, Consent::Consented { .. }));
    let well = service.mark_non_consent("well_x1", "partner_c", "sole risk", &landman)?;
    assert!(matches!(well.interest_of("partner_c")?.consent, Consent::NonConsent { .. }));
    assert_eq!(
        service.grant_consent("well_x1", "partner_b", &landman).unwrap_err().code(),
        "NOT_FOUND"
    );
    assert_eq!(service.partner_interests("well_x1")?.len(), 2);
    Ok(())
}
