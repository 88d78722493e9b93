mod common;

use std::path::PathBuf;
use std::sync::Arc;

use priorquote::audit::{AuditRecord, AuditStore, FileAuditStore, MemoryAuditStore, replay};
use priorquote::config::PricingConfig;
use priorquote::error::{AuditError, PricingError};
use priorquote::llm::{LlmCallError, LlmRequest};
use priorquote::output::QuoteStatus;
use priorquote::pipeline::{Pipeline, PipelineState};
use priorquote::pricer::price;
use priorquote::scenarios::generate_scenarios;
use priorquote::types::{CancelToken, RiskLevel, Stage};

use common::{CANVAS, CANVAS_WITHOUT_LIMIT, ScriptedClient, UNREACHABLE_CANVAS, golden, happy};

fn config() -> Arc<PricingConfig> {
    Arc::new(PricingConfig::canonical())
}

/// Refuses every record, as a full or read-only disk would.
struct FullDisk;

impl AuditStore for FullDisk {
    fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
        Err(AuditError::Io {
            path: PathBuf::from(format!("/audit/{}.json", record.request_id)),
            source: std::io::Error::other("no space left on device"),
        })
    }
}

#[tokio::test]
async fn golden_request_is_reported_and_persisted() {
    let store = Arc::new(MemoryAuditStore::new());
    let pipeline = Pipeline::new(ScriptedClient::new(happy(CANVAS, 0.5)), config()).with_store(store.clone());

    let outcome = pipeline.quote("typhoon season cover for Korea", &CancelToken::new()).await;
    let PipelineState::Reported(quote) = &outcome.state else {
        panic!("expected REPORTED, got {}", outcome.state.name());
    };

    // canvas, frequency, severity, one critique round, tail scenarios
    assert_eq!(quote.record.exchanges.len(), 5);
    assert!(quote.report.validation_passed, "{:?}", quote.report.failures());

    let canvas = quote.record.canvas.as_ref().unwrap();
    let priors = quote.record.priors.as_ref().unwrap();
    assert_eq!(canvas.peril, "typhoon");
    assert_eq!(priors.tail.len(), 3);
    assert_eq!(priors.critique_rounds, 1);

    let cfg = PricingConfig::canonical();
    let direct = generate_scenarios(canvas, priors, 1000, 42, &cfg.simulation, &CancelToken::new()).unwrap();
    let direct = price(&direct, "typhoon", &cfg.pricing).unwrap();
    assert_eq!(quote.report.result, direct);

    let g = golden();
    assert_eq!((outcome.provenance.seed, outcome.provenance.years), (g.seed, g.years));
    let priced = &quote.report.result;
    assert_eq!(priced.expected_loss.to_bits(), g.expected_loss.to_bits(), "EL {}", priced.expected_loss);
    assert_eq!(priced.std_dev.to_bits(), g.std_dev.to_bits());
    assert_eq!(priced.coefficient_of_variation.to_bits(), g.coefficient_of_variation.to_bits());
    assert_eq!(priced.risk_load.to_bits(), g.risk_load.to_bits());
    assert_eq!(priced.gross_premium.to_bits(), g.gross_premium.to_bits());
    assert_eq!(priced.var_99.to_bits(), g.var_99.to_bits());
    assert_eq!(priced.tvar_99.to_bits(), g.tvar_99.to_bits());
    assert_eq!(priced.summary.tail_years, g.tail_years);

    let response = outcome.response();
    assert_eq!(response.status, QuoteStatus::Success);
    assert_eq!(response.request_id, outcome.provenance.request_id);
    assert_eq!(response.expected_loss, Some(direct.expected_loss));
    assert_eq!(response.simulation_years, 1000);
    assert!(response.validation_failures.is_empty());
    assert!(response.error.is_none());
    let summary = response.summary.unwrap();
    assert_eq!(summary.recommendation, response.risk_level.unwrap().recommendation());

    let records = store.records();
    assert_eq!(records.len(), 1);
    assert!(records[0].succeeded());
    assert_eq!(records[0].request_id, outcome.provenance.request_id);
}

#[tokio::test]
async fn unusable_canvas_fails_after_bounded_reformulation() {
    let store = Arc::new(MemoryAuditStore::new());
    let client = Arc::new(ScriptedClient::new(happy(CANVAS_WITHOUT_LIMIT, 0.5)));
    let pipeline = Pipeline::new(Arc::clone(&client), config()).with_store(store.clone());

    let outcome = pipeline.quote("vague event", &CancelToken::new()).await;
    let PipelineState::Failed(failure) = &outcome.state else {
        panic!("expected FAILED, got {}", outcome.state.name());
    };
    assert_eq!(failure.stage, Stage::Canvas);
    assert!(matches!(failure.error, PricingError::CanvasGeneration(_)), "{:?}", failure.error);
    assert_eq!(client.calls_for("peril_canvas"), 3);
    assert_eq!(client.calls_for("frequency_prior"), 0);

    let response = outcome.response();
    assert_eq!(response.status, QuoteStatus::Failure);
    assert_eq!(response.expected_loss, None);
    let error = response.error.unwrap();
    assert_eq!(error.stage, Stage::Canvas);
    assert_eq!(error.kind, "canvas_generation_error");

    let records = store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].exchanges.len(), 3);
    assert_eq!(records[0].failure.as_ref().unwrap().kind, "canvas_generation_error");
}

#[tokio::test]
async fn unrecorded_failure_reports_the_audit_error() {
    let pipeline =
        Pipeline::new(ScriptedClient::new(happy(CANVAS_WITHOUT_LIMIT, 0.5)), config()).with_store(Arc::new(FullDisk));

    let outcome = pipeline.quote("vague event", &CancelToken::new()).await;
    let PipelineState::Failed(failure) = &outcome.state else {
        panic!("expected FAILED, got {}", outcome.state.name());
    };
    // The original cause stays the error; the audit failure rides along.
    assert_eq!(failure.stage, Stage::Canvas);
    assert_eq!(failure.error.kind(), "canvas_generation_error");
    assert!(matches!(failure.audit_error, Some(AuditError::Io { .. })), "{:?}", failure.audit_error);

    let error = outcome.response().error.unwrap();
    assert_eq!(error.kind, "canvas_generation_error");
    let audit = error.audit_error.expect("audit error surfaced in the response");
    assert!(audit.contains("no space left on device"), "{audit}");
}

#[tokio::test]
async fn unrecorded_success_fails_at_reporting() {
    let pipeline = Pipeline::new(ScriptedClient::new(happy(CANVAS, 0.5)), config()).with_store(Arc::new(FullDisk));

    let outcome = pipeline.quote("typhoon season cover for Korea", &CancelToken::new()).await;
    let PipelineState::Failed(failure) = &outcome.state else {
        panic!("expected FAILED, got {}", outcome.state.name());
    };
    assert_eq!(failure.stage, Stage::Reporting);
    assert_eq!(failure.error.kind(), "audit_error");
    assert_eq!(outcome.response().status, QuoteStatus::Failure);
}

#[tokio::test]
async fn recorded_failure_has_no_audit_error() {
    let pipeline = Pipeline::new(ScriptedClient::new(happy(CANVAS_WITHOUT_LIMIT, 0.5)), config())
        .with_store(Arc::new(MemoryAuditStore::new()));
    let outcome = pipeline.quote("vague event", &CancelToken::new()).await;
    let PipelineState::Failed(failure) = &outcome.state else {
        panic!("expected FAILED, got {}", outcome.state.name());
    };
    assert!(failure.audit_error.is_none());
    assert!(outcome.response().error.unwrap().audit_error.is_none());
}

#[tokio::test]
async fn negative_sigma_is_a_prior_inconsistency() {
    let store = Arc::new(MemoryAuditStore::new());
    let pipeline =
        Pipeline::new(ScriptedClient::new(happy(CANVAS, -1.0)), config()).with_store(store.clone());

    let outcome = pipeline.quote("typhoon season cover for Korea", &CancelToken::new()).await;
    let PipelineState::Failed(failure) = &outcome.state else {
        panic!("expected FAILED, got {}", outcome.state.name());
    };
    assert_eq!(failure.stage, Stage::Priors);
    match &failure.error {
        PricingError::PriorInconsistency(e) => assert_eq!(e.rounds, 2),
        other => panic!("expected PriorInconsistency, got {other:?}"),
    }
    // The canvas survives into the audit record; no priors were accepted.
    let record = &store.records()[0];
    assert!(record.canvas.is_some());
    assert!(record.priors.is_none());
}

#[tokio::test]
async fn zero_expected_loss_never_prices_at_zero() {
    let pipeline = Pipeline::new(ScriptedClient::new(happy(UNREACHABLE_CANVAS, 0.5)), config());
    let outcome = pipeline.quote("trigger nobody will ever hit", &CancelToken::new()).await;
    let PipelineState::Failed(failure) = &outcome.state else {
        panic!("expected FAILED, got {}", outcome.state.name());
    };
    assert_eq!(failure.stage, Stage::Pricing);
    assert_eq!(failure.error.kind(), "degenerate_loss_error");
    assert!(failure.record.scenarios.is_some());
    assert_eq!(outcome.response().gross_premium, None);
}

#[tokio::test]
async fn cancelled_request_is_not_persisted() {
    let store = Arc::new(MemoryAuditStore::new());
    let client = Arc::new(ScriptedClient::new(happy(CANVAS, 0.5)));
    let pipeline = Pipeline::new(Arc::clone(&client), config()).with_store(store.clone());
    let cancel = CancelToken::new();
    cancel.cancel();

    let outcome = pipeline.quote("typhoon season cover for Korea", &cancel).await;
    let PipelineState::Failed(failure) = &outcome.state else {
        panic!("expected FAILED, got {}", outcome.state.name());
    };
    assert!(matches!(failure.error, PricingError::Cancelled));
    assert_eq!(outcome.response().error.unwrap().kind, "cancelled");
    assert_eq!(client.total_calls(), 0);
    assert!(store.records().is_empty());
}

#[tokio::test]
async fn rejected_llm_call_fails_without_retry() {
    let client = Arc::new(ScriptedClient::new(|_: &LlmRequest, _| {
        Err(LlmCallError::Rejected { status: 401, body: "bad key".into() })
    }));
    let pipeline = Pipeline::new(Arc::clone(&client), config());
    let outcome = pipeline.quote("typhoon", &CancelToken::new()).await;
    let PipelineState::Failed(failure) = &outcome.state else {
        panic!("expected FAILED, got {}", outcome.state.name());
    };
    assert_eq!(failure.error.kind(), "llm_call_error");
    assert_eq!(client.total_calls(), 1);
    // The failed exchange is still on record.
    assert_eq!(failure.record.exchanges.len(), 1);
    assert!(failure.record.exchanges.exchanges()[0].error.is_some());
}

#[tokio::test]
async fn persisted_record_replays_exactly() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileAuditStore::new(dir.path()));
    let pipeline =
        Pipeline::new(ScriptedClient::new(happy(CANVAS, 0.5)), config()).with_store(store.clone());

    let outcome = pipeline.quote("typhoon season cover for Korea", &CancelToken::new()).await;
    assert!(matches!(outcome.state, PipelineState::Reported(_)));

    let record = FileAuditStore::load(&store.path_for(outcome.provenance.request_id)).unwrap();
    assert_eq!(record.seed, 42);
    assert_eq!(record.exchanges.len(), 5);
    let replayed = replay(&record, &PricingConfig::canonical().simulation).unwrap();
    assert!(replayed.reproduced());
}

#[tokio::test]
async fn concurrent_requests_share_nothing_mutable() {
    let pipeline = Pipeline::new(ScriptedClient::new(happy(CANVAS, 0.5)), config());
    let cancel = CancelToken::new();
    let (a, b) = tokio::join!(
        pipeline.quote("typhoon season cover for Korea", &cancel),
        pipeline.quote("typhoon season cover for Korea", &cancel),
    );
    assert_ne!(a.provenance.request_id, b.provenance.request_id);
    let (ra, rb) = (a.response(), b.response());
    assert_eq!(ra.expected_loss, rb.expected_loss);
    assert_eq!(ra.var_99, rb.var_99);
    assert_eq!(ra.risk_level, Some(RiskLevel::VeryHigh));
}
