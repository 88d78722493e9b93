//! Request orchestration.
//!
//! One request is one chain of [`PipelineState`] values. Each call to
//! [`Pipeline::advance`] consumes the current state, applies one stage and
//! returns the next; nothing is mutated in place and there is no way back.
//!
//! ```text
//! Requested → CanvasReady → PriorsReady → ScenariosReady → Priced → Reported
//!     └────────────┴─────────────┴──────────────┴────────────┴──→ Failed
//! ```

use std::sync::Arc;

use tracing::Instrument;

use crate::audit::{AuditRecord, AuditStore, Provenance};
use crate::canvas::{PerilCanvas, generate_canvas};
use crate::config::PricingConfig;
use crate::error::{AuditError, PricingError, SimulationError};
use crate::extractor::extract_priors;
use crate::llm::LlmClient;
use crate::llm::tool::ToolRunner;
use crate::output::QuoteResponse;
use crate::pricer::{PricingResult, price};
use crate::priors::Priors;
use crate::scenarios::{ScenarioSet, generate_scenarios};
use crate::types::{CancelToken, Stage};
use crate::validator::{ValidationReport, validate_and_report};

#[derive(Debug)]
pub struct Quote {
    pub report: ValidationReport,
    pub record: AuditRecord,
}

#[derive(Debug)]
pub struct Failure {
    pub stage: Stage,
    pub error: PricingError,
    /// Everything produced before the failing stage.
    pub record: AuditRecord,
    /// Set when `record` could not be appended to the audit store.
    pub audit_error: Option<AuditError>,
}

#[derive(Debug)]
pub enum PipelineState {
    Requested,
    CanvasReady {
        canvas: PerilCanvas,
    },
    PriorsReady {
        canvas: PerilCanvas,
        priors: Priors,
    },
    ScenariosReady {
        canvas: PerilCanvas,
        priors: Priors,
        scenarios: ScenarioSet,
    },
    Priced {
        canvas: PerilCanvas,
        priors: Priors,
        scenarios: ScenarioSet,
        result: PricingResult,
    },
    Reported(Box<Quote>),
    Failed(Box<Failure>),
}

impl PipelineState {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineState::Requested => "REQUESTED",
            PipelineState::CanvasReady { .. } => "CANVAS_READY",
            PipelineState::PriorsReady { .. } => "PRIORS_READY",
            PipelineState::ScenariosReady { .. } => "SCENARIOS_READY",
            PipelineState::Priced { .. } => "PRICED",
            PipelineState::Reported(_) => "REPORTED",
            PipelineState::Failed(_) => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Reported(_) | PipelineState::Failed(_))
    }

    /// Stage that produces the successor of this state.
    pub fn next_stage(&self) -> Option<Stage> {
        match self {
            PipelineState::Requested => Some(Stage::Canvas),
            PipelineState::CanvasReady { .. } => Some(Stage::Priors),
            PipelineState::PriorsReady { .. } => Some(Stage::Scenarios),
            PipelineState::ScenariosReady { .. } => Some(Stage::Pricing),
            PipelineState::Priced { .. } => Some(Stage::Reporting),
            PipelineState::Reported(_) | PipelineState::Failed(_) => None,
        }
    }
}

/// Artifacts a failed state still carries into its audit record.
#[derive(Default)]
struct Partial {
    canvas: Option<PerilCanvas>,
    priors: Option<Priors>,
    scenarios: Option<ScenarioSet>,
}

impl Partial {
    fn take(state: PipelineState) -> Self {
        match state {
            PipelineState::CanvasReady { canvas } => Partial { canvas: Some(canvas), ..Partial::default() },
            PipelineState::PriorsReady { canvas, priors } => {
                Partial { canvas: Some(canvas), priors: Some(priors), scenarios: None }
            }
            PipelineState::ScenariosReady { canvas, priors, scenarios }
            | PipelineState::Priced { canvas, priors, scenarios, .. } => {
                Partial { canvas: Some(canvas), priors: Some(priors), scenarios: Some(scenarios) }
            }
            _ => Partial::default(),
        }
    }
}

/// The final state of one request and the provenance that led there.
#[derive(Debug)]
pub struct Outcome {
    pub provenance: Provenance,
    pub state: PipelineState,
}

impl Outcome {
    pub fn response(&self) -> QuoteResponse {
        QuoteResponse::from_state(&self.provenance, &self.state)
    }
}

/// Runs pricing requests against one LLM client and one immutable config.
/// Requests share nothing mutable, so many may run concurrently on one
/// pipeline.
pub struct Pipeline<C> {
    client: C,
    config: Arc<PricingConfig>,
    store: Option<Arc<dyn AuditStore>>,
}

impl<C: LlmClient> Pipeline<C> {
    pub fn new(client: C, config: Arc<PricingConfig>) -> Self {
        Pipeline { client, config, store: None }
    }

    /// Persists every terminal request except cancelled ones.
    pub fn with_store(mut self, store: Arc<dyn AuditStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &PricingConfig {
        &self.config
    }

    fn fail(&self, provenance: &Provenance, stage: Stage, error: PricingError, partial: Partial) -> PipelineState {
        tracing::error!(request_id = %provenance.request_id, %stage, kind = error.kind(), error = %error, "stage failed");
        let mut record = AuditRecord::open(provenance, &self.config.pricing).with_failure(stage, &error);
        record.canvas = partial.canvas;
        record.priors = partial.priors;
        record.scenarios = partial.scenarios;
        PipelineState::Failed(Box::new(Failure { stage, error, record, audit_error: None }))
    }

    /// Applies the next stage to `state`. Terminal states come back unchanged.
    pub async fn advance(
        &self,
        state: PipelineState,
        provenance: &mut Provenance,
        cancel: &CancelToken,
    ) -> PipelineState {
        let Some(stage) = state.next_stage() else {
            return state;
        };
        if cancel.is_cancelled() {
            tracing::info!(request_id = %provenance.request_id, %stage, "request cancelled");
            return self.fail(provenance, stage, PricingError::Cancelled, Partial::take(state));
        }

        let span = tracing::info_span!("stage", request_id = %provenance.request_id, %stage);
        let cfg = &*self.config;
        let runner = ToolRunner::new(&self.client, cfg);

        match state {
            PipelineState::Requested => {
                let canvas = generate_canvas(
                    &runner,
                    &provenance.description,
                    &cfg.elicitation,
                    &mut provenance.transcript,
                )
                .instrument(span)
                .await;
                match canvas {
                    Ok(canvas) => PipelineState::CanvasReady { canvas },
                    Err(e) => self.fail(provenance, stage, e, Partial::default()),
                }
            }
            PipelineState::CanvasReady { canvas } => {
                let priors =
                    extract_priors(&runner, &canvas, cfg, &mut provenance.transcript).instrument(span).await;
                match priors {
                    Ok(priors) => PipelineState::PriorsReady { canvas, priors },
                    Err(e) => self.fail(provenance, stage, e, Partial::take(PipelineState::CanvasReady { canvas })),
                }
            }
            PipelineState::PriorsReady { canvas, priors } => {
                let (job_canvas, job_priors) = (canvas.clone(), priors.clone());
                let (years, seed) = (provenance.years, provenance.seed);
                let config = Arc::clone(&self.config);
                let cancel = cancel.clone();
                let job = tokio::task::spawn_blocking(move || {
                    span.in_scope(|| {
                        generate_scenarios(&job_canvas, &job_priors, years, seed, &config.simulation, &cancel)
                    })
                });
                let scenarios = match job.await {
                    Ok(result) => result,
                    Err(join) => Err(SimulationError::Worker(join.to_string()).into()),
                };
                match scenarios {
                    Ok(scenarios) => PipelineState::ScenariosReady { canvas, priors, scenarios },
                    Err(e) => self.fail(
                        provenance,
                        stage,
                        e,
                        Partial { canvas: Some(canvas), priors: Some(priors), scenarios: None },
                    ),
                }
            }
            PipelineState::ScenariosReady { canvas, priors, scenarios } => {
                match span.in_scope(|| price(&scenarios, &canvas.peril, &cfg.pricing)) {
                    Ok(result) => PipelineState::Priced { canvas, priors, scenarios, result },
                    Err(e) => self.fail(
                        provenance,
                        stage,
                        e,
                        Partial { canvas: Some(canvas), priors: Some(priors), scenarios: Some(scenarios) },
                    ),
                }
            }
            PipelineState::Priced { canvas, priors, scenarios, result } => {
                let (report, record) = span
                    .in_scope(|| validate_and_report(result, &scenarios, &canvas, &priors, cfg, provenance));
                PipelineState::Reported(Box::new(Quote { report, record }))
            }
            PipelineState::Reported(_) | PipelineState::Failed(_) => state,
        }
    }

    /// Drives `provenance`'s request to a terminal state, then persists it.
    pub async fn run(&self, provenance: &mut Provenance, cancel: &CancelToken) -> PipelineState {
        let mut state = PipelineState::Requested;
        while !state.is_terminal() {
            let from = state.name();
            state = self.advance(state, provenance, cancel).await;
            tracing::debug!(request_id = %provenance.request_id, from, to = state.name(), "transition");
        }
        self.persist(state)
    }

    fn persist(&self, state: PipelineState) -> PipelineState {
        let Some(store) = &self.store else {
            return state;
        };
        match state {
            PipelineState::Reported(quote) => match store.append(&quote.record) {
                Ok(()) => PipelineState::Reported(quote),
                Err(e) => {
                    let error = PricingError::from(e);
                    tracing::error!(request_id = %quote.record.request_id, error = %error, "audit append failed");
                    let Quote { record, .. } = *quote;
                    let record = record.with_failure(Stage::Reporting, &error);
                    PipelineState::Failed(Box::new(Failure {
                        stage: Stage::Reporting,
                        error,
                        record,
                        audit_error: None,
                    }))
                }
            },
            PipelineState::Failed(mut failure) if !matches!(failure.error, PricingError::Cancelled) => {
                if let Err(e) = store.append(&failure.record) {
                    tracing::error!(request_id = %failure.record.request_id, error = %e, "audit append failed");
                    failure.audit_error = Some(e);
                }
                PipelineState::Failed(failure)
            }
            other => other,
        }
    }

    /// Prices `description` with the configured seed and year count.
    pub async fn quote(&self, description: impl Into<String>, cancel: &CancelToken) -> Outcome {
        let sim = &self.config.simulation;
        let mut provenance = Provenance::new(description, sim.seed, sim.years);
        tracing::info!(request_id = %provenance.request_id, seed = sim.seed, years = sim.years, "quote requested");
        let state = self.run(&mut provenance, cancel).await;
        tracing::info!(request_id = %provenance.request_id, state = state.name(), "quote finished");
        Outcome { provenance, state }
    }
}
