//! Caller-facing quote contract.

use serde::{Deserialize, Serialize};

use crate::audit::Provenance;
use crate::pipeline::PipelineState;
use crate::types::{RequestId, RiskLevel, Stage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuoteStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteSummary {
    pub peril: String,
    pub recommendation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteError {
    pub stage: Stage,
    pub kind: String,
    pub message: String,
    /// Why the failure itself never reached the audit trail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_error: Option<String>,
}

/// Numbers are absent on failure; `validation_failures` and `alerts` are
/// empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteResponse {
    pub request_id: RequestId,
    pub status: QuoteStatus,
    pub expected_loss: Option<f64>,
    pub gross_premium: Option<f64>,
    pub risk_level: Option<RiskLevel>,
    pub loss_ratio: Option<f64>,
    pub coefficient_of_variation: Option<f64>,
    pub var_99: Option<f64>,
    pub tvar_99: Option<f64>,
    pub simulation_years: u32,
    pub validation_passed: bool,
    pub validation_failures: Vec<String>,
    #[serde(default)]
    pub alerts: Vec<String>,
    pub summary: Option<QuoteSummary>,
    pub error: Option<QuoteError>,
}

impl QuoteResponse {
    fn empty(provenance: &Provenance, status: QuoteStatus) -> Self {
        QuoteResponse {
            request_id: provenance.request_id,
            status,
            expected_loss: None,
            gross_premium: None,
            risk_level: None,
            loss_ratio: None,
            coefficient_of_variation: None,
            var_99: None,
            tvar_99: None,
            simulation_years: provenance.years,
            validation_passed: false,
            validation_failures: Vec::new(),
            alerts: Vec::new(),
            summary: None,
            error: None,
        }
    }

    /// Projects a terminal pipeline state onto the contract. A state that is
    /// not terminal reads as a failure of the stage it was waiting on.
    pub fn from_state(provenance: &Provenance, state: &PipelineState) -> Self {
        match state {
            PipelineState::Reported(quote) => {
                let r = &quote.report.result;
                QuoteResponse {
                    expected_loss: Some(r.expected_loss),
                    gross_premium: Some(r.gross_premium),
                    risk_level: Some(r.risk_level),
                    loss_ratio: Some(r.loss_ratio),
                    coefficient_of_variation: Some(r.coefficient_of_variation),
                    var_99: Some(r.var_99),
                    tvar_99: Some(r.tvar_99),
                    simulation_years: r.simulation_years,
                    validation_passed: quote.report.validation_passed,
                    validation_failures: quote.report.failures().iter().map(ToString::to_string).collect(),
                    alerts: quote.report.alerts.clone(),
                    summary: Some(QuoteSummary {
                        peril: r.peril.clone(),
                        recommendation: r.recommendation.clone(),
                    }),
                    ..Self::empty(provenance, QuoteStatus::Success)
                }
            }
            PipelineState::Failed(failure) => QuoteResponse {
                error: Some(QuoteError {
                    stage: failure.stage,
                    kind: failure.error.kind().to_string(),
                    message: failure.error.to_string(),
                    audit_error: failure.audit_error.as_ref().map(ToString::to_string),
                }),
                ..Self::empty(provenance, QuoteStatus::Failure)
            },
            pending => QuoteResponse {
                error: Some(QuoteError {
                    stage: pending.next_stage().unwrap_or(Stage::Reporting),
                    kind: "incomplete".to_string(),
                    message: format!("pipeline stopped in state {}", pending.name()),
                    audit_error: None,
                }),
                ..Self::empty(provenance, QuoteStatus::Failure)
            },
        }
    }
}
