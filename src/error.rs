use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failure talking to the LLM collaborator. Transport faults are retried with
/// backoff; everything else surfaces immediately.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LlmCallError {
    #[error("LLM call timed out after {0:?}")]
    Timeout(Duration),
    #[error("LLM transport error: {0}")]
    Transport(String),
    #[error("LLM rate limited (HTTP {status})")]
    RateLimited {
        status: u16,
        retry_after: Option<Duration>,
    },
    #[error("LLM server error (HTTP {status}): {body}")]
    Server { status: u16, body: String },
    #[error("LLM request rejected (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("LLM response carried no message content")]
    EmptyResponse,
    #[error("LLM call failed after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<LlmCallError>,
    },
}

impl LlmCallError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmCallError::Timeout(_)
                | LlmCallError::Transport(_)
                | LlmCallError::RateLimited { .. }
                | LlmCallError::Server { .. }
        )
    }

    /// Server-requested delay, if the fault carried one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            LlmCallError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("no structurally valid peril canvas after {attempts} attempt(s): {}", .reasons.join("; "))]
pub struct CanvasGenerationError {
    pub attempts: u32,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("priors still inconsistent after {rounds} critique round(s): {}", .issues.join("; "))]
pub struct PriorInconsistencyError {
    pub rounds: u32,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("expected loss is {expected_loss}; premium is undefined")]
pub struct DegenerateLossError {
    pub expected_loss: f64,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimulationError {
    #[error("prior cannot be sampled: {0}")]
    InvalidPrior(String),
    #[error("non-finite severity {value} drawn in year {year}, event {event}")]
    NonFiniteSeverity { year: u32, event: u64, value: f64 },
    #[error("annual payout in year {year} is not finite")]
    NonFiniteTotal { year: u32 },
    #[error("event count {count} in year {year} exceeds the per-year ceiling")]
    ExcessiveCount { year: u32, count: u64 },
    #[error("scenario generation requested zero years")]
    NoYears,
    #[error("sampling worker failed: {0}")]
    Worker(String),
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit record {path} already exists; records are append-only")]
    AlreadyExists { path: PathBuf },
    #[error("audit I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("audit record encoding: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("audit record has no {missing}; nothing to replay")]
    Incomplete { missing: &'static str },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid config {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
    #[error("environment variable {var} holding the LLM API key is not set")]
    MissingApiKey { var: String },
    #[error("building HTTP client: {0}")]
    Http(String),
}

/// Fatal pipeline error. Carries the originating cause; the stage is tracked
/// by the state machine alongside it.
#[derive(Debug, Error)]
pub enum PricingError {
    #[error(transparent)]
    LlmCall(#[from] LlmCallError),
    #[error(transparent)]
    CanvasGeneration(#[from] CanvasGenerationError),
    #[error(transparent)]
    PriorInconsistency(#[from] PriorInconsistencyError),
    #[error(transparent)]
    DegenerateLoss(#[from] DegenerateLossError),
    #[error(transparent)]
    Simulation(#[from] SimulationError),
    #[error(transparent)]
    Audit(#[from] AuditError),
    #[error("request cancelled")]
    Cancelled,
}

impl PricingError {
    /// Stable machine-readable name, used in the output contract and audit trail.
    pub fn kind(&self) -> &'static str {
        match self {
            PricingError::LlmCall(_) => "llm_call_error",
            PricingError::CanvasGeneration(_) => "canvas_generation_error",
            PricingError::PriorInconsistency(_) => "prior_inconsistency_error",
            PricingError::DegenerateLoss(_) => "degenerate_loss_error",
            PricingError::Simulation(_) => "simulation_error",
            PricingError::Audit(_) => "audit_error",
            PricingError::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(LlmCallError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(LlmCallError::Transport("reset".into()).is_transient());
        assert!(
            LlmCallError::RateLimited { status: 429, retry_after: None }.is_transient()
        );
        assert!(LlmCallError::Server { status: 503, body: String::new() }.is_transient());
        assert!(!LlmCallError::Rejected { status: 400, body: String::new() }.is_transient());
        assert!(!LlmCallError::EmptyResponse.is_transient());
    }

    #[test]
    fn canvas_error_lists_reasons() {
        let err = CanvasGenerationError {
            attempts: 3,
            reasons: vec!["missing field `limit`".into(), "rate must be > 0".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("3 attempt(s)"), "{msg}");
        assert!(msg.contains("missing field `limit`; rate must be > 0"), "{msg}");
    }

    #[test]
    fn pricing_error_kind_is_stable() {
        let err: PricingError = DegenerateLossError { expected_loss: 0.0 }.into();
        assert_eq!(err.kind(), "degenerate_loss_error");
        assert_eq!(PricingError::Cancelled.kind(), "cancelled");
    }
}
