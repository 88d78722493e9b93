use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies one pricing request end to end: state chain, transcript and
/// persisted audit record all carry the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        RequestId(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Pipeline stage that produced an artifact, an LLM exchange or a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Canvas,
    Priors,
    Scenarios,
    Pricing,
    Reporting,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Canvas => "canvas",
            Stage::Priors => "priors",
            Stage::Scenarios => "scenarios",
            Stage::Pricing => "pricing",
            Stage::Reporting => "reporting",
        };
        f.write_str(name)
    }
}

/// Ordered so that `max` of two levels is the more severe one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    VeryHigh,
}

impl RiskLevel {
    /// Underwriting recommendation. Depends on the level only, so two quotes
    /// with the same level always read the same.
    pub fn recommendation(self) -> &'static str {
        match self {
            RiskLevel::Low => {
                "Low risk: volatility is contained; the product can be launched at the quoted premium."
            }
            RiskLevel::Medium => {
                "Medium risk: launch after further review; diversify the portfolio to absorb volatility."
            }
            RiskLevel::High => {
                "High risk: adjust the premium or tighten the limit before launch; consider reinsurance."
            }
            RiskLevel::VeryHigh => {
                "Very high risk: launch is not recommended on current terms; revisit the trigger design."
            }
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
            RiskLevel::VeryHigh => "VERY_HIGH",
        };
        f.write_str(name)
    }
}

/// Cooperative cancellation flag shared between a caller and one request.
/// Checked between stage transitions and between sampling batches.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
