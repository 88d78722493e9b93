#![allow(dead_code)]

use std::future::Future;
use std::sync::Mutex;

use priorquote::llm::{LlmCallError, LlmClient, LlmRequest};

/// Answers each request from a closure given the request and how many
/// earlier requests the same tool has made.
pub struct ScriptedClient<F> {
    respond: F,
    calls: Mutex<Vec<&'static str>>,
}

impl<F> ScriptedClient<F>
where
    F: Fn(&LlmRequest, usize) -> Result<String, LlmCallError> + Send + Sync,
{
    pub fn new(respond: F) -> Self {
        ScriptedClient { respond, calls: Mutex::new(Vec::new()) }
    }

    pub fn calls_for(&self, tool: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|t| **t == tool).count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl<F> LlmClient for ScriptedClient<F>
where
    F: Fn(&LlmRequest, usize) -> Result<String, LlmCallError> + Send + Sync,
{
    fn complete(&self, request: &LlmRequest) -> impl Future<Output = Result<String, LlmCallError>> + Send {
        let reply = {
            let mut calls = self.calls.lock().unwrap();
            let nth = calls.iter().filter(|t| **t == request.tool).count();
            calls.push(request.tool);
            (self.respond)(request, nth)
        };
        std::future::ready(reply)
    }
}

/// Index trigger, 100 per point above 0, limit 2,000,000.
pub const CANVAS: &str = r#"{
    "peril": "Typhoon",
    "description": "Typhoon season loss index for the Korean peninsula",
    "region": "KR",
    "currency": "USD",
    "trigger": {"metric": "loss_index", "unit": "pts", "threshold": 0, "direction": "above"},
    "payout": {"shape": "linear", "rate": 100},
    "limit": 2000000,
    "data_sources": ["KMA"]
}"#;

/// Same product, but the trigger sits far beyond any plausible severity.
pub const UNREACHABLE_CANVAS: &str = r#"{
    "peril": "typhoon",
    "description": "Unreachable trigger",
    "region": "KR",
    "trigger": {"metric": "loss_index", "unit": "pts", "threshold": 1e12, "direction": "above"},
    "payout": {"shape": "linear", "rate": 100},
    "limit": 2000000
}"#;

pub const CANVAS_WITHOUT_LIMIT: &str = r#"{
    "peril": "typhoon",
    "description": "no limit",
    "region": "KR",
    "trigger": {"metric": "loss_index", "unit": "pts", "threshold": 0, "direction": "above"},
    "payout": {"shape": "linear", "rate": 100}
}"#;

pub const FREQUENCY: &str = r#"{
    "distribution": {"family": "negative_binomial",
        "r": {"value": 2.0, "p5": 1.0, "p95": 4.0},
        "p": {"value": 0.5, "p5": 0.3, "p95": 0.7}},
    "sources": ["KMA landfall records"],
    "rationale": "Active seasons cluster landfalls.",
    "confidence": 0.6
}"#;

pub fn severity(sigma: f64) -> String {
    format!(
        r#"{{"distribution": {{"family": "lognormal",
            "mu": {{"value": 9.0, "p5": 8.5, "p95": 9.5}},
            "sigma": {{"value": {sigma}, "p5": 0.3, "p95": 0.7}}}},
        "unit": "pts", "sources": ["JMA best track"], "rationale": "Index spread.",
        "confidence": 0.5}}"#
    )
}

pub const CONSISTENT: &str = r#"{"consistent": true, "issues": []}"#;

pub const TAIL: &str = r#"{"scenarios": [
    {"name": "Maemi-class", "severity": 15000, "annual_probability": 0.01, "rationale": "2003"},
    {"name": "Twin landfall", "severity": 20000, "annual_probability": 0.005, "rationale": "2012"},
    {"name": "Record season", "severity": 25000, "annual_probability": 0.002, "rationale": "1959"}
]}"#;

/// A well-behaved collaborator: every prompt gets a valid answer first time.
pub fn happy(canvas: &'static str, sigma: f64) -> impl Fn(&LlmRequest, usize) -> Result<String, LlmCallError> + Send + Sync {
    move |req, _| {
        Ok(match req.tool {
            "peril_canvas" => canvas.to_string(),
            "frequency_prior" => FREQUENCY.to_string(),
            "severity_prior" => severity(sigma),
            "prior_critique" => CONSISTENT.to_string(),
            "tail_scenarios" => TAIL.to_string(),
            other => panic!("unexpected tool {other}"),
        })
    }
}

/// Recorded output for the canonical seed-42 run of [`CANVAS`] with
/// [`happy`] priors at sigma 0.5.
#[derive(Debug, serde::Deserialize)]
pub struct Golden {
    pub seed: u64,
    pub years: u32,
    pub tail_years: usize,
    pub expected_loss: f64,
    pub std_dev: f64,
    pub coefficient_of_variation: f64,
    pub risk_load: f64,
    pub gross_premium: f64,
    pub var_99: f64,
    pub tvar_99: f64,
}

pub fn golden() -> Golden {
    serde_json::from_str(include_str!("../fixtures/golden_seed42.json")).unwrap()
}
