//! Elicits frequency and severity priors for a canvas, then reviews them.
//!
//! The structural schema check happens inside the tool runner (repair
//! reprompts). Semantic problems such as a negative sigma or a band that does
//! not bracket its estimate are left for the critique loop, which either gets
//! them corrected within its round budget or fails the request. Values are
//! never clamped into range.

use serde::Deserialize;
use serde_json::json;

use crate::canvas::{PerilCanvas, TriggerDirection};
use crate::config::PricingConfig;
use crate::error::{PriorInconsistencyError, PricingError};
use crate::llm::tool::{Tool, ToolError, ToolRunner};
use crate::llm::{LlmClient, Transcript};
use crate::priors::{FrequencyModel, FrequencyPrior, Priors, SeverityModel, SeverityPrior, TailScenario};
use crate::types::Stage;

fn canvas_brief(canvas: &PerilCanvas) -> String {
    let direction = match canvas.trigger.direction {
        TriggerDirection::Above => "above",
        TriggerDirection::Below => "below",
    };
    format!(
        "Peril: {} in {}\nDescription: {}\nTrigger: {} ({}) {} {}\nLimit: {} {}",
        canvas.peril,
        canvas.region,
        canvas.description,
        canvas.trigger.metric,
        canvas.trigger.unit,
        direction,
        canvas.trigger.threshold,
        canvas.limit,
        canvas.currency,
    )
}

/// Family the model is steered towards for a trigger metric.
fn suggested_severity_family(canvas: &PerilCanvas) -> &'static str {
    let metric = canvas.trigger.metric.to_lowercase();
    if metric.contains("downtime") || metric.contains("outage") {
        "exponential"
    } else if ["wind", "delay", "magnitude", "deficit", "precipitation", "rain"]
        .iter()
        .any(|k| metric.contains(k))
    {
        "gamma"
    } else {
        "lognormal"
    }
}

fn justification_problems(sources: &[String], rationale: &str) -> Vec<String> {
    let mut problems = Vec::new();
    if sources.iter().all(|s| s.trim().is_empty()) {
        problems.push("cite at least one source".to_string());
    }
    if rationale.trim().is_empty() {
        problems.push("rationale must not be empty".to_string());
    }
    problems
}

struct FrequencyTool<'a> {
    canvas: &'a PerilCanvas,
}

impl Tool for FrequencyTool<'_> {
    type Output = FrequencyPrior;
    const NAME: &'static str = "frequency_prior";

    fn instructions(&self) -> String {
        "You are a catastrophe modelling actuary. Give an expert prior for the annual \
         number of trigger events. Use negative_binomial (r, p: failures before r successes, \
         mean r(1-p)/p) for overdispersed counts, otherwise poisson (lambda). For every \
         parameter give the best estimate and its 5th and 95th percentile. Cite sources and \
         explain the reasoning. Do not invent precision you do not have."
            .to_string()
    }

    fn schema(&self) -> serde_json::Value {
        json!({
            "distribution": {
                "family": "negative_binomial",
                "r": { "value": 2.0, "p5": 1.2, "p95": 3.5 },
                "p": { "value": 0.5, "p5": 0.35, "p95": 0.65 }
            },
            "sources": ["KMA typhoon landfall records 1951-2023"],
            "rationale": "Landfalls cluster in active seasons, so counts are overdispersed.",
            "confidence": 0.7
        })
    }

    fn prompt(&self) -> String {
        format!("Annual frequency prior for:\n{}", canvas_brief(self.canvas))
    }

    fn check(&self, output: &FrequencyPrior) -> Vec<String> {
        justification_problems(&output.sources, &output.rationale)
    }
}

struct SeverityTool<'a> {
    canvas: &'a PerilCanvas,
}

impl Tool for SeverityTool<'_> {
    type Output = SeverityPrior;
    const NAME: &'static str = "severity_prior";

    fn instructions(&self) -> String {
        format!(
            "You are a catastrophe modelling actuary. Give an expert prior for the value of \
             the trigger metric ({}, in {}) observed in each event. Families: lognormal (mu, \
             sigma in log space), gamma (shape, scale), exponential (rate), pareto (scale, \
             shape). A {} family usually suits this metric. For every parameter give the best \
             estimate and its 5th and 95th percentile. Cite sources and explain the reasoning.",
            self.canvas.trigger.metric,
            self.canvas.trigger.unit,
            suggested_severity_family(self.canvas),
        )
    }

    fn schema(&self) -> serde_json::Value {
        json!({
            "distribution": {
                "family": "lognormal",
                "mu": { "value": 6.85, "p5": 6.8, "p95": 6.9 },
                "sigma": { "value": 0.02, "p5": 0.01, "p95": 0.04 }
            },
            "unit": "hPa",
            "sources": ["JMA best track archive"],
            "rationale": "Landfall pressures centre near 945 hPa with a thin spread.",
            "confidence": 0.6
        })
    }

    fn prompt(&self) -> String {
        format!("Per-event severity prior for:\n{}", canvas_brief(self.canvas))
    }

    fn check(&self, output: &SeverityPrior) -> Vec<String> {
        justification_problems(&output.sources, &output.rationale)
    }
}

#[derive(Debug, Default, Deserialize)]
struct Corrections {
    #[serde(default)]
    frequency: Option<FrequencyModel>,
    #[serde(default)]
    severity: Option<SeverityModel>,
}

#[derive(Debug, Deserialize)]
struct CritiqueVerdict {
    consistent: bool,
    #[serde(default)]
    issues: Vec<String>,
    #[serde(default)]
    corrections: Corrections,
}

struct CritiqueTool<'a> {
    canvas: &'a PerilCanvas,
    priors: &'a Priors,
    local_issues: &'a [String],
}

impl Tool for CritiqueTool<'_> {
    type Output = CritiqueVerdict;
    const NAME: &'static str = "prior_critique";

    fn instructions(&self) -> String {
        "You review actuarial priors. Decide whether each parameter is inside its \
         mathematical domain and self-consistent with its stated 5th-95th percentile band, \
         and whether the implied means are plausible for the peril. If anything is wrong, \
         set consistent to false, list the issues and return complete corrected \
         distributions (same JSON shape, including bands) under corrections."
            .to_string()
    }

    fn schema(&self) -> serde_json::Value {
        json!({
            "consistent": false,
            "issues": ["severity sigma must be positive"],
            "corrections": {
                "severity": {
                    "family": "lognormal",
                    "mu": { "value": 6.85, "p5": 6.8, "p95": 6.9 },
                    "sigma": { "value": 0.02, "p5": 0.01, "p95": 0.04 }
                }
            }
        })
    }

    fn prompt(&self) -> String {
        let current = json!({
            "frequency": self.priors.frequency.distribution,
            "severity": self.priors.severity.distribution,
        });
        let mut prompt = format!(
            "{}\n\nCurrent priors:\n{}\nImplied mean events per year: {}\nImplied mean \
             severity: {}\n\nAre these parameters self-consistent with the stated percentile \
             bands?",
            canvas_brief(self.canvas),
            serde_json::to_string_pretty(&current).unwrap_or_default(),
            self.priors.frequency.distribution.mean(),
            self.priors.severity.distribution.mean(),
        );
        if !self.local_issues.is_empty() {
            prompt.push_str("\nAutomated checks already found:\n");
            for issue in self.local_issues {
                prompt.push_str(&format!("- {issue}\n"));
            }
        }
        prompt
    }
}

#[derive(Debug, Deserialize)]
struct TailResponse {
    scenarios: Vec<TailScenario>,
}

struct TailTool<'a> {
    canvas: &'a PerilCanvas,
    severity: &'a SeverityModel,
    count: usize,
}

impl Tool for TailTool<'_> {
    type Output = TailResponse;
    const NAME: &'static str = "tail_scenarios";

    fn instructions(&self) -> String {
        format!(
            "You are a catastrophe risk analyst. Name {} plausible black-swan events for this \
             peril that sit beyond the body of the severity prior. Give each one's trigger \
             metric value, its annual probability and a short rationale.",
            self.count
        )
    }

    fn schema(&self) -> serde_json::Value {
        json!({
            "scenarios": [{
                "name": "Super typhoon landfall",
                "severity": 905.0,
                "annual_probability": 0.01,
                "rationale": "Comparable to Typhoon Maemi (2003)."
            }]
        })
    }

    fn prompt(&self) -> String {
        format!(
            "{}\nSeverity prior: {} with mean {}",
            canvas_brief(self.canvas),
            self.severity.family(),
            self.severity.mean()
        )
    }

    fn check(&self, output: &TailResponse) -> Vec<String> {
        let mut problems: Vec<String> = output.scenarios.iter().flat_map(TailScenario::issues).collect();
        if output.scenarios.len() < self.count {
            problems.push(format!(
                "expected {} scenarios, got {}",
                self.count,
                output.scenarios.len()
            ));
        }
        problems
    }
}

enum CritiqueState {
    Reviewing { round: u32, priors: Priors },
    Accepted(Priors),
    Exhausted { rounds: u32, issues: Vec<String> },
}

fn malformed_prior(err: ToolError) -> PricingError {
    match err {
        ToolError::Call(e) => e.into(),
        ToolError::Malformed { problems, .. } => {
            PriorInconsistencyError { rounds: 0, issues: problems }.into()
        }
    }
}

fn corrected(mut priors: Priors, corrections: Corrections) -> Priors {
    if let Some(frequency) = corrections.frequency {
        priors.frequency.distribution = frequency;
    }
    if let Some(severity) = corrections.severity {
        priors.severity.distribution = severity;
    }
    priors
}

async fn critique<C: LlmClient>(
    runner: &ToolRunner<'_, C>,
    canvas: &PerilCanvas,
    priors: Priors,
    config: &PricingConfig,
    transcript: &mut Transcript,
) -> Result<Priors, PricingError> {
    let max_rounds = config.elicitation.critique_iterations;
    if max_rounds == 0 {
        let issues = priors.issues();
        return if issues.is_empty() {
            Ok(priors)
        } else {
            Err(PriorInconsistencyError { rounds: 0, issues }.into())
        };
    }

    let mut state = CritiqueState::Reviewing { round: 1, priors };
    loop {
        state = match state {
            CritiqueState::Accepted(priors) => return Ok(priors),
            CritiqueState::Exhausted { rounds, issues } => {
                tracing::warn!(rounds, issues = issues.len(), "priors rejected after critique");
                return Err(PriorInconsistencyError { rounds, issues }.into());
            }
            CritiqueState::Reviewing { round, priors } => {
                let local = priors.issues();
                let tool = CritiqueTool { canvas, priors: &priors, local_issues: &local };
                let verdict = match runner
                    .run(Stage::Priors, &tool, config.elicitation.repair_attempts, transcript)
                    .await
                {
                    Ok(verdict) => verdict,
                    Err(ToolError::Call(e)) => return Err(e.into()),
                    Err(ToolError::Malformed { problems, .. }) => CritiqueVerdict {
                        consistent: false,
                        issues: problems,
                        corrections: Corrections::default(),
                    },
                };
                tracing::info!(
                    round,
                    local_issues = local.len(),
                    consistent = verdict.consistent,
                    "prior critique round"
                );

                if local.is_empty() && verdict.consistent {
                    CritiqueState::Accepted(Priors { critique_rounds: round, ..priors })
                } else if round >= max_rounds {
                    let mut issues = local;
                    if !verdict.consistent {
                        if verdict.issues.is_empty() {
                            issues.push("reviewer reported unresolved inconsistency".to_string());
                        }
                        issues.extend(verdict.issues);
                    }
                    issues.dedup();
                    CritiqueState::Exhausted { rounds: round, issues }
                } else {
                    CritiqueState::Reviewing {
                        round: round + 1,
                        priors: corrected(priors, verdict.corrections),
                    }
                }
            }
        };
    }
}

/// Frequency and severity priors for `canvas`, reviewed and with tail
/// scenarios attached. Both elicitation prompts run concurrently.
pub async fn extract_priors<C: LlmClient>(
    runner: &ToolRunner<'_, C>,
    canvas: &PerilCanvas,
    config: &PricingConfig,
    transcript: &mut Transcript,
) -> Result<Priors, PricingError> {
    let repairs = config.elicitation.repair_attempts;
    let mut frequency_log = Transcript::default();
    let mut severity_log = Transcript::default();
    let (frequency_tool, severity_tool) = (FrequencyTool { canvas }, SeverityTool { canvas });
    let (frequency, severity) = tokio::join!(
        runner.run(Stage::Priors, &frequency_tool, repairs, &mut frequency_log),
        runner.run(Stage::Priors, &severity_tool, repairs, &mut severity_log),
    );
    transcript.append(frequency_log);
    transcript.append(severity_log);

    let priors = Priors {
        frequency: frequency.map_err(malformed_prior)?,
        severity: severity.map_err(malformed_prior)?,
        tail: Vec::new(),
        critique_rounds: 0,
    };

    let priors = critique(runner, canvas, priors, config, transcript).await?;

    let count = config.simulation.tail_scenarios as usize;
    let tail = if count == 0 {
        Vec::new()
    } else {
        let tool = TailTool { canvas, severity: &priors.severity.distribution, count };
        let mut response = runner
            .run(Stage::Priors, &tool, repairs, transcript)
            .await
            .map_err(malformed_prior)?;
        response.scenarios.truncate(count);
        response.scenarios
    };

    tracing::info!(
        frequency_mean = priors.frequency.distribution.mean(),
        severity_family = priors.severity.distribution.family(),
        critique_rounds = priors.critique_rounds,
        tail_scenarios = tail.len(),
        "priors accepted"
    );
    Ok(Priors { tail, ..priors })
}
