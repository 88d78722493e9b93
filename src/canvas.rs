use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::ElicitationConfig;
use crate::error::{CanvasGenerationError, PricingError};
use crate::llm::tool::{Tool, ToolError, ToolRunner};
use crate::llm::{LlmClient, Transcript};
use crate::types::Stage;

/// Peril categories offered to the model. `other` keeps the list open.
pub const PERIL_CATEGORIES: &[&str] = &[
    "typhoon",
    "flood",
    "earthquake",
    "drought",
    "heatwave",
    "flight_delay",
    "event_cancellation",
    "server_downtime",
    "crop_yield",
    "other",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerDirection {
    /// Pays when the metric exceeds the threshold (wind speed, delay minutes).
    Above,
    /// Pays when the metric falls below it (central pressure, rainfall).
    Below,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerCondition {
    pub metric: String,
    pub unit: String,
    pub threshold: f64,
    pub direction: TriggerDirection,
}

impl TriggerCondition {
    /// Distance past the threshold in the payout direction, floored at 0.
    pub fn excess(&self, value: f64) -> f64 {
        if !value.is_finite() {
            return 0.0;
        }
        let excess = match self.direction {
            TriggerDirection::Above => value - self.threshold,
            TriggerDirection::Below => self.threshold - value,
        };
        excess.max(0.0)
    }

    /// Moves a triggering `value` so its excess grows by `factor`. Values that
    /// do not trigger come back unchanged.
    pub fn scale_severity(&self, value: f64, factor: f64) -> f64 {
        if self.excess(value) <= 0.0 {
            return value;
        }
        match self.direction {
            TriggerDirection::Above => self.threshold + (value - self.threshold) * factor,
            TriggerDirection::Below => self.threshold - (self.threshold - value) * factor,
        }
    }
}

/// Payout as a function of trigger excess, before the limit is applied.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum PayoutCurve {
    /// `rate` per unit of excess.
    Linear { rate: f64 },
    /// `amount` per completed `width` of excess.
    Step { width: f64, amount: f64 },
    /// `scale · ln(1 + excess)`.
    Logarithmic { scale: f64 },
    /// Fixed `amount` once triggered.
    Binary { amount: f64 },
}

impl PayoutCurve {
    pub fn shape(&self) -> &'static str {
        match self {
            PayoutCurve::Linear { .. } => "linear",
            PayoutCurve::Step { .. } => "step",
            PayoutCurve::Logarithmic { .. } => "logarithmic",
            PayoutCurve::Binary { .. } => "binary",
        }
    }

    pub fn problems(&self) -> Vec<String> {
        let positive = |name: &str, v: f64| -> Option<String> {
            (!(v.is_finite() && v > 0.0))
                .then(|| format!("payout {name} must be finite and > 0, got {v}"))
        };
        match *self {
            PayoutCurve::Linear { rate } => positive("rate", rate).into_iter().collect(),
            PayoutCurve::Step { width, amount } => {
                [positive("width", width), positive("amount", amount)].into_iter().flatten().collect()
            }
            PayoutCurve::Logarithmic { scale } => positive("scale", scale).into_iter().collect(),
            PayoutCurve::Binary { amount } => positive("amount", amount).into_iter().collect(),
        }
    }

    /// Unclipped payout. Zero for non-positive or non-finite excess.
    pub fn raw(&self, excess: f64) -> f64 {
        if !(excess.is_finite() && excess > 0.0) {
            return 0.0;
        }
        match *self {
            PayoutCurve::Linear { rate } => rate * excess,
            PayoutCurve::Step { width, amount } => amount * (excess / width).floor(),
            PayoutCurve::Logarithmic { scale } => scale * excess.ln_1p(),
            PayoutCurve::Binary { amount } => amount,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerilCanvas {
    pub peril: String,
    pub description: String,
    pub region: String,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub trigger: TriggerCondition,
    pub payout: PayoutCurve,
    pub limit: f64,
    #[serde(default)]
    pub data_sources: Vec<String>,
}

fn default_currency() -> String {
    "USD".to_string()
}

impl PerilCanvas {
    /// Payout for an excess, clipped to `[0, limit]`.
    pub fn payout_for_excess(&self, excess: f64) -> f64 {
        let raw = self.payout.raw(excess);
        if raw.is_nan() { 0.0 } else { raw.clamp(0.0, self.limit) }
    }

    /// Payout for one event observed at `severity` (trigger-metric units).
    pub fn payout(&self, severity: f64) -> f64 {
        self.payout_for_excess(self.trigger.excess(severity))
    }

    /// Everything that makes this canvas unusable for pricing.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.peril.trim().is_empty() {
            problems.push("peril must not be empty".to_string());
        }
        if self.trigger.metric.trim().is_empty() {
            problems.push("trigger metric must not be empty".to_string());
        }
        if !self.trigger.threshold.is_finite() {
            problems.push(format!("trigger threshold must be finite, got {}", self.trigger.threshold));
        }
        if !(self.limit.is_finite() && self.limit > 0.0) {
            problems.push(format!("limit must be finite and > 0, got {}", self.limit));
        }
        let curve = self.payout.problems();
        if curve.is_empty() && problems.is_empty() {
            problems.extend(self.monotonicity_violation());
        }
        problems.extend(curve);
        problems
    }

    /// Probes the clipped curve on a geometric excess grid: payout(0) must be
    /// 0 and the curve must never decrease.
    fn monotonicity_violation(&self) -> Option<String> {
        let zero = self.payout_for_excess(0.0);
        if zero != 0.0 {
            return Some(format!("payout at zero excess must be 0, got {zero}"));
        }
        let scale = self.trigger.threshold.abs().max(1.0);
        let mut previous = 0.0;
        for step in -12..=24 {
            let excess = scale * 2f64.powi(step);
            let payout = self.payout_for_excess(excess);
            if payout < previous {
                return Some(format!(
                    "payout curve decreases between excess {} and {excess}",
                    excess / 2.0
                ));
            }
            previous = payout;
        }
        None
    }
}

pub fn normalize_peril(peril: &str) -> String {
    peril
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect::<String>()
        .split('_')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

struct CanvasTool<'a> {
    description: &'a str,
}

impl Tool for CanvasTool<'_> {
    type Output = PerilCanvas;
    const NAME: &'static str = "peril_canvas";

    fn instructions(&self) -> String {
        format!(
            "You are a parametric insurance product designer. Turn a plain-language \
             description of an insurable event into a structured peril canvas.\n\
             Peril categories: {}.\n\
             Choose a measurable trigger metric with a unit and a threshold, and whether \
             payouts start above or below it. Choose a payout curve: linear (rate per unit \
             of excess), step (amount per completed width of excess), logarithmic \
             (scale x ln(1 + excess)) or binary (fixed amount once triggered). All curve \
             parameters and the limit must be positive. List the public data sources that \
             would settle the trigger.",
            PERIL_CATEGORIES.join(", ")
        )
    }

    fn schema(&self) -> serde_json::Value {
        json!({
            "peril": "typhoon",
            "description": "Typhoon landfall with central pressure below 950 hPa",
            "region": "Korea",
            "currency": "USD",
            "trigger": {
                "metric": "central_pressure",
                "unit": "hPa",
                "threshold": 950.0,
                "direction": "below"
            },
            "payout": { "shape": "linear", "rate": 20000.0 },
            "limit": 1000000.0,
            "data_sources": ["JMA best track", "KMA"]
        })
    }

    fn prompt(&self) -> String {
        format!("Describe this insurable event as a peril canvas:\n{}", self.description)
    }

    fn check(&self, output: &PerilCanvas) -> Vec<String> {
        output.problems()
    }
}

/// Turns a free-text description into a validated canvas. Invalid canvases
/// are re-asked with the problem list up to `canvas_attempts` more times.
pub async fn generate_canvas<C: LlmClient>(
    runner: &ToolRunner<'_, C>,
    description: &str,
    elicitation: &ElicitationConfig,
    transcript: &mut Transcript,
) -> Result<PerilCanvas, PricingError> {
    if description.trim().is_empty() {
        return Err(CanvasGenerationError {
            attempts: 0,
            reasons: vec!["description is empty".to_string()],
        }
        .into());
    }

    let tool = CanvasTool { description };
    match runner.run(Stage::Canvas, &tool, elicitation.canvas_attempts, transcript).await {
        Ok(mut canvas) => {
            canvas.peril = normalize_peril(&canvas.peril);
            tracing::info!(
                peril = %canvas.peril,
                metric = %canvas.trigger.metric,
                limit = canvas.limit,
                "peril canvas accepted"
            );
            Ok(canvas)
        }
        Err(ToolError::Call(err)) => Err(err.into()),
        Err(ToolError::Malformed { attempts, problems }) => {
            Err(CanvasGenerationError { attempts, reasons: problems }.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PricingConfig;
    use crate::llm::scripted::ScriptedClient;
    use proptest::prelude::*;

    fn canvas(payout: PayoutCurve, direction: TriggerDirection) -> PerilCanvas {
        PerilCanvas {
            peril: "typhoon".into(),
            description: "test".into(),
            region: "KR".into(),
            currency: "USD".into(),
            trigger: TriggerCondition {
                metric: "central_pressure".into(),
                unit: "hPa".into(),
                threshold: 950.0,
                direction,
            },
            payout,
            limit: 1_000_000.0,
            data_sources: vec![],
        }
    }

    fn all_curves() -> Vec<PayoutCurve> {
        vec![
            PayoutCurve::Linear { rate: 20_000.0 },
            PayoutCurve::Step { width: 5.0, amount: 100_000.0 },
            PayoutCurve::Logarithmic { scale: 250_000.0 },
            PayoutCurve::Binary { amount: 400_000.0 },
        ]
    }

    #[test]
    fn below_trigger_pays_on_low_values() {
        let c = canvas(PayoutCurve::Linear { rate: 20_000.0 }, TriggerDirection::Below);
        assert_eq!(c.payout(960.0), 0.0);
        assert_eq!(c.payout(950.0), 0.0);
        assert_eq!(c.payout(940.0), 200_000.0);
        assert_eq!(c.payout(800.0), 1_000_000.0, "clipped at limit");
    }

    #[test]
    fn step_pays_per_completed_width() {
        let c = canvas(PayoutCurve::Step { width: 5.0, amount: 100_000.0 }, TriggerDirection::Above);
        assert_eq!(c.payout(954.9), 0.0);
        assert_eq!(c.payout(955.0), 100_000.0);
        assert_eq!(c.payout(969.0), 300_000.0);
    }

    #[test]
    fn binary_pays_fixed_amount_once_triggered() {
        let c = canvas(PayoutCurve::Binary { amount: 400_000.0 }, TriggerDirection::Above);
        assert_eq!(c.payout(950.0), 0.0);
        assert_eq!(c.payout(950.001), 400_000.0);
    }

    #[test]
    fn non_finite_severity_pays_nothing() {
        for curve in all_curves() {
            let c = canvas(curve, TriggerDirection::Above);
            assert_eq!(c.payout(f64::NAN), 0.0);
            assert_eq!(c.payout(f64::INFINITY), 0.0);
        }
    }

    #[test]
    fn valid_canvases_have_no_problems() {
        for curve in all_curves() {
            assert!(canvas(curve, TriggerDirection::Below).problems().is_empty(), "{curve:?}");
        }
    }

    #[test]
    fn invalid_parameters_are_listed() {
        let mut c = canvas(PayoutCurve::Step { width: 0.0, amount: -1.0 }, TriggerDirection::Above);
        c.limit = 0.0;
        let problems = c.problems();
        assert_eq!(problems.len(), 3, "{problems:?}");
        assert!(problems.iter().any(|p| p.contains("limit")));
        assert!(problems.iter().any(|p| p.contains("width")));
    }

    #[test]
    fn canvas_json_uses_tagged_payout() {
        let c = canvas(PayoutCurve::Logarithmic { scale: 2.0 }, TriggerDirection::Below);
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["payout"]["shape"], "logarithmic");
        assert_eq!(json["trigger"]["direction"], "below");
    }

    #[test]
    fn peril_names_are_snake_case() {
        assert_eq!(normalize_peril("  Flight Delay "), "flight_delay");
        assert_eq!(normalize_peril("server-downtime"), "server_downtime");
    }

    proptest! {
        #[test]
        fn payout_is_bounded_and_monotone(
            curve_ix in 0usize..4,
            a in -1.0e6f64..1.0e6,
            b in -1.0e6f64..1.0e6,
        ) {
            let c = canvas(all_curves()[curve_ix], TriggerDirection::Above);
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let p_lo = c.payout_for_excess(lo);
            let p_hi = c.payout_for_excess(hi);
            prop_assert!((0.0..=c.limit).contains(&p_lo));
            prop_assert!((0.0..=c.limit).contains(&p_hi));
            prop_assert!(p_lo <= p_hi, "payout({lo})={p_lo} > payout({hi})={p_hi}");
            prop_assert_eq!(c.payout_for_excess(0.0), 0.0);
        }
    }

    fn canvas_json(limit: f64) -> String {
        serde_json::to_string(&PerilCanvas {
            limit,
            peril: "Flight Delay".into(),
            ..canvas(PayoutCurve::Linear { rate: 1_000.0 }, TriggerDirection::Above)
        })
        .unwrap()
    }

    #[tokio::test]
    async fn reformulates_until_canvas_is_valid() {
        let client = ScriptedClient::new(|_, nth| match nth {
            0 => Ok(r#"{"peril": "flight_delay"}"#.to_string()),
            1 => Ok(canvas_json(-5.0)),
            _ => Ok(canvas_json(50_000.0)),
        });
        let cfg = PricingConfig::canonical();
        let runner = ToolRunner::new(&client, &cfg);
        let mut transcript = Transcript::default();
        let c = generate_canvas(&runner, "flights out of ICN delayed over 3h", &cfg.elicitation, &mut transcript)
            .await
            .unwrap();
        assert_eq!(c.peril, "flight_delay");
        assert_eq!(c.limit, 50_000.0);
        assert_eq!(transcript.len(), 3);
    }

    #[tokio::test]
    async fn gives_up_after_bounded_attempts() {
        let client = ScriptedClient::new(|_, _| Ok(canvas_json(0.0)));
        let cfg = PricingConfig::canonical();
        let runner = ToolRunner::new(&client, &cfg);
        let mut transcript = Transcript::default();
        let err = generate_canvas(&runner, "something", &cfg.elicitation, &mut transcript)
            .await
            .unwrap_err();
        match err {
            PricingError::CanvasGeneration(e) => {
                assert_eq!(e.attempts, 3);
                assert!(e.reasons[0].contains("limit"));
            }
            other => panic!("expected CanvasGeneration, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_description_never_reaches_the_model() {
        let client = ScriptedClient::new(|_, _| Ok(String::new()));
        let cfg = PricingConfig::canonical();
        let runner = ToolRunner::new(&client, &cfg);
        let mut transcript = Transcript::default();
        let err = generate_canvas(&runner, "   ", &cfg.elicitation, &mut transcript).await.unwrap_err();
        assert!(matches!(err, PricingError::CanvasGeneration(_)));
        assert_eq!(client.calls_for(CanvasTool::NAME), 0);
    }
}
