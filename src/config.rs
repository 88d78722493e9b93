use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::llm::retry::RetryConfig;
use crate::types::RiskLevel;

/// Everything a request needs besides its description. Shared immutably
/// across concurrent requests.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    pub llm: LlmConfig,
    pub retry: RetryConfig,
    pub elicitation: ElicitationConfig,
    pub simulation: SimulationConfig,
    pub pricing: PricingParams,
    pub validation: ValidationConfig,
    pub benchmarks: BenchmarkTable,
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub endpoint: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    /// Name of the environment variable holding the API key. The key itself
    /// never lives in config files.
    pub api_key_env: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        LlmConfig {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.1,
            max_tokens: 1500,
            timeout_secs: 30,
            api_key_env: "OPENAI_API_KEY".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElicitationConfig {
    /// Corrective reformulations after the first canvas attempt.
    pub canvas_attempts: u32,
    /// Repair reprompts for a structurally malformed prior or tail response.
    pub repair_attempts: u32,
    pub critique_iterations: u32,
}

impl Default for ElicitationConfig {
    fn default() -> Self {
        ElicitationConfig { canvas_attempts: 2, repair_attempts: 2, critique_iterations: 2 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub seed: u64,
    pub years: u32,
    pub tail_scenarios: u32,
    pub batch_years: u32,
    /// Year count at or above which batches are sampled on the rayon pool.
    pub parallel_threshold: u32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            seed: 42,
            years: 1000,
            tail_scenarios: 3,
            batch_years: 250,
            parallel_threshold: 1000,
        }
    }
}

/// Denominator of the probable-maximum-loss ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PmlBasis {
    Limit,
    ExpectedLoss,
}

/// Upper bounds of the LOW, MEDIUM and HIGH bands; anything at or above
/// `high` is VERY_HIGH.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bands {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
}

impl Bands {
    /// Bands must be finite and strictly increasing.
    fn validate(&self, name: &str) -> Result<(), String> {
        let ordered = self.low < self.medium && self.medium < self.high;
        if [self.low, self.medium, self.high].iter().all(|b| b.is_finite()) && ordered {
            Ok(())
        } else {
            Err(format!(
                "{name} bands must satisfy low < medium < high, got {} / {} / {}",
                self.low, self.medium, self.high
            ))
        }
    }

    pub fn level(&self, value: f64) -> RiskLevel {
        if value < self.low {
            RiskLevel::Low
        } else if value < self.medium {
            RiskLevel::Medium
        } else if value < self.high {
            RiskLevel::High
        } else {
            RiskLevel::VeryHigh
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskThresholds {
    pub cov: Bands,
    pub loss_ratio: Bands,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        RiskThresholds {
            cov: Bands { low: 0.3, medium: 0.6, high: 0.8 },
            loss_ratio: Bands { low: 0.05, medium: 0.15, high: 0.30 },
        }
    }
}

impl RiskThresholds {
    /// The more severe of the volatility and loss-ratio levels.
    pub fn classify(&self, cov: f64, loss_ratio: f64) -> RiskLevel {
        self.cov.level(cov).max(self.loss_ratio.level(loss_ratio))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingParams {
    pub base_margin: f64,
    pub sensitivity: f64,
    pub risk_load_floor: f64,
    pub confidence_level: f64,
    pub pml_basis: PmlBasis,
    pub thresholds: RiskThresholds,
}

impl Default for PricingParams {
    fn default() -> Self {
        PricingParams {
            base_margin: 0.15,
            sensitivity: 0.5,
            risk_load_floor: 0.20,
            confidence_level: 0.99,
            pml_basis: PmlBasis::Limit,
            thresholds: RiskThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub loss_ratio_min: f64,
    pub loss_ratio_max: f64,
    pub max_cov: f64,
    pub max_pml_ratio: f64,
    /// Ceiling of the final risk load; the floor is 0.
    pub max_risk_load: f64,
    /// A final risk load under this raises an alert.
    pub low_risk_load_alert: f64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        ValidationConfig {
            loss_ratio_min: 0.0,
            loss_ratio_max: 1.5,
            max_cov: 5.0,
            max_pml_ratio: 100.0,
            max_risk_load: 2.0,
            low_risk_load_alert: 0.15,
        }
    }
}

/// Market reference figures for one peril. Ranges are `[low, high]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Benchmark {
    pub expected_loss: [f64; 2],
    pub cov: [f64; 2],
    pub risk_load: f64,
    /// Gross premium as a share of the limit.
    pub rate_on_line: [f64; 2],
}

impl Benchmark {
    const fn new(expected_loss: [f64; 2], cov: [f64; 2], risk_load: f64, rate_on_line: [f64; 2]) -> Self {
        Benchmark { expected_loss, cov, risk_load, rate_on_line }
    }
}

/// Benchmarks keyed by peril name, with a fallback for perils not listed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchmarkTable {
    pub default: Benchmark,
    pub perils: BTreeMap<String, Benchmark>,
}

impl Default for BenchmarkTable {
    fn default() -> Self {
        let perils = [
            ("typhoon", Benchmark::new([50_000.0, 200_000.0], [0.4, 0.8], 0.35, [0.15, 0.25])),
            ("flight_delay", Benchmark::new([10_000.0, 50_000.0], [0.3, 0.6], 0.25, [0.10, 0.20])),
            ("server_downtime", Benchmark::new([5_000.0, 100_000.0], [0.5, 1.0], 0.40, [0.20, 0.30])),
            ("earthquake", Benchmark::new([20_000.0, 500_000.0], [0.6, 1.2], 0.50, [0.25, 0.40])),
        ];
        BenchmarkTable {
            default: Benchmark::new([10_000.0, 100_000.0], [0.3, 0.8], 0.30, [0.15, 0.25]),
            perils: perils.into_iter().map(|(k, b)| (k.to_string(), b)).collect(),
        }
    }
}

impl BenchmarkTable {
    /// Looks `peril` up case-insensitively, treating spaces and hyphens as
    /// underscores. Returns the matched key, or `"default"`.
    pub fn lookup(&self, peril: &str) -> (&str, &Benchmark) {
        let key: String = peril
            .trim()
            .chars()
            .map(|c| if c == ' ' || c == '-' { '_' } else { c.to_ascii_lowercase() })
            .collect();
        match self.perils.get_key_value(&key) {
            Some((k, b)) => (k.as_str(), b),
            None => ("default", &self.default),
        }
    }

    fn validate(&self) -> Result<(), String> {
        let entries = std::iter::once(("default", &self.default))
            .chain(self.perils.iter().map(|(k, b)| (k.as_str(), b)));
        for (name, b) in entries {
            let ranges = [("expected_loss", b.expected_loss), ("cov", b.cov), ("rate_on_line", b.rate_on_line)];
            for (field, [lo, hi]) in ranges {
                if !(lo.is_finite() && hi.is_finite() && lo <= hi) {
                    return Err(format!("benchmark {name}.{field} range [{lo}, {hi}] is not ordered"));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub dir: PathBuf,
}

impl Default for AuditConfig {
    fn default() -> Self {
        AuditConfig { dir: PathBuf::from("audit") }
    }
}

impl PricingConfig {
    pub fn canonical() -> Self {
        // ── LLM collaborator ──────────────────────────────────────────────────
        // Low temperature: priors should be stable across reruns of the same
        // description; the seed only fixes the sampling half.
        let llm = LlmConfig::default();

        // ── Elicitation ───────────────────────────────────────────────────────
        let elicitation = ElicitationConfig::default();

        // ── Simulation ────────────────────────────────────────────────────────
        // 1000 baseline years plus 3 tail years keeps VaR99 off the last order
        // statistic.
        let simulation = SimulationConfig::default();

        // ── Pricing ───────────────────────────────────────────────────────────
        // Risk load = 0.15 + 0.5 × CoV, floored at 0.20.
        let pricing = PricingParams::default();

        PricingConfig {
            llm,
            retry: RetryConfig::default(),
            elicitation,
            simulation,
            pricing,
            validation: ValidationConfig::default(),
            benchmarks: BenchmarkTable::default(),
            audit: AuditConfig::default(),
        }
    }

    /// Reads a TOML file. Absent sections and keys take canonical values.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        let config =
            Self::from_toml(&text).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
        config.validate().map_err(|reason| ConfigError::Invalid { path: path.to_path_buf(), reason })?;
        Ok(config)
    }

    /// Cross-field checks that TOML types alone cannot express.
    pub fn validate(&self) -> Result<(), String> {
        let thresholds = &self.pricing.thresholds;
        thresholds.cov.validate("pricing.thresholds.cov")?;
        thresholds.loss_ratio.validate("pricing.thresholds.loss_ratio")?;
        self.benchmarks.validate()
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn api_key(&self) -> Result<ApiKey, ConfigError> {
        let var = &self.llm.api_key_env;
        match std::env::var(var) {
            Ok(key) if !key.trim().is_empty() => Ok(ApiKey(key)),
            _ => Err(ConfigError::MissingApiKey { var: var.clone() }),
        }
    }
}

/// Secret bearer token. `Debug` never prints it.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        ApiKey(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(<redacted>)")
    }
}
