//! Append-only audit trail: one JSON document per request holding every
//! exchange, parameter set and artifact, enough to replay the numeric half.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::canvas::PerilCanvas;
use crate::config::{PricingParams, SimulationConfig};
use crate::error::{AuditError, PricingError};
use crate::llm::Transcript;
use crate::pricer::{PricingResult, price};
use crate::priors::Priors;
use crate::scenarios::{ScenarioSet, generate_scenarios};
use crate::types::{CancelToken, RequestId, Stage};
use crate::validator::ValidationReport;

/// Who asked for what, and every LLM exchange made on their behalf so far.
#[derive(Debug, Clone, PartialEq)]
pub struct Provenance {
    pub request_id: RequestId,
    pub description: String,
    pub seed: u64,
    pub years: u32,
    pub transcript: Transcript,
}

impl Provenance {
    pub fn new(description: impl Into<String>, seed: u64, years: u32) -> Self {
        Provenance {
            request_id: RequestId::new(),
            description: description.into(),
            seed,
            years,
            transcript: Transcript::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub stage: Stage,
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub request_id: RequestId,
    pub created_at: DateTime<Utc>,
    pub description: String,
    pub seed: u64,
    pub years: u32,
    pub params: PricingParams,
    pub exchanges: Transcript,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canvas: Option<PerilCanvas>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priors: Option<Priors>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenarios: Option<ScenarioSet>,
    /// As priced, before any validator correction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<PricingResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureRecord>,
}

impl AuditRecord {
    /// An empty record for `provenance`; artifacts are filled in by the caller.
    pub fn open(provenance: &Provenance, params: &PricingParams) -> Self {
        AuditRecord {
            request_id: provenance.request_id,
            created_at: Utc::now(),
            description: provenance.description.clone(),
            seed: provenance.seed,
            years: provenance.years,
            params: params.clone(),
            exchanges: provenance.transcript.clone(),
            canvas: None,
            priors: None,
            scenarios: None,
            result: None,
            validation: None,
            failure: None,
        }
    }

    pub fn with_failure(mut self, stage: Stage, error: &PricingError) -> Self {
        self.failure = Some(FailureRecord {
            stage,
            kind: error.kind().to_string(),
            message: error.to_string(),
        });
        self
    }

    pub fn succeeded(&self) -> bool {
        self.failure.is_none() && self.validation.is_some()
    }
}

/// Durable sink for audit records. Implementations never overwrite a record.
pub trait AuditStore: Send + Sync {
    fn append(&self, record: &AuditRecord) -> Result<(), AuditError>;
}

/// Writes `<dir>/<request_id>.json`, refusing to replace an existing file.
#[derive(Debug, Clone)]
pub struct FileAuditStore {
    dir: PathBuf,
}

impl FileAuditStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileAuditStore { dir: dir.into() }
    }

    pub fn path_for(&self, id: RequestId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    pub fn load(path: &Path) -> Result<AuditRecord, AuditError> {
        let file = File::open(path).map_err(io_error(path))?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}

impl AuditStore for FileAuditStore {
    fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
        fs::create_dir_all(&self.dir).map_err(io_error(&self.dir))?;

        let path = self.path_for(record.request_id);
        let file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(AuditError::AlreadyExists { path });
            }
            Err(e) => return Err(io_error(&path)(e)),
        };
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, record)?;
        writer.flush().map_err(io_error(&path))?;
        tracing::info!(path = %path.display(), "audit record written");
        Ok(())
    }
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> AuditError + use<> {
    let path = path.to_path_buf();
    move |source| AuditError::Io { path, source }
}

/// Keeps records in memory. Same append-only contract as the file store.
#[derive(Debug, Default)]
pub struct MemoryAuditStore {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl AuditStore for MemoryAuditStore {
    fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let mut records = self.records.lock().map_err(|_| AuditError::Io {
            path: PathBuf::from("<memory>"),
            source: io::Error::other("audit store lock poisoned"),
        })?;
        if records.iter().any(|r| r.request_id == record.request_id) {
            return Err(AuditError::AlreadyExists { path: PathBuf::from(record.request_id.to_string()) });
        }
        records.push(record.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplayOutcome {
    pub scenarios_match: bool,
    pub result_match: bool,
    pub result: PricingResult,
}

impl ReplayOutcome {
    pub fn reproduced(&self) -> bool {
        self.scenarios_match && self.result_match
    }
}

/// Regenerates the scenario set from the recorded canvas, priors and seed,
/// re-prices it with the recorded parameters and compares both against the
/// record.
pub fn replay(record: &AuditRecord, simulation: &SimulationConfig) -> Result<ReplayOutcome, PricingError> {
    let canvas = record.canvas.as_ref().ok_or(AuditError::Incomplete { missing: "canvas" })?;
    let priors = record.priors.as_ref().ok_or(AuditError::Incomplete { missing: "priors" })?;
    let recorded = record.scenarios.as_ref().ok_or(AuditError::Incomplete { missing: "scenario set" })?;
    let priced = record.result.as_ref().ok_or(AuditError::Incomplete { missing: "pricing result" })?;

    let scenarios = generate_scenarios(canvas, priors, record.years, record.seed, simulation, &CancelToken::new())?;
    let result = price(&scenarios, &canvas.peril, &record.params)?;
    Ok(ReplayOutcome {
        scenarios_match: &scenarios == recorded,
        result_match: &result == priced,
        result,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PricingConfig;
    use crate::scenarios::fixtures::{golden_canvas, golden_priors};

    fn priced_record() -> AuditRecord {
        let cfg = PricingConfig::canonical();
        let provenance = Provenance::new("golden typhoon cover", 42, 1000);
        let scenarios =
            generate_scenarios(&golden_canvas(), &golden_priors(), 1000, 42, &cfg.simulation, &CancelToken::new())
                .unwrap();
        let result = price(&scenarios, "typhoon", &cfg.pricing).unwrap();
        let mut record = AuditRecord::open(&provenance, &cfg.pricing);
        record.canvas = Some(golden_canvas());
        record.priors = Some(golden_priors());
        record.scenarios = Some(scenarios);
        record.result = Some(result);
        record
    }

    #[test]
    fn file_store_round_trips_and_reprices() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileAuditStore::new(dir.path().join("audit"));
        let record = priced_record();
        store.append(&record).unwrap();

        let loaded = FileAuditStore::load(&store.path_for(record.request_id)).unwrap();
        assert_eq!(loaded, record);
        let repriced = price(loaded.scenarios.as_ref().unwrap(), "typhoon", &loaded.params).unwrap();
        assert_eq!(Some(repriced), loaded.result);
    }

    #[test]
    fn file_store_is_append_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileAuditStore::new(dir.path());
        let record = priced_record();
        store.append(&record).unwrap();
        let err = store.append(&record).unwrap_err();
        assert!(matches!(err, AuditError::AlreadyExists { .. }), "{err}");
    }

    #[test]
    fn memory_store_is_append_only() {
        let store = MemoryAuditStore::new();
        let record = priced_record();
        store.append(&record).unwrap();
        assert!(store.append(&record).is_err());
        assert_eq!(store.records().len(), 1);
    }

    #[test]
    fn replay_reproduces_recorded_result() {
        let record = priced_record();
        let outcome = replay(&record, &SimulationConfig::default()).unwrap();
        assert!(outcome.reproduced());
    }

    #[test]
    fn replay_detects_tampering() {
        let mut record = priced_record();
        record.seed = 43;
        let outcome = replay(&record, &SimulationConfig::default()).unwrap();
        assert!(!outcome.scenarios_match);
        assert!(!outcome.reproduced());
    }

    #[test]
    fn replay_needs_artifacts() {
        let cfg = PricingConfig::canonical();
        let record = AuditRecord::open(&Provenance::new("x", 1, 10), &cfg.pricing);
        let err = replay(&record, &cfg.simulation).unwrap_err();
        assert!(matches!(err, PricingError::Audit(AuditError::Incomplete { missing: "canvas" })));
    }

    #[test]
    fn failure_block_carries_kind_and_stage() {
        let cfg = PricingConfig::canonical();
        let record = AuditRecord::open(&Provenance::new("x", 1, 10), &cfg.pricing)
            .with_failure(Stage::Pricing, &crate::error::DegenerateLossError { expected_loss: 0.0 }.into());
        let failure = record.failure.as_ref().unwrap();
        assert_eq!(failure.stage, Stage::Pricing);
        assert_eq!(failure.kind, "degenerate_loss_error");
        assert!(!record.succeeded());
    }
}
