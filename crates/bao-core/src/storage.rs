//! # Measurement Storage
//!
//! The storage collaborator records everything the benchmark learns about a query:
//! its span, the configurations that were tried (with plan hash and plan artifacts),
//! the timing measurements per configuration, and the canonical result fingerprint.
//!
//! ## Trait Design
//!
//! `Storage` is consumed behind `Arc<dyn Storage>` by both the search engine (reads
//! prior measurements) and the orchestrator (writes new ones), so every method takes
//! `&self` and implementations synchronize internally. A relational backend would
//! implement the same trait; `InMemoryStorage` is the implementation used by the
//! driver and the tests, and it can persist itself as a JSON snapshot between runs.
//!
//! ## Duplicate Plans
//!
//! `register_query_config` reports whether another configuration of the same query
//! already produced the same plan hash. Such configurations are marked
//! `duplicated_plan` and are hidden from `get_measurements` unless they disable a
//! single item, which keeps the DP search from counting one physical plan twice.

use crate::config::Configuration;
use crate::fingerprint::Fingerprint;
use crate::span::QuerySpan;
use crate::stats::{PlanArtifacts, PlanHash};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("query {0} is not registered")]
    UnknownQuery(String),
    #[error("configuration {configuration} is not registered for query {query_path}")]
    UnknownConfiguration {
        query_path: String,
        configuration: Configuration,
    },
    #[error("storage snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage snapshot is malformed: {0}")]
    Snapshot(#[from] serde_json::Error),
}

/// One timed execution of a query under a configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub elapsed: f64,
    pub planning: f64,
    pub scheduling: f64,
    pub running: f64,
    pub finishing: f64,
    pub cpu: f64,
    pub input_data_size: f64,
    /// Worker nodes that participated, as reported by the client-side query stats.
    pub nodes: u64,
    pub plan_hash: PlanHash,
    pub time: DateTime<Utc>,
    /// The result fingerprint did not match the query's canonical fingerprint.
    pub fingerprint_diverged: bool,
}

impl Measurement {
    pub fn total_runtime(&self) -> f64 {
        self.running + self.finishing
    }
}

/// A measurement as seen by the search engine.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementRow {
    pub total_runtime: f64,
    pub configuration: Configuration,
    pub time: DateTime<Utc>,
    pub num_disabled: usize,
}

pub trait Storage: Send + Sync {
    /// Register a query. Registering twice is a no-op.
    fn register_query(&self, query_path: &str) -> Result<(), StorageError>;

    fn register_query_span(&self, query_path: &str, span: &QuerySpan) -> Result<(), StorageError>;

    fn get_query_span(&self, query_path: &str) -> Result<Option<QuerySpan>, StorageError>;

    /// Measurements usable by the search, ordered by time.
    fn get_measurements(&self, query_path: &str) -> Result<Vec<MeasurementRow>, StorageError>;

    fn register_measurement(
        &self,
        query_path: &str,
        configuration: &Configuration,
        measurement: Measurement,
    ) -> Result<(), StorageError>;

    /// Record the configuration with its plan. Returns `true` when a *different*
    /// configuration of this query already produced the same plan hash. Registering a
    /// configuration again returns the verdict of its first registration.
    fn register_query_config(
        &self,
        query_path: &str,
        configuration: &Configuration,
        plans: &PlanArtifacts,
        plan_hash: PlanHash,
    ) -> Result<bool, StorageError>;

    /// The first fingerprint becomes canonical. Returns `false` on mismatch.
    fn register_query_fingerprint(
        &self,
        query_path: &str,
        fingerprint: Fingerprint,
    ) -> Result<bool, StorageError>;

    fn check_existing_measurement(
        &self,
        query_path: &str,
        configuration: &Configuration,
    ) -> Result<bool, StorageError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ConfigRecord {
    configuration: Configuration,
    plan_hash: PlanHash,
    plans: PlanArtifacts,
    duplicated_plan: bool,
    measurements: Vec<Measurement>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct QueryRecord {
    span: Option<QuerySpan>,
    fingerprint: Option<Fingerprint>,
    /// Keyed by the configuration's joined key (`""` for the baseline).
    configs: BTreeMap<String, ConfigRecord>,
}

/// Process-local storage, optionally persisted as a JSON snapshot.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    queries: RwLock<BTreeMap<String, QueryRecord>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a snapshot written by [`InMemoryStorage::save`]. A missing file yields an
    /// empty store.
    pub fn load(path: &Path) -> Result<Self, StorageError> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let raw = std::fs::read_to_string(path)?;
        let queries: BTreeMap<String, QueryRecord> = serde_json::from_str(&raw)?;
        Ok(Self {
            queries: RwLock::new(queries),
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), StorageError> {
        let raw = serde_json::to_string_pretty(&*self.queries.read())?;
        std::fs::write(path, raw)?;
        Ok(())
    }

    /// All measurements of one configuration, duplicates included.
    pub fn measurements_for(&self, query_path: &str, configuration: &Configuration) -> Vec<Measurement> {
        self.queries
            .read()
            .get(query_path)
            .and_then(|q| q.configs.get(&configuration.joined()))
            .map(|c| c.measurements.clone())
            .unwrap_or_default()
    }

    /// Every configuration registered for a query, with its duplicate flag.
    pub fn configurations(&self, query_path: &str) -> Vec<(Configuration, bool)> {
        self.queries
            .read()
            .get(query_path)
            .map(|q| {
                q.configs
                    .values()
                    .map(|c| (c.configuration.clone(), c.duplicated_plan))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn plans_for(&self, query_path: &str, configuration: &Configuration) -> Option<PlanArtifacts> {
        self.queries
            .read()
            .get(query_path)
            .and_then(|q| q.configs.get(&configuration.joined()))
            .map(|c| c.plans.clone())
    }
}

impl Storage for InMemoryStorage {
    fn register_query(&self, query_path: &str) -> Result<(), StorageError> {
        self.queries.write().entry(query_path.to_string()).or_default();
        Ok(())
    }

    fn register_query_span(&self, query_path: &str, span: &QuerySpan) -> Result<(), StorageError> {
        let mut queries = self.queries.write();
        let record = queries
            .get_mut(query_path)
            .ok_or_else(|| StorageError::UnknownQuery(query_path.to_string()))?;
        record.span = Some(span.clone());
        Ok(())
    }

    fn get_query_span(&self, query_path: &str) -> Result<Option<QuerySpan>, StorageError> {
        Ok(self.queries.read().get(query_path).and_then(|q| q.span.clone()))
    }

    fn get_measurements(&self, query_path: &str) -> Result<Vec<MeasurementRow>, StorageError> {
        let queries = self.queries.read();
        let Some(record) = queries.get(query_path) else {
            return Ok(Vec::new());
        };
        let mut rows: Vec<MeasurementRow> = record
            .configs
            .values()
            .filter(|c| c.configuration.len() == 1 || !c.duplicated_plan)
            .flat_map(|c| {
                c.measurements.iter().map(move |m| MeasurementRow {
                    total_runtime: m.total_runtime(),
                    configuration: c.configuration.clone(),
                    time: m.time,
                    num_disabled: c.configuration.len(),
                })
            })
            .collect();
        rows.sort_by_key(|row| row.time);
        Ok(rows)
    }

    fn register_measurement(
        &self,
        query_path: &str,
        configuration: &Configuration,
        measurement: Measurement,
    ) -> Result<(), StorageError> {
        let mut queries = self.queries.write();
        let record = queries
            .get_mut(query_path)
            .ok_or_else(|| StorageError::UnknownQuery(query_path.to_string()))?;
        let config = record.configs.get_mut(&configuration.joined()).ok_or_else(|| {
            StorageError::UnknownConfiguration {
                query_path: query_path.to_string(),
                configuration: configuration.clone(),
            }
        })?;
        config.measurements.push(measurement);
        Ok(())
    }

    fn register_query_config(
        &self,
        query_path: &str,
        configuration: &Configuration,
        plans: &PlanArtifacts,
        plan_hash: PlanHash,
    ) -> Result<bool, StorageError> {
        let mut queries = self.queries.write();
        let record = queries
            .get_mut(query_path)
            .ok_or_else(|| StorageError::UnknownQuery(query_path.to_string()))?;
        let key = configuration.joined();
        // the first registration of a configuration decides its duplicate status
        if let Some(existing) = record.configs.get(&key) {
            return Ok(existing.duplicated_plan);
        }
        let is_duplicate = record.configs.values().any(|c| c.plan_hash == plan_hash);
        record.configs.insert(
            key,
            ConfigRecord {
                configuration: configuration.clone(),
                plan_hash,
                plans: plans.clone(),
                duplicated_plan: is_duplicate,
                measurements: Vec::new(),
            },
        );
        Ok(is_duplicate)
    }

    fn register_query_fingerprint(
        &self,
        query_path: &str,
        fingerprint: Fingerprint,
    ) -> Result<bool, StorageError> {
        let mut queries = self.queries.write();
        let record = queries
            .get_mut(query_path)
            .ok_or_else(|| StorageError::UnknownQuery(query_path.to_string()))?;
        match record.fingerprint {
            None => {
                record.fingerprint = Some(fingerprint);
                Ok(true)
            }
            Some(canonical) => Ok(canonical == fingerprint),
        }
    }

    fn check_existing_measurement(
        &self,
        query_path: &str,
        configuration: &Configuration,
    ) -> Result<bool, StorageError> {
        Ok(self
            .queries
            .read()
            .get(query_path)
            .and_then(|q| q.configs.get(&configuration.joined()))
            .is_some_and(|c| !c.measurements.is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const Q: &str = "queries/tpch/1.sql";

    fn measurement(running: f64, plan_hash: PlanHash, offset_secs: i64) -> Measurement {
        Measurement {
            elapsed: running + 10.0,
            planning: 5.0,
            scheduling: 5.0,
            running,
            finishing: 0.0,
            cpu: running,
            input_data_size: 1024.0,
            nodes: 1,
            plan_hash,
            time: DateTime::<Utc>::UNIX_EPOCH + Duration::seconds(offset_secs),
            fingerprint_diverged: false,
        }
    }

    #[test]
    fn test_duplicate_plan_detection() {
        let storage = InMemoryStorage::new();
        storage.register_query(Q).unwrap();
        let plans = PlanArtifacts::default();

        let baseline = Configuration::baseline();
        let a = Configuration::from_names(["A"]);
        let b = Configuration::from_names(["B"]);

        assert!(!storage.register_query_config(Q, &baseline, &plans, 1).unwrap());
        assert!(!storage.register_query_config(Q, &a, &plans, 2).unwrap());
        // same configuration again is not a duplicate of itself
        assert!(!storage.register_query_config(Q, &a, &plans, 2).unwrap());
        assert!(storage.register_query_config(Q, &b, &plans, 1).unwrap());
        // the plan owner stays canonical when it is registered again
        assert!(!storage.register_query_config(Q, &baseline, &plans, 1).unwrap());
        assert!(storage.register_query_config(Q, &b, &plans, 1).unwrap());
    }

    #[test]
    fn test_measurements_require_registered_config() {
        let storage = InMemoryStorage::new();
        storage.register_query(Q).unwrap();
        let a = Configuration::from_names(["A"]);
        let err = storage.register_measurement(Q, &a, measurement(1.0, 1, 0)).unwrap_err();
        assert!(matches!(err, StorageError::UnknownConfiguration { .. }));

        assert!(!storage.check_existing_measurement(Q, &a).unwrap());
        storage.register_query_config(Q, &a, &PlanArtifacts::default(), 1).unwrap();
        assert!(!storage.check_existing_measurement(Q, &a).unwrap());
        storage.register_measurement(Q, &a, measurement(1.0, 1, 0)).unwrap();
        assert!(storage.check_existing_measurement(Q, &a).unwrap());
    }

    #[test]
    fn test_get_measurements_hides_duplicated_multi_item_configs() {
        let storage = InMemoryStorage::new();
        storage.register_query(Q).unwrap();
        let plans = PlanArtifacts::default();
        let baseline = Configuration::baseline();
        let a = Configuration::from_names(["A"]);
        let b = Configuration::from_names(["B"]);
        let ab = Configuration::from_names(["A", "B"]);

        storage.register_query_config(Q, &baseline, &plans, 1).unwrap();
        storage.register_query_config(Q, &a, &plans, 1).unwrap();
        storage.register_query_config(Q, &b, &plans, 2).unwrap();
        storage.register_query_config(Q, &ab, &plans, 2).unwrap();
        storage.register_measurement(Q, &ab, measurement(7.0, 2, 3)).unwrap();
        storage.register_measurement(Q, &a, measurement(5.0, 1, 2)).unwrap();
        storage.register_measurement(Q, &baseline, measurement(10.0, 1, 1)).unwrap();

        let rows = storage.get_measurements(Q).unwrap();
        let seen: Vec<_> = rows.iter().map(|r| (r.configuration.joined(), r.total_runtime)).collect();
        // ordered by time; {A,B} is a duplicated multi-item plan and is hidden
        assert_eq!(seen, vec![("".to_string(), 10.0), ("A".to_string(), 5.0)]);
        assert_eq!(rows[1].num_disabled, 1);
    }

    #[test]
    fn test_first_fingerprint_is_canonical() {
        let storage = InMemoryStorage::new();
        storage.register_query(Q).unwrap();
        assert!(storage.register_query_fingerprint(Q, Fingerprint([1; 16])).unwrap());
        assert!(storage.register_query_fingerprint(Q, Fingerprint([1; 16])).unwrap());
        assert!(!storage.register_query_fingerprint(Q, Fingerprint([2; 16])).unwrap());
        assert!(storage.register_query_fingerprint(Q, Fingerprint([1; 16])).unwrap());
    }

    #[test]
    fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        let storage = InMemoryStorage::new();
        storage.register_query(Q).unwrap();
        let span = QuerySpan {
            effective_rules: vec!["R".into()],
            ..Default::default()
        };
        storage.register_query_span(Q, &span).unwrap();
        let a = Configuration::from_names(["A"]);
        storage.register_query_config(Q, &a, &PlanArtifacts::default(), 3).unwrap();
        storage.register_measurement(Q, &a, measurement(4.0, 3, 0)).unwrap();
        storage.save(&path).unwrap();

        let restored = InMemoryStorage::load(&path).unwrap();
        assert_eq!(restored.get_query_span(Q).unwrap(), Some(span));
        assert!(restored.check_existing_measurement(Q, &a).unwrap());
        assert_eq!(restored.measurements_for(Q, &a).len(), 1);

        let missing = InMemoryStorage::load(&dir.path().join("absent.json")).unwrap();
        assert!(missing.get_measurements(Q).unwrap().is_empty());
    }
}
