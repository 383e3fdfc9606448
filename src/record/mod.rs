//! Result records: one execution's outcome, its identity hash, and persistence.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

/// Second-precision timestamp format used inside persisted documents.
pub const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";
/// Timestamp format used for result file names.
pub const TIME_FORMAT_FILENAME: &str = "%Y%m%dT%H%M%SZ";

/// One parsed result row emitted by the engine, tagged with its arrival
/// offset in nanoseconds since process start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedBinding {
    pub elapsed_ns: u64,
    pub binding: Value,
}

/// One line of engine output that did not parse as a result row, kept
/// verbatim with its arrival offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedLine {
    pub elapsed_ns: u64,
    pub text: String,
}

/// The outcome of a single query execution against a single engine
/// configuration. Created empty when the execution starts, populated while
/// the engine runs, sealed at process exit, enriched with proxied URLs by
/// the runner, then persisted and never mutated again.
///
/// Bindings and diagnostics share one monotonically increasing sequence
/// counter, so their keys give the global arrival order and cannot collide
/// at coarse clock resolution.
#[derive(Debug, Clone)]
pub struct ResultRecord {
    pub config: String,
    pub query: String,
    pub time_begin: DateTime<Utc>,
    pub time_end: DateTime<Utc>,
    pub timeout: bool,
    pub stderr: Option<String>,
    pub urls: Vec<String>,
    results: BTreeMap<u64, TimedBinding>,
    other: BTreeMap<u64, TimedLine>,
    next_seq: u64,
}

impl ResultRecord {
    pub fn new(config: String, query: String) -> Self {
        let now = Utc::now();
        Self {
            config,
            query,
            time_begin: now,
            time_end: now,
            timeout: false,
            stderr: None,
            urls: Vec::new(),
            results: BTreeMap::new(),
            other: BTreeMap::new(),
            next_seq: 0,
        }
    }

    /// Store a parsed result binding under the next sequence number.
    pub fn push_binding(&mut self, elapsed_ns: u64, binding: Value) {
        let seq = self.take_seq();
        self.results.insert(seq, TimedBinding { elapsed_ns, binding });
    }

    /// Store an unparsed line verbatim under the next sequence number.
    pub fn push_diagnostic(&mut self, elapsed_ns: u64, text: String) {
        let seq = self.take_seq();
        self.other.insert(seq, TimedLine { elapsed_ns, text });
    }

    /// Stamp the end of the execution.
    pub fn seal(&mut self) {
        self.time_end = Utc::now();
    }

    pub fn results(&self) -> &BTreeMap<u64, TimedBinding> {
        &self.results
    }

    pub fn other(&self) -> &BTreeMap<u64, TimedLine> {
        &self.other
    }

    pub fn result_count(&self) -> usize {
        self.results.len()
    }

    pub fn result_count_unique(&self) -> usize {
        self.result_values_sorted()
            .into_iter()
            .collect::<BTreeSet<_>>()
            .len()
    }

    pub fn url_count_unique(&self) -> usize {
        self.urls.iter().collect::<BTreeSet<_>>().len()
    }

    pub fn time_taken_seconds(&self) -> f64 {
        (self.time_end - self.time_begin).num_milliseconds() as f64 / 1000.0
    }

    /// Canonical serializations of all binding values, sorted. Key order
    /// inside each binding is normalized by the serializer, so two
    /// executions that produced the same set of rows compare equal here no
    /// matter in which order the rows arrived.
    pub fn result_values_sorted(&self) -> Vec<String> {
        let mut values: Vec<String> = self
            .results
            .values()
            .map(|entry| entry.binding.to_string())
            .collect();
        values.sort();
        values
    }

    /// Content hash identifying the result set independent of arrival order.
    pub fn result_hash(&self) -> String {
        let mut digest = md5::Context::new();
        for value in self.result_values_sorted() {
            digest.consume(value.as_bytes());
        }
        format!("{:x}", digest.compute())
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

/// The exact field set written to disk for one execution. Derived fields
/// are computed once at save time; loading restores the primary fields
/// verbatim and leaves recomputation to the consistency checker.
#[derive(Debug, Serialize, Deserialize)]
struct RecordDocument {
    engine_config: String,
    engine_query: String,
    engine_stderr: Option<String>,
    engine_timeout_reached: bool,
    requested_urls: Vec<String>,
    requested_urls_count: usize,
    requested_urls_count_unique: usize,
    result_count: usize,
    result_count_unique: usize,
    result_data: BTreeMap<u64, TimedBinding>,
    result_data_other: BTreeMap<u64, TimedLine>,
    result_hash: String,
    time_begin: String,
    time_end: String,
    time_taken_seconds: f64,
}

/// Write one record into `dir`, named by its start timestamp. A numeric
/// suffix is appended when several executions start within the same second,
/// so no record ever overwrites another.
pub fn save_record(dir: &Path, record: &ResultRecord) -> Result<PathBuf> {
    let document = RecordDocument {
        engine_config: record.config.clone(),
        engine_query: record.query.clone(),
        engine_stderr: record.stderr.clone(),
        engine_timeout_reached: record.timeout,
        requested_urls: record.urls.clone(),
        requested_urls_count: record.urls.len(),
        requested_urls_count_unique: record.url_count_unique(),
        result_count: record.result_count(),
        result_count_unique: record.result_count_unique(),
        result_data: record.results.clone(),
        result_data_other: record.other.clone(),
        result_hash: record.result_hash(),
        time_begin: record.time_begin.format(TIME_FORMAT).to_string(),
        time_end: record.time_end.format(TIME_FORMAT).to_string(),
        time_taken_seconds: record.time_taken_seconds(),
    };

    let base = record.time_begin.format(TIME_FORMAT_FILENAME).to_string();
    let mut path = dir.join(format!("{base}.json"));
    let mut suffix = 1u32;
    while path.exists() {
        path = dir.join(format!("{base}-{suffix}.json"));
        suffix += 1;
    }

    info!("Serializing result to \"{}\"", path.display());
    // Round-trip through Value so the document lands with sorted keys.
    let value = serde_json::to_value(&document)?;
    fs::write(&path, serde_json::to_string_pretty(&value)?)
        .with_context(|| format!("failed to write result to {}", path.display()))?;
    Ok(path)
}

/// Load a persisted record, restoring every primary field verbatim.
pub fn load_record(path: &Path) -> Result<ResultRecord> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read result from {}", path.display()))?;
    let document: RecordDocument = serde_json::from_str(&text)
        .with_context(|| format!("malformed result document {}", path.display()))?;

    let next_seq = document
        .result_data
        .keys()
        .chain(document.result_data_other.keys())
        .max()
        .map_or(0, |max| max + 1);

    Ok(ResultRecord {
        config: document.engine_config,
        query: document.engine_query,
        time_begin: parse_time(&document.time_begin)?,
        time_end: parse_time(&document.time_end)?,
        timeout: document.engine_timeout_reached,
        stderr: document.engine_stderr,
        urls: document.requested_urls,
        results: document.result_data,
        other: document.result_data_other,
        next_seq,
    })
}

fn parse_time(text: &str) -> Result<DateTime<Utc>> {
    Ok(NaiveDateTime::parse_from_str(text, TIME_FORMAT)
        .with_context(|| format!("invalid timestamp \"{text}\""))?
        .and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record_with(bindings: &[Value]) -> ResultRecord {
        let mut record = ResultRecord::new("config.json".into(), "file:///q.sparql#0".into());
        for (i, binding) in bindings.iter().enumerate() {
            record.push_binding(i as u64 * 1_000, binding.clone());
        }
        record.seal();
        record
    }

    #[test]
    fn test_hash_is_order_independent() {
        let a = json!({"s": "urn:a", "o": 1});
        let b = json!({"s": "urn:b", "o": 2});
        let c = json!({"s": "urn:c", "o": 3});
        let forward = record_with(&[a.clone(), b.clone(), c.clone()]);
        let backward = record_with(&[c, b, a]);
        assert_eq!(forward.result_hash(), backward.result_hash());
    }

    #[test]
    fn test_hash_ignores_key_order_within_binding() {
        // Same object, different key insertion order at the source.
        let first = record_with(&[serde_json::from_str(r#"{"a": 1, "b": 2}"#).unwrap()]);
        let second = record_with(&[serde_json::from_str(r#"{"b": 2, "a": 1}"#).unwrap()]);
        assert_eq!(first.result_hash(), second.result_hash());
    }

    #[test]
    fn test_hash_differs_for_different_results() {
        let first = record_with(&[json!({"a": 1})]);
        let second = record_with(&[json!({"a": 2})]);
        assert_ne!(first.result_hash(), second.result_hash());
    }

    #[test]
    fn test_unique_counts() {
        let record = record_with(&[json!({"a": 1}), json!({"a": 1}), json!({"a": 2})]);
        assert_eq!(record.result_count(), 3);
        assert_eq!(record.result_count_unique(), 2);
    }

    #[test]
    fn test_sequence_keys_are_shared_and_monotonic() {
        let mut record = ResultRecord::new("c".into(), "q".into());
        record.push_binding(10, json!({"a": 1}));
        record.push_diagnostic(10, "warning".into());
        record.push_binding(10, json!({"a": 2}));
        let binding_keys: Vec<u64> = record.results().keys().copied().collect();
        let other_keys: Vec<u64> = record.other().keys().copied().collect();
        assert_eq!(binding_keys, vec![0, 2]);
        assert_eq!(other_keys, vec![1]);
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut record = ResultRecord::new("config.json".into(), "file:///q.sparql#0".into());
        record.push_binding(1_200, json!({"s": "urn:a"}));
        record.push_diagnostic(2_400, "ERROR: out of memory".into());
        record.push_binding(3_600, json!({"s": "urn:b"}));
        record.seal();
        record.stderr = Some("engine warning\n".into());
        record.timeout = true;
        record.urls = vec![
            "http://localhost:3001/data/a".into(),
            "http://localhost:3001/data/a".into(),
            "http://localhost:3001/data/b".into(),
        ];

        let path = save_record(dir.path(), &record).unwrap();
        let loaded = load_record(&path).unwrap();

        assert_eq!(loaded.config, record.config);
        assert_eq!(loaded.query, record.query);
        assert_eq!(loaded.results(), record.results());
        assert_eq!(loaded.other(), record.other());
        assert_eq!(loaded.urls, record.urls);
        assert_eq!(loaded.stderr, record.stderr);
        assert_eq!(loaded.timeout, record.timeout);
        assert_eq!(loaded.result_hash(), record.result_hash());
        assert_eq!(
            loaded.time_begin.format(TIME_FORMAT).to_string(),
            record.time_begin.format(TIME_FORMAT).to_string()
        );
    }

    #[test]
    fn test_save_appends_suffix_instead_of_overwriting() {
        let dir = tempfile::tempdir().unwrap();
        let record = record_with(&[json!({"a": 1})]);
        let first = save_record(dir.path(), &record).unwrap();
        let second = save_record(dir.path(), &record).unwrap();
        assert_ne!(first, second);
        assert!(first.exists() && second.exists());
    }

    #[test]
    fn test_malformed_line_scenario() {
        let mut record = ResultRecord::new("c".into(), "q".into());
        record.push_diagnostic(5_000, "ERROR: out of memory".into());
        record.seal();
        assert_eq!(record.result_count(), 0);
        assert!(record.results().is_empty());
        let entry = record.other().get(&0).unwrap();
        assert_eq!(entry.text, "ERROR: out of memory");
        assert_eq!(entry.elapsed_ns, 5_000);
    }
}
