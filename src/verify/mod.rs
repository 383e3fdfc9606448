//! Cross-record consistency checking over a directory of persisted results.
//!
//! This is the one loader that recomputes identity hashes: repetitions of
//! the same query are expected to hash identically, and any divergence
//! flags a nondeterministic engine or setup.

use std::{collections::BTreeMap, fs, path::Path};

use anyhow::{bail, Context, Result};
use owo_colors::OwoColorize;

use crate::record::load_record;

pub fn check_consistency(results_dir: &Path) -> Result<()> {
    println!("Checking consistency in {}", results_dir.display());

    let mut paths: Vec<_> = fs::read_dir(results_dir)
        .with_context(|| format!("failed to read result directory {}", results_dir.display()))?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    let mut expected_hash: BTreeMap<String, String> = BTreeMap::new();
    let mut expected_count: BTreeMap<String, usize> = BTreeMap::new();
    let mut received_counts: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    let mut mismatches = 0usize;

    for path in &paths {
        let record = load_record(path)?;
        if record.timeout {
            // Timed-out runs are partial by definition and prove nothing.
            continue;
        }
        let hash = record.result_hash();
        let count = record.result_count();
        match expected_hash.get(&record.query) {
            None => {
                expected_hash.insert(record.query.clone(), hash);
                expected_count.insert(record.query.clone(), count);
            }
            Some(expected) if *expected != hash => {
                mismatches += 1;
                println!("Different results for <{}>:", record.query.red());
                println!("\tconfig: {}", record.config);
                println!(
                    "\tresults: {} / {}",
                    count,
                    expected_count.get(&record.query).copied().unwrap_or(0)
                );
            }
            Some(_) => {}
        }
        received_counts
            .entry(record.query.clone())
            .or_default()
            .push(count);
    }

    for (query, counts) in &received_counts {
        println!("Result counts for {}: {counts:?}", query.cyan());
    }

    if mismatches > 0 {
        bail!("{mismatches} executions disagree with their first repetition");
    }
    println!("{}", "All repetitions are consistent".green());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{save_record, ResultRecord};
    use serde_json::json;

    fn persisted(dir: &Path, query: &str, bindings: &[serde_json::Value], timeout: bool) {
        let mut record = ResultRecord::new("config.json".into(), query.into());
        for (i, binding) in bindings.iter().enumerate() {
            record.push_binding(i as u64, binding.clone());
        }
        record.seal();
        record.timeout = timeout;
        save_record(dir, &record).unwrap();
    }

    #[test]
    fn test_consistent_directory_passes() {
        let dir = tempfile::tempdir().unwrap();
        persisted(dir.path(), "q#0", &[json!({"a": 1}), json!({"a": 2})], false);
        persisted(dir.path(), "q#0", &[json!({"a": 2}), json!({"a": 1})], false);
        check_consistency(dir.path()).unwrap();
    }

    #[test]
    fn test_mismatching_repetition_fails() {
        let dir = tempfile::tempdir().unwrap();
        persisted(dir.path(), "q#0", &[json!({"a": 1})], false);
        persisted(dir.path(), "q#0", &[json!({"a": 999})], false);
        let err = check_consistency(dir.path()).unwrap_err();
        assert!(err.to_string().contains("disagree"));
    }

    #[test]
    fn test_timed_out_records_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        persisted(dir.path(), "q#0", &[json!({"a": 1})], false);
        // Partial run with different results, but flagged as timed out.
        persisted(dir.path(), "q#0", &[], true);
        check_consistency(dir.path()).unwrap();
    }
}
