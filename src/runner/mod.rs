//! Experiment orchestration: the sequential config × query × replication loop.

use std::{
    fs,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::{
    engine::QueryEngine,
    manifest::ExperimentManifest,
    proxy::ProxyServer,
    record::save_record,
};

/// Drives one whole experiment: starts the proxy once, walks the execution
/// matrix strictly sequentially, brackets every execution with a proxy
/// capture window, and persists each record before the next one starts.
pub struct ExperimentRunner {
    manifest: ExperimentManifest,
    queries: Vec<(String, String)>,
    proxy: ProxyServer,
    engine: QueryEngine,
    interrupted: Arc<AtomicBool>,
}

impl ExperimentRunner {
    pub fn new(manifest: ExperimentManifest) -> Result<Self> {
        let queries = manifest.load_query_strings()?;
        let proxy = ProxyServer::new(
            &manifest.proxy_host,
            manifest.proxy_port,
            &manifest.proxy_upstream_host,
            manifest.proxy_upstream_port,
        );
        let engine = QueryEngine::from_manifest(&manifest);
        Ok(Self {
            manifest,
            queries,
            proxy,
            engine,
            interrupted: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Total executions and the worst-case duration, reported up front so
    /// the operator knows what was scheduled.
    fn report_execution_plan(&self) -> u64 {
        let total = self.queries.len() as u64
            * self.manifest.configs.len() as u64
            * u64::from(self.manifest.replication);
        info!("Executing a total of {total} experiments");
        let seconds = self.manifest.engine_timeout_seconds.saturating_mul(total);
        let (days, remainder) = (seconds / 86_400, seconds % 86_400);
        let (hours, remainder) = (remainder / 3_600, remainder % 3_600);
        let (minutes, seconds) = (remainder / 60, remainder % 60);
        info!("Maximum duration {days} days {hours} hours {minutes} minutes {seconds} seconds");
        total
    }

    pub async fn execute(&mut self) -> Result<()> {
        fs::create_dir_all(&self.manifest.results).with_context(|| {
            format!(
                "failed to create result directory {}",
                self.manifest.results.display()
            )
        })?;

        let interrupted = Arc::clone(&self.interrupted);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted by user, will stop after the current execution");
                interrupted.store(true, Ordering::SeqCst);
            }
        });

        self.proxy.start().await?;
        let outcome = self.run_matrix().await;
        self.proxy.stop().await;
        outcome
    }

    async fn run_matrix(&self) -> Result<()> {
        let total = self.report_execution_plan();
        let timeout = Duration::from_secs(self.manifest.engine_timeout_seconds);
        let mut done: u64 = 0;

        'matrix: for config_path in &self.manifest.configs {
            info!("Execute with config <file://{}>", config_path.display());
            for (query_id, query_string) in &self.queries {
                for _ in 0..self.manifest.replication {
                    // Interruption is only honored between executions; an
                    // in-flight execution always runs to completion.
                    if self.interrupted.load(Ordering::SeqCst) {
                        info!("Skipping remaining executions");
                        break 'matrix;
                    }
                    info!("Query {} / {total} <{query_id}>", done + 1);

                    let mut record = self
                        .engine
                        .query_bindings(query_id, query_string, timeout, config_path)
                        .await;
                    // Consume the capture window for exactly this execution
                    // before anything else may talk through the proxy.
                    record.urls = self.proxy.reset();
                    info!(
                        "Finished with {} results and {} requests",
                        record.result_count(),
                        record.urls.len()
                    );
                    save_record(&self.manifest.results, &record)?;
                    done += 1;
                }
            }
        }
        info!("Finished {done} / {total} executions");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::load_record;
    use std::{
        collections::BTreeSet,
        path::{Path, PathBuf},
    };
    use tokio::net::TcpListener;

    fn script_engine(dir: &Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("engine.sh");
        let body = concat!(
            "#!/bin/sh\n",
            "printf '[\\n'\n",
            "printf '{\"s\": \"urn:a\", \"o\": 1},\\n'\n",
            "printf '{\"s\": \"urn:b\", \"o\": 2},\\n'\n",
            "printf '{\"s\": \"urn:c\", \"o\": 3}\\n'\n",
            "printf ']\\n'\n",
        );
        fs::write(&path, body).unwrap();
        let mut permissions = fs::metadata(&path).unwrap().permissions();
        permissions.set_mode(0o755);
        fs::set_permissions(&path, permissions).unwrap();
        path
    }

    async fn free_port() -> u16 {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);
        port
    }

    /// The deterministic-engine scenario: 1 config × 1 query × replication 2
    /// must yield two records with three bindings each, identical identity
    /// hashes, no timeout, and no cross-run URL contamination.
    #[tokio::test]
    async fn test_scenario_one_config_one_query_two_repetitions() {
        let dir = tempfile::tempdir().unwrap();
        let engine_bin = script_engine(dir.path());
        let query_path = dir.path().join("queries.sparql");
        let config_path = dir.path().join("config.json");
        let results_dir = dir.path().join("results");
        fs::write(&query_path, "SELECT * WHERE { ?s ?p ?o }").unwrap();
        fs::write(&config_path, "{}").unwrap();

        let manifest = ExperimentManifest {
            queries: vec![query_path],
            configs: vec![config_path],
            replication: 2,
            results: results_dir.clone(),
            proxy_host: "127.0.0.1".into(),
            proxy_port: free_port().await,
            proxy_upstream_host: "127.0.0.1".into(),
            proxy_upstream_port: free_port().await,
            engine_bin,
            engine_cwd: dir.path().to_path_buf(),
            engine_timeout_seconds: 10,
            engine_environment: std::collections::BTreeMap::new(),
            engine_context: None,
        };

        let mut runner = ExperimentRunner::new(manifest).unwrap();
        runner.execute().await.unwrap();

        let mut records = Vec::new();
        for entry in fs::read_dir(&results_dir).unwrap() {
            records.push(load_record(&entry.unwrap().path()).unwrap());
        }
        assert_eq!(records.len(), 2);
        for record in &records {
            assert_eq!(record.result_count(), 3);
            assert!(!record.timeout);
            assert!(record.urls.is_empty());
        }
        let hashes: BTreeSet<String> =
            records.iter().map(|record| record.result_hash()).collect();
        assert_eq!(hashes.len(), 1, "deterministic engine must hash identically");
    }
}
