//! Experiment manifests: creation, loading, eager validation, query loading.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

/// The declarative description of one experiment. Loaded once, validated
/// eagerly, and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentManifest {
    /// Query source files; each may hold several queries.
    pub queries: Vec<PathBuf>,
    /// Engine configuration files, one execution matrix column each.
    pub configs: Vec<PathBuf>,
    /// How often every (config, query) pair is repeated.
    pub replication: u32,
    /// Directory receiving one result document per execution.
    pub results: PathBuf,
    pub proxy_host: String,
    pub proxy_port: u16,
    pub proxy_upstream_host: String,
    pub proxy_upstream_port: u16,
    pub engine_bin: PathBuf,
    pub engine_cwd: PathBuf,
    pub engine_timeout_seconds: u64,
    #[serde(default)]
    pub engine_environment: BTreeMap<String, String>,
    /// Optional context blob passed to the engine as a JSON argument.
    #[serde(default)]
    pub engine_context: Option<Value>,
}

impl ExperimentManifest {
    /// Write a manifest template with explicit defaults. Refuses to clobber
    /// an existing file.
    pub fn create(path: &Path) -> Result<()> {
        if path.exists() {
            bail!("manifest already exists at {}", path.display());
        }
        info!("Creating manifest at \"{}\"", path.display());
        let cwd = std::env::current_dir().context("failed to resolve working directory")?;
        let manifest = Self {
            queries: Vec::new(),
            configs: Vec::new(),
            replication: 3,
            results: cwd.join("results"),
            proxy_host: "localhost".into(),
            proxy_port: 3000,
            proxy_upstream_host: "localhost".into(),
            proxy_upstream_port: 3001,
            engine_bin: cwd.join("bin").join("query"),
            engine_cwd: cwd.clone(),
            engine_timeout_seconds: 60,
            engine_environment: BTreeMap::from([(
                "NODE_OPTIONS".to_string(),
                "--max-old-space-size=8192".to_string(),
            )]),
            engine_context: Some(serde_json::json!({ "sources": [], "lenient": true })),
        };
        let value = serde_json::to_value(&manifest)?;
        fs::write(path, serde_json::to_string_pretty(&value)?)
            .with_context(|| format!("failed to write manifest to {}", path.display()))?;
        Ok(())
    }

    /// Load and validate a manifest. Every problem found here is fatal and
    /// reported before any execution starts.
    pub fn load(path: &Path) -> Result<Self> {
        info!("Loading experiment from \"{}\"", path.display());
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read manifest {}", path.display()))?;
        let manifest: Self = serde_json::from_str(&text)
            .with_context(|| format!("malformed manifest {}", path.display()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<()> {
        if self.queries.is_empty() {
            bail!("manifest lists no query files");
        }
        if self.configs.is_empty() {
            bail!("manifest lists no engine configurations");
        }
        if self.replication == 0 {
            bail!("replication must be at least 1");
        }
        if self.engine_timeout_seconds == 0 {
            bail!("engine timeout must be at least 1 second");
        }
        for path in self.queries.iter().chain(self.configs.iter()) {
            if !path.is_file() {
                bail!("manifest references missing file {}", path.display());
            }
        }
        if !self.engine_bin.is_file() {
            bail!("engine binary not found at {}", self.engine_bin.display());
        }
        if !self.engine_cwd.is_dir() {
            bail!(
                "engine working directory not found at {}",
                self.engine_cwd.display()
            );
        }
        Ok(())
    }

    /// Read all query files and split them into individual query strings.
    /// Files may hold several queries separated by a blank line followed by
    /// `PREFIX`; each query gets the id `file://<path>#<index>`.
    pub fn load_query_strings(&self) -> Result<Vec<(String, String)>> {
        let mut output = Vec::new();
        for path in &self.queries {
            info!("Loading queries from \"{}\"", path.display());
            let resolved = fs::canonicalize(path).unwrap_or_else(|_| path.clone());
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read query file {}", path.display()))?;
            for (index, part) in text.split("\n\nPREFIX").enumerate() {
                let query_string = if index > 0 {
                    format!("PREFIX{part}")
                } else {
                    part.to_string()
                };
                let query_id = format!("file://{}#{index}", resolved.display());
                output.push((query_id, query_string.trim().to_string()));
            }
        }
        info!("Loaded {} queries", output.len());
        Ok(output)
    }
}
