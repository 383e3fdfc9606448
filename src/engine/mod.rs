//! Query engine executor: process spawning, output streaming, deadlines.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, BufReader},
    process::Command,
    time::{timeout_at, Instant},
};
use tracing::{debug, error};

use crate::{manifest::ExperimentManifest, record::ResultRecord};

/// Environment variable through which the engine receives its config path.
pub const ENGINE_CONFIG_VAR: &str = "ENGINE_CONFIG";

/// Exit codes after which a fired deadline is not classified as a timeout:
/// a clean exit, or the engine's known non-fatal error exit.
const BENIGN_EXIT_CODES: [i32; 2] = [0, 1];

/// Spawns the engine for one query + configuration pair and turns whatever
/// it emits into a [`ResultRecord`].
pub struct QueryEngine {
    bin: PathBuf,
    cwd: PathBuf,
    env: BTreeMap<String, String>,
    context: Option<String>,
}

impl QueryEngine {
    pub fn new(
        bin: PathBuf,
        cwd: PathBuf,
        env: BTreeMap<String, String>,
        context: Option<&Value>,
    ) -> Self {
        Self {
            bin,
            cwd,
            env,
            context: context.map(Value::to_string),
        }
    }

    pub fn from_manifest(manifest: &ExperimentManifest) -> Self {
        Self::new(
            manifest.engine_bin.clone(),
            manifest.engine_cwd.clone(),
            manifest.engine_environment.clone(),
            manifest.engine_context.as_ref(),
        )
    }

    /// Run one query under a deadline and record everything the engine
    /// emitted before completing or being stopped. Failures of the engine
    /// itself are captured into the record, never raised.
    pub async fn query_bindings(
        &self,
        query_id: &str,
        query_string: &str,
        timeout: Duration,
        config_path: &Path,
    ) -> ResultRecord {
        let mut record =
            ResultRecord::new(config_path.display().to_string(), query_id.to_string());

        let mut command = Command::new(&self.bin);
        command.arg("--query").arg(query_string);
        if let Some(context) = &self.context {
            command.arg("--context").arg(context);
        }
        command
            .env_clear()
            .envs(&self.env)
            .env(ENGINE_CONFIG_VAR, config_path)
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                error!("Failed to spawn engine {}: {err}", self.bin.display());
                record.stderr = Some(format!(
                    "failed to spawn engine {}: {err}",
                    self.bin.display()
                ));
                record.seal();
                return record;
            }
        };

        let (Some(stdout), Some(mut stderr)) = (child.stdout.take(), child.stderr.take()) else {
            record.stderr = Some("engine stdio pipes unavailable".into());
            record.seal();
            return record;
        };

        let started = Instant::now();
        let deadline = started + timeout;
        let mut deadline_fired = false;
        let mut lines = BufReader::new(stdout).lines();

        // The deadline is checked at the read suspension point itself, so
        // expiry and the termination request are one visible transition.
        loop {
            match timeout_at(deadline, lines.next_line()).await {
                Err(_) => {
                    debug!("Deadline reached for <{query_id}>, terminating engine");
                    deadline_fired = true;
                    break;
                }
                Ok(Ok(Some(line))) => {
                    let elapsed_ns = started.elapsed().as_nanos() as u64;
                    let line = line.trim();
                    let line = line.strip_suffix(',').unwrap_or(line);
                    let line = line.strip_prefix('[').unwrap_or(line).trim();
                    if line.is_empty() {
                        continue;
                    }
                    if line == "]" {
                        // closing marker: the binding stream is complete
                        break;
                    }
                    if line.starts_with('{') && line.ends_with('}') {
                        match serde_json::from_str::<Value>(line) {
                            Ok(binding) => record.push_binding(elapsed_ns, binding),
                            Err(err) => {
                                debug!("Keeping unparseable line as diagnostic: {err}");
                                record.push_diagnostic(elapsed_ns, line.to_string());
                            }
                        }
                    } else {
                        record.push_diagnostic(elapsed_ns, line.to_string());
                    }
                }
                Ok(Ok(None)) => break,
                Ok(Err(err)) => {
                    let elapsed_ns = started.elapsed().as_nanos() as u64;
                    record.push_diagnostic(elapsed_ns, format!("stdout read error: {err}"));
                    break;
                }
            }
        }

        record.seal();

        // The engine may still be running after the closing marker; stop it
        // unconditionally and re-check the real exit status, since the
        // termination request can race a natural exit.
        if let Err(err) = child.start_kill() {
            debug!("Engine process already gone: {err}");
        }
        let status = match child.wait().await {
            Ok(status) => Some(status),
            Err(err) => {
                error!("Failed to collect engine exit status: {err}");
                None
            }
        };

        let exited_benignly = status
            .and_then(|status| status.code())
            .is_some_and(|code| BENIGN_EXIT_CODES.contains(&code));
        record.timeout = deadline_fired && !exited_benignly;
        if record.timeout {
            error!(
                "Timeout reached after {} seconds for <{query_id}>",
                timeout.as_secs_f64()
            );
        }

        // Drain stderr only now: the pipe reaches EOF once the child is
        // gone, and reading it earlier can block forever. This ordering is
        // a hard requirement, not an optimization.
        let mut stderr_text = String::new();
        if let Err(err) = stderr.read_to_string(&mut stderr_text).await {
            error!("Failed to read engine stderr: {err}");
        }
        record.stderr = Some(stderr_text);

        record
    }
}
