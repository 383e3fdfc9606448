use std::{fs::File, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser, ValueEnum};
use tracing::{info, Level};

#[derive(Parser, Debug, Clone)]
#[command(name = "qbench", about = "Benchmark runner for streaming query engines", version)]
#[command(group(ArgGroup::new("mode").args(["create", "experiment", "verify"]).required(true).multiple(false)))]
pub struct Cli {
    /// Create an experiment manifest template at the given path.
    #[arg(long, value_name = "PATH")]
    pub create: Option<PathBuf>,

    /// Execute the experiment described by the manifest at the given path.
    #[arg(long, value_name = "PATH")]
    pub experiment: Option<PathBuf>,

    /// Check result consistency across the records in the given directory.
    #[arg(long, value_name = "PATH")]
    pub verify: Option<PathBuf>,

    /// Log verbosity.
    #[arg(long = "log-level", value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Write log output to a file instead of standard output.
    #[arg(long = "log-file", value_name = "PATH")]
    pub log_file: Option<PathBuf>,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Info,
    Debug,
}

impl LogLevel {
    fn as_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

/// Construct the one subscriber the whole process logs through. Called
/// exactly once, before any component starts.
pub fn init_logging(level: LogLevel, file: Option<&PathBuf>) -> Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_max_level(level.as_level())
        .with_target(false);
    match file {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            builder.with_ansi(false).with_writer(Arc::new(file)).init();
        }
        None => builder.init(),
    }
    info!("Logging setup finished, logging at {} level", level.as_str());
    Ok(())
}
