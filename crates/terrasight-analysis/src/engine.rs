//! The seam to the external analysis engine.
//!
//! The pipeline never computes terrain attributes itself. Each derivative is
//! handed to an [`AnalysisEngine`], which by default runs a command-line
//! tool and supervises the child process so a timeout can kill it.

use crate::derivative::Derivative;
use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// One derivative to compute: elevation in, product out.
#[derive(Debug, Clone)]
pub struct DerivativeJob {
    pub derivative: Derivative,
    pub input: PathBuf,
    pub output: PathBuf,
    pub contour_interval: f64,
}

/// Best-effort cancellation signal shared between a supervisor and the
/// engine invocation it started.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Computes one derivative product from an elevation raster.
///
/// Implementations should poll `cancel` and give up promptly once it fires;
/// the scheduler stops waiting at the timeout either way. [`CommandEngine`]
/// kills its child process. `job.output` is a private staging path that is
/// only moved onto the artifact when `run` returns `Ok` in time, so an
/// engine that ignores cancellation can leave an orphaned staging file but
/// never clobber a later run's output.
pub trait AnalysisEngine: Send + Sync {
    fn run(&self, job: &DerivativeJob, cancel: &CancelToken) -> Result<(), EngineError>;
}

/// Command templates per derivative name. `{input}`, `{output}`, `{dir}`
/// and `{interval}` are substituted in every argument.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub commands: BTreeMap<String, Vec<String>>,
    /// How often a running child is checked for exit or cancellation.
    pub poll_interval_ms: u64,
}

fn argv(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

impl Default for EngineConfig {
    fn default() -> Self {
        let wbt = |tool: &str, extra: &[&str]| {
            let mut args = argv(&["whitebox_tools", tool, "--wd={dir}", "-i={input}", "-o={output}"]);
            args.extend(argv(extra));
            args
        };
        let mut commands = BTreeMap::new();
        commands.insert("slope".into(), wbt("-r=Slope", &["--units=percent"]));
        commands.insert("aspect".into(), wbt("-r=Aspect", &[]));
        commands.insert(
            "hillshade".into(),
            wbt("-r=Hillshade", &["--azimuth=315.0", "--altitude=45.0"]),
        );
        commands.insert(
            "geomorphons".into(),
            wbt("-r=Geomorphons", &["--search=50", "--threshold=0.0", "--forms"]),
        );
        commands.insert(
            "drainage".into(),
            wbt("-r=D8FlowAccumulation", &["--out_type=cells"]),
        );
        commands.insert(
            "contours".into(),
            argv(&[
                "gdal_contour",
                "-f",
                "GeoJSON",
                "-a",
                "elevation",
                "-i",
                "{interval}",
                "{input}",
                "{output}",
            ]),
        );
        Self {
            commands,
            poll_interval_ms: 100,
        }
    }
}

/// Runs derivatives as child processes built from [`EngineConfig`] templates.
#[derive(Debug, Clone, Default)]
pub struct CommandEngine {
    config: EngineConfig,
}

impl CommandEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Expand the template for `job` into an argument vector.
    pub fn render(&self, job: &DerivativeJob) -> Result<Vec<String>, EngineError> {
        let template = self
            .config
            .commands
            .get(job.derivative.name())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| EngineError::NotConfigured(job.derivative.name().to_string()))?;
        let dir = job
            .output
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let input = job.input.display().to_string();
        let output = job.output.display().to_string();
        let interval = job.contour_interval.to_string();
        Ok(template
            .iter()
            .map(|arg| {
                arg.replace("{input}", &input)
                    .replace("{output}", &output)
                    .replace("{dir}", &dir)
                    .replace("{interval}", &interval)
            })
            .collect())
    }
}

fn log_path(output: &Path) -> PathBuf {
    let mut name = output
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".log");
    output.with_file_name(name)
}

/// Last few lines of the tool's log, for error messages.
fn log_tail(path: &Path) -> String {
    let text = std::fs::read_to_string(path).unwrap_or_default();
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    lines[lines.len().saturating_sub(5)..].join(" | ")
}

impl AnalysisEngine for CommandEngine {
    fn run(&self, job: &DerivativeJob, cancel: &CancelToken) -> Result<(), EngineError> {
        let args = self.render(job)?;
        let program = args[0].clone();
        // Stale output from an earlier run must not count as success.
        if job.output.exists() {
            std::fs::remove_file(&job.output)?;
        }

        // stderr goes to a file so a chatty tool can never block on a full pipe.
        let log = log_path(&job.output);
        let stderr = File::create(&log)?;
        debug!(derivative = %job.derivative, command = %args.join(" "), "starting engine");
        let mut child = Command::new(&program)
            .args(&args[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(stderr)
            .spawn()
            .map_err(|source| EngineError::Spawn {
                program: program.clone(),
                source,
            })?;

        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if cancel.is_cancelled() {
                warn!(derivative = %job.derivative, pid = child.id(), "killing engine process");
                let _ = child.kill();
                let _ = child.wait();
                return Err(EngineError::Cancelled);
            }
            thread::sleep(poll);
        };

        if !status.success() {
            return Err(EngineError::ExitStatus {
                program,
                status: status.to_string(),
                detail: log_tail(&log),
            });
        }
        if !job.output.exists() {
            return Err(EngineError::MissingOutput(job.output.clone()));
        }
        let _ = std::fs::remove_file(&log);
        Ok(())
    }
}
