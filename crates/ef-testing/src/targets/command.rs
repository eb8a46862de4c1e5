//! Runs whole fixture files through a client's own `blocktest` command.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::models::error::RunnerError;
use crate::models::result::{Failure, FailureKind, Verdict};

lazy_static! {
    /// Failure texts printed by client `blocktest` commands, first match wins.
    static ref FAILURE_PATTERNS: Vec<(Regex, FailureKind)> = [
        (r"(?i)genesis", FailureKind::SetupError),
        (r"(?i)post state (root )?mismatch|state root mismatch|post-state", FailureKind::StateMismatch),
        (r"(?i)last ?block ?hash|head (block )?mismatch", FailureKind::HeadMismatch),
        (r"(?i)expected (block )?(import )?(failure|to fail|invalid)|should have failed|imported successfully", FailureKind::UnexpectedAcceptance),
        (r"(?i)\brlp\b|decode", FailureKind::DecodeError { expected: None }),
    ]
    .into_iter()
    .filter_map(|(pattern, kind)| Regex::new(pattern).ok().map(|re| (re, kind)))
    .collect();
}

/// One entry of the JSON array printed by `blocktest`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BlocktestOutcome {
    pub name: String,
    pub pass: bool,
    #[serde(default)]
    pub fork: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl BlocktestOutcome {
    pub fn verdict(&self) -> Verdict {
        if self.pass {
            return Verdict::Pass;
        }
        let message = self.error.clone().unwrap_or_default();
        let kind = FAILURE_PATTERNS
            .iter()
            .find(|(re, _)| re.is_match(&message))
            .map_or(FailureKind::UnexpectedRejection, |(_, kind)| kind.clone());
        Failure::new(kind).with_message(message).into()
    }
}

/// Invokes `<binary> blocktest <fixture file>`.
#[derive(Debug, Clone)]
pub struct BlocktestCommand {
    binary: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl BlocktestCommand {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            args: vec!["blocktest".to_string()],
            timeout,
        }
    }

    /// Runs every fixture of `path` and returns the verdict per fixture name.
    pub async fn run_file(&self, path: &Path) -> Result<BTreeMap<String, Verdict>, RunnerError> {
        let io_error = |error: std::io::Error| RunnerError::Io {
            path: self.binary.clone(),
            error: error.to_string(),
        };
        let child = Command::new(&self.binary)
            .args(&self.args)
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(io_error)?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                RunnerError::Other(format!(
                    "{} timed out after {:?}",
                    self.binary.display(),
                    self.timeout
                ))
            })?
            .map_err(io_error)?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let outcomes = match parse_outcomes(&stdout) {
            Some(outcomes) => outcomes,
            None => {
                return Err(RunnerError::ToolFailure {
                    tool: self.binary.display().to_string(),
                    status: output.status.to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                })
            }
        };
        if !output.status.success() {
            // Clients exit non-zero when any fixture fails; the report still
            // tells which.
            debug!("{} exited with {}", self.binary.display(), output.status);
        }
        Ok(outcomes
            .into_iter()
            .map(|outcome| (outcome.name.clone(), outcome.verdict()))
            .collect())
    }
}

/// Finds the JSON result array in the command output, which may be
/// surrounded by log lines.
fn parse_outcomes(stdout: &str) -> Option<Vec<BlocktestOutcome>> {
    let end = stdout.rfind(']')?;
    let parsed = stdout
        .match_indices('[')
        .map(|(start, _)| start)
        .take_while(|&start| start < end)
        .find_map(|start| serde_json::from_str(&stdout[start..=end]).ok());
    if parsed.is_none() {
        warn!("no blocktest report found in output");
    }
    parsed
}
