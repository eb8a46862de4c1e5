use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ef_fixtures::{AllocDiff, Classification, ExceptionSet, MismatchReport};
use strum::Display;

use super::error::RunnerError;

/// Why a fixture failed.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum FailureKind {
    /// Genesis could not be set up or did not match the fixture.
    SetupError,
    /// A block could not be decoded and the expectation does not allow it.
    DecodeError { expected: Option<ExceptionSet> },
    UnexpectedAcceptance,
    UnexpectedRejection,
    /// Rejected for a mapped reason that is not among the expected ones.
    WrongExceptionReason,
    /// Rejected with a message the client's mapper does not know.
    UnmappedException,
    ProtocolErrorMismatch,
    HeadMismatch,
    StateMismatch,
    Timeout,
    ClientFault,
    /// The fixture breaks its own construction rules.
    FixtureConstruction,
    Cancelled,
}

impl FailureKind {
    /// Whether the client instance can no longer be trusted after this
    /// failure.
    pub fn poisons_client(&self) -> bool {
        matches!(self, Self::Timeout | Self::ClientFault)
    }
}

/// A failed fixture together with everything needed to diagnose it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    /// Index of the block or payload being processed, if any.
    pub block: Option<usize>,
    /// Raw text reported by the client or the runner.
    pub message: Option<String>,
    pub expected: Option<ExceptionSet>,
    pub classification: Option<Classification>,
    pub mismatches: Option<MismatchReport>,
}

impl Failure {
    pub fn new(kind: FailureKind) -> Self {
        Self {
            kind,
            block: None,
            message: None,
            expected: None,
            classification: None,
            mismatches: None,
        }
    }

    #[must_use]
    pub fn at_block(mut self, index: usize) -> Self {
        self.block = Some(index);
        self
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    #[must_use]
    pub fn with_expected(mut self, expected: Option<&ExceptionSet>) -> Self {
        self.expected = expected.cloned();
        self
    }

    #[must_use]
    pub fn with_classification(mut self, classification: Classification) -> Self {
        self.classification = Some(classification);
        self
    }

    #[must_use]
    pub fn with_mismatches(mut self, report: MismatchReport) -> Self {
        self.mismatches = Some(report);
        self
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(block) = self.block {
            write!(f, " at block {block}")?;
        }
        if let Some(expected) = &self.expected {
            write!(f, ", expected {expected}")?;
        }
        if let Some(classification) = &self.classification {
            match classification {
                Classification::Mapped(tag) => write!(f, ", classified as {tag}")?,
                Classification::Unmapped => write!(f, ", unmapped")?,
            }
        }
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(report) = &self.mismatches {
            write!(f, "\n{report}")?;
        }
        Ok(())
    }
}

/// Final judgement on a fixture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail(Box<Failure>),
}

impl Verdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Self::Pass => None,
            Self::Fail(failure) => Some(failure),
        }
    }
}

impl From<Failure> for Verdict {
    fn from(failure: Failure) -> Self {
        Self::Fail(Box::new(failure))
    }
}

impl From<Result<(), Failure>> for Verdict {
    fn from(result: Result<(), Failure>) -> Self {
        match result {
            Ok(()) => Self::Pass,
            Err(failure) => failure.into(),
        }
    }
}

/// The result of running a single fixture.
#[derive(Debug)]
pub struct CaseResult {
    /// Name of the fixture.
    pub name: String,
    /// Path of the file holding the fixture.
    pub path: PathBuf,
    /// The verdict, or the reason the fixture was not run.
    pub result: Result<Verdict, RunnerError>,
    pub duration: Duration,
    /// Changes to the shared pre-state observed after the fixture ran, in
    /// grouped mode.
    pub post_diff: Option<AllocDiff>,
}

impl CaseResult {
    pub fn new(path: &Path, name: &str, result: Result<Verdict, RunnerError>) -> Self {
        Self {
            name: name.to_string(),
            path: path.into(),
            result,
            duration: Duration::ZERO,
            post_diff: None,
        }
    }

    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    #[must_use]
    pub fn with_post_diff(mut self, diff: AllocDiff) -> Self {
        self.post_diff = Some(diff);
        self
    }

    pub fn is_pass(&self) -> bool {
        matches!(&self.result, Ok(verdict) if verdict.is_pass())
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.result, Err(RunnerError::Skipped))
    }
}

/// Pass, fail and skip counts over a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl Tally {
    pub fn from_results(results: &[CaseResult]) -> Self {
        results.iter().fold(Self::default(), |mut tally, result| {
            if result.is_pass() {
                tally.passed += 1;
            } else if result.is_skipped() {
                tally.skipped += 1;
            } else {
                tally.failed += 1;
            }
            tally
        })
    }
}

impl fmt::Display for Tally {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} passed, {} failed, {} skipped",
            self.passed, self.failed, self.skipped
        )
    }
}

/// Logs every failed case at `error` level and the tally at `info` level.
pub fn log_results(results: &[CaseResult]) -> Tally {
    for result in results {
        match &result.result {
            Ok(Verdict::Pass) => {
                tracing::debug!("{}::{} passed in {:?}", result.path.display(), result.name, result.duration);
            }
            Ok(Verdict::Fail(failure)) => {
                tracing::error!("{}::{} failed: {failure}", result.path.display(), result.name);
            }
            Err(RunnerError::Skipped) => {
                tracing::debug!("{}::{} skipped", result.path.display(), result.name);
            }
            Err(err) => {
                tracing::error!("{}::{} could not run: {err}", result.path.display(), result.name);
            }
        }
    }
    let tally = Tally::from_results(results);
    tracing::info!("{tally}");
    tally
}
