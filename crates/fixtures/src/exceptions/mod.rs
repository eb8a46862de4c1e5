pub mod mapper;
pub mod taxonomy;

use std::str::FromStr;

pub use mapper::{Classification, ExceptionMapper};
pub use taxonomy::{BlockException, EOFException, ExceptionSet, ExceptionTag, TransactionException};

use crate::error::FixtureError;

/// How an observed rejection is judged against the expected exception set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchPolicy {
    /// The observed message must map to one of the expected tags.
    #[default]
    Strict,
    /// Any rejection satisfies an expected rejection, mapped or not.
    /// `accept_decode_failure` additionally lets a block that cannot be
    /// decoded satisfy any expectation.
    Relaxed { accept_decode_failure: bool },
}

impl MatchPolicy {
    /// Logs a warning when the policy is not strict.
    pub fn warn_if_relaxed(&self, client_id: &str) {
        if let Self::Relaxed {
            accept_decode_failure,
        } = self
        {
            tracing::warn!(
                "Relaxed exception matching enabled for {client_id} (accept decode failures: {accept_decode_failure}), rejection reasons are not verified"
            );
        }
    }

    /// Whether a decode failure satisfies `expected`.
    pub fn admits_decode_failure(&self, expected: &ExceptionSet) -> bool {
        expected.admits_decode_failure()
            || matches!(
                self,
                Self::Relaxed {
                    accept_decode_failure: true
                }
            )
    }
}

impl FromStr for MatchPolicy {
    type Err = FixtureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "relaxed" => Ok(Self::Relaxed {
                accept_decode_failure: false,
            }),
            "relaxed-with-decode" => Ok(Self::Relaxed {
                accept_decode_failure: true,
            }),
            other => Err(FixtureError::Construction(format!(
                "unknown exception matching policy {other}"
            ))),
        }
    }
}

/// Whether an observed rejection satisfies the expected exception set.
pub fn matches(expected: &ExceptionSet, observed: &Classification, policy: MatchPolicy) -> bool {
    match (observed, policy) {
        (Classification::Mapped(tag), _) if expected.contains(tag) => true,
        (_, MatchPolicy::Relaxed { .. }) => true,
        _ => false,
    }
}
